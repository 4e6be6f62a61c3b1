use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Extracting,
    Parsing,
    Chunking,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Extracting => "EXTRACTING",
            Self::Parsing => "PARSING",
            Self::Chunking => "CHUNKING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "EXTRACTING" => Some(Self::Extracting),
            "PARSING" => Some(Self::Parsing),
            "CHUNKING" => Some(Self::Chunking),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// A run owns the document while it sits in one of these states.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Extracting | Self::Parsing | Self::Chunking)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub doc_id: String,
    pub filename: String,
    pub storage_location: String,
    pub sha256: String,
    pub status: ProcessingStatus,
    pub error_message: Option<String>,
    pub total_pages: i64,
    pub total_sections: i64,
    pub total_chunks: i64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkType {
    SectionHeader,
    Measurement,
    Payment,
    MaterialSpec,
    Procedure,
    Definition,
    Requirement,
}

impl ChunkType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChunkType::SectionHeader => "SECTION_HEADER",
            ChunkType::Measurement => "MEASUREMENT",
            ChunkType::Payment => "PAYMENT",
            ChunkType::MaterialSpec => "MATERIAL_SPEC",
            ChunkType::Procedure => "PROCEDURE",
            ChunkType::Definition => "DEFINITION",
            ChunkType::Requirement => "REQUIREMENT",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StructureCounts {
    pub divisions: i64,
    pub sections: i64,
    pub subsections: i64,
    pub chunks: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub doc_id: String,
    pub status: ProcessingStatus,
    pub short_circuited: bool,
    pub total_pages: i64,
    pub counts: StructureCounts,
    pub error: Option<String>,
}

impl IngestOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == ProcessingStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestPaths {
    pub cache_root: String,
    pub db_path: String,
    pub grammar_path: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub db_schema_version: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub command: String,
    pub backends: Vec<String>,
    pub paths: IngestPaths,
    pub outcome: IngestOutcome,
}
