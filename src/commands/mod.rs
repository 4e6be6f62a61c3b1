pub mod ingest;
pub mod register;
pub mod status;
