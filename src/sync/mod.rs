pub mod backfill;
pub mod engine;
pub mod ingest;
pub mod oracle;
pub mod retry;
pub mod watermark;
