pub mod fanout;
pub mod ingest;

pub use fanout::{FanoutSettings, ViewerFeed, ViewerHub};
pub use ingest::{IngestPipeline, IngestReceipt};
