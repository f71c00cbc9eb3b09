pub mod ingestion;
pub mod job;
pub mod server;
pub mod transport;
pub mod worker;
