pub mod feed_sync;
pub mod logger;
pub mod xml_stream;
