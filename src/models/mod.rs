pub mod cpe;
pub mod cve;
pub mod feed;
