pub mod connection;
pub mod cpe_db;
pub mod cve_db;
pub mod guard;
pub mod mirror;
pub mod schema;
pub mod store;
