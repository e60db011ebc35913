pub mod cpe_repo;
pub mod cve_repo;
pub mod freshness_repo;
