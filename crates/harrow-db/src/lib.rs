pub mod config;
pub mod database;
pub mod proxy_repository;
pub mod record_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use proxy_repository::ProxyRepository;
pub use record_repository::RecordRepository;
