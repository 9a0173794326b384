pub mod config;
pub mod database;
pub mod retry_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use retry_repository::PgRetryRepository;
