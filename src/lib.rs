pub mod audit;
pub mod config;
pub mod error;
pub mod server;

pub use error::AuditError;
