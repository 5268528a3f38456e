// Dependency-aware scheduler for recurring data-migration jobs

pub mod config;
pub mod dependency;
pub mod errors;
pub mod models;
pub mod notification;
pub mod retry;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod worker;
