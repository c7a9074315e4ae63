pub mod api;
pub mod config;
pub mod datasource;
pub mod db;
pub mod files;
pub mod jobs;
pub mod limiter;
pub mod processor;
pub mod provider;
pub mod scheduler;
pub mod sender;
pub mod store;
pub mod telemetry;
pub mod template;
