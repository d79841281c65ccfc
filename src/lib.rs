pub mod agents;
pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod resolver;
pub mod snapshot;
