pub mod cli;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod exchange;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod observability;
pub mod orders;
pub mod paper;
pub mod price_feed;
pub mod registry;
pub mod resilience;
pub mod scheduler;
pub mod trade;
pub mod types;
