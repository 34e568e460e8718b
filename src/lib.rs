pub mod app;
pub mod config;
pub mod messages;
pub mod stage;
