pub mod api;
pub mod config;
pub mod listing;
pub mod models;
pub mod services;
pub mod status;
pub mod store;
pub mod terminal;
