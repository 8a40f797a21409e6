pub mod config;
pub mod error;
pub mod listing;
pub mod paths;
pub mod routes;
pub mod state;
pub mod streaming;
