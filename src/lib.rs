pub mod adapters;
pub mod config;
pub mod error;
pub mod geocode;
pub mod logging;
pub mod normalize;
pub mod scheduler;
pub mod store;
pub mod translation;
pub mod types;
