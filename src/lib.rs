pub mod application;
pub mod config;
pub mod domain;
pub mod messaging;
pub mod metrics;
pub mod notification;
pub mod persistence;
pub mod utils;
