pub mod agent;
pub mod cache;
pub mod config;
pub mod sample;
pub mod sink;
pub mod source;
