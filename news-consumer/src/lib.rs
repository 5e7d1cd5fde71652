pub mod broker;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod worker;
