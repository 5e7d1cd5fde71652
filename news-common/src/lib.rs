pub mod health;
pub mod message;
pub mod metrics;
pub mod retry;
