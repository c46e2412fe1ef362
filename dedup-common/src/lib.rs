pub mod classify;
pub mod execution;
pub mod health;
pub mod messages;
pub mod metrics;
