pub mod config;
pub mod database;
pub mod health;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod responses;
pub mod retry;
pub mod server;
pub mod shutdown;
pub mod sink;
pub mod test_utils;
