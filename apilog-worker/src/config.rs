use std::time;

use envconfig::Envconfig;

use apilog_common::config::{DatabaseConfig, EnvDuration};
use apilog_common::logging::LogFormat;

use crate::error::WorkerError;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "HEALTH_PORT", default = "8081")]
    pub port: u16,

    #[envconfig(from = "APP_ENV", default = "development")]
    pub app_env: String,

    /// Pause between polls while there is nothing to process.
    #[envconfig(from = "WORKER_INTERVAL", default = "2s")]
    pub interval: EnvDuration,

    #[envconfig(from = "WORKER_BATCH_SIZE", default = "1000")]
    pub batch_size: u32,

    #[envconfig(from = "SHUTDOWN_TIMEOUT", default = "10s")]
    pub shutdown_timeout: EnvDuration,

    #[envconfig(from = "LOG_FORMAT", default = "text")]
    pub log_format: LogFormat,

    #[envconfig(nested = true)]
    pub database: DatabaseConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The polling interval. Zero would turn the processor into a busy loop.
    pub fn interval(&self) -> Result<time::Duration, WorkerError> {
        if self.interval.0.is_zero() {
            return Err(WorkerError::InvalidConfig("WORKER_INTERVAL must be positive"));
        }
        Ok(self.interval.0)
    }

    pub fn batch_size(&self) -> Result<i64, WorkerError> {
        if self.batch_size == 0 {
            return Err(WorkerError::InvalidConfig(
                "WORKER_BATCH_SIZE must be positive",
            ));
        }
        Ok(i64::from(self.batch_size))
    }
}
