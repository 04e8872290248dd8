use envconfig::Envconfig;

use apilog_common::config::{DatabaseConfig, EnvDuration};
use apilog_common::logging::LogFormat;

#[derive(Envconfig)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    /// Internal listener: probes and metrics.
    #[envconfig(from = "PORT", default = "8080")]
    pub port: u16,

    /// Public listener: the time endpoint.
    #[envconfig(from = "PUBLIC_PORT", default = "8090")]
    pub public_port: u16,

    #[envconfig(from = "APP_ENV", default = "development")]
    pub app_env: String,

    /// Requests per second, shared by both listeners. 0 rejects everything.
    #[envconfig(from = "RATE_LIMIT", default = "100")]
    pub rate_limit: u32,

    #[envconfig(from = "SHUTDOWN_TIMEOUT", default = "30s")]
    pub shutdown_timeout: EnvDuration,

    #[envconfig(from = "LOG_DRAIN_TIMEOUT", default = "10s")]
    pub log_drain_timeout: EnvDuration,

    #[envconfig(from = "LOG_FORMAT", default = "text")]
    pub log_format: LogFormat,

    #[envconfig(nested = true)]
    pub database: DatabaseConfig,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn public_bind(&self) -> String {
        format!("{}:{}", self.host, self.public_port)
    }
}
