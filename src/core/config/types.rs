use thiserror::Error;
use time::Duration;

#[derive(Debug, Clone)]
pub struct Settings {
    pub(super) runtime: RuntimeSettings,
    pub(super) database: DatabaseSettings,
    pub(super) attempts: AttemptSettings,
    pub(super) sweep: SweepSettings,
    pub(super) telemetry: TelemetrySettings,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub postgres_server: String,
    pub postgres_port: u16,
    pub postgres_user: String,
    pub postgres_password: String,
    pub postgres_db: String,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

/// Timing knobs applied by the attempt state machine when a page is submitted
/// close to, or after, the deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptSettings {
    pub grace_period_min_seconds: u64,
    pub min_time_to_continue_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSettings {
    pub recheck_interval_seconds: u64,
    pub overdue_interval_seconds: u64,
    pub overdue_batch_size: u32,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub log_level: String,
    pub json: bool,
    pub prometheus_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub environment: Environment,
    pub strict_config: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Staging,
    Test,
}

impl Environment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Test => "test",
        }
    }

    pub(super) fn is_production(self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
    #[error("missing required secret for {0}")]
    MissingSecret(&'static str),
}

impl DatabaseSettings {
    pub fn database_url(&self) -> String {
        if let Some(url) = &self.database_url {
            return url.clone();
        }

        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.postgres_user,
            self.postgres_password,
            self.postgres_server,
            self.postgres_port,
            self.postgres_db
        )
    }
}

impl AttemptSettings {
    pub fn grace_period_min(&self) -> Duration {
        seconds(self.grace_period_min_seconds)
    }

    pub fn min_time_to_continue(&self) -> Duration {
        seconds(self.min_time_to_continue_seconds)
    }
}

impl Default for AttemptSettings {
    fn default() -> Self {
        Self { grace_period_min_seconds: 60, min_time_to_continue_seconds: 2 }
    }
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            recheck_interval_seconds: 300,
            overdue_interval_seconds: 60,
            overdue_batch_size: 200,
        }
    }
}

fn seconds(value: u64) -> Duration {
    Duration::seconds(value.min(i64::MAX as u64) as i64)
}
