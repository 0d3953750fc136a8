use super::parsing::{
    env_optional, env_or_default, parse_batch_size, parse_bool, parse_environment,
    parse_interval, parse_u16, parse_u32, parse_u64,
};
use super::types::{
    AttemptSettings, ConfigError, DatabaseSettings, RuntimeSettings, Settings, SweepSettings,
    TelemetrySettings,
};

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let environment = parse_environment(
            env_optional("EXAMFLOW_ENV").or_else(|| env_optional("ENVIRONMENT")),
        );
        let strict_config = env_optional("EXAMFLOW_STRICT_CONFIG")
            .map(|value| parse_bool(&value))
            .unwrap_or(false)
            || environment.is_production();

        let postgres_server = env_or_default("POSTGRES_SERVER", "localhost");
        let postgres_port = parse_u16("POSTGRES_PORT", env_or_default("POSTGRES_PORT", "5432"))?;
        let postgres_user = env_or_default("POSTGRES_USER", "examflow");
        let postgres_password = env_or_default("POSTGRES_PASSWORD", "");
        let postgres_db = env_or_default("POSTGRES_DB", "examflow");
        let database_url = env_optional("DATABASE_URL");
        let max_connections = parse_u32(
            "DATABASE_MAX_CONNECTIONS",
            env_or_default("DATABASE_MAX_CONNECTIONS", "20"),
        )?;

        let grace_period_min_seconds = parse_u64(
            "ATTEMPT_GRACE_PERIOD_MIN_SECONDS",
            env_or_default("ATTEMPT_GRACE_PERIOD_MIN_SECONDS", "60"),
        )?;
        let min_time_to_continue_seconds = parse_u64(
            "ATTEMPT_MIN_TIME_TO_CONTINUE_SECONDS",
            env_or_default("ATTEMPT_MIN_TIME_TO_CONTINUE_SECONDS", "2"),
        )?;

        let recheck_interval_seconds = parse_interval(
            "ATTEMPT_SWEEP_INTERVAL_SECONDS",
            env_or_default("ATTEMPT_SWEEP_INTERVAL_SECONDS", "300"),
        )?;
        let overdue_interval_seconds = parse_interval(
            "ATTEMPT_OVERDUE_INTERVAL_SECONDS",
            env_or_default("ATTEMPT_OVERDUE_INTERVAL_SECONDS", "60"),
        )?;
        let overdue_batch_size = parse_batch_size(
            "ATTEMPT_OVERDUE_BATCH_SIZE",
            env_or_default("ATTEMPT_OVERDUE_BATCH_SIZE", "200"),
        )?;

        let log_level = env_or_default("EXAMFLOW_LOG_LEVEL", "info");
        let json =
            env_optional("EXAMFLOW_LOG_JSON").map(|value| parse_bool(&value)).unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            runtime: RuntimeSettings { environment, strict_config },
            database: DatabaseSettings {
                postgres_server,
                postgres_port,
                postgres_user,
                postgres_password,
                postgres_db,
                database_url,
                max_connections,
            },
            attempts: AttemptSettings { grace_period_min_seconds, min_time_to_continue_seconds },
            sweep: SweepSettings {
                recheck_interval_seconds,
                overdue_interval_seconds,
                overdue_batch_size,
            },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn database(&self) -> &DatabaseSettings {
        &self.database
    }

    pub fn attempts(&self) -> &AttemptSettings {
        &self.attempts
    }

    pub fn sweep(&self) -> &SweepSettings {
        &self.sweep
    }

    pub fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "DATABASE_MAX_CONNECTIONS",
                value: String::from("0"),
            });
        }

        if !(self.runtime.strict_config || self.runtime.environment.is_production()) {
            return Ok(());
        }

        if self.database.database_url.is_none() && self.database.postgres_password.is_empty() {
            return Err(ConfigError::MissingSecret("POSTGRES_PASSWORD"));
        }

        Ok(())
    }
}
