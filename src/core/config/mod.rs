mod parsing;
mod settings;
mod types;

pub use types::{
    AttemptSettings, ConfigError, DatabaseSettings, Environment, RuntimeSettings, Settings,
    SweepSettings, TelemetrySettings,
};
