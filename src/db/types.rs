use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "attemptstate", rename_all = "snake_case")]
pub enum AttemptState {
    InProgress,
    Overdue,
    Finished,
    Abandoned,
}

impl AttemptState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Overdue => "overdue",
            Self::Finished => "finished",
            Self::Abandoned => "abandoned",
        }
    }

    /// Finished and abandoned attempts never change state again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Abandoned)
    }

    pub fn is_open(self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happens to an in-progress attempt once its deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverdueHandling {
    AutoSubmit,
    GracePeriod,
    AutoAbandon,
}

impl OverdueHandling {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoSubmit => "autosubmit",
            Self::GracePeriod => "graceperiod",
            Self::AutoAbandon => "autoabandon",
        }
    }

    /// Unrecognised stored values degrade to `AutoAbandon`.
    pub fn from_setting(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "autosubmit" => Self::AutoSubmit,
            "graceperiod" => Self::GracePeriod,
            "autoabandon" => Self::AutoAbandon,
            other => {
                tracing::warn!(
                    overdue_handling = other,
                    "Unknown overdue handling policy; falling back to autoabandon"
                );
                Self::AutoAbandon
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationMode {
    Free,
    Sequential,
}

impl NavigationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Sequential => "sequential",
        }
    }

    pub fn from_setting(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "sequential" | "seq" => Self::Sequential,
            _ => Self::Free,
        }
    }
}
