use async_trait::async_trait;
use thiserror::Error;

use crate::services::test_definition::{ItemRef, RandomSlot};

#[derive(Debug, Error)]
#[error("item selection failed: {0}")]
pub struct SelectionError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomItemRequest<'a> {
    pub user_id: &'a str,
    pub slot: &'a RandomSlot,
    /// Items this learner already has, across the current and earlier attempts.
    pub already_used: &'a [String],
}

/// Draws concrete items for random slots.
#[async_trait]
pub trait ItemSelector: Send + Sync {
    /// `Ok(None)` when the category has no eligible item left.
    async fn next_item(
        &self,
        request: RandomItemRequest<'_>,
    ) -> Result<Option<ItemRef>, SelectionError>;
}

/// Recomputes a learner's overall grade after an attempt finishes.
#[async_trait]
pub trait GradeAggregator: Send + Sync {
    async fn attempt_finished(&self, test_id: &str, user_id: &str) -> anyhow::Result<()>;
}
