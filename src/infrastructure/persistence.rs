use crate::domain::calendar::DateRange;
use crate::domain::models::{Task, TimeSegment};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Storage port for tasks and segments.
///
/// List queries return live records only; `get_*` also returns soft-deleted
/// records so callers can tell "deleted" from "never existed".
#[async_trait]
pub trait SchedulePersistence: Send + Sync {
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, InfraError>;

    async fn list_tasks(&self) -> Result<Vec<Task>, InfraError>;

    async fn insert_task(&self, task: &Task) -> Result<(), InfraError>;

    async fn update_task(&self, task: &Task) -> Result<(), InfraError>;

    /// Soft-deletes the task and every live segment it owns.
    async fn soft_delete_task(
        &self,
        task_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), InfraError>;

    async fn get_segment(&self, segment_id: &str) -> Result<Option<TimeSegment>, InfraError>;

    /// Live segments whose `date` lies in `range`, ordered by start time.
    async fn list_segments(&self, range: &DateRange) -> Result<Vec<TimeSegment>, InfraError>;

    async fn list_segments_for_tasks(
        &self,
        task_ids: &[String],
    ) -> Result<Vec<TimeSegment>, InfraError>;

    async fn insert_segment(&self, segment: &TimeSegment) -> Result<(), InfraError>;

    async fn update_segment(&self, segment: &TimeSegment) -> Result<(), InfraError>;

    async fn soft_delete_segment(
        &self,
        segment_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), InfraError>;

    /// Rewrites `tasks.scheduled_time` as the sum of live segment durations and returns it.
    async fn recompute_scheduled_minutes(&self, task_id: &str) -> Result<i64, InfraError>;
}
