use crate::domain::calendar::{DateRange, LocalCalendar};
use crate::domain::error::DomainError;
use crate::domain::models::{Task, TimeSegment};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::persistence::SchedulePersistence;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    tasks: HashMap<String, Task>,
    segments: HashMap<String, TimeSegment>,
}

/// Process-local store enforcing the same integrity rules as the SQLite schema.
#[derive(Debug, Default)]
pub struct InMemoryScheduleStore {
    calendar: LocalCalendar,
    tables: Mutex<Tables>,
}

impl InMemoryScheduleStore {
    pub fn new(calendar: LocalCalendar) -> Self {
        Self {
            calendar,
            tables: Mutex::new(Tables::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, InfraError> {
        self.tables
            .lock()
            .map_err(|_| InfraError::LockPoisoned("schedule store"))
    }

    fn check_segment(&self, tables: &Tables, segment: &TimeSegment) -> Result<(), InfraError> {
        segment.validate(&self.calendar)?;
        if !tables.tasks.contains_key(&segment.task_id) {
            return Err(DomainError::TaskNotFound(segment.task_id.clone()).into());
        }
        Ok(())
    }

    fn check_task(tables: &Tables, task: &Task) -> Result<(), InfraError> {
        task.validate()?;
        if let Some(parent_id) = task.parent_task_id.as_deref() {
            if !tables.tasks.contains_key(parent_id) {
                return Err(DomainError::TaskNotFound(parent_id.to_string()).into());
            }
        }
        Ok(())
    }
}

fn sort_segments(segments: &mut [TimeSegment]) {
    segments.sort_by(|left, right| {
        left.start_time
            .cmp(&right.start_time)
            .then_with(|| left.id.cmp(&right.id))
    });
}

#[async_trait]
impl SchedulePersistence for InMemoryScheduleStore {
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, InfraError> {
        Ok(self.lock()?.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, InfraError> {
        let tables = self.lock()?;
        let mut tasks = tables
            .tasks
            .values()
            .filter(|task| !task.is_deleted())
            .cloned()
            .collect::<Vec<_>>();
        tasks.sort_by(|left, right| {
            left.order
                .cmp(&right.order)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        Ok(tasks)
    }

    async fn insert_task(&self, task: &Task) -> Result<(), InfraError> {
        let mut tables = self.lock()?;
        Self::check_task(&tables, task)?;
        if tables.tasks.contains_key(&task.id) {
            return Err(InfraError::InvalidRecord(format!(
                "task already exists: {}",
                task.id
            )));
        }
        tables.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), InfraError> {
        let mut tables = self.lock()?;
        Self::check_task(&tables, task)?;
        let Some(stored) = tables.tasks.get_mut(&task.id) else {
            return Err(DomainError::TaskNotFound(task.id.clone()).into());
        };
        *stored = task.clone();
        Ok(())
    }

    async fn soft_delete_task(
        &self,
        task_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let mut tables = self.lock()?;
        let Some(task) = tables.tasks.get_mut(task_id) else {
            return Err(DomainError::TaskNotFound(task_id.to_string()).into());
        };
        task.deleted_at = Some(deleted_at);
        task.updated_at = deleted_at;
        for segment in tables
            .segments
            .values_mut()
            .filter(|segment| segment.task_id == task_id && !segment.is_deleted())
        {
            segment.deleted_at = Some(deleted_at);
            segment.updated_at = deleted_at;
        }
        Ok(())
    }

    async fn get_segment(&self, segment_id: &str) -> Result<Option<TimeSegment>, InfraError> {
        Ok(self.lock()?.segments.get(segment_id).cloned())
    }

    async fn list_segments(&self, range: &DateRange) -> Result<Vec<TimeSegment>, InfraError> {
        let tables = self.lock()?;
        let mut segments = tables
            .segments
            .values()
            .filter(|segment| !segment.is_deleted() && range.contains(segment.date))
            .cloned()
            .collect::<Vec<_>>();
        sort_segments(&mut segments);
        Ok(segments)
    }

    async fn list_segments_for_tasks(
        &self,
        task_ids: &[String],
    ) -> Result<Vec<TimeSegment>, InfraError> {
        let tables = self.lock()?;
        let mut segments = tables
            .segments
            .values()
            .filter(|segment| !segment.is_deleted() && task_ids.contains(&segment.task_id))
            .cloned()
            .collect::<Vec<_>>();
        sort_segments(&mut segments);
        Ok(segments)
    }

    async fn insert_segment(&self, segment: &TimeSegment) -> Result<(), InfraError> {
        let mut tables = self.lock()?;
        self.check_segment(&tables, segment)?;
        if tables.segments.contains_key(&segment.id) {
            return Err(InfraError::InvalidRecord(format!(
                "time segment already exists: {}",
                segment.id
            )));
        }
        tables.segments.insert(segment.id.clone(), segment.clone());
        Ok(())
    }

    async fn update_segment(&self, segment: &TimeSegment) -> Result<(), InfraError> {
        let mut tables = self.lock()?;
        self.check_segment(&tables, segment)?;
        let Some(stored) = tables.segments.get_mut(&segment.id) else {
            return Err(DomainError::SegmentNotFound(segment.id.clone()).into());
        };
        *stored = segment.clone();
        Ok(())
    }

    async fn soft_delete_segment(
        &self,
        segment_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let mut tables = self.lock()?;
        let Some(segment) = tables.segments.get_mut(segment_id) else {
            return Err(DomainError::SegmentNotFound(segment_id.to_string()).into());
        };
        segment.deleted_at = Some(deleted_at);
        segment.updated_at = deleted_at;
        Ok(())
    }

    async fn recompute_scheduled_minutes(&self, task_id: &str) -> Result<i64, InfraError> {
        let mut tables = self.lock()?;
        let total = tables
            .segments
            .values()
            .filter(|segment| segment.task_id == task_id && !segment.is_deleted())
            .map(|segment| segment.duration_minutes)
            .sum::<i64>();
        let Some(task) = tables.tasks.get_mut(task_id) else {
            return Err(DomainError::TaskNotFound(task_id.to_string()).into());
        };
        task.scheduled_minutes = total;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::fixtures::{date, fixed_time, sample_segment, sample_task};

    #[tokio::test]
    async fn recompute_sums_live_segments_only() {
        let store = InMemoryScheduleStore::default();
        store.insert_task(&sample_task("tsk-1")).await.expect("insert task");
        for (id, start, end) in [
            ("seg-1", "2024-03-10T09:00:00Z", "2024-03-10T10:00:00Z"),
            ("seg-2", "2024-03-10T11:00:00Z", "2024-03-10T11:45:00Z"),
            ("seg-3", "2024-03-11T09:00:00Z", "2024-03-11T09:30:00Z"),
        ] {
            store
                .insert_segment(&sample_segment(id, "tsk-1", start, end))
                .await
                .expect("insert segment");
        }
        store
            .soft_delete_segment("seg-3", fixed_time("2024-03-12T00:00:00Z"))
            .await
            .expect("delete segment");

        assert_eq!(store.recompute_scheduled_minutes("tsk-1").await.expect("recompute"), 105);
        let task = store.get_task("tsk-1").await.expect("get").expect("task exists");
        assert_eq!(task.scheduled_minutes, 105);
    }

    #[tokio::test]
    async fn rejects_segment_for_unknown_task() {
        let store = InMemoryScheduleStore::default();
        let error = store
            .insert_segment(&sample_segment(
                "seg-1",
                "tsk-missing",
                "2024-03-10T09:00:00Z",
                "2024-03-10T10:00:00Z",
            ))
            .await
            .expect_err("missing task");
        assert!(matches!(
            error.domain(),
            Some(DomainError::TaskNotFound(id)) if id == "tsk-missing"
        ));
    }

    #[tokio::test]
    async fn task_delete_cascades_and_hides_from_lists() {
        let store = InMemoryScheduleStore::default();
        store.insert_task(&sample_task("tsk-1")).await.expect("insert task");
        store
            .insert_segment(&sample_segment(
                "seg-1",
                "tsk-1",
                "2024-03-10T09:00:00Z",
                "2024-03-10T10:00:00Z",
            ))
            .await
            .expect("insert segment");

        store
            .soft_delete_task("tsk-1", fixed_time("2024-03-10T12:00:00Z"))
            .await
            .expect("delete task");

        assert!(store.list_tasks().await.expect("list tasks").is_empty());
        assert!(
            store
                .list_segments(&DateRange::single(date("2024-03-10")))
                .await
                .expect("list segments")
                .is_empty()
        );
        let segment = store.get_segment("seg-1").await.expect("get").expect("kept");
        assert!(segment.is_deleted());
    }
}
