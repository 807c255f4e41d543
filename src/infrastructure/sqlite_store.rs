use crate::domain::calendar::{DateRange, LocalCalendar};
use crate::domain::error::DomainError;
use crate::domain::models::{Task, TimeSegment};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::persistence::SchedulePersistence;
use crate::infrastructure::storage::open_connection;
use crate::infrastructure::wire::{SegmentRow, TaskRow, format_date};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::{Path, PathBuf};

const TASK_COLUMNS: &str = "id, title, description, planned_date, deadline, priority, status, \
     estimated_minutes, scheduled_time, parent_task_id, \"order\", tags, created_at, updated_at, deleted_at";

const SEGMENT_COLUMNS: &str = "id, task_id, start_time, end_time, date, duration, title, \
     title_is_custom, status, \"order\", source, google_calendar_event_id, created_at, updated_at, deleted_at";

#[derive(Debug, Clone)]
pub struct SqliteScheduleStore {
    db_path: PathBuf,
    calendar: LocalCalendar,
}

impl SqliteScheduleStore {
    pub fn new(db_path: impl AsRef<Path>, calendar: LocalCalendar) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            calendar,
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }

    fn query_segments(
        &self,
        sql: &str,
        values: impl rusqlite::Params,
    ) -> Result<Vec<TimeSegment>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(sql)?;
        let rows = statement
            .query_map(values, read_segment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SegmentRow::into_segment).collect()
    }
}

fn read_task_row(row: &Row<'_>) -> rusqlite::Result<(TaskRow, String)> {
    let tags: String = row.get(11)?;
    Ok((
        TaskRow {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            planned_date: row.get(3)?,
            deadline: row.get(4)?,
            priority: row.get(5)?,
            status: row.get(6)?,
            estimated_minutes: row.get(7)?,
            scheduled_time: row.get(8)?,
            parent_task_id: row.get(9)?,
            order: row.get(10)?,
            tags: Vec::new(),
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
            deleted_at: row.get(14)?,
        },
        tags,
    ))
}

fn decode_task((mut row, tags): (TaskRow, String)) -> Result<Task, InfraError> {
    row.tags = serde_json::from_str(&tags)?;
    row.into_task()
}

fn read_segment_row(row: &Row<'_>) -> rusqlite::Result<SegmentRow> {
    Ok(SegmentRow {
        id: row.get(0)?,
        task_id: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        date: row.get(4)?,
        duration: row.get(5)?,
        title: row.get(6)?,
        title_is_custom: row.get(7)?,
        status: row.get(8)?,
        order: row.get(9)?,
        source: row.get(10)?,
        google_calendar_event_id: row.get(11)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
        deleted_at: row.get(14)?,
    })
}

#[async_trait]
impl SchedulePersistence for SqliteScheduleStore {
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, InfraError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id],
                read_task_row,
            )
            .optional()?;
        row.map(decode_task).transpose()
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, InfraError> {
        let connection = self.connect()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE deleted_at IS NULL ORDER BY \"order\", created_at"
        ))?;
        let rows = statement
            .query_map([], read_task_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_task).collect()
    }

    async fn insert_task(&self, task: &Task) -> Result<(), InfraError> {
        task.validate()?;
        let row = TaskRow::from_task(task, &self.calendar);
        let tags = serde_json::to_string(&row.tags)?;
        let connection = self.connect()?;
        connection.execute(
            &format!(
                "INSERT INTO tasks ({TASK_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                row.id,
                row.title,
                row.description,
                row.planned_date,
                row.deadline,
                row.priority,
                row.status,
                row.estimated_minutes,
                row.scheduled_time,
                row.parent_task_id,
                row.order,
                tags,
                row.created_at,
                row.updated_at,
                row.deleted_at,
            ],
        )?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), InfraError> {
        task.validate()?;
        let row = TaskRow::from_task(task, &self.calendar);
        let tags = serde_json::to_string(&row.tags)?;
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE tasks SET
               title = ?2, description = ?3, planned_date = ?4, deadline = ?5, priority = ?6,
               status = ?7, estimated_minutes = ?8, scheduled_time = ?9, parent_task_id = ?10,
               \"order\" = ?11, tags = ?12, updated_at = ?13, deleted_at = ?14
             WHERE id = ?1",
            params![
                row.id,
                row.title,
                row.description,
                row.planned_date,
                row.deadline,
                row.priority,
                row.status,
                row.estimated_minutes,
                row.scheduled_time,
                row.parent_task_id,
                row.order,
                tags,
                row.updated_at,
                row.deleted_at,
            ],
        )?;
        if changed == 0 {
            return Err(DomainError::TaskNotFound(task.id.clone()).into());
        }
        Ok(())
    }

    async fn soft_delete_task(
        &self,
        task_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let deleted_at = self.calendar.to_local_rfc3339(deleted_at);
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        let changed = transaction.execute(
            "UPDATE tasks SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![task_id, deleted_at],
        )?;
        if changed == 0 {
            return Err(DomainError::TaskNotFound(task_id.to_string()).into());
        }
        transaction.execute(
            "UPDATE time_segments SET deleted_at = ?2, updated_at = ?2
             WHERE task_id = ?1 AND deleted_at IS NULL",
            params![task_id, deleted_at],
        )?;
        transaction.commit()?;
        Ok(())
    }

    async fn get_segment(&self, segment_id: &str) -> Result<Option<TimeSegment>, InfraError> {
        let connection = self.connect()?;
        let row = connection
            .query_row(
                &format!("SELECT {SEGMENT_COLUMNS} FROM time_segments WHERE id = ?1"),
                params![segment_id],
                read_segment_row,
            )
            .optional()?;
        row.map(SegmentRow::into_segment).transpose()
    }

    async fn list_segments(&self, range: &DateRange) -> Result<Vec<TimeSegment>, InfraError> {
        self.query_segments(
            &format!(
                "SELECT {SEGMENT_COLUMNS} FROM time_segments
                 WHERE deleted_at IS NULL AND date >= ?1 AND date <= ?2
                 ORDER BY julianday(start_time), id"
            ),
            params![format_date(range.start), format_date(range.end)],
        )
    }

    async fn list_segments_for_tasks(
        &self,
        task_ids: &[String],
    ) -> Result<Vec<TimeSegment>, InfraError> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=task_ids.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.query_segments(
            &format!(
                "SELECT {SEGMENT_COLUMNS} FROM time_segments
                 WHERE deleted_at IS NULL AND task_id IN ({placeholders})
                 ORDER BY julianday(start_time), id"
            ),
            params_from_iter(task_ids.iter()),
        )
    }

    async fn insert_segment(&self, segment: &TimeSegment) -> Result<(), InfraError> {
        let row = SegmentRow::from_segment(segment, &self.calendar);
        let connection = self.connect()?;
        connection.execute(
            &format!(
                "INSERT INTO time_segments ({SEGMENT_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                row.id,
                row.task_id,
                row.start_time,
                row.end_time,
                row.date,
                row.duration,
                row.title,
                row.title_is_custom,
                row.status,
                row.order,
                row.source,
                row.google_calendar_event_id,
                row.created_at,
                row.updated_at,
                row.deleted_at,
            ],
        )?;
        Ok(())
    }

    async fn update_segment(&self, segment: &TimeSegment) -> Result<(), InfraError> {
        let row = SegmentRow::from_segment(segment, &self.calendar);
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE time_segments SET
               task_id = ?2, start_time = ?3, end_time = ?4, date = ?5, duration = ?6,
               title = ?7, title_is_custom = ?8, status = ?9, \"order\" = ?10, source = ?11,
               google_calendar_event_id = ?12, updated_at = ?13, deleted_at = ?14
             WHERE id = ?1",
            params![
                row.id,
                row.task_id,
                row.start_time,
                row.end_time,
                row.date,
                row.duration,
                row.title,
                row.title_is_custom,
                row.status,
                row.order,
                row.source,
                row.google_calendar_event_id,
                row.updated_at,
                row.deleted_at,
            ],
        )?;
        if changed == 0 {
            return Err(DomainError::SegmentNotFound(segment.id.clone()).into());
        }
        Ok(())
    }

    async fn soft_delete_segment(
        &self,
        segment_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let deleted_at = self.calendar.to_local_rfc3339(deleted_at);
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE time_segments SET deleted_at = ?2, updated_at = ?2 WHERE id = ?1",
            params![segment_id, deleted_at],
        )?;
        if changed == 0 {
            return Err(DomainError::SegmentNotFound(segment_id.to_string()).into());
        }
        Ok(())
    }

    async fn recompute_scheduled_minutes(&self, task_id: &str) -> Result<i64, InfraError> {
        let connection = self.connect()?;
        let changed = connection.execute(
            "UPDATE tasks SET scheduled_time = (
               SELECT COALESCE(SUM(duration), 0) FROM time_segments
               WHERE task_id = ?1 AND deleted_at IS NULL
             )
             WHERE id = ?1",
            params![task_id],
        )?;
        if changed == 0 {
            return Err(DomainError::TaskNotFound(task_id.to_string()).into());
        }
        let total = connection.query_row(
            "SELECT scheduled_time FROM tasks WHERE id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::fixtures::{date, fixed_time, sample_segment, sample_task};
    use crate::infrastructure::storage::initialize_database;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TempDatabase {
        root: PathBuf,
        path: PathBuf,
    }

    impl TempDatabase {
        fn new() -> Self {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock before epoch")
                .as_nanos();
            let root = std::env::temp_dir().join(format!("timebox-sqlite-test-{nanos}"));
            fs::create_dir_all(&root).expect("create temp dir");
            let path = root.join("timebox.sqlite");
            initialize_database(&path).expect("initialize schema");
            Self { root, path }
        }
    }

    impl Drop for TempDatabase {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    #[tokio::test]
    async fn stores_and_lists_segments_by_local_date() {
        let database = TempDatabase::new();
        let calendar = LocalCalendar::parse("America/New_York").expect("known zone");
        let store = SqliteScheduleStore::new(&database.path, calendar);
        store.insert_task(&sample_task("tsk-1")).await.expect("insert task");

        // 22:00-23:30 local on 2024-03-09.
        let mut segment =
            sample_segment("seg-1", "tsk-1", "2024-03-10T03:00:00Z", "2024-03-10T04:30:00Z");
        segment.date = date("2024-03-09");
        store.insert_segment(&segment).await.expect("insert segment");

        let listed = store
            .list_segments(&DateRange::single(date("2024-03-09")))
            .await
            .expect("list segments");
        assert_eq!(listed, vec![segment]);
        assert_eq!(
            store.recompute_scheduled_minutes("tsk-1").await.expect("recompute"),
            90
        );
    }

    #[tokio::test]
    async fn check_constraints_surface_as_domain_errors() {
        let database = TempDatabase::new();
        let store = SqliteScheduleStore::new(&database.path, LocalCalendar::default());
        store.insert_task(&sample_task("tsk-1")).await.expect("insert task");

        let mut reversed =
            sample_segment("seg-1", "tsk-1", "2024-03-10T10:00:00Z", "2024-03-10T11:00:00Z");
        std::mem::swap(&mut reversed.start_time, &mut reversed.end_time);
        let error = store.insert_segment(&reversed).await.expect_err("reversed");
        assert_eq!(error.domain(), Some(&DomainError::InvalidTimeRange));

        let crossing =
            sample_segment("seg-2", "tsk-1", "2024-03-10T23:00:00Z", "2024-03-11T01:00:00Z");
        let error = store.insert_segment(&crossing).await.expect_err("crossing");
        assert_eq!(error.domain(), Some(&DomainError::CrossesMidnight));

        let to_midnight =
            sample_segment("seg-3", "tsk-1", "2024-03-10T23:00:00Z", "2024-03-11T00:00:00Z");
        store
            .insert_segment(&to_midnight)
            .await
            .expect("end at midnight is allowed");
    }

    #[tokio::test]
    async fn deleting_task_cascades_to_segments() {
        let database = TempDatabase::new();
        let store = SqliteScheduleStore::new(&database.path, LocalCalendar::default());
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

        assert!(store.list_tasks().await.expect("list").is_empty());
        assert!(
            store
                .list_segments_for_tasks(&["tsk-1".to_string()])
                .await
                .expect("list segments")
                .is_empty()
        );
        let stored = store.get_segment("seg-1").await.expect("get").expect("row kept");
        assert_eq!(stored.deleted_at, Some(fixed_time("2024-03-10T12:00:00Z")));
    }

    #[tokio::test]
    async fn updating_missing_task_reports_not_found() {
        let database = TempDatabase::new();
        let store = SqliteScheduleStore::new(&database.path, LocalCalendar::default());
        let error = store
            .update_task(&sample_task("tsk-404"))
            .await
            .expect_err("missing task");
        assert!(matches!(error.domain(), Some(DomainError::TaskNotFound(_))));
    }
}
