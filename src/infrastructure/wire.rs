use crate::domain::calendar::LocalCalendar;
use crate::domain::models::{
    SegmentSource, SegmentStatus, Task, TaskPriority, TaskStatus, TimeSegment,
};
use crate::infrastructure::error::InfraError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

const DATE_FORMAT: &str = "%Y-%m-%d";

/// A `tasks` row as stored and as exchanged with the remote persistence API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub planned_date: Option<String>,
    #[serde(default)]
    pub deadline: Option<String>,
    pub priority: String,
    pub status: String,
    #[serde(default)]
    pub estimated_minutes: Option<i64>,
    #[serde(default)]
    pub scheduled_time: i64,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub order: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl TaskRow {
    pub fn from_task(task: &Task, calendar: &LocalCalendar) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            description: task.description.clone(),
            planned_date: task.planned_date.map(format_date),
            deadline: task.deadline.map(format_date),
            priority: task.priority.as_str().to_string(),
            status: task.status.as_str().to_string(),
            estimated_minutes: task.estimated_minutes.map(i64::from),
            scheduled_time: task.scheduled_minutes,
            parent_task_id: task.parent_task_id.clone(),
            order: i64::from(task.order),
            tags: task.tags.clone(),
            created_at: calendar.to_local_rfc3339(task.created_at),
            updated_at: calendar.to_local_rfc3339(task.updated_at),
            deleted_at: task.deleted_at.map(|value| calendar.to_local_rfc3339(value)),
        }
    }

    pub fn into_task(self) -> Result<Task, InfraError> {
        Ok(Task {
            priority: TaskPriority::parse(&self.priority).map_err(|error| record_error("tasks", error))?,
            status: TaskStatus::parse(&self.status).map_err(|error| record_error("tasks", error))?,
            planned_date: self.planned_date.as_deref().map(parse_date).transpose()?,
            deadline: self.deadline.as_deref().map(parse_date).transpose()?,
            estimated_minutes: self
                .estimated_minutes
                .map(|value| {
                    u32::try_from(value).map_err(|_| {
                        InfraError::InvalidRecord(format!(
                            "tasks.estimated_minutes out of range: {value}"
                        ))
                    })
                })
                .transpose()?,
            order: i32::try_from(self.order).map_err(|_| {
                InfraError::InvalidRecord(format!("tasks.order out of range: {}", self.order))
            })?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted_at: self.deleted_at.as_deref().map(parse_timestamp).transpose()?,
            id: self.id,
            title: self.title,
            description: self.description,
            scheduled_minutes: self.scheduled_time,
            parent_task_id: self.parent_task_id,
            tags: self.tags,
        })
    }
}

/// A `time_segments` row. Timestamps carry the configured local offset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentRow {
    pub id: String,
    pub task_id: String,
    pub start_time: String,
    pub end_time: String,
    pub date: String,
    pub duration: i64,
    pub title: String,
    #[serde(default)]
    pub title_is_custom: bool,
    pub status: String,
    #[serde(default)]
    pub order: i64,
    pub source: String,
    #[serde(default)]
    pub google_calendar_event_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl SegmentRow {
    pub fn from_segment(segment: &TimeSegment, calendar: &LocalCalendar) -> Self {
        Self {
            id: segment.id.clone(),
            task_id: segment.task_id.clone(),
            start_time: calendar.to_local_rfc3339(segment.start_time),
            end_time: calendar.to_local_rfc3339(segment.end_time),
            date: format_date(segment.date),
            duration: segment.duration_minutes,
            title: segment.title.clone(),
            title_is_custom: segment.title_is_custom,
            status: segment.status.as_str().to_string(),
            order: i64::from(segment.order),
            source: segment.source.as_str().to_string(),
            google_calendar_event_id: segment.external_id.clone(),
            created_at: calendar.to_local_rfc3339(segment.created_at),
            updated_at: calendar.to_local_rfc3339(segment.updated_at),
            deleted_at: segment
                .deleted_at
                .map(|value| calendar.to_local_rfc3339(value)),
        }
    }

    pub fn into_segment(self) -> Result<TimeSegment, InfraError> {
        Ok(TimeSegment {
            start_time: parse_timestamp(&self.start_time)?,
            end_time: parse_timestamp(&self.end_time)?,
            date: parse_date(&self.date)?,
            status: SegmentStatus::parse(&self.status)
                .map_err(|error| record_error("time_segments", error))?,
            source: SegmentSource::parse(&self.source)
                .map_err(|error| record_error("time_segments", error))?,
            order: u32::try_from(self.order).map_err(|_| {
                InfraError::InvalidRecord(format!(
                    "time_segments.order out of range: {}",
                    self.order
                ))
            })?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            deleted_at: self.deleted_at.as_deref().map(parse_timestamp).transpose()?,
            id: self.id,
            task_id: self.task_id,
            duration_minutes: self.duration,
            title: self.title,
            title_is_custom: self.title_is_custom,
            external_id: self.google_calendar_event_id,
        })
    }
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, InfraError> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
        .map_err(|error| InfraError::InvalidRecord(format!("invalid date '{raw}': {error}")))
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| InfraError::InvalidRecord(format!("invalid timestamp '{raw}': {error}")))
}

fn record_error(table: &str, error: impl std::fmt::Display) -> InfraError {
    InfraError::InvalidRecord(format!("{table}: {error}"))
}
