use crate::domain::calendar::{LocalCalendar, minutes_between};
use crate::domain::error::DomainError;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Urgent,
    High,
    Medium,
    Low,
}

impl TaskPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "urgent" => Ok(Self::Urgent),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            other => Err(DomainError::invalid(
                "priority",
                format!("is not supported: {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "todo" => Ok(Self::Todo),
            "in_progress" | "in-progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(DomainError::invalid(
                "status",
                format!("is not supported: {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentStatus {
    Planned,
    InProgress,
    Completed,
}

impl SegmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "planned" => Ok(Self::Planned),
            "in-progress" | "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            other => Err(DomainError::invalid(
                "status",
                format!("is not supported: {other}"),
            )),
        }
    }
}

/// Subsystem that created and owns a segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SegmentSource {
    App,
    Task,
    Google,
}

impl SegmentSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::App => "app",
            Self::Task => "task",
            Self::Google => "google",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "app" => Ok(Self::App),
            "task" => Ok(Self::Task),
            "google" => Ok(Self::Google),
            other => Err(DomainError::invalid(
                "source",
                format!("is not supported: {other}"),
            )),
        }
    }

    /// Whether an edit flow running as `flow` may delete a segment owned by `self`.
    pub fn removable_by(self, flow: SegmentSource) -> bool {
        self == flow
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub planned_date: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub estimated_minutes: Option<u32>,
    pub scheduled_minutes: i64,
    pub parent_task_id: Option<String>,
    pub order: i32,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn validate(&self) -> Result<(), DomainError> {
        validate_non_empty(&self.id, "task.id")?;
        validate_non_empty(&self.title, "task.title")?;
        if self.parent_task_id.as_deref() == Some(self.id.as_str()) {
            return Err(DomainError::SelfParent);
        }
        if self.scheduled_minutes < 0 {
            return Err(DomainError::invalid("task.scheduled_minutes", "must be >= 0"));
        }
        Ok(())
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimeSegment {
    pub id: String,
    pub task_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub date: NaiveDate,
    pub duration_minutes: i64,
    pub title: String,
    pub title_is_custom: bool,
    pub status: SegmentStatus,
    pub order: u32,
    pub source: SegmentSource,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TimeSegment {
    pub fn validate(&self, calendar: &LocalCalendar) -> Result<(), DomainError> {
        validate_non_empty(&self.id, "segment.id")?;
        validate_non_empty(&self.task_id, "segment.task_id")?;
        let date = calendar.validate_interval(self.start_time, self.end_time)?;
        if date != self.date {
            return Err(DomainError::invalid(
                "segment.date",
                "must equal the local date of start_time",
            ));
        }
        if self.duration_minutes != minutes_between(self.start_time, self.end_time) {
            return Err(DomainError::invalid(
                "segment.duration",
                "must equal end_time - start_time",
            ));
        }
        Ok(())
    }

    /// Replaces both endpoints and rederives `date` and `duration_minutes`.
    pub fn set_times(
        &mut self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        calendar: &LocalCalendar,
    ) -> Result<(), DomainError> {
        let start = truncate_to_second(start);
        let end = truncate_to_second(end);
        self.date = calendar.validate_interval(start, end)?;
        self.start_time = start;
        self.end_time = end;
        self.duration_minutes = minutes_between(start, end);
        Ok(())
    }

    pub fn session_label(&self) -> String {
        format!("Session {}", self.order)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub planned_date: NaiveDate,
    pub deadline: Option<NaiveDate>,
    pub priority: TaskPriority,
    pub estimated_minutes: Option<u32>,
    pub parent_task_id: Option<String>,
    pub tags: Vec<String>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>, planned_date: NaiveDate) -> Self {
        Self {
            title: title.into(),
            description: None,
            planned_date,
            deadline: None,
            priority: TaskPriority::Medium,
            estimated_minutes: None,
            parent_task_id: None,
            tags: Vec::new(),
        }
    }
}

/// Partial task update. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub planned_date: Option<NaiveDate>,
    pub deadline: Option<Option<NaiveDate>>,
    pub priority: Option<TaskPriority>,
    pub status: Option<TaskStatus>,
    pub estimated_minutes: Option<Option<u32>>,
    pub parent_task_id: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSegment {
    pub task_id: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub status: Option<SegmentStatus>,
    pub source: SegmentSource,
    pub external_id: Option<String>,
}

impl NewSegment {
    pub fn for_task(
        task_id: impl Into<String>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        source: SegmentSource,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            start_time: Some(start_time),
            end_time: Some(end_time),
            title: None,
            status: None,
            source,
            external_id: None,
        }
    }

    pub fn required_times(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), DomainError> {
        let start = self
            .start_time
            .ok_or(DomainError::MissingField { field: "start_time" })?;
        let end = self
            .end_time
            .ok_or(DomainError::MissingField { field: "end_time" })?;
        Ok((start, end))
    }
}

/// Partial segment update. `title: Some(None)` drops a custom title.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentPatch {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub title: Option<Option<String>>,
    pub status: Option<SegmentStatus>,
    pub task_id: Option<String>,
}

impl SegmentPatch {
    pub fn times(start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Self {
            start_time: Some(start_time),
            end_time: Some(end_time),
            ..Self::default()
        }
    }

    /// Applies the patch to a copy of `segment`. `task_title` is the title of the
    /// owning task after the patch, used when the segment title is not custom.
    pub fn apply(
        &self,
        segment: &TimeSegment,
        task_title: Option<&str>,
        calendar: &LocalCalendar,
    ) -> Result<TimeSegment, DomainError> {
        let mut updated = segment.clone();
        if let Some(task_id) = self.task_id.as_deref() {
            validate_non_empty(task_id, "segment.task_id")?;
            updated.task_id = task_id.trim().to_string();
        }

        let start = self.start_time.unwrap_or(segment.start_time);
        let end = self.end_time.unwrap_or(segment.end_time);
        updated.set_times(start, end, calendar)?;

        match &self.title {
            Some(Some(title)) => {
                validate_non_empty(title, "segment.title")?;
                updated.title = title.trim().to_string();
                updated.title_is_custom = true;
            }
            Some(None) => updated.title_is_custom = false,
            None => {}
        }
        if !updated.title_is_custom {
            if let Some(task_title) = task_title {
                updated.title = task_title.to_string();
            }
        }

        if let Some(status) = self.status {
            updated.status = status;
        }
        Ok(updated)
    }
}

pub(crate) fn validate_non_empty(value: &str, field_name: &'static str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::MissingField { field: field_name });
    }
    Ok(())
}

fn truncate_to_second(value: DateTime<Utc>) -> DateTime<Utc> {
    value.with_nanosecond(0).unwrap_or(value)
}
