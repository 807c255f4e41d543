use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("{field} is required")]
    MissingField { field: &'static str },
    #[error("end time must be after start time")]
    InvalidTimeRange,
    #[error("a segment cannot cross midnight - split it into two days")]
    CrossesMidnight,
    #[error("{field} {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("time segment not found: {0}")]
    SegmentNotFound(String),
    #[error("a task cannot be its own parent")]
    SelfParent,
    #[error("parent assignment would create a cycle through task {0}")]
    ParentCycle(String),
    #[error("segment is too short to split ({0} minutes)")]
    SegmentTooShort(i64),
}

impl DomainError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Name of the record field the error refers to.
    pub fn field(&self) -> &'static str {
        match self {
            Self::MissingField { field } | Self::InvalidField { field, .. } => field,
            Self::InvalidTimeRange | Self::CrossesMidnight => "end_time",
            Self::TaskNotFound(_) => "task_id",
            Self::SegmentNotFound(_) => "id",
            Self::SelfParent | Self::ParentCycle(_) => "parent_task_id",
            Self::SegmentTooShort(_) => "duration",
        }
    }
}
