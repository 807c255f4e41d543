use crate::domain::error::DomainError;
use thiserror::Error;

const TIME_RANGE_CONSTRAINT: &str = "segment_time_range";
const SAME_DAY_CONSTRAINT: &str = "segment_same_day";
const OWN_PARENT_CONSTRAINT: &str = "task_not_own_parent";

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("invalid stored record: {0}")]
    InvalidRecord(String),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl InfraError {
    pub fn domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(error) => Some(error),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for InfraError {
    fn from(error: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, Some(message)) = &error {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                if let Some(domain) = translate_constraint_message(message) {
                    return Self::Domain(domain);
                }
            }
        }
        Self::Sqlite(error)
    }
}

/// Maps a store-side constraint name found in `message` onto the domain vocabulary.
pub fn translate_constraint_message(message: &str) -> Option<DomainError> {
    if message.contains(TIME_RANGE_CONSTRAINT) {
        Some(DomainError::InvalidTimeRange)
    } else if message.contains(SAME_DAY_CONSTRAINT) {
        Some(DomainError::CrossesMidnight)
    } else if message.contains(OWN_PARENT_CONSTRAINT) {
        Some(DomainError::SelfParent)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_names_map_to_domain_errors() {
        assert_eq!(
            translate_constraint_message("CHECK constraint failed: segment_same_day"),
            Some(DomainError::CrossesMidnight)
        );
        assert_eq!(
            translate_constraint_message(
                "new row violates check constraint \"segment_time_range\""
            ),
            Some(DomainError::InvalidTimeRange)
        );
        assert_eq!(translate_constraint_message("UNIQUE constraint failed"), None);
    }

    #[test]
    fn sqlite_check_failure_becomes_domain_error() {
        let failure = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT_CHECK),
            Some("CHECK constraint failed: segment_time_range".to_string()),
        );
        let error = InfraError::from(failure);
        assert_eq!(error.domain(), Some(&DomainError::InvalidTimeRange));
    }
}
