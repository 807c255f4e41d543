use crate::domain::error::DomainError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ViewKind {
    Timeline,
    Calendar,
    Kanban,
}

impl ViewKind {
    pub const ALL: [ViewKind; 3] = [Self::Timeline, Self::Calendar, Self::Kanban];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeline => "timeline",
            Self::Calendar => "calendar",
            Self::Kanban => "kanban",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "timeline" => Ok(Self::Timeline),
            "calendar" => Ok(Self::Calendar),
            "kanban" => Ok(Self::Kanban),
            other => Err(DomainError::invalid(
                "view",
                format!("is not supported: {other}"),
            )),
        }
    }
}

/// Who is mutating: the acting view (if any) and the session user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationContext {
    pub origin: Option<ViewKind>,
    pub actor: Option<String>,
}

impl MutationContext {
    pub fn from_view(view: ViewKind) -> Self {
        Self {
            origin: Some(view),
            actor: None,
        }
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        self
    }
}

/// Published after a mutation has been persisted and aggregates recomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleEvent {
    pub origin: Option<ViewKind>,
    pub task_ids: BTreeSet<String>,
    pub dates: BTreeSet<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct ScheduleEventBus {
    sender: broadcast::Sender<ScheduleEvent>,
}

impl Default for ScheduleEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ScheduleEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScheduleEvent> {
        self.sender.subscribe()
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: ScheduleEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }
}
