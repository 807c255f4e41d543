use crate::domain::box_dates::task_in_range;
use crate::domain::calendar::DateRange;
use crate::domain::models::{Task, TimeSegment};
use crate::infrastructure::error::InfraError;
use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

pub type MutationToken = u64;

/// Lifecycle of one cached record relative to in-flight mutations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState<T> {
    Confirmed,
    /// Optimistically applied by `token`; `previous` is the value to restore.
    Pending {
        token: MutationToken,
        previous: Option<T>,
    },
    Reverting {
        token: MutationToken,
        previous: Option<T>,
    },
}

impl<T> EntryState<T> {
    pub fn token(&self) -> Option<MutationToken> {
        match self {
            Self::Confirmed => None,
            Self::Pending { token, .. } | Self::Reverting { token, .. } => Some(*token),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry<T> {
    pub value: T,
    pub state: EntryState<T>,
}

pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Task {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for TimeSegment {
    fn key(&self) -> &str {
        &self.id
    }
}

#[derive(Debug)]
struct Entries<T> {
    map: HashMap<String, CacheEntry<T>>,
}

impl<T> Default for Entries<T> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

impl<T: Keyed + Clone> Entries<T> {
    fn apply_pending(&mut self, value: T, token: MutationToken) {
        let key = value.key().to_string();
        let previous = match self.map.remove(&key) {
            Some(CacheEntry {
                state: EntryState::Confirmed,
                value,
            }) => Some(value),
            Some(CacheEntry {
                state: EntryState::Pending { previous, .. } | EntryState::Reverting { previous, .. },
                ..
            }) => previous,
            None => None,
        };
        self.map.insert(
            key,
            CacheEntry {
                value,
                state: EntryState::Pending { token, previous },
            },
        );
    }

    fn upsert_confirmed(&mut self, value: T) {
        self.map.insert(
            value.key().to_string(),
            CacheEntry {
                value,
                state: EntryState::Confirmed,
            },
        );
    }

    /// Stores a persisted value. An entry still held by another in-flight
    /// mutation keeps its optimistic value; only its rollback snapshot advances.
    fn settle(&mut self, value: T) {
        if let Some(entry) = self.map.get_mut(value.key()) {
            if let EntryState::Pending { previous, .. } | EntryState::Reverting { previous, .. } =
                &mut entry.state
            {
                *previous = Some(value);
                return;
            }
        }
        self.upsert_confirmed(value);
    }

    fn drop_token(&mut self, token: MutationToken) {
        self.map
            .retain(|_, entry| entry.state.token() != Some(token));
    }

    fn mark_reverting(&mut self, token: MutationToken) {
        for entry in self.map.values_mut() {
            if let EntryState::Pending {
                token: entry_token,
                previous,
            } = &entry.state
            {
                if *entry_token == token {
                    entry.state = EntryState::Reverting {
                        token,
                        previous: previous.clone(),
                    };
                }
            }
        }
    }

    fn restore(&mut self, token: MutationToken) {
        let keys = self
            .map
            .iter()
            .filter(|(_, entry)| entry.state.token() == Some(token))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in keys {
            let Some(entry) = self.map.remove(&key) else {
                continue;
            };
            if let EntryState::Pending {
                previous: Some(previous),
                ..
            }
            | EntryState::Reverting {
                previous: Some(previous),
                ..
            } = entry.state
            {
                self.upsert_confirmed(previous);
            }
        }
    }

    fn has_token(&self, token: MutationToken) -> bool {
        self.map
            .values()
            .any(|entry| entry.state.token() == Some(token))
    }

    fn values(&self) -> impl Iterator<Item = &T> {
        self.map.values().map(|entry| &entry.value)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    range: Option<DateRange>,
    tasks: Entries<Task>,
    segments: Entries<TimeSegment>,
}

/// One view's local copy of tasks and segments.
///
/// Entries are only ever replaced by id. Reads skip soft-deleted records and
/// compute box membership from the cached segments on every call.
#[derive(Debug)]
pub struct ViewCache {
    label: &'static str,
    state: Mutex<CacheState>,
}

impl ViewCache {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, InfraError> {
        self.state
            .lock()
            .map_err(|_| InfraError::LockPoisoned(self.label))
    }

    pub fn range(&self) -> Result<Option<DateRange>, InfraError> {
        Ok(self.lock()?.range)
    }

    pub fn set_range(&self, range: DateRange) -> Result<(), InfraError> {
        self.lock()?.range = Some(range);
        Ok(())
    }

    /// Replaces every confirmed entry with a fresh fetch. Entries of in-flight
    /// mutations are kept so a background refresh cannot undo them.
    pub fn replace_all(
        &self,
        range: DateRange,
        tasks: Vec<Task>,
        segments: Vec<TimeSegment>,
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.range = Some(range);
        state
            .tasks
            .map
            .retain(|_, entry| entry.state != EntryState::Confirmed);
        state
            .segments
            .map
            .retain(|_, entry| entry.state != EntryState::Confirmed);
        for task in tasks {
            if !state.tasks.map.contains_key(&task.id) {
                state.tasks.upsert_confirmed(task);
            }
        }
        for segment in segments {
            if !state.segments.map.contains_key(&segment.id) {
                state.segments.upsert_confirmed(segment);
            }
        }
        Ok(())
    }

    pub fn apply_pending(
        &self,
        token: MutationToken,
        tasks: Vec<Task>,
        segments: Vec<TimeSegment>,
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        for task in tasks {
            state.tasks.apply_pending(task, token);
        }
        for segment in segments {
            state.segments.apply_pending(segment, token);
        }
        Ok(())
    }

    /// Settles a successful mutation: its pending entries give way to the persisted records.
    pub fn confirm(
        &self,
        token: MutationToken,
        tasks: Vec<Task>,
        segments: Vec<TimeSegment>,
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.tasks.drop_token(token);
        state.segments.drop_token(token);
        for task in tasks {
            state.tasks.settle(task);
        }
        for segment in segments {
            state.segments.settle(segment);
        }
        Ok(())
    }

    pub fn mark_reverting(&self, token: MutationToken) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.tasks.mark_reverting(token);
        state.segments.mark_reverting(token);
        Ok(())
    }

    /// Drops every entry of `token` and replaces the segments on `dates` wholesale.
    pub fn reconcile_dates(
        &self,
        token: MutationToken,
        dates: &BTreeSet<NaiveDate>,
        tasks: Vec<Task>,
        segments: Vec<TimeSegment>,
    ) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.tasks.drop_token(token);
        state.segments.drop_token(token);
        state.segments.map.retain(|_, entry| {
            entry.state != EntryState::Confirmed || !dates.contains(&entry.value.date)
        });
        for task in tasks {
            state.tasks.settle(task);
        }
        for segment in segments {
            state.segments.settle(segment);
        }
        Ok(())
    }

    /// Last-resort rollback to the pre-mutation snapshots.
    pub fn restore(&self, token: MutationToken) -> Result<(), InfraError> {
        let mut state = self.lock()?;
        state.tasks.restore(token);
        state.segments.restore(token);
        Ok(())
    }

    pub fn has_pending(&self, token: MutationToken) -> Result<bool, InfraError> {
        let state = self.lock()?;
        Ok(state.tasks.has_token(token) || state.segments.has_token(token))
    }

    pub fn segment_state(
        &self,
        segment_id: &str,
    ) -> Result<Option<EntryState<TimeSegment>>, InfraError> {
        Ok(self
            .lock()?
            .segments
            .map
            .get(segment_id)
            .map(|entry| entry.state.clone()))
    }

    pub fn segment(&self, segment_id: &str) -> Result<Option<TimeSegment>, InfraError> {
        Ok(self
            .lock()?
            .segments
            .map
            .get(segment_id)
            .map(|entry| entry.value.clone())
            .filter(|segment| !segment.is_deleted()))
    }

    pub fn task(&self, task_id: &str) -> Result<Option<Task>, InfraError> {
        Ok(self
            .lock()?
            .tasks
            .map
            .get(task_id)
            .map(|entry| entry.value.clone())
            .filter(|task| !task.is_deleted()))
    }

    /// Every live cached task, whatever its box dates.
    pub fn tasks(&self) -> Result<Vec<Task>, InfraError> {
        Ok(self
            .lock()?
            .tasks
            .values()
            .filter(|task| !task.is_deleted())
            .cloned()
            .collect())
    }

    /// Live segments dated within `range`, ordered by start time.
    pub fn segments_in(&self, range: &DateRange) -> Result<Vec<TimeSegment>, InfraError> {
        let state = self.lock()?;
        let mut segments = state
            .segments
            .values()
            .filter(|segment| !segment.is_deleted() && range.contains(segment.date))
            .cloned()
            .collect::<Vec<_>>();
        segments.sort_by(|left, right| {
            left.start_time
                .cmp(&right.start_time)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(segments)
    }

    /// Live tasks whose box intersects `range`.
    pub fn tasks_in(&self, range: &DateRange) -> Result<Vec<Task>, InfraError> {
        let state = self.lock()?;
        let segments = state.segments.values().collect::<Vec<_>>();
        let mut tasks = state
            .tasks
            .values()
            .filter(|task| task_in_range(task, segments.iter().copied(), range))
            .cloned()
            .collect::<Vec<_>>();
        tasks.sort_by(|left, right| {
            left.order
                .cmp(&right.order)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(tasks)
    }

    /// Live segments of one task, across every cached date.
    pub fn segments_for_task(&self, task_id: &str) -> Result<Vec<TimeSegment>, InfraError> {
        let state = self.lock()?;
        let mut segments = state
            .segments
            .values()
            .filter(|segment| segment.task_id == task_id && !segment.is_deleted())
            .cloned()
            .collect::<Vec<_>>();
        segments.sort_by_key(|segment| segment.start_time);
        Ok(segments)
    }
}
