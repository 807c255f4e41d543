use crate::application::events::{MutationContext, ScheduleEvent, ScheduleEventBus};
use crate::application::task_service::next_sibling_order;
use crate::application::{NowProvider, next_id, system_now};
use crate::domain::calendar::{DateRange, LocalCalendar};
use crate::domain::error::DomainError;
use crate::domain::models::{
    NewSegment, SegmentPatch, SegmentSource, SegmentStatus, Task, TaskPriority, TaskStatus,
    TimeSegment, validate_non_empty,
};
use crate::domain::overlap::find_overlaps;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::persistence::SchedulePersistence;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

pub const DEFAULT_DUPLICATE_OFFSET_MINUTES: i64 = 60;

/// Every record a mutation wrote, as persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    /// Created, updated, re-sequenced and soft-deleted segments.
    pub segments: Vec<TimeSegment>,
    /// Owning tasks after their aggregate was recomputed.
    pub tasks: Vec<Task>,
    /// Dates whose segment lists changed, before and after the mutation.
    pub dates: BTreeSet<NaiveDate>,
    /// Ids of the segments this mutation created.
    pub created: Vec<String>,
}

impl MutationOutcome {
    pub fn segment(&self, segment_id: &str) -> Option<&TimeSegment> {
        self.segments.iter().find(|segment| segment.id == segment_id)
    }

    pub fn created_segments(&self) -> Vec<&TimeSegment> {
        self.created
            .iter()
            .filter_map(|segment_id| self.segment(segment_id))
            .collect()
    }

    pub fn live_segments(&self) -> impl Iterator<Item = &TimeSegment> {
        self.segments.iter().filter(|segment| !segment.is_deleted())
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == task_id)
    }

    pub fn task_ids(&self) -> BTreeSet<String> {
        self.tasks
            .iter()
            .map(|task| task.id.clone())
            .chain(self.segments.iter().map(|segment| segment.task_id.clone()))
            .collect()
    }
}

/// A calendar-surface event, optionally linked to an existing task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomEvent {
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub task_id: Option<String>,
}

#[derive(Debug, Default)]
struct Touched {
    segments: BTreeMap<String, TimeSegment>,
    created: Vec<String>,
    task_ids: BTreeSet<String>,
    dates: BTreeSet<NaiveDate>,
    days: BTreeSet<(String, NaiveDate)>,
}

impl Touched {
    fn segment(&mut self, segment: TimeSegment) {
        self.task_ids.insert(segment.task_id.clone());
        self.dates.insert(segment.date);
        self.days.insert((segment.task_id.clone(), segment.date));
        self.segments.insert(segment.id.clone(), segment);
    }

    fn created(&mut self, segment: TimeSegment) {
        self.created.push(segment.id.clone());
        self.segment(segment);
    }

    fn moved(&mut self, previous: &TimeSegment, updated: TimeSegment) {
        self.task_ids.insert(previous.task_id.clone());
        self.dates.insert(previous.date);
        self.days.insert((previous.task_id.clone(), previous.date));
        self.segment(updated);
    }
}

/// One planned store write, carrying what is needed to undo it.
#[derive(Debug)]
enum SegmentWrite {
    Insert(TimeSegment),
    Update {
        previous: TimeSegment,
        updated: TimeSegment,
    },
    SoftDelete(TimeSegment),
}

impl SegmentWrite {
    fn task_ids(&self) -> impl Iterator<Item = &str> {
        let (first, second) = match self {
            Self::Insert(segment) | Self::SoftDelete(segment) => (segment, None),
            Self::Update { previous, updated } => (previous, Some(updated)),
        };
        std::iter::once(first.task_id.as_str()).chain(second.map(|segment| segment.task_id.as_str()))
    }

    fn record(self, touched: &mut Touched, now: DateTime<Utc>) {
        match self {
            Self::Insert(segment) => touched.created(segment),
            Self::Update { previous, updated } => touched.moved(&previous, updated),
            Self::SoftDelete(segment) => touched.segment(soft_deleted(segment, now)),
        }
    }
}

/// Validated segment writes followed by session re-sequencing, aggregate
/// recompute and a change event, in that order.
pub struct SegmentService<P: SchedulePersistence + ?Sized> {
    store: Arc<P>,
    events: ScheduleEventBus,
    calendar: LocalCalendar,
    duplicate_offset: Duration,
    now_provider: NowProvider,
}

impl<P: SchedulePersistence + ?Sized> SegmentService<P> {
    pub fn new(store: Arc<P>, events: ScheduleEventBus, calendar: LocalCalendar) -> Self {
        Self {
            store,
            events,
            calendar,
            duplicate_offset: Duration::minutes(DEFAULT_DUPLICATE_OFFSET_MINUTES),
            now_provider: system_now(),
        }
    }

    pub fn with_duplicate_offset_minutes(mut self, minutes: i64) -> Self {
        self.duplicate_offset = Duration::minutes(minutes);
        self
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn calendar(&self) -> &LocalCalendar {
        &self.calendar
    }

    pub async fn create(
        &self,
        context: &MutationContext,
        input: NewSegment,
    ) -> Result<MutationOutcome, InfraError> {
        let segment = self.prepare_new(&input).await?;
        let mut touched = Touched::default();
        self.write_all(vec![SegmentWrite::Insert(segment)], &mut touched)
            .await?;
        self.finish(context, touched).await
    }

    pub async fn update(
        &self,
        context: &MutationContext,
        segment_id: &str,
        patch: SegmentPatch,
    ) -> Result<MutationOutcome, InfraError> {
        let current = self.live_segment(segment_id).await?;
        let updated = self.prepare_update(&current, &patch).await?;
        let mut touched = Touched::default();
        let write = SegmentWrite::Update {
            previous: current,
            updated,
        };
        self.write_all(vec![write], &mut touched).await?;
        self.finish(context, touched).await
    }

    pub async fn delete(
        &self,
        context: &MutationContext,
        segment_id: &str,
    ) -> Result<MutationOutcome, InfraError> {
        let current = self.live_segment(segment_id).await?;
        let mut touched = Touched::default();
        self.write_all(vec![SegmentWrite::SoftDelete(current)], &mut touched)
            .await?;
        self.finish(context, touched).await
    }

    /// Copies the segment shifted by the configured offset onto the same task.
    pub async fn duplicate(
        &self,
        context: &MutationContext,
        segment_id: &str,
    ) -> Result<MutationOutcome, InfraError> {
        let source = self.live_segment(segment_id).await?;
        let copy = self.duplicate_of(&source, (self.now_provider)())?;
        let mut touched = Touched::default();
        self.write_all(vec![SegmentWrite::Insert(copy)], &mut touched)
            .await?;
        self.finish(context, touched).await
    }

    /// Replaces a segment with two contiguous halves; the first half gets the
    /// rounded-down half of the minutes. A failed write leaves the original in place.
    pub async fn split(
        &self,
        context: &MutationContext,
        segment_id: &str,
    ) -> Result<MutationOutcome, InfraError> {
        let original = self.live_segment(segment_id).await?;
        let (first, second) = self.split_halves(&original, (self.now_provider)())?;

        let writes = vec![
            SegmentWrite::Insert(first),
            SegmentWrite::Insert(second),
            SegmentWrite::SoftDelete(original),
        ];
        let mut touched = Touched::default();
        self.write_all(writes, &mut touched).await?;
        self.finish(context, touched).await
    }

    /// Applies one patch to every id. Nothing is written unless every item validates.
    pub async fn bulk_update(
        &self,
        context: &MutationContext,
        segment_ids: &[String],
        patch: SegmentPatch,
    ) -> Result<MutationOutcome, InfraError> {
        let mut writes = Vec::new();
        for segment_id in distinct_ids(segment_ids)? {
            let previous = self.live_segment(&segment_id).await?;
            let updated = self.prepare_update(&previous, &patch).await?;
            writes.push(SegmentWrite::Update { previous, updated });
        }

        let mut touched = Touched::default();
        self.write_all(writes, &mut touched).await?;
        self.finish(context, touched).await
    }

    pub async fn bulk_delete(
        &self,
        context: &MutationContext,
        segment_ids: &[String],
    ) -> Result<MutationOutcome, InfraError> {
        let mut writes = Vec::new();
        for segment_id in distinct_ids(segment_ids)? {
            writes.push(SegmentWrite::SoftDelete(self.live_segment(&segment_id).await?));
        }

        let mut touched = Touched::default();
        self.write_all(writes, &mut touched).await?;
        self.finish(context, touched).await
    }

    /// Creates a segment for a calendar event. An event without a task gets a
    /// minimal backing task so every segment keeps a valid owner.
    pub async fn create_custom_event(
        &self,
        context: &MutationContext,
        event: CustomEvent,
    ) -> Result<MutationOutcome, InfraError> {
        validate_non_empty(&event.title, "title")?;
        let title = event.title.trim().to_string();
        let date = self
            .calendar
            .validate_interval(event.start_time, event.end_time)?;

        let linked_task_id = event
            .task_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned);
        let (mut input, backing_task_id) = match linked_task_id {
            Some(task_id) => {
                let mut input = NewSegment::for_task(
                    task_id,
                    event.start_time,
                    event.end_time,
                    SegmentSource::App,
                );
                input.title = Some(title);
                (input, None)
            }
            None => {
                let task = self.new_backing_task(&title, date).await?;
                self.store.insert_task(&task).await?;
                debug!(task_id = %task.id, "created backing task for calendar event");
                let input = NewSegment::for_task(
                    task.id.clone(),
                    event.start_time,
                    event.end_time,
                    SegmentSource::App,
                );
                (input, Some(task.id))
            }
        };
        input.status = Some(SegmentStatus::Planned);
        let result = self.create(context, input).await;
        if let (Err(_), Some(task_id)) = (&result, backing_task_id) {
            let now = (self.now_provider)();
            if let Err(error) = self.store.soft_delete_task(&task_id, now).await {
                warn!(task_id = %task_id, error = %error, "could not remove backing task");
            }
        }
        result
    }

    /// Reschedules a task from its edit form: segments the `flow` owns are
    /// replaced by `intervals`, segments owned by other subsystems are kept.
    pub async fn replace_task_segments(
        &self,
        context: &MutationContext,
        task_id: &str,
        flow: SegmentSource,
        intervals: &[(DateTime<Utc>, DateTime<Utc>)],
    ) -> Result<MutationOutcome, InfraError> {
        let task = self.live_task(task_id).await?;
        let replacements =
            self.replacement_segments(&task.id, &task.title, flow, intervals, (self.now_provider)())?;
        let removable = self
            .store
            .list_segments_for_tasks(&[task.id.clone()])
            .await?
            .into_iter()
            .filter(|segment| segment.source.removable_by(flow))
            .collect::<Vec<_>>();

        let writes = replacements
            .into_iter()
            .map(SegmentWrite::Insert)
            .chain(removable.into_iter().map(SegmentWrite::SoftDelete))
            .collect();
        let mut touched = Touched::default();
        touched.task_ids.insert(task.id.clone());
        self.write_all(writes, &mut touched).await?;
        self.finish(context, touched).await
    }

    pub async fn day_segments(&self, date: NaiveDate) -> Result<Vec<TimeSegment>, InfraError> {
        self.store.list_segments(&DateRange::single(date)).await
    }

    /// Segments sharing the day of `segment_id` whose intervals intersect it.
    pub async fn overlaps(&self, segment_id: &str) -> Result<Vec<TimeSegment>, InfraError> {
        let candidate = self.live_segment(segment_id).await?;
        let day = self.day_segments(candidate.date).await?;
        Ok(find_overlaps(&candidate, &day).into_iter().cloned().collect())
    }

    pub async fn live_segment(&self, segment_id: &str) -> Result<TimeSegment, InfraError> {
        validate_non_empty(segment_id, "segment_id")?;
        match self.store.get_segment(segment_id.trim()).await? {
            Some(segment) if !segment.is_deleted() => Ok(segment),
            _ => Err(DomainError::SegmentNotFound(segment_id.trim().to_string()).into()),
        }
    }

    async fn live_task(&self, task_id: &str) -> Result<Task, InfraError> {
        validate_non_empty(task_id, "task_id")?;
        match self.store.get_task(task_id.trim()).await? {
            Some(task) if !task.is_deleted() => Ok(task),
            _ => Err(DomainError::TaskNotFound(task_id.trim().to_string()).into()),
        }
    }

    async fn prepare_new(&self, input: &NewSegment) -> Result<TimeSegment, InfraError> {
        input.required_times()?;
        let task = self.live_task(&input.task_id).await?;
        Ok(self.preview_new(&task.title, input, (self.now_provider)())?)
    }

    /// The segment `create` would insert for `input` under a task titled `task_title`.
    pub(crate) fn preview_new(
        &self,
        task_title: &str,
        input: &NewSegment,
        now: DateTime<Utc>,
    ) -> Result<TimeSegment, DomainError> {
        let (start, end) = input.required_times()?;
        self.build_segment(input.task_id.trim(), task_title, input, start, end, now)
    }

    pub(crate) fn duplicate_of(
        &self,
        source: &TimeSegment,
        now: DateTime<Utc>,
    ) -> Result<TimeSegment, DomainError> {
        self.derived_copy(
            source,
            source.start_time + self.duplicate_offset,
            source.end_time + self.duplicate_offset,
            now,
        )
    }

    pub(crate) fn split_halves(
        &self,
        original: &TimeSegment,
        now: DateTime<Utc>,
    ) -> Result<(TimeSegment, TimeSegment), DomainError> {
        if original.duration_minutes < 2 {
            return Err(DomainError::SegmentTooShort(original.duration_minutes));
        }
        let midpoint = original.start_time + Duration::minutes(original.duration_minutes / 2);
        Ok((
            self.derived_copy(original, original.start_time, midpoint, now)?,
            self.derived_copy(original, midpoint, original.end_time, now)?,
        ))
    }

    pub(crate) fn replacement_segments(
        &self,
        task_id: &str,
        task_title: &str,
        flow: SegmentSource,
        intervals: &[(DateTime<Utc>, DateTime<Utc>)],
        now: DateTime<Utc>,
    ) -> Result<Vec<TimeSegment>, DomainError> {
        intervals
            .iter()
            .map(|(start, end)| {
                let mut input = NewSegment::for_task(task_id, *start, *end, flow);
                input.status = Some(SegmentStatus::Planned);
                self.build_segment(task_id, task_title, &input, *start, *end, now)
            })
            .collect()
    }

    fn build_segment(
        &self,
        task_id: &str,
        task_title: &str,
        input: &NewSegment,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TimeSegment, DomainError> {
        let custom_title = input
            .title
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let mut segment = TimeSegment {
            id: next_id("seg"),
            task_id: task_id.to_string(),
            start_time: start,
            end_time: end,
            date: self.calendar.local_date(start),
            duration_minutes: 0,
            title: custom_title.unwrap_or(task_title).to_string(),
            title_is_custom: custom_title.is_some(),
            status: input.status.unwrap_or(SegmentStatus::Planned),
            order: 1,
            source: input.source,
            external_id: input.external_id.clone(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        segment.set_times(start, end, &self.calendar)?;
        Ok(segment)
    }

    async fn prepare_update(
        &self,
        current: &TimeSegment,
        patch: &SegmentPatch,
    ) -> Result<TimeSegment, InfraError> {
        let target_task_id = match patch.task_id.as_deref() {
            Some(task_id) => {
                validate_non_empty(task_id, "segment.task_id")?;
                task_id.trim()
            }
            None => current.task_id.as_str(),
        };
        let task = self.live_task(target_task_id).await?;
        let mut updated = patch.apply(current, Some(&task.title), &self.calendar)?;
        updated.updated_at = (self.now_provider)();
        Ok(updated)
    }

    fn derived_copy(
        &self,
        source: &TimeSegment,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TimeSegment, DomainError> {
        let mut copy = source.clone();
        copy.id = next_id("seg");
        copy.external_id = None;
        if copy.source == SegmentSource::Google {
            copy.source = SegmentSource::App;
        }
        copy.created_at = now;
        copy.updated_at = now;
        copy.set_times(start, end, &self.calendar)?;
        Ok(copy)
    }

    async fn new_backing_task(&self, title: &str, date: NaiveDate) -> Result<Task, InfraError> {
        let siblings = self.store.list_tasks().await?;
        Ok(backing_task(title, date, &siblings, (self.now_provider)()))
    }

    /// Applies `writes` in order. When one fails, the writes already applied
    /// are undone and the aggregates of every involved task are recomputed
    /// before the error is returned.
    async fn write_all(
        &self,
        writes: Vec<SegmentWrite>,
        touched: &mut Touched,
    ) -> Result<(), InfraError> {
        let now = (self.now_provider)();
        let mut applied = Vec::with_capacity(writes.len());
        for write in writes {
            let result = match &write {
                SegmentWrite::Insert(segment) => self.store.insert_segment(segment).await,
                SegmentWrite::Update { updated, .. } => self.store.update_segment(updated).await,
                SegmentWrite::SoftDelete(segment) => {
                    self.store.soft_delete_segment(&segment.id, now).await
                }
            };
            if let Err(error) = result {
                let task_ids = applied
                    .iter()
                    .chain(std::iter::once(&write))
                    .flat_map(|planned| planned.task_ids())
                    .chain(touched.task_ids.iter().map(String::as_str))
                    .map(ToOwned::to_owned)
                    .collect::<BTreeSet<_>>();
                if !applied.is_empty() {
                    warn!(applied = applied.len(), error = %error, "segment write failed, undoing earlier writes");
                    self.roll_back(applied, now).await;
                }
                self.recompute_after_failure(&task_ids).await;
                return Err(error);
            }
            applied.push(write);
        }
        for write in applied {
            write.record(touched, now);
        }
        Ok(())
    }

    async fn roll_back(&self, applied: Vec<SegmentWrite>, now: DateTime<Utc>) {
        for write in applied.into_iter().rev() {
            let result = match &write {
                SegmentWrite::Insert(segment) => {
                    self.store.soft_delete_segment(&segment.id, now).await
                }
                SegmentWrite::Update { previous, .. } => self.store.update_segment(previous).await,
                SegmentWrite::SoftDelete(segment) => self.store.update_segment(segment).await,
            };
            if let Err(error) = result {
                warn!(error = %error, "could not undo segment write");
            }
        }
    }

    async fn recompute_after_failure(&self, task_ids: &BTreeSet<String>) {
        for task_id in task_ids {
            if let Err(error) = self.store.recompute_scheduled_minutes(task_id).await {
                warn!(task_id = %task_id, error = %error, "could not recompute scheduled time");
            }
        }
    }

    /// Renumbers "Session N" by start time for one task on one day.
    async fn resequence(
        &self,
        task_id: &str,
        date: NaiveDate,
        touched: &mut Touched,
    ) -> Result<(), InfraError> {
        let day = self
            .store
            .list_segments(&DateRange::single(date))
            .await?
            .into_iter()
            .filter(|segment| segment.task_id == task_id);
        for (index, mut segment) in day.enumerate() {
            let order = u32::try_from(index + 1).unwrap_or(u32::MAX);
            if segment.order == order {
                continue;
            }
            segment.order = order;
            segment.updated_at = (self.now_provider)();
            self.store.update_segment(&segment).await?;
            touched.segment(segment);
        }
        Ok(())
    }

    async fn finish(
        &self,
        context: &MutationContext,
        mut touched: Touched,
    ) -> Result<MutationOutcome, InfraError> {
        let mut tasks = Vec::new();
        for task_id in &touched.task_ids {
            let total = self.store.recompute_scheduled_minutes(task_id).await?;
            debug!(task_id = %task_id, scheduled_minutes = total, "recomputed scheduled time");
            if let Some(task) = self.store.get_task(task_id).await? {
                tasks.push(task);
            }
        }

        let days = std::mem::take(&mut touched.days);
        for (task_id, date) in days {
            self.resequence(&task_id, date, &mut touched).await?;
        }

        let outcome = MutationOutcome {
            segments: touched.segments.into_values().collect(),
            tasks,
            dates: touched.dates,
            created: touched.created,
        };
        self.events.publish(ScheduleEvent {
            origin: context.origin,
            task_ids: outcome.task_ids(),
            dates: outcome.dates.clone(),
        });
        Ok(outcome)
    }
}

/// Owner for a calendar event created without a task.
pub(crate) fn backing_task(title: &str, date: NaiveDate, siblings: &[Task], now: DateTime<Utc>) -> Task {
    Task {
        id: next_id("tsk"),
        title: title.to_string(),
        description: None,
        planned_date: Some(date),
        deadline: None,
        priority: TaskPriority::Medium,
        status: TaskStatus::Todo,
        estimated_minutes: None,
        scheduled_minutes: 0,
        parent_task_id: None,
        order: next_sibling_order(siblings, None),
        tags: Vec::new(),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

fn soft_deleted(mut segment: TimeSegment, now: DateTime<Utc>) -> TimeSegment {
    segment.deleted_at = Some(now);
    segment.updated_at = now;
    segment
}

fn distinct_ids(segment_ids: &[String]) -> Result<Vec<String>, DomainError> {
    let mut seen = BTreeSet::new();
    let ids = segment_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.to_string()))
        .map(ToOwned::to_owned)
        .collect::<Vec<_>>();
    if ids.is_empty() {
        return Err(DomainError::MissingField { field: "segment_ids" });
    }
    Ok(ids)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::domain::models::fixtures::{fixed_time, sample_task};
    use crate::infrastructure::memory_store::InMemoryScheduleStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Delegates to the in-memory store with switchable failures.
    #[derive(Default)]
    pub struct FlakyStore {
        pub inner: InMemoryScheduleStore,
        pub fail_writes: AtomicBool,
        /// Counts writes down; the write that reaches zero fails.
        pub fail_nth_write: AtomicUsize,
        pub failing_reads: AtomicUsize,
        /// While set, segment inserts wait for `release`.
        pub hold_inserts: AtomicBool,
        pub release: Notify,
    }

    impl FlakyStore {
        fn read_failure(&self) -> Result<(), InfraError> {
            let remaining = self.failing_reads.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_reads.store(remaining - 1, Ordering::SeqCst);
                return Err(InfraError::Http("connection reset".to_string()));
            }
            Ok(())
        }

        fn write_failure(&self) -> Result<(), InfraError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(InfraError::Http("status 503: unavailable".to_string()));
            }
            let countdown = self.fail_nth_write.load(Ordering::SeqCst);
            if countdown > 0 {
                self.fail_nth_write.store(countdown - 1, Ordering::SeqCst);
                if countdown == 1 {
                    return Err(InfraError::Http("connection reset".to_string()));
                }
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SchedulePersistence for FlakyStore {
        async fn get_task(&self, task_id: &str) -> Result<Option<Task>, InfraError> {
            self.inner.get_task(task_id).await
        }

        async fn list_tasks(&self) -> Result<Vec<Task>, InfraError> {
            self.read_failure()?;
            self.inner.list_tasks().await
        }

        async fn insert_task(&self, task: &Task) -> Result<(), InfraError> {
            self.write_failure()?;
            self.inner.insert_task(task).await
        }

        async fn update_task(&self, task: &Task) -> Result<(), InfraError> {
            self.write_failure()?;
            self.inner.update_task(task).await
        }

        async fn soft_delete_task(
            &self,
            task_id: &str,
            deleted_at: DateTime<Utc>,
        ) -> Result<(), InfraError> {
            self.write_failure()?;
            self.inner.soft_delete_task(task_id, deleted_at).await
        }

        async fn get_segment(&self, segment_id: &str) -> Result<Option<TimeSegment>, InfraError> {
            self.inner.get_segment(segment_id).await
        }

        async fn list_segments(&self, range: &DateRange) -> Result<Vec<TimeSegment>, InfraError> {
            self.read_failure()?;
            self.inner.list_segments(range).await
        }

        async fn list_segments_for_tasks(
            &self,
            task_ids: &[String],
        ) -> Result<Vec<TimeSegment>, InfraError> {
            self.inner.list_segments_for_tasks(task_ids).await
        }

        async fn insert_segment(&self, segment: &TimeSegment) -> Result<(), InfraError> {
            if self.hold_inserts.load(Ordering::SeqCst) {
                self.release.notified().await;
            }
            self.write_failure()?;
            self.inner.insert_segment(segment).await
        }

        async fn update_segment(&self, segment: &TimeSegment) -> Result<(), InfraError> {
            self.write_failure()?;
            self.inner.update_segment(segment).await
        }

        async fn soft_delete_segment(
            &self,
            segment_id: &str,
            deleted_at: DateTime<Utc>,
        ) -> Result<(), InfraError> {
            self.write_failure()?;
            self.inner.soft_delete_segment(segment_id, deleted_at).await
        }

        async fn recompute_scheduled_minutes(&self, task_id: &str) -> Result<i64, InfraError> {
            self.inner.recompute_scheduled_minutes(task_id).await
        }
    }

    pub fn fixed_now() -> NowProvider {
        Arc::new(|| fixed_time("2024-03-09T12:00:00Z"))
    }

    pub async fn seeded_store(task_ids: &[&str]) -> Arc<InMemoryScheduleStore> {
        let store = Arc::new(InMemoryScheduleStore::default());
        for task_id in task_ids {
            store
                .insert_task(&sample_task(task_id))
                .await
                .expect("seed task");
        }
        store
    }

    pub fn service(
        store: Arc<InMemoryScheduleStore>,
        events: ScheduleEventBus,
    ) -> SegmentService<InMemoryScheduleStore> {
        SegmentService::new(store, events, LocalCalendar::default()).with_now_provider(fixed_now())
    }
}
