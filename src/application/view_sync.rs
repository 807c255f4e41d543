use crate::application::events::{MutationContext, ScheduleEvent, ScheduleEventBus, ViewKind};
use crate::application::segment_service::{
    CustomEvent, MutationOutcome, SegmentService, backing_task,
};
use crate::application::task_service::{TaskService, reorder_siblings, task_from_input};
use crate::application::{NowProvider, system_now};
use crate::domain::calendar::{DateRange, LocalCalendar};
use crate::domain::models::{
    NewSegment, NewTask, SegmentPatch, SegmentSource, SegmentStatus, Task, TaskPatch, TimeSegment,
};
use crate::infrastructure::config::RetryConfig;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::persistence::SchedulePersistence;
use crate::infrastructure::view_cache::ViewCache;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Duration as TokioDuration, sleep};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_ms: config.base_delay_ms,
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> TokioDuration {
        TokioDuration::from_millis(
            self.base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt)),
        )
    }
}

fn should_retry(error: &InfraError) -> bool {
    !matches!(error, InfraError::Domain(_) | InfraError::InvalidConfig(_))
}

/// A write issued by one view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleMutation {
    CreateSegment(NewSegment),
    UpdateSegment {
        segment_id: String,
        patch: SegmentPatch,
    },
    DeleteSegment {
        segment_id: String,
    },
    DuplicateSegment {
        segment_id: String,
    },
    SplitSegment {
        segment_id: String,
    },
    BulkUpdateSegments {
        segment_ids: Vec<String>,
        patch: SegmentPatch,
    },
    BulkDeleteSegments {
        segment_ids: Vec<String>,
    },
    CreateCustomEvent(CustomEvent),
    ReplaceTaskSegments {
        task_id: String,
        flow: SegmentSource,
        intervals: Vec<(DateTime<Utc>, DateTime<Utc>)>,
    },
    CreateTask(NewTask),
    UpdateTask {
        task_id: String,
        patch: TaskPatch,
    },
    DeleteTask {
        task_id: String,
    },
    ReorderTask {
        task_id: String,
        position: usize,
    },
}

impl ScheduleMutation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSegment(_) => "create_segment",
            Self::UpdateSegment { .. } => "update_segment",
            Self::DeleteSegment { .. } => "delete_segment",
            Self::DuplicateSegment { .. } => "duplicate_segment",
            Self::SplitSegment { .. } => "split_segment",
            Self::BulkUpdateSegments { .. } => "bulk_update_segments",
            Self::BulkDeleteSegments { .. } => "bulk_delete_segments",
            Self::CreateCustomEvent(_) => "create_custom_event",
            Self::ReplaceTaskSegments { .. } => "replace_task_segments",
            Self::CreateTask(_) => "create_task",
            Self::UpdateTask { .. } => "update_task",
            Self::DeleteTask { .. } => "delete_task",
            Self::ReorderTask { .. } => "reorder_task",
        }
    }
}

#[derive(Debug, Default)]
struct OptimisticDelta {
    tasks: Vec<Task>,
    segments: Vec<TimeSegment>,
    dates: BTreeSet<NaiveDate>,
}

impl OptimisticDelta {
    fn segment(&mut self, previous: &TimeSegment, predicted: TimeSegment) {
        self.dates.insert(previous.date);
        self.dates.insert(predicted.date);
        self.segments.push(predicted);
    }

    /// A record the store has not assigned yet. It lives only under the
    /// mutation's token and disappears when that token settles.
    fn created(&mut self, predicted: TimeSegment) {
        self.dates.insert(predicted.date);
        self.segments.push(predicted);
    }

    fn task_ids(&self) -> BTreeSet<String> {
        self.tasks
            .iter()
            .map(|task| task.id.clone())
            .chain(self.segments.iter().map(|segment| segment.task_id.clone()))
            .collect()
    }
}

#[derive(Debug)]
pub struct ViewCaches {
    timeline: Arc<ViewCache>,
    calendar: Arc<ViewCache>,
    kanban: Arc<ViewCache>,
}

impl Default for ViewCaches {
    fn default() -> Self {
        Self {
            timeline: Arc::new(ViewCache::new(ViewKind::Timeline.as_str())),
            calendar: Arc::new(ViewCache::new(ViewKind::Calendar.as_str())),
            kanban: Arc::new(ViewCache::new(ViewKind::Kanban.as_str())),
        }
    }
}

impl ViewCaches {
    pub fn get(&self, view: ViewKind) -> &Arc<ViewCache> {
        match view {
            ViewKind::Timeline => &self.timeline,
            ViewKind::Calendar => &self.calendar,
            ViewKind::Kanban => &self.kanban,
        }
    }
}

/// Keeps the timeline, calendar and kanban caches consistent around writes.
///
/// The acting view sees its change immediately as a pending entry. The
/// other views catch up through [`ViewRefresher`] once the store has
/// accepted the write. A rejected write is rolled back by re-reading the
/// affected dates, or from the saved snapshots if that read fails too.
pub struct CrossViewSynchronizer<P: SchedulePersistence + ?Sized> {
    store: Arc<P>,
    segments: Arc<SegmentService<P>>,
    tasks: Arc<TaskService<P>>,
    caches: ViewCaches,
    calendar: LocalCalendar,
    next_token: AtomicU64,
    now_provider: NowProvider,
}

impl<P: SchedulePersistence + ?Sized> CrossViewSynchronizer<P> {
    pub fn new(
        store: Arc<P>,
        segments: Arc<SegmentService<P>>,
        tasks: Arc<TaskService<P>>,
    ) -> Self {
        let calendar = segments.calendar().clone();
        Self {
            store,
            segments,
            tasks,
            caches: ViewCaches::default(),
            calendar,
            next_token: AtomicU64::new(1),
            now_provider: system_now(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub fn cache(&self, view: ViewKind) -> &Arc<ViewCache> {
        self.caches.get(view)
    }

    pub fn segments(&self) -> &SegmentService<P> {
        &self.segments
    }

    pub fn tasks(&self) -> &TaskService<P> {
        &self.tasks
    }

    pub async fn set_range(&self, view: ViewKind, range: DateRange) -> Result<(), InfraError> {
        self.cache(view).set_range(range)?;
        self.refresh(view).await
    }

    /// Reloads the view's visible range from the store.
    pub async fn refresh(&self, view: ViewKind) -> Result<(), InfraError> {
        let cache = self.cache(view);
        let Some(range) = cache.range()? else {
            return Ok(());
        };
        let tasks = self.tasks.tasks_in_range(&range).await?;
        let segments = self.store.list_segments(&range).await?;
        debug!(
            view = view.as_str(),
            tasks = tasks.len(),
            segments = segments.len(),
            "refreshed view"
        );
        cache.replace_all(range, tasks, segments)
    }

    pub async fn apply(
        &self,
        context: &MutationContext,
        mutation: ScheduleMutation,
    ) -> Result<MutationOutcome, InfraError> {
        let Some(origin) = context.origin else {
            return self.execute(context, mutation).await;
        };
        let cache = self.cache(origin);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let delta = self.predict(cache, &mutation)?;
        let task_ids = delta.task_ids();
        let dates = delta.dates.clone();
        cache.apply_pending(token, delta.tasks, delta.segments)?;

        let name = mutation.name();
        match self.execute(context, mutation).await {
            Ok(outcome) => {
                cache.confirm(token, outcome.tasks.clone(), outcome.segments.clone())?;
                Ok(outcome)
            }
            Err(error) => {
                warn!(
                    view = origin.as_str(),
                    command = name,
                    error = %error,
                    "mutation failed, reverting view"
                );
                self.revert(cache, token, &dates, &task_ids).await;
                Err(error)
            }
        }
    }

    pub fn spawn_refreshers(
        self: &Arc<Self>,
        bus: &ScheduleEventBus,
        retry: RetryPolicy,
    ) -> Vec<JoinHandle<()>>
    where
        P: 'static,
    {
        ViewKind::ALL
            .into_iter()
            .map(|view| {
                let refresher = ViewRefresher {
                    view,
                    synchronizer: Arc::clone(self),
                    retry,
                };
                tokio::spawn(refresher.run(bus.subscribe()))
            })
            .collect()
    }

    async fn revert(
        &self,
        cache: &ViewCache,
        token: u64,
        dates: &BTreeSet<NaiveDate>,
        task_ids: &BTreeSet<String>,
    ) {
        if let Err(error) = cache.mark_reverting(token) {
            warn!(view = cache.label(), error = %error, "could not mark entries as reverting");
        }
        let result = match self.fetch_affected(dates, task_ids).await {
            Ok((tasks, segments)) => cache.reconcile_dates(token, dates, tasks, segments),
            Err(error) => {
                warn!(view = cache.label(), error = %error, "re-fetch failed, restoring snapshot");
                cache.restore(token)
            }
        };
        if let Err(error) = result {
            warn!(view = cache.label(), error = %error, "could not revert view");
        }
    }

    async fn fetch_affected(
        &self,
        dates: &BTreeSet<NaiveDate>,
        task_ids: &BTreeSet<String>,
    ) -> Result<(Vec<Task>, Vec<TimeSegment>), InfraError> {
        let mut tasks = Vec::new();
        for task_id in task_ids {
            if let Some(task) = self.store.get_task(task_id).await? {
                tasks.push(task);
            }
        }

        let (Some(first), Some(last)) = (dates.first(), dates.last()) else {
            return Ok((tasks, Vec::new()));
        };
        let segments = self
            .store
            .list_segments(&DateRange::new(*first, *last)?)
            .await?
            .into_iter()
            .filter(|segment| dates.contains(&segment.date))
            .collect();
        Ok((tasks, segments))
    }

    fn predict(
        &self,
        cache: &ViewCache,
        mutation: &ScheduleMutation,
    ) -> Result<OptimisticDelta, InfraError> {
        let now = (self.now_provider)();
        let mut delta = OptimisticDelta::default();
        match mutation {
            ScheduleMutation::UpdateSegment { segment_id, patch } => {
                self.predict_segment_update(cache, segment_id, patch, &mut delta)?;
            }
            ScheduleMutation::BulkUpdateSegments { segment_ids, patch } => {
                for segment_id in segment_ids {
                    self.predict_segment_update(cache, segment_id, patch, &mut delta)?;
                }
            }
            ScheduleMutation::DeleteSegment { segment_id } => {
                if let Some(segment) = cache.segment(segment_id)? {
                    delta.segment(&segment, deleted_segment(&segment, now));
                }
            }
            ScheduleMutation::CreateSegment(input) => {
                let title = cached_title(cache, &input.task_id)?;
                if let Ok(segment) = self.segments.preview_new(&title, input, now) {
                    delta.created(segment);
                }
            }
            ScheduleMutation::DuplicateSegment { segment_id } => {
                if let Some(source) = cache.segment(segment_id)? {
                    if let Ok(copy) = self.segments.duplicate_of(&source, now) {
                        delta.created(copy);
                    }
                }
            }
            ScheduleMutation::SplitSegment { segment_id } => {
                if let Some(original) = cache.segment(segment_id)? {
                    if let Ok((first, second)) = self.segments.split_halves(&original, now) {
                        delta.segment(&original, deleted_segment(&original, now));
                        delta.created(first);
                        delta.created(second);
                    }
                }
            }
            ScheduleMutation::CreateCustomEvent(event) => {
                self.predict_custom_event(cache, event, now, &mut delta)?;
            }
            ScheduleMutation::ReplaceTaskSegments {
                task_id,
                flow,
                intervals,
            } => {
                let title = cached_title(cache, task_id)?;
                if let Ok(replacements) =
                    self.segments
                        .replacement_segments(task_id.trim(), &title, *flow, intervals, now)
                {
                    for segment in cache.segments_for_task(task_id.trim())? {
                        if segment.source.removable_by(*flow) {
                            delta.segment(&segment, deleted_segment(&segment, now));
                        }
                    }
                    for segment in replacements {
                        delta.created(segment);
                    }
                }
            }
            ScheduleMutation::CreateTask(input) => {
                if !input.title.trim().is_empty() {
                    delta.dates.insert(input.planned_date);
                    delta.tasks.push(task_from_input(input, &cache.tasks()?, now));
                }
            }
            ScheduleMutation::ReorderTask { task_id, position } => {
                if let Some(task) = cache.task(task_id)? {
                    let (siblings, changed) =
                        reorder_siblings(task, cache.tasks()?, *position, now);
                    for sibling in siblings {
                        if changed.contains(&sibling.id) {
                            delta.dates.extend(sibling.planned_date);
                            delta.tasks.push(sibling);
                        }
                    }
                }
            }
            ScheduleMutation::BulkDeleteSegments { segment_ids } => {
                for segment_id in segment_ids {
                    if let Some(segment) = cache.segment(segment_id)? {
                        delta.segment(&segment, deleted_segment(&segment, now));
                    }
                }
            }
            ScheduleMutation::UpdateTask { task_id, patch } => {
                if let Some(task) = cache.task(task_id)? {
                    let predicted = predict_task(&task, patch);
                    if predicted.title != task.title {
                        for segment in cache.segments_for_task(task_id)? {
                            if !segment.title_is_custom {
                                let mut renamed = segment.clone();
                                renamed.title = predicted.title.clone();
                                delta.segment(&segment, renamed);
                            }
                        }
                    }
                    delta.dates.extend(task.planned_date);
                    delta.dates.extend(predicted.planned_date);
                    delta.tasks.push(predicted);
                }
            }
            ScheduleMutation::DeleteTask { task_id } => {
                if let Some(mut task) = cache.task(task_id)? {
                    for segment in cache.segments_for_task(task_id)? {
                        delta.segment(&segment, deleted_segment(&segment, now));
                    }
                    delta.dates.extend(task.planned_date);
                    task.deleted_at = Some(now);
                    delta.tasks.push(task);
                }
            }
        }
        Ok(delta)
    }

    fn predict_custom_event(
        &self,
        cache: &ViewCache,
        event: &CustomEvent,
        now: DateTime<Utc>,
        delta: &mut OptimisticDelta,
    ) -> Result<(), InfraError> {
        let title = event.title.trim();
        let Ok(date) = self.calendar.validate_interval(event.start_time, event.end_time) else {
            return Ok(());
        };
        if title.is_empty() {
            return Ok(());
        }
        let linked_task_id = event
            .task_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let mut input = match linked_task_id {
            Some(task_id) => {
                let mut input =
                    NewSegment::for_task(task_id, event.start_time, event.end_time, SegmentSource::App);
                input.title = Some(title.to_string());
                input
            }
            None => {
                let task = backing_task(title, date, &cache.tasks()?, now);
                let input = NewSegment::for_task(
                    task.id.clone(),
                    event.start_time,
                    event.end_time,
                    SegmentSource::App,
                );
                delta.tasks.push(task);
                input
            }
        };
        input.status = Some(SegmentStatus::Planned);
        if let Ok(segment) = self.segments.preview_new(title, &input, now) {
            delta.created(segment);
        }
        Ok(())
    }

    fn predict_segment_update(
        &self,
        cache: &ViewCache,
        segment_id: &str,
        patch: &SegmentPatch,
        delta: &mut OptimisticDelta,
    ) -> Result<(), InfraError> {
        let Some(segment) = cache.segment(segment_id)? else {
            return Ok(());
        };
        let task_id = patch.task_id.as_deref().unwrap_or(&segment.task_id);
        let task_title = cache.task(task_id)?.map(|task| task.title);
        // Invalid patches are left for the service to reject.
        if let Ok(predicted) = patch.apply(&segment, task_title.as_deref(), &self.calendar) {
            delta.segment(&segment, predicted);
        }
        Ok(())
    }

    async fn execute(
        &self,
        context: &MutationContext,
        mutation: ScheduleMutation,
    ) -> Result<MutationOutcome, InfraError> {
        match mutation {
            ScheduleMutation::CreateSegment(input) => self.segments.create(context, input).await,
            ScheduleMutation::UpdateSegment { segment_id, patch } => {
                self.segments.update(context, &segment_id, patch).await
            }
            ScheduleMutation::DeleteSegment { segment_id } => {
                self.segments.delete(context, &segment_id).await
            }
            ScheduleMutation::DuplicateSegment { segment_id } => {
                self.segments.duplicate(context, &segment_id).await
            }
            ScheduleMutation::SplitSegment { segment_id } => {
                self.segments.split(context, &segment_id).await
            }
            ScheduleMutation::BulkUpdateSegments { segment_ids, patch } => {
                self.segments.bulk_update(context, &segment_ids, patch).await
            }
            ScheduleMutation::BulkDeleteSegments { segment_ids } => {
                self.segments.bulk_delete(context, &segment_ids).await
            }
            ScheduleMutation::CreateCustomEvent(event) => {
                self.segments.create_custom_event(context, event).await
            }
            ScheduleMutation::ReplaceTaskSegments {
                task_id,
                flow,
                intervals,
            } => {
                self.segments
                    .replace_task_segments(context, &task_id, flow, &intervals)
                    .await
            }
            ScheduleMutation::CreateTask(input) => {
                let task = self.tasks.create(context, input).await?;
                Ok(MutationOutcome {
                    dates: task.planned_date.into_iter().collect(),
                    tasks: vec![task],
                    ..MutationOutcome::default()
                })
            }
            ScheduleMutation::UpdateTask { task_id, patch } => {
                self.tasks.update(context, &task_id, patch).await
            }
            ScheduleMutation::DeleteTask { task_id } => self.tasks.delete(context, &task_id).await,
            ScheduleMutation::ReorderTask { task_id, position } => {
                let tasks = self.tasks.reorder(context, &task_id, position).await?;
                Ok(MutationOutcome {
                    tasks,
                    ..MutationOutcome::default()
                })
            }
        }
    }
}

fn cached_title(cache: &ViewCache, task_id: &str) -> Result<String, InfraError> {
    Ok(cache
        .task(task_id.trim())?
        .map(|task| task.title)
        .unwrap_or_default())
}

fn deleted_segment(segment: &TimeSegment, now: DateTime<Utc>) -> TimeSegment {
    let mut deleted = segment.clone();
    deleted.deleted_at = Some(now);
    deleted
}

fn predict_task(task: &Task, patch: &TaskPatch) -> Task {
    let mut predicted = task.clone();
    if let Some(title) = patch.title.as_deref().map(str::trim).filter(|title| !title.is_empty()) {
        predicted.title = title.to_string();
    }
    if let Some(planned_date) = patch.planned_date {
        predicted.planned_date = Some(planned_date);
    }
    if let Some(deadline) = patch.deadline {
        predicted.deadline = deadline;
    }
    if let Some(priority) = patch.priority {
        predicted.priority = priority;
    }
    if let Some(status) = patch.status {
        predicted.status = status;
    }
    predicted
}

/// Background listener that reloads one view when another view changed data
/// it shows.
pub struct ViewRefresher<P: SchedulePersistence + ?Sized> {
    view: ViewKind,
    synchronizer: Arc<CrossViewSynchronizer<P>>,
    retry: RetryPolicy,
}

impl<P: SchedulePersistence + ?Sized> ViewRefresher<P> {
    pub async fn run(self, mut receiver: broadcast::Receiver<ScheduleEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) if event.origin == Some(self.view) => {}
                Ok(event) => match self.concerns(&event) {
                    Ok(true) => self.refresh_with_retry().await,
                    Ok(false) => {}
                    Err(error) => {
                        warn!(view = self.view.as_str(), error = %error, "could not read view cache");
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    info!(view = self.view.as_str(), skipped, "event receiver lagged, full refresh");
                    self.refresh_with_retry().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn concerns(&self, event: &ScheduleEvent) -> Result<bool, InfraError> {
        let cache = self.synchronizer.cache(self.view);
        let Some(range) = cache.range()? else {
            return Ok(false);
        };
        if event.dates.is_empty() || range.intersects(event.dates.iter()) {
            return Ok(true);
        }
        for task_id in &event.task_ids {
            if cache.task(task_id)?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn refresh_with_retry(&self) {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            match self.synchronizer.refresh(self.view).await {
                Ok(()) => return,
                Err(error) if should_retry(&error) && attempt + 1 < max_attempts => {
                    sleep(self.retry.delay(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(error) => {
                    warn!(
                        view = self.view.as_str(),
                        attempts = attempt + 1,
                        error = %error,
                        "background refresh failed"
                    );
                    return;
                }
            }
        }
    }
}
