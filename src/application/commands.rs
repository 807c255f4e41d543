use crate::application::bootstrap::bootstrap_workspace;
use crate::application::events::{MutationContext, ScheduleEventBus, ViewKind};
use crate::application::segment_service::{CustomEvent, MutationOutcome, SegmentService};
use crate::application::task_service::TaskService;
use crate::application::view_sync::{CrossViewSynchronizer, RetryPolicy, ScheduleMutation};
use crate::domain::calendar::{DateRange, LocalCalendar};
use crate::domain::drag::{
    DragController, DragMode, SegmentPlacement, resolve_calendar_resize,
};
use crate::domain::error::DomainError;
use crate::domain::models::{
    NewSegment, NewTask, SegmentPatch, SegmentSource, Task, TaskPatch, TaskStatus, TimeSegment,
};
use crate::domain::overlap::overlap_pairs;
use crate::infrastructure::config::{ConfigBundle, PersistenceBackend, PersistenceConfig};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::http_store::HttpScheduleStore;
use crate::infrastructure::persistence::SchedulePersistence;
use crate::infrastructure::sqlite_store::SqliteScheduleStore;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const REVERTED_MESSAGE: &str = "changes were reverted";

type Store = dyn SchedulePersistence;

pub struct AppState {
    workspace_root: PathBuf,
    database_path: PathBuf,
    configs: ConfigBundle,
    calendar: LocalCalendar,
    sync: Arc<CrossViewSynchronizer<Store>>,
    drag: Mutex<DragController>,
    refreshers: Vec<JoinHandle<()>>,
}

impl AppState {
    /// Bootstraps the workspace, opens the configured store and starts one
    /// background refresher per view. Must be called inside a tokio runtime.
    pub async fn open(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let calendar = bootstrap.configs.app.calendar()?;
        let store = open_store(
            &bootstrap.configs.app.persistence,
            &bootstrap.database_path,
            calendar,
        )?;
        Self::with_store(
            bootstrap.workspace_root,
            bootstrap.database_path,
            bootstrap.configs,
            store,
        )
        .await
    }

    pub async fn with_store(
        workspace_root: PathBuf,
        database_path: PathBuf,
        configs: ConfigBundle,
        store: Arc<Store>,
    ) -> Result<Self, InfraError> {
        let calendar = configs.app.calendar()?;
        let scheduling = &configs.scheduling;
        let events = ScheduleEventBus::default();
        let segments = Arc::new(
            SegmentService::new(Arc::clone(&store), events.clone(), calendar)
                .with_duplicate_offset_minutes(scheduling.duplicate_offset_minutes),
        );
        let tasks = Arc::new(TaskService::new(Arc::clone(&store), events.clone()));
        let sync = Arc::new(CrossViewSynchronizer::new(store, segments, tasks));

        let today = calendar.local_date(Utc::now());
        let initial_ranges = [
            (ViewKind::Timeline, DateRange::single(today)),
            (ViewKind::Calendar, DateRange::week_of(today)),
            (
                ViewKind::Kanban,
                DateRange::spanning(today, scheduling.views.kanban_range_days),
            ),
        ];
        for (view, range) in initial_ranges {
            if let Err(error) = sync.set_range(view, range).await {
                warn!(view = view.as_str(), error = %error, "initial view load failed");
            }
        }
        let refreshers = sync.spawn_refreshers(&events, RetryPolicy::from(scheduling.retry));
        let drag = DragController::new(
            scheduling.geometry(f64::from(24 * 60)),
            scheduling.snap_settings(),
            calendar,
        );

        Ok(Self {
            workspace_root,
            database_path,
            calendar,
            sync,
            drag: Mutex::new(drag),
            refreshers,
            configs,
        })
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn configs(&self) -> &ConfigBundle {
        &self.configs
    }

    pub fn calendar(&self) -> &LocalCalendar {
        &self.calendar
    }

    /// User-facing message for a failed read.
    pub fn command_error(&self, command: &str, error: &InfraError) -> String {
        error!(command, error = %error, "command failed");
        error.to_string()
    }

    /// User-facing message for a failed write. Validation problems keep their
    /// message; anything else has already been rolled back in the views.
    pub fn mutation_error(&self, command: &str, error: &InfraError) -> String {
        error!(command, error = %error, "mutation failed");
        match error.domain() {
            Some(domain) => domain.to_string(),
            None => REVERTED_MESSAGE.to_string(),
        }
    }

    fn lock_drag(&self) -> Result<MutexGuard<'_, DragController>, InfraError> {
        self.drag
            .lock()
            .map_err(|_| InfraError::LockPoisoned("drag controller"))
    }
}

impl Drop for AppState {
    fn drop(&mut self) {
        for handle in &self.refreshers {
            handle.abort();
        }
    }
}

fn open_store(
    persistence: &PersistenceConfig,
    database_path: &Path,
    calendar: LocalCalendar,
) -> Result<Arc<Store>, InfraError> {
    match persistence.backend {
        PersistenceBackend::Sqlite => Ok(Arc::new(SqliteScheduleStore::new(database_path, calendar))),
        PersistenceBackend::Http => {
            let base_url = persistence.base_url.as_deref().ok_or_else(|| {
                InfraError::InvalidConfig("persistence.baseUrl is required for http".to_string())
            })?;
            Ok(Arc::new(HttpScheduleStore::new(
                base_url,
                persistence.session_token.clone(),
                calendar,
            )?))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverlapPair {
    pub first_segment_id: String,
    pub second_segment_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySchedule {
    pub date: NaiveDate,
    pub segments: Vec<TimeSegment>,
    pub overlaps: Vec<OverlapPair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KanbanColumn {
    pub status: TaskStatus,
    pub tasks: Vec<Task>,
}

fn mutation_context(view: Option<&str>) -> Result<MutationContext, InfraError> {
    Ok(match view {
        Some(view) => MutationContext::from_view(ViewKind::parse(view)?),
        None => MutationContext::default(),
    })
}

fn parse_rfc3339_input(value: &str, field_name: &'static str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| {
            DomainError::invalid(field_name, format!("must be RFC3339 date-time: {error}")).into()
        })
}

fn parse_date_input(value: &str, field_name: &'static str) -> Result<NaiveDate, InfraError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| DomainError::invalid(field_name, "must be YYYY-MM-DD").into())
}

fn primary_segment(outcome: &MutationOutcome, segment_id: &str) -> Result<TimeSegment, InfraError> {
    outcome
        .segment(segment_id)
        .cloned()
        .ok_or_else(|| DomainError::SegmentNotFound(segment_id.to_string()).into())
}

fn created_segment(outcome: &MutationOutcome) -> Result<TimeSegment, InfraError> {
    outcome
        .created_segments()
        .first()
        .map(|segment| (*segment).clone())
        .ok_or_else(|| InfraError::InvalidRecord("mutation created no segment".to_string()))
}

fn day_schedule(date: NaiveDate, segments: Vec<TimeSegment>) -> DaySchedule {
    let overlaps = overlap_pairs(&segments)
        .into_iter()
        .map(|(first, second)| OverlapPair {
            first_segment_id: first.id.clone(),
            second_segment_id: second.id.clone(),
        })
        .collect();
    DaySchedule {
        date,
        segments,
        overlaps,
    }
}

pub async fn create_task_impl(
    state: &AppState,
    view: Option<String>,
    input: NewTask,
) -> Result<Task, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let outcome = state
        .sync
        .apply(&context, ScheduleMutation::CreateTask(input))
        .await?;
    let task = outcome
        .tasks
        .into_iter()
        .next()
        .ok_or_else(|| InfraError::InvalidRecord("task was not created".to_string()))?;
    info!(command = "create_task", task_id = %task.id, "created task");
    Ok(task)
}

pub async fn list_tasks_impl(state: &AppState) -> Result<Vec<Task>, InfraError> {
    state.sync.tasks().list().await
}

pub async fn update_task_impl(
    state: &AppState,
    view: Option<String>,
    task_id: String,
    patch: TaskPatch,
) -> Result<Task, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let outcome = state
        .sync
        .apply(
            &context,
            ScheduleMutation::UpdateTask {
                task_id: task_id.clone(),
                patch,
            },
        )
        .await?;
    info!(command = "update_task", task_id = %task_id, renamed_segments = outcome.segments.len(), "updated task");
    outcome
        .task(task_id.trim())
        .cloned()
        .ok_or_else(|| DomainError::TaskNotFound(task_id).into())
}

pub async fn delete_task_impl(
    state: &AppState,
    view: Option<String>,
    task_id: String,
) -> Result<bool, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let outcome = state
        .sync
        .apply(&context, ScheduleMutation::DeleteTask { task_id: task_id.clone() })
        .await?;
    info!(command = "delete_task", task_id = %task_id, segments = outcome.segments.len(), "deleted task");
    Ok(true)
}

pub async fn reorder_task_impl(
    state: &AppState,
    view: Option<String>,
    task_id: String,
    position: usize,
) -> Result<Vec<Task>, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let outcome = state
        .sync
        .apply(&context, ScheduleMutation::ReorderTask { task_id, position })
        .await?;
    Ok(outcome.tasks)
}

pub async fn task_box_dates_impl(
    state: &AppState,
    task_id: String,
) -> Result<Vec<NaiveDate>, InfraError> {
    Ok(state.sync.tasks().box_dates(&task_id).await?.into_iter().collect())
}

pub async fn create_segment_impl(
    state: &AppState,
    view: Option<String>,
    task_id: String,
    start_time: String,
    end_time: String,
    title: Option<String>,
) -> Result<TimeSegment, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let mut input = NewSegment::for_task(
        task_id,
        parse_rfc3339_input(&start_time, "start_time")?,
        parse_rfc3339_input(&end_time, "end_time")?,
        SegmentSource::App,
    );
    input.title = title;
    let outcome = state
        .sync
        .apply(&context, ScheduleMutation::CreateSegment(input))
        .await?;
    let segment = created_segment(&outcome)?;
    info!(command = "create_segment", segment_id = %segment.id, task_id = %segment.task_id, "created segment");
    Ok(segment)
}

pub async fn update_segment_impl(
    state: &AppState,
    view: Option<String>,
    segment_id: String,
    patch: SegmentPatch,
) -> Result<TimeSegment, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let outcome = state
        .sync
        .apply(
            &context,
            ScheduleMutation::UpdateSegment {
                segment_id: segment_id.clone(),
                patch,
            },
        )
        .await?;
    let segment = primary_segment(&outcome, segment_id.trim())?;
    info!(command = "update_segment", segment_id = %segment.id, task_id = %segment.task_id, "updated segment");
    Ok(segment)
}

pub async fn delete_segment_impl(
    state: &AppState,
    view: Option<String>,
    segment_id: String,
) -> Result<bool, InfraError> {
    let context = mutation_context(view.as_deref())?;
    state
        .sync
        .apply(
            &context,
            ScheduleMutation::DeleteSegment {
                segment_id: segment_id.clone(),
            },
        )
        .await?;
    info!(command = "delete_segment", segment_id = %segment_id, "deleted segment");
    Ok(true)
}

pub async fn duplicate_segment_impl(
    state: &AppState,
    view: Option<String>,
    segment_id: String,
) -> Result<TimeSegment, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let outcome = state
        .sync
        .apply(
            &context,
            ScheduleMutation::DuplicateSegment {
                segment_id: segment_id.clone(),
            },
        )
        .await?;
    let copy = created_segment(&outcome)?;
    info!(command = "duplicate_segment", segment_id = %segment_id, copy_id = %copy.id, "duplicated segment");
    Ok(copy)
}

pub async fn split_segment_impl(
    state: &AppState,
    view: Option<String>,
    segment_id: String,
) -> Result<Vec<TimeSegment>, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let outcome = state
        .sync
        .apply(
            &context,
            ScheduleMutation::SplitSegment {
                segment_id: segment_id.clone(),
            },
        )
        .await?;
    let mut halves = outcome
        .created_segments()
        .into_iter()
        .cloned()
        .collect::<Vec<_>>();
    halves.sort_by_key(|segment| segment.start_time);
    info!(command = "split_segment", segment_id = %segment_id, "split segment");
    Ok(halves)
}

pub async fn bulk_update_segments_impl(
    state: &AppState,
    view: Option<String>,
    segment_ids: Vec<String>,
    patch: SegmentPatch,
) -> Result<Vec<TimeSegment>, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let outcome = state
        .sync
        .apply(
            &context,
            ScheduleMutation::BulkUpdateSegments {
                segment_ids: segment_ids.clone(),
                patch,
            },
        )
        .await?;
    let updated = segment_ids
        .iter()
        .filter_map(|segment_id| outcome.segment(segment_id.trim()).cloned())
        .collect::<Vec<_>>();
    info!(command = "bulk_update_segments", count = updated.len(), "updated segments");
    Ok(updated)
}

pub async fn bulk_delete_segments_impl(
    state: &AppState,
    view: Option<String>,
    segment_ids: Vec<String>,
) -> Result<usize, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let outcome = state
        .sync
        .apply(&context, ScheduleMutation::BulkDeleteSegments { segment_ids })
        .await?;
    let deleted = outcome
        .segments
        .iter()
        .filter(|segment| segment.is_deleted())
        .count();
    info!(command = "bulk_delete_segments", count = deleted, "deleted segments");
    Ok(deleted)
}

pub async fn create_custom_event_impl(
    state: &AppState,
    view: Option<String>,
    title: String,
    start_time: String,
    end_time: String,
    task_id: Option<String>,
) -> Result<TimeSegment, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let event = CustomEvent {
        title,
        start_time: parse_rfc3339_input(&start_time, "start_time")?,
        end_time: parse_rfc3339_input(&end_time, "end_time")?,
        task_id,
    };
    let outcome = state
        .sync
        .apply(&context, ScheduleMutation::CreateCustomEvent(event))
        .await?;
    let segment = created_segment(&outcome)?;
    info!(command = "create_custom_event", segment_id = %segment.id, task_id = %segment.task_id, "created calendar event");
    Ok(segment)
}

/// Replaces the task-form segments of a task with `intervals`
/// (pairs of RFC 3339 start/end).
pub async fn reschedule_task_impl(
    state: &AppState,
    view: Option<String>,
    task_id: String,
    intervals: Vec<(String, String)>,
) -> Result<Vec<TimeSegment>, InfraError> {
    let context = mutation_context(view.as_deref())?;
    let intervals = intervals
        .iter()
        .map(|(start, end)| {
            Ok((
                parse_rfc3339_input(start, "start_time")?,
                parse_rfc3339_input(end, "end_time")?,
            ))
        })
        .collect::<Result<Vec<_>, InfraError>>()?;
    let outcome = state
        .sync
        .apply(
            &context,
            ScheduleMutation::ReplaceTaskSegments {
                task_id: task_id.clone(),
                flow: SegmentSource::Task,
                intervals,
            },
        )
        .await?;
    info!(command = "reschedule_task", task_id = %task_id, created = outcome.created.len(), "rescheduled task");
    Ok(outcome.created_segments().into_iter().cloned().collect())
}

/// Other live segments on the same day that intersect `segment_id`.
pub async fn segment_overlaps_impl(
    state: &AppState,
    segment_id: String,
) -> Result<Vec<TimeSegment>, InfraError> {
    let overlaps = state.sync.segments().overlaps(&segment_id).await?;
    if !overlaps.is_empty() {
        info!(command = "segment_overlaps", segment_id = %segment_id, count = overlaps.len(), "overlap warning");
    }
    Ok(overlaps)
}

pub fn drag_start_impl(
    state: &AppState,
    pointer_id: u64,
    pointer_x: f64,
    segment_id: String,
    segment_left_px: f64,
    segment_right_px: f64,
    timeline_width_px: f64,
) -> Result<Option<DragMode>, InfraError> {
    let segment = state
        .sync
        .cache(ViewKind::Timeline)
        .segment(segment_id.trim())?
        .ok_or_else(|| DomainError::SegmentNotFound(segment_id.trim().to_string()))?;
    let mut drag = state.lock_drag()?;
    drag.set_geometry(state.configs.scheduling.geometry(timeline_width_px));
    Ok(drag.pointer_down(pointer_id, pointer_x, &segment, segment_left_px, segment_right_px))
}

pub fn drag_move_impl(
    state: &AppState,
    pointer_id: u64,
    pointer_x: f64,
    precise: bool,
) -> Result<Option<SegmentPlacement>, InfraError> {
    Ok(state.lock_drag()?.pointer_move(pointer_id, pointer_x, precise))
}

/// Commits the drag through the timeline. Returns `None` when the pointer
/// was not captured or the segment did not move.
pub async fn drag_end_impl(
    state: &AppState,
    pointer_id: u64,
) -> Result<Option<TimeSegment>, InfraError> {
    let commit = state.lock_drag()?.pointer_up(pointer_id);
    let Some(commit) = commit else {
        return Ok(None);
    };
    if !commit.changed() {
        return Ok(None);
    }
    let patch = SegmentPatch::times(commit.start, commit.end);
    update_segment_impl(
        state,
        Some(ViewKind::Timeline.as_str().to_string()),
        commit.segment_id,
        patch,
    )
    .await
    .map(Some)
}

pub fn drag_cancel_impl(
    state: &AppState,
    pointer_id: u64,
) -> Result<Option<SegmentPlacement>, InfraError> {
    Ok(state.lock_drag()?.pointer_cancel(pointer_id))
}

/// Applies a calendar resize that reports both edges at once.
pub async fn calendar_resize_impl(
    state: &AppState,
    segment_id: String,
    proposed_start: String,
    proposed_end: String,
) -> Result<TimeSegment, InfraError> {
    let segment = state.sync.segments().live_segment(&segment_id).await?;
    let (edge, start, end) = resolve_calendar_resize(
        &segment,
        parse_rfc3339_input(&proposed_start, "start_time")?,
        parse_rfc3339_input(&proposed_end, "end_time")?,
        &state.configs.scheduling.snap_settings(),
        &state.calendar,
    );
    info!(command = "calendar_resize", segment_id = %segment.id, edge = ?edge, "resolved resize edge");
    update_segment_impl(
        state,
        Some(ViewKind::Calendar.as_str().to_string()),
        segment.id,
        SegmentPatch::times(start, end),
    )
    .await
}

pub async fn set_view_range_impl(
    state: &AppState,
    view: String,
    start_date: String,
    end_date: String,
) -> Result<DateRange, InfraError> {
    let view = ViewKind::parse(&view)?;
    let range = DateRange::new(
        parse_date_input(&start_date, "start_date")?,
        parse_date_input(&end_date, "end_date")?,
    )?;
    state.sync.set_range(view, range).await?;
    info!(command = "set_view_range", view = view.as_str(), start = %range.start, end = %range.end, "view range changed");
    Ok(range)
}

async fn ensure_visible(state: &AppState, view: ViewKind, range: DateRange) -> Result<(), InfraError> {
    let cache = state.sync.cache(view);
    let covered = cache
        .range()?
        .is_some_and(|current| current.contains(range.start) && current.contains(range.end));
    if !covered {
        state.sync.set_range(view, range).await?;
    }
    Ok(())
}

pub async fn timeline_day_impl(state: &AppState, date: String) -> Result<DaySchedule, InfraError> {
    let date = parse_date_input(&date, "date")?;
    let range = DateRange::single(date);
    ensure_visible(state, ViewKind::Timeline, range).await?;
    let segments = state.sync.cache(ViewKind::Timeline).segments_in(&range)?;
    Ok(day_schedule(date, segments))
}

pub async fn calendar_days_impl(
    state: &AppState,
    start_date: String,
    end_date: String,
) -> Result<Vec<DaySchedule>, InfraError> {
    let range = DateRange::new(
        parse_date_input(&start_date, "start_date")?,
        parse_date_input(&end_date, "end_date")?,
    )?;
    ensure_visible(state, ViewKind::Calendar, range).await?;
    let cache = state.sync.cache(ViewKind::Calendar);
    range
        .days()
        .map(|date| Ok(day_schedule(date, cache.segments_in(&DateRange::single(date))?)))
        .collect()
}

pub fn kanban_columns_impl(state: &AppState) -> Result<Vec<KanbanColumn>, InfraError> {
    let cache = state.sync.cache(ViewKind::Kanban);
    let Some(range) = cache.range()? else {
        return Ok(Vec::new());
    };
    let tasks = cache.tasks_in(&range)?;
    Ok([TaskStatus::Todo, TaskStatus::InProgress, TaskStatus::Completed]
        .into_iter()
        .map(|status| KanbanColumn {
            status,
            tasks: tasks
                .iter()
                .filter(|task| task.status == status)
                .cloned()
                .collect(),
        })
        .collect())
}
