use crate::application::events::{MutationContext, ScheduleEvent, ScheduleEventBus};
use crate::application::segment_service::MutationOutcome;
use crate::application::{NowProvider, next_id, system_now};
use crate::domain::box_dates::{resolve_box_dates, task_in_range};
use crate::domain::calendar::DateRange;
use crate::domain::error::DomainError;
use crate::domain::models::{NewTask, Task, TaskPatch, TaskStatus, validate_non_empty};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::persistence::SchedulePersistence;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Next `order` value among the live tasks sharing `parent_task_id`.
pub(crate) fn next_sibling_order(tasks: &[Task], parent_task_id: Option<&str>) -> i32 {
    tasks
        .iter()
        .filter(|task| !task.is_deleted() && task.parent_task_id.as_deref() == parent_task_id)
        .map(|task| task.order)
        .max()
        .unwrap_or(0)
        + 1
}

fn normalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    tags.iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty() && seen.insert(tag.to_string()))
        .map(ToOwned::to_owned)
        .collect()
}

fn normalize_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// The record `create` inserts for `input`, ordered after `siblings`.
pub(crate) fn task_from_input(input: &NewTask, siblings: &[Task], now: DateTime<Utc>) -> Task {
    let parent_task_id = normalize_text(input.parent_task_id.as_deref());
    Task {
        id: next_id("tsk"),
        title: input.title.trim().to_string(),
        description: normalize_text(input.description.as_deref()),
        planned_date: Some(input.planned_date),
        deadline: input.deadline,
        priority: input.priority,
        status: TaskStatus::Todo,
        estimated_minutes: input.estimated_minutes,
        scheduled_minutes: 0,
        order: next_sibling_order(siblings, parent_task_id.as_deref()),
        parent_task_id,
        tags: normalize_tags(&input.tags),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

/// Moves `task` to `position` among the live tasks sharing its parent and
/// renumbers them from 1. Returns the siblings in their new order and the ids
/// whose order changed.
pub(crate) fn reorder_siblings(
    task: Task,
    tasks: impl IntoIterator<Item = Task>,
    position: usize,
    now: DateTime<Utc>,
) -> (Vec<Task>, BTreeSet<String>) {
    let mut siblings = tasks
        .into_iter()
        .filter(|other| {
            !other.is_deleted() && other.parent_task_id == task.parent_task_id && other.id != task.id
        })
        .collect::<Vec<_>>();
    siblings.sort_by(|left, right| left.order.cmp(&right.order).then(left.id.cmp(&right.id)));
    siblings.insert(position.min(siblings.len()), task);

    let mut changed = BTreeSet::new();
    for (index, sibling) in siblings.iter_mut().enumerate() {
        let order = i32::try_from(index + 1).unwrap_or(i32::MAX);
        if sibling.order == order {
            continue;
        }
        sibling.order = order;
        sibling.updated_at = now;
        changed.insert(sibling.id.clone());
    }
    (siblings, changed)
}

pub struct TaskService<P: SchedulePersistence + ?Sized> {
    store: Arc<P>,
    events: ScheduleEventBus,
    now_provider: NowProvider,
}

impl<P: SchedulePersistence + ?Sized> TaskService<P> {
    pub fn new(store: Arc<P>, events: ScheduleEventBus) -> Self {
        Self {
            store,
            events,
            now_provider: system_now(),
        }
    }

    pub fn with_now_provider(mut self, now_provider: NowProvider) -> Self {
        self.now_provider = now_provider;
        self
    }

    pub async fn create(
        &self,
        context: &MutationContext,
        input: NewTask,
    ) -> Result<Task, InfraError> {
        validate_non_empty(&input.title, "title")?;
        let parent_task_id = normalize_text(input.parent_task_id.as_deref());
        if let Some(parent_task_id) = parent_task_id.as_deref() {
            self.get(parent_task_id).await?;
        }

        let tasks = self.store.list_tasks().await?;
        let task = task_from_input(&input, &tasks, (self.now_provider)());
        self.store.insert_task(&task).await?;

        self.events.publish(ScheduleEvent {
            origin: context.origin,
            task_ids: BTreeSet::from([task.id.clone()]),
            dates: task.planned_date.into_iter().collect(),
        });
        Ok(task)
    }

    /// Updates task fields. A title change is copied onto every segment that
    /// has no custom title.
    pub async fn update(
        &self,
        context: &MutationContext,
        task_id: &str,
        patch: TaskPatch,
    ) -> Result<MutationOutcome, InfraError> {
        let current = self.get(task_id).await?;
        let mut updated = current.clone();

        if let Some(title) = patch.title.as_deref() {
            validate_non_empty(title, "title")?;
            updated.title = title.trim().to_string();
        }
        if let Some(description) = &patch.description {
            updated.description = normalize_text(description.as_deref());
        }
        if let Some(planned_date) = patch.planned_date {
            updated.planned_date = Some(planned_date);
        }
        if let Some(deadline) = patch.deadline {
            updated.deadline = deadline;
        }
        if let Some(priority) = patch.priority {
            updated.priority = priority;
        }
        if let Some(status) = patch.status {
            updated.status = status;
        }
        if let Some(estimated_minutes) = patch.estimated_minutes {
            updated.estimated_minutes = estimated_minutes;
        }
        if let Some(tags) = &patch.tags {
            updated.tags = normalize_tags(tags);
        }
        if let Some(parent_task_id) = &patch.parent_task_id {
            let parent_task_id = normalize_text(parent_task_id.as_deref());
            if parent_task_id != current.parent_task_id {
                let tasks = self.store.list_tasks().await?;
                if let Some(parent) = parent_task_id.as_deref() {
                    ensure_acyclic(&current.id, parent, &tasks)?;
                }
                updated.order = next_sibling_order(&tasks, parent_task_id.as_deref());
                updated.parent_task_id = parent_task_id;
            }
        }
        updated.validate()?;
        updated.updated_at = (self.now_provider)();
        self.store.update_task(&updated).await?;

        let segments = self
            .store
            .list_segments_for_tasks(&[updated.id.clone()])
            .await?;
        let mut dates = resolve_box_dates(&current, &segments);
        dates.extend(resolve_box_dates(&updated, &segments));

        let mut renamed = Vec::new();
        if updated.title != current.title {
            for mut segment in segments {
                if segment.title_is_custom || segment.title == updated.title {
                    continue;
                }
                segment.title = updated.title.clone();
                segment.updated_at = updated.updated_at;
                self.store.update_segment(&segment).await?;
                renamed.push(segment);
            }
            debug!(task_id = %updated.id, segments = renamed.len(), "propagated task title");
        }

        self.events.publish(ScheduleEvent {
            origin: context.origin,
            task_ids: BTreeSet::from([updated.id.clone()]),
            dates: dates.clone(),
        });
        Ok(MutationOutcome {
            segments: renamed,
            tasks: vec![updated],
            dates,
            created: Vec::new(),
        })
    }

    /// Soft-deletes the task and every live segment it owns.
    pub async fn delete(
        &self,
        context: &MutationContext,
        task_id: &str,
    ) -> Result<MutationOutcome, InfraError> {
        let mut task = self.get(task_id).await?;
        let segments = self
            .store
            .list_segments_for_tasks(&[task.id.clone()])
            .await?;
        let dates = resolve_box_dates(&task, &segments);

        let now = (self.now_provider)();
        self.store.soft_delete_task(&task.id, now).await?;
        task.deleted_at = Some(now);
        task.updated_at = now;
        let segments = segments
            .into_iter()
            .map(|mut segment| {
                segment.deleted_at = Some(now);
                segment.updated_at = now;
                segment
            })
            .collect::<Vec<_>>();

        self.events.publish(ScheduleEvent {
            origin: context.origin,
            task_ids: BTreeSet::from([task.id.clone()]),
            dates: dates.clone(),
        });
        Ok(MutationOutcome {
            segments,
            tasks: vec![task],
            dates,
            created: Vec::new(),
        })
    }

    /// Moves a task to `position` (zero-based) among its siblings and
    /// renumbers them. Returns the siblings in their new order.
    pub async fn reorder(
        &self,
        context: &MutationContext,
        task_id: &str,
        position: usize,
    ) -> Result<Vec<Task>, InfraError> {
        let task = self.get(task_id).await?;
        let tasks = self.store.list_tasks().await?;
        let (siblings, changed) = reorder_siblings(task, tasks, position, (self.now_provider)());

        let mut dates = BTreeSet::new();
        for sibling in siblings.iter().filter(|sibling| changed.contains(&sibling.id)) {
            self.store.update_task(sibling).await?;
            dates.extend(sibling.planned_date);
        }

        if !changed.is_empty() {
            self.events.publish(ScheduleEvent {
                origin: context.origin,
                task_ids: changed,
                dates,
            });
        }
        Ok(siblings)
    }

    pub async fn list(&self) -> Result<Vec<Task>, InfraError> {
        self.store.list_tasks().await
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, InfraError> {
        validate_non_empty(task_id, "task_id")?;
        match self.store.get_task(task_id.trim()).await? {
            Some(task) if !task.is_deleted() => Ok(task),
            _ => Err(DomainError::TaskNotFound(task_id.trim().to_string()).into()),
        }
    }

    /// Live tasks whose box dates intersect `range`, resolved against the
    /// persisted segment set rather than any view cache.
    pub async fn tasks_in_range(&self, range: &DateRange) -> Result<Vec<Task>, InfraError> {
        let tasks = self.store.list_tasks().await?;
        let task_ids = tasks.iter().map(|task| task.id.clone()).collect::<Vec<_>>();
        let segments = self.store.list_segments_for_tasks(&task_ids).await?;
        Ok(tasks
            .into_iter()
            .filter(|task| task_in_range(task, &segments, range))
            .collect())
    }

    pub async fn box_dates(&self, task_id: &str) -> Result<BTreeSet<NaiveDate>, InfraError> {
        let task = self.get(task_id).await?;
        let segments = self
            .store
            .list_segments_for_tasks(&[task.id.clone()])
            .await?;
        Ok(resolve_box_dates(&task, &segments))
    }
}

fn ensure_acyclic(task_id: &str, parent_task_id: &str, tasks: &[Task]) -> Result<(), DomainError> {
    if parent_task_id == task_id {
        return Err(DomainError::SelfParent);
    }
    let by_id = tasks
        .iter()
        .map(|task| (task.id.as_str(), task))
        .collect::<HashMap<_, _>>();
    if !by_id.contains_key(parent_task_id) {
        return Err(DomainError::TaskNotFound(parent_task_id.to_string()));
    }

    let mut visited = BTreeSet::new();
    let mut cursor = Some(parent_task_id);
    while let Some(current) = cursor {
        if current == task_id {
            return Err(DomainError::ParentCycle(parent_task_id.to_string()));
        }
        if !visited.insert(current) {
            break;
        }
        cursor = by_id
            .get(current)
            .and_then(|task| task.parent_task_id.as_deref());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::events::ViewKind;
    use crate::application::segment_service::test_support::{fixed_now, seeded_store};
    use crate::domain::models::TaskPriority;
    use crate::domain::models::fixtures::{date, sample_segment};
    use crate::infrastructure::memory_store::InMemoryScheduleStore;

    fn service(store: Arc<InMemoryScheduleStore>, events: ScheduleEventBus) -> TaskService<InMemoryScheduleStore> {
        TaskService::new(store, events).with_now_provider(fixed_now())
    }

    fn context() -> MutationContext {
        MutationContext::from_view(ViewKind::Kanban)
    }

    #[tokio::test]
    async fn create_appends_after_siblings_and_normalizes_input() {
        let store = seeded_store(&["tsk-1"]).await;
        let service = service(store, ScheduleEventBus::default());

        let mut input = NewTask::titled("  Plan sprint ", date("2024-03-11"));
        input.tags = vec!["ops".to_string(), " ops ".to_string(), String::new()];
        input.description = Some("   ".to_string());
        let task = service.create(&context(), input).await.expect("create");

        assert_eq!(task.title, "Plan sprint");
        assert_eq!(task.order, 2);
        assert_eq!(task.tags, vec!["ops".to_string()]);
        assert_eq!(task.description, None);
        assert_eq!(task.priority, TaskPriority::Medium);
    }

    #[tokio::test]
    async fn create_requires_existing_parent() {
        let store = seeded_store(&[]).await;
        let service = service(store, ScheduleEventBus::default());
        let mut input = NewTask::titled("Child", date("2024-03-11"));
        input.parent_task_id = Some("tsk-missing".to_string());

        let error = service.create(&context(), input).await.expect_err("missing parent");
        assert_eq!(
            error.domain(),
            Some(&DomainError::TaskNotFound("tsk-missing".to_string()))
        );
    }

    #[tokio::test]
    async fn update_rejects_parent_cycles() {
        let store = seeded_store(&["tsk-a", "tsk-b"]).await;
        let service = service(store, ScheduleEventBus::default());
        service
            .update(
                &context(),
                "tsk-b",
                TaskPatch {
                    parent_task_id: Some(Some("tsk-a".to_string())),
                    ..TaskPatch::default()
                },
            )
            .await
            .expect("nest b under a");

        let error = service
            .update(
                &context(),
                "tsk-a",
                TaskPatch {
                    parent_task_id: Some(Some("tsk-b".to_string())),
                    ..TaskPatch::default()
                },
            )
            .await
            .expect_err("cycle");
        assert_eq!(error.domain(), Some(&DomainError::ParentCycle("tsk-b".to_string())));

        let error = service
            .update(
                &context(),
                "tsk-a",
                TaskPatch {
                    parent_task_id: Some(Some("tsk-a".to_string())),
                    ..TaskPatch::default()
                },
            )
            .await
            .expect_err("self parent");
        assert_eq!(error.domain(), Some(&DomainError::SelfParent));
    }

    #[tokio::test]
    async fn title_change_reaches_only_non_custom_segments() {
        let store = seeded_store(&["tsk-1"]).await;
        store
            .insert_segment(&sample_segment("seg-1", "tsk-1", "2024-03-10T09:00:00Z", "2024-03-10T10:00:00Z"))
            .await
            .expect("seed segment");
        let mut custom = sample_segment("seg-2", "tsk-1", "2024-03-10T11:00:00Z", "2024-03-10T12:00:00Z");
        custom.title = "Pairing".to_string();
        custom.title_is_custom = true;
        store.insert_segment(&custom).await.expect("seed custom");
        let service = service(store.clone(), ScheduleEventBus::default());

        let outcome = service
            .update(
                &context(),
                "tsk-1",
                TaskPatch {
                    title: Some("Write more tests".to_string()),
                    ..TaskPatch::default()
                },
            )
            .await
            .expect("rename");

        assert_eq!(outcome.segments.len(), 1);
        let plain = store.get_segment("seg-1").await.expect("get").expect("seg-1");
        let kept = store.get_segment("seg-2").await.expect("get").expect("seg-2");
        assert_eq!(plain.title, "Write more tests");
        assert_eq!(kept.title, "Pairing");
    }

    #[tokio::test]
    async fn delete_cascades_and_publishes_box_dates() {
        let store = seeded_store(&["tsk-1"]).await;
        store
            .insert_segment(&sample_segment("seg-1", "tsk-1", "2024-03-12T09:00:00Z", "2024-03-12T10:00:00Z"))
            .await
            .expect("seed segment");
        let events = ScheduleEventBus::default();
        let mut receiver = events.subscribe();
        let service = service(store.clone(), events);

        let outcome = service.delete(&context(), "tsk-1").await.expect("delete");

        assert!(outcome.segments.iter().all(|segment| segment.is_deleted()));
        assert!(store.list_tasks().await.expect("tasks").is_empty());
        assert!(store.get_segment("seg-1").await.expect("get").expect("row").is_deleted());
        let event = receiver.recv().await.expect("event");
        assert_eq!(event.dates, BTreeSet::from([date("2024-03-12")]));
        assert!(service.delete(&context(), "tsk-1").await.is_err());
    }

    #[tokio::test]
    async fn reorder_moves_task_among_siblings() {
        let store = seeded_store(&[]).await;
        let service = service(store, ScheduleEventBus::default());
        let mut ids = Vec::new();
        for title in ["first", "second", "third"] {
            let task = service
                .create(&context(), NewTask::titled(title, date("2024-03-10")))
                .await
                .expect("create");
            ids.push(task.id);
        }

        let ordered = service.reorder(&context(), &ids[2], 0).await.expect("reorder");
        let titles = ordered.iter().map(|task| task.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["third", "first", "second"]);
        let orders = ordered.iter().map(|task| task.order).collect::<Vec<_>>();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn range_listing_uses_segment_dates_over_planned_date() {
        let store = seeded_store(&["tsk-1", "tsk-2"]).await;
        store
            .insert_segment(&sample_segment("seg-1", "tsk-1", "2024-03-12T09:00:00Z", "2024-03-12T10:00:00Z"))
            .await
            .expect("seed segment");
        let service = service(store, ScheduleEventBus::default());

        let planned_day = service
            .tasks_in_range(&DateRange::single(date("2024-03-10")))
            .await
            .expect("planned day");
        assert_eq!(
            planned_day.iter().map(|task| task.id.as_str()).collect::<Vec<_>>(),
            vec!["tsk-2"]
        );

        let segment_day = service
            .tasks_in_range(&DateRange::single(date("2024-03-12")))
            .await
            .expect("segment day");
        assert_eq!(
            segment_day.iter().map(|task| task.id.as_str()).collect::<Vec<_>>(),
            vec!["tsk-1"]
        );
        assert_eq!(
            service.box_dates("tsk-1").await.expect("box"),
            BTreeSet::from([date("2024-03-12")])
        );
    }
}
