use crate::domain::calendar::{DateRange, LocalCalendar};
use crate::domain::error::DomainError;
use crate::domain::models::{Task, TimeSegment};
use crate::infrastructure::error::{InfraError, translate_constraint_message};
use crate::infrastructure::persistence::SchedulePersistence;
use crate::infrastructure::wire::{SegmentRow, TaskRow, format_date};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

const TASKS: &str = "tasks";
const SEGMENTS: &str = "time_segments";

/// Remote persistence API speaking the `tasks` / `time_segments` row format.
///
/// The server recomputes `scheduled_time` on every segment write; the client
/// still checks the sum and overrides it when the two disagree.
#[derive(Debug, Clone)]
pub struct HttpScheduleStore {
    client: Client,
    base_url: Url,
    session_token: Option<String>,
    calendar: LocalCalendar,
}

impl HttpScheduleStore {
    pub fn new(
        base_url: &str,
        session_token: Option<String>,
        calendar: LocalCalendar,
    ) -> Result<Self, InfraError> {
        let mut base_url = Url::parse(base_url.trim())
            .map_err(|error| InfraError::InvalidConfig(format!("invalid persistence base url: {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(InfraError::InvalidConfig(
                "persistence base url cannot be a base".to_string(),
            ));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            client: Client::new(),
            base_url,
            session_token: session_token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty()),
            calendar,
        })
    }

    fn endpoint(&self, collection: &str, id: Option<&str>) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| InfraError::InvalidConfig("persistence base url cannot be a base".to_string()))?;
            segments.pop_if_empty();
            segments.push(collection);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, action: &str) -> Result<(StatusCode, String), InfraError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|error| InfraError::Http(format!("network error while {action}: {error}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Http(format!("failed reading response while {action}: {error}")))?;
        Ok((status, body))
    }

    async fn send_ok(&self, request: RequestBuilder, action: &str) -> Result<String, InfraError> {
        let (status, body) = self.send(request, action).await?;
        if !status.is_success() {
            return Err(status_error(status, &body, action));
        }
        Ok(body)
    }

    async fn fetch_optional<T: DeserializeOwned>(
        &self,
        url: Url,
        action: &str,
    ) -> Result<Option<T>, InfraError> {
        let (status, body) = self.send(self.client.get(url), action).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(status_error(status, &body, action));
        }
        decode(&body, action).map(Some)
    }

    async fn fetch_segments(
        &self,
        query: &[(&str, String)],
        action: &str,
    ) -> Result<Vec<TimeSegment>, InfraError> {
        let url = self.endpoint(SEGMENTS, None)?;
        let body = self
            .send_ok(self.client.get(url).query(query), action)
            .await?;
        let rows: Vec<SegmentRow> = decode(&body, action)?;
        let mut segments = rows
            .into_iter()
            .map(SegmentRow::into_segment)
            .collect::<Result<Vec<_>, _>>()?;
        segments.retain(|segment| !segment.is_deleted());
        segments.sort_by(|left, right| {
            left.start_time
                .cmp(&right.start_time)
                .then_with(|| left.id.cmp(&right.id))
        });
        Ok(segments)
    }

    async fn patch(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
        action: &str,
    ) -> Result<(), InfraError> {
        let url = self.endpoint(collection, Some(id))?;
        let (status, response) = self.send(self.client.patch(url).json(&body), action).await?;
        if status == StatusCode::NOT_FOUND {
            return Err(not_found(collection, id));
        }
        if !status.is_success() {
            return Err(status_error(status, &response, action));
        }
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(body: &str, action: &str) -> Result<T, InfraError> {
    serde_json::from_str(body)
        .map_err(|error| InfraError::Http(format!("invalid payload while {action}: {error}; body={body}")))
}

fn not_found(collection: &str, id: &str) -> InfraError {
    if collection == TASKS {
        DomainError::TaskNotFound(id.to_string()).into()
    } else {
        DomainError::SegmentNotFound(id.to_string()).into()
    }
}

/// Client errors naming a known constraint become domain errors; anything else is transport.
fn status_error(status: StatusCode, body: &str, action: &str) -> InfraError {
    if status.is_client_error() {
        if let Some(domain) = translate_constraint_message(body) {
            return domain.into();
        }
    }
    if body.trim().is_empty() {
        InfraError::Http(format!("{action} failed: http {}", status.as_u16()))
    } else {
        InfraError::Http(format!("{action} failed: http {}; body={body}", status.as_u16()))
    }
}

#[async_trait]
impl SchedulePersistence for HttpScheduleStore {
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, InfraError> {
        let url = self.endpoint(TASKS, Some(task_id))?;
        let row: Option<TaskRow> = self.fetch_optional(url, "reading task").await?;
        row.map(TaskRow::into_task).transpose()
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, InfraError> {
        let url = self.endpoint(TASKS, None)?;
        let body = self.send_ok(self.client.get(url), "listing tasks").await?;
        let rows: Vec<TaskRow> = decode(&body, "listing tasks")?;
        let mut tasks = rows
            .into_iter()
            .map(TaskRow::into_task)
            .collect::<Result<Vec<_>, _>>()?;
        tasks.retain(|task| !task.is_deleted());
        tasks.sort_by(|left, right| {
            left.order
                .cmp(&right.order)
                .then_with(|| left.created_at.cmp(&right.created_at))
        });
        Ok(tasks)
    }

    async fn insert_task(&self, task: &Task) -> Result<(), InfraError> {
        task.validate()?;
        let url = self.endpoint(TASKS, None)?;
        let row = TaskRow::from_task(task, &self.calendar);
        self.send_ok(self.client.post(url).json(&row), "creating task")
            .await?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<(), InfraError> {
        task.validate()?;
        let row = TaskRow::from_task(task, &self.calendar);
        self.patch(TASKS, &task.id, serde_json::to_value(&row)?, "updating task")
            .await
    }

    async fn soft_delete_task(
        &self,
        task_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let stamp = self.calendar.to_local_rfc3339(deleted_at);
        for segment in self.list_segments_for_tasks(&[task_id.to_string()]).await? {
            self.patch(
                SEGMENTS,
                &segment.id,
                serde_json::json!({ "deleted_at": stamp, "updated_at": stamp }),
                "deleting time segment",
            )
            .await?;
        }
        self.patch(
            TASKS,
            task_id,
            serde_json::json!({ "deleted_at": stamp, "updated_at": stamp }),
            "deleting task",
        )
        .await
    }

    async fn get_segment(&self, segment_id: &str) -> Result<Option<TimeSegment>, InfraError> {
        let url = self.endpoint(SEGMENTS, Some(segment_id))?;
        let row: Option<SegmentRow> = self.fetch_optional(url, "reading time segment").await?;
        row.map(SegmentRow::into_segment).transpose()
    }

    async fn list_segments(&self, range: &DateRange) -> Result<Vec<TimeSegment>, InfraError> {
        self.fetch_segments(
            &[
                ("from", format_date(range.start)),
                ("to", format_date(range.end)),
            ],
            "listing time segments",
        )
        .await
    }

    async fn list_segments_for_tasks(
        &self,
        task_ids: &[String],
    ) -> Result<Vec<TimeSegment>, InfraError> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_segments(
            &[("task_ids", task_ids.join(","))],
            "listing task time segments",
        )
        .await
    }

    async fn insert_segment(&self, segment: &TimeSegment) -> Result<(), InfraError> {
        segment.validate(&self.calendar)?;
        let url = self.endpoint(SEGMENTS, None)?;
        let row = SegmentRow::from_segment(segment, &self.calendar);
        self.send_ok(self.client.post(url).json(&row), "creating time segment")
            .await?;
        Ok(())
    }

    async fn update_segment(&self, segment: &TimeSegment) -> Result<(), InfraError> {
        segment.validate(&self.calendar)?;
        let row = SegmentRow::from_segment(segment, &self.calendar);
        self.patch(
            SEGMENTS,
            &segment.id,
            serde_json::to_value(&row)?,
            "updating time segment",
        )
        .await
    }

    async fn soft_delete_segment(
        &self,
        segment_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), InfraError> {
        let stamp = self.calendar.to_local_rfc3339(deleted_at);
        self.patch(
            SEGMENTS,
            segment_id,
            serde_json::json!({ "deleted_at": stamp, "updated_at": stamp }),
            "deleting time segment",
        )
        .await
    }

    async fn recompute_scheduled_minutes(&self, task_id: &str) -> Result<i64, InfraError> {
        let total = self
            .list_segments_for_tasks(&[task_id.to_string()])
            .await?
            .iter()
            .map(|segment| segment.duration_minutes)
            .sum::<i64>();
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| DomainError::TaskNotFound(task_id.to_string()))?;
        if task.scheduled_minutes != total {
            self.patch(
                TASKS,
                task_id,
                serde_json::json!({ "scheduled_time": total }),
                "overriding scheduled time",
            )
            .await?;
        }
        Ok(total)
    }
}
