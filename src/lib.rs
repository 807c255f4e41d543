pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::commands::{
    AppState, DaySchedule, KanbanColumn, OverlapPair, bulk_delete_segments_impl,
    bulk_update_segments_impl, calendar_days_impl, calendar_resize_impl,
    create_custom_event_impl, create_segment_impl, create_task_impl, delete_segment_impl,
    delete_task_impl, drag_cancel_impl, drag_end_impl, drag_move_impl, drag_start_impl,
    duplicate_segment_impl, kanban_columns_impl, list_tasks_impl, reorder_task_impl,
    reschedule_task_impl, segment_overlaps_impl, set_view_range_impl, split_segment_impl,
    task_box_dates_impl, timeline_day_impl, update_segment_impl, update_task_impl,
};
pub use application::events::{MutationContext, ScheduleEvent, ScheduleEventBus, ViewKind};
pub use application::segment_service::{CustomEvent, MutationOutcome, SegmentService};
pub use application::task_service::TaskService;
pub use application::view_sync::{CrossViewSynchronizer, RetryPolicy, ScheduleMutation};
pub use domain::calendar::{DateRange, LocalCalendar};
pub use domain::error::DomainError;
pub use domain::models::{
    NewSegment, NewTask, SegmentPatch, SegmentSource, SegmentStatus, Task, TaskPatch,
    TaskPriority, TaskStatus, TimeSegment,
};
pub use infrastructure::error::InfraError;
pub use infrastructure::persistence::SchedulePersistence;
