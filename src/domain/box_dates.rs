use crate::domain::calendar::DateRange;
use crate::domain::models::{Task, TimeSegment};
use chrono::NaiveDate;
use std::collections::BTreeSet;

/// Calendar dates a task is shown under in date-partitioned views.
///
/// With live segments the box is the set of their start dates and the
/// planned date is ignored. Without segments it falls back to the planned
/// date, then the deadline, then nothing. Soft-deleted segments and segments
/// of other tasks are skipped, so callers may pass a whole day's segment list.
///
/// The result is derived from the segment set on every call; do not keep it
/// across a segment mutation.
pub fn resolve_box_dates<'a>(
    task: &Task,
    segments: impl IntoIterator<Item = &'a TimeSegment>,
) -> BTreeSet<NaiveDate> {
    let scheduled = segments
        .into_iter()
        .filter(|segment| segment.task_id == task.id && !segment.is_deleted())
        .map(|segment| segment.date)
        .collect::<BTreeSet<_>>();
    if !scheduled.is_empty() {
        return scheduled;
    }

    task.planned_date
        .or(task.deadline)
        .into_iter()
        .collect()
}

/// Whether a live task belongs in a view showing `range`.
pub fn task_in_range<'a>(
    task: &Task,
    segments: impl IntoIterator<Item = &'a TimeSegment>,
    range: &DateRange,
) -> bool {
    !task.is_deleted() && range.intersects(resolve_box_dates(task, segments).iter())
}
