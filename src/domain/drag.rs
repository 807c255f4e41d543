use crate::domain::calendar::LocalCalendar;
use crate::domain::models::TimeSegment;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const DOMINANT_DELTA_MINUTES: f64 = 5.0;
const STILL_DELTA_MINUTES: f64 = 1.0;
const DOMINANCE_RATIO: f64 = 2.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DragMode {
    Move,
    ResizeStart,
    ResizeEnd,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResizeEdge {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SnapSettings {
    pub snap_minutes: i64,
    pub precision_snap_minutes: i64,
    pub min_duration_minutes: i64,
    pub edge_hit_pixels: f64,
}

impl Default for SnapSettings {
    fn default() -> Self {
        Self {
            snap_minutes: 15,
            precision_snap_minutes: 1,
            min_duration_minutes: 15,
            edge_hit_pixels: 3.0,
        }
    }
}

/// Horizontal layout of the day timeline: `width_px` spans the visible hours.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineGeometry {
    pub width_px: f64,
    pub visible_start_hour: u32,
    pub visible_end_hour: u32,
}

impl TimelineGeometry {
    pub fn visible_minutes(&self) -> f64 {
        f64::from(self.visible_end_hour.saturating_sub(self.visible_start_hour)) * 60.0
    }

    pub fn minutes_for_pixels(&self, delta_px: f64) -> f64 {
        if self.width_px <= 0.0 {
            return 0.0;
        }
        delta_px / self.width_px * self.visible_minutes()
    }
}

impl Default for TimelineGeometry {
    fn default() -> Self {
        Self {
            width_px: 1440.0,
            visible_start_hour: 0,
            visible_end_hour: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SegmentPlacement {
    pub segment_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DragCommit {
    pub segment_id: String,
    pub mode: DragMode,
    pub original_start: DateTime<Utc>,
    pub original_end: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DragCommit {
    pub fn changed(&self) -> bool {
        self.start != self.original_start || self.end != self.original_end
    }

    pub fn original_placement(&self) -> SegmentPlacement {
        SegmentPlacement {
            segment_id: self.segment_id.clone(),
            start: self.original_start,
            end: self.original_end,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveDrag {
    pub pointer_id: u64,
    pub mode: DragMode,
    pub segment_id: String,
    pub origin_x: f64,
    pub original_start: DateTime<Utc>,
    pub original_end: DateTime<Utc>,
    pub current_start: DateTime<Utc>,
    pub current_end: DateTime<Utc>,
    day_start: DateTime<Utc>,
    day_end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum DragState {
    #[default]
    Idle,
    Dragging(ActiveDrag),
}

/// Pointer-driven move/resize of a single segment on the day timeline.
///
/// Only the pointer captured on `pointer_down` is followed; capture ends on
/// `pointer_up` or `pointer_cancel`.
#[derive(Debug, Clone)]
pub struct DragController {
    geometry: TimelineGeometry,
    settings: SnapSettings,
    calendar: LocalCalendar,
    state: DragState,
}

impl DragController {
    pub fn new(geometry: TimelineGeometry, settings: SnapSettings, calendar: LocalCalendar) -> Self {
        Self {
            geometry,
            settings,
            calendar,
            state: DragState::Idle,
        }
    }

    pub fn state(&self) -> &DragState {
        &self.state
    }

    pub fn is_dragging(&self) -> bool {
        matches!(self.state, DragState::Dragging(_))
    }

    pub fn set_geometry(&mut self, geometry: TimelineGeometry) {
        self.geometry = geometry;
    }

    pub fn pointer_down(
        &mut self,
        pointer_id: u64,
        pointer_x: f64,
        segment: &TimeSegment,
        segment_left_px: f64,
        segment_right_px: f64,
    ) -> Option<DragMode> {
        if self.is_dragging() {
            return None;
        }
        let mode = hit_test(pointer_x, segment_left_px, segment_right_px, &self.settings)?;
        let (day_start, day_end) = self.calendar.day_bounds(segment.date);
        self.state = DragState::Dragging(ActiveDrag {
            pointer_id,
            mode,
            segment_id: segment.id.clone(),
            origin_x: pointer_x,
            original_start: segment.start_time,
            original_end: segment.end_time,
            current_start: segment.start_time,
            current_end: segment.end_time,
            day_start,
            day_end,
        });
        Some(mode)
    }

    pub fn pointer_move(
        &mut self,
        pointer_id: u64,
        pointer_x: f64,
        precise: bool,
    ) -> Option<SegmentPlacement> {
        let DragState::Dragging(active) = &mut self.state else {
            return None;
        };
        if active.pointer_id != pointer_id {
            return None;
        }

        let raw_minutes = self.geometry.minutes_for_pixels(pointer_x - active.origin_x);
        let delta = snap_delta(raw_minutes, precise, &self.settings);
        let (start, end) = apply_delta(active, delta, &self.settings);
        active.current_start = start;
        active.current_end = end;
        Some(SegmentPlacement {
            segment_id: active.segment_id.clone(),
            start,
            end,
        })
    }

    pub fn pointer_up(&mut self, pointer_id: u64) -> Option<DragCommit> {
        let active = self.release(pointer_id)?;
        Some(DragCommit {
            segment_id: active.segment_id,
            mode: active.mode,
            original_start: active.original_start,
            original_end: active.original_end,
            start: active.current_start,
            end: active.current_end,
        })
    }

    /// Abandons the drag and returns the placement to restore.
    pub fn pointer_cancel(&mut self, pointer_id: u64) -> Option<SegmentPlacement> {
        let active = self.release(pointer_id)?;
        Some(SegmentPlacement {
            segment_id: active.segment_id,
            start: active.original_start,
            end: active.original_end,
        })
    }

    fn release(&mut self, pointer_id: u64) -> Option<ActiveDrag> {
        match &self.state {
            DragState::Dragging(active) if active.pointer_id == pointer_id => {}
            _ => return None,
        }
        match std::mem::take(&mut self.state) {
            DragState::Dragging(active) => Some(active),
            DragState::Idle => None,
        }
    }
}

/// Body hits move the segment; hits within `edge_hit_pixels` of an edge resize it.
pub fn hit_test(
    pointer_x: f64,
    segment_left_px: f64,
    segment_right_px: f64,
    settings: &SnapSettings,
) -> Option<DragMode> {
    if pointer_x < segment_left_px || pointer_x > segment_right_px {
        return None;
    }
    if pointer_x - segment_left_px <= settings.edge_hit_pixels {
        return Some(DragMode::ResizeStart);
    }
    if segment_right_px - pointer_x <= settings.edge_hit_pixels {
        return Some(DragMode::ResizeEnd);
    }
    Some(DragMode::Move)
}

pub fn snap_delta(raw_minutes: f64, precise: bool, settings: &SnapSettings) -> i64 {
    let step = if precise {
        settings.precision_snap_minutes
    } else {
        settings.snap_minutes
    }
    .max(1) as f64;
    ((raw_minutes / step).round() * step) as i64
}

/// Decides which boundary a combined calendar resize event is editing.
pub fn classify_resize_edge(start_delta_minutes: f64, end_delta_minutes: f64) -> ResizeEdge {
    let start = start_delta_minutes.abs();
    let end = end_delta_minutes.abs();

    if start > DOMINANT_DELTA_MINUTES && end < STILL_DELTA_MINUTES {
        return ResizeEdge::Start;
    }
    if end > DOMINANT_DELTA_MINUTES && start < STILL_DELTA_MINUTES {
        return ResizeEdge::End;
    }
    if start > end * DOMINANCE_RATIO {
        return ResizeEdge::Start;
    }
    if end > start * DOMINANCE_RATIO {
        return ResizeEdge::End;
    }
    ResizeEdge::End
}

/// Applies a combined calendar resize: only the classified edge moves, clamped
/// to the minimum duration and the segment's local day.
pub fn resolve_calendar_resize(
    segment: &TimeSegment,
    proposed_start: DateTime<Utc>,
    proposed_end: DateTime<Utc>,
    settings: &SnapSettings,
    calendar: &LocalCalendar,
) -> (ResizeEdge, DateTime<Utc>, DateTime<Utc>) {
    let start_delta = (proposed_start - segment.start_time).num_seconds() as f64 / 60.0;
    let end_delta = (proposed_end - segment.end_time).num_seconds() as f64 / 60.0;
    let edge = classify_resize_edge(start_delta, end_delta);
    let (day_start, day_end) = calendar.day_bounds(segment.date);
    let min_length = Duration::minutes(settings.min_duration_minutes);

    match edge {
        ResizeEdge::Start => {
            let latest = latest_start(segment.start_time, segment.end_time, min_length);
            let start = clamp(proposed_start, day_start, latest);
            (edge, start, segment.end_time)
        }
        ResizeEdge::End => {
            let earliest = earliest_end(segment.start_time, segment.end_time, min_length);
            let end = clamp(proposed_end, earliest, day_end);
            (edge, segment.start_time, end)
        }
    }
}

fn apply_delta(
    drag: &ActiveDrag,
    delta_minutes: i64,
    settings: &SnapSettings,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let delta = Duration::minutes(delta_minutes);
    let min_length = Duration::minutes(settings.min_duration_minutes);

    match drag.mode {
        DragMode::Move => {
            let length = drag.original_end - drag.original_start;
            let mut start = drag.original_start + delta;
            if start + length > drag.day_end {
                start = drag.day_end - length;
            }
            if start < drag.day_start {
                start = drag.day_start;
            }
            (start, start + length)
        }
        DragMode::ResizeStart => {
            let start = clamp(
                drag.original_start + delta,
                drag.day_start,
                latest_start(drag.original_start, drag.original_end, min_length),
            );
            (start, drag.original_end)
        }
        DragMode::ResizeEnd => {
            let end = clamp(
                drag.original_end + delta,
                earliest_end(drag.original_start, drag.original_end, min_length),
                drag.day_end,
            );
            (drag.original_start, end)
        }
    }
}

/// Furthest a start edge may shrink. A segment already under the minimum
/// keeps its start rather than growing against the gesture.
fn latest_start(start: DateTime<Utc>, end: DateTime<Utc>, min_length: Duration) -> DateTime<Utc> {
    (end - min_length).max(start)
}

fn earliest_end(start: DateTime<Utc>, end: DateTime<Utc>, min_length: Duration) -> DateTime<Utc> {
    (start + min_length).min(end)
}

/// Clamps into `[lower, upper]`; `lower` wins when the bounds cross.
fn clamp(value: DateTime<Utc>, lower: DateTime<Utc>, upper: DateTime<Utc>) -> DateTime<Utc> {
    value.min(upper).max(lower)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::fixtures::{fixed_time, sample_segment};
    use proptest::prelude::*;

    fn controller() -> DragController {
        DragController::new(
            TimelineGeometry::default(),
            SnapSettings::default(),
            LocalCalendar::default(),
        )
    }

    fn segment() -> TimeSegment {
        sample_segment("seg-1", "tsk-1", "2024-03-10T10:00:00Z", "2024-03-10T11:00:00Z")
    }

    // The default geometry maps one pixel to one minute; the segment spans x=600..660.
    fn start_drag(controller: &mut DragController, pointer_x: f64) -> Option<DragMode> {
        controller.pointer_down(1, pointer_x, &segment(), 600.0, 660.0)
    }

    #[test]
    fn hit_test_distinguishes_edges_and_body() {
        let settings = SnapSettings::default();
        assert_eq!(hit_test(601.0, 600.0, 660.0, &settings), Some(DragMode::ResizeStart));
        assert_eq!(hit_test(603.0, 600.0, 660.0, &settings), Some(DragMode::ResizeStart));
        assert_eq!(hit_test(630.0, 600.0, 660.0, &settings), Some(DragMode::Move));
        assert_eq!(hit_test(658.0, 600.0, 660.0, &settings), Some(DragMode::ResizeEnd));
        assert_eq!(hit_test(661.0, 600.0, 660.0, &settings), None);
    }

    #[test]
    fn seven_minute_drag_snaps_to_grid_unless_precise() {
        let settings = SnapSettings::default();
        assert_eq!(snap_delta(7.0, false, &settings), 0);
        assert_eq!(snap_delta(7.0, true, &settings), 7);
        assert_eq!(snap_delta(8.0, false, &settings), 15);
        assert_eq!(snap_delta(-23.0, false, &settings), -30);
    }

    #[test]
    fn move_shifts_both_endpoints() {
        let mut controller = controller();
        assert_eq!(start_drag(&mut controller, 630.0), Some(DragMode::Move));

        let snapped = controller.pointer_move(1, 637.0, false).expect("placement");
        assert_eq!(snapped.start, fixed_time("2024-03-10T10:00:00Z"));

        let precise = controller.pointer_move(1, 637.0, true).expect("placement");
        assert_eq!(precise.start, fixed_time("2024-03-10T10:07:00Z"));
        assert_eq!(precise.end, fixed_time("2024-03-10T11:07:00Z"));

        let commit = controller.pointer_up(1).expect("commit");
        assert!(commit.changed());
        assert_eq!(commit.mode, DragMode::Move);
        assert!(!controller.is_dragging());
    }

    #[test]
    fn move_is_clamped_to_the_day() {
        let mut controller = controller();
        start_drag(&mut controller, 630.0);
        let placement = controller.pointer_move(1, 630.0 + 900.0, false).expect("placement");
        assert_eq!(placement.start, fixed_time("2024-03-10T23:00:00Z"));
        assert_eq!(placement.end, fixed_time("2024-03-11T00:00:00Z"));

        let placement = controller.pointer_move(1, 630.0 - 900.0, false).expect("placement");
        assert_eq!(placement.start, fixed_time("2024-03-10T00:00:00Z"));
        assert_eq!(placement.end, fixed_time("2024-03-10T01:00:00Z"));
    }

    #[test]
    fn resize_start_keeps_minimum_duration() {
        let mut controller = controller();
        assert_eq!(start_drag(&mut controller, 601.0), Some(DragMode::ResizeStart));
        let placement = controller.pointer_move(1, 601.0 + 120.0, false).expect("placement");
        assert_eq!(placement.start, fixed_time("2024-03-10T10:45:00Z"));
        assert_eq!(placement.end, fixed_time("2024-03-10T11:00:00Z"));
    }

    #[test]
    fn resize_end_stops_at_midnight() {
        let mut controller = controller();
        assert_eq!(start_drag(&mut controller, 659.0), Some(DragMode::ResizeEnd));
        let placement = controller.pointer_move(1, 659.0 + 2000.0, false).expect("placement");
        assert_eq!(placement.start, fixed_time("2024-03-10T10:00:00Z"));
        assert_eq!(placement.end, fixed_time("2024-03-11T00:00:00Z"));
    }

    #[test]
    fn other_pointers_are_ignored_while_captured() {
        let mut controller = controller();
        start_drag(&mut controller, 630.0);
        assert!(controller.pointer_move(2, 700.0, false).is_none());
        assert!(controller.pointer_up(2).is_none());
        assert!(controller.is_dragging());
        assert!(
            controller
                .pointer_down(2, 630.0, &segment(), 600.0, 660.0)
                .is_none()
        );
    }

    #[test]
    fn cancel_restores_original_placement() {
        let mut controller = controller();
        start_drag(&mut controller, 630.0);
        controller.pointer_move(1, 690.0, false);
        let restored = controller.pointer_cancel(1).expect("restore");
        assert_eq!(restored.start, fixed_time("2024-03-10T10:00:00Z"));
        assert_eq!(restored.end, fixed_time("2024-03-10T11:00:00Z"));
        assert_eq!(controller.state(), &DragState::Idle);
    }

    #[test]
    fn classify_prefers_clearly_dominant_edge() {
        assert_eq!(classify_resize_edge(20.0, 0.5), ResizeEdge::Start);
        assert_eq!(classify_resize_edge(0.5, 20.0), ResizeEdge::End);
        assert_eq!(classify_resize_edge(-20.0, 0.0), ResizeEdge::Start);
    }

    #[test]
    fn classify_uses_ratio_then_defaults_to_end() {
        assert_eq!(classify_resize_edge(2.0, 3.0), ResizeEdge::End);
        assert_eq!(classify_resize_edge(3.0, 2.0), ResizeEdge::End);
        assert_eq!(classify_resize_edge(4.5, 2.0), ResizeEdge::Start);
        assert_eq!(classify_resize_edge(4.0, 2.0), ResizeEdge::End);
        assert_eq!(classify_resize_edge(0.0, 0.0), ResizeEdge::End);
    }

    #[test]
    fn calendar_resize_only_moves_classified_edge() {
        let settings = SnapSettings::default();
        let calendar = LocalCalendar::default();
        let (edge, start, end) = resolve_calendar_resize(
            &segment(),
            fixed_time("2024-03-10T09:40:00Z"),
            fixed_time("2024-03-10T11:00:30Z"),
            &settings,
            &calendar,
        );
        assert_eq!(edge, ResizeEdge::Start);
        assert_eq!(start, fixed_time("2024-03-10T09:40:00Z"));
        assert_eq!(end, fixed_time("2024-03-10T11:00:00Z"));

        let (edge, start, end) = resolve_calendar_resize(
            &segment(),
            fixed_time("2024-03-10T10:02:00Z"),
            fixed_time("2024-03-10T10:05:00Z"),
            &settings,
            &calendar,
        );
        assert_eq!(edge, ResizeEdge::End);
        assert_eq!(start, fixed_time("2024-03-10T10:00:00Z"));
        assert_eq!(end, fixed_time("2024-03-10T10:15:00Z"));
    }

    #[test]
    fn short_segment_resize_never_moves_against_the_gesture() {
        let short = sample_segment("seg-2", "tsk-1", "2024-03-10T10:00:00Z", "2024-03-10T10:05:00Z");
        let mut controller = controller();
        assert_eq!(
            controller.pointer_down(1, 601.0, &short, 600.0, 605.0),
            Some(DragMode::ResizeStart)
        );
        let shrunk = controller.pointer_move(1, 604.0, true).expect("placement");
        assert_eq!(shrunk.start, fixed_time("2024-03-10T10:00:00Z"));
        let grown = controller.pointer_move(1, 571.0, true).expect("placement");
        assert_eq!(grown.start, fixed_time("2024-03-10T09:30:00Z"));
        controller.pointer_up(1);

        assert_eq!(
            controller.pointer_down(1, 604.0, &short, 600.0, 605.0),
            Some(DragMode::ResizeEnd)
        );
        let shrunk = controller.pointer_move(1, 602.0, true).expect("placement");
        assert_eq!(shrunk.end, fixed_time("2024-03-10T10:05:00Z"));
        controller.pointer_up(1);

        let settings = SnapSettings::default();
        let calendar = LocalCalendar::default();
        let (edge, start, end) = resolve_calendar_resize(
            &short,
            fixed_time("2024-03-10T10:03:00Z"),
            fixed_time("2024-03-10T10:05:00Z"),
            &settings,
            &calendar,
        );
        assert_eq!(edge, ResizeEdge::Start);
        assert_eq!(start, fixed_time("2024-03-10T10:00:00Z"));
        assert_eq!(end, fixed_time("2024-03-10T10:05:00Z"));

        let (edge, _, end) = resolve_calendar_resize(
            &short,
            fixed_time("2024-03-10T10:00:00Z"),
            fixed_time("2024-03-10T10:02:00Z"),
            &settings,
            &calendar,
        );
        assert_eq!(edge, ResizeEdge::End);
        assert_eq!(end, fixed_time("2024-03-10T10:05:00Z"));
    }

    proptest! {
        #[test]
        fn move_preserves_duration(delta_px in -2000.0f64..2000.0, precise in any::<bool>()) {
            let mut controller = controller();
            start_drag(&mut controller, 630.0);
            let placement = controller.pointer_move(1, 630.0 + delta_px, precise).expect("placement");
            prop_assert_eq!(placement.end - placement.start, Duration::minutes(60));
            prop_assert!(placement.start >= fixed_time("2024-03-10T00:00:00Z"));
            prop_assert!(placement.end <= fixed_time("2024-03-11T00:00:00Z"));
        }

        #[test]
        fn snapped_delta_is_on_grid(raw in -600.0f64..600.0) {
            let delta = snap_delta(raw, false, &SnapSettings::default());
            prop_assert_eq!(delta % 15, 0);
            prop_assert!((delta as f64 - raw).abs() <= 7.5);
        }
    }
}
