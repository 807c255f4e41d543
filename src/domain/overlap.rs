use crate::domain::models::TimeSegment;

/// Segments on the candidate's day whose interval intersects it.
///
/// Intervals are end-exclusive, so segments that only touch do not overlap.
/// Overlap is legal; the result only drives a warning.
pub fn find_overlaps<'a>(
    candidate: &TimeSegment,
    day_segments: &'a [TimeSegment],
) -> Vec<&'a TimeSegment> {
    day_segments
        .iter()
        .filter(|other| other.id != candidate.id)
        .filter(|other| !other.is_deleted() && other.date == candidate.date)
        .filter(|other| intervals_intersect(candidate, other))
        .collect()
}

/// Every overlapping pair among a day's segments, ordered by start time.
pub fn overlap_pairs(day_segments: &[TimeSegment]) -> Vec<(&TimeSegment, &TimeSegment)> {
    let mut live = day_segments
        .iter()
        .filter(|segment| !segment.is_deleted())
        .collect::<Vec<_>>();
    live.sort_by(|left, right| {
        left.start_time
            .cmp(&right.start_time)
            .then_with(|| left.id.cmp(&right.id))
    });

    let mut pairs = Vec::new();
    for (index, first) in live.iter().enumerate() {
        for second in &live[index + 1..] {
            if second.start_time >= first.end_time {
                break;
            }
            if first.date == second.date {
                pairs.push((*first, *second));
            }
        }
    }
    pairs
}

fn intervals_intersect(left: &TimeSegment, right: &TimeSegment) -> bool {
    left.start_time < right.end_time && right.start_time < left.end_time
}
