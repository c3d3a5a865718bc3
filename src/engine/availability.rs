use crate::model::*;

/// Sub-ranges of `query` not covered by any CONFIRMED or CHECKED_IN booking.
/// PENDING, CHECKED_OUT and CANCELLED bookings leave the room open.
pub fn free_windows(room: &RoomState, query: &Span) -> Vec<Span> {
    let mut held: Vec<Span> = room
        .overlapping(query)
        .filter(|b| b.status.is_active())
        .map(|b| Span::new(b.stay.start.max(query.start), b.stay.end.min(query.end)))
        .collect();
    if held.is_empty() {
        return vec![*query];
    }
    held.sort_by_key(|s| s.start);
    subtract_intervals(&[*query], &merge_overlapping(&held))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}
