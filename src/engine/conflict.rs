use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, SchedulerError};

/// Check an interval from a request: `end > start`, inside the supported
/// range and not absurdly long.
pub fn validate_span(start: Ms, end: Ms) -> Result<Span, SchedulerError> {
    let span = Span::checked(start, end)
        .ok_or_else(|| SchedulerError::validation("end must be after start"))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(SchedulerError::validation("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(SchedulerError::validation("booking too long"));
    }
    Ok(span)
}

pub(super) fn validate_title(title: &str) -> Result<(), SchedulerError> {
    if title.trim().is_empty() {
        return Err(SchedulerError::validation("title is required"));
    }
    if title.len() > MAX_TITLE_LEN {
        return Err(SchedulerError::validation("title too long"));
    }
    Ok(())
}

pub(super) fn validate_notes(notes: Option<&str>) -> Result<(), SchedulerError> {
    match notes {
        Some(n) if n.len() > MAX_NOTES_LEN => Err(SchedulerError::validation("notes too long")),
        _ => Ok(()),
    }
}

/// First active booking on the timeline overlapping `span`, ignoring `exclude`.
pub fn find_conflict(timeline: &Timeline, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    timeline.find_overlapping(span, exclude).map(|b| b.id).next()
}

pub(super) fn ensure_no_conflict(
    timeline: &Timeline,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), SchedulerError> {
    match find_conflict(timeline, span, exclude) {
        None => Ok(()),
        Some(booking_id) => {
            tracing::debug!(
                "rejecting [{}, {}) on {}: overlaps {booking_id}",
                span.start,
                span.end,
                timeline.resource_id
            );
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(SchedulerError::Conflict {
                resource_id: timeline.resource_id,
                booking_id,
            })
        }
    }
}

impl Engine {
    /// True iff an active booking on `resource_id` (other than `exclude`)
    /// overlaps `[start, end)`. A resource never booked has an empty
    /// conflict set, and so does an empty or inverted interval.
    pub async fn check_conflict(
        &self,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> bool {
        let Some(span) = Span::checked(start, end) else {
            return false;
        };
        let Some(tl) = self.existing_timeline(&resource_id) else {
            return false;
        };
        let guard = tl.read().await;
        find_conflict(&guard, &span, exclude).is_some()
    }
}
