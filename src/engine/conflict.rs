use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_timestamp(field: &'static str, t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::invalid(field, "timestamp out of range"));
    }
    Ok(())
}

/// Shape-check every window of a batch and convert to spans. Fail-fast:
/// the first malformed entry rejects the whole batch.
pub(crate) fn validate_batch(windows: &[NewWindow]) -> Result<Vec<(ulid::Ulid, Span)>, EngineError> {
    if windows.is_empty() {
        return Err(EngineError::invalid("windows", "batch is empty"));
    }
    if windows.len() > MAX_BATCH_SIZE {
        return Err(EngineError::LimitExceeded("batch too large"));
    }

    let mut spans = Vec::with_capacity(windows.len());
    for (index, w) in windows.iter().enumerate() {
        if w.start >= w.end {
            return Err(EngineError::InvalidWindow {
                index,
                start: w.start,
                end: w.end,
            });
        }
        validate_timestamp("start", w.start)?;
        validate_timestamp("end", w.end)?;
        let span = Span::new(w.start, w.end);
        if span.duration_ms() > MAX_WINDOW_DURATION_MS {
            return Err(EngineError::LimitExceeded("window too wide"));
        }
        spans.push((w.id, span));
    }

    // Intra-batch overlap: sort a copy by start, compare neighbours.
    let mut order: Vec<usize> = (0..spans.len()).collect();
    order.sort_by_key(|&i| spans[i].1.start);
    for pair in order.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if spans[a].1.overlaps(&spans[b].1) {
            let (first, second) = if a < b { (a, b) } else { (b, a) };
            return Err(EngineError::OverlappingBatch { first, second });
        }
    }
    Ok(spans)
}

/// Reject if any new span overlaps a stored window of the same professional.
pub(crate) fn check_no_overlap(
    schedule: &ProfessionalSchedule,
    spans: &[(ulid::Ulid, Span)],
) -> Result<(), EngineError> {
    for (_, span) in spans {
        if let Some(existing) = schedule.overlapping(span).next() {
            return Err(EngineError::Overlap(existing.id));
        }
    }
    Ok(())
}
