use log::trace;
use std::time::Instant;

/// Trace the time since `start` under `name` and return a new start point.
pub(crate) fn log_duration(name: &str, start: Instant) -> Instant {
    trace!("{name:>14}: {:>10.3?}", start.elapsed());
    Instant::now()
}
