/// Polling schedule: poll quickly at first to catch short tasks, then taper.
///
/// | check     | wait  |
/// |-----------|-------|
/// | 1-2       | 30s   |
/// | 3-5       | 60s   |
/// | 6-10      | 120s  |
/// | 11+       | 180s  |
use std::time::Duration;

/// (last check count in band, wait seconds). The final band is open-ended.
const SCHEDULE: &[(u32, u64)] = &[(2, 30), (5, 60), (10, 120)];
const TAIL_INTERVAL_SECS: u64 = 180;

/// Seconds to wait after the given 1-based check. A count of 0 falls in the first band.
pub fn next_interval_secs(check_count: u32) -> u64 {
    SCHEDULE
        .iter()
        .find(|(upper, _)| check_count <= *upper)
        .map(|(_, secs)| *secs)
        .unwrap_or(TAIL_INTERVAL_SECS)
}

pub fn next_interval(check_count: u32) -> Duration {
    Duration::from_secs(next_interval_secs(check_count))
}
