//! Encoder progress extraction.
//!
//! ffmpeg reports its position on stderr with lines such as
//!
//! ```text
//! frame=24628 fps=6805 q=-1.0 size=  436672kB time=00:17:07.06 bitrate=3482.9kbits/s speed= 284x
//! ```
//!
//! [`ProgressTracker`] turns the `time=` token into a percentage of the
//! source duration. Lines that do not match are ignored.

use std::sync::LazyLock;

use regex::Regex;

static TIME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)frame.*time=(\S+)\s+bitrate").expect("progress regex is valid")
});

/// Extract the elapsed encode position in milliseconds from a diagnostic line.
pub fn parse_progress_time(line: &str) -> Option<u64> {
    let token = TIME_RE.captures(line)?.get(1)?.as_str();
    parse_timestamp_ms(token)
}

/// Parse `[-]H:MM:SS[.fraction]` into milliseconds. Negative positions
/// (ffmpeg prints them before the first packet) count as zero.
pub fn parse_timestamp_ms(token: &str) -> Option<u64> {
    let (negative, token) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token),
    };

    let mut parts = token.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds_part = parts.next()?;
    if parts.next().is_some() || minutes >= 60 {
        return None;
    }

    let (whole, fraction) = match seconds_part.split_once('.') {
        Some((w, f)) => (w, f),
        None => (seconds_part, ""),
    };
    let seconds: u64 = whole.parse().ok()?;
    if seconds >= 60 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    // Only the first three fractional digits matter at millisecond precision.
    let millis = fraction
        .chars()
        .chain(std::iter::repeat('0'))
        .take(3)
        .collect::<String>()
        .parse::<u64>()
        .ok()?;

    if negative {
        return Some(0);
    }

    // An absurd hour count is as unparsable as garbage.
    hours
        .checked_mul(3600)?
        .checked_add(minutes * 60 + seconds)?
        .checked_mul(1000)?
        .checked_add(millis)
}

/// Percentage of `duration_ms` covered by `elapsed_ms`, rounded and clamped
/// to `[0, 100]`.
pub fn percent_of(elapsed_ms: u64, duration_ms: u64) -> Option<u8> {
    if duration_ms == 0 {
        return None;
    }
    let pct = (elapsed_ms as f64 * 100.0 / duration_ms as f64).round();
    Some(pct.clamp(0.0, 100.0) as u8)
}

/// Monotonic progress state for one encode.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    duration_ms: u64,
    current: u8,
}

impl ProgressTracker {
    /// Track progress against a source of `duration_ms` milliseconds.
    pub fn new(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            current: 0,
        }
    }

    /// Current percentage.
    pub fn current(&self) -> u8 {
        self.current
    }

    /// Feed one diagnostic line. Returns the new percentage when the line
    /// raises it; unparsable lines and regressions return `None`.
    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let elapsed = parse_progress_time(line)?;
        let pct = percent_of(elapsed, self.duration_ms)?;
        self.advance(pct)
    }

    /// Mark the encode as finished. Returns `Some(100)` unless 100 was
    /// already reported.
    pub fn finish(&mut self) -> Option<u8> {
        self.advance(100)
    }

    fn advance(&mut self, pct: u8) -> Option<u8> {
        if pct > self.current {
            self.current = pct;
            Some(pct)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ffmpeg_stats_line() {
        let line = "frame=24628 fps=6805 q=-1.0 size=  436672kB time=00:17:07.06 bitrate=3482.9kbits/s speed= 284x";
        assert_eq!(parse_progress_time(line), Some(1_027_060));
    }

    #[test]
    fn parses_single_digit_hours() {
        assert_eq!(parse_timestamp_ms("1:02:03.5"), Some(3_723_500));
        assert_eq!(parse_timestamp_ms("00:00:01"), Some(1000));
        assert_eq!(parse_timestamp_ms("00:00:00.123456"), Some(123));
    }

    #[test]
    fn overflowing_hours_are_ignored() {
        assert_eq!(parse_timestamp_ms("18446744073709551615:00:00.00"), None);
        assert_eq!(parse_timestamp_ms("5124095576030431:00:00"), None);
        let line = "frame=1 fps=0 q=0.0 size=0kB time=99999999999999999:00:00.00 bitrate=0.0kbits/s";
        let mut tracker = ProgressTracker::new(600_000);
        assert_eq!(tracker.observe(line), None);
        assert_eq!(tracker.current(), 0);
    }

    #[test]
    fn negative_position_is_zero() {
        assert_eq!(parse_timestamp_ms("-00:00:00.04"), Some(0));
    }

    #[test]
    fn rejects_malformed_timestamps() {
        assert_eq!(parse_timestamp_ms("N/A"), None);
        assert_eq!(parse_timestamp_ms("00:61:00.00"), None);
        assert_eq!(parse_timestamp_ms("00:00:75.00"), None);
        assert_eq!(parse_timestamp_ms("1:2:3:4"), None);
        assert_eq!(parse_timestamp_ms("00:00:01.x5"), None);
    }

    #[test]
    fn ignores_lines_without_stats() {
        assert_eq!(parse_progress_time("Input #0, matroska,webm, from 'movie.mkv':"), None);
        assert_eq!(parse_progress_time("  Duration: 00:10:00.00, start: 0.000000"), None);
        assert_eq!(
            parse_progress_time("frame=  10 fps=0.0 q=0.0 size=0kB time=N/A bitrate=N/A"),
            None
        );
    }

    #[test]
    fn halfway_is_fifty_percent() {
        let mut tracker = ProgressTracker::new(600_000);
        let pct = tracker.observe("frame=100 time=00:05:00.00 bitrate=2000kbits/s");
        assert_eq!(pct, Some(50));
        assert_eq!(tracker.current(), 50);
    }

    #[test]
    fn percent_rounds_and_clamps() {
        assert_eq!(percent_of(1, 200), Some(1)); // 0.5 rounds up
        assert_eq!(percent_of(700_000, 600_000), Some(100));
        assert_eq!(percent_of(10, 0), None);
    }

    #[test]
    fn progress_never_decreases() {
        let mut tracker = ProgressTracker::new(100_000);
        assert_eq!(tracker.observe("frame=1 time=00:00:40.00 bitrate=1k"), Some(40));
        assert_eq!(tracker.observe("frame=2 time=00:00:20.00 bitrate=1k"), None);
        assert_eq!(tracker.observe("frame=3 time=00:00:40.00 bitrate=1k"), None);
        assert_eq!(tracker.observe("frame=4 time=00:00:41.00 bitrate=1k"), Some(41));
        assert_eq!(tracker.current(), 41);
    }

    #[test]
    fn unparsable_time_produces_nothing() {
        let mut tracker = ProgressTracker::new(100_000);
        assert_eq!(tracker.observe("frame=1 time=garbage bitrate=1k"), None);
        assert_eq!(tracker.current(), 0);
    }

    #[test]
    fn zero_duration_disables_percentages() {
        let mut tracker = ProgressTracker::new(0);
        assert_eq!(tracker.observe("frame=1 time=00:00:40.00 bitrate=1k"), None);
        assert_eq!(tracker.finish(), Some(100));
    }

    #[test]
    fn finish_reports_hundred_once() {
        let mut tracker = ProgressTracker::new(1000);
        assert_eq!(tracker.observe("frame=9 time=00:00:01.00 bitrate=1k"), Some(100));
        assert_eq!(tracker.finish(), None);
    }
}
