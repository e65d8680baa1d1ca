//! Creation stamps for on-disk artifacts.
//!
//! Every artifact the pipeline writes carries its creation time in its name,
//! captured by the producer at write time. Retention ordering reads the stamp
//! back from the name instead of asking the filesystem, whose creation-time
//! support and clock resolution vary by platform.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// File name prefix for persisted screenshots.
pub const SCREENSHOT_PREFIX: &str = "screenshot_";

/// Microsecond-resolution UTC creation stamp.
///
/// Artifacts written within the same microsecond are told apart by a
/// collision sequence rendered as a `-N` suffix; it orders after the time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArtifactStamp {
    micros: i64,
    sequence: u32,
}

impl ArtifactStamp {
    pub fn from_system_time(time: SystemTime) -> Self {
        let micros = match time.duration_since(UNIX_EPOCH) {
            Ok(since) => i64::try_from(since.as_micros()).unwrap_or(i64::MAX),
            Err(before) => -i64::try_from(before.duration().as_micros()).unwrap_or(i64::MAX),
        };
        Self {
            micros,
            sequence: 0,
        }
    }

    /// The same instant with collision sequence `sequence`.
    pub fn with_sequence(self, sequence: u32) -> Self {
        Self { sequence, ..self }
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn as_system_time(&self) -> SystemTime {
        if self.micros >= 0 {
            UNIX_EPOCH + Duration::from_micros(self.micros as u64)
        } else {
            UNIX_EPOCH - Duration::from_micros(self.micros.unsigned_abs())
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Find a rendered stamp anywhere in an artifact name.
    pub fn find_in(name: &str) -> Option<Self> {
        static STAMP_RE: OnceLock<Regex> = OnceLock::new();
        let re = STAMP_RE.get_or_init(|| {
            Regex::new(r"(\d{8}T\d{6})\.(\d{6})Z(?:-(\d+))?")
                .expect("artifact stamp pattern is valid")
        });
        let caps = re.captures(name)?;
        let whole = NaiveDateTime::parse_from_str(&caps[1], "%Y%m%dT%H%M%S").ok()?;
        let fraction: i64 = caps[2].parse().ok()?;
        let secs = whole.and_utc().timestamp();
        let sequence = match caps.get(3) {
            Some(digits) => digits.as_str().parse().ok()?,
            None => 0,
        };
        Some(Self {
            micros: secs.checked_mul(1_000_000)?.checked_add(fraction)?,
            sequence,
        })
    }

    /// Screenshot file name for this stamp, e.g.
    /// `screenshot_20261019T114000.123456Z.png`, or `...Z-2.png` for a
    /// collision.
    pub fn screenshot_name(&self) -> String {
        match self.sequence {
            0 => format!("{SCREENSHOT_PREFIX}{self}.png"),
            n => format!("{SCREENSHOT_PREFIX}{self}-{n}.png"),
        }
    }
}

impl fmt::Display for ArtifactStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let at: DateTime<Utc> = self.as_system_time().into();
        write!(
            f,
            "{}.{:06}Z",
            at.format("%Y%m%dT%H%M%S"),
            self.micros.rem_euclid(1_000_000)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_stamp_is_found_again() {
        let time = UNIX_EPOCH + Duration::from_micros(1_760_874_000_123_456);
        let stamp = ArtifactStamp::from_system_time(time);
        let name = stamp.screenshot_name();

        assert_eq!(name, "screenshot_20251019T114000.123456Z.png");
        assert_eq!(ArtifactStamp::find_in(&name), Some(stamp));
        assert_eq!(stamp.as_system_time(), time);
    }

    #[test]
    fn detection_folder_inherits_screenshot_stamp() {
        let stamp = ArtifactStamp::from_system_time(UNIX_EPOCH + Duration::from_secs(90));
        let folder = format!("{}-2", stamp.screenshot_name());
        assert_eq!(ArtifactStamp::find_in(&folder), Some(stamp));
    }

    #[test]
    fn names_without_stamp_are_ignored() {
        assert_eq!(ArtifactStamp::find_in("person_0_conf_0.91.jpg"), None);
        assert_eq!(ArtifactStamp::find_in("screenshot 10:19~11:40:00.png"), None);
    }

    #[test]
    fn collision_sequence_round_trips_and_orders_numerically() {
        let stamp = ArtifactStamp::from_system_time(UNIX_EPOCH + Duration::from_secs(90));
        let second = stamp.with_sequence(2);
        let tenth = stamp.with_sequence(10);

        assert!(second.screenshot_name().ends_with("Z-2.png"));
        assert_eq!(ArtifactStamp::find_in(&second.screenshot_name()), Some(second));
        assert_eq!(ArtifactStamp::find_in(&tenth.screenshot_name()), Some(tenth));
        assert!(stamp < second);
        assert!(second < tenth);
        // Lexical name order disagrees; the stamp does not.
        assert!(tenth.screenshot_name() < second.screenshot_name());
    }

    #[test]
    fn stamps_order_by_time() {
        let early = ArtifactStamp::from_system_time(UNIX_EPOCH + Duration::from_micros(10));
        let late = ArtifactStamp::from_system_time(UNIX_EPOCH + Duration::from_micros(11));
        assert!(early < late);
    }
}
