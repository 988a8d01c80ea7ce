//! Wall-clock / monotonic correlation.
//!
//! Kernel records carry `bpf_ktime_get_ns()` timestamps (CLOCK_MONOTONIC).
//! Once per tick the main loop captures a `(wall, monotonic)` pair; every
//! timestamp in that tick is converted against the same pair so rows of
//! one sweep are mutually consistent.

use std::time::{SystemTime, UNIX_EPOCH};

/// One `(wall, monotonic)` correlation point.
#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    /// Microseconds since the Unix epoch at the basis point.
    wall_us: i64,
    /// CLOCK_MONOTONIC nanoseconds at the basis point.
    mono_ns: u64,
}

impl TimeBase {
    /// Capture a fresh correlation point.
    ///
    /// # Panics
    /// Panics if the system clock reports a time before the Unix epoch.
    #[must_use]
    pub fn now() -> Self {
        let wall = SystemTime::now().duration_since(UNIX_EPOCH).expect("clock before epoch");
        #[allow(clippy::cast_possible_wrap)]
        let wall_us = wall.as_micros() as i64;
        Self { wall_us, mono_ns: monotonic_ns() }
    }

    /// Test constructor with explicit basis values.
    #[must_use]
    pub fn fixed(wall_us: i64, mono_ns: u64) -> Self {
        Self { wall_us, mono_ns }
    }

    /// Convert a kernel monotonic timestamp to wall microseconds.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn wall_from_ktime(&self, ktime_ns: u64) -> WallInstant {
        let delta_ns = ktime_ns as i64 - self.mono_ns as i64;
        WallInstant { epoch_us: self.wall_us + delta_ns / 1000 }
    }

    /// The basis point itself as a wall instant.
    #[must_use]
    pub fn wall_now(&self) -> WallInstant {
        WallInstant { epoch_us: self.wall_us }
    }
}

/// Raw CLOCK_MONOTONIC, comparable with `bpf_ktime_get_ns()`.
#[must_use]
#[allow(unsafe_code, clippy::cast_sign_loss)]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    // SAFETY: clock_gettime only writes the timespec we hand it
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// A wall-clock instant in microseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WallInstant {
    pub epoch_us: i64,
}

impl WallInstant {
    /// Break down into local calendar time.
    #[must_use]
    #[allow(unsafe_code)]
    pub fn local(self) -> LocalStamp {
        let secs = self.epoch_us.div_euclid(1_000_000);
        #[allow(clippy::cast_sign_loss)]
        let micros = self.epoch_us.rem_euclid(1_000_000) as u32;
        let t: libc::time_t = secs;
        let mut tm: libc::tm = unsafe { std::mem::zeroed() };
        // SAFETY: localtime_r writes only the tm we hand it
        unsafe {
            libc::localtime_r(&t, &mut tm);
        }
        #[allow(clippy::cast_sign_loss)]
        LocalStamp {
            year: tm.tm_year + 1900,
            month: tm.tm_mon as u32 + 1,
            day: tm.tm_mday as u32,
            hour: tm.tm_hour as u32,
            minute: tm.tm_min as u32,
            second: tm.tm_sec as u32,
            micros,
        }
    }
}

/// Local calendar time with microsecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStamp {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub micros: u32,
}

impl LocalStamp {
    /// ISO-8601 with microsecond precision, local time.
    #[must_use]
    pub fn iso8601(&self) -> String {
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}",
            self.year, self.month, self.day, self.hour, self.minute, self.second, self.micros
        )
    }

    /// The rotation key: files roll when this changes.
    #[must_use]
    pub fn hour_stamp(&self) -> HourStamp {
        HourStamp { year: self.year, month: self.month, day: self.day, hour: self.hour }
    }
}

/// (year, month, day, hour) tuple used for hourly file rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourStamp {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
}

impl HourStamp {
    /// Filename fragment: `2026-08-01.13`
    #[must_use]
    pub fn file_suffix(&self) -> String {
        format!("{:04}-{:02}-{:02}.{:02}", self.year, self.month, self.day, self.hour)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ktime_conversion_is_linear() {
        let base = TimeBase::fixed(1_000_000, 500_000);
        // 1ms after the basis point
        assert_eq!(base.wall_from_ktime(1_500_000).epoch_us, 1_001_000);
        // 0.5ms before the basis point
        assert_eq!(base.wall_from_ktime(0).epoch_us, 999_500);
    }

    #[test]
    fn iso8601_shape() {
        let s = LocalStamp {
            year: 2026,
            month: 8,
            day: 1,
            hour: 13,
            minute: 5,
            second: 9,
            micros: 42,
        };
        assert_eq!(s.iso8601(), "2026-08-01T13:05:09.000042");
    }

    #[test]
    fn hour_stamp_changes_only_on_hour() {
        let a = LocalStamp {
            year: 2026,
            month: 8,
            day: 1,
            hour: 13,
            minute: 59,
            second: 59,
            micros: 999_999,
        };
        let mut b = a;
        b.minute = 0;
        assert_eq!(a.hour_stamp(), b.hour_stamp());
        b.hour = 14;
        assert_ne!(a.hour_stamp(), b.hour_stamp());
        assert_eq!(b.hour_stamp().file_suffix(), "2026-08-01.14");
    }

    #[test]
    fn live_conversion_roundtrip() {
        let base = TimeBase::now();
        let now_ktime = monotonic_ns();
        let wall = base.wall_from_ktime(now_ktime);
        // within a second of the basis point
        assert!((wall.epoch_us - base.wall_now().epoch_us).abs() < 1_000_000);
    }
}
