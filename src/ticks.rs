use std::fmt::{Debug, Display, Formatter};
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A point in time in STTP's native resolution: the number of 100-nanosecond
///  intervals since 0001-01-01 00:00:00 UTC, Gregorian calendar.
///
/// Only bits 0..61 carry the time value. Bit 63 flags a leap second (second 60,
///  with the value part remaining at second 59), and bit 62 flags the leap
///  second's direction (set for a negative leap second). The flag bits are
///  orthogonal metadata: two ticks denote the same instant iff their value
///  parts are equal.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Ticks(pub u64);

impl Ticks {
    pub const PER_SECOND: u64 = 10_000_000;
    pub const PER_MILLISECOND: u64 = Self::PER_SECOND / 1_000;
    pub const PER_MICROSECOND: u64 = Self::PER_SECOND / 1_000_000;
    pub const PER_MINUTE: u64 = 60 * Self::PER_SECOND;
    pub const PER_HOUR: u64 = 60 * Self::PER_MINUTE;
    pub const PER_DAY: u64 = 24 * Self::PER_HOUR;

    pub const LEAP_SECOND_FLAG: u64 = 1 << 63;
    pub const LEAP_SECOND_DIRECTION: u64 = 1 << 62;
    pub const VALUE_MASK: u64 = !(Self::LEAP_SECOND_FLAG | Self::LEAP_SECOND_DIRECTION);

    /// Ticks representation of the Unix epoch, 1970-01-01 00:00:00 UTC.
    pub const UNIX_BASE_OFFSET: u64 = 621_355_968_000_000_000;

    /// The time value with both leap second flags stripped.
    pub fn timestamp_value(&self) -> u64 {
        self.0 & Self::VALUE_MASK
    }

    pub fn is_leap_second(&self) -> bool {
        self.0 & Self::LEAP_SECOND_FLAG != 0
    }

    /// Direction only carries meaning while the leap second flag is set.
    pub fn is_negative_leap_second(&self) -> bool {
        self.is_leap_second() && self.0 & Self::LEAP_SECOND_DIRECTION != 0
    }

    pub fn set_leap_second(&self) -> Ticks {
        Ticks(self.0 | Self::LEAP_SECOND_FLAG)
    }

    pub fn set_negative_leap_second(&self) -> Ticks {
        Ticks(self.0 | Self::LEAP_SECOND_FLAG | Self::LEAP_SECOND_DIRECTION)
    }

    pub fn now() -> Ticks {
        Ticks::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Ticks {
        match t.duration_since(UNIX_EPOCH) {
            Ok(since_epoch) => {
                let ticks = since_epoch.as_secs() * Self::PER_SECOND
                    + since_epoch.subsec_nanos() as u64 / 100;
                Ticks(Self::UNIX_BASE_OFFSET + ticks)
            }
            // clamp pre-epoch times rather than wrapping
            Err(_) => Ticks(Self::UNIX_BASE_OFFSET),
        }
    }

    pub fn to_system_time(&self) -> SystemTime {
        let value = self.timestamp_value();
        if value >= Self::UNIX_BASE_OFFSET {
            let since_epoch = value - Self::UNIX_BASE_OFFSET;
            UNIX_EPOCH + Duration::new(since_epoch / Self::PER_SECOND, (since_epoch % Self::PER_SECOND) as u32 * 100)
        }
        else {
            let until_epoch = Self::UNIX_BASE_OFFSET - value;
            UNIX_EPOCH - Duration::new(until_epoch / Self::PER_SECOND, (until_epoch % Self::PER_SECOND) as u32 * 100)
        }
    }
}

impl Add<u64> for Ticks {
    type Output = Ticks;

    fn add(self, rhs: u64) -> Ticks {
        Ticks(self.0 + rhs)
    }
}

impl Sub<u64> for Ticks {
    type Output = Ticks;

    fn sub(self, rhs: u64) -> Ticks {
        Ticks(self.0 - rhs)
    }
}

impl Debug for Ticks {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ticks({}{})", self.timestamp_value(), if self.is_leap_second() { "+leap" } else { "" })
    }
}

impl Display for Ticks {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let value = self.timestamp_value();
        write!(f, "{}.{:07}", value / Self::PER_SECOND, value % Self::PER_SECOND)
    }
}
