use std::fmt::{Debug, Formatter};
use std::ops::{BitAnd, BitOr, BitOrAssign};

use uuid::Uuid;

use crate::ticks::Ticks;

/// Quality states of a measured value, a 32-bit set with `NORMAL` as the
///  empty default.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Default)]
pub struct StateFlags(pub u32);

impl StateFlags {
    pub const NORMAL: StateFlags = StateFlags(0x0);
    pub const BAD_DATA: StateFlags = StateFlags(0x1);
    pub const SUSPECT_DATA: StateFlags = StateFlags(0x2);
    pub const OVER_RANGE_ERROR: StateFlags = StateFlags(0x4);
    pub const UNDER_RANGE_ERROR: StateFlags = StateFlags(0x8);
    pub const ALARM_HIGH: StateFlags = StateFlags(0x10);
    pub const ALARM_LOW: StateFlags = StateFlags(0x20);
    pub const WARNING_HIGH: StateFlags = StateFlags(0x40);
    pub const WARNING_LOW: StateFlags = StateFlags(0x80);
    pub const FLATLINE_ALARM: StateFlags = StateFlags(0x100);
    pub const COMPARISON_ALARM: StateFlags = StateFlags(0x200);
    pub const ROC_ALARM: StateFlags = StateFlags(0x400);
    pub const RECEIVED_AS_BAD: StateFlags = StateFlags(0x800);
    pub const CALCULATED_VALUE: StateFlags = StateFlags(0x1000);
    pub const CALCULATION_ERROR: StateFlags = StateFlags(0x2000);
    pub const CALCULATION_WARNING: StateFlags = StateFlags(0x4000);
    pub const RESERVED_QUALITY: StateFlags = StateFlags(0x8000);
    pub const BAD_TIME: StateFlags = StateFlags(0x10000);
    pub const SUSPECT_TIME: StateFlags = StateFlags(0x20000);
    pub const LATE_TIME_ALARM: StateFlags = StateFlags(0x40000);
    pub const FUTURE_TIME_ALARM: StateFlags = StateFlags(0x80000);
    pub const UP_SAMPLED: StateFlags = StateFlags(0x100000);
    pub const DOWN_SAMPLED: StateFlags = StateFlags(0x200000);
    pub const DISCARDED_VALUE: StateFlags = StateFlags(0x400000);
    pub const RESERVED_TIME: StateFlags = StateFlags(0x800000);
    pub const USER_DEFINED_FLAG1: StateFlags = StateFlags(0x1000000);
    pub const USER_DEFINED_FLAG2: StateFlags = StateFlags(0x2000000);
    pub const USER_DEFINED_FLAG3: StateFlags = StateFlags(0x4000000);
    pub const USER_DEFINED_FLAG4: StateFlags = StateFlags(0x8000000);
    pub const USER_DEFINED_FLAG5: StateFlags = StateFlags(0x10000000);
    pub const SYSTEM_ERROR: StateFlags = StateFlags(0x20000000);
    pub const SYSTEM_WARNING: StateFlags = StateFlags(0x40000000);
    pub const MEASUREMENT_ERROR: StateFlags = StateFlags(0x80000000);

    pub fn intersects(&self, other: StateFlags) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for StateFlags {
    type Output = StateFlags;

    fn bitor(self, rhs: StateFlags) -> StateFlags {
        StateFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for StateFlags {
    fn bitor_assign(&mut self, rhs: StateFlags) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for StateFlags {
    type Output = StateFlags;

    fn bitand(self, rhs: StateFlags) -> StateFlags {
        StateFlags(self.0 & rhs.0)
    }
}

impl Debug for StateFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StateFlags({:#010x})", self.0)
    }
}

/// A single time series sample as handed to the publisher and yielded by the
///  subscriber.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub signal_id: Uuid,
    pub value: f64,
    pub timestamp: Ticks,
    pub flags: StateFlags,
}

impl Measurement {
    pub fn new(signal_id: Uuid, value: f64, timestamp: Ticks) -> Measurement {
        Measurement {
            signal_id,
            value,
            timestamp,
            flags: StateFlags::NORMAL,
        }
    }
}
