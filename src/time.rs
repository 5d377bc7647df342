// Callback-driven I/O multiplexer for non-blocking TCP services.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Monotonic and wall-clock time with microsecond resolution.

use std::fmt::{self, Display, Formatter};
use std::ops;
use std::time::Duration;

const MICROS_PER_MILLI: i64 = 1_000;
const MICROS_PER_SECOND: i64 = 1_000_000;
const INFINITE_MICROS: i64 = i64::MAX;

/// A point on the monotonic clock, stored in microseconds.
///
/// Instants are purely relative: they can be compared and subtracted only
/// against other instants taken from the same clock. For an absolute time
/// see [`WallTime`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Time(i64);

impl Time {
    /// Reads `CLOCK_MONOTONIC`.
    pub fn now() -> Time {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        let mut micros = 0;
        if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } == 0 {
            micros = ts.tv_sec as i64 * MICROS_PER_SECOND + ts.tv_nsec as i64 / 1_000;
        }
        Time(micros)
    }

    pub const fn zero() -> Time { Time(0) }

    pub const fn infinite() -> Time { Time(INFINITE_MICROS) }

    pub const fn is_zero(self) -> bool { self.0 == 0 }

    pub const fn is_infinite(self) -> bool { self.0 == INFINITE_MICROS }

    /// Microseconds since the (unspecified) monotonic epoch.
    pub const fn to_micros(self) -> i64 { self.0 }
}

/// A signed difference between two [`Time`] points, stored in microseconds,
/// with [`Delta::zero`] and [`Delta::infinite`] sentinels.
///
/// All arithmetic saturates instead of wrapping, and the infinity sentinel
/// is absorbing: `t + Delta::infinite() == Time::infinite()`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Delta(i64);

impl Delta {
    pub const fn zero() -> Delta { Delta(0) }

    pub const fn infinite() -> Delta { Delta(INFINITE_MICROS) }

    pub const fn from_secs(secs: i64) -> Delta { Delta(secs * MICROS_PER_SECOND) }

    pub const fn from_millis(millis: i64) -> Delta { Delta(millis * MICROS_PER_MILLI) }

    pub const fn from_micros(micros: i64) -> Delta { Delta(micros) }

    /// Rounds towards zero.
    pub const fn to_secs(self) -> i64 { self.0 / MICROS_PER_SECOND }

    /// Rounds towards zero.
    pub const fn to_millis(self) -> i64 { self.0 / MICROS_PER_MILLI }

    pub const fn to_micros(self) -> i64 { self.0 }

    pub const fn is_zero(self) -> bool { self.0 == 0 }

    pub const fn is_infinite(self) -> bool { self.0 == INFINITE_MICROS }

    /// Lossy conversion for std interfaces; negative deltas clamp to zero and
    /// the infinite sentinel saturates to `Duration::MAX`.
    pub fn to_duration(self) -> Duration {
        if self.is_infinite() {
            Duration::MAX
        } else if self.0 <= 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.0 as u64)
        }
    }
}

fn saturating_add(lhs: i64, rhs: i64) -> i64 {
    if lhs == INFINITE_MICROS || rhs == INFINITE_MICROS {
        INFINITE_MICROS
    } else {
        lhs.saturating_add(rhs)
    }
}

fn saturating_sub(lhs: i64, rhs: i64) -> i64 {
    if lhs == INFINITE_MICROS {
        INFINITE_MICROS
    } else {
        lhs.saturating_sub(rhs)
    }
}

impl ops::Add<Delta> for Time {
    type Output = Time;
    fn add(self, rhs: Delta) -> Time { Time(saturating_add(self.0, rhs.0)) }
}

impl ops::Sub<Delta> for Time {
    type Output = Time;
    fn sub(self, rhs: Delta) -> Time { Time(saturating_sub(self.0, rhs.0)) }
}

impl ops::Sub for Time {
    type Output = Delta;
    fn sub(self, rhs: Time) -> Delta { Delta(saturating_sub(self.0, rhs.0)) }
}

impl ops::Add for Delta {
    type Output = Delta;
    fn add(self, rhs: Delta) -> Delta { Delta(saturating_add(self.0, rhs.0)) }
}

impl ops::Sub for Delta {
    type Output = Delta;
    fn sub(self, rhs: Delta) -> Delta { Delta(saturating_sub(self.0, rhs.0)) }
}

impl Display for Delta {
    /// Prints with the coarsest unit which loses no precision.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let abs = self.0.unsigned_abs();
        if abs >= MICROS_PER_SECOND as u64 && self.0 % MICROS_PER_SECOND == 0 {
            write!(f, "{}s", self.0 / MICROS_PER_SECOND)
        } else if abs >= MICROS_PER_MILLI as u64 && self.0 % MICROS_PER_MILLI == 0 {
            write!(f, "{}ms", self.0 / MICROS_PER_MILLI)
        } else {
            write!(f, "{}us", self.0)
        }
    }
}

/// An absolute wall-clock time: microseconds since the UNIX epoch, read with
/// `gettimeofday`. Clock skew means values from different machines compare
/// only approximately.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct WallTime(u64);

impl WallTime {
    pub fn now() -> WallTime {
        let mut tv = libc::timeval { tv_sec: 0, tv_usec: 0 };
        let mut micros = 0;
        if unsafe { libc::gettimeofday(&mut tv, std::ptr::null_mut()) } == 0 {
            micros = tv.tv_sec as u64 * MICROS_PER_SECOND as u64 + tv.tv_usec as u64;
        }
        WallTime(micros)
    }

    pub const fn zero() -> WallTime { WallTime(0) }

    pub const fn from_unix_seconds(seconds: u64) -> WallTime {
        WallTime(seconds * MICROS_PER_SECOND as u64)
    }

    pub const fn from_unix_micros(micros: u64) -> WallTime { WallTime(micros) }

    pub const fn to_unix_seconds(self) -> u64 { self.0 / MICROS_PER_SECOND as u64 }

    pub const fn to_unix_micros(self) -> u64 { self.0 }

    pub const fn is_zero(self) -> bool { self.0 == 0 }

    pub fn is_after(self, other: WallTime) -> bool { self > other }

    pub fn is_before(self, other: WallTime) -> bool { self < other }

    pub fn absolute_difference(self, other: WallTime) -> Delta {
        Delta(self.0.abs_diff(other.0).min(INFINITE_MICROS as u64) as i64)
    }

    pub fn add(self, delta: Delta) -> WallTime {
        WallTime(self.0.saturating_add_signed(delta.0))
    }

    pub fn subtract(self, delta: Delta) -> WallTime {
        WallTime(self.0.saturating_add_signed(delta.0.saturating_neg()))
    }
}
