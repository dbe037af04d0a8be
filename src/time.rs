//! Event time for watermark-driven execution.
//!
//! This module provides [`Instant`], [`TimeDomain`] and [`StreamMessage`], the
//! foundational types every channel of the execution core is expressed in.
//!
//! [`Instant`] is a millisecond event-time instant. It is totally ordered and
//! carries two sentinels: [`Instant::MIN`] (negative infinity, the initial
//! watermark of every operator) and [`Instant::MAX`] (positive infinity, the
//! minimum timestamp of an empty buffer and the final watermark of a finished
//! input).
//!
//! ## Event time vs processing time
//!
//! Timers and watermarks are expressed in a [`TimeDomain`]. Only
//! [`TimeDomain::EventTime`] is driven by this crate: the input watermark of an
//! operator decides when event-time timers fire. Processing-time and
//! synchronized-processing-time requests are surfaced as explicit
//! unsupported-operation errors rather than being silently ignored.
//!
//! ## Progress contract
//!
//! A [`StreamMessage::Watermark`] asserts that no further data with a lower
//! timestamp will follow on that channel. Watermarks on a channel never
//! regress; an operator that observes a regression treats it as an internal
//! consistency violation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::windowed_value::WindowedValue;

/// A point in event time, in milliseconds since the Unix epoch.
///
/// Implements [`Ord`] so it can be used directly as a watermark. The default
/// value is [`Instant::MIN`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Instant(i64);

impl Instant {
    /// Negative infinity. No element can be earlier than this.
    pub const MIN: Instant = Instant(i64::MIN);

    /// Positive infinity. A watermark at `MAX` means the input is exhausted.
    pub const MAX: Instant = Instant(i64::MAX);

    /// Creates an instant from milliseconds since the Unix epoch.
    #[inline]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the raw millisecond value.
    #[inline]
    pub const fn millis(self) -> i64 {
        self.0
    }

    /// Returns `true` for either infinity sentinel.
    #[inline]
    pub const fn is_infinite(self) -> bool {
        self.0 == i64::MIN || self.0 == i64::MAX
    }

    /// Adds a duration, saturating at [`Instant::MAX`].
    pub fn saturating_add(self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Subtracts a number of milliseconds, saturating at [`Instant::MIN`].
    #[inline]
    pub const fn saturating_sub_millis(self, millis: i64) -> Self {
        Self(self.0.saturating_sub(millis))
    }

    /// Converts to a UTC date-time. Returns `None` for the sentinels and for
    /// values chrono cannot represent.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        if self.is_infinite() {
            return None;
        }
        DateTime::from_timestamp_millis(self.0)
    }
}

impl Default for Instant {
    fn default() -> Self {
        Self::MIN
    }
}

impl From<i64> for Instant {
    fn from(millis: i64) -> Self {
        Self(millis)
    }
}

impl From<DateTime<Utc>> for Instant {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MIN => write!(f, "-inf"),
            Self::MAX => write!(f, "+inf"),
            Self(millis) => write!(f, "{}ms", millis),
        }
    }
}

/// The clock a timer or watermark is measured against.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TimeDomain {
    /// Event time, advanced by the input watermark.
    EventTime,
    /// Wall-clock time of the worker.
    ProcessingTime,
    /// Processing time synchronized across upstream workers.
    SynchronizedProcessingTime,
}

impl fmt::Display for TimeDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventTime => write!(f, "event-time"),
            Self::ProcessingTime => write!(f, "processing-time"),
            Self::SynchronizedProcessingTime => write!(f, "synchronized-processing-time"),
        }
    }
}

/// Stream message: either a windowed data item or a watermark marker.
///
/// Main and side channels both carry `StreamMessage`. A source emits
/// `Watermark(t)` when it knows no more data with timestamp `< t` will arrive.
/// Operators that hold data back (pushback, timers) consume both and decide
/// when to forward the watermark downstream.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamMessage<T> {
    /// Windowed data item.
    Data(WindowedValue<T>),
    /// Watermark: no more data with event time `< t` will arrive.
    Watermark(Instant),
}

impl<T> StreamMessage<T> {
    /// Returns `Some(&WindowedValue<T>)` if this is `Data`, otherwise `None`.
    #[inline]
    pub fn data(&self) -> Option<&WindowedValue<T>> {
        match self {
            Self::Data(value) => Some(value),
            Self::Watermark(_) => None,
        }
    }

    /// Returns `Some(Instant)` if this is `Watermark`, otherwise `None`.
    #[inline]
    pub fn watermark(&self) -> Option<Instant> {
        match self {
            Self::Data(_) => None,
            Self::Watermark(t) => Some(*t),
        }
    }

    /// Consumes the message and returns the data item, if any.
    #[inline]
    pub fn into_data(self) -> Option<WindowedValue<T>> {
        match self {
            Self::Data(value) => Some(value),
            Self::Watermark(_) => None,
        }
    }

    /// Returns `true` if this is `Data`.
    #[inline]
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data(_))
    }

    /// Returns `true` if this is `Watermark`.
    #[inline]
    pub fn is_watermark(&self) -> bool {
        matches!(self, Self::Watermark(_))
    }
}
