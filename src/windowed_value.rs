//! Windowed values: the unit of data flowing through the execution core.
//!
//! A [`WindowedValue`] is a value plus its event-time timestamp, the set of
//! windows it was assigned to, and the [`PaneInfo`] describing which firing
//! produced it. It is immutable once constructed; ownership passes to
//! whichever stage holds it. Stages derive new values with
//! [`WindowedValue::with_value`] or [`WindowedValue::map_value`] rather than
//! mutating in place, and the ingestion boundary always hands over an owned
//! copy, so downstream code never reasons about aliasing.

use serde::{Deserialize, Serialize};

use crate::time::Instant;
use crate::window::Window;

/// When a pane fired relative to the watermark.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Timing {
    /// Fired before the watermark passed the end of the window.
    Early,
    /// The firing triggered by the watermark passing the end of the window.
    OnTime,
    /// Fired after the on-time pane.
    Late,
    /// No timing information.
    Unknown,
}

/// Pane metadata: firing index, first/last flags and timing.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub struct PaneInfo {
    index: u64,
    is_first: bool,
    is_last: bool,
    timing: Timing,
}

impl PaneInfo {
    /// The pane of an element that has not been through any trigger.
    pub const NO_FIRING: PaneInfo = PaneInfo {
        index: 0,
        is_first: true,
        is_last: true,
        timing: Timing::Unknown,
    };

    /// The only firing of a window, on time.
    pub const ON_TIME_AND_ONLY_FIRING: PaneInfo = PaneInfo {
        index: 0,
        is_first: true,
        is_last: true,
        timing: Timing::OnTime,
    };

    /// Creates pane metadata.
    pub const fn new(index: u64, is_first: bool, is_last: bool, timing: Timing) -> Self {
        Self {
            index,
            is_first,
            is_last,
            timing,
        }
    }

    /// Firing index within the window.
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Whether this is the first pane of the window.
    pub const fn is_first(&self) -> bool {
        self.is_first
    }

    /// Whether this is the last pane of the window.
    pub const fn is_last(&self) -> bool {
        self.is_last
    }

    /// Timing of the firing.
    pub const fn timing(&self) -> Timing {
        self.timing
    }
}

impl Default for PaneInfo {
    fn default() -> Self {
        Self::NO_FIRING
    }
}

/// A value with its event-time timestamp, windows and pane.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowedValue<T> {
    value: T,
    timestamp: Instant,
    windows: Vec<Window>,
    pane: PaneInfo,
}

impl<T> WindowedValue<T> {
    /// Creates a windowed value assigned to the given windows.
    pub fn new(
        value: T,
        timestamp: Instant,
        windows: impl IntoIterator<Item = Window>,
        pane: PaneInfo,
    ) -> Self {
        Self {
            value,
            timestamp,
            windows: windows.into_iter().collect(),
            pane,
        }
    }

    /// Creates a windowed value in a single window.
    pub fn of(value: T, timestamp: Instant, window: Window, pane: PaneInfo) -> Self {
        Self::new(value, timestamp, [window], pane)
    }

    /// Places a value in the global window at negative infinity.
    pub fn in_global_window(value: T) -> Self {
        Self::of(value, Instant::MIN, Window::Global, PaneInfo::NO_FIRING)
    }

    /// Places a value in the global window at the given timestamp.
    pub fn timestamped_in_global_window(value: T, timestamp: Instant) -> Self {
        Self::of(value, timestamp, Window::Global, PaneInfo::NO_FIRING)
    }

    /// Returns the value.
    #[inline]
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Consumes the windowed value and returns the bare value.
    #[inline]
    pub fn into_value(self) -> T {
        self.value
    }

    /// Returns the event-time timestamp.
    #[inline]
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Returns the windows this value is assigned to.
    #[inline]
    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    /// Returns the pane metadata.
    #[inline]
    pub fn pane(&self) -> PaneInfo {
        self.pane
    }

    /// Returns a new windowed value with the same timestamp, windows and pane.
    pub fn with_value<U>(&self, value: U) -> WindowedValue<U> {
        WindowedValue {
            value,
            timestamp: self.timestamp,
            windows: self.windows.clone(),
            pane: self.pane,
        }
    }

    /// Transforms the value, keeping timestamp, windows and pane.
    pub fn map_value<U>(self, f: impl FnOnce(T) -> U) -> WindowedValue<U> {
        WindowedValue {
            value: f(self.value),
            timestamp: self.timestamp,
            windows: self.windows,
            pane: self.pane,
        }
    }

    /// Splits the value from its metadata.
    pub fn into_parts(self) -> (T, Instant, Vec<Window>, PaneInfo) {
        (self.value, self.timestamp, self.windows, self.pane)
    }
}

impl<T: Clone> WindowedValue<T> {
    /// Returns one single-window value per assigned window.
    pub fn explode_windows(&self) -> Vec<WindowedValue<T>> {
        self.windows
            .iter()
            .map(|window| WindowedValue::of(self.value.clone(), self.timestamp, *window, self.pane))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explode_keeps_metadata() {
        let value = WindowedValue::new(
            2,
            Instant::from_millis(-2),
            [Window::interval(-500, 0), Window::interval(-1000, 250), Window::Global],
            PaneInfo::ON_TIME_AND_ONLY_FIRING,
        );
        let exploded = value.explode_windows();
        assert_eq!(exploded.len(), 3);
        for (single, window) in exploded.iter().zip(value.windows()) {
            assert_eq!(single.windows(), &[*window]);
            assert_eq!(single.timestamp(), Instant::from_millis(-2));
            assert_eq!(single.pane(), PaneInfo::ON_TIME_AND_ONLY_FIRING);
            assert_eq!(*single.value(), 2);
        }
    }

    #[test]
    fn with_value_and_map_value() {
        let value = WindowedValue::timestamped_in_global_window(("k", 3), Instant::from_millis(7));
        let stripped = value.with_value(3);
        assert_eq!(stripped.timestamp(), Instant::from_millis(7));
        assert_eq!(stripped.windows(), &[Window::Global]);

        let doubled = stripped.map_value(|v| v * 2);
        assert_eq!(doubled.into_value(), 6);
    }

    #[test]
    fn global_window_defaults() {
        let value = WindowedValue::in_global_window("x");
        assert_eq!(value.timestamp(), Instant::MIN);
        assert_eq!(value.pane(), PaneInfo::NO_FIRING);
        let (v, ts, windows, pane) = value.into_parts();
        assert_eq!((v, ts, windows, pane), ("x", Instant::MIN, vec![Window::Global], PaneInfo::default()));
    }
}
