//! Window identity for windowed values.
//!
//! Windows partition event time into the scopes that side inputs, state and
//! timers are keyed by. Assigning elements to windows and merging windows are
//! the job of the windowing function upstream; the execution core only needs
//! a window's identity, ordering and maximum timestamp.
//!
//! # Window Types
//!
//! - [`Window::Global`]: The single window spanning all of event time
//! - [`Window::Interval`]: A half-open `[start, end)` event-time interval
//!
//! # Example
//!
//! ```rust
//! use tidemark::time::Instant;
//! use tidemark::window::Window;
//!
//! let w = Window::interval(0, 1_000);
//! assert!(w.contains(Instant::from_millis(999)));
//! assert_eq!(w.max_timestamp(), Instant::from_millis(999));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::time::Instant;

/// A window an element is assigned to.
///
/// Ordering places the global window first, then interval windows by start
/// and end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Window {
  /// The global window.
  Global,
  /// A half-open event-time interval.
  Interval {
    /// Start time of the window (inclusive).
    start: Instant,
    /// End time of the window (exclusive).
    end: Instant,
  },
}

impl Window {
  /// Creates an interval window `[start, end)` from epoch milliseconds.
  pub fn interval(start: i64, end: i64) -> Self {
    Self::between(Instant::from_millis(start), Instant::from_millis(end))
  }

  /// Creates an interval window `[start, end)`.
  pub fn between(start: Instant, end: Instant) -> Self {
    Window::Interval { start, end }
  }

  /// Returns true for the global window.
  pub fn is_global(&self) -> bool {
    matches!(self, Window::Global)
  }

  /// Returns the maximum timestamp an element in this window may carry.
  pub fn max_timestamp(&self) -> Instant {
    match self {
      // One millisecond short of +inf so the end-of-window is still a
      // watermark the input can reach before it finishes.
      Window::Global => Instant::MAX.saturating_sub_millis(1),
      Window::Interval { end, .. } => end.saturating_sub_millis(1),
    }
  }

  /// Returns true if the given timestamp falls within this window.
  pub fn contains(&self, timestamp: Instant) -> bool {
    match self {
      Window::Global => true,
      Window::Interval { start, end } => timestamp >= *start && timestamp < *end,
    }
  }
}

impl fmt::Display for Window {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Window::Global => write!(f, "GlobalWindow"),
      Window::Interval { start, end } => write!(f, "[{}, {})", start, end),
    }
  }
}
