//! # Tidemark
//!
//! A windowed, watermark-driven element-execution core.
//!
//! Tidemark runs user functions over windowed elements with event-time
//! correctness: no output watermark ever outruns data the operator may still
//! emit. It provides the pieces a dataflow backend needs to host one operator
//! instance:
//!
//! - **Per-element evaluation** with an explicit lifecycle ([`dofn::DoFn`])
//!   driven by [`runner::DoFnRunner`], with atomic bundles.
//! - **Side-input pushback**: elements whose side inputs are not ready yet are
//!   buffered and replayed when the side input arrives, holding the output
//!   watermark back meanwhile.
//! - **Watermarks** for one instance ([`watermark::WatermarkTracker`]) and
//!   aggregated over many upstream partitions
//!   ([`watermark::PartitionedWatermarks`]).
//! - **Grouping by key** into per-key work items with structural key equality
//!   ([`grouping::KeyedRegrouper`]).
//! - **Per-key event-time timers** ([`timers::PerKeyTimerManager`]) and keyed
//!   state behind a pluggable store ([`state::KeyedStateStore`]).
//! - **Splittable processing** under record and time budgets, checkpointing
//!   instead of blocking ([`splittable::SplittableRestrictionProcessor`]).
//! - **Keyed execution**: independent bundles in parallel, one invocation per
//!   key at a time ([`executor::KeyedExecutor`]).
//!
//! ## Quick Start
//!
//! ```rust
//! use tidemark::config::RunnerConfig;
//! use tidemark::dofn::{DoFn, ProcessContext};
//! use tidemark::error::BoxError;
//! use tidemark::runner::DoFnRunner;
//! use tidemark::time::Instant;
//! use tidemark::windowed_value::WindowedValue;
//!
//! struct Double;
//!
//! impl DoFn<i64, i64> for Double {
//!     fn process_element(
//!         &mut self,
//!         element: &WindowedValue<i64>,
//!         ctx: &mut ProcessContext<'_, i64, i64>,
//!     ) -> Result<(), BoxError> {
//!         ctx.output(element.value() * 2)?;
//!         Ok(())
//!     }
//! }
//!
//! let mut runner = DoFnRunner::builder(Double, RunnerConfig::new("double")).build()?;
//! let result = runner.process_element(WindowedValue::in_global_window(21))?;
//! assert_eq!(result.outputs.main_values().next().map(|v| *v.value()), Some(42));
//!
//! let result = runner.process_watermark(Instant::from_millis(100))?;
//! assert_eq!(result.output_watermark, Some(Instant::from_millis(100)));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Event-time instants, time domains and stream messages.
pub mod time;
/// Window identities.
pub mod window;
/// Values with timestamp, windows and pane.
pub mod windowed_value;
/// Coders and structural keys.
pub mod codec;
/// Error types for execution and configuration.
pub mod error;
/// Runner configuration and splittable budgets.
pub mod config;
/// Keyed state addressed by operator, key and namespace.
pub mod state;
/// Side-input views and readiness strategies.
pub mod side_input;
/// Buffer of elements waiting for side inputs.
pub mod pushback;
/// Watermark tracking for one operator and across partitions.
pub mod watermark;
/// Per-key event-time timers.
pub mod timers;
/// Grouping by structural key into work items.
pub mod grouping;
/// User function lifecycle and process context.
pub mod dofn;
/// Bundle staging and results.
pub mod bundle;
/// Output tags, channels and collected outputs.
pub mod output;
/// The element evaluation runner.
pub mod runner;
/// Budgeted processing of splittable restrictions.
pub mod splittable;
/// Parallel bundle execution with per-key exclusion.
pub mod executor;
/// Tracing subscriber helpers.
pub mod logging;
