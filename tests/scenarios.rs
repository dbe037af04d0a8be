//! End-to-end scenarios over the public API.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tidemark::codec::{StructuralKey, Utf8Coder};
use tidemark::config::{RunnerConfig, SplittableBudget};
use tidemark::dofn::{DoFn, OutputTag, ProcessContext};
use tidemark::error::{BoxError, ConfigError, ExecutionError, InternalError};
use tidemark::executor::KeyedExecutor;
use tidemark::grouping::{KeyedRegrouper, KeyedWorkItem};
use tidemark::runner::{DoFnRunner, KvKeyEncoder};
use tidemark::side_input::{SideInputView, SideValue};
use tidemark::splittable::{
  BudgetedTracker, ElementAndRestriction, OffsetRange, OffsetRangeTracker, RestrictionTracker,
  SplittableDoFn, SplittableProcessFn, StepOutcome,
};
use tidemark::state::{InMemoryKeyedStateStore, StateNamespace};
use tidemark::time::{Instant, StreamMessage, TimeDomain};
use tidemark::timers::{TimerData, TimerState};
use tidemark::watermark::{PartitionedWatermarks, SourceWatermarks};
use tidemark::window::Window;
use tidemark::windowed_value::{PaneInfo, WindowedValue};

fn ts(millis: i64) -> Instant {
  Instant::from_millis(millis)
}

// Joins each element with the first value of side input 0.
struct Enrich;

impl DoFn<String, String> for Enrich {
  fn process_element(
    &mut self,
    element: &WindowedValue<String>,
    ctx: &mut ProcessContext<'_, String, String>,
  ) -> Result<(), BoxError> {
    let labels = ctx.side_input::<String>(0)?;
    let label = labels.first().ok_or("side input not ready")?;
    ctx.output(format!("{}:{}", element.value(), label))?;
    Ok(())
  }
}

#[test]
fn scenario_a_pushback_releases_watermark() {
  let mut runner = DoFnRunner::builder(Enrich, RunnerConfig::new("enrich"))
    .side_inputs([SideInputView::new("labels")])
    .build()
    .unwrap();
  let w = Window::interval(0, 60);

  let result = runner
    .process_element(WindowedValue::of("e".to_string(), ts(30), w, PaneInfo::NO_FIRING))
    .unwrap();
  assert_eq!(result.pushed_back, 1);

  let result = runner.process_watermark(ts(50)).unwrap();
  assert_eq!(result.output_watermark, Some(ts(30)));

  let label: SideValue = Arc::new("red".to_string());
  let result = runner
    .process_side_input(
      0,
      StreamMessage::Data(WindowedValue::of(label, ts(0), w, PaneInfo::NO_FIRING)),
    )
    .unwrap();
  let outputs: Vec<String> = result.outputs.main_values().map(|v| v.value().clone()).collect();
  assert_eq!(outputs, vec!["e:red".to_string()]);
  assert!(runner.pushback().is_empty());

  runner.process_watermark(ts(50)).unwrap();
  assert_eq!(runner.output_watermark(), ts(50));
  assert_eq!(runner.output_watermark(), runner.input_watermark());
}

// Sets one timer per element at the value carried by the element.
struct Alarm;

impl DoFn<(String, i64), String> for Alarm {
  fn process_element(
    &mut self,
    element: &WindowedValue<(String, i64)>,
    ctx: &mut ProcessContext<'_, (String, i64), String>,
  ) -> Result<(), BoxError> {
    let (_, target) = element.value();
    ctx.set_timer(StateNamespace::Global, "alarm", ts(*target), TimeDomain::EventTime)?;
    Ok(())
  }

  fn on_timer(
    &mut self,
    timer: &TimerData,
    ctx: &mut ProcessContext<'_, (String, i64), String>,
  ) -> Result<(), BoxError> {
    ctx.output(format!("{}@{}", timer.timer_id, timer.target))?;
    Ok(())
  }
}

#[test]
fn scenario_b_timer_fires_exactly_once() {
  let mut runner = DoFnRunner::builder(Alarm, RunnerConfig::new("alarm"))
    .keyed(KvKeyEncoder::new(Utf8Coder))
    .build()
    .unwrap();
  let key = StructuralKey::of(&"k".to_string(), &Utf8Coder).unwrap();
  let state = |runner: &DoFnRunner<(String, i64), String>| {
    runner.timers().timer_state(&key, &StateNamespace::Global, "alarm")
  };

  runner
    .process_element(WindowedValue::in_global_window(("k".to_string(), 100)))
    .unwrap();

  let result = runner.process_watermark(ts(50)).unwrap();
  assert_eq!(result.fired_timers, 0);
  assert_eq!(
    state(&runner),
    TimerState::Scheduled {
      target: ts(100),
      domain: TimeDomain::EventTime
    }
  );

  let result = runner.process_watermark(ts(150)).unwrap();
  assert_eq!(result.fired_timers, 1);
  let fired: Vec<String> = result.outputs.main_values().map(|v| v.value().clone()).collect();
  assert_eq!(fired, vec!["alarm@100ms".to_string()]);
  assert_eq!(state(&runner), TimerState::Unset);

  let result = runner.process_watermark(ts(200)).unwrap();
  assert_eq!(result.fired_timers, 0);
  assert!(result.outputs.main_values().next().is_none());
}

#[test]
fn scenario_c_regressing_watermark_is_internal_error() {
  let mut runner = DoFnRunner::builder(Alarm, RunnerConfig::new("alarm"))
    .keyed(KvKeyEncoder::new(Utf8Coder))
    .build()
    .unwrap();
  runner.process_watermark(ts(100)).unwrap();

  let err = runner.process_watermark(ts(90)).unwrap_err();
  assert!(err.is_internal());
  assert!(matches!(
    err,
    ExecutionError::Internal(InternalError::WatermarkRegression { .. })
  ));
  assert_eq!(runner.output_watermark(), ts(100));
}

// Emits one record per claimed offset.
struct ReadRecords;

impl SplittableDoFn<String, u64> for ReadRecords {
  type Tracker = OffsetRangeTracker;

  fn new_tracker(&self, restriction: OffsetRange) -> OffsetRangeTracker {
    OffsetRangeTracker::new(restriction)
  }

  fn process_step(
    &mut self,
    _element: &String,
    tracker: &mut BudgetedTracker<'_, OffsetRangeTracker>,
    output: &mut Vec<u64>,
  ) -> Result<StepOutcome, BoxError> {
    while let Some(offset) = tracker.next_position() {
      if !tracker.try_claim(offset) {
        break;
      }
      output.push(offset);
    }
    Ok(StepOutcome::Done)
  }
}

#[test]
fn scenario_d_splittable_budget_checkpoints() {
  let budget = SplittableBudget::new(10_000, Duration::from_secs(10)).unwrap();
  let config = RunnerConfig::new("read").with_splittable_budget(budget);
  let mut runner: DoFnRunner<ElementAndRestriction<String, OffsetRange>, u64> =
    DoFnRunner::builder(SplittableProcessFn::new(ReadRecords), config)
      .build()
      .unwrap();

  let started = std::time::Instant::now();
  let result = runner
    .process_element(WindowedValue::in_global_window(ElementAndRestriction::new(
      "file".to_string(),
      OffsetRange::new(0, 50_000),
    )))
    .unwrap();
  assert!(started.elapsed() < budget.max_duration);

  assert_eq!(result.outputs.main_values().count(), 10_000);
  assert_eq!(result.residuals.len(), 1);
  let residual = &result.residuals[0].value.value().restriction;
  assert_eq!(*residual, OffsetRange::new(10_000, 50_000));
  assert_eq!(residual.len(), 40_000);

  let tracker = OffsetRangeTracker::new(*residual);
  assert!(!tracker.is_done());
  assert_eq!(tracker.current_restriction(), OffsetRange::new(10_000, 50_000));
}

#[test]
fn scenario_e_side_output_capacity() {
  let tags = (0..6).map(|i| OutputTag::new(format!("out-{}", i)));
  let built = DoFnRunner::builder(Enrich, RunnerConfig::new("enrich"))
    .side_outputs(tags)
    .build();
  assert!(matches!(
    built.err(),
    Some(ConfigError::TooManySideOutputs {
      declared: 6,
      capacity: 5
    })
  ));
}

// Sums the grouped values of a work item and remembers the running total.
struct SumGroup;

impl DoFn<KeyedWorkItem<String, i64>, (String, i64)> for SumGroup {
  fn process_element(
    &mut self,
    element: &WindowedValue<KeyedWorkItem<String, i64>>,
    ctx: &mut ProcessContext<'_, KeyedWorkItem<String, i64>, (String, i64)>,
  ) -> Result<(), BoxError> {
    let item = element.value();
    let previous: i64 = ctx.read_state(StateNamespace::Global, "total")?.unwrap_or(0);
    let total = previous + item.elements.iter().map(|v| *v.value()).sum::<i64>();
    ctx.write_state(StateNamespace::Global, "total", &total)?;
    ctx.output((item.key.clone(), total))?;
    Ok(())
  }
}

#[test]
fn regrouped_bundles_feed_a_keyed_runner() {
  let mut regrouper = KeyedRegrouper::new(Utf8Coder);
  let mut runner = DoFnRunner::builder(SumGroup, RunnerConfig::new("sum"))
    .keyed(KvKeyEncoder::new(Utf8Coder))
    .state_store(Arc::new(InMemoryKeyedStateStore::new()))
    .build()
    .unwrap();
  let w = Window::interval(0, 10);
  let kv = |k: &str, v: i64| WindowedValue::of((k.to_string(), v), ts(v), w, PaneInfo::NO_FIRING);

  let mut totals = HashMap::new();
  for batch in [
    vec![kv("a", 1), kv("b", 2), kv("a", 3)],
    vec![kv("b", 4), kv("a", 5)],
  ] {
    let bundles = regrouper.process_bundle(batch).unwrap();
    for bundle in bundles {
      assert!(bundle.item.windows()[0].is_global());
      assert!(bundle.item.value().elements.iter().all(|v| v.windows() == [w]));
      assert!(bundle.shard(4) < 4);
      let result = runner.process_element(bundle.item).unwrap();
      for value in result.outputs.main_values() {
        let (key, total) = value.value().clone();
        totals.insert(key, total);
      }
    }
  }
  assert_eq!(totals.get("a"), Some(&9));
  assert_eq!(totals.get("b"), Some(&6));
}

#[test]
fn partitioned_watermarks_track_each_source() {
  let watermarks = PartitionedWatermarks::new();
  watermarks
    .report(0, SourceWatermarks::new(ts(10), ts(20), ts(1)))
    .unwrap();
  watermarks
    .report(1, SourceWatermarks::new(ts(5), ts(8), ts(1)))
    .unwrap();
  watermarks
    .report(0, SourceWatermarks::new(ts(15), ts(25), ts(2)))
    .unwrap();

  let snapshot = watermarks.on_batch_completed(ts(1_000)).unwrap().unwrap();
  assert_eq!(snapshot.len(), 2);
  assert_eq!(watermarks.last_watermarked_batch_time(), ts(1_000));

  watermarks.on_batch_completed(ts(2_000)).unwrap();
  assert_eq!(
    watermarks.get_source(0).unwrap(),
    Some(SourceWatermarks::new(ts(15), ts(25), ts(2)))
  );
  // Source 1 did not report in the second pass.
  assert_eq!(watermarks.get_source(1).unwrap(), None);
  assert_eq!(watermarks.get().unwrap().len(), 1);

  // Nothing queued: aggregate and batch time stay put.
  assert!(watermarks.on_batch_completed(ts(3_000)).unwrap().is_none());
  assert_eq!(watermarks.last_watermarked_batch_time(), ts(2_000));

  watermarks
    .report(0, SourceWatermarks::new(ts(16), ts(26), ts(2)))
    .unwrap();
  assert!(matches!(
    watermarks.advance(),
    Err(InternalError::SynchronizedTimeStalled { source_id: 0, .. })
  ));
  assert_eq!(watermarks.pending_reports().unwrap(), 1);
}

#[test]
fn executor_serializes_runners_per_key() {
  let executor = KeyedExecutor::new(4);
  let runners: HashMap<String, Arc<Mutex<DoFnRunner<(String, i64), String>>>> = ["a", "b", "c"]
    .iter()
    .map(|k| {
      let runner = DoFnRunner::builder(Alarm, RunnerConfig::new(format!("alarm-{}", k)))
        .keyed(KvKeyEncoder::new(Utf8Coder))
        .build()
        .unwrap();
      (k.to_string(), Arc::new(Mutex::new(runner)))
    })
    .collect();

  let bundles: Vec<_> = (0..30)
    .map(|i| {
      let k = ["a", "b", "c"][i % 3].to_string();
      let key = StructuralKey::of(&k, &Utf8Coder).unwrap();
      let runner = Arc::clone(&runners[&k]);
      let element = WindowedValue::in_global_window((k, i as i64));
      (key, move || {
        let mut runner = runner
          .try_lock()
          .map_err(|_| InternalError::TaskFailed("runner already in use".to_string()))?;
        runner.process_element(element).map(|result| result.fired_timers)
      })
    })
    .collect();

  let results = tokio_test::block_on(executor.run_bundles(bundles));
  assert_eq!(results.len(), 30);
  assert!(results.iter().all(Result::is_ok));
  for runner in runners.values() {
    assert_eq!(runner.lock().unwrap().timers().pending_count(), 1);
  }
}
