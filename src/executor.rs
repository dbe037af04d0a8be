//! # Keyed Executor
//!
//! Bundle-level parallelism with per-key serialization.
//!
//! Independent bundles run concurrently on tokio tasks, bounded by a
//! semaphore. Before a bundle runs it takes the lock of its key from a
//! [`KeyLockTable`], so at most one invocation (element processing or timer
//! firing) is active per key while distinct keys proceed in parallel.
//!
//! No ordering is guaranteed across bundles. Bundles of one key run in the
//! order they acquire the key's lock.

use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, trace};

use crate::codec::StructuralKey;
use crate::error::{ExecutionError, ExecutionResult, InternalError};
use crate::state::StateError;

/// Exclusive hold on one key. Released on drop.
pub struct KeyGuard {
  key: StructuralKey,
  _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
  /// The locked key.
  pub fn key(&self) -> &StructuralKey {
    &self.key
  }
}

/// One async lock per structural key.
///
/// Entries are created on first use. [`KeyLockTable::prune`] drops the ones
/// nobody holds or waits on.
#[derive(Default)]
pub struct KeyLockTable {
  locks: Mutex<HashMap<StructuralKey, Arc<AsyncMutex<()>>>>,
}

impl KeyLockTable {
  /// Creates an empty table.
  pub fn new() -> Self {
    Self::default()
  }

  /// Waits for exclusive access to `key`.
  pub async fn lock(&self, key: &StructuralKey) -> Result<KeyGuard, InternalError> {
    let lock = {
      let mut locks = self.locks.lock().map_err(|_| StateError::LockPoisoned)?;
      Arc::clone(locks.entry(key.clone()).or_default())
    };
    let guard = lock.lock_owned().await;
    Ok(KeyGuard {
      key: key.clone(),
      _guard: guard,
    })
  }

  /// Removes idle entries and returns how many were dropped.
  pub fn prune(&self) -> Result<usize, InternalError> {
    let mut locks = self.locks.lock().map_err(|_| StateError::LockPoisoned)?;
    let before = locks.len();
    locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    Ok(before - locks.len())
  }

  /// Number of keys with an entry.
  pub fn len(&self) -> Result<usize, InternalError> {
    Ok(self.locks.lock().map_err(|_| StateError::LockPoisoned)?.len())
  }

  /// Returns true if no key has an entry.
  pub fn is_empty(&self) -> Result<bool, InternalError> {
    Ok(self.len()? == 0)
  }
}

/// Runs keyed work with bounded parallelism and per-key exclusion.
#[derive(Clone)]
pub struct KeyedExecutor {
  locks: Arc<KeyLockTable>,
  permits: Arc<Semaphore>,
  max_concurrency: usize,
}

impl KeyedExecutor {
  /// Creates an executor running at most `max_concurrency` bundles at once.
  /// Zero is treated as one.
  #[must_use]
  pub fn new(max_concurrency: usize) -> Self {
    let max_concurrency = max_concurrency.max(1);
    Self {
      locks: Arc::new(KeyLockTable::new()),
      permits: Arc::new(Semaphore::new(max_concurrency)),
      max_concurrency,
    }
  }

  /// Maximum number of bundles running at once.
  pub fn max_concurrency(&self) -> usize {
    self.max_concurrency
  }

  /// The key lock table.
  pub fn locks(&self) -> &KeyLockTable {
    &self.locks
  }

  /// Runs `work` while holding the lock of `key` and a permit.
  ///
  /// The key lock is taken first: callers queued behind a busy key hold no
  /// permit while they wait.
  pub async fn run_keyed<T, F, Fut>(&self, key: &StructuralKey, work: F) -> ExecutionResult<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ExecutionResult<T>>,
  {
    let _guard = self.locks.lock(key).await?;
    trace!(key = ?key, "key locked");
    let _permit = self
      .permits
      .acquire()
      .await
      .map_err(|_| InternalError::TaskFailed("executor semaphore closed".to_string()))?;
    work().await
  }

  /// Runs synchronous bundles concurrently, each on its own task under its
  /// key's lock. Results come back in input order.
  ///
  /// A task that panics yields [`InternalError::TaskFailed`] for its slot;
  /// the other bundles are unaffected.
  pub async fn run_bundles<T, F>(&self, bundles: Vec<(StructuralKey, F)>) -> Vec<ExecutionResult<T>>
  where
    T: Send + 'static,
    F: FnOnce() -> ExecutionResult<T> + Send + 'static,
  {
    let count = bundles.len();
    let handles: Vec<_> = bundles
      .into_iter()
      .map(|(key, work)| {
        let executor = self.clone();
        tokio::spawn(async move { executor.run_keyed(&key, || async move { work() }).await })
      })
      .collect();

    let results: Vec<ExecutionResult<T>> = join_all(handles)
      .await
      .into_iter()
      .map(|joined| {
        joined.unwrap_or_else(|err| Err(ExecutionError::from(InternalError::TaskFailed(err.to_string()))))
      })
      .collect();
    let failed = results.iter().filter(|r| r.is_err()).count();
    debug!(bundles = count, failed, "keyed bundles finished");
    results
  }
}

impl Default for KeyedExecutor {
  fn default() -> Self {
    Self::new(std::thread::available_parallelism().map_or(1, |n| n.get()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;
  use tokio::sync::Barrier;

  fn key(name: &str) -> StructuralKey {
    StructuralKey::from_encoded(name.as_bytes().to_vec())
  }

  #[tokio::test]
  async fn same_key_is_serialized() {
    let executor = KeyedExecutor::new(4);
    let log = Arc::new(Mutex::new(Vec::new()));
    let k = key("a");

    let first = executor.run_keyed(&k, || {
      let log = Arc::clone(&log);
      async move {
        log.lock().unwrap().push("first-start");
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.lock().unwrap().push("first-end");
        Ok(1)
      }
    });
    let second = executor.run_keyed(&k, || {
      let log = Arc::clone(&log);
      async move {
        log.lock().unwrap().push("second-start");
        Ok(2)
      }
    });
    let (a, b) = tokio::join!(first, second);
    assert_eq!(a.unwrap(), 1);
    assert_eq!(b.unwrap(), 2);
    assert_eq!(
      *log.lock().unwrap(),
      vec!["first-start", "first-end", "second-start"]
    );
  }

  #[tokio::test]
  async fn distinct_keys_run_concurrently() {
    let executor = KeyedExecutor::new(2);
    let barrier = Arc::new(Barrier::new(2));
    let wait = |name: &'static str| {
      let barrier = Arc::clone(&barrier);
      let executor = executor.clone();
      async move {
        executor
          .run_keyed(&key(name), || async move {
            tokio::time::timeout(Duration::from_secs(2), barrier.wait())
              .await
              .map(|_| ())
              .map_err(|_| InternalError::TaskFailed("barrier timed out".to_string()).into())
          })
          .await
      }
    };
    let (a, b) = tokio::join!(wait("a"), wait("b"));
    assert!(a.is_ok());
    assert!(b.is_ok());
  }

  #[tokio::test]
  async fn results_keep_input_order() {
    let executor = KeyedExecutor::new(3);
    let bundles: Vec<(StructuralKey, _)> = (0..10)
      .map(|i| (key(&format!("k{}", i % 3)), move || Ok::<_, ExecutionError>(i * 10)))
      .collect();
    let results = executor.run_bundles(bundles).await;
    let values: Vec<i32> = results.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(values, (0..10).map(|i| i * 10).collect::<Vec<_>>());
  }

  #[tokio::test]
  async fn panicking_bundle_reports_task_failure() {
    let executor = KeyedExecutor::new(2);
    let bundles: Vec<(StructuralKey, Box<dyn FnOnce() -> ExecutionResult<u8> + Send>)> = vec![
      (key("a"), Box::new(|| -> ExecutionResult<u8> { Ok(1) })),
      (key("b"), Box::new(|| -> ExecutionResult<u8> { panic!("boom") })),
      (key("a"), Box::new(|| -> ExecutionResult<u8> { Ok(3) })),
    ];
    let results = executor.run_bundles(bundles).await;
    assert_eq!(*results[0].as_ref().unwrap(), 1);
    assert!(matches!(
      results[1],
      Err(ExecutionError::Internal(InternalError::TaskFailed(_)))
    ));
    assert_eq!(*results[2].as_ref().unwrap(), 3);
  }

  #[tokio::test]
  async fn prune_drops_idle_entries() {
    let table = KeyLockTable::new();
    let held = table.lock(&key("held")).await.unwrap();
    drop(table.lock(&key("idle")).await.unwrap());
    assert_eq!(table.len().unwrap(), 2);
    assert_eq!(table.prune().unwrap(), 1);
    assert_eq!(table.len().unwrap(), 1);
    assert_eq!(held.key(), &key("held"));
    drop(held);
    assert_eq!(table.prune().unwrap(), 1);
    assert!(table.is_empty().unwrap());
  }

  #[tokio::test]
  async fn busy_key_does_not_starve_other_keys() {
    let executor = KeyedExecutor::new(1);
    let hot = executor.locks().lock(&key("hot")).await.unwrap();

    let waiter = {
      let executor = executor.clone();
      tokio::spawn(async move { executor.run_keyed(&key("hot"), || async { Ok(1) }).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let cold = tokio::time::timeout(
      Duration::from_secs(1),
      executor.run_keyed(&key("cold"), || async { Ok(2) }),
    )
    .await
    .expect("cold key waited on the busy one");
    assert_eq!(cold.unwrap(), 2);

    drop(hot);
    assert_eq!(waiter.await.unwrap().unwrap(), 1);
  }

  proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn at_most_one_active_invocation_per_key(keys in prop::collection::vec(0usize..4, 1..40)) {
      let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap();
      let active: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
      let violations = Arc::new(AtomicUsize::new(0));

      let bundles: Vec<(StructuralKey, _)> = keys
        .iter()
        .map(|&k| {
          let active = Arc::clone(&active);
          let violations = Arc::clone(&violations);
          (key(&k.to_string()), move || {
            if active[k].fetch_add(1, Ordering::SeqCst) != 0 {
              violations.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::sleep(Duration::from_micros(200));
            active[k].fetch_sub(1, Ordering::SeqCst);
            Ok::<_, ExecutionError>(k)
          })
        })
        .collect();

      let results = runtime.block_on(KeyedExecutor::new(4).run_bundles(bundles));
      prop_assert_eq!(violations.load(Ordering::SeqCst), 0);
      let returned: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
      prop_assert_eq!(returned, keys);
    }
  }
}
