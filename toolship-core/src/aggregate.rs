//! Fan-out over parameter values.
//!
//! [`aggregate`] runs the same operation once per distinct value, at most
//! `max_concurrency` at a time, and keeps every outcome. One failure never
//! cancels the others.

use std::collections::hash_map::{self, HashMap};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::join_all;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::info;

use crate::error::ExecError;
use crate::executor::ExecutionResult;

/// Outcome per parameter value. Keys are unique; order is not meaningful.
#[derive(Debug)]
pub struct FanOutResult<V, T = ExecutionResult, E = ExecError> {
    results: HashMap<V, Result<T, E>>,
}

impl<V: Eq + Hash, T, E> FanOutResult<V, T, E> {
    pub fn get(&self, value: &V) -> Option<&Result<T, E>> {
        self.results.get(value)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, V, Result<T, E>> {
        self.results.iter()
    }

    pub fn successes(&self) -> impl Iterator<Item = (&V, &T)> {
        self.results
            .iter()
            .filter_map(|(v, r)| r.as_ref().ok().map(|t| (v, t)))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&V, &E)> {
        self.results
            .iter()
            .filter_map(|(v, r)| r.as_ref().err().map(|e| (v, e)))
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    pub fn into_map(self) -> HashMap<V, Result<T, E>> {
        self.results
    }
}

impl<V, T, E> Serialize for FanOutResult<V, T, E>
where
    V: Serialize + Ord,
    T: Serialize,
    E: fmt::Display,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "snake_case")]
        enum Entry<'a, T> {
            Ok(&'a T),
            Error(String),
        }

        // Sorted so rendered reports are stable.
        let mut entries: Vec<_> = self.results.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, result) in entries {
            let entry = match result {
                Ok(t) => Entry::Ok(t),
                Err(e) => Entry::Error(e.to_string()),
            };
            map.serialize_entry(key, &entry)?;
        }
        map.end()
    }
}

/// Run `run` once per distinct value with bounded concurrency.
///
/// A `max_concurrency` of zero is treated as one.
pub async fn aggregate<V, T, E, F, Fut>(
    values: impl IntoIterator<Item = V>,
    max_concurrency: usize,
    run: F,
) -> FanOutResult<V, T, E>
where
    V: Eq + Hash + Clone,
    F: Fn(V) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut seen = HashSet::new();
    let values: Vec<V> = values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect();

    let permits = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let run = &run;
    let tasks = values.into_iter().map(|value| {
        let permits = Arc::clone(&permits);
        async move {
            // Never closed, so a permit is always granted.
            let _permit = permits.acquire().await.ok();
            let result = run(value.clone()).await;
            (value, result)
        }
    });

    let results: HashMap<V, Result<T, E>> = join_all(tasks).await.into_iter().collect();
    let failed = results.values().filter(|r| r.is_err()).count();
    info!(total = results.len(), failed, "Fan-out finished");
    FanOutResult { results }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_one_failure_does_not_abort_others() {
        let result = aggregate(["us-east-1", "eu-west-1", "ap-south-1"], 3, |region| async move {
            if region == "eu-west-1" {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err(format!("{region} unsupported"))
            } else {
                Ok(region.len())
            }
        })
        .await;

        assert_eq!(result.len(), 3);
        assert_eq!(result.success_count(), 2);
        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.get(&"us-east-1"), Some(&Ok(9)));
        assert!(result.get(&"eu-west-1").unwrap().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_values_run_once() {
        let calls = AtomicUsize::new(0);
        let result = aggregate(vec!["a", "b", "a"], 2, |v| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(v) }
        })
        .await;
        assert_eq!(result.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let result = aggregate(0..8, 2, |i| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(i)
            }
        })
        .await;
        assert_eq!(result.success_count(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_closure_body_runs_under_permit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = AtomicUsize::new(0);
        let result = aggregate(0..4, 1, |i| {
            // Synchronous part of the closure counts against the limit too.
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            let in_flight = Arc::clone(&in_flight);
            async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(i)
            }
        })
        .await;
        assert_eq!(result.success_count(), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_serializes_sorted_with_errors_as_text() {
        let result = aggregate(["b", "a"], 1, |v| async move {
            if v == "a" {
                Err("boom")
            } else {
                Ok(1)
            }
        })
        .await;
        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(json, r#"{"a":{"error":"boom"},"b":{"ok":1}}"#);
    }
}
