//! Request/response correlation across all children.
//!
//! Every outstanding call is a [`PendingCall`] keyed by a globally unique id.
//! Whichever of response, timeout or child exit removes the entry first
//! decides the outcome; later arrivals for the same id are dropped.

use crate::error::MuxError;
use crate::jsonrpc::{ErrorObject, FIRST_CALL_ID, JsonRpcRequest, RequestId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};

/// Where the correlator writes requests for one child.
pub trait RequestSink: Send + Sync {
    /// Logical name of the child behind this sink.
    fn child_name(&self) -> &str;

    /// Write one request to the child without waiting for a reply.
    fn write_request(&self, request: &JsonRpcRequest) -> Result<(), MuxError>;
}

type Completion = oneshot::Sender<Result<Value, MuxError>>;

struct PendingCall {
    child: String,
    completion: Completion,
}

/// Tracks outstanding calls and routes responses to them.
pub struct Correlator {
    next_id: AtomicU64,
    max_in_flight: usize,
    pending: Mutex<HashMap<u64, PendingCall>>,
}

impl Correlator {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            next_id: AtomicU64::new(FIRST_CALL_ID),
            max_in_flight,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send `method` to the child behind `sink` and wait for its response.
    pub async fn send(
        &self,
        sink: &dyn RequestSink,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, MuxError> {
        let child = sink.child_name();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            let in_flight = pending.values().filter(|call| call.child == child).count();
            if in_flight >= self.max_in_flight {
                return Err(MuxError::Overloaded {
                    child: child.to_string(),
                    limit: self.max_in_flight,
                });
            }
            pending.insert(
                id,
                PendingCall {
                    child: child.to_string(),
                    completion: tx,
                },
            );
        }

        let request = JsonRpcRequest::new(id, method, Some(params));
        if let Err(e) = sink.write_request(&request) {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        tracing::debug!(child, id, method, "Request dispatched");

        let mut rx = rx;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(MuxError::Protocol("Response channel dropped".to_string())),
            Err(_) => {
                if self.pending.lock().await.remove(&id).is_some() {
                    tracing::warn!(child, id, method, "Request timed out");
                    return Err(MuxError::Timeout {
                        child: child.to_string(),
                        method: method.to_string(),
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                // A response claimed the call right as the timer fired.
                rx.await.unwrap_or_else(|_| {
                    Err(MuxError::Protocol("Response channel dropped".to_string()))
                })
            }
        }
    }

    /// Complete the call matching `id`, provided it was sent to `child`.
    /// Returns `false` when `child` has no outstanding call with that id;
    /// the response is then discarded.
    pub async fn resolve(
        &self,
        child: &str,
        id: &RequestId,
        outcome: Result<Value, ErrorObject>,
    ) -> bool {
        let Some(key) = id.as_u64() else {
            tracing::debug!(child, "Discarding response with non-call id {id}");
            return false;
        };
        let call = {
            let mut pending = self.pending.lock().await;
            let owner = pending.get(&key).map(|call| call.child.clone());
            match owner {
                Some(owner) if owner == child => pending.remove(&key),
                Some(owner) => {
                    tracing::debug!(
                        child,
                        "Discarding response for id {id}, which belongs to '{owner}'"
                    );
                    None
                }
                None => {
                    tracing::debug!(child, "Discarding response for unknown id {id}");
                    None
                }
            }
        };
        let Some(call) = call else {
            return false;
        };
        let outcome = outcome.map_err(|err| MuxError::ChildError {
            child: call.child,
            code: err.code,
            message: err.message,
            data: err.data,
        });
        // The caller may have gone away; nothing else to do then.
        let _ = call.completion.send(outcome);
        true
    }

    /// Fail every outstanding call against `child`. Returns how many failed.
    pub async fn fail_child(&self, child: &str) -> usize {
        let failed: Vec<PendingCall> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, call)| call.child == child)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = failed.len();
        for call in failed {
            let _ = call.completion.send(Err(MuxError::ChildExited {
                child: call.child.clone(),
            }));
        }
        count
    }

    /// Number of calls currently outstanding against `child`.
    pub async fn outstanding(&self, child: &str) -> usize {
        self.pending
            .lock()
            .await
            .values()
            .filter(|call| call.child == child)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    /// Records requests instead of writing them to a process.
    struct RecordingSink {
        name: String,
        sent: std::sync::Mutex<Vec<JsonRpcRequest>>,
        fail_writes: bool,
    }

    impl RecordingSink {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                sent: std::sync::Mutex::new(Vec::new()),
                fail_writes: false,
            })
        }

        fn ids(&self) -> Vec<RequestId> {
            self.sent.lock().unwrap().iter().map(|r| r.id.clone()).collect()
        }
    }

    impl RequestSink for RecordingSink {
        fn child_name(&self) -> &str {
            &self.name
        }

        fn write_request(&self, request: &JsonRpcRequest) -> Result<(), MuxError> {
            if self.fail_writes {
                return Err(MuxError::ChildNotRunning {
                    name: self.name.clone(),
                });
            }
            self.sent.lock().unwrap().push(request.clone());
            Ok(())
        }
    }

    /// Wait until `sink` has recorded `count` requests.
    async fn wait_for_requests(sink: &RecordingSink, count: usize) -> Vec<RequestId> {
        loop {
            let ids = sink.ids();
            if ids.len() >= count {
                return ids;
            }
            tokio::task::yield_now().await;
        }
    }

    fn spawn_call(
        correlator: &Arc<Correlator>,
        sink: &Arc<RecordingSink>,
        timeout: Duration,
    ) -> tokio::task::JoinHandle<Result<Value, MuxError>> {
        let correlator = Arc::clone(correlator);
        let sink = Arc::clone(sink);
        tokio::spawn(async move {
            correlator
                .send(sink.as_ref(), "tools/call", json!({"name": "t"}), timeout)
                .await
        })
    }

    #[tokio::test]
    async fn matching_response_resolves_with_result() {
        let correlator = Arc::new(Correlator::new(8));
        let sink = RecordingSink::new("memory");
        let call = spawn_call(&correlator, &sink, Duration::from_secs(30));

        let ids = wait_for_requests(&sink, 1).await;
        assert!(correlator.resolve("memory", &ids[0], Ok(json!({"ok": true}))).await);
        assert_eq!(call.await.unwrap().unwrap(), json!({"ok": true}));
        assert_eq!(correlator.outstanding("memory").await, 0);
    }

    #[tokio::test]
    async fn ids_are_unique_and_skip_reserved_values() {
        let correlator = Arc::new(Correlator::new(8));
        let a = RecordingSink::new("a");
        let b = RecordingSink::new("b");
        let _c1 = spawn_call(&correlator, &a, Duration::from_secs(30));
        let _c2 = spawn_call(&correlator, &b, Duration::from_secs(30));
        let _c3 = spawn_call(&correlator, &a, Duration::from_secs(30));

        let mut ids = wait_for_requests(&a, 2).await;
        ids.extend(wait_for_requests(&b, 1).await);
        let mut numbers: Vec<u64> = ids
            .iter()
            .map(|id| match id {
                RequestId::Number(n) => n.as_u64().unwrap(),
                RequestId::String(s) => panic!("unexpected string id {s}"),
            })
            .collect();
        numbers.sort_unstable();
        numbers.dedup();
        assert_eq!(numbers.len(), 3);
        assert!(numbers.iter().all(|n| *n >= FIRST_CALL_ID));
    }

    #[tokio::test]
    async fn error_response_becomes_child_error() {
        let correlator = Arc::new(Correlator::new(8));
        let sink = RecordingSink::new("filesystem");
        let call = spawn_call(&correlator, &sink, Duration::from_secs(30));

        let ids = wait_for_requests(&sink, 1).await;
        let error = ErrorObject::new(-32000, "permission denied");
        assert!(correlator.resolve("filesystem", &ids[0], Err(error)).await);
        match call.await.unwrap() {
            Err(MuxError::ChildError { child, message, .. }) => {
                assert_eq!(child, "filesystem");
                assert_eq!(message, "permission denied");
            }
            other => panic!("Expected ChildError, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unmatched_and_string_ids_are_discarded() {
        let correlator = Arc::new(Correlator::new(8));
        let sink = RecordingSink::new("memory");
        let call = spawn_call(&correlator, &sink, Duration::from_secs(30));
        let ids = wait_for_requests(&sink, 1).await;
        let n = ids[0].as_u64().expect("numeric id expected");

        assert!(!correlator.resolve("memory", &RequestId::from(n + 1000), Ok(json!(1))).await);
        assert!(!correlator.resolve("memory", &RequestId::String(n.to_string()), Ok(json!(2))).await);
        assert_eq!(correlator.outstanding("memory").await, 1);

        assert!(correlator.resolve("memory", &ids[0], Ok(json!(3))).await);
        assert_eq!(call.await.unwrap().unwrap(), json!(3));
        // A duplicate response for the same id is a no-op.
        assert!(!correlator.resolve("memory", &ids[0], Ok(json!(4))).await);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_only_the_silent_call() {
        let correlator = Arc::new(Correlator::new(8));
        let slow = RecordingSink::new("slow");
        let fast = RecordingSink::new("fast");
        let timeout = Duration::from_millis(30_000);

        let started = tokio::time::Instant::now();
        let silent = spawn_call(&correlator, &slow, timeout);
        let sibling = spawn_call(&correlator, &slow, Duration::from_secs(120));
        let other = spawn_call(&correlator, &fast, Duration::from_secs(120));
        let slow_ids = wait_for_requests(&slow, 2).await;
        let fast_ids = wait_for_requests(&fast, 1).await;

        match silent.await.unwrap() {
            Err(MuxError::Timeout { timeout_ms, child, .. }) => {
                assert_eq!(timeout_ms, 30_000);
                assert_eq!(child, "slow");
            }
            other => panic!("Expected Timeout, got: {other:?}"),
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));

        // The late response for the timed-out call is dropped; the others
        // are still waiting and resolve normally.
        assert_eq!(correlator.outstanding("slow").await, 1);
        let (late, live) = (&slow_ids[0], &slow_ids[1]);
        let late_matched = correlator.resolve("slow", late, Ok(json!("late"))).await;
        let live_matched = correlator.resolve("slow", live, Ok(json!("live"))).await;
        // Spawn order does not fix write order, so accept either assignment.
        assert!(late_matched ^ live_matched);
        assert!(correlator.resolve("fast", &fast_ids[0], Ok(json!("fast"))).await);

        let sibling_result = sibling.await.unwrap().unwrap();
        assert!(sibling_result == json!("late") || sibling_result == json!("live"));
        assert_eq!(other.await.unwrap().unwrap(), json!("fast"));
    }

    #[tokio::test]
    async fn response_from_another_child_is_discarded() {
        let correlator = Arc::new(Correlator::new(8));
        let a = RecordingSink::new("a");
        let call = spawn_call(&correlator, &a, Duration::from_secs(30));
        let ids = wait_for_requests(&a, 1).await;

        assert!(!correlator.resolve("b", &ids[0], Ok(json!({"from": "b"}))).await);
        assert_eq!(correlator.outstanding("a").await, 1);

        assert!(correlator.resolve("a", &ids[0], Ok(json!({"from": "a"}))).await);
        assert_eq!(call.await.unwrap().unwrap(), json!({"from": "a"}));
    }

    #[tokio::test]
    async fn fail_child_fails_only_that_child() {
        let correlator = Arc::new(Correlator::new(8));
        let dying = RecordingSink::new("dying");
        let healthy = RecordingSink::new("healthy");
        let doomed = spawn_call(&correlator, &dying, Duration::from_secs(30));
        let survivor = spawn_call(&correlator, &healthy, Duration::from_secs(30));
        wait_for_requests(&dying, 1).await;
        let healthy_ids = wait_for_requests(&healthy, 1).await;

        assert_eq!(correlator.fail_child("dying").await, 1);
        assert!(matches!(
            doomed.await.unwrap(),
            Err(MuxError::ChildExited { child }) if child == "dying"
        ));
        assert!(correlator.resolve("healthy", &healthy_ids[0], Ok(json!({}))).await);
        assert!(survivor.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn in_flight_limit_rejects_excess_calls() {
        let correlator = Arc::new(Correlator::new(1));
        let sink = RecordingSink::new("busy");
        let _first = spawn_call(&correlator, &sink, Duration::from_secs(30));
        wait_for_requests(&sink, 1).await;

        let second = correlator
            .send(sink.as_ref(), "tools/call", json!({}), Duration::from_secs(30))
            .await;
        assert!(matches!(second, Err(MuxError::Overloaded { limit: 1, .. })));
        assert_eq!(sink.ids().len(), 1);
    }

    #[tokio::test]
    async fn failed_write_leaves_nothing_pending() {
        let correlator = Correlator::new(8);
        let sink = RecordingSink {
            name: "gone".to_string(),
            sent: std::sync::Mutex::new(Vec::new()),
            fail_writes: true,
        };
        let result = correlator
            .send(&sink, "tools/call", json!({}), Duration::from_secs(30))
            .await;
        assert!(matches!(result, Err(MuxError::ChildNotRunning { .. })));
        assert_eq!(correlator.outstanding("gone").await, 0);
    }
}
