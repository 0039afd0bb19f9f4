//! The bounded priority queue, the concurrency limiter, and request
//! dispatch orchestration (spec.md §4.4 and §5).
//!
//! Grounded on `sessions::SessionManager`: one shared, cloneable handle
//! wrapping a lock over all mutable state, held across check-and-mutate
//! sequences to prevent TOCTOU races — the teacher's own comment on
//! `create_session_inner` ("Holds the write lock through the entire
//! check-and-insert to prevent TOCTOU races") states the exact discipline
//! spec.md §5 requires here. Where the teacher uses an `RwLock` (many
//! concurrent readers, rare writers), this uses a single `tokio::sync::Mutex`
//! over one state struct — spec.md §5 calls for one coarse lock covering the
//! queue, active count, counters, and latency window together, and notes no
//! protected section blocks on I/O.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

use crate::config::Config;
use crate::executor::{build_args, ProcessRunner};
use crate::metrics::{MetricsSnapshot, MetricsState};
use crate::parser;
use crate::types::{ExecutionResult, GatewayError, Outcome, Priority, Request, Response};

/// One caller's pending request, carrying its resolver (spec.md §3).
struct QueueItem {
    req_id: String,
    request: Request,
    enqueued_at: Instant,
    resolver: oneshot::Sender<Outcome>,
}

/// All scheduler-owned mutable state, behind one mutex.
struct SchedulerState {
    queue: Vec<QueueItem>,
    active: usize,
    metrics: MetricsState,
}

/// Owns the queue, the active-count limiter, and orchestrates dispatch.
/// Cloneable — all clones share the same inner state, same pattern as
/// `SessionManager`.
#[derive(Clone)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
    config: Arc<Config>,
    executor: Arc<dyn ProcessRunner>,
}

impl Scheduler {
    pub fn new(config: Arc<Config>, executor: Arc<dyn ProcessRunner>) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                queue: Vec::new(),
                active: 0,
                metrics: MetricsState::new(),
            })),
            config,
            executor,
        }
    }

    /// Admit, enqueue, or reject a request, then wait for it to resolve
    /// (spec.md §4.4's admission policy; §6's `submit` operation).
    ///
    /// A `submit` call is itself a scheduler event (spec.md §5/§9), so the
    /// queue's expired items are drained under the same lock as the
    /// admission decision — a caller waiting on a full queue must time out
    /// even if nothing else ever completes.
    pub async fn submit(&self, request: Request) -> Outcome {
        let (tx, rx) = oneshot::channel();
        let req_id = format!("{:08x}", uuid::Uuid::new_v4().as_u128() as u32);

        let to_dispatch = {
            let mut state = self.state.lock().await;
            state.metrics.total += 1;
            drain_expired(&mut state, self.config.queue_timeout_ms);

            if state.active < self.config.max_concurrent {
                state.active += 1;
                info!(req_id = %req_id, "admitted immediately");
                Some(tx)
            } else if state.queue.len() < self.config.max_queue_depth {
                insert_by_priority(
                    &mut state.queue,
                    QueueItem {
                        req_id: req_id.clone(),
                        request: request.clone(),
                        enqueued_at: Instant::now(),
                        resolver: tx,
                    },
                );
                info!(req_id = %req_id, depth = state.queue.len(), "enqueued");
                None
            } else {
                state.metrics.record_queue_rejected();
                let depth = state.queue.len();
                let max = self.config.max_queue_depth;
                warn!(req_id = %req_id, "rejected: queue full");
                let _ = tx.send(Outcome::err(GatewayError::QueueFull { depth, max }));
                None
            }
        };

        if let Some(tx) = to_dispatch {
            // Run on its own task, not the caller's — the caller must reach
            // `rx.await` immediately rather than wait out the whole pump
            // chain behind it (spec.md §5's concurrency note).
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.dispatch_one(req_id, request, tx).await;
            });
        }

        rx.await.unwrap_or_else(|_| {
            Outcome::err(GatewayError::Internal {
                detail: "resolver dropped without a response".to_string(),
            })
        })
    }

    /// Current number of running child processes.
    pub async fn active(&self) -> usize {
        self.state.lock().await.active
    }

    /// Current queue depth.
    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Consistent point-in-time snapshot of counters, gauges, and latency
    /// summary (spec.md §4.3, §5).
    pub async fn snapshot_metrics(&self) -> MetricsSnapshot {
        let state = self.state.lock().await;
        MetricsSnapshot {
            total: state.metrics.total,
            completed: state.metrics.completed,
            failed: state.metrics.failed,
            timed_out: state.metrics.timed_out,
            queue_rejected: state.metrics.queue_rejected,
            active: state.active,
            queued: state.queue.len(),
            input_tokens: state.metrics.input_tokens,
            output_tokens: state.metrics.output_tokens,
            latency: state.metrics.latency_summary(),
        }
    }

    /// Run one item through the executor and parser, record its outcome,
    /// resolve its future, then release the slot and run the dispatch loop
    /// (spec.md §4.4's "Per-item dispatch" and "Outcome mapping").
    async fn dispatch_one(&self, req_id: String, request: Request, resolver: oneshot::Sender<Outcome>) {
        let max_turns = request.max_turns.unwrap_or(self.config.default_max_turns);
        let timeout_ms = request.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let args = build_args(
            &request.prompt,
            request.model.as_deref(),
            request.system_prompt.as_deref(),
            max_turns,
            &self.config.permission_mode,
        );

        let start = Instant::now();
        let outcome = match self.executor.run(args, timeout_ms).await {
            Ok(result) => {
                self.map_execution_result(result, max_turns, timeout_ms, start.elapsed().as_millis() as u64)
                    .await
            }
            Err(e) => {
                warn!(req_id = %req_id, error = %e, "spawn failed");
                let mut state = self.state.lock().await;
                state.metrics.record_failed();
                Outcome::err(GatewayError::Internal {
                    detail: e.to_string(),
                })
            }
        };

        let _ = resolver.send(outcome);

        let mut state = self.state.lock().await;
        state.active -= 1;
        drop(state);
        self.run_dispatch_loop().await;
    }

    /// Outcome mapping table from spec.md §4.4.
    async fn map_execution_result(
        &self,
        result: ExecutionResult,
        max_turns: u32,
        timeout_ms: u64,
        elapsed_ms: u64,
    ) -> Outcome {
        if result.killed {
            let mut state = self.state.lock().await;
            state.metrics.record_timed_out();
            return Outcome::err(GatewayError::ExecutionTimeout { timeout_ms });
        }

        if result.exit_code != 0 {
            let mut state = self.state.lock().await;
            state.metrics.record_failed();
            let detail = if !result.stderr.trim().is_empty() {
                result.stderr.chars().take(500).collect()
            } else {
                format!("exit code {}", result.exit_code)
            };
            return Outcome::err(GatewayError::ProcessFailure { detail });
        }

        let parsed = parser::parse(&result.stdout);
        if parsed.max_turns_exhausted {
            let mut state = self.state.lock().await;
            state.metrics.record_failed();
            return Outcome::err(GatewayError::MaxTurnsExhausted { max_turns });
        }

        let mut state = self.state.lock().await;
        state
            .metrics
            .record_completed(elapsed_ms, parsed.input_tokens, parsed.output_tokens);
        Outcome::ok(Response::success(parsed))
    }

    /// Drain queue-timed-out items from the tail (so indices stay valid),
    /// then promote items while a slot is free, re-checking the popped
    /// item's deadline as a race guard (spec.md §4.4's "Dispatch loop").
    ///
    /// Each promoted item is handed to its own spawned task rather than run
    /// inline: this loop only ever holds the lock briefly to pop an item and
    /// bump `active`, it never waits out an item's execution, so a long
    /// backlog cannot inflate the latency of the task that triggered it.
    async fn run_dispatch_loop(&self) {
        loop {
            let next = {
                let mut state = self.state.lock().await;
                drain_expired(&mut state, self.config.queue_timeout_ms);

                if state.active >= self.config.max_concurrent || state.queue.is_empty() {
                    None
                } else {
                    let item = state.queue.remove(0);
                    if item.enqueued_at.elapsed().as_millis() as u64 > self.config.queue_timeout_ms {
                        state.metrics.record_timed_out();
                        let waited_ms = item.enqueued_at.elapsed().as_millis() as u64;
                        let _ = item
                            .resolver
                            .send(Outcome::err(GatewayError::QueueTimeout { waited_ms }));
                        continue;
                    }
                    state.active += 1;
                    Some(item)
                }
            };

            match next {
                Some(item) => {
                    let scheduler = self.clone();
                    tokio::spawn(async move {
                        scheduler
                            .dispatch_one(item.req_id, item.request, item.resolver)
                            .await;
                    });
                }
                None => return,
            }
        }
    }
}

/// Insert maintaining spec.md §3's ordering: strictly higher priority first,
/// FIFO within equal priority. Acceptable as sorted linear insertion given
/// the small default queue depth (spec.md §9).
fn insert_by_priority(queue: &mut Vec<QueueItem>, item: QueueItem) {
    let rank = priority_rank(&item.request.priority);
    let pos = queue
        .iter()
        .position(|existing| priority_rank(&existing.request.priority) > rank)
        .unwrap_or(queue.len());
    queue.insert(pos, item);
}

fn priority_rank(p: &Priority) -> u8 {
    p.rank()
}

/// Reject any queue item whose wait has exceeded `queue_timeout_ms`,
/// scanning from the tail so earlier indices stay valid after removal
/// (spec.md §4.4's "Late drain").
fn drain_expired(state: &mut SchedulerState, queue_timeout_ms: u64) {
    let mut i = state.queue.len();
    while i > 0 {
        i -= 1;
        let waited_ms = state.queue[i].enqueued_at.elapsed().as_millis() as u64;
        if waited_ms > queue_timeout_ms {
            let item = state.queue.remove(i);
            state.metrics.record_timed_out();
            let _ = item
                .resolver
                .send(Outcome::err(GatewayError::QueueTimeout { waited_ms }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::mock::{MockExecutor, MockOutcome};
    use crate::types::ExecutionResult;
    use std::sync::Arc;
    use std::time::Duration;

    fn cfg(max_concurrent: usize, max_queue_depth: usize, queue_timeout_ms: u64) -> Arc<Config> {
        Arc::new(Config {
            max_concurrent,
            max_queue_depth,
            queue_timeout_ms,
            default_timeout_ms: 5_000,
            ..Config::default()
        })
    }

    fn req(prompt: &str, priority: Priority) -> Request {
        Request {
            prompt: prompt.to_string(),
            model: None,
            system_prompt: None,
            max_turns: None,
            timeout_ms: None,
            priority,
        }
    }

    #[tokio::test]
    async fn simple_success_records_completed_and_tokens() {
        let executor = Arc::new(MockExecutor::new(vec![MockOutcome::Result(ExecutionResult {
            stdout: r#"{"result":"ok","input_tokens":10,"output_tokens":5,"model":"sonnet"}"#.to_string(),
            stderr: String::new(),
            exit_code: 0,
            killed: false,
        })]));
        let scheduler = Scheduler::new(cfg(5, 20, 60_000), executor);

        let outcome = scheduler.submit(req("hi", Priority::Normal)).await;
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.body.text, "ok");
        assert_eq!(outcome.body.model.as_deref(), Some("sonnet"));
        assert_eq!(outcome.body.input_tokens, Some(10));
        assert_eq!(outcome.body.output_tokens, Some(5));

        let snap = scheduler.snapshot_metrics().await;
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.input_tokens, 10);
        assert_eq!(snap.output_tokens, 5);
    }

    #[tokio::test]
    async fn empty_scheduler_dispatches_without_touching_queue() {
        let executor = Arc::new(MockExecutor::new(vec![MockOutcome::Result(ExecutionResult {
            stdout: r#"{"result":"ok"}"#.to_string(),
            exit_code: 0,
            ..Default::default()
        })]));
        let scheduler = Scheduler::new(cfg(5, 20, 60_000), executor);
        let _ = scheduler.submit(req("hi", Priority::Normal)).await;
        assert_eq!(scheduler.queued().await, 0);
    }

    #[tokio::test]
    async fn priority_overtake_dispatches_high_before_earlier_normal() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let executor = Arc::new(MockExecutor::new(vec![
            MockOutcome::Blocked(
                gate.clone(),
                ExecutionResult {
                    stdout: r#"{"result":"A"}"#.to_string(),
                    exit_code: 0,
                    ..Default::default()
                },
            ),
            MockOutcome::Result(ExecutionResult {
                stdout: r#"{"result":"C"}"#.to_string(),
                exit_code: 0,
                ..Default::default()
            }),
            MockOutcome::Result(ExecutionResult {
                stdout: r#"{"result":"B"}"#.to_string(),
                exit_code: 0,
                ..Default::default()
            }),
        ]));
        let scheduler = Scheduler::new(cfg(1, 10, 60_000), executor);

        let s1 = scheduler.clone();
        let a = tokio::spawn(async move { s1.submit(req("A", Priority::Normal)).await });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let s2 = scheduler.clone();
        let b = tokio::spawn(async move { s2.submit(req("B", Priority::Normal)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let s3 = scheduler.clone();
        let c = tokio::spawn(async move { s3.submit(req("C", Priority::High)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(scheduler.queued().await, 2);
        gate.notify_one();

        let (a_res, c_res, b_res) = tokio::join!(a, b, c);
        assert_eq!(a_res.unwrap().body.text, "A");
        assert_eq!(c_res.unwrap().body.text, "C");
        assert_eq!(b_res.unwrap().body.text, "B");
    }

    #[tokio::test]
    async fn queue_full_rejects_without_dispatching() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let executor = Arc::new(MockExecutor::new(vec![MockOutcome::Blocked(
            gate.clone(),
            ExecutionResult::default(),
        )]));
        let scheduler = Scheduler::new(cfg(1, 1, 60_000), executor);

        let s1 = scheduler.clone();
        let a = tokio::spawn(async move { s1.submit(req("A", Priority::Normal)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let s2 = scheduler.clone();
        let _b = tokio::spawn(async move { s2.submit(req("B", Priority::Normal)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = scheduler.submit(req("C", Priority::Normal)).await;
        assert_eq!(outcome.status, 503);
        assert!(outcome.body.error.as_deref().unwrap().contains("Queue full (1/1)"));

        let snap = scheduler.snapshot_metrics().await;
        assert_eq!(snap.queue_rejected, 1);

        gate.notify_one();
        let _ = a.await;
    }

    #[tokio::test(start_paused = true)]
    async fn queue_timeout_resolves_after_waiting_too_long() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let executor = Arc::new(MockExecutor::new(vec![
            MockOutcome::Blocked(gate.clone(), ExecutionResult::default()),
            MockOutcome::Result(ExecutionResult {
                stdout: r#"{"result":"ok"}"#.to_string(),
                exit_code: 0,
                ..Default::default()
            }),
        ]));
        let scheduler = Scheduler::new(cfg(1, 10, 50), executor);

        let s1 = scheduler.clone();
        let a = tokio::spawn(async move { s1.submit(req("A", Priority::Normal)).await });
        tokio::time::advance(Duration::from_millis(1)).await;

        let s2 = scheduler.clone();
        let b = tokio::spawn(async move { s2.submit(req("B", Priority::Normal)).await });

        tokio::time::advance(Duration::from_millis(100)).await;
        gate.notify_one();

        let b_outcome = b.await.unwrap();
        assert_eq!(b_outcome.status, 408);
        assert!(b_outcome
            .body
            .error
            .as_deref()
            .unwrap()
            .contains("Queued for too long"));

        let snap = scheduler.snapshot_metrics().await;
        assert_eq!(snap.timed_out, 1);
        let _ = a.await;
    }

    #[tokio::test]
    async fn execution_timeout_maps_to_504() {
        let executor = Arc::new(MockExecutor::new(vec![MockOutcome::Result(ExecutionResult {
            killed: true,
            ..Default::default()
        })]));
        let scheduler = Scheduler::new(cfg(1, 10, 60_000), executor);

        let outcome = scheduler.submit(req("hi", Priority::Normal)).await;
        assert_eq!(outcome.status, 504);
        assert!(outcome.body.error.as_deref().unwrap().contains("timed out"));

        let snap = scheduler.snapshot_metrics().await;
        assert_eq!(snap.timed_out, 1);
    }

    #[tokio::test]
    async fn max_turns_exhaustion_maps_to_422() {
        let executor = Arc::new(MockExecutor::new(vec![MockOutcome::Result(ExecutionResult {
            stdout: r#"{"result":"Reached max turns limit"}"#.to_string(),
            exit_code: 0,
            ..Default::default()
        })]));
        let scheduler = Scheduler::new(cfg(1, 10, 60_000), executor);

        let outcome = scheduler.submit(req("hi", Priority::Normal)).await;
        assert_eq!(outcome.status, 422);
        assert!(outcome.body.error.as_deref().unwrap().contains("max turns"));

        let snap = scheduler.snapshot_metrics().await;
        assert_eq!(snap.failed, 1);
    }

    #[tokio::test]
    async fn process_failure_maps_to_502_with_stderr() {
        let executor = Arc::new(MockExecutor::new(vec![MockOutcome::Result(ExecutionResult {
            exit_code: 1,
            stderr: "Something went wrong".to_string(),
            ..Default::default()
        })]));
        let scheduler = Scheduler::new(cfg(1, 10, 60_000), executor);

        let outcome = scheduler.submit(req("hi", Priority::Normal)).await;
        assert_eq!(outcome.status, 502);
        assert!(outcome
            .body
            .error
            .as_deref()
            .unwrap()
            .contains("Something went wrong"));

        let snap = scheduler.snapshot_metrics().await;
        assert_eq!(snap.failed, 1);
    }

    #[tokio::test]
    async fn total_accounts_for_every_terminal_outcome() {
        let executor = Arc::new(MockExecutor::new(vec![
            MockOutcome::Result(ExecutionResult {
                stdout: r#"{"result":"ok"}"#.to_string(),
                exit_code: 0,
                ..Default::default()
            }),
            MockOutcome::Result(ExecutionResult {
                exit_code: 1,
                stderr: "boom".to_string(),
                ..Default::default()
            }),
        ]));
        let scheduler = Scheduler::new(cfg(2, 10, 60_000), executor);

        let _ = scheduler.submit(req("A", Priority::Normal)).await;
        let _ = scheduler.submit(req("B", Priority::Normal)).await;

        let snap = scheduler.snapshot_metrics().await;
        assert_eq!(snap.total, 2);
        assert_eq!(
            snap.completed + snap.failed + snap.timed_out + snap.queue_rejected,
            2
        );
    }
}
