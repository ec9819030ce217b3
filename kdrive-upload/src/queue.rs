use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, Weak},
};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::operation::{OperationDeps, OperationReport, UploadOperation};
use crate::record::{Lane, UploadRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Finished { lane: Lane, report: OperationReport },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    NotTracked,
    /// Removed before it started.
    Dequeued,
    /// Asked to stop; its report follows as a queue event.
    Running,
}

#[derive(Debug)]
struct Pending {
    record_id: String,
    priority: i32,
}

#[derive(Default)]
struct QueueState {
    operations: HashMap<String, Arc<UploadOperation>>,
    pending: VecDeque<Pending>,
    running: HashSet<String>,
    limit: usize,
    suspended: bool,
}

/// One lane of uploads. Holds at most one operation per record id and runs
/// up to `limit` of them at once, highest priority first.
pub struct UploadQueue {
    lane: Lane,
    deps: Arc<OperationDeps>,
    state: Mutex<QueueState>,
    events: mpsc::UnboundedSender<QueueEvent>,
    this: Weak<UploadQueue>,
}

impl UploadQueue {
    pub fn new(
        lane: Lane,
        deps: Arc<OperationDeps>,
        limit: usize,
        events: mpsc::UnboundedSender<QueueEvent>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            lane,
            deps,
            state: Mutex::new(QueueState {
                limit: limit.max(1),
                ..QueueState::default()
            }),
            events,
            this: this.clone(),
        })
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Tracks `record` and starts it when a slot is free. Returns `false`
    /// when it is already tracked, uploaded or out of budget.
    pub fn add(&self, record: &UploadRecord) -> bool {
        if !record.is_pending() || !record.can_retry() {
            return false;
        }
        {
            let Ok(mut state) = self.state.lock() else {
                return false;
            };
            if state.operations.contains_key(&record.id) {
                return false;
            }
            let operation = Arc::new(UploadOperation::new(
                record.id.clone(),
                Arc::clone(&self.deps),
            ));
            state.operations.insert(record.id.clone(), operation);
            let index = state
                .pending
                .iter()
                .position(|pending| pending.priority < record.priority)
                .unwrap_or(state.pending.len());
            state.pending.insert(
                index,
                Pending {
                    record_id: record.id.clone(),
                    priority: record.priority,
                },
            );
        }
        debug!(lane = self.lane.as_str(), record_id = %record.id, "upload queued");
        self.pump();
        true
    }

    pub fn cancel(&self, record_id: &str) -> CancelResult {
        let Ok(mut state) = self.state.lock() else {
            return CancelResult::NotTracked;
        };
        let Some(operation) = state.operations.get(record_id).cloned() else {
            return CancelResult::NotTracked;
        };
        if state.running.contains(record_id) {
            operation.cancel();
            return CancelResult::Running;
        }
        state.pending.retain(|pending| pending.record_id != record_id);
        state.operations.remove(record_id);
        CancelResult::Dequeued
    }

    pub fn suspend(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.suspended = true;
        }
        info!(lane = self.lane.as_str(), "upload queue suspended");
    }

    pub fn resume(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.suspended = false;
        }
        info!(lane = self.lane.as_str(), "upload queue resumed");
        self.pump();
    }

    pub fn is_suspended(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.suspended)
            .unwrap_or(true)
    }

    pub fn set_parallelism(&self, limit: usize) {
        let changed = match self.state.lock() {
            Ok(mut state) => {
                let changed = state.limit != limit.max(1);
                state.limit = limit.max(1);
                changed
            }
            Err(_) => false,
        };
        if changed {
            debug!(lane = self.lane.as_str(), limit, "lane parallelism changed");
            self.pump();
        }
    }

    pub fn parallelism(&self) -> usize {
        self.state.lock().map(|state| state.limit).unwrap_or(1)
    }

    pub fn operation(&self, record_id: &str) -> Option<Arc<UploadOperation>> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.operations.get(record_id).cloned())
    }

    pub fn is_tracked(&self, record_id: &str) -> bool {
        self.operation(record_id).is_some()
    }

    pub fn running_operations(&self) -> Vec<Arc<UploadOperation>> {
        self.state
            .lock()
            .map(|state| {
                state
                    .running
                    .iter()
                    .filter_map(|id| state.operations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn tracked_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.operations.len())
            .unwrap_or_default()
    }

    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.running.len())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.pending.len())
            .unwrap_or_default()
    }

    /// Starts pending operations while slots are free.
    fn pump(&self) {
        let Some(queue) = self.this.upgrade() else {
            return;
        };
        loop {
            let operation = {
                let Ok(mut state) = self.state.lock() else {
                    return;
                };
                if state.suspended || state.running.len() >= state.limit {
                    return;
                }
                let Some(next) = state.pending.pop_front() else {
                    return;
                };
                let Some(operation) = state.operations.get(&next.record_id).cloned() else {
                    continue;
                };
                state.running.insert(next.record_id);
                operation
            };

            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let report = Arc::clone(&operation).run().await;
                queue.finished(operation.record_id(), report);
            });
        }
    }

    fn finished(&self, record_id: &str, report: OperationReport) {
        if let Ok(mut state) = self.state.lock() {
            state.running.remove(record_id);
            state.operations.remove(record_id);
        }
        let _ = self.events.send(QueueEvent::Finished {
            lane: self.lane,
            report,
        });
        self.pump();
    }
}
