// Operations and the priority queue they wait in.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Settings;
use crate::constants::{PRIORITY_ONE_SHOT, PRIORITY_STREAM, PRIORITY_TIMELAPSE};
use crate::logging::new_correlation_id;
use crate::stream::StreamSettings;
use crate::timelapse::SessionSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Stream,
    OneShotCapture,
    #[serde(rename = "time-lapse")]
    Timelapse,
}

impl OperationKind {
    pub fn default_priority(self) -> i32 {
        match self {
            OperationKind::OneShotCapture => PRIORITY_ONE_SHOT,
            OperationKind::Timelapse => PRIORITY_TIMELAPSE,
            OperationKind::Stream => PRIORITY_STREAM,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Stream => "stream",
            OperationKind::OneShotCapture => "one-shot-capture",
            OperationKind::Timelapse => "time-lapse",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationState {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
}

/// Per-kind state saved at pause and restored at resume.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Progress {
    #[default]
    None,
    Stream {
        was_active: bool,
        settings: Option<StreamSettings>,
    },
    Timelapse(SessionSnapshot),
}

#[derive(Debug, Clone)]
pub struct Operation {
    pub id: u64,
    pub kind: OperationKind,
    pub priority: i32,
    /// Fixed for the lifetime of the operation.
    pub config: Arc<Settings>,
    pub state: OperationState,
    pub progress: Progress,
    pub created_at: DateTime<Utc>,
    pub correlation_id: String,
}

impl Operation {
    pub fn new(id: u64, kind: OperationKind, config: Arc<Settings>) -> Self {
        Self {
            id,
            kind,
            priority: kind.default_priority(),
            config,
            state: OperationState::Queued,
            progress: Progress::None,
            created_at: Utc::now(),
            correlation_id: new_correlation_id(),
        }
    }

    pub fn summary(&self) -> OperationSummary {
        OperationSummary {
            id: self.id,
            kind: self.kind,
            priority: self.priority,
            state: self.state,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSummary {
    pub id: u64,
    pub kind: OperationKind,
    pub priority: i32,
    pub state: OperationState,
    pub created_at: DateTime<Utc>,
}

/// Heap entry: higher priority first, then lower sequence (earlier arrival).
#[derive(Debug)]
struct Entry {
    seq: u64,
    op: Operation,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.op.priority == other.op.priority && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.op
            .priority
            .cmp(&other.op.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Ordered by (priority desc, arrival asc). A paused operation keeps its
/// original arrival position so it does not fall behind later equals.
#[derive(Debug, Default)]
pub struct OperationQueue {
    heap: BinaryHeap<Entry>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: Operation) {
        let seq = op.id;
        self.heap.push(Entry { seq, op });
    }

    pub fn pop(&mut self) -> Option<Operation> {
        self.heap.pop().map(|e| e.op)
    }

    pub fn peek(&self) -> Option<&Operation> {
        self.heap.peek().map(|e| &e.op)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains_kind(&self, kind: OperationKind) -> bool {
        self.heap.iter().any(|e| e.op.kind == kind)
    }

    /// Remove every queued operation of `kind`, returning them.
    pub fn remove_kind(&mut self, kind: OperationKind) -> Vec<Operation> {
        let mut removed = Vec::new();
        let mut kept = BinaryHeap::with_capacity(self.heap.len());
        for entry in self.heap.drain() {
            if entry.op.kind == kind {
                removed.push(entry.op);
            } else {
                kept.push(entry);
            }
        }
        self.heap = kept;
        removed.sort_by_key(|op| op.id);
        removed
    }

    /// Queue contents in dequeue order.
    pub fn summaries(&self) -> Vec<OperationSummary> {
        let mut entries: Vec<&Entry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.iter().map(|e| e.op.summary()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: u64, kind: OperationKind) -> Operation {
        Operation::new(id, kind, Arc::new(Settings::default()))
    }

    #[test]
    fn test_kind_serializes_like_mode() {
        for kind in [OperationKind::Stream, OperationKind::OneShotCapture, OperationKind::Timelapse] {
            assert_eq!(serde_json::to_value(kind).unwrap(), serde_json::json!(kind.as_str()));
        }
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut queue = OperationQueue::new();
        queue.push(op(1, OperationKind::Stream));
        queue.push(op(2, OperationKind::Timelapse));
        queue.push(op(3, OperationKind::OneShotCapture));
        queue.push(op(4, OperationKind::OneShotCapture));

        let order: Vec<u64> = std::iter::from_fn(|| queue.pop()).map(|o| o.id).collect();
        assert_eq!(order, vec![3, 4, 2, 1]);
    }

    #[test]
    fn test_requeued_operation_keeps_arrival_order() {
        let mut queue = OperationQueue::new();
        queue.push(op(7, OperationKind::Stream));
        queue.push(op(2, OperationKind::Stream));
        assert_eq!(queue.peek().map(|o| o.id), Some(2));
    }

    #[test]
    fn test_remove_kind() {
        let mut queue = OperationQueue::new();
        queue.push(op(1, OperationKind::Stream));
        queue.push(op(2, OperationKind::Timelapse));
        assert!(queue.contains_kind(OperationKind::Stream));

        let removed = queue.remove_kind(OperationKind::Stream);
        assert_eq!(removed.len(), 1);
        assert_eq!(queue.len(), 1);
        assert!(!queue.contains_kind(OperationKind::Stream));
        assert_eq!(queue.summaries()[0].kind, OperationKind::Timelapse);
    }
}
