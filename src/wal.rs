//! Contract with the local write-ahead log. The engine appends operations,
//! waits on the durability barrier, and truncates on log-matching
//! conflicts; the log's on-disk format and I/O scheduling belong to the
//! embedding process.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::consensus::{OpId, ReplicateMsg};
use crate::replication::cache::LogReader;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("append out of order: {attempted} after {last}")]
    OutOfOrder { last: OpId, attempted: OpId },
    #[error("log I/O error: {0}")]
    Io(String),
}

/// The durable operation log as the consensus engine sees it. All methods
/// are callable from multiple engine threads.
pub trait OperationLog: LogReader + Send + Sync {
    /// Appends operations in index order. Durability is asynchronous;
    /// callers observe it via [`OperationLog::wait_durable`].
    fn append(&self, ops: &[Arc<ReplicateMsg>]) -> Result<(), LogError>;

    /// Blocks until everything up to `upto` is durable, or `timeout`
    /// passes. Returns whether the barrier was reached.
    fn wait_durable(&self, upto: OpId, timeout: Duration) -> Result<bool, LogError>;

    fn last_appended(&self) -> OpId;

    /// Index of the earliest operation still readable, or 0 on an empty
    /// log. Peers needing anything earlier require a full copy.
    fn first_index(&self) -> u64;

    fn truncate_after(&self, index: u64) -> Result<(), LogError>;
}

struct InMemoryInner {
    ops: BTreeMap<u64, Arc<ReplicateMsg>>,
    last_appended: OpId,
}

/// A log that is durable the moment `append` returns. Backs tests and
/// single-process harnesses.
pub struct InMemoryLog {
    inner: Mutex<InMemoryInner>,
}

impl InMemoryLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(InMemoryInner {
                ops: BTreeMap::new(),
                last_appended: OpId::GENESIS,
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ops.is_empty()
    }
}

impl LogReader for InMemoryLog {
    fn read_op(&self, index: u64) -> Option<Arc<ReplicateMsg>> {
        self.inner.lock().ops.get(&index).cloned()
    }
}

impl OperationLog for InMemoryLog {
    fn append(&self, ops: &[Arc<ReplicateMsg>]) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        for op in ops {
            let id = op.id();
            if !(id > inner.last_appended && id.index == inner.last_appended.index + 1) {
                return Err(LogError::OutOfOrder {
                    last: inner.last_appended,
                    attempted: id,
                });
            }
            inner.ops.insert(id.index, op.clone());
            inner.last_appended = id;
        }
        Ok(())
    }

    fn wait_durable(&self, upto: OpId, _timeout: Duration) -> Result<bool, LogError> {
        let inner = self.inner.lock();
        Ok(inner.last_appended >= upto)
    }

    fn last_appended(&self) -> OpId {
        self.inner.lock().last_appended
    }

    fn first_index(&self) -> u64 {
        self.inner
            .lock()
            .ops
            .keys()
            .next()
            .copied()
            .unwrap_or(0)
    }

    fn truncate_after(&self, index: u64) -> Result<(), LogError> {
        let mut inner = self.inner.lock();
        let doomed: Vec<u64> = inner.ops.range(index + 1..).map(|(idx, _)| *idx).collect();
        for idx in doomed {
            inner.ops.remove(&idx);
        }
        inner.last_appended = inner
            .ops
            .values()
            .next_back()
            .map(|op| op.id())
            .unwrap_or(OpId::GENESIS);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::OpType;

    fn msg(term: u64, index: u64) -> Arc<ReplicateMsg> {
        ReplicateMsg::new(OpId::new(term, index), OpType::Data, vec![1, 2, 3])
    }

    #[test]
    fn appends_in_order_and_reads_back() {
        let log = InMemoryLog::new();
        log.append(&[msg(1, 1), msg(1, 2)]).unwrap();
        assert_eq!(log.last_appended(), OpId::new(1, 2));
        assert_eq!(log.read_op(1).unwrap().id(), OpId::new(1, 1));
        assert!(log
            .wait_durable(OpId::new(1, 2), Duration::from_millis(1))
            .unwrap());
    }

    #[test]
    fn rejects_gaps_and_stale_ids() {
        let log = InMemoryLog::new();
        log.append(&[msg(1, 1)]).unwrap();
        assert!(matches!(
            log.append(&[msg(1, 3)]),
            Err(LogError::OutOfOrder { .. })
        ));
        assert!(matches!(
            log.append(&[msg(1, 1)]),
            Err(LogError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn truncation_moves_the_tail_back() {
        let log = InMemoryLog::new();
        log.append(&[msg(1, 1), msg(1, 2), msg(2, 3)]).unwrap();
        log.truncate_after(1).unwrap();
        assert_eq!(log.last_appended(), OpId::new(1, 1));
        assert!(log.read_op(3).is_none());
        // A different term may now occupy index 2.
        log.append(&[msg(3, 2)]).unwrap();
        assert_eq!(log.last_appended(), OpId::new(3, 2));
    }
}
