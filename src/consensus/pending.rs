use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::consensus::{OpId, ReplicateMsg};

/// Outcome delivered to a round's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundResult {
    Committed(OpId),
    Aborted,
}

type RoundCallback = Box<dyn FnOnce(RoundResult) + Send>;

/// A single operation that has been appended locally but not yet committed.
pub struct PendingRound {
    msg: Arc<ReplicateMsg>,
    /// Term at which the round was admitted. A round must not commit at a
    /// different term.
    bound_term: u64,
    callback: Option<RoundCallback>,
}

impl PendingRound {
    pub fn new(msg: Arc<ReplicateMsg>, bound_term: u64) -> Self {
        Self {
            msg,
            bound_term,
            callback: None,
        }
    }

    pub fn with_callback(
        msg: Arc<ReplicateMsg>,
        bound_term: u64,
        callback: impl FnOnce(RoundResult) + Send + 'static,
    ) -> Self {
        Self {
            msg,
            bound_term,
            callback: Some(Box::new(callback)),
        }
    }

    pub fn id(&self) -> OpId {
        self.msg.id()
    }

    pub fn msg(&self) -> &Arc<ReplicateMsg> {
        &self.msg
    }

    pub fn bound_term(&self) -> u64 {
        self.bound_term
    }

    fn finish(mut self, result: RoundResult) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl std::fmt::Debug for PendingRound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRound")
            .field("id", &self.id())
            .field("bound_term", &self.bound_term)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PendingError {
    #[error("round {attempted} does not follow {last_admitted} contiguously")]
    OutOfSequence {
        last_admitted: OpId,
        attempted: OpId,
    },
    #[error("round {id} bound to term {bound_term} cannot commit at term {current_term}")]
    BoundTermMismatch {
        id: OpId,
        bound_term: u64,
        current_term: u64,
    },
}

/// Operations appended to the local log but not yet committed, in index
/// order. The pending set is always the contiguous log suffix
/// `{last_committed + 1, ..., last_appended}`.
pub struct PendingRounds {
    rounds: BTreeMap<u64, PendingRound>,
    last_admitted: OpId,
    committed_index: u64,
}

impl PendingRounds {
    pub fn new(last_admitted: OpId, committed_index: u64) -> Self {
        Self {
            rounds: BTreeMap::new(),
            last_admitted,
            committed_index,
        }
    }

    pub fn last_admitted(&self) -> OpId {
        self.last_admitted
    }

    pub fn committed_index(&self) -> u64 {
        self.committed_index
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<&PendingRound> {
        self.rounds.get(&index)
    }

    /// Admits a round. The id must be strictly greater than the last
    /// admitted id and the index must follow it without a gap.
    pub fn admit(&mut self, round: PendingRound) -> Result<(), PendingError> {
        let id = round.id();
        if !(id > self.last_admitted && id.index == self.last_admitted.index + 1) {
            return Err(PendingError::OutOfSequence {
                last_admitted: self.last_admitted,
                attempted: id,
            });
        }
        self.rounds.insert(id.index, round);
        self.last_admitted = id;
        Ok(())
    }

    /// Verifies that a pending round may commit at `current_term`. On a
    /// mismatch the round is aborted in place and an error returned.
    pub fn check_bound_term(&mut self, index: u64, current_term: u64) -> Result<(), PendingError> {
        let Some(round) = self.rounds.get(&index) else {
            return Ok(());
        };
        if round.bound_term() == current_term {
            return Ok(());
        }
        let id = round.id();
        let bound_term = round.bound_term();
        warn!(
            "event=pending_round_bound_term_mismatch id={} bound_term={} current_term={}",
            id, bound_term, current_term
        );
        if let Some(round) = self.rounds.remove(&index) {
            round.finish(RoundResult::Aborted);
        }
        Err(PendingError::BoundTermMismatch {
            id,
            bound_term,
            current_term,
        })
    }

    /// Advances the committed index. Idempotent and monotone; completion
    /// callbacks fire in index order, each exactly once.
    pub fn advance_committed_to(&mut self, index: u64) -> Vec<OpId> {
        if index <= self.committed_index {
            return Vec::new();
        }
        let mut delivered = Vec::new();
        let committed: Vec<u64> = self
            .rounds
            .range(..=index)
            .map(|(idx, _)| *idx)
            .collect();
        for idx in committed {
            if let Some(round) = self.rounds.remove(&idx) {
                let id = round.id();
                round.finish(RoundResult::Committed(id));
                delivered.push(id);
            }
        }
        self.committed_index = index.max(self.committed_index);
        debug!(
            "event=committed_index_advance committed_index={} delivered={}",
            self.committed_index,
            delivered.len()
        );
        delivered
    }

    /// Removes every pending round with index greater than `index`, firing
    /// their callbacks with `Aborted` in reverse index order. Used to
    /// resolve log-matching mismatches.
    pub fn abort_after(&mut self, index: u64) -> Vec<OpId> {
        let doomed: Vec<u64> = self
            .rounds
            .range(index + 1..)
            .map(|(idx, _)| *idx)
            .rev()
            .collect();
        let mut aborted = Vec::new();
        for idx in &doomed {
            if let Some(round) = self.rounds.remove(idx) {
                let id = round.id();
                round.finish(RoundResult::Aborted);
                aborted.push(id);
            }
        }
        if !aborted.is_empty() {
            // The suffix was cut; the last admitted id moves back to the
            // newest surviving round or the committed boundary.
            self.last_admitted = self
                .rounds
                .values()
                .next_back()
                .map(|round| round.id())
                .unwrap_or(OpId::new(self.last_admitted.term, index.min(self.last_admitted.index)));
            warn!(
                "event=pending_rounds_aborted after_index={} count={} last_admitted={}",
                index,
                aborted.len(),
                self.last_admitted
            );
        }
        aborted
    }

    /// Resets the last-admitted id after an external truncation, without
    /// touching callbacks. Only valid when no pending round sits above it.
    pub fn reset_last_admitted(&mut self, id: OpId) {
        debug_assert!(self
            .rounds
            .values()
            .next_back()
            .map(|round| round.id() <= id)
            .unwrap_or(true));
        self.last_admitted = id;
    }
}

impl std::fmt::Debug for PendingRounds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRounds")
            .field("pending", &self.rounds.len())
            .field("last_admitted", &self.last_admitted)
            .field("committed_index", &self.committed_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::OpType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn round(term: u64, index: u64) -> PendingRound {
        PendingRound::new(
            ReplicateMsg::new(OpId::new(term, index), OpType::Data, vec![index as u8]),
            term,
        )
    }

    #[test]
    fn admit_enforces_contiguous_increasing_ids() {
        let mut pending = PendingRounds::new(OpId::new(1, 5), 5);
        pending.admit(round(1, 6)).unwrap();
        pending.admit(round(2, 7)).unwrap();

        // Gap.
        let err = pending.admit(round(2, 9)).unwrap_err();
        assert!(matches!(err, PendingError::OutOfSequence { .. }));

        // Same index, older term.
        let err = pending.admit(round(1, 8)).unwrap_err();
        assert!(matches!(err, PendingError::OutOfSequence { .. }));
    }

    #[test]
    fn advance_commits_in_order_and_is_idempotent() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut pending = PendingRounds::new(OpId::GENESIS, 0);
        for index in 1..=3 {
            let order = order.clone();
            pending
                .admit(PendingRound::with_callback(
                    ReplicateMsg::new(OpId::new(1, index), OpType::Data, Vec::new()),
                    1,
                    move |result| {
                        assert!(matches!(result, RoundResult::Committed(_)));
                        order.lock().unwrap().push(index);
                    },
                ))
                .unwrap();
        }
        let delivered = pending.advance_committed_to(2);
        assert_eq!(delivered.len(), 2);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);

        // Re-advancing to a lower index is a no-op.
        assert!(pending.advance_committed_to(1).is_empty());
        assert_eq!(pending.committed_index(), 2);

        pending.advance_committed_to(3);
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert!(pending.is_empty());
    }

    #[test]
    fn abort_after_fires_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut pending = PendingRounds::new(OpId::GENESIS, 0);
        for index in 1..=4 {
            let order = order.clone();
            pending
                .admit(PendingRound::with_callback(
                    ReplicateMsg::new(OpId::new(1, index), OpType::Data, Vec::new()),
                    1,
                    move |result| {
                        assert_eq!(result, RoundResult::Aborted);
                        order.lock().unwrap().push(index);
                    },
                ))
                .unwrap();
        }
        let aborted = pending.abort_after(1);
        assert_eq!(aborted.len(), 3);
        assert_eq!(*order.lock().unwrap(), vec![4, 3, 2]);
        assert_eq!(pending.last_admitted(), OpId::new(1, 1));
    }

    #[test]
    fn bound_term_mismatch_aborts_the_round() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut pending = PendingRounds::new(OpId::GENESIS, 0);
        let counter = fired.clone();
        pending
            .admit(PendingRound::with_callback(
                ReplicateMsg::new(OpId::new(2, 1), OpType::Data, Vec::new()),
                2,
                move |result| {
                    assert_eq!(result, RoundResult::Aborted);
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            ))
            .unwrap();

        assert!(pending.check_bound_term(1, 2).is_ok());
        let err = pending.check_bound_term(1, 3).unwrap_err();
        assert!(matches!(err, PendingError::BoundTermMismatch { .. }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(pending.is_empty());
    }
}
