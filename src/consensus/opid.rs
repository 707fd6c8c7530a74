use serde::{Deserialize, Serialize};
use std::fmt;

/// `(term, index)` pair identifying a single operation in the replicated
/// log. Ordering is lexicographic: term first, then index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    /// The id preceding every real operation. Index 0 never holds an op.
    pub const GENESIS: OpId = OpId { term: 0, index: 0 };

    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }

    pub fn is_genesis(&self) -> bool {
        *self == Self::GENESIS
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_term_then_index() {
        assert!(OpId::new(2, 1) > OpId::new(1, 100));
        assert!(OpId::new(2, 5) > OpId::new(2, 4));
        assert!(OpId::GENESIS < OpId::new(0, 1));
    }

    #[test]
    fn genesis_is_zero_zero() {
        assert_eq!(OpId::GENESIS, OpId::new(0, 0));
        assert!(OpId::GENESIS.is_genesis());
        assert!(!OpId::new(1, 1).is_genesis());
    }
}
