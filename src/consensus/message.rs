use crate::consensus::OpId;
use std::sync::Arc;

/// Kind of operation carried by a [`ReplicateMsg`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// An application payload.
    Data,
    /// Term marker appended by a freshly elected leader. Committing it makes
    /// every earlier uncommitted entry committable.
    NoOp,
    /// A configuration change record.
    ChangeConfig,
    /// An operation forwarded on behalf of another peer.
    ProxyOp,
}

/// A single replicated operation. Shared immutably between the log cache,
/// the pending-round set and any in-flight per-peer request buffers; the id
/// is assigned exactly once, before the message is published anywhere.
#[derive(Debug, Clone)]
pub struct ReplicateMsg {
    id: OpId,
    op_type: OpType,
    payload: Arc<Vec<u8>>,
    checksum: Option<u32>,
}

impl ReplicateMsg {
    pub fn new(id: OpId, op_type: OpType, payload: Vec<u8>) -> Arc<Self> {
        let checksum = crc32c::crc32c(&payload);
        Arc::new(Self {
            id,
            op_type,
            payload: Arc::new(payload),
            checksum: Some(checksum),
        })
    }

    /// Builds a message without a payload checksum. Used for operations
    /// received from peers that did not compute one.
    pub fn without_checksum(id: OpId, op_type: OpType, payload: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            id,
            op_type,
            payload: Arc::new(payload),
            checksum: None,
        })
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn checksum(&self) -> Option<u32> {
        self.checksum
    }

    /// Recomputes the payload checksum and compares it with the stored one.
    /// Messages without a stored checksum verify trivially.
    pub fn verify_checksum(&self) -> bool {
        match self.checksum {
            Some(expected) => crc32c::crc32c(&self.payload) == expected,
            None => true,
        }
    }
}
