use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::consensus::{OpId, OpType, ReplicateMsg};

/// Read access to the durable log, used when the cache no longer holds an
/// operation. Supplied by the embedding process.
pub trait LogReader: Send + Sync {
    fn read_op(&self, index: u64) -> Option<Arc<ReplicateMsg>>;
}

/// A reader for groups whose log is not reachable from the cache. Every
/// miss is final.
pub struct NoLog;

impl LogReader for NoLog {
    fn read_op(&self, _index: u64) -> Option<Arc<ReplicateMsg>> {
        None
    }
}

/// Payload codec applied to cached operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheCodec {
    None,
    Zlib,
}

#[derive(Debug, Clone)]
pub struct LogCacheConfig {
    /// Soft cap on cached payload bytes; eviction never removes entries
    /// still needed by a tracked peer regardless of this cap.
    pub max_bytes: usize,
    /// Number of entries kept below the eviction watermark for slow peers.
    pub retention_margin: u64,
    pub codec: CacheCodec,
    /// Compress when inserting; otherwise only entries reloaded from the
    /// log after a miss are stored compressed.
    pub compress_on_insert: bool,
}

impl Default for LogCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024,
            retention_margin: 256,
            codec: CacheCodec::None,
            compress_on_insert: false,
        }
    }
}

enum CachedOp {
    Plain(Arc<ReplicateMsg>),
    Compressed {
        id: OpId,
        op_type: OpType,
        checksum: Option<u32>,
        bytes: Vec<u8>,
        uncompressed_len: usize,
    },
}

impl CachedOp {
    fn id(&self) -> OpId {
        match self {
            CachedOp::Plain(msg) => msg.id(),
            CachedOp::Compressed { id, .. } => *id,
        }
    }

    fn stored_len(&self) -> usize {
        match self {
            CachedOp::Plain(msg) => msg.payload_len(),
            CachedOp::Compressed { bytes, .. } => bytes.len(),
        }
    }
}

/// A contiguous batch read out of the cache, plus the id of the operation
/// immediately before it.
#[derive(Debug, Clone)]
pub struct ReadRange {
    pub preceding_id: OpId,
    pub ops: Vec<Arc<ReplicateMsg>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("operation at index {0} is neither cached nor in the log")]
    Missing(u64),
    #[error("cached payload at index {0} failed to decompress")]
    Codec(u64),
}

struct CacheInner {
    ops: BTreeMap<u64, CachedOp>,
    stored_bytes: usize,
}

/// Buffers recently appended operations so per-peer request assembly stays
/// off the durable log on the hot path. Internally locked; the blocking
/// read never holds the queue's own lock.
pub struct LogCache {
    config: LogCacheConfig,
    log: Arc<dyn LogReader>,
    inner: Mutex<CacheInner>,
    available: Condvar,
}

impl LogCache {
    pub fn new(config: LogCacheConfig, log: Arc<dyn LogReader>) -> Self {
        Self {
            config,
            log,
            inner: Mutex::new(CacheInner {
                ops: BTreeMap::new(),
                stored_bytes: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Takes shared ownership of an appended operation.
    pub fn append(&self, msg: Arc<ReplicateMsg>) {
        let mut inner = self.inner.lock();
        let entry = if self.config.codec == CacheCodec::Zlib && self.config.compress_on_insert {
            compress(&msg)
        } else {
            CachedOp::Plain(msg)
        };
        inner.stored_bytes += entry.stored_len();
        inner.ops.insert(entry.id().index, entry);
        drop(inner);
        self.available.notify_all();
    }

    /// Reads a contiguous prefix of operations starting at
    /// `from_idx_exclusive + 1`, with total payload at most `max_bytes`
    /// (always at least one op if available), plus the preceding id.
    pub fn read_range(
        &self,
        from_idx_exclusive: u64,
        max_bytes: usize,
    ) -> Result<ReadRange, CacheError> {
        let mut inner = self.inner.lock();
        self.read_range_locked(&mut inner, from_idx_exclusive, max_bytes)
    }

    /// As [`read_range`], but waits up to `timeout` for the starting index
    /// to appear. Returns an empty range when the wait expires.
    ///
    /// [`read_range`]: LogCache::read_range
    pub fn blocking_read_range(
        &self,
        from_idx_exclusive: u64,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<ReadRange, CacheError> {
        let mut inner = self.inner.lock();
        let wanted = from_idx_exclusive + 1;
        if !inner.ops.contains_key(&wanted) {
            let _ = self
                .available
                .wait_for(&mut inner, timeout);
        }
        if !inner.ops.contains_key(&wanted) && self.log.read_op(wanted).is_none() {
            let preceding_id = self.preceding_id_locked(&inner, from_idx_exclusive)?;
            return Ok(ReadRange {
                preceding_id,
                ops: Vec::new(),
            });
        }
        self.read_range_locked(&mut inner, from_idx_exclusive, max_bytes)
    }

    fn read_range_locked(
        &self,
        inner: &mut CacheInner,
        from_idx_exclusive: u64,
        max_bytes: usize,
    ) -> Result<ReadRange, CacheError> {
        let preceding_id = self.preceding_id_locked(inner, from_idx_exclusive)?;
        let mut ops = Vec::new();
        let mut bytes = 0usize;
        let mut index = from_idx_exclusive + 1;
        loop {
            let msg = match inner.ops.get(&index) {
                Some(CachedOp::Plain(msg)) => msg.clone(),
                Some(compressed @ CachedOp::Compressed { .. }) => decompress(compressed)
                    .ok_or(CacheError::Codec(index))?,
                None => match self.log.read_op(index) {
                    Some(msg) => {
                        // Re-admit log reads so the next peer hits the cache.
                        let entry = if self.config.codec == CacheCodec::Zlib {
                            compress(&msg)
                        } else {
                            CachedOp::Plain(msg.clone())
                        };
                        inner.stored_bytes += entry.stored_len();
                        inner.ops.insert(index, entry);
                        msg
                    }
                    None => break,
                },
            };
            if !ops.is_empty() && bytes + msg.payload_len() > max_bytes {
                break;
            }
            bytes += msg.payload_len();
            ops.push(msg);
            index += 1;
        }
        Ok(ReadRange { preceding_id, ops })
    }

    fn preceding_id_locked(
        &self,
        inner: &CacheInner,
        from_idx: u64,
    ) -> Result<OpId, CacheError> {
        if from_idx == 0 {
            return Ok(OpId::GENESIS);
        }
        if let Some(entry) = inner.ops.get(&from_idx) {
            return Ok(entry.id());
        }
        self.log
            .read_op(from_idx)
            .map(|msg| msg.id())
            .ok_or(CacheError::Missing(from_idx))
    }

    /// Drops every cached entry with index greater than `index`. The
    /// durable log is truncated by the enclosing operation.
    pub fn truncate_after(&self, index: u64) {
        let mut inner = self.inner.lock();
        let doomed: Vec<u64> = inner.ops.range(index + 1..).map(|(idx, _)| *idx).collect();
        for idx in doomed {
            if let Some(entry) = inner.ops.remove(&idx) {
                inner.stored_bytes -= entry.stored_len();
            }
        }
        debug!("event=cache_truncate after_index={}", index);
    }

    /// Evicts entries strictly below `watermark` minus the retention margin
    /// reserved for slow peers. `watermark` is the minimum of the
    /// all-replicated and durable indexes.
    pub fn evict_below(&self, watermark: u64) {
        let bound = watermark.saturating_sub(self.config.retention_margin);
        let mut inner = self.inner.lock();
        let doomed: Vec<u64> = inner.ops.range(..bound).map(|(idx, _)| *idx).collect();
        let mut count = doomed.len();
        for idx in doomed {
            if let Some(entry) = inner.ops.remove(&idx) {
                inner.stored_bytes -= entry.stored_len();
            }
        }
        // Under byte pressure the retention margin is sacrificed, but never
        // anything at or above the watermark itself.
        while inner.stored_bytes > self.config.max_bytes {
            let Some((&idx, _)) = inner.ops.iter().next() else {
                break;
            };
            if idx >= watermark {
                break;
            }
            if let Some(entry) = inner.ops.remove(&idx) {
                inner.stored_bytes -= entry.stored_len();
                count += 1;
            }
        }
        if count > 0 {
            debug!(
                "event=cache_evict below_index={} evicted={} stored_bytes={}",
                bound, count, inner.stored_bytes
            );
        }
    }

    pub fn stored_bytes(&self) -> usize {
        self.inner.lock().stored_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().ops.is_empty()
    }
}

fn compress(msg: &Arc<ReplicateMsg>) -> CachedOp {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::fast());
    // Vec writes cannot fail; fall back to the plain form if they somehow do.
    if encoder.write_all(msg.payload()).is_err() {
        return CachedOp::Plain(msg.clone());
    }
    match encoder.finish() {
        Ok(bytes) => CachedOp::Compressed {
            id: msg.id(),
            op_type: msg.op_type(),
            checksum: msg.checksum(),
            bytes,
            uncompressed_len: msg.payload_len(),
        },
        Err(err) => {
            warn!("event=cache_compress_failed id={} error={}", msg.id(), err);
            CachedOp::Plain(msg.clone())
        }
    }
}

fn decompress(entry: &CachedOp) -> Option<Arc<ReplicateMsg>> {
    let CachedOp::Compressed {
        id,
        op_type,
        checksum,
        bytes,
        uncompressed_len,
    } = entry
    else {
        return None;
    };
    let mut payload = Vec::with_capacity(*uncompressed_len);
    let mut decoder = ZlibDecoder::new(bytes.as_slice());
    decoder.read_to_end(&mut payload).ok()?;
    let msg = match checksum {
        Some(_) => ReplicateMsg::new(*id, *op_type, payload),
        None => ReplicateMsg::without_checksum(*id, *op_type, payload),
    };
    Some(msg)
}
