//! # Chunking
//!
//! Large values travel as several response messages. The sender splits a
//! payload into `max(1, ceil(len / chunk_size))` slices; the receiver feeds
//! each slice into a [`ChunkReassembler`] as it arrives, in any order and
//! possibly more than once.
//!
//! An empty payload is still one (empty) chunk, so "no value" and "value
//! delivered" resolve the same way on the requesting side.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::future::Future;
use thiserror::Error;
use tokio::sync::watch;

/// Default maximum body size of one response chunk (200 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 200 * 1024;

/// Largest chunk count a response may declare. At the default chunk size
/// this bounds one value at 800 MiB.
pub const MAX_CHUNK_COUNT: usize = 4096;

/// A chunk could not be accepted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// Declared chunk count of zero.
    #[error("Chunk count must be at least 1")]
    ZeroCount,

    /// Declared chunk count above [`MAX_CHUNK_COUNT`].
    #[error("Chunk count {count} exceeds the limit of {max}")]
    TooManyChunks {
        /// Count carried by the chunk
        count: usize,
        /// Accepted maximum
        max: usize,
    },

    /// Index outside `1..=count`.
    #[error("Chunk index {index} out of range 1..={count}")]
    InvalidIndex {
        /// 1-based index received
        index: usize,
        /// Declared count
        count: usize,
    },

    /// A later chunk declared a different total than the first one.
    #[error("Chunk count mismatch: expected {expected}, got {got}")]
    CountMismatch {
        /// Count fixed by the first chunk
        expected: usize,
        /// Count carried by this chunk
        got: usize,
    },
}

/// Number of chunks needed for `len` bytes.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1)).max(1)
}

/// Split `payload` into zero-copy slices of at most `chunk_size` bytes.
pub fn split_payload(payload: Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    if payload.is_empty() {
        return vec![Bytes::new()];
    }
    (0..payload.len())
        .step_by(chunk_size)
        .map(|start| payload.slice(start..(start + chunk_size).min(payload.len())))
        .collect()
}

#[derive(Debug, Default)]
struct Slots {
    count: Option<usize>,
    chunks: Vec<Option<Bytes>>,
    filled: usize,
}

/// Collects the chunks of one response and publishes the joined payload once
/// every slot is filled.
///
/// The first write fixes the chunk count. Each slot is written at most once;
/// repeated writes of a filled slot are ignored.
#[derive(Debug)]
pub struct ChunkReassembler {
    slots: Mutex<Slots>,
    ready: watch::Sender<Option<Bytes>>,
}

impl Default for ChunkReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkReassembler {
    /// Create an empty reassembler.
    pub fn new() -> Self {
        let (ready, _) = watch::channel(None);
        Self {
            slots: Mutex::new(Slots::default()),
            ready,
        }
    }

    /// Store chunk `index` (1-based) of `count`.
    ///
    /// Returns `Ok(true)` if the chunk filled an empty slot, `Ok(false)` for a
    /// duplicate.
    pub fn set(&self, index: usize, count: usize, bytes: Bytes) -> Result<bool, ChunkError> {
        if count == 0 {
            return Err(ChunkError::ZeroCount);
        }
        if count > MAX_CHUNK_COUNT {
            return Err(ChunkError::TooManyChunks {
                count,
                max: MAX_CHUNK_COUNT,
            });
        }
        if index == 0 || index > count {
            return Err(ChunkError::InvalidIndex { index, count });
        }

        let mut slots = self.slots.lock();
        match slots.count {
            Some(expected) if expected != count => {
                return Err(ChunkError::CountMismatch {
                    expected,
                    got: count,
                });
            }
            Some(_) => {}
            None => {
                slots.chunks = vec![None; count];
                slots.count = Some(count);
            }
        }

        let slot = &mut slots.chunks[index - 1];
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(bytes);
        slots.filled += 1;

        if slots.filled == count {
            let joined = join(&slots.chunks);
            self.ready.send_replace(Some(joined));
        }
        Ok(true)
    }

    /// Wait for the joined payload, or `None` once `cancel` resolves first.
    pub async fn get<C>(&self, cancel: C) -> Option<Bytes>
    where
        C: Future<Output = ()>,
    {
        let mut rx = self.ready.subscribe();
        tokio::select! {
            result = rx.wait_for(Option::is_some) => {
                result.ok().and_then(|value| (*value).clone())
            }
            () = cancel => None,
        }
    }

    /// The joined payload if every chunk has arrived.
    pub fn try_get(&self) -> Option<Bytes> {
        self.ready.borrow().clone()
    }

    /// Whether every chunk has arrived.
    pub fn is_ready(&self) -> bool {
        self.ready.borrow().is_some()
    }

    /// Count fixed by the first chunk, if any chunk has arrived.
    pub fn expected_count(&self) -> Option<usize> {
        self.slots.lock().count
    }
}

fn join(chunks: &[Option<Bytes>]) -> Bytes {
    if let [Some(only)] = chunks {
        return only.clone();
    }
    let total = chunks.iter().flatten().map(Bytes::len).sum();
    let mut joined = BytesMut::with_capacity(total);
    for chunk in chunks.iter().flatten() {
        joined.extend_from_slice(chunk);
    }
    joined.freeze()
}
