//! Chunk model and the shared chunk table
//!
//! A [`Chunk`] is a contiguous, inclusive byte range owned by one worker at
//! a time. Status changes only go through the transition methods, which
//! reject illegal moves. The [`ChunkTable`] is the job-wide set of chunks,
//! shared by workers, the adaptive splitter and the checkpointer.

use parking_lot::Mutex;
use rangefetch_types::ChunkStatus;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Marker for an open-ended chunk whose length is unknown
pub const OPEN_END: u64 = u64::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chunk {id}: cannot move from {from:?} to {to:?}")]
pub struct InvalidTransition {
    pub id: u32,
    pub from: ChunkStatus,
    pub to: ChunkStatus,
}

/// A byte range of the target file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chunk {
    pub id: u32,
    pub start: u64,
    /// Inclusive end offset, [`OPEN_END`] when the size is unknown
    pub end: u64,
    downloaded: u64,
    /// Bytes reserved by the worker but not yet written
    #[serde(skip)]
    in_flight: u64,
    status: ChunkStatus,
    retries: u32,
    last_error: Option<String>,
}

impl Chunk {
    pub fn new(id: u32, start: u64, end: u64) -> Self {
        Self {
            id,
            start,
            end,
            downloaded: 0,
            in_flight: 0,
            status: ChunkStatus::Waiting,
            retries: 0,
            last_error: None,
        }
    }

    pub fn status(&self) -> ChunkStatus {
        self.status
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn is_open_ended(&self) -> bool {
        self.end == OPEN_END
    }

    /// Length in bytes ([`OPEN_END`] for open-ended chunks)
    pub fn size(&self) -> u64 {
        if self.is_open_ended() {
            OPEN_END
        } else {
            self.end - self.start + 1
        }
    }

    /// Absolute offset of the next byte to request
    pub fn position(&self) -> u64 {
        self.start + self.downloaded
    }

    /// Bytes still missing (`None` when open-ended)
    pub fn remaining(&self) -> Option<u64> {
        if self.is_open_ended() {
            None
        } else {
            Some(self.size().saturating_sub(self.downloaded))
        }
    }

    /// Every byte of the range has been written
    pub fn is_filled(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Fraction of the range already written
    pub fn progress(&self) -> f64 {
        if self.is_open_ended() || self.size() == 0 {
            0.0
        } else {
            self.downloaded as f64 / self.size() as f64
        }
    }

    pub fn begin(&mut self) -> Result<(), InvalidTransition> {
        self.transition(ChunkStatus::Waiting, ChunkStatus::Downloading)
    }

    pub fn complete(&mut self) -> Result<(), InvalidTransition> {
        self.transition(ChunkStatus::Downloading, ChunkStatus::Completed)?;
        if self.is_open_ended() {
            // Length is known now that the stream ended
            self.end = self.start + self.downloaded.max(1) - 1;
        }
        self.last_error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition(ChunkStatus::Downloading, ChunkStatus::Failed)?;
        self.in_flight = 0;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Put a failed chunk back in line, keeping its progress
    pub fn requeue(&mut self) -> Result<u32, InvalidTransition> {
        self.transition(ChunkStatus::Failed, ChunkStatus::Waiting)?;
        self.retries += 1;
        Ok(self.retries)
    }

    fn transition(&mut self, from: ChunkStatus, to: ChunkStatus) -> Result<(), InvalidTransition> {
        if self.status != from {
            return Err(InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }
}

/// A write slot handed to a worker by [`ChunkTable::reserve`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub offset: u64,
    pub len: u64,
}

/// Job-wide chunk set shared between workers
#[derive(Clone, Debug)]
pub struct ChunkTable {
    inner: Arc<Mutex<TableInner>>,
}

#[derive(Debug)]
struct TableInner {
    chunks: Vec<Chunk>,
    next_id: u32,
}

impl TableInner {
    fn get_mut(&mut self, id: u32) -> Option<&mut Chunk> {
        self.chunks.iter_mut().find(|c| c.id == id)
    }
}

impl ChunkTable {
    pub fn new(chunks: Vec<Chunk>) -> Self {
        let next_id = chunks.iter().map(|c| c.id + 1).max().unwrap_or(0);
        Self {
            inner: Arc::new(Mutex::new(TableInner { chunks, next_id })),
        }
    }

    pub fn snapshot(&self) -> Vec<Chunk> {
        self.inner.lock().chunks.clone()
    }

    pub fn get(&self, id: u32) -> Option<Chunk> {
        self.inner.lock().chunks.iter().find(|c| c.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().chunks.is_empty()
    }

    /// Ids of chunks waiting for a worker, in offset order
    pub fn waiting_ids(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut waiting: Vec<&Chunk> = inner
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Waiting)
            .collect();
        waiting.sort_by_key(|c| c.start);
        waiting.iter().map(|c| c.id).collect()
    }

    pub fn begin(&self, id: u32) -> Result<Chunk, InvalidTransition> {
        let mut inner = self.inner.lock();
        let chunk = inner.get_mut(id).ok_or(InvalidTransition {
            id,
            from: ChunkStatus::Waiting,
            to: ChunkStatus::Downloading,
        })?;
        chunk.begin()?;
        Ok(chunk.clone())
    }

    pub fn complete(&self, id: u32) -> Result<(), InvalidTransition> {
        self.with_chunk(id, ChunkStatus::Completed, |c| c.complete())
    }

    pub fn fail(&self, id: u32, error: impl Into<String>) -> Result<(), InvalidTransition> {
        let error = error.into();
        self.with_chunk(id, ChunkStatus::Failed, |c| c.fail(error))
    }

    pub fn requeue(&self, id: u32) -> Result<u32, InvalidTransition> {
        let mut inner = self.inner.lock();
        match inner.get_mut(id) {
            Some(chunk) => chunk.requeue(),
            None => Err(InvalidTransition {
                id,
                from: ChunkStatus::Failed,
                to: ChunkStatus::Waiting,
            }),
        }
    }

    fn with_chunk(
        &self,
        id: u32,
        to: ChunkStatus,
        f: impl FnOnce(&mut Chunk) -> Result<(), InvalidTransition>,
    ) -> Result<(), InvalidTransition> {
        let mut inner = self.inner.lock();
        match inner.get_mut(id) {
            Some(chunk) => f(chunk),
            None => Err(InvalidTransition {
                id,
                from: ChunkStatus::Downloading,
                to,
            }),
        }
    }

    /// Claim up to `wanted` bytes at the chunk's current position
    ///
    /// The length is clamped to the chunk's current end, which a split may
    /// have moved. A zero-length reservation means the chunk is full.
    pub fn reserve(&self, id: u32, wanted: u64) -> Reservation {
        let mut inner = self.inner.lock();
        let Some(chunk) = inner.get_mut(id) else {
            return Reservation { offset: 0, len: 0 };
        };
        let offset = chunk.position() + chunk.in_flight;
        let len = if chunk.is_open_ended() {
            wanted
        } else {
            wanted.min((chunk.end + 1).saturating_sub(offset))
        };
        chunk.in_flight += len;
        Reservation { offset, len }
    }

    /// Record a reserved slot as written
    pub fn commit(&self, id: u32, len: u64) {
        let mut inner = self.inner.lock();
        if let Some(chunk) = inner.get_mut(id) {
            chunk.in_flight = chunk.in_flight.saturating_sub(len);
            chunk.downloaded += len;
        }
    }

    /// Release a reserved slot that was not written
    pub fn rollback(&self, id: u32, len: u64) {
        let mut inner = self.inner.lock();
        if let Some(chunk) = inner.get_mut(id) {
            chunk.in_flight = chunk.in_flight.saturating_sub(len);
        }
    }

    /// Truncate chunk `id` before `at` and add a new waiting chunk `[at, end]`
    ///
    /// Refused when `at` falls inside bytes already written or reserved.
    pub fn split(&self, id: u32, at: u64) -> Option<Chunk> {
        let mut inner = self.inner.lock();
        let next_id = inner.next_id;
        let chunk = inner.get_mut(id)?;
        if chunk.is_open_ended()
            || matches!(chunk.status, ChunkStatus::Completed | ChunkStatus::Failed)
            || at <= chunk.position() + chunk.in_flight
            || at > chunk.end
        {
            return None;
        }
        let tail = Chunk::new(next_id, at, chunk.end);
        chunk.end = at - 1;
        inner.next_id += 1;
        inner.chunks.push(tail.clone());
        Some(tail)
    }

    pub fn all_completed(&self) -> bool {
        self.inner
            .lock()
            .chunks
            .iter()
            .all(|c| c.status == ChunkStatus::Completed)
    }

    pub fn count_with_status(&self, status: ChunkStatus) -> usize {
        self.inner
            .lock()
            .chunks
            .iter()
            .filter(|c| c.status == status)
            .count()
    }

    /// Sum of bytes written across all chunks
    pub fn downloaded(&self) -> u64 {
        self.inner.lock().chunks.iter().map(|c| c.downloaded).sum()
    }

    /// Length of the contiguous written range starting at `base`
    ///
    /// Used as the resume watermark: everything before the returned offset
    /// is on disk.
    pub fn contiguous_end(&self, base: u64) -> u64 {
        let mut chunks = self.snapshot();
        chunks.sort_by_key(|c| c.start);
        let mut cursor = base;
        for chunk in chunks {
            if chunk.start != cursor {
                break;
            }
            cursor = chunk.position();
            if !chunk.is_filled() {
                break;
            }
        }
        cursor
    }

    /// Fresh waiting chunks covering every byte not yet written
    pub fn unfinished_ranges(&self) -> Vec<Chunk> {
        let mut chunks = self.snapshot();
        chunks.sort_by_key(|c| c.start);
        chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed && !c.is_filled())
            .enumerate()
            .map(|(i, c)| Chunk::new(i as u32, c.position(), c.end))
            .collect()
    }
}
