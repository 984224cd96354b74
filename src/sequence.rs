//! Bind-protocol sequence counters.
//!
//! `rid` numbers every outbound bind request, `aid` echoes the last inbound
//! array the client processed and `ofs` counts the commands the server has
//! accepted in the current channel generation. All three live behind one
//! mutex shared by the poll loop and the command queue.

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceState {
    pub rid: u64,
    /// `-1` until the first inbound array of a generation is processed.
    pub aid: i64,
    pub ofs: u64,
}

impl Default for SequenceState {
    fn default() -> Self {
        Self {
            rid: 1,
            aid: -1,
            ofs: 0,
        }
    }
}

/// A reserved command-batch slot: the rid it is sent with and the `ofs` it
/// starts at. Committing it advances `ofs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTicket {
    pub seq: SequenceState,
    generation: u64,
}

#[derive(Debug)]
struct Inner {
    state: SequenceState,
    generation: u64,
}

#[derive(Debug)]
pub struct SequenceTracker {
    inner: Mutex<Inner>,
}

impl SequenceTracker {
    pub fn new(initial_rid: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SequenceState {
                    rid: initial_rid,
                    ..SequenceState::default()
                },
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SequenceState {
        self.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Take the next request id. Never reused, even across generations.
    pub fn next_rid(&self) -> u64 {
        let mut inner = self.lock();
        let rid = inner.state.rid;
        inner.state.rid += 1;
        rid
    }

    /// Start a new channel generation from a handshake's results: `aid` is
    /// the highest array id the handshake delivered and `ofs` restarts with
    /// the new channel. Batches reserved in the old generation can no longer
    /// commit.
    pub fn begin_generation(&self, handshake_aid: i64) -> u64 {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.state.aid = handshake_aid;
        inner.state.ofs = 0;
        inner.generation
    }

    /// Record a processed inbound array. Lower ids are ignored so `aid`
    /// never regresses. Returns whether `aid` moved.
    pub fn acknowledge(&self, array_id: i64) -> bool {
        let mut inner = self.lock();
        if array_id > inner.state.aid {
            inner.state.aid = array_id;
            true
        } else {
            false
        }
    }

    /// Consume a rid for a command batch and capture the current `ofs`.
    pub fn reserve_batch(&self) -> BatchTicket {
        let mut inner = self.lock();
        let seq = inner.state;
        inner.state.rid += 1;
        BatchTicket {
            seq,
            generation: inner.generation,
        }
    }

    /// Advance `ofs` by `count` once the server accepted the batch.
    ///
    /// Rejected (returns false) when the channel was re-established since the
    /// ticket was taken or another batch committed in between.
    pub fn commit_batch(&self, ticket: &BatchTicket, count: usize) -> bool {
        let mut inner = self.lock();
        if inner.generation != ticket.generation || inner.state.ofs != ticket.seq.ofs {
            return false;
        }
        inner.state.ofs += count as u64;
        true
    }
}
