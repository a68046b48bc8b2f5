use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::buffer::RingBuffer;

pub const BROADCAST_CAPACITY: usize = 1024;

/// One item on a session's output channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Live output, in PTY order.
    Data(Bytes),
    /// Output held back while the session was suspended, oldest first.
    /// Sent once, at the point in the stream where the hold was released.
    Replay(Arc<Vec<Bytes>>),
}

struct State {
    recent: RingBuffer<Bytes>,
    held: Option<RingBuffer<Bytes>>,
    /// Chunks published since the hold started, including evicted ones.
    held_count: usize,
}

/// Fan-out point for one session's output.
///
/// Every chunk is appended to a bounded replay buffer and broadcast to any
/// live subscriber. Publishing never waits for a reader: with no subscriber
/// the chunk only lands in the replay buffer, and a slow subscriber sees
/// `RecvError::Lagged` rather than stalling the PTY.
///
/// While held, chunks go to a separate bounded buffer instead of the channel.
/// The hold decision and the send happen under the same lock, so every chunk
/// reaches subscribers exactly once: live, or inside the `Replay` that
/// `release` sends.
#[derive(Clone)]
pub struct Broker {
    tx: broadcast::Sender<Output>,
    state: Arc<Mutex<State>>,
}

impl Broker {
    pub fn new(replay_capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            tx,
            state: Arc::new(Mutex::new(State {
                recent: RingBuffer::new(replay_capacity),
                held: None,
                held_count: 0,
            })),
        }
    }

    pub fn publish(&self, data: Bytes) {
        let mut state = self.state.lock();
        state.recent.push(data.clone());
        if state.held.is_some() {
            state.held_count += 1;
            if let Some(held) = state.held.as_mut() {
                held.push(data);
            }
            return;
        }
        // No receivers is fine.
        let _ = self.tx.send(Output::Data(data));
    }

    /// Start holding output back from subscribers. Returns false if a hold
    /// is already in place.
    pub fn hold(&self, capacity: usize) -> bool {
        let mut state = self.state.lock();
        if state.held.is_some() {
            return false;
        }
        state.held = Some(RingBuffer::new(capacity));
        state.held_count = 0;
        true
    }

    /// End the hold and send what it kept as one `Replay`. Returns the number
    /// of chunks replayed, or `None` if nothing was held.
    pub fn release(&self) -> Option<usize> {
        let mut state = self.state.lock();
        let mut held = state.held.take()?;
        state.held_count = 0;
        if held.evicted() > 0 {
            tracing::warn!(
                dropped = held.evicted(),
                "suspension buffer overflowed, oldest output dropped"
            );
        }
        let chunks = held.drain();
        let count = chunks.len();
        if count > 0 {
            let _ = self.tx.send(Output::Replay(Arc::new(chunks)));
        }
        Some(count)
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        self.state.lock().held.is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Output> {
        self.tx.subscribe()
    }

    /// Subscribe and snapshot the replay buffer atomically.
    ///
    /// Chunks held by an active hold are left out of the history; the
    /// receiver gets them in the `Replay` when the hold is released.
    pub fn subscribe_with_history(&self) -> (Vec<Bytes>, broadcast::Receiver<Output>) {
        let state = self.state.lock();
        let rx = self.tx.subscribe();
        let mut history = state.recent.snapshot();
        let pending = state.held_count.min(history.len());
        history.truncate(history.len() - pending);
        (history, rx)
    }
}
