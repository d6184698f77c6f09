//! Fan-out of one inbound track to independent consumers
//!
//! Every consumer owns an unbounded queue, so a stalled reader only grows its
//! own backlog and never delays delivery to the others. Closing the tee (or
//! dropping it) ends every consumer's stream with `None`.

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Fan-out adapter over one upstream track
pub struct TrackTee<T> {
    inner: Mutex<TeeInner<T>>,
}

struct TeeInner<T> {
    consumers: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
    published: u64,
}

/// Readable handle over a tee
#[derive(Debug)]
pub struct TeeReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T: Clone + Send + 'static> TrackTee<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TeeInner {
                consumers: Vec::new(),
                closed: false,
                published: 0,
            }),
        }
    }

    /// Register a new consumer; frames published from now on are delivered
    /// to it. Subscribing to a closed tee yields an already-ended stream.
    pub fn subscribe(&self) -> TeeReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if !inner.closed {
            inner.consumers.push(tx);
        }
        TeeReceiver { rx }
    }

    /// Deliver a frame to every live consumer, returning how many received it
    pub fn publish(&self, frame: T) -> usize {
        let mut inner = self.inner.lock();
        if inner.closed {
            return 0;
        }
        inner.published += 1;
        // Consumers that dropped their receiver are pruned here
        inner.consumers.retain(|tx| tx.send(frame.clone()).is_ok());
        inner.consumers.len()
    }

    /// Signal end-of-stream to every consumer
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.consumers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }

    /// Total frames accepted from upstream
    pub fn published(&self) -> u64 {
        self.inner.lock().published
    }
}

impl<T: Clone + Send + 'static> Default for TrackTee<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TeeReceiver<T> {
    /// Wait for the next frame; `None` means the upstream has ended
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Frames currently buffered for this consumer
    pub fn backlog(&self) -> usize {
        self.rx.len()
    }
}
