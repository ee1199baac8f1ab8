use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use crate::error::ConnectionError;

/// One serialized outbound frame, shared by every recipient of a broadcast.
pub type Frame = Arc<str>;

/// The outbound half of a live duplex channel, as seen by the registry.
///
/// `try_send` must never block: a slow peer reports `Backpressure` and is
/// dropped instead of stalling the fan-out.
pub trait FrameSink: Send + Sync {
    fn try_send(&self, frame: Frame) -> Result<(), ConnectionError>;

    /// Frames that can be queued right now without hitting backpressure.
    fn headroom(&self) -> usize;

    fn close(&self);
}

/// Bounded queue between the registry and the task that owns the socket.
pub struct ChannelSink {
    frames: mpsc::Sender<Frame>,
    closed: watch::Sender<bool>,
}

pub struct ConnectionReceiver {
    frames: mpsc::Receiver<Frame>,
    closed: watch::Receiver<bool>,
}

pub fn channel(capacity: usize) -> (ChannelSink, ConnectionReceiver) {
    let (frames_tx, frames_rx) = mpsc::channel(capacity.max(1));
    let (closed_tx, closed_rx) = watch::channel(false);

    (
        ChannelSink {
            frames: frames_tx,
            closed: closed_tx,
        },
        ConnectionReceiver {
            frames: frames_rx,
            closed: closed_rx,
        },
    )
}

impl FrameSink for ChannelSink {
    fn try_send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if *self.closed.borrow() {
            return Err(ConnectionError::Closed);
        }

        self.frames.try_send(frame).map_err(|err| match err {
            TrySendError::Full(_) => ConnectionError::Backpressure,
            TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    fn headroom(&self) -> usize {
        if *self.closed.borrow() {
            0
        } else {
            self.frames.capacity()
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

impl ConnectionReceiver {
    /// Next queued frame. `None` once the connection was closed by the
    /// registry or every sender is gone.
    pub async fn next(&mut self) -> Option<Frame> {
        if self.is_closed() {
            return None;
        }

        tokio::select! {
            biased;
            frame = self.frames.recv() => frame,
            _ = self.closed.changed() => None,
        }
    }

    pub fn try_next(&mut self) -> Option<Frame> {
        self.frames.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
