use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::types::EngineEvent;

/// Bounded, ordered event channel for one exchange.
///
/// Sending waits for capacity, so a slow consumer slows the exchange down
/// rather than growing a queue. Once the receiver is dropped the sink reports
/// closed and later events are discarded.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::Sender<EngineEvent>>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx: Some(tx),
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// A sink nobody listens to; never reports closed.
    pub fn detached() -> Self {
        Self {
            tx: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Deliver `event`; returns false if the consumer is gone.
    pub async fn emit(&self, event: EngineEvent) -> bool {
        let Some(tx) = &self.tx else {
            return true;
        };
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        if tx.send(event).await.is_err() {
            if !self.closed.swap(true, Ordering::AcqRel) {
                tracing::debug!("event consumer disconnected");
            }
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.as_ref().is_some_and(|tx| tx.is_closed())
    }
}
