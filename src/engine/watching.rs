// src/engine/watching.rs

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::dag::AggregateResult;
use crate::engine::RuntimeEvent;
use crate::errors::{OrchestratorError, Result};

/// Handle to a running group watch session.
///
/// Every operation is a message to the runtime actor. Once the session is
/// closed (or the actor is gone) operations fail with
/// [`OrchestratorError::Closed`], except `close` itself which is idempotent.
/// Dropping the handle without closing stops the actor and releases the
/// group, without tearing watchers down gracefully.
#[derive(Debug)]
pub struct GroupWatching {
    events: mpsc::UnboundedSender<RuntimeEvent>,
    results: mpsc::UnboundedReceiver<Result<AggregateResult>>,
    units: usize,
    closed: bool,
}

impl GroupWatching {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<RuntimeEvent>,
        results: mpsc::UnboundedReceiver<Result<AggregateResult>>,
        units: usize,
    ) -> Self {
        Self {
            events,
            results,
            units,
            closed: false,
        }
    }

    /// Invalidate every unit and wait until each one has reported the
    /// rebuild it caused. Returns the first error.
    pub async fn invalidate(&self) -> Result<()> {
        let (acks, waits): (Vec<_>, Vec<_>) = (0..self.units).map(|_| oneshot::channel()).unzip();
        self.send(RuntimeEvent::Invalidate { acks })?;

        let mut first_error = None;
        for wait in waits {
            let result = wait.await.unwrap_or(Err(OrchestratorError::Closed));
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Invalidate every unit without waiting.
    pub fn request_invalidate(&self) -> Result<()> {
        self.send(RuntimeEvent::Invalidate { acks: Vec::new() })
    }

    /// Stop building; changes keep being collected.
    pub fn suspend(&self) -> Result<()> {
        self.send(RuntimeEvent::Suspend)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(RuntimeEvent::Resume)
    }

    /// Close every unit's watch session and wait for all of them. Builds in
    /// progress are not aborted; close completes after they return. Returns
    /// the first teardown error.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let (ack, wait) = oneshot::channel();
        if self.events.send(RuntimeEvent::Close { ack }).is_err() {
            debug!("watch actor already stopped");
            return Ok(());
        }
        wait.await.unwrap_or(Ok(()))
    }

    /// Next wave result, or `None` once the session is over.
    pub async fn next_result(&mut self) -> Option<Result<AggregateResult>> {
        self.results.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn send(&self, event: RuntimeEvent) -> Result<()> {
        if self.closed {
            return Err(OrchestratorError::Closed);
        }
        self.events
            .send(event)
            .map_err(|_| OrchestratorError::Closed)
    }
}

impl Drop for GroupWatching {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.events.send(RuntimeEvent::Shutdown);
        }
    }
}
