use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use transport_core::{TimeoutPhase, TransportError};

#[derive(Debug, Clone, PartialEq)]
pub enum GateState {
    Pending,
    Open,
    Failed(TransportError),
}

/// One-shot readiness latch for a data channel.
///
/// The first transition out of `Pending` wins; later ones are ignored. Any
/// number of tasks may wait. Once armed, a gate still pending at the deadline
/// fails with a timeout as soon as a waiter or a late `open` notices.
#[derive(Debug)]
pub struct OpenGate {
    state: watch::Sender<GateState>,
    deadline: Mutex<Option<(Instant, Duration)>>,
}

impl Default for OpenGate {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenGate {
    pub fn new() -> Self {
        Self {
            state: watch::channel(GateState::Pending).0,
            deadline: Mutex::new(None),
        }
    }

    /// Starts the open budget. Only the first call counts.
    pub fn arm(&self, budget: Duration) {
        let mut deadline = self.deadline.lock();
        if deadline.is_none() {
            *deadline = Some((Instant::now() + budget, budget));
        }
    }

    pub fn state(&self) -> GateState {
        self.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.state.borrow(), GateState::Open)
    }

    /// Marks the channel open. Returns false if the gate had already settled
    /// or the budget has run out.
    pub fn open(&self) -> bool {
        if let Some(err) = self.expired() {
            self.fail(err);
            return false;
        }
        self.settle(GateState::Open)
    }

    pub fn fail(&self, err: TransportError) -> bool {
        self.settle(GateState::Failed(err))
    }

    fn settle(&self, next: GateState) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, GateState::Pending) {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    fn expired(&self) -> Option<TransportError> {
        let (at, budget) = (*self.deadline.lock())?;
        (Instant::now() >= at)
            .then(|| TransportError::timeout(TimeoutPhase::DataChannelOpen, budget))
    }

    /// Resolves once the gate settles, or fails it at the deadline.
    pub async fn wait(&self) -> Result<(), TransportError> {
        let deadline = *self.deadline.lock();
        let mut rx = self.state.subscribe();
        let settled = async move {
            loop {
                let outcome = match &*rx.borrow_and_update() {
                    GateState::Pending => None,
                    GateState::Open => Some(Ok(())),
                    GateState::Failed(err) => Some(Err(err.clone())),
                };
                if let Some(outcome) = outcome {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(TransportError::ClosedPendingOpen);
                }
            }
        };

        match deadline {
            None => settled.await,
            Some((at, budget)) => match tokio::time::timeout_at(at, settled).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.fail(TransportError::timeout(TimeoutPhase::DataChannelOpen, budget));
                    match self.state() {
                        GateState::Open => Ok(()),
                        GateState::Failed(err) => Err(err),
                        GateState::Pending => Err(TransportError::ClosedPendingOpen),
                    }
                }
            },
        }
    }
}
