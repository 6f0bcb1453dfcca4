use std::collections::VecDeque;

use crate::signal::SignalMessage;

/// Signals that arrived before the local side could apply them, replayed in
/// arrival order.
#[derive(Debug, Default)]
pub struct PendingSignalQueue {
    signals: VecDeque<SignalMessage>,
}

impl PendingSignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, signal: SignalMessage) {
        self.signals.push_back(signal);
    }

    pub fn pop(&mut self) -> Option<SignalMessage> {
        self.signals.pop_front()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }

    pub fn clear(&mut self) {
        self.signals.clear();
    }
}
