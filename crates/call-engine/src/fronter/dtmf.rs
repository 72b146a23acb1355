//! Waiting for a single key press
//!
//! The wait is a race between two completions: the digit pump (first key
//! press, or the stream closing) and a scheduled timeout. Both report into a
//! [`SingleWinner`]; whichever gets there first decides the result and the
//! other is discarded, so a digit landing exactly on the deadline can never
//! resolve the wait twice.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::scheduler::ScheduledTask;

/// Result of waiting for a key press
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigitWait {
    Digit(char),
    /// Nobody pressed anything before the deadline
    TimedOut,
    /// The digit stream ended, i.e. the leg went away
    Closed,
}

/// A completion slot only the first caller can fill
pub struct SingleWinner<T> {
    slot: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> SingleWinner<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                slot: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Offer `value`; returns `true` if it won
    pub fn resolve(&self, value: T) -> bool {
        match self.slot.lock().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_none()
    }
}

fn is_dtmf(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '*' | '#' | 'A'..='D')
}

/// Wait up to `timeout` for the first key press on `digits`
pub async fn wait_for_digit(mut digits: mpsc::UnboundedReceiver<char>, timeout: Duration) -> DigitWait {
    let (winner, result) = SingleWinner::new();
    let winner = std::sync::Arc::new(winner);

    let pump = {
        let winner = winner.clone();
        tokio::spawn(async move {
            loop {
                match digits.recv().await {
                    Some(c) if is_dtmf(c) => {
                        winner.resolve(DigitWait::Digit(c));
                        break;
                    }
                    Some(other) => debug!("ignoring non-DTMF input {:?}", other),
                    None => {
                        winner.resolve(DigitWait::Closed);
                        break;
                    }
                }
            }
        })
    };

    let deadline = {
        let winner = winner.clone();
        ScheduledTask::after("dtmf-timeout", timeout, async move {
            winner.resolve(DigitWait::TimedOut);
        })
    };

    let outcome = result.await.unwrap_or(DigitWait::Closed);
    pump.abort();
    deadline.cancel();
    outcome
}
