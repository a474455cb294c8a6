//! Per-fingerprint session slot and its state machine
//!
//! `Idle -> Streaming -> Evaluating -> Idle`, and any state to `Closed`. A closed
//! slot refuses every further transition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::WindowConfig;
use crate::error::{Error, Result};
use crate::extractor::SlidingWindow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Streaming,
    Evaluating,
    Closed,
}

#[derive(Debug)]
pub struct SessionSlot {
    state: SessionState,
    pub(crate) window: SlidingWindow,
    last_seen: DateTime<Utc>,
}

impl SessionSlot {
    pub fn new(config: &WindowConfig, now: DateTime<Utc>) -> Self {
        Self {
            state: SessionState::Idle,
            window: SlidingWindow::new(config),
            last_seen: now,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Accept an incoming interaction
    pub fn begin(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.state {
            SessionState::Idle => {
                self.state = SessionState::Streaming;
                self.last_seen = now;
                Ok(())
            }
            SessionState::Closed => Err(Error::SessionClosed),
            // The slot lock serializes work, so a busy state here means an earlier
            // call bailed out mid-way; restart from streaming.
            SessionState::Streaming | SessionState::Evaluating => {
                self.state = SessionState::Streaming;
                self.last_seen = now;
                Ok(())
            }
        }
    }

    pub fn evaluating(&mut self) {
        if self.state == SessionState::Streaming {
            self.state = SessionState::Evaluating;
        }
    }

    pub fn finish(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Idle;
        }
    }

    /// Close and drop the window
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let now = Utc::now();
        let mut slot = SessionSlot::new(&WindowConfig::default(), now);
        assert_eq!(slot.state(), SessionState::Idle);

        slot.begin(now).unwrap();
        assert_eq!(slot.state(), SessionState::Streaming);
        slot.evaluating();
        assert_eq!(slot.state(), SessionState::Evaluating);
        slot.finish();
        assert_eq!(slot.state(), SessionState::Idle);
    }

    #[test]
    fn test_closed_is_terminal() {
        let now = Utc::now();
        let mut slot = SessionSlot::new(&WindowConfig::default(), now);
        slot.close();
        assert!(matches!(slot.begin(now), Err(Error::SessionClosed)));
        slot.finish();
        assert_eq!(slot.state(), SessionState::Closed);
        assert!(slot.window.is_empty());
    }
}
