//! Exclusive device sessions and their state machine.

use oct_core::data::Point2;
use oct_core::error::{OctError, OctResult};
use std::fmt;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// Where a session is in its arm/acquire/fetch/reposition cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Devices held, nothing configured yet.
    Idle,
    /// Configuring the digitizer and writing the next positioner segment.
    Arming,
    /// Both devices running; waiting for the digitizer to complete.
    Acquiring,
    /// Copying records out of the digitizer.
    Fetching,
    /// Releasing the scan task and moving the stage for the next segment.
    Repositioning,
    /// All segments acquired.
    Done,
    /// Ended by an error.
    Aborted,
}

impl SessionState {
    /// Whether the model allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Arming)
                | (Arming, Acquiring)
                | (Acquiring, Fetching)
                | (Acquiring, Arming)
                | (Fetching, Repositioning)
                | (Fetching, Done)
                | (Repositioning, Arming)
                | (Repositioning, Acquiring)
                | (Repositioning, Done)
                | (Done, Idle)
                | (Aborted, Idle)
        ) || (next == Aborted && !matches!(self, Idle | Aborted))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Arming => "arming",
            SessionState::Acquiring => "acquiring",
            SessionState::Fetching => "fetching",
            SessionState::Repositioning => "repositioning",
            SessionState::Done => "done",
            SessionState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Exclusive hold on the digitizer and positioner.
///
/// Obtained from [`DeviceBank::try_session`](super::DeviceBank::try_session);
/// the devices are released when the session is dropped. The session also
/// tracks the last position commanded to the stage, which starts at the
/// origin where every session leaves it parked or at a planned point.
/// While a task is generating, and after one is released before finishing,
/// the position is unknown.
#[derive(Debug)]
pub struct Session {
    _lease: OwnedMutexGuard<()>,
    state: SessionState,
    position: Option<Point2>,
}

impl Session {
    pub(super) fn new(lease: OwnedMutexGuard<()>) -> Self {
        Self {
            _lease: lease,
            state: SessionState::Idle,
            position: Some(Point2::ORIGIN),
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last position the stage is known to hold, `None` while unknown.
    pub fn position(&self) -> Option<Point2> {
        self.position
    }

    pub(super) fn set_position(&mut self, position: Point2) {
        self.position = Some(position);
    }

    /// The stage is moving or was stopped somewhere along its buffer.
    pub(super) fn forget_position(&mut self) {
        self.position = None;
    }

    /// Move to `next`, rejecting changes the model forbids.
    pub fn transition(&mut self, next: SessionState) -> OctResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(OctError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %self.state, to = %next, "session transition");
        self.state = next;
        Ok(())
    }

    /// Mark the session aborted. A session that never left `Idle` touched no
    /// hardware and stays idle.
    pub fn abort(&mut self) {
        if self.state.can_transition_to(SessionState::Aborted) {
            warn!(from = %self.state, "session aborted");
            self.state = SessionState::Aborted;
        }
    }
}
