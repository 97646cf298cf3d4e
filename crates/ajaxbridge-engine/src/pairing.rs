//! Pairing state machine for device enrollment.
//!
//! One hub runs at most one pairing session at a time. The session walks
//! the discovery handshake:
//!
//! ```text
//! Idle → Searching → CandidateFound → Confirming → Enrolled
//!          │              │               ├──────→ Failed
//!          └──────────────┴───────────────┴──────→ TimedOut
//! ```
//!
//! `Enrolled`, `Failed` and `TimedOut` are terminal; reaching any of them
//! discards the session and returns the hub to no-active-pairing. Transitions
//! are validated, not absorbed: announce frames and acks arrive
//! asynchronously and can race user actions, so an event that arrives in the
//! wrong state is rejected.

use std::fmt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use ajaxbridge_core::{DeviceId, DeviceType, Error, FirmwareVersion, Result};

/// States of one pairing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingState {
    /// No session active (the resting state of the hub).
    Idle,
    /// Discovery mode requested; listening for announce frames.
    Searching,
    /// An unenrolled detector announced itself and awaits user confirmation.
    CandidateFound,
    /// Enroll command issued; awaiting the bridge's verdict.
    Confirming,
    /// Terminal: the detector is enrolled and in the registry.
    Enrolled,
    /// Terminal: the bridge rejected the enrollment or the command timed out.
    Failed,
    /// Terminal: the pairing window elapsed without resolution.
    TimedOut,
}

impl PairingState {
    /// Whether a transition to `target` is legal from this state.
    #[must_use]
    pub fn can_transition_to(&self, target: &PairingState) -> bool {
        matches!(
            (self, target),
            (PairingState::Idle, PairingState::Searching)
                | (PairingState::Searching, PairingState::CandidateFound)
                | (PairingState::CandidateFound, PairingState::Confirming)
                | (PairingState::Confirming, PairingState::Enrolled | PairingState::Failed)
                | (
                    PairingState::Searching
                        | PairingState::CandidateFound
                        | PairingState::Confirming,
                    PairingState::TimedOut
                )
        )
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PairingState::Enrolled | PairingState::Failed | PairingState::TimedOut
        )
    }

    /// States in which a session occupies the hub's single pairing slot.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PairingState::Searching | PairingState::CandidateFound | PairingState::Confirming
        )
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PairingState::Idle => "Idle",
            PairingState::Searching => "Searching",
            PairingState::CandidateFound => "CandidateFound",
            PairingState::Confirming => "Confirming",
            PairingState::Enrolled => "Enrolled",
            PairingState::Failed => "Failed",
            PairingState::TimedOut => "TimedOut",
        };
        write!(f, "{name}")
    }
}

/// Descriptor of the detector announced during a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub device: DeviceId,
    pub device_type: DeviceType,
    pub firmware: FirmwareVersion,
    /// Operator-supplied placement label, carried onto the enrolled device.
    pub area: Option<String>,
}

/// One pairing session, owned by its hub.
#[derive(Debug)]
pub struct PairingSession {
    state: PairingState,
    candidate: Option<Candidate>,
    area_hint: Option<String>,
    /// Overall pairing-window deadline, fixed at session start.
    deadline: Instant,
}

impl PairingSession {
    /// Start a session in `Searching`.
    #[must_use]
    pub fn start(area_hint: Option<String>, deadline: Instant) -> Self {
        Self {
            state: PairingState::Searching,
            candidate: None,
            area_hint,
            deadline,
        }
    }

    #[must_use]
    pub fn state(&self) -> PairingState {
        self.state
    }

    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    #[must_use]
    pub fn candidate(&self) -> Option<&Candidate> {
        self.candidate.as_ref()
    }

    /// Record a discovery announcement.
    ///
    /// Only accepted while `Searching`, and only for announcements flagged
    /// as new and awaiting confirmation. Returns the candidate when the
    /// session advanced to `CandidateFound`.
    pub fn observe_announce(
        &mut self,
        device: DeviceId,
        device_type: DeviceType,
        firmware: FirmwareVersion,
        new: bool,
        awaiting_confirm: bool,
    ) -> Option<Candidate> {
        if self.state != PairingState::Searching || !new || !awaiting_confirm {
            return None;
        }

        let candidate = Candidate {
            device,
            device_type,
            firmware,
            area: self.area_hint.clone(),
        };
        self.candidate = Some(candidate.clone());
        self.state = PairingState::CandidateFound;
        Some(candidate)
    }

    /// User confirmation: move to `Confirming` and hand back the candidate
    /// the enroll command must reference.
    ///
    /// # Errors
    /// Returns `Error::DuplicateOperation` outside `CandidateFound`.
    pub fn confirm(&mut self) -> Result<Candidate> {
        self.transition(PairingState::Confirming)?;
        Ok(self
            .candidate
            .clone()
            .unwrap_or_else(|| unreachable!("CandidateFound always holds a candidate")))
    }

    /// Positive enrollment ack: terminal `Enrolled`.
    ///
    /// # Errors
    /// Returns `Error::DuplicateOperation` outside `Confirming`.
    pub fn enrolled(&mut self) -> Result<Candidate> {
        self.transition(PairingState::Enrolled)?;
        Ok(self
            .candidate
            .clone()
            .unwrap_or_else(|| unreachable!("Confirming always holds a candidate")))
    }

    /// Negative ack or command timeout while confirming: terminal `Failed`.
    pub fn fail(&mut self) {
        // Failure is always reachable from an active state.
        if self.state.is_active() {
            self.state = PairingState::Failed;
        }
    }

    /// Pairing window elapsed: terminal `TimedOut`.
    pub fn timed_out(&mut self) {
        if self.state.is_active() {
            self.state = PairingState::TimedOut;
        }
    }

    fn transition(&mut self, target: PairingState) -> Result<()> {
        if !self.state.can_transition_to(&target) {
            return Err(Error::DuplicateOperation);
        }
        self.state = target;
        Ok(())
    }
}
