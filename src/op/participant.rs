//! Participant operation: runs on every non-parity stripe unit touched
//! by a write.

use std::time::{Duration, Instant};

use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::geometry::{ServerId, StripeUnitId};
use crate::message::{CcoId, OpHead};
use crate::op::Participants;
use crate::parity;

/// Default age past which a receive-side operation is considered timed
/// out by the watchdog, mirroring `OPERATION_TIMEOUT_LEVEL_A`.
pub const OPERATION_TIMEOUT_LEVEL_A: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantState {
    Init,
    Prepare,
    CanCommit,
    Committed,
    Success,
    Failure,
}

/// State carried by a single participant for one stripe operation.
#[derive(Debug, Clone)]
pub struct ParticipantOperation {
    pub cco_id: CcoId,
    pub op_head: OpHead,
    pub state: ParticipantState,
    pub my_unit_id: StripeUnitId,
    pub primary_coordinator: ServerId,
    pub participants: Participants,
    pub is_full_stripe: bool,
    pub received_at: Instant,
    pub parity_piece: Option<Vec<u8>>,
    pub allocated_version: Option<u32>,
}

impl ParticipantOperation {
    pub fn new(
        cco_id: CcoId,
        op_head: OpHead,
        my_unit_id: StripeUnitId,
        primary_coordinator: ServerId,
        participants: Participants,
        is_full_stripe: bool,
    ) -> Self {
        Self {
            cco_id,
            op_head,
            state: ParticipantState::Init,
            my_unit_id,
            primary_coordinator,
            participants,
            is_full_stripe,
            received_at: Instant::now(),
            parity_piece: None,
            allocated_version: None,
        }
    }

    /// A stripe-unit write waits for `Prepare`; a full-stripe write
    /// skips straight to allocating its version (§4.E).
    pub fn skips_prepare(&self) -> bool {
        self.is_full_stripe
    }

    #[instrument(skip(self), fields(csid = self.cco_id.client_session_id, seq = self.cco_id.sequence_number))]
    pub fn on_prepare(&mut self) -> Result<()> {
        self.expect_state(ParticipantState::Init)?;
        self.state = ParticipantState::Prepare;
        Ok(())
    }

    /// Computes this unit's parity contribution (`new XOR existing`, or
    /// a plain copy when there was no prior block) and transitions into
    /// `CanCommit`.
    #[instrument(skip(self, new_data, existing_data))]
    pub fn compute_can_commit(
        &mut self,
        next_version: u32,
        new_data: &[u8],
        existing_data: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        if !self.is_full_stripe {
            self.expect_state(ParticipantState::Prepare)?;
        } else {
            self.expect_state(ParticipantState::Init)?;
        }
        let piece = parity::parity_piece(new_data, existing_data)?;
        self.parity_piece = Some(piece.clone());
        self.allocated_version = Some(next_version);
        self.state = ParticipantState::CanCommit;
        Ok(piece)
    }

    /// Merges the coordinator's broadcast version vector and transitions
    /// toward writing the new block to disk.
    #[instrument(skip(self, version_vector))]
    pub fn on_do_commit(&mut self, version_vector: &[u32]) -> Result<()> {
        self.expect_state(ParticipantState::CanCommit)?;
        if let Some(my_version) = version_vector.get(self.my_unit_id as usize) {
            self.allocated_version = Some(*my_version);
        }
        self.state = ParticipantState::Committed;
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn on_result(&mut self, success: bool) -> Result<()> {
        self.expect_state(ParticipantState::Committed)?;
        self.state = if success {
            ParticipantState::Success
        } else {
            ParticipantState::Failure
        };
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ParticipantState::Success | ParticipantState::Failure)
    }

    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_terminal() && now.saturating_duration_since(self.received_at) > timeout
    }

    fn expect_state(&self, expected: ParticipantState) -> Result<()> {
        if self.state != expected {
            warn!(
                csid = self.cco_id.client_session_id,
                seq = self.cco_id.sequence_number,
                "participant operation in unexpected state"
            );
            return Err(Error::UnexpectedState {
                csid: self.cco_id.client_session_id,
                seq: self.cco_id.sequence_number,
                state: state_name(self.state),
            });
        }
        Ok(())
    }
}

fn state_name(state: ParticipantState) -> &'static str {
    match state {
        ParticipantState::Init => "init",
        ParticipantState::Prepare => "prepare",
        ParticipantState::CanCommit => "cancommit",
        ParticipantState::Committed => "committed",
        ParticipantState::Success => "success",
        ParticipantState::Failure => "failure",
    }
}
