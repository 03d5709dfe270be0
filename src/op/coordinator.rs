//! Primary coordinator operation: runs on the parity server of a
//! stripe, driving the three-phase commit across that stripe's
//! participants.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::geometry::StripeUnitId;
use crate::message::{CcoId, OpHead};
use crate::op::Participants;
use crate::parity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryCoordinatorState {
    Init,
    Prepare,
    DoCommit,
    Committed,
    Success,
    Failure,
}

/// One participant's `CanCommit` contribution: the version it allocated
/// for itself and its XOR parity piece (full-stripe writes carry the
/// raw seed through the same slot since the coordinator folds it
/// identically either way).
#[derive(Debug, Clone)]
pub struct CanCommitPiece {
    pub version: u32,
    pub parity_piece: Vec<u8>,
}

/// State carried by the primary coordinator for one stripe operation.
#[derive(Debug, Clone)]
pub struct PrimaryCoordinatorOperation {
    pub cco_id: CcoId,
    pub op_head: OpHead,
    pub state: PrimaryCoordinatorState,
    pub participants: Participants,
    pub received_from: Participants,
    pub committed_from: Participants,
    pub pieces: HashMap<StripeUnitId, CanCommitPiece>,
    pub final_parity: Option<Vec<u8>>,
    pub allocated_parity_version: Option<u32>,
    pub received_at: Instant,
}

impl PrimaryCoordinatorOperation {
    pub fn new(cco_id: CcoId, op_head: OpHead, participants: Participants) -> Self {
        Self {
            cco_id,
            op_head,
            state: PrimaryCoordinatorState::Init,
            participants,
            received_from: Participants::empty(),
            committed_from: Participants::empty(),
            pieces: HashMap::new(),
            final_parity: None,
            allocated_parity_version: None,
            received_at: Instant::now(),
        }
    }

    /// Records a `Received` from `unit`. Returns `true` once every
    /// expected participant has reported and the operation has moved to
    /// `Prepare` (the caller should then broadcast `Prepare`).
    #[instrument(skip(self))]
    pub fn on_received(&mut self, unit: StripeUnitId) -> bool {
        self.received_from.set(unit);
        if self.state == PrimaryCoordinatorState::Init
            && self.received_from.equals(self.participants)
        {
            self.state = PrimaryCoordinatorState::Prepare;
            return true;
        }
        false
    }

    /// Records a participant's `CanCommit` piece. Returns `Some(final
    /// parity)` once every participant has reported, having XORed every
    /// piece (and the previous on-disk parity block, if present) into
    /// one buffer.
    #[instrument(skip(self, piece, existing_parity))]
    pub fn on_can_commit(
        &mut self,
        unit: StripeUnitId,
        version: u32,
        piece: Vec<u8>,
        existing_parity: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>> {
        self.expect_state(PrimaryCoordinatorState::Prepare)?;
        self.pieces.insert(unit, CanCommitPiece { version, parity_piece: piece });

        if self.pieces.len() as u32 != self.participants.count() {
            return Ok(None);
        }

        let mut final_parity: Vec<u8> = match existing_parity {
            Some(p) => p.to_vec(),
            None => Vec::new(),
        };
        let mut units: Vec<&StripeUnitId> = self.pieces.keys().collect();
        units.sort();
        for unit in units {
            parity::fold_parity(&mut final_parity, &self.pieces[unit].parity_piece)?;
        }
        self.final_parity = Some(final_parity.clone());
        self.state = PrimaryCoordinatorState::DoCommit;
        Ok(Some(final_parity))
    }

    /// Builds the per-stripe version vector to broadcast with
    /// `DoCommit`, from each participant's allocated version plus this
    /// coordinator's own parity-slot version.
    pub fn build_version_vector(&self, group_size: u8, my_parity_version: u32) -> Vec<u32> {
        let mut vector = vec![0u32; group_size as usize];
        for (unit, piece) in &self.pieces {
            vector[*unit as usize] = piece.version;
        }
        vector[group_size as usize - 1] = my_parity_version;
        vector
    }

    /// Records a participant's `Committed`. Returns `true` once every
    /// participant has committed and the operation has advanced to
    /// `Committed` (caller should promote the parity block and
    /// broadcast `Result(success)`).
    #[instrument(skip(self))]
    pub fn on_committed(&mut self, unit: StripeUnitId) -> Result<bool> {
        self.expect_state(PrimaryCoordinatorState::DoCommit)?;
        self.committed_from.set(unit);
        if self.committed_from.equals(self.participants) {
            self.state = PrimaryCoordinatorState::Committed;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn finish(&mut self, success: bool) {
        self.state = if success {
            PrimaryCoordinatorState::Success
        } else {
            PrimaryCoordinatorState::Failure
        };
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            PrimaryCoordinatorState::Success | PrimaryCoordinatorState::Failure
        )
    }

    pub fn is_timed_out(&self, now: Instant, timeout: std::time::Duration) -> bool {
        !self.is_terminal() && now.saturating_duration_since(self.received_at) > timeout
    }

    fn expect_state(&self, expected: PrimaryCoordinatorState) -> Result<()> {
        if self.state != expected {
            warn!(
                csid = self.cco_id.client_session_id,
                seq = self.cco_id.sequence_number,
                "coordinator operation in unexpected state"
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

fn state_name(state: PrimaryCoordinatorState) -> &'static str {
    match state {
        PrimaryCoordinatorState::Init => "init",
        PrimaryCoordinatorState::Prepare => "prepare",
        PrimaryCoordinatorState::DoCommit => "docommit",
        PrimaryCoordinatorState::Committed => "committed",
        PrimaryCoordinatorState::Success => "success",
        PrimaryCoordinatorState::Failure => "failure",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::FileLayout;
    use crate::message::{OpStatus, OpType};

    fn head() -> OpHead {
        OpHead {
            cco_id: CcoId::new(1, 1),
            inum: 1,
            offset: 0,
            length: 4096 * 3,
            op_type: OpType::PrimaryCoordinator,
            subtype: 0,
            stripe_count: 1,
            status: OpStatus::Init,
            file_layout: FileLayout::new(4, 4096, vec![0, 1, 2, 3]).unwrap(),
            participant_units: vec![0, 1, 2],
            unit: 0,
            version: 0,
        }
    }

    #[test]
    fn transitions_to_prepare_once_all_received() {
        let mut op = PrimaryCoordinatorOperation::new(CcoId::new(1, 1), head(), Participants::all(3));
        assert!(!op.on_received(0));
        assert!(!op.on_received(1));
        assert!(op.on_received(2));
        assert_eq!(op.state, PrimaryCoordinatorState::Prepare);
    }

    #[test]
    fn final_parity_folds_all_pieces_and_previous_block() {
        let mut op = PrimaryCoordinatorOperation::new(CcoId::new(1, 1), head(), Participants::all(3));
        op.on_received(0);
        op.on_received(1);
        op.on_received(2);

        let piece_a = vec![0b0001u8; 4];
        let piece_b = vec![0b0010u8; 4];
        let piece_c = vec![0b0100u8; 4];
        let existing = vec![0b1000u8; 4];

        assert!(op.on_can_commit(0, 1, piece_a.clone(), Some(&existing)).unwrap().is_none());
        assert!(op.on_can_commit(1, 1, piece_b.clone(), Some(&existing)).unwrap().is_none());
        let final_parity = op.on_can_commit(2, 1, piece_c.clone(), Some(&existing)).unwrap().unwrap();

        let mut expected = existing;
        crate::parity::xor_into(&mut expected, &piece_a).unwrap();
        crate::parity::xor_into(&mut expected, &piece_b).unwrap();
        crate::parity::xor_into(&mut expected, &piece_c).unwrap();
        assert_eq!(final_parity, expected);
        assert_eq!(op.state, PrimaryCoordinatorState::DoCommit);
    }

    #[test]
    fn completes_after_all_committed() {
        let mut op = PrimaryCoordinatorOperation::new(CcoId::new(1, 1), head(), Participants::all(2));
        op.on_received(0);
        op.on_received(1);
        op.on_can_commit(0, 1, vec![1], None).unwrap();
        op.on_can_commit(1, 1, vec![2], None).unwrap();

        assert!(!op.on_committed(0).unwrap());
        assert!(op.on_committed(1).unwrap());
        assert_eq!(op.state, PrimaryCoordinatorState::Committed);
        op.finish(true);
        assert_eq!(op.state, PrimaryCoordinatorState::Success);
    }

    #[test]
    fn version_vector_places_parity_in_last_slot() {
        let mut op = PrimaryCoordinatorOperation::new(CcoId::new(1, 1), head(), Participants::all(3));
        op.on_received(0);
        op.on_received(1);
        op.on_received(2);
        op.on_can_commit(0, 5, vec![1], None).unwrap();
        op.on_can_commit(1, 6, vec![1], None).unwrap();
        op.on_can_commit(2, 7, vec![1], None).unwrap();

        let vector = op.build_version_vector(4, 9);
        assert_eq!(vector, vec![5, 6, 7, 9]);
    }
}
