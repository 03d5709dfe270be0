//! Per-inode operation arena.
//!
//! `StripeManager` replaces the original's pointer-keyed operation maps
//! with `DashMap`s keyed by the stable [`OperationId`] (the operation's
//! `CcoId`), so an operation can be looked up, advanced, and removed
//! without ever chasing a raw pointer. One `StripeManager` exists per
//! inode that has active operations; `node.rs` owns the table of these
//! keyed by inode number.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::{Error, Result};
use crate::op::{
    ClientCompositeWrite, ClientRead, OperationId, PrimaryCoordinatorOperation,
    ParticipantOperation,
};

/// Arena of in-flight operations for a single inode.
pub struct StripeManager {
    pub inum: u64,
    client_writes: DashMap<OperationId, ClientCompositeWrite>,
    client_reads: DashMap<OperationId, ClientRead>,
    participant_ops: DashMap<OperationId, Mutex<ParticipantOperation>>,
    coordinator_ops: DashMap<OperationId, Mutex<PrimaryCoordinatorOperation>>,
}

impl StripeManager {
    pub fn new(inum: u64) -> Self {
        Self {
            inum,
            client_writes: DashMap::new(),
            client_reads: DashMap::new(),
            participant_ops: DashMap::new(),
            coordinator_ops: DashMap::new(),
        }
    }

    pub fn insert_client_write(&self, id: OperationId, op: ClientCompositeWrite) {
        self.client_writes.insert(id, op);
    }

    pub fn client_write(&self, id: OperationId) -> Result<dashmap::mapref::one::Ref<'_, OperationId, ClientCompositeWrite>> {
        self.client_writes
            .get(&id)
            .ok_or(Error::NoSuchOperation {
                csid: id.client_session_id,
                seq: id.sequence_number,
            })
    }

    pub fn remove_client_write(&self, id: OperationId) {
        self.client_writes.remove(&id);
    }

    pub fn insert_client_read(&self, id: OperationId, op: ClientRead) {
        self.client_reads.insert(id, op);
    }

    pub fn client_read(&self, id: OperationId) -> Result<dashmap::mapref::one::Ref<'_, OperationId, ClientRead>> {
        self.client_reads
            .get(&id)
            .ok_or(Error::NoSuchOperation {
                csid: id.client_session_id,
                seq: id.sequence_number,
            })
    }

    pub fn remove_client_read(&self, id: OperationId) {
        self.client_reads.remove(&id);
    }

    pub fn insert_participant(&self, id: OperationId, op: ParticipantOperation) {
        self.participant_ops.insert(id, Mutex::new(op));
    }

    pub fn with_participant<R>(&self, id: OperationId, f: impl FnOnce(&mut ParticipantOperation) -> R) -> Result<R> {
        let entry = self
            .participant_ops
            .get(&id)
            .ok_or(Error::NoSuchOperation {
                csid: id.client_session_id,
                seq: id.sequence_number,
            })?;
        let mut guard = entry.lock();
        Ok(f(&mut guard))
    }

    pub fn remove_participant(&self, id: OperationId) {
        self.participant_ops.remove(&id);
    }

    pub fn insert_coordinator(&self, id: OperationId, op: PrimaryCoordinatorOperation) {
        self.coordinator_ops.insert(id, Mutex::new(op));
    }

    pub fn has_coordinator(&self, id: OperationId) -> bool {
        self.coordinator_ops.contains_key(&id)
    }

    pub fn with_coordinator<R>(&self, id: OperationId, f: impl FnOnce(&mut PrimaryCoordinatorOperation) -> R) -> Result<R> {
        let entry = self
            .coordinator_ops
            .get(&id)
            .ok_or(Error::NoSuchOperation {
                csid: id.client_session_id,
                seq: id.sequence_number,
            })?;
        let mut guard = entry.lock();
        Ok(f(&mut guard))
    }

    pub fn remove_coordinator(&self, id: OperationId) {
        self.coordinator_ops.remove(&id);
    }

    /// Walks every coordinator operation on this inode and fails any
    /// whose receive timestamp is older than `timeout`, mirroring the
    /// original's `timer_watchdog`. Returns the ids that were failed so
    /// the caller can broadcast `Result(failure)` and clean up.
    pub fn timeout_check(&self, timeout: Duration) -> Vec<OperationId> {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        for entry in self.coordinator_ops.iter() {
            let mut guard = entry.value().lock();
            if guard.is_timed_out(now, timeout) {
                warn!(
                    inum = self.inum,
                    csid = guard.cco_id.client_session_id,
                    seq = guard.cco_id.sequence_number,
                    "coordinator operation timed out"
                );
                guard.finish(false);
                timed_out.push(*entry.key());
            }
        }
        timed_out
    }

    pub fn is_idle(&self) -> bool {
        self.client_writes.is_empty()
            && self.client_reads.is_empty()
            && self.participant_ops.is_empty()
            && self.coordinator_ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::FileLayout;
    use crate::message::{CcoId, OpHead, OpStatus, OpType};
    use crate::op::Participants;

    fn head() -> OpHead {
        OpHead {
            cco_id: CcoId::new(1, 1),
            inum: 1,
            offset: 0,
            length: 4096,
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
    fn unknown_operation_lookup_errors() {
        let mgr = StripeManager::new(1);
        let err = mgr.client_write(CcoId::new(9, 9)).unwrap_err();
        assert!(matches!(err, Error::NoSuchOperation { .. }));
    }

    #[test]
    fn timeout_check_fails_stale_coordinator_ops_only() {
        let mgr = StripeManager::new(1);
        let id = CcoId::new(1, 1);
        let mut op = PrimaryCoordinatorOperation::new(id, head(), Participants::all(4));
        op.received_at = Instant::now() - Duration::from_secs(100);
        mgr.insert_coordinator(id, op);

        let fresh_id = CcoId::new(1, 2);
        mgr.insert_coordinator(
            fresh_id,
            PrimaryCoordinatorOperation::new(fresh_id, head(), Participants::all(4)),
        );

        let timed_out = mgr.timeout_check(Duration::from_secs(2));
        assert_eq!(timed_out, vec![id]);
    }
}
