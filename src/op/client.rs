//! Client-side composite operations: a write fans a user byte range into
//! one sub-operation per affected stripe; a read fans into one
//! sub-operation per stripe unit and cross-checks version metadata
//! before concatenating the result.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::geometry::{ServerId, StripeId, StripeUnitId};
use crate::message::CcoId;

/// Default deadline a client waits for a composite operation to finish,
/// mirroring `SPN_OPERATION_TIMEOUT`.
pub const SPN_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubOperationStatus {
    Pending,
    Success,
    Failure,
}

/// One stripe's worth of a composite write: the servers it touches and
/// whether it fully covers the stripe (bypassing read-modify-write).
#[derive(Debug, Clone)]
pub struct WriteSubOperation {
    pub stripe_id: StripeId,
    pub is_full_stripe: bool,
    pub secondary_coordinator: ServerId,
    pub primary_coordinator: ServerId,
    pub status: SubOperationStatus,
}

/// Tracks a user write request fanned out across every stripe it
/// touches.
#[derive(Debug, Clone)]
pub struct ClientCompositeWrite {
    pub cco_id: CcoId,
    pub sub_ops: Vec<WriteSubOperation>,
    pub started_at: Instant,
}

impl ClientCompositeWrite {
    pub fn new(cco_id: CcoId, sub_ops: Vec<WriteSubOperation>) -> Self {
        Self {
            cco_id,
            sub_ops,
            started_at: Instant::now(),
        }
    }

    pub fn mark(&mut self, stripe_id: StripeId, status: SubOperationStatus) {
        for op in self.sub_ops.iter_mut() {
            if op.stripe_id == stripe_id {
                op.status = status;
            }
        }
    }

    /// The composite succeeds iff every sub-operation reports success.
    pub fn is_complete(&self) -> bool {
        self.sub_ops
            .iter()
            .all(|op| op.status != SubOperationStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        self.is_complete() && self.sub_ops.iter().all(|op| op.status == SubOperationStatus::Success)
    }

    pub fn is_timed_out(&self, now: Instant) -> bool {
        !self.is_complete() && now.saturating_duration_since(self.started_at) > SPN_OPERATION_TIMEOUT
    }
}

/// One stripe-unit read response: the data returned plus the metadata
/// version vector reported by its owning server.
#[derive(Debug, Clone)]
pub struct ReadUnitResponse {
    pub stripe_id: StripeId,
    pub unit_id: StripeUnitId,
    pub data: Vec<u8>,
    pub version_vector: Vec<u32>,
    pub checksum: u32,
    pub metadata_checksum_input: Vec<u8>,
}

/// Tracks a user read request fanned out into one sub-request per
/// stripe unit in the requested range.
#[derive(Debug, Clone, Default)]
pub struct ClientRead {
    pub expected: usize,
    pub responses: Vec<ReadUnitResponse>,
}

impl ClientRead {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            responses: Vec::new(),
        }
    }

    pub fn record(&mut self, response: ReadUnitResponse) {
        self.responses.push(response);
    }

    pub fn is_complete(&self) -> bool {
        self.responses.len() >= self.expected
    }

    /// Cross-version consistency check: for every pair of units `i`,
    /// `j` within the same stripe, unit `j`'s reported view of unit
    /// `i`'s version must not exceed unit `i`'s own reported version.
    pub fn check_consistency(&self) -> Result<()> {
        for stripe_id in self.stripe_ids() {
            let units: Vec<&ReadUnitResponse> = self
                .responses
                .iter()
                .filter(|r| r.stripe_id == stripe_id)
                .collect();
            for i in &units {
                for j in &units {
                    let i_idx = i.unit_id as usize;
                    if let (Some(j_view_of_i), Some(i_own)) = (
                        j.version_vector.get(i_idx),
                        i.version_vector.get(i_idx),
                    ) {
                        if j_view_of_i > i_own {
                            return Err(Error::VersionInconsistency {
                                inum: 0,
                                stripe_id,
                                expected: *i_own,
                                got: *j_view_of_i,
                            });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn stripe_ids(&self) -> Vec<StripeId> {
        let mut ids: Vec<StripeId> = self.responses.iter().map(|r| r.stripe_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Concatenates every response's data in stripe-then-unit order into
    /// a single buffer, after verifying each block's checksum.
    pub fn assemble(&self) -> Result<Vec<u8>> {
        self.check_consistency()?;
        let mut ordered = self.responses.clone();
        ordered.sort_by_key(|r| (r.stripe_id, r.unit_id));

        let mut out = Vec::new();
        for response in &ordered {
            if !crate::parity::verify_checksum(&response.metadata_checksum_input, response.checksum) {
                return Err(Error::ChecksumMismatch {
                    inum: 0,
                    stripe_id: response.stripe_id,
                    version: *response.version_vector.get(response.unit_id as usize).unwrap_or(&0),
                });
            }
            out.extend_from_slice(&response.data);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_write_succeeds_only_when_every_suboperation_succeeds() {
        let mut write = ClientCompositeWrite::new(
            CcoId::new(1, 1),
            vec![
                WriteSubOperation {
                    stripe_id: 0,
                    is_full_stripe: false,
                    secondary_coordinator: 0,
                    primary_coordinator: 3,
                    status: SubOperationStatus::Pending,
                },
                WriteSubOperation {
                    stripe_id: 1,
                    is_full_stripe: true,
                    secondary_coordinator: 4,
                    primary_coordinator: 7,
                    status: SubOperationStatus::Pending,
                },
            ],
        );
        assert!(!write.is_complete());
        write.mark(0, SubOperationStatus::Success);
        assert!(!write.is_complete());
        write.mark(1, SubOperationStatus::Success);
        assert!(write.is_complete());
        assert!(write.is_success());
    }

    #[test]
    fn composite_write_fails_if_any_suboperation_fails() {
        let mut write = ClientCompositeWrite::new(
            CcoId::new(1, 1),
            vec![WriteSubOperation {
                stripe_id: 0,
                is_full_stripe: false,
                secondary_coordinator: 0,
                primary_coordinator: 3,
                status: SubOperationStatus::Pending,
            }],
        );
        write.mark(0, SubOperationStatus::Failure);
        assert!(write.is_complete());
        assert!(!write.is_success());
    }

    #[test]
    fn read_consistency_rejects_inflated_peer_view() {
        let mut read = ClientRead::new(2);
        read.record(ReadUnitResponse {
            stripe_id: 0,
            unit_id: 0,
            data: vec![1],
            version_vector: vec![5, 0],
            checksum: 0,
            metadata_checksum_input: vec![],
        });
        read.record(ReadUnitResponse {
            stripe_id: 0,
            unit_id: 1,
            data: vec![2],
            version_vector: vec![9, 1], // claims unit 0 is at version 9, exceeding its own 5
            checksum: 0,
            metadata_checksum_input: vec![],
        });
        assert!(matches!(
            read.check_consistency(),
            Err(Error::VersionInconsistency { .. })
        ));
    }

    #[test]
    fn assemble_concatenates_in_stripe_unit_order() {
        let mut read = ClientRead::new(2);
        read.record(ReadUnitResponse {
            stripe_id: 0,
            unit_id: 1,
            data: vec![2, 2],
            version_vector: vec![1, 1],
            checksum: crate::parity::checksum(b"b"),
            metadata_checksum_input: b"b".to_vec(),
        });
        read.record(ReadUnitResponse {
            stripe_id: 0,
            unit_id: 0,
            data: vec![1, 1],
            version_vector: vec![1, 1],
            checksum: crate::parity::checksum(b"a"),
            metadata_checksum_input: b"a".to_vec(),
        });
        let assembled = read.assemble().unwrap();
        assert_eq!(assembled, vec![1, 1, 2, 2]);
    }
}
