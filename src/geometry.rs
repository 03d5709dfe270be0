//! RAID-4 stripe geometry.
//!
//! A [`FileLayout`] describes how a single file's byte range is carved into
//! stripes, how each stripe is carved into stripe units, and which cluster
//! server holds each unit. One server per group is dedicated to parity and
//! never holds data for that group — the defining property of RAID-4 (as
//! opposed to RAID-5, which rotates the parity unit across the group).
//!
//! All functions here are pure: given a layout and an offset they compute
//! the same answer on every node in the cluster, which is what lets a
//! client or server determine coordinator roles without talking to anyone.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identifies a stripe within a file. Stripes are numbered from zero in
/// file-offset order.
pub type StripeId = u32;

/// Identifies a stripe unit within a stripe, numbered 0..group_size-1 in
/// server order (the last slot per group is parity and is addressed
/// separately via [`FileLayout::parity_server`]).
pub type StripeUnitId = u8;

/// Cluster-wide server identifier.
pub type ServerId = u16;

/// The role a server plays for a given byte offset of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorRole {
    /// Neither primary nor secondary coordinator for this offset.
    Participant,
    /// Holds the data unit addressed by the offset; drives the operation
    /// from the client side of the three-phase commit.
    SecondaryCoordinator,
    /// Holds the parity unit for the stripe's group; owns the primary
    /// coordinator role of the three-phase commit.
    PrimaryCoordinator,
}

/// Static description of how a file is striped across the cluster.
///
/// `server_ids` lists every server holding a unit for this file, in group
/// order: the first `group_size` entries are group 0 (last one parity),
/// the next `group_size` are group 1, and so on. `server_count` must be an
/// exact multiple of `group_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLayout {
    /// Number of stripe units per group, including the parity unit.
    pub group_size: u8,
    /// Size in bytes of a single stripe unit.
    pub stripe_unit_size: u32,
    /// Total number of servers participating in this file's layout.
    pub server_count: u8,
    /// Server id for every stripe unit slot, `server_count` entries long.
    pub server_ids: Vec<ServerId>,
}

impl FileLayout {
    /// Builds a layout, validating that `group_size` evenly divides
    /// `server_ids.len()` and that the stripe unit size is nonzero.
    pub fn new(
        group_size: u8,
        stripe_unit_size: u32,
        server_ids: Vec<ServerId>,
    ) -> Result<Self> {
        let server_count = server_ids.len();
        if stripe_unit_size == 0 {
            return Err(Error::ZeroStripeUnit);
        }
        if group_size == 0 || server_count % group_size as usize != 0 {
            return Err(Error::InvalidLayout {
                group_size,
                server_count: server_count as u8,
            });
        }
        Ok(Self {
            group_size,
            stripe_unit_size,
            server_count: server_count as u8,
            server_ids,
        })
    }

    /// Number of data units per group (group size minus the parity unit).
    pub fn data_units_per_group(&self) -> u8 {
        self.group_size - 1
    }

    /// Number of groups covering the file's address space.
    pub fn group_count(&self) -> usize {
        self.server_count as usize / self.group_size as usize
    }

    /// Total bytes covered by one stripe across all data units of a group
    /// (the parity unit mirrors this size but carries no independent range).
    pub fn stripe_size(&self) -> u64 {
        self.data_units_per_group() as u64 * self.stripe_unit_size as u64
    }

    /// Which stripe a byte offset falls into.
    pub fn stripe_of(&self, offset: u64) -> StripeId {
        (offset / self.stripe_size()) as StripeId
    }

    /// Which group a stripe belongs to. Stripes cycle through the groups
    /// round-robin, one stripe per group per pass.
    pub fn group_of(&self, stripe_id: StripeId) -> u32 {
        (stripe_id / self.group_size as u32) % self.group_count() as u32
    }

    /// Which stripe-unit slot within its group a byte offset lands on.
    pub fn unit_of(&self, offset: u64) -> StripeUnitId {
        let stripe_id = self.stripe_of(offset);
        let stripe_start = stripe_id as u64 * self.stripe_size();
        let within_stripe = offset - stripe_start;
        let data_units = self.data_units_per_group() as u64;
        let naive_unit = within_stripe / self.stripe_unit_size as u64;
        (((stripe_id as u64 * data_units) + naive_unit) % data_units) as StripeUnitId
    }

    /// Resolves the cluster server id holding stripe-unit `unit_id` of
    /// `group_id`.
    pub fn server_of_group_unit(&self, group_id: u32, unit_id: StripeUnitId) -> Result<ServerId> {
        let group_size = self.group_size as usize;
        let idx = (group_id as usize * group_size) % self.server_count as usize + unit_id as usize;
        self.server_ids
            .get(idx)
            .copied()
            .ok_or(Error::OffsetOutOfRange {
                offset: idx as u64,
            })
    }

    /// Resolves the cluster server id holding stripe-unit `unit_id` of the
    /// group that owns `stripe_id`.
    pub fn server_of(&self, stripe_id: StripeId, unit_id: StripeUnitId) -> Result<ServerId> {
        self.server_of_group_unit(self.group_of(stripe_id), unit_id)
    }

    /// Resolves the parity server for the group owning `stripe_id`. The
    /// parity unit always occupies the last slot of its group.
    pub fn parity_server(&self, stripe_id: StripeId) -> Result<ServerId> {
        self.server_of(stripe_id, self.group_size - 1)
    }

    /// Resolves the data server that directly holds the byte range at
    /// `offset` — the secondary coordinator for an operation touching
    /// that offset.
    pub fn secondary_coordinator(&self, offset: u64) -> Result<ServerId> {
        let stripe_id = self.stripe_of(offset);
        self.server_of(stripe_id, self.unit_of(offset))
    }

    /// Determines the role `server_id` plays for an operation at `offset`.
    pub fn role_of(&self, server_id: ServerId, offset: u64) -> Result<CoordinatorRole> {
        let primary = self.parity_server(self.stripe_of(offset))?;
        if server_id == primary {
            return Ok(CoordinatorRole::PrimaryCoordinator);
        }
        let secondary = self.secondary_coordinator(offset)?;
        if server_id == secondary {
            return Ok(CoordinatorRole::SecondaryCoordinator);
        }
        Ok(CoordinatorRole::Participant)
    }

    /// Lists every stripe touched by a `[offset, offset+length)` byte
    /// range along with, per stripe, whether the range fully covers that
    /// stripe's data units (a "full stripe" write bypasses the
    /// read-modify-write parity dance and can compute parity directly).
    pub fn stripes_of(&self, offset: u64, length: u64) -> Vec<StripeSpan> {
        if length == 0 {
            return Vec::new();
        }
        let stripe_size = self.stripe_size();
        let end = offset + length;
        let mut spans = Vec::new();
        let mut cursor = offset;
        while cursor < end {
            let stripe_id = self.stripe_of(cursor);
            let stripe_start = stripe_id as u64 * stripe_size;
            let stripe_end = stripe_start + stripe_size;
            let span_end = end.min(stripe_end);
            let is_full = stripe_start >= offset && span_end >= stripe_end;
            spans.push(StripeSpan {
                stripe_id,
                start: cursor,
                end: span_end,
                is_full,
            });
            cursor = span_end;
        }
        spans
    }
}

/// One stripe's portion of a multi-stripe I/O range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeSpan {
    pub stripe_id: StripeId,
    pub start: u64,
    pub end: u64,
    /// True when this span covers the stripe's entire data extent, so the
    /// write can recompute parity directly rather than folding against the
    /// previously stored block.
    pub is_full: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(group_size: u8, groups: usize) -> FileLayout {
        let server_count = group_size as usize * groups;
        FileLayout::new(
            group_size,
            4096,
            (0..server_count as u16).collect(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_group_size_not_dividing_server_count() {
        let err = FileLayout::new(4, 4096, (0..5).collect()).unwrap_err();
        assert!(matches!(err, Error::InvalidLayout { .. }));
    }

    #[test]
    fn rejects_zero_stripe_unit() {
        let err = FileLayout::new(4, 0, (0..4).collect()).unwrap_err();
        assert!(matches!(err, Error::ZeroStripeUnit));
    }

    #[test]
    fn single_group_stripe_and_unit_roundtrip() {
        let fl = layout(4, 1);
        // group_size=4 -> 3 data units per stripe, 4096 bytes each.
        assert_eq!(fl.stripe_size(), 3 * 4096);
        assert_eq!(fl.stripe_of(0), 0);
        assert_eq!(fl.stripe_of(3 * 4096), 1);
        assert_eq!(fl.unit_of(0), 0);
        assert_eq!(fl.unit_of(4096), 1);
        assert_eq!(fl.unit_of(2 * 4096), 2);
    }

    #[test]
    fn parity_server_is_last_slot_of_group() {
        let fl = layout(4, 2);
        // group 0 = servers [0,1,2,3], group 1 = servers [4,5,6,7].
        // Stripes cycle through a whole group (group_size stripes) before
        // moving to the next group: stripes 0..4 are group 0, 4..8 group 1.
        assert_eq!(fl.parity_server(0).unwrap(), 3);
        assert_eq!(fl.parity_server(3).unwrap(), 3);
        assert_eq!(fl.parity_server(4).unwrap(), 7);
    }

    #[test]
    fn role_of_classifies_primary_secondary_participant() {
        let fl = layout(4, 1);
        let offset = 0u64; // stripe 0, unit 0 -> server 0
        assert_eq!(
            fl.role_of(0, offset).unwrap(),
            CoordinatorRole::SecondaryCoordinator
        );
        assert_eq!(
            fl.role_of(3, offset).unwrap(),
            CoordinatorRole::PrimaryCoordinator
        );
        assert_eq!(
            fl.role_of(1, offset).unwrap(),
            CoordinatorRole::Participant
        );
    }

    #[test]
    fn stripes_of_spans_multiple_stripes() {
        let fl = layout(4, 1);
        let stripe_size = fl.stripe_size();
        let spans = fl.stripes_of(stripe_size - 10, 20);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].stripe_id, 0);
        assert!(!spans[0].is_full);
        assert_eq!(spans[1].stripe_id, 1);
        assert!(!spans[1].is_full);
    }

    #[test]
    fn stripes_of_detects_full_stripe_write() {
        let fl = layout(4, 1);
        let stripe_size = fl.stripe_size();
        let spans = fl.stripes_of(0, stripe_size);
        assert_eq!(spans.len(), 1);
        assert!(spans[0].is_full);
    }
}
