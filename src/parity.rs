//! RAID-4 XOR parity.
//!
//! Unlike general Reed-Solomon erasure coding, RAID-4 keeps exactly one
//! parity unit per group and computes it with a plain bytewise XOR fold —
//! there is no Galois-field arithmetic here, only `^`. This module has two
//! jobs: folding a changed block into a running parity buffer, and
//! computing the fixed-size checksum word that is stored alongside every
//! on-disk block and message payload.

use crate::error::{Error, Result};

/// XORs `src` into `dst` in place. `dst` and `src` must be the same
/// length — this is the primitive used both to fold a new data block into
/// a running parity accumulator and to recover a block from the others in
/// its stripe.
pub fn xor_into(dst: &mut [u8], src: &[u8]) -> Result<()> {
    if dst.len() != src.len() {
        return Err(Error::MessageMalformed(format!(
            "xor_into length mismatch: dst={} src={}",
            dst.len(),
            src.len()
        )));
    }
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
    Ok(())
}

/// Computes `a XOR b` into a freshly allocated buffer.
pub fn xor(a: &[u8], b: &[u8]) -> Result<Vec<u8>> {
    let mut out = a.to_vec();
    xor_into(&mut out, b)?;
    Ok(out)
}

/// Computes the parity contribution of writing `new_data` over
/// `existing_data` at the same stripe unit: `new XOR existing`. When there
/// is no existing block (the unit has never been written), the
/// contribution is simply a copy of `new_data`.
pub fn parity_piece(new_data: &[u8], existing_data: Option<&[u8]>) -> Result<Vec<u8>> {
    match existing_data {
        Some(existing) => xor(new_data, existing),
        None => Ok(new_data.to_vec()),
    }
}

/// Folds a primary coordinator's running parity accumulator with another
/// participant's `parity_piece` contribution (or the previous parity
/// block, when one exists). Equivalent to `accumulator ^= contribution`.
pub fn fold_parity(accumulator: &mut Vec<u8>, contribution: &[u8]) -> Result<()> {
    if accumulator.is_empty() {
        *accumulator = contribution.to_vec();
        return Ok(());
    }
    xor_into(accumulator, contribution)
}

/// Folds every word of `data` into a single 32-bit checksum, matching the
/// whole-buffer XOR fold used for both block checksums and message
/// header checksums. `data` is processed as 4-byte little-endian words;
/// a trailing partial word is zero-padded.
pub fn checksum(data: &[u8]) -> u32 {
    let mut acc = 0u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let word = u32::from_le_bytes(chunk.try_into().unwrap());
        acc ^= word;
    }
    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut buf = [0u8; 4];
        buf[..rem.len()].copy_from_slice(rem);
        acc ^= u32::from_le_bytes(buf);
    }
    acc
}

/// Verifies that `data` matches a previously computed checksum.
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    checksum(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_self_inverse() {
        let a = vec![0xAAu8; 16];
        let b = vec![0x55u8; 16];
        let x = xor(&a, &b).unwrap();
        let back = xor(&x, &b).unwrap();
        assert_eq!(back, a);
    }

    #[test]
    fn xor_into_rejects_length_mismatch() {
        let mut dst = vec![0u8; 4];
        let src = vec![0u8; 8];
        assert!(xor_into(&mut dst, &src).is_err());
    }

    #[test]
    fn parity_piece_without_existing_is_copy() {
        let data = vec![1, 2, 3, 4];
        let piece = parity_piece(&data, None).unwrap();
        assert_eq!(piece, data);
    }

    #[test]
    fn fold_parity_accumulates_across_contributions() {
        let a = vec![0b0001u8; 8];
        let b = vec![0b0010u8; 8];
        let c = vec![0b0100u8; 8];
        let mut acc = Vec::new();
        fold_parity(&mut acc, &a).unwrap();
        fold_parity(&mut acc, &b).unwrap();
        fold_parity(&mut acc, &c).unwrap();
        let expected = xor(&xor(&a, &b).unwrap(), &c).unwrap();
        assert_eq!(acc, expected);
    }

    #[test]
    fn checksum_detects_single_bit_flip() {
        let mut data = vec![1u8, 2, 3, 4, 5, 6, 7];
        let sum = checksum(&data);
        data[3] ^= 0x01;
        assert_ne!(checksum(&data), sum);
        assert!(!verify_checksum(&data, sum));
    }

    #[test]
    fn checksum_handles_non_multiple_of_four_length() {
        let data = vec![1u8, 2, 3];
        let sum = checksum(&data);
        assert!(verify_checksum(&data, sum));
    }
}

#[cfg(test)]
mod proptest_parity {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        // Reconstructing a new parity block after overwriting a unit must
        // equal XORing the old parity with the old and new unit contents:
        // P' = P XOR existing XOR new.
        #[test]
        fn reconstructed_parity_matches_full_fold(
            existing in proptest::collection::vec(any::<u8>(), 16),
            new in proptest::collection::vec(any::<u8>(), 16),
            old_parity in proptest::collection::vec(any::<u8>(), 16),
        ) {
            let piece = parity_piece(&new, Some(&existing)).unwrap();
            let mut acc = old_parity.clone();
            fold_parity(&mut acc, &piece).unwrap();

            let direct = xor(&xor(&old_parity, &existing).unwrap(), &new).unwrap();
            prop_assert_eq!(acc, direct);
        }

        #[test]
        fn xor_roundtrips(a in proptest::collection::vec(any::<u8>(), 32), b in proptest::collection::vec(any::<u8>(), 32)) {
            let x = xor(&a, &b).unwrap();
            let back = xor(&x, &b).unwrap();
            prop_assert_eq!(back, a);
        }
    }
}
