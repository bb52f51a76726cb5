//! Checksum guard written immediately past every tracked payload.
//!
//! Block layout handed to the raw allocator:
//!
//! ```text
//!   payload (byte_count bytes, zero-filled) | guard marker (GUARD_SIZE bytes)
//! ```
//!
//! The marker is a fixed byte sequence. It is written once at allocation
//! time and must be unchanged when the record is freed or walked; any
//! difference means something wrote past the end of the payload.

#![allow(unsafe_code)]

use std::fmt;

/// Size of the trailing guard marker.
pub const GUARD_SIZE: usize = 8;

/// The guard marker bytes.
pub const GUARD_MARKER: [u8; GUARD_SIZE] = 0xA5C3_0FF1_CE5E_ED5Au64.to_le_bytes();

/// Outcome of comparing the bytes after a payload with [`GUARD_MARKER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardCheck {
    /// Marker unchanged.
    Intact,
    /// At least one marker byte was overwritten.
    Overrun {
        /// Offset (from the end of the payload) of the first changed byte.
        first_bad_offset: usize,
        /// Bytes actually found where the marker should be.
        observed: [u8; GUARD_SIZE],
    },
}

impl GuardCheck {
    /// Compare observed trailing bytes against the marker.
    #[must_use]
    pub fn classify(observed: [u8; GUARD_SIZE]) -> Self {
        match observed
            .iter()
            .zip(GUARD_MARKER.iter())
            .position(|(seen, want)| seen != want)
        {
            None => Self::Intact,
            Some(first_bad_offset) => Self::Overrun {
                first_bad_offset,
                observed,
            },
        }
    }

    #[must_use]
    pub const fn is_intact(&self) -> bool {
        matches!(self, Self::Intact)
    }
}

impl fmt::Display for GuardCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Intact => f.write_str("guard intact"),
            Self::Overrun {
                first_bad_offset,
                observed,
            } => write!(
                f,
                "guard overrun at payload end +{first_bad_offset} (found {:016x})",
                u64::from_le_bytes(*observed)
            ),
        }
    }
}

/// Raw block size for a payload of `byte_count` bytes, or `None` on overflow.
#[must_use]
pub fn block_size(byte_count: usize) -> Option<usize> {
    byte_count.checked_add(GUARD_SIZE)
}

/// Write the guard marker right after a payload.
///
/// # Safety
///
/// `payload_addr` must be valid for writes of `byte_count + GUARD_SIZE` bytes.
pub unsafe fn write_guard(payload_addr: usize, byte_count: usize) {
    // SAFETY: guaranteed by the caller; the marker ends at the block end.
    unsafe {
        let guard_ptr = (payload_addr as *mut u8).add(byte_count);
        std::ptr::copy_nonoverlapping(GUARD_MARKER.as_ptr(), guard_ptr, GUARD_SIZE);
    }
}

/// Read the bytes where the guard marker should be.
///
/// # Safety
///
/// `payload_addr` must be valid for reads of `byte_count + GUARD_SIZE` bytes.
#[must_use]
pub unsafe fn read_guard(payload_addr: usize, byte_count: usize) -> [u8; GUARD_SIZE] {
    let mut observed = [0u8; GUARD_SIZE];
    // SAFETY: guaranteed by the caller.
    unsafe {
        let guard_ptr = (payload_addr as *const u8).add(byte_count);
        std::ptr::copy_nonoverlapping(guard_ptr, observed.as_mut_ptr(), GUARD_SIZE);
    }
    observed
}

/// Validate the guard marker of a live block.
///
/// # Safety
///
/// `payload_addr` must be valid for reads of `byte_count + GUARD_SIZE` bytes.
#[must_use]
pub unsafe fn check_guard(payload_addr: usize, byte_count: usize) -> GuardCheck {
    // SAFETY: forwarded caller contract.
    GuardCheck::classify(unsafe { read_guard(payload_addr, byte_count) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_is_not_uniform() {
        // A uniform marker would survive a memset of the same byte.
        assert!(GUARD_MARKER.windows(2).any(|w| w[0] != w[1]));
        assert!(!GUARD_MARKER.contains(&0));
    }

    #[test]
    fn classify_reports_first_changed_byte() {
        assert_eq!(GuardCheck::classify(GUARD_MARKER), GuardCheck::Intact);

        let mut bytes = GUARD_MARKER;
        bytes[3] ^= 0xFF;
        bytes[6] ^= 0x01;
        match GuardCheck::classify(bytes) {
            GuardCheck::Overrun {
                first_bad_offset,
                observed,
            } => {
                assert_eq!(first_bad_offset, 3);
                assert_eq!(observed, bytes);
            }
            GuardCheck::Intact => panic!("corruption not detected"),
        }
    }

    #[test]
    fn write_then_check_in_buffer() {
        let mut buf = vec![0u8; 24 + GUARD_SIZE];
        let addr = buf.as_mut_ptr() as usize;
        // SAFETY: buf holds 24 + GUARD_SIZE bytes.
        unsafe {
            write_guard(addr, 24);
            assert!(check_guard(addr, 24).is_intact());
        }
        buf[24] = 0;
        // SAFETY: as above.
        let check = unsafe { check_guard(addr, 24) };
        assert!(matches!(
            check,
            GuardCheck::Overrun {
                first_bad_offset: 0,
                ..
            }
        ));
        assert!(check.to_string().contains("+0"));
    }

    #[test]
    fn block_size_overflow_is_none() {
        assert_eq!(block_size(10), Some(10 + GUARD_SIZE));
        assert_eq!(block_size(usize::MAX), None);
    }
}
