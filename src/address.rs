//! Block Address Codec
//!
//! Every block in the store is named by a 64-bit address: the top 16 bits select a stripe file,
//! the low 48 bits are the block's offset within that file. Address `0` is reserved so that a
//! zeroed field can always be read back as "no block here".
use crate::error::Error;

/// Number of bits reserved for the offset component of an address.
const OFFSET_BITS: u32 = 48;
/// Mask selecting the offset component of an address.
const OFFSET_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// A stripe index, `0 <= s < F`.
pub type StripeIndex = u16;
/// An offset, in blocks, within a single stripe file. Must fit in 48 bits.
pub type BlockOffset = u64;
/// A fully encoded block address: `stripe:16 | offset:48`.
pub type Address = u64;

/// The reserved "no block" address.
pub const INVALID_ADDRESS: Address = 0;

/// Encode a stripe index and an in-stripe offset into a block address.
///
/// # Panics
/// Panics if `offset` does not fit in 48 bits. The
/// stripe index can never overflow since it is a `u16` and the field is also 16 bits wide.
pub fn make(stripe: StripeIndex, offset: BlockOffset) -> Address {
    assert!(
        offset & !OFFSET_MASK == 0,
        "block offset {} does not fit in 48 bits",
        offset
    );
    ((stripe as u64) << OFFSET_BITS) | (offset & OFFSET_MASK)
}

/// Extract the stripe index from an address.
pub fn stripe(addr: Address) -> StripeIndex {
    (addr >> OFFSET_BITS) as StripeIndex
}

/// Extract the in-stripe offset from an address.
pub fn offset(addr: Address) -> BlockOffset {
    addr & OFFSET_MASK
}

/// Validate that `stripe` is within the configured fan-out `f`, returning a `Misuse` error
/// rather than panicking -- used at the boundary where an externally supplied address is
/// decoded (e.g. a child pointer embedded in a deserialized Coreblock).
pub fn check_stripe(stripe_idx: StripeIndex, f: u16) -> Result<(), Error> {
    if stripe_idx >= f {
        Err(Error::Misuse(format!(
            "stripe {} out of range (F = {})",
            stripe_idx, f
        )))
    } else {
        Ok(())
    }
}
