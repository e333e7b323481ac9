//! Error types surfaced by handle and allocation operations.
//!
//! The collector itself never surfaces failures; element destructor panics
//! during a sweep are swallowed per element so one broken destructor cannot
//! leak the remainder of a block.

use thiserror::Error;

/// Failure raised by checked dereference and by allocation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PtrError {
    /// The handle's target is null.
    #[error("dereferencing null handle")]
    NullDeref,

    /// The handle is attached and its target (or the requested element) lies
    /// outside the attached block's payload.
    #[error("dereferencing out of bounds handle")]
    OutOfBounds,

    /// The host allocator refused the request, or the requested payload
    /// size overflowed.
    #[error("heap refused an allocation of {0} bytes")]
    AllocFailed(usize),
}

/// Failure from a fallible allocation.
///
/// When an element initializer fails partway through an array allocation,
/// the elements already built are destroyed, the block is released, and the
/// requesting handle reverts to null and unattached before this error is
/// returned.
#[derive(Debug, Error)]
pub enum InitError<E: std::error::Error + 'static> {
    /// The block itself could not be allocated.
    #[error(transparent)]
    Ptr(#[from] PtrError),

    /// The initializer for one element failed.
    #[error("element {index} failed to initialize")]
    Element {
        /// Index of the element whose initializer failed. Exactly `index`
        /// elements were destroyed during rollback.
        index: usize,
        #[source]
        source: E,
    },
}
