//! Block header prepended to every managed allocation.
//!
//! Layout: | BlockHeader | padding to element alignment | element array ... |
//!
//! A block threads through exactly one list at a time via its `next` field:
//! the owning thread's construction stack while its elements are being
//! built, that thread's new-blocks list once they are built, the global
//! active list once the outermost allocation completes, or the transient
//! garbage list inside a sweep.

use core::alloc::Layout;
use core::ptr;
use core::sync::atomic::Ordering;

use bitflags::bitflags;

use crate::error::PtrError;
use crate::handle::HandleNode;

/// Element destructor callback: `(payload_base, nelems)`. `None` for element
/// types without drop glue.
pub(crate) type DestroyFn = unsafe fn(*mut u8, usize);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct BlockFlags: u8 {
        /// Committed to the global active list; eligible for collection.
        const ACTIVE = 1 << 0;
        /// Reached from the roots during the current mark phase.
        const MARKED = 1 << 1;
    }
}

/// Header of a managed block. Always followed by `nelems` elements of
/// uniform size occupying `objsize` bytes at `payload_offset`.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Destructor callback for the element array.
    pub(crate) destroy: Option<DestroyFn>,
    /// Head of the list of handles whose storage lies inside the payload.
    pub(crate) members: *mut HandleNode,
    /// Link for whichever block list currently owns this block.
    pub(crate) next: *mut BlockHeader,
    /// Number of constructed elements. Lowered during rollback so the
    /// destructor callback only visits elements that were actually built.
    pub(crate) nelems: usize,
    /// Payload size in bytes; the figure reported when the block is freed.
    pub(crate) objsize: usize,
    /// Byte offset from the header to the first element.
    payload_offset: usize,
    /// Size and alignment of the whole allocation, kept for release.
    alloc_size: usize,
    alloc_align: usize,
    pub(crate) flags: BlockFlags,
}

impl BlockHeader {
    /// Compute the allocation layout for a block of `nelems` elements and
    /// the byte offset of the payload within it.
    pub(crate) fn layout_for(
        nelems: usize,
        elem_size: usize,
        elem_align: usize,
    ) -> Result<(Layout, usize), PtrError> {
        let objsize = nelems
            .checked_mul(elem_size)
            .ok_or(PtrError::AllocFailed(usize::MAX))?;
        let payload = Layout::from_size_align(objsize, elem_align)
            .map_err(|_| PtrError::AllocFailed(objsize))?;
        let (layout, offset) = Layout::new::<BlockHeader>()
            .extend(payload)
            .map_err(|_| PtrError::AllocFailed(objsize))?;
        Ok((layout.pad_to_align(), offset))
    }

    /// Write a fresh header into `raw` (the start of an allocation made with
    /// the layout returned by [`layout_for`](Self::layout_for)).
    ///
    /// # Safety
    /// `raw` must point to at least `layout.size()` writable bytes aligned
    /// to `layout.align()`, and `payload_offset` must be the offset returned
    /// alongside `layout`.
    pub(crate) unsafe fn init(
        raw: *mut u8,
        nelems: usize,
        objsize: usize,
        payload_offset: usize,
        layout: Layout,
        destroy: Option<DestroyFn>,
    ) -> *mut BlockHeader {
        let header = raw as *mut BlockHeader;
        header.write(BlockHeader {
            destroy,
            members: ptr::null_mut(),
            next: ptr::null_mut(),
            nelems,
            objsize,
            payload_offset,
            alloc_size: layout.size(),
            alloc_align: layout.align(),
            flags: BlockFlags::empty(),
        });
        header
    }

    /// Address of the first element.
    #[inline]
    pub(crate) fn payload(&self) -> *mut u8 {
        (self as *const BlockHeader as *mut u8).wrapping_add(self.payload_offset)
    }

    /// Is an address contained in the payload?
    #[inline]
    pub(crate) fn contains(&self, addr: *const u8) -> bool {
        let base = self.payload() as usize;
        let addr = addr as usize;
        addr >= base && addr < base + self.objsize
    }

    /// Layout of the whole allocation, for release.
    #[inline]
    pub(crate) fn layout(&self) -> Layout {
        // The fields were captured from a Layout validated in layout_for.
        unsafe { Layout::from_size_align_unchecked(self.alloc_size, self.alloc_align) }
    }

    #[inline]
    pub(crate) fn is_active(&self) -> bool {
        self.flags.contains(BlockFlags::ACTIVE)
    }

    #[inline]
    pub(crate) fn is_marked(&self) -> bool {
        self.flags.contains(BlockFlags::MARKED)
    }

    /// Run the element destructor callback, then release the member nodes.
    ///
    /// Member handles are reclaimed here, wholesale, never individually:
    /// dropping a member `Handle` leaves its node in this list.
    ///
    /// # Safety
    /// The block must own `nelems` constructed elements, and no live handle
    /// outside the block may still refer to a node in the members list.
    pub(crate) unsafe fn destroy_in_place(&mut self) {
        if let Some(destroy) = self.destroy {
            destroy(self.payload(), self.nelems);
        }
        let mut node = self.members;
        while !node.is_null() {
            let next = (*node).next.load(Ordering::Relaxed);
            drop(Box::from_raw(node));
            node = next;
        }
        self.members = ptr::null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets_payload_past_header() {
        let (layout, offset) = BlockHeader::layout_for(4, 8, 8).unwrap();
        assert!(offset >= core::mem::size_of::<BlockHeader>());
        assert!(layout.size() >= offset + 32);
        assert_eq!(offset % 8, 0);
    }

    #[test]
    fn layout_honors_wide_alignment() {
        let (layout, offset) = BlockHeader::layout_for(2, 32, 32).unwrap();
        assert_eq!(offset % 32, 0);
        assert_eq!(layout.align() % 32, 0);
    }

    #[test]
    fn layout_rejects_overflowing_payload() {
        assert!(BlockHeader::layout_for(usize::MAX, 2, 1).is_err());
    }
}
