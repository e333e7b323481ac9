//! Allocation protocol: construction stack, new-blocks list, commit and
//! rollback.
//!
//! Each mutator thread carries two block lists of its own:
//!
//! - the *construction stack*: blocks whose elements are currently being
//!   built on this thread's call stack, and
//! - the *new-blocks list*: blocks fully built but not yet visible to the
//!   collector.
//!
//! `alloc_begin` pushes the new block on the construction stack;
//! `alloc_end` pops it and either rolls it back (an element initializer
//! failed) or moves it to the new-blocks list. When the construction stack
//! empties, the whole new-blocks list is flushed to the global active list
//! in one critical section, so the collector observes the outermost
//! allocation and everything allocated transitively during it at once.

use core::cell::Cell;
use core::ptr;

use crate::block::{BlockHeader, DestroyFn};
use crate::collector;
use crate::error::PtrError;
use crate::handle::{adopt_member, RawHandle};
use crate::ptr::Handle;
use crate::trace::{Trace, Visitor};

thread_local! {
    /// Blocks whose elements are being built on this thread, innermost first.
    static CONSTR_STACK: Cell<*mut BlockHeader> = const { Cell::new(ptr::null_mut()) };

    /// Blocks built on this thread but not yet committed to the active list.
    static NEW_BLOCKS: Cell<*mut BlockHeader> = const { Cell::new(ptr::null_mut()) };
}

/// The innermost block under construction on this thread, if any.
pub(crate) fn constructing_block() -> *mut BlockHeader {
    CONSTR_STACK.with(|stack| stack.get())
}

fn push(list: &Cell<*mut BlockHeader>, block: *mut BlockHeader) {
    unsafe { (*block).next = list.get() };
    list.set(block);
}

fn pop(list: &Cell<*mut BlockHeader>) -> *mut BlockHeader {
    let block = list.get();
    debug_assert!(!block.is_null());
    list.set(unsafe { (*block).next });
    block
}

impl RawHandle {
    /// Allocate a block of `nelems` elements and push it on this thread's
    /// construction stack. On success the handle is attached to the block
    /// and targets the payload base, which is returned for element
    /// construction. On failure the handle is left detached and nothing is
    /// pushed.
    pub(crate) fn alloc_begin(
        &self,
        nelems: usize,
        elem_size: usize,
        elem_align: usize,
        destroy: Option<DestroyFn>,
        zero: bool,
    ) -> Result<*mut u8, PtrError> {
        // Give the collector a threshold-bounded chance to run first.
        collector::gc(false);

        let (layout, payload_offset) = BlockHeader::layout_for(nelems, elem_size, elem_align)?;
        let objsize = nelems * elem_size;

        let raw = unsafe { std::alloc::alloc(layout) };
        if raw.is_null() {
            self.set_block(ptr::null_mut());
            return Err(PtrError::AllocFailed(layout.size()));
        }

        let block =
            unsafe { BlockHeader::init(raw, nelems, objsize, payload_offset, layout, destroy) };
        let payload = unsafe { (*block).payload() };
        if zero {
            unsafe { ptr::write_bytes(payload, 0, objsize) };
        }

        CONSTR_STACK.with(|stack| push(stack, block));
        self.set_block(block);
        self.set_target(payload);
        Ok(payload)
    }

    /// Finish the allocation opened by [`alloc_begin`](Self::alloc_begin),
    /// with `constructed` elements actually built.
    ///
    /// `constructed < nelems` means an element initializer failed: the
    /// built elements are destroyed in place, the block is released, and the
    /// handle reverts to null and unattached. Otherwise the block's payload
    /// size is charged against the collection counter and the block joins
    /// this thread's new-blocks list.
    ///
    /// Either way, an empty construction stack afterwards commits the whole
    /// new-blocks list to the global active list.
    pub(crate) fn alloc_end(&self, constructed: usize) {
        let block = CONSTR_STACK.with(pop);
        debug_assert_eq!(block, self.block());

        unsafe {
            if constructed < (*block).nelems {
                (*block).nelems = constructed;
                let layout = (*block).layout();
                (*block).destroy_in_place();
                std::alloc::dealloc(block as *mut u8, layout);
                self.set_block(ptr::null_mut());
                self.set_target(ptr::null_mut());
            } else {
                collector::note_allocated((*block).objsize);
                NEW_BLOCKS.with(|list| push(list, block));
            }
        }

        if constructing_block().is_null() {
            let head = NEW_BLOCKS.with(|list| list.replace(ptr::null_mut()));
            collector::activate_blocks(head);
        }
    }
}

/// Re-homes the handles of a freshly committed element into the block's
/// members list.
struct Adopter {
    block: *mut BlockHeader,
}

impl Visitor for Adopter {
    fn visit<T>(&mut self, handle: &Handle<T>) {
        // The registration test: only a handle whose own storage lies in the
        // payload is a member. Handles the element keeps behind indirection
        // (a Vec, a Box) stay roots and unlink when the element drops.
        let addr = handle as *const Handle<T> as *const u8;
        unsafe {
            if (*self.block).contains(addr) {
                adopt_member(handle.raw().node_ptr(), self.block);
            }
        }
    }
}

/// Adopt the handles of the element just written at its final payload
/// address inside `block`.
pub(crate) fn adopt_element<T: Trace>(block: *mut BlockHeader, elem: &T) {
    elem.trace(&mut Adopter { block });
}
