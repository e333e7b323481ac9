//! Untyped tracked-pointer machinery.
//!
//! Every live handle owns a [`HandleNode`], a heap cell with a stable
//! address that the collector reads through one of two populations:
//!
//! - the global *roots* list, a doubly-linked list of handles not stored
//!   inside any block's payload, or
//! - some block's *members* list, the handles whose storage lies inside that
//!   block's payload.
//!
//! A node is born a root. It becomes a member through adoption when the
//! element holding it is committed into a payload (see `alloc`). A member
//! node carries `prev == self` as a sentinel, which lets handle destruction
//! decide its path without taking the roots lock: member nodes are reclaimed
//! wholesale with their block, root nodes unlink and free themselves.
//!
//! `target` and `block` are atomic so an attachment write racing a mark
//! phase reads as one value or the other, never a torn pointer.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use parking_lot::Mutex;

use crate::block::BlockHeader;
use crate::error::PtrError;

/// Head of the global roots list.
pub(crate) struct RootsHead(pub(crate) *mut HandleNode);

// The raw head pointer is only touched under the ROOTS lock.
unsafe impl Send for RootsHead {}

/// Root handles, one process-wide list.
pub(crate) static ROOTS: Mutex<RootsHead> = Mutex::new(RootsHead(ptr::null_mut()));

/// Collector-visible identity of one handle.
pub(crate) struct HandleNode {
    /// Raw pointer value; may address an element interior or null.
    pub(crate) target: AtomicPtr<u8>,
    /// Block this handle is attached to, or null when detached.
    pub(crate) block: AtomicPtr<BlockHeader>,
    /// Previous node in the roots list; `self` marks a member node.
    pub(crate) prev: AtomicPtr<HandleNode>,
    /// Next node in whichever list owns this node.
    pub(crate) next: AtomicPtr<HandleNode>,
}

/// Untyped handle: ownership of one registered [`HandleNode`].
pub(crate) struct RawHandle {
    node: NonNull<HandleNode>,
}

impl RawHandle {
    /// Allocate a node with the given pointer value and attachment and link
    /// it at the head of the roots list.
    pub(crate) fn new(target: *mut u8, block: *mut BlockHeader) -> RawHandle {
        let node = Box::into_raw(Box::new(HandleNode {
            target: AtomicPtr::new(target),
            block: AtomicPtr::new(block),
            prev: AtomicPtr::new(ptr::null_mut()),
            next: AtomicPtr::new(ptr::null_mut()),
        }));

        let mut roots = ROOTS.lock();
        unsafe {
            (*node).next.store(roots.0, Ordering::Relaxed);
            if !roots.0.is_null() {
                (*roots.0).prev.store(node, Ordering::Relaxed);
            }
        }
        roots.0 = node;

        RawHandle {
            node: unsafe { NonNull::new_unchecked(node) },
        }
    }

    #[inline]
    pub(crate) fn node_ptr(&self) -> *mut HandleNode {
        self.node.as_ptr()
    }

    #[inline]
    pub(crate) fn target(&self) -> *mut u8 {
        unsafe { (*self.node.as_ptr()).target.load(Ordering::Acquire) }
    }

    #[inline]
    pub(crate) fn set_target(&self, target: *mut u8) {
        unsafe { (*self.node.as_ptr()).target.store(target, Ordering::Release) }
    }

    #[inline]
    pub(crate) fn block(&self) -> *mut BlockHeader {
        unsafe { (*self.node.as_ptr()).block.load(Ordering::Acquire) }
    }

    #[inline]
    pub(crate) fn set_block(&self, block: *mut BlockHeader) {
        unsafe { (*self.node.as_ptr()).block.store(block, Ordering::Release) }
    }

    #[inline]
    pub(crate) fn is_attached(&self) -> bool {
        !self.block().is_null()
    }

    /// Check that an address may be dereferenced through this handle:
    /// it is not null and, if the handle is attached, it lies within the
    /// attached block's payload.
    pub(crate) fn check_addr(&self, addr: *const u8) -> Result<(), PtrError> {
        if addr.is_null() {
            return Err(PtrError::NullDeref);
        }
        let block = self.block();
        if !block.is_null() && !unsafe { (*block).contains(addr) } {
            return Err(PtrError::OutOfBounds);
        }
        Ok(())
    }
}

impl Clone for RawHandle {
    /// Copy-construction inherits the pointer value and the attachment but
    /// registers an independent node.
    fn clone(&self) -> RawHandle {
        RawHandle::new(self.target(), self.block())
    }
}

impl Drop for RawHandle {
    fn drop(&mut self) {
        let node = self.node.as_ptr();
        unsafe {
            if (*node).prev.load(Ordering::Acquire) == node {
                // Member: the node is reclaimed together with its block.
                // Clear the edge so a handle overwritten in place stops
                // contributing to reachability.
                (*node).block.store(ptr::null_mut(), Ordering::Release);
                (*node).target.store(ptr::null_mut(), Ordering::Release);
            } else {
                unlink_root(node);
                drop(Box::from_raw(node));
            }
        }
    }
}

/// Remove a node from the roots list.
///
/// # Safety
/// `node` must currently be linked in the roots list.
pub(crate) unsafe fn unlink_root(node: *mut HandleNode) {
    let mut roots = ROOTS.lock();
    let prev = (*node).prev.load(Ordering::Relaxed);
    let next = (*node).next.load(Ordering::Relaxed);
    if !next.is_null() {
        (*next).prev.store(prev, Ordering::Relaxed);
    }
    if !prev.is_null() {
        (*prev).next.store(next, Ordering::Relaxed);
    } else {
        roots.0 = next;
    }
}

/// Re-home a root node into `block`'s members list.
///
/// Called when the element holding the handle reaches its final address in
/// the payload. A node that is already a member is left alone.
///
/// # Safety
/// `block` must be under construction on the calling thread (not yet
/// visible to the collector), and `node` must be owned by a handle stored
/// inside its payload.
pub(crate) unsafe fn adopt_member(node: *mut HandleNode, block: *mut BlockHeader) {
    if (*node).prev.load(Ordering::Relaxed) == node {
        return;
    }
    unlink_root(node);
    (*node).next.store((*block).members, Ordering::Relaxed);
    (*node).prev.store(node, Ordering::Release);
    (*block).members = node;
}
