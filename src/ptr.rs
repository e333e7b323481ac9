//! Typed handle over the untyped tracked pointer.
//!
//! `Handle<T>` is the mutator's only legal way to retain managed memory. It
//! should be treated like the raw pointer it wraps: arithmetic and raw
//! assignment do not validate anything, and checked access only verifies
//! that the target is non-null and inside the attached block's payload. A
//! handle constructed from an arbitrary raw pointer dereferences whatever
//! that pointer addresses.
//!
//! A handle stored inside managed memory must be overwritten in place with
//! [`set_from`](Handle::set_from) / [`set_raw`](Handle::set_raw) and must
//! not be moved out of its element; its registration is reclaimed together
//! with the block that holds it.

use core::convert::Infallible;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use crate::alloc::{adopt_element, constructing_block};
use crate::block::{BlockHeader, DestroyFn};
use crate::error::{InitError, PtrError};
use crate::handle::RawHandle;
use crate::trace::Trace;

/// Payload initialization policy for constructor-free allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitSpec {
    pub(crate) zero: bool,
}

/// Leave the payload bytes uninitialized; the caller must write each
/// element before reading it.
pub const INIT_UNDEF: InitSpec = InitSpec { zero: false };

/// Zero the payload bytes before the allocation completes.
pub const INIT_ZERO: InitSpec = InitSpec { zero: true };

/// A tracked pointer into a managed object array.
///
/// Only an *attached* handle keeps its block alive; arithmetic and copies
/// share the source's attachment, and [`detach`](Handle::detach) withdraws
/// this handle's contribution to reachability.
pub struct Handle<T> {
    raw: RawHandle,
    _marker: PhantomData<*mut T>,
}

impl<T> Handle<T> {
    /// A null, unattached handle.
    pub fn new() -> Handle<T> {
        Handle {
            raw: RawHandle::new(ptr::null_mut(), ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// A handle over an arbitrary pointer value, unattached. The address is
    /// opaque to the handle; nothing is validated here.
    pub fn from_raw(target: *mut T) -> Handle<T> {
        Handle {
            raw: RawHandle::new(target as *mut u8, ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// A handle targeting `target` with the same attachment as `src`. Used
    /// for pointers to elements or their fields that must keep the source's
    /// block alive.
    pub fn interior<U>(src: &Handle<U>, target: *mut T) -> Handle<T> {
        Handle {
            raw: RawHandle::new(target as *mut u8, src.raw.block()),
            _marker: PhantomData,
        }
    }

    /// Reinterpret the target as `U`, keeping the attachment. The typed
    /// equivalent of a pointer cast; registers an independent handle.
    pub fn cast<U>(&self) -> Handle<U> {
        Handle {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> &RawHandle {
        &self.raw
    }

    pub(crate) fn from_parts(target: *mut T, block: *mut BlockHeader) -> Handle<T> {
        Handle {
            raw: RawHandle::new(target as *mut u8, block),
            _marker: PhantomData,
        }
    }

    /// The raw pointer value.
    #[inline]
    pub fn target(&self) -> *mut T {
        self.raw.target() as *mut T
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.raw.target().is_null()
    }

    /// Adopt `other`'s attachment. Returns true when a block was adopted.
    pub fn attach<U>(&mut self, other: &Handle<U>) -> bool {
        let block = other.raw.block();
        self.raw.set_block(block);
        !block.is_null()
    }

    /// Attach to the innermost object array under construction on this
    /// thread, if any. Lets an element initializer hand out handles to the
    /// enclosing, not-yet-committed block.
    pub fn attach_top(&mut self) -> bool {
        let block = constructing_block();
        self.raw.set_block(block);
        !block.is_null()
    }

    /// Drop the attachment; this handle no longer keeps any block alive.
    pub fn detach(&mut self) {
        self.raw.set_block(ptr::null_mut());
    }

    #[inline]
    pub fn is_attached(&self) -> bool {
        self.raw.is_attached()
    }

    /// Copy-assign: overwrite target and attachment in place. The handle
    /// keeps its registration, which is what a handle living inside managed
    /// memory needs — its own storage has not moved.
    pub fn set_from(&mut self, other: &Handle<T>) {
        self.raw.set_target(other.raw.target());
        self.raw.set_block(other.raw.block());
    }

    /// Overwrite the target only; the attachment is untouched.
    pub fn set_raw(&mut self, target: *mut T) {
        self.raw.set_target(target as *mut u8);
    }

    /// Checked dereference.
    pub fn get(&self) -> Result<&T, PtrError> {
        let target = self.target();
        self.raw.check_addr(target as *const u8)?;
        Ok(unsafe { &*target })
    }

    /// Checked mutable dereference.
    pub fn get_mut(&mut self) -> Result<&mut T, PtrError> {
        let target = self.target();
        self.raw.check_addr(target as *const u8)?;
        Ok(unsafe { &mut *target })
    }

    /// Checked element access at `index` elements past the target.
    pub fn at(&self, index: usize) -> Result<&T, PtrError> {
        let addr = self.element_addr(index)?;
        Ok(unsafe { &*(addr as *const T) })
    }

    /// Checked mutable element access.
    pub fn at_mut(&mut self, index: usize) -> Result<&mut T, PtrError> {
        let addr = self.element_addr(index)?;
        Ok(unsafe { &mut *(addr as *mut T) })
    }

    fn element_addr(&self, index: usize) -> Result<usize, PtrError> {
        let target = self.target();
        if target.is_null() {
            return Err(PtrError::NullDeref);
        }
        let offset = index
            .checked_mul(mem::size_of::<T>())
            .ok_or(PtrError::OutOfBounds)?;
        let addr = (target as usize)
            .checked_add(offset)
            .ok_or(PtrError::OutOfBounds)?;
        self.raw.check_addr(addr as *const u8)?;
        Ok(addr)
    }

    /// A new handle `count` elements away, sharing this handle's attachment.
    pub fn add(&self, count: isize) -> Handle<T> {
        Handle::interior(self, self.target().wrapping_offset(count))
    }

    /// Element distance between two targets.
    pub fn offset_from(&self, other: &Handle<T>) -> isize {
        let size = mem::size_of::<T>() as isize;
        if size == 0 {
            return 0;
        }
        ((self.target() as isize) - (other.target() as isize)) / size
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Handle<T> {
        Handle::new()
    }
}

impl<T> Clone for Handle<T> {
    /// Copy-construction: inherits target and attachment, registers
    /// independently.
    fn clone(&self) -> Handle<T> {
        Handle {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:p})", self.target())
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Handle<T>) -> bool {
        self.target() == other.target()
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialOrd for Handle<T> {
    fn partial_cmp(&self, other: &Handle<T>) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Handle<T> {
    fn cmp(&self, other: &Handle<T>) -> core::cmp::Ordering {
        (self.target() as usize).cmp(&(other.target() as usize))
    }
}

impl<'a, T> core::ops::Add<isize> for &'a Handle<T> {
    type Output = Handle<T>;

    fn add(self, count: isize) -> Handle<T> {
        Handle::add(self, count)
    }
}

impl<'a, T> core::ops::Sub<isize> for &'a Handle<T> {
    type Output = Handle<T>;

    fn sub(self, count: isize) -> Handle<T> {
        Handle::add(self, -count)
    }
}

impl<T> core::ops::AddAssign<isize> for Handle<T> {
    fn add_assign(&mut self, count: isize) {
        let target = self.target().wrapping_offset(count);
        self.raw.set_target(target as *mut u8);
    }
}

impl<T> core::ops::SubAssign<isize> for Handle<T> {
    fn sub_assign(&mut self, count: isize) {
        *self += -count;
    }
}

/// Context handed to element initializers: the element's index and a way to
/// obtain a handle to the element under construction.
pub struct Slot<T> {
    index: usize,
    elem: *mut T,
    block: *mut BlockHeader,
}

impl<T> Slot<T> {
    /// Index of the element being initialized.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// A handle targeting this element, attached to the block under
    /// construction. This is how an element wires a reference back to
    /// itself or its enclosing array into a cyclic structure.
    pub fn handle(&self) -> Handle<T> {
        Handle::from_parts(self.elem, self.block)
    }
}

impl<T: Trace> Handle<T> {
    /// Allocate a block of one element holding `value`.
    pub fn alloc(&mut self, value: T) -> Result<(), PtrError> {
        self.alloc_with(move |_| value)
    }

    /// Allocate a block of one element built by `init`.
    pub fn alloc_with(&mut self, init: impl FnOnce(&Slot<T>) -> T) -> Result<(), PtrError> {
        strip_infallible(self.try_alloc_with::<Infallible>(|slot| Ok(init(slot))))
    }

    /// Allocate a block of one element built by a fallible initializer.
    pub fn try_alloc_with<E>(
        &mut self,
        init: impl FnOnce(&Slot<T>) -> Result<T, E>,
    ) -> Result<(), InitError<E>>
    where
        E: std::error::Error + 'static,
    {
        let mut init = Some(init);
        self.try_alloc_array_with(1, move |slot| match init.take() {
            Some(init) => init(slot),
            None => unreachable!("single-element initializer runs once"),
        })
    }

    /// Allocate a block of `nelems` elements, each built by `init`.
    pub fn alloc_array_with(
        &mut self,
        nelems: usize,
        mut init: impl FnMut(&Slot<T>) -> T,
    ) -> Result<(), PtrError> {
        strip_infallible(self.try_alloc_array_with::<Infallible>(nelems, |slot| Ok(init(slot))))
    }

    /// Allocate a block of `nelems` default-constructed elements.
    pub fn alloc_array_default(&mut self, nelems: usize) -> Result<(), PtrError>
    where
        T: Default,
    {
        self.alloc_array_with(nelems, |_| T::default())
    }

    /// Allocate a block of `nelems` elements built by a fallible
    /// initializer.
    ///
    /// If the initializer for element `k` fails (or panics), the `k`
    /// elements already built are destroyed, the block is released, and
    /// this handle reverts to null and unattached before the failure
    /// continues to the caller. Blocks committed by initializers of earlier
    /// elements are unaffected.
    pub fn try_alloc_array_with<E>(
        &mut self,
        nelems: usize,
        mut init: impl FnMut(&Slot<T>) -> Result<T, E>,
    ) -> Result<(), InitError<E>>
    where
        E: std::error::Error + 'static,
    {
        let base = self
            .raw
            .alloc_begin(
                nelems,
                mem::size_of::<T>(),
                mem::align_of::<T>(),
                destroy_fn::<T>(),
                false,
            )
            .map_err(InitError::Ptr)? as *mut T;
        let block = self.raw.block();

        let mut constructed = 0;
        while constructed < nelems {
            let slot = Slot {
                index: constructed,
                elem: unsafe { base.add(constructed) },
                block,
            };
            match catch_unwind(AssertUnwindSafe(|| init(&slot))) {
                Ok(Ok(value)) => unsafe {
                    let elem = base.add(constructed);
                    elem.write(value);
                    constructed += 1;
                    adopt_element(block, &*elem);
                },
                Ok(Err(source)) => {
                    let index = constructed;
                    self.raw.alloc_end(constructed);
                    return Err(InitError::Element { index, source });
                }
                Err(panic) => {
                    self.raw.alloc_end(constructed);
                    resume_unwind(panic);
                }
            }
        }

        self.raw.alloc_end(constructed);
        Ok(())
    }
}

impl<T: Copy> Handle<T> {
    /// Allocate a block of one element without running an initializer.
    pub fn alloc_init(&mut self, init: InitSpec) -> Result<(), PtrError> {
        self.alloc_array_init(1, init)
    }

    /// Allocate a block of `nelems` elements without running initializers.
    /// With [`INIT_ZERO`] the payload is zeroed; with [`INIT_UNDEF`] it is
    /// uninitialized and every element must be written before it is read.
    pub fn alloc_array_init(&mut self, nelems: usize, init: InitSpec) -> Result<(), PtrError> {
        self.raw.alloc_begin(
            nelems,
            mem::size_of::<T>(),
            mem::align_of::<T>(),
            None,
            init.zero,
        )?;
        self.raw.alloc_end(nelems);
        Ok(())
    }
}

fn strip_infallible(result: Result<(), InitError<Infallible>>) -> Result<(), PtrError> {
    match result {
        Ok(()) => Ok(()),
        Err(InitError::Ptr(err)) => Err(err),
        Err(InitError::Element { source, .. }) => match source {},
    }
}

/// The element destructor recorded in the block header. `None` when the
/// element type has no drop glue.
fn destroy_fn<T>() -> Option<DestroyFn> {
    if mem::needs_drop::<T>() {
        Some(destroy_elements::<T>)
    } else {
        None
    }
}

/// Destroy `nelems` elements in place. A panicking destructor must not
/// leak the remaining elements, so each drop is contained.
unsafe fn destroy_elements<T>(payload: *mut u8, nelems: usize) {
    let mut elem = payload as *mut T;
    for _ in 0..nelems {
        let _ = catch_unwind(AssertUnwindSafe(|| ptr::drop_in_place(elem)));
        elem = elem.add(1);
    }
}
