//! Stop-the-world mark-and-sweep collector over the global block population.
//!
//! Lock order: gc lock (re-entrant) outermost, then the active-blocks lock,
//! then the roots lock. The roots lock is released after the mark phase, the
//! active lock after the sweep phase; the reclaim phase runs element
//! destructors with only the gc lock held, so destructors are free to
//! allocate (the nested collection attempt observes the busy flag and
//! returns 0) and to create or drop root handles.

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::Ordering;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace};

use crate::block::{BlockFlags, BlockHeader};
use crate::handle::ROOTS;

/// Allocated-bytes threshold that arms the next conditional collection.
const DEFAULT_THRESHOLD: usize = 100 * 1024;

/// Mutable collector state, owned by the re-entrant gc lock.
struct GcState {
    /// Set while a collection is running; a nested attempt on the same
    /// thread (a destructor that allocates during reclaim) sees it and
    /// backs out.
    busy: Cell<bool>,
    /// Payload bytes committed since the last collection.
    allocated: Cell<usize>,
    threshold: Cell<usize>,
}

static GC: Lazy<ReentrantMutex<GcState>> = Lazy::new(|| {
    ReentrantMutex::new(GcState {
        busy: Cell::new(false),
        allocated: Cell::new(0),
        threshold: Cell::new(DEFAULT_THRESHOLD),
    })
});

/// Head of the global active-blocks list.
struct ActiveHead(*mut BlockHeader);

// The raw head pointer is only touched under the ACTIVE lock.
unsafe impl Send for ActiveHead {}

static ACTIVE: Mutex<ActiveHead> = Mutex::new(ActiveHead(ptr::null_mut()));

/// Charge committed payload bytes against the collection counter.
pub(crate) fn note_allocated(bytes: usize) {
    let state = GC.lock();
    state.allocated.set(state.allocated.get().saturating_add(bytes));
}

/// Move a list of committed blocks onto the global active list, making them
/// visible to the collector.
pub(crate) fn activate_blocks(mut head: *mut BlockHeader) {
    if head.is_null() {
        return;
    }
    let mut active = ACTIVE.lock();
    while !head.is_null() {
        unsafe {
            let block = head;
            head = (*block).next;
            (*block).flags.insert(BlockFlags::ACTIVE);
            (*block).next = active.0;
            active.0 = block;
        }
    }
}

/// Force an unconditional collection. Returns the number of payload bytes
/// freed (header overhead is not counted).
pub fn collect() -> usize {
    gc(true)
}

/// Read the collection threshold and, when `new` is nonzero, replace it.
/// Returns the previous threshold.
pub fn collect_threshold(new: usize) -> usize {
    let state = GC.lock();
    let old = state.threshold.get();
    if new != 0 {
        state.threshold.set(new);
    }
    old
}

/// Collect garbage if the counter crossed the threshold, or unconditionally.
/// Returns the number of payload bytes freed.
pub(crate) fn gc(unconditional: bool) -> usize {
    let state = GC.lock();

    if state.busy.get() || (!unconditional && state.allocated.get() < state.threshold.get()) {
        return 0;
    }
    state.busy.set(true);
    state.allocated.set(0);
    trace!(unconditional, "collection started");

    // Mark blocks reachable from the roots through member edges.
    let mut active = ACTIVE.lock();
    {
        let roots = ROOTS.lock();
        let mut pending: Vec<*mut BlockHeader> = Vec::new();
        unsafe {
            let mut node = roots.0;
            while !node.is_null() {
                mark_block((*node).block.load(Ordering::Acquire), &mut pending);
                node = (*node).next.load(Ordering::Relaxed);
            }
            while let Some(block) = pending.pop() {
                let mut member = (*block).members;
                while !member.is_null() {
                    mark_block((*member).block.load(Ordering::Acquire), &mut pending);
                    member = (*member).next.load(Ordering::Relaxed);
                }
            }
        }
    }

    // Sweep: retain marked blocks, set the rest aside as garbage.
    let mut retained: *mut BlockHeader = ptr::null_mut();
    let mut garbage: *mut BlockHeader = ptr::null_mut();
    unsafe {
        let mut block = active.0;
        while !block.is_null() {
            let next = (*block).next;
            if (*block).is_marked() {
                (*block).flags.remove(BlockFlags::MARKED);
                (*block).next = retained;
                retained = block;
            } else {
                (*block).next = garbage;
                garbage = block;
            }
            block = next;
        }
        active.0 = retained;
    }
    drop(active);

    // Reclaim the garbage blocks.
    let mut freed = 0;
    unsafe {
        while !garbage.is_null() {
            let block = garbage;
            garbage = (*block).next;
            freed += (*block).objsize;
            let layout = (*block).layout();
            (*block).destroy_in_place();
            std::alloc::dealloc(block as *mut u8, layout);
        }
    }

    debug!(freed_bytes = freed, "collection finished");
    state.busy.set(false);
    freed
}

/// Mark one block reachable, queueing it for member traversal. Blocks still
/// on a construction stack or new-blocks list are not active and stay
/// invisible: their construction is in flight and they must not be freed.
unsafe fn mark_block(block: *mut BlockHeader, pending: &mut Vec<*mut BlockHeader>) {
    if block.is_null() {
        return;
    }
    if (*block).is_active() && !(*block).is_marked() {
        (*block).flags.insert(BlockFlags::MARKED);
        pending.push(block);
    }
}
