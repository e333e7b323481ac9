//! Collector scenarios: reachability through handle populations, cycle
//! reclamation, rollback of failed allocations, threshold-driven
//! collection, and concurrent mutators.

use core::mem;
use core::ptr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::{
    collect, collect_threshold, Handle, InitError, PtrError, Trace, Visitor, INIT_UNDEF, INIT_ZERO,
};

static SERIAL: Mutex<()> = Mutex::new(());

/// All tests share one process-global collector. Serialize them and drain
/// garbage left behind by earlier tests so freed-byte assertions are exact.
fn isolated() -> MutexGuard<'static, ()> {
    let guard = SERIAL.lock();
    collect();
    guard
}

// ============================================================================
// Basic array access
// ============================================================================

#[test]
fn zero_filled_array_roundtrip() {
    let _guard = isolated();

    let mut p = Handle::<i32>::new();
    p.alloc_array_init(4, INIT_ZERO).unwrap();
    for i in 0..4 {
        assert_eq!(*p.at(i).unwrap(), 0);
    }
    for i in 0..4 {
        *p.at_mut(i).unwrap() = i as i32 + 1;
    }

    // Walk the array pointer-style through an independent handle.
    let mut seen = Vec::new();
    {
        let mut iter = p.clone();
        let end = &p + 4;
        while iter < end {
            seen.push(*iter.get().unwrap());
            iter += 1;
        }
    }
    assert_eq!(seen, [1, 2, 3, 4]);

    let mut keeper = p.clone();
    p.detach();
    assert_eq!(collect(), 0, "keeper still references the array");
    keeper.detach();
    assert_eq!(collect(), 4 * mem::size_of::<i32>());
}

#[test]
fn null_dereference_is_reported() {
    let _guard = isolated();

    let p = Handle::<u64>::new();
    assert_eq!(p.get().unwrap_err(), PtrError::NullDeref);
    assert_eq!(p.at(0).unwrap_err(), PtrError::NullDeref);
}

#[test]
fn out_of_bounds_dereference_is_reported() {
    let _guard = isolated();

    let mut p = Handle::<i32>::new();
    p.alloc_array_init(4, INIT_ZERO).unwrap();

    assert_eq!((&p + 4).get().unwrap_err(), PtrError::OutOfBounds);
    assert_eq!(p.at(4).unwrap_err(), PtrError::OutOfBounds);
    assert_eq!(*(&p + 3).get().unwrap(), 0);
    assert_eq!(*p.at(3).unwrap(), 0);

    p.detach();
    assert_eq!(collect(), 4 * mem::size_of::<i32>());
}

#[test]
fn single_allocation_from_value() {
    let _guard = isolated();

    let mut p = Handle::<String>::new();
    p.alloc(String::from("managed")).unwrap();
    assert_eq!(p.get().unwrap(), "managed");

    p.detach();
    assert_eq!(collect(), mem::size_of::<String>());
}

// ============================================================================
// Attachment propagation
// ============================================================================

#[test]
fn copies_and_arithmetic_preserve_attachment() {
    let _guard = isolated();

    let mut p = Handle::<u32>::new();
    p.alloc_array_default(4).unwrap();

    let q = p.clone();
    assert!(q.is_attached());
    assert_eq!(q.offset_from(&p), 0);

    let r = &p + 2;
    assert!(r.is_attached());
    assert_eq!(r.offset_from(&p), 2);
    assert_eq!(*r.get().unwrap(), 0);

    let back = &r - 2;
    assert_eq!(back.offset_from(&p), 0);

    let mut s = Handle::<u32>::new();
    s.set_from(&r);
    assert!(s.is_attached());
    assert_eq!(s.offset_from(&p), 2);

    // Raw-pointer assignment replaces the target but not the attachment.
    let mut t = p.clone();
    t.set_raw(ptr::null_mut());
    assert!(t.is_attached());
    assert_eq!(t.get().unwrap_err(), PtrError::NullDeref);

    let bytes = p.cast::<u8>();
    assert!(bytes.is_attached());

    drop(q);
    drop(r);
    drop(back);
    drop(s);
    drop(t);
    drop(bytes);
    p.detach();
    assert_eq!(
        collect(),
        4 * mem::size_of::<u32>(),
        "a detached handle no longer keeps its block"
    );
}

#[test]
fn attach_top_adopts_the_constructing_block() {
    let _guard = isolated();

    let mut p = Handle::<u32>::new();
    p.alloc_array_with(2, |slot| {
        let mut extra = Handle::<u32>::new();
        assert!(extra.attach_top(), "an array is under construction");
        assert!(extra.is_attached());
        slot.index() as u32
    })
    .unwrap();

    let mut outside = Handle::<u32>::new();
    assert!(!outside.attach_top(), "no construction in progress");

    p.detach();
    assert_eq!(collect(), 2 * mem::size_of::<u32>());
}

// ============================================================================
// Cyclic graphs
// ============================================================================

struct Outer {
    child: Handle<Mid>,
}

struct Mid {
    child: Handle<Inner>,
}

struct Inner {
    back: Handle<Outer>,
}

static INNER_DROPS: AtomicUsize = AtomicUsize::new(0);

impl Trace for Outer {
    fn trace(&self, visitor: &mut impl Visitor) {
        visitor.visit(&self.child);
    }
}

impl Trace for Mid {
    fn trace(&self, visitor: &mut impl Visitor) {
        visitor.visit(&self.child);
    }
}

impl Trace for Inner {
    fn trace(&self, visitor: &mut impl Visitor) {
        visitor.visit(&self.back);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        INNER_DROPS.fetch_add(1, Ordering::Relaxed);
    }
}

impl Outer {
    /// Builds one link of the cycle: the outer element allocates a `Mid`,
    /// which allocates an `Inner` holding a handle back to the outer
    /// element's array.
    fn build(this: Handle<Outer>) -> Outer {
        let mut child = Handle::new();
        child.alloc_with(move |_| Mid::build(this)).unwrap();
        Outer { child }
    }
}

impl Mid {
    fn build(back: Handle<Outer>) -> Mid {
        let mut child = Handle::new();
        child.alloc_with(move |_| Inner { back }).unwrap();
        Mid { child }
    }
}

fn cycle_graph_bytes() -> usize {
    3 * (mem::size_of::<Outer>() + mem::size_of::<Mid>() + mem::size_of::<Inner>())
}

#[test]
fn cyclic_triples_reclaimed_when_last_reference_detaches() {
    let _guard = isolated();
    INNER_DROPS.store(0, Ordering::Relaxed);

    let mut pa = Handle::<Outer>::new();
    pa.alloc_array_with(3, |slot| Outer::build(slot.handle()))
        .unwrap();

    // Independent handles to the back-pointer stored inside each innermost
    // object, built two different ways.
    let mut extras: Vec<Handle<Handle<Outer>>> = Vec::new();
    for i in 0..3 {
        let outer = pa.at(i).unwrap();
        let mid = outer.child.get().unwrap();
        let inner_handle = &mid.child;
        let inner = inner_handle.get().unwrap();
        let back_ptr = &inner.back as *const Handle<Outer> as *mut Handle<Outer>;
        let extra = if i % 2 == 0 {
            Handle::interior(inner_handle, back_ptr)
        } else {
            let mut h = Handle::from_raw(back_ptr);
            assert!(h.attach(inner_handle));
            h
        };
        extras.push(extra);
    }

    assert_eq!(collect(), 0, "array and extras all reference the graph");
    pa.detach();
    assert_eq!(collect(), 0);
    extras[0].detach();
    assert_eq!(collect(), 0);
    extras[1].detach();
    assert_eq!(collect(), 0);

    extras[2].detach();
    assert_eq!(collect(), cycle_graph_bytes());
    assert_eq!(INNER_DROPS.load(Ordering::Relaxed), 3);
    assert_eq!(collect(), 0, "a quiescent graph frees nothing twice");
}

// ============================================================================
// Rollback of failed allocations
// ============================================================================

static FUSSY_DROPS: AtomicUsize = AtomicUsize::new(0);

struct Fussy {
    _seq: u64,
}

impl Drop for Fussy {
    fn drop(&mut self) {
        FUSSY_DROPS.fetch_add(1, Ordering::Relaxed);
    }
}

impl Trace for Fussy {
    fn trace(&self, _visitor: &mut impl Visitor) {}
}

#[derive(Debug, Error)]
#[error("refused to build element")]
struct BuildRefused;

#[test]
fn failed_initializer_rolls_back_partial_array() {
    let _guard = isolated();
    FUSSY_DROPS.store(0, Ordering::Relaxed);

    let mut p = Handle::<Fussy>::new();
    let err = p
        .try_alloc_array_with(5, |slot| {
            if slot.index() == 2 {
                Err(BuildRefused)
            } else {
                Ok(Fussy {
                    _seq: slot.index() as u64,
                })
            }
        })
        .unwrap_err();

    match err {
        InitError::Element { index, .. } => assert_eq!(index, 2),
        other => panic!("unexpected failure: {other}"),
    }
    assert_eq!(
        FUSSY_DROPS.load(Ordering::Relaxed),
        2,
        "only the elements actually built are destroyed"
    );
    assert!(p.is_null());
    assert!(!p.is_attached());
    assert_eq!(collect(), 0, "nothing from the failed request survives");
}

#[test]
fn panicking_initializer_rolls_back_partial_array() {
    let _guard = isolated();
    FUSSY_DROPS.store(0, Ordering::Relaxed);

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let mut p = Handle::<Fussy>::new();
        p.alloc_array_with(4, |slot| {
            if slot.index() == 1 {
                panic!("element build exploded");
            }
            Fussy { _seq: 0 }
        })
    }));

    assert!(result.is_err());
    assert_eq!(FUSSY_DROPS.load(Ordering::Relaxed), 1);
    assert_eq!(collect(), 0);
}

// ============================================================================
// Construction visibility and threshold policy
// ============================================================================

struct Holder {
    inner: Handle<u64>,
}

impl Trace for Holder {
    fn trace(&self, visitor: &mut impl Visitor) {
        visitor.visit(&self.inner);
    }
}

#[test]
fn blocks_under_construction_are_invisible_to_collection() {
    let _guard = isolated();

    let mut p = Handle::<Holder>::new();
    p.alloc_with(|_| {
        let mut inner = Handle::<u64>::new();
        inner.alloc_init(INIT_ZERO).unwrap();
        assert_eq!(collect(), 0, "in-flight blocks are not candidates");
        Holder { inner }
    })
    .unwrap();

    assert_eq!(collect(), 0);
    p.detach();
    assert_eq!(collect(), mem::size_of::<Holder>() + mem::size_of::<u64>());
}

#[test]
fn threshold_triggers_collection_from_allocation() {
    let _guard = isolated();

    let old = collect_threshold(1024);
    assert_eq!(collect_threshold(0), 1024, "zero reads without updating");

    let mut junk1 = Handle::<u8>::new();
    junk1.alloc_array_init(600, INIT_UNDEF).unwrap();
    junk1.detach();
    let mut junk2 = Handle::<u8>::new();
    junk2.alloc_array_init(600, INIT_UNDEF).unwrap();
    junk2.detach();

    // 1200 unreachable bytes are pending; this allocation's pre-collection
    // step reclaims both junk blocks before the new block is created.
    let mut probe = Handle::<u8>::new();
    probe.alloc_array_init(16, INIT_UNDEF).unwrap();
    probe.detach();
    assert_eq!(
        collect(),
        16,
        "the junk was already reclaimed when the probe allocated"
    );

    collect_threshold(old);
}

// ============================================================================
// Concurrent mutators
// ============================================================================

#[test]
fn concurrent_mutators_leave_no_survivors() {
    let _guard = isolated();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            thread::spawn(|| {
                let mut pa = Handle::<Outer>::new();
                pa.alloc_array_with(3, |slot| Outer::build(slot.handle()))
                    .unwrap();
                {
                    let mid = pa.at(1).unwrap().child.get().unwrap();
                    assert!(mid.child.is_attached());
                }
                pa.detach();
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(collect(), 4 * cycle_graph_bytes());
    assert_eq!(collect(), 0);
}
