// TEAM_047: Page descriptor for physical frame tracking, part of the buddy
// allocator (Phase 5). One descriptor exists per base-page frame in the
// external page-metadata table (see `page_map`).

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, Ordering};

use super::free_list::ListLink;

/// Sentinel `order` value meaning "this entry is not the head of a free or
/// allocated group" — either a non-head tail of a larger group, or a free
/// frame currently covered by a higher-order buddy head.
///
/// Chosen strictly greater than any representable `MAX_ORDER` so that a
/// single `order > max_order` check (used by `Pool::put`'s precondition,
/// see `pool.rs`) rejects both over-large orders and non-head tails in one
/// comparison.
pub const NO_ORDER: u8 = u8::MAX;

/// A descriptor for a physical page frame.
///
/// Each physical frame has one `Page` descriptor in the external metadata
/// table. This allows tracking ownership and buddy state without touching
/// the physical memory itself (safe for device memory or uncached regions).
///
/// `order` and the intrusive list links are mutated only while the owning
/// pool's lock is held; `refcount` is a free-standing atomic so `get`/`put`
/// can touch it without taking that lock (see `pool.rs` §5 concurrency
/// notes).
#[repr(C)]
pub struct Page {
    order: u8,
    refcount: AtomicU32,
    next: Option<NonNull<Page>>,
    prev: Option<NonNull<Page>>,
}

// SAFETY: Page is a bare descriptor; all access to its non-atomic fields
// (order, next, prev) is serialized externally by the owning pool's lock.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Create a new, zeroed page descriptor (not yet a head of anything).
    pub const fn new() -> Self {
        Self {
            order: NO_ORDER,
            refcount: AtomicU32::new(0),
            next: None,
            prev: None,
        }
    }

    /// Reset to a fresh, un-refcounted, non-head state.
    pub(super) fn reset(&mut self) {
        self.order = NO_ORDER;
        self.refcount.store(0, Ordering::Relaxed);
        self.next = None;
        self.prev = None;
    }

    pub(super) fn order(&self) -> u8 {
        self.order
    }

    /// # Safety
    /// Caller must hold the owning pool's lock.
    pub(super) unsafe fn set_order(&mut self, order: u8) {
        self.order = order;
    }

    /// Read the refcount with acquire semantics.
    pub(super) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// Set refcount to 1 (initial-owner convention).
    pub(super) fn set_refcounted(&self) {
        self.refcount.store(1, Ordering::Release);
    }

    /// Atomic increment.
    pub(super) fn ref_inc(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Atomic decrement; returns `true` iff the result is zero.
    pub(super) fn ref_dec_and_test(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

impl ListLink for Page {
    #[inline]
    fn next(&self) -> Option<NonNull<Self>> {
        self.next
    }

    #[inline]
    fn prev(&self) -> Option<NonNull<Self>> {
        self.prev
    }

    #[inline]
    fn set_next(&mut self, next: Option<NonNull<Self>>) {
        self.next = next;
    }

    #[inline]
    fn set_prev(&mut self, prev: Option<NonNull<Self>>) {
        self.prev = prev;
    }
}
