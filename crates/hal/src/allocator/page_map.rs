// External interfaces (§6): the bidirectional mapping between physical
// addresses, page-metadata entries, and directly addressable virtual
// pointers. The buddy allocator reads and mutates `Page` entries through
// this trait but never owns the backing storage itself — that lifetime is
// the host environment's responsibility.
//
// A single `PageMap` implementor is meant to be shared by every `Pool` that
// partitions the same address space (mirroring the single global
// `__hyp_vmemmap` of the hypervisor stub this crate's algorithm is drawn
// from): a pool's own `range_start`/`range_end` is what makes a page
// "external" to it, not the page map's own bounds.

use core::ptr::NonNull;

use super::page::Page;
use super::pool::PAGE_SIZE;

/// External metadata-table + address-mapping interface.
pub trait PageMap: Send + Sync {
    /// Look up the page entry for a physical address, or `None` if it
    /// falls outside this map's backing storage.
    fn phys_to_page(&self, phys: usize) -> Option<NonNull<Page>>;

    /// The physical address a page entry describes.
    fn page_to_phys(&self, page: NonNull<Page>) -> usize;

    /// A directly addressable pointer to the page's body.
    fn page_to_virt(&self, page: NonNull<Page>) -> *mut u8;

    /// Look up the page entry owning a directly addressable pointer, or
    /// `None` if it does not correspond to any tracked page.
    fn virt_to_page(&self, addr: *mut u8) -> Option<NonNull<Page>>;
}

/// Reference `PageMap` over a flat, frame-number-indexed array, assuming an
/// identity (or fixed linear offset) physical/virtual mapping — matching
/// the early-boot identity mapping the rest of this HAL assumes before the
/// MMU is configured.
pub struct LinearPageMap {
    base_pfn: u64,
    pages: *mut Page,
    len: usize,
}

// SAFETY: `pages` is required by `new`'s safety contract to be a valid,
// live, exclusively-indexed array of `len` entries for as long as the map
// is used; callers only ever reach individual entries through `&Page`/
// `&mut Page` derived under the owning pool's lock discipline.
unsafe impl Send for LinearPageMap {}
unsafe impl Sync for LinearPageMap {}

impl LinearPageMap {
    /// # Safety
    /// `pages` must point to `len` valid, live `Page` entries, indexed by
    /// `(phys / PAGE_SIZE) - base_pfn`, for the entire time this map is in
    /// use (§6: metadata table storage lifetime covers all live pools).
    pub const unsafe fn new(base_pfn: u64, pages: *mut Page, len: usize) -> Self {
        Self {
            base_pfn,
            pages,
            len,
        }
    }
}

impl PageMap for LinearPageMap {
    fn phys_to_page(&self, phys: usize) -> Option<NonNull<Page>> {
        if phys % PAGE_SIZE != 0 {
            return None;
        }
        let pfn = (phys / PAGE_SIZE) as u64;
        let idx = pfn.checked_sub(self.base_pfn)? as usize;
        if idx >= self.len {
            return None;
        }
        // SAFETY: idx is bounds-checked above against the caller-provided
        // `len` from `new`.
        NonNull::new(unsafe { self.pages.add(idx) })
    }

    fn page_to_phys(&self, page: NonNull<Page>) -> usize {
        // SAFETY: `page` must originate from this map (phys_to_page or a
        // traversal rooted in it), so it lies within `[pages, pages+len)`.
        let idx = unsafe { page.as_ptr().offset_from(self.pages) } as usize;
        (self.base_pfn as usize + idx) * PAGE_SIZE
    }

    fn page_to_virt(&self, page: NonNull<Page>) -> *mut u8 {
        // Identity mapping: virtual address equals physical address.
        self.page_to_phys(page) as *mut u8
    }

    fn virt_to_page(&self, addr: *mut u8) -> Option<NonNull<Page>> {
        self.phys_to_page(addr as usize)
    }
}
