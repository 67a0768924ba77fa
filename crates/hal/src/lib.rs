#![cfg_attr(not(feature = "std"), no_std)]

// TEAM_260: HAL Crate - physical memory allocation.
// Houses the buddy page allocator and the external interfaces (PageMap, Page)
// it depends on but does not own.

pub mod allocator;

pub use allocator::{
    LinearPageMap, Page, PageMap, Pool, PoolError, MAX_ORDER, NO_ORDER, PAGE_SIZE,
};
