#![cfg_attr(not(feature = "std"), no_std)]

// TEAM_211: Re-export spin crate types as our lock API
// Note: spin::Mutex is re-exported as Mutex for API compatibility
pub use spin::{Lazy, Once};
pub use spin::{Mutex, MutexGuard};

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    /// Tests: [S1] exclusive access, [S3] release on drop, [S4] read, [S5] write, [S6] cycles
    #[test]
    fn test_spinlock_basic() {
        let lock = Mutex::new(42);
        {
            let mut guard = lock.lock(); // [S1] acquire
            assert_eq!(*guard, 42); // [S4] read access
            *guard = 43; // [S5] write access
        } // [S3] release on drop
        assert_eq!(*lock.lock(), 43); // [S6] multiple cycles
    }
}
