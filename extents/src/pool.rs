use parking_lot::Mutex;

use crate::extent::{Extent, ExtentRef};

/// Per-arena free list of extent metadata records.
///
/// The records are recycled independently of the memory regions they
/// describe; a record on the free list describes nothing. The pool has its
/// own mutex so that grabbing a record never has to wait behind set
/// operations.
pub struct ExtentPool {
    free: Mutex< Vec< ExtentRef > >
}

impl ExtentPool {
    pub fn new() -> Self {
        ExtentPool {
            free: Mutex::new( Vec::new() )
        }
    }

    /// Pops a record off the free list, or allocates a fresh one if the
    /// list is empty, and initializes it with `extent`.
    pub(crate) fn acquire( &self, extent: Extent ) -> ExtentRef {
        if let Some( slot ) = self.free.lock().pop() {
            *slot.lock() = extent;
            return slot;
        }

        ExtentRef::new( extent )
    }

    /// Returns a record to the free list.
    ///
    /// The caller must have already unlinked the record from the index and
    /// from every set; a handle still held elsewhere at this point means a
    /// double free or a leaked reference.
    pub(crate) fn release( &self, extent: ExtentRef ) {
        debug_assert!( extent.is_unique() );
        self.free.lock().push( extent );
    }

    pub fn len( &self ) -> usize {
        self.free.lock().len()
    }
}

impl Default for ExtentPool {
    fn default() -> Self {
        ExtentPool::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::ExtentState;
    use crate::size_class::PAGE;

    fn dummy( serial: u64 ) -> Extent {
        Extent::new( 0, serial, 0x1000, PAGE, PAGE, ExtentState::Active, false, true, false )
    }

    #[test]
    fn test_acquire_reuses_released_records() {
        let pool = ExtentPool::new();
        assert_eq!( pool.len(), 0 );

        let first = pool.acquire( dummy( 1 ) );
        assert_eq!( first.serial(), 1 );

        pool.release( first );
        assert_eq!( pool.len(), 1 );

        let second = pool.acquire( dummy( 2 ) );
        assert_eq!( pool.len(), 0 );
        assert_eq!( second.serial(), 2 );
    }
}
