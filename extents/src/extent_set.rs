use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use lru::LruCache;
use parking_lot::{Mutex, MutexGuard};

use crate::extent::{ExtentRef, ExtentState};
use crate::size_class::{
    align_up, page_ceil, quantize_ceil, quantize_floor, size_to_index,
    CLASS_COUNT, LG_PAGE, MAX_CLASS, PAGE
};

// Within one size class the order is (serial, address): older regions win,
// which keeps reuse biased towards long-lived address ranges.
type HeapKey = (u64, usize);

pub(crate) struct SetInner {
    heaps: Vec< BTreeMap< HeapKey, ExtentRef > >,
    occupied: BTreeSet< usize >,
    lru: LruCache< usize, ExtentRef >
}

/// All extents of one arena in one lifecycle state, indexed twice: by
/// quantized size for best-fit extraction and by recency for eviction.
///
/// One mutex guards both structures. The page counter is maintained
/// incrementally with lock-free atomics so statistics reads never touch
/// the mutex.
pub struct ExtentSet {
    state: ExtentState,
    coalesce: bool,
    pages: AtomicUsize,
    inner: Mutex< SetInner >
}

impl ExtentSet {
    pub(crate) fn new( state: ExtentState, coalesce: bool ) -> Self {
        debug_assert!( state != ExtentState::Active );

        let mut heaps = Vec::with_capacity( CLASS_COUNT );
        for _ in 0..CLASS_COUNT {
            heaps.push( BTreeMap::new() );
        }

        ExtentSet {
            state,
            coalesce,
            pages: AtomicUsize::new( 0 ),
            inner: Mutex::new( SetInner {
                heaps,
                occupied: BTreeSet::new(),
                lru: LruCache::unbounded()
            })
        }
    }

    pub fn state( &self ) -> ExtentState {
        self.state
    }

    pub(crate) fn coalesces( &self ) -> bool {
        self.coalesce
    }

    /// Total pages currently held; readable without the set's lock.
    pub fn pages( &self ) -> usize {
        self.pages.load( Ordering::Relaxed )
    }

    pub fn len( &self ) -> usize {
        self.inner.lock().lru.len()
    }

    pub(crate) fn lock( &self ) -> MutexGuard< SetInner > {
        self.inner.lock()
    }

    fn class_of( size: usize ) -> usize {
        let class = size_to_index( quantize_floor( size ) );
        debug_assert!( class < CLASS_COUNT );
        class
    }

    pub(crate) fn insert_locked( &self, inner: &mut SetInner, extent: &ExtentRef ) {
        let (serial, allocated, size) = {
            let guard = extent.lock();
            debug_assert_eq!( guard.state, self.state );
            (guard.serial, guard.allocated, guard.size)
        };

        let class = Self::class_of( size );
        let previous = inner.heaps[ class ].insert( (serial, allocated), extent.clone() );
        debug_assert!( previous.is_none() );
        inner.occupied.insert( class );
        inner.lru.put( allocated, extent.clone() );

        self.pages.fetch_add( size >> LG_PAGE, Ordering::Relaxed );
    }

    pub(crate) fn remove_locked( &self, inner: &mut SetInner, extent: &ExtentRef ) {
        let (serial, allocated, size) = {
            let guard = extent.lock();
            debug_assert_eq!( guard.state, self.state );
            (guard.serial, guard.allocated, guard.size)
        };

        let class = Self::class_of( size );
        let removed = inner.heaps[ class ].remove( &(serial, allocated) );
        debug_assert!( removed.map_or( false, |entry| entry.ptr_eq( extent ) ) );
        if inner.heaps[ class ].is_empty() {
            inner.occupied.remove( &class );
        }

        let removed = inner.lru.pop( &allocated );
        debug_assert!( removed.map_or( false, |entry| entry.ptr_eq( extent ) ) );

        let previous = self.pages.fetch_sub( size >> LG_PAGE, Ordering::Relaxed );
        debug_assert!( previous >= size >> LG_PAGE );
    }

    /// Best-fit by size class, first-fit within the class: starting from
    /// the smallest class which can hold `esize`, take each non-empty
    /// class's minimum and return the first candidate whose region can
    /// actually fit an `esize` allocation at `alignment` — a candidate
    /// placed unluckily for the alignment is skipped in favor of the next
    /// class rather than scanned past, trading a marginally looser fit for
    /// a strictly logarithmic search.
    pub(crate) fn first_best_fit_locked(
        &self,
        inner: &SetInner,
        esize: usize,
        alignment: usize
    ) -> Option< ExtentRef > {
        if esize > MAX_CLASS {
            return None;
        }

        // Guard against wrap-around in the worst-case alignment slack.
        esize.checked_add( page_ceil( alignment ) - PAGE )?;

        let start = size_to_index( quantize_ceil( esize ) );
        for &class in inner.occupied.range( start.. ) {
            let (&(_, allocated), extent) = inner.heaps[ class ].iter().next()?;
            let size = extent.size();

            let lead = align_up( allocated, page_ceil( alignment ) ) - allocated;
            if size >= lead + esize {
                return Some( extent.clone() );
            }
        }

        None
    }

    /// The least-recently-inserted member, left in place.
    pub(crate) fn peek_lru_locked( &self, inner: &SetInner ) -> Option< ExtentRef > {
        inner.lru.peek_lru().map( |(_, extent)| extent.clone() )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Extent;

    fn extent_at( serial: u64, allocated: usize, size: usize, state: ExtentState ) -> ExtentRef {
        ExtentRef::new( Extent::new( 0, serial, allocated, size, 0, state, false, true, false ) )
    }

    #[test]
    fn test_insert_remove_and_pages() {
        let set = ExtentSet::new( ExtentState::Dirty, true );
        let a = extent_at( 1, 0x10000, PAGE * 2, ExtentState::Dirty );
        let b = extent_at( 2, 0x20000, PAGE * 5, ExtentState::Dirty );

        {
            let mut inner = set.lock();
            set.insert_locked( &mut inner, &a );
            set.insert_locked( &mut inner, &b );
        }

        assert_eq!( set.pages(), 7 );
        assert_eq!( set.len(), 2 );

        {
            let mut inner = set.lock();
            set.remove_locked( &mut inner, &a );
        }

        assert_eq!( set.pages(), 5 );
        assert_eq!( set.len(), 1 );
    }

    #[test]
    fn test_best_fit_prefers_smallest_sufficient_class() {
        let set = ExtentSet::new( ExtentState::Retained, true );
        let small = extent_at( 1, 0x10000, PAGE * 2, ExtentState::Retained );
        let medium = extent_at( 2, 0x20000, PAGE * 4, ExtentState::Retained );
        let large = extent_at( 3, 0x30000, PAGE * 16, ExtentState::Retained );

        let mut inner = set.lock();
        set.insert_locked( &mut inner, &small );
        set.insert_locked( &mut inner, &medium );
        set.insert_locked( &mut inner, &large );

        let hit = set.first_best_fit_locked( &inner, PAGE * 3, PAGE ).unwrap();
        assert!( hit.ptr_eq( &medium ) );

        let hit = set.first_best_fit_locked( &inner, PAGE, PAGE ).unwrap();
        assert!( hit.ptr_eq( &small ) );

        let hit = set.first_best_fit_locked( &inner, PAGE * 5, PAGE ).unwrap();
        assert!( hit.ptr_eq( &large ) );

        assert!( set.first_best_fit_locked( &inner, PAGE * 17, PAGE ).is_none() );
    }

    #[test]
    fn test_best_fit_never_returns_an_undersized_extent() {
        let set = ExtentSet::new( ExtentState::Retained, true );
        for serial in 0..16_u64 {
            let size = PAGE * (1 + (serial as usize * 7) % 11);
            let extent = extent_at( serial, 0x100000 + serial as usize * 0x100000, size, ExtentState::Retained );
            let mut inner = set.lock();
            set.insert_locked( &mut inner, &extent );
        }

        let inner = set.lock();
        for pages in 1..16 {
            let request = PAGE * pages;
            if let Some( hit ) = set.first_best_fit_locked( &inner, request, PAGE ) {
                assert!( hit.size() >= request );
            }
        }
    }

    #[test]
    fn test_ties_break_towards_older_serials() {
        let set = ExtentSet::new( ExtentState::Retained, true );
        let newer = extent_at( 7, 0x10000, PAGE * 2, ExtentState::Retained );
        let older = extent_at( 3, 0x90000, PAGE * 2, ExtentState::Retained );

        let mut inner = set.lock();
        set.insert_locked( &mut inner, &newer );
        set.insert_locked( &mut inner, &older );

        let hit = set.first_best_fit_locked( &inner, PAGE * 2, PAGE ).unwrap();
        assert!( hit.ptr_eq( &older ) );
    }

    #[test]
    fn test_misaligned_candidate_is_skipped_for_a_larger_class() {
        let set = ExtentSet::new( ExtentState::Retained, true );
        // Exactly sized but unable to host an aligned allocation.
        let tight = extent_at( 1, 0x1000, PAGE * 4, ExtentState::Retained );
        // One class up, with room to carve an aligned piece.
        let roomy = extent_at( 2, 0x101000, PAGE * 8, ExtentState::Retained );

        let mut inner = set.lock();
        set.insert_locked( &mut inner, &tight );
        set.insert_locked( &mut inner, &roomy );

        let alignment = PAGE * 4;
        let hit = set.first_best_fit_locked( &inner, PAGE * 4, alignment ).unwrap();
        assert!( hit.ptr_eq( &roomy ) );
    }

    #[test]
    fn test_lru_order() {
        let set = ExtentSet::new( ExtentState::Dirty, true );
        let first = extent_at( 1, 0x10000, PAGE, ExtentState::Dirty );
        let second = extent_at( 2, 0x20000, PAGE, ExtentState::Dirty );

        let mut inner = set.lock();
        set.insert_locked( &mut inner, &first );
        set.insert_locked( &mut inner, &second );

        let lru = set.peek_lru_locked( &inner ).unwrap();
        assert!( lru.ptr_eq( &first ) );

        set.remove_locked( &mut inner, &first );
        let lru = set.peek_lru_locked( &inner ).unwrap();
        assert!( lru.ptr_eq( &second ) );
    }
}
