use page_map::PageMap;
use smallvec::SmallVec;

use crate::extent::ExtentRef;
use crate::size_class::{LG_PAGE, PAGE};
use crate::stats::GlobalStats;

/// The process-wide context: the address-to-extent index plus the global
/// statistics. Initialized once at start-up in a real embedding; tests
/// create as many as they like.
///
/// Every live extent has its first and its last page indexed (one entry if
/// they coincide); a slab extent additionally has every interior page
/// indexed, so that any address within it resolves. The two boundary
/// entries are always inserted and removed under one pair lock, so no
/// observer can catch a region indexed at only one end.
pub struct AddressSpace {
    index: PageMap< ExtentRef >,
    pub stats: GlobalStats
}

impl AddressSpace {
    pub fn new() -> Self {
        AddressSpace {
            index: PageMap::new(),
            stats: GlobalStats::new()
        }
    }

    /// Resolves an address to the extent owning its page, if any.
    pub fn lookup( &self, addr: usize ) -> Option< ExtentRef > {
        self.index.get( (addr >> LG_PAGE) as u64 )
    }

    /// Indexes the extent's boundary pages. Fails without side effects if
    /// any of the pages is already claimed; the caller must treat that as
    /// a hard error (it means a double registration).
    #[must_use]
    pub(crate) fn register( &self, extent: &ExtentRef, announce: bool ) -> Result< (), () > {
        let (first, last, size, slab) = {
            let guard = extent.lock();
            (guard.first_page(), guard.last_page(), guard.size, guard.slab)
        };

        {
            let mut inserted: SmallVec< [u64; 2] > = SmallVec::new();
            let mut pair = self.index.lock_pair( first, last );
            for &key in [first, last].iter() {
                if inserted.contains( &key ) {
                    continue;
                }

                if pair.try_insert( key, extent.clone() ) {
                    inserted.push( key );
                } else {
                    for &key in &inserted {
                        pair.remove( key );
                    }
                    return Err( () );
                }
            }
        }

        if slab {
            self.interior_register( extent );
        }

        self.stats.add_mapped( size >> LG_PAGE, announce );
        Ok( () )
    }

    /// Removes the extent's boundary (and, for a slab, interior) pages
    /// from the index.
    pub(crate) fn deregister( &self, extent: &ExtentRef ) {
        let (first, last, size, slab) = {
            let guard = extent.lock();
            (guard.first_page(), guard.last_page(), guard.size, guard.slab)
        };

        {
            let mut pair = self.index.lock_pair( first, last );
            let removed = pair.remove( first );
            debug_assert!( removed.map_or( false, |entry| entry.ptr_eq( extent ) ) );
            if last != first {
                let removed = pair.remove( last );
                debug_assert!( removed.map_or( false, |entry| entry.ptr_eq( extent ) ) );
            }
        }

        if slab {
            self.interior_deregister( extent );
        }

        self.stats.sub_mapped( size >> LG_PAGE );
    }

    /// Indexes every page strictly between the extent's boundary pages.
    pub(crate) fn interior_register( &self, extent: &ExtentRef ) {
        let (first, last) = {
            let guard = extent.lock();
            (guard.first_page(), guard.last_page())
        };

        for page in first + 1..last {
            self.index.write( page, extent.clone() );
        }
    }

    pub(crate) fn interior_deregister( &self, extent: &ExtentRef ) {
        let (first, last) = {
            let guard = extent.lock();
            (guard.first_page(), guard.last_page())
        };

        for page in first + 1..last {
            let removed = self.index.remove( page );
            debug_assert!( removed.map_or( false, |entry| entry.ptr_eq( extent ) ) );
        }
    }

    /// Rewrites the index after `lead` (still holding its pre-split
    /// geometry in the index) was split into `lead` + `trail` at
    /// `allocated + size_a`.
    pub(crate) fn record_split(
        &self,
        lead: &ExtentRef,
        trail: &ExtentRef,
        allocated: usize,
        size_a: usize,
        total_size: usize
    ) {
        let lead_new_last = ((allocated + size_a - PAGE) >> LG_PAGE) as u64;
        let trail_first = ((allocated + size_a) >> LG_PAGE) as u64;
        let trail_last = ((allocated + total_size - PAGE) >> LG_PAGE) as u64;

        {
            let mut pair = self.index.lock_pair( lead_new_last, trail_first );
            pair.write( lead_new_last, lead.clone() );
            pair.write( trail_first, trail.clone() );
        }

        self.index.write( trail_last, trail.clone() );
    }

    /// Rewrites the index after the region of `b` (starting at
    /// `a_allocated + a_size`, `b_size` bytes) was folded into `a`.
    pub(crate) fn record_merge(
        &self,
        a: &ExtentRef,
        a_allocated: usize,
        a_size: usize,
        b_size: usize
    ) {
        let a_first = (a_allocated >> LG_PAGE) as u64;
        let a_old_last = ((a_allocated + a_size - PAGE) >> LG_PAGE) as u64;
        let b_first = ((a_allocated + a_size) >> LG_PAGE) as u64;
        let b_last = ((a_allocated + a_size + b_size - PAGE) >> LG_PAGE) as u64;

        // The merged region's last page has to point at the survivor before
        // the interior boundary entries disappear.
        self.index.write( b_last, a.clone() );

        let mut pair = self.index.lock_pair( a_old_last, b_first );
        if a_old_last != a_first {
            pair.remove( a_old_last );
        }
        if b_first != b_last {
            pair.remove( b_first );
        }
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        AddressSpace::new()
    }
}
