use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

pub type HighWaterCallback = Box< dyn Fn( usize ) + Send + Sync >;

/// Process-wide mapped-page accounting.
///
/// The counters are plain atomics: increments and decrements are lock-free
/// and reads are unsynchronized, so a reader can observe a slightly stale
/// value. That is fine; these exist for statistics and for the high-water
/// callback, not for correctness decisions.
pub struct GlobalStats {
    mapped_pages: AtomicUsize,
    high_water_pages: AtomicUsize,
    reported_high_water: AtomicUsize,
    callback: RwLock< Option< HighWaterCallback > >
}

impl GlobalStats {
    pub fn new() -> Self {
        GlobalStats {
            mapped_pages: AtomicUsize::new( 0 ),
            high_water_pages: AtomicUsize::new( 0 ),
            reported_high_water: AtomicUsize::new( 0 ),
            callback: RwLock::new( None )
        }
    }

    pub fn mapped_pages( &self ) -> usize {
        self.mapped_pages.load( Ordering::Relaxed )
    }

    pub fn high_water_pages( &self ) -> usize {
        self.high_water_pages.load( Ordering::Relaxed )
    }

    /// Installs (or clears) the callback invoked with the new page count
    /// whenever a new high-water mark is announced.
    pub fn set_high_water_callback( &self, callback: Option< HighWaterCallback > ) {
        *self.callback.write() = callback;
    }

    pub(crate) fn add_mapped( &self, pages: usize, announce: bool ) {
        let current = self.mapped_pages.fetch_add( pages, Ordering::Relaxed ) + pages;

        let mut high = self.high_water_pages.load( Ordering::Relaxed );
        while current > high {
            match self.high_water_pages.compare_exchange_weak( high, current, Ordering::Relaxed, Ordering::Relaxed ) {
                Ok( _ ) => break,
                Err( value ) => high = value
            }
        }

        if announce {
            self.announce_high_water();
        }
    }

    pub(crate) fn sub_mapped( &self, pages: usize ) {
        let previous = self.mapped_pages.fetch_sub( pages, Ordering::Relaxed );
        debug_assert!( previous >= pages );
    }

    /// Fires the callback if the high-water mark moved since it last fired.
    ///
    /// Callers which grow a region in multiple steps keep the counters
    /// up-to-date as they go and announce only once the final size is
    /// fixed, so a single logical growth is never reported twice.
    pub(crate) fn announce_high_water( &self ) {
        let high = self.high_water_pages.load( Ordering::Relaxed );
        let mut reported = self.reported_high_water.load( Ordering::Relaxed );
        while high > reported {
            match self.reported_high_water.compare_exchange_weak( reported, high, Ordering::Relaxed, Ordering::Relaxed ) {
                Ok( _ ) => {
                    if let Some( ref callback ) = *self.callback.read() {
                        callback( high );
                    }
                    break;
                },
                Err( value ) => reported = value
            }
        }
    }
}

impl Default for GlobalStats {
    fn default() -> Self {
        GlobalStats::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters() {
        let stats = GlobalStats::new();
        stats.add_mapped( 8, true );
        stats.add_mapped( 4, true );
        assert_eq!( stats.mapped_pages(), 12 );
        assert_eq!( stats.high_water_pages(), 12 );

        stats.sub_mapped( 10 );
        assert_eq!( stats.mapped_pages(), 2 );
        assert_eq!( stats.high_water_pages(), 12 );

        stats.add_mapped( 4, true );
        assert_eq!( stats.high_water_pages(), 12 );
    }

    #[test]
    fn test_high_water_callback() {
        let stats = GlobalStats::new();
        let hits = Arc::new( AtomicUsize::new( 0 ) );

        let hits_in_callback = hits.clone();
        stats.set_high_water_callback( Some( Box::new( move |_pages| {
            hits_in_callback.fetch_add( 1, Ordering::Relaxed );
        })));

        stats.add_mapped( 8, true );
        assert_eq!( hits.load( Ordering::Relaxed ), 1 );

        // No new high water, no callback.
        stats.sub_mapped( 8 );
        stats.add_mapped( 8, true );
        assert_eq!( hits.load( Ordering::Relaxed ), 1 );

        // Quiet accumulation announces once, at the end.
        stats.add_mapped( 8, false );
        stats.add_mapped( 8, false );
        assert_eq!( hits.load( Ordering::Relaxed ), 1 );
        stats.announce_high_water();
        assert_eq!( hits.load( Ordering::Relaxed ), 2 );
    }
}
