use hashbrown::HashMap;
use parking_lot::{Mutex, MutexGuard};

// This was copied from `ahash`.
#[inline(always)]
const fn folded_multiply( s: u64, by: u64 ) -> u64 {
    let result = (s as u128).wrapping_mul( by as u128 );
    ((result & 0xffff_ffff_ffff_ffff) as u64) ^ ((result >> 64) as u64)
}

const DEFAULT_SHARD_COUNT: usize = 64;

struct Shard< V > {
    map: Mutex< HashMap< u64, V > >
}

impl< V > Shard< V > {
    fn new() -> Self {
        Shard {
            map: Mutex::new( HashMap::new() )
        }
    }
}

/// A concurrent map from page-sized keys to values.
///
/// The key space is split across a power-of-two number of independently
/// locked shards. A single key can be read or written through `get`,
/// `try_insert`, `write` and `remove`; when two keys have to change
/// together (e.g. the first and the last page of one region) the shards
/// of both keys can be held at once through `lock_pair`, so that no other
/// thread can ever observe one key mapped and the other not.
pub struct PageMap< V > {
    shards: Vec< Shard< V > >,
    shard_mask: u64
}

impl< V > PageMap< V > {
    pub fn new() -> Self {
        Self::with_shards( DEFAULT_SHARD_COUNT )
    }

    pub fn with_shards( shard_count: usize ) -> Self {
        let shard_count = shard_count.max( 1 ).next_power_of_two();
        let mut shards = Vec::with_capacity( shard_count );
        for _ in 0..shard_count {
            shards.push( Shard::new() );
        }

        PageMap {
            shards,
            shard_mask: shard_count as u64 - 1
        }
    }

    #[inline]
    fn shard_of( &self, key: u64 ) -> usize {
        (folded_multiply( key, 6364136223846793005 ) & self.shard_mask) as usize
    }

    pub fn len( &self ) -> usize {
        self.shards.iter().map( |shard| shard.map.lock().len() ).sum()
    }

    pub fn is_empty( &self ) -> bool {
        self.shards.iter().all( |shard| shard.map.lock().is_empty() )
    }

    pub fn get( &self, key: u64 ) -> Option< V > where V: Clone {
        self.shards[ self.shard_of( key ) ].map.lock().get( &key ).cloned()
    }

    /// Inserts the value unless the key is already mapped.
    ///
    /// Returns `false` (and leaves the existing entry untouched) if the key
    /// was already present. A key showing up twice means two owners claim
    /// the same page, so the caller has to treat `false` as a hard failure.
    #[must_use]
    pub fn try_insert( &self, key: u64, value: V ) -> bool {
        let mut map = self.shards[ self.shard_of( key ) ].map.lock();
        if map.contains_key( &key ) {
            return false;
        }

        map.insert( key, value );
        true
    }

    /// Inserts or replaces the entry under the key.
    pub fn write( &self, key: u64, value: V ) {
        self.shards[ self.shard_of( key ) ].map.lock().insert( key, value );
    }

    pub fn remove( &self, key: u64 ) -> Option< V > {
        self.shards[ self.shard_of( key ) ].map.lock().remove( &key )
    }

    /// Locks the shards of both keys (in index order, so two concurrent
    /// `lock_pair` calls can never deadlock) and returns a guard through
    /// which both entries can be accessed.
    pub fn lock_pair( &self, key_a: u64, key_b: u64 ) -> PairGuard< V > {
        let shard_a = self.shard_of( key_a );
        let shard_b = self.shard_of( key_b );
        let (first, second) = if shard_a <= shard_b {
            (shard_a, shard_b)
        } else {
            (shard_b, shard_a)
        };

        let first_guard = self.shards[ first ].map.lock();
        let second_guard = if second != first {
            Some( self.shards[ second ].map.lock() )
        } else {
            None
        };

        PairGuard {
            owner: self,
            first,
            second,
            first_guard,
            second_guard
        }
    }
}

impl< V > Default for PageMap< V > {
    fn default() -> Self {
        PageMap::new()
    }
}

/// Holds one or two shard locks; every access through the guard is
/// restricted to keys which hash into the locked shards.
pub struct PairGuard< 'a, V > {
    owner: &'a PageMap< V >,
    first: usize,
    second: usize,
    first_guard: MutexGuard< 'a, HashMap< u64, V > >,
    second_guard: Option< MutexGuard< 'a, HashMap< u64, V > > >
}

impl< 'a, V > PairGuard< 'a, V > {
    fn map_for( &self, key: u64 ) -> &HashMap< u64, V > {
        let shard = self.owner.shard_of( key );
        if shard == self.first {
            &self.first_guard
        } else if shard == self.second {
            self.second_guard.as_deref().expect( "key outside of the locked shards" )
        } else {
            panic!( "key outside of the locked shards" );
        }
    }

    fn map_for_mut( &mut self, key: u64 ) -> &mut HashMap< u64, V > {
        let shard = self.owner.shard_of( key );
        if shard == self.first {
            &mut self.first_guard
        } else if shard == self.second {
            self.second_guard.as_deref_mut().expect( "key outside of the locked shards" )
        } else {
            panic!( "key outside of the locked shards" );
        }
    }

    pub fn get( &self, key: u64 ) -> Option< V > where V: Clone {
        self.map_for( key ).get( &key ).cloned()
    }

    #[must_use]
    pub fn try_insert( &mut self, key: u64, value: V ) -> bool {
        let map = self.map_for_mut( key );
        if map.contains_key( &key ) {
            return false;
        }

        map.insert( key, value );
        true
    }

    pub fn write( &mut self, key: u64, value: V ) {
        self.map_for_mut( key ).insert( key, value );
    }

    pub fn remove( &mut self, key: u64 ) -> Option< V > {
        self.map_for_mut( key ).remove( &key )
    }
}

#[test]
fn test_single_key_ops() {
    let map = PageMap::new();
    assert!( map.is_empty() );
    assert!( map.try_insert( 0x1000, 1 ) );
    assert!( map.try_insert( 0x2000, 2 ) );
    assert_eq!( map.len(), 2 );
    assert_eq!( map.get( 0x1000 ), Some( 1 ) );
    assert_eq!( map.get( 0x2000 ), Some( 2 ) );
    assert_eq!( map.get( 0x3000 ), None );

    assert!( !map.try_insert( 0x1000, 10 ) );
    assert_eq!( map.get( 0x1000 ), Some( 1 ) );

    map.write( 0x1000, 10 );
    assert_eq!( map.get( 0x1000 ), Some( 10 ) );

    assert_eq!( map.remove( 0x1000 ), Some( 10 ) );
    assert_eq!( map.remove( 0x1000 ), None );
    assert_eq!( map.get( 0x1000 ), None );
    assert_eq!( map.len(), 1 );
}

#[test]
fn test_pair_guard_distinct_shards() {
    let map = PageMap::new();
    let mut keys = (0_u64..).map( |nth| nth * 0x1000 );
    let key_a = keys.next().unwrap();
    let key_b = keys.find( |&key| map.shard_of( key ) != map.shard_of( key_a ) ).unwrap();

    {
        let mut pair = map.lock_pair( key_a, key_b );
        assert!( pair.try_insert( key_a, 1 ) );
        assert!( pair.try_insert( key_b, 2 ) );
        assert!( !pair.try_insert( key_b, 3 ) );
        assert_eq!( pair.get( key_a ), Some( 1 ) );
    }

    assert_eq!( map.get( key_a ), Some( 1 ) );
    assert_eq!( map.get( key_b ), Some( 2 ) );

    {
        let mut pair = map.lock_pair( key_b, key_a );
        assert_eq!( pair.remove( key_a ), Some( 1 ) );
        assert_eq!( pair.remove( key_b ), Some( 2 ) );
    }

    assert!( map.is_empty() );
}

#[test]
fn test_pair_guard_same_key() {
    let map = PageMap::new();
    let mut pair = map.lock_pair( 0x7000, 0x7000 );
    assert!( pair.try_insert( 0x7000, 7 ) );
    assert_eq!( pair.get( 0x7000 ), Some( 7 ) );
    drop( pair );

    assert_eq!( map.get( 0x7000 ), Some( 7 ) );
}

#[test]
fn test_pair_visibility_under_contention() {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    let map = Arc::new( PageMap::new() );
    let stop = Arc::new( AtomicBool::new( false ) );

    // Every region is two entries: its first and its last page. Writers
    // insert and remove both under one pair guard; readers must never see
    // only one of the two mapped.
    let mut threads = Vec::new();
    for nth in 0..4_u64 {
        let map = map.clone();
        let stop = stop.clone();
        threads.push( std::thread::spawn( move || {
            let first = (nth * 2) * 0x1000;
            let last = (nth * 2 + 1) * 0x1000;
            while !stop.load( Ordering::Relaxed ) {
                {
                    let mut pair = map.lock_pair( first, last );
                    assert!( pair.try_insert( first, nth ) );
                    assert!( pair.try_insert( last, nth ) );
                }
                {
                    let mut pair = map.lock_pair( first, last );
                    assert_eq!( pair.remove( first ), Some( nth ) );
                    assert_eq!( pair.remove( last ), Some( nth ) );
                }
            }
        }));
    }

    for _ in 0..10000 {
        for nth in 0..4_u64 {
            let first = (nth * 2) * 0x1000;
            let last = (nth * 2 + 1) * 0x1000;
            let pair = map.lock_pair( first, last );
            assert_eq!( pair.get( first ).is_some(), pair.get( last ).is_some() );
        }
    }

    stop.store( true, Ordering::Relaxed );
    for thread in threads {
        thread.join().unwrap();
    }
}
