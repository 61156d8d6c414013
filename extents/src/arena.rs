use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::dss::DssPrecedence;
use crate::extent_set::ExtentSet;
use crate::extent::ExtentState;
use crate::hooks::{DefaultExtentHooks, ExtentHooks};
use crate::opt;
use crate::pool::ExtentPool;
use crate::size_class::{quantize_floor, size_to_index, CLASS_COUNT, MAX_CLASS, PAGE};

#[derive(Copy, Clone, Debug)]
pub struct ArenaConfig {
    /// Keep mappings instead of returning them to the OS; freed regions
    /// are then recorded for reuse and fresh memory is obtained by growing
    /// the retained pool geometrically.
    pub retain: bool,
    pub dss: DssPrecedence,
    /// Upper bound, in bytes, for a single retained-pool growth step.
    pub grow_limit: usize
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            retain: opt::retain(),
            dss: opt::dss_precedence(),
            grow_limit: opt::grow_limit()
        }
    }
}

/// One allocation domain: its sets, its object pool, its hooks and its
/// growth state. The arena owns the hooks exclusively; callers borrow a
/// snapshot for the duration of one operation.
pub struct Arena {
    ind: u32,
    config: ArenaConfig,
    hooks: RwLock< Arc< dyn ExtentHooks > >,
    pub(crate) pool: ExtentPool,
    pub(crate) cached: ExtentSet,
    pub(crate) retained: ExtentSet,
    serial: AtomicU64,
    /// Size-class index of the next retained-pool growth block. Only moves
    /// forward, saturating at the configured limit; guarded by its own
    /// mutex which is held across a whole growth operation so concurrent
    /// growers cannot leapfrog each other.
    grow_next: Mutex< usize >,
    grow_limit_index: usize
}

impl Arena {
    pub fn new( ind: u32, config: ArenaConfig ) -> Arena {
        let hooks: Arc< dyn ExtentHooks > = Arc::new( DefaultExtentHooks::new( config.retain, config.dss ) );

        let grow_limit = config.grow_limit.max( PAGE ).min( MAX_CLASS );
        let grow_limit_index = size_to_index( quantize_floor( grow_limit & !(PAGE - 1) ) );
        debug_assert!( grow_limit_index < CLASS_COUNT );

        Arena {
            ind,
            config,
            hooks: RwLock::new( hooks ),
            pool: ExtentPool::new(),
            // Freed-but-committed extents are kept as-is for cheap reuse;
            // only the retained tier folds neighbors back together.
            cached: ExtentSet::new( ExtentState::Dirty, false ),
            retained: ExtentSet::new( ExtentState::Retained, true ),
            serial: AtomicU64::new( 0 ),
            grow_next: Mutex::new( 0 ),
            grow_limit_index
        }
    }

    pub fn ind( &self ) -> u32 {
        self.ind
    }

    pub fn config( &self ) -> &ArenaConfig {
        &self.config
    }

    /// Snapshot of the currently installed hooks.
    pub fn hooks( &self ) -> Arc< dyn ExtentHooks > {
        self.hooks.read().clone()
    }

    /// Installs new hooks and returns the previous ones. In-flight
    /// operations keep using whichever snapshot they already took.
    pub fn set_hooks( &self, hooks: Arc< dyn ExtentHooks > ) -> Arc< dyn ExtentHooks > {
        std::mem::replace( &mut *self.hooks.write(), hooks )
    }

    pub fn cached_set( &self ) -> &ExtentSet {
        &self.cached
    }

    pub fn retained_set( &self ) -> &ExtentSet {
        &self.retained
    }

    pub(crate) fn next_serial( &self ) -> u64 {
        self.serial.fetch_add( 1, Ordering::Relaxed )
    }

    pub(crate) fn lock_grow_next( &self ) -> MutexGuard< usize > {
        self.grow_next.lock()
    }

    pub(crate) fn grow_limit_index( &self ) -> usize {
        self.grow_limit_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ArenaConfig {
        ArenaConfig {
            retain: true,
            dss: DssPrecedence::Disabled,
            grow_limit: MAX_CLASS
        }
    }

    #[test]
    fn test_serials_are_monotonic() {
        let arena = Arena::new( 0, test_config() );
        let a = arena.next_serial();
        let b = arena.next_serial();
        assert!( a < b );
    }

    #[test]
    fn test_hook_swap_returns_previous() {
        let arena = Arena::new( 0, test_config() );
        let replacement: Arc< dyn ExtentHooks > = Arc::new( DefaultExtentHooks::new( false, DssPrecedence::Disabled ) );
        let previous = arena.set_hooks( replacement.clone() );
        assert!( !Arc::ptr_eq( &previous, &arena.hooks() ) );
        assert!( Arc::ptr_eq( &replacement, &arena.hooks() ) );
    }

    #[test]
    fn test_grow_limit_is_clamped() {
        let mut config = test_config();
        config.grow_limit = PAGE * 9;
        let arena = Arena::new( 0, config );
        assert!( arena.grow_limit_index() < CLASS_COUNT );

        // Not a class boundary; the cap quantizes down to one.
        assert_eq!( arena.grow_limit_index(), size_to_index( PAGE * 8 ) );
    }
}
