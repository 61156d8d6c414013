use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::size_class::{align_up, PAGE, PAGE_MASK};

/// When the contiguous program heap ("dss") is consulted relative to
/// anonymous mappings while obtaining fresh memory.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DssPrecedence {
    Disabled,
    Primary,
    Secondary
}

impl DssPrecedence {
    pub fn from_str( value: &str ) -> Option< DssPrecedence > {
        match value {
            "disabled" => Some( DssPrecedence::Disabled ),
            "primary" => Some( DssPrecedence::Primary ),
            "secondary" => Some( DssPrecedence::Secondary ),
            _ => None
        }
    }
}

const UNINITIALIZED: usize = usize::MAX;

// The break can only grow through the mutex; the atomics exist so that
// `in_dss` can answer without taking it.
static DSS_BASE: AtomicUsize = AtomicUsize::new( UNINITIALIZED );
static DSS_MAX: AtomicUsize = AtomicUsize::new( 0 );

lazy_static! {
    static ref DSS_LOCK: Mutex< () > = Mutex::new( () );
}

/// Extends the program break by enough to carve out `size` bytes aligned
/// to `alignment`, and returns the aligned address. The gap in front of the
/// aligned address (if any) is simply left unused; the break never shrinks.
#[cfg(unix)]
pub fn alloc( size: usize, alignment: usize, zero: &mut bool, commit: &mut bool ) -> Option< usize > {
    debug_assert!( size > 0 && size & PAGE_MASK == 0 );
    debug_assert!( alignment.is_power_of_two() );

    let _guard = DSS_LOCK.lock();

    let current = unsafe { libc::sbrk( 0 ) };
    if current == usize::MAX as *mut libc::c_void {
        return None;
    }

    let current = current as usize;
    if DSS_BASE.load( Ordering::Relaxed ) == UNINITIALIZED {
        DSS_BASE.store( current, Ordering::Relaxed );
    }

    let aligned = align_up( current, alignment.max( PAGE ) );
    let increment = aligned.checked_sub( current )?.checked_add( size )?;
    if increment > isize::MAX as usize {
        return None;
    }

    let previous = unsafe { libc::sbrk( increment as libc::intptr_t ) };
    if previous == usize::MAX as *mut libc::c_void {
        return None;
    }

    debug_assert_eq!( previous as usize, current );
    DSS_MAX.store( aligned + size, Ordering::Release );

    // Fresh break pages come from the kernel zeroed and lazily backed.
    *zero = true;
    *commit = true;
    Some( aligned )
}

#[cfg(not(unix))]
pub fn alloc( _size: usize, _alignment: usize, _zero: &mut bool, _commit: &mut bool ) -> Option< usize > {
    None
}

/// Whether the address lies within the range the program break has ever
/// covered. Merging a break-backed region with a mapping outside of it
/// must be refused, since the two cannot be released the same way.
pub fn in_dss( addr: usize ) -> bool {
    let base = DSS_BASE.load( Ordering::Relaxed );
    if base == UNINITIALIZED {
        return false;
    }

    addr >= base && addr < DSS_MAX.load( Ordering::Acquire )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precedence_parsing() {
        assert_eq!( DssPrecedence::from_str( "disabled" ), Some( DssPrecedence::Disabled ) );
        assert_eq!( DssPrecedence::from_str( "primary" ), Some( DssPrecedence::Primary ) );
        assert_eq!( DssPrecedence::from_str( "secondary" ), Some( DssPrecedence::Secondary ) );
        assert_eq!( DssPrecedence::from_str( "sometimes" ), None );
    }

    #[test]
    fn test_unmapped_address_is_not_in_dss() {
        assert!( !in_dss( 0 ) );
    }
}
