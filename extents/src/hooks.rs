use std::fmt;

use crate::dss::{self, DssPrecedence};
use crate::pages;
use crate::size_class::{PAGE, PAGE_MASK};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HookError {
    /// The operation is not provided by this hook configuration; the
    /// equivalent of a null entry in a hook table.
    Unsupported,
    /// The hook ran and refused or failed the operation.
    Failed
}

impl fmt::Display for HookError {
    fn fmt( &self, formatter: &mut fmt::Formatter ) -> fmt::Result {
        match *self {
            HookError::Unsupported => write!( formatter, "operation not supported by the extent hooks" ),
            HookError::Failed => write!( formatter, "extent hook refused or failed the operation" )
        }
    }
}

pub type HookResult = Result< (), HookError >;

/// The only place that talks to the operating system.
///
/// One implementation is installed per arena and may be hot-swapped by it;
/// a caller may also pass its own for the duration of a single operation.
/// Everything except `alloc` is optional: the default method bodies report
/// `Unsupported`, and every caller is prepared to fall back (or give up)
/// when an operation is missing, since platform support genuinely varies.
pub trait ExtentHooks: Send + Sync {
    /// Obtains `size` bytes aligned to `alignment`, optionally exactly at
    /// `new_addr`. `zero` and `commit` are in-out: on entry they carry the
    /// caller's requirements, on exit the actual state of the returned
    /// region, which may exceed what was asked for.
    fn alloc(
        &self,
        arena_ind: u32,
        new_addr: Option< usize >,
        size: usize,
        alignment: usize,
        zero: &mut bool,
        commit: &mut bool
    ) -> Option< usize >;

    /// Releases the region back to the OS. A refusal is a legitimate policy
    /// decision, not an error; the caller keeps the region and degrades to
    /// decommit/purge instead.
    fn dalloc( &self, _arena_ind: u32, _addr: usize, _size: usize, _committed: bool ) -> HookResult {
        Err( HookError::Unsupported )
    }

    fn commit( &self, _arena_ind: u32, _addr: usize, _size: usize, _offset: usize, _length: usize ) -> HookResult {
        Err( HookError::Unsupported )
    }

    fn decommit( &self, _arena_ind: u32, _addr: usize, _size: usize, _offset: usize, _length: usize ) -> HookResult {
        Err( HookError::Unsupported )
    }

    fn purge_lazy( &self, _arena_ind: u32, _addr: usize, _size: usize, _offset: usize, _length: usize ) -> HookResult {
        Err( HookError::Unsupported )
    }

    fn purge_forced( &self, _arena_ind: u32, _addr: usize, _size: usize, _offset: usize, _length: usize ) -> HookResult {
        Err( HookError::Unsupported )
    }

    /// Declares the region `[addr, addr + size)` split into two
    /// independently releasable pieces of `size_a` and `size_b` bytes.
    fn split( &self, _arena_ind: u32, _addr: usize, _size: usize, _size_a: usize, _size_b: usize, _committed: bool ) -> HookResult {
        Err( HookError::Unsupported )
    }

    /// Declares the adjacent regions `a` and `b` one contiguous region.
    fn merge( &self, _arena_ind: u32, _addr_a: usize, _size_a: usize, _addr_b: usize, _size_b: usize, _committed: bool ) -> HookResult {
        Err( HookError::Unsupported )
    }
}

/// Default strategy backed by anonymous mappings and, if configured, the
/// contiguous program heap.
pub struct DefaultExtentHooks {
    retain: bool,
    dss: DssPrecedence
}

impl DefaultExtentHooks {
    pub fn new( retain: bool, dss: DssPrecedence ) -> Self {
        DefaultExtentHooks { retain, dss }
    }
}

impl ExtentHooks for DefaultExtentHooks {
    fn alloc(
        &self,
        _arena_ind: u32,
        new_addr: Option< usize >,
        size: usize,
        alignment: usize,
        zero: &mut bool,
        commit: &mut bool
    ) -> Option< usize > {
        debug_assert!( size > 0 && size & PAGE_MASK == 0 );

        let alignment = alignment.max( PAGE );

        // The break only ever grows at its current position, so an
        // exact-address request can only be satisfied by a mapping.
        if new_addr.is_none() && self.dss == DssPrecedence::Primary {
            if let Some( addr ) = dss::alloc( size, alignment, zero, commit ) {
                return Some( addr );
            }
        }

        if let Some( addr ) = pages::map( new_addr, size, alignment, commit ) {
            *zero = true;
            return Some( addr );
        }

        if new_addr.is_none() && self.dss == DssPrecedence::Secondary {
            if let Some( addr ) = dss::alloc( size, alignment, zero, commit ) {
                return Some( addr );
            }
        }

        None
    }

    fn dalloc( &self, _arena_ind: u32, addr: usize, size: usize, _committed: bool ) -> HookResult {
        if self.retain {
            // Keep the mapping; the caller records it for reuse instead.
            return Err( HookError::Failed );
        }

        if dss::in_dss( addr ) {
            // The break cannot shrink out from under later growth.
            return Err( HookError::Failed );
        }

        pages::unmap( addr, size );
        Ok( () )
    }

    fn commit( &self, _arena_ind: u32, addr: usize, _size: usize, offset: usize, length: usize ) -> HookResult {
        if pages::commit( addr + offset, length ) {
            Ok( () )
        } else {
            Err( HookError::Failed )
        }
    }

    fn decommit( &self, _arena_ind: u32, addr: usize, _size: usize, offset: usize, length: usize ) -> HookResult {
        if dss::in_dss( addr ) {
            // An overmap would punch a hole into the heap segment.
            return Err( HookError::Failed );
        }

        if pages::decommit( addr + offset, length ) {
            Ok( () )
        } else {
            Err( HookError::Failed )
        }
    }

    fn purge_lazy( &self, _arena_ind: u32, addr: usize, _size: usize, offset: usize, length: usize ) -> HookResult {
        if !pages::CAN_PURGE_LAZY {
            return Err( HookError::Unsupported );
        }

        if pages::purge_lazy( addr + offset, length ) {
            Ok( () )
        } else {
            Err( HookError::Failed )
        }
    }

    fn purge_forced( &self, _arena_ind: u32, addr: usize, _size: usize, offset: usize, length: usize ) -> HookResult {
        if !pages::CAN_PURGE_FORCED {
            return Err( HookError::Unsupported );
        }

        if pages::purge_forced( addr + offset, length ) {
            Ok( () )
        } else {
            Err( HookError::Failed )
        }
    }

    fn split( &self, _arena_ind: u32, _addr: usize, _size: usize, _size_a: usize, _size_b: usize, _committed: bool ) -> HookResult {
        if pages::MAPS_COALESCE {
            // One mapping can be released piecewise; nothing to do now.
            Ok( () )
        } else {
            Err( HookError::Unsupported )
        }
    }

    fn merge( &self, _arena_ind: u32, addr_a: usize, size_a: usize, addr_b: usize, _size_b: usize, _committed: bool ) -> HookResult {
        if !pages::MAPS_COALESCE {
            return Err( HookError::Unsupported );
        }

        debug_assert_eq!( addr_a + size_a, addr_b );
        if dss::in_dss( addr_a ) != dss::in_dss( addr_b ) {
            return Err( HookError::Failed );
        }

        Ok( () )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_alloc_round_trip() {
        let hooks = DefaultExtentHooks::new( false, DssPrecedence::Disabled );
        let mut zero = false;
        let mut commit = false;

        let addr = hooks.alloc( 0, None, PAGE * 2, PAGE, &mut zero, &mut commit ).unwrap();
        assert!( zero );
        assert!( commit );
        assert_eq!( addr & PAGE_MASK, 0 );

        assert_eq!( hooks.dalloc( 0, addr, PAGE * 2, true ), Ok( () ) );
    }

    #[test]
    fn test_retaining_dalloc_declines() {
        let hooks = DefaultExtentHooks::new( true, DssPrecedence::Disabled );
        let mut zero = false;
        let mut commit = false;

        let addr = hooks.alloc( 0, None, PAGE, PAGE, &mut zero, &mut commit ).unwrap();
        assert_eq!( hooks.dalloc( 0, addr, PAGE, true ), Err( HookError::Failed ) );

        // The hook declined, so the mapping is still ours to release.
        pages::unmap( addr, PAGE );
    }

    #[test]
    fn test_split_and_merge_are_trivial_on_coalescing_maps() {
        let hooks = DefaultExtentHooks::new( true, DssPrecedence::Disabled );
        assert_eq!( hooks.split( 0, 0x10000, PAGE * 2, PAGE, PAGE, true ), Ok( () ) );
        assert_eq!( hooks.merge( 0, 0x10000, PAGE, 0x11000, PAGE, true ), Ok( () ) );
    }
}
