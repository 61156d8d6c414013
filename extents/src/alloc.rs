use std::sync::Arc;

use crate::arena::Arena;
use crate::extent::{random_pad_offset, Extent, ExtentRef, ExtentState};
use crate::extent_set::ExtentSet;
use crate::hooks::{ExtentHooks, HookError};
use crate::index::AddressSpace;
use crate::size_class::{align_up, index_to_size, page_ceil, LG_PAGE, PAGE, PAGE_MASK};

type Hooks = Arc< dyn ExtentHooks >;

/// Obtains an extent of `usable + pad` bytes aligned to `alignment`,
/// optionally exactly at `new_addr`: first by recycling the retained pool,
/// then by growing it, and only as a last resort from fresh OS memory.
///
/// `zero` and `commit` are in-out: they carry the requirements on entry and
/// the actual region state on return, which is allowed to exceed what was
/// asked for but never claims a zeroed region that isn't. On success the
/// extent is active and indexed (including its interior pages when `slab`).
/// Returns `None` when every strategy failed.
pub fn alloc(
    space: &AddressSpace,
    arena: &Arena,
    hooks: &Hooks,
    new_addr: Option< usize >,
    usable: usize,
    pad: usize,
    alignment: usize,
    zero: &mut bool,
    commit: &mut bool,
    slab: bool
) -> Option< ExtentRef > {
    debug_assert!( usable > 0 );
    debug_assert!( alignment.is_power_of_two() );
    debug_assert!( (usable + pad) & PAGE_MASK == 0 );

    if let Some( extent ) = alloc_retained( space, arena, hooks, new_addr, usable, pad, alignment, zero, commit, slab ) {
        return Some( extent );
    }

    alloc_hard( space, arena, hooks, new_addr, usable, pad, alignment, zero, commit, slab )
}

/// Like `alloc`, but only consults the cache of recently freed extents;
/// no OS interaction besides an optional commit.
pub fn alloc_from_cache(
    space: &AddressSpace,
    arena: &Arena,
    hooks: &Hooks,
    new_addr: Option< usize >,
    usable: usize,
    pad: usize,
    alignment: usize,
    zero: &mut bool,
    commit: &mut bool,
    slab: bool
) -> Option< ExtentRef > {
    debug_assert!( usable > 0 );
    debug_assert!( alignment.is_power_of_two() );

    recycle( space, arena, hooks, &arena.cached, new_addr, usable, pad, alignment, zero, commit, slab )
}

/// Returns an extent to the cache of its arena for later reuse. The
/// contents are treated as garbage from here on.
pub fn dalloc_to_cache( space: &AddressSpace, arena: &Arena, hooks: &Hooks, extent: ExtentRef ) {
    {
        let mut guard = extent.lock();
        debug_assert_eq!( guard.state, ExtentState::Active );
        guard.base = guard.allocated;
        guard.zeroed = false;
    }

    record( space, arena, hooks, &arena.cached, extent );
}

/// Releases an extent's memory for real, if the hooks allow it.
///
/// When they don't (or there is no way to release), the extent is retained
/// instead, stripped of as much physical backing as the hook configuration
/// can manage: decommit first, then lazy purge, then forced purge. From the
/// caller's point of view this never fails.
pub fn dalloc( space: &AddressSpace, arena: &Arena, hooks: &Hooks, extent: ExtentRef ) {
    let (addr, size, committed) = {
        let mut guard = extent.lock();
        debug_assert_eq!( guard.state, ExtentState::Active );
        guard.base = guard.allocated;
        (guard.allocated, guard.size, guard.committed)
    };

    // Deregister first; while the pages are mid-release nobody may be able
    // to reach this extent through the index.
    space.deregister( &extent );

    match hooks.dalloc( arena.ind(), addr, size, committed ) {
        Ok( () ) => {
            arena.pool.release( extent );
            return;
        },
        Err( error ) => {
            debug!( "Hooks declined to release {} byte(s) at 0x{:x} ({}); degrading", size, addr, error );
        }
    }

    // The region stays with us after all, so the index has to cover it
    // again before anything else happens to it.
    if space.register( &extent, true ).is_err() {
        warn!( "Failed to re-index a declined deallocation at 0x{:x}", addr );
        leak( arena, hooks, extent );
        return;
    }

    let zeroed = if !committed {
        true
    } else if decommit_wrapper( arena, hooks, &extent, 0, size ).is_ok() {
        true
    } else if hooks.purge_lazy( arena.ind(), addr, size, 0, size ).is_ok() {
        // Lazily purged pages may still hold their old contents.
        false
    } else if hooks.purge_forced( arena.ind(), addr, size, 0, size ).is_ok() {
        true
    } else {
        false
    };

    extent.lock().zeroed = zeroed;
    record( space, arena, hooks, &arena.retained, extent );
}

/// Wraps an externally discovered region (e.g. a gap the OS opened between
/// two of our mappings) in an extent, indexes it and hard-deallocates it.
pub fn dalloc_gap( space: &AddressSpace, arena: &Arena, hooks: &Hooks, addr: usize, size: usize ) {
    debug_assert!( addr & PAGE_MASK == 0 );
    debug_assert!( size > 0 && size & PAGE_MASK == 0 );

    let extent = arena.pool.acquire( Extent::new(
        arena.ind(),
        arena.next_serial(),
        addr,
        size,
        size,
        ExtentState::Active,
        false,
        true,
        false
    ));

    if space.register( &extent, true ).is_err() {
        warn!( "Externally discovered region at 0x{:x} collides with an indexed extent", addr );
        leak( arena, hooks, extent );
        return;
    }

    dalloc( space, arena, hooks, extent );
}

/// Pops the least-recently-used extent out of the arena's cache, unless
/// doing so would drop the cache below `min_pages`. The extent comes back
/// active and still indexed; the caller decides its fate.
pub fn evict_from_cache( space: &AddressSpace, arena: &Arena, min_pages: usize ) -> Option< ExtentRef > {
    evict( space, &arena.cached, min_pages )
}

fn evict( space: &AddressSpace, set: &ExtentSet, min_pages: usize ) -> Option< ExtentRef > {
    let mut inner = set.lock();
    let extent = set.peek_lru_locked( &inner )?;

    let pages = extent.size() >> LG_PAGE;
    if set.pages().saturating_sub( pages ) < min_pages {
        return None;
    }

    set.remove_locked( &mut inner, &extent );

    // Make the extent unclaimable before the set's lock goes away: active
    // for a cached extent, unindexed for a retained one.
    extent.lock().state = ExtentState::Active;
    if set.state() == ExtentState::Retained {
        space.deregister( &extent );
    }

    Some( extent )
}

fn alloc_retained(
    space: &AddressSpace,
    arena: &Arena,
    hooks: &Hooks,
    new_addr: Option< usize >,
    usable: usize,
    pad: usize,
    alignment: usize,
    zero: &mut bool,
    commit: &mut bool,
    slab: bool
) -> Option< ExtentRef > {
    if let Some( extent ) = recycle( space, arena, hooks, &arena.retained, new_addr, usable, pad, alignment, zero, commit, slab ) {
        return Some( extent );
    }

    if arena.config().retain && new_addr.is_none() {
        return grow_retained( space, arena, hooks, usable, pad, alignment, zero, commit, slab );
    }

    None
}

fn alloc_hard(
    space: &AddressSpace,
    arena: &Arena,
    hooks: &Hooks,
    new_addr: Option< usize >,
    usable: usize,
    pad: usize,
    alignment: usize,
    zero: &mut bool,
    commit: &mut bool,
    slab: bool
) -> Option< ExtentRef > {
    let esize = usable.checked_add( pad )?;
    let addr = hooks.alloc( arena.ind(), new_addr, esize, alignment.max( PAGE ), zero, commit )?;

    let mut descriptor = Extent::new(
        arena.ind(),
        arena.next_serial(),
        addr,
        esize,
        usable,
        ExtentState::Active,
        *zero,
        *commit,
        slab
    );

    if pad != 0 {
        descriptor.base = addr + random_pad_offset( pad, alignment );
    }

    let extent = arena.pool.acquire( descriptor );
    if space.register( &extent, true ).is_err() {
        warn!( "Freshly allocated region at 0x{:x} collides with an indexed extent", addr );
        leak( arena, hooks, extent );
        return None;
    }

    Some( extent )
}

/// Attempts to satisfy the request out of one set: extract a candidate,
/// carve the aligned middle out of it, commit it if necessary.
fn recycle(
    space: &AddressSpace,
    arena: &Arena,
    hooks: &Hooks,
    set: &ExtentSet,
    new_addr: Option< usize >,
    usable: usize,
    pad: usize,
    alignment: usize,
    zero: &mut bool,
    commit: &mut bool,
    slab: bool
) -> Option< ExtentRef > {
    let extent = recycle_extract( space, arena, set, new_addr, usable, pad, alignment )?;
    let extent = split_off_lead_trail( space, arena, hooks, set, extent, new_addr, usable, pad, alignment )?;

    if *commit && !extent.is_committed() {
        if commit_wrapper( arena, hooks, &extent, 0, extent.size() ).is_err() {
            record( space, arena, hooks, set, extent );
            return None;
        }

        // Freshly committed pages come back zero-filled.
        extent.lock().zeroed = true;
    }

    finish( space, &extent, zero, commit, slab );
    Some( extent )
}

fn recycle_extract(
    space: &AddressSpace,
    arena: &Arena,
    set: &ExtentSet,
    new_addr: Option< usize >,
    usable: usize,
    pad: usize,
    alignment: usize
) -> Option< ExtentRef > {
    let esize = usable.checked_add( pad )?;
    let mut inner = set.lock();

    let extent = if let Some( addr ) = new_addr {
        // An exact-address request either hits the extent based exactly
        // there, owned by this arena, big enough and currently in this
        // set, or it misses; it never hijacks anything else. The state is
        // checked under the set's lock, so out of two racing claimants
        // exactly one sees it and the other falls through.
        match space.lookup( addr ) {
            Some( candidate ) => {
                let guard = candidate.lock();
                let usable_candidate = guard.allocated == addr
                    && guard.arena_ind == arena.ind()
                    && guard.size >= esize
                    && guard.state == set.state();
                drop( guard );

                if usable_candidate { Some( candidate ) } else { None }
            },
            None => None
        }
    } else {
        set.first_best_fit_locked( &inner, esize, alignment )
    };

    let extent = extent?;

    // Claim it while the set's lock is still held, so no concurrent
    // caller can extract the same extent.
    set.remove_locked( &mut inner, &extent );
    extent.lock().state = ExtentState::Active;

    Some( extent )
}

/// Splits the extent into lead + middle + trail, returns the unneeded
/// pieces to the originating set and hands back the aligned middle. On a
/// split failure the unsplittable remainder is abandoned (deregistered,
/// best-effort purged and leaked) — never handed out misaligned, never
/// left for a racing registration to trip over.
fn split_off_lead_trail(
    space: &AddressSpace,
    arena: &Arena,
    hooks: &Hooks,
    set: &ExtentSet,
    extent: ExtentRef,
    new_addr: Option< usize >,
    usable: usize,
    pad: usize,
    alignment: usize
) -> Option< ExtentRef > {
    let esize = usable + pad;
    let (allocated, size) = {
        let guard = extent.lock();
        (guard.allocated, guard.size)
    };

    // The lead is measured from the region's true base; an exact-address
    // request is only ever satisfied in place.
    let leadsize = align_up( allocated, page_ceil( alignment ) ) - allocated;
    debug_assert!( new_addr.map_or( true, |addr| addr == allocated && leadsize == 0 ) );
    debug_assert!( size >= leadsize + esize );
    let trailsize = size - leadsize - esize;

    let mut extent = extent;

    if leadsize != 0 {
        let lead = extent;
        match split_wrapper( space, arena, hooks, &lead, leadsize, leadsize, size - leadsize, usable + trailsize ) {
            Some( rest ) => {
                deactivate( set, &lead );
                extent = rest;
            },
            None => {
                space.deregister( &lead );
                leak( arena, hooks, lead );
                return None;
            }
        }
    }

    if trailsize != 0 {
        match split_wrapper( space, arena, hooks, &extent, esize, usable, trailsize, trailsize ) {
            Some( trail ) => {
                deactivate( set, &trail );
            },
            None => {
                space.deregister( &extent );
                leak( arena, hooks, extent );
                return None;
            }
        }
    } else {
        // Splitting sets the usable size as a side effect; with no trail
        // to split off the bookkeeping is done explicitly.
        extent.lock().usable_size = usable;
    }

    Some( extent )
}

/// Splits one extent in two. The passed extent shrinks to `size_a`; the
/// returned one covers the trailing `size_b` bytes. `None` if the hooks
/// cannot or will not split, in which case nothing has changed.
fn split_wrapper(
    space: &AddressSpace,
    arena: &Arena,
    hooks: &Hooks,
    extent: &ExtentRef,
    size_a: usize,
    usable_a: usize,
    size_b: usize,
    usable_b: usize
) -> Option< ExtentRef > {
    let (allocated, size, serial, state, zeroed, committed) = {
        let guard = extent.lock();
        (guard.allocated, guard.size, guard.serial, guard.state, guard.zeroed, guard.committed)
    };

    debug_assert_eq!( size, size_a + size_b );

    let trail = arena.pool.acquire( Extent::new(
        arena.ind(),
        serial,
        allocated + size_a,
        size_b,
        usable_b,
        state,
        zeroed,
        committed,
        false
    ));

    if let Err( error ) = hooks.split( arena.ind(), allocated, size, size_a, size_b, committed ) {
        debug!( "Hooks refused to split {} byte(s) at 0x{:x}: {}", size, allocated, error );
        arena.pool.release( trail );
        return None;
    }

    space.record_split( extent, &trail, allocated, size_a, size );

    {
        let mut guard = extent.lock();
        guard.size = size_a;
        guard.usable_size = usable_a;
    }

    Some( trail )
}

fn grow_retained(
    space: &AddressSpace,
    arena: &Arena,
    hooks: &Hooks,
    usable: usize,
    pad: usize,
    alignment: usize,
    zero: &mut bool,
    commit: &mut bool,
    slab: bool
) -> Option< ExtentRef > {
    let esize = usable.checked_add( pad )?;
    let min_block = esize.checked_add( page_ceil( alignment.max( PAGE ) ) - PAGE )?;

    // Held across the whole growth, so concurrent growers are serialized
    // and the index only ever moves forward.
    let mut grow_next = arena.lock_grow_next();

    let limit = arena.grow_limit_index();
    let mut grow_index = *grow_next;
    while grow_index <= limit && index_to_size( grow_index ) < min_block {
        grow_index += 1;
    }

    if grow_index > limit {
        // Even the largest allowed block cannot fit this request; fail
        // without touching the OS.
        return None;
    }

    let block_size = index_to_size( grow_index );
    let mut block_zeroed = false;
    let mut block_committed = false;
    let addr = hooks.alloc( arena.ind(), None, block_size, PAGE, &mut block_zeroed, &mut block_committed )?;

    debug!( "Grew the retained pool by {} byte(s) at 0x{:x}", block_size, addr );

    let extent = arena.pool.acquire( Extent::new(
        arena.ind(),
        arena.next_serial(),
        addr,
        block_size,
        0,
        ExtentState::Active,
        block_zeroed,
        block_committed,
        false
    ));

    // Hold the high-water announcement back until the final size is fixed.
    if space.register( &extent, false ).is_err() {
        warn!( "Freshly grown region at 0x{:x} collides with an indexed extent", addr );
        leak( arena, hooks, extent );
        return None;
    }

    let extent = split_off_lead_trail( space, arena, hooks, &arena.retained, extent, None, usable, pad, alignment )?;

    if *commit && !extent.is_committed() {
        if commit_wrapper( arena, hooks, &extent, 0, extent.size() ).is_err() {
            record( space, arena, hooks, &arena.retained, extent );
            return None;
        }

        extent.lock().zeroed = true;
    }

    // Saturating; never regresses.
    *grow_next = (grow_index + 1).min( limit );
    drop( grow_next );

    space.stats.announce_high_water();

    finish( space, &extent, zero, commit, slab );
    Some( extent )
}

/// Common tail of every successful allocation: slab bookkeeping and the
/// in-out flags.
fn finish( space: &AddressSpace, extent: &ExtentRef, zero: &mut bool, commit: &mut bool, slab: bool ) {
    if slab {
        extent.lock().slab = true;
        space.interior_register( extent );
    }

    let mut guard = extent.lock();
    if guard.committed {
        *commit = true;
    }

    if *zero {
        if !guard.zeroed {
            // An uncommitted extent is always known-zeroed, so there is
            // real backing here to clear.
            debug_assert!( guard.committed );
            unsafe {
                std::ptr::write_bytes( guard.allocated as *mut u8, 0, guard.size );
            }
            guard.zeroed = true;
        }
    } else if guard.zeroed {
        *zero = true;
    }
}

/// Returns an extent into a set, folding it into its neighbors first when
/// the set's policy allows.
fn record( space: &AddressSpace, arena: &Arena, hooks: &Hooks, set: &ExtentSet, extent: ExtentRef ) {
    let mut inner = set.lock();

    let was_slab = {
        let mut guard = extent.lock();
        guard.usable_size = 0;
        let was_slab = guard.slab;
        guard.slab = false;
        was_slab
    };

    if was_slab {
        space.interior_deregister( &extent );
    }

    // A missing or foreign entry here means a double free or corrupted
    // bookkeeping, not a recoverable condition.
    debug_assert!(
        space.lookup( extent.allocated() ).map_or( false, |entry| entry.ptr_eq( &extent ) )
    );

    let mut extent = extent;

    if set.coalesces() {
        loop {
            let mut merged = false;

            // Forward: the extent starting right past our end.
            let past_end = {
                let guard = extent.lock();
                guard.past_end()
            };

            if let Some( next ) = space.lookup( past_end ) {
                if can_coalesce( arena, set, &extent, &next ) {
                    set.remove_locked( &mut inner, &next );
                    next.lock().state = ExtentState::Active;

                    // The merge hook may block or reenter; it runs without
                    // the set's lock, and the claim above keeps the
                    // neighbor from being recycled meanwhile.
                    drop( inner );
                    let merge_result = merge_wrapper( space, arena, hooks, &extent, &next );
                    inner = set.lock();

                    match merge_result {
                        Ok( () ) => {
                            arena.pool.release( next );
                            merged = true;
                        },
                        Err( _ ) => {
                            next.lock().state = set.state();
                            set.insert_locked( &mut inner, &next );
                        }
                    }
                }
            }

            // Backward: the extent ending right at our start.
            let start = extent.allocated();
            if start >= PAGE {
                if let Some( prev ) = space.lookup( start - PAGE ) {
                    if can_coalesce( arena, set, &extent, &prev ) {
                        set.remove_locked( &mut inner, &prev );
                        prev.lock().state = ExtentState::Active;

                        drop( inner );
                        let merge_result = merge_wrapper( space, arena, hooks, &prev, &extent );
                        inner = set.lock();

                        match merge_result {
                            Ok( () ) => {
                                arena.pool.release( extent );
                                extent = prev;
                                merged = true;
                            },
                            Err( _ ) => {
                                prev.lock().state = set.state();
                                set.insert_locked( &mut inner, &prev );
                            }
                        }
                    }
                }
            }

            if !merged {
                break;
            }
        }
    }

    extent.lock().state = set.state();
    set.insert_locked( &mut inner, &extent );
}

/// Two extents may fuse only within one arena, one set and one commit
/// state. The candidate's state is read with the set's lock held, so a
/// positive answer cannot go stale before the merge claims it.
fn can_coalesce( arena: &Arena, set: &ExtentSet, extent: &ExtentRef, candidate: &ExtentRef ) -> bool {
    let committed = extent.is_committed();
    let guard = candidate.lock();
    guard.arena_ind == arena.ind() && guard.state == set.state() && guard.committed == committed
}

/// Fuses `b` into `a`. On success `a` covers both regions and `b`'s record
/// is dead (the caller still holds the last handle and must release it);
/// on failure nothing has changed.
fn merge_wrapper( space: &AddressSpace, arena: &Arena, hooks: &Hooks, a: &ExtentRef, b: &ExtentRef ) -> Result< (), HookError > {
    let (a_allocated, a_size, a_serial, a_zeroed, a_committed) = {
        let guard = a.lock();
        (guard.allocated, guard.size, guard.serial, guard.zeroed, guard.committed)
    };
    let (b_allocated, b_size, b_serial, b_zeroed, b_committed) = {
        let guard = b.lock();
        (guard.allocated, guard.size, guard.serial, guard.zeroed, guard.committed)
    };

    debug_assert_eq!( a_allocated + a_size, b_allocated );
    debug_assert_eq!( a_committed, b_committed );

    hooks.merge( arena.ind(), a_allocated, a_size, b_allocated, b_size, a_committed )?;

    space.record_merge( a, a_allocated, a_size, b_size );

    let mut guard = a.lock();
    guard.size = a_size + b_size;
    guard.zeroed = a_zeroed && b_zeroed;
    // The older serial survives, keeping coalescing order stable.
    guard.serial = a_serial.min( b_serial );

    Ok( () )
}

fn deactivate( set: &ExtentSet, extent: &ExtentRef ) {
    let mut inner = set.lock();
    extent.lock().state = set.state();
    set.insert_locked( &mut inner, extent );
}

fn commit_wrapper( arena: &Arena, hooks: &Hooks, extent: &ExtentRef, offset: usize, length: usize ) -> Result< (), HookError > {
    let (addr, size, committed) = {
        let guard = extent.lock();
        (guard.allocated, guard.size, guard.committed)
    };

    let result = hooks.commit( arena.ind(), addr, size, offset, length );

    // Assume committed on success, unchanged otherwise.
    extent.lock().committed = committed || result.is_ok();
    result
}

fn decommit_wrapper( arena: &Arena, hooks: &Hooks, extent: &ExtentRef, offset: usize, length: usize ) -> Result< (), HookError > {
    let (addr, size, committed) = {
        let guard = extent.lock();
        (guard.allocated, guard.size, guard.committed)
    };

    let result = hooks.decommit( arena.ind(), addr, size, offset, length );

    // Assume still committed unless the operation definitely succeeded.
    extent.lock().committed = committed && result.is_err();
    result
}

/// Deliberately abandons a region whose bookkeeping can no longer be
/// completed (e.g. a failed split of a partially handed-out range).
/// Leaking beats the alternatives: the region is already deregistered, so
/// freeing it could race a concurrent claim of the same address range, and
/// handing it out would hand out unsplittable memory. A best-effort purge
/// keeps the abandoned pages from pinning physical memory.
fn leak( arena: &Arena, hooks: &Hooks, extent: ExtentRef ) {
    let (addr, size, committed) = {
        let guard = extent.lock();
        (guard.allocated, guard.size, guard.committed)
    };

    if committed {
        let purged = hooks
            .purge_lazy( arena.ind(), addr, size, 0, size )
            .or_else( |_| hooks.purge_forced( arena.ind(), addr, size, 0, size ) );

        if purged.is_err() {
            debug!( "Could not purge the abandoned region at 0x{:x}", addr );
        }
    }

    warn!( "Abandoning {} byte(s) of mapped memory at 0x{:x}", size, addr );
    arena.pool.release( extent );
}
