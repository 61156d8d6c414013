//! Management of extents: contiguous virtual-memory regions backing heap
//! allocations.
//!
//! An arena hands freed regions back here instead of to the OS; they are
//! kept in two tiers (a cache of still-committed regions and a retained
//! pool of stripped ones), coalesced with their neighbors, carved up again
//! on demand and indexed by address so any region can be found from any
//! pointer into it. All OS interaction goes through a per-arena, swappable
//! hook table; the default one is backed by anonymous mappings and,
//! optionally, the program break.

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

mod alloc;
mod arena;
mod dss;
mod extent;
mod extent_set;
mod hooks;
mod index;
mod opt;
mod pages;
mod pool;
mod size_class;
mod stats;

pub use crate::alloc::{alloc, alloc_from_cache, dalloc, dalloc_gap, dalloc_to_cache, evict_from_cache};
pub use crate::arena::{Arena, ArenaConfig};
pub use crate::dss::DssPrecedence;
pub use crate::extent::{ExtentRef, ExtentState};
pub use crate::extent_set::ExtentSet;
pub use crate::hooks::{DefaultExtentHooks, ExtentHooks, HookError, HookResult};
pub use crate::index::AddressSpace;
pub use crate::size_class::{
    index_to_size, quantize_ceil, quantize_floor, size_to_index,
    CLASS_COUNT, LG_PAGE, MAX_CLASS, PAGE
};
pub use crate::stats::{GlobalStats, HighWaterCallback};
