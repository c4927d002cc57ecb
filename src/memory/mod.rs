//! Memory management: physical frame pools, two-level paging with recursive
//! self-mapping, and per-address-space virtual memory pools.

pub mod frames;
pub mod paging;
pub mod vmpool;
