//! Generic data structures for kernel usage.

pub mod handle_allocator;
pub use handle_allocator::HandleAllocator;

mod handle_map;
pub use handle_map::{Handle, HandleMap};

mod arc_swap;
pub use arc_swap::ArcSwap;

mod subtract_ranges;
pub use subtract_ranges::subtract_ranges;

mod ids;
pub use ids::{MapperId, PageId, RegionId, TaskId, ThreadId};
