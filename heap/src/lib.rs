mod system;
mod store_buffer;
mod freelist;
mod pages;
mod scavenger;
mod marker;
mod heap;

pub use system::{OS_PAGE_SIZE, Protection, map_aligned, map_memory, protect_memory, unmap_memory};
pub use store_buffer::StoreBuffer;
pub use pages::{PageSpaceController, PageType};
pub use scavenger::ScavengeStats;
pub use heap::*;
