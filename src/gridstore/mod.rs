pub mod coalesce;
pub mod common;
pub mod store;

pub use self::common::{ConstrainedPriorityQueue, GridEntry, MAX_CONTEXTS, MAX_GRIDS_PER_PHRASE};
pub use self::store::MemoryGridStore;
