pub mod attr_index;
pub mod build;
pub mod format;
pub mod inverted;
pub mod kv_index;
pub mod manager;
pub mod time_index;
pub mod token_index;

pub use build::{BuildError, CancelFlag, Indexer};
pub use format::IndexType;
pub use manager::IndexManager;
