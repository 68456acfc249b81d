//! C2: append-only segmented storage for a single vault.

pub mod cursor;
pub mod format;
pub mod manager;

pub use cursor::Cursor;
pub use manager::{ChunkManager, FileChunkManager, InlineRotation, MemoryChunkManager};
