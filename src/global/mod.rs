//! Per-user state shared by every prefix: directories and the archive cache.

pub mod cache;
pub mod dirs;

pub use cache::ArchiveCache;
pub use dirs::GlobalDirs;
