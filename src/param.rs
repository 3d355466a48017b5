//! Tunable constants that mirror the on-disk layout and in-memory table
//! sizes of the reference design this crate reimplements.

/// Sector size, in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Number of slots in the buffer cache.
pub const CACHE_SLOTS: usize = 64;

/// Second-chance budget handed to each cache slot on first touch. A slot
/// is only evicted once its chances have all been spent.
pub const CACHE_CHANCES_INIT: u32 = 1;

/// Direct block pointers stored in each on-disk inode.
pub const DIRECT_BLOCKS: usize = 123;

/// Block pointers held by one indirect (or doubly-indirect first-level)
/// block.
pub const INDIRECT_BLOCKS: usize = 128;

/// Maximum file size in sectors: 123 direct + 128 indirect + 128*128
/// doubly-indirect.
pub const MAX_FILE_SECTORS: usize = DIRECT_BLOCKS + INDIRECT_BLOCKS + INDIRECT_BLOCKS * INDIRECT_BLOCKS;

/// Maximum file size in bytes.
pub const MAX_FILE_SIZE: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

/// Sector holding the free-sector bitmap.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Maximum number of in-memory inodes open at once.
pub const MAX_OPEN_INODES: usize = 50;

/// Maximum length of a full path, in bytes.
pub const MAX_PATH: usize = 512;
