//! LittleFS metadata/storage engine with a Phoenix-ID overlay.
//!
//! This crate implements the on-disk engine and in-memory adapter layer
//! for a POSIX-style filesystem server: the block device contract, the
//! read/program cache, the tag/pair/gstate codec, the metadata-directory
//! log (fetch/commit/compact/split/relocate), the lookahead block
//! allocator, the inline/CTZ file content engine, the 64-bit persistent
//! file identifier ("PhID") overlay, the object LRU and open-handle
//! table, the post-commit fix-up engine, and the [`fs::Lfs`] POSIX API
//! surface that ties all of it together behind one mutex.
//!
//! What this crate does *not* do: speak an IPC wire protocol, drive an
//! MTD/block-device driver, or interpret the contents of a symlink or
//! device-special file beyond storing them. Those are external
//! concerns left to the embedding server; see `README.md`.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

mod alloc;
mod attr;
pub mod bd;
mod cache;
pub mod config;
mod ctx;
mod dirent;
pub mod error;
mod file;
mod fixup;
pub mod fs;
mod lru;
mod mdir;
mod open_flags;
mod path;
mod phid;
mod tag;

/// In-memory [`bd::BlockDevice`] used by this crate's own tests. Kept
/// reachable (not `#[cfg(test)]`-gated) so integration tests under
/// `tests/` can exercise the engine without reimplementing a fake
/// device of their own.
pub mod testutil;

pub use crate::bd::BlockDevice;
pub use crate::bd::Geometry;
pub use crate::config::DiskVersion;
pub use crate::config::FormatConfig;
pub use crate::config::MountConfig;
pub use crate::config::MountFlags;
pub use crate::dirent::FileType;
pub use crate::error::Errno;
pub use crate::error::Result;
pub use crate::file::OpenFlags;
pub use crate::fs::Dirent;
pub use crate::fs::Lfs;
pub use crate::fs::Oid;
pub use crate::fs::ReaddirPage;
pub use crate::fs::Resolved;
pub use crate::fs::SetAttrReq;
pub use crate::fs::Stat;
pub use crate::fs::StatFs;
pub use crate::fs::translate_open_flags;
pub use crate::phid::Phid;
pub use crate::phid::ROOT_PHID;
