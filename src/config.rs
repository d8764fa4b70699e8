//! Mount configuration (§6 "Mount configuration"), styled after
//! `fuser::MountOption`/`mount_options.rs`: a small validated builder plus
//! a `bitflags` flag set.

use bitflags::bitflags;

use crate::error::Errno;
use crate::error::Result;

bitflags! {
    /// Behavioral flags, mirroring the bitflag-set pattern `fuser` uses
    /// for `InitFlags`/`OpenFlags`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
    pub struct MountFlags: u32 {
        /// Reject every mutating operation with `ROFS` before it reaches
        /// the core (§7 "Read-only mounts reject all mutating ops").
        const READ_ONLY  = 1 << 0;
        /// Maintain ctime on metadata changes.
        const USE_CTIME  = 1 << 1;
        /// Maintain mtime on content changes.
        const USE_MTIME  = 1 << 2;
        /// Maintain atime on reads/opens.
        const USE_ATIME  = 1 << 3;
    }
}

impl Default for MountFlags {
    fn default() -> Self {
        MountFlags::USE_CTIME | MountFlags::USE_MTIME
    }
}

/// Disk format version, gating optional on-disk features (Design Notes §9,
/// "On downgrade... whether to write [FCRC tags] is controlled by a mount
/// knob").
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct DiskVersion {
    pub major: u16,
    pub minor: u16,
}

impl DiskVersion {
    pub const CURRENT: DiskVersion = DiskVersion { major: 2, minor: 1 };
}

/// Mount-time configuration, validated once by [`MountConfig::build`].
#[derive(Clone, Debug)]
pub struct MountConfig {
    pub block_cycles: u32,
    pub metadata_max: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
    pub lookahead_size: u32,
    pub max_cached_objects: usize,
    pub flags: MountFlags,
    pub disk_version: DiskVersion,
    /// Whether to write FCRC tags after each commit (Design Notes §9,
    /// open question 3). Defaults to `true`.
    pub write_fcrc: bool,
}

/// Upper bound on file names, matching the original's `LFS_NAME_MAX`.
pub const DEFAULT_NAME_MAX: u32 = 255;
/// Upper bound on file size, matching the original's `LFS_FILE_MAX`.
pub const DEFAULT_FILE_MAX: u32 = 2_147_483_647;
/// Upper bound on one user attribute, matching the original's `LFS_ATTR_MAX`.
pub const DEFAULT_ATTR_MAX: u32 = 1022;

impl Default for MountConfig {
    fn default() -> Self {
        MountConfig {
            block_cycles: 100,
            metadata_max: 0,
            name_max: DEFAULT_NAME_MAX,
            file_max: DEFAULT_FILE_MAX,
            attr_max: DEFAULT_ATTR_MAX,
            lookahead_size: 16,
            max_cached_objects: 256,
            flags: MountFlags::default(),
            disk_version: DiskVersion::CURRENT,
            write_fcrc: true,
        }
    }
}

impl MountConfig {
    /// Validates the config against a block size, filling in
    /// `metadata_max` when left at 0 (§6: "`metadata_max` (≤ block_size)").
    pub fn build(mut self, block_size: u32) -> Result<MountConfig> {
        if self.block_cycles == 0 {
            // "0 disallowed" (§6).
            return Err(Errno::Inval);
        }
        if self.metadata_max == 0 {
            self.metadata_max = block_size;
        }
        if self.metadata_max > block_size {
            return Err(Errno::Inval);
        }
        if self.lookahead_size == 0 {
            return Err(Errno::Inval);
        }
        Ok(self)
    }

    pub fn read_only(&self) -> bool {
        self.flags.contains(MountFlags::READ_ONLY)
    }

    pub fn use_ctime(&self) -> bool {
        self.flags.contains(MountFlags::USE_CTIME)
    }

    pub fn use_mtime(&self) -> bool {
        self.flags.contains(MountFlags::USE_MTIME)
    }

    pub fn use_atime(&self) -> bool {
        self.flags.contains(MountFlags::USE_ATIME)
    }

    /// Inlining threshold (§3 "File struct"): `min(0x3fe, cache_size,
    /// metadata_max/8)`.
    pub fn inline_max(&self, cache_size: u32) -> u32 {
        0x3fe.min(cache_size).min(self.metadata_max / 8)
    }
}

/// Parameters needed to format a fresh filesystem.
#[derive(Clone, Debug)]
pub struct FormatConfig {
    pub mount: MountConfig,
}
