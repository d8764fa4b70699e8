//! Error currency for the core: a single negative-code `Errno` shared by
//! every fallible operation, mirroring littlefs's `enum lfs_error` so a
//! caller translating to kernel errno needs no remapping table.

use std::fmt;
use std::io;

use num_enum::IntoPrimitive;
use num_enum::TryFromPrimitive;

/// A POSIX-style negative error code.
///
/// Values are pinned to `examples/original_source/littlefs/lfs.h`'s
/// `enum lfs_error` so the wire/disk format this crate writes needs no
/// translation layer if it is ever read back by the original C engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum Errno {
    /// Error during device operation.
    Io = -5,
    /// Corrupted metadata or media.
    Corrupt = -84,
    /// No such directory entry.
    NoEnt = -2,
    /// Entry already exists.
    Exist = -17,
    /// Entry is not a directory.
    NotDir = -20,
    /// Entry is a directory.
    IsDir = -21,
    /// Directory is not empty.
    NotEmpty = -39,
    /// Bad file handle.
    BadF = -9,
    /// File too large.
    FBig = -27,
    /// Invalid parameter.
    Inval = -22,
    /// No space left on device.
    NoSpc = -28,
    /// Out of memory.
    NoMem = -12,
    /// No such attribute.
    NoAttr = -61,
    /// Name too long.
    NameTooLong = -36,
    /// Object is busy / in use.
    Busy = -16,
    /// Filesystem is read-only.
    RoFs = -30,
}

impl Errno {
    /// Numeric value, matching the original's `enum lfs_error`.
    pub fn code(self) -> i32 {
        self.into()
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Errno::Io => "I/O error",
            Errno::Corrupt => "corrupted filesystem",
            Errno::NoEnt => "no such file or directory",
            Errno::Exist => "file exists",
            Errno::NotDir => "not a directory",
            Errno::IsDir => "is a directory",
            Errno::NotEmpty => "directory not empty",
            Errno::BadF => "bad file descriptor",
            Errno::FBig => "file too large",
            Errno::Inval => "invalid argument",
            Errno::NoSpc => "no space left on device",
            Errno::NoMem => "out of memory",
            Errno::NoAttr => "no such attribute",
            Errno::NameTooLong => "name too long",
            Errno::Busy => "device or resource busy",
            Errno::RoFs => "read-only filesystem",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Errno {}

impl From<io::Error> for Errno {
    /// Block-device failures are reported as `Io` except where the kind
    /// maps cleanly onto a more specific code the core also uses.
    fn from(e: io::Error) -> Self {
        match e.kind() {
            ErrorKindAlias::NotFound => Errno::NoEnt,
            ErrorKindAlias::PermissionDenied => Errno::RoFs,
            ErrorKindAlias::AlreadyExists => Errno::Exist,
            _ => Errno::Io,
        }
    }
}

use io::ErrorKind as ErrorKindAlias;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, Errno>;
