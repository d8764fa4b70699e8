//! In-memory block device for tests (§1A ambient stack: test tooling).
//!
//! Not behind `#[cfg(test)]` so both the in-module unit tests across the
//! crate and any out-of-crate integration tests under `tests/` can build
//! against it without duplicating a second fake device.

use std::collections::HashSet;

use crate::bd::BlockDevice;
use crate::bd::Geometry;
use crate::error::Errno;
use crate::error::Result;

pub struct RamBlockDevice {
    geometry: Geometry,
    blocks: Vec<Vec<u8>>,
    /// Blocks that should fail their next `read` once, to exercise the
    /// relocate-on-corruption path.
    poisoned: HashSet<u32>,
    read_only: bool,
}

impl RamBlockDevice {
    pub fn new(geometry: Geometry) -> Self {
        let block_count = geometry.block_count as usize;
        RamBlockDevice {
            geometry,
            blocks: vec![vec![0xffu8; geometry.block_size as usize]; block_count],
            poisoned: HashSet::new(),
            read_only: false,
        }
    }

    pub fn read_only_device(geometry: Geometry) -> Self {
        let mut d = RamBlockDevice::new(geometry);
        d.read_only = true;
        d
    }

    /// Makes the next `read` of `block` fail with `Corrupt`, simulating
    /// torn/unreadable media for relocate tests.
    pub fn poison(&mut self, block: u32) {
        self.poisoned.insert(block);
    }
}

impl BlockDevice for RamBlockDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<()> {
        if self.poisoned.remove(&block) {
            return Err(Errno::Corrupt);
        }
        let block = &self.blocks[block as usize];
        let start = off as usize;
        buf.copy_from_slice(&block[start..start + buf.len()]);
        Ok(())
    }

    fn prog(&mut self, block: u32, off: u32, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Errno::RoFs);
        }
        let blk = &mut self.blocks[block as usize];
        let start = off as usize;
        blk[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        if self.read_only {
            return Err(Errno::RoFs);
        }
        self.blocks[block as usize].fill(0xff);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_only(&self) -> bool {
        self.read_only
    }
}
