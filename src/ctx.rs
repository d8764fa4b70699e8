//! Borrowed bundle of everything a core operation needs to touch the
//! device: passed by `&mut` through `mdir`/`file`/`phid` so none of them
//! has to own the block device or caches themselves.

use crate::bd::BlockDevice;
use crate::bd::Geometry;
use crate::cache::Caches;
use crate::config::MountConfig;

pub struct Context<'a> {
    pub dev: &'a mut dyn BlockDevice,
    pub caches: &'a mut Caches,
    pub geometry: Geometry,
    pub config: &'a MountConfig,
}
