//! Integration tests exercising the engine across an `unmount`/`mount`
//! boundary, the one scenario the in-crate unit test suites don't reach
//! (they all build and tear down a single mounted session).

use phoenix_lfs::{
    BlockDevice, FileType, FormatConfig, Geometry, Lfs, MountConfig, OpenFlags, Resolved, ROOT_PHID,
};

fn geometry() -> Geometry {
    Geometry {
        block_size: 512,
        read_size: 16,
        prog_size: 16,
        cache_size: 16,
        block_count: 64,
    }
}

fn formatted() -> phoenix_lfs::testutil::RamBlockDevice {
    let mut dev = phoenix_lfs::testutil::RamBlockDevice::new(geometry());
    Lfs::format(&mut dev, &FormatConfig { mount: MountConfig::default() }).unwrap();
    dev
}

#[test]
fn files_and_directories_survive_remount() {
    let dev = formatted();

    let fs = Lfs::mount(Box::new(dev), MountConfig::default()).unwrap();
    let sub = fs.mkdir(ROOT_PHID, b"sub", 0).unwrap();
    let leaf = fs.create(sub, b"leaf.txt", 0, None).unwrap();
    fs.open(leaf, OpenFlags::RDWR).unwrap();
    fs.write(leaf, 0, b"persisted").unwrap();
    fs.close(leaf).unwrap();
    let dev = fs.unmount().unwrap();

    let fs = Lfs::mount(dev, MountConfig::default()).unwrap();
    match fs.lookup(ROOT_PHID, b"sub/leaf.txt").unwrap() {
        Resolved::Entry(p) => {
            fs.open(p, OpenFlags::RDONLY).unwrap();
            let mut buf = [0u8; 9];
            let n = fs.read(p, 0, &mut buf).unwrap();
            fs.close(p).unwrap();
            assert_eq!(n, 9);
            assert_eq!(&buf, b"persisted");
        }
        Resolved::Device(_) => panic!("expected a regular file entry"),
    }
    let st = fs.getattr(sub).unwrap();
    assert_eq!(st.kind, FileType::Dir);
}

#[test]
fn phid_is_stable_across_remount() {
    let dev = formatted();

    let fs = Lfs::mount(Box::new(dev), MountConfig::default()).unwrap();
    let a = fs.create(ROOT_PHID, b"a", 0, None).unwrap();
    let dev = fs.unmount().unwrap();

    let fs = Lfs::mount(dev, MountConfig::default()).unwrap();
    match fs.lookup(ROOT_PHID, b"a").unwrap() {
        Resolved::Entry(p) => assert_eq!(p, a),
        Resolved::Device(_) => panic!("expected a regular file entry"),
    }

    // A PhID allocated after remount must not collide with one handed
    // out before it, which would happen if `last_id` recovery under-shot.
    let b = fs.create(ROOT_PHID, b"b", 0, None).unwrap();
    assert_ne!(a, b);
}

#[test]
fn gc_reclaims_blocks_left_by_unlinked_file() {
    let dev = formatted();
    let fs = Lfs::mount(Box::new(dev), MountConfig::default()).unwrap();

    let big = vec![0xabu8; geometry().block_size as usize * 3];
    let f = fs.create(ROOT_PHID, b"big", 0, None).unwrap();
    fs.open(f, OpenFlags::RDWR).unwrap();
    fs.write(f, 0, &big).unwrap();
    fs.close(f).unwrap();
    fs.unlink(ROOT_PHID, b"big").unwrap();

    let before = fs.statfs().unwrap();
    fs.gc().unwrap();
    let after = fs.statfs().unwrap();
    assert!(after.blocks_used <= before.blocks_used);
}

#[test]
fn grow_increases_usable_capacity_and_persists() {
    let dev = formatted();
    let fs = Lfs::mount(Box::new(dev), MountConfig::default()).unwrap();
    fs.grow(128).unwrap();
    let dev = fs.unmount().unwrap();
    assert_eq!(dev.geometry().block_count, 128);

    let fs = Lfs::mount(dev, MountConfig::default()).unwrap();
    let sf = fs.statfs().unwrap();
    assert_eq!(sf.block_count, 128);
}

#[test]
fn mount_tolerates_a_torn_read_on_one_half_of_the_root_pair() {
    let mut dev = formatted();
    // Root mdir lives in the first block pair; poison one half's first
    // read so `fetch` has to fall back to the other, still-valid half.
    dev.poison(0);

    let fs = Lfs::mount(Box::new(dev), MountConfig::default()).unwrap();
    let _ = fs.create(ROOT_PHID, b"after-torn-read", 0, None).unwrap();
    let dev = fs.unmount().unwrap();

    let fs = Lfs::mount(dev, MountConfig::default()).unwrap();
    match fs.lookup(ROOT_PHID, b"after-torn-read") {
        Ok(Resolved::Entry(_)) => {}
        other => panic!("expected entry to survive the torn read, got {other:?}"),
    }
}
