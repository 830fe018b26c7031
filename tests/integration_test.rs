//! End-to-end layered filesystem scenarios: layer lifecycle, copy-up
//! isolation, tombstones, persistence round trips and block conservation.

use lcfs::device::MemDevice;
use lcfs::fs::Lcfs;
use lcfs::{FileType, FsError, LayerId, MountOptions, OpenFlags, SetAttr, BLOCK_SIZE, ROOT_INO};
use std::sync::Arc;

fn mount_mem(blocks: u64) -> (Arc<MemDevice>, Arc<Lcfs>) {
    let dev = Arc::new(MemDevice::new(blocks));
    let fs = Lcfs::mount(dev.clone(), MountOptions::default()).unwrap();
    (dev, fs)
}

fn remount(dev: &Arc<MemDevice>) -> Arc<Lcfs> {
    Lcfs::mount(dev.clone(), MountOptions::default()).unwrap()
}

/// Non-dot names in a directory, sorted
fn names(fs: &Lcfs, layer: LayerId, ino: u64) -> Vec<String> {
    let fh = fs.opendir(layer, ino).unwrap();
    let mut out: Vec<String> = fs
        .readdir(fh, 0)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .filter(|n| n != "." && n != "..")
        .collect();
    fs.releasedir(fh).unwrap();
    out.sort();
    out
}

fn write_new_file(fs: &Lcfs, layer: LayerId, parent: u64, name: &str, data: &[u8]) -> u64 {
    let (fh, stat) = fs
        .create(layer, parent, name, 0o644, 0, 0, OpenFlags::read_write())
        .unwrap();
    if !data.is_empty() {
        fs.write(fh, 0, data).unwrap();
    }
    fs.release(fh).unwrap();
    stat.ino
}

fn read_file(fs: &Lcfs, layer: LayerId, ino: u64, len: u32) -> Vec<u8> {
    let fh = fs.open(layer, ino, OpenFlags::read_only()).unwrap();
    let data = fs.read(fh, 0, len).unwrap();
    fs.release(fh).unwrap();
    data
}

#[test]
fn s1_create_commit_remount_readdir() {
    let (dev, fs) = mount_mem(1024);
    let l1 = fs.create_layer("l1", None, false).unwrap();
    write_new_file(&fs, l1, ROOT_INO, "a", b"");
    fs.commit_layer("l1").unwrap();
    fs.unmount().unwrap();

    let fs = remount(&dev);
    let l1 = fs.stat_layer("l1").unwrap().id;
    assert_eq!(names(&fs, l1, ROOT_INO), vec!["a".to_string()]);
    let stat = fs.lookup(l1, ROOT_INO, "a").unwrap();
    assert_eq!(stat.size, 0);
    assert_eq!(stat.file_type, FileType::Regular);
    fs.unmount().unwrap();
}

#[test]
fn s2_copy_up_isolates_parent_bytes() {
    let (dev, fs) = mount_mem(1024);
    let l1 = fs.create_layer("l1", None, false).unwrap();
    let ino = write_new_file(&fs, l1, ROOT_INO, "a", b"hello");

    // Branch l2 over l1; l1 freezes.
    let l2 = fs.create_layer("l2", Some("l1"), false).unwrap();
    assert!(fs.stat_layer("l1").unwrap().frozen);
    assert_eq!(read_file(&fs, l2, ino, 64), b"hello");

    // Write in the child; the parent's bytes never move.
    let fh = fs.open(l2, ino, OpenFlags::read_write()).unwrap();
    fs.write(fh, 0, b"WORLD").unwrap();
    fs.release(fh).unwrap();

    assert_eq!(read_file(&fs, l1, ino, 64), b"hello");
    assert_eq!(read_file(&fs, l2, ino, 64), b"WORLD");

    // Same answer from disk.
    fs.commit_layer("l2").unwrap();
    fs.unmount().unwrap();
    let fs = remount(&dev);
    let l1 = fs.stat_layer("l1").unwrap().id;
    let l2 = fs.stat_layer("l2").unwrap().id;
    assert_eq!(read_file(&fs, l1, ino, 64), b"hello");
    assert_eq!(read_file(&fs, l2, ino, 64), b"WORLD");
    fs.unmount().unwrap();
}

#[test]
fn s3_large_file_allocates_contiguously() {
    let (_dev, fs) = mount_mem(1024);
    let before = fs.block_usage();

    let data = vec![0x5au8; 300 * BLOCK_SIZE];
    let ino = write_new_file(&fs, 0, ROOT_INO, "big", &data);
    fs.commit_layer("").unwrap();

    let stat = fs.getattr(0, ino).unwrap();
    assert_eq!(stat.blocks, 300);
    assert_eq!(stat.size, data.len() as u64);

    let after = fs.block_usage();
    assert_eq!(after.file_data, before.file_data + 300);
    assert_eq!(after.accounted(), after.total);

    let got = read_file(&fs, 0, ino, (300 * BLOCK_SIZE) as u32);
    assert!(got == data);
    fs.unmount().unwrap();
}

#[test]
fn s4_wide_directory_scales_and_removes() {
    let (_dev, fs) = mount_mem(16384);
    let d = fs.mkdir(0, ROOT_INO, "d", 0o755, 0, 0).unwrap();
    for i in 0..2048 {
        write_new_file(&fs, 0, d.ino, &format!("f{i:04}"), b"");
    }

    let found = fs.lookup(0, d.ino, "f1234").unwrap();
    assert_eq!(found.file_type, FileType::Regular);

    for i in (0..2048).step_by(2) {
        fs.unlink(0, d.ino, &format!("f{i:04}")).unwrap();
    }
    let listing = names(&fs, 0, d.ino);
    assert_eq!(listing.len(), 1024);
    let expected: Vec<String> = (0..2048)
        .filter(|i| i % 2 == 1)
        .map(|i| format!("f{i:04}"))
        .collect();
    assert_eq!(listing, expected);
    fs.unmount().unwrap();
}

#[test]
fn s5_unlink_in_child_hides_parent_entry() {
    let (dev, fs) = mount_mem(1024);
    let l1 = fs.create_layer("l1", None, false).unwrap();
    let ino = write_new_file(&fs, l1, ROOT_INO, "a", b"payload");
    let l2 = fs.create_layer("l2", Some("l1"), false).unwrap();

    fs.unlink(l2, ROOT_INO, "a").unwrap();
    assert!(names(&fs, l2, ROOT_INO).is_empty());
    assert_eq!(names(&fs, l1, ROOT_INO), vec!["a".to_string()]);
    // The removed clone is authoritative; the walk must not fall through.
    assert_eq!(fs.getattr(l2, ino), Err(FsError::NotFound));
    assert!(fs.getattr(l1, ino).is_ok());

    fs.commit_layer("l2").unwrap();
    fs.unmount().unwrap();
    let fs = remount(&dev);
    let l1 = fs.stat_layer("l1").unwrap().id;
    let l2 = fs.stat_layer("l2").unwrap().id;
    assert!(names(&fs, l2, ROOT_INO).is_empty());
    assert_eq!(names(&fs, l1, ROOT_INO), vec!["a".to_string()]);
    assert_eq!(fs.getattr(l2, ino), Err(FsError::NotFound));
    fs.unmount().unwrap();
}

#[test]
fn s6_xattr_removal_stays_in_child() {
    let (dev, fs) = mount_mem(1024);
    let l1 = fs.create_layer("l1", None, false).unwrap();
    let ino = write_new_file(&fs, l1, ROOT_INO, "a", b"x");
    fs.setxattr(l1, ino, "user.k", b"v").unwrap();

    let l2 = fs.create_layer("l2", Some("l1"), false).unwrap();
    assert_eq!(fs.getxattr(l2, ino, "user.k").unwrap(), b"v");
    fs.removexattr(l2, ino, "user.k").unwrap();

    assert_eq!(fs.getxattr(l1, ino, "user.k").unwrap(), b"v");
    assert_eq!(fs.getxattr(l2, ino, "user.k"), Err(FsError::NotFound));
    assert!(fs.listxattr(l2, ino).unwrap().is_empty());

    fs.commit_layer("l2").unwrap();
    fs.unmount().unwrap();
    let fs = remount(&dev);
    let l1 = fs.stat_layer("l1").unwrap().id;
    let l2 = fs.stat_layer("l2").unwrap().id;
    assert_eq!(fs.getxattr(l1, ino, "user.k").unwrap(), b"v");
    assert_eq!(fs.getxattr(l2, ino, "user.k"), Err(FsError::NotFound));
    fs.unmount().unwrap();
}

#[test]
fn round_trip_preserves_tree_content_xattrs_symlinks() {
    let (dev, fs) = mount_mem(2048);
    let etc = fs.mkdir(0, ROOT_INO, "etc", 0o755, 0, 0).unwrap();
    let passwd = write_new_file(&fs, 0, etc.ino, "passwd", b"root:x:0:0:root:/root:/bin/sh\n");
    fs.setxattr(0, passwd, "user.digest", b"sha256:77af").unwrap();
    fs.symlink(0, ROOT_INO, "bin", "usr/bin", 0, 0).unwrap();

    // A sparse file: one run of data far from the start.
    let hole = write_new_file(&fs, 0, ROOT_INO, "hole", b"");
    let fh = fs.open(0, hole, OpenFlags::read_write()).unwrap();
    fs.write(fh, 2 * BLOCK_SIZE as u64, b"island").unwrap();
    fs.release(fh).unwrap();

    fs.sync_all().unwrap();
    fs.unmount().unwrap();

    let fs = remount(&dev);
    assert_eq!(
        names(&fs, 0, ROOT_INO),
        vec!["bin".to_string(), "etc".to_string(), "hole".to_string()]
    );
    let found = fs.lookup(0, ROOT_INO, "etc").unwrap();
    assert_eq!(found.ino, etc.ino);
    assert_eq!(
        read_file(&fs, 0, passwd, 128),
        b"root:x:0:0:root:/root:/bin/sh\n"
    );
    assert_eq!(fs.getxattr(0, passwd, "user.digest").unwrap(), b"sha256:77af");
    assert_eq!(
        fs.readlink(0, fs.lookup(0, ROOT_INO, "bin").unwrap().ino).unwrap(),
        "usr/bin"
    );

    let data = read_file(&fs, 0, hole, (2 * BLOCK_SIZE + 6) as u32);
    assert!(data[..2 * BLOCK_SIZE].iter().all(|&b| b == 0));
    assert_eq!(&data[2 * BLOCK_SIZE..], b"island");
    fs.unmount().unwrap();
}

#[test]
fn free_blocks_are_conserved_across_operations() {
    let (dev, fs) = mount_mem(4096);
    let check = |fs: &Lcfs| {
        let usage = fs.block_usage();
        assert_eq!(
            usage.accounted(),
            usage.total,
            "leaked or doubly-owned blocks: {usage:?}"
        );
    };
    check(&fs);

    let l1 = fs.create_layer("l1", None, false).unwrap();
    let f1 = write_new_file(&fs, l1, ROOT_INO, "f1", &vec![1u8; 5 * BLOCK_SIZE]);
    write_new_file(&fs, l1, ROOT_INO, "f2", &vec![2u8; 3 * BLOCK_SIZE]);
    fs.commit_layer("l1").unwrap();
    check(&fs);

    let l2 = fs.create_layer("l2", Some("l1"), false).unwrap();
    let fh = fs.open(l2, f1, OpenFlags::read_write()).unwrap();
    fs.write(fh, 0, &vec![9u8; 2 * BLOCK_SIZE]).unwrap();
    fs.release(fh).unwrap();
    fs.unlink(l2, ROOT_INO, "f2").unwrap();
    fs.commit_layer("l2").unwrap();
    check(&fs);

    // Truncation returns blocks.
    let attr = SetAttr {
        size: Some(BLOCK_SIZE as u64),
        ..Default::default()
    };
    fs.setattr(l2, f1, &attr).unwrap();
    fs.commit_layer("l2").unwrap();
    check(&fs);

    // Tearing a layer down returns everything it owned.
    fs.remove_layer("l2").unwrap();
    check(&fs);

    fs.unmount().unwrap();
    let fs = remount(&dev);
    check(&fs);
    fs.unmount().unwrap();
}

#[test]
fn rename_is_atomic_against_concurrent_lookup() {
    let (_dev, fs) = mount_mem(1024);
    let dir = fs.mkdir(0, ROOT_INO, "dir", 0o755, 0, 0).unwrap();
    let ino = write_new_file(&fs, 0, dir.ino, "old", b"x");

    let reader = {
        let fs = fs.clone();
        let dir_ino = dir.ino;
        std::thread::spawn(move || {
            for _ in 0..20_000 {
                match fs.lookup(0, dir_ino, "old") {
                    Ok(stat) => assert_eq!(stat.ino, ino),
                    Err(FsError::NotFound) => {}
                    Err(e) => panic!("torn lookup: {e}"),
                }
            }
        })
    };
    fs.rename(0, dir.ino, "old", dir.ino, "new").unwrap();
    reader.join().unwrap();

    assert_eq!(fs.lookup(0, dir.ino, "new").unwrap().ino, ino);
    assert_eq!(fs.lookup(0, dir.ino, "old"), Err(FsError::NotFound));
    fs.unmount().unwrap();
}

#[test]
fn frozen_and_snapshot_layers_reject_writes() {
    let (_dev, fs) = mount_mem(1024);
    fs.create_layer("l1", None, false).unwrap();
    let l1 = fs.stat_layer("l1").unwrap().id;

    // Base now has a child and is frozen.
    assert_eq!(
        fs.mkdir(0, ROOT_INO, "nope", 0o755, 0, 0).map(|_| ()),
        Err(FsError::ReadOnly)
    );

    let ro = fs.create_layer("ro", Some("l1"), true).unwrap();
    assert!(fs.stat_layer("ro").unwrap().snapshot);
    assert_eq!(
        fs.mkdir(ro, ROOT_INO, "nope", 0o755, 0, 0).map(|_| ()),
        Err(FsError::ReadOnly)
    );
    // l1 is frozen under its snapshot child too.
    assert_eq!(
        fs.mkdir(l1, ROOT_INO, "nope", 0o755, 0, 0).map(|_| ()),
        Err(FsError::ReadOnly)
    );
    fs.unmount().unwrap();
}

#[test]
fn layer_lifecycle_rules() {
    let (_dev, fs) = mount_mem(1024);
    fs.create_layer("l1", None, false).unwrap();
    fs.create_layer("l2", Some("l1"), false).unwrap();

    // A parent with children cannot be removed.
    assert_eq!(fs.remove_layer("l1"), Err(FsError::NotEmpty));
    // Names are unique and the base layer is permanent.
    assert_eq!(fs.create_layer("l2", None, false).err(), Some(FsError::Exists));
    assert_eq!(fs.remove_layer(""), Err(FsError::Invalid));
    assert_eq!(fs.remove_layer("ghost"), Err(FsError::NotFound));

    fs.remove_layer("l2").unwrap();
    // l1 thaws once childless and accepts writes again.
    assert!(!fs.stat_layer("l1").unwrap().frozen);
    let l1 = fs.stat_layer("l1").unwrap().id;
    fs.mkdir(l1, ROOT_INO, "work", 0o755, 0, 0).unwrap();
    fs.remove_layer("l1").unwrap();
    assert_eq!(fs.stat_layer("l1").err(), Some(FsError::NotFound));
    fs.unmount().unwrap();
}

#[test]
fn commit_is_idempotent() {
    let (dev, fs) = mount_mem(1024);
    let l1 = fs.create_layer("l1", None, false).unwrap();
    write_new_file(&fs, l1, ROOT_INO, "a", b"data");

    fs.commit_layer("l1").unwrap();
    let first = fs.block_usage();
    fs.commit_layer("l1").unwrap();
    fs.commit_layer("l1").unwrap();
    let again = fs.block_usage();
    assert_eq!(first.accounted(), again.accounted());
    assert_eq!(first.total, again.total);

    fs.unmount().unwrap();
    let fs = remount(&dev);
    let l1 = fs.stat_layer("l1").unwrap().id;
    assert_eq!(names(&fs, l1, ROOT_INO), vec!["a".to_string()]);
    fs.unmount().unwrap();
}

#[test]
fn deep_layer_chain_resolves_through_ancestors() {
    let (_dev, fs) = mount_mem(2048);
    let l1 = fs.create_layer("l1", None, false).unwrap();
    let ino = write_new_file(&fs, l1, ROOT_INO, "base.conf", b"depth=1");

    let mut parent = "l1".to_string();
    let mut last = l1;
    for depth in 2..=6 {
        let name = format!("l{depth}");
        last = fs.create_layer(&name, Some(&parent), false).unwrap();
        parent = name;
    }
    // The file is visible five layers up without ever being copied.
    assert_eq!(read_file(&fs, last, ino, 64), b"depth=1");
    let before = fs.stats().clones;

    let fh = fs.open(last, ino, OpenFlags::read_write()).unwrap();
    fs.write(fh, 0, b"depth=6").unwrap();
    fs.release(fh).unwrap();
    assert!(fs.stats().clones > before);

    assert_eq!(read_file(&fs, l1, ino, 64), b"depth=1");
    assert_eq!(read_file(&fs, last, ino, 64), b"depth=6");
    fs.unmount().unwrap();
}
