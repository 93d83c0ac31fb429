//! End-to-end scenarios against a hand-built image (spec.md §8).

#[path = "common/mod.rs"]
mod common;

use std::io::Write;

use ext2fs::Ext2Fs;

fn mounted() -> (tempfile::NamedTempFile, Ext2Fs) {
    let image = common::write_temp_image();
    let fs = Ext2Fs::mount(image.path()).expect("mount fixture image");
    (image, fs)
}

#[test]
fn mount_and_scan_reports_clean_root() {
    let (_image, fs) = mounted();
    let report = fs.scan().expect("scan");

    assert_eq!(report.num_directories, 1);
    assert_eq!(report.num_regular_files, 0);
    assert_eq!(report.num_symlinks, 0);
    assert_eq!(report.num_other_files, 0);
    assert_eq!(report.free_blocks_per_group.len(), common::NUM_GROUPS as usize);
    assert_eq!(report.free_inodes_per_group.len(), common::NUM_GROUPS as usize);
}

#[test]
fn path_resolution_handles_dot_and_missing_entries() {
    let (_image, fs) = mounted();
    let root = fs.root_dir().expect("root dir");

    let dot = root.get_file_at(".").expect("resolve .");
    assert_eq!(dot.inode_id(), root.inode_id());

    let err = root.get_file_at("nonexistent").unwrap_err();
    assert!(matches!(err, ext2fs::Error::FileNotFound(_)));
}

#[test]
fn make_directory_then_look_it_up() {
    let (_image, fs) = mounted();
    let root = fs.root_dir().expect("root dir");

    let sub = root
        .make_directory("sub", Some(1000), Some(1000))
        .expect("make_directory");
    assert!(sub.is_directory());
    assert_eq!(sub.uid().unwrap(), 1000);
    assert_eq!(sub.links_count().unwrap(), 2);

    let found = root.get_file_at("sub").expect("lookup sub");
    assert_eq!(found.inode_id(), sub.inode_id());

    let listed: Vec<_> = root
        .files()
        .expect("list root")
        .into_iter()
        .map(|f| f.unwrap().name().to_string())
        .collect();
    assert_eq!(listed, vec![".".to_string(), "..".to_string(), "sub".to_string()]);

    let err = root
        .make_directory("sub", None, None)
        .expect_err("duplicate name must fail");
    assert!(matches!(err, ext2fs::Error::FileAlreadyExists(_)));
}

#[test]
fn directory_files_lists_dot_and_dotdot_first() {
    let (_image, fs) = mounted();
    let root = fs.root_dir().expect("root dir");
    let sub = root.make_directory("sub", None, None).expect("make_directory");

    let listed: Vec<_> = sub
        .files()
        .expect("list sub")
        .into_iter()
        .map(|f| f.unwrap().name().to_string())
        .collect();
    assert_eq!(listed, vec![".".to_string(), "..".to_string()]);
}

#[test]
fn absolute_path_and_block_count_reflect_nesting() {
    let (_image, fs) = mounted();
    let root = fs.root_dir().expect("root dir");
    assert_eq!(root.absolute_path(), "/");

    let a = root.make_directory("a", None, None).expect("make a");
    assert_eq!(a.absolute_path(), "/a");
    let b = a.make_directory("b", None, None).expect("make b");
    assert_eq!(b.absolute_path(), "/a/b");
    let file = b
        .make_regular_file("c.txt", 1000, 1000, None, None, None)
        .expect("make c.txt");
    assert_eq!(file.absolute_path(), "/a/b/c.txt");

    let resolved = root.get_file_at("a/b/c.txt").expect("resolve nested path");
    assert_eq!(resolved.absolute_path(), "/a/b/c.txt");
    assert_eq!(resolved.inode_id(), file.inode_id());
    assert_eq!(resolved.block_count().unwrap(), 0);

    file.write(b"hi").expect("append a byte or two");
    let rewritten = root.get_file_at("a/b/c.txt").expect("resolve again");
    assert_eq!(rewritten.block_count().unwrap(), 1);
}

#[test]
fn make_directory_recurses_into_slash_prefixed_name() {
    let (_image, fs) = mounted();
    let root = fs.root_dir().expect("root dir");
    root.make_directory("a", None, None).expect("make a");

    let b = root.make_directory("a/b", None, None).expect("make a/b");
    assert_eq!(b.absolute_path(), "/a/b");
    assert!(root.get_file_at("a/b").expect("lookup a/b").is_directory());
}

#[test]
fn regular_file_append_and_read_round_trips() {
    let (_image, fs) = mounted();
    let root = fs.root_dir().expect("root dir");

    let file = root
        .make_regular_file("greeting.txt", 1000, 1000, None, None, None)
        .expect("make_regular_file");

    file.write(b"hello, ").expect("first append");
    file.write(b"world").expect("second append");

    assert_eq!(file.size().unwrap(), 12);

    let mut collected = Vec::new();
    for block in file.blocks().expect("blocks") {
        collected.extend_from_slice(&block.expect("read block"));
    }
    assert_eq!(&collected, b"hello, world");
}

#[test]
fn symlink_round_trips_inline_target() {
    let (_image, fs) = mounted();
    let root = fs.root_dir().expect("root dir");

    let link = root
        .make_link("shortcut", "greeting.txt", true)
        .expect("make symlink");
    assert!(link.is_symlink());
    assert_eq!(link.read_link().unwrap(), "greeting.txt");
}

#[test]
fn symlink_round_trips_block_backed_target() {
    let (_image, fs) = mounted();
    let root = fs.root_dir().expect("root dir");

    let long_target = "a".repeat(120);
    let link = root
        .make_link("long-shortcut", &long_target, true)
        .expect("make symlink with long target");
    assert_eq!(link.read_link().unwrap(), long_target);
}

#[test]
fn remove_file_frees_it_from_the_directory() {
    let (_image, fs) = mounted();
    let root = fs.root_dir().expect("root dir");

    let file = root
        .make_regular_file("scratch.txt", 1000, 1000, None, None, None)
        .expect("make_regular_file");
    file.remove(false).expect("remove file");

    let err = root.get_file_at("scratch.txt").unwrap_err();
    assert!(matches!(err, ext2fs::Error::FileNotFound(_)));
}

#[test]
fn remove_nonempty_directory_requires_recursive_flag() {
    let (_image, fs) = mounted();
    let root = fs.root_dir().expect("root dir");

    let sub = root.make_directory("sub", None, None).expect("make_directory");
    sub.make_regular_file("inner.txt", 1000, 1000, None, None, None)
        .expect("make inner file");

    sub.remove(false).expect_err("non-recursive removal of nonempty dir must fail");
    sub.remove(true).expect("recursive removal succeeds");

    let err = root.get_file_at("sub").unwrap_err();
    assert!(matches!(err, ext2fs::Error::FileNotFound(_)));

    let report = fs.check_integrity().expect("check_integrity");
    assert!(
        report.messages.is_empty(),
        "unexpected diagnostics after recursive removal: {:?}",
        report.messages
    );
}

#[test]
fn remove_empty_directory_leaves_no_integrity_diagnostics() {
    let (_image, fs) = mounted();
    let root = fs.root_dir().expect("root dir");

    let sub = root.make_directory("sub", None, None).expect("make_directory");
    sub.remove(false).expect("remove empty directory");

    let report = fs.check_integrity().expect("check_integrity");
    assert!(
        report.messages.is_empty(),
        "unexpected diagnostics after removing an empty directory: {:?}",
        report.messages
    );
}

#[test]
fn check_integrity_on_clean_image_is_silent() {
    let (_image, fs) = mounted();
    let report = fs.check_integrity().expect("check_integrity");

    assert!(report.has_magic_number);
    assert_eq!(report.num_superblock_copies, common::copy_groups().len());
    assert!(
        report.messages.is_empty(),
        "unexpected diagnostics: {:?}",
        report.messages
    );
}

#[test]
fn check_integrity_detects_induced_superblock_mismatch() {
    let mut bytes = common::build_image();
    let group = 3u32;
    assert!(common::copy_groups().contains(&group));
    let offset = common::superblock_offset(group) as usize + 4; // num_blocks field
    bytes[offset] ^= 0xFF;

    let mut image = tempfile::NamedTempFile::new().expect("create temp file");
    image.write_all(&bytes).expect("write corrupted image");
    image.flush().expect("flush corrupted image");

    let fs = Ext2Fs::mount(image.path()).expect("mount despite copy mismatch");
    let report = fs.check_integrity().expect("check_integrity");

    assert!(report
        .messages
        .iter()
        .any(|m| m.contains(&format!("group {group}"))));

    // The primary mount is unaffected by a divergent backup copy.
    assert!(fs.root_dir().is_ok());
}
