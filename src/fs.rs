//! The filesystem façade: lifecycle, allocation, and aggregate diagnostics
//! (spec.md §4.4, §4.8).

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::rc::Rc;

use crate::bgdt::Bgdt;
use crate::bitmap;
use crate::device::Device;
use crate::dirent::{self, DirEntry};
use crate::error::{Error, Result};
use crate::file::{File, FsHandle};
use crate::inode::{self, Inode};
use crate::superblock::{self, Superblock};
use crate::util::now_unix;

/// Per-group free-space counts and aggregate file-type counts produced by
/// [`Ext2Fs::scan`].
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub num_directories: u32,
    pub num_regular_files: u32,
    pub num_symlinks: u32,
    pub num_other_files: u32,
    pub free_blocks_per_group: Vec<u32>,
    pub free_inodes_per_group: Vec<u32>,
}

/// The result of [`Ext2Fs::check_integrity`]: a diagnostic message list,
/// never an error (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub has_magic_number: bool,
    pub num_superblock_copies: usize,
    pub messages: Vec<String>,
}

/// The mounted filesystem's internal state: device handle, superblock,
/// BGDT, and mount validity.
pub(crate) struct Filesystem {
    device: Device,
    superblock: Superblock,
    bgdt: Bgdt,
    valid: bool,
}

/// A mounted ext2 filesystem.
///
/// Cheaply cloneable: clones share the same underlying device and cached
/// metadata via `Rc<RefCell<_>>` (spec.md §5 — single-threaded cooperative
/// access, not true concurrency).
#[derive(Clone)]
pub struct Ext2Fs {
    inner: FsHandle,
}

impl Ext2Fs {
    /// Mounts the ext2 image at `path`: opens the device, parses the
    /// superblock and BGDT, and validates the magic number. Any failure
    /// closes the device and reports [`Error::BadImage`].
    pub fn mount<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut device = Device::new(path);
        device.mount()?;

        let superblock = match Superblock::read(superblock::PRIMARY_OFFSET, &mut device) {
            Ok(sb) => sb,
            Err(e) => {
                let _ = device.unmount();
                return Err(e);
            }
        };
        if !superblock.is_valid_ext2() {
            let _ = device.unmount();
            return Err(Error::BadImage("bad magic number".to_string()));
        }

        let bgdt = match Bgdt::read(&superblock, &mut device) {
            Ok(b) => b,
            Err(e) => {
                let _ = device.unmount();
                return Err(e);
            }
        };

        let mut fs = Filesystem {
            device,
            superblock,
            bgdt,
            valid: true,
        };

        let mounts = fs.superblock.num_mounts_since_check();
        fs.superblock.set_time_last_mount(&mut fs.device, now_unix())?;
        fs.superblock
            .set_num_mounts_since_check(&mut fs.device, mounts.saturating_add(1))?;

        log::debug!(
            "mounted ext2 image: {} inodes, {} blocks, block size {}",
            fs.superblock.num_inodes(),
            fs.superblock.num_blocks(),
            fs.superblock.block_size()
        );

        Ok(Self {
            inner: Rc::new(RefCell::new(fs)),
        })
    }

    /// Flushes and closes the backing device. Fails if other `File`
    /// handles derived from this mount are still alive.
    pub fn unmount(self) -> Result<()> {
        let fs = Rc::try_unwrap(self.inner)
            .map_err(|_| Error::UnsupportedOperation("filesystem still has open file handles"))?;
        let mut fs = fs.into_inner();
        fs.valid = false;
        log::debug!("unmounting ext2 image");
        fs.device.unmount()
    }

    /// Opens the root directory.
    pub fn root_dir(&self) -> Result<File> {
        self.ensure_valid()?;
        File::root(self.inner.clone())
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.inner.borrow().valid {
            Ok(())
        } else {
            Err(Error::BadImage("filesystem is not mounted".to_string()))
        }
    }

    /// BFS from the root, counting directories, regular files, and
    /// symlinks (skipping `.` and `..`); per-group free counts come
    /// directly from the BGDT (spec.md §4.8).
    pub fn scan(&self) -> Result<ScanReport> {
        self.ensure_valid()?;

        let (free_blocks_per_group, free_inodes_per_group) = {
            let fs = self.inner.borrow();
            let mut fb = Vec::new();
            let mut fi = Vec::new();
            for (_, entry) in fs.bgdt.iter() {
                fb.push(entry.num_free_blocks() as u32);
                fi.push(entry.num_free_inodes() as u32);
            }
            (fb, fi)
        };

        let mut report = ScanReport {
            num_directories: 0,
            num_regular_files: 0,
            num_symlinks: 0,
            num_other_files: 0,
            free_blocks_per_group,
            free_inodes_per_group,
        };

        let mut queue = VecDeque::new();
        queue.push_back(self.root_dir()?);
        while let Some(dir) = queue.pop_front() {
            report.num_directories += 1;
            for file in dir.files()? {
                let file = file?;
                if file.name() == "." || file.name() == ".." {
                    continue;
                }
                match &file {
                    File::Directory(_) => queue.push_back(file),
                    File::Regular(_) => report.num_regular_files += 1,
                    File::Symlink(_) => report.num_symlinks += 1,
                    File::Other(_) => report.num_other_files += 1,
                }
            }
        }

        Ok(report)
    }

    /// Validates the redundant superblock/BGDT copies and the directory
    /// tree against the allocation bitmaps (spec.md §4.8). Never fails;
    /// all findings are diagnostic messages.
    pub fn check_integrity(&self) -> Result<IntegrityReport> {
        self.ensure_valid()?;
        let mut messages = Vec::new();

        let (primary, copy_groups, has_magic_number) = {
            let fs = self.inner.borrow();
            (
                fs.superblock.clone(),
                fs.superblock.copy_locations().to_vec(),
                fs.superblock.is_valid_ext2(),
            )
        };

        for &group in &copy_groups {
            if group == 0 {
                continue;
            }
            let mut fs = self.inner.borrow_mut();
            let sb_offset = superblock::PRIMARY_OFFSET
                + group as u64 * primary.blocks_per_group() as u64 * primary.block_size() as u64;
            match Superblock::read(sb_offset, &mut fs.device) {
                Ok(copy) => compare_superblocks(&primary, &copy, group, &mut messages),
                Err(_) => messages.push(format!("group {group}: superblock copy unreadable")),
            }
            match Bgdt::read_copy(&primary, &mut fs.device, group) {
                Ok(copy_bgdt) => compare_bgdt(&fs.bgdt, &copy_bgdt, group, &mut messages),
                Err(_) => messages.push(format!("group {group}: BGDT copy unreadable")),
            }
        }

        let (used_inodes, used_blocks) = {
            let mut fs = self.inner.borrow_mut();
            let mut used_inodes = HashSet::new();
            let mut used_blocks = HashSet::new();
            let ipg = fs.superblock.inodes_per_group();
            let bpg = fs.superblock.blocks_per_group();
            let fdb = fs.superblock.first_data_block_id();
            let bs = fs.superblock.block_size();
            let groups: Vec<(u32, u32, u32)> = fs
                .bgdt
                .iter()
                .map(|(g, e)| (g, e.inode_bitmap_id(), e.block_bitmap_id()))
                .collect();
            for (group, inode_bitmap_id, block_bitmap_id) in groups {
                let ibm = fs.device.read(inode_bitmap_id as u64 * bs as u64, bs as usize)?;
                for bit in 0..ipg {
                    if bitmap::test(&ibm, bit) {
                        used_inodes.insert(group * ipg + bit + 1);
                    }
                }
                let bbm = fs.device.read(block_bitmap_id as u64 * bs as u64, bs as usize)?;
                for bit in 0..bpg {
                    if bitmap::test(&bbm, bit) {
                        used_blocks.insert(group * bpg + fdb + bit);
                    }
                }
            }
            (used_inodes, used_blocks)
        };

        let mut reached_inodes: HashSet<u32> = HashSet::new();
        let mut block_owner: HashMap<u32, String> = HashMap::new();
        let mut queue = VecDeque::new();
        let root = self.root_dir()?;
        reached_inodes.insert(root.inode_id());
        queue.push_back((root, "/".to_string()));

        while let Some((dir, dir_path)) = queue.pop_front() {
            for file in dir.files()? {
                let file = file?;
                if file.name() == "." || file.name() == ".." {
                    continue;
                }
                let path = if dir_path == "/" {
                    format!("/{}", file.name())
                } else {
                    format!("{dir_path}/{}", file.name())
                };
                reached_inodes.insert(file.inode_id());
                if !used_inodes.contains(&file.inode_id()) {
                    messages.push(format!(
                        "entry {path} references inode {} that is not marked used",
                        file.inode_id()
                    ));
                }

                let fast_symlink = file.is_symlink() && file.size()? <= 60;
                if !fast_symlink {
                    for block in file.used_blocks()? {
                        if !used_blocks.contains(&block) {
                            messages.push(format!(
                                "block {block} referenced by {path} but not marked used"
                            ));
                        }
                        if let Some(owner) = block_owner.get(&block) {
                            messages.push(format!(
                                "block {block} referenced by both {owner} and {path}"
                            ));
                        } else {
                            block_owner.insert(block, path.clone());
                        }
                    }
                }

                if file.is_directory() {
                    queue.push_back((file, path));
                }
            }
        }

        for inode_id in used_inodes.difference(&reached_inodes) {
            messages.push(format!(
                "inode {inode_id} is marked used but not reachable from the root"
            ));
        }

        Ok(IntegrityReport {
            has_magic_number,
            num_superblock_copies: copy_groups.len(),
            messages,
        })
    }
}

fn compare_superblocks(primary: &Superblock, copy: &Superblock, group: u32, out: &mut Vec<String>) {
    macro_rules! cmp {
        ($field:ident) => {
            if primary.$field() != copy.$field() {
                out.push(format!(
                    "group {group}: superblock field `{}` diverges (primary {:?}, copy {:?})",
                    stringify!($field),
                    primary.$field(),
                    copy.$field()
                ));
            }
        };
    }
    cmp!(num_inodes);
    cmp!(num_blocks);
    cmp!(num_reserved_blocks);
    cmp!(first_data_block_id);
    cmp!(block_size);
    cmp!(blocks_per_group);
    cmp!(inodes_per_group);
    cmp!(magic_number);
    cmp!(revision_major);
    cmp!(revision_minor);
}

fn compare_bgdt(primary: &Bgdt, copy: &Bgdt, group: u32, out: &mut Vec<String>) {
    if primary.len() != copy.len() {
        out.push(format!(
            "group {group}: BGDT copy has {} entries, primary has {}",
            copy.len(),
            primary.len()
        ));
        return;
    }
    for (g, entry) in primary.iter() {
        let copy_entry = match copy.entry(g) {
            Ok(e) => e,
            Err(_) => continue,
        };
        if entry.block_bitmap_id() != copy_entry.block_bitmap_id()
            || entry.inode_bitmap_id() != copy_entry.inode_bitmap_id()
            || entry.inode_table_id() != copy_entry.inode_table_id()
            || entry.num_free_blocks() != copy_entry.num_free_blocks()
            || entry.num_free_inodes() != copy_entry.num_free_inodes()
            || entry.num_inodes_as_dirs() != copy_entry.num_inodes_as_dirs()
        {
            out.push(format!(
                "group {group}: BGDT entry for block group {g} diverges from copy at group {group}"
            ));
        }
    }
}

impl Filesystem {
    pub(crate) fn block_size(&self) -> u32 {
        self.superblock.block_size()
    }

    pub(crate) fn read_inode(&mut self, id: u32) -> Result<Inode> {
        let ipg = self.superblock.inodes_per_group();
        if id == 0 || ipg == 0 {
            return Err(Error::OutOfRange);
        }
        let group = (id - 1) / ipg;
        let index_in_group = (id - 1) % ipg;
        let entry = *self.bgdt.entry(group)?;
        let inode_size = self.superblock.inode_size() as u64;
        let offset =
            entry.inode_table_id() as u64 * self.block_size() as u64 + index_in_group as u64 * inode_size;
        Inode::read(id, offset, self.superblock.inode_size(), &mut self.device)
    }

    pub(crate) fn lookup_block(&mut self, inode: &Inode, index: u64) -> Result<u32> {
        inode.lookup_block(index, self.superblock.block_size(), &mut self.device)
    }

    pub(crate) fn used_blocks(&mut self, inode: &Inode) -> Result<Vec<u32>> {
        inode.used_blocks(self.superblock.block_size(), &mut self.device)
    }

    pub(crate) fn read_data_block(&mut self, block_id: u32) -> Result<Vec<u8>> {
        let bs = self.block_size() as u64;
        self.device.read(block_id as u64 * bs, bs as usize)
    }

    pub(crate) fn read_entries(&mut self, dir_inode: &Inode) -> Result<Vec<DirEntry>> {
        dirent::read_entries(dir_inode, self.superblock.block_size(), &mut self.device)
    }

    fn zero_block(&mut self, block_id: u32) -> Result<()> {
        let bs = self.block_size() as usize;
        self.device
            .write(block_id as u64 * self.block_size() as u64, &vec![0u8; bs])
    }

    pub(crate) fn allocate_block(&mut self) -> Result<u32> {
        let bpg = self.superblock.blocks_per_group();
        let fdb = self.superblock.first_data_block_id();
        let bs = self.block_size();
        for group in 0..self.bgdt.len() as u32 {
            let entry = *self.bgdt.entry(group)?;
            if entry.num_free_blocks() == 0 {
                continue;
            }
            let bitmap_block = entry.block_bitmap_id();
            let mut bm = self.device.read(bitmap_block as u64 * bs as u64, bs as usize)?;
            let Some(bit) = bitmap::find_first_free(&bm) else {
                continue;
            };
            if bit >= bpg {
                continue;
            }
            bitmap::set(&mut bm, bit);
            let byte_index = (bit / 8) as u64;
            self.device
                .write(bitmap_block as u64 * bs as u64 + byte_index, &bm[byte_index as usize..byte_index as usize + 1])?;
            let block_id = group * bpg + fdb + bit;
            let new_free = self.superblock.num_free_blocks() - 1;
            self.superblock.set_num_free_blocks(&mut self.device, new_free)?;
            self.bgdt
                .set_num_free_blocks(&mut self.device, group, entry.num_free_blocks() - 1)?;
            return Ok(block_id);
        }
        Err(Error::NoSpace)
    }

    pub(crate) fn free_block(&mut self, id: u32) -> Result<()> {
        let bpg = self.superblock.blocks_per_group();
        let fdb = self.superblock.first_data_block_id();
        let bs = self.block_size();
        let rel = id - fdb;
        let group = rel / bpg;
        let bit = rel % bpg;
        let entry = *self.bgdt.entry(group)?;
        let bitmap_block = entry.block_bitmap_id();
        let byte_offset = bitmap_block as u64 * bs as u64 + (bit / 8) as u64;
        let mut byte = self.device.read(byte_offset, 1)?;
        bitmap::clear(&mut byte, bit % 8);
        self.device.write(byte_offset, &byte)?;
        let new_free = self.superblock.num_free_blocks() + 1;
        self.superblock.set_num_free_blocks(&mut self.device, new_free)?;
        self.bgdt
            .set_num_free_blocks(&mut self.device, group, entry.num_free_blocks() + 1)
    }

    pub(crate) fn allocate_inode(&mut self, mode: u16, uid: u16, gid: u16) -> Result<Inode> {
        let ipg = self.superblock.inodes_per_group();
        let bs = self.block_size();
        for group in 0..self.bgdt.len() as u32 {
            let entry = *self.bgdt.entry(group)?;
            if entry.num_free_inodes() == 0 {
                continue;
            }
            let bitmap_block = entry.inode_bitmap_id();
            let mut bm = self.device.read(bitmap_block as u64 * bs as u64, bs as usize)?;
            let Some(bit) = bitmap::find_first_free(&bm) else {
                continue;
            };
            if bit >= ipg {
                continue;
            }
            bitmap::set(&mut bm, bit);
            let byte_index = (bit / 8) as u64;
            self.device
                .write(bitmap_block as u64 * bs as u64 + byte_index, &bm[byte_index as usize..byte_index as usize + 1])?;
            let inode_id = group * ipg + bit + 1;
            let new_free = self.superblock.num_free_inodes() - 1;
            self.superblock.set_num_free_inodes(&mut self.device, new_free)?;
            self.bgdt
                .set_num_free_inodes(&mut self.device, group, entry.num_free_inodes() - 1)?;

            let inode_size = self.superblock.inode_size() as u64;
            let offset = entry.inode_table_id() as u64 * bs as u64 + bit as u64 * inode_size;
            let new_inode = Inode::new(inode_id, offset, mode, uid, gid);
            new_inode.write_new(&mut self.device)?;
            return Ok(new_inode);
        }
        Err(Error::NoSpace)
    }

    pub(crate) fn free_inode(&mut self, id: u32) -> Result<()> {
        let ipg = self.superblock.inodes_per_group();
        let bs = self.block_size();
        let rel = id - 1;
        let group = rel / ipg;
        let bit = rel % ipg;
        let entry = *self.bgdt.entry(group)?;
        let bitmap_block = entry.inode_bitmap_id();
        let byte_offset = bitmap_block as u64 * bs as u64 + (bit / 8) as u64;
        let mut byte = self.device.read(byte_offset, 1)?;
        bitmap::clear(&mut byte, bit % 8);
        self.device.write(byte_offset, &byte)?;
        let new_free = self.superblock.num_free_inodes() + 1;
        self.superblock.set_num_free_inodes(&mut self.device, new_free)?;
        self.bgdt
            .set_num_free_inodes(&mut self.device, group, entry.num_free_inodes() + 1)
    }

    pub(crate) fn inc_inodes_as_dirs(&mut self, inode_id: u32, delta: i32) -> Result<()> {
        let ipg = self.superblock.inodes_per_group();
        let group = (inode_id - 1) / ipg;
        let entry = *self.bgdt.entry(group)?;
        let new_count = (entry.num_inodes_as_dirs() as i32 + delta).max(0) as u16;
        self.bgdt.set_num_inodes_as_dirs(&mut self.device, group, new_count)
    }

    /// Appends one directory entry, allocating a new block for it when the
    /// last existing block has no room (spec.md §4.6 "Append").
    pub(crate) fn append_dir_entry(
        &mut self,
        dir_inode: &mut Inode,
        new_inode_id: u32,
        name: &str,
        file_type: u8,
    ) -> Result<()> {
        if name.is_empty() || name.len() >= 256 {
            return Err(Error::UnsupportedOperation("invalid directory entry name"));
        }
        let bs = self.superblock.block_size();
        let entries = self.read_entries(dir_inode)?;
        let new_size = dirent::entry_size(name.len());

        if let Some(last) = entries.last() {
            let candidate = last.offset + last.natural_size();
            if candidate as u32 + new_size as u32 <= bs {
                dirent::set_rec_len(&mut self.device, last.block_id, bs, last.offset, last.natural_size())?;
                let rec_len = bs as u16 - candidate;
                dirent::write_entry(&mut self.device, last.block_id, bs, candidate, new_inode_id, name, file_type, rec_len)?;
                return Ok(());
            }

            let block_id = self.allocate_block()?;
            self.zero_block(block_id)?;
            self.lookup_or_assign_block(dir_inode, block_id)?;
            let new_total = dir_inode.size() + bs as u64;
            dir_inode.set_size(&mut self.device, new_total)?;
            dirent::write_entry(&mut self.device, block_id, bs, 0, new_inode_id, name, file_type, bs as u16)?;
            return Ok(());
        }

        if dir_inode.size() > 0 {
            let block_id = self.lookup_block(dir_inode, 0)?;
            dirent::write_entry(&mut self.device, block_id, bs, 0, new_inode_id, name, file_type, bs as u16)?;
            return Ok(());
        }

        let block_id = self.allocate_block()?;
        self.zero_block(block_id)?;
        self.lookup_or_assign_block(dir_inode, block_id)?;
        dir_inode.set_size(&mut self.device, bs as u64)?;
        dirent::write_entry(&mut self.device, block_id, bs, 0, new_inode_id, name, file_type, bs as u16)?;
        Ok(())
    }

    fn lookup_or_assign_block(&mut self, inode: &mut Inode, block_id: u32) -> Result<u64> {
        inode.assign_next_block_id(&mut self.device, block_id)
    }

    /// Appends `data` to the tail of a regular file's content (spec.md
    /// §4.7 "Appending").
    pub(crate) fn append_bytes(&mut self, inode: &mut Inode, data: &[u8]) -> Result<()> {
        let bs = self.superblock.block_size() as u64;
        let mut size = inode.size();
        let mut written = 0usize;

        while written < data.len() {
            let block_index = size / bs;
            let byte_offset = size % bs;
            let existing = inode.lookup_block(block_index, bs as u32, &mut self.device);
            let block_id = match existing {
                Ok(id) if id != 0 => id,
                _ => {
                    let new_block = self.allocate_block()?;
                    self.zero_block(new_block)?;
                    inode.assign_next_block_id(&mut self.device, new_block)?;
                    new_block
                }
            };

            let space = (bs - byte_offset) as usize;
            let chunk_len = space.min(data.len() - written);
            let chunk = &data[written..written + chunk_len];
            self.device.write(block_id as u64 * bs + byte_offset, chunk)?;
            written += chunk_len;
            size += chunk_len as u64;
        }

        inode.set_size(&mut self.device, size)
    }

    pub(crate) fn read_file_bytes(&mut self, inode: &Inode) -> Result<Vec<u8>> {
        let bs = self.superblock.block_size() as u64;
        let size = inode.size();
        let num_blocks = crate::util::ceil_div(size, bs);
        let mut out = Vec::with_capacity(size as usize);
        for i in 0..num_blocks {
            let block_id = inode.lookup_block(i, bs as u32, &mut self.device)?;
            let block = if block_id == 0 {
                vec![0u8; bs as usize]
            } else {
                self.device.read(block_id as u64 * bs, bs as usize)?
            };
            let remaining = size - out.len() as u64;
            let take = remaining.min(bs) as usize;
            out.extend_from_slice(&block[..take]);
        }
        Ok(out)
    }

    pub(crate) fn symlink_target(&mut self, inode: &Inode) -> Result<String> {
        let size = inode.size() as usize;
        let bytes = if size <= 60 {
            inode.inline_data()[..size].to_vec()
        } else {
            self.read_file_bytes(inode)?
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub(crate) fn make_directory(&mut self, parent_id: u32, name: &str, uid: u16, gid: u16) -> Result<u32> {
        if name.is_empty() || name.len() >= 256 || name.contains('/') {
            return Err(Error::UnsupportedOperation("invalid directory name"));
        }
        let mut parent = self.read_inode(parent_id)?;
        let existing = self.read_entries(&parent)?;
        if dirent::find_entry(&existing, name).is_some() {
            return Err(Error::FileAlreadyExists(name.to_string()));
        }

        let mut new_inode = self.allocate_inode(inode::MODE_DIRECTORY | 0o755, uid, gid)?;
        let block_id = self.allocate_block()?;
        self.zero_block(block_id)?;
        new_inode.assign_next_block_id(&mut self.device, block_id)?;
        new_inode.set_size(&mut self.device, self.superblock.block_size() as u64)?;

        self.append_dir_entry(&mut new_inode, new_inode.id(), ".", dirent::FILE_TYPE_DIRECTORY)?;
        self.append_dir_entry(&mut new_inode, parent_id, "..", dirent::FILE_TYPE_DIRECTORY)?;
        new_inode.set_links_count(&mut self.device, 2)?;

        self.append_dir_entry(&mut parent, new_inode.id(), name, dirent::FILE_TYPE_DIRECTORY)?;
        parent.set_links_count(&mut self.device, parent.links_count() + 1)?;

        self.inc_inodes_as_dirs(new_inode.id(), 1)?;
        Ok(new_inode.id())
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn make_regular_file(
        &mut self,
        parent_id: u32,
        name: &str,
        uid: u16,
        gid: u16,
        ctime: Option<u32>,
        mtime: Option<u32>,
        atime: Option<u32>,
    ) -> Result<u32> {
        if name.is_empty() || name.len() >= 256 || name.contains('/') {
            return Err(Error::UnsupportedOperation("invalid file name"));
        }
        let mut parent = self.read_inode(parent_id)?;
        let existing = self.read_entries(&parent)?;
        if dirent::find_entry(&existing, name).is_some() {
            return Err(Error::FileAlreadyExists(name.to_string()));
        }

        let mut new_inode = self.allocate_inode(inode::MODE_REGULAR | 0o644, uid, gid)?;
        self.append_dir_entry(&mut parent, new_inode.id(), name, dirent::FILE_TYPE_REGULAR)?;
        new_inode.set_links_count(&mut self.device, 1)?;
        if let Some(t) = ctime {
            new_inode.set_ctime(&mut self.device, t)?;
        }
        if let Some(t) = mtime {
            new_inode.set_mtime(&mut self.device, t)?;
        }
        if let Some(t) = atime {
            new_inode.set_atime(&mut self.device, t)?;
        }
        Ok(new_inode.id())
    }

    pub(crate) fn make_symlink(
        &mut self,
        parent_id: u32,
        name: &str,
        target: &str,
        uid: u16,
        gid: u16,
    ) -> Result<u32> {
        if name.is_empty() || name.len() >= 256 || name.contains('/') {
            return Err(Error::UnsupportedOperation("invalid symlink name"));
        }
        let mut parent = self.read_inode(parent_id)?;
        let existing = self.read_entries(&parent)?;
        if dirent::find_entry(&existing, name).is_some() {
            return Err(Error::FileAlreadyExists(name.to_string()));
        }

        let mut new_inode = self.allocate_inode(inode::MODE_SYMLINK | 0o777, uid, gid)?;
        let target_bytes = target.as_bytes();
        if target_bytes.len() <= 60 {
            new_inode.set_inline_data(&mut self.device, target_bytes)?;
            new_inode.set_size(&mut self.device, target_bytes.len() as u64)?;
        } else {
            self.append_bytes(&mut new_inode, target_bytes)?;
        }
        self.append_dir_entry(&mut parent, new_inode.id(), name, dirent::FILE_TYPE_SYMLINK)?;
        new_inode.set_links_count(&mut self.device, 1)?;
        Ok(new_inode.id())
    }

    pub(crate) fn make_link(&mut self, parent_id: u32, name: &str, target_inode_id: u32) -> Result<()> {
        let mut parent = self.read_inode(parent_id)?;
        let existing = self.read_entries(&parent)?;
        if dirent::find_entry(&existing, name).is_some() {
            return Err(Error::FileAlreadyExists(name.to_string()));
        }
        let mut target = self.read_inode(target_inode_id)?;
        let file_type = dirent::file_type_for_mode(target.mode());
        self.append_dir_entry(&mut parent, target_inode_id, name, file_type)?;
        let new_links = target.links_count() + 1;
        target.set_links_count(&mut self.device, new_links)
    }

    /// Unlinks `name` from `parent_id`'s directory, freeing the target
    /// inode and its blocks once its link count reaches zero (spec.md
    /// §4.6 "Removal"). `allow_nonempty_dir` bypasses the empty-directory
    /// check for recursive removal, where children are already gone by
    /// the time this runs.
    pub(crate) fn remove_entry(&mut self, parent_id: u32, name: &str, allow_nonempty_dir: bool) -> Result<()> {
        let mut parent = self.read_inode(parent_id)?;
        let entries = self.read_entries(&parent)?;
        let target_entry = dirent::find_entry(&entries, name)
            .cloned()
            .ok_or_else(|| Error::FileNotFound(name.to_string()))?;
        let mut target = self.read_inode(target_entry.inode)?;

        if target.is_directory() && !allow_nonempty_dir {
            let sub_entries = self.read_entries(&target)?;
            let non_trivial = sub_entries.iter().any(|e| e.name != "." && e.name != "..");
            if non_trivial {
                return Err(Error::UnsupportedOperation("directory is not empty"));
            }
        }

        self.unlink_entry(&entries, &target_entry)?;

        // A directory's own "." and the parent's named entry vanish together
        // when it is removed, so both references drop at once; directories
        // cannot carry additional hard links the way regular files can.
        let new_links = if target.is_directory() {
            0
        } else {
            target.links_count().saturating_sub(1)
        };
        target.set_links_count(&mut self.device, new_links)?;
        if target.is_directory() {
            parent.set_links_count(&mut self.device, parent.links_count().saturating_sub(1))?;
        }

        if new_links == 0 {
            let fast_symlink = target.is_symlink() && target.size() <= 60;
            if !fast_symlink {
                for block in self.used_blocks(&target)? {
                    self.free_block(block)?;
                }
            }
            target.set_dtime(&mut self.device, now_unix())?;
            let target_id = target.id();
            let was_dir = target.is_directory();
            self.free_inode(target_id)?;
            if was_dir {
                self.inc_inodes_as_dirs(target_id, -1)?;
            }
        }

        Ok(())
    }

    /// Tombstones `target` within its block: merges its span into the
    /// preceding entry in the same block, or (if it is the first entry in
    /// the block) just zeroes its inode number, leaving `rec_len` so the
    /// chain still walks past it.
    fn unlink_entry(&mut self, entries: &[DirEntry], target: &DirEntry) -> Result<()> {
        let bs = self.superblock.block_size();
        let prev = entries
            .iter()
            .filter(|e| e.block_id == target.block_id && e.offset < target.offset)
            .max_by_key(|e| e.offset);
        match prev {
            Some(p) => {
                let merged = p.rec_len + target.rec_len;
                dirent::set_rec_len(&mut self.device, p.block_id, bs, p.offset, merged)
            }
            None => dirent::clear_entry(&mut self.device, target.block_id, bs, target.offset),
        }
    }
}
