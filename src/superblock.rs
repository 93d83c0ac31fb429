//! The filesystem's authoritative descriptor (spec.md §4.2, §6.1).

use crate::device::Device;
use crate::error::{Error, Result};
use crate::util::now_unix;

/// Offset of the primary superblock from the start of the image.
pub const PRIMARY_OFFSET: u64 = 1024;
/// Size in bytes of the on-disk superblock structure.
const SB_SIZE: usize = 1024;
/// The ext2 magic number.
pub const EXT2_MAGIC: u16 = 0xEF53;

/// Filesystem state, as recorded in the superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Valid,
    Error,
}

/// Action to take when the kernel detects an error (read-only field here;
/// this driver never triggers it).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Continue,
    ReadOnly,
    Panic,
}

/// The OS that created the filesystem; affects OS-dependent inode bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatorOs {
    Linux,
    Hurd,
    Masix,
    FreeBsd,
    Lites,
}

impl CreatorOs {
    fn from_raw(v: u32) -> Self {
        match v {
            1 => CreatorOs::Hurd,
            2 => CreatorOs::Masix,
            3 => CreatorOs::FreeBsd,
            4 => CreatorOs::Lites,
            _ => CreatorOs::Linux,
        }
    }

    fn to_raw(self) -> u32 {
        match self {
            CreatorOs::Linux => 0,
            CreatorOs::Hurd => 1,
            CreatorOs::Masix => 2,
            CreatorOs::FreeBsd => 3,
            CreatorOs::Lites => 4,
        }
    }
}

/// The ext2 superblock: the authoritative filesystem descriptor.
///
/// Mutable fields write through to disk immediately on assignment,
/// replicated to every copy-bearing group when `save_copies` is set
/// (spec.md §4.2, §9 "Redundant copies").
#[derive(Debug, Clone)]
pub struct Superblock {
    /// When `false`, mutations only touch the primary copy. Accelerates
    /// bulk mutations at the cost of temporary divergence, detectable by
    /// `check_integrity`.
    pub save_copies: bool,

    num_inodes: u32,
    num_blocks: u32,
    num_reserved_blocks: u32,
    num_free_blocks: u32,
    num_free_inodes: u32,
    first_data_block_id: u32,
    block_size: u32,
    frag_size: i64,
    blocks_per_group: u32,
    frags_per_group: u32,
    inodes_per_group: u32,
    time_last_mount: u32,
    time_last_write: u32,
    num_mounts_since_check: u16,
    num_mounts_max: u16,
    magic: u16,
    state: State,
    error_action: ErrorAction,
    rev_minor: u16,
    time_last_check: u32,
    time_between_check: u32,
    creator_os: CreatorOs,
    rev_major: u32,
    def_uid_res: u16,
    def_gid_res: u16,

    first_inode_index: u32,
    inode_size: u16,
    superblock_group_nr: u16,
    features_compat: u32,
    features_incompat: u32,
    features_ro_compat: u32,
    volume_id: Vec<u8>,
    volume_name: Vec<u8>,
    last_mount_path: Vec<u8>,
    compression_algorithms: u32,
    prealloc_blocks_file: u8,
    prealloc_blocks_dir: u8,
    journal_uuid: Vec<u8>,
    journal_inode: u32,
    journal_dev: u32,
    last_orphan_inode: u32,
    hash_seeds: [u32; 4],
    default_hash_version: u8,
    default_mount_options: u32,
    first_meta_bgroup_id: u32,

    num_block_groups: u32,
    copy_locations: Vec<u32>,
}

fn rtrim_nul(bytes: &[u8]) -> Vec<u8> {
    let end = bytes.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
    bytes[..end].to_vec()
}

fn u32_at(b: &[u8], o: usize) -> u32 {
    u32::from_le_bytes(b[o..o + 4].try_into().unwrap())
}
fn u16_at(b: &[u8], o: usize) -> u16 {
    u16::from_le_bytes(b[o..o + 2].try_into().unwrap())
}
fn i32_at(b: &[u8], o: usize) -> i32 {
    i32::from_le_bytes(b[o..o + 4].try_into().unwrap())
}

impl Superblock {
    /// Parses the 1024-byte superblock at `byte_offset` of `device`.
    pub fn read(byte_offset: u64, device: &mut Device) -> Result<Self> {
        let b = device.read(byte_offset, SB_SIZE)?;
        if b.len() < SB_SIZE {
            return Err(Error::BadImage("short superblock read".into()));
        }

        let num_inodes = u32_at(&b, 0);
        let num_blocks = u32_at(&b, 4);
        let num_reserved_blocks = u32_at(&b, 8);
        let num_free_blocks = u32_at(&b, 12);
        let num_free_inodes = u32_at(&b, 16);
        let first_data_block_id = u32_at(&b, 20);
        let log_block_size = u32_at(&b, 24);
        let block_size = 1024u32 << log_block_size;
        let log_frag_size = i32_at(&b, 28);
        let frag_size: i64 = if log_frag_size >= 0 {
            1024i64 << log_frag_size
        } else {
            1024i64 >> (-log_frag_size)
        };
        let blocks_per_group = u32_at(&b, 32);
        let frags_per_group = u32_at(&b, 36);
        let inodes_per_group = u32_at(&b, 40);
        let time_last_mount = u32_at(&b, 44);
        let time_last_write = u32_at(&b, 48);
        let num_mounts_since_check = u16_at(&b, 52);
        let num_mounts_max = u16_at(&b, 54);
        let magic = u16_at(&b, 56);
        let state = if u16_at(&b, 58) == 1 {
            State::Valid
        } else {
            State::Error
        };
        let error_action = match u16_at(&b, 60) {
            1 => ErrorAction::Continue,
            2 => ErrorAction::ReadOnly,
            _ => ErrorAction::Panic,
        };
        let rev_minor = u16_at(&b, 62);
        let time_last_check = u32_at(&b, 64);
        let time_between_check = u32_at(&b, 68);
        let creator_os = CreatorOs::from_raw(u32_at(&b, 72));
        let rev_major = u32_at(&b, 76);
        let def_uid_res = u16_at(&b, 80);
        let def_gid_res = u16_at(&b, 82);

        let num_block_groups = if blocks_per_group > 0 {
            crate::util::ceil_div(num_blocks as u64, blocks_per_group as u64) as u32
        } else {
            0
        };

        let (
            first_inode_index,
            inode_size,
            superblock_group_nr,
            features_compat,
            features_incompat,
            features_ro_compat,
            volume_id,
            volume_name,
            last_mount_path,
            compression_algorithms,
            prealloc_blocks_file,
            prealloc_blocks_dir,
            journal_uuid,
            journal_inode,
            journal_dev,
            last_orphan_inode,
            hash_seeds,
            default_hash_version,
            default_mount_options,
            first_meta_bgroup_id,
            copy_locations,
        ) = if rev_major == 0 {
            (
                11u32,
                128u16,
                0u16,
                0u32,
                0u32,
                0u32,
                Vec::new(),
                Vec::new(),
                Vec::new(),
                0u32,
                0u8,
                0u8,
                Vec::new(),
                0u32,
                0u32,
                0u32,
                [0u32; 4],
                0u8,
                0u32,
                0u32,
                (0..num_block_groups).collect(),
            )
        } else {
            let first_inode_index = u32_at(&b, 84);
            let inode_size = u16_at(&b, 88);
            let superblock_group_nr = u16_at(&b, 90);
            let features_compat = u32_at(&b, 92);
            let features_incompat = u32_at(&b, 96);
            let features_ro_compat = u32_at(&b, 100);
            let volume_id = rtrim_nul(&b[104..120]);
            let volume_name = rtrim_nul(&b[120..136]);
            let last_mount_path = rtrim_nul(&b[136..200]);
            let compression_algorithms = u32_at(&b, 200);
            let prealloc_blocks_file = b[204];
            let prealloc_blocks_dir = b[205];
            let journal_uuid = rtrim_nul(&b[208..224]);
            let journal_inode = u32_at(&b, 224);
            let journal_dev = u32_at(&b, 228);
            let last_orphan_inode = u32_at(&b, 232);
            let hash_seeds = [
                u32_at(&b, 236),
                u32_at(&b, 240),
                u32_at(&b, 244),
                u32_at(&b, 248),
            ];
            let default_hash_version = b[252];
            let default_mount_options = u32_at(&b, 256);
            let first_meta_bgroup_id = u32_at(&b, 260);

            let mut copy_locations = vec![0u32];
            if num_block_groups > 1 {
                copy_locations.push(1);
                let mut p3 = 3u32;
                while p3 < num_block_groups {
                    copy_locations.push(p3);
                    p3 *= 3;
                }
                let mut p7 = 7u32;
                while p7 < num_block_groups {
                    copy_locations.push(p7);
                    p7 *= 7;
                }
                copy_locations.sort_unstable();
                copy_locations.dedup();
            }

            (
                first_inode_index,
                inode_size,
                superblock_group_nr,
                features_compat,
                features_incompat,
                features_ro_compat,
                volume_id,
                volume_name,
                last_mount_path,
                compression_algorithms,
                prealloc_blocks_file,
                prealloc_blocks_dir,
                journal_uuid,
                journal_inode,
                journal_dev,
                last_orphan_inode,
                hash_seeds,
                default_hash_version,
                default_mount_options,
                first_meta_bgroup_id,
                copy_locations,
            )
        };

        Ok(Self {
            save_copies: true,
            num_inodes,
            num_blocks,
            num_reserved_blocks,
            num_free_blocks,
            num_free_inodes,
            first_data_block_id,
            block_size,
            frag_size,
            blocks_per_group,
            frags_per_group,
            inodes_per_group,
            time_last_mount,
            time_last_write,
            num_mounts_since_check,
            num_mounts_max,
            magic,
            state,
            error_action,
            rev_minor,
            time_last_check,
            time_between_check,
            creator_os,
            rev_major,
            def_uid_res,
            def_gid_res,
            first_inode_index,
            inode_size,
            superblock_group_nr,
            features_compat,
            features_incompat,
            features_ro_compat,
            volume_id,
            volume_name,
            last_mount_path,
            compression_algorithms,
            prealloc_blocks_file,
            prealloc_blocks_dir,
            journal_uuid,
            journal_inode,
            journal_dev,
            last_orphan_inode,
            hash_seeds,
            default_hash_version,
            default_mount_options,
            first_meta_bgroup_id,
            num_block_groups,
            copy_locations,
        })
    }

    // -- read-only accessors --------------------------------------------

    pub fn num_inodes(&self) -> u32 {
        self.num_inodes
    }
    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }
    pub fn num_reserved_blocks(&self) -> u32 {
        self.num_reserved_blocks
    }
    pub fn first_data_block_id(&self) -> u32 {
        self.first_data_block_id
    }
    pub fn block_size(&self) -> u32 {
        self.block_size
    }
    pub fn frag_size(&self) -> i64 {
        self.frag_size
    }
    pub fn blocks_per_group(&self) -> u32 {
        self.blocks_per_group
    }
    pub fn frags_per_group(&self) -> u32 {
        self.frags_per_group
    }
    pub fn inodes_per_group(&self) -> u32 {
        self.inodes_per_group
    }
    pub fn num_mounts_max(&self) -> u16 {
        self.num_mounts_max
    }
    pub fn magic_number(&self) -> u16 {
        self.magic
    }
    pub fn is_valid_ext2(&self) -> bool {
        self.magic == EXT2_MAGIC
    }
    pub fn error_action(&self) -> ErrorAction {
        self.error_action
    }
    pub fn revision_minor(&self) -> u16 {
        self.rev_minor
    }
    pub fn revision_major(&self) -> u32 {
        self.rev_major
    }
    pub fn time_last_check(&self) -> u32 {
        self.time_last_check
    }
    pub fn check_interval(&self) -> u32 {
        self.time_between_check
    }
    pub fn creator_os(&self) -> CreatorOs {
        self.creator_os
    }
    pub fn default_reserved_uid(&self) -> u16 {
        self.def_uid_res
    }
    pub fn default_reserved_gid(&self) -> u16 {
        self.def_gid_res
    }
    pub fn num_block_groups(&self) -> u32 {
        self.num_block_groups
    }
    pub fn copy_locations(&self) -> &[u32] {
        &self.copy_locations
    }
    pub fn first_inode(&self) -> u32 {
        self.first_inode_index
    }
    pub fn inode_size(&self) -> u16 {
        self.inode_size
    }
    pub fn features_compatible(&self) -> u32 {
        self.features_compat
    }
    pub fn features_incompatible(&self) -> u32 {
        self.features_incompat
    }
    pub fn features_read_only_compatible(&self) -> u32 {
        self.features_ro_compat
    }
    pub fn volume_id(&self) -> &[u8] {
        &self.volume_id
    }
    pub fn last_mount_path(&self) -> &[u8] {
        &self.last_mount_path
    }
    pub fn compression_algorithms(&self) -> u32 {
        self.compression_algorithms
    }
    pub fn num_prealloc_blocks_file(&self) -> u8 {
        self.prealloc_blocks_file
    }
    pub fn num_prealloc_blocks_dir(&self) -> u8 {
        self.prealloc_blocks_dir
    }
    pub fn journal_uuid(&self) -> &[u8] {
        &self.journal_uuid
    }
    pub fn journal_inode(&self) -> u32 {
        self.journal_inode
    }
    pub fn journal_device(&self) -> u32 {
        self.journal_dev
    }
    pub fn last_orphan_inode(&self) -> u32 {
        self.last_orphan_inode
    }
    pub fn hash_seeds(&self) -> [u32; 4] {
        self.hash_seeds
    }
    pub fn default_hash_version(&self) -> u8 {
        self.default_hash_version
    }
    pub fn default_mount_options(&self) -> u32 {
        self.default_mount_options
    }
    pub fn first_meta_block_group(&self) -> u32 {
        self.first_meta_bgroup_id
    }

    // -- mutable accessors -------------------------------------------------

    pub fn num_free_blocks(&self) -> u32 {
        self.num_free_blocks
    }
    pub fn num_free_inodes(&self) -> u32 {
        self.num_free_inodes
    }
    pub fn time_last_mount(&self) -> u32 {
        self.time_last_mount
    }
    pub fn time_last_write(&self) -> u32 {
        self.time_last_write
    }
    pub fn num_mounts_since_check(&self) -> u16 {
        self.num_mounts_since_check
    }
    pub fn state(&self) -> State {
        self.state
    }
    pub fn volume_name(&self) -> &[u8] {
        &self.volume_name
    }

    pub fn set_num_free_blocks(&mut self, device: &mut Device, value: u32) -> Result<()> {
        self.num_free_blocks = value;
        self.write_field(device, 12, &value.to_le_bytes())?;
        self.touch_write_time(device)
    }

    pub fn set_num_free_inodes(&mut self, device: &mut Device, value: u32) -> Result<()> {
        self.num_free_inodes = value;
        self.write_field(device, 16, &value.to_le_bytes())?;
        self.touch_write_time(device)
    }

    pub fn set_time_last_mount(&mut self, device: &mut Device, value: u32) -> Result<()> {
        self.time_last_mount = value;
        self.write_field(device, 44, &value.to_le_bytes())?;
        self.touch_write_time(device)
    }

    pub fn set_time_last_write(&mut self, device: &mut Device, value: u32) -> Result<()> {
        self.time_last_write = value;
        self.write_field(device, 48, &value.to_le_bytes())
    }

    pub fn set_num_mounts_since_check(&mut self, device: &mut Device, value: u16) -> Result<()> {
        self.num_mounts_since_check = value;
        self.write_field(device, 52, &value.to_le_bytes())?;
        self.touch_write_time(device)
    }

    pub fn set_state(&mut self, device: &mut Device, value: State) -> Result<()> {
        self.state = value;
        let raw: u16 = match value {
            State::Valid => 1,
            State::Error => 2,
        };
        self.write_field(device, 58, &raw.to_le_bytes())?;
        self.touch_write_time(device)
    }

    pub fn set_volume_name(&mut self, device: &mut Device, value: &[u8]) -> Result<()> {
        let mut bytes = [0u8; 16];
        let n = value.len().min(16);
        bytes[..n].copy_from_slice(&value[..n]);
        self.volume_name = bytes[..n].to_vec();
        self.write_field(device, 120, &bytes)?;
        self.touch_write_time(device)
    }

    /// Bumps `time_last_write` to now and persists it, without recursing
    /// through a public setter (every other setter calls this directly).
    fn touch_write_time(&mut self, device: &mut Device) -> Result<()> {
        self.time_last_write = now_unix();
        self.write_field(device, 48, &self.time_last_write.to_le_bytes())
    }

    /// Writes `bytes` at `field_offset` within the superblock structure,
    /// broadcasting to every copy-bearing group's copy when `save_copies`
    /// is set.
    ///
    /// Copy `g`'s superblock lives at byte offset
    /// `1024 + g * blocks_per_group * block_size` (matches the reference
    /// implementation; group 0 resolves to the primary offset).
    fn write_field(&self, device: &mut Device, field_offset: u64, bytes: &[u8]) -> Result<()> {
        if self.save_copies {
            for &group in &self.copy_locations {
                let base = PRIMARY_OFFSET
                    + group as u64 * self.blocks_per_group as u64 * self.block_size as u64;
                device.write(base + field_offset, bytes)?;
            }
        } else {
            device.write(PRIMARY_OFFSET + field_offset, bytes)?;
        }
        Ok(())
    }
}
