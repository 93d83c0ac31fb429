//! The Block Group Descriptor Table (spec.md §4.3).

use crate::device::Device;
use crate::error::{Error, Result};
use crate::superblock::Superblock;

/// Size in bytes of a single on-disk descriptor.
const ENTRY_SIZE: u64 = 32;

/// One block group's descriptor: where its bitmaps and inode table live,
/// and its free-space counters.
#[derive(Debug, Clone, Copy)]
pub struct BgdtEntry {
    block_bitmap_id: u32,
    inode_bitmap_id: u32,
    inode_table_id: u32,
    num_free_blocks: u16,
    num_free_inodes: u16,
    num_inodes_as_dirs: u16,
}

impl BgdtEntry {
    fn decode(b: &[u8]) -> Self {
        Self {
            block_bitmap_id: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            inode_bitmap_id: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            inode_table_id: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            num_free_blocks: u16::from_le_bytes(b[12..14].try_into().unwrap()),
            num_free_inodes: u16::from_le_bytes(b[14..16].try_into().unwrap()),
            num_inodes_as_dirs: u16::from_le_bytes(b[16..18].try_into().unwrap()),
        }
    }

    pub fn block_bitmap_id(&self) -> u32 {
        self.block_bitmap_id
    }
    pub fn inode_bitmap_id(&self) -> u32 {
        self.inode_bitmap_id
    }
    pub fn inode_table_id(&self) -> u32 {
        self.inode_table_id
    }
    pub fn num_free_blocks(&self) -> u16 {
        self.num_free_blocks
    }
    pub fn num_free_inodes(&self) -> u16 {
        self.num_free_inodes
    }
    pub fn num_inodes_as_dirs(&self) -> u16 {
        self.num_inodes_as_dirs
    }
}

/// The full table of per-group descriptors, plus the machinery to
/// broadcast mutations to every copy-bearing group (spec.md §4.3, §9).
#[derive(Debug, Clone)]
pub struct Bgdt {
    entries: Vec<BgdtEntry>,
    /// Byte offset of the primary table, one block after the primary
    /// superblock's group.
    primary_offset: u64,
    blocks_per_group: u64,
    block_size: u64,
    first_data_block_id: u64,
    copy_locations: Vec<u32>,
    save_copies: bool,
}

impl Bgdt {
    /// Reads the table following `superblock`'s primary copy.
    pub fn read(superblock: &Superblock, device: &mut Device) -> Result<Self> {
        let block_size = superblock.block_size() as u64;
        let blocks_per_group = superblock.blocks_per_group() as u64;
        let first_data_block_id = superblock.first_data_block_id() as u64;
        let primary_offset = block_size * (first_data_block_id + 1);

        let num_groups = superblock.num_block_groups() as usize;
        let table_bytes = (num_groups as u64) * ENTRY_SIZE;
        let raw = device.read(primary_offset, table_bytes as usize)?;
        if raw.len() < table_bytes as usize {
            return Err(Error::BadImage("short BGDT read".into()));
        }

        let entries = (0..num_groups)
            .map(|i| BgdtEntry::decode(&raw[i * ENTRY_SIZE as usize..]))
            .collect();

        Ok(Self {
            entries,
            primary_offset,
            blocks_per_group,
            block_size,
            first_data_block_id,
            copy_locations: superblock.copy_locations().to_vec(),
            save_copies: superblock.save_copies,
        })
    }

    /// Reads the BGDT copy stored in `group` (for integrity comparison
    /// against the primary table).
    pub fn read_copy(superblock: &Superblock, device: &mut Device, group: u32) -> Result<Self> {
        let block_size = superblock.block_size() as u64;
        let blocks_per_group = superblock.blocks_per_group() as u64;
        let first_data_block_id = superblock.first_data_block_id() as u64;
        let base = group as u64 * blocks_per_group * block_size + (first_data_block_id + 1) * block_size;

        let num_groups = superblock.num_block_groups() as usize;
        let table_bytes = (num_groups as u64) * ENTRY_SIZE;
        let raw = device.read(base, table_bytes as usize)?;
        if raw.len() < table_bytes as usize {
            return Err(Error::BadImage("short BGDT copy read".into()));
        }
        let entries = (0..num_groups)
            .map(|i| BgdtEntry::decode(&raw[i * ENTRY_SIZE as usize..]))
            .collect();

        Ok(Self {
            entries,
            primary_offset: base,
            blocks_per_group,
            block_size,
            first_data_block_id,
            copy_locations: superblock.copy_locations().to_vec(),
            save_copies: false,
        })
    }

    pub fn entry(&self, group: u32) -> Result<&BgdtEntry> {
        self.entries.get(group as usize).ok_or(Error::OutOfRange)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &BgdtEntry)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i as u32, e))
    }

    pub fn set_num_free_blocks(
        &mut self,
        device: &mut Device,
        group: u32,
        value: u16,
    ) -> Result<()> {
        let entry = self.entries.get_mut(group as usize).ok_or(Error::OutOfRange)?;
        entry.num_free_blocks = value;
        self.write_field(device, group, 12, &value.to_le_bytes())
    }

    pub fn set_num_free_inodes(
        &mut self,
        device: &mut Device,
        group: u32,
        value: u16,
    ) -> Result<()> {
        let entry = self.entries.get_mut(group as usize).ok_or(Error::OutOfRange)?;
        entry.num_free_inodes = value;
        self.write_field(device, group, 14, &value.to_le_bytes())
    }

    pub fn set_num_inodes_as_dirs(
        &mut self,
        device: &mut Device,
        group: u32,
        value: u16,
    ) -> Result<()> {
        let entry = self.entries.get_mut(group as usize).ok_or(Error::OutOfRange)?;
        entry.num_inodes_as_dirs = value;
        self.write_field(device, group, 16, &value.to_le_bytes())
    }

    /// Writes `bytes` at `field_offset` within group `group`'s descriptor,
    /// in every copy-bearing group's table when `save_copies` is set.
    fn write_field(
        &self,
        device: &mut Device,
        group: u32,
        field_offset: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let entry_offset = group as u64 * ENTRY_SIZE + field_offset;
        if self.save_copies {
            for &copy_group in &self.copy_locations {
                let table_base = copy_group as u64 * self.blocks_per_group * self.block_size
                    + (self.first_data_block_id + 1) * self.block_size;
                device.write(table_base + entry_offset, bytes)?;
            }
        } else {
            device.write(self.primary_offset + entry_offset, bytes)?;
        }
        Ok(())
    }
}
