//! Directory entry records and the entry-list walker (spec.md §4.6).

use crate::device::Device;
use crate::error::Result;
use crate::inode::Inode;
use crate::util::ceil_div;

pub const FILE_TYPE_UNKNOWN: u8 = 0;
pub const FILE_TYPE_REGULAR: u8 = 1;
pub const FILE_TYPE_DIRECTORY: u8 = 2;
pub const FILE_TYPE_SYMLINK: u8 = 7;

/// One directory entry, located within its directory's data blocks.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u32,
    pub name: String,
    pub file_type: u8,
    pub block_index: u64,
    pub block_id: u32,
    pub offset: u16,
    pub rec_len: u16,
}

impl DirEntry {
    /// The entry's natural size: header plus name, rounded up to a 4-byte
    /// boundary. May be smaller than `rec_len`, which can extend to the
    /// end of the block to absorb the remainder of free space.
    pub fn natural_size(&self) -> u16 {
        entry_size(self.name.len())
    }
}

/// Minimum on-disk size of an entry: 4-byte inode + 2-byte rec_len +
/// 1-byte name_len + 1-byte file_type.
const HEADER_SIZE: usize = 8;

/// Natural size of an entry with a name of `name_len` bytes: header plus
/// name, rounded up to a 4-byte boundary (spec.md §4.6).
pub fn entry_size(name_len: usize) -> u16 {
    (((HEADER_SIZE + name_len + 3) / 4) * 4) as u16
}

/// Walks `inode`'s data blocks in logical order and flattens every
/// non-deleted entry into a single list.
pub fn read_entries(inode: &Inode, block_size: u32, device: &mut Device) -> Result<Vec<DirEntry>> {
    let mut out = Vec::new();
    let num_blocks = ceil_div(inode.size(), block_size as u64);

    for block_index in 0..num_blocks {
        let block_id = match inode.lookup_block(block_index, block_size, device) {
            Ok(id) if id != 0 => id,
            _ => break,
        };
        let bytes = device.read(block_id as u64 * block_size as u64, block_size as usize)?;

        let mut offset: u16 = 0;
        while (offset as usize) + HEADER_SIZE <= bytes.len() {
            let o = offset as usize;
            let inode_num = u32::from_le_bytes(bytes[o..o + 4].try_into().unwrap());
            let rec_len = u16::from_le_bytes(bytes[o + 4..o + 6].try_into().unwrap());
            let name_len = bytes[o + 6] as usize;
            let file_type = bytes[o + 7];
            if rec_len == 0 {
                break;
            }
            if inode_num != 0 && o + HEADER_SIZE + name_len <= bytes.len() {
                let name = String::from_utf8_lossy(&bytes[o + HEADER_SIZE..o + HEADER_SIZE + name_len])
                    .into_owned();
                out.push(DirEntry {
                    inode: inode_num,
                    name,
                    file_type,
                    block_index,
                    block_id,
                    offset,
                    rec_len,
                });
            }
            offset += rec_len;
        }
    }

    Ok(out)
}

/// Finds the entry named `name`, if present.
pub fn find_entry<'a>(entries: &'a [DirEntry], name: &str) -> Option<&'a DirEntry> {
    entries.iter().find(|e| e.name == name)
}

/// Encodes and writes a full entry record at `offset` within `block_id`.
pub fn write_entry(
    device: &mut Device,
    block_id: u32,
    block_size: u32,
    offset: u16,
    inode: u32,
    name: &str,
    file_type: u8,
    rec_len: u16,
) -> Result<()> {
    let mut buf = vec![0u8; rec_len as usize];
    buf[0..4].copy_from_slice(&inode.to_le_bytes());
    buf[4..6].copy_from_slice(&rec_len.to_le_bytes());
    buf[6] = name.len() as u8;
    buf[7] = file_type;
    buf[HEADER_SIZE..HEADER_SIZE + name.len()].copy_from_slice(name.as_bytes());
    let base = block_id as u64 * block_size as u64 + offset as u64;
    device.write(base, &buf)
}

/// Patches only the 2-byte `rec_len` field of the entry at `offset`.
pub fn set_rec_len(
    device: &mut Device,
    block_id: u32,
    block_size: u32,
    offset: u16,
    rec_len: u16,
) -> Result<()> {
    let base = block_id as u64 * block_size as u64 + offset as u64 + 4;
    device.write(base, &rec_len.to_le_bytes())
}

/// Tombstones the entry at `offset` by zeroing its inode number, leaving
/// `rec_len` untouched so the next entry (if any) remains reachable; the
/// caller is responsible for merging the freed span into a neighbor.
pub fn clear_entry(device: &mut Device, block_id: u32, block_size: u32, offset: u16) -> Result<()> {
    let base = block_id as u64 * block_size as u64 + offset as u64;
    device.write(base, &0u32.to_le_bytes())
}

/// Maps an inode's mode bits to the directory entry's `file_type` byte.
pub fn file_type_for_mode(mode: u16) -> u8 {
    match mode & 0xF000 {
        crate::inode::MODE_DIRECTORY => FILE_TYPE_DIRECTORY,
        crate::inode::MODE_REGULAR => FILE_TYPE_REGULAR,
        crate::inode::MODE_SYMLINK => FILE_TYPE_SYMLINK,
        _ => FILE_TYPE_UNKNOWN,
    }
}
