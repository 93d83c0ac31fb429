//! Hand-built ext2 image fixture for the integration tests.
//!
//! There is no `mkfs` in this crate (new-filesystem creation is out of
//! scope), so the tests construct a tiny, valid, multi-group image by
//! writing the on-disk structures directly, the same way a reference
//! image would have been produced.

use std::io::Write;
use tempfile::NamedTempFile;

pub const BLOCK_SIZE: u32 = 1024;
pub const BLOCKS_PER_GROUP: u32 = 16;
pub const NUM_GROUPS: u32 = 4;
pub const NUM_BLOCKS: u32 = 64;
pub const INODES_PER_GROUP: u32 = 16;
pub const NUM_INODES: u32 = 64;
pub const INODE_SIZE: u32 = 128;
pub const INODE_TABLE_BLOCKS: u32 = 2;
pub const FIRST_DATA_BLOCK: u32 = 1;

pub struct GroupLayout {
    pub start: u32,
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub data_start: u32,
    pub data_count: u32,
}

pub fn copy_groups() -> Vec<u32> {
    let mut v = vec![0u32, 1];
    let mut p = 3u32;
    while p < NUM_GROUPS {
        v.push(p);
        p *= 3;
    }
    let mut p = 7u32;
    while p < NUM_GROUPS {
        v.push(p);
        p *= 7;
    }
    v.sort_unstable();
    v.dedup();
    v
}

fn group_layout(g: u32, copies: &[u32]) -> GroupLayout {
    let start = FIRST_DATA_BLOCK + g * BLOCKS_PER_GROUP;
    let mut off = 0u32;
    if copies.contains(&g) {
        off += 2;
    }
    let block_bitmap = start + off;
    off += 1;
    let inode_bitmap = start + off;
    off += 1;
    let inode_table = start + off;
    off += INODE_TABLE_BLOCKS;
    let data_start = start + off;
    let data_count = BLOCKS_PER_GROUP - off;
    GroupLayout {
        start,
        block_bitmap,
        inode_bitmap,
        inode_table,
        data_start,
        data_count,
    }
}

fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn set_bit(buf: &mut [u8], bit: u32) {
    buf[(bit / 8) as usize] |= 1 << (bit % 8);
}

fn write_superblock(buf: &mut [u8], group_nr: u16, free_blocks: u32, free_inodes: u32) {
    put_u32(buf, 0, NUM_INODES);
    put_u32(buf, 4, NUM_BLOCKS);
    put_u32(buf, 8, 0);
    put_u32(buf, 12, free_blocks);
    put_u32(buf, 16, free_inodes);
    put_u32(buf, 20, FIRST_DATA_BLOCK);
    put_u32(buf, 24, 0);
    put_u32(buf, 28, 0);
    put_u32(buf, 32, BLOCKS_PER_GROUP);
    put_u32(buf, 36, BLOCKS_PER_GROUP);
    put_u32(buf, 40, INODES_PER_GROUP);
    put_u32(buf, 44, 0);
    put_u32(buf, 48, 0);
    put_u16(buf, 52, 0);
    put_u16(buf, 54, 20);
    put_u16(buf, 56, 0xEF53);
    put_u16(buf, 58, 1);
    put_u16(buf, 60, 1);
    put_u16(buf, 62, 0);
    put_u32(buf, 64, 0);
    put_u32(buf, 68, 0);
    put_u32(buf, 72, 0);
    put_u32(buf, 76, 1);
    put_u16(buf, 80, 0);
    put_u16(buf, 82, 0);
    put_u32(buf, 84, 11);
    put_u16(buf, 88, INODE_SIZE as u16);
    put_u16(buf, 90, group_nr);
}

fn write_bgdt_entry(
    buf: &mut [u8],
    offset: usize,
    l: &GroupLayout,
    free_blocks: u16,
    free_inodes: u16,
    dirs: u16,
) {
    put_u32(buf, offset, l.block_bitmap);
    put_u32(buf, offset + 4, l.inode_bitmap);
    put_u32(buf, offset + 8, l.inode_table);
    put_u16(buf, offset + 12, free_blocks);
    put_u16(buf, offset + 14, free_inodes);
    put_u16(buf, offset + 16, dirs);
}

/// Byte offset of the superblock copy belonging to group `g` (group 0 is
/// the primary).
pub fn superblock_offset(g: u32) -> u64 {
    1024 + g as u64 * BLOCKS_PER_GROUP as u64 * BLOCK_SIZE as u64
}

fn bgdt_offset(g: u32) -> u64 {
    g as u64 * BLOCKS_PER_GROUP as u64 * BLOCK_SIZE as u64 + 2 * BLOCK_SIZE as u64
}

/// Builds a 4-group, 1 KiB-block ext2 image with a root directory
/// containing only `.` and `..`, and returns its raw bytes.
pub fn build_image() -> Vec<u8> {
    let copies = copy_groups();
    let layouts: Vec<GroupLayout> = (0..NUM_GROUPS).map(|g| group_layout(g, &copies)).collect();

    let total_bytes = (1 + NUM_BLOCKS) as usize * BLOCK_SIZE as usize;
    let mut img = vec![0u8; total_bytes];

    let mut free_blocks_per_group = vec![0u32; NUM_GROUPS as usize];
    let mut free_inodes_per_group = vec![0u32; NUM_GROUPS as usize];
    for (g, l) in layouts.iter().enumerate() {
        let data_used_by_root = if g == 0 { 1 } else { 0 };
        free_blocks_per_group[g] = l.data_count - data_used_by_root;
        free_inodes_per_group[g] = if g == 0 {
            INODES_PER_GROUP - 2
        } else {
            INODES_PER_GROUP
        };
    }
    let total_free_blocks: u32 = free_blocks_per_group.iter().sum();
    let total_free_inodes: u32 = free_inodes_per_group.iter().sum();

    let mut sb_buf = [0u8; 1024];
    write_superblock(&mut sb_buf, 0, total_free_blocks, total_free_inodes);
    let primary_off = superblock_offset(0) as usize;
    img[primary_off..primary_off + 1024].copy_from_slice(&sb_buf);
    for &g in &copies {
        if g == 0 {
            continue;
        }
        let mut copy = sb_buf;
        put_u16(&mut copy, 90, g as u16);
        let o = superblock_offset(g) as usize;
        img[o..o + 1024].copy_from_slice(&copy);
    }

    let mut bgdt_buf = vec![0u8; (NUM_GROUPS * 32) as usize];
    for (g, l) in layouts.iter().enumerate() {
        let dirs = if g == 0 { 1 } else { 0 };
        write_bgdt_entry(
            &mut bgdt_buf,
            g * 32,
            l,
            free_blocks_per_group[g] as u16,
            free_inodes_per_group[g] as u16,
            dirs,
        );
    }
    let o = bgdt_offset(0) as usize;
    img[o..o + bgdt_buf.len()].copy_from_slice(&bgdt_buf);
    for &g in &copies {
        if g == 0 {
            continue;
        }
        let o = bgdt_offset(g) as usize;
        img[o..o + bgdt_buf.len()].copy_from_slice(&bgdt_buf);
    }

    for (g, l) in layouts.iter().enumerate() {
        let meta_blocks = l.data_start - l.start;
        let mut bbm = vec![0u8; BLOCK_SIZE as usize];
        for i in 0..meta_blocks {
            set_bit(&mut bbm, i);
        }
        if g == 0 {
            set_bit(&mut bbm, meta_blocks);
        }
        let o = l.block_bitmap as u64 * BLOCK_SIZE as u64;
        img[o as usize..o as usize + BLOCK_SIZE as usize].copy_from_slice(&bbm);

        let mut ibm = vec![0u8; BLOCK_SIZE as usize];
        if g == 0 {
            set_bit(&mut ibm, 0);
            set_bit(&mut ibm, 1);
        }
        let o = l.inode_bitmap as u64 * BLOCK_SIZE as u64;
        img[o as usize..o as usize + BLOCK_SIZE as usize].copy_from_slice(&ibm);
    }

    let root_layout = &layouts[0];
    let root_block = root_layout.data_start;
    let inode_offset = root_layout.inode_table as u64 * BLOCK_SIZE as u64 + INODE_SIZE as u64;
    let mut inode_buf = [0u8; 128];
    put_u16(&mut inode_buf, 0, 0x4000 | 0o755);
    put_u32(&mut inode_buf, 4, BLOCK_SIZE);
    put_u16(&mut inode_buf, 26, 2);
    put_u32(&mut inode_buf, 40, root_block);
    let o = inode_offset as usize;
    img[o..o + 128].copy_from_slice(&inode_buf);

    let mut dir_block = vec![0u8; BLOCK_SIZE as usize];
    put_u32(&mut dir_block, 0, 2);
    put_u16(&mut dir_block, 4, 12);
    dir_block[6] = 1;
    dir_block[7] = 2;
    dir_block[8] = b'.';
    put_u32(&mut dir_block, 12, 2);
    put_u16(&mut dir_block, 16, (BLOCK_SIZE - 12) as u16);
    dir_block[18] = 2;
    dir_block[19] = 2;
    dir_block[20] = b'.';
    dir_block[21] = b'.';
    let o = root_block as u64 * BLOCK_SIZE as u64;
    img[o as usize..o as usize + BLOCK_SIZE as usize].copy_from_slice(&dir_block);

    img
}

/// Writes a fresh copy of the fixture image to a temp file and returns it.
pub fn write_temp_image() -> NamedTempFile {
    let mut f = NamedTempFile::new().expect("create temp file");
    f.write_all(&build_image()).expect("write temp image");
    f.flush().expect("flush temp image");
    f
}
