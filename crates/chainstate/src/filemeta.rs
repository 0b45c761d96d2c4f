//! Per-file statistics for the block files, persisted next to the block index.

use divid_primitives::encoding::{Decoder, Encoder};

pub const LAST_BLOCK_FILE_KEY: &[u8] = b"last_block_file";

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockFileInfo {
    pub blocks: u32,
    /// Bytes used by block records, length prefixes included.
    pub size: u64,
    pub undo_size: u64,
    pub height_first: i32,
    pub height_last: i32,
    pub time_first: u32,
    pub time_last: u32,
}

impl BlockFileInfo {
    pub fn add_block(&mut self, height: i32, time: u32) {
        if self.blocks == 0 || height < self.height_first {
            self.height_first = height;
        }
        if self.blocks == 0 || time < self.time_first {
            self.time_first = time;
        }
        self.blocks += 1;
        self.height_last = self.height_last.max(height);
        self.time_last = self.time_last.max(time);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(40);
        encoder.write_u32_le(self.blocks);
        encoder.write_u64_le(self.size);
        encoder.write_u64_le(self.undo_size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.write_u32_le(self.time_first);
        encoder.write_u32_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let info = Self {
            blocks: decoder.read_u32_le().ok()?,
            size: decoder.read_u64_le().ok()?,
            undo_size: decoder.read_u64_le().ok()?,
            height_first: decoder.read_i32_le().ok()?,
            height_last: decoder.read_i32_le().ok()?,
            time_first: decoder.read_u32_le().ok()?,
            time_last: decoder.read_u32_le().ok()?,
        };
        decoder.is_empty().then_some(info)
    }
}

pub fn block_file_info_key(file_id: u32) -> [u8; 4] {
    file_id.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_block_tracks_ranges() {
        let mut info = BlockFileInfo::default();
        info.add_block(10, 500);
        info.add_block(8, 700);
        info.add_block(12, 600);
        assert_eq!(info.blocks, 3);
        assert_eq!((info.height_first, info.height_last), (8, 12));
        assert_eq!((info.time_first, info.time_last), (500, 700));
        assert_eq!(BlockFileInfo::decode(&info.encode()), Some(info));
        assert_eq!(BlockFileInfo::decode(&[1, 2, 3]), None);
    }
}
