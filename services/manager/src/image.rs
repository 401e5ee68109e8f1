//! Sparse in-memory block images backing mock replicas and backups.

use std::collections::BTreeMap;

use sha2::{Digest, Sha512};

/// Block granularity for images and checksums.
pub const BLOCK_SIZE: u64 = 4096;

/// A sparse image; unwritten blocks read as zeros.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SparseImage {
    size: u64,
    blocks: BTreeMap<u64, Vec<u8>>,
}

impl SparseImage {
    pub fn new(size: u64) -> Self {
        Self {
            size,
            blocks: BTreeMap::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes actually allocated.
    pub fn allocated(&self) -> u64 {
        self.blocks.len() as u64 * BLOCK_SIZE
    }

    /// Writes `data` at `offset`. Returns false when the range falls outside
    /// the image.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> bool {
        let Some(end) = offset.checked_add(data.len() as u64) else {
            return false;
        };
        if end > self.size {
            return false;
        }

        let mut written = 0usize;
        while written < data.len() {
            let pos = offset + written as u64;
            let index = pos / BLOCK_SIZE;
            let within = (pos % BLOCK_SIZE) as usize;
            let chunk = (BLOCK_SIZE as usize - within).min(data.len() - written);

            let block = self
                .blocks
                .entry(index)
                .or_insert_with(|| vec![0; BLOCK_SIZE as usize]);
            block[within..within + chunk].copy_from_slice(&data[written..written + chunk]);
            written += chunk;
        }
        true
    }

    /// Reads `len` bytes at `offset`, or `None` when out of range.
    pub fn read_at(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len as u64)?;
        if end > self.size {
            return None;
        }

        let mut out = vec![0u8; len];
        let mut read = 0usize;
        while read < len {
            let pos = offset + read as u64;
            let index = pos / BLOCK_SIZE;
            let within = (pos % BLOCK_SIZE) as usize;
            let chunk = (BLOCK_SIZE as usize - within).min(len - read);
            if let Some(block) = self.blocks.get(&index) {
                out[read..read + chunk].copy_from_slice(&block[within..within + chunk]);
            }
            read += chunk;
        }
        Some(out)
    }

    /// Grows or shrinks the image. Shrinking drops blocks past the new end.
    pub fn resize(&mut self, size: u64) {
        if size < self.size {
            let first_dropped = size.div_ceil(BLOCK_SIZE);
            self.blocks.split_off(&first_dropped);
            if size % BLOCK_SIZE != 0 {
                if let Some(last) = self.blocks.get_mut(&(size / BLOCK_SIZE)) {
                    let keep = (size % BLOCK_SIZE) as usize;
                    last[keep..].fill(0);
                }
            }
        }
        self.size = size;
    }

    /// Hex SHA-512 over the whole image, zeros included.
    pub fn checksum(&self) -> String {
        let zeros = vec![0u8; BLOCK_SIZE as usize];
        let mut hasher = Sha512::new();
        let mut pos = 0u64;
        while pos < self.size {
            let index = pos / BLOCK_SIZE;
            let len = (self.size - pos).min(BLOCK_SIZE) as usize;
            match self.blocks.get(&index) {
                Some(block) => hasher.update(&block[..len]),
                None => hasher.update(&zeros[..len]),
            }
            pos += BLOCK_SIZE;
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_spanning_blocks() {
        let mut image = SparseImage::new(4 * BLOCK_SIZE);
        let data: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        let offset = BLOCK_SIZE - 100;
        assert!(image.write_at(offset, &data));
        assert_eq!(image.read_at(offset, data.len()).unwrap(), data);
        assert_eq!(image.allocated(), 2 * BLOCK_SIZE);
    }

    #[test]
    fn test_out_of_range_access() {
        let mut image = SparseImage::new(BLOCK_SIZE);
        assert!(!image.write_at(BLOCK_SIZE - 1, &[1, 2]));
        assert!(image.read_at(BLOCK_SIZE, 1).is_none());
        assert_eq!(image.read_at(0, 4).unwrap(), vec![0; 4]);
    }

    #[test]
    fn test_checksum_ignores_sparseness() {
        let mut written = SparseImage::new(2 * BLOCK_SIZE);
        written.write_at(0, &[0u8; 16]);
        let empty = SparseImage::new(2 * BLOCK_SIZE);
        assert_eq!(written.checksum(), empty.checksum());

        written.write_at(10, b"holdfast");
        assert_ne!(written.checksum(), empty.checksum());
    }

    #[test]
    fn test_shrink_drops_tail() {
        let mut image = SparseImage::new(2 * BLOCK_SIZE);
        image.write_at(BLOCK_SIZE, b"tail");
        image.resize(BLOCK_SIZE);
        image.resize(2 * BLOCK_SIZE);
        assert_eq!(image.read_at(BLOCK_SIZE, 4).unwrap(), vec![0; 4]);
    }
}
