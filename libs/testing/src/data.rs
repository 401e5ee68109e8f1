//! Random payloads written through a volume's frontend and checked back.

use std::ops::Range;

use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha512};

use crate::client::ManagerClient;
use crate::error::{ClientError, Result};

/// Default payload length for random writes.
pub const DATA_SIZE: usize = 512;

/// Placement attempts before giving up on a crowded volume.
const POS_ATTEMPTS: usize = 1000;

/// Bytes written to a volume and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeData {
    pub pos: u64,
    pub content: Vec<u8>,
    /// SHA-512 of `content`, hex encoded.
    pub checksum: String,
}

impl VolumeData {
    pub fn new(pos: u64, content: Vec<u8>) -> Self {
        let checksum = hex::encode(Sha512::digest(&content));
        Self {
            pos,
            content,
            checksum,
        }
    }

    pub fn range(&self) -> Range<u64> {
        self.pos..self.pos + self.content.len() as u64
    }
}

/// Random printable bytes.
pub fn generate_random_data(len: usize) -> Vec<u8> {
    rand::rng().sample_iter(Alphanumeric).take(len).collect()
}

/// Picks an offset for `len` bytes inside `size` that overlaps none of the
/// ranges in `used`, and records the new range there.
///
/// Callers own `used`; start with an empty vector for an unrelated write.
pub fn generate_random_pos(size: u64, len: u64, used: &mut Vec<Range<u64>>) -> Result<u64> {
    if len == 0 || len > size {
        return Err(ClientError::check(format!(
            "cannot place {len} bytes in a volume of {size}"
        )));
    }
    let mut rng = rand::rng();
    for _ in 0..POS_ATTEMPTS {
        let pos = rng.random_range(0..=size - len);
        let candidate = pos..pos + len;
        if used
            .iter()
            .all(|r| candidate.end <= r.start || r.end <= candidate.start)
        {
            used.push(candidate);
            return Ok(pos);
        }
    }
    Err(ClientError::check(format!(
        "no free range of {len} bytes left after {POS_ATTEMPTS} attempts"
    )))
}

/// Writes [`DATA_SIZE`] random bytes at a random offset.
pub async fn write_volume_random_data(
    client: &ManagerClient,
    name: &str,
    used: &mut Vec<Range<u64>>,
) -> Result<VolumeData> {
    let view = client.volume_get(name).await?;
    let content = generate_random_data(DATA_SIZE);
    let pos = generate_random_pos(view.volume.size, DATA_SIZE as u64, used)?;
    write_volume_data(client, name, VolumeData::new(pos, content)).await
}

pub async fn write_volume_data(
    client: &ManagerClient,
    name: &str,
    data: VolumeData,
) -> Result<VolumeData> {
    client.write(name, data.pos, &data.content).await?;
    Ok(data)
}

/// Reads the range back and compares it with what was written.
pub async fn check_volume_data(client: &ManagerClient, name: &str, data: &VolumeData) -> Result<()> {
    let read = client.read(name, data.pos, data.content.len()).await?;
    if read != data.content {
        return Err(ClientError::check(format!(
            "data of {name} at {} differs from what was written",
            data.pos
        )));
    }
    Ok(())
}

/// SHA-512 over the whole device as computed by the engine.
pub async fn volume_checksum(client: &ManagerClient, name: &str) -> Result<String> {
    client.checksum(name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_random_data_is_printable() {
        let data = generate_random_data(64);
        assert_eq!(data.len(), 64);
        assert!(data.iter().all(u8::is_ascii_alphanumeric));
    }

    #[test]
    fn test_checksum_is_sha512_hex() {
        let data = VolumeData::new(0, b"abc".to_vec());
        assert_eq!(data.checksum.len(), 128);
        assert!(data.checksum.starts_with("ddaf35a1"));
    }

    #[test]
    fn test_pos_rejects_oversized_payload() {
        let mut used = Vec::new();
        assert!(generate_random_pos(10, 11, &mut used).is_err());
        assert!(used.is_empty());
    }

    #[test]
    fn test_pos_fails_on_full_volume() {
        let mut used = vec![0..4096];
        assert!(generate_random_pos(4096, 1, &mut used).is_err());
    }

    proptest! {
        #[test]
        fn placed_ranges_never_overlap(count in 1usize..16, len in 1u64..64) {
            let size = 64 * 1024;
            let mut used = Vec::new();
            for _ in 0..count {
                let pos = generate_random_pos(size, len, &mut used).unwrap();
                prop_assert!(pos + len <= size);
            }
            for (i, a) in used.iter().enumerate() {
                for b in &used[i + 1..] {
                    prop_assert!(a.end <= b.start || b.end <= a.start);
                }
            }
        }
    }
}
