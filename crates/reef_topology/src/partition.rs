//! Key → partition mapping.

use reef_common::error::{ReefError, ReefResult};
use reef_common::types::PartitionId;

/// Map a document key to its partition.
///
/// CRC32 (IEEE polynomial) over the key bytes, top half of the checksum,
/// masked to the partition count. `num_partitions` must be a power of two
/// in 1..=65536. No allocation.
pub fn partition_for_key(key: &[u8], num_partitions: usize) -> ReefResult<PartitionId> {
    if num_partitions == 0 || num_partitions > 65_536 || !num_partitions.is_power_of_two() {
        return Err(ReefError::InvalidConfig(format!(
            "partition count must be a power of two in 1..=65536, got {}",
            num_partitions
        )));
    }
    let crc = crc32fast::hash(key);
    Ok(PartitionId(((crc >> 16) & (num_partitions as u32 - 1)) as u16))
}
