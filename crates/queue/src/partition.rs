use sha2::{Digest, Sha256};

/// Stable key → partition mapping.
///
/// Must be identical across processes and toolchains: the durable topic log
/// stores messages by partition.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    if partitions <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % partitions as u64) as u32
}
