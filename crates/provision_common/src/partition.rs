//! A/B partition resolution.
//!
//! The DUT boots from one of two kernel/root partition pairs. Given the device
//! path of the currently mounted root (as reported by `rootdev -s`), work out
//! which pair is active and which one the next update must be written to.

use crate::error::{ProvisionError, Result};
use serde::{Deserialize, Serialize};

pub const PARTITION_NUM_KERNEL_A: u32 = 2;
pub const PARTITION_NUM_ROOT_A: u32 = 3;
pub const PARTITION_NUM_KERNEL_B: u32 = 4;
pub const PARTITION_NUM_ROOT_B: u32 = 5;
pub const PARTITION_NUM_MINIOS_A: u32 = 9;
pub const PARTITION_NUM_MINIOS_B: u32 = 10;

/// Kernel/root/mini-OS numbers of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotNumbers {
    pub kernel: u32,
    pub root: u32,
    pub minios: u32,
}

const SLOT_A: SlotNumbers = SlotNumbers {
    kernel: PARTITION_NUM_KERNEL_A,
    root: PARTITION_NUM_ROOT_A,
    minios: PARTITION_NUM_MINIOS_A,
};

const SLOT_B: SlotNumbers = SlotNumbers {
    kernel: PARTITION_NUM_KERNEL_B,
    root: PARTITION_NUM_ROOT_B,
    minios: PARTITION_NUM_MINIOS_B,
};

/// Active/inactive partition layout of a disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionState {
    /// Whole-disk device, e.g. `/dev/nvme0n1`
    pub disk: String,
    /// Separator between disk and partition number: `p` for NVMe/MMC, empty for SCSI
    pub delimiter: String,
    pub active: SlotNumbers,
    pub inactive: SlotNumbers,
}

impl PartitionState {
    /// Device path of partition `num` on this disk.
    pub fn partition(&self, num: u32) -> String {
        format!("{}{}{}", self.disk, self.delimiter, num)
    }

    pub fn active_kernel(&self) -> String {
        self.partition(self.active.kernel)
    }

    pub fn active_root(&self) -> String {
        self.partition(self.active.root)
    }

    pub fn inactive_kernel(&self) -> String {
        self.partition(self.inactive.kernel)
    }

    pub fn inactive_root(&self) -> String {
        self.partition(self.inactive.root)
    }

    pub fn inactive_minios(&self) -> String {
        self.partition(self.inactive.minios)
    }
}

/// Resolve the A/B layout from the device path of the active root partition.
pub fn resolve(root: &str) -> Result<PartitionState> {
    let root = root.trim();
    let prefix = root.trim_end_matches(|c: char| c.is_ascii_digit());
    let suffix = &root[prefix.len()..];

    if prefix.is_empty() || suffix.is_empty() {
        return Err(ProvisionError::InvalidPartitionLayout(format!(
            "{:?} does not end in a partition number",
            root
        )));
    }

    let number: u32 = suffix.parse().map_err(|_| {
        ProvisionError::InvalidPartitionLayout(format!(
            "partition number {:?} of {:?} is out of range",
            suffix, root
        ))
    })?;

    let (active, inactive) = match number {
        PARTITION_NUM_ROOT_A => (SLOT_A, SLOT_B),
        PARTITION_NUM_ROOT_B => (SLOT_B, SLOT_A),
        other => {
            return Err(ProvisionError::InvalidPartitionLayout(format!(
                "unexpected root partition number {} in {:?}, expected {} or {}",
                other, root, PARTITION_NUM_ROOT_A, PARTITION_NUM_ROOT_B
            )))
        }
    };

    // "/dev/nvme0n1p" -> ("/dev/nvme0n1", "p"); "/dev/sda" -> ("/dev/sda", "")
    let (disk, delimiter) = match prefix.strip_suffix('p') {
        Some(disk) if disk.ends_with(|c: char| c.is_ascii_digit()) => (disk, "p"),
        _ => (prefix, ""),
    };

    Ok(PartitionState {
        disk: disk.to_string(),
        delimiter: delimiter.to_string(),
        active,
        inactive,
    })
}
