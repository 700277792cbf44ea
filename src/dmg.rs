//! On-disk records for Apple Partition Map and HFS+ disk images.
//!
//! These overlays are big-endian on disk regardless of host order. The
//! historical Mac OS Classic image builder that consumed them has been
//! retired; the records are kept because the deploy file formats they
//! describe still exist in the wild and the decoders cost nothing to keep
//! honest. No image-building entry point is exposed.

use crate::layout;

/// `ER`, the driver descriptor record signature at block 0.
pub const DDR_SIGNATURE: u16 = 0x4552;
/// `PM`, the partition map entry signature.
pub const APM_SIGNATURE: u16 = 0x504D;
/// `H+`, the HFS Plus volume header signature.
pub const HFS_PLUS_SIGNATURE: u16 = 0x482B;
pub const HFS_PLUS_VERSION: u16 = 4;

layout! {
    be struct DriverDescriptorRecord {
        pub signature: u16,
        pub block_size: u16,
        pub block_count: u32,
        pub device_type: u16,
        pub device_id: u16,
        pub driver_data: u32,
        pub driver_count: u16,
        pub reserved: [u8; 494],
    }
}

layout! {
    be struct PartitionMapEntry {
        pub signature: u16,
        pub signature_pad: u16,
        pub map_entries: u32,
        pub physical_start: u32,
        pub physical_count: u32,
        pub name: [u8; 32],
        pub partition_type: [u8; 32],
        pub logical_start: u32,
        pub logical_count: u32,
        pub flags: u32,
        pub boot_start: u32,
        pub boot_size: u32,
        pub boot_load_address: u32,
        pub boot_load_address2: u32,
        pub boot_entry: u32,
        pub boot_entry2: u32,
        pub boot_checksum: u32,
        pub processor: [u8; 16],
        pub reserved: [u8; 376],
    }
}

layout! {
    be struct ExtentDescriptor {
        pub start_block: u32,
        pub block_count: u32,
    }
}

layout! {
    be struct ForkData {
        pub logical_size: u64,
        pub clump_size: u32,
        pub total_blocks: u32,
        /// Eight inline [`ExtentDescriptor`]s.
        pub extents: [u8; 64],
    }
}

layout! {
    be struct VolumeHeader {
        pub signature: u16,
        pub version: u16,
        pub attributes: u32,
        pub last_mounted_version: u32,
        pub journal_info_block: u32,
        pub create_date: u32,
        pub modify_date: u32,
        pub backup_date: u32,
        pub checked_date: u32,
        pub file_count: u32,
        pub folder_count: u32,
        pub block_size: u32,
        pub total_blocks: u32,
        pub free_blocks: u32,
        pub next_allocation: u32,
        pub resource_clump_size: u32,
        pub data_clump_size: u32,
        pub next_catalog_id: u32,
        pub write_count: u32,
        pub encodings_bitmap: u64,
        pub finder_info: [u8; 32],
        pub allocation_file: [u8; 80],
        pub extents_file: [u8; 80],
        pub catalog_file: [u8; 80],
        pub attributes_file: [u8; 80],
        pub startup_file: [u8; 80],
    }
}

layout! {
    be struct BTreeNodeDescriptor {
        pub forward_link: u32,
        pub backward_link: u32,
        pub kind: u8,
        pub height: u8,
        pub record_count: u16,
        pub reserved: u16,
    }
}

layout! {
    be struct BTreeHeaderRecord {
        pub tree_depth: u16,
        pub root_node: u32,
        pub leaf_records: u32,
        pub first_leaf_node: u32,
        pub last_leaf_node: u32,
        pub node_size: u16,
        pub max_key_length: u16,
        pub total_nodes: u32,
        pub free_nodes: u32,
        pub reserved1: u16,
        pub clump_size: u32,
        pub btree_type: u8,
        pub key_compare_type: u8,
        pub attributes: u32,
        pub reserved3: [u8; 64],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_records_are_one_sector() {
        assert_eq!(DriverDescriptorRecord::SIZE, 512);
        assert_eq!(PartitionMapEntry::SIZE, 512);
        assert_eq!(VolumeHeader::SIZE, 512);
    }

    #[test]
    fn test_btree_record_sizes() {
        assert_eq!(BTreeNodeDescriptor::SIZE, 14);
        assert_eq!(BTreeHeaderRecord::SIZE, 106);
        assert_eq!(ForkData::SIZE, 80);
        assert_eq!(ExtentDescriptor::SIZE, 8);
    }

    #[test]
    fn test_signatures_serialize_big_endian() {
        let mut entry = PartitionMapEntry::read_from(&[0u8; 512]).unwrap();
        entry.signature = APM_SIGNATURE;
        let bytes = entry.to_bytes();
        assert_eq!(&bytes[..2], b"PM");

        let mut header = VolumeHeader::read_from(&[0u8; 512]).unwrap();
        header.signature = HFS_PLUS_SIGNATURE;
        header.version = HFS_PLUS_VERSION;
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..2], b"H+");
        assert_eq!(&bytes[2..4], &[0, 4]);
    }
}
