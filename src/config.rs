use crate::error::FsError;
use crate::types::Address;

/// Construction-time configuration: page size, block size, device
/// geometry and level counts as runtime fields rather than compile-time
/// constants, trading constant-folding for a single binary that can
/// mount devices of different shapes.
#[derive(Clone, Debug)]
pub struct FsConfig {
    /// Bytes per page, flash-driver constant.
    pub page_size: usize,
    /// Pages per erase block.
    pub block_size: usize,
    /// Erase blocks on the device.
    pub device_size: usize,
    /// Buffer pool slot count (C1's `N`).
    pub n_buffers: usize,
    /// Number of distinct metadata-tree levels the allocator tracks
    /// (`level >= 0`). Internal node depth may not exceed this.
    pub max_meta_levels: usize,
    /// Number of distinct blob-index levels the allocator tracks
    /// (`level < 0`, not counting the `-1` data level itself).
    pub max_file_levels: usize,
    /// Maximum filename length, excluding the implicit NUL pad byte.
    pub max_filename_length: usize,
}

/// Trailer reserved at the tail of every page: 4 bytes for the level tag
/// reserved 4 bytes at the end before the tail, plus 8 bytes for the
/// tail payload itself (either an 8-byte-aligned `sequence_number` for
/// metadata pages, or `{file_id, parent_id}` for blob pages).
pub const TRAILER_LEN: usize = 12;
pub const ADDRESS_SIZE: usize = 8;

impl FsConfig {
    pub fn new(
        page_size: usize,
        block_size: usize,
        device_size: usize,
        n_buffers: usize,
        max_meta_levels: usize,
        max_file_levels: usize,
        max_filename_length: usize,
    ) -> FsResultConfig {
        if page_size <= TRAILER_LEN || block_size == 0 || device_size == 0 {
            return Err(FsError::InvalidArgument(
                "page/block/device geometry out of range".into(),
            ));
        }
        if block_size > u16::MAX as usize {
            return Err(FsError::InvalidArgument(
                "block_size must fit a per-block live counter".into(),
            ));
        }
        if n_buffers == 0 {
            return Err(FsError::InvalidArgument(
                "need at least one buffer slot".into(),
            ));
        }
        if max_meta_levels == 0 || max_file_levels == 0 {
            return Err(FsError::InvalidArgument(
                "need at least one metadata and one blob level".into(),
            ));
        }
        Ok(FsConfig {
            page_size,
            block_size,
            device_size,
            n_buffers,
            max_meta_levels,
            max_file_levels,
            max_filename_length,
        })
    }

    /// Bytes of page available to a node/table/index page after the
    /// level tag and tail are carved off.
    pub fn payload_size(&self) -> usize {
        self.page_size - TRAILER_LEN
    }

    /// Blob index fan-out `B = payload_size / sizeof(Address)`.
    pub fn blob_fanout(&self) -> usize {
        self.payload_size() / ADDRESS_SIZE
    }

    pub fn max_levels(&self) -> usize {
        self.max_meta_levels + self.max_file_levels
    }

    /// Maps a level tag to its slot in the allocator's per-level arrays.
    pub fn level_to_index(&self, level: crate::types::Level) -> usize {
        if level.0 < 0 {
            (-level.0 - 1) as usize
        } else {
            level.0 as usize + self.max_file_levels
        }
    }

    pub fn total_pages(&self) -> u64 {
        (self.device_size * self.block_size) as u64
    }

    pub fn address_of(&self, block: usize, offset: usize) -> Address {
        Address((block * self.block_size + offset) as u64)
    }
}

type FsResultConfig = Result<FsConfig, FsError>;
