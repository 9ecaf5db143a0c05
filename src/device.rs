//! The raw flash driver is an external collaborator: this module only
//! pins down the trait boundary the core talks to, plus an in-memory
//! test double standing in for real NAND/NOR hardware.

use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::types::Address;

/// Capabilities the core requires from the flash driver. Page addresses
/// are absolute (`block * block_size + offset`); `write` never implies an
/// erase, and repeated writes to the same page without an intervening
/// erase are undefined, exactly as on real NAND/NOR.
pub trait FlashDevice: Send {
    fn config(&self) -> &FsConfig;

    /// Leave the block in its all-ones erased state.
    fn ensure_erased(&mut self, block_index: usize) -> FsResult<()>;

    fn read(&self, address: Address, dst: &mut [u8]) -> FsResult<()>;

    fn write(&mut self, address: Address, src: &[u8]) -> FsResult<()>;
}

/// All-RAM flash device for tests and demonstrations: a flat byte buffer
/// addressed the same way a real device would be, erase fills with
/// `0xFF`. Not part of the product surface.
pub struct MemoryDevice {
    config: FsConfig,
    bytes: Vec<u8>,
}

impl MemoryDevice {
    pub fn new(config: FsConfig) -> Self {
        let len = config.total_pages() as usize * config.page_size;
        MemoryDevice {
            bytes: vec![0xFF; len],
            config,
        }
    }

    fn offset(&self, address: Address) -> FsResult<usize> {
        if address.0 >= self.config.total_pages() {
            return Err(FsError::InvalidArgument(format!(
                "address {} out of device range",
                address
            )));
        }
        Ok(address.0 as usize * self.config.page_size)
    }
}

impl FlashDevice for MemoryDevice {
    fn config(&self) -> &FsConfig {
        &self.config
    }

    fn ensure_erased(&mut self, block_index: usize) -> FsResult<()> {
        let start = block_index * self.config.block_size * self.config.page_size;
        let end = start + self.config.block_size * self.config.page_size;
        if end > self.bytes.len() {
            return Err(FsError::InvalidArgument("block index out of range".into()));
        }
        for b in &mut self.bytes[start..end] {
            *b = 0xFF;
        }
        Ok(())
    }

    fn read(&self, address: Address, dst: &mut [u8]) -> FsResult<()> {
        let start = self.offset(address)?;
        dst.copy_from_slice(&self.bytes[start..start + self.config.page_size]);
        Ok(())
    }

    fn write(&mut self, address: Address, src: &[u8]) -> FsResult<()> {
        let start = self.offset(address)?;
        self.bytes[start..start + self.config.page_size].copy_from_slice(src);
        Ok(())
    }
}
