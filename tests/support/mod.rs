//! Shared test-only device scaffolding: a `FlashDevice` backed by bytes
//! multiple handles can share, plus a wrapper that can be armed to
//! silently swallow writes, standing in for a process dying mid-write
//! without needing to instrument the library itself.

use std::sync::{Arc, Mutex};

use wtfs_core::config::FsConfig;
use wtfs_core::error::{FsError, FsResult};
use wtfs_core::types::Address;
use wtfs_core::FlashDevice;

pub struct SharedDevice {
    config: FsConfig,
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedDevice {
    pub fn new(config: FsConfig) -> Self {
        let len = config.total_pages() as usize * config.page_size;
        SharedDevice {
            bytes: Arc::new(Mutex::new(vec![0xFFu8; len])),
            config,
        }
    }

    /// A handle onto the same underlying bytes, as if the same physical
    /// device were reopened by a fresh process.
    pub fn reopen(&self) -> SharedDevice {
        SharedDevice {
            config: self.config.clone(),
            bytes: Arc::clone(&self.bytes),
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

impl FlashDevice for SharedDevice {
    fn config(&self) -> &FsConfig {
        &self.config
    }

    fn ensure_erased(&mut self, block_index: usize) -> FsResult<()> {
        let mut bytes = self.bytes.lock().unwrap();
        let start = block_index * self.config.block_size * self.config.page_size;
        let end = start + self.config.block_size * self.config.page_size;
        for b in &mut bytes[start..end] {
            *b = 0xFF;
        }
        Ok(())
    }

    fn read(&self, address: Address, dst: &mut [u8]) -> FsResult<()> {
        let start = self.offset(address)?;
        let bytes = self.bytes.lock().unwrap();
        dst.copy_from_slice(&bytes[start..start + self.config.page_size]);
        Ok(())
    }

    fn write(&mut self, address: Address, src: &[u8]) -> FsResult<()> {
        let start = self.offset(address)?;
        let mut bytes = self.bytes.lock().unwrap();
        bytes[start..start + self.config.page_size].copy_from_slice(src);
        Ok(())
    }
}

/// Wraps a device and, once armed, turns every `write`/`ensure_erased`
/// into a silent no-op — modeling a power cut partway through a
/// transaction: the host thinks the page landed, but the device never
/// actually changed.
pub struct CrashDevice {
    inner: SharedDevice,
    armed: bool,
}

impl CrashDevice {
    pub fn new(inner: SharedDevice) -> Self {
        CrashDevice {
            inner,
            armed: false,
        }
    }

    pub fn arm(&mut self) {
        self.armed = true;
    }
}

impl FlashDevice for CrashDevice {
    fn config(&self) -> &FsConfig {
        self.inner.config()
    }

    fn ensure_erased(&mut self, block_index: usize) -> FsResult<()> {
        if self.armed {
            return Ok(());
        }
        self.inner.ensure_erased(block_index)
    }

    fn read(&self, address: Address, dst: &mut [u8]) -> FsResult<()> {
        self.inner.read(address, dst)
    }

    fn write(&mut self, address: Address, src: &[u8]) -> FsResult<()> {
        if self.armed {
            return Ok(());
        }
        self.inner.write(address, src)
    }
}

pub fn small_config() -> FsConfig {
    FsConfig::new(64, 8, 16, 6, 2, 2, 32).unwrap()
}
