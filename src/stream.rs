//! A cursor over a file's content, built directly on `fs::read_file`/
//! `fs::write_file`. Every `write` is already its own committed
//! transaction (the namespace layer commits per call), so
//! `flush` here is a no-op kept for the familiar read/write/seek/flush
//! shape rather than because there's buffered state to push out.

use crate::error::{FsError, FsResult};
use crate::fs::{self, Metadata};
use crate::session::Filesystem;

#[derive(Copy, Clone, Debug)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

pub struct Stream<'fs> {
    fs: &'fs Filesystem,
    meta: Metadata,
    position: u64,
}

impl<'fs> Stream<'fs> {
    pub fn open(fs: &'fs Filesystem, meta: Metadata) -> FsResult<Stream<'fs>> {
        if meta.is_directory() {
            return Err(FsError::IsDirectory);
        }
        Ok(Stream { fs, meta, position: 0 })
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn size(&self) -> u64 {
        self.meta.value.size as u64
    }

    pub fn seek(&mut self, from: SeekFrom) -> FsResult<u64> {
        let target = match from {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(n) => self.position as i64 + n,
            SeekFrom::End(n) => self.size() as i64 + n,
        };
        if target < 0 {
            return Err(FsError::InvalidSeek);
        }
        self.position = target as u64;
        Ok(self.position)
    }

    /// Reads into `buf`, capped at end-of-file; returns bytes read and
    /// advances the cursor by that many bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        let n = fs::read_file(self.fs, &self.meta, self.position, buf)?;
        self.position += n as u64;
        Ok(n)
    }

    /// Writes `data` at the cursor, extending the file if needed, and
    /// advances the cursor by `data.len()`.
    pub fn write(&mut self, data: &[u8]) -> FsResult<()> {
        self.meta = fs::write_file(self.fs, &self.meta, self.position, data)?;
        self.position += data.len() as u64;
        Ok(())
    }

    pub fn flush(&mut self) -> FsResult<()> {
        Ok(())
    }

    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use crate::device::MemoryDevice;

    fn cfg() -> FsConfig {
        FsConfig::new(64, 8, 40, 6, 4, 4, 32).unwrap()
    }

    fn fresh() -> Filesystem {
        let config = cfg();
        let device = MemoryDevice::new(config.clone());
        Filesystem::purge(config, Box::new(device)).unwrap()
    }

    #[test]
    fn write_seek_read_round_trip() {
        let fsys = fresh();
        let file = fs::new_file(&fsys, fs::ROOT_ID, b"greeting.txt").unwrap();
        let mut stream = Stream::open(&fsys, file).unwrap();

        stream.write(b"hello").unwrap();
        stream.seek(SeekFrom::Start(0)).unwrap();

        let mut buf = [0u8; 5];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn seek_before_start_is_rejected() {
        let fsys = fresh();
        let file = fs::new_file(&fsys, fs::ROOT_ID, b"f").unwrap();
        let mut stream = Stream::open(&fsys, file).unwrap();
        assert_eq!(stream.seek(SeekFrom::Current(-1)), Err(FsError::InvalidSeek));
    }
}
