// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Firmware image sources.

use std::io::{ErrorKind, Read};

use bitflags::bitflags;
use log::error;

use crate::{Error, Result};

bitflags! {
    /// Capabilities of an image store.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct StoreFeatures: u32 {
        /// Any offset may be loaded at any time.
        const SUPPORT_SEEK = 0x1;
    }
}

/// How a load may complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    /// The bytes are in place when `load` returns.
    Sync,
    /// The store may answer `Error::Again` and complete later; see `ImageStore::load_finish`.
    Async,
}

/// A firmware image the loader pulls bytes from.
pub trait ImageStore {
    /// Prepares the image for loading.
    fn open(&mut self) -> Result<()>;
    /// Releases the image.
    fn close(&mut self);
    /// Copies up to `dst.len()` bytes starting at `offset`. Returns the number of
    /// bytes copied, 0 at the end of the image.
    fn load(&mut self, offset: u64, dst: &mut [u8], mode: LoadMode) -> Result<usize>;
    /// Returns true once every pending asynchronous load has landed.
    fn load_finish(&mut self) -> bool {
        true
    }
    /// Store capabilities.
    fn features(&self) -> StoreFeatures;
}

/// Blocks until the store has no load in flight.
pub(crate) fn wait_finish(store: &mut dyn ImageStore) {
    while !store.load_finish() {
        std::hint::spin_loop();
    }
}

/// Fills as much of `dst` as the image allows, retrying `Again`.
pub(crate) fn load_data(
    store: &mut dyn ImageStore,
    offset: u64,
    dst: &mut [u8],
    mode: LoadMode,
) -> Result<usize> {
    let mut done = 0;
    while done < dst.len() {
        let n = match store.load(offset + done as u64, &mut dst[done..], mode) {
            Err(Error::Again) => {
                wait_finish(store);
                continue;
            }
            other => other?,
        };
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

/// Like `load_data`, but a short image is an error.
pub(crate) fn load_exact(
    store: &mut dyn ImageStore,
    offset: u64,
    dst: &mut [u8],
    mode: LoadMode,
    what: &'static str,
) -> Result<()> {
    if load_data(store, offset, dst, mode)? == dst.len() {
        Ok(())
    } else {
        error!("image: short read loading {what} at {offset:#x}");
        Err(Error::Invalid(what))
    }
}

/// A seekable image held in memory.
pub struct MemoryStore {
    image: Vec<u8>,
    open: bool,
}

impl MemoryStore {
    /// Wraps an image.
    pub fn new(image: impl Into<Vec<u8>>) -> Self {
        Self { image: image.into(), open: false }
    }
}

impl ImageStore for MemoryStore {
    fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn load(&mut self, offset: u64, dst: &mut [u8], _mode: LoadMode) -> Result<usize> {
        if !self.open {
            return Err(Error::Invalid("store not open"));
        }
        let Some(rest) = usize::try_from(offset).ok().and_then(|o| self.image.get(o..)) else {
            return Ok(0);
        };
        let n = rest.len().min(dst.len());
        dst[..n].copy_from_slice(&rest[..n]);
        Ok(n)
    }

    fn features(&self) -> StoreFeatures {
        StoreFeatures::SUPPORT_SEEK
    }
}

/// Bytes of the stream head kept for re-reads (ELF and program headers).
pub const STREAM_HEAD_KEEP: usize = 4096;

/// A forward-only image, e.g. a pipe or a socket.
///
/// Offsets must not go backwards, except into the first `STREAM_HEAD_KEEP`
/// bytes, which are retained.
pub struct StreamStore<R> {
    reader: R,
    pos: u64,
    head: Vec<u8>,
}

impl<R: Read> StreamStore<R> {
    /// Wraps a reader positioned at the start of the image.
    pub fn new(reader: R) -> Self {
        Self { reader, pos: 0, head: Vec::new() }
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = loop {
            match self.reader.read(buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("image: stream read failed: {e}");
                    return Err(Error::Invalid("image read failed"));
                }
            }
        };
        let keep = STREAM_HEAD_KEEP.saturating_sub(self.head.len()).min(n);
        self.head.extend_from_slice(&buf[..keep]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read> ImageStore for StreamStore<R> {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn load(&mut self, offset: u64, dst: &mut [u8], _mode: LoadMode) -> Result<usize> {
        if offset < self.pos {
            let start = offset as usize;
            if start >= self.head.len() {
                return Err(Error::Invalid("stream cannot seek backwards"));
            }
            let n = (self.head.len() - start).min(dst.len());
            dst[..n].copy_from_slice(&self.head[start..start + n]);
            return Ok(n);
        }
        let mut skip = [0u8; 256];
        while self.pos < offset {
            let want = ((offset - self.pos) as usize).min(skip.len());
            if self.read_some(&mut skip[..want])? == 0 {
                return Ok(0);
            }
        }
        self.read_some(dst)
    }

    fn features(&self) -> StoreFeatures {
        StoreFeatures::empty()
    }
}
