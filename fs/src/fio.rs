//! File read adapter.
//!
//! Translates `(file, byte offset, length)` into chunk addresses and
//! drives the cache engine, copying each chunk's slice into the caller's
//! buffer.  The file table is the in-memory product of the mount
//! procedure: name-keyed extents of contiguous chunks.

use core::cell::Cell;
use core::cmp;

use alloc::string::String;
use alloc::vec::Vec;

use crate::Chunk;
use crate::cache::AreadResult;
use crate::error::{ShfsError, ShfsResult};
use crate::vol::Volume;

/// One file of the mounted volume: `size` bytes starting at the first
/// byte of `base_chunk`.
#[derive(Clone, Debug)]
pub struct FileSpec {
    pub name: String,
    pub mime: String,
    pub base_chunk: Chunk,
    pub size: u64,
}

struct FileNode {
    spec: FileSpec,
    refcount: Cell<u32>,
}

pub(crate) struct FileTable {
    nodes: Vec<FileNode>,
}

impl FileTable {
    pub(crate) fn new(files: Vec<FileSpec>, chunksize: u32, volsize: Chunk) -> ShfsResult<Self> {
        let mut nodes = Vec::with_capacity(files.len());
        for spec in files {
            if spec.base_chunk == 0 {
                return Err(ShfsError::Invalid);
            }
            let nb_chunks = spec.size.div_ceil(chunksize as u64).max(1);
            if spec.base_chunk + nb_chunks - 1 > volsize {
                return Err(ShfsError::Invalid);
            }
            nodes.push(FileNode {
                spec,
                refcount: Cell::new(0),
            });
        }
        Ok(Self { nodes })
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.spec.name == name)
    }

    fn node(&self, idx: usize) -> &FileNode {
        &self.nodes[idx]
    }
}

/// An open file.  Closes itself (dropping the per-file reference) on
/// drop.
pub struct FileHandle<'v> {
    vol: &'v Volume,
    idx: usize,
}

impl Volume {
    /// Open a file by name.
    pub fn open(&self, name: &str) -> ShfsResult<FileHandle<'_>> {
        self.ensure_mounted()?;
        let mut st = self.state.lock();
        let idx = st.files.lookup(name).ok_or(ShfsError::NoEntry)?;
        let node = st.files.node(idx);
        node.refcount.set(node.refcount.get() + 1);
        st.nb_open += 1;
        Ok(FileHandle { vol: self, idx })
    }
}

impl<'v> FileHandle<'v> {
    pub fn name(&self) -> String {
        let st = self.vol.state.lock();
        st.files.node(self.idx).spec.name.clone()
    }

    pub fn mime(&self) -> String {
        let st = self.vol.state.lock();
        st.files.node(self.idx).spec.mime.clone()
    }

    pub fn size(&self) -> u64 {
        let st = self.vol.state.lock();
        st.files.node(self.idx).spec.size
    }

    fn base_chunk(&self) -> Chunk {
        let st = self.vol.state.lock();
        st.files.node(self.idx).spec.base_chunk
    }

    fn check_range(&self, offset: u64, len: usize) -> ShfsResult<()> {
        let size = self.size();
        if offset > size || offset + len as u64 > size {
            return Err(ShfsError::Invalid);
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset` through the chunk cache.
    ///
    /// Synchronous: busy-waits on each missing chunk by polling the
    /// volume until the fetch completes.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> ShfsResult<usize> {
        self.check_range(offset, buf.len())?;
        let chunksize = self.vol.chunksize() as u64;
        let mut chk_off = self.base_chunk() + offset / chunksize;
        let mut byt_off = (offset % chunksize) as usize;
        let mut buf_off = 0usize;

        while buf_off < buf.len() {
            let result = self.vol.cache_aread(chk_off, None, 0, 0)?;
            let entry = result.entry();
            if let AreadResult::Pending(_, t) = result {
                while !self.vol.aio_is_done(Some(t)) {
                    self.vol.poll();
                }
                let ret = self.vol.aio_finalize(t);
                if ret < 0 {
                    self.vol.cache_release(entry);
                    return Err(ShfsError::from_ret(ret));
                }
            }

            let rlen = cmp::min(chunksize as usize - byt_off, buf.len() - buf_off);
            let copied = self.vol.with_chunk_data(entry, |data| {
                buf[buf_off..buf_off + rlen].copy_from_slice(&data[byt_off..byt_off + rlen]);
            });
            self.vol.cache_release(entry);
            copied?;

            chk_off += 1; // go to next chunk
            byt_off = 0; // byte offset applies to the first chunk only
            buf_off += rlen;
        }
        Ok(buf_off)
    }

    /// Read without populating the cache index: loads each chunk into one
    /// scratch blank entry, synchronously.
    pub fn read_uncached(&self, offset: u64, buf: &mut [u8]) -> ShfsResult<usize> {
        self.check_range(offset, buf.len())?;
        let chunksize = self.vol.chunksize() as u64;
        let mut chk_off = self.base_chunk() + offset / chunksize;
        let mut byt_off = (offset % chunksize) as usize;
        let mut buf_off = 0usize;

        let blank = self.vol.cache_eblank()?;
        while buf_off < buf.len() {
            if let Err(err) = self.vol.blank_read_chunk(blank, chk_off) {
                self.vol.cache_release(blank);
                return Err(err);
            }

            let rlen = cmp::min(chunksize as usize - byt_off, buf.len() - buf_off);
            let copied = self.vol.with_chunk_data(blank, |data| {
                buf[buf_off..buf_off + rlen].copy_from_slice(&data[byt_off..byt_off + rlen]);
            });
            if let Err(err) = copied {
                self.vol.cache_release(blank);
                return Err(err);
            }

            chk_off += 1;
            byt_off = 0;
            buf_off += rlen;
        }
        self.vol.cache_release(blank);
        Ok(buf_off)
    }
}

impl Drop for FileHandle<'_> {
    fn drop(&mut self) {
        let mut st = self.vol.state.lock();
        let node = st.files.node(self.idx);
        node.refcount.set(node.refcount.get() - 1);
        st.nb_open -= 1;
    }
}
