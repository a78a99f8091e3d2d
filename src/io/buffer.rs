//! Chunked, mutex-guarded file buffering.
//!
//! Every higher layer of the engine reads and writes through [`BufFile`]. It
//! is the single place where partial reads, buffer growth and cross-thread
//! descriptor sharing are handled. A [`SharedFile`] wraps one descriptor
//! behind a mutex so that several logical streams (one per worker buffer)
//! can address the same file; the `seek + read` / `seek + write` pair is
//! atomic with respect to other holders of the descriptor.
//!
//! Three flavors exist:
//!
//! - **writer**: batches bytes into a fixed buffer and flushes to the
//!   descriptor when the buffer fills,
//! - **reader**: refills a window from a remembered read point on demand;
//!   readers may start unbound and be [`link`](BufFile::link)ed to a file
//!   region per lookup,
//! - **memory**: a growable in-memory buffer used as scratch for
//!   compression, snippets and write staging.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CallunaError, Result};

/// Default capacity for file-backed buffers.
pub const FILE_BUFFER_LEN: usize = 4096;

/// Minimum capacity for short positioned reads (headers, pointers).
pub const MIN_IO_BUFFER: usize = 64;

/// A file descriptor shared between workers, guarded by a mutex.
///
/// Cloning the `Arc` hands the same descriptor to another buffer; every
/// positioned access locks, seeks and transfers in one critical section.
pub struct SharedFile {
    inner: Mutex<File>,
}

impl SharedFile {
    /// Create (truncating) a file for writing.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Arc::new(SharedFile {
            inner: Mutex::new(file),
        }))
    }

    /// Open an existing file read-only.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Arc<Self>> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Arc::new(SharedFile {
            inner: Mutex::new(file),
        }))
    }

    /// Wrap an already-open file.
    pub fn from_file(file: File) -> Arc<Self> {
        Arc::new(SharedFile {
            inner: Mutex::new(file),
        })
    }

    /// Length of the underlying file in bytes.
    pub fn len(&self) -> Result<u64> {
        let file = self.inner.lock();
        Ok(file.metadata()?.len())
    }

    /// Whether the underlying file is empty.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Positioned read; returns the number of bytes read (0 at end of file).
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut file = self.inner.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Positioned write of the whole slice.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.inner.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }
}

impl std::fmt::Debug for SharedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFile").finish()
    }
}

/// Saved reader binding, restored by [`BufFile::unlink`].
struct SavedLink {
    file: Option<Arc<SharedFile>>,
    pos: u64,
    window: usize,
}

enum Mode {
    Write {
        file: Arc<SharedFile>,
        /// File offset where the first pending byte lands.
        offset: u64,
    },
    Read {
        file: Option<Arc<SharedFile>>,
        /// Logical absolute position of the next read.
        pos: u64,
        /// File offset covered by `buf[0]`.
        buf_start: u64,
        /// Refill size hint; 0 means a full buffer.
        window: usize,
        saved: Option<SavedLink>,
    },
    Memory {
        pos: usize,
        extends: u32,
    },
}

/// A buffered view over a shared descriptor or an in-memory region.
pub struct BufFile {
    mode: Mode,
    buf: Vec<u8>,
    capacity: usize,
}

impl BufFile {
    /// Open a write buffer over a shared descriptor, starting at offset 0.
    pub fn writer(file: Arc<SharedFile>, capacity: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| CallunaError::memory("write buffer allocation"))?;
        Ok(BufFile {
            mode: Mode::Write { file, offset: 0 },
            buf,
            capacity,
        })
    }

    /// Open a read buffer over a shared descriptor, positioned at offset 0.
    pub fn reader(file: Arc<SharedFile>, capacity: usize) -> Result<Self> {
        let mut this = Self::unbound_reader(capacity)?;
        if let Mode::Read { file: f, .. } = &mut this.mode {
            *f = Some(file);
        }
        Ok(this)
    }

    /// Open a read buffer with no backing file; it must be [`link`]ed before
    /// use. Worker pools hold these and rebind them per lookup.
    ///
    /// [`link`]: BufFile::link
    pub fn unbound_reader(capacity: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| CallunaError::memory("read buffer allocation"))?;
        Ok(BufFile {
            mode: Mode::Read {
                file: None,
                pos: 0,
                buf_start: 0,
                window: 0,
                saved: None,
            },
            buf,
            capacity,
        })
    }

    /// Open a growable in-memory buffer.
    pub fn memory(capacity: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| CallunaError::memory("memory buffer allocation"))?;
        Ok(BufFile {
            mode: Mode::Memory {
                pos: 0,
                extends: 0,
            },
            buf,
            capacity,
        })
    }

    /// Logical position of the next read or write.
    pub fn tell(&self) -> u64 {
        match &self.mode {
            Mode::Write { offset, .. } => offset + self.buf.len() as u64,
            Mode::Read { pos, .. } => *pos,
            Mode::Memory { pos, .. } => *pos as u64,
        }
    }

    /// Reposition the buffer. Writers flush pending bytes first; readers keep
    /// their window and serve from it if the target is still covered.
    pub fn seek(&mut self, target: u64) -> Result<()> {
        match &mut self.mode {
            Mode::Write { .. } => {
                self.flush()?;
                if let Mode::Write { offset, .. } = &mut self.mode {
                    *offset = target;
                }
                Ok(())
            }
            Mode::Read { pos, .. } => {
                *pos = target;
                Ok(())
            }
            Mode::Memory { pos, .. } => {
                *pos = target as usize;
                Ok(())
            }
        }
    }

    /// Flush pending writes to the descriptor. A no-op for readers and
    /// memory buffers.
    pub fn flush(&mut self) -> Result<()> {
        if let Mode::Write { file, offset } = &mut self.mode {
            if !self.buf.is_empty() {
                file.write_at(*offset, &self.buf)?;
                *offset += self.buf.len() as u64;
                self.buf.clear();
            }
        }
        Ok(())
    }

    /// Write all bytes through the buffer.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match &mut self.mode {
            Mode::Write { file, offset } => {
                let mut rest = bytes;
                while !rest.is_empty() {
                    let room = self.capacity - self.buf.len();
                    let take = room.min(rest.len());
                    self.buf.extend_from_slice(&rest[..take]);
                    rest = &rest[take..];
                    if self.buf.len() == self.capacity {
                        file.write_at(*offset, &self.buf)?;
                        *offset += self.buf.len() as u64;
                        self.buf.clear();
                    }
                }
                Ok(())
            }
            Mode::Read { .. } => Err(CallunaError::invalid_argument(
                "buffer not open for writing",
            )),
            Mode::Memory { pos, extends } => {
                let end = *pos + bytes.len();
                if end > self.buf.capacity() {
                    grow(&mut self.buf, self.capacity, extends, end)?;
                }
                if *pos > self.buf.len() {
                    // gap from a forward seek
                    self.buf.resize(*pos, 0);
                }
                let overlap = (self.buf.len() - *pos).min(bytes.len());
                self.buf[*pos..*pos + overlap].copy_from_slice(&bytes[..overlap]);
                self.buf.extend_from_slice(&bytes[overlap..]);
                *pos = end;
                Ok(())
            }
        }
    }

    /// Read exactly `out.len()` bytes; a short underlying file is an I/O
    /// error (`UnexpectedEof`).
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        match &mut self.mode {
            Mode::Write { .. } => Err(CallunaError::invalid_argument(
                "buffer not open for reading",
            )),
            Mode::Memory { pos, .. } => {
                let end = *pos + out.len();
                if end > self.buf.len() {
                    return Err(CallunaError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "read past end of memory buffer",
                    )));
                }
                out.copy_from_slice(&self.buf[*pos..end]);
                *pos = end;
                Ok(())
            }
            Mode::Read {
                file,
                pos,
                buf_start,
                window,
                ..
            } => {
                let file = file.as_ref().ok_or_else(|| {
                    CallunaError::invalid_argument("reader is not bound to a file")
                })?;
                let mut filled = 0;
                while filled < out.len() {
                    let buf_end = *buf_start + self.buf.len() as u64;
                    if *pos >= *buf_start && *pos < buf_end {
                        let at = (*pos - *buf_start) as usize;
                        let avail = self.buf.len() - at;
                        let take = avail.min(out.len() - filled);
                        out[filled..filled + take].copy_from_slice(&self.buf[at..at + take]);
                        filled += take;
                        *pos += take as u64;
                        continue;
                    }
                    let want = if *window > 0 {
                        (*window).min(self.capacity).max(out.len() - filled)
                    } else {
                        self.capacity
                    }
                    .min(self.capacity);
                    self.buf.resize(want, 0);
                    let got = file.read_at(*pos, &mut self.buf[..want])?;
                    self.buf.truncate(got);
                    *buf_start = *pos;
                    if got == 0 {
                        return Err(CallunaError::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "read past end of file",
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    /// Rebind a reader to a region of another (or the same) descriptor. The
    /// previous binding is remembered and restored by [`unlink`].
    ///
    /// `window` is a refill-size hint for short positioned reads; 0 keeps the
    /// full buffer capacity.
    ///
    /// [`unlink`]: BufFile::unlink
    pub fn link(&mut self, target: &Arc<SharedFile>, offset: u64, window: usize) -> Result<()> {
        match &mut self.mode {
            Mode::Read {
                file,
                pos,
                buf_start,
                window: w,
                saved,
            } => {
                *saved = Some(SavedLink {
                    file: file.take(),
                    pos: *pos,
                    window: *w,
                });
                *file = Some(Arc::clone(target));
                *pos = offset;
                *buf_start = offset;
                *w = window;
                self.buf.clear();
                Ok(())
            }
            _ => Err(CallunaError::invalid_argument(
                "only readers can be linked",
            )),
        }
    }

    /// Restore the binding that was active before the last [`link`].
    ///
    /// [`link`]: BufFile::link
    pub fn unlink(&mut self) {
        if let Mode::Read {
            file,
            pos,
            buf_start,
            window,
            saved,
        } = &mut self.mode
        {
            if let Some(prev) = saved.take() {
                *file = prev.file;
                *pos = prev.pos;
                *buf_start = prev.pos;
                *window = prev.window;
                self.buf.clear();
            }
        }
    }

    /// Grow a memory buffer so that at least `additional` more bytes fit at
    /// the current position. Growth is geometric (`base * (extends + 1)`) or
    /// to the requested size, whichever is larger.
    pub fn extend(&mut self, additional: usize) -> Result<()> {
        match &mut self.mode {
            Mode::Memory { pos, extends } => {
                let need = *pos + additional;
                if need > self.buf.capacity() {
                    grow(&mut self.buf, self.capacity, extends, need)?;
                }
                Ok(())
            }
            _ => Err(CallunaError::invalid_argument(
                "only memory buffers can be extended",
            )),
        }
    }

    /// Copy `n` bytes from this buffer into `dst`.
    pub fn copy_to(&mut self, dst: &mut BufFile, n: u64) -> Result<()> {
        let mut chunk = [0u8; 1024];
        let mut left = n;
        while left > 0 {
            let take = (left as usize).min(chunk.len());
            self.read_exact(&mut chunk[..take])?;
            dst.write_all(&chunk[..take])?;
            left -= take as u64;
        }
        Ok(())
    }

    /// Contents of a memory buffer.
    pub fn data(&self) -> &[u8] {
        debug_assert!(matches!(self.mode, Mode::Memory { .. }));
        &self.buf
    }

    /// Reset a memory buffer to empty, keeping its allocation.
    pub fn reset(&mut self) {
        if let Mode::Memory { pos, .. } = &mut self.mode {
            self.buf.clear();
            *pos = 0;
        }
    }

    /// Content length of a memory buffer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether a memory buffer holds no content.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes currently reserved; tracked by the pool usage ceiling.
    pub fn capacity_bytes(&self) -> usize {
        self.buf.capacity()
    }

    /// Release surplus capacity back to the base size. Writers are left
    /// untouched so pending bytes are never dropped.
    pub fn shrink(&mut self) {
        match &mut self.mode {
            Mode::Memory { pos, extends } => {
                self.buf.clear();
                self.buf.shrink_to(self.capacity);
                *pos = 0;
                *extends = 0;
            }
            Mode::Read { pos, buf_start, .. } => {
                self.buf.clear();
                self.buf.shrink_to(self.capacity);
                *buf_start = *pos;
            }
            Mode::Write { .. } => {}
        }
    }
}

fn grow(buf: &mut Vec<u8>, base: usize, extends: &mut u32, need: usize) -> Result<()> {
    *extends += 1;
    let geometric = base.saturating_mul(*extends as usize + 1);
    let target = need.max(geometric);
    buf.try_reserve(target - buf.len())
        .map_err(|_| CallunaError::memory("buffer growth"))?;
    Ok(())
}

impl std::io::Write for BufFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        BufFile::write_all(self, buf).map_err(std::io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        BufFile::flush(self).map_err(std::io::Error::other)
    }
}

impl std::fmt::Debug for BufFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.mode {
            Mode::Write { .. } => "write",
            Mode::Read { .. } => "read",
            Mode::Memory { .. } => "memory",
        };
        f.debug_struct("BufFile")
            .field("mode", &mode)
            .field("pos", &self.tell())
            .finish()
    }
}
