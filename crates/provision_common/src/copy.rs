//! Chunked stream copy for raw block devices.
//!
//! Devices opened with `O_DIRECT` only accept writes of whole, aligned
//! buffers, so the copy always fills its buffer before writing. Only the last
//! chunk of a stream may be short.

use std::alloc::{self, Layout};
use std::fmt;
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 20;

/// Largest chunk buffer we allocate: 64 MiB.
pub const MAX_CHUNK_SIZE: usize = 64 << 20;

/// Alignment required by direct I/O on the block devices we flash.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

/// Which side of a copy failed.
#[derive(Debug)]
pub enum CopyError {
    Read { written: u64, source: io::Error },
    Write { written: u64, source: io::Error },
}

impl CopyError {
    pub fn written(&self) -> u64 {
        match self {
            CopyError::Read { written, .. } | CopyError::Write { written, .. } => *written,
        }
    }

    pub fn into_io(self) -> io::Error {
        match self {
            CopyError::Read { source, .. } | CopyError::Write { source, .. } => source,
        }
    }
}

impl fmt::Display for CopyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CopyError::Read { written, source } => {
                write!(f, "read failed after {} bytes: {}", written, source)
            }
            CopyError::Write { written, source } => {
                write!(f, "write failed after {} bytes: {}", written, source)
            }
        }
    }
}

impl std::error::Error for CopyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CopyError::Read { source, .. } | CopyError::Write { source, .. } => Some(source),
        }
    }
}

/// Read until `buf` is full or the reader hits end of stream.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Copy `reader` to `writer` in chunks of `buf.len()` bytes.
///
/// Returns the number of bytes written.
pub fn copy_chunked<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> Result<u64, CopyError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    assert!(!buf.is_empty(), "copy buffer must not be empty");

    let mut written = 0u64;
    loop {
        let n = match read_full(reader, buf) {
            Ok(n) => n,
            Err(source) => return Err(CopyError::Read { written, source }),
        };
        if n == 0 {
            break;
        }
        if let Err(source) = writer.write_all(&buf[..n]) {
            return Err(CopyError::Write { written, source });
        }
        written += n as u64;
        if n < buf.len() {
            break;
        }
    }
    Ok(written)
}

/// Heap buffer aligned for direct I/O.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The buffer owns its allocation exclusively.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `len` bytes, rounded up to the alignment.
    pub fn new(len: usize) -> Self {
        let len = len.max(1).div_ceil(DIRECT_IO_ALIGNMENT) * DIRECT_IO_ALIGNMENT;
        let layout = match Layout::from_size_align(len, DIRECT_IO_ALIGNMENT) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid buffer layout for {} bytes", len),
        };
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Self { ptr, layout }
    }
}

impl Deref for AlignedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for layout.size() initialised bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for AlignedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for layout.size() bytes and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out at most `step` bytes per call.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    /// Writer that records the size of every write call.
    #[derive(Default)]
    struct RecordingWriter {
        data: Vec<u8>,
        writes: Vec<usize>,
    }

    impl Write for RecordingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.extend_from_slice(buf);
            self.writes.push(buf.len());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_copy_matrix_is_byte_exact() {
        for buf_size in [1usize, 7, 512, 4096] {
            let lengths = [0, 1, buf_size - 1, buf_size, buf_size + 1, 10 * buf_size + 7];
            for len in lengths {
                let src = pattern(len);
                let mut reader = Cursor::new(src.clone());
                let mut writer = RecordingWriter::default();
                let mut buf = vec![0u8; buf_size];

                let written = copy_chunked(&mut reader, &mut writer, &mut buf).unwrap();

                assert_eq!(written, len as u64, "len={} buf={}", len, buf_size);
                assert_eq!(writer.data, src, "len={} buf={}", len, buf_size);
            }
        }
    }

    #[test]
    fn test_short_reads_still_write_full_chunks() {
        let src = pattern(4096 * 3 + 100);
        let mut reader = Trickle { data: &src, step: 333 };
        let mut writer = RecordingWriter::default();
        let mut buf = vec![0u8; 4096];

        let written = copy_chunked(&mut reader, &mut writer, &mut buf).unwrap();

        assert_eq!(written, src.len() as u64);
        assert_eq!(writer.data, src);
        assert_eq!(writer.writes, vec![4096, 4096, 4096, 100]);
    }

    #[test]
    fn test_read_error_reports_bytes_written() {
        struct FailAfter(usize);
        impl Read for FailAfter {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.0 == 0 {
                    return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
                }
                let n = self.0.min(buf.len());
                buf[..n].fill(0xAB);
                self.0 -= n;
                Ok(n)
            }
        }

        let mut writer = RecordingWriter::default();
        let mut buf = vec![0u8; 64];
        let err = copy_chunked(&mut FailAfter(128), &mut writer, &mut buf).unwrap_err();

        assert!(matches!(err, CopyError::Read { written: 128, .. }));
        assert_eq!(writer.data.len(), 128);
    }

    #[test]
    fn test_write_error_aborts_immediately() {
        struct FullDisk;
        impl Write for FullDisk {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "no space left"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut reader = Cursor::new(pattern(1000));
        let mut buf = vec![0u8; 100];
        let err = copy_chunked(&mut reader, &mut FullDisk, &mut buf).unwrap_err();

        assert!(matches!(err, CopyError::Write { written: 0, .. }));
        assert_eq!(reader.position(), 100);
    }

    #[test]
    fn test_aligned_buffer_alignment() {
        let buf = AlignedBuffer::new(DEFAULT_CHUNK_SIZE);
        assert_eq!(buf.len(), DEFAULT_CHUNK_SIZE);
        assert_eq!(buf.as_ptr() as usize % DIRECT_IO_ALIGNMENT, 0);

        let odd = AlignedBuffer::new(5000);
        assert_eq!(odd.len(), 8192);
        assert!(odd.iter().all(|b| *b == 0));
    }
}
