//! Writing one artifact to the device.
//!
//! `ImageFlasher` streams a gzip-compressed raw partition image onto a block
//! device. `StatefulInstaller` unpacks the stateful tarball into the mounted
//! stateful partition. Both are blocking and run on the blocking pool.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::bufread::GzDecoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::blob::{Artifact, BlobStore};
use crate::copy::{copy_chunked, AlignedBuffer, CopyError, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::error::{ProvisionError, Result};
use crate::progress::{ProgressReader, ProgressSink};

/// Mount point of the stateful partition on the DUT.
pub const STATEFUL_DIR: &str = "/mnt/stateful_partition";

/// Marker asking the next boot to apply the new stateful content.
pub const STATEFUL_MARKER: &str = ".update_available";

/// Directories left behind by a previous stateful update.
const STALE_STATEFUL_DIRS: [&str; 2] = ["var_new", "dev_image_new"];

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Read-side buffer in front of the decompressor.
const READ_BUFFER_SIZE: usize = 1 << 20;

fn cancelled(what: &str) -> ProvisionError {
    ProvisionError::Cancelled(format!("{} not started, flash group was cancelled", what))
}

/// Map a read-side failure of the decompressed stream.
fn classify_read_error(artifact: &str, target: &str, written: u64, err: io::Error) -> ProvisionError {
    match err.kind() {
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof => {
            ProvisionError::DecompressionFailed {
                artifact: artifact.to_string(),
                source: err,
            }
        }
        _ => ProvisionError::CopyFailed {
            target: target.to_string(),
            written,
            source: err,
        },
    }
}

/// Writes compressed partition images to raw devices.
#[derive(Clone)]
pub struct ImageFlasher {
    store: Arc<dyn BlobStore>,
    chunk_size: usize,
    direct_io: bool,
}

impl ImageFlasher {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
            direct_io: true,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Open targets with `O_DIRECT | O_EXCL`. Regular files on tmpfs reject it.
    pub fn with_direct_io(mut self, direct_io: bool) -> Self {
        self.direct_io = direct_io;
        self
    }

    fn open_target(&self, target: &Path) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.write(true);
        if self.direct_io {
            options.custom_flags(libc::O_DIRECT | libc::O_EXCL);
        }
        options.open(target)
    }

    /// Flash `artifact` onto `target`, returning the number of bytes written.
    pub fn flash(
        &self,
        artifact: Artifact,
        target: &Path,
        sink: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let name = artifact.object_name();
        let source = self.store.describe(name);
        let target_name = target.display().to_string();

        let blob = self
            .store
            .open(name)
            .map_err(|e| ProvisionError::SourceOpenFailed {
                artifact: source.clone(),
                source: e,
            })?;
        sink.set_total(blob.size);

        let tee = ProgressReader::new(blob.reader, sink.clone());
        let mut buffered = BufReader::with_capacity(READ_BUFFER_SIZE, tee);
        let head = buffered
            .fill_buf()
            .map_err(|e| ProvisionError::SourceOpenFailed {
                artifact: source.clone(),
                source: e,
            })?;
        if !head.starts_with(&GZIP_MAGIC) {
            return Err(ProvisionError::DecompressionFailed {
                artifact: source,
                source: io::Error::new(io::ErrorKind::InvalidData, "missing gzip header"),
            });
        }
        let mut decoder = GzDecoder::new(buffered);

        if cancel.is_cancelled() {
            return Err(cancelled(name));
        }

        let mut device = self
            .open_target(target)
            .map_err(|e| ProvisionError::TargetOpenFailed {
                target: target_name.clone(),
                source: e,
            })?;

        debug!("[flash] {} -> {}", source, target_name);
        let mut buf = AlignedBuffer::new(self.chunk_size);
        let written = match copy_chunked(&mut decoder, &mut device, &mut buf) {
            Ok(n) => n,
            Err(CopyError::Read { written, source: e }) => {
                return Err(classify_read_error(&source, &target_name, written, e))
            }
            Err(CopyError::Write { written, source: e }) => {
                return Err(ProvisionError::CopyFailed {
                    target: target_name,
                    written,
                    source: e,
                })
            }
        };

        device.sync_all().map_err(|e| ProvisionError::CopyFailed {
            target: target_name.clone(),
            written,
            source: e,
        })?;

        info!("[flash] wrote {} bytes of {} to {}", written, name, target_name);
        Ok(written)
    }
}

/// Unpacks the stateful tarball into the stateful partition.
#[derive(Clone)]
pub struct StatefulInstaller {
    store: Arc<dyn BlobStore>,
    stateful_dir: PathBuf,
}

impl StatefulInstaller {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self::with_dir(store, STATEFUL_DIR)
    }

    pub fn with_dir(store: Arc<dyn BlobStore>, stateful_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            stateful_dir: stateful_dir.into(),
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.stateful_dir.join(STATEFUL_MARKER)
    }

    /// Install the stateful content and write the update marker.
    ///
    /// Returns the number of compressed bytes read.
    pub fn install(
        &self,
        sink: &ProgressSink,
        cancel: &CancellationToken,
        clobber: bool,
    ) -> Result<u64> {
        let name = Artifact::Stateful.object_name();
        let source = self.store.describe(name);

        let blob = self
            .store
            .open(name)
            .map_err(|e| ProvisionError::SourceOpenFailed {
                artifact: source.clone(),
                source: e,
            })?;
        sink.set_total(blob.size);

        if cancel.is_cancelled() {
            return Err(cancelled(name));
        }

        for stale in STALE_STATEFUL_DIRS
            .iter()
            .map(|d| self.stateful_dir.join(d))
            .chain(std::iter::once(self.marker_path()))
        {
            remove_if_exists(&stale)?;
        }

        let tee = ProgressReader::new(blob.reader, sink.clone());
        let decoder = GzDecoder::new(BufReader::with_capacity(READ_BUFFER_SIZE, tee));
        let mut archive = tar::Archive::new(decoder);
        archive.set_overwrite(true);
        archive.set_preserve_permissions(true);
        archive.unpack(&self.stateful_dir).map_err(|e| {
            let target = self.stateful_dir.display().to_string();
            classify_read_error(&source, &target, 0, e)
        })?;

        if cancel.is_cancelled() {
            return Err(ProvisionError::Cancelled(
                "stateful unpacked but marker not written, flash group was cancelled".to_string(),
            ));
        }

        let content = if clobber { "clobber" } else { "" };
        fs::write(self.marker_path(), content)?;

        info!(
            "[stateful] unpacked {} into {} (clobber={})",
            source,
            self.stateful_dir.display(),
            clobber
        );
        Ok(sink.written())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
