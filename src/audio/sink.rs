//! Per-channel WAV file sink
//!
//! Each recorded channel owns one `ChannelFileSink` for the lifetime of a
//! session. Samples arrive as packed 24-bit little-endian bytes and are
//! committed through hound, which keeps the RIFF header consistent on close.

use std::fs::File;
use std::io::{self, BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hound::{WavSpec, WavWriter};

use super::convert::{unpack_i24_le, BYTES_PER_SAMPLE};

/// Output bit depth. Fixed for this recorder.
pub const BIT_DEPTH: u16 = 24;

/// Storage a sink can write a WAV file into.
pub trait SinkWriter: Write + Seek + Send {
    /// Cut the storage down to `len` bytes. Storage without a settable
    /// length keeps the extra bytes; they sit past the declared data chunk.
    fn truncate(&mut self, _len: u64) -> io::Result<()> {
        Ok(())
    }
}

impl SinkWriter for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

impl SinkWriter for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.get_mut().truncate(len as usize);
        Ok(())
    }
}

/// Errors that can occur while writing a channel file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The file could not be created or its header could not be written.
    Create { path: PathBuf, reason: String },
    /// Appending samples failed.
    Write { path: PathBuf, reason: String },
    /// Finalizing the header failed and the file could not be repaired.
    Finalize { path: PathBuf, reason: String },
    /// Finalizing failed; the header was rewritten to cover the `frames`
    /// samples that reached storage and the rest was dropped.
    Truncated {
        path: PathBuf,
        frames: u64,
        reason: String,
    },
    /// Refused a byte run that does not hold whole 24-bit samples.
    Misaligned { path: PathBuf, len: usize },
    /// The sink was already closed.
    Closed { path: PathBuf },
}

impl SinkError {
    /// Frames the file header declares after a failed close.
    pub fn frames_on_disk(&self) -> u64 {
        match self {
            SinkError::Truncated { frames, .. } => *frames,
            _ => 0,
        }
    }
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Create { path, reason } => {
                write!(f, "Failed to create {}: {}", path.display(), reason)
            }
            SinkError::Write { path, reason } => {
                write!(f, "Failed to write {}: {}", path.display(), reason)
            }
            SinkError::Finalize { path, reason } => {
                write!(f, "Failed to finalize {}: {}", path.display(), reason)
            }
            SinkError::Truncated {
                path,
                frames,
                reason,
            } => write!(
                f,
                "{} cut short at {} frames: {}",
                path.display(),
                frames,
                reason
            ),
            SinkError::Misaligned { path, len } => write!(
                f,
                "Refusing {} bytes for {}: not a whole number of 24-bit samples",
                len,
                path.display()
            ),
            SinkError::Closed { path } => write!(f, "Sink for {} is closed", path.display()),
        }
    }
}

impl std::error::Error for SinkError {}

/// What a closed sink left on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReport {
    pub path: PathBuf,
    pub frames: u64,
}

struct StorageState {
    writer: Box<dyn SinkWriter>,
    pos: u64,
    /// End of the bytes the storage accepted.
    end: u64,
}

/// Sits under the `BufWriter` and records how far writes actually got, so a
/// failed flush can be repaired from what is really on disk.
#[derive(Clone)]
struct Storage(Arc<Mutex<StorageState>>);

impl Storage {
    fn new(writer: Box<dyn SinkWriter>) -> Self {
        Self(Arc::new(Mutex::new(StorageState {
            writer,
            pos: 0,
            end: 0,
        })))
    }

    fn lock(&self) -> MutexGuard<'_, StorageState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Write for Storage {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        let n = state.writer.write(buf)?;
        state.pos += n as u64;
        state.end = state.end.max(state.pos);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lock().writer.flush()
    }
}

impl Seek for Storage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut state = self.lock();
        state.pos = state.writer.seek(pos)?;
        Ok(state.pos)
    }
}

/// One mono 24-bit WAV file.
pub struct ChannelFileSink {
    path: PathBuf,
    writer: Option<WavWriter<BufWriter<Storage>>>,
    storage: Storage,
    header_len: u64,
    frames_written: u64,
}

fn wav_spec(sample_rate: u32) -> WavSpec {
    WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: BIT_DEPTH,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Bytes hound puts before the first sample. The data chunk size is the
/// last header field.
fn header_len(spec: WavSpec) -> Result<u64, hound::Error> {
    let mut cursor = Cursor::new(Vec::new());
    WavWriter::new(&mut cursor, spec)?.finalize()?;
    Ok(cursor.into_inner().len() as u64)
}

impl ChannelFileSink {
    /// Create (or truncate) `path` and write the WAV header.
    pub fn open(path: impl Into<PathBuf>, sample_rate: u32) -> Result<Self, SinkError> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| SinkError::Create {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Self::with_writer(path, Box::new(file), sample_rate)
    }

    /// Same as [`open`](Self::open) over an arbitrary writer. `path` is only
    /// used for reporting.
    pub fn with_writer(
        path: impl Into<PathBuf>,
        writer: Box<dyn SinkWriter>,
        sample_rate: u32,
    ) -> Result<Self, SinkError> {
        let path = path.into();
        let create_err = |e: hound::Error| SinkError::Create {
            path: path.clone(),
            reason: e.to_string(),
        };
        let spec = wav_spec(sample_rate);
        let header_len = header_len(spec).map_err(create_err)?;
        let storage = Storage::new(writer);
        let writer =
            WavWriter::new(BufWriter::new(storage.clone()), spec).map_err(create_err)?;

        log::debug!("Opened channel file {:?} ({} Hz)", path, sample_rate);
        Ok(Self {
            path,
            writer: Some(writer),
            storage,
            header_len,
            frames_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Samples accepted so far. Each sample is one frame of a mono file.
    /// Some may still be buffered; `close` reports what reached storage.
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Append packed 24-bit samples.
    ///
    /// The run must hold whole samples; otherwise nothing is written. On a
    /// write failure the samples before the failing one stay accepted.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), SinkError> {
        if bytes.len() % BYTES_PER_SAMPLE != 0 {
            return Err(SinkError::Misaligned {
                path: self.path.clone(),
                len: bytes.len(),
            });
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(SinkError::Closed {
                path: self.path.clone(),
            });
        };

        for chunk in bytes.chunks_exact(BYTES_PER_SAMPLE) {
            let sample = unpack_i24_le([chunk[0], chunk[1], chunk[2]]);
            writer.write_sample(sample).map_err(|e| SinkError::Write {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
            self.frames_written += 1;
        }
        Ok(())
    }

    /// Finalize the header and release the file.
    ///
    /// If buffered samples cannot be flushed, the header is rewritten to
    /// cover the whole samples that did reach storage and
    /// `SinkError::Truncated` reports how many that is.
    pub fn close(mut self) -> Result<SinkReport, SinkError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<SinkReport, SinkError> {
        let Some(writer) = self.writer.take() else {
            return Err(SinkError::Closed {
                path: self.path.clone(),
            });
        };

        // Dropping the writer releases the BufWriter before storage is inspected.
        let finalized = writer.finalize();
        let frames = self.frames_on_storage();

        match finalized {
            Ok(()) if frames == self.frames_written => {
                log::debug!("Closed channel file {:?}: {} frames", self.path, frames);
                Ok(SinkReport {
                    path: self.path.clone(),
                    frames,
                })
            }
            Ok(()) => {
                let reason = format!(
                    "{} of {} samples reached storage",
                    frames, self.frames_written
                );
                self.repair(frames, reason)
            }
            Err(e) => self.repair(frames, e.to_string()),
        }
    }

    fn frames_on_storage(&self) -> u64 {
        let end = self.storage.lock().end;
        end.saturating_sub(self.header_len) / BYTES_PER_SAMPLE as u64
    }

    /// Cut the file to `frames` whole samples and patch the RIFF and data sizes.
    fn repair(&mut self, frames: u64, reason: String) -> Result<SinkReport, SinkError> {
        let data_len = frames * BYTES_PER_SAMPLE as u64;
        let mut state = self.storage.lock();
        let patched = if state.end < self.header_len {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "header never reached storage",
            ))
        } else {
            patch_sizes(&mut *state.writer, self.header_len, data_len)
        };
        drop(state);

        match patched {
            Ok(()) => {
                log::warn!(
                    "Channel file {:?} repaired at {} frames ({})",
                    self.path,
                    frames,
                    reason
                );
                Err(SinkError::Truncated {
                    path: self.path.clone(),
                    frames,
                    reason,
                })
            }
            Err(e) => Err(SinkError::Finalize {
                path: self.path.clone(),
                reason: format!("{}; repair failed: {}", reason, e),
            }),
        }
    }
}

fn patch_sizes(writer: &mut dyn SinkWriter, header_len: u64, data_len: u64) -> io::Result<()> {
    let riff_len = u32::try_from(header_len + data_len - 8)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "file exceeds 4 GiB"))?;
    writer.truncate(header_len + data_len)?;
    writer.seek(SeekFrom::Start(4))?;
    writer.write_all(&riff_len.to_le_bytes())?;
    writer.seek(SeekFrom::Start(header_len - 4))?;
    writer.write_all(&(data_len as u32).to_le_bytes())?;
    writer.flush()
}

impl Drop for ChannelFileSink {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(e) = self.finish() {
                log::error!("Error finalizing channel file on drop: {}", e);
            }
        }
    }
}
