//! Destination sink with an ordered byte-transform pipeline:
//! optional gzip compression, then optional SHA-256 hashing of the
//! written (post-compression) stream, then an optional HMAC-SHA256
//! signature over the final digest at close.
//!
//! The pipeline is finalized by `open()`: every stage must be chosen
//! before the first byte is written, and changing an option afterwards is
//! a configuration error, not a silent no-op. Closing flushes everything
//! and surfaces flush failures.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use kestrel_common::config::{ExistingFileBehavior, ExportConfig};
use kestrel_common::error::ExportError;

/// Where exported bytes go.
pub enum ExportDestination {
    /// A file path plus the policy for an already-existing file.
    File {
        path: PathBuf,
        behavior: ExistingFileBehavior,
    },
    /// Any writable byte sink (network stream, buffer).
    Writer(Box<dyn Write + Send>),
}

impl ExportDestination {
    pub fn file(path: impl Into<PathBuf>, behavior: ExistingFileBehavior) -> Self {
        Self::File {
            path: path.into(),
            behavior,
        }
    }

    pub fn writer(w: impl Write + Send + 'static) -> Self {
        Self::Writer(Box::new(w))
    }

    fn open(self) -> Result<Box<dyn Write + Send>, ExportError> {
        match self {
            Self::Writer(w) => Ok(w),
            Self::File { path, behavior } => {
                let file: File = match behavior {
                    ExistingFileBehavior::Append => {
                        OpenOptions::new().create(true).append(true).open(&path)?
                    }
                    ExistingFileBehavior::Overwrite => File::create(&path)?,
                    ExistingFileBehavior::Fail => {
                        match OpenOptions::new().create_new(true).write(true).open(&path) {
                            Ok(f) => f,
                            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                                return Err(ExportError::DestinationExists(
                                    path.display().to_string(),
                                ));
                            }
                            Err(e) => return Err(e.into()),
                        }
                    }
                };
                Ok(Box::new(file))
            }
        }
    }
}

/// Counts and (optionally) hashes everything written through it.
struct MeteredWriter {
    inner: Box<dyn Write + Send>,
    hasher: Option<Arc<Mutex<Sha256>>>,
    bytes_written: Arc<Mutex<u64>>,
}

impl Write for MeteredWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(hasher) = &self.hasher {
            hasher.lock().update(&buf[..n]);
        }
        *self.bytes_written.lock() += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

enum Stage {
    Plain(MeteredWriter),
    Gzip(GzEncoder<MeteredWriter>),
}

/// Builder for the transform pipeline. All options must be set before
/// `open`; the builder seals itself on open and rejects later changes.
#[derive(Debug, Default)]
pub struct TransformSinkBuilder {
    compress: bool,
    hash: bool,
    sign_key: Option<Vec<u8>>,
    sealed: bool,
}

impl TransformSinkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed stage toggles from the export configuration section. Signing
    /// still needs a key via [`TransformSinkBuilder::sign_with_key`].
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            compress: config.compress,
            hash: config.hash || config.sign,
            sign_key: None,
            sealed: false,
        }
    }

    pub fn compress(&mut self, on: bool) -> Result<&mut Self, ExportError> {
        self.check_open()?;
        self.compress = on;
        Ok(self)
    }

    pub fn hash(&mut self, on: bool) -> Result<&mut Self, ExportError> {
        self.check_open()?;
        self.hash = on;
        Ok(self)
    }

    /// Sign the final digest with HMAC-SHA256 under `key`. Implies hashing.
    pub fn sign_with_key(&mut self, key: Vec<u8>) -> Result<&mut Self, ExportError> {
        self.check_open()?;
        self.hash = true;
        self.sign_key = Some(key);
        Ok(self)
    }

    fn check_open(&self) -> Result<(), ExportError> {
        if self.sealed {
            Err(ExportError::PipelineSealed)
        } else {
            Ok(())
        }
    }

    /// Finalize the pipeline and open the destination. Failing to open
    /// (e.g. fail-on-exists) aborts before any byte is written.
    pub fn open(&mut self, destination: ExportDestination) -> Result<TransformSink, ExportError> {
        self.check_open()?;
        self.sealed = true;

        let hasher = self.hash.then(|| Arc::new(Mutex::new(Sha256::new())));
        let bytes_written = Arc::new(Mutex::new(0));
        let metered = MeteredWriter {
            inner: destination.open()?,
            hasher: hasher.clone(),
            bytes_written: bytes_written.clone(),
        };
        let stage = if self.compress {
            Stage::Gzip(GzEncoder::new(metered, Compression::default()))
        } else {
            Stage::Plain(metered)
        };
        Ok(TransformSink {
            stage: Some(stage),
            hasher,
            sign_key: self.sign_key.clone(),
            bytes_written,
        })
    }
}

/// Outcome of a completed export stream.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SinkSummary {
    /// Bytes that reached the destination (post-compression).
    pub bytes_written: u64,
    /// Hex SHA-256 of the destination byte stream, when hashing was on.
    pub digest: Option<String>,
    /// Hex HMAC-SHA256 over the digest, when signing was on.
    pub signature: Option<String>,
}

/// The open, finalized pipeline. Write LDIF (or anything) through it, then
/// `close()` to flush and collect the digest/signature.
pub struct TransformSink {
    stage: Option<Stage>,
    hasher: Option<Arc<Mutex<Sha256>>>,
    sign_key: Option<Vec<u8>>,
    bytes_written: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for TransformSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformSink")
            .field("open", &self.stage.is_some())
            .field("hashing", &self.hasher.is_some())
            .field("signing", &self.sign_key.is_some())
            .field("bytes_written", &*self.bytes_written.lock())
            .finish()
    }
}

impl Write for TransformSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stage.as_mut().expect("sink is open") {
            Stage::Plain(w) => w.write(buf),
            Stage::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stage.as_mut().expect("sink is open") {
            Stage::Plain(w) => w.flush(),
            Stage::Gzip(w) => w.flush(),
        }
    }
}

impl TransformSink {
    /// Flush every stage and report the stream summary. Flush failures are
    /// surfaced, not swallowed.
    pub fn close(mut self) -> Result<SinkSummary, ExportError> {
        let stage = self.stage.take().expect("sink is open");
        let mut metered = match stage {
            Stage::Plain(w) => w,
            Stage::Gzip(encoder) => encoder.finish()?,
        };
        metered.flush()?;

        let digest_bytes: Option<[u8; 32]> = self
            .hasher
            .as_ref()
            .map(|h| h.lock().clone().finalize().into());
        let digest = digest_bytes.map(hex_encode);
        let signature = match (&self.sign_key, &digest_bytes) {
            (Some(key), Some(d)) => Some(hex_encode(hmac_sha256(key, d))),
            _ => None,
        };
        Ok(SinkSummary {
            bytes_written: *self.bytes_written.lock(),
            digest,
            signature,
        })
    }
}

fn hex_encode(bytes: [u8; 32]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// HMAC-SHA-256 (RFC 2104).
fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    const BLOCK_SIZE: usize = 64;

    let key_prime = if key.len() > BLOCK_SIZE {
        let hash: [u8; 32] = Sha256::digest(key).into();
        let mut padded = [0u8; BLOCK_SIZE];
        padded[..32].copy_from_slice(&hash);
        padded
    } else {
        let mut padded = [0u8; BLOCK_SIZE];
        padded[..key.len()].copy_from_slice(key);
        padded
    };

    let mut ipad = [0x36u8; BLOCK_SIZE];
    let mut opad = [0x5cu8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        ipad[i] ^= key_prime[i];
        opad[i] ^= key_prime[i];
    }

    let inner_hash: [u8; 32] = {
        let mut h = Sha256::new();
        h.update(ipad);
        h.update(message);
        h.finalize().into()
    };

    let mut h = Sha256::new();
    h.update(opad);
    h.update(inner_hash);
    h.finalize().into()
}
