//! Delivery executor.
//!
//! Copies an artifact out of the shared store into the caller's destination.
//! The destination root must already exist; nothing here creates directories.
//!
//! Bytes are written to a hidden temporary file next to the destination and
//! renamed into place only after the whole copy succeeded, so the destination
//! path either holds a complete copy or is untouched.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub use crate::domain::session::{CopyFailure, CopyFailureReason};

const COPY_BUFFER_BYTES: usize = 64 * 1024;

/// A completed copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub bytes: u64,
}

/// Trait for copying an artifact to its destination.
#[async_trait]
pub trait DeliveryExecutor: Send + Sync {
    /// Copy `source` to `destination`.
    ///
    /// # Errors
    /// - `SourceVanished` if the source no longer exists
    /// - `DestinationUnwritable` if the destination cannot be created or written
    /// - `IoError` for anything else
    async fn copy(&self, source: &Path, destination: &Path) -> Result<Delivery, CopyFailure>;
}

// ============================================================================
// Production Implementation on the filesystem
// ============================================================================

/// Filesystem copy with temp-file-and-rename semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDelivery;

impl FsDelivery {
    pub fn new() -> Self {
        Self
    }
}

fn temp_path_for(destination: &Path) -> Option<PathBuf> {
    let parent = destination.parent()?;
    let file_name = destination.file_name()?.to_string_lossy();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    Some(parent.join(format!(".{file_name}.{}.part", &suffix[..8])))
}

/// Classify an error raised while creating or writing the destination.
fn write_failure(error: std::io::Error, destination: &Path) -> CopyFailure {
    let reason = match error.kind() {
        ErrorKind::NotFound
        | ErrorKind::PermissionDenied
        | ErrorKind::ReadOnlyFilesystem
        | ErrorKind::IsADirectory
        | ErrorKind::NotADirectory
        | ErrorKind::StorageFull => CopyFailureReason::DestinationUnwritable,
        _ => CopyFailureReason::IoError,
    };
    CopyFailure::new(reason, format!("{}: {error}", destination.display()))
}

/// Classify an error raised while opening or reading the source.
fn read_failure(error: std::io::Error, source: &Path) -> CopyFailure {
    let reason = match error.kind() {
        ErrorKind::NotFound => CopyFailureReason::SourceVanished,
        _ => CopyFailureReason::IoError,
    };
    CopyFailure::new(reason, format!("{}: {error}", source.display()))
}

#[async_trait]
impl DeliveryExecutor for FsDelivery {
    async fn copy(&self, source: &Path, destination: &Path) -> Result<Delivery, CopyFailure> {
        let mut reader = tokio::fs::File::open(source)
            .await
            .map_err(|e| read_failure(e, source))?;

        let temp_path = temp_path_for(destination).ok_or_else(|| {
            CopyFailure::new(
                CopyFailureReason::DestinationUnwritable,
                format!("{} has no parent directory", destination.display()),
            )
        })?;

        let mut writer = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
            .map_err(|e| write_failure(e, destination))?;

        // Remove the partial file on every early return below
        let temp_guard = scopeguard::guard(temp_path.clone(), |path| {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::debug!(path = %path.display(), error = %e, "Could not remove partial copy");
            }
        });

        let mut buffer = vec![0u8; COPY_BUFFER_BYTES];
        let mut bytes = 0u64;
        loop {
            let read = reader
                .read(&mut buffer)
                .await
                .map_err(|e| read_failure(e, source))?;
            if read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..read])
                .await
                .map_err(|e| write_failure(e, destination))?;
            bytes += read as u64;
        }

        writer
            .flush()
            .await
            .map_err(|e| write_failure(e, destination))?;
        writer
            .sync_all()
            .await
            .map_err(|e| write_failure(e, destination))?;
        drop(writer);

        tokio::fs::rename(&temp_path, destination)
            .await
            .map_err(|e| write_failure(e, destination))?;

        // Renamed into place; nothing left to clean up
        scopeguard::ScopeGuard::into_inner(temp_guard);

        tracing::debug!(
            source = %source.display(),
            destination = %destination.display(),
            bytes,
            "Artifact copied"
        );

        Ok(Delivery { bytes })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

/// Delivery executor for testing.
///
/// Performs real filesystem copies through [`FsDelivery`], but can hold a copy
/// in flight until a trigger fires, or fail it outright.
///
/// # Example
/// ```ignore
/// let delivery = MockDelivery::new();
/// let trigger = delivery.add_trigger();
/// // ... the next copy blocks here ...
/// trigger.send(()).unwrap();
/// ```
#[derive(Clone, Default)]
pub struct MockDelivery {
    inner: FsDelivery,
    plan: Arc<Mutex<VecDeque<MockCopy>>>,
    calls: Arc<Mutex<Vec<MockCopyCall>>>,
    in_flight: Arc<AtomicUsize>,
}

enum MockCopy {
    Triggered(oneshot::Receiver<()>),
    Fail(CopyFailure),
}

/// Record of a copy requested from the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCopyCall {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl MockDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the next copy until the returned sender fires (or is dropped).
    pub fn add_trigger(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.plan.lock().push_back(MockCopy::Triggered(rx));
        tx
    }

    /// Fail the next copy without touching the filesystem.
    pub fn add_failure(&self, failure: CopyFailure) {
        self.plan.lock().push_back(MockCopy::Fail(failure));
    }

    pub fn get_calls(&self) -> Vec<MockCopyCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Copies currently executing.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliveryExecutor for MockDelivery {
    async fn copy(&self, source: &Path, destination: &Path) -> Result<Delivery, CopyFailure> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.clone();
        let _guard = scopeguard::guard((), move |_| {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        self.calls.lock().push(MockCopyCall {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
        });

        let step = self.plan.lock().pop_front();
        match step {
            Some(MockCopy::Fail(failure)) => return Err(failure),
            Some(MockCopy::Triggered(rx)) => {
                // Proceed whether the trigger fired or was dropped
                let _ = rx.await;
            }
            None => {}
        }

        self.inner.copy(source, destination).await
    }
}
