//! Cross-process install lock.
//!
//! One advisory OS lock per `{version_dir}/.lock`.  The in-process
//! single-flight registry already serializes installs within a process; this
//! lock serializes attempts from different processes on the same cache.  The
//! OS releases the lock automatically if the holder crashes, so no staleness
//! bookkeeping is needed.

use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tokio::sync::oneshot;

use kiln_types::CoreError;

/// RAII guard over the version directory's lock file.
///
/// The lock is held by a dedicated thread (fd-lock guards borrow their lock,
/// which does not mix with a suspendable install worker); dropping the guard
/// signals the thread to release.
#[derive(Debug)]
pub struct VersionLock {
    release_tx: Option<oneshot::Sender<()>>,
    path: PathBuf,
}

impl VersionLock {
    /// Acquire the lock, blocking (off-runtime) until it is free.
    pub async fn acquire(path: PathBuf) -> Result<Self, CoreError> {
        Self::acquire_inner(path, false).await
    }

    /// Acquire the lock only if it is immediately free.
    pub async fn try_acquire(path: PathBuf) -> Result<Option<Self>, CoreError> {
        match Self::acquire_inner(path, true).await {
            Ok(lock) => Ok(Some(lock)),
            Err(err) if err.details.reason.as_deref() == Some("LOCK_HELD") => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn acquire_inner(path: PathBuf, try_only: bool) -> Result<Self, CoreError> {
        let (ready_tx, ready_rx) = oneshot::channel::<io::Result<()>>();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let thread_path = path.clone();
        std::thread::Builder::new()
            .name("kiln-version-lock".to_owned())
            .spawn(move || hold_lock(thread_path, try_only, ready_tx, release_rx))
            .map_err(|e| CoreError::from_io("spawning lock holder thread", &e))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                release_tx: Some(release_tx),
                path,
            }),
            Ok(Err(e)) if try_only && e.kind() == io::ErrorKind::WouldBlock => {
                let mut err = CoreError::download_failed(format!(
                    "install lock at {} held by another process",
                    path.display()
                ));
                err.details.reason = Some("LOCK_HELD".to_owned());
                Err(err)
            }
            Ok(Err(e)) => Err(CoreError::from_io("acquiring install lock", &e)),
            Err(_) => Err(CoreError::download_failed(
                "install lock holder thread exited unexpectedly",
            )),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for VersionLock {
    fn drop(&mut self) {
        // Dropping the sender wakes the holder thread, which releases the
        // OS lock and exits.
        self.release_tx.take();
    }
}

/// Holder thread body: lock, report, park until released.
fn hold_lock(
    path: PathBuf,
    try_only: bool,
    ready_tx: oneshot::Sender<io::Result<()>>,
    release_rx: oneshot::Receiver<()>,
) {
    let open = || {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
    };

    let file = match open() {
        Ok(f) => f,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut lock = fd_lock::RwLock::new(file);
    let guard = if try_only {
        match lock.try_write() {
            Ok(g) => g,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        }
    } else {
        match lock.write() {
            Ok(g) => g,
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        }
    };

    let _ = ready_tx.send(Ok(()));
    // Parks until the VersionLock is dropped (sender side closes).
    let _ = release_rx.blocking_recv();
    drop(guard);
}
