/*!
 * Output Capture
 *
 * Redirects the process's standard output and standard error into pipes
 * while a closure runs, so a test can assert on what a crashing closure
 * printed before it faulted.
 *
 * Descriptors 1 and 2 are process-wide: anything written to them by any
 * thread during a capture is captured. Captures are serialized by one
 * process-wide lock. Each pipe is drained by its own reader thread so that
 * a chatty closure never blocks on a full pipe.
 */

use crate::core::errors::{BridgeError, BridgeResult};
use crate::core::types::Outcome;
use parking_lot::{Mutex, MutexGuard};
use std::borrow::Cow;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::thread::JoinHandle;
use tracing::{debug, warn};

static CAPTURE_LOCK: Mutex<()> = Mutex::new(());

/// Bytes written to standard output and standard error during a capture
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CapturedOutput {
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Outcome of a run together with the output it produced
#[derive(Debug)]
pub struct Captured<T> {
    pub outcome: Outcome<T>,
    pub output: CapturedOutput,
}

/// One descriptor pointed at a pipe, with its original saved aside
struct Redirection {
    target: RawFd,
    saved: OwnedFd,
    reader: Option<JoinHandle<io::Result<Vec<u8>>>>,
}

impl Redirection {
    fn begin(target: RawFd) -> BridgeResult<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(BridgeError::Capture(io::Error::last_os_error()));
        }
        let (read_end, write_end) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let saved = unsafe { libc::dup(target) };
        if saved < 0 {
            return Err(BridgeError::Capture(io::Error::last_os_error()));
        }
        let saved = unsafe { OwnedFd::from_raw_fd(saved) };

        // Started before the swap so the pipe never fills
        let reader = std::thread::Builder::new()
            .name(format!("fault-bridge-capture-{}", target))
            .spawn(move || {
                let mut buffer = Vec::new();
                File::from(read_end).read_to_end(&mut buffer)?;
                Ok(buffer)
            })
            .map_err(|e| BridgeError::spawn("output capture", e))?;

        if unsafe { libc::dup2(write_end.as_raw_fd(), target) } < 0 {
            let err = io::Error::last_os_error();
            // Closing the only write end lets the reader finish
            drop(write_end);
            let _ = reader.join();
            return Err(BridgeError::Capture(err));
        }
        // `target` now holds the only write end
        drop(write_end);

        Ok(Self {
            target,
            saved,
            reader: Some(reader),
        })
    }

    /// Point the descriptor back at its original and collect what was written
    fn finish(&mut self) -> BridgeResult<Vec<u8>> {
        let reader = match self.reader.take() {
            Some(reader) => reader,
            None => return Ok(Vec::new()),
        };

        // Replacing `target` closes the pipe's last write end
        if unsafe { libc::dup2(self.saved.as_raw_fd(), self.target) } < 0 {
            return Err(BridgeError::Capture(io::Error::last_os_error()));
        }

        match reader.join() {
            Ok(result) => result.map_err(BridgeError::Capture),
            Err(_) => Err(BridgeError::Capture(io::Error::new(
                io::ErrorKind::Other,
                "capture reader panicked",
            ))),
        }
    }
}

impl Drop for Redirection {
    fn drop(&mut self) {
        if self.reader.is_some() {
            if let Err(e) = self.finish() {
                warn!(fd = self.target, error = %e, "Output capture not restored cleanly");
            }
        }
    }
}

/// Standard output and error redirected until [`OutputCapture::finish`]
///
/// Dropping an unfinished capture restores both descriptors and discards
/// the output.
pub struct OutputCapture {
    stdout: Redirection,
    stderr: Redirection,
    _serial: MutexGuard<'static, ()>,
}

impl OutputCapture {
    /// Start capturing; blocks while another capture is in progress
    pub fn begin() -> BridgeResult<Self> {
        let serial = CAPTURE_LOCK.lock();
        flush_std();

        let stdout = Redirection::begin(libc::STDOUT_FILENO)?;
        let stderr = Redirection::begin(libc::STDERR_FILENO)?;
        debug!("Output capture started");
        Ok(Self {
            stdout,
            stderr,
            _serial: serial,
        })
    }

    /// Restore both descriptors and return everything written meanwhile
    pub fn finish(mut self) -> BridgeResult<CapturedOutput> {
        flush_std();
        let stdout = self.stdout.finish()?;
        let stderr = self.stderr.finish()?;
        debug!(stdout = stdout.len(), stderr = stderr.len(), "Output capture finished");
        Ok(CapturedOutput { stdout, stderr })
    }
}

fn flush_std() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
}
