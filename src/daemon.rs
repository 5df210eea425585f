//! Plumbing for running as a system service.
//!
//! Daemonization proper (forking, privilege drop, chroot) is the service
//! manager's business; what remains here is the PID file and the
//! permission bits on a freshly bound socket.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

//----------- PidFile ----------------------------------------------------------

/// A created PID file, removed again by [`remove()`](Self::remove).
#[derive(Debug)]
pub struct PidFile {
    /// Where the file was written.
    path: Utf8PathBuf,
}

impl PidFile {
    /// Write the PID file.
    ///
    /// Creation is exclusive: an existing file means another instance owns
    /// this path, and startup must abort.
    pub fn create(path: &Utf8Path) -> Result<Self, PidFileError> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path())
            .map_err(|err| PidFileError {
                path: path.to_owned(),
                error: err,
            })?;

        let result = fs::set_permissions(path.as_std_path(), fs::Permissions::from_mode(0o644))
            .and_then(|()| writeln!(file, "{}", std::process::id()));
        if let Err(err) = result {
            let _ = fs::remove_file(path.as_std_path());
            return Err(PidFileError {
                path: path.to_owned(),
                error: err,
            });
        }

        Ok(Self {
            path: path.to_owned(),
        })
    }

    /// Remove the PID file on clean shutdown.
    pub fn remove(self) {
        if let Err(err) = fs::remove_file(self.path.as_std_path()) {
            warn!("Could not remove the PID file '{}': {err}", self.path);
        }
    }
}

/// An error creating the PID file.
#[derive(Debug)]
pub struct PidFileError {
    /// The offending path.
    path: Utf8PathBuf,

    /// The actual error.
    error: io::Error,
}

impl std::error::Error for PidFileError {}

impl fmt::Display for PidFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "the PID file '{}' could not be created: {}",
            self.path, self.error
        )
    }
}

//----------- Socket permissions -----------------------------------------------

/// Apply the configured permission bits to a freshly bound socket.
pub fn set_socket_mode(path: &Utf8Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path.as_std_path(), fs::Permissions::from_mode(mode))
}

//============ Tests =========================================================
