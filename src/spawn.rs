//! Spawning a command on the end of an endpoint.
//!
//! The child gets one end of a socketpair as its stdin and stdout; the
//! parent talks to it through a normal endpoint. When the child exits, its
//! end closes and the endpoint reports a peer close.

use std::ffi::OsStr;
use std::io;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::process::{Child, Command, ExitStatus, Stdio};

use log::{debug, warn};

use crate::endpoint::{EndpointEvents, EndpointId};
use crate::error::{Error, Result};
use crate::runtime::Runtime;

/// A spawned child and the endpoint connected to it.
pub struct Spawned {
    pub endpoint: EndpointId,
    child: Child,
}

impl Spawned {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking check of the child's exit status.
    pub fn try_status(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Kills the child outright. The endpoint sees the close like any other
    /// peer disconnect.
    pub fn kill(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("kill of pid {} failed: {}", self.child.id(), e);
        }

        // Reap so the child cannot linger as a zombie.
        let _ = self.child.wait();
    }

    /// Takes the underlying process handle.
    pub fn into_child(self) -> (EndpointId, Child) {
        (self.endpoint, self.child)
    }
}

impl Runtime {
    /// Spawns `program` with `args`, its stdin and stdout tied to a new
    /// socketpair endpoint.
    ///
    /// The endpoint's connected callback fires on the next loop iteration;
    /// after that, anything the child writes to stdout arrives as read
    /// events, and [`Runtime::write`](Runtime::write) feeds its stdin.
    pub fn spawn_command(
        &mut self,
        program: impl AsRef<OsStr>,
        args: impl IntoIterator<Item = impl AsRef<OsStr>>,
        events: EndpointEvents,
    ) -> Result<Spawned> {
        let (endpoint, theirs) = self.new_socketpair(events)?;

        let stdin_copy = theirs.try_clone().map_err(|e| {
            warn!("cannot duplicate socketpair end: {}", e);
            let _ = self.close(endpoint);
            Error::Internal
        })?;

        // Safety: both fds are freshly owned duplicates handed to the child.
        let child = unsafe {
            Command::new(&program)
                .args(args)
                .stdin(Stdio::from_raw_fd(stdin_copy.into_raw_fd()))
                .stdout(Stdio::from_raw_fd(theirs.into_raw_fd()))
                .spawn()
        };

        match child {
            Ok(child) => {
                debug!(
                    "spawned {:?} as pid {} on endpoint {}",
                    program.as_ref(),
                    child.id(),
                    endpoint
                );
                Ok(Spawned { endpoint, child })
            }
            Err(e) => {
                warn!("failed to spawn {:?}: {}", program.as_ref(), e);
                let _ = self.close(endpoint);
                Err(Error::Internal)
            }
        }
    }
}
