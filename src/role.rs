//! Concurrent peer roles.
//!
//! A role is a closure run on its own named thread: an acceptor, a churn
//! client, a late connector. The role tells the scenario when it has reached
//! the point the scenario waits for through its [`Readiness`], and its result
//! (or panic) comes back at [`RoleHandle::join`].

use crate::error::Error;
use std::any::Any;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Handed to a role's body; signal it once the role is ready.
pub struct Readiness {
    sender: Sender<()>,
}

impl Readiness {
    /// Marks the role ready. Extra signals are harmless.
    pub fn signal(&self) {
        // The handle may already be gone; nobody is waiting then.
        let _ = self.sender.send(());
    }
}

/// A running role. Join it to get its result; a handle dropped unjoined is
/// joined on drop and its failure logged.
pub struct RoleHandle<T> {
    name: String,
    handle: Option<JoinHandle<Result<T, Error>>>,
    ready: Receiver<()>,
    // Result of a role that finished inside wait_ready without failing.
    finished: Option<T>,
}

/// Spawns `body` as a role named `name`.
pub fn spawn<T, F>(name: impl Into<String>, body: F) -> Result<RoleHandle<T>, Error>
where
    T: Send + 'static,
    F: FnOnce(&Readiness) -> Result<T, Error> + Send + 'static,
{
    let name = name.into();
    let (sender, ready) = channel();
    let readiness = Readiness { sender };

    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || body(&readiness))?;
    debug!(role = %name, "Spawned role");

    Ok(RoleHandle {
        name,
        handle: Some(handle),
        ready,
        finished: None,
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl<T> RoleHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits until the role signals readiness.
    ///
    /// If the role finishes without signalling, it is joined here: a failed
    /// or panicked role reports that failure, a role that returned normally
    /// reports [`Error::RoleNotReady`] and keeps its result for
    /// [`join`](Self::join).
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<(), Error> {
        match self.ready.recv_timeout(timeout) {
            Ok(()) => {
                debug!(role = %self.name, "Role ready");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => Err(Error::timeout("role readiness", timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                let value = self.join_thread()?;
                self.finished = Some(value);
                Err(Error::RoleNotReady {
                    name: self.name.clone(),
                })
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the role to finish and returns its result.
    pub fn join(mut self) -> Result<T, Error> {
        if let Some(value) = self.finished.take() {
            return Ok(value);
        }
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<T, Error> {
        let Some(handle) = self.handle.take() else {
            return Err(Error::RoleNotReady {
                name: self.name.clone(),
            });
        };
        match handle.join() {
            Ok(Ok(value)) => {
                debug!(role = %self.name, "Role finished");
                Ok(value)
            }
            Ok(Err(err)) => Err(Error::RoleFailed {
                name: self.name.clone(),
                source: Box::new(err),
            }),
            Err(payload) => Err(Error::RolePanicked {
                name: self.name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl<T> Drop for RoleHandle<T> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(err) = self.join_thread() {
                warn!(role = %self.name, %err, "Unjoined role failed");
            }
        }
    }
}

impl<T> std::fmt::Debug for RoleHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Several roles joined together, in creation order.
pub struct RoleSet<T> {
    roles: Vec<RoleHandle<T>>,
}

impl<T: Send + 'static> RoleSet<T> {
    pub fn new() -> Self {
        Self { roles: Vec::new() }
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, body: F) -> Result<(), Error>
    where
        F: FnOnce(&Readiness) -> Result<T, Error> + Send + 'static,
    {
        self.roles.push(spawn(name, body)?);
        Ok(())
    }

    /// Waits for every role to signal readiness, sharing one timeout.
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<(), Error> {
        let start = std::time::Instant::now();
        for role in &mut self.roles {
            let left = timeout.saturating_sub(start.elapsed());
            role.wait_ready(left)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Joins every role, even after one failed, and returns the results in
    /// creation order or the first failure.
    pub fn join_all(self) -> Result<Vec<T>, Error> {
        let mut values = Vec::with_capacity(self.roles.len());
        let mut first_err = None;
        for role in self.roles {
            match role.join() {
                Ok(value) => values.push(value),
                Err(err) if first_err.is_none() => first_err = Some(err),
                Err(err) => warn!(%err, "Additional role failure"),
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }
}

impl<T: Send + 'static> Default for RoleSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
