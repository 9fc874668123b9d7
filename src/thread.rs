//! Spawn-join functionality for workers.
//!
//! **You may not need to check this if it is OK to run workers on [`std::thread`].**
//!
//! Every worker of a benchmark job runs on its own thread, spawned through [`Thread`] and joined
//! through the returned [`JoinHandle`] before the job's start call returns. Embedders that manage
//! threads themselves (or tests that want to observe spawning) can provide their own
//! implementation.
//!
//! Note that the spawned function has no return value. Workers report through the collector, not
//! through their join handles.

use crate::Error;

/// A join handle returned by a spawn function.
pub trait JoinHandle {
    /// Join the thread, consume the boxed self. A panic of the thread is resumed on the caller.
    fn join(self: Box<Self>);
}

/// A thread management abstraction.
pub trait Thread {
    /// Spawn a new named thread using a boxed closure. Fails if the thread cannot be created.
    fn spawn(
        &self,
        name: String,
        f: Box<dyn FnOnce() + Send>,
    ) -> Result<Box<dyn JoinHandle>, Error>;
}

/// A zero-sized wrapper for [`std::thread`] functions.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultThread;

/// A wrapper for [`std::thread::JoinHandle`].
pub struct DefaultJoinHandle(std::thread::JoinHandle<()>);

impl JoinHandle for DefaultJoinHandle {
    fn join(self: Box<Self>) {
        if let Err(e) = self.0.join() {
            std::panic::resume_unwind(e);
        }
    }
}

impl Thread for DefaultThread {
    fn spawn(
        &self,
        name: String,
        f: Box<dyn FnOnce() + Send>,
    ) -> Result<Box<dyn JoinHandle>, Error> {
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|source| Error::Spawn { name, source })?;
        Ok(Box::new(DefaultJoinHandle(handle)))
    }
}
