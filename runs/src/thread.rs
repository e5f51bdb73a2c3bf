//! One OS thread behind a uniform spawn/join/cancel surface.

use std::any::Any;
use std::io;
use std::thread;

use thiserror::Error;
use tracing::debug;

use crate::CancelToken;

/// The OS refused to create the thread. Callers get this back from
/// [`ThreadHandle::spawn`] instead of a handle that can never be joined.
#[derive(Debug, Error)]
#[error("failed to spawn OS thread")]
pub struct SpawnError(#[from] io::Error);

#[derive(Debug, Error)]
pub enum JoinError {
    /// The thread terminated by panicking. Carries the panic message when
    /// the payload was a string, the usual case.
    #[error("thread panicked: {message}")]
    Panicked { message: String },
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Owns one spawned OS thread and its cancellation token.
///
/// Joining consumes the handle. Dropping an unjoined handle requests
/// cancellation and detaches the thread; it keeps running until its next
/// safe point, but nothing will ever wait for it again.
pub struct ThreadHandle<T = ()> {
    join: Option<thread::JoinHandle<T>>,
    cancel: CancelToken,
}

impl<T> ThreadHandle<T>
where
    T: Send + 'static,
{
    /// Spawn exactly one OS thread running `f`, handing it the token it
    /// should poll at its safe points.
    pub fn spawn<F>(name: Option<&str>, f: F) -> Result<Self, SpawnError>
    where
        F: FnOnce(CancelToken) -> T + Send + 'static,
    {
        let cancel = CancelToken::new();
        let token = cancel.clone();

        let mut builder = thread::Builder::new();
        if let Some(name) = name {
            builder = builder.name(name.to_string());
        }
        let join = builder.spawn(move || f(token))?;

        Ok(Self {
            join: Some(join),
            cancel,
        })
    }
}

impl<T> ThreadHandle<T> {
    /// Request cooperative cancellation. The thread keeps running until it
    /// next observes its token.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether the thread has terminated. Non-blocking; `join` still has to
    /// be called to observe its outcome.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_some_and(thread::JoinHandle::is_finished)
    }

    /// Block until the thread terminates and return its result. A panic in
    /// the thread surfaces here instead of disappearing.
    pub fn join(mut self) -> Result<T, JoinError> {
        let join = self
            .join
            .take()
            .expect("join handle is present until joined or dropped");
        match join.join() {
            Ok(value) => Ok(value),
            Err(payload) => Err(JoinError::Panicked {
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl<T> Drop for ThreadHandle<T> {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.cancel.cancel();
            if let Some(name) = join.thread().name() {
                debug!(thread = name, "detaching unjoined thread");
            }
            drop(join);
        }
    }
}
