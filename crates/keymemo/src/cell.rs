//! Single-assignment value holder used for single-flight population
//!
//! A cell starts `Pending` and moves exactly once to `Ready` or `Failed`. Threads that
//! wait on a pending cell park on its condition variable until that transition.

use crate::digest::KeyDigest;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
enum State<V> {
    Pending,
    Ready(V),
    Failed(String),
}

#[derive(Debug)]
pub(crate) struct Cell<V> {
    state: Mutex<State<V>>,
    resolved: Condvar,
}

impl<V: Clone> Cell<V> {
    pub(crate) fn pending() -> Self {
        Self {
            state: Mutex::new(State::Pending),
            resolved: Condvar::new(),
        }
    }

    pub(crate) fn ready(value: V) -> Self {
        Self {
            state: Mutex::new(State::Ready(value)),
            resolved: Condvar::new(),
        }
    }

    /// Block until the cell leaves `Pending`, then return its value.
    ///
    /// There is no timeout. A cell always reaches a terminal state as long as the
    /// fetch that created it returns.
    pub(crate) fn wait(&self, digest: KeyDigest) -> Result<V> {
        let mut state = self.state.lock();
        loop {
            match &*state {
                State::Ready(value) => return Ok(value.clone()),
                State::Failed(message) => return Err(Error::fetch_failed(digest, message.clone())),
                State::Pending => self.resolved.wait(&mut state),
            }
        }
    }

    /// Value of a ready cell, `None` while pending or after a failure
    pub(crate) fn get(&self) -> Option<V> {
        match &*self.state.lock() {
            State::Ready(value) => Some(value.clone()),
            State::Pending | State::Failed(_) => None,
        }
    }

    /// Terminal outcome without blocking, `None` while pending
    pub(crate) fn poll(&self, digest: KeyDigest) -> Option<Result<V>> {
        match &*self.state.lock() {
            State::Ready(value) => Some(Ok(value.clone())),
            State::Failed(message) => Some(Err(Error::fetch_failed(digest, message.clone()))),
            State::Pending => None,
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), State::Pending)
    }

    pub(crate) fn is_failed(&self) -> bool {
        matches!(*self.state.lock(), State::Failed(_))
    }

    /// Move to `Ready`. Returns false if the cell was already terminal.
    pub(crate) fn resolve(&self, value: V) -> bool {
        self.settle(State::Ready(value))
    }

    /// Move to `Failed`. Returns false if the cell was already terminal.
    pub(crate) fn fail(&self, message: String) -> bool {
        self.settle(State::Failed(message))
    }

    fn settle(&self, terminal: State<V>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = terminal;
        drop(state);
        self.resolved.notify_all();
        true
    }
}
