//! Bounded single-producer channel moving ownership of capture buffers from
//! the poll loop to the accumulator.

use std::fmt;
use std::time::Instant;

use flume::{Receiver, RecvTimeoutError, Sender};

use crate::errors::{Error, Result};

/// Returned when popping from an empty, closed channel.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct PopError;

impl fmt::Display for PopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "popping from an empty and closed channel")
    }
}

impl std::error::Error for PopError {}

/// Returned by a popping operation with a deadline.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TryPopError {
    /// Nothing arrived before the deadline.
    Empty,
    /// The channel is empty and closed.
    Closed,
}

impl fmt::Display for TryPopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TryPopError::Empty => write!(f, "nothing arrived before the deadline"),
            TryPopError::Closed => write!(f, "popping from an empty and closed channel"),
        }
    }
}

impl std::error::Error for TryPopError {}

/// Returned when pushing into a channel whose reader is gone. Carries the
/// item back.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct PushError<T>(pub T);

impl<T> fmt::Display for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pushing into a closed channel")
    }
}

impl<T: fmt::Debug> std::error::Error for PushError<T> {}

pub struct HandoffSender<T> {
    tx: Sender<T>,
}

impl<T> HandoffSender<T> {
    /// Blocks while the channel is full.
    pub fn push(&self, item: T) -> std::result::Result<(), PushError<T>> {
        self.tx.send(item).map_err(|e| PushError(e.into_inner()))
    }

    /// The reader has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }
}

pub struct HandoffReceiver<T> {
    rx: Receiver<T>,
}

impl<T> HandoffReceiver<T> {
    /// Blocks until an item arrives or the channel closes.
    pub fn pop(&self) -> std::result::Result<T, PopError> {
        self.rx.recv().map_err(|_| PopError)
    }

    pub fn pop_until(&self, deadline: Instant) -> std::result::Result<T, TryPopError> {
        self.rx.recv_deadline(deadline).map_err(|e| match e {
            RecvTimeoutError::Timeout => TryPopError::Empty,
            RecvTimeoutError::Disconnected => TryPopError::Closed,
        })
    }
}

pub fn handoff<T>(capacity: usize) -> Result<(HandoffSender<T>, HandoffReceiver<T>)> {
    if capacity == 0 {
        return Err(Error::InvalidConfig {
            field: "handoff_capacity",
            reason: "must be at least 1".to_owned(),
        });
    }
    let (tx, rx) = flume::bounded(capacity);
    Ok((HandoffSender { tx }, HandoffReceiver { rx }))
}
