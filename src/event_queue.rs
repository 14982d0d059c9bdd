// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Pollable FIFO of events flowing from a decoder backend to its session.
//!
//! The queue is split into a reading half owned by the session and a cheaply
//! cloneable [`EventWriter`] handed to the backend, which may push events from
//! another thread. An `eventfd` signals readability, so the reading half can
//! wait for events with a bounded timeout; this is the session's only
//! suspension point.

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::sys::eventfd::EventFd;

struct Shared<T> {
    /// Signaled while `pending` is not empty.
    event: EventFd,
    /// FIFO of all pending events.
    pending: Mutex<VecDeque<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reading half of the queue; holds the poll FD.
pub struct EventQueue<T> {
    shared: Arc<Shared<T>>,
}

/// Writing half of the queue, held by the decoder backend.
pub struct EventWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for EventWriter<T> {
    fn clone(&self) -> Self {
        EventWriter {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> EventQueue<T> {
    /// Create a new event queue.
    pub fn new() -> nix::Result<Self> {
        EventFd::new().map(|event| EventQueue {
            shared: Arc::new(Shared {
                event,
                pending: Default::default(),
            }),
        })
    }

    /// Return a writer handle for the producing side.
    pub fn writer(&self) -> EventWriter<T> {
        EventWriter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Read and return the next event, if any.
    pub fn dequeue_event(&self) -> Option<T> {
        let mut pending = self.shared.lock();
        let event = pending.pop_front();

        if event.is_some() && pending.is_empty() {
            let _ = self
                .shared
                .event
                .read()
                .map_err(|e| log::error!("error while reading event queue fd: {:#}", e));
        }

        event
    }

    /// Wait until at least one event is pending.
    ///
    /// `timeout` of `None` waits forever; `Some(Duration::ZERO)` is a
    /// non-blocking poll. Returns `true` if an event is ready, `false` if the
    /// timeout elapsed first. An interrupted wait reports `false` so the
    /// caller can re-check its own deadline.
    pub fn wait(&self, timeout: Option<Duration>) -> nix::Result<bool> {
        if !self.shared.lock().is_empty() {
            return Ok(true);
        }

        let timeout = match timeout {
            None => PollTimeout::NONE,
            Some(d) => {
                // Round sub-millisecond remainders up so a short timeout
                // cannot degenerate into a busy loop.
                let millis = d.as_micros().div_ceil(1000).min(i32::MAX as u128) as i32;
                PollTimeout::try_from(millis).unwrap_or(PollTimeout::MAX)
            }
        };

        let mut fds = [PollFd::new(self.shared.event.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(n) => Ok(n > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Number of events currently pending, i.e. the number of times
    /// `dequeue_event` can return `Some`.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }
}

impl<T> EventWriter<T> {
    /// Add `event` to the queue.
    ///
    /// Returns an error if the poll FD could not be signaled.
    pub fn queue_event(&self, event: T) -> nix::Result<()> {
        let mut pending = self.shared.lock();
        pending.push_back(event);
        if pending.len() == 1 {
            let _ = self.shared.event.write(1)?;
        }

        Ok(())
    }
}

impl<T> AsFd for EventQueue<T> {
    fn as_fd(&self) -> BorrowedFd {
        self.shared.event.as_fd()
    }
}
