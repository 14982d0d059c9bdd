// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate contains the client-side machinery needed to drive a media
//! decoder through its buffer-queue lifecycle: configure, start, feed input
//! buffers, drain output buffers, stop, release.
//!
//! The decoding work itself is performed by a *backend*, which can be a
//! hardware codec, a software library, or the [`backends::stub`] decoder used
//! for testing. Backends are entirely abstracted behind a pair of traits, so
//! the session state machine never needs to know what is actually producing
//! the frames. Conversely, a backend never needs to implement lifecycle
//! checking or buffer-ownership tracking: it receives calls in a valid order
//! and reports progress through events.
//!
//! # Traits to implement by a backend
//!
//! * [`DecoderBackend`] is the registry half: it resolves a codec name or
//!   mime type into a decoding session.
//! * [`DecoderSession`] is one decoding instance. It receives configuration,
//!   input buffers and recycled output buffers, and reports all asynchronous
//!   progress by pushing [`DecoderEvent`]s into the [`event_queue::EventWriter`]
//!   it was created with.
//!
//! # Anatomy of a session
//!
//! [`session::CodecSession`] owns the two buffer pools and the pollable event
//! queue. Buffer slots are owned by exactly one side at a time; ownership
//! moves with the slot's backing storage, so a client cannot touch bytes that
//! are currently with the decoder. The session's two dequeue operations are
//! its only suspension points, and both are bounded by a caller-supplied
//! timeout.
//!
//! Backend availability is not process-global state: the backend handle is
//! passed explicitly when constructing a session, and its initialization and
//! teardown belong to the caller.

pub mod event_queue;
pub mod format;
pub mod protocol;
pub mod session;
pub mod stream;

pub mod backends;

use std::sync::Arc;

use thiserror::Error;

use crate::event_queue::EventWriter;
use crate::format::FormatDescriptor;
use crate::protocol::BufferInfo;
use crate::protocol::PoolLayout;
use crate::protocol::QueueLayout;

/// Errors reported by decoder backends.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The backend cannot decode the requested format.
    #[error("requested format is not supported")]
    UnsupportedFormat,
    /// The backend could not allocate the resources it needs.
    #[error("cannot allocate decoder resources")]
    OutOfMemory,
    /// The session event queue could not be signaled.
    #[error("could not signal session event: {0}")]
    EventQueue(nix::errno::Errno),
    /// Catch-all for decoder failures that terminate the session.
    #[error("decoder reported fatal error {0}")]
    Fatal(i32),
}

/// Events reported by a [`DecoderSession`] through its event writer.
///
/// Buffer slot storage travels inside the events: a slot's bytes are returned
/// to the session together with the notification that the decoder is done
/// with them.
#[derive(Debug)]
pub enum DecoderEvent {
    /// An input buffer has been consumed and its slot can be dequeued again.
    InputBufferDone {
        index: u32,
        storage: Vec<u8>,
    },
    /// A decoded frame is ready in the output slot described by `info`.
    ///
    /// Frames are emitted in decode order; `info.presentation_time_us` is the
    /// authoritative ordering key for presentation.
    FrameDecoded {
        info: BufferInfo,
        storage: Vec<u8>,
    },
    /// The stream's output characteristics changed. Carries the new
    /// descriptor; all frames emitted afterwards use it.
    FormatChanged(Arc<FormatDescriptor>),
    /// The output pool must be re-allocated with the given layout. Any output
    /// storage previously handed to the backend has been discarded.
    BuffersChanged(QueueLayout),
    /// The decoder failed in a way that terminates the session.
    Fatal(BackendError),
}

/// Registry half of a decoder backend: resolves codec lookups into sessions.
///
/// Selection policy (exact name match, first-matching-type, ...) belongs to
/// the implementor.
pub trait DecoderBackend {
    type Session: DecoderSession;

    /// Create a decoding session for the codec named exactly `name`, or
    /// return `None` if no such codec exists.
    ///
    /// `events` is the writer half of the session's event queue; the backend
    /// must report all asynchronous progress through it.
    fn create_by_name(&mut self, name: &str, events: EventWriter<DecoderEvent>)
        -> Option<Self::Session>;

    /// Create a decoding session for the first codec accepting `mime`, or
    /// return `None` if no codec matches.
    fn create_by_type(&mut self, mime: &str, events: EventWriter<DecoderEvent>)
        -> Option<Self::Session>;
}

/// One decoding instance provided by a [`DecoderBackend`].
///
/// Implementations can assume calls arrive in a valid lifecycle order: the
/// session state machine rejects out-of-order operations before they reach
/// the backend.
pub trait DecoderSession {
    /// Apply `format` to the upcoming decode. `flags` is passed through from
    /// the client unchanged.
    fn configure(&mut self, format: &FormatDescriptor, flags: u32) -> Result<(), BackendError>;

    /// Submit the codec-specific data carried by `format` (e.g. SPS/PPS
    /// blobs) ahead of the first input buffer.
    fn submit_codec_config(&mut self, format: &FormatDescriptor) -> Result<(), BackendError>;

    /// Allocate decoding resources and decide the size of both buffer pools.
    fn start(&mut self) -> Result<PoolLayout, BackendError>;

    /// Decode the access unit in `input`, described by `info`. The slot
    /// storage is returned through [`DecoderEvent::InputBufferDone`] once the
    /// bytes have been consumed.
    ///
    /// Input is consumed in submission order.
    fn decode(&mut self, info: BufferInfo, input: Vec<u8>) -> Result<(), BackendError>;

    /// Hand output slot `index`, backed by `storage`, to the decoder to be
    /// filled with a frame.
    fn recycle_output(&mut self, index: u32, storage: Vec<u8>) -> Result<(), BackendError>;

    /// Present the decoded bytes of output slot `index` to the backend's
    /// render target, if it has one. The default does nothing.
    fn render_output(&mut self, _index: u32, _frame: &[u8]) {}

    /// Discard all queued-but-unprocessed work. Input storage held by the
    /// decoder is returned through [`DecoderEvent::InputBufferDone`] before
    /// this returns.
    fn flush(&mut self) -> Result<(), BackendError>;

    /// Stop decoding and drop every buffer storage still held.
    fn stop(&mut self) -> Result<(), BackendError>;
}
