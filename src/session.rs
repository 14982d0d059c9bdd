// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client-side decoder session: lifecycle state machine and buffer-queue
//! protocol.
//!
//! A [`CodecSession`] owns an input and an output buffer pool. Each slot is
//! held by exactly one side at a time; transfers happen only through the
//! queue/dequeue/release operations, and the slot's backing storage moves
//! with the ownership, traveling to the decoder on queue and coming back
//! inside [`DecoderEvent`]s. The two dequeue operations are the session's
//! only suspension points and are bounded by a caller-supplied timeout in
//! microseconds (`0` polls, negative waits forever).
//!
//! Lifecycle operations take `&mut self`: callers sharing a session between
//! threads serialize access themselves, as required by the protocol.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

use crate::event_queue::EventQueue;
use crate::format::FormatDescriptor;
use crate::protocol::BufferFlags;
use crate::protocol::BufferInfo;
use crate::protocol::InputDequeue;
use crate::protocol::OutputDequeue;
use crate::protocol::QueueLayout;
use crate::BackendError;
use crate::DecoderBackend;
use crate::DecoderEvent;
use crate::DecoderSession;

/// Lifecycle state of a [`CodecSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Fresh session, no format applied yet.
    Unconfigured,
    /// A format has been applied; buffer pools do not exist yet.
    Configured,
    /// Pools are allocated and buffers flow. `flush` does not leave this
    /// state.
    Started,
    /// Decoding stopped; the session can be re-configured.
    Stopped,
    /// Terminal state; every further operation is a programmer error.
    Released,
}

/// Errors reported by [`CodecSession`] operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The operation is not allowed by the current lifecycle state. Fatal to
    /// the session: release and recreate.
    #[error("{op} is not valid in the {state:?} state")]
    InvalidState {
        op: &'static str,
        state: SessionState,
    },
    /// The session was released and must no longer be used.
    #[error("session has been released")]
    UseAfterRelease,
    /// End-of-stream was queued on the input side; the decoder is draining
    /// and no further input slot will become available until a flush.
    #[error("input end-of-stream was already queued")]
    InputDrained,
    /// The decoder could not allocate its buffer pools.
    #[error("failed to start decoder session: {0}")]
    Start(#[source] BackendError),
    /// A buffer reference was invalid. The targeted slot is left unchanged;
    /// the operation can be retried with corrected arguments.
    #[error("buffer {index}: {reason}")]
    InvalidBuffer { index: u32, reason: &'static str },
    /// The decoder failed. Fatal; no retry is performed at this layer.
    #[error("decoder failure: {0}")]
    Decoder(BackendError),
    /// The session event queue failed.
    #[error("event queue error: {0}")]
    Event(nix::errno::Errno),
}

/// Who currently holds a buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// With the session, available for the client to dequeue.
    Idle,
    /// Dequeued by the client, which may access its bytes.
    Client,
    /// Transferred to the decoder for processing.
    Decoder,
}

/// One slot of a buffer pool.
struct Slot {
    /// Byte capacity, fixed for the lifetime of the pool.
    capacity: usize,
    state: SlotState,
    /// Backing storage. `None` exactly while the decoder holds the slot.
    storage: Option<Vec<u8>>,
    /// Content description of the most recent frame, for client-held output
    /// slots.
    info: BufferInfo,
}

impl Slot {
    fn with_storage(capacity: usize) -> Self {
        Slot {
            capacity,
            state: SlotState::Idle,
            storage: Some(vec![0; capacity]),
            info: Default::default(),
        }
    }

    fn held_by_decoder(capacity: usize) -> Self {
        Slot {
            capacity,
            state: SlotState::Decoder,
            storage: None,
            info: Default::default(),
        }
    }
}

/// Output-side notifications waiting to be returned by
/// `dequeue_output_buffer`, in the order the decoder emitted them.
enum PendingOutput {
    Frame { info: BufferInfo, storage: Vec<u8> },
    FormatChanged(Arc<FormatDescriptor>),
    BuffersChanged(QueueLayout),
}

/// Deadline for a dequeue operation, from a timeout in microseconds.
enum Wait {
    /// Timeout 0: single non-blocking check.
    Now,
    /// Positive timeout.
    Until(Instant),
    /// Negative timeout: wait forever.
    Forever,
}

impl Wait {
    fn from_timeout_us(timeout_us: i64) -> Self {
        match timeout_us {
            t if t < 0 => Wait::Forever,
            0 => Wait::Now,
            t => Wait::Until(Instant::now() + Duration::from_micros(t as u64)),
        }
    }

    /// Time left to wait: `None` when the deadline has passed, unbounded for
    /// `Forever`.
    fn remaining(&self) -> Option<Option<Duration>> {
        match self {
            Wait::Now => None,
            Wait::Forever => Some(None),
            Wait::Until(deadline) => {
                let now = Instant::now();
                if now >= *deadline {
                    None
                } else {
                    Some(Some(*deadline - now))
                }
            }
        }
    }
}

/// A decoding session: one decoder instance and its two buffer pools.
pub struct CodecSession<S: DecoderSession> {
    state: SessionState,
    /// `None` once the session has been released.
    backend: Option<S>,
    events: EventQueue<DecoderEvent>,
    input_slots: Vec<Slot>,
    output_slots: Vec<Slot>,
    pending_outputs: VecDeque<PendingOutput>,
    /// Current output format; starts as the configured format and is
    /// replaced when the decoder reports a change.
    output_format: Option<Arc<FormatDescriptor>>,
    /// Sticky fatal error reported by the decoder.
    fatal: Option<BackendError>,
    input_eos_sent: bool,
    output_eos_seen: bool,
}

impl<S: DecoderSession> CodecSession<S> {
    /// Create a session for the codec named exactly `name`, or `None` if the
    /// registry knows no such codec.
    pub fn by_codec_name<B>(registry: &mut B, name: &str) -> Result<Option<Self>, CodecError>
    where
        B: DecoderBackend<Session = S>,
    {
        let events = EventQueue::new().map_err(CodecError::Event)?;
        let Some(backend) = registry.create_by_name(name, events.writer()) else {
            return Ok(None);
        };
        Ok(Some(Self::with_backend(backend, events)))
    }

    /// Create a session for the first codec of the registry accepting
    /// `mime`, or `None` if none matches.
    pub fn by_codec_type<B>(registry: &mut B, mime: &str) -> Result<Option<Self>, CodecError>
    where
        B: DecoderBackend<Session = S>,
    {
        let events = EventQueue::new().map_err(CodecError::Event)?;
        let Some(backend) = registry.create_by_type(mime, events.writer()) else {
            return Ok(None);
        };
        Ok(Some(Self::with_backend(backend, events)))
    }

    fn with_backend(backend: S, events: EventQueue<DecoderEvent>) -> Self {
        CodecSession {
            state: SessionState::Unconfigured,
            backend: Some(backend),
            events,
            input_slots: Default::default(),
            output_slots: Default::default(),
            pending_outputs: Default::default(),
            output_format: None,
            fatal: None,
            input_eos_sent: false,
            output_eos_seen: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn check_state(&self, op: &'static str, valid: &[SessionState]) -> Result<(), CodecError> {
        if self.state == SessionState::Released {
            return Err(CodecError::UseAfterRelease);
        }
        if valid.contains(&self.state) {
            Ok(())
        } else {
            Err(CodecError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn check_fatal(&self) -> Result<(), CodecError> {
        match &self.fatal {
            Some(e) => Err(CodecError::Decoder(e.clone())),
            None => Ok(()),
        }
    }

    fn backend_mut(&mut self) -> Result<&mut S, CodecError> {
        self.backend.as_mut().ok_or(CodecError::UseAfterRelease)
    }

    /// Drain the event queue, updating slot states and collecting
    /// output-side notifications in arrival order.
    fn process_pending_events(&mut self) {
        while let Some(event) = self.events.dequeue_event() {
            match event {
                DecoderEvent::InputBufferDone { index, storage } => {
                    let Some(slot) = self.input_slots.get_mut(index as usize) else {
                        log::error!("no input slot {} to return to the pool", index);
                        continue;
                    };
                    if slot.state != SlotState::Decoder {
                        log::error!("input slot {} returned while not decoder-owned", index);
                        continue;
                    }
                    slot.storage = Some(storage);
                    slot.state = SlotState::Idle;
                }
                DecoderEvent::FrameDecoded { info, storage } => {
                    self.pending_outputs
                        .push_back(PendingOutput::Frame { info, storage });
                }
                DecoderEvent::FormatChanged(format) => {
                    self.pending_outputs
                        .push_back(PendingOutput::FormatChanged(format));
                }
                DecoderEvent::BuffersChanged(layout) => {
                    self.pending_outputs
                        .push_back(PendingOutput::BuffersChanged(layout));
                }
                DecoderEvent::Fatal(e) => {
                    log::error!("decoder signaled fatal error: {}", e);
                    self.fatal = Some(e);
                }
            }
        }
    }

    /// Apply `format` to the session. Valid in `Unconfigured` or `Stopped`.
    /// `flags` is forwarded to the backend unchanged.
    pub fn configure(
        &mut self,
        format: Arc<FormatDescriptor>,
        flags: u32,
    ) -> Result<(), CodecError> {
        self.check_state(
            "configure",
            &[SessionState::Unconfigured, SessionState::Stopped],
        )?;
        self.backend_mut()?
            .configure(&format, flags)
            .map_err(CodecError::Decoder)?;

        log::debug!("session configured for {}", format.mime());
        self.output_format = Some(Arc::clone(&format));
        self.state = SessionState::Configured;
        Ok(())
    }

    /// Submit codec-specific data ahead of the first input buffer. Valid
    /// only in `Configured`.
    pub fn queue_codec_config(&mut self, format: &FormatDescriptor) -> Result<(), CodecError> {
        self.check_state("queue_codec_config", &[SessionState::Configured])?;
        self.backend_mut()?
            .submit_codec_config(format)
            .map_err(CodecError::Decoder)
    }

    /// Allocate both buffer pools, sized by the decoder, and start the
    /// session. Valid only in `Configured`.
    pub fn start(&mut self) -> Result<(), CodecError> {
        self.check_state("start", &[SessionState::Configured])?;
        let backend = self.backend.as_mut().ok_or(CodecError::UseAfterRelease)?;
        let layout = backend.start().map_err(CodecError::Start)?;

        log::debug!(
            "starting with {} input buffers of {} bytes, {} output buffers of {} bytes",
            layout.input.buffers,
            layout.input.capacity,
            layout.output.buffers,
            layout.output.capacity
        );

        // Input slots start with the session; output slots start with the
        // decoder, which receives their storage right away.
        self.input_slots = (0..layout.input.buffers)
            .map(|_| Slot::with_storage(layout.input.capacity))
            .collect();
        self.output_slots = (0..layout.output.buffers)
            .map(|_| Slot::held_by_decoder(layout.output.capacity))
            .collect();
        for index in 0..layout.output.buffers {
            backend
                .recycle_output(index, vec![0; layout.output.capacity])
                .map_err(CodecError::Start)?;
        }

        self.pending_outputs.clear();
        self.fatal = None;
        self.input_eos_sent = false;
        self.output_eos_seen = false;
        self.state = SessionState::Started;
        Ok(())
    }

    /// Discard all queued-but-unprocessed buffers. Input slots become
    /// available for dequeue again, output slots go back to the decoder.
    /// Pending format or pool change notifications survive the flush. Valid
    /// only in `Started`; the state does not change.
    pub fn flush(&mut self) -> Result<(), CodecError> {
        self.check_state("flush", &[SessionState::Started])?;
        self.backend_mut()?.flush().map_err(CodecError::Decoder)?;

        // The backend has returned every input storage it held by now.
        self.process_pending_events();
        for (index, slot) in self.input_slots.iter_mut().enumerate() {
            if slot.storage.is_none() {
                log::error!("input slot {} was not returned by the decoder on flush", index);
                slot.storage = Some(vec![0; slot.capacity]);
            }
            slot.state = SlotState::Idle;
        }

        let drained: Vec<PendingOutput> = self.pending_outputs.drain(..).collect();
        let backend = self.backend.as_mut().ok_or(CodecError::UseAfterRelease)?;
        for pending in drained {
            match pending {
                PendingOutput::Frame { info, storage } => {
                    backend
                        .recycle_output(info.index, storage)
                        .map_err(CodecError::Decoder)?;
                }
                other => self.pending_outputs.push_back(other),
            }
        }
        for (index, slot) in self.output_slots.iter_mut().enumerate() {
            if let Some(storage) = slot.storage.take() {
                backend
                    .recycle_output(index as u32, storage)
                    .map_err(CodecError::Decoder)?;
            }
            slot.state = SlotState::Decoder;
        }

        self.input_eos_sent = false;
        self.output_eos_seen = false;
        Ok(())
    }

    /// Stop decoding, reclaiming every buffer held by the decoder. Valid
    /// only in `Started`; the session can be re-configured afterwards.
    pub fn stop(&mut self) -> Result<(), CodecError> {
        self.check_state("stop", &[SessionState::Started])?;
        self.backend_mut()?.stop().map_err(CodecError::Decoder)?;

        while self.events.dequeue_event().is_some() {}
        self.pending_outputs.clear();
        self.input_slots.clear();
        self.output_slots.clear();
        self.state = SessionState::Stopped;
        log::debug!("session stopped");
        Ok(())
    }

    /// Tear the session down, best-effort from any state. Idempotent: a
    /// second call is a no-op. Every other operation after this one fails
    /// with [`CodecError::UseAfterRelease`].
    pub fn release(&mut self) -> Result<(), CodecError> {
        if self.state == SessionState::Released {
            return Ok(());
        }
        if self.state == SessionState::Started {
            if let Some(backend) = self.backend.as_mut() {
                let _ = backend
                    .stop()
                    .map_err(|e| log::warn!("while stopping during release: {}", e));
            }
        }

        self.backend = None;
        self.input_slots.clear();
        self.output_slots.clear();
        self.pending_outputs.clear();
        while self.events.dequeue_event().is_some() {}
        self.output_format = None;
        self.state = SessionState::Released;
        log::debug!("session released");
        Ok(())
    }

    /// Wait up to `timeout_us` microseconds for a free input slot (`0`
    /// polls, negative waits forever). [`InputDequeue::TryAgainLater`] is
    /// normal backpressure, not an error.
    pub fn dequeue_input_buffer(&mut self, timeout_us: i64) -> Result<InputDequeue, CodecError> {
        self.check_state("dequeue_input_buffer", &[SessionState::Started])?;
        if self.input_eos_sent {
            return Err(CodecError::InputDrained);
        }

        let deadline = Wait::from_timeout_us(timeout_us);
        loop {
            self.process_pending_events();
            self.check_fatal()?;

            if let Some(index) = self
                .input_slots
                .iter()
                .position(|slot| slot.state == SlotState::Idle)
            {
                self.input_slots[index].state = SlotState::Client;
                return Ok(InputDequeue::Buffer(index as u32));
            }

            match deadline.remaining() {
                None => return Ok(InputDequeue::TryAgainLater),
                Some(timeout) => {
                    self.events.wait(timeout).map_err(CodecError::Event)?;
                }
            }
        }
    }

    /// Writable view of a client-owned input slot.
    pub fn input_buffer(&mut self, index: u32) -> Result<&mut [u8], CodecError> {
        self.check_state("input_buffer", &[SessionState::Started])?;
        let slot = self
            .input_slots
            .get_mut(index as usize)
            .ok_or(CodecError::InvalidBuffer {
                index,
                reason: "no such input slot",
            })?;
        if slot.state != SlotState::Client {
            return Err(CodecError::InvalidBuffer {
                index,
                reason: "slot is not client-owned",
            });
        }
        slot.storage
            .as_deref_mut()
            .ok_or(CodecError::InvalidBuffer {
                index,
                reason: "slot has no storage",
            })
    }

    /// Byte capacity of a client-owned input slot.
    pub fn input_buffer_capacity(&self, index: u32) -> Result<usize, CodecError> {
        self.check_state("input_buffer_capacity", &[SessionState::Started])?;
        match self.input_slots.get(index as usize) {
            Some(slot) if slot.state == SlotState::Client => Ok(slot.capacity),
            Some(_) => Err(CodecError::InvalidBuffer {
                index,
                reason: "slot is not client-owned",
            }),
            None => Err(CodecError::InvalidBuffer {
                index,
                reason: "no such input slot",
            }),
        }
    }

    /// Transfer the slot described by `info` to the decoder, with its
    /// populated size, offset, timestamp and flags. Queuing
    /// [`BufferFlags::END_OF_STREAM`] puts the input side into draining:
    /// no further input operation is accepted until a flush.
    pub fn queue_input_buffer(&mut self, info: BufferInfo) -> Result<(), CodecError> {
        self.check_state("queue_input_buffer", &[SessionState::Started])?;
        self.check_fatal()?;
        if self.input_eos_sent {
            return Err(CodecError::InputDrained);
        }

        let slot = self
            .input_slots
            .get_mut(info.index as usize)
            .ok_or(CodecError::InvalidBuffer {
                index: info.index,
                reason: "no such input slot",
            })?;
        if slot.state != SlotState::Client {
            return Err(CodecError::InvalidBuffer {
                index: info.index,
                reason: "slot is not client-owned",
            });
        }
        // The slot stays client-owned when the range check fails so the
        // caller can correct and retry.
        if info.offset as u64 + info.size as u64 > slot.capacity as u64 {
            return Err(CodecError::InvalidBuffer {
                index: info.index,
                reason: "data range exceeds slot capacity",
            });
        }
        let Some(storage) = slot.storage.take() else {
            return Err(CodecError::InvalidBuffer {
                index: info.index,
                reason: "slot has no storage",
            });
        };
        slot.state = SlotState::Decoder;

        let backend = self.backend.as_mut().ok_or(CodecError::UseAfterRelease)?;
        if let Err(e) = backend.decode(info, storage) {
            self.fatal = Some(e.clone());
            return Err(CodecError::Decoder(e));
        }

        if info.flags.contains(BufferFlags::END_OF_STREAM) {
            log::debug!("input end-of-stream queued, decoder draining");
            self.input_eos_sent = true;
        }
        Ok(())
    }

    /// Wait up to `timeout_us` microseconds for the next output-side event:
    /// a decoded frame, a format change, or a pool change. After a frame
    /// flagged with [`BufferFlags::END_OF_STREAM`] no further frame is
    /// reported.
    pub fn dequeue_output_buffer(&mut self, timeout_us: i64) -> Result<OutputDequeue, CodecError> {
        self.check_state("dequeue_output_buffer", &[SessionState::Started])?;

        let deadline = Wait::from_timeout_us(timeout_us);
        loop {
            self.process_pending_events();
            self.check_fatal()?;
            if self.output_eos_seen {
                return Ok(OutputDequeue::TryAgainLater);
            }

            while let Some(pending) = self.pending_outputs.pop_front() {
                match pending {
                    PendingOutput::Frame { info, storage } => {
                        let end = info.offset as u64 + info.size as u64;
                        let Some(slot) = self.output_slots.get_mut(info.index as usize) else {
                            log::error!("no output slot {} to receive decoded frame", info.index);
                            continue;
                        };
                        if slot.state != SlotState::Decoder || end > storage.len() as u64 {
                            log::error!("dropping malformed frame for output slot {}", info.index);
                            let backend =
                                self.backend.as_mut().ok_or(CodecError::UseAfterRelease)?;
                            backend
                                .recycle_output(info.index, storage)
                                .map_err(CodecError::Decoder)?;
                            continue;
                        }
                        slot.state = SlotState::Client;
                        slot.storage = Some(storage);
                        slot.info = info;
                        if info.flags.contains(BufferFlags::END_OF_STREAM) {
                            log::debug!("output end-of-stream reached");
                            self.output_eos_seen = true;
                        }
                        return Ok(OutputDequeue::Buffer(info));
                    }
                    PendingOutput::FormatChanged(format) => {
                        self.output_format = Some(format);
                        return Ok(OutputDequeue::FormatChanged);
                    }
                    PendingOutput::BuffersChanged(layout) => {
                        self.output_slots = (0..layout.buffers)
                            .map(|_| Slot::held_by_decoder(layout.capacity))
                            .collect();
                        let backend = self.backend.as_mut().ok_or(CodecError::UseAfterRelease)?;
                        for index in 0..layout.buffers {
                            backend
                                .recycle_output(index, vec![0; layout.capacity])
                                .map_err(CodecError::Decoder)?;
                        }
                        return Ok(OutputDequeue::BuffersChanged);
                    }
                }
            }

            match deadline.remaining() {
                None => return Ok(OutputDequeue::TryAgainLater),
                Some(timeout) => {
                    self.events.wait(timeout).map_err(CodecError::Event)?;
                }
            }
        }
    }

    /// Return a client-held output slot to the decoder. With `render` the
    /// decoded bytes are first presented to the backend's render target.
    pub fn release_output_buffer(&mut self, index: u32, render: bool) -> Result<(), CodecError> {
        self.check_state("release_output_buffer", &[SessionState::Started])?;
        self.check_fatal()?;

        let slot = self
            .output_slots
            .get_mut(index as usize)
            .ok_or(CodecError::InvalidBuffer {
                index,
                reason: "no such output slot",
            })?;
        if slot.state != SlotState::Client {
            return Err(CodecError::InvalidBuffer {
                index,
                reason: "slot is not client-owned",
            });
        }
        let Some(storage) = slot.storage.take() else {
            return Err(CodecError::InvalidBuffer {
                index,
                reason: "slot has no storage",
            });
        };
        let info = slot.info;
        slot.state = SlotState::Decoder;

        let backend = self.backend.as_mut().ok_or(CodecError::UseAfterRelease)?;
        if render {
            let range = info.offset as usize..info.offset as usize + info.size as usize;
            backend.render_output(index, storage.get(range).unwrap_or(&storage));
        }
        backend
            .recycle_output(index, storage)
            .map_err(CodecError::Decoder)
    }

    /// Readable view of a client-owned output slot.
    pub fn output_buffer(&self, index: u32) -> Result<&[u8], CodecError> {
        self.check_state("output_buffer", &[SessionState::Started])?;
        match self.output_slots.get(index as usize) {
            Some(slot) if slot.state == SlotState::Client => {
                slot.storage.as_deref().ok_or(CodecError::InvalidBuffer {
                    index,
                    reason: "slot has no storage",
                })
            }
            Some(_) => Err(CodecError::InvalidBuffer {
                index,
                reason: "slot is not client-owned",
            }),
            None => Err(CodecError::InvalidBuffer {
                index,
                reason: "no such output slot",
            }),
        }
    }

    /// Byte capacity of a client-owned output slot.
    pub fn output_buffer_capacity(&self, index: u32) -> Result<usize, CodecError> {
        self.check_state("output_buffer_capacity", &[SessionState::Started])?;
        match self.output_slots.get(index as usize) {
            Some(slot) if slot.state == SlotState::Client => Ok(slot.capacity),
            Some(_) => Err(CodecError::InvalidBuffer {
                index,
                reason: "slot is not client-owned",
            }),
            None => Err(CodecError::InvalidBuffer {
                index,
                reason: "no such output slot",
            }),
        }
    }

    /// Number of slots in the input pool.
    pub fn input_buffer_count(&self) -> usize {
        self.input_slots.len()
    }

    /// Number of slots in the output pool. Re-read this after
    /// [`OutputDequeue::BuffersChanged`].
    pub fn output_buffer_count(&self) -> usize {
        self.output_slots.len()
    }

    /// The current output format. Re-read this after
    /// [`OutputDequeue::FormatChanged`]; dimensions and stride may differ
    /// from the configured format.
    pub fn output_format(&self) -> Option<Arc<FormatDescriptor>> {
        self.output_format.clone()
    }
}

#[cfg(all(test, feature = "stub-decoder"))]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::backends::stub::StubDecoder;
    use crate::event_queue::EventWriter;
    use crate::format::KEY_STRIDE;
    use crate::protocol::PoolLayout;

    fn avc_format() -> Arc<FormatDescriptor> {
        Arc::new(FormatDescriptor::video("video/avc", 1920, 1080, 0, 0))
    }

    fn started_session() -> CodecSession<crate::backends::stub::StubSession> {
        let mut registry = StubDecoder::new();
        let mut session = CodecSession::by_codec_type(&mut registry, "video/avc")
            .unwrap()
            .unwrap();
        session.configure(avc_format(), 0).unwrap();
        session.start().unwrap();
        session
    }

    fn queue_frame(
        session: &mut CodecSession<crate::backends::stub::StubSession>,
        payload: &[u8],
        pts: i64,
        flags: BufferFlags,
    ) -> u32 {
        let index = match session.dequeue_input_buffer(500_000).unwrap() {
            InputDequeue::Buffer(index) => index,
            InputDequeue::TryAgainLater => panic!("no input slot available"),
        };
        session.input_buffer(index).unwrap()[..payload.len()].copy_from_slice(payload);
        session
            .queue_input_buffer(BufferInfo {
                presentation_time_us: pts,
                index,
                offset: 0,
                size: payload.len() as u32,
                flags,
            })
            .unwrap();
        index
    }

    /// Operations invalid in the current state fail with `InvalidState` and
    /// leave the state unchanged.
    #[test]
    fn invalid_transitions_are_rejected() {
        let mut registry = StubDecoder::new();
        let mut session = CodecSession::by_codec_type(&mut registry, "video/avc")
            .unwrap()
            .unwrap();

        assert!(matches!(
            session.start(),
            Err(CodecError::InvalidState { op: "start", .. })
        ));
        assert!(matches!(
            session.dequeue_input_buffer(0),
            Err(CodecError::InvalidState { .. })
        ));
        assert!(matches!(session.flush(), Err(CodecError::InvalidState { .. })));
        assert!(matches!(session.stop(), Err(CodecError::InvalidState { .. })));
        assert_eq!(session.state(), SessionState::Unconfigured);

        // The failed calls did not corrupt anything: the normal path works.
        session.configure(avc_format(), 0).unwrap();
        assert!(matches!(
            session.configure(avc_format(), 0),
            Err(CodecError::InvalidState { .. })
        ));
        assert_eq!(session.state(), SessionState::Configured);
        session.start().unwrap();
        assert!(matches!(
            session.queue_codec_config(&avc_format()),
            Err(CodecError::InvalidState { .. })
        ));
        assert_eq!(session.state(), SessionState::Started);
    }

    #[test]
    fn unknown_codec_yields_no_session() {
        let mut registry = StubDecoder::new();
        assert!(
            CodecSession::by_codec_name(&mut registry, "no-such-codec")
                .unwrap()
                .is_none()
        );
        assert!(
            CodecSession::by_codec_type(&mut registry, "video/nonexistent")
                .unwrap()
                .is_none()
        );
    }

    /// A dequeued slot is not handed out again until queued back, and an
    /// exhausted pool reports `TryAgainLater` without blocking.
    #[test]
    fn input_slots_are_exclusive_and_poll_is_bounded() {
        let mut session = started_session();
        let count = session.input_buffer_count();
        assert!(count > 0);

        let mut seen = Vec::new();
        for _ in 0..count {
            match session.dequeue_input_buffer(0).unwrap() {
                InputDequeue::Buffer(index) => {
                    assert!(!seen.contains(&index));
                    seen.push(index);
                }
                InputDequeue::TryAgainLater => panic!("pool exhausted too early"),
            }
        }

        let begin = Instant::now();
        assert_eq!(
            session.dequeue_input_buffer(0).unwrap(),
            InputDequeue::TryAgainLater
        );
        assert!(begin.elapsed() < Duration::from_millis(100));
    }

    /// Queuing a buffer whose range exceeds the slot capacity fails and the
    /// slot remains client-owned.
    #[test]
    fn oversized_queue_is_rejected() {
        let mut session = started_session();
        let index = match session.dequeue_input_buffer(0).unwrap() {
            InputDequeue::Buffer(index) => index,
            InputDequeue::TryAgainLater => panic!("no input slot"),
        };
        let capacity = session.input_buffer_capacity(index).unwrap();

        let mut info = BufferInfo {
            presentation_time_us: 0,
            index,
            offset: 0,
            size: capacity as u32 + 1,
            flags: BufferFlags::empty(),
        };
        assert!(matches!(
            session.queue_input_buffer(info),
            Err(CodecError::InvalidBuffer { .. })
        ));

        // Still client-owned: accessors work and a corrected queue succeeds.
        session.input_buffer(index).unwrap()[0] = 0xab;
        info.size = 1;
        session.queue_input_buffer(info).unwrap();
    }

    /// One EOS input produces exactly one EOS output, and nothing after it.
    #[test]
    fn eos_round_trip() {
        let mut session = started_session();
        queue_frame(&mut session, &[1, 2, 3, 4], 1000, BufferFlags::empty());
        queue_frame(&mut session, &[5, 6, 7, 8], 2000, BufferFlags::empty());
        queue_frame(&mut session, &[], 3000, BufferFlags::END_OF_STREAM);

        // The stub announces its output format before the first frame.
        assert_eq!(
            session.dequeue_output_buffer(500_000).unwrap(),
            OutputDequeue::FormatChanged
        );

        let mut eos_frames = 0;
        let mut timestamps = Vec::new();
        loop {
            match session.dequeue_output_buffer(500_000).unwrap() {
                OutputDequeue::Buffer(info) => {
                    timestamps.push(info.presentation_time_us);
                    let eos = info.flags.contains(BufferFlags::END_OF_STREAM);
                    session.release_output_buffer(info.index, false).unwrap();
                    // A released slot is no longer client-owned.
                    assert!(matches!(
                        session.release_output_buffer(info.index, false),
                        Err(CodecError::InvalidBuffer { .. })
                    ));
                    if eos {
                        eos_frames += 1;
                        break;
                    }
                }
                OutputDequeue::TryAgainLater => panic!("stub produced no output"),
                other => panic!("unexpected dequeue outcome {:?}", other),
            }
        }
        assert_eq!(eos_frames, 1);
        assert_eq!(timestamps, vec![1000, 2000, 3000]);

        // Nothing is produced after the EOS frame.
        assert_eq!(
            session.dequeue_output_buffer(0).unwrap(),
            OutputDequeue::TryAgainLater
        );
    }

    /// Decoded bytes land in the output slot the frame describes.
    #[test]
    fn output_bytes_match_input() {
        let mut session = started_session();
        let payload = [0xde, 0xad, 0xbe, 0xef];
        queue_frame(&mut session, &payload, 0, BufferFlags::empty());

        assert_eq!(
            session.dequeue_output_buffer(500_000).unwrap(),
            OutputDequeue::FormatChanged
        );
        let info = match session.dequeue_output_buffer(500_000).unwrap() {
            OutputDequeue::Buffer(info) => info,
            other => panic!("unexpected dequeue outcome {:?}", other),
        };
        assert_eq!(info.size, payload.len() as u32);
        let view = session.output_buffer(info.index).unwrap();
        assert_eq!(
            &view[info.offset as usize..(info.offset + info.size) as usize],
            &payload
        );
        session.release_output_buffer(info.index, true).unwrap();
    }

    /// configure → start → queue one 4096-byte input → dequeue output with a
    /// 500ms budget must not produce a protocol error.
    #[test]
    fn reference_scenario_never_protocol_errors() {
        let mut session = started_session();
        queue_frame(&mut session, &[0u8; 4096], 0, BufferFlags::empty());

        loop {
            match session.dequeue_output_buffer(500_000) {
                Ok(OutputDequeue::Buffer(_)) | Ok(OutputDequeue::TryAgainLater) => break,
                Ok(OutputDequeue::FormatChanged) | Ok(OutputDequeue::BuffersChanged) => continue,
                Err(e) => panic!("dequeue_output_buffer failed: {}", e),
            }
        }
    }

    /// After EOS the input side is draining; flush re-arms it.
    #[test]
    fn input_after_eos_is_rejected_until_flush() {
        let mut session = started_session();
        queue_frame(&mut session, &[], 0, BufferFlags::END_OF_STREAM);
        assert!(matches!(
            session.dequeue_input_buffer(0),
            Err(CodecError::InputDrained)
        ));

        session.flush().unwrap();
        assert!(matches!(
            session.dequeue_input_buffer(0).unwrap(),
            InputDequeue::Buffer(_)
        ));
    }

    /// Flush makes the whole input pool dequeuable again.
    #[test]
    fn flush_returns_input_slots() {
        let mut session = started_session();
        let count = session.input_buffer_count();
        queue_frame(&mut session, &[1], 0, BufferFlags::empty());
        let _ = session.dequeue_input_buffer(0).unwrap();

        session.flush().unwrap();
        assert_eq!(session.state(), SessionState::Started);
        for _ in 0..count {
            assert!(matches!(
                session.dequeue_input_buffer(0).unwrap(),
                InputDequeue::Buffer(_)
            ));
        }
    }

    /// `release` is idempotent; everything else afterwards is
    /// `UseAfterRelease`.
    #[test]
    fn release_is_idempotent() {
        let mut session = started_session();
        session.release().unwrap();
        session.release().unwrap();

        assert!(matches!(
            session.configure(avc_format(), 0),
            Err(CodecError::UseAfterRelease)
        ));
        assert!(matches!(
            session.dequeue_output_buffer(0),
            Err(CodecError::UseAfterRelease)
        ));
        assert!(matches!(session.stop(), Err(CodecError::UseAfterRelease)));
    }

    #[test]
    fn stop_allows_reconfigure() {
        let mut session = started_session();
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        session.configure(avc_format(), 0).unwrap();
        session.start().unwrap();
        assert!(session.input_buffer_count() > 0);
    }

    // A backend whose event writer is exposed to the test, so arbitrary
    // event sequences can be injected.
    struct ScriptedRegistry {
        writer: Arc<Mutex<Option<EventWriter<DecoderEvent>>>>,
        layout: PoolLayout,
    }

    struct ScriptedSession {
        events: EventWriter<DecoderEvent>,
        layout: PoolLayout,
    }

    impl DecoderBackend for ScriptedRegistry {
        type Session = ScriptedSession;

        fn create_by_name(
            &mut self,
            _name: &str,
            events: EventWriter<DecoderEvent>,
        ) -> Option<ScriptedSession> {
            *self.writer.lock().unwrap() = Some(events.clone());
            Some(ScriptedSession {
                events,
                layout: self.layout,
            })
        }

        fn create_by_type(
            &mut self,
            name: &str,
            events: EventWriter<DecoderEvent>,
        ) -> Option<ScriptedSession> {
            self.create_by_name(name, events)
        }
    }

    impl DecoderSession for ScriptedSession {
        fn configure(&mut self, _format: &FormatDescriptor, _flags: u32) -> Result<(), BackendError> {
            Ok(())
        }

        fn submit_codec_config(&mut self, _format: &FormatDescriptor) -> Result<(), BackendError> {
            Ok(())
        }

        fn start(&mut self) -> Result<PoolLayout, BackendError> {
            Ok(self.layout)
        }

        fn decode(&mut self, info: BufferInfo, input: Vec<u8>) -> Result<(), BackendError> {
            self.events
                .queue_event(DecoderEvent::InputBufferDone {
                    index: info.index,
                    storage: input,
                })
                .map_err(BackendError::EventQueue)
        }

        fn recycle_output(&mut self, _index: u32, _storage: Vec<u8>) -> Result<(), BackendError> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), BackendError> {
            Ok(())
        }

        fn stop(&mut self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn scripted_session() -> (
        CodecSession<ScriptedSession>,
        EventWriter<DecoderEvent>,
    ) {
        let writer = Arc::new(Mutex::new(None));
        let mut registry = ScriptedRegistry {
            writer: Arc::clone(&writer),
            layout: PoolLayout {
                input: QueueLayout {
                    buffers: 2,
                    capacity: 256,
                },
                output: QueueLayout {
                    buffers: 4,
                    capacity: 1024,
                },
            },
        };
        let mut session = CodecSession::by_codec_name(&mut registry, "scripted")
            .unwrap()
            .unwrap();
        session
            .configure(Arc::new(FormatDescriptor::new("video/avc")), 0)
            .unwrap();
        session.start().unwrap();
        let writer = writer.lock().unwrap().clone().unwrap();
        (session, writer)
    }

    /// A pool change notification re-allocates the output pool before the
    /// sentinel is returned.
    #[test]
    fn buffers_changed_reallocates_output_pool() {
        let (mut session, writer) = scripted_session();
        assert_eq!(session.output_buffer_count(), 4);

        writer
            .queue_event(DecoderEvent::BuffersChanged(QueueLayout {
                buffers: 8,
                capacity: 2048,
            }))
            .unwrap();
        assert_eq!(
            session.dequeue_output_buffer(0).unwrap(),
            OutputDequeue::BuffersChanged
        );
        assert_eq!(session.output_buffer_count(), 8);
    }

    /// A format change is surfaced before frames decoded under the new
    /// format, and the new descriptor is readable afterwards.
    #[test]
    fn format_change_precedes_following_frames() {
        let (mut session, writer) = scripted_session();

        let mut new_format = FormatDescriptor::video("video/raw", 1280, 720, 0, 0);
        new_format.set_int32(KEY_STRIDE, 1280);
        writer
            .queue_event(DecoderEvent::FormatChanged(Arc::new(new_format)))
            .unwrap();
        writer
            .queue_event(DecoderEvent::FrameDecoded {
                info: BufferInfo {
                    presentation_time_us: 0,
                    index: 0,
                    offset: 0,
                    size: 16,
                    flags: BufferFlags::empty(),
                },
                storage: vec![0; 1024],
            })
            .unwrap();

        assert_eq!(
            session.dequeue_output_buffer(0).unwrap(),
            OutputDequeue::FormatChanged
        );
        let format = session.output_format().unwrap();
        assert_eq!(format.width(), Some(1280));
        assert_eq!(format.stride(), Some(1280));
        assert!(matches!(
            session.dequeue_output_buffer(0).unwrap(),
            OutputDequeue::Buffer(_)
        ));
    }

    /// A fatal decoder error sticks to the session.
    #[test]
    fn fatal_error_is_sticky() {
        let (mut session, writer) = scripted_session();
        writer
            .queue_event(DecoderEvent::Fatal(BackendError::Fatal(-32)))
            .unwrap();

        assert!(matches!(
            session.dequeue_output_buffer(0),
            Err(CodecError::Decoder(BackendError::Fatal(-32)))
        ));
        assert!(matches!(
            session.dequeue_output_buffer(0),
            Err(CodecError::Decoder(_))
        ));
        assert!(matches!(
            session.dequeue_input_buffer(0),
            Err(CodecError::Decoder(_))
        ));
    }

    /// A bounded dequeue on a silent decoder returns `TryAgainLater` after
    /// roughly the requested delay, not an error and not immediately.
    #[test]
    fn bounded_wait_expires_to_try_again() {
        let (mut session, _writer) = scripted_session();
        let begin = Instant::now();
        assert_eq!(
            session.dequeue_output_buffer(50_000).unwrap(),
            OutputDequeue::TryAgainLater
        );
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "returned too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "blocked too long: {:?}", elapsed);
    }
}
