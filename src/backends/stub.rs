// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Loopback software decoder backend.
//!
//! "Decoding" copies each access unit into a free output slot, unchanged.
//! The backend still behaves like a real codec at the protocol level: it
//! announces its output format before the first frame, consumes
//! codec-config buffers without producing output, holds on to input when no
//! output slot is free, and propagates the end-of-stream flag. This makes
//! it suitable for exercising clients and the session state machine without
//! any codec on the host.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::event_queue::EventWriter;
use crate::format::FormatDescriptor;
use crate::format::KEY_COLOR_FORMAT;
use crate::format::KEY_CROP_BOTTOM;
use crate::format::KEY_CROP_LEFT;
use crate::format::KEY_CROP_RIGHT;
use crate::format::KEY_CROP_TOP;
use crate::format::KEY_SLICE_HEIGHT;
use crate::format::KEY_STRIDE;
use crate::protocol::BufferFlags;
use crate::protocol::BufferInfo;
use crate::protocol::PoolLayout;
use crate::protocol::QueueLayout;
use crate::BackendError;
use crate::DecoderBackend;
use crate::DecoderEvent;
use crate::DecoderSession;

/// OMX `COLOR_FormatYUV420SemiPlanar`.
const COLOR_FORMAT_YUV420_SEMI_PLANAR: i32 = 21;

/// Pool sizes advertised at start time. Small enough that output-slot
/// shortage, and thus input backpressure, is easy to trigger in tests.
const INPUT_BUFFERS: u32 = 4;
const OUTPUT_BUFFERS: u32 = 4;
/// Input slot capacity when the format does not carry `max-input-size`.
const DEFAULT_INPUT_CAPACITY: usize = 1024 * 1024;

struct StubCodec {
    name: &'static str,
    mime: &'static str,
}

const CODECS: &[StubCodec] = &[
    StubCodec {
        name: "stub.avc.decoder",
        mime: "video/avc",
    },
    StubCodec {
        name: "stub.hevc.decoder",
        mime: "video/hevc",
    },
    StubCodec {
        name: "stub.vp9.decoder",
        mime: "video/x-vnd.on2.vp9",
    },
];

/// Registry of the loopback codecs.
#[derive(Default)]
pub struct StubDecoder {}

impl StubDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    fn session_for(
        codec: &StubCodec,
        events: EventWriter<DecoderEvent>,
    ) -> StubSession {
        StubSession {
            mime: codec.mime,
            events,
            config: None,
            csd: Default::default(),
            pending_inputs: Default::default(),
            free_outputs: Default::default(),
            format_announced: false,
        }
    }
}

impl DecoderBackend for StubDecoder {
    type Session = StubSession;

    fn create_by_name(
        &mut self,
        name: &str,
        events: EventWriter<DecoderEvent>,
    ) -> Option<StubSession> {
        CODECS
            .iter()
            .find(|codec| codec.name == name)
            .map(|codec| Self::session_for(codec, events))
    }

    fn create_by_type(
        &mut self,
        mime: &str,
        events: EventWriter<DecoderEvent>,
    ) -> Option<StubSession> {
        CODECS
            .iter()
            .find(|codec| codec.mime == mime)
            .map(|codec| Self::session_for(codec, events))
    }
}

/// One loopback decoding session.
pub struct StubSession {
    mime: &'static str,
    events: EventWriter<DecoderEvent>,
    config: Option<FormatDescriptor>,
    /// Codec-specific data received so far, in submission order.
    csd: Vec<Vec<u8>>,
    /// Inputs waiting for a free output slot.
    pending_inputs: VecDeque<(BufferInfo, Vec<u8>)>,
    /// Output slots currently available for decoding into.
    free_outputs: VecDeque<(u32, Vec<u8>)>,
    format_announced: bool,
}

impl StubSession {
    fn dimensions(&self) -> (i32, i32) {
        let width = self.config.as_ref().and_then(|c| c.width()).unwrap_or(0);
        let height = self.config.as_ref().and_then(|c| c.height()).unwrap_or(0);
        (width.max(0), height.max(0))
    }

    /// The format of the frames this session produces, announced before the
    /// first one.
    fn decoded_format(&self) -> FormatDescriptor {
        let (width, height) = self.dimensions();
        let mut format = FormatDescriptor::video("video/raw", width, height, 0, 0);
        format.set_int32(KEY_STRIDE, width);
        format.set_int32(KEY_SLICE_HEIGHT, height);
        format.set_int32(KEY_COLOR_FORMAT, COLOR_FORMAT_YUV420_SEMI_PLANAR);
        format.set_int32(KEY_CROP_LEFT, 0);
        format.set_int32(KEY_CROP_TOP, 0);
        format.set_int32(KEY_CROP_RIGHT, (width - 1).max(0));
        format.set_int32(KEY_CROP_BOTTOM, (height - 1).max(0));
        format
    }

    /// Pair pending inputs with free output slots until either runs out.
    fn pump(&mut self) -> Result<(), BackendError> {
        loop {
            let Some((out_index, mut out_storage)) = self.free_outputs.pop_front() else {
                break;
            };
            let Some((info, in_storage)) = self.pending_inputs.pop_front() else {
                self.free_outputs.push_front((out_index, out_storage));
                break;
            };

            if !self.format_announced {
                self.format_announced = true;
                self.events
                    .queue_event(DecoderEvent::FormatChanged(Arc::new(self.decoded_format())))
                    .map_err(BackendError::EventQueue)?;
            }

            let src = info.offset as usize;
            let len = (info.size as usize).min(out_storage.len());
            out_storage[..len].copy_from_slice(&in_storage[src..src + len]);

            self.events
                .queue_event(DecoderEvent::InputBufferDone {
                    index: info.index,
                    storage: in_storage,
                })
                .map_err(BackendError::EventQueue)?;
            self.events
                .queue_event(DecoderEvent::FrameDecoded {
                    info: BufferInfo {
                        presentation_time_us: info.presentation_time_us,
                        index: out_index,
                        offset: 0,
                        size: len as u32,
                        flags: info.flags,
                    },
                    storage: out_storage,
                })
                .map_err(BackendError::EventQueue)?;
        }

        Ok(())
    }
}

impl DecoderSession for StubSession {
    fn configure(&mut self, format: &FormatDescriptor, _flags: u32) -> Result<(), BackendError> {
        if format.mime() != self.mime {
            return Err(BackendError::UnsupportedFormat);
        }
        self.config = Some(format.clone());
        self.csd.clear();
        self.pending_inputs.clear();
        self.free_outputs.clear();
        self.format_announced = false;
        Ok(())
    }

    fn submit_codec_config(&mut self, format: &FormatDescriptor) -> Result<(), BackendError> {
        for (key, bytes) in format.byte_buffers() {
            if key.starts_with("csd-") {
                self.csd.push(bytes.to_vec());
            }
        }
        Ok(())
    }

    fn start(&mut self) -> Result<PoolLayout, BackendError> {
        let Some(config) = &self.config else {
            return Err(BackendError::UnsupportedFormat);
        };

        let input_capacity = config
            .max_input_size()
            .filter(|size| *size > 0)
            .map(|size| size as usize)
            .unwrap_or(DEFAULT_INPUT_CAPACITY);
        let (width, height) = self.dimensions();
        // One NV12 frame.
        let output_capacity = width as usize * height as usize * 3 / 2;

        self.pending_inputs.clear();
        self.free_outputs.clear();
        self.format_announced = false;

        Ok(PoolLayout {
            input: QueueLayout {
                buffers: INPUT_BUFFERS,
                capacity: input_capacity,
            },
            output: QueueLayout {
                buffers: OUTPUT_BUFFERS,
                capacity: output_capacity,
            },
        })
    }

    fn decode(&mut self, info: BufferInfo, input: Vec<u8>) -> Result<(), BackendError> {
        // Codec-config buffers are consumed without producing a frame.
        if info.flags.contains(BufferFlags::CODEC_CONFIG) {
            let src = (info.offset as usize).min(input.len());
            let end = src + (info.size as usize).min(input.len() - src);
            self.csd.push(input[src..end].to_vec());
            return self
                .events
                .queue_event(DecoderEvent::InputBufferDone {
                    index: info.index,
                    storage: input,
                })
                .map_err(BackendError::EventQueue);
        }

        self.pending_inputs.push_back((info, input));
        self.pump()
    }

    fn recycle_output(&mut self, index: u32, storage: Vec<u8>) -> Result<(), BackendError> {
        self.free_outputs.push_back((index, storage));
        self.pump()
    }

    fn render_output(&mut self, index: u32, frame: &[u8]) {
        // No display surface; rendering is just observable in the logs.
        log::debug!("rendering output slot {} ({} bytes)", index, frame.len());
    }

    fn flush(&mut self) -> Result<(), BackendError> {
        while let Some((info, storage)) = self.pending_inputs.pop_front() {
            self.events
                .queue_event(DecoderEvent::InputBufferDone {
                    index: info.index,
                    storage,
                })
                .map_err(BackendError::EventQueue)?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), BackendError> {
        self.pending_inputs.clear();
        self.free_outputs.clear();
        self.csd.clear();
        self.format_announced = false;
        Ok(())
    }
}
