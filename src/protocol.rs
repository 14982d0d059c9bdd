// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Types exchanged at the session/decoder boundary.
//!
//! [`BufferInfo`] is a wire contract: its layout, field widths and flag bits
//! must be preserved bit-for-bit across reimplementations, as clients on the
//! other side of a compatibility boundary interpret it as raw memory.
//! Likewise the numeric values of [`DequeueCode`] are fixed.

use enumn::N;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Flag bits carried by a [`BufferInfo`].
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct BufferFlags(u32);

impl BufferFlags {
    /// The buffer contains a key (sync) frame.
    pub const KEY_FRAME: BufferFlags = BufferFlags(1 << 0);
    /// The buffer carries codec-specific data instead of media data.
    pub const CODEC_CONFIG: BufferFlags = BufferFlags(1 << 1);
    /// The buffer is the last one of the stream. Bit value 4 on the wire.
    pub const END_OF_STREAM: BufferFlags = BufferFlags(1 << 2);

    pub const fn empty() -> Self {
        BufferFlags(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        BufferFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = BufferFlags;

    fn bitor(self, rhs: BufferFlags) -> BufferFlags {
        BufferFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: BufferFlags) {
        self.0 |= rhs.0;
    }
}

/// Description of a buffer slot's content, exchanged at the input and output
/// boundaries of a session.
///
/// The layout is padding-free and identical on every platform.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct BufferInfo {
    /// Presentation timestamp in microseconds. Output buffers are produced in
    /// decode order, which may differ from presentation order for codecs with
    /// frame reordering; this field is the ordering key for consumers.
    pub presentation_time_us: i64,
    /// Slot index within the queue the buffer belongs to.
    pub index: u32,
    /// Byte offset of the valid data within the slot.
    pub offset: u32,
    /// Number of valid bytes, starting at `offset`.
    pub size: u32,
    /// Flag bits, see [`BufferFlags`].
    pub flags: BufferFlags,
}

/// Sentinel codes reported by the dequeue operations at a compatibility
/// boundary. The numeric values are load-bearing and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(i32)]
pub enum DequeueCode {
    /// A buffer was dequeued.
    Ok = 0,
    /// No buffer available within the timeout; retry later.
    TryAgainLater = -1,
    /// The output format changed; re-fetch it before reading more frames.
    OutputFormatChanged = -2,
    /// The output pool changed; re-enumerate it before indexing further.
    OutputBuffersChanged = -3,
}

/// Size of one queue's buffer pool, decided by the decoder backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    /// Number of buffer slots in the pool.
    pub buffers: u32,
    /// Byte capacity of each slot.
    pub capacity: usize,
}

/// Layout of both buffer pools of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLayout {
    pub input: QueueLayout,
    pub output: QueueLayout,
}

/// Outcome of a successful `dequeue_input_buffer` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDequeue {
    /// The slot at this index is now client-owned and can be filled.
    Buffer(u32),
    /// No free slot within the timeout. Normal backpressure, not an error.
    TryAgainLater,
}

impl InputDequeue {
    pub fn code(self) -> DequeueCode {
        match self {
            InputDequeue::Buffer(_) => DequeueCode::Ok,
            InputDequeue::TryAgainLater => DequeueCode::TryAgainLater,
        }
    }
}

/// Outcome of a successful `dequeue_output_buffer` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDequeue {
    /// A filled output slot, now client-owned for reading.
    Buffer(BufferInfo),
    /// No output ready within the timeout. Normal, not an error.
    TryAgainLater,
    /// The output format changed; fetch the new descriptor before
    /// interpreting further buffers.
    FormatChanged,
    /// The output pool was re-allocated; re-enumerate it before indexing.
    BuffersChanged,
}

impl OutputDequeue {
    pub fn code(self) -> DequeueCode {
        match self {
            OutputDequeue::Buffer(_) => DequeueCode::Ok,
            OutputDequeue::TryAgainLater => DequeueCode::TryAgainLater,
            OutputDequeue::FormatChanged => DequeueCode::OutputFormatChanged,
            OutputDequeue::BuffersChanged => DequeueCode::OutputBuffersChanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The wire layout of `BufferInfo` must never change.
    #[test]
    fn buffer_info_layout() {
        assert_eq!(std::mem::size_of::<BufferInfo>(), 24);
        assert_eq!(std::mem::align_of::<BufferInfo>(), 8);

        let info = BufferInfo {
            presentation_time_us: 0x0102030405060708,
            index: 1,
            offset: 2,
            size: 3,
            flags: BufferFlags::END_OF_STREAM,
        };
        let bytes = info.as_bytes();
        assert_eq!(&bytes[..8], &0x0102030405060708i64.to_ne_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &2u32.to_ne_bytes());
        assert_eq!(&bytes[16..20], &3u32.to_ne_bytes());
        assert_eq!(&bytes[20..24], &4u32.to_ne_bytes());
    }

    #[test]
    fn eos_flag_value() {
        // Bit 4 is exercised by existing clients.
        assert_eq!(BufferFlags::END_OF_STREAM.bits(), 4);
        assert!(BufferFlags::from_bits(4).contains(BufferFlags::END_OF_STREAM));
        let combined = BufferFlags::KEY_FRAME | BufferFlags::END_OF_STREAM;
        assert_eq!(combined.bits(), 5);
        assert!(combined.contains(BufferFlags::KEY_FRAME));
        assert!(!combined.contains(BufferFlags::CODEC_CONFIG));
    }

    #[test]
    fn dequeue_codes() {
        assert_eq!(DequeueCode::Ok as i32, 0);
        assert_eq!(DequeueCode::TryAgainLater as i32, -1);
        assert_eq!(DequeueCode::OutputFormatChanged as i32, -2);
        assert_eq!(DequeueCode::OutputBuffersChanged as i32, -3);
        assert_eq!(DequeueCode::n(-2), Some(DequeueCode::OutputFormatChanged));
        assert_eq!(DequeueCode::n(-4), None);
        assert_eq!(
            OutputDequeue::Buffer(BufferInfo::default()).code(),
            DequeueCode::Ok
        );
        assert_eq!(
            OutputDequeue::BuffersChanged.code(),
            DequeueCode::OutputBuffersChanged
        );
    }
}
