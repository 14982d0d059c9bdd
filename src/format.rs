// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Key/value description of a media stream.
//!
//! A [`FormatDescriptor`] is produced when configuring a session and consumed
//! by the decoder backend; the decoder can also replace the session's output
//! descriptor mid-stream when the format of the stream changes. Descriptors
//! are exchanged as `Arc<FormatDescriptor>`, so the last holder frees them.

use std::collections::BTreeMap;

/// Key for the stream duration in microseconds.
pub const KEY_DURATION_US: &str = "durationUs";
/// Key for the frame width in pixels.
pub const KEY_WIDTH: &str = "width";
/// Key for the frame height in pixels.
pub const KEY_HEIGHT: &str = "height";
/// Key for the maximum size of one input access unit, in bytes.
pub const KEY_MAX_INPUT_SIZE: &str = "max-input-size";
/// Key for the line stride of decoded frames, in bytes.
pub const KEY_STRIDE: &str = "stride";
/// Key for the plane height of decoded frames, in lines.
pub const KEY_SLICE_HEIGHT: &str = "slice-height";
/// Key for the color format of decoded frames.
pub const KEY_COLOR_FORMAT: &str = "color-format";
pub const KEY_CROP_LEFT: &str = "crop-left";
pub const KEY_CROP_RIGHT: &str = "crop-right";
pub const KEY_CROP_TOP: &str = "crop-top";
pub const KEY_CROP_BOTTOM: &str = "crop-bottom";

/// A single typed entry of a [`FormatDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum FormatValue {
    Int32(i32),
    Int64(i64),
    String(String),
    Bytes(Vec<u8>),
}

/// Typed key/value record describing stream parameters.
///
/// The mime type is fixed at construction time and cannot be changed
/// afterwards. Byte-buffer entries are owned copies of the caller's data,
/// never aliases into caller memory.
///
/// All read accessors are pure projections: a field that was never set reads
/// as `None` rather than failing, since codecs legitimately omit optional
/// fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    mime: String,
    entries: BTreeMap<String, FormatValue>,
}

impl FormatDescriptor {
    /// Create an empty descriptor for `mime`.
    pub fn new(mime: &str) -> Self {
        FormatDescriptor {
            mime: mime.to_owned(),
            entries: Default::default(),
        }
    }

    /// Create a video descriptor, the counterpart of the
    /// `create_video_format(mime, width, height, duration, max_input_size)`
    /// factory. A zero `duration_us` or `max_input_size` means "unspecified"
    /// and leaves the field unset.
    pub fn video(
        mime: &str,
        width: i32,
        height: i32,
        duration_us: i64,
        max_input_size: i32,
    ) -> Self {
        let mut format = Self::new(mime);
        format.set_int32(KEY_WIDTH, width);
        format.set_int32(KEY_HEIGHT, height);
        if duration_us > 0 {
            format.set_int64(KEY_DURATION_US, duration_us);
        }
        if max_input_size > 0 {
            format.set_int32(KEY_MAX_INPUT_SIZE, max_input_size);
        }
        format
    }

    pub fn set_int32(&mut self, key: &str, value: i32) {
        self.entries
            .insert(key.to_owned(), FormatValue::Int32(value));
    }

    pub fn set_int64(&mut self, key: &str, value: i64) {
        self.entries
            .insert(key.to_owned(), FormatValue::Int64(value));
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.entries
            .insert(key.to_owned(), FormatValue::String(value.to_owned()));
    }

    /// Attach a codec-specific-data blob (e.g. SPS/PPS under `"csd-0"`). The
    /// bytes are copied.
    pub fn set_byte_buffer(&mut self, key: &str, bytes: &[u8]) {
        self.entries
            .insert(key.to_owned(), FormatValue::Bytes(bytes.to_vec()));
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn int32(&self, key: &str) -> Option<i32> {
        match self.entries.get(key) {
            Some(FormatValue::Int32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn int64(&self, key: &str) -> Option<i64> {
        match self.entries.get(key) {
            Some(FormatValue::Int64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(FormatValue::String(v)) => Some(v),
            _ => None,
        }
    }

    pub fn byte_buffer(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(FormatValue::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    /// Iterate over all byte-buffer entries, in key order.
    pub fn byte_buffers(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().filter_map(|(k, v)| match v {
            FormatValue::Bytes(b) => Some((k.as_str(), b.as_slice())),
            _ => None,
        })
    }

    pub fn duration_us(&self) -> Option<i64> {
        self.int64(KEY_DURATION_US)
    }

    pub fn width(&self) -> Option<i32> {
        self.int32(KEY_WIDTH)
    }

    pub fn height(&self) -> Option<i32> {
        self.int32(KEY_HEIGHT)
    }

    pub fn max_input_size(&self) -> Option<i32> {
        self.int32(KEY_MAX_INPUT_SIZE)
    }

    pub fn stride(&self) -> Option<i32> {
        self.int32(KEY_STRIDE)
    }

    pub fn slice_height(&self) -> Option<i32> {
        self.int32(KEY_SLICE_HEIGHT)
    }

    pub fn color_format(&self) -> Option<i32> {
        self.int32(KEY_COLOR_FORMAT)
    }

    pub fn crop_left(&self) -> Option<i32> {
        self.int32(KEY_CROP_LEFT)
    }

    pub fn crop_right(&self) -> Option<i32> {
        self.int32(KEY_CROP_RIGHT)
    }

    pub fn crop_top(&self) -> Option<i32> {
        self.int32(KEY_CROP_TOP)
    }

    pub fn crop_bottom(&self) -> Option<i32> {
        self.int32(KEY_CROP_BOTTOM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_factory() {
        let format = FormatDescriptor::video("video/avc", 1920, 1080, 0, 0);
        assert_eq!(format.mime(), "video/avc");
        assert_eq!(format.width(), Some(1920));
        assert_eq!(format.height(), Some(1080));
        // Zero means unspecified for these two.
        assert_eq!(format.duration_us(), None);
        assert_eq!(format.max_input_size(), None);
        // Fields that were never set read as None, not as an error.
        assert_eq!(format.stride(), None);
        assert_eq!(format.color_format(), None);
        assert_eq!(format.crop_left(), None);
        assert_eq!(format.byte_buffer("csd-0"), None);
    }

    #[test]
    fn byte_buffers_are_owned_copies() {
        let mut source = vec![0x00, 0x00, 0x00, 0x01, 0x67];
        let mut format = FormatDescriptor::new("video/avc");
        format.set_byte_buffer("csd-0", &source);

        // Mutating the caller's buffer must not affect the stored copy.
        source[4] = 0xff;
        assert_eq!(
            format.byte_buffer("csd-0"),
            Some(&[0x00, 0x00, 0x00, 0x01, 0x67][..])
        );

        let collected: Vec<_> = format.byte_buffers().collect();
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].0, "csd-0");
    }

    #[test]
    fn typed_lookup_does_not_cross_types() {
        let mut format = FormatDescriptor::new("audio/mp4a-latm");
        format.set_int32("channel-count", 2);
        assert_eq!(format.int64("channel-count"), None);
        assert_eq!(format.string("channel-count"), None);
        assert_eq!(format.int32("channel-count"), Some(2));
    }
}
