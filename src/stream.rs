// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Access-unit extraction from raw H.264 elementary streams.
//!
//! [`AccessUnits`] splits an Annex B byte stream on its start codes and
//! yields one start-code-prefixed unit at a time, the granularity at which
//! input buffers are fed to a decoder. [`AccessUnits::stream_header`]
//! peels off the leading parameter sets (SPS/PPS), which clients submit as
//! codec-specific data (`"csd-0"`) instead of regular input.
//!
//! Container demuxing is out of scope; this operates on raw elementary
//! streams only.

/// NAL unit types 1 through 5 carry coded slice data.
fn is_vcl(nal_header: u8) -> bool {
    matches!(nal_header & 0x1f, 1..=5)
}

/// Find the next start code at or after `from`.
///
/// Returns the start of the prefixed unit (including a leading zero byte of
/// a four-byte start code) and the index of the NAL header byte behind it.
fn next_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let unit_start = if i > from && data[i - 1] == 0 { i - 1 } else { i };
            return Some((unit_start, i + 3));
        }
        i += 1;
    }
    None
}

/// Pull-based iterator over the access units of an Annex B stream.
pub struct AccessUnits<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AccessUnits<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        AccessUnits { data, pos: 0 }
    }

    /// Extract the leading non-VCL units (parameter sets) of the stream, if
    /// any, and advance past them.
    ///
    /// Returns `None` when the stream does not begin with parameter sets.
    /// Only meaningful before the first call to `next`.
    pub fn stream_header(&mut self) -> Option<&'a [u8]> {
        let (header_start, first_nal) = next_start_code(self.data, self.pos)?;
        if is_vcl(*self.data.get(first_nal)?) {
            return None;
        }

        let mut cursor = first_nal;
        let header_end = loop {
            match next_start_code(self.data, cursor) {
                Some((unit_start, nal)) => {
                    match self.data.get(nal) {
                        Some(header) if is_vcl(*header) => break unit_start,
                        Some(_) => cursor = nal,
                        // Truncated start code at the very end.
                        None => break self.data.len(),
                    }
                }
                None => break self.data.len(),
            }
        };

        self.pos = header_end;
        Some(&self.data[header_start..header_end])
    }
}

impl<'a> Iterator for AccessUnits<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let (unit_start, nal) = next_start_code(self.data, self.pos)?;
        let unit_end = match next_start_code(self.data, nal) {
            Some((next_start, _)) => next_start,
            None => self.data.len(),
        };
        self.pos = unit_end;
        Some(&self.data[unit_start..unit_end])
    }
}
