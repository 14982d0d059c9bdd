// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder backends usable with [`crate::session::CodecSession`].
//!
//! A backend is anything implementing [`crate::DecoderBackend`] and
//! [`crate::DecoderSession`]: a hardware codec wrapper, a software decoding
//! library, or a test double.
//!
//! [stub] implements a loopback software decoder that echoes each access
//! unit into an output buffer. It can be used as a reference for how to
//! write backends, or to test clients without any codec on the host.

#[cfg(feature = "stub-decoder")]
pub mod stub;
#[cfg(feature = "stub-decoder")]
pub use stub::StubDecoder;
