// Cantata
// Copyright (c) 2025 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]
// The following lints are allowed in all Cantata crates. Please see the workspace manifest for
// their justification.
#![allow(clippy::comparison_chain)]
#![allow(clippy::identity_op)]
#![allow(clippy::manual_range_contains)]
// Disable to better express the specification.
#![allow(clippy::collapsible_else_if)]
#![allow(clippy::needless_range_loop)]

mod core;
mod decoder;
mod exss;
mod math;
mod speaker;
mod tables;
mod xll;

#[cfg(test)]
mod testutil;

pub use crate::core::{CoreDecoder, NoopCore, PCMBLOCK_SAMPLES};
pub use crate::decoder::{DcaDecoder, MatrixEncoding};
pub use crate::exss::ExssAsset;
pub use crate::speaker::{Speaker, SpeakerMask, SPEAKER_COUNT};

/// Sync word of a backward compatible core sub-stream, in 16-bit big-endian packing.
pub const SYNCWORD_CORE_BE: u32 = 0x7ffe_8001;
/// Sync word of a backward compatible core sub-stream, in 16-bit little-endian packing.
pub const SYNCWORD_CORE_LE: u32 = 0xfe7f_0180;
/// Sync word of a backward compatible core sub-stream, in 14-bits-per-word big-endian packing.
pub const SYNCWORD_CORE_14B_BE: u32 = 0x1fff_e800;
/// Sync word of a backward compatible core sub-stream, in 14-bits-per-word little-endian packing.
pub const SYNCWORD_CORE_14B_LE: u32 = 0xff1f_00e8;
/// Sync word of an extension sub-stream (EXSS).
pub const SYNCWORD_SUBSTREAM: u32 = 0x6458_2025;
/// Sync word of a lossless (XLL) frame within an extension sub-stream asset.
pub const SYNCWORD_XLL: u32 = 0x41a2_9547;

/// Minimum size of a DCA packet in bytes.
pub const MIN_PACKET_SIZE: usize = 16;
/// Maximum size of a DCA packet in bytes.
pub const MAX_PACKET_SIZE: usize = 0x10_4000;

/// The packet contained a backward compatible core sub-stream.
pub(crate) const PACKET_CORE: u8 = 0x01;
/// The packet contained an extension sub-stream.
pub(crate) const PACKET_EXSS: u8 = 0x02;
/// The packet contained a lossless frame.
pub(crate) const PACKET_XLL: u8 = 0x04;
/// Lossless synchronization was lost and the packet is decoded in recovery mode.
pub(crate) const PACKET_RECOVERY: u8 = 0x08;

/// A channel layout the caller may request the decoded output be reduced to.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ChannelRequest {
    /// Decode the full native layout, normalized to the canonical output channel order.
    #[default]
    None,
    /// Decode at most a stereo pair, using an embedded downmix when one is present.
    Stereo,
    /// Decode the minimum number of channel sets covering a 5.0 layout.
    Layout5p0,
    /// Decode the minimum number of channel sets covering a 5.1 layout.
    Layout5p1,
    /// Decode the full native layout keeping native channel positions.
    Native,
}

/// Decoder options specific to DCA streams.
#[derive(Copy, Clone, Debug, Default)]
pub struct DcaOptions {
    /// Decode only the backward compatible core sub-stream, skipping all extensions.
    pub core_only: bool,
    /// Requested output channel layout.
    pub request_channel_layout: ChannelRequest,
    /// Propagate segment-level decode errors instead of concealing them with silence.
    pub strict: bool,
    /// Treat the core decoder output as bit-exact, allowing residual reconstruction to trust the
    /// first decoded core frame.
    pub bitexact: bool,
}
