// Cantata
// Copyright (c) 2025 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam to the lossy core sub-stream decoder.
//!
//! The backward compatible core (subband ADPCM, VQ, LFE interpolation, QMF synthesis) is decoded
//! by an external collaborator behind [`CoreDecoder`]. The lossless path consumes the core's
//! post-filter fixed-point output when channels are residually encoded, and the orchestrator
//! falls back to core-only output when no lossless frame is decodable.

use cantata_core::errors::{unsupported_error, Result};

use crate::exss::ExssAsset;
use crate::speaker::{Speaker, SpeakerMask};

/// The number of PCM samples in one core block.
pub const PCMBLOCK_SAMPLES: usize = 32;

/// A decoder for the backward compatible lossy core sub-stream.
///
/// All sample output is planar fixed-point with 24 significant bits in an `i32`, one plane per
/// core channel, `npcmsamples` samples long after filtering.
pub trait CoreDecoder: Send {
    /// Parse a backward compatible core frame starting at the core sync word.
    fn parse(&mut self, data: &[u8]) -> Result<()>;

    /// Parse core extension components (XXCH, XBR, X96) located through the given asset of an
    /// extension sub-stream.
    fn parse_exss(&mut self, data: &[u8], asset: &ExssAsset) -> Result<()>;

    /// Run the fixed-point filter bank over the parsed frame, optionally synthesizing 96 kHz
    /// output from a 48 kHz core.
    fn filter_fixed(&mut self, x96_synth: bool) -> Result<()>;

    /// Maps a speaker to the core channel emitting it, if the core decodes that speaker.
    fn map_speaker(&self, spkr: Speaker) -> Option<usize>;

    /// Gets the post-filter output samples of one core channel.
    fn output_samples(&self, ch: usize) -> &[i32];

    /// The speaker mask the core emits.
    fn ch_mask(&self) -> SpeakerMask;

    /// Size of the parsed core frame in bytes.
    fn frame_size(&self) -> usize;

    /// Sampling frequency of the coded core signal in Hz.
    fn sample_rate(&self) -> u32;

    /// Number of PCM blocks per coded frame.
    fn npcmblocks(&self) -> usize;

    /// Sampling frequency of the filtered output in Hz.
    fn output_rate(&self) -> u32;

    /// Number of PCM samples per channel in the filtered output.
    fn npcmsamples(&self) -> usize;
}

/// A stand-in core decoder for streams decoded without a core collaborator.
///
/// Lossless-only streams (every channel independently coded) decode normally; packets that carry
/// only a core frame, or lossless frames with residually encoded channels, are rejected.
#[derive(Default)]
pub struct NoopCore;

impl CoreDecoder for NoopCore {
    fn parse(&mut self, _data: &[u8]) -> Result<()> {
        unsupported_error("dca: no core decoder available")
    }

    fn parse_exss(&mut self, _data: &[u8], _asset: &ExssAsset) -> Result<()> {
        Ok(())
    }

    fn filter_fixed(&mut self, _x96_synth: bool) -> Result<()> {
        unsupported_error("dca: no core decoder available")
    }

    fn map_speaker(&self, _spkr: Speaker) -> Option<usize> {
        None
    }

    fn output_samples(&self, _ch: usize) -> &[i32] {
        &[]
    }

    fn ch_mask(&self) -> SpeakerMask {
        0
    }

    fn frame_size(&self) -> usize {
        0
    }

    fn sample_rate(&self) -> u32 {
        0
    }

    fn npcmblocks(&self) -> usize {
        0
    }

    fn output_rate(&self) -> u32 {
        0
    }

    fn npcmsamples(&self) -> usize {
        0
    }
}
