// Cantata
// Copyright (c) 2025 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Extension sub-stream (EXSS) header parsing.
//!
//! The EXSS header is a directory: it carries the sizes and offsets of the assets packed behind
//! it, plus per-asset descriptors announcing which extension components (XBR, XXCH, X96, LBR,
//! XLL, ...) each asset contains and where they sit. Only the fields consumed by the core and
//! lossless decode paths are retained; everything else is skipped using the explicit size fields.

use cantata_core::errors::{decode_error, unsupported_error, Result};
use cantata_core::io::BitReader;

use crate::speaker::{EXSS_CORE, EXSS_LBR, EXSS_X96, EXSS_XBR, EXSS_XLL, EXSS_XXCH};
use crate::tables::SAMPLING_FREQS;
use crate::SYNCWORD_SUBSTREAM;

const EXSS_ASSETS_MAX: usize = 8;

/// Description of one asset within an extension sub-stream.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExssAsset {
    /// Offset of the asset from the start of the sub-stream, in bytes.
    pub asset_offset: usize,
    /// Size of the asset in bytes.
    pub asset_size: usize,
    /// Extension components present within the asset.
    pub extension_mask: u32,

    /// Coded PCM resolution in bits.
    pub pcm_bit_res: u32,
    /// Maximum sampling frequency in Hz.
    pub max_sample_rate: u32,
    /// Total number of coded channels.
    pub nchannels_total: usize,
    /// Channels map one-to-one onto named speaker positions.
    pub one_to_one_map_ch_to_spkr: bool,
    /// Representation type when the mapping is not one-to-one (e.g. LtRt, LhRh).
    pub representation_type: u32,

    /// Offset of the core component from the start of the sub-stream, in bytes.
    pub core_offset: usize,
    /// Size of the core component in bytes.
    pub core_size: usize,

    /// Offset of the lossless component from the start of the sub-stream, in bytes.
    pub xll_offset: usize,
    /// Size of the lossless component in bytes.
    pub xll_size: usize,
    /// A lossless frame begins at the start of the component.
    pub xll_sync_present: bool,
    /// Offset to the first lossless sync word within the component, in bytes.
    pub xll_sync_offset: usize,
    /// Initial lossless decoding delay in frames after synchronization.
    pub xll_delay_nframes: u32,
    /// DTS-HD stream identifier; a change invalidates any buffered smoothing data.
    pub hd_stream_id: u32,
}

/// Extension sub-stream header parser.
#[derive(Default)]
pub struct ExssParser {
    exss_size_nbits: u32,
    static_fields_present: bool,
    mix_metadata_enabled: bool,

    nassets: usize,
    assets: [ExssAsset; EXSS_ASSETS_MAX],
}

impl ExssParser {
    pub fn new() -> Self {
        Default::default()
    }

    /// Gets the assets found by the last successful parse.
    pub fn assets(&self) -> &[ExssAsset] {
        &self.assets[..self.nassets]
    }

    /// Parse an extension sub-stream header starting at the sub-stream sync word.
    pub fn parse(&mut self, data: &[u8]) -> Result<()> {
        let mut bs = BitReader::new(data);

        if bs.read_bits(32)? != SYNCWORD_SUBSTREAM {
            return decode_error("dca: invalid substream sync word");
        }

        // User defined bits.
        bs.ignore_bits(8)?;

        let exss_index = bs.read_bits(2)?;

        // Wide header flag selects the width of all size fields in the header.
        let wide_header = bs.read_bit()?;
        let header_size_nbits = if wide_header { 12 } else { 8 };
        self.exss_size_nbits = if wide_header { 20 } else { 16 };

        let header_size = bs.read_bits(header_size_nbits)? as usize + 1;
        let exss_size = bs.read_bits(self.exss_size_nbits)? as usize + 1;
        if exss_size > data.len() {
            return decode_error("dca: substream size out of range");
        }

        self.nassets = 1;

        self.static_fields_present = bs.read_bit()?;
        if self.static_fields_present {
            // Reference clock code and frame duration code.
            bs.ignore_bits(2 + 3)?;

            if bs.read_bit()? {
                // Timestamp.
                bs.ignore_bits(36)?;
            }

            let npresents = bs.read_bits(3)? as usize + 1;
            self.nassets = bs.read_bits(3)? as usize + 1;
            if self.nassets > EXSS_ASSETS_MAX {
                return unsupported_error("dca: too many substream assets");
            }

            // Which sub-streams each audio presentation draws from, and per drawn sub-stream an
            // 8-bit asset mask.
            let mut active_exss_mask = [0u32; 8];
            for mask in active_exss_mask.iter_mut().take(npresents) {
                *mask = bs.read_bits(exss_index + 1)?;
            }
            for &mask in active_exss_mask.iter().take(npresents) {
                for j in 0..=exss_index {
                    if mask & (1 << j) != 0 {
                        bs.ignore_bits(8)?;
                    }
                }
            }

            self.mix_metadata_enabled = bs.read_bit()?;
            if self.mix_metadata_enabled {
                // Mixing adjustment level.
                bs.ignore_bits(2)?;

                let nbits_mix_mask = (bs.read_bits(2)? + 1) << 2;
                let nmixoutconfigs = bs.read_bits(2)? + 1;
                for _ in 0..nmixoutconfigs {
                    // Speaker layout mask of the mixing configuration.
                    bs.ignore_bits(nbits_mix_mask)?;
                }
            }
        }
        else {
            self.mix_metadata_enabled = false;
        }

        let mut asset_sizes = [0usize; EXSS_ASSETS_MAX];
        for size in asset_sizes.iter_mut().take(self.nassets) {
            *size = bs.read_bits(self.exss_size_nbits)? as usize + 1;
        }

        // Assets are packed back to back after the header.
        let mut asset_offset = header_size;
        for i in 0..self.nassets {
            self.assets[i] = ExssAsset::default();
            self.assets[i].asset_offset = asset_offset;
            self.assets[i].asset_size = asset_sizes[i];
            self.parse_descriptor(&mut bs, i)?;

            asset_offset += asset_sizes[i];
            if asset_offset > exss_size {
                return decode_error("dca: asset offset out of range");
            }
        }

        // Backward compatible core presence flags, reserved data, byte alignment, and the header
        // CRC are consumed by seeking to the end of the header.
        if bs.seek_to(header_size * 8).is_err() {
            return decode_error("dca: read past end of substream header");
        }

        Ok(())
    }

    fn parse_descriptor(&mut self, bs: &mut BitReader<'_>, index: usize) -> Result<()> {
        let asset = &mut self.assets[index];
        let descr_pos = bs.tell();

        let descr_size = bs.read_bits(9)? as usize + 1;

        // Asset index.
        bs.ignore_bits(3)?;

        if self.static_fields_present {
            if bs.read_bit()? {
                // Asset type descriptor.
                bs.ignore_bits(4)?;
            }

            if bs.read_bit()? {
                // Language descriptor.
                bs.ignore_bits(24)?;
            }

            if bs.read_bit()? {
                // Additional textual information.
                let nbytes = bs.read_bits(10)? + 1;
                bs.ignore_bits(nbytes * 8)?;
            }

            asset.pcm_bit_res = bs.read_bits(5)? + 1;
            asset.max_sample_rate = SAMPLING_FREQS[bs.read_bits(4)? as usize];
            asset.nchannels_total = bs.read_bits(8)? as usize + 1;

            asset.one_to_one_map_ch_to_spkr = bs.read_bit()?;
            if asset.one_to_one_map_ch_to_spkr {
                if asset.nchannels_total > 2 {
                    // Embedded stereo downmix flag.
                    bs.ignore_bits(1)?;
                }
                if asset.nchannels_total > 6 {
                    // Embedded 6-channel downmix flag.
                    bs.ignore_bits(1)?;
                }

                if bs.read_bit()? {
                    // Speaker activity mask.
                    let spkr_mask_nbits = (bs.read_bits(2)? + 1) << 2;
                    bs.ignore_bits(spkr_mask_nbits)?;
                }

                if bs.read_bits(3)? != 0 {
                    return unsupported_error("dca: speaker remapping");
                }
            }
            else {
                asset.representation_type = bs.read_bits(3)?;
            }

            if bs.read_bit()? {
                // Dynamic range coefficient.
                bs.ignore_bits(8)?;
            }

            if bs.read_bit()? {
                // Dialog normalization.
                bs.ignore_bits(5)?;
            }

            if self.mix_metadata_enabled && bs.read_bit()? {
                return unsupported_error("dca: per-asset mixing metadata");
            }
        }
        else {
            // Without static fields the asset is a plain continuation of a known configuration.
            asset.one_to_one_map_ch_to_spkr = true;
        }

        let coding_mode = bs.read_bits(2)?;
        match coding_mode {
            // Component mix declared by an extension mask.
            0 => {
                asset.extension_mask = bs.read_bits(12)?;

                if asset.extension_mask & EXSS_CORE != 0 {
                    asset.core_size = bs.read_bits(14)? as usize + 1;
                    if bs.read_bit()? {
                        // Core sync word distance.
                        bs.ignore_bits(2)?;
                    }
                }
                if asset.extension_mask & EXSS_XBR != 0 {
                    bs.ignore_bits(14)?;
                }
                if asset.extension_mask & EXSS_XXCH != 0 {
                    bs.ignore_bits(14)?;
                }
                if asset.extension_mask & EXSS_X96 != 0 {
                    bs.ignore_bits(12)?;
                }
                if asset.extension_mask & EXSS_LBR != 0 {
                    bs.ignore_bits(14)?;
                    if bs.read_bit()? {
                        bs.ignore_bits(2)?;
                    }
                }
                if asset.extension_mask & EXSS_XLL != 0 {
                    asset.xll_size = bs.read_bits(self.exss_size_nbits)? as usize + 1;

                    asset.xll_sync_present = bs.read_bit()?;
                    if asset.xll_sync_present {
                        // Peak bit rate smoothing buffer size code.
                        bs.ignore_bits(4)?;

                        let delay_nbits = bs.read_bits(5)? + 1;
                        asset.xll_delay_nframes = bs.read_bits(delay_nbits)?;
                        asset.xll_sync_offset = bs.read_bits(self.exss_size_nbits)? as usize;
                    }

                    asset.hd_stream_id = bs.read_bits(3)?;
                }
            }
            // Lossless coding without a core component.
            1 => {
                asset.extension_mask = EXSS_XLL;
                asset.xll_size = asset.asset_size;
                asset.hd_stream_id = bs.read_bits(3)?;
            }
            _ => return unsupported_error("dca: unsupported asset coding mode"),
        }

        // The core component leads the asset; the lossless component follows everything else.
        if asset.xll_size > asset.asset_size {
            return decode_error("dca: lossless component larger than its asset");
        }
        asset.core_offset = asset.asset_offset;
        asset.xll_offset = asset.asset_offset + asset.asset_size - asset.xll_size;

        // Reserved descriptor data.
        if bs.seek_to(descr_pos + descr_size * 8).is_err() {
            return decode_error("dca: read past end of asset descriptor");
        }

        Ok(())
    }
}
