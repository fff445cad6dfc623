// Cantata
// Copyright (c) 2025 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per channel-set state of a lossless frame: the sub-header, per-band predictor and
//! decorrelation parameters, sample buffers, and the per-band filters.

use cantata_core::errors::{decode_error, unsupported_error, Result};
use cantata_core::io::BitReader;
use cantata_core::util::bits::ceil_log2;

use crate::exss::ExssAsset;
use crate::math::{clip23, mul16, mul3, norm16, vmul22_sub, vmul23_sub};
use crate::speaker::{
    DownMixType, Speaker, SpeakerMask, DMIX_TYPE_COUNT, SPEAKER_LAYOUT_STEREO,
};
use crate::tables::{DMIX_PRIMARY_NCH, DMIX_TABLE, DMIX_TABLE_INV, SAMPLING_FREQS, XLL_REFL_COEFF};

use super::entropy::{get_array, get_linear, get_linear_array, get_rice, get_rice_array};
use super::{
    verify_checksum, FrameParams, XLL_ADAPT_PRED_ORDER_MAX, XLL_CHANNELS_MAX, XLL_DECI_HISTORY_MAX,
};

/// State of one frequency band within a channel set.
#[derive(Clone, Default)]
pub struct Band {
    /// Pairwise channel decorrelation was applied by the encoder.
    pub decor_enabled: bool,
    /// Original channel position of each coded channel.
    pub orig_order: [usize; XLL_CHANNELS_MAX],
    /// Decorrelation coefficient of each coded channel pair.
    pub decor_coeff: [i32; XLL_CHANNELS_MAX / 2],

    /// Adaptive predictor order of each channel, 0 when fixed prediction is used.
    pub adapt_pred_order: [usize; XLL_CHANNELS_MAX],
    /// Highest adaptive predictor order within the band.
    pub highest_pred_order: usize,
    /// Fixed predictor order of each channel.
    pub fixed_pred_order: [usize; XLL_CHANNELS_MAX],
    /// Dequantized reflection coefficients of the adaptive predictor, Q16.
    pub adapt_refl_coeff: [[i32; XLL_ADAPT_PRED_ORDER_MAX]; XLL_CHANNELS_MAX],

    /// The encoder embedded a downmix within this band.
    pub dmix_embedded: bool,

    /// Size of the LSB section of any segment in bytes, 0 when the band has no MSB/LSB split.
    pub lsb_section_size: usize,
    /// Number of scalable LSBs of each channel.
    pub nscalablelsbs: [u32; XLL_CHANNELS_MAX],
    /// Number of bits discarded by authoring for each channel.
    pub bit_width_adjust: [u32; XLL_CHANNELS_MAX],

    /// MSB sample buffers, one per channel. Each buffer leads with a `XLL_DECI_HISTORY_MAX`
    /// sample history region used by two-band reassembly; frame samples follow it.
    pub msb_sample_buffer: Vec<Vec<i32>>,
    /// LSB sample buffers, one per channel; empty when the band has no MSB/LSB split.
    pub lsb_sample_buffer: Vec<Vec<i32>>,
}

/// State of one channel set of a lossless frame.
#[derive(Clone, Default)]
pub struct ChannelSet {
    /// Number of coded channels.
    pub nchannels: usize,
    /// Bit i set means channel i is fully independent, clear means it is residually encoded on
    /// top of the lossy core.
    pub residual_encode: u32,
    /// Coded PCM resolution in bits.
    pub pcm_bit_res: u32,
    /// Storage unit width in bits, 16 or 24.
    pub storage_bit_res: u32,
    /// Sampling frequency of one frequency band in Hz.
    pub freq: u32,
    /// Number of frequency bands, 1 or 2.
    pub nfreqbands: usize,

    /// This is the primary channel set.
    pub primary_chset: bool,
    /// A downmix coefficient matrix is present.
    pub dmix_coeffs_present: bool,
    /// The encoder embedded the downmix into downstream channel sets.
    pub dmix_embedded: bool,
    /// Downmix type of the primary channel set.
    pub dmix_type: DownMixType,
    /// The channel set participates in the channel hierarchy.
    pub hier_chset: bool,
    /// Number of hierarchical channels coded by preceding channel sets.
    pub hier_ofs: usize,

    /// Speaker mask of the set.
    pub ch_mask: SpeakerMask,
    /// Speaker emitted by each coded channel.
    pub ch_remap: [usize; XLL_CHANNELS_MAX],

    /// Number of bits used to read bit allocation coding parameters.
    pub nabits: u32,

    /// Downmix coefficient matrix, row per downmixed-to channel, column per own channel, Q15.
    pub dmix_coeff: Vec<i32>,
    /// Downmix scale of each downmixed-to channel, Q15.
    pub dmix_scale: Vec<i32>,
    /// Inverse downmix scale of each downmixed-to channel, Q16.
    pub dmix_scale_inv: Vec<i32>,

    /// Frequency band state.
    pub bands: [Band; 2],
    /// Decimator history of each channel, seeding two-band reassembly across frames.
    pub deci_history: [[i32; XLL_DECI_HISTORY_MAX]; XLL_CHANNELS_MAX],

    // Segment coding parameters, carried over between segments on reuse.
    pub seg_common: bool,
    pub rice_code_flag: [bool; XLL_CHANNELS_MAX],
    pub bitalloc_hybrid_linear: [u32; XLL_CHANNELS_MAX],
    pub bitalloc_part_a: [u32; XLL_CHANNELS_MAX],
    pub bitalloc_part_b: [u32; XLL_CHANNELS_MAX],
    pub nsamples_part_a: [usize; XLL_CHANNELS_MAX],

    /// Interleaved two-band output, one stretch of `2 * nframesamples` per channel.
    pub assembly_buffer: Vec<i32>,
}

impl ChannelSet {
    /// Parse the channel set sub-header. `hier_ofs` must be assigned by the caller beforehand;
    /// `primary` carries the first channel set when parsing any other.
    pub fn parse_header(
        &mut self,
        bs: &mut BitReader<'_>,
        frame: &FrameParams,
        primary: Option<&ChannelSet>,
        asset: &ExssAsset,
    ) -> Result<()> {
        let header_pos = bs.tell();

        // Size of channel set sub-header.
        let header_size = bs.read_bits(10)? as usize + 1;

        if verify_checksum(bs, header_pos, header_pos + header_size * 8).is_err() {
            return decode_error("dca: invalid sub-header checksum");
        }

        // Number of channels in the channel set.
        self.nchannels = bs.read_bits(4)? as usize + 1;
        if self.nchannels > XLL_CHANNELS_MAX {
            return unsupported_error("dca: too many channels in channel set");
        }

        // Residual coding type of each channel.
        self.residual_encode = bs.read_bits(self.nchannels as u32)?;

        // PCM bit resolution and storage unit width.
        self.pcm_bit_res = bs.read_bits(5)? + 1;
        self.storage_bit_res = bs.read_bits(5)? + 1;
        if self.storage_bit_res != 16 && self.storage_bit_res != 24 {
            return unsupported_error("dca: unsupported storage bit resolution");
        }
        if self.pcm_bit_res > self.storage_bit_res {
            return decode_error("dca: invalid pcm bit resolution");
        }

        // Original sampling frequency.
        self.freq = SAMPLING_FREQS[bs.read_bits(4)? as usize];
        if self.freq > 192_000 {
            return unsupported_error("dca: unsupported sampling frequency");
        }

        // Sampling frequency modifier.
        if bs.read_bits(2)? != 0 {
            return unsupported_error("dca: sampling frequency modifiers");
        }

        // Which replacement set this channel set is member of.
        if bs.read_bits(2)? != 0 {
            return unsupported_error("dca: replacement channel sets");
        }

        if asset.one_to_one_map_ch_to_spkr {
            // Primary channel set flag.
            self.primary_chset = bs.read_bit()?;
            if self.primary_chset != primary.is_none() {
                return decode_error("dca: the first channel set must be primary");
            }

            // Downmix coefficients present in stream, and whether the downmix was already
            // performed by the encoder.
            self.dmix_coeffs_present = bs.read_bit()?;
            self.dmix_embedded = self.dmix_coeffs_present && bs.read_bit()?;

            // Downmix type.
            if self.dmix_coeffs_present && self.primary_chset {
                let dmix_type = bs.read_bits(3)?;
                if dmix_type >= DMIX_TYPE_COUNT {
                    return decode_error("dca: invalid primary downmix type");
                }
                self.dmix_type = DownMixType::from_index(dmix_type).unwrap();
            }

            // Whether the channel set is part of the hierarchy.
            self.hier_chset = bs.read_bit()?;
            if !self.hier_chset && frame.nchsets != 1 {
                return unsupported_error("dca: channel sets outside the hierarchy");
            }

            if self.dmix_coeffs_present {
                self.parse_dmix_coeffs(bs)?;
            }

            // Channel mask enabled flag.
            if !bs.read_bit()? {
                return unsupported_error("dca: channel sets without a channel mask");
            }

            // Channel mask of the set.
            self.ch_mask = bs.read_bits(frame.ch_mask_nbits)?;
            if self.ch_mask.count_ones() as usize != self.nchannels {
                return decode_error("dca: invalid channel mask");
            }

            // Build the channel to speaker map.
            let mut ch = 0;
            for spkr in 0..frame.ch_mask_nbits as usize {
                if self.ch_mask & (1 << spkr) != 0 {
                    self.ch_remap[ch] = spkr;
                    ch += 1;
                }
            }
        }
        else {
            // Mapping coefficients present flag.
            if self.nchannels != 2 || frame.nchsets != 1 || bs.read_bit()? {
                return unsupported_error("dca: custom channel to speaker mapping");
            }

            // Setup for LtRt decoding.
            self.primary_chset = true;
            self.dmix_coeffs_present = false;
            self.dmix_embedded = false;
            self.hier_chset = false;
            self.ch_mask = SPEAKER_LAYOUT_STEREO;
            self.ch_remap[0] = Speaker::L as usize;
            self.ch_remap[1] = Speaker::R as usize;
        }

        if self.freq > 96_000 {
            // Extra frequency bands flag.
            if bs.read_bit()? {
                return unsupported_error("dca: extra frequency bands");
            }
            self.nfreqbands = 2;
        }
        else {
            self.nfreqbands = 1;
        }

        // Set the sampling frequency to that of the first frequency band. Frequency will be
        // doubled again after bands reassembly.
        self.freq >>= self.nfreqbands - 1;

        // All channel sets must share the audio characteristics of the primary one.
        if let Some(p) = primary {
            if self.freq != p.freq
                || self.pcm_bit_res != p.pcm_bit_res
                || self.storage_bit_res != p.storage_bit_res
            {
                return unsupported_error("dca: channel sets with differing audio characteristics");
            }
        }

        // Number of bits to read bit allocation coding parameters.
        self.nabits = if self.storage_bit_res > 16 {
            5
        }
        else if self.storage_bit_res > 8 {
            4
        }
        else {
            3
        };

        // Account for embedded downmix and decimator saturation.
        if (frame.nchsets > 1 || self.nfreqbands > 1) && self.nabits < 5 {
            self.nabits += 1;
        }

        for band in 0..self.nfreqbands {
            self.parse_band_header(bs, frame, band)?;
        }

        // Reserved bits, byte alignment, and the sub-header CRC16.
        if bs.seek_to(header_pos + header_size * 8).is_err() {
            return decode_error("dca: read past end of sub-header");
        }

        Ok(())
    }

    fn parse_band_header(
        &mut self,
        bs: &mut BitReader<'_>,
        frame: &FrameParams,
        band: usize,
    ) -> Result<()> {
        let nchannels = self.nchannels;
        let b = &mut self.bands[band];

        // Pairwise channel decorrelation.
        b.decor_enabled = bs.read_bit()?;
        if b.decor_enabled && nchannels > 1 {
            let ch_nbits = ceil_log2(nchannels as u32);

            // Original channel order.
            for i in 0..nchannels {
                b.orig_order[i] = bs.read_bits(ch_nbits)? as usize;
                if b.orig_order[i] >= nchannels {
                    return decode_error("dca: invalid original channel order");
                }
            }

            // Pairwise channel coefficients.
            for i in 0..nchannels / 2 {
                b.decor_coeff[i] = if bs.read_bit()? { get_linear(bs, 7)? } else { 0 };
            }
        }
        else {
            for i in 0..nchannels {
                b.orig_order[i] = i;
            }
            for i in 0..nchannels / 2 {
                b.decor_coeff[i] = 0;
            }
        }

        // Adaptive predictor order.
        b.highest_pred_order = 0;
        for i in 0..nchannels {
            b.adapt_pred_order[i] = bs.read_bits(4)? as usize;
            b.highest_pred_order = b.highest_pred_order.max(b.adapt_pred_order[i]);
        }
        if b.highest_pred_order > frame.nsegsamples {
            return decode_error("dca: invalid adaptive prediction order");
        }

        // Fixed predictor order.
        for i in 0..nchannels {
            b.fixed_pred_order[i] =
                if b.adapt_pred_order[i] != 0 { 0 } else { bs.read_bits(2)? as usize };
        }

        // Adaptive predictor quantized reflection coefficients.
        for i in 0..nchannels {
            for j in 0..b.adapt_pred_order[i] {
                let k = get_linear(bs, 8)?;
                if k == -128 {
                    return decode_error("dca: invalid reflection coefficient index");
                }
                b.adapt_refl_coeff[i][j] = if k < 0 {
                    -i32::from(XLL_REFL_COEFF[(-k) as usize])
                }
                else {
                    i32::from(XLL_REFL_COEFF[k as usize])
                };
            }
        }

        // Downmix performed by encoder in extension frequency band.
        b.dmix_embedded = self.dmix_embedded && (band == 0 || bs.read_bit()?);

        // MSB/LSB split in this frequency band.
        if (band == 0 && frame.scalable_lsbs) || (band != 0 && bs.read_bit()?) {
            // Size of LSB section in any segment.
            b.lsb_section_size = bs.read_bits(frame.seg_size_nbits)? as usize;
            if b.lsb_section_size > frame.frame_size {
                return decode_error("dca: invalid LSB section size");
            }

            // Account for optional CRC bytes after the LSB section.
            if b.lsb_section_size != 0
                && (frame.band_crc_present > 2 || (band == 0 && frame.band_crc_present > 1))
            {
                b.lsb_section_size += 2;
            }

            // Number of bits to represent the samples in the LSB part.
            for i in 0..nchannels {
                b.nscalablelsbs[i] = bs.read_bits(4)?;
                if b.nscalablelsbs[i] != 0 && b.lsb_section_size == 0 {
                    return decode_error("dca: LSB section missing with non-zero LSB width");
                }
            }
        }
        else {
            b.lsb_section_size = 0;
            for i in 0..nchannels {
                b.nscalablelsbs[i] = 0;
            }
        }

        // Scalable resolution in this frequency band.
        if (band == 0 && frame.scalable_lsbs) || (band != 0 && bs.read_bit()?) {
            // Number of bits discarded by authoring.
            for i in 0..nchannels {
                b.bit_width_adjust[i] = bs.read_bits(4)?;
            }
        }
        else {
            for i in 0..nchannels {
                b.bit_width_adjust[i] = 0;
            }
        }

        Ok(())
    }

    fn parse_dmix_coeffs(&mut self, bs: &mut BitReader<'_>) -> Result<()> {
        // Size of the downmix coefficient matrix.
        let m = if self.primary_chset {
            DMIX_PRIMARY_NCH[self.dmix_type as usize]
        }
        else {
            self.hier_ofs
        };
        let n = self.nchannels;

        self.dmix_coeff.clear();
        self.dmix_coeff.resize(m * n, 0);
        self.dmix_scale.clear();
        self.dmix_scale.resize(m, 0);
        self.dmix_scale_inv.clear();
        self.dmix_scale_inv.resize(m, 0);

        for i in 0..m {
            let mut scale_inv = 0;

            // Downmix scale, only for non-primary channel sets.
            if !self.primary_chset {
                let code = bs.read_bits(9)?;
                let sign = (code >> 8) as i32 - 1;
                let index = (code & 0xff).wrapping_sub(41) as usize;
                if index >= DMIX_TABLE_INV.len() {
                    return decode_error("dca: invalid downmix scale index");
                }
                let scale = i32::from(DMIX_TABLE[index + 41]);
                scale_inv = DMIX_TABLE_INV[index] as i32;
                self.dmix_scale[i] = (scale ^ sign) - sign;
                self.dmix_scale_inv[i] = (scale_inv ^ sign) - sign;
            }

            // Downmix coefficients.
            for j in 0..n {
                let code = bs.read_bits(9)?;
                let sign = (code >> 8) as i32 - 1;
                let index = (code & 0xff) as usize;
                if index >= DMIX_TABLE.len() {
                    return decode_error("dca: invalid downmix coefficient index");
                }
                let mut coeff = i32::from(DMIX_TABLE[index]);
                if !self.primary_chset {
                    // Multiply by the inverse scale to obtain the undo coefficient.
                    coeff = mul16(scale_inv, coeff);
                }
                self.dmix_coeff[i * n + j] = (coeff ^ sign) - sign;
            }
        }

        Ok(())
    }

    /// (Re)allocate the MSB sample buffers for the current frame configuration.
    pub fn alloc_msb_band_data(&mut self, frame: &FrameParams) {
        let len = XLL_DECI_HISTORY_MAX + frame.nframesamples;

        for band in 0..self.nfreqbands {
            let bufs = &mut self.bands[band].msb_sample_buffer;
            bufs.resize(self.nchannels, Vec::new());
            for buf in bufs.iter_mut() {
                if buf.len() != len {
                    buf.clear();
                    buf.resize(len, 0);
                }
            }
        }
    }

    /// (Re)allocate the LSB sample buffers for bands with an MSB/LSB split.
    pub fn alloc_lsb_band_data(&mut self, frame: &FrameParams) {
        for band in 0..self.nfreqbands {
            let b = &mut self.bands[band];
            let len = if b.lsb_section_size != 0 { frame.nframesamples } else { 0 };

            b.lsb_sample_buffer.resize(self.nchannels, Vec::new());
            for buf in b.lsb_sample_buffer.iter_mut() {
                if buf.len() != len {
                    buf.clear();
                    buf.resize(len, 0);
                }
            }
        }
    }

    /// Parse the MSB and LSB portions of one band segment. `band_data_end` is the absolute bit
    /// position of the end of the segment slice per the navigation table.
    pub fn parse_band_data(
        &mut self,
        bs: &mut BitReader<'_>,
        frame: &FrameParams,
        band: usize,
        seg: usize,
        band_data_end: usize,
    ) -> Result<()> {
        // Start unpacking the MSB portion of the segment. The coding parameters of the previous
        // segment are reused when flagged.
        if !(seg != 0 && bs.read_bit()?) {
            // Segment type: one set of coding parameters shared by all channels, or one per
            // channel.
            self.seg_common = bs.read_bit()?;

            let k = if self.seg_common { 1 } else { self.nchannels };

            // Rice coding flags and the Hybrid Rice binary code length for isolated samples.
            for i in 0..k {
                self.rice_code_flag[i] = bs.read_bit()?;
                self.bitalloc_hybrid_linear[i] =
                    if !self.seg_common && self.rice_code_flag[i] && bs.read_bit()? {
                        bs.read_bits(self.nabits)? + 1
                    }
                    else {
                        0
                    };
            }

            // Bit allocation coding parameters. A linear code of zero width stays zero; any other
            // linear width is biased by one.
            for i in 0..k {
                if seg == 0 {
                    self.bitalloc_part_a[i] = bs.read_bits(self.nabits)?;
                    if !self.rice_code_flag[i] && self.bitalloc_part_a[i] != 0 {
                        self.bitalloc_part_a[i] += 1;
                    }
                    self.nsamples_part_a[i] = if self.seg_common {
                        self.bands[band].highest_pred_order
                    }
                    else {
                        self.bands[band].adapt_pred_order[i]
                    };
                }
                else {
                    self.bitalloc_part_a[i] = 0;
                    self.nsamples_part_a[i] = 0;
                }

                self.bitalloc_part_b[i] = bs.read_bits(self.nabits)?;
                if !self.rice_code_flag[i] && self.bitalloc_part_b[i] != 0 {
                    self.bitalloc_part_b[i] += 1;
                }
            }
        }

        // Unpack entropy codes.
        for ch in 0..self.nchannels {
            let k = if self.seg_common { 0 } else { ch };

            // Slice the segment into parts A and B.
            let offset = XLL_DECI_HISTORY_MAX + seg * frame.nsegsamples;
            let buf = &mut self.bands[band].msb_sample_buffer[ch][offset..offset + frame.nsegsamples];
            let (part_a, part_b) = buf.split_at_mut(self.nsamples_part_a[k]);

            if !self.rice_code_flag[k] {
                // Linear codes.
                get_linear_array(bs, part_a, self.bitalloc_part_a[k])?;
                get_linear_array(bs, part_b, self.bitalloc_part_b[k])?;
            }
            else {
                get_rice_array(bs, part_a, self.bitalloc_part_a[k])?;

                if self.bitalloc_hybrid_linear[k] != 0 {
                    // Hybrid Rice codes: isolated samples are flagged by location and stored as
                    // linear codes, the rest are Rice coded.
                    let nisosamples = bs.read_bits(frame.nsegsamples_log2)? as usize;

                    part_b.fill(0);
                    for _ in 0..nisosamples {
                        let loc = bs.read_bits(frame.nsegsamples_log2)? as usize;
                        if loc >= part_b.len() {
                            return decode_error("dca: invalid isolated sample location");
                        }
                        if part_b[loc] != 0 {
                            return decode_error("dca: duplicate isolated sample location");
                        }
                        part_b[loc] = -1;
                    }

                    for sample in part_b.iter_mut() {
                        *sample = if *sample != 0 {
                            get_linear(bs, self.bitalloc_hybrid_linear[k])?
                        }
                        else {
                            get_rice(bs, self.bitalloc_part_b[k])?
                        };
                    }
                }
                else {
                    get_rice_array(bs, part_b, self.bitalloc_part_b[k])?;
                }
            }
        }

        // Unpack the decimator history for frequency band 1.
        if seg == 0 && band == 1 {
            let nbits = bs.read_bits(5)? + 1;
            for ch in 0..self.nchannels {
                for j in 1..XLL_DECI_HISTORY_MAX {
                    self.deci_history[ch][j] = bs.read_bits_signed(nbits)?;
                }
            }
        }

        // Unpack the LSB portion of the segment.
        let lsb_size = self.bands[band].lsb_section_size;
        if lsb_size != 0 {
            let lsb_start = match band_data_end.checked_sub(lsb_size * 8) {
                Some(pos) => pos,
                None => return decode_error("dca: read past end of band data"),
            };
            if bs.seek_to(lsb_start).is_err() {
                return decode_error("dca: read past end of band data");
            }

            for ch in 0..self.nchannels {
                let width = self.bands[band].nscalablelsbs[ch];
                if width != 0 {
                    let offset = seg * frame.nsegsamples;
                    let lsb = &mut self.bands[band].lsb_sample_buffer[ch]
                        [offset..offset + frame.nsegsamples];
                    get_array(bs, lsb, width)?;
                }
            }
        }

        // Skip to the end of the band data.
        if bs.seek_to(band_data_end).is_err() {
            return decode_error("dca: read past end of band data");
        }

        Ok(())
    }

    /// Clears one segment of band data, or the entire band when `seg` is `None`.
    pub fn clear_band_data(&mut self, frame: &FrameParams, band: usize, seg: Option<usize>) {
        let (offset, nsamples) = match seg {
            Some(seg) => (seg * frame.nsegsamples, frame.nsegsamples),
            None => (0, frame.nframesamples),
        };

        // Buffers may not have been allocated yet when concealing a failed first parse.
        self.alloc_msb_band_data(frame);
        self.alloc_lsb_band_data(frame);

        let b = &mut self.bands[band];
        for ch in 0..self.nchannels {
            let start = XLL_DECI_HISTORY_MAX + offset;
            b.msb_sample_buffer[ch][start..start + nsamples].fill(0);
            if b.lsb_section_size != 0 {
                b.lsb_sample_buffer[ch][offset..offset + nsamples].fill(0);
            }
        }

        if seg.unwrap_or(0) == 0 && band != 0 {
            self.deci_history = [[0; XLL_DECI_HISTORY_MAX]; XLL_CHANNELS_MAX];
        }

        if seg.is_none() {
            let b = &mut self.bands[band];
            b.nscalablelsbs = [0; XLL_CHANNELS_MAX];
            b.bit_width_adjust = [0; XLL_CHANNELS_MAX];
        }
    }

    /// Applies inverse prediction and inverse pairwise decorrelation over one band of the frame.
    pub fn filter_band_data(&mut self, frame: &FrameParams, band: usize) {
        let nsamples = frame.nframesamples;

        // Inverse adaptive or fixed prediction.
        for ch in 0..self.nchannels {
            let order = self.bands[band].adapt_pred_order[ch];
            if order > 0 {
                // Conversion from reflection coefficients to direct form coefficients.
                let mut coeff = [0i32; XLL_ADAPT_PRED_ORDER_MAX];
                for j in 0..order {
                    let rc = self.bands[band].adapt_refl_coeff[ch][j];
                    for k in 0..(j + 1) / 2 {
                        let tmp1 = coeff[k];
                        let tmp2 = coeff[j - k - 1];
                        coeff[k] = tmp1.wrapping_add(mul16(rc, tmp2));
                        coeff[j - k - 1] = tmp2.wrapping_add(mul16(rc, tmp1));
                    }
                    coeff[j] = rc;
                }

                // Inverse adaptive prediction.
                let buf = &mut self.bands[band].msb_sample_buffer[ch]
                    [XLL_DECI_HISTORY_MAX..XLL_DECI_HISTORY_MAX + nsamples];
                for j in 0..nsamples - order {
                    let mut err = 0i64;
                    for k in 0..order {
                        err += i64::from(buf[j + k]) * i64::from(coeff[order - k - 1]);
                    }
                    buf[j + order] = buf[j + order].wrapping_sub(clip23(norm16(err)));
                }
            }
            else {
                // Inverse fixed coefficient prediction.
                let fixed = self.bands[band].fixed_pred_order[ch];
                let buf = &mut self.bands[band].msb_sample_buffer[ch]
                    [XLL_DECI_HISTORY_MAX..XLL_DECI_HISTORY_MAX + nsamples];
                for _ in 0..fixed {
                    for k in 1..nsamples {
                        buf[k] = buf[k].wrapping_add(buf[k - 1]);
                    }
                }
            }
        }

        // Inverse pairwise channel decorrelation.
        let b = &mut self.bands[band];
        if b.decor_enabled {
            for pair in 0..self.nchannels / 2 {
                let coeff = b.decor_coeff[pair];
                if coeff != 0 {
                    let (head, tail) = b.msb_sample_buffer.split_at_mut(2 * pair + 1);
                    let src = &head[2 * pair][XLL_DECI_HISTORY_MAX..XLL_DECI_HISTORY_MAX + nsamples];
                    let dst = &mut tail[0][XLL_DECI_HISTORY_MAX..XLL_DECI_HISTORY_MAX + nsamples];
                    for (d, &s) in dst.iter_mut().zip(src) {
                        *d = d.wrapping_add(mul3(s, coeff));
                    }
                }
            }

            // Reorder channel buffers to the original order.
            let old = std::mem::take(&mut b.msb_sample_buffer);
            let mut reordered = vec![Vec::new(); old.len()];
            for (i, buf) in old.into_iter().enumerate() {
                reordered[b.orig_order[i]] = buf;
            }
            b.msb_sample_buffer = reordered;
        }
    }

    /// The total left-shift restoring the coded sample resolution of one channel.
    pub fn get_lsb_width(&self, frame: &FrameParams, band: usize, ch: usize) -> u32 {
        let adj = self.bands[band].bit_width_adjust[ch];
        let lsbs = self.bands[band].nscalablelsbs[ch];

        if frame.fixed_lsb_width != 0 {
            frame.fixed_lsb_width
        }
        else if lsbs != 0 && adj != 0 {
            lsbs + adj - 1
        }
        else {
            lsbs + adj
        }
    }

    /// Reassembles scalable MSB/LSB sample pairs into full resolution samples.
    pub fn assemble_msbs_lsbs(&mut self, frame: &FrameParams, band: usize) {
        let nsamples = frame.nframesamples;

        for ch in 0..self.nchannels {
            let shift = self.get_lsb_width(frame, band, ch);
            if shift == 0 {
                continue;
            }

            let b = &mut self.bands[band];
            let msb =
                &mut b.msb_sample_buffer[ch][XLL_DECI_HISTORY_MAX..XLL_DECI_HISTORY_MAX + nsamples];

            if b.nscalablelsbs[ch] != 0 {
                let adj = b.bit_width_adjust[ch];
                let lsb = &b.lsb_sample_buffer[ch][..nsamples];
                for (m, &l) in msb.iter_mut().zip(lsb) {
                    *m = m.wrapping_mul(1 << shift).wrapping_add(l << adj);
                }
            }
            else {
                for m in msb.iter_mut() {
                    *m = m.wrapping_mul(1 << shift);
                }
            }
        }
    }

    /// Reassembles the two frequency bands into one signal of twice the rate, interleaving the
    /// result into the assembly buffer.
    pub fn assemble_freq_bands(&mut self, frame: &FrameParams) {
        const BAND_COEFF1: [i32; XLL_DECI_HISTORY_MAX] =
            [-20577, 122631, -393647, 904476, -1696305, 2825313, -4430736, 6791313];
        const BAND_COEFF2: [i32; XLL_DECI_HISTORY_MAX] =
            [41153, -245210, 785564, -1788164, 3259333, -5074941, 6928550, -8204883];

        let nsamples = frame.nframesamples;

        self.assembly_buffer.resize(2 * nsamples * self.nchannels, 0);

        let (head, tail) = self.bands.split_at_mut(1);

        for ch in 0..self.nchannels {
            // The full band 0 buffer including the history region, and the band 1 frame samples.
            let band0 = &mut head[0].msb_sample_buffer[ch];
            let band1 = &mut tail[0].msb_sample_buffer[ch]
                [XLL_DECI_HISTORY_MAX..XLL_DECI_HISTORY_MAX + nsamples];

            // Seed the history region with the decimator history.
            for i in 1..XLL_DECI_HISTORY_MAX {
                band0[i] = self.deci_history[ch][i];
            }

            // Fixed lattice update between the bands.
            let frame0 = XLL_DECI_HISTORY_MAX;
            vmul22_sub(&mut band0[frame0..frame0 + nsamples], band1, 868669);
            vmul22_sub(band1, &band0[frame0..frame0 + nsamples], -5931642);
            vmul22_sub(&mut band0[frame0..frame0 + nsamples], band1, -1228483);
            vmul22_sub(band1, &band0[frame0..frame0 + nsamples], 1 << 22);

            // FIR over the history taps, advancing the band 0 window backward by one sample per
            // tap.
            for i in 0..XLL_DECI_HISTORY_MAX {
                let off = XLL_DECI_HISTORY_MAX - i;
                vmul23_sub(&mut band0[off..off + nsamples], band1, BAND_COEFF1[i]);
                vmul23_sub(band1, &band0[off..off + nsamples], BAND_COEFF2[i]);
                vmul23_sub(&mut band0[off..off + nsamples], band1, BAND_COEFF1[i]);
            }

            // Interleave. Band 0 lags by the reconstruction delay of the filter above.
            let out = &mut self.assembly_buffer[ch * 2 * nsamples..(ch + 1) * 2 * nsamples];
            for t in 0..nsamples {
                out[2 * t] = band1[t];
                out[2 * t + 1] = band0[1 + t];
            }
        }
    }

    /// Gets the filtered output samples of one channel.
    pub fn output_samples(&self, frame: &FrameParams, ch: usize) -> &[i32] {
        if self.nfreqbands > 1 {
            let nsamples = 2 * frame.nframesamples;
            &self.assembly_buffer[ch * nsamples..(ch + 1) * nsamples]
        }
        else {
            &self.bands[0].msb_sample_buffer[ch]
                [XLL_DECI_HISTORY_MAX..XLL_DECI_HISTORY_MAX + frame.nframesamples]
        }
    }

    /// True when the set is a non-primary hierarchical set with an embedded downmix.
    pub fn is_hier_dmix_chset(&self) -> bool {
        !self.primary_chset && self.dmix_embedded && self.hier_chset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(nframesamples: usize) -> FrameParams {
        FrameParams {
            frame_size: 1024,
            nchsets: 1,
            nframesegs: 1,
            nsegsamples_log2: 8,
            nsegsamples: nframesamples,
            nframesamples,
            seg_size_nbits: 10,
            band_crc_present: 0,
            scalable_lsbs: false,
            ch_mask_nbits: 10,
            fixed_lsb_width: 0,
        }
    }

    fn chset(nchannels: usize, frame: &FrameParams) -> ChannelSet {
        let mut c = ChannelSet { nchannels, nfreqbands: 1, ..Default::default() };
        c.alloc_msb_band_data(frame);
        c
    }

    #[test]
    fn verify_fixed_prediction_running_sum() {
        let frame = frame(8);
        let mut c = chset(1, &frame);

        c.bands[0].fixed_pred_order[0] = 1;
        c.bands[0].msb_sample_buffer[0][XLL_DECI_HISTORY_MAX..]
            .copy_from_slice(&[5, 2, -3, 1, 5, 2, -3, 1]);

        c.filter_band_data(&frame, 0);

        assert_eq!(c.output_samples(&frame, 0), &[5, 7, 4, 5, 10, 12, 9, 10]);
    }

    #[test]
    fn verify_pairwise_decorrelation_and_reorder() {
        let frame = frame(4);
        let mut c = chset(2, &frame);

        let b = &mut c.bands[0];
        b.decor_enabled = true;
        b.orig_order = {
            let mut order = [0; XLL_CHANNELS_MAX];
            order[0] = 1;
            order[1] = 0;
            order
        };
        b.decor_coeff[0] = 4;
        b.msb_sample_buffer[0][XLL_DECI_HISTORY_MAX..].copy_from_slice(&[0, 0, 0, 0]);
        b.msb_sample_buffer[1][XLL_DECI_HISTORY_MAX..].copy_from_slice(&[8, 0, 0, 0]);

        c.filter_band_data(&frame, 0);

        // Channel 1 had mul3(0, 4) = 0 added, then the pair swapped back to original order.
        assert_eq!(c.output_samples(&frame, 0), &[8, 0, 0, 0]);
        assert_eq!(c.output_samples(&frame, 1), &[0, 0, 0, 0]);
    }

    #[test]
    fn verify_adaptive_prediction_first_order() {
        let frame = frame(8);
        let mut c = chset(1, &frame);

        // A first order adaptive predictor with reflection coefficient rc reconstructs
        // x[n] = r[n] - clip23(norm16(x[n-1] * rc)).
        let rc = -i32::from(XLL_REFL_COEFF[64]);
        c.bands[0].adapt_pred_order[0] = 1;
        c.bands[0].adapt_refl_coeff[0][0] = rc;
        c.bands[0].msb_sample_buffer[0][XLL_DECI_HISTORY_MAX..]
            .copy_from_slice(&[1000, 0, 0, 0, 0, 0, 0, 0]);

        c.filter_band_data(&frame, 0);

        let out = c.output_samples(&frame, 0);
        assert_eq!(out[0], 1000);
        let mut expect = 1000i32;
        for &sample in &out[1..] {
            expect = -clip23(norm16(i64::from(expect) * i64::from(rc)));
            assert_eq!(sample, expect);
        }
    }

    #[test]
    fn verify_lsb_width_rule() {
        let mut frame = frame(4);
        let mut c = chset(1, &frame);

        // Plain adjustment only.
        c.bands[0].bit_width_adjust[0] = 3;
        assert_eq!(c.get_lsb_width(&frame, 0, 0), 3);

        // Scalable LSBs and adjustment overlap by one bit.
        c.bands[0].nscalablelsbs[0] = 4;
        assert_eq!(c.get_lsb_width(&frame, 0, 0), 6);

        // A fixed width overrides everything.
        frame.fixed_lsb_width = 9;
        assert_eq!(c.get_lsb_width(&frame, 0, 0), 9);
    }

    #[test]
    fn verify_msb_lsb_assembly() {
        let frame = frame(2);
        let mut c = chset(1, &frame);
        c.bands[0].lsb_section_size = 1;
        c.alloc_lsb_band_data(&frame);

        c.bands[0].nscalablelsbs[0] = 2;
        c.bands[0].msb_sample_buffer[0][XLL_DECI_HISTORY_MAX..].copy_from_slice(&[3, -2]);
        c.bands[0].lsb_sample_buffer[0].copy_from_slice(&[1, 3]);

        c.assemble_msbs_lsbs(&frame, 0);

        assert_eq!(c.output_samples(&frame, 0), &[3 * 4 + 1, -2 * 4 + 3]);
    }

    #[test]
    fn verify_two_band_assembly_of_silence() {
        let frame = frame(16);
        let mut c = chset(1, &frame);
        c.nfreqbands = 2;
        c.alloc_msb_band_data(&frame);

        c.assemble_freq_bands(&frame);

        assert_eq!(c.output_samples(&frame, 0).len(), 32);
        assert!(c.output_samples(&frame, 0).iter().all(|&s| s == 0));
    }

    use crate::testutil::BitWriter;

    /// Wraps sub-header body bits with the size field, alignment, and trailing CRC16.
    fn build_subheader(body: &BitWriter) -> Vec<u8> {
        let size = (10 + body.tell() + 16 + 7) / 8;

        let mut w = BitWriter::new();
        w.put_bits(size as u32 - 1, 10);
        w.put_writer(body);
        w.pad_to(size * 8 - 16);
        let crc = w.crc16_from(0);
        w.put_bits(u32::from(crc), 16);
        w.finish()
    }

    fn mono_subheader_prefix() -> BitWriter {
        let mut body = BitWriter::new();
        body.put_bits(0, 4); // one channel
        body.put_bits(1, 1); // independently coded
        body.put_bits(23, 5); // pcm bit resolution
        body.put_bits(23, 5); // storage bit resolution
        body.put_bits(12, 4); // 48 kHz
        body.put_bits(0, 2); // no sampling frequency modifier
        body.put_bits(0, 2); // no replacement set
        body
    }

    #[test]
    fn verify_reflection_index_rejected() {
        let mut body = mono_subheader_prefix();
        body.put_bits(1, 1); // primary
        body.put_bits(0, 1); // no downmix coefficients
        body.put_bits(1, 1); // hierarchical
        body.put_bits(1, 1); // channel mask enabled
        body.put_bits(0x1, 10); // centre speaker
        body.put_bits(0, 1); // no decorrelation
        body.put_bits(1, 4); // adaptive predictor order 1
        body.put_bits(255, 8); // reflection coefficient code -128

        let data = build_subheader(&body);
        let mut bs = BitReader::new(&data);
        let mut c = ChannelSet::default();
        let asset = ExssAsset { one_to_one_map_ch_to_spkr: true, ..Default::default() };

        let ret = c.parse_header(&mut bs, &frame(256), None, &asset);
        assert!(matches!(ret, Err(cantata_core::errors::Error::DecodeError(_))));
    }

    #[test]
    fn verify_channel_mask_popcount_rejected() {
        let mut body = mono_subheader_prefix();
        body.put_bits(1, 1); // primary
        body.put_bits(0, 1); // no downmix coefficients
        body.put_bits(1, 1); // hierarchical
        body.put_bits(1, 1); // channel mask enabled
        body.put_bits(0x3, 10); // two speakers for a single channel

        let data = build_subheader(&body);
        let mut bs = BitReader::new(&data);
        let mut c = ChannelSet::default();
        let asset = ExssAsset { one_to_one_map_ch_to_spkr: true, ..Default::default() };

        let ret = c.parse_header(&mut bs, &frame(256), None, &asset);
        assert!(matches!(ret, Err(cantata_core::errors::Error::DecodeError(_))));
    }

    #[test]
    fn verify_reflection_to_direct_round_trip() {
        // Converting reflection coefficients to direct form and back recovers them within the
        // rounding error of the Q16 multiplies.
        let refl = [
            i32::from(XLL_REFL_COEFF[30]),
            -i32::from(XLL_REFL_COEFF[55]),
            i32::from(XLL_REFL_COEFF[12]),
            -i32::from(XLL_REFL_COEFF[80]),
        ];
        let order = refl.len();

        // Forward conversion as performed before inverse prediction.
        let mut coeff = [0i32; XLL_ADAPT_PRED_ORDER_MAX];
        for j in 0..order {
            let rc = refl[j];
            for k in 0..(j + 1) / 2 {
                let tmp1 = coeff[k];
                let tmp2 = coeff[j - k - 1];
                coeff[k] = tmp1 + mul16(rc, tmp2);
                coeff[j - k - 1] = tmp2 + mul16(rc, tmp1);
            }
            coeff[j] = rc;
        }

        // Backward recursion in floating point.
        let mut a: Vec<f64> = coeff[..order].iter().map(|&c| f64::from(c) / 65536.0).collect();
        let mut recovered = vec![0.0; order];
        for j in (0..order).rev() {
            let rc = a[j];
            recovered[j] = rc;
            let denom = 1.0 - rc * rc;
            a = (0..j).map(|k| (a[k] - rc * a[j - k - 1]) / denom).collect();
        }

        for (r, &q) in recovered.iter().zip(&refl) {
            assert!((r - f64::from(q) / 65536.0).abs() < 1e-3);
        }
    }

    #[test]
    fn verify_dmix_coefficient_signs() {
        // Bit 8 of a downmix code selects the positive sign; a cleared bit negates the table
        // value.
        let mut body = mono_subheader_prefix();
        body.put_bits(1, 1); // primary
        body.put_bits(1, 1); // downmix coefficients present
        body.put_bits(0, 1); // downmix not embedded
        body.put_bits(1, 3); // LoRo downmix
        body.put_bits(1, 1); // hierarchical
        body.put_bits(0x100 | 241, 9); // left row: +unity
        body.put_bits(241, 9); // right row: -unity
        body.put_bits(1, 1); // channel mask enabled
        body.put_bits(0x1, 10); // centre speaker
        body.put_bits(0, 1); // no decorrelation
        body.put_bits(0, 4); // no adaptive prediction
        body.put_bits(0, 2); // no fixed prediction

        let data = build_subheader(&body);
        let mut bs = BitReader::new(&data);
        let mut c = ChannelSet::default();
        let asset = ExssAsset { one_to_one_map_ch_to_spkr: true, ..Default::default() };

        c.parse_header(&mut bs, &frame(256), None, &asset).unwrap();

        assert!(c.dmix_coeffs_present);
        assert_eq!(c.dmix_type, DownMixType::LoRo);
        assert_eq!(c.dmix_coeff, [1 << 15, -(1 << 15)]);
    }
}
