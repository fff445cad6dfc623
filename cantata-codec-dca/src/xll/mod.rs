// Cantata
// Copyright (c) 2025 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The lossless (XLL) sub-system.
//!
//! A lossless frame carries a common header, one sub-header per channel set, a CRC protected
//! navigation table of segment byte sizes, and the entropy coded band data traversed in
//! `(band, segment, channel set)` order. Filtering inverts prediction and decorrelation per band,
//! recombines residually encoded channels with the lossy core, undoes hierarchical downmixes, and
//! reassembles split frequency bands.

mod chset;
mod entropy;

use log::warn;

use cantata_core::checksum::Crc16Ccitt;
use cantata_core::errors::{
    decode_error, limit_error, sync_required_error, unsupported_error, Error, Result,
};
use cantata_core::io::BitReader;

pub(crate) use chset::ChannelSet;

use crate::core::CoreDecoder;
use crate::exss::ExssAsset;
use crate::math::{clip23, mul15, mul16, vmul15, vmul15_sub};
use crate::speaker::{
    Speaker, SpeakerMask, SPEAKER_COUNT, SPEAKER_MASK_LS, SPEAKER_MASK_LSS, SPEAKER_MASK_RS,
    SPEAKER_MASK_RSS,
};
use crate::{ChannelRequest, SYNCWORD_XLL};

/// Maximum number of channel sets per frame.
pub(crate) const XLL_CHSETS_MAX: usize = 16;
/// Maximum number of channels per channel set.
pub(crate) const XLL_CHANNELS_MAX: usize = 16;
/// Maximum adaptive predictor order.
pub(crate) const XLL_ADAPT_PRED_ORDER_MAX: usize = 16;
/// Number of decimator history samples seeding two-band reassembly.
pub(crate) const XLL_DECI_HISTORY_MAX: usize = 8;
/// Size of the peak bit rate smoothing buffer in bytes.
pub(crate) const XLL_PBR_BUFFER_MAX: usize = 0x10_4000;

/// Parameters of the lossless frame common header shared by all channel sets.
#[derive(Copy, Clone, Default)]
pub(crate) struct FrameParams {
    /// Size of the lossless frame in bytes.
    pub frame_size: usize,
    /// Number of channel sets.
    pub nchsets: usize,
    /// Number of segments per frame.
    pub nframesegs: usize,
    /// log2 of the number of samples in a segment of one frequency band.
    pub nsegsamples_log2: u32,
    /// Number of samples in a segment of one frequency band.
    pub nsegsamples: usize,
    /// Number of samples in a frame of one frequency band.
    pub nframesamples: usize,
    /// Number of bits used to read segment sizes.
    pub seg_size_nbits: u32,
    /// Which band sections carry a trailing CRC16.
    pub band_crc_present: u32,
    /// Frames carry scalable MSB/LSB splits.
    pub scalable_lsbs: bool,
    /// Number of bits used to read channel set speaker masks.
    pub ch_mask_nbits: u32,
    /// Fixed LSB width overriding the per-channel widths, 0 if unused.
    pub fixed_lsb_width: u32,
}

/// Verifies the XLL CRC16 over the bit range `[p1, p2)`.
///
/// Both endpoints must be byte aligned and the range must span at least the 16 CRC bits that
/// trail it. The checksum is good iff the register is zero after processing every byte in the
/// range.
pub(crate) fn verify_checksum(bs: &BitReader<'_>, p1: usize, p2: usize) -> Result<()> {
    if (p1 | p2) & 7 != 0 || p2 > bs.buf().len() * 8 || p1 + 16 > p2 {
        return decode_error("dca: invalid checksum range");
    }

    let mut crc = Crc16Ccitt::new();
    crc.process_buf_bytes(&bs.buf()[p1 / 8..p2 / 8]);

    if crc.crc() != 0 {
        decode_error("dca: checksum mismatch")
    }
    else {
        Ok(())
    }
}

/// Decoder state of the lossless sub-system, persisting across frames.
#[derive(Default)]
pub(crate) struct XllDecoder {
    /// Common header of the current frame.
    pub frame: FrameParams,
    /// Channel sets of the current frame.
    pub chset: Vec<ChannelSet>,
    /// Navigation table, indexed as `navi[band][seg][chset]` flattened.
    navi: Vec<usize>,

    /// Highest number of frequency bands over all channel sets.
    pub nfreqbands: usize,
    /// Total number of channels coded by hierarchical channel sets.
    pub nchannels: usize,
    /// Number of channel sets to decode for the requested layout.
    pub nactivechsets: usize,

    /// Speakers covered by the filtered output.
    pub output_mask: SpeakerMask,
    /// Producing (channel set, channel) of each output speaker.
    output_source: [Option<(usize, usize)>; SPEAKER_COUNT],

    /// Peak bit rate smoothing buffer.
    pbr_buffer: Vec<u8>,
    /// Number of frames to delay decoding after synchronizing mid smoothing period.
    pbr_delay: u32,
    /// Stream id the smoothing buffer belongs to.
    hd_stream_id: Option<u32>,
}

impl XllDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// True when a peak bit rate smoothing period is active.
    pub fn pbr_active(&self) -> bool {
        !self.pbr_buffer.is_empty()
    }

    /// Parse the lossless component of an extension sub-stream asset.
    ///
    /// Returns `Error::SyncRequired` when no frame can be decoded yet because a smoothing period
    /// is in progress.
    pub fn parse(
        &mut self,
        data: &[u8],
        asset: &ExssAsset,
        request: ChannelRequest,
        strict: bool,
    ) -> Result<()> {
        if self.hd_stream_id != Some(asset.hd_stream_id) {
            self.clear_pbr();
            self.hd_stream_id = Some(asset.hd_stream_id);
        }

        let end = asset.xll_offset + asset.xll_size;
        if end > data.len() {
            return decode_error("dca: lossless component out of range");
        }
        let input = &data[asset.xll_offset..end];

        if self.pbr_active() {
            self.parse_frame_pbr(input, asset, request, strict)
        }
        else {
            self.parse_frame_no_pbr(input, asset, request, strict)
        }
    }

    /// Forget any smoothing state, e.g. after a seek.
    pub fn flush(&mut self) {
        self.clear_pbr();
    }

    fn clear_pbr(&mut self) {
        self.pbr_buffer.clear();
        self.pbr_delay = 0;
    }

    fn copy_to_pbr(&mut self, data: &[u8], delay: u32) -> Result<()> {
        if data.len() > XLL_PBR_BUFFER_MAX {
            return limit_error("dca: pbr buffer overflow");
        }

        self.pbr_buffer.clear();
        self.pbr_buffer.extend_from_slice(data);
        self.pbr_delay = delay;
        Ok(())
    }

    fn parse_frame_no_pbr(
        &mut self,
        input: &[u8],
        asset: &ExssAsset,
        request: ChannelRequest,
        strict: bool,
    ) -> Result<()> {
        let mut data = input;
        let mut ret = self.parse_frame(data, asset, request, strict);

        // If the packet data did not start with a sync word, we must have jumped right into the
        // middle of a smoothing period.
        if matches!(ret, Err(Error::SyncRequired))
            && asset.xll_sync_present
            && asset.xll_sync_offset < data.len()
        {
            // Skip to the sync word within this packet.
            data = &data[asset.xll_sync_offset..];

            // If a decoding delay is set, buffer the frame and report the synchronization gap.
            // The caller is expected to fall back to the lossy core or mute its output until the
            // delay expires.
            if asset.xll_delay_nframes > 0 {
                self.copy_to_pbr(data, asset.xll_delay_nframes)?;
                return sync_required_error();
            }

            // No decoding delay, parse the frame in place.
            ret = self.parse_frame(data, asset, request, strict);
        }

        ret?;

        if self.frame.frame_size > data.len() {
            return decode_error("dca: lossless frame overruns its packet");
        }

        // If the frame did not consume the entire component, a smoothing period begins.
        if self.frame.frame_size < data.len() {
            self.copy_to_pbr(&data[self.frame.frame_size..], 0)?;
        }

        Ok(())
    }

    fn parse_frame_pbr(
        &mut self,
        input: &[u8],
        asset: &ExssAsset,
        request: ChannelRequest,
        strict: bool,
    ) -> Result<()> {
        if input.len() > XLL_PBR_BUFFER_MAX - self.pbr_buffer.len() {
            self.clear_pbr();
            return limit_error("dca: pbr buffer overflow");
        }

        self.pbr_buffer.extend_from_slice(input);

        // Respect the decoding delay after a synchronization error.
        if self.pbr_delay > 0 {
            self.pbr_delay -= 1;
            if self.pbr_delay != 0 {
                return sync_required_error();
            }
        }

        let pbr = std::mem::take(&mut self.pbr_buffer);
        let ret = self.parse_frame(&pbr, asset, request, strict);
        self.pbr_buffer = pbr;

        if let Err(err) = ret {
            // Throw out all smoothing state on failure rather than attempting a resync.
            self.clear_pbr();
            return Err(err);
        }

        if self.frame.frame_size > self.pbr_buffer.len() {
            self.clear_pbr();
            return decode_error("dca: lossless frame overruns the smoothing buffer");
        }

        if self.frame.frame_size == self.pbr_buffer.len() {
            // End of the smoothing period.
            self.clear_pbr();
        }
        else {
            self.pbr_buffer.drain(..self.frame.frame_size);
        }

        Ok(())
    }

    fn parse_frame(
        &mut self,
        data: &[u8],
        asset: &ExssAsset,
        request: ChannelRequest,
        strict: bool,
    ) -> Result<()> {
        let mut bs = BitReader::new(data);

        self.parse_common_header(&mut bs)?;
        self.parse_sub_headers(&mut bs, asset, request)?;
        self.parse_navi_table(&mut bs)?;
        self.parse_band_data(&mut bs, strict)?;

        if bs.seek_to(self.frame.frame_size * 8).is_err() {
            return decode_error("dca: read past end of frame");
        }
        Ok(())
    }

    fn parse_common_header(&mut self, bs: &mut BitReader<'_>) -> Result<()> {
        // Lossless extension sync word.
        if bs.read_bits(32)? != SYNCWORD_XLL {
            return sync_required_error();
        }

        // Stream version.
        let stream_ver = bs.read_bits(4)? + 1;
        if stream_ver > 1 {
            return unsupported_error("dca: unsupported lossless stream version");
        }

        // Lossless frame header length.
        let header_size = bs.read_bits(8)? as usize + 1;

        // The header checksum spans everything after the sync word, trailing CRC included.
        if verify_checksum(bs, 32, header_size * 8).is_err() {
            return decode_error("dca: invalid common header checksum");
        }

        // Number of bits used to read the frame size.
        let frame_size_nbits = bs.read_bits(5)? + 1;

        // Number of bytes in the lossless frame.
        let frame_size = bs.read_bits(frame_size_nbits)? as usize;
        if frame_size >= XLL_PBR_BUFFER_MAX {
            return decode_error("dca: invalid frame size");
        }
        self.frame.frame_size = frame_size + 1;

        // Number of channel sets per frame.
        self.frame.nchsets = bs.read_bits(4)? as usize + 1;
        if self.frame.nchsets > XLL_CHSETS_MAX {
            return unsupported_error("dca: too many channel sets");
        }

        // Number of segments per frame.
        let nframesegs_log2 = bs.read_bits(4)?;
        self.frame.nframesegs = 1 << nframesegs_log2;
        if self.frame.nframesegs > 1024 {
            return decode_error("dca: too many segments per frame");
        }

        // Samples in a segment per one frequency band for the first channel set. The maximum is
        // 256 for sampling frequencies up to 48 kHz and 512 above.
        self.frame.nsegsamples_log2 = bs.read_bits(4)?;
        if self.frame.nsegsamples_log2 == 0 {
            return decode_error("dca: too few samples per segment");
        }
        self.frame.nsegsamples = 1 << self.frame.nsegsamples_log2;
        if self.frame.nsegsamples > 512 {
            return decode_error("dca: too many samples per segment");
        }

        // Samples in a frame per one frequency band for the first channel set.
        let nframesamples_log2 = self.frame.nsegsamples_log2 + nframesegs_log2;
        if nframesamples_log2 > 16 {
            return decode_error("dca: too many samples per frame");
        }
        self.frame.nframesamples = 1 << nframesamples_log2;

        // Number of bits used to read segment sizes.
        self.frame.seg_size_nbits = bs.read_bits(5)? + 1;

        // Presence of CRC16 within each frequency band:
        // 0 - no CRC16 within bands
        // 1 - CRC16 after the MSB section of band 0
        // 2 - CRC16 after the MSB and LSB sections of band 0
        // 3 - CRC16 after the MSB and LSB sections of all bands
        self.frame.band_crc_present = bs.read_bits(2)?;

        // MSB/LSB split flag.
        self.frame.scalable_lsbs = bs.read_bit()?;

        // Number of bits used to read channel masks.
        self.frame.ch_mask_nbits = bs.read_bits(5)? + 1;

        // Fixed LSB width.
        self.frame.fixed_lsb_width =
            if self.frame.scalable_lsbs { bs.read_bits(4)? } else { 0 };

        // Reserved bits, byte alignment, and the header CRC16.
        if bs.seek_to(header_size * 8).is_err() {
            return decode_error("dca: read past end of common header");
        }

        Ok(())
    }

    fn parse_sub_headers(
        &mut self,
        bs: &mut BitReader<'_>,
        asset: &ExssAsset,
        request: ChannelRequest,
    ) -> Result<()> {
        self.chset.resize_with(self.frame.nchsets, Default::default);

        self.nfreqbands = 0;
        self.nchannels = 0;

        for i in 0..self.frame.nchsets {
            let (head, tail) = self.chset.split_at_mut(i);
            let c = &mut tail[0];

            c.hier_ofs = self.nchannels;
            c.parse_header(bs, &self.frame, head.first(), asset)?;

            self.nfreqbands = self.nfreqbands.max(c.nfreqbands);
            if c.hier_chset {
                self.nchannels += c.nchannels;
            }
        }

        // Pre-scale the downmix coefficients of all non-primary channel sets, walking the
        // hierarchy chain from the tail to the head.
        for i in (1..self.frame.nchsets).rev() {
            if self.chset[i].is_hier_dmix_chset() {
                if let Some(o) = self.find_next_hier_dmix_chset(i) {
                    let (head, tail) = self.chset.split_at_mut(o);
                    prescale_down_mix(&mut head[i], &tail[0]);
                }
            }
        }

        // Number of active channel sets needed for the requested layout.
        self.nactivechsets = match request {
            ChannelRequest::Stereo => 1,
            ChannelRequest::Layout5p0 | ChannelRequest::Layout5p1 => {
                if self.chset[0].nchannels < 5 && self.frame.nchsets > 1 {
                    2
                }
                else {
                    1
                }
            }
            _ => self.frame.nchsets,
        };

        Ok(())
    }

    /// The index of the next downstream channel set `idx`'s channels are downmixed into.
    fn find_next_hier_dmix_chset(&self, idx: usize) -> Option<usize> {
        if !self.chset[idx].hier_chset {
            return None;
        }

        (idx + 1..self.frame.nchsets).find(|&i| self.chset[i].is_hier_dmix_chset())
    }

    fn parse_navi_table(&mut self, bs: &mut BitReader<'_>) -> Result<()> {
        let navi_nb = self.nfreqbands * self.frame.nframesegs * self.frame.nchsets;
        if navi_nb > 1024 {
            return decode_error("dca: too many navigation table entries");
        }

        self.navi.clear();
        self.navi.reserve(navi_nb);

        let navi_pos = bs.tell();
        for band in 0..self.nfreqbands {
            for _seg in 0..self.frame.nframesegs {
                for chs in 0..self.frame.nchsets {
                    let mut size = 0;
                    if self.chset[chs].nfreqbands > band {
                        size = bs.read_bits(self.frame.seg_size_nbits)? as usize;
                        if size >= self.frame.frame_size {
                            return decode_error("dca: invalid navigation segment size");
                        }
                        size += 1;
                    }
                    self.navi.push(size);
                }
            }
        }

        // Byte alignment and CRC16.
        bs.realign();
        bs.ignore_bits(16)?;

        if verify_checksum(bs, navi_pos, bs.tell()).is_err() {
            return decode_error("dca: invalid navigation table checksum");
        }

        Ok(())
    }

    fn parse_band_data(&mut self, bs: &mut BitReader<'_>, strict: bool) -> Result<()> {
        let frame = self.frame;

        for i in 0..self.nactivechsets {
            self.chset[i].alloc_msb_band_data(&frame);
            self.chset[i].alloc_lsb_band_data(&frame);
        }

        let mut navi_pos = bs.tell();
        let mut navi_it = 0;

        for band in 0..self.nfreqbands {
            for seg in 0..frame.nframesegs {
                for chs in 0..frame.nchsets {
                    let size = self.navi[navi_it];
                    navi_it += 1;

                    if self.chset[chs].nfreqbands <= band {
                        continue;
                    }

                    navi_pos += size * 8;
                    if navi_pos > bs.buf().len() * 8 {
                        return decode_error("dca: invalid navigation position");
                    }

                    if chs < self.nactivechsets {
                        if let Err(err) =
                            self.chset[chs].parse_band_data(bs, &frame, band, seg, navi_pos)
                        {
                            if strict {
                                return Err(err);
                            }
                            warn!("dca: concealing segment decode error: {}", err);
                            self.chset[chs].clear_band_data(&frame, band, Some(seg));
                        }
                    }

                    // parse_band_data seeks to the end of the slice itself; failed or skipped
                    // slices are skipped here.
                    bs.seek_to(navi_pos)?;
                }
            }
        }

        Ok(())
    }

    /// Substitutes core output for every core-mapped channel of a set during recovery.
    fn force_lossy_output(&mut self, core: &dyn CoreDecoder, c_idx: usize) {
        let frame = self.frame;
        let c = &mut self.chset[c_idx];

        // Clear all band data.
        for band in 0..c.nfreqbands {
            c.clear_band_data(&frame, band, None);
        }

        // Replace non-residual encoded channels with their lossy counterparts.
        for ch in 0..c.nchannels {
            if c.residual_encode & (1 << ch) == 0 {
                continue;
            }
            let spkr = match Speaker::from_index(c.ch_remap[ch]) {
                Some(spkr) => spkr,
                None => continue,
            };
            if core.map_speaker(spkr).is_none() {
                continue;
            }
            c.residual_encode &= !(1 << ch);
        }
    }

    /// Adds the reduced-width core output onto the lossless residual of every residually encoded
    /// channel of a set.
    fn combine_residual_frame(&mut self, core: &dyn CoreDecoder, c_idx: usize) -> Result<()> {
        let frame = self.frame;
        let nsamples = frame.nframesamples;

        debug_assert_eq!(self.chset[c_idx].freq, core.output_rate());
        debug_assert_eq!(nsamples, core.npcmsamples());

        // If this channel set is also hierarchically downmixed, the core carries the downmix
        // pre-scaling which must be undone before combining, as the residual is not scaled.
        let o_idx = self.find_next_hier_dmix_chset(c_idx);

        let (head, tail) = self.chset.split_at_mut(c_idx + 1);
        let c = &mut head[c_idx];
        let o = o_idx.map(|i| &tail[i - c_idx - 1]);

        for ch in 0..c.nchannels {
            if c.residual_encode & (1 << ch) != 0 {
                continue;
            }

            let spkr = match Speaker::from_index(c.ch_remap[ch]) {
                Some(spkr) => spkr,
                None => return decode_error("dca: invalid speaker position"),
            };
            let core_ch = match core.map_speaker(spkr) {
                Some(core_ch) => core_ch,
                None => return decode_error("dca: residual channel without core counterpart"),
            };

            // Account for the LSB width when reducing the core bit width.
            let shift = (24 - c.pcm_bit_res + c.get_lsb_width(&frame, 0, ch)).min(31);
            let round = if shift > 0 { 1i32 << (shift - 1) } else { 0 };

            let src = core.output_samples(core_ch);
            let dst = &mut c.bands[0].msb_sample_buffer[ch]
                [XLL_DECI_HISTORY_MAX..XLL_DECI_HISTORY_MAX + nsamples];

            if let Some(o) = o {
                // Undo the embedded core downmix pre-scaling.
                let scale_inv = o.dmix_scale_inv[c.hier_ofs + ch];
                for (d, &s) in dst.iter_mut().zip(src) {
                    *d = d.wrapping_add(clip23(mul16(s, scale_inv).wrapping_add(round) >> shift));
                }
            }
            else {
                // No downmix scaling.
                for (d, &s) in dst.iter_mut().zip(src) {
                    *d = d.wrapping_add(s.wrapping_add(round) >> shift);
                }
            }
        }

        Ok(())
    }

    /// Undoes the hierarchical downmix embedded within the active channel sets, using the inverse
    /// matrix of the downstream set `o_idx`.
    fn undo_down_mix(&mut self, o_idx: usize, band: usize) {
        let nsamples = self.frame.nframesamples;
        let nactive = self.nactivechsets;

        let (recipients, rest) = self.chset.split_at_mut(o_idx);
        let o = &rest[0];

        let mut coeff_i = 0;
        let mut nchannels = 0;

        for c in recipients.iter_mut().take(nactive) {
            if !c.hier_chset {
                continue;
            }

            for j in 0..c.nchannels {
                for k in 0..o.nchannels {
                    let coeff = o.dmix_coeff[coeff_i];
                    coeff_i += 1;
                    if coeff == 0 {
                        continue;
                    }

                    let dst = &mut c.bands[band].msb_sample_buffer[j]
                        [XLL_DECI_HISTORY_MAX..XLL_DECI_HISTORY_MAX + nsamples];
                    let src = &o.bands[band].msb_sample_buffer[k]
                        [XLL_DECI_HISTORY_MAX..XLL_DECI_HISTORY_MAX + nsamples];
                    vmul15_sub(dst, src, coeff);

                    if band != 0 {
                        vmul15_sub(&mut c.deci_history[j], &o.deci_history[k], coeff);
                    }
                }
            }

            nchannels += c.nchannels;
            if nchannels >= o.hier_ofs {
                break;
            }
        }
    }

    /// Restores the amplitude of the active channel sets when the downstream set embedding the
    /// downmix is not being decoded.
    fn scale_down_mix(&mut self, o_idx: usize, band: usize) {
        let nsamples = self.frame.nframesamples;
        let nactive = self.nactivechsets;

        let (recipients, rest) = self.chset.split_at_mut(o_idx);
        let o = &rest[0];

        let mut nchannels = 0;

        for c in recipients.iter_mut().take(nactive) {
            if !c.hier_chset {
                continue;
            }

            for j in 0..c.nchannels {
                let scale = o.dmix_scale[nchannels];
                nchannels += 1;
                if scale == 1 << 15 {
                    continue;
                }

                vmul15(
                    &mut c.bands[band].msb_sample_buffer[j]
                        [XLL_DECI_HISTORY_MAX..XLL_DECI_HISTORY_MAX + nsamples],
                    scale,
                );
                if band != 0 {
                    vmul15(&mut c.deci_history[j], scale);
                }
            }

            if nchannels >= o.hier_ofs {
                break;
            }
        }
    }

    /// Runs the complete filter chain over the parsed frame.
    pub fn filter(
        &mut self,
        core: &dyn CoreDecoder,
        recovery: bool,
        request: ChannelRequest,
    ) -> Result<()> {
        // Force lossy downmixed output during recovery.
        if recovery {
            for i in 0..self.frame.nchsets {
                if i < self.nactivechsets {
                    self.force_lossy_output(core, i);
                }
                if !self.chset[i].primary_chset {
                    self.chset[i].dmix_embedded = false;
                }
            }

            self.frame.scalable_lsbs = false;
            self.frame.fixed_lsb_width = 0;
        }

        let frame = self.frame;

        // Filter frequency bands of the active channel sets.
        self.output_mask = 0;
        for i in 0..self.nactivechsets {
            self.chset[i].filter_band_data(&frame, 0);

            if self.chset[i].residual_encode != (1 << self.chset[i].nchannels) - 1 {
                self.combine_residual_frame(core, i)?;
            }

            if frame.scalable_lsbs {
                self.chset[i].assemble_msbs_lsbs(&frame, 0);
            }

            if self.chset[i].nfreqbands > 1 {
                self.chset[i].filter_band_data(&frame, 1);
                self.chset[i].assemble_msbs_lsbs(&frame, 1);
            }

            self.output_mask |= self.chset[i].ch_mask;
        }

        // Undo the hierarchical downmix and/or apply scaling.
        for i in 1..self.frame.nchsets {
            if !self.chset[i].is_hier_dmix_chset() {
                continue;
            }

            if i >= self.nactivechsets {
                for band in 0..self.chset[i].nfreqbands {
                    if self.chset[i].bands[band].dmix_embedded {
                        self.scale_down_mix(i, band);
                    }
                }
                break;
            }

            for band in 0..self.chset[i].nfreqbands {
                if self.chset[i].bands[band].dmix_embedded {
                    self.undo_down_mix(i, band);
                }
            }
        }

        // Assemble the frequency bands of the active channel sets.
        if self.nfreqbands > 1 {
            for i in 0..self.nactivechsets {
                self.chset[i].assemble_freq_bands(&frame);
            }
        }

        // Map each output speaker to its producing channel.
        self.output_source = [None; SPEAKER_COUNT];
        for i in 0..self.nactivechsets {
            for ch in 0..self.chset[i].nchannels {
                self.output_source[self.chset[i].ch_remap[ch]] = Some((i, ch));
            }
        }

        // Normalize side surrounds to the regular 5.1 positions when downmixing.
        if matches!(
            request,
            ChannelRequest::Stereo | ChannelRequest::Layout5p0 | ChannelRequest::Layout5p1
        ) {
            if self.output_mask & SPEAKER_MASK_LSS != 0 {
                self.output_source[Speaker::Ls as usize] =
                    self.output_source[Speaker::Lss as usize];
                self.output_mask = (self.output_mask & !SPEAKER_MASK_LSS) | SPEAKER_MASK_LS;
            }
            if self.output_mask & SPEAKER_MASK_RSS != 0 {
                self.output_source[Speaker::Rs as usize] =
                    self.output_source[Speaker::Rss as usize];
                self.output_mask = (self.output_mask & !SPEAKER_MASK_RSS) | SPEAKER_MASK_RS;
            }
        }

        Ok(())
    }

    /// Gets the filtered output samples of one speaker.
    pub fn output_samples(&self, spkr: usize) -> Option<&[i32]> {
        let (chs, ch) = self.output_source[spkr]?;
        Some(self.chset[chs].output_samples(&self.frame, ch))
    }

    /// Number of output samples per channel for the current frame.
    pub fn noutsamples(&self) -> usize {
        self.frame.nframesamples << (self.nfreqbands - 1)
    }

    /// Output sampling frequency for the current frame.
    pub fn output_rate(&self) -> u32 {
        self.chset[0].freq << (self.nfreqbands - 1)
    }
}

/// Folds the downmix scales of the downstream set `o` into the scales and inverse coefficients
/// of the upstream set `c`.
fn prescale_down_mix(c: &mut ChannelSet, o: &ChannelSet) {
    let n = c.nchannels;

    for i in 0..c.hier_ofs {
        let scale = o.dmix_scale[i];
        let scale_inv = o.dmix_scale_inv[i];
        c.dmix_scale[i] = mul15(c.dmix_scale[i], scale);
        c.dmix_scale_inv[i] = mul16(c.dmix_scale_inv[i], scale_inv);

        for j in 0..n {
            let coeff = mul16(c.dmix_coeff[i * n + j], scale_inv);
            c.dmix_coeff[i * n + j] = mul15(coeff, o.dmix_scale[c.hier_ofs + j]);
        }
    }
}
