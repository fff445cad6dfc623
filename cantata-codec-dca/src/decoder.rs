// Cantata
// Copyright (c) 2025 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The top level DCA decoder: packet framing, sub-stream orchestration, cross-consistency
//! validation, recovery handling, and output frame assembly.

use log::warn;

use cantata_core::audio::{
    AsAudioBufferRef, AudioBuffer, AudioBufferRef, Signal, SignalSpec,
};
use cantata_core::codecs::{
    CodecDescriptor, CodecParameters, Decoder, DecoderOptions, FinalizeResult, CODEC_TYPE_DCA,
};
use cantata_core::errors::{decode_error, unsupported_error, Error, Result};
use cantata_core::formats::Packet;
use cantata_core::sample::SampleFormat;
use cantata_core::support_codec;

use crate::core::{CoreDecoder, NoopCore, PCMBLOCK_SAMPLES};
use crate::exss::{ExssAsset, ExssParser};
use crate::math::{mul15, vmul15_add};
use crate::speaker::{
    resolve_output_layout, DownMixType, Speaker, SpeakerMask, EXSS_XLL, REPR_TYPE_LHRH,
    REPR_TYPE_LTRT, SPEAKER_COUNT, SPEAKER_LAYOUT_STEREO, SPEAKER_MASK_C,
};
use crate::xll::XllDecoder;
use crate::{
    ChannelRequest, DcaOptions, MAX_PACKET_SIZE, MIN_PACKET_SIZE, PACKET_CORE, PACKET_EXSS,
    PACKET_RECOVERY, PACKET_XLL, SYNCWORD_CORE_14B_BE, SYNCWORD_CORE_14B_LE, SYNCWORD_CORE_BE,
    SYNCWORD_CORE_LE, SYNCWORD_SUBSTREAM,
};

/// Matrix encoding applied to a stereo pair emitted by the decoder.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MatrixEncoding {
    #[default]
    None,
    /// Dolby Surround compatible (LtRt).
    Dolby,
    /// Dolby Headphone compatible (LhRh).
    DolbyHeadphone,
}

/// DTS Coherent Acoustics decoder, including the lossless DTS-HD MA extension.
pub struct DcaDecoder {
    params: CodecParameters,
    opts: DcaOptions,

    core: Box<dyn CoreDecoder>,
    exss: ExssParser,
    xll: XllDecoder,

    /// Packet data converted to 16-bit big-endian packing.
    buffer: Vec<u8>,
    /// Sub-streams found in the current packet.
    packet: u8,
    /// The core output can be trusted for residual reconstruction.
    core_residual_valid: bool,
    /// The current frame has residually encoded channel sets.
    has_residual_encoded: bool,
    /// The asset carrying the decoded extension components.
    asset: Option<ExssAsset>,

    buf_i16: AudioBuffer<i16>,
    buf_i32: AudioBuffer<i32>,
    last_format: SampleFormat,
    matrix_encoding: MatrixEncoding,

    /// Scratch planes for a requested stereo downmix.
    dmix_scratch: [Vec<i32>; 2],
}

impl DcaDecoder {
    /// Instantiate a decoder with DCA specific options and a lossy core collaborator.
    pub fn try_new_with_core(
        params: &CodecParameters,
        _options: &DecoderOptions,
        opts: DcaOptions,
        core: Box<dyn CoreDecoder>,
    ) -> Result<Self> {
        if params.codec != CODEC_TYPE_DCA {
            return unsupported_error("dca: invalid codec type");
        }

        Ok(DcaDecoder {
            params: params.clone(),
            opts,
            core,
            exss: ExssParser::new(),
            xll: XllDecoder::new(),
            buffer: Vec::new(),
            packet: 0,
            core_residual_valid: false,
            has_residual_encoded: false,
            asset: None,
            buf_i16: AudioBuffer::unused(),
            buf_i32: AudioBuffer::unused(),
            last_format: SampleFormat::S32,
            matrix_encoding: MatrixEncoding::None,
            dmix_scratch: [Vec::new(), Vec::new()],
        })
    }

    /// The matrix encoding of the last decoded frame.
    pub fn matrix_encoding(&self) -> MatrixEncoding {
        self.matrix_encoding
    }

    /// True when the last packet was decoded in lossless recovery mode.
    pub fn is_recovery(&self) -> bool {
        self.packet & PACKET_RECOVERY != 0
    }

    fn decode_inner(&mut self, packet: &Packet) -> Result<()> {
        let input = packet.buf();

        if input.len() < MIN_PACKET_SIZE || input.len() > MAX_PACKET_SIZE {
            return decode_error("dca: invalid packet size");
        }

        // Strip any lead-in bytes and convert the packet to 16-bit big-endian packing.
        let size = self.convert_bitstream(input)?;

        let prev_packet = self.packet;
        self.packet = 0;
        self.asset = None;

        let mut offset = 0;

        // Parse the backward compatible core sub-stream.
        if read_sync(&self.buffer[..size]) == Some(SYNCWORD_CORE_BE) {
            if let Err(err) = self.core.parse(&self.buffer[..size]) {
                self.core_residual_valid = false;
                return Err(err);
            }

            self.packet |= PACKET_CORE;

            // Extension sub-stream data is aligned on a 4-byte boundary.
            let frame_size = (self.core.frame_size() + 3) & !3;
            if size - 4 > frame_size {
                offset = frame_size;
            }
        }

        if !self.opts.core_only {
            // Parse the extension sub-stream header.
            if read_sync(&self.buffer[offset..size]) == Some(SYNCWORD_SUBSTREAM) {
                let buf = &self.buffer[offset..size];
                match self.exss.parse(buf) {
                    Ok(()) => {
                        self.packet |= PACKET_EXSS;
                        self.asset = self.exss.assets().first().copied();
                    }
                    Err(err) => {
                        if self.opts.strict {
                            return Err(err);
                        }
                        warn!("dca: ignoring broken substream header: {}", err);
                    }
                }
            }

            // Parse the lossless component within the extension sub-stream.
            if let Some(asset) = self.asset {
                if asset.extension_mask & EXSS_XLL != 0 {
                    let buf = &self.buffer[offset..size];
                    let request = self.opts.request_channel_layout;
                    match self.xll.parse(buf, &asset, request, self.opts.strict) {
                        Ok(()) => {
                            self.packet |= PACKET_XLL;
                        }
                        Err(Error::SyncRequired) => {
                            // Conceal the synchronization error when the previous packet carried a
                            // lossless frame and this packet still carries a core frame.
                            if prev_packet & PACKET_XLL != 0 && self.packet & PACKET_CORE != 0 {
                                self.packet |= PACKET_XLL | PACKET_RECOVERY;
                            }
                            else if self.opts.strict {
                                return Err(Error::SyncRequired);
                            }
                        }
                        Err(err) => {
                            if self.opts.strict {
                                return Err(err);
                            }
                            warn!("dca: ignoring broken lossless frame: {}", err);
                        }
                    }
                }

                // Parse core extension components located through the asset.
                if self.packet & PACKET_CORE != 0 {
                    let buf = &self.buffer[offset..size];
                    self.core.parse_exss(buf, &asset)?;
                }
            }
        }

        // Filter.
        if self.packet & PACKET_XLL != 0 {
            if let Err(err) = self.validate_hd_ma_frame() {
                if self.opts.strict {
                    return Err(err);
                }
                if self.packet & PACKET_CORE == 0 {
                    return Err(err);
                }
                warn!("dca: falling back to core output: {}", err);
                self.filter_core_frame()
            }
            else {
                self.filter_hd_ma_frame()
            }
        }
        else if self.packet & PACKET_CORE != 0 {
            self.filter_core_frame()
        }
        else {
            decode_error("dca: packet contains no decodable frame")
        }
    }

    /// Searches for the earliest recognizable sync word and converts the packet into 16-bit
    /// big-endian packing, returning the converted size.
    fn convert_bitstream(&mut self, input: &[u8]) -> Result<usize> {
        for i in 0..=input.len() - MIN_PACKET_SIZE {
            if let Some(size) = convert_at(&input[i..], &mut self.buffer) {
                return Ok(size);
            }
        }

        decode_error("dca: no sync word found")
    }

    /// Verifies that the core frame is compatible with residually encoded channel sets.
    fn validate_hd_ma_frame(&mut self) -> Result<()> {
        self.has_residual_encoded = false;

        let mut ch_mask: SpeakerMask = 0;
        for i in 0..self.xll.nactivechsets {
            let c = &self.xll.chset[i];

            if ch_mask & c.ch_mask != 0 {
                return decode_error("dca: channel masks overlap between channel sets");
            }

            if c.residual_encode != (1 << c.nchannels) - 1 {
                if self.packet & PACKET_CORE == 0 {
                    return decode_error("dca: residual encoded channels without core");
                }

                for ch in 0..c.nchannels {
                    let spkr = match Speaker::from_index(c.ch_remap[ch]) {
                        Some(spkr) => spkr,
                        None => return decode_error("dca: invalid speaker position"),
                    };
                    if self.core.map_speaker(spkr).is_none() {
                        return decode_error(
                            "dca: residual channel references unavailable core channel",
                        );
                    }
                }

                self.has_residual_encoded = true;
            }

            ch_mask |= c.ch_mask;
        }

        if self.has_residual_encoded {
            let p_freq = self.xll.chset[0].freq;
            let mut rate = self.core.sample_rate();
            let mut nsamples = self.core.npcmblocks() * PCMBLOCK_SAMPLES;

            // The core is synthesized up to the lossless rate when one octave apart.
            if p_freq == 96_000 && rate == 48_000 {
                rate *= 2;
                nsamples *= 2;
            }

            if p_freq != rate {
                return decode_error("dca: sample rate mismatch between core and lossless");
            }
            if self.xll.frame.nframesamples != nsamples {
                return decode_error("dca: samples per frame mismatch between core and lossless");
            }
        }

        Ok(())
    }

    fn filter_hd_ma_frame(&mut self) -> Result<()> {
        if self.packet & PACKET_CORE != 0 {
            let x96_synth =
                self.xll.chset[0].freq == 96_000 && self.core.sample_rate() == 48_000;

            if let Err(err) = self.core.filter_fixed(x96_synth) {
                self.core_residual_valid = false;
                return Err(err);
            }

            // The first core frame after a discontinuity cannot be trusted for residual
            // reconstruction since the core filter history is cold.
            if !self.core_residual_valid {
                if self.has_residual_encoded && self.xll.frame.nchsets > 1 {
                    self.packet |= PACKET_RECOVERY;
                }
                self.core_residual_valid = true;
            }
        }

        let request = self.opts.request_channel_layout;
        self.xll.filter(self.core.as_ref(), self.packet & PACKET_RECOVERY != 0, request)?;

        // Reduce to the embedded stereo downmix when requested and available.
        let p = &self.xll.chset[0];
        let stereo_downmix = request == ChannelRequest::Stereo
            && self.xll.output_mask & SPEAKER_LAYOUT_STEREO == SPEAKER_LAYOUT_STEREO
            && p.dmix_embedded
            && matches!(p.dmix_type, DownMixType::LoRo | DownMixType::LtRt);

        let output_mask =
            if stereo_downmix { SPEAKER_LAYOUT_STEREO } else { self.xll.output_mask };

        let native = request == ChannelRequest::Native;
        let (speakers, channels) = match resolve_output_layout(output_mask, native) {
            Some(layout) => layout,
            None => return decode_error("dca: unrepresentable output layout"),
        };

        let rate = self.xll.output_rate();
        let nsamples = self.xll.noutsamples();
        let storage_bit_res = p.storage_bit_res;
        let shift = storage_bit_res - p.pcm_bit_res;

        if stereo_downmix {
            self.downmix_output_to_stereo(nsamples)?;
        }

        let spec = SignalSpec::new(rate, channels);

        match storage_bit_res {
            16 => {
                if self.buf_i16.is_unused()
                    || *self.buf_i16.spec() != spec
                    || self.buf_i16.capacity() < nsamples
                {
                    self.buf_i16 = AudioBuffer::new(nsamples as u64, spec);
                }
                self.buf_i16.clear();
                self.buf_i16.render_reserved(Some(nsamples));

                for (i, &spkr) in speakers.iter().enumerate() {
                    let src: &[i32] = if stereo_downmix {
                        &self.dmix_scratch[i]
                    }
                    else {
                        match self.xll.output_samples(spkr as usize) {
                            Some(src) => src,
                            None => return decode_error("dca: missing output channel"),
                        }
                    };

                    let dst = self.buf_i16.chan_mut(i);
                    for (d, &s) in dst.iter_mut().zip(src) {
                        *d = (i64::from(s) << shift).clamp(-0x8000, 0x7fff) as i16;
                    }
                }

                self.last_format = SampleFormat::S16;
            }
            24 => {
                if self.buf_i32.is_unused()
                    || *self.buf_i32.spec() != spec
                    || self.buf_i32.capacity() < nsamples
                {
                    self.buf_i32 = AudioBuffer::new(nsamples as u64, spec);
                }
                self.buf_i32.clear();
                self.buf_i32.render_reserved(Some(nsamples));

                for (i, &spkr) in speakers.iter().enumerate() {
                    let src: &[i32] = if stereo_downmix {
                        &self.dmix_scratch[i]
                    }
                    else {
                        match self.xll.output_samples(spkr as usize) {
                            Some(src) => src,
                            None => return decode_error("dca: missing output channel"),
                        }
                    };

                    // 24 significant bits left-justified in 32-bit samples.
                    let dst = self.buf_i32.chan_mut(i);
                    for (d, &s) in dst.iter_mut().zip(src) {
                        *d = ((i64::from(s) << shift).clamp(-0x80_0000, 0x7f_ffff) as i32) << 8;
                    }
                }

                self.last_format = SampleFormat::S32;
            }
            _ => return unsupported_error("dca: unsupported storage bit resolution"),
        }

        // Matrix encoding side data.
        self.matrix_encoding = MatrixEncoding::None;
        if let Some(asset) = &self.asset {
            if !asset.one_to_one_map_ch_to_spkr {
                if asset.representation_type == REPR_TYPE_LTRT {
                    self.matrix_encoding = MatrixEncoding::Dolby;
                }
                else if asset.representation_type == REPR_TYPE_LHRH {
                    self.matrix_encoding = MatrixEncoding::DolbyHeadphone;
                }
            }
            else if stereo_downmix && self.xll.chset[0].dmix_type == DownMixType::LtRt {
                self.matrix_encoding = MatrixEncoding::Dolby;
            }
        }

        self.params
            .with_sample_rate(rate)
            .with_channels(channels)
            .with_bits_per_sample(storage_bit_res);

        Ok(())
    }

    /// Mixes the lossless output down to a stereo pair using the primary set's embedded downmix
    /// coefficients.
    fn downmix_output_to_stereo(&mut self, nsamples: usize) -> Result<()> {
        let p = &self.xll.chset[0];
        let mask = self.xll.output_mask;
        let nch = mask.count_ones() as usize;

        if p.dmix_coeff.len() < 2 * nch {
            return decode_error("dca: invalid stereo downmix matrix");
        }
        let coeff_l = &p.dmix_coeff[..nch];
        let coeff_r = &p.dmix_coeff[nch..2 * nch];

        let src_l = match self.xll.output_samples(Speaker::L as usize) {
            Some(src) => src,
            None => return decode_error("dca: missing output channel"),
        };
        let src_r = match self.xll.output_samples(Speaker::R as usize) {
            Some(src) => src,
            None => return decode_error("dca: missing output channel"),
        };

        let [mix_l, mix_r] = &mut self.dmix_scratch;
        mix_l.clear();
        mix_l.resize(nsamples, 0);
        mix_r.clear();
        mix_r.resize(nsamples, 0);

        // Scale the left and right channels by their own coefficients. The column of a channel is
        // its rank within the speaker mask, so a present centre channel shifts both by one.
        let pos = usize::from(mask & SPEAKER_MASK_C != 0);
        for (d, &s) in mix_l.iter_mut().zip(src_l) {
            *d = mul15(s, coeff_l[pos]);
        }
        for (d, &s) in mix_r.iter_mut().zip(src_r) {
            *d = mul15(s, coeff_r[pos + 1]);
        }

        // Accumulate the remaining channels.
        let mut col = 0;
        for spkr in 0..SPEAKER_COUNT {
            if mask & (1 << spkr) == 0 {
                continue;
            }

            let src = match self.xll.output_samples(spkr) {
                Some(src) => src,
                None => return decode_error("dca: missing output channel"),
            };

            if coeff_l[col] != 0 && spkr != Speaker::L as usize {
                vmul15_add(mix_l, src, coeff_l[col]);
            }
            if coeff_r[col] != 0 && spkr != Speaker::R as usize {
                vmul15_add(mix_r, src, coeff_r[col]);
            }

            col += 1;
            if col == nch {
                break;
            }
        }

        Ok(())
    }

    /// Emits the lossy core output alone.
    fn filter_core_frame(&mut self) -> Result<()> {
        if let Err(err) = self.core.filter_fixed(false) {
            self.core_residual_valid = false;
            return Err(err);
        }

        // Residual reconstruction may only trust the core history when operating bit-exact.
        self.core_residual_valid = self.opts.bitexact;

        let (speakers, channels) = match resolve_output_layout(self.core.ch_mask(), false) {
            Some(layout) => layout,
            None => return decode_error("dca: unrepresentable core layout"),
        };

        let rate = self.core.output_rate();
        let nsamples = self.core.npcmsamples();
        let spec = SignalSpec::new(rate, channels);

        if self.buf_i32.is_unused()
            || *self.buf_i32.spec() != spec
            || self.buf_i32.capacity() < nsamples
        {
            self.buf_i32 = AudioBuffer::new(nsamples as u64, spec);
        }
        self.buf_i32.clear();
        self.buf_i32.render_reserved(Some(nsamples));

        for (i, &spkr) in speakers.iter().enumerate() {
            let core_ch = match self.core.map_speaker(spkr) {
                Some(core_ch) => core_ch,
                None => return decode_error("dca: missing core channel"),
            };
            let src = self.core.output_samples(core_ch);

            let dst = self.buf_i32.chan_mut(i);
            for (d, &s) in dst.iter_mut().zip(src) {
                *d = s.clamp(-0x80_0000, 0x7f_ffff) << 8;
            }
        }

        self.last_format = SampleFormat::S32;
        self.matrix_encoding = MatrixEncoding::None;

        self.params.with_sample_rate(rate).with_channels(channels).with_bits_per_sample(24);

        Ok(())
    }

    fn last_decoded_ref(&self) -> AudioBufferRef<'_> {
        match self.last_format {
            SampleFormat::S16 => self.buf_i16.as_audio_buffer_ref(),
            SampleFormat::S32 => self.buf_i32.as_audio_buffer_ref(),
        }
    }
}

impl Decoder for DcaDecoder {
    fn try_new(params: &CodecParameters, options: &DecoderOptions) -> Result<Self> {
        DcaDecoder::try_new_with_core(params, options, DcaOptions::default(), Box::new(NoopCore))
    }

    fn supported_codecs() -> &'static [CodecDescriptor] {
        &[support_codec!(CODEC_TYPE_DCA, "dca", "DTS Coherent Acoustics")]
    }

    fn reset(&mut self) {
        self.xll.flush();
        self.packet = 0;
        self.core_residual_valid = false;
    }

    fn codec_params(&self) -> &CodecParameters {
        &self.params
    }

    fn decode(&mut self, packet: &Packet) -> Result<AudioBufferRef<'_>> {
        if let Err(err) = self.decode_inner(packet) {
            self.buf_i16.clear();
            self.buf_i32.clear();
            Err(err)
        }
        else {
            Ok(self.last_decoded_ref())
        }
    }

    fn finalize(&mut self) -> FinalizeResult {
        Default::default()
    }

    fn last_decoded(&self) -> AudioBufferRef<'_> {
        self.last_decoded_ref()
    }
}

fn read_sync(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
}

/// Attempts a bitstream conversion at the head of `src`. Returns the converted size when `src`
/// starts with a recognized sync word.
fn convert_at(src: &[u8], dst: &mut Vec<u8>) -> Option<usize> {
    let sync = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);

    match sync {
        SYNCWORD_CORE_BE | SYNCWORD_SUBSTREAM => {
            dst.clear();
            dst.extend_from_slice(src);
            Some(dst.len())
        }
        SYNCWORD_CORE_LE => {
            dst.clear();
            for pair in src.chunks_exact(2) {
                dst.push(pair[1]);
                dst.push(pair[0]);
            }
            Some(dst.len())
        }
        SYNCWORD_CORE_14B_BE | SYNCWORD_CORE_14B_LE => {
            // Repack the 14 payload bits of every 16-bit word into a contiguous stream.
            let le = sync == SYNCWORD_CORE_14B_LE;

            dst.clear();
            let mut acc = 0u64;
            let mut nbits = 0;
            for pair in src.chunks_exact(2) {
                let word = if le {
                    u16::from_le_bytes([pair[0], pair[1]])
                }
                else {
                    u16::from_be_bytes([pair[0], pair[1]])
                };

                acc = (acc << 14) | u64::from(word & 0x3fff);
                nbits += 14;
                while nbits >= 8 {
                    nbits -= 8;
                    dst.push((acc >> nbits) as u8);
                }
            }
            Some(dst.len())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_convert_14bit_packing() {
        // The 14-bit big-endian sync expands to the 16-bit core sync word.
        let src = [0x1f, 0xff, 0xe8, 0x00, 0x07, 0xf1, 0x3c, 0x2a];
        let mut dst = Vec::new();

        let size = convert_at(&src, &mut dst).unwrap();
        assert_eq!(size, 7);
        assert_eq!(&dst[..4], &[0x7f, 0xfe, 0x80, 0x01]);
    }

    #[test]
    fn verify_convert_little_endian() {
        let src = [0xfe, 0x7f, 0x01, 0x80, 0x34, 0x12];
        let mut dst = Vec::new();

        convert_at(&src, &mut dst).unwrap();
        assert_eq!(&dst[..], &[0x7f, 0xfe, 0x80, 0x01, 0x12, 0x34]);
    }

    #[test]
    fn verify_unknown_sync_rejected() {
        let src = [0u8; 16];
        let mut dst = Vec::new();
        assert!(convert_at(&src, &mut dst).is_none());
    }

    use cantata_core::audio::{Channels, Signal};
    use cantata_core::codecs::CodecParameters;

    use crate::testutil::{build_exss_packet, build_xll_frame, StubCore, XllChsetSpec, XllFrameSpec};

    fn new_decoder(opts: DcaOptions, core: Box<dyn CoreDecoder>) -> DcaDecoder {
        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_DCA);
        DcaDecoder::try_new_with_core(&params, &DecoderOptions::default(), opts, core).unwrap()
    }

    fn packet(data: Vec<u8>) -> Packet {
        Packet::new_from_boxed_slice(0, 0, 0, data.into_boxed_slice())
    }

    #[test]
    fn verify_decode_identity_mono_packet() {
        // A lossless-only packet with a constant 24-bit residual decodes to S32 planes holding
        // the 24-bit value left-justified.
        let mut chset = XllChsetSpec::mono();
        chset.linear_width = 10;
        chset.residuals = vec![vec![vec![0x100; 256]]];

        let frame = build_xll_frame(&XllFrameSpec::new(8, 0, chset));
        let data = build_exss_packet(&frame, false, 0, 0);

        let mut decoder = new_decoder(DcaOptions::default(), Box::new(NoopCore));

        let buf = decoder.decode(&packet(data)).unwrap();
        let spec = *buf.spec();
        assert_eq!(spec.rate, 48_000);
        assert_eq!(spec.channels, Channels::FRONT_CENTRE);

        match buf {
            AudioBufferRef::S32(buf) => {
                assert_eq!(buf.frames(), 256);
                assert!(buf.chan(0).iter().all(|&s| s == 0x0001_0000));
            }
            _ => panic!("expected S32 output"),
        }
    }

    #[test]
    fn verify_decode_16bit_packet() {
        let chset = XllChsetSpec {
            pcm_bit_res: 16,
            storage_bit_res: 16,
            linear_width: 6,
            residuals: vec![vec![vec![-20; 256]]],
            ..XllChsetSpec::mono()
        };

        let frame = build_xll_frame(&XllFrameSpec::new(8, 0, chset));
        let data = build_exss_packet(&frame, false, 0, 0);

        let mut decoder = new_decoder(DcaOptions::default(), Box::new(NoopCore));

        let buf = decoder.decode(&packet(data)).unwrap();
        match buf {
            AudioBufferRef::S16(buf) => {
                assert_eq!(buf.frames(), 256);
                assert!(buf.chan(0).iter().all(|&s| s == -20));
            }
            _ => panic!("expected S16 output"),
        }
    }

    #[test]
    fn verify_residual_combination_with_core() {
        // One residually encoded channel: the output is the lossless residual plus the core
        // output reduced to the coded resolution.
        let chset = XllChsetSpec {
            residual_encode: 0x0,
            pcm_bit_res: 16,
            storage_bit_res: 16,
            linear_width: 4,
            residuals: vec![vec![vec![1; 256]]],
            ..XllChsetSpec::mono()
        };

        let frame = build_xll_frame(&XllFrameSpec::new(8, 0, chset));
        let exss = build_exss_packet(&frame, false, 0, 0);

        // A 16 byte stand-in core frame followed by the extension sub-stream.
        let core_size = 16;
        let mut data = vec![0u8; core_size];
        data[..4].copy_from_slice(&[0x7f, 0xfe, 0x80, 0x01]);
        data.extend_from_slice(&exss);

        // Core emits a constant 24-bit sample; 256 samples of 8 blocks.
        let core = StubCore::mono(core_size, vec![0x4000; 256]);
        let opts = DcaOptions { bitexact: true, ..Default::default() };
        let mut decoder = new_decoder(opts, Box::new(core));

        // shift = 24 - 16 = 8, so each output sample is 1 + round(0x4000 / 256).
        let buf = decoder.decode(&packet(data)).unwrap();
        match buf {
            AudioBufferRef::S16(buf) => {
                assert!(buf.chan(0).iter().all(|&s| s == 1 + (0x4000 >> 8)));
            }
            _ => panic!("expected S16 output"),
        }

        assert!(!decoder.is_recovery());
    }

    #[test]
    fn verify_recovery_after_sync_loss() {
        // The first packet decodes a lossless frame; the second has a corrupted lossless sync but
        // a valid core, so it is decoded in recovery mode from the core alone.
        let mut chset = XllChsetSpec::mono();
        chset.linear_width = 10;
        chset.residuals = vec![vec![vec![123; 256]]];

        let frame = build_xll_frame(&XllFrameSpec::new(8, 0, chset));

        let core_size = 16;
        let core = StubCore::mono(core_size, vec![1000; 256]);
        let mut decoder = new_decoder(DcaOptions::default(), Box::new(core));

        let data = build_exss_packet(&frame, false, 0, 0);
        decoder.decode(&packet(data)).unwrap();
        assert!(!decoder.is_recovery());

        // Corrupt the lossless sync word of the second frame.
        let mut bad_frame = frame.clone();
        bad_frame[0] = 0;

        let exss = build_exss_packet(&bad_frame, false, 0, 0);
        let mut data = vec![0u8; core_size];
        data[..4].copy_from_slice(&[0x7f, 0xfe, 0x80, 0x01]);
        data.extend_from_slice(&exss);

        // The channel mapped into the core is substituted by core output.
        let buf = decoder.decode(&packet(data)).unwrap();
        match buf {
            AudioBufferRef::S32(buf) => {
                assert_eq!(buf.frames(), 256);
                assert!(buf.chan(0).iter().all(|&s| s == 1000 << 8));
            }
            _ => panic!("expected S32 output"),
        }

        assert!(decoder.is_recovery());
    }

    #[test]
    fn verify_core_only_packet() {
        let core_size = 16;
        let core = StubCore::mono(core_size, vec![-2000; 256]);
        let mut decoder = new_decoder(DcaOptions::default(), Box::new(core));

        let mut data = vec![0u8; core_size];
        data[..4].copy_from_slice(&[0x7f, 0xfe, 0x80, 0x01]);

        let buf = decoder.decode(&packet(data)).unwrap();
        let spec = *buf.spec();
        assert_eq!(spec.rate, 48_000);
        assert_eq!(spec.channels, Channels::FRONT_CENTRE);

        match buf {
            AudioBufferRef::S32(buf) => {
                assert!(buf.chan(0).iter().all(|&s| s == -2000 << 8));
            }
            _ => panic!("expected S32 output"),
        }
    }

    #[test]
    fn verify_zero_packet_rejected() {
        // A minimum size packet of zeros contains no sync word and must fail cleanly.
        let mut decoder = new_decoder(DcaOptions::default(), Box::new(NoopCore));
        let ret = decoder.decode(&packet(vec![0u8; MIN_PACKET_SIZE]));
        assert!(matches!(ret, Err(Error::DecodeError(_))));
    }

    #[test]
    fn verify_undersized_packet_rejected() {
        let mut decoder = new_decoder(DcaOptions::default(), Box::new(NoopCore));
        let ret = decoder.decode(&packet(vec![0u8; MIN_PACKET_SIZE - 1]));
        assert!(matches!(ret, Err(Error::DecodeError(_))));
    }
}
