// Cantata
// Copyright (c) 2025 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test support: an MSB-first bit writer, builders for checksummed lossless frames and extension
//! sub-stream packets, and a scriptable core decoder stand-in.

use cantata_core::checksum::Crc16Ccitt;
use cantata_core::errors::{decode_error, Result};
use cantata_core::util::bits::ceil_log2;

use crate::core::CoreDecoder;
use crate::exss::ExssAsset;
use crate::speaker::{Speaker, SpeakerMask, EXSS_XLL};
use crate::tables::SAMPLING_FREQS;
use crate::{SYNCWORD_SUBSTREAM, SYNCWORD_XLL};

/// An MSB-first bit writer over a growable byte buffer.
pub struct BitWriter {
    bytes: Vec<u8>,
    bitpos: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        BitWriter { bytes: Vec::new(), bitpos: 0 }
    }

    pub fn tell(&self) -> usize {
        self.bitpos
    }

    pub fn put_bits(&mut self, value: u32, n: u32) {
        for i in (0..n).rev() {
            let byte_idx = self.bitpos / 8;
            if byte_idx == self.bytes.len() {
                self.bytes.push(0);
            }
            if (value >> i) & 1 != 0 {
                self.bytes[byte_idx] |= 1 << (7 - (self.bitpos & 7));
            }
            self.bitpos += 1;
        }
    }

    /// Writes a zig-zag coded signed value of `n` bits.
    pub fn put_signed_linear(&mut self, value: i32, n: u32) {
        let encoded = ((value << 1) ^ (value >> 31)) as u32;
        assert!(n == 32 || encoded < (1 << n));
        self.put_bits(encoded, n);
    }

    pub fn align(&mut self) {
        while self.bitpos % 8 != 0 {
            self.put_bits(0, 1);
        }
    }

    /// Pads with zero bits up to the absolute bit position `pos`.
    pub fn pad_to(&mut self, pos: usize) {
        assert!(pos >= self.bitpos);
        while self.bitpos < pos {
            self.put_bits(0, 1);
        }
    }

    /// Computes the CRC16 over the bytes written since `start_byte`. The cursor must be byte
    /// aligned.
    pub fn crc16_from(&self, start_byte: usize) -> u16 {
        assert!(self.bitpos % 8 == 0);
        let mut crc = Crc16Ccitt::new();
        crc.process_buf_bytes(&self.bytes[start_byte..]);
        crc.crc()
    }

    /// Appends the bits of another writer.
    pub fn put_writer(&mut self, other: &BitWriter) {
        for bit in 0..other.bitpos {
            let value = (other.bytes[bit / 8] >> (7 - (bit & 7))) & 1;
            self.put_bits(u32::from(value), 1);
        }
    }

    /// Appends whole bytes. The cursor must be byte aligned.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        assert!(self.bitpos % 8 == 0);
        self.bytes.extend_from_slice(bytes);
        self.bitpos += bytes.len() * 8;
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Specification of one channel set for [`build_xll_frame`]. The builder covers independently
/// coded sets without adaptive prediction; residuals are linear coded with one width.
pub struct XllChsetSpec {
    pub nchannels: usize,
    /// Bit per channel; set means independently coded.
    pub residual_encode: u32,
    pub freq_index: u32,
    pub pcm_bit_res: u32,
    pub storage_bit_res: u32,
    pub ch_mask: SpeakerMask,
    pub decor_enabled: bool,
    pub orig_order: Vec<usize>,
    pub decor_coeff: Vec<i32>,
    pub fixed_pred_order: Vec<usize>,
    /// Linear code width of every residual; 0 encodes silence without any payload bits.
    pub linear_width: u32,
    /// Residual samples, indexed `[band][channel][sample]`.
    pub residuals: Vec<Vec<Vec<i32>>>,
}

impl XllChsetSpec {
    /// A mono, 48 kHz, 24-in-24-bit silent channel set on the centre speaker.
    pub fn mono() -> Self {
        XllChsetSpec {
            nchannels: 1,
            residual_encode: 0x1,
            freq_index: 12,
            pcm_bit_res: 24,
            storage_bit_res: 24,
            ch_mask: Speaker::C.mask(),
            decor_enabled: false,
            orig_order: vec![0],
            decor_coeff: Vec::new(),
            fixed_pred_order: vec![0],
            linear_width: 0,
            residuals: Vec::new(),
        }
    }

    fn nfreqbands(&self) -> usize {
        if SAMPLING_FREQS[self.freq_index as usize] > 96_000 {
            2
        }
        else {
            1
        }
    }

    fn nabits(&self) -> u32 {
        let mut nabits = if self.storage_bit_res > 16 {
            5
        }
        else if self.storage_bit_res > 8 {
            4
        }
        else {
            3
        };
        if self.nfreqbands() > 1 && nabits < 5 {
            nabits += 1;
        }
        nabits
    }
}

/// Specification of a lossless frame for [`build_xll_frame`]. Only a single channel set is
/// supported.
pub struct XllFrameSpec {
    pub nsegsamples_log2: u32,
    pub nframesegs_log2: u32,
    pub chset: XllChsetSpec,
    /// Declares a scalable MSB/LSB split with the given band 0 LSB section size and per-channel
    /// LSB width.
    pub scalable: Option<(usize, u32)>,
}

impl XllFrameSpec {
    pub fn new(nsegsamples_log2: u32, nframesegs_log2: u32, chset: XllChsetSpec) -> Self {
        XllFrameSpec { nsegsamples_log2, nframesegs_log2, chset, scalable: None }
    }
}

const FRAME_SIZE_NBITS: u32 = 16;
const SEG_SIZE_NBITS: u32 = 16;
const CH_MASK_NBITS: u32 = 28;

/// Builds a complete, checksummed lossless frame.
pub fn build_xll_frame(spec: &XllFrameSpec) -> Vec<u8> {
    let nsegsamples = 1usize << spec.nsegsamples_log2;
    let nframesegs = 1usize << spec.nframesegs_log2;
    let c = &spec.chset;
    let nfreqbands = c.nfreqbands();

    // Band data segments in (band, segment) order.
    let mut segments = Vec::new();
    for band in 0..nfreqbands {
        for seg in 0..nframesegs {
            segments.push(build_segment(spec, band, seg, nsegsamples));
        }
    }

    // Channel set sub-header body (everything after the 10-bit size field).
    let body = build_chset_body(spec);
    let subheader_size = (10 + body.tell() + 16 + 7) / 8;

    // Common header is fixed layout: everything up to the fixed LSB width, padding, CRC.
    let mut header_bits = 32 + 4 + 8 + 5 + FRAME_SIZE_NBITS as usize + 4 + 4 + 4 + 5 + 2 + 1 + 5;
    if spec.scalable.is_some() {
        header_bits += 4;
    }
    let header_size = (header_bits + 16 + 7) / 8;

    let navi_size = nfreqbands * nframesegs * (SEG_SIZE_NBITS as usize / 8) + 2;

    let frame_size = header_size
        + subheader_size
        + navi_size
        + segments.iter().map(Vec::len).sum::<usize>();

    let mut w = BitWriter::new();

    // Common header.
    w.put_bits(SYNCWORD_XLL, 32);
    w.put_bits(0, 4); // stream version 1
    w.put_bits(header_size as u32 - 1, 8);
    w.put_bits(FRAME_SIZE_NBITS - 1, 5);
    w.put_bits(frame_size as u32 - 1, FRAME_SIZE_NBITS);
    w.put_bits(0, 4); // one channel set
    w.put_bits(spec.nframesegs_log2, 4);
    w.put_bits(spec.nsegsamples_log2, 4);
    w.put_bits(SEG_SIZE_NBITS - 1, 5);
    w.put_bits(0, 2); // no band CRCs
    w.put_bits(u32::from(spec.scalable.is_some()), 1);
    w.put_bits(CH_MASK_NBITS - 1, 5);
    if spec.scalable.is_some() {
        w.put_bits(0, 4); // no fixed LSB width
    }
    w.pad_to(header_size * 8 - 16);
    let crc = w.crc16_from(4);
    w.put_bits(u32::from(crc), 16);

    // Channel set sub-header.
    let subheader_start = w.tell() / 8;
    w.put_bits(subheader_size as u32 - 1, 10);
    w.put_writer(&body);
    w.pad_to((subheader_start + subheader_size) * 8 - 16);
    let crc = w.crc16_from(subheader_start);
    w.put_bits(u32::from(crc), 16);

    // Navigation table.
    let navi_start = w.tell() / 8;
    for segment in &segments {
        w.put_bits(segment.len() as u32 - 1, SEG_SIZE_NBITS);
    }
    w.align();
    let crc = w.crc16_from(navi_start);
    w.put_bits(u32::from(crc), 16);

    // Band data.
    for segment in &segments {
        w.put_bytes(segment);
    }

    let frame = w.finish();
    assert_eq!(frame.len(), frame_size);
    frame
}

fn build_chset_body(spec: &XllFrameSpec) -> BitWriter {
    let c = &spec.chset;
    let nfreqbands = c.nfreqbands();

    let mut body = BitWriter::new();
    body.put_bits(c.nchannels as u32 - 1, 4);
    body.put_bits(c.residual_encode, c.nchannels as u32);
    body.put_bits(c.pcm_bit_res - 1, 5);
    body.put_bits(c.storage_bit_res - 1, 5);
    body.put_bits(c.freq_index, 4);
    body.put_bits(0, 2); // no sampling frequency modifier
    body.put_bits(0, 2); // no replacement set
    body.put_bits(1, 1); // primary channel set
    body.put_bits(0, 1); // no downmix coefficients
    body.put_bits(1, 1); // hierarchical
    body.put_bits(1, 1); // channel mask enabled
    body.put_bits(c.ch_mask, CH_MASK_NBITS);
    if SAMPLING_FREQS[c.freq_index as usize] > 96_000 {
        body.put_bits(0, 1); // no extra frequency bands
    }

    for band in 0..nfreqbands {
        // Pairwise decorrelation.
        body.put_bits(u32::from(c.decor_enabled), 1);
        if c.decor_enabled && c.nchannels > 1 {
            let ch_nbits = ceil_log2(c.nchannels as u32);
            for &order in &c.orig_order {
                body.put_bits(order as u32, ch_nbits);
            }
            for pair in 0..c.nchannels / 2 {
                let coeff = c.decor_coeff.get(pair).copied().unwrap_or(0);
                if coeff != 0 {
                    body.put_bits(1, 1);
                    body.put_signed_linear(coeff, 7);
                }
                else {
                    body.put_bits(0, 1);
                }
            }
        }

        // Adaptive predictor orders, all zero.
        for _ in 0..c.nchannels {
            body.put_bits(0, 4);
        }
        // Fixed predictor orders.
        for ch in 0..c.nchannels {
            body.put_bits(c.fixed_pred_order[ch] as u32, 2);
        }

        if band == 0 {
            if let Some((lsb_section_size, nscalablelsbs)) = spec.scalable {
                body.put_bits(lsb_section_size as u32, SEG_SIZE_NBITS);
                for _ in 0..c.nchannels {
                    body.put_bits(nscalablelsbs, 4);
                }
                for _ in 0..c.nchannels {
                    body.put_bits(0, 4); // no bit width adjustment
                }
            }
        }
        else {
            body.put_bits(0, 1); // no MSB/LSB split
            body.put_bits(0, 1); // no scalable resolution
        }
    }

    body
}

fn build_segment(spec: &XllFrameSpec, band: usize, seg: usize, nsegsamples: usize) -> Vec<u8> {
    let c = &spec.chset;
    let mut bw = BitWriter::new();

    if seg > 0 {
        bw.put_bits(0, 1); // do not reuse previous coding parameters
    }
    bw.put_bits(1, 1); // common coding parameters for all channels
    bw.put_bits(0, 1); // linear codes

    let nabits = c.nabits();
    let ba = if c.linear_width == 0 { 0 } else { c.linear_width - 1 };
    if seg == 0 {
        bw.put_bits(ba, nabits); // part A
    }
    bw.put_bits(ba, nabits); // part B

    if c.linear_width > 0 {
        for ch in 0..c.nchannels {
            for t in 0..nsegsamples {
                let sample = c.residuals[band][ch][seg * nsegsamples + t];
                bw.put_signed_linear(sample, c.linear_width);
            }
        }
    }

    if seg == 0 && band == 1 {
        bw.put_bits(0, 5); // decimator history coded in 1 bit
        for _ch in 0..c.nchannels {
            for _j in 1..crate::xll::XLL_DECI_HISTORY_MAX {
                bw.put_bits(0, 1);
            }
        }
    }

    bw.align();
    bw.finish()
}

/// An asset descriptor locating a bare lossless component.
pub fn xll_asset(size: usize, sync_present: bool, sync_offset: usize, delay: u32) -> ExssAsset {
    ExssAsset {
        asset_offset: 0,
        asset_size: size,
        extension_mask: EXSS_XLL,
        xll_offset: 0,
        xll_size: size,
        xll_sync_present: sync_present,
        xll_sync_offset: sync_offset,
        xll_delay_nframes: delay,
        one_to_one_map_ch_to_spkr: true,
        ..Default::default()
    }
}

/// Builds an extension sub-stream packet wrapping a lossless component.
pub fn build_exss_packet(xll: &[u8], sync_present: bool, delay: u32, sync_offset: usize) -> Vec<u8> {
    const HEADER_SIZE: usize = 32;

    let exss_size = HEADER_SIZE + xll.len();

    let mut w = BitWriter::new();
    w.put_bits(SYNCWORD_SUBSTREAM, 32);
    w.put_bits(0, 8); // user defined
    w.put_bits(0, 2); // substream index
    w.put_bits(0, 1); // narrow header
    w.put_bits(HEADER_SIZE as u32 - 1, 8);
    w.put_bits(exss_size as u32 - 1, 16);
    w.put_bits(1, 1); // static fields present
    w.put_bits(0, 2); // reference clock
    w.put_bits(0, 3); // frame duration
    w.put_bits(0, 1); // no timestamp
    w.put_bits(0, 3); // one presentation
    w.put_bits(0, 3); // one asset
    w.put_bits(0, 1); // presentation draws from no other substream
    w.put_bits(0, 1); // no mixing metadata
    w.put_bits(xll.len() as u32 - 1, 16); // asset size

    // Asset descriptor.
    let descr_start = w.tell();
    let mut descr = BitWriter::new();
    descr.put_bits(0, 3); // asset index
    descr.put_bits(0, 3); // no type, language, or info text
    descr.put_bits(24 - 1, 5); // bit resolution
    descr.put_bits(12, 4); // 48 kHz
    descr.put_bits(0, 8); // one channel
    descr.put_bits(1, 1); // one-to-one mapping
    descr.put_bits(0, 1); // no speaker mask
    descr.put_bits(0, 3); // no speaker remaps
    descr.put_bits(0, 2); // no drc, no dialnorm
    descr.put_bits(0, 2); // coding mode 0
    descr.put_bits(EXSS_XLL, 12);
    descr.put_bits(xll.len() as u32 - 1, 16); // xll size
    if sync_present {
        descr.put_bits(1, 1);
        descr.put_bits(0, 4); // pbr buffer size code
        descr.put_bits(8 - 1, 5); // delay coded in 8 bits
        descr.put_bits(delay, 8);
        descr.put_bits(sync_offset as u32, 16);
    }
    else {
        descr.put_bits(0, 1);
    }
    descr.put_bits(0, 3); // hd stream id

    let descr_size = (9 + descr.tell() + 7) / 8;
    w.put_bits(descr_size as u32 - 1, 9);
    w.put_writer(&descr);
    w.pad_to(descr_start + descr_size * 8);

    w.pad_to(HEADER_SIZE * 8);

    let mut packet = w.finish();
    packet.extend_from_slice(xll);
    packet
}

/// A scriptable stand-in for the lossy core collaborator.
pub struct StubCore {
    pub frame_size: usize,
    pub sample_rate: u32,
    pub npcmblocks: usize,
    pub ch_mask: SpeakerMask,
    /// Speaker to core channel mapping.
    pub spkr_map: Vec<(Speaker, usize)>,
    /// Post-filter output planes.
    pub output: Vec<Vec<i32>>,
}

impl StubCore {
    /// A mono centre-channel core at 48 kHz emitting the given samples.
    pub fn mono(frame_size: usize, samples: Vec<i32>) -> Self {
        StubCore {
            frame_size,
            sample_rate: 48_000,
            npcmblocks: samples.len() / 32,
            ch_mask: Speaker::C.mask(),
            spkr_map: vec![(Speaker::C, 0)],
            output: vec![samples],
        }
    }
}

impl CoreDecoder for StubCore {
    fn parse(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < 4 || data[..4] != [0x7f, 0xfe, 0x80, 0x01] {
            return decode_error("stub: invalid core frame");
        }
        Ok(())
    }

    fn parse_exss(&mut self, _data: &[u8], _asset: &ExssAsset) -> Result<()> {
        Ok(())
    }

    fn filter_fixed(&mut self, _x96_synth: bool) -> Result<()> {
        Ok(())
    }

    fn map_speaker(&self, spkr: Speaker) -> Option<usize> {
        self.spkr_map.iter().find(|(s, _)| *s == spkr).map(|&(_, ch)| ch)
    }

    fn output_samples(&self, ch: usize) -> &[i32] {
        &self.output[ch]
    }

    fn ch_mask(&self) -> SpeakerMask {
        self.ch_mask
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn npcmblocks(&self) -> usize {
        self.npcmblocks
    }

    fn output_rate(&self) -> u32 {
        self.sample_rate
    }

    fn npcmsamples(&self) -> usize {
        self.npcmblocks * 32
    }
}
