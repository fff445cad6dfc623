// Cantata
// Copyright (c) 2025 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Speaker positions, speaker masks, and conversions to the canonical output channel order.

use cantata_core::audio::Channels;

/// A named DCA speaker position. The discriminant is the bit index of the speaker within a
/// [`SpeakerMask`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Speaker {
    C = 0,
    L = 1,
    R = 2,
    Ls = 3,
    Rs = 4,
    Lfe1 = 5,
    Cs = 6,
    Lsr = 7,
    Rsr = 8,
    Lss = 9,
    Rss = 10,
    Lc = 11,
    Rc = 12,
    Lh = 13,
    Ch = 14,
    Rh = 15,
    Lfe2 = 16,
    Lw = 17,
    Rw = 18,
    Oh = 19,
    Lhs = 20,
    Rhs = 21,
    Chr = 22,
    Lhr = 23,
    Rhr = 24,
    Cl = 25,
    Ll = 26,
    Rl = 27,
    Rsv1 = 28,
    Rsv2 = 29,
    Rsv3 = 30,
    Rsv4 = 31,
}

/// The number of addressable speaker positions.
pub const SPEAKER_COUNT: usize = 32;

/// A bitmask over [`Speaker`] positions.
pub type SpeakerMask = u32;

pub const SPEAKER_MASK_C: SpeakerMask = 0x0000_0001;
pub const SPEAKER_MASK_L: SpeakerMask = 0x0000_0002;
pub const SPEAKER_MASK_R: SpeakerMask = 0x0000_0004;
pub const SPEAKER_MASK_LS: SpeakerMask = 0x0000_0008;
pub const SPEAKER_MASK_RS: SpeakerMask = 0x0000_0010;
pub const SPEAKER_MASK_LFE1: SpeakerMask = 0x0000_0020;
pub const SPEAKER_MASK_CS: SpeakerMask = 0x0000_0040;
pub const SPEAKER_MASK_LSS: SpeakerMask = 0x0000_0200;
pub const SPEAKER_MASK_RSS: SpeakerMask = 0x0000_0400;
pub const SPEAKER_MASK_LW: SpeakerMask = 0x0002_0000;
pub const SPEAKER_MASK_RW: SpeakerMask = 0x0004_0000;

pub const SPEAKER_LAYOUT_MONO: SpeakerMask = SPEAKER_MASK_C;
pub const SPEAKER_LAYOUT_STEREO: SpeakerMask = SPEAKER_MASK_L | SPEAKER_MASK_R;
pub const SPEAKER_LAYOUT_2POINT1: SpeakerMask = SPEAKER_LAYOUT_STEREO | SPEAKER_MASK_LFE1;
pub const SPEAKER_LAYOUT_3_0: SpeakerMask = SPEAKER_LAYOUT_STEREO | SPEAKER_MASK_C;
pub const SPEAKER_LAYOUT_2_1: SpeakerMask = SPEAKER_LAYOUT_STEREO | SPEAKER_MASK_CS;
pub const SPEAKER_LAYOUT_3_1: SpeakerMask = SPEAKER_LAYOUT_3_0 | SPEAKER_MASK_CS;
pub const SPEAKER_LAYOUT_2_2: SpeakerMask =
    SPEAKER_LAYOUT_STEREO | SPEAKER_MASK_LS | SPEAKER_MASK_RS;
pub const SPEAKER_LAYOUT_5POINT0: SpeakerMask =
    SPEAKER_LAYOUT_3_0 | SPEAKER_MASK_LS | SPEAKER_MASK_RS;
pub const SPEAKER_LAYOUT_5POINT1: SpeakerMask = SPEAKER_LAYOUT_5POINT0 | SPEAKER_MASK_LFE1;
pub const SPEAKER_LAYOUT_7POINT0_WIDE: SpeakerMask =
    SPEAKER_LAYOUT_5POINT0 | SPEAKER_MASK_LW | SPEAKER_MASK_RW;
pub const SPEAKER_LAYOUT_7POINT1_WIDE: SpeakerMask =
    SPEAKER_LAYOUT_7POINT0_WIDE | SPEAKER_MASK_LFE1;

impl Speaker {
    /// Gets the speaker at a given mask bit index.
    pub fn from_index(index: usize) -> Option<Speaker> {
        const SPEAKERS: [Speaker; SPEAKER_COUNT] = [
            Speaker::C,
            Speaker::L,
            Speaker::R,
            Speaker::Ls,
            Speaker::Rs,
            Speaker::Lfe1,
            Speaker::Cs,
            Speaker::Lsr,
            Speaker::Rsr,
            Speaker::Lss,
            Speaker::Rss,
            Speaker::Lc,
            Speaker::Rc,
            Speaker::Lh,
            Speaker::Ch,
            Speaker::Rh,
            Speaker::Lfe2,
            Speaker::Lw,
            Speaker::Rw,
            Speaker::Oh,
            Speaker::Lhs,
            Speaker::Rhs,
            Speaker::Chr,
            Speaker::Lhr,
            Speaker::Rhr,
            Speaker::Cl,
            Speaker::Ll,
            Speaker::Rl,
            Speaker::Rsv1,
            Speaker::Rsv2,
            Speaker::Rsv3,
            Speaker::Rsv4,
        ];

        SPEAKERS.get(index).copied()
    }

    /// Gets the mask bit of this speaker.
    #[inline(always)]
    pub fn mask(self) -> SpeakerMask {
        1 << (self as u8)
    }
}

/// A downmix type embedded by the encoder in the primary channel set.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum DownMixType {
    #[default]
    Mono = 0,
    LoRo = 1,
    LtRt = 2,
    Layout3_0 = 3,
    Layout2_1 = 4,
    Layout2_2 = 5,
    Layout3_1 = 6,
}

/// The number of downmix types.
pub const DMIX_TYPE_COUNT: u32 = 7;

impl DownMixType {
    pub fn from_index(index: u32) -> Option<DownMixType> {
        match index {
            0 => Some(DownMixType::Mono),
            1 => Some(DownMixType::LoRo),
            2 => Some(DownMixType::LtRt),
            3 => Some(DownMixType::Layout3_0),
            4 => Some(DownMixType::Layout2_1),
            5 => Some(DownMixType::Layout2_2),
            6 => Some(DownMixType::Layout3_1),
            _ => None,
        }
    }
}

/// Representation type of an asset without one-to-one channel to speaker mapping.
pub const REPR_TYPE_LTRT: u32 = 2;
pub const REPR_TYPE_LHRH: u32 = 3;

/// Extension components that may be present within an extension sub-stream asset.
pub const EXSS_CORE: u32 = 0x010;
pub const EXSS_XBR: u32 = 0x020;
pub const EXSS_XXCH: u32 = 0x040;
pub const EXSS_X96: u32 = 0x080;
pub const EXSS_LBR: u32 = 0x100;
pub const EXSS_XLL: u32 = 0x200;

/// Position of each DCA speaker within the canonical output channel order, for layouts other than
/// the wide 7.0/7.1 ones.
const DCA2OUT_NORM: [u8; 28] = [
    2, 0, 1, 9, 10, 3, 8, 4, 5, 9, 10, 6, 7, 12, 13, 14, 3, 6, 7, 11, 12, 14, 16, 15, 17, 8, 4, 5,
];

/// Position of each DCA speaker within the canonical output channel order, for the wide 7.0/7.1
/// layouts where `Lw`/`Rw` stand in for side channels.
const DCA2OUT_WIDE: [u8; 28] = [
    2, 0, 1, 4, 5, 3, 8, 4, 5, 9, 10, 6, 7, 12, 13, 14, 3, 9, 10, 11, 12, 14, 16, 15, 17, 8, 4, 5,
];

/// The output channel flag at each canonical output position.
const OUT_CHANNELS: [Channels; 18] = [
    Channels::FRONT_LEFT,
    Channels::FRONT_RIGHT,
    Channels::FRONT_CENTRE,
    Channels::LFE1,
    Channels::REAR_LEFT,
    Channels::REAR_RIGHT,
    Channels::FRONT_LEFT_CENTRE,
    Channels::FRONT_RIGHT_CENTRE,
    Channels::REAR_CENTRE,
    Channels::SIDE_LEFT,
    Channels::SIDE_RIGHT,
    Channels::TOP_CENTRE,
    Channels::TOP_FRONT_LEFT,
    Channels::TOP_FRONT_CENTRE,
    Channels::TOP_FRONT_RIGHT,
    Channels::TOP_REAR_LEFT,
    Channels::TOP_REAR_CENTRE,
    Channels::TOP_REAR_RIGHT,
];

/// The output channel flag assigned to each DCA speaker when a native layout is requested.
const NATIVE_CHANNELS: [Channels; 28] = [
    Channels::FRONT_CENTRE,
    Channels::FRONT_LEFT,
    Channels::FRONT_RIGHT,
    Channels::SIDE_LEFT,
    Channels::SIDE_RIGHT,
    Channels::LFE1,
    Channels::REAR_CENTRE,
    Channels::REAR_LEFT,
    Channels::REAR_RIGHT,
    Channels::SIDE_LEFT,
    Channels::SIDE_RIGHT,
    Channels::FRONT_LEFT_CENTRE,
    Channels::FRONT_RIGHT_CENTRE,
    Channels::FRONT_LEFT_HIGH,
    Channels::FRONT_CENTRE_HIGH,
    Channels::FRONT_RIGHT_HIGH,
    Channels::LFE2,
    Channels::FRONT_LEFT_WIDE,
    Channels::FRONT_RIGHT_WIDE,
    Channels::TOP_CENTRE,
    Channels::TOP_FRONT_LEFT,
    Channels::TOP_FRONT_RIGHT,
    Channels::TOP_REAR_CENTRE,
    Channels::TOP_REAR_LEFT,
    Channels::TOP_REAR_RIGHT,
    Channels::BOTTOM_FRONT_CENTRE,
    Channels::BOTTOM_FRONT_LEFT,
    Channels::BOTTOM_FRONT_RIGHT,
];

/// Resolves a DCA speaker mask into the ordered list of speakers to emit and the matching output
/// channel mask. The list is ordered by output plane.
///
/// With `native` set, speakers keep their native positions (each mapped to a distinct output
/// channel flag). Otherwise speakers fold into the canonical 18-position output order, dropping
/// duplicates mapping to an already claimed position.
///
/// Returns `None` when the mask resolves to no representable output channel.
pub fn resolve_output_layout(dca_mask: SpeakerMask, native: bool) -> Option<(Vec<Speaker>, Channels)> {
    if native {
        let mut mask = Channels::empty();
        let mut pairs = Vec::new();

        for spkr_idx in 0..28 {
            if dca_mask & (1 << spkr_idx) == 0 {
                continue;
            }
            let flag = NATIVE_CHANNELS[spkr_idx];
            if mask.contains(flag) {
                // Two speakers collide on the same output position. Fold to the canonical order
                // instead.
                return resolve_output_layout(dca_mask, false);
            }
            mask |= flag;
            pairs.push((flag.bits(), Speaker::from_index(spkr_idx)?));
        }

        if pairs.is_empty() {
            return None;
        }

        // Plane order follows the output channel mask bit order.
        pairs.sort_by_key(|&(bits, _)| bits);
        Some((pairs.into_iter().map(|(_, spkr)| spkr).collect(), mask))
    }
    else {
        let dca2out = if dca_mask == SPEAKER_LAYOUT_7POINT0_WIDE
            || dca_mask == SPEAKER_LAYOUT_7POINT1_WIDE
        {
            &DCA2OUT_WIDE
        }
        else {
            &DCA2OUT_NORM
        };

        let mut out_map = [None; 18];
        let mut mask = Channels::empty();

        for spkr_idx in 0..28 {
            if dca_mask & (1 << spkr_idx) == 0 {
                continue;
            }
            let pos = usize::from(dca2out[spkr_idx]);
            if out_map[pos].is_none() {
                out_map[pos] = Speaker::from_index(spkr_idx);
                mask |= OUT_CHANNELS[pos];
            }
        }

        let speakers: Vec<Speaker> = out_map.iter().flatten().copied().collect();

        if speakers.is_empty() {
            None
        }
        else {
            Some((speakers, mask))
        }
    }
}
