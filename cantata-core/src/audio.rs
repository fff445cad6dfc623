// Cantata
// Copyright (c) 2025 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `audio` module provides primitives for working with multi-channel audio buffers.

use bitflags::bitflags;

use crate::sample::Sample;

bitflags! {
    /// A bitmask of all channels present in a signal.
    ///
    /// The position ordering of the mask defines the canonical plane ordering of a planar audio
    /// buffer: the n-th set bit (from the least significant end) is stored in plane n.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Channels: u32 {
        /// Front-left (left) or the mono channel.
        const FRONT_LEFT         = 0x0000_0001;
        /// Front-right (right) channel.
        const FRONT_RIGHT        = 0x0000_0002;
        /// Front-centre (centre) channel.
        const FRONT_CENTRE       = 0x0000_0004;
        /// Low frequency channel 1.
        const LFE1               = 0x0000_0008;
        /// Rear-left (surround rear left) channel.
        const REAR_LEFT          = 0x0000_0010;
        /// Rear-right (surround rear right) channel.
        const REAR_RIGHT         = 0x0000_0020;
        /// Front left-of-centre channel.
        const FRONT_LEFT_CENTRE  = 0x0000_0040;
        /// Front right-of-centre channel.
        const FRONT_RIGHT_CENTRE = 0x0000_0080;
        /// Rear-centre channel.
        const REAR_CENTRE        = 0x0000_0100;
        /// Side-left (surround left) channel.
        const SIDE_LEFT          = 0x0000_0200;
        /// Side-right (surround right) channel.
        const SIDE_RIGHT         = 0x0000_0400;
        /// Top-centre (overhead) channel.
        const TOP_CENTRE         = 0x0000_0800;
        /// Top front-left channel.
        const TOP_FRONT_LEFT     = 0x0000_1000;
        /// Top front-centre channel.
        const TOP_FRONT_CENTRE   = 0x0000_2000;
        /// Top front-right channel.
        const TOP_FRONT_RIGHT    = 0x0000_4000;
        /// Top rear-left channel.
        const TOP_REAR_LEFT      = 0x0000_8000;
        /// Top rear-centre channel.
        const TOP_REAR_CENTRE    = 0x0001_0000;
        /// Top rear-right channel.
        const TOP_REAR_RIGHT     = 0x0002_0000;
        /// Low frequency channel 2.
        const LFE2               = 0x0004_0000;
        /// Front left-wide channel.
        const FRONT_LEFT_WIDE    = 0x0008_0000;
        /// Front right-wide channel.
        const FRONT_RIGHT_WIDE   = 0x0010_0000;
        /// Front left-high channel.
        const FRONT_LEFT_HIGH    = 0x0020_0000;
        /// Front centre-high channel.
        const FRONT_CENTRE_HIGH  = 0x0040_0000;
        /// Front right-high channel.
        const FRONT_RIGHT_HIGH   = 0x0080_0000;
        /// Bottom front-left channel.
        const BOTTOM_FRONT_LEFT  = 0x0100_0000;
        /// Bottom front-centre channel.
        const BOTTOM_FRONT_CENTRE = 0x0200_0000;
        /// Bottom front-right channel.
        const BOTTOM_FRONT_RIGHT = 0x0400_0000;
    }
}

impl Channels {
    /// Gets the number of channels.
    pub fn count(self) -> usize {
        self.bits().count_ones() as usize
    }
}

/// `SignalSpec` describes the characteristics of a signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SignalSpec {
    /// The signal sampling rate in hertz (Hz).
    pub rate: u32,
    /// The channel assignments of the signal. The order of the channels in the mask is the order
    /// of the planes in an `AudioBuffer`.
    pub channels: Channels,
}

impl SignalSpec {
    pub fn new(rate: u32, channels: Channels) -> Self {
        SignalSpec { rate, channels }
    }
}

/// `AudioBuffer` is a container providing typed, planar storage for multi-channel audio.
///
/// The buffer is allocated for a maximum capacity of frames and rendered up to a per-decode frame
/// count. A frame is one sample from every channel at one instant.
#[derive(Clone)]
pub struct AudioBuffer<S: Sample> {
    buf: Vec<S>,
    spec: SignalSpec,
    n_frames: usize,
    n_capacity: usize,
}

impl<S: Sample> AudioBuffer<S> {
    /// Instantiate a new `AudioBuffer` using the specified signal specification and of the given
    /// duration in frames.
    pub fn new(duration: u64, spec: SignalSpec) -> Self {
        let n_capacity = duration as usize;

        AudioBuffer {
            buf: vec![S::MID; n_capacity * spec.channels.count()],
            spec,
            n_frames: 0,
            n_capacity,
        }
    }

    /// Instantiates an unused `AudioBuffer`. An unused `AudioBuffer` will not allocate any memory,
    /// and cannot be rendered to.
    pub fn unused() -> Self {
        AudioBuffer {
            buf: Vec::new(),
            spec: SignalSpec::new(0, Channels::empty()),
            n_frames: 0,
            n_capacity: 0,
        }
    }

    /// Returns `true` if the `AudioBuffer` is unused.
    pub fn is_unused(&self) -> bool {
        self.n_capacity == 0
    }

    /// Gets the signal specification for the buffer.
    pub fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    /// Gets the total capacity of the buffer in frames.
    pub fn capacity(&self) -> usize {
        self.n_capacity
    }

    /// Clears all rendered frames.
    pub fn clear(&mut self) {
        self.n_frames = 0;
    }
}

/// The `Signal` trait provides methods for rendering and transforming the contents of an audio
/// buffer.
pub trait Signal<S: Sample> {
    /// Gets the number of actual frames written to the buffer.
    fn frames(&self) -> usize;

    /// Gets an immutable reference to all written samples in the specified channel.
    fn chan(&self, channel: usize) -> &[S];

    /// Gets a mutable reference to all written samples in the specified channel.
    fn chan_mut(&mut self, channel: usize) -> &mut [S];

    /// Gets two mutable references to two different channels.
    fn chan_pair_mut(&mut self, first: usize, second: usize) -> (&mut [S], &mut [S]);

    /// Renders a number of silent frames.
    ///
    /// If `n_frames` is `None`, the remaining number of frames will be rendered.
    fn render_silence(&mut self, n_frames: Option<usize>);

    /// Renders a reserved number of frames. The contents of the reserved frames are the contents
    /// of a previous render, and must be overwritten by the caller.
    fn render_reserved(&mut self, n_frames: Option<usize>);

    /// Truncates the buffer to the specified number of frames. If the number of frames is larger
    /// than the number of rendered frames, the operation does nothing.
    fn truncate(&mut self, n_frames: usize);

    /// Transforms every rendered sample with the provided function.
    fn transform<F>(&mut self, f: F)
    where
        F: Fn(S) -> S;
}

impl<S: Sample> Signal<S> for AudioBuffer<S> {
    fn frames(&self) -> usize {
        self.n_frames
    }

    fn chan(&self, channel: usize) -> &[S] {
        let start = channel * self.n_capacity;
        &self.buf[start..start + self.n_frames]
    }

    fn chan_mut(&mut self, channel: usize) -> &mut [S] {
        let start = channel * self.n_capacity;
        &mut self.buf[start..start + self.n_frames]
    }

    fn chan_pair_mut(&mut self, first: usize, second: usize) -> (&mut [S], &mut [S]) {
        assert!(first != second);

        let first_idx = self.n_capacity * first;
        let second_idx = self.n_capacity * second;

        if first_idx < second_idx {
            let (a, b) = self.buf.split_at_mut(second_idx);
            (&mut a[first_idx..first_idx + self.n_frames], &mut b[..self.n_frames])
        }
        else {
            let (a, b) = self.buf.split_at_mut(first_idx);
            (&mut b[..self.n_frames], &mut a[second_idx..second_idx + self.n_frames])
        }
    }

    fn render_silence(&mut self, n_frames: Option<usize>) {
        let n_silent_frames = n_frames.unwrap_or(self.n_capacity - self.n_frames);

        assert!(self.n_frames + n_silent_frames <= self.n_capacity);

        for channel in 0..self.spec.channels.count() {
            let start = channel * self.n_capacity + self.n_frames;
            self.buf[start..start + n_silent_frames].fill(S::MID);
        }

        self.n_frames += n_silent_frames;
    }

    fn render_reserved(&mut self, n_frames: Option<usize>) {
        let n_reserved_frames = n_frames.unwrap_or(self.n_capacity - self.n_frames);

        assert!(self.n_frames + n_reserved_frames <= self.n_capacity);

        self.n_frames += n_reserved_frames;
    }

    fn truncate(&mut self, n_frames: usize) {
        if n_frames < self.n_frames {
            self.n_frames = n_frames;
        }
    }

    fn transform<F>(&mut self, f: F)
    where
        F: Fn(S) -> S,
    {
        debug_assert!(self.n_frames <= self.n_capacity);

        for channel in 0..self.spec.channels.count() {
            let start = channel * self.n_capacity;
            for sample in &mut self.buf[start..start + self.n_frames] {
                *sample = f(*sample);
            }
        }
    }
}

/// `AudioBufferRef` is a copy-on-write reference to an `AudioBuffer` of any type.
pub enum AudioBufferRef<'a> {
    S16(&'a AudioBuffer<i16>),
    S32(&'a AudioBuffer<i32>),
}

impl<'a> AudioBufferRef<'a> {
    pub fn spec(&self) -> &SignalSpec {
        match self {
            AudioBufferRef::S16(buf) => buf.spec(),
            AudioBufferRef::S32(buf) => buf.spec(),
        }
    }

    pub fn frames(&self) -> usize {
        match self {
            AudioBufferRef::S16(buf) => buf.frames(),
            AudioBufferRef::S32(buf) => buf.frames(),
        }
    }
}

/// `AsAudioBufferRef` is a trait implemented for `AudioBuffer`s that may be referenced in an
/// `AudioBufferRef`.
pub trait AsAudioBufferRef {
    /// Get an `AudioBufferRef` reference.
    fn as_audio_buffer_ref(&self) -> AudioBufferRef<'_>;
}

impl AsAudioBufferRef for AudioBuffer<i16> {
    fn as_audio_buffer_ref(&self) -> AudioBufferRef<'_> {
        AudioBufferRef::S16(self)
    }
}

impl AsAudioBufferRef for AudioBuffer<i32> {
    fn as_audio_buffer_ref(&self) -> AudioBufferRef<'_> {
        AudioBufferRef::S32(self)
    }
}
