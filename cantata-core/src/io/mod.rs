// Cantata
// Copyright (c) 2025 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `io` module implements bitstream reading over in-memory buffers.
//!
//! All Cantata decoders consume byte-aligned packets. Within a packet, fields are read with a
//! [`BitReader`] which tracks an absolute bit cursor so that byte-exact section boundaries (and
//! the checksums protecting them) can be enforced.

mod bit;

pub use bit::BitReader;
