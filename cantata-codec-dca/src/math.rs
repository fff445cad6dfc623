// Cantata
// Copyright (c) 2025 The Project Cantata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-point arithmetic helpers.
//!
//! Samples are signed 32-bit with 24 significant bits; intermediates accumulate in signed 64-bit.
//! Multiplies are rounded to the given number of fractional bits.

/// Rounds a 64-bit accumulator to `bits` fractional bits.
#[inline(always)]
pub fn norm(a: i64, bits: u32) -> i32 {
    if bits > 0 {
        ((a + (1i64 << (bits - 1))) >> bits) as i32
    }
    else {
        a as i32
    }
}

#[inline(always)]
fn mul(a: i32, b: i32, bits: u32) -> i32 {
    norm(i64::from(a) * i64::from(b), bits)
}

#[inline(always)]
pub fn norm16(a: i64) -> i32 {
    norm(a, 16)
}

#[inline(always)]
pub fn mul3(a: i32, b: i32) -> i32 {
    ((i64::from(a) * i64::from(b) + (1 << 2)) >> 3) as i32
}

#[inline(always)]
pub fn mul15(a: i32, b: i32) -> i32 {
    mul(a, b, 15)
}

#[inline(always)]
pub fn mul16(a: i32, b: i32) -> i32 {
    mul(a, b, 16)
}

#[inline(always)]
pub fn mul22(a: i32, b: i32) -> i32 {
    mul(a, b, 22)
}

#[inline(always)]
pub fn mul23(a: i32, b: i32) -> i32 {
    mul(a, b, 23)
}

/// Saturates to the signed 24-bit sample range.
#[inline(always)]
pub fn clip23(a: i32) -> i32 {
    a.clamp(-(1 << 23), (1 << 23) - 1)
}

/// `dst[i] -= mul15(src[i], coeff)`
pub fn vmul15_sub(dst: &mut [i32], src: &[i32], coeff: i32) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = d.wrapping_sub(mul15(s, coeff));
    }
}

/// `dst[i] += mul15(src[i], coeff)`
pub fn vmul15_add(dst: &mut [i32], src: &[i32], coeff: i32) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = d.wrapping_add(mul15(s, coeff));
    }
}

/// `dst[i] -= mul22(src[i], coeff)`
pub fn vmul22_sub(dst: &mut [i32], src: &[i32], coeff: i32) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = d.wrapping_sub(mul22(s, coeff));
    }
}

/// `dst[i] -= mul23(src[i], coeff)`
pub fn vmul23_sub(dst: &mut [i32], src: &[i32], coeff: i32) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = d.wrapping_sub(mul23(s, coeff));
    }
}

/// `dst[i] = mul15(dst[i], scale)`
pub fn vmul15(dst: &mut [i32], scale: i32) {
    for d in dst.iter_mut() {
        *d = mul15(*d, scale);
    }
}
