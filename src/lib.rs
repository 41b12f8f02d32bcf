// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Control plane of a stateless, hardware-accelerated H.264 decoder.
//!
//! The parser and reference bookkeeping live outside of this crate: they hand over parsed
//! parameter sets, slices and pictures through the [`StatelessH264DecoderBackend`] interface.
//! This crate translates them into fixed-layout control blocks, assembles the bitstream of each
//! coded picture, submits one request per picture to the accelerator and returns the decoded
//! pictures in the order they are asked for.
//!
//! [`StatelessH264DecoderBackend`]: crate::decoder::stateless::h264::StatelessH264DecoderBackend

pub mod backend;
pub mod codec;
pub mod decoder;
pub mod device;
pub mod pool;

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "v4l2")]
pub use v4l2r;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

impl From<Rect> for Resolution {
    fn from(value: Rect) -> Self {
        Self { width: value.width, height: value.height }
    }
}

/// A rectangle inside a frame, used for the visible area of the coded picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl From<((u32, u32), (u32, u32))> for Rect {
    fn from(value: ((u32, u32), (u32, u32))) -> Self {
        Self { x: value.0 .0, y: value.0 .1, width: value.1 .0, height: value.1 .1 }
    }
}

/// A FOURCC code identifying a pixel or coded format.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*n))
    }
}

impl From<Fourcc> for [u8; 4] {
    fn from(n: Fourcc) -> Self {
        n.0.to_le_bytes()
    }
}

impl fmt::Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes: [u8; 4] = (*self).into();
        write!(f, "{}", String::from_utf8_lossy(&bytes))
    }
}

impl fmt::Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x} ({})", self.0, self)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    NV12,
    I420,
}

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nv12" | "NV12" => Ok(DecodedFormat::NV12),
            "i420" | "I420" => Ok(DecodedFormat::I420),
            _ => Err("unrecognized output format. Valid values: nv12, i420"),
        }
    }
}

impl From<DecodedFormat> for Fourcc {
    fn from(format: DecodedFormat) -> Self {
        match format {
            DecodedFormat::NV12 => Fourcc::from(b"NV12"),
            DecodedFormat::I420 => Fourcc::from(b"YU12"),
        }
    }
}

/// Copies `src` into `dst` as NV12, removing any extra padding.
pub fn nv12_copy(
    src: &[u8],
    mut dst: &mut [u8],
    width: usize,
    height: usize,
    strides: [usize; 2],
    offsets: [usize; 2],
) {
    let mut src_plane = &src[offsets[0]..];

    // Copy luma
    for _ in 0..height {
        dst[..width].copy_from_slice(&src_plane[..width]);
        dst = &mut dst[width..];
        src_plane = &src_plane[strides[0].min(src_plane.len())..];
    }

    // Align width and height to 2 for UV plane.
    let width = if width % 2 == 1 { width + 1 } else { width };
    let height = if height % 2 == 1 { height + 1 } else { height };

    // 1 sample per 4 pixels, but we have two components per line.
    let height = height / 2;

    let mut src_plane = &src[offsets[1]..];

    // Copy chroma
    for _ in 0..height {
        dst[..width].copy_from_slice(&src_plane[..width]);
        dst = &mut dst[width..];
        src_plane = &src_plane[strides[1].min(src_plane.len())..];
    }
}

/// Returns the size required to store a frame of `format` with size `width`x`height`, without any
/// padding. This is the minimum size of the destination buffer passed to `nv12_copy`.
pub fn decoded_frame_size(format: DecodedFormat, width: usize, height: usize) -> usize {
    match format {
        DecodedFormat::I420 | DecodedFormat::NV12 => {
            let u_size = width * height;
            // U and V planes need to be aligned to 2.
            let uv_size = ((width + 1) / 2) * ((height + 1) / 2) * 2;

            u_size + uv_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display() {
        assert_eq!(Fourcc::from(b"S264").to_string(), "S264");
        assert_eq!(Fourcc::from(DecodedFormat::NV12), Fourcc::from(b"NV12"));
    }

    #[test]
    fn nv12_copy_strips_padding() {
        // 4x2 picture stored with a stride of 6.
        let src = [
            1, 1, 1, 1, 0, 0, //
            2, 2, 2, 2, 0, 0, //
            3, 4, 3, 4, 0, 0,
        ];
        let mut dst = vec![0u8; decoded_frame_size(DecodedFormat::NV12, 4, 2)];

        nv12_copy(&src, &mut dst, 4, 2, [6, 6], [0, 12]);

        assert_eq!(dst, [1, 1, 1, 1, 2, 2, 2, 2, 3, 4, 3, 4]);
    }

    #[test]
    fn resolution_containment() {
        let big = Resolution::from((1920, 1088));
        assert!(big.can_contain(Resolution::from((1920, 1080))));
        assert!(!Resolution::from((1280, 720)).can_contain(big));
    }
}
