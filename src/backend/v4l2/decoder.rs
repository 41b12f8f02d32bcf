// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::time::Duration;

use crate::device::v4l2::stateless::device::StreamFormat;
use crate::DecodedFormat;
use crate::Rect;
use crate::Resolution;

/// Frames allocated on top of what the DPB and downstream need, so the decoder does not stall
/// waiting for a frame to be returned.
pub const ADDITIONAL_REFERENCE_FRAME_BUFFER: usize = 4;

pub mod stateless;

pub trait V4l2StreamInfo {
    /// Returns the maximum number of frames held by the DPB.
    fn max_dpb_frames(&self) -> usize;
    /// Returns the coded size of the surfaces required to decode the stream.
    fn coded_size(&self) -> Resolution;
    /// Returns the visible rectangle within the coded size for the stream.
    fn visible_rect(&self) -> Rect;
    fn bit_depth(&self) -> u8;
    fn chroma_format_idc(&self) -> u8;

    fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            coded_resolution: self.coded_size(),
            visible_rect: self.visible_rect(),
            bit_depth: self.bit_depth(),
            chroma_format_idc: self.chroma_format_idc(),
            max_dpb_size: self.max_dpb_frames(),
        }
    }
}

/// Tunables of the stateless decoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    /// How long to wait for the device to complete a request before giving up.
    pub poll_timeout: Duration,
    /// Size of each bitstream buffer. A picture larger than this cannot be decoded.
    pub bitstream_block_size: usize,
    /// Bitstream buffers allocated on top of the device minimum.
    pub bitstream_headroom: usize,
    /// Extra bitstream buffers covering requests still held by the device.
    pub bitstream_margin: usize,
    /// Frames allocated on top of the DPB size and the downstream minimum.
    pub picture_headroom: usize,
    /// Frames held by downstream, until the allocation decision says otherwise.
    pub downstream_min_buffers: usize,
    /// Pixel format of the decoded frames.
    pub format: DecodedFormat,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            bitstream_block_size: 1024 * 1024,
            bitstream_headroom: 2,
            bitstream_margin: 1,
            picture_headroom: ADDITIONAL_REFERENCE_FRAME_BUFFER,
            downstream_min_buffers: 0,
            format: DecodedFormat::NV12,
        }
    }
}
