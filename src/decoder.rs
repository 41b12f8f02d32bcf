// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Types exchanged between the decoder and the surrounding pipeline.

pub mod stateless;

use std::fmt;
use std::sync::Arc;

use crate::pool::PooledBuffer;
use crate::DecodedFormat;
use crate::Rect;
use crate::Resolution;

/// Stream parameters, as negotiated with the accelerator after a new sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    /// Pixel format of the decoded frames.
    pub format: DecodedFormat,
    /// Coded size of the stream, i.e. the size of the decoded frames.
    pub coded_resolution: Resolution,
    /// Area of the decoded frames that is meant to be displayed.
    pub visible_rect: Rect,
    /// Minimum number of output frames required for decoding to proceed.
    pub min_num_frames: usize,
}

/// How decoded frames are handed to the downstream pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// The accelerator buffer is handed over as-is.
    #[default]
    Passthrough,
    /// The visible area of the frame is copied into system memory.
    Copy,
}

/// What the downstream pipeline has advertised about the buffers it accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownstreamInfo {
    /// Whether downstream can consume accelerator buffers directly.
    pub supports_native: bool,
    /// Number of buffers downstream holds on to.
    pub min_buffers: usize,
}

/// Memory backing a decoded frame.
pub enum FrameMemory<F> {
    /// The accelerator buffer itself. It goes back to its pool once downstream and all the
    /// pictures that reference it have dropped it.
    Native(Arc<PooledBuffer<F>>),
    /// An unpadded NV12 copy of the visible area.
    System(Vec<u8>),
}

/// A decoded picture, ready to be consumed downstream.
pub struct DecodedFrame<F> {
    /// Decode-order identifier of the picture.
    pub id: u64,
    pub timestamp: u64,
    pub resolution: Resolution,
    pub visible_rect: Rect,
    pub memory: FrameMemory<F>,
}

impl<F> fmt::Debug for DecodedFrame<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let memory = match &self.memory {
            FrameMemory::Native(_) => "native".to_string(),
            FrameMemory::System(data) => format!("{} bytes", data.len()),
        };
        f.debug_struct("DecodedFrame")
            .field("id", &self.id)
            .field("timestamp", &self.timestamp)
            .field("resolution", &self.resolution)
            .field("visible_rect", &self.visible_rect)
            .field("memory", &memory)
            .finish()
    }
}

impl<F> DecodedFrame<F> {
    /// Returns the system memory copy of the frame, if the frame has been copied out.
    pub fn system_memory(&self) -> Option<&[u8]> {
        match &self.memory {
            FrameMemory::System(data) => Some(data),
            FrameMemory::Native(_) => None,
        }
    }
}
