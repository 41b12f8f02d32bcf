// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interface to a stateless decoding device.
//!
//! A device decodes one picture per request. A request carries the controls of the picture, its
//! bitstream and the frame to decode into, and completes asynchronously. Completions are reported
//! by the readiness of [`StatelessDevice::poll_fd`] and collected with
//! [`StatelessDevice::dequeue`], in whatever order the device finished them.

use std::os::fd::BorrowedFd;

use nix::errno::Errno;
use thiserror::Error;

use crate::device::v4l2::stateless::controls::h264::H264ControlBatch;
use crate::Rect;
use crate::Resolution;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{op} failed: {errno}")]
    Ioctl { op: &'static str, errno: Errno },
    #[error("device is in an invalid state: {0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeviceError {
    pub fn ioctl(op: &'static str) -> impl FnOnce(Errno) -> Self {
        move |errno| Self::Ioctl { op, errno }
    }
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Format of the coded stream, as derived from the active sequence parameter set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamFormat {
    pub coded_resolution: Resolution,
    pub visible_rect: Rect,
    pub bit_depth: u8,
    pub chroma_format_idc: u8,
    /// Maximum number of frames the DPB may hold.
    pub max_dpb_size: usize,
}

/// Memory layout of the decoded frames, as reported by the device after configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameLayout {
    /// Bytes per line of the luma and chroma planes.
    pub strides: [usize; 2],
    /// Offsets of the luma and chroma planes within the frame.
    pub offsets: [usize; 2],
    /// Total size of a frame, padding included.
    pub size: usize,
}

impl FrameLayout {
    /// Whether an NV12 frame with this layout holds all of `rect`.
    pub fn contains(&self, rect: &Rect) -> bool {
        let (x, y) = (rect.x as usize, rect.y as usize);
        let (width, height) = (rect.width as usize, rect.height as usize);
        if width == 0 || height == 0 {
            return true;
        }
        // Chroma samples cover pairs of pixels in both directions.
        let chroma_width = width + width % 2;
        let chroma_height = height.div_ceil(2);

        let luma_end = self.offsets[0] + (y + height - 1) * self.strides[0] + x + width;
        let chroma_end =
            self.offsets[1] + (y / 2 + chroma_height - 1) * self.strides[1] + x + chroma_width;

        self.strides[0] >= x + width
            && self.strides[1] >= x + chroma_width
            && luma_end <= self.size
            && chroma_end <= self.size
    }
}

pub trait StatelessDevice {
    /// Handle to a request being built.
    type Request;
    /// A frame that decoded pictures are written into.
    type Frame: Send + Sync + 'static;

    /// File descriptor that becomes readable when a request completes.
    fn poll_fd(&self) -> BorrowedFd<'_>;

    /// Applies `format` to the device. Streaming must be off.
    fn configure(&mut self, format: &StreamFormat) -> DeviceResult<()>;

    /// Layout of the frames for the current configuration.
    fn frame_layout(&self) -> DeviceResult<FrameLayout>;

    /// Minimum number of frames the device needs for the current configuration.
    fn min_num_frames(&self) -> usize;

    /// Minimum number of bitstream buffers the device needs.
    fn min_num_bitstream(&self) -> usize;

    /// Allocates the frame at `index` for the current configuration.
    fn allocate_frame(&mut self, index: usize) -> DeviceResult<Self::Frame>;

    fn stream_on(&mut self) -> DeviceResult<()>;

    fn stream_off(&mut self) -> DeviceResult<()>;

    /// Allocates a new, empty request.
    fn alloc_request(&mut self) -> DeviceResult<Self::Request>;

    /// Sets all the controls of `request` in one go.
    fn set_controls(
        &mut self,
        request: &mut Self::Request,
        controls: &H264ControlBatch,
    ) -> DeviceResult<()>;

    /// Registers the bitstream of picture `id` with `request`.
    fn queue_bitstream(
        &mut self,
        request: &mut Self::Request,
        id: u64,
        data: &[u8],
    ) -> DeviceResult<()>;

    /// Registers `frame` as the destination of picture `id`.
    fn queue_frame(&mut self, request: &mut Self::Request, id: u64, frame: &Self::Frame)
        -> DeviceResult<()>;

    /// Submits `request` for decoding. Nothing can be added to the request afterwards.
    fn submit(&mut self, request: &mut Self::Request) -> DeviceResult<()>;

    /// Returns the identifier of one completed picture, or `None` if no completion is pending.
    fn dequeue(&mut self) -> DeviceResult<Option<u64>>;

    /// Resets the device, discarding all pending requests.
    fn flush(&mut self) -> DeviceResult<()>;

    /// Copies the content of `frame` into `dst`, which must be at least
    /// [`FrameLayout::size`] bytes long.
    fn read_frame(&mut self, frame: &Self::Frame, dst: &mut [u8]) -> DeviceResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nv12_layout(stride: usize, height: usize) -> FrameLayout {
        FrameLayout {
            strides: [stride, stride],
            offsets: [0, stride * height],
            size: stride * height * 3 / 2,
        }
    }

    #[test]
    fn layout_contains_visible_area() {
        let layout = nv12_layout(64, 48);

        assert!(layout.contains(&Rect { x: 0, y: 0, width: 64, height: 48 }));
        assert!(layout.contains(&Rect { x: 2, y: 2, width: 59, height: 45 }));
        assert!(!layout.contains(&Rect { x: 0, y: 0, width: 65, height: 48 }));
        assert!(!layout.contains(&Rect { x: 0, y: 2, width: 64, height: 48 }));
        assert!(!FrameLayout::default().contains(&Rect { x: 0, y: 0, width: 2, height: 2 }));
    }
}
