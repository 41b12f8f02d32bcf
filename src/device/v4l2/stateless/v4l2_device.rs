// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`StatelessDevice`] implementation on top of a V4L2 video node and its media controller.

use std::collections::BTreeMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::fd::AsFd;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use log::debug;
use v4l2r::bindings::v4l2_ctrl_h264_decode_params;
use v4l2r::bindings::v4l2_ctrl_h264_pps;
use v4l2r::bindings::v4l2_ctrl_h264_scaling_matrix;
use v4l2r::bindings::v4l2_ctrl_h264_sps;
use v4l2r::controls::codec::H264DecodeMode;
use v4l2r::controls::codec::H264DecodeParams;
use v4l2r::controls::codec::H264Pps;
use v4l2r::controls::codec::H264ScalingMatrix;
use v4l2r::controls::codec::H264Sps;
use v4l2r::controls::codec::H264StartCode;
use v4l2r::controls::ExtControlTrait;
use v4l2r::controls::SafeExtControl;
use v4l2r::device::queue::direction::Capture;
use v4l2r::device::queue::dqbuf::DqBuffer;
use v4l2r::device::Device as VideoDevice;
use v4l2r::device::DeviceConfig;
use v4l2r::ioctl;
use v4l2r::ioctl::BufferFlags;
use v4l2r::memory::MmapHandle;

use crate::device::v4l2::stateless::controls::h264::H264ControlBatch;
use crate::device::v4l2::stateless::device::DeviceError;
use crate::device::v4l2::stateless::device::DeviceResult;
use crate::device::v4l2::stateless::device::FrameLayout;
use crate::device::v4l2::stateless::device::StatelessDevice;
use crate::device::v4l2::stateless::device::StreamFormat;
use crate::device::v4l2::stateless::queue::buffer_id;
use crate::device::v4l2::stateless::queue::V4l2CaptureQueue;
use crate::device::v4l2::stateless::queue::V4l2OutputQueue;

/// OUTPUT buffers allocated, enough to cover every bitstream buffer in flight.
const NUM_OUTPUT_BUFFERS: u32 = 16;

/// A CAPTURE buffer, identified by its index in the queue.
#[derive(Debug)]
pub struct V4l2Frame {
    index: usize,
}

impl V4l2Frame {
    pub fn index(&self) -> usize {
        self.index
    }
}

pub struct V4l2RequestHandle {
    handle: ioctl::Request,
}

impl V4l2RequestHandle {
    fn which(&self) -> ioctl::CtrlWhich {
        ioctl::CtrlWhich::Request(self.handle.as_raw_fd())
    }
}

pub struct V4l2Device {
    video_device: Arc<VideoDevice>,
    media_device: File,
    output_queue: V4l2OutputQueue,
    capture_queue: V4l2CaptureQueue,
    num_frames: u32,
    /// Decoded CAPTURE buffers, kept until they are queued again.
    decoded: BTreeMap<usize, DqBuffer<Capture, Vec<MmapHandle>>>,
}

fn v4l2_error(e: impl Into<anyhow::Error>) -> DeviceError {
    DeviceError::Other(e.into())
}

impl V4l2Device {
    /// Opens the decoder at `video_path`, whose requests are allocated from `media_path`.
    pub fn open(video_path: &Path, media_path: &Path) -> anyhow::Result<Self> {
        let config = DeviceConfig::new().non_blocking_dqbuf();
        let video_device = Arc::new(
            VideoDevice::open(video_path, config)
                .with_context(|| format!("opening {}", video_path.display()))?,
        );
        let media_device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(media_path)
            .with_context(|| format!("opening {}", media_path.display()))?;

        Ok(Self {
            output_queue: V4l2OutputQueue::new(Arc::clone(&video_device))?,
            capture_queue: V4l2CaptureQueue::new(Arc::clone(&video_device))?,
            video_device,
            media_device,
            num_frames: 0,
            decoded: BTreeMap::new(),
        })
    }

    fn set_control<C, T>(&self, request: &V4l2RequestHandle, ctrl: C) -> DeviceResult<()>
    where
        C: Into<SafeExtControl<T>>,
        T: ExtControlTrait,
    {
        let mut ctrl: SafeExtControl<T> = ctrl.into();
        ioctl::s_ext_ctrls(&*self.video_device, request.which(), &mut ctrl).map_err(v4l2_error)?;
        Ok(())
    }
}

impl StatelessDevice for V4l2Device {
    type Request = V4l2RequestHandle;
    type Frame = V4l2Frame;

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.video_device.as_fd()
    }

    fn configure(&mut self, format: &StreamFormat) -> DeviceResult<()> {
        if self.output_queue.is_streaming() || self.capture_queue.is_streaming() {
            return Err(DeviceError::InvalidState("cannot configure while streaming"));
        }

        self.output_queue.set_coded_size(format.coded_resolution)?;
        self.capture_queue.set_nv12()?;
        self.num_frames = 0;
        self.decoded.clear();

        Ok(())
    }

    fn frame_layout(&self) -> DeviceResult<FrameLayout> {
        Ok(self.capture_queue.layout()?)
    }

    fn min_num_frames(&self) -> usize {
        // TODO: query V4L2_CID_MIN_BUFFERS_FOR_CAPTURE once v4l2r exposes it as a typed control.
        1
    }

    fn min_num_bitstream(&self) -> usize {
        2
    }

    fn allocate_frame(&mut self, index: usize) -> DeviceResult<Self::Frame> {
        // CAPTURE buffers are allocated all at once when streaming starts.
        self.num_frames = self.num_frames.max(index as u32 + 1);
        Ok(V4l2Frame { index })
    }

    fn stream_on(&mut self) -> DeviceResult<()> {
        self.output_queue.stream_on(NUM_OUTPUT_BUFFERS)?;
        self.capture_queue.stream_on(self.num_frames)?;
        Ok(())
    }

    fn stream_off(&mut self) -> DeviceResult<()> {
        self.decoded.clear();
        self.output_queue.stream_off()?;
        self.capture_queue.stream_off()?;
        Ok(())
    }

    fn alloc_request(&mut self) -> DeviceResult<Self::Request> {
        let handle = ioctl::Request::alloc(&self.media_device).map_err(v4l2_error)?;
        Ok(V4l2RequestHandle { handle })
    }

    fn set_controls(
        &mut self,
        request: &mut Self::Request,
        controls: &H264ControlBatch,
    ) -> DeviceResult<()> {
        let sps = v4l2_ctrl_h264_sps::from(&controls.sps);
        self.set_control(request, SafeExtControl::<H264Sps>::from(sps))?;
        let pps = v4l2_ctrl_h264_pps::from(&controls.pps);
        self.set_control(request, SafeExtControl::<H264Pps>::from(pps))?;
        self.set_control(
            request,
            SafeExtControl::<H264ScalingMatrix>::from(v4l2_ctrl_h264_scaling_matrix::from(
                &controls.scaling_matrix,
            )),
        )?;
        self.set_control(
            request,
            SafeExtControl::<H264DecodeParams>::from(v4l2_ctrl_h264_decode_params::from(
                &controls.decode_params,
            )),
        )?;
        // Slice parameters are only read by drivers in slice-based mode.
        self.set_control(
            request,
            SafeExtControl::<H264DecodeMode>::from_value(controls.decode_mode as i32),
        )?;
        self.set_control(
            request,
            SafeExtControl::<H264StartCode>::from_value(controls.start_code as i32),
        )?;

        Ok(())
    }

    fn queue_bitstream(
        &mut self,
        request: &mut Self::Request,
        id: u64,
        data: &[u8],
    ) -> DeviceResult<()> {
        self.output_queue.drain()?;
        self.output_queue.queue_bitstream(id, request.handle.as_raw_fd(), data)?;
        Ok(())
    }

    fn queue_frame(
        &mut self,
        _request: &mut Self::Request,
        id: u64,
        frame: &Self::Frame,
    ) -> DeviceResult<()> {
        // Frames are not part of the request, they only need to be queued before it runs.
        self.decoded.remove(&frame.index);
        self.capture_queue.queue_frame(frame.index)?;
        debug!("{:<20} {:?} into frame {}", "queue_frame", id, frame.index);
        Ok(())
    }

    fn submit(&mut self, request: &mut Self::Request) -> DeviceResult<()> {
        request.handle.queue().map_err(v4l2_error)?;
        Ok(())
    }

    fn dequeue(&mut self) -> DeviceResult<Option<u64>> {
        let Some(buffer) = self.capture_queue.try_dequeue()? else {
            return Ok(None);
        };

        let id = buffer_id(&buffer);
        let index = buffer.data.index() as usize;
        if buffer.data.flags().contains(BufferFlags::ERROR) {
            return Err(DeviceError::Other(anyhow!("picture {} failed to decode", id)));
        }
        self.decoded.insert(index, buffer);

        Ok(Some(id))
    }

    fn flush(&mut self) -> DeviceResult<()> {
        let num_frames = self.num_frames;
        self.stream_off()?;
        self.output_queue.stream_on(NUM_OUTPUT_BUFFERS)?;
        self.capture_queue.stream_on(num_frames)?;
        Ok(())
    }

    fn read_frame(&mut self, frame: &Self::Frame, dst: &mut [u8]) -> DeviceResult<()> {
        let buffer = self
            .decoded
            .get(&frame.index)
            .ok_or(DeviceError::InvalidState("frame is not decoded"))?;
        let mapping = buffer
            .get_plane_mapping(0)
            .ok_or_else(|| anyhow!("cannot map frame {}", frame.index))?;
        let len = mapping.as_ref().len().min(dst.len());
        dst[..len].copy_from_slice(&mapping.as_ref()[..len]);

        Ok(())
    }
}
