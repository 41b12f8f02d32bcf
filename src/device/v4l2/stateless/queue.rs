// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! MMAP buffer queues of a V4L2 stateless decoder.

use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use log::debug;
use v4l2r::bindings::v4l2_format;
use v4l2r::device::queue::direction::Capture;
use v4l2r::device::queue::direction::Direction;
use v4l2r::device::queue::direction::Output;
use v4l2r::device::queue::dqbuf::DqBuffer;
use v4l2r::device::queue::BuffersAllocated;
use v4l2r::device::queue::GetFreeOutputBuffer;
use v4l2r::device::queue::Queue;
use v4l2r::device::queue::QueueInit;
use v4l2r::device::AllocatedQueue;
use v4l2r::device::Device;
use v4l2r::device::Stream;
use v4l2r::device::TryDequeue;
use v4l2r::ioctl;
use v4l2r::memory::MemoryType;
use v4l2r::memory::MmapHandle;
use v4l2r::nix::sys::time::TimeVal;
use v4l2r::Format;
use v4l2r::PixelFormat;
use v4l2r::PlaneLayout;

use crate::device::v4l2::stateless::device::FrameLayout;
use crate::Resolution;

type MmapQueue<D> = Queue<D, BuffersAllocated<Vec<MmapHandle>>>;

/// Size of each OUTPUT buffer. Bitstream buffers are copied into them.
pub const OUTPUT_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Default)]
enum QueueState<D: Direction> {
    Init(Queue<D, QueueInit>),
    Streaming(MmapQueue<D>),
    #[default]
    Invalid,
}

/// One MMAP queue, either being configured or streaming.
pub struct V4l2Queue<D: Direction> {
    name: &'static str,
    state: QueueState<D>,
}

impl<D: Direction> V4l2Queue<D> {
    fn init_queue(&mut self) -> anyhow::Result<&mut Queue<D, QueueInit>> {
        match &mut self.state {
            QueueState::Init(queue) => Ok(queue),
            QueueState::Streaming(_) => Err(anyhow!("{} queue is streaming", self.name)),
            QueueState::Invalid => Err(anyhow!("{} queue is invalid", self.name)),
        }
    }

    fn streaming_queue(&self) -> anyhow::Result<&MmapQueue<D>> {
        match &self.state {
            QueueState::Streaming(queue) => Ok(queue),
            _ => Err(anyhow!("{} queue is not streaming", self.name)),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.state, QueueState::Streaming(_))
    }

    pub fn format(&self) -> anyhow::Result<Format> {
        let format = match &self.state {
            QueueState::Init(queue) => queue.get_format()?,
            QueueState::Streaming(queue) => queue.get_format()?,
            QueueState::Invalid => return Err(anyhow!("{} queue is invalid", self.name)),
        };
        Ok(format)
    }

    /// Allocates `num_buffers` buffers and starts streaming.
    pub fn stream_on(&mut self, num_buffers: u32) -> anyhow::Result<()> {
        let queue = match std::mem::take(&mut self.state) {
            QueueState::Init(queue) => queue,
            state => {
                self.state = state;
                return Err(anyhow!("{} queue cannot be started twice", self.name));
            }
        };

        let queue = queue
            .request_buffers_generic::<Vec<MmapHandle>>(MemoryType::Mmap, num_buffers)
            .with_context(|| format!("requesting {} buffers", self.name))?;
        queue.stream_on().with_context(|| format!("starting {} queue", self.name))?;
        debug!("{} queue: streaming with {} buffers", self.name, queue.num_buffers());

        self.state = QueueState::Streaming(queue);
        Ok(())
    }

    /// Stops streaming and frees all the buffers. Queued buffers are discarded.
    pub fn stream_off(&mut self) -> anyhow::Result<()> {
        let queue = match std::mem::take(&mut self.state) {
            QueueState::Streaming(queue) => queue,
            state => {
                self.state = state;
                return Ok(());
            }
        };

        queue.stream_off().with_context(|| format!("stopping {} queue", self.name))?;
        let queue = queue
            .free_buffers()
            .map_err(|e| anyhow!("freeing {} buffers: {}", self.name, e))?
            .queue;
        debug!("{} queue: stopped", self.name);

        self.state = QueueState::Init(queue);
        Ok(())
    }

    pub fn try_dequeue(&self) -> anyhow::Result<Option<DqBuffer<D, Vec<MmapHandle>>>> {
        let queue = self.streaming_queue()?;
        if queue.num_queued_buffers() == 0 {
            return Ok(None);
        }
        ready_buffer(queue.try_dequeue())
            .with_context(|| format!("dequeuing {} buffer", self.name))
    }
}

pub type V4l2OutputQueue = V4l2Queue<Output>;

impl V4l2OutputQueue {
    pub fn new(device: Arc<Device>) -> anyhow::Result<Self> {
        let queue = Queue::get_output_mplane_queue(device).context("getting OUTPUT queue")?;
        Ok(Self { name: "OUTPUT", state: QueueState::Init(queue) })
    }

    pub fn set_coded_size(&mut self, resolution: Resolution) -> anyhow::Result<()> {
        let queue = self.init_queue()?;
        let (width, height) = resolution.into();

        queue
            .change_format()?
            .set_size(width as usize, height as usize)
            .set_pixelformat(PixelFormat::from_fourcc(b"S264"))
            .set_planes_layout(vec![PlaneLayout {
                sizeimage: OUTPUT_BUFFER_SIZE as u32,
                ..Default::default()
            }])
            .apply::<v4l2_format>()
            .context("applying OUTPUT format")?;
        debug!("OUTPUT format: {:?}", queue.get_format::<Format>()?);

        Ok(())
    }

    /// Copies `data` into a free buffer and queues it as part of the request `request_fd`.
    pub fn queue_bitstream(&self, id: u64, request_fd: i32, data: &[u8]) -> anyhow::Result<()> {
        let queue = self.streaming_queue()?;
        let buffer = queue
            .try_get_free_buffer()
            .map_err(|e| anyhow!("no free OUTPUT buffer: {}", e))?;

        let mut mapping = buffer.get_plane_mapping(0).context("mapping OUTPUT buffer")?;
        let dst = mapping
            .as_mut()
            .get_mut(..data.len())
            .ok_or_else(|| anyhow!("{} bytes do not fit in an OUTPUT buffer", data.len()))?;
        dst.copy_from_slice(data);
        drop(mapping);

        // The timestamp identifies the picture and is copied to the CAPTURE buffer.
        let timestamp = TimeVal::new((id / 1_000_000) as i64, (id % 1_000_000) as i64);
        buffer
            .set_timestamp(timestamp)
            .set_request(request_fd)
            .queue(&[data.len()])
            .map_err(|e| anyhow!("queuing OUTPUT buffer: {}", e))?;

        Ok(())
    }

    /// Recycles the OUTPUT buffers the device is done with.
    pub fn drain(&self) -> anyhow::Result<usize> {
        let mut count = 0;
        while self.try_dequeue()?.is_some() {
            count += 1;
        }
        Ok(count)
    }
}

pub type V4l2CaptureQueue = V4l2Queue<Capture>;

impl V4l2CaptureQueue {
    pub fn new(device: Arc<Device>) -> anyhow::Result<Self> {
        let queue = Queue::get_capture_mplane_queue(device).context("getting CAPTURE queue")?;
        Ok(Self { name: "CAPTURE", state: QueueState::Init(queue) })
    }

    /// Selects NV12 output for the negotiated stream.
    pub fn set_nv12(&mut self) -> anyhow::Result<()> {
        let queue = self.init_queue()?;
        queue
            .change_format()?
            .set_pixelformat(PixelFormat::from_fourcc(b"NV12"))
            .apply::<v4l2_format>()
            .context("applying CAPTURE format")?;
        debug!("CAPTURE format: {:?}", queue.get_format::<Format>()?);

        Ok(())
    }

    pub fn layout(&self) -> anyhow::Result<FrameLayout> {
        let format = self.format()?;
        let plane = format.plane_fmt.first().ok_or_else(|| anyhow!("CAPTURE format has no plane"))?;
        let stride = plane.bytesperline as usize;

        Ok(FrameLayout {
            strides: [stride, stride],
            offsets: [0, stride * format.height as usize],
            size: plane.sizeimage as usize,
        })
    }

    /// Queues the buffer at `index` to receive a decoded picture.
    pub fn queue_frame(&self, index: usize) -> anyhow::Result<()> {
        let queue = self.streaming_queue()?;
        let buffer = queue
            .try_get_buffer(index)
            .map_err(|e| anyhow!("CAPTURE buffer {} is not free: {}", index, e))?;
        buffer.queue().map_err(|e| anyhow!("queuing CAPTURE buffer {}: {}", index, e))?;

        Ok(())
    }
}

/// Sorts the result of a non-blocking dequeue: only `EAGAIN` means that nothing is ready yet.
fn ready_buffer<B, E: std::fmt::Debug>(
    res: Result<B, ioctl::DqBufError<E>>,
) -> anyhow::Result<Option<B>> {
    match res {
        Ok(buffer) => Ok(Some(buffer)),
        Err(ioctl::DqBufError::IoctlError(ioctl::DqBufIoctlError::NotReady)) => Ok(None),
        Err(e) => Err(anyhow!("{:?}", e)),
    }
}

/// Picture identifier carried by the timestamp of a dequeued buffer.
pub fn buffer_id<D: Direction>(buffer: &DqBuffer<D, Vec<MmapHandle>>) -> u64 {
    let timestamp = buffer.data.timestamp();
    timestamp.tv_sec as u64 * 1_000_000 + timestamp.tv_usec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    type DqResult = Result<u32, ioctl::DqBufError<String>>;

    #[test]
    fn only_not_ready_means_no_buffer() {
        assert_eq!(ready_buffer(DqResult::Ok(3)).unwrap(), Some(3));

        let not_ready =
            DqResult::Err(ioctl::DqBufError::IoctlError(ioctl::DqBufIoctlError::NotReady));
        assert_eq!(ready_buffer(not_ready).unwrap(), None);

        let eos = DqResult::Err(ioctl::DqBufError::IoctlError(ioctl::DqBufIoctlError::Eos));
        assert!(ready_buffer(eos).is_err());
    }
}
