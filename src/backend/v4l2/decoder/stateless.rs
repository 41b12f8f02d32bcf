// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use anyhow::anyhow;
use log::debug;
use log::error;
use log::warn;

use crate::backend::v4l2::decoder::DecoderConfig;
use crate::codec::h264::dpb::SharedDpb;
use crate::decoder::stateless::DecodePhase;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::DecodedFrame;
use crate::decoder::DownstreamInfo;
use crate::decoder::FrameMemory;
use crate::decoder::OutputMode;
use crate::decoder::StreamInfo;
use crate::decoded_frame_size;
use crate::device::v4l2::stateless::bitstream::BitstreamAssembler;
use crate::device::v4l2::stateless::bitstream::BitstreamPool;
use crate::device::v4l2::stateless::completion::CompletionReconciler;
use crate::device::v4l2::stateless::completion::FlushSignal;
use crate::device::v4l2::stateless::controls::h264::H264ControlBatch;
use crate::device::v4l2::stateless::device::StatelessDevice;
use crate::device::v4l2::stateless::device::StreamFormat;
use crate::device::v4l2::stateless::request::V4l2Request;
use crate::nv12_copy;
use crate::pool::BufferPool;
use crate::pool::PoolError;
use crate::pool::PoolStats;
use crate::pool::PooledBuffer;
use crate::Resolution;

/// A destination frame, shared between the picture decoded into it, the pictures using it as a
/// reference and downstream.
pub type SharedFrame<F> = Arc<PooledBuffer<F>>;

pub struct V4l2Picture<D: StatelessDevice> {
    request: V4l2Request<D>,
    timestamp: u64,
    frame: SharedFrame<D::Frame>,
    // The device reads the reference frames until the request completes, so they must not go
    // back to the pool before that even if nothing else holds them anymore.
    ref_frames: Vec<SharedFrame<D::Frame>>,
    harvested: bool,
}

impl<D: StatelessDevice> V4l2Picture<D> {
    pub fn new(
        request: V4l2Request<D>,
        timestamp: u64,
        frame: SharedFrame<D::Frame>,
        ref_frames: Vec<SharedFrame<D::Frame>>,
    ) -> Self {
        Self { request, timestamp, frame, ref_frames, harvested: false }
    }

    /// Decode-order identifier of the picture.
    pub fn id(&self) -> u64 {
        self.request.id()
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn frame(&self) -> &SharedFrame<D::Frame> {
        &self.frame
    }

    pub fn num_ref_frames(&self) -> usize {
        self.ref_frames.len()
    }

    pub fn is_done(&self) -> bool {
        self.request.is_done()
    }

    /// Records the completion of the picture, releasing what only the device needed.
    pub fn mark_done(&mut self) -> StatelessBackendResult<()> {
        self.request.mark_done()?;
        self.ref_frames.clear();
        Ok(())
    }

    /// Returns the decoded frame. Can only be done once, after completion.
    pub fn harvest(&mut self) -> StatelessBackendResult<SharedFrame<D::Frame>> {
        if !self.is_done() {
            return Err(StatelessBackendError::InvalidState("picture not decoded yet"));
        }
        if self.harvested {
            return Err(StatelessBackendError::InvalidState("picture already output"));
        }
        self.harvested = true;

        Ok(Arc::clone(&self.frame))
    }
}

impl<D: StatelessDevice> fmt::Debug for V4l2Picture<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("V4l2Picture")
            .field("id", &self.id())
            .field("timestamp", &self.timestamp)
            .field("done", &self.is_done())
            .field("num_ref_frames", &self.ref_frames.len())
            .field("harvested", &self.harvested)
            .finish_non_exhaustive()
    }
}

/// Handle to a submitted picture, as stored in the DPB.
pub type V4l2PictureHandle<D> = Rc<RefCell<V4l2Picture<D>>>;

/// Picture between `start_picture` and `end_picture`.
pub(crate) struct CurrentPicture<T> {
    pub id: u64,
    pub timestamp: u64,
    pub dpb: T,
}

/// Cross-thread handle used to interrupt the decoder.
///
/// Starting a flush makes every blocked or future pool acquisition and completion wait return a
/// flushing error until the flush is stopped.
pub struct FlushHandle<F> {
    bitstream_pool: BitstreamPool,
    frame_pool: BufferPool<F>,
    signal: Arc<FlushSignal>,
}

impl<F> Clone for FlushHandle<F> {
    fn clone(&self) -> Self {
        Self {
            bitstream_pool: self.bitstream_pool.clone(),
            frame_pool: self.frame_pool.clone(),
            signal: Arc::clone(&self.signal),
        }
    }
}

impl<F> FlushHandle<F> {
    pub fn flush_start(&self) -> anyhow::Result<()> {
        debug!("flush start");
        self.bitstream_pool.set_flushing(true);
        self.frame_pool.set_flushing(true);
        self.signal.raise()
    }

    pub fn flush_stop(&self) -> anyhow::Result<()> {
        debug!("flush stop");
        self.signal.clear()?;
        self.bitstream_pool.set_flushing(false);
        self.frame_pool.set_flushing(false);
        Ok(())
    }

    pub fn is_flushing(&self) -> bool {
        self.frame_pool.is_flushing()
    }
}

fn negotiation_error(e: impl Into<anyhow::Error>) -> StatelessBackendError {
    StatelessBackendError::fatal(DecodePhase::Negotiation, e)
}

/// Logs errors about to be reported upstream.
pub(crate) fn report<T>(res: StatelessBackendResult<T>) -> StatelessBackendResult<T> {
    match &res {
        Err(e) if e.is_flushing() => warn!("aborted by flush"),
        Err(e) => error!("{}", e),
        Ok(_) => (),
    }
    res
}

pub struct V4l2StatelessDecoderBackend<D: StatelessDevice> {
    pub(crate) device: D,
    pub(crate) config: DecoderConfig,
    format: Option<StreamFormat>,
    stream_info: Option<StreamInfo>,
    pub(crate) bitstream_pool: BitstreamPool,
    pub(crate) frame_pool: BufferPool<D::Frame>,
    pub(crate) assembler: BitstreamAssembler,
    pub(crate) reconciler: CompletionReconciler<D>,
    /// Controls of the picture being assembled.
    pub(crate) controls: H264ControlBatch,
    pub(crate) current: Option<CurrentPicture<SharedDpb<V4l2PictureHandle<D>>>>,
    output_mode: OutputMode,
    downstream: DownstreamInfo,
    streaming: bool,
}

impl<D: StatelessDevice> V4l2StatelessDecoderBackend<D> {
    /// Creates a backend driving `device`, which becomes owned by the backend until it is dropped.
    pub fn new(device: D, config: DecoderConfig) -> anyhow::Result<Self> {
        let signal = Arc::new(FlushSignal::new()?);
        let reconciler = CompletionReconciler::new(&device, signal, config.poll_timeout)?;
        let downstream =
            DownstreamInfo { supports_native: true, min_buffers: config.downstream_min_buffers };

        Ok(Self {
            device,
            config,
            format: None,
            stream_info: None,
            bitstream_pool: BitstreamPool::new("bitstream"),
            frame_pool: BufferPool::new("picture"),
            assembler: BitstreamAssembler::new(),
            reconciler,
            controls: H264ControlBatch::new(),
            current: None,
            output_mode: OutputMode::Passthrough,
            downstream,
            streaming: false,
        })
    }

    pub fn stream_info(&self) -> Option<&StreamInfo> {
        self.stream_info.as_ref()
    }

    pub fn output_mode(&self) -> OutputMode {
        self.output_mode
    }

    pub fn bitstream_pool_stats(&self) -> PoolStats {
        self.bitstream_pool.stats()
    }

    pub fn frame_pool_stats(&self) -> PoolStats {
        self.frame_pool.stats()
    }

    pub fn flush_handle(&self) -> FlushHandle<D::Frame> {
        FlushHandle {
            bitstream_pool: self.bitstream_pool.clone(),
            frame_pool: self.frame_pool.clone(),
            signal: Arc::clone(self.reconciler.flush_signal()),
        }
    }

    fn num_frames(&self, format: &StreamFormat) -> usize {
        let needed =
            format.max_dpb_size + self.downstream.min_buffers + self.config.picture_headroom;
        needed.max(self.device.min_num_frames())
    }

    fn num_bitstream_buffers(&self) -> usize {
        self.device.min_num_bitstream()
            + self.config.bitstream_headroom
            + self.config.bitstream_margin
    }

    fn stream_off(&mut self) -> StatelessBackendResult<()> {
        if self.streaming {
            self.device.stream_off().map_err(negotiation_error)?;
            self.streaming = false;
            self.reconciler.clear();
            self.assembler.reset();
            self.current = None;
        }
        Ok(())
    }

    /// Configures the device and the pools for `format`. Does nothing if `format` is already in
    /// use. Returns whether the configuration changed.
    pub fn negotiate(&mut self, format: StreamFormat) -> StatelessBackendResult<bool> {
        if self.streaming && self.format.as_ref() == Some(&format) {
            debug!("format unchanged, skipping negotiation");
            return Ok(false);
        }

        debug!("negotiating {:?}", format);

        self.stream_off()?;
        self.format = None;
        self.device.configure(&format).map_err(negotiation_error)?;

        let num_bitstream = self.num_bitstream_buffers();
        let block_size = self.config.bitstream_block_size;
        self.bitstream_pool
            .attach(num_bitstream, |_| Ok(vec![0u8; block_size]))
            .map_err(negotiation_error)?;

        let num_frames = self.num_frames(&format);
        let device = &mut self.device;
        self.frame_pool
            .attach(num_frames, |index| Ok(device.allocate_frame(index)?))
            .map_err(negotiation_error)?;

        self.device.stream_on().map_err(negotiation_error)?;
        self.streaming = true;

        self.stream_info = Some(StreamInfo {
            format: self.config.format,
            coded_resolution: format.coded_resolution,
            visible_rect: format.visible_rect,
            min_num_frames: num_frames,
        });
        debug!("negotiated {} bitstream buffers, {} frames", num_bitstream, num_frames);
        self.format = Some(format);

        Ok(true)
    }

    /// Chooses how frames are handed downstream, and resizes the frame pool if downstream holds
    /// on to a different number of frames than assumed so far.
    pub fn decide_allocation(
        &mut self,
        downstream: DownstreamInfo,
    ) -> StatelessBackendResult<OutputMode> {
        self.output_mode =
            if downstream.supports_native { OutputMode::Passthrough } else { OutputMode::Copy };

        let resize = downstream.min_buffers != self.downstream.min_buffers;
        self.downstream = downstream;

        // Forgetting the format forces the pools to be sized again.
        if resize {
            if let Some(format) = self.format.take() {
                self.negotiate(format)?;
            }
        }

        debug!("output mode {:?}", self.output_mode);
        Ok(self.output_mode)
    }

    /// Enters flushing mode and resets the device. Pictures in flight are lost.
    pub fn flush_start(&mut self) -> StatelessBackendResult<()> {
        self.flush_handle()
            .flush_start()
            .map_err(|e| StatelessBackendError::fatal(DecodePhase::Flush, e))?;
        self.device.flush().map_err(|e| StatelessBackendError::fatal(DecodePhase::Flush, e))?;
        self.reconciler.clear();
        self.assembler.reset();
        self.current = None;
        Ok(())
    }

    /// Leaves flushing mode. Decoding can resume from the next key frame.
    pub fn flush_stop(&mut self) -> StatelessBackendResult<()> {
        self.flush_handle()
            .flush_stop()
            .map_err(|e| StatelessBackendError::fatal(DecodePhase::Flush, e))
    }

    /// Stops streaming and releases all the buffers.
    pub fn close(&mut self) -> StatelessBackendResult<()> {
        let res = self.stream_off();
        self.bitstream_pool.detach();
        self.frame_pool.detach();
        self.format = None;
        self.stream_info = None;
        res
    }

    /// Drops the picture being assembled.
    pub(crate) fn abort_picture(&mut self) {
        if let Some(current) = self.current.take() {
            debug!("{:<20} {:?}", "abort_picture", current.id);
        }
        self.assembler.reset();
    }

    /// Starts assembling a new bitstream, reclaiming completed requests if the pool is empty.
    pub(crate) fn start_bitstream(&mut self) -> StatelessBackendResult<()> {
        match self.assembler.start_picture(&self.bitstream_pool) {
            Err(StatelessBackendError::Fatal { phase: DecodePhase::Allocation, .. }) => {
                let reclaimed = self.reconciler.reclaim(&mut self.device)?;
                debug!("bitstream pool exhausted, reclaimed {} requests", reclaimed);
                self.assembler.start_picture(&self.bitstream_pool)
            }
            res => res,
        }
    }

    /// Takes a destination frame, waiting for one to be returned if none is free.
    ///
    /// Completed requests still pin their reference frames until they are dequeued, so these are
    /// reclaimed before blocking: nothing else on this thread would dequeue them.
    pub(crate) fn acquire_frame(&mut self) -> StatelessBackendResult<PooledBuffer<D::Frame>> {
        let frame = match self.frame_pool.try_acquire() {
            Err(PoolError::Exhausted) => {
                let reclaimed = self.reconciler.reclaim(&mut self.device)?;
                debug!("frame pool exhausted, reclaimed {} requests", reclaimed);
                self.frame_pool.acquire()
            }
            res => res,
        };

        frame.map_err(|e| match e {
            PoolError::Flushing => StatelessBackendError::Flushing,
            e => StatelessBackendError::fatal(DecodePhase::Queuing, e),
        })
    }

    /// Waits for `handle` to be decoded and hands its frame over.
    pub(crate) fn harvest(
        &mut self,
        handle: &V4l2PictureHandle<D>,
    ) -> StatelessBackendResult<DecodedFrame<D::Frame>> {
        let (id, done) = {
            let picture = handle.borrow();
            (picture.id(), picture.is_done())
        };

        if !done {
            self.reconciler.wait_for(&mut self.device, id)?;
            handle.borrow_mut().mark_done()?;
        }

        let (frame, timestamp) = {
            let mut picture = handle.borrow_mut();
            (picture.harvest()?, picture.timestamp())
        };
        let info = self
            .stream_info
            .as_ref()
            .ok_or(StatelessBackendError::InvalidState("no stream negotiated"))?;
        let resolution = info.coded_resolution;
        let visible_rect = info.visible_rect;

        let memory = match self.output_mode {
            OutputMode::Passthrough => FrameMemory::Native(frame),
            OutputMode::Copy => FrameMemory::System(self.copy_frame(&frame, visible_rect)?),
        };
        debug!("{:<20} {:?}", "output", id);

        Ok(DecodedFrame { id, timestamp, resolution, visible_rect, memory })
    }

    fn copy_frame(
        &mut self,
        frame: &SharedFrame<D::Frame>,
        visible_rect: crate::Rect,
    ) -> StatelessBackendResult<Vec<u8>> {
        let layout = self
            .device
            .frame_layout()
            .map_err(|e| StatelessBackendError::fatal(DecodePhase::Polling, e))?;
        if !layout.contains(&visible_rect) {
            return Err(StatelessBackendError::fatal(
                DecodePhase::Polling,
                anyhow!("frame layout {:?} does not hold {:?}", layout, visible_rect),
            ));
        }
        let mut raw = vec![0u8; layout.size];
        self.device
            .read_frame(frame, &mut raw)
            .map_err(|e| StatelessBackendError::fatal(DecodePhase::Polling, e))?;

        let (x, y) = (visible_rect.x as usize, visible_rect.y as usize);
        let Resolution { width, height } = Resolution::from(visible_rect);
        let (width, height) = (width as usize, height as usize);
        let offsets = [
            layout.offsets[0] + y * layout.strides[0] + x,
            layout.offsets[1] + (y / 2) * layout.strides[1] + x,
        ];

        let mut out = vec![0u8; decoded_frame_size(self.config.format, width, height)];
        nv12_copy(&raw, &mut out, width, height, layout.strides, offsets);

        Ok(out)
    }
}
