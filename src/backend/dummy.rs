// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy device whose only purpose is to let the decoder
//! run so we can test it in isolation.
//!
//! The device does not decode anything. It records what it is given, and completes the submitted
//! requests either immediately or when told to through a [`DummyController`], signalling each
//! completion through an eventfd like a real device would through its video node. Decoded frames
//! are filled with the low byte of the identifier of the picture decoded into them.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::rc::Rc;

use anyhow::anyhow;
use log::debug;
use nix::errno::Errno;
use nix::sys::eventfd::EfdFlags;
use nix::sys::eventfd::EventFd;

use crate::device::v4l2::stateless::controls::h264::H264ControlBatch;
use crate::device::v4l2::stateless::device::DeviceError;
use crate::device::v4l2::stateless::device::DeviceResult;
use crate::device::v4l2::stateless::device::FrameLayout;
use crate::device::v4l2::stateless::device::StatelessDevice;
use crate::device::v4l2::stateless::device::StreamFormat;

/// When submitted requests complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompletionMode {
    /// Requests complete as soon as they are submitted.
    #[default]
    OnSubmit,
    /// Requests complete when [`DummyController::complete`] is called.
    Manual,
}

/// Device operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePoint {
    Configure,
    AllocRequest,
    SetControls,
    QueueBitstream,
    QueueFrame,
    Submit,
    Dequeue,
    FrameLayout,
}

/// Number of calls made to the device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DummyStats {
    pub configure: usize,
    pub stream_on: usize,
    pub stream_off: usize,
    pub flush: usize,
    pub dequeue: usize,
    pub frames_allocated: usize,
    pub requests_allocated: usize,
    pub submitted: usize,
}

#[derive(Debug)]
pub struct DummyFrame {
    index: usize,
}

impl DummyFrame {
    pub fn index(&self) -> usize {
        self.index
    }
}

#[derive(Default)]
pub struct DummyRequest {
    id: Option<u64>,
    controls: Option<H264ControlBatch>,
    bitstream_crc: Option<u32>,
    frame: Option<usize>,
    submitted: bool,
}

struct DummyState {
    format: Option<StreamFormat>,
    streaming: bool,
    mode: CompletionMode,
    min_num_frames: usize,
    /// Submitted requests that have not completed yet.
    pending: Vec<u64>,
    /// Completed requests that have not been dequeued yet.
    completed: VecDeque<u64>,
    fail_next: Option<FailurePoint>,
    /// Reported instead of the layout derived from the format.
    frame_layout: Option<FrameLayout>,
    stats: DummyStats,
    controls: BTreeMap<u64, H264ControlBatch>,
    bitstream_crcs: BTreeMap<u64, u32>,
    /// Picture last decoded into each frame.
    frame_owners: BTreeMap<usize, u64>,
}

impl DummyState {
    fn check_failure(&mut self, point: FailurePoint) -> DeviceResult<()> {
        if self.fail_next == Some(point) {
            self.fail_next = None;
            debug!("dummy device: injected failure at {:?}", point);
            return Err(DeviceError::Ioctl { op: "injected", errno: Errno::EINVAL });
        }

        Ok(())
    }
}

struct Shared {
    state: RefCell<DummyState>,
    completions: EventFd,
}

impl Shared {
    fn complete(&self, id: u64) -> DeviceResult<()> {
        let mut state = self.state.borrow_mut();
        let pos = state
            .pending
            .iter()
            .position(|&p| p == id)
            .ok_or_else(|| anyhow!("picture {} is not pending", id))?;
        state.pending.remove(pos);
        state.completed.push_back(id);
        self.completions.write(1).map_err(DeviceError::ioctl("eventfd write"))?;

        Ok(())
    }
}

pub struct DummyDevice {
    shared: Rc<Shared>,
}

/// Test-side view of a [`DummyDevice`].
#[derive(Clone)]
pub struct DummyController {
    shared: Rc<Shared>,
}

impl DummyDevice {
    pub fn new(mode: CompletionMode) -> anyhow::Result<(Self, DummyController)> {
        let completions =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_SEMAPHORE | EfdFlags::EFD_NONBLOCK)?;
        let shared = Rc::new(Shared {
            state: RefCell::new(DummyState {
                format: None,
                streaming: false,
                mode,
                min_num_frames: 2,
                pending: Vec::new(),
                completed: VecDeque::new(),
                fail_next: None,
                frame_layout: None,
                stats: Default::default(),
                controls: BTreeMap::new(),
                bitstream_crcs: BTreeMap::new(),
                frame_owners: BTreeMap::new(),
            }),
            completions,
        });

        Ok((Self { shared: Rc::clone(&shared) }, DummyController { shared }))
    }
}

impl DummyController {
    /// Completes the pending picture `id`.
    pub fn complete(&self, id: u64) -> anyhow::Result<()> {
        Ok(self.shared.complete(id)?)
    }

    /// Completes the pending pictures in the given order.
    pub fn complete_in_order(&self, ids: &[u64]) -> anyhow::Result<()> {
        ids.iter().try_for_each(|&id| self.complete(id))
    }

    /// Makes the next call to `point` fail.
    pub fn fail_next(&self, point: FailurePoint) {
        self.shared.state.borrow_mut().fail_next = Some(point);
    }

    /// Makes the device report `layout` for its frames.
    pub fn set_frame_layout(&self, layout: FrameLayout) {
        self.shared.state.borrow_mut().frame_layout = Some(layout);
    }

    pub fn set_min_num_frames(&self, count: usize) {
        self.shared.state.borrow_mut().min_num_frames = count;
    }

    pub fn stats(&self) -> DummyStats {
        self.shared.state.borrow().stats
    }

    /// Pictures submitted and not completed yet.
    pub fn pending(&self) -> Vec<u64> {
        self.shared.state.borrow().pending.clone()
    }

    /// Controls submitted for picture `id`.
    pub fn controls(&self, id: u64) -> Option<H264ControlBatch> {
        self.shared.state.borrow().controls.get(&id).cloned()
    }

    /// CRC32 of the bitstream submitted for picture `id`.
    pub fn bitstream_crc(&self, id: u64) -> Option<u32> {
        self.shared.state.borrow().bitstream_crcs.get(&id).copied()
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.shared.state.borrow().format.clone()
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.state.borrow().streaming
    }
}

impl StatelessDevice for DummyDevice {
    type Request = DummyRequest;
    type Frame = DummyFrame;

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.shared.completions.as_fd()
    }

    fn configure(&mut self, format: &StreamFormat) -> DeviceResult<()> {
        let mut state = self.shared.state.borrow_mut();
        state.stats.configure += 1;
        state.check_failure(FailurePoint::Configure)?;
        if state.streaming {
            return Err(DeviceError::InvalidState("cannot configure while streaming"));
        }
        state.format = Some(format.clone());

        Ok(())
    }

    fn frame_layout(&self) -> DeviceResult<FrameLayout> {
        let mut state = self.shared.state.borrow_mut();
        state.check_failure(FailurePoint::FrameLayout)?;
        if let Some(layout) = state.frame_layout {
            return Ok(layout);
        }
        let format = state.format.as_ref().ok_or(DeviceError::InvalidState("not configured"))?;
        let width = format.coded_resolution.width as usize;
        let height = format.coded_resolution.height as usize;

        Ok(FrameLayout {
            strides: [width, width],
            offsets: [0, width * height],
            size: width * height * 3 / 2,
        })
    }

    fn min_num_frames(&self) -> usize {
        self.shared.state.borrow().min_num_frames
    }

    fn min_num_bitstream(&self) -> usize {
        2
    }

    fn allocate_frame(&mut self, index: usize) -> DeviceResult<Self::Frame> {
        self.shared.state.borrow_mut().stats.frames_allocated += 1;
        Ok(DummyFrame { index })
    }

    fn stream_on(&mut self) -> DeviceResult<()> {
        let mut state = self.shared.state.borrow_mut();
        state.stats.stream_on += 1;
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> DeviceResult<()> {
        let mut state = self.shared.state.borrow_mut();
        state.stats.stream_off += 1;
        state.streaming = false;
        state.pending.clear();
        Ok(())
    }

    fn alloc_request(&mut self) -> DeviceResult<Self::Request> {
        let mut state = self.shared.state.borrow_mut();
        state.check_failure(FailurePoint::AllocRequest)?;
        state.stats.requests_allocated += 1;
        Ok(Default::default())
    }

    fn set_controls(
        &mut self,
        request: &mut Self::Request,
        controls: &H264ControlBatch,
    ) -> DeviceResult<()> {
        self.shared.state.borrow_mut().check_failure(FailurePoint::SetControls)?;
        request.controls = Some(controls.clone());
        Ok(())
    }

    fn queue_bitstream(
        &mut self,
        request: &mut Self::Request,
        id: u64,
        data: &[u8],
    ) -> DeviceResult<()> {
        self.shared.state.borrow_mut().check_failure(FailurePoint::QueueBitstream)?;
        request.id = Some(id);
        request.bitstream_crc = Some(crc32fast::hash(data));
        Ok(())
    }

    fn queue_frame(
        &mut self,
        request: &mut Self::Request,
        id: u64,
        frame: &Self::Frame,
    ) -> DeviceResult<()> {
        let mut state = self.shared.state.borrow_mut();
        state.check_failure(FailurePoint::QueueFrame)?;
        if !state.streaming {
            return Err(DeviceError::InvalidState("not streaming"));
        }
        if request.id != Some(id) {
            return Err(DeviceError::InvalidState("frame queued before bitstream"));
        }
        request.frame = Some(frame.index);
        Ok(())
    }

    fn submit(&mut self, request: &mut Self::Request) -> DeviceResult<()> {
        let (id, mode) = {
            let mut state = self.shared.state.borrow_mut();
            state.check_failure(FailurePoint::Submit)?;

            let (Some(id), Some(frame), Some(controls), Some(crc), false) = (
                request.id,
                request.frame,
                request.controls.take(),
                request.bitstream_crc,
                request.submitted,
            ) else {
                return Err(DeviceError::InvalidState("incomplete request"));
            };

            request.submitted = true;
            state.stats.submitted += 1;
            state.controls.insert(id, controls);
            state.bitstream_crcs.insert(id, crc);
            state.frame_owners.insert(frame, id);
            state.pending.push(id);
            (id, state.mode)
        };

        if mode == CompletionMode::OnSubmit {
            self.shared.complete(id)?;
        }

        Ok(())
    }

    fn dequeue(&mut self) -> DeviceResult<Option<u64>> {
        let mut state = self.shared.state.borrow_mut();
        state.stats.dequeue += 1;
        state.check_failure(FailurePoint::Dequeue)?;

        let Some(id) = state.completed.pop_front() else {
            return Ok(None);
        };
        self.shared.completions.read().map_err(DeviceError::ioctl("eventfd read"))?;

        Ok(Some(id))
    }

    fn flush(&mut self) -> DeviceResult<()> {
        let mut state = self.shared.state.borrow_mut();
        state.stats.flush += 1;
        state.pending.clear();
        while state.completed.pop_front().is_some() {
            self.shared.completions.read().map_err(DeviceError::ioctl("eventfd read"))?;
        }

        Ok(())
    }

    fn read_frame(&mut self, frame: &Self::Frame, dst: &mut [u8]) -> DeviceResult<()> {
        let state = self.shared.state.borrow();
        let owner = state
            .frame_owners
            .get(&frame.index)
            .ok_or(DeviceError::InvalidState("frame was never decoded into"))?;
        dst.fill(*owner as u8);

        Ok(())
    }
}
