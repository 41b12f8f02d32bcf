// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One-shot decode request of a single picture.
//!
//! A request goes through `Allocated -> ControlsAttached -> Queued -> Done`. Any failure along
//! the way destroys the device request and leaves the request in a terminal invalid state: there
//! is no retry, the picture fails as a whole.

use log::debug;

use crate::decoder::stateless::DecodePhase;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::device::v4l2::stateless::bitstream::SealedBitstream;
use crate::device::v4l2::stateless::controls::h264::H264ControlBatch;
use crate::device::v4l2::stateless::device::StatelessDevice;

#[derive(Default)]
enum RequestState<R> {
    Allocated(R),
    ControlsAttached(R),
    Queued {
        // Kept until completion, since the device reads from it until then.
        _request: R,
        _bitstream: SealedBitstream,
    },
    Done,
    #[default]
    Invalid,
}

impl<R> RequestState<R> {
    fn name(&self) -> &'static str {
        match self {
            Self::Allocated(_) => "allocated",
            Self::ControlsAttached(_) => "controls-attached",
            Self::Queued { .. } => "queued",
            Self::Done => "done",
            Self::Invalid => "invalid",
        }
    }
}

pub struct V4l2Request<D: StatelessDevice> {
    id: u64,
    state: RequestState<D::Request>,
}

impl<D: StatelessDevice> V4l2Request<D> {
    /// Allocates a new request on `device` for picture `id`.
    pub fn new(device: &mut D, id: u64) -> StatelessBackendResult<Self> {
        let request = device
            .alloc_request()
            .map_err(|e| StatelessBackendError::fatal(DecodePhase::Allocation, e))?;
        debug!("{:<20} {:?}", "alloc_request", id);

        Ok(Self { id, state: RequestState::Allocated(request) })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sets all the controls of the picture in one batch.
    pub fn attach_controls(
        &mut self,
        device: &mut D,
        controls: &H264ControlBatch,
    ) -> StatelessBackendResult<()> {
        let mut request = match std::mem::take(&mut self.state) {
            RequestState::Allocated(request) => request,
            state => {
                self.state = state;
                return Err(StatelessBackendError::InvalidState("controls already attached"));
            }
        };

        device
            .set_controls(&mut request, controls)
            .map_err(|e| StatelessBackendError::fatal(DecodePhase::Controls, e))?;
        debug!("{:<20} {:?} {} slices", "attach_controls", self.id, controls.slice_params.len());

        self.state = RequestState::ControlsAttached(request);
        Ok(())
    }

    /// Registers the bitstream and the destination frame, then submits the request.
    pub fn queue(
        &mut self,
        device: &mut D,
        bitstream: SealedBitstream,
        frame: &D::Frame,
    ) -> StatelessBackendResult<()> {
        let mut request = match std::mem::take(&mut self.state) {
            RequestState::ControlsAttached(request) => request,
            state => {
                let name = state.name();
                self.state = state;
                debug!("{:<20} {:?} in state {}", "queue rejected", self.id, name);
                return Err(StatelessBackendError::InvalidState("request not ready for queuing"));
            }
        };

        let fatal = |e| StatelessBackendError::fatal(DecodePhase::Queuing, e);
        device.queue_bitstream(&mut request, self.id, bitstream.data()).map_err(fatal)?;
        device.queue_frame(&mut request, self.id, frame).map_err(fatal)?;
        device.submit(&mut request).map_err(fatal)?;
        debug!("{:<20} {:?} {} bytes", "queue", self.id, bitstream.len());

        self.state = RequestState::Queued { _request: request, _bitstream: bitstream };
        Ok(())
    }

    /// Records the completion of the request, releasing its bitstream.
    pub fn mark_done(&mut self) -> StatelessBackendResult<()> {
        match self.state {
            RequestState::Queued { .. } => {
                self.state = RequestState::Done;
                debug!("{:<20} {:?}", "mark_done", self.id);
                Ok(())
            }
            RequestState::Done => Err(StatelessBackendError::InvalidState("request already done")),
            _ => Err(StatelessBackendError::InvalidState("request not queued")),
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self.state, RequestState::Queued { .. })
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, RequestState::Done)
    }

    /// Whether the request has been destroyed after a failure.
    pub fn is_invalid(&self) -> bool {
        matches!(self.state, RequestState::Invalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::CompletionMode;
    use crate::backend::dummy::DummyController;
    use crate::backend::dummy::DummyDevice;
    use crate::backend::dummy::FailurePoint;
    use crate::device::v4l2::stateless::bitstream::BitstreamAssembler;
    use crate::device::v4l2::stateless::bitstream::BitstreamPool;

    fn sealed(pool: &BitstreamPool) -> SealedBitstream {
        let mut assembler = BitstreamAssembler::new();
        assembler.start_picture(pool).unwrap();
        assembler.decode_slice(&[0x65, 0x88]).unwrap();
        assembler.end_picture().unwrap()
    }

    fn setup(mode: CompletionMode) -> (DummyDevice, DummyController, BitstreamPool) {
        let (mut device, controller) = DummyDevice::new(mode).unwrap();
        device.stream_on().unwrap();
        let pool = BitstreamPool::new("bitstream");
        pool.attach(2, |_| Ok(vec![0u8; 64])).unwrap();

        (device, controller, pool)
    }

    #[test]
    fn request_lifecycle() {
        let (mut device, controller, pool) = setup(CompletionMode::OnSubmit);
        let frame = device.allocate_frame(0).unwrap();

        let mut request = V4l2Request::new(&mut device, 7).unwrap();
        request.attach_controls(&mut device, &H264ControlBatch::new()).unwrap();
        request.queue(&mut device, sealed(&pool), &frame).unwrap();
        assert!(request.is_queued());
        assert_eq!(pool.num_free(), 1);
        assert_eq!(controller.pending(), Vec::<u64>::new());
        assert_eq!(device.dequeue().unwrap(), Some(7));

        request.mark_done().unwrap();
        assert!(request.is_done());
        assert_eq!(pool.num_free(), 2);
        assert!(matches!(request.mark_done(), Err(StatelessBackendError::InvalidState(_))));
    }

    #[test]
    fn out_of_order_transition_is_rejected() {
        let (mut device, _controller, pool) = setup(CompletionMode::Manual);
        let frame = device.allocate_frame(0).unwrap();

        let mut request = V4l2Request::new(&mut device, 0).unwrap();
        assert!(request.mark_done().is_err());
        assert!(matches!(
            request.queue(&mut device, sealed(&pool), &frame),
            Err(StatelessBackendError::InvalidState(_))
        ));

        // The request is still usable.
        request.attach_controls(&mut device, &H264ControlBatch::new()).unwrap();
        assert!(request.attach_controls(&mut device, &H264ControlBatch::new()).is_err());
        request.queue(&mut device, sealed(&pool), &frame).unwrap();
    }

    #[test]
    fn failure_invalidates_request() {
        let (mut device, controller, pool) = setup(CompletionMode::OnSubmit);
        let frame = device.allocate_frame(0).unwrap();

        let mut request = V4l2Request::new(&mut device, 0).unwrap();
        request.attach_controls(&mut device, &H264ControlBatch::new()).unwrap();
        controller.fail_next(FailurePoint::Submit);
        let err = request.queue(&mut device, sealed(&pool), &frame).unwrap_err();
        assert_eq!(err.phase(), Some(DecodePhase::Queuing));
        assert!(request.is_invalid());
        assert_eq!(pool.num_free(), 2);

        assert!(request.queue(&mut device, sealed(&pool), &frame).is_err());
        assert!(request.mark_done().is_err());

        controller.fail_next(FailurePoint::AllocRequest);
        let err = V4l2Request::new(&mut device, 1).err().unwrap();
        assert_eq!(err.phase(), Some(DecodePhase::Allocation));
    }
}
