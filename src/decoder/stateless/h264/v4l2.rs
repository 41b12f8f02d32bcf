// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use log::debug;

use crate::backend::v4l2::decoder::stateless::report;
use crate::backend::v4l2::decoder::stateless::CurrentPicture;
use crate::backend::v4l2::decoder::stateless::V4l2Picture;
use crate::backend::v4l2::decoder::stateless::V4l2PictureHandle;
use crate::backend::v4l2::decoder::stateless::V4l2StatelessDecoderBackend;
use crate::backend::v4l2::decoder::V4l2StreamInfo;
use crate::codec::h264::dpb::DpbEntry;
use crate::codec::h264::dpb::SharedDpb;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::Slice;
use crate::codec::h264::syntax::Sps;
use crate::decoder::stateless::h264::StatelessH264DecoderBackend;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::DecodedFrame;
use crate::device::v4l2::stateless::device::StatelessDevice;
use crate::device::v4l2::stateless::request::V4l2Request;
use crate::Rect;
use crate::Resolution;

impl V4l2StreamInfo for (&Sps, usize) {
    fn max_dpb_frames(&self) -> usize {
        self.1
    }

    fn coded_size(&self) -> Resolution {
        Resolution::from((self.0.width(), self.0.height()))
    }

    fn visible_rect(&self) -> Rect {
        self.0.visible_rectangle()
    }

    fn bit_depth(&self) -> u8 {
        self.0.bit_depth_luma_minus8 + 8
    }

    fn chroma_format_idc(&self) -> u8 {
        self.0.chroma_format_idc
    }
}

impl<D: StatelessDevice> V4l2StatelessDecoderBackend<D> {
    fn check_current(&self, picture: &PictureData) -> StatelessBackendResult<()> {
        match &self.current {
            Some(current) if current.id == picture.system_frame_number => Ok(()),
            Some(_) => Err(StatelessBackendError::InvalidState("slice of another picture")),
            None => Err(StatelessBackendError::InvalidState("no picture started")),
        }
    }

    fn begin_picture(
        &mut self,
        picture: &PictureData,
        pps: &Pps,
        slice: &Slice,
        dpb: &SharedDpb<V4l2PictureHandle<D>>,
    ) -> StatelessBackendResult<()> {
        if self.stream_info().is_none() {
            return Err(StatelessBackendError::InvalidState("no stream negotiated"));
        }

        self.current = None;
        self.start_bitstream()?;
        self.controls.start_picture(picture, pps, &slice.header);
        self.current = Some(CurrentPicture {
            id: picture.system_frame_number,
            timestamp: picture.timestamp,
            dpb: Rc::clone(dpb),
        });
        debug!("{:<20} {:?}", "start_picture", picture.system_frame_number);

        Ok(())
    }

    fn append_slice(
        &mut self,
        picture: &PictureData,
        slice: &Slice,
        ref_pic_list0: &[DpbEntry<V4l2PictureHandle<D>>],
        ref_pic_list1: &[DpbEntry<V4l2PictureHandle<D>>],
    ) -> StatelessBackendResult<()> {
        self.check_current(picture)?;
        self.assembler.decode_slice(slice.nalu)?;
        self.controls.push_slice(&slice.header, ref_pic_list0, ref_pic_list1);

        Ok(())
    }

    fn submit_picture(
        &mut self,
        picture: &PictureData,
    ) -> StatelessBackendResult<V4l2PictureHandle<D>> {
        self.check_current(picture)?;
        let current = self
            .current
            .take()
            .ok_or(StatelessBackendError::InvalidState("no picture started"))?;
        let bitstream = self.assembler.end_picture()?;

        // The references are only final now that the whole picture has been handed over.
        let ref_frames = {
            let dpb = current.dpb.borrow();
            self.controls.set_dpb(dpb.entries())?;
            dpb.entries()
                .iter()
                .filter_map(|entry| entry.reference.as_ref())
                .map(|handle| Arc::clone(handle.borrow().frame()))
                .collect::<Vec<_>>()
        };

        let mut request = V4l2Request::new(&mut self.device, current.id)?;
        request.attach_controls(&mut self.device, &self.controls)?;
        let frame = Arc::new(self.acquire_frame()?);
        request.queue(&mut self.device, bitstream, &frame)?;

        let handle =
            Rc::new(RefCell::new(V4l2Picture::new(request, current.timestamp, frame, ref_frames)));
        self.reconciler.register(current.id, &handle);
        debug!(
            "{:<20} {:?} {} references",
            "end_picture",
            current.id,
            handle.borrow().num_ref_frames()
        );

        Ok(handle)
    }
}

impl<D: StatelessDevice> StatelessH264DecoderBackend for V4l2StatelessDecoderBackend<D> {
    type Handle = V4l2PictureHandle<D>;
    type Frame = D::Frame;

    fn new_sequence(&mut self, sps: &Rc<Sps>, max_dpb_size: usize) -> StatelessBackendResult<bool> {
        report(self.negotiate((sps.as_ref(), max_dpb_size).stream_format()))
    }

    fn start_picture(
        &mut self,
        picture: &PictureData,
        pps: &Pps,
        slice: &Slice,
        dpb: &SharedDpb<Self::Handle>,
    ) -> StatelessBackendResult<()> {
        let res = self.begin_picture(picture, pps, slice, dpb);
        if res.is_err() {
            self.abort_picture();
        }
        report(res)
    }

    fn decode_slice(
        &mut self,
        picture: &PictureData,
        slice: &Slice,
        ref_pic_list0: &[DpbEntry<Self::Handle>],
        ref_pic_list1: &[DpbEntry<Self::Handle>],
    ) -> StatelessBackendResult<()> {
        let res = self.append_slice(picture, slice, ref_pic_list0, ref_pic_list1);
        if res.is_err() {
            self.abort_picture();
        }
        report(res)
    }

    fn end_picture(&mut self, picture: &PictureData) -> StatelessBackendResult<Self::Handle> {
        let res = self.submit_picture(picture);
        if res.is_err() {
            self.abort_picture();
        }
        report(res)
    }

    fn output_picture(
        &mut self,
        handle: &Self::Handle,
    ) -> StatelessBackendResult<DecodedFrame<Self::Frame>> {
        report(self.harvest(handle))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::backend::dummy::CompletionMode;
    use crate::backend::dummy::DummyController;
    use crate::backend::dummy::DummyDevice;
    use crate::backend::dummy::FailurePoint;
    use crate::backend::v4l2::decoder::DecoderConfig;
    use crate::codec::h264::picture::Reference;
    use crate::codec::h264::syntax::PpsBuilder;
    use crate::codec::h264::syntax::SliceHeaderBuilder;
    use crate::codec::h264::syntax::SliceType;
    use crate::codec::h264::syntax::SpsBuilder;
    use crate::decoded_frame_size;
    use crate::decoder::stateless::DecodePhase;
    use crate::decoder::DownstreamInfo;
    use crate::decoder::FrameMemory;
    use crate::decoder::OutputMode;
    use crate::device::v4l2::stateless::controls::h264::reference_ts;
    use crate::device::v4l2::stateless::controls::h264::V4l2CtrlH264DecodeMode;
    use crate::device::v4l2::stateless::controls::h264::V4l2CtrlH264StartCode;
    use crate::device::v4l2::stateless::device::FrameLayout;
    use crate::DecodedFormat;

    type Backend = V4l2StatelessDecoderBackend<DummyDevice>;
    type Handle = V4l2PictureHandle<DummyDevice>;

    const MAX_DPB_SIZE: usize = 2;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    struct Harness {
        backend: Backend,
        controller: DummyController,
        pps: Rc<Pps>,
        dpb: SharedDpb<Handle>,
    }

    impl Harness {
        fn new(mode: CompletionMode, config: DecoderConfig) -> Self {
            Self::with_sps(mode, config, SpsBuilder::new().resolution(64, 48).build())
        }

        fn with_sps(mode: CompletionMode, config: DecoderConfig, sps: Rc<Sps>) -> Self {
            init_logger();
            let (device, controller) = DummyDevice::new(mode).unwrap();
            let mut backend = Backend::new(device, config).unwrap();
            assert!(backend.new_sequence(&sps, MAX_DPB_SIZE).unwrap());

            Self {
                backend,
                controller,
                pps: PpsBuilder::new(sps).build(),
                dpb: Default::default(),
            }
        }

        /// A harness whose frame pool holds exactly `num_frames` frames, for a DPB of one.
        fn with_frames(mode: CompletionMode, num_frames: usize) -> Self {
            init_logger();
            let config = DecoderConfig { picture_headroom: 0, ..Default::default() };
            let (device, controller) = DummyDevice::new(mode).unwrap();
            controller.set_min_num_frames(num_frames);
            let sps = SpsBuilder::new().resolution(64, 48).build();
            let mut backend = Backend::new(device, config).unwrap();
            backend.new_sequence(&sps, 1).unwrap();
            assert_eq!(backend.frame_pool_stats().num_managed, num_frames);

            Self {
                backend,
                controller,
                pps: PpsBuilder::new(sps).build(),
                dpb: Default::default(),
            }
        }

        fn picture(&self, id: u64, slice_type: SliceType) -> (PictureData, Vec<u8>) {
            let hdr = SliceHeaderBuilder::new(&self.pps)
                .slice_type(slice_type)
                .frame_num(id as u16)
                .build();
            let pic = PictureData::new_from_slice(&hdr, 1, id == 0, id, id * 10);

            (pic, vec![0x65, id as u8, 0xaa])
        }

        fn slice<'a>(&self, id: u64, slice_type: SliceType, nalu: &'a [u8]) -> Slice<'a> {
            let header = SliceHeaderBuilder::new(&self.pps)
                .slice_type(slice_type)
                .frame_num(id as u16)
                .build();
            Slice { header, nalu }
        }

        /// Decodes a single-slice picture referencing `refs`.
        fn decode(&mut self, id: u64, refs: &[DpbEntry<Handle>]) -> StatelessBackendResult<Handle> {
            let slice_type = if refs.is_empty() { SliceType::I } else { SliceType::P };
            let (pic, nalu) = self.picture(id, slice_type);
            let slice = self.slice(id, slice_type, &nalu);

            self.backend.start_picture(&pic, &self.pps, &slice, &self.dpb)?;
            self.backend.decode_slice(&pic, &slice, refs, &[])?;
            self.backend.end_picture(&pic)
        }

        /// Stores picture `id` in the DPB as a short term reference.
        fn store(&self, id: u64, handle: &Handle) -> DpbEntry<Handle> {
            let (pic, _) = self.picture(id, SliceType::I);
            let pic = Rc::new(RefCell::new(pic));
            self.dpb.borrow_mut().store_picture(Rc::clone(&pic), Some(Rc::clone(handle))).unwrap();

            DpbEntry { pic, reference: Some(Rc::clone(handle)) }
        }
    }

    #[test]
    fn output_follows_request_order() {
        let mut h = Harness::new(CompletionMode::Manual, Default::default());

        let handles = (0..4).map(|id| h.decode(id, &[]).unwrap()).collect::<Vec<_>>();
        assert_eq!(h.controller.pending(), vec![0, 1, 2, 3]);

        h.controller.complete_in_order(&[2, 0, 3, 1]).unwrap();
        for (id, handle) in handles.iter().enumerate() {
            let frame = h.backend.output_picture(handle).unwrap();
            assert_eq!(frame.id, id as u64);
            assert_eq!(frame.timestamp, id as u64 * 10);
            assert_eq!(frame.resolution, Resolution::from((64, 48)));
        }
        assert_eq!(h.backend.reconciler.num_in_flight(), 0);
    }

    #[test]
    fn drained_completion_is_not_polled_again() {
        let mut h = Harness::new(CompletionMode::Manual, Default::default());

        let a = h.decode(0, &[]).unwrap();
        let b = h.decode(1, &[]).unwrap();
        h.controller.complete_in_order(&[1, 0]).unwrap();

        h.backend.output_picture(&a).unwrap();
        assert!(b.borrow().is_done());
        let dequeues = h.controller.stats().dequeue;

        let frame = h.backend.output_picture(&b).unwrap();
        assert_eq!(frame.id, 1);
        assert_eq!(h.controller.stats().dequeue, dequeues);

        // Completed requests give their bitstream back.
        let stats = h.backend.bitstream_pool_stats();
        assert_eq!(stats.num_free, stats.num_managed);
    }

    #[test]
    fn picture_is_output_once() {
        let mut h = Harness::new(CompletionMode::OnSubmit, Default::default());

        let handle = h.decode(0, &[]).unwrap();
        h.backend.output_picture(&handle).unwrap();
        assert!(matches!(
            h.backend.output_picture(&handle),
            Err(StatelessBackendError::InvalidState(_))
        ));
    }

    #[test]
    fn renegotiation_with_same_format_is_a_no_op() {
        let mut h = Harness::new(CompletionMode::OnSubmit, Default::default());
        let sps = Rc::clone(&h.pps.sps);
        let frames_allocated = h.controller.stats().frames_allocated;
        let generation = h.backend.frame_pool_stats().generation;

        assert!(!h.backend.new_sequence(&sps, MAX_DPB_SIZE).unwrap());
        assert_eq!(h.controller.stats().configure, 1);
        assert_eq!(h.controller.stats().frames_allocated, frames_allocated);
        assert_eq!(h.backend.frame_pool_stats().generation, generation);

        let bigger = SpsBuilder::new().resolution(128, 96).build();
        assert!(h.backend.new_sequence(&bigger, MAX_DPB_SIZE).unwrap());
        assert_eq!(h.controller.stats().configure, 2);
        assert_eq!(h.controller.stats().stream_off, 1);
        assert_eq!(
            h.backend.stream_info().unwrap().coded_resolution,
            Resolution::from((128, 96))
        );
    }

    #[test]
    fn pools_are_sized_from_device_and_stream() {
        let h = Harness::new(CompletionMode::OnSubmit, Default::default());
        let config = DecoderConfig::default();

        // Device minimum, headroom and margin.
        assert_eq!(
            h.backend.bitstream_pool_stats().num_managed,
            2 + config.bitstream_headroom + config.bitstream_margin
        );
        assert_eq!(
            h.backend.frame_pool_stats().num_managed,
            MAX_DPB_SIZE + config.picture_headroom
        );
        assert_eq!(h.backend.stream_info().unwrap().min_num_frames, MAX_DPB_SIZE + 4);
    }

    #[test]
    fn downstream_requirements_resize_frame_pool() {
        let mut h = Harness::new(CompletionMode::OnSubmit, Default::default());

        let mode = h
            .backend
            .decide_allocation(DownstreamInfo { supports_native: true, min_buffers: 3 })
            .unwrap();
        assert_eq!(mode, OutputMode::Passthrough);
        assert_eq!(h.backend.frame_pool_stats().num_managed, MAX_DPB_SIZE + 3 + 4);
        assert_eq!(h.controller.stats().configure, 2);

        // Same requirements, nothing to redo.
        h.backend
            .decide_allocation(DownstreamInfo { supports_native: true, min_buffers: 3 })
            .unwrap();
        assert_eq!(h.controller.stats().configure, 2);
    }

    #[test]
    fn picture_without_references_has_empty_dpb() {
        let mut h = Harness::new(CompletionMode::OnSubmit, Default::default());

        let handle = h.decode(0, &[]).unwrap();
        assert_eq!(handle.borrow().num_ref_frames(), 0);

        let controls = h.controller.controls(0).unwrap();
        assert!(controls.dpb_entries().is_empty());
        assert_eq!(controls.slice_params.len(), 1);
        assert_eq!(controls.decode_mode, V4l2CtrlH264DecodeMode::FrameBased);
        assert_eq!(controls.start_code, V4l2CtrlH264StartCode::AnnexB);
        assert_eq!(h.controller.bitstream_crc(0), Some(crc32fast::hash(&[0, 0, 1, 0x65, 0, 0xaa])));
    }

    #[test]
    fn references_resolved_at_end_of_picture() {
        let mut h = Harness::new(CompletionMode::Manual, Default::default());

        let first = h.decode(0, &[]).unwrap();
        let first_entry = h.store(0, &first);
        let second = h.decode(1, &[first_entry.clone()]).unwrap();
        h.store(1, &second);
        assert_eq!(second.borrow().num_ref_frames(), 1);

        let controls = h.controller.controls(1).unwrap();
        assert_eq!(controls.dpb_entries().len(), 1);
        assert_eq!(controls.dpb_entries()[0].reference_ts, reference_ts(0));
        assert_eq!(controls.slice_params[0].ref_pic_list0[0].index, 0);

        // Picture 0 stops being a reference while picture 2 is being assembled.
        let (pic, nalu) = h.picture(2, SliceType::P);
        let slice = h.slice(2, SliceType::P, &nalu);
        let second_entry = h.dpb.borrow().entries()[1].clone();
        h.backend.start_picture(&pic, &h.pps, &slice, &h.dpb).unwrap();
        h.backend.decode_slice(&pic, &slice, &[second_entry], &[]).unwrap();
        first_entry.pic.borrow_mut().set_reference(Reference::None);
        h.dpb.borrow_mut().remove_unused();
        let third = h.backend.end_picture(&pic).unwrap();

        let controls = h.controller.controls(2).unwrap();
        assert_eq!(controls.dpb_entries().len(), 1);
        assert_eq!(controls.dpb_entries()[0].reference_ts, reference_ts(1));
        assert_eq!(third.borrow().num_ref_frames(), 1);

        // The references are released along with the request.
        h.controller.complete_in_order(&[0, 1, 2]).unwrap();
        h.backend.output_picture(&third).unwrap();
        assert_eq!(third.borrow().num_ref_frames(), 0);
    }

    #[test]
    fn flush_interrupts_completion_wait() {
        let config = DecoderConfig { poll_timeout: Duration::from_secs(10), ..Default::default() };
        let mut h = Harness::new(CompletionMode::Manual, config);

        let handle = h.decode(0, &[]).unwrap();
        let flush = h.backend.flush_handle();
        let flusher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flush.flush_start().unwrap();
        });

        assert!(h.backend.output_picture(&handle).unwrap_err().is_flushing());
        flusher.join().unwrap();

        // Nothing can be decoded until the flush is over.
        assert!(h.decode(1, &[]).unwrap_err().is_flushing());

        h.backend.flush_start().unwrap();
        assert_eq!(h.controller.stats().flush, 1);
        h.backend.flush_stop().unwrap();

        let handle = h.decode(2, &[]).unwrap();
        h.controller.complete(2).unwrap();
        assert_eq!(h.backend.output_picture(&handle).unwrap().id, 2);
    }

    #[test]
    fn flush_releases_blocked_frame_acquisition() {
        let mut h = Harness::with_frames(CompletionMode::OnSubmit, 1);

        // Holds the only frame.
        let _first = h.decode(0, &[]).unwrap();

        let flush = h.backend.flush_handle();
        let flusher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            flush.flush_start().unwrap();
        });

        assert!(h.decode(1, &[]).unwrap_err().is_flushing());
        flusher.join().unwrap();
        assert!(!h.backend.assembler.is_started());
    }

    #[test]
    fn exhausted_frame_pool_reclaims_completed_references() {
        let mut h = Harness::with_frames(CompletionMode::Manual, 2);

        let first = h.decode(0, &[]).unwrap();
        h.controller.complete(0).unwrap();
        drop(h.backend.output_picture(&first).unwrap());
        let first_entry = h.store(0, &first);

        // Picture 1 keeps the frame of picture 0 until its completion is dequeued.
        let second = h.decode(1, &[first_entry.clone()]).unwrap();
        h.controller.complete(1).unwrap();
        first_entry.pic.borrow_mut().set_reference(Reference::None);
        h.dpb.borrow_mut().remove_unused();
        drop(first_entry);
        drop(first);
        assert_eq!(h.backend.frame_pool_stats().num_free, 0);

        let third = h.decode(2, &[]).unwrap();
        assert!(second.borrow().is_done());
        assert_eq!(second.borrow().num_ref_frames(), 0);

        h.controller.complete(2).unwrap();
        assert_eq!(h.backend.output_picture(&third).unwrap().id, 2);
        assert_eq!(h.backend.output_picture(&second).unwrap().id, 1);
    }

    #[test]
    fn dequeue_failure_is_fatal() {
        let mut h = Harness::new(CompletionMode::Manual, Default::default());

        let handle = h.decode(0, &[]).unwrap();
        h.controller.complete(0).unwrap();
        h.controller.fail_next(FailurePoint::Dequeue);
        let err = h.backend.output_picture(&handle).unwrap_err();
        assert_eq!(err.phase(), Some(DecodePhase::Polling));
    }

    #[test]
    fn missing_completion_times_out() {
        let config =
            DecoderConfig { poll_timeout: Duration::from_millis(20), ..Default::default() };
        let mut h = Harness::new(CompletionMode::Manual, config);

        let handle = h.decode(0, &[]).unwrap();
        let err = h.backend.output_picture(&handle).unwrap_err();
        assert_eq!(err.phase(), Some(DecodePhase::Polling));
    }

    #[test]
    fn rejected_controls_abort_the_picture() {
        let mut h = Harness::new(CompletionMode::OnSubmit, Default::default());
        let bitstream_free = h.backend.bitstream_pool_stats().num_free;
        let frames_free = h.backend.frame_pool_stats().num_free;

        h.controller.fail_next(FailurePoint::SetControls);
        let err = h.decode(0, &[]).unwrap_err();
        assert_eq!(err.phase(), Some(DecodePhase::Controls));
        assert_eq!(h.backend.bitstream_pool_stats().num_free, bitstream_free);
        assert_eq!(h.backend.frame_pool_stats().num_free, frames_free);
        assert_eq!(h.controller.stats().submitted, 0);

        h.controller.fail_next(FailurePoint::QueueFrame);
        assert_eq!(h.decode(1, &[]).unwrap_err().phase(), Some(DecodePhase::Queuing));
        assert_eq!(h.backend.frame_pool_stats().num_free, frames_free);

        h.controller.fail_next(FailurePoint::AllocRequest);
        assert_eq!(h.decode(2, &[]).unwrap_err().phase(), Some(DecodePhase::Allocation));

        // The next picture goes through.
        let handle = h.decode(3, &[]).unwrap();
        assert_eq!(h.backend.output_picture(&handle).unwrap().id, 3);
    }

    #[test]
    fn oversized_slice_aborts_the_picture() {
        let config = DecoderConfig { bitstream_block_size: 8, ..Default::default() };
        let mut h = Harness::new(CompletionMode::OnSubmit, config);

        let (pic, _) = h.picture(0, SliceType::I);
        let nalu = [0x65; 6];
        let slice = h.slice(0, SliceType::I, &nalu);
        h.backend.start_picture(&pic, &h.pps, &slice, &h.dpb).unwrap();
        let err = h.backend.decode_slice(&pic, &slice, &[], &[]).unwrap_err();
        assert!(matches!(
            err,
            StatelessBackendError::BitstreamCapacity { needed: 9, capacity: 8 }
        ));

        assert!(h.backend.end_picture(&pic).is_err());
        let stats = h.backend.bitstream_pool_stats();
        assert_eq!(stats.num_free, stats.num_managed);
        assert_eq!(h.controller.stats().requests_allocated, 0);
    }

    #[test]
    fn exhausted_bitstream_pool_reclaims_completed_requests() {
        let mut h = Harness::new(CompletionMode::OnSubmit, Default::default());
        let num_bitstream = h.backend.bitstream_pool_stats().num_managed;

        // Each completed but undequeued request holds on to its bitstream.
        let handles =
            (0..num_bitstream as u64 + 1).map(|id| h.decode(id, &[]).unwrap()).collect::<Vec<_>>();
        assert!(handles[0].borrow().is_done());
        assert!(!handles[num_bitstream].borrow().is_done());
    }

    #[test]
    fn copy_mode_outputs_visible_area() {
        let sps = SpsBuilder::new().resolution(60, 40).build();
        let mut h = Harness::with_sps(CompletionMode::OnSubmit, Default::default(), sps);

        let mode = h
            .backend
            .decide_allocation(DownstreamInfo { supports_native: false, min_buffers: 0 })
            .unwrap();
        assert_eq!(mode, OutputMode::Copy);

        let handle = h.decode(3, &[]).unwrap();
        let frame = h.backend.output_picture(&handle).unwrap();
        assert_eq!(frame.visible_rect, Rect { x: 0, y: 0, width: 60, height: 40 });

        let data = frame.system_memory().unwrap();
        let expected = vec![3u8; decoded_frame_size(DecodedFormat::NV12, 60, 40)];
        assert_eq!(crc32fast::hash(data), crc32fast::hash(&expected));
    }

    #[test]
    fn unusable_frame_layout_fails_copy() {
        let mut h = Harness::new(CompletionMode::OnSubmit, Default::default());
        h.backend
            .decide_allocation(DownstreamInfo { supports_native: false, min_buffers: 0 })
            .unwrap();

        let handle = h.decode(0, &[]).unwrap();
        h.controller.fail_next(FailurePoint::FrameLayout);
        let err = h.backend.output_picture(&handle).unwrap_err();
        assert_eq!(err.phase(), Some(DecodePhase::Polling));

        // A layout too small for the visible area is refused instead of read past its end.
        h.controller.set_frame_layout(FrameLayout::default());
        let handle = h.decode(1, &[]).unwrap();
        let err = h.backend.output_picture(&handle).unwrap_err();
        assert_eq!(err.phase(), Some(DecodePhase::Polling));
    }

    #[test]
    fn passthrough_frame_returns_to_pool_when_released() {
        let mut h = Harness::new(CompletionMode::OnSubmit, Default::default());
        let frames_free = h.backend.frame_pool_stats().num_free;

        let handle = h.decode(0, &[]).unwrap();
        let frame = h.backend.output_picture(&handle).unwrap();
        assert!(matches!(frame.memory, FrameMemory::Native(_)));
        assert_eq!(h.backend.frame_pool_stats().num_free, frames_free - 1);

        drop(handle);
        assert_eq!(h.backend.frame_pool_stats().num_free, frames_free - 1);
        drop(frame);
        assert_eq!(h.backend.frame_pool_stats().num_free, frames_free);
    }

    #[test]
    fn close_releases_everything() {
        let mut h = Harness::new(CompletionMode::OnSubmit, Default::default());
        let handle = h.decode(0, &[]).unwrap();

        h.backend.close().unwrap();
        assert!(!h.controller.is_streaming());
        assert_eq!(h.backend.frame_pool_stats().num_managed, 0);
        assert!(h.backend.stream_info().is_none());

        // Frames from before the close do not come back.
        drop(handle);
        assert_eq!(h.backend.frame_pool_stats().num_free, 0);
    }
}
