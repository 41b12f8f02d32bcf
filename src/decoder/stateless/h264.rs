// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod v4l2;

use std::rc::Rc;

use crate::codec::h264::dpb::DpbEntry;
use crate::codec::h264::dpb::SharedDpb;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::Slice;
use crate::codec::h264::syntax::Sps;
use crate::decoder::stateless::StatelessBackendResult;
use crate::decoder::DecodedFrame;

/// Stateless backend methods specific to H.264.
///
/// The parser and the reference bookkeeping call these, in this order for each picture:
/// `start_picture`, `decode_slice` once per slice, then `end_picture`. The handle returned by
/// `end_picture` is what the bookkeeping stores in the DPB and later passes to `output_picture`,
/// in output order.
pub trait StatelessH264DecoderBackend {
    /// Handle to a submitted picture, stored in the DPB.
    type Handle: Clone;
    /// Frame type of the decoded pictures.
    type Frame;

    /// Called when a new SPS is activated. Returns whether the stream had to be renegotiated.
    fn new_sequence(&mut self, sps: &Rc<Sps>, max_dpb_size: usize)
        -> StatelessBackendResult<bool>;

    /// Called by the decoder when starting a new frame or field.
    ///
    /// `dpb` is only read at `end_picture`, after the reference bookkeeping has marked the
    /// references of the whole picture.
    fn start_picture(
        &mut self,
        picture: &PictureData,
        pps: &Pps,
        slice: &Slice,
        dpb: &SharedDpb<Self::Handle>,
    ) -> StatelessBackendResult<()>;

    /// Called to dispatch a decode operation to the backend.
    fn decode_slice(
        &mut self,
        picture: &PictureData,
        slice: &Slice,
        ref_pic_list0: &[DpbEntry<Self::Handle>],
        ref_pic_list1: &[DpbEntry<Self::Handle>],
    ) -> StatelessBackendResult<()>;

    /// Called when all the slices of `picture` have been given. Submits the picture to the
    /// accelerator and returns its handle.
    fn end_picture(&mut self, picture: &PictureData) -> StatelessBackendResult<Self::Handle>;

    /// Returns the decoded frame of `handle`, waiting for the accelerator if needed. Each
    /// picture can only be output once.
    fn output_picture(
        &mut self,
        handle: &Self::Handle,
    ) -> StatelessBackendResult<DecodedFrame<Self::Frame>>;
}
