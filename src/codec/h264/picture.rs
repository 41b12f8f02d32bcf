// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h264::syntax::SliceHeader;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Field {
    #[default]
    Frame,
    Top,
    Bottom,
}

impl Field {
    /// Returns the field of opposite parity.
    pub fn opposite(&self) -> Self {
        match *self {
            Field::Frame => Field::Frame,
            Field::Top => Field::Bottom,
            Field::Bottom => Field::Top,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Reference {
    #[default]
    None,
    ShortTerm,
    LongTerm,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IsIdr {
    #[default]
    No,
    Yes {
        idr_pic_id: u16,
    },
}

/// Data associated with an h.264 picture, as computed by the reference bookkeeping.
///
/// Most fields are extracted from the first slice header of the picture. The picture order counts
/// and picture numbers are derived values and are only read here.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PictureData {
    pub pic_order_cnt_type: u8,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub pic_order_cnt: i32,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,

    pub pic_num: i32,
    pub long_term_pic_num: u32,
    pub frame_num: u16,
    pub long_term_frame_idx: u32,

    pub nal_ref_idc: u8,
    pub is_idr: IsIdr,
    reference: Reference,

    pub field: Field,

    /// Position of the coded picture in decoding order. Used as the identifier of the picture
    /// towards the accelerator.
    pub system_frame_number: u64,
    /// Presentation timestamp of the picture, opaque to the decoder.
    pub timestamp: u64,

    /// Size of `dec_ref_pic_marking()` in the first slice header, in bits.
    pub dec_ref_pic_marking_bit_size: usize,
    /// Size of the picture order count syntax elements in the first slice header, in bits.
    pub pic_order_cnt_bit_size: usize,
}

impl PictureData {
    /// Instantiates a new `PictureData` from the first slice header of a picture.
    pub fn new_from_slice(
        hdr: &SliceHeader,
        nal_ref_idc: u8,
        is_idr: bool,
        system_frame_number: u64,
        timestamp: u64,
    ) -> Self {
        let reference = if nal_ref_idc != 0 {
            Reference::ShortTerm
        } else {
            Reference::None
        };

        Self {
            pic_order_cnt_lsb: hdr.pic_order_cnt_lsb,
            delta_pic_order_cnt_bottom: hdr.delta_pic_order_cnt_bottom,
            delta_pic_order_cnt0: hdr.delta_pic_order_cnt[0],
            delta_pic_order_cnt1: hdr.delta_pic_order_cnt[1],
            frame_num: hdr.frame_num,
            pic_num: i32::from(hdr.frame_num),
            nal_ref_idc,
            is_idr: if is_idr {
                IsIdr::Yes { idr_pic_id: hdr.idr_pic_id }
            } else {
                IsIdr::No
            },
            reference,
            field: hdr.field(),
            system_frame_number,
            timestamp,
            dec_ref_pic_marking_bit_size: hdr.dec_ref_pic_marking_bit_size,
            pic_order_cnt_bit_size: hdr.pic_order_cnt_bit_size,
            ..Default::default()
        }
    }

    /// Whether the current picture is a reference, either ShortTerm or LongTerm.
    pub fn is_ref(&self) -> bool {
        !matches!(self.reference, Reference::None)
    }

    pub fn is_long_term(&self) -> bool {
        matches!(self.reference, Reference::LongTerm)
    }

    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn set_reference(&mut self, reference: Reference) {
        log::debug!("Set reference of {:?} to {:?}", self.system_frame_number, reference);
        self.reference = reference;
    }

    /// Whether the picture is a field of an interlaced stream.
    pub fn is_field(&self) -> bool {
        !matches!(self.field, Field::Frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::syntax::SliceHeaderBuilder;
    use crate::codec::h264::syntax::PpsBuilder;
    use crate::codec::h264::syntax::SpsBuilder;

    #[test]
    fn reference_from_nal_ref_idc() {
        let sps = SpsBuilder::new().build();
        let pps = PpsBuilder::new(sps).build();
        let hdr = SliceHeaderBuilder::new(&pps).frame_num(3).idr_pic_id(7).build();

        let pic = PictureData::new_from_slice(&hdr, 1, true, 0, 0);
        assert!(pic.is_ref());
        assert!(!pic.is_long_term());
        assert_eq!(pic.is_idr, IsIdr::Yes { idr_pic_id: 7 });
        assert_eq!(pic.frame_num, 3);

        let pic = PictureData::new_from_slice(&hdr, 0, false, 1, 0);
        assert!(!pic.is_ref());
        assert_eq!(pic.is_idr, IsIdr::No);
    }

    #[test]
    fn bottom_field() {
        let sps = SpsBuilder::new().frame_mbs_only_flag(false).build();
        let pps = PpsBuilder::new(sps).build();
        let hdr = SliceHeaderBuilder::new(&pps).bottom_field().build();

        let pic = PictureData::new_from_slice(&hdr, 1, false, 0, 0);
        assert!(pic.is_field());
        assert_eq!(pic.field, Field::Bottom);
        assert_eq!(pic.field.opposite(), Field::Top);
    }
}
