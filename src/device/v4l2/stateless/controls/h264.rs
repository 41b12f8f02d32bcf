// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Translation of the parsed H.264 syntax into the stateless H.264 control blocks.
//!
//! The control blocks mirror the layout of the `V4L2_CID_STATELESS_H264_*` compound controls.
//! They are plain values: building them has no side effect, and the whole set for one picture is
//! kept in a [`H264ControlBatch`] that is rewritten for every picture.

use anyhow::anyhow;
use log::warn;

use crate::codec::h264::dpb::DpbEntry;
use crate::codec::h264::picture::Field;
use crate::codec::h264::picture::IsIdr;
use crate::codec::h264::picture::PictureData;
use crate::codec::h264::picture::Reference;
use crate::codec::h264::syntax::Pps;
use crate::codec::h264::syntax::SliceHeader;
use crate::codec::h264::syntax::SliceType;
use crate::codec::h264::syntax::Sps;
use crate::decoder::stateless::DecodePhase;
use crate::decoder::stateless::StatelessBackendError;
use crate::decoder::stateless::StatelessBackendResult;

pub const V4L2_H264_SPS_CONSTRAINT_SET0_FLAG: u8 = 0x01;
pub const V4L2_H264_SPS_CONSTRAINT_SET1_FLAG: u8 = 0x02;
pub const V4L2_H264_SPS_CONSTRAINT_SET2_FLAG: u8 = 0x04;
pub const V4L2_H264_SPS_CONSTRAINT_SET3_FLAG: u8 = 0x08;
pub const V4L2_H264_SPS_CONSTRAINT_SET4_FLAG: u8 = 0x10;
pub const V4L2_H264_SPS_CONSTRAINT_SET5_FLAG: u8 = 0x20;

pub const V4L2_H264_SPS_FLAG_SEPARATE_COLOUR_PLANE: u32 = 0x01;
pub const V4L2_H264_SPS_FLAG_QPPRIME_Y_ZERO_TRANSFORM_BYPASS: u32 = 0x02;
pub const V4L2_H264_SPS_FLAG_DELTA_PIC_ORDER_ALWAYS_ZERO: u32 = 0x04;
pub const V4L2_H264_SPS_FLAG_GAPS_IN_FRAME_NUM_VALUE_ALLOWED: u32 = 0x08;
pub const V4L2_H264_SPS_FLAG_FRAME_MBS_ONLY: u32 = 0x10;
pub const V4L2_H264_SPS_FLAG_MB_ADAPTIVE_FRAME_FIELD: u32 = 0x20;
pub const V4L2_H264_SPS_FLAG_DIRECT_8X8_INFERENCE: u32 = 0x40;

pub const V4L2_H264_PPS_FLAG_ENTROPY_CODING_MODE: u16 = 0x01;
pub const V4L2_H264_PPS_FLAG_BOTTOM_FIELD_PIC_ORDER_IN_FRAME_PRESENT: u16 = 0x02;
pub const V4L2_H264_PPS_FLAG_WEIGHTED_PRED: u16 = 0x04;
pub const V4L2_H264_PPS_FLAG_DEBLOCKING_FILTER_CONTROL_PRESENT: u16 = 0x08;
pub const V4L2_H264_PPS_FLAG_CONSTRAINED_INTRA_PRED: u16 = 0x10;
pub const V4L2_H264_PPS_FLAG_REDUNDANT_PIC_CNT_PRESENT: u16 = 0x20;
pub const V4L2_H264_PPS_FLAG_TRANSFORM_8X8_MODE: u16 = 0x40;
pub const V4L2_H264_PPS_FLAG_SCALING_MATRIX_PRESENT: u16 = 0x80;

pub const V4L2_H264_DPB_ENTRY_FLAG_VALID: u32 = 0x01;
pub const V4L2_H264_DPB_ENTRY_FLAG_ACTIVE: u32 = 0x02;
pub const V4L2_H264_DPB_ENTRY_FLAG_LONG_TERM: u32 = 0x04;
pub const V4L2_H264_DPB_ENTRY_FLAG_FIELD: u32 = 0x08;

pub const V4L2_H264_TOP_FIELD_REF: u8 = 0x1;
pub const V4L2_H264_BOTTOM_FIELD_REF: u8 = 0x2;
pub const V4L2_H264_FRAME_REF: u8 = 0x3;

pub const V4L2_H264_DECODE_PARAM_FLAG_IDR_PIC: u32 = 0x01;
pub const V4L2_H264_DECODE_PARAM_FLAG_FIELD_PIC: u32 = 0x02;
pub const V4L2_H264_DECODE_PARAM_FLAG_BOTTOM_FIELD: u32 = 0x04;
pub const V4L2_H264_DECODE_PARAM_FLAG_PFRAME: u32 = 0x08;
pub const V4L2_H264_DECODE_PARAM_FLAG_BFRAME: u32 = 0x10;

pub const V4L2_H264_SLICE_FLAG_DIRECT_SPATIAL_MV_PRED: u32 = 0x01;
pub const V4L2_H264_SLICE_FLAG_SP_FOR_SWITCH: u32 = 0x02;

pub const V4L2_H264_NUM_DPB_ENTRIES: usize = 16;
pub const V4L2_H264_REF_LIST_LEN: usize = 2 * 16;

/// Raster position of each coefficient of a 4x4 block, in zig-zag scan order.
const ZIGZAG_4X4: [usize; 16] = [0, 1, 4, 8, 5, 2, 3, 6, 9, 12, 13, 10, 7, 11, 14, 15];

/// Raster position of each coefficient of a 8x8 block, in zig-zag scan order.
const ZIGZAG_8X8: [usize; 64] = [
    0, 1, 8, 16, 9, 2, 3, 10, 17, 24, 32, 25, 18, 11, 4, 5, 12, 19, 26, 33, 40, 48, 41, 34, 27, 20,
    13, 6, 7, 14, 21, 28, 35, 42, 49, 56, 57, 50, 43, 36, 29, 22, 15, 23, 30, 37, 44, 51, 58, 59,
    52, 45, 38, 31, 39, 46, 53, 60, 61, 54, 47, 55, 62, 63,
];

pub fn get_raster_from_zigzag_4x4(src: &[u8; 16], dst: &mut [u8; 16]) {
    for (i, &coef) in src.iter().enumerate() {
        dst[ZIGZAG_4X4[i]] = coef;
    }
}

pub fn get_raster_from_zigzag_8x8(src: &[u8; 64], dst: &mut [u8; 64]) {
    for (i, &coef) in src.iter().enumerate() {
        dst[ZIGZAG_8X8[i]] = coef;
    }
}

pub fn get_zigzag_from_raster_4x4(src: &[u8; 16], dst: &mut [u8; 16]) {
    for (i, coef) in dst.iter_mut().enumerate() {
        *coef = src[ZIGZAG_4X4[i]];
    }
}

pub fn get_zigzag_from_raster_8x8(src: &[u8; 64], dst: &mut [u8; 64]) {
    for (i, coef) in dst.iter_mut().enumerate() {
        *coef = src[ZIGZAG_8X8[i]];
    }
}

/// Identifier of a picture towards the device. The V4L2 convention is to use the buffer
/// timestamp in nanoseconds.
pub fn reference_ts(id: u64) -> u64 {
    id * 1000
}

fn field_ref(field: Field) -> u8 {
    match field {
        Field::Frame => V4L2_H264_FRAME_REF,
        Field::Top => V4L2_H264_TOP_FIELD_REF,
        Field::Bottom => V4L2_H264_BOTTOM_FIELD_REF,
    }
}

/// `struct v4l2_ctrl_h264_sps`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct V4l2CtrlH264Sps {
    pub profile_idc: u8,
    pub constraint_set_flags: u8,
    pub level_idc: u8,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub max_num_ref_frames: u8,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: [i32; 255],
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub pic_width_in_mbs_minus1: u16,
    pub pic_height_in_map_units_minus1: u16,
    pub flags: u32,
}

impl Default for V4l2CtrlH264Sps {
    fn default() -> Self {
        Self {
            profile_idc: 0,
            constraint_set_flags: 0,
            level_idc: 0,
            seq_parameter_set_id: 0,
            chroma_format_idc: 0,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            max_num_ref_frames: 0,
            num_ref_frames_in_pic_order_cnt_cycle: 0,
            offset_for_ref_frame: [0; 255],
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 0,
            flags: 0,
        }
    }
}

impl From<&Sps> for V4l2CtrlH264Sps {
    fn from(sps: &Sps) -> Self {
        let constraint_set_flags = [
            (sps.constraint_set0_flag, V4L2_H264_SPS_CONSTRAINT_SET0_FLAG),
            (sps.constraint_set1_flag, V4L2_H264_SPS_CONSTRAINT_SET1_FLAG),
            (sps.constraint_set2_flag, V4L2_H264_SPS_CONSTRAINT_SET2_FLAG),
            (sps.constraint_set3_flag, V4L2_H264_SPS_CONSTRAINT_SET3_FLAG),
            (sps.constraint_set4_flag, V4L2_H264_SPS_CONSTRAINT_SET4_FLAG),
            (sps.constraint_set5_flag, V4L2_H264_SPS_CONSTRAINT_SET5_FLAG),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, flag)| acc | flag);

        let flags = [
            (sps.separate_colour_plane_flag, V4L2_H264_SPS_FLAG_SEPARATE_COLOUR_PLANE),
            (
                sps.qpprime_y_zero_transform_bypass_flag,
                V4L2_H264_SPS_FLAG_QPPRIME_Y_ZERO_TRANSFORM_BYPASS,
            ),
            (sps.delta_pic_order_always_zero_flag, V4L2_H264_SPS_FLAG_DELTA_PIC_ORDER_ALWAYS_ZERO),
            (
                sps.gaps_in_frame_num_value_allowed_flag,
                V4L2_H264_SPS_FLAG_GAPS_IN_FRAME_NUM_VALUE_ALLOWED,
            ),
            (sps.frame_mbs_only_flag, V4L2_H264_SPS_FLAG_FRAME_MBS_ONLY),
            (sps.mb_adaptive_frame_field_flag, V4L2_H264_SPS_FLAG_MB_ADAPTIVE_FRAME_FIELD),
            (sps.direct_8x8_inference_flag, V4L2_H264_SPS_FLAG_DIRECT_8X8_INFERENCE),
        ]
        .into_iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, flag)| acc | flag);

        Self {
            profile_idc: sps.profile_idc,
            constraint_set_flags,
            level_idc: sps.level_idc,
            seq_parameter_set_id: sps.seq_parameter_set_id,
            chroma_format_idc: sps.chroma_format_idc,
            bit_depth_luma_minus8: sps.bit_depth_luma_minus8,
            bit_depth_chroma_minus8: sps.bit_depth_chroma_minus8,
            log2_max_frame_num_minus4: sps.log2_max_frame_num_minus4,
            pic_order_cnt_type: sps.pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb_minus4: sps.log2_max_pic_order_cnt_lsb_minus4,
            max_num_ref_frames: sps.max_num_ref_frames,
            num_ref_frames_in_pic_order_cnt_cycle: sps.num_ref_frames_in_pic_order_cnt_cycle,
            offset_for_ref_frame: sps.offset_for_ref_frame,
            offset_for_non_ref_pic: sps.offset_for_non_ref_pic,
            offset_for_top_to_bottom_field: sps.offset_for_top_to_bottom_field,
            pic_width_in_mbs_minus1: sps.pic_width_in_mbs_minus1,
            pic_height_in_map_units_minus1: sps.pic_height_in_map_units_minus1,
            flags,
        }
    }
}

/// `struct v4l2_ctrl_h264_pps`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct V4l2CtrlH264Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub num_slice_groups_minus1: u8,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub flags: u16,
}

impl From<&Pps> for V4l2CtrlH264Pps {
    fn from(pps: &Pps) -> Self {
        let mut flags: u16 = 0;
        if pps.entropy_coding_mode_flag {
            flags |= V4L2_H264_PPS_FLAG_ENTROPY_CODING_MODE;
        }
        if pps.bottom_field_pic_order_in_frame_present_flag {
            flags |= V4L2_H264_PPS_FLAG_BOTTOM_FIELD_PIC_ORDER_IN_FRAME_PRESENT;
        }
        if pps.weighted_pred_flag {
            flags |= V4L2_H264_PPS_FLAG_WEIGHTED_PRED;
        }
        if pps.deblocking_filter_control_present_flag {
            flags |= V4L2_H264_PPS_FLAG_DEBLOCKING_FILTER_CONTROL_PRESENT;
        }
        if pps.constrained_intra_pred_flag {
            flags |= V4L2_H264_PPS_FLAG_CONSTRAINED_INTRA_PRED;
        }
        if pps.redundant_pic_cnt_present_flag {
            flags |= V4L2_H264_PPS_FLAG_REDUNDANT_PIC_CNT_PRESENT;
        }
        if pps.transform_8x8_mode_flag {
            flags |= V4L2_H264_PPS_FLAG_TRANSFORM_8X8_MODE;
        }
        // The matrix control is always sent, so tell the driver to use it whenever either
        // parameter set carries one.
        if pps.pic_scaling_matrix_present_flag || pps.sps.seq_scaling_matrix_present_flag {
            flags |= V4L2_H264_PPS_FLAG_SCALING_MATRIX_PRESENT;
        }

        Self {
            pic_parameter_set_id: pps.pic_parameter_set_id,
            seq_parameter_set_id: pps.seq_parameter_set_id,
            num_slice_groups_minus1: pps.num_slice_groups_minus1 as u8,
            num_ref_idx_l0_default_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_default_active_minus1: pps.num_ref_idx_l1_default_active_minus1,
            weighted_bipred_idc: pps.weighted_bipred_idc,
            pic_init_qp_minus26: pps.pic_init_qp_minus26,
            pic_init_qs_minus26: pps.pic_init_qs_minus26,
            chroma_qp_index_offset: pps.chroma_qp_index_offset,
            second_chroma_qp_index_offset: pps.second_chroma_qp_index_offset,
            flags,
        }
    }
}

/// `struct v4l2_ctrl_h264_scaling_matrix`, in raster order.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct V4l2CtrlH264ScalingMatrix {
    pub scaling_list_4x4: [[u8; 16]; 6],
    pub scaling_list_8x8: [[u8; 64]; 6],
}

impl Default for V4l2CtrlH264ScalingMatrix {
    fn default() -> Self {
        Self { scaling_list_4x4: [[0; 16]; 6], scaling_list_8x8: [[0; 64]; 6] }
    }
}

impl V4l2CtrlH264ScalingMatrix {
    /// Number of 8x8 lists carried for a given `chroma_format_idc`.
    pub fn num_8x8_lists(chroma_format_idc: u8) -> usize {
        if chroma_format_idc == 3 {
            6
        } else {
            2
        }
    }

    /// Fills the matrix from the picture parameter set if it carries its own lists, or from its
    /// sequence parameter set otherwise.
    pub fn set(&mut self, pps: &Pps) -> &mut Self {
        let (lists_4x4, lists_8x8) = if pps.pic_scaling_matrix_present_flag {
            (&pps.scaling_lists_4x4, &pps.scaling_lists_8x8)
        } else {
            (&pps.sps.scaling_lists_4x4, &pps.sps.scaling_lists_8x8)
        };

        for (src, dst) in lists_4x4.iter().zip(self.scaling_list_4x4.iter_mut()) {
            get_raster_from_zigzag_4x4(src, dst);
        }

        let num_8x8 = Self::num_8x8_lists(pps.sps.chroma_format_idc);
        for (i, dst) in self.scaling_list_8x8.iter_mut().enumerate() {
            if i < num_8x8 {
                get_raster_from_zigzag_8x8(&lists_8x8[i], dst);
            } else {
                *dst = [0; 64];
            }
        }

        self
    }
}

/// `struct v4l2_h264_dpb_entry`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct V4l2H264DpbEntry {
    pub reference_ts: u64,
    pub pic_num: u32,
    pub frame_num: u16,
    pub fields: u8,
    pub reserved: [u8; 5],
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub flags: u32,
}

impl From<&PictureData> for V4l2H264DpbEntry {
    fn from(pic: &PictureData) -> Self {
        let (frame_num, pic_num): (u16, u32) = match pic.reference() {
            Reference::LongTerm => (pic.long_term_frame_idx as u16, pic.long_term_pic_num),
            _ => (pic.frame_num, pic.pic_num as u32),
        };

        let mut flags: u32 = V4L2_H264_DPB_ENTRY_FLAG_VALID;
        if pic.is_ref() {
            flags |= V4L2_H264_DPB_ENTRY_FLAG_ACTIVE;
        }
        if pic.is_long_term() {
            flags |= V4L2_H264_DPB_ENTRY_FLAG_LONG_TERM;
        }
        if pic.is_field() {
            flags |= V4L2_H264_DPB_ENTRY_FLAG_FIELD;
        }

        Self {
            reference_ts: reference_ts(pic.system_frame_number),
            pic_num,
            frame_num,
            fields: field_ref(pic.field),
            reserved: [0; 5],
            top_field_order_cnt: pic.top_field_order_cnt,
            bottom_field_order_cnt: pic.bottom_field_order_cnt,
            flags,
        }
    }
}

/// `struct v4l2_ctrl_h264_decode_params`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct V4l2CtrlH264DecodeParams {
    pub dpb: [V4l2H264DpbEntry; V4L2_H264_NUM_DPB_ENTRIES],
    pub nal_ref_idc: u16,
    pub frame_num: u16,
    pub top_field_order_cnt: i32,
    pub bottom_field_order_cnt: i32,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt0: i32,
    pub delta_pic_order_cnt1: i32,
    pub dec_ref_pic_marking_bit_size: u32,
    pub pic_order_cnt_bit_size: u32,
    pub slice_group_change_cycle: u32,
    pub reserved: u32,
    pub flags: u32,
}

impl V4l2CtrlH264DecodeParams {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_picture_data(&mut self, pic: &PictureData) -> &mut Self {
        self.top_field_order_cnt = pic.top_field_order_cnt;
        self.bottom_field_order_cnt = pic.bottom_field_order_cnt;
        self.flags |= match pic.field {
            Field::Top => V4L2_H264_DECODE_PARAM_FLAG_FIELD_PIC,
            Field::Bottom => {
                V4L2_H264_DECODE_PARAM_FLAG_FIELD_PIC | V4L2_H264_DECODE_PARAM_FLAG_BOTTOM_FIELD
            }
            Field::Frame => 0,
        };
        if let IsIdr::Yes { idr_pic_id } = pic.is_idr {
            self.flags |= V4L2_H264_DECODE_PARAM_FLAG_IDR_PIC;
            self.idr_pic_id = idr_pic_id;
        }
        self.nal_ref_idc = u16::from(pic.nal_ref_idc);
        self.frame_num = pic.frame_num;
        self.pic_order_cnt_lsb = pic.pic_order_cnt_lsb;
        self.delta_pic_order_cnt_bottom = pic.delta_pic_order_cnt_bottom;
        self.delta_pic_order_cnt0 = pic.delta_pic_order_cnt0;
        self.delta_pic_order_cnt1 = pic.delta_pic_order_cnt1;
        self.dec_ref_pic_marking_bit_size = pic.dec_ref_pic_marking_bit_size as u32;
        self.pic_order_cnt_bit_size = pic.pic_order_cnt_bit_size as u32;
        self
    }

    pub fn set_slice_header(&mut self, hdr: &SliceHeader) -> &mut Self {
        self.flags |= match hdr.slice_type {
            SliceType::P | SliceType::Sp => V4L2_H264_DECODE_PARAM_FLAG_PFRAME,
            SliceType::B => V4L2_H264_DECODE_PARAM_FLAG_BFRAME,
            SliceType::I | SliceType::Si => 0,
        };
        self
    }

    /// Fills the DPB array from `entries`, skipping the non-existing pictures. Returns the number
    /// of entries written; the remaining ones are zeroed.
    pub fn set_dpb_entries<T>(&mut self, entries: &[DpbEntry<T>]) -> usize {
        self.dpb = Default::default();

        let mut num_entries = 0;
        for entry in entries.iter().filter(|e| e.reference.is_some()) {
            if num_entries == V4L2_H264_NUM_DPB_ENTRIES {
                warn!("DPB holds more than {} pictures, ignoring the rest", num_entries);
                break;
            }
            self.dpb[num_entries] = V4l2H264DpbEntry::from(&*entry.pic.borrow());
            num_entries += 1;
        }

        num_entries
    }

    /// Position in the DPB array of the picture with `reference_ts`.
    pub fn dpb_index(&self, reference_ts: u64) -> Option<usize> {
        self.dpb.iter().position(|e| {
            e.flags & V4L2_H264_DPB_ENTRY_FLAG_VALID != 0 && e.reference_ts == reference_ts
        })
    }
}

/// `struct v4l2_h264_reference`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct V4l2H264Reference {
    pub fields: u8,
    /// Index into the DPB array of the decode parameters.
    pub index: u8,
}

/// `struct v4l2_ctrl_h264_slice_params`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct V4l2CtrlH264SliceParams {
    pub header_bit_size: u32,
    pub first_mb_in_slice: u32,
    pub slice_type: u8,
    pub colour_plane_id: u8,
    pub redundant_pic_cnt: u8,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub slice_qs_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub reserved: u8,
    pub ref_pic_list0: [V4l2H264Reference; V4L2_H264_REF_LIST_LEN],
    pub ref_pic_list1: [V4l2H264Reference; V4L2_H264_REF_LIST_LEN],
    pub flags: u32,
}

impl From<&SliceHeader> for V4l2CtrlH264SliceParams {
    fn from(hdr: &SliceHeader) -> Self {
        let mut flags = 0;
        if hdr.direct_spatial_mv_pred_flag {
            flags |= V4L2_H264_SLICE_FLAG_DIRECT_SPATIAL_MV_PRED;
        }
        if hdr.sp_for_switch_flag {
            flags |= V4L2_H264_SLICE_FLAG_SP_FOR_SWITCH;
        }

        Self {
            header_bit_size: hdr.header_bit_size as u32,
            first_mb_in_slice: hdr.first_mb_in_slice,
            slice_type: hdr.slice_type as u8,
            colour_plane_id: hdr.colour_plane_id,
            redundant_pic_cnt: hdr.redundant_pic_cnt,
            cabac_init_idc: hdr.cabac_init_idc,
            slice_qp_delta: hdr.slice_qp_delta,
            slice_qs_delta: hdr.slice_qs_delta,
            disable_deblocking_filter_idc: hdr.disable_deblocking_filter_idc,
            slice_alpha_c0_offset_div2: hdr.slice_alpha_c0_offset_div2,
            slice_beta_offset_div2: hdr.slice_beta_offset_div2,
            num_ref_idx_l0_active_minus1: hdr.num_ref_idx_l0_active_minus1,
            num_ref_idx_l1_active_minus1: hdr.num_ref_idx_l1_active_minus1,
            flags,
            ..Default::default()
        }
    }
}

/// `enum v4l2_stateless_h264_decode_mode`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum V4l2CtrlH264DecodeMode {
    SliceBased = 0,
    #[default]
    FrameBased = 1,
}

/// `enum v4l2_stateless_h264_start_code`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum V4l2CtrlH264StartCode {
    None = 0,
    #[default]
    AnnexB = 1,
}

/// A reference picture list entry, kept by identifier until the DPB array is final.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingReference {
    reference_ts: u64,
    fields: u8,
}

fn pending_references<T>(list: &[DpbEntry<T>]) -> Vec<PendingReference> {
    list.iter()
        .take(V4L2_H264_REF_LIST_LEN)
        .map(|entry| {
            let pic = entry.pic.borrow();
            PendingReference {
                reference_ts: reference_ts(pic.system_frame_number),
                fields: field_ref(pic.field),
            }
        })
        .collect()
}

/// All the controls attached to the request of one picture.
///
/// This is scratch state of the submission path: it is reset when a picture starts and copied
/// by the device when the request controls are set.
#[derive(Clone, Debug, Default)]
pub struct H264ControlBatch {
    pub sps: V4l2CtrlH264Sps,
    pub pps: V4l2CtrlH264Pps,
    pub scaling_matrix: V4l2CtrlH264ScalingMatrix,
    pub decode_params: V4l2CtrlH264DecodeParams,
    /// One entry per slice of the picture, in bitstream order.
    pub slice_params: Vec<V4l2CtrlH264SliceParams>,
    pub decode_mode: V4l2CtrlH264DecodeMode,
    pub start_code: V4l2CtrlH264StartCode,
    /// Number of valid entries in `decode_params.dpb`.
    num_dpb_entries: usize,
    pending_refs: Vec<[Vec<PendingReference>; 2]>,
}

impl H264ControlBatch {
    pub fn new() -> Self {
        Default::default()
    }

    /// Resets the batch for a new picture and translates its parameter sets.
    pub fn start_picture(&mut self, pic: &PictureData, pps: &Pps, hdr: &SliceHeader) -> &mut Self {
        self.sps = V4l2CtrlH264Sps::from(pps.sps.as_ref());
        self.pps = V4l2CtrlH264Pps::from(pps);
        self.scaling_matrix.set(pps);
        self.decode_params = V4l2CtrlH264DecodeParams::new();
        self.decode_params.set_picture_data(pic).set_slice_header(hdr);
        self.slice_params.clear();
        self.pending_refs.clear();
        self.num_dpb_entries = 0;
        self.decode_mode = V4l2CtrlH264DecodeMode::FrameBased;
        self.start_code = V4l2CtrlH264StartCode::AnnexB;
        self
    }

    /// Adds the parameters of one slice along with its reference picture lists.
    pub fn push_slice<T>(
        &mut self,
        hdr: &SliceHeader,
        ref_pic_list0: &[DpbEntry<T>],
        ref_pic_list1: &[DpbEntry<T>],
    ) -> &mut Self {
        self.slice_params.push(V4l2CtrlH264SliceParams::from(hdr));
        self.pending_refs
            .push([pending_references(ref_pic_list0), pending_references(ref_pic_list1)]);
        self
    }

    /// Snapshots `entries` into the DPB array and resolves the reference lists of all the slices
    /// against it.
    ///
    /// Fails if a slice refers to a picture that is not part of `entries`: no index would point
    /// at the right picture.
    pub fn set_dpb<T>(&mut self, entries: &[DpbEntry<T>]) -> StatelessBackendResult<&mut Self> {
        self.num_dpb_entries = self.decode_params.set_dpb_entries(entries);

        for (params, lists) in self.slice_params.iter_mut().zip(&self.pending_refs) {
            let targets = [&mut params.ref_pic_list0, &mut params.ref_pic_list1];
            for (target, pending) in targets.into_iter().zip(lists) {
                *target = Default::default();
                for (dst, reference) in target.iter_mut().zip(pending) {
                    let index =
                        self.decode_params.dpb_index(reference.reference_ts).ok_or_else(|| {
                            StatelessBackendError::fatal(
                                DecodePhase::Controls,
                                anyhow!("reference {} is not in the DPB", reference.reference_ts),
                            )
                        })?;
                    *dst = V4l2H264Reference { fields: reference.fields, index: index as u8 };
                }
            }
        }

        Ok(self)
    }

    /// The valid entries of the DPB array.
    pub fn dpb_entries(&self) -> &[V4l2H264DpbEntry] {
        &self.decode_params.dpb[..self.num_dpb_entries]
    }
}

#[cfg(feature = "v4l2")]
mod v4l2r_conv {
    use v4l2r::bindings::v4l2_ctrl_h264_decode_params;
    use v4l2r::bindings::v4l2_ctrl_h264_pps;
    use v4l2r::bindings::v4l2_ctrl_h264_scaling_matrix;
    use v4l2r::bindings::v4l2_ctrl_h264_slice_params;
    use v4l2r::bindings::v4l2_ctrl_h264_sps;
    use v4l2r::bindings::v4l2_h264_dpb_entry;
    use v4l2r::bindings::v4l2_h264_reference;

    use super::*;

    impl From<&V4l2CtrlH264Sps> for v4l2_ctrl_h264_sps {
        fn from(sps: &V4l2CtrlH264Sps) -> Self {
            Self {
                profile_idc: sps.profile_idc,
                constraint_set_flags: sps.constraint_set_flags,
                level_idc: sps.level_idc,
                seq_parameter_set_id: sps.seq_parameter_set_id,
                chroma_format_idc: sps.chroma_format_idc,
                bit_depth_luma_minus8: sps.bit_depth_luma_minus8,
                bit_depth_chroma_minus8: sps.bit_depth_chroma_minus8,
                log2_max_frame_num_minus4: sps.log2_max_frame_num_minus4,
                pic_order_cnt_type: sps.pic_order_cnt_type,
                log2_max_pic_order_cnt_lsb_minus4: sps.log2_max_pic_order_cnt_lsb_minus4,
                max_num_ref_frames: sps.max_num_ref_frames,
                num_ref_frames_in_pic_order_cnt_cycle: sps.num_ref_frames_in_pic_order_cnt_cycle,
                offset_for_ref_frame: sps.offset_for_ref_frame,
                offset_for_non_ref_pic: sps.offset_for_non_ref_pic,
                offset_for_top_to_bottom_field: sps.offset_for_top_to_bottom_field,
                pic_width_in_mbs_minus1: sps.pic_width_in_mbs_minus1,
                pic_height_in_map_units_minus1: sps.pic_height_in_map_units_minus1,
                flags: sps.flags,
                ..Default::default()
            }
        }
    }

    impl From<&V4l2CtrlH264Pps> for v4l2_ctrl_h264_pps {
        fn from(pps: &V4l2CtrlH264Pps) -> Self {
            Self {
                pic_parameter_set_id: pps.pic_parameter_set_id,
                seq_parameter_set_id: pps.seq_parameter_set_id,
                num_slice_groups_minus1: pps.num_slice_groups_minus1,
                num_ref_idx_l0_default_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
                num_ref_idx_l1_default_active_minus1: pps.num_ref_idx_l1_default_active_minus1,
                weighted_bipred_idc: pps.weighted_bipred_idc,
                pic_init_qp_minus26: pps.pic_init_qp_minus26,
                pic_init_qs_minus26: pps.pic_init_qs_minus26,
                chroma_qp_index_offset: pps.chroma_qp_index_offset,
                second_chroma_qp_index_offset: pps.second_chroma_qp_index_offset,
                flags: pps.flags,
                ..Default::default()
            }
        }
    }

    impl From<&V4l2CtrlH264ScalingMatrix> for v4l2_ctrl_h264_scaling_matrix {
        fn from(matrix: &V4l2CtrlH264ScalingMatrix) -> Self {
            Self {
                scaling_list_4x4: matrix.scaling_list_4x4,
                scaling_list_8x8: matrix.scaling_list_8x8,
            }
        }
    }

    impl From<&V4l2H264DpbEntry> for v4l2_h264_dpb_entry {
        fn from(entry: &V4l2H264DpbEntry) -> Self {
            Self {
                reference_ts: entry.reference_ts,
                pic_num: entry.pic_num,
                frame_num: entry.frame_num,
                fields: entry.fields,
                top_field_order_cnt: entry.top_field_order_cnt,
                bottom_field_order_cnt: entry.bottom_field_order_cnt,
                flags: entry.flags,
                ..Default::default()
            }
        }
    }

    impl From<&V4l2CtrlH264DecodeParams> for v4l2_ctrl_h264_decode_params {
        fn from(params: &V4l2CtrlH264DecodeParams) -> Self {
            let mut dpb: [v4l2_h264_dpb_entry; V4L2_H264_NUM_DPB_ENTRIES] = Default::default();
            for (dst, src) in dpb.iter_mut().zip(params.dpb.iter()) {
                *dst = src.into();
            }

            Self {
                dpb,
                nal_ref_idc: params.nal_ref_idc,
                frame_num: params.frame_num,
                top_field_order_cnt: params.top_field_order_cnt,
                bottom_field_order_cnt: params.bottom_field_order_cnt,
                idr_pic_id: params.idr_pic_id,
                pic_order_cnt_lsb: params.pic_order_cnt_lsb,
                delta_pic_order_cnt_bottom: params.delta_pic_order_cnt_bottom,
                delta_pic_order_cnt0: params.delta_pic_order_cnt0,
                delta_pic_order_cnt1: params.delta_pic_order_cnt1,
                dec_ref_pic_marking_bit_size: params.dec_ref_pic_marking_bit_size,
                pic_order_cnt_bit_size: params.pic_order_cnt_bit_size,
                slice_group_change_cycle: params.slice_group_change_cycle,
                flags: params.flags,
                ..Default::default()
            }
        }
    }

    impl From<&V4l2CtrlH264SliceParams> for v4l2_ctrl_h264_slice_params {
        fn from(params: &V4l2CtrlH264SliceParams) -> Self {
            let convert = |list: &[V4l2H264Reference; V4L2_H264_REF_LIST_LEN]| {
                let mut out: [v4l2_h264_reference; V4L2_H264_REF_LIST_LEN] = Default::default();
                for (dst, src) in out.iter_mut().zip(list.iter()) {
                    dst.fields = src.fields;
                    dst.index = src.index;
                }
                out
            };

            Self {
                header_bit_size: params.header_bit_size,
                first_mb_in_slice: params.first_mb_in_slice,
                slice_type: params.slice_type,
                colour_plane_id: params.colour_plane_id,
                redundant_pic_cnt: params.redundant_pic_cnt,
                cabac_init_idc: params.cabac_init_idc,
                slice_qp_delta: params.slice_qp_delta,
                slice_qs_delta: params.slice_qs_delta,
                disable_deblocking_filter_idc: params.disable_deblocking_filter_idc,
                slice_alpha_c0_offset_div2: params.slice_alpha_c0_offset_div2,
                slice_beta_offset_div2: params.slice_beta_offset_div2,
                num_ref_idx_l0_active_minus1: params.num_ref_idx_l0_active_minus1,
                num_ref_idx_l1_active_minus1: params.num_ref_idx_l1_active_minus1,
                ref_pic_list0: convert(&params.ref_pic_list0),
                ref_pic_list1: convert(&params.ref_pic_list1),
                flags: params.flags,
                ..Default::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::codec::h264::syntax::PpsBuilder;
    use crate::codec::h264::syntax::SliceHeaderBuilder;
    use crate::codec::h264::syntax::SpsBuilder;

    fn ramp<const N: usize>(start: u8) -> [u8; N] {
        let mut out = [0; N];
        for (i, v) in out.iter_mut().enumerate() {
            *v = start.wrapping_add(i as u8);
        }
        out
    }

    #[test]
    fn zigzag_round_trip() {
        let src_4x4: [u8; 16] = ramp(1);
        let mut raster = [0; 16];
        let mut back = [0; 16];
        get_raster_from_zigzag_4x4(&src_4x4, &mut raster);
        get_zigzag_from_raster_4x4(&raster, &mut back);
        assert_eq!(back, src_4x4);
        // Third coefficient in scan order lands on the second row.
        assert_eq!(raster[4], 3);

        let src_8x8: [u8; 64] = ramp(100);
        let mut raster = [0; 64];
        let mut back = [0; 64];
        get_raster_from_zigzag_8x8(&src_8x8, &mut raster);
        get_zigzag_from_raster_8x8(&raster, &mut back);
        assert_eq!(back, src_8x8);
        assert_eq!(raster[63], 163);
        assert_eq!(raster[8], 102);
    }

    #[test]
    fn scaling_matrix_8x8_count_follows_chroma_format() {
        let lists_8x8 = [ramp(1), ramp(2), ramp(3), ramp(4), ramp(5), ramp(6)];
        let lists_4x4 = [[7; 16]; 6];

        let sps = SpsBuilder::new().chroma_format_idc(3).build();
        let pps = PpsBuilder::new(sps).scaling_lists(lists_4x4, lists_8x8).build();
        let mut matrix = V4l2CtrlH264ScalingMatrix::default();
        matrix.set(&pps);
        assert!(matrix.scaling_list_8x8.iter().all(|l| l.iter().any(|&c| c != 0)));
        assert_eq!(matrix.scaling_list_4x4, [[7; 16]; 6]);

        let sps = SpsBuilder::new().chroma_format_idc(1).build();
        let pps = PpsBuilder::new(sps).scaling_lists(lists_4x4, lists_8x8).build();
        // Start from garbage to check the unused lists are cleared.
        let mut matrix = V4l2CtrlH264ScalingMatrix {
            scaling_list_4x4: [[0xff; 16]; 6],
            scaling_list_8x8: [[0xff; 64]; 6],
        };
        matrix.set(&pps);
        assert_eq!(matrix.scaling_list_8x8[0][0], 1);
        assert_eq!(matrix.scaling_list_8x8[1][0], 2);
        assert!(matrix.scaling_list_8x8[2..].iter().all(|l| *l == [0; 64]));
    }

    #[test]
    fn scaling_matrix_falls_back_to_sps() {
        let sps = SpsBuilder::new().scaling_lists([[9; 16]; 6], [[10; 64]; 6]).build();
        let pps = PpsBuilder::new(sps).build();

        let mut matrix = V4l2CtrlH264ScalingMatrix::default();
        matrix.set(&pps);
        assert_eq!(matrix.scaling_list_4x4[5], [9; 16]);
        assert_eq!(matrix.scaling_list_8x8[1], [10; 64]);

        let pps_ctrl = V4l2CtrlH264Pps::from(pps.as_ref());
        assert_ne!(pps_ctrl.flags & V4L2_H264_PPS_FLAG_SCALING_MATRIX_PRESENT, 0);
    }

    #[test]
    fn sps_flags_are_packed() {
        let sps = SpsBuilder::new()
            .constraint_set_flags([true, false, true, false, false, true])
            .direct_8x8_inference_flag(true)
            .resolution(320, 240)
            .build();

        let ctrl = V4l2CtrlH264Sps::from(sps.as_ref());
        assert_eq!(
            ctrl.constraint_set_flags,
            V4L2_H264_SPS_CONSTRAINT_SET0_FLAG
                | V4L2_H264_SPS_CONSTRAINT_SET2_FLAG
                | V4L2_H264_SPS_CONSTRAINT_SET5_FLAG
        );
        assert_eq!(
            ctrl.flags,
            V4L2_H264_SPS_FLAG_FRAME_MBS_ONLY | V4L2_H264_SPS_FLAG_DIRECT_8X8_INFERENCE
        );
        assert_eq!(ctrl.pic_width_in_mbs_minus1, 19);
        assert_eq!(ctrl.pic_height_in_map_units_minus1, 14);
    }

    fn reference(id: u64, reference: Reference) -> DpbEntry<u64> {
        let mut pic = PictureData::default();
        pic.system_frame_number = id;
        pic.frame_num = id as u16;
        pic.set_reference(reference);
        DpbEntry { pic: Rc::new(RefCell::new(pic)), reference: Some(id) }
    }

    #[test]
    fn batch_resolves_references_against_final_dpb() {
        let sps = SpsBuilder::new().build();
        let pps = PpsBuilder::new(sps).build();
        let hdr = SliceHeaderBuilder::new(&pps).slice_type(SliceType::B).build();
        let pic = PictureData::new_from_slice(&hdr, 0, false, 9, 0);

        let a = reference(3, Reference::ShortTerm);
        let b = reference(5, Reference::LongTerm);

        let mut batch = H264ControlBatch::new();
        batch.start_picture(&pic, &pps, &hdr);
        batch.push_slice(&hdr, &[b.clone()], &[a.clone(), b.clone()]);
        batch.set_dpb(&[a, b]).unwrap();

        assert_eq!(batch.slice_params.len(), 1);
        assert_eq!(batch.dpb_entries().len(), 2);
        assert_eq!(batch.dpb_entries()[1].reference_ts, 5000);
        assert_ne!(batch.dpb_entries()[1].flags & V4L2_H264_DPB_ENTRY_FLAG_LONG_TERM, 0);
        assert_eq!(batch.slice_params[0].ref_pic_list0[0].index, 1);
        assert_eq!(batch.slice_params[0].ref_pic_list1[0].index, 0);
        assert_eq!(batch.slice_params[0].ref_pic_list1[1].fields, V4L2_H264_FRAME_REF);
        assert_ne!(batch.decode_params.flags & V4L2_H264_DECODE_PARAM_FLAG_BFRAME, 0);
    }

    #[test]
    fn batch_without_references() {
        let sps = SpsBuilder::new().build();
        let pps = PpsBuilder::new(sps).build();
        let hdr = SliceHeaderBuilder::new(&pps).slice_type(SliceType::I).idr_pic_id(4).build();
        let pic = PictureData::new_from_slice(&hdr, 1, true, 0, 0);

        let mut batch = H264ControlBatch::new();
        batch.start_picture(&pic, &pps, &hdr);
        batch.push_slice::<u64>(&hdr, &[], &[]);
        batch.set_dpb::<u64>(&[]).unwrap();

        assert!(batch.dpb_entries().is_empty());
        assert_eq!(batch.decode_params.idr_pic_id, 4);
        assert_eq!(batch.decode_params.flags, V4L2_H264_DECODE_PARAM_FLAG_IDR_PIC);
        assert_eq!(batch.decode_mode, V4l2CtrlH264DecodeMode::FrameBased);
        assert_eq!(batch.start_code, V4l2CtrlH264StartCode::AnnexB);
    }

    #[test]
    fn reference_missing_from_dpb_fails() {
        let sps = SpsBuilder::new().build();
        let pps = PpsBuilder::new(sps).build();
        let hdr = SliceHeaderBuilder::new(&pps).slice_type(SliceType::P).build();
        let pic = PictureData::new_from_slice(&hdr, 1, false, 4, 0);

        let kept = reference(1, Reference::ShortTerm);
        let dropped = reference(2, Reference::ShortTerm);

        let mut batch = H264ControlBatch::new();
        batch.start_picture(&pic, &pps, &hdr);
        batch.push_slice(&hdr, &[dropped], &[]);
        let err = batch.set_dpb(&[kept]).err().unwrap();
        assert_eq!(err.phase(), Some(DecodePhase::Controls));
    }
}
