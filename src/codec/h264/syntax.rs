// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 syntax structures as produced by the stream parser.
//!
//! Parsing itself happens upstream. The structures below are immutable once handed over and only
//! carry what the control-block translation needs. Scaling lists are kept in the zig-zag order in
//! which they appear in the bitstream.

// Can't reasonably expect client code to consume everything that has been parsed.
#![allow(dead_code)]

use std::rc::Rc;

use enumn::N;

use crate::codec::h264::picture::Field;
use crate::Rect;

/// Flat scaling list, used when no list is transmitted (`Flat_4x4_16`).
pub const FLAT_4X4: [u8; 16] = [16; 16];

/// Flat scaling list, used when no list is transmitted (`Flat_8x8_16`).
pub const FLAT_8X8: [u8; 64] = [16; 64];

#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Profile {
    Baseline = 66,
    Main = 77,
    Extended = 88,
    High = 100,
    High10 = 110,
    High422P = 122,
    High444P = 244,
}

/// `slice_type` modulo 5.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    #[default]
    P = 0,
    B = 1,
    I = 2,
    Sp = 3,
    Si = 4,
}

/// Sequence parameter set, as handed over by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sps {
    pub seq_parameter_set_id: u8,
    pub profile_idc: u8,
    pub level_idc: u8,

    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub constraint_set2_flag: bool,
    pub constraint_set3_flag: bool,
    pub constraint_set4_flag: bool,
    pub constraint_set5_flag: bool,

    /// 0 for monochrome, then 4:2:0, 4:2:2 and 4:4:4.
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub qpprime_y_zero_transform_bypass_flag: bool,

    /// Lists below are flat when unset.
    pub seq_scaling_matrix_present_flag: bool,
    pub scaling_lists_4x4: [[u8; 16]; 6],
    pub scaling_lists_8x8: [[u8; 64]; 6],

    pub log2_max_frame_num_minus4: u8,
    pub pic_order_cnt_type: u8,
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub delta_pic_order_always_zero_flag: bool,
    pub offset_for_non_ref_pic: i32,
    pub offset_for_top_to_bottom_field: i32,
    pub num_ref_frames_in_pic_order_cnt_cycle: u8,
    pub offset_for_ref_frame: [i32; 255],

    /// Upper bound of the reference frames any picture of the sequence uses.
    pub max_num_ref_frames: u8,
    pub gaps_in_frame_num_value_allowed_flag: bool,

    /// Width in macroblocks, minus one.
    pub pic_width_in_mbs_minus1: u16,
    /// Height in map units, minus one. A map unit spans two macroblock rows in field coding.
    pub pic_height_in_map_units_minus1: u16,
    pub frame_mbs_only_flag: bool,
    pub mb_adaptive_frame_field_flag: bool,
    pub direct_8x8_inference_flag: bool,

    pub frame_cropping_flag: bool,
    pub frame_crop_left_offset: u32,
    pub frame_crop_right_offset: u32,
    pub frame_crop_top_offset: u32,
    pub frame_crop_bottom_offset: u32,
}

impl Sps {
    /// Coded width, in pixels.
    pub const fn width(&self) -> u32 {
        (self.pic_width_in_mbs_minus1 as u32 + 1) * 16
    }

    /// Coded height of a frame, in pixels.
    pub const fn height(&self) -> u32 {
        let map_unit_height = if self.frame_mbs_only_flag { 16 } else { 32 };
        (self.pic_height_in_map_units_minus1 as u32 + 1) * map_unit_height
    }

    /// `ChromaArrayType`: the chroma format, or 0 when colour planes are coded separately.
    pub const fn chroma_array_type(&self) -> u8 {
        if self.separate_colour_plane_flag {
            0
        } else {
            self.chroma_format_idc
        }
    }

    /// Horizontal and vertical size of the units the cropping offsets are expressed in.
    fn crop_units(&self) -> (u32, u32) {
        let field_factor = if self.frame_mbs_only_flag { 1 } else { 2 };
        let (sub_width, sub_height) = match self.chroma_array_type() {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };

        (sub_width, sub_height * field_factor)
    }

    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }

    /// Area of the coded frame that is meant to be displayed.
    pub fn visible_rectangle(&self) -> Rect {
        let mut rect = Rect { x: 0, y: 0, width: self.width(), height: self.height() };
        if !self.frame_cropping_flag {
            return rect;
        }

        let (unit_x, unit_y) = self.crop_units();
        let left = unit_x * self.frame_crop_left_offset;
        let top = unit_y * self.frame_crop_top_offset;
        rect.x = left;
        rect.y = top;
        rect.width = rect.width.saturating_sub(left + unit_x * self.frame_crop_right_offset);
        rect.height = rect.height.saturating_sub(top + unit_y * self.frame_crop_bottom_offset);

        rect
    }
}

impl Default for Sps {
    fn default() -> Self {
        Self {
            seq_parameter_set_id: 0,
            profile_idc: Profile::Main as u8,
            level_idc: 10,
            constraint_set0_flag: false,
            constraint_set1_flag: false,
            constraint_set2_flag: false,
            constraint_set3_flag: false,
            constraint_set4_flag: false,
            constraint_set5_flag: false,
            chroma_format_idc: 1,
            separate_colour_plane_flag: false,
            bit_depth_luma_minus8: 0,
            bit_depth_chroma_minus8: 0,
            qpprime_y_zero_transform_bypass_flag: false,
            seq_scaling_matrix_present_flag: false,
            scaling_lists_4x4: [FLAT_4X4; 6],
            scaling_lists_8x8: [FLAT_8X8; 6],
            log2_max_frame_num_minus4: 0,
            pic_order_cnt_type: 0,
            log2_max_pic_order_cnt_lsb_minus4: 0,
            delta_pic_order_always_zero_flag: false,
            offset_for_non_ref_pic: 0,
            offset_for_top_to_bottom_field: 0,
            num_ref_frames_in_pic_order_cnt_cycle: 0,
            offset_for_ref_frame: [0; 255],
            max_num_ref_frames: 0,
            gaps_in_frame_num_value_allowed_flag: false,
            pic_width_in_mbs_minus1: 0,
            pic_height_in_map_units_minus1: 0,
            frame_mbs_only_flag: true,
            mb_adaptive_frame_field_flag: false,
            direct_8x8_inference_flag: false,
            frame_cropping_flag: false,
            frame_crop_left_offset: 0,
            frame_crop_right_offset: 0,
            frame_crop_top_offset: 0,
            frame_crop_bottom_offset: 0,
        }
    }
}

/// Builds the parameter sets the parser would hand over, mostly for tests.
#[derive(Default)]
pub struct SpsBuilder(Sps);

impl SpsBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn profile(mut self, profile: Profile) -> Self {
        self.0.profile_idc = profile as u8;
        self
    }

    pub fn chroma_format_idc(mut self, value: u8) -> Self {
        self.0.chroma_format_idc = value;
        self
    }

    pub fn constraint_set_flags(mut self, flags: [bool; 6]) -> Self {
        [
            self.0.constraint_set0_flag,
            self.0.constraint_set1_flag,
            self.0.constraint_set2_flag,
            self.0.constraint_set3_flag,
            self.0.constraint_set4_flag,
            self.0.constraint_set5_flag,
        ] = flags;
        self
    }

    pub fn max_num_ref_frames(mut self, value: u8) -> Self {
        self.0.max_num_ref_frames = value;
        self
    }

    pub fn frame_mbs_only_flag(mut self, value: bool) -> Self {
        self.0.frame_mbs_only_flag = value;
        self
    }

    pub fn direct_8x8_inference_flag(mut self, value: bool) -> Self {
        self.0.direct_8x8_inference_flag = value;
        self
    }

    pub fn scaling_lists(mut self, lists_4x4: [[u8; 16]; 6], lists_8x8: [[u8; 64]; 6]) -> Self {
        self.0.seq_scaling_matrix_present_flag = true;
        self.0.scaling_lists_4x4 = lists_4x4;
        self.0.scaling_lists_8x8 = lists_8x8;
        self
    }

    /// Sets the coded size to cover `width`x`height`, cropping the padding away at the
    /// right and bottom. Must come after the chroma format and frame coding are set.
    pub fn resolution(mut self, width: u32, height: u32) -> Self {
        let map_unit_height = if self.0.frame_mbs_only_flag { 16 } else { 32 };
        let mbs_wide = width.div_ceil(16);
        let map_units_high = height.div_ceil(map_unit_height);
        self.0.pic_width_in_mbs_minus1 = (mbs_wide - 1) as u16;
        self.0.pic_height_in_map_units_minus1 = (map_units_high - 1) as u16;

        let pad_right = mbs_wide * 16 - width;
        let pad_bottom = map_units_high * map_unit_height - height;
        if pad_right > 0 || pad_bottom > 0 {
            let (unit_x, unit_y) = self.0.crop_units();
            self.0.frame_cropping_flag = true;
            self.0.frame_crop_left_offset = 0;
            self.0.frame_crop_top_offset = 0;
            self.0.frame_crop_right_offset = pad_right / unit_x;
            self.0.frame_crop_bottom_offset = pad_bottom / unit_y;
        }

        self
    }

    pub fn build(self) -> Rc<Sps> {
        Rc::new(self.0)
    }
}

/// Picture parameter set, as handed over by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pps {
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,

    /// CABAC when set.
    pub entropy_coding_mode_flag: bool,
    pub bottom_field_pic_order_in_frame_present_flag: bool,
    pub num_slice_groups_minus1: u32,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_idc: u8,
    pub pic_init_qp_minus26: i8,
    pub pic_init_qs_minus26: i8,
    pub chroma_qp_index_offset: i8,
    pub second_chroma_qp_index_offset: i8,
    pub deblocking_filter_control_present_flag: bool,
    pub constrained_intra_pred_flag: bool,
    pub redundant_pic_cnt_present_flag: bool,
    pub transform_8x8_mode_flag: bool,

    /// When set, the lists below replace the ones of the sequence.
    pub pic_scaling_matrix_present_flag: bool,
    pub scaling_lists_4x4: [[u8; 16]; 6],
    pub scaling_lists_8x8: [[u8; 64]; 6],

    /// Sequence this picture parameter set was activated with.
    pub sps: Rc<Sps>,
}

pub struct PpsBuilder(Pps);

impl PpsBuilder {
    pub fn new(sps: Rc<Sps>) -> Self {
        Self(Pps {
            pic_parameter_set_id: 0,
            seq_parameter_set_id: sps.seq_parameter_set_id,
            entropy_coding_mode_flag: false,
            bottom_field_pic_order_in_frame_present_flag: false,
            num_slice_groups_minus1: 0,
            num_ref_idx_l0_default_active_minus1: 0,
            num_ref_idx_l1_default_active_minus1: 0,
            weighted_pred_flag: false,
            weighted_bipred_idc: 0,
            pic_init_qp_minus26: 0,
            pic_init_qs_minus26: 0,
            chroma_qp_index_offset: 0,
            second_chroma_qp_index_offset: 0,
            deblocking_filter_control_present_flag: false,
            constrained_intra_pred_flag: false,
            redundant_pic_cnt_present_flag: false,
            transform_8x8_mode_flag: false,
            pic_scaling_matrix_present_flag: false,
            scaling_lists_4x4: [FLAT_4X4; 6],
            scaling_lists_8x8: [FLAT_8X8; 6],
            sps,
        })
    }

    pub fn scaling_lists(mut self, lists_4x4: [[u8; 16]; 6], lists_8x8: [[u8; 64]; 6]) -> Self {
        self.0.pic_scaling_matrix_present_flag = true;
        self.0.scaling_lists_4x4 = lists_4x4;
        self.0.scaling_lists_8x8 = lists_8x8;
        self
    }

    pub fn build(self) -> Rc<Pps> {
        Rc::new(self.0)
    }
}

/// Slice header fields the accelerator needs.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u8,
    pub colour_plane_id: u8,
    pub frame_num: u16,
    pub field_pic_flag: bool,
    pub bottom_field_flag: bool,
    pub idr_pic_id: u16,
    pub pic_order_cnt_lsb: u16,
    pub delta_pic_order_cnt_bottom: i32,
    pub delta_pic_order_cnt: [i32; 2],
    pub redundant_pic_cnt: u8,
    pub direct_spatial_mv_pred_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub cabac_init_idc: u8,
    pub slice_qp_delta: i8,
    pub sp_for_switch_flag: bool,
    pub slice_qs_delta: i8,
    pub disable_deblocking_filter_idc: u8,
    pub slice_alpha_c0_offset_div2: i8,
    pub slice_beta_offset_div2: i8,

    // Bit sizes measured by the parser, for accelerators that skip the header themselves.
    pub header_bit_size: usize,
    pub pic_order_cnt_bit_size: usize,
    pub dec_ref_pic_marking_bit_size: usize,
    pub n_emulation_prevention_bytes: usize,
}

impl SliceHeader {
    pub fn field(&self) -> Field {
        match (self.field_pic_flag, self.bottom_field_flag) {
            (false, _) => Field::Frame,
            (true, false) => Field::Top,
            (true, true) => Field::Bottom,
        }
    }
}

pub struct SliceHeaderBuilder(SliceHeader);

impl SliceHeaderBuilder {
    pub fn new(pps: &Pps) -> Self {
        Self(SliceHeader {
            pic_parameter_set_id: pps.pic_parameter_set_id,
            num_ref_idx_l0_active_minus1: pps.num_ref_idx_l0_default_active_minus1,
            num_ref_idx_l1_active_minus1: pps.num_ref_idx_l1_default_active_minus1,
            ..Default::default()
        })
    }

    pub fn slice_type(mut self, slice_type: SliceType) -> Self {
        self.0.slice_type = slice_type;
        self
    }

    pub fn frame_num(mut self, value: u16) -> Self {
        self.0.frame_num = value;
        self
    }

    pub fn idr_pic_id(mut self, value: u16) -> Self {
        self.0.idr_pic_id = value;
        self
    }

    pub fn bottom_field(mut self) -> Self {
        self.0.field_pic_flag = true;
        self.0.bottom_field_flag = true;
        self
    }

    pub fn build(self) -> SliceHeader {
        self.0
    }
}

/// A slice handed over by the parser.
pub struct Slice<'a> {
    pub header: SliceHeader,
    /// The NAL unit the slice was parsed from, header byte included and start code excluded.
    pub nalu: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cropped_resolution() {
        let sps = SpsBuilder::new().resolution(1920, 1080).build();

        assert_eq!((sps.width(), sps.height()), (1920, 1088));
        assert_eq!(sps.visible_rectangle(), Rect { x: 0, y: 0, width: 1920, height: 1080 });
    }

    #[test]
    fn interlaced_height_counts_map_units_twice() {
        let sps = SpsBuilder::new().frame_mbs_only_flag(false).resolution(720, 576).build();

        assert_eq!(sps.pic_height_in_map_units_minus1, 17);
        assert_eq!(sps.height(), 576);
        assert!(!sps.frame_cropping_flag);
    }

    #[test]
    fn values_from_the_bitstream() {
        let sps = SpsBuilder::new().profile(Profile::High444P).chroma_format_idc(3).build();

        assert_eq!(Profile::n(sps.profile_idc), Some(Profile::High444P));
        assert_eq!(sps.chroma_array_type(), 3);
        assert_eq!(SliceType::n(1), Some(SliceType::B));
        assert_eq!(SliceType::n(5), None);
    }
}
