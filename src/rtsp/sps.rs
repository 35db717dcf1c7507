//! Sequence parameter set parsing.
//!
//! The probe needs geometry (and, when the camera writes VUI timing,
//! the framerate) before the media graph can be built. Only the fields
//! up to that point are parsed; everything later in the SPS is ignored.

use crate::error::{AppError, Result};

/// Exp-Golomb bit reader over an RBSP (emulation prevention removed).
struct BitReader {
    data: Vec<u8>,
    pos: usize, // in bits
}

impl BitReader {
    fn new(nal_payload: &[u8]) -> Self {
        // strip emulation prevention: 00 00 03 -> 00 00
        let mut data = Vec::with_capacity(nal_payload.len());
        let mut zeros = 0u32;
        for &byte in nal_payload {
            if zeros >= 2 && byte == 3 {
                zeros = 0;
                continue;
            }
            if byte == 0 {
                zeros += 1;
            } else {
                zeros = 0;
            }
            data.push(byte);
        }
        Self { data, pos: 0 }
    }

    fn bit(&mut self) -> Result<u32> {
        let byte = self
            .data
            .get(self.pos / 8)
            .ok_or_else(|| AppError::Video("SPS truncated".into()))?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Ok(bit as u32)
    }

    fn bits(&mut self, count: u32) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.bit()?;
        }
        Ok(value)
    }

    fn skip(&mut self, count: u32) -> Result<()> {
        for _ in 0..count {
            self.bit()?;
        }
        Ok(())
    }

    /// ue(v)
    fn ue(&mut self) -> Result<u32> {
        let mut leading_zeros = 0u32;
        while self.bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(AppError::Video("SPS exp-Golomb overflow".into()));
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.bits(leading_zeros)?;
        Ok((1u32 << leading_zeros) - 1 + suffix)
    }

    /// se(v)
    fn se(&mut self) -> Result<i32> {
        let code = self.ue()?;
        let value = code.div_ceil(2) as i32;
        Ok(if code % 2 == 0 { -value } else { value })
    }
}

/// Fields extracted from an H.264 SPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
    /// From VUI timing info, when present.
    pub framerate: Option<(u32, u32)>,
}

impl H264SpsInfo {
    /// profile-level-id as used in SDP fmtp lines.
    pub fn profile_level_id(&self, constraint_flags: u8) -> String {
        format!(
            "{:02x}{:02x}{:02x}",
            self.profile_idc, constraint_flags, self.level_idc
        )
    }
}

/// Parse an H.264 SPS NAL unit (with its one-byte header, no start code).
pub fn parse_h264_sps(nal: &[u8]) -> Result<H264SpsInfo> {
    if nal.len() < 4 || nal[0] & 0x1f != 7 {
        return Err(AppError::Video("not an H264 SPS NAL".into()));
    }
    let mut r = BitReader::new(&nal[1..]);

    let profile_idc = r.bits(8)? as u8;
    r.skip(8)?; // constraint flags + reserved
    let level_idc = r.bits(8)? as u8;
    let _sps_id = r.ue()?;

    let mut chroma_format_idc = 1;
    if matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
    ) {
        chroma_format_idc = r.ue()?;
        if chroma_format_idc == 3 {
            r.skip(1)?; // separate_colour_plane_flag
        }
        let _bit_depth_luma = r.ue()?;
        let _bit_depth_chroma = r.ue()?;
        r.skip(1)?; // qpprime_y_zero_transform_bypass_flag
        if r.bit()? == 1 {
            // seq_scaling_matrix_present_flag
            let lists = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..lists {
                if r.bit()? == 1 {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    let _log2_max_frame_num = r.ue()?;
    let pic_order_cnt_type = r.ue()?;
    if pic_order_cnt_type == 0 {
        let _log2_max_poc = r.ue()?;
    } else if pic_order_cnt_type == 1 {
        r.skip(1)?;
        let _offset_non_ref = r.se()?;
        let _offset_top_bottom = r.se()?;
        let cycles = r.ue()?;
        for _ in 0..cycles {
            let _ = r.se()?;
        }
    }
    let _max_num_ref_frames = r.ue()?;
    r.skip(1)?; // gaps_in_frame_num_value_allowed_flag

    let pic_width_in_mbs = r.ue()? + 1;
    let pic_height_in_map_units = r.ue()? + 1;
    let frame_mbs_only = r.bit()?;
    if frame_mbs_only == 0 {
        r.skip(1)?; // mb_adaptive_frame_field_flag
    }
    r.skip(1)?; // direct_8x8_inference_flag

    let mut crop = [0u32; 4]; // left, right, top, bottom
    if r.bit()? == 1 {
        for value in crop.iter_mut() {
            *value = r.ue()?;
        }
    }

    // 4:2:0 crop units; monochrome and 4:4:4 cameras are not a thing
    // on this path, so SubWidthC/SubHeightC of 2 is assumed.
    let _ = chroma_format_idc;
    let crop_unit_x = 2;
    let crop_unit_y = 2 * (2 - frame_mbs_only);

    let width = pic_width_in_mbs * 16 - (crop[0] + crop[1]) * crop_unit_x;
    let height =
        pic_height_in_map_units * 16 * (2 - frame_mbs_only) - (crop[2] + crop[3]) * crop_unit_y;

    let mut framerate = None;
    if r.bit()? == 1 {
        // vui_parameters_present_flag
        framerate = parse_vui_timing(&mut r).unwrap_or(None);
    }

    Ok(H264SpsInfo {
        profile_idc,
        level_idc,
        width,
        height,
        framerate,
    })
}

fn skip_scaling_list(r: &mut BitReader, size: u32) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Walk the VUI far enough to reach timing_info. Field framerate is
/// carried as field rate, hence the division by two.
fn parse_vui_timing(r: &mut BitReader) -> Result<Option<(u32, u32)>> {
    if r.bit()? == 1 {
        // aspect_ratio_info
        let idc = r.bits(8)?;
        if idc == 255 {
            r.skip(32)?; // sar width + height
        }
    }
    if r.bit()? == 1 {
        r.skip(1)?; // overscan_appropriate_flag
    }
    if r.bit()? == 1 {
        // video_signal_type
        r.skip(4)?; // format + full_range_flag
        if r.bit()? == 1 {
            r.skip(24)?; // colour description
        }
    }
    if r.bit()? == 1 {
        // chroma_loc_info
        let _ = r.ue()?;
        let _ = r.ue()?;
    }
    if r.bit()? == 1 {
        // timing_info_present_flag
        let num_units_in_tick = r.bits(32)?;
        let time_scale = r.bits(32)?;
        if num_units_in_tick > 0 && time_scale > 0 {
            return Ok(Some((time_scale, num_units_in_tick * 2)));
        }
    }
    Ok(None)
}

/// Fields extracted from an H.265 SPS: geometry only. HEVC VUI timing
/// is rarely present on IP cameras; the probe falls back to the SDP
/// hint or timestamp measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H265SpsInfo {
    pub width: u32,
    pub height: u32,
}

/// Parse an H.265 SPS NAL unit (two-byte header, no start code).
pub fn parse_h265_sps(nal: &[u8]) -> Result<H265SpsInfo> {
    if nal.len() < 4 || (nal[0] >> 1) & 0x3f != 33 {
        return Err(AppError::Video("not an H265 SPS NAL".into()));
    }
    let mut r = BitReader::new(&nal[2..]);

    r.skip(4)?; // sps_video_parameter_set_id
    let max_sub_layers_minus1 = r.bits(3)?;
    r.skip(1)?; // sps_temporal_id_nesting_flag
    skip_profile_tier_level(&mut r, max_sub_layers_minus1)?;

    let _sps_id = r.ue()?;
    let chroma_format_idc = r.ue()?;
    if chroma_format_idc == 3 {
        r.skip(1)?;
    }
    let mut width = r.ue()?;
    let mut height = r.ue()?;
    if r.bit()? == 1 {
        // conformance_window
        let left = r.ue()?;
        let right = r.ue()?;
        let top = r.ue()?;
        let bottom = r.ue()?;
        let (sub_w, sub_h) = match chroma_format_idc {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };
        width = width.saturating_sub((left + right) * sub_w);
        height = height.saturating_sub((top + bottom) * sub_h);
    }

    Ok(H265SpsInfo { width, height })
}

fn skip_profile_tier_level(r: &mut BitReader, max_sub_layers_minus1: u32) -> Result<()> {
    r.skip(2 + 1 + 5)?; // profile_space, tier, profile_idc
    r.skip(32)?; // compatibility flags
    r.skip(48)?; // constraint flags
    r.skip(8)?; // level_idc

    let mut profile_present = [false; 8];
    let mut level_present = [false; 8];
    for i in 0..max_sub_layers_minus1 as usize {
        profile_present[i] = r.bit()? == 1;
        level_present[i] = r.bit()? == 1;
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            r.skip(2)?;
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if profile_present[i] {
            r.skip(2 + 1 + 5 + 32 + 48)?;
        }
        if level_present[i] {
            r.skip(8)?;
        }
    }
    Ok(())
}

/// 1080p25 SPS with VUI timing, shared with the probe tests.
#[cfg(test)]
pub(crate) fn tests_sps_1080p25() -> Vec<u8> {
    tests::build_baseline_sps(Some((50, 1)))
}
