//! Slice segment header parsing.

use crate::error::{DecodeError, Result};
use crate::nal::{NalUnitType, UserData};
use crate::param::{Pps, Sps};
use crate::refpic::{ShortTermRefPicSet, MAX_NUM_REF_PICS};
use std::fmt;
use std::sync::Arc;
use vireo_core::bitstream::BitReader;
use vireo_core::image::ChromaFormat;

/// Slice type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SliceType {
    /// B slice (bi-directional prediction).
    B,
    /// P slice (forward prediction).
    P,
    /// I slice (intra only).
    I,
}

impl SliceType {
    /// Create from the coded value.
    pub fn from_raw(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::B),
            1 => Ok(Self::P),
            2 => Ok(Self::I),
            _ => Err(DecodeError::CodedParameterOutOfRange("slice_type")),
        }
    }

    /// Check if this is an intra slice.
    pub fn is_intra(&self) -> bool {
        matches!(self, Self::I)
    }

    /// Check if list 0 is used.
    pub fn uses_list0(&self) -> bool {
        !matches!(self, Self::I)
    }

    /// Check if list 1 is used.
    pub fn uses_list1(&self) -> bool {
        matches!(self, Self::B)
    }
}

impl fmt::Display for SliceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::B => write!(f, "B"),
            Self::P => write!(f, "P"),
            Self::I => write!(f, "I"),
        }
    }
}

/// Long-term reference entry as coded in the slice header.
#[derive(Debug, Clone, Copy)]
pub struct LtSliceEntry {
    /// POC LSB of the long-term picture.
    pub poc_lsb: u32,
    /// Referenced by the current picture.
    pub used_by_curr_pic: bool,
    /// Whether an MSB cycle is coded.
    pub has_msb: bool,
    /// delta_poc_msb_cycle_lt (accumulated per 7.4.7.1).
    pub msb_cycle: u32,
}

/// Explicit reference picture list modification.
#[derive(Debug, Clone, Default)]
pub struct RefListModification {
    /// Modified entry indices for list 0 (empty = unmodified).
    pub list0: Vec<u32>,
    /// Modified entry indices for list 1 (empty = unmodified).
    pub list1: Vec<u32>,
}

/// Parsed slice segment header.
#[derive(Debug, Clone)]
pub struct SliceSegmentHeader {
    /// First slice segment of the picture.
    pub first_slice_segment_in_pic_flag: bool,
    /// Drop prior pictures from the output queue (IRAP only).
    pub no_output_of_prior_pics_flag: bool,
    /// PPS id this slice refers to.
    pub slice_pic_parameter_set_id: u8,
    /// Dependent slice segment (inherits from the previous independent one).
    pub dependent_slice_segment_flag: bool,
    /// CTB address (raster scan) of the first CTB of this segment.
    pub slice_segment_address: u32,
    /// Slice type.
    pub slice_type: SliceType,
    /// Picture output flag.
    pub pic_output_flag: bool,
    /// Colour plane id when planes are coded separately.
    pub colour_plane_id: u8,
    /// POC LSB of the containing picture.
    pub slice_pic_order_cnt_lsb: u32,
    /// Effective short-term RPS for this picture.
    pub short_term_rps: ShortTermRefPicSet,
    /// Long-term references from SPS templates and slice syntax.
    pub long_term_refs: Vec<LtSliceEntry>,
    /// Temporal MVP enabled for this slice.
    pub slice_temporal_mvp_enabled_flag: bool,
    /// SAO on for luma.
    pub slice_sao_luma_flag: bool,
    /// SAO on for chroma.
    pub slice_sao_chroma_flag: bool,
    /// Active references in list 0, minus one.
    pub num_ref_idx_l0_active_minus1: u8,
    /// Active references in list 1, minus one.
    pub num_ref_idx_l1_active_minus1: u8,
    /// Reference list modification.
    pub ref_list_modification: RefListModification,
    /// mvd_l1_zero_flag.
    pub mvd_l1_zero_flag: bool,
    /// CABAC init flag.
    pub cabac_init_flag: bool,
    /// Collocated picture comes from list 0.
    pub collocated_from_l0_flag: bool,
    /// Collocated reference index.
    pub collocated_ref_idx: u8,
    /// Maximum number of merge candidates.
    pub max_num_merge_cand: u8,
    /// Slice QP delta against the PPS init QP.
    pub slice_qp_delta: i8,
    /// Slice-level Cb QP offset.
    pub slice_cb_qp_offset: i8,
    /// Slice-level Cr QP offset.
    pub slice_cr_qp_offset: i8,
    /// Deblocking disabled for this slice.
    pub slice_deblocking_filter_disabled_flag: bool,
    /// Beta offset / 2.
    pub slice_beta_offset_div2: i8,
    /// Tc offset / 2.
    pub slice_tc_offset_div2: i8,
    /// Loop filter may cross the slice boundary.
    pub slice_loop_filter_across_slices_enabled_flag: bool,
    /// Entry point offsets into the slice data (WPP rows or tiles).
    pub entry_point_offsets: Vec<u32>,
    /// Byte offset of the first slice-data byte in the RBSP.
    pub data_offset: usize,
}

impl SliceSegmentHeader {
    /// Parse a slice segment header against the active parameter sets.
    ///
    /// `inherit` supplies the previous independent segment's header for
    /// dependent slice segments.
    pub fn parse(
        rbsp: &[u8],
        sps: &Sps,
        pps: &Pps,
        nal_unit_type: NalUnitType,
        inherit: Option<&SliceSegmentHeader>,
    ) -> Result<Self> {
        let mut r = BitReader::new(rbsp);

        let first_slice_segment_in_pic_flag = r.read_bit()?;

        let no_output_of_prior_pics_flag = if nal_unit_type.is_irap() {
            r.read_bit()?
        } else {
            false
        };

        let slice_pic_parameter_set_id = r.read_ue()? as u8;

        let mut dependent_slice_segment_flag = false;
        let mut slice_segment_address = 0;
        if !first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                dependent_slice_segment_flag = r.read_bit()?;
            }
            slice_segment_address = r.read_bits(sps.slice_address_bits())?;
            if slice_segment_address >= sps.pic_size_in_ctbs() {
                return Err(DecodeError::CodedParameterOutOfRange(
                    "slice_segment_address",
                ));
            }
        }

        let mut hdr = if dependent_slice_segment_flag {
            let Some(prev) = inherit else {
                return Err(DecodeError::CodedParameterOutOfRange(
                    "dependent slice without preceding independent segment",
                ));
            };
            let mut hdr = prev.clone();
            hdr.first_slice_segment_in_pic_flag = first_slice_segment_in_pic_flag;
            hdr.no_output_of_prior_pics_flag = no_output_of_prior_pics_flag;
            hdr.slice_pic_parameter_set_id = slice_pic_parameter_set_id;
            hdr.dependent_slice_segment_flag = true;
            hdr.slice_segment_address = slice_segment_address;
            hdr.entry_point_offsets = Vec::new();
            hdr
        } else {
            Self::parse_independent(
                &mut r,
                sps,
                pps,
                nal_unit_type,
                first_slice_segment_in_pic_flag,
                no_output_of_prior_pics_flag,
                slice_pic_parameter_set_id,
                slice_segment_address,
            )?
        };

        // Entry point offsets are per-segment, parsed for dependent and
        // independent segments alike.
        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            let num_entry_point_offsets = r.read_ue()?;
            if num_entry_point_offsets > sps.pic_size_in_ctbs() {
                return Err(DecodeError::CodedParameterOutOfRange(
                    "num_entry_point_offsets",
                ));
            }
            if num_entry_point_offsets > 0 {
                let offset_len = r.read_ue()? as u8 + 1;
                if offset_len > 32 {
                    return Err(DecodeError::CodedParameterOutOfRange("offset_len_minus1"));
                }
                for _ in 0..num_entry_point_offsets {
                    hdr.entry_point_offsets.push(r.read_bits(offset_len)? + 1);
                }
            }
        }

        if pps.slice_segment_header_extension_present_flag {
            let len = r.read_ue()?;
            for _ in 0..len {
                r.skip(8)?;
            }
        }

        // byte_alignment()
        r.align_to_byte();
        hdr.data_offset = r.byte_position();

        Ok(hdr)
    }

    #[allow(clippy::too_many_arguments)]
    fn parse_independent(
        r: &mut BitReader,
        sps: &Sps,
        pps: &Pps,
        nal_unit_type: NalUnitType,
        first_slice_segment_in_pic_flag: bool,
        no_output_of_prior_pics_flag: bool,
        slice_pic_parameter_set_id: u8,
        slice_segment_address: u32,
    ) -> Result<Self> {
        for _ in 0..pps.num_extra_slice_header_bits {
            r.skip(1)?; // slice_reserved_flag
        }

        let slice_type = SliceType::from_raw(r.read_ue()?)?;

        let pic_output_flag = if pps.output_flag_present_flag {
            r.read_bit()?
        } else {
            true
        };

        let colour_plane_id = if sps.separate_colour_plane_flag {
            r.read_bits(2)? as u8
        } else {
            0
        };

        let mut slice_pic_order_cnt_lsb = 0;
        let mut short_term_rps = ShortTermRefPicSet::default();
        let mut long_term_refs = Vec::new();
        let mut slice_temporal_mvp_enabled_flag = false;

        if !nal_unit_type.is_idr() {
            slice_pic_order_cnt_lsb = r.read_bits(sps.log2_max_pic_order_cnt_lsb)?;

            let st_sps_flag = r.read_bit()?;
            if !st_sps_flag {
                short_term_rps = ShortTermRefPicSet::parse(
                    r,
                    sps.st_ref_pic_sets.len(),
                    sps.st_ref_pic_sets.len(),
                    &sps.st_ref_pic_sets,
                )?;
            } else if !sps.st_ref_pic_sets.is_empty() {
                let idx = if sps.st_ref_pic_sets.len() > 1 {
                    let bits = ceil_log2(sps.st_ref_pic_sets.len() as u32);
                    r.read_bits(bits)? as usize
                } else {
                    0
                };
                short_term_rps = sps
                    .st_ref_pic_sets
                    .get(idx)
                    .cloned()
                    .ok_or(DecodeError::CodedParameterOutOfRange(
                        "short_term_ref_pic_set_idx",
                    ))?;
            }

            if sps.long_term_ref_pics_present_flag {
                let num_long_term_sps = if !sps.lt_ref_pics.is_empty() {
                    r.read_ue()?
                } else {
                    0
                };
                let num_long_term_pics = r.read_ue()?;
                if num_long_term_sps as usize > sps.lt_ref_pics.len()
                    || (num_long_term_sps + num_long_term_pics) as usize > MAX_NUM_REF_PICS
                {
                    return Err(DecodeError::CodedParameterOutOfRange(
                        "long-term reference counts",
                    ));
                }

                let mut prev_msb_cycle = 0u32;
                for i in 0..(num_long_term_sps + num_long_term_pics) {
                    let (poc_lsb, used) = if i < num_long_term_sps {
                        let idx = if sps.lt_ref_pics.len() > 1 {
                            let bits = ceil_log2(sps.lt_ref_pics.len() as u32);
                            r.read_bits(bits)? as usize
                        } else {
                            0
                        };
                        let tmpl = &sps.lt_ref_pics[idx];
                        (
                            tmpl.lt_ref_pic_poc_lsb_sps,
                            tmpl.used_by_curr_pic_lt_sps_flag,
                        )
                    } else {
                        let lsb = r.read_bits(sps.log2_max_pic_order_cnt_lsb)?;
                        let used = r.read_bit()?;
                        (lsb, used)
                    };

                    let has_msb = r.read_bit()?;
                    let msb_cycle = if has_msb {
                        let delta = r.read_ue()?;
                        // Cumulative for i > num_long_term_sps per 7.4.7.1.
                        if i == 0 || i == num_long_term_sps {
                            prev_msb_cycle = delta;
                        } else {
                            prev_msb_cycle += delta;
                        }
                        prev_msb_cycle
                    } else {
                        0
                    };

                    long_term_refs.push(LtSliceEntry {
                        poc_lsb,
                        used_by_curr_pic: used,
                        has_msb,
                        msb_cycle,
                    });
                }
            }

            if sps.sps_temporal_mvp_enabled_flag {
                slice_temporal_mvp_enabled_flag = r.read_bit()?;
            }
        }

        let mut slice_sao_luma_flag = false;
        let mut slice_sao_chroma_flag = false;
        if sps.sample_adaptive_offset_enabled_flag {
            slice_sao_luma_flag = r.read_bit()?;
            if sps.chroma_format != ChromaFormat::Monochrome {
                slice_sao_chroma_flag = r.read_bit()?;
            }
        }

        let mut num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
        let mut num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
        let mut ref_list_modification = RefListModification::default();
        let mut mvd_l1_zero_flag = false;
        let mut cabac_init_flag = false;
        let mut collocated_from_l0_flag = true;
        let mut collocated_ref_idx = 0;
        let mut max_num_merge_cand = 5;

        if !slice_type.is_intra() {
            if r.read_bit()? {
                // num_ref_idx_active_override_flag
                num_ref_idx_l0_active_minus1 = r.read_ue()? as u8;
                if slice_type.uses_list1() {
                    num_ref_idx_l1_active_minus1 = r.read_ue()? as u8;
                }
                if num_ref_idx_l0_active_minus1 > 14 || num_ref_idx_l1_active_minus1 > 14 {
                    return Err(DecodeError::CodedParameterOutOfRange(
                        "num_ref_idx_active_minus1",
                    ));
                }
            }

            let num_pic_total_curr = {
                let st_used = short_term_rps
                    .used_by_curr_pic_s0
                    .iter()
                    .chain(short_term_rps.used_by_curr_pic_s1.iter())
                    .filter(|&&u| u)
                    .count();
                let lt_used = long_term_refs.iter().filter(|e| e.used_by_curr_pic).count();
                st_used + lt_used
            };

            if pps.lists_modification_present_flag && num_pic_total_curr > 1 {
                let list_entry_bits = ceil_log2(num_pic_total_curr as u32);
                if r.read_bit()? {
                    for _ in 0..=num_ref_idx_l0_active_minus1 {
                        ref_list_modification.list0.push(r.read_bits(list_entry_bits)?);
                    }
                }
                if slice_type.uses_list1() && r.read_bit()? {
                    for _ in 0..=num_ref_idx_l1_active_minus1 {
                        ref_list_modification.list1.push(r.read_bits(list_entry_bits)?);
                    }
                }
            }

            if slice_type.uses_list1() {
                mvd_l1_zero_flag = r.read_bit()?;
            }

            if pps.cabac_init_present_flag {
                cabac_init_flag = r.read_bit()?;
            }

            if slice_temporal_mvp_enabled_flag {
                if slice_type.uses_list1() {
                    collocated_from_l0_flag = r.read_bit()?;
                }
                let active_in_list = if collocated_from_l0_flag {
                    num_ref_idx_l0_active_minus1
                } else {
                    num_ref_idx_l1_active_minus1
                };
                if active_in_list > 0 {
                    collocated_ref_idx = r.read_ue()? as u8;
                    if collocated_ref_idx > active_in_list {
                        return Err(DecodeError::CodedParameterOutOfRange(
                            "collocated_ref_idx",
                        ));
                    }
                }
            }

            if (pps.weighted_pred_flag && slice_type == SliceType::P)
                || (pps.weighted_bipred_flag && slice_type == SliceType::B)
            {
                parse_pred_weight_table(
                    r,
                    sps,
                    slice_type,
                    num_ref_idx_l0_active_minus1,
                    num_ref_idx_l1_active_minus1,
                )?;
            }

            let five_minus = r.read_ue()?;
            if five_minus > 4 {
                return Err(DecodeError::CodedParameterOutOfRange(
                    "five_minus_max_num_merge_cand",
                ));
            }
            max_num_merge_cand = 5 - five_minus as u8;
        }

        let slice_qp_delta = r.read_se()? as i8;
        let qp = pps.init_qp() + slice_qp_delta as i32;
        if !(0..=51).contains(&qp) {
            return Err(DecodeError::CodedParameterOutOfRange("slice_qp_delta"));
        }

        let mut slice_cb_qp_offset = 0;
        let mut slice_cr_qp_offset = 0;
        if pps.pps_slice_chroma_qp_offsets_present_flag {
            slice_cb_qp_offset = r.read_se()? as i8;
            slice_cr_qp_offset = r.read_se()? as i8;
        }

        let mut slice_deblocking_filter_disabled_flag = pps.pps_deblocking_filter_disabled_flag;
        let mut slice_beta_offset_div2 = pps.pps_beta_offset_div2;
        let mut slice_tc_offset_div2 = pps.pps_tc_offset_div2;
        let deblocking_filter_override_flag = if pps.deblocking_filter_override_enabled_flag {
            r.read_bit()?
        } else {
            false
        };
        if deblocking_filter_override_flag {
            slice_deblocking_filter_disabled_flag = r.read_bit()?;
            if !slice_deblocking_filter_disabled_flag {
                slice_beta_offset_div2 = r.read_se()? as i8;
                slice_tc_offset_div2 = r.read_se()? as i8;
            }
        }

        let slice_loop_filter_across_slices_enabled_flag =
            if pps.pps_loop_filter_across_slices_enabled_flag
                && (slice_sao_luma_flag
                    || slice_sao_chroma_flag
                    || !slice_deblocking_filter_disabled_flag)
            {
                r.read_bit()?
            } else {
                pps.pps_loop_filter_across_slices_enabled_flag
            };

        Ok(Self {
            first_slice_segment_in_pic_flag,
            no_output_of_prior_pics_flag,
            slice_pic_parameter_set_id,
            dependent_slice_segment_flag: false,
            slice_segment_address,
            slice_type,
            pic_output_flag,
            colour_plane_id,
            slice_pic_order_cnt_lsb,
            short_term_rps,
            long_term_refs,
            slice_temporal_mvp_enabled_flag,
            slice_sao_luma_flag,
            slice_sao_chroma_flag,
            num_ref_idx_l0_active_minus1,
            num_ref_idx_l1_active_minus1,
            ref_list_modification,
            mvd_l1_zero_flag,
            cabac_init_flag,
            collocated_from_l0_flag,
            collocated_ref_idx,
            max_num_merge_cand,
            slice_qp_delta,
            slice_cb_qp_offset,
            slice_cr_qp_offset,
            slice_deblocking_filter_disabled_flag,
            slice_beta_offset_div2,
            slice_tc_offset_div2,
            slice_loop_filter_across_slices_enabled_flag,
            entry_point_offsets: Vec::new(),
            data_offset: 0,
        })
    }

    /// Slice QP (init QP plus delta).
    pub fn slice_qp(&self, pps: &Pps) -> i32 {
        pps.init_qp() + self.slice_qp_delta as i32
    }
}

impl fmt::Display for SliceSegmentHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "----- slice segment header -----")?;
        writeln!(
            f,
            "type: {}  pps: {}  address: {}  first: {}  dependent: {}",
            self.slice_type,
            self.slice_pic_parameter_set_id,
            self.slice_segment_address,
            self.first_slice_segment_in_pic_flag,
            self.dependent_slice_segment_flag
        )?;
        writeln!(
            f,
            "poc_lsb: {}  qp_delta: {}  sao: {}/{}  entry points: {}",
            self.slice_pic_order_cnt_lsb,
            self.slice_qp_delta,
            self.slice_sao_luma_flag,
            self.slice_sao_chroma_flag,
            self.entry_point_offsets.len()
        )?;
        Ok(())
    }
}

/// Parse and discard a pred_weight_table; the syntax must be consumed to
/// keep later elements aligned even though explicit weighting is applied
/// with default weights.
fn parse_pred_weight_table(
    r: &mut BitReader,
    sps: &Sps,
    slice_type: SliceType,
    num_ref_idx_l0_active_minus1: u8,
    num_ref_idx_l1_active_minus1: u8,
) -> Result<()> {
    let has_chroma = sps.chroma_format != ChromaFormat::Monochrome;

    let luma_log2_weight_denom = r.read_ue()?;
    if luma_log2_weight_denom > 7 {
        return Err(DecodeError::CodedParameterOutOfRange(
            "luma_log2_weight_denom",
        ));
    }
    if has_chroma {
        r.read_se()?; // delta_chroma_log2_weight_denom
    }

    let mut parse_list = |r: &mut BitReader, count: u8| -> Result<()> {
        let n = count as usize + 1;
        let mut luma_flags = vec![false; n];
        let mut chroma_flags = vec![false; n];
        for flag in luma_flags.iter_mut() {
            *flag = r.read_bit()?;
        }
        if has_chroma {
            for flag in chroma_flags.iter_mut() {
                *flag = r.read_bit()?;
            }
        }
        for i in 0..n {
            if luma_flags[i] {
                r.read_se()?; // delta_luma_weight
                r.read_se()?; // luma_offset
            }
            if chroma_flags[i] {
                for _ in 0..2 {
                    r.read_se()?; // delta_chroma_weight
                    r.read_se()?; // delta_chroma_offset
                }
            }
        }
        Ok(())
    };

    parse_list(r, num_ref_idx_l0_active_minus1)?;
    if slice_type.uses_list1() {
        parse_list(r, num_ref_idx_l1_active_minus1)?;
    }
    Ok(())
}

fn ceil_log2(n: u32) -> u8 {
    let mut bits = 0;
    while (1u32 << bits) < n {
        bits += 1;
    }
    bits
}

/// A slice segment ready for decoding: header plus its entropy-coded data.
#[derive(Debug, Clone)]
pub struct SliceUnit {
    /// Parsed header.
    pub header: SliceSegmentHeader,
    /// Complete RBSP of the slice NAL unit.
    pub rbsp: Arc<Vec<u8>>,
    /// NAL unit type that carried this slice.
    pub nal_unit_type: NalUnitType,
    /// Temporal sub-layer.
    pub temporal_id: u8,
    /// Presentation timestamp.
    pub pts: i64,
    /// Host-attached user data.
    pub user_data: UserData,
}

impl SliceUnit {
    /// The entropy-coded slice data following the header.
    pub fn data(&self) -> &[u8] {
        &self.rbsp[self.header.data_offset..]
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::param::tests::{build_pps_rbsp, build_sps_rbsp};
    use vireo_core::bitstream::BitWriter;

    fn sps_pps() -> (Sps, Pps) {
        let sps = Sps::parse(&build_sps_rbsp(128, 128, 6)).unwrap();
        let mut pps = Pps::parse(&build_pps_rbsp(0, 0)).unwrap();
        pps.bind(&sps).unwrap();
        (sps, pps)
    }

    /// Build an IDR I-slice header: first slice, no RPS syntax.
    pub(crate) fn build_idr_slice_header() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write_bit(true); // first_slice_segment_in_pic_flag
        w.write_bit(false); // no_output_of_prior_pics_flag
        w.write_ue(0); // slice_pic_parameter_set_id
        w.write_ue(2); // slice_type = I
        w.write_se(0); // slice_qp_delta
        w.write_bit(true); // slice_loop_filter_across_slices_enabled_flag
        w.write_rbsp_trailing_bits();
        w.into_data()
    }

    #[test]
    fn test_parse_idr_slice_header() {
        let (sps, pps) = sps_pps();
        let rbsp = build_idr_slice_header();
        let hdr =
            SliceSegmentHeader::parse(&rbsp, &sps, &pps, NalUnitType::IdrWRadl, None).unwrap();

        assert!(hdr.first_slice_segment_in_pic_flag);
        assert_eq!(hdr.slice_type, SliceType::I);
        assert_eq!(hdr.slice_pic_order_cnt_lsb, 0);
        assert_eq!(hdr.slice_qp(&pps), 26);
        assert!(hdr.pic_output_flag);
        assert!(hdr.data_offset > 0);
        assert!(hdr.entry_point_offsets.is_empty());
    }

    #[test]
    fn test_parse_trailing_p_slice_header() {
        let (sps, pps) = sps_pps();

        let mut w = BitWriter::new();
        w.write_bit(true); // first_slice_segment_in_pic_flag
        w.write_ue(0); // slice_pic_parameter_set_id
        w.write_ue(1); // slice_type = P
        w.write_bits(1, 8); // slice_pic_order_cnt_lsb (8 bits per SPS)
        w.write_bit(false); // short_term_ref_pic_set_sps_flag -> explicit RPS
        w.write_ue(1); // num_negative_pics
        w.write_ue(0); // num_positive_pics
        w.write_ue(0); // delta_poc_s0_minus1 -> -1
        w.write_bit(true); // used_by_curr_pic_s0
        w.write_bit(false); // num_ref_idx_active_override_flag
        w.write_ue(0); // five_minus_max_num_merge_cand
        w.write_se(2); // slice_qp_delta
        w.write_bit(true); // slice_loop_filter_across_slices_enabled_flag
        w.write_rbsp_trailing_bits();
        let rbsp = w.into_data();

        let hdr =
            SliceSegmentHeader::parse(&rbsp, &sps, &pps, NalUnitType::TrailR, None).unwrap();
        assert_eq!(hdr.slice_type, SliceType::P);
        assert_eq!(hdr.slice_pic_order_cnt_lsb, 1);
        assert_eq!(hdr.short_term_rps.delta_poc_s0, vec![-1]);
        assert_eq!(hdr.max_num_merge_cand, 5);
        assert_eq!(hdr.slice_qp(&pps), 28);
    }

    #[test]
    fn test_dependent_slice_requires_predecessor() {
        let sps = Sps::parse(&build_sps_rbsp(128, 128, 6)).unwrap();
        // PPS with dependent slices enabled.
        let mut w = BitWriter::new();
        w.write_ue(0); // pps id
        w.write_ue(0); // sps id
        w.write_bit(true); // dependent_slice_segments_enabled_flag
        w.write_bit(false);
        w.write_bits(0, 3);
        w.write_bit(false);
        w.write_bit(false);
        w.write_ue(0);
        w.write_ue(0);
        w.write_se(0);
        w.write_bit(false);
        w.write_bit(false);
        w.write_bit(false);
        w.write_se(0);
        w.write_se(0);
        w.write_bit(false);
        w.write_bit(false);
        w.write_bit(false);
        w.write_bit(false);
        w.write_bit(false);
        w.write_bit(false);
        w.write_bit(true);
        w.write_bit(false);
        w.write_bit(false);
        w.write_bit(false);
        w.write_ue(0);
        w.write_bit(false);
        w.write_bit(false);
        w.write_rbsp_trailing_bits();
        let mut pps = Pps::parse(&w.into_data()).unwrap();
        pps.bind(&sps).unwrap();

        // Dependent segment at address 1 with no predecessor.
        let mut w = BitWriter::new();
        w.write_bit(false); // first_slice_segment_in_pic_flag
        w.write_ue(0); // slice_pic_parameter_set_id
        w.write_bit(true); // dependent_slice_segment_flag
        w.write_bits(1, sps.slice_address_bits()); // slice_segment_address
        w.write_rbsp_trailing_bits();
        let rbsp = w.into_data();

        assert!(
            SliceSegmentHeader::parse(&rbsp, &sps, &pps, NalUnitType::TrailR, None).is_err()
        );
    }

    #[test]
    fn test_slice_qp_out_of_range_rejected() {
        let (sps, pps) = sps_pps();
        let mut w = BitWriter::new();
        w.write_bit(true);
        w.write_bit(false);
        w.write_ue(0);
        w.write_ue(2); // I
        w.write_se(40); // qp = 66, out of range
        w.write_rbsp_trailing_bits();
        let rbsp = w.into_data();

        assert!(
            SliceSegmentHeader::parse(&rbsp, &sps, &pps, NalUnitType::IdrWRadl, None).is_err()
        );
    }
}
