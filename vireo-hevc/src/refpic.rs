//! Reference picture sets.
//!
//! Short-term reference picture sets are parsed either explicitly or by
//! prediction from a previously parsed set; the decoder derives from them
//! (plus the long-term entries of the slice header) the five POC lists that
//! partition the DPB before each picture is decoded.

use crate::error::{DecodeError, Result};
use vireo_core::bitstream::BitReader;

/// Upper bound on pictures in one reference picture set.
pub const MAX_NUM_REF_PICS: usize = 16;

/// A short-term reference picture set.
#[derive(Debug, Clone, Default)]
pub struct ShortTermRefPicSet {
    /// POC deltas of pictures preceding the current one (negative values,
    /// ordered by decreasing POC, i.e. -1 before -2).
    pub delta_poc_s0: Vec<i32>,
    /// Whether each S0 entry is referenced by the current picture.
    pub used_by_curr_pic_s0: Vec<bool>,
    /// POC deltas of pictures following the current one (positive values,
    /// ordered by increasing POC).
    pub delta_poc_s1: Vec<i32>,
    /// Whether each S1 entry is referenced by the current picture.
    pub used_by_curr_pic_s1: Vec<bool>,
}

impl ShortTermRefPicSet {
    /// Number of negative (earlier) pictures.
    pub fn num_negative_pics(&self) -> usize {
        self.delta_poc_s0.len()
    }

    /// Number of positive (later) pictures.
    pub fn num_positive_pics(&self) -> usize {
        self.delta_poc_s1.len()
    }

    /// Total number of delta POCs.
    pub fn num_delta_pocs(&self) -> usize {
        self.num_negative_pics() + self.num_positive_pics()
    }

    /// Parse a `short_term_ref_pic_set` syntax structure.
    ///
    /// `st_rps_idx` is the index of the set being parsed;
    /// `num_short_term_ref_pic_sets` the SPS set count (a set parsed in a
    /// slice header uses `st_rps_idx == num_short_term_ref_pic_sets`), and
    /// `prev_sets` the sets parsed so far.
    pub fn parse(
        reader: &mut BitReader,
        st_rps_idx: usize,
        num_short_term_ref_pic_sets: usize,
        prev_sets: &[ShortTermRefPicSet],
    ) -> Result<Self> {
        let inter_pred = if st_rps_idx != 0 {
            reader.read_bit()?
        } else {
            false
        };

        if inter_pred {
            Self::parse_predicted(reader, st_rps_idx, num_short_term_ref_pic_sets, prev_sets)
        } else {
            Self::parse_explicit(reader)
        }
    }

    fn parse_explicit(reader: &mut BitReader) -> Result<Self> {
        let num_negative_pics = reader.read_ue()? as usize;
        let num_positive_pics = reader.read_ue()? as usize;
        if num_negative_pics + num_positive_pics > MAX_NUM_REF_PICS {
            return Err(DecodeError::CodedParameterOutOfRange("num_delta_pocs"));
        }

        let mut delta_poc_s0 = Vec::with_capacity(num_negative_pics);
        let mut used_by_curr_pic_s0 = Vec::with_capacity(num_negative_pics);
        let mut last = 0i32;
        for _ in 0..num_negative_pics {
            let delta = reader.read_ue()? as i32 + 1;
            last -= delta;
            delta_poc_s0.push(last);
            used_by_curr_pic_s0.push(reader.read_bit()?);
        }

        let mut delta_poc_s1 = Vec::with_capacity(num_positive_pics);
        let mut used_by_curr_pic_s1 = Vec::with_capacity(num_positive_pics);
        let mut last = 0i32;
        for _ in 0..num_positive_pics {
            let delta = reader.read_ue()? as i32 + 1;
            last += delta;
            delta_poc_s1.push(last);
            used_by_curr_pic_s1.push(reader.read_bit()?);
        }

        Ok(Self {
            delta_poc_s0,
            used_by_curr_pic_s0,
            delta_poc_s1,
            used_by_curr_pic_s1,
        })
    }

    fn parse_predicted(
        reader: &mut BitReader,
        st_rps_idx: usize,
        num_short_term_ref_pic_sets: usize,
        prev_sets: &[ShortTermRefPicSet],
    ) -> Result<Self> {
        let delta_idx_minus1 = if st_rps_idx == num_short_term_ref_pic_sets {
            reader.read_ue()? as usize
        } else {
            0
        };
        if delta_idx_minus1 + 1 > st_rps_idx {
            return Err(DecodeError::CodedParameterOutOfRange("delta_idx_minus1"));
        }
        let ref_idx = st_rps_idx - (delta_idx_minus1 + 1);
        let ref_set = prev_sets
            .get(ref_idx)
            .ok_or(DecodeError::CodedParameterOutOfRange("RefRpsIdx"))?;

        let delta_rps_sign = reader.read_bit()?;
        let abs_delta_rps = reader.read_ue()? as i32 + 1;
        let delta_rps = if delta_rps_sign {
            -abs_delta_rps
        } else {
            abs_delta_rps
        };

        let num_delta = ref_set.num_delta_pocs();
        let mut used = vec![false; num_delta + 1];
        let mut use_delta = vec![true; num_delta + 1];
        for j in 0..=num_delta {
            used[j] = reader.read_bit()?;
            if !used[j] {
                use_delta[j] = reader.read_bit()?;
            }
        }

        let num_neg_ref = ref_set.num_negative_pics();
        let num_pos_ref = ref_set.num_positive_pics();

        // Derive S0 (negative deltas) in the 7.4.8 order.
        let mut delta_poc_s0 = Vec::new();
        let mut used_by_curr_pic_s0 = Vec::new();
        for j in (0..num_pos_ref).rev() {
            let d_poc = ref_set.delta_poc_s1[j] + delta_rps;
            if d_poc < 0 && use_delta[num_neg_ref + j] {
                delta_poc_s0.push(d_poc);
                used_by_curr_pic_s0.push(used[num_neg_ref + j]);
            }
        }
        if delta_rps < 0 && use_delta[num_delta] {
            delta_poc_s0.push(delta_rps);
            used_by_curr_pic_s0.push(used[num_delta]);
        }
        for j in 0..num_neg_ref {
            let d_poc = ref_set.delta_poc_s0[j] + delta_rps;
            if d_poc < 0 && use_delta[j] {
                delta_poc_s0.push(d_poc);
                used_by_curr_pic_s0.push(used[j]);
            }
        }

        // Derive S1 (positive deltas).
        let mut delta_poc_s1 = Vec::new();
        let mut used_by_curr_pic_s1 = Vec::new();
        for j in (0..num_neg_ref).rev() {
            let d_poc = ref_set.delta_poc_s0[j] + delta_rps;
            if d_poc > 0 && use_delta[j] {
                delta_poc_s1.push(d_poc);
                used_by_curr_pic_s1.push(used[j]);
            }
        }
        if delta_rps > 0 && use_delta[num_delta] {
            delta_poc_s1.push(delta_rps);
            used_by_curr_pic_s1.push(used[num_delta]);
        }
        for j in 0..num_pos_ref {
            let d_poc = ref_set.delta_poc_s1[j] + delta_rps;
            if d_poc > 0 && use_delta[num_neg_ref + j] {
                delta_poc_s1.push(d_poc);
                used_by_curr_pic_s1.push(used[num_neg_ref + j]);
            }
        }

        if delta_poc_s0.len() + delta_poc_s1.len() > MAX_NUM_REF_PICS {
            return Err(DecodeError::CodedParameterOutOfRange("predicted RPS size"));
        }

        Ok(Self {
            delta_poc_s0,
            used_by_curr_pic_s0,
            delta_poc_s1,
            used_by_curr_pic_s1,
        })
    }
}

/// A long-term reference entry resolved from SPS templates or the slice
/// header.
#[derive(Debug, Clone, Copy)]
pub struct LongTermEntry {
    /// POC (or POC LSB when `has_msb` is false) of the long-term picture.
    pub poc: i32,
    /// Whether `poc` includes the MSB part.
    pub has_msb: bool,
    /// Whether the entry is referenced by the current picture.
    pub used_by_curr_pic: bool,
}

/// The five POC lists partitioning the DPB for one picture (8.3.2).
#[derive(Debug, Clone, Default)]
pub struct RefPicSet {
    /// Short-term references preceding the current picture, used by it.
    pub poc_st_curr_before: Vec<i32>,
    /// Short-term references following the current picture, used by it.
    pub poc_st_curr_after: Vec<i32>,
    /// Short-term references kept for future pictures only.
    pub poc_st_foll: Vec<i32>,
    /// Long-term references used by the current picture.
    pub poc_lt_curr: Vec<i32>,
    /// Long-term references kept for future pictures only.
    pub poc_lt_foll: Vec<i32>,
}

impl RefPicSet {
    /// Derive the POC lists for the picture at `curr_poc`.
    pub fn derive(curr_poc: i32, st: &ShortTermRefPicSet, lt: &[LongTermEntry]) -> Self {
        let mut set = Self::default();

        for (i, &delta) in st.delta_poc_s0.iter().enumerate() {
            let poc = curr_poc + delta;
            if st.used_by_curr_pic_s0[i] {
                set.poc_st_curr_before.push(poc);
            } else {
                set.poc_st_foll.push(poc);
            }
        }
        for (i, &delta) in st.delta_poc_s1.iter().enumerate() {
            let poc = curr_poc + delta;
            if st.used_by_curr_pic_s1[i] {
                set.poc_st_curr_after.push(poc);
            } else {
                set.poc_st_foll.push(poc);
            }
        }
        for e in lt {
            if e.used_by_curr_pic {
                set.poc_lt_curr.push(e.poc);
            } else {
                set.poc_lt_foll.push(e.poc);
            }
        }

        set
    }

    /// All POCs the current picture may reference.
    pub fn curr_pocs(&self) -> impl Iterator<Item = i32> + '_ {
        self.poc_st_curr_before
            .iter()
            .chain(self.poc_st_curr_after.iter())
            .chain(self.poc_lt_curr.iter())
            .copied()
    }

    /// All POCs that must stay in the DPB (current and following).
    pub fn all_pocs(&self) -> impl Iterator<Item = i32> + '_ {
        self.poc_st_curr_before
            .iter()
            .chain(self.poc_st_curr_after.iter())
            .chain(self.poc_st_foll.iter())
            .chain(self.poc_lt_curr.iter())
            .chain(self.poc_lt_foll.iter())
            .copied()
    }

    /// Whether `poc` is a long-term member of this set.
    pub fn is_long_term(&self, poc: i32) -> bool {
        self.poc_lt_curr.contains(&poc) || self.poc_lt_foll.contains(&poc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vireo_core::bitstream::BitWriter;

    fn parse_bits(w: BitWriter, idx: usize, count: usize, prev: &[ShortTermRefPicSet]) -> ShortTermRefPicSet {
        let data = w.into_data();
        let mut reader = BitReader::new(&data);
        ShortTermRefPicSet::parse(&mut reader, idx, count, prev).unwrap()
    }

    #[test]
    fn test_explicit_rps() {
        // Two negative pictures (-1, -3), one positive (+2).
        let mut w = BitWriter::new();
        w.write_ue(2); // num_negative_pics
        w.write_ue(1); // num_positive_pics
        w.write_ue(0); // delta_poc_s0_minus1 -> -1
        w.write_bit(true);
        w.write_ue(1); // delta_poc_s0_minus1 -> -3
        w.write_bit(false);
        w.write_ue(1); // delta_poc_s1_minus1 -> +2
        w.write_bit(true);
        w.write_rbsp_trailing_bits();

        let rps = parse_bits(w, 0, 4, &[]);
        assert_eq!(rps.delta_poc_s0, vec![-1, -3]);
        assert_eq!(rps.used_by_curr_pic_s0, vec![true, false]);
        assert_eq!(rps.delta_poc_s1, vec![2]);
        assert_eq!(rps.num_delta_pocs(), 3);
    }

    #[test]
    fn test_predicted_rps_shift_by_minus_one() {
        // Reference set: {-1 used}. Predict with deltaRps = -1 and all
        // entries used: yields {-2 (shifted), -1 (the ref picture itself)}.
        let ref_set = ShortTermRefPicSet {
            delta_poc_s0: vec![-1],
            used_by_curr_pic_s0: vec![true],
            ..Default::default()
        };

        let mut w = BitWriter::new();
        w.write_bit(true); // inter_ref_pic_set_prediction_flag
        w.write_bit(true); // delta_rps_sign (negative)
        w.write_ue(0); // abs_delta_rps_minus1 -> deltaRps = -1
        w.write_bit(true); // used_by_curr_pic_flag[0]
        w.write_bit(true); // used_by_curr_pic_flag[1] (the ref set itself)
        w.write_rbsp_trailing_bits();

        let rps = parse_bits(w, 1, 4, std::slice::from_ref(&ref_set));
        assert_eq!(rps.delta_poc_s0, vec![-1, -2]);
        assert!(rps.used_by_curr_pic_s0.iter().all(|&u| u));
        assert!(rps.delta_poc_s1.is_empty());
    }

    #[test]
    fn test_ref_pic_set_partition() {
        let st = ShortTermRefPicSet {
            delta_poc_s0: vec![-1, -2],
            used_by_curr_pic_s0: vec![true, false],
            delta_poc_s1: vec![1],
            used_by_curr_pic_s1: vec![true],
        };
        let lt = [LongTermEntry {
            poc: 0,
            has_msb: true,
            used_by_curr_pic: false,
        }];

        let set = RefPicSet::derive(10, &st, &lt);
        assert_eq!(set.poc_st_curr_before, vec![9]);
        assert_eq!(set.poc_st_foll, vec![8]);
        assert_eq!(set.poc_st_curr_after, vec![11]);
        assert_eq!(set.poc_lt_foll, vec![0]);
        assert!(set.poc_lt_curr.is_empty());

        let all: Vec<i32> = set.all_pocs().collect();
        assert_eq!(all.len(), 4);
        assert!(set.is_long_term(0));
        assert!(!set.is_long_term(9));
    }
}
