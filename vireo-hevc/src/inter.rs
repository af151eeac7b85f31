//! Inter prediction: sub-sample interpolation and motion vector candidate
//! derivation.
//!
//! Luma uses the 8-tap quarter-sample filters, chroma the 4-tap
//! eighth-sample filters. Interpolation outputs 14-bit intermediate
//! precision so bi-prediction can combine both hypotheses before the final
//! rounding, as the standard requires. Samples outside the picture are
//! replicated from the border.

use crate::error::DecodeWarning;
use crate::picture::{MotionVector, MvInfo};
use vireo_core::image::PlaneBuffer;

/// Quarter-sample luma filters, indexed by fractional position.
const QPEL_FILTERS: [[i32; 8]; 4] = [
    [0, 0, 0, 64, 0, 0, 0, 0],
    [-1, 4, -10, 58, 17, -5, 1, 0],
    [-1, 4, -11, 40, 40, -11, 4, -1],
    [0, 1, -5, 17, 58, -10, 4, -1],
];

/// Eighth-sample chroma filters, indexed by fractional position.
const EPEL_FILTERS: [[i32; 4]; 8] = [
    [0, 64, 0, 0],
    [-2, 58, 10, -2],
    [-4, 54, 16, -2],
    [-6, 46, 28, -4],
    [-4, 36, 36, -4],
    [-4, 28, 46, -6],
    [-2, 16, 54, -4],
    [-2, 10, 58, -2],
];

/// Interpolate a `w x h` luma block at quarter-sample precision.
///
/// `(x0, y0)` is the block position in the picture; `mv` is in quarter
/// samples. The result is 14-bit intermediate precision (already shifted
/// down by 6).
pub fn mc_luma(refp: &PlaneBuffer, x0: i32, y0: i32, w: usize, h: usize, mv: MotionVector) -> Vec<i32> {
    let int_x = x0 + (mv.x >> 2) as i32;
    let int_y = y0 + (mv.y >> 2) as i32;
    let frac_x = (mv.x & 3) as usize;
    let frac_y = (mv.y & 3) as usize;
    let fx = &QPEL_FILTERS[frac_x];
    let fy = &QPEL_FILTERS[frac_y];

    // Horizontal pass over the h + 7 source rows the vertical taps need.
    let tmp_h = h + 7;
    let mut tmp = vec![0i32; w * tmp_h];
    for ty in 0..tmp_h {
        let sy = int_y + ty as i32 - 3;
        for tx in 0..w {
            let mut acc = 0i32;
            for (k, &c) in fx.iter().enumerate() {
                if c != 0 {
                    acc += c * refp.sample_clamped(int_x + tx as i32 + k as i32 - 3, sy) as i32;
                }
            }
            tmp[ty * w + tx] = acc;
        }
    }

    // Vertical pass, shifting to 14-bit intermediate precision.
    let mut out = vec![0i32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0i32;
            for (k, &c) in fy.iter().enumerate() {
                if c != 0 {
                    acc += c * tmp[(y + k) * w + x];
                }
            }
            out[y * w + x] = acc >> 6;
        }
    }
    out
}

/// Interpolate a `w x h` chroma block at eighth-sample precision.
///
/// `mv` is the luma motion vector; the chroma vector is derived by the
/// 4:2:0 halving, giving eighth-sample fractions.
pub fn mc_chroma(
    refp: &PlaneBuffer,
    x0: i32,
    y0: i32,
    w: usize,
    h: usize,
    mv: MotionVector,
) -> Vec<i32> {
    let int_x = x0 + (mv.x >> 3) as i32;
    let int_y = y0 + (mv.y >> 3) as i32;
    let frac_x = (mv.x & 7) as usize;
    let frac_y = (mv.y & 7) as usize;
    let fx = &EPEL_FILTERS[frac_x];
    let fy = &EPEL_FILTERS[frac_y];

    let tmp_h = h + 3;
    let mut tmp = vec![0i32; w * tmp_h];
    for ty in 0..tmp_h {
        let sy = int_y + ty as i32 - 1;
        for tx in 0..w {
            let mut acc = 0i32;
            for (k, &c) in fx.iter().enumerate() {
                if c != 0 {
                    acc += c * refp.sample_clamped(int_x + tx as i32 + k as i32 - 1, sy) as i32;
                }
            }
            tmp[ty * w + tx] = acc;
        }
    }

    let mut out = vec![0i32; w * h];
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0i32;
            for (k, &c) in fy.iter().enumerate() {
                if c != 0 {
                    acc += c * tmp[(y + k) * w + x];
                }
            }
            out[y * w + x] = acc >> 6;
        }
    }
    out
}

/// Finalize a uni-predicted block from 14-bit intermediate samples.
pub fn finalize_uni(pred: &[i32], bit_depth: u8) -> Vec<u8> {
    let max = (1i32 << bit_depth) - 1;
    pred.iter()
        .map(|&p| ((p + 32) >> 6).clamp(0, max) as u8)
        .collect()
}

/// Finalize a bi-predicted block by combining two 14-bit hypotheses.
pub fn finalize_bi(pred0: &[i32], pred1: &[i32], bit_depth: u8) -> Vec<u8> {
    let max = (1i32 << bit_depth) - 1;
    pred0
        .iter()
        .zip(pred1.iter())
        .map(|(&a, &b)| ((a + b + 64) >> 7).clamp(0, max) as u8)
        .collect()
}

/// Scale `mv` by the POC distance ratio `tb / td` (8.5.3.2.8).
///
/// Returns the warning raised when the scaling is impossible (`td == 0`).
pub fn scale_mv(mv: MotionVector, tb: i32, td: i32) -> (MotionVector, Option<DecodeWarning>) {
    if td == 0 {
        return (mv, Some(DecodeWarning::IncorrectMotionVectorScaling));
    }
    if tb == td {
        return (mv, None);
    }

    let tb = tb.clamp(-128, 127);
    let td = td.clamp(-128, 127);
    let tx = (16384 + td.abs() / 2) / td;
    let dist_scale = ((tb * tx + 32) >> 6).clamp(-4096, 4095);

    let scale = |v: i16| -> i16 {
        let prod = dist_scale * v as i32;
        let scaled = prod.signum() * ((prod.abs() + 127) >> 8);
        scaled.clamp(-32768, 32767) as i16
    };

    (MotionVector::new(scale(mv.x), scale(mv.y)), None)
}

/// Candidate positions for spatial merge/AMVP derivation, relative to a
/// `w x h` prediction block at `(x, y)` (luma sample coordinates).
#[derive(Debug, Clone, Copy)]
pub struct SpatialNeighbors {
    /// A0: below-left.
    pub a0: (i32, i32),
    /// A1: left.
    pub a1: (i32, i32),
    /// B0: above-right.
    pub b0: (i32, i32),
    /// B1: above.
    pub b1: (i32, i32),
    /// B2: above-left.
    pub b2: (i32, i32),
}

impl SpatialNeighbors {
    /// Neighbour sample positions of the block at `(x, y)` sized `w x h`.
    pub fn of_block(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self {
            a0: (x - 1, y + h),
            a1: (x - 1, y + h - 1),
            b0: (x + w, y - 1),
            b1: (x + w - 1, y - 1),
            b2: (x - 1, y - 1),
        }
    }
}

fn same_motion(a: &MvInfo, b: &MvInfo) -> bool {
    a.pred_flag == b.pred_flag
        && a.mv == b.mv
        && a.ref_poc == b.ref_poc
}

/// Derive the merge candidate list (8.5.3.2.3, without the temporal
/// candidate) and zero-fill it to `max_cand` entries.
///
/// `fetch` returns the motion info of the 4x4 block covering a position,
/// or `None` when that position is unavailable to this block.
pub fn derive_merge_candidates(
    neighbors: SpatialNeighbors,
    max_cand: usize,
    default_ref_poc: i32,
    fetch: &dyn Fn(i32, i32) -> Option<MvInfo>,
) -> Vec<MvInfo> {
    let mut list: Vec<MvInfo> = Vec::with_capacity(max_cand);

    let a1 = fetch(neighbors.a1.0, neighbors.a1.1).filter(|m| m.is_inter());
    if let Some(c) = a1 {
        list.push(c);
    }

    let b1 = fetch(neighbors.b1.0, neighbors.b1.1).filter(|m| m.is_inter());
    if let Some(c) = b1 {
        if !a1.as_ref().is_some_and(|a| same_motion(a, &c)) {
            list.push(c);
        }
    }

    let b0 = fetch(neighbors.b0.0, neighbors.b0.1).filter(|m| m.is_inter());
    if let Some(c) = b0 {
        if !b1.as_ref().is_some_and(|b| same_motion(b, &c)) {
            list.push(c);
        }
    }

    let a0 = fetch(neighbors.a0.0, neighbors.a0.1).filter(|m| m.is_inter());
    if let Some(c) = a0 {
        if !a1.as_ref().is_some_and(|a| same_motion(a, &c)) {
            list.push(c);
        }
    }

    if list.len() < 4 {
        let b2 = fetch(neighbors.b2.0, neighbors.b2.1).filter(|m| m.is_inter());
        if let Some(c) = b2 {
            let dup = a1.as_ref().is_some_and(|a| same_motion(a, &c))
                || b1.as_ref().is_some_and(|b| same_motion(b, &c));
            if !dup {
                list.push(c);
            }
        }
    }

    list.truncate(max_cand);

    // Zero-vector fill.
    while list.len() < max_cand {
        list.push(MvInfo {
            mv: [MotionVector::ZERO; 2],
            ref_poc: [default_ref_poc; 2],
            pred_flag: [true, false],
            intra: false,
        });
    }

    list
}

/// Derive the two-entry AMVP candidate list for one list/reference
/// (8.5.3.2.5, spatial candidates with POC-distance scaling).
#[allow(clippy::too_many_arguments)]
pub fn derive_mvp_candidates(
    neighbors: SpatialNeighbors,
    list_idx: usize,
    target_ref_poc: i32,
    curr_poc: i32,
    fetch: &dyn Fn(i32, i32) -> Option<MvInfo>,
) -> [MotionVector; 2] {
    let candidate_from = |positions: &[(i32, i32)]| -> Option<MotionVector> {
        // First pass: same reference picture, either list.
        for &(x, y) in positions {
            if let Some(info) = fetch(x, y).filter(|m| m.is_inter()) {
                for l in [list_idx, 1 - list_idx] {
                    if info.pred_flag[l] && info.ref_poc[l] == target_ref_poc {
                        return Some(info.mv[l]);
                    }
                }
            }
        }
        // Second pass: any reference, scaled by POC distance.
        for &(x, y) in positions {
            if let Some(info) = fetch(x, y).filter(|m| m.is_inter()) {
                for l in [list_idx, 1 - list_idx] {
                    if info.pred_flag[l] {
                        let tb = curr_poc - target_ref_poc;
                        let td = curr_poc - info.ref_poc[l];
                        let (scaled, _) = scale_mv(info.mv[l], tb, td);
                        return Some(scaled);
                    }
                }
            }
        }
        None
    };

    let left = candidate_from(&[neighbors.a0, neighbors.a1]);
    let above = candidate_from(&[neighbors.b0, neighbors.b1, neighbors.b2]);

    let mut cands = Vec::with_capacity(2);
    if let Some(c) = left {
        cands.push(c);
    }
    if let Some(c) = above {
        if !cands.contains(&c) {
            cands.push(c);
        }
    }
    while cands.len() < 2 {
        cands.push(MotionVector::ZERO);
    }

    [cands[0], cands[1]]
}
