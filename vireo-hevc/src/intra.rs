//! Intra prediction.
//!
//! Reference sample gathering with unavailability substitution (8.4.4.2.2),
//! the [1 2 1] smoothing filter with the optional strong bilinear variant
//! (8.4.4.2.3), and the planar, DC, and angular predictors
//! (8.4.4.2.4-8.4.4.2.6).

use vireo_core::image::PlaneBuffer;

/// Planar prediction mode index.
pub const MODE_PLANAR: u8 = 0;
/// DC prediction mode index.
pub const MODE_DC: u8 = 1;
/// Horizontal angular mode index.
pub const MODE_HORIZONTAL: u8 = 10;
/// Vertical angular mode index.
pub const MODE_VERTICAL: u8 = 26;

/// Prediction angle per angular mode (modes 2-34).
const INTRA_PRED_ANGLE: [i32; 33] = [
    32, 26, 21, 17, 13, 9, 5, 2, 0, -2, -5, -9, -13, -17, -21, -26, -32, -26, -21, -17, -13, -9,
    -5, -2, 0, 2, 5, 9, 13, 17, 21, 26, 32,
];

/// Inverse angle (8192/angle) for the negative-angle modes 11-25.
const INV_ANGLE: [i32; 15] = [
    -4096, -1638, -910, -630, -482, -390, -315, -256, -315, -390, -482, -630, -910, -1638, -4096,
];

/// Reference samples around one intra block.
///
/// `top[0]` and `left[0]` both hold the corner sample `p[-1][-1]`;
/// `top[1 + i]` is `p[i][-1]` for `i` in `0..2N` and `left[1 + i]` is
/// `p[-1][i]`.
#[derive(Debug, Clone)]
pub struct RefSamples {
    /// Corner plus the row above, 2N+1 entries.
    pub top: Vec<u8>,
    /// Corner plus the column to the left, 2N+1 entries.
    pub left: Vec<u8>,
}

impl RefSamples {
    /// Gather reference samples for the `size x size` block at `(x0, y0)`,
    /// substituting unavailable positions (8.4.4.2.2).
    ///
    /// `avail(x, y)` reports whether the already-reconstructed sample at
    /// the given plane position may be referenced.
    pub fn gather(
        plane: &PlaneBuffer,
        x0: u32,
        y0: u32,
        size: u32,
        bit_depth: u8,
        avail: &dyn Fn(i32, i32) -> bool,
    ) -> Self {
        let n = size as i32;
        let x0 = x0 as i32;
        let y0 = y0 as i32;
        let total = (4 * n + 1) as usize;

        // Walk from the bottom-left sample up to the corner and across the
        // top row, recording availability.
        let mut vals = vec![0u8; total];
        let mut have = vec![false; total];

        for i in 0..2 * n {
            // left column, bottom to top: p[-1][2N-1-i]
            let y = y0 + 2 * n - 1 - i;
            if avail(x0 - 1, y) {
                vals[i as usize] = plane.sample_clamped(x0 - 1, y);
                have[i as usize] = true;
            }
        }
        if avail(x0 - 1, y0 - 1) {
            vals[2 * n as usize] = plane.sample_clamped(x0 - 1, y0 - 1);
            have[2 * n as usize] = true;
        }
        for i in 0..2 * n {
            // top row, left to right: p[i][-1]
            let idx = (2 * n + 1 + i) as usize;
            if avail(x0 + i, y0 - 1) {
                vals[idx] = plane.sample_clamped(x0 + i, y0 - 1);
                have[idx] = true;
            }
        }

        if !have.iter().any(|&h| h) {
            let dc = 1u8 << (bit_depth - 1);
            vals.fill(dc);
        } else {
            // Substitute: the first available value fills everything before
            // it; later gaps copy their predecessor.
            let first = have.iter().position(|&h| h).unwrap();
            for i in (0..first).rev() {
                vals[i] = vals[i + 1];
            }
            for i in first + 1..total {
                if !have[i] {
                    vals[i] = vals[i - 1];
                }
            }
        }

        // Split into the top/left layout.
        let corner = vals[2 * n as usize];
        let mut left = Vec::with_capacity((2 * n + 1) as usize);
        left.push(corner);
        for i in 0..2 * n {
            // left[1+i] = p[-1][i]
            left.push(vals[(2 * n - 1 - i) as usize]);
        }
        let mut top = Vec::with_capacity((2 * n + 1) as usize);
        top.push(corner);
        for i in 0..2 * n {
            top.push(vals[(2 * n + 1 + i) as usize]);
        }

        Self { top, left }
    }

    /// Apply the intra smoothing filter when required (8.4.4.2.3).
    pub fn filter(&mut self, size: u32, mode: u8, bit_depth: u8, strong_smoothing: bool) {
        if size < 8 || mode == MODE_DC {
            return;
        }

        // Distance of the mode from pure horizontal/vertical.
        let min_dist = (mode as i32 - 10)
            .abs()
            .min((mode as i32 - 26).abs());
        let threshold = match size {
            8 => 7,
            16 => 1,
            _ => 0,
        };
        if mode != MODE_PLANAR && min_dist <= threshold {
            return;
        }

        let n = size as usize;

        if strong_smoothing && size == 32 && bit_depth == 8 {
            let corner = self.top[0] as i32;
            let top_end = self.top[2 * n] as i32;
            let left_end = self.left[2 * n] as i32;
            let flat_top = (corner + top_end - 2 * self.top[n] as i32).abs() < 8;
            let flat_left = (corner + left_end - 2 * self.left[n] as i32).abs() < 8;

            if flat_top && flat_left {
                // Bilinear interpolation across the whole edge.
                for i in 1..2 * n {
                    self.top[i] =
                        (((2 * n - i) as i32 * corner + i as i32 * top_end + 32) >> 6) as u8;
                    self.left[i] =
                        (((2 * n - i) as i32 * corner + i as i32 * left_end + 32) >> 6) as u8;
                }
                return;
            }
        }

        // [1 2 1] filter along left (bottom to top), corner, top (left to
        // right), all from the unfiltered values.
        let orig_top = self.top.clone();
        let orig_left = self.left.clone();

        self.top[0] =
            ((orig_left[1] as u32 + 2 * orig_top[0] as u32 + orig_top[1] as u32 + 2) >> 2) as u8;
        self.left[0] = self.top[0];
        for i in 1..2 * n {
            self.left[i] = ((orig_left[i - 1] as u32
                + 2 * orig_left[i] as u32
                + orig_left[i + 1] as u32
                + 2)
                >> 2) as u8;
            self.top[i] = ((orig_top[i - 1] as u32
                + 2 * orig_top[i] as u32
                + orig_top[i + 1] as u32
                + 2)
                >> 2) as u8;
        }
    }
}

/// Predict the `size x size` block at `(x0, y0)` with the given mode.
///
/// `edge_filter` enables the DC/horizontal/vertical boundary filters
/// (luma blocks smaller than 32).
pub fn predict(
    plane: &mut PlaneBuffer,
    refs: &RefSamples,
    x0: u32,
    y0: u32,
    size: u32,
    mode: u8,
    bit_depth: u8,
    edge_filter: bool,
) {
    match mode {
        MODE_PLANAR => predict_planar(plane, refs, x0, y0, size),
        MODE_DC => predict_dc(plane, refs, x0, y0, size, edge_filter),
        _ => predict_angular(plane, refs, x0, y0, size, mode, bit_depth, edge_filter),
    }
}

/// Planar prediction (8.4.4.2.4).
fn predict_planar(plane: &mut PlaneBuffer, refs: &RefSamples, x0: u32, y0: u32, size: u32) {
    let n = size as i32;
    let log2n = size.trailing_zeros() as i32;
    let stride = plane.stride();
    let data = plane.data_mut();

    let top_right = refs.top[n as usize + 1] as i32; // p[N][-1]
    let bottom = refs.left[n as usize + 1] as i32; // p[-1][N]

    for y in 0..n {
        let left = refs.left[(y + 1) as usize] as i32;
        for x in 0..n {
            let top = refs.top[(x + 1) as usize] as i32;
            let v = ((n - 1 - x) * left
                + (x + 1) * top_right
                + (n - 1 - y) * top
                + (y + 1) * bottom
                + n)
                >> (log2n + 1);
            data[(y0 as usize + y as usize) * stride + x0 as usize + x as usize] = v as u8;
        }
    }
}

/// DC prediction (8.4.4.2.5).
fn predict_dc(
    plane: &mut PlaneBuffer,
    refs: &RefSamples,
    x0: u32,
    y0: u32,
    size: u32,
    edge_filter: bool,
) {
    let n = size as usize;
    let log2n = size.trailing_zeros();

    let mut sum = n as u32; // rounding term
    for i in 1..=n {
        sum += refs.top[i] as u32 + refs.left[i] as u32;
    }
    let dc = (sum >> (log2n + 1)) as i32;

    let stride = plane.stride();
    let data = plane.data_mut();
    for y in 0..n {
        for x in 0..n {
            data[(y0 as usize + y) * stride + x0 as usize + x] = dc as u8;
        }
    }

    if edge_filter && size < 32 {
        // Corner and first row/column blend towards the references.
        data[y0 as usize * stride + x0 as usize] =
            ((refs.left[1] as i32 + 2 * dc + refs.top[1] as i32 + 2) >> 2) as u8;
        for x in 1..n {
            data[y0 as usize * stride + x0 as usize + x] =
                ((refs.top[x + 1] as i32 + 3 * dc + 2) >> 2) as u8;
        }
        for y in 1..n {
            data[(y0 as usize + y) * stride + x0 as usize] =
                ((refs.left[y + 1] as i32 + 3 * dc + 2) >> 2) as u8;
        }
    }
}

/// Angular prediction, modes 2-34 (8.4.4.2.6).
#[allow(clippy::too_many_arguments)]
fn predict_angular(
    plane: &mut PlaneBuffer,
    refs: &RefSamples,
    x0: u32,
    y0: u32,
    size: u32,
    mode: u8,
    bit_depth: u8,
    edge_filter: bool,
) {
    let n = size as i32;
    let angle = INTRA_PRED_ANGLE[(mode - 2) as usize];
    let vertical = mode >= 18;
    let max = (1i32 << bit_depth) - 1;

    // Main and side references as one indexable line ref[-N..=2N].
    let (main, side) = if vertical {
        (&refs.top, &refs.left)
    } else {
        (&refs.left, &refs.top)
    };

    // ref_line[i + N] corresponds to ref[i] of 8.4.4.2.6; one extra entry
    // covers the zero-weighted second tap at the steepest angles.
    let mut ref_line = vec![0i32; (3 * n + 2) as usize];
    for i in 0..=2 * n {
        ref_line[(i + n) as usize] = main[i as usize] as i32;
    }
    ref_line[(3 * n + 1) as usize] = main[(2 * n) as usize] as i32;
    if angle < 0 {
        let inv_angle = INV_ANGLE[(mode as usize).clamp(11, 25) - 11];
        let last = (n * angle) >> 5;
        for i in (last..0).rev() {
            // Project onto the side reference.
            let idx = ((i * inv_angle + 128) >> 8).min(2 * n);
            ref_line[(i + n) as usize] = side[idx.max(0) as usize] as i32;
        }
    }

    let stride = plane.stride();
    let data = plane.data_mut();

    for k in 0..n {
        // k walks the orthogonal direction (y for vertical modes).
        let pos = (k + 1) * angle;
        let idx = pos >> 5;
        let fact = pos & 31;

        for j in 0..n {
            // j walks along the prediction row/column.
            let r0 = ref_line[(j + idx + 1 + n) as usize];
            let r1 = ref_line[(j + idx + 2 + n) as usize];
            let v = ((32 - fact) * r0 + fact * r1 + 16) >> 5;

            let (px, py) = if vertical { (j, k) } else { (k, j) };
            data[(y0 as i32 + py) as usize * stride + (x0 as i32 + px) as usize] = v as u8;
        }
    }

    // Boundary filter for the pure horizontal/vertical modes.
    if edge_filter && size < 32 {
        if mode == MODE_VERTICAL {
            let corner = refs.top[0] as i32;
            for y in 0..n {
                let idx = (y0 as i32 + y) as usize * stride + x0 as usize;
                let base = refs.top[1] as i32;
                let delta = (refs.left[(y + 1) as usize] as i32 - corner) >> 1;
                data[idx] = (base + delta).clamp(0, max) as u8;
            }
        } else if mode == MODE_HORIZONTAL {
            let corner = refs.left[0] as i32;
            for x in 0..n {
                let idx = y0 as usize * stride + (x0 as i32 + x) as usize;
                let base = refs.left[1] as i32;
                let delta = (refs.top[(x + 1) as usize] as i32 - corner) >> 1;
                data[idx] = (base + delta).clamp(0, max) as u8;
            }
        }
    }
}

/// Derive the three most probable modes from the neighbours (8.4.2).
pub fn derive_mpm(left_mode: Option<u8>, above_mode: Option<u8>) -> [u8; 3] {
    let a = left_mode.unwrap_or(MODE_DC);
    let b = above_mode.unwrap_or(MODE_DC);

    if a == b {
        if a < 2 {
            [MODE_PLANAR, MODE_DC, MODE_VERTICAL]
        } else {
            // Neighbouring angular modes.
            [a, 2 + ((a as i32 - 2 - 1 + 32) % 32) as u8, 2 + ((a as i32 - 2 + 1) % 32) as u8]
        }
    } else {
        let third = if a != MODE_PLANAR && b != MODE_PLANAR {
            MODE_PLANAR
        } else if a != MODE_DC && b != MODE_DC {
            MODE_DC
        } else {
            MODE_VERTICAL
        };
        [a, b, third]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_plane(w: u32, h: u32, v: u8) -> PlaneBuffer {
        let mut p = PlaneBuffer::new(w, h, w as usize, 0);
        p.fill(v);
        p
    }

    fn all_avail(_: i32, _: i32) -> bool {
        true
    }

    fn none_avail(_: i32, _: i32) -> bool {
        false
    }

    #[test]
    fn test_gather_substitutes_when_nothing_available() {
        let plane = flat_plane(16, 16, 77);
        let refs = RefSamples::gather(&plane, 0, 0, 8, 8, &none_avail);
        assert!(refs.top.iter().all(|&v| v == 128));
        assert!(refs.left.iter().all(|&v| v == 128));
    }

    #[test]
    fn test_gather_reads_neighbours() {
        let mut plane = flat_plane(16, 16, 50);
        // Top row of the block's neighbours at y=3 (block at (4,4)).
        let stride = plane.stride();
        for x in 0..16 {
            plane.data_mut()[3 * stride + x] = 200;
        }
        let refs = RefSamples::gather(&plane, 4, 4, 4, 8, &all_avail);
        assert_eq!(refs.top[0], 200); // corner p[-1][-1] at (3,3)
        assert!(refs.top[1..].iter().all(|&v| v == 200));
        assert!(refs.left[1..].iter().all(|&v| v == 50));
    }

    #[test]
    fn test_planar_flat_references_give_flat_block() {
        let mut plane = flat_plane(16, 16, 90);
        let refs = RefSamples::gather(&plane, 8, 8, 8, 8, &all_avail);
        predict(&mut plane, &refs, 8, 8, 8, MODE_PLANAR, 8, true);

        let stride = plane.stride();
        for y in 8..16 {
            for x in 8..16 {
                assert_eq!(plane.data()[y * stride + x], 90);
            }
        }
    }

    #[test]
    fn test_planar_matches_reference_formula() {
        let mut plane = flat_plane(16, 16, 0);
        let stride = plane.stride();
        // Distinct top and left references around the block at (4,4).
        for i in 0..16 {
            plane.data_mut()[3 * stride + i] = 100 + i as u8; // row y=3
            plane.data_mut()[i * stride + 3] = 60 + i as u8; // col x=3
        }

        let refs = RefSamples::gather(&plane, 4, 4, 4, 8, &all_avail);
        let mut out = plane.clone();
        predict(&mut out, &refs, 4, 4, 4, MODE_PLANAR, 8, true);

        let n = 4i32;
        let top_right = refs.top[5] as i32;
        let bottom_left = refs.left[5] as i32;
        for y in 0..4i32 {
            for x in 0..4i32 {
                let expect = ((n - 1 - x) * refs.left[(y + 1) as usize] as i32
                    + (x + 1) * top_right
                    + (n - 1 - y) * refs.top[(x + 1) as usize] as i32
                    + (y + 1) * bottom_left
                    + n)
                    >> 3;
                let got = out.data()[(4 + y) as usize * stride + (4 + x) as usize] as i32;
                assert_eq!(got, expect, "at ({x},{y})");
            }
        }
    }

    #[test]
    fn test_dc_prediction_flat() {
        let mut plane = flat_plane(16, 16, 64);
        let refs = RefSamples::gather(&plane, 8, 8, 4, 8, &all_avail);
        predict(&mut plane, &refs, 8, 8, 4, MODE_DC, 8, true);

        let stride = plane.stride();
        // Flat references: DC = 64 everywhere, edge filter keeps it.
        for y in 8..12 {
            for x in 8..12 {
                assert_eq!(plane.data()[y * stride + x], 64);
            }
        }
    }

    #[test]
    fn test_vertical_mode_copies_top_row() {
        let mut plane = flat_plane(16, 16, 10);
        let stride = plane.stride();
        for x in 0..16 {
            plane.data_mut()[7 * stride + x] = 100 + x as u8;
        }

        let refs = RefSamples::gather(&plane, 8, 8, 4, 8, &all_avail);
        let mut out = plane.clone();
        // Disable the edge filter to observe the pure copy.
        predict(&mut out, &refs, 8, 8, 4, MODE_VERTICAL, 8, false);

        for y in 8..12 {
            for x in 8..12 {
                assert_eq!(out.data()[y * stride + x], 100 + x as u8);
            }
        }
    }

    #[test]
    fn test_horizontal_mode_copies_left_column() {
        let mut plane = flat_plane(16, 16, 10);
        let stride = plane.stride();
        for y in 0..16 {
            plane.data_mut()[y * stride + 7] = 30 + y as u8;
        }

        let refs = RefSamples::gather(&plane, 8, 8, 4, 8, &all_avail);
        let mut out = plane.clone();
        predict(&mut out, &refs, 8, 8, 4, MODE_HORIZONTAL, 8, false);

        for y in 8..12 {
            for x in 8..12 {
                assert_eq!(out.data()[y * stride + x], 30 + y as u8);
            }
        }
    }

    #[test]
    fn test_angular_mode_2_reads_below_left() {
        let mut plane = flat_plane(16, 16, 10);
        let stride = plane.stride();
        // Mode 2 (angle +32, horizontal family) predicts purely from the
        // lower-left diagonal.
        for y in 0..16 {
            plane.data_mut()[y * stride + 7] = 100;
        }
        let refs = RefSamples::gather(&plane, 8, 8, 4, 8, &all_avail);
        let mut out = plane.clone();
        predict(&mut out, &refs, 8, 8, 4, 2, 8, false);
        // Every predicted sample comes from the left reference column.
        for y in 8..12 {
            for x in 8..12 {
                assert_eq!(out.data()[y * stride + x], 100);
            }
        }
    }

    #[test]
    fn test_mpm_derivation() {
        // Equal non-angular neighbours.
        assert_eq!(
            derive_mpm(Some(MODE_DC), Some(MODE_DC)),
            [MODE_PLANAR, MODE_DC, MODE_VERTICAL]
        );
        // Equal angular neighbours: +-1 wrap.
        assert_eq!(derive_mpm(Some(18), Some(18)), [18, 17, 19]);
        assert_eq!(derive_mpm(Some(2), Some(2)), [2, 33, 3]);
        // Distinct modes.
        assert_eq!(
            derive_mpm(Some(MODE_DC), Some(MODE_VERTICAL)),
            [MODE_DC, MODE_VERTICAL, MODE_PLANAR]
        );
        // Missing neighbours default to DC.
        assert_eq!(
            derive_mpm(None, None),
            [MODE_PLANAR, MODE_DC, MODE_VERTICAL]
        );
    }
}
