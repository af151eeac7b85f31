//! Inverse quantization and inverse transforms.
//!
//! Dequantization follows 8.6.3 with flat (16) scaling matrices; the
//! inverse DCT runs as two one-dimensional passes over the generated basis
//! matrices with 16-bit clipping between stages. Intra luma 4x4 blocks use
//! the DST-VII basis.

use crate::tables::{DCT16, DCT32, DCT4, DCT8, DST4, LEVEL_SCALE};

/// Clip to the 16-bit intermediate range of the transform pipeline.
#[inline]
fn clip16(v: i32) -> i32 {
    v.clamp(-32768, 32767)
}

/// Dequantize `levels` for a `size x size` transform block (8.6.3).
///
/// `qp` is the final (luma or mapped chroma) QP for the block.
pub fn dequantize(levels: &[i32], log2_size: u8, qp: i32, bit_depth: u8) -> Vec<i32> {
    let size = 1usize << log2_size;
    debug_assert_eq!(levels.len(), size * size);

    let bd_shift = (bit_depth as i32 + log2_size as i32) - 5;
    let scale = LEVEL_SCALE[(qp % 6) as usize] << (qp / 6);
    let round = 1i64 << (bd_shift - 1);

    levels
        .iter()
        .map(|&l| {
            // Flat scaling matrix m = 16.
            let d = (l as i64 * scale as i64 * 16 + round) >> bd_shift;
            clip16(d as i32)
        })
        .collect()
}

/// Map a luma-domain QP index to the chroma QP (Table 8-10, 4:2:0).
pub fn chroma_qp(qp_i: i32) -> i32 {
    let qp_i = qp_i.clamp(0, 57);
    match qp_i {
        0..=29 => qp_i,
        30 => 29,
        31 => 30,
        32 => 31,
        33 => 32,
        34 => 33,
        35 => 33,
        36 => 34,
        37 => 34,
        38 => 35,
        39 => 35,
        40 => 36,
        41 => 36,
        42 => 37,
        43 => 37,
        _ => qp_i - 6,
    }
}

fn basis(size: usize) -> &'static [i32] {
    match size {
        4 => DCT4.as_flattened(),
        8 => DCT8.as_flattened(),
        16 => DCT16.as_flattened(),
        32 => DCT32.as_flattened(),
        _ => unreachable!("transform size {size}"),
    }
}

/// Inverse transform of dequantized coefficients into spatial residuals.
///
/// `use_dst` selects the DST-VII basis (intra luma 4x4 only). The result is
/// in row-major order, `size * size` entries.
pub fn inverse_transform(coeffs: &[i32], log2_size: u8, use_dst: bool, bit_depth: u8) -> Vec<i16> {
    let size = 1usize << log2_size;
    debug_assert_eq!(coeffs.len(), size * size);

    let t: &[i32] = if use_dst {
        debug_assert_eq!(size, 4);
        DST4.as_flattened()
    } else {
        basis(size)
    };

    let shift1 = 7;
    let shift2 = 20 - bit_depth as i32;
    let round1 = 1i32 << (shift1 - 1);
    let round2 = 1i64 << (shift2 - 1);

    // First stage: columns.
    let mut tmp = vec![0i32; size * size];
    for x in 0..size {
        for y in 0..size {
            let mut sum = 0i64;
            for k in 0..size {
                let c = coeffs[k * size + x];
                if c != 0 {
                    sum += c as i64 * t[k * size + y] as i64;
                }
            }
            tmp[y * size + x] = clip16(((sum + round1 as i64) >> shift1) as i32);
        }
    }

    // Second stage: rows.
    let mut out = vec![0i16; size * size];
    for y in 0..size {
        for x in 0..size {
            let mut sum = 0i64;
            for k in 0..size {
                sum += tmp[y * size + k] as i64 * t[k * size + x] as i64;
            }
            out[y * size + x] = clip16(((sum + round2) >> shift2) as i32) as i16;
        }
    }

    out
}

/// Residual reconstruction for transform-skip blocks (8.6.4.2).
pub fn transform_skip(coeffs: &[i32], log2_size: u8, bit_depth: u8) -> Vec<i16> {
    let size = 1usize << log2_size;
    debug_assert_eq!(coeffs.len(), size * size);

    let shift2 = 20 - bit_depth as i32;
    let round2 = 1i32 << (shift2 - 1);
    coeffs
        .iter()
        .map(|&d| clip16(((d << 7) + round2) >> shift2) as i16)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dequantize_qp4_is_identity_scale() {
        // qp 4: levScale 64, 4x4 8-bit: bdShift = 5.
        // d = (l * 64 * 16 + 16) >> 5 = l * 32.
        let levels = vec![1i32; 16];
        let d = dequantize(&levels, 2, 4, 8);
        assert!(d.iter().all(|&v| v == 32));
    }

    #[test]
    fn test_dequantize_scales_with_qp_per_6() {
        let levels = vec![1i32, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let d0 = dequantize(&levels, 2, 10, 8)[0];
        let d6 = dequantize(&levels, 2, 16, 8)[0];
        assert_eq!(d6, d0 * 2);
    }

    #[test]
    fn test_dequantize_clips_to_16bit() {
        let levels = vec![30000i32; 16];
        let d = dequantize(&levels, 2, 51, 8);
        assert!(d.iter().all(|&v| v == 32767));
    }

    #[test]
    fn test_chroma_qp_mapping() {
        assert_eq!(chroma_qp(20), 20);
        assert_eq!(chroma_qp(29), 29);
        assert_eq!(chroma_qp(30), 29);
        assert_eq!(chroma_qp(35), 33);
        assert_eq!(chroma_qp(43), 37);
        assert_eq!(chroma_qp(45), 39);
    }

    #[test]
    fn test_inverse_dct_dc_only() {
        // A DC coefficient of 64 reconstructs a flat residual of 1 at every
        // supported size (8-bit).
        for log2 in 2..=5u8 {
            let size = 1usize << log2;
            let mut coeffs = vec![0i32; size * size];
            coeffs[0] = 64;
            let res = inverse_transform(&coeffs, log2, false, 8);
            assert!(
                res.iter().all(|&r| r == 1),
                "size {size}: {:?}",
                &res[..4]
            );
        }
    }

    #[test]
    fn test_inverse_dct_zero_input() {
        let coeffs = vec![0i32; 64];
        let res = inverse_transform(&coeffs, 3, false, 8);
        assert!(res.iter().all(|&r| r == 0));
    }

    #[test]
    fn test_inverse_dct_linearity() {
        let mut a = vec![0i32; 16];
        a[1] = 100;
        let mut b = vec![0i32; 16];
        b[1] = -100;

        let ra = inverse_transform(&a, 2, false, 8);
        let rb = inverse_transform(&b, 2, false, 8);
        for (x, y) in ra.iter().zip(rb.iter()) {
            assert_eq!(*x, -*y);
        }
    }

    #[test]
    fn test_inverse_dst_differs_from_dct() {
        let mut coeffs = vec![0i32; 16];
        coeffs[1] = 120;
        coeffs[5] = -40;
        let dct = inverse_transform(&coeffs, 2, false, 8);
        let dst = inverse_transform(&coeffs, 2, true, 8);
        assert_ne!(dct, dst);
    }

    #[test]
    fn test_transform_skip_scaling() {
        // 8-bit: res = (d << 7 + 2048) >> 12 = d / 32 rounded.
        let coeffs = vec![32i32, 64, -32, 0];
        let res = transform_skip(&coeffs[..4].to_vec(), 1, 8);
        assert_eq!(res, vec![1, 2, -1, 0]);
    }
}
