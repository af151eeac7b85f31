//! Process-global lookup tables.
//!
//! Scan orders, the significance-map context table, and the integer DCT
//! basis matrices are built once on first use. The DCT bases are generated
//! from the canonical 33-entry magnitude vector: entry `(m, n)` of the
//! N-point matrix is `±G[fold((2n+1) * m * 32/N)]`, which reproduces the
//! integer matrices of the standard exactly.

use std::sync::LazyLock;

/// Canonical DCT magnitudes `G[k] ~ 90.5 * cos(k*pi/64)` as fixed by the
/// standard (k = 0 uses the DC scale 64).
const DCT_BASE: [i32; 33] = [
    64, 90, 90, 90, 89, 88, 87, 85, 83, 82, 80, 78, 75, 73, 70, 67, 64, 61, 57, 54, 50, 46, 43,
    38, 36, 31, 25, 22, 18, 13, 9, 4, 0,
];

/// 4x4 DST-VII basis used for intra luma 4x4 blocks.
pub const DST4: [[i32; 4]; 4] = [
    [29, 55, 74, 84],
    [74, 74, 0, -74],
    [84, -29, -74, 55],
    [55, -84, 74, -29],
];

/// Basis entry of the N-point integer DCT at row `m`, column `n`.
fn dct_entry(n_points: usize, m: usize, n: usize) -> i32 {
    let unit = 32 / n_points; // angle units of pi/64 per (2n+1)*m step
    let a = ((2 * n + 1) * m * unit) % 128;
    let b = if a > 64 { 128 - a } else { a };
    if b > 32 {
        -DCT_BASE[64 - b]
    } else {
        DCT_BASE[b]
    }
}

fn build_dct<const N: usize>() -> [[i32; N]; N] {
    let mut t = [[0i32; N]; N];
    for (m, row) in t.iter_mut().enumerate() {
        for (n, v) in row.iter_mut().enumerate() {
            *v = dct_entry(N, m, n);
        }
    }
    t
}

/// 4-point integer DCT basis.
pub static DCT4: LazyLock<[[i32; 4]; 4]> = LazyLock::new(build_dct::<4>);
/// 8-point integer DCT basis.
pub static DCT8: LazyLock<[[i32; 8]; 8]> = LazyLock::new(build_dct::<8>);
/// 16-point integer DCT basis.
pub static DCT16: LazyLock<[[i32; 16]; 16]> = LazyLock::new(build_dct::<16>);
/// 32-point integer DCT basis.
pub static DCT32: LazyLock<[[i32; 32]; 32]> = LazyLock::new(build_dct::<32>);

/// Coefficient scan pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPattern {
    /// Up-right diagonal scan.
    Diagonal,
    /// Row-major scan.
    Horizontal,
    /// Column-major scan.
    Vertical,
}

/// Scan position tables for square blocks of size 1, 2, 4, and 8.
pub struct ScanTables {
    diag: [Vec<(u8, u8)>; 4],
    horiz: [Vec<(u8, u8)>; 4],
    vert: [Vec<(u8, u8)>; 4],
}

impl ScanTables {
    /// Scan order `(x, y)` positions for a `size x size` block
    /// (`size` in {1, 2, 4, 8}).
    pub fn order(&self, pattern: ScanPattern, size: u32) -> &[(u8, u8)] {
        let idx = match size {
            1 => 0,
            2 => 1,
            4 => 2,
            8 => 3,
            _ => unreachable!("scan size {size}"),
        };
        match pattern {
            ScanPattern::Diagonal => &self.diag[idx],
            ScanPattern::Horizontal => &self.horiz[idx],
            ScanPattern::Vertical => &self.vert[idx],
        }
    }
}

fn diag_scan(size: u8) -> Vec<(u8, u8)> {
    // Up-right diagonal order of 6.5.3: each anti-diagonal is walked from
    // its bottom-left end towards the top-right.
    let mut out = Vec::with_capacity(size as usize * size as usize);
    for s in 0..(2 * size - 1) {
        let y_top = s.min(size - 1);
        let y_bot = s.saturating_sub(size - 1);
        for y in (y_bot..=y_top).rev() {
            out.push((s - y, y));
        }
    }
    out
}

fn horiz_scan(size: u8) -> Vec<(u8, u8)> {
    let mut out = Vec::with_capacity(size as usize * size as usize);
    for y in 0..size {
        for x in 0..size {
            out.push((x, y));
        }
    }
    out
}

fn vert_scan(size: u8) -> Vec<(u8, u8)> {
    let mut out = Vec::with_capacity(size as usize * size as usize);
    for x in 0..size {
        for y in 0..size {
            out.push((x, y));
        }
    }
    out
}

/// Global scan order tables.
pub static SCAN_TABLES: LazyLock<ScanTables> = LazyLock::new(|| ScanTables {
    diag: [diag_scan(1), diag_scan(2), diag_scan(4), diag_scan(8)],
    horiz: [horiz_scan(1), horiz_scan(2), horiz_scan(4), horiz_scan(8)],
    vert: [vert_scan(1), vert_scan(2), vert_scan(4), vert_scan(8)],
});

/// Context index map for sig_coeff_flag in 4x4 transform blocks (9.3.4.2.5).
pub const SIG_CTX_MAP_4X4: [u8; 16] = [0, 1, 4, 5, 2, 3, 4, 5, 6, 6, 8, 8, 7, 7, 8, 8];

/// QP-indexed dequantization level scale.
pub const LEVEL_SCALE: [i32; 6] = [40, 45, 51, 57, 64, 72];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_dct4_matches_standard() {
        let expected = [
            [64, 64, 64, 64],
            [83, 36, -36, -83],
            [64, -64, -64, 64],
            [36, -83, 83, -36],
        ];
        assert_eq!(*DCT4, expected);
    }

    #[test]
    fn test_generated_dct8_matches_standard() {
        let expected = [
            [64, 64, 64, 64, 64, 64, 64, 64],
            [89, 75, 50, 18, -18, -50, -75, -89],
            [83, 36, -36, -83, -83, -36, 36, 83],
            [75, -18, -89, -50, 50, 89, 18, -75],
            [64, -64, -64, 64, 64, -64, -64, 64],
            [50, -89, 18, 75, -75, -18, 89, -50],
            [36, -83, 83, -36, -36, 83, -83, 36],
            [18, -50, 75, -89, 89, -75, 50, -18],
        ];
        assert_eq!(*DCT8, expected);
    }

    #[test]
    fn test_generated_dct16_first_rows() {
        assert_eq!(DCT16[0], [64; 16]);
        assert_eq!(
            DCT16[1],
            [90, 87, 80, 70, 57, 43, 25, 9, -9, -25, -43, -57, -70, -80, -87, -90]
        );
        assert_eq!(
            DCT16[2],
            [89, 75, 50, 18, -18, -50, -75, -89, -89, -75, -50, -18, 18, 50, 75, 89]
        );
    }

    #[test]
    fn test_dct32_row_symmetry() {
        // Even rows are symmetric, odd rows antisymmetric.
        for m in 0..32 {
            for n in 0..16 {
                let a = DCT32[m][n];
                let b = DCT32[m][31 - n];
                if m % 2 == 0 {
                    assert_eq!(a, b, "row {m} col {n}");
                } else {
                    assert_eq!(a, -b, "row {m} col {n}");
                }
            }
        }
        // First odd row starts with the top of the magnitude table.
        assert_eq!(&DCT32[1][..8], &[90, 90, 88, 85, 82, 78, 73, 67]);
    }

    #[test]
    fn test_dct_even_rows_nest() {
        // T16 even rows replicate T8, which nests T4.
        for m in 0..8 {
            for n in 0..8 {
                assert_eq!(DCT16[2 * m][n], DCT8[m][n]);
            }
        }
        for m in 0..4 {
            for n in 0..4 {
                assert_eq!(DCT8[2 * m][n], DCT4[m][n]);
            }
        }
    }

    #[test]
    fn test_diag_scan_4x4() {
        let scan = SCAN_TABLES.order(ScanPattern::Diagonal, 4);
        assert_eq!(scan.len(), 16);
        assert_eq!(scan[0], (0, 0));
        assert_eq!(scan[1], (0, 1));
        assert_eq!(scan[2], (1, 0));
        assert_eq!(scan[3], (0, 2));
        assert_eq!(scan[4], (1, 1));
        assert_eq!(scan[5], (2, 0));
        assert_eq!(scan[15], (3, 3));
    }

    #[test]
    fn test_scans_are_permutations() {
        for pattern in [
            ScanPattern::Diagonal,
            ScanPattern::Horizontal,
            ScanPattern::Vertical,
        ] {
            for size in [1u32, 2, 4, 8] {
                let scan = SCAN_TABLES.order(pattern, size);
                assert_eq!(scan.len(), (size * size) as usize);
                let mut seen = vec![false; (size * size) as usize];
                for &(x, y) in scan {
                    let idx = (y as u32 * size + x as u32) as usize;
                    assert!(!seen[idx]);
                    seen[idx] = true;
                }
            }
        }
    }
}
