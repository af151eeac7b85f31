//! Acceleration selection and the pluggable kernel table.
//!
//! All sample-level primitives are reached through a table of function
//! pointers selected at configuration time. The scalar kernels are the
//! reference implementation; the SSE4.2 and AVX2 tables currently alias
//! them and exist as the dispatch points optimized kernels hook into.

use crate::picture::MotionVector;
use crate::{deblock, inter, intra, sao, transform};
use vireo_core::image::PlaneBuffer;

/// Requested acceleration level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Acceleration {
    /// Portable scalar kernels.
    Scalar,
    /// SSE4.2 kernel table.
    Sse42,
    /// AVX2 kernel table.
    Avx2,
    /// Pick the best table the CPU supports.
    #[default]
    Auto,
}

/// Function-valued kernel table.
#[derive(Clone, Copy)]
pub struct KernelTable {
    /// Table name for diagnostics.
    pub name: &'static str,
    /// Intra prediction of one block.
    pub intra_predict: fn(
        plane: &mut PlaneBuffer,
        refs: &intra::RefSamples,
        x0: u32,
        y0: u32,
        size: u32,
        mode: u8,
        bit_depth: u8,
        edge_filter: bool,
    ),
    /// Luma quarter-sample interpolation (14-bit output).
    pub mc_luma:
        fn(refp: &PlaneBuffer, x0: i32, y0: i32, w: usize, h: usize, mv: MotionVector) -> Vec<i32>,
    /// Chroma eighth-sample interpolation (14-bit output).
    pub mc_chroma:
        fn(refp: &PlaneBuffer, x0: i32, y0: i32, w: usize, h: usize, mv: MotionVector) -> Vec<i32>,
    /// Inverse DCT/DST.
    pub inverse_transform: fn(coeffs: &[i32], log2_size: u8, use_dst: bool, bit_depth: u8) -> Vec<i16>,
    /// Luma deblocking of one 4-line edge segment.
    pub deblock_luma_edge: fn(
        plane: &mut PlaneBuffer,
        x: usize,
        y: usize,
        vertical: bool,
        bs: u8,
        qp: i32,
        beta_offset: i8,
        tc_offset: i8,
        bit_depth: u8,
    ),
    /// Chroma deblocking of one edge segment.
    pub deblock_chroma_edge: fn(
        plane: &mut PlaneBuffer,
        x: usize,
        y: usize,
        vertical: bool,
        qp_c: i32,
        tc_offset: i8,
        bit_depth: u8,
        lines: usize,
    ),
    /// SAO application over one CTB region of one component.
    pub sao_region: fn(
        plane: &mut PlaneBuffer,
        x0: u32,
        y0: u32,
        w: u32,
        h: u32,
        comp: &sao::SaoComponent,
        bit_depth: u8,
    ),
}

impl std::fmt::Debug for KernelTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelTable").field("name", &self.name).finish()
    }
}

const SCALAR_TABLE: KernelTable = KernelTable {
    name: "scalar",
    intra_predict: intra::predict,
    mc_luma: inter::mc_luma,
    mc_chroma: inter::mc_chroma,
    inverse_transform: transform::inverse_transform,
    deblock_luma_edge: deblock::filter_luma_edge,
    deblock_chroma_edge: deblock::filter_chroma_edge,
    sao_region: sao::apply_sao_region,
};

const SSE42_TABLE: KernelTable = KernelTable {
    name: "sse4.2",
    ..SCALAR_TABLE
};

const AVX2_TABLE: KernelTable = KernelTable {
    name: "avx2",
    ..SCALAR_TABLE
};

/// Runtime CPU capability probe.
#[cfg(target_arch = "x86_64")]
fn detect() -> Acceleration {
    if is_x86_feature_detected!("avx2") {
        Acceleration::Avx2
    } else if is_x86_feature_detected!("sse4.2") {
        Acceleration::Sse42
    } else {
        Acceleration::Scalar
    }
}

#[cfg(not(target_arch = "x86_64"))]
fn detect() -> Acceleration {
    Acceleration::Scalar
}

impl Acceleration {
    /// Resolve to the kernel table for this level.
    pub fn table(self) -> &'static KernelTable {
        match self {
            Acceleration::Scalar => &SCALAR_TABLE,
            Acceleration::Sse42 => &SSE42_TABLE,
            Acceleration::Avx2 => &AVX2_TABLE,
            Acceleration::Auto => detect().table(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_selection() {
        assert_eq!(Acceleration::Scalar.table().name, "scalar");
        assert_eq!(Acceleration::Sse42.table().name, "sse4.2");
        assert_eq!(Acceleration::Avx2.table().name, "avx2");
    }

    #[test]
    fn test_auto_resolves() {
        // Auto must resolve to a concrete table.
        let table = Acceleration::Auto.table();
        assert!(!table.name.is_empty());
    }

    #[test]
    fn test_tables_agree_on_reference_kernels() {
        // The SIMD tables alias the scalar kernels until real
        // implementations are plugged in.
        let a = Acceleration::Scalar.table();
        let b = Acceleration::Avx2.table();
        assert_eq!(a.mc_luma as usize, b.mc_luma as usize);
    }
}
