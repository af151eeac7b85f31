//! Planar image buffers and the pluggable allocation contract.
//!
//! Decoded pictures own their pixel planes through an [`ImageAllocation`]
//! implementation, so host applications can substitute their own buffer
//! management (pools, mapped GPU memory). The default allocator rounds
//! strides up to a 32-byte multiple and pads every plane so SIMD kernels
//! may over-read past the right edge.

use crate::error::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Number of bytes of slack appended to every plane allocation.
pub const MEMORY_PADDING: usize = 16;

/// Stride alignment (in samples) used by the default allocator.
pub const STRIDE_ALIGNMENT: usize = 32;

/// Chroma sampling structure of a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChromaFormat {
    /// Luma only.
    Monochrome,
    /// 4:2:0 (1 chroma sample pair per 2x2 luma samples).
    C420,
    /// 4:2:2 (1 chroma sample pair per 2x1 luma samples).
    C422,
    /// 4:4:4 (no subsampling).
    C444,
}

impl ChromaFormat {
    /// Create from the `chroma_format_idc` syntax value.
    pub fn from_idc(idc: u8) -> Option<Self> {
        match idc {
            0 => Some(Self::Monochrome),
            1 => Some(Self::C420),
            2 => Some(Self::C422),
            3 => Some(Self::C444),
            _ => None,
        }
    }

    /// Get the `chroma_format_idc` value.
    pub fn idc(&self) -> u8 {
        match self {
            Self::Monochrome => 0,
            Self::C420 => 1,
            Self::C422 => 2,
            Self::C444 => 3,
        }
    }

    /// Number of pixel planes.
    pub fn num_planes(&self) -> usize {
        match self {
            Self::Monochrome => 1,
            _ => 3,
        }
    }

    /// Horizontal chroma subsampling factor (SubWidthC).
    pub fn sub_width(&self) -> u32 {
        match self {
            Self::C420 | Self::C422 => 2,
            _ => 1,
        }
    }

    /// Vertical chroma subsampling factor (SubHeightC).
    pub fn sub_height(&self) -> u32 {
        match self {
            Self::C420 => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for ChromaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monochrome => write!(f, "monochrome"),
            Self::C420 => write!(f, "4:2:0"),
            Self::C422 => write!(f, "4:2:2"),
            Self::C444 => write!(f, "4:4:4"),
        }
    }
}

/// Geometry and format of an image to be allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSpec {
    /// Luma width in samples.
    pub width: u32,
    /// Luma height in samples.
    pub height: u32,
    /// Chroma sampling structure.
    pub chroma: ChromaFormat,
    /// Luma bit depth.
    pub bit_depth_luma: u8,
    /// Chroma bit depth.
    pub bit_depth_chroma: u8,
    /// Requested stride alignment in samples.
    pub alignment: usize,
}

impl ImageSpec {
    /// Create a spec with the default alignment.
    pub fn new(width: u32, height: u32, chroma: ChromaFormat) -> Self {
        Self {
            width,
            height,
            chroma,
            bit_depth_luma: 8,
            bit_depth_chroma: 8,
            alignment: STRIDE_ALIGNMENT,
        }
    }

    /// Width of the given plane in samples.
    pub fn plane_width(&self, plane: usize) -> u32 {
        if plane == 0 {
            self.width
        } else {
            self.width / self.chroma.sub_width()
        }
    }

    /// Height of the given plane in samples.
    pub fn plane_height(&self, plane: usize) -> u32 {
        if plane == 0 {
            self.height
        } else {
            self.height / self.chroma.sub_height()
        }
    }
}

/// A single pixel plane with its stride.
#[derive(Clone)]
pub struct PlaneBuffer {
    data: Vec<u8>,
    stride: usize,
    width: u32,
    height: u32,
}

impl PlaneBuffer {
    /// Create a plane of `height` rows of `stride` samples, zero-filled,
    /// with `padding` extra bytes at the end.
    pub fn new(width: u32, height: u32, stride: usize, padding: usize) -> Self {
        Self {
            data: vec![0u8; stride * height as usize + padding],
            stride,
            width,
            height,
        }
    }

    /// Plane width in samples.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Plane height in samples.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Row stride in samples.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Borrow the raw sample data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Borrow the raw sample data mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Read a sample, clamping the coordinates to the plane (edge
    /// replication for out-of-picture accesses).
    pub fn sample_clamped(&self, x: i32, y: i32) -> u8 {
        let x = x.clamp(0, self.width as i32 - 1) as usize;
        let y = y.clamp(0, self.height as i32 - 1) as usize;
        self.data[y * self.stride + x]
    }

    /// Borrow one row of samples.
    pub fn row(&self, y: usize) -> &[u8] {
        &self.data[y * self.stride..y * self.stride + self.width as usize]
    }

    /// Fill the plane with a constant sample value.
    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }
}

impl fmt::Debug for PlaneBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaneBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .finish()
    }
}

/// A planar image: one luma plane plus chroma planes per the chroma format.
#[derive(Debug, Clone)]
pub struct ImageBuffer {
    spec: ImageSpec,
    planes: Vec<PlaneBuffer>,
}

impl ImageBuffer {
    /// Assemble an image from pre-allocated planes.
    pub fn from_planes(spec: ImageSpec, planes: Vec<PlaneBuffer>) -> Self {
        debug_assert_eq!(planes.len(), spec.chroma.num_planes());
        Self { spec, planes }
    }

    /// The spec this image was allocated for.
    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    /// Luma width in samples.
    pub fn width(&self) -> u32 {
        self.spec.width
    }

    /// Luma height in samples.
    pub fn height(&self) -> u32 {
        self.spec.height
    }

    /// Number of planes.
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Borrow a plane.
    pub fn plane(&self, index: usize) -> &PlaneBuffer {
        &self.planes[index]
    }

    /// Borrow a plane mutably.
    pub fn plane_mut(&mut self, index: usize) -> &mut PlaneBuffer {
        &mut self.planes[index]
    }

    /// Borrow two distinct planes mutably at once.
    pub fn planes_mut(&mut self) -> &mut [PlaneBuffer] {
        &mut self.planes
    }
}

/// Pluggable image buffer allocation.
///
/// `get_buffer` must populate one plane per `spec.chroma.num_planes()`,
/// each with at least `stride * height + padding` bytes; `release_buffer`
/// takes the buffer back. Implementations may recycle buffers.
pub trait ImageAllocation: Send + Sync {
    /// Allocate planes for the given spec.
    fn get_buffer(&self, spec: &ImageSpec) -> Result<ImageBuffer>;

    /// Release a previously allocated buffer.
    fn release_buffer(&self, buffer: ImageBuffer) {
        drop(buffer);
    }
}

/// Default allocator: heap planes with aligned strides and SIMD padding.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAllocation;

impl ImageAllocation for DefaultAllocation {
    fn get_buffer(&self, spec: &ImageSpec) -> Result<ImageBuffer> {
        if spec.width == 0 || spec.height == 0 {
            return Err(Error::AllocationFailed {
                width: spec.width,
                height: spec.height,
            });
        }

        let align = spec.alignment.max(1);
        let mut planes = Vec::with_capacity(spec.chroma.num_planes());
        for p in 0..spec.chroma.num_planes() {
            let w = spec.plane_width(p);
            let h = spec.plane_height(p);
            let stride = (w as usize).div_ceil(align) * align;
            planes.push(PlaneBuffer::new(w, h, stride, MEMORY_PADDING));
        }

        Ok(ImageBuffer::from_planes(*spec, planes))
    }
}

/// Shared handle to an allocation strategy.
pub type SharedAllocation = Arc<dyn ImageAllocation>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chroma_format() {
        assert_eq!(ChromaFormat::from_idc(1), Some(ChromaFormat::C420));
        assert_eq!(ChromaFormat::from_idc(4), None);
        assert_eq!(ChromaFormat::C420.num_planes(), 3);
        assert_eq!(ChromaFormat::Monochrome.num_planes(), 1);
        assert_eq!(ChromaFormat::C420.sub_width(), 2);
        assert_eq!(ChromaFormat::C420.sub_height(), 2);
        assert_eq!(ChromaFormat::C422.sub_height(), 1);
        assert_eq!(ChromaFormat::C444.sub_width(), 1);
    }

    #[test]
    fn test_default_allocation() {
        let spec = ImageSpec::new(100, 64, ChromaFormat::C420);
        let img = DefaultAllocation.get_buffer(&spec).unwrap();

        assert_eq!(img.num_planes(), 3);
        assert_eq!(img.plane(0).width(), 100);
        assert_eq!(img.plane(0).stride() % STRIDE_ALIGNMENT, 0);
        assert_eq!(img.plane(1).width(), 50);
        assert_eq!(img.plane(1).height(), 32);
        assert!(img.plane(0).data().len() >= img.plane(0).stride() * 64 + MEMORY_PADDING);
    }

    #[test]
    fn test_zero_size_allocation_fails() {
        let spec = ImageSpec::new(0, 64, ChromaFormat::C420);
        assert!(DefaultAllocation.get_buffer(&spec).is_err());
    }

    #[test]
    fn test_sample_clamped() {
        let mut plane = PlaneBuffer::new(4, 4, 4, 0);
        plane.data_mut()[0] = 7;
        plane.data_mut()[15] = 9;

        assert_eq!(plane.sample_clamped(-5, -5), 7);
        assert_eq!(plane.sample_clamped(100, 100), 9);
        assert_eq!(plane.sample_clamped(0, 0), 7);
    }
}
