//! # Vireo Core
//!
//! Core types and utilities for the Vireo HEVC decoder.
//!
//! This crate provides the fundamental building blocks used across the Vireo
//! components:
//! - Error handling types
//! - Bitstream reading/writing utilities (Exp-Golomb, fixed-width fields)
//! - Annex-B byte-stream helpers (start codes, emulation prevention)
//! - Planar image buffers and the pluggable image allocation contract

pub mod bitstream;
pub mod error;
pub mod image;

pub use bitstream::{BitReader, BitWriter};
pub use error::{BitstreamError, Error, Result};
pub use image::{ChromaFormat, ImageAllocation, ImageBuffer, ImageSpec, PlaneBuffer};
