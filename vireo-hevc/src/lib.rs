//! HEVC/H.265 decoding for the Vireo library.
//!
//! This crate implements the core of an HEVC decoder following the ITU-T
//! H.265 specification: the Annex-B NAL input stage, parameter set and
//! slice header parsing, CABAC entropy decoding of the CTB quad-tree,
//! intra/inter reconstruction with the in-loop deblocking and SAO filters,
//! a decoded picture buffer with POC-ordered output, and a worker pool
//! that decodes wavefront rows and filter rows in parallel, gated on
//! per-CTB progress.
//!
//! # Architecture
//!
//! Input is push-based, output pull-based; [`Decoder::decode`] bridges the
//! two by consuming one NAL unit per call:
//!
//! ```text
//! bytes -> NalParser -> parameter sets / slice headers
//!                         |
//!                         v
//!            scheduler (slice / CTB-row / filter-row tasks)
//!                         |
//!              CABAC + CTB decoding -> reconstruction
//!                         |
//!                         v
//!              DPB -> POC-ordered output queue -> host
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use vireo_hevc::{Decoder, DecodeError};
//!
//! # fn demo(bytes: &[u8]) -> Result<(), DecodeError> {
//! let mut decoder = Decoder::new();
//! decoder.start_worker_threads(4)?;
//! decoder.push_data(bytes, 0, None)?;
//! decoder.flush_data();
//!
//! loop {
//!     match decoder.decode() {
//!         Ok(true) => {}
//!         Ok(false) => break,
//!         Err(DecodeError::WaitingForInputData) => break,
//!         Err(e) => return Err(e),
//!     }
//!     while let Some(picture) = decoder.get_next_picture() {
//!         let planes = picture.planes();
//!         let _luma = planes.plane(0);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]

pub mod accel;
pub mod cabac;
pub mod ctb;
pub mod deblock;
pub mod decoder;
pub mod dpb;
pub mod error;
pub mod inter;
pub mod intra;
pub mod nal;
pub mod param;
pub mod parser;
pub mod picture;
pub mod refpic;
pub mod sao;
pub mod scheduler;
pub mod sei;
pub mod slice;
pub mod tables;
pub mod transform;

pub use accel::Acceleration;
pub use decoder::{Decoder, DecoderConfig};
pub use error::{is_ok_code, DecodeError, DecodeWarning, Result};
pub use nal::{NalUnit, NalUnitHeader, NalUnitType};
pub use param::{Pps, Sps, Vps};
pub use parser::NalParser;
pub use picture::{CtbProgress, Integrity, Picture, PictureState};
pub use slice::{SliceSegmentHeader, SliceType};

/// HEVC start code constants.
pub mod start_codes {
    /// 3-byte start code prefix.
    pub const START_CODE_3: [u8; 3] = [0x00, 0x00, 0x01];
    /// 4-byte start code prefix.
    pub const START_CODE_4: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
    /// Emulation prevention byte.
    pub const EMULATION_PREVENTION_BYTE: u8 = 0x03;
}

/// Extract the NAL unit type from the first bytes of a NAL unit.
pub fn nal_unit_type(nal_data: &[u8]) -> Option<NalUnitType> {
    if nal_data.len() < 2 {
        return None;
    }
    Some(NalUnitType::from_raw((nal_data[0] >> 1) & 0x3F))
}

/// Check whether a NAL unit type carries a parameter set.
pub fn is_parameter_set(nal_type: NalUnitType) -> bool {
    matches!(
        nal_type,
        NalUnitType::VpsNut | NalUnitType::SpsNut | NalUnitType::PpsNut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nal_unit_type_helper() {
        assert_eq!(nal_unit_type(&[0x40, 0x01]), Some(NalUnitType::VpsNut));
        assert_eq!(nal_unit_type(&[0x42, 0x01]), Some(NalUnitType::SpsNut));
        assert_eq!(nal_unit_type(&[0x26, 0x01]), Some(NalUnitType::IdrWRadl));
        assert_eq!(nal_unit_type(&[0x40]), None);
    }

    #[test]
    fn test_is_parameter_set() {
        assert!(is_parameter_set(NalUnitType::VpsNut));
        assert!(is_parameter_set(NalUnitType::SpsNut));
        assert!(is_parameter_set(NalUnitType::PpsNut));
        assert!(!is_parameter_set(NalUnitType::IdrWRadl));
        assert!(!is_parameter_set(NalUnitType::TrailR));
    }

    #[test]
    fn test_start_codes() {
        assert_eq!(start_codes::START_CODE_3, [0x00, 0x00, 0x01]);
        assert_eq!(start_codes::START_CODE_4, [0x00, 0x00, 0x00, 0x01]);
        assert_eq!(start_codes::EMULATION_PREVENTION_BYTE, 0x03);
    }
}
