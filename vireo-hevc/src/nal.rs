//! NAL unit types and headers.

use crate::error::{DecodeError, Result};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque per-unit user data handed through the decoder to output pictures.
pub type UserData = Option<Arc<dyn Any + Send + Sync>>;

/// HEVC NAL unit types (Table 7-1 of ITU-T H.265).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NalUnitType {
    /// Trailing picture, non-reference.
    TrailN,
    /// Trailing picture, reference.
    TrailR,
    /// Temporal sub-layer access, non-reference.
    TsaN,
    /// Temporal sub-layer access, reference.
    TsaR,
    /// Stepwise temporal sub-layer access, non-reference.
    StsaN,
    /// Stepwise temporal sub-layer access, reference.
    StsaR,
    /// Random access decodable leading, non-reference.
    RadlN,
    /// Random access decodable leading, reference.
    RadlR,
    /// Random access skipped leading, non-reference.
    RaslN,
    /// Random access skipped leading, reference.
    RaslR,
    /// Broken link access with leading pictures.
    BlaWLp,
    /// Broken link access with RADL pictures.
    BlaWRadl,
    /// Broken link access without leading pictures.
    BlaNLp,
    /// Instantaneous decoder refresh with RADL pictures.
    IdrWRadl,
    /// Instantaneous decoder refresh without leading pictures.
    IdrNLp,
    /// Clean random access.
    CraNut,
    /// Video parameter set.
    VpsNut,
    /// Sequence parameter set.
    SpsNut,
    /// Picture parameter set.
    PpsNut,
    /// Access unit delimiter.
    AudNut,
    /// End of sequence.
    EosNut,
    /// End of bitstream.
    EobNut,
    /// Filler data.
    FdNut,
    /// Prefix SEI.
    PrefixSeiNut,
    /// Suffix SEI.
    SuffixSeiNut,
    /// Reserved or unspecified type, raw value retained.
    Other(u8),
}

impl NalUnitType {
    /// Create from the 6-bit raw value.
    pub fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::TrailN,
            1 => Self::TrailR,
            2 => Self::TsaN,
            3 => Self::TsaR,
            4 => Self::StsaN,
            5 => Self::StsaR,
            6 => Self::RadlN,
            7 => Self::RadlR,
            8 => Self::RaslN,
            9 => Self::RaslR,
            16 => Self::BlaWLp,
            17 => Self::BlaWRadl,
            18 => Self::BlaNLp,
            19 => Self::IdrWRadl,
            20 => Self::IdrNLp,
            21 => Self::CraNut,
            32 => Self::VpsNut,
            33 => Self::SpsNut,
            34 => Self::PpsNut,
            35 => Self::AudNut,
            36 => Self::EosNut,
            37 => Self::EobNut,
            38 => Self::FdNut,
            39 => Self::PrefixSeiNut,
            40 => Self::SuffixSeiNut,
            v => Self::Other(v & 0x3F),
        }
    }

    /// Get the raw 6-bit value.
    pub fn to_raw(&self) -> u8 {
        match self {
            Self::TrailN => 0,
            Self::TrailR => 1,
            Self::TsaN => 2,
            Self::TsaR => 3,
            Self::StsaN => 4,
            Self::StsaR => 5,
            Self::RadlN => 6,
            Self::RadlR => 7,
            Self::RaslN => 8,
            Self::RaslR => 9,
            Self::BlaWLp => 16,
            Self::BlaWRadl => 17,
            Self::BlaNLp => 18,
            Self::IdrWRadl => 19,
            Self::IdrNLp => 20,
            Self::CraNut => 21,
            Self::VpsNut => 32,
            Self::SpsNut => 33,
            Self::PpsNut => 34,
            Self::AudNut => 35,
            Self::EosNut => 36,
            Self::EobNut => 37,
            Self::FdNut => 38,
            Self::PrefixSeiNut => 39,
            Self::SuffixSeiNut => 40,
            Self::Other(v) => *v,
        }
    }

    /// Check if this is a VCL (video coding layer) unit.
    pub fn is_vcl(&self) -> bool {
        self.to_raw() < 32
    }

    /// Check if this is an IRAP (intra random access point) picture.
    pub fn is_irap(&self) -> bool {
        let raw = self.to_raw();
        (16..=23).contains(&raw)
    }

    /// Check if this is an IDR picture.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// Check if this is a BLA picture.
    pub fn is_bla(&self) -> bool {
        matches!(self, Self::BlaWLp | Self::BlaWRadl | Self::BlaNLp)
    }

    /// Check if this is a CRA picture.
    pub fn is_cra(&self) -> bool {
        matches!(self, Self::CraNut)
    }

    /// Check if this is a RASL picture.
    pub fn is_rasl(&self) -> bool {
        matches!(self, Self::RaslN | Self::RaslR)
    }

    /// Check if this is a RADL picture.
    pub fn is_radl(&self) -> bool {
        matches!(self, Self::RadlN | Self::RadlR)
    }

    /// Check if this is a leading picture.
    pub fn is_leading(&self) -> bool {
        self.is_rasl() || self.is_radl()
    }

    /// Check if a picture of this type is used as a reference.
    ///
    /// Sub-layer non-reference pictures have even VCL type values below 16.
    pub fn is_reference(&self) -> bool {
        let raw = self.to_raw();
        if raw >= 32 {
            return false;
        }
        if raw >= 16 {
            // All IRAP pictures are reference pictures.
            return true;
        }
        raw % 2 == 1
    }
}

impl fmt::Display for NalUnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TrailN => write!(f, "TRAIL_N"),
            Self::TrailR => write!(f, "TRAIL_R"),
            Self::TsaN => write!(f, "TSA_N"),
            Self::TsaR => write!(f, "TSA_R"),
            Self::StsaN => write!(f, "STSA_N"),
            Self::StsaR => write!(f, "STSA_R"),
            Self::RadlN => write!(f, "RADL_N"),
            Self::RadlR => write!(f, "RADL_R"),
            Self::RaslN => write!(f, "RASL_N"),
            Self::RaslR => write!(f, "RASL_R"),
            Self::BlaWLp => write!(f, "BLA_W_LP"),
            Self::BlaWRadl => write!(f, "BLA_W_RADL"),
            Self::BlaNLp => write!(f, "BLA_N_LP"),
            Self::IdrWRadl => write!(f, "IDR_W_RADL"),
            Self::IdrNLp => write!(f, "IDR_N_LP"),
            Self::CraNut => write!(f, "CRA_NUT"),
            Self::VpsNut => write!(f, "VPS_NUT"),
            Self::SpsNut => write!(f, "SPS_NUT"),
            Self::PpsNut => write!(f, "PPS_NUT"),
            Self::AudNut => write!(f, "AUD_NUT"),
            Self::EosNut => write!(f, "EOS_NUT"),
            Self::EobNut => write!(f, "EOB_NUT"),
            Self::FdNut => write!(f, "FD_NUT"),
            Self::PrefixSeiNut => write!(f, "PREFIX_SEI_NUT"),
            Self::SuffixSeiNut => write!(f, "SUFFIX_SEI_NUT"),
            Self::Other(v) => write!(f, "NAL({})", v),
        }
    }
}

/// Two-byte HEVC NAL unit header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnitHeader {
    /// NAL unit type.
    pub nal_unit_type: NalUnitType,
    /// Layer id (0 for the base layer this decoder handles).
    pub nuh_layer_id: u8,
    /// Temporal id plus one.
    pub nuh_temporal_id_plus1: u8,
}

impl NalUnitHeader {
    /// Parse the header from the first two bytes of a NAL unit.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(DecodeError::StreamTruncated("NAL header"));
        }

        // forbidden_zero_bit must be 0
        if (data[0] & 0x80) != 0 {
            return Err(DecodeError::CodedParameterOutOfRange("forbidden_zero_bit"));
        }

        let nal_unit_type = NalUnitType::from_raw((data[0] >> 1) & 0x3F);
        let nuh_layer_id = ((data[0] & 0x01) << 5) | ((data[1] >> 3) & 0x1F);
        let nuh_temporal_id_plus1 = data[1] & 0x07;

        if nuh_temporal_id_plus1 == 0 {
            return Err(DecodeError::CodedParameterOutOfRange(
                "nuh_temporal_id_plus1",
            ));
        }

        Ok(Self {
            nal_unit_type,
            nuh_layer_id,
            nuh_temporal_id_plus1,
        })
    }

    /// Get the temporal id (0-based).
    pub fn temporal_id(&self) -> u8 {
        self.nuh_temporal_id_plus1 - 1
    }
}

/// One complete NAL unit with its emulation-prevention-stripped payload.
#[derive(Debug, Clone)]
pub struct NalUnit {
    /// Parsed two-byte header.
    pub header: NalUnitHeader,
    /// RBSP payload (header bytes removed, emulation prevention stripped).
    pub rbsp: Vec<u8>,
    /// Presentation timestamp attached to the first byte of this unit.
    pub pts: i64,
    /// Opaque user data attached by the host.
    pub user_data: UserData,
}

impl NalUnit {
    /// NAL unit type shorthand.
    pub fn unit_type(&self) -> NalUnitType {
        self.header.nal_unit_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nal_unit_type_roundtrip() {
        for i in 0..64 {
            let nal_type = NalUnitType::from_raw(i);
            assert_eq!(nal_type.to_raw(), i);
        }
    }

    #[test]
    fn test_nal_unit_type_classification() {
        assert!(NalUnitType::IdrWRadl.is_idr());
        assert!(NalUnitType::IdrNLp.is_idr());
        assert!(!NalUnitType::TrailR.is_idr());

        assert!(NalUnitType::IdrWRadl.is_irap());
        assert!(NalUnitType::CraNut.is_irap());
        assert!(NalUnitType::BlaWLp.is_irap());
        assert!(!NalUnitType::TrailR.is_irap());

        assert!(NalUnitType::TrailR.is_vcl());
        assert!(!NalUnitType::VpsNut.is_vcl());

        assert!(NalUnitType::TrailR.is_reference());
        assert!(!NalUnitType::TrailN.is_reference());
        assert!(NalUnitType::IdrNLp.is_reference());

        assert!(NalUnitType::RaslN.is_leading());
        assert!(NalUnitType::RadlR.is_leading());
        assert!(!NalUnitType::TrailN.is_leading());
    }

    #[test]
    fn test_nal_unit_header_parse() {
        // nal_unit_type=1 (TRAIL_R), layer_id=0, temporal_id_plus1=1
        let header = NalUnitHeader::parse(&[0x02, 0x01]).unwrap();
        assert_eq!(header.nal_unit_type, NalUnitType::TrailR);
        assert_eq!(header.nuh_layer_id, 0);
        assert_eq!(header.temporal_id(), 0);

        // VPS header
        let header = NalUnitHeader::parse(&[0x40, 0x01]).unwrap();
        assert_eq!(header.nal_unit_type, NalUnitType::VpsNut);
    }

    #[test]
    fn test_nal_unit_header_rejects_forbidden_bit() {
        assert!(NalUnitHeader::parse(&[0x82, 0x01]).is_err());
    }

    #[test]
    fn test_nal_unit_header_rejects_zero_temporal_id() {
        assert!(NalUnitHeader::parse(&[0x02, 0x00]).is_err());
    }

    #[test]
    fn test_nal_unit_header_truncated() {
        assert!(NalUnitHeader::parse(&[0x02]).is_err());
    }
}
