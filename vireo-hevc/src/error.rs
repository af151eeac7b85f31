//! Decoder error and warning types.
//!
//! Error kinds form two bands, mirroring the numeric codes the decoder
//! reports to host applications: fatal errors carry codes below 1000 and
//! abort the current `decode` call; warnings carry codes of 1000 and above,
//! are queued on the decoder, and never stop decoding on their own.

use std::fmt;
use thiserror::Error;

/// Fatal decoder errors (codes < 1000).
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Input file could not be opened (reported by host wrappers).
    #[error("no such file")]
    NoSuchFile,

    /// End of file reached.
    #[error("end of file")]
    Eof,

    /// Coefficient position outside the image.
    #[error("coefficient out of image bounds")]
    CoefficientOutOfImageBounds,

    /// Decoded picture hash did not match the SEI checksum.
    #[error("image checksum mismatch")]
    ChecksumMismatch,

    /// CTB address outside the image area.
    #[error("CTB outside of image area")]
    CtbOutsideImageArea,

    /// Allocation failure.
    #[error("out of memory")]
    OutOfMemory,

    /// A coded parameter violated its legal range.
    #[error("coded parameter out of range: {0}")]
    CodedParameterOutOfRange(&'static str),

    /// DPB or output queue full.
    #[error("DPB/output queue full")]
    ImageBufferFull,

    /// Worker threads could not be started.
    #[error("cannot start decoding threads")]
    CannotStartThreadpool,

    /// Global table initialization failed.
    #[error("global library initialization failed")]
    LibraryInitFailed,

    /// Internal limit: too many thread contexts.
    #[error("internal error: maximum number of thread contexts exceeded")]
    MaxThreadContextsExceeded,

    /// Internal limit: too many slices in one picture.
    #[error("internal error: maximum number of slices exceeded")]
    MaxSlicesExceeded,

    /// No more input data; the decoder is stalled.
    #[error("no more input data, decoder stalled")]
    WaitingForInputData,

    /// SEI payload could not be processed.
    #[error("SEI data cannot be processed")]
    CannotProcessSei,

    /// Bitstream ran out in the middle of a syntax element.
    #[error("stream truncated: {0}")]
    StreamTruncated(&'static str),

    /// Feature present in the stream that this decoder does not implement.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl DecodeError {
    /// Numeric code of this error kind (all below 1000).
    pub fn code(&self) -> u32 {
        match self {
            Self::NoSuchFile => 1,
            Self::Eof => 2,
            Self::CoefficientOutOfImageBounds => 3,
            Self::ChecksumMismatch => 4,
            Self::CtbOutsideImageArea => 5,
            Self::OutOfMemory => 6,
            Self::CodedParameterOutOfRange(_) => 7,
            Self::ImageBufferFull => 8,
            Self::CannotStartThreadpool => 9,
            Self::LibraryInitFailed => 10,
            Self::MaxThreadContextsExceeded => 11,
            Self::MaxSlicesExceeded => 12,
            Self::WaitingForInputData => 13,
            Self::CannotProcessSei => 14,
            Self::StreamTruncated(_) => 15,
            Self::Unsupported(_) => 16,
        }
    }
}

/// Recoverable warnings (codes >= 1000). The decoder queues these and
/// continues, marking affected pictures with a degraded integrity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeWarning {
    /// The stream does not use WPP, multi-threaded row decoding is off.
    NoWppCannotUseMultithreading,
    /// The warning queue overflowed and dropped its oldest entry.
    WarningBufferFull,
    /// Slice data ended before the last CTB.
    PrematureEndOfSliceSegment,
    /// An entry-point offset pointed outside the slice data.
    IncorrectEntryPointOffset,
    /// CTB outside the image area (concealed).
    CtbOutsideImageArea,
    /// SPS header failed validation.
    SpsHeaderInvalid,
    /// PPS header failed validation.
    PpsHeaderInvalid,
    /// Slice header failed validation.
    SliceHeaderInvalid,
    /// Motion vector scaling was impossible (td == 0).
    IncorrectMotionVectorScaling,
    /// A slice referenced a PPS id that was never received.
    NonexistingPpsReferenced,
    /// A PPS referenced an SPS id that was never received.
    NonexistingSpsReferenced,
    /// Both prediction flags were zero in motion compensation.
    BothPredFlagsZero,
    /// A reference list pointed at a picture absent from the DPB.
    NonexistingReferencePictureAccessed,
    /// Deblocking saw differing motion-vector counts across an edge.
    NumMvPNotEqualToNumMvQ,
    /// num_short_term_ref_pic_sets exceeded its legal range.
    NumberOfShortTermRefPicSetsOutOfRange,
    /// A short-term RPS index exceeded the SPS set count.
    ShortTermRefPicSetOutOfRange,
    /// Reference picture list construction produced an invalid list.
    FaultyReferencePictureList,
    /// end_of_sub_stream_one_bit was not set where required.
    EossBitNotSet,
    /// More reference pictures than the level allows.
    MaxNumRefPicsExceeded,
    /// chroma_format_idc was invalid.
    InvalidChromaFormat,
    /// slice_segment_address outside the picture.
    SliceSegmentAddressInvalid,
    /// A dependent slice segment appeared at address zero.
    DependentSliceWithAddressZero,
    /// Requested thread count clamped to the implementation maximum.
    NumberOfThreadsLimitedToMaximum,
    /// Slice header referenced a non-existing long-term candidate.
    NonexistingLtReferenceCandidate,
    /// Decoded-picture-hash SEI type not supported (MD5).
    UnsupportedPictureHashType,
}

impl DecodeWarning {
    /// Numeric code of this warning kind (all >= 1000).
    pub fn code(&self) -> u32 {
        match self {
            Self::NoWppCannotUseMultithreading => 1000,
            Self::WarningBufferFull => 1001,
            Self::PrematureEndOfSliceSegment => 1002,
            Self::IncorrectEntryPointOffset => 1003,
            Self::CtbOutsideImageArea => 1004,
            Self::SpsHeaderInvalid => 1005,
            Self::PpsHeaderInvalid => 1006,
            Self::SliceHeaderInvalid => 1007,
            Self::IncorrectMotionVectorScaling => 1008,
            Self::NonexistingPpsReferenced => 1009,
            Self::NonexistingSpsReferenced => 1010,
            Self::BothPredFlagsZero => 1011,
            Self::NonexistingReferencePictureAccessed => 1012,
            Self::NumMvPNotEqualToNumMvQ => 1013,
            Self::NumberOfShortTermRefPicSetsOutOfRange => 1014,
            Self::ShortTermRefPicSetOutOfRange => 1015,
            Self::FaultyReferencePictureList => 1016,
            Self::EossBitNotSet => 1017,
            Self::MaxNumRefPicsExceeded => 1018,
            Self::InvalidChromaFormat => 1019,
            Self::SliceSegmentAddressInvalid => 1020,
            Self::DependentSliceWithAddressZero => 1021,
            Self::NumberOfThreadsLimitedToMaximum => 1022,
            Self::NonexistingLtReferenceCandidate => 1023,
            Self::UnsupportedPictureHashType => 1024,
        }
    }

    /// Human-readable description.
    pub fn text(&self) -> &'static str {
        match self {
            Self::NoWppCannotUseMultithreading => {
                "cannot run decoder multi-threaded because stream does not support WPP"
            }
            Self::WarningBufferFull => "too many warnings queued",
            Self::PrematureEndOfSliceSegment => "premature end of slice segment",
            Self::IncorrectEntryPointOffset => "incorrect entry-point offset",
            Self::CtbOutsideImageArea => "CTB outside of image area (concealing stream error)",
            Self::SpsHeaderInvalid => "sps header invalid",
            Self::PpsHeaderInvalid => "pps header invalid",
            Self::SliceHeaderInvalid => "slice header invalid",
            Self::IncorrectMotionVectorScaling => "impossible motion vector scaling",
            Self::NonexistingPpsReferenced => "non-existing PPS referenced",
            Self::NonexistingSpsReferenced => "non-existing SPS referenced",
            Self::BothPredFlagsZero => "both predFlags[] are zero in MC",
            Self::NonexistingReferencePictureAccessed => {
                "non-existing reference picture accessed"
            }
            Self::NumMvPNotEqualToNumMvQ => "numMV_P != numMV_Q in deblocking",
            Self::NumberOfShortTermRefPicSetsOutOfRange => {
                "number of short-term ref-pic-sets out of range"
            }
            Self::ShortTermRefPicSetOutOfRange => "short-term ref-pic-set index out of range",
            Self::FaultyReferencePictureList => "faulty reference picture list",
            Self::EossBitNotSet => {
                "end_of_sub_stream_one_bit not set to 1 when it should be"
            }
            Self::MaxNumRefPicsExceeded => "maximum number of reference pictures exceeded",
            Self::InvalidChromaFormat => "invalid chroma format in SPS header",
            Self::SliceSegmentAddressInvalid => "slice segment address invalid",
            Self::DependentSliceWithAddressZero => "dependent slice with address 0",
            Self::NumberOfThreadsLimitedToMaximum => {
                "number of threads limited to maximum amount"
            }
            Self::NonexistingLtReferenceCandidate => {
                "non-existing long-term reference candidate specified in slice header"
            }
            Self::UnsupportedPictureHashType => "unsupported decoded-picture-hash type",
        }
    }
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

/// Outcome accepted by the `isOK` predicate: success or a queued warning.
pub fn is_ok_code(code: u32) -> bool {
    code == 0 || code >= 1000
}

/// Result type for decoder operations.
pub type Result<T> = std::result::Result<T, DecodeError>;

impl From<vireo_core::Error> for DecodeError {
    fn from(e: vireo_core::Error) -> Self {
        match e {
            vireo_core::Error::Bitstream(vireo_core::BitstreamError::UnexpectedEnd) => {
                DecodeError::StreamTruncated("bitstream ended inside a syntax element")
            }
            vireo_core::Error::Bitstream(_) => {
                DecodeError::CodedParameterOutOfRange("invalid bitstream syntax")
            }
            vireo_core::Error::AllocationFailed { .. } => DecodeError::OutOfMemory,
            _ => DecodeError::CodedParameterOutOfRange("core error"),
        }
    }
}
