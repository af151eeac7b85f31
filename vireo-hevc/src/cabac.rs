//! CABAC arithmetic decoding engine and context models.
//!
//! The decoder keeps the arithmetic coding interval as `(range, offset)`
//! with `range` renormalized into `[256, 511]`. Context models live in a
//! [`ContextTable`] addressed through the named offsets in [`ctx`]; the
//! table can be snapshotted and restored to support dependent slice
//! segments and wavefront row inheritance.

use crate::slice::SliceType;

/// Probability state transition after coding the MPS.
const NEXT_STATE_MPS: [u8; 64] = [
    1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26,
    27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40, 41, 42, 43, 44, 45, 46, 47, 48, 49,
    50, 51, 52, 53, 54, 55, 56, 57, 58, 59, 60, 61, 62, 62, 63,
];

/// Probability state transition after coding the LPS.
const NEXT_STATE_LPS: [u8; 64] = [
    0, 0, 1, 2, 2, 4, 4, 5, 6, 7, 8, 9, 9, 11, 11, 12, 13, 13, 15, 15, 16, 16, 18, 18, 19, 19,
    21, 21, 22, 22, 23, 24, 24, 25, 26, 26, 27, 27, 28, 29, 29, 30, 30, 30, 31, 32, 32, 33, 33,
    33, 34, 34, 35, 35, 35, 36, 36, 36, 37, 37, 37, 38, 38, 63,
];

/// LPS subinterval width by probability state and range quantizer.
const RANGE_TAB_LPS: [[u8; 4]; 64] = [
    [128, 176, 208, 240],
    [128, 167, 197, 227],
    [128, 158, 187, 216],
    [123, 150, 178, 205],
    [116, 142, 169, 195],
    [111, 135, 160, 185],
    [105, 128, 152, 175],
    [100, 122, 144, 166],
    [95, 116, 137, 158],
    [90, 110, 130, 150],
    [85, 104, 123, 142],
    [81, 99, 117, 135],
    [77, 94, 111, 128],
    [73, 89, 105, 122],
    [69, 85, 100, 116],
    [66, 80, 95, 110],
    [62, 76, 90, 104],
    [59, 72, 86, 99],
    [56, 69, 81, 94],
    [53, 65, 77, 89],
    [51, 62, 73, 85],
    [48, 59, 69, 80],
    [46, 56, 66, 76],
    [43, 53, 63, 72],
    [41, 50, 59, 69],
    [39, 48, 56, 65],
    [37, 45, 54, 62],
    [35, 43, 51, 59],
    [33, 41, 48, 56],
    [32, 39, 46, 53],
    [30, 37, 43, 50],
    [29, 35, 41, 48],
    [27, 33, 39, 45],
    [26, 31, 37, 43],
    [24, 30, 35, 41],
    [23, 28, 33, 39],
    [22, 27, 32, 37],
    [21, 26, 30, 35],
    [20, 24, 29, 33],
    [19, 23, 27, 31],
    [18, 22, 26, 30],
    [17, 21, 25, 28],
    [16, 20, 23, 27],
    [15, 19, 22, 25],
    [14, 18, 21, 24],
    [14, 17, 20, 23],
    [13, 16, 19, 22],
    [12, 15, 18, 21],
    [12, 14, 17, 20],
    [11, 14, 16, 19],
    [11, 13, 15, 18],
    [10, 12, 15, 17],
    [10, 12, 14, 16],
    [9, 11, 13, 15],
    [9, 11, 12, 14],
    [8, 10, 12, 14],
    [8, 9, 11, 13],
    [7, 9, 11, 12],
    [7, 9, 10, 12],
    [7, 8, 10, 11],
    [6, 8, 9, 11],
    [6, 7, 9, 10],
    [6, 7, 8, 9],
    [2, 2, 2, 2],
];

/// A single context model: 6-bit probability state plus MPS.
#[derive(Debug, Clone, Copy)]
pub struct ContextModel {
    state: u8,
    mps: bool,
}

impl ContextModel {
    /// Initialize from an init value and the slice QP (9.3.2.2).
    pub fn init(init_value: u8, qp: i32) -> Self {
        let slope = (init_value >> 4) as i32 * 5 - 45;
        let offset = ((init_value & 15) as i32) * 8 - 16;
        let pre = ((slope * qp.clamp(0, 51)) >> 4) + offset;
        let pre = pre.clamp(1, 126);

        if pre <= 63 {
            Self {
                state: (63 - pre) as u8,
                mps: false,
            }
        } else {
            Self {
                state: (pre - 64) as u8,
                mps: true,
            }
        }
    }

    /// Current probability state.
    pub fn state(&self) -> u8 {
        self.state
    }

    /// Current most probable symbol.
    pub fn mps(&self) -> bool {
        self.mps
    }
}

/// Named context offsets into the [`ContextTable`].
pub mod ctx {
    /// sao_merge_left_flag / sao_merge_up_flag.
    pub const SAO_MERGE_FLAG: usize = 0;
    /// sao_type_idx_luma / sao_type_idx_chroma.
    pub const SAO_TYPE_IDX: usize = SAO_MERGE_FLAG + 1;
    /// split_cu_flag (3 neighbour-dependent contexts).
    pub const SPLIT_CU_FLAG: usize = SAO_TYPE_IDX + 1;
    /// cu_transquant_bypass_flag.
    pub const CU_TRANSQUANT_BYPASS: usize = SPLIT_CU_FLAG + 3;
    /// cu_skip_flag (3 neighbour-dependent contexts).
    pub const CU_SKIP_FLAG: usize = CU_TRANSQUANT_BYPASS + 1;
    /// pred_mode_flag.
    pub const PRED_MODE_FLAG: usize = CU_SKIP_FLAG + 3;
    /// part_mode (4 contexts).
    pub const PART_MODE: usize = PRED_MODE_FLAG + 1;
    /// prev_intra_luma_pred_flag.
    pub const PREV_INTRA_LUMA_PRED: usize = PART_MODE + 4;
    /// intra_chroma_pred_mode.
    pub const INTRA_CHROMA_PRED_MODE: usize = PREV_INTRA_LUMA_PRED + 1;
    /// rqt_root_cbf.
    pub const RQT_ROOT_CBF: usize = INTRA_CHROMA_PRED_MODE + 1;
    /// merge_flag.
    pub const MERGE_FLAG: usize = RQT_ROOT_CBF + 1;
    /// merge_idx.
    pub const MERGE_IDX: usize = MERGE_FLAG + 1;
    /// inter_pred_idc (5 contexts: 4 depth + 1 size).
    pub const INTER_PRED_IDC: usize = MERGE_IDX + 1;
    /// ref_idx_l0 / ref_idx_l1 (2 contexts).
    pub const REF_IDX: usize = INTER_PRED_IDC + 5;
    /// mvp_l0_flag / mvp_l1_flag.
    pub const MVP_FLAG: usize = REF_IDX + 2;
    /// abs_mvd_greater0_flag.
    pub const ABS_MVD_GREATER0: usize = MVP_FLAG + 1;
    /// abs_mvd_greater1_flag.
    pub const ABS_MVD_GREATER1: usize = ABS_MVD_GREATER0 + 1;
    /// split_transform_flag (3 contexts by TB size).
    pub const SPLIT_TRANSFORM_FLAG: usize = ABS_MVD_GREATER1 + 1;
    /// cbf_luma (2 contexts by depth).
    pub const CBF_LUMA: usize = SPLIT_TRANSFORM_FLAG + 3;
    /// cbf_cb / cbf_cr (4 contexts by depth).
    pub const CBF_CHROMA: usize = CBF_LUMA + 2;
    /// cu_qp_delta_abs (2 contexts).
    pub const CU_QP_DELTA_ABS: usize = CBF_CHROMA + 4;
    /// transform_skip_flag (luma, chroma).
    pub const TRANSFORM_SKIP: usize = CU_QP_DELTA_ABS + 2;
    /// last_sig_coeff_x_prefix (15 luma + 3 chroma).
    pub const LAST_SIG_X_PREFIX: usize = TRANSFORM_SKIP + 2;
    /// last_sig_coeff_y_prefix (15 luma + 3 chroma).
    pub const LAST_SIG_Y_PREFIX: usize = LAST_SIG_X_PREFIX + 18;
    /// coded_sub_block_flag (2 luma + 2 chroma).
    pub const CODED_SUB_BLOCK: usize = LAST_SIG_Y_PREFIX + 18;
    /// sig_coeff_flag (27 luma + 15 chroma + 2 transform-skip).
    pub const SIG_COEFF_FLAG: usize = CODED_SUB_BLOCK + 4;
    /// coeff_abs_level_greater1_flag (16 luma + 8 chroma).
    pub const COEFF_ABS_GREATER1: usize = SIG_COEFF_FLAG + 44;
    /// coeff_abs_level_greater2_flag (4 luma + 2 chroma).
    pub const COEFF_ABS_GREATER2: usize = COEFF_ABS_GREATER1 + 24;
    /// Total number of context models.
    pub const COUNT: usize = COEFF_ABS_GREATER2 + 6;
}

/// Per-element init values for the three init types (I, P, B).
struct InitBlock {
    offset: usize,
    rows: [&'static [u8]; 3],
}

const INIT_BLOCKS: &[InitBlock] = &[
    InitBlock {
        offset: ctx::SAO_MERGE_FLAG,
        rows: [&[153], &[153], &[153]],
    },
    InitBlock {
        offset: ctx::SAO_TYPE_IDX,
        rows: [&[200], &[185], &[160]],
    },
    InitBlock {
        offset: ctx::SPLIT_CU_FLAG,
        rows: [&[139, 141, 157], &[107, 139, 126], &[107, 139, 126]],
    },
    InitBlock {
        offset: ctx::CU_TRANSQUANT_BYPASS,
        rows: [&[154], &[154], &[154]],
    },
    InitBlock {
        offset: ctx::CU_SKIP_FLAG,
        rows: [&[154, 154, 154], &[197, 185, 201], &[197, 185, 201]],
    },
    InitBlock {
        offset: ctx::PRED_MODE_FLAG,
        rows: [&[154], &[149], &[134]],
    },
    InitBlock {
        offset: ctx::PART_MODE,
        rows: [
            &[184, 154, 154, 154],
            &[154, 139, 154, 154],
            &[154, 139, 154, 154],
        ],
    },
    InitBlock {
        offset: ctx::PREV_INTRA_LUMA_PRED,
        rows: [&[184], &[154], &[183]],
    },
    InitBlock {
        offset: ctx::INTRA_CHROMA_PRED_MODE,
        rows: [&[63], &[152], &[152]],
    },
    InitBlock {
        offset: ctx::RQT_ROOT_CBF,
        rows: [&[154], &[79], &[79]],
    },
    InitBlock {
        offset: ctx::MERGE_FLAG,
        rows: [&[154], &[110], &[154]],
    },
    InitBlock {
        offset: ctx::MERGE_IDX,
        rows: [&[154], &[122], &[137]],
    },
    InitBlock {
        offset: ctx::INTER_PRED_IDC,
        rows: [
            &[154, 154, 154, 154, 154],
            &[95, 79, 63, 31, 31],
            &[95, 79, 63, 31, 31],
        ],
    },
    InitBlock {
        offset: ctx::REF_IDX,
        rows: [&[154, 154], &[153, 153], &[153, 153]],
    },
    InitBlock {
        offset: ctx::MVP_FLAG,
        rows: [&[154], &[168], &[168]],
    },
    InitBlock {
        offset: ctx::ABS_MVD_GREATER0,
        rows: [&[154], &[140], &[169]],
    },
    InitBlock {
        offset: ctx::ABS_MVD_GREATER1,
        rows: [&[154], &[198], &[198]],
    },
    InitBlock {
        offset: ctx::SPLIT_TRANSFORM_FLAG,
        rows: [&[153, 138, 138], &[124, 138, 94], &[224, 167, 122]],
    },
    InitBlock {
        offset: ctx::CBF_LUMA,
        rows: [&[111, 141], &[153, 111], &[153, 111]],
    },
    InitBlock {
        offset: ctx::CBF_CHROMA,
        rows: [
            &[94, 138, 182, 154],
            &[149, 107, 167, 154],
            &[149, 92, 167, 154],
        ],
    },
    InitBlock {
        offset: ctx::CU_QP_DELTA_ABS,
        rows: [&[154, 154], &[154, 154], &[154, 154]],
    },
    InitBlock {
        offset: ctx::TRANSFORM_SKIP,
        rows: [&[139, 139], &[139, 139], &[139, 139]],
    },
    InitBlock {
        offset: ctx::LAST_SIG_X_PREFIX,
        rows: [
            &[
                110, 110, 124, 125, 140, 153, 125, 127, 140, 109, 111, 143, 127, 111, 79, 108,
                123, 63,
            ],
            &[
                125, 110, 94, 110, 95, 79, 125, 111, 110, 78, 110, 111, 111, 95, 94, 108, 123,
                108,
            ],
            &[
                125, 110, 124, 110, 95, 94, 125, 111, 111, 79, 125, 126, 111, 111, 79, 108, 123,
                93,
            ],
        ],
    },
    InitBlock {
        offset: ctx::LAST_SIG_Y_PREFIX,
        rows: [
            &[
                110, 110, 124, 125, 140, 153, 125, 127, 140, 109, 111, 143, 127, 111, 79, 108,
                123, 63,
            ],
            &[
                125, 110, 94, 110, 95, 79, 125, 111, 110, 78, 110, 111, 111, 95, 94, 108, 123,
                108,
            ],
            &[
                125, 110, 124, 110, 95, 94, 125, 111, 111, 79, 125, 126, 111, 111, 79, 108, 123,
                93,
            ],
        ],
    },
    InitBlock {
        offset: ctx::CODED_SUB_BLOCK,
        rows: [
            &[91, 171, 134, 141],
            &[121, 140, 61, 154],
            &[121, 140, 61, 154],
        ],
    },
    InitBlock {
        offset: ctx::SIG_COEFF_FLAG,
        rows: [
            &[
                111, 111, 125, 110, 110, 94, 124, 108, 124, 107, 125, 141, 179, 153, 125, 107,
                125, 141, 179, 153, 125, 107, 125, 141, 179, 153, 125, 140, 139, 182, 182, 152,
                136, 152, 136, 153, 136, 139, 111, 136, 139, 111, 141, 111,
            ],
            &[
                155, 154, 139, 153, 139, 123, 123, 63, 153, 166, 183, 140, 136, 153, 154, 166,
                183, 140, 136, 153, 154, 166, 183, 140, 136, 153, 154, 170, 153, 123, 123, 107,
                121, 107, 121, 167, 151, 183, 140, 151, 183, 140, 140, 140,
            ],
            &[
                170, 154, 139, 153, 139, 123, 123, 63, 124, 166, 183, 140, 136, 153, 154, 166,
                183, 140, 136, 153, 154, 166, 183, 140, 136, 153, 154, 170, 153, 138, 138, 122,
                121, 122, 121, 167, 151, 183, 140, 151, 183, 140, 140, 140,
            ],
        ],
    },
    InitBlock {
        offset: ctx::COEFF_ABS_GREATER1,
        rows: [
            &[
                140, 92, 137, 138, 140, 152, 138, 139, 153, 74, 149, 92, 139, 107, 122, 152,
                140, 179, 166, 182, 140, 227, 122, 197,
            ],
            &[
                154, 196, 196, 167, 154, 152, 167, 182, 182, 134, 149, 136, 153, 121, 136, 137,
                169, 194, 166, 167, 154, 167, 137, 182,
            ],
            &[
                154, 196, 167, 167, 154, 152, 167, 182, 182, 134, 149, 136, 153, 121, 136, 122,
                169, 208, 166, 167, 154, 152, 167, 182,
            ],
        ],
    },
    InitBlock {
        offset: ctx::COEFF_ABS_GREATER2,
        rows: [
            &[138, 153, 136, 167, 152, 152],
            &[107, 167, 91, 122, 107, 167],
            &[107, 167, 91, 107, 107, 167],
        ],
    },
];

/// The full set of context models for one entropy coding stream.
#[derive(Debug, Clone)]
pub struct ContextTable {
    models: Vec<ContextModel>,
}

impl ContextTable {
    /// Initialize all models for the given slice type, init flag, and QP.
    pub fn new(slice_type: SliceType, cabac_init_flag: bool, qp: i32) -> Self {
        let init_type = match slice_type {
            SliceType::I => 0,
            SliceType::P => {
                if cabac_init_flag {
                    2
                } else {
                    1
                }
            }
            SliceType::B => {
                if cabac_init_flag {
                    1
                } else {
                    2
                }
            }
        };

        let mut models = vec![ContextModel::init(154, qp); ctx::COUNT];
        for block in INIT_BLOCKS {
            for (i, &v) in block.rows[init_type].iter().enumerate() {
                models[block.offset + i] = ContextModel::init(v, qp);
            }
        }

        Self { models }
    }

    /// Borrow a model.
    pub fn model(&mut self, idx: usize) -> &mut ContextModel {
        &mut self.models[idx]
    }
}

/// CABAC arithmetic decoder over one slice-data substream.
///
/// Reads past the end of the data return zero bits; the `overrun` flag
/// records that the stream was exhausted so the caller can conceal a
/// premature end of slice instead of aborting.
#[derive(Debug, Clone)]
pub struct CabacDecoder<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
    range: u32,
    offset: u32,
    overrun: bool,
}

impl<'a> CabacDecoder<'a> {
    /// Create and initialize a decoder at the start of `data` (9.3.2.5).
    pub fn new(data: &'a [u8]) -> Self {
        let mut d = Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
            range: 510,
            offset: 0,
            overrun: false,
        };
        for _ in 0..9 {
            d.offset = (d.offset << 1) | d.read_bit() as u32;
        }
        d
    }

    fn read_bit(&mut self) -> bool {
        if self.byte_pos >= self.data.len() {
            self.overrun = true;
            return false;
        }
        let bit = (self.data[self.byte_pos] >> (7 - self.bit_pos)) & 1;
        self.bit_pos += 1;
        if self.bit_pos == 8 {
            self.bit_pos = 0;
            self.byte_pos += 1;
        }
        bit != 0
    }

    /// Whether the decoder consumed bits past the end of the substream.
    pub fn overrun(&self) -> bool {
        self.overrun
    }

    /// Number of whole bytes consumed so far.
    pub fn bytes_consumed(&self) -> usize {
        self.byte_pos + if self.bit_pos != 0 { 1 } else { 0 }
    }

    /// Decode one regular bin with the given context model.
    pub fn decode_bin(&mut self, model: &mut ContextModel) -> bool {
        let state = model.state as usize;
        let q = ((self.range >> 6) & 3) as usize;
        let lps_range = RANGE_TAB_LPS[state][q] as u32;

        self.range -= lps_range;

        let bin = if self.offset >= self.range {
            // LPS path
            self.offset -= self.range;
            self.range = lps_range;
            let bin = !model.mps;
            if model.state == 0 {
                model.mps = !model.mps;
            }
            model.state = NEXT_STATE_LPS[state];
            bin
        } else {
            // MPS path
            model.state = NEXT_STATE_MPS[state];
            model.mps
        };

        while self.range < 256 {
            self.range <<= 1;
            self.offset = (self.offset << 1) | self.read_bit() as u32;
        }

        bin
    }

    /// Decode one bypass (equiprobable) bin.
    pub fn decode_bypass(&mut self) -> bool {
        self.offset = (self.offset << 1) | self.read_bit() as u32;
        if self.offset >= self.range {
            self.offset -= self.range;
            true
        } else {
            false
        }
    }

    /// Decode `count` bypass bins as an unsigned value.
    pub fn decode_bypass_bins(&mut self, count: u8) -> u32 {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | (self.decode_bypass() as u32);
        }
        value
    }

    /// Decode the end_of_slice_segment / end_of_sub_stream terminator bin.
    pub fn decode_terminate(&mut self) -> bool {
        self.range -= 2;
        if self.offset >= self.range {
            true
        } else {
            while self.range < 256 {
                self.range <<= 1;
                self.offset = (self.offset << 1) | self.read_bit() as u32;
            }
            false
        }
    }

    /// Truncated-unary bypass binarization up to `max`.
    pub fn decode_bypass_truncated_unary(&mut self, max: u32) -> u32 {
        let mut v = 0;
        while v < max && self.decode_bypass() {
            v += 1;
        }
        v
    }

    /// k-th order Exp-Golomb bypass binarization (unary-of-ones prefix).
    pub fn decode_bypass_eg(&mut self, k: u32) -> u32 {
        let mut n = 0u32;
        while self.decode_bypass() {
            n += 1;
            if n > 31 {
                self.overrun = true;
                return 0;
            }
        }
        (((1u32 << n) - 1) << k) + self.decode_bypass_bins((n + k) as u8)
    }

    /// coeff_abs_level_remaining binarization: truncated Rice prefix with
    /// Exp-Golomb escape (9.3.3.13).
    pub fn decode_coeff_abs_level_remaining(&mut self, rice_param: u32) -> u32 {
        // Prefix: unary, capped.
        let mut prefix = 0u32;
        while prefix < 20 && self.decode_bypass() {
            prefix += 1;
        }

        if prefix <= 3 {
            // Rice coding
            (prefix << rice_param) + self.decode_bypass_bins(rice_param as u8)
        } else {
            // Exp-Golomb escape with order riceParam + prefix - 3
            let order = prefix - 3 + rice_param;
            let suffix = self.decode_bypass_bins(order as u8);
            (((1 << (prefix - 3)) + 3 - 1) << rice_param) + suffix
        }
    }
}
