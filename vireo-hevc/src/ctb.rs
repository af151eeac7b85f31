//! CTB decoding: coding quadtree, prediction units, transform trees,
//! residual coding, and per-CTB reconstruction.
//!
//! A [`SliceDecoder`] walks the CTBs of one slice segment in decode order,
//! driving CABAC syntax decoding and reconstructing samples as coding
//! units complete. Per-CTB progress cells advance as reconstruction
//! finishes; deblocking and SAO run afterwards over whole CTB rows (see
//! [`filter_ctb_row`]).

use crate::accel::KernelTable;
use crate::cabac::{ctx, CabacDecoder, ContextTable};
use crate::deblock;
use crate::error::{DecodeError, DecodeWarning, Result};
use crate::inter::{self, SpatialNeighbors};
use crate::intra;
use crate::param::{Pps, Sps};
use crate::picture::{
    CtbProgress, MotionVector, MvInfo, Picture, PictureMeta,
};
use crate::sao::{SaoComponent, SaoCtbParams, SaoMode};
use crate::slice::{SliceSegmentHeader, SliceType, SliceUnit};
use crate::tables::{ScanPattern, SCAN_TABLES, SIG_CTX_MAP_4X4};
use crate::transform;
use std::sync::Arc;
use tracing::trace;
use vireo_core::image::{ChromaFormat, ImageBuffer, PlaneBuffer};

/// Resolved reference picture lists for one slice.
#[derive(Default, Clone)]
pub struct RefLists {
    /// List 0.
    pub l0: Vec<Arc<Picture>>,
    /// List 1.
    pub l1: Vec<Arc<Picture>>,
}

impl RefLists {
    fn get(&self, list: usize, idx: usize) -> Option<&Arc<Picture>> {
        if list == 0 {
            self.l0.get(idx)
        } else {
            self.l1.get(idx)
        }
    }
}

/// Entropy decoding state of one substream.
struct Entropy<'d> {
    cabac: CabacDecoder<'d>,
    ctx: ContextTable,
}

/// Context tables captured after the second CTB of each wavefront row,
/// shared between the row tasks of one slice.
pub type WppContexts = Arc<parking_lot::Mutex<Vec<Option<ContextTable>>>>;

/// Decodes the CTBs of one slice segment into the target picture.
pub struct SliceDecoder {
    sps: Arc<Sps>,
    pps: Arc<Pps>,
    pic: Arc<Picture>,
    refs: RefLists,
    kernels: &'static KernelTable,
    slice: SliceUnit,
    /// Warnings raised during decoding, drained by the caller.
    pub warnings: Vec<DecodeWarning>,
    /// Current luma QP (updated by cu_qp_delta).
    qp_y: i32,
    /// cu_qp_delta already consumed in the current quantization group.
    qp_delta_taken: bool,
    /// Whether the previously decoded coefficient sub-block had a
    /// greater1 flag set (selects the context set).
    greater1_tail: bool,
    /// Shared per-row context tables for wavefront row tasks.
    wpp_contexts: Option<WppContexts>,
}

impl SliceDecoder {
    /// Create a decoder for one slice segment.
    pub fn new(
        sps: Arc<Sps>,
        pps: Arc<Pps>,
        pic: Arc<Picture>,
        refs: RefLists,
        kernels: &'static KernelTable,
        slice: SliceUnit,
    ) -> Self {
        let qp_y = slice.header.slice_qp(&pps);
        Self {
            sps,
            pps,
            pic,
            refs,
            kernels,
            slice,
            warnings: Vec::new(),
            qp_y,
            qp_delta_taken: false,
            greater1_tail: false,
            wpp_contexts: None,
        }
    }

    /// Attach the shared wavefront context store (row tasks only).
    pub fn with_wpp_contexts(mut self, contexts: WppContexts) -> Self {
        self.wpp_contexts = Some(contexts);
        self
    }

    /// Decode every CTB of the slice segment.
    ///
    /// `wpp_row` restricts decoding to one CTB row when wavefront tasks
    /// split the slice; `None` decodes the full segment inline.
    pub fn run(&mut self, wpp_row: Option<u32>) -> Result<()> {
        let header = self.slice.header.clone();
        let data = self.slice.data().to_vec();

        if self.pps.entropy_coding_sync_enabled_flag && !header.entry_point_offsets.is_empty() {
            self.run_wavefront(&header, &data, wpp_row)
        } else {
            let mut ent = Entropy {
                cabac: CabacDecoder::new(&data),
                ctx: ContextTable::new(
                    header.slice_type,
                    header.cabac_init_flag,
                    header.slice_qp(&self.pps),
                ),
            };
            self.decode_ctb_range(&header, &mut ent, header.slice_segment_address, None)
                .map(|_| ())
        }
    }

    /// Wavefront decoding: one CABAC substream per CTB row, contexts
    /// inherited from the second CTB of the row above.
    fn run_wavefront(
        &mut self,
        header: &SliceSegmentHeader,
        data: &[u8],
        only_row: Option<u32>,
    ) -> Result<()> {
        let ctbs_w = self.sps.pic_width_in_ctbs();
        let first_row = header.slice_segment_address / ctbs_w;

        // Substream byte ranges from the entry point offsets.
        let mut ranges = Vec::with_capacity(header.entry_point_offsets.len() + 1);
        let mut start = 0usize;
        for &off in &header.entry_point_offsets {
            let end = start + off as usize;
            if end > data.len() {
                self.warnings.push(DecodeWarning::IncorrectEntryPointOffset);
                break;
            }
            ranges.push(start..end);
            start = end;
        }
        ranges.push(start..data.len());

        let mut inherited: Option<ContextTable> = None;
        for (i, range) in ranges.iter().enumerate() {
            let row = first_row + i as u32;
            if row >= self.sps.pic_height_in_ctbs() {
                break;
            }
            if let Some(only) = only_row {
                if row != only {
                    continue;
                }
            }

            let fresh = || {
                ContextTable::new(
                    header.slice_type,
                    header.cabac_init_flag,
                    header.slice_qp(&self.pps),
                )
            };
            let base_ctx = if row == first_row {
                fresh()
            } else if let Some(saved) = &inherited {
                saved.clone()
            } else if let Some(shared) = &self.wpp_contexts {
                // Parallel row task: the row above publishes its context
                // right after its second CTB, which the wavefront gate on
                // CTB (1, row-1) guarantees has happened.
                self.pic
                    .progress(1, row as i32 - 1)
                    .wait_for(CtbProgress::PredictionDone);
                let slot = (row - 1 - first_row) as usize;
                shared.lock().get(slot).and_then(|c| c.clone()).unwrap_or_else(fresh)
            } else {
                fresh()
            };

            let mut ent = Entropy {
                cabac: CabacDecoder::new(&data[range.clone()]),
                ctx: base_ctx,
            };

            let row_start = if row == first_row {
                header.slice_segment_address
            } else {
                row * ctbs_w
            };
            let saved = self.decode_ctb_range(header, &mut ent, row_start, Some(row))?;
            inherited = saved.or(inherited);
        }

        Ok(())
    }

    /// Decode CTBs from `start_addr` until the slice (or row) ends.
    ///
    /// Returns the context table captured after the second CTB of the row
    /// (for wavefront inheritance) when `row_limit` is set.
    fn decode_ctb_range(
        &mut self,
        header: &SliceSegmentHeader,
        ent: &mut Entropy,
        start_addr: u32,
        row_limit: Option<u32>,
    ) -> Result<Option<ContextTable>> {
        let ctbs_w = self.sps.pic_width_in_ctbs();
        let pic_size = self.sps.pic_size_in_ctbs();
        let first_row = header.slice_segment_address / ctbs_w;
        let mut saved_ctx = None;

        // Progress cells this task is responsible for: releasing them on
        // every exit path keeps dependent tasks from waiting forever.
        let range_end = match row_limit {
            Some(row) => ((row + 1) * ctbs_w).min(pic_size),
            None => pic_size,
        };

        let mut addr = start_addr;
        let result = loop {
            if addr >= pic_size {
                if row_limit.is_none() {
                    self.warnings.push(DecodeWarning::CtbOutsideImageArea);
                }
                break Ok(());
            }
            let cx = addr % ctbs_w;
            let cy = addr / ctbs_w;
            if let Some(row) = row_limit {
                if cy != row {
                    break Ok(());
                }
            }

            // Wavefront dependency: the CTB above-right must be decoded
            // before this CTB starts.
            if self.pps.entropy_coding_sync_enabled_flag && cy > 0 {
                self.pic
                    .progress(cx as i32 + 1, cy as i32 - 1)
                    .wait_for(CtbProgress::PredictionDone);
            }

            if let Err(e) = self.decode_ctb(header, ent, cx, cy) {
                break Err(e);
            }

            // Capture the context state after the second CTB of the row,
            // publishing it to parallel row tasks before the progress cell
            // below releases them.
            if row_limit.is_some() && cx == 1u32.min(ctbs_w - 1) {
                saved_ctx = Some(ent.ctx.clone());
                if let (Some(shared), Some(row)) = (&self.wpp_contexts, row_limit) {
                    let slot = (row - first_row) as usize;
                    let mut table = shared.lock();
                    if slot < table.len() {
                        table[slot] = saved_ctx.clone();
                    }
                }
            }

            self.pic
                .progress(cx as i32, cy as i32)
                .advance(CtbProgress::PredictionDone);

            if ent.cabac.overrun() {
                self.warnings.push(DecodeWarning::PrematureEndOfSliceSegment);
                break Ok(());
            }

            let end_of_slice = ent.cabac.decode_terminate();
            addr += 1;
            if end_of_slice {
                break Ok(());
            }
            if row_limit.is_some() && addr % ctbs_w == 0 {
                break Ok(());
            }
        };

        // Release the progress cells of any CTB this task did not reach.
        for rest in addr..range_end {
            self.pic
                .progress_at(rest)
                .advance(CtbProgress::PredictionDone);
        }

        result.map(|()| saved_ctx)
    }

    /// Decode one CTB: SAO parameters, then the coding quadtree.
    fn decode_ctb(
        &mut self,
        header: &SliceSegmentHeader,
        ent: &mut Entropy,
        cx: u32,
        cy: u32,
    ) -> Result<()> {
        let ctb_size = self.sps.ctb_size();
        let x0 = cx * ctb_size;
        let y0 = cy * ctb_size;
        let addr = cy * self.sps.pic_width_in_ctbs() + cx;
        trace!(cx, cy, "decode CTB");

        {
            let pic = self.pic.clone();
            let mut planes = pic.planes_mut();
            let mut meta = pic.meta_mut();
            meta.ctb_slice_addr[addr as usize] = header.slice_segment_address as i32;

            if self.sps.sample_adaptive_offset_enabled_flag
                && (header.slice_sao_luma_flag || header.slice_sao_chroma_flag)
            {
                let params = self.decode_sao_params(header, ent, cx, cy, &meta);
                meta.ctb_sao[addr as usize] = params;
            }

            self.qp_delta_taken = false;
            self.decode_quadtree(
                header,
                ent,
                &mut planes,
                &mut meta,
                x0,
                y0,
                self.sps.log2_ctb_size,
                0,
            )?;
        }

        // The caller advances the progress cell once the row context has
        // been published.
        Ok(())
    }

    /// Parse SAO parameters for one CTB (7.3.8.3).
    fn decode_sao_params(
        &mut self,
        header: &SliceSegmentHeader,
        ent: &mut Entropy,
        cx: u32,
        cy: u32,
        meta: &PictureMeta,
    ) -> SaoCtbParams {
        let ctbs_w = self.sps.pic_width_in_ctbs();
        let addr = (cy * ctbs_w + cx) as usize;

        // Merge with the left or above CTB when allowed.
        if cx > 0 && meta.ctb_slice_addr[addr - 1] == header.slice_segment_address as i32 {
            let merge_left = ent.cabac.decode_bin(ent.ctx.model(ctx::SAO_MERGE_FLAG));
            if merge_left {
                return meta.ctb_sao[addr - 1];
            }
        }
        if cy > 0
            && meta.ctb_slice_addr[addr - ctbs_w as usize]
                == header.slice_segment_address as i32
        {
            let merge_up = ent.cabac.decode_bin(ent.ctx.model(ctx::SAO_MERGE_FLAG));
            if merge_up {
                return meta.ctb_sao[addr - ctbs_w as usize];
            }
        }

        let mut params = SaoCtbParams::default();
        let comps = if self.sps.chroma_format == ChromaFormat::Monochrome {
            1
        } else {
            3
        };

        for c in 0..comps {
            let enabled = if c == 0 {
                header.slice_sao_luma_flag
            } else {
                header.slice_sao_chroma_flag
            };
            if !enabled {
                continue;
            }

            // Cr shares the type decision with Cb.
            let type_idx = if c == 2 {
                match params.comp[1].mode {
                    SaoMode::Off => 0,
                    SaoMode::Band { .. } => 1,
                    SaoMode::Edge { .. } => 2,
                }
            } else {
                // sao_type_idx: TR binarization, first bin context coded.
                if !ent.cabac.decode_bin(ent.ctx.model(ctx::SAO_TYPE_IDX)) {
                    0
                } else if !ent.cabac.decode_bypass() {
                    1
                } else {
                    2
                }
            };

            if type_idx == 0 {
                continue;
            }

            let mut offsets = [0i32; 4];
            for off in offsets.iter_mut() {
                // sao_offset_abs: truncated unary bypass, cMax for 8-bit is 7.
                *off = ent.cabac.decode_bypass_truncated_unary(7) as i32;
            }

            if type_idx == 1 {
                // Band offset: explicit signs plus the band position.
                for off in offsets.iter_mut() {
                    if *off != 0 && ent.cabac.decode_bypass() {
                        *off = -*off;
                    }
                }
                let position = ent.cabac.decode_bypass_bins(5) as u8;
                params.comp[c] = SaoComponent {
                    mode: SaoMode::Band { position },
                    offsets: [
                        offsets[0] as i8,
                        offsets[1] as i8,
                        offsets[2] as i8,
                        offsets[3] as i8,
                    ],
                };
            } else {
                // Edge offset: class coded for luma and Cb; signs implied.
                let class = if c == 2 {
                    match params.comp[1].mode {
                        SaoMode::Edge { class } => class,
                        _ => 0,
                    }
                } else {
                    ent.cabac.decode_bypass_bins(2) as u8
                };
                params.comp[c] = SaoComponent {
                    mode: SaoMode::Edge { class },
                    offsets: [
                        offsets[0] as i8,
                        offsets[1] as i8,
                        -(offsets[2] as i8),
                        -(offsets[3] as i8),
                    ],
                };
            }
        }

        params
    }

    /// Whether the sample position `(xn, yn)` is available to a block whose
    /// top-left corner is `(xc, yc)` (z-scan rule, 6.4.1).
    fn available(&self, meta: &PictureMeta, xc: u32, yc: u32, xn: i32, yn: i32) -> bool {
        available_at(&self.sps, &self.pps, meta, xc, yc, xn, yn)
    }

    /// Coding quadtree recursion (7.3.8.4).
    #[allow(clippy::too_many_arguments)]
    fn decode_quadtree(
        &mut self,
        header: &SliceSegmentHeader,
        ent: &mut Entropy,
        planes: &mut ImageBuffer,
        meta: &mut PictureMeta,
        x0: u32,
        y0: u32,
        log2_size: u8,
        depth: u8,
    ) -> Result<()> {
        let size = 1u32 << log2_size;
        let pic_w = self.sps.pic_width_in_luma_samples;
        let pic_h = self.sps.pic_height_in_luma_samples;

        let inside = x0 + size <= pic_w && y0 + size <= pic_h;
        let can_split = log2_size > self.sps.log2_min_cb_size;

        let split = if !inside {
            // Implicit split at the picture border.
            if !can_split {
                return Err(DecodeError::CtbOutsideImageArea);
            }
            true
        } else if can_split {
            // Context from the depths of the left and above neighbours.
            let mut ctx_idx = 0;
            if self.available(meta, x0, y0, x0 as i32 - 1, y0 as i32)
                && self.ct_depth_at(meta, x0 as i32 - 1, y0 as i32) > depth
            {
                ctx_idx += 1;
            }
            if self.available(meta, x0, y0, x0 as i32, y0 as i32 - 1)
                && self.ct_depth_at(meta, x0 as i32, y0 as i32 - 1) > depth
            {
                ctx_idx += 1;
            }
            ent.cabac
                .decode_bin(ent.ctx.model(ctx::SPLIT_CU_FLAG + ctx_idx))
        } else {
            false
        };

        if self.pps.cu_qp_delta_enabled_flag
            && depth <= self.pps.diff_cu_qp_delta_depth
        {
            self.qp_delta_taken = false;
        }

        if split {
            let half = size >> 1;
            for i in 0..4u32 {
                let sx = x0 + (i & 1) * half;
                let sy = y0 + (i >> 1) * half;
                if sx < pic_w && sy < pic_h {
                    self.decode_quadtree(
                        header,
                        ent,
                        planes,
                        meta,
                        sx,
                        sy,
                        log2_size - 1,
                        depth + 1,
                    )?;
                }
            }
            Ok(())
        } else {
            self.decode_cu(header, ent, planes, meta, x0, y0, log2_size, depth)
        }
    }

    fn mark_4x4<T: Copy>(&self, grid: &mut [T], x0: u32, y0: u32, size: u32, value: T) {
        let w4 = self.sps.pic_width_in_luma_samples.div_ceil(4) as usize;
        let h4 = self.sps.pic_height_in_luma_samples.div_ceil(4) as usize;
        for y in (y0 / 4)..((y0 + size).div_ceil(4)).min(h4 as u32) {
            for x in (x0 / 4)..((x0 + size).div_ceil(4)).min(w4 as u32) {
                grid[y as usize * w4 + x as usize] = value;
            }
        }
    }

    fn grid4(&self, x: i32, y: i32) -> usize {
        grid4_at(&self.sps, x, y)
    }

    fn ct_depth_at(&self, meta: &PictureMeta, x: i32, y: i32) -> u8 {
        meta.ct_depth[self.grid4(x, y)]
    }

    /// Coding unit syntax and reconstruction (7.3.8.5).
    #[allow(clippy::too_many_arguments)]
    fn decode_cu(
        &mut self,
        header: &SliceSegmentHeader,
        ent: &mut Entropy,
        planes: &mut ImageBuffer,
        meta: &mut PictureMeta,
        x0: u32,
        y0: u32,
        log2_size: u8,
        depth: u8,
    ) -> Result<()> {
        let size = 1u32 << log2_size;
        self.mark_4x4(&mut meta.ct_depth, x0, y0, size, depth);

        let mut transquant_bypass = false;
        if self.pps.transquant_bypass_enabled_flag {
            transquant_bypass = ent.cabac.decode_bin(ent.ctx.model(ctx::CU_TRANSQUANT_BYPASS));
        }

        // cu_skip_flag with neighbour-dependent context.
        let mut skip = false;
        if header.slice_type != SliceType::I {
            let mut c = 0;
            if self.available(meta, x0, y0, x0 as i32 - 1, y0 as i32)
                && meta.skip[self.grid4(x0 as i32 - 1, y0 as i32)]
            {
                c += 1;
            }
            if self.available(meta, x0, y0, x0 as i32, y0 as i32 - 1)
                && meta.skip[self.grid4(x0 as i32, y0 as i32 - 1)]
            {
                c += 1;
            }
            skip = ent.cabac.decode_bin(ent.ctx.model(ctx::CU_SKIP_FLAG + c));
        }
        self.mark_4x4(&mut meta.skip, x0, y0, size, skip);
        self.mark_4x4(&mut meta.qp_y, x0, y0, size, self.qp_y as i8);

        if skip {
            let merge_idx = self.decode_merge_idx(ent, header.max_num_merge_cand);
            self.inter_pu(
                header,
                planes,
                meta,
                x0,
                y0,
                size,
                size,
                PuMotion::Merge(merge_idx),
            )?;
            self.mark_pu_edges(meta, x0, y0, size, size);
            return Ok(());
        }

        let is_intra = if header.slice_type == SliceType::I {
            true
        } else {
            ent.cabac.decode_bin(ent.ctx.model(ctx::PRED_MODE_FLAG))
        };

        let part_mode = self.decode_part_mode(ent, is_intra, log2_size);

        let mut merge_2nx2n = false;
        let intra_luma_modes;
        let intra_chroma_mode;

        if is_intra {
            let (luma, chroma) = self.decode_intra_modes(header, ent, meta, x0, y0, size, part_mode)?;
            intra_luma_modes = luma;
            intra_chroma_mode = chroma;
        } else {
            intra_luma_modes = [0; 4];
            intra_chroma_mode = 0;
            for (i, (px, py, pw, ph)) in pu_geometry(part_mode, x0, y0, size).iter().enumerate() {
                let motion = self.decode_pu_motion(header, ent, meta, *px, *py, *pw, *ph, i)?;
                if i == 0 && part_mode == PartMode::Part2Nx2N {
                    merge_2nx2n = matches!(motion, PuMotion::Merge(_));
                }
                self.inter_pu(header, planes, meta, *px, *py, *pw, *ph, motion)?;
                self.mark_pu_edges(meta, *px, *py, *pw, *ph);
            }
        }

        // Residual. rqt_root_cbf is not coded for merged 2Nx2N (a skip CU
        // would have been coded instead, so residual is implied).
        let has_residual = if is_intra || merge_2nx2n {
            true
        } else {
            ent.cabac.decode_bin(ent.ctx.model(ctx::RQT_ROOT_CBF))
        };

        if has_residual {
            let max_depth = if is_intra {
                self.sps.max_transform_hierarchy_depth_intra
                    + (part_mode == PartMode::PartNxN) as u8
            } else {
                self.sps.max_transform_hierarchy_depth_inter
            };
            let tu = TuContext {
                is_intra,
                transquant_bypass,
                intra_luma_modes,
                intra_chroma_mode,
                cu_x0: x0,
                cu_y0: y0,
                cu_log2_size: log2_size,
                part_mode,
                max_depth,
            };
            self.decode_transform_tree(
                header, ent, planes, meta, &tu, x0, y0, log2_size, 0, true, true, 0,
            )?;
        }

        self.mark_pu_edges(meta, x0, y0, size, size);
        Ok(())
    }

    /// part_mode (9.3.3.7); intra supports 2Nx2N/NxN, inter additionally
    /// the rectangular and asymmetric modes.
    fn decode_part_mode(&mut self, ent: &mut Entropy, is_intra: bool, log2_size: u8) -> PartMode {
        let at_min = log2_size == self.sps.log2_min_cb_size;

        if is_intra {
            if at_min && !ent.cabac.decode_bin(ent.ctx.model(ctx::PART_MODE)) {
                PartMode::PartNxN
            } else {
                PartMode::Part2Nx2N
            }
        } else {
            if ent.cabac.decode_bin(ent.ctx.model(ctx::PART_MODE)) {
                return PartMode::Part2Nx2N;
            }
            let horizontal = ent.cabac.decode_bin(ent.ctx.model(ctx::PART_MODE + 1));
            if at_min {
                if horizontal {
                    return PartMode::Part2NxN;
                }
                if log2_size == 3 {
                    return PartMode::PartNx2N;
                }
                // 8x8 CUs cannot use NxN inter; larger minimum sizes can.
                if ent.cabac.decode_bin(ent.ctx.model(ctx::PART_MODE + 2)) {
                    return PartMode::PartNx2N;
                }
                return PartMode::PartNxN;
            }
            if !self.sps.amp_enabled_flag {
                return if horizontal {
                    PartMode::Part2NxN
                } else {
                    PartMode::PartNx2N
                };
            }
            // AMP: a third context-coded bin distinguishes the symmetric
            // mode, a bypass bin picks the asymmetric variant.
            let symmetric = ent.cabac.decode_bin(ent.ctx.model(ctx::PART_MODE + 3));
            if symmetric {
                if horizontal {
                    PartMode::Part2NxN
                } else {
                    PartMode::PartNx2N
                }
            } else {
                let second = ent.cabac.decode_bypass();
                match (horizontal, second) {
                    (true, false) => PartMode::Part2NxnU,
                    (true, true) => PartMode::Part2NxnD,
                    (false, false) => PartMode::PartnLx2N,
                    (false, true) => PartMode::PartnRx2N,
                }
            }
        }
    }

    /// Intra mode syntax for all PUs of one CU (7.3.8.5).
    fn decode_intra_modes(
        &mut self,
        _header: &SliceSegmentHeader,
        ent: &mut Entropy,
        meta: &mut PictureMeta,
        x0: u32,
        y0: u32,
        size: u32,
        part_mode: PartMode,
    ) -> Result<([u8; 4], u8)> {
        let num_pu = if part_mode == PartMode::PartNxN { 2u32 } else { 1 };
        let pu_size = size / num_pu;

        let mut prev_flags = [false; 4];
        let n = (num_pu * num_pu) as usize;
        for flag in prev_flags.iter_mut().take(n) {
            *flag = ent
                .cabac
                .decode_bin(ent.ctx.model(ctx::PREV_INTRA_LUMA_PRED));
        }

        let mut modes = [0u8; 4];
        for i in 0..n {
            let px = x0 + (i as u32 & 1) * pu_size;
            let py = y0 + (i as u32 >> 1) * pu_size;

            let left = self
                .available(meta, px, py, px as i32 - 1, py as i32)
                .then(|| meta.intra_mode[self.grid4(px as i32 - 1, py as i32)])
                .filter(|&m| m != 255);
            // Above neighbours outside the current CTB row are not kept.
            let above_in_ctb = py % self.sps.ctb_size() != 0;
            let above = (above_in_ctb
                && self.available(meta, px, py, px as i32, py as i32 - 1))
            .then(|| meta.intra_mode[self.grid4(px as i32, py as i32 - 1)])
            .filter(|&m| m != 255);

            let mut mpm = intra::derive_mpm(left, above);

            let mode = if prev_flags[i] {
                // mpm_idx: up to two bypass bins.
                let idx = if !ent.cabac.decode_bypass() {
                    0
                } else if !ent.cabac.decode_bypass() {
                    1
                } else {
                    2
                };
                mpm[idx]
            } else {
                let mut rem = ent.cabac.decode_bypass_bins(5) as u8;
                mpm.sort_unstable();
                for &cand in &mpm {
                    if rem >= cand {
                        rem += 1;
                    }
                }
                rem
            };

            modes[i] = mode;
            self.mark_4x4(&mut meta.intra_mode, px, py, pu_size, mode);
            self.mark_intra_4x4(meta, px, py, pu_size);
        }

        // intra_chroma_pred_mode (shared per CU).
        let chroma = if self.sps.chroma_format == ChromaFormat::Monochrome {
            0
        } else if !ent
            .cabac
            .decode_bin(ent.ctx.model(ctx::INTRA_CHROMA_PRED_MODE))
        {
            // Derived mode: same as the first luma PU.
            modes[0]
        } else {
            let idx = ent.cabac.decode_bypass_bins(2) as usize;
            let cand = [intra::MODE_PLANAR, intra::MODE_VERTICAL, intra::MODE_HORIZONTAL, intra::MODE_DC][idx];
            if cand == modes[0] {
                34
            } else {
                cand
            }
        };

        Ok((modes, chroma))
    }

    fn mark_intra_4x4(&self, meta: &mut PictureMeta, x0: u32, y0: u32, size: u32) {
        let info = MvInfo {
            intra: true,
            ..Default::default()
        };
        self.mark_4x4(&mut meta.mv, x0, y0, size, info);
    }

    /// merge_idx binarization (first bin context coded, rest bypass).
    fn decode_merge_idx(&mut self, ent: &mut Entropy, max_cand: u8) -> u8 {
        if max_cand <= 1 {
            return 0;
        }
        if !ent.cabac.decode_bin(ent.ctx.model(ctx::MERGE_IDX)) {
            return 0;
        }
        let mut idx = 1;
        while idx < max_cand - 1 && ent.cabac.decode_bypass() {
            idx += 1;
        }
        idx
    }

    /// Motion syntax of one PU: merge, or AMVP with explicit mvd/ref.
    #[allow(clippy::too_many_arguments)]
    fn decode_pu_motion(
        &mut self,
        header: &SliceSegmentHeader,
        ent: &mut Entropy,
        _meta: &mut PictureMeta,
        _px: u32,
        _py: u32,
        pw: u32,
        ph: u32,
        _pu_idx: usize,
    ) -> Result<PuMotion> {
        let merge = ent.cabac.decode_bin(ent.ctx.model(ctx::MERGE_FLAG));
        if merge {
            return Ok(PuMotion::Merge(
                self.decode_merge_idx(ent, header.max_num_merge_cand),
            ));
        }

        // inter_pred_idc (9.3.3.8).
        let pred_idc = if header.slice_type == SliceType::B {
            if pw + ph != 12 {
                let depth_ctx = (self.sps.log2_ctb_size
                    - (pw.max(ph) as u32).trailing_zeros() as u8)
                    .min(3) as usize;
                if ent
                    .cabac
                    .decode_bin(ent.ctx.model(ctx::INTER_PRED_IDC + depth_ctx))
                {
                    2 // bi
                } else if ent.cabac.decode_bin(ent.ctx.model(ctx::INTER_PRED_IDC + 4)) {
                    1 // list 1
                } else {
                    0 // list 0
                }
            } else if ent.cabac.decode_bin(ent.ctx.model(ctx::INTER_PRED_IDC + 4)) {
                1
            } else {
                0
            }
        } else {
            0
        };

        let mut parts = [None, None];
        for (list, part) in parts.iter_mut().enumerate() {
            let used = match pred_idc {
                0 => list == 0,
                1 => list == 1,
                _ => true,
            };
            if !used {
                continue;
            }

            let active = if list == 0 {
                header.num_ref_idx_l0_active_minus1
            } else {
                header.num_ref_idx_l1_active_minus1
            };
            let ref_idx = self.decode_ref_idx(ent, active);

            let mvd = if list == 1 && header.mvd_l1_zero_flag && pred_idc == 2 {
                MotionVector::ZERO
            } else {
                self.decode_mvd(ent)
            };
            let mvp_flag = ent.cabac.decode_bin(ent.ctx.model(ctx::MVP_FLAG));

            *part = Some(AmvpPart {
                ref_idx,
                mvd,
                mvp_idx: mvp_flag as usize,
            });
        }

        Ok(PuMotion::Amvp(parts))
    }

    /// ref_idx truncated-unary binarization.
    fn decode_ref_idx(&mut self, ent: &mut Entropy, active_minus1: u8) -> u8 {
        if active_minus1 == 0 {
            return 0;
        }
        if !ent.cabac.decode_bin(ent.ctx.model(ctx::REF_IDX)) {
            return 0;
        }
        if active_minus1 == 1 {
            return 1;
        }
        if !ent.cabac.decode_bin(ent.ctx.model(ctx::REF_IDX + 1)) {
            return 1;
        }
        let mut idx = 2;
        while idx < active_minus1 && ent.cabac.decode_bypass() {
            idx += 1;
        }
        idx
    }

    /// Motion vector difference (7.3.8.9).
    fn decode_mvd(&mut self, ent: &mut Entropy) -> MotionVector {
        let gt0_x = ent.cabac.decode_bin(ent.ctx.model(ctx::ABS_MVD_GREATER0));
        let gt0_y = ent.cabac.decode_bin(ent.ctx.model(ctx::ABS_MVD_GREATER0));
        let gt1_x = gt0_x && ent.cabac.decode_bin(ent.ctx.model(ctx::ABS_MVD_GREATER1));
        let gt1_y = gt0_y && ent.cabac.decode_bin(ent.ctx.model(ctx::ABS_MVD_GREATER1));

        let mut decode_component = |gt0: bool, gt1: bool| -> i32 {
            if !gt0 {
                return 0;
            }
            let abs = if gt1 {
                2 + ent.cabac.decode_bypass_eg(1) as i32
            } else {
                1
            };
            if ent.cabac.decode_bypass() {
                -abs
            } else {
                abs
            }
        };

        let x = decode_component(gt0_x, gt1_x);
        let y = decode_component(gt0_y, gt1_y);
        MotionVector::new(x.clamp(-32768, 32767) as i16, y.clamp(-32768, 32767) as i16)
    }

    /// Resolve motion for one PU and run motion compensation.
    #[allow(clippy::too_many_arguments)]
    fn inter_pu(
        &mut self,
        header: &SliceSegmentHeader,
        planes: &mut ImageBuffer,
        meta: &mut PictureMeta,
        px: u32,
        py: u32,
        pw: u32,
        ph: u32,
        motion: PuMotion,
    ) -> Result<()> {
        let neighbors = SpatialNeighbors::of_block(px as i32, py as i32, pw as i32, ph as i32);
        let mut local_warnings: Vec<DecodeWarning> = Vec::new();

        let info = {
            let sps = self.sps.clone();
            let pps = self.pps.clone();
            let meta_ref: &PictureMeta = meta;
            let fetch = move |x: i32, y: i32| -> Option<MvInfo> {
                if !available_at(&sps, &pps, meta_ref, px, py, x, y) {
                    return None;
                }
                let info = meta_ref.mv[grid4_at(&sps, x, y)];
                info.is_inter().then_some(info)
            };

            match motion {
                PuMotion::Merge(idx) => {
                    let default_poc = self
                        .refs
                        .l0
                        .first()
                        .map(|p| p.poc)
                        .unwrap_or(self.pic.poc);
                    let cands = inter::derive_merge_candidates(
                        neighbors,
                        header.max_num_merge_cand as usize,
                        default_poc,
                        &fetch,
                    );
                    cands[(idx as usize).min(cands.len() - 1)]
                }
                PuMotion::Amvp(parts) => {
                    let mut info = MvInfo::default();
                    for (list, part) in parts.iter().enumerate() {
                        let Some(part) = part else { continue };
                        let Some(ref_pic) = self.refs.get(list, part.ref_idx as usize) else {
                            local_warnings
                                .push(DecodeWarning::NonexistingReferencePictureAccessed);
                            continue;
                        };
                        let target_poc = ref_pic.poc;
                        let mvp = inter::derive_mvp_candidates(
                            neighbors,
                            list,
                            target_poc,
                            self.pic.poc,
                            &fetch,
                        )[part.mvp_idx];
                        info.pred_flag[list] = true;
                        info.ref_poc[list] = target_poc;
                        info.mv[list] = MotionVector::new(
                            mvp.x.wrapping_add(part.mvd.x),
                            mvp.y.wrapping_add(part.mvd.y),
                        );
                    }
                    info
                }
            }
        };
        self.warnings.extend(local_warnings);

        if !info.pred_flag[0] && !info.pred_flag[1] {
            self.warnings.push(DecodeWarning::BothPredFlagsZero);
            self.mark_4x4_region(meta, px, py, pw, ph, MvInfo::default());
            return Ok(());
        }

        self.motion_compensate(planes, px, py, pw, ph, &info)?;
        self.mark_4x4_region(meta, px, py, pw, ph, info);
        Ok(())
    }

    fn mark_4x4_region(
        &self,
        meta: &mut PictureMeta,
        x0: u32,
        y0: u32,
        w: u32,
        h: u32,
        info: MvInfo,
    ) {
        let w4 = self.sps.pic_width_in_luma_samples.div_ceil(4) as usize;
        for y in (y0 / 4)..(y0 + h).div_ceil(4) {
            for x in (x0 / 4)..(x0 + w).div_ceil(4) {
                if let Some(cell) = meta.mv.get_mut(y as usize * w4 + x as usize) {
                    *cell = info;
                }
            }
        }
    }

    /// Run motion compensation for one PU into the current picture.
    fn motion_compensate(
        &mut self,
        planes: &mut ImageBuffer,
        px: u32,
        py: u32,
        pw: u32,
        ph: u32,
        info: &MvInfo,
    ) -> Result<()> {
        let mut luma_preds: [Option<Vec<i32>>; 2] = [None, None];
        let mut cb_preds: [Option<Vec<i32>>; 2] = [None, None];
        let mut cr_preds: [Option<Vec<i32>>; 2] = [None, None];
        let has_chroma = self.pic.chroma() != ChromaFormat::Monochrome;

        for list in 0..2 {
            if !info.pred_flag[list] {
                continue;
            }
            let Some(ref_pic) = self.ref_by_poc(info.ref_poc[list]) else {
                self.warnings
                    .push(DecodeWarning::NonexistingReferencePictureAccessed);
                continue;
            };

            let mv = info.mv[list];
            // The reference area this PU touches, including filter margins,
            // must be fully reconstructed.
            let max_x = px as i32 + pw as i32 + (mv.x >> 2) as i32 + 4;
            let max_y = py as i32 + ph as i32 + (mv.y >> 2) as i32 + 4;
            let cx = max_x >> self.sps.log2_ctb_size;
            let cy = max_y >> self.sps.log2_ctb_size;
            ref_pic.progress(cx, cy).wait_for(CtbProgress::SaoComplete);

            let ref_planes = ref_pic.planes();
            luma_preds[list] = Some((self.kernels.mc_luma)(
                ref_planes.plane(0),
                px as i32,
                py as i32,
                pw as usize,
                ph as usize,
                mv,
            ));
            if has_chroma {
                let sub_x = self.pic.chroma().sub_width();
                let sub_y = self.pic.chroma().sub_height();
                let cmv = MotionVector::new(mv.x, mv.y);
                cb_preds[list] = Some((self.kernels.mc_chroma)(
                    ref_planes.plane(1),
                    (px / sub_x) as i32,
                    (py / sub_y) as i32,
                    (pw / sub_x) as usize,
                    (ph / sub_y) as usize,
                    cmv,
                ));
                cr_preds[list] = Some((self.kernels.mc_chroma)(
                    ref_planes.plane(2),
                    (px / sub_x) as i32,
                    (py / sub_y) as i32,
                    (pw / sub_x) as usize,
                    (ph / sub_y) as usize,
                    cmv,
                ));
            }
        }

        let write_block = |plane: &mut PlaneBuffer, x0: u32, y0: u32, w: u32, samples: &[u8]| {
            let stride = plane.stride();
            let data = plane.data_mut();
            for (row_idx, row) in samples.chunks(w as usize).enumerate() {
                let dst = (y0 as usize + row_idx) * stride + x0 as usize;
                data[dst..dst + w as usize].copy_from_slice(row);
            }
        };

        let combine = |preds: &[Option<Vec<i32>>; 2], bit_depth: u8| -> Option<Vec<u8>> {
            match (&preds[0], &preds[1]) {
                (Some(a), Some(b)) => Some(inter::finalize_bi(a, b, bit_depth)),
                (Some(a), None) => Some(inter::finalize_uni(a, bit_depth)),
                (None, Some(b)) => Some(inter::finalize_uni(b, bit_depth)),
                (None, None) => None,
            }
        };

        if let Some(luma) = combine(&luma_preds, self.sps.bit_depth_luma) {
            write_block(planes.plane_mut(0), px, py, pw, &luma);
        }
        if has_chroma {
            let sub_x = self.pic.chroma().sub_width();
            let sub_y = self.pic.chroma().sub_height();
            if let Some(cb) = combine(&cb_preds, self.sps.bit_depth_chroma) {
                write_block(planes.plane_mut(1), px / sub_x, py / sub_y, pw / sub_x, &cb);
            }
            if let Some(cr) = combine(&cr_preds, self.sps.bit_depth_chroma) {
                write_block(planes.plane_mut(2), px / sub_x, py / sub_y, pw / sub_x, &cr);
            }
        }

        Ok(())
    }

    fn ref_by_poc(&self, poc: i32) -> Option<Arc<Picture>> {
        self.refs
            .l0
            .iter()
            .chain(self.refs.l1.iter())
            .find(|p| p.poc == poc)
            .cloned()
    }

    /// Record boundary strengths along the left and top edges of a block.
    fn mark_pu_edges(&self, meta: &mut PictureMeta, x0: u32, y0: u32, w: u32, h: u32) {
        let w4 = self.sps.pic_width_in_luma_samples.div_ceil(4) as usize;

        if x0 > 0 && x0 % 8 == 0 {
            for y in (y0 / 4)..(y0 + h).div_ceil(4) {
                let q_idx = y as usize * w4 + (x0 / 4) as usize;
                let p_idx = y as usize * w4 + (x0 / 4) as usize - 1;
                let bs = deblock::boundary_strength(
                    &meta.mv[p_idx],
                    &meta.mv[q_idx],
                    meta.cbf_luma[p_idx],
                    meta.cbf_luma[q_idx],
                );
                meta.bs_v[q_idx] = meta.bs_v[q_idx].max(bs);
            }
        }
        if y0 > 0 && y0 % 8 == 0 {
            for x in (x0 / 4)..(x0 + w).div_ceil(4) {
                let q_idx = (y0 / 4) as usize * w4 + x as usize;
                let p_idx = (y0 / 4 - 1) as usize * w4 + x as usize;
                let bs = deblock::boundary_strength(
                    &meta.mv[p_idx],
                    &meta.mv[q_idx],
                    meta.cbf_luma[p_idx],
                    meta.cbf_luma[q_idx],
                );
                meta.bs_h[q_idx] = meta.bs_h[q_idx].max(bs);
            }
        }
    }
}

/// Index into the 4x4 metadata grids for the luma position `(x, y)`.
fn grid4_at(sps: &Sps, x: i32, y: i32) -> usize {
    let w4 = sps.pic_width_in_luma_samples.div_ceil(4) as usize;
    (y as usize / 4) * w4 + x as usize / 4
}

/// Z-scan availability of `(xn, yn)` to the block at `(xc, yc)` (6.4.1).
fn available_at(
    sps: &Sps,
    pps: &Pps,
    meta: &PictureMeta,
    xc: u32,
    yc: u32,
    xn: i32,
    yn: i32,
) -> bool {
    if xn < 0 || yn < 0 {
        return false;
    }
    let (xn, yn) = (xn as u32, yn as u32);
    if xn >= sps.pic_width_in_luma_samples || yn >= sps.pic_height_in_luma_samples {
        return false;
    }

    let tables = pps.tables();
    if tables.z_scan_addr(sps, xn, yn) > tables.z_scan_addr(sps, xc, yc) {
        return false;
    }

    let ctbs_w = sps.pic_width_in_ctbs();
    let curr_ctb = (yc >> sps.log2_ctb_size) * ctbs_w + (xc >> sps.log2_ctb_size);
    let nb_ctb = (yn >> sps.log2_ctb_size) * ctbs_w + (xn >> sps.log2_ctb_size);

    // Same slice and same tile.
    if meta.ctb_slice_addr[nb_ctb as usize] != meta.ctb_slice_addr[curr_ctb as usize] {
        return false;
    }
    tables.tile_id_rs[nb_ctb as usize] == tables.tile_id_rs[curr_ctb as usize]
}

/// Partition mode of a CU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartMode {
    /// Single square PU.
    Part2Nx2N,
    /// Two horizontal PUs.
    Part2NxN,
    /// Two vertical PUs.
    PartNx2N,
    /// Four square PUs.
    PartNxN,
    /// Asymmetric: upper quarter.
    Part2NxnU,
    /// Asymmetric: lower quarter.
    Part2NxnD,
    /// Asymmetric: left quarter.
    PartnLx2N,
    /// Asymmetric: right quarter.
    PartnRx2N,
}

/// PU rectangles of a CU in decode order.
fn pu_geometry(mode: PartMode, x0: u32, y0: u32, size: u32) -> Vec<(u32, u32, u32, u32)> {
    let half = size / 2;
    let quarter = size / 4;
    match mode {
        PartMode::Part2Nx2N => vec![(x0, y0, size, size)],
        PartMode::Part2NxN => vec![(x0, y0, size, half), (x0, y0 + half, size, half)],
        PartMode::PartNx2N => vec![(x0, y0, half, size), (x0 + half, y0, half, size)],
        PartMode::PartNxN => vec![
            (x0, y0, half, half),
            (x0 + half, y0, half, half),
            (x0, y0 + half, half, half),
            (x0 + half, y0 + half, half, half),
        ],
        PartMode::Part2NxnU => vec![
            (x0, y0, size, quarter),
            (x0, y0 + quarter, size, size - quarter),
        ],
        PartMode::Part2NxnD => vec![
            (x0, y0, size, size - quarter),
            (x0, y0 + size - quarter, size, quarter),
        ],
        PartMode::PartnLx2N => vec![
            (x0, y0, quarter, size),
            (x0 + quarter, y0, size - quarter, size),
        ],
        PartMode::PartnRx2N => vec![
            (x0, y0, size - quarter, size),
            (x0 + size - quarter, y0, quarter, size),
        ],
    }
}

/// Motion description of one PU.
#[derive(Debug, Clone, Copy)]
enum PuMotion {
    /// Merge mode with candidate index.
    Merge(u8),
    /// Explicit AMVP per list.
    Amvp([Option<AmvpPart>; 2]),
}

/// AMVP data of one list.
#[derive(Debug, Clone, Copy)]
struct AmvpPart {
    ref_idx: u8,
    mvd: MotionVector,
    mvp_idx: usize,
}

/// Per-CU state threaded through the transform tree.
struct TuContext {
    is_intra: bool,
    transquant_bypass: bool,
    intra_luma_modes: [u8; 4],
    intra_chroma_mode: u8,
    cu_x0: u32,
    cu_y0: u32,
    cu_log2_size: u8,
    part_mode: PartMode,
    max_depth: u8,
}

impl TuContext {
    /// Luma intra mode covering the position `(x, y)`.
    fn luma_mode_at(&self, x: u32, y: u32) -> u8 {
        if self.part_mode != PartMode::PartNxN {
            return self.intra_luma_modes[0];
        }
        let half = 1u32 << (self.cu_log2_size - 1);
        let idx = (((y - self.cu_y0) / half) * 2 + (x - self.cu_x0) / half) as usize;
        self.intra_luma_modes[idx.min(3)]
    }
}


/// Deblock and SAO-filter one CTB row of a picture.
///
/// Requires prediction of the row and its bottom neighbour row to be
/// complete (the caller gates on progress cells). Advances each CTB of the
/// row through `DeblockingVPass`, `DeblockingHPass`, and `SaoComplete`.
pub fn filter_ctb_row(
    pic: &Picture,
    sps: &Sps,
    header: &SliceSegmentHeader,
    kernels: &KernelTable,
    row: u32,
) {
    let ctb_size = sps.ctb_size();
    let y_start = row * ctb_size;
    let y_end = (y_start + ctb_size).min(sps.pic_height_in_luma_samples);
    let pic_w = sps.pic_width_in_luma_samples;

    let deblock_enabled = !header.slice_deblocking_filter_disabled_flag;

    {
        let mut planes = pic.planes_mut();
        let meta = pic.meta();
        let w4 = pic_w.div_ceil(4) as usize;

        if deblock_enabled {
            // Vertical edges (8-sample grid), then horizontal edges.
            let luma = planes.plane_mut(0);
            for x in (8..pic_w).step_by(8) {
                for y in (y_start..y_end).step_by(4) {
                    let bs = meta.bs_v[(y as usize / 4) * w4 + x as usize / 4];
                    if bs > 0 {
                        let qp = {
                            let qp_p = meta.qp_y[(y as usize / 4) * w4 + (x as usize - 1) / 4];
                            let qp_q = meta.qp_y[(y as usize / 4) * w4 + x as usize / 4];
                            (qp_p as i32 + qp_q as i32 + 1) >> 1
                        };
                        (kernels.deblock_luma_edge)(
                            luma,
                            x as usize,
                            y as usize,
                            true,
                            bs,
                            qp,
                            header.slice_beta_offset_div2,
                            header.slice_tc_offset_div2,
                            sps.bit_depth_luma,
                        );
                    }
                }
            }
        }
        advance_row(pic, sps, row, CtbProgress::DeblockingVPass);

        if deblock_enabled {
            let luma = planes.plane_mut(0);
            let h_end = y_end.min(sps.pic_height_in_luma_samples);
            for y in (y_start.max(8)..h_end).step_by(8) {
                for x in (0..pic_w).step_by(4) {
                    let bs = meta.bs_h[(y as usize / 4) * w4 + x as usize / 4];
                    if bs > 0 {
                        let qp = {
                            let qp_p = meta.qp_y[((y as usize - 1) / 4) * w4 + x as usize / 4];
                            let qp_q = meta.qp_y[(y as usize / 4) * w4 + x as usize / 4];
                            (qp_p as i32 + qp_q as i32 + 1) >> 1
                        };
                        (kernels.deblock_luma_edge)(
                            luma,
                            x as usize,
                            y as usize,
                            false,
                            bs,
                            qp,
                            header.slice_beta_offset_div2,
                            header.slice_tc_offset_div2,
                            sps.bit_depth_luma,
                        );
                    }
                }
            }

            // Chroma edges on the 16-sample luma grid, bs == 2 only.
            if sps.chroma_format != ChromaFormat::Monochrome {
                let sub_x = sps.chroma_format.sub_width();
                let sub_y = sps.chroma_format.sub_height();
                for c in 1..=2 {
                    let qp_offset = if c == 1 {
                        header.slice_cb_qp_offset
                    } else {
                        header.slice_cr_qp_offset
                    } as i32;
                    let chroma = planes.plane_mut(c);
                    for x in ((8 * sub_x)..pic_w).step_by((8 * sub_x) as usize) {
                        for y in (y_start..y_end).step_by((4 * sub_y) as usize) {
                            let bs = meta.bs_v[(y as usize / 4) * w4 + x as usize / 4];
                            if bs == 2 {
                                let qp_y =
                                    meta.qp_y[(y as usize / 4) * w4 + x as usize / 4] as i32;
                                let qp_c = transform::chroma_qp(qp_y + qp_offset);
                                (kernels.deblock_chroma_edge)(
                                    chroma,
                                    (x / sub_x) as usize,
                                    (y / sub_y) as usize,
                                    true,
                                    qp_c,
                                    header.slice_tc_offset_div2,
                                    sps.bit_depth_chroma,
                                    (4 * sub_y).min(y_end - y) as usize / sub_y as usize,
                                );
                            }
                        }
                    }
                    for y in (y_start.max(8 * sub_y)..y_end).step_by((8 * sub_y) as usize) {
                        for x in (0..pic_w).step_by((4 * sub_x) as usize) {
                            let bs = meta.bs_h[(y as usize / 4) * w4 + x as usize / 4];
                            if bs == 2 {
                                let qp_y =
                                    meta.qp_y[(y as usize / 4) * w4 + x as usize / 4] as i32;
                                let qp_c = transform::chroma_qp(qp_y + qp_offset);
                                (kernels.deblock_chroma_edge)(
                                    chroma,
                                    (x / sub_x) as usize,
                                    (y / sub_y) as usize,
                                    false,
                                    qp_c,
                                    header.slice_tc_offset_div2,
                                    sps.bit_depth_chroma,
                                    4,
                                );
                            }
                        }
                    }
                }
            }
        }
        advance_row(pic, sps, row, CtbProgress::DeblockingHPass);

        // SAO over every CTB of the row.
        if header.slice_sao_luma_flag || header.slice_sao_chroma_flag {
            let ctbs_w = sps.pic_width_in_ctbs();
            for cx in 0..ctbs_w {
                let params = meta.ctb_sao[(row * ctbs_w + cx) as usize];
                let x0 = cx * ctb_size;

                if header.slice_sao_luma_flag {
                    let luma = planes.plane_mut(0);
                    (kernels.sao_region)(
                        luma,
                        x0,
                        y_start,
                        ctb_size.min(pic_w - x0),
                        y_end - y_start,
                        &params.comp[0],
                        sps.bit_depth_luma,
                    );
                }
                if header.slice_sao_chroma_flag
                    && sps.chroma_format != ChromaFormat::Monochrome
                {
                    let sub_x = sps.chroma_format.sub_width();
                    let sub_y = sps.chroma_format.sub_height();
                    for c in 1..=2 {
                        let chroma = planes.plane_mut(c);
                        (kernels.sao_region)(
                            chroma,
                            x0 / sub_x,
                            y_start / sub_y,
                            (ctb_size.min(pic_w - x0)) / sub_x,
                            (y_end - y_start) / sub_y,
                            &params.comp[c],
                            sps.bit_depth_chroma,
                        );
                    }
                }
            }
        }
    }
    advance_row(pic, sps, row, CtbProgress::SaoComplete);
}

fn advance_row(pic: &Picture, sps: &Sps, row: u32, progress: CtbProgress) {
    for cx in 0..sps.pic_width_in_ctbs() {
        pic.progress(cx as i32, row as i32).advance(progress);
    }
}

impl SliceDecoder {
    /// Transform tree recursion (7.3.8.8).
    #[allow(clippy::too_many_arguments)]
    fn decode_transform_tree(
        &mut self,
        header: &SliceSegmentHeader,
        ent: &mut Entropy,
        planes: &mut ImageBuffer,
        meta: &mut PictureMeta,
        tu: &TuContext,
        x0: u32,
        y0: u32,
        log2_size: u8,
        depth: u8,
        parent_cbf_cb: bool,
        parent_cbf_cr: bool,
        blk_idx: u8,
    ) -> Result<()> {
        let forced_split_nxn =
            tu.is_intra && tu.part_mode == PartMode::PartNxN && depth == 0;

        let split = if log2_size > self.sps.log2_max_tb_size {
            true
        } else if forced_split_nxn {
            true
        } else if log2_size > self.sps.log2_min_tb_size && depth < tu.max_depth {
            let ctx_idx = (5 - log2_size) as usize;
            ent.cabac
                .decode_bin(ent.ctx.model(ctx::SPLIT_TRANSFORM_FLAG + ctx_idx))
        } else {
            false
        };

        let has_chroma = self.sps.chroma_format != ChromaFormat::Monochrome;

        // Chroma CBFs are coded at levels with transform size above 4x4.
        let mut cbf_cb = parent_cbf_cb;
        let mut cbf_cr = parent_cbf_cr;
        if has_chroma && log2_size > 2 {
            if parent_cbf_cb {
                cbf_cb = ent
                    .cabac
                    .decode_bin(ent.ctx.model(ctx::CBF_CHROMA + (depth as usize).min(3)));
            }
            if parent_cbf_cr {
                cbf_cr = ent
                    .cabac
                    .decode_bin(ent.ctx.model(ctx::CBF_CHROMA + (depth as usize).min(3)));
            }
        }

        if split {
            let half = 1u32 << (log2_size - 1);
            for i in 0..4u8 {
                let sx = x0 + (i as u32 & 1) * half;
                let sy = y0 + (i as u32 >> 1) * half;
                self.decode_transform_tree(
                    header,
                    ent,
                    planes,
                    meta,
                    tu,
                    sx,
                    sy,
                    log2_size - 1,
                    depth + 1,
                    cbf_cb,
                    cbf_cr,
                    i,
                )?;
            }
            return Ok(());
        }

        // Leaf: cbf_luma, then the transform unit.
        let cbf_luma = if tu.is_intra || depth > 0 || cbf_cb || cbf_cr {
            let ctx_idx = if depth == 0 { 1 } else { 0 };
            ent.cabac.decode_bin(ent.ctx.model(ctx::CBF_LUMA + ctx_idx))
        } else {
            true
        };

        self.decode_transform_unit(
            header, ent, planes, meta, tu, x0, y0, log2_size, blk_idx, cbf_luma, cbf_cb, cbf_cr,
        )
    }

    /// One transform unit: prediction (intra), cu_qp_delta, residuals
    /// (7.3.8.10).
    #[allow(clippy::too_many_arguments)]
    fn decode_transform_unit(
        &mut self,
        header: &SliceSegmentHeader,
        ent: &mut Entropy,
        planes: &mut ImageBuffer,
        meta: &mut PictureMeta,
        tu: &TuContext,
        x0: u32,
        y0: u32,
        log2_size: u8,
        blk_idx: u8,
        cbf_luma: bool,
        cbf_cb: bool,
        cbf_cr: bool,
    ) -> Result<()> {
        let size = 1u32 << log2_size;
        let has_chroma = self.sps.chroma_format != ChromaFormat::Monochrome;
        // 4x4 luma TBs carry the chroma of the whole 8x8 group at the last
        // sub-block.
        let chroma_here = has_chroma && (log2_size > 2 || blk_idx == 3);
        let (cx0, cy0, chroma_log2) = if log2_size > 2 {
            (x0, y0, log2_size - 1)
        } else {
            (x0 & !7, y0 & !7, 2)
        };

        if (cbf_luma || cbf_cb || cbf_cr)
            && self.pps.cu_qp_delta_enabled_flag
            && !self.qp_delta_taken
        {
            let delta = self.decode_cu_qp_delta(ent);
            self.qp_delta_taken = true;
            self.qp_y = (self.qp_y + delta).clamp(0, 51);
            let cu_size = 1u32 << tu.cu_log2_size;
            self.mark_4x4(&mut meta.qp_y, tu.cu_x0, tu.cu_y0, cu_size, self.qp_y as i8);
        }

        // Intra prediction runs per transform block against reconstructed
        // neighbours.
        if tu.is_intra {
            let mode = tu.luma_mode_at(x0, y0);
            self.intra_predict_block(planes, meta, 0, x0, y0, size, mode)?;
        }

        if cbf_luma {
            let scan = self.scan_pattern(tu, log2_size, true, x0, y0);
            let (coeffs, ts) = self.decode_residual(ent, log2_size, 0, scan);
            let residual: Vec<i16> = if tu.transquant_bypass {
                coeffs.iter().map(|&c| c as i16).collect()
            } else {
                let d = transform::dequantize(&coeffs, log2_size, self.qp_y, self.sps.bit_depth_luma);
                if ts {
                    transform::transform_skip(&d, log2_size, self.sps.bit_depth_luma)
                } else {
                    let use_dst = tu.is_intra && log2_size == 2;
                    (self.kernels.inverse_transform)(&d, log2_size, use_dst, self.sps.bit_depth_luma)
                }
            };
            add_residual(planes.plane_mut(0), x0, y0, size, &residual, self.sps.bit_depth_luma);
        }
        self.mark_4x4(&mut meta.cbf_luma, x0, y0, size, cbf_luma);
        self.mark_tu_edges(meta, x0, y0, size);

        if chroma_here {
            let chroma_size = 1u32 << chroma_log2;
            let sub_x = self.sps.chroma_format.sub_width();
            let sub_y = self.sps.chroma_format.sub_height();

            for (c_idx, cbf) in [(1usize, cbf_cb), (2usize, cbf_cr)] {
                if tu.is_intra {
                    let mode = if tu.intra_chroma_mode == 34 {
                        tu.luma_mode_at(tu.cu_x0, tu.cu_y0)
                    } else {
                        tu.intra_chroma_mode
                    };
                    self.intra_predict_block(
                        planes,
                        meta,
                        c_idx,
                        cx0 / sub_x,
                        cy0 / sub_y,
                        chroma_size,
                        mode,
                    )?;
                }

                if cbf {
                    let offset = if c_idx == 1 {
                        self.pps.pps_cb_qp_offset + header.slice_cb_qp_offset
                    } else {
                        self.pps.pps_cr_qp_offset + header.slice_cr_qp_offset
                    } as i32;
                    let qp_c = transform::chroma_qp(self.qp_y + offset);

                    let scan = self.scan_pattern(tu, chroma_log2, false, x0, y0);
                    let (coeffs, ts) = self.decode_residual(ent, chroma_log2, c_idx, scan);
                    let residual: Vec<i16> = if tu.transquant_bypass {
                        coeffs.iter().map(|&c| c as i16).collect()
                    } else {
                        let d = transform::dequantize(
                            &coeffs,
                            chroma_log2,
                            qp_c,
                            self.sps.bit_depth_chroma,
                        );
                        if ts {
                            transform::transform_skip(&d, chroma_log2, self.sps.bit_depth_chroma)
                        } else {
                            (self.kernels.inverse_transform)(
                                &d,
                                chroma_log2,
                                false,
                                self.sps.bit_depth_chroma,
                            )
                        }
                    };
                    add_residual(
                        planes.plane_mut(c_idx),
                        cx0 / sub_x,
                        cy0 / sub_y,
                        chroma_size,
                        &residual,
                        self.sps.bit_depth_chroma,
                    );
                }
            }
        }

        Ok(())
    }

    /// cu_qp_delta_abs + sign (9.3.3.10).
    fn decode_cu_qp_delta(&mut self, ent: &mut Entropy) -> i32 {
        if !ent.cabac.decode_bin(ent.ctx.model(ctx::CU_QP_DELTA_ABS)) {
            return 0;
        }
        let mut abs = 1u32;
        while abs < 5 && ent.cabac.decode_bin(ent.ctx.model(ctx::CU_QP_DELTA_ABS + 1)) {
            abs += 1;
        }
        if abs == 5 {
            abs += ent.cabac.decode_bypass_eg(0);
        }
        if ent.cabac.decode_bypass() {
            -(abs as i32)
        } else {
            abs as i32
        }
    }

    /// Mark transform-block boundary strengths on the 8x8 edge grid.
    fn mark_tu_edges(&self, meta: &mut PictureMeta, x0: u32, y0: u32, size: u32) {
        self.mark_pu_edges(meta, x0, y0, size, size);
    }

    /// Coefficient scan selection (intra 4x4/8x8 blocks scan by mode).
    fn scan_pattern(&self, tu: &TuContext, log2_size: u8, is_luma: bool, x0: u32, y0: u32) -> ScanPattern {
        if tu.is_intra && log2_size <= 3 {
            let mode = if is_luma {
                tu.luma_mode_at(x0, y0)
            } else if tu.intra_chroma_mode == 34 {
                tu.luma_mode_at(tu.cu_x0, tu.cu_y0)
            } else {
                tu.intra_chroma_mode
            };
            if (6..=14).contains(&mode) {
                return ScanPattern::Vertical;
            }
            if (22..=30).contains(&mode) {
                return ScanPattern::Horizontal;
            }
        }
        ScanPattern::Diagonal
    }

    /// Intra-predict one transform block of component `c_idx`.
    fn intra_predict_block(
        &mut self,
        planes: &mut ImageBuffer,
        meta: &PictureMeta,
        c_idx: usize,
        x0: u32,
        y0: u32,
        size: u32,
        mode: u8,
    ) -> Result<()> {
        let sps = self.sps.clone();
        let pps = self.pps.clone();
        let constrained = self.pps.constrained_intra_pred_flag;

        // Availability in luma coordinates; chroma positions scale up.
        let (scale_x, scale_y) = if c_idx == 0 {
            (1, 1)
        } else {
            (
                self.sps.chroma_format.sub_width(),
                self.sps.chroma_format.sub_height(),
            )
        };
        let luma_x0 = x0 * scale_x;
        let luma_y0 = y0 * scale_y;

        let avail = |x: i32, y: i32| -> bool {
            let lx = x * scale_x as i32;
            let ly = y * scale_y as i32;
            if !available_at(&sps, &pps, meta, luma_x0, luma_y0, lx, ly) {
                return false;
            }
            if constrained {
                // Only intra-coded neighbours may be referenced.
                return meta.mv[grid4_at(&sps, lx, ly)].intra;
            }
            true
        };

        let plane = planes.plane_mut(c_idx);
        let bit_depth = if c_idx == 0 {
            self.sps.bit_depth_luma
        } else {
            self.sps.bit_depth_chroma
        };

        let mut refs = intra::RefSamples::gather(plane, x0, y0, size, bit_depth, &avail);
        if c_idx == 0 {
            refs.filter(
                size,
                mode,
                bit_depth,
                self.sps.strong_intra_smoothing_enabled_flag,
            );
        }

        let edge_filter = c_idx == 0 && size < 32;
        (self.kernels.intra_predict)(plane, &refs, x0, y0, size, mode, bit_depth, edge_filter);
        Ok(())
    }

    /// Residual coding of one transform block (7.3.8.11 / 9.3.4.2.5).
    ///
    /// Returns the coefficient array in row-major order.
    fn decode_residual(
        &mut self,
        ent: &mut Entropy,
        log2_size: u8,
        c_idx: usize,
        scan: ScanPattern,
    ) -> (Vec<i32>, bool) {
        let size = 1usize << log2_size;
        let is_luma = c_idx == 0;
        let mut coeffs = vec![0i32; size * size];

        // transform_skip_flag for 4x4 blocks.
        let mut transform_skip = false;
        if self.pps.transform_skip_enabled_flag && log2_size == 2 {
            let ts_ctx = ctx::TRANSFORM_SKIP + (!is_luma) as usize;
            transform_skip = ent.cabac.decode_bin(ent.ctx.model(ts_ctx));
        }

        // Last significant coefficient position.
        let (last_x, last_y) = self.decode_last_sig(ent, log2_size, is_luma);
        let (last_x, last_y) = if scan == ScanPattern::Vertical {
            (last_y, last_x)
        } else {
            (last_x, last_y)
        };

        // Locate the last position in scan order. Sub-blocks follow the
        // same scan pattern as the positions within them.
        let sub_size = size / 4;
        let sub_scan = SCAN_TABLES.order(scan, sub_size.max(1) as u32);
        let in_scan = SCAN_TABLES.order(scan, 4);

        let last_sub = {
            let sx = (last_x / 4) as u8;
            let sy = (last_y / 4) as u8;
            sub_scan.iter().position(|&p| p == (sx, sy)).unwrap_or(0)
        };
        let last_in = {
            let ix = (last_x & 3) as u8;
            let iy = (last_y & 3) as u8;
            in_scan.iter().position(|&p| p == (ix, iy)).unwrap_or(0)
        };

        let mut csbf = vec![false; sub_size.max(1) * sub_size.max(1)];

        // Sub-blocks from the last towards DC.
        for sub_i in (0..=last_sub).rev() {
            let (sbx, sby) = sub_scan[sub_i];
            let sub_idx = sby as usize * sub_size.max(1) + sbx as usize;

            let coded = if sub_i == last_sub || sub_i == 0 {
                true
            } else {
                // coded_sub_block_flag with right/below neighbour context.
                let right = sbx as usize + 1 < sub_size
                    && csbf[sby as usize * sub_size + sbx as usize + 1];
                let below = sby as usize + 1 < sub_size
                    && csbf[(sby as usize + 1) * sub_size + sbx as usize];
                let ctx_idx =
                    ctx::CODED_SUB_BLOCK + (!is_luma as usize) * 2 + (right || below) as usize;
                ent.cabac.decode_bin(ent.ctx.model(ctx_idx))
            };
            csbf[sub_idx] = coded;
            if !coded {
                continue;
            }

            // Significance flags within the 4x4 sub-block.
            let start = if sub_i == last_sub { last_in } else { 16 };
            let mut sig = [false; 16];
            let mut any = false;
            if sub_i == last_sub {
                sig[last_in] = true;
                any = true;
            }

            let infer_dc = sub_i != last_sub && sub_i != 0;
            for n in (0..start).rev() {
                let (ix, iy) = in_scan[n];
                let x = sbx as u32 * 4 + ix as u32;
                let y = sby as u32 * 4 + iy as u32;

                // The DC of an inferred sub-block is implied when every
                // other flag decoded zero.
                if n == 0 && infer_dc && !any {
                    sig[0] = true;
                    any = true;
                    break;
                }

                let ctx_inc = self.sig_ctx(log2_size, c_idx, x, y, scan, &csbf, sbx, sby, sub_size);
                let flag = ent
                    .cabac
                    .decode_bin(ent.ctx.model(ctx::SIG_COEFF_FLAG + ctx_inc));
                sig[n] = flag;
                any |= flag;
            }

            if !any && sub_i != last_sub {
                continue;
            }

            // Level coding: greater1 (up to 8), greater2 (first), signs,
            // remaining levels.
            let positions: Vec<usize> =
                (0..16).rev().filter(|&n| sig[n]).collect();

            let ctx_set = {
                let mut set = if sub_i == 0 || !is_luma { 0 } else { 2 };
                if self.greater1_tail {
                    set += 1;
                }
                set
            };
            let g1_base = ctx::COEFF_ABS_GREATER1 + (!is_luma as usize) * 16 + 4 * ctx_set;

            let mut greater1 = [false; 16];
            let mut g1_ctx = 1usize;
            let mut first_g1: Option<usize> = None;
            for (i, &n) in positions.iter().enumerate() {
                if i < 8 {
                    let flag = ent
                        .cabac
                        .decode_bin(ent.ctx.model(g1_base + g1_ctx.min(3)));
                    greater1[n] = flag;
                    if flag {
                        g1_ctx = 0;
                        if first_g1.is_none() {
                            first_g1 = Some(n);
                        }
                    } else if g1_ctx > 0 && g1_ctx < 3 {
                        g1_ctx += 1;
                    }
                }
            }
            self.greater1_tail = greater1.iter().any(|&g| g);

            let mut greater2 = false;
            if first_g1.is_some() {
                let g2_ctx = ctx::COEFF_ABS_GREATER2 + (!is_luma as usize) * 4 + ctx_set.min(3);
                greater2 = ent.cabac.decode_bin(ent.ctx.model(g2_ctx));
            }

            // Sign bits. With sign data hiding the lowest-frequency sign is
            // inferred from the parity of the level sum when the scan span
            // inside the sub-block exceeds 3.
            let hide_sign = self.pps.sign_data_hiding_enabled_flag
                && positions.len() >= 2
                && {
                    let first = *positions.last().unwrap();
                    let last = *positions.first().unwrap();
                    (last as i32 - first as i32) > 3
                };

            let mut signs = [false; 16];
            let sign_count = if hide_sign {
                positions.len() - 1
            } else {
                positions.len()
            };
            for (i, &n) in positions.iter().enumerate() {
                if i < sign_count {
                    signs[n] = ent.cabac.decode_bypass();
                }
            }

            // Remaining absolute levels with adaptive Rice coding.
            let mut rice = 0u32;
            let mut sum_abs = 0i64;
            for (i, &n) in positions.iter().enumerate() {
                let mut base = 1 + greater1[n] as i32;
                if Some(n) == first_g1 {
                    base += greater2 as i32;
                }

                let needs_remaining = if i >= 8 {
                    true
                } else if Some(n) == first_g1 {
                    greater2
                } else {
                    greater1[n]
                };

                let mut level = base;
                if needs_remaining {
                    let rem = ent.cabac.decode_coeff_abs_level_remaining(rice) as i32;
                    level = base + rem;
                    if level > (3 << rice) && rice < 4 {
                        rice += 1;
                    }
                }

                sum_abs += level as i64;
                let (ix, iy) = in_scan[n];
                let x = sbx as usize * 4 + ix as usize;
                let y = sby as usize * 4 + iy as usize;

                let negative = if hide_sign && i == positions.len() - 1 {
                    // Hidden sign: parity of the absolute sum.
                    sum_abs % 2 == 1
                } else {
                    signs[n]
                };
                coeffs[y * size + x] = if negative { -level } else { level };
            }
        }

        (coeffs, transform_skip)
    }

    /// last_sig_coeff_{x,y} prefix/suffix decode (9.3.3.12).
    fn decode_last_sig(&mut self, ent: &mut Entropy, log2_size: u8, is_luma: bool) -> (u32, u32) {
        let max_prefix = (log2_size << 1) - 1;
        let (offset, shift) = if is_luma {
            (
                (3 * (log2_size as usize - 2)) + ((log2_size as usize - 1) >> 2),
                (log2_size + 1) >> 2,
            )
        } else {
            (15, log2_size - 2)
        };

        let mut decode_prefix = |base: usize| -> u32 {
            let mut prefix = 0u32;
            while prefix < max_prefix as u32 {
                let ctx_idx = base + offset + (prefix >> shift) as usize;
                if !ent.cabac.decode_bin(ent.ctx.model(ctx_idx)) {
                    break;
                }
                prefix += 1;
            }
            prefix
        };

        let prefix_x = decode_prefix(ctx::LAST_SIG_X_PREFIX);
        let prefix_y = decode_prefix(ctx::LAST_SIG_Y_PREFIX);

        let mut decode_suffix = |prefix: u32| -> u32 {
            if prefix <= 3 {
                prefix
            } else {
                let bits = ((prefix >> 1) - 1) as u8;
                let suffix = ent.cabac.decode_bypass_bins(bits);
                ((2 + (prefix & 1)) << bits) + suffix
            }
        };

        (decode_suffix(prefix_x), decode_suffix(prefix_y))
    }

    /// sig_coeff_flag context increment (9.3.4.2.5).
    #[allow(clippy::too_many_arguments)]
    fn sig_ctx(
        &self,
        log2_size: u8,
        c_idx: usize,
        x: u32,
        y: u32,
        scan: ScanPattern,
        csbf: &[bool],
        sbx: u8,
        sby: u8,
        sub_size: usize,
    ) -> usize {
        let is_luma = c_idx == 0;
        let chroma_offset = if is_luma { 0 } else { 27 };

        if x == 0 && y == 0 {
            return chroma_offset;
        }

        let sig_ctx = if log2_size == 2 {
            SIG_CTX_MAP_4X4[(y * 4 + x) as usize] as usize
        } else {
            let right = sbx as usize + 1 < sub_size
                && csbf[sby as usize * sub_size + sbx as usize + 1];
            let below = sby as usize + 1 < sub_size
                && csbf[(sby as usize + 1) * sub_size + sbx as usize];
            let prev = right as usize + 2 * (below as usize);

            let xp = (x & 3) as usize;
            let yp = (y & 3) as usize;
            let mut ctx = match prev {
                0 => {
                    if xp + yp == 0 {
                        2
                    } else if xp + yp < 3 {
                        1
                    } else {
                        0
                    }
                }
                1 => {
                    if yp == 0 {
                        2
                    } else if yp == 1 {
                        1
                    } else {
                        0
                    }
                }
                2 => {
                    if xp == 0 {
                        2
                    } else if xp == 1 {
                        1
                    } else {
                        0
                    }
                }
                _ => 2,
            };

            if is_luma && (sbx > 0 || sby > 0) {
                ctx += 3;
            }

            if log2_size == 3 {
                let luma_base = if scan == ScanPattern::Diagonal { 9 } else { 15 };
                ctx + if is_luma { luma_base } else { 9 }
            } else {
                ctx + if is_luma { 21 } else { 12 }
            }
        };

        chroma_offset + sig_ctx
    }
}

/// Add a residual block to reconstructed samples with bit-depth clipping.
fn add_residual(
    plane: &mut PlaneBuffer,
    x0: u32,
    y0: u32,
    size: u32,
    residual: &[i16],
    bit_depth: u8,
) {
    let max = (1i32 << bit_depth) - 1;
    let stride = plane.stride();
    let width = plane.width();
    let height = plane.height();
    let data = plane.data_mut();

    for y in 0..size {
        if y0 + y >= height {
            break;
        }
        for x in 0..size {
            if x0 + x >= width {
                break;
            }
            let idx = (y0 + y) as usize * stride + (x0 + x) as usize;
            let v = data[idx] as i32 + residual[(y * size + x) as usize] as i32;
            data[idx] = v.clamp(0, max) as u8;
        }
    }
}
