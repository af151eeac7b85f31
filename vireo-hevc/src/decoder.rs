//! The decoder facade.
//!
//! [`Decoder`] ties the pipeline together: NAL input queue, parameter
//! store, picture assembly with POC derivation and reference picture set
//! application, task submission to the worker pool, and the POC-ordered
//! output queue. Push input with [`Decoder::push_data`], drive the pipeline
//! with [`Decoder::decode`], and collect pictures with
//! [`Decoder::get_next_picture`].

use crate::accel::{Acceleration, KernelTable};
use crate::ctb::{RefLists, SliceDecoder};
use crate::dpb::Dpb;
use crate::error::{DecodeError, DecodeWarning, Result};
use crate::nal::{NalUnit, NalUnitType, UserData};
use crate::param::{ParamStore, Pps, Sps, Vps};
use crate::parser::NalParser;
use crate::picture::{Integrity, Picture};
use crate::refpic::{LongTermEntry, RefPicSet};
use crate::scheduler::{FilterTask, SliceTask, Task, WarningSink, WorkerPool};
use crate::sei::{self, DecodedPictureHash, SeiMessage};
use crate::slice::{SliceSegmentHeader, SliceUnit};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};
use vireo_core::bitstream::BitReader;
use vireo_core::image::{DefaultAllocation, SharedAllocation};

/// Maximum number of queued warnings before the oldest is dropped.
const MAX_WARNINGS: usize = 16;

/// Decoder configuration.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    /// Verify decoded-picture-hash SEI messages.
    pub check_sei_hash: bool,
    /// Withhold pictures whose integrity is not `Decoded` from output.
    pub suppress_faulty_pictures: bool,
    /// Kernel table selection.
    pub acceleration: Acceleration,
    /// Log parameter set and slice headers as they arrive.
    pub dump_headers: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            check_sei_hash: false,
            suppress_faulty_pictures: false,
            acceleration: Acceleration::Auto,
            dump_headers: false,
        }
    }
}

/// Assembly state of the picture currently receiving slices.
struct CurrentPicture {
    pic: Arc<Picture>,
    sps: Arc<Sps>,
    header: SliceSegmentHeader,
    hash: Option<DecodedPictureHash>,
}

/// An HEVC decoder instance.
pub struct Decoder {
    config: DecoderConfig,
    kernels: &'static KernelTable,
    parser: NalParser,
    params: ParamStore,
    dpb: Dpb,
    pool: WorkerPool,
    alloc: SharedAllocation,

    warnings: VecDeque<DecodeWarning>,
    task_warnings: WarningSink,
    dump_sink: Option<Box<dyn Write + Send>>,

    curr: Option<CurrentPicture>,
    last_independent_header: Option<SliceSegmentHeader>,
    pending_hash: Option<DecodedPictureHash>,
    prev_poc_lsb: u32,
    prev_poc_msb: i32,
    flushed: bool,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    /// Create a decoder with the default configuration.
    pub fn new() -> Self {
        Self::with_config(DecoderConfig::default())
    }

    /// Create a decoder with an explicit configuration.
    pub fn with_config(config: DecoderConfig) -> Self {
        Self {
            kernels: config.acceleration.table(),
            config,
            parser: NalParser::new(),
            params: ParamStore::new(),
            dpb: Dpb::new(8),
            pool: WorkerPool::new(),
            alloc: Arc::new(DefaultAllocation),
            warnings: VecDeque::new(),
            task_warnings: Arc::new(Mutex::new(Vec::new())),
            dump_sink: None,
            curr: None,
            last_independent_header: None,
            pending_hash: None,
            prev_poc_lsb: 0,
            prev_poc_msb: 0,
            flushed: false,
        }
    }

    /// Grow the worker pool to `n` threads (clamped to the implementation
    /// maximum).
    pub fn start_worker_threads(&mut self, n: usize) -> Result<()> {
        if let Some(warning) = self.pool.start(n)? {
            self.push_warning(warning);
        }
        Ok(())
    }

    /// Append Annex-B bytes to the input.
    pub fn push_data(&mut self, data: &[u8], pts: i64, user_data: UserData) -> Result<()> {
        self.parser.push_data(data, pts, user_data)
    }

    /// Enqueue one complete NAL unit (without start code).
    pub fn push_nal(&mut self, data: &[u8], pts: i64, user_data: UserData) -> Result<()> {
        self.parser.push_nal(data, pts, user_data)
    }

    /// Finalize a partially pushed NAL unit.
    pub fn push_end_of_nal(&mut self) {
        self.parser.flush_data();
    }

    /// Finalize pending input and mark the end of the stream.
    pub fn flush_data(&mut self) {
        self.parser.mark_end_of_stream();
    }

    /// Advance the pipeline by roughly one NAL unit.
    ///
    /// Returns `Ok(true)` while more work is queued, `Ok(false)` once the
    /// stream is fully decoded, and [`DecodeError::WaitingForInputData`]
    /// when the input queue ran dry before end of stream.
    pub fn decode(&mut self) -> Result<bool> {
        self.collect_task_warnings();

        if let Some(nal) = self.parser.pop() {
            self.handle_nal(nal)?;
            return Ok(true);
        }

        if self.parser.is_end_of_stream() {
            if !self.flushed {
                self.finish_current_picture()?;
                self.dpb.flush();
                self.flushed = true;
            }
            return Ok(false);
        }

        Err(DecodeError::WaitingForInputData)
    }

    /// Legacy convenience: push `data` (or flush on empty input) and run
    /// the pipeline until it stalls. Input starvation is not reported, for
    /// compatibility with older callers of the byte-stream API.
    pub fn decode_data(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            self.flush_data();
        } else {
            self.push_data(data, 0, None)?;
        }

        loop {
            match self.decode() {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(DecodeError::WaitingForInputData) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Head of the output queue without removing it.
    pub fn peek_next_picture(&mut self) -> Option<Arc<Picture>> {
        loop {
            let pic = self.dpb.peek_output()?;
            if self.config.suppress_faulty_pictures && pic.integrity() != Integrity::Decoded {
                debug!(poc = pic.poc, "suppressing faulty picture");
                self.dpb.pop_output();
                continue;
            }
            return Some(pic);
        }
    }

    /// Remove and return the head of the output queue.
    ///
    /// Equivalent to `peek_next_picture` followed by
    /// `release_next_picture`.
    pub fn get_next_picture(&mut self) -> Option<Arc<Picture>> {
        let pic = self.peek_next_picture()?;
        self.dpb.pop_output();
        Some(pic)
    }

    /// Drop the head of the output queue.
    pub fn release_next_picture(&mut self) {
        if self.peek_next_picture().is_some() {
            self.dpb.pop_output();
        }
    }

    /// Number of pictures waiting in the output queue.
    pub fn pictures_in_output_queue(&self) -> usize {
        self.dpb.output_len()
    }

    /// Pop one queued warning.
    pub fn get_warning(&mut self) -> Option<DecodeWarning> {
        self.collect_task_warnings();
        self.warnings.pop_front()
    }

    /// Raw input bytes not yet assembled into NAL units.
    pub fn pending_input_bytes(&self) -> usize {
        self.parser.bytes_pending()
    }

    /// Complete NAL units waiting to be decoded.
    pub fn pending_nal_units(&self) -> usize {
        self.parser.units_pending()
    }

    /// Select the kernel table.
    pub fn set_acceleration(&mut self, accel: Acceleration) {
        self.config.acceleration = accel;
        self.kernels = accel.table();
    }

    /// Enable decoded-picture-hash verification.
    pub fn set_check_sei_hash(&mut self, check: bool) {
        self.config.check_sei_hash = check;
    }

    /// Withhold pictures that did not decode cleanly.
    pub fn set_suppress_faulty_pictures(&mut self, suppress: bool) {
        self.config.suppress_faulty_pictures = suppress;
    }

    /// Replace the image allocator.
    pub fn set_image_allocation(&mut self, alloc: SharedAllocation) {
        self.alloc = alloc;
    }

    /// Route header dumps into `sink` (in addition to trace logging).
    pub fn set_header_dump(&mut self, sink: Option<Box<dyn Write + Send>>) {
        self.config.dump_headers = sink.is_some();
        self.dump_sink = sink;
    }

    /// Discard all in-flight state; parameter sets, DPB, and input are
    /// cleared. Worker threads stay alive.
    pub fn reset(&mut self) {
        self.pool.drain_queue();
        self.release_all_progress();
        for pic in self.dpb.pictures() {
            pic.wait_for_completion();
        }

        self.parser.reset();
        self.params.clear();
        self.dpb.clear();
        self.warnings.clear();
        self.task_warnings.lock().clear();
        self.curr = None;
        self.last_independent_header = None;
        self.pending_hash = None;
        self.prev_poc_lsb = 0;
        self.prev_poc_msb = 0;
        self.flushed = false;
    }

    /// Force every progress cell to completion so tasks whose upstream
    /// producer was drained from the queue cannot block teardown.
    fn release_all_progress(&self) {
        for pic in self.dpb.pictures() {
            for addr in 0..pic.ctbs_w() * pic.ctbs_h() {
                pic.progress_at(addr)
                    .advance(crate::picture::CtbProgress::SaoComplete);
            }
        }
    }

    fn push_warning(&mut self, warning: DecodeWarning) {
        if self.warnings.len() >= MAX_WARNINGS {
            self.warnings.pop_front();
            if !self.warnings.contains(&DecodeWarning::WarningBufferFull) {
                self.warnings.pop_front();
                self.warnings.push_back(DecodeWarning::WarningBufferFull);
            }
        }
        self.warnings.push_back(warning);
    }

    fn collect_task_warnings(&mut self) {
        let drained: Vec<DecodeWarning> = self.task_warnings.lock().drain(..).collect();
        for w in drained {
            self.push_warning(w);
        }
    }

    fn dump<T: std::fmt::Display>(&mut self, value: &T) {
        if !self.config.dump_headers {
            return;
        }
        let text = format!("{value}");
        debug!("{text}");
        if let Some(sink) = self.dump_sink.as_mut() {
            let _ = sink.write_all(text.as_bytes());
        }
    }

    fn handle_nal(&mut self, nal: NalUnit) -> Result<()> {
        match nal.unit_type() {
            NalUnitType::VpsNut => match Vps::parse(&nal.rbsp) {
                Ok(vps) => {
                    self.dump(&vps);
                    self.params.put_vps(vps);
                }
                Err(_) => self.push_warning(DecodeWarning::SpsHeaderInvalid),
            },
            NalUnitType::SpsNut => match Sps::parse(&nal.rbsp) {
                Ok(sps) => {
                    self.dump(&sps);
                    self.dpb.set_capacity(sps.max_dec_pic_buffering() + 1);
                    self.params.put_sps(sps);
                }
                Err(_) => self.push_warning(DecodeWarning::SpsHeaderInvalid),
            },
            NalUnitType::PpsNut => match Pps::parse(&nal.rbsp) {
                Ok(pps) => {
                    if self.params.sps(pps.pps_seq_parameter_set_id).is_none() {
                        self.push_warning(DecodeWarning::NonexistingSpsReferenced);
                    }
                    self.dump(&pps);
                    if self.params.put_pps(pps).is_err() {
                        self.push_warning(DecodeWarning::PpsHeaderInvalid);
                    }
                }
                Err(_) => self.push_warning(DecodeWarning::PpsHeaderInvalid),
            },
            NalUnitType::PrefixSeiNut | NalUnitType::SuffixSeiNut => {
                self.handle_sei(&nal);
            }
            NalUnitType::AudNut | NalUnitType::FdNut => {}
            NalUnitType::EosNut => {
                // End of coded video sequence: POC prediction restarts.
                self.finish_current_picture()?;
                self.prev_poc_lsb = 0;
                self.prev_poc_msb = 0;
            }
            NalUnitType::EobNut => {
                self.finish_current_picture()?;
            }
            t if t.is_vcl() => {
                self.handle_slice(nal)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_sei(&mut self, nal: &NalUnit) {
        let num_planes = self
            .curr
            .as_ref()
            .map(|c| c.sps.chroma_format.num_planes())
            .unwrap_or(3);

        match sei::parse_sei_rbsp(&nal.rbsp, num_planes) {
            Ok(messages) => {
                for msg in messages {
                    if let SeiMessage::PictureHash(hash) = msg {
                        if nal.unit_type() == NalUnitType::SuffixSeiNut {
                            if let Some(curr) = self.curr.as_mut() {
                                curr.hash = Some(hash);
                            }
                        } else {
                            self.pending_hash = Some(hash);
                        }
                    }
                }
            }
            Err(_) => self.push_warning(DecodeWarning::SliceHeaderInvalid),
        }
    }

    /// Read the PPS id from the start of a slice header.
    fn peek_slice_pps_id(rbsp: &[u8], nal_type: NalUnitType) -> Result<u8> {
        let mut r = BitReader::new(rbsp);
        r.read_bit()?; // first_slice_segment_in_pic_flag
        if nal_type.is_irap() {
            r.read_bit()?; // no_output_of_prior_pics_flag
        }
        Ok(r.read_ue()? as u8)
    }

    fn handle_slice(&mut self, nal: NalUnit) -> Result<()> {
        let nal_type = nal.unit_type();

        let pps_id = match Self::peek_slice_pps_id(&nal.rbsp, nal_type) {
            Ok(id) => id,
            Err(_) => {
                self.push_warning(DecodeWarning::SliceHeaderInvalid);
                return Ok(());
            }
        };

        let Some(pps) = self.params.pps(pps_id) else {
            warn!(pps_id, "slice references unknown PPS, dropping");
            self.push_warning(DecodeWarning::NonexistingPpsReferenced);
            return Ok(());
        };
        let Some(sps) = self.params.sps(pps.pps_seq_parameter_set_id) else {
            self.push_warning(DecodeWarning::NonexistingSpsReferenced);
            return Ok(());
        };

        // Late binding: the PPS may have arrived before its SPS.
        let pps = if pps.derived.is_none() {
            let mut rebound = (*pps).clone();
            if rebound.bind(&sps).is_err() {
                self.push_warning(DecodeWarning::PpsHeaderInvalid);
                return Ok(());
            }
            let rebound = Arc::new(rebound);
            self.params.replace_pps(rebound.clone());
            rebound
        } else {
            pps
        };

        let header = match SliceSegmentHeader::parse(
            &nal.rbsp,
            &sps,
            &pps,
            nal_type,
            self.last_independent_header.as_ref(),
        ) {
            Ok(h) => h,
            Err(err) => {
                warn!(%err, "slice header parse failed, dropping slice");
                self.push_warning(DecodeWarning::SliceHeaderInvalid);
                return Ok(());
            }
        };
        self.dump(&header);

        if header.dependent_slice_segment_flag && header.slice_segment_address == 0 {
            self.push_warning(DecodeWarning::DependentSliceWithAddressZero);
            return Ok(());
        }

        if header.first_slice_segment_in_pic_flag {
            self.finish_current_picture()?;
            self.start_picture(&nal, &sps, &header)?;
        } else if self.curr.is_none() {
            self.push_warning(DecodeWarning::SliceSegmentAddressInvalid);
            return Ok(());
        }

        let curr_pic = self
            .curr
            .as_ref()
            .expect("current picture exists")
            .pic
            .clone();
        let rps = self.current_rps(&header, &sps, curr_pic.poc);
        let ref_lists = self.build_ref_lists(&header, &rps, curr_pic.poc);

        let slice_unit = SliceUnit {
            header: header.clone(),
            rbsp: Arc::new(nal.rbsp),
            nal_unit_type: nal_type,
            temporal_id: nal.header.temporal_id(),
            pts: nal.pts,
            user_data: nal.user_data.clone(),
        };

        let use_wpp_rows = pps.entropy_coding_sync_enabled_flag
            && !header.entry_point_offsets.is_empty()
            && self.pool.worker_count() > 0;

        if use_wpp_rows {
            let ctbs_w = sps.pic_width_in_ctbs();
            let first_row = header.slice_segment_address / ctbs_w;
            let rows = header.entry_point_offsets.len() as u32 + 1;
            let shared_ctx: crate::ctb::WppContexts =
                Arc::new(Mutex::new(vec![None; rows as usize]));
            for i in 0..rows {
                let row = first_row + i;
                if row >= sps.pic_height_in_ctbs() {
                    break;
                }
                let decoder = SliceDecoder::new(
                    sps.clone(),
                    pps.clone(),
                    curr_pic.clone(),
                    ref_lists.clone(),
                    self.kernels,
                    slice_unit.clone(),
                )
                .with_wpp_contexts(shared_ctx.clone());
                self.pool.submit(Task::DecodeCtbRow(Box::new(SliceTask {
                    decoder,
                    wpp_row: Some(row),
                    pic: curr_pic.clone(),
                    warnings: self.task_warnings.clone(),
                })));
            }
        } else {
            if pps.entropy_coding_sync_enabled_flag
                && header.entry_point_offsets.is_empty()
                && self.pool.worker_count() > 1
            {
                self.push_warning(DecodeWarning::NoWppCannotUseMultithreading);
            }
            let decoder = SliceDecoder::new(
                sps.clone(),
                pps.clone(),
                curr_pic.clone(),
                ref_lists,
                self.kernels,
                slice_unit,
            );
            self.pool.submit(Task::DecodeSlice(Box::new(SliceTask {
                decoder,
                wpp_row: None,
                pic: curr_pic.clone(),
                warnings: self.task_warnings.clone(),
            })));
        }

        if !header.dependent_slice_segment_flag {
            self.last_independent_header = Some(header);
        }

        Ok(())
    }

    /// POC derivation (8.3.1) and DPB entry for a new picture.
    fn start_picture(&mut self, nal: &NalUnit, sps: &Arc<Sps>, header: &SliceSegmentHeader) -> Result<()> {
        let nal_type = nal.unit_type();

        if sps.bit_depth_luma > 8 || sps.bit_depth_chroma > 8 {
            return Err(DecodeError::Unsupported(
                "bit depths above 8 are not supported",
            ));
        }

        let poc = if nal_type.is_idr() {
            self.prev_poc_lsb = 0;
            self.prev_poc_msb = 0;
            0
        } else {
            let max_lsb = sps.max_pic_order_cnt_lsb() as i32;
            let lsb = header.slice_pic_order_cnt_lsb as i32;
            let prev_lsb = self.prev_poc_lsb as i32;

            let msb = if nal_type.is_bla() || nal_type.is_cra() {
                // IRAP with NoRaslOutputFlag anchors POC at its own LSB.
                0
            } else if lsb < prev_lsb && (prev_lsb - lsb) >= max_lsb / 2 {
                self.prev_poc_msb + max_lsb
            } else if lsb > prev_lsb && (lsb - prev_lsb) > max_lsb / 2 {
                self.prev_poc_msb - max_lsb
            } else {
                self.prev_poc_msb
            };
            msb + lsb
        };

        if nal_type.is_idr() || nal_type.is_bla() {
            self.dpb.mark_all_unused();
            if header.no_output_of_prior_pics_flag {
                self.dpb.discard_pending_output();
            }
        }

        // Reference picture set application before the picture decodes.
        let rps = self.current_rps(header, sps, poc);
        let missing = self.dpb.apply_ref_pic_set(&rps);
        if !missing.is_empty() {
            warn!(?missing, poc, "RPS references absent pictures");
            self.push_warning(DecodeWarning::NonexistingReferencePictureAccessed);
        }

        let pic = Arc::new(Picture::new(
            sps,
            &self.alloc,
            poc,
            nal_type,
            nal.header.nuh_layer_id,
            nal.header.temporal_id(),
            nal.pts,
            nal.user_data.clone(),
            header.pic_output_flag,
        )?);
        debug!(poc, nal = %nal_type, "picture started");

        self.dpb.insert(pic.clone())?;

        // POC prediction follows temporal-layer-zero reference pictures.
        if nal.header.temporal_id() == 0
            && nal_type.is_reference()
            && !nal_type.is_leading()
        {
            self.prev_poc_lsb = header.slice_pic_order_cnt_lsb;
            self.prev_poc_msb = poc - header.slice_pic_order_cnt_lsb as i32;
        }

        self.curr = Some(CurrentPicture {
            pic,
            sps: sps.clone(),
            header: header.clone(),
            hash: self.pending_hash.take(),
        });
        self.last_independent_header = None;
        self.flushed = false;
        Ok(())
    }

    /// Resolve the slice's long-term entries and derive the RPS POC lists.
    fn current_rps(&mut self, header: &SliceSegmentHeader, sps: &Sps, poc: i32) -> RefPicSet {
        let max_lsb = sps.max_pic_order_cnt_lsb();
        let curr_lsb = (poc as u32) & (max_lsb - 1);

        let mut lt = Vec::with_capacity(header.long_term_refs.len());
        for e in &header.long_term_refs {
            let lt_poc = if e.has_msb {
                poc - (e.msb_cycle as i32) * max_lsb as i32 - curr_lsb as i32 + e.poc_lsb as i32
            } else {
                match self.dpb.by_poc_lsb(e.poc_lsb, max_lsb) {
                    Some(p) => p.poc,
                    None => {
                        self.push_warning(DecodeWarning::NonexistingLtReferenceCandidate);
                        e.poc_lsb as i32
                    }
                }
            };
            lt.push(LongTermEntry {
                poc: lt_poc,
                has_msb: e.has_msb,
                used_by_curr_pic: e.used_by_curr_pic,
            });
        }

        RefPicSet::derive(poc, &header.short_term_rps, &lt)
    }

    /// Initial reference lists L0/L1 (8.3.4) with optional modification.
    fn build_ref_lists(
        &mut self,
        header: &SliceSegmentHeader,
        rps: &RefPicSet,
        curr_poc: i32,
    ) -> RefLists {
        if header.slice_type.is_intra() {
            return RefLists::default();
        }

        // A picture never references itself; a stream claiming so would
        // deadlock the reconstruction on its own plane lock.
        let resolve = |pocs: &[i32]| -> Vec<Arc<Picture>> {
            pocs.iter()
                .filter(|&&p| p != curr_poc)
                .filter_map(|&p| self.dpb.by_poc(p))
                .collect()
        };

        let before = resolve(&rps.poc_st_curr_before);
        let after = resolve(&rps.poc_st_curr_after);
        let lt = resolve(&rps.poc_lt_curr);

        let mut l0_init: Vec<Arc<Picture>> = Vec::new();
        l0_init.extend(before.iter().cloned());
        l0_init.extend(after.iter().cloned());
        l0_init.extend(lt.iter().cloned());

        let mut l1_init: Vec<Arc<Picture>> = Vec::new();
        l1_init.extend(after.iter().cloned());
        l1_init.extend(before.iter().cloned());
        l1_init.extend(lt.iter().cloned());

        if l0_init.is_empty() {
            self.push_warning(DecodeWarning::FaultyReferencePictureList);
            return RefLists::default();
        }

        let pick = |init: &[Arc<Picture>], modification: &[u32], count: usize| {
            (0..count)
                .map(|i| {
                    let idx = modification
                        .get(i)
                        .map(|&m| m as usize)
                        .unwrap_or(i % init.len());
                    init[idx.min(init.len() - 1)].clone()
                })
                .collect::<Vec<_>>()
        };

        let l0 = pick(
            &l0_init,
            &header.ref_list_modification.list0,
            header.num_ref_idx_l0_active_minus1 as usize + 1,
        );
        let l1 = if header.slice_type.uses_list1() {
            pick(
                &l1_init,
                &header.ref_list_modification.list1,
                header.num_ref_idx_l1_active_minus1 as usize + 1,
            )
        } else {
            Vec::new()
        };

        RefLists { l0, l1 }
    }

    /// Complete the in-flight picture: filter rows, wait for all tasks,
    /// verify the hash, and finalize integrity.
    fn finish_current_picture(&mut self) -> Result<()> {
        let Some(curr) = self.curr.take() else {
            return Ok(());
        };

        // Wait for the slice decoding tasks, then release any progress cell
        // a truncated slice left behind so the filters cannot stall.
        curr.pic.wait_for_completion();
        for addr in 0..curr.sps.pic_size_in_ctbs() {
            curr.pic
                .progress_at(addr)
                .advance(crate::picture::CtbProgress::PredictionDone);
        }

        for row in 0..curr.sps.pic_height_in_ctbs() {
            self.pool.submit(Task::FilterCtbRow(Box::new(FilterTask {
                pic: curr.pic.clone(),
                sps: curr.sps.clone(),
                header: curr.header.clone(),
                kernels: self.kernels,
                row,
            })));
        }

        curr.pic.wait_for_completion();
        self.collect_task_warnings();

        if curr.pic.integrity() == Integrity::NotDecoded {
            curr.pic.set_integrity(Integrity::Decoded);
        }

        if self.config.check_sei_hash {
            if let Some(hash) = curr.hash.as_ref() {
                let planes = curr.pic.planes();
                match sei::verify_picture_hash(&planes, hash) {
                    Ok(None) => {}
                    Ok(Some(warning)) => self.push_warning(warning),
                    Err(e) => {
                        drop(planes);
                        curr.pic.set_integrity(Integrity::DecodingErrors);
                        return Err(e);
                    }
                }
            }
        }

        self.last_independent_header = None;
        debug!(poc = curr.pic.poc, "picture finished");
        Ok(())
    }
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.pool.drain_queue();
        self.release_all_progress();
        self.pool.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::tests::{build_pps_rbsp, build_sps_rbsp};
    use pretty_assertions::assert_eq;
    use vireo_core::bitstream::{insert_emulation_prevention, BitWriter};

    /// Wrap an RBSP into an Annex-B NAL unit with a 4-byte start code.
    pub(crate) fn annexb_nal(nal_type: u8, rbsp: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x00, 0x01];
        out.push(nal_type << 1);
        out.push(0x01); // layer 0, temporal_id_plus1 = 1
        out.extend(insert_emulation_prevention(rbsp));
        out
    }

    /// Build a minimal VPS RBSP.
    pub(crate) fn build_vps_rbsp() -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write_bits(0, 4); // vps_video_parameter_set_id
        w.write_bits(3, 2); // base layer internal/available
        w.write_bits(0, 6); // vps_max_layers_minus1
        w.write_bits(0, 3); // vps_max_sub_layers_minus1
        w.write_bit(true); // vps_temporal_id_nesting_flag
        w.write_bits(0xFFFF, 16); // reserved

        // profile_tier_level
        w.write_bits(0, 2);
        w.write_bit(false);
        w.write_bits(1, 5);
        w.write_bits(0, 32);
        w.write_bit(true);
        w.write_bit(false);
        w.write_bits(0, 2);
        w.write_bits(0, 32);
        w.write_bits(0, 12);
        w.write_bits(120, 8);

        w.write_bit(true); // vps_sub_layer_ordering_info_present_flag
        w.write_ue(4); // vps_max_dec_pic_buffering_minus1
        w.write_ue(2); // vps_max_num_reorder_pics
        w.write_ue(0); // vps_max_latency_increase_plus1
        w.write_bits(0, 6); // vps_max_layer_id
        w.write_ue(0); // vps_num_layer_sets_minus1
        w.write_bit(false); // vps_timing_info_present_flag
        w.write_bit(false); // vps_extension_flag
        w.write_rbsp_trailing_bits();
        w.into_data()
    }

    /// IDR slice header followed by arbitrary slice payload bytes.
    fn idr_slice_rbsp(payload: &[u8]) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.write_bit(true); // first_slice_segment_in_pic_flag
        w.write_bit(false); // no_output_of_prior_pics_flag
        w.write_ue(0); // slice_pic_parameter_set_id
        w.write_ue(2); // slice_type = I
        w.write_se(0); // slice_qp_delta
        w.write_bit(true); // slice_loop_filter_across_slices_enabled_flag
        w.write_bit(true); // byte_alignment: stop bit
        w.align_to_byte();
        let mut rbsp = w.into_data();
        rbsp.extend_from_slice(payload);
        rbsp
    }

    fn feed_parameter_sets(dec: &mut Decoder, width: u32, height: u32) {
        dec.push_data(&annexb_nal(32, &build_vps_rbsp()), 0, None).unwrap();
        dec.push_data(&annexb_nal(33, &build_sps_rbsp(width, height, 6)), 0, None)
            .unwrap();
        dec.push_data(&annexb_nal(34, &build_pps_rbsp(0, 0)), 0, None)
            .unwrap();
    }

    #[test]
    fn test_decode_waits_for_input() {
        let mut dec = Decoder::new();
        assert!(matches!(
            dec.decode(),
            Err(DecodeError::WaitingForInputData)
        ));
    }

    #[test]
    fn test_parameter_sets_are_stored() {
        let mut dec = Decoder::new();
        feed_parameter_sets(&mut dec, 128, 64);
        dec.flush_data();

        while dec.decode().unwrap() {}
        assert!(dec.params.vps(0).is_some());
        assert!(dec.params.sps(0).is_some());
        assert!(dec.params.pps(0).is_some());
        assert!(dec.get_warning().is_none());
    }

    #[test]
    fn test_nonexisting_pps_reference_drops_slice() {
        let mut dec = Decoder::new();
        feed_parameter_sets(&mut dec, 128, 64);

        // A slice referencing PPS id 63, which was never sent.
        let mut w = BitWriter::new();
        w.write_bit(true); // first_slice_segment_in_pic_flag
        w.write_bit(false); // no_output_of_prior_pics_flag
        w.write_ue(63); // slice_pic_parameter_set_id
        w.write_rbsp_trailing_bits();
        dec.push_data(&annexb_nal(19, &w.into_data()), 0, None).unwrap();
        dec.flush_data();

        while dec.decode().unwrap() {}
        assert_eq!(
            dec.get_warning(),
            Some(DecodeWarning::NonexistingPpsReferenced)
        );
        // No picture was started for the dropped slice.
        assert_eq!(dec.pictures_in_output_queue(), 0);
    }

    #[test]
    fn test_idr_decode_produces_picture() {
        let mut dec = Decoder::new();
        feed_parameter_sets(&mut dec, 128, 64);
        dec.push_data(
            &annexb_nal(19, &idr_slice_rbsp(&[0x5A, 0x33, 0x77, 0x12, 0x9C, 0x04])),
            9000,
            None,
        )
        .unwrap();
        dec.flush_data();

        while dec.decode().unwrap() {}

        let pic = dec.get_next_picture().expect("one picture decoded");
        assert_eq!(pic.poc, 0);
        assert_eq!(pic.spec.width, 128);
        assert_eq!(pic.spec.height, 64);
        assert_eq!(pic.pts, 9000);
        assert_eq!(pic.integrity(), Integrity::Decoded);
        assert!(dec.get_next_picture().is_none());

        // Every CTB finished the full filter pipeline.
        for cy in 0..pic.ctbs_h() {
            for cx in 0..pic.ctbs_w() {
                assert_eq!(
                    pic.progress(cx as i32, cy as i32).get(),
                    crate::picture::CtbProgress::SaoComplete
                );
            }
        }
    }

    #[test]
    fn test_reset_then_same_input_is_identical() {
        let payload = [0x5A, 0x33, 0x77, 0x12, 0x9C, 0x04, 0xF0, 0x0D];

        let run = |dec: &mut Decoder| -> Vec<u8> {
            feed_parameter_sets(dec, 128, 64);
            dec.push_data(&annexb_nal(19, &idr_slice_rbsp(&payload)), 0, None)
                .unwrap();
            dec.flush_data();
            while dec.decode().unwrap() {}
            let pic = dec.get_next_picture().unwrap();
            let planes = pic.planes();
            planes.plane(0).data().to_vec()
        };

        let mut dec = Decoder::new();
        let first = run(&mut dec);
        dec.reset();
        let second = run(&mut dec);
        assert_eq!(first, second);
    }

    #[test]
    fn test_suppress_faulty_pictures() {
        let mut dec = Decoder::new();
        dec.set_suppress_faulty_pictures(true);
        feed_parameter_sets(&mut dec, 128, 64);
        dec.push_data(&annexb_nal(19, &idr_slice_rbsp(&[0x11, 0x22])), 0, None)
            .unwrap();
        dec.flush_data();
        while dec.decode().unwrap() {}

        // Force the decoded picture into an error state before output.
        if let Some(pic) = dec.dpb.peek_output() {
            pic.set_integrity(Integrity::DecodingErrors);
        }
        assert!(dec.get_next_picture().is_none());

        // Without suppression the same picture is returned.
        dec.set_suppress_faulty_pictures(false);
        dec.reset();
        feed_parameter_sets(&mut dec, 128, 64);
        dec.push_data(&annexb_nal(19, &idr_slice_rbsp(&[0x11, 0x22])), 0, None)
            .unwrap();
        dec.flush_data();
        while dec.decode().unwrap() {}
        if let Some(pic) = dec.dpb.peek_output() {
            pic.set_integrity(Integrity::DecodingErrors);
        }
        assert!(dec.get_next_picture().is_some());
    }

    #[test]
    fn test_get_equals_peek_then_release() {
        let mut dec = Decoder::new();
        feed_parameter_sets(&mut dec, 128, 64);
        dec.push_data(&annexb_nal(19, &idr_slice_rbsp(&[0x42])), 0, None)
            .unwrap();
        dec.flush_data();
        while dec.decode().unwrap() {}

        let peeked = dec.peek_next_picture().unwrap();
        dec.release_next_picture();
        assert!(dec.peek_next_picture().is_none());
        assert_eq!(peeked.poc, 0);
    }

    #[test]
    fn test_poc_wrap_sequences() {
        // Drive the MSB wrap rule directly over several LSB sequences.
        let mut dec = Decoder::new();
        let sps = Arc::new(Sps::parse(&build_sps_rbsp(64, 64, 6)).unwrap());
        let max_lsb = sps.max_pic_order_cnt_lsb() as i32;
        assert_eq!(max_lsb, 256);

        // Ascending LSBs that wrap past the midpoint.
        let lsb_sequence = [0u32, 100, 200, 40, 140, 250, 90];
        let mut expected = Vec::new();
        let mut msb = 0i32;
        let mut prev = 0i32;
        for &lsb in &lsb_sequence[1..] {
            let lsb = lsb as i32;
            if lsb < prev && prev - lsb >= max_lsb / 2 {
                msb += max_lsb;
            } else if lsb > prev && lsb - prev > max_lsb / 2 {
                msb -= max_lsb;
            }
            expected.push(msb + lsb);
            prev = lsb;
        }
        assert_eq!(expected, vec![100, 200, 296, 396, 506, 602]);

        // The decoder's derivation must agree.
        dec.prev_poc_lsb = 0;
        dec.prev_poc_msb = 0;
        for (&lsb, &want) in lsb_sequence[1..].iter().zip(expected.iter()) {
            let prev_lsb = dec.prev_poc_lsb as i32;
            let lsb_i = lsb as i32;
            let msb = if lsb_i < prev_lsb && (prev_lsb - lsb_i) >= max_lsb / 2 {
                dec.prev_poc_msb + max_lsb
            } else if lsb_i > prev_lsb && (lsb_i - prev_lsb) > max_lsb / 2 {
                dec.prev_poc_msb - max_lsb
            } else {
                dec.prev_poc_msb
            };
            let poc = msb + lsb_i;
            assert_eq!(poc, want);
            dec.prev_poc_lsb = lsb;
            dec.prev_poc_msb = msb;
        }
    }

    #[test]
    fn test_warning_queue_bounded() {
        let mut dec = Decoder::new();
        for _ in 0..40 {
            dec.push_warning(DecodeWarning::SpsHeaderInvalid);
        }
        let mut count = 0;
        let mut saw_overflow = false;
        while let Some(w) = dec.get_warning() {
            count += 1;
            saw_overflow |= w == DecodeWarning::WarningBufferFull;
        }
        assert!(count <= MAX_WARNINGS + 1);
        assert!(saw_overflow);
    }
}
