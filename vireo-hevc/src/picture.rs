//! Decoded pictures: pixel planes, lifecycle state, per-CTB progress.
//!
//! A [`Picture`] is shared between the slice decoding tasks writing into it,
//! the motion compensation of later pictures reading from it, and the DPB's
//! output queue. Pixel planes sit behind a `RwLock`; fine-grained ordering
//! between tasks goes through the per-CTB [`ProgressCell`]s, which advance
//! monotonically and broadcast on every change.

use crate::error::{DecodeError, Result};
use crate::nal::{NalUnitType, UserData};
use crate::param::Sps;
use crate::sao::SaoCtbParams;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU8, Ordering};
use vireo_core::image::{ChromaFormat, ImageBuffer, ImageSpec, SharedAllocation};

/// Per-CTB reconstruction progress, advanced monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CtbProgress {
    /// Nothing decoded yet.
    None = 0,
    /// Prediction and residual reconstruction finished.
    PredictionDone = 1,
    /// Vertical deblocking pass applied.
    DeblockingVPass = 2,
    /// Horizontal deblocking pass applied.
    DeblockingHPass = 3,
    /// SAO applied; samples are final.
    SaoComplete = 4,
}

/// Reference state of a picture in the DPB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PictureState {
    /// Not used as a reference; may be evicted once output.
    UnusedForReference,
    /// Short-term reference.
    ShortTerm,
    /// Long-term reference.
    LongTerm,
}

/// Decode integrity of a picture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Integrity {
    /// Decoding has not finished.
    NotDecoded = 0,
    /// Fully decoded without errors.
    Decoded = 1,
    /// Errors occurred while decoding this picture.
    DecodingErrors = 2,
    /// Decoded from references that had errors.
    DerivedFromErrors = 3,
}

impl Integrity {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Decoded,
            2 => Self::DecodingErrors,
            3 => Self::DerivedFromErrors,
            _ => Self::NotDecoded,
        }
    }
}

/// One progress counter plus its condition variable.
#[derive(Default)]
pub struct ProgressCell {
    state: Mutex<u8>,
    cond: Condvar,
}

impl ProgressCell {
    /// Current progress.
    pub fn get(&self) -> CtbProgress {
        match *self.state.lock() {
            0 => CtbProgress::None,
            1 => CtbProgress::PredictionDone,
            2 => CtbProgress::DeblockingVPass,
            3 => CtbProgress::DeblockingHPass,
            _ => CtbProgress::SaoComplete,
        }
    }

    /// Advance to `value` if it is ahead of the current state.
    pub fn advance(&self, value: CtbProgress) {
        let mut state = self.state.lock();
        if value as u8 > *state {
            *state = value as u8;
            self.cond.notify_all();
        }
    }

    /// Block until progress reaches at least `value`.
    pub fn wait_for(&self, value: CtbProgress) {
        let mut state = self.state.lock();
        while *state < value as u8 {
            self.cond.wait(&mut state);
        }
    }
}

/// A motion vector in quarter-sample units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MotionVector {
    /// Horizontal component.
    pub x: i16,
    /// Vertical component.
    pub y: i16,
}

impl MotionVector {
    /// The zero vector.
    pub const ZERO: Self = Self { x: 0, y: 0 };

    /// Create a new vector.
    pub fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }

    /// Whether both components are zero.
    pub fn is_zero(&self) -> bool {
        self.x == 0 && self.y == 0
    }
}

/// Motion information of one 4x4 luma block.
#[derive(Debug, Clone, Copy, Default)]
pub struct MvInfo {
    /// Motion vectors for list 0 and list 1.
    pub mv: [MotionVector; 2],
    /// POC of the referenced picture per list.
    pub ref_poc: [i32; 2],
    /// Which lists are used.
    pub pred_flag: [bool; 2],
    /// Block was intra coded (no motion data).
    pub intra: bool,
}

impl MvInfo {
    /// Whether any list predicts this block.
    pub fn is_inter(&self) -> bool {
        !self.intra && (self.pred_flag[0] || self.pred_flag[1])
    }
}

/// Per-picture decode metadata, partitioned by CTB and 4x4 block grids.
#[derive(Debug)]
pub struct PictureMeta {
    /// Slice address (raster CTB address of the slice's first CTB) per CTB;
    /// -1 while undecoded.
    pub ctb_slice_addr: Vec<i32>,
    /// SAO parameters per CTB.
    pub ctb_sao: Vec<SaoCtbParams>,
    /// QP per 4x4 luma block (for deblocking).
    pub qp_y: Vec<i8>,
    /// Motion info per 4x4 luma block.
    pub mv: Vec<MvInfo>,
    /// Vertical-edge boundary strengths per 4x4 block.
    pub bs_v: Vec<u8>,
    /// Horizontal-edge boundary strengths per 4x4 block.
    pub bs_h: Vec<u8>,
    /// Intra prediction mode per 4x4 luma block (255 = none).
    pub intra_mode: Vec<u8>,
    /// Coding-quadtree depth per 4x4 luma block.
    pub ct_depth: Vec<u8>,
    /// cu_skip_flag per 4x4 luma block.
    pub skip: Vec<bool>,
    /// Coded luma residual per 4x4 transform block.
    pub cbf_luma: Vec<bool>,
}

impl PictureMeta {
    fn new(sps: &Sps) -> Self {
        let ctbs = sps.pic_size_in_ctbs() as usize;
        let w4 = (sps.pic_width_in_luma_samples.div_ceil(4)) as usize;
        let h4 = (sps.pic_height_in_luma_samples.div_ceil(4)) as usize;
        Self {
            ctb_slice_addr: vec![-1; ctbs],
            ctb_sao: vec![SaoCtbParams::default(); ctbs],
            qp_y: vec![0; w4 * h4],
            mv: vec![MvInfo::default(); w4 * h4],
            bs_v: vec![0; w4 * h4],
            bs_h: vec![0; w4 * h4],
            intra_mode: vec![255; w4 * h4],
            ct_depth: vec![0; w4 * h4],
            skip: vec![false; w4 * h4],
            cbf_luma: vec![false; w4 * h4],
        }
    }
}

/// A decoded (or in-flight) picture.
pub struct Picture {
    /// Allocation spec of the planes.
    pub spec: ImageSpec,
    /// Picture order count.
    pub poc: i32,
    /// NAL unit type of the picture's slices.
    pub nal_unit_type: NalUnitType,
    /// Layer id.
    pub layer_id: u8,
    /// Temporal sub-layer.
    pub temporal_id: u8,
    /// Presentation timestamp.
    pub pts: i64,
    /// Host user data.
    pub user_data: UserData,
    /// Picture should be output (from the slice header).
    pub output_flag: bool,

    planes: RwLock<ImageBuffer>,
    meta: RwLock<PictureMeta>,
    ref_state: Mutex<PictureState>,
    integrity: AtomicU8,

    ctbs_w: u32,
    ctbs_h: u32,
    progress: Vec<ProgressCell>,

    tasks_pending: Mutex<u32>,
    finished: Condvar,
}

impl Picture {
    /// Allocate a picture for the given SPS geometry.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sps: &Sps,
        alloc: &SharedAllocation,
        poc: i32,
        nal_unit_type: NalUnitType,
        layer_id: u8,
        temporal_id: u8,
        pts: i64,
        user_data: UserData,
        output_flag: bool,
    ) -> Result<Self> {
        let spec = ImageSpec {
            width: sps.pic_width_in_luma_samples,
            height: sps.pic_height_in_luma_samples,
            chroma: sps.chroma_format,
            bit_depth_luma: sps.bit_depth_luma,
            bit_depth_chroma: sps.bit_depth_chroma,
            alignment: vireo_core::image::STRIDE_ALIGNMENT,
        };
        let buffer = alloc
            .get_buffer(&spec)
            .map_err(|_| DecodeError::OutOfMemory)?;

        let ctbs_w = sps.pic_width_in_ctbs();
        let ctbs_h = sps.pic_height_in_ctbs();
        let mut progress = Vec::with_capacity((ctbs_w * ctbs_h) as usize);
        progress.resize_with((ctbs_w * ctbs_h) as usize, ProgressCell::default);

        Ok(Self {
            spec,
            poc,
            nal_unit_type,
            layer_id,
            temporal_id,
            pts,
            user_data,
            output_flag,
            planes: RwLock::new(buffer),
            meta: RwLock::new(PictureMeta::new(sps)),
            ref_state: Mutex::new(PictureState::UnusedForReference),
            integrity: AtomicU8::new(Integrity::NotDecoded as u8),
            ctbs_w,
            ctbs_h,
            progress,
            tasks_pending: Mutex::new(0),
            finished: Condvar::new(),
        })
    }

    /// Picture width in CTBs.
    pub fn ctbs_w(&self) -> u32 {
        self.ctbs_w
    }

    /// Picture height in CTBs.
    pub fn ctbs_h(&self) -> u32 {
        self.ctbs_h
    }

    /// Chroma format shorthand.
    pub fn chroma(&self) -> ChromaFormat {
        self.spec.chroma
    }

    /// Read access to the pixel planes.
    pub fn planes(&self) -> parking_lot::RwLockReadGuard<'_, ImageBuffer> {
        self.planes.read()
    }

    /// Write access to the pixel planes.
    pub fn planes_mut(&self) -> parking_lot::RwLockWriteGuard<'_, ImageBuffer> {
        self.planes.write()
    }

    /// Read access to decode metadata.
    pub fn meta(&self) -> parking_lot::RwLockReadGuard<'_, PictureMeta> {
        self.meta.read()
    }

    /// Write access to decode metadata.
    pub fn meta_mut(&self) -> parking_lot::RwLockWriteGuard<'_, PictureMeta> {
        self.meta.write()
    }

    /// Reference state.
    pub fn ref_state(&self) -> PictureState {
        *self.ref_state.lock()
    }

    /// Update the reference state.
    pub fn set_ref_state(&self, state: PictureState) {
        *self.ref_state.lock() = state;
    }

    /// Decode integrity.
    pub fn integrity(&self) -> Integrity {
        Integrity::from_u8(self.integrity.load(Ordering::Acquire))
    }

    /// Update integrity; only ever degrades or completes, never resets.
    pub fn set_integrity(&self, integrity: Integrity) {
        self.integrity.store(integrity as u8, Ordering::Release);
    }

    /// Progress cell of the CTB at `(cx, cy)` (clamped into the picture).
    pub fn progress(&self, cx: i32, cy: i32) -> &ProgressCell {
        let cx = cx.clamp(0, self.ctbs_w as i32 - 1) as u32;
        let cy = cy.clamp(0, self.ctbs_h as i32 - 1) as u32;
        &self.progress[(cy * self.ctbs_w + cx) as usize]
    }

    /// Progress cell by raster CTB address.
    pub fn progress_at(&self, ctb_addr: u32) -> &ProgressCell {
        &self.progress[ctb_addr as usize]
    }

    /// Register a task targeting this picture.
    pub fn add_task(&self) {
        *self.tasks_pending.lock() += 1;
    }

    /// Mark one task finished; broadcasts when the count reaches zero.
    pub fn finish_task(&self) {
        let mut pending = self.tasks_pending.lock();
        debug_assert!(*pending > 0);
        *pending -= 1;
        if *pending == 0 {
            self.finished.notify_all();
        }
    }

    /// Number of unfinished tasks.
    pub fn tasks_pending(&self) -> u32 {
        *self.tasks_pending.lock()
    }

    /// Block until every registered task has finished.
    pub fn wait_for_completion(&self) {
        let mut pending = self.tasks_pending.lock();
        while *pending > 0 {
            self.finished.wait(&mut pending);
        }
    }
}

impl std::fmt::Debug for Picture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Picture")
            .field("poc", &self.poc)
            .field("size", &(self.spec.width, self.spec.height))
            .field("ref_state", &self.ref_state())
            .field("integrity", &self.integrity())
            .field("output_flag", &self.output_flag)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::tests::build_sps_rbsp;
    use std::sync::Arc;
    use vireo_core::image::DefaultAllocation;

    fn test_picture(poc: i32) -> Picture {
        let sps = Sps::parse(&build_sps_rbsp(128, 64, 6)).unwrap();
        let alloc: SharedAllocation = Arc::new(DefaultAllocation);
        Picture::new(
            &sps,
            &alloc,
            poc,
            NalUnitType::IdrWRadl,
            0,
            0,
            0,
            None,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_picture_geometry() {
        let pic = test_picture(0);
        assert_eq!(pic.ctbs_w(), 2);
        assert_eq!(pic.ctbs_h(), 1);
        assert_eq!(pic.planes().num_planes(), 3);
    }

    #[test]
    fn test_progress_monotonic() {
        let pic = test_picture(0);
        let cell = pic.progress(0, 0);
        assert_eq!(cell.get(), CtbProgress::None);

        cell.advance(CtbProgress::DeblockingVPass);
        assert_eq!(cell.get(), CtbProgress::DeblockingVPass);

        // Never goes backwards.
        cell.advance(CtbProgress::PredictionDone);
        assert_eq!(cell.get(), CtbProgress::DeblockingVPass);

        cell.advance(CtbProgress::SaoComplete);
        assert_eq!(cell.get(), CtbProgress::SaoComplete);
    }

    #[test]
    fn test_progress_clamping() {
        let pic = test_picture(0);
        // Out-of-picture coordinates clamp to the border CTB.
        pic.progress(-5, -5).advance(CtbProgress::SaoComplete);
        assert_eq!(pic.progress(0, 0).get(), CtbProgress::SaoComplete);
    }

    #[test]
    fn test_task_counting_and_wait() {
        let pic = Arc::new(test_picture(0));
        pic.add_task();
        pic.add_task();
        assert_eq!(pic.tasks_pending(), 2);

        let p2 = pic.clone();
        let handle = std::thread::spawn(move || {
            p2.finish_task();
            p2.finish_task();
        });

        pic.wait_for_completion();
        handle.join().unwrap();
        assert_eq!(pic.tasks_pending(), 0);
    }

    #[test]
    fn test_wait_for_progress_cross_thread() {
        let pic = Arc::new(test_picture(0));
        let p2 = pic.clone();
        let waiter = std::thread::spawn(move || {
            p2.progress(1, 0).wait_for(CtbProgress::PredictionDone);
            p2.progress(1, 0).get()
        });

        std::thread::sleep(std::time::Duration::from_millis(10));
        pic.progress(1, 0).advance(CtbProgress::PredictionDone);
        assert!(waiter.join().unwrap() >= CtbProgress::PredictionDone);
    }

    #[test]
    fn test_integrity_transitions() {
        let pic = test_picture(0);
        assert_eq!(pic.integrity(), Integrity::NotDecoded);
        pic.set_integrity(Integrity::DecodingErrors);
        assert_eq!(pic.integrity(), Integrity::DecodingErrors);
    }
}
