//! Decoded picture buffer and output reordering.
//!
//! The DPB is a slot arena: pictures keep their slot until they are neither
//! referenced, nor awaiting output, nor targeted by pending tasks. Output
//! ordering is POC-ascending; when the buffer is full the smallest-POC
//! output-eligible picture is bumped to the output queue, and end of stream
//! bumps everything still eligible.

use crate::error::{DecodeError, Result};
use crate::picture::{Picture, PictureState};
use crate::refpic::RefPicSet;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

struct Slot {
    pic: Arc<Picture>,
    /// Picture still has to be handed to the output queue.
    output_pending: bool,
}

/// The decoded picture buffer.
pub struct Dpb {
    slots: Vec<Option<Slot>>,
    output_queue: VecDeque<Arc<Picture>>,
    capacity: usize,
}

impl Dpb {
    /// Create a DPB with the given capacity (`sps_max_dec_pic_buffering + 1`).
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            output_queue: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Adjust the capacity on SPS activation.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    /// Current DPB capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether the arena holds no pictures.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a picture by exact POC.
    pub fn by_poc(&self, poc: i32) -> Option<Arc<Picture>> {
        self.slots
            .iter()
            .flatten()
            .find(|s| s.pic.poc == poc)
            .map(|s| s.pic.clone())
    }

    /// Look up a picture by POC LSB (for long-term references without MSB).
    pub fn by_poc_lsb(&self, lsb: u32, max_lsb: u32) -> Option<Arc<Picture>> {
        self.slots
            .iter()
            .flatten()
            .find(|s| (s.pic.poc as u32) % max_lsb == lsb)
            .map(|s| s.pic.clone())
    }

    /// Apply a reference picture set: mark members short/long-term and
    /// everything else unused. Returns the POCs named by the set but absent
    /// from the buffer.
    pub fn apply_ref_pic_set(&mut self, rps: &RefPicSet) -> Vec<i32> {
        let mut missing = Vec::new();

        for slot in self.slots.iter().flatten() {
            let poc = slot.pic.poc;
            let in_st = rps.poc_st_curr_before.contains(&poc)
                || rps.poc_st_curr_after.contains(&poc)
                || rps.poc_st_foll.contains(&poc);
            let in_lt = rps.is_long_term(poc);

            let state = if in_lt {
                PictureState::LongTerm
            } else if in_st {
                PictureState::ShortTerm
            } else {
                PictureState::UnusedForReference
            };
            slot.pic.set_ref_state(state);
        }

        for poc in rps.all_pocs() {
            if self.by_poc(poc).is_none() {
                missing.push(poc);
            }
        }

        missing
    }

    /// Mark every picture unused for reference (IDR boundary).
    pub fn mark_all_unused(&mut self) {
        for slot in self.slots.iter().flatten() {
            slot.pic.set_ref_state(PictureState::UnusedForReference);
        }
    }

    /// Drop all output-pending flags without emitting pictures
    /// (`no_output_of_prior_pics_flag`).
    pub fn discard_pending_output(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.output_pending = false;
        }
        self.free_unreferenced();
    }

    /// Insert a new picture, bumping and evicting as needed.
    pub fn insert(&mut self, pic: Arc<Picture>) -> Result<()> {
        self.free_unreferenced();

        while self.len() >= self.capacity {
            if !self.bump_one() {
                return Err(DecodeError::ImageBufferFull);
            }
            self.free_unreferenced();
        }

        let slot = Slot {
            output_pending: pic.output_flag,
            pic,
        };
        trace!(poc = slot.pic.poc, "DPB insert");

        if let Some(free) = self.slots.iter_mut().find(|s| s.is_none()) {
            *free = Some(slot);
        } else {
            self.slots.push(Some(slot));
        }
        Ok(())
    }

    /// Free every slot whose picture is unreferenced, output (or not
    /// wanted), and idle.
    fn free_unreferenced(&mut self) {
        for entry in self.slots.iter_mut() {
            if let Some(slot) = entry {
                let freeable = slot.pic.ref_state() == PictureState::UnusedForReference
                    && !slot.output_pending
                    && slot.pic.tasks_pending() == 0;
                if freeable {
                    debug!(poc = slot.pic.poc, "DPB evict");
                    *entry = None;
                }
            }
        }
    }

    /// Bump the smallest-POC output-pending picture to the output queue.
    ///
    /// Returns false when nothing is eligible.
    pub fn bump_one(&mut self) -> bool {
        let candidate = self
            .slots
            .iter_mut()
            .flatten()
            .filter(|s| s.output_pending)
            .min_by_key(|s| s.pic.poc);

        match candidate {
            Some(slot) => {
                slot.output_pending = false;
                debug!(poc = slot.pic.poc, "DPB bump to output");
                self.output_queue.push_back(slot.pic.clone());
                true
            }
            None => false,
        }
    }

    /// Bump all output-eligible pictures in POC order (end of stream).
    pub fn flush(&mut self) {
        while self.bump_one() {}
        self.free_unreferenced();
    }

    /// Head of the output queue, if any.
    pub fn peek_output(&self) -> Option<Arc<Picture>> {
        self.output_queue.front().cloned()
    }

    /// Remove the head of the output queue.
    pub fn pop_output(&mut self) -> Option<Arc<Picture>> {
        let pic = self.output_queue.pop_front();
        self.free_unreferenced();
        pic
    }

    /// Remove a picture from the output queue without returning it.
    pub fn release_output(&mut self) {
        self.pop_output();
    }

    /// Number of pictures waiting in the output queue.
    pub fn output_len(&self) -> usize {
        self.output_queue.len()
    }

    /// Drop everything (decoder reset).
    pub fn clear(&mut self) {
        self.slots.clear();
        self.output_queue.clear();
    }

    /// Iterate over all held pictures.
    pub fn pictures(&self) -> impl Iterator<Item = &Arc<Picture>> {
        self.slots.iter().flatten().map(|s| &s.pic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::NalUnitType;
    use crate::param::tests::build_sps_rbsp;
    use crate::param::Sps;
    use crate::refpic::ShortTermRefPicSet;
    use vireo_core::image::{DefaultAllocation, SharedAllocation};

    fn make_pic(poc: i32, output: bool) -> Arc<Picture> {
        let sps = Sps::parse(&build_sps_rbsp(64, 64, 6)).unwrap();
        let alloc: SharedAllocation = Arc::new(DefaultAllocation);
        Arc::new(
            Picture::new(
                &sps,
                &alloc,
                poc,
                NalUnitType::TrailR,
                0,
                0,
                0,
                None,
                output,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut dpb = Dpb::new(4);
        dpb.insert(make_pic(0, true)).unwrap();
        dpb.insert(make_pic(4, true)).unwrap();

        assert_eq!(dpb.len(), 2);
        assert!(dpb.by_poc(0).is_some());
        assert!(dpb.by_poc(4).is_some());
        assert!(dpb.by_poc(2).is_none());
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let mut dpb = Dpb::new(3);
        for poc in 0..10 {
            dpb.insert(make_pic(poc, true)).unwrap();
            assert!(dpb.len() <= 3, "len {} at poc {poc}", dpb.len());
        }
    }

    #[test]
    fn test_output_order_is_poc_ascending() {
        let mut dpb = Dpb::new(8);
        // Decode order differs from display order.
        for &poc in &[4, 2, 0, 3, 1] {
            dpb.insert(make_pic(poc, true)).unwrap();
        }
        dpb.flush();

        let mut last = i32::MIN;
        while let Some(pic) = dpb.pop_output() {
            assert!(pic.poc > last, "POC {} after {}", pic.poc, last);
            last = pic.poc;
        }
        assert_eq!(last, 4);
    }

    #[test]
    fn test_referenced_pictures_not_evicted() {
        let mut dpb = Dpb::new(2);
        let p0 = make_pic(0, false);
        p0.set_ref_state(PictureState::ShortTerm);
        dpb.insert(p0.clone()).unwrap();
        dpb.insert(make_pic(1, false)).unwrap();

        // Unreferenced non-output picture 1 is evictable, picture 0 stays.
        dpb.insert(make_pic(2, false)).unwrap();
        assert!(dpb.by_poc(0).is_some());
    }

    #[test]
    fn test_pending_tasks_block_eviction() {
        let mut dpb = Dpb::new(2);
        let p0 = make_pic(0, false);
        p0.add_task();
        dpb.insert(p0.clone()).unwrap();

        dpb.insert(make_pic(1, false)).unwrap();
        dpb.insert(make_pic(2, false)).unwrap();
        assert!(dpb.by_poc(0).is_some(), "picture with pending task survives");

        p0.finish_task();
        dpb.insert(make_pic(3, false)).unwrap();
        assert!(dpb.by_poc(0).is_none(), "idle unreferenced picture is freed");
    }

    #[test]
    fn test_full_dpb_with_no_bumpable_picture_errors() {
        let mut dpb = Dpb::new(1);
        let p = make_pic(0, false);
        p.set_ref_state(PictureState::ShortTerm);
        dpb.insert(p).unwrap();

        let err = dpb.insert(make_pic(1, false)).unwrap_err();
        assert!(matches!(err, DecodeError::ImageBufferFull));
    }

    #[test]
    fn test_apply_ref_pic_set_marks_and_reports_missing() {
        let mut dpb = Dpb::new(8);
        dpb.insert(make_pic(0, false)).unwrap();
        dpb.insert(make_pic(2, false)).unwrap();

        let st = ShortTermRefPicSet {
            delta_poc_s0: vec![-1, -3],
            used_by_curr_pic_s0: vec![true, true],
            ..Default::default()
        };
        let rps = RefPicSet::derive(3, &st, &[]);

        let missing = dpb.apply_ref_pic_set(&rps);
        assert_eq!(missing, vec![1]);
        assert_eq!(dpb.by_poc(2).unwrap().ref_state(), PictureState::ShortTerm);
        assert_eq!(
            dpb.by_poc(0).unwrap().ref_state(),
            PictureState::UnusedForReference
        );
    }

    #[test]
    fn test_discard_pending_output() {
        let mut dpb = Dpb::new(4);
        dpb.insert(make_pic(0, true)).unwrap();
        dpb.insert(make_pic(1, true)).unwrap();

        dpb.discard_pending_output();
        dpb.flush();
        assert_eq!(dpb.output_len(), 0);
    }

    #[test]
    fn test_peek_then_pop_equals_pop() {
        let mut dpb = Dpb::new(4);
        dpb.insert(make_pic(7, true)).unwrap();
        dpb.flush();

        let peeked = dpb.peek_output().unwrap();
        let popped = dpb.pop_output().unwrap();
        assert!(Arc::ptr_eq(&peeked, &popped));
        assert!(dpb.peek_output().is_none());
    }
}
