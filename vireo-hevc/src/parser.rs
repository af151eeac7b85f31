//! Push-based NAL unit assembly.
//!
//! The [`NalParser`] turns an append-only Annex-B byte stream into a queue
//! of complete [`NalUnit`]s. Input may be split at arbitrary byte positions;
//! a unit is finalized when the start code of the following unit (or an
//! explicit flush) delimits it. Each finalized unit carries the presentation
//! timestamp of the push that contributed its first byte.

use crate::error::Result;
use crate::nal::{NalUnit, NalUnitHeader, UserData};
use std::collections::VecDeque;
use tracing::trace;
use vireo_core::bitstream::{find_start_code, strip_emulation_prevention};

/// Timestamp marker: byte offset into the pending buffer where a push began.
struct PtsMarker {
    offset: usize,
    pts: i64,
    user_data: UserData,
}

/// Incremental Annex-B NAL unit parser and queue.
#[derive(Default)]
pub struct NalParser {
    /// Raw bytes not yet emitted as units.
    pending: Vec<u8>,
    /// Resume position for start-code scanning.
    scan_pos: usize,
    /// Whether `pending[0]` is the first byte of an in-progress unit
    /// (i.e. the opening start code has already been consumed).
    in_unit: bool,
    /// Timestamps attached to pushed byte ranges.
    markers: Vec<PtsMarker>,
    /// Finalized units awaiting `pop`.
    queue: VecDeque<NalUnit>,
    /// End-of-stream sentinel.
    end_of_stream: bool,
}

impl NalParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append Annex-B bytes and scan for completed units.
    pub fn push_data(&mut self, data: &[u8], pts: i64, user_data: UserData) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        self.markers.push(PtsMarker {
            offset: self.pending.len(),
            pts,
            user_data,
        });
        self.pending.extend_from_slice(data);
        self.scan();
        Ok(())
    }

    /// Enqueue one complete NAL unit (no start code framing).
    pub fn push_nal(&mut self, data: &[u8], pts: i64, user_data: UserData) -> Result<()> {
        self.finalize_unit(data, pts, user_data);
        Ok(())
    }

    /// Finalize any pending partial unit.
    pub fn flush_data(&mut self) {
        if self.in_unit && self.pending.len() >= 2 {
            let bytes = std::mem::take(&mut self.pending);
            let (pts, user_data) = self.pts_at(0);
            self.finalize_unit(&bytes, pts, user_data);
        } else {
            self.pending.clear();
        }
        self.markers.clear();
        self.scan_pos = 0;
        self.in_unit = false;
    }

    /// Finalize pending data and set the end-of-stream sentinel.
    pub fn mark_end_of_stream(&mut self) {
        self.flush_data();
        self.end_of_stream = true;
    }

    /// Whether end-of-stream has been signalled.
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Dequeue one unit, if any is complete.
    pub fn pop(&mut self) -> Option<NalUnit> {
        self.queue.pop_front()
    }

    /// Number of complete units waiting in the queue.
    pub fn units_pending(&self) -> usize {
        self.queue.len()
    }

    /// Number of raw input bytes not yet assembled into units.
    pub fn bytes_pending(&self) -> usize {
        self.pending.len()
    }

    /// Discard all buffered input and queued units.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.markers.clear();
        self.queue.clear();
        self.scan_pos = 0;
        self.in_unit = false;
        self.end_of_stream = false;
    }

    /// Scan the pending buffer for start codes, finalizing delimited units.
    fn scan(&mut self) {
        loop {
            // A start code may straddle the previous scan boundary.
            let from = self.scan_pos.saturating_sub(3);
            let Some((rel_off, sc_len)) = find_start_code(&self.pending[from..]) else {
                self.scan_pos = self.pending.len();
                return;
            };
            let off = from + rel_off;

            if self.in_unit && off >= 2 {
                let unit_bytes: Vec<u8> = self.pending[..off].to_vec();
                let (pts, user_data) = self.pts_at(0);
                self.finalize_unit(&unit_bytes, pts, user_data);
            }

            self.consume(off + sc_len);
            self.in_unit = true;
            self.scan_pos = 0;
        }
    }

    /// Drop `n` bytes from the front of the pending buffer, rebasing markers.
    fn consume(&mut self, n: usize) {
        self.pending.drain(..n);

        let mut last_before: Option<PtsMarker> = None;
        let mut rebased = Vec::with_capacity(self.markers.len());
        for mut m in self.markers.drain(..) {
            if m.offset >= n {
                m.offset -= n;
                rebased.push(m);
            } else {
                // The most recent marker before the cut still covers the
                // bytes now at offset zero.
                last_before = Some(m);
            }
        }
        if let Some(mut m) = last_before {
            if rebased.first().map(|f| f.offset > 0).unwrap_or(true) {
                m.offset = 0;
                rebased.insert(0, m);
            }
        }
        self.markers = rebased;
    }

    /// Timestamp and user data covering the given pending-buffer offset.
    fn pts_at(&self, offset: usize) -> (i64, UserData) {
        let mut pts = 0;
        let mut user_data: UserData = None;
        for m in &self.markers {
            if m.offset <= offset {
                pts = m.pts;
                user_data = m.user_data.clone();
            } else {
                break;
            }
        }
        (pts, user_data)
    }

    /// Parse the header, strip emulation prevention, and enqueue.
    fn finalize_unit(&mut self, bytes: &[u8], pts: i64, user_data: UserData) {
        let Ok(header) = NalUnitHeader::parse(bytes) else {
            // Malformed header; drop silently here, header-level parsing
            // reports problems for units that made it into the queue.
            return;
        };

        let rbsp = strip_emulation_prevention(&bytes[2..]);
        trace!(
            nal_type = %header.nal_unit_type,
            size = rbsp.len(),
            pts,
            "NAL unit queued"
        );
        self.queue.push_back(NalUnit {
            header,
            rbsp,
            pts,
            user_data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nal::NalUnitType;

    /// Annex-B VPS stream with four emulation-prevention bytes.
    const VPS_STREAM: [u8; 27] = [
        0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0x0C, 0x01, 0xFF, 0xFF, 0x01, 0x60, 0x00, 0x00, 0x03,
        0x00, 0x90, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00,
    ];

    #[test]
    fn test_vps_stream_single_unit() {
        let mut parser = NalParser::new();
        parser.push_data(&VPS_STREAM, 0, None).unwrap();
        parser.flush_data();

        assert_eq!(parser.units_pending(), 1);
        let unit = parser.pop().unwrap();
        assert_eq!(unit.header.nal_unit_type.to_raw(), 32);
        assert_eq!(unit.unit_type(), NalUnitType::VpsNut);

        // Four emulation-prevention bytes removed from the 21 payload bytes.
        assert_eq!(unit.rbsp.len(), 17);
        assert!(
            !unit
                .rbsp
                .windows(3)
                .any(|w| w == [0x00, 0x00, 0x03]),
            "stripped RBSP must not contain an emulation sequence"
        );
    }

    #[test]
    fn test_split_feed_is_equivalent() {
        for split in 1..VPS_STREAM.len() {
            let mut whole = NalParser::new();
            whole.push_data(&VPS_STREAM, 0, None).unwrap();
            whole.flush_data();

            let mut halves = NalParser::new();
            halves.push_data(&VPS_STREAM[..split], 0, None).unwrap();
            halves.push_data(&VPS_STREAM[split..], 0, None).unwrap();
            halves.flush_data();

            let a = whole.pop().unwrap();
            let b = halves.pop().unwrap();
            assert_eq!(a.rbsp, b.rbsp, "split at {split}");
            assert_eq!(a.header.nal_unit_type, b.header.nal_unit_type);
        }
    }

    #[test]
    fn test_two_units_delimited_by_start_code() {
        let mut data = Vec::new();
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x40, 0x01, 0x11]);
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x42, 0x01, 0x22]);

        let mut parser = NalParser::new();
        parser.push_data(&data, 90_000, None).unwrap();
        // First unit is complete as soon as the second start code arrives.
        assert_eq!(parser.units_pending(), 1);
        parser.flush_data();
        assert_eq!(parser.units_pending(), 2);

        let first = parser.pop().unwrap();
        let second = parser.pop().unwrap();
        assert_eq!(first.unit_type(), NalUnitType::VpsNut);
        assert_eq!(second.unit_type(), NalUnitType::SpsNut);
        assert_eq!(first.pts, 90_000);
    }

    #[test]
    fn test_pts_tracks_first_byte_of_unit() {
        let mut parser = NalParser::new();
        parser
            .push_data(&[0x00, 0x00, 0x01, 0x40, 0x01, 0x11], 100, None)
            .unwrap();
        // Second unit starts in the second push.
        parser
            .push_data(&[0x00, 0x00, 0x01, 0x42, 0x01, 0x22], 200, None)
            .unwrap();
        parser.flush_data();

        let first = parser.pop().unwrap();
        let second = parser.pop().unwrap();
        assert_eq!(first.pts, 100);
        assert_eq!(second.pts, 200);
    }

    #[test]
    fn test_push_nal_without_start_code() {
        let mut parser = NalParser::new();
        parser
            .push_nal(&[0x40, 0x01, 0x00, 0x00, 0x03, 0x02], 5, None)
            .unwrap();

        let unit = parser.pop().unwrap();
        assert_eq!(unit.unit_type(), NalUnitType::VpsNut);
        assert_eq!(unit.rbsp, vec![0x00, 0x00, 0x02]);
        assert_eq!(unit.pts, 5);
    }

    #[test]
    fn test_garbage_before_first_start_code_is_discarded() {
        let mut parser = NalParser::new();
        parser
            .push_data(&[0xDE, 0xAD, 0x00, 0x00, 0x01, 0x40, 0x01, 0x33], 0, None)
            .unwrap();
        parser.flush_data();

        assert_eq!(parser.units_pending(), 1);
        assert_eq!(parser.pop().unwrap().unit_type(), NalUnitType::VpsNut);
    }

    #[test]
    fn test_end_of_stream_sentinel() {
        let mut parser = NalParser::new();
        assert!(!parser.is_end_of_stream());
        parser.mark_end_of_stream();
        assert!(parser.is_end_of_stream());
        parser.reset();
        assert!(!parser.is_end_of_stream());
    }

    #[test]
    fn test_bytes_pending() {
        let mut parser = NalParser::new();
        parser.push_data(&[0x00, 0x00, 0x01, 0x40], 0, None).unwrap();
        assert!(parser.bytes_pending() > 0);
        parser.flush_data();
        assert_eq!(parser.bytes_pending(), 0);
    }
}
