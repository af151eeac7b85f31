//! Integration tests for the HEVC decoder.
//!
//! These exercise the public pipeline end to end: Annex-B ingest, parameter
//! set activation, slice decoding, output reordering, warnings, and
//! multi-threaded decoding.

use pretty_assertions::assert_eq;
use vireo_core::bitstream::{insert_emulation_prevention, BitWriter};
use vireo_hevc::{
    is_ok_code, DecodeError, DecodeWarning, Decoder, Integrity, NalParser, NalUnitType,
};

// ============================================================================
// Stream construction helpers
// ============================================================================

/// Wrap an RBSP into an Annex-B NAL unit with a 4-byte start code.
fn annexb_nal(nal_type: u8, rbsp: &[u8]) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00, 0x01];
    out.push(nal_type << 1);
    out.push(0x01);
    out.extend(insert_emulation_prevention(rbsp));
    out
}

fn write_profile_tier_level(w: &mut BitWriter) {
    w.write_bits(0, 2); // general_profile_space
    w.write_bit(false); // general_tier_flag
    w.write_bits(1, 5); // general_profile_idc (Main)
    w.write_bits(0, 32); // compatibility flags
    w.write_bit(true); // progressive source
    w.write_bit(false); // interlaced source
    w.write_bits(0, 2); // non_packed + frame_only
    w.write_bits(0, 32); // reserved 44 bits
    w.write_bits(0, 12);
    w.write_bits(120, 8); // general_level_idc
}

fn build_vps() -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_bits(0, 4);
    w.write_bits(3, 2);
    w.write_bits(0, 6);
    w.write_bits(0, 3);
    w.write_bit(true);
    w.write_bits(0xFFFF, 16);
    write_profile_tier_level(&mut w);
    w.write_bit(true);
    w.write_ue(4);
    w.write_ue(2);
    w.write_ue(0);
    w.write_bits(0, 6);
    w.write_ue(0);
    w.write_bit(false);
    w.write_bit(false);
    w.write_rbsp_trailing_bits();
    w.into_data()
}

fn build_sps(width: u32, height: u32) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_bits(0, 4); // sps_video_parameter_set_id
    w.write_bits(0, 3); // sps_max_sub_layers_minus1
    w.write_bit(true); // sps_temporal_id_nesting_flag
    write_profile_tier_level(&mut w);
    w.write_ue(0); // sps_seq_parameter_set_id
    w.write_ue(1); // chroma_format_idc (4:2:0)
    w.write_ue(width);
    w.write_ue(height);
    w.write_bit(false); // conformance_window_flag
    w.write_ue(0); // bit_depth_luma_minus8
    w.write_ue(0); // bit_depth_chroma_minus8
    w.write_ue(4); // log2_max_pic_order_cnt_lsb_minus4
    w.write_bit(true); // sub_layer_ordering_info_present
    w.write_ue(4); // sps_max_dec_pic_buffering_minus1
    w.write_ue(2); // sps_max_num_reorder_pics
    w.write_ue(0); // sps_max_latency_increase_plus1
    w.write_ue(0); // log2_min_luma_coding_block_size_minus3
    w.write_ue(3); // log2_diff_max_min (CTB 64)
    w.write_ue(0); // log2_min_luma_transform_block_size_minus2
    w.write_ue(3); // log2_diff_max_min_transform_block_size
    w.write_ue(0); // max_transform_hierarchy_depth_inter
    w.write_ue(0); // max_transform_hierarchy_depth_intra
    w.write_bit(false); // scaling_list_enabled_flag
    w.write_bit(false); // amp_enabled_flag
    w.write_bit(false); // sample_adaptive_offset_enabled_flag
    w.write_bit(false); // pcm_enabled_flag
    w.write_ue(0); // num_short_term_ref_pic_sets
    w.write_bit(false); // long_term_ref_pics_present_flag
    w.write_bit(false); // sps_temporal_mvp_enabled_flag
    w.write_bit(false); // strong_intra_smoothing_enabled_flag
    w.write_bit(false); // vui_parameters_present_flag
    w.write_bit(false); // sps_extension_present_flag
    w.write_rbsp_trailing_bits();
    w.into_data()
}

fn build_pps() -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_ue(0); // pps_pic_parameter_set_id
    w.write_ue(0); // pps_seq_parameter_set_id
    w.write_bit(false); // dependent_slice_segments_enabled_flag
    w.write_bit(false); // output_flag_present_flag
    w.write_bits(0, 3); // num_extra_slice_header_bits
    w.write_bit(false); // sign_data_hiding_enabled_flag
    w.write_bit(false); // cabac_init_present_flag
    w.write_ue(0); // num_ref_idx_l0_default_active_minus1
    w.write_ue(0); // num_ref_idx_l1_default_active_minus1
    w.write_se(0); // init_qp_minus26
    w.write_bit(false); // constrained_intra_pred_flag
    w.write_bit(false); // transform_skip_enabled_flag
    w.write_bit(false); // cu_qp_delta_enabled_flag
    w.write_se(0); // pps_cb_qp_offset
    w.write_se(0); // pps_cr_qp_offset
    w.write_bit(false); // pps_slice_chroma_qp_offsets_present_flag
    w.write_bit(false); // weighted_pred_flag
    w.write_bit(false); // weighted_bipred_flag
    w.write_bit(false); // transquant_bypass_enabled_flag
    w.write_bit(false); // tiles_enabled_flag
    w.write_bit(false); // entropy_coding_sync_enabled_flag
    w.write_bit(true); // pps_loop_filter_across_slices_enabled_flag
    w.write_bit(false); // deblocking_filter_control_present_flag
    w.write_bit(false); // pps_scaling_list_data_present_flag
    w.write_bit(false); // lists_modification_present_flag
    w.write_ue(0); // log2_parallel_merge_level_minus2
    w.write_bit(false); // slice_segment_header_extension_present_flag
    w.write_bit(false); // pps_extension_present_flag
    w.write_rbsp_trailing_bits();
    w.into_data()
}

/// IDR I-slice header followed by entropy-coded payload bytes.
fn idr_slice(payload: &[u8]) -> Vec<u8> {
    let mut w = BitWriter::new();
    w.write_bit(true); // first_slice_segment_in_pic_flag
    w.write_bit(false); // no_output_of_prior_pics_flag
    w.write_ue(0); // slice_pic_parameter_set_id
    w.write_ue(2); // slice_type = I
    w.write_se(0); // slice_qp_delta
    w.write_bit(true); // slice_loop_filter_across_slices_enabled_flag
    w.write_bit(true); // byte alignment stop bit
    w.align_to_byte();
    let mut rbsp = w.into_data();
    rbsp.extend_from_slice(payload);
    rbsp
}

fn build_stream(width: u32, height: u32, slice_payload: &[u8]) -> Vec<u8> {
    let mut stream = Vec::new();
    stream.extend(annexb_nal(32, &build_vps()));
    stream.extend(annexb_nal(33, &build_sps(width, height)));
    stream.extend(annexb_nal(34, &build_pps()));
    stream.extend(annexb_nal(19, &idr_slice(slice_payload)));
    stream
}

fn decode_fully(dec: &mut Decoder) {
    loop {
        match dec.decode() {
            Ok(true) => {}
            Ok(false) => break,
            Err(DecodeError::WaitingForInputData) => break,
            Err(e) => panic!("decode failed: {e}"),
        }
    }
}

// ============================================================================
// NAL input stage
// ============================================================================

/// Annex-B VPS stream with four emulation-prevention bytes.
const VPS_STREAM: [u8; 27] = [
    0x00, 0x00, 0x00, 0x01, 0x40, 0x01, 0x0C, 0x01, 0xFF, 0xFF, 0x01, 0x60, 0x00, 0x00, 0x03,
    0x00, 0x90, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00,
];

#[test]
fn test_emulation_prevention_stripping() {
    let mut parser = NalParser::new();
    parser.push_data(&VPS_STREAM, 0, None).unwrap();
    parser.mark_end_of_stream();

    let unit = parser.pop().expect("one NAL unit");
    assert_eq!(unit.header.nal_unit_type.to_raw(), 32);
    assert_eq!(unit.unit_type(), NalUnitType::VpsNut);
    assert!(!unit.rbsp.windows(3).any(|w| w == [0x00, 0x00, 0x03]));
    assert!(parser.pop().is_none());
}

#[test]
fn test_split_input_produces_identical_units() {
    let stream = build_stream(128, 128, &[0x13, 0x37]);

    let collect = |chunks: &[&[u8]]| -> Vec<(NalUnitType, Vec<u8>)> {
        let mut parser = NalParser::new();
        for chunk in chunks {
            parser.push_data(chunk, 0, None).unwrap();
        }
        parser.mark_end_of_stream();
        let mut units = Vec::new();
        while let Some(u) = parser.pop() {
            units.push((u.unit_type(), u.rbsp));
        }
        units
    };

    let whole = collect(&[&stream]);
    assert_eq!(whole.len(), 4);

    for split in [1usize, 5, 13, stream.len() / 2, stream.len() - 2] {
        let halves = collect(&[&stream[..split], &stream[split..]]);
        assert_eq!(whole, halves, "split at {split}");
    }
}

// ============================================================================
// Decoder pipeline
// ============================================================================

#[test]
fn test_decode_single_idr_picture() {
    let mut dec = Decoder::new();
    dec.push_data(&build_stream(128, 64, &[0x5A, 0x33, 0x77]), 40_000, None)
        .unwrap();
    dec.flush_data();
    decode_fully(&mut dec);

    let pic = dec.get_next_picture().expect("decoded picture");
    assert_eq!(pic.poc, 0);
    assert_eq!(pic.spec.width, 128);
    assert_eq!(pic.spec.height, 64);
    assert_eq!(pic.pts, 40_000);
    assert_eq!(pic.integrity(), Integrity::Decoded);
    assert!(dec.get_next_picture().is_none());
}

#[test]
fn test_peek_release_equals_get() {
    let stream = build_stream(128, 64, &[0x42, 0x24]);

    let mut a = Decoder::new();
    a.push_data(&stream, 0, None).unwrap();
    a.flush_data();
    decode_fully(&mut a);

    let mut b = Decoder::new();
    b.push_data(&stream, 0, None).unwrap();
    b.flush_data();
    decode_fully(&mut b);

    let via_get = a.get_next_picture().unwrap();
    let via_peek = b.peek_next_picture().unwrap();
    b.release_next_picture();

    assert_eq!(via_get.poc, via_peek.poc);
    assert!(a.peek_next_picture().is_none());
    assert!(b.peek_next_picture().is_none());
}

#[test]
fn test_nonexisting_pps_warning_and_recovery() {
    let mut dec = Decoder::new();
    dec.push_data(&annexb_nal(32, &build_vps()), 0, None).unwrap();
    dec.push_data(&annexb_nal(33, &build_sps(128, 64)), 0, None)
        .unwrap();
    dec.push_data(&annexb_nal(34, &build_pps()), 0, None).unwrap();

    // Slice referencing PPS 63, which does not exist.
    let mut w = BitWriter::new();
    w.write_bit(true);
    w.write_bit(false);
    w.write_ue(63);
    w.write_rbsp_trailing_bits();
    dec.push_data(&annexb_nal(19, &w.into_data()), 0, None).unwrap();

    // A valid slice follows and must still decode.
    dec.push_data(&annexb_nal(19, &idr_slice(&[0x10, 0x20])), 0, None)
        .unwrap();
    dec.flush_data();
    decode_fully(&mut dec);

    assert_eq!(
        dec.get_warning(),
        Some(DecodeWarning::NonexistingPpsReferenced)
    );
    let pic = dec.get_next_picture().expect("valid slice decoded");
    assert_eq!(pic.spec.width, 128);
}

#[test]
fn test_reset_reproduces_identical_output() {
    let stream = build_stream(192, 128, &[0x5A, 0x33, 0x77, 0x12, 0x9C, 0x04]);

    let mut dec = Decoder::new();

    let mut run = |dec: &mut Decoder| -> Vec<u8> {
        dec.push_data(&stream, 0, None).unwrap();
        dec.flush_data();
        decode_fully(dec);
        let pic = dec.get_next_picture().unwrap();
        let planes = pic.planes();
        let mut all = planes.plane(0).data().to_vec();
        all.extend_from_slice(planes.plane(1).data());
        all.extend_from_slice(planes.plane(2).data());
        all
    };

    let first = run(&mut dec);
    dec.reset();
    let second = run(&mut dec);
    assert_eq!(first, second);
}

#[test]
fn test_multithreaded_output_matches_single_threaded() {
    let stream = build_stream(256, 256, &[0x5A, 0x33, 0x77, 0x12, 0x9C, 0x04, 0x55]);

    let decode_with = |threads: usize| -> Vec<u8> {
        let mut dec = Decoder::new();
        if threads > 0 {
            dec.start_worker_threads(threads).unwrap();
        }
        dec.push_data(&stream, 0, None).unwrap();
        dec.flush_data();
        decode_fully(&mut dec);
        let pic = dec.get_next_picture().expect("picture");

        // Every CTB must have completed the full filter pipeline once.
        for cy in 0..pic.ctbs_h() {
            for cx in 0..pic.ctbs_w() {
                assert_eq!(
                    pic.progress(cx as i32, cy as i32).get(),
                    vireo_hevc::CtbProgress::SaoComplete,
                    "CTB ({cx},{cy}) with {threads} threads"
                );
            }
        }

        let planes = pic.planes();
        planes.plane(0).data().to_vec()
    };

    let single = decode_with(0);
    let multi = decode_with(4);
    assert_eq!(single, multi);
}

#[test]
fn test_waiting_for_input_surfaced() {
    let mut dec = Decoder::new();
    // No EOS: the pipeline stalls rather than finishing.
    dec.push_data(&annexb_nal(32, &build_vps()), 0, None).unwrap();
    // The single buffered unit cannot be finalized without a following
    // start code, so decode reports starvation.
    assert!(matches!(
        dec.decode(),
        Err(DecodeError::WaitingForInputData)
    ));
}

#[test]
fn test_error_code_bands() {
    assert!(is_ok_code(0));
    assert!(is_ok_code(DecodeWarning::NonexistingPpsReferenced.code()));
    assert!(is_ok_code(DecodeWarning::WarningBufferFull.code()));
    assert!(!is_ok_code(DecodeError::ChecksumMismatch.code()));
    assert!(!is_ok_code(DecodeError::WaitingForInputData.code()));

    // All warnings sit in the warning band.
    assert!(DecodeWarning::SliceHeaderInvalid.code() >= 1000);
    assert!(DecodeError::Eof.code() < 1000);
}

#[test]
fn test_pending_counters() {
    let mut dec = Decoder::new();
    assert_eq!(dec.pending_nal_units(), 0);

    dec.push_data(&annexb_nal(32, &build_vps()), 0, None).unwrap();
    dec.push_data(&annexb_nal(33, &build_sps(64, 64)), 0, None)
        .unwrap();
    // The second start code finalized the first unit.
    assert_eq!(dec.pending_nal_units(), 1);
    assert!(dec.pending_input_bytes() > 0);

    dec.flush_data();
    assert_eq!(dec.pending_nal_units(), 2);
    assert_eq!(dec.pending_input_bytes(), 0);
}
