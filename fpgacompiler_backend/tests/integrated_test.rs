//! End-to-end compiler tests: build a board graph, place instructions,
//! compile the sample matrix and check the words that come out.

use fpgacompiler_backend::*;

fn experiment() -> Experiment {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut exp = Experiment::new();
    exp.add_primary_board("primary", "192.168.1.130:49701", 2, 1e6).unwrap();
    exp
}

#[test]
fn digital_toggle_compiles_to_three_samples() {
    let mut exp = experiment();
    exp.add_digital_out("primary", "mot_shutter", "0x0/0x0", 0).unwrap();
    exp.go_high("mot_shutter", 0.0).unwrap();
    exp.go_low("mot_shutter", 1e-6).unwrap();
    exp.go_high("mot_shutter", 2e-6).unwrap();
    let out = build(&exp, "primary").unwrap();

    assert_eq!(out.matrix.nrows(), 3);
    assert_eq!(out.matrix.ncols(), 3); // tick + two racks
    assert_eq!(out.matrix.column(0).to_vec(), vec![0, 1, 2]);
    for (row, expected) in [(0, 1u32), (1, 0), (2, 1)] {
        let word = out.matrix[[row, 1]];
        assert_eq!(address_of(word), 0x0);
        assert_eq!(data_of(word), expected);
        assert!(!is_nop(word));
    }
    // Rack 1 carries nothing; its column stays no-op
    for &word in out.matrix.column(2).iter() {
        assert!(is_nop(word));
    }
    // Strobe alternates 0, 1, 0
    let strbs: Vec<u32> = out.matrix.column(1).iter().map(|&w| strb_of(w) as u32).collect();
    assert_eq!(strbs, vec![0, 1, 0]);
}

#[test]
fn two_lines_merge_into_one_port_word() {
    let mut exp = experiment();
    exp.add_digital_out("primary", "shutter_a", "0x0/0x0", 0).unwrap();
    exp.add_digital_out("primary", "shutter_b", "0x0/0x1", 0).unwrap();
    exp.go_high("shutter_a", 0.0).unwrap();
    exp.go_high("shutter_b", 0.0).unwrap();
    exp.go_low("shutter_b", 1e-6).unwrap();
    let out = build(&exp, "primary").unwrap();

    let data: Vec<u32> = out.matrix.column(1).iter().map(|&w| data_of(w)).collect();
    assert_eq!(data, vec![0b11, 0b01]);
    assert_eq!(out.final_values["shutter_a"], 1.0);
    assert_eq!(out.final_values["shutter_b"], 0.0);
}

#[test]
fn duplicate_analog_address_is_rejected_at_registration() {
    let mut exp = experiment();
    exp.add_analog_out("primary", "shim_x", "0x02", 0, DacVariant::Dac712, None).unwrap();
    let err = exp
        .add_analog_out("primary", "shim_y", "0x02", 0, DacVariant::Dac712, None)
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("shim_x"));
    assert!(msg.contains("shim_y"));
    // Same address on the other rack is fine
    exp.add_analog_out("primary", "shim_z", "0x02", 1, DacVariant::Dac712, None).unwrap();
}

#[test]
fn analog_ramp_decodes_back_within_one_lsb() {
    let mut exp = experiment();
    exp.add_analog_out("primary", "coil", "0x03", 0, DacVariant::Dac712, None).unwrap();
    exp.set_instr("coil", 0.0, Instruction::new_linear(0.0, 1e-3, 1e4, -5.0, 5.0)).unwrap();
    let out = build(&exp, "primary").unwrap();

    let times: Vec<f64> = out.matrix.column(0).iter().map(|&t| t as f64 / 1e6).collect();
    let words: Vec<u32> = out.matrix.column(1).to_vec();
    let (dec_t, dec_v) = DacVariant::Dac712.decode(0x03, &times, &words);
    assert_eq!(dec_t.len(), 11);
    let lsb = 20.0 / 65535.0;
    for (t, v) in dec_t.iter().zip(dec_v.iter()) {
        let expected = -5.0 + 10.0 * t / 1e-3;
        assert!((v - expected).abs() < lsb, "t={} decoded {} expected {}", t, v, expected);
    }
}

#[test]
fn unit_conversion_maps_user_values_to_volts() {
    let mut exp = experiment();
    // Coil current in amps, 2 A per volt
    let conv = UnitConversion::new("x/2", -20.0, 20.0, 3).unwrap();
    exp.add_analog_out("primary", "coil", "0x03", 0, DacVariant::Dac712, Some(conv)).unwrap();
    exp.set("coil", 0.0, 10.0).unwrap(); // 10 A -> 5 V
    let out = build(&exp, "primary").unwrap();

    let (_, values) = DacVariant::Dac712.decode(0x03, &[0.0], &[out.matrix[[0, 1]]]);
    assert!((values[0] - 5.0).abs() < 1e-3);
    // Out-of-range request fails synchronously
    assert!(matches!(
        exp.set("coil", 1e-6, 50.0),
        Err(CompileError::ValueOutOfRange { .. })
    ));
}

#[test]
fn dds_sweep_emits_register_bursts() {
    let mut exp = experiment();
    exp.add_dds("primary", "dds0", "0x10", 0, DdsVariant::Ad9854).unwrap();
    let t = exp.set_freq("dds0", 0.0, 80e6, false).unwrap();
    exp.set_amp("dds0", t, -6.0, true).unwrap();
    let out = build(&exp, "primary").unwrap();

    // Six frequency words then two amplitude words, one sample each
    assert_eq!(out.matrix.nrows(), 8);
    assert_eq!(out.matrix.column(0).to_vec(), vec![0, 1, 2, 3, 4, 5, 6, 7]);
    let words: Vec<u32> = out.matrix.column(1).to_vec();
    let freq_regs = DdsVariant::Ad9854.regs(DdsSub::Freq);
    for (i, &word) in words[..6].iter().enumerate() {
        assert_eq!(address_of(word), 0x10);
        let data = data_of(word);
        assert_ne!(data & DDS_WRITE, 0);
        assert_eq!(data & DDS_UPDATE, 0);
        assert_eq!((data >> DDS_REG_SHIFT) & DDS_REG_MASK, freq_regs[i] as u32);
    }
    // Amplitude burst: last word carries the update flag
    assert_eq!(data_of(words[6]) & DDS_UPDATE, 0);
    assert_ne!(data_of(words[7]) & DDS_UPDATE, 0);

    // Decoding the stream recovers the programmed values within one quantum
    let times: Vec<f64> = out.matrix.column(0).iter().map(|&t| t as f64 / 1e6).collect();
    let (_, freqs) = DdsVariant::Ad9854.decode(0x10, DdsSub::Freq, &times, &words);
    assert_eq!(freqs.len(), 1);
    assert!((freqs[0] - 80e6).abs() <= DdsVariant::Ad9854.freq_quantum());
    let (_, amps) = DdsVariant::Ad9854.decode(0x10, DdsSub::Amp, &times, &words);
    assert_eq!(amps.len(), 1);
    assert!((amps[0] - (-6.0)).abs() <= DdsVariant::Ad9854.amp_quantum());

    // Final values are the quantized programmings
    assert!((out.final_values["dds0.freq"] - 80e6).abs() <= DdsVariant::Ad9854.freq_quantum());
    assert!((out.final_values["dds0.amp"] - (-6.0)).abs() <= DdsVariant::Ad9854.amp_quantum());
}

#[test]
fn unrepresentable_dds_value_leaves_sentinel() {
    let mut exp = experiment();
    exp.add_dds("primary", "dds0", "0x10", 0, DdsVariant::Ad9854).unwrap();
    // Above SYSCLK/2, cannot be synthesized
    exp.set_freq("dds0", 0.0, 200e6, true).unwrap();
    let out = build(&exp, "primary").unwrap();
    assert_eq!(out.final_values["dds0.freq"], DDS_FREQ_INVALID_VALUE);
}

#[test]
fn compiled_shot_roundtrips_through_the_store() {
    let mut exp = experiment();
    exp.add_digital_out("primary", "d0", "0x0/0x0", 0).unwrap();
    exp.go_high("d0", 0.0).unwrap();
    exp.stop("primary", 5e-6).unwrap();
    let out = build(&exp, "primary").unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shot.h5b");
    let mut shot = ShotFile::new();
    shot.set_sequence("20260828T101500_test", 0, 0);
    shot.write_board("primary", &out, &serde_json::json!({})).unwrap();
    shot.save(&path).unwrap();

    let loaded = ShotFile::load(&path).unwrap();
    let matrix = loaded.board_matrix("primary").unwrap();
    assert_eq!(matrix, out.matrix);
    let crcs = loaded.board_crcs("primary").unwrap();
    assert_eq!(crcs[0], matrix_crc(&matrix));
    // Final sample carries the stop bit on every rack
    let last = matrix.nrows() - 1;
    for rack in 1..matrix.ncols() {
        assert!(is_stop(matrix[[last, rack]]));
    }
}
