use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use decode_reg_lib::acq::{AcqController,
                          AcqOutcome,
                          AcqState,
                          Samples,
                          TriggerType};
use decode_reg_lib::bits::{extract,
                           fixed_to_float,
                           float_to_fixed,
                           insert};
use decode_reg_lib::modules::{simulated_board,
                              ModuleKind,
                              SIM_ACQ_OFFSET};
use decode_reg_lib::registers::*;
use decode_reg_lib::sim::SimRegion;
use decode_reg_lib::{Controller,
                     Decoder,
                     DeviceInfo,
                     PcieDevice,
                     RegError,
                     Settings};

const ACQ_BASE : u64 = 0x800;

/// Show the library logs of failing tests, RUST_LOG=debug
fn init_logging() {
  let _ = env_logger::builder().is_test(true).try_init();
}

const DONE : u32 = ACQ_FSM_IDLE as u32
                 | ACQ_STA_FSM_ACQ_DONE
                 | ACQ_STA_FC_TRANS_DONE
                 | ACQ_STA_DDR3_TRANS_DONE;

/// An acquisition core with one channel of 2 atoms
/// (16 bits each) per 4 byte sample, and a ring of
/// 4kB at the start of the sample memory. Atom k of the
/// sample memory holds k - 1000.
fn acq_board() -> (AcqController, SimRegion) {
  init_logging();
  let control = SimRegion::new(0x1000);
  let sample  = SimRegion::new(0x1000);
  control.poke(ACQ_BASE + ACQ_STA,           ACQ_FSM_IDLE as u32);
  control.poke(ACQ_BASE + ACQ_CHAN_CTL,      1 << 16);
  control.poke(ACQ_BASE + ACQ_CH0_DESC,      (2 << 16) | 16);
  control.poke(ACQ_BASE + ACQ_CH0_ATOM_DESC, (16 << 16) | 2);
  for k in 0..0x800u64 {
    sample.poke_bytes(2*k, &((k as i16) - 1000).to_le_bytes());
  }
  let mut settings = Settings::new();
  settings.acq_ring_start = 0;
  settings.acq_ring_size  = 0x1000;
  let device  = PcieDevice::new(Arc::new(control.clone()), Arc::new(sample));
  let mut acq = AcqController::new(device, &settings);
  acq.set_devinfo(DeviceInfo {
    start_addr    : ACQ_BASE,
    vendor_id     : LNLS_VENDOR_ID,
    device_id     : ACQ_CORE_DEVICE_ID,
    abi_ver_major : ACQ_CORE_ABI_MAJOR,
    abi_ver_minor : 0,
  }).unwrap();
  (acq, control)
}

fn configure(acq : &mut AcqController) {
  acq.params.channel      = Some(0);
  acq.params.pre_samples  = Some(4);
  acq.params.post_samples = Some(16);
  acq.params.shots        = Some(1);
  acq.params.trigger      = Some(TriggerType::Immediate);
}

#[test]
fn immediate_acquisition_end_to_end() {
  let (mut acq, control) = acq_board();
  configure(&mut acq);
  acq.start_acquisition().unwrap();
  assert_eq!(acq.result(true).unwrap(), AcqOutcome::InProgress);

  // hardware is done, trigger after 8 samples
  control.poke(ACQ_BASE + ACQ_STA, DONE);
  control.poke(ACQ_BASE + ACQ_TRIG_POS, 32);
  let samples = match acq.result_timeout(true, Duration::from_secs(1)).unwrap() {
    AcqOutcome::Done(Samples::Signed(samples)) => samples,
    other => panic!("Unexpected outcome {:?}", other),
  };
  // 20 samples of 2 atoms, from 4 samples before the trigger on
  assert_eq!(samples.len(), 40);
  assert!(samples.iter().all(|s| *s >= -32768 && *s <= 32767));
  let expected : Vec<i32> = (8..48).map(|k| k - 1000).collect();
  assert_eq!(samples, expected);
  assert_eq!(acq.state(), AcqState::Stopped);
  assert!(matches!(acq.result(true), Err(RegError::NotStarted)));
}

#[test]
fn pre_trigger_window_wraps_around() {
  let (mut acq, control) = acq_board();
  configure(&mut acq);
  acq.start_acquisition().unwrap();
  // ring is (8 + 16) samples of 4 bytes, the trigger
  // is 2 samples into it
  control.poke(ACQ_BASE + ACQ_STA, DONE);
  control.poke(ACQ_BASE + ACQ_TRIG_POS, 8);
  let samples = match acq.result(false).unwrap() {
    AcqOutcome::Done(Samples::Unsigned(samples)) => samples,
    other => panic!("Unexpected outcome {:?}", other),
  };
  assert_eq!(samples.len(), 40);
  // the first 2 samples come from the end of the ring
  let atom = |k : i32| ((k - 1000) as i16) as u16 as u32;
  assert_eq!(&samples[..4], &[atom(44), atom(45), atom(46), atom(47)]);
  assert_eq!(samples[4], atom(0));
  assert_eq!(samples[39], atom(35));
}

#[test]
fn blocking_wait_times_out() {
  let (mut acq, control) = acq_board();
  configure(&mut acq);
  acq.start_acquisition().unwrap();
  // all done bits but the DDR3 transfer
  control.poke(ACQ_BASE + ACQ_STA, DONE & !ACQ_STA_DDR3_TRANS_DONE);
  let outcome = acq.result_timeout(true, Duration::from_millis(20)).unwrap();
  assert_eq!(outcome, AcqOutcome::Timeout);
  assert_eq!(acq.state(), AcqState::Started);
  // the caller may wait again
  control.poke(ACQ_BASE + ACQ_STA, DONE);
  assert!(matches!(acq.result_timeout(true, Duration::from_millis(20)).unwrap(), AcqOutcome::Done(_)));
}

#[test]
fn unsupported_atom_width() {
  let (mut acq, control) = acq_board();
  control.poke(ACQ_BASE + ACQ_CH0_ATOM_DESC, (12 << 16) | 2);
  configure(&mut acq);
  // refused before anything is written to the core
  control.take_writes();
  assert!(matches!(acq.start_acquisition(), Err(RegError::UnsupportedWidth(12))));
  assert!(control.take_writes().is_empty());
  assert_eq!(acq.state(), AcqState::Stopped);
  // a supported layout works right away
  control.poke(ACQ_BASE + ACQ_CH0_ATOM_DESC, (16 << 16) | 2);
  acq.start_acquisition().unwrap();
  control.poke(ACQ_BASE + ACQ_STA, DONE);
  control.poke(ACQ_BASE + ACQ_TRIG_POS, 32);
  assert!(matches!(acq.result(true).unwrap(), AcqOutcome::Done(_)));
}

#[test]
fn channel_outside_of_core() {
  let (mut acq, _) = acq_board();
  configure(&mut acq);
  acq.params.channel = Some(3);
  assert!(matches!(acq.start_acquisition(), Err(RegError::ChannelOutOfRange { index : 3, count : 1 })));
}

#[test]
fn simulated_board_acquisition() {
  init_logging();
  let mut settings = Settings::new();
  let device = simulated_board(&mut settings).unwrap();
  let info   = ModuleKind::Acq.locate(&device, &settings, 0).unwrap().unwrap();
  assert_eq!(info.start_addr, settings.sdb_root + SIM_ACQ_OFFSET);
  let mut acq = AcqController::new(device, &settings);
  acq.set_devinfo(info).unwrap();
  configure(&mut acq);
  acq.start_acquisition().unwrap();
  match acq.result_timeout(true, Duration::from_secs(1)).unwrap() {
    AcqOutcome::Done(samples) => assert_eq!(samples.len(), 40),
    other => panic!("Unexpected outcome {:?}", other),
  }
}

#[test]
fn write_through_named_parameters() {
  init_logging();
  let mut settings = Settings::new();
  let device = simulated_board(&mut settings).unwrap();
  let mut ctl = ModuleKind::PosCalc.open_controller(&device, &settings, 0).unwrap().unwrap();
  ctl.set_named("offset_x", "-42").unwrap();
  ctl.set_named("tbt_tag_en", "enabled").unwrap();
  ctl.write_params().unwrap();
  let mut decoder = ModuleKind::PosCalc.open_decoder(&device, &settings, 0).unwrap().unwrap();
  decoder.get_data().unwrap();
  let values = decoder.to_json().unwrap();
  assert_eq!(values["general"]["offset_x"], serde_json::json!(-42));
  assert_eq!(values["general"]["tbt_tag_en"], serde_json::json!(1));
  let mut text = Vec::<u8>::new();
  decoder.print(&mut text, false).unwrap();
  let text = String::from_utf8(text).unwrap();
  assert!(text.contains("tbt_tag_en: enabled\n"));
  assert!(text.contains("gain[3]: 1\n"));
}

#[test]
fn random_bit_fields_roundtrip() {
  let mut rng = rand::thread_rng();
  for _ in 0..1000 {
    let width  = rng.gen_range(1..=32u32);
    let shift  = rng.gen_range(0..=(32 - width));
    let mask   = (((1u64 << width) - 1) << shift) as u32;
    let signed = rng.gen::<bool>();
    let value  = if signed {
      rng.gen_range(-(1i64 << (width - 1))..(1i64 << (width - 1)))
    } else {
      rng.gen_range(0..(1i64 << width))
    };
    let word = insert(rng.gen::<u32>(), value, mask, signed).unwrap();
    assert_eq!(extract(word, mask, signed).unwrap(), value, "mask {:#x}", mask);
  }
}

#[test]
fn random_fixed_point_roundtrip() {
  let mut rng = rand::thread_rng();
  for _ in 0..1000 {
    let point_pos = rng.gen_range(0..32u32);
    let raw       = rng.gen::<i32>();
    // exactly representable
    let value     = raw as f64 / (1u64 << point_pos) as f64;
    let fixed     = float_to_fixed(value, point_pos, false).unwrap();
    assert_eq!(fixed_to_float(fixed, point_pos).unwrap(), value);
  }
}
