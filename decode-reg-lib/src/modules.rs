//! The cores known to the tools, by name
//!
//! Builds decoders and controllers for a core and looks
//! it up on the SDB, so the command line does not need
//! to know the concrete types.

use std::f64::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::acq::{AcqController,
                 AcqDecoder,
                 ACQ_CORE};
use crate::controller::Controller;
use crate::decoder::Decoder;
use crate::errors::RegError;
use crate::memory::{write_words,
                    PcieDevice};
use crate::pos_calc::{PosCalcController,
                      PosCalcDecoder,
                      POS_CALC};
use crate::registers::*;
use crate::sdb::{find_device,
                 interconnect_words,
                 DeviceInfo,
                 DeviceMatch,
                 SdbDevice,
                 SDB_RECORD_SIZE};
use crate::settings::Settings;
use crate::sim::SimRegion;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ModuleKind {
  Acq,
  PosCalc,
}

impl ModuleKind {

  pub const ALL : [ModuleKind; 2] = [ModuleKind::Acq, ModuleKind::PosCalc];

  pub fn name(&self) -> &'static str {
    match self {
      ModuleKind::Acq     => "acq",
      ModuleKind::PosCalc => "pos_calc",
    }
  }

  pub fn target(&self) -> DeviceMatch {
    match self {
      ModuleKind::Acq     => ACQ_CORE,
      ModuleKind::PosCalc => POS_CALC,
    }
  }

  pub fn decoder(&self, device : PcieDevice) -> Box<dyn Decoder> {
    match self {
      ModuleKind::Acq     => Box::new(AcqDecoder::new(device)),
      ModuleKind::PosCalc => Box::new(PosCalcDecoder::new(device)),
    }
  }

  pub fn controller(&self, device : PcieDevice, settings : &Settings) -> Box<dyn Controller> {
    match self {
      ModuleKind::Acq     => Box::new(AcqController::new(device, settings)),
      ModuleKind::PosCalc => Box::new(PosCalcController::new(device)),
    }
  }

  /// Find the `index`-th core of this kind on the SDB
  pub fn locate(&self,
                device   : &PcieDevice,
                settings : &Settings,
                index    : usize) -> Result<Option<DeviceInfo>, RegError> {
    find_device(device, settings.sdb_root, &self.target(), index)
  }

  /// A decoder set up for the `index`-th core of this
  /// kind, `None` if there is no such core.
  pub fn open_decoder(&self,
                      device   : &PcieDevice,
                      settings : &Settings,
                      index    : usize) -> Result<Option<Box<dyn Decoder>>, RegError> {
    let info = match self.locate(device, settings, index)? {
      None       => return Ok(None),
      Some(info) => info,
    };
    let mut decoder = self.decoder(device.clone());
    decoder.set_devinfo(info)?;
    Ok(Some(decoder))
  }

  /// Same as `open_decoder`, for the controller
  pub fn open_controller(&self,
                         device   : &PcieDevice,
                         settings : &Settings,
                         index    : usize) -> Result<Option<Box<dyn Controller>>, RegError> {
    let info = match self.locate(device, settings, index)? {
      None       => return Ok(None),
      Some(info) => info,
    };
    let mut controller = self.controller(device.clone(), settings);
    controller.set_devinfo(info)?;
    Ok(Some(controller))
  }
}

impl FromStr for ModuleKind {
  type Err = RegError;

  fn from_str(s : &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace('-', "_").as_str() {
      "acq" | "acq_core"     => Ok(ModuleKind::Acq),
      "pos_calc" | "poscalc" => Ok(ModuleKind::PosCalc),
      _ => Err(RegError::UnknownModule(String::from(s))),
    }
  }
}

impl fmt::Display for ModuleKind {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.name())
  }
}

//=======================================

/// Bytes of the simulated sample memory
pub const SIM_SAMPLE_MEMORY : u64 = 1 << 20;
/// Offsets of the simulated cores from the SDB root
pub const SIM_ACQ_OFFSET      : u64 = 0x400;
pub const SIM_POS_CALC_OFFSET : u64 = 0x800;

/// A board without hardware: an SDB listing one
/// acquisition and one position calculation core, and
/// a sample memory holding a sine wave.
///
/// The acquisition core always reports a finished
/// acquisition with the trigger in the middle of the
/// ring. The ring in `settings` is moved into the
/// simulated sample memory.
pub fn simulated_board(settings : &mut Settings) -> Result<PcieDevice, RegError> {
  let root     = settings.sdb_root;
  let control  = SimRegion::new((root + 0x1000) as usize);
  let sample   = SimRegion::new(SIM_SAMPLE_MEMORY as usize);
  settings.acq_ring_start = 0;
  settings.acq_ring_size  = SIM_SAMPLE_MEMORY;

  let cores = [
    SdbDevice {
      info : DeviceInfo {
        start_addr    : root + SIM_ACQ_OFFSET,
        vendor_id     : LNLS_VENDOR_ID,
        device_id     : ACQ_CORE_DEVICE_ID,
        abi_ver_major : ACQ_CORE_ABI_MAJOR,
        abi_ver_minor : 0,
      },
      addr_last : root + SIM_ACQ_OFFSET + 0x1ff,
      name      : String::from("LNLS_BPM_ACQ_CORE"),
    },
    SdbDevice {
      info : DeviceInfo {
        start_addr    : root + SIM_POS_CALC_OFFSET,
        vendor_id     : LNLS_VENDOR_ID,
        device_id     : POS_CALC_DEVICE_ID,
        abi_ver_major : POS_CALC_ABI_MAJOR,
        abi_ver_minor : 1,
      },
      addr_last : root + SIM_POS_CALC_OFFSET + 0xff,
      name      : String::from("LNLS_POS_CALC"),
    },
  ];
  write_words(&control, root, &interconnect_words(cores.len() as u16 + 1))?;
  for (k, core) in cores.iter().enumerate() {
    write_words(&control, root + (k as u64 + 1)*SDB_RECORD_SIZE, &core.to_words(root))?;
  }

  let acq = root + SIM_ACQ_OFFSET;
  control.poke(acq + ACQ_STA, ACQ_FSM_IDLE as u32
                              | ACQ_STA_FSM_ACQ_DONE
                              | ACQ_STA_FC_TRANS_DONE
                              | ACQ_STA_DDR3_TRANS_DONE);
  control.poke(acq + ACQ_TRIG_POS, (SIM_SAMPLE_MEMORY/2) as u32);
  control.poke(acq + ACQ_CHAN_CTL, 2 << 16);
  // channel 0: 2 atoms of 16 bits, channel 1: 1 atom of 32 bits
  control.poke(acq + ACQ_CH0_DESC,                          (2 << 16) | 16);
  control.poke(acq + ACQ_CH0_ATOM_DESC,                     (16 << 16) | 2);
  control.poke(acq + ACQ_CH0_DESC + ACQ_CH_DESC_STRIDE,      (1 << 16) | 32);
  control.poke(acq + ACQ_CH0_ATOM_DESC + ACQ_CH_DESC_STRIDE, (32 << 16) | 1);

  let pos = root + SIM_POS_CALC_OFFSET;
  control.poke(pos + POS_CALC_KX,   10_000_000);
  control.poke(pos + POS_CALC_KY,   10_000_000);
  control.poke(pos + POS_CALC_KSUM, 1 << POS_CALC_KSUM_POINT_POS);
  for ch in 0..POS_CALC_NUM_CHAN as u64 {
    control.poke(pos + POS_CALC_CH0_GAIN + 4*ch, 1 << POS_CALC_GAIN_POINT_POS);
  }

  let mut wave = Vec::<u8>::with_capacity(SIM_SAMPLE_MEMORY as usize);
  for k in 0..SIM_SAMPLE_MEMORY/2 {
    let value = (20000.0*(2.0*PI*k as f64/256.0).sin()) as i16;
    wave.extend_from_slice(&value.to_le_bytes());
  }
  sample.poke_bytes(0, &wave);
  debug!("Simulated board with SDB at {:#x}", root);
  Ok(PcieDevice::new(Arc::new(control), Arc::new(sample)))
}
