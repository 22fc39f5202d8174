//! Position calculation core
//!
//! Turns the amplitudes of the four BPM antennas into
//! beam positions. Decoding shows the scale factors,
//! offsets and thresholds of the calculation, the
//! controller sets them.
//!
//! The tag trigger enable bit only exists from ABI
//! version 1.1 on.

use std::sync::Arc;

use crate::controller::{parse_bool,
                        parse_float,
                        parse_int,
                        parse_u32,
                        Controller,
                        RegisterController};
use crate::decoder::{Decoder,
                     FieldKind,
                     FieldSpec,
                     FieldTable,
                     RegisterDecoder};
use crate::errors::RegError;
use crate::memory::PcieDevice;
use crate::registers::*;
use crate::sdb::DeviceMatch;

pub const POS_CALC : DeviceMatch = DeviceMatch {
  vendor_id     : LNLS_VENDOR_ID,
  device_id     : POS_CALC_DEVICE_ID,
  abi_ver_major : POS_CALC_ABI_MAJOR,
};

pub fn pos_calc_field_table() -> FieldTable {
  FieldTable::new(vec![
    FieldSpec::new("ds_tbt_thres",   "TBT difference/sum minimum sum",   FieldKind::Integer),
    FieldSpec::new("ds_fofb_thres",  "FOFB difference/sum minimum sum",  FieldKind::Integer),
    FieldSpec::new("ds_monit_thres", "monit difference/sum minimum sum", FieldKind::Integer),
    FieldSpec::new("kx",             "X scale (nm)",                     FieldKind::Integer),
    FieldSpec::new("ky",             "Y scale (nm)",                     FieldKind::Integer),
    FieldSpec::new("ksum",           "sum scale",                        FieldKind::FixedPoint { point_pos : POS_CALC_KSUM_POINT_POS }),
    FieldSpec::new("offset_x",       "X offset (nm)",                    FieldKind::TwosComplement),
    FieldSpec::new("offset_y",       "Y offset (nm)",                    FieldKind::TwosComplement),
    FieldSpec::new("tbt_tag_en",     "TBT tag trigger",                  FieldKind::Enable),
    FieldSpec::new("desync_cnt",     "TBT desynchronization counter",    FieldKind::Integer),
    FieldSpec::new("ctnr_tbt_ch01",  "TBT CIC counter, channels 0/1",    FieldKind::Integer),
    FieldSpec::new("ctnr_tbt_ch23",  "TBT CIC counter, channels 2/3",    FieldKind::Integer),
    FieldSpec::new("gain",           "antenna gain",                     FieldKind::FixedPoint { point_pos : POS_CALC_GAIN_POINT_POS }),
  ])
}

fn has_tag_trigger(minor : u8) -> bool {
  minor >= POS_CALC_SW_TAG_EN_MIN_ABI
}

pub struct PosCalcDecoder {
  base : RegisterDecoder,
  regs : Vec<u32>,
}

impl PosCalcDecoder {

  pub fn new(device : PcieDevice) -> Self {
    Self {
      base : RegisterDecoder::new(device, POS_CALC, Arc::new(pos_calc_field_table())),
      regs : vec![0u32; POS_CALC_REGS_WORDS],
    }
  }
}

impl Decoder for PosCalcDecoder {

  fn base(&self) -> &RegisterDecoder {
    &self.base
  }

  fn base_mut(&mut self) -> &mut RegisterDecoder {
    &mut self.base
  }

  fn read(&mut self) -> Result<(), RegError> {
    self.base.read_block(0, &mut self.regs)
  }

  fn decode(&mut self) -> Result<(), RegError> {
    let regs  = &self.regs;
    let base  = &mut self.base;
    let minor = base.devinfo()?.abi_ver_minor;
    base.values.set_number_of_channels(POS_CALC_NUM_CHAN);

    base.decode_field("ds_tbt_thres",   regs[word(POS_CALC_DS_TBT_THRES)],   POS_CALC_DS_THRES_VAL, false)?;
    base.decode_field("ds_fofb_thres",  regs[word(POS_CALC_DS_FOFB_THRES)],  POS_CALC_DS_THRES_VAL, false)?;
    base.decode_field("ds_monit_thres", regs[word(POS_CALC_DS_MONIT_THRES)], POS_CALC_DS_THRES_VAL, false)?;
    base.decode_field("kx", regs[word(POS_CALC_KX)], POS_CALC_K_VAL, false)?;
    base.decode_field("ky", regs[word(POS_CALC_KY)], POS_CALC_K_VAL, false)?;
    base.decode_fixed("ksum", regs[word(POS_CALC_KSUM)], POS_CALC_KSUM_POINT_POS)?;
    base.decode_field("offset_x", regs[word(POS_CALC_OFFSET_X)], POS_CALC_OFFSET_VAL, true)?;
    base.decode_field("offset_y", regs[word(POS_CALC_OFFSET_Y)], POS_CALC_OFFSET_VAL, true)?;

    let sw_tag = regs[word(POS_CALC_SW_TAG)];
    if has_tag_trigger(minor) {
      base.decode_field("tbt_tag_en", sw_tag, POS_CALC_SW_TAG_EN, false)?;
    }
    base.decode_field("desync_cnt", sw_tag, POS_CALC_SW_DESYNC_CNT, false)?;
    let ctnr = regs[word(POS_CALC_DSP_CTNR_TBT)];
    base.decode_field("ctnr_tbt_ch01", ctnr, POS_CALC_DSP_CTNR_CH01, false)?;
    base.decode_field("ctnr_tbt_ch23", ctnr, POS_CALC_DSP_CTNR_CH23, false)?;

    for ch in 0..POS_CALC_NUM_CHAN {
      base.decode_channel_fixed("gain", ch, regs[word(POS_CALC_CH0_GAIN) + ch], POS_CALC_GAIN_POINT_POS)?;
    }
    Ok(())
  }
}

/// Parameters of the position calculation, `None`
/// leaves the register as it is
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PosCalcParams {
  pub ds_tbt_thres   : Option<u32>,
  pub ds_fofb_thres  : Option<u32>,
  pub ds_monit_thres : Option<u32>,
  pub kx             : Option<u32>,
  pub ky             : Option<u32>,
  pub ksum           : Option<f64>,
  pub offset_x       : Option<i32>,
  pub offset_y       : Option<i32>,
  pub tbt_tag_en     : Option<bool>,
  pub gains          : [Option<f64>; POS_CALC_NUM_CHAN],
  // commands, cleared after each write
  pub desync_cnt_rst : Option<bool>,
  pub clr_tbt_err    : Option<bool>,
  pub clr_fofb_err   : Option<bool>,
  pub clr_monit_err  : Option<bool>,
}

const COMMANDS : [&str; 4] = ["desync_cnt_rst", "clr_tbt_err", "clr_fofb_err", "clr_monit_err"];

pub struct PosCalcController {
  base       : RegisterController,
  pub params : PosCalcParams,
}

impl PosCalcController {

  pub fn new(device : PcieDevice) -> Self {
    Self {
      base   : RegisterController::new(device, POS_CALC, POS_CALC_REGS_WORDS, true),
      params : PosCalcParams::default(),
    }
  }
}

/// "gain2" -> 2
fn gain_channel(name : &str) -> Option<usize> {
  name.strip_prefix("gain")
    .and_then(|ch| ch.parse::<usize>().ok())
    .filter(|ch| *ch < POS_CALC_NUM_CHAN)
}

fn parse_i32(name : &str, value : &str) -> Result<i32, RegError> {
  i32::try_from(parse_int(name, value)?).map_err(|_| RegError::InvalidParameterValue {
    name  : String::from(name),
    value : String::from(value),
  })
}

impl Controller for PosCalcController {

  fn base(&self) -> &RegisterController {
    &self.base
  }

  fn base_mut(&mut self) -> &mut RegisterController {
    &mut self.base
  }

  fn encode_params(&mut self) -> Result<(), RegError> {
    let p     = self.params.clone();
    let minor = self.base.devinfo()?.abi_ver_minor;
    let base  = &mut self.base;

    let thresholds = [(p.ds_tbt_thres,   POS_CALC_DS_TBT_THRES),
                      (p.ds_fofb_thres,  POS_CALC_DS_FOFB_THRES),
                      (p.ds_monit_thres, POS_CALC_DS_MONIT_THRES)];
    for (value, reg) in thresholds {
      if let Some(value) = value {
        base.encode_field(word(reg), value as i64, POS_CALC_DS_THRES_VAL, false)?;
      }
    }
    for (value, reg) in [(p.kx, POS_CALC_KX), (p.ky, POS_CALC_KY)] {
      if let Some(value) = value {
        base.encode_field(word(reg), value as i64, POS_CALC_K_VAL, false)?;
      }
    }
    if let Some(ksum) = p.ksum {
      base.encode_fixed(word(POS_CALC_KSUM), ksum, POS_CALC_KSUM_POINT_POS, false)?;
    }
    for (value, reg) in [(p.offset_x, POS_CALC_OFFSET_X), (p.offset_y, POS_CALC_OFFSET_Y)] {
      if let Some(value) = value {
        base.encode_field(word(reg), value as i64, POS_CALC_OFFSET_VAL, true)?;
      }
    }

    let sw_tag = word(POS_CALC_SW_TAG);
    if let Some(enable) = p.tbt_tag_en {
      if !has_tag_trigger(minor) {
        return Err(RegError::Unsupported(format!("tag trigger enable needs position calculation ABI 1.{}, core is 1.{}",
                                                 POS_CALC_SW_TAG_EN_MIN_ABI, minor)));
      }
      base.encode_bit(sw_tag, enable, POS_CALC_SW_TAG_EN)?;
    }
    base.encode_bit(sw_tag, p.desync_cnt_rst.unwrap_or(false), POS_CALC_SW_DESYNC_CNT_RST)?;

    let clr = word(POS_CALC_DSP_ERR_CLR);
    base.encode_bit(clr, p.clr_tbt_err.unwrap_or(false),   POS_CALC_DSP_ERR_CLR_TBT)?;
    base.encode_bit(clr, p.clr_fofb_err.unwrap_or(false),  POS_CALC_DSP_ERR_CLR_FOFB)?;
    base.encode_bit(clr, p.clr_monit_err.unwrap_or(false), POS_CALC_DSP_ERR_CLR_MONIT)?;

    for (ch, gain) in p.gains.iter().enumerate() {
      if let Some(gain) = gain {
        base.encode_fixed(word(POS_CALC_CH0_GAIN) + ch, *gain, POS_CALC_GAIN_POINT_POS, false)?;
      }
    }
    Ok(())
  }

  fn command_params(&self) -> &'static [&'static str] {
    &COMMANDS
  }

  fn unset_param(&mut self, name : &str) -> Result<(), RegError> {
    let p = &mut self.params;
    match name {
      "ds_tbt_thres"   => p.ds_tbt_thres   = None,
      "ds_fofb_thres"  => p.ds_fofb_thres  = None,
      "ds_monit_thres" => p.ds_monit_thres = None,
      "kx"             => p.kx             = None,
      "ky"             => p.ky             = None,
      "ksum"           => p.ksum           = None,
      "offset_x"       => p.offset_x       = None,
      "offset_y"       => p.offset_y       = None,
      "tbt_tag_en"     => p.tbt_tag_en     = None,
      "desync_cnt_rst" => p.desync_cnt_rst = None,
      "clr_tbt_err"    => p.clr_tbt_err    = None,
      "clr_fofb_err"   => p.clr_fofb_err   = None,
      "clr_monit_err"  => p.clr_monit_err  = None,
      other => match gain_channel(other) {
        Some(ch) => p.gains[ch] = None,
        None     => return Err(RegError::UnknownParameter(String::from(name))),
      }
    }
    Ok(())
  }

  fn set_named(&mut self, name : &str, value : &str) -> Result<(), RegError> {
    let p = &mut self.params;
    match name {
      "ds_tbt_thres"   => p.ds_tbt_thres   = Some(parse_u32(name, value)?),
      "ds_fofb_thres"  => p.ds_fofb_thres  = Some(parse_u32(name, value)?),
      "ds_monit_thres" => p.ds_monit_thres = Some(parse_u32(name, value)?),
      "kx"             => p.kx             = Some(parse_u32(name, value)?),
      "ky"             => p.ky             = Some(parse_u32(name, value)?),
      "ksum"           => p.ksum           = Some(parse_float(name, value)?),
      "offset_x"       => p.offset_x       = Some(parse_i32(name, value)?),
      "offset_y"       => p.offset_y       = Some(parse_i32(name, value)?),
      "tbt_tag_en"     => p.tbt_tag_en     = Some(parse_bool(name, value)?),
      "desync_cnt_rst" => p.desync_cnt_rst = Some(parse_bool(name, value)?),
      "clr_tbt_err"    => p.clr_tbt_err    = Some(parse_bool(name, value)?),
      "clr_fofb_err"   => p.clr_fofb_err   = Some(parse_bool(name, value)?),
      "clr_monit_err"  => p.clr_monit_err  = Some(parse_bool(name, value)?),
      other => match gain_channel(other) {
        Some(ch) => p.gains[ch] = Some(parse_float(name, value)?),
        None     => return Err(RegError::UnknownParameter(String::from(name))),
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sdb::DeviceInfo;
  use crate::sim::SimRegion;

  const BASE : u64 = 0x200;

  fn info(minor : u8) -> DeviceInfo {
    DeviceInfo {
      start_addr    : BASE,
      vendor_id     : LNLS_VENDOR_ID,
      device_id     : POS_CALC_DEVICE_ID,
      abi_ver_major : POS_CALC_ABI_MAJOR,
      abi_ver_minor : minor,
    }
  }

  fn device() -> (PcieDevice, SimRegion) {
    let control = SimRegion::new(0x400);
    (PcieDevice::new(Arc::new(control.clone()), Arc::new(SimRegion::new(0))), control)
  }

  #[test]
  fn decode_fields() {
    let (device, control) = device();
    control.poke(BASE + POS_CALC_KX,       10_000_000);
    control.poke(BASE + POS_CALC_KSUM,     1 << 24);
    control.poke(BASE + POS_CALC_OFFSET_Y, (-250i32) as u32);
    control.poke(BASE + POS_CALC_SW_TAG,   (7 << 16) | POS_CALC_SW_TAG_EN);
    control.poke(BASE + POS_CALC_CH0_GAIN + 8, 3 << 15);
    let mut decoder = PosCalcDecoder::new(device);
    decoder.set_devinfo(info(1)).unwrap();
    decoder.get_data().unwrap();
    assert_eq!(decoder.get_general::<i32>("kx").unwrap(), 10_000_000);
    assert_eq!(decoder.get_general::<f64>("ksum").unwrap(), 1.0);
    assert_eq!(decoder.get_general::<i32>("offset_y").unwrap(), -250);
    assert_eq!(decoder.get_general::<i32>("tbt_tag_en").unwrap(), 1);
    assert_eq!(decoder.get_general::<i32>("desync_cnt").unwrap(), 7);
    assert_eq!(decoder.get_channel::<f64>("gain", 2).unwrap(), 1.5);
    assert!(matches!(decoder.get_channel::<f64>("gain", 4), Err(RegError::ChannelOutOfRange { .. })));
  }

  #[test]
  fn tag_trigger_needs_minor_1() {
    let (device, control) = device();
    control.poke(BASE + POS_CALC_SW_TAG, POS_CALC_SW_TAG_EN);
    let mut decoder = PosCalcDecoder::new(device.clone());
    decoder.set_devinfo(info(0)).unwrap();
    decoder.get_data().unwrap();
    assert!(matches!(decoder.get_general::<i32>("tbt_tag_en"), Err(RegError::KeyNotFound(_))));
    assert!(!decoder.values().general_fields().iter().any(|f| f == "tbt_tag_en"));

    let mut ctl = PosCalcController::new(device);
    ctl.set_devinfo(info(0)).unwrap();
    ctl.set_named("tbt_tag_en", "1").unwrap();
    assert!(matches!(ctl.write_params(), Err(RegError::Unsupported(_))));
  }

  #[test]
  fn write_and_clear_commands() {
    let (device, control) = device();
    control.poke(BASE + POS_CALC_KY, 1234);
    let mut ctl = PosCalcController::new(device);
    ctl.set_devinfo(info(1)).unwrap();
    ctl.set_named("kx", "0x10").unwrap();
    ctl.set_named("ksum", "0.5").unwrap();
    ctl.set_named("offset_x", "-3").unwrap();
    ctl.set_named("gain3", "2.0").unwrap();
    ctl.set_named("desync_cnt_rst", "true").unwrap();
    ctl.set_named("clr_fofb_err", "1").unwrap();
    ctl.write_params().unwrap();
    assert_eq!(control.peek(BASE + POS_CALC_KX), 0x10);
    // untouched, read back before the write
    assert_eq!(control.peek(BASE + POS_CALC_KY), 1234);
    assert_eq!(control.peek(BASE + POS_CALC_KSUM), 1 << 23);
    assert_eq!(control.peek(BASE + POS_CALC_OFFSET_X), (-3i32) as u32);
    assert_eq!(control.peek(BASE + POS_CALC_CH0_GAIN + 12), 2 << 16);
    assert_eq!(control.peek(BASE + POS_CALC_SW_TAG) & POS_CALC_SW_DESYNC_CNT_RST, POS_CALC_SW_DESYNC_CNT_RST);
    assert_eq!(control.peek(BASE + POS_CALC_DSP_ERR_CLR), POS_CALC_DSP_ERR_CLR_FOFB);
    assert_eq!(ctl.params.desync_cnt_rst, None);
    assert_eq!(ctl.params.clr_fofb_err, None);
    assert_eq!(ctl.params.kx, Some(0x10));

    // the hardware clears the strobes
    control.poke(BASE + POS_CALC_SW_TAG, 0);
    control.poke(BASE + POS_CALC_DSP_ERR_CLR, 0);
    ctl.write_params().unwrap();
    assert_eq!(control.peek(BASE + POS_CALC_SW_TAG), 0);
    assert_eq!(control.peek(BASE + POS_CALC_DSP_ERR_CLR), 0);
  }

  #[test]
  fn out_of_range_values() {
    let (device, _) = device();
    let mut ctl = PosCalcController::new(device);
    ctl.set_devinfo(info(1)).unwrap();
    ctl.set_named("kx", "0x2000000").unwrap();
    assert!(matches!(ctl.write_params(), Err(RegError::ValueOutOfRange { .. })));
    ctl.unset_param("kx").unwrap();
    ctl.set_named("gain0", "40000").unwrap();
    assert!(matches!(ctl.write_params(), Err(RegError::FixedPointOutOfRange { .. })));
    assert!(matches!(ctl.set_named("gain4", "1"), Err(RegError::UnknownParameter(_))));
  }
}
