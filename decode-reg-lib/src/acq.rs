//! The acquisition core
//!
//! The core writes samples of one of its channels into a
//! ring in the DDR memory of the board, which is read
//! through BAR2 once the acquisition is over.
//!
//! An acquisition goes through
//!
//! ```text
//!  Stopped --start_acquisition--> Started --poll--> Done --result--> Stopped
//! ```
//!
//! Nothing runs in the background, the caller drives the
//! state machine by polling (`result`), or by the blocking
//! `result_timeout`, which spins on the same poll.
//!
//! Samples are `sample_size` bytes in the ring, made of
//! `num_atoms` atoms of `atom_width` bits each. The pre
//! and post trigger sample counts the hardware sees are
//! aligned to the DDR payload size.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration,
                Instant};

use serde::Serialize;

use crate::bits::{extract,
                  sign_extend};
use crate::controller::{parse_bool,
                        parse_int,
                        parse_u32,
                        Controller,
                        RegisterController};
use crate::decoder::{Decoder,
                     FieldKind,
                     FieldSpec,
                     FieldTable,
                     RegisterDecoder,
                     Value};
use crate::errors::RegError;
use crate::memory::{write_word,
                    MemoryRegion,
                    PcieDevice,
                    SIZEOF_U32};
use crate::registers::*;
use crate::sdb::{DeviceInfo,
                 DeviceMatch};
use crate::settings::Settings;

pub const ACQ_CORE : DeviceMatch = DeviceMatch {
  vendor_id     : LNLS_VENDOR_ID,
  device_id     : ACQ_CORE_DEVICE_ID,
  abi_ver_major : ACQ_CORE_ABI_MAJOR,
};

/// Registers written when configuring an acquisition,
/// as (first word, number of words), in address order.
/// Status, trigger position, sample counter, software
/// trigger and the descriptors are left alone.
const CONFIG_BLOCKS : [(usize, usize); 6] = [
  (word(ACQ_CTL),             1),
  (word(ACQ_TRIG_CFG),        4),
  (word(ACQ_SHOTS),           1),
  (word(ACQ_PRE_SAMPLES),     2),
  (word(ACQ_DDR3_START_ADDR), 1),
  (word(ACQ_CHAN_CTL),        1),
];

fn fsm_state_name(value : &Value) -> String {
  match value {
    Value::Int(ACQ_FSM_IDLE)      => String::from("IDLE"),
    Value::Int(ACQ_FSM_PRE_TRIG)  => String::from("PRE_TRIG"),
    Value::Int(ACQ_FSM_WAIT_TRIG) => String::from("WAIT_TRIG"),
    Value::Int(ACQ_FSM_POST_TRIG) => String::from("POST_TRIG"),
    Value::Int(ACQ_FSM_DECR_SHOT) => String::from("DECR_SHOT"),
    other                         => format!("unknown ({})", other),
  }
}

pub fn acq_field_table() -> FieldTable {
  FieldTable::new(vec![
    FieldSpec::new("acq_now",            "acquire without waiting for a trigger", FieldKind::Enable),
    FieldSpec::new("fsm_state",          "acquisition state machine",            FieldKind::custom(fsm_state_name)),
    FieldSpec::new("fsm_acq_done",       "acquisition",                          FieldKind::Progress),
    FieldSpec::new("fc_trans_done",      "flow control transfer",                FieldKind::Progress),
    FieldSpec::new("fc_full",            "flow control fifo",                    FieldKind::boolean("full", "not full")),
    FieldSpec::new("ddr3_trans_done",    "DDR3 transfer",                        FieldKind::Progress),
    FieldSpec::new("hw_trig_sel",        "hardware trigger source",              FieldKind::boolean("external", "internal (data driven)")),
    FieldSpec::new("hw_trig_pol",        "hardware trigger polarity",            FieldKind::boolean("negative edge", "positive edge")),
    FieldSpec::new("hw_trig_en",         "hardware trigger",                     FieldKind::Enable),
    FieldSpec::new("sw_trig_en",         "software trigger",                     FieldKind::Enable),
    FieldSpec::new("int_trig_sel",       "atom the data trigger looks at",       FieldKind::Integer),
    FieldSpec::new("thres_filt_in",      "data trigger hysteresis going in",     FieldKind::Integer),
    FieldSpec::new("thres_filt_out",     "data trigger hysteresis going out",    FieldKind::Integer),
    FieldSpec::new("trig_data_thres",    "data trigger threshold",               FieldKind::TwosComplement),
    FieldSpec::new("trig_dly",           "trigger delay (samples)",              FieldKind::Integer),
    FieldSpec::new("shots_nb",           "number of shots",                      FieldKind::Integer),
    FieldSpec::new("multishot_ram_size", "multishot RAM size (samples)",         FieldKind::Integer),
    FieldSpec::new("trig_pos",           "DDR address of the last trigger",      FieldKind::Hex),
    FieldSpec::new("pre_samples",        "pre trigger samples",                  FieldKind::Integer),
    FieldSpec::new("post_samples",       "post trigger samples",                 FieldKind::Integer),
    FieldSpec::new("samples_cnt",        "samples acquired",                     FieldKind::Integer),
    FieldSpec::new("ddr3_start_addr",    "start of the acquisition ring",        FieldKind::Hex),
    FieldSpec::new("ddr3_end_addr",      "end of the acquisition ring",          FieldKind::Hex),
    FieldSpec::new("acq_chan",           "channel to acquire",                   FieldKind::Integer),
    FieldSpec::new("dtrig_chan",         "channel the data trigger looks at",    FieldKind::Integer),
    FieldSpec::new("num_chan",           "number of channels",                   FieldKind::Integer),
    FieldSpec::new("int_width",          "sample width (bits)",                  FieldKind::Integer),
    FieldSpec::new("num_coalesce",       "samples per DDR word",                 FieldKind::Integer),
    FieldSpec::new("num_atoms",          "atoms per sample",                     FieldKind::Integer),
    FieldSpec::new("atom_width",         "atom width (bits)",                    FieldKind::Integer),
  ])
}

/// Layout of the samples of one channel, as reported by
/// the core
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelDesc {
  pub int_width    : u32,
  pub num_coalesce : u32,
  pub num_atoms    : u32,
  pub atom_width   : u32,
}

impl ChannelDesc {

  /// Bytes of one sample in the DDR memory
  pub fn sample_size(&self) -> Result<u32, RegError> {
    let size = self.int_width/8*self.num_coalesce;
    if self.int_width % 8 != 0 || size == 0 {
      return Err(RegError::UnsupportedWidth(self.int_width));
    }
    Ok(size)
  }

  /// Sample counts have to be multiples of this
  pub fn alignment(&self, ddr_payload_size : u32) -> Result<u32, RegError> {
    Ok(u32::max(1, ddr_payload_size/self.sample_size()?))
  }
}

/// Round `n` up to the next multiple of `alignment`
pub fn align_up(n : u32, alignment : u32) -> u64 {
  let alignment = u64::max(1, alignment as u64);
  (n as u64 + alignment - 1) / alignment * alignment
}

/// DDR address of the first pre trigger sample. Can be
/// below the ring start, it wraps around.
pub fn initial_position(trigger_pos : u64, sample_size : u32, pre_samples : u32) -> i64 {
  trigger_pos as i64 - sample_size as i64 * pre_samples as i64
}

/// Offset of `pos` inside the ring `[start, start + len)`
pub fn ring_offset(pos : i64, start : u64, len : u64) -> u64 {
  (pos - start as i64).rem_euclid(len as i64) as u64
}

/// Check the four status bits which all have to be set
/// at the end of an acquisition
pub fn acquisition_complete(sta : u32) -> Result<bool, RegError> {
  let idle = extract(sta, ACQ_STA_FSM_STATE, false)? == ACQ_FSM_IDLE as i64;
  Ok(idle
     && sta & ACQ_STA_FSM_ACQ_DONE    != 0
     && sta & ACQ_STA_FC_TRANS_DONE   != 0
     && sta & ACQ_STA_DDR3_TRANS_DONE != 0)
}

/// Bytes of an atom of `atom_width` bits
pub fn atom_size(atom_width : u32) -> Result<usize, RegError> {
  match atom_width {
    8 | 16 | 32 => Ok(atom_width as usize/8),
    _           => Err(RegError::UnsupportedWidth(atom_width)),
  }
}

/// The samples of an acquisition, widened to 32bit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Samples {
  Unsigned(Vec<u32>),
  Signed(Vec<i32>),
}

impl Samples {

  pub fn len(&self) -> usize {
    match self {
      Samples::Unsigned(v) => v.len(),
      Samples::Signed(v)   => v.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn to_i64(&self) -> Vec<i64> {
    match self {
      Samples::Unsigned(v) => v.iter().map(|x| *x as i64).collect(),
      Samples::Signed(v)   => v.iter().map(|x| *x as i64).collect(),
    }
  }
}

/// Turn raw little endian atoms into samples
///
/// # Arguments
///
/// * bytes      : raw atoms as read from the ring
/// * atom_width : 8, 16 or 32
/// * signed     : sign extend from the atom width
pub fn decode_atoms(bytes      : &[u8],
                    atom_width : u32,
                    signed     : bool) -> Result<Samples, RegError> {
  let size = atom_size(atom_width)?;
  let raw  = bytes.chunks_exact(size).map(|chunk| {
    match size {
      1 => chunk[0] as u32,
      2 => u16::from_le_bytes([chunk[0], chunk[1]]) as u32,
      _ => u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
    }
  });
  if signed {
    let values : Result<Vec<i32>, RegError> = raw.map(|r| sign_extend(r, atom_width)).collect();
    return Ok(Samples::Signed(values?));
  }
  Ok(Samples::Unsigned(raw.collect()))
}

/// Read `len` bytes from the ring `[start, start + size)`
/// beginning at `offset`, continuing at the start of the
/// ring when hitting its end.
pub fn read_ring(region : &dyn MemoryRegion,
                 start  : u64,
                 size   : u64,
                 offset : u64,
                 len    : usize) -> Result<Vec<u8>, RegError> {
  // the transport only moves whole words
  if start % 4 != 0 || size % 4 != 0 || size == 0 {
    return Err(RegError::Transport(format!("ring of {} bytes at {:#x} is not word aligned", size, start)));
  }
  let lead  = (offset % 4) as usize;
  let total = (lead + len + 3)/4*4;
  let mut bytes = vec![0u8; total];
  let mut pos   = offset - lead as u64;
  let mut done  = 0usize;
  while done < total {
    let chunk = usize::min(total - done, (size - pos) as usize);
    if pos + chunk as u64 == size && done + chunk < total {
      trace!("Acquisition ring wraps around after {} bytes", done + chunk);
    }
    region.read(start + pos, &mut bytes[done..done + chunk])?;
    done += chunk;
    pos   = (pos + chunk as u64) % size;
  }
  bytes.drain(..lead);
  bytes.truncate(len);
  Ok(bytes)
}

//=======================================

/// Named trigger presets
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum TriggerType {
  /// acquire right away
  Immediate,
  /// wait for the external trigger input
  External,
  /// trigger on the data of a channel crossing a threshold
  DataDriven,
  /// wait for a write to the software trigger register
  Software,
}

/// The control bits a trigger preset stands for
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TriggerBits {
  pub acq_now     : bool,
  pub hw_trig_en  : bool,
  pub sw_trig_en  : bool,
  pub hw_trig_sel : bool,
}

impl TriggerType {

  pub fn bits(&self) -> TriggerBits {
    let (acq_now, hw_trig_en, sw_trig_en, hw_trig_sel) = match self {
      TriggerType::Immediate  => (true,  false, false, false),
      TriggerType::External   => (false, true,  false, true),
      TriggerType::DataDriven => (false, true,  false, false),
      TriggerType::Software   => (false, false, true,  false),
    };
    TriggerBits { acq_now, hw_trig_en, sw_trig_en, hw_trig_sel }
  }
}

impl FromStr for TriggerType {
  type Err = RegError;

  fn from_str(s : &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "immediate" | "now"                          => Ok(TriggerType::Immediate),
      "external"  | "ext"                          => Ok(TriggerType::External),
      "data-driven" | "data_driven" | "data"       => Ok(TriggerType::DataDriven),
      "software"  | "sw"                           => Ok(TriggerType::Software),
      _ => Err(RegError::InvalidTriggerType(String::from(s))),
    }
  }
}

impl fmt::Display for TriggerType {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let name = match self {
      TriggerType::Immediate  => "immediate",
      TriggerType::External   => "external",
      TriggerType::DataDriven => "data-driven",
      TriggerType::Software   => "software",
    };
    write!(f, "{}", name)
  }
}

//=======================================

pub struct AcqDecoder {
  base : RegisterDecoder,
  regs : Vec<u32>,
}

impl AcqDecoder {

  pub fn new(device : PcieDevice) -> Self {
    Self {
      base : RegisterDecoder::new(device, ACQ_CORE, Arc::new(acq_field_table())),
      regs : vec![0u32; ACQ_REGS_WORDS],
    }
  }

  /// The register block as read last
  pub fn raw(&self) -> &[u32] {
    &self.regs
  }

  /// Sample layout of channel `index`, from the last decode
  pub fn channel_desc(&self, index : usize) -> Result<ChannelDesc, RegError> {
    Ok(ChannelDesc {
      int_width    : self.get_channel::<i32>("int_width",    index)? as u32,
      num_coalesce : self.get_channel::<i32>("num_coalesce", index)? as u32,
      num_atoms    : self.get_channel::<i32>("num_atoms",    index)? as u32,
      atom_width   : self.get_channel::<i32>("atom_width",   index)? as u32,
    })
  }
}

impl Decoder for AcqDecoder {

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
    let regs = &self.regs;
    let base = &mut self.base;

    let chan_ctl = regs[word(ACQ_CHAN_CTL)];
    let num_chan = extract(chan_ctl, ACQ_CHAN_CTL_NUM_CHAN, false)? as usize;
    if num_chan > ACQ_MAX_NUM_CHAN {
      return Err(RegError::TooManyChannels { found : num_chan, max : ACQ_MAX_NUM_CHAN });
    }
    base.values.set_number_of_channels(num_chan);

    let ctl = regs[word(ACQ_CTL)];
    base.decode_field("acq_now",         ctl, ACQ_CTL_FSM_ACQ_NOW,     false)?;
    let sta = regs[word(ACQ_STA)];
    base.decode_field("fsm_state",       sta, ACQ_STA_FSM_STATE,       false)?;
    base.decode_field("fsm_acq_done",    sta, ACQ_STA_FSM_ACQ_DONE,    false)?;
    base.decode_field("fc_trans_done",   sta, ACQ_STA_FC_TRANS_DONE,   false)?;
    base.decode_field("fc_full",         sta, ACQ_STA_FC_FULL,         false)?;
    base.decode_field("ddr3_trans_done", sta, ACQ_STA_DDR3_TRANS_DONE, false)?;

    let trig_cfg = regs[word(ACQ_TRIG_CFG)];
    base.decode_field("hw_trig_sel",  trig_cfg, ACQ_TRIG_CFG_HW_TRIG_SEL,  false)?;
    base.decode_field("hw_trig_pol",  trig_cfg, ACQ_TRIG_CFG_HW_TRIG_POL,  false)?;
    base.decode_field("hw_trig_en",   trig_cfg, ACQ_TRIG_CFG_HW_TRIG_EN,   false)?;
    base.decode_field("sw_trig_en",   trig_cfg, ACQ_TRIG_CFG_SW_TRIG_EN,   false)?;
    base.decode_field("int_trig_sel", trig_cfg, ACQ_TRIG_CFG_INT_TRIG_SEL, false)?;
    let data_cfg = regs[word(ACQ_TRIG_DATA_CFG)];
    base.decode_field("thres_filt_in",  data_cfg, ACQ_TRIG_DATA_CFG_FILT_IN,  false)?;
    base.decode_field("thres_filt_out", data_cfg, ACQ_TRIG_DATA_CFG_FILT_OUT, false)?;
    base.decode_field("trig_data_thres", regs[word(ACQ_TRIG_DATA_THRES)], u32::MAX, true)?;
    base.decode_field("trig_dly",        regs[word(ACQ_TRIG_DLY)],        u32::MAX, false)?;

    let shots = regs[word(ACQ_SHOTS)];
    base.decode_field("shots_nb",           shots, ACQ_SHOTS_NB,       false)?;
    base.decode_field("multishot_ram_size", shots, ACQ_SHOTS_RAM_SIZE, false)?;
    base.decode_field("trig_pos",        regs[word(ACQ_TRIG_POS)],        u32::MAX, false)?;
    base.decode_field("pre_samples",     regs[word(ACQ_PRE_SAMPLES)],     u32::MAX, false)?;
    base.decode_field("post_samples",    regs[word(ACQ_POST_SAMPLES)],    u32::MAX, false)?;
    base.decode_field("samples_cnt",     regs[word(ACQ_SAMPLES_CNT)],     u32::MAX, false)?;
    base.decode_field("ddr3_start_addr", regs[word(ACQ_DDR3_START_ADDR)], u32::MAX, false)?;
    base.decode_field("ddr3_end_addr",   regs[word(ACQ_DDR3_END_ADDR)],   u32::MAX, false)?;
    base.decode_field("acq_chan",   chan_ctl, ACQ_CHAN_CTL_WHICH,       false)?;
    base.decode_field("dtrig_chan", chan_ctl, ACQ_CHAN_CTL_DTRIG_WHICH, false)?;
    base.decode_field("num_chan",   chan_ctl, ACQ_CHAN_CTL_NUM_CHAN,    false)?;

    let stride = ACQ_CH_DESC_STRIDE as usize/4;
    for ch in 0..num_chan {
      let desc = regs[word(ACQ_CH0_DESC)      + ch*stride];
      let atom = regs[word(ACQ_CH0_ATOM_DESC) + ch*stride];
      base.decode_channel_field("int_width",    ch, desc, ACQ_CH_DESC_INT_WIDTH,       false)?;
      base.decode_channel_field("num_coalesce", ch, desc, ACQ_CH_DESC_NUM_COALESCE,    false)?;
      base.decode_channel_field("num_atoms",    ch, atom, ACQ_CH_ATOM_DESC_NUM_ATOMS,  false)?;
      base.decode_channel_field("atom_width",   ch, atom, ACQ_CH_ATOM_DESC_ATOM_WIDTH, false)?;
    }
    Ok(())
  }
}

//=======================================

/// Acquisition parameters, `None` leaves the register
/// as it is
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcqParams {
  pub channel         : Option<u32>,
  pub pre_samples     : Option<u32>,
  pub post_samples    : Option<u32>,
  pub shots           : Option<u32>,
  pub trigger         : Option<TriggerType>,
  pub trigger_delay   : Option<u32>,
  /// threshold of the data driven trigger
  pub data_trig_thres : Option<i32>,
  /// trigger on the negative edge
  pub data_trig_pol   : Option<bool>,
  /// atom of the data trigger channel to compare
  pub data_trig_sel   : Option<u32>,
  /// hysteresis, in samples
  pub data_trig_filt  : Option<u32>,
  /// channel the data trigger looks at
  pub data_trig_chan  : Option<u32>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AcqState {
  Stopped,
  Started,
  Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcqOutcome {
  InProgress,
  Timeout,
  Done(Samples),
}

/// What is needed to fetch the samples of the
/// acquisition in flight
#[derive(Debug, Clone)]
struct Pending {
  channel      : usize,
  desc         : ChannelDesc,
  pre_samples  : u32,
  post_samples : u32,
  ddr_start    : u64,
  ddr_end      : u64,
}

pub struct AcqController {
  base          : RegisterController,
  decoder       : AcqDecoder,
  pub params    : AcqParams,
  payload_size  : u32,
  ring_start    : u64,
  ring_size     : u64,
  poll_interval : Duration,
  state         : AcqState,
  pending       : Option<Pending>,
}

impl AcqController {

  pub fn new(device : PcieDevice, settings : &Settings) -> Self {
    Self {
      base          : RegisterController::new(device.clone(), ACQ_CORE, ACQ_REGS_WORDS, true),
      decoder       : AcqDecoder::new(device),
      params        : AcqParams::default(),
      payload_size  : settings.ddr_payload_size,
      ring_start    : settings.acq_ring_start,
      ring_size     : settings.acq_ring_size,
      poll_interval : Duration::from_micros(settings.acq_poll_interval_us),
      state         : AcqState::Stopped,
      pending       : None,
    }
  }

  pub fn state(&self) -> AcqState {
    self.state
  }

  /// The decoder used to look at the core before
  /// configuring it
  pub fn decoder(&self) -> &AcqDecoder {
    &self.decoder
  }

  /// Read the core, check it is idle, align the sample
  /// counts, and write the configuration registers.
  fn configure(&mut self) -> Result<Pending, RegError> {
    self.base.devinfo()?;
    self.decoder.get_data()?;
    let fsm_state = self.decoder.get_general::<i32>("fsm_state")?;
    if fsm_state != ACQ_FSM_IDLE {
      debug!("Acquisition FSM in state {}, not idle", fsm_state);
      return Err(RegError::DeviceBusy);
    }
    self.base.regs.copy_from_slice(self.decoder.raw());
    self.encode_params()?;

    let channel      = extract(self.base.regs[word(ACQ_CHAN_CTL)], ACQ_CHAN_CTL_WHICH, false)? as usize;
    let shots        = extract(self.base.regs[word(ACQ_SHOTS)], ACQ_SHOTS_NB, false)? as u64;
    let pre_samples  = self.base.regs[word(ACQ_PRE_SAMPLES)];
    let post_samples = self.base.regs[word(ACQ_POST_SAMPLES)];
    let desc         = self.decoder.channel_desc(channel)?;
    let sample_size  = desc.sample_size()?;
    let alignment    = desc.alignment(self.payload_size)?;
    atom_size(desc.atom_width)?;
    if shots == 0 {
      return Err(RegError::InvalidParameterValue {
        name  : String::from("shots"),
        value : String::from("0"),
      });
    }
    let aligned_pre  = align_up(pre_samples,  alignment);
    let aligned_post = align_up(post_samples, alignment);
    if aligned_pre + aligned_post == 0 {
      return Err(RegError::InvalidParameterValue {
        name  : String::from("post_samples"),
        value : String::from("0"),
      });
    }
    // the ring is read in whole words, it ends on a DDR payload
    let granule = u64::max(align_up(self.payload_size, SIZEOF_U32 as u32), SIZEOF_U32 as u64);
    if self.ring_start % SIZEOF_U32 as u64 != 0 {
      return Err(RegError::InvalidParameterValue {
        name  : String::from("acq_ring_start"),
        value : format!("{:#x}", self.ring_start),
      });
    }
    let samples_bytes = (aligned_pre + aligned_post)*sample_size as u64*shots;
    let window        = (samples_bytes + granule - 1)/granule*granule;
    if window > self.ring_size {
      return Err(RegError::ValueOutOfRange { value : window as i64, mask : u32::MAX });
    }
    let ddr_start = self.ring_start;
    let ddr_end   = ddr_start + window;
    self.base.encode_field(word(ACQ_PRE_SAMPLES),     aligned_pre  as i64, u32::MAX, false)?;
    self.base.encode_field(word(ACQ_POST_SAMPLES),    aligned_post as i64, u32::MAX, false)?;
    self.base.encode_field(word(ACQ_DDR3_START_ADDR), ddr_start    as i64, u32::MAX, false)?;
    self.base.encode_field(word(ACQ_DDR3_END_ADDR),   ddr_end      as i64, u32::MAX, false)?;

    for (first, count) in CONFIG_BLOCKS {
      self.base.write_range(first, count)?;
    }
    debug!("Configured channel {} with {}/{} samples (aligned to {}), ring [{:#x}, {:#x})",
           channel, aligned_pre, aligned_post, alignment, ddr_start, ddr_end);
    Ok(Pending {
      channel      : channel,
      desc         : desc,
      pre_samples  : pre_samples,
      post_samples : post_samples,
      ddr_start    : ddr_start,
      ddr_end      : ddr_end,
    })
  }

  /// Configure the core and start the acquisition.
  ///
  /// Fails with `AcquisitionInProgress` if the result of
  /// an earlier acquisition was not read (or `abort` was
  /// not called), and with `DeviceBusy` if the core is
  /// not idle.
  pub fn start_acquisition(&mut self) -> Result<(), RegError> {
    if self.state != AcqState::Stopped {
      return Err(RegError::AcquisitionInProgress);
    }
    let pending = self.configure()?;
    self.base.write_range(word(ACQ_DDR3_END_ADDR), 1)?;
    let ctl = word(ACQ_CTL);
    self.base.encode_bit(ctl, true, ACQ_CTL_FSM_START_ACQ)?;
    self.base.write_range(ctl, 1)?;
    self.base.encode_bit(ctl, false, ACQ_CTL_FSM_START_ACQ)?;
    info!("Started acquisition of {} + {} samples on channel {}",
          pending.pre_samples, pending.post_samples, pending.channel);
    self.pending = Some(pending);
    self.state   = AcqState::Started;
    Ok(())
  }

  /// Fire the software trigger
  pub fn software_trigger(&self) -> Result<(), RegError> {
    let base = self.base.devinfo()?.start_addr;
    write_word(self.base.device.control.as_ref(), base + ACQ_SW_TRIG, 1)
  }

  /// Stop the acquisition in flight and forget about it
  pub fn abort(&mut self) -> Result<(), RegError> {
    let ctl = word(ACQ_CTL);
    self.base.encode_bit(ctl, true, ACQ_CTL_FSM_STOP_ACQ)?;
    let written = self.base.write_range(ctl, 1);
    self.base.encode_bit(ctl, false, ACQ_CTL_FSM_STOP_ACQ)?;
    written?;
    if self.state != AcqState::Stopped {
      info!("Aborted acquisition");
    }
    self.state   = AcqState::Stopped;
    self.pending = None;
    Ok(())
  }

  /// Look at the status once, without blocking
  pub fn poll(&mut self) -> Result<AcqState, RegError> {
    if self.state == AcqState::Started {
      let sta = self.base.read_reg(word(ACQ_STA))?;
      if acquisition_complete(sta)? {
        debug!("Acquisition complete, status {:#010x}", sta);
        self.state = AcqState::Done;
      } else {
        trace!("Acquisition in progress, status {:#010x}", sta);
      }
    }
    Ok(self.state)
  }

  /// Get the samples if the acquisition is over,
  /// `InProgress` otherwise.
  pub fn result(&mut self, signed : bool) -> Result<AcqOutcome, RegError> {
    match self.poll()? {
      AcqState::Stopped => Err(RegError::NotStarted),
      AcqState::Started => Ok(AcqOutcome::InProgress),
      AcqState::Done    => {
        let samples = self.read_samples(signed);
        // the hardware is done either way
        self.state   = AcqState::Stopped;
        self.pending = None;
        let samples  = samples?;
        info!("Acquisition done, read {} samples", samples.len());
        Ok(AcqOutcome::Done(samples))
      }
    }
  }

  /// Poll until the acquisition is over, or `timeout`
  /// has passed. On timeout, the acquisition stays
  /// started, the caller can wait again or `abort`.
  pub fn result_timeout(&mut self, signed : bool, timeout : Duration) -> Result<AcqOutcome, RegError> {
    let begin = Instant::now();
    loop {
      match self.result(signed)? {
        AcqOutcome::InProgress => {
          if begin.elapsed() >= timeout {
            warn!("Acquisition not done after {:?}", timeout);
            return Ok(AcqOutcome::Timeout);
          }
          if !self.poll_interval.is_zero() {
            thread::sleep(self.poll_interval);
          }
        }
        outcome => return Ok(outcome),
      }
    }
  }

  fn read_samples(&mut self, signed : bool) -> Result<Samples, RegError> {
    let pending     = self.pending.clone().ok_or(RegError::NotStarted)?;
    let desc        = pending.desc;
    let trigger_pos = self.base.read_reg(word(ACQ_TRIG_POS))? as u64;
    let initial_pos = initial_position(trigger_pos, desc.sample_size()?, pending.pre_samples);
    let ring_len    = pending.ddr_end - pending.ddr_start;
    let offset      = ring_offset(initial_pos, pending.ddr_start, ring_len);
    let n_atoms     = (pending.pre_samples + pending.post_samples) as usize*desc.num_atoms as usize;
    debug!("Trigger at {:#x}, reading {} atoms of {} bits from ring offset {:#x}",
           trigger_pos, n_atoms, desc.atom_width, offset);
    let bytes = read_ring(self.base.device.sample.as_ref(),
                          pending.ddr_start,
                          ring_len,
                          offset,
                          n_atoms*atom_size(desc.atom_width)?)?;
    decode_atoms(&bytes, desc.atom_width, signed)
  }
}

impl Controller for AcqController {

  fn base(&self) -> &RegisterController {
    &self.base
  }

  fn base_mut(&mut self) -> &mut RegisterController {
    &mut self.base
  }

  fn encode_params(&mut self) -> Result<(), RegError> {
    let params = self.params.clone();
    let base   = &mut self.base;
    let ctl    = word(ACQ_CTL);
    let cfg    = word(ACQ_TRIG_CFG);
    if let Some(trigger) = params.trigger {
      let bits = trigger.bits();
      base.encode_bit(ctl, bits.acq_now,     ACQ_CTL_FSM_ACQ_NOW)?;
      base.encode_bit(cfg, bits.hw_trig_en,  ACQ_TRIG_CFG_HW_TRIG_EN)?;
      base.encode_bit(cfg, bits.sw_trig_en,  ACQ_TRIG_CFG_SW_TRIG_EN)?;
      base.encode_bit(cfg, bits.hw_trig_sel, ACQ_TRIG_CFG_HW_TRIG_SEL)?;
    }
    // never leave a strobe set in the image
    base.encode_bit(ctl, false, ACQ_CTL_FSM_START_ACQ)?;
    base.encode_bit(ctl, false, ACQ_CTL_FSM_STOP_ACQ)?;
    if let Some(pol) = params.data_trig_pol {
      base.encode_bit(cfg, pol, ACQ_TRIG_CFG_HW_TRIG_POL)?;
    }
    if let Some(sel) = params.data_trig_sel {
      base.encode_field(cfg, sel as i64, ACQ_TRIG_CFG_INT_TRIG_SEL, false)?;
    }
    if let Some(filt) = params.data_trig_filt {
      base.encode_field(word(ACQ_TRIG_DATA_CFG), filt as i64, ACQ_TRIG_DATA_CFG_FILT_IN,  false)?;
      base.encode_field(word(ACQ_TRIG_DATA_CFG), filt as i64, ACQ_TRIG_DATA_CFG_FILT_OUT, false)?;
    }
    if let Some(thres) = params.data_trig_thres {
      base.encode_field(word(ACQ_TRIG_DATA_THRES), thres as i64, u32::MAX, true)?;
    }
    if let Some(delay) = params.trigger_delay {
      base.encode_field(word(ACQ_TRIG_DLY), delay as i64, u32::MAX, false)?;
    }
    if let Some(shots) = params.shots {
      base.encode_field(word(ACQ_SHOTS), shots as i64, ACQ_SHOTS_NB, false)?;
    }
    if let Some(pre) = params.pre_samples {
      base.encode_field(word(ACQ_PRE_SAMPLES), pre as i64, u32::MAX, false)?;
    }
    if let Some(post) = params.post_samples {
      base.encode_field(word(ACQ_POST_SAMPLES), post as i64, u32::MAX, false)?;
    }
    if let Some(channel) = params.channel {
      base.encode_field(word(ACQ_CHAN_CTL), channel as i64, ACQ_CHAN_CTL_WHICH, false)?;
    }
    if let Some(channel) = params.data_trig_chan {
      base.encode_field(word(ACQ_CHAN_CTL), channel as i64, ACQ_CHAN_CTL_DTRIG_WHICH, false)?;
    }
    Ok(())
  }

  fn command_params(&self) -> &'static [&'static str] {
    &[]
  }

  fn unset_param(&mut self, name : &str) -> Result<(), RegError> {
    let p = &mut self.params;
    match name {
      "channel"         => p.channel         = None,
      "pre_samples"     => p.pre_samples     = None,
      "post_samples"    => p.post_samples    = None,
      "shots"           => p.shots           = None,
      "trigger"         => p.trigger         = None,
      "trigger_delay"   => p.trigger_delay   = None,
      "data_trig_thres" => p.data_trig_thres = None,
      "data_trig_pol"   => p.data_trig_pol   = None,
      "data_trig_sel"   => p.data_trig_sel   = None,
      "data_trig_filt"  => p.data_trig_filt  = None,
      "data_trig_chan"  => p.data_trig_chan  = None,
      _ => return Err(RegError::UnknownParameter(String::from(name))),
    }
    Ok(())
  }

  fn set_named(&mut self, name : &str, value : &str) -> Result<(), RegError> {
    let p = &mut self.params;
    match name {
      "channel"         => p.channel         = Some(parse_u32(name, value)?),
      "pre_samples"     => p.pre_samples     = Some(parse_u32(name, value)?),
      "post_samples"    => p.post_samples    = Some(parse_u32(name, value)?),
      "shots"           => p.shots           = Some(parse_u32(name, value)?),
      "trigger"         => p.trigger         = Some(value.parse::<TriggerType>()?),
      "trigger_delay"   => p.trigger_delay   = Some(parse_u32(name, value)?),
      "data_trig_thres" => {
        let thres = i32::try_from(parse_int(name, value)?).map_err(|_| RegError::InvalidParameterValue {
          name  : String::from(name),
          value : String::from(value),
        })?;
        p.data_trig_thres = Some(thres);
      }
      "data_trig_pol"   => {
        p.data_trig_pol = Some(match value.trim() {
          "negative" | "neg" => true,
          "positive" | "pos" => false,
          other              => parse_bool(name, other)?,
        });
      }
      "data_trig_sel"   => p.data_trig_sel   = Some(parse_u32(name, value)?),
      "data_trig_filt"  => p.data_trig_filt  = Some(parse_u32(name, value)?),
      "data_trig_chan"  => p.data_trig_chan  = Some(parse_u32(name, value)?),
      _ => return Err(RegError::UnknownParameter(String::from(name))),
    }
    Ok(())
  }

  fn set_devinfo(&mut self, info : DeviceInfo) -> Result<(), RegError> {
    self.base.set_devinfo(info)?;
    self.decoder.set_devinfo(info)
  }

  /// Only configure, `start_acquisition` starts
  fn write_params(&mut self) -> Result<(), RegError> {
    if self.state != AcqState::Stopped {
      return Err(RegError::AcquisitionInProgress);
    }
    self.configure()?;
    Ok(())
  }
}
