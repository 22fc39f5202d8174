//! Self-describing bus (SDB)
//!
//! The gateware carries a small directory of its cores
//! at a fixed address of the wishbone bus. It is a list
//! of 64 byte records (16 words):
//!
//! ```text
//! interconnect record (first one)
//!   word 0      magic "SDB-" (0x5344422D)
//!   word 1      [31:16] number of records, incl. this one
//!               [15:8]  sdb version [7:0] bus type
//! device record
//!   word 0      [31:16] abi class [15:8] abi major [7:0] abi minor
//!   word 1      bus specific
//!   words 2-3   addr_first (64bit)
//!   words 4-5   addr_last  (64bit)
//!   words 6-7   vendor id  (64bit)
//!   word 8      device id
//!   word 9      version
//!   word 10     date
//!   words 11-15 name, the low byte of word 15 is the record type
//! ```
//!
//! The same core can show up several times on one bus,
//! they are told apart by their order on the bus only.

use std::fmt;

use serde::{Deserialize,
            Serialize};

use crate::errors::RegError;
use crate::memory::{read_words,
                    PcieDevice};

pub const SDB_MAGIC              : u32   = 0x5344422D;
pub const SDB_RECORD_WORDS       : usize = 16;
pub const SDB_RECORD_SIZE        : u64   = 64;
pub const SDB_RECORD_INTERCONNECT: u8    = 0x00;
pub const SDB_RECORD_DEVICE      : u8    = 0x01;
pub const SDB_RECORD_BRIDGE      : u8    = 0x02;
pub const SDB_RECORD_EMPTY       : u8    = 0xff;

/// Where a core lives and which version it is
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
  pub start_addr    : u64,
  pub vendor_id     : u64,
  pub device_id     : u32,
  pub abi_ver_major : u8,
  pub abi_ver_minor : u8,
}

impl fmt::Display for DeviceInfo {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "<DeviceInfo: vendor {:#018x} device {:#010x} abi {}.{} @ {:#x}>",
           self.vendor_id,
           self.device_id,
           self.abi_ver_major,
           self.abi_ver_minor,
           self.start_addr)
  }
}

/// The (vendor, device, abi major) triple a decoder
/// or controller is written for
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeviceMatch {
  pub vendor_id     : u64,
  pub device_id     : u32,
  pub abi_ver_major : u8,
}

impl DeviceMatch {

  pub fn matches(&self, info : &DeviceInfo) -> bool {
    self.vendor_id        == info.vendor_id
      && self.device_id     == info.device_id
      && self.abi_ver_major == info.abi_ver_major
  }

  /// Fail with `DeviceMismatch` if `info` describes
  /// another core
  pub fn check(&self, info : &DeviceInfo) -> Result<(), RegError> {
    if !self.matches(info) {
      return Err(RegError::DeviceMismatch {
        vendor_id     : info.vendor_id,
        device_id     : info.device_id,
        abi_ver_major : info.abi_ver_major,
      });
    }
    Ok(())
  }
}

/// One device record of the bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdbDevice {
  pub info      : DeviceInfo,
  pub addr_last : u64,
  pub name      : String,
}

impl SdbDevice {

  /// Decode a device record. `base` is the address of
  /// the bus root, addresses in the record are relative
  /// to it.
  pub fn from_words(words : &[u32; SDB_RECORD_WORDS], base : u64) -> Self {
    let addr_first = ((words[2] as u64) << 32) | words[3] as u64;
    let addr_last  = ((words[4] as u64) << 32) | words[5] as u64;
    let mut name_bytes = Vec::<u8>::with_capacity(19);
    for word in &words[11..16] {
      name_bytes.extend_from_slice(&word.to_be_bytes());
    }
    // the last byte is the record type
    name_bytes.truncate(19);
    let name = String::from_utf8_lossy(&name_bytes)
      .trim_end_matches(|c : char| c == '\0' || c == ' ')
      .to_string();
    Self {
      info : DeviceInfo {
        start_addr    : base + addr_first,
        vendor_id     : ((words[6] as u64) << 32) | words[7] as u64,
        device_id     : words[8],
        abi_ver_major : ((words[0] >> 8) & 0xff) as u8,
        abi_ver_minor : (words[0] & 0xff) as u8,
      },
      addr_last : base + addr_last,
      name      : name,
    }
  }

  /// Encode as a device record, relative to the bus root
  /// `base` (used to build simulated boards)
  pub fn to_words(&self, base : u64) -> [u32; SDB_RECORD_WORDS] {
    let mut words = [0u32; SDB_RECORD_WORDS];
    let addr_first = self.info.start_addr - base;
    let addr_last  = self.addr_last - base;
    words[0]  = ((self.info.abi_ver_major as u32) << 8) | self.info.abi_ver_minor as u32;
    words[2]  = (addr_first >> 32) as u32;
    words[3]  = addr_first as u32;
    words[4]  = (addr_last >> 32) as u32;
    words[5]  = addr_last as u32;
    words[6]  = (self.info.vendor_id >> 32) as u32;
    words[7]  = self.info.vendor_id as u32;
    words[8]  = self.info.device_id;
    let mut name_bytes = [b' '; 20];
    for (k, b) in self.name.bytes().take(19).enumerate() {
      name_bytes[k] = b;
    }
    name_bytes[19] = SDB_RECORD_DEVICE;
    for (k, chunk) in name_bytes.chunks_exact(4).enumerate() {
      words[11 + k] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    words
  }
}

/// Interconnect record announcing `n_records` records
pub fn interconnect_words(n_records : u16) -> [u32; SDB_RECORD_WORDS] {
  let mut words = [0u32; SDB_RECORD_WORDS];
  words[0]  = SDB_MAGIC;
  words[1]  = (n_records as u32) << 16 | 1 << 8;
  words[15] = SDB_RECORD_INTERCONNECT as u32;
  words
}

/// Linear scan of the bus at `root`, returns all device
/// records in bus order.
pub fn read_sdb(device : &PcieDevice, root : u64) -> Result<Vec<SdbDevice>, RegError> {
  let mut words = [0u32; SDB_RECORD_WORDS];
  read_words(device.control.as_ref(), root, &mut words)?;
  if words[0] != SDB_MAGIC {
    return Err(RegError::Transport(format!("no SDB at {root:#x}, found {:#010x} instead of the magic", words[0])));
  }
  let n_records = (words[1] >> 16) as usize;
  trace!("SDB at {:#x} with {} records", root, n_records);
  let mut devices = Vec::<SdbDevice>::new();
  for k in 1..n_records {
    read_words(device.control.as_ref(), root + k as u64*SDB_RECORD_SIZE, &mut words)?;
    let record_type = (words[15] & 0xff) as u8;
    match record_type {
      SDB_RECORD_DEVICE => {
        devices.push(SdbDevice::from_words(&words, root));
      }
      SDB_RECORD_BRIDGE => {
        debug!("Skipping SDB bridge record {}", k);
      }
      _ => {
        trace!("Skipping SDB record {} of type {:#x}", k, record_type);
      }
    }
  }
  Ok(devices)
}

/// Find the `index`-th (counting from 0) core matching
/// `target` on the bus.
///
/// Returns `None` if there are not enough matches.
pub fn find_device(device : &PcieDevice,
                   root   : u64,
                   target : &DeviceMatch,
                   index  : usize) -> Result<Option<DeviceInfo>, RegError> {
  let found = read_sdb(device, root)?
    .into_iter()
    .filter(|dev| target.matches(&dev.info))
    .nth(index)
    .map(|dev| dev.info);
  match &found {
    Some(info) => debug!("Found {} (match #{})", info, index),
    None       => debug!("No match #{} for {:?}", index, target),
  }
  Ok(found)
}
