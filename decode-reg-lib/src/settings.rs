//! Configuration of the tools, stored as toml file
//!
//! Everything which depends on the board and the gateware
//! build, but can't be found on the SDB.

use std::fmt;
use std::fs::File;
use std::io::{Read,
              Write};

use serde::{Deserialize,
            Serialize};

use crate::errors::RegError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  /// PCIe slot of the board, e.g. "0000:07:00.0"
  pub slot                  : String,
  /// wishbone address of the SDB interconnect record
  pub sdb_root              : u64,
  /// size of the BAR2 (sample memory) window in bytes
  pub bar2_page_size        : u64,
  /// size of the BAR4 (wishbone) window in bytes
  pub bar4_page_size        : u64,
  /// bytes of one DDR transfer, pre/post sample
  /// counts are aligned to it
  pub ddr_payload_size      : u32,
  /// start of the acquisition ring in the DDR memory
  pub acq_ring_start        : u64,
  /// size of the acquisition ring in bytes
  pub acq_ring_size         : u64,
  /// give up waiting for an acquisition after this
  pub acq_timeout_ms        : u64,
  /// pause between status polls, 0 busy polls
  pub acq_poll_interval_us  : u64,
  /// refresh interval of the watch mode
  pub watch_interval_ms     : u64,
}

impl Settings {

  pub fn new() -> Self {
    Self {
      slot                 : String::from("0000:07:00.0"),
      sdb_root             : 0x0030_0000,
      bar2_page_size       : 1 << 19,
      bar4_page_size       : 1 << 19,
      ddr_payload_size     : 32,
      acq_ring_start       : 0x0000_0000,
      acq_ring_size        : 0x2000_0000,
      acq_timeout_ms       : 10000,
      acq_poll_interval_us : 0,
      watch_interval_ms    : 1000,
    }
  }

  /// Write the settings to a toml file
  pub fn to_toml(&self, filename : &str) -> Result<(), RegError> {
    let mut file    = File::create(filename)?;
    let toml_string = toml::to_string_pretty(&self)?;
    file.write_all(toml_string.as_bytes())?;
    debug!("Wrote settings to {}!", filename);
    Ok(())
  }

  /// Read settings from a toml file. Keys missing
  /// from the file keep their defaults.
  pub fn from_toml(filename : &str) -> Result<Self, RegError> {
    let mut file        = File::open(filename)?;
    let mut toml_string = String::from("");
    file.read_to_string(&mut toml_string)?;
    let settings : Settings = toml::from_str(&toml_string)?;
    debug!("Read settings from {}!", filename);
    Ok(settings)
  }
}

impl Default for Settings {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for Settings {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let disp = toml::to_string(self).unwrap_or(
      String::from("-- DESERIALIZATION ERROR! --"));
    write!(f, "<Settings :\n{}>", disp)
  }
}
