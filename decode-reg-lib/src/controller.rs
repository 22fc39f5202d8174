//! Generic register controller
//!
//! Controllers hold a set of optional parameters. Only
//! the parameters which are set get encoded into the
//! register image, the rest is left as it is. Cores where
//! not every register gets written read the image from
//! the device first (read-modify-write).
//!
//! Parameters which are commands (strobes like a counter
//! reset) are unset after every successful write, so a
//! later, unrelated write does not fire them again.

use crate::bits::{float_to_fixed,
                  insert,
                  insert_bit};
use crate::errors::RegError;
use crate::memory::{read_words,
                    write_words,
                    PcieDevice};
use crate::sdb::{DeviceInfo,
                 DeviceMatch};

/// Register image and location of one core
pub struct RegisterController {
  pub device        : PcieDevice,
  /// the register image, one entry per 32bit word
  pub regs          : Vec<u32>,
  target            : DeviceMatch,
  devinfo           : Option<DeviceInfo>,
  read_modify_write : bool,
}

impl RegisterController {

  /// # Arguments
  ///
  /// * n_words           : size of the register image
  /// * read_modify_write : read the image from the device
  ///                       before encoding the parameters
  pub fn new(device            : PcieDevice,
             target            : DeviceMatch,
             n_words           : usize,
             read_modify_write : bool) -> Self {
    Self {
      device            : device,
      regs              : vec![0u32; n_words],
      target            : target,
      devinfo           : None,
      read_modify_write : read_modify_write,
    }
  }

  pub fn set_devinfo(&mut self, info : DeviceInfo) -> Result<(), RegError> {
    self.target.check(&info)?;
    self.devinfo = Some(info);
    Ok(())
  }

  pub fn devinfo(&self) -> Result<&DeviceInfo, RegError> {
    self.devinfo.as_ref().ok_or(RegError::NotConfigured)
  }

  pub fn read_modify_write(&self) -> bool {
    self.read_modify_write
  }

  /// Load the whole image from the device
  pub fn read_image(&mut self) -> Result<(), RegError> {
    let base = self.devinfo()?.start_addr;
    read_words(self.device.control.as_ref(), base, &mut self.regs)
  }

  /// Write the whole image in one transfer
  pub fn write_image(&self) -> Result<(), RegError> {
    let base = self.devinfo()?.start_addr;
    write_words(self.device.control.as_ref(), base, &self.regs)
  }

  /// Write the words `first..first + count` of the image
  pub fn write_range(&self, first : usize, count : usize) -> Result<(), RegError> {
    let base = self.devinfo()?.start_addr;
    write_words(self.device.control.as_ref(),
                base + (first*4) as u64,
                &self.regs[first..first + count])
  }

  /// Read the word `index` of the image back from the device
  pub fn read_reg(&mut self, index : usize) -> Result<u32, RegError> {
    let base = self.devinfo()?.start_addr;
    read_words(self.device.control.as_ref(),
               base + (index*4) as u64,
               &mut self.regs[index..index + 1])?;
    Ok(self.regs[index])
  }

  /// Insert `value` into the field `mask` of word `index`
  pub fn encode_field(&mut self,
                      index  : usize,
                      value  : i64,
                      mask   : u32,
                      signed : bool) -> Result<(), RegError> {
    self.regs[index] = insert(self.regs[index], value, mask, signed)?;
    Ok(())
  }

  pub fn encode_bit(&mut self, index : usize, bit : bool, mask : u32) -> Result<(), RegError> {
    self.regs[index] = insert_bit(self.regs[index], bit, mask)?;
    Ok(())
  }

  /// Encode a whole word as fixed point
  pub fn encode_fixed(&mut self,
                      index     : usize,
                      value     : f64,
                      point_pos : u32,
                      saturate  : bool) -> Result<(), RegError> {
    self.regs[index] = float_to_fixed(value, point_pos, saturate)?;
    Ok(())
  }
}

/// Capabilities of a concrete core controller
pub trait Controller {
  fn base(&self) -> &RegisterController;
  fn base_mut(&mut self) -> &mut RegisterController;

  /// Transcode every parameter which is set into the
  /// register image
  fn encode_params(&mut self) -> Result<(), RegError>;

  /// Parameters which are one-shot commands
  fn command_params(&self) -> &'static [&'static str];

  /// Forget the value of a parameter (back to "leave unchanged")
  fn unset_param(&mut self, name : &str) -> Result<(), RegError>;

  /// Set a parameter from its textual form
  fn set_named(&mut self, name : &str, value : &str) -> Result<(), RegError>;

  fn set_devinfo(&mut self, info : DeviceInfo) -> Result<(), RegError> {
    self.base_mut().set_devinfo(info)
  }

  /// Encode the parameters and write the image to the
  /// device, then unset the commands
  fn write_params(&mut self) -> Result<(), RegError> {
    self.base().devinfo()?;
    if self.base().read_modify_write() {
      self.base_mut().read_image()?;
    }
    self.encode_params()?;
    self.base().write_image()?;
    for name in self.command_params() {
      self.unset_param(name)?;
    }
    Ok(())
  }
}

/// Parse "1/0", "true/false", "on/off", "enable(d)/disable(d)"
pub fn parse_bool(name : &str, value : &str) -> Result<bool, RegError> {
  match value.trim().to_lowercase().as_str() {
    "1" | "true"  | "on"  | "enable"  | "enabled"  => Ok(true),
    "0" | "false" | "off" | "disable" | "disabled" => Ok(false),
    _ => Err(RegError::InvalidParameterValue {
      name  : String::from(name),
      value : String::from(value),
    }),
  }
}

/// Parse a decimal (possibly negative) or 0x prefixed
/// hexadecimal integer
pub fn parse_int(name : &str, value : &str) -> Result<i64, RegError> {
  let trimmed = value.trim();
  let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
    Some(hex) => i64::from_str_radix(hex, 16),
    None      => trimmed.parse::<i64>(),
  };
  parsed.map_err(|_| RegError::InvalidParameterValue {
    name  : String::from(name),
    value : String::from(value),
  })
}

/// Like `parse_int`, limited to what fits a register word
pub fn parse_u32(name : &str, value : &str) -> Result<u32, RegError> {
  u32::try_from(parse_int(name, value)?).map_err(|_| RegError::InvalidParameterValue {
    name  : String::from(name),
    value : String::from(value),
  })
}

pub fn parse_float(name : &str, value : &str) -> Result<f64, RegError> {
  value.trim().parse::<f64>().map_err(|_| RegError::InvalidParameterValue {
    name  : String::from(name),
    value : String::from(value),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use crate::sim::SimRegion;

  const TARGET : DeviceMatch = DeviceMatch {
    vendor_id     : 0x1,
    device_id     : 0x2,
    abi_ver_major : 0,
  };

  /// two registers: [7:0] value, [8] strobe
  struct Toy {
    base   : RegisterController,
    value  : Option<u8>,
    strobe : Option<bool>,
  }

  impl Controller for Toy {
    fn base(&self) -> &RegisterController { &self.base }
    fn base_mut(&mut self) -> &mut RegisterController { &mut self.base }

    fn encode_params(&mut self) -> Result<(), RegError> {
      if let Some(value) = self.value {
        self.base.encode_field(0, value as i64, 0xff, false)?;
      }
      let strobe = self.strobe.unwrap_or(false);
      self.base.encode_bit(0, strobe, 0x100)
    }

    fn command_params(&self) -> &'static [&'static str] {
      &["strobe"]
    }

    fn unset_param(&mut self, name : &str) -> Result<(), RegError> {
      match name {
        "value"  => self.value  = None,
        "strobe" => self.strobe = None,
        _        => return Err(RegError::UnknownParameter(String::from(name))),
      }
      Ok(())
    }

    fn set_named(&mut self, name : &str, value : &str) -> Result<(), RegError> {
      match name {
        "value"  => self.value  = Some(parse_int(name, value)? as u8),
        "strobe" => self.strobe = Some(parse_bool(name, value)?),
        _        => return Err(RegError::UnknownParameter(String::from(name))),
      }
      Ok(())
    }
  }

  fn toy(rmw : bool) -> (Toy, SimRegion) {
    let sim    = SimRegion::new(0x100);
    let device = PcieDevice::new(Arc::new(sim.clone()), Arc::new(SimRegion::new(0)));
    let toy    = Toy {
      base   : RegisterController::new(device, TARGET, 2, rmw),
      value  : None,
      strobe : None,
    };
    (toy, sim)
  }

  fn info() -> DeviceInfo {
    DeviceInfo { start_addr : 0x40, vendor_id : 0x1, device_id : 0x2, abi_ver_major : 0, abi_ver_minor : 0 }
  }

  #[test]
  fn write_needs_devinfo() {
    let (mut toy, sim) = toy(false);
    toy.value = Some(3);
    assert!(matches!(toy.write_params(), Err(RegError::NotConfigured)));
    assert!(sim.take_writes().is_empty());
  }

  #[test]
  fn wrong_core_is_refused() {
    let (mut toy, _) = toy(false);
    let mut other = info();
    other.device_id = 0x3;
    assert!(matches!(toy.set_devinfo(other), Err(RegError::DeviceMismatch { .. })));
  }

  #[test]
  fn commands_are_cleared_after_write() {
    let (mut toy, sim) = toy(false);
    toy.set_devinfo(info()).unwrap();
    toy.set_named("value", "0x12").unwrap();
    toy.set_named("strobe", "1").unwrap();
    toy.write_params().unwrap();
    assert_eq!(sim.peek(0x40), 0x112);
    assert_eq!(sim.take_writes(), vec![(0x40, 8)]);
    assert!(toy.strobe.is_none());
    assert_eq!(toy.value, Some(0x12));
    // an unrelated write does not strobe again
    toy.write_params().unwrap();
    assert_eq!(sim.peek(0x40), 0x12);
  }

  #[test]
  fn read_modify_write_keeps_untouched_bits() {
    let (mut toy, sim) = toy(true);
    toy.set_devinfo(info()).unwrap();
    sim.poke(0x40, 0xabcd_0000);
    sim.poke(0x44, 0x5555);
    toy.value = Some(0x7);
    toy.write_params().unwrap();
    assert_eq!(sim.peek(0x40), 0xabcd_0007);
    assert_eq!(sim.peek(0x44), 0x5555);
  }

  #[test]
  fn parameter_parsing() {
    assert_eq!(parse_int("x", "-12").unwrap(), -12);
    assert_eq!(parse_int("x", "0x1f").unwrap(), 31);
    assert!(parse_int("x", "twelve").is_err());
    assert_eq!(parse_u32("x", "0xffffffff").unwrap(), u32::MAX);
    assert!(parse_u32("x", "-1").is_err());
    assert!(parse_bool("x", "enabled").unwrap());
    assert!(!parse_bool("x", "OFF").unwrap());
    assert!(matches!(parse_bool("x", "maybe"), Err(RegError::InvalidParameterValue { .. })));
    assert_eq!(parse_float("x", " 0.25").unwrap(), 0.25);
  }
}
