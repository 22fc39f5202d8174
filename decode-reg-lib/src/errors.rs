//! Errors of the register decoding/encoding library
//!
//! Not-found on the SDB and timeouts of an acquisition 
//! are NOT errors, they are returned as values 
//! (`Option` and `AcqOutcome::Timeout`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegError {
  #[error("mask {0:#010x} is empty or not a contiguous run of bits")]
  InvalidMask(u32),
  #[error("value {value} does not fit into mask {mask:#010x}")]
  ValueOutOfRange { value : i64, mask : u32 },
  #[error("value {value} not representable as fixed point with {point_pos} fractional bits")]
  FixedPointOutOfRange { value : f64, point_pos : u32 },
  #[error("binary point position {0} outside of a 32bit word")]
  InvalidPointPosition(u32),
  #[error("unsupported atom width {0} (expected 8, 16 or 32 bits)")]
  UnsupportedWidth(u32),
  #[error("invalid trigger type '{0}'")]
  InvalidTriggerType(String),
  #[error("hardware reports {found} channels, at most {max} are supported")]
  TooManyChannels { found : usize, max : usize },
  #[error("device info not set, core address unknown")]
  NotConfigured,
  #[error("device {vendor_id:#x}:{device_id:#x} (abi {abi_ver_major}) does not match the expected core")]
  DeviceMismatch { vendor_id : u64, device_id : u32, abi_ver_major : u8 },
  #[error("core is busy, refusing to configure it")]
  DeviceBusy,
  #[error("channel index {index} out of range ({count} channels)")]
  ChannelOutOfRange { index : usize, count : usize },
  #[error("number of channels not set before writing channel field '{0}'")]
  ChannelsUnset(String),
  #[error("no such field '{0}'")]
  KeyNotFound(String),
  #[error("field '{name}' is not stored as {expected}")]
  TypeMismatch { name : String, expected : &'static str },
  #[error("an acquisition is already running or its result was not read yet")]
  AcquisitionInProgress,
  #[error("no acquisition was started")]
  NotStarted,
  #[error("feature not supported by this core: {0}")]
  Unsupported(String),
  #[error("unknown module '{0}'")]
  UnknownModule(String),
  #[error("unknown parameter '{0}'")]
  UnknownParameter(String),
  #[error("invalid value '{value}' for parameter '{name}'")]
  InvalidParameterValue { name : String, value : String },
  #[error("transport error: {0}")]
  Transport(String),
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error("can't decode toml: {0}")]
  TomlDecode(#[from] toml::de::Error),
  #[error("can't encode toml: {0}")]
  TomlEncode(#[from] toml::ser::Error),
  #[error(transparent)]
  Json(#[from] serde_json::Error),
}
