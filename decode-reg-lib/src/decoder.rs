//! Generic register decoder
//!
//! A decoder reads the raw register block of one core,
//! and turns it into named values according to a field
//! table. Fields are either general (one value per core)
//! or per channel (one value per channel of the core).
//!
//! The values are kept in hash maps, the order in which
//! fields first show up is recorded separately, so
//! printing is stable.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json,
                 Map};

use crate::bits::{extract,
                  fixed_to_float};
use crate::errors::RegError;
use crate::memory::{read_words,
                    PcieDevice};
use crate::sdb::{DeviceInfo,
                 DeviceMatch};

/// A decoded value
#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
  Int(i32),
  Float(f64),
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Value::Int(v)   => write!(f, "{}", v),
      Value::Float(v) => write!(f, "{}", v),
    }
  }
}

/// Types which can be taken out of a `Value`
pub trait FromValue : Sized {
  const TYPE_NAME : &'static str;
  fn from_value(value : &Value) -> Option<Self>;
}

impl FromValue for i32 {
  const TYPE_NAME : &'static str = "integer";
  fn from_value(value : &Value) -> Option<Self> {
    match value {
      Value::Int(v)   => Some(*v),
      Value::Float(_) => None,
    }
  }
}

impl FromValue for f64 {
  const TYPE_NAME : &'static str = "float";
  fn from_value(value : &Value) -> Option<Self> {
    match value {
      Value::Float(v) => Some(*v),
      Value::Int(_)   => None,
    }
  }
}

pub type RenderFn = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// How a field is shown to the user
#[derive(Clone)]
pub enum FieldKind {
  Boolean { true_label : String, false_label : String },
  /// "completed" / "in progress"
  Progress,
  /// "enabled" / "disabled"
  Enable,
  Integer,
  Hex,
  TwosComplement,
  FixedPoint { point_pos : u32 },
  Custom(RenderFn),
}

impl fmt::Debug for FieldKind {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      FieldKind::Boolean { true_label, false_label } => {
        write!(f, "Boolean({}/{})", true_label, false_label)
      }
      FieldKind::Progress       => write!(f, "Progress"),
      FieldKind::Enable         => write!(f, "Enable"),
      FieldKind::Integer        => write!(f, "Integer"),
      FieldKind::Hex            => write!(f, "Hex"),
      FieldKind::TwosComplement => write!(f, "TwosComplement"),
      FieldKind::FixedPoint { point_pos } => write!(f, "FixedPoint({})", point_pos),
      FieldKind::Custom(_)      => write!(f, "Custom"),
    }
  }
}

impl FieldKind {

  pub fn boolean(true_label : &str, false_label : &str) -> Self {
    FieldKind::Boolean {
      true_label  : String::from(true_label),
      false_label : String::from(false_label),
    }
  }

  pub fn custom<F>(render : F) -> Self
    where F : Fn(&Value) -> String + Send + Sync + 'static {
    FieldKind::Custom(Arc::new(render))
  }

  /// Any non-zero value of these is stored as 1
  pub fn is_boolean_like(&self) -> bool {
    matches!(self, FieldKind::Boolean { .. } | FieldKind::Progress | FieldKind::Enable)
  }

  pub fn render(&self, value : &Value) -> String {
    let truth = match value {
      Value::Int(v)   => *v != 0,
      Value::Float(v) => *v != 0.0,
    };
    match (self, value) {
      (FieldKind::Boolean { true_label, false_label }, _) => {
        if truth { true_label.clone() } else { false_label.clone() }
      }
      (FieldKind::Progress, _) => {
        String::from(if truth { "completed" } else { "in progress" })
      }
      (FieldKind::Enable, _) => {
        String::from(if truth { "enabled" } else { "disabled" })
      }
      (FieldKind::Custom(f), _)                 => (**f)(value),
      (FieldKind::Integer, Value::Int(v))       => format!("{}", *v as u32),
      (FieldKind::Hex, Value::Int(v))           => format!("{:#010x}", *v as u32),
      (FieldKind::TwosComplement, Value::Int(v)) => format!("{}", v),
      (_, other) => format!("{}", other),
    }
  }
}

/// One entry of the field table of a core
#[derive(Debug, Clone)]
pub struct FieldSpec {
  pub name        : String,
  pub description : String,
  pub kind        : FieldKind,
}

impl FieldSpec {
  pub fn new(name : &str, description : &str, kind : FieldKind) -> Self {
    Self {
      name        : String::from(name),
      description : String::from(description),
      kind        : kind,
    }
  }
}

/// Field table of one core, given to the decoder
/// when it is built.
#[derive(Debug, Clone)]
pub struct FieldTable {
  fields : Vec<FieldSpec>,
  index  : HashMap<String, usize>,
}

impl FieldTable {

  pub fn new(fields : Vec<FieldSpec>) -> Self {
    let index = fields.iter()
      .enumerate()
      .map(|(k, field)| (field.name.clone(), k))
      .collect();
    Self { fields, index }
  }

  pub fn get(&self, name : &str) -> Result<&FieldSpec, RegError> {
    self.index.get(name)
      .map(|k| &self.fields[*k])
      .ok_or_else(|| RegError::KeyNotFound(String::from(name)))
  }

  pub fn iter(&self) -> impl Iterator<Item = &FieldSpec> {
    self.fields.iter()
  }

  pub fn len(&self) -> usize {
    self.fields.len()
  }
}

/// The decoded values of a core
#[derive(Debug, Clone)]
pub struct DecodedValues {
  table              : Arc<FieldTable>,
  general            : HashMap<String, Value>,
  channel            : HashMap<String, Vec<Option<Value>>>,
  general_order      : Vec<String>,
  channel_order      : Vec<String>,
  number_of_channels : Option<usize>,
  /// after the first decode, only fields new to the
  /// value maps need a look at the order
  first_pass_done    : bool,
}

impl DecodedValues {

  pub fn new(table : Arc<FieldTable>) -> Self {
    Self {
      table              : table,
      general            : HashMap::new(),
      channel            : HashMap::new(),
      general_order      : Vec::new(),
      channel_order      : Vec::new(),
      number_of_channels : None,
      first_pass_done    : false,
    }
  }

  pub fn table(&self) -> &FieldTable {
    &self.table
  }

  /// Set the number of channels of the core. Changing it
  /// drops the channel values decoded so far.
  pub fn set_number_of_channels(&mut self, n : usize) {
    if self.number_of_channels != Some(n) {
      self.channel.clear();
    }
    self.number_of_channels = Some(n);
  }

  pub fn number_of_channels(&self) -> Option<usize> {
    self.number_of_channels
  }

  fn coerce(&self, name : &str, value : Value) -> Result<Value, RegError> {
    let spec = self.table.get(name)?;
    if spec.kind.is_boolean_like() {
      let truth = match value {
        Value::Int(v)   => v != 0,
        Value::Float(v) => v != 0.0,
      };
      return Ok(Value::Int(truth as i32));
    }
    Ok(value)
  }

  pub fn add_general(&mut self, name : &str, value : Value) -> Result<(), RegError> {
    let value = self.coerce(name, value)?;
    let fresh = self.general.insert(String::from(name), value).is_none();
    if (fresh || !self.first_pass_done) && !self.general_order.iter().any(|n| n == name) {
      self.general_order.push(String::from(name));
    }
    Ok(())
  }

  pub fn add_channel(&mut self, name : &str, index : usize, value : Value) -> Result<(), RegError> {
    let count = self.number_of_channels
      .ok_or_else(|| RegError::ChannelsUnset(String::from(name)))?;
    if index >= count {
      return Err(RegError::ChannelOutOfRange { index, count });
    }
    let value = self.coerce(name, value)?;
    let fresh = !self.channel.contains_key(name);
    if (fresh || !self.first_pass_done) && !self.channel_order.iter().any(|n| n == name) {
      self.channel_order.push(String::from(name));
    }
    let slots = self.channel.entry(String::from(name))
      .or_insert_with(|| vec![None; count]);
    slots[index] = Some(value);
    Ok(())
  }

  /// Mark the end of a decode. Fields showing up in a
  /// later pass go to the end of the order.
  pub fn finish_pass(&mut self) {
    self.first_pass_done = true;
  }

  pub fn get_general<T : FromValue>(&self, name : &str) -> Result<T, RegError> {
    let value = self.general.get(name)
      .ok_or_else(|| RegError::KeyNotFound(String::from(name)))?;
    T::from_value(value).ok_or_else(|| RegError::TypeMismatch {
      name     : String::from(name),
      expected : T::TYPE_NAME,
    })
  }

  pub fn get_channel<T : FromValue>(&self, name : &str, index : usize) -> Result<T, RegError> {
    let count = self.number_of_channels.unwrap_or(0);
    if index >= count {
      return Err(RegError::ChannelOutOfRange { index, count });
    }
    let value = self.channel.get(name)
      .and_then(|slots| slots[index].as_ref())
      .ok_or_else(|| RegError::KeyNotFound(String::from(name)))?;
    T::from_value(value).ok_or_else(|| RegError::TypeMismatch {
      name     : String::from(name),
      expected : T::TYPE_NAME,
    })
  }

  /// General field names in first-decode order
  pub fn general_fields(&self) -> &[String] {
    &self.general_order
  }

  /// Channel field names in first-decode order
  pub fn channel_fields(&self) -> &[String] {
    &self.channel_order
  }

  fn channels_to_show(&self, channel : Option<usize>) -> Result<Vec<usize>, RegError> {
    let count = self.number_of_channels.unwrap_or(0);
    match channel {
      None => Ok((0..count).collect()),
      Some(index) => {
        if index >= count {
          return Err(RegError::ChannelOutOfRange { index, count });
        }
        Ok(vec![index])
      }
    }
  }

  /// Human readable rendering.
  ///
  /// # Arguments
  ///
  /// * verbose : add the descriptions and group the
  ///             channel fields under a header per channel
  /// * channel : only show this channel
  pub fn render(&self, verbose : bool, channel : Option<usize>) -> Result<String, RegError> {
    let mut text = String::new();
    for name in &self.general_order {
      let spec  = self.table.get(name)?;
      let value = spec.kind.render(&self.general[name]);
      if verbose {
        text += &format!("{} ({}): {}\n", name, spec.description, value);
      } else {
        text += &format!("{}: {}\n", name, value);
      }
    }
    if self.channel_order.is_empty() {
      return Ok(text);
    }
    for ch in self.channels_to_show(channel)? {
      if verbose {
        text += &format!("channel {}:\n", ch);
      }
      for name in &self.channel_order {
        let spec = self.table.get(name)?;
        let slot = self.channel.get(name).and_then(|slots| slots[ch].as_ref());
        let value = match slot {
          None    => continue,
          Some(v) => spec.kind.render(v),
        };
        if verbose {
          text += &format!("    {} ({}): {}\n", name, spec.description, value);
        } else {
          text += &format!("{}[{}]: {}\n", name, ch, value);
        }
      }
    }
    Ok(text)
  }

  /// Plain and hex fields hold whole register words
  fn json_value(&self, name : &str, value : &Value) -> Result<serde_json::Value, RegError> {
    match (&self.table.get(name)?.kind, value) {
      (FieldKind::Integer, Value::Int(v))
      | (FieldKind::Hex,   Value::Int(v)) => Ok(json!(*v as u32)),
      (_, other) => Ok(serde_json::to_value(other)?),
    }
  }

  /// Structured rendering, `{"general": {..}, "channels": [..]}`
  pub fn to_json(&self, channel : Option<usize>) -> Result<serde_json::Value, RegError> {
    let mut general = Map::new();
    for name in &self.general_order {
      general.insert(name.clone(), self.json_value(name, &self.general[name])?);
    }
    let mut channels = Vec::<serde_json::Value>::new();
    if !self.channel_order.is_empty() {
      for ch in self.channels_to_show(channel)? {
        let mut entry = Map::new();
        entry.insert(String::from("channel"), json!(ch));
        for name in &self.channel_order {
          if let Some(value) = self.channel.get(name).and_then(|slots| slots[ch].as_ref()) {
            entry.insert(name.clone(), self.json_value(name, value)?);
          }
        }
        channels.push(serde_json::Value::Object(entry));
      }
    }
    Ok(json!({
      "general"  : general,
      "channels" : channels,
    }))
  }
}

/// State shared by all decoders: where the core is,
/// and what was decoded.
pub struct RegisterDecoder {
  pub device : PcieDevice,
  pub values : DecodedValues,
  target     : DeviceMatch,
  devinfo    : Option<DeviceInfo>,
  channel    : Option<usize>,
}

impl RegisterDecoder {

  pub fn new(device : PcieDevice,
             target : DeviceMatch,
             table  : Arc<FieldTable>) -> Self {
    Self {
      device  : device,
      values  : DecodedValues::new(table),
      target  : target,
      devinfo : None,
      channel : None,
    }
  }

  pub fn target(&self) -> &DeviceMatch {
    &self.target
  }

  /// Assign the core location, as found on the SDB
  pub fn set_devinfo(&mut self, info : DeviceInfo) -> Result<(), RegError> {
    self.target.check(&info)?;
    self.devinfo = Some(info);
    Ok(())
  }

  pub fn devinfo(&self) -> Result<&DeviceInfo, RegError> {
    self.devinfo.as_ref().ok_or(RegError::NotConfigured)
  }

  /// Only show this channel when printing
  pub fn set_channel(&mut self, channel : Option<usize>) {
    self.channel = channel;
  }

  pub fn channel(&self) -> Option<usize> {
    self.channel
  }

  /// Read consecutive registers of the core, starting
  /// at `offset` from its base address
  pub fn read_block(&self, offset : u64, words : &mut [u32]) -> Result<(), RegError> {
    let base = self.devinfo()?.start_addr;
    read_words(self.device.control.as_ref(), base + offset, words)
  }

  /// Decode a general integer field
  pub fn decode_field(&mut self,
                      name   : &str,
                      word   : u32,
                      mask   : u32,
                      signed : bool) -> Result<i32, RegError> {
    let value = extract(word, mask, signed)? as i32;
    self.values.add_general(name, Value::Int(value))?;
    Ok(value)
  }

  /// Decode a general fixed point field (whole word)
  pub fn decode_fixed(&mut self,
                      name      : &str,
                      word      : u32,
                      point_pos : u32) -> Result<f64, RegError> {
    let value = fixed_to_float(word, point_pos)?;
    self.values.add_general(name, Value::Float(value))?;
    Ok(value)
  }

  /// Decode an integer field of channel `index`
  pub fn decode_channel_field(&mut self,
                              name   : &str,
                              index  : usize,
                              word   : u32,
                              mask   : u32,
                              signed : bool) -> Result<i32, RegError> {
    let value = extract(word, mask, signed)? as i32;
    self.values.add_channel(name, index, Value::Int(value))?;
    Ok(value)
  }

  /// Decode a fixed point field (whole word) of channel `index`
  pub fn decode_channel_fixed(&mut self,
                              name      : &str,
                              index     : usize,
                              word      : u32,
                              point_pos : u32) -> Result<f64, RegError> {
    let value = fixed_to_float(word, point_pos)?;
    self.values.add_channel(name, index, Value::Float(value))?;
    Ok(value)
  }
}

/// Capabilities of a concrete core decoder.
///
/// Implementors read the raw register block into their
/// own buffer (`read`) and fill the values from it
/// (`decode`). Everything else comes for free.
pub trait Decoder {
  fn base(&self) -> &RegisterDecoder;
  fn base_mut(&mut self) -> &mut RegisterDecoder;

  /// Read the raw registers from the device
  fn read(&mut self) -> Result<(), RegError>;
  /// Fill the values from the raw registers
  fn decode(&mut self) -> Result<(), RegError>;

  /// Read and decode
  fn get_data(&mut self) -> Result<(), RegError> {
    self.read()?;
    self.decode()?;
    self.base_mut().values.finish_pass();
    Ok(())
  }

  fn set_devinfo(&mut self, info : DeviceInfo) -> Result<(), RegError> {
    self.base_mut().set_devinfo(info)
  }

  fn set_channel(&mut self, channel : Option<usize>) {
    self.base_mut().set_channel(channel);
  }

  fn values(&self) -> &DecodedValues {
    &self.base().values
  }

  fn get_general<T : FromValue>(&self, name : &str) -> Result<T, RegError> where Self : Sized {
    self.values().get_general(name)
  }

  fn get_channel<T : FromValue>(&self, name : &str, index : usize) -> Result<T, RegError> where Self : Sized {
    self.values().get_channel(name, index)
  }

  fn print(&self, out : &mut dyn Write, verbose : bool) -> Result<(), RegError> {
    let text = self.values().render(verbose, self.base().channel())?;
    out.write_all(text.as_bytes())?;
    Ok(())
  }

  fn to_json(&self) -> Result<serde_json::Value, RegError> {
    self.values().to_json(self.base().channel())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table() -> Arc<FieldTable> {
    Arc::new(FieldTable::new(vec![
      FieldSpec::new("ready",  "core ready",       FieldKind::boolean("yes", "no")),
      FieldSpec::new("done",   "acquisition done", FieldKind::Progress),
      FieldSpec::new("count",  "sample count",     FieldKind::Integer),
      FieldSpec::new("offset", "offset",           FieldKind::TwosComplement),
      FieldSpec::new("id",     "identifier",       FieldKind::Hex),
      FieldSpec::new("gain",   "channel gain",     FieldKind::FixedPoint { point_pos : 16 }),
      FieldSpec::new("on",     "channel enable",   FieldKind::Enable),
      FieldSpec::new("state",  "fsm state",        FieldKind::custom(|v| format!("S{}", v))),
    ]))
  }

  fn decode_once(values : &mut DecodedValues) {
    values.add_general("count", Value::Int(12)).unwrap();
    values.add_general("ready", Value::Int(4)).unwrap();
    values.add_general("id", Value::Int(0xbeef)).unwrap();
    for ch in 0..2 {
      values.add_channel("gain", ch, Value::Float(0.5 + ch as f64)).unwrap();
      values.add_channel("on", ch, Value::Int(ch as i32)).unwrap();
    }
    values.finish_pass();
  }

  #[test]
  fn boolean_coercion() {
    let mut values = DecodedValues::new(table());
    values.add_general("ready", Value::Int(0x40)).unwrap();
    values.add_general("count", Value::Int(0x40)).unwrap();
    assert_eq!(values.get_general::<i32>("ready").unwrap(), 1);
    assert_eq!(values.get_general::<i32>("count").unwrap(), 0x40);
  }

  #[test]
  fn unknown_field_and_type_mismatch() {
    let mut values = DecodedValues::new(table());
    assert!(matches!(values.add_general("nope", Value::Int(1)), Err(RegError::KeyNotFound(_))));
    values.add_general("count", Value::Int(1)).unwrap();
    assert!(matches!(values.get_general::<f64>("count"), Err(RegError::TypeMismatch { .. })));
    assert!(matches!(values.get_general::<i32>("offset"), Err(RegError::KeyNotFound(_))));
  }

  #[test]
  fn channel_bounds() {
    let mut values = DecodedValues::new(table());
    assert!(matches!(values.add_channel("gain", 0, Value::Float(1.0)),
                     Err(RegError::ChannelsUnset(_))));
    values.set_number_of_channels(2);
    values.add_channel("gain", 1, Value::Float(1.0)).unwrap();
    assert!(matches!(values.add_channel("gain", 2, Value::Float(1.0)),
                     Err(RegError::ChannelOutOfRange { index : 2, count : 2 })));
    assert!(matches!(values.get_channel::<f64>("gain", 2),
                     Err(RegError::ChannelOutOfRange { index : 2, count : 2 })));
    assert_eq!(values.get_channel::<f64>("gain", 1).unwrap(), 1.0);
  }

  #[test]
  fn order_is_stable_over_decodes() {
    let mut values = DecodedValues::new(table());
    values.set_number_of_channels(2);
    decode_once(&mut values);
    let general  = values.general_fields().to_vec();
    let channels = values.channel_fields().to_vec();
    decode_once(&mut values);
    assert_eq!(values.general_fields(), &general[..]);
    assert_eq!(values.channel_fields(), &channels[..]);
    assert_eq!(general, vec!["count", "ready", "id"]);
    assert_eq!(channels, vec!["gain", "on"]);
  }

  #[test]
  fn render_plain_and_verbose() {
    let mut values = DecodedValues::new(table());
    values.set_number_of_channels(2);
    decode_once(&mut values);
    let plain = values.render(false, None).unwrap();
    assert_eq!(plain, "count: 12\nready: yes\nid: 0x0000beef\n\
                       gain[0]: 0.5\non[0]: disabled\ngain[1]: 1.5\non[1]: enabled\n");
    let verbose = values.render(true, Some(1)).unwrap();
    assert_eq!(verbose, "count (sample count): 12\nready (core ready): yes\nid (identifier): 0x0000beef\n\
                         channel 1:\n    gain (channel gain): 1.5\n    on (channel enable): enabled\n");
    assert!(values.render(false, Some(2)).is_err());
  }

  #[test]
  fn render_kinds() {
    let t = table();
    assert_eq!(t.get("offset").unwrap().kind.render(&Value::Int(-3)), "-3");
    assert_eq!(t.get("count").unwrap().kind.render(&Value::Int(-1)), "4294967295");
    assert_eq!(t.get("done").unwrap().kind.render(&Value::Int(1)), "completed");
    assert_eq!(t.get("done").unwrap().kind.render(&Value::Int(0)), "in progress");
    assert_eq!(t.get("state").unwrap().kind.render(&Value::Int(3)), "S3");
  }

  #[test]
  fn fields_showing_up_late_are_kept() {
    let mut values = DecodedValues::new(table());
    values.set_number_of_channels(0);
    values.add_general("count", Value::Int(1)).unwrap();
    values.finish_pass();
    // the core reports channels from now on
    values.set_number_of_channels(2);
    values.add_general("count", Value::Int(1)).unwrap();
    values.add_general("id", Value::Int(2)).unwrap();
    values.add_channel("gain", 1, Value::Float(2.0)).unwrap();
    values.finish_pass();
    assert_eq!(values.general_fields(), &["count", "id"]);
    assert_eq!(values.channel_fields(), &["gain"]);
    assert_eq!(values.render(false, None).unwrap(), "count: 1\nid: 0x00000002\ngain[1]: 2\n");
    // and are recorded once
    values.add_channel("gain", 0, Value::Float(1.0)).unwrap();
    values.add_general("id", Value::Int(3)).unwrap();
    assert_eq!(values.general_fields().len(), 2);
    assert_eq!(values.channel_fields().len(), 1);
  }

  #[test]
  fn json_register_words_are_unsigned() {
    let mut values = DecodedValues::new(table());
    values.add_general("id",     Value::Int(0x8000_0000u32 as i32)).unwrap();
    values.add_general("count",  Value::Int(-1)).unwrap();
    values.add_general("offset", Value::Int(-1)).unwrap();
    let js = values.to_json(None).unwrap();
    assert_eq!(js["general"]["id"],     json!(0x8000_0000u32));
    assert_eq!(js["general"]["count"],  json!(u32::MAX));
    assert_eq!(js["general"]["offset"], json!(-1));
  }

  #[test]
  fn json_keeps_order() {
    let mut values = DecodedValues::new(table());
    values.set_number_of_channels(2);
    decode_once(&mut values);
    let js = values.to_json(None).unwrap();
    let keys : Vec<&String> = js["general"].as_object().unwrap().keys().collect();
    assert_eq!(keys, vec!["count", "ready", "id"]);
    assert_eq!(js["general"]["ready"], json!(1));
    assert_eq!(js["channels"][1]["gain"], json!(1.5));
    assert_eq!(js["channels"][1]["channel"], json!(1));
  }
}
