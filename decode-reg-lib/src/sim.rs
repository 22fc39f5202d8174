//! In-memory device address space
//!
//! Stands in for a BAR when there is no board, e.g. for
//! tests and the `--simulate` mode of the command line
//! tool. Clones share the same storage, so a test can
//! hand one clone to a decoder and `poke` status words
//! through another one.

use std::sync::{Arc,
                Mutex,
                MutexGuard};

use crate::errors::RegError;
use crate::memory::{check_alignment,
                    MemoryRegion,
                    SIZEOF_U32};

#[derive(Debug, Default)]
struct SimMemory {
  bytes  : Vec<u8>,
  /// (address, length in bytes) of every write, in order
  writes : Vec<(u64, usize)>,
}

#[derive(Debug, Clone, Default)]
pub struct SimRegion {
  memory : Arc<Mutex<SimMemory>>,
}

impl SimRegion {

  /// A zeroed region of `size` bytes
  pub fn new(size : usize) -> Self {
    Self {
      memory : Arc::new(Mutex::new(SimMemory {
        bytes  : vec![0u8; size],
        writes : Vec::new(),
      })),
    }
  }

  fn lock(&self) -> Result<MutexGuard<'_, SimMemory>, RegError> {
    self.memory.lock().map_err(|_| RegError::Transport(String::from("poisoned simulation lock")))
  }

  pub fn size(&self) -> usize {
    self.lock().map(|mem| mem.bytes.len()).unwrap_or(0)
  }

  /// Get the word at `addr`, 0 if outside of the region
  pub fn peek(&self, addr : u64) -> u32 {
    let mut bytes = [0u8; SIZEOF_U32];
    match self.read(addr, &mut bytes) {
      Err(_) => 0,
      Ok(_)  => u32::from_le_bytes(bytes),
    }
  }

  /// Set the word at `addr` without recording a write
  pub fn poke(&self, addr : u64, value : u32) {
    self.poke_bytes(addr, &value.to_le_bytes());
  }

  /// Set raw bytes at `addr` without recording a write.
  /// Bytes beyond the region are dropped.
  pub fn poke_bytes(&self, addr : u64, bytes : &[u8]) {
    if let Ok(mut mem) = self.lock() {
      let start = addr as usize;
      let end   = usize::min(start + bytes.len(), mem.bytes.len());
      if start < end {
        mem.bytes[start..end].copy_from_slice(&bytes[..end - start]);
      }
    }
  }

  /// Get and clear the list of (address, length) of all
  /// writes seen so far
  pub fn take_writes(&self) -> Vec<(u64, usize)> {
    match self.lock() {
      Err(_)      => Vec::new(),
      Ok(mut mem) => std::mem::take(&mut mem.writes),
    }
  }

  fn range(&self, size : usize, addr : u64, len : usize) -> Result<std::ops::Range<usize>, RegError> {
    check_alignment(addr, len)?;
    let start = addr as usize;
    if start + len > size {
      return Err(RegError::Transport(format!("access of {len} bytes at {addr:#x} outside of simulated region ({size} bytes)")));
    }
    Ok(start..start + len)
  }
}

impl MemoryRegion for SimRegion {

  fn read(&self, addr : u64, buf : &mut [u8]) -> Result<(), RegError> {
    let mem   = self.lock()?;
    let range = self.range(mem.bytes.len(), addr, buf.len())?;
    buf.copy_from_slice(&mem.bytes[range]);
    Ok(())
  }

  fn write(&self, addr : u64, buf : &[u8]) -> Result<(), RegError> {
    let mut mem = self.lock()?;
    let range   = self.range(mem.bytes.len(), addr, buf.len())?;
    mem.bytes[range].copy_from_slice(buf);
    mem.writes.push((addr, buf.len()));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::memory::{read_word,
                      write_word};

  #[test]
  fn clones_share_storage() {
    let sim   = SimRegion::new(32);
    let other = sim.clone();
    other.poke(0x4, 0xdead_beef);
    assert_eq!(read_word(&sim, 0x4).unwrap(), 0xdead_beef);
    assert!(sim.take_writes().is_empty());
    write_word(&sim, 0x8, 1).unwrap();
    assert_eq!(other.take_writes(), vec![(0x8, 4)]);
  }

  #[test]
  fn out_of_bounds() {
    let sim = SimRegion::new(8);
    assert!(read_word(&sim, 0x8).is_err());
    assert_eq!(sim.peek(0x100), 0);
  }
}
