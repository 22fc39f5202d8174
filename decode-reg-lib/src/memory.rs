//! Access to the memory mapped BARs of the PCIe board
//!
//! The board maps three regions into the host memory:
//!
//! * BAR0 - PCIe core configuration, holds the page
//!          select registers for the other two BARs
//! * BAR2 - window into the DDR sample memory of the
//!          acquisition cores (bulk reads)
//! * BAR4 - window into the wishbone bus with the
//!          control registers of all cores
//!
//! BAR2 and BAR4 are smaller than what they give access
//! to, so every access selects the page first. The page
//! select registers are global per board, accesses are
//! serialized through a mutex per window.
//!
//! Every register is 32bit. Addresses and lengths of all
//! transfers have to be aligned to 4 bytes, and the bytes
//! come back in device order (little endian words).

use std::fs::File;
use std::ptr;
use std::sync::{Arc,
                Mutex};

use memmap::{MmapMut,
             MmapOptions};

use crate::errors::RegError;
use crate::settings::Settings;

/// The size of a 32bit unsigned int in byte
/// (all words in registers are u32)
pub const SIZEOF_U32 : usize = 4;

/// Page select register for the BAR2 (sample memory) window
pub const BAR0_SDRAM_PAGE_REG : u64 = 0x70;
/// Page select register for the BAR4 (wishbone) window
pub const BAR0_WB_PAGE_REG    : u64 = 0x90;

/// Byte addressed view of a device address space
pub trait MemoryRegion : Send + Sync {
  /// Fill `buf` starting at `addr`
  fn read(&self, addr : u64, buf : &mut [u8]) -> Result<(), RegError>;
  /// Write all of `buf` starting at `addr`
  fn write(&self, addr : u64, buf : &[u8]) -> Result<(), RegError>;
}

/// Fail if a transfer is not aligned to 32bit words
pub fn check_alignment(addr : u64, len : usize) -> Result<(), RegError> {
  if addr % SIZEOF_U32 as u64 != 0 || len % SIZEOF_U32 != 0 {
    return Err(RegError::Transport(format!("unaligned access of {len} bytes at {addr:#x}")));
  }
  Ok(())
}

/// Read consecutive 32bit registers
pub fn read_words(region : &dyn MemoryRegion,
                  addr   : u64,
                  words  : &mut [u32]) -> Result<(), RegError> {
  let mut bytes = vec![0u8; words.len()*SIZEOF_U32];
  region.read(addr, &mut bytes)?;
  for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(SIZEOF_U32)) {
    *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
  }
  trace!("Read {} words at {:#x}", words.len(), addr);
  Ok(())
}

/// Write consecutive 32bit registers
pub fn write_words(region : &dyn MemoryRegion,
                   addr   : u64,
                   words  : &[u32]) -> Result<(), RegError> {
  let mut bytes = Vec::<u8>::with_capacity(words.len()*SIZEOF_U32);
  for word in words {
    bytes.extend_from_slice(&word.to_le_bytes());
  }
  trace!("Write {} words at {:#x}", words.len(), addr);
  region.write(addr, &bytes)
}

/// Get a single value from a 32bit (1 word) register
pub fn read_word(region : &dyn MemoryRegion, addr : u64) -> Result<u32, RegError> {
  let mut word = [0u32; 1];
  read_words(region, addr, &mut word)?;
  Ok(word[0])
}

/// Write a single 32bit register
pub fn write_word(region : &dyn MemoryRegion, addr : u64, data : u32) -> Result<(), RegError> {
  write_words(region, addr, &[data])
}

/// A whole BAR mapped into our address space.
///
/// On linux, the BARs are exposed as
/// /sys/bus/pci/devices/<slot>/resourceN
pub struct MmapRegion {
  path : String,
  map  : Mutex<MmapMut>,
  len  : usize,
}

impl MmapRegion {

  /// Allow READ/WRITE access to the BAR at `path`
  ///
  /// # Arguments
  ///
  /// * path : resource file of the BAR
  pub fn open(path : &str) -> Result<Self, RegError> {
    let file = File::options()
      .read(true)
      .write(true)
      .open(path)?;
    let len = file.metadata()?.len() as usize;
    let map = unsafe {
      MmapOptions::new()
        .len(len)
        .map_mut(&file)?
    };
    debug!("Mapped {} ({} bytes)", path, len);
    Ok(Self {
      path : String::from(path),
      map  : Mutex::new(map),
      len  : len,
    })
  }

  pub fn len(&self) -> usize {
    self.len
  }

  fn check_bounds(&self, addr : u64, len : usize) -> Result<usize, RegError> {
    check_alignment(addr, len)?;
    let start = addr as usize;
    if start + len > self.len {
      return Err(RegError::Transport(format!("access of {len} bytes at {addr:#x} beyond {} ({} bytes)",
                                             self.path, self.len)));
    }
    Ok(start)
  }
}

impl MemoryRegion for MmapRegion {

  fn read(&self, addr : u64, buf : &mut [u8]) -> Result<(), RegError> {
    let start = self.check_bounds(addr, buf.len())?;
    let map   = self.map.lock().map_err(|_| RegError::Transport(String::from("poisoned BAR lock")))?;
    let p     = map.as_ptr() as *const u32;
    for (k, chunk) in buf.chunks_exact_mut(SIZEOF_U32).enumerate() {
      let value : u32;
      unsafe {
        value = ptr::read_volatile(p.add(start/SIZEOF_U32 + k));
      }
      chunk.copy_from_slice(&value.to_le_bytes());
    }
    Ok(())
  }

  fn write(&self, addr : u64, buf : &[u8]) -> Result<(), RegError> {
    let start   = self.check_bounds(addr, buf.len())?;
    let mut map = self.map.lock().map_err(|_| RegError::Transport(String::from("poisoned BAR lock")))?;
    let p       = map.as_mut_ptr() as *mut u32;
    for (k, chunk) in buf.chunks_exact(SIZEOF_U32).enumerate() {
      let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
      unsafe {
        ptr::write_volatile(p.add(start/SIZEOF_U32 + k), value);
      }
    }
    Ok(())
  }
}

/// A fixed-size window BAR, where the page is chosen
/// through a page select register in the config BAR.
pub struct PagedRegion {
  config    : Arc<dyn MemoryRegion>,
  window    : Arc<dyn MemoryRegion>,
  page_reg  : u64,
  page_size : u64,
  /// the page currently selected, if known
  page      : Mutex<Option<u64>>,
}

impl PagedRegion {

  pub fn new(config    : Arc<dyn MemoryRegion>,
             window    : Arc<dyn MemoryRegion>,
             page_reg  : u64,
             page_size : u64) -> Self {
    Self {
      config,
      window,
      page_reg,
      page_size,
      page : Mutex::new(None),
    }
  }

  /// Split a transfer into pieces which do not cross
  /// page boundaries, and run `op` on each of them
  /// with the right page selected.
  fn paged<F>(&self, addr : u64, len : usize, mut op : F) -> Result<(), RegError>
    where F : FnMut(u64, usize, usize) -> Result<(), RegError> {
    check_alignment(addr, len)?;
    let mut current = self.page.lock().map_err(|_| RegError::Transport(String::from("poisoned page lock")))?;
    let mut done = 0usize;
    while done < len {
      let pos    = addr + done as u64;
      let page   = pos / self.page_size;
      let offset = pos % self.page_size;
      let chunk  = usize::min(len - done, (self.page_size - offset) as usize);
      if *current != Some(page) {
        trace!("Select page {} through register {:#x}", page, self.page_reg);
        write_word(self.config.as_ref(), self.page_reg, page as u32)?;
        *current = Some(page);
      }
      op(offset, done, chunk)?;
      done += chunk;
    }
    Ok(())
  }
}

impl MemoryRegion for PagedRegion {

  fn read(&self, addr : u64, buf : &mut [u8]) -> Result<(), RegError> {
    let len = buf.len();
    self.paged(addr, len, |offset, done, chunk| {
      self.window.read(offset, &mut buf[done..done + chunk])
    })
  }

  fn write(&self, addr : u64, buf : &[u8]) -> Result<(), RegError> {
    self.paged(addr, buf.len(), |offset, done, chunk| {
      self.window.write(offset, &buf[done..done + chunk])
    })
  }
}

/// The two address spaces of one board, shared by all
/// decoders and controllers working on it.
#[derive(Clone)]
pub struct PcieDevice {
  /// control registers (BAR4)
  pub control : Arc<dyn MemoryRegion>,
  /// sample memory (BAR2)
  pub sample  : Arc<dyn MemoryRegion>,
}

impl PcieDevice {

  pub fn new(control : Arc<dyn MemoryRegion>,
             sample  : Arc<dyn MemoryRegion>) -> Self {
    Self { control, sample }
  }

  /// Map the BARs of the board in PCIe `slot`
  /// (e.g. "0000:07:00.0")
  pub fn open(slot : &str, settings : &Settings) -> Result<Self, RegError> {
    cfg_if::cfg_if! {
      if #[cfg(target_os = "linux")] {
        let base = format!("/sys/bus/pci/devices/{slot}");
        let bar0 : Arc<dyn MemoryRegion> = Arc::new(MmapRegion::open(&format!("{base}/resource0"))?);
        let bar2 : Arc<dyn MemoryRegion> = Arc::new(MmapRegion::open(&format!("{base}/resource2"))?);
        let bar4 : Arc<dyn MemoryRegion> = Arc::new(MmapRegion::open(&format!("{base}/resource4"))?);
        info!("Opened PCIe board at {}", slot);
        Ok(Self {
          control : Arc::new(PagedRegion::new(Arc::clone(&bar0), bar4,
                                              BAR0_WB_PAGE_REG, settings.bar4_page_size)),
          sample  : Arc::new(PagedRegion::new(bar0, bar2,
                                              BAR0_SDRAM_PAGE_REG, settings.bar2_page_size)),
        })
      } else {
        let _ = settings;
        Err(RegError::Transport(format!("can't map PCIe board {slot}, sysfs BARs are only available on linux")))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sim::SimRegion;

  #[test]
  fn word_helpers_are_little_endian() {
    let sim = SimRegion::new(64);
    write_word(&sim, 0x8, 0x1122_3344).unwrap();
    let mut bytes = [0u8; 4];
    sim.read(0x8, &mut bytes).unwrap();
    assert_eq!(bytes, [0x44, 0x33, 0x22, 0x11]);
    assert_eq!(read_word(&sim, 0x8).unwrap(), 0x1122_3344);
  }

  #[test]
  fn unaligned_access_fails() {
    let sim = SimRegion::new(64);
    let mut bytes = [0u8; 4];
    assert!(matches!(sim.read(0x2, &mut bytes), Err(RegError::Transport(_))));
    let mut bytes = [0u8; 6];
    assert!(matches!(sim.read(0x0, &mut bytes), Err(RegError::Transport(_))));
  }

  #[test]
  fn paged_window_switches_pages() {
    let config = SimRegion::new(0x100);
    let window = SimRegion::new(0x10);
    let paged  = PagedRegion::new(Arc::new(config.clone()), Arc::new(window.clone()),
                                  BAR0_WB_PAGE_REG, 0x10);
    // write into page 2, offset 4
    write_word(&paged, 0x24, 0xcafe).unwrap();
    assert_eq!(config.peek(BAR0_WB_PAGE_REG), 2);
    assert_eq!(window.peek(0x4), 0xcafe);
    // a transfer crossing into page 3 ends up at the
    // start of the window with page 3 selected
    write_words(&paged, 0x2c, &[0x1, 0x2, 0x3]).unwrap();
    assert_eq!(config.peek(BAR0_WB_PAGE_REG), 3);
    assert_eq!(window.peek(0x0), 0x2);
    assert_eq!(window.peek(0x4), 0x3);
  }
}
