//! Decoding and control of FPGA core register maps
//!
//! The cores (acquisition engine, position calculation, ...) of a 
//! data-acquisition board sit behind the BARs of a PCIe device. Each 
//! core is a fixed bit-packed register layout. This library reads the 
//! raw 32bit words and decodes them into named fields, and in the other
//! direction encodes parameters into masked/shifted words before writing
//! them back.
//!
//! * `bits`       - bit-field and fixed point codec
//! * `memory`     - access to the BARs (mmap, paged windows)
//! * `sdb`        - locate cores on the self-describing bus
//! * `decoder`    - generic field tables and decoded values
//! * `controller` - generic parameter writes
//! * `acq`        - the acquisition core and its state machine
//! * `pos_calc`   - the position calculation core
//! * `modules`    - cores by name, simulated board
//!
//! The `sim` module provides an in-memory address space to
//! work without a board.

pub mod errors;
pub mod bits;
pub mod memory;
pub mod sim;
pub mod sdb;
pub mod decoder;
pub mod controller;
pub mod registers;
pub mod acq;
pub mod pos_calc;
pub mod modules;
pub mod settings;

#[macro_use] extern crate log;

pub use errors::RegError;
pub use memory::{MemoryRegion,
                 PcieDevice};
pub use sdb::{DeviceInfo,
              DeviceMatch};
pub use decoder::{Decoder,
                  Value};
pub use controller::Controller;
pub use settings::Settings;
