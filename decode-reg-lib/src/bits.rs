//! Bit-field codec for 32bit register words
//!
//! A field is described by its mask, which has to be a
//! contiguous run of 1 bits. The position of the lowest
//! set bit is the shift of the field, the number of
//! set bits its width.
//!
//! Fixed point numbers are two's complement 32bit words
//! with the binary point `point_pos` bits from the LSB.

use crate::errors::RegError;

/// Position of the lowest set bit of a field mask.
///
/// Fails if the mask is empty or not contiguous.
pub fn mask_shift(mask : u32) -> Result<u32, RegError> {
  if mask == 0 {
    return Err(RegError::InvalidMask(mask));
  }
  let shift = mask.trailing_zeros();
  let run   = mask >> shift;
  // a run of ones plus one is a power of two
  if run & run.wrapping_add(1) != 0 {
    return Err(RegError::InvalidMask(mask));
  }
  Ok(shift)
}

/// Number of bits covered by a field mask
pub fn mask_width(mask : u32) -> u32 {
  mask.count_ones()
}

/// Get the value of the field `mask` out of `word`.
///
/// # Arguments
///
/// * word   : raw register word
/// * mask   : contiguous field mask
/// * signed : interpret the field as two's complement
///            of its own width
pub fn extract(word   : u32,
               mask   : u32,
               signed : bool) -> Result<i64, RegError> {
  let shift = mask_shift(mask)?;
  let width = mask_width(mask);
  let raw   = ((word & mask) >> shift) as u64;
  if signed && (raw >> (width - 1)) & 0x1 == 1 {
    return Ok(raw as i64 - (1i64 << width));
  }
  Ok(raw as i64)
}

/// Write `value` into the field `mask` of `word`.
///
/// The other bits of `word` are left as they are.
/// Signed fields accept [-(2^(w-1)), 2^(w-1)-1],
/// unsigned ones [0, 2^w - 1].
pub fn insert(word   : u32,
              value  : i64,
              mask   : u32,
              signed : bool) -> Result<u32, RegError> {
  let shift = mask_shift(mask)?;
  let width = mask_width(mask);
  let (min, max) = if signed {
    (-(1i64 << (width - 1)), (1i64 << (width - 1)) - 1)
  } else {
    (0, (1i64 << width) - 1)
  };
  if value < min || value > max {
    return Err(RegError::ValueOutOfRange { value, mask });
  }
  let field = (value as u64 & ((1u64 << width) - 1)) as u32;
  Ok((word & !mask) | (field << shift))
}

/// Set or clear a single bit
pub fn insert_bit(word : u32,
                  bit  : bool,
                  mask : u32) -> Result<u32, RegError> {
  if mask.count_ones() != 1 {
    return Err(RegError::InvalidMask(mask));
  }
  if bit {
    Ok(word | mask)
  } else {
    Ok(word & !mask)
  }
}

/// Check if any bit of `mask` is set in `word`
pub fn bit_set(word : u32, mask : u32) -> bool {
  word & mask != 0
}

/// Sign-extend a raw atom of `width` bits (8, 16 or 32)
pub fn sign_extend(raw : u32, width : u32) -> Result<i32, RegError> {
  match width {
    8  => Ok(raw as u8  as i8  as i32),
    16 => Ok(raw as u16 as i16 as i32),
    32 => Ok(raw as i32),
    _  => Err(RegError::UnsupportedWidth(width)),
  }
}

fn check_point_pos(point_pos : u32) -> Result<f64, RegError> {
  if point_pos > 31 {
    return Err(RegError::InvalidPointPosition(point_pos));
  }
  Ok((1u64 << point_pos) as f64)
}

/// Convert a fixed point word into a float
pub fn fixed_to_float(raw : u32, point_pos : u32) -> Result<f64, RegError> {
  let scale = check_point_pos(point_pos)?;
  Ok(raw as i32 as f64 / scale)
}

/// Convert a float into a fixed point word.
///
/// Values outside of the representable range either
/// saturate (`saturate == true`) or fail. The one
/// exception is -min_representable (2^(31-point_pos)),
/// which always maps to the maximum word.
pub fn float_to_fixed(value     : f64,
                      point_pos : u32,
                      saturate  : bool) -> Result<u32, RegError> {
  let scale  = check_point_pos(point_pos)?;
  if value.is_nan() {
    return Err(RegError::FixedPointOutOfRange { value, point_pos });
  }
  let scaled = (value * scale).round();
  if scaled > i32::MAX as f64 {
    if saturate || scaled == -(i32::MIN as f64) {
      return Ok(i32::MAX as u32);
    }
    return Err(RegError::FixedPointOutOfRange { value, point_pos });
  }
  if scaled < i32::MIN as f64 {
    if saturate {
      return Ok(i32::MIN as u32);
    }
    return Err(RegError::FixedPointOutOfRange { value, point_pos });
  }
  Ok(scaled as i32 as u32)
}
