//! Single-bit helpers shared by every component.

#[inline]
pub const fn test(value: u8, bit: u8) -> bool {
    value & (1 << bit) != 0
}

#[inline]
pub const fn set(value: u8, bit: u8) -> u8 {
    value | (1 << bit)
}

#[inline]
pub const fn reset(value: u8, bit: u8) -> u8 {
    value & !(1 << bit)
}
