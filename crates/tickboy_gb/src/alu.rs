//! Stateless arithmetic with exact DMG flag semantics.
//!
//! Every operation returns a [`ValueFlags`]: the result sits above bit 8,
//! the Z/N/H/C flags occupy their architectural positions in the low byte.
//! The instruction engine unpacks the two halves and decides, per
//! instruction family, which flags to keep.

use bitflags::bitflags;

use crate::bits;

bitflags! {
    /// The four condition flags, at the bit positions of the F register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        const C = 1 << 4;
        const H = 1 << 5;
        const N = 1 << 6;
        const Z = 1 << 7;
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum RotDir {
    Left,
    Right,
}

/// Result of an ALU operation: `value << 8 | flags`.
pub type ValueFlags = u32;

/// Returns the flag byte with exactly the requested flags set.
pub fn mask_znhc(z: bool, n: bool, h: bool, c: bool) -> u8 {
    let mut flags = Flags::empty();
    flags.set(Flags::Z, z);
    flags.set(Flags::N, n);
    flags.set(Flags::H, h);
    flags.set(Flags::C, c);
    flags.bits()
}

/// Extracts the (up to 16-bit) value from a packed result.
#[inline]
pub fn unpack_value(vf: ValueFlags) -> u16 {
    (vf >> 8) as u16
}

/// Extracts an 8-bit value from a packed result of an 8-bit operation.
#[inline]
pub fn unpack_value8(vf: ValueFlags) -> u8 {
    debug_assert!(vf >> 8 <= 0xFF, "packed value is wider than 8 bits");
    (vf >> 8) as u8
}

/// Extracts the flag byte from a packed result.
#[inline]
pub fn unpack_flags(vf: ValueFlags) -> Flags {
    Flags::from_bits_truncate(vf as u8)
}

#[inline]
fn pack(value: u32, z: bool, n: bool, h: bool, c: bool) -> ValueFlags {
    debug_assert!(value <= 0xFFFF);
    value << 8 | mask_znhc(z, n, h, c) as u32
}

/// 8-bit addition with an optional incoming carry.
///
/// H is the carry out of the low nibble, C the carry out of bit 7.
pub fn add(l: u8, r: u8, c0: bool) -> ValueFlags {
    let carry = c0 as u32;
    let sum = l as u32 + r as u32 + carry;
    let h = (l & 0xF) as u32 + (r & 0xF) as u32 + carry > 0xF;
    pack(sum & 0xFF, sum & 0xFF == 0, false, h, sum > 0xFF)
}

/// 16-bit addition whose H and C come from the low-byte stage. Z and N are
/// always clear. Used by the SP-relative forms.
pub fn add16_l(l: u16, r: u16) -> ValueFlags {
    let h = (l & 0xF) + (r & 0xF) > 0xF;
    let c = (l & 0xFF) + (r & 0xFF) > 0xFF;
    pack(l.wrapping_add(r) as u32, false, false, h, c)
}

/// 16-bit addition whose H and C come from the high-byte stage of a
/// two-step 8-bit addition with carry propagation. Used by the
/// register-pair forms; not interchangeable with [`add16_l`].
pub fn add16_h(l: u16, r: u16) -> ValueFlags {
    let low = add(bits::lsb(l), bits::lsb(r), false);
    let carry = unpack_flags(low).contains(Flags::C);
    let high = add(bits::msb(l), bits::msb(r), carry);
    let flags = unpack_flags(high);
    pack(
        l.wrapping_add(r) as u32,
        false,
        false,
        flags.contains(Flags::H),
        flags.contains(Flags::C),
    )
}

/// 8-bit subtraction with an optional incoming borrow.
///
/// H is the borrow into the low nibble, C the borrow into bit 7.
pub fn sub(l: u8, r: u8, b0: bool) -> ValueFlags {
    let borrow = b0 as i32;
    let diff = (l as i32 - r as i32 - borrow) & 0xFF;
    let h = (l & 0xF) as i32 - borrow < (r & 0xF) as i32;
    let c = l as i32 - borrow < r as i32;
    pack(diff as u32, diff == 0, true, h, c)
}

/// Decimal correction of the accumulator after a BCD add or subtract.
///
/// The correction (+/- 0x06, 0x60 or 0x66) is picked from the N/H/C flags
/// of the preceding operation; the outgoing C reports whether the
/// high-nibble correction applied.
pub fn bcd_adjust(v: u8, n: bool, h: bool, c: bool) -> ValueFlags {
    let fix_l = h || (!n && v & 0xF > 0x9);
    let fix_h = c || (!n && v > 0x99);
    let mut fix = 0u8;
    if fix_h {
        fix += 0x60;
    }
    if fix_l {
        fix += 0x06;
    }
    let value = if n { v.wrapping_sub(fix) } else { v.wrapping_add(fix) };
    pack(value as u32, value == 0, n, false, fix_h)
}

/// Bitwise AND; always sets H, clears N and C.
pub fn and(l: u8, r: u8) -> ValueFlags {
    let v = l & r;
    pack(v as u32, v == 0, false, true, false)
}

/// Bitwise OR; clears N, H and C.
pub fn or(l: u8, r: u8) -> ValueFlags {
    let v = l | r;
    pack(v as u32, v == 0, false, false, false)
}

/// Bitwise XOR; clears N, H and C.
pub fn xor(l: u8, r: u8) -> ValueFlags {
    let v = l ^ r;
    pack(v as u32, v == 0, false, false, false)
}

/// One-bit left shift; the ejected bit 7 becomes C.
pub fn shift_left(v: u8) -> ValueFlags {
    let shifted = v << 1;
    pack(shifted as u32, shifted == 0, false, false, bits::test(v as u32, 7))
}

/// One-bit arithmetic right shift (bit 7 is replicated); bit 0 becomes C.
pub fn shift_right_a(v: u8) -> ValueFlags {
    let shifted = ((v as i8) >> 1) as u8;
    pack(shifted as u32, shifted == 0, false, false, bits::test(v as u32, 0))
}

/// One-bit logical right shift; bit 0 becomes C.
pub fn shift_right_l(v: u8) -> ValueFlags {
    let shifted = v >> 1;
    pack(shifted as u32, shifted == 0, false, false, bits::test(v as u32, 0))
}

/// One-bit rotation; the bit crossing over becomes C.
pub fn rotate(d: RotDir, v: u8) -> ValueFlags {
    let rotated = match d {
        RotDir::Left => v.rotate_left(1),
        RotDir::Right => v.rotate_right(1),
    };
    let c = match d {
        RotDir::Left => bits::test(v as u32, 7),
        RotDir::Right => bits::test(v as u32, 0),
    };
    pack(rotated as u32, rotated == 0, false, false, c)
}

/// Rotation through the carry: C is prepended as a ninth bit, the 9-bit
/// value rotates, and the new bit 8 becomes the outgoing C.
pub fn rotate_through_carry(d: RotDir, v: u8, c: bool) -> ValueFlags {
    let wide = (c as u32) << 8 | v as u32;
    let distance = match d {
        RotDir::Left => 1,
        RotDir::Right => -1,
    };
    let rotated = bits::rotate(9, wide, distance);
    let value = rotated & 0xFF;
    pack(value, value == 0, false, false, bits::test(rotated, 8))
}

/// Swaps the two nibbles of a byte; flags Z000.
pub fn swap(v: u8) -> ValueFlags {
    let swapped = v.rotate_left(4);
    pack(swapped as u32, swapped == 0, false, false, false)
}

/// Tests the bit at `index`; the packed value is 0 and the flags are Z010
/// with Z set when the bit is clear.
pub fn test_bit(v: u8, index: u32) -> ValueFlags {
    assert!(index < 8, "bit index {index} out of range");
    pack(0, !bits::test(v as u32, index), false, true, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn flags(vf: ValueFlags) -> (bool, bool, bool, bool) {
        let f = unpack_flags(vf);
        (
            f.contains(Flags::Z),
            f.contains(Flags::N),
            f.contains(Flags::H),
            f.contains(Flags::C),
        )
    }

    const BOUNDARY: [u8; 4] = [0x00, 0x0F, 0x80, 0xFF];

    #[test]
    fn pack_layout_matches_register_positions() {
        let vf = add(0x08, 0x08, false);
        assert_eq!(unpack_value8(vf), 0x10);
        assert_eq!(vf & 0xFF, Flags::H.bits() as u32);
    }

    #[test]
    fn add_flags_match_reference_on_boundaries_and_random_values() {
        let mut rng = rand::thread_rng();
        let mut cases: Vec<(u8, u8)> = Vec::new();
        for &l in &BOUNDARY {
            for &r in &BOUNDARY {
                cases.push((l, r));
            }
        }
        for _ in 0..2000 {
            cases.push((rng.gen(), rng.gen()));
        }
        for (l, r) in cases {
            for c0 in [false, true] {
                let vf = add(l, r, c0);
                let wide = l as u32 + r as u32 + c0 as u32;
                assert_eq!(unpack_value8(vf), (wide & 0xFF) as u8);
                let (z, n, h, c) = flags(vf);
                assert_eq!(z, wide & 0xFF == 0, "Z for {l:#x}+{r:#x}+{c0}");
                assert!(!n);
                assert_eq!(h, (l & 0xF) as u32 + (r & 0xF) as u32 + c0 as u32 > 0xF);
                assert_eq!(c, wide > 0xFF);
            }
        }
    }

    #[test]
    fn sub_flags_match_reference_on_boundaries_and_random_values() {
        let mut rng = rand::thread_rng();
        let mut cases: Vec<(u8, u8)> = Vec::new();
        for &l in &BOUNDARY {
            for &r in &BOUNDARY {
                cases.push((l, r));
            }
        }
        for _ in 0..2000 {
            cases.push((rng.gen(), rng.gen()));
        }
        for (l, r) in cases {
            for b0 in [false, true] {
                let vf = sub(l, r, b0);
                let wide = l as i32 - r as i32 - b0 as i32;
                assert_eq!(unpack_value8(vf), (wide & 0xFF) as u8);
                let (z, n, h, c) = flags(vf);
                assert_eq!(z, wide & 0xFF == 0, "Z for {l:#x}-{r:#x}-{b0}");
                assert!(n);
                assert_eq!(h, ((l & 0xF) as i32 - b0 as i32) < (r & 0xF) as i32);
                assert_eq!(c, (l as i32 - b0 as i32) < r as i32);
            }
        }
    }

    #[test]
    fn add16_variants_take_flags_from_different_bytes() {
        // 0x00FF + 0x0001: low-byte stage carries, high-byte stage does not.
        let low = add16_l(0x00FF, 0x0001);
        assert_eq!(unpack_value(low), 0x0100);
        assert_eq!(flags(low), (false, false, true, true));

        let high = add16_h(0x00FF, 0x0001);
        assert_eq!(unpack_value(high), 0x0100);
        assert_eq!(flags(high), (false, false, false, false));

        // 0x0FFF + 0x0001: the nibble carry only shows in the high stage.
        let high = add16_h(0x0FFF, 0x0001);
        assert_eq!(flags(high), (false, false, true, false));

        let high = add16_h(0xFFFF, 0x0001);
        assert_eq!(unpack_value(high), 0x0000);
        assert_eq!(flags(high), (false, false, true, true));
    }

    #[test]
    fn bcd_adjust_corrects_additions_and_subtractions() {
        // 0x09 + 0x01 = 0x0A, adjusted to 0x10.
        let vf = bcd_adjust(0x0A, false, false, false);
        assert_eq!(unpack_value8(vf), 0x10);
        assert_eq!(flags(vf), (false, false, false, false));

        // 0x90 + 0x10 = 0xA0, adjusted to 0x00 with carry.
        let vf = bcd_adjust(0xA0, false, false, false);
        assert_eq!(unpack_value8(vf), 0x00);
        assert_eq!(flags(vf), (true, false, false, true));

        // 0x10 - 0x01 = 0x0F with half-borrow, adjusted to 0x09.
        let vf = bcd_adjust(0x0F, true, true, false);
        assert_eq!(unpack_value8(vf), 0x09);
        assert_eq!(flags(vf), (false, true, false, false));
    }

    #[test]
    fn logic_ops_have_fixed_flag_patterns() {
        assert_eq!(flags(and(0xF0, 0x0F)), (true, false, true, false));
        assert_eq!(flags(and(0xFF, 0x0F)), (false, false, true, false));
        assert_eq!(flags(or(0x00, 0x00)), (true, false, false, false));
        assert_eq!(flags(xor(0xAA, 0xAA)), (true, false, false, false));
        assert_eq!(unpack_value8(xor(0xAA, 0x55)), 0xFF);
    }

    #[test]
    fn shifts_eject_into_carry() {
        assert_eq!(unpack_value8(shift_left(0b1000_0001)), 0b0000_0010);
        assert_eq!(flags(shift_left(0b1000_0001)), (false, false, false, true));
        assert_eq!(flags(shift_left(0x80)), (true, false, false, true));

        assert_eq!(unpack_value8(shift_right_a(0b1000_0001)), 0b1100_0000);
        assert_eq!(flags(shift_right_a(0b1000_0001)), (false, false, false, true));

        assert_eq!(unpack_value8(shift_right_l(0b1000_0001)), 0b0100_0000);
        assert_eq!(flags(shift_right_l(0x01)), (true, false, false, true));
    }

    #[test]
    fn rotations_carry_the_crossing_bit() {
        assert_eq!(unpack_value8(rotate(RotDir::Left, 0x80)), 0x01);
        assert!(unpack_flags(rotate(RotDir::Left, 0x80)).contains(Flags::C));
        assert_eq!(unpack_value8(rotate(RotDir::Right, 0x01)), 0x80);
        assert!(unpack_flags(rotate(RotDir::Right, 0x01)).contains(Flags::C));

        // 9-bit rotation: C enters at the opposite end.
        let vf = rotate_through_carry(RotDir::Left, 0x00, true);
        assert_eq!(unpack_value8(vf), 0x01);
        assert!(!unpack_flags(vf).contains(Flags::C));

        let vf = rotate_through_carry(RotDir::Right, 0x00, true);
        assert_eq!(unpack_value8(vf), 0x80);
        assert!(!unpack_flags(vf).contains(Flags::C));

        let vf = rotate_through_carry(RotDir::Left, 0x80, false);
        assert_eq!(unpack_value8(vf), 0x00);
        assert_eq!(flags(vf), (true, false, false, true));
    }

    #[test]
    fn swap_exchanges_nibbles() {
        assert_eq!(unpack_value8(swap(0xAB)), 0xBA);
        assert_eq!(flags(swap(0x00)), (true, false, false, false));
    }

    #[test]
    fn test_bit_sets_z_when_bit_clear() {
        assert_eq!(flags(test_bit(0b0000_0100, 2)), (false, false, true, false));
        assert_eq!(flags(test_bit(0b0000_0100, 3)), (true, false, true, false));
    }
}
