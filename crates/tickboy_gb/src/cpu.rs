//! The instruction execution engine.
//!
//! The processor is a three-state machine driven once per cycle: idle
//! (waiting out a multi-cycle instruction, or parked by HALT), interrupt
//! dispatch, or instruction dispatch through the opcode descriptor tables.
//! All memory traffic goes through the [`Bus`] passed to each cycle step;
//! the memory-mapped IE/IF pair lives in a small shared component so
//! programs can reach it over the bus while the engine consults it
//! directly.

pub mod opcode;

#[cfg(test)]
mod tests;

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;

use crate::alu::{self, Flags, RotDir, ValueFlags};
use crate::bits;
use crate::bus::{Bus, Clocked, Component};
use crate::cpu::opcode::{
    Family, Opcode, DIRECT_OPCODE_TABLE, OPCODE_PREFIX, PREFIXED_OPCODE_TABLE,
};
use crate::memory::map;
use crate::registers::{Register, RegisterFile};

bitflags! {
    /// The five interrupt sources, one bit per source in IE/IF order.
    /// Lower bits take priority when several are pending.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interrupts: u8 {
        const VBLANK = 1 << 0;
        const LCD_STAT = 1 << 1;
        const TIMER = 1 << 2;
        const SERIAL = 1 << 3;
        const JOYPAD = 1 << 4;
    }
}

/// The memory-mapped interrupt-enable and interrupt-flag registers.
///
/// Attached to the bus on the CPU's behalf; both bytes are stored verbatim
/// so programs read back exactly what they wrote, but only the five
/// architectural bits participate in dispatch.
pub(crate) struct InterruptRegisters {
    enable: u8,
    flags: u8,
}

impl Component for InterruptRegisters {
    fn read(&self, address: u16) -> Option<u8> {
        match address {
            map::REG_IE => Some(self.enable),
            map::REG_IF => Some(self.flags),
            _ => None,
        }
    }

    fn write(&mut self, address: u16, value: u8) {
        match address {
            map::REG_IE => self.enable = value,
            map::REG_IF => self.flags = value,
            _ => {}
        }
    }
}

/// The eight 8-bit registers, in F-register pairing order.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Reg {
    A,
    F,
    B,
    C,
    D,
    E,
    H,
    L,
}

impl Register for Reg {
    const COUNT: usize = 8;

    fn index(self) -> usize {
        self as usize
    }
}

impl Reg {
    /// Maps a 3-bit register code from an opcode encoding. Code 6 is the
    /// (HL) slot and never reaches here: those encodings have their own
    /// families.
    fn from_code(code: u32) -> Reg {
        match code {
            0 => Reg::B,
            1 => Reg::C,
            2 => Reg::D,
            3 => Reg::E,
            4 => Reg::H,
            5 => Reg::L,
            7 => Reg::A,
            _ => unreachable!("register code {code} has no 8-bit register"),
        }
    }
}

/// The register pair views.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum Reg16 {
    Af,
    Bc,
    De,
    Hl,
}

impl Reg16 {
    fn from_code(code: u32) -> Reg16 {
        match code {
            0 => Reg16::Bc,
            1 => Reg16::De,
            2 => Reg16::Hl,
            _ => Reg16::Af,
        }
    }

    fn parts(self) -> (Reg, Reg) {
        match self {
            Reg16::Af => (Reg::A, Reg::F),
            Reg16::Bc => (Reg::B, Reg::C),
            Reg16::De => (Reg::D, Reg::E),
            Reg16::Hl => (Reg::H, Reg::L),
        }
    }
}

/// Where an instruction family takes each flag from.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum FlagSrc {
    /// Fixed 0.
    V0,
    /// Fixed 1.
    V1,
    /// The ALU result's flag.
    Alu,
    /// The current F register, unchanged.
    Cpu,
}

pub struct Cpu {
    regs: RegisterFile<Reg>,
    sp: u16,
    pc: u16,
    ime: bool,
    next_non_idle_cycle: u64,
    interrupts: Rc<RefCell<InterruptRegisters>>,
}

impl Cpu {
    pub fn new() -> Cpu {
        Cpu {
            regs: RegisterFile::new(),
            sp: 0,
            pc: 0,
            ime: false,
            next_non_idle_cycle: 0,
            interrupts: Rc::new(RefCell::new(InterruptRegisters {
                enable: 0,
                flags: 0,
            })),
        }
    }

    /// Attaches the processor's memory-mapped registers (IE/IF) to the bus.
    pub fn attach_to(&self, bus: &mut Bus) {
        bus.attach(self.interrupts.clone());
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    pub fn sp(&self) -> u16 {
        self.sp
    }

    /// Raises the given interrupt requests, i.e. sets their IF bits.
    pub fn request_interrupts(&mut self, interrupts: Interrupts) {
        self.interrupts.borrow_mut().flags |= interrupts.bits();
    }

    /// Interrupts that are both pending and enabled.
    fn pending_interrupts(&self) -> Interrupts {
        let regs = self.interrupts.borrow();
        Interrupts::from_bits_truncate(regs.enable & regs.flags)
    }

    fn really_cycle(&mut self, bus: &Bus) {
        let pending = self.pending_interrupts();
        if self.ime && !pending.is_empty() {
            let index = pending.bits().trailing_zeros();
            self.ime = false;
            {
                let mut regs = self.interrupts.borrow_mut();
                regs.flags = bits::set(regs.flags as u32, index, false) as u8;
            }
            log::trace!(
                "dispatching interrupt {index} from pc {:#06X}",
                self.pc
            );
            self.push16(bus, self.pc);
            self.pc = map::INTERRUPT_VECTORS[index as usize];
            self.next_non_idle_cycle += 5;
        } else if bus.read(self.pc) == OPCODE_PREFIX {
            let encoding = self.read8_after_opcode(bus);
            self.dispatch(PREFIXED_OPCODE_TABLE[encoding as usize], bus);
        } else {
            let encoding = bus.read(self.pc);
            match DIRECT_OPCODE_TABLE[encoding as usize] {
                Some(op) => self.dispatch(op, bus),
                None => panic!(
                    "unknown opcode {encoding:#04X} at {:#06X}",
                    self.pc
                ),
            }
        }
    }

    fn dispatch(&mut self, opcode: Opcode, bus: &Bus) {
        let mut next_pc = self.pc.wrapping_add(opcode.total_bytes);

        match opcode.family {
            Family::Nop => {}

            // Loads.
            Family::LdR8Hlr => {
                let r = self.extract_reg(opcode, 3);
                let v = self.read8_at_hl(bus);
                self.regs.set(r, v);
            }
            Family::LdAHlru => {
                let v = self.read8_at_hl(bus);
                self.regs.set(Reg::A, v);
                let hl = self
                    .reg16(Reg16::Hl)
                    .wrapping_add_signed(hl_increment(opcode));
                self.set_reg16(Reg16::Hl, hl);
            }
            Family::LdAN8r => {
                let address = map::REGS_START + self.read8_after_opcode(bus) as u16;
                let v = bus.read(address);
                self.regs.set(Reg::A, v);
            }
            Family::LdACr => {
                let address = map::REGS_START + self.regs.get(Reg::C) as u16;
                let v = bus.read(address);
                self.regs.set(Reg::A, v);
            }
            Family::LdAN16r => {
                let address = self.read16_after_opcode(bus);
                let v = bus.read(address);
                self.regs.set(Reg::A, v);
            }
            Family::LdABcr => {
                let v = bus.read(self.reg16(Reg16::Bc));
                self.regs.set(Reg::A, v);
            }
            Family::LdADer => {
                let v = bus.read(self.reg16(Reg16::De));
                self.regs.set(Reg::A, v);
            }
            Family::LdR8N8 => {
                let r = self.extract_reg(opcode, 3);
                let v = self.read8_after_opcode(bus);
                self.regs.set(r, v);
            }
            Family::LdR16SpN16 => {
                let r = extract_reg16(opcode);
                let v = self.read16_after_opcode(bus);
                self.set_reg16_sp(r, v);
            }
            Family::PopR16 => {
                let r = extract_reg16(opcode);
                let v = self.pop16(bus);
                self.set_reg16(r, v);
            }

            // Stores.
            Family::LdHlrR8 => {
                let r = self.extract_reg(opcode, 0);
                self.write8_at_hl(bus, self.regs.get(r));
            }
            Family::LdHlruA => {
                self.write8_at_hl(bus, self.regs.get(Reg::A));
                let hl = self
                    .reg16(Reg16::Hl)
                    .wrapping_add_signed(hl_increment(opcode));
                self.set_reg16(Reg16::Hl, hl);
            }
            Family::LdN8rA => {
                let address = map::REGS_START + self.read8_after_opcode(bus) as u16;
                bus.write(address, self.regs.get(Reg::A));
            }
            Family::LdCrA => {
                let address = map::REGS_START + self.regs.get(Reg::C) as u16;
                bus.write(address, self.regs.get(Reg::A));
            }
            Family::LdN16rA => {
                let address = self.read16_after_opcode(bus);
                bus.write(address, self.regs.get(Reg::A));
            }
            Family::LdBcrA => {
                bus.write(self.reg16(Reg16::Bc), self.regs.get(Reg::A));
            }
            Family::LdDerA => {
                bus.write(self.reg16(Reg16::De), self.regs.get(Reg::A));
            }
            Family::LdHlrN8 => {
                let v = self.read8_after_opcode(bus);
                self.write8_at_hl(bus, v);
            }
            Family::LdN16rSp => {
                let address = self.read16_after_opcode(bus);
                self.write16(bus, address, self.sp);
            }
            Family::PushR16 => {
                let r = extract_reg16(opcode);
                self.push16(bus, self.reg16(r));
            }

            // Moves.
            Family::LdR8R8 => {
                let r = self.extract_reg(opcode, 3);
                let s = self.extract_reg(opcode, 0);
                if r != s {
                    self.regs.set(r, self.regs.get(s));
                }
            }
            Family::LdSpHl => {
                self.sp = self.reg16(Reg16::Hl);
            }

            // Additions.
            Family::AddAR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::add(
                    self.regs.get(Reg::A),
                    self.regs.get(r),
                    self.opcode_carry(opcode),
                );
                self.set_reg_flags(Reg::A, vf);
            }
            Family::AddAN8 => {
                let n = self.read8_after_opcode(bus);
                let vf = alu::add(self.regs.get(Reg::A), n, self.opcode_carry(opcode));
                self.set_reg_flags(Reg::A, vf);
            }
            Family::AddAHlr => {
                let v = self.read8_at_hl(bus);
                let vf = alu::add(self.regs.get(Reg::A), v, self.opcode_carry(opcode));
                self.set_reg_flags(Reg::A, vf);
            }
            Family::IncR8 => {
                let r = self.extract_reg(opcode, 3);
                let vf = alu::add(self.regs.get(r), 1, false);
                self.set_reg_from_alu(r, vf);
                self.combine_alu_flags(vf, FlagSrc::Alu, FlagSrc::V0, FlagSrc::Alu, FlagSrc::Cpu);
            }
            Family::IncHlr => {
                let vf = alu::add(self.read8_at_hl(bus), 1, false);
                self.write8_at_hl(bus, alu::unpack_value8(vf));
                self.combine_alu_flags(vf, FlagSrc::Alu, FlagSrc::V0, FlagSrc::Alu, FlagSrc::Cpu);
            }
            Family::IncR16Sp => {
                let r = extract_reg16(opcode);
                let vf = alu::add16_h(self.reg16_sp(r), 1);
                self.set_reg16_sp(r, alu::unpack_value(vf));
            }
            Family::AddHlR16Sp => {
                let r = extract_reg16(opcode);
                let vf = alu::add16_h(self.reg16(Reg16::Hl), self.reg16_sp(r));
                self.set_reg16(Reg16::Hl, alu::unpack_value(vf));
                self.combine_alu_flags(vf, FlagSrc::Cpu, FlagSrc::V0, FlagSrc::Alu, FlagSrc::Alu);
            }
            Family::LdHlSpS8 => {
                let e = bits::sign_extend8(self.read8_after_opcode(bus)) as u16;
                let vf = alu::add16_l(self.sp, e);
                self.combine_alu_flags(vf, FlagSrc::V0, FlagSrc::V0, FlagSrc::Alu, FlagSrc::Alu);
                if bits::test(opcode.encoding as u32, 4) {
                    self.set_reg16(Reg16::Hl, alu::unpack_value(vf));
                } else {
                    self.sp = alu::unpack_value(vf);
                }
            }

            // Subtractions and comparisons.
            Family::SubAR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::sub(
                    self.regs.get(Reg::A),
                    self.regs.get(r),
                    self.opcode_carry(opcode),
                );
                self.set_reg_flags(Reg::A, vf);
            }
            Family::SubAN8 => {
                let n = self.read8_after_opcode(bus);
                let vf = alu::sub(self.regs.get(Reg::A), n, self.opcode_carry(opcode));
                self.set_reg_flags(Reg::A, vf);
            }
            Family::SubAHlr => {
                let v = self.read8_at_hl(bus);
                let vf = alu::sub(self.regs.get(Reg::A), v, self.opcode_carry(opcode));
                self.set_reg_flags(Reg::A, vf);
            }
            Family::DecR8 => {
                let r = self.extract_reg(opcode, 3);
                let vf = alu::sub(self.regs.get(r), 1, false);
                self.set_reg_from_alu(r, vf);
                self.combine_alu_flags(vf, FlagSrc::Alu, FlagSrc::V1, FlagSrc::Alu, FlagSrc::Cpu);
            }
            Family::DecHlr => {
                let vf = alu::sub(self.read8_at_hl(bus), 1, false);
                self.write8_at_hl(bus, alu::unpack_value8(vf));
                self.combine_alu_flags(vf, FlagSrc::Alu, FlagSrc::V1, FlagSrc::Alu, FlagSrc::Cpu);
            }
            Family::CpAR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::sub(self.regs.get(Reg::A), self.regs.get(r), false);
                self.set_flags(vf);
            }
            Family::CpAN8 => {
                let n = self.read8_after_opcode(bus);
                let vf = alu::sub(self.regs.get(Reg::A), n, false);
                self.set_flags(vf);
            }
            Family::CpAHlr => {
                let v = self.read8_at_hl(bus);
                let vf = alu::sub(self.regs.get(Reg::A), v, false);
                self.set_flags(vf);
            }
            Family::DecR16Sp => {
                let r = extract_reg16(opcode);
                let v = self.reg16_sp(r).wrapping_sub(1);
                self.set_reg16_sp(r, v);
            }

            // Boolean operations.
            Family::AndAN8 => {
                let n = self.read8_after_opcode(bus);
                let vf = alu::and(self.regs.get(Reg::A), n);
                self.set_reg_flags(Reg::A, vf);
            }
            Family::AndAR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::and(self.regs.get(Reg::A), self.regs.get(r));
                self.set_reg_flags(Reg::A, vf);
            }
            Family::AndAHlr => {
                let v = self.read8_at_hl(bus);
                let vf = alu::and(self.regs.get(Reg::A), v);
                self.set_reg_flags(Reg::A, vf);
            }
            Family::OrAR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::or(self.regs.get(Reg::A), self.regs.get(r));
                self.set_reg_flags(Reg::A, vf);
            }
            Family::OrAN8 => {
                let n = self.read8_after_opcode(bus);
                let vf = alu::or(self.regs.get(Reg::A), n);
                self.set_reg_flags(Reg::A, vf);
            }
            Family::OrAHlr => {
                let v = self.read8_at_hl(bus);
                let vf = alu::or(self.regs.get(Reg::A), v);
                self.set_reg_flags(Reg::A, vf);
            }
            Family::XorAR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::xor(self.regs.get(Reg::A), self.regs.get(r));
                self.set_reg_flags(Reg::A, vf);
            }
            Family::XorAN8 => {
                let n = self.read8_after_opcode(bus);
                let vf = alu::xor(self.regs.get(Reg::A), n);
                self.set_reg_flags(Reg::A, vf);
            }
            Family::XorAHlr => {
                let v = self.read8_at_hl(bus);
                let vf = alu::xor(self.regs.get(Reg::A), v);
                self.set_reg_flags(Reg::A, vf);
            }
            Family::Cpl => {
                let v = bits::complement8(self.regs.get(Reg::A));
                self.regs.set(Reg::A, v);
                self.combine_alu_flags(0, FlagSrc::Cpu, FlagSrc::V1, FlagSrc::V1, FlagSrc::Cpu);
            }

            // Rotations and shifts.
            Family::Rotca => {
                let vf = alu::rotate(rot_dir(opcode), self.regs.get(Reg::A));
                self.set_reg_from_alu(Reg::A, vf);
                self.combine_alu_flags(vf, FlagSrc::V0, FlagSrc::V0, FlagSrc::V0, FlagSrc::Alu);
            }
            Family::Rota => {
                let vf = alu::rotate_through_carry(
                    rot_dir(opcode),
                    self.regs.get(Reg::A),
                    self.flag(Flags::C),
                );
                self.set_reg_from_alu(Reg::A, vf);
                self.combine_alu_flags(vf, FlagSrc::V0, FlagSrc::V0, FlagSrc::V0, FlagSrc::Alu);
            }
            Family::RotcR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::rotate(rot_dir(opcode), self.regs.get(r));
                self.set_reg_flags(r, vf);
            }
            Family::RotR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf =
                    alu::rotate_through_carry(rot_dir(opcode), self.regs.get(r), self.flag(Flags::C));
                self.set_reg_flags(r, vf);
            }
            Family::RotcHlr => {
                let vf = alu::rotate(rot_dir(opcode), self.read8_at_hl(bus));
                self.write8_at_hl_and_set_flags(bus, vf);
            }
            Family::RotHlr => {
                let vf = alu::rotate_through_carry(
                    rot_dir(opcode),
                    self.read8_at_hl(bus),
                    self.flag(Flags::C),
                );
                self.write8_at_hl_and_set_flags(bus, vf);
            }
            Family::SwapR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::swap(self.regs.get(r));
                self.set_reg_flags(r, vf);
            }
            Family::SwapHlr => {
                let vf = alu::swap(self.read8_at_hl(bus));
                self.write8_at_hl_and_set_flags(bus, vf);
            }
            Family::SlaR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::shift_left(self.regs.get(r));
                self.set_reg_flags(r, vf);
            }
            Family::SraR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::shift_right_a(self.regs.get(r));
                self.set_reg_flags(r, vf);
            }
            Family::SrlR8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::shift_right_l(self.regs.get(r));
                self.set_reg_flags(r, vf);
            }
            Family::SlaHlr => {
                let vf = alu::shift_left(self.read8_at_hl(bus));
                self.write8_at_hl_and_set_flags(bus, vf);
            }
            Family::SraHlr => {
                let vf = alu::shift_right_a(self.read8_at_hl(bus));
                self.write8_at_hl_and_set_flags(bus, vf);
            }
            Family::SrlHlr => {
                let vf = alu::shift_right_l(self.read8_at_hl(bus));
                self.write8_at_hl_and_set_flags(bus, vf);
            }

            // Single-bit operations.
            Family::BitU3R8 => {
                let r = self.extract_reg(opcode, 0);
                let vf = alu::test_bit(self.regs.get(r), extract_n3(opcode));
                self.combine_alu_flags(vf, FlagSrc::Alu, FlagSrc::V0, FlagSrc::V1, FlagSrc::Cpu);
            }
            Family::BitU3Hlr => {
                let vf = alu::test_bit(self.read8_at_hl(bus), extract_n3(opcode));
                self.combine_alu_flags(vf, FlagSrc::Alu, FlagSrc::V0, FlagSrc::V1, FlagSrc::Cpu);
            }
            Family::ChgU3R8 => {
                let r = self.extract_reg(opcode, 0);
                let v = bits::set(
                    self.regs.get(r) as u32,
                    extract_n3(opcode),
                    chg_sets_bit(opcode),
                ) as u8;
                self.regs.set(r, v);
            }
            Family::ChgU3Hlr => {
                let v = bits::set(
                    self.read8_at_hl(bus) as u32,
                    extract_n3(opcode),
                    chg_sets_bit(opcode),
                ) as u8;
                self.write8_at_hl(bus, v);
            }

            // Accumulator adjustments.
            Family::Daa => {
                let vf = alu::bcd_adjust(
                    self.regs.get(Reg::A),
                    self.flag(Flags::N),
                    self.flag(Flags::H),
                    self.flag(Flags::C),
                );
                self.set_reg_from_alu(Reg::A, vf);
                self.combine_alu_flags(vf, FlagSrc::Alu, FlagSrc::Cpu, FlagSrc::V0, FlagSrc::Alu);
            }
            Family::Sccf => {
                // SCF sets C outright; CCF complements it (the carry
                // selector reads as false exactly when C must become 1).
                let c = if self.opcode_carry(opcode) {
                    FlagSrc::V0
                } else {
                    FlagSrc::V1
                };
                self.combine_alu_flags(0, FlagSrc::Cpu, FlagSrc::V0, FlagSrc::V0, c);
            }

            // Jumps.
            Family::JpHl => {
                next_pc = self.reg16(Reg16::Hl);
            }
            Family::JpN16 => {
                next_pc = self.read16_after_opcode(bus);
            }
            Family::JpCcN16 => {
                if self.condition(opcode) {
                    next_pc = self.read16_after_opcode(bus);
                    self.next_non_idle_cycle += opcode.additional_cycles;
                }
            }
            Family::JrE8 => {
                let e = bits::sign_extend8(self.read8_after_opcode(bus));
                next_pc = next_pc.wrapping_add_signed(e as i16);
            }
            Family::JrCcE8 => {
                if self.condition(opcode) {
                    let e = bits::sign_extend8(self.read8_after_opcode(bus));
                    next_pc = next_pc.wrapping_add_signed(e as i16);
                    self.next_non_idle_cycle += opcode.additional_cycles;
                }
            }

            // Calls and returns.
            Family::CallN16 => {
                self.push16(bus, next_pc);
                next_pc = self.read16_after_opcode(bus);
            }
            Family::CallCcN16 => {
                if self.condition(opcode) {
                    self.push16(bus, next_pc);
                    next_pc = self.read16_after_opcode(bus);
                    self.next_non_idle_cycle += opcode.additional_cycles;
                }
            }
            Family::RstU3 => {
                self.push16(bus, next_pc);
                next_pc = map::RST_VECTORS[extract_n3(opcode) as usize];
            }
            Family::Ret => {
                next_pc = self.pop16(bus);
            }
            Family::RetCc => {
                if self.condition(opcode) {
                    next_pc = self.pop16(bus);
                    self.next_non_idle_cycle += opcode.additional_cycles;
                }
            }

            // Interrupt control.
            Family::Edi => {
                self.ime = bits::test(opcode.encoding as u32, 3);
            }
            Family::Reti => {
                self.ime = true;
                next_pc = self.pop16(bus);
            }

            // Misc control.
            Family::Halt => {
                self.next_non_idle_cycle = u64::MAX;
            }
            Family::Stop => panic!("STOP instruction is not implemented"),
        }

        self.pc = next_pc;
        self.next_non_idle_cycle = self.next_non_idle_cycle.saturating_add(opcode.cycles);
    }

    // Bus access helpers.

    fn read8_at_hl(&self, bus: &Bus) -> u8 {
        bus.read(self.reg16(Reg16::Hl))
    }

    fn read8_after_opcode(&self, bus: &Bus) -> u8 {
        bus.read(self.pc.wrapping_add(1))
    }

    fn read16(&self, bus: &Bus, address: u16) -> u16 {
        bits::make16(bus.read(address.wrapping_add(1)), bus.read(address))
    }

    fn read16_after_opcode(&self, bus: &Bus) -> u16 {
        self.read16(bus, self.pc.wrapping_add(1))
    }

    fn write16(&self, bus: &Bus, address: u16, value: u16) {
        bus.write(address, bits::lsb(value));
        bus.write(address.wrapping_add(1), bits::msb(value));
    }

    fn write8_at_hl(&self, bus: &Bus, value: u8) {
        bus.write(self.reg16(Reg16::Hl), value);
    }

    fn push16(&mut self, bus: &Bus, value: u16) {
        self.sp = self.sp.wrapping_sub(2);
        self.write16(bus, self.sp, value);
    }

    fn pop16(&mut self, bus: &Bus) -> u16 {
        let value = self.read16(bus, self.sp);
        self.sp = self.sp.wrapping_add(2);
        value
    }

    // Register helpers.

    fn extract_reg(&self, opcode: Opcode, start_bit: u32) -> Reg {
        Reg::from_code(bits::extract(opcode.encoding as u32, start_bit, 3))
    }

    fn reg16(&self, r: Reg16) -> u16 {
        let (high, low) = r.parts();
        bits::make16(self.regs.get(high), self.regs.get(low))
    }

    /// Like [`Cpu::reg16`], except that code AF designates SP.
    fn reg16_sp(&self, r: Reg16) -> u16 {
        if r == Reg16::Af {
            self.sp
        } else {
            self.reg16(r)
        }
    }

    fn set_reg16(&mut self, r: Reg16, value: u16) {
        let (high, low) = r.parts();
        let mut low_byte = bits::lsb(value);
        if r == Reg16::Af {
            // The low nibble of F does not exist in hardware.
            low_byte &= 0xF0;
        }
        self.regs.set(high, bits::msb(value));
        self.regs.set(low, low_byte);
    }

    fn set_reg16_sp(&mut self, r: Reg16, value: u16) {
        if r == Reg16::Af {
            self.sp = value;
        } else {
            self.set_reg16(r, value);
        }
    }

    // Flag helpers.

    fn flag(&self, flag: Flags) -> bool {
        Flags::from_bits_truncate(self.regs.get(Reg::F)).contains(flag)
    }

    fn set_reg_from_alu(&mut self, r: Reg, vf: ValueFlags) {
        self.regs.set(r, alu::unpack_value8(vf));
    }

    fn set_flags(&mut self, vf: ValueFlags) {
        self.regs.set(Reg::F, alu::unpack_flags(vf).bits());
    }

    fn set_reg_flags(&mut self, r: Reg, vf: ValueFlags) {
        self.set_reg_from_alu(r, vf);
        self.set_flags(vf);
    }

    fn write8_at_hl_and_set_flags(&mut self, bus: &Bus, vf: ValueFlags) {
        self.write8_at_hl(bus, alu::unpack_value8(vf));
        self.set_flags(vf);
    }

    fn flag_from_src(&self, src: FlagSrc, vf: ValueFlags, flag: Flags) -> bool {
        match src {
            FlagSrc::V0 => false,
            FlagSrc::V1 => true,
            FlagSrc::Alu => alu::unpack_flags(vf).contains(flag),
            FlagSrc::Cpu => self.flag(flag),
        }
    }

    /// Rebuilds F by taking each flag from the requested source.
    fn combine_alu_flags(
        &mut self,
        vf: ValueFlags,
        z: FlagSrc,
        n: FlagSrc,
        h: FlagSrc,
        c: FlagSrc,
    ) {
        let mask = alu::mask_znhc(
            self.flag_from_src(z, vf, Flags::Z),
            self.flag_from_src(n, vf, Flags::N),
            self.flag_from_src(h, vf, Flags::H),
            self.flag_from_src(c, vf, Flags::C),
        );
        self.regs.set(Reg::F, mask);
    }

    /// True when the opcode's bit 3 selects the with-carry form and C is
    /// currently set (ADC/SBC; also drives SCF/CCF).
    fn opcode_carry(&self, opcode: Opcode) -> bool {
        bits::test(opcode.encoding as u32, 3) && self.flag(Flags::C)
    }

    /// Evaluates the condition field (bits 4..3) against the flags.
    fn condition(&self, opcode: Opcode) -> bool {
        match bits::extract(opcode.encoding as u32, 3, 2) {
            0 => !self.flag(Flags::Z),
            1 => self.flag(Flags::Z),
            2 => !self.flag(Flags::C),
            _ => self.flag(Flags::C),
        }
    }
}

impl Clocked for Cpu {
    fn cycle(&mut self, cycle: u64, bus: &Bus) {
        // A halted processor wakes as soon as any enabled interrupt
        // becomes pending, whether or not IME allows dispatching it.
        if self.next_non_idle_cycle == u64::MAX && !self.pending_interrupts().is_empty() {
            self.next_non_idle_cycle = cycle;
        }
        if self.next_non_idle_cycle == cycle {
            self.really_cycle(bus);
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

fn extract_reg16(opcode: Opcode) -> Reg16 {
    Reg16::from_code(bits::extract(opcode.encoding as u32, 4, 2))
}

/// +1 or -1 depending on the increment/decrement bit of the HL-update
/// load/store encodings.
fn hl_increment(opcode: Opcode) -> i16 {
    if bits::test(opcode.encoding as u32, 4) {
        -1
    } else {
        1
    }
}

fn extract_n3(opcode: Opcode) -> u32 {
    bits::extract(opcode.encoding as u32, 3, 3)
}

fn rot_dir(opcode: Opcode) -> RotDir {
    if bits::test(opcode.encoding as u32, 3) {
        RotDir::Right
    } else {
        RotDir::Left
    }
}

/// SET writes 1, RES writes 0; bit 6 of the encoding tells them apart.
fn chg_sets_bit(opcode: Opcode) -> bool {
    bits::test(opcode.encoding as u32, 6)
}
