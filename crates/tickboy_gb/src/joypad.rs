//! The joypad matrix behind the P1 register.
//!
//! Internally the key state is active-high; P1 reads back complemented,
//! as the hardware's pull-ups do. The select bits choose which of the two
//! key lines is visible in the low nibble.

use tickboy_common::Key;

use crate::bits;
use crate::bus::Component;
use crate::cpu::Interrupts;
use crate::memory::map;

const KEYS_PER_LINE: usize = 4;
const BIT_SELECT_LINE0: u32 = 4;
const BIT_SELECT_LINE1: u32 = 5;

pub struct Joypad {
    select: [bool; 2],
    lines: [u8; 2],
    pending: Interrupts,
}

impl Joypad {
    pub fn new() -> Joypad {
        Joypad {
            select: [false; 2],
            lines: [0; 2],
            pending: Interrupts::empty(),
        }
    }

    pub fn take_interrupts(&mut self) -> Interrupts {
        std::mem::replace(&mut self.pending, Interrupts::empty())
    }

    pub fn key_pressed(&mut self, key: Key) {
        let (line, bit) = key_position(key);
        let before = self.p1();
        self.lines[line] = bits::set(self.lines[line] as u32, bit, true) as u8;
        self.request_interrupt_on_press(before, self.p1());
    }

    pub fn key_released(&mut self, key: Key) {
        let (line, bit) = key_position(key);
        self.lines[line] = bits::set(self.lines[line] as u32, bit, false) as u8;
    }

    /// The active-high view of P1: select bits plus the selected lines.
    fn p1(&self) -> u8 {
        let mut p1 = 0u32;
        if self.select[0] {
            p1 = bits::set(p1, BIT_SELECT_LINE0, true) | self.lines[0] as u32;
        }
        if self.select[1] {
            p1 = bits::set(p1, BIT_SELECT_LINE1, true) | self.lines[1] as u32;
        }
        p1 as u8
    }

    /// A key bit that becomes active while selected raises the interrupt.
    fn request_interrupt_on_press(&mut self, before: u8, after: u8) {
        let newly_active = (before ^ after) & bits::complement8(before) & 0xF;
        if newly_active != 0 {
            self.pending |= Interrupts::JOYPAD;
        }
    }
}

impl Component for Joypad {
    fn read(&self, address: u16) -> Option<u8> {
        (address == map::REG_P1).then(|| bits::complement8(self.p1()))
    }

    fn write(&mut self, address: u16, value: u8) {
        if address == map::REG_P1 {
            let before = self.p1();
            let selects = bits::complement8(value);
            self.select[0] = bits::test(selects as u32, BIT_SELECT_LINE0);
            self.select[1] = bits::test(selects as u32, BIT_SELECT_LINE1);
            self.request_interrupt_on_press(before, self.p1());
        }
    }
}

impl Default for Joypad {
    fn default() -> Self {
        Self::new()
    }
}

fn key_position(key: Key) -> (usize, u32) {
    let ordinal = key as usize;
    (ordinal / KEYS_PER_LINE, (ordinal % KEYS_PER_LINE) as u32)
}
