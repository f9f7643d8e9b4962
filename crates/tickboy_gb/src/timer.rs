//! The programmable timer.
//!
//! A free-running 16-bit counter advances by 4 every machine cycle; DIV
//! exposes its high byte. TAC gates one counter bit (9, 3, 5 or 7) and
//! TIMA increments on each falling edge of that gated bit — which is why
//! register writes that change the counter or the gate are sampled before
//! and after, exactly like a clock tick.

use crate::bits;
use crate::bus::{Bus, Clocked, Component};
use crate::cpu::Interrupts;
use crate::memory::map;

/// Counter increment per machine cycle.
const COUNTER_STEP: u16 = 4;

pub struct Timer {
    counter: u16,
    tima: u8,
    tma: u8,
    tac: u8,
    pending: Interrupts,
}

impl Timer {
    pub fn new() -> Timer {
        Timer {
            counter: 0,
            tima: 0,
            tma: 0,
            tac: 0,
            pending: Interrupts::empty(),
        }
    }

    /// Hands over the interrupt requests raised since the last call.
    pub fn take_interrupts(&mut self) -> Interrupts {
        std::mem::replace(&mut self.pending, Interrupts::empty())
    }

    /// The gated timer input: the selected counter bit, masked by the
    /// enable bit of TAC.
    fn gated_state(&self) -> bool {
        let bit = match bits::extract(self.tac as u32, 0, 2) {
            0 => 9,
            1 => 3,
            2 => 5,
            _ => 7,
        };
        bits::test(self.tac as u32, 2) && bits::test(self.counter as u32, bit)
    }

    /// Advances TIMA if the gated input fell since `before` was sampled.
    fn increment_if_fell(&mut self, before: bool) {
        if before && !self.gated_state() {
            if self.tima == 0xFF {
                self.pending |= Interrupts::TIMER;
                self.tima = self.tma;
            } else {
                self.tima += 1;
            }
        }
    }
}

impl Clocked for Timer {
    fn cycle(&mut self, _cycle: u64, _bus: &Bus) {
        let before = self.gated_state();
        self.counter = self.counter.wrapping_add(COUNTER_STEP);
        self.increment_if_fell(before);
    }
}

impl Component for Timer {
    fn read(&self, address: u16) -> Option<u8> {
        match address {
            map::REG_DIV => Some(bits::msb(self.counter)),
            map::REG_TIMA => Some(self.tima),
            map::REG_TMA => Some(self.tma),
            map::REG_TAC => Some(self.tac),
            _ => None,
        }
    }

    fn write(&mut self, address: u16, value: u8) {
        let before = self.gated_state();
        match address {
            map::REG_DIV => {
                self.counter = 0;
                self.increment_if_fell(before);
            }
            map::REG_TIMA => self.tima = value,
            map::REG_TMA => self.tma = value,
            map::REG_TAC => {
                self.tac = value;
                self.increment_if_fell(before);
            }
            _ => {}
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
