//! The machine itself: owns every component, wires them to one bus and
//! drives the cooperative cycle scheduler.

use std::cell::RefCell;
use std::rc::Rc;

use tickboy_common::Key;

use crate::bus::{Bus, Clocked};
use crate::cartridge::Cartridge;
use crate::cpu::Cpu;
use crate::joypad::Joypad;
use crate::lcd::image::LcdImage;
use crate::lcd::LcdController;
use crate::memory::{map, BootRomController, Ram, RamController, Rom};
use crate::timer::Timer;

/// The machine's nominal clock rate, in machine cycles per second.
pub const CYCLES_PER_SECOND: u64 = 1 << 20;

pub struct GameBoy {
    bus: Bus,
    cpu: Cpu,
    timer: Rc<RefCell<Timer>>,
    lcd: Rc<RefCell<LcdController>>,
    joypad: Rc<RefCell<Joypad>>,
    cycles: u64,
}

impl GameBoy {
    /// Builds a machine that starts executing the cartridge directly,
    /// with no boot ROM overlay.
    pub fn new(cartridge: Cartridge) -> GameBoy {
        Self::build(cartridge, None)
    }

    /// Builds a machine with a boot ROM overlaid over low addresses until
    /// the program disables it.
    pub fn with_boot_rom(cartridge: Cartridge, boot_rom: Vec<u8>) -> GameBoy {
        Self::build(cartridge, Some(boot_rom))
    }

    fn build(cartridge: Cartridge, boot_rom: Option<Vec<u8>>) -> GameBoy {
        let mut bus = Bus::new();
        let cpu = Cpu::new();
        let timer = Rc::new(RefCell::new(Timer::new()));
        let lcd = Rc::new(RefCell::new(LcdController::new()));
        let joypad = Rc::new(RefCell::new(Joypad::new()));

        let work_ram = Rc::new(RefCell::new(Ram::new(map::WORK_RAM_SIZE)));
        let high_ram = Rc::new(RefCell::new(Ram::new(map::HIGH_RAM_SIZE)));

        bus.attach(Rc::new(RefCell::new(RamController::new(
            work_ram.clone(),
            map::WORK_RAM_START,
        ))));
        bus.attach(timer.clone());
        bus.attach(Rc::new(RefCell::new(RamController::bounded(
            work_ram,
            map::ECHO_RAM_START,
            map::ECHO_RAM_END,
        ))));
        cpu.attach_to(&mut bus);
        bus.attach(Rc::new(RefCell::new(RamController::bounded(
            high_ram,
            map::HIGH_RAM_START,
            map::HIGH_RAM_END,
        ))));
        match boot_rom {
            Some(image) => bus.attach(Rc::new(RefCell::new(BootRomController::new(
                cartridge,
                Rom::new(image),
            )))),
            None => bus.attach(Rc::new(RefCell::new(cartridge))),
        }
        bus.attach(Rc::new(RefCell::new(RamController::new(
            lcd.borrow().video_ram(),
            map::VIDEO_RAM_START,
        ))));
        bus.attach(Rc::new(RefCell::new(RamController::new(
            lcd.borrow().object_attribute_ram(),
            map::OAM_START,
        ))));
        bus.attach(lcd.clone());
        bus.attach(joypad.clone());

        log::debug!("machine assembled");
        GameBoy {
            bus,
            cpu,
            timer,
            lcd,
            joypad,
            cycles: 0,
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// A copy of the last fully drawn frame.
    pub fn current_frame(&self) -> LcdImage {
        self.lcd.borrow().current_image().clone()
    }

    pub fn key_pressed(&mut self, key: Key) {
        self.joypad.borrow_mut().key_pressed(key);
    }

    pub fn key_released(&mut self, key: Key) {
        self.joypad.borrow_mut().key_released(key);
    }

    /// Number of cycles simulated so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Advances the simulation up to (excluding) `cycle`.
    ///
    /// Each tick steps the timer, then the display controller, then routes
    /// their interrupt requests into the processor before its own step, so
    /// an interrupt raised in cycle N is visible to the processor within
    /// cycle N. Asking for an already-simulated cycle is a caller bug.
    pub fn run_until(&mut self, cycle: u64) {
        assert!(
            self.cycles <= cycle,
            "cycle {cycle} has already been simulated (now at {})",
            self.cycles
        );
        while self.cycles < cycle {
            let c = self.cycles;
            self.timer.borrow_mut().cycle(c, &self.bus);
            self.lcd.borrow_mut().cycle(c, &self.bus);
            let pending = self.timer.borrow_mut().take_interrupts()
                | self.lcd.borrow_mut().take_interrupts()
                | self.joypad.borrow_mut().take_interrupts();
            if !pending.is_empty() {
                self.cpu.request_interrupts(pending);
            }
            self.cpu.cycle(c, &self.bus);
            self.cycles += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::Interrupts;

    /// A flat 32 KiB cartridge with `program` at address zero and, when
    /// given, `handler` at the timer interrupt vector.
    fn cartridge_with(program: &[u8], handler: &[u8]) -> Cartridge {
        let mut image = vec![0u8; 0x8000];
        image[..program.len()].copy_from_slice(program);
        image[0x50..0x50 + handler.len()].copy_from_slice(handler);
        Cartridge::from_bytes(image).unwrap()
    }

    #[test]
    fn run_until_advances_and_reports_the_clock() {
        let mut gb = GameBoy::new(cartridge_with(&[0x18, 0xFE], &[])); // JR -2
        assert_eq!(gb.cycles(), 0);
        gb.run_until(100);
        assert_eq!(gb.cycles(), 100);
        gb.run_until(100);
        assert_eq!(gb.cycles(), 100);
    }

    #[test]
    #[should_panic(expected = "already been simulated")]
    fn run_until_rejects_going_backwards() {
        let mut gb = GameBoy::new(cartridge_with(&[0x18, 0xFE], &[]));
        gb.run_until(100);
        gb.run_until(50);
    }

    #[test]
    fn work_ram_is_echoed() {
        let mut gb = GameBoy::new(cartridge_with(&[0x18, 0xFE], &[]));
        gb.run_until(10);
        gb.bus().write(0xC123, 0x5A);
        assert_eq!(gb.bus().read(0xE123), 0x5A);
    }

    #[test]
    fn cartridge_rom_answers_reads_and_ignores_writes() {
        let gb = GameBoy::new(cartridge_with(&[0x18, 0xFE], &[]));
        assert_eq!(gb.bus().read(0x0000), 0x18);
        gb.bus().write(0x0000, 0x00);
        assert_eq!(gb.bus().read(0x0000), 0x18);
    }

    #[test]
    fn unmapped_addresses_read_0xff() {
        let gb = GameBoy::new(cartridge_with(&[0x18, 0xFE], &[]));
        // Cartridge RAM area has no component behind it here.
        assert_eq!(gb.bus().read(0xA123), 0xFF);
    }

    #[test]
    fn timer_interrupt_wakes_the_halted_processor_through_its_vector() {
        // Set up SP, enable the timer interrupt, start the timer at its
        // fastest rate with TIMA near overflow, then halt. The handler
        // bumps a counter in work RAM; the resumed main program drops a
        // marker next to it.
        let program = [
            0x31, 0xFE, 0xFF, // LD SP, 0xFFFE
            0x3E, 0x04, // LD A, 0x04
            0xEA, 0xFF, 0xFF, // LD (0xFFFF), A
            0x3E, 0x05, // LD A, 0x05
            0xE0, 0x07, // LDH (0x07), A
            0x3E, 0xF0, // LD A, 0xF0
            0xE0, 0x05, // LDH (0x05), A
            0xFB, // EI
            0x76, // HALT
            0x3E, 0x42, // LD A, 0x42
            0xEA, 0x00, 0xC0, // LD (0xC000), A
            0x18, 0xFE, // JR -2
        ];
        let handler = [
            0xFA, 0x01, 0xC0, // LD A, (0xC001)
            0x3C, // INC A
            0xEA, 0x01, 0xC0, // LD (0xC001), A
            0xD9, // RETI
        ];
        let mut gb = GameBoy::new(cartridge_with(&program, &handler));
        // Long enough for the first overflow (~80 cycles in) and the
        // handler, short of the reloaded counter's next overflow.
        gb.run_until(500);

        assert_eq!(gb.bus().read(0xC000), 0x42, "main program resumed");
        assert_eq!(gb.bus().read(0xC001), 1, "handler ran exactly once");
    }

    #[test]
    fn a_frame_of_cycles_raises_vblank_in_if() {
        let mut gb = GameBoy::new(cartridge_with(&[0x18, 0xFE], &[]));
        gb.bus().write(0xFF40, 0x80);
        gb.run_until(crate::lcd::CYCLES_PER_FRAME);
        assert_ne!(
            gb.bus().read(map::REG_IF) & Interrupts::VBLANK.bits(),
            0,
            "vblank pending after one frame"
        );
    }

    #[test]
    fn boot_rom_overlay_is_dismissed_by_the_disable_write() {
        let mut boot = vec![0u8; map::BOOT_ROM_SIZE];
        // LD A, 1 ; LDH (0x50), A ; then fall through into cartridge NOPs.
        boot[..4].copy_from_slice(&[0x3E, 0x01, 0xE0, 0x50]);
        let mut gb = GameBoy::with_boot_rom(cartridge_with(&[0x18, 0xFE], &[]), boot);

        assert_eq!(gb.bus().read(0x0000), 0x3E, "boot ROM visible at reset");
        gb.run_until(10);
        assert_eq!(gb.bus().read(0x0000), 0x18, "cartridge visible after disable");
    }
}
