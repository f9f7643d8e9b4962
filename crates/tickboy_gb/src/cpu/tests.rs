use std::cell::RefCell;
use std::rc::Rc;

use super::*;
use crate::memory::{Ram, RamController};

/// A CPU wired to 64 KiB of flat RAM preloaded with `program` at address
/// zero. The CPU's interrupt port is attached ahead of the RAM so IE/IF
/// reads resolve to the real registers.
fn machine(program: &[u8]) -> (Cpu, Bus) {
    let mut bus = Bus::new();
    let cpu = Cpu::new();
    cpu.attach_to(&mut bus);
    let ram = Rc::new(RefCell::new(Ram::new(0x1_0000)));
    bus.attach(Rc::new(RefCell::new(RamController::new(ram, 0))));
    for (i, byte) in program.iter().enumerate() {
        bus.write(i as u16, *byte);
    }
    (cpu, bus)
}

/// Drives the CPU until PC reaches `target`, returning the number of
/// cycles consumed. Panics when `max_cycles` pass without getting there.
fn run_until_pc(cpu: &mut Cpu, bus: &Bus, target: u16, max_cycles: u64) -> u64 {
    for cycle in 0..max_cycles {
        cpu.cycle(cycle, bus);
        if cpu.pc() == target {
            return cycle + 1;
        }
    }
    panic!("PC never reached {target:#06X} in {max_cycles} cycles");
}

fn run_cycles(cpu: &mut Cpu, bus: &Bus, range: std::ops::Range<u64>) {
    for cycle in range {
        cpu.cycle(cycle, bus);
    }
}

#[test]
fn immediate_add_sets_the_half_carry() {
    // LD A, 0x0F ; ADD A, 0x01
    let (mut cpu, bus) = machine(&[0x3E, 0x0F, 0xC6, 0x01]);
    run_cycles(&mut cpu, &bus, 0..4);

    assert_eq!(cpu.regs.get(Reg::A), 0x10);
    assert_eq!(cpu.regs.get(Reg::F), Flags::H.bits());
    assert_eq!(cpu.pc(), 4);
}

#[test]
fn adc_consumes_the_incoming_carry() {
    // LD A, 0xFF ; ADD A, 0x01 (sets C) ; ADC A, 0x00
    let (mut cpu, bus) = machine(&[0x3E, 0xFF, 0xC6, 0x01, 0xCE, 0x00]);
    run_cycles(&mut cpu, &bus, 0..6);

    assert_eq!(cpu.regs.get(Reg::A), 0x01);
    assert!(!cpu.flag(Flags::C));
}

#[test]
fn conditional_jumps_cost_extra_only_when_taken() {
    // LD A, 2 ; loop: DEC A ; JR NZ, loop ; HALT
    let (mut cpu, bus) = machine(&[0x3E, 0x02, 0x3D, 0x20, 0xFD, 0x76]);
    // 2 (LD) + 1 (DEC) + 3 (JR taken) + 1 (DEC) puts the not-taken JR at
    // cycle 7, so PC lands past it on the eighth driven cycle.
    let cycles = run_until_pc(&mut cpu, &bus, 5, 100);
    assert_eq!(cycles, 8);
    assert_eq!(cpu.regs.get(Reg::A), 0);
    assert!(cpu.flag(Flags::Z));
}

#[test]
fn call_and_ret_round_trip_through_the_stack() {
    // LD SP, 0xFFFF ; CALL 0x0008 ; HALT ; NOP ; sub: LD A, 0x2A ; RET
    let (mut cpu, bus) = machine(&[
        0x31, 0xFF, 0xFF, 0xCD, 0x08, 0x00, 0x76, 0x00, 0x3E, 0x2A, 0xC9,
    ]);
    run_until_pc(&mut cpu, &bus, 6, 100);

    assert_eq!(cpu.regs.get(Reg::A), 0x2A);
    assert_eq!(cpu.sp(), 0xFFFF);
}

#[test]
fn pop_af_clears_the_low_nibble_of_f() {
    // LD SP, 0xFFFF ; LD BC, 0xABFF ; PUSH BC ; POP AF ; HALT
    let (mut cpu, bus) = machine(&[0x31, 0xFF, 0xFF, 0x01, 0xFF, 0xAB, 0xC5, 0xF1, 0x76]);
    run_until_pc(&mut cpu, &bus, 8, 100);

    assert_eq!(cpu.regs.get(Reg::A), 0xAB);
    assert_eq!(cpu.regs.get(Reg::F), 0xF0);
}

#[test]
fn add_hl_takes_flags_from_the_high_byte_stage() {
    // LD HL, 0x0FFF ; LD BC, 0x0001 ; ADD HL, BC ; HALT
    let (mut cpu, bus) = machine(&[0x21, 0xFF, 0x0F, 0x01, 0x01, 0x00, 0x09, 0x76]);
    run_until_pc(&mut cpu, &bus, 7, 100);

    assert_eq!(cpu.reg16(Reg16::Hl), 0x1000);
    assert_eq!(cpu.regs.get(Reg::F), Flags::H.bits());
}

#[test]
fn ld_hl_sp_takes_flags_from_the_low_byte_stage() {
    // LD SP, 0x00FF ; LD HL, SP+1 ; HALT
    let (mut cpu, bus) = machine(&[0x31, 0xFF, 0x00, 0xF8, 0x01, 0x76]);
    run_until_pc(&mut cpu, &bus, 5, 100);

    assert_eq!(cpu.reg16(Reg16::Hl), 0x0100);
    assert_eq!(cpu.regs.get(Reg::F), (Flags::H | Flags::C).bits());
}

#[test]
fn prefixed_opcodes_reach_the_second_table() {
    // LD A, 0x80 ; SWAP A ; BIT 0, A ; SET 0, A ; HALT
    let (mut cpu, bus) = machine(&[0x3E, 0x80, 0xCB, 0x37, 0xCB, 0x47, 0xCB, 0xC7, 0x76]);
    run_until_pc(&mut cpu, &bus, 8, 100);

    assert_eq!(cpu.regs.get(Reg::A), 0x09);
    // BIT left Z and H set; SET does not touch flags.
    assert_eq!(cpu.regs.get(Reg::F), (Flags::Z | Flags::H).bits());
}

#[test]
fn hl_loads_update_the_pointer_both_ways() {
    // LD HL, 0xC000 ; LD (HL+), A ; LD (HL-), A ; HALT
    let (mut cpu, bus) = machine(&[0x21, 0x00, 0xC0, 0x22, 0x32, 0x76]);
    run_until_pc(&mut cpu, &bus, 5, 100);
    assert_eq!(cpu.reg16(Reg16::Hl), 0xC000);
}

#[test]
fn lowest_indexed_pending_interrupt_wins() {
    let (mut cpu, bus) = machine(&[0x00; 0x100]);
    cpu.ime = true;
    bus.write(map::REG_IE, 0x1F);
    cpu.request_interrupts(Interrupts::TIMER | Interrupts::LCD_STAT);

    cpu.cycle(0, &bus);

    // LCD_STAT (bit 1) outranks TIMER (bit 2).
    assert_eq!(cpu.pc(), map::INTERRUPT_VECTORS[1]);
    assert!(!cpu.ime);
    assert_eq!(bus.read(map::REG_IF), Interrupts::TIMER.bits());

    // Dispatch consumes 5 cycles before the handler's first instruction.
    run_cycles(&mut cpu, &bus, 1..5);
    assert_eq!(cpu.pc(), map::INTERRUPT_VECTORS[1]);
    cpu.cycle(5, &bus);
    assert_eq!(cpu.pc(), map::INTERRUPT_VECTORS[1] + 1);
}

#[test]
fn interrupt_dispatch_pushes_the_interrupted_pc() {
    let (mut cpu, bus) = machine(&[0x31, 0xFF, 0xFF, 0x00, 0x00]); // LD SP,0xFFFF ; NOPs
    run_cycles(&mut cpu, &bus, 0..3);
    assert_eq!(cpu.pc(), 3);

    cpu.ime = true;
    bus.write(map::REG_IE, Interrupts::VBLANK.bits());
    cpu.request_interrupts(Interrupts::VBLANK);
    cpu.cycle(3, &bus);

    assert_eq!(cpu.pc(), map::INTERRUPT_VECTORS[0]);
    assert_eq!(cpu.sp(), 0xFFFD);
    assert_eq!(bus.read(0xFFFD), 3);
    assert_eq!(bus.read(0xFFFE), 0);
}

#[test]
fn halt_parks_until_an_enabled_interrupt_is_pending() {
    // HALT ; INC A
    let (mut cpu, bus) = machine(&[0x76, 0x3C]);
    run_cycles(&mut cpu, &bus, 0..20);
    assert_eq!(cpu.pc(), 1);
    assert_eq!(cpu.regs.get(Reg::A), 0);

    // IME stays off: the processor resumes without dispatching.
    bus.write(map::REG_IE, Interrupts::TIMER.bits());
    cpu.request_interrupts(Interrupts::TIMER);
    cpu.cycle(20, &bus);

    assert_eq!(cpu.regs.get(Reg::A), 1);
    assert_eq!(cpu.pc(), 2);
    assert_eq!(bus.read(map::REG_IF), Interrupts::TIMER.bits());
}

#[test]
fn reti_returns_and_reenables_interrupts() {
    // LD SP, 0xFFFF ; CALL 0x0008 ; HALT ; NOP ; sub: RETI
    let (mut cpu, bus) = machine(&[0x31, 0xFF, 0xFF, 0xCD, 0x08, 0x00, 0x76, 0x00, 0xD9]);
    run_until_pc(&mut cpu, &bus, 6, 100);
    assert!(cpu.ime);
}

#[test]
fn di_and_ei_toggle_ime() {
    // EI ; DI ; HALT
    let (mut cpu, bus) = machine(&[0xFB, 0xF3, 0x76]);
    cpu.cycle(0, &bus);
    assert!(cpu.ime);
    cpu.cycle(1, &bus);
    assert!(!cpu.ime);
}

#[test]
#[should_panic(expected = "STOP instruction is not implemented")]
fn stop_is_a_fatal_error() {
    let (mut cpu, bus) = machine(&[0x10]);
    cpu.cycle(0, &bus);
}

#[test]
#[should_panic(expected = "unknown opcode")]
fn holes_in_the_opcode_map_are_fatal() {
    let (mut cpu, bus) = machine(&[0xD3]);
    cpu.cycle(0, &bus);
}

#[test]
fn recursive_fibonacci_program_leaves_89_in_the_accumulator() {
    let _ = env_logger::builder().is_test(true).try_init();

    // SP=0xFFFF, A=11, then a recursive Fibonacci routine and a halt at
    // address 8.
    let program: [u8; 28] = [
        0x31, 0xFF, 0xFF, 0x3E, 0x0B, 0xCD, 0x0A, 0x00, 0x76, 0x00, 0xFE, 0x02, 0xD8, 0xC5, 0x3D,
        0x47, 0xCD, 0x0A, 0x00, 0x4F, 0x78, 0x3D, 0xCD, 0x0A, 0x00, 0x81, 0xC1, 0xC9,
    ];
    let (mut cpu, bus) = machine(&program);
    run_until_pc(&mut cpu, &bus, 8, 100_000);

    assert_eq!(cpu.regs.get(Reg::A), 89);
    assert_eq!(cpu.pc(), 8);
    assert_eq!(cpu.sp(), 0xFFFF);
    for reg in [Reg::F, Reg::B, Reg::C, Reg::D, Reg::E, Reg::H, Reg::L] {
        assert_eq!(cpu.regs.get(reg), 0, "{reg:?} should be zero");
    }
}
