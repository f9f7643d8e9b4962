//! Opcode descriptor tables.
//!
//! Dispatch is table-driven: each of the 256 direct encodings (and each of
//! the 256 encodings behind the 0xCB prefix) maps to a descriptor carrying
//! its family, length and timing. The tables are plain data built once at
//! startup; the execution engine switches on the family and recovers
//! registers, conditions and bit indices from the encoding itself.

use lazy_static::lazy_static;

/// The escape byte selecting the second opcode table.
pub const OPCODE_PREFIX: u8 = 0xCB;

/// Instruction families. One family covers every encoding that shares
/// semantics, operand placement and flag handling.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Family {
    Nop,
    // Loads.
    LdR8Hlr,
    LdAHlru,
    LdAN8r,
    LdACr,
    LdAN16r,
    LdABcr,
    LdADer,
    LdR8N8,
    LdR16SpN16,
    PopR16,
    // Stores.
    LdHlrR8,
    LdHlruA,
    LdN8rA,
    LdCrA,
    LdN16rA,
    LdBcrA,
    LdDerA,
    LdHlrN8,
    LdN16rSp,
    PushR16,
    // Moves.
    LdR8R8,
    LdSpHl,
    // 8/16-bit additions.
    AddAR8,
    AddAN8,
    AddAHlr,
    IncR8,
    IncHlr,
    IncR16Sp,
    AddHlR16Sp,
    LdHlSpS8,
    // Subtractions and comparisons.
    SubAR8,
    SubAN8,
    SubAHlr,
    DecR8,
    DecHlr,
    CpAR8,
    CpAN8,
    CpAHlr,
    DecR16Sp,
    // Boolean operations.
    AndAN8,
    AndAR8,
    AndAHlr,
    OrAR8,
    OrAN8,
    OrAHlr,
    XorAR8,
    XorAN8,
    XorAHlr,
    Cpl,
    // Rotations and shifts.
    Rotca,
    Rota,
    RotcR8,
    RotR8,
    RotcHlr,
    RotHlr,
    SwapR8,
    SwapHlr,
    SlaR8,
    SraR8,
    SrlR8,
    SlaHlr,
    SraHlr,
    SrlHlr,
    // Single-bit operations.
    BitU3R8,
    BitU3Hlr,
    ChgU3R8,
    ChgU3Hlr,
    // Accumulator adjustments.
    Daa,
    Sccf,
    // Jumps.
    JpHl,
    JpN16,
    JpCcN16,
    JrE8,
    JrCcE8,
    // Calls and returns.
    CallN16,
    CallCcN16,
    RstU3,
    Ret,
    RetCc,
    // Interrupt control.
    Edi,
    Reti,
    // Misc control.
    Halt,
    Stop,
}

/// One instruction descriptor.
#[derive(Copy, Clone, Debug)]
pub struct Opcode {
    pub family: Family,
    pub encoding: u8,
    /// Instruction length in bytes, prefix included.
    pub total_bytes: u16,
    /// Base duration in machine cycles.
    pub cycles: u64,
    /// Extra cycles consumed when a conditional branch is taken.
    pub additional_cycles: u64,
}

lazy_static! {
    /// Descriptors for the unprefixed encodings; `None` marks the holes in
    /// the instruction map.
    pub static ref DIRECT_OPCODE_TABLE: [Option<Opcode>; 256] = build_direct_table();

    /// Descriptors for the encodings behind the 0xCB prefix (all 256 are
    /// defined).
    pub static ref PREFIXED_OPCODE_TABLE: [Opcode; 256] = build_prefixed_table();
}

fn build_direct_table() -> [Option<Opcode>; 256] {
    use Family::*;

    let mut table = [None; 256];
    let mut def = |encoding: u8, family: Family, bytes: u16, cycles: u64, extra: u64| {
        debug_assert!(table[encoding as usize].is_none(), "duplicate {encoding:#04X}");
        table[encoding as usize] = Some(Opcode {
            family,
            encoding,
            total_bytes: bytes,
            cycles,
            additional_cycles: extra,
        });
    };

    // 0x00..0x3F: the irregular quadrant.
    def(0x00, Nop, 1, 1, 0);
    def(0x10, Stop, 1, 1, 0);
    def(0x07, Rotca, 1, 1, 0);
    def(0x0F, Rotca, 1, 1, 0);
    def(0x17, Rota, 1, 1, 0);
    def(0x1F, Rota, 1, 1, 0);
    def(0x27, Daa, 1, 1, 0);
    def(0x2F, Cpl, 1, 1, 0);
    def(0x37, Sccf, 1, 1, 0);
    def(0x3F, Sccf, 1, 1, 0);
    def(0x18, JrE8, 2, 3, 0);
    for e in [0x20, 0x28, 0x30, 0x38] {
        def(e, JrCcE8, 2, 2, 1);
    }
    for e in [0x01, 0x11, 0x21, 0x31] {
        def(e, LdR16SpN16, 3, 3, 0);
    }
    for e in [0x03, 0x13, 0x23, 0x33] {
        def(e, IncR16Sp, 1, 2, 0);
    }
    for e in [0x0B, 0x1B, 0x2B, 0x3B] {
        def(e, DecR16Sp, 1, 2, 0);
    }
    for e in [0x09, 0x19, 0x29, 0x39] {
        def(e, AddHlR16Sp, 1, 2, 0);
    }
    for e in [0x04, 0x0C, 0x14, 0x1C, 0x24, 0x2C, 0x3C] {
        def(e, IncR8, 1, 1, 0);
    }
    for e in [0x05, 0x0D, 0x15, 0x1D, 0x25, 0x2D, 0x3D] {
        def(e, DecR8, 1, 1, 0);
    }
    for e in [0x06, 0x0E, 0x16, 0x1E, 0x26, 0x2E, 0x3E] {
        def(e, LdR8N8, 2, 2, 0);
    }
    def(0x34, IncHlr, 1, 3, 0);
    def(0x35, DecHlr, 1, 3, 0);
    def(0x36, LdHlrN8, 2, 3, 0);
    def(0x02, LdBcrA, 1, 2, 0);
    def(0x12, LdDerA, 1, 2, 0);
    def(0x0A, LdABcr, 1, 2, 0);
    def(0x1A, LdADer, 1, 2, 0);
    def(0x22, LdHlruA, 1, 2, 0);
    def(0x32, LdHlruA, 1, 2, 0);
    def(0x2A, LdAHlru, 1, 2, 0);
    def(0x3A, LdAHlru, 1, 2, 0);
    def(0x08, LdN16rSp, 3, 5, 0);

    // 0x40..0x7F: the register-move quadrant (plus HALT at 0x76).
    for e in 0x40..=0x7Fu8 {
        let dst = (e >> 3) & 0x7;
        let src = e & 0x7;
        match (dst, src) {
            (6, 6) => def(e, Halt, 1, 1, 0),
            (6, _) => def(e, LdHlrR8, 1, 2, 0),
            (_, 6) => def(e, LdR8Hlr, 1, 2, 0),
            _ => def(e, LdR8R8, 1, 1, 0),
        }
    }

    // 0x80..0xBF: the accumulator-arithmetic quadrant.
    for e in 0x80..=0xBFu8 {
        let hl = e & 0x7 == 6;
        let family = match (e >> 3) & 0x7 {
            0 | 1 => {
                if hl {
                    AddAHlr
                } else {
                    AddAR8
                }
            }
            2 | 3 => {
                if hl {
                    SubAHlr
                } else {
                    SubAR8
                }
            }
            4 => {
                if hl {
                    AndAHlr
                } else {
                    AndAR8
                }
            }
            5 => {
                if hl {
                    XorAHlr
                } else {
                    XorAR8
                }
            }
            6 => {
                if hl {
                    OrAHlr
                } else {
                    OrAR8
                }
            }
            _ => {
                if hl {
                    CpAHlr
                } else {
                    CpAR8
                }
            }
        };
        def(e, family, 1, if hl { 2 } else { 1 }, 0);
    }

    // 0xC0..0xFF: control flow, stack and the high-page accesses.
    for e in [0xC0, 0xC8, 0xD0, 0xD8] {
        def(e, RetCc, 1, 2, 3);
    }
    for e in [0xC1, 0xD1, 0xE1, 0xF1] {
        def(e, PopR16, 1, 3, 0);
    }
    for e in [0xC5, 0xD5, 0xE5, 0xF5] {
        def(e, PushR16, 1, 4, 0);
    }
    for e in [0xC2, 0xCA, 0xD2, 0xDA] {
        def(e, JpCcN16, 3, 3, 1);
    }
    for e in [0xC4, 0xCC, 0xD4, 0xDC] {
        def(e, CallCcN16, 3, 3, 3);
    }
    for e in [0xC7, 0xCF, 0xD7, 0xDF, 0xE7, 0xEF, 0xF7, 0xFF] {
        def(e, RstU3, 1, 4, 0);
    }
    def(0xC3, JpN16, 3, 4, 0);
    def(0xC6, AddAN8, 2, 2, 0);
    def(0xC9, Ret, 1, 4, 0);
    def(0xCD, CallN16, 3, 6, 0);
    def(0xCE, AddAN8, 2, 2, 0);
    def(0xD6, SubAN8, 2, 2, 0);
    def(0xD9, Reti, 1, 4, 0);
    def(0xDE, SubAN8, 2, 2, 0);
    def(0xE0, LdN8rA, 2, 3, 0);
    def(0xE2, LdCrA, 1, 2, 0);
    def(0xE6, AndAN8, 2, 2, 0);
    def(0xE8, LdHlSpS8, 2, 4, 0);
    def(0xE9, JpHl, 1, 1, 0);
    def(0xEA, LdN16rA, 3, 4, 0);
    def(0xEE, XorAN8, 2, 2, 0);
    def(0xF0, LdAN8r, 2, 3, 0);
    def(0xF2, LdACr, 1, 2, 0);
    def(0xF3, Edi, 1, 1, 0);
    def(0xF6, OrAN8, 2, 2, 0);
    def(0xF8, LdHlSpS8, 2, 3, 0);
    def(0xF9, LdSpHl, 1, 2, 0);
    def(0xFA, LdAN16r, 3, 4, 0);
    def(0xFB, Edi, 1, 1, 0);
    def(0xFE, CpAN8, 2, 2, 0);

    table
}

fn build_prefixed_table() -> [Opcode; 256] {
    use Family::*;

    std::array::from_fn(|i| {
        let encoding = i as u8;
        let hl = encoding & 0x7 == 6;
        let (family, cycles) = match encoding >> 6 {
            0 => {
                let family = match (encoding >> 3) & 0x7 {
                    0 | 1 => {
                        if hl {
                            RotcHlr
                        } else {
                            RotcR8
                        }
                    }
                    2 | 3 => {
                        if hl {
                            RotHlr
                        } else {
                            RotR8
                        }
                    }
                    4 => {
                        if hl {
                            SlaHlr
                        } else {
                            SlaR8
                        }
                    }
                    5 => {
                        if hl {
                            SraHlr
                        } else {
                            SraR8
                        }
                    }
                    6 => {
                        if hl {
                            SwapHlr
                        } else {
                            SwapR8
                        }
                    }
                    _ => {
                        if hl {
                            SrlHlr
                        } else {
                            SrlR8
                        }
                    }
                };
                (family, if hl { 4 } else { 2 })
            }
            1 => (
                if hl { BitU3Hlr } else { BitU3R8 },
                if hl { 3 } else { 2 },
            ),
            _ => (
                if hl { ChgU3Hlr } else { ChgU3R8 },
                if hl { 4 } else { 2 },
            ),
        };
        Opcode {
            family,
            encoding,
            total_bytes: 2,
            cycles,
            additional_cycles: 0,
        }
    })
}
