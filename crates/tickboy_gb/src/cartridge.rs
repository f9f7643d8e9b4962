//! Cartridge boundary: the core only sees the read/write contract.
//!
//! Header parsing stops at the type byte needed to pick the bank
//! controller; only the flat 32 KiB layout is supported here.

use std::path::Path;

use anyhow::{ensure, Context, Result};

use crate::bus::Component;
use crate::memory::Rom;

/// Header offset of the cartridge type byte.
const CARTRIDGE_TYPE_ADDRESS: usize = 0x147;

/// ROM size of a cartridge without a bank controller.
const MBC0_ROM_SIZE: usize = 0x8000;

pub struct Cartridge {
    mbc: Mbc0,
}

impl Cartridge {
    /// Loads a cartridge image from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Cartridge> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .with_context(|| format!("failed to read cartridge image {}", path.display()))?;
        let cartridge = Cartridge::from_bytes(data)
            .with_context(|| format!("unsupported cartridge image {}", path.display()))?;
        log::info!("loaded cartridge image {}", path.display());
        Ok(cartridge)
    }

    /// Builds a cartridge from a raw ROM image already in memory.
    pub fn from_bytes(data: Vec<u8>) -> Result<Cartridge> {
        ensure!(
            data.len() == MBC0_ROM_SIZE,
            "expected a {MBC0_ROM_SIZE} byte ROM image, got {} bytes",
            data.len()
        );
        ensure!(
            data[CARTRIDGE_TYPE_ADDRESS] == 0,
            "unsupported cartridge type {:#04X} (only type 0 is handled)",
            data[CARTRIDGE_TYPE_ADDRESS]
        );
        Ok(Cartridge {
            mbc: Mbc0::new(Rom::new(data)),
        })
    }
}

impl Component for Cartridge {
    fn read(&self, address: u16) -> Option<u8> {
        self.mbc.read(address)
    }

    fn write(&mut self, address: u16, value: u8) {
        self.mbc.write(address, value);
    }
}

/// The trivial bank controller: 32 KiB of ROM, writes ignored.
struct Mbc0 {
    rom: Rom,
}

impl Mbc0 {
    fn new(rom: Rom) -> Mbc0 {
        assert_eq!(rom.size(), MBC0_ROM_SIZE);
        Mbc0 { rom }
    }
}

impl Component for Mbc0 {
    fn read(&self, address: u16) -> Option<u8> {
        ((address as usize) < MBC0_ROM_SIZE).then(|| self.rom.read(address as usize))
    }

    fn write(&mut self, _address: u16, _value: u8) {}
}
