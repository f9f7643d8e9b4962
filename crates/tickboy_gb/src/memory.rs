//! Memory blocks and the controllers that expose them on the bus.

pub mod map;

use std::cell::RefCell;
use std::rc::Rc;

use crate::bus::Component;
use crate::cartridge::Cartridge;

/// A byte-addressable RAM block. Indexing past the end is a caller bug and
/// panics immediately.
pub struct Ram {
    data: Vec<u8>,
}

impl Ram {
    pub fn new(size: usize) -> Ram {
        Ram {
            data: vec![0; size],
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn read(&self, index: usize) -> u8 {
        self.data[index]
    }

    pub fn write(&mut self, index: usize, value: u8) {
        self.data[index] = value;
    }
}

/// An immutable byte block.
pub struct Rom {
    data: Vec<u8>,
}

impl Rom {
    pub fn new(data: Vec<u8>) -> Rom {
        Rom { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn read(&self, index: usize) -> u8 {
        self.data[index]
    }
}

/// Maps a (possibly shared) [`Ram`] block into an address window.
///
/// Sharing one block between two controllers is how the echo-RAM alias and
/// the display controller's VRAM/OAM windows are built.
pub struct RamController {
    ram: Rc<RefCell<Ram>>,
    start: u32,
    end: u32,
}

impl RamController {
    /// Maps the whole block starting at `start`.
    pub fn new(ram: Rc<RefCell<Ram>>, start: u16) -> RamController {
        let end = start as u32 + ram.borrow().size() as u32;
        Self::with_end(ram, start, end)
    }

    /// Maps the block's first `end - start` bytes onto `[start, end)`.
    pub fn bounded(ram: Rc<RefCell<Ram>>, start: u16, end: u16) -> RamController {
        Self::with_end(ram, start, end as u32)
    }

    fn with_end(ram: Rc<RefCell<Ram>>, start: u16, end: u32) -> RamController {
        assert!(
            end >= start as u32 && end - (start as u32) <= ram.borrow().size() as u32,
            "address window [{start:#X}, {end:#X}) does not fit the RAM block"
        );
        assert!(end <= 0x1_0000, "address window ends past the address space");
        RamController {
            ram,
            start: start as u32,
            end,
        }
    }

    fn contains(&self, address: u16) -> bool {
        (self.start..self.end).contains(&(address as u32))
    }
}

impl Component for RamController {
    fn read(&self, address: u16) -> Option<u8> {
        self.contains(address)
            .then(|| self.ram.borrow().read((address as u32 - self.start) as usize))
    }

    fn write(&mut self, address: u16, value: u8) {
        if self.contains(address) {
            self.ram
                .borrow_mut()
                .write((address as u32 - self.start) as usize, value);
        }
    }
}

/// Overlays the 256-byte boot ROM over the bottom of the cartridge until a
/// write to the disable register unmaps it for good.
pub struct BootRomController {
    cartridge: Cartridge,
    boot_rom: Rom,
    disabled: bool,
}

impl BootRomController {
    pub fn new(cartridge: Cartridge, boot_rom: Rom) -> BootRomController {
        assert_eq!(
            boot_rom.size(),
            map::BOOT_ROM_SIZE,
            "boot ROM image must be exactly {} bytes",
            map::BOOT_ROM_SIZE
        );
        BootRomController {
            cartridge,
            boot_rom,
            disabled: false,
        }
    }
}

impl Component for BootRomController {
    fn read(&self, address: u16) -> Option<u8> {
        if !self.disabled && (address as usize) < map::BOOT_ROM_SIZE {
            Some(self.boot_rom.read(address as usize))
        } else {
            self.cartridge.read(address)
        }
    }

    fn write(&mut self, address: u16, value: u8) {
        if address == map::REG_BOOT_ROM_DISABLE {
            if !self.disabled {
                log::debug!("boot ROM overlay disabled");
            }
            self.disabled = true;
        } else {
            self.cartridge.write(address, value);
        }
    }
}
