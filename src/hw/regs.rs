//! Register maps for the BCM283x peripherals this crate touches.
//!
//! Offsets are in 32-bit words from each peripheral's base, matching how the
//! windows are accessed (`MmioMap` reads and writes whole words). The values
//! here come from the BCM2835 ARM Peripherals datasheet; the clock manager is
//! undocumented but well understood. They must be preserved bit-exact.

use serde::{Deserialize, Serialize};

/// Hardware revisions with distinct physical peripheral base addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Revision {
    /// Pi Zero, Pi 1, Compute Module (peripherals at 0x20000000).
    Pi1,
    /// Pi 2, Pi 3 (peripherals at 0x3F000000).
    Pi2,
}

impl Revision {
    pub fn dma_base(self) -> u32 {
        match self {
            Revision::Pi1 => 0x2000_7000,
            Revision::Pi2 => 0x3F00_7000,
        }
    }

    pub fn cm_base(self) -> u32 {
        match self {
            Revision::Pi1 => 0x2010_1000,
            Revision::Pi2 => 0x3F10_1000,
        }
    }

    pub fn gpio_base(self) -> u32 {
        match self {
            Revision::Pi1 => 0x2020_0000,
            Revision::Pi2 => 0x3F20_0000,
        }
    }

    pub fn pwm_base(self) -> u32 {
        match self {
            Revision::Pi1 => 0x2020_C000,
            Revision::Pi2 => 0x3F20_C000,
        }
    }

    /// Mailbox allocation flags for DMA-coherent memory on this revision.
    pub fn mem_flag(self) -> u32 {
        match self {
            Revision::Pi1 => 0xC,
            Revision::Pi2 => 0x4,
        }
    }
}

/// GPIO pin function as encoded in the 3-bit FSEL fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PinMode {
    Input = 0,
    Output = 1,
    Alt0 = 4,
    Alt1 = 5,
    Alt2 = 6,
    Alt3 = 7,
    Alt4 = 3,
    Alt5 = 2,
}

// GPIO register word offsets.
pub const GPIO_FSEL: usize = 0;
pub const GPIO_SET: usize = 7;
pub const GPIO_CLR: usize = 10;
pub const GPIO_LEV: usize = 13;

// DMA register word offsets. Each channel occupies 64 words; DMA_ENABLE is a
// single shared register near the end of the 4K window.
pub const DMA_CS: usize = 0;
pub const DMA_CONBLK_AD: usize = 1;
pub const DMA_DEBUG: usize = 8;
pub const DMA_ENABLE: usize = 1020;

pub const fn dma_chan(n: u32) -> usize {
    (n as usize) * 64
}

// DMA control-and-status bits.
pub const DMA_CS_ACTIVE: u32 = 1 << 0;
pub const DMA_CS_END: u32 = 1 << 1;
pub const DMA_CS_INT: u32 = 1 << 2;
pub const DMA_CS_WAIT_FOR_OUTSTANDING_WRITES: u32 = 1 << 28;
pub const DMA_CS_RESET: u32 = 1 << 31;

pub const fn dma_cs_priority(n: u32) -> u32 {
    (n & 15) << 16
}

pub const fn dma_cs_panic_priority(n: u32) -> u32 {
    (n & 15) << 20
}

// DMA debug bits, write 1 to clear.
pub const DMA_DEBUG_READ_NOT_LAST_SET_ERROR: u32 = 1 << 0;
pub const DMA_DEBUG_FIFO_ERROR: u32 = 1 << 1;
pub const DMA_DEBUG_READ_ERROR: u32 = 1 << 2;

// PWM register word offsets.
pub const PWM_CTL: usize = 0;
pub const PWM_STA: usize = 1;
pub const PWM_DMAC: usize = 2;
pub const PWM_RNG1: usize = 4;
pub const PWM_FIF1: usize = 6;

// PWM control bits.
pub const PWM_CTL_PWEN1: u32 = 1 << 0;
pub const PWM_CTL_MODE1: u32 = 1 << 1;
pub const PWM_CTL_USEF1: u32 = 1 << 5;
pub const PWM_CTL_CLRF1: u32 = 1 << 6;
pub const PWM_CTL_PWEN2: u32 = 1 << 8;

pub const PWM_DMAC_ENAB: u32 = 1 << 31;

pub const fn pwm_dmac_dreq(n: u32) -> u32 {
    n & 255
}

pub const fn pwm_dmac_panic(n: u32) -> u32 {
    (n & 255) << 8
}

// Clock manager word offsets (PWM clock only).
pub const CM_PWMCTL: usize = 40;
pub const CM_PWMDIV: usize = 41;

// Every clock manager write must carry this password in the top byte.
pub const CM_PASSWD: u32 = 90 << 24;

pub const CM_CTL_ENAB: u32 = 1 << 4;
pub const CM_CTL_KILL: u32 = 1 << 5;
pub const CM_CTL_BUSY: u32 = 1 << 7;

pub const fn cm_ctl_src(n: u32) -> u32 {
    n & 15
}

pub const fn cm_div_divi(n: u32) -> u32 {
    (n & 4095) << 12
}

/// PLLD, a constant 500 MHz source.
pub const PWM_CLOCK_SRC_PLLD: u32 = 6;
/// 500 MHz / 50 = 10 MHz into the PWM.
pub const PWM_CLOCK_DIVISOR: u32 = 50;
/// 10 bits per FIFO word at 10 MHz: one word drains per microsecond.
pub const PWM_RANGE_BITS: u32 = 10;

// Control-block transfer-information bits.
pub const CB_WAIT_RESP: u32 = 1 << 3;
pub const CB_DEST_DREQ: u32 = 1 << 6;
pub const CB_NO_WIDE_BURSTS: u32 = 1 << 26;

pub const fn cb_permap(n: u32) -> u32 {
    (n & 31) << 16
}

/// Baseline transfer-info flags carried by every block the core emits.
pub const TI_BASE: u32 = CB_NO_WIDE_BURSTS | CB_WAIT_RESP;

/// Peripheral id of the PWM DREQ on the DMA crossbar.
pub const PERMAP_PWM: u32 = 5;

/// Address of a peripheral register as the DMA engine sees it.
///
/// Peripherals always appear in the 0x7E000000 bus alias regardless of where
/// the ARM maps them physically.
pub fn bus_of_peripheral(base: u32, word_offset: usize) -> u32 {
    ((base + 4 * word_offset as u32) & 0x00FF_FFFF) | 0x7E00_0000
}
