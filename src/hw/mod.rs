//! Hardware access: register windows, GPU memory, GPIO, PWM clock, DMA.

pub mod mailbox;
pub mod mmio;
pub mod regs;

use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::config::Config;
use crate::ring::{DmaChannel, CB_SIZE};
use mmio::MmioMap;
use regs::*;

pub use mailbox::VcMem;
pub use mmio::PAGE_SIZE;
pub use regs::{PinMode, Revision};

/// Register settle time between PWM/clock configuration steps.
const SETTLE: Duration = Duration::from_micros(10);

fn settle() {
    thread::sleep(SETTLE);
}

/// The mapped peripheral windows plus the DMA channel this player drives.
///
/// Construction maps the four windows and brings up the PWM clock chain so
/// that one FIFO word equals one microsecond; drop unmaps everything.
pub struct Peripherals {
    gpio: MmioMap,
    dma: MmioMap,
    pwm: MmioMap,
    cm: MmioMap,
    rev: Revision,
    channel: u32,
    /// Bus base of the control-block ring, for CONBLK_AD index arithmetic.
    ring_base: u32,
}

impl Peripherals {
    pub fn new(config: &Config) -> Result<Self> {
        if !matches!(config.dma_channel, 0 | 4 | 5 | 6) {
            bail!(
                "DMA channel {} is not usable (channels 0, 4, 5 and 6 are free on this hardware)",
                config.dma_channel
            );
        }
        let rev = config.hardware;
        let periph = Self {
            gpio: MmioMap::new(rev.gpio_base(), 1).context("map GPIO window")?,
            dma: MmioMap::new(rev.dma_base(), 1).context("map DMA window")?,
            pwm: MmioMap::new(rev.pwm_base(), 1).context("map PWM window")?,
            cm: MmioMap::new(rev.cm_base(), 1).context("map clock manager window")?,
            rev,
            channel: config.dma_channel,
            ring_base: 0,
        };
        log::info!(
            "peripherals mapped ({:?}, DMA channel {})",
            rev,
            config.dma_channel
        );
        Ok(periph)
    }

    pub fn revision(&self) -> Revision {
        self.rev
    }

    /// Record where the control-block ring lives on the bus, so the reader
    /// position register can be translated into a block index.
    pub fn set_ring_base(&mut self, bus: u32) {
        self.ring_base = bus;
    }

    fn ch(&self, reg: usize) -> usize {
        dma_chan(self.channel) + reg
    }

    // --- GPIO -------------------------------------------------------------

    pub fn gpio_mode(&self, pin: u8, mode: PinMode) {
        let reg = GPIO_FSEL + (pin / 10) as usize;
        let shift = 3 * (pin % 10) as u32;
        let mut fsel = self.gpio.read(reg);
        fsel &= !(7 << shift);
        fsel |= (mode as u32) << shift;
        self.gpio.write(reg, fsel);
    }

    pub fn gpio_read_mode(&self, pin: u8) -> u32 {
        let reg = GPIO_FSEL + (pin / 10) as usize;
        7 & (self.gpio.read(reg) >> (3 * (pin % 10) as u32))
    }

    pub fn gpio_write(&self, pin: u8, level: bool) {
        let reg = if level { GPIO_SET } else { GPIO_CLR };
        self.gpio.write(reg + (pin / 32) as usize, 1 << (pin % 32));
    }

    pub fn gpio_read(&self, pin: u8) -> bool {
        self.gpio.read(GPIO_LEV + (pin / 32) as usize) >> (pin % 32) & 1 != 0
    }

    // --- PWM clock chain --------------------------------------------------

    /// Bring up the PWM as a 1 MHz rate governor: PLLD / 50 = 10 MHz into
    /// the PWM, 10 bits per FIFO word, so each word drains in exactly 1 µs.
    pub fn init_pwm_clock(&self) {
        // Disable both PWM channels before touching the clock.
        self.pwm.write(PWM_CTL, self.pwm.read(PWM_CTL) & !PWM_CTL_PWEN1);
        self.pwm.write(PWM_CTL, self.pwm.read(PWM_CTL) & !PWM_CTL_PWEN2);

        // Stop the PWM clock, killing it if it refuses to go idle.
        self.cm
            .write(CM_PWMCTL, CM_PASSWD | (self.cm.read(CM_PWMCTL) & !CM_CTL_ENAB));
        while self.cm.read(CM_PWMCTL) & CM_CTL_BUSY != 0 {
            self.cm.write(CM_PWMCTL, CM_PASSWD | CM_CTL_KILL);
        }

        self.cm
            .write(CM_PWMCTL, CM_PASSWD | cm_ctl_src(PWM_CLOCK_SRC_PLLD));
        settle();
        self.cm
            .write(CM_PWMDIV, CM_PASSWD | cm_div_divi(PWM_CLOCK_DIVISOR));
        settle();
        self.cm
            .write(CM_PWMCTL, CM_PASSWD | self.cm.read(CM_PWMCTL) | CM_CTL_ENAB);
        while self.cm.read(CM_PWMCTL) & CM_CTL_BUSY == 0 {}

        // Reset the PWM itself and route channel 1 through the FIFO.
        self.pwm.write(PWM_CTL, 0);
        settle();
        self.pwm.write(PWM_STA, u32::MAX);
        settle();
        self.pwm.write(PWM_RNG1, PWM_RANGE_BITS);
        settle();
        self.pwm.write(
            PWM_DMAC,
            PWM_DMAC_ENAB | pwm_dmac_dreq(15) | pwm_dmac_panic(15),
        );
        settle();
        self.pwm.write(PWM_CTL, PWM_CTL_CLRF1);
        settle();
        self.pwm
            .write(PWM_CTL, PWM_CTL_USEF1 | PWM_CTL_MODE1 | PWM_CTL_PWEN1);
        log::debug!("PWM clock chain up: 1 us per FIFO word");
    }

    // --- DMA channel ------------------------------------------------------

    pub fn stop_dma(&self) {
        self.dma.write(self.ch(DMA_CS), DMA_CS_RESET);
    }
}

impl DmaChannel for Peripherals {
    fn dma_active(&self) -> bool {
        self.dma.read(self.ch(DMA_CS)) & DMA_CS_ACTIVE != 0
    }

    fn dma_current_index(&self) -> u32 {
        let conblk = self.dma.read(self.ch(DMA_CONBLK_AD));
        conblk.wrapping_sub(self.ring_base) / CB_SIZE
    }

    fn start_dma(&mut self, index: u32) {
        let block = self.ring_base + index * CB_SIZE;

        self.dma
            .write(DMA_ENABLE, self.dma.read(DMA_ENABLE) | 1 << self.channel);
        self.dma.write(self.ch(DMA_CS), DMA_CS_RESET);
        self.dma.write(self.ch(DMA_CS), DMA_CS_INT | DMA_CS_END);
        self.dma.write(self.ch(DMA_CONBLK_AD), block);
        self.dma.write(
            self.ch(DMA_DEBUG),
            DMA_DEBUG_FIFO_ERROR | DMA_DEBUG_READ_ERROR | DMA_DEBUG_READ_NOT_LAST_SET_ERROR,
        );
        self.dma.write(
            self.ch(DMA_CS),
            dma_cs_priority(7)
                | dma_cs_panic_priority(7)
                | DMA_CS_WAIT_FOR_OUTSTANDING_WRITES
                | DMA_CS_ACTIVE,
        );
    }
}
