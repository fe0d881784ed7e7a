//! Player configuration.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::hw::Revision;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Which register map the board uses.
    pub hardware: Revision,

    /// DMA channel to drive. Channels 0, 4, 5 and 6 are free for userspace
    /// on this hardware.
    pub dma_channel: u32,

    /// Pages of DMA-coherent memory for the control-block ring; one page
    /// holds 128 blocks. The command-word buffer is sized to match.
    pub pages: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hardware: Revision::Pi2,
            dma_channel: 5,
            pages: 128,
        }
    }
}

impl Config {
    /// Load JSON configuration from `path`; a missing file falls back to
    /// the defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse config {}", path.display())),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::warn!("config {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("read config {}", path.display())),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !matches!(self.dma_channel, 0 | 4 | 5 | 6) {
            bail!("DMA channel {} is reserved; use 0, 4, 5 or 6", self.dma_channel);
        }
        if self.pages == 0 {
            bail!("at least one page of control blocks is required");
        }
        Ok(())
    }
}
