//! pinwave - multi-voice square-wave synthesis on Raspberry Pi GPIO pins.
//!
//! A chained DMA channel writes pin set/clear commands to the GPIO
//! peripheral, paced by DREQ-gated copies into the PWM FIFO; with the PWM
//! clocked so that one FIFO word drains per microsecond, arbitrary
//! microsecond-accurate waveforms come out of ordinary digital pins. On top
//! of that sit per-pin square-wave voices with pitch and duty slides,
//! vibrato and tremolo, merged into one timeline and streamed through a
//! bounded control-block ring while the hardware plays.
//!
//! ```no_run
//! use pinwave::{notes, Config, Player};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut player = Player::new(Config::default())?;
//! player.queue_add(21, &[notes::A4, notes::C5], &[0.5, 0.5], &[])?;
//! player.queue_play(500_000, 2)?; // 120 BPM
//! # Ok(())
//! # }
//! ```
//!
//! Root privileges are required: the hardware is reached through `/dev/mem`
//! and `/dev/vcio`.

pub mod config;
pub mod hw;
pub mod logging;
pub mod notes;
pub mod player;
pub mod ring;
pub mod wave;

pub use config::Config;
pub use hw::{PinMode, Revision};
pub use player::{BeatMods, Player, Slide};
pub use wave::Lfo;
