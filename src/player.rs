//! The player context: voice queue, beat scheduler, and playback lifecycle.

use std::thread;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};

use crate::config::Config;
use crate::hw::regs::{bus_of_peripheral, GPIO_CLR, GPIO_SET, PWM_FIF1};
use crate::hw::{Peripherals, PinMode, VcMem};
use crate::ring::{BusTargets, CbRing, ControlBlock, DmaChannel, CB_SIZE};
use crate::wave::combine::merge;
use crate::wave::gen::{generate, interpolate_duty, interpolate_freq};
use crate::wave::{Continuity, Lfo, Transition, WaveParams};

/// A pitch or duty slide request: the target level, plus start and end
/// offsets measured in beats from the beat the request appears on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slide {
    pub target: f64,
    pub start: f64,
    pub end: f64,
}

/// Optional per-beat modifiers for one voice.
#[derive(Debug, Clone, Default)]
pub struct BeatMods {
    /// Fraction of the beat that sounds (0..1]; `None` or 0 means all of it.
    pub value: Option<f64>,
    pub pitch_slide: Option<Slide>,
    pub duty_slide: Option<Slide>,
    /// Set and remember new vibrato settings from this beat on.
    pub vibrato: Option<Lfo>,
    /// Set and remember new tremolo settings from this beat on.
    pub tremolo: Option<Lfo>,
    /// Change the global beat length starting with the next beat.
    pub beat_us: Option<u32>,
}

#[derive(Debug, Clone)]
struct Voice {
    freqs: Vec<f64>,
    duties: Vec<f64>,
    mods: Vec<Option<BeatMods>>,
}

/// A slide in progress, spanning beats.
#[derive(Debug, Clone, Copy)]
struct SlideRun {
    /// Level when the slide began.
    from: f64,
    target: f64,
    /// Absolute slide window, in beats from the start of the play.
    start_beat: f64,
    end_beat: f64,
    /// Endpoint computed for the previous beat; the next beat starts there.
    last_end: f64,
}

/// Per-pin state that survives from one beat to the next.
#[derive(Debug, Clone, Copy, Default)]
struct VoiceRun {
    cont: Continuity,
    vib: Lfo,
    trem: Lfo,
    pitch: Option<SlideRun>,
    duty: Option<SlideRun>,
}

fn fraction_us(fraction: f64, beat_us: u32) -> u32 {
    (fraction * beat_us as f64).min(beat_us as f64).max(0.0) as u32
}

/// Resolve one interpolated quantity (pitch or duty) for a beat.
///
/// Returns the effective start level, the end level, and the in-beat
/// microsecond window over which to interpolate. A slide carries its own
/// state across beats: the first beat interpolates inside the requested
/// window, later beats across their whole length, and each beat's endpoint
/// sits at `(beat + 1)` on the line from the slide's absolute start to its
/// absolute end.
fn resolve_slide(
    run: &mut Option<SlideRun>,
    series: f64,
    requested: Option<Slide>,
    beat: u32,
    beat_us: u32,
    exponential: bool,
) -> (f64, f64, (u32, u32)) {
    let from = match run {
        Some(s) => s.last_end,
        None => series,
    };
    let mut to = series;
    let mut window = (0, beat_us);

    if run.is_none() {
        if let Some(req) = requested {
            window = (fraction_us(req.start, beat_us), fraction_us(req.end, beat_us));
            *run = Some(SlideRun {
                from: series,
                target: req.target,
                start_beat: req.start + beat as f64,
                end_beat: req.end + beat as f64,
                last_end: series,
            });
        }
    }

    if let Some(s) = run {
        let span = s.end_beat - s.start_beat;
        let factor = if span > 0.0 {
            (((beat + 1) as f64 - s.start_beat) / span).clamp(0.0, 1.0)
        } else {
            1.0
        };
        to = if exponential {
            interpolate_freq(s.from, s.target, factor)
        } else {
            interpolate_duty(s.from, s.target, factor)
        };
        s.last_end = to;
        if factor >= 1.0 {
            *run = None;
        }
    }

    (from, to, window)
}

/// Everything needed to render queued voices to GPIO pins: the mapped
/// peripherals, the DMA-coherent ring and command memory, and the queue.
///
/// Construction performs the whole hardware bring-up; dropping the player
/// stops the DMA channel and releases the memory and mappings.
pub struct Player {
    periph: Peripherals,
    ring: CbRing,
    _cb_mem: VcMem,
    _cmd_mem: VcMem,
    voices: Vec<Option<Voice>>,
}

impl Player {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let mut periph = Peripherals::new(&config)?;
        periph.stop_dma();

        let pages = config.pages as usize;
        let mem_flag = config.hardware.mem_flag();
        let cb_mem =
            VcMem::allocate(mem_flag, pages).context("allocate control-block ring")?;
        let cmd_mem =
            VcMem::allocate(mem_flag, pages).context("allocate command words")?;

        periph.init_pwm_clock();
        periph.set_ring_base(cb_mem.bus_addr());

        let rev = config.hardware;
        let targets = BusTargets {
            gpio_set: bus_of_peripheral(rev.gpio_base(), GPIO_SET),
            gpio_clr: bus_of_peripheral(rev.gpio_base(), GPIO_CLR),
            pwm_fifo: bus_of_peripheral(rev.pwm_base(), PWM_FIF1),
        };
        let capacity = (cb_mem.len() / CB_SIZE as usize) as u32;
        let ring = unsafe {
            CbRing::new(
                cb_mem.virt() as *mut ControlBlock,
                cb_mem.bus_addr(),
                capacity,
                cmd_mem.virt() as *mut u32,
                cmd_mem.bus_addr(),
                (cmd_mem.len() / 4) as u32,
                targets,
            )
        };
        log::info!("player ready: {capacity} control blocks across {pages} pages");

        Ok(Self {
            periph,
            ring,
            _cb_mem: cb_mem,
            _cmd_mem: cmd_mem,
            voices: vec![None; 32],
        })
    }

    /// Register one voice. `freqs` and `duties` give one entry per beat
    /// (frequency 0 rests); `mods` may be shorter or empty.
    pub fn queue_add(
        &mut self,
        pin: u8,
        freqs: &[f64],
        duties: &[f64],
        mods: &[Option<BeatMods>],
    ) -> Result<()> {
        ensure!(pin < 32, "pin {pin} out of range (BCM 0..31)");
        self.voices[pin as usize] = Some(Voice {
            freqs: freqs.to_vec(),
            duties: duties.to_vec(),
            mods: mods.to_vec(),
        });
        Ok(())
    }

    /// Render and play everything queued, blocking until the last beat has
    /// drained out of the hardware, then reset the queue.
    ///
    /// `beat_us` is the initial beat length in microseconds
    /// (60_000_000 / BPM); a `BeatMods::beat_us` can change it mid-song.
    pub fn queue_play(&mut self, beat_us: u32, beats: u32) -> Result<()> {
        ensure!(beat_us > 0, "beat length must be non-zero");
        for (pin, voice) in self.voices.iter().enumerate() {
            if let Some(v) = voice {
                if (v.freqs.len() as u32) < beats || (v.duties.len() as u32) < beats {
                    bail!("voice on pin {pin} covers fewer than {beats} beats");
                }
            }
        }
        let active: Vec<u8> = (0..32u8)
            .filter(|&p| self.voices[p as usize].is_some())
            .collect();
        if active.is_empty() {
            log::warn!("queue_play with an empty queue");
            return Ok(());
        }
        log::info!(
            "playing {} beats of {} us on {} voice(s)",
            beats,
            beat_us,
            active.len()
        );

        for &pin in &active {
            self.periph.gpio_mode(pin, PinMode::Output);
        }

        let mut runs = vec![VoiceRun::default(); 32];
        let mut us = beat_us;
        let mut pending_us: Option<u32> = None;
        let mut combined: Vec<Transition> = Vec::new();
        let mut fresh: Vec<Transition> = Vec::new();
        let mut merged: Vec<Transition> = Vec::new();

        for beat in 0..beats {
            if let Some(next) = pending_us.take() {
                us = next;
            }
            combined.clear();

            for &pin in &active {
                let Some(voice) = self.voices[pin as usize].as_ref() else {
                    continue;
                };
                let run = &mut runs[pin as usize];
                let mods = voice.mods.get(beat as usize).and_then(|m| m.as_ref());

                let value = mods
                    .and_then(|m| m.value)
                    .filter(|&v| v > 0.0)
                    .unwrap_or(1.0);
                if let Some(v) = mods.and_then(|m| m.vibrato) {
                    run.vib = v;
                }
                if let Some(t) = mods.and_then(|m| m.tremolo) {
                    run.trem = t;
                }
                if let Some(next) = mods.and_then(|m| m.beat_us).filter(|&u| u != 0) {
                    pending_us = Some(next);
                }

                let (freq_start, freq_end, freq_window) = resolve_slide(
                    &mut run.pitch,
                    voice.freqs[beat as usize],
                    mods.and_then(|m| m.pitch_slide),
                    beat,
                    us,
                    true,
                );
                let (duty_start, duty_end, duty_window) = resolve_slide(
                    &mut run.duty,
                    voice.duties[beat as usize],
                    mods.and_then(|m| m.duty_slide),
                    beat,
                    us,
                    false,
                );

                let params = WaveParams {
                    pin,
                    freq_start,
                    freq_end,
                    freq_window,
                    duty_start,
                    duty_end,
                    duty_window,
                    vibrato: run.vib,
                    tremolo: run.trem,
                    len_us: us,
                    value,
                };
                let info = generate(&params, run.cont, &mut fresh);
                run.cont = info.next;

                merge(&combined, &fresh, &mut merged);
                std::mem::swap(&mut combined, &mut merged);
            }

            self.ring.transmit(&combined, &mut self.periph);
        }

        // Let the hardware finish the tail of the song, then park the pins.
        while self.periph.dma_active() {
            thread::sleep(Duration::from_millis(1));
        }
        self.periph.stop_dma();
        for &pin in &active {
            self.periph.gpio_write(pin, false);
        }
        for voice in self.voices.iter_mut() {
            *voice = None;
        }
        self.ring.reset();
        log::info!("playback finished, queue reset");
        Ok(())
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.periph.stop_dma();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notes;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn test_pitch_slide_endpoints_are_equal_intervals() {
        // c4 to c5 over four beats: each endpoint a quarter octave up.
        let mut run = None;
        let req = Slide {
            target: notes::C5,
            start: 0.0,
            end: 4.0,
        };
        let mut endpoints = Vec::new();
        for beat in 0..4 {
            let requested = (beat == 0).then_some(req);
            let (_, to, _) = resolve_slide(&mut run, notes::C4, requested, beat, 500_000, true);
            endpoints.push(to);
        }
        for (i, &e) in endpoints.iter().enumerate() {
            // The note table is rounded to millihertz, so the octave ratio
            // is only approximately 2.
            let expected = notes::C4 * 2f64.powf((i as f64 + 1.0) / 4.0);
            assert!((e - expected).abs() < 0.01, "beat {i}: {e} vs {expected}");
        }
        // The slide finished exactly on the last beat.
        assert!(run.is_none());
    }

    #[test]
    fn test_start_level_carries_between_slide_beats() {
        let mut run = None;
        let req = Slide {
            target: 880.0,
            start: 0.0,
            end: 2.0,
        };
        let (from0, to0, _) = resolve_slide(&mut run, 440.0, Some(req), 0, 1000, true);
        assert!(close(from0, 440.0));
        // Mid-slide, the series value (often a rest marker) is ignored.
        let (from1, to1, _) = resolve_slide(&mut run, 0.0, None, 1, 1000, true);
        assert!(close(from1, to0));
        assert!(close(to1, 880.0));
        assert!(run.is_none());
    }

    #[test]
    fn test_duty_slide_is_linear() {
        let mut run = None;
        let req = Slide {
            target: 0.6,
            start: 0.0,
            end: 4.0,
        };
        let mut endpoints = Vec::new();
        for beat in 0..4 {
            let requested = (beat == 0).then_some(req);
            let (_, to, _) = resolve_slide(&mut run, 0.2, requested, beat, 1000, false);
            endpoints.push(to);
        }
        for (i, &e) in endpoints.iter().enumerate() {
            assert!(close(e, 0.3 + 0.1 * i as f64), "beat {i}: {e}");
        }
    }

    #[test]
    fn test_first_beat_window_scales_with_beat_length() {
        let mut run = None;
        let req = Slide {
            target: 880.0,
            start: 0.25,
            end: 0.75,
        };
        let (_, _, window) = resolve_slide(&mut run, 440.0, Some(req), 0, 1000, true);
        assert_eq!(window, (250, 750));
        // Later slide beats interpolate across their whole length.
        let (_, _, window) = resolve_slide(&mut run, 440.0, None, 1, 1000, true);
        assert_eq!(window, (0, 1000));
    }

    #[test]
    fn test_window_clamps_to_beat() {
        let mut run = None;
        let req = Slide {
            target: 880.0,
            start: 0.5,
            end: 3.0,
        };
        let (_, _, window) = resolve_slide(&mut run, 440.0, Some(req), 0, 1000, true);
        assert_eq!(window, (500, 1000));
    }

    #[test]
    fn test_degenerate_slide_span_finishes_immediately() {
        let mut run = None;
        let req = Slide {
            target: 880.0,
            start: 1.0,
            end: 1.0,
        };
        let (_, to, _) = resolve_slide(&mut run, 440.0, Some(req), 0, 1000, true);
        assert!(close(to, 880.0));
        assert!(run.is_none());
    }

    #[test]
    fn test_no_slide_passes_series_through() {
        let mut run = None;
        let (from, to, window) = resolve_slide(&mut run, 440.0, None, 7, 1000, true);
        assert!(close(from, 440.0));
        assert!(close(to, 440.0));
        assert_eq!(window, (0, 1000));
        assert!(run.is_none());
    }
}
