//! Single-pin square-wave generation for one beat.

use super::{Continuity, Lfo, Transition};

/// Everything the generator needs for one beat on one pin.
///
/// Slide windows are microsecond offsets into the beat over which the
/// start→end interpolation runs; outside the window the nearer endpoint
/// holds. Frequency interpolates exponentially (equal-temperament pitch is
/// logarithmic), duty linearly.
#[derive(Debug, Clone)]
pub struct WaveParams {
    pub pin: u8,
    pub freq_start: f64,
    pub freq_end: f64,
    pub freq_window: (u32, u32),
    pub duty_start: f64,
    pub duty_end: f64,
    pub duty_window: (u32, u32),
    pub vibrato: Lfo,
    pub tremolo: Lfo,
    /// Beat length in microseconds, including the carried offset.
    pub len_us: u32,
    /// Fraction of the beat that sounds; the rest is silent tail.
    pub value: f64,
}

impl WaveParams {
    /// A plain constant tone covering the whole beat.
    pub fn tone(pin: u8, freq: f64, duty: f64, len_us: u32) -> Self {
        Self {
            pin,
            freq_start: freq,
            freq_end: freq,
            freq_window: (0, len_us),
            duty_start: duty,
            duty_end: duty,
            duty_window: (0, len_us),
            vibrato: Lfo::default(),
            tremolo: Lfo::default(),
            len_us,
            value: 1.0,
        }
    }
}

/// What a generated beat reports back, including the continuity state the
/// next beat must be fed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveInfo {
    /// Transitions emitted.
    pub len: usize,
    /// Beat length in microseconds.
    pub micros: u32,
    pub next: Continuity,
}

/// Pitch interpolation: exponential, so equal factors are equal intervals.
pub fn interpolate_freq(start: f64, end: f64, factor: f64) -> f64 {
    start * (end / start).powf(factor)
}

/// Duty interpolation: plain linear blend.
pub fn interpolate_duty(start: f64, end: f64, factor: f64) -> f64 {
    start + (end - start) * factor
}

/// Position of `elapsed` inside a slide window, normalized to [0, 1].
fn window_factor(elapsed: u32, window: (u32, u32)) -> f64 {
    let (start, end) = window;
    if end <= start {
        // Degenerate window: snap to the far endpoint once it has passed.
        return if elapsed >= start { 1.0 } else { 0.0 };
    }
    (elapsed.clamp(start, end) - start) as f64 / (end - start) as f64
}

/// Four-phase triangle modulation around `base`: up a span, back, down the
/// same span, back, over one `width`-microsecond pulse.
fn triangle<F>(base: f64, intensity: f64, width: u32, us: u64, up: f64, down: f64, lerp: F) -> f64
where
    F: Fn(f64, f64, f64) -> f64,
{
    if intensity == 0.0 || width == 0 {
        return base;
    }
    let quarters = 4.0 * us as f64 / width as f64;
    let f = quarters - quarters.trunc();
    match quarters as u64 % 4 {
        0 => lerp(base, up, f),
        1 => lerp(up, base, f),
        2 => lerp(base, down, f),
        _ => lerp(down, base, f),
    }
}

fn vibrato(base: f64, lfo: Lfo, width: u32, us: u64) -> f64 {
    let span = 2f64.powf(lfo.intensity / 1200.0);
    triangle(base, lfo.intensity, width, us, base * span, base / span, interpolate_freq)
}

fn tremolo(base: f64, lfo: Lfo, width: u32, us: u64) -> f64 {
    triangle(
        base,
        lfo.intensity,
        width,
        us,
        base + lfo.intensity,
        base - lfo.intensity,
        interpolate_duty,
    )
}

/// Generate one beat's transition sequence for a single pin into `out`.
///
/// `carry` is the continuity state reported by the previous beat (or
/// `Continuity::default()` at the start of a play). The returned info holds
/// the state the following beat must be given.
pub fn generate(params: &WaveParams, carry: Continuity, out: &mut Vec<Transition>) -> WaveInfo {
    out.clear();

    let pin = params.pin;
    let len = params.len_us;
    let vw = params.vibrato.width_us.max(1);
    let tw = params.tremolo.width_us.max(1);
    let mut micros_left = len.saturating_sub(carry.w_offset);

    // Degenerate inputs park the pin low for the whole beat.
    if params.freq_start == 0.0
        || params.duty_start <= 0.0
        || params.duty_start >= 1.0
        || params.duty_end <= 0.0
        || params.duty_end >= 1.0
    {
        out.push(Transition::falling(pin, micros_left));
        return WaveInfo {
            len: 1,
            micros: len,
            next: Continuity::default(),
        };
    }

    // The interpolated frequency and duty, reduced to the on/off halves of
    // the cycle at a given point in the beat. The truncating arithmetic is
    // load-bearing: it decides how partial microseconds accumulate.
    let halves = |micros_left: u32| -> (u32, u32) {
        let elapsed = len - micros_left;
        let ffac = window_factor(elapsed, params.freq_window);
        let dfac = window_factor(elapsed, params.duty_window);
        let freq = interpolate_freq(params.freq_start, params.freq_end, ffac);
        let freq = vibrato(freq, params.vibrato, vw, elapsed as u64 + carry.v_offset as u64);
        let duty = interpolate_duty(params.duty_start, params.duty_end, dfac);
        let duty = tremolo(duty, params.tremolo, tw, elapsed as u64 + carry.t_offset as u64);
        let half = ((1_000_000.0 / (2.0 * freq)) as u32).max(1);
        let on_us = (2.0 * half as f64 * duty) as u32;
        let off_us = 2 * half - on_us;
        (on_us, off_us)
    };

    let w_on = carry.w_on;
    let mut p: u32 = 0;

    if carry.w_offset > 0 {
        // Finish the half-cycle the previous beat left hanging; its polarity
        // is the opposite of the first full edge below.
        let lead = if w_on {
            Transition::falling(pin, carry.w_offset)
        } else {
            Transition::rising(pin, carry.w_offset)
        };
        out.push(lead);
    }

    let mut vfac = 0.0;
    let mut w_offset_out: u32 = 0;
    let mut broke = false;

    while vfac <= params.value {
        let (on_us, off_us) = halves(micros_left);
        let rising = ((p & 1) == 1) != w_on;
        if rising {
            out.push(Transition::rising(pin, on_us));
            micros_left = micros_left.saturating_sub(on_us);
            if micros_left < off_us {
                w_offset_out = off_us - micros_left;
                broke = true;
                break;
            }
        } else {
            out.push(Transition::falling(pin, off_us));
            micros_left = micros_left.saturating_sub(off_us);
            if micros_left < on_us {
                w_offset_out = on_us - micros_left;
                broke = true;
                break;
            }
        }
        p += 1;
        vfac = (len - micros_left) as f64 / len as f64;
    }

    let elapsed = len - micros_left;
    let v_offset = ((elapsed as u64 + carry.v_offset as u64) % vw as u64) as u32;
    let t_offset = ((elapsed as u64 + carry.t_offset as u64) % tw as u64) as u32;
    let mut w_on_eff = w_on;

    // A remainder equal to the complete half-cycle it stands in for is no
    // remainder at all; the next beat starts on a fresh edge.
    if broke && micros_left == 0 {
        w_offset_out = 0;
    }

    if micros_left > 0 && vfac <= params.value {
        // The beat ends mid-cycle: emit the partial half and carry the rest
        // in w_offset so the next beat completes it.
        p += 1;
        let rising = ((p & 1) == 1) != w_on_eff;
        let fill = if rising {
            Transition::rising(pin, micros_left)
        } else {
            Transition::falling(pin, micros_left)
        };
        out.push(fill);
    } else if micros_left > 0 {
        // Note value reached: park the pin low for the silent tail.
        p = 0;
        w_on_eff = false;
        w_offset_out = 0;
        out.push(Transition::falling(pin, micros_left));
    }

    WaveInfo {
        len: out.len(),
        micros: len,
        next: Continuity {
            v_offset,
            t_offset,
            w_offset: w_offset_out,
            w_on: ((p & 1) == 1) == w_on_eff,
        },
    }
}
