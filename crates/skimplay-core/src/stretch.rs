//! Pitch-preserving audio time-stretching.
//!
//! [`StretchBackend`] is the seam to the DSP library: a block-based stretcher
//! with internal latency, driven by a time ratio (output duration over input
//! duration). With the `signalsmith` feature the default backend is
//! [`SignalsmithStretcher`]; otherwise, or when it rejects the format, the
//! built-in WSOLA [`OverlapAddStretcher`] is used.
//!
//! [`AudioStretcher`] wraps a backend for the audio output context. It owns
//! *when* and *by how much* to stretch: it applies the rate of each input
//! block, cuts the output into fixed-size blocks, carries the source range of
//! every output block (the sync clock needs it), corrects accumulated drift,
//! and smooths cuts in the input. If the backend fails, the caller switches
//! the adapter to passthrough so audio keeps flowing at rate 1.0.

use std::collections::VecDeque;
use std::time::Duration;

use crate::config::PlayerConfig;
use crate::error::StretchError;
use crate::frame::{duration_to_frames, frames_to_duration, AudioFrame};

#[cfg(feature = "signalsmith")]
mod signalsmith;
#[cfg(feature = "signalsmith")]
pub use signalsmith::SignalsmithStretcher;

/// Trait for block-based time-stretch engines.
pub trait StretchBackend: Send {
    /// Sets the output/input duration ratio for subsequent input.
    fn set_time_ratio(&mut self, ratio: f64);

    /// Feeds interleaved input. `final_block` marks the end of the stream;
    /// the backend must then make all remaining output available.
    fn process(&mut self, input: &[f32], final_block: bool) -> Result<(), StretchError>;

    /// Output frames ready for [`retrieve`](Self::retrieve).
    fn available(&self) -> usize;

    /// Takes up to `max_frames` frames of interleaved output.
    fn retrieve(&mut self, max_frames: usize) -> Vec<f32>;

    /// Output frames the backend currently owes for input already fed.
    fn latency(&self) -> usize;

    /// Drops all internal state.
    fn reset(&mut self);
}

/// Waveform-similarity overlap-add stretcher.
///
/// Windows of ~20ms are taken from the input every `hop * speed` frames and
/// laid down every `hop` frames. Each window is nudged by up to an eighth of
/// its length to best continue the previous one, which keeps periodic signals
/// phase-coherent. At ratio 1.0 it reconstructs the input exactly.
pub struct OverlapAddStretcher {
    channels: usize,
    window_len: usize,
    hop: usize,
    tolerance: usize,
    window: Vec<f32>,
    speed: f64,

    input: Vec<f32>,
    /// Nominal start of the next analysis window, in frames into `input`.
    next_pos: f64,
    /// Where the previous window would have continued, in frames into `input`.
    natural_next: Option<usize>,
    accum: Vec<f32>,
    output: VecDeque<f32>,
    /// Output frames still to be discarded after priming.
    discard: usize,
    primed: bool,
    finished: bool,

    /// Output frames owed for all input so far, at the ratio in force when fed.
    expected_out: f64,
    produced_out: usize,
}

impl OverlapAddStretcher {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, StretchError> {
        if sample_rate < 1_000 || channels == 0 {
            return Err(StretchError::UnsupportedFormat {
                sample_rate,
                channels,
            });
        }
        let window_len = ((sample_rate as usize / 50) & !1).max(64);
        let hop = window_len / 2;
        let window = (0..window_len)
            .map(|i| {
                let phase = std::f64::consts::TAU * i as f64 / window_len as f64;
                (0.5 - 0.5 * phase.cos()) as f32
            })
            .collect();

        Ok(Self {
            channels: channels as usize,
            window_len,
            hop,
            tolerance: window_len / 8,
            window,
            speed: 1.0,
            input: Vec::new(),
            next_pos: 0.0,
            natural_next: None,
            accum: vec![0.0; window_len * channels as usize],
            output: VecDeque::new(),
            discard: 0,
            primed: false,
            finished: false,
            expected_out: 0.0,
            produced_out: 0,
        })
    }

    fn input_frames(&self) -> usize {
        self.input.len() / self.channels
    }

    /// Normalised cross-correlation of the `hop` frames at `a` and `b`.
    fn similarity(&self, a: usize, b: usize) -> f64 {
        let ch = self.channels;
        let (mut dot, mut ea, mut eb) = (0.0f64, 0.0f64, 0.0f64);
        for i in 0..self.hop * ch {
            let x = self.input[a * ch + i] as f64;
            let y = self.input[b * ch + i] as f64;
            dot += x * y;
            ea += x * x;
            eb += y * y;
        }
        dot / ((ea * eb).sqrt() + 1e-12)
    }

    fn best_start(&self, nominal: usize) -> usize {
        let Some(natural) = self.natural_next else {
            return nominal;
        };
        let mut best = nominal;
        let mut best_score = self.similarity(nominal, natural);
        for delta in 1..=self.tolerance {
            for candidate in [nominal.checked_sub(delta), Some(nominal + delta)]
                .into_iter()
                .flatten()
            {
                let score = self.similarity(candidate, natural);
                if score > best_score + 1e-6 {
                    best = candidate;
                    best_score = score;
                }
            }
        }
        best
    }

    /// Runs as many windows as the buffered input allows.
    fn run(&mut self) {
        let ch = self.channels;
        loop {
            let nominal = self.next_pos.round() as usize;
            let needed = (nominal + self.tolerance + self.window_len)
                .max(self.natural_next.map_or(0, |n| n + self.window_len));
            if needed > self.input_frames() {
                break;
            }

            let start = self.best_start(nominal);
            for i in 0..self.window_len {
                let w = self.window[i];
                for c in 0..ch {
                    self.accum[i * ch + c] += self.input[(start + i) * ch + c] * w;
                }
            }

            // The first hop of the accumulator can no longer change.
            let done: Vec<f32> = self.accum.drain(..self.hop * ch).collect();
            self.accum.extend(std::iter::repeat(0.0).take(self.hop * ch));
            let skip = self.discard.min(self.hop);
            self.discard -= skip;
            self.output.extend(&done[skip * ch..]);

            self.natural_next = Some(start + self.hop);
            self.next_pos += self.hop as f64 * self.speed;

            let keep_from = (self.next_pos.floor() as usize)
                .saturating_sub(self.tolerance)
                .min(start + self.hop);
            if keep_from > 0 {
                self.input.drain(..keep_from * ch);
                self.next_pos -= keep_from as f64;
                self.natural_next = self.natural_next.map(|n| n - keep_from);
            }
        }
    }
}

impl StretchBackend for OverlapAddStretcher {
    fn set_time_ratio(&mut self, ratio: f64) {
        if ratio.is_finite() && ratio > 0.0 {
            self.speed = 1.0 / ratio;
        }
    }

    fn process(&mut self, input: &[f32], final_block: bool) -> Result<(), StretchError> {
        if self.finished {
            return Err(StretchError::Failure(
                "process called after the final block without a reset".to_string(),
            ));
        }
        if input.len() % self.channels != 0 {
            return Err(StretchError::Failure(format!(
                "input of {} samples is not a whole number of {}-channel frames",
                input.len(),
                self.channels
            )));
        }
        if !self.primed {
            // Half a window of silence lines the first window up with the
            // input start; its output is discarded.
            self.input
                .extend(std::iter::repeat(0.0).take(self.hop * self.channels));
            self.discard = self.hop;
            self.primed = true;
        }

        self.input.extend_from_slice(input);
        self.expected_out += (input.len() / self.channels) as f64 / self.speed;
        self.run();

        if final_block {
            let pad = self.window_len + self.tolerance + (self.hop as f64 * self.speed) as usize;
            self.input
                .extend(std::iter::repeat(0.0).take(pad * self.channels));
            self.run();
            self.output.extend(self.accum.drain(..));
            self.accum.resize(self.window_len * self.channels, 0.0);

            let owed = self.expected_out.round() as usize;
            let ready = self.produced_out + self.output.len() / self.channels;
            if ready > owed {
                let excess = (ready - owed).min(self.output.len() / self.channels);
                self.output.truncate(self.output.len() - excess * self.channels);
            }
            self.finished = true;
        }
        Ok(())
    }

    fn available(&self) -> usize {
        self.output.len() / self.channels
    }

    fn retrieve(&mut self, max_frames: usize) -> Vec<f32> {
        let frames = max_frames.min(self.available());
        self.produced_out += frames;
        self.output.drain(..frames * self.channels).collect()
    }

    fn latency(&self) -> usize {
        let owed = self.expected_out - (self.produced_out + self.available()) as f64;
        owed.max(0.0).round() as usize
    }

    fn reset(&mut self) {
        self.input.clear();
        self.next_pos = 0.0;
        self.natural_next = None;
        self.accum.iter_mut().for_each(|s| *s = 0.0);
        self.output.clear();
        self.discard = 0;
        self.primed = false;
        self.finished = false;
        self.expected_out = 0.0;
        self.produced_out = 0;
    }
}

/// A fixed-size block of stretched audio and the source range it came from.
#[derive(Debug, Clone)]
pub struct StretchedBlock {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub source_start: Duration,
    pub source_end: Duration,
    /// Playback rate the block was produced at.
    pub rate: f64,
}

impl StretchedBlock {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        frames_to_duration(self.frames(), self.sample_rate)
    }
}

/// Input accounting: which output frames belong to which source range.
#[derive(Debug)]
struct Anchor {
    source_start: Duration,
    source_len: Duration,
    rate: f64,
    out_expected: f64,
    out_taken: f64,
}

impl Anchor {
    fn position(&self) -> Duration {
        if self.out_expected <= 0.0 {
            return self.source_start + self.source_len;
        }
        let progress = (self.out_taken / self.out_expected).clamp(0.0, 1.0);
        self.source_start + self.source_len.mul_f64(progress)
    }
}

/// Accumulated drift between owed and produced output, and the correction
/// applied to the next block.
#[derive(Debug, Default)]
struct DriftFix {
    threshold_frames: f64,
    max_fix: f64,
    expected: f64,
    produced: f64,
}

impl DriftFix {
    /// Ratio multiplier for a block expected to yield `block_out` frames.
    fn modifier(&self, block_out: f64, latency: f64) -> f64 {
        let drift = self.expected - (self.produced + latency);
        if drift.abs() <= self.threshold_frames || block_out <= 0.0 {
            return 1.0;
        }
        let fixed = (block_out + drift).clamp(
            block_out * (1.0 - self.max_fix),
            block_out * (1.0 + self.max_fix),
        );
        fixed / block_out
    }
}

/// Stateful stretch stage of the audio output path.
pub struct AudioStretcher {
    backend: Box<dyn StretchBackend>,
    sample_rate: u32,
    channels: u16,
    block_frames: usize,
    rate: f64,
    passthrough: bool,
    anchors: VecDeque<Anchor>,
    pending: Vec<f32>,
    drift: DriftFix,
    smoothing_frames: usize,
    last_frame: Vec<f32>,
    next_source: Option<Duration>,
}

impl AudioStretcher {
    pub fn new(
        backend: Box<dyn StretchBackend>,
        sample_rate: u32,
        channels: u16,
        config: &PlayerConfig,
    ) -> Self {
        Self {
            backend,
            sample_rate,
            channels,
            block_frames: config.stretch_block_frames,
            rate: 1.0,
            passthrough: false,
            anchors: VecDeque::new(),
            pending: Vec::new(),
            drift: DriftFix {
                threshold_frames: config.drift_fix_threshold.as_secs_f64() * sample_rate as f64,
                max_fix: config.max_drift_fix,
                ..DriftFix::default()
            },
            smoothing_frames: duration_to_frames(config.transition_smoothing, sample_rate),
            last_frame: Vec::new(),
            next_source: None,
        }
    }

    /// Builds an adapter around the built-in WSOLA backend.
    pub fn with_builtin_backend(
        sample_rate: u32,
        channels: u16,
        config: &PlayerConfig,
    ) -> Result<Self, StretchError> {
        let backend = OverlapAddStretcher::new(sample_rate, channels)?;
        Ok(Self::new(Box::new(backend), sample_rate, channels, config))
    }

    /// Builds an adapter around the best backend compiled in.
    pub fn with_default_backend(
        sample_rate: u32,
        channels: u16,
        config: &PlayerConfig,
    ) -> Result<Self, StretchError> {
        #[cfg(feature = "signalsmith")]
        match SignalsmithStretcher::new(sample_rate, channels) {
            Ok(backend) => return Ok(Self::new(Box::new(backend), sample_rate, channels, config)),
            Err(e) => tracing::warn!("signalsmith stretch unavailable ({}), using WSOLA", e),
        }
        Self::with_builtin_backend(sample_rate, channels, config)
    }

    /// An adapter that never stretches, for formats no backend accepts.
    pub fn new_passthrough(sample_rate: u32, channels: u16, config: &PlayerConfig) -> Self {
        let mut stretcher = Self::new(Box::new(Bypass), sample_rate, channels.max(1), config);
        stretcher.passthrough = true;
        stretcher
    }

    /// Rate in force for the next input block.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Changes the rate from the next input block on, without draining.
    pub fn set_rate(&mut self, rate: f64) {
        if rate.is_finite() && rate > 0.0 && rate != self.rate {
            tracing::trace!("stretch rate {} -> {}", self.rate, rate);
            self.rate = rate;
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }

    /// Bypasses the backend from now on; audio plays at rate 1.0.
    pub fn enable_passthrough(&mut self) {
        if !self.passthrough {
            tracing::warn!("time-stretch disabled, audio continues unstretched");
            self.passthrough = true;
            self.backend.reset();
            self.anchors.clear();
            self.pending.clear();
        }
    }

    /// Output still owed for input already pushed.
    pub fn latency(&self) -> Duration {
        let frames = if self.passthrough {
            0
        } else {
            self.backend.latency()
        };
        frames_to_duration(frames + self.pending.len() / self.channels as usize, self.sample_rate)
    }

    /// Feeds one block of input at `rate`, returning any completed output blocks.
    pub fn push(&mut self, frame: &AudioFrame, rate: f64) -> Result<Vec<StretchedBlock>, StretchError> {
        if frame.sample_rate != self.sample_rate || frame.channels != self.channels {
            return Err(StretchError::UnsupportedFormat {
                sample_rate: frame.sample_rate,
                channels: frame.channels,
            });
        }
        self.set_rate(rate);
        let rate = if self.passthrough { 1.0 } else { self.rate };

        let mut samples = frame.samples.clone();
        let jumped = self.next_source.map_or(false, |expected| {
            frame.source_ts > expected + frames_to_duration(1, self.sample_rate)
        });
        if jumped && !frame.discontinuity {
            smooth_transition(
                &self.last_frame,
                &mut samples,
                self.channels as usize,
                self.smoothing_frames,
            );
        }

        let frames_in = frame.frames();
        let block_out = frames_in as f64 / rate;
        let ratio = if self.passthrough {
            1.0
        } else {
            let owed = self.backend.latency() + self.pending.len() / self.channels as usize;
            let modifier = self.drift.modifier(block_out, owed as f64);
            if modifier != 1.0 {
                tracing::debug!("stretch drift fix: ratio x{:.3}", modifier);
            }
            modifier / rate
        };

        if self.passthrough {
            self.pending.extend_from_slice(&samples);
        } else {
            self.backend.set_time_ratio(ratio);
            self.backend.process(&samples, false)?;
            let available = self.backend.available();
            self.pending.extend(self.backend.retrieve(available));
        }

        self.anchors.push_back(Anchor {
            source_start: frame.source_ts,
            source_len: frame.duration(),
            rate,
            out_expected: frames_in as f64 * ratio,
            out_taken: 0.0,
        });
        self.drift.expected += frames_in as f64 * ratio;
        self.next_source = Some(frame.end_ts());
        let channels = self.channels as usize;
        if samples.len() >= channels {
            self.last_frame = samples[samples.len() - channels..].to_vec();
        }

        Ok(self.drain_blocks(false))
    }

    /// Flushes the backend at end of stream and returns everything left.
    pub fn finish(&mut self) -> Result<Vec<StretchedBlock>, StretchError> {
        if !self.passthrough {
            self.backend.process(&[], true)?;
            let available = self.backend.available();
            self.pending.extend(self.backend.retrieve(available));
        }
        let blocks = self.drain_blocks(true);
        self.reset();
        Ok(blocks)
    }

    /// Drops all buffered audio and backend state (seek, skip-jump).
    pub fn reset(&mut self) {
        if !self.passthrough {
            self.backend.reset();
        }
        self.anchors.clear();
        self.pending.clear();
        self.drift.expected = 0.0;
        self.drift.produced = 0.0;
        self.last_frame.clear();
        self.next_source = None;
    }

    fn drain_blocks(&mut self, include_partial: bool) -> Vec<StretchedBlock> {
        let channels = self.channels as usize;
        let block_len = self.block_frames * channels;
        let mut blocks = Vec::new();
        while self.pending.len() >= block_len || (include_partial && !self.pending.is_empty()) {
            let take = block_len.min(self.pending.len());
            let samples: Vec<f32> = self.pending.drain(..take).collect();
            let frames = samples.len() / channels;
            let (source_start, mut source_end, rate) = self.take_source_range(frames as f64);
            if include_partial && self.pending.is_empty() {
                // Rounding leaves a sliver of the last anchor unclaimed.
                if let Some(last) = self.anchors.back() {
                    source_end = last.source_start + last.source_len;
                }
                self.anchors.clear();
            }
            self.drift.produced += frames as f64;
            blocks.push(StretchedBlock {
                samples,
                sample_rate: self.sample_rate,
                channels: self.channels,
                source_start,
                source_end,
                rate,
            });
        }
        blocks
    }

    /// Consumes `frames` of output from the anchor queue.
    fn take_source_range(&mut self, mut frames: f64) -> (Duration, Duration, f64) {
        let Some(front) = self.anchors.front() else {
            let at = self.next_source.unwrap_or_default();
            return (at, at, self.rate);
        };
        let start = front.position();
        let rate = front.rate;
        let mut end = start;

        while frames > 0.0 {
            let Some(anchor) = self.anchors.front_mut() else {
                break;
            };
            let left = anchor.out_expected - anchor.out_taken;
            if frames >= left {
                frames -= left;
                end = anchor.source_start + anchor.source_len;
                self.anchors.pop_front();
            } else {
                anchor.out_taken += frames;
                end = anchor.position();
                frames = 0.0;
            }
        }
        (start, end, rate)
    }
}

/// Stands in for a backend while the adapter is in passthrough.
struct Bypass;

impl StretchBackend for Bypass {
    fn set_time_ratio(&mut self, _ratio: f64) {}

    fn process(&mut self, _input: &[f32], _final_block: bool) -> Result<(), StretchError> {
        Err(StretchError::Failure("no time-stretch backend".into()))
    }

    fn available(&self) -> usize {
        0
    }

    fn retrieve(&mut self, _max_frames: usize) -> Vec<f32> {
        Vec::new()
    }

    fn latency(&self) -> usize {
        0
    }

    fn reset(&mut self) {}
}

/// Ramps the first `steps` frames of `samples` from `last` toward the signal.
pub fn smooth_transition(last: &[f32], samples: &mut [f32], channels: usize, steps: usize) {
    if last.len() != channels || channels == 0 {
        return;
    }
    let frames = samples.len() / channels;
    let steps = steps.min(frames);
    for i in 0..steps {
        let t = (i + 1) as f32 / (steps + 1) as f32;
        for c in 0..channels {
            let s = &mut samples[i * channels + c];
            *s = last[c] * (1.0 - t) + *s * t;
        }
    }
}
