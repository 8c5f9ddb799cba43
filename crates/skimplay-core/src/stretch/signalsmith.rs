//! [`StretchBackend`] on top of the Signalsmith Stretch library.
//!
//! The library is synchronous: every `process` call turns N input frames into
//! exactly as many output frames as the caller asks for, delayed by a fixed
//! amount. The adapter asks for `N * ratio` frames (carrying the fraction to
//! the next block), drops the start-up delay from the front of the stream, and
//! recovers it from the library's flush at the end.

use std::collections::VecDeque;

use signalsmith_stretch::Stretch;

use super::StretchBackend;
use crate::error::StretchError;

pub struct SignalsmithStretcher {
    stretch: Stretch,
    channels: usize,
    ratio: f64,
    /// Fractional output frame owed by the previous block.
    carry: f64,
    /// Output frames still to drop from the front of the stream.
    pre_roll: usize,
    primed: bool,
    finished: bool,
    output: VecDeque<f32>,
    expected_out: f64,
    produced_out: usize,
}

impl SignalsmithStretcher {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, StretchError> {
        if sample_rate < 1_000 || channels == 0 {
            return Err(StretchError::UnsupportedFormat {
                sample_rate,
                channels,
            });
        }
        Ok(Self {
            stretch: Stretch::preset_default(channels as u32, sample_rate),
            channels: channels as usize,
            ratio: 1.0,
            carry: 0.0,
            pre_roll: 0,
            primed: false,
            finished: false,
            output: VecDeque::new(),
            expected_out: 0.0,
            produced_out: 0,
        })
    }

    /// Runs `input` through the library at the current ratio.
    fn render(&mut self, input: &[f32]) {
        let frames_in = input.len() / self.channels;
        if frames_in == 0 {
            return;
        }
        let exact = frames_in as f64 * self.ratio + self.carry;
        let frames_out = exact.floor() as usize;
        self.carry = exact - frames_out as f64;

        let mut rendered = vec![0.0f32; frames_out * self.channels];
        self.stretch.process(input, &mut rendered);
        self.emit(&rendered);
    }

    fn emit(&mut self, rendered: &[f32]) {
        let frames = rendered.len() / self.channels;
        let dropped = self.pre_roll.min(frames);
        self.pre_roll -= dropped;
        self.output.extend(&rendered[dropped * self.channels..]);
    }

    /// Pushes the library's remaining output and trims the stream to what the
    /// input was worth.
    fn drain_tail(&mut self) {
        let ch = self.channels;
        let padding = vec![0.0f32; self.stretch.input_latency() * ch];
        self.render(&padding);
        let mut tail = vec![0.0f32; self.stretch.output_latency() * ch];
        self.stretch.flush(&mut tail);
        self.emit(&tail);

        let owed = self.expected_out.round() as usize;
        let ready = self.produced_out + self.output.len() / ch;
        if ready > owed {
            let excess = (ready - owed).min(self.output.len() / ch);
            self.output.truncate(self.output.len() - excess * ch);
        } else {
            self.output
                .extend(std::iter::repeat(0.0).take((owed - ready) * ch));
        }
    }
}

impl StretchBackend for SignalsmithStretcher {
    fn set_time_ratio(&mut self, ratio: f64) {
        if ratio.is_finite() && ratio > 0.0 {
            self.ratio = ratio;
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
            self.pre_roll = self.stretch.output_latency()
                + (self.stretch.input_latency() as f64 * self.ratio).round() as usize;
            self.primed = true;
        }

        self.expected_out += (input.len() / self.channels) as f64 * self.ratio;
        self.render(input);
        if final_block {
            self.drain_tail();
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
        self.stretch.reset();
        self.carry = 0.0;
        self.pre_roll = 0;
        self.primed = false;
        self.finished = false;
        self.output.clear();
        self.expected_out = 0.0;
        self.produced_out = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 16_000;

    fn tone(frames: usize) -> Vec<f32> {
        let step = std::f32::consts::TAU * 440.0 / RATE as f32;
        (0..frames).map(|n| (n as f32 * step).sin() * 0.5).collect()
    }

    #[test]
    fn test_output_length_follows_ratio() {
        let mut backend = SignalsmithStretcher::new(RATE, 1).unwrap();
        backend.set_time_ratio(1.0 / 1.5);
        let input = tone(RATE as usize);
        for block in input.chunks(320) {
            backend.process(block, false).unwrap();
        }
        backend.process(&[], true).unwrap();

        let expected = (RATE as f64 / 1.5).round() as usize;
        assert_eq!(backend.available(), expected);
        assert_eq!(backend.latency(), 0);
    }

    #[test]
    fn test_latency_is_owed_until_flushed() {
        let mut backend = SignalsmithStretcher::new(RATE, 2).unwrap();
        backend.process(&vec![0.1; 320 * 2], false).unwrap();
        assert!(backend.latency() > 0);
        assert_eq!(backend.latency() + backend.available(), 320);

        backend.reset();
        assert_eq!(backend.latency(), 0);
        assert_eq!(backend.available(), 0);
    }
}
