//! Elastic frame buffers.
//!
//! Each stream gets its own bounded FIFO between the decode context and its
//! consumer. Capacity is measured in media time rather than frame count, so a
//! queue of tiny audio blocks and a queue of long video frames apply the same
//! real-time backpressure.
//!
//! Every flush bumps the buffer's generation. Producers tag pushes with the
//! generation they decoded under, and a push carrying an old generation is
//! rejected under the same lock that performed the flush, so frames decoded
//! before a seek can never re-enter a flushed queue.
//!
//! The queued duration stays within capacity with one exception: an empty
//! queue accepts any single frame, however long. Without it a frame longer
//! than the capacity (a still image, a coarse audio packet) would block its
//! producer forever. While such a frame is queued, every further push waits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::BufferConfig;
use crate::frame::{AudioFrame, StreamKind, VideoFrame};

/// Anything that can sit in an elastic buffer.
pub trait Timed {
    fn source_ts(&self) -> Duration;
    fn duration(&self) -> Duration;
}

impl Timed for AudioFrame {
    fn source_ts(&self) -> Duration {
        self.source_ts
    }

    fn duration(&self) -> Duration {
        AudioFrame::duration(self)
    }
}

impl Timed for VideoFrame {
    fn source_ts(&self) -> Duration {
        self.source_ts
    }

    fn duration(&self) -> Duration {
        self.duration
    }
}

/// Result of a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The frame was decoded before the latest flush and was discarded.
    Stale,
    /// The buffer has been stopped for shutdown.
    Stopped,
}

struct Queue<T> {
    frames: VecDeque<T>,
    queued: Duration,
    generation: u64,
    producer_blocked: bool,
}

/// A bounded, duration-measured FIFO of decoded frames.
pub struct ElasticBuffer<T> {
    stream: StreamKind,
    config: BufferConfig,
    queue: Mutex<Queue<T>>,
    frame_available: Condvar,
    space_available: Condvar,
    /// Mirror of `Queue::generation` for lock-free reads.
    generation: AtomicU64,
    eos: AtomicBool,
    stopped: AtomicBool,
    /// Largest queued duration ever observed, in microseconds.
    high_water_us: AtomicU64,
}

pub type AudioBuffer = ElasticBuffer<AudioFrame>;
pub type VideoBuffer = ElasticBuffer<VideoFrame>;

impl<T: Timed> ElasticBuffer<T> {
    pub fn new(stream: StreamKind, config: BufferConfig) -> Self {
        Self {
            stream,
            config,
            queue: Mutex::new(Queue {
                frames: VecDeque::new(),
                queued: Duration::ZERO,
                generation: 0,
                producer_blocked: false,
            }),
            frame_available: Condvar::new(),
            space_available: Condvar::new(),
            generation: AtomicU64::new(0),
            eos: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            high_water_us: AtomicU64::new(0),
        }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Current flush generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Pushes a frame decoded under `generation`.
    ///
    /// Blocks while the frame would push the queue past capacity. An empty
    /// queue always accepts, so a single frame longer than the capacity still
    /// flows.
    pub fn push(&self, frame: T, generation: u64) -> PushOutcome {
        let mut queue = self.queue.lock();
        loop {
            if self.stopped.load(Ordering::Acquire) {
                return PushOutcome::Stopped;
            }
            if queue.generation != generation {
                tracing::trace!(
                    "{} buffer: rejecting stale frame at {:?} (gen {} != {})",
                    self.stream,
                    frame.source_ts(),
                    generation,
                    queue.generation
                );
                return PushOutcome::Stale;
            }
            if queue.frames.is_empty() || queue.queued + frame.duration() <= self.config.capacity {
                break;
            }
            queue.producer_blocked = true;
            self.space_available.wait(&mut queue);
        }
        queue.producer_blocked = false;

        queue.queued += frame.duration();
        queue.frames.push_back(frame);
        self.high_water_us
            .fetch_max(queue.queued.as_micros() as u64, Ordering::Relaxed);
        self.frame_available.notify_one();
        PushOutcome::Queued
    }

    /// Returns true if a frame of `duration` can be pushed without blocking.
    pub fn has_space_for(&self, duration: Duration) -> bool {
        let queue = self.queue.lock();
        queue.frames.is_empty() || queue.queued + duration <= self.config.capacity
    }

    /// Waits up to `timeout` for any space to open up.
    pub fn wait_for_space(&self, timeout: Duration) {
        let mut queue = self.queue.lock();
        if queue.queued < self.config.capacity || self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.space_available.wait_for(&mut queue, timeout);
    }

    /// Takes the oldest frame, if any.
    pub fn pop(&self) -> Option<T> {
        let mut queue = self.queue.lock();
        let frame = queue.frames.pop_front()?;
        queue.queued = queue.queued.saturating_sub(frame.duration());
        self.space_available.notify_one();
        Some(frame)
    }

    /// Takes the oldest frame only if it is still the one a consumer peeked:
    /// same source timestamp, and no flush since `generation` was read.
    pub fn pop_head(&self, source_ts: Duration, generation: u64) -> Option<T> {
        let mut queue = self.queue.lock();
        if queue.generation != generation || queue.frames.front()?.source_ts() != source_ts {
            return None;
        }
        let frame = queue.frames.pop_front()?;
        queue.queued = queue.queued.saturating_sub(frame.duration());
        self.space_available.notify_one();
        Some(frame)
    }

    /// Takes the oldest frame, waiting up to `timeout` for one to arrive.
    ///
    /// Returns immediately with `None` at end of stream or after a stop.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut queue = self.queue.lock();
        if queue.frames.is_empty() {
            if self.eos.load(Ordering::Acquire) || self.stopped.load(Ordering::Acquire) {
                return None;
            }
            self.frame_available.wait_for(&mut queue, timeout);
        }
        let frame = queue.frames.pop_front()?;
        queue.queued = queue.queued.saturating_sub(frame.duration());
        self.space_available.notify_one();
        Some(frame)
    }

    /// Source timestamp of the oldest frame.
    pub fn peek_ts(&self) -> Option<Duration> {
        self.queue.lock().frames.front().map(Timed::source_ts)
    }

    /// Source timestamps of the oldest and newest frames.
    pub fn ts_range(&self) -> Option<(Duration, Duration)> {
        let queue = self.queue.lock();
        Some((
            queue.frames.front()?.source_ts(),
            queue.frames.back()?.source_ts(),
        ))
    }

    pub fn len(&self) -> usize {
        self.queue.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Media time currently queued.
    pub fn queued_duration(&self) -> Duration {
        self.queue.lock().queued
    }

    /// Largest queued duration observed since creation.
    pub fn high_water(&self) -> Duration {
        Duration::from_micros(self.high_water_us.load(Ordering::Relaxed))
    }

    /// Below the low watermark with more media still to come.
    pub fn is_low(&self) -> bool {
        !self.is_eos() && self.queued_duration() < self.config.low_watermark
    }

    /// Full enough to leave `Buffering`: past the resume watermark, holding
    /// back a blocked producer, or at end of stream.
    pub fn is_ready(&self) -> bool {
        let queue = self.queue.lock();
        self.eos.load(Ordering::Acquire)
            || queue.queued >= self.config.resume_watermark
            || queue.producer_blocked
    }

    /// Discards every queued frame and starts a new generation.
    ///
    /// Clears end-of-stream and wakes blocked producers, which will find their
    /// generation stale. Returns the new generation.
    pub fn flush(&self) -> u64 {
        let (dropped, generation) = {
            let mut queue = self.queue.lock();
            let dropped = queue.frames.len();
            queue.frames.clear();
            queue.queued = Duration::ZERO;
            queue.generation += 1;
            queue.producer_blocked = false;
            self.generation.store(queue.generation, Ordering::Release);
            self.eos.store(false, Ordering::Release);
            (dropped, queue.generation)
        };
        self.space_available.notify_all();
        self.frame_available.notify_all();

        tracing::debug!(
            "{} buffer flushed: dropped {} frames, generation {}",
            self.stream,
            dropped,
            generation
        );
        generation
    }

    /// Drops queued frames whose source timestamp lies in `[start, end)`.
    pub fn discard_range(&self, start: Duration, end: Duration) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.frames.len();
        queue.frames.retain(|f| {
            let ts = f.source_ts();
            ts < start || ts >= end
        });
        queue.queued = queue.frames.iter().map(Timed::duration).sum();
        let dropped = before - queue.frames.len();
        if dropped > 0 {
            self.space_available.notify_all();
            tracing::debug!(
                "{} buffer: discarded {} frames in [{:?}, {:?})",
                self.stream,
                dropped,
                start,
                end
            );
        }
        dropped
    }

    /// Marks end of stream, unless a flush has happened since `generation`.
    pub fn set_eos(&self, generation: u64) {
        let queue = self.queue.lock();
        if queue.generation == generation {
            self.eos.store(true, Ordering::Release);
            self.frame_available.notify_all();
        }
    }

    pub fn is_eos(&self) -> bool {
        self.eos.load(Ordering::Acquire)
    }

    /// End of stream reached and every frame consumed.
    pub fn is_drained(&self) -> bool {
        self.is_eos() && self.is_empty()
    }

    /// Stops the buffer, waking every blocked producer and consumer.
    pub fn stop(&self) {
        let _queue = self.queue.lock();
        self.stopped.store(true, Ordering::Release);
        self.space_available.notify_all();
        self.frame_available.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Picture;
    use std::sync::Arc;
    use std::thread;

    fn make_test_frame(ms: u64) -> VideoFrame {
        VideoFrame::new(
            Duration::from_millis(ms),
            Duration::from_millis(40),
            Picture::solid_rgba(2, 2, [0, 0, 0, 255]),
        )
    }

    fn video_buffer() -> VideoBuffer {
        ElasticBuffer::new(StreamKind::Video, BufferConfig::for_video())
    }

    #[test]
    fn test_buffer_push_pop() {
        let buffer = video_buffer();
        assert_eq!(buffer.push(make_test_frame(0), 0), PushOutcome::Queued);
        assert_eq!(buffer.push(make_test_frame(40), 0), PushOutcome::Queued);

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.queued_duration(), Duration::from_millis(80));
        assert_eq!(buffer.peek_ts(), Some(Duration::ZERO));

        let Some(frame) = buffer.pop() else {
            panic!("expected a frame");
        };
        assert_eq!(frame.source_ts, Duration::ZERO);
        assert_eq!(buffer.queued_duration(), Duration::from_millis(40));
    }

    #[test]
    fn test_buffer_flush_rejects_stale_generation() {
        let buffer = video_buffer();
        buffer.push(make_test_frame(0), 0);
        buffer.set_eos(0);

        let generation = buffer.flush();
        assert_eq!(generation, 1);
        assert!(buffer.is_empty());
        assert!(!buffer.is_eos());

        assert_eq!(buffer.push(make_test_frame(40), 0), PushOutcome::Stale);
        assert!(buffer.is_empty());
        assert_eq!(buffer.push(make_test_frame(40), 1), PushOutcome::Queued);

        // A stale end-of-stream is ignored too.
        buffer.set_eos(0);
        assert!(!buffer.is_eos());
    }

    #[test]
    fn test_backpressure_never_exceeds_capacity() {
        let buffer = Arc::new(video_buffer());
        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for i in 0..50 {
                    if buffer.push(make_test_frame(i * 40), 0) != PushOutcome::Queued {
                        break;
                    }
                }
            })
        };

        let mut received = 0;
        while received < 50 {
            if buffer.pop_timeout(Duration::from_millis(100)).is_some() {
                received += 1;
                thread::sleep(Duration::from_millis(1));
            }
        }
        producer.join().unwrap();

        assert!(buffer.high_water() <= BufferConfig::for_video().capacity);
    }

    #[test]
    fn test_blocked_producer_released_by_flush() {
        let buffer = Arc::new(video_buffer());
        // 7 frames of 40ms fill the 300ms capacity.
        for i in 0..7 {
            buffer.push(make_test_frame(i * 40), 0);
        }
        assert!(!buffer.has_space_for(Duration::from_millis(40)));

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.push(make_test_frame(280), 0))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(buffer.is_ready());

        buffer.flush();
        assert_eq!(producer.join().unwrap(), PushOutcome::Stale);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_oversized_frame_admitted_only_into_empty_queue() {
        let buffer = Arc::new(video_buffer());
        let capacity = BufferConfig::for_video().capacity;
        let still = VideoFrame::new(
            Duration::ZERO,
            Duration::from_secs(1),
            Picture::solid_rgba(2, 2, [0, 0, 0, 255]),
        );
        assert_eq!(buffer.push(still, 0), PushOutcome::Queued);
        assert!(buffer.queued_duration() > capacity);
        assert!(!buffer.has_space_for(Duration::from_millis(1)));

        let producer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.push(make_test_frame(1_000), 0))
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(buffer.len(), 1);

        assert!(buffer.pop().is_some());
        assert_eq!(producer.join().unwrap(), PushOutcome::Queued);
        assert_eq!(buffer.queued_duration(), Duration::from_millis(40));
    }

    #[test]
    fn test_pop_head_refuses_replaced_head() {
        let buffer = video_buffer();
        buffer.push(make_test_frame(0), 0);
        assert!(buffer.pop_head(Duration::from_millis(40), 0).is_none());
        assert_eq!(buffer.len(), 1);

        // Flushed and refilled at the same position between peek and pop.
        let generation = buffer.generation();
        let peeked = buffer.peek_ts().unwrap();
        let new_generation = buffer.flush();
        buffer.push(make_test_frame(0), new_generation);
        assert!(buffer.pop_head(peeked, generation).is_none());
        assert_eq!(buffer.len(), 1);

        assert!(buffer.pop_head(peeked, new_generation).is_some());
        assert!(buffer.is_empty());
        assert!(buffer.pop_head(peeked, new_generation).is_none());
    }

    #[test]
    fn test_watermarks() {
        let buffer = video_buffer();
        assert!(buffer.is_low());
        assert!(!buffer.is_ready());

        buffer.push(make_test_frame(0), 0);
        assert!(!buffer.is_low());
        assert!(!buffer.is_ready());

        buffer.push(make_test_frame(40), 0);
        buffer.push(make_test_frame(80), 0);
        assert!(buffer.is_ready());

        buffer.flush();
        buffer.set_eos(1);
        assert!(!buffer.is_low());
        assert!(buffer.is_ready());
        assert!(buffer.is_drained());
    }

    #[test]
    fn test_discard_range() {
        let buffer = video_buffer();
        for i in 0..5 {
            buffer.push(make_test_frame(i * 40), 0);
        }
        assert_eq!(
            buffer.discard_range(Duration::from_millis(40), Duration::from_millis(120)),
            2
        );
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.queued_duration(), Duration::from_millis(120));
    }

    #[test]
    fn test_stop_wakes_consumer() {
        let buffer = Arc::new(video_buffer());
        let consumer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || buffer.pop_timeout(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        buffer.stop();
        assert!(consumer.join().unwrap().is_none());
        assert_eq!(buffer.push(make_test_frame(0), 0), PushOutcome::Stopped);
    }
}
