//! Frame consumers.
//!
//! Consumers run inline on the capture thread, once per decoded frame. The
//! frame view is only valid for the duration of the call; anything that must
//! outlive it has to be copied out.

use std::time::{Duration, Instant};

use crate::decode::DecodedFrame;

pub trait FrameConsumer {
    fn on_frame(&mut self, frame: &DecodedFrame<'_>);
}

impl<F> FrameConsumer for F
where
    F: FnMut(&DecodedFrame<'_>),
{
    fn on_frame(&mut self, frame: &DecodedFrame<'_>) {
        self(frame)
    }
}

/// Counts delivered frames and measures the delivered rate.
#[derive(Debug, Default)]
pub struct FrameStats {
    frames: u64,
    bytes: u64,
    first_at: Option<Instant>,
    last_at: Option<Instant>,
    last_size: Option<(u32, u32)>,
}

impl FrameStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Width and height of the most recent frame.
    pub fn last_size(&self) -> Option<(u32, u32)> {
        self.last_size
    }

    pub fn elapsed(&self) -> Duration {
        match (self.first_at, self.last_at) {
            (Some(first), Some(last)) => last.duration_since(first),
            _ => Duration::ZERO,
        }
    }

    /// Frames per second between the first and last delivered frame.
    pub fn rate(&self) -> Option<f64> {
        let secs = self.elapsed().as_secs_f64();
        (self.frames > 1 && secs > 0.0).then(|| (self.frames - 1) as f64 / secs)
    }
}

impl FrameConsumer for FrameStats {
    fn on_frame(&mut self, frame: &DecodedFrame<'_>) {
        let now = Instant::now();
        self.first_at.get_or_insert(now);
        self.last_at = Some(now);
        self.frames += 1;
        self.bytes += frame.data.len() as u64;
        self.last_size = Some((frame.width, frame.height));
    }
}

/// Fans every frame out to several consumers, in insertion order.
#[derive(Default)]
pub struct ConsumerChain<'a> {
    consumers: Vec<&'a mut dyn FrameConsumer>,
}

impl<'a> ConsumerChain<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, consumer: &'a mut dyn FrameConsumer) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

impl FrameConsumer for ConsumerChain<'_> {
    fn on_frame(&mut self, frame: &DecodedFrame<'_>) {
        for consumer in &mut self.consumers {
            consumer.on_frame(frame);
        }
    }
}
