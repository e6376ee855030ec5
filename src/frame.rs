//! Frames and the per-camera frame bus.
//!
//! - `CapturedImage`: what a `FrameSource` hands back from one read.
//! - `Frame`: an image stamped with camera identity, sequence and capture instant.
//! - `FrameBus`: small bounded latest-wins buffer between acquisition and detection.
//!
//! Pixel data is shared (`Arc<[u8]>`) so the detection path and the live preview can
//! both hold the same frame without copying. Frames are never logged by content.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::queue::ArrayQueue;
use image::RgbImage;

/// Slots per camera on the detection bus. Two is enough to absorb one slow poll.
pub const FRAME_BUS_CAPACITY: usize = 2;

// ----------------------------------------------------------------------------
// CapturedImage / Frame
// ----------------------------------------------------------------------------

/// Byte length of a packed RGB8 buffer, `None` if it does not fit in memory.
pub fn rgb_len(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(3))
}

/// Decoded image as returned by a frame source. Pixels are packed RGB8.
#[derive(Clone, Debug)]
pub struct CapturedImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl CapturedImage {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }
}

/// One captured frame of one camera.
///
/// Cloning is cheap: the pixel buffer is reference counted.
#[derive(Clone)]
pub struct Frame {
    camera: Arc<str>,
    seq: u64,
    captured_at: Instant,
    width: u32,
    height: u32,
    pixels: Arc<[u8]>,
}

impl Frame {
    pub fn new(camera: impl Into<Arc<str>>, seq: u64, image: CapturedImage) -> Self {
        Self {
            camera: camera.into(),
            seq,
            captured_at: Instant::now(),
            width: image.width,
            height: image.height,
            pixels: image.pixels.into(),
        }
    }

    pub fn camera(&self) -> &str {
        &self.camera
    }

    /// Per-stream sequence number, increasing in capture order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Monotonic capture instant.
    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// True when the buffer holds exactly `width * height` RGB8 pixels.
    pub fn is_rgb(&self) -> bool {
        rgb_len(self.width, self.height) == Some(self.pixels.len())
    }

    /// Copy into an `RgbImage`; `None` for an empty or malformed buffer.
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        if !self.is_rgb() || self.width == 0 || self.height == 0 {
            return None;
        }
        RgbImage::from_raw(self.width, self.height, self.pixels.to_vec())
    }
}

// Pixel content stays out of Debug output on purpose.
impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("camera", &self.camera)
            .field("seq", &self.seq)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("bytes", &self.pixels.len())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// FrameBus: latest-wins bounded buffer
// ----------------------------------------------------------------------------

/// Counters for one bus.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameBusMetrics {
    pub pushed: u64,
    pub popped: u64,
    pub evicted: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Bounded single-producer buffer with latest-wins overflow.
///
/// `push` never blocks: when the bus is full the oldest frame is evicted.
/// `try_pop` never blocks: an empty bus is a normal outcome.
pub struct FrameBus {
    slots: ArrayQueue<Frame>,
    pushed: AtomicU64,
    popped: AtomicU64,
    evicted: AtomicU64,
}

impl FrameBus {
    pub fn new() -> Self {
        Self::with_capacity(FRAME_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: ArrayQueue::new(capacity.max(1)),
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Push a frame, evicting the oldest buffered frame when full.
    ///
    /// Returns the evicted frame, if any.
    pub fn push(&self, frame: Frame) -> Option<Frame> {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        let evicted = self.slots.force_push(frame);
        if evicted.is_some() {
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        evicted
    }

    /// Take the oldest buffered frame, if any.
    pub fn try_pop(&self) -> Option<Frame> {
        let frame = self.slots.pop();
        if frame.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn metrics(&self) -> FrameBusMetrics {
        FrameBusMetrics {
            pushed: self.pushed.load(Ordering::Relaxed),
            popped: self.popped.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            len: self.slots.len(),
            capacity: self.slots.capacity(),
        }
    }
}

impl Default for FrameBus {
    fn default() -> Self {
        Self::new()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn make_frame(seq: u64) -> Frame {
        Frame::new("front", seq, CapturedImage::new(4, 2, vec![seq as u8; 24]))
    }

    #[test]
    fn frame_reports_rgb_layout() {
        let frame = make_frame(1);
        assert!(frame.is_rgb());
        assert_eq!(frame.camera(), "front");

        let odd = Frame::new("front", 2, CapturedImage::new(4, 2, vec![0; 10]));
        assert!(!odd.is_rgb());
    }

    #[test]
    fn huge_dimensions_are_not_rgb() {
        let frame = Frame::new("front", 1, CapturedImage::new(u32::MAX, u32::MAX, vec![0; 3]));
        assert!(!frame.is_rgb());
        assert!(frame.to_rgb_image().is_none());
        assert_eq!(rgb_len(2, 2), Some(12));
    }

    #[test]
    fn rgb_image_keeps_pixels() {
        let image = make_frame(5).to_rgb_image().expect("packed rgb");
        assert_eq!(image.dimensions(), (4, 2));
        assert_eq!(image.get_pixel(3, 1).0, [5, 5, 5]);
    }

    #[test]
    fn frame_debug_does_not_dump_pixels() {
        let frame = make_frame(7);
        let rendered = format!("{:?}", frame);
        assert!(rendered.contains("bytes: 24"));
        assert!(!rendered.contains("[7, 7"));
    }

    #[test]
    fn bus_never_exceeds_capacity_and_evicts_oldest() {
        let bus = FrameBus::new();
        assert!(bus.push(make_frame(1)).is_none());
        assert!(bus.push(make_frame(2)).is_none());

        let evicted = bus.push(make_frame(3)).expect("full bus evicts");
        assert_eq!(evicted.seq(), 1);
        assert_eq!(bus.len(), FRAME_BUS_CAPACITY);

        assert_eq!(bus.try_pop().map(|f| f.seq()), Some(2));
        assert_eq!(bus.try_pop().map(|f| f.seq()), Some(3));
        assert!(bus.try_pop().is_none());

        let metrics = bus.metrics();
        assert_eq!(metrics.pushed, 3);
        assert_eq!(metrics.popped, 2);
        assert_eq!(metrics.evicted, 1);
        assert_eq!(metrics.len, 0);
    }

    #[test]
    fn push_does_not_block_without_consumer() {
        let bus = FrameBus::with_capacity(2);
        for seq in 0..1_000 {
            bus.push(make_frame(seq));
            assert!(bus.len() <= 2);
        }
        assert_eq!(bus.try_pop().map(|f| f.seq()), Some(998));
        assert_eq!(bus.metrics().evicted, 998);
    }

    #[test]
    fn concurrent_producer_and_consumer_never_duplicate_frames() {
        let bus = Arc::new(FrameBus::new());
        let producer_bus = bus.clone();
        let producer = thread::spawn(move || {
            for seq in 0..5_000 {
                producer_bus.push(make_frame(seq));
            }
        });

        let mut seen = Vec::new();
        while !producer.is_finished() || !bus.is_empty() {
            if let Some(frame) = bus.try_pop() {
                seen.push(frame.seq());
            }
        }
        producer.join().unwrap();

        // Arrival order is preserved for the frames that were not dropped.
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        let metrics = bus.metrics();
        assert_eq!(metrics.popped + metrics.evicted, 5_000);
    }
}
