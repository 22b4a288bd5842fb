//! Frames and the live single-slot frame cell.
//!
//! - `Frame`: owned pixel buffer plus dimensions, layout, sequence number and
//!   capture timestamp. Produced by a `FrameSource`, borrowed by the processor.
//! - `AnnotatedFrame`: a copy of a frame with detections rendered on top.
//! - `LatestFrameCell`: the live pipeline's handoff slot. Holds at most one
//!   frame; a newer frame replaces an unconsumed older one (last write wins).

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::PipelineError;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Byte order of the three interleaved colour channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PixelLayout {
    #[default]
    Rgb24,
    Bgr24,
}

impl PixelLayout {
    pub fn bytes_per_pixel(self) -> usize {
        3
    }

    /// Channel offsets of (red, green, blue) within one pixel.
    pub(crate) fn rgb_offsets(self) -> (usize, usize, usize) {
        match self {
            PixelLayout::Rgb24 => (0, 1, 2),
            PixelLayout::Bgr24 => (2, 1, 0),
        }
    }
}

/// One decoded image from a video source.
///
/// Pixel data is private so a frame always satisfies
/// `pixels.len() == width * height * 3`.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
    /// Monotonically increasing per source, starting at 0.
    pub sequence: u64,
    /// Capture time relative to the start of the source.
    pub timestamp: Duration,
}

impl Frame {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        layout: PixelLayout,
        sequence: u64,
        timestamp: Duration,
    ) -> Result<Self, PipelineError> {
        if width == 0 || height == 0 {
            return Err(PipelineError::Source(format!(
                "frame has empty dimensions {}x{}",
                width, height
            )));
        }
        let expected = expected_len(width, height, layout)?;
        if data.len() != expected {
            return Err(PipelineError::Source(format!(
                "frame length mismatch: expected {} bytes for {}x{}, got {}",
                expected,
                width,
                height,
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            layout,
            sequence,
            timestamp,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// RGB value at (x, y), regardless of the stored layout.
    pub fn rgb_at(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let (r, g, b) = self.layout.rgb_offsets();
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        Some([
            self.data[offset + r],
            self.data[offset + g],
            self.data[offset + b],
        ])
    }
}

fn expected_len(width: u32, height: u32, layout: PixelLayout) -> Result<usize, PipelineError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(layout.bytes_per_pixel()))
        .ok_or_else(|| PipelineError::Source("frame dimensions overflow".to_string()))
}

/// A source-resolution frame with detections rendered on it.
#[derive(Clone, Debug)]
pub struct AnnotatedFrame {
    pub frame: Frame,
    /// Number of boxes drawn.
    pub boxes_drawn: usize,
}

impl AnnotatedFrame {
    pub fn sequence(&self) -> u64 {
        self.frame.sequence
    }

    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }
}

// ----------------------------------------------------------------------------
// LatestFrameCell: live handoff slot
// ----------------------------------------------------------------------------

/// What a reader found in the cell.
#[derive(Debug)]
pub enum CellRead {
    Frame(Frame),
    /// Nothing arrived before the wait timed out.
    Empty,
    /// The producer hit a fatal source error.
    Failed(PipelineError),
    /// The cell was closed and holds nothing.
    Closed,
}

/// Counters kept by the cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CellStats {
    /// Frames handed to `put`.
    pub captured: u64,
    /// Frames replaced before anyone took them.
    pub superseded: u64,
    /// Frames handed out by `take_timeout`.
    pub taken: u64,
}

struct CellSlot {
    frame: Option<Frame>,
    failure: Option<PipelineError>,
    closed: bool,
    stats: CellStats,
    last_put: Option<Instant>,
}

/// Single-slot, last-write-wins frame cell.
///
/// One writer (the capture thread) and one active reader (the pipeline thread).
/// Memory is bounded to one buffered frame; overload shows up as
/// `CellStats::superseded`, never as a growing queue.
pub struct LatestFrameCell {
    slot: Mutex<CellSlot>,
    ready: Condvar,
}

impl LatestFrameCell {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(CellSlot {
                frame: None,
                failure: None,
                closed: false,
                stats: CellStats::default(),
                last_put: None,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellSlot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `frame`, replacing any frame not yet taken.
    ///
    /// Returns true when an older frame was superseded (dropped). Frames put
    /// after `close` are discarded.
    pub fn put(&self, frame: Frame) -> bool {
        let mut slot = self.lock();
        if slot.closed {
            return false;
        }
        slot.stats.captured += 1;
        slot.last_put = Some(Instant::now());
        let superseded = slot.frame.replace(frame).is_some();
        if superseded {
            slot.stats.superseded += 1;
        }
        drop(slot);
        self.ready.notify_one();
        superseded
    }

    /// Record a fatal producer error. The reader sees it after any pending frame.
    pub fn fail(&self, err: PipelineError) {
        let mut slot = self.lock();
        if slot.failure.is_none() {
            slot.failure = Some(err);
        }
        drop(slot);
        self.ready.notify_all();
    }

    /// Stop accepting frames and wake the reader.
    pub fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        drop(slot);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Take the latest frame, waiting up to `timeout` for one to arrive.
    pub fn take_timeout(&self, timeout: Duration) -> CellRead {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if let Some(frame) = slot.frame.take() {
                slot.stats.taken += 1;
                return CellRead::Frame(frame);
            }
            if let Some(err) = slot.failure.clone() {
                return CellRead::Failed(err);
            }
            if slot.closed {
                return CellRead::Closed;
            }
            let now = Instant::now();
            if now >= deadline {
                return CellRead::Empty;
            }
            slot = self
                .ready
                .wait_timeout(slot, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Number of frames currently buffered (0 or 1).
    pub fn len(&self) -> usize {
        usize::from(self.lock().frame.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CellStats {
        self.lock().stats
    }

    /// Time since the producer last delivered a frame.
    pub fn since_last_put(&self) -> Option<Duration> {
        self.lock().last_put.map(|at| at.elapsed())
    }
}

impl Default for LatestFrameCell {
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
    use std::sync::Arc;

    fn make_frame(sequence: u64) -> Frame {
        Frame::new(
            vec![sequence as u8; 4 * 2 * 3],
            4,
            2,
            PixelLayout::Rgb24,
            sequence,
            Duration::from_millis(sequence * 33),
        )
        .expect("valid frame")
    }

    #[test]
    fn frame_rejects_mismatched_length() {
        let err = Frame::new(vec![0; 10], 4, 2, PixelLayout::Rgb24, 0, Duration::ZERO)
            .expect_err("length mismatch");
        assert!(matches!(err, PipelineError::Source(_)));
        assert!(Frame::new(vec![], 0, 2, PixelLayout::Rgb24, 0, Duration::ZERO).is_err());
    }

    #[test]
    fn rgb_at_honours_layout() {
        let frame = Frame::new(vec![10, 20, 30], 1, 1, PixelLayout::Bgr24, 0, Duration::ZERO)
            .expect("frame");
        assert_eq!(frame.rgb_at(0, 0), Some([30, 20, 10]));
        assert_eq!(frame.rgb_at(1, 0), None);
    }

    #[test]
    fn cell_keeps_only_latest_frame() {
        let cell = LatestFrameCell::new();
        assert!(!cell.put(make_frame(0)));
        assert!(cell.put(make_frame(1)));
        assert!(cell.put(make_frame(2)));
        assert_eq!(cell.len(), 1);

        match cell.take_timeout(Duration::from_millis(1)) {
            CellRead::Frame(frame) => assert_eq!(frame.sequence, 2),
            other => panic!("expected frame, got {:?}", other),
        }
        assert!(matches!(
            cell.take_timeout(Duration::from_millis(1)),
            CellRead::Empty
        ));

        let stats = cell.stats();
        assert_eq!(stats.captured, 3);
        assert_eq!(stats.superseded, 2);
        assert_eq!(stats.taken, 1);
    }

    #[test]
    fn failure_is_reported_after_pending_frame() {
        let cell = LatestFrameCell::new();
        cell.put(make_frame(7));
        cell.fail(PipelineError::Source("camera unplugged".into()));

        assert!(matches!(
            cell.take_timeout(Duration::from_millis(1)),
            CellRead::Frame(_)
        ));
        match cell.take_timeout(Duration::from_millis(1)) {
            CellRead::Failed(PipelineError::Source(msg)) => assert_eq!(msg, "camera unplugged"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn closed_cell_discards_new_frames_and_wakes_reader() {
        let cell = Arc::new(LatestFrameCell::new());
        let reader = {
            let cell = cell.clone();
            std::thread::spawn(move || matches!(cell.take_timeout(Duration::from_secs(5)), CellRead::Closed))
        };
        std::thread::sleep(Duration::from_millis(20));
        cell.close();
        assert!(reader.join().expect("reader thread"));

        assert!(!cell.put(make_frame(1)));
        assert_eq!(cell.stats().captured, 0);
    }

    #[test]
    fn reader_wakes_when_frame_arrives() {
        let cell = Arc::new(LatestFrameCell::new());
        let writer = {
            let cell = cell.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                cell.put(make_frame(42));
            })
        };
        match cell.take_timeout(Duration::from_secs(5)) {
            CellRead::Frame(frame) => assert_eq!(frame.sequence, 42),
            other => panic!("expected frame, got {:?}", other),
        }
        writer.join().expect("writer thread");
    }
}
