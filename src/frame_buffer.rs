//! Bounded frame buffer with a background writer.
//!
//! A [`FrameBuffer`] pre-allocates one fixed-size slot per frame of the run.
//! The producer copies each frame into the next slot and publishes the write
//! cursor; a dedicated writer thread drains slots to the sink in order.
//!
//! Cursor invariant: `0 <= frames_written <= frames_buffered <= capacity`.
//! Slots are never reused, so the producer never touches a slot the writer
//! has not drained. Once the final slot is filled the producer blocks until
//! the writer has drained every frame.

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Error type for frame buffer operations.
#[derive(Debug, Error)]
pub enum FrameBufferError {
    /// The output could not be opened.
    #[error("could not open output {path}: {source}")]
    Open {
        /// Output path.
        path: PathBuf,
        /// I/O error.
        source: io::Error,
    },
    /// Capacity or frame size was zero.
    #[error("invalid frame buffer geometry: {capacity} frames of {frame_size} bytes")]
    InvalidGeometry {
        /// Requested number of frames.
        capacity: usize,
        /// Requested frame size.
        frame_size: usize,
    },
    /// A frame did not have the configured size.
    #[error("frame size mismatch: expected {expected} bytes, got {actual}")]
    FrameSize {
        /// Configured frame size.
        expected: usize,
        /// Size of the rejected frame.
        actual: usize,
    },
    /// Every slot has already been filled.
    #[error("frame quota of {0} exhausted")]
    QuotaExhausted(usize),
    /// The sink accepted fewer bytes than a full frame.
    #[error("short write on frame {0}")]
    ShortWrite(usize),
    /// The sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The writer thread has stopped.
    #[error("writer thread stopped")]
    WriterFailed,
    /// The writer thread panicked.
    #[error("writer thread panicked")]
    WriterPanicked,
    /// The writer thread could not be started.
    #[error("could not start writer thread: {0}")]
    Spawn(io::Error),
}

/// Result type for frame buffer operations.
pub type Result<T> = std::result::Result<T, FrameBufferError>;

/// Snapshot of the buffer cursors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBufferStats {
    /// Frames copied in by the producer.
    pub frames_buffered: usize,
    /// Frames drained to the sink.
    pub frames_written: usize,
    /// Number of slots.
    pub capacity: usize,
}

struct Shared {
    slots: Box<[Mutex<Box<[u8]>>]>,
    frame_size: usize,
    frames_buffered: AtomicUsize,
    frames_written: AtomicUsize,
}

impl Shared {
    fn stats(&self) -> FrameBufferStats {
        // Read the drain cursor first so the snapshot never shows written > buffered.
        let frames_written = self.frames_written.load(Ordering::Acquire);
        let frames_buffered = self.frames_buffered.load(Ordering::Acquire);
        FrameBufferStats {
            frames_buffered,
            frames_written,
            capacity: self.slots.len(),
        }
    }
}

/// Read-only view of a frame buffer's progress, usable from any thread.
#[derive(Clone)]
pub struct BufferMonitor {
    shared: Arc<Shared>,
}

impl BufferMonitor {
    /// Current cursor snapshot.
    pub fn stats(&self) -> FrameBufferStats {
        self.shared.stats()
    }
}

/// Fixed-capacity frame store drained to a sink by a background thread.
pub struct FrameBuffer {
    shared: Arc<Shared>,
    wake: Option<Sender<()>>,
    drained: Receiver<()>,
    writer: Option<JoinHandle<Result<()>>>,
}

impl FrameBuffer {
    /// Open `path` (or stdout for `-`) and start a writer for `capacity` frames.
    pub fn open_path(path: &Path, frame_size: usize, capacity: usize) -> Result<Self> {
        if path == Path::new("-") {
            return Self::create(io::stdout(), frame_size, capacity);
        }
        let file = File::create(path).map_err(|source| FrameBufferError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::create(BufWriter::new(file), frame_size, capacity)
    }

    /// Allocate `capacity` slots of `frame_size` bytes and start a writer on `sink`.
    pub fn create<W>(sink: W, frame_size: usize, capacity: usize) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        if capacity == 0 || frame_size == 0 {
            return Err(FrameBufferError::InvalidGeometry {
                capacity,
                frame_size,
            });
        }

        let slots = (0..capacity)
            .map(|_| Mutex::new(vec![0u8; frame_size].into_boxed_slice()))
            .collect();
        let shared = Arc::new(Shared {
            slots,
            frame_size,
            frames_buffered: AtomicUsize::new(0),
            frames_written: AtomicUsize::new(0),
        });

        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        let (drained_tx, drained_rx) = crossbeam_channel::bounded(1);
        let writer_shared = Arc::clone(&shared);
        let writer = thread::Builder::new()
            .name("frame-writer".to_owned())
            .spawn(move || writer_loop(&writer_shared, sink, &wake_rx, &drained_tx))
            .map_err(FrameBufferError::Spawn)?;

        debug!(capacity, frame_size, "frame buffer created");
        Ok(Self {
            shared,
            wake: Some(wake_tx),
            drained: drained_rx,
            writer: Some(writer),
        })
    }

    /// Copy one frame into the next free slot.
    ///
    /// Filling the last slot blocks until the writer has drained every frame.
    pub fn output_buffer(&mut self, frame: &[u8]) -> Result<()> {
        let shared = &self.shared;
        if frame.len() != shared.frame_size {
            return Err(FrameBufferError::FrameSize {
                expected: shared.frame_size,
                actual: frame.len(),
            });
        }

        let index = shared.frames_buffered.load(Ordering::Relaxed);
        let slot = shared
            .slots
            .get(index)
            .ok_or(FrameBufferError::QuotaExhausted(shared.slots.len()))?;
        slot.lock()
            .map_err(|_| FrameBufferError::WriterPanicked)?
            .copy_from_slice(frame);
        shared.frames_buffered.store(index + 1, Ordering::Release);

        let wake = self.wake.as_ref().ok_or(FrameBufferError::WriterFailed)?;
        match wake.try_send(()) {
            // A pending wake already covers this frame.
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => return Err(FrameBufferError::WriterFailed),
        }

        if index + 1 == shared.slots.len() {
            debug!(
                frames = index + 1,
                "frame quota buffered, waiting for writer"
            );
            self.drained
                .recv()
                .map_err(|_| FrameBufferError::WriterFailed)?;
        }
        Ok(())
    }

    /// Frames copied in so far.
    pub fn frames_buffered(&self) -> usize {
        self.shared.frames_buffered.load(Ordering::Acquire)
    }

    /// Frames drained to the sink so far.
    pub fn frames_written(&self) -> usize {
        self.shared.frames_written.load(Ordering::Acquire)
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.shared.slots.len()
    }

    /// Size of each slot in bytes.
    pub fn frame_size(&self) -> usize {
        self.shared.frame_size
    }

    /// Whether every slot has been filled.
    pub fn is_full(&self) -> bool {
        self.frames_buffered() == self.capacity()
    }

    /// Progress view for other threads.
    pub fn monitor(&self) -> BufferMonitor {
        BufferMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Drain every buffered frame, flush the sink and join the writer.
    pub fn close(mut self) -> Result<FrameBufferStats> {
        self.finish()
    }

    fn finish(&mut self) -> Result<FrameBufferStats> {
        // Dropping the wake sender tells the writer to drain and exit.
        self.wake = None;
        let outcome = match self.writer.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| FrameBufferError::WriterPanicked)?,
            None => Ok(()),
        };
        outcome?;
        let stats = self.shared.stats();
        debug!(?stats, "frame buffer closed");
        Ok(stats)
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        if self.writer.is_some() {
            if let Err(err) = self.finish() {
                warn!(%err, "frame buffer did not close cleanly");
            }
        }
    }
}

fn writer_loop<W: Write>(
    shared: &Shared,
    mut sink: W,
    wake: &Receiver<()>,
    drained: &Sender<()>,
) -> Result<()> {
    let mut drained_sent = false;
    loop {
        let closing = wake.recv().is_err();
        if let Err(err) = drain(shared, &mut sink) {
            error!(%err, "frame writer failed");
            return Err(err);
        }
        if !drained_sent && shared.frames_written.load(Ordering::Relaxed) == shared.slots.len() {
            drained_sent = true;
            // The producer may have gone away already.
            let _ = drained.try_send(());
        }
        if closing {
            sink.flush()?;
            return Ok(());
        }
    }
}

fn drain<W: Write>(shared: &Shared, sink: &mut W) -> Result<()> {
    let buffered = shared.frames_buffered.load(Ordering::Acquire);
    let mut written = shared.frames_written.load(Ordering::Relaxed);
    while written < buffered {
        let slot = shared
            .slots
            .get(written)
            .ok_or(FrameBufferError::ShortWrite(written))?;
        let data = slot.lock().map_err(|_| FrameBufferError::WriterPanicked)?;
        sink.write_all(&data).map_err(|err| {
            if err.kind() == ErrorKind::WriteZero {
                FrameBufferError::ShortWrite(written)
            } else {
                FrameBufferError::Io(err)
            }
        })?;
        drop(data);
        written += 1;
        shared.frames_written.store(written, Ordering::Release);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink collecting everything written, shared with the test.
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("sink lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_rejects_zero_geometry() {
        assert!(matches!(
            FrameBuffer::create(SharedSink::default(), 0, 4),
            Err(FrameBufferError::InvalidGeometry { .. })
        ));
        assert!(matches!(
            FrameBuffer::create(SharedSink::default(), 4, 0),
            Err(FrameBufferError::InvalidGeometry { .. })
        ));
    }

    #[test]
    fn test_rejects_wrong_frame_size() {
        let mut buffer = FrameBuffer::create(SharedSink::default(), 4, 2).expect("create failed");
        assert!(matches!(
            buffer.output_buffer(&[1, 2, 3]),
            Err(FrameBufferError::FrameSize {
                expected: 4,
                actual: 3
            })
        ));
        assert_eq!(buffer.frames_buffered(), 0);
    }

    #[test]
    fn test_frames_written_in_order() {
        let sink = SharedSink::default();
        let mut buffer = FrameBuffer::create(sink.clone(), 3, 3).expect("create failed");
        buffer.output_buffer(&[1, 1, 1]).expect("output failed");
        buffer.output_buffer(&[2, 2, 2]).expect("output failed");
        buffer.output_buffer(&[3, 3, 3]).expect("output failed");

        // Filling the final slot waits for the writer.
        assert_eq!(buffer.frames_written(), 3);
        assert!(buffer.is_full());

        let stats = buffer.close().expect("close failed");
        assert_eq!(
            stats,
            FrameBufferStats {
                frames_buffered: 3,
                frames_written: 3,
                capacity: 3
            }
        );
        assert_eq!(
            *sink.0.lock().expect("sink lock"),
            vec![1, 1, 1, 2, 2, 2, 3, 3, 3]
        );
    }

    #[test]
    fn test_production_past_quota_is_refused() {
        let mut buffer = FrameBuffer::create(SharedSink::default(), 2, 1).expect("create failed");
        buffer.output_buffer(&[7, 7]).expect("output failed");
        assert!(matches!(
            buffer.output_buffer(&[8, 8]),
            Err(FrameBufferError::QuotaExhausted(1))
        ));
    }

    #[test]
    fn test_close_drains_partial_run() {
        let sink = SharedSink::default();
        let mut buffer = FrameBuffer::create(sink.clone(), 2, 10).expect("create failed");
        for value in 0..4u8 {
            buffer.output_buffer(&[value, value]).expect("output failed");
        }
        let stats = buffer.close().expect("close failed");
        assert_eq!(stats.frames_written, 4);
        assert_eq!(sink.0.lock().expect("sink lock").len(), 8);
    }

    #[test]
    fn test_drop_drains_buffered_frames() {
        let sink = SharedSink::default();
        {
            let mut buffer = FrameBuffer::create(sink.clone(), 1, 5).expect("create failed");
            buffer.output_buffer(&[9]).expect("output failed");
            buffer.output_buffer(&[8]).expect("output failed");
        }
        assert_eq!(*sink.0.lock().expect("sink lock"), vec![9, 8]);
    }

    #[test]
    fn test_monitor_tracks_progress() {
        let mut buffer = FrameBuffer::create(SharedSink::default(), 1, 2).expect("create failed");
        let monitor = buffer.monitor();
        buffer.output_buffer(&[1]).expect("output failed");
        buffer.output_buffer(&[2]).expect("output failed");
        let stats = monitor.stats();
        assert_eq!(stats.frames_buffered, 2);
        assert_eq!(stats.frames_written, 2);
        drop(buffer);
        assert_eq!(monitor.stats().capacity, 2);
    }
}
