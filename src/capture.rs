//! Screen capture pipeline.
//!
//! A capture task runs on its own thread, paced by the requested frame
//! rate. Each iteration asks the [`CaptureProvider`] for a JPEG at the
//! requested quality; providers return `Unchanged` when the screen content
//! is byte-identical to the previous grab, which suppresses the frame
//! entirely. Sequence numbers and capture-relative timestamps are owned by
//! the task so frames always leave in strictly increasing order.

use crate::protocol::{FramePayload, Message, StreamParams};
use crate::transport::Sender;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// How long a stop request waits for the capture thread before abandoning it.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Granularity of the pacing sleep, so stop requests are observed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no display available: {0}")]
    NoDisplay(String),
    #[error("screen grab failed: {0}")]
    Grab(String),
    #[error("JPEG encoding failed: {0}")]
    Encode(String),
    #[error("no interactive session available")]
    NoInteractiveSession,
    #[error("capture helper spawn failed: {0}")]
    Spawn(String),
    #[error("capture helper did not connect in time")]
    HelperDidNotConnect,
    #[error("helper pipe I/O failed: {0}")]
    Pipe(#[from] std::io::Error),
    #[error("screen capture is not supported on this platform")]
    Unsupported,
}

/// Outcome of a single grab.
#[derive(Debug)]
pub enum Grab {
    Jpeg(Vec<u8>),
    Unchanged,
}

/// A source of JPEG snapshots of the primary display. Implementations are
/// called synchronously from the capture thread and may block (the bridge
/// provider blocks on pipe IPC).
pub trait CaptureProvider: Send {
    fn grab(&mut self, quality: u8) -> Result<Grab, CaptureError>;

    /// Forget the previous-frame fingerprint so the next grab produces a
    /// full frame. Called when a stream starts.
    fn reset(&mut self);
}

/// Effective stream parameters after clamping the console's request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    pub quality: u8,
    pub fps_max: u32,
}

impl StreamSettings {
    pub fn clamped(params: StreamParams) -> StreamSettings {
        StreamSettings {
            quality: params.quality.clamp(1, 100),
            fps_max: params.fps_max.max(1),
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps_max as u64)
    }
}

/// Fingerprint of the most recent raw pixel buffer. A change in buffer
/// length (resolution change) forces a miss automatically.
pub struct FrameFingerprint {
    last: Option<(usize, [u8; 32])>,
}

impl FrameFingerprint {
    pub fn new() -> FrameFingerprint {
        FrameFingerprint { last: None }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Digest `pixels` and report whether it matches the previous buffer.
    /// The stored fingerprint is updated either way.
    pub fn matches(&mut self, pixels: &[u8]) -> bool {
        let digest: [u8; 32] = Sha256::digest(pixels).into();
        let entry = (pixels.len(), digest);
        let hit = self.last == Some(entry);
        self.last = Some(entry);
        hit
    }
}

/// Convert a BGRA buffer (row stride may include padding) into packed RGB.
pub fn bgra_to_rgb(bgra: &[u8], width: usize, height: usize, stride: usize) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(width * height * 3);
    for y in 0..height {
        let row = y * stride;
        for x in 0..width {
            let offset = row + x * 4;
            if offset + 2 < bgra.len() {
                rgb.push(bgra[offset + 2]);
                rgb.push(bgra[offset + 1]);
                rgb.push(bgra[offset]);
            } else {
                rgb.extend_from_slice(&[0, 0, 0]);
            }
        }
    }
    rgb
}

/// JPEG-encode a packed RGB buffer at the given quality.
pub fn encode_jpeg(rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>, CaptureError> {
    use image::codecs::jpeg::JpegEncoder;
    use image::{ImageBuffer, RgbImage};

    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, quality);
    let img: RgbImage = ImageBuffer::from_raw(width, height, rgb.to_vec())
        .ok_or_else(|| CaptureError::Encode("buffer does not match dimensions".to_string()))?;
    img.write_with_encoder(encoder)
        .map_err(|e| CaptureError::Encode(e.to_string()))?;
    Ok(out.into_inner())
}

/// Owns the single capture task. At most one is running at a time; the
/// provider itself is fixed for the process lifetime.
pub struct CaptureController {
    provider: Arc<Mutex<Box<dyn CaptureProvider>>>,
    active: Option<CaptureTask>,
}

struct CaptureTask {
    running: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

impl CaptureController {
    pub fn new(provider: Box<dyn CaptureProvider>) -> CaptureController {
        CaptureController {
            provider: Arc::new(Mutex::new(provider)),
            active: None,
        }
    }

    /// Stop any current capture and start a fresh stream with the given
    /// settings. Sequence numbers and the timestamp origin start over.
    pub fn start(&mut self, sender: Sender, settings: StreamSettings) {
        self.stop();

        if let Ok(mut provider) = self.provider.lock() {
            provider.reset();
        }

        let running = Arc::new(AtomicBool::new(true));
        let provider = Arc::clone(&self.provider);
        let loop_flag = Arc::clone(&running);
        let spawned = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture_loop(provider, sender, settings, loop_flag));

        match spawned {
            Ok(handle) => self.active = Some(CaptureTask { running, handle }),
            Err(e) => warn!("failed to spawn capture thread: {e}"),
        }
    }

    /// Stop the capture task, waiting up to the grace period before
    /// abandoning the thread.
    pub fn stop(&mut self) {
        let Some(task) = self.active.take() else {
            return;
        };
        task.running.store(false, Ordering::Relaxed);

        let deadline = Instant::now() + STOP_GRACE;
        while !task.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if task.handle.is_finished() {
            let _ = task.handle.join();
        } else {
            warn!("capture thread did not stop in time, abandoning it");
        }
    }
}

fn capture_loop(
    provider: Arc<Mutex<Box<dyn CaptureProvider>>>,
    sender: Sender,
    settings: StreamSettings,
    running: Arc<AtomicBool>,
) {
    let interval = settings.frame_interval();
    let origin = Instant::now();
    let mut frame_seq: u32 = 0;
    info!(
        quality = settings.quality,
        fps_max = settings.fps_max,
        "capture loop started"
    );

    while running.load(Ordering::Relaxed) {
        let iteration = Instant::now();

        let grab = match provider.lock() {
            Ok(mut provider) => provider.grab(settings.quality),
            Err(_) => break,
        };

        match grab {
            Ok(Grab::Unchanged) => {}
            Ok(Grab::Jpeg(jpeg)) => {
                frame_seq = frame_seq.wrapping_add(1);
                let timestamp_ms = origin.elapsed().as_millis() as u32;
                let frame = Message::Frame(FramePayload {
                    seq: frame_seq,
                    timestamp_ms,
                    jpeg,
                });
                match frame.encode() {
                    Ok(bytes) => {
                        if sender.send(bytes).is_err() {
                            debug!("transport gone, capture loop ending");
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("frame encode failed: {e}");
                        break;
                    }
                }
            }
            Err(e) => {
                warn!("capture failed, ending stream: {e}");
                break;
            }
        }

        // Sleep out the remainder of the frame interval in small slices so
        // stop requests are observed quickly. Overruns emit back-to-back
        // with no catch-up.
        while running.load(Ordering::Relaxed) {
            let elapsed = iteration.elapsed();
            if elapsed >= interval {
                break;
            }
            std::thread::sleep((interval - elapsed).min(SLEEP_SLICE));
        }
    }

    info!("capture loop stopped");
}

/// Direct capture of the primary display. Used when the process owns an
/// interactive desktop; also reused verbatim inside the capture helper.
#[cfg(windows)]
pub struct DirectCapture {
    capturer: Option<scrap::Capturer>,
    width: usize,
    height: usize,
    fingerprint: FrameFingerprint,
}

#[cfg(windows)]
impl DirectCapture {
    /// Verify a primary display exists before committing to this backend.
    pub fn probe() -> Result<DirectCapture, CaptureError> {
        scrap::Display::primary().map_err(|e| CaptureError::NoDisplay(e.to_string()))?;
        Ok(DirectCapture {
            capturer: None,
            width: 0,
            height: 0,
            fingerprint: FrameFingerprint::new(),
        })
    }

    fn ensure_capturer(&mut self) -> Result<(), CaptureError> {
        if self.capturer.is_some() {
            return Ok(());
        }
        let display =
            scrap::Display::primary().map_err(|e| CaptureError::NoDisplay(e.to_string()))?;
        self.width = display.width();
        self.height = display.height();
        self.capturer =
            Some(scrap::Capturer::new(display).map_err(|e| CaptureError::Grab(e.to_string()))?);
        Ok(())
    }
}

#[cfg(windows)]
impl CaptureProvider for DirectCapture {
    fn grab(&mut self, quality: u8) -> Result<Grab, CaptureError> {
        self.ensure_capturer()?;
        let (width, height) = (self.width, self.height);

        // The frame buffer is copied out immediately; the capturer may be
        // torn down below on device loss.
        let grabbed: std::io::Result<Vec<u8>> = match self.capturer.as_mut() {
            Some(capturer) => capturer.frame().map(|frame| frame.to_vec()),
            None => return Err(CaptureError::Grab("capturer unavailable".to_string())),
        };

        let frame = match grabbed {
            Ok(frame) => frame,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // No new desktop frame since the last duplication.
                return Ok(Grab::Unchanged);
            }
            Err(e) => {
                // Device loss (resolution change, session switch): drop the
                // capturer and rebuild on the next call.
                self.capturer = None;
                return Err(CaptureError::Grab(e.to_string()));
            }
        };

        if self.fingerprint.matches(&frame) {
            return Ok(Grab::Unchanged);
        }

        let stride = frame.len() / height.max(1);
        let rgb = bgra_to_rgb(&frame, width, height, stride);
        Ok(Grab::Jpeg(encode_jpeg(
            &rgb,
            width as u32,
            height as u32,
            quality,
        )?))
    }

    fn reset(&mut self) {
        self.fingerprint.reset();
    }
}

/// Degraded backend used when display enumeration failed at startup: the
/// primary display is re-resolved on every grab, so a display that appears
/// later (console reconnect, hot-plug) starts working without a restart.
#[cfg(windows)]
pub struct FallbackCapture {
    fingerprint: FrameFingerprint,
}

#[cfg(windows)]
impl FallbackCapture {
    pub fn new() -> FallbackCapture {
        FallbackCapture {
            fingerprint: FrameFingerprint::new(),
        }
    }
}

#[cfg(windows)]
impl CaptureProvider for FallbackCapture {
    fn grab(&mut self, quality: u8) -> Result<Grab, CaptureError> {
        let display =
            scrap::Display::primary().map_err(|e| CaptureError::NoDisplay(e.to_string()))?;
        let (width, height) = (display.width(), display.height());
        let mut capturer =
            scrap::Capturer::new(display).map_err(|e| CaptureError::Grab(e.to_string()))?;

        // A fresh duplication may need a moment to produce its first frame.
        let deadline = Instant::now() + Duration::from_millis(500);
        let frame = loop {
            match capturer.frame() {
                Ok(frame) => break frame.to_vec(),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(Grab::Unchanged);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(CaptureError::Grab(e.to_string())),
            }
        };

        if self.fingerprint.matches(&frame) {
            return Ok(Grab::Unchanged);
        }
        let stride = frame.len() / height.max(1);
        let rgb = bgra_to_rgb(&frame, width, height, stride);
        Ok(Grab::Jpeg(encode_jpeg(
            &rgb,
            width as u32,
            height as u32,
            quality,
        )?))
    }

    fn reset(&mut self) {
        self.fingerprint.reset();
    }
}

/// Placeholder backend for platforms without a grab primitive. The session
/// stays useful for heartbeats; every START_STREAM fails cleanly.
pub struct UnsupportedCapture;

impl CaptureProvider for UnsupportedCapture {
    fn grab(&mut self, _quality: u8) -> Result<Grab, CaptureError> {
        Err(CaptureError::Unsupported)
    }

    fn reset(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Outbound;

    #[test]
    fn identical_buffers_are_detected() {
        let mut fingerprint = FrameFingerprint::new();
        let buffer = vec![7u8; 64];
        assert!(!fingerprint.matches(&buffer));
        assert!(fingerprint.matches(&buffer));
        assert!(fingerprint.matches(&buffer));
    }

    #[test]
    fn any_pixel_change_is_a_miss() {
        let mut fingerprint = FrameFingerprint::new();
        let mut buffer = vec![7u8; 64];
        fingerprint.matches(&buffer);
        buffer[10] ^= 0xFF;
        assert!(!fingerprint.matches(&buffer));
    }

    #[test]
    fn resolution_change_is_a_miss() {
        let mut fingerprint = FrameFingerprint::new();
        fingerprint.matches(&vec![0u8; 64]);
        assert!(!fingerprint.matches(&vec![0u8; 128]));
    }

    #[test]
    fn reset_forces_a_full_frame() {
        let mut fingerprint = FrameFingerprint::new();
        let buffer = vec![1u8; 16];
        fingerprint.matches(&buffer);
        fingerprint.reset();
        assert!(!fingerprint.matches(&buffer));
    }

    #[test]
    fn bgra_conversion_swaps_channels_and_honors_stride() {
        // 2x1 image with 4 bytes of row padding
        let bgra = [1, 2, 3, 255, 4, 5, 6, 255, 0, 0, 0, 0];
        let rgb = bgra_to_rgb(&bgra, 2, 1, 12);
        assert_eq!(rgb, vec![3, 2, 1, 6, 5, 4]);
    }

    #[test]
    fn jpeg_encoding_produces_a_jpeg() {
        let rgb = vec![128u8; 8 * 8 * 3];
        let jpeg = encode_jpeg(&rgb, 8, 8, 70).expect("encode");
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn settings_clamp_quality_and_fps() {
        let settings = StreamSettings::clamped(StreamParams {
            quality: 0,
            fps_max: 0,
        });
        assert_eq!(settings.quality, 1);
        assert_eq!(settings.fps_max, 1);

        let settings = StreamSettings::clamped(StreamParams {
            quality: 255,
            fps_max: 30,
        });
        assert_eq!(settings.quality, 100);
        assert_eq!(settings.fps_max, 30);
    }

    /// Scripted provider: N distinct frames, then unchanged forever.
    struct ScriptedProvider {
        frames: u32,
        produced: u32,
    }

    impl CaptureProvider for ScriptedProvider {
        fn grab(&mut self, _quality: u8) -> Result<Grab, CaptureError> {
            if self.produced < self.frames {
                self.produced += 1;
                Ok(Grab::Jpeg(vec![self.produced as u8]))
            } else {
                Ok(Grab::Unchanged)
            }
        }

        fn reset(&mut self) {}
    }

    #[tokio::test]
    async fn frames_carry_contiguous_sequence_numbers_from_one() {
        let (sender, mut rx) = Sender::test_channel();
        let mut controller = CaptureController::new(Box::new(ScriptedProvider {
            frames: 3,
            produced: 0,
        }));
        controller.start(
            sender,
            StreamSettings {
                quality: 70,
                fps_max: 100,
            },
        );

        let mut seen = Vec::new();
        for _ in 0..3 {
            let out = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("frame in time")
                .expect("channel open");
            let Outbound::Binary(bytes) = out else {
                panic!("unexpected outbound variant");
            };
            match Message::decode(&bytes).expect("frame decodes") {
                Message::Frame(frame) => seen.push((frame.seq, frame.timestamp_ms)),
                other => panic!("unexpected message {other:?}"),
            }
        }
        controller.stop();

        assert_eq!(
            seen.iter().map(|(seq, _)| *seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(seen.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[tokio::test]
    async fn unchanged_grabs_emit_exactly_one_frame() {
        let (sender, mut rx) = Sender::test_channel();
        let mut controller = CaptureController::new(Box::new(ScriptedProvider {
            frames: 1,
            produced: 0,
        }));
        controller.start(
            sender,
            StreamSettings {
                quality: 70,
                fps_max: 100,
            },
        );

        // first frame arrives
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame in time");
        assert!(first.is_some());

        // and then nothing, despite many further iterations
        let silence =
            tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(silence.is_err(), "static screen must not emit frames");
        controller.stop();
    }

    #[tokio::test]
    async fn provider_errors_end_the_stream_quietly() {
        struct FailingProvider;
        impl CaptureProvider for FailingProvider {
            fn grab(&mut self, _quality: u8) -> Result<Grab, CaptureError> {
                Err(CaptureError::Unsupported)
            }
            fn reset(&mut self) {}
        }

        let (sender, mut rx) = Sender::test_channel();
        let mut controller = CaptureController::new(Box::new(FailingProvider));
        controller.start(
            sender,
            StreamSettings {
                quality: 70,
                fps_max: 10,
            },
        );

        // The loop exits without emitting anything; the channel closes when
        // the sender is dropped with the thread.
        let out = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("loop should end promptly");
        assert!(out.is_none());
        controller.stop();
    }
}
