//! In-session capture helper.
//!
//! Spawned by the service-side bridge as
//! `hostlink --capture-helper <capturePipe> <inputPipe>` inside the
//! logged-on user's session. The main thread serves capture requests on the
//! capture pipe; a second thread applies input and overlay frames from the
//! input pipe. The process exits when the capture pipe closes.

use crate::bridge::{self, NotifyPayload, PIPE_KEY, PIPE_MOUSE, PIPE_NOTIFY};
use crate::capture::{CaptureProvider, DirectCapture, Grab};
use crate::input::Simulator;
use crate::protocol::{KeyEventPayload, MouseEventPayload};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use tracing::{debug, info, warn};

pub fn run(capture_pipe: &str, input_pipe: &str) -> std::io::Result<()> {
    info!(capture_pipe, input_pipe, "capture helper starting");

    let mut capture = OpenOptions::new()
        .read(true)
        .write(true)
        .open(capture_pipe)?;
    let input = OpenOptions::new().read(true).open(input_pipe)?;

    let _input_thread = std::thread::Builder::new()
        .name("input".to_string())
        .spawn(move || input_loop(input))?;

    let provider = DirectCapture::probe().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no display in this session: {e}"),
        )
    })?;

    serve_capture(&mut capture, provider)?;

    crate::overlay::shutdown();
    info!("capture helper exiting");
    Ok(())
}

/// Serve the strict request/response protocol on the capture pipe: one
/// quality byte in, `[4B length BE][JPEG]` out, length 0 meaning the screen
/// has not changed.
fn serve_capture(pipe: &mut File, mut provider: DirectCapture) -> std::io::Result<()> {
    loop {
        let mut request = [0u8; 1];
        if let Err(e) = pipe.read_exact(&mut request) {
            debug!("capture pipe closed: {e}");
            return Ok(());
        }
        let quality = request[0].clamp(1, 100);

        match provider.grab(quality) {
            Ok(Grab::Unchanged) => pipe.write_all(&0u32.to_be_bytes())?,
            Ok(Grab::Jpeg(jpeg)) => {
                pipe.write_all(&(jpeg.len() as u32).to_be_bytes())?;
                pipe.write_all(&jpeg)?;
            }
            Err(e) => {
                // Keep the protocol in lockstep; an empty response reads as
                // "unchanged" on the service side.
                warn!("in-session capture failed: {e}");
                pipe.write_all(&0u32.to_be_bytes())?;
            }
        }
        pipe.flush()?;
    }
}

fn input_loop(mut pipe: File) {
    let simulator = Simulator::new();
    loop {
        let (frame_type, body) = match bridge::read_pipe_frame(&mut pipe) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("input pipe closed: {e}");
                return;
            }
        };

        match frame_type {
            PIPE_MOUSE => match serde_json::from_slice::<MouseEventPayload>(&body) {
                Ok(event) => {
                    if let Err(e) = simulator.mouse(&event) {
                        warn!("mouse injection failed: {e}");
                    }
                }
                Err(e) => warn!("malformed mouse frame: {e}"),
            },
            PIPE_KEY => match serde_json::from_slice::<KeyEventPayload>(&body) {
                Ok(event) => {
                    if let Err(e) = simulator.key(&event) {
                        warn!("key injection failed: {e}");
                    }
                }
                Err(e) => warn!("malformed key frame: {e}"),
            },
            PIPE_NOTIFY => match serde_json::from_slice::<NotifyPayload>(&body) {
                Ok(notify) => crate::overlay::update(&notify),
                Err(e) => warn!("malformed notify frame: {e}"),
            },
            other => warn!("unknown input frame type {other}"),
        }
    }
}
