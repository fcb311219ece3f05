//! Session-0 bridge.
//!
//! When the agent runs in the service session it cannot touch the desktop,
//! so screen and input traffic is ferried over two named pipes to a helper
//! process spawned into the logged-on user's session:
//!
//! - **capture pipe**: strict request/response, one quality byte up, a
//!   4-byte big-endian length plus JPEG down (length 0 means "unchanged");
//! - **input pipe**: one-way frames of `[1B type][4B len BE][JSON]`.
//!
//! The pipe framing helpers at the top are platform-neutral and shared with
//! the helper; the bridge itself is Windows-only.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Input-pipe frame types.
pub const PIPE_MOUSE: u8 = 1;
pub const PIPE_KEY: u8 = 2;
pub const PIPE_NOTIFY: u8 = 3;

/// Ceiling on a single pipe frame body (1 MiB of JSON is already absurd).
pub const MAX_PIPE_FRAME: usize = 1024 * 1024;

/// Ceiling on a JPEG response from the helper.
pub const MAX_HELPER_JPEG: usize = 64 * 1024 * 1024;

/// How long the service waits for a freshly spawned helper to open both
/// pipes.
pub const HELPER_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Overlay control payload carried by `PIPE_NOTIFY` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub technician_name: String,
    pub connected: bool,
}

/// Write one input-pipe frame to a synchronous writer (helper side shares
/// this with the tests).
pub fn write_pipe_frame<W: Write>(writer: &mut W, frame_type: u8, body: &[u8]) -> std::io::Result<()> {
    writer.write_all(&[frame_type])?;
    writer.write_all(&(body.len() as u32).to_be_bytes())?;
    writer.write_all(body)?;
    writer.flush()
}

/// Read one input-pipe frame from a synchronous reader.
pub fn read_pipe_frame<R: Read>(reader: &mut R) -> std::io::Result<(u8, Vec<u8>)> {
    let mut frame_type = [0u8; 1];
    reader.read_exact(&mut frame_type)?;
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_PIPE_FRAME {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("pipe frame of {len} bytes exceeds the ceiling"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok((frame_type[0], body))
}

/// Compose an input-pipe frame as a single buffer for one-shot writes.
pub fn pipe_frame(frame_type: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + body.len());
    frame.push(frame_type);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

#[cfg(windows)]
pub use windows_impl::{BridgeCapture, SessionBridge};

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::capture::{CaptureError, CaptureProvider, Grab};
    use crate::input::InputError;
    use crate::protocol::{KeyEventPayload, MouseEventPayload};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
    use tokio::runtime::Handle;
    use tokio::sync::Mutex;
    use tracing::{debug, info, warn};
    use uuid::Uuid;

    struct BridgeState {
        /// Capture pipe; taken out by the (single) capture caller for the
        /// duration of a request/response round trip.
        capture: Option<NamedPipeServer>,
        /// Input pipe behind its own lock so framed writes cannot
        /// interleave with each other or stall capture traffic.
        input: Option<std::sync::Arc<Mutex<NamedPipeServer>>>,
        target_session: Option<u32>,
        target_explicit: bool,
        /// Last requested overlay state, replayed to a freshly spawned
        /// helper.
        overlay: Option<NotifyPayload>,
    }

    /// Service-side owner of the helper process and both pipes.
    pub struct SessionBridge {
        runtime: Handle,
        state: Mutex<BridgeState>,
    }

    impl SessionBridge {
        pub fn new(runtime: Handle) -> SessionBridge {
            SessionBridge {
                runtime,
                state: Mutex::new(BridgeState {
                    capture: None,
                    input: None,
                    target_session: None,
                    target_explicit: false,
                    overlay: None,
                }),
            }
        }

        pub fn runtime(&self) -> &Handle {
            &self.runtime
        }

        /// Re-target the helper at a specific session. The pipes are
        /// disposed; the next capture request spawns a helper there.
        pub async fn select_session(&self, session_id: u32) {
            let mut state = self.state.lock().await;
            info!(session_id, "switching bridge target session");
            state.capture = None;
            state.input = None;
            state.target_session = Some(session_id);
            state.target_explicit = true;
        }

        /// Dispose the helper connection so the next capture request spawns
        /// a fresh helper (with a fresh frame fingerprint).
        pub async fn recycle(&self) {
            let mut state = self.state.lock().await;
            state.capture = None;
            state.input = None;
        }

        /// Record the overlay state and push it to the helper if one is
        /// connected; otherwise it is replayed on the next spawn.
        pub async fn notify(&self, technician_name: &str, connected: bool) {
            let payload = NotifyPayload {
                technician_name: technician_name.to_string(),
                connected,
            };
            {
                let mut state = self.state.lock().await;
                state.overlay = Some(payload.clone());
            }
            if let Ok(body) = serde_json::to_vec(&payload) {
                if let Err(e) = self.send_frame(PIPE_NOTIFY, body).await {
                    debug!("overlay notify not delivered: {e}");
                }
            }
        }

        pub async fn send_mouse(&self, event: &MouseEventPayload) -> Result<(), InputError> {
            let body = serde_json::to_vec(event)
                .map_err(|e| InputError::Bridge(e.to_string()))?;
            self.send_frame(PIPE_MOUSE, body).await
        }

        pub async fn send_key(&self, event: &KeyEventPayload) -> Result<(), InputError> {
            let body = serde_json::to_vec(event)
                .map_err(|e| InputError::Bridge(e.to_string()))?;
            self.send_frame(PIPE_KEY, body).await
        }

        async fn send_frame(&self, frame_type: u8, body: Vec<u8>) -> Result<(), InputError> {
            let pipe = {
                let state = self.state.lock().await;
                state
                    .input
                    .clone()
                    .ok_or_else(|| InputError::Bridge("helper not connected".to_string()))?
            };

            let frame = pipe_frame(frame_type, &body);
            let mut pipe = pipe.lock().await;
            if let Err(e) = pipe.write_all(&frame).await {
                drop(pipe);
                self.dispose().await;
                return Err(InputError::Bridge(e.to_string()));
            }
            Ok(())
        }

        /// One capture round trip: quality byte up, length-prefixed JPEG
        /// down. Spawns the helper first if no connection exists.
        pub async fn grab_async(&self, quality: u8) -> Result<Grab, CaptureError> {
            let mut capture_pipe = {
                let mut state = self.state.lock().await;
                if state.capture.is_none() {
                    self.spawn_helper(&mut state).await?;
                }
                match state.capture.take() {
                    Some(pipe) => pipe,
                    None => return Err(CaptureError::HelperDidNotConnect),
                }
            };

            match Self::round_trip(&mut capture_pipe, quality).await {
                Ok(grab) => {
                    self.state.lock().await.capture = Some(capture_pipe);
                    Ok(grab)
                }
                Err(e) => {
                    warn!("helper capture round trip failed: {e}");
                    self.dispose().await;
                    Err(CaptureError::Pipe(e))
                }
            }
        }

        async fn round_trip(
            pipe: &mut NamedPipeServer,
            quality: u8,
        ) -> std::io::Result<Grab> {
            pipe.write_all(&[quality.clamp(1, 100)]).await?;

            let mut len = [0u8; 4];
            pipe.read_exact(&mut len).await?;
            let len = u32::from_be_bytes(len) as usize;
            if len == 0 {
                return Ok(Grab::Unchanged);
            }
            if len > MAX_HELPER_JPEG {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("helper response of {len} bytes exceeds the ceiling"),
                ));
            }
            let mut jpeg = vec![0u8; len];
            pipe.read_exact(&mut jpeg).await?;
            Ok(Grab::Jpeg(jpeg))
        }

        /// Drop both pipes (the helper exits when its capture pipe closes).
        /// An explicitly selected target session is cleared back to
        /// auto-selection; the session it named has likely gone away.
        async fn dispose(&self) {
            let mut state = self.state.lock().await;
            state.capture = None;
            state.input = None;
            if state.target_explicit {
                state.target_session = None;
                state.target_explicit = false;
            }
        }

        async fn spawn_helper(&self, state: &mut BridgeState) -> Result<(), CaptureError> {
            let suffix = Uuid::new_v4();
            let capture_name = format!(r"\\.\pipe\hostlink-capture-{suffix}");
            let input_name = format!(r"\\.\pipe\hostlink-input-{suffix}");

            let (capture_pipe, input_pipe) = {
                let security = crate::platform::PipeSecurity::interactive()
                    .map_err(|e| CaptureError::Spawn(e.to_string()))?;
                // SAFETY: the attribute block and its descriptor outlive
                // both create calls; tokio copies what it needs.
                let capture_pipe = unsafe {
                    ServerOptions::new()
                        .first_pipe_instance(true)
                        .create_with_security_attributes_raw(&capture_name, security.as_ptr())
                }
                .map_err(|e| CaptureError::Spawn(e.to_string()))?;
                let input_pipe = unsafe {
                    ServerOptions::new()
                        .first_pipe_instance(true)
                        .create_with_security_attributes_raw(&input_name, security.as_ptr())
                }
                .map_err(|e| CaptureError::Spawn(e.to_string()))?;
                (capture_pipe, input_pipe)
            };

            let session = match state.target_session {
                Some(session) => session,
                None => crate::platform::resolve_interactive_session()
                    .ok_or(CaptureError::NoInteractiveSession)?,
            };

            crate::platform::spawn_helper_in_session(session, &capture_name, &input_name)
                .map_err(|e| CaptureError::Spawn(e.to_string()))?;

            let connect = async {
                capture_pipe.connect().await?;
                input_pipe.connect().await
            };
            match tokio::time::timeout(HELPER_CONNECT_TIMEOUT, connect).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(CaptureError::Pipe(e)),
                Err(_) => return Err(CaptureError::HelperDidNotConnect),
            }
            info!(session, "capture helper connected on both pipes");

            let input_pipe = std::sync::Arc::new(Mutex::new(input_pipe));

            // Replay the overlay state the console last asked for.
            if let Some(overlay) = state.overlay.clone() {
                if let Ok(body) = serde_json::to_vec(&overlay) {
                    let frame = pipe_frame(PIPE_NOTIFY, &body);
                    let mut pipe = input_pipe.lock().await;
                    if let Err(e) = pipe.write_all(&frame).await {
                        debug!("overlay replay failed: {e}");
                    }
                }
            }

            state.capture = Some(capture_pipe);
            state.input = Some(input_pipe);
            Ok(())
        }
    }

    /// Capture provider that fronts the bridge for the capture thread. The
    /// thread is not a runtime worker, so blocking on the handle is safe.
    pub struct BridgeCapture {
        bridge: std::sync::Arc<SessionBridge>,
    }

    impl BridgeCapture {
        pub fn new(bridge: std::sync::Arc<SessionBridge>) -> BridgeCapture {
            BridgeCapture { bridge }
        }
    }

    impl CaptureProvider for BridgeCapture {
        fn grab(&mut self, quality: u8) -> Result<Grab, CaptureError> {
            let bridge = std::sync::Arc::clone(&self.bridge);
            self.bridge
                .runtime()
                .block_on(async move { bridge.grab_async(quality).await })
        }

        fn reset(&mut self) {
            let bridge = std::sync::Arc::clone(&self.bridge);
            self.bridge
                .runtime()
                .block_on(async move { bridge.recycle().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_frames_round_trip() {
        let body = br#"{"x":1,"y":2,"button":0,"action":"click"}"#;
        let mut buffer = Vec::new();
        write_pipe_frame(&mut buffer, PIPE_MOUSE, body).expect("write");

        let mut cursor = std::io::Cursor::new(buffer);
        let (frame_type, read_body) = read_pipe_frame(&mut cursor).expect("read");
        assert_eq!(frame_type, PIPE_MOUSE);
        assert_eq!(read_body, body);
    }

    #[test]
    fn one_shot_frames_match_the_streaming_writer() {
        let body = b"{}";
        let mut streamed = Vec::new();
        write_pipe_frame(&mut streamed, PIPE_NOTIFY, body).expect("write");
        assert_eq!(streamed, pipe_frame(PIPE_NOTIFY, body));
    }

    #[test]
    fn empty_bodies_are_legal() {
        let mut buffer = Vec::new();
        write_pipe_frame(&mut buffer, PIPE_KEY, &[]).expect("write");
        let (frame_type, body) =
            read_pipe_frame(&mut std::io::Cursor::new(buffer)).expect("read");
        assert_eq!(frame_type, PIPE_KEY);
        assert!(body.is_empty());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buffer = vec![PIPE_MOUSE];
        buffer.extend_from_slice(&(MAX_PIPE_FRAME as u32 + 1).to_be_bytes());
        let err = read_pipe_frame(&mut std::io::Cursor::new(buffer)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frames_fail_with_eof() {
        let mut buffer = Vec::new();
        write_pipe_frame(&mut buffer, PIPE_NOTIFY, b"{\"connected\":true}").expect("write");
        buffer.truncate(buffer.len() - 3);
        let err = read_pipe_frame(&mut std::io::Cursor::new(buffer)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn notify_payload_serializes_with_snake_case_fields() {
        let payload = NotifyPayload {
            technician_name: "Avery".to_string(),
            connected: true,
        };
        let json = serde_json::to_string(&payload).expect("serialize");
        assert!(json.contains("\"technician_name\":\"Avery\""));
        let back: NotifyPayload = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, payload);
    }
}
