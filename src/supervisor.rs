//! Session supervisor.
//!
//! Owns the connection lifecycle end to end: connect, authenticate, run the
//! receive/heartbeat/capture loops, and fall back into exponential-backoff
//! reconnection whenever the link drops. `run` returns only when the outer
//! shutdown signal fires.

use crate::capture::{CaptureController, CaptureProvider, StreamSettings};
use crate::config::AgentConfig;
use crate::input::InputSink;
use crate::metrics::HostMetrics;
use crate::protocol::{AuthPayload, DecodeError, EncodeError, Message, MessageKind};
use crate::transport::{Sender, Transport, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF_SECS: u64 = 60;

/// Name shown on the in-session overlay while a stream is active. The
/// protocol carries no technician identity, so a generic label is used.
const OVERLAY_TECHNICIAN: &str = "Remote support";

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
}

/// Sleep before the n-th consecutive reconnect attempt.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64
        .checked_pow(attempt)
        .unwrap_or(MAX_BACKOFF_SECS)
        .min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}

#[derive(Error, Debug)]
enum AuthError {
    #[error("timed out waiting for AUTH_OK")]
    Timeout,
    #[error("console rejected credentials: {code}: {message}")]
    Rejected { code: String, message: String },
    #[error("expected AUTH_OK, got {0:?}")]
    Unexpected(MessageKind),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("handshake reply was undecodable: {0}")]
    Decode(#[from] DecodeError),
    #[error("AUTH could not be encoded: {0}")]
    Encode(#[from] EncodeError),
}

enum Served {
    Shutdown,
    ConnectionLost,
}

struct Supervisor {
    config: AgentConfig,
    metrics: Arc<HostMetrics>,
    capture: CaptureController,
    input: InputSink,
    /// Last requested stream settings; kept across reconnects so the
    /// stream resumes with the same quality and fps cap (fresh sequence
    /// numbers and timestamp origin). Cleared only by STOP_STREAM.
    resume: Option<StreamSettings>,
    state: ConnState,
}

/// Run the agent until the shutdown signal fires.
pub async fn run(config: AgentConfig, mut shutdown: broadcast::Receiver<()>) {
    let metrics = Arc::new(HostMetrics::new());
    let (provider, input) = select_backends();
    let mut supervisor = Supervisor {
        config,
        metrics,
        capture: CaptureController::new(provider),
        input,
        resume: None,
        state: ConnState::Disconnected,
    };

    let mut attempt: u32 = 0;
    loop {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            info!(attempt, delay_secs = delay.as_secs(), "waiting before reconnect");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
        }

        supervisor.transition(ConnState::Connecting);
        let connected = tokio::select! {
            result = Transport::connect(&supervisor.config.console_url) => Some(result),
            _ = shutdown.recv() => None,
        };
        let mut transport = match connected {
            None => break,
            Some(Ok(transport)) => transport,
            Some(Err(e)) => {
                warn!("connect to {} failed: {e}", supervisor.config.console_url);
                supervisor.transition(ConnState::Disconnected);
                attempt += 1;
                continue;
            }
        };

        supervisor.transition(ConnState::Authenticating);
        let authenticated = tokio::select! {
            result = supervisor.authenticate(&mut transport) => Some(result),
            _ = shutdown.recv() => None,
        };
        let Some(authenticated) = authenticated else {
            transport.close().await;
            break;
        };
        if let Err(e) = authenticated {
            warn!("authentication failed: {e}");
            supervisor.transition(ConnState::Closing);
            transport.close().await;
            supervisor.transition(ConnState::Disconnected);
            attempt += 1;
            continue;
        }

        supervisor.transition(ConnState::Ready);
        info!("session established with {}", supervisor.config.console_url);
        attempt = 0;

        let outcome = supervisor.serve(&mut transport, &mut shutdown).await;

        supervisor.transition(ConnState::Closing);
        supervisor.capture.stop();
        supervisor.overlay_notify(false);
        transport.close().await;
        supervisor.transition(ConnState::Disconnected);

        if matches!(outcome, Served::Shutdown) {
            break;
        }
    }

    supervisor.capture.stop();
    info!("supervisor stopped");
}

impl Supervisor {
    fn transition(&mut self, next: ConnState) {
        if self.state != next {
            debug!("connection state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// AUTH must be the first outbound message; exactly one reply is
    /// expected within the deadline.
    async fn authenticate(&mut self, transport: &mut Transport) -> Result<(), AuthError> {
        let auth = Message::Auth(AuthPayload {
            agent_id: self.config.agent_id.clone(),
            token: self.config.agent_token.clone(),
            hostname: self.metrics.hostname().to_string(),
            os_info: self.metrics.os_info().to_string(),
        });
        transport.sender().send(auth.encode()?)?;

        let raw = timeout(AUTH_TIMEOUT, transport.recv())
            .await
            .map_err(|_| AuthError::Timeout)??;
        match Message::decode(&raw)? {
            Message::AuthOk(ok) => {
                debug!(agent_id = %ok.agent_id, "authenticated");
                Ok(())
            }
            Message::Error(error) => Err(AuthError::Rejected {
                code: error.code,
                message: error.message,
            }),
            other => Err(AuthError::Unexpected(other.kind())),
        }
    }

    async fn serve(
        &mut self,
        transport: &mut Transport,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Served {
        let heartbeat = spawn_heartbeat(transport.sender(), Arc::clone(&self.metrics));

        if let Some(settings) = self.resume {
            info!(
                quality = settings.quality,
                fps_max = settings.fps_max,
                "resuming capture after reconnect"
            );
            self.capture.start(transport.sender(), settings);
            self.overlay_notify(true);
        }

        let outcome = loop {
            let received = tokio::select! {
                _ = shutdown.recv() => None,
                received = transport.recv() => Some(received),
            };
            match received {
                None => break Served::Shutdown,
                Some(Ok(raw)) => self.dispatch(&raw, transport).await,
                Some(Err(e)) => {
                    info!("connection lost: {e}");
                    break Served::ConnectionLost;
                }
            }
        };

        heartbeat.abort();
        outcome
    }

    async fn dispatch(&mut self, raw: &[u8], transport: &Transport) {
        let message = match Message::decode(raw) {
            Ok(message) => message,
            Err(DecodeError::UnknownKind(kind)) => {
                warn!("ignoring message of unknown kind 0x{kind:02x}");
                return;
            }
            Err(e) => {
                warn!("dropping undecodable message: {e}");
                return;
            }
        };

        match message {
            Message::StartStream(params) => {
                let settings = StreamSettings::clamped(params);
                info!(
                    quality = settings.quality,
                    fps_max = settings.fps_max,
                    "console requested stream start"
                );
                self.resume = Some(settings);
                self.capture.start(transport.sender(), settings);
                self.overlay_notify(true);
            }
            Message::StopStream => {
                info!("console requested stream stop");
                self.capture.stop();
                self.resume = None;
                self.overlay_notify(false);
            }
            Message::Mouse(event) => {
                if let Err(e) = self.input.mouse(event).await {
                    warn!("mouse event not applied: {e}");
                }
            }
            Message::Key(event) => {
                if let Err(e) = self.input.key(event).await {
                    warn!("key event not applied: {e}");
                }
            }
            Message::HeartbeatAck => debug!("heartbeat acknowledged"),
            Message::AuthOk(_) => warn!("protocol anomaly: AUTH_OK while ready"),
            Message::Error(error) => {
                // Server-sent errors are informational; the server decides
                // whether to close the link.
                warn!(code = %error.code, "console reported an error: {}", error.message);
            }
            other => warn!("protocol anomaly: unexpected {:?} from console", other.kind()),
        }
    }

    /// Drive the in-session overlay when running through the bridge.
    fn overlay_notify(&self, connected: bool) {
        #[cfg(windows)]
        if let InputSink::Bridge(bridge) = &self.input {
            let bridge = Arc::clone(bridge);
            tokio::spawn(async move {
                bridge.notify(OVERLAY_TECHNICIAN, connected).await;
            });
        }
        #[cfg(not(windows))]
        {
            let _ = connected;
            let _ = OVERLAY_TECHNICIAN;
        }
    }
}

fn spawn_heartbeat(sender: Sender, metrics: Arc<HostMetrics>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(HEARTBEAT_INTERVAL).await;
            let payload = metrics.snapshot();
            match Message::Heartbeat(payload).encode() {
                Ok(bytes) => {
                    if sender.send(bytes).is_err() {
                        debug!("heartbeat send failed, task ending");
                        break;
                    }
                    debug!(uptime = payload.uptime, "heartbeat sent");
                }
                Err(e) => {
                    warn!("heartbeat encode failed: {e}");
                    break;
                }
            }
        }
    })
}

/// Pick the capture backend and input sink for this process, fixed for the
/// process lifetime: session-0 bridge when there is no interactive desktop,
/// otherwise direct capture (with a per-grab fallback when the display
/// probe fails at startup).
fn select_backends() -> (Box<dyn CaptureProvider>, InputSink) {
    #[cfg(windows)]
    {
        use crate::bridge::{BridgeCapture, SessionBridge};
        use crate::capture::{DirectCapture, FallbackCapture};
        use crate::input::Simulator;

        if crate::platform::in_service_session() {
            info!("no interactive desktop; capture and input go through the session-0 bridge");
            let bridge = Arc::new(SessionBridge::new(tokio::runtime::Handle::current()));
            return (
                Box::new(BridgeCapture::new(Arc::clone(&bridge))),
                InputSink::Bridge(bridge),
            );
        }
        match DirectCapture::probe() {
            Ok(direct) => (Box::new(direct), InputSink::Direct(Simulator::new())),
            Err(e) => {
                warn!("display probe failed ({e}); re-resolving the display per grab");
                (
                    Box::new(FallbackCapture::new()),
                    InputSink::Direct(Simulator::new()),
                )
            }
        }
    }
    #[cfg(not(windows))]
    {
        use crate::capture::UnsupportedCapture;
        use crate::input::Simulator;

        warn!("screen capture is unavailable on this platform");
        (Box::new(UnsupportedCapture), InputSink::Direct(Simulator::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AuthOkPayload, ErrorPayload};
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[test]
    fn backoff_doubles_then_saturates_at_sixty_seconds() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(6), Duration::from_secs(60));
        assert_eq!(backoff_delay(10), Duration::from_secs(60));
        assert_eq!(backoff_delay(64), Duration::from_secs(60));
    }

    /// Console stand-in: accepts one WebSocket connection and reports the
    /// first message it receives.
    async fn accept_and_read_auth(
        listener: &tokio::net::TcpListener,
    ) -> (
        tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
        Message,
    ) {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws accept");
        let first = loop {
            match ws.next().await.expect("frame").expect("ws ok") {
                WsMessage::Binary(bytes) => break Message::decode(&bytes).expect("decode"),
                _ => continue,
            }
        };
        (ws, first)
    }

    fn test_config(port: u16) -> AgentConfig {
        AgentConfig {
            console_url: format!("ws://127.0.0.1:{port}/ws/agent"),
            agent_id: "agent-under-test".to_string(),
            agent_token: "secret".to_string(),
            ..AgentConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn auth_is_first_and_reconnect_reauthenticates() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let agent = tokio::spawn(run(test_config(port), shutdown_rx));

        // First connection: the very first frame must be AUTH carrying the
        // configured identity.
        let (mut ws, first) = accept_and_read_auth(&listener).await;
        match first {
            Message::Auth(auth) => {
                assert_eq!(auth.agent_id, "agent-under-test");
                assert_eq!(auth.token, "secret");
                assert!(!auth.hostname.is_empty());
                assert!(!auth.os_info.is_empty());
            }
            other => panic!("first message was {other:?}, not AUTH"),
        }
        let ok = Message::AuthOk(AuthOkPayload {
            agent_id: "agent-under-test".to_string(),
        });
        ws.send(WsMessage::Binary(ok.encode().expect("encode")))
            .await
            .expect("send auth ok");

        // Drop the link; the agent must come back and authenticate again.
        drop(ws);
        let (mut ws, second) = tokio::time::timeout(
            Duration::from_secs(10),
            accept_and_read_auth(&listener),
        )
        .await
        .expect("agent reconnected");
        assert!(matches!(second, Message::Auth(_)));
        let ok = Message::AuthOk(AuthOkPayload {
            agent_id: "agent-under-test".to_string(),
        });
        ws.send(WsMessage::Binary(ok.encode().expect("encode")))
            .await
            .expect("send auth ok");

        shutdown_tx.send(()).expect("signal shutdown");
        tokio::time::timeout(Duration::from_secs(5), agent)
            .await
            .expect("run returned after shutdown")
            .expect("no panic");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn auth_rejection_closes_and_retries_with_backoff() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let agent = tokio::spawn(run(test_config(port), shutdown_rx));

        let started = std::time::Instant::now();
        let (mut ws, first) = accept_and_read_auth(&listener).await;
        assert!(matches!(first, Message::Auth(_)));
        let reject = Message::Error(ErrorPayload {
            code: "INVALID_TOKEN".to_string(),
            message: "bad token".to_string(),
        });
        ws.send(WsMessage::Binary(reject.encode().expect("encode")))
            .await
            .expect("send reject");
        drop(ws);

        // The agent backs off for 2 s, then tries again from the top.
        let (ws, retry) = tokio::time::timeout(
            Duration::from_secs(10),
            accept_and_read_auth(&listener),
        )
        .await
        .expect("agent retried");
        assert!(matches!(retry, Message::Auth(_)));
        assert!(
            started.elapsed() >= Duration::from_secs(2),
            "retry arrived before the backoff elapsed"
        );

        // Close the pending handshake so the agent is not parked in the
        // auth timeout when the shutdown signal fires.
        drop(ws);
        shutdown_tx.send(()).expect("signal shutdown");
        tokio::time::timeout(Duration::from_secs(5), agent)
            .await
            .expect("run returned after shutdown")
            .expect("no panic");
    }
}
