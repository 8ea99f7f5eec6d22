//! The WebSocket bridge (§6.5): after a fetch handler returns a `101`
//! response with a `webSocket` property, the engine hands the caller a
//! [`WebSocketHandle`](crate::engine::WebSocketHandle) instead of releasing
//! the instance. The external HTTP server connects that handle to the real
//! HTTP-side WebSocket by calling [`bridge`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{instrument, Level};

use crate::engine::WebSocketHandle;
use crate::error::Result;

/// One WebSocket frame in either direction.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A text frame, carrying a UTF-8 payload.
    Text(String),
    /// A binary frame, carrying raw bytes.
    Binary(Vec<u8>),
}

/// The external HTTP-side WebSocket connection, reduced to the two
/// operations the bridge needs. Implemented by the outward HTTP serving
/// layer, which is itself out of scope (§1 Non-goals).
pub trait HttpConnection: Send {
    /// Block for the next frame, or `None` once the peer closes cleanly.
    fn read_frame(&mut self, timeout: Duration) -> Option<Frame>;
    /// Send a frame to the HTTP peer. Used both for worker-originated
    /// messages and for keepalive pings.
    fn send_frame(&mut self, frame: Frame) -> Result<()>;
    /// Send a ping. A no-op for connections whose transport pings itself.
    fn send_ping(&mut self) -> Result<()> {
        Ok(())
    }
}

/// How long an upgraded instance may sit idle before the bridge forces
/// completion (§9 open question: if the HTTP connection never closes
/// cleanly, the instance is only ever reclaimed via this timeout).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const READ_POLL: Duration = Duration::from_millis(100);

/// Pump frames between `conn` and the worker's peer socket until the
/// connection closes, `cancel` is set, or `idle_timeout` elapses since the
/// last frame in either direction — then dispatch a `close` event and
/// complete the handle (§4.5 step 13, §6.5).
#[instrument(skip(handle, conn, cancel), level = Level::INFO)]
pub fn bridge(
    mut handle: WebSocketHandle,
    mut conn: impl HttpConnection,
    cancel: Arc<AtomicBool>,
    idle_timeout: Duration,
) {
    let mut last_activity = Instant::now();
    let mut last_ping = Instant::now();

    loop {
        if cancel.load(Ordering::SeqCst) {
            tracing::debug!("websocket bridge cancelled");
            break;
        }
        if last_activity.elapsed() >= idle_timeout {
            tracing::warn!(?idle_timeout, "websocket bridge idle timeout, forcing completion");
            break;
        }

        match conn.read_frame(READ_POLL) {
            Some(Frame::Text(text)) => {
                last_activity = Instant::now();
                let payload = serde_json::to_string(&text).unwrap_or_else(|_| "\"\"".to_string());
                if let Err(err) = handle.dispatch_message(&payload) {
                    tracing::warn!(%err, "failed to dispatch text frame to worker peer socket");
                }
            }
            Some(Frame::Binary(bytes)) => {
                last_activity = Instant::now();
                let payload = serde_json::json!({ "__binary_b64": base64_encode(&bytes) }).to_string();
                if let Err(err) = handle.dispatch_message(&payload) {
                    tracing::warn!(%err, "failed to dispatch binary frame to worker peer socket");
                }
            }
            None => {
                // Either the read timed out (keep looping) or the peer
                // closed cleanly. `read_frame` can't distinguish the two in
                // this minimal trait, so a real transport should return
                // quickly on close and let the idle/cancel checks above
                // catch a truly gone connection.
            }
        }

        if last_ping.elapsed() >= PING_INTERVAL {
            if conn.send_ping().is_err() {
                tracing::debug!("websocket peer unreachable for ping, ending bridge");
                break;
            }
            last_ping = Instant::now();
        }
    }

    if let Err(err) = handle.dispatch_close() {
        tracing::warn!(%err, "failed to dispatch close event to worker peer socket");
    }
    handle.complete();
}

fn base64_encode(bytes: &[u8]) -> String {
    worker_js_common::encode_base64(bytes)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::engine::{Engine, EnvSpec, HostRequest, Invocation, InvocationKind};
    use crate::instance::{Instance, InstanceBuilder};

    #[test]
    fn base64_encode_matches_worker_js_common() {
        assert_eq!(base64_encode(b"hi"), worker_js_common::encode_base64(b"hi"));
    }

    struct FixedSource(Arc<str>);

    impl crate::engine::SourceLoader for FixedSource {
        fn load_source(&self, _tenant: &str, _deployment: &str) -> Result<Arc<str>> {
            Ok(self.0.clone())
        }
    }

    struct PlainFactory;

    impl crate::engine::InstanceFactory for PlainFactory {
        fn build_instance(&self, _source: &str) -> Result<Instance> {
            InstanceBuilder::new().build()?.load_runtime()
        }
    }

    /// A fake HTTP-side connection that replays a fixed script of frames,
    /// then reports every subsequent read as an idle timeout (never
    /// signalling a clean close) so the bridge loop's exit relies on
    /// `cancel`, the same as a transport that never sends a close frame.
    struct ScriptedConnection {
        frames: Vec<Frame>,
        sent_count: Arc<AtomicUsize>,
    }

    impl HttpConnection for ScriptedConnection {
        fn read_frame(&mut self, _timeout: Duration) -> Option<Frame> {
            if self.frames.is_empty() {
                None
            } else {
                Some(self.frames.remove(0))
            }
        }

        fn send_frame(&mut self, _frame: Frame) -> Result<()> {
            self.sent_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn bridge_pumps_frames_then_completes_on_cancel() {
        let source = r#"
            class MessageEvent {
                constructor(type, init) { this.type = type; this.data = init.data; }
            }
            class CloseEvent {
                constructor(type) { this.type = type; }
            }
            let received = [];
            function fetch(req, env, ctx) {
                globalThis.__wsPeer = {
                    dispatchEvent(event) {
                        if (event.type === "message") received.push(event.data);
                    },
                };
                return new Response(null, { status: 101, webSocket: {} });
            }
        "#;
        let engine = Engine::new(
            crate::config::KernelConfig::default(),
            Arc::new(FixedSource(Arc::from(source))),
            Arc::new(PlainFactory),
        );
        let invocation = Invocation {
            tenant: "t1".to_string(),
            deployment: "d1".to_string(),
            env: EnvSpec::default(),
            kind: InvocationKind::Fetch(HostRequest {
                method: "GET".to_string(),
                url: "http://example.invalid/ws".to_string(),
                headers: vec![],
                body: None,
            }),
            deadline: None,
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let result = runtime.block_on(engine.execute(invocation)).unwrap();
        let handle = result.websocket.expect("fetch handler requested a websocket upgrade");

        let sent_count = Arc::new(AtomicUsize::new(0));
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_for_bridge = cancel.clone();
        let sent_count_for_bridge = sent_count.clone();
        let bridge_thread = std::thread::spawn(move || {
            let conn = ScriptedConnection {
                frames: vec![Frame::Text("hello".to_string())],
                sent_count: sent_count_for_bridge,
            };
            bridge(handle, conn, cancel_for_bridge, Duration::from_secs(60));
        });

        // Give the bridge time to read the scripted frame and dispatch it,
        // then cancel — the connection never reports a clean close on its own.
        std::thread::sleep(Duration::from_millis(150));
        cancel.store(true, Ordering::SeqCst);
        bridge_thread.join().expect("bridge thread should exit once cancelled");

        // The bridge never calls send_frame in this scenario (no worker ->
        // client traffic was produced), only read_frame.
        assert_eq!(sent_count.load(Ordering::SeqCst), 0);
    }
}
