//! Persistent WebSocket link to the coordinator.
//!
//! The link task owns the socket. It reconnects with exponential backoff on
//! involuntary close, decodes inbound frames, and reports everything to the
//! console as [`LinkEvent`]s. Sends are fire-and-forget: while the socket is
//! down they are logged and dropped, never queued for later.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pixel_fleet_core::codec;
use pixel_fleet_core::config::LinkConfig;
use pixel_fleet_core::protocol::{Frame, InboundMessage};
use pixel_fleet_core::throttle::LogThrottle;

const DECODE_LOG_TTL: Duration = Duration::from_secs(10);

/// Reconnect delay schedule: `min(base · multiplier^k, max)` for the k-th
/// consecutive failure, counted from zero.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            multiplier: multiplier.max(1.0),
            max,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            config.reconnect_multiplier,
            Duration::from_millis(config.reconnect_max_ms),
            config.max_reconnect_attempts,
        )
    }

    pub fn delay_for(&self, k: u32) -> Duration {
        let max_ms = self.max.as_millis() as f64;
        let ms = self.base.as_millis() as f64 * self.multiplier.powi(k.min(i32::MAX as u32) as i32);
        Duration::from_millis(ms.min(max_ms).floor() as u64)
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// What the link reports to its owner.
#[derive(Debug)]
pub enum LinkEvent {
    /// Socket open. `conn_id` is fresh for every connection.
    Connected { conn_id: String },
    Message(Frame),
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Retries exhausted; the link task has exited.
    GaveUp { attempts: u32 },
}

/// Sending side of a running link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
    threshold: usize,
}

impl LinkHandle {
    /// Send a message if the socket is open. Returns whether it was handed
    /// to the socket; a closed link logs and drops.
    pub fn send(&self, message: &Value) -> bool {
        let kind = message.get("type").and_then(Value::as_str).unwrap_or("?");
        if !self.is_open() {
            warn!(kind, "Link not open, dropping outbound message");
            return false;
        }
        let text = codec::compress_if_needed(message, self.threshold);
        if self.tx.send(text).is_err() {
            warn!(kind, "Link task gone, dropping outbound message");
            return false;
        }
        true
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stop the link for good. No reconnect follows.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

pub struct Link {
    url: String,
    backoff: Backoff,
    events: mpsc::UnboundedSender<LinkEvent>,
    outbound: mpsc::UnboundedReceiver<String>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
    throttle: LogThrottle,
}

enum Exit {
    Cancelled,
    Dropped(String),
}

impl Link {
    /// Start the link task. Events arrive on `events` until the handle is
    /// closed or retries run out.
    pub fn spawn(
        url: impl Into<String>,
        config: &LinkConfig,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> LinkHandle {
        let (tx, outbound) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let link = Link {
            url: url.into(),
            backoff: Backoff::from_config(config),
            events,
            outbound,
            open: open.clone(),
            cancel: cancel.clone(),
            throttle: LogThrottle::new(256, DECODE_LOG_TTL),
        };
        tokio::spawn(link.run());
        LinkHandle {
            tx,
            open,
            cancel,
            threshold: config.compression_threshold_bytes,
        }
    }

    async fn run(mut self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            debug!(url = %self.url, "Connecting to coordinator");
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = connect_async(self.url.as_str()) => res,
            };

            let reason = match connected {
                Ok((ws, _)) => {
                    let conn_id = Uuid::new_v4().to_string();
                    info!(url = %self.url, %conn_id, "Coordinator link open");
                    self.backoff.reset();
                    // anything queued while down is dropped, not replayed
                    while self.outbound.try_recv().is_ok() {}
                    self.open.store(true, Ordering::SeqCst);
                    let _ = self.events.send(LinkEvent::Connected { conn_id });

                    let exit = self.pump(ws).await;
                    self.open.store(false, Ordering::SeqCst);
                    match exit {
                        Exit::Cancelled => {
                            let _ = self.events.send(LinkEvent::Disconnected {
                                reason: "closed".into(),
                            });
                            break;
                        }
                        Exit::Dropped(reason) => {
                            warn!(%reason, "Coordinator link lost");
                            let _ = self.events.send(LinkEvent::Disconnected {
                                reason: reason.clone(),
                            });
                            reason
                        }
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, %e, "Coordinator connect failed");
                    e.to_string()
                }
            };

            let Some(delay) = self.backoff.next_delay() else {
                let attempts = self.backoff.attempts();
                error!(attempts, %reason, "Giving up on coordinator link");
                let _ = self.events.send(LinkEvent::GaveUp { attempts });
                break;
            };
            let attempt = self.backoff.attempts();
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            let _ = self.events.send(LinkEvent::Reconnecting { attempt, delay });
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.open.store(false, Ordering::SeqCst);
        debug!("Link task exiting");
    }

    async fn pump(
        &mut self,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    ) -> Exit {
        let (mut write, mut read) = ws.split();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Exit::Cancelled;
                }
                Some(text) = self.outbound.recv() => {
                    if let Err(e) = write.send(Message::Text(text.into())).await {
                        return Exit::Dropped(format!("send failed: {e}"));
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.deliver(text.as_str()),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.deliver(text),
                        Err(_) => {
                            self.throttle.log_once("link:binary", "Non-UTF-8 binary frame dropped", DECODE_LOG_TTL);
                        }
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if write.send(Message::Pong(data)).await.is_err() {
                            return Exit::Dropped("pong failed".into());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by coordinator ({})", f.code))
                            .unwrap_or_else(|| "closed by coordinator".into());
                        return Exit::Dropped(reason);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Exit::Dropped(e.to_string()),
                    None => return Exit::Dropped("stream ended".into()),
                },
            }
        }
    }

    fn deliver(&mut self, text: &str) {
        match InboundMessage::decode(text) {
            Ok(frame) => {
                let _ = self.events.send(LinkEvent::Message(frame));
            }
            Err(e) => {
                let now = Instant::now();
                self.throttle
                    .log_once_at("link:decode", &format!("Dropping frame: {e}"), DECODE_LOG_TTL, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(max_attempts: u32) -> Backoff {
        Backoff::from_config(&LinkConfig {
            max_reconnect_attempts: max_attempts,
            ..LinkConfig::default()
        })
    }

    #[test]
    fn test_delay_schedule() {
        let b = backoff(10);
        assert_eq!(b.delay_for(0), Duration::from_millis(3000));
        assert_eq!(b.delay_for(1), Duration::from_millis(4500));
        assert_eq!(b.delay_for(2), Duration::from_millis(6750));
        assert_eq!(b.delay_for(3), Duration::from_millis(10125));
        assert_eq!(b.delay_for(5), Duration::from_millis(22781));
        assert_eq!(b.delay_for(6), Duration::from_millis(30000));
        assert_eq!(b.delay_for(40), Duration::from_millis(30000));
    }

    #[test]
    fn test_attempts_cease_after_max() {
        let mut b = backoff(3);
        assert_eq!(b.next_delay(), Some(Duration::from_millis(3000)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(4500)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(6750)));
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.attempts(), 3);
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut b = backoff(5);
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(3000)));
    }

    #[tokio::test]
    async fn test_send_while_closed_drops() {
        let (events, _rx) = mpsc::unbounded_channel();
        let config = LinkConfig {
            max_reconnect_attempts: 0,
            ..LinkConfig::default()
        };
        // nothing listens on port 9; the first connect fails
        let handle = Link::spawn("ws://127.0.0.1:9/ws/ui", &config, events);
        assert!(!handle.is_open());
        assert!(!handle.send(&serde_json::json!({"type": "ping"})));
        handle.close();
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_gives_up_without_attempts() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let config = LinkConfig {
            max_reconnect_attempts: 0,
            ..LinkConfig::default()
        };
        let _handle = Link::spawn("ws://127.0.0.1:9/ws/ui", &config, events);
        let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(ev, LinkEvent::GaveUp { attempts: 0 }));
    }
}
