//! WebSocket relay channel
//!
//! One logical connection to the relay, re-established after a fixed delay
//! whenever it drops. Outbound frames go through the writer handle of the
//! live connection; while there is none, [`Channel::send`] fails fast with
//! `NotConnected` and nothing is queued. Inbound text frames are forwarded in
//! order to the receiver returned by [`RelayChannel::new`].

use core::time::Duration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use nmlink_core::{Channel, ChannelEvent, ChannelState, ConsoleConfig, ControlError};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

const EVENT_CAPACITY: usize = 64;

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ----------------------------------------------------------------------------
// Relay Channel
// ----------------------------------------------------------------------------

/// Reconnecting WebSocket channel to the relay
#[derive(Clone)]
pub struct RelayChannel {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    reconnect_delay: Duration,
    state: watch::Sender<ChannelState>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: mpsc::UnboundedSender<String>,
    events: broadcast::Sender<ChannelEvent>,
    running: AtomicBool,
    wake: Notify,
    shutdown: watch::Sender<bool>,
}

impl RelayChannel {
    /// Create a closed channel for `config.relay_address`
    ///
    /// Returns the channel and the receiver of every inbound text frame.
    /// Nothing connects until [`open`](Self::open) is called.
    pub fn new(config: &ConsoleConfig) -> Result<(Self, mpsc::UnboundedReceiver<String>)> {
        let url = parse_relay_url(&config.relay_address)?;
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(ChannelState::Closed);
        let (shutdown, _) = watch::channel(false);

        let channel = Self {
            inner: Arc::new(Inner {
                url,
                reconnect_delay: config.reconnect_delay(),
                state,
                writer: Mutex::new(None),
                inbound,
                events,
                running: AtomicBool::new(false),
                wake: Notify::new(),
                shutdown,
            }),
        };
        Ok((channel, inbound_rx))
    }

    /// Start the connection loop
    ///
    /// Idempotent: if the loop is already running and waiting out a
    /// reconnect delay, the wait is cut short. Must be called from within a
    /// tokio runtime.
    pub fn open(&self) -> Result<()> {
        if *self.inner.shutdown.borrow() {
            return Err(RelayError::ShutDown);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            self.inner.wake.notify_one();
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run().await;
            inner.running.store(false, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Stop reconnecting and close the live connection, if any
    pub fn shutdown(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down relay channel to {}", self.inner.url);
        self.inner.wake.notify_one();
        self.inner.lock_writer().take();
        self.inner.state.send_replace(ChannelState::Closed);
    }

    /// Subscribe to lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the connection state
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Relay URL this channel connects to
    pub fn url(&self) -> &str {
        &self.inner.url
    }
}

impl Channel for RelayChannel {
    fn send(&self, frame: String) -> nmlink_core::Result<()> {
        let writer = self.inner.lock_writer();
        match writer.as_ref() {
            Some(tx) if self.inner.state.borrow().is_open() => tx
                .send(Message::Text(frame))
                .map_err(|_| ControlError::NotConnected),
            _ => Err(ControlError::NotConnected),
        }
    }

    fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }
}

fn parse_relay_url(address: &str) -> Result<String> {
    let url = url::Url::parse(address).map_err(|e| RelayError::InvalidRelayUrl {
        url: address.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(RelayError::InvalidRelayUrl {
            url: address.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    Ok(url.to_string())
}

// ----------------------------------------------------------------------------
// Connection Loop
// ----------------------------------------------------------------------------

impl Inner {
    async fn run(&self) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.state.send_replace(ChannelState::Connecting);
            debug!("Connecting to relay {}", self.url);

            let reason = match connect_async(self.url.as_str()).await {
                Ok((stream, _response)) => self.serve(stream, &mut shutdown).await,
                Err(source) => RelayError::ConnectionFailed {
                    url: self.url.clone(),
                    source,
                }
                .to_string(),
            };

            self.lock_writer().take();
            self.state.send_replace(ChannelState::Closed);
            let _ = self.events.send(ChannelEvent::Closed {
                reason: reason.clone(),
            });

            if *shutdown.borrow() {
                break;
            }
            warn!(
                "Relay channel closed ({}), reconnecting in {:?}",
                reason, self.reconnect_delay
            );

            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_delay) => {}
                _ = self.wake.notified() => {
                    debug!("Reconnect delay cut short");
                }
                _ = shutdown.changed() => {}
            }
        }

        debug!("Relay connection loop for {} stopped", self.url);
    }

    /// Pump one live connection until it drops; returns why it dropped
    async fn serve(&self, stream: RelayStream, shutdown: &mut watch::Receiver<bool>) -> String {
        let (mut write, mut read) = stream.split();
        let (tx, mut outbound) = mpsc::unbounded_channel::<Message>();

        *self.lock_writer() = Some(tx);
        self.state.send_replace(ChannelState::Open);
        let _ = self.events.send(ChannelEvent::Opened);
        info!("Relay channel open to {}", self.url);

        loop {
            tokio::select! {
                message = outbound.recv() => {
                    let Some(message) = message else {
                        break "writer released".to_string();
                    };
                    if let Err(e) = write.send(message).await {
                        break format!("write failed: {}", e);
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let _ = self.inbound.send(text);
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            let _ = self.inbound.send(text);
                        }
                        Err(_) => warn!("Dropping non UTF-8 binary frame from relay"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!("closed by relay: {}", frame.reason),
                            None => "closed by relay".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("read failed: {}", e),
                    None => break "stream ended".to_string(),
                },
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    break "shut down".to_string();
                }
            }
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Message>>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
