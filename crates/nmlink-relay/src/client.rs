//! Console client
//!
//! Wires one [`RelayChannel`], one [`Multiplexer`], one [`PushDispatcher`]
//! and one [`TransferEngine`] together and runs the two background tasks
//! they need: the inbound pump and the pending-request sweep.

use core::time::Duration;
use std::sync::Arc;

use nmlink_core::{
    Channel, ChannelEvent, ChannelState, ConsoleConfig, ControlModule, ControlResponse,
    CorrelationId, DeviceTarget, Multiplexer, PendingResponse, PushDispatcher, PushFrame,
    SubscriptionFilter, SubscriptionHandle, TransferEngine, TransferEvent, TransferFile,
    TransferReport,
};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::RelayChannel;
use crate::error::{RelayError, Result};

// ----------------------------------------------------------------------------
// Console Client
// ----------------------------------------------------------------------------

/// High-level handle used by the CLI and embedding applications
pub struct ConsoleClient {
    channel: RelayChannel,
    multiplexer: Arc<Multiplexer>,
    transfers: TransferEngine,
    tasks: Vec<JoinHandle<()>>,
}

impl ConsoleClient {
    /// Validate `config`, start the background tasks and open the channel
    ///
    /// Returns as soon as the connection loop is running; use
    /// [`wait_until_open`](Self::wait_until_open) to wait for the relay.
    pub fn connect(config: ConsoleConfig) -> Result<Self> {
        config.validate()?;

        let (channel, inbound) = RelayChannel::new(&config)?;
        let dispatcher = Arc::new(PushDispatcher::new());
        let multiplexer = Arc::new(
            Multiplexer::new(Arc::new(channel.clone()), dispatcher)
                .with_request_timeout(config.request_timeout()),
        );
        let transfers = TransferEngine::new(Arc::clone(&multiplexer), config.transfer());

        let pump = tokio::spawn(pump_inbound(
            Arc::clone(&multiplexer),
            inbound,
            channel.events(),
            config.drain_pending_on_close,
        ));
        let sweeper = tokio::spawn(sweep_expired(
            Arc::clone(&multiplexer),
            config.sweep_interval(),
        ));

        channel.open()?;
        info!("Console client started for {}", channel.url());

        Ok(Self {
            channel,
            multiplexer,
            transfers,
            tasks: vec![pump, sweeper],
        })
    }

    /// Wait until the channel is open, at most `limit`
    pub async fn wait_until_open(&self, limit: Duration) -> Result<()> {
        let mut state = self.channel.watch_state();
        let opened = tokio::time::timeout(limit, state.wait_for(ChannelState::is_open))
            .await
            .map(|seen| seen.is_ok());
        match opened {
            Ok(true) => Ok(()),
            Ok(false) => Err(RelayError::ShutDown),
            Err(_) => Err(RelayError::OpenTimeout {
                url: self.channel.url().to_string(),
                waited_ms: limit.as_millis() as u64,
            }),
        }
    }

    /// Send a correlated command; see [`Multiplexer::call`]
    pub fn call(
        &self,
        module: impl Into<String>,
        payload: Value,
        target: &DeviceTarget,
    ) -> nmlink_core::Result<PendingResponse> {
        self.multiplexer.call(module, payload, target)
    }

    /// Send a correlated command with a callback; see [`Multiplexer::call_with`]
    pub fn call_with<F>(
        &self,
        module: impl Into<String>,
        payload: Value,
        target: &DeviceTarget,
        on_complete: F,
    ) -> nmlink_core::Result<CorrelationId>
    where
        F: FnOnce(nmlink_core::Result<ControlResponse>) + Send + 'static,
    {
        self.multiplexer.call_with(module, payload, target, on_complete)
    }

    /// Send a known module and wait for its response
    pub async fn request(
        &self,
        module: ControlModule,
        payload: Value,
        target: &DeviceTarget,
    ) -> nmlink_core::Result<ControlResponse> {
        self.multiplexer.call(module.as_str(), payload, target)?.await
    }

    /// Send a command without a correlation identifier
    pub fn notify(
        &self,
        module: impl Into<String>,
        payload: Value,
        target: &DeviceTarget,
    ) -> nmlink_core::Result<()> {
        self.multiplexer.notify(module, payload, target)
    }

    /// Register a push callback
    pub fn subscribe<F>(&self, filter: SubscriptionFilter, callback: F) -> SubscriptionHandle
    where
        F: Fn(&PushFrame) + Send + Sync + 'static,
    {
        self.multiplexer.dispatcher().subscribe(filter, callback)
    }

    /// Register a push subscription delivering into a channel
    pub fn subscribe_channel(
        &self,
        filter: SubscriptionFilter,
    ) -> (SubscriptionHandle, mpsc::UnboundedReceiver<PushFrame>) {
        self.multiplexer.dispatcher().subscribe_channel(filter)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.multiplexer.dispatcher().unsubscribe(handle)
    }

    /// Push a file to `target`; see [`TransferEngine::upload`]
    pub async fn upload<F>(
        &self,
        target: &DeviceTarget,
        file: TransferFile,
        observer: F,
    ) -> nmlink_core::Result<TransferReport>
    where
        F: FnMut(&TransferEvent),
    {
        self.transfers.upload(target, file, observer).await
    }

    /// Channel lifecycle events
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.channel.events()
    }

    pub fn state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }

    pub fn channel(&self) -> &RelayChannel {
        &self.channel
    }

    /// Close the channel, fail outstanding requests and stop the tasks
    pub fn shutdown(&mut self) {
        self.channel.shutdown();
        self.multiplexer.fail_all("console client shut down");
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ConsoleClient {
    fn drop(&mut self) {
        if !self.tasks.is_empty() {
            self.shutdown();
        }
    }
}

// ----------------------------------------------------------------------------
// Background Tasks
// ----------------------------------------------------------------------------

async fn pump_inbound(
    multiplexer: Arc<Multiplexer>,
    mut inbound: mpsc::UnboundedReceiver<String>,
    mut events: broadcast::Receiver<ChannelEvent>,
    drain_on_close: bool,
) {
    let mut events_open = true;
    loop {
        // Frames read before a loss are queued ahead of its Closed event and
        // must be routed before pending requests are drained.
        tokio::select! {
            biased;

            frame = inbound.recv() => {
                let Some(frame) = frame else {
                    debug!("Inbound stream closed, stopping pump");
                    break;
                };
                multiplexer.on_frame_received(&frame);
            }
            event = events.recv(), if events_open => match event {
                Ok(ChannelEvent::Closed { reason }) if drain_on_close => {
                    while let Ok(frame) = inbound.try_recv() {
                        multiplexer.on_frame_received(&frame);
                    }
                    multiplexer.fail_all(&reason);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Missed {} channel events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    events_open = false;
                }
            },
        }
    }
}

async fn sweep_expired(multiplexer: Arc<Multiplexer>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let expired = multiplexer.sweep_expired();
        if expired > 0 {
            debug!("Swept {} expired request(s)", expired);
        }
    }
}
