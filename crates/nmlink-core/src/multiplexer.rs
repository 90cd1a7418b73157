//! Correlation multiplexer
//!
//! Every request that expects a reply is tagged with a fresh
//! [`CorrelationId`] and parked in a pending map until the matching
//! `control_response` arrives. Responses may arrive in any order and
//! interleaved with push traffic; each pending entry is completed exactly
//! once, by its response, by its deadline, or by a channel drain.
//!
//! The pending map sits behind one mutex. `call` inserts the entry and hands
//! the frame to the channel while holding it, so a response can never be
//! routed before its entry exists. Completions always run after the lock is
//! released.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hashbrown::HashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::dispatcher::PushDispatcher;
use crate::errors::{ControlError, Result};
use crate::protocol::{ControlCommand, ControlResponse, InboundFrame, PushFrame};
use crate::types::{CorrelationId, CorrelationIdGenerator, DeviceTarget};

type CompletionCallback = Box<dyn FnOnce(Result<ControlResponse>) + Send>;

// ----------------------------------------------------------------------------
// Pending Requests
// ----------------------------------------------------------------------------

enum Completion {
    Future(oneshot::Sender<Result<ControlResponse>>),
    Callback(CompletionCallback),
}

impl Completion {
    fn complete(self, result: Result<ControlResponse>) {
        match self {
            // The caller may have dropped the future; nothing to deliver then.
            Self::Future(sender) => {
                let _ = sender.send(result);
            }
            Self::Callback(callback) => callback(result),
        }
    }
}

struct PendingRequest {
    module: String,
    created_at: Instant,
    deadline: Option<Instant>,
    completion: Completion,
}

/// Future resolving to the response of one correlated request
///
/// Dropping it does not cancel the request; the pending entry stays until
/// the response, its deadline, or a channel drain removes it.
#[derive(Debug)]
pub struct PendingResponse {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<Result<ControlResponse>>,
}

impl PendingResponse {
    /// Identifier the request was sent with
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Future for PendingResponse {
    type Output = Result<ControlResponse>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().receiver)
            .poll(cx)
            .map(|received| {
                received.unwrap_or_else(|_| {
                    Err(ControlError::channel_closed("multiplexer dropped the request"))
                })
            })
    }
}

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Completed the pending request with this identifier
    Resolved(CorrelationId),
    /// Handed to the push dispatcher, reaching `delivered` subscriptions
    Pushed { delivered: usize },
    /// Could not be parsed and was discarded
    Dropped,
}

// ----------------------------------------------------------------------------
// Multiplexer
// ----------------------------------------------------------------------------

/// Matches responses to the requests that caused them
pub struct Multiplexer {
    channel: Arc<dyn Channel>,
    dispatcher: Arc<PushDispatcher>,
    ids: CorrelationIdGenerator,
    pending: Mutex<HashMap<CorrelationId, PendingRequest>>,
    request_timeout: Option<Duration>,
}

impl Multiplexer {
    /// Create a multiplexer sending through `channel` and forwarding
    /// unmatched frames to `dispatcher`
    pub fn new(channel: Arc<dyn Channel>, dispatcher: Arc<PushDispatcher>) -> Self {
        Self {
            channel,
            dispatcher,
            ids: CorrelationIdGenerator::new(),
            pending: Mutex::new(HashMap::new()),
            request_timeout: None,
        }
    }

    /// Apply a default deadline to every request
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Use a specific identifier generator
    pub fn with_id_generator(mut self, ids: CorrelationIdGenerator) -> Self {
        self.ids = ids;
        self
    }

    /// Send a correlated command and get a future for its response
    ///
    /// Fails immediately with [`ControlError::NotConnected`] when the channel
    /// is not open; the pending map is left unchanged in that case.
    pub fn call(
        &self,
        module: impl Into<String>,
        payload: Value,
        target: &DeviceTarget,
    ) -> Result<PendingResponse> {
        self.call_with_timeout(module, payload, target, self.request_timeout)
    }

    /// Like [`call`](Self::call) with an explicit deadline (None = no deadline)
    pub fn call_with_timeout(
        &self,
        module: impl Into<String>,
        payload: Value,
        target: &DeviceTarget,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse> {
        let (sender, receiver) = oneshot::channel();
        let correlation_id = self.register(
            module.into(),
            payload,
            target,
            timeout,
            Completion::Future(sender),
        )?;
        Ok(PendingResponse {
            correlation_id,
            receiver,
        })
    }

    /// Send a correlated command and run `on_complete` with its outcome
    ///
    /// `on_complete` is invoked at most once. It is not invoked when this
    /// method itself returns an error.
    pub fn call_with<F>(
        &self,
        module: impl Into<String>,
        payload: Value,
        target: &DeviceTarget,
        on_complete: F,
    ) -> Result<CorrelationId>
    where
        F: FnOnce(Result<ControlResponse>) + Send + 'static,
    {
        self.register(
            module.into(),
            payload,
            target,
            self.request_timeout,
            Completion::Callback(Box::new(on_complete)),
        )
    }

    /// Send a command without a correlation identifier
    ///
    /// Any response the relay produces arrives as a push frame.
    pub fn notify(
        &self,
        module: impl Into<String>,
        payload: Value,
        target: &DeviceTarget,
    ) -> Result<()> {
        target.validate()?;
        let frame = ControlCommand::new(module, payload, target, None).to_frame()?;
        self.channel.send(frame)
    }

    fn register(
        &self,
        module: String,
        payload: Value,
        target: &DeviceTarget,
        timeout: Option<Duration>,
        completion: Completion,
    ) -> Result<CorrelationId> {
        target.validate()?;

        let correlation_id = self.ids.next_id();
        let frame = ControlCommand::new(
            module.clone(),
            payload,
            target,
            Some(correlation_id.clone()),
        )
        .to_frame()?;

        let created_at = Instant::now();
        let mut pending = self.lock_pending();
        pending.insert(
            correlation_id.clone(),
            PendingRequest {
                module: module.clone(),
                created_at,
                deadline: timeout.map(|timeout| created_at + timeout),
                completion,
            },
        );

        if let Err(err) = self.channel.send(frame) {
            pending.remove(&correlation_id);
            drop(pending);
            debug!("Request {} to {} not sent: {}", module, target, err);
            return Err(err);
        }
        drop(pending);

        debug!("Sent {} to {} as {}", module, target, correlation_id);
        Ok(correlation_id)
    }

    /// Route one raw inbound text frame
    pub fn on_frame_received(&self, text: &str) -> FrameDisposition {
        match InboundFrame::parse(text) {
            Ok(frame) => self.route(frame),
            Err(err) => {
                warn!("Dropping inbound frame: {}", err);
                FrameDisposition::Dropped
            }
        }
    }

    /// Route an already parsed inbound frame
    pub fn route(&self, frame: InboundFrame) -> FrameDisposition {
        if let Some(correlation_id) = frame.correlation_id.clone() {
            let entry = self.lock_pending().remove(&correlation_id);
            match entry {
                Some(request) => {
                    trace!(
                        "Response for {} ({}) after {:?}",
                        correlation_id,
                        request.module,
                        request.created_at.elapsed()
                    );
                    let response = ControlResponse::from_frame(&frame);
                    request.completion.complete(response);
                    return FrameDisposition::Resolved(correlation_id);
                }
                None => {
                    let err = ControlError::NoMatchingRequest {
                        correlation_id: correlation_id.to_string(),
                    };
                    warn!("{}", err);
                }
            }
        }

        let delivered = self.dispatcher.dispatch(&PushFrame::from(frame));
        FrameDisposition::Pushed { delivered }
    }

    /// Complete every request whose deadline has passed with
    /// [`ControlError::Timeout`]; returns how many expired
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(CorrelationId, PendingRequest)> = {
            let mut pending = self.lock_pending();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, request)| request.deadline.map_or(false, |deadline| deadline <= now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request)))
                .collect()
        };

        let count = expired.len();
        for (correlation_id, request) in expired {
            let waited = request
                .deadline
                .map_or(Duration::ZERO, |deadline| deadline - request.created_at);
            warn!(
                "Request {} ({}) timed out after {:?}",
                correlation_id, request.module, waited
            );
            request.completion.complete(Err(ControlError::Timeout {
                correlation_id: correlation_id.to_string(),
                duration_ms: waited.as_millis() as u64,
            }));
        }
        count
    }

    /// Complete every pending request with [`ControlError::ChannelClosed`]
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<(CorrelationId, PendingRequest)> = self.lock_pending().drain().collect();
        let count = drained.len();
        if count > 0 {
            warn!("Failing {} pending request(s): {}", count, reason);
        }
        for (_, request) in drained {
            request
                .completion
                .complete(Err(ControlError::channel_closed(reason)));
        }
        count
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Whether `correlation_id` is still awaiting a response
    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.lock_pending().contains_key(correlation_id)
    }

    /// Dispatcher receiving unmatched frames
    pub fn dispatcher(&self) -> &Arc<PushDispatcher> {
        &self.dispatcher
    }

    /// Channel used for outbound frames
    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<CorrelationId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::dispatcher::SubscriptionFilter;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingChannel {
        closed: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl Channel for RecordingChannel {
        fn send(&self, frame: String) -> Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ControlError::NotConnected);
            }
            self.sent.lock().unwrap().push(frame);
            Ok(())
        }

        fn state(&self) -> ChannelState {
            if self.closed.load(Ordering::SeqCst) {
                ChannelState::Closed
            } else {
                ChannelState::Open
            }
        }
    }

    fn setup() -> (Arc<RecordingChannel>, Multiplexer) {
        let channel = Arc::new(RecordingChannel::default());
        let multiplexer = Multiplexer::new(channel.clone(), Arc::new(PushDispatcher::new()))
            .with_id_generator(CorrelationIdGenerator::with_nonce(7));
        (channel, multiplexer)
    }

    fn target() -> DeviceTarget {
        DeviceTarget::new("SN1", "10.0.0.1", 9000).unwrap()
    }

    #[tokio::test]
    async fn test_response_resolves_future() {
        let (channel, mux) = setup();
        let pending = mux.call("query_rtc", json!({}), &target()).unwrap();
        let id = pending.correlation_id().clone();
        assert_eq!(channel.sent.lock().unwrap().len(), 1);

        let reply = ControlResponse::ok("query_rtc", json!({"date": "2024-01-01"}))
            .answering(&id)
            .to_frame()
            .unwrap();
        assert_eq!(mux.on_frame_received(&reply), FrameDisposition::Resolved(id));

        let response = pending.await.unwrap();
        assert!(response.success);
        assert_eq!(mux.pending_count(), 0);
    }

    #[test]
    fn test_callback_runs_once() {
        let (_channel, mux) = setup();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let id = mux
            .call_with("query_version", json!({}), &target(), move |result| {
                assert!(result.unwrap().success);
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let reply = ControlResponse::ok("query_version", json!({}))
            .answering(&id)
            .to_frame()
            .unwrap();
        mux.on_frame_received(&reply);
        // A duplicate reply finds no pending entry and goes to the dispatcher.
        assert_eq!(
            mux.on_frame_received(&reply),
            FrameDisposition::Pushed { delivered: 0 }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_not_connected_leaves_map_unchanged() {
        let (channel, mux) = setup();
        channel.closed.store(true, Ordering::SeqCst);
        let result = mux.call("query_rtc", json!({}), &target());
        assert!(matches!(result, Err(ControlError::NotConnected)));
        assert_eq!(mux.pending_count(), 0);
    }

    #[test]
    fn test_invalid_target_is_rejected_before_send() {
        let (channel, mux) = setup();
        let target = DeviceTarget {
            serial: String::new(),
            address: "10.0.0.1".to_string(),
            port: 9000,
        };
        assert!(matches!(
            mux.call("query_rtc", json!({}), &target),
            Err(ControlError::InvalidTarget(_))
        ));
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unmatched_frames_reach_subscribers() {
        let (_channel, mux) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        mux.dispatcher()
            .subscribe(SubscriptionFilter::kind("latest_report_data"), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

        let disposition =
            mux.on_frame_received(r#"{"type":"latest_report_data","sn":"SN1","data":{}}"#);
        assert_eq!(disposition, FrameDisposition::Pushed { delivered: 1 });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_garbage_is_dropped() {
        let (_channel, mux) = setup();
        assert_eq!(mux.on_frame_received("{not json"), FrameDisposition::Dropped);
        assert_eq!(mux.on_frame_received("42"), FrameDisposition::Dropped);
    }

    #[test]
    fn test_notify_has_no_correlation_id() {
        let (channel, mux) = setup();
        mux.notify("adu_rst", json!({"rst_type": 0}), &target()).unwrap();
        let sent = channel.sent.lock().unwrap();
        let frame: Value = serde_json::from_str(&sent[0]).unwrap();
        assert!(frame.get("frontend_request_id").is_none());
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_drains_pending() {
        let (_channel, mux) = setup();
        let first = mux.call("query_rtc", json!({}), &target()).unwrap();
        let second = mux.call("query_version", json!({}), &target()).unwrap();

        assert_eq!(mux.fail_all("relay went away"), 2);
        assert_eq!(mux.pending_count(), 0);
        assert!(matches!(first.await, Err(ControlError::ChannelClosed { .. })));
        assert!(matches!(second.await, Err(ControlError::ChannelClosed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_only_overdue_requests() {
        let (_channel, mux) = setup();
        let short = mux
            .call_with_timeout(
                "query_rtc",
                json!({}),
                &target(),
                Some(Duration::from_millis(100)),
            )
            .unwrap();
        let unbounded = mux.call("query_version", json!({}), &target()).unwrap();

        assert_eq!(mux.sweep_expired(), 0);
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(mux.sweep_expired(), 1);

        match short.await {
            Err(ControlError::Timeout { duration_ms, .. }) => assert_eq!(duration_ms, 100),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(mux.is_pending(unbounded.correlation_id()));
    }
}
