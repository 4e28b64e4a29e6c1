// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Test harness for the transaction layer.
//!
//! Provides message builders, a [`ManualClock`], recording fakes for both
//! collaborator traits and a [`Harness`] that wires them to an [`Engine`]
//! and steps time timer by timer.
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use sip_testkit::{build_options, Harness};
//!
//! let mut h = Harness::new();
//! h.transport.push_resolution([sip_testkit::udp_target(5060)]);
//! h.send(build_options("z9hG4bKdoc"));
//! h.advance(Duration::from_millis(500));
//! assert_eq!(h.transport.sent().len(), 2);
//! ```

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::Mutex;
use sip_core::{helpers, Headers, Method, Request, RequestLine, Response, SipMessage};
use sip_transaction::{
    AppMessage, Availability, Clock, DnsResolution, Engine, Event, RejectionBehavior, Target,
    TransactionConfig, TransactionId, TransactionKey, TransmitState, Transport,
    TransportCoordinator, TuDispatcher, TuId, WireMessage,
};
use smol_str::SmolStr;

/// Owner used by [`RecordingTu::new`] and [`Harness::send`].
pub const TU: TuId = TuId(1);

// ----- builders -----

/// Builds a request with a UDP Via carrying `branch`.
pub fn build_request(method: Method, branch: &str) -> Request {
    build_request_over(method, branch, "UDP")
}

/// Builds a request whose top Via names `transport`.
pub fn build_request_over(method: Method, branch: &str, transport: &str) -> Request {
    let mut headers = Headers::new();
    headers.push(
        "Via",
        format!("SIP/2.0/{} client.example.com:5060;branch={}", transport, branch),
    );
    headers.push("Max-Forwards", "70");
    headers.push("From", "<sip:alice@example.com>;tag=1234");
    headers.push("To", "<sip:bob@example.com>");
    headers.push("Call-ID", SmolStr::new(format!("{}@client.example.com", branch)));
    headers.push("CSeq", SmolStr::new(format!("1 {}", method.as_str())));
    headers.push("Content-Length", "0");

    Request::new(RequestLine::new(method, "sip:bob@example.com"), headers, Bytes::new())
        .expect("test request is well formed")
}

pub fn build_invite(branch: &str) -> Request {
    build_request(Method::Invite, branch)
}

pub fn build_options(branch: &str) -> Request {
    build_request(Method::Options, branch)
}

/// Builds a response to `request` with the default reason phrase.
pub fn build_response(request: &Request, code: u16) -> Response {
    helpers::make_response(request, code, None)
}

pub fn build_cancel(invite: &Request) -> Request {
    helpers::make_cancel(invite)
}

pub fn build_failure_ack(invite: &Request, response: &Response) -> Request {
    helpers::make_failure_ack(invite, response)
}

/// Key of the client transaction created for a request with `branch`.
pub fn client_key(branch: &str) -> TransactionKey {
    TransactionKey::client(TransactionId::new(branch.to_ascii_lowercase()))
}

/// Key of the server transaction created for a request with `branch`.
pub fn server_key(branch: &str) -> TransactionKey {
    TransactionKey::server(TransactionId::new(branch.to_ascii_lowercase()))
}

pub fn udp_target(port: u16) -> Target {
    target(port, Transport::Udp)
}

pub fn tcp_target(port: u16) -> Target {
    target(port, Transport::Tcp)
}

fn target(port: u16, transport: Transport) -> Target {
    let addr = SocketAddr::from(([192, 0, 2, 10], port));
    Target::new(addr, transport)
}

/// Where requests received in tests come from.
pub fn peer(transport: Transport) -> Target {
    Target::new(SocketAddr::from(([198, 51, 100, 7], 5060)), transport)
}

/// Installs a fmt subscriber honouring `RUST_LOG`. Safe to call from every
/// test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ----- clock -----

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    start: Instant,
    now: Arc<Mutex<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let start = Instant::now();
        Self {
            start,
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    /// Time since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.now.lock().saturating_duration_since(self.start)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

// ----- transport -----

/// One message handed to the transport.
#[derive(Debug, Clone)]
pub struct Sent {
    pub key: TransactionKey,
    pub message: SipMessage,
    pub target: Target,
    pub retransmission: bool,
    /// [`ManualClock::elapsed`] at the time of sending.
    pub at: Duration,
}

impl Sent {
    pub fn code(&self) -> Option<u16> {
        self.message.as_response().map(Response::code)
    }

    pub fn method(&self) -> Option<Method> {
        self.message.as_request().map(|r| r.method().clone())
    }
}

/// Shared state behind a [`ScriptedResolution`].
#[derive(Debug, Default)]
pub struct ResolutionScript {
    pub targets: VecDeque<Target>,
    /// Report `Pending` once targets run out.
    pub pending: bool,
    pub last: Option<Target>,
    pub greylisted: Vec<Target>,
    pub blacklisted: Vec<Target>,
    pub whitelisted: Vec<Target>,
    pub released: usize,
}

/// Test-side view of a resolution handed to the engine.
#[derive(Debug, Clone, Default)]
pub struct ResolutionProbe(Arc<Mutex<ResolutionScript>>);

impl ResolutionProbe {
    /// Makes another target available, clearing `pending`.
    pub fn push_target(&self, target: Target) {
        let mut script = self.0.lock();
        script.targets.push_back(target);
        script.pending = false;
    }

    /// Reports `Pending` once the queued targets run out.
    pub fn keep_pending(&self) {
        self.0.lock().pending = true;
    }

    /// Ends a pending resolution with no more targets.
    pub fn finish(&self) {
        self.0.lock().pending = false;
    }

    pub fn greylisted(&self) -> Vec<Target> {
        self.0.lock().greylisted.clone()
    }

    pub fn blacklisted(&self) -> Vec<Target> {
        self.0.lock().blacklisted.clone()
    }

    pub fn whitelisted(&self) -> Vec<Target> {
        self.0.lock().whitelisted.clone()
    }

    pub fn released(&self) -> usize {
        self.0.lock().released
    }
}

/// [`DnsResolution`] that plays back a [`ResolutionScript`].
#[derive(Debug)]
pub struct ScriptedResolution(Arc<Mutex<ResolutionScript>>);

impl DnsResolution for ScriptedResolution {
    fn availability(&mut self) -> Availability {
        let script = self.0.lock();
        if !script.targets.is_empty() {
            Availability::Available
        } else if script.pending {
            Availability::Pending
        } else {
            Availability::Finished
        }
    }

    fn next(&mut self) -> Option<Target> {
        let mut script = self.0.lock();
        let target = script.targets.pop_front();
        script.last = target;
        target
    }

    fn greylist_last(&mut self, _until: Instant) {
        let mut script = self.0.lock();
        if let Some(last) = script.last {
            script.greylisted.push(last);
        }
    }

    fn blacklist_last(&mut self, _until: Instant) {
        let mut script = self.0.lock();
        if let Some(last) = script.last {
            script.blacklisted.push(last);
        }
    }

    fn whitelist_last(&mut self) {
        let mut script = self.0.lock();
        if let Some(last) = script.last {
            script.whitelisted.push(last);
        }
    }

    fn release(&mut self) {
        self.0.lock().released += 1;
    }
}

/// [`TransportCoordinator`] that records every send.
///
/// Resolutions are served from a queue filled with
/// [`push_resolution`](Self::push_resolution); with the queue empty a
/// resolution finishes without targets.
#[derive(Debug)]
pub struct RecordingTransport {
    clock: ManualClock,
    sent: Mutex<Vec<Sent>>,
    scripts: Mutex<VecDeque<ResolutionProbe>>,
    resolved: Mutex<Vec<TransactionKey>>,
    accept: AtomicBool,
}

impl RecordingTransport {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            sent: Mutex::new(Vec::new()),
            scripts: Mutex::new(VecDeque::new()),
            resolved: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
        }
    }

    /// Queues the result of the next `resolve` call.
    pub fn push_resolution(&self, targets: impl IntoIterator<Item = Target>) -> ResolutionProbe {
        let probe = ResolutionProbe::default();
        probe.0.lock().targets.extend(targets);
        self.scripts.lock().push_back(probe.clone());
        probe
    }

    /// Queues a resolution that stays `Pending` until the test feeds it.
    pub fn push_pending_resolution(&self) -> ResolutionProbe {
        let probe = ResolutionProbe::default();
        probe.0.lock().pending = true;
        self.scripts.lock().push_back(probe.clone());
        probe
    }

    /// Makes `transmit` report `Unsent`.
    pub fn set_accepting(&self, accept: bool) {
        self.accept.store(accept, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    pub fn sent_for(&self, key: &TransactionKey) -> Vec<Sent> {
        self.sent
            .lock()
            .iter()
            .filter(|s| &s.key == key)
            .cloned()
            .collect()
    }

    /// Drains what was sent so far.
    pub fn take_sent(&self) -> Vec<Sent> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Keys for which a resolution was started, in order.
    pub fn resolved(&self) -> Vec<TransactionKey> {
        self.resolved.lock().clone()
    }

    fn record(&self, key: &TransactionKey, message: &SipMessage, target: &Target, retransmission: bool) {
        self.sent.lock().push(Sent {
            key: key.clone(),
            message: message.clone(),
            target: *target,
            retransmission,
            at: self.clock.elapsed(),
        });
    }
}

impl TransportCoordinator for RecordingTransport {
    fn transmit(&self, key: &TransactionKey, message: &SipMessage, target: &Target) -> TransmitState {
        self.record(key, message, target, false);
        if self.accept.load(Ordering::SeqCst) {
            TransmitState::Sent
        } else {
            TransmitState::Unsent
        }
    }

    fn retransmit(&self, key: &TransactionKey, message: &SipMessage, target: &Target) {
        self.record(key, message, target, true);
    }

    fn resolve(&self, key: &TransactionKey, _request: &Request) -> Box<dyn DnsResolution> {
        self.resolved.lock().push(key.clone());
        let probe = self.scripts.lock().pop_front().unwrap_or_default();
        Box::new(ScriptedResolution(probe.0))
    }
}

// ----- TU -----

/// One message handed to a TU.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub owner: TuId,
    pub key: TransactionKey,
    pub message: SipMessage,
}

/// [`TuDispatcher`] that records deliveries and lets tests flip its
/// congestion knobs.
#[derive(Debug)]
pub struct RecordingTu {
    owner: Mutex<Option<TuId>>,
    deliveries: Mutex<Vec<Delivery>>,
    terminations: Mutex<Vec<(TuId, TransactionKey)>>,
    wants_notices: AtomicBool,
    behavior: Mutex<RejectionBehavior>,
    expected_wait: AtomicU32,
    responses_mandatory: AtomicBool,
}

impl RecordingTu {
    /// A TU that owns every inbound request as `owner`.
    pub fn new(owner: TuId) -> Self {
        Self {
            owner: Mutex::new(Some(owner)),
            deliveries: Mutex::new(Vec::new()),
            terminations: Mutex::new(Vec::new()),
            wants_notices: AtomicBool::new(true),
            behavior: Mutex::new(RejectionBehavior::Normal),
            expected_wait: AtomicU32::new(0),
            responses_mandatory: AtomicBool::new(true),
        }
    }

    /// `None` rejects every new inbound request.
    pub fn set_owner(&self, owner: Option<TuId>) {
        *self.owner.lock() = owner;
    }

    pub fn set_wants_notices(&self, wants: bool) {
        self.wants_notices.store(wants, Ordering::SeqCst);
    }

    pub fn set_behavior(&self, behavior: RejectionBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn set_expected_wait(&self, secs: u32) {
        self.expected_wait.store(secs, Ordering::SeqCst);
    }

    pub fn set_responses_mandatory(&self, mandatory: bool) {
        self.responses_mandatory.store(mandatory, Ordering::SeqCst);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().clone()
    }

    /// Status codes of delivered responses, in order.
    pub fn response_codes(&self) -> Vec<u16> {
        self.deliveries
            .lock()
            .iter()
            .filter_map(|d| d.message.as_response().map(Response::code))
            .collect()
    }

    pub fn responses(&self) -> Vec<Response> {
        self.deliveries
            .lock()
            .iter()
            .filter_map(|d| d.message.as_response().cloned())
            .collect()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.deliveries
            .lock()
            .iter()
            .filter_map(|d| d.message.as_request().cloned())
            .collect()
    }

    pub fn terminations(&self) -> Vec<(TuId, TransactionKey)> {
        self.terminations.lock().clone()
    }

    pub fn was_terminated(&self, key: &TransactionKey) -> bool {
        self.terminations.lock().iter().any(|(_, k)| k == key)
    }
}

impl Default for RecordingTu {
    fn default() -> Self {
        Self::new(TU)
    }
}

impl TuDispatcher for RecordingTu {
    fn select_owner(&self, _request: &Request) -> Option<TuId> {
        *self.owner.lock()
    }

    fn deliver(&self, owner: TuId, key: &TransactionKey, message: SipMessage) {
        self.deliveries.lock().push(Delivery {
            owner,
            key: key.clone(),
            message,
        });
    }

    fn notify_terminated(&self, owner: TuId, key: &TransactionKey) {
        self.terminations.lock().push((owner, key.clone()));
    }

    fn wants_termination_notices(&self, _owner: TuId) -> bool {
        self.wants_notices.load(Ordering::SeqCst)
    }

    fn rejection_behavior(&self, _owner: TuId) -> RejectionBehavior {
        *self.behavior.lock()
    }

    fn expected_wait_secs(&self, _owner: TuId) -> u32 {
        self.expected_wait.load(Ordering::SeqCst)
    }

    fn responses_mandatory(&self, _owner: TuId) -> bool {
        self.responses_mandatory.load(Ordering::SeqCst)
    }
}

// ----- harness -----

/// An [`Engine`] wired to recording fakes and a manual clock.
pub struct Harness {
    pub engine: Engine,
    pub clock: ManualClock,
    pub transport: Arc<RecordingTransport>,
    pub tu: Arc<RecordingTu>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(TransactionConfig::default())
    }

    pub fn with_config(config: TransactionConfig) -> Self {
        init_tracing();
        let clock = ManualClock::new();
        let transport = Arc::new(RecordingTransport::new(clock.clone()));
        let tu = Arc::new(RecordingTu::default());
        let engine = Engine::with_clock(
            config,
            transport.clone(),
            tu.clone(),
            Arc::new(clock.clone()),
        );
        Self {
            engine,
            clock,
            transport,
            tu,
        }
    }

    /// Moves time forward by `by`, stopping at every timer on the way so
    /// each fires at its exact due time.
    pub fn advance(&mut self, by: Duration) {
        let deadline = self.clock.elapsed() + by;
        while let Some(wait) = self.engine.time_until_next_timer() {
            if self.clock.elapsed() + wait > deadline {
                break;
            }
            self.clock.advance(wait);
            self.engine.process_due_timers();
        }
        let remaining = deadline.saturating_sub(self.clock.elapsed());
        self.clock.advance(remaining);
    }

    /// Delivers `message` as if received over UDP.
    pub fn receive(&mut self, message: impl Into<SipMessage>) {
        self.receive_from(message, peer(Transport::Udp));
    }

    pub fn receive_from(&mut self, message: impl Into<SipMessage>, source: Target) {
        self.engine
            .handle(Event::Wire(WireMessage::new(message, source)));
    }

    /// Sends `message` down from [`TU`], resolving its destination.
    pub fn send(&mut self, message: impl Into<SipMessage>) {
        self.engine
            .handle(Event::Application(AppMessage::new(message, TU)));
    }

    /// Sends `message` down from [`TU`] straight to `destination`.
    pub fn send_to(&mut self, message: impl Into<SipMessage>, destination: Target) {
        let app = AppMessage::new(message, TU).with_destination(destination);
        self.engine.handle(Event::Application(app));
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
