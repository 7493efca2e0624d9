//! # Transaction state machines
//!
//! One [`TransactionState`] per transaction, driven by the controller through
//! a [`TransactionEnv`]: the only way a machine reaches the wire, the timer
//! queue, DNS or the transaction user. Every input returns a [`Disposition`]
//! telling the controller whether to keep the transaction.
//!
//! ## Machines
//!
//! | machine            | states                                   | RFC 3261 |
//! |--------------------|------------------------------------------|----------|
//! | `ClientInvite`     | Calling, Proceeding, Completed           | 17.1.1   |
//! | `ClientNonInvite`  | Trying, Proceeding, Completed            | 17.1.2   |
//! | `ServerInvite`     | Proceeding, Completed, Confirmed         | 17.2.1   |
//! | `ServerNonInvite`  | Trying, Proceeding, Completed            | 17.2.2   |
//! | `ClientStale`      | Terminated (after a 2xx, passes more 2xx)| RFC 6026 |
//! | `ServerStale`      | Terminated (after a 2xx, absorbs INVITEs)| RFC 6026 |
//! | `Stateless`        | Trying (TU ACKs and stateless responses) |          |
//!
//! Client machines pick targets from a DNS result. A transport failure
//! greylists the current target and moves on to the next one; when none are
//! left the TU gets a locally generated 503 carrying a `Warning: 399`.
//!
//! Retransmission timers are never cancelled. A timer that fires in a state
//! where it no longer applies is ignored.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use voxstack_sip_core::{
    make_cancel, make_failure_ack, make_response, make_warning, HeaderName, Message, Method,
    Request, Response, StatusCode, Uri,
};
use voxstack_sip_transport::{
    DnsResultHandle, DnsState, FailureReason, SendData, Tuple,
};

use crate::message::{TransactionFailure, TuEvent};
use crate::timer::{TimerKind, TimerMessage, TimerSettings};

/// How long a target that failed at the transport layer is tried last
pub const GREYLIST_DURATION: Duration = Duration::from_secs(32);

/// Appended to an INVITE's transaction id to key its CANCEL transaction
pub const CANCEL_SUFFIX: &str = "cancel";

/// Appended to a transaction id to key a TU-originated ACK
pub const ACK_SUFFIX: &str = "ack";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Machine {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
    ClientStale,
    ServerStale,
    Stateless,
}

impl Machine {
    pub fn is_client(&self) -> bool {
        matches!(
            self,
            Machine::ClientInvite | Machine::ClientNonInvite | Machine::ClientStale | Machine::Stateless
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
    /// Saw input that cannot belong to this transaction
    Bogus,
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Terminate,
}

/// Services a machine needs from its controller
pub trait TransactionEnv {
    fn settings(&self) -> &TimerSettings;

    /// Schedules a timer for `tid`, returning its id
    fn add_timer(&mut self, tid: &str, kind: TimerKind, duration: Duration) -> u64;

    /// Picks a transport, fills in local addresses and queues the message
    fn transmit(&mut self, message: &mut Message, target: &Tuple, tid: &str) -> Result<SendData, FailureReason>;

    /// Queues already encoded data again on the transport it names
    fn retransmit(&mut self, data: &SendData) -> Result<(), FailureReason>;

    fn create_dns_result(&mut self, tid: &str) -> DnsResultHandle;

    fn dns_lookup(&mut self, result: &DnsResultHandle, target: &Uri) -> DnsState;

    fn deliver(&mut self, event: TuEvent);

    /// Hands over a new client transaction (a CANCEL) to be started and stored
    fn add_client_transaction(&mut self, tid: String, state: TransactionState);
}

pub struct TransactionState {
    tid: String,
    machine: Machine,
    state: State,
    is_reliable: bool,
    /// CANCEL transactions never report to the TU
    is_cancel: bool,
    /// What the TU handed down, sent afresh to each new target
    pristine: Option<Message>,
    /// Client: the request as last transmitted. Server: the request received.
    request: Option<Request>,
    /// Last message queued, replayed on retransmission
    last_sent: Option<SendData>,
    /// Client: the current target. Server: where the request came from.
    target: Option<Tuple>,
    explicit_target: bool,
    dns: Option<DnsResultHandle>,
    waiting_for_dns: bool,
    retransmit_armed: bool,
    cancel_pending: bool,
    timer_c: u64,
    failure_reason: FailureReason,
}

impl TransactionState {
    fn blank(tid: String, machine: Machine, state: State) -> Self {
        TransactionState {
            tid,
            machine,
            state,
            is_reliable: false,
            is_cancel: false,
            pristine: None,
            request: None,
            last_sent: None,
            target: None,
            explicit_target: false,
            dns: None,
            waiting_for_dns: false,
            retransmit_armed: false,
            cancel_pending: false,
            timer_c: 0,
            failure_reason: FailureReason::None,
        }
    }

    /// A client transaction for a TU request. ACKs get a stateless machine.
    pub fn new_client(tid: impl Into<String>, request: Request, target: Option<Tuple>) -> Self {
        let (machine, state) = match request.method {
            Method::Invite => (Machine::ClientInvite, State::Calling),
            Method::Ack => (Machine::Stateless, State::Trying),
            _ => (Machine::ClientNonInvite, State::Trying),
        };
        let mut tx = TransactionState::blank(tid.into(), machine, state);
        tx.explicit_target = target.is_some();
        tx.target = target;
        tx.pristine = Some(request.into());
        tx
    }

    /// A stateless send of a TU response with no server transaction
    pub fn new_stateless(tid: impl Into<String>, message: Message, target: Option<Tuple>) -> Self {
        let mut tx = TransactionState::blank(tid.into(), Machine::Stateless, State::Trying);
        tx.explicit_target = target.is_some();
        tx.target = target;
        tx.pristine = Some(message);
        tx
    }

    /// A server transaction for a request that arrived from `source`
    pub fn new_server(tid: impl Into<String>, request: Request, source: Tuple) -> Self {
        let (machine, state) = if request.method == Method::Invite {
            (Machine::ServerInvite, State::Proceeding)
        } else {
            (Machine::ServerNonInvite, State::Trying)
        };
        let mut tx = TransactionState::blank(tid.into(), machine, state);
        tx.is_reliable = source.transport_type().is_reliable();
        tx.is_cancel = request.method == Method::Cancel;
        tx.target = Some(source);
        tx.request = Some(request);
        tx
    }

    pub fn tid(&self) -> &str {
        &self.tid
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_reliable(&self) -> bool {
        self.is_reliable
    }

    pub fn target(&self) -> Option<&Tuple> {
        self.target.as_ref()
    }

    pub fn failure_reason(&self) -> FailureReason {
        self.failure_reason
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            trace!(tid = %self.tid, machine = %self.machine, from = %self.state, to = %state, "state change");
            self.state = state;
        }
    }

    fn terminate(&mut self) -> Disposition {
        self.set_state(State::Terminated);
        Disposition::Terminate
    }

    fn bogus(&mut self, what: &str) -> Disposition {
        warn!(tid = %self.tid, machine = %self.machine, state = %self.state, "{}, discarding transaction", what);
        self.state = State::Bogus;
        Disposition::Terminate
    }

    fn deliver(&self, env: &mut dyn TransactionEnv, event: TuEvent) {
        if !self.is_cancel {
            env.deliver(event);
        }
    }

    /// Starts a client or stateless transaction
    pub fn start_client(&mut self, env: &mut dyn TransactionEnv) -> Disposition {
        let settings = env.settings().clone();
        match self.machine {
            Machine::ClientInvite => {
                env.add_timer(&self.tid, TimerKind::B, settings.timer_b());
            }
            Machine::ClientNonInvite => {
                env.add_timer(&self.tid, TimerKind::F, settings.timer_f());
            }
            Machine::Stateless => {
                env.add_timer(&self.tid, TimerKind::Stateless, settings.stateless);
            }
            _ => return self.bogus("client start on a server machine"),
        }
        debug!(tid = %self.tid, machine = %self.machine, "client transaction started");
        self.begin_sending(env)
    }

    /// Starts a server transaction, passing the request up unless it is a CANCEL
    pub fn start_server(&mut self, env: &mut dyn TransactionEnv) -> Disposition {
        let (Some(request), Some(source)) = (self.request.clone(), self.target.clone()) else {
            return self.bogus("server transaction without a request");
        };
        self.deliver(
            env,
            TuEvent::Request {
                tid: self.tid.clone(),
                message: request.into(),
                source,
            },
        );
        let settings = env.settings().clone();
        match self.machine {
            Machine::ServerInvite => {
                env.add_timer(&self.tid, TimerKind::Trying, settings.t100);
            }
            Machine::ServerNonInvite if !self.is_reliable => {
                env.add_timer(&self.tid, TimerKind::Trying, settings.trying);
            }
            _ => {}
        }
        Disposition::Keep
    }

    /// Where DNS should look: the first Route, else the Request-URI. A
    /// stateless response goes back along its top Via.
    fn routing_uri(&self) -> Option<Uri> {
        let message = self.pristine.as_ref()?;
        match message {
            Message::Request(request) => Some(
                message
                    .routes()
                    .next()
                    .map(|route| route.uri.clone())
                    .unwrap_or_else(|| request.uri.clone()),
            ),
            Message::Response(_) => {
                let via = message.top_via()?;
                let host = via.received().unwrap_or(via.sent_host.as_str()).to_string();
                let mut uri = Uri::sip(host);
                uri.port = via.rport().flatten().or(via.sent_port);
                uri.params.set("transport", Some(via.transport.to_ascii_lowercase()));
                Some(uri)
            }
        }
    }

    fn begin_sending(&mut self, env: &mut dyn TransactionEnv) -> Disposition {
        if self.explicit_target {
            if let Some(target) = self.target.clone() {
                if self.send_to(env, target) {
                    return Disposition::Keep;
                }
            }
            return self.no_more_targets(env);
        }

        let Some(uri) = self.routing_uri() else {
            return self.no_more_targets(env);
        };
        let result = env.create_dns_result(&self.tid);
        let state = env.dns_lookup(&result, &uri);
        trace!(tid = %self.tid, %uri, ?state, "dns lookup started");
        self.dns = Some(result);
        if state == DnsState::Pending {
            self.waiting_for_dns = true;
            return Disposition::Keep;
        }
        self.try_next_target(env)
    }

    fn try_next_target(&mut self, env: &mut dyn TransactionEnv) -> Disposition {
        self.waiting_for_dns = false;
        loop {
            let (next, dns_state) = match &self.dns {
                Some(dns) => {
                    let mut result = dns.lock();
                    let next = result.next();
                    (next, result.state())
                }
                None => (None, DnsState::Finished),
            };
            match next {
                Some(target) => {
                    if self.send_to(env, target) {
                        return Disposition::Keep;
                    }
                }
                None if dns_state == DnsState::Pending => {
                    self.waiting_for_dns = true;
                    return Disposition::Keep;
                }
                None => return self.no_more_targets(env),
            }
        }
    }

    /// Sends the TU's message to `target`; false when it failed outright
    fn send_to(&mut self, env: &mut dyn TransactionEnv, target: Tuple) -> bool {
        let Some(mut message) = self.pristine.clone() else {
            return false;
        };
        self.is_reliable = target.transport_type().is_reliable();
        self.target = Some(target.clone());
        match env.transmit(&mut message, &target, &self.tid) {
            Ok(sent) => {
                debug!(tid = %self.tid, %target, "sent");
                self.last_sent = Some(sent);
                if let Message::Request(request) = message {
                    self.request = Some(request);
                }
                self.arm_retransmit(env);
                true
            }
            Err(reason) => {
                debug!(tid = %self.tid, %target, %reason, "send failed");
                self.note_failure(reason);
                self.greylist_target();
                false
            }
        }
    }

    fn arm_retransmit(&mut self, env: &mut dyn TransactionEnv) {
        if self.retransmit_armed || self.is_reliable {
            return;
        }
        let t1 = env.settings().t1;
        match self.machine {
            Machine::ClientInvite => {
                env.add_timer(&self.tid, TimerKind::A, t1);
            }
            Machine::ClientNonInvite => {
                env.add_timer(&self.tid, TimerKind::E1, t1);
            }
            _ => return,
        }
        self.retransmit_armed = true;
    }

    fn note_failure(&mut self, reason: FailureReason) {
        self.failure_reason = self.failure_reason.max(reason);
    }

    fn greylist_target(&self) {
        if let (Some(dns), Some(target)) = (&self.dns, &self.target) {
            dns.lock().greylist(target, GREYLIST_DURATION);
        }
    }

    fn whitelist_target(&self) {
        if let (Some(dns), Some(target)) = (&self.dns, &self.target) {
            dns.lock().whitelist(target);
        }
    }

    fn resend(&mut self, env: &mut dyn TransactionEnv) -> Disposition {
        let Some(sent) = &self.last_sent else {
            return Disposition::Keep;
        };
        match env.retransmit(sent) {
            Ok(()) => Disposition::Keep,
            Err(reason) => self.process_transport_failure(env, reason),
        }
    }

    fn original_request(&self) -> Option<&Request> {
        self.request.as_ref().or_else(|| self.pristine.as_ref()?.as_request())
    }

    /// Every target failed: report a local 503 (or 430/410 for a dead flow)
    fn no_more_targets(&mut self, env: &mut dyn TransactionEnv) -> Disposition {
        let reportable = matches!(self.machine, Machine::ClientInvite | Machine::ClientNonInvite)
            && matches!(self.state, State::Calling | State::Trying | State::Proceeding);
        if reportable {
            if let Some(request) = self.original_request() {
                let response = self.no_targets_response(request);
                let reason = if self.failure_reason == FailureReason::None {
                    TransactionFailure::NoDnsResults
                } else {
                    TransactionFailure::TransportFailure(self.failure_reason)
                };
                info!(tid = %self.tid, %reason, status = %response.status, "no usable target");
                self.deliver(
                    env,
                    TuEvent::Failure {
                        tid: self.tid.clone(),
                        reason,
                        response: Some(response.into()),
                    },
                );
            }
        } else {
            debug!(tid = %self.tid, machine = %self.machine, "no usable target");
        }
        self.terminate()
    }

    fn no_targets_response(&self, request: &Request) -> Response {
        let flow = self
            .target
            .as_ref()
            .is_some_and(|t| t.only_use_existing_connection());
        let status = if flow {
            let routed = request.headers.iter().any(|h| h.is(HeaderName::Route));
            if routed {
                StatusCode::FLOW_FAILED
            } else {
                StatusCode::GONE
            }
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        let text = if self.failure_reason == FailureReason::None {
            "No other DNS entries to try".to_string()
        } else {
            format!("Transport failure: {}", self.failure_reason)
        };
        let agent = match &self.target {
            Some(t) => t.ip().to_string(),
            None => request.uri.host.clone(),
        };
        let mut response = make_response(request, status, None);
        response.headers.push(make_warning(399, &agent, &text));
        response
    }

    /// Timer B, C or F: a 408, or a 503 if transport failures were seen
    fn timeout(&mut self, env: &mut dyn TransactionEnv) -> Disposition {
        if self.failure_reason != FailureReason::None {
            return self.no_more_targets(env);
        }
        if let Some(request) = self.original_request() {
            let response = make_response(request, StatusCode::REQUEST_TIMEOUT, None);
            info!(tid = %self.tid, machine = %self.machine, "transaction timed out");
            self.deliver(
                env,
                TuEvent::Failure {
                    tid: self.tid.clone(),
                    reason: TransactionFailure::Timeout,
                    response: Some(response.into()),
                },
            );
        }
        self.terminate()
    }

    // ---------------------------------------------------------------------
    // inputs
    // ---------------------------------------------------------------------

    /// A message from the wire matched to this transaction
    pub fn process_wire(&mut self, env: &mut dyn TransactionEnv, message: Message, source: Tuple) -> Disposition {
        match (self.machine, message) {
            (Machine::ClientNonInvite, Message::Response(r)) => self.client_non_invite_response(env, r, source),
            (Machine::ClientInvite, Message::Response(r)) => self.client_invite_response(env, r, source),
            (Machine::ClientStale, Message::Response(r)) => {
                if r.status.is_success() {
                    self.deliver(
                        env,
                        TuEvent::Response {
                            tid: self.tid.clone(),
                            message: r.into(),
                            source,
                        },
                    );
                } else {
                    trace!(tid = %self.tid, status = %r.status, "absorbing response in stale client");
                }
                Disposition::Keep
            }
            (Machine::Stateless, _) => Disposition::Keep,
            (Machine::ServerNonInvite, Message::Request(_)) => match self.state {
                State::Trying => Disposition::Keep,
                _ => self.resend(env),
            },
            (Machine::ServerInvite, Message::Request(r)) => self.server_invite_request(env, r),
            (Machine::ServerStale, Message::Request(r)) => {
                if r.method == Method::Ack {
                    self.deliver(
                        env,
                        TuEvent::Request {
                            tid: self.tid.clone(),
                            message: r.into(),
                            source,
                        },
                    );
                }
                Disposition::Keep
            }
            (_, Message::Request(_)) => self.bogus("request on a client transaction"),
            (_, Message::Response(_)) => self.bogus("response on a server transaction"),
        }
    }

    fn client_non_invite_response(&mut self, env: &mut dyn TransactionEnv, response: Response, source: Tuple) -> Disposition {
        self.whitelist_target();
        let status = response.status;
        if status.is_provisional() {
            if matches!(self.state, State::Trying | State::Proceeding) {
                if self.state == State::Trying {
                    self.set_state(State::Proceeding);
                    if !self.is_reliable {
                        let t2 = env.settings().t2;
                        env.add_timer(&self.tid, TimerKind::E2, t2);
                    }
                }
                self.deliver(
                    env,
                    TuEvent::Response {
                        tid: self.tid.clone(),
                        message: response.into(),
                        source,
                    },
                );
            }
            return Disposition::Keep;
        }

        if !matches!(self.state, State::Trying | State::Proceeding) {
            trace!(tid = %self.tid, %status, "absorbing retransmitted final response");
            return Disposition::Keep;
        }
        self.check_retry_after(&response);
        self.deliver(
            env,
            TuEvent::Response {
                tid: self.tid.clone(),
                message: response.into(),
                source,
            },
        );
        if self.is_reliable {
            return self.terminate();
        }
        self.set_state(State::Completed);
        let t4 = env.settings().t4;
        env.add_timer(&self.tid, TimerKind::K, t4);
        Disposition::Keep
    }

    /// A 503 with Retry-After takes its target out of rotation for that long
    fn check_retry_after(&self, response: &Response) {
        if response.status != StatusCode::SERVICE_UNAVAILABLE {
            return;
        }
        let retry_after = Message::Response(response.clone()).retry_after();
        if let (Some(secs), Some(dns), Some(target)) = (retry_after, &self.dns, &self.target) {
            dns.lock().blacklist(target, Duration::from_secs(u64::from(secs)));
        }
    }

    fn client_invite_response(&mut self, env: &mut dyn TransactionEnv, response: Response, source: Tuple) -> Disposition {
        self.whitelist_target();
        let status = response.status;
        let is_invite = Message::Response(response.clone()).method() == Some(Method::Invite);
        if !is_invite {
            return self.bogus("non-INVITE response on an INVITE transaction");
        }

        if status.is_provisional() {
            if matches!(self.state, State::Calling | State::Proceeding) {
                self.set_state(State::Proceeding);
                let timer_c = env.settings().timer_c;
                self.timer_c = env.add_timer(&self.tid, TimerKind::C, timer_c);
                self.deliver(
                    env,
                    TuEvent::Response {
                        tid: self.tid.clone(),
                        message: response.into(),
                        source,
                    },
                );
                if self.cancel_pending {
                    self.send_cancel(env);
                }
            }
            return Disposition::Keep;
        }

        if status.is_success() {
            if matches!(self.state, State::Calling | State::Proceeding) {
                self.cancel_pending = false;
                self.deliver(
                    env,
                    TuEvent::Response {
                        tid: self.tid.clone(),
                        message: response.into(),
                        source,
                    },
                );
                self.machine = Machine::ClientStale;
                self.set_state(State::Terminated);
                let stale = env.settings().stale();
                env.add_timer(&self.tid, TimerKind::StaleClient, stale);
            }
            return Disposition::Keep;
        }

        match self.state {
            State::Calling | State::Proceeding => {
                self.cancel_pending = false;
                self.check_retry_after(&response);
                let ack_send = match (&self.request, &self.last_sent) {
                    (Some(request), Some(last)) => {
                        let ack = make_failure_ack(request, &response);
                        let bytes: Bytes = Message::Request(ack).to_bytes();
                        Some(SendData::new(last.destination.clone(), bytes, self.tid.clone()))
                    }
                    _ => None,
                };
                if let Some(ack_send) = ack_send {
                    if let Err(reason) = env.retransmit(&ack_send) {
                        debug!(tid = %self.tid, %reason, "failed to send ACK");
                    }
                    self.last_sent = Some(ack_send);
                }
                self.deliver(
                    env,
                    TuEvent::Response {
                        tid: self.tid.clone(),
                        message: response.into(),
                        source,
                    },
                );
                if self.is_reliable {
                    return self.terminate();
                }
                self.set_state(State::Completed);
                let timer_d = env.settings().timer_d;
                env.add_timer(&self.tid, TimerKind::D, timer_d);
                Disposition::Keep
            }
            State::Completed => {
                trace!(tid = %self.tid, %status, "final response retransmitted, resending ACK");
                self.resend(env)
            }
            _ => Disposition::Keep,
        }
    }

    fn server_invite_request(&mut self, env: &mut dyn TransactionEnv, request: Request) -> Disposition {
        match request.method {
            Method::Invite => match self.state {
                State::Proceeding if self.last_sent.is_none() => {
                    self.send_100(env);
                    Disposition::Keep
                }
                State::Proceeding | State::Completed => self.resend(env),
                _ => Disposition::Keep,
            },
            Method::Ack => {
                if self.state != State::Completed {
                    return Disposition::Keep;
                }
                if self.is_reliable {
                    return self.terminate();
                }
                self.set_state(State::Confirmed);
                let t4 = env.settings().t4;
                env.add_timer(&self.tid, TimerKind::I, t4);
                Disposition::Keep
            }
            _ => Disposition::Keep,
        }
    }

    fn send_100(&mut self, env: &mut dyn TransactionEnv) {
        if let Some(request) = &self.request {
            let trying = make_response(request, StatusCode::TRYING, None);
            self.send_response(env, trying);
        }
    }

    fn send_response(&mut self, env: &mut dyn TransactionEnv, response: Response) {
        let Some(target) = self.target.clone() else {
            return;
        };
        let mut message = Message::Response(response);
        match env.transmit(&mut message, &target, &self.tid) {
            Ok(sent) => self.last_sent = Some(sent),
            Err(reason) => {
                warn!(tid = %self.tid, %target, %reason, "failed to send response");
                self.note_failure(reason);
            }
        }
    }

    fn send_cancel(&mut self, env: &mut dyn TransactionEnv) {
        self.cancel_pending = false;
        let (Some(request), Some(last)) = (&self.request, &self.last_sent) else {
            return;
        };
        let cancel = make_cancel(request);
        let mut tx = TransactionState::new_client(
            format!("{}{}", self.tid, CANCEL_SUFFIX),
            cancel,
            Some(last.destination.clone()),
        );
        tx.is_cancel = true;
        debug!(tid = %self.tid, "sending CANCEL");
        env.add_client_transaction(tx.tid.clone(), tx);
    }

    /// A response handed down by the TU for this server transaction
    pub fn process_tu(&mut self, env: &mut dyn TransactionEnv, message: Message) -> Disposition {
        let Message::Response(response) = message else {
            return self.bogus("TU request on a server transaction");
        };
        let status = response.status;
        match self.machine {
            Machine::ServerInvite => {
                if self.state != State::Proceeding {
                    debug!(tid = %self.tid, %status, state = %self.state, "ignoring late TU response");
                    return Disposition::Keep;
                }
                self.send_response(env, response);
                if status.is_provisional() {
                    return Disposition::Keep;
                }
                let settings = env.settings().clone();
                if status.is_success() {
                    self.machine = Machine::ServerStale;
                    self.set_state(State::Terminated);
                    env.add_timer(&self.tid, TimerKind::StaleServer, settings.stale());
                } else {
                    self.set_state(State::Completed);
                    env.add_timer(&self.tid, TimerKind::H, settings.timer_h());
                    if !self.is_reliable {
                        env.add_timer(&self.tid, TimerKind::G, settings.t1);
                    }
                }
                Disposition::Keep
            }
            Machine::ServerNonInvite => {
                if !matches!(self.state, State::Trying | State::Proceeding) {
                    debug!(tid = %self.tid, %status, state = %self.state, "ignoring late TU response");
                    return Disposition::Keep;
                }
                self.send_response(env, response);
                if status.is_provisional() {
                    self.set_state(State::Proceeding);
                    return Disposition::Keep;
                }
                if self.is_reliable {
                    return self.terminate();
                }
                self.set_state(State::Completed);
                let timer_j = env.settings().timer_j();
                env.add_timer(&self.tid, TimerKind::J, timer_j);
                Disposition::Keep
            }
            Machine::ServerStale => {
                if status.is_success() {
                    self.send_response(env, response);
                }
                Disposition::Keep
            }
            _ => self.bogus("TU response on a client transaction"),
        }
    }

    pub fn process_timer(&mut self, env: &mut dyn TransactionEnv, timer: &TimerMessage) -> Disposition {
        let settings = env.settings().clone();
        match (self.machine, timer.kind) {
            (Machine::ClientNonInvite, TimerKind::E1) if self.state == State::Trying => {
                let next = (timer.duration * 2).min(settings.t2);
                env.add_timer(&self.tid, TimerKind::E1, next);
                self.resend(env)
            }
            (Machine::ClientNonInvite, TimerKind::E2) if self.state == State::Proceeding => {
                env.add_timer(&self.tid, TimerKind::E2, settings.t2);
                self.resend(env)
            }
            (Machine::ClientNonInvite, TimerKind::F)
                if matches!(self.state, State::Trying | State::Proceeding) =>
            {
                self.timeout(env)
            }
            (Machine::ClientNonInvite, TimerKind::K) => self.terminate(),

            // a CANCEL waiting for the first provisional stops the INVITE retransmissions
            (Machine::ClientInvite, TimerKind::A) if self.state == State::Calling && !self.cancel_pending => {
                env.add_timer(&self.tid, TimerKind::A, timer.duration * 2);
                self.resend(env)
            }
            (Machine::ClientInvite, TimerKind::B) if self.state == State::Calling => self.timeout(env),
            (Machine::ClientInvite, TimerKind::C)
                if self.state == State::Proceeding && timer.id == self.timer_c =>
            {
                self.timeout(env)
            }
            (Machine::ClientInvite, TimerKind::D) => self.terminate(),

            (Machine::ServerInvite, TimerKind::Trying) => {
                if self.state == State::Proceeding && self.last_sent.is_none() {
                    self.send_100(env);
                }
                Disposition::Keep
            }
            (Machine::ServerInvite, TimerKind::G) if self.state == State::Completed => {
                let next = (timer.duration * 2).min(settings.t2);
                env.add_timer(&self.tid, TimerKind::G, next);
                self.resend(env)
            }
            (Machine::ServerInvite, TimerKind::H) if self.state == State::Completed => {
                info!(tid = %self.tid, "no ACK for final response");
                self.deliver(
                    env,
                    TuEvent::Failure {
                        tid: self.tid.clone(),
                        reason: TransactionFailure::Timeout,
                        response: None,
                    },
                );
                self.terminate()
            }
            (Machine::ServerInvite, TimerKind::I) => self.terminate(),

            (Machine::ServerNonInvite, TimerKind::Trying) => {
                if self.state == State::Trying {
                    self.send_100(env);
                    self.set_state(State::Proceeding);
                }
                Disposition::Keep
            }
            (Machine::ServerNonInvite, TimerKind::J) => self.terminate(),

            (Machine::ClientStale, TimerKind::StaleClient) => self.terminate(),
            (Machine::ServerStale, TimerKind::StaleServer) => self.terminate(),
            (Machine::Stateless, TimerKind::Stateless) => self.terminate(),

            _ => {
                trace!(tid = %self.tid, timer = %timer.kind, state = %self.state, "ignoring timer");
                Disposition::Keep
            }
        }
    }

    /// A send for this transaction failed at the transport layer
    pub fn process_transport_failure(&mut self, env: &mut dyn TransactionEnv, reason: FailureReason) -> Disposition {
        self.note_failure(reason);
        let retry = match self.machine {
            Machine::ClientInvite => self.state == State::Calling,
            Machine::ClientNonInvite => matches!(self.state, State::Trying | State::Proceeding),
            Machine::Stateless => true,
            _ => false,
        };
        if !retry {
            debug!(tid = %self.tid, machine = %self.machine, state = %self.state, %reason, "transport failure ignored");
            return Disposition::Keep;
        }
        if self.explicit_target {
            return self.no_more_targets(env);
        }
        info!(tid = %self.tid, %reason, target = ?self.target.as_ref().map(|t| t.to_string()), "transport failure, trying next target");
        self.greylist_target();
        self.try_next_target(env)
    }

    pub fn process_dns_ready(&mut self, env: &mut dyn TransactionEnv) -> Disposition {
        if !self.waiting_for_dns {
            return Disposition::Keep;
        }
        self.try_next_target(env)
    }

    /// Asks a client INVITE to CANCEL; waits for a provisional response
    /// first when none has arrived yet. An INVITE that already has its final
    /// response gets the CANCEL answered locally with a 200.
    pub fn cancel(&mut self, env: &mut dyn TransactionEnv) -> Disposition {
        if self.machine != Machine::ClientInvite {
            debug!(tid = %self.tid, machine = %self.machine, "cancel ignored");
            return Disposition::Keep;
        }
        match self.state {
            State::Calling => self.cancel_pending = true,
            State::Proceeding => self.send_cancel(env),
            State::Completed => self.answer_late_cancel(env),
            _ => {}
        }
        Disposition::Keep
    }

    fn answer_late_cancel(&mut self, env: &mut dyn TransactionEnv) {
        let (Some(request), Some(target)) = (&self.request, &self.target) else {
            return;
        };
        let ok = make_response(&make_cancel(request), StatusCode::OK, None);
        debug!(tid = %self.tid, "final response already seen, answering CANCEL locally");
        self.deliver(
            env,
            TuEvent::Response {
                tid: format!("{}{}", self.tid, CANCEL_SUFFIX),
                message: ok.into(),
                source: target.clone(),
            },
        );
    }

    /// The TU will not answer: close the transaction with a 500
    pub fn abandon(&mut self, env: &mut dyn TransactionEnv) -> Disposition {
        let unanswered = match self.machine {
            Machine::ServerInvite => self.state == State::Proceeding,
            Machine::ServerNonInvite => matches!(self.state, State::Trying | State::Proceeding),
            _ => false,
        };
        if !unanswered {
            return Disposition::Keep;
        }
        let Some(request) = &self.request else {
            return Disposition::Keep;
        };
        let response = make_response(request, StatusCode::SERVER_INTERNAL_ERROR, None);
        debug!(tid = %self.tid, "abandoned by TU");
        self.process_tu(env, response.into())
    }
}

impl fmt::Debug for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionState")
            .field("tid", &self.tid)
            .field("machine", &self.machine)
            .field("state", &self.state)
            .field("reliable", &self.is_reliable)
            .field("target", &self.target.as_ref().map(|t| t.to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use voxstack_sip_core::{generate_branch, CSeq, Header, NameAddr, Via};
    use voxstack_sip_transport::{DnsHandler, DnsResolver, LiteralResolver, TransportType};

    use super::*;

    struct NoopHandler;

    impl DnsHandler for NoopHandler {
        fn handle(&self, _tid: &str) {}
    }

    /// Records everything a machine asks of its controller
    struct MockEnv {
        settings: TimerSettings,
        timers: Vec<(TimerKind, Duration, u64)>,
        sent: Vec<Message>,
        resent: Vec<SendData>,
        delivered: Vec<TuEvent>,
        spawned: Vec<(String, TransactionState)>,
        resolver: LiteralResolver,
        fail_sends_to: Option<FailureReason>,
    }

    impl MockEnv {
        fn new() -> Self {
            MockEnv {
                settings: TimerSettings::default(),
                timers: Vec::new(),
                sent: Vec::new(),
                resent: Vec::new(),
                delivered: Vec::new(),
                spawned: Vec::new(),
                resolver: LiteralResolver::new(),
                fail_sends_to: None,
            }
        }

        fn fire(&self, tid: &str, kind: TimerKind, duration: Duration) -> TimerMessage {
            TimerMessage {
                tid: tid.to_string(),
                kind,
                duration,
                id: 0,
            }
        }

        fn last_timer(&self, kind: TimerKind) -> Option<(Duration, u64)> {
            self.timers
                .iter()
                .rev()
                .find(|(k, _, _)| *k == kind)
                .map(|(_, d, id)| (*d, *id))
        }

        fn statuses(&self) -> Vec<u16> {
            self.sent
                .iter()
                .filter_map(|m| m.status())
                .map(|s| s.as_u16())
                .collect()
        }
    }

    impl TransactionEnv for MockEnv {
        fn settings(&self) -> &TimerSettings {
            &self.settings
        }

        fn add_timer(&mut self, _tid: &str, kind: TimerKind, duration: Duration) -> u64 {
            self.timers.push((kind, duration, self.timers.len() as u64 + 1));
            self.timers.len() as u64
        }

        fn transmit(&mut self, message: &mut Message, target: &Tuple, tid: &str) -> Result<SendData, FailureReason> {
            if let Some(reason) = self.fail_sends_to {
                return Err(reason);
            }
            if let Some(via) = message.top_via_mut() {
                if via.sent_host.is_empty() {
                    via.sent_host = "10.0.0.1".to_string();
                    via.sent_port = Some(5060);
                }
            }
            self.sent.push(message.clone());
            Ok(SendData::new(target.clone().with_transport_key(1), message.to_bytes(), tid))
        }

        fn retransmit(&mut self, data: &SendData) -> Result<(), FailureReason> {
            self.resent.push(data.clone());
            Ok(())
        }

        fn create_dns_result(&mut self, tid: &str) -> DnsResultHandle {
            self.resolver.create_result(tid, Arc::new(NoopHandler))
        }

        fn dns_lookup(&mut self, result: &DnsResultHandle, target: &Uri) -> DnsState {
            self.resolver.lookup(result, target)
        }

        fn deliver(&mut self, event: TuEvent) {
            self.delivered.push(event);
        }

        fn add_client_transaction(&mut self, tid: String, state: TransactionState) {
            self.spawned.push((tid, state));
        }
    }

    fn request(method: Method, host: &str) -> Request {
        Request::new(method.clone(), Uri::sip(host).with_user("bob"))
            .with_header(Header::Via(Via::new("UDP", generate_branch())))
            .with_header(Header::From(
                NameAddr::new(Uri::sip("example.com").with_user("alice")).with_tag("f1"),
            ))
            .with_header(Header::To(NameAddr::new(Uri::sip("example.com").with_user("bob"))))
            .with_header(Header::CallId("call-1@example.com".to_string()))
            .with_header(Header::CSeq(CSeq::new(1, method)))
    }

    fn wire_request(method: Method) -> Request {
        let mut r = request(method, "10.0.0.1");
        r.headers[0] = Header::Via(Via::new("UDP", "z9hG4bKserver1").with_sent_by("192.0.2.9", Some(5060)));
        r
    }

    fn peer(tt: TransportType) -> Tuple {
        Tuple::parse("192.0.2.9", 5060, tt).unwrap()
    }

    fn response_to(tx: &TransactionState, status: u16) -> Message {
        let request = tx.request.as_ref().unwrap();
        make_response(request, StatusCode::from_u16(status).unwrap(), None).into()
    }

    fn failures(env: &MockEnv) -> Vec<(TransactionFailure, Option<u16>)> {
        env.delivered
            .iter()
            .filter_map(|e| match e {
                TuEvent::Failure { reason, response, .. } => {
                    Some((*reason, response.as_ref().and_then(|r| r.status()).map(|s| s.as_u16())))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_non_invite_retransmits_with_backoff_and_stops_when_completed() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_client("t1", request(Method::Options, "192.0.2.1"), None);
        assert_eq!(tx.start_client(&mut env), Disposition::Keep);
        assert_eq!(env.sent.len(), 1);
        assert_eq!(env.last_timer(TimerKind::F).unwrap().0, Duration::from_secs(32));

        let mut intervals = Vec::new();
        for _ in 0..5 {
            let (d, _) = env.last_timer(TimerKind::E1).unwrap();
            intervals.push(d.as_millis());
            let timer = env.fire("t1", TimerKind::E1, d);
            assert_eq!(tx.process_timer(&mut env, &timer), Disposition::Keep);
        }
        assert_eq!(intervals, vec![500, 1000, 2000, 4000, 4000]);
        assert_eq!(env.resent.len(), 5);

        let ok = response_to(&tx, 200);
        assert_eq!(tx.process_wire(&mut env, ok.clone(), peer(TransportType::Udp)), Disposition::Keep);
        assert_eq!(tx.state(), State::Completed);
        assert_eq!(env.last_timer(TimerKind::K).unwrap().0, Duration::from_secs(5));

        // no retransmission once completed, and duplicates are absorbed
        let (d, _) = env.last_timer(TimerKind::E1).unwrap();
        let timer = env.fire("t1", TimerKind::E1, d);
        tx.process_timer(&mut env, &timer);
        assert_eq!(env.resent.len(), 5);
        tx.process_wire(&mut env, ok, peer(TransportType::Udp));
        let responses = env.delivered.iter().filter(|e| matches!(e, TuEvent::Response { .. })).count();
        assert_eq!(responses, 1);

        let k = env.fire("t1", TimerKind::K, Duration::from_secs(5));
        assert_eq!(tx.process_timer(&mut env, &k), Disposition::Terminate);
    }

    #[test]
    fn test_non_invite_proceeding_uses_t2() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_client("t1", request(Method::Register, "192.0.2.1"), None);
        tx.start_client(&mut env);
        let trying = response_to(&tx, 100);
        tx.process_wire(&mut env, trying, peer(TransportType::Udp));
        assert_eq!(tx.state(), State::Proceeding);
        assert_eq!(env.last_timer(TimerKind::E2).unwrap().0, Duration::from_secs(4));

        // E1 is dead in Proceeding, E2 keeps going
        let e1 = env.fire("t1", TimerKind::E1, Duration::from_millis(500));
        tx.process_timer(&mut env, &e1);
        assert!(env.resent.is_empty());
        let e2 = env.fire("t1", TimerKind::E2, Duration::from_secs(4));
        tx.process_timer(&mut env, &e2);
        assert_eq!(env.resent.len(), 1);
    }

    #[test]
    fn test_timer_f_reports_408_once() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_client("t1", request(Method::Options, "192.0.2.1"), None);
        tx.start_client(&mut env);
        let f = env.fire("t1", TimerKind::F, Duration::from_secs(32));
        assert_eq!(tx.process_timer(&mut env, &f), Disposition::Terminate);
        assert_eq!(failures(&env), vec![(TransactionFailure::Timeout, Some(408))]);
    }

    #[test]
    fn test_reliable_transport_skips_retransmission_and_completed() {
        let mut env = MockEnv::new();
        let target = Tuple::parse("192.0.2.1", 5060, TransportType::Tcp).unwrap();
        let mut tx = TransactionState::new_client("t1", request(Method::Options, "192.0.2.1"), Some(target));
        tx.start_client(&mut env);
        assert!(tx.is_reliable());
        assert!(env.last_timer(TimerKind::E1).is_none());
        let ok = response_to(&tx, 200);
        assert_eq!(tx.process_wire(&mut env, ok, peer(TransportType::Tcp)), Disposition::Terminate);
    }

    #[test]
    fn test_server_non_invite_delivers_once_and_replays_final() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_server("z9hG4bKserver1", wire_request(Method::Options), peer(TransportType::Udp));
        tx.start_server(&mut env);

        // duplicate while the TU is thinking: absorbed
        tx.process_wire(&mut env, wire_request(Method::Options).into(), peer(TransportType::Udp));
        assert!(env.resent.is_empty());

        let ok = make_response(&wire_request(Method::Options), StatusCode::OK, None);
        tx.process_tu(&mut env, ok.into());
        assert_eq!(tx.state(), State::Completed);
        assert_eq!(env.statuses(), vec![200]);

        tx.process_wire(&mut env, wire_request(Method::Options).into(), peer(TransportType::Udp));
        tx.process_wire(&mut env, wire_request(Method::Options).into(), peer(TransportType::Udp));
        assert_eq!(env.resent.len(), 2);

        let requests = env.delivered.iter().filter(|e| matches!(e, TuEvent::Request { .. })).count();
        assert_eq!(requests, 1);

        let j = env.fire("z9hG4bKserver1", TimerKind::J, Duration::from_secs(32));
        assert_eq!(tx.process_timer(&mut env, &j), Disposition::Terminate);
    }

    #[test]
    fn test_server_non_invite_sends_100_after_trying_timer() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_server("z9hG4bKserver1", wire_request(Method::Options), peer(TransportType::Udp));
        tx.start_server(&mut env);
        assert_eq!(env.last_timer(TimerKind::Trying).unwrap().0, Duration::from_millis(3500));
        let trying = env.fire("z9hG4bKserver1", TimerKind::Trying, Duration::from_millis(3500));
        tx.process_timer(&mut env, &trying);
        assert_eq!(env.statuses(), vec![100]);
        assert_eq!(tx.state(), State::Proceeding);
    }

    #[test]
    fn test_client_invite_failure_is_acked_and_absorbed() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_client("inv", request(Method::Invite, "192.0.2.1"), None);
        tx.start_client(&mut env);
        assert_eq!(env.last_timer(TimerKind::A).unwrap().0, Duration::from_millis(500));
        assert_eq!(env.last_timer(TimerKind::B).unwrap().0, Duration::from_secs(32));

        let a = env.fire("inv", TimerKind::A, Duration::from_millis(500));
        tx.process_timer(&mut env, &a);
        assert_eq!(env.last_timer(TimerKind::A).unwrap().0, Duration::from_secs(1));

        let busy = response_to(&tx, 486);
        tx.process_wire(&mut env, busy.clone(), peer(TransportType::Udp));
        assert_eq!(tx.state(), State::Completed);
        let ack = voxstack_sip_core::parse_message(&env.resent.last().unwrap().data).unwrap();
        assert_eq!(ack.method(), Some(Method::Ack));
        assert_eq!(ack.transaction_id().as_deref(), Some(tx.tid_of_request().as_str()));

        tx.process_wire(&mut env, busy, peer(TransportType::Udp));
        let responses = env.delivered.iter().filter(|e| matches!(e, TuEvent::Response { .. })).count();
        assert_eq!(responses, 1);
        assert_eq!(env.resent.len(), 3);

        let d = env.fire("inv", TimerKind::D, Duration::from_secs(32));
        assert_eq!(tx.process_timer(&mut env, &d), Disposition::Terminate);
    }

    #[test]
    fn test_client_invite_2xx_goes_stale_and_passes_retransmissions() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_client("inv", request(Method::Invite, "192.0.2.1"), None);
        tx.start_client(&mut env);
        let ok = response_to(&tx, 200);
        tx.process_wire(&mut env, ok.clone(), peer(TransportType::Udp));
        assert_eq!(tx.machine(), Machine::ClientStale);
        tx.process_wire(&mut env, ok, peer(TransportType::Udp));
        assert_eq!(env.delivered.len(), 2);
        let stale = env.fire("inv", TimerKind::StaleClient, Duration::from_secs(32));
        assert_eq!(tx.process_timer(&mut env, &stale), Disposition::Terminate);
    }

    #[test]
    fn test_cancel_waits_for_provisional() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_client("inv", request(Method::Invite, "192.0.2.1"), None);
        tx.start_client(&mut env);
        tx.cancel(&mut env);
        assert!(env.spawned.is_empty());

        let ringing = response_to(&tx, 180);
        tx.process_wire(&mut env, ringing, peer(TransportType::Udp));
        assert_eq!(env.spawned.len(), 1);
        let (key, cancel) = &env.spawned[0];
        assert_eq!(key, "invcancel");
        assert_eq!(cancel.machine(), Machine::ClientNonInvite);
        assert_eq!(cancel.target().unwrap().transport_key(), 1);
    }

    #[test]
    fn test_pending_cancel_stops_invite_retransmissions() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_client("inv", request(Method::Invite, "192.0.2.1"), None);
        tx.start_client(&mut env);
        let a = env.fire("inv", TimerKind::A, Duration::from_millis(500));
        tx.process_timer(&mut env, &a);
        assert_eq!(env.resent.len(), 1);
        let timers = env.timers.len();

        tx.cancel(&mut env);
        let a = env.fire("inv", TimerKind::A, Duration::from_secs(1));
        assert_eq!(tx.process_timer(&mut env, &a), Disposition::Keep);
        assert_eq!(env.resent.len(), 1);
        assert_eq!(env.timers.len(), timers);

        // Timer B still bounds the wait for a provisional
        let b = env.fire("inv", TimerKind::B, Duration::from_secs(32));
        assert_eq!(tx.process_timer(&mut env, &b), Disposition::Terminate);
        assert_eq!(failures(&env), vec![(TransactionFailure::Timeout, Some(408))]);
        assert!(env.spawned.is_empty());
    }

    #[test]
    fn test_cancel_after_final_response_is_answered_200() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_client("inv", request(Method::Invite, "192.0.2.1"), None);
        tx.start_client(&mut env);
        let busy = response_to(&tx, 486);
        tx.process_wire(&mut env, busy, peer(TransportType::Udp));
        assert_eq!(tx.state(), State::Completed);
        env.delivered.clear();

        assert_eq!(tx.cancel(&mut env), Disposition::Keep);
        assert!(env.spawned.is_empty());
        assert_eq!(env.delivered.len(), 1);
        match &env.delivered[0] {
            TuEvent::Response { tid, message, .. } => {
                assert_eq!(tid, "invcancel");
                assert_eq!(message.status(), Some(StatusCode::OK));
                assert_eq!(message.cseq().unwrap().method, Method::Cancel);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tx.state(), State::Completed);
    }

    #[test]
    fn test_timer_c_only_honours_latest() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_client("inv", request(Method::Invite, "192.0.2.1"), None);
        tx.start_client(&mut env);
        tx.process_wire(&mut env, response_to(&tx, 180), peer(TransportType::Udp));
        let (_, first) = env.last_timer(TimerKind::C).unwrap();
        tx.process_wire(&mut env, response_to(&tx, 183), peer(TransportType::Udp));
        let (_, latest) = env.last_timer(TimerKind::C).unwrap();

        let mut stale_c = env.fire("inv", TimerKind::C, Duration::from_secs(180));
        stale_c.id = first;
        assert_eq!(tx.process_timer(&mut env, &stale_c), Disposition::Keep);
        let mut live_c = stale_c.clone();
        live_c.id = latest;
        assert_eq!(tx.process_timer(&mut env, &live_c), Disposition::Terminate);
        assert_eq!(failures(&env), vec![(TransactionFailure::Timeout, Some(408))]);
    }

    #[test]
    fn test_server_invite_retransmits_final_until_ack() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_server("z9hG4bKserver1", wire_request(Method::Invite), peer(TransportType::Udp));
        tx.start_server(&mut env);
        let t100 = env.fire("z9hG4bKserver1", TimerKind::Trying, Duration::from_millis(80));
        tx.process_timer(&mut env, &t100);
        assert_eq!(env.statuses(), vec![100]);

        // INVITE retransmission replays the 100
        tx.process_wire(&mut env, wire_request(Method::Invite).into(), peer(TransportType::Udp));
        assert_eq!(env.resent.len(), 1);

        let busy = make_response(&wire_request(Method::Invite), StatusCode::from_u16(486).unwrap(), None);
        tx.process_tu(&mut env, busy.into());
        assert_eq!(tx.state(), State::Completed);
        let mut g = env.last_timer(TimerKind::G).unwrap().0;
        let mut gs = Vec::new();
        for _ in 0..5 {
            gs.push(g.as_millis());
            let timer = env.fire("z9hG4bKserver1", TimerKind::G, g);
            tx.process_timer(&mut env, &timer);
            g = env.last_timer(TimerKind::G).unwrap().0;
        }
        assert_eq!(gs, vec![500, 1000, 2000, 4000, 4000]);

        let mut ack = wire_request(Method::Ack);
        ack.headers.retain(|h| !h.is(HeaderName::CSeq));
        ack.headers.push(Header::CSeq(CSeq::new(1, Method::Ack)));
        tx.process_wire(&mut env, ack.into(), peer(TransportType::Udp));
        assert_eq!(tx.state(), State::Confirmed);
        let i = env.fire("z9hG4bKserver1", TimerKind::I, Duration::from_secs(5));
        assert_eq!(tx.process_timer(&mut env, &i), Disposition::Terminate);
        assert!(failures(&env).is_empty());
    }

    #[test]
    fn test_timer_h_reports_missing_ack() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_server("z9hG4bKserver1", wire_request(Method::Invite), peer(TransportType::Udp));
        tx.start_server(&mut env);
        tx.abandon(&mut env);
        assert_eq!(env.statuses(), vec![500]);
        let h = env.fire("z9hG4bKserver1", TimerKind::H, Duration::from_secs(32));
        assert_eq!(tx.process_timer(&mut env, &h), Disposition::Terminate);
        assert_eq!(failures(&env), vec![(TransactionFailure::Timeout, None)]);
    }

    #[test]
    fn test_unresolvable_target_reports_503_with_warning() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_client("t1", request(Method::Options, "nowhere.invalid"), None);
        assert_eq!(tx.start_client(&mut env), Disposition::Terminate);
        let event = env.delivered.pop().unwrap();
        let TuEvent::Failure { reason, response: Some(response), .. } = event else {
            panic!("expected a failure");
        };
        assert_eq!(reason, TransactionFailure::NoDnsResults);
        assert_eq!(response.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        let warning = response.header_value("Warning").unwrap();
        assert!(warning.starts_with("399 nowhere.invalid"), "{}", warning);
    }

    #[test]
    fn test_transport_failure_on_every_target() {
        let mut env = MockEnv::new();
        env.fail_sends_to = Some(FailureReason::TransportBadConnect);
        let mut tx = TransactionState::new_client("t1", request(Method::Options, "192.0.2.1"), None);
        assert_eq!(tx.start_client(&mut env), Disposition::Terminate);
        assert_eq!(
            failures(&env),
            vec![(TransactionFailure::TransportFailure(FailureReason::TransportBadConnect), Some(503))]
        );
    }

    #[test]
    fn test_dead_flow_reports_430_or_410() {
        let mut env = MockEnv::new();
        env.fail_sends_to = Some(FailureReason::TransportNoExistConn);
        let mut flow = Tuple::parse("192.0.2.1", 5060, TransportType::Tcp).unwrap();
        flow.set_only_use_existing_connection(true);

        let mut routed = request(Method::Options, "192.0.2.1");
        routed
            .headers
            .push(Header::Route(NameAddr::new(Uri::sip("192.0.2.1").with_param("lr", None))));
        let mut tx = TransactionState::new_client("t1", routed, Some(flow.clone()));
        tx.start_client(&mut env);
        let mut tx = TransactionState::new_client("t2", request(Method::Options, "192.0.2.1"), Some(flow));
        tx.start_client(&mut env);

        let codes: Vec<Option<u16>> = failures(&env).into_iter().map(|(_, code)| code).collect();
        assert_eq!(codes, vec![Some(430), Some(410)]);
    }

    #[test]
    fn test_response_on_server_transaction_is_bogus() {
        let mut env = MockEnv::new();
        let mut tx = TransactionState::new_server("z9hG4bKserver1", wire_request(Method::Options), peer(TransportType::Udp));
        tx.start_server(&mut env);
        let stray: Message = make_response(&wire_request(Method::Options), StatusCode::OK, None).into();
        assert_eq!(tx.process_wire(&mut env, stray, peer(TransportType::Udp)), Disposition::Terminate);
        assert_eq!(tx.state(), State::Bogus);
    }

    impl TransactionState {
        fn tid_of_request(&self) -> String {
            Message::Request(self.request.clone().unwrap()).transaction_id().unwrap()
        }
    }
}
