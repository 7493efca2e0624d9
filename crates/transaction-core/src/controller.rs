//! # Transaction controller
//!
//! [`TransactionController`] is the single loop that owns every transaction,
//! the timer queue and the [`TransportSelector`]. One call to
//! [`TransactionController::process`] is one scheduling pass:
//!
//! 1. wait in the selector's poll for socket readiness, no longer than the
//!    next timer or `max_wait`, and not at all when work is already queued
//! 2. fire every due timer
//! 3. dispatch at most `max_messages_per_pass` messages from the inbound queue
//! 4. poke transports that run their own thread
//!
//! Nothing else touches the transaction maps. Other threads reach the
//! controller through a [`ControllerHandle`], which posts to the queue.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use voxstack_sip_core::{make_503, make_response, Message, Method, Request, StatusCode, Uri};
use voxstack_sip_transport::{
    DnsHandler, DnsResultHandle, DnsState, FailureReason, FifoStats, RejectionBehavior, SendData,
    TransportEventSink, TransportFailure, TransportSelector, Tuple,
};

use crate::error::{Result, TransactionError};
use crate::message::{TransactionFailure, TransactionMessage, TuEvent};
use crate::queue::ControllerQueue;
use crate::state::{Disposition, TransactionEnv, TransactionState, ACK_SUFFIX, CANCEL_SUFFIX};
use crate::timer::{TimerKind, TimerMessage, TimerQueue, TimerSettings};
use crate::user::TransactionUser;

/// Inbound messages dispatched per pass before timers get another look
pub const DEFAULT_MAX_MESSAGES_PER_PASS: usize = 100;

/// Suffix keying a TU response sent without a server transaction
const STATELESS_SUFFIX: &str = "stateless";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

pub struct TransactionController {
    selector: TransportSelector,
    queue: Arc<ControllerQueue>,
    tu: Arc<dyn TransactionUser>,
    settings: TimerSettings,
    timers: TimerQueue,
    client: HashMap<String, TransactionState>,
    server: HashMap<String, TransactionState>,
    max_messages_per_pass: usize,
    shutting_down: bool,
}

/// The controller's view of a transaction's surroundings for one input
struct Env<'a> {
    selector: &'a mut TransportSelector,
    timers: &'a mut TimerQueue,
    settings: &'a TimerSettings,
    tu: &'a dyn TransactionUser,
    dns_handler: &'a Arc<ControllerQueue>,
    spawned: Vec<(String, TransactionState)>,
}

impl TransactionEnv for Env<'_> {
    fn settings(&self) -> &TimerSettings {
        self.settings
    }

    fn add_timer(&mut self, tid: &str, kind: TimerKind, duration: Duration) -> u64 {
        self.timers.add(tid, kind, duration)
    }

    fn transmit(&mut self, message: &mut Message, target: &Tuple, tid: &str) -> std::result::Result<SendData, FailureReason> {
        self.selector.transmit(message, target, tid)
    }

    fn retransmit(&mut self, data: &SendData) -> std::result::Result<(), FailureReason> {
        self.selector.retransmit(data)
    }

    fn create_dns_result(&mut self, tid: &str) -> DnsResultHandle {
        let handler: Arc<dyn DnsHandler> = self.dns_handler.clone();
        self.selector.create_dns_result(tid, handler)
    }

    fn dns_lookup(&mut self, result: &DnsResultHandle, target: &Uri) -> DnsState {
        self.selector.dns_resolve(result, target)
    }

    fn deliver(&mut self, event: TuEvent) {
        trace!(tid = %event.tid(), "delivering to TU");
        self.tu.deliver(event);
    }

    fn add_client_transaction(&mut self, tid: String, state: TransactionState) {
        self.spawned.push((tid, state));
    }
}

fn start_client(tx: &mut TransactionState, env: &mut dyn TransactionEnv) -> Disposition {
    tx.start_client(env)
}

fn start_server(tx: &mut TransactionState, env: &mut dyn TransactionEnv) -> Disposition {
    tx.start_server(env)
}

/// Retry-After for a congestion 503: the expected wait, rounded up, at least 1 s
pub fn retry_after_secs(expected_wait: Duration) -> u32 {
    let secs = expected_wait.as_millis().div_ceil(1000).max(1);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

fn key_for(tid: &str, message: &Message) -> String {
    match message.cseq() {
        Some(cseq) if cseq.method == Method::Cancel => format!("{}{}", tid, CANCEL_SUFFIX),
        _ => tid.to_string(),
    }
}

impl TransactionController {
    /// `queue` must be the sink the selector's transports were created with
    /// and must wake `selector`'s poll.
    pub fn new(
        selector: TransportSelector,
        queue: Arc<ControllerQueue>,
        tu: Arc<dyn TransactionUser>,
        settings: TimerSettings,
    ) -> Self {
        TransactionController {
            selector,
            queue,
            tu,
            settings,
            timers: TimerQueue::new(),
            client: HashMap::new(),
            server: HashMap::new(),
            max_messages_per_pass: DEFAULT_MAX_MESSAGES_PER_PASS,
            shutting_down: false,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle::new(self.queue.clone(), self.tu.clone())
    }

    pub fn queue(&self) -> &Arc<ControllerQueue> {
        &self.queue
    }

    pub fn selector(&self) -> &TransportSelector {
        &self.selector
    }

    pub fn selector_mut(&mut self) -> &mut TransportSelector {
        &mut self.selector
    }

    pub fn settings(&self) -> &TimerSettings {
        &self.settings
    }

    pub fn set_max_messages_per_pass(&mut self, max: usize) {
        self.max_messages_per_pass = max.max(1);
    }

    pub fn client_transaction_count(&self) -> usize {
        self.client.len()
    }

    pub fn server_transaction_count(&self) -> usize {
        self.server.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn is_finished_shutdown(&self) -> bool {
        self.shutting_down && self.selector.is_finished_shutdown()
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            client_transactions: self.client.len(),
            server_transactions: self.server.len(),
            timers: self.timers.len(),
            fifo_size: self.queue.len(),
            fifo_time_depth: FifoStats::time_depth(self.queue.stats()),
            transport_fifo_sizes: self.selector.sum_transport_fifo_sizes(),
            average_message_size: self.selector.average_message_size(),
            rejection_behavior: TransportEventSink::rejection_behavior(self.queue.as_ref()),
        }
    }

    /// Runs one scheduling pass, waiting at most `max_wait` for I/O
    pub fn process(&mut self, max_wait: Duration) -> io::Result<()> {
        let now = Instant::now();
        let mut timeout = max_wait;
        if let Some(next) = self.timers.time_till_next(now) {
            timeout = timeout.min(next);
        }
        if let Some(next) = self.selector.time_till_next_process() {
            timeout = timeout.min(next);
        }
        if !self.queue.is_empty() {
            timeout = Duration::ZERO;
        }
        self.selector.process(Some(timeout))?;

        let behavior = TransportEventSink::rejection_behavior(self.queue.as_ref());
        for timer in self.timers.pop_expired(Instant::now()) {
            if behavior == RejectionBehavior::RejectingNonEssential && timer.kind.is_retransmission() {
                trace!(tid = %timer.tid, timer = %timer.kind, "congested, postponing retransmission");
                self.timers.add(&timer.tid, timer.kind, timer.duration);
                continue;
            }
            self.dispatch_timer(timer);
        }

        for message in self.queue.take_batch(self.max_messages_per_pass) {
            self.dispatch(message);
        }

        self.selector.poke();
        Ok(())
    }

    fn map_mut(&mut self, side: Side) -> &mut HashMap<String, TransactionState> {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    /// Feeds one input to the transaction stored under `tid`. False when
    /// there is no such transaction.
    fn run<F>(&mut self, side: Side, tid: &str, input: F) -> bool
    where
        F: FnOnce(&mut TransactionState, &mut dyn TransactionEnv) -> Disposition,
    {
        match self.map_mut(side).remove(tid) {
            Some(tx) => {
                self.drive(tx, input);
                true
            }
            None => false,
        }
    }

    /// Applies `input` to a transaction taken out of its map, then stores it
    /// back or drops it
    fn drive<F>(&mut self, mut tx: TransactionState, input: F)
    where
        F: FnOnce(&mut TransactionState, &mut dyn TransactionEnv) -> Disposition,
    {
        let (disposition, spawned) = {
            let mut env = Env {
                selector: &mut self.selector,
                timers: &mut self.timers,
                settings: &self.settings,
                tu: self.tu.as_ref(),
                dns_handler: &self.queue,
                spawned: Vec::new(),
            };
            let disposition = input(&mut tx, &mut env);
            (disposition, env.spawned)
        };

        let side = if tx.machine().is_client() { Side::Client } else { Side::Server };
        match disposition {
            Disposition::Keep => {
                let tid = tx.tid().to_string();
                self.map_mut(side).insert(tid, tx);
            }
            Disposition::Terminate => {
                debug!(tid = %tx.tid(), machine = %tx.machine(), state = %tx.state(), "transaction terminated");
                if self.tu.wants_terminated() {
                    self.tu.deliver(TuEvent::Terminated {
                        tid: tx.tid().to_string(),
                    });
                }
            }
        }

        for (tid, tx) in spawned {
            if self.client.contains_key(&tid) {
                debug!(%tid, "client transaction already exists");
                continue;
            }
            self.drive(tx, start_client);
        }
    }

    fn dispatch_timer(&mut self, timer: TimerMessage) {
        trace!(msg = %TransactionMessage::timer_brief(&timer), "timer fired");
        let side = if timer.kind.is_client() { Side::Client } else { Side::Server };
        let tid = timer.tid.clone();
        self.run(side, &tid, |tx, env| tx.process_timer(env, &timer));
    }

    fn dispatch(&mut self, message: TransactionMessage) {
        trace!(msg = %message.brief(), "dispatching");
        match message {
            TransactionMessage::FromWire { message, source } => self.process_wire(message, source),
            TransactionMessage::FromTu { message, target } => self.process_tu(message, target),
            TransactionMessage::TransportFailure(failure) => self.process_transport_failure(failure),
            TransactionMessage::DnsResultReady { tid } => {
                if !self.run(Side::Client, &tid, |tx, env| tx.process_dns_ready(env)) {
                    trace!(%tid, "dns result for a finished transaction");
                }
            }
            TransactionMessage::CancelClientInvite { tid } => {
                if !self.run(Side::Client, &tid, |tx, env| tx.cancel(env)) {
                    debug!(%tid, "no client INVITE to cancel");
                }
            }
            TransactionMessage::AbandonServerTransaction { tid } => {
                if !self.run(Side::Server, &tid, |tx, env| tx.abandon(env)) {
                    debug!(%tid, "no server transaction to abandon");
                }
            }
            TransactionMessage::Shutdown => self.shutdown(),
        }
    }

    fn process_transport_failure(&mut self, failure: TransportFailure) {
        let TransportFailure { tid, reason, .. } = failure;
        let handled = self.run(Side::Client, &tid, |tx, env| tx.process_transport_failure(env, reason))
            || self.run(Side::Server, &tid, |tx, env| tx.process_transport_failure(env, reason));
        if !handled {
            // late failures for finished transactions are expected
            trace!(%tid, %reason, "transport failure for unknown transaction");
        }
    }

    fn process_wire(&mut self, message: Message, source: Tuple) {
        let Some(tid) = message.transaction_id() else {
            debug!(msg = %message.brief(), "message without a branch, dropping");
            return;
        };

        let request = match message {
            Message::Response(_) => {
                let key = key_for(&tid, &message);
                if !self.run(Side::Client, &key, |tx, env| tx.process_wire(env, message, source)) {
                    debug!(tid = %key, "stray response, dropping");
                }
                return;
            }
            Message::Request(request) => request,
        };

        match request.method {
            Method::Ack => {
                if self.server.contains_key(&tid) {
                    self.run(Side::Server, &tid, |tx, env| tx.process_wire(env, request.into(), source));
                } else {
                    // ACK for a 2xx belongs to the TU's dialog, not to a transaction
                    self.tu.deliver(TuEvent::Request {
                        tid,
                        message: request.into(),
                        source,
                    });
                }
            }
            Method::Cancel => self.process_wire_cancel(tid, request, source),
            _ => {
                if self.server.contains_key(&tid) {
                    self.run(Side::Server, &tid, |tx, env| tx.process_wire(env, request.into(), source));
                    return;
                }
                let behavior = self.tu.rejection_behavior();
                if behavior != RejectionBehavior::Normal {
                    self.reject_congested(&tid, &request, &source);
                    return;
                }
                self.drive(TransactionState::new_server(tid, request, source), start_server);
            }
        }
    }

    /// A CANCEL gets its own server transaction answered here: 200 when the
    /// INVITE is known (the TU then sends the 487), 481 otherwise
    fn process_wire_cancel(&mut self, tid: String, request: Request, source: Tuple) {
        let key = format!("{}{}", tid, CANCEL_SUFFIX);
        if self.server.contains_key(&key) {
            self.run(Side::Server, &key, |tx, env| tx.process_wire(env, request.into(), source));
            return;
        }

        let invite_known = self.server.contains_key(&tid);
        let status = if invite_known {
            StatusCode::OK
        } else {
            StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST
        };
        let response = make_response(&request, status, None);
        debug!(%tid, %status, "answering CANCEL");
        let tx = TransactionState::new_server(key, request.clone(), source.clone());
        self.drive(tx, |tx, env| match tx.start_server(env) {
            Disposition::Keep => tx.process_tu(env, response.into()),
            terminate => terminate,
        });

        if invite_known {
            self.tu.deliver(TuEvent::Request {
                tid,
                message: request.into(),
                source,
            });
        }
    }

    fn reject_congested(&mut self, tid: &str, request: &Request, source: &Tuple) {
        let secs = retry_after_secs(self.tu.expected_wait());
        let Some(response) = make_503(request, secs) else {
            return;
        };
        info!(%tid, retry_after = secs, "TU congested, rejecting request");
        let mut message = Message::Response(response);
        if let Err(reason) = self.selector.transmit(&mut message, source, tid) {
            debug!(%tid, %reason, "failed to send 503");
        }
    }

    fn process_tu(&mut self, message: Message, target: Option<Tuple>) {
        let Some(tid) = message.transaction_id() else {
            warn!(msg = %message.brief(), "TU message without a branch, dropping");
            return;
        };

        match message {
            Message::Request(request) => match request.method {
                Method::Ack => {
                    let key = format!("{}{}", tid, ACK_SUFFIX);
                    self.client.remove(&key);
                    self.drive(TransactionState::new_client(key, request, target), start_client);
                }
                Method::Cancel => {
                    if !self.run(Side::Client, &tid, |tx, env| tx.cancel(env)) {
                        debug!(%tid, "no client INVITE to cancel");
                    }
                }
                _ => {
                    if self.client.contains_key(&tid) {
                        warn!(%tid, "client transaction already exists, dropping request");
                        return;
                    }
                    if self.shutting_down {
                        let response = make_response(&request, StatusCode::SERVICE_UNAVAILABLE, None);
                        self.tu.deliver(TuEvent::Failure {
                            tid,
                            reason: TransactionFailure::TransportFailure(FailureReason::TransportShutdown),
                            response: Some(response.into()),
                        });
                        return;
                    }
                    self.drive(TransactionState::new_client(tid, request, target), start_client);
                }
            },
            response @ Message::Response(_) => {
                let key = key_for(&tid, &response);
                if self.server.contains_key(&key) {
                    self.run(Side::Server, &key, |tx, env| tx.process_tu(env, response));
                    return;
                }
                debug!(tid = %key, "no server transaction, sending response statelessly");
                let key = format!("{}{}", key, STATELESS_SUFFIX);
                self.client.remove(&key);
                self.drive(TransactionState::new_stateless(key, response, target), start_client);
            }
        }
    }

    /// Stops the transports; transactions still run their timers out
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!(
            client = self.client.len(),
            server = self.server.len(),
            "transaction controller shutting down"
        );
        self.shutting_down = true;
        self.selector.shutdown();
    }
}

impl fmt::Debug for TransactionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionController")
            .field("client", &self.client.len())
            .field("server", &self.server.len())
            .field("timers", &self.timers.len())
            .field("queue", &self.queue.len())
            .field("shutting_down", &self.shutting_down)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStats {
    pub client_transactions: usize,
    pub server_transactions: usize,
    pub timers: usize,
    pub fifo_size: usize,
    pub fifo_time_depth: Duration,
    pub transport_fifo_sizes: usize,
    pub average_message_size: usize,
    pub rejection_behavior: RejectionBehavior,
}

impl fmt::Display for ControllerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client={} server={} timers={} fifo={} fifo_time_depth_ms={} transport_fifos={} avg_msg_size={} behavior={}",
            self.client_transactions,
            self.server_transactions,
            self.timers,
            self.fifo_size,
            self.fifo_time_depth.as_millis(),
            self.transport_fifo_sizes,
            self.average_message_size,
            self.rejection_behavior.as_str(),
        )
    }
}

/// Cloneable, thread-safe entry point into a running controller
#[derive(Clone)]
pub struct ControllerHandle {
    queue: Arc<ControllerQueue>,
    tu: Arc<dyn TransactionUser>,
}

impl ControllerHandle {
    pub fn new(queue: Arc<ControllerQueue>, tu: Arc<dyn TransactionUser>) -> Self {
        ControllerHandle { queue, tu }
    }

    /// Sends a request or response. Without a target, requests are routed by
    /// Route/Request-URI and responses through their server transaction.
    ///
    /// While the controller queue is congested, new requests other than ACK
    /// are refused here: the TU immediately gets a [`TuEvent::Failure`]
    /// carrying a 503 with Retry-After, and `Ok(())` is returned.
    pub fn send(&self, message: Message, target: Option<Tuple>) -> Result<()> {
        let tid = message
            .transaction_id()
            .ok_or(TransactionError::MissingTransactionId)?;

        if let Message::Request(request) = &message {
            let behavior = TransportEventSink::rejection_behavior(self.queue.as_ref());
            if request.method != Method::Ack && behavior != RejectionBehavior::Normal {
                let secs = retry_after_secs(TransportEventSink::expected_wait(self.queue.as_ref()));
                warn!(%tid, behavior = behavior.as_str(), retry_after = secs, "controller congested, refusing request");
                self.tu.deliver(TuEvent::Failure {
                    tid,
                    reason: TransactionFailure::Congested,
                    response: make_503(request, secs).map(Message::from),
                });
                return Ok(());
            }
        }

        self.queue.post(TransactionMessage::FromTu { message, target })
    }

    pub fn cancel_client_invite(&self, tid: impl Into<String>) -> Result<()> {
        self.queue
            .post(TransactionMessage::CancelClientInvite { tid: tid.into() })
    }

    pub fn abandon_server_transaction(&self, tid: impl Into<String>) -> Result<()> {
        self.queue
            .post(TransactionMessage::AbandonServerTransaction { tid: tid.into() })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.queue.post(TransactionMessage::Shutdown)
    }

    pub fn queue(&self) -> &Arc<ControllerQueue> {
        &self.queue
    }
}

impl fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("queue", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1001)), 2);
        assert_eq!(retry_after_secs(Duration::from_secs(30)), 30);
    }
}
