//! Stack assembly and the dedicated controller thread
//!
//! [`SipStack::builder`] turns a [`StackConfig`] into bound transports, a
//! [`TransactionController`] and a thread that runs the controller's
//! scheduling loop until shutdown. Everything else talks to the running
//! stack through a cloneable [`StackHandle`].

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use voxstack_infra_common::{
    IpFamily, Metric, StackConfig, TimerConfig, TransportConfig, TransportKind,
};
use voxstack_sip_core::Message;
use voxstack_sip_transport::{
    CongestionManager, DnsResolver, DtlsSessionFactory, DtlsTransport, GeneralCongestionManager,
    IpVersion, LiteralResolver, MetricType, PemSecurity, StreamTransport, SystemResolver,
    ThreadedTransport, TlsContext, Transport, TransportEventSink, TransportOptions,
    TransportSelector, Tuple, UdpTransport, WebRtcDtlsFactory,
};
use voxstack_transaction_core::{
    ControllerHandle, ControllerQueue, ControllerStats, TimerSettings, TransactionController,
    TransactionUser,
};

use crate::error::{Result, StackError};
use crate::tu::LoggingTransactionUser;

/// Longest the stack thread sleeps in one pass when nothing is scheduled
const PROCESS_WAIT: Duration = Duration::from_millis(25);

pub fn timer_settings(config: &TimerConfig) -> TimerSettings {
    TimerSettings {
        t1: Duration::from_millis(config.t1_ms),
        t2: Duration::from_millis(config.t2_ms),
        t4: Duration::from_millis(config.t4_ms),
        t100: Duration::from_millis(config.t100_ms),
        trying: Duration::from_millis(config.trying_ms),
        timeout_multiplier: config.timeout_multiplier,
        timer_c: Duration::from_secs(config.timer_c_secs),
        timer_d: Duration::from_millis(config.timer_d_ms),
        ..TimerSettings::default()
    }
}

pub fn metric_type(metric: Metric) -> MetricType {
    match metric {
        Metric::Size => MetricType::Size,
        Metric::TimeDepth => MetricType::TimeDepth,
        Metric::WaitTime => MetricType::WaitTime,
    }
}

fn ip_version(family: IpFamily) -> IpVersion {
    match family {
        IpFamily::V4 => IpVersion::V4,
        IpFamily::V6 => IpVersion::V6,
    }
}

pub struct SipStackBuilder {
    config: StackConfig,
    tu: Option<Arc<dyn TransactionUser>>,
    security: Arc<PemSecurity>,
    dtls: Option<Arc<dyn DtlsSessionFactory>>,
    dns_runtime: Option<tokio::runtime::Handle>,
    options: TransportOptions,
}

impl SipStackBuilder {
    fn new() -> Self {
        SipStackBuilder {
            config: StackConfig::default(),
            tu: None,
            security: Arc::new(PemSecurity::new()),
            dtls: None,
            dns_runtime: None,
            options: TransportOptions::default(),
        }
    }

    /// Replaces the whole configuration, transports included
    pub fn config(mut self, config: StackConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.config.transports.push(transport);
        self
    }

    pub fn transaction_user(mut self, tu: Arc<dyn TransactionUser>) -> Self {
        self.tu = Some(tu);
        self
    }

    /// Certificate store for TLS transports. Files named in the transport
    /// config are loaded into it.
    pub fn security(mut self, security: Arc<PemSecurity>) -> Self {
        self.security = security;
        self
    }

    /// Sessions for DTLS transports. Without one each DTLS transport gets a
    /// [`WebRtcDtlsFactory`] with a self-signed certificate for its domain.
    pub fn dtls_factory(mut self, factory: Arc<dyn DtlsSessionFactory>) -> Self {
        self.dtls = Some(factory);
        self
    }

    /// Resolve host names on this runtime. Without one only numeric
    /// targets resolve.
    pub fn dns_runtime(mut self, runtime: tokio::runtime::Handle) -> Self {
        self.dns_runtime = Some(runtime);
        self
    }

    pub fn transport_options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    /// Binds every transport and starts the stack thread
    pub fn start(self) -> Result<SipStack> {
        self.config.validate()?;

        let resolver: Box<dyn DnsResolver> = match &self.dns_runtime {
            Some(runtime) => Box::new(SystemResolver::new(runtime.clone())),
            None => Box::new(LiteralResolver::new()),
        };
        let mut selector = TransportSelector::new(resolver)?;
        let queue = ControllerQueue::new(selector.waker(), self.config.fifo_max_depth);

        let congestion = GeneralCongestionManager::new();
        for c in &self.config.congestion {
            congestion.set_tolerance(&c.fifo, metric_type(c.metric), c.max_tolerance);
        }
        queue.set_congestion_manager(congestion.clone());

        let sink: Arc<dyn TransportEventSink> = queue.clone();
        let mut transports = Vec::with_capacity(self.config.transports.len());
        for config in &self.config.transports {
            let mut transport = self.build_transport(config, sink.clone())?;
            if config.own_thread {
                transport = Box::new(ThreadedTransport::new(transport));
            }
            let key = selector.add_transport(transport)?;
            if let Some(added) = selector.find_transport_by_key(key) {
                transports.push(added.tuple().clone());
            }
        }
        if transports.is_empty() {
            warn!("stack started without transports, it can neither send nor receive");
        }

        let tu = self
            .tu
            .unwrap_or_else(|| Arc::new(LoggingTransactionUser) as Arc<dyn TransactionUser>);
        let mut controller =
            TransactionController::new(selector, queue, tu, timer_settings(&self.config.timers));
        controller.set_max_messages_per_pass(self.config.max_messages_per_pass);

        let shared = Arc::new(Shared {
            stats: Mutex::new(controller.stats()),
            running: AtomicBool::new(true),
            congestion,
            transports,
        });
        let handle = StackHandle {
            controller: controller.handle(),
            shared: shared.clone(),
        };
        let thread = StackThread { controller, shared }.spawn()?;

        Ok(SipStack {
            handle,
            thread: Some(thread),
        })
    }

    fn build_transport(
        &self,
        config: &TransportConfig,
        sink: Arc<dyn TransportEventSink>,
    ) -> Result<Box<dyn Transport>> {
        let interface = config.interface.as_str();
        let version = ip_version(config.ip_version);
        let options = self.options.clone();

        let transport: Box<dyn Transport> = match config.kind {
            TransportKind::Udp => Box::new(UdpTransport::bind(
                interface,
                config.port,
                version,
                options,
                sink,
            )?),
            TransportKind::Tcp => Box::new(StreamTransport::bind_tcp(
                interface,
                config.port,
                version,
                options,
                sink,
            )?),
            TransportKind::Tls => {
                if let (Some(cert), Some(key)) = (&config.cert_file, &config.key_file) {
                    self.security
                        .add_domain_files(&config.tls_domain, cert, key)?;
                }
                let context = TlsContext::new(self.security.as_ref(), &config.tls_domain)?;
                Box::new(StreamTransport::bind_tls(
                    interface,
                    config.port,
                    version,
                    &config.tls_domain,
                    context,
                    options,
                    sink,
                )?)
            }
            TransportKind::Dtls => {
                let factory: Arc<dyn DtlsSessionFactory> = match &self.dtls {
                    Some(factory) => factory.clone(),
                    None => Arc::new(WebRtcDtlsFactory::new(&config.tls_domain)?),
                };
                Box::new(DtlsTransport::bind(
                    interface,
                    config.port,
                    version,
                    &config.tls_domain,
                    factory,
                    options,
                    sink,
                )?)
            }
        };
        Ok(transport)
    }
}

/// State the stack thread publishes for handles
struct Shared {
    stats: Mutex<ControllerStats>,
    running: AtomicBool,
    congestion: Arc<GeneralCongestionManager>,
    transports: Vec<Tuple>,
}

/// Owns the controller and runs its scheduling loop
struct StackThread {
    controller: TransactionController,
    shared: Arc<Shared>,
}

impl StackThread {
    fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("voxstack-stack".to_string())
            .spawn(move || self.run())
            .map_err(StackError::Thread)
    }

    fn run(mut self) {
        info!(transports = self.shared.transports.len(), "stack thread started");
        while !self.controller.is_finished_shutdown() {
            if let Err(e) = self.controller.process(PROCESS_WAIT) {
                error!("stack thread stopping after poll failure: {}", e);
                break;
            }
            *self.shared.stats.lock() = self.controller.stats();
        }
        self.shared.running.store(false, Ordering::Release);
        info!(stats = %self.controller.stats(), "stack thread finished");
    }
}

/// A running stack. Dropping it shuts the stack down and waits for the
/// stack thread.
pub struct SipStack {
    handle: StackHandle,
    thread: Option<JoinHandle<()>>,
}

impl SipStack {
    pub fn builder() -> SipStackBuilder {
        SipStackBuilder::new()
    }

    pub fn handle(&self) -> StackHandle {
        self.handle.clone()
    }

    /// Bound transports, with the ports the OS picked for port 0
    pub fn transports(&self) -> &[Tuple] {
        self.handle.transports()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.handle.shutdown()
    }

    /// Waits for the stack thread to finish
    pub fn join(mut self) {
        self.wait();
    }

    fn wait(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("stack thread panicked");
            }
        }
    }
}

impl Drop for SipStack {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if self.handle.is_running() {
                let _ = self.handle.shutdown();
            }
            self.wait();
        }
    }
}

/// Cloneable entry point into a running stack
#[derive(Clone)]
pub struct StackHandle {
    controller: ControllerHandle,
    shared: Arc<Shared>,
}

impl StackHandle {
    /// See [`ControllerHandle::send`]
    pub fn send(&self, message: impl Into<Message>, target: Option<Tuple>) -> Result<()> {
        Ok(self.controller.send(message.into(), target)?)
    }

    pub fn cancel_client_invite(&self, tid: impl Into<String>) -> Result<()> {
        Ok(self.controller.cancel_client_invite(tid)?)
    }

    pub fn abandon_server_transaction(&self, tid: impl Into<String>) -> Result<()> {
        Ok(self.controller.abandon_server_transaction(tid)?)
    }

    pub fn shutdown(&self) -> Result<()> {
        info!("stack shutdown requested");
        Ok(self.controller.shutdown()?)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn transports(&self) -> &[Tuple] {
        &self.shared.transports
    }

    /// Statistics as of the stack thread's last pass
    pub fn stats(&self) -> ControllerStats {
        self.shared.stats.lock().clone()
    }

    pub fn congestion_state(&self) -> String {
        self.shared.congestion.encode_current_state()
    }

    pub fn set_congestion_tolerance(&self, fifo: &str, metric: MetricType, max_tolerance: u64) {
        self.shared
            .congestion
            .set_tolerance(fifo, metric, max_tolerance);
    }

    /// Multi-line dump of transports and controller statistics
    pub fn stack_info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "running={}", self.is_running());
        for tuple in self.transports() {
            let _ = writeln!(out, "transport {}", tuple);
        }
        let _ = writeln!(out, "{}", self.stats());
        out
    }
}

#[cfg(test)]
mod tests {
    use voxstack_sip_transport::TransportType;

    use super::*;

    #[test]
    fn test_timer_settings_from_config() {
        let config = TimerConfig {
            t1_ms: 100,
            timer_c_secs: 60,
            ..TimerConfig::default()
        };
        let settings = timer_settings(&config);
        assert_eq!(settings.t1, Duration::from_millis(100));
        assert_eq!(settings.t2, Duration::from_secs(4));
        assert_eq!(settings.timer_c, Duration::from_secs(60));
        assert_eq!(settings.transaction_timeout(), Duration::from_millis(6400));

        assert_eq!(timer_settings(&TimerConfig::default()).t1, TimerSettings::default().t1);
    }

    #[test]
    fn test_metric_mapping() {
        assert_eq!(metric_type(Metric::Size), MetricType::Size);
        assert_eq!(metric_type(Metric::TimeDepth), MetricType::TimeDepth);
        assert_eq!(metric_type(Metric::WaitTime), MetricType::WaitTime);
    }

    #[test]
    fn test_dtls_starts_with_default_factory() {
        let mut dtls = TransportConfig::new(TransportKind::Dtls, 0);
        dtls.interface = "127.0.0.1".to_string();
        let stack = SipStack::builder().transport(dtls).start().unwrap();
        assert_eq!(stack.transports().len(), 1);
        assert_eq!(stack.transports()[0].transport_type(), TransportType::Dtls);
        assert_ne!(stack.transports()[0].port(), 0);
        stack.shutdown().unwrap();
        stack.join();
    }
}
