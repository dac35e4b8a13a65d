//! Connection manager
//!
//! A single task owns the radio session. Callers (the UI surface and the
//! background monitor) hold a cloneable [`ConnectionHandle`] and submit
//! commands; the task applies them one at a time, so state transitions and the
//! events they emit are totally ordered. The current state is published as a
//! [`ConnectionSnapshot`] on a watch channel.
//!
//! Slow radio work (connecting, liveness queries, writes) runs in spawned tasks
//! that report back on an internal channel tagged with the session epoch they
//! belong to. Reports for an older epoch are dropped.
//!
//! Background sweeps borrow the radio through the same task, so a foreground
//! scan or connect always takes the radio over from a sweep in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::bluetooth::events::{ConnectionEvent, EventEmitter, EventStatus};
use crate::bluetooth::filter::{ModelFilter, ScanFilter};
use crate::bluetooth::radio::{Link, Radio};
use crate::bluetooth::session::{self, Established, SessionOptions};
use crate::bluetooth::state::{self, Trigger};
use crate::bluetooth::stream::{self, MessageLog};
use crate::bluetooth::types::{
    Advertisement, ConnectionSnapshot, ConnectionState, DiscoveryCandidate, GattCharacteristic,
    PeripheralIdentity,
};
use crate::config::BluetoothConfig;
use crate::error::{ErrorContext, LinkError, Result};
use crate::logging::log_error;
use crate::permissions::PermissionGate;
use crate::registry::{DeviceRegistry, RecordOutcome};

const COMMAND_BUFFER: usize = 32;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests accepted by the manager task
enum Command {
    Scan(Reply<()>),
    StopScan(Reply<()>),
    Connect(PeripheralIdentity, Reply<()>),
    Disconnect(Reply<()>),
    Forget(String, Reply<bool>),
    /// Liveness query; `epoch` pins the check to the session the caller saw
    CheckHealth(Option<u64>, Reply<bool>),
    /// Listen without connecting; `None` when the radio is not free
    Sweep(Duration, Reply<Option<HashSet<String>>>),
    CancelSweep(Reply<()>),
    DeviceLost { id: String, epoch: u64, reason: &'static str },
    Send(String, Reply<()>),
    Candidates(oneshot::Sender<Vec<DiscoveryCandidate>>),
    Shutdown,
}

/// Reports from tasks the manager spawned
enum Internal {
    Advertisement { scan_id: u64, advertisement: Advertisement },
    ScanTimedOut { scan_id: u64 },
    ConnectOutcome { epoch: u64, outcome: Result<Established> },
    LinkLost { epoch: u64 },
    HealthResult { epoch: u64, alive: bool, reply: Reply<bool> },
    SweepFinished { sweep_id: u64, visible: HashSet<String> },
}

struct ScanRun {
    id: u64,
    task: JoinHandle<()>,
}

struct SweepRun {
    id: u64,
    task: JoinHandle<()>,
    reply: Reply<Option<HashSet<String>>>,
}

struct Attempt {
    peripheral: PeripheralIdentity,
    task: JoinHandle<()>,
    waiters: Vec<Reply<()>>,
}

struct ActiveSession {
    link: Arc<dyn Link>,
    characteristic: GattCharacteristic,
    mtu: u16,
    pump: JoinHandle<()>,
}

/// Collaborators the manager needs
pub struct ManagerParts {
    pub radio: Arc<dyn Radio>,
    pub registry: Arc<DeviceRegistry>,
    pub permissions: Arc<PermissionGate>,
    pub emitter: Arc<dyn EventEmitter>,
}

/// The task that owns the session
pub struct ConnectionManager {
    settings: BluetoothConfig,
    radio: Arc<dyn Radio>,
    registry: Arc<DeviceRegistry>,
    permissions: Arc<PermissionGate>,
    emitter: Arc<dyn EventEmitter>,
    messages: MessageLog,

    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    snapshot_tx: watch::Sender<ConnectionSnapshot>,

    state: ConnectionState,
    peripheral: Option<PeripheralIdentity>,
    epoch: u64,

    scan: Option<ScanRun>,
    next_scan_id: u64,
    scan_filter: ScanFilter,
    candidates: Vec<DiscoveryCandidate>,
    sweep: Option<SweepRun>,
    attempt: Option<Attempt>,
    session: Option<ActiveSession>,
}

impl ConnectionManager {
    /// Start the manager task and return a handle to it
    ///
    /// The task stops when every handle has been dropped or
    /// [`ConnectionHandle::shutdown`] is called.
    pub fn spawn(settings: BluetoothConfig, parts: ManagerParts) -> ConnectionHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ConnectionSnapshot::idle(0));
        let messages = MessageLog::new();

        let manager = Self {
            scan_filter: ScanFilter::new(ModelFilter::new(&settings.supported_models)),
            settings,
            radio: parts.radio,
            registry: parts.registry,
            permissions: parts.permissions,
            emitter: parts.emitter,
            messages: messages.clone(),
            commands: command_rx,
            internal_tx,
            internal_rx,
            snapshot_tx,
            state: ConnectionState::Idle,
            peripheral: None,
            epoch: 0,
            scan: None,
            next_scan_id: 0,
            candidates: Vec::new(),
            sweep: None,
            attempt: None,
            session: None,
        };
        tokio::spawn(manager.run());

        ConnectionHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            messages,
        }
    }

    async fn run(mut self) {
        debug!("Connection manager started");
        loop {
            tokio::select! {
                biased;
                Some(report) = self.internal_rx.recv() => self.handle_internal(report).await,
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
            }
        }
        self.teardown().await;
        debug!("Connection manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Scan(reply) => {
                let result = self.start_scan().await;
                let _ = reply.send(result);
            }
            Command::StopScan(reply) => {
                if self.state == ConnectionState::Scanning {
                    self.end_scan().await;
                    self.transition(Trigger::StopScan);
                }
                let _ = reply.send(Ok(()));
            }
            Command::Connect(peripheral, reply) => self.request_connect(peripheral, reply).await,
            Command::Disconnect(reply) => {
                self.request_disconnect().await;
                let _ = reply.send(Ok(()));
            }
            Command::Forget(id, reply) => {
                let result = self.forget(&id).await;
                let _ = reply.send(result);
            }
            Command::CheckHealth(epoch, reply) => self.check_health(epoch, reply),
            Command::Sweep(window, reply) => self.start_sweep(window, reply).await,
            Command::CancelSweep(reply) => {
                self.cancel_sweep().await;
                let _ = reply.send(Ok(()));
            }
            Command::DeviceLost { id, epoch, reason } => {
                if epoch == self.epoch && self.connected_id() == Some(id.as_str()) {
                    self.lose_session(reason);
                } else {
                    debug!("Ignoring stale device-lost report for {} (epoch {})", id, epoch);
                }
            }
            Command::Send(text, reply) => self.send(text, reply),
            Command::Candidates(reply) => {
                let _ = reply.send(self.candidates.clone());
            }
            Command::Shutdown => {}
        }
    }

    async fn handle_internal(&mut self, report: Internal) {
        match report {
            Internal::Advertisement { scan_id, advertisement } => {
                if self.is_current_scan(scan_id) {
                    self.on_advertisement(advertisement).await;
                }
            }
            Internal::ScanTimedOut { scan_id } => {
                if self.is_current_scan(scan_id) {
                    info!("Scan ceiling reached with no connection");
                    self.end_scan().await;
                    self.transition(Trigger::ScanTimedOut);
                }
            }
            Internal::ConnectOutcome { epoch, outcome } => self.on_connect_outcome(epoch, outcome).await,
            Internal::LinkLost { epoch } => {
                if epoch == self.epoch && self.state == ConnectionState::Connected {
                    self.lose_session("link loss");
                }
            }
            Internal::HealthResult { epoch, alive, reply } => {
                if !alive && epoch == self.epoch && self.state == ConnectionState::Connected {
                    self.lose_session("link loss");
                }
                let _ = reply.send(Ok(alive));
            }
            Internal::SweepFinished { sweep_id, visible } => {
                if self.sweep.as_ref().map(|run| run.id) != Some(sweep_id) {
                    return;
                }
                if let Some(run) = self.sweep.take() {
                    if let Err(e) = self.radio.stop_scan().await {
                        warn!("Failed to stop sweep scan: {}", e);
                    }
                    let _ = run.reply.send(Ok(Some(visible)));
                }
            }
        }
    }

    // Scanning

    async fn start_scan(&mut self) -> Result<()> {
        if state::has_session(&self.state) {
            info!("Scan requested while {}, ignoring", self.state);
            return Ok(());
        }
        if !self.permissions.ensure_permissions().await {
            return Err(LinkError::PermissionDenied);
        }
        self.cancel_sweep().await;
        if self.scan.is_some() {
            self.end_scan().await;
        }

        let mut advertisements = self.radio.scan().await?;

        self.next_scan_id += 1;
        let scan_id = self.next_scan_id;
        self.candidates.clear();
        self.scan_filter.reset();

        let internal = self.internal_tx.clone();
        let ceiling = self.settings.scan_timeout();
        let task = tokio::spawn(async move {
            let deadline = tokio::time::sleep(ceiling);
            tokio::pin!(deadline);
            let mut open = true;
            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        let _ = internal.send(Internal::ScanTimedOut { scan_id });
                        break;
                    }
                    next = advertisements.recv(), if open => match next {
                        Some(advertisement) => {
                            if internal.send(Internal::Advertisement { scan_id, advertisement }).is_err() {
                                break;
                            }
                        }
                        // The ceiling still ends the scan
                        None => open = false,
                    },
                }
            }
        });

        self.scan = Some(ScanRun { id: scan_id, task });
        self.transition(Trigger::StartScan);
        info!("Scanning for {:?}", self.settings.supported_models);
        Ok(())
    }

    async fn end_scan(&mut self) {
        if let Some(run) = self.scan.take() {
            run.task.abort();
            if let Err(e) = self.radio.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        }
        self.candidates.clear();
    }

    fn is_current_scan(&self, scan_id: u64) -> bool {
        self.state == ConnectionState::Scanning
            && self.scan.as_ref().map(|run| run.id) == Some(scan_id)
    }

    // Background sweeps

    async fn start_sweep(&mut self, window: Duration, reply: Reply<Option<HashSet<String>>>) {
        let free = matches!(self.state, ConnectionState::Idle | ConnectionState::Connected);
        if !free || self.sweep.is_some() {
            debug!("Sweep requested while {}, skipping", self.state);
            let _ = reply.send(Ok(None));
            return;
        }
        let mut advertisements = match self.radio.scan().await {
            Ok(advertisements) => advertisements,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        self.next_scan_id += 1;
        let sweep_id = self.next_scan_id;
        let internal = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let mut visible = HashSet::new();
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    next = advertisements.recv() => match next {
                        Some(advertisement) => {
                            visible.insert(advertisement.peripheral.id);
                        }
                        None => break,
                    },
                }
            }
            let _ = internal.send(Internal::SweepFinished { sweep_id, visible });
        });
        self.sweep = Some(SweepRun { id: sweep_id, task, reply });
    }

    /// Release the radio from a sweep in flight; its caller sees `None`
    async fn cancel_sweep(&mut self) {
        let Some(run) = self.sweep.take() else {
            return;
        };
        run.task.abort();
        debug!("Sweep {} cancelled", run.id);
        if let Err(e) = self.radio.stop_scan().await {
            warn!("Failed to stop sweep scan: {}", e);
        }
        let _ = run.reply.send(Ok(None));
    }

    async fn on_advertisement(&mut self, advertisement: Advertisement) {
        let Some(advertisement) = self.scan_filter.admit(advertisement) else {
            return;
        };
        let peripheral = advertisement.peripheral;

        match self.registry.is_known(&peripheral).await {
            Ok(true) => {
                info!("Known peripheral {} in range, reconnecting", peripheral);
                self.end_scan().await;
                self.begin_connect(peripheral, Trigger::KnownCandidate, Some(true), Vec::new());
            }
            Ok(false) => {
                debug!("Discovered {}", peripheral);
                self.candidates.push(DiscoveryCandidate {
                    peripheral,
                    matches_known_model: true,
                });
            }
            Err(e) => {
                log_error(
                    &e,
                    &ErrorContext::new("ConnectionManager", "is_known").with_metadata("peripheral", &peripheral.id),
                );
                self.candidates.push(DiscoveryCandidate {
                    peripheral,
                    matches_known_model: true,
                });
            }
        }
    }

    // Connecting

    async fn request_connect(&mut self, peripheral: PeripheralIdentity, reply: Reply<()>) {
        let same = self.peripheral.as_ref() == Some(&peripheral);
        if !(same && self.state == ConnectionState::Connected) {
            self.cancel_sweep().await;
        }
        match self.state.clone() {
            ConnectionState::Connected if same => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Connecting if same => {
                if let Some(attempt) = self.attempt.as_mut() {
                    attempt.waiters.push(reply);
                }
            }
            ConnectionState::Connecting => {
                self.cancel_attempt("superseded");
                self.transition(Trigger::AttemptFailed("superseded".to_string()));
                self.peripheral = None;
                self.transition(Trigger::Reset);
                let known = self.known_hint(&peripheral).await;
                self.begin_connect(peripheral, Trigger::ConnectRequested, known, vec![reply]);
            }
            ConnectionState::Connected => {
                self.transition(Trigger::DisconnectRequested);
                self.close_session(Some(format!("switching to {}", peripheral.label()))).await;
                let known = self.known_hint(&peripheral).await;
                self.begin_connect(peripheral, Trigger::ConnectRequested, known, vec![reply]);
            }
            ConnectionState::Scanning => {
                self.end_scan().await;
                let known = self.known_hint(&peripheral).await;
                self.begin_connect(peripheral, Trigger::ConnectRequested, known, vec![reply]);
            }
            ConnectionState::Idle | ConnectionState::Disconnecting | ConnectionState::Failed(_) => {
                let known = self.known_hint(&peripheral).await;
                self.begin_connect(peripheral, Trigger::ConnectRequested, known, vec![reply]);
            }
        }
    }

    async fn known_hint(&self, peripheral: &PeripheralIdentity) -> Option<bool> {
        match self.registry.is_known(peripheral).await {
            Ok(known) => Some(known),
            Err(e) => {
                warn!("Registry lookup for {} failed: {}", peripheral.id, e);
                None
            }
        }
    }

    fn begin_connect(
        &mut self,
        peripheral: PeripheralIdentity,
        trigger: Trigger,
        known: Option<bool>,
        waiters: Vec<Reply<()>>,
    ) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.peripheral = Some(peripheral.clone());
        self.transition(trigger);

        if known == Some(false) {
            self.emit(&peripheral, EventStatus::PairingStarted, None);
        }

        let radio = Arc::clone(&self.radio);
        let internal = self.internal_tx.clone();
        let options = SessionOptions {
            data_service: self.settings.data_service_uuid,
            preferred_mtu: self.settings.preferred_mtu,
        };
        let target = peripheral.clone();
        let task = tokio::spawn(async move {
            let outcome = session::establish(radio.as_ref(), &target, &options).await;
            let _ = internal.send(Internal::ConnectOutcome { epoch, outcome });
        });

        self.attempt = Some(Attempt {
            peripheral,
            task,
            waiters,
        });
    }

    async fn on_connect_outcome(&mut self, epoch: u64, outcome: Result<Established>) {
        if epoch != self.epoch || self.attempt.is_none() {
            if let Ok(established) = outcome {
                debug!("Closing link from abandoned attempt (epoch {})", epoch);
                tokio::spawn(async move {
                    let _ = established.link.disconnect().await;
                });
            }
            return;
        }
        let Some(attempt) = self.attempt.take() else {
            return;
        };

        match outcome {
            Ok(established) => {
                let peripheral = attempt.peripheral;
                let link = established.link;
                let internal = self.internal_tx.clone();
                let log = self.messages.clone();
                let notifications = established.notifications;
                let pump_id = peripheral.id.clone();
                let pump = tokio::spawn(async move {
                    stream::pump_notifications(pump_id, notifications, log).await;
                    let _ = internal.send(Internal::LinkLost { epoch });
                });

                self.session = Some(ActiveSession {
                    link,
                    characteristic: established.characteristic,
                    mtu: established.mtu,
                    pump,
                });
                self.transition(Trigger::Established);
                info!("Connected to {} (MTU {})", peripheral, established.mtu);

                let outcome = self.registry.record_successful_connection(&peripheral).await;
                self.emit(&peripheral, EventStatus::Connected, None);
                match outcome {
                    Ok(RecordOutcome::Paired) => self.emit(&peripheral, EventStatus::PairingCompleted, None),
                    Ok(RecordOutcome::Reconnected) => {}
                    Err(e) => log_error(
                        &e,
                        &ErrorContext::new("ConnectionManager", "record_successful_connection")
                            .with_metadata("peripheral", &peripheral.id),
                    ),
                }

                for waiter in attempt.waiters {
                    let _ = waiter.send(Ok(()));
                }
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", attempt.peripheral, e);
                self.transition(Trigger::AttemptFailed(e.reason().to_string()));
                self.emit(&attempt.peripheral, EventStatus::ConnectionFailed, Some(e.to_string()));
                self.peripheral = None;
                self.transition(Trigger::Reset);
                for waiter in attempt.waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
            }
        }
    }

    /// Abort the in-flight attempt and fail its waiters
    fn cancel_attempt(&mut self, reason: &str) {
        if let Some(attempt) = self.attempt.take() {
            attempt.task.abort();
            info!("Connection attempt to {} {}", attempt.peripheral, reason);
            self.emit(&attempt.peripheral, EventStatus::ConnectionFailed, Some(reason.to_string()));
            for waiter in attempt.waiters {
                let _ = waiter.send(Err(LinkError::LinkFailure(reason.to_string())));
            }
        }
    }

    // Disconnecting

    async fn request_disconnect(&mut self) {
        match self.state {
            ConnectionState::Connected => {
                self.transition(Trigger::DisconnectRequested);
                self.close_session(None).await;
                self.peripheral = None;
                self.transition(Trigger::TeardownComplete);
            }
            ConnectionState::Connecting => {
                self.transition(Trigger::DisconnectRequested);
                self.cancel_attempt("cancelled");
                self.peripheral = None;
                self.transition(Trigger::TeardownComplete);
            }
            ConnectionState::Scanning => {
                self.end_scan().await;
                self.transition(Trigger::StopScan);
            }
            _ => debug!("Disconnect requested while {}, nothing to do", self.state),
        }
    }

    /// Close the active session and emit `disconnected` for it
    async fn close_session(&mut self, details: Option<String>) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.pump.abort();
        let peripheral = session.link.identity().clone();
        if let Err(e) = session.link.disconnect().await {
            warn!("Disconnect from {} reported: {}", peripheral.id, e);
        }
        info!("Disconnected from {}", peripheral);
        self.emit(&peripheral, EventStatus::Disconnected, details);
    }

    /// The radio confirmed the session is gone
    fn lose_session(&mut self, reason: &str) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.pump.abort();
        let peripheral = session.link.identity().clone();
        warn!("Lost connection to {}: {}", peripheral, reason);

        let link = session.link;
        tokio::spawn(async move {
            let _ = link.disconnect().await;
        });

        self.peripheral = None;
        self.transition(Trigger::LinkLost);
        self.emit(&peripheral, EventStatus::Disconnected, Some(reason.to_string()));
    }

    async fn forget(&mut self, id: &str) -> Result<bool> {
        let target = PeripheralIdentity::new(id, None);
        if self.peripheral.as_ref() == Some(&target) {
            match self.state {
                ConnectionState::Connected => {
                    self.transition(Trigger::DisconnectRequested);
                    self.close_session(Some("forgotten".to_string())).await;
                    self.peripheral = None;
                    self.transition(Trigger::TeardownComplete);
                }
                ConnectionState::Connecting => {
                    self.transition(Trigger::DisconnectRequested);
                    self.cancel_attempt("forgotten");
                    self.peripheral = None;
                    self.transition(Trigger::TeardownComplete);
                }
                _ => {}
            }
        }

        let record = self.registry.get(id).await?;
        let forgotten = self.registry.forget(&target).await?;
        if forgotten {
            let peripheral = record.map(|r| r.peripheral).unwrap_or(target);
            self.emit(&peripheral, EventStatus::ForgotDevice, None);
        }
        Ok(forgotten)
    }

    // Health and writes

    fn check_health(&mut self, epoch: Option<u64>, reply: Reply<bool>) {
        let session = match (&self.session, &self.state) {
            (Some(session), ConnectionState::Connected) => session,
            _ => {
                let _ = reply.send(Err(LinkError::NotConnected));
                return;
            }
        };
        if epoch.is_some_and(|e| e != self.epoch) {
            debug!("Skipping health check for stale epoch {:?}", epoch);
            let _ = reply.send(Err(LinkError::NotConnected));
            return;
        }

        let link = Arc::clone(&session.link);
        let internal = self.internal_tx.clone();
        let epoch = self.epoch;
        let limit = self.settings.health_query_timeout();
        tokio::spawn(async move {
            let alive = query_liveness(link.as_ref(), limit).await;
            let _ = internal.send(Internal::HealthResult { epoch, alive, reply });
        });
    }

    fn send(&self, text: String, reply: Reply<()>) {
        let session = match (&self.session, &self.state) {
            (Some(session), ConnectionState::Connected) => session,
            _ => {
                let _ = reply.send(Err(LinkError::NotConnected));
                return;
            }
        };
        let link = Arc::clone(&session.link);
        let characteristic = session.characteristic.clone();
        let mtu = session.mtu;
        tokio::spawn(async move {
            let result = session::write_text(link.as_ref(), &characteristic, mtu, &text).await;
            let _ = reply.send(result);
        });
    }

    // Plumbing

    fn transition(&mut self, trigger: Trigger) {
        match state::next_state(&self.state, &trigger) {
            Some(next) => {
                debug!("{} -> {} on {:?}", self.state, next, trigger);
                self.state = next;
                self.publish();
            }
            None => warn!("Ignoring {:?} while {}", trigger, self.state),
        }
    }

    fn publish(&self) {
        let negotiated_mtu = match self.state {
            ConnectionState::Connected => self.session.as_ref().map(|s| s.mtu),
            _ => None,
        };
        self.snapshot_tx.send_replace(ConnectionSnapshot {
            state: self.state.clone(),
            peripheral: self.peripheral.clone(),
            session_epoch: self.epoch,
            negotiated_mtu,
        });
    }

    fn connected_id(&self) -> Option<&str> {
        match self.state {
            ConnectionState::Connected => self.peripheral.as_ref().map(|p| p.id.as_str()),
            _ => None,
        }
    }

    fn emit(&self, peripheral: &PeripheralIdentity, status: EventStatus, details: Option<String>) {
        let mut event = ConnectionEvent::new(peripheral, status);
        event.details = details;
        self.emitter.emit(event);
    }

    async fn teardown(&mut self) {
        self.cancel_sweep().await;
        self.end_scan().await;
        self.cancel_attempt("cancelled");
        if self.session.is_some() {
            self.close_session(Some("shutdown".to_string())).await;
        }
        self.peripheral = None;
        self.state = ConnectionState::Idle;
        self.publish();
    }
}

/// Ask the link whether it is up; errors and timeouts count as down
async fn query_liveness(link: &dyn Link, limit: Duration) -> bool {
    match tokio::time::timeout(limit, link.is_connected()).await {
        Ok(Ok(alive)) => alive,
        Ok(Err(e)) => {
            warn!("Liveness query for {} failed: {}", link.identity().id, e);
            false
        }
        Err(_) => {
            warn!("Liveness query for {} timed out after {:?}", link.identity().id, limit);
            false
        }
    }
}

/// Cloneable handle to the manager task
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<ConnectionSnapshot>,
    messages: MessageLog,
}

impl ConnectionHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        rx.await.map_err(|_| LinkError::ManagerStopped)?
    }

    /// Start a scan; resolves once scanning has begun
    pub async fn scan(&self) -> Result<()> {
        self.request(Command::Scan).await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.request(Command::StopScan).await
    }

    /// Connect to a peripheral; resolves when the attempt succeeds or fails
    pub async fn connect(&self, peripheral: PeripheralIdentity) -> Result<()> {
        self.request(|reply| Command::Connect(peripheral, reply)).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await
    }

    /// Remove a peripheral from the registry, disconnecting it first if it is
    /// the current session; returns whether a record was forgotten
    pub async fn forget(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.request(|reply| Command::Forget(id, reply)).await
    }

    /// Query the current session's liveness; a dead link is torn down
    pub async fn check_health(&self) -> Result<bool> {
        self.request(|reply| Command::CheckHealth(None, reply)).await
    }

    /// Health check pinned to the session with `epoch`
    pub async fn check_health_for(&self, epoch: u64) -> Result<bool> {
        self.request(|reply| Command::CheckHealth(Some(epoch), reply)).await
    }

    /// Report that the peripheral of session `epoch` is no longer advertising
    pub async fn report_device_lost(&self, id: &str, epoch: u64) -> Result<()> {
        self.lost(id, epoch, "device lost").await
    }

    /// Report that the radio can no longer vouch for session `epoch`
    pub async fn report_link_lost(&self, id: &str, epoch: u64) -> Result<()> {
        self.lost(id, epoch, "link loss").await
    }

    async fn lost(&self, id: &str, epoch: u64, reason: &'static str) -> Result<()> {
        self.commands
            .send(Command::DeviceLost {
                id: id.to_string(),
                epoch,
                reason,
            })
            .await
            .map_err(|_| LinkError::ManagerStopped)
    }

    /// Listen for `window` without changing the connection state
    ///
    /// Resolves to the ids heard, or `None` when the radio was busy with a
    /// scan or connection, or was taken over before the window closed.
    pub async fn sweep(&self, window: Duration) -> Result<Option<HashSet<String>>> {
        self.request(|reply| Command::Sweep(window, reply)).await
    }

    /// Stop a sweep in flight, if any
    pub async fn cancel_sweep(&self) -> Result<()> {
        self.request(Command::CancelSweep).await
    }

    /// Write text to the connected peripheral
    pub async fn send(&self, text: &str) -> Result<()> {
        let text = text.to_string();
        self.request(|reply| Command::Send(text, reply)).await
    }

    /// Candidates surfaced by the current scan
    pub async fn candidates(&self) -> Result<Vec<DiscoveryCandidate>> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Candidates(tx))
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        rx.await.map_err(|_| LinkError::ManagerStopped)
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state.clone()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every published snapshot
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.clone()
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }

    /// Wait until the published state satisfies `predicate`
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<ConnectionSnapshot>
    where
        F: FnMut(&ConnectionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| LinkError::ManagerStopped)?;
        Ok(snapshot.clone())
    }

    /// Stop the manager task, closing any session
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}
