//! Background monitor
//!
//! While the application is in the background the monitor runs two periodic
//! tasks: a discovery sweep that watches known peripherals come and go, and a
//! health check that asks the connected link whether it is still up. Neither
//! ever opens a connection; the only thing they change is downgrading a dead
//! `Connected` session to `Idle` through the connection handle.
//!
//! Sweeps borrow the radio from the connection manager, which hands it back
//! to any foreground scan or connect that arrives mid-sweep. A sweep the radio
//! refuses while connected counts as a lost link.
//!
//! Timers run only while the monitor has been started *and* the app is in the
//! background. Both are cancelled through one [`CancellationToken`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bluetooth::{
    ConnectionEvent, ConnectionHandle, ConnectionState, EventEmitter, EventStatus,
    PeripheralIdentity,
};
use crate::config::MonitorConfig;
use crate::error::{ErrorContext, LinkError, Result};
use crate::logging::log_error;
use crate::registry::DeviceRegistry;

/// Whether the UI is visible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

/// Collaborators the monitor needs
pub struct MonitorParts {
    pub registry: Arc<DeviceRegistry>,
    pub connection: ConnectionHandle,
    pub emitter: Arc<dyn EventEmitter>,
}

/// What a sweep saw
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Known peripherals advertising during this sweep
    pub visible: HashSet<String>,
    /// Known peripherals visible last sweep but not this one
    pub disappeared: HashSet<String>,
    /// Known peripherals visible this sweep but not last one
    pub appeared: HashSet<String>,
}

struct Timers {
    token: CancellationToken,
    sweep: JoinHandle<()>,
    health: JoinHandle<()>,
}

struct Control {
    requested: bool,
    app: AppLifecycle,
    timers: Option<Timers>,
}

struct Inner {
    settings: MonitorConfig,
    registry: Arc<DeviceRegistry>,
    connection: ConnectionHandle,
    emitter: Arc<dyn EventEmitter>,
    visible: tokio::sync::Mutex<HashSet<String>>,
}

/// Periodic sweep and health check scheduler
pub struct BackgroundMonitor {
    inner: Arc<Inner>,
    control: Mutex<Control>,
}

impl BackgroundMonitor {
    pub fn new(settings: MonitorConfig, parts: MonitorParts) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                registry: parts.registry,
                connection: parts.connection,
                emitter: parts.emitter,
                visible: tokio::sync::Mutex::new(HashSet::new()),
            }),
            control: Mutex::new(Control {
                requested: false,
                app: AppLifecycle::Foreground,
                timers: None,
            }),
        }
    }

    /// Request monitoring; timers arm now if the app is in the background.
    /// Calling it again while started has no effect.
    pub fn start(&self) {
        let mut control = self.lock_control();
        if control.requested {
            debug!("Background monitor already started");
            return;
        }
        control.requested = true;
        info!("Background monitor started");
        if control.app == AppLifecycle::Background {
            self.arm(&mut control);
        }
    }

    /// Withdraw the request and cancel both timers
    pub async fn stop(&self) {
        let timers = {
            let mut control = self.lock_control();
            control.requested = false;
            control.timers.take()
        };
        self.disarm(timers).await;
        info!("Background monitor stopped");
    }

    /// Follow the app between foreground and background
    pub async fn set_app_state(&self, app: AppLifecycle) {
        let timers = {
            let mut control = self.lock_control();
            if control.app == app {
                return;
            }
            control.app = app;
            debug!("App moved to {:?}", app);
            match app {
                AppLifecycle::Background => {
                    if self.inner.settings.auto_start_in_background {
                        control.requested = true;
                    }
                    if control.requested {
                        self.arm(&mut control);
                    }
                    None
                }
                AppLifecycle::Foreground => control.timers.take(),
            }
        };
        self.disarm(timers).await;
    }

    /// Whether the sweep and health timers are running
    pub fn is_armed(&self) -> bool {
        self.lock_control().timers.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.lock_control().requested
    }

    /// Run one discovery sweep now
    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.inner.sweep().await
    }

    /// Run one health check now
    pub async fn health_once(&self) {
        self.inner.health_check().await
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, Control> {
        match self.control.lock() {
            Ok(control) => control,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn arm(&self, control: &mut Control) {
        if control.timers.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let sweep = spawn_periodic(
            Arc::clone(&self.inner),
            token.clone(),
            self.inner.settings.sweep_interval(),
            |inner| -> Tick { Box::pin(async move { inner.sweep_tick().await }) },
        );
        let health = spawn_periodic(
            Arc::clone(&self.inner),
            token.clone(),
            self.inner.settings.health_interval(),
            |inner| -> Tick { Box::pin(async move { inner.health_check().await }) },
        );
        control.timers = Some(Timers { token, sweep, health });
        debug!(
            "Armed sweep every {:?} and health check every {:?}",
            self.inner.settings.sweep_interval(),
            self.inner.settings.health_interval()
        );
    }

    async fn disarm(&self, timers: Option<Timers>) {
        let Some(timers) = timers else {
            return;
        };
        timers.token.cancel();
        let _ = timers.sweep.await;
        let _ = timers.health.await;

        // A sweep cancelled mid-scan leaves the radio scanning
        if let Err(e) = self.inner.connection.cancel_sweep().await {
            debug!("Could not cancel sweep: {}", e);
        }
        self.inner.visible.lock().await.clear();
        debug!("Background timers disarmed");
    }
}

type Tick = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

fn spawn_periodic<F>(inner: Arc<Inner>, token: CancellationToken, period: Duration, tick: F) -> JoinHandle<()>
where
    F: Fn(Arc<Inner>) -> Tick + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick(Arc::clone(&inner)) => {}
                    }
                }
            }
        }
    })
}

impl Inner {
    async fn sweep_tick(&self) {
        if let Err(e) = self.sweep().await {
            log_error(&e, &ErrorContext::new("BackgroundMonitor", "sweep"));
        }
    }

    async fn sweep(&self) -> Result<SweepReport> {
        let known: HashMap<String, PeripheralIdentity> = self
            .registry
            .list_active()
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        if known.is_empty() {
            debug!("No known peripherals to look for");
            return Ok(SweepReport::default());
        }

        let visible = match self.connection.sweep(self.settings.sweep_scan()).await {
            Ok(Some(heard)) => heard
                .into_iter()
                .filter(|id| known.contains_key(id))
                .collect::<HashSet<_>>(),
            Ok(None) => {
                debug!("Radio busy, skipping sweep");
                return Ok(SweepReport::default());
            }
            Err(e) => {
                self.drop_unverifiable_session().await;
                return Err(e);
            }
        };

        let mut previous = self.visible.lock().await;
        let report = SweepReport {
            disappeared: previous.difference(&visible).cloned().collect(),
            appeared: visible.difference(&previous).cloned().collect(),
            visible: visible.clone(),
        };
        *previous = visible;
        drop(previous);

        // The session may have moved on while we were scanning
        let snapshot = self.connection.snapshot();
        if let Some(connected) = snapshot.connected_peripheral() {
            if report.disappeared.contains(&connected.id) {
                info!("Connected peripheral {} is no longer advertising", connected);
                self.connection
                    .report_device_lost(&connected.id, snapshot.session_epoch)
                    .await?;
            }
        }
        if snapshot.state == ConnectionState::Idle {
            for id in &report.appeared {
                if let Some(peripheral) = known.get(id) {
                    info!("Known peripheral {} is available", peripheral);
                    self.emitter
                        .emit(ConnectionEvent::new(peripheral, EventStatus::DeviceAvailable));
                }
            }
        }

        debug!(
            "Sweep saw {} known peripherals ({} appeared, {} disappeared)",
            report.visible.len(),
            report.appeared.len(),
            report.disappeared.len()
        );
        Ok(report)
    }

    /// The radio failed us, so the connected link cannot be trusted
    async fn drop_unverifiable_session(&self) {
        let snapshot = self.connection.snapshot();
        if let Some(connected) = snapshot.connected_peripheral() {
            warn!("Sweep failed while connected to {}, treating the link as lost", connected);
            if let Err(e) = self
                .connection
                .report_link_lost(&connected.id, snapshot.session_epoch)
                .await
            {
                debug!("Could not report link loss: {}", e);
            }
        }
    }

    async fn health_check(&self) {
        let snapshot = self.connection.snapshot();
        if snapshot.state != ConnectionState::Connected {
            return;
        }
        match self.connection.check_health_for(snapshot.session_epoch).await {
            Ok(true) => debug!("Link to {:?} is healthy", snapshot.peripheral.map(|p| p.id)),
            Ok(false) => info!("Health check found the link down"),
            Err(LinkError::NotConnected) => debug!("Session changed before the health check ran"),
            Err(e) => log_error(&e, &ErrorContext::new("BackgroundMonitor", "health_check")),
        }
    }
}
