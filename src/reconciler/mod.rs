//! Network-state reconciliation loop.
//!
//! Two periodic activities share one [`Reconciler`]:
//!
//! - **refresh**: interface facts + portal identity → [`NetworkState`], for a
//!   window after start-up and after every connectivity change;
//! - **reachability**: ping the campus targets, detect online/offline
//!   transitions, and drive bounded automatic sign-in.
//!
//! Each tick is spawned as its own task and guarded so that a slow tick is
//! never overlapped by its successor. Results go out as [`Event`]s on a
//! broadcast channel; nothing else is shared with the presentation side.

mod guard;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

pub use guard::{LoginDenied, LoginGuard, TickGuard, TickPermit};

use crate::config::Config;
use crate::credentials::{Credential, CredentialStore};
use crate::error::{Error, Result};
use crate::interface::{online_candidates, InterfaceProbe, SelectionPolicy};
use crate::model::{
    Connectivity, Identity, InterfaceKind, LoginResult, NetworkState, OnlineStatus,
    PublicAddress, ReachabilityResult,
};
use crate::portal::Portal;
use crate::reachability::{classify, ReachabilityProbe};

const EVENT_CAPACITY: usize = 64;

/// Notifications for the presentation layer.
#[derive(Clone, Debug)]
pub enum Event {
    StateChanged(NetworkState),
    ConnectivityChanged {
        online: bool,
        connectivity: Connectivity,
    },
    LoginFinished {
        account_id: String,
        automatic: bool,
        success: bool,
        message: String,
    },
}

#[derive(Clone, Debug)]
pub struct Schedule {
    pub refresh_interval: Duration,
    /// `None`: refresh for as long as the process runs.
    pub refresh_window: Option<Duration>,
    pub reachability_interval: Duration,
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(5),
            refresh_window: Some(Duration::from_secs(20)),
            reachability_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Options {
    pub policy: SelectionPolicy,
    pub auto_login: bool,
    pub max_login_attempts: u32,
    pub login_cooldown: Duration,
    pub login_interface: InterfaceKind,
    pub schedule: Schedule,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            policy: SelectionPolicy::PreferWired,
            auto_login: true,
            max_login_attempts: 5,
            login_cooldown: Duration::from_secs(30),
            login_interface: InterfaceKind::Wireless,
            schedule: Schedule::default(),
        }
    }
}

impl Options {
    pub fn from_config(config: &Config) -> Self {
        let schedule = &config.schedule;
        Self {
            policy: config.interfaces.policy,
            auto_login: config.auto_login.enabled,
            max_login_attempts: config.auto_login.max_attempts,
            login_cooldown: Duration::from_secs(config.auto_login.cooldown_secs),
            login_interface: config.auto_login.interface,
            schedule: Schedule {
                refresh_interval: Duration::from_secs(schedule.refresh_interval_secs),
                refresh_window: match schedule.refresh_window_secs {
                    0 => None,
                    secs => Some(Duration::from_secs(secs)),
                },
                reachability_interval: Duration::from_secs(schedule.reachability_interval_secs),
            },
        }
    }
}

/// What one reachability tick observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReachabilityOutcome {
    pub result: ReachabilityResult,
    pub online: bool,
    pub connectivity: Connectivity,
    /// True when `online` differs from the previous tick (or this is the first one).
    pub changed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    last_state: Option<NetworkState>,
    last_online: Option<bool>,
    last_connectivity: Option<Connectivity>,
    refresh_until: Option<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Reconciler<I, R, P> {
    interfaces: I,
    reachability: R,
    portal: P,
    credentials: Mutex<CredentialStore>,
    options: Options,
    shared: Mutex<Shared>,
    login_guard: Mutex<LoginGuard>,
    refresh_guard: TickGuard,
    reachability_guard: TickGuard,
    events: broadcast::Sender<Event>,
}

impl<I, R, P> Reconciler<I, R, P>
where
    I: InterfaceProbe,
    R: ReachabilityProbe,
    P: Portal,
{
    pub fn new(
        interfaces: I,
        reachability: R,
        portal: P,
        credentials: CredentialStore,
        options: Options,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let login_guard = LoginGuard::new(options.max_login_attempts, options.login_cooldown);
        Self {
            interfaces,
            reachability,
            portal,
            credentials: Mutex::new(credentials),
            options,
            shared: Mutex::new(Shared::default()),
            login_guard: Mutex::new(login_guard),
            refresh_guard: TickGuard::default(),
            reachability_guard: TickGuard::default(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn last_state(&self) -> Option<NetworkState> {
        lock(&self.shared).last_state.clone()
    }

    pub fn is_online(&self) -> Option<bool> {
        lock(&self.shared).last_online
    }

    pub fn login_attempts(&self) -> u32 {
        lock(&self.login_guard).attempts()
    }

    fn publish(&self, event: Event) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    // ── Refresh ─────────────────────────────────────────────────────

    /// One refresh tick. Returns `None` if the previous refresh is still running.
    pub async fn refresh(&self) -> Option<NetworkState> {
        let Some(_permit) = self.refresh_guard.try_enter() else {
            tracing::debug!("Refresh still in flight, dropping tick");
            return None;
        };
        let state = self.compute_state().await;
        lock(&self.shared).last_state = Some(state.clone());
        self.publish(Event::StateChanged(state.clone()));
        Some(state)
    }

    async fn compute_state(&self) -> NetworkState {
        let facts = self.interfaces.collect().await;
        let candidates = online_candidates(&facts);
        if candidates.len() > 1 {
            tracing::info!(
                "{} interfaces online, choosing by {:?}",
                candidates.len(),
                self.options.policy
            );
        }
        let Some((name, primary)) = self.options.policy.select(&candidates) else {
            tracing::info!("No interface has an IPv4 address, network is offline");
            return NetworkState::offline();
        };
        tracing::debug!("Primary interface: {} {:?}", name, primary);

        let identity = match self.portal.fetch_identity().await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!("Fetching portal identity failed: {}", e);
                Identity::default()
            }
        };
        let public = match self.portal.fetch_public_ip().await {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("Fetching public IP failed: {}", e);
                PublicAddress::default()
            }
        };
        let devices = match identity.account_id.as_deref() {
            Some(uid) => self.portal.fetch_active_devices(uid).await.unwrap_or_else(|e| {
                tracing::warn!("Fetching online devices failed: {}", e);
                Vec::new()
            }),
            None => Vec::new(),
        };

        let connectivity = lock(&self.shared).last_connectivity;
        let online_status = match connectivity {
            Some(Connectivity::CaptivePortal) => OnlineStatus::CaptivePortal,
            _ => OnlineStatus::Online,
        };
        let state = NetworkState {
            online_status,
            ipv4: identity.ipv4.or(public.ipv4).or(primary.ipv4),
            ipv6: match public.ipv6 {
                Some(ip) => vec![ip],
                None => primary.ipv6.clone(),
            },
            mac: primary.mac.clone(),
            interface_name: Some(name.to_string()),
            dns: primary.dns_servers.clone(),
            portal_user_id: identity.account_id,
            devices,
        };
        tracing::info!(
            "Network {:?} via {}: ipv4={:?} id={:?}",
            state.online_status,
            name,
            state.ipv4,
            state.portal_user_id
        );
        state
    }

    fn refresh_window_open(&self, now: Instant) -> bool {
        if self.options.schedule.refresh_window.is_none() {
            return true;
        }
        lock(&self.shared).refresh_until.is_some_and(|until| now < until)
    }

    fn rearm_refresh_window(&self, shared: &mut Shared) {
        shared.refresh_until = self
            .options
            .schedule
            .refresh_window
            .map(|window| Instant::now() + window);
    }

    // ── Reachability ────────────────────────────────────────────────

    /// One reachability tick. Returns `None` if the previous check is still running.
    pub async fn check_reachability(&self) -> Option<ReachabilityOutcome> {
        let Some(_permit) = self.reachability_guard.try_enter() else {
            tracing::debug!("Reachability check still in flight, dropping tick");
            return None;
        };
        let result = self.reachability.check().await;
        let online = result.is_online();
        let connectivity = classify(&result);

        let changed = {
            let mut shared = lock(&self.shared);
            let changed = shared.last_online != Some(online);
            shared.last_online = Some(online);
            shared.last_connectivity = Some(connectivity);
            if changed {
                self.rearm_refresh_window(&mut shared);
            }
            changed
        };

        if changed {
            tracing::info!("Network status changed: online={} ({:?})", online, connectivity);
            self.publish(Event::ConnectivityChanged {
                online,
                connectivity,
            });
        }

        if online {
            lock(&self.login_guard).reset();
        } else {
            self.auto_login().await;
        }

        Some(ReachabilityOutcome {
            result,
            online,
            connectivity,
            changed,
        })
    }

    async fn auto_login(&self) {
        if !self.options.auto_login {
            return;
        }
        let credential = lock(&self.credentials).auto_login();
        let Some(credential) = credential else {
            tracing::debug!("Offline but no account is marked for auto-login");
            return;
        };

        let permitted = lock(&self.login_guard).try_begin(Instant::now());
        let attempt = match permitted {
            Ok(attempt) => attempt,
            Err(LoginDenied::Exhausted { attempts, first }) => {
                if first {
                    tracing::warn!(
                        "Auto sign-in gave up after {} attempt(s); waiting for connectivity to return",
                        attempts
                    );
                }
                return;
            }
            Err(LoginDenied::CoolingDown { remaining }) => {
                tracing::debug!("Auto sign-in cooling down, {:?} left", remaining);
                return;
            }
        };

        tracing::info!(
            "Auto sign-in attempt {}/{} for {}",
            attempt,
            self.options.max_login_attempts,
            credential.account_id
        );
        let outcome = self
            .portal
            .login(
                &credential.account_id,
                &credential.password,
                self.options.login_interface,
            )
            .await;
        // failures are only logged and announced; the guard decides about retrying
        let _ = self.finish_login(&credential.account_id, true, outcome);
    }

    fn finish_login(
        &self,
        account_id: &str,
        automatic: bool,
        outcome: Result<LoginResult>,
    ) -> Result<LoginResult> {
        let (success, message) = match &outcome {
            Ok(reply) => (
                reply.success,
                reply.message.clone().unwrap_or_else(|| {
                    if reply.success { "signed in" } else { "rejected by portal" }.to_string()
                }),
            ),
            Err(e) => (false, e.to_string()),
        };
        if success {
            tracing::info!("Sign in for {} succeeded: {}", account_id, message);
        } else {
            tracing::warn!("Sign in for {} failed: {}", account_id, message);
        }
        self.publish(Event::LoginFinished {
            account_id: account_id.to_string(),
            automatic,
            success,
            message,
        });
        outcome
    }

    // ── Commands from the presentation layer ────────────────────────

    /// Sign in with a saved account, or the auto-login account when `None`.
    pub async fn sign_in(&self, account_id: Option<&str>) -> Result<LoginResult> {
        let credential = self.resolve_credential(account_id)?;
        let outcome = self
            .portal
            .login(
                &credential.account_id,
                &credential.password,
                self.options.login_interface,
            )
            .await
            .and_then(LoginResult::into_result);
        let outcome = self.finish_login(&credential.account_id, false, outcome);
        if outcome.is_ok() {
            lock(&self.login_guard).reset();
        }
        outcome
    }

    /// Sign the current address out. The account is only used for reporting.
    pub async fn sign_out(&self, account_id: Option<&str>) -> Result<LoginResult> {
        let account = match account_id {
            Some(id) => id.to_string(),
            None => self
                .last_state()
                .and_then(|s| s.portal_user_id)
                .or_else(|| lock(&self.credentials).auto_login().map(|c| c.account_id))
                .unwrap_or_default(),
        };
        let outcome = self
            .portal
            .logout(&account)
            .await
            .and_then(LoginResult::into_result);
        match &outcome {
            Ok(_) => tracing::info!("Signed out {}", account),
            Err(e) => tracing::warn!("Sign out failed: {}", e),
        }
        outcome
    }

    fn resolve_credential(&self, account_id: Option<&str>) -> Result<Credential> {
        let store = lock(&self.credentials);
        match account_id {
            Some(id) => store
                .get(id)
                .ok_or_else(|| Error::UnknownAccount(id.to_string())),
            None => store.auto_login().ok_or(Error::NoDefaultAccount),
        }
    }

    pub fn list_credentials(&self) -> Vec<Credential> {
        lock(&self.credentials).list()
    }

    pub fn save_credentials(&self, credentials: Vec<Credential>) -> Result<()> {
        lock(&self.credentials).save_all(credentials)
    }

    // ── Scheduling ──────────────────────────────────────────────────

    /// One reachability check followed by one refresh.
    pub async fn run_once(&self) -> (Option<ReachabilityOutcome>, Option<NetworkState>) {
        let outcome = self.check_reachability().await;
        let state = self.refresh().await;
        (outcome, state)
    }

    /// Drive both activities until `shutdown` resolves.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()> + Send) {
        self.rearm_refresh_window(&mut lock(&self.shared));
        let schedule = &self.options.schedule;
        tracing::info!(
            "Reconciler started: refresh every {:?} (window {:?}), reachability every {:?}",
            schedule.refresh_interval,
            schedule.refresh_window,
            schedule.reachability_interval
        );

        let refresh = tokio::spawn(Arc::clone(&self).refresh_loop());
        let reachability = tokio::spawn(Arc::clone(&self).reachability_loop());
        shutdown.await;
        tracing::info!("Reconciler stopping");
        refresh.abort();
        reachability.abort();
    }

    async fn refresh_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.options.schedule.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut idle = false;
        loop {
            ticker.tick().await;
            if !self.refresh_window_open(Instant::now()) {
                if !idle {
                    tracing::info!("Refresh window closed, only checking reachability");
                    idle = true;
                }
                continue;
            }
            idle = false;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.refresh().await;
            });
        }
    }

    async fn reachability_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.options.schedule.reachability_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.check_reachability().await;
            });
        }
    }
}
