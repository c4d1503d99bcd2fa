use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::dual_write::DualWriteStore;
use crate::error::{Error, Result};
use crate::feature::Feature;
use crate::gate::GateValue;
use crate::http::{DebugOutput, HttpClient, HttpStore, Timeouts, TOKEN_HEADER};
use crate::instrument::{Instrumenter, NoopInstrumenter};
use crate::memory::MemoryStore;
use crate::pull::PullSyncStore;
use crate::snapshot::Snapshot;
use crate::store::FlagStore;
use crate::synchronizer::{SyncOptions, SyncOutcome, Synchronizer, DEFAULT_SYNC_INTERVAL};
use crate::util::parse_seconds;

pub const DEFAULT_URL: &str = "https://www.flagsync.dev/adapter";

pub const TOKEN_VAR: &str = "FLAGSYNC_TOKEN";
pub const URL_VAR: &str = "FLAGSYNC_URL";
pub const READ_TIMEOUT_VAR: &str = "FLAGSYNC_READ_TIMEOUT";
pub const OPEN_TIMEOUT_VAR: &str = "FLAGSYNC_OPEN_TIMEOUT";
pub const WRITE_TIMEOUT_VAR: &str = "FLAGSYNC_WRITE_TIMEOUT";
pub const SYNC_INTERVAL_VAR: &str = "FLAGSYNC_SYNC_INTERVAL";
pub const SYNC_SECRET_VAR: &str = "FLAGSYNC_SYNC_SECRET";
pub const SYNC_METHOD_VAR: &str = "FLAGSYNC_SYNC_METHOD";

/// How the local store learns about remote changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMethod {
    /// Reads periodically pull the remote snapshot.
    Poll,
    /// Writes go to both stores and a verified push triggers a full pull.
    Webhook,
}

impl SyncMethod {
    pub const ALL: [SyncMethod; 2] = [SyncMethod::Poll, SyncMethod::Webhook];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMethod::Poll => "poll",
            SyncMethod::Webhook => "webhook",
        }
    }
}

impl fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SyncMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "unsupported sync method {:?}, valid options are poll, webhook",
                    s
                ))
            })
    }
}

/// The resolved synchronization strategy of a [Configuration].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStrategy {
    Poll { interval: Duration },
    Webhook,
}

impl SyncStrategy {
    pub fn method(&self) -> SyncMethod {
        match self {
            SyncStrategy::Poll { .. } => SyncMethod::Poll,
            SyncStrategy::Webhook => SyncMethod::Webhook,
        }
    }
}

/// Contains methods for building a [Configuration].
///
/// Setters never fail; invalid or missing values are reported by [ConfigurationBuilder::build].
/// The defaults are:
/// - url: [DEFAULT_URL]
/// - read, open and write timeouts: 5 seconds
/// - sync interval: 10 seconds
/// - no sync secret, so the poll strategy is used
/// - a [NoopInstrumenter] and a fresh [MemoryStore] as the local store
///
/// A token and an [HttpClient] are always required.
#[derive(Default)]
pub struct ConfigurationBuilder {
    token: Option<String>,
    url: Option<String>,
    read_timeout: Option<Duration>,
    open_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    sync_interval: Option<Duration>,
    sync_secret: Option<String>,
    instrumenter: Option<Arc<dyn Instrumenter>>,
    local_store: Option<Arc<dyn FlagStore>>,
    debug_output: Option<DebugOutput>,
    http_client: Option<Arc<dyn HttpClient>>,
    error: Option<Error>,
}

impl ConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The token of the environment to sync with.
    pub fn token(&mut self, token: impl Into<String>) -> &mut Self {
        self.token = Some(token.into());
        self
    }

    /// Base url of the HTTP adapter API. Only worth changing for local development.
    pub fn url(&mut self, url: impl Into<String>) -> &mut Self {
        self.url = Some(url.into());
        self
    }

    pub fn read_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn open_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.open_timeout = Some(timeout);
        self
    }

    pub fn write_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Minimum time between two read-triggered syncs. Must be greater than zero.
    pub fn sync_interval(&mut self, interval: Duration) -> &mut Self {
        self.sync_interval = Some(interval);
        self
    }

    /// The secret used to verify push notifications. Setting it selects the webhook strategy.
    pub fn sync_secret(&mut self, secret: impl Into<String>) -> &mut Self {
        self.sync_secret = Some(secret.into());
        self
    }

    pub fn instrumenter(&mut self, instrumenter: Arc<dyn Instrumenter>) -> &mut Self {
        self.instrumenter = Some(instrumenter);
        self
    }

    /// The store every read is served from.
    pub fn local_store(&mut self, store: Arc<dyn FlagStore>) -> &mut Self {
        self.local_store = Some(store);
        self
    }

    /// Writer receiving one line for each HTTP request. Off by default.
    pub fn debug_output(&mut self, output: DebugOutput) -> &mut Self {
        self.debug_output = Some(output);
        self
    }

    pub fn http_client(&mut self, client: Arc<dyn HttpClient>) -> &mut Self {
        self.http_client = Some(client);
        self
    }

    /// Has no effect: the strategy follows from whether a sync secret is set.
    #[deprecated(note = "the sync method is derived from the sync secret")]
    pub fn sync_method(&mut self, method: SyncMethod) -> &mut Self {
        warn!(
            "sync_method({}) is deprecated and has no effect, set a sync secret to use webhooks",
            method
        );
        self
    }

    /// Fills every value that has not been set explicitly from `lookup`, which is typically a
    /// wrapper around `std::env::var`.
    ///
    /// Values that cannot be parsed are reported by [ConfigurationBuilder::build].
    pub fn with_vars<F>(&mut self, lookup: F) -> &mut Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.token.is_none() {
            self.token = lookup(TOKEN_VAR);
        }
        if self.url.is_none() {
            self.url = lookup(URL_VAR);
        }
        if self.sync_secret.is_none() {
            self.sync_secret = lookup(SYNC_SECRET_VAR);
        }
        if lookup(SYNC_METHOD_VAR).is_some() {
            warn!("{} is deprecated and has no effect", SYNC_METHOD_VAR);
        }

        let durations = [
            (READ_TIMEOUT_VAR, &mut self.read_timeout),
            (OPEN_TIMEOUT_VAR, &mut self.open_timeout),
            (WRITE_TIMEOUT_VAR, &mut self.write_timeout),
            (SYNC_INTERVAL_VAR, &mut self.sync_interval),
        ];
        for (name, slot) in durations {
            if slot.is_some() {
                continue;
            }
            if let Some(value) = lookup(name) {
                match parse_seconds(name, &value) {
                    Ok(duration) => *slot = Some(duration),
                    Err(e) => {
                        self.error.get_or_insert(e);
                    }
                }
            }
        }
        self
    }

    pub fn build(&self) -> Result<Configuration> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let token = match &self.token {
            Some(token) if !token.is_empty() => token.clone(),
            _ => {
                return Err(Error::Configuration(format!(
                    "token is missing, set {} or provide a token",
                    TOKEN_VAR
                )))
            }
        };
        let http_client = self.http_client.clone().ok_or_else(|| {
            Error::Configuration("an HTTP client is required to reach the remote".to_string())
        })?;
        let sync_interval = self.sync_interval.unwrap_or(DEFAULT_SYNC_INTERVAL);
        if sync_interval.is_zero() {
            return Err(Error::Configuration(
                "sync interval must be greater than zero".to_string(),
            ));
        }

        let defaults = Timeouts::default();
        Ok(Configuration {
            token,
            url: self.url.clone().unwrap_or_else(|| DEFAULT_URL.to_string()),
            timeouts: Timeouts {
                read: self.read_timeout.unwrap_or(defaults.read),
                open: self.open_timeout.unwrap_or(defaults.open),
                write: self.write_timeout.unwrap_or(defaults.write),
            },
            sync_interval,
            sync_secret: self.sync_secret.clone(),
            instrumenter: self
                .instrumenter
                .clone()
                .unwrap_or_else(|| Arc::new(NoopInstrumenter)),
            local_store: self
                .local_store
                .clone()
                .unwrap_or_else(|| Arc::new(MemoryStore::new())),
            debug_output: self.debug_output.clone(),
            http_client,
            wrap_store: None,
        })
    }
}

/// Everything needed to keep a local store in sync with the flag service.
#[derive(Clone)]
pub struct Configuration {
    token: String,
    url: String,
    timeouts: Timeouts,
    sync_interval: Duration,
    sync_secret: Option<String>,
    instrumenter: Arc<dyn Instrumenter>,
    local_store: Arc<dyn FlagStore>,
    debug_output: Option<DebugOutput>,
    http_client: Arc<dyn HttpClient>,
    wrap_store: Option<StoreWrapper>,
}

/// Decorates the store built by [Configuration::store], for instance to add instrumentation.
pub type StoreWrapper = Arc<dyn Fn(Arc<dyn FlagStore>) -> Arc<dyn FlagStore> + Send + Sync>;

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::new()
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn sync_interval(&self) -> Duration {
        self.sync_interval
    }

    pub fn sync_secret(&self) -> Option<&str> {
        self.sync_secret.as_deref()
    }

    pub fn instrumenter(&self) -> &Arc<dyn Instrumenter> {
        &self.instrumenter
    }

    pub fn local_store(&self) -> &Arc<dyn FlagStore> {
        &self.local_store
    }

    pub fn debug_output(&self) -> Option<&DebugOutput> {
        self.debug_output.as_ref()
    }

    /// [SyncMethod::Webhook] when a sync secret is configured, [SyncMethod::Poll] otherwise.
    pub fn sync_method(&self) -> SyncMethod {
        self.strategy().method()
    }

    /// Has no effect: the strategy follows from whether a sync secret is set.
    #[deprecated(note = "the sync method is derived from the sync secret")]
    pub fn set_sync_method(&mut self, method: SyncMethod) {
        warn!(
            "set_sync_method({}) is deprecated and has no effect, set a sync secret to use webhooks",
            method
        );
    }

    pub fn strategy(&self) -> SyncStrategy {
        match self.sync_secret {
            Some(_) => SyncStrategy::Webhook,
            None => SyncStrategy::Poll {
                interval: self.sync_interval,
            },
        }
    }

    fn sync_options(&self) -> SyncOptions {
        SyncOptions::with_interval(self.sync_interval).instrumenter(Arc::clone(&self.instrumenter))
    }

    /// The remote store, authenticated with the configured token.
    pub fn http_store(&self) -> HttpStore {
        let store = HttpStore::new(self.url.clone(), Arc::clone(&self.http_client))
            .header(TOKEN_HEADER, self.token.clone())
            .timeouts(self.timeouts);
        match &self.debug_output {
            Some(output) => store.debug_output(Arc::clone(output)),
            None => store,
        }
    }

    /// Builds the store the application should read and write flags through.
    ///
    /// With the poll strategy this performs the first sync before returning.
    pub fn build_store(&self) -> Result<CloudStore> {
        let remote: Arc<dyn FlagStore> = Arc::new(self.http_store());
        let local = Arc::clone(&self.local_store);
        match self.strategy() {
            SyncStrategy::Poll { .. } => Ok(CloudStore::Poll(PullSyncStore::new(
                local,
                remote,
                self.sync_options(),
            )?)),
            SyncStrategy::Webhook => Ok(CloudStore::Webhook(DualWriteStore::new(
                local,
                remote,
                self.sync_options(),
            )?)),
        }
    }

    /// Wrap every store returned by [Configuration::store] with `wrapper`.
    pub fn wrap_store<F>(&mut self, wrapper: F)
    where
        F: Fn(Arc<dyn FlagStore>) -> Arc<dyn FlagStore> + Send + Sync + 'static,
    {
        self.wrap_store = Some(Arc::new(wrapper));
    }

    /// The store to hand to the application: [Configuration::build_store], passed through the
    /// wrapper when one is set.
    pub fn store(&self) -> Result<Arc<dyn FlagStore>> {
        let store: Arc<dyn FlagStore> = Arc::new(self.build_store()?);
        Ok(match &self.wrap_store {
            Some(wrap) => wrap(store),
            None => store,
        })
    }

    /// Pulls the remote snapshot into the local store once, whatever the strategy.
    pub fn sync(&self) -> Result<SyncOutcome> {
        Synchronizer::new(
            Arc::clone(&self.local_store),
            Arc::new(self.http_store()),
            self.sync_options(),
        )?
        .reconcile(true)
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Configuration")
            .field("url", &self.url)
            .field("timeouts", &self.timeouts)
            .field("sync_interval", &self.sync_interval)
            .field("strategy", &self.strategy())
            .field("local_store", &self.local_store.name())
            .finish_non_exhaustive()
    }
}

/// The store built by [Configuration::build_store].
pub enum CloudStore {
    Poll(PullSyncStore),
    Webhook(DualWriteStore),
}

impl CloudStore {
    pub fn sync_method(&self) -> SyncMethod {
        match self {
            CloudStore::Poll(_) => SyncMethod::Poll,
            CloudStore::Webhook(_) => SyncMethod::Webhook,
        }
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        match self {
            CloudStore::Poll(store) => store.synchronizer(),
            CloudStore::Webhook(store) => store.synchronizer(),
        }
    }

    /// Force a full pull from the remote, for instance after a verified push notification.
    pub fn sync(&self) -> Result<SyncOutcome> {
        match self {
            CloudStore::Poll(store) => store.sync(),
            CloudStore::Webhook(store) => store.sync(),
        }
    }

    fn inner(&self) -> &dyn FlagStore {
        match self {
            CloudStore::Poll(store) => store,
            CloudStore::Webhook(store) => store,
        }
    }
}

impl FlagStore for CloudStore {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn get(&self, key: &str) -> Result<Option<Feature>> {
        self.inner().get(key)
    }

    fn get_all(&self) -> Result<Snapshot> {
        self.inner().get_all()
    }

    fn features(&self) -> Result<Vec<String>> {
        self.inner().features()
    }

    fn add(&self, key: &str) -> Result<()> {
        self.inner().add(key)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.inner().remove(key)
    }

    fn clear(&self, key: &str) -> Result<()> {
        self.inner().clear(key)
    }

    fn enable(&self, key: &str, gate: &GateValue) -> Result<()> {
        self.inner().enable(key, gate)
    }

    fn disable(&self, key: &str, gate: &GateValue) -> Result<()> {
        self.inner().disable(key, gate)
    }

    fn import(&self, snapshot: &Snapshot) -> Result<()> {
        self.inner().import(snapshot)
    }
}
