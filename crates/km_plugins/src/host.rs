//! The plugin runtime: loads authorized plugins, routes observations into
//! per-plugin mailboxes, and keeps crashed plugins from touching anything
//! but themselves.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use km_api::{plugin_scope, ApiClient, KeyRing, Tier, TokenManager};
use km_events::ObservedMessage;
use serde_json::json;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    discovery::{Discovery, PluginBinary},
    rpc::{PluginProcess, RpcClient},
    PluginError,
};

#[derive(Clone, Debug)]
pub struct HostConfig {
    pub debug: bool,
    /// Abort loads on bad detached signatures; lenient mode logs and
    /// continues.
    pub strict_signatures: bool,
    /// Cadence for crash-recovery reloads; auth refresh runs one minute
    /// earlier each cycle.
    pub auth_refresh_interval: Duration,
    pub rpc_timeout: Duration,
    /// Per-plugin mailbox depth; overflow drops the oldest entry.
    pub mailbox: usize,
    /// How long shutdown waits for forward tasks before tearing them down.
    pub shutdown_grace: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            debug: false,
            strict_signatures: true,
            auth_refresh_interval: Duration::from_secs(300),
            rpc_timeout: Duration::from_secs(30),
            mailbox: 1024,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Result of one load attempt. Tier denial is a normal outcome, not an
/// error: the plugin is killed and the wrapper moves on.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded,
    TierDenied { required: Tier, user: Tier },
}

/// Oldest-drop mailbox feeding one plugin's forward task.
struct Mailbox {
    queue: Mutex<VecDeque<ObservedMessage>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, msg: ObservedMessage) {
        {
            let mut queue = self.queue.lock().expect("mailbox lock");
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(msg);
        }
        self.notify.notify_one();
    }

    async fn recv(&self) -> ObservedMessage {
        loop {
            if let Some(msg) = self.queue.lock().expect("mailbox lock").pop_front() {
                return msg;
            }
            self.notify.notified().await;
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One live plugin.
struct Instance {
    binary: PluginBinary,
    rpc: Arc<RpcClient>,
    process: tokio::sync::Mutex<Option<PluginProcess>>,
    mailbox: Mailbox,
    tier: Tier,
    last_auth: Mutex<Instant>,
    degraded: AtomicBool,
    cancel: CancellationToken,
    forward_task: Mutex<Option<JoinHandle<()>>>,
}

impl Instance {
    async fn kill(&self) {
        self.cancel.cancel();
        if let Some(process) = self.process.lock().await.take() {
            process.kill().await;
        }
    }
}

type PluginTable = Arc<tokio::sync::RwLock<HashMap<String, Arc<Instance>>>>;

/// Loads, authorizes, and supervises observer plugins.
///
/// Exactly one live instance exists per plugin name; a crashed plugin is
/// removed from the table and retried at the next maintenance cycle.
pub struct PluginHost {
    config: HostConfig,
    keyring: KeyRing,
    tokens: Option<Arc<TokenManager>>,
    api: Option<Arc<ApiClient>>,
    plugins: PluginTable,
}

impl PluginHost {
    /// `tokens`/`api` are `None` in anonymous (Free) mode: plugins are
    /// authenticated with an empty token and no backend call is made.
    pub fn new(
        config: HostConfig,
        keyring: KeyRing,
        tokens: Option<Arc<TokenManager>>,
        api: Option<Arc<ApiClient>>,
    ) -> Self {
        Self {
            config,
            keyring,
            tokens,
            api,
            plugins: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
        }
    }

    pub async fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Loads every discovered plugin, isolating failures per plugin.
    /// Returns the failures; tier denials are reported only in debug mode.
    pub async fn load_all(&self, discovered: Vec<PluginBinary>) -> Vec<(String, PluginError)> {
        let mut failures = Vec::new();
        for binary in discovered {
            let name = binary.name.clone();
            match self.load(binary).await {
                Ok(LoadOutcome::Loaded) => {}
                Ok(LoadOutcome::TierDenied { required, user }) => {
                    if self.config.debug {
                        eprintln!(
                            "[PluginManager] plugin `{name}` requires {required} (user tier {user}), not loading"
                        );
                    }
                }
                Err(err) => {
                    warn!(plugin = name.as_str(), error = %err, "plugin load failed");
                    if self.config.debug {
                        eprintln!("[PluginManager] failed to load `{name}`: {err}");
                    }
                    failures.push((name, err));
                }
            }
        }
        failures
    }

    /// Full load sequence: signature, handshake, dispense, authenticate,
    /// tier gate, register.
    pub async fn load(&self, binary: PluginBinary) -> Result<LoadOutcome, PluginError> {
        if self.plugins.read().await.contains_key(&binary.name) {
            debug!(plugin = binary.name.as_str(), "already loaded");
            return Ok(LoadOutcome::Loaded);
        }

        self.verify_binary_signature(&binary).await?;

        let process = PluginProcess::spawn(&binary.path, self.config.rpc_timeout).await?;
        let rpc = Arc::clone(&process.rpc);

        let info = match rpc.get_info().await {
            Ok(info) => info,
            Err(err) => {
                process.kill().await;
                return Err(err);
            }
        };
        if info.name != binary.name {
            process.kill().await;
            return Err(PluginError::LoadFailed {
                plugin: binary.name.clone(),
                reason: format!("binary reports itself as `{}`", info.name),
            });
        }

        if let Err(err) = rpc
            .initialize(json!({ "debug": self.config.debug }))
            .await
        {
            process.kill().await;
            return Err(err);
        }

        let (user_tier, authorized) = match self.authenticate_plugin(&binary, &rpc).await {
            Ok(outcome) => outcome,
            Err(err) => {
                process.kill().await;
                return Err(err);
            }
        };

        let required = binary.required_tier.max(info.required_tier);
        if !user_tier.satisfies(required, authorized) {
            info!(
                plugin = binary.name.as_str(),
                %required,
                user = %user_tier,
                "tier gate denied plugin"
            );
            process.kill().await;
            return Ok(LoadOutcome::TierDenied {
                required,
                user: user_tier,
            });
        }

        self.register(binary, process, user_tier).await;
        Ok(LoadOutcome::Loaded)
    }

    /// Fans an observation out to every loaded plugin's mailbox. Never
    /// blocks: overflow drops the oldest entry per plugin.
    pub async fn forward(&self, msg: &ObservedMessage) {
        let plugins = self.plugins.read().await;
        for instance in plugins.values() {
            instance.mailbox.push(msg.clone());
        }
    }

    /// Per-plugin drop counters, for diagnostics.
    pub async fn drop_counts(&self) -> Vec<(String, u64)> {
        let plugins = self.plugins.read().await;
        plugins
            .iter()
            .map(|(name, instance)| (name.clone(), instance.mailbox.dropped()))
            .collect()
    }

    /// Kills every plugin: cooperative shutdown, bounded wait, then
    /// unconditional teardown.
    pub async fn shutdown(&self) {
        let instances: Vec<Arc<Instance>> =
            { self.plugins.write().await.drain().map(|(_, v)| v).collect() };
        for instance in &instances {
            instance.kill().await;
        }
        for instance in instances {
            let task = instance.forward_task.lock().expect("task lock").take();
            if let Some(task) = task {
                if tokio::time::timeout(self.config.shutdown_grace, task)
                    .await
                    .is_err()
                {
                    warn!("forward task did not stop within grace, aborting");
                }
            }
        }
    }

    /// Long-running upkeep: reloads missing/crashed plugins every refresh
    /// interval and re-authenticates live ones a minute ahead of it.
    pub async fn run_maintenance(&self, discovery: Discovery, cancel: CancellationToken) {
        let reload_period = self.config.auth_refresh_interval;
        let refresh_period = reload_period
            .saturating_sub(Duration::from_secs(60))
            .max(Duration::from_secs(30));

        let mut reload = tokio::time::interval(reload_period);
        let mut refresh = tokio::time::interval(refresh_period);
        // Skip both immediate first ticks; startup already loaded.
        reload.tick().await;
        refresh.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = reload.tick() => self.reload_missing(&discovery).await,
                _ = refresh.tick() => self.refresh_auth().await,
            }
        }
    }

    async fn reload_missing(&self, discovery: &Discovery) {
        let discovered = match discovery.discover() {
            Ok(discovered) => discovered,
            Err(err) => {
                warn!(error = %err, "plugin rediscovery failed");
                return;
            }
        };
        for binary in discovered {
            if self.plugins.read().await.contains_key(&binary.name) {
                continue;
            }
            let name = binary.name.clone();
            debug!(plugin = name.as_str(), "attempting reload");
            if let Err(err) = self.load(binary).await {
                debug!(plugin = name.as_str(), error = %err, "reload failed");
            }
        }
    }

    async fn refresh_auth(&self) {
        let instances: Vec<Arc<Instance>> =
            { self.plugins.read().await.values().cloned().collect() };
        for instance in instances {
            match self
                .authenticate_plugin(&instance.binary, &instance.rpc)
                .await
            {
                Ok(_) => {
                    *instance.last_auth.lock().expect("auth lock") = Instant::now();
                    instance.degraded.store(false, Ordering::Relaxed);
                }
                Err(err) => {
                    // Keep serving observations, but flag the instance.
                    warn!(
                        plugin = instance.binary.name.as_str(),
                        error = %err,
                        "auth refresh failed, plugin degraded"
                    );
                    instance.degraded.store(true, Ordering::Relaxed);
                }
            }
        }
    }

    async fn verify_binary_signature(&self, binary: &PluginBinary) -> Result<(), PluginError> {
        let Some(signature) = &binary.signature else {
            return Ok(());
        };
        let bytes = tokio::fs::read(&binary.path).await?;
        match self.keyring.verify_detached(&bytes, signature) {
            Ok(()) => Ok(()),
            Err(err) if self.config.strict_signatures => Err(PluginError::LoadFailed {
                plugin: binary.name.clone(),
                reason: format!("signature verification failed: {err}"),
            }),
            Err(err) => {
                warn!(
                    plugin = binary.name.as_str(),
                    error = %err,
                    "signature verification failed (lenient mode, continuing)"
                );
                if self.config.debug {
                    eprintln!(
                        "[PluginManager] `{}` signature verification failed: {err}",
                        binary.name
                    );
                }
                Ok(())
            }
        }
    }

    /// Exchanges the API key for a plugin-scoped JWT, has the backend mint
    /// a plugin token, verifies it against the key ring, and presents it to
    /// the plugin. Anonymous mode authenticates with an empty token at the
    /// Free tier.
    async fn authenticate_plugin(
        &self,
        binary: &PluginBinary,
        rpc: &RpcClient,
    ) -> Result<(Tier, bool), PluginError> {
        let (Some(tokens), Some(api)) = (&self.tokens, &self.api) else {
            let result = rpc.authenticate("").await?;
            return Ok((Tier::Free, result.authorized));
        };
        if tokens.api_key().is_empty() {
            let result = rpc.authenticate("").await?;
            return Ok((Tier::Free, result.authorized));
        }

        let scope = plugin_scope(&binary.name);
        let jwt = tokens.get_valid_token(&scope).await?.access_token;

        let request = km_api::types::PluginAuthRequest {
            plugin_name: binary.name.clone(),
            plugin_version: binary.version.clone(),
            plugin_signature: km_api::plugin_signature(&binary.name, &binary.version),
            jwt_token: jwt,
        };
        let response: km_api::types::PluginAuthResponse = api
            .post_json("/api/plugins/authenticate", &scope, &request)
            .await?;

        let claims = self.keyring.verify_for_plugin(&response.token, &binary.name)?;
        let plugin_result = rpc.authenticate(&response.token).await?;

        let authorized = response.success && plugin_result.authorized;
        Ok((claims.tier, authorized))
    }

    async fn register(&self, binary: PluginBinary, process: PluginProcess, tier: Tier) {
        let name = binary.name.clone();
        let rpc = Arc::clone(&process.rpc);
        let instance = Arc::new(Instance {
            binary,
            rpc,
            process: tokio::sync::Mutex::new(Some(process)),
            mailbox: Mailbox::new(self.config.mailbox),
            tier,
            last_auth: Mutex::new(Instant::now()),
            degraded: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            forward_task: Mutex::new(None),
        });

        let task = tokio::spawn(forward_loop(
            Arc::clone(&instance),
            Arc::clone(&self.plugins),
            name.clone(),
            self.config.debug,
        ));
        *instance.forward_task.lock().expect("task lock") = Some(task);

        info!(plugin = name.as_str(), %tier, "plugin loaded");
        self.plugins.write().await.insert(name, instance);
    }

    pub async fn is_degraded(&self, name: &str) -> Option<bool> {
        let plugins = self.plugins.read().await;
        plugins
            .get(name)
            .map(|instance| instance.degraded.load(Ordering::Relaxed))
    }

    pub async fn tier_of(&self, name: &str) -> Option<Tier> {
        let plugins = self.plugins.read().await;
        plugins.get(name).map(|instance| instance.tier)
    }
}

/// Per-plugin delivery loop. A dead RPC connection removes the instance
/// from the table and reaps the child; nothing else in the process notices.
async fn forward_loop(instance: Arc<Instance>, table: PluginTable, name: String, debug_mode: bool) {
    let closed = instance.rpc.closed();
    loop {
        tokio::select! {
            _ = instance.cancel.cancelled() => break,
            _ = closed.cancelled() => {
                warn!(plugin = name.as_str(), "plugin connection lost, removing from active set");
                if debug_mode {
                    eprintln!("[PluginManager] plugin `{name}` crashed; will retry at next refresh");
                }
                table.write().await.remove(&name);
                instance.kill().await;
                break;
            }
            msg = instance.mailbox.recv() => {
                match instance.rpc.process_message(&msg.bytes, msg.direction).await {
                    Ok(events) => {
                        if debug_mode && !events.is_empty() {
                            for event in &events {
                                eprintln!("[PluginManager] `{name}` event: {event}");
                            }
                        }
                    }
                    Err(PluginError::RpcClosed) => {
                        // The closed branch above will fire next iteration.
                        continue;
                    }
                    Err(err) => {
                        debug!(plugin = name.as_str(), error = %err, "observation delivery failed");
                    }
                }
            }
        }
    }
}
