//! `km` — wrap an MCP server, forward its stdio transparently, and feed the
//! observed JSON-RPC traffic to plugins and the batching egress pipeline.

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use km_api::{
    types::InstalledPlugin, ApiClient, BackendEndpoint, DefaultRetryPolicy, HeaderProvider,
    KeyRing, TokenManager,
};
use km_events::{
    expand_home, BatchConfig, BatchPipeline, CorrelationId, HttpBatchSink, ResolvedConfig,
};
use km_monitor::{ChildSpec, MonitorConfig, MonitorSession};
use km_plugins::{Discovery, HostConfig, Installer, PluginHost, Registry};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_API_URL: &str = "https://api.kilometers.ai";
const DEFAULT_PLUGIN_DIR: &str = "~/.km/plugins";

#[derive(Parser)]
#[command(name = "km", version, about = "Wiretap for MCP servers")]
struct Cli {
    /// Verbose diagnostics on stderr.
    #[arg(long, global = true, env = "KM_DEBUG")]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn an MCP server and monitor its traffic; exits with the
    /// server's exit code.
    Monitor {
        /// The server command line, e.g. `km monitor -- npx my-server`.
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Manage observer plugins.
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
}

#[derive(Subcommand)]
enum PluginCommands {
    /// List installed plugins.
    List,
    /// Install a plugin from the backend catalog.
    Install { name: String },
    /// Update an installed plugin when a newer build is available.
    Update { name: String },
    /// Remove an installed plugin.
    Uninstall { name: String },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let config = resolve_config(cli.debug);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime");
    let code = runtime.block_on(async {
        let result = match cli.command {
            Commands::Monitor { command } => run_monitor(config, command).await,
            Commands::Plugins { command } => run_plugins(config, command).await,
        };
        match result {
            Ok(code) => code,
            Err(err) => {
                eprintln!("km: {err:#}");
                2
            }
        }
    });
    drop(runtime);
    std::process::exit(code);
}

fn init_tracing(debug: bool) {
    let default = if debug { "km=debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("KM_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Environment → immutable config record. Discovery stays here in the
/// binary; the libraries only ever see the resolved values.
fn resolve_config(debug: bool) -> ResolvedConfig {
    let api_key = std::env::var("KM_API_KEY").unwrap_or_default();
    let api_url = match std::env::var("KM_API_URL") {
        Ok(url) if !url.is_empty() => url,
        _ if !api_key.is_empty() => DEFAULT_API_URL.to_string(),
        _ => String::new(),
    };
    let plugin_dir =
        std::env::var("KM_PLUGIN_DIR").unwrap_or_else(|_| DEFAULT_PLUGIN_DIR.to_string());

    ResolvedConfig {
        api_url,
        api_key,
        plugin_dirs: vec![expand_home(&plugin_dir)],
        debug,
        strict_signatures: !debug,
        ..Default::default()
    }
}

/// Backend-facing handles, absent entirely in anonymous mode.
struct Backend {
    tokens: Arc<TokenManager>,
    api: Arc<ApiClient>,
}

fn connect_backend(config: &ResolvedConfig) -> anyhow::Result<Option<Backend>> {
    if !config.backend_enabled() {
        return Ok(None);
    }
    let endpoint = BackendEndpoint::new(&config.api_url, &config.user_agent);
    let tokens = Arc::new(
        TokenManager::new(endpoint.clone(), &config.api_key).context("building token manager")?,
    );
    let api = Arc::new(
        ApiClient::new(
            endpoint,
            Arc::clone(&tokens) as Arc<dyn HeaderProvider>,
            Arc::new(DefaultRetryPolicy::with_max_attempts(config.max_retries)),
            config.http_timeout,
        )
        .context("building API client")?,
    );
    Ok(Some(Backend { tokens, api }))
}

async fn run_monitor(config: ResolvedConfig, command: Vec<String>) -> anyhow::Result<i32> {
    config.validate().context("invalid configuration")?;
    let Some((program, args)) = command.split_first() else {
        bail!("no server command given");
    };

    let correlation_id = CorrelationId::generate();
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let session = MonitorSession::new(
        MonitorConfig {
            debug: config.debug,
            ..Default::default()
        },
        correlation_id.clone(),
    );

    let backend = connect_backend(&config)?;

    // Egress pipeline, fed off the fan-out; silently absent without a
    // backend so no network traffic is ever attempted.
    let pipeline = backend.as_ref().map(|backend| {
        let sink = Arc::new(HttpBatchSink::new(Arc::clone(&backend.api)));
        let pipeline = BatchPipeline::spawn(
            BatchConfig {
                batch_size: config.batch_size,
                flush_interval: config.flush_interval,
                debug: config.debug,
                ..Default::default()
            },
            sink,
            correlation_id.clone(),
            env!("CARGO_PKG_VERSION").to_string(),
            cancel.clone(),
        );
        let handle = pipeline.handle();
        let mut stream = session.fanout().subscribe("egress");
        tokio::spawn(async move {
            while let Some(msg) = stream.recv().await {
                handle.submit(msg);
            }
        });
        pipeline
    });

    // Plugin runtime: authorized loading against the backend, Free-tier
    // loading without one.
    let host = Arc::new(PluginHost::new(
        HostConfig {
            debug: config.debug,
            strict_signatures: config.strict_signatures,
            auth_refresh_interval: config.auth_refresh_interval,
            ..Default::default()
        },
        KeyRing::embedded(),
        backend.as_ref().map(|b| Arc::clone(&b.tokens)),
        backend.as_ref().map(|b| Arc::clone(&b.api)),
    ));
    let discovery = Discovery::new(config.plugin_dirs.clone());
    extract_packaged_plugins(&discovery, &config);
    match discovery.discover() {
        Ok(discovered) => {
            host.load_all(discovered).await;
        }
        Err(err) => tracing::warn!(error = %err, "plugin discovery failed"),
    }
    {
        let mut stream = session.fanout().subscribe("plugins");
        let host = Arc::clone(&host);
        tokio::spawn(async move {
            while let Some(msg) = stream.recv().await {
                host.forward(&msg).await;
            }
        });
    }
    let maintenance = {
        let host = Arc::clone(&host);
        let discovery = Discovery::new(config.plugin_dirs.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move { host.run_maintenance(discovery, cancel).await })
    };

    // Periodic observability-loss report, debug mode only.
    if config.debug {
        let host = Arc::clone(&host);
        let pipeline_stats = pipeline.as_ref().map(|p| p.handle());
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Some(handle) = &pipeline_stats {
                            eprintln!("[API] egress: {}", handle.stats().summary());
                        }
                        for (name, dropped) in host.drop_counts().await {
                            if dropped > 0 {
                                eprintln!("[PluginManager] `{name}` dropped {dropped} observation(s)");
                            }
                        }
                    }
                }
            }
        });
    }

    let spec = ChildSpec::new(program.clone(), args.to_vec());
    let code = session.run(&spec, cancel.clone()).await?;

    // Shutdown: quiesce observers, drain egress, kill plugins — all
    // bounded.
    cancel.cancel();
    drop(session);
    if let Some(pipeline) = pipeline {
        let _ = tokio::time::timeout(config.flush_interval.max(std::time::Duration::from_secs(10)), pipeline.join())
            .await;
    }
    host.shutdown().await;
    maintenance.abort();

    Ok(code)
}

async fn run_plugins(config: ResolvedConfig, command: PluginCommands) -> anyhow::Result<i32> {
    config.validate().context("invalid configuration")?;
    let registry = Arc::new(Registry::open(Registry::default_path()));
    let plugin_dir = config
        .plugin_dirs
        .first()
        .cloned()
        .context("no plugin directory configured")?;

    match command {
        PluginCommands::List => {
            let discovery = Discovery::new(config.plugin_dirs.clone());
            let discovered = discovery.discover()?;
            if discovered.is_empty() {
                println!("no plugins installed");
            }
            for plugin in discovered {
                println!(
                    "{}\t{}\t{}\t{}",
                    plugin.name,
                    plugin.version,
                    plugin.required_tier,
                    plugin.path.display()
                );
            }
            Ok(0)
        }
        PluginCommands::Install { name } => {
            let installer = installer(&config, plugin_dir, registry)?;
            let entries = installer.fetch_manifest(&installed_list(&config)?).await?;
            let path = installer
                .install(&name, &entries, &mut progress_meter(&name))
                .await?;
            println!("installed {name} -> {}", path.display());
            Ok(0)
        }
        PluginCommands::Update { name } => {
            let installer = installer(&config, plugin_dir, registry)?;
            let entries = installer.fetch_manifest(&installed_list(&config)?).await?;
            match installer
                .update(&name, &entries, &mut progress_meter(&name))
                .await?
            {
                km_plugins::UpdateOutcome::AlreadyCurrent => {
                    println!("{name} is already current");
                }
                km_plugins::UpdateOutcome::Updated { from, to } => {
                    println!("updated {name}: {from} -> {to}");
                }
            }
            Ok(0)
        }
        PluginCommands::Uninstall { name } => {
            let installer = installer(&config, plugin_dir, registry)?;
            installer.uninstall(&name)?;
            println!("uninstalled {name}");
            Ok(0)
        }
    }
}

fn installer(
    config: &ResolvedConfig,
    plugin_dir: std::path::PathBuf,
    registry: Arc<Registry>,
) -> anyhow::Result<Installer> {
    let backend = connect_backend(config)?
        .context("plugin management needs KM_API_KEY / KM_API_URL configured")?;
    Ok(Installer::new(
        backend.api,
        KeyRing::embedded(),
        plugin_dir,
        registry,
        config.download_timeout,
        env!("CARGO_PKG_VERSION"),
        &config.api_key,
    ))
}

/// Packaged `.kmpkg` plugins are unpacked in place so discovery picks up
/// their binaries like any other install.
fn extract_packaged_plugins(discovery: &Discovery, config: &ResolvedConfig) {
    let Some(plugin_dir) = config.plugin_dirs.first() else {
        return;
    };
    let packages = match discovery.discover_packages() {
        Ok(packages) => packages,
        Err(err) => {
            tracing::warn!(error = %err, "package discovery failed");
            return;
        }
    };
    for package in packages {
        let target = plugin_dir.join(format!(
            "{}{}",
            km_plugins::PLUGIN_PREFIX,
            package.metadata.name
        ));
        if target.exists() {
            continue;
        }
        match km_plugins::package::extract_package(&package.path, plugin_dir) {
            Ok(path) => tracing::debug!(path = %path.display(), "extracted packaged plugin"),
            Err(err) => {
                tracing::warn!(
                    package = %package.path.display(),
                    error = %err,
                    "failed to extract packaged plugin"
                );
            }
        }
    }
}

fn installed_list(config: &ResolvedConfig) -> anyhow::Result<Vec<InstalledPlugin>> {
    let discovery = Discovery::new(config.plugin_dirs.clone());
    Ok(discovery
        .discover()?
        .into_iter()
        .map(|plugin| InstalledPlugin {
            name: plugin.name,
            installed_version: plugin.version,
        })
        .collect())
}

fn progress_meter(name: &str) -> impl FnMut(u64, Option<u64>) + '_ {
    move |so_far, total| match total {
        Some(total) if total > 0 => {
            eprint!("\rdownloading {name}: {so_far}/{total} bytes");
            if so_far >= total {
                eprintln!();
            }
        }
        _ => {}
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(term) => term,
                    Err(_) => return,
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::debug!("shutdown signal received");
        cancel.cancel();
    });
}
