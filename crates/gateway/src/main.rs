use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mcpv_domain::config::{Config, ConfigSeverity};
use mcpv_gateway::api;
use mcpv_gateway::catalog::CatalogProvider;
use mcpv_gateway::cli::{exit_codes, Cli, Command, ConfigCommand};
use mcpv_gateway::clients::{Activation, ClientRegistry};
use mcpv_gateway::metrics::Metrics;
use mcpv_gateway::reload::ReloadManager;
use mcpv_gateway::router::{MetricRouter, Router};
use mcpv_gateway::state::AppState;
use mcpv_gateway::status::StatusHub;
use mcpv_gateway::subagent::SubAgent;
use mcpv_governance::{Executor, PluginManager};
use mcpv_index::{PromptIndex, ResourceIndex, ToolIndex};
use mcpv_runtime::conn::ConnHandlers;
use mcpv_runtime::lifecycle::RetrySettings;
use mcpv_runtime::probe::DiagnosticsProbe;
use mcpv_runtime::{Lifecycle, ListChangeHub, LogHub, MetadataCache, Scheduler, StdioLauncher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            run_server(&cli).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            if !mcpv_gateway::cli::validate(&cli.config) {
                std::process::exit(exit_codes::ERROR);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            if !mcpv_gateway::cli::show(&cli.config) {
                std::process::exit(exit_codes::ERROR);
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("mcpv {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mcpv_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "mcpv starting");

    // ── Catalog ──────────────────────────────────────────────────────
    let provider = Arc::new(
        CatalogProvider::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?,
    );
    let catalog = provider.snapshot();
    let runtime = Arc::new(catalog.catalog.runtime.clone());
    log_config_warnings(&catalog.catalog);
    tracing::info!(
        servers = catalog.summary.servers,
        disabled = catalog.summary.disabled_servers,
        plugins = catalog.summary.plugins,
        "catalog loaded"
    );

    let root = CancellationToken::new();

    // ── Observability primitives ─────────────────────────────────────
    let probe = Arc::new(DiagnosticsProbe::default());
    let metrics = Arc::new(Metrics::new());
    let logs = LogHub::default();
    let list_changes = ListChangeHub::default();
    tracing::info!("diagnostics probe + metrics + log hub ready");

    // ── Lifecycle + scheduler ────────────────────────────────────────
    let launcher = Arc::new(StdioLauncher::new(logs.clone(), runtime.proxy.clone()));
    let lifecycle = Arc::new(Lifecycle::new(
        launcher,
        list_changes.clone(),
        // Sampling/elicitation handlers are wired by embedding runtimes;
        // the daemon answers method-not-supported without them.
        ConnHandlers::default(),
        probe.clone(),
        RetrySettings::from_runtime(&runtime),
        root.child_token(),
    ));
    let scheduler = Scheduler::new(lifecycle, probe.clone(), metrics.clone(), root.clone());
    for (key, spec) in &catalog.spec_registry {
        scheduler.ensure_pool(key.clone(), spec.clone());
    }
    tracing::info!(pools = catalog.spec_registry.len(), "scheduler ready");

    // ── Router + metadata cache ──────────────────────────────────────
    let cache = Arc::new(MetadataCache::new());
    let router = Arc::new(MetricRouter::new(
        Router::new(
            scheduler.clone(),
            Duration::from_secs(runtime.route_timeout_seconds),
        ),
        metrics.clone(),
    ));
    tracing::info!(
        route_timeout_s = runtime.route_timeout_seconds,
        "router ready"
    );

    // ── Aggregation indexes ──────────────────────────────────────────
    let fetcher: Arc<dyn mcpv_index::ListFetcher> = router.clone();
    let tool_index = ToolIndex::new(
        fetcher.clone(),
        cache.clone(),
        runtime.tool_refresh_concurrency,
    );
    let resource_index = ResourceIndex::new(
        fetcher.clone(),
        cache.clone(),
        runtime.tool_refresh_concurrency,
    );
    let prompt_index = PromptIndex::new(fetcher, cache.clone(), runtime.tool_refresh_concurrency);
    update_indexes(&catalog, &tool_index, &resource_index, &prompt_index);
    tracing::info!("aggregation indexes ready");

    // ── Governance plugins ───────────────────────────────────────────
    let plugin_manager = Arc::new(PluginManager::new(PluginManager::default_socket_dir()));
    plugin_manager
        .start_all(&catalog.catalog.plugins)
        .await
        .context("starting governance plugins")?;
    let executor = Arc::new(Executor::new(plugin_manager.pipeline()));
    tracing::info!(
        plugins = plugin_manager.statuses().len(),
        "governance pipeline ready"
    );

    // ── Clients + activation ─────────────────────────────────────────
    let registry = Arc::new(ClientRegistry::new());
    let activation = Arc::new(Activation::new(scheduler.clone()));
    let status = StatusHub::new(scheduler.clone(), probe.clone());
    let reload = Arc::new(ReloadManager::new(
        scheduler.clone(),
        plugin_manager.clone(),
        executor.clone(),
        tool_index.clone(),
        resource_index.clone(),
        prompt_index.clone(),
        cache.clone(),
        registry.clone(),
        activation.clone(),
    ));
    tracing::info!("client registry + reload manager ready");

    // ── Sub-agent ────────────────────────────────────────────────────
    let subagent = runtime
        .sub_agent
        .enabled
        .then(|| Arc::new(SubAgent::new(runtime.sub_agent.clone())));
    if subagent.is_some() {
        tracing::info!(
            model = runtime.sub_agent.model.as_deref().unwrap_or(""),
            max_tools = runtime.sub_agent.max_tools_per_request,
            "sub-agent tool filter enabled"
        );
    }

    let state = AppState {
        provider: provider.clone(),
        runtime: runtime.clone(),
        scheduler: scheduler.clone(),
        cache: cache.clone(),
        probe: probe.clone(),
        tool_index: tool_index.clone(),
        resource_index: resource_index.clone(),
        prompt_index: prompt_index.clone(),
        plugin_manager: plugin_manager.clone(),
        executor,
        registry: registry.clone(),
        activation: activation.clone(),
        router,
        reload,
        metrics,
        logs,
        status: status.clone(),
        subagent,
        root: root.clone(),
    };

    // ── Bootstrap preflight ──────────────────────────────────────────
    let report = mcpv_index::bootstrap::run(
        &scheduler,
        &cache,
        &probe,
        &catalog.spec_registry,
        mcpv_index::bootstrap::BootstrapSettings {
            mode: runtime.bootstrap_mode,
            concurrency: runtime.bootstrap_concurrency,
            timeout: Duration::from_secs(runtime.bootstrap_timeout_seconds),
        },
    )
    .await;
    if report.succeeded > 0 {
        tool_index.rebuild_and_publish();
        resource_index.rebuild_and_publish();
        prompt_index.rebuild_and_publish();
    }

    // ── Initial activation (warms always-on pools) ───────────────────
    activation.recompute(&catalog, &registry, "startup").await;

    // ── Background loops ─────────────────────────────────────────────
    tokio::spawn(scheduler.clone().run_maintenance_loop());
    tokio::spawn(
        scheduler
            .clone()
            .run_ping_loop(Duration::from_secs(runtime.ping_interval_seconds)),
    );
    let refresh_period = Duration::from_secs(runtime.tool_refresh_seconds);
    tokio::spawn(tool_index.clone().run_loop(
        refresh_period,
        list_changes.subscribe(),
        root.child_token(),
    ));
    tokio::spawn(resource_index.clone().run_loop(
        refresh_period,
        list_changes.subscribe(),
        root.child_token(),
    ));
    tokio::spawn(prompt_index.clone().run_loop(
        refresh_period,
        list_changes.subscribe(),
        root.child_token(),
    ));
    tokio::spawn(status.run(root.child_token()));
    {
        // Client reaper: evict dead clients, then re-derive activation.
        let state = state.clone();
        let period = Duration::from_secs(runtime.client_check_seconds.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        mcpv_gateway::control::reap_clients(&state).await;
                    }
                    _ = state.root.cancelled() => return,
                }
            }
        });
    }
    tracing::info!("background loops started");

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = runtime.rpc.listen_address.clone();
    if addr.starts_with("unix:") {
        anyhow::bail!(
            "unix listen addresses are not supported by this build; \
             configure rpc.listenAddress as host:port"
        );
    }
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "mcpv listening");

    let app = api::router(state)
        .layer(tower::limit::ConcurrencyLimitLayer::new(256))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let shutdown_root = root.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_root.cancel();
        })
        .await
        .context("axum server error")?;

    // ── Drain + stop ─────────────────────────────────────────────────
    tracing::info!("shutting down: draining pools and stopping plugins");
    scheduler.shutdown("shutdown").await;
    plugin_manager.stop_all().await;
    tracing::info!("mcpv stopped");
    Ok(())
}

fn update_indexes(
    catalog: &Arc<mcpv_gateway::catalog::CatalogState>,
    tools: &Arc<ToolIndex>,
    resources: &Arc<ResourceIndex>,
    prompts: &Arc<PromptIndex>,
) {
    let specs: std::collections::HashMap<_, _> = catalog
        .spec_registry
        .iter()
        .map(|(k, s)| (k.clone(), s.clone()))
        .collect();
    let ns = catalog.catalog.runtime.tool_namespace_strategy;
    let expose = catalog.catalog.runtime.expose_tools.clone();
    tools.update_specs(specs.clone(), ns, expose.clone());
    resources.update_specs(specs.clone(), ns, expose.clone());
    prompts.update_specs(specs, ns, expose);
}

fn log_config_warnings(config: &Config) {
    for issue in config.validate() {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            // Errors already failed the load; this arm is unreachable in
            // practice but keeps the match total.
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
