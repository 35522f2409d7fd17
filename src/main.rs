/*!
 * servcore - Application server concurrency core
 *
 * Binary entry point exposing server-lifecycle subcommands: `serve`
 * (start the connection pool, scheduler, and registries from a config
 * file), `proxy-child` (the worker-subprocess child main loop, meant to
 * be invoked by the proxy pool's own `exec`, not by a human), and
 * `config check` (validate a config file and print the resolved option
 * groups).
 */

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{ContentArrangement, Table};

use servcore::config::ServerConfig;
use servcore::core::cache::CacheRegistry;
use servcore::core::conn_pool::{ConnHandler, ConnPool, ConnRecord};
use servcore::core::handle_pool::{DbDriver, HandlePoolRegistry};
use servcore::core::interp_pool::{InterpPoolRegistry, ScriptEngine};
use servcore::core::proxy_pool::{self, ProxyPoolRegistry};
use servcore::core::scheduler::Scheduler;
use servcore::core::task_queue::TaskQueue;

#[derive(Parser)]
#[command(name = "servcore", version, about = "Multi-threaded application server concurrency core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the connection pool, scheduler, and subsystem registries
    Serve {
        /// Path to a servcore.toml config file (falls back to
        /// ./servcore.toml, then ~/.servcore/servcore.toml, then
        /// built-in defaults)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run as a worker-subprocess child (invoked by the proxy pool, not
    /// by a human operator)
    ProxyChild {
        /// Script to evaluate once at startup before entering the
        /// request loop
        #[arg(long)]
        init: Option<String>,
    },
    /// Configuration inspection
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate a config file and print the resolved option groups
    Check {
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => cmd_serve(config),
        Commands::ProxyChild { init } => {
            // Never returns.
            proxy_pool::child_main::<EchoScriptEngine>(init.as_deref());
        }
        Commands::Config { action } => match action {
            ConfigAction::Check { path } => cmd_config_check(path),
        },
    }
}

fn load_config(path: Option<PathBuf>) -> Result<ServerConfig> {
    match path {
        Some(p) => ServerConfig::load(&p).with_context(|| format!("loading config from {:?}", p)),
        None => Ok(ServerConfig::load_with_fallback()),
    }
}

fn cmd_config_check(path: Option<PathBuf>) -> Result<()> {
    let config = load_config(path)?;

    let mut table = Table::new();
    table
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Group", "Option", "Value"]);

    table.add_row(vec!["conn_pool", "min_threads", &config.conn_pool.min_threads.to_string()]);
    table.add_row(vec!["conn_pool", "max_threads", &config.conn_pool.max_threads.to_string()]);
    table.add_row(vec!["conn_pool", "max_conns", &config.conn_pool.max_conns.to_string()]);
    table.add_row(vec![
        "conn_pool",
        "thread_idle_timeout_secs",
        &config.conn_pool.thread_idle_timeout_secs.to_string(),
    ]);
    table.add_row(vec![
        "conn_pool",
        "max_consecutive_drops",
        &config.conn_pool.max_consecutive_drops.to_string(),
    ]);
    table.add_row(vec![
        "scheduler",
        "max_elapsed_warning_secs",
        &config.scheduler.max_elapsed_warning_secs.to_string(),
    ]);
    table.add_row(vec!["cache", "max_size", &config.cache.max_size.to_string()]);
    table.add_row(vec![
        "cache",
        "ttl_secs",
        &config
            .cache
            .ttl_secs
            .map(|t| t.to_string())
            .unwrap_or_else(|| "none".to_string()),
    ]);
    for (name, pool) in &config.proxy_pools {
        table.add_row(vec!["proxy_pool", name, &format!("max={}", pool.max)]);
    }
    for (name, pool) in &config.handle_pools {
        table.add_row(vec![
            "handle_pool",
            name,
            &format!("connections={}", pool.connections),
        ]);
    }
    table.add_row(vec!["log", "level", &format!("{:?}", config.log_level)]);

    println!("{table}");
    println!("config OK");
    Ok(())
}

/// Placeholder script engine used to wire up `serve`/`proxy-child`. A
/// real embedded language is out of the core's scope (§1); this engine
/// only echoes the script text back as its result so the connection
/// pool and proxy pool have something concrete to exercise end to end.
struct EchoScriptEngine {
    last: String,
}

impl ScriptEngine for EchoScriptEngine {
    fn create() -> Self {
        EchoScriptEngine { last: String::new() }
    }

    fn eval_init(&mut self, script: &str) -> std::result::Result<(), String> {
        self.last = script.to_string();
        Ok(())
    }

    fn eval(&mut self, script: &str) -> std::result::Result<String, String> {
        self.last = script.to_string();
        Ok(script.to_string())
    }

    fn reset(&mut self) {
        self.last.clear();
    }
}

/// Placeholder SQL driver used to wire up `serve`'s handle-pool
/// registry. A real driver connects to an external datasource; this
/// one only tracks whether it is "open".
struct NullDriver {
    open: bool,
}

impl DbDriver for NullDriver {
    fn connect(
        _datasource: &str,
        _user: Option<&str>,
        _password: Option<&str>,
    ) -> servcore::Result<Self> {
        Ok(NullDriver { open: true })
    }
    fn disconnect(&mut self) {
        self.open = false;
    }
    fn reset(&mut self) {}
}

/// Placeholder connection handler: evaluates an interpreter's default
/// init script against an `EchoScriptEngine` per request. Stands in
/// for the out-of-scope HTTP/auth/filter pipeline.
struct EchoHandler {
    interp_pool: Arc<InterpPoolRegistry<EchoScriptEngine>>,
}

impl ConnHandler for EchoHandler {
    fn service(&self, _conn: &mut ConnRecord) {
        let pool = self.interp_pool.pool("default", "");
        if let Ok(interp) = pool.allocate() {
            pool.deallocate(interp);
        }
    }
}

fn cmd_serve(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    servcore::logging::init_logging(&config).context("initializing logging")?;

    tracing::info!("servcore starting");

    let scheduler = Scheduler::new(Duration::from_secs(config.scheduler.max_elapsed_warning_secs));

    let _cache_registry: CacheRegistry<String, Vec<u8>> = CacheRegistry::new();

    let interp_registry: Arc<InterpPoolRegistry<EchoScriptEngine>> =
        Arc::new(InterpPoolRegistry::new());

    let _proxy_registry: ProxyPoolRegistry = ProxyPoolRegistry::new();
    let handle_registry: HandlePoolRegistry<NullDriver> = HandlePoolRegistry::new();
    for (name, pool_config) in &config.handle_pools {
        let pool = handle_registry.pool(name, pool_config.clone());
        let check_interval = pool_config.check_interval();
        let pool_for_check = pool.clone();
        scheduler
            .every(check_interval, false, move || pool_for_check.check(), None)
            .ok();
    }

    let _task_queue = TaskQueue::new("servcore").context("starting I/O task queue")?;

    let terminate = Arc::new(AtomicBool::new(false));
    let terminate_for_signal = terminate.clone();

    let conn_pool = ConnPool::new(
        config.conn_pool.clone(),
        EchoHandler {
            interp_pool: interp_registry,
        },
        move || terminate_for_signal.store(true, Ordering::SeqCst),
    );

    tracing::info!("servcore ready, type 'quit' and press enter to stop");
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line.unwrap_or_default();
        if terminate.load(Ordering::SeqCst) || line.trim() == "quit" {
            break;
        }
    }

    tracing::info!("servcore stopping");
    conn_pool
        .stop(Duration::from_secs(10))
        .context("stopping connection pool")?;
    scheduler.shutdown();

    Ok(())
}
