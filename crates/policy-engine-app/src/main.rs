//! `policy-engine` binary: CLI flags, process wiring, admin server.
//! One `main` that wires config -> registries -> servers.

mod admin;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use policy_engine::config::watch::ReloadWatcher;
use policy_engine::config::{ConfigLoader, ConfigSource};
use policy_engine::policy::registry::PolicyRegistry;
use policy_engine::route::RouteRegistry;
use policy_engine::telemetry::{self, LogFormat};
use tonic::transport::Server;

#[derive(Parser, Debug)]
#[command(name = "policy-engine", version)]
struct Args {
	/// Path to the route->chain configuration document (YAML or JSON).
	#[arg(long)]
	config: PathBuf,

	/// Address the ext_proc gRPC server binds to.
	#[arg(long)]
	listen: SocketAddr,

	/// Address the admin/health/metrics HTTP server binds to. Disabled if
	/// omitted.
	#[arg(long)]
	admin_addr: Option<SocketAddr>,

	/// `tracing_subscriber::EnvFilter` directive string.
	#[arg(long, default_value = "info")]
	log_level: String,

	/// Log formatter.
	#[arg(long, default_value = "console")]
	log_format: LogFormat,
}

fn main() {
	let args = Args::parse();
	telemetry::init_logging(&args.log_level, args.log_format);

	let exit_code = match run(args) {
		Ok(()) => 0,
		Err(e) => {
			tracing::error!(error = %e, "fatal error");
			e.exit_code()
		}
	};
	std::process::exit(exit_code);
}

#[derive(Debug, thiserror::Error)]
enum AppError {
	#[error("config error: {0}")]
	Config(#[from] policy_engine::config::Error),
	#[error("transport error: {0}")]
	Transport(#[from] tonic::transport::Error),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

impl AppError {
	/// §6.1: `1` config error, `2` transport bind error.
	fn exit_code(&self) -> i32 {
		match self {
			AppError::Config(_) => 1,
			AppError::Transport(_) | AppError::Io(_) => 2,
		}
	}
}

#[tokio::main]
async fn run(args: Args) -> Result<(), AppError> {
	// Concrete policy bodies are out of scope for this repository; a real
	// deployment registers its policy factories here before the first load.
	let registry = Arc::new(PolicyRegistry::new());
	let loader = ConfigLoader::new(registry);
	let routes = Arc::new(RouteRegistry::new());
	let mut registry_metrics = prometheus_client::registry::Registry::default();
	let metrics = Arc::new(telemetry::Metrics::new(&mut registry_metrics));
	let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));

	let source = ConfigSource::File(args.config.clone());
	let config = loader.load(&source).await?;
	routes.replace(config.routes);
	ready.store(true, std::sync::atomic::Ordering::SeqCst);
	tracing::info!(routes = routes.len(), "config applied");

	let registry_metrics = Arc::new(registry_metrics);
	let admin = args.admin_addr.map(|addr| {
		let routes = routes.clone();
		let ready = ready.clone();
		let registry_metrics = registry_metrics.clone();
		tokio::spawn(async move {
			if let Err(e) = admin::serve(addr, routes, registry_metrics, ready).await {
				tracing::error!(error = %e, "admin server exited");
			}
		})
	});

	let reload_loop = tokio::spawn(reload_loop(args.config.clone(), loader, routes.clone(), ready.clone(), metrics.clone()));

	let handler = policy_engine::Handler::new(routes, metrics);
	tracing::info!(addr = %args.listen, "ext_proc server listening");
	Server::builder()
		.add_service(policy_proto::external_processor_server::ExternalProcessorServer::new(handler))
		.serve(args.listen)
		.await?;

	reload_loop.abort();
	if let Some(admin) = admin {
		admin.abort();
	}
	Ok(())
}

/// Reapplies the config document on SIGHUP or a debounced file-watch event
/// (§4.11). Reload failures are logged and leave the previously published
/// chains in place -- a bad edit never tears down a running engine.
async fn reload_loop(
	path: PathBuf,
	loader: ConfigLoader,
	routes: Arc<RouteRegistry>,
	ready: Arc<std::sync::atomic::AtomicBool>,
	metrics: Arc<telemetry::Metrics>,
) {
	let mut watcher = match ReloadWatcher::watch(&path) {
		Ok(w) => Some(w),
		Err(e) => {
			tracing::warn!(error = %e, "failed to start config file watcher; SIGHUP-only reload");
			None
		}
	};
	let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
		Ok(s) => s,
		Err(e) => {
			tracing::warn!(error = %e, "failed to install SIGHUP handler");
			return;
		}
	};

	loop {
		let triggered = match &mut watcher {
			Some(w) => {
				tokio::select! {
					_ = sighup.recv() => true,
					maybe = w.reloads.recv() => maybe.is_some(),
				}
			}
			None => {
				sighup.recv().await;
				true
			}
		};
		if !triggered {
			continue;
		}

		let source = ConfigSource::File(path.clone());
		match loader.load(&source).await {
			Ok(config) => {
				let applied = config.routes.len();
				routes.replace(config.routes);
				ready.store(true, std::sync::atomic::Ordering::SeqCst);
				metrics
					.config_reloads
					.get_or_create(&policy_engine::telemetry::metrics::ReloadLabels { outcome: "success" })
					.inc();
				tracing::info!(routes = applied, "config reloaded");
			}
			Err(e) => {
				metrics
					.config_reloads
					.get_or_create(&policy_engine::telemetry::metrics::ReloadLabels { outcome: "failure" })
					.inc();
				tracing::warn!(error = %e, "config reload failed; keeping previous chains");
			}
		}
	}
}
