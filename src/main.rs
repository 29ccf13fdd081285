use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use switchyard::cli::{Cli, Command, ConfigCommand, StartArgs};
use switchyard::config::{state_dir, Settings};
use switchyard::events::keepalive::KeepAliveMonitor;
use switchyard::events::EventBroker;
use switchyard::logging::{init_logging, LogConfig};
use switchyard::oauth::approval::{ApprovalPort, ApprovalRequest};
use switchyard::oauth::store::JsonFileStorage;
use switchyard::oauth::AuthServer;
use switchyard::plugins::discovery::DirectoryDiscovery;
use switchyard::plugins::transport::{
    BroadcastTransport, MessageTransport, PointToPointTransport,
};
use switchyard::plugins::PluginRegistry;
use switchyard::router::{Router, RouterConfig};
use switchyard::server::{serve, GatewayContext};
use switchyard::trust::{OriginPolicy, TrustManager};

/// How often the manifest directory is rescanned for plugin changes.
const DISCOVERY_RESCAN_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand launches the server with default options.
        None => run_server(StartArgs::default()).await,
        Some(Command::Start(args)) => run_server(args).await,

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => switchyard::cli::handle_config_show()?,
                ConfigCommand::Path => switchyard::cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Version) => {
            switchyard::cli::handle_version();
            Ok(())
        }
    }
}

async fn run_server(args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut log_config = if std::env::var("SWITCHYARD_ENV").as_deref() == Ok("production") {
        LogConfig::production()
    } else {
        LogConfig::development()
    };
    if let Some(format) = args.log_format {
        log_config.format = format.into();
    }
    if let Some(directives) = args.log_level {
        log_config.filter = Some(directives);
    }
    init_logging(log_config)?;

    let mut settings = Settings::load_with(args.config.as_deref())?;
    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    std::fs::create_dir_all(state_dir())?;
    std::fs::create_dir_all(settings.manifest_dir())?;

    let point_to_point: Arc<dyn MessageTransport> = Arc::new(PointToPointTransport::new());
    let broadcast: Arc<dyn MessageTransport> = Arc::new(BroadcastTransport::new());
    let registry = Arc::new(PluginRegistry::new(point_to_point, broadcast));

    let discovery = DirectoryDiscovery::new(settings.manifest_dir());
    registry.scan(&discovery).await;
    for plugin in registry.list() {
        if let Err(e) = registry.connect(&plugin.id) {
            warn!(target: "plugins", plugin_id = %plugin.id, error = %e, "initial connect failed");
        }
    }
    spawn_rescan_task(Arc::clone(&registry), discovery);

    let storage = JsonFileStorage::new(settings.token_store_path());
    let auth = Arc::new(AuthServer::new(
        Box::new(storage),
        settings.debug_wildcard_scope,
    ));
    if settings.auto_approve {
        install_auto_approval(&auth);
    }

    let trust = Arc::new(TrustManager::new(OriginPolicy {
        require_origin: settings.require_origin,
        restrict_origins: settings.restrict_origins,
    }));
    for origin in &settings.allowed_origins {
        trust.allow_origin(origin);
    }

    let keepalive = if settings.keepalive_enabled {
        let monitor = Arc::new(KeepAliveMonitor::new(settings.keepalive_interval()));
        Arc::clone(&monitor).start(Arc::clone(&registry));
        Some(monitor)
    } else {
        None
    };
    let broker = Arc::new(EventBroker::new(keepalive.clone()));

    let router = Arc::new(Router::new(
        RouterConfig {
            product: settings.product.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: settings.request_timeout(),
            local_oauth: settings.local_oauth,
            locale: settings.locale.clone(),
        },
        Arc::clone(&registry),
        Arc::clone(&auth),
        Arc::clone(&trust),
        Arc::clone(&broker),
        keepalive,
    ));

    let context = GatewayContext::new(router, registry, auth, trust, broker);
    let addr = settings.bind_addr()?;
    info!(
        target: "gateway",
        %addr,
        plugins = context.registry.list().len(),
        "switchyard starting"
    );
    serve(context, addr).await?;
    Ok(())
}

/// Periodic manifest-directory rescan so installed or removed plugins are
/// picked up without a restart.
fn spawn_rescan_task(registry: Arc<PluginRegistry>, discovery: DirectoryDiscovery) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(DISCOVERY_RESCAN_SECS));
        interval.tick().await;
        loop {
            interval.tick().await;
            let known = registry.list().len();
            registry.scan(&discovery).await;
            for plugin in registry.list() {
                if plugin.state == switchyard::plugins::ConnectionState::Discovered {
                    let _ = registry.connect(&plugin.id);
                }
            }
            let now = registry.list().len();
            if now != known {
                info!(target: "plugins", plugins = now, "plugin set changed on rescan");
            }
        }
    });
}

/// Headless approval port: every queued grant resolves as approved.
fn install_auto_approval(auth: &Arc<AuthServer>) {
    struct AutoApprove(tokio::sync::mpsc::UnboundedSender<u64>);
    impl ApprovalPort for AutoApprove {
        fn show(&self, request: &ApprovalRequest) {
            let _ = self.0.send(request.request_id);
        }
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    auth.approval_queue().set_port(Arc::new(AutoApprove(tx)));
    let auth = Arc::clone(auth);
    tokio::spawn(async move {
        while let Some(request_id) = rx.recv().await {
            auth.resolve_approval(request_id, true);
        }
    });
}
