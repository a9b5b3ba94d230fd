use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use turnstile_core::{config, SystemClock, TierLimits, TierTable};
use turnstile_server::admission::{
    AdmissionGate, ApiKeyAuthenticator, Authenticator, BucketStore, FailurePolicy, GateConfig,
    IdentityClassifier, JwtAuthenticator, MemoryStore, NoAuthenticator, RedisStore,
    RedisStoreConfig,
};
use turnstile_server::api::create_router;
use turnstile_server::api::handlers::AppState;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StoreKind {
    /// Shared Redis server (multi-instance deployments)
    Redis,
    /// Process-local map (single instance only)
    Memory,
}

#[derive(Parser)]
#[command(name = "turnstile", about = "Token bucket admission controller")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Bucket store backend
    #[arg(long, value_enum, default_value = "redis")]
    store: StoreKind,

    /// Redis host
    #[arg(long, env = "REDIS_HOST", default_value = config::DEFAULT_REDIS_HOST)]
    redis_host: String,

    /// Redis port
    #[arg(long, env = "REDIS_PORT", default_value_t = config::DEFAULT_REDIS_PORT)]
    redis_port: u16,

    /// Prefix for bucket keys in the store
    #[arg(long, default_value = config::DEFAULT_KEY_PREFIX)]
    key_prefix: String,

    /// Expire idle buckets after this many seconds (0 = never)
    #[arg(long, default_value_t = 0)]
    key_ttl_secs: u64,

    /// Burst capacity for anonymous clients
    #[arg(long, default_value_t = config::ANONYMOUS_CAPACITY)]
    anonymous_capacity: u32,

    /// Burst capacity for authenticated clients
    #[arg(long, default_value_t = config::AUTHENTICATED_CAPACITY)]
    authenticated_capacity: u32,

    /// Time for an empty bucket to refill completely, in milliseconds
    #[arg(long, default_value_t = config::REFILL_WINDOW_MS)]
    refill_window_ms: u64,

    /// Behaviour when the bucket store is unreachable
    #[arg(long, value_enum, default_value = "open")]
    failure_policy: FailurePolicy,

    /// Bound on each store round trip in milliseconds
    #[arg(long, default_value_t = config::DEFAULT_STORE_TIMEOUT_MS)]
    store_timeout_ms: u64,

    /// Compare-and-swap attempts per request before denying as contended
    #[arg(long, default_value_t = config::DEFAULT_MAX_CAS_ATTEMPTS)]
    max_cas_attempts: u32,

    /// Take the client address from X-Forwarded-For / X-Real-IP (only behind a trusted proxy)
    #[arg(long, default_value_t = false)]
    trust_forwarded_headers: bool,

    /// HS256 secret for verifying bearer JWTs
    #[arg(long, env = "TURNSTILE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Graceful shutdown timeout in seconds
    #[arg(long, default_value_t = config::DEFAULT_SHUTDOWN_TIMEOUT_SECS)]
    shutdown_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("turnstile_server=info".parse()?)
                .add_directive("turnstile_core=info".parse()?),
        )
        .init();

    let args = Args::parse();

    if args.port == 0 {
        eprintln!("Error: port must be > 0");
        std::process::exit(1);
    }

    let tiers = match (
        TierLimits::new(args.anonymous_capacity, args.refill_window_ms),
        TierLimits::new(args.authenticated_capacity, args.refill_window_ms),
    ) {
        (Ok(anonymous), Ok(authenticated)) => TierTable::new(anonymous, authenticated),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("Error: invalid tier limits: {}", e);
            std::process::exit(1);
        }
    };
    if tiers.authenticated.capacity() < tiers.anonymous.capacity() {
        tracing::warn!(
            anonymous = tiers.anonymous.capacity(),
            authenticated = tiers.authenticated.capacity(),
            "authenticated capacity is below anonymous capacity"
        );
    }

    let store: Arc<dyn BucketStore> = match args.store {
        StoreKind::Redis => {
            let redis_config = RedisStoreConfig {
                host: args.redis_host.clone(),
                port: args.redis_port,
                key_prefix: args.key_prefix.clone(),
                key_ttl_ms: args.key_ttl_secs.saturating_mul(1000),
            };
            tracing::info!(
                host = %redis_config.host,
                port = redis_config.port,
                "Using Redis bucket store"
            );
            Arc::new(RedisStore::new(&redis_config)?)
        }
        StoreKind::Memory => {
            tracing::warn!("Using in-memory bucket store; limits are not shared between instances");
            Arc::new(MemoryStore::new())
        }
    };

    let gate_config = GateConfig {
        tiers,
        failure_policy: args.failure_policy,
        store_timeout: Duration::from_millis(args.store_timeout_ms),
        max_cas_attempts: args.max_cas_attempts,
        ..GateConfig::default()
    };
    let gate = match AdmissionGate::new(store.clone(), Arc::new(SystemClock), gate_config) {
        Ok(gate) => gate,
        Err(e) => {
            eprintln!("Error: invalid admission settings: {}", e);
            std::process::exit(1);
        }
    };
    if args.failure_policy == FailurePolicy::Open {
        tracing::info!("Failure policy: open (requests are admitted while the store is unreachable)");
    } else {
        tracing::info!("Failure policy: closed (requests are denied while the store is unreachable)");
    }

    if let Err(e) = store.ping().await {
        tracing::warn!("Bucket store not reachable at startup: {}", e);
    }

    let classifier = IdentityClassifier::new(build_authenticator(&args), args.trust_forwarded_headers);

    let prometheus_handle =
        metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder()?;

    let state = AppState {
        gate: Arc::new(gate),
        classifier,
        prometheus_handle,
        start_time: Instant::now(),
    };

    let app = create_router(state);
    let addr = format!("0.0.0.0:{}", args.port);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        anonymous_capacity = args.anonymous_capacity,
        authenticated_capacity = args.authenticated_capacity,
        refill_window_ms = args.refill_window_ms,
        store_timeout_ms = args.store_timeout_ms,
        "turnstile ready"
    );

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    let (signal_tx, signal_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = signal_tx.send(true);
    });

    let mut drain_rx = signal_rx.clone();
    let server = async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = drain_rx.wait_for(|stop| *stop).await;
        })
        .await
    };

    // Drain deadline starts at the signal, not at startup.
    let shutdown_timeout = args.shutdown_timeout;
    let mut deadline_rx = signal_rx;
    let deadline = async move {
        let _ = deadline_rx.wait_for(|stop| *stop).await;
        tokio::time::sleep(Duration::from_secs(shutdown_timeout)).await;
    };

    tokio::select! {
        result = server => result?,
        _ = deadline => tracing::error!(
            "Shutdown drain timeout ({}s) exceeded, dropping remaining connections",
            shutdown_timeout
        ),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn build_authenticator(args: &Args) -> Arc<dyn Authenticator> {
    let api_keys = std::env::var("TURNSTILE_API_KEYS")
        .map(|list| ApiKeyAuthenticator::from_list(&list))
        .ok()
        .filter(|keys| !keys.is_empty());

    match (&args.jwt_secret, api_keys) {
        (Some(secret), keys) => {
            if keys.is_some() {
                tracing::warn!("Both JWT secret and API keys configured; using JWT");
            }
            tracing::info!("JWT authentication enabled for the authenticated tier");
            Arc::new(JwtAuthenticator::new(secret.as_bytes()))
        }
        (None, Some(keys)) => {
            tracing::info!("API key authentication enabled for the authenticated tier");
            Arc::new(keys)
        }
        (None, None) => {
            tracing::info!("No authenticator configured; every client is anonymous");
            Arc::new(NoAuthenticator)
        }
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    tracing::info!("Shutting down gracefully, draining in-flight requests...");
}
