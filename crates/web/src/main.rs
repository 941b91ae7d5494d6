mod handlers;

use std::{
    fs::File,
    io::BufReader,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    Router,
    extract::{ConnectInfo, FromRef},
    http::{HeaderName, Request, StatusCode, header},
};
use ghw_auth::AdminKey;
use ghw_core::{ClientAddr, config::Config};
use ghw_db::Database;
use ghw_deploy::{Deployer, command::ProcessRunner};
use ghw_github::GitHub;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    ServiceBuilderExt,
    timeout::TimeoutLayer,
    trace::{DefaultOnResponse, MakeSpan, TraceLayer},
};
use tracing::{Level, Span};
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::handlers::build_router;

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    deployer: Arc<Deployer>,
    admin_key: Arc<AdminKey>,
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config: Arc<Config> = {
        let path = std::env::var("GHW_CONFIG").unwrap_or_else(|_| "config.yml".to_string());
        let file = BufReader::new(File::open(&path).expect("Failed to open config file"));
        serde_yaml::from_reader(file).expect("Failed to parse config file")
    };
    let db = Arc::new(Database::new(&config.db).await.expect("Failed to open database"));
    let admin_key =
        Arc::new(AdminKey::load(&config.deploy.public_key).expect("Failed to load public key"));
    std::fs::create_dir_all(&config.deploy.repo_dir).expect("Failed to create repository root");

    let github = GitHub::new(&config.github).expect("Failed to create GitHub client");
    match github.current_user().await {
        Ok(login) => tracing::info!("Authenticated to GitHub as {login}"),
        Err(e) => tracing::warn!("Failed to query GitHub user: {e:#}"),
    }
    match db.get_webhooks().await {
        Ok(webhooks) => tracing::info!("{} repositories have registered webhooks", webhooks.len()),
        Err(e) => tracing::warn!("Failed to list webhooks: {e:#}"),
    }

    let deployer =
        Arc::new(Deployer::new(db.clone(), github, Arc::new(ProcessRunner), &config.deploy));
    let state = AppState { config: config.clone(), deployer, admin_key };

    // Build the router
    let port = state.config.server.port;
    let router = app(state).into_make_service_with_connect_info::<SocketAddr>();

    // Create the listener
    #[allow(unused_mut)]
    let mut listener = None;
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::{FromRawFd, IntoRawFd};
        let fds = libsystemd::activation::receive_descriptors_with_names(false)
            .expect("Failed to receive fds");
        if let Some((fd, name)) = fds.into_iter().next() {
            tracing::info!("Web server: Listening on {}", name);
            let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd.into_raw_fd()) };
            std_listener.set_nonblocking(true).expect("Failed to set non-blocking");
            listener =
                Some(TcpListener::from_std(std_listener).expect("Failed to create listener"));
        }
    }
    let listener = match listener {
        Some(listener) => listener,
        None => {
            let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
            tracing::info!("Web server: Listening on {}", addr);
            TcpListener::bind(addr).await.expect("bind error")
        }
    };

    #[cfg(target_os = "linux")]
    {
        libsystemd::daemon::notify(false, &[libsystemd::daemon::NotifyState::Ready])
            .expect("Failed to notify");
    }

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Web server error");
    if let Err(e) = result {
        tracing::error!("{e}");
    }
    tracing::info!("Web server stopped");

    #[cfg(target_os = "linux")]
    {
        libsystemd::daemon::notify(false, &[libsystemd::daemon::NotifyState::Stopping])
            .expect("Failed to notify");
    }

    db.close().await;
    tracing::info!("Shut down gracefully");
}

fn app(state: AppState) -> Router {
    let sensitive_headers: Arc<[_]> =
        vec![header::AUTHORIZATION, HeaderName::from_static("x-hub-signature-256")].into();
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let middleware = ServiceBuilder::new()
        .sensitive_request_headers(sensitive_headers.clone())
        .sensitive_response_headers(sensitive_headers)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(MyMakeSpan { level: Level::INFO })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout));
    build_router().with_state(state).layer(middleware)
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        tokio::select! {
            result = signal::ctrl_c() => result.expect("Failed to listen for ctrl-c"),
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("Failed to listen for ctrl-c")
    }
}

#[derive(Debug, Clone)]
pub struct MyMakeSpan {
    level: Level,
}

impl<B> MakeSpan<B> for MyMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let ip = ClientAddr::from_headers(request.headers())
            .or_else(|| {
                request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(socket_addr)| socket_addr.ip())
            })
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        let user_agent = request
            .headers()
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("[unknown]");
        macro_rules! make_span {
            ($level:expr) => {
                tracing::span!(
                    $level,
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    ip = %ip,
                    user_agent = %user_agent,
                )
            }
        }
        match self.level {
            Level::ERROR => make_span!(Level::ERROR),
            Level::WARN => make_span!(Level::WARN),
            Level::INFO => make_span!(Level::INFO),
            Level::DEBUG => make_span!(Level::DEBUG),
            Level::TRACE => make_span!(Level::TRACE),
        }
    }
}
