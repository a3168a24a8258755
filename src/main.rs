use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::*;

use synctarget_export_controller::controllers::{synctargetexports, ControllerConfig};
use synctarget_export_controller::telemetry::{self, LogFormat};
use synctarget_export_controller::{Error, Metrics, State};

#[derive(Debug, clap::Parser)]
struct Arguments {
    /// Number of SyncTargets reconciled concurrently
    #[arg(long, env = "SYNCTARGET_EXPORT_WORKERS", default_value_t = 2)]
    workers: usize,

    /// Upper bound for a single status patch call
    #[arg(long, env = "SYNCTARGET_EXPORT_PATCH_TIMEOUT_SECONDS", default_value_t = 30)]
    patch_timeout_seconds: u64,

    /// Delay before the first retry of a failing SyncTarget
    #[arg(long, env = "SYNCTARGET_EXPORT_BACKOFF_BASE_MILLIS", default_value_t = 5)]
    backoff_base_millis: u64,

    /// Cap on the retry delay of a failing SyncTarget
    #[arg(long, env = "SYNCTARGET_EXPORT_BACKOFF_MAX_SECONDS", default_value_t = 1000)]
    backoff_max_seconds: u64,

    /// Address serving /metrics, /health and diagnostics
    #[arg(long, env = "SYNCTARGET_EXPORT_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    bind_address: String,

    #[arg(long, env = "SYNCTARGET_EXPORT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
}

impl Arguments {
    fn controller_config(&self) -> Result<ControllerConfig, Error> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig("--workers must be at least 1".into()));
        }
        let config = ControllerConfig {
            workers: self.workers,
            patch_timeout: Duration::from_secs(self.patch_timeout_seconds),
            backoff_base: Duration::from_millis(self.backoff_base_millis),
            backoff_max: Duration::from_secs(self.backoff_max_seconds),
        };
        if config.backoff_base > config.backoff_max {
            return Err(Error::InvalidConfig(
                "--backoff-base-millis exceeds --backoff-max-seconds".into(),
            ));
        }
        Ok(config)
    }
}

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(()) => HttpResponse::Ok().body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

/// Cancels `token` on Ctrl-C or SIGTERM
async fn shutdown_on_signal(token: CancellationToken) {
    let terminate = async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(err) => {
                    warn!("Cannot listen for SIGTERM: {err}");
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
        _ = token.cancelled() => return,
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Arguments::parse();
    telemetry::init(args.log_format)?;
    let config = args.controller_config()?;

    let state = State::default();
    let controller_metrics = Metrics::default().register(&state.registry)?;

    let (client, watch_client) = synctargetexports::clients(kube::Config::infer().await?)?;

    let token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(token.clone()));

    let controller = {
        let (state, token) = (state.clone(), token.clone());
        async move {
            let res = synctargetexports::run(
                client,
                watch_client,
                controller_metrics,
                state,
                config,
                token.clone(),
            )
            .await;
            // stop the web server as well when the controller gives up
            token.cancel();
            res
        }
    };

    // Start web server
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(index)
            .service(health)
            .service(metrics)
    })
    .bind(&args.bind_address)?
    .shutdown_timeout(5)
    .disable_signals()
    .run();

    let server_handle = server.handle();
    tokio::spawn(async move {
        token.cancelled().await;
        server_handle.stop(true).await;
    });

    let (controller, server) = tokio::join!(controller, server);
    server?;
    controller?;
    Ok(())
}
