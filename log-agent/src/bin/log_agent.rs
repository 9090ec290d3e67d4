//! Log agent - forwards application log lines to a sink with resumable offsets.
//!
//! Tails every file in the configured log directory, records per-file progress
//! in side-car files and retires fully drained files.

use anyhow::{Context, Result};
use log_agent::config::Config;
use log_agent::runner::{self, CONFIG_ENV, DEFAULT_CONFIG_PATH};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path =
        std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    if let Some(addr) = config.metrics_addr() {
        tokio::spawn(start_metrics_server(addr));
    }

    runner::run(config, Some(PathBuf::from(config_path))).await
}

fn init_tracing() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Serves the default Prometheus registry at GET /metrics until Ctrl-C.
async fn start_metrics_server(addr: SocketAddr) {
    use http_body_util::Full;
    use hyper::body::Bytes;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use prometheus::Encoder;
    use tokio::net::TcpListener;

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%addr, error = %err, "failed to bind metrics server");
            return;
        }
    };

    info!(%addr, "prometheus metrics server listening");

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    tokio::pin!(shutdown_signal);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_signal => {
                info!("metrics server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, _) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to accept metrics connection");
                        continue;
                    }
                };

                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                        let mut response = Response::new(Full::new(Bytes::new()));
                        if req.uri().path() != "/metrics" {
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            *response.body_mut() = Full::new(Bytes::from("Not Found"));
                            return Ok::<_, hyper::Error>(response);
                        }

                        let encoder = prometheus::TextEncoder::new();
                        let mut buffer = Vec::new();
                        if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
                            tracing::warn!(error = %err, "failed to encode metrics");
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            return Ok(response);
                        }
                        if let Ok(value) = encoder.format_type().parse::<hyper::header::HeaderValue>() {
                            response
                                .headers_mut()
                                .insert(hyper::header::CONTENT_TYPE, value);
                        }
                        *response.body_mut() = Full::new(Bytes::from(buffer));
                        Ok(response)
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        tracing::debug!(error = %err, "error serving metrics connection");
                    }
                });
            }
        }
    }
}
