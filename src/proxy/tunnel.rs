//! CONNECT handshake and blind byte tunnel for HTTPS traffic.
//!
//! The tunnel port runs its own http1 accept loop because the handshake
//! ends in a protocol upgrade: after the `200 OK` the client connection
//! becomes a raw byte stream spliced against the dialed upstream.

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::proxy::strip_port;
use crate::stats::StatsAccumulator;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept loop for the tunnel listener. Each connection is served on its
/// own task; tunnel establishment never blocks the acceptor beyond the
/// accept itself.
pub async fn serve_tunnel(listener: TcpListener, state: Arc<AppState>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("tunnel accept error: {e}");
                continue;
            }
        };

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle_connect(req, Arc::clone(&state)));
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                debug!("tunnel connection from {peer} ended: {e}");
            }
        });
    }
}

async fn handle_connect(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if req.method() != Method::CONNECT {
        return Ok(text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed",
        ));
    }

    let target = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    if target.is_empty() {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "CONNECT target missing",
        ));
    }

    let host = strip_port(&target).to_string();
    let blocked = state.blocklist.is_blocked(&host);

    // Connections are counted on the handshake, not on relay success.
    state.accumulator.record(&host, blocked, 0, true).await;
    if let Some(geo) = &state.geo {
        geo.record_host_async(&host);
    }

    if blocked {
        info!("blocked CONNECT to {host}");
        return Ok(text_response(StatusCode::FORBIDDEN, "Blocked"));
    }

    let upstream = match timeout(DIAL_TIMEOUT, TcpStream::connect(target_addr(&target))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("dial to {target} failed: {e}");
            return Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, &e.to_string()));
        }
        Err(_) => {
            warn!("dial to {target} timed out");
            return Ok(text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "upstream connect timed out",
            ));
        }
    };

    let accumulator = Arc::clone(&state.accumulator);
    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => relay(upgraded, upstream, &host, accumulator).await,
            Err(e) => warn!("CONNECT upgrade failed for {host}: {e}"),
        }
    });

    // hyper sends this 200 and then hands the connection to the upgrade.
    Ok(Response::new(empty_body()))
}

/// Splice the upgraded client connection against the upstream. Both
/// directions are accounted on clean teardown; an abnormal close accounts
/// nothing.
async fn relay(
    upgraded: Upgraded,
    mut upstream: TcpStream,
    host: &str,
    accumulator: Arc<StatsAccumulator>,
) {
    let mut client = TokioIo::new(upgraded);
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            accumulator
                .record(host, false, to_upstream + to_client, false)
                .await;
        }
        Err(e) => debug!("tunnel to {host} closed abnormally: {e}"),
    }
}

/// CONNECT targets are `host:port`; a bare host defaults to 443.
fn target_addr(target: &str) -> String {
    if strip_port(target) != target {
        target.to_string()
    } else {
        format!("{target}:443")
    }
}

fn empty_body() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}
