//! HTTPS listener: static pages plus the WebSocket command channel.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response as HttpResponse};
use futures_util::{SinkExt, StreamExt};
use gpg_bridge_core::MAX_MESSAGE_LENGTH;
use gpg_bridge_core::context::BridgeContext;
use gpg_bridge_core::dispatch::{Outbox, handle_message};
use gpg_bridge_core::events::LogLevel;
use gpg_bridge_core::proto::{INTERNAL_ERROR, INVALID_PAYLOAD, Response};
use gpg_bridge_core::session::Session;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Responses queued per connection before the dispatcher waits on the
/// writer.
const OUTBOX_DEPTH: usize = 16;

/// WebSocket clients must connect from `127.0.0.1`, `::1` or
/// `::ffff:127.0.0.1`. The listener only speaks TLS, so this is the whole
/// admission check.
pub fn is_allowed_remote(remote: IpAddr) -> bool {
    match remote {
        IpAddr::V4(v4) => v4 == Ipv4Addr::LOCALHOST,
        IpAddr::V6(v6) => {
            v6 == Ipv6Addr::LOCALHOST || v6.to_ipv4_mapped() == Some(Ipv4Addr::LOCALHOST)
        }
    }
}

struct Asset {
    content_type: &'static str,
    body: &'static [u8],
}

const INDEX_HTML: &[u8] = include_bytes!("../assets/index.html");
const LOGO_SVG: &[u8] = include_bytes!("../assets/logo.svg");
const TOUCH_SVG: &[u8] = include_bytes!("../assets/touch.svg");

fn static_asset(path: &str) -> Option<Asset> {
    let (content_type, body) = match path {
        "/" | "/index.html" => ("text/html; charset=utf-8", INDEX_HTML),
        "/logo.svg" => ("image/svg+xml", LOGO_SVG),
        "/touch.svg" => ("image/svg+xml", TOUCH_SVG),
        _ => return None,
    };
    Some(Asset { content_type, body })
}

#[derive(Clone)]
struct AppState {
    ctx: Arc<BridgeContext>,
    shutdown: watch::Receiver<bool>,
}

/// Build the router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the gate can
/// see the peer address.
pub fn build_router(ctx: Arc<BridgeContext>, shutdown: watch::Receiver<bool>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(AppState { ctx, shutdown })
}

async fn handle(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: Option<WebSocketUpgrade>,
    method: Method,
    uri: Uri,
) -> HttpResponse {
    if let Some(ws) = ws {
        if !is_allowed_remote(remote.ip()) {
            warn!(remote = %remote, "refusing websocket upgrade from non-loopback address");
            return StatusCode::FORBIDDEN.into_response();
        }
        info!(remote = %remote, "client connected");
        state.ctx.log(LogLevel::Info, "Client connected.");
        let AppState { ctx, shutdown } = state;
        return ws
            .max_message_size(MAX_MESSAGE_LENGTH)
            .on_upgrade(move |socket| serve_socket(socket, ctx, shutdown))
            .into_response();
    }

    match static_asset(uri.path()) {
        Some(asset) if method == Method::GET => {
            ([(header::CONTENT_TYPE, asset.content_type)], asset.body).into_response()
        }
        _ => {
            debug!(method = %method, path = uri.path(), "no route");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

fn encode(response: &Response) -> String {
    serde_json::to_string(response).unwrap_or_else(|e| {
        warn!("failed to encode response: {e}");
        format!(r#"{{"communication":"{INTERNAL_ERROR}"}}"#)
    })
}

/// Run one authenticated-on-demand connection until the client leaves or
/// the daemon shuts down.
///
/// Frames are handled one at a time; replies go through an [`Outbox`] to a
/// writer task so a workflow can push progress before its final reply.
async fn serve_socket(
    socket: WebSocket,
    ctx: Arc<BridgeContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut sink, mut stream) = socket.split();
    let (out, mut rx) = Outbox::channel(OUTBOX_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(encode(&response))).await {
                debug!("websocket send failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut session = Session::new();
    loop {
        if *shutdown.borrow() {
            info!("shutdown signaled, closing connection");
            break;
        }

        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = shutdown.changed() => {
                info!("shutdown signaled, closing connection");
                break;
            }
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                handle_message(&ctx, &mut session, &text, &out).await;
            }
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => handle_message(&ctx, &mut session, text, &out).await,
                Err(_) => {
                    out.send(Response::failure(
                        INVALID_PAYLOAD,
                        "binary frame is not valid UTF-8",
                    ))
                    .await;
                }
            },
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!("websocket receive failed: {e}");
                break;
            }
        }
    }

    drop(out);
    let _ = writer.await;
    info!("client disconnected");
    ctx.log(LogLevel::Info, "Client disconnected.");
}
