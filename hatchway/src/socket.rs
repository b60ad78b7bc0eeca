//! The HTTP surface of the gateway: a login endpoint that parks
//! credentials behind a cookie, and the WebSocket endpoint that binds a
//! browser connection to its session manager.

use std::sync::Arc;

use bytes::Bytes;
use data_encoding::BASE64;
use futures::{SinkExt, StreamExt};
use hatchway_common::{Credentials, Secret};
use hatchway_core::{BrowserInput, DefaultTransportFactory, GatewayService, Services};
use poem::http::StatusCode;
use poem::web::websocket::{Message, WebSocket};
use poem::web::{Data, RemoteAddr};
use poem::{handler, IntoResponse, Request, Response};
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, warn};

const COOKIE_NAME: &str = "hatchway";

/// Outbound socket buffer watermarks, in queued frames. Above the high
/// mark every bridge feeding this browser is throttled.
const SOCKET_HIGH_WATER: usize = 512;
const SOCKET_LOW_WATER: usize = 64;

fn basic_credentials(request: &Request) -> Option<(String, String)> {
    let header = request.headers().get("Authorization")?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim().as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    if user.is_empty() {
        return None;
    }
    Some((user.to_owned(), password.to_owned()))
}

fn cookie_value(request: &Request) -> Option<String> {
    let header = request.headers().get("Cookie")?.to_str().ok()?;
    header.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        (name == COOKIE_NAME).then(|| value.to_owned())
    })
}

/// Credentials are not verified here: the per-session bridge (the
/// configured auth helper) authenticates against the host when the first
/// channel opens. The gateway only escrows them behind a cookie.
#[handler]
pub async fn login(
    request: &Request,
    services: Data<&Services>,
    remote: &RemoteAddr,
) -> Response {
    let Some((user, password)) = basic_credentials(request) else {
        return Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header("WWW-Authenticate", "Basic realm=\"hatchway\"")
            .finish();
    };

    let creds = Credentials::new(
        user,
        Some(Secret::new(password)),
        Some(remote.to_string()),
        "hatchway",
    );
    let csrf_token = creds.csrf_token().to_owned();
    let (cookie, creds) = services.auth.lock().await.attach(creds);
    debug!(user = %creds.user(), "issued login cookie");

    Response::builder()
        .status(StatusCode::OK)
        .header(
            "Set-Cookie",
            format!("{COOKIE_NAME}={cookie}; Secure; HttpOnly; SameSite=Strict; Path=/"),
        )
        .content_type("application/json")
        .body(serde_json::json!({"csrf-token": csrf_token}).to_string())
}

#[handler]
pub async fn socket(
    request: &Request,
    ws: WebSocket,
    services: Data<&Services>,
) -> impl IntoResponse {
    // An invalid cookie still gets an upgrade; the session manager
    // reports `no-session` in-band, where the browser can see it.
    let creds = match cookie_value(request) {
        Some(cookie) => services.auth.lock().await.check_cookie(&cookie),
        None => None,
    };
    let config = services.config.lock().await.clone();

    ws.on_upgrade(move |socket| async move {
        let factory = Arc::new(DefaultTransportFactory {
            config: config.clone(),
        });
        let (service, mut browser_out) = GatewayService::new(config, creds, factory);
        let (in_tx, in_rx) = unbounded_channel();
        let (mut sink, mut stream) = socket.split();

        // Frames are text where possible, matching what browsers expect
        // of a JSON-heavy protocol; raw binary payload stays binary.
        let writer = tokio::spawn({
            let pressure_tx = in_tx.clone();
            async move {
                let mut pressed = false;
                while let Some(frame) = browser_out.recv().await {
                    let message = match std::str::from_utf8(&frame) {
                        Ok(text) => Message::Text(text.to_owned()),
                        Err(_) => Message::Binary(frame.to_vec()),
                    };
                    if sink.send(message).await.is_err() {
                        break;
                    }

                    let backlog = browser_out.len();
                    if !pressed && backlog > SOCKET_HIGH_WATER {
                        pressed = true;
                        let _ = pressure_tx.send(BrowserInput::Pressure(true));
                    } else if pressed && backlog < SOCKET_LOW_WATER {
                        pressed = false;
                        let _ = pressure_tx.send(BrowserInput::Pressure(false));
                    }
                }
                let _ = sink.close().await;
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                match message {
                    Message::Text(text) => {
                        let _ = in_tx.send(BrowserInput::Frame(Bytes::from(text.into_bytes())));
                    }
                    Message::Binary(data) => {
                        let _ = in_tx.send(BrowserInput::Frame(Bytes::from(data)));
                    }
                    Message::Close(_) => {
                        let _ = in_tx.send(BrowserInput::Closing);
                        break;
                    }
                    _ => {}
                }
            }
            // Dropping the sender tells the service the browser is gone.
        });

        service.run(in_rx).await;
        reader.abort();
        if let Err(error) = writer.await {
            if !error.is_cancelled() {
                warn!(%error, "socket writer failed");
            }
        }
    })
}
