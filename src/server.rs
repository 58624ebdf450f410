//! TCP listener serving both the WebSocket endpoint and plain HTTP
//!
//! Every connection is handed to hyper. Requests that ask for a WebSocket
//! upgrade are answered with 101 and the upgraded stream becomes a client of
//! the hub; everything else goes to the HTTP routes.

use crate::config::{SessionContext, Settings};
use crate::http::{self, Body, HttpState};
use crate::hub::{self, HubHandle};
use crate::projects::ProjectStore;
use crate::protocol::ServerMessage;
use futures_util::{SinkExt, StreamExt};
use hyper::body::Incoming;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type ServerError = Box<dyn std::error::Error + Send + Sync>;

/// The only protocol version (RFC 6455) we speak
const WEBSOCKET_VERSION: &str = "13";

/// A bound server, ready to run
pub struct Server {
    listener: TcpListener,
    state: HttpState,
    hub_task: JoinHandle<()>,
}

impl Server {
    /// Bind the listener and start the hub. Failing to bind is fatal.
    pub async fn bind(settings: Settings) -> Result<Self, ServerError> {
        let addr = format!("{}:{}", settings.host, settings.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| format!("Failed to bind {}: {}", addr, e))?;

        let store = ProjectStore::new(&settings.data_dir);
        let ctx = SessionContext::new(settings);
        let (hub, hub_task) = hub::spawn(ctx.clone());

        Ok(Self {
            listener,
            state: HttpState { ctx, hub, store },
            hub_task,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn hub(&self) -> HubHandle {
        self.state.hub.clone()
    }

    /// Serve until Ctrl+C (or SIGTERM on Unix)
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then tear the hub down
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            state,
            hub_task,
        } = self;
        tracing::info!("Orbit server listening on {}", listener.local_addr()?);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        let state = state.clone();
                        tokio::spawn(serve_connection(stream, addr, state));
                    }
                    Err(e) => tracing::warn!("Accept error: {}", e),
                },
                _ = &mut shutdown => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        state.hub.shutdown().await;
        let _ = hub_task.await;
        Ok(())
    }
}

/// Resolves on Ctrl+C, or SIGTERM where available
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl+C"),
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to set up SIGTERM handler: {:?}. Only Ctrl+C will work for shutdown.",
                    e
                );
            }
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C");
}

async fn serve_connection(stream: TcpStream, addr: SocketAddr, state: HttpState) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(route(req, addr, state).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        if !e.is_incomplete_message() {
            tracing::debug!("Connection error from {}: {}", addr, e);
        }
    }
}

async fn route(req: Request<Incoming>, addr: SocketAddr, state: HttpState) -> Response<Body> {
    if is_websocket_upgrade(req.headers()) {
        return upgrade(req, addr, state.hub);
    }
    http::handle_request(req, state).await
}

fn header_has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim().eq_ignore_ascii_case(token))
}

pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    header_has_token(headers, header::CONNECTION, "upgrade")
        && header_has_token(headers, header::UPGRADE, "websocket")
}

/// Validate an upgrade request and derive the `Sec-WebSocket-Accept` value,
/// or produce the response refusing it
fn check_handshake(method: &Method, headers: &HeaderMap) -> Result<HeaderValue, Response<Body>> {
    if method != Method::GET {
        return Err(http::error_response(
            StatusCode::BAD_REQUEST,
            "WebSocket upgrade requires GET",
        ));
    }

    let version = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim);
    if version != Some(WEBSOCKET_VERSION) {
        let mut response = http::error_response(
            StatusCode::UPGRADE_REQUIRED,
            "Unsupported Sec-WebSocket-Version",
        );
        response.headers_mut().insert(
            header::SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static(WEBSOCKET_VERSION),
        );
        return Err(response);
    }

    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .map(|key| derive_accept_key(key.as_bytes()))
        .and_then(|accept| HeaderValue::from_str(&accept).ok())
        .ok_or_else(|| http::error_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key"))
}

/// Answer the handshake and hand the upgraded stream to a client task
fn upgrade(mut req: Request<Incoming>, addr: SocketAddr, hub: HubHandle) -> Response<Body> {
    let accept = match check_handshake(req.method(), req.headers()) {
        Ok(accept) => accept,
        Err(response) => {
            tracing::debug!("Refused WebSocket handshake from {}", addr);
            return response;
        }
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                if let Err(e) = handle_client(ws, addr, hub).await {
                    tracing::debug!("Client {} ended with error: {}", addr, e);
                }
            }
            Err(e) => tracing::warn!("WebSocket upgrade failed for {}: {}", addr, e),
        }
    });

    let mut response = Response::new(Body::default());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    response
}

/// Pump one WebSocket client: inbound frames to the hub, hub messages out
async fn handle_client<S>(
    ws: WebSocketStream<S>,
    addr: SocketAddr,
    hub: HubHandle,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut tx, mut rx) = ws.split();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let id = hub.next_connection_id();
    hub.connect(id, client_tx)?;
    tracing::info!("WebSocket client {} connected from {}", id, addr);

    let result = async {
        loop {
            tokio::select! {
                outbound = client_rx.recv() => match outbound {
                    Some(message) => tx.send(Message::Text(message.to_json())).await?,
                    None => {
                        // Hub is gone
                        let _ = tx.send(Message::Close(None)).await;
                        break;
                    }
                },
                inbound = rx.next() => match inbound {
                    Some(Ok(Message::Text(text))) => hub.inbound(id, text)?,
                    Some(Ok(Message::Binary(data))) => {
                        hub.inbound(id, String::from_utf8_lossy(&data).into_owned())?
                    }
                    Some(Ok(Message::Ping(data))) => tx.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error from client {}: {}", id, e);
                        break;
                    }
                },
            }
        }
        Ok::<(), ServerError>(())
    }
    .await;

    hub.disconnect(id);
    tracing::info!("WebSocket client {} disconnected", id);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_upgrade_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
    }

    fn handshake_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers
    }

    #[test]
    fn test_handshake_accept_key() {
        let accept = check_handshake(&Method::GET, &handshake_headers()).unwrap();
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_handshake_rejections() {
        let response = check_handshake(&Method::POST, &handshake_headers()).unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut headers = handshake_headers();
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        let response = check_handshake(&Method::GET, &headers).unwrap_err();
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
        assert_eq!(response.headers()[header::SEC_WEBSOCKET_VERSION], "13");

        headers.remove(header::SEC_WEBSOCKET_VERSION);
        let response = check_handshake(&Method::GET, &headers).unwrap_err();
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);

        let mut headers = handshake_headers();
        headers.remove(header::SEC_WEBSOCKET_KEY);
        let response = check_handshake(&Method::GET, &headers).unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();

        let result = Server::bind(Settings {
            host: "127.0.0.1".to_string(),
            port,
            working_directory: dir.path().to_path_buf(),
            ..Settings::default()
        })
        .await;
        let err = result.err().expect("bind should fail");
        assert!(err.to_string().contains("Failed to bind"));
    }
}
