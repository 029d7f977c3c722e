//! WebSocket connection setup
//!
//! Direct mode uses `connect_async`. With a per-account proxy the TCP
//! connection goes to the proxy, an HTTP `CONNECT` opens a tunnel to the
//! node, and TLS plus the WebSocket handshake run inside the tunnel.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use titan_api::STREAM_PATH;
use titan_endpoints::Endpoint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{Error, Result};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Largest CONNECT response head accepted from a proxy.
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// `<stream base>/api/public/webnodes/ws?token=..&device_id=..`
pub fn stream_url(endpoint: &Endpoint, access_token: &str, device_id: &str) -> Result<Url> {
    let mut url = endpoint
        .stream()
        .join(STREAM_PATH)
        .map_err(|e| Error::Transport(format!("invalid stream URL for {endpoint}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("token", access_token)
        .append_pair("device_id", device_id);
    Ok(url)
}

#[derive(Debug, Clone)]
pub struct Connector {
    user_agent: String,
    proxy: Option<Url>,
    timeout: Duration,
}

impl Connector {
    pub fn new(user_agent: String, proxy: Option<Url>, timeout: Duration) -> Self {
        Self {
            user_agent,
            proxy,
            timeout,
        }
    }

    /// Open the WebSocket. A 401/403 on the upgrade maps to `Unauthorized`;
    /// everything else is `Transport`.
    pub async fn connect(&self, url: &Url) -> Result<WsStream> {
        let uri: tungstenite::http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::Transport(e.to_string()))?;
        let request = ClientRequestBuilder::new(uri).with_header("User-Agent", self.user_agent.as_str());

        let handshake = async {
            let result = match &self.proxy {
                None => tokio_tungstenite::connect_async(request).await,
                Some(proxy) => {
                    let tunnel = open_tunnel(proxy, url).await?;
                    tokio_tungstenite::client_async_tls(request, tunnel).await
                }
            };
            result.map(|(ws, _response)| ws).map_err(handshake_error)
        };

        tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| Error::Transport(format!("handshake timed out after {:?}", self.timeout)))?
    }
}

fn handshake_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == tungstenite::http::StatusCode::UNAUTHORIZED
                || status == tungstenite::http::StatusCode::FORBIDDEN
            {
                Error::Unauthorized(format!("upgrade refused with {status}"))
            } else {
                Error::Transport(format!("upgrade refused with {status}"))
            }
        }
        other => Error::Transport(other.to_string()),
    }
}

/// Open a `CONNECT` tunnel through `proxy` to the host and port of `target`.
async fn open_tunnel(proxy: &Url, target: &Url) -> Result<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| Error::Transport(format!("proxy URL has no host: {proxy}")))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(8080);
    let target_host = target
        .host_str()
        .ok_or_else(|| Error::Transport("stream URL has no host".into()))?;
    let target_port = target
        .port_or_known_default()
        .ok_or_else(|| Error::Transport("stream URL has no port".into()))?;
    let authority = format!("{target_host}:{target_port}");

    let mut tcp = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| Error::Transport(format!("connecting to proxy {proxy_host}:{proxy_port}: {e}")))?;

    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(credentials) = proxy_credentials(proxy) {
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            STANDARD.encode(credentials)
        ));
    }
    request.push_str("\r\n");
    tcp.write_all(request.as_bytes())
        .await
        .map_err(|e| Error::Transport(format!("writing CONNECT: {e}")))?;

    let mut head = Vec::with_capacity(512);
    let mut chunk = [0u8; 512];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = tcp
            .read(&mut chunk)
            .await
            .map_err(|e| Error::Transport(format!("reading CONNECT response: {e}")))?;
        if n == 0 {
            return Err(Error::Transport("proxy closed the connection during CONNECT".into()));
        }
        head.extend_from_slice(&chunk[..n]);
        if head.len() > MAX_PROXY_RESPONSE {
            return Err(Error::Transport("oversized CONNECT response".into()));
        }
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    match status_line.split_whitespace().nth(1) {
        Some("200") => {
            debug!(proxy = %proxy_host, target = %authority, "proxy tunnel established");
            Ok(tcp)
        }
        Some("407") => Err(Error::Transport("proxy authentication required".into())),
        _ => Err(Error::Transport(format!("proxy refused CONNECT: {status_line}"))),
    }
}

/// `user:password` from the proxy URL, percent-decoded. `Url` keeps the
/// userinfo encoded, so `p%40ss` has to go out as `p@ss`.
fn proxy_credentials(proxy: &Url) -> Option<Vec<u8>> {
    if proxy.username().is_empty() {
        return None;
    }
    let mut credentials: Vec<u8> = percent_decode_str(proxy.username()).collect();
    credentials.push(b':');
    credentials.extend(percent_decode_str(proxy.password().unwrap_or_default()));
    Some(credentials)
}
