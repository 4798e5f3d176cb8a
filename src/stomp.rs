//! Minimal STOMP 1.2 over websocket, as spoken by the pxGrid pubsub service.
//!
//! Only the frames the session topic needs: CONNECT/CONNECTED on the way in,
//! SUBSCRIBE once, then a stream of MESSAGE frames until the server closes.
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::Result;
use crate::events::EventSource;
use crate::transport_error;

/// One STOMP frame: command line, header block, NUL-terminated body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StompFrame {
    pub command: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl StompFrame {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Self::default()
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.command);
        out.push('\n');
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push(':');
            out.push_str(value);
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let (head, body) = raw
            .split_once("\n\n")
            .ok_or_else(|| transport_error!("malformed STOMP frame: no header terminator"))?;
        let mut lines = head.lines().map(|line| line.trim_end_matches('\r'));
        let command = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| transport_error!("malformed STOMP frame: empty command"))?
            .to_string();
        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| transport_error!("malformed STOMP header: {}", line))?;
            headers.push((name.to_string(), value.to_string()));
        }
        let body = body.trim_end_matches('\0').to_string();
        Ok(Self {
            command,
            headers,
            body,
        })
    }
}

/// Event source reading pxGrid session messages off a STOMP subscription.
pub struct StompEventSource {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl StompEventSource {
    /// Open the websocket with HTTP Basic credentials (nodename + the access
    /// secret handed out by the pxGrid controller), complete the STOMP
    /// handshake against the pubsub node, and subscribe to `topic`.
    pub async fn connect(
        ws_url: &str,
        nodename: &str,
        secret: &str,
        pubsub_node_name: &str,
        topic: &str,
        tls: native_tls::TlsConnector,
    ) -> Result<Self> {
        let mut request = ws_url
            .into_client_request()
            .map_err(|err| transport_error!("invalid websocket url {}: {}", ws_url, err))?;
        let credentials = STANDARD.encode(format!("{}:{}", nodename, secret));
        let authorization: HeaderValue = format!("Basic {}", credentials)
            .parse()
            .map_err(|_| transport_error!("credentials are not header-safe"))?;
        request.headers_mut().insert(AUTHORIZATION, authorization);

        let (ws, _response) =
            connect_async_tls_with_config(request, None, false, Some(Connector::NativeTls(tls)))
                .await?;
        let mut source = Self { ws };

        let connect = StompFrame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", pubsub_node_name);
        source.send_frame(&connect).await?;

        let reply = source.read_frame().await?;
        if reply.command != "CONNECTED" {
            return Err(transport_error!(
                "STOMP connect rejected: {} {}",
                reply.command,
                reply.header_value("message").unwrap_or_default()
            ));
        }
        debug!(
            version = reply.header_value("version").unwrap_or("?"),
            "STOMP session established"
        );

        let subscribe = StompFrame::new("SUBSCRIBE")
            .header("destination", topic)
            .header("id", nodename);
        source.send_frame(&subscribe).await?;
        info!(topic, "subscribed to session topic");

        Ok(source)
    }

    async fn send_frame(&mut self, frame: &StompFrame) -> Result<()> {
        self.ws.send(Message::Text(frame.serialize())).await?;
        Ok(())
    }

    /// Next frame off the wire. Pings are answered by the websocket layer;
    /// anything else that is not a data frame ends the stream.
    async fn read_frame(&mut self) -> Result<StompFrame> {
        loop {
            let message = self
                .ws
                .next()
                .await
                .ok_or_else(|| transport_error!("websocket connection closed"))??;
            match message {
                Message::Text(text) => return StompFrame::parse(&text),
                Message::Binary(bytes) => {
                    let text = String::from_utf8(bytes)
                        .map_err(|_| transport_error!("non-UTF8 STOMP frame"))?;
                    return StompFrame::parse(&text);
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(reason) => {
                    return Err(transport_error!(
                        "websocket closed by server: {:?}",
                        reason
                    ))
                }
                Message::Frame(_) => continue,
            }
        }
    }
}

#[async_trait]
impl EventSource for StompEventSource {
    async fn next_message(&mut self) -> Result<String> {
        loop {
            let frame = self.read_frame().await?;
            match frame.command.as_str() {
                "MESSAGE" => return Ok(frame.body),
                "ERROR" => {
                    return Err(transport_error!(
                        "STOMP error frame: {}",
                        frame.header_value("message").unwrap_or(&frame.body)
                    ))
                }
                // RECEIPT and friends carry nothing we act on
                other => debug!(command = other, "ignoring STOMP frame"),
            }
        }
    }
}
