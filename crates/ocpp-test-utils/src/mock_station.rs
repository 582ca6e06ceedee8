use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures_util::{SinkExt, StreamExt};
use ocpp_protocol::{
    CallErrorFrame, CallFrame, CallResultFrame, Frame, NodeId, RequestId, Routing,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type BoxError = Box<dyn std::error::Error>;

const SUBPROTOCOL: &str = "ocpp2.1";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A charging station (or hub) driven step by step from a test.
pub struct MockStation {
    node_id: NodeId,
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
    next_id: u64,
}

impl MockStation {
    pub async fn connect(addr: SocketAddr, node_id: &str) -> Result<Self, BoxError> {
        Self::open(addr, node_id, None).await
    }

    pub async fn connect_with_basic_auth(
        addr: SocketAddr,
        node_id: &str,
        password: &str,
    ) -> Result<Self, BoxError> {
        Self::open(addr, node_id, Some(password)).await
    }

    async fn open(addr: SocketAddr, node_id: &str, password: Option<&str>) -> Result<Self, BoxError> {
        let mut request = format!("ws://{addr}/ocpp/{node_id}").into_client_request()?;
        let headers = request.headers_mut();
        headers.insert("Sec-WebSocket-Protocol", HeaderValue::from_static(SUBPROTOCOL));
        if let Some(password) = password {
            let credentials = STANDARD.encode(format!("{node_id}:{password}"));
            headers.insert(
                "Authorization",
                HeaderValue::from_str(&format!("Basic {credentials}"))?,
            );
        }
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request).await?;
        let (write, read) = ws_stream.split();
        Ok(Self {
            node_id: NodeId::from(node_id),
            write,
            read,
            next_id: 0,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn fresh_id(&mut self) -> RequestId {
        self.next_id += 1;
        RequestId::from(format!("{}-{}", self.node_id, self.next_id).as_str())
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), BoxError> {
        self.send_text(&frame.to_text()).await
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), BoxError> {
        self.write.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    pub async fn send_call(&mut self, action: &str, payload: Value) -> Result<RequestId, BoxError> {
        self.send_call_with_routing(action, payload, None).await
    }

    /// Sends a CALL on behalf of `source`, the way a hub relays one.
    pub async fn send_routed_call(
        &mut self,
        source: &str,
        action: &str,
        payload: Value,
    ) -> Result<RequestId, BoxError> {
        let routing = Routing {
            source: Some(NodeId::from(source)),
            destination: None,
        };
        self.send_call_with_routing(action, payload, Some(routing)).await
    }

    async fn send_call_with_routing(
        &mut self,
        action: &str,
        payload: Value,
        routing: Option<Routing>,
    ) -> Result<RequestId, BoxError> {
        let message_id = self.fresh_id();
        let frame = Frame::Call(CallFrame {
            message_id: message_id.clone(),
            action: action.to_owned(),
            payload,
            routing,
        });
        self.send_frame(&frame).await?;
        Ok(message_id)
    }

    pub async fn send_result(&mut self, message_id: &RequestId, payload: Value) -> Result<(), BoxError> {
        let frame = Frame::CallResult(CallResultFrame {
            message_id: message_id.clone(),
            payload,
        });
        self.send_frame(&frame).await
    }

    pub async fn send_error(
        &mut self,
        message_id: &RequestId,
        code: &str,
        description: &str,
    ) -> Result<(), BoxError> {
        let frame = Frame::CallError(CallErrorFrame {
            message_id: message_id.clone(),
            code: code.to_owned(),
            description: description.to_owned(),
            details: json!({}),
        });
        self.send_frame(&frame).await
    }

    /// Next OCPP frame, skipping control frames. Fails after a few seconds.
    pub async fn recv_frame(&mut self) -> Result<Frame, BoxError> {
        let text = tokio::time::timeout(RECV_TIMEOUT, self.next_text())
            .await
            .map_err(|_| "timed out waiting for a frame")??;
        Ok(Frame::parse(&text)?)
    }

    /// Next frame, which must be a CALL from the CSMS.
    pub async fn expect_call(&mut self) -> Result<CallFrame, BoxError> {
        match self.recv_frame().await? {
            Frame::Call(call) => Ok(call),
            other => Err(format!("expected CALL, got {other:?}").into()),
        }
    }

    /// Waits for the server to close the socket and returns the close code.
    pub async fn expect_close(&mut self) -> Result<Option<u16>, BoxError> {
        let wait = async {
            loop {
                match self.read.next().await {
                    Some(Ok(Message::Close(frame))) => return Ok(frame.map(|f| u16::from(f.code))),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(BoxError::from(e)),
                    None => return Ok(None),
                }
            }
        };
        tokio::time::timeout(RECV_TIMEOUT, wait)
            .await
            .map_err(|_| "timed out waiting for close")?
    }

    async fn next_text(&mut self) -> Result<String, BoxError> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_owned()),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), BoxError> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}

/// HTTP status of a refused WebSocket handshake, if that is what `err` is.
pub fn rejection_status(err: &BoxError) -> Option<u16> {
    match err.downcast_ref::<tokio_tungstenite::tungstenite::Error>()? {
        tokio_tungstenite::tungstenite::Error::Http(response) => Some(response.status().as_u16()),
        _ => None,
    }
}
