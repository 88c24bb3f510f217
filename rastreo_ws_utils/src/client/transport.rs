// rastreo_ws_utils/src/client/transport.rs

//! 客户端 WebSocket 传输层核心逻辑。
//!
//! 本模块提供建立与服务器的连接、发送 JSON 帧、以及接收服务端事件
//! （文本帧或携带关闭码的连接关闭）的能力。关闭码对上层可见，
//! 以便区分普通关闭与应用层语义关闭（例如认证失败的 4001）。

use crate::error::WsError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use serde::Serialize;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as TungsteniteError;
use tokio_tungstenite::{connect_async, WebSocketStream};
use url::Url;

/// `ClientWsStream` 类型别名，代表一个可能经过 TLS 加密的客户端 WebSocket 流。
pub type ClientWsStream =
    WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// 从服务端收到的单个事件。
#[derive(Debug)]
pub enum ClientEvent {
    /// 一帧文本消息（未解码的 JSON）。
    Text(String),
    /// 连接已关闭；`code` 为对端给出的关闭码（若有）。
    Closed { code: Option<u16> },
}

/// `ClientConnection` 结构体代表一个活动的客户端 WebSocket 连接。
pub struct ClientConnection {
    /// 用于向服务器异步发送消息的发送端。
    pub ws_sender: SplitSink<ClientWsStream, Message>,
    /// 用于从服务器异步接收消息的接收端。
    pub ws_receiver: SplitStream<ClientWsStream>,
}

impl ClientConnection {
    /// 序列化并发送一帧 JSON 消息。
    pub async fn send_frame<T: Serialize>(&mut self, frame: &T) -> Result<(), WsError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| WsError::SerializationError(format!("帧序列化为JSON失败: {}", e)))?;
        debug!("[客户端传输] 准备发送帧: {}", text);
        self.ws_sender.send(Message::Text(text)).await?;
        Ok(())
    }

    /// 发送一帧原始文本（不经序列化）。
    ///
    /// 主要供测试构造畸形帧；正常业务路径应使用 [`send_frame`](Self::send_frame)。
    pub async fn send_text(&mut self, text: &str) -> Result<(), WsError> {
        self.ws_sender.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// 接收下一个服务端事件（文本帧或连接关闭）。
    pub async fn receive_event(&mut self) -> Result<ClientEvent, WsError> {
        receive_event(&mut self.ws_receiver).await
    }
}

/// 异步连接到指定的 WebSocket 服务器。
///
/// # Arguments
/// * `url_str` - 服务器完整 URL（例如 "ws://127.0.0.1:8090/ws/device"）。
pub async fn connect_client(url_str: String) -> Result<ClientConnection, WsError> {
    info!("[客户端传输] 开始尝试连接到 WebSocket 服务器，URL: {}", url_str);
    let parsed_url = Url::parse(&url_str)
        .map_err(|e| WsError::InvalidUrl(format!("无效的 WebSocket URL '{}': {}", url_str, e)))?;

    match connect_async(parsed_url.as_str()).await {
        Ok((ws_stream, response)) => {
            info!(
                "[客户端传输] 已成功连接到 {} (HTTP 状态码: {})",
                url_str,
                response.status()
            );
            let (ws_sender, ws_receiver) = ws_stream.split();
            Ok(ClientConnection {
                ws_sender,
                ws_receiver,
            })
        }
        Err(e) => {
            error!("[客户端传输] 连接到 {} 失败，错误: {}", url_str, e);
            Err(WsError::WebSocketProtocolError(e))
        }
    }
}

/// 从接收流中读取下一个事件，跳过控制帧。
///
/// 与服务端的 `receive_text` 不同，连接关闭在这里不是 `None` 而是
/// [`ClientEvent::Closed`]，并尽可能带回对端的关闭码。
pub async fn receive_event(
    ws_receiver: &mut SplitStream<ClientWsStream>,
) -> Result<ClientEvent, WsError> {
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!("[客户端传输] 收到文本帧: {}", text);
                break Ok(ClientEvent::Text(text));
            }
            Some(Ok(Message::Binary(bin))) => {
                break Err(WsError::Message(format!(
                    "客户端收到了非预期的 WebSocket 二进制消息 ({} 字节)",
                    bin.len()
                )));
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                // 控制帧由底层库处理，继续等待业务帧。
            }
            Some(Ok(Message::Close(close_frame))) => {
                let code = close_frame.as_ref().map(|f| u16::from(f.code));
                debug!("[客户端传输] 收到 Close 控制帧，关闭码: {:?}", code);
                break Ok(ClientEvent::Closed { code });
            }
            Some(Ok(Message::Frame(_))) => {
                debug!("[客户端传输] 收到底层原始 Frame，跳过。");
            }
            Some(Err(TungsteniteError::ConnectionClosed))
            | Some(Err(TungsteniteError::AlreadyClosed)) => {
                break Ok(ClientEvent::Closed { code: None });
            }
            Some(Err(e)) => {
                error!("[客户端传输] 接收消息时发生底层错误: {}", e);
                break Err(WsError::WebSocketProtocolError(e));
            }
            None => {
                debug!("[客户端传输] WebSocket 接收流已结束。");
                break Ok(ClientEvent::Closed { code: None });
            }
        }
    }
}
