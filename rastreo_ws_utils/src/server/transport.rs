// rastreo_ws_utils/src/server/transport.rs

//! 包含服务端 WebSocket 监听、接受连接和通信逻辑。

use crate::error::WsError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as TungsteniteError;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

/// `WsStream` 是一个类型别名，代表经过 WebSocket 握手后的 TCP 流。
pub type WsStream = WebSocketStream<TcpStream>;

/// 一个已建立连接的发送端封装。
///
/// 持有连接的 `SplitSink`，负责把任意可序列化的帧编码为
/// 单个 JSON 文本消息发送出去，以及按应用层关闭码关闭连接。
pub struct ConnectionHandler {
    ws_sender: SplitSink<WsStream, Message>,
    peer_addr: SocketAddr,
}

impl ConnectionHandler {
    /// 连接方的 IP 地址和端口。
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// 序列化并发送一帧。
    ///
    /// 帧类型由调用方决定；本方法只要求其可被 serde 序列化为 JSON 对象。
    pub async fn send_frame<T: Serialize>(&mut self, frame: &T) -> Result<(), WsError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| WsError::SerializationError(format!("帧序列化为JSON失败: {}", e)))?;
        debug!("[服务端传输] 发送帧到 {}: {}", self.peer_addr, text);
        self.ws_sender.send(Message::Text(text)).await?;
        Ok(())
    }

    /// 以指定的应用层关闭码关闭连接。
    ///
    /// 4000-4999 区间的关闭码留给应用层语义（例如认证失败），
    /// 与普通关闭 (1000) 可被对端区分。
    pub async fn close_with(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        info!(
            "[服务端传输] 关闭与 {} 的连接，关闭码: {}，原因: {}",
            self.peer_addr, code, reason
        );
        self.ws_sender
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            })))
            .await?;
        self.ws_sender.flush().await?;
        Ok(())
    }
}

/// 启动 WebSocket 服务器并开始监听指定的地址。
///
/// 对于每一个成功建立的 WebSocket 连接，都会在独立的 Tokio 任务中调用
/// `on_connect` 回调进行处理。回调接收四个参数：连接的发送端封装、
/// 接收流、升级请求的路径（如 `/ws/device`）以及对端地址。
///
/// 这个服务器会持续运行，直到发生不可恢复的错误（例如监听器绑定失败）
/// 或进程被终止。
pub async fn start_server<F, Fut>(addr: String, on_connect: F) -> Result<(), WsError>
where
    F: Fn(ConnectionHandler, SplitStream<WsStream>, String, SocketAddr) -> Fut
        + Send
        + Sync
        + Clone
        + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(&addr).await?;
    info!("[服务端传输] WebSocket 服务器正在监听地址: {}", addr);

    loop {
        match listener.accept().await {
            Ok((tcp_stream, peer_addr)) => {
                debug!("[服务端传输] 从 {} 接受了新的 TCP 连接", peer_addr);
                let on_connect_callback = on_connect.clone();

                // 每个连接一个任务：完成握手（捕获路径）后交给上层回调。
                tokio::spawn(async move {
                    let mut request_path = String::new();
                    let handshake = accept_hdr_async(tcp_stream, |req: &Request, resp: Response| {
                        request_path = req.uri().path().to_string();
                        Ok(resp)
                    })
                    .await;

                    match handshake {
                        Ok(ws_stream) => {
                            info!(
                                "[服务端传输] 与 {} 的 WebSocket 握手成功，路径: {}",
                                peer_addr, request_path
                            );
                            let (ws_sender, ws_receiver) = ws_stream.split();
                            let handler = ConnectionHandler {
                                ws_sender,
                                peer_addr,
                            };
                            on_connect_callback(handler, ws_receiver, request_path, peer_addr)
                                .await;
                        }
                        Err(e) => {
                            error!("[服务端传输] 与 {} 的 WebSocket 握手失败: {}", peer_addr, e);
                        }
                    }
                });
            }
            Err(e) => {
                // 接受单个连接失败不应终止服务器，记录后继续监听。
                error!("[服务端传输] 接受 TCP 连接失败: {}。服务器将继续运行。", e);
            }
        }
    }
}

/// 从连接的接收流中读取下一帧文本。
///
/// 控制帧（Ping/Pong，由底层库自动应答）会被跳过。
///
/// # 返回
/// - `Some(Ok(text))`: 收到一帧文本消息。
/// - `Some(Err(e))`: 接收过程中发生错误（二进制消息同样视为错误）。
/// - `None`: 对端关闭了连接或流已结束。
pub async fn receive_text(
    ws_receiver: &mut SplitStream<WsStream>,
) -> Option<Result<String, WsError>> {
    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!("[服务端传输] 收到文本帧: {}", text);
                break Some(Ok(text));
            }
            Some(Ok(Message::Binary(bin))) => {
                warn!("[服务端传输] 收到非预期的二进制消息，长度: {} 字节", bin.len());
                break Some(Err(WsError::Message(
                    "收到了非预期的 WebSocket 二进制消息".to_string(),
                )));
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                // 底层库自动处理，继续等待业务帧。
            }
            Some(Ok(Message::Close(close_frame))) => {
                debug!("[服务端传输] 收到 Close 控制帧: {:?}", close_frame);
                break None;
            }
            Some(Ok(Message::Frame(_))) => {
                debug!("[服务端传输] 收到底层原始 Frame，跳过。");
            }
            Some(Err(TungsteniteError::ConnectionClosed))
            | Some(Err(TungsteniteError::AlreadyClosed)) => {
                debug!("[服务端传输] 连接已关闭 (接收期间检测到)。");
                break None;
            }
            Some(Err(e)) => {
                error!("[服务端传输] 从 WebSocket 流接收消息时发生底层错误: {}", e);
                break Some(Err(WsError::WebSocketProtocolError(e)));
            }
            None => {
                debug!("[服务端传输] WebSocket 接收流已结束。");
                break None;
            }
        }
    }
}
