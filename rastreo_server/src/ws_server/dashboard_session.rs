// rastreo_server/src/ws_server/dashboard_session.rs

//! 看板端协议状态机。
//!
//! 状态流转：`Connected → Closed`。连接建立即注册（无需认证，初始
//! 没有任何订阅），之后处理 SUBSCRIBE / UNSUBSCRIBE / PING，并异步
//! 接收连接注册表为其订阅的单元推送的 POSITION_UPDATE / EVENT_ALERT /
//! CONNECTION_STATE。顺序保证：同一设备会话针对同一单元发出的消息
//! 保持相对顺序；跨单元之间以及与并发订阅竞争之间不保证顺序。

use chrono::Utc;
use futures_util::stream::SplitStream;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use rastreo_models::ws_frames::{DashboardFrame, DashboardServerFrame};
use rastreo_ws_utils::server::transport::{receive_text, ConnectionHandler, WsStream};

use crate::ws_server::connection_registry::ConnectionRegistry;
use crate::ws_server::writer_task;

/// 单个看板连接的会话处理器。
pub struct DashboardSession {
    registry: Arc<ConnectionRegistry>,
    session_id: String,
    peer_addr: SocketAddr,
}

impl DashboardSession {
    pub fn new(registry: Arc<ConnectionRegistry>, peer_addr: SocketAddr) -> Self {
        Self {
            registry,
            session_id: Uuid::new_v4().to_string(),
            peer_addr,
        }
    }

    /// 本会话的服务端生成标识。
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 会话主流程：注册 → 消息循环 → 拆除。
    pub async fn run(self, handler: ConnectionHandler, mut receiver: SplitStream<WsStream>) {
        let (tx, rx) = mpsc::channel::<DashboardServerFrame>(32);
        self.registry
            .register_dashboard(&self.session_id, tx.clone())
            .await;
        let writer_handle = tokio::spawn(writer_task(handler, rx));
        info!(
            "[看板会话] {}: 已连接: session_id={}",
            self.peer_addr, self.session_id
        );

        loop {
            match receive_text(&mut receiver).await {
                Some(Ok(texto)) => {
                    self.procesar_frame(&texto, &tx).await;
                }
                Some(Err(e)) => {
                    warn!(
                        "[看板会话] {}: 接收错误，结束会话: {}",
                        self.peer_addr, e
                    );
                    break;
                }
                None => {
                    info!("[看板会话] {}: 对端关闭连接", self.peer_addr);
                    break;
                }
            }
        }

        // 拆除：恰好一次地注销（注销会把本会话从所有订阅者集合中剪除），
        // 随后等待写出任务收尾。
        self.registry.remove_dashboard(&self.session_id).await;
        drop(tx);
        if let Err(e) = writer_handle.await {
            error!("[看板会话] {}: 写出任务异常结束: {}", self.peer_addr, e);
        }
        info!(
            "[看板会话] {}: 会话已关闭: session_id={}",
            self.peer_addr, self.session_id
        );
    }

    /// 处理一帧入站消息。
    async fn procesar_frame(&self, texto: &str, tx: &mpsc::Sender<DashboardServerFrame>) {
        match DashboardFrame::parse(texto) {
            Err(e) => {
                // 协议错误可恢复：回复 ERROR，连接保持打开。
                warn!(
                    "[看板会话] {}: 入站帧解码失败: {} (原始: {})",
                    self.peer_addr, e, texto
                );
                enviar_a_panel(
                    tx,
                    DashboardServerFrame::Error {
                        message: e.to_string(),
                        code: Some(e.code().to_string()),
                    },
                )
                .await;
            }
            Ok(DashboardFrame::Subscribe { unidad_ids }) => {
                let nuevas = self.registry.subscribe(&self.session_id, &unidad_ids).await;
                enviar_a_panel(
                    tx,
                    DashboardServerFrame::Subscribed {
                        unidad_ids: unidad_ids.clone(),
                        message: format!("Suscrito a {} unidades", unidad_ids.len()),
                    },
                )
                .await;

                // 对本次真正新增的每个单元，立即推送一次当前连接状态，
                // 让客户端不必等到下一次状态变化事件。
                for unidad_id in nuevas {
                    let is_connected = self.registry.is_device_connected(&unidad_id).await;
                    debug!(
                        "[看板会话] {}: 推送订阅初始状态: unidad_id={}, is_connected={}",
                        self.peer_addr, unidad_id, is_connected
                    );
                    enviar_a_panel(
                        tx,
                        DashboardServerFrame::ConnectionState {
                            unidad_id,
                            is_connected,
                            last_ping: None,
                        },
                    )
                    .await;
                }
            }
            Ok(DashboardFrame::Unsubscribe { unidad_ids }) => {
                self.registry.unsubscribe(&self.session_id, &unidad_ids).await;
                enviar_a_panel(
                    tx,
                    DashboardServerFrame::Unsubscribed {
                        unidad_ids: unidad_ids.clone(),
                        message: format!("Desuscrito de {} unidades", unidad_ids.len()),
                    },
                )
                .await;
            }
            Ok(DashboardFrame::Ping) => {
                enviar_a_panel(
                    tx,
                    DashboardServerFrame::Pong {
                        timestamp: Utc::now(),
                    },
                )
                .await;
            }
        }
    }
}

/// 通过出站通道投递一帧；通道已关闭时记录并丢弃（会话正在拆除）。
async fn enviar_a_panel(tx: &mpsc::Sender<DashboardServerFrame>, frame: DashboardServerFrame) {
    if tx.send(frame).await.is_err() {
        warn!("[看板会话] 出站通道已关闭，帧被丢弃");
    }
}
