// rastreo_server/src/ws_server/mod.rs

//! WebSocket 服务端实现。
//!
//! 模块划分：
//! - `connection_registry`: 在线连接与订阅关系的唯一权威来源（扇出枢纽）。
//! - `device_session`: 设备端协议状态机（认证、位置上报、凭证轮换后台任务）。
//! - `dashboard_session`: 看板端协议状态机（订阅/取消订阅、异步推送）。
//! - `service`: 监听入口，按升级路径把连接路由到对应的会话处理器。

pub mod connection_registry;
pub mod dashboard_session;
pub mod device_session;
pub mod service;

use log::{debug, error};
use rastreo_ws_utils::server::transport::ConnectionHandler;
use tokio::sync::mpsc;

/// 认证失败时使用的应用层关闭码，与普通关闭 (1000) 可区分。
pub const CLOSE_CODE_AUTH_FAILED: u16 = 4001;

/// 未知升级路径使用的关闭码（策略违规）。
pub const CLOSE_CODE_UNKNOWN_PATH: u16 = 1008;

/// 每连接唯一的写出任务：独占连接的发送端，串行地把出站通道中的帧
/// 依次发送出去。
///
/// 会话主循环与后台任务（如凭证轮换）都只向通道投递，从不直接写
/// 套接字，因此同一连接上的发送天然被串行化。通道全部发送端被丢弃
/// 后任务结束，并尽力以普通关闭码收尾。
pub(crate) async fn writer_task<T>(mut handler: ConnectionHandler, mut rx: mpsc::Receiver<T>)
where
    T: serde::Serialize + Send + 'static,
{
    let peer = handler.peer_addr();
    while let Some(frame) = rx.recv().await {
        if let Err(e) = handler.send_frame(&frame).await {
            error!("[写出任务] {}: 发送帧失败，连接可能已断开: {}", peer, e);
            break;
        }
    }
    // 通道耗尽或发送失败：尽力优雅关闭（失败时忽略，连接多半已断开）。
    let _ = handler.close_with(1000, "sesión finalizada").await;
    debug!("[写出任务] {}: 写出任务结束", peer);
}
