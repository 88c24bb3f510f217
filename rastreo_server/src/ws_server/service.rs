// rastreo_server/src/ws_server/service.rs

//! WebSocket 服务端核心服务：监听入口与按路径的会话路由。
//!
//! 设备端连接 `/ws/device`，看板端连接 `/ws/dashboard`；升级请求的
//! 路径在握手阶段被传输层捕获，这里据此把连接交给对应的协议状态机。
//! 未知路径以策略违规码关闭。

use anyhow::{Context, Result};
use futures_util::stream::SplitStream;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use rastreo_models::enums::ClientRole;
use rastreo_ws_utils::server::transport::{start_server, ConnectionHandler, WsStream};

use crate::auth::CredentialStore;
use crate::config::AppConfig;
use crate::ingest::IngestGateway;
use crate::ws_server::connection_registry::ConnectionRegistry;
use crate::ws_server::dashboard_session::DashboardSession;
use crate::ws_server::device_session::DeviceSession;
use crate::ws_server::CLOSE_CODE_UNKNOWN_PATH;

/// 设备端入口路径。
pub const DEVICE_WS_PATH: &str = "/ws/device";
/// 看板端入口路径。
pub const DASHBOARD_WS_PATH: &str = "/ws/dashboard";

/// WebSocket 服务结构体，封装了配置、连接注册表与外部协作方。
pub struct WsService {
    config: AppConfig,
    registry: Arc<ConnectionRegistry>,
    credenciales: Arc<dyn CredentialStore>,
    ingesta: Arc<dyn IngestGateway>,
}

impl WsService {
    /// 创建一个新的 WsService 实例。
    pub fn new(
        config: AppConfig,
        registry: Arc<ConnectionRegistry>,
        credenciales: Arc<dyn CredentialStore>,
        ingesta: Arc<dyn IngestGateway>,
    ) -> Self {
        info!("[WsService] 实例已创建。");
        Self {
            config,
            registry,
            credenciales,
            ingesta,
        }
    }

    /// 启动 WebSocket 服务端（本方法在服务器停止前不会返回）。
    pub async fn start(&self) -> Result<()> {
        info!(
            "[WsService] 正在启动 WebSocket 服务: host={}, port={}",
            self.config.websocket.host, self.config.websocket.port
        );

        let on_new_connection = {
            let registry_cb = Arc::clone(&self.registry);
            let credenciales_cb = Arc::clone(&self.credenciales);
            let ingesta_cb = Arc::clone(&self.ingesta);
            let config_cb = self.config.clone();

            move |mut handler: ConnectionHandler,
                  receiver: SplitStream<WsStream>,
                  path: String,
                  peer_addr: SocketAddr| {
                let registry = Arc::clone(&registry_cb);
                let credenciales = Arc::clone(&credenciales_cb);
                let ingesta = Arc::clone(&ingesta_cb);
                let config = config_cb.clone();

                async move {
                    match path.as_str() {
                        DEVICE_WS_PATH => {
                            info!(
                                "[WsService] {}: 新连接，角色={}",
                                peer_addr,
                                ClientRole::Device
                            );
                            DeviceSession::new(registry, credenciales, ingesta, config, peer_addr)
                                .run(handler, receiver)
                                .await;
                        }
                        DASHBOARD_WS_PATH => {
                            info!(
                                "[WsService] {}: 新连接，角色={}",
                                peer_addr,
                                ClientRole::Dashboard
                            );
                            DashboardSession::new(registry, peer_addr)
                                .run(handler, receiver)
                                .await;
                        }
                        otra => {
                            warn!(
                                "[WsService] {}: 未知的升级路径 '{}'，关闭连接",
                                peer_addr, otra
                            );
                            let _ = handler
                                .close_with(CLOSE_CODE_UNKNOWN_PATH, "ruta desconocida")
                                .await;
                        }
                    }
                }
            }
        };

        let listen_addr = format!(
            "{}:{}",
            self.config.websocket.host, self.config.websocket.port
        );
        start_server(listen_addr, on_new_connection)
            .await
            .context("WebSocket 服务器运行失败")?;

        error!("[WsService] WebSocket 服务器意外停止 (start_server 返回)。");
        Ok(())
    }
}
