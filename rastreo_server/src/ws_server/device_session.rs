// rastreo_server/src/ws_server/device_session.rs

//! 设备端协议状态机。
//!
//! 状态流转：`Connecting → Authenticating → Active → Closed`（终态，
//! 不存在回退）。连接建立后必须在限定时间内以 AUTH 帧完成认证；
//! 任何握手失败（超时、无法解析凭证归属、校验失败、首帧格式错误）
//! 都回复 AUTH_FAILED 并以专用关闭码 4001 关闭连接，同一连接内不提供
//! 重试。认证成功后注册到连接注册表，进入上报循环，同时启动凭证轮换
//! 后台任务；拆除时先取消并等待该任务，再恰好一次地从注册表注销。

use chrono::Utc;
use futures_util::stream::SplitStream;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;

use rastreo_models::ws_frames::{DashboardServerFrame, DeviceFrame, DeviceServerFrame, PosicionPayload};
use rastreo_ws_utils::server::transport::{receive_text, ConnectionHandler, WsStream};

use crate::auth::{minutos_hasta_expiracion, renewal_due, CredentialStore};
use crate::config::{AppConfig, TokenConfig};
use crate::error::AppError;
use crate::ingest::{IngestGateway, PosicionMuestra};
use crate::ws_server::connection_registry::ConnectionRegistry;
use crate::ws_server::{writer_task, CLOSE_CODE_AUTH_FAILED};

/// 设备会话的协议状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSessionState {
    Connecting,
    Authenticating,
    Active,
    Closed,
}

/// 凭证轮换检查的最近一次结果。
#[derive(Debug, Clone, PartialEq)]
pub enum RenewalOutcome {
    /// 尚未执行过检查。
    NotChecked,
    /// 没有可评估的凭证记录。
    NoCredential,
    /// 凭证无过期时间，永不轮换。
    NoExpiry,
    /// 未到轮换阈值。
    NotDue { minutos_restantes: f64 },
    /// 已创建并下发了新凭证。
    Renewed { token_id: i64 },
    /// 创建或下发失败。
    Failed(String),
}

/// 每个已认证设备会话的轮换状态（仅存于内存，随会话一同消亡）。
#[derive(Debug)]
pub struct RenewalState {
    pub threshold_minutes: i64,
    pub check_interval: Duration,
    pub last_outcome: RwLock<RenewalOutcome>,
}

impl RenewalState {
    pub fn new(cfg: &TokenConfig) -> Self {
        Self {
            threshold_minutes: cfg.renewal_threshold_minutes,
            check_interval: Duration::from_secs(cfg.renewal_check_interval_seconds),
            last_outcome: RwLock::new(RenewalOutcome::NotChecked),
        }
    }
}

/// 单个设备连接的会话处理器。
pub struct DeviceSession {
    registry: Arc<ConnectionRegistry>,
    credenciales: Arc<dyn CredentialStore>,
    ingesta: Arc<dyn IngestGateway>,
    config: AppConfig,
    peer_addr: SocketAddr,
    estado: DeviceSessionState,
}

impl DeviceSession {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        credenciales: Arc<dyn CredentialStore>,
        ingesta: Arc<dyn IngestGateway>,
        config: AppConfig,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            registry,
            credenciales,
            ingesta,
            config,
            peer_addr,
            estado: DeviceSessionState::Connecting,
        }
    }

    /// 会话当前所处的协议状态。
    pub fn estado(&self) -> DeviceSessionState {
        self.estado
    }

    /// 会话主流程：认证 → 上报循环 → 拆除。
    pub async fn run(mut self, mut handler: ConnectionHandler, mut receiver: SplitStream<WsStream>) {
        self.estado = DeviceSessionState::Authenticating;
        debug!("[设备会话] {}: 连接建立，等待 AUTH 帧...", self.peer_addr);

        let (unidad_id, device_id) = match self.autenticar(&mut handler, &mut receiver).await {
            Ok(par) => par,
            Err(e) => {
                // AUTH_FAILED（若适用）已在 autenticar 内发出；这里只负责
                // 以专用关闭码关闭传输。同一连接内不提供重试。
                warn!("[设备会话] {}: 认证失败: {}", self.peer_addr, e);
                let _ = handler
                    .close_with(CLOSE_CODE_AUTH_FAILED, "Authentication failed")
                    .await;
                self.estado = DeviceSessionState::Closed;
                return;
            }
        };

        // 出站通道 + 写出任务：主循环与轮换任务的发送在此串行化。
        let (tx, rx) = mpsc::channel::<DeviceServerFrame>(32);
        self.registry
            .register_device(&device_id, &unidad_id, tx.clone())
            .await;
        let writer_handle = tokio::spawn(writer_task(handler, rx));

        // 凭证轮换后台任务：进入 Active 时启动一次，拆除时取消并等待。
        let renewal_state = Arc::new(RenewalState::new(&self.config.token));
        let renewal_handle = tokio::spawn(renewal_task(
            Arc::clone(&self.credenciales),
            unidad_id.clone(),
            device_id.clone(),
            self.config.token.clone(),
            tx.clone(),
            Arc::clone(&renewal_state),
        ));

        self.estado = DeviceSessionState::Active;
        info!(
            "[设备会话] {}: 已激活: unidad_id={}, device_id={}",
            self.peer_addr, unidad_id, device_id
        );

        loop {
            match receive_text(&mut receiver).await {
                Some(Ok(texto)) => {
                    self.procesar_frame(&texto, &unidad_id, &device_id, &tx).await;
                }
                Some(Err(e)) => {
                    warn!(
                        "[设备会话] {}: 接收错误，结束会话: {}",
                        self.peer_addr, e
                    );
                    break;
                }
                None => {
                    info!("[设备会话] {}: 对端关闭连接", self.peer_addr);
                    break;
                }
            }
        }

        // 拆除：先取消轮换任务并等待取消被观察到，避免它与传输关闭竞争；
        // 然后恰好一次地从注册表注销（注销会向订阅者广播 connected=false），
        // 最后等待写出任务收尾。
        self.estado = DeviceSessionState::Closed;
        renewal_handle.abort();
        match renewal_handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                debug!("[设备会话] {}: 轮换任务已取消", self.peer_addr)
            }
            Err(e) => error!("[设备会话] {}: 轮换任务异常结束: {}", self.peer_addr, e),
        }
        self.registry.remove_device_if_same(&device_id, &tx).await;
        drop(tx);
        if let Err(e) = writer_handle.await {
            error!("[设备会话] {}: 写出任务异常结束: {}", self.peer_addr, e);
        }
        info!(
            "[设备会话] {}: 会话已关闭: unidad_id={}, device_id={}",
            self.peer_addr, unidad_id, device_id
        );
    }

    /// 认证阶段：在限定时间内等待 AUTH 帧并校验凭证。
    ///
    /// 失败时向对端发送 AUTH_FAILED（按失败原因区分措辞）并返回 `Err`；
    /// 成功时发送 AUTH_OK 并返回 `(unidad_id, device_id)`。
    async fn autenticar(
        &self,
        handler: &mut ConnectionHandler,
        receiver: &mut SplitStream<WsStream>,
    ) -> Result<(String, String), AppError> {
        let espera = Duration::from_secs(self.config.websocket.auth_timeout_seconds);
        let recibido = match timeout(espera, receive_text(receiver)).await {
            Ok(r) => r,
            Err(_) => {
                let _ = handler
                    .send_frame(&DeviceServerFrame::AuthFailed {
                        message: "Autenticación fallida".to_string(),
                        reason: "Tiempo de espera de autenticación agotado".to_string(),
                    })
                    .await;
                return Err(AppError::Auth("超时未收到 AUTH 帧".to_string()));
            }
        };

        let texto = match recibido {
            Some(Ok(texto)) => texto,
            Some(Err(e)) => {
                return Err(AppError::Auth(format!("握手期间接收错误: {}", e)));
            }
            None => {
                return Err(AppError::Auth("握手完成前对端已关闭连接".to_string()));
            }
        };

        let (token, device_id) = match DeviceFrame::parse(&texto) {
            Ok(DeviceFrame::Auth { token, device_id }) => (token, device_id),
            Ok(otro) => {
                let _ = handler
                    .send_frame(&DeviceServerFrame::AuthFailed {
                        message: "Autenticación fallida".to_string(),
                        reason: "Se esperaba mensaje AUTH".to_string(),
                    })
                    .await;
                return Err(AppError::Auth(format!("首帧不是 AUTH: {:?}", otro)));
            }
            Err(e) => {
                let _ = handler
                    .send_frame(&DeviceServerFrame::AuthFailed {
                        message: "Autenticación fallida".to_string(),
                        reason: "Se esperaba mensaje AUTH".to_string(),
                    })
                    .await;
                return Err(AppError::Auth(format!("首帧无法解析: {}", e)));
            }
        };

        // 先解析凭证归属（按哈希反查，要求未吊销且未过期），再做校验。
        let unidad_id = match self.credenciales.find_unidad_by_token(&token).await {
            Some(u) => u,
            None => {
                let _ = handler
                    .send_frame(&DeviceServerFrame::AuthFailed {
                        message: "Token inválido".to_string(),
                        reason: "No se encontró unidad asociada al token".to_string(),
                    })
                    .await;
                return Err(AppError::Auth("凭证未关联任何单元".to_string()));
            }
        };

        if !self.credenciales.verify(&unidad_id, &token).await {
            let _ = handler
                .send_frame(&DeviceServerFrame::AuthFailed {
                    message: "Autenticación fallida".to_string(),
                    reason: "Token inválido o expirado".to_string(),
                })
                .await;
            return Err(AppError::Auth(format!("凭证校验未通过: unidad_id={}", unidad_id)));
        }

        handler
            .send_frame(&DeviceServerFrame::AuthOk {
                unidad_id: unidad_id.clone(),
                message: format!("Autenticación exitosa para {}", unidad_id),
            })
            .await
            .map_err(|e| AppError::Auth(format!("发送 AUTH_OK 失败: {}", e)))?;

        info!(
            "[设备会话] {}: 认证通过: unidad_id={}, device_id={}",
            self.peer_addr, unidad_id, device_id
        );
        Ok((unidad_id, device_id))
    }

    /// 处理 Active 状态下的一帧入站消息。
    async fn procesar_frame(
        &self,
        texto: &str,
        unidad_id: &str,
        device_id: &str,
        tx: &mpsc::Sender<DeviceServerFrame>,
    ) {
        match DeviceFrame::parse(texto) {
            Err(e) => {
                // 协议错误可恢复：回复 ERROR，连接保持打开。
                warn!(
                    "[设备会话] {}: 入站帧解码失败: {} (原始: {})",
                    self.peer_addr, e, texto
                );
                enviar_a_dispositivo(
                    tx,
                    DeviceServerFrame::Error {
                        message: e.to_string(),
                        code: Some(e.code().to_string()),
                    },
                )
                .await;
            }
            Ok(DeviceFrame::Auth { .. }) => {
                // 已认证连接上的重复 AUTH 不在协议内。
                warn!("[设备会话] {}: 已认证状态下收到 AUTH 帧", self.peer_addr);
                enviar_a_dispositivo(
                    tx,
                    DeviceServerFrame::Error {
                        message: "Tipo de mensaje desconocido: 'AUTH'".to_string(),
                        code: Some("UNKNOWN_MESSAGE_TYPE".to_string()),
                    },
                )
                .await;
            }
            Ok(DeviceFrame::Pos(pos)) => {
                self.procesar_posicion(pos, texto, unidad_id, tx).await;
            }
            Ok(DeviceFrame::Ping) => {
                self.registry.touch_device_ping(device_id).await;
                enviar_a_dispositivo(
                    tx,
                    DeviceServerFrame::Pong {
                        timestamp: Utc::now(),
                    },
                )
                .await;
            }
            Ok(DeviceFrame::TokenRenewalAck {
                new_token_saved,
                device_id: ack_device_id,
                message,
            }) => {
                // 仅记录；服务端不依赖该确认，也不改变任何状态。
                info!(
                    "[设备会话] {}: 设备确认凭证轮换: unidad_id={}, device_id={}, new_token_saved={}, message={:?}",
                    self.peer_addr, unidad_id, ack_device_id, new_token_saved, message
                );
            }
        }
    }

    /// 处理一条位置上报：入库 → ACK → 扇出，同一位置 ACK 先于扇出。
    async fn procesar_posicion(
        &self,
        pos: PosicionPayload,
        texto_crudo: &str,
        unidad_id: &str,
        tx: &mpsc::Sender<DeviceServerFrame>,
    ) {
        if let Err(motivo) = pos.validar() {
            warn!(
                "[设备会话] {}: 位置载荷校验失败: {}",
                self.peer_addr, motivo
            );
            enviar_a_dispositivo(
                tx,
                DeviceServerFrame::Error {
                    message: format!("Error al procesar posición: {}", motivo),
                    code: Some("POSITION_PROCESSING_ERROR".to_string()),
                },
            )
            .await;
            return;
        }

        let muestra = PosicionMuestra {
            unidad_id: unidad_id.to_string(),
            ts: pos.timestamp,
            lat: pos.lat,
            lon: pos.lon,
            speed: pos.speed,
            heading: pos.heading,
            seq: pos.seq,
            raw_payload: serde_json::from_str(texto_crudo).unwrap_or(serde_json::Value::Null),
        };

        let resultado = match self.ingesta.ingest(&muestra).await {
            Ok(r) => r,
            Err(e) => {
                // 入库错误按消息粒度可恢复：回复 ERROR，连接保持打开。
                error!(
                    "[设备会话] {}: 位置入库失败: unidad_id={}, error={}",
                    self.peer_addr, unidad_id, e
                );
                enviar_a_dispositivo(
                    tx,
                    DeviceServerFrame::Error {
                        message: "Error al insertar posición".to_string(),
                        code: Some("POSITION_INSERT_FAILED".to_string()),
                    },
                )
                .await;
                return;
            }
        };

        // ACK 先于对看板的扇出。
        enviar_a_dispositivo(
            tx,
            DeviceServerFrame::Ack {
                posicion_id: resultado.posicion_id,
                event_id: resultado.event_id,
                timestamp: Utc::now(),
            },
        )
        .await;

        self.registry
            .publish_to_unit(
                unidad_id,
                DashboardServerFrame::PositionUpdate {
                    unidad_id: unidad_id.to_string(),
                    posicion_id: resultado.posicion_id,
                    lat: pos.lat,
                    lon: pos.lon,
                    speed: pos.speed,
                    heading: pos.heading,
                    timestamp: pos.timestamp,
                },
            )
            .await;

        // 只有检测规则确实产生了事件时才推送告警。
        if let Some(event_id) = resultado.event_id {
            match self.ingesta.event_lookup(event_id).await {
                Some(evento) => {
                    self.registry
                        .publish_to_unit(
                            unidad_id,
                            DashboardServerFrame::EventAlert {
                                unidad_id: unidad_id.to_string(),
                                event_id,
                                event_tipo: evento.tipo,
                                detalle: evento.detalle,
                                timestamp: evento.ts,
                                posicion_id: evento.posicion_id,
                            },
                        )
                        .await;
                }
                None => {
                    warn!(
                        "[设备会话] {}: 事件 {} 无法回查详情，跳过告警推送",
                        self.peer_addr, event_id
                    );
                }
            }
        }
    }
}

/// 通过出站通道投递一帧；通道已关闭时记录并丢弃（会话正在拆除）。
async fn enviar_a_dispositivo(tx: &mpsc::Sender<DeviceServerFrame>, frame: DeviceServerFrame) {
    if tx.send(frame).await.is_err() {
        warn!("[设备会话] 出站通道已关闭，帧被丢弃");
    }
}

/// 凭证轮换后台任务。
///
/// 进入 Active 时启动；每个检查周期评估一次设备最近的未吊销凭证，
/// 距过期不足阈值时创建新凭证（不吊销旧凭证，形成宽限期）并下发
/// TOKEN_RENEWAL。任务由会话拆除时取消。
async fn renewal_task(
    credenciales: Arc<dyn CredentialStore>,
    unidad_id: String,
    device_id: String,
    token_cfg: TokenConfig,
    tx: mpsc::Sender<DeviceServerFrame>,
    estado: Arc<RenewalState>,
) {
    info!(
        "[凭证轮换] 任务启动: unidad_id={}, device_id={}, 阈值={} 分钟, 周期={:?}",
        unidad_id, device_id, estado.threshold_minutes, estado.check_interval
    );
    loop {
        let resultado =
            verificar_y_renovar(&*credenciales, &unidad_id, &device_id, &token_cfg, &tx).await;
        *estado.last_outcome.write().await = resultado;
        tokio::time::sleep(estado.check_interval).await;
    }
}

/// 单轮轮换检查。每一轮都记录检查结果，而不只在触发轮换时记录。
async fn verificar_y_renovar(
    credenciales: &dyn CredentialStore,
    unidad_id: &str,
    device_id: &str,
    token_cfg: &TokenConfig,
    tx: &mpsc::Sender<DeviceServerFrame>,
) -> RenewalOutcome {
    let cred = match credenciales.most_recent_active(unidad_id, device_id).await {
        Some(c) => c,
        None => {
            warn!(
                "[凭证轮换] 未找到可评估的凭证记录: unidad_id={}, device_id={}",
                unidad_id, device_id
            );
            return RenewalOutcome::NoCredential;
        }
    };

    let Some(expires_at) = cred.expires_at else {
        debug!(
            "[凭证轮换] 凭证无过期时间，永不轮换: unidad_id={}, token_id={}",
            unidad_id, cred.id
        );
        return RenewalOutcome::NoExpiry;
    };

    let now = Utc::now();
    let minutos = minutos_hasta_expiracion(expires_at, now);
    let debe = renewal_due(Some(expires_at), now, token_cfg.renewal_threshold_minutes);
    info!(
        "[凭证轮换] 检查: unidad_id={}, device_id={}, 距过期 {:.2} 分钟, 阈值 {} 分钟, 需轮换={}",
        unidad_id, device_id, minutos, token_cfg.renewal_threshold_minutes, debe
    );
    if !debe {
        return RenewalOutcome::NotDue {
            minutos_restantes: minutos,
        };
    }

    // 关键：revoke_old=false —— 旧凭证保留到自然过期，新旧两枚在
    // 宽限期内均可独立校验，容忍设备尚未持久化新密钥。
    let nuevo = match credenciales
        .create(unidad_id, device_id, token_cfg.ttl_seconds, false)
        .await
    {
        Ok(n) => n,
        Err(e) => {
            error!(
                "[凭证轮换] 创建新凭证失败: unidad_id={}, device_id={}, error={}",
                unidad_id, device_id, e
            );
            return RenewalOutcome::Failed(e.to_string());
        }
    };
    let Some(expira_nuevo) = nuevo.expires_at else {
        warn!(
            "[凭证轮换] 新凭证没有过期时间，跳过下发: token_id={}",
            nuevo.token_id
        );
        return RenewalOutcome::Failed("nuevo token sin expiración".to_string());
    };

    let token_id = nuevo.token_id;
    let frame = DeviceServerFrame::TokenRenewal {
        new_token: nuevo.plaintext,
        expires_at: expira_nuevo,
        grace_period_days: token_cfg.grace_period_days,
        message: "Token renovado. Actualice su configuración.".to_string(),
    };
    if tx.send(frame).await.is_err() {
        warn!(
            "[凭证轮换] 出站通道已关闭，TOKEN_RENEWAL 未能下发: unidad_id={}",
            unidad_id
        );
        return RenewalOutcome::Failed("canal de salida cerrado".to_string());
    }

    info!(
        "[凭证轮换] 已下发新凭证: unidad_id={}, device_id={}, token_id={}, expires_at={}",
        unidad_id, device_id, token_id, expira_nuevo
    );
    RenewalOutcome::Renewed { token_id }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryCredentialStore;

    fn cfg_token() -> TokenConfig {
        TokenConfig {
            ttl_seconds: 600,
            renewal_threshold_minutes: 7,
            renewal_check_interval_seconds: 60,
            grace_period_days: 7,
        }
    }

    #[tokio::test]
    /// 距过期 5 分钟（< 阈值 7 分钟）：触发轮换，下发 TOKEN_RENEWAL，
    /// 且新旧凭证在宽限期内均可校验。
    async fn test_renewal_fires_and_preserves_grace_period() {
        let store = MemoryCredentialStore::new();
        let viejo = store.create("U1", "dev-01", 300, false).await.unwrap(); // 5 分钟

        let (tx, mut rx) = mpsc::channel::<DeviceServerFrame>(8);
        let resultado = verificar_y_renovar(&store, "U1", "dev-01", &cfg_token(), &tx).await;

        let token_id = match resultado {
            RenewalOutcome::Renewed { token_id } => token_id,
            otro => panic!("预期 Renewed，实际得到: {:?}", otro),
        };

        let nuevo_token = match rx.recv().await.expect("应收到 TOKEN_RENEWAL 帧") {
            DeviceServerFrame::TokenRenewal {
                new_token,
                expires_at,
                grace_period_days,
                ..
            } => {
                assert!(expires_at > Utc::now(), "新凭证的过期时间应在未来");
                assert_eq!(grace_period_days, 7);
                new_token
            }
            otro => panic!("预期 TOKEN_RENEWAL，实际得到: {:?}", otro),
        };

        // 宽限期：旧的未被吊销，两枚均可独立校验。
        assert!(store.verify("U1", &viejo.plaintext).await, "旧凭证应仍然有效");
        assert!(store.verify("U1", &nuevo_token).await, "新凭证应有效");
        assert_eq!(
            store.most_recent_active("U1", "dev-01").await.unwrap().id,
            token_id,
            "最近的未吊销凭证应是新创建的那枚"
        );
    }

    #[tokio::test]
    /// 距过期 10 分钟（> 阈值 7 分钟）：不触发轮换。
    async fn test_renewal_not_due() {
        let store = MemoryCredentialStore::new();
        store.create("U1", "dev-01", 600, false).await.unwrap(); // 10 分钟

        let (tx, mut rx) = mpsc::channel::<DeviceServerFrame>(8);
        let resultado = verificar_y_renovar(&store, "U1", "dev-01", &cfg_token(), &tx).await;
        assert!(
            matches!(resultado, RenewalOutcome::NotDue { minutos_restantes } if minutos_restantes > 7.0),
            "10 分钟剩余不应触发轮换: {:?}",
            resultado
        );
        drop(tx);
        assert!(rx.recv().await.is_none(), "未触发轮换时不应下发任何帧");
    }

    #[tokio::test]
    /// 无过期时间的凭证永不轮换。
    async fn test_renewal_skips_credential_without_expiry() {
        let store = MemoryCredentialStore::new();
        store.create("U1", "dev-01", 0, false).await.unwrap();

        let (tx, _rx) = mpsc::channel::<DeviceServerFrame>(8);
        let resultado = verificar_y_renovar(&store, "U1", "dev-01", &cfg_token(), &tx).await;
        assert_eq!(resultado, RenewalOutcome::NoExpiry);
    }

    #[tokio::test]
    /// 没有任何凭证记录时记录警告并跳过本轮。
    async fn test_renewal_without_credential_rows() {
        let store = MemoryCredentialStore::new();
        let (tx, _rx) = mpsc::channel::<DeviceServerFrame>(8);
        let resultado = verificar_y_renovar(&store, "U1", "dev-01", &cfg_token(), &tx).await;
        assert_eq!(resultado, RenewalOutcome::NoCredential);
    }

    #[tokio::test]
    /// 已过期但未吊销的凭证同样能被评估并触发轮换
    /// （most_recent_active 必须返回过期记录）。
    async fn test_renewal_evaluates_expired_credential() {
        let store = MemoryCredentialStore::new();
        store.create("U1", "dev-01", 1, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let (tx, mut rx) = mpsc::channel::<DeviceServerFrame>(8);
        let resultado = verificar_y_renovar(&store, "U1", "dev-01", &cfg_token(), &tx).await;
        assert!(
            matches!(resultado, RenewalOutcome::Renewed { .. }),
            "已过期的凭证应触发轮换: {:?}",
            resultado
        );
        assert!(matches!(
            rx.recv().await,
            Some(DeviceServerFrame::TokenRenewal { .. })
        ));
    }
}
