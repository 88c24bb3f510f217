// rastreo_server/src/ws_server/connection_registry.rs

//! 连接注册表：全部在线连接与订阅关系的唯一权威来源。
//!
//! 设备连接表、看板连接表与"单元 → 订阅者"反向索引是唯一跨连接共享的
//! 可变状态，三者由同一把锁保护；临界区只覆盖映射的变更，
//! 向具体连接的投递在锁外、基于锁内取得的一致快照并发进行。
//!
//! 不变式：反向索引必须与各看板自身的订阅集合双向一致 ——
//! 每次变更操作结束后以 `debug_assert!` 复查。
//!
//! 设备条目按 device_id 键控，重复注册采取 last-writer-wins：
//! 旧条目的出站通道被丢弃，对应的写出任务随之结束并关闭旧套接字。

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};

use rastreo_models::ws_frames::{DashboardServerFrame, DeviceServerFrame};

/// 设备连接条目。
#[derive(Debug, Clone)]
pub struct DeviceConnection {
    pub device_id: String,
    pub unidad_id: String,
    /// 向该设备会话的写出任务投递帧的通道。
    pub sender: mpsc::Sender<DeviceServerFrame>,
    pub connected_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
}

/// 看板连接条目。
#[derive(Debug, Clone)]
pub struct DashboardConnection {
    pub session_id: String,
    pub sender: mpsc::Sender<DashboardServerFrame>,
    pub connected_at: DateTime<Utc>,
    /// 该看板当前订阅的单元集合；与反向索引保持双向一致。
    pub subscriptions: HashSet<String>,
}

/// 运维视角的设备连接摘要。
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceResumen {
    pub device_id: String,
    pub unidad_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
}

/// 锁内状态：两张连接表加反向索引。
#[derive(Debug, Default)]
struct RegistryInner {
    /// device_id -> 设备连接
    devices: HashMap<String, DeviceConnection>,
    /// session_id -> 看板连接
    dashboards: HashMap<String, DashboardConnection>,
    /// unidad_id -> 订阅该单元的看板 session_id 集合
    unidad_subscribers: HashMap<String, HashSet<String>>,
}

/// 管理所有活动连接与订阅关系的注册表。
#[derive(Debug)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// 注册设备连接。
    ///
    /// 同一 device_id 的既有条目会被替换（last-writer-wins）。
    /// 无论是否存在旧条目，都向该单元当前的订阅者广播一次
    /// `connected=true` 的状态帧。
    pub async fn register_device(
        &self,
        device_id: &str,
        unidad_id: &str,
        sender: mpsc::Sender<DeviceServerFrame>,
    ) {
        let total = {
            let mut guard = self.inner.write().await;
            let now = Utc::now();
            let previa = guard.devices.insert(
                device_id.to_string(),
                DeviceConnection {
                    device_id: device_id.to_string(),
                    unidad_id: unidad_id.to_string(),
                    sender,
                    connected_at: now,
                    last_ping: now,
                },
            );
            if previa.is_some() {
                warn!(
                    "[连接注册表] device_id={} 已有在线连接，旧条目被替换 (last-writer-wins)",
                    device_id
                );
            }
            debug_assert!(Self::invariante_consistente(&guard), "订阅索引双向一致性被破坏");
            guard.devices.len()
        };
        info!(
            "[连接注册表] 设备已注册: device_id={}, unidad_id={}, 在线设备总数={}",
            device_id, unidad_id, total
        );

        self.broadcast_connection_state(unidad_id, true).await;
    }

    /// 移除设备连接；确有条目被移除时广播 `connected=false`。
    pub async fn remove_device(&self, device_id: &str) {
        let removida = {
            let mut guard = self.inner.write().await;
            let removida = guard.devices.remove(device_id);
            debug_assert!(Self::invariante_consistente(&guard), "订阅索引双向一致性被破坏");
            removida
        };
        match removida {
            Some(conn) => {
                info!(
                    "[连接注册表] 设备已注销: device_id={}, unidad_id={}",
                    device_id, conn.unidad_id
                );
                self.broadcast_connection_state(&conn.unidad_id, false).await;
            }
            None => {
                warn!("[连接注册表] 尝试移除不存在的设备连接: device_id={}", device_id);
            }
        }
    }

    /// 仅当注册表中的条目仍属于给定通道时才移除。
    ///
    /// 会话拆除路径使用本方法：若该 device_id 已被更新的连接抢注
    /// （last-writer-wins），旧会话的拆除不应误删新条目。
    pub async fn remove_device_if_same(
        &self,
        device_id: &str,
        sender: &mpsc::Sender<DeviceServerFrame>,
    ) {
        let es_propia = {
            let guard = self.inner.read().await;
            guard
                .devices
                .get(device_id)
                .map_or(false, |c| c.sender.same_channel(sender))
        };
        if es_propia {
            self.remove_device(device_id).await;
        } else {
            debug!(
                "[连接注册表] device_id={} 的条目已属于更新的连接，跳过注销",
                device_id
            );
        }
    }

    /// 注册看板连接（初始无任何订阅）。
    pub async fn register_dashboard(&self, session_id: &str, sender: mpsc::Sender<DashboardServerFrame>) {
        let total = {
            let mut guard = self.inner.write().await;
            guard.dashboards.insert(
                session_id.to_string(),
                DashboardConnection {
                    session_id: session_id.to_string(),
                    sender,
                    connected_at: Utc::now(),
                    subscriptions: HashSet::new(),
                },
            );
            debug_assert!(Self::invariante_consistente(&guard), "订阅索引双向一致性被破坏");
            guard.dashboards.len()
        };
        info!(
            "[连接注册表] 看板已注册: session_id={}, 在线看板总数={}",
            session_id, total
        );
    }

    /// 移除看板连接，并把它从所有订阅过的单元的订阅者集合中剪除，
    /// 恢复双向一致（清空的集合随之删除）。
    pub async fn remove_dashboard(&self, session_id: &str) {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        match inner.dashboards.remove(session_id) {
            Some(conn) => {
                for unidad_id in &conn.subscriptions {
                    let vacio = match inner.unidad_subscribers.get_mut(unidad_id) {
                        Some(set) => {
                            set.remove(session_id);
                            set.is_empty()
                        }
                        None => false,
                    };
                    if vacio {
                        inner.unidad_subscribers.remove(unidad_id);
                    }
                }
                info!(
                    "[连接注册表] 看板已注销: session_id={}, 清除订阅 {} 项, 在线看板总数={}",
                    session_id,
                    conn.subscriptions.len(),
                    inner.dashboards.len()
                );
            }
            None => {
                warn!("[连接注册表] 尝试移除不存在的看板连接: session_id={}", session_id);
            }
        }
        debug_assert!(Self::invariante_consistente(inner), "订阅索引双向一致性被破坏");
    }

    /// 为看板添加订阅；幂等，重复订阅同一单元是无操作。
    ///
    /// 返回本次调用真正新增的单元列表，调用方据此只为新增项
    /// 推送初始 CONNECTION_STATE。
    pub async fn subscribe(&self, session_id: &str, unidad_ids: &[String]) -> Vec<String> {
        let mut nuevas = Vec::new();
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        match inner.dashboards.get_mut(session_id) {
            Some(conn) => {
                for unidad_id in unidad_ids {
                    if conn.subscriptions.insert(unidad_id.clone()) {
                        inner
                            .unidad_subscribers
                            .entry(unidad_id.clone())
                            .or_default()
                            .insert(session_id.to_string());
                        nuevas.push(unidad_id.clone());
                    }
                }
                info!(
                    "[连接注册表] 看板订阅更新: session_id={}, 请求 {} 项, 新增 {} 项, 当前共 {} 项",
                    session_id,
                    unidad_ids.len(),
                    nuevas.len(),
                    conn.subscriptions.len()
                );
            }
            None => {
                warn!("[连接注册表] 未注册的看板请求订阅: session_id={}", session_id);
            }
        }
        debug_assert!(Self::invariante_consistente(inner), "订阅索引双向一致性被破坏");
        nuevas
    }

    /// 为看板移除订阅；幂等，取消未订阅的单元是无操作。
    pub async fn unsubscribe(&self, session_id: &str, unidad_ids: &[String]) {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        match inner.dashboards.get_mut(session_id) {
            Some(conn) => {
                for unidad_id in unidad_ids {
                    if conn.subscriptions.remove(unidad_id) {
                        let vacio = match inner.unidad_subscribers.get_mut(unidad_id) {
                            Some(set) => {
                                set.remove(session_id);
                                set.is_empty()
                            }
                            None => false,
                        };
                        if vacio {
                            inner.unidad_subscribers.remove(unidad_id);
                        }
                    }
                }
                info!(
                    "[连接注册表] 看板取消订阅: session_id={}, 请求 {} 项, 剩余 {} 项",
                    session_id,
                    unidad_ids.len(),
                    conn.subscriptions.len()
                );
            }
            None => {
                warn!("[连接注册表] 未注册的看板请求取消订阅: session_id={}", session_id);
            }
        }
        debug_assert!(Self::invariante_consistente(inner), "订阅索引双向一致性被破坏");
    }

    /// 向订阅了某单元的全部看板推送一帧。
    ///
    /// 快照在锁内完成，投递在锁外对全部订阅者并发进行；单个订阅者的
    /// 投递失败只会被记录并触发该订阅者的移除，既不中断对其余订阅者的
    /// 投递，也不向调用方传播。没有订阅者时为无操作。
    pub async fn publish_to_unit(&self, unidad_id: &str, frame: DashboardServerFrame) {
        let destinos: Vec<(String, mpsc::Sender<DashboardServerFrame>)> = {
            let guard = self.inner.read().await;
            match guard.unidad_subscribers.get(unidad_id) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|sid| {
                        guard
                            .dashboards
                            .get(sid)
                            .map(|c| (sid.clone(), c.sender.clone()))
                    })
                    .collect(),
                None => return,
            }
        };
        if destinos.is_empty() {
            return;
        }

        debug!(
            "[连接注册表] 向单元 {} 的 {} 个订阅者推送 {:?} 帧",
            unidad_id,
            destinos.len(),
            discriminante(&frame)
        );

        let envios = destinos.into_iter().map(|(session_id, sender)| {
            let frame = frame.clone();
            async move {
                match sender.send(frame).await {
                    Ok(()) => None,
                    Err(_) => Some(session_id),
                }
            }
        });
        let fallidos: Vec<String> = join_all(envios).await.into_iter().flatten().collect();

        for session_id in fallidos {
            error!(
                "[连接注册表] 向看板 {} 投递失败，将移除该订阅者连接",
                session_id
            );
            self.remove_dashboard(&session_id).await;
        }
    }

    /// 向指定设备直接发送一帧；失败时移除该设备连接。
    pub async fn send_to_device(&self, device_id: &str, frame: DeviceServerFrame) {
        let sender = {
            let guard = self.inner.read().await;
            guard.devices.get(device_id).map(|c| c.sender.clone())
        };
        match sender {
            Some(sender) => {
                if sender.send(frame).await.is_err() {
                    error!(
                        "[连接注册表] 向设备 {} 发送失败，将移除该设备连接",
                        device_id
                    );
                    self.remove_device(device_id).await;
                }
            }
            None => {
                warn!("[连接注册表] 向未注册设备发送被忽略: device_id={}", device_id);
            }
        }
    }

    /// 某单元当前是否有设备在线。
    ///
    /// 对设备表做线性扫描，O(n)；在预期的车队规模下可接受。
    pub async fn is_device_connected(&self, unidad_id: &str) -> bool {
        let guard = self.inner.read().await;
        guard.devices.values().any(|c| c.unidad_id == unidad_id)
    }

    /// 刷新设备的最近心跳时间。
    pub async fn touch_device_ping(&self, device_id: &str) {
        let mut guard = self.inner.write().await;
        if let Some(conn) = guard.devices.get_mut(device_id) {
            conn.last_ping = Utc::now();
        }
    }

    /// 在线设备连接的快照（运维用途）。
    pub async fn connected_devices(&self) -> Vec<DeviceResumen> {
        let guard = self.inner.read().await;
        guard
            .devices
            .values()
            .map(|c| DeviceResumen {
                device_id: c.device_id.clone(),
                unidad_id: c.unidad_id.clone(),
                connected_at: c.connected_at,
                last_ping: c.last_ping,
            })
            .collect()
    }

    /// 在线看板数量。
    pub async fn dashboard_count(&self) -> usize {
        self.inner.read().await.dashboards.len()
    }

    /// 某看板当前的订阅集合；未注册时返回 `None`。
    pub async fn subscriptions_of(&self, session_id: &str) -> Option<HashSet<String>> {
        let guard = self.inner.read().await;
        guard
            .dashboards
            .get(session_id)
            .map(|c| c.subscriptions.clone())
    }

    /// 订阅了某单元的看板集合；无订阅者时返回空集。
    pub async fn subscribers_of(&self, unidad_id: &str) -> HashSet<String> {
        let guard = self.inner.read().await;
        guard
            .unidad_subscribers
            .get(unidad_id)
            .cloned()
            .unwrap_or_default()
    }

    /// 向单元的订阅者广播连接状态变化。
    async fn broadcast_connection_state(&self, unidad_id: &str, is_connected: bool) {
        self.publish_to_unit(
            unidad_id,
            DashboardServerFrame::ConnectionState {
                unidad_id: unidad_id.to_string(),
                is_connected,
                last_ping: Some(Utc::now()),
            },
        )
        .await;
    }

    /// 复查双向一致性：每条订阅关系必须同时存在于看板的订阅集合
    /// 与反向索引中，且反向索引不含空集。
    fn invariante_consistente(inner: &RegistryInner) -> bool {
        for (session_id, conn) in &inner.dashboards {
            for unidad_id in &conn.subscriptions {
                let indexado = inner
                    .unidad_subscribers
                    .get(unidad_id)
                    .map_or(false, |set| set.contains(session_id));
                if !indexado {
                    return false;
                }
            }
        }
        for (unidad_id, session_ids) in &inner.unidad_subscribers {
            if session_ids.is_empty() {
                return false;
            }
            for session_id in session_ids {
                let suscrito = inner
                    .dashboards
                    .get(session_id)
                    .map_or(false, |c| c.subscriptions.contains(unidad_id));
                if !suscrito {
                    return false;
                }
            }
        }
        true
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 帧判别名（仅用于日志）。
fn discriminante(frame: &DashboardServerFrame) -> &'static str {
    match frame {
        DashboardServerFrame::Subscribed { .. } => "SUBSCRIBED",
        DashboardServerFrame::Unsubscribed { .. } => "UNSUBSCRIBED",
        DashboardServerFrame::Pong { .. } => "PONG",
        DashboardServerFrame::Error { .. } => "ERROR",
        DashboardServerFrame::PositionUpdate { .. } => "POSITION_UPDATE",
        DashboardServerFrame::EventAlert { .. } => "EVENT_ALERT",
        DashboardServerFrame::ConnectionState { .. } => "CONNECTION_STATE",
    }
}
