//! 位置入库与事件检测网关。
//!
//! 真正的入库与地理规则检测（偏航、超速、长时间停车等）由数据层函数
//! 实现，属于本核心之外的协作方；本模块只定义其契约 [`IngestGateway`]，
//! 以及一个进程内实现 [`MemoryIngestGateway`]（默认装配与测试用）。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

use crate::error::AppError;
use rastreo_models::enums::EventoTipo;

/// 一条待入库的位置样本。
#[derive(Debug, Clone)]
pub struct PosicionMuestra {
    pub unidad_id: String,
    pub ts: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub seq: Option<i64>,
    /// 设备上报的原始帧（审计用途，随样本一并入库）。
    pub raw_payload: serde_json::Value,
}

/// 入库结果：新位置的 id，以及检测规则触发的事件 id（若有）。
#[derive(Debug, Clone, Copy)]
pub struct IngestResultado {
    pub posicion_id: i64,
    pub event_id: Option<i64>,
}

/// 检测事件的完整信息（用于 EVENT_ALERT 推送）。
#[derive(Debug, Clone)]
pub struct EventoDetalle {
    pub id: i64,
    pub unidad_id: String,
    pub tipo: EventoTipo,
    pub detalle: String,
    pub ts: DateTime<Utc>,
    pub posicion_id: Option<i64>,
}

/// 位置入库网关的契约（外部协作方）。
#[async_trait]
pub trait IngestGateway: Send + Sync {
    /// 持久化一条位置样本并执行检测规则。
    ///
    /// 失败属于可恢复的入库错误：调用方回复 ERROR 帧，连接保持打开。
    async fn ingest(&self, muestra: &PosicionMuestra) -> Result<IngestResultado, AppError>;

    /// 查询事件详情；事件不存在时返回 `None`。
    async fn event_lookup(&self, event_id: i64) -> Option<EventoDetalle>;
}

/// `IngestGateway` 的进程内实现。
///
/// 位置 id 单调递增；可通过 [`programar_evento`](Self::programar_evento)
/// 注入"下一次入库触发某事件"，以及 [`forzar_fallo`](Self::forzar_fallo)
/// 模拟数据层故障，两者都用于测试与演示。
pub struct MemoryIngestGateway {
    next_posicion_id: AtomicI64,
    next_event_id: AtomicI64,
    eventos: RwLock<HashMap<i64, EventoDetalle>>,
    evento_pendiente: Mutex<Option<(EventoTipo, String)>>,
    fallo_forzado: AtomicBool,
}

impl MemoryIngestGateway {
    pub fn new() -> Self {
        Self {
            next_posicion_id: AtomicI64::new(1),
            next_event_id: AtomicI64::new(1),
            eventos: RwLock::new(HashMap::new()),
            evento_pendiente: Mutex::new(None),
            fallo_forzado: AtomicBool::new(false),
        }
    }

    /// 注入一个事件：下一次 `ingest` 将触发它。
    pub fn programar_evento(&self, tipo: EventoTipo, detalle: impl Into<String>) {
        let mut pendiente = self
            .evento_pendiente
            .lock()
            .expect("evento_pendiente 锁中毒");
        *pendiente = Some((tipo, detalle.into()));
    }

    /// 打开/关闭模拟的数据层故障。
    pub fn forzar_fallo(&self, activo: bool) {
        self.fallo_forzado.store(activo, Ordering::SeqCst);
    }
}

impl Default for MemoryIngestGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestGateway for MemoryIngestGateway {
    async fn ingest(&self, muestra: &PosicionMuestra) -> Result<IngestResultado, AppError> {
        if self.fallo_forzado.load(Ordering::SeqCst) {
            return Err(AppError::Ingest("fallo simulado del almacén de datos".to_string()));
        }

        let posicion_id = self.next_posicion_id.fetch_add(1, Ordering::SeqCst);

        let pendiente = {
            let mut guard = self
                .evento_pendiente
                .lock()
                .expect("evento_pendiente 锁中毒");
            guard.take()
        };

        let event_id = match pendiente {
            Some((tipo, detalle)) => {
                let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
                let evento = EventoDetalle {
                    id,
                    unidad_id: muestra.unidad_id.clone(),
                    tipo,
                    detalle,
                    ts: muestra.ts,
                    posicion_id: Some(posicion_id),
                };
                self.eventos.write().await.insert(id, evento);
                Some(id)
            }
            None => None,
        };

        info!(
            "[入库网关] 位置已入库: unidad_id={}, posicion_id={}, evento_id={:?}",
            muestra.unidad_id, posicion_id, event_id
        );
        Ok(IngestResultado {
            posicion_id,
            event_id,
        })
    }

    async fn event_lookup(&self, event_id: i64) -> Option<EventoDetalle> {
        self.eventos.read().await.get(&event_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn muestra_de_prueba() -> PosicionMuestra {
        PosicionMuestra {
            unidad_id: "U1".to_string(),
            ts: Utc::now(),
            lat: 14.9,
            lon: -92.25,
            speed: Some(10.0),
            heading: None,
            seq: Some(0),
            raw_payload: serde_json::json!({"type": "POS", "lat": 14.9, "lon": -92.25}),
        }
    }

    #[tokio::test]
    /// 位置 id 单调递增；未注入事件时不产生事件。
    async fn test_ingest_assigns_monotonic_ids() {
        let gateway = MemoryIngestGateway::new();
        let r1 = gateway.ingest(&muestra_de_prueba()).await.unwrap();
        let r2 = gateway.ingest(&muestra_de_prueba()).await.unwrap();
        assert_eq!(r1.posicion_id, 1);
        assert_eq!(r2.posicion_id, 2);
        assert!(r1.event_id.is_none() && r2.event_id.is_none());
    }

    #[tokio::test]
    /// 注入的事件只触发一次，且可按 id 回查详情。
    async fn test_programmed_event_fires_once() {
        let gateway = MemoryIngestGateway::new();
        gateway.programar_evento(EventoTipo::Speeding, "exceso de velocidad");

        let r1 = gateway.ingest(&muestra_de_prueba()).await.unwrap();
        let event_id = r1.event_id.expect("注入后的首次入库应触发事件");
        let detalle = gateway.event_lookup(event_id).await.expect("事件应可回查");
        assert_eq!(detalle.tipo, EventoTipo::Speeding);
        assert_eq!(detalle.unidad_id, "U1");
        assert_eq!(detalle.posicion_id, Some(r1.posicion_id));

        let r2 = gateway.ingest(&muestra_de_prueba()).await.unwrap();
        assert!(r2.event_id.is_none(), "事件注入只对下一次入库生效");

        assert!(gateway.event_lookup(9999).await.is_none());
    }

    #[tokio::test]
    /// 模拟数据层故障时返回入库错误。
    async fn test_forced_failure_returns_ingest_error() {
        let gateway = MemoryIngestGateway::new();
        gateway.forzar_fallo(true);
        let err = gateway.ingest(&muestra_de_prueba()).await.unwrap_err();
        assert!(matches!(err, AppError::Ingest(_)), "应返回入库错误: {:?}", err);
        gateway.forzar_fallo(false);
        assert!(gateway.ingest(&muestra_de_prueba()).await.is_ok());
    }
}
