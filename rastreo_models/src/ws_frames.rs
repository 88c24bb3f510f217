//! WebSocket 消息帧定义。
//!
//! 线格式约定：每帧为一个 JSON 对象，必须携带 `type` 判别字段。
//! 本模块把四个方向的消息集合各建模为一个封闭的标签联合：
//!
//! - [`DeviceFrame`]: 设备端 → 服务端（`AUTH` / `POS` / `PING` / `TOKEN_RENEWAL_ACK`）。
//! - [`DeviceServerFrame`]: 服务端 → 设备端（`AUTH_OK` / `AUTH_FAILED` / `ACK` /
//!   `ERROR` / `PONG` / `TOKEN_RENEWAL`）。
//! - [`DashboardFrame`]: 看板端 → 服务端（`SUBSCRIBE` / `UNSUBSCRIBE` / `PING`）。
//! - [`DashboardServerFrame`]: 服务端 → 看板端（`SUBSCRIBED` / `UNSUBSCRIBED` /
//!   `PONG` / `ERROR` 以及异步推送 `POSITION_UPDATE` / `EVENT_ALERT` /
//!   `CONNECTION_STATE`）。
//!
//! 入站文本统一经 [`DeviceFrame::parse`] / [`DashboardFrame::parse`] 一次性解码；
//! 解码失败被归类为 [`FrameDecodeError`] 的三种情况，调用方据此回复对应的
//! `ERROR` 码。新增消息类型时，编译器会在所有 match 处产生缺口，
//! 而不是在运行期落入笼统的错误分支。

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::enums::EventoTipo;

/// GPS 位置上报载荷（`POS` 帧的内容）。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PosicionPayload {
    /// 纬度，取值范围 [-90, 90]。
    pub lat: f64,
    /// 经度，取值范围 [-180, 180]。
    pub lon: f64,
    /// 速度，单位 m/s，可选。
    pub speed: Option<f64>,
    /// 航向角，单位度，取值范围 [0, 360)，可选。
    pub heading: Option<f64>,
    /// 采样时间戳；设备未携带时取服务端接收时刻。
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// 设备侧序列号，可选。
    pub seq: Option<i64>,
}

impl PosicionPayload {
    /// 校验各字段的取值范围。
    ///
    /// 返回 `Err` 时携带面向日志/ERROR 回复的描述文本；
    /// 校验失败是可恢复的协议错误，不关闭连接。
    pub fn validar(&self) -> Result<(), String> {
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(format!("lat 超出范围 [-90, 90]: {}", self.lat));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(format!("lon 超出范围 [-180, 180]: {}", self.lon));
        }
        if let Some(speed) = self.speed {
            if speed < 0.0 {
                return Err(format!("speed 不能为负: {}", speed));
            }
        }
        if let Some(heading) = self.heading {
            if !(0.0..360.0).contains(&heading) {
                return Err(format!("heading 超出范围 [0, 360): {}", heading));
            }
        }
        Ok(())
    }
}

/// 设备端 → 服务端 的消息帧。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum DeviceFrame {
    /// 认证握手帧，必须是连接上的第一帧。
    #[serde(rename = "AUTH")]
    Auth {
        /// 凭证明文。
        token: String,
        /// 设备标识。
        device_id: String,
    },
    /// GPS 位置上报。
    #[serde(rename = "POS")]
    Pos(PosicionPayload),
    /// 应用层心跳。
    #[serde(rename = "PING")]
    Ping,
    /// 设备确认已持久化新凭证；服务端仅记录，不依赖此帧。
    #[serde(rename = "TOKEN_RENEWAL_ACK")]
    TokenRenewalAck {
        new_token_saved: bool,
        device_id: String,
        message: Option<String>,
    },
}

impl DeviceFrame {
    /// 本方向全部合法的 `type` 判别值。
    pub const TYPES: [&'static str; 4] = ["AUTH", "POS", "PING", "TOKEN_RENEWAL_ACK"];

    /// 将一帧入站文本解码为 `DeviceFrame`。
    pub fn parse(text: &str) -> Result<Self, FrameDecodeError> {
        parse_frame(text, &Self::TYPES)
    }
}

/// 服务端 → 设备端 的消息帧。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum DeviceServerFrame {
    /// 认证成功。
    #[serde(rename = "AUTH_OK")]
    AuthOk { unidad_id: String, message: String },
    /// 认证失败；随后连接以专用关闭码关闭。
    #[serde(rename = "AUTH_FAILED")]
    AuthFailed { message: String, reason: String },
    /// 位置入库确认。
    #[serde(rename = "ACK")]
    Ack {
        posicion_id: i64,
        event_id: Option<i64>,
        timestamp: DateTime<Utc>,
    },
    /// 可恢复错误回复，连接保持打开。
    #[serde(rename = "ERROR")]
    Error {
        message: String,
        code: Option<String>,
    },
    /// 心跳应答。
    #[serde(rename = "PONG")]
    Pong { timestamp: DateTime<Utc> },
    /// 凭证轮换推送；`new_token` 明文只在此处出现一次。
    #[serde(rename = "TOKEN_RENEWAL")]
    TokenRenewal {
        new_token: String,
        expires_at: DateTime<Utc>,
        grace_period_days: i64,
        message: String,
    },
}

/// 看板端 → 服务端 的消息帧。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum DashboardFrame {
    /// 订阅一组单元的实时推送。
    #[serde(rename = "SUBSCRIBE")]
    Subscribe { unidad_ids: Vec<String> },
    /// 取消订阅。
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe { unidad_ids: Vec<String> },
    /// 应用层心跳。
    #[serde(rename = "PING")]
    Ping,
}

impl DashboardFrame {
    /// 本方向全部合法的 `type` 判别值。
    pub const TYPES: [&'static str; 3] = ["SUBSCRIBE", "UNSUBSCRIBE", "PING"];

    /// 将一帧入站文本解码为 `DashboardFrame`。
    pub fn parse(text: &str) -> Result<Self, FrameDecodeError> {
        parse_frame(text, &Self::TYPES)
    }
}

/// 服务端 → 看板端 的消息帧。
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum DashboardServerFrame {
    /// 订阅确认。
    #[serde(rename = "SUBSCRIBED")]
    Subscribed {
        unidad_ids: Vec<String>,
        message: String,
    },
    /// 取消订阅确认。
    #[serde(rename = "UNSUBSCRIBED")]
    Unsubscribed {
        unidad_ids: Vec<String>,
        message: String,
    },
    /// 心跳应答。
    #[serde(rename = "PONG")]
    Pong { timestamp: DateTime<Utc> },
    /// 可恢复错误回复，连接保持打开。
    #[serde(rename = "ERROR")]
    Error {
        message: String,
        code: Option<String>,
    },
    /// 某单元的实时位置更新（异步推送）。
    #[serde(rename = "POSITION_UPDATE")]
    PositionUpdate {
        unidad_id: String,
        posicion_id: i64,
        lat: f64,
        lon: f64,
        speed: Option<f64>,
        heading: Option<f64>,
        timestamp: DateTime<Utc>,
    },
    /// 检测事件告警（异步推送）。
    #[serde(rename = "EVENT_ALERT")]
    EventAlert {
        unidad_id: String,
        event_id: i64,
        event_tipo: EventoTipo,
        detalle: String,
        timestamp: DateTime<Utc>,
        posicion_id: Option<i64>,
    },
    /// 单元连接状态变化（异步推送；订阅时也会立即推送一次当前状态）。
    #[serde(rename = "CONNECTION_STATE")]
    ConnectionState {
        unidad_id: String,
        is_connected: bool,
        last_ping: Option<DateTime<Utc>>,
    },
}

/// 入站帧解码失败的分类。
///
/// 三种情况分别对应协议层的三个 `ERROR` 码，均为可恢复错误。
#[derive(Error, Debug)]
pub enum FrameDecodeError {
    /// 文本不是合法 JSON。
    #[error("JSON 无效: {0}")]
    InvalidJson(String),
    /// `type` 缺失或不在本方向的合法集合内。
    #[error("未知的消息类型: '{0}'")]
    UnknownType(String),
    /// `type` 合法但载荷字段不符合该类型的结构。
    #[error("'{tipo}' 载荷无效: {detalle}")]
    InvalidPayload { tipo: String, detalle: String },
}

impl FrameDecodeError {
    /// 对应 `ERROR` 帧的 `code` 字段取值。
    pub fn code(&self) -> &'static str {
        match self {
            FrameDecodeError::InvalidJson(_) => "INVALID_JSON",
            FrameDecodeError::UnknownType(_) => "UNKNOWN_MESSAGE_TYPE",
            FrameDecodeError::InvalidPayload { .. } => "INVALID_PAYLOAD",
        }
    }
}

/// 两段式解码：先解析 JSON，再按标签联合成型。
///
/// `known_types` 用于区分"未知类型"与"类型已知但载荷无效"两种失败。
fn parse_frame<T: DeserializeOwned>(
    text: &str,
    known_types: &[&str],
) -> Result<T, FrameDecodeError> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| FrameDecodeError::InvalidJson(e.to_string()))?;
    let tipo = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    match serde_json::from_value::<T>(value) {
        Ok(frame) => Ok(frame),
        Err(e) => {
            if known_types.contains(&tipo.as_str()) {
                Err(FrameDecodeError::InvalidPayload {
                    tipo,
                    detalle: e.to_string(),
                })
            } else {
                Err(FrameDecodeError::UnknownType(tipo))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// 测试 AUTH 帧按线格式解码。
    fn test_parse_auth_frame() {
        let text = r#"{"type":"AUTH","token":"abcdef0123456789abcdef0123456789","device_id":"dev-01"}"#;
        let frame = DeviceFrame::parse(text).expect("AUTH 帧解码失败");
        assert_eq!(
            frame,
            DeviceFrame::Auth {
                token: "abcdef0123456789abcdef0123456789".to_string(),
                device_id: "dev-01".to_string(),
            },
            "解码得到的 AUTH 帧与预期不符"
        );
    }

    #[test]
    /// 测试 POS 帧：未携带 timestamp 时取服务端当前时刻。
    fn test_parse_pos_frame_defaults_timestamp() {
        let antes = Utc::now();
        let frame =
            DeviceFrame::parse(r#"{"type":"POS","lat":14.9,"lon":-92.25,"speed":10,"seq":0}"#)
                .expect("POS 帧解码失败");
        match frame {
            DeviceFrame::Pos(pos) => {
                assert_eq!(pos.lat, 14.9);
                assert_eq!(pos.lon, -92.25);
                assert_eq!(pos.speed, Some(10.0));
                assert_eq!(pos.heading, None);
                assert_eq!(pos.seq, Some(0));
                assert!(pos.timestamp >= antes, "默认 timestamp 应不早于解码前时刻");
                assert!(pos.validar().is_ok(), "合法载荷不应校验失败");
            }
            otro => panic!("预期 POS 变体，实际得到: {:?}", otro),
        }
    }

    #[test]
    /// 测试 POS 帧携带 ISO 时间戳（含 Z 后缀）的解析。
    fn test_parse_pos_frame_with_explicit_timestamp() {
        let frame = DeviceFrame::parse(
            r#"{"type":"POS","lat":0.0,"lon":0.0,"timestamp":"2026-08-05T12:00:00Z"}"#,
        )
        .expect("带时间戳的 POS 帧解码失败");
        match frame {
            DeviceFrame::Pos(pos) => {
                assert_eq!(pos.timestamp.to_rfc3339(), "2026-08-05T12:00:00+00:00");
            }
            otro => panic!("预期 POS 变体，实际得到: {:?}", otro),
        }
    }

    #[test]
    /// 测试解码失败的三种分类与对应的 ERROR 码。
    fn test_decode_error_classification() {
        let err = DeviceFrame::parse("esto no es json").unwrap_err();
        assert!(matches!(err, FrameDecodeError::InvalidJson(_)));
        assert_eq!(err.code(), "INVALID_JSON");

        let err = DeviceFrame::parse(r#"{"type":"TELEPORT"}"#).unwrap_err();
        assert!(matches!(err, FrameDecodeError::UnknownType(ref t) if t == "TELEPORT"));
        assert_eq!(err.code(), "UNKNOWN_MESSAGE_TYPE");

        // 类型缺失同样归为未知类型。
        let err = DeviceFrame::parse(r#"{"lat":1.0}"#).unwrap_err();
        assert!(matches!(err, FrameDecodeError::UnknownType(ref t) if t.is_empty()));

        // POS 是已知类型，但缺少必填字段。
        let err = DeviceFrame::parse(r#"{"type":"POS","lat":1.0}"#).unwrap_err();
        assert!(matches!(err, FrameDecodeError::InvalidPayload { ref tipo, .. } if tipo == "POS"));
        assert_eq!(err.code(), "INVALID_PAYLOAD");
    }

    #[test]
    /// 测试位置载荷的范围校验。
    fn test_posicion_payload_validation() {
        let base = PosicionPayload {
            lat: 0.0,
            lon: 0.0,
            speed: None,
            heading: None,
            timestamp: Utc::now(),
            seq: None,
        };
        assert!(base.validar().is_ok());
        assert!(PosicionPayload { lat: 90.5, ..base.clone() }.validar().is_err());
        assert!(PosicionPayload { lon: -181.0, ..base.clone() }.validar().is_err());
        assert!(PosicionPayload { speed: Some(-1.0), ..base.clone() }.validar().is_err());
        assert!(PosicionPayload { heading: Some(360.0), ..base.clone() }.validar().is_err());
        assert!(PosicionPayload { heading: Some(359.9), ..base }.validar().is_ok());
    }

    #[test]
    /// 测试服务端出站帧的 `type` 判别值是约定的线格式字符串。
    fn test_server_frame_discriminators() {
        let state = DashboardServerFrame::ConnectionState {
            unidad_id: "U1".to_string(),
            is_connected: true,
            last_ping: None,
        };
        let json = serde_json::to_string(&state).expect("CONNECTION_STATE 序列化失败");
        assert!(
            json.contains(r#""type":"CONNECTION_STATE""#),
            "CONNECTION_STATE 判别值不正确: {}",
            json
        );
        assert!(json.contains(r#""is_connected":true"#));

        let ack = DeviceServerFrame::Ack {
            posicion_id: 7,
            event_id: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&ack).expect("ACK 序列化失败");
        assert!(json.contains(r#""type":"ACK""#), "ACK 判别值不正确: {}", json);
        assert!(json.contains(r#""event_id":null"#), "event_id 缺省应序列化为 null");
    }

    #[test]
    /// 测试 SUBSCRIBE / UNSUBSCRIBE 的解码。
    fn test_parse_dashboard_frames() {
        let frame = DashboardFrame::parse(r#"{"type":"SUBSCRIBE","unidad_ids":["U1","U2"]}"#)
            .expect("SUBSCRIBE 帧解码失败");
        assert_eq!(
            frame,
            DashboardFrame::Subscribe {
                unidad_ids: vec!["U1".to_string(), "U2".to_string()],
            }
        );
        let frame = DashboardFrame::parse(r#"{"type":"PING"}"#).expect("PING 帧解码失败");
        assert_eq!(frame, DashboardFrame::Ping);
    }
}
