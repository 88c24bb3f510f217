//! 通用枚举模块。
//!
//! 本模块定义了在平台多个组件之间共享的通用枚举类型，
//! 以保证对客户端角色、事件类型等概念在整个系统中有一致的表示。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 表示 WebSocket 客户端在系统中所扮演的角色。
///
/// 服务端根据角色决定连接走哪条协议状态机：
/// 设备端走认证/上报协议，看板端走订阅/推送协议。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientRole {
    /// GPS 设备端客户端，绑定到某个运输单元（unidad）。
    Device,
    /// 看板（监控）客户端，按单元订阅实时推送。
    Dashboard,
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// 检测事件类型。
///
/// 由数据层的规则检测函数产生，服务端只负责透传到订阅的看板。
/// 线格式上序列化为全大写下划线形式（与既有客户端约定一致）。
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventoTipo {
    /// 偏离指定路线。
    OutOfBound,
    /// 超过阈值的长时间停车。
    StopLong,
    /// 超速。
    Speeding,
    /// 一般告警。
    GeneralAlert,
    /// 信息性事件。
    Info,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// 测试 `EventoTipo` 的线格式是否为约定的全大写下划线字符串。
    fn test_evento_tipo_wire_format() {
        let casos = [
            (EventoTipo::OutOfBound, "\"OUT_OF_BOUND\""),
            (EventoTipo::StopLong, "\"STOP_LONG\""),
            (EventoTipo::Speeding, "\"SPEEDING\""),
            (EventoTipo::GeneralAlert, "\"GENERAL_ALERT\""),
            (EventoTipo::Info, "\"INFO\""),
        ];
        for (tipo, esperado) in casos {
            let json = serde_json::to_string(&tipo).expect("EventoTipo 序列化失败");
            assert_eq!(json, esperado, "{:?} 的线格式与预期不符", tipo);
            let de: EventoTipo =
                serde_json::from_str(&json).expect("EventoTipo 反序列化失败");
            assert_eq!(de, tipo, "{:?} 反序列化后与原始值不相等", tipo);
        }
    }

    #[test]
    /// 测试 `ClientRole` 的 Display 输出（用于日志）。
    fn test_client_role_display() {
        assert_eq!(ClientRole::Device.to_string(), "Device");
        assert_eq!(ClientRole::Dashboard.to_string(), "Dashboard");
    }
}
