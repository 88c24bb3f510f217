//! `rastreo_models` 公共模型库 crate。
//!
//! 本 crate 集中定义了车辆监控平台各 Rust 组件（`rastreo_server` 服务端、
//! 集成测试客户端以及潜在的模拟器）之间共享的核心数据结构和枚举类型。
//!
//! 主要包含以下类型的模型：
//! - **WebSocket 消息帧 (`ws_frames`)**: 设备端与看板端双向通信的全部消息帧。
//!   每一帧是一个带有 `type` 判别字段的 JSON 对象；本 crate 将每个方向的
//!   消息集合建模为封闭的标签联合（`#[serde(tag = "type")]` 枚举），
//!   在边界处一次性解码，之后由调用方穷尽匹配。
//! - **通用枚举 (`enums`)**: 客户端角色、检测事件类型等项目中广泛使用的
//!   枚举定义。
//!
//! 设计原则：
//! - 所有共享模型都派生 `Serialize`, `Deserialize`, `Debug`, `Clone`；
//!   需要在测试中比较的类型另派生 `PartialEq`。
//! - 线格式（字段名、`type` 判别值）是对外契约的一部分，不随内部重构变化。

pub mod enums;
pub mod ws_frames;
