//! `rastreo_ws_utils` 是为车辆监控平台提供 WebSocket 通信实用功能的 Rust Crate。
//!
//! 线格式约定"每帧一个携带 `type` 字段的 JSON 对象"，具体的帧类型定义
//! 在 `rastreo_models` 中；本 crate 只负责传输层：监听、握手（捕获升级
//! 请求的路径以便上层区分设备端与看板端入口）、逐帧收发以及带自定义
//! 应用关闭码的连接关闭。
//!
//! 主要模块包括：
//! - `error`: 定义库中使用的统一错误类型 `WsError`。
//! - `server`: 服务器端传输层（监听循环、`ConnectionHandler`、收帧函数）。
//! - `client`: 客户端传输层，主要供集成测试与模拟器使用。

pub mod client;
pub mod error;
pub mod server;
