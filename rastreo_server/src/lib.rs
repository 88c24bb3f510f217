//! `rastreo_server` 服务端核心库。
//!
//! 本 Crate 是车辆监控平台的实时遥测传输层：经认证的 GPS 设备通过
//! 持久 WebSocket 连接上报位置，更新被实时扇出给订阅了对应单元的
//! 看板客户端，同时凭证轮换在不打断在线会话的前提下于后台透明进行。
//! 投递语义为单进程、至多一次；持久化与重投递不在本层职责内。
//!
//! 主要模块包括：
//! - `auth`: 设备凭证存储契约（外部协作方）与轮换判定逻辑。
//! - `config`: 应用配置的加载、访问与一致性校验。
//! - `error`: 应用错误类型（协议/认证/入库/投递错误学）。
//! - `ingest`: 位置入库与事件检测网关契约（外部协作方）。
//! - `ws_server`: WebSocket 服务端 —— 连接注册表、设备/看板协议
//!   状态机与监听入口。

pub mod auth;
pub mod config;
pub mod error;
pub mod ingest;
pub mod ws_server;
