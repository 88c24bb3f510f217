// rastreo_ws_utils/src/client/mod.rs

//! WebSocket 客户端模块。
//!
//! 提供面向集成测试与模拟器的客户端传输层：连接指定 URL、
//! 逐帧发送 JSON 消息、接收文本帧或连接关闭事件（含应用层关闭码）。

pub mod transport;
