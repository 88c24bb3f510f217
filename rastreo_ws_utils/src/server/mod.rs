// rastreo_ws_utils/src/server/mod.rs

//! WebSocket 服务端模块。
//!
//! 本模块负责服务器端传输层：
//! - **监听与握手**: 在指定地址上接受 TCP 连接并完成 WebSocket 升级握手，
//!   同时捕获升级请求的路径（例如 `/ws/device`、`/ws/dashboard`），
//!   供上层按入口路由到不同的协议状态机。
//! - **逐帧收发**: 为每个连接提供发送端封装 `ConnectionHandler`
//!   （帧序列化 + 带自定义关闭码的关闭）与接收函数 `receive_text`。
//!
//! 具体实现位于 `transport` 子模块。

pub mod transport;
