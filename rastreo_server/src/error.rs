use thiserror::Error;

/// 应用的主要错误类型
///
/// 变体划分遵循传输层的错误学：协议错误与入库错误是可恢复的
/// （回复 ERROR 帧，连接保持打开）；认证错误只对握手致命
/// （以专用关闭码关闭连接）；投递错误是局部的（仅影响单个订阅者）。
#[derive(Error, Debug)]
pub enum AppError {
    #[error("协议错误: {0}")]
    Protocol(String),

    #[error("认证错误: {0}")]
    Auth(String),

    #[error("位置入库错误: {0}")]
    Ingest(String),

    #[error("推送投递错误: {0}")]
    Delivery(String),

    #[error("WebSocket 服务错误: {0}")]
    WebSocketService(String),

    #[error("配置错误: {0}")]
    Config(String),
}
