use log::{error, info, warn, LevelFilter};
use rastreo_server::auth::{CredentialStore, MemoryCredentialStore};
use rastreo_server::config::{token_config_summary, validate_token_config};
use rastreo_server::ingest::{IngestGateway, MemoryIngestGateway};
use rastreo_server::ws_server::connection_registry::ConnectionRegistry;
use rastreo_server::ws_server::service::WsService;
use std::env;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // 初始化日志记录器
    env_logger::Builder::new()
        .filter_level(LevelFilter::Info)
        .format_timestamp_millis()
        .init();
    info!("[主程序] 日志系统已成功初始化 (env_logger)，默认级别: Info。");

    // 初始化应用配置
    rastreo_server::config::init_config();
    let app_config = rastreo_server::config::get_config().clone();

    // 启动时输出凭证配置摘要，并检查其一致性
    info!(
        "[主程序] 凭证配置: {}",
        token_config_summary(&app_config.token)
    );
    for problema in validate_token_config(&app_config.token) {
        warn!("[主程序] 凭证配置问题: {}", problema);
    }

    // 创建连接注册表
    let registry = Arc::new(ConnectionRegistry::new());
    info!("[主程序] 连接注册表 (ConnectionRegistry) 已创建。");

    // 外部协作方的进程内实现；生产部署以同一 trait 接口替换为数据层实现。
    let credenciales: Arc<dyn CredentialStore> = Arc::new(MemoryCredentialStore::new());
    let ingesta: Arc<dyn IngestGateway> = Arc::new(MemoryIngestGateway::new());
    info!("[主程序] 凭证存储与入库网关（进程内实现）已装配。");

    // 可选：按环境变量播种一枚演示凭证，便于不经管理面直接联调设备端。
    if let (Ok(unidad_id), Ok(device_id)) = (
        env::var("RASTREO_DEMO_UNIDAD"),
        env::var("RASTREO_DEMO_DEVICE"),
    ) {
        match credenciales
            .create(&unidad_id, &device_id, app_config.token.ttl_seconds, false)
            .await
        {
            Ok(creado) => info!(
                "[主程序] 演示凭证已创建: unidad_id={}, device_id={}, token_id={}, token={} (仅此一次显示，请妥善保存)",
                unidad_id, device_id, creado.token_id, creado.plaintext
            ),
            Err(e) => error!("[主程序] 创建演示凭证失败: {}", e),
        }
    }

    // 启动 WebSocket 服务
    let ws_service = WsService::new(app_config, registry, credenciales, ingesta);
    info!("[主程序] 正在启动 WebSocket 服务...");
    if let Err(e) = ws_service.start().await {
        error!("[主程序] 致命错误：启动 WebSocket 服务时发生严重问题: {}", e);
    }
}
