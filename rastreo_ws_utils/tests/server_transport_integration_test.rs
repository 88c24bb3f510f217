// rastreo_ws_utils/tests/server_transport_integration_test.rs

//! 传输层集成测试：本地启动真实监听器，用本库的客户端传输驱动，
//! 验证路径捕获、JSON 帧回显与应用层关闭码三项能力。

use log::{info, LevelFilter};
use rastreo_ws_utils::client::transport::{connect_client, ClientEvent};
use rastreo_ws_utils::server::transport::{receive_text, start_server};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;

// 辅助函数：初始化日志，仅用于测试，避免多次初始化。
fn init_test_logger() {
    let _ = env_logger::builder()
        .filter_level(LevelFilter::Info)
        .is_test(true)
        .try_init();
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct EcoFrame {
    #[serde(rename = "type")]
    tipo: String,
    contenido: String,
}

/// 选一个空闲端口：绑定到 0 端口再立即释放。
async fn puerto_libre() -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("无法绑定到随机端口");
    let addr = listener.local_addr().expect("无法获取本地监听地址");
    drop(listener);
    addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_path_capture_echo_and_close_code() {
    init_test_logger();

    let addr = puerto_libre().await;
    info!("[测试主线程] 服务器将监听地址: {}", addr);

    // 服务端：把升级路径塞进回显帧返回给客户端；
    // 若路径为 /ws/rechazo 则直接以 4001 关闭。
    let server_handle = tokio::spawn(async move {
        type Receptor =
            futures_util::stream::SplitStream<rastreo_ws_utils::server::transport::WsStream>;
        let on_connect = move |mut handler: rastreo_ws_utils::server::transport::ConnectionHandler,
                               mut receiver: Receptor,
                               path: String,
                               _peer: std::net::SocketAddr| {
            async move {
                if path == "/ws/rechazo" {
                    let _ = handler.close_with(4001, "rechazado").await;
                    return;
                }
                while let Some(Ok(text)) = receive_text(&mut receiver).await {
                    let entrante: EcoFrame =
                        serde_json::from_str(&text).expect("服务端解码回显帧失败");
                    let saliente = EcoFrame {
                        tipo: "ECO".to_string(),
                        contenido: format!("{}@{}", entrante.contenido, path),
                    };
                    if handler.send_frame(&saliente).await.is_err() {
                        break;
                    }
                }
            }
        };
        let _ = start_server(addr.to_string(), on_connect).await;
    });

    tokio::time::sleep(Duration::from_millis(200)).await;

    // 1. 路径捕获 + 回显。
    let mut conn = connect_client(format!("ws://{}/ws/echo", addr))
        .await
        .expect("客户端连接失败");
    conn.send_frame(&EcoFrame {
        tipo: "ECO".to_string(),
        contenido: "hola".to_string(),
    })
    .await
    .expect("客户端发送帧失败");

    match timeout(Duration::from_secs(5), conn.receive_event())
        .await
        .expect("等待回显超时")
        .expect("接收回显事件失败")
    {
        ClientEvent::Text(text) => {
            let frame: EcoFrame = serde_json::from_str(&text).expect("客户端解码回显帧失败");
            assert_eq!(
                frame.contenido, "hola@/ws/echo",
                "回显内容应包含服务端捕获到的升级路径"
            );
        }
        otro => panic!("预期收到文本帧，实际得到: {:?}", otro),
    }

    // 2. 应用层关闭码对客户端可见。
    let mut conn = connect_client(format!("ws://{}/ws/rechazo", addr))
        .await
        .expect("客户端连接失败 (rechazo)");
    match timeout(Duration::from_secs(5), conn.receive_event())
        .await
        .expect("等待关闭事件超时")
        .expect("接收关闭事件失败")
    {
        ClientEvent::Closed { code } => {
            assert_eq!(code, Some(4001), "应收到应用层关闭码 4001");
        }
        otro => panic!("预期连接被关闭，实际得到: {:?}", otro),
    }

    server_handle.abort();
}
