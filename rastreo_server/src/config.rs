use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

/// WebSocket 服务的默认主机地址
pub const DEFAULT_WS_HOST: &str = "0.0.0.0";
/// WebSocket 服务的默认端口号
pub const DEFAULT_WS_PORT: u16 = 8090;

/// WebSocket 服务端详细配置结构体
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WebSocketConfig {
    /// WebSocket 服务绑定的主机地址
    pub host: String,
    /// WebSocket 服务监听的端口号
    pub port: u16,
    /// 设备端完成 AUTH 握手的最长等待时间（单位：秒）
    pub auth_timeout_seconds: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_WS_HOST.to_string(), // 默认监听所有网络接口
            port: DEFAULT_WS_PORT,
            auth_timeout_seconds: 30, // 默认 30 秒内未完成认证则关闭连接
        }
    }
}

/// 设备凭证（token）相关配置
///
/// TTL 与轮换阈值共同决定宽限期：轮换在旧凭证自然过期之前发生，
/// 且不吊销旧凭证，新旧两枚在重叠窗口内均可独立通过校验。
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TokenConfig {
    /// 新凭证的有效期（单位：秒）；0 表示不设过期时间
    pub ttl_seconds: i64,
    /// 距过期不足该分钟数时触发轮换
    pub renewal_threshold_minutes: i64,
    /// 轮换检查的周期（单位：秒）
    pub renewal_check_interval_seconds: u64,
    /// 告知设备的宽限期天数（随 TOKEN_RENEWAL 帧下发）
    pub grace_period_days: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 600,                  // 测试: 600 (10 分钟) | 生产: 2592000 (30 天)
            renewal_threshold_minutes: 7,      // 测试: 7 分钟 | 生产: 10080 分钟 (7 天)
            renewal_check_interval_seconds: 60, // 测试: 60 (1 分钟) | 生产: 3600 (1 小时)
            grace_period_days: 7,
        }
    }
}

/// 应用的主配置结构体
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AppConfig {
    /// WebSocket 服务的相关配置
    pub websocket: WebSocketConfig,
    /// 凭证轮换相关配置
    pub token: TokenConfig,
}

// 全局静态应用配置实例
static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// 加载或创建应用配置文件
fn load_or_create_config() -> AppConfig {
    let config_file_path = get_config_file_path();

    match fs::read_to_string(&config_file_path) {
        Ok(content) => {
            // 文件读取成功
            match serde_json::from_str::<AppConfig>(&content) {
                Ok(config) => {
                    info!(
                        "[配置模块] 已成功从配置文件 {:?} 加载应用配置。",
                        config_file_path
                    );
                    config
                }
                Err(e) => {
                    warn!(
                        "[配置模块] 警告：从 {:?} 反序列化配置失败: {}. 文件可能已损坏。将使用默认配置并尝试覆盖。",
                        config_file_path, e
                    );
                    let default_config = AppConfig::default();
                    save_config(&default_config, &config_file_path);
                    default_config
                }
            }
        }
        Err(e) => {
            // 文件读取失败
            info!(
                "[配置模块] 未在 {:?} 找到配置文件或读取时发生错误 (错误: {}). 将使用默认配置并尝试创建新文件。",
                config_file_path, e
            );
            let default_config = AppConfig::default();
            save_config(&default_config, &config_file_path);
            default_config
        }
    }
}

/// 获取配置文件路径（当前工作目录下的 app_settings.json）
fn get_config_file_path() -> PathBuf {
    let current_dir = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    current_dir.join("app_settings.json")
}

/// 保存配置到文件
fn save_config(config: &AppConfig, path: &PathBuf) {
    match serde_json::to_string_pretty(config) {
        Ok(content) => {
            if let Err(e) = fs::write(path, content) {
                warn!("[配置模块] 错误：将配置写入文件 {:?} 时失败: {}", path, e);
            } else {
                info!("[配置模块] 已成功将当前配置（可能是默认配置）保存到 {:?}.", path);
            }
        }
        Err(e) => {
            warn!("[配置模块] 错误：序列化配置信息以便保存时失败: {}", e);
        }
    }
}

/// 初始化全局应用配置
pub fn init_config() {
    let loaded_config = load_or_create_config();
    if APP_CONFIG.set(loaded_config).is_err() {
        warn!("[配置模块] 全局应用配置 APP_CONFIG 已被初始化，本次 init_config 调用未覆盖已有配置。请检查初始化流程。");
    }
    info!("[配置模块] 应用配置已成功初始化完毕。");
}

/// 获取已加载的全局应用配置
pub fn get_config() -> &'static AppConfig {
    APP_CONFIG
        .get()
        .expect("[配置模块] 全局应用配置尚未初始化，请先调用 init_config()")
}

/// 校验凭证配置的一致性。
///
/// 返回发现的问题列表（空列表表示配置合理），由启动流程统一记入日志。
pub fn validate_token_config(cfg: &TokenConfig) -> Vec<String> {
    let mut errores = Vec::new();

    let ttl_minutos = cfg.ttl_seconds as f64 / 60.0;

    // TTL 必须大于轮换阈值，否则新凭证一创建就处于"待轮换"状态。
    if cfg.ttl_seconds > 0 && ttl_minutos <= cfg.renewal_threshold_minutes as f64 {
        errores.push(format!(
            "TTL ({:.1} 分钟) 必须大于轮换阈值 ({} 分钟)",
            ttl_minutos, cfg.renewal_threshold_minutes
        ));
    }

    if cfg.renewal_threshold_minutes <= 0 {
        errores.push("轮换阈值必须大于 0".to_string());
    }

    // TTL 至少应为阈值的 1.5 倍，宽限期才有实际意义。
    if cfg.ttl_seconds > 0 && ttl_minutos < cfg.renewal_threshold_minutes as f64 * 1.5 {
        errores.push(format!(
            "TTL ({:.1} 分钟) 过于接近轮换阈值 ({} 分钟)，应至少为其 1.5 倍",
            ttl_minutos, cfg.renewal_threshold_minutes
        ));
    }

    errores
}

/// 生成凭证配置的摘要文本，供启动日志输出。
pub fn token_config_summary(cfg: &TokenConfig) -> String {
    let modo = if cfg.ttl_seconds > 0 && cfg.ttl_seconds < 86400 {
        "TESTING"
    } else {
        "PRODUCCION"
    };
    format!(
        "modo={}, ttl={}, umbral_renovacion={} min, intervalo_chequeo={}, gracia={} días",
        modo,
        format_seconds(cfg.ttl_seconds),
        cfg.renewal_threshold_minutes,
        format_seconds(cfg.renewal_check_interval_seconds as i64),
        cfg.grace_period_days
    )
}

/// 将秒数转换为可读文本
fn format_seconds(seconds: i64) -> String {
    if seconds < 3600 {
        format!("{} minutos", seconds / 60)
    } else if seconds < 86400 {
        format!("{} horas", seconds / 3600)
    } else {
        format!("{} días", seconds / 86400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// 测试默认凭证配置应当通过一致性校验。
    fn test_default_token_config_is_valid() {
        let errores = validate_token_config(&TokenConfig::default());
        assert!(errores.is_empty(), "默认配置不应产生校验问题: {:?}", errores);
    }

    #[test]
    /// 测试 TTL 不大于轮换阈值时应被检出。
    fn test_ttl_must_exceed_threshold() {
        let cfg = TokenConfig {
            ttl_seconds: 300, // 5 分钟
            renewal_threshold_minutes: 7,
            ..TokenConfig::default()
        };
        let errores = validate_token_config(&cfg);
        assert!(!errores.is_empty(), "TTL 小于阈值时应产生校验问题");
    }

    #[test]
    /// 测试轮换阈值必须为正数。
    fn test_threshold_must_be_positive() {
        let cfg = TokenConfig {
            renewal_threshold_minutes: 0,
            ..TokenConfig::default()
        };
        let errores = validate_token_config(&cfg);
        assert!(errores.iter().any(|e| e.contains("大于 0")), "阈值为 0 应被检出");
    }

    #[test]
    /// 测试 TTL 为 0（永不过期）时不触发 TTL 相关的告警。
    fn test_zero_ttl_skips_ttl_checks() {
        let cfg = TokenConfig {
            ttl_seconds: 0,
            ..TokenConfig::default()
        };
        let errores = validate_token_config(&cfg);
        assert!(errores.is_empty(), "永不过期的配置不应产生校验问题: {:?}", errores);
    }
}
