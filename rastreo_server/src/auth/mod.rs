//! 认证与设备凭证服务。
//!
//! 凭证（token）是设备的身份证明：明文只在创建时返回一次，
//! 之后存储与比对的都是 SHA-256 哈希。同一设备在轮换重叠窗口
//! （宽限期）内可以同时持有多枚未吊销的凭证，新旧两枚各自独立可校验，
//! 直到旧的自然过期；这容忍了尚未持久化新密钥的设备。
//!
//! 本模块定义外部协作方 [`CredentialStore`] 的契约，以及一个进程内的
//! 参考实现 [`MemoryCredentialStore`]（用于默认装配与测试）。
//! 生产部署以同样的 trait 接口替换为数据层实现。

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AppError;

/// 设备凭证记录。
///
/// 只会经历两类变更：`revoked` 被置位（吊销），以及校验成功时的
/// `last_used` 触达；其余字段创建后不再更新，记录也不会被本核心删除
/// （过期记录的清理属于外部运维职责）。
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: i64,
    pub unidad_id: String,
    pub device_id: String,
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
    /// `None` 表示永不过期。
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub last_used: Option<DateTime<Utc>>,
}

impl Credential {
    /// 判断凭证在 `now` 时刻是否已过期（无过期时间则永不过期）。
    pub fn expirado(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if exp <= now)
    }
}

/// 凭证创建的结果；`plaintext` 明文只在此处出现一次，之后不可再取回。
#[derive(Debug, Clone)]
pub struct TokenCreado {
    pub plaintext: String,
    pub token_id: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

/// 设备凭证存储的契约（外部协作方）。
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// 校验某单元的凭证明文（要求未吊销、未过期、哈希一致）。
    /// 校验成功时触达该凭证的 `last_used`。
    async fn verify(&self, unidad_id: &str, plaintext: &str) -> bool;

    /// 通过哈希反查持有该凭证的单元。
    /// 只匹配未吊销且（若设有过期时间）尚未过期的记录。
    async fn find_unidad_by_token(&self, plaintext: &str) -> Option<String>;

    /// 为设备新建一枚凭证。
    ///
    /// `ttl_seconds <= 0` 表示不设过期时间。`revoke_old` 为 true 时，
    /// 与插入同一原子操作内吊销该设备既有的全部凭证；为 false 时
    /// 保留旧凭证（轮换宽限期依赖这一行为）。
    async fn create(
        &self,
        unidad_id: &str,
        device_id: &str,
        ttl_seconds: i64,
        revoke_old: bool,
    ) -> Result<TokenCreado, AppError>;

    /// 按明文吊销一枚凭证；返回是否确有记录被吊销。
    async fn revoke(&self, plaintext: &str) -> bool;

    /// 吊销某设备的全部凭证；返回吊销数量。
    async fn revoke_all_for_device(&self, unidad_id: &str, device_id: &str) -> usize;

    /// 返回该设备最近一条未吊销的凭证。
    ///
    /// 即便该凭证已经过期也必须返回，轮换判定逻辑需要它来计算
    /// 距过期的剩余时间。
    async fn most_recent_active(&self, unidad_id: &str, device_id: &str) -> Option<Credential>;
}

/// 轮换判定：距过期剩余分钟数不超过阈值即视为到期应轮换。
///
/// 无过期时间的凭证永不触发轮换。
pub fn renewal_due(
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold_minutes: i64,
) -> bool {
    match expires_at {
        None => false,
        Some(exp) => minutos_hasta_expiracion(exp, now) <= threshold_minutes as f64,
    }
}

/// 距过期的剩余分钟数（可为负，表示已过期）。
pub fn minutos_hasta_expiracion(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (expires_at - now).num_seconds() as f64 / 60.0
}

/// 计算凭证明文的存储哈希（SHA-256，十六进制编码）。
fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// 生成新的凭证明文（64 个十六进制字符）。
fn generar_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// `CredentialStore` 的进程内实现。
///
/// 所有记录保存在一个读写锁保护的向量里；`create` 在一次写锁内完成
/// 可选的旧凭证吊销与新记录插入，保证两者的原子性。
pub struct MemoryCredentialStore {
    registros: RwLock<Vec<Credential>>,
    next_id: AtomicI64,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self {
            registros: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// 当前记录总数（含已吊销/过期），供运维与测试查看。
    pub async fn total_registros(&self) -> usize {
        self.registros.read().await.len()
    }
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn verify(&self, unidad_id: &str, plaintext: &str) -> bool {
        let hash = hash_token(plaintext);
        let now = Utc::now();
        let mut registros = self.registros.write().await;
        let valido = registros.iter_mut().find(|c| {
            c.unidad_id == unidad_id && !c.revoked && !c.expirado(now) && c.secret_hash == hash
        });
        match valido {
            Some(cred) => {
                cred.last_used = Some(now);
                info!("[凭证存储] 凭证校验通过: unidad_id={}", unidad_id);
                true
            }
            None => {
                warn!("[凭证存储] 凭证校验失败: unidad_id={}", unidad_id);
                false
            }
        }
    }

    async fn find_unidad_by_token(&self, plaintext: &str) -> Option<String> {
        let hash = hash_token(plaintext);
        let now = Utc::now();
        let registros = self.registros.read().await;
        registros
            .iter()
            .find(|c| !c.revoked && !c.expirado(now) && c.secret_hash == hash)
            .map(|c| c.unidad_id.clone())
    }

    async fn create(
        &self,
        unidad_id: &str,
        device_id: &str,
        ttl_seconds: i64,
        revoke_old: bool,
    ) -> Result<TokenCreado, AppError> {
        let plaintext = generar_token();
        let now = Utc::now();
        let expires_at = if ttl_seconds > 0 {
            Some(now + Duration::seconds(ttl_seconds))
        } else {
            None
        };
        let token_id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let mut registros = self.registros.write().await;
        if revoke_old {
            let mut revocados = 0usize;
            for cred in registros
                .iter_mut()
                .filter(|c| c.unidad_id == unidad_id && c.device_id == device_id && !c.revoked)
            {
                cred.revoked = true;
                revocados += 1;
            }
            debug!(
                "[凭证存储] 创建新凭证前吊销旧凭证 {} 枚: unidad_id={}, device_id={}",
                revocados, unidad_id, device_id
            );
        }
        registros.push(Credential {
            id: token_id,
            unidad_id: unidad_id.to_string(),
            device_id: device_id.to_string(),
            secret_hash: hash_token(&plaintext),
            created_at: now,
            expires_at,
            revoked: false,
            last_used: None,
        });
        info!(
            "[凭证存储] 已创建凭证: unidad_id={}, device_id={}, token_id={}, expires_at={:?}",
            unidad_id, device_id, token_id, expires_at
        );

        Ok(TokenCreado {
            plaintext,
            token_id,
            expires_at,
        })
    }

    async fn revoke(&self, plaintext: &str) -> bool {
        let hash = hash_token(plaintext);
        let mut registros = self.registros.write().await;
        match registros
            .iter_mut()
            .find(|c| !c.revoked && c.secret_hash == hash)
        {
            Some(cred) => {
                cred.revoked = true;
                info!("[凭证存储] 凭证已吊销: token_id={}", cred.id);
                true
            }
            None => {
                warn!("[凭证存储] 吊销失败：未找到对应的未吊销凭证");
                false
            }
        }
    }

    async fn revoke_all_for_device(&self, unidad_id: &str, device_id: &str) -> usize {
        let mut registros = self.registros.write().await;
        let mut revocados = 0usize;
        for cred in registros
            .iter_mut()
            .filter(|c| c.unidad_id == unidad_id && c.device_id == device_id && !c.revoked)
        {
            cred.revoked = true;
            revocados += 1;
        }
        info!(
            "[凭证存储] 已吊销设备的全部凭证: unidad_id={}, device_id={}, 数量={}",
            unidad_id, device_id, revocados
        );
        revocados
    }

    async fn most_recent_active(&self, unidad_id: &str, device_id: &str) -> Option<Credential> {
        let registros = self.registros.read().await;
        // 注意：按创建时间取最新的一条未吊销记录，过期与否不在筛选条件内，
        // 轮换判定需要拿到已过期的记录来计算剩余时间。
        registros
            .iter()
            .filter(|c| c.unidad_id == unidad_id && c.device_id == device_id && !c.revoked)
            .max_by_key(|c| (c.created_at, c.id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// 轮换判定的三种基准情形。
    fn test_renewal_due_cases() {
        let now = Utc::now();
        // 距过期 5 分钟，阈值 7 分钟 => 到期应轮换
        assert!(renewal_due(Some(now + Duration::minutes(5)), now, 7));
        // 距过期 10 分钟，阈值 7 分钟 => 未到期
        assert!(!renewal_due(Some(now + Duration::minutes(10)), now, 7));
        // 无过期时间 => 永不轮换
        assert!(!renewal_due(None, now, 7));
        // 已过期的凭证同样判定为到期
        assert!(renewal_due(Some(now - Duration::minutes(1)), now, 7));
    }

    #[tokio::test]
    /// 明文只返回一次，且满足协议要求的最小长度。
    async fn test_create_returns_plaintext_once() {
        let store = MemoryCredentialStore::new();
        let creado = store
            .create("U1", "dev-01", 600, false)
            .await
            .expect("创建凭证失败");
        assert!(creado.plaintext.len() >= 32, "凭证明文长度应不小于 32");
        assert!(creado.expires_at.is_some(), "正 TTL 应产生过期时间");
        // 存储侧只保留哈希。
        let registros = store.registros.read().await;
        assert!(
            registros.iter().all(|c| c.secret_hash != creado.plaintext),
            "存储中不应出现凭证明文"
        );
    }

    #[tokio::test]
    /// 宽限期特性：`revoke_old=false` 创建新凭证后，新旧两枚均可独立校验。
    async fn test_grace_period_keeps_both_verifiable() {
        let store = MemoryCredentialStore::new();
        let viejo = store.create("U1", "dev-01", 600, false).await.unwrap();
        let nuevo = store.create("U1", "dev-01", 600, false).await.unwrap();

        assert!(store.verify("U1", &viejo.plaintext).await, "旧凭证应仍然有效");
        assert!(store.verify("U1", &nuevo.plaintext).await, "新凭证应有效");

        // 对比：`revoke_old=true` 只留下最新一枚。
        let tercero = store.create("U1", "dev-01", 600, true).await.unwrap();
        assert!(!store.verify("U1", &viejo.plaintext).await, "吊销后旧凭证应失效");
        assert!(!store.verify("U1", &nuevo.plaintext).await, "吊销后旧凭证应失效");
        assert!(store.verify("U1", &tercero.plaintext).await, "最新凭证应有效");
    }

    #[tokio::test]
    /// `most_recent_active` 必须返回已过期但未吊销的最新记录。
    async fn test_most_recent_active_returns_expired_row() {
        let store = MemoryCredentialStore::new();
        // TTL 为负值直接构造一条已过期记录。
        let creado = store.create("U1", "dev-01", 1, false).await.unwrap();
        {
            // 将过期时间拨到过去，模拟已过期。
            let mut registros = store.registros.write().await;
            registros[0].expires_at = Some(Utc::now() - Duration::minutes(5));
        }
        let cred = store
            .most_recent_active("U1", "dev-01")
            .await
            .expect("已过期但未吊销的记录应当返回");
        assert_eq!(cred.id, creado.token_id);
        assert!(cred.expirado(Utc::now()), "该记录应处于过期状态");

        // 过期凭证不可再通过校验，也不可反查单元。
        assert!(!store.verify("U1", &creado.plaintext).await);
        assert!(store.find_unidad_by_token(&creado.plaintext).await.is_none());
    }

    #[tokio::test]
    /// 通过哈希反查单元，以及吊销后的行为。
    async fn test_find_unidad_and_revoke() {
        let store = MemoryCredentialStore::new();
        let creado = store.create("U7", "dev-09", 600, false).await.unwrap();

        assert_eq!(
            store.find_unidad_by_token(&creado.plaintext).await.as_deref(),
            Some("U7"),
            "应能通过凭证明文反查到所属单元"
        );

        assert!(store.revoke(&creado.plaintext).await, "吊销应成功");
        assert!(!store.revoke(&creado.plaintext).await, "重复吊销应返回 false");
        assert!(store.find_unidad_by_token(&creado.plaintext).await.is_none());
        assert!(!store.verify("U7", &creado.plaintext).await);
    }

    #[tokio::test]
    /// 吊销设备的全部凭证：只影响该设备，返回吊销数量。
    async fn test_revoke_all_for_device() {
        let store = MemoryCredentialStore::new();
        let a = store.create("U1", "dev-01", 600, false).await.unwrap();
        let b = store.create("U1", "dev-01", 600, false).await.unwrap();
        let ajeno = store.create("U1", "dev-02", 600, false).await.unwrap();

        assert_eq!(store.revoke_all_for_device("U1", "dev-01").await, 2);
        assert!(!store.verify("U1", &a.plaintext).await);
        assert!(!store.verify("U1", &b.plaintext).await);
        assert!(store.verify("U1", &ajeno.plaintext).await, "其他设备的凭证不受影响");
        assert!(store.most_recent_active("U1", "dev-01").await.is_none());
        assert_eq!(store.revoke_all_for_device("U1", "dev-01").await, 0, "重复吊销应为 0");
    }

    #[tokio::test]
    /// `ttl_seconds == 0` 创建永不过期的凭证，且永不触发轮换。
    async fn test_zero_ttl_never_expires() {
        let store = MemoryCredentialStore::new();
        let creado = store.create("U1", "dev-01", 0, false).await.unwrap();
        assert!(creado.expires_at.is_none());
        let cred = store.most_recent_active("U1", "dev-01").await.unwrap();
        assert!(!renewal_due(cred.expires_at, Utc::now(), 7));
    }

    #[tokio::test]
    /// 校验成功会触达 last_used。
    async fn test_verify_touches_last_used() {
        let store = MemoryCredentialStore::new();
        let creado = store.create("U1", "dev-01", 600, false).await.unwrap();
        assert!(store.most_recent_active("U1", "dev-01").await.unwrap().last_used.is_none());
        assert!(store.verify("U1", &creado.plaintext).await);
        assert!(
            store.most_recent_active("U1", "dev-01").await.unwrap().last_used.is_some(),
            "校验成功后 last_used 应被更新"
        );
    }
}
