//! SQLite-слой: реестр серверов, ключи клиентов, пользователи, купоны, подарки, платежи.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

/// Сервер панели 3x-ui, принадлежащий кластеру.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Server {
    pub id: i64,
    pub cluster_name: String,
    pub server_name: String,
    pub api_url: String,
    pub subscription_url: String,
    pub inbound_id: i64,
}

#[derive(Debug, Clone)]
pub struct NewServer {
    pub cluster_name: String,
    pub server_name: String,
    pub api_url: String,
    pub subscription_url: String,
    pub inbound_id: i64,
}

/// Ключ клиента. `server_id` хранит имя кластера или имя конкретного сервера.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct ClientKey {
    pub tg_id: i64,
    pub client_id: String,
    pub email: String,
    pub created_at: i64,
    /// Unix-время в миллисекундах, как его хранит панель.
    pub expiry_time: i64,
    pub server_id: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct UserRecord {
    pub tg_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub is_bot: bool,
    pub balance: f64,
    pub trial: i64,
    pub created_at: i64,
}

/// Данные пользователя Telegram на момент первого контакта.
#[derive(Debug, Clone, Default)]
pub struct TelegramProfile {
    pub tg_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub is_bot: bool,
}

#[derive(Debug, Clone, FromRow)]
struct Coupon {
    id: i64,
    amount: f64,
    usage_limit: i64,
    usage_count: i64,
    is_used: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CouponOutcome {
    Applied { amount: f64 },
    NotFound,
    AlreadyUsedByUser,
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Gift {
    pub gift_id: String,
    pub sender_tg_id: i64,
    pub selected_months: i64,
    pub expiry_time: i64,
    pub is_used: bool,
    pub recipient_tg_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GiftCheck {
    Claimable(Gift),
    NotFound,
    AlreadyUsed,
    OwnGift,
    ClaimedByOther(i64),
}

#[derive(Debug, Clone, FromRow)]
pub struct PaymentExportRow {
    pub tg_id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub amount: f64,
    pub payment_system: String,
    pub status: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow)]
pub struct ReferralExportRow {
    pub referred_tg_id: i64,
    pub first_name: String,
    pub last_name: String,
    pub username: String,
}

pub const PAYMENT_SYSTEM_ADMIN: &str = "admin";
const PAYMENT_STATUS_SUCCESS: &str = "success";

const KEY_COLUMNS: &str = "tg_id, client_id, email, created_at, expiry_time, server_id";
const USER_COLUMNS: &str =
    "tg_id, username, first_name, last_name, language_code, is_bot, balance, trial, created_at";

pub struct Db {
    pool: SqlitePool,
}

pub fn current_unix_timestamp() -> Result<i64, anyhow::Error> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .map_err(|err| anyhow::anyhow!("Системное время меньше UNIX_EPOCH: {}", err))
}

impl Db {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("Не удалось создать директорию для БД: {}", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| anyhow::anyhow!("Не удалось подключиться к SQLite: {}", e))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<(), anyhow::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_name TEXT NOT NULL,
                server_name TEXT NOT NULL,
                api_url TEXT NOT NULL,
                subscription_url TEXT NOT NULL,
                inbound_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(cluster_name, server_name)
            );
            CREATE INDEX IF NOT EXISTS idx_servers_cluster ON servers(cluster_name);

            CREATE TABLE IF NOT EXISTS keys (
                client_id TEXT PRIMARY KEY,
                tg_id INTEGER NOT NULL,
                email TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                expiry_time INTEGER NOT NULL,
                server_id TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_keys_server_id ON keys(server_id);
            CREATE INDEX IF NOT EXISTS idx_keys_tg_id ON keys(tg_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция servers/keys: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                tg_id INTEGER PRIMARY KEY,
                username TEXT,
                first_name TEXT,
                last_name TEXT,
                language_code TEXT,
                is_bot INTEGER NOT NULL DEFAULT 0,
                balance REAL NOT NULL DEFAULT 0,
                trial INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS referrals (
                referred_tg_id INTEGER PRIMARY KEY,
                referrer_tg_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_referrals_referrer ON referrals(referrer_tg_id);

            CREATE TABLE IF NOT EXISTS payments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tg_id INTEGER NOT NULL,
                amount REAL NOT NULL,
                payment_system TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_payments_tg_id ON payments(tg_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция users/referrals/payments: {}", e))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS coupons (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code TEXT UNIQUE NOT NULL,
                amount REAL NOT NULL,
                usage_limit INTEGER NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0,
                is_used INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS coupon_usages (
                coupon_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                used_at INTEGER NOT NULL,
                PRIMARY KEY (coupon_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS gifts (
                gift_id TEXT PRIMARY KEY,
                sender_tg_id INTEGER NOT NULL,
                selected_months INTEGER NOT NULL,
                expiry_time INTEGER NOT NULL,
                is_used INTEGER NOT NULL DEFAULT 0,
                recipient_tg_id INTEGER,
                created_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Миграция coupons/gifts: {}", e))?;

        Ok(())
    }

    /// Все серверы, сгруппированные по кластерам, в порядке добавления.
    pub async fn get_servers(&self) -> Result<BTreeMap<String, Vec<Server>>, anyhow::Error> {
        let rows = sqlx::query_as::<_, Server>(
            "SELECT id, cluster_name, server_name, api_url, subscription_url, inbound_id
             FROM servers
             ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut clusters: BTreeMap<String, Vec<Server>> = BTreeMap::new();
        for server in rows {
            clusters
                .entry(server.cluster_name.clone())
                .or_default()
                .push(server);
        }
        Ok(clusters)
    }

    /// `true`, если в кластере ещё нет сервера с таким именем.
    pub async fn check_unique_server_name(
        &self,
        server_name: &str,
        cluster_name: &str,
    ) -> Result<bool, anyhow::Error> {
        let exists = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM servers WHERE server_name = ? AND cluster_name = ?",
        )
        .bind(server_name)
        .bind(cluster_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(exists.is_none())
    }

    pub async fn insert_server(&self, server: &NewServer) -> Result<(), anyhow::Error> {
        let now = current_unix_timestamp()?;
        sqlx::query(
            "INSERT INTO servers (cluster_name, server_name, api_url, subscription_url, inbound_id, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&server.cluster_name)
        .bind(&server.server_name)
        .bind(&server.api_url)
        .bind(&server.subscription_url)
        .bind(server.inbound_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Не удалось добавить сервер: {}", e))?;
        Ok(())
    }

    pub async fn delete_server(
        &self,
        cluster_name: &str,
        server_name: &str,
    ) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("DELETE FROM servers WHERE cluster_name = ? AND server_name = ?")
            .bind(cluster_name)
            .bind(server_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn all_keys(&self) -> Result<Vec<ClientKey>, anyhow::Error> {
        let rows = sqlx::query_as::<_, ClientKey>(&format!(
            "SELECT {} FROM keys ORDER BY created_at ASC, client_id ASC",
            KEY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Ключи, у которых `server_id` совпадает с одним из переданных имён.
    pub async fn keys_by_locations(
        &self,
        locations: &[String],
    ) -> Result<Vec<ClientKey>, anyhow::Error> {
        if locations.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM keys WHERE server_id IN (", KEY_COLUMNS));
        let mut separated = builder.separated(", ");
        for location in locations {
            separated.push_bind(location.as_str());
        }
        separated.push_unseparated(") ORDER BY created_at ASC, client_id ASC");

        let rows = builder
            .build_query_as::<ClientKey>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn keys_by_tg_id(&self, tg_id: i64) -> Result<Vec<ClientKey>, anyhow::Error> {
        let rows = sqlx::query_as::<_, ClientKey>(&format!(
            "SELECT {} FROM keys WHERE tg_id = ? ORDER BY expiry_time DESC",
            KEY_COLUMNS
        ))
        .bind(tg_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn insert_key(&self, key: &ClientKey) -> Result<(), anyhow::Error> {
        sqlx::query(
            "INSERT INTO keys (tg_id, client_id, email, created_at, expiry_time, server_id)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(key.tg_id)
        .bind(&key.client_id)
        .bind(&key.email)
        .bind(key.created_at)
        .bind(key.expiry_time)
        .bind(&key.server_id)
        .execute(&self.pool)
        .await
        .map_err(|e| anyhow::anyhow!("Не удалось сохранить ключ {}: {}", key.client_id, e))?;
        Ok(())
    }

    /// Регистрирует пользователя, если его ещё нет. Возвращает `true` для нового пользователя.
    pub async fn ensure_user(&self, profile: &TelegramProfile) -> Result<bool, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO users (tg_id, username, first_name, last_name, language_code, is_bot, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(profile.tg_id)
        .bind(profile.username.as_deref())
        .bind(profile.first_name.as_deref())
        .bind(profile.last_name.as_deref())
        .bind(profile.language_code.as_deref())
        .bind(profile.is_bot)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_user(&self, tg_id: i64) -> Result<Option<UserRecord>, anyhow::Error> {
        let row = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {} FROM users WHERE tg_id = ?",
            USER_COLUMNS
        ))
        .bind(tg_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Атомарно забирает пробный период. `false`, если он уже использован
    /// или пользователя нет.
    pub async fn claim_trial(&self, tg_id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query("UPDATE users SET trial = 1 WHERE tg_id = ? AND trial = 0")
            .bind(tg_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Возвращает пробный период, если ключ выдать не удалось.
    pub async fn release_trial(&self, tg_id: i64) -> Result<(), anyhow::Error> {
        sqlx::query("UPDATE users SET trial = 0 WHERE tg_id = ?")
            .bind(tg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_trial_used(&self, tg_id: i64) -> Result<(), anyhow::Error> {
        sqlx::query("UPDATE users SET trial = 1 WHERE tg_id = ?")
            .bind(tg_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Ручное пополнение баланса администратором; фиксируется как платёж.
    pub async fn credit_balance(
        &self,
        tg_id: i64,
        amount: f64,
        payment_system: &str,
    ) -> Result<bool, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE users SET balance = balance + ? WHERE tg_id = ?")
            .bind(amount)
            .bind(tg_id)
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO payments (tg_id, amount, payment_system, status, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(tg_id)
        .bind(amount)
        .bind(payment_system)
        .bind(PAYMENT_STATUS_SUCCESS)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    pub async fn create_coupon(
        &self,
        code: &str,
        amount: f64,
        usage_limit: i64,
    ) -> Result<bool, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO coupons (code, amount, usage_limit, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(code)
        .bind(amount)
        .bind(usage_limit)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Применяет купон: начисляет сумму на баланс и фиксирует использование.
    pub async fn apply_coupon(&self, code: &str, tg_id: i64) -> Result<CouponOutcome, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let mut tx = self.pool.begin().await?;

        let coupon = sqlx::query_as::<_, Coupon>(
            "SELECT id, amount, usage_limit, usage_count, is_used FROM coupons WHERE code = ?",
        )
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(coupon) = coupon else {
            return Ok(CouponOutcome::NotFound);
        };

        let already_used = sqlx::query_scalar::<_, i64>(
            "SELECT 1 FROM coupon_usages WHERE coupon_id = ? AND user_id = ?",
        )
        .bind(coupon.id)
        .bind(tg_id)
        .fetch_optional(&mut *tx)
        .await?;
        if already_used.is_some() {
            return Ok(CouponOutcome::AlreadyUsedByUser);
        }

        if coupon.is_used || coupon.usage_count >= coupon.usage_limit {
            return Ok(CouponOutcome::Exhausted);
        }

        sqlx::query("UPDATE users SET balance = balance + ? WHERE tg_id = ?")
            .bind(coupon.amount)
            .bind(tg_id)
            .execute(&mut *tx)
            .await?;

        let usage_count = coupon.usage_count + 1;
        sqlx::query("UPDATE coupons SET usage_count = ?, is_used = ? WHERE id = ?")
            .bind(usage_count)
            .bind(usage_count >= coupon.usage_limit)
            .bind(coupon.id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("INSERT INTO coupon_usages (coupon_id, user_id, used_at) VALUES (?, ?, ?)")
            .bind(coupon.id)
            .bind(tg_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(CouponOutcome::Applied {
            amount: coupon.amount,
        })
    }

    pub async fn create_gift(
        &self,
        sender_tg_id: i64,
        selected_months: i64,
        expiry_time: i64,
    ) -> Result<String, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let gift_id = uuid::Uuid::new_v4().simple().to_string();
        sqlx::query(
            "INSERT INTO gifts (gift_id, sender_tg_id, selected_months, expiry_time, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&gift_id)
        .bind(sender_tg_id)
        .bind(selected_months)
        .bind(expiry_time)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(gift_id)
    }

    pub async fn check_gift(&self, gift_id: &str, recipient_tg_id: i64) -> Result<GiftCheck, anyhow::Error> {
        let gift = sqlx::query_as::<_, Gift>(
            "SELECT gift_id, sender_tg_id, selected_months, expiry_time, is_used, recipient_tg_id
             FROM gifts WHERE gift_id = ?",
        )
        .bind(gift_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(gift) = gift else {
            return Ok(GiftCheck::NotFound);
        };
        if gift.is_used {
            return Ok(GiftCheck::AlreadyUsed);
        }
        if gift.sender_tg_id == recipient_tg_id {
            return Ok(GiftCheck::OwnGift);
        }
        if let Some(other) = gift.recipient_tg_id {
            return Ok(GiftCheck::ClaimedByOther(other));
        }
        Ok(GiftCheck::Claimable(gift))
    }

    /// Помечает подарок использованным; `false`, если его успели забрать раньше.
    pub async fn mark_gift_used(&self, gift_id: &str, recipient_tg_id: i64) -> Result<bool, anyhow::Error> {
        let result = sqlx::query(
            "UPDATE gifts SET is_used = 1, recipient_tg_id = ? WHERE gift_id = ? AND is_used = 0",
        )
        .bind(recipient_tg_id)
        .bind(gift_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Снимает пометку с подарка, который забрал `recipient_tg_id`.
    pub async fn release_gift(&self, gift_id: &str, recipient_tg_id: i64) -> Result<(), anyhow::Error> {
        sqlx::query(
            "UPDATE gifts SET is_used = 0, recipient_tg_id = NULL
             WHERE gift_id = ? AND is_used = 1 AND recipient_tg_id = ?",
        )
        .bind(gift_id)
        .bind(recipient_tg_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_referral(&self, referred_tg_id: i64, referrer_tg_id: i64) -> Result<bool, anyhow::Error> {
        let now = current_unix_timestamp()?;
        let result = sqlx::query(
            "INSERT OR IGNORE INTO referrals (referred_tg_id, referrer_tg_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(referred_tg_id)
        .bind(referrer_tg_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_referrer(&self, referred_tg_id: i64) -> Result<Option<i64>, anyhow::Error> {
        let referrer = sqlx::query_scalar::<_, i64>(
            "SELECT referrer_tg_id FROM referrals WHERE referred_tg_id = ?",
        )
        .bind(referred_tg_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(referrer)
    }

    pub async fn count_referrals(&self, referrer_tg_id: i64) -> Result<i64, anyhow::Error> {
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM referrals WHERE referrer_tg_id = ?",
        )
        .bind(referrer_tg_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    pub async fn list_users_for_export(&self) -> Result<Vec<UserRecord>, anyhow::Error> {
        let rows = sqlx::query_as::<_, UserRecord>(&format!(
            "SELECT {} FROM users ORDER BY created_at ASC, tg_id ASC",
            USER_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Платежи от старых к новым; при `tg_id = Some(..)` только платежи этого пользователя.
    pub async fn list_payments_for_export(
        &self,
        tg_id: Option<i64>,
    ) -> Result<Vec<PaymentExportRow>, anyhow::Error> {
        let rows = sqlx::query_as::<_, PaymentExportRow>(
            "SELECT u.tg_id, u.username, u.first_name, u.last_name,
                    p.amount, p.payment_system, p.status, p.created_at
             FROM users u
             JOIN payments p ON u.tg_id = p.tg_id
             WHERE ? IS NULL OR u.tg_id = ?
             ORDER BY p.created_at ASC, p.id ASC",
        )
        .bind(tg_id)
        .bind(tg_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_referrals_for_export(
        &self,
        referrer_tg_id: i64,
    ) -> Result<Vec<ReferralExportRow>, anyhow::Error> {
        let rows = sqlx::query_as::<_, ReferralExportRow>(
            "SELECT r.referred_tg_id,
                    COALESCE(u.first_name, '') AS first_name,
                    COALESCE(u.last_name, '') AS last_name,
                    COALESCE(u.username, '') AS username
             FROM referrals r
             JOIN users u ON u.tg_id = r.referred_tg_id
             WHERE r.referrer_tg_id = ?
             ORDER BY r.referred_tg_id",
        )
        .bind(referrer_tg_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub async fn open_temp_db() -> (tempfile::TempDir, Db) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Db::open(dir.path().join("bot.db")).await.expect("open db");
        (dir, db)
    }

    pub fn new_server(cluster: &str, server: &str) -> NewServer {
        NewServer {
            cluster_name: cluster.to_string(),
            server_name: server.to_string(),
            api_url: format!("https://{}.example.com:2053/panel", server),
            subscription_url: format!("https://{}.example.com:2096/sub", server),
            inbound_id: 1,
        }
    }

    pub fn key(client_id: &str, server_id: &str, created_at: i64) -> ClientKey {
        ClientKey {
            tg_id: 100,
            client_id: client_id.to_string(),
            email: format!("email-{}", client_id),
            created_at,
            expiry_time: 1_900_000_000_000,
            server_id: server_id.to_string(),
        }
    }

    pub fn profile(tg_id: i64) -> TelegramProfile {
        TelegramProfile {
            tg_id,
            username: Some(format!("user{}", tg_id)),
            first_name: Some("Иван".to_string()),
            ..TelegramProfile::default()
        }
    }
}
