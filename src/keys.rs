//! Выдача новых ключей: выбор кластера, создание клиента на панелях, запись в БД.

use crate::balancer::{Topology, least_loaded_cluster};
use crate::config::{Config, PanelConfig};
use crate::db::{ClientKey, Db, Gift, Server, current_unix_timestamp};
use crate::panel::{ClientSpec, PanelConnector};
use crate::sync::{BoundedExecutor, provision};
use rand::Rng;
use std::sync::Arc;

const EMAIL_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const EMAIL_LEN: usize = 6;

pub fn generate_random_email(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| EMAIL_ALPHABET[rng.random_range(0..EMAIL_ALPHABET.len())] as char)
        .collect()
}

pub fn subscription_link(server: &Server, email: &str) -> String {
    format!("{}/{}", server.subscription_url.trim_end_matches('/'), email)
}

/// Создаёт клиента на всех серверах кластера. Возвращает имена серверов с ошибкой.
pub async fn create_key_on_cluster(
    connector: &dyn PanelConnector,
    executor: &BoundedExecutor,
    servers: &[Server],
    spec: &ClientSpec,
) -> Vec<String> {
    let mut failed = Vec::new();
    let mut jobs = Vec::with_capacity(servers.len());
    for server in servers {
        match connector.connect(server) {
            Ok(panel) => jobs.push((server.clone(), panel)),
            Err(error) => {
                tracing::error!(server = %server.server_name, error = %error, "Не удалось подготовить клиент панели");
                failed.push(server.server_name.clone());
            }
        }
    }

    let outcomes = executor
        .run(jobs, |(server, panel)| {
            let spec = spec.clone();
            async move {
                let result = provision(panel.as_ref(), &server, &spec).await;
                (server, result)
            }
        })
        .await;

    for (server, result) in outcomes {
        if let Err(error) = result {
            tracing::error!(
                server = %server.server_name,
                cluster = %server.cluster_name,
                client_id = %spec.client_id,
                error = %error,
                "Не удалось создать клиента на сервере"
            );
            failed.push(server.server_name);
        }
    }
    failed
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedKey {
    pub client_id: String,
    pub email: String,
    pub cluster: String,
    pub expiry_time: i64,
    pub subscription_link: String,
    /// Серверы кластера, на которых клиента создать не удалось.
    pub failed_servers: Vec<String>,
}

pub struct KeyIssuer {
    db: Arc<Db>,
    connector: Arc<dyn PanelConnector>,
    executor: BoundedExecutor,
    panel: PanelConfig,
    fallback_cluster: String,
}

impl KeyIssuer {
    pub fn new(db: Arc<Db>, connector: Arc<dyn PanelConnector>, config: &Config) -> Self {
        Self {
            db,
            connector,
            executor: BoundedExecutor::from_config(&config.sync),
            panel: config.panel.clone(),
            fallback_cluster: config.clusters.fallback_cluster.clone(),
        }
    }

    /// Выпускает ключ на наименее загруженном кластере.
    ///
    /// Ключ сохраняется, если клиент создан хотя бы на одном сервере; остальные
    /// серверы догоняются синхронизацией кластера.
    pub async fn issue(&self, tg_id: i64, expiry_time: i64) -> Result<IssuedKey, anyhow::Error> {
        let cluster = least_loaded_cluster(&self.db, &self.fallback_cluster).await?;
        let topology = Topology::load(&self.db).await?;
        let servers = topology.cluster(&cluster);
        let Some(first) = servers.first() else {
            anyhow::bail!("В кластере {} нет серверов", cluster);
        };

        let key = ClientKey {
            tg_id,
            client_id: uuid::Uuid::new_v4().to_string(),
            email: generate_random_email(EMAIL_LEN),
            created_at: current_unix_timestamp()?,
            expiry_time,
            server_id: cluster.clone(),
        };
        let spec = ClientSpec::from_key(&key, &self.panel);
        let failed_servers = create_key_on_cluster(self.connector.as_ref(), &self.executor, servers, &spec).await;
        if failed_servers.len() == servers.len() {
            anyhow::bail!("Не удалось создать ключ ни на одном сервере кластера {}", cluster);
        }

        self.db.insert_key(&key).await?;
        tracing::info!(
            tg_id = tg_id,
            cluster = %cluster,
            client_id = %key.client_id,
            failed = failed_servers.len(),
            "Ключ выпущен"
        );

        Ok(IssuedKey {
            subscription_link: subscription_link(first, &key.email),
            client_id: key.client_id,
            email: key.email,
            cluster,
            expiry_time,
            failed_servers,
        })
    }

    /// Пробный ключ. `None`, если пробный период уже использован.
    ///
    /// Пробный период забирается до обращения к панелям и возвращается,
    /// если выдать ключ не удалось.
    pub async fn issue_trial(&self, tg_id: i64, expiry_time: i64) -> Result<Option<IssuedKey>, anyhow::Error> {
        if !self.db.claim_trial(tg_id).await? {
            return Ok(None);
        }
        match self.issue(tg_id, expiry_time).await {
            Ok(issued) => Ok(Some(issued)),
            Err(error) => {
                self.db.release_trial(tg_id).await?;
                Err(error)
            }
        }
    }

    /// Ключ по подарку. `None`, если подарок уже забрал кто-то другой.
    pub async fn redeem_gift(&self, gift: &Gift, tg_id: i64) -> Result<Option<IssuedKey>, anyhow::Error> {
        if !self.db.mark_gift_used(&gift.gift_id, tg_id).await? {
            return Ok(None);
        }
        match self.issue(tg_id, gift.expiry_time).await {
            Ok(issued) => {
                self.db.set_trial_used(tg_id).await?;
                Ok(Some(issued))
            }
            Err(error) => {
                self.db.release_gift(&gift.gift_id, tg_id).await?;
                Err(error)
            }
        }
    }
}
