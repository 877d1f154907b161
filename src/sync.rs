//! Синхронизация ключей из БД с панелями серверов кластера.

use crate::balancer::{Location, Topology};
use crate::config::{PanelConfig, SyncConfig};
use crate::db::{ClientKey, Db, Server};
use crate::panel::{ClientSpec, PanelApi, PanelConnector, PanelError};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Исполнитель с ограничением числа одновременных задач и паузой между запусками.
#[derive(Debug, Clone)]
pub struct BoundedExecutor {
    limit: usize,
    pacing: Duration,
}

impl BoundedExecutor {
    pub fn new(limit: usize, pacing: Duration) -> Self {
        Self {
            limit: limit.max(1),
            pacing,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.concurrency, config.pacing())
    }

    /// Тот же лимит без паузы между стартами: для опроса панелей, которые не нагружаются записью.
    pub fn unpaced(&self) -> Self {
        Self::new(self.limit, Duration::ZERO)
    }

    /// Запускает задачи в порядке `items`, не более `limit` одновременно.
    /// Результаты возвращаются в порядке завершения.
    pub async fn run<I, F, Fut, T>(&self, items: I, task: F) -> Vec<T>
    where
        I: IntoIterator,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let gate = Arc::new(Semaphore::new(self.limit));
        let mut tasks = JoinSet::new();
        let mut results = Vec::new();

        for (index, item) in items.into_iter().enumerate() {
            if index > 0 && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
            let Ok(permit) = Arc::clone(&gate).acquire_owned().await else {
                break;
            };
            let future = task(item);
            tasks.spawn(async move {
                let _permit = permit;
                future.await
            });
            while let Some(joined) = tasks.try_join_next() {
                collect_joined(joined, &mut results);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            collect_joined(joined, &mut results);
        }
        results
    }
}

fn collect_joined<T>(joined: Result<T, tokio::task::JoinError>, results: &mut Vec<T>) {
    match joined {
        Ok(value) => results.push(value),
        Err(error) => tracing::error!(error = %error, "Задача синхронизации аварийно завершилась"),
    }
}

/// Что синхронизировать. Сервер всегда указывается вместе со своим кластером.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    Cluster(String),
    Server { cluster: String, server: String },
}

impl SyncTarget {
    pub fn cluster(&self) -> &str {
        match self {
            SyncTarget::Cluster(cluster) => cluster,
            SyncTarget::Server { cluster, .. } => cluster,
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncTarget::Cluster(cluster) => write!(f, "кластер {}", cluster),
            SyncTarget::Server { cluster, server } => write!(f, "сервер {} ({})", server, cluster),
        }
    }
}

/// Одна операция: применить ключ на конкретном сервере.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub key: ClientKey,
    pub server: Server,
}

/// Сопоставляет ключи с серверами назначения.
///
/// Ключ, привязанный к кластеру, уходит на все серверы кластера (или только на
/// выбранный сервер в режиме одного сервера). Ключ, привязанный к конкретному
/// серверу, уходит только на этот сервер.
pub fn plan_jobs(target: &SyncTarget, topology: &Topology, keys: &[ClientKey]) -> Vec<SyncJob> {
    let destinations: Vec<&Server> = match target {
        SyncTarget::Cluster(cluster) => topology.cluster(cluster).iter().collect(),
        SyncTarget::Server { cluster, server } => topology.server(cluster, server).into_iter().collect(),
    };

    let mut jobs = Vec::new();
    for key in keys {
        match topology.resolve(&key.server_id) {
            Location::Cluster(cluster) if cluster == target.cluster() => {
                jobs.extend(destinations.iter().map(|server| SyncJob {
                    key: key.clone(),
                    server: (*server).clone(),
                }));
            }
            Location::Server { cluster, server } if cluster == target.cluster() => {
                jobs.extend(
                    destinations
                        .iter()
                        .filter(|destination| destination.server_name == server)
                        .map(|destination| SyncJob {
                            key: key.clone(),
                            server: (*destination).clone(),
                        }),
                );
            }
            Location::Unknown(raw) => {
                tracing::warn!(
                    server_id = %raw,
                    client_id = %key.client_id,
                    "Ключ ссылается на неизвестный сервер, пропускаю"
                );
            }
            _ => {}
        }
    }
    jobs
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub target: SyncTarget,
    /// Сколько ключей из БД относится к цели.
    pub total_keys: usize,
    /// Сколько вызовов панели было выполнено (ключ × сервер).
    pub attempted: usize,
    /// client_id ключей, для которых хотя бы один вызов завершился ошибкой.
    pub failed: BTreeSet<String>,
}

impl SyncReport {
    pub fn succeeded_keys(&self) -> usize {
        self.total_keys.saturating_sub(self.failed.len())
    }
}

pub struct KeySynchronizer {
    db: Arc<Db>,
    connector: Arc<dyn PanelConnector>,
    panel: PanelConfig,
    executor: BoundedExecutor,
}

impl KeySynchronizer {
    pub fn new(
        db: Arc<Db>,
        connector: Arc<dyn PanelConnector>,
        panel: PanelConfig,
        executor: BoundedExecutor,
    ) -> Self {
        Self {
            db,
            connector,
            panel,
            executor,
        }
    }

    /// Ключи, относящиеся к цели: по имени кластера и по именам его серверов.
    async fn keys_for(&self, target: &SyncTarget, topology: &Topology) -> Result<Vec<ClientKey>, anyhow::Error> {
        let locations = match target {
            SyncTarget::Cluster(cluster) => topology.location_names(cluster),
            SyncTarget::Server { cluster, server } => vec![cluster.clone(), server.clone()],
        };
        let keys = self.db.keys_by_locations(&locations).await?;
        Ok(keys
            .into_iter()
            .filter(|key| match topology.resolve(&key.server_id) {
                Location::Cluster(cluster) => cluster == target.cluster(),
                Location::Server { cluster, server } => match target {
                    SyncTarget::Cluster(_) => cluster == target.cluster(),
                    SyncTarget::Server { server: wanted, .. } => {
                        cluster == target.cluster() && server == wanted.as_str()
                    }
                },
                Location::Unknown(_) => false,
            })
            .collect())
    }

    pub async fn sync(&self, target: &SyncTarget) -> Result<SyncReport, anyhow::Error> {
        let topology = Topology::load(&self.db).await?;
        if topology.cluster(target.cluster()).is_empty() {
            anyhow::bail!("Кластер {} не найден", target.cluster());
        }
        if let SyncTarget::Server { cluster, server } = target
            && topology.server(cluster, server).is_none()
        {
            anyhow::bail!("Сервер {} не найден в кластере {}", server, cluster);
        }

        let keys = self.keys_for(target, &topology).await?;
        let jobs = plan_jobs(target, &topology, &keys);
        tracing::info!(
            sync_target = %target,
            keys = keys.len(),
            jobs = jobs.len(),
            "Начинаю синхронизацию ключей"
        );

        let mut panels: HashMap<String, Arc<dyn PanelApi>> = HashMap::new();
        let mut runnable = Vec::with_capacity(jobs.len());
        let mut failed = BTreeSet::new();
        for job in jobs {
            let panel = match panels.get(&job.server.api_url) {
                Some(panel) => Arc::clone(panel),
                None => match self.connector.connect(&job.server) {
                    Ok(panel) => {
                        panels.insert(job.server.api_url.clone(), Arc::clone(&panel));
                        panel
                    }
                    Err(error) => {
                        tracing::error!(
                            server = %job.server.server_name,
                            client_id = %job.key.client_id,
                            error = %error,
                            "Не удалось подготовить клиент панели"
                        );
                        failed.insert(job.key.client_id.clone());
                        continue;
                    }
                },
            };
            runnable.push((job, panel));
        }

        let attempted = runnable.len();
        let panel_config = self.panel.clone();
        let outcomes = self
            .executor
            .run(runnable, move |(job, panel)| {
                let spec = ClientSpec::from_key(&job.key, &panel_config);
                async move {
                    let result = provision(panel.as_ref(), &job.server, &spec).await;
                    (job, result)
                }
            })
            .await;

        for (job, result) in outcomes {
            if let Err(error) = result {
                tracing::error!(
                    server = %job.server.server_name,
                    cluster = %job.server.cluster_name,
                    client_id = %job.key.client_id,
                    error = %error,
                    "Ошибка при добавлении ключа на сервер"
                );
                failed.insert(job.key.client_id);
            }
        }

        let report = SyncReport {
            target: target.clone(),
            total_keys: keys.len(),
            attempted,
            failed,
        };
        tracing::info!(
            sync_target = %target,
            total = report.total_keys,
            failed = report.failed.len(),
            "Синхронизация завершена"
        );
        Ok(report)
    }
}

/// Создаёт (или обновляет) клиента ключа в inbound сервера.
pub async fn provision(panel: &dyn PanelApi, server: &Server, spec: &ClientSpec) -> Result<(), PanelError> {
    panel.create_client(server.inbound_id, spec).await?;
    tracing::debug!(
        server = %server.server_name,
        client_id = %spec.client_id,
        "Клиент применён на сервере"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{key, new_server, open_temp_db};
    use crate::panel::fake::{FakeConnector, FakePanels};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn seeded_db() -> (tempfile::TempDir, Arc<Db>) {
        let (dir, db) = open_temp_db().await;
        db.insert_server(&new_server("eu", "de1")).await.unwrap();
        db.insert_server(&new_server("eu", "fi1")).await.unwrap();
        db.insert_server(&new_server("us", "ny1")).await.unwrap();
        db.insert_key(&key("k1", "eu", 1)).await.unwrap();
        db.insert_key(&key("k2", "eu", 2)).await.unwrap();
        db.insert_key(&key("k3", "fi1", 3)).await.unwrap();
        db.insert_key(&key("k4", "us", 4)).await.unwrap();
        db.insert_key(&key("k5", "legacy", 5)).await.unwrap();
        (dir, Arc::new(db))
    }

    fn synchronizer(db: Arc<Db>, panels: Arc<FakePanels>, limit: usize) -> KeySynchronizer {
        KeySynchronizer::new(
            db,
            Arc::new(FakeConnector(panels)),
            crate::config::test_config().panel,
            BoundedExecutor::new(limit, Duration::ZERO),
        )
    }

    #[tokio::test]
    async fn executor_never_exceeds_limit() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let executor = BoundedExecutor::new(2, Duration::ZERO);

        let results = executor
            .run(0..8, |i| {
                let in_flight = Arc::clone(&in_flight);
                let max_seen = Arc::clone(&max_seen);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    i
                }
            })
            .await;

        assert_eq!(results.len(), 8);
        assert_eq!(max_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn executor_paces_successive_starts() {
        let executor = BoundedExecutor::new(4, Duration::from_millis(30));
        let started = std::time::Instant::now();
        executor.run(0..3, |_| async {}).await;
        assert!(started.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn unpaced_executor_keeps_limit_and_drops_pacing() {
        let paced = BoundedExecutor::new(3, Duration::from_secs(5));
        let unpaced = paced.unpaced();
        assert_eq!(unpaced.limit, 3);
        assert!(unpaced.pacing.is_zero());

        let started = std::time::Instant::now();
        let results = unpaced.run(0..6, |i| async move { i }).await;
        assert_eq!(results.len(), 6);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn server_sync_applies_cluster_and_server_keys_to_that_server() {
        let (_dir, db) = seeded_db().await;
        let panels = Arc::new(FakePanels::default());
        let report = synchronizer(db, Arc::clone(&panels), 2)
            .sync(&SyncTarget::Server {
                cluster: "eu".to_string(),
                server: "fi1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(report.total_keys, 3);
        assert_eq!(report.attempted, 3);
        assert!(report.failed.is_empty());
        let clients = panels.clients.lock().unwrap();
        assert!(clients.keys().all(|(url, _)| url.contains("fi1")));
        assert_eq!(clients.len(), 3);
    }

    #[tokio::test]
    async fn server_sync_skips_keys_pinned_to_sibling_server() {
        let (_dir, db) = seeded_db().await;
        let panels = Arc::new(FakePanels::default());
        let report = synchronizer(db, Arc::clone(&panels), 2)
            .sync(&SyncTarget::Server {
                cluster: "eu".to_string(),
                server: "de1".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(report.total_keys, 2);
        assert_eq!(panels.client_count(), 2);
    }

    #[tokio::test]
    async fn cluster_sync_fans_cluster_keys_out_to_every_server() {
        let (_dir, db) = seeded_db().await;
        let panels = Arc::new(FakePanels::default());
        let report = synchronizer(db, Arc::clone(&panels), 2)
            .sync(&SyncTarget::Cluster("eu".to_string()))
            .await
            .unwrap();

        // k1, k2 -> de1 + fi1; k3 -> fi1
        assert_eq!(report.total_keys, 3);
        assert_eq!(report.attempted, 5);
        assert_eq!(panels.client_count(), 5);
    }

    #[tokio::test]
    async fn failing_key_does_not_abort_batch() {
        let (_dir, db) = seeded_db().await;
        let panels = Arc::new(FakePanels {
            failing_clients: ["k1".to_string()].into_iter().collect(),
            ..FakePanels::default()
        });
        let report = synchronizer(db, Arc::clone(&panels), 2)
            .sync(&SyncTarget::Cluster("eu".to_string()))
            .await
            .unwrap();

        assert_eq!(report.total_keys, 3);
        assert_eq!(report.attempted, 5);
        assert_eq!(report.failed.iter().collect::<Vec<_>>(), vec!["k1"]);
        assert_eq!(report.succeeded_keys(), 2);
        assert_eq!(panels.client_count(), 3);
    }

    #[tokio::test]
    async fn repeated_sync_leaves_same_panel_state() {
        let (_dir, db) = seeded_db().await;
        let panels = Arc::new(FakePanels::default());
        let sync = synchronizer(db, Arc::clone(&panels), 2);
        let target = SyncTarget::Cluster("eu".to_string());

        sync.sync(&target).await.unwrap();
        let first: Vec<_> = {
            let clients = panels.clients.lock().unwrap();
            let mut entries: Vec<_> = clients.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };
        sync.sync(&target).await.unwrap();
        let second: Vec<_> = {
            let clients = panels.clients.lock().unwrap();
            let mut entries: Vec<_> = clients.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            entries
        };

        assert_eq!(first, second);
        assert_eq!(panels.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn sync_respects_concurrency_limit() {
        let (_dir, db) = seeded_db().await;
        let panels = Arc::new(FakePanels {
            delay: Duration::from_millis(15),
            ..FakePanels::default()
        });
        synchronizer(db, Arc::clone(&panels), 2)
            .sync(&SyncTarget::Cluster("eu".to_string()))
            .await
            .unwrap();

        assert!(panels.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn unknown_target_is_a_batch_error() {
        let (_dir, db) = seeded_db().await;
        let panels = Arc::new(FakePanels::default());
        let sync = synchronizer(db, panels, 2);

        assert!(sync.sync(&SyncTarget::Cluster("asia".to_string())).await.is_err());
        assert!(
            sync.sync(&SyncTarget::Server {
                cluster: "eu".to_string(),
                server: "ny1".to_string(),
            })
            .await
            .is_err()
        );
    }

    #[tokio::test]
    async fn empty_cluster_reports_zero_keys() {
        let (_dir, db) = open_temp_db().await;
        db.insert_server(&new_server("empty", "e1")).await.unwrap();
        let panels = Arc::new(FakePanels::default());
        let report = synchronizer(Arc::new(db), panels, 2)
            .sync(&SyncTarget::Cluster("empty".to_string()))
            .await
            .unwrap();
        assert_eq!(report.total_keys, 0);
        assert_eq!(report.attempted, 0);
    }

    #[test]
    fn plan_skips_unknown_locations() {
        let mut clusters = std::collections::BTreeMap::new();
        let new = new_server("eu", "de1");
        clusters.insert(
            "eu".to_string(),
            vec![Server {
                id: 1,
                cluster_name: new.cluster_name,
                server_name: new.server_name,
                api_url: new.api_url,
                subscription_url: new.subscription_url,
                inbound_id: new.inbound_id,
            }],
        );
        let topology = Topology::new(clusters);
        let keys = vec![key("k1", "eu", 1), key("k2", "nowhere", 2)];

        let jobs = plan_jobs(&SyncTarget::Cluster("eu".to_string()), &topology, &keys);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].key.client_id, "k1");
    }
}
