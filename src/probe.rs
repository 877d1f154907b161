//! Проверка доступности серверов кластера и бэкапы панелей.

use crate::db::Server;
use crate::panel::{PanelApi, PanelConnector, PanelError};
use crate::sync::BoundedExecutor;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerProbe {
    pub server_name: String,
    /// Число клиентов онлайн либо текст ошибки.
    pub outcome: Result<usize, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityReport {
    pub cluster: String,
    /// В порядке серверов в реестре.
    pub servers: Vec<ServerProbe>,
}

impl AvailabilityReport {
    pub fn total_online(&self) -> usize {
        self.servers
            .iter()
            .filter_map(|probe| probe.outcome.as_ref().ok())
            .sum()
    }

    pub fn failed(&self) -> usize {
        self.servers.iter().filter(|probe| probe.outcome.is_err()).count()
    }
}

async fn count_online(panel: Arc<dyn PanelApi>) -> Result<usize, PanelError> {
    panel.login().await?;
    Ok(panel.list_online_clients().await?.len())
}

/// Опрашивает все серверы кластера. Ошибка одного сервера не прерывает остальные.
pub async fn probe_cluster(
    connector: &dyn PanelConnector,
    executor: &BoundedExecutor,
    cluster: &str,
    servers: &[Server],
) -> AvailabilityReport {
    let mut jobs = Vec::with_capacity(servers.len());
    for (position, server) in servers.iter().enumerate() {
        jobs.push((position, server.server_name.clone(), connector.connect(server)));
    }

    let mut probes = executor
        .run(jobs, |(position, server_name, panel)| async move {
            let outcome = match panel {
                Ok(panel) => count_online(panel).await,
                Err(error) => Err(error),
            };
            (position, server_name, outcome)
        })
        .await;
    probes.sort_by_key(|(position, _, _)| *position);

    let servers = probes
        .into_iter()
        .map(|(_, server_name, outcome)| {
            let outcome = outcome.map_err(|error| {
                tracing::warn!(
                    cluster = %cluster,
                    server = %server_name,
                    error = %error,
                    "Сервер недоступен при проверке"
                );
                error.to_string()
            });
            ServerProbe { server_name, outcome }
        })
        .collect();

    AvailabilityReport {
        cluster: cluster.to_string(),
        servers,
    }
}

/// Запускает бэкап на каждой панели кластера. Возвращает имена серверов с ошибкой.
pub async fn backup_cluster(connector: &dyn PanelConnector, cluster: &str, servers: &[Server]) -> Vec<String> {
    let mut failed = Vec::new();
    for server in servers {
        let result = match connector.connect(server) {
            Ok(panel) => panel.create_backup().await,
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => tracing::info!(cluster = %cluster, server = %server.server_name, "Бэкап панели запрошен"),
            Err(error) => {
                tracing::error!(
                    cluster = %cluster,
                    server = %server.server_name,
                    error = %error,
                    "Не удалось создать бэкап панели"
                );
                failed.push(server.server_name.clone());
            }
        }
    }
    failed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::new_server;
    use crate::panel::fake::{FakeConnector, FakePanels};
    use std::time::Duration;

    fn servers(names: &[&str]) -> Vec<Server> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let new = new_server("eu", name);
                Server {
                    id: i as i64 + 1,
                    cluster_name: new.cluster_name,
                    server_name: new.server_name,
                    api_url: new.api_url,
                    subscription_url: new.subscription_url,
                    inbound_id: new.inbound_id,
                }
            })
            .collect()
    }

    #[tokio::test]
    async fn partial_failure_keeps_other_servers() {
        let servers = servers(&["de1", "fi1", "nl1"]);
        let panels = Arc::new(FakePanels {
            unreachable: [servers[1].api_url.clone()].into_iter().collect(),
            online: [
                (servers[0].api_url.clone(), vec!["a".to_string(), "b".to_string()]),
                (servers[2].api_url.clone(), vec!["c".to_string()]),
            ]
            .into_iter()
            .collect(),
            ..FakePanels::default()
        });
        let connector = FakeConnector(panels);
        let executor = BoundedExecutor::new(2, Duration::ZERO);

        let report = probe_cluster(&connector, &executor, "eu", &servers).await;

        assert_eq!(report.servers.len(), 3);
        assert_eq!(report.servers[0].server_name, "de1");
        assert_eq!(report.servers[0].outcome, Ok(2));
        assert!(report.servers[1].outcome.is_err());
        assert_eq!(report.servers[2].outcome, Ok(1));
        assert_eq!(report.total_online(), 3);
        assert_eq!(report.failed(), 1);
    }

    #[tokio::test]
    async fn backup_reports_failed_servers() {
        let servers = servers(&["de1", "fi1"]);
        let panels = Arc::new(FakePanels {
            unreachable: [servers[0].api_url.clone()].into_iter().collect(),
            ..FakePanels::default()
        });
        let connector = FakeConnector(Arc::clone(&panels));

        let failed = backup_cluster(&connector, "eu", &servers).await;

        assert_eq!(failed, vec!["de1".to_string()]);
        assert_eq!(*panels.backups.lock().unwrap(), vec![servers[1].api_url.clone()]);
    }
}
