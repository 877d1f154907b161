//! Топология кластеров и выбор наименее загруженного кластера.

use crate::db::{ClientKey, Db, Server};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Куда указывает `server_id` ключа после разрешения через реестр.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location<'a> {
    Cluster(&'a str),
    Server { cluster: &'a str, server: &'a str },
    Unknown(&'a str),
}

impl<'a> Location<'a> {
    /// Имя кластера, в счётчик которого попадает ключ.
    pub fn bucket(&self) -> &'a str {
        match *self {
            Location::Cluster(cluster) => cluster,
            Location::Server { cluster, .. } => cluster,
            Location::Unknown(raw) => raw,
        }
    }
}

/// Снимок реестра серверов: кластеры и обратное отображение сервер -> кластер.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    clusters: BTreeMap<String, Vec<Server>>,
    server_to_cluster: HashMap<String, String>,
}

impl Topology {
    pub fn new(clusters: BTreeMap<String, Vec<Server>>) -> Self {
        let mut server_to_cluster = HashMap::new();
        for (cluster_name, servers) in &clusters {
            for server in servers {
                if let Some(existing) =
                    server_to_cluster.get(&server.server_name).filter(|c| *c != cluster_name)
                {
                    tracing::warn!(
                        server = %server.server_name,
                        cluster = %cluster_name,
                        kept_cluster = %existing,
                        "Имя сервера встречается в нескольких кластерах"
                    );
                    continue;
                }
                server_to_cluster.insert(server.server_name.clone(), cluster_name.clone());
            }
        }
        Self {
            clusters,
            server_to_cluster,
        }
    }

    pub async fn load(db: &Db) -> Result<Self, anyhow::Error> {
        Ok(Self::new(db.get_servers().await?))
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.clusters.keys().map(String::as_str)
    }

    pub fn cluster(&self, cluster_name: &str) -> &[Server] {
        self.clusters
            .get(cluster_name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn server(&self, cluster_name: &str, server_name: &str) -> Option<&Server> {
        self.cluster(cluster_name)
            .iter()
            .find(|server| server.server_name == server_name)
    }

    /// Разрешает `server_id`: сначала как имя сервера, затем как имя кластера.
    pub fn resolve<'a>(&'a self, raw: &'a str) -> Location<'a> {
        if let Some(cluster) = self.server_to_cluster.get(raw) {
            return Location::Server {
                cluster: cluster.as_str(),
                server: raw,
            };
        }
        if let Some((cluster, _)) = self.clusters.get_key_value(raw) {
            return Location::Cluster(cluster.as_str());
        }
        Location::Unknown(raw)
    }

    /// Значения `server_id`, которые могут ссылаться на кластер или его серверы.
    pub fn location_names(&self, cluster_name: &str) -> Vec<String> {
        std::iter::once(cluster_name.to_string())
            .chain(
                self.cluster(cluster_name)
                    .iter()
                    .map(|server| server.server_name.clone()),
            )
            .collect()
    }
}

/// Количество ключей по кластерам. Неизвестные `server_id` учитываются отдельно.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterLoads {
    counts: BTreeMap<String, u64>,
    known: BTreeSet<String>,
}

impl ClusterLoads {
    pub fn estimate<'k>(topology: &Topology, keys: impl IntoIterator<Item = &'k ClientKey>) -> Self {
        let known: BTreeSet<String> = topology.cluster_names().map(str::to_string).collect();
        let mut counts: BTreeMap<String, u64> =
            known.iter().map(|cluster| (cluster.clone(), 0)).collect();

        for key in keys {
            let location = topology.resolve(&key.server_id);
            if let Location::Unknown(raw) = location {
                tracing::warn!(
                    server_id = %raw,
                    client_id = %key.client_id,
                    "Сервер ключа не найден в известных кластерах"
                );
            }
            *counts.entry(location.bucket().to_string()).or_insert(0) += 1;
        }

        Self { counts, known }
    }

    pub fn get(&self, cluster_name: &str) -> Option<u64> {
        self.counts.get(cluster_name).copied()
    }

    /// Известные кластеры с нагрузкой, по имени.
    pub fn known(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts
            .iter()
            .filter(|(cluster, _)| self.known.contains(*cluster))
            .map(|(cluster, count)| (cluster.as_str(), *count))
    }

    /// Ключи, чей `server_id` не разрешился ни в один кластер.
    pub fn unresolved(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts
            .iter()
            .filter(|(cluster, _)| !self.known.contains(*cluster))
            .map(|(cluster, count)| (cluster.as_str(), *count))
    }

    /// Кластер с минимальной нагрузкой; при равенстве берётся лексикографически меньший.
    pub fn least_loaded(&self) -> Option<&str> {
        self.known()
            .min_by(|(a_name, a_count), (b_name, b_count)| {
                a_count.cmp(b_count).then_with(|| a_name.cmp(b_name))
            })
            .map(|(cluster, _)| cluster)
    }
}

/// Выбирает кластер для нового ключа; без кластеров возвращает `fallback`.
pub async fn least_loaded_cluster(db: &Db, fallback: &str) -> Result<String, anyhow::Error> {
    let topology = Topology::load(db).await?;
    let keys = db.all_keys().await?;
    let loads = ClusterLoads::estimate(&topology, &keys);
    tracing::info!(loads = ?loads.counts, "Загруженность кластеров");

    match loads.least_loaded() {
        Some(cluster) => {
            tracing::info!(cluster = %cluster, "Выбран наименее загруженный кластер");
            Ok(cluster.to_string())
        }
        None => {
            tracing::warn!(fallback = %fallback, "В реестре нет кластеров, используется кластер по умолчанию");
            Ok(fallback.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{key, new_server, open_temp_db};

    fn server(cluster: &str, name: &str) -> Server {
        let new = new_server(cluster, name);
        Server {
            id: 0,
            cluster_name: new.cluster_name,
            server_name: new.server_name,
            api_url: new.api_url,
            subscription_url: new.subscription_url,
            inbound_id: new.inbound_id,
        }
    }

    fn topology(servers: &[(&str, &str)]) -> Topology {
        let mut clusters: BTreeMap<String, Vec<Server>> = BTreeMap::new();
        for (cluster, name) in servers {
            clusters
                .entry(cluster.to_string())
                .or_default()
                .push(server(cluster, name));
        }
        Topology::new(clusters)
    }

    fn keys(server_ids: &[&str]) -> Vec<ClientKey> {
        server_ids
            .iter()
            .enumerate()
            .map(|(i, server_id)| key(&format!("k{}", i), server_id, i as i64))
            .collect()
    }

    #[test]
    fn resolve_prefers_server_names_then_clusters() {
        let topology = topology(&[("A", "de1"), ("B", "fi1")]);
        assert_eq!(
            topology.resolve("de1"),
            Location::Server {
                cluster: "A",
                server: "de1"
            }
        );
        assert_eq!(topology.resolve("B"), Location::Cluster("B"));
        assert_eq!(topology.resolve("zz"), Location::Unknown("zz"));
    }

    #[test]
    fn ties_are_broken_lexicographically() {
        let topology = topology(&[("A", "a1"), ("B", "b1"), ("C", "c1")]);
        let keys = keys(&["A", "A", "a1", "B", "c1"]);
        let loads = ClusterLoads::estimate(&topology, &keys);

        assert_eq!(loads.get("A"), Some(3));
        assert_eq!(loads.get("B"), Some(1));
        assert_eq!(loads.get("C"), Some(1));
        assert_eq!(loads.least_loaded(), Some("B"));
    }

    #[test]
    fn empty_clusters_win() {
        let topology = topology(&[("A", "a1"), ("B", "b1")]);
        let loads = ClusterLoads::estimate(&topology, &keys(&["A"]));
        assert_eq!(loads.least_loaded(), Some("B"));
    }

    #[test]
    fn unknown_server_ids_are_counted_but_never_selected() {
        let topology = topology(&[("B", "b1")]);
        let loads = ClusterLoads::estimate(&topology, &keys(&["B", "B", "legacy"]));

        assert_eq!(loads.get("legacy"), Some(1));
        assert_eq!(loads.unresolved().collect::<Vec<_>>(), vec![("legacy", 1)]);
        assert_eq!(loads.known().collect::<Vec<_>>(), vec![("B", 2)]);
        assert_eq!(loads.least_loaded(), Some("B"));
    }

    #[test]
    fn no_clusters_means_no_choice() {
        let loads = ClusterLoads::estimate(&Topology::default(), &keys(&["x"]));
        assert_eq!(loads.least_loaded(), None);
    }

    #[test]
    fn location_names_cover_cluster_and_its_servers() {
        let topology = topology(&[("A", "a1"), ("A", "a2")]);
        assert_eq!(topology.location_names("A"), vec!["A", "a1", "a2"]);
        assert_eq!(topology.location_names("missing"), vec!["missing"]);
    }

    #[tokio::test]
    async fn empty_registry_returns_fallback() {
        let (_dir, db) = open_temp_db().await;
        db.insert_key(&key("k1", "orphan", 1)).await.unwrap();
        let cluster = least_loaded_cluster(&db, "cluster1").await.unwrap();
        assert_eq!(cluster, "cluster1");
    }

    #[tokio::test]
    async fn selection_is_deterministic_against_db() {
        let (_dir, db) = open_temp_db().await;
        db.insert_server(&new_server("nl", "nl1")).await.unwrap();
        db.insert_server(&new_server("de", "de1")).await.unwrap();
        db.insert_key(&key("k1", "de", 1)).await.unwrap();

        for _ in 0..3 {
            assert_eq!(least_loaded_cluster(&db, "cluster1").await.unwrap(), "nl");
        }
    }
}
