//! HTTP-клиент панели 3x-ui и абстракция над ним для синхронизации и проверок.

use crate::config::PanelConfig;
use crate::db::{ClientKey, Server};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("HTTP-ошибка панели: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Панель вернула статус {status} на {action}")]
    Status {
        action: &'static str,
        status: reqwest::StatusCode,
    },
    #[error("Панель отклонила {action}: {msg}")]
    Rejected { action: &'static str, msg: String },
    #[error("Некорректный ответ панели: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Параметры клиента, которые передаются в inbound панели.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSpec {
    pub tg_id: i64,
    pub client_id: String,
    pub email: String,
    pub expiry_time: i64,
    pub flow: String,
    pub limit_ip: i64,
    pub total_gb: i64,
}

impl ClientSpec {
    pub fn from_key(key: &ClientKey, panel: &PanelConfig) -> Self {
        Self {
            tg_id: key.tg_id,
            client_id: key.client_id.clone(),
            email: key.email.clone(),
            expiry_time: key.expiry_time,
            flow: panel.flow.clone(),
            limit_ip: panel.limit_ip,
            total_gb: panel.total_gb,
        }
    }
}

/// Операции панели, которыми пользуется бот.
#[async_trait]
pub trait PanelApi: Send + Sync {
    async fn login(&self) -> Result<(), PanelError>;

    /// Email-ы клиентов, которые сейчас онлайн.
    async fn list_online_clients(&self) -> Result<Vec<String>, PanelError>;

    /// Создаёт клиента в inbound; существующий клиент с тем же email обновляется.
    async fn create_client(&self, inbound_id: i64, client: &ClientSpec) -> Result<(), PanelError>;

    /// Просит панель выгрузить бэкап в её собственного Telegram-бота.
    async fn create_backup(&self) -> Result<(), PanelError>;
}

/// Открывает сессию с панелью конкретного сервера.
pub trait PanelConnector: Send + Sync {
    fn connect(&self, server: &Server) -> Result<Arc<dyn PanelApi>, PanelError>;
}

#[derive(Debug, Deserialize)]
struct PanelResponse<T> {
    success: bool,
    #[serde(default)]
    msg: String,
    obj: Option<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct XuiClient<'a> {
    id: &'a str,
    email: &'a str,
    enable: bool,
    flow: &'a str,
    limit_ip: i64,
    #[serde(rename = "totalGB")]
    total_gb: i64,
    expiry_time: i64,
    tg_id: i64,
    sub_id: &'a str,
    reset: i64,
}

#[derive(Debug, Serialize)]
struct XuiClientSettings<'a> {
    clients: Vec<XuiClient<'a>>,
}

#[derive(Debug, Serialize)]
struct ClientRequest {
    id: i64,
    settings: String,
}

fn client_request(inbound_id: i64, client: &ClientSpec) -> Result<ClientRequest, serde_json::Error> {
    let settings = XuiClientSettings {
        clients: vec![XuiClient {
            id: &client.client_id,
            email: &client.email,
            enable: true,
            flow: &client.flow,
            limit_ip: client.limit_ip,
            total_gb: client.total_gb,
            expiry_time: client.expiry_time,
            tg_id: client.tg_id,
            sub_id: &client.email,
            reset: 0,
        }],
    };
    Ok(ClientRequest {
        id: inbound_id,
        settings: serde_json::to_string(&settings)?,
    })
}

fn is_duplicate_client(msg: &str) -> bool {
    msg.to_lowercase().contains("duplicate")
}

pub struct XuiPanel {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    session: OnceCell<()>,
}

impl XuiPanel {
    pub fn new(api_url: &str, config: &PanelConfig) -> Result<Self, PanelError> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: api_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            client,
            session: OnceCell::new(),
        })
    }

    async fn ensure_session(&self) -> Result<(), PanelError> {
        self.session.get_or_try_init(|| self.login_request()).await?;
        Ok(())
    }

    async fn login_request(&self) -> Result<(), PanelError> {
        let url = format!("{}/login", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await?;
        Self::expect_success::<serde_json::Value>("login", response).await?;
        tracing::debug!(panel = %self.base_url, "Авторизация в панели выполнена");
        Ok(())
    }

    async fn expect_success<T: serde::de::DeserializeOwned>(
        action: &'static str,
        response: reqwest::Response,
    ) -> Result<Option<T>, PanelError> {
        let status = response.status();
        if !status.is_success() {
            return Err(PanelError::Status { action, status });
        }
        let body = response.text().await?;
        let parsed: PanelResponse<T> = serde_json::from_str(&body)?;
        if !parsed.success {
            return Err(PanelError::Rejected {
                action,
                msg: parsed.msg,
            });
        }
        Ok(parsed.obj)
    }

    async fn post_client(
        &self,
        action: &'static str,
        path: &str,
        request: &ClientRequest,
    ) -> Result<(), PanelError> {
        let url = format!("{}/panel/api/inbounds/{}", self.base_url, path);
        let response = self.client.post(&url).json(request).send().await?;
        Self::expect_success::<serde_json::Value>(action, response).await?;
        Ok(())
    }
}

#[async_trait]
impl PanelApi for XuiPanel {
    async fn login(&self) -> Result<(), PanelError> {
        self.login_request().await?;
        let _ = self.session.set(());
        Ok(())
    }

    async fn list_online_clients(&self) -> Result<Vec<String>, PanelError> {
        self.ensure_session().await?;
        let url = format!("{}/panel/api/inbounds/onlines", self.base_url);
        let response = self.client.post(&url).send().await?;
        let online = Self::expect_success::<Vec<String>>("onlines", response).await?;
        Ok(online.unwrap_or_default())
    }

    async fn create_client(&self, inbound_id: i64, client: &ClientSpec) -> Result<(), PanelError> {
        self.ensure_session().await?;
        let request = client_request(inbound_id, client)?;
        match self.post_client("addClient", "addClient", &request).await {
            Err(PanelError::Rejected { msg, .. }) if is_duplicate_client(&msg) => {
                tracing::debug!(
                    panel = %self.base_url,
                    client_id = %client.client_id,
                    "Клиент уже существует, обновляю"
                );
                self.post_client(
                    "updateClient",
                    &format!("updateClient/{}", client.client_id),
                    &request,
                )
                .await
            }
            other => other,
        }
    }

    async fn create_backup(&self) -> Result<(), PanelError> {
        self.ensure_session().await?;
        let url = format!("{}/panel/api/inbounds/createbackup", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PanelError::Status {
                action: "createbackup",
                status,
            });
        }
        Ok(())
    }
}

/// Подключения к реальным панелям 3x-ui с общими учётными данными администратора.
pub struct XuiConnector {
    config: PanelConfig,
}

impl XuiConnector {
    pub fn new(config: PanelConfig) -> Self {
        Self { config }
    }
}

impl PanelConnector for XuiConnector {
    fn connect(&self, server: &Server) -> Result<Arc<dyn PanelApi>, PanelError> {
        let panel = XuiPanel::new(&server.api_url, &self.config)?;
        Ok(Arc::new(panel))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Панель в памяти для тестов синхронизации и проверок доступности.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct FakePanels {
        /// (api_url, client_id) -> последний применённый клиент
        pub clients: Mutex<HashMap<(String, String), ClientSpec>>,
        pub failing_clients: HashSet<String>,
        pub unreachable: HashSet<String>,
        pub online: HashMap<String, Vec<String>>,
        pub backups: Mutex<Vec<String>>,
        pub delay: Duration,
        pub calls: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
    }

    impl FakePanels {
        pub fn client_count(&self) -> usize {
            self.clients.lock().unwrap().len()
        }
    }

    pub struct FakePanel {
        api_url: String,
        panels: Arc<FakePanels>,
    }

    impl FakePanel {
        fn check_reachable(&self) -> Result<(), PanelError> {
            if self.panels.unreachable.contains(&self.api_url) {
                return Err(PanelError::Rejected {
                    action: "login",
                    msg: "connection refused".to_string(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PanelApi for FakePanel {
        async fn login(&self) -> Result<(), PanelError> {
            self.check_reachable()
        }

        async fn list_online_clients(&self) -> Result<Vec<String>, PanelError> {
            self.check_reachable()?;
            Ok(self.panels.online.get(&self.api_url).cloned().unwrap_or_default())
        }

        async fn create_client(&self, _inbound_id: i64, client: &ClientSpec) -> Result<(), PanelError> {
            let panels = &self.panels;
            panels.calls.fetch_add(1, Ordering::SeqCst);
            let now = panels.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            panels.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !panels.delay.is_zero() {
                tokio::time::sleep(panels.delay).await;
            }
            panels.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.check_reachable()?;
            if panels.failing_clients.contains(&client.client_id) {
                return Err(PanelError::Rejected {
                    action: "addClient",
                    msg: "inbound not found".to_string(),
                });
            }
            panels
                .clients
                .lock()
                .unwrap()
                .insert((self.api_url.clone(), client.client_id.clone()), client.clone());
            Ok(())
        }

        async fn create_backup(&self) -> Result<(), PanelError> {
            self.check_reachable()?;
            self.panels.backups.lock().unwrap().push(self.api_url.clone());
            Ok(())
        }
    }

    pub struct FakeConnector(pub Arc<FakePanels>);

    impl PanelConnector for FakeConnector {
        fn connect(&self, server: &Server) -> Result<Arc<dyn PanelApi>, PanelError> {
            Ok(Arc::new(FakePanel {
                api_url: server.api_url.clone(),
                panels: Arc::clone(&self.0),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec() -> ClientSpec {
        ClientSpec {
            tg_id: 42,
            client_id: "6f1c1c0e-4a53-4bb5-9a9f-0d5d7d1f9a10".to_string(),
            email: "abc123".to_string(),
            expiry_time: 1_900_000_000_000,
            flow: "xtls-rprx-vision".to_string(),
            limit_ip: 0,
            total_gb: 0,
        }
    }

    fn panel_config() -> PanelConfig {
        crate::config::test_config().panel
    }

    fn ok_body() -> serde_json::Value {
        serde_json::json!({ "success": true, "msg": "", "obj": null })
    }

    #[test]
    fn client_settings_use_panel_field_names() {
        let request = client_request(3, &spec()).unwrap();
        assert_eq!(request.id, 3);
        let settings: serde_json::Value = serde_json::from_str(&request.settings).unwrap();
        let client = &settings["clients"][0];
        assert_eq!(client["id"], "6f1c1c0e-4a53-4bb5-9a9f-0d5d7d1f9a10");
        assert_eq!(client["email"], "abc123");
        assert_eq!(client["subId"], "abc123");
        assert_eq!(client["tgId"], 42);
        assert_eq!(client["expiryTime"], 1_900_000_000_000i64);
        assert_eq!(client["totalGB"], 0);
        assert_eq!(client["limitIp"], 0);
        assert_eq!(client["enable"], true);
    }

    #[tokio::test]
    async fn create_client_logs_in_once_and_adds_client() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/panel/api/inbounds/addClient"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(2)
            .mount(&server)
            .await;

        let panel = XuiPanel::new(&format!("{}/", server.uri()), &panel_config()).unwrap();
        panel.create_client(1, &spec()).await.unwrap();
        panel.create_client(1, &spec()).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_client_is_updated_instead() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/panel/api/inbounds/addClient"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "msg": "Something went wrong! Failed: Duplicate email: abc123",
                "obj": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/panel/api/inbounds/updateClient/{}", spec().client_id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .expect(1)
            .mount(&server)
            .await;

        let panel = XuiPanel::new(&server.uri(), &panel_config()).unwrap();
        panel.create_client(1, &spec()).await.unwrap();
    }

    #[tokio::test]
    async fn failed_login_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "msg": "Invalid username or password",
                "obj": null
            })))
            .mount(&server)
            .await;

        let panel = XuiPanel::new(&server.uri(), &panel_config()).unwrap();
        let err = panel.login().await.unwrap_err();
        assert!(matches!(err, PanelError::Rejected { action: "login", .. }));
    }

    #[tokio::test]
    async fn online_clients_are_listed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body()))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/panel/api/inbounds/onlines"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "msg": "",
                "obj": ["abc123", "def456"]
            })))
            .mount(&server)
            .await;

        let panel = XuiPanel::new(&server.uri(), &panel_config()).unwrap();
        panel.login().await.unwrap();
        assert_eq!(panel.list_online_clients().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn http_error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let panel = XuiPanel::new(&server.uri(), &panel_config()).unwrap();
        let err = panel.list_online_clients().await.unwrap_err();
        assert!(matches!(err, PanelError::Status { action: "login", .. }));
    }
}
