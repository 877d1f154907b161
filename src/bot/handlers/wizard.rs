//! Пошаговое добавление сервера в кластер: имя кластера, имя сервера, API URL,
//! subscription URL, inbound id. Каждый шаг валидируется до изменения состояния.

use crate::db::NewServer;
use thiserror::Error;

pub const MAX_NAME_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WizardError {
    #[error("❌ Имя {0} не может быть пустым. Попробуйте снова.")]
    EmptyName(&'static str),
    #[error("❌ Имя {0} не должно превышать 12 символов. Попробуйте снова.")]
    NameTooLong(&'static str),
    #[error("❌ Имя {0} может содержать только латиницу, цифры, «_» и «-». Попробуйте снова.")]
    InvalidNameChars(&'static str),
    #[error("❌ {0} должен начинаться с https://. Попробуйте снова.")]
    NotHttps(&'static str),
    #[error("❌ inbound_id должен быть числовым значением. Попробуйте снова.")]
    InboundNotNumeric,
    #[error("❌ Сервер с таким именем уже существует. Пожалуйста, выберите другое имя.")]
    DuplicateServer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardStep {
    ClusterName,
    ServerName,
    ApiUrl,
    SubscriptionUrl,
    InboundId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterWizard {
    step: WizardStep,
    cluster_name: String,
    server_name: String,
    api_url: String,
    subscription_url: String,
}

fn validate_name(raw: &str, what: &'static str) -> Result<String, WizardError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(WizardError::EmptyName(what));
    }
    if name.chars().count() > MAX_NAME_LEN {
        return Err(WizardError::NameTooLong(what));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(WizardError::InvalidNameChars(what));
    }
    Ok(name.to_string())
}

fn validate_https(raw: &str, what: &'static str) -> Result<String, WizardError> {
    let url = raw.trim();
    if !url.starts_with("https://") {
        return Err(WizardError::NotHttps(what));
    }
    Ok(url.trim_end_matches('/').to_string())
}

impl ClusterWizard {
    pub fn new_cluster() -> Self {
        Self {
            step: WizardStep::ClusterName,
            cluster_name: String::new(),
            server_name: String::new(),
            api_url: String::new(),
            subscription_url: String::new(),
        }
    }

    /// Добавление сервера в уже существующий кластер: шаг с именем кластера пропускается.
    pub fn for_cluster(cluster_name: &str) -> Self {
        Self {
            step: WizardStep::ServerName,
            cluster_name: cluster_name.to_string(),
            ..Self::new_cluster()
        }
    }

    pub fn step(&self) -> WizardStep {
        self.step
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn prompt(&self) -> String {
        match self.step {
            WizardStep::ClusterName => "🔧 Введите имя нового кластера:\n\n\
                 Имя не должно превышать 12 символов.\n\n\
                 Пример: cluster1 или us_east_1"
                .to_string(),
            WizardStep::ServerName => format!(
                "Введите имя сервера для кластера {}:\n\n\
                 Рекомендуется указать локацию и номер сервера в имени.\n\n\
                 Пример: de1, fra1, fi2",
                self.cluster_name
            ),
            WizardStep::ApiUrl => format!(
                "Введите API URL для сервера {} в кластере {}:\n\n\
                 Ссылку можно найти в адресной строке браузера при входе в 3X-UI.\n\n\
                 Формат: https://your_domain:port/panel_path/",
                self.server_name, self.cluster_name
            ),
            WizardStep::SubscriptionUrl => format!(
                "Введите subscription_url для сервера {} в кластере {}:\n\n\
                 Ссылку можно найти в панели 3X-UI, в информации о клиенте.\n\n\
                 Формат: https://your_domain:port_sub/sub_path/",
                self.server_name, self.cluster_name
            ),
            WizardStep::InboundId => format!(
                "Введите inbound_id для сервера {} в кластере {}:\n\n\
                 Это номер подключения vless в панели 3x-ui. Обычно это 1.",
                self.server_name, self.cluster_name
            ),
        }
    }

    /// Проверяет ввод для текущего шага, не меняя состояние.
    pub fn validate(&self, input: &str) -> Result<String, WizardError> {
        match self.step {
            WizardStep::ClusterName => validate_name(input, "кластера"),
            WizardStep::ServerName => validate_name(input, "сервера"),
            WizardStep::ApiUrl => validate_https(input, "API URL"),
            WizardStep::SubscriptionUrl => validate_https(input, "subscription_url"),
            WizardStep::InboundId => {
                let trimmed = input.trim();
                if trimmed.is_empty() || !trimmed.chars().all(|c| c.is_ascii_digit()) {
                    return Err(WizardError::InboundNotNumeric);
                }
                trimmed
                    .parse::<i64>()
                    .map(|_| trimmed.to_string())
                    .map_err(|_| WizardError::InboundNotNumeric)
            }
        }
    }

    /// Применяет проверенное значение. На последнем шаге возвращает готовый сервер.
    pub fn advance(&mut self, value: String) -> Option<NewServer> {
        match self.step {
            WizardStep::ClusterName => {
                self.cluster_name = value;
                self.step = WizardStep::ServerName;
            }
            WizardStep::ServerName => {
                self.server_name = value;
                self.step = WizardStep::ApiUrl;
            }
            WizardStep::ApiUrl => {
                self.api_url = value;
                self.step = WizardStep::SubscriptionUrl;
            }
            WizardStep::SubscriptionUrl => {
                self.subscription_url = value;
                self.step = WizardStep::InboundId;
            }
            WizardStep::InboundId => {
                let inbound_id = value.parse::<i64>().ok()?;
                return Some(NewServer {
                    cluster_name: self.cluster_name.clone(),
                    server_name: self.server_name.clone(),
                    api_url: self.api_url.clone(),
                    subscription_url: self.subscription_url.clone(),
                    inbound_id,
                });
            }
        }
        None
    }
}
