//! Inline-клавиатуры бота и разбор callback data.

use crate::config::{Config, PaymentsConfig};
use crate::db::Server;
use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

pub const CB_START: &str = "start";
pub const CB_TRIAL: &str = "user:trial";
pub const CB_PROFILE: &str = "user:profile";
pub const CB_ABOUT: &str = "user:about";
pub const CB_REFERRALS: &str = "user:referrals";
pub const CB_CHECK_SUBSCRIPTION: &str = "user:check_sub";
pub const CB_PAY: &str = "pay:menu";

pub const CB_ADMIN_PANEL: &str = "admin:panel";
pub const CB_ADMIN_CLUSTERS: &str = "admin:clusters";
pub const CB_ADMIN_LOADS: &str = "admin:loads";
pub const CB_ADMIN_USERS_CSV: &str = "admin:users_csv";
pub const CB_ADMIN_PAYMENTS_CSV: &str = "admin:payments_csv";

/// Способы пополнения, которые можно включить в конфиге.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMethod {
    Yookassa,
    Yoomoney,
    Cryptobot,
    Stars,
    Robokassa,
    Donate,
}

impl PaymentMethod {
    const ALL: [PaymentMethod; 6] = [
        PaymentMethod::Yookassa,
        PaymentMethod::Yoomoney,
        PaymentMethod::Cryptobot,
        PaymentMethod::Stars,
        PaymentMethod::Robokassa,
        PaymentMethod::Donate,
    ];

    fn slug(self) -> &'static str {
        match self {
            PaymentMethod::Yookassa => "yookassa",
            PaymentMethod::Yoomoney => "yoomoney",
            PaymentMethod::Cryptobot => "cryptobot",
            PaymentMethod::Stars => "stars",
            PaymentMethod::Robokassa => "robokassa",
            PaymentMethod::Donate => "donate",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            PaymentMethod::Yookassa => "💳 ЮКасса: СБП, SberPay, T-pay",
            PaymentMethod::Yoomoney => "💳 ЮМани: перевод по карте",
            PaymentMethod::Cryptobot => "💰 CryptoBot: криптовалюта",
            PaymentMethod::Stars => "⭐ Оплата Звездами",
            PaymentMethod::Robokassa => "⭐ RoboKassa",
            PaymentMethod::Donate => "💰 Поддержать проект",
        }
    }

    fn enabled(self, payments: &PaymentsConfig) -> bool {
        match self {
            PaymentMethod::Yookassa => payments.yookassa,
            PaymentMethod::Yoomoney => payments.yoomoney,
            PaymentMethod::Cryptobot => payments.cryptobot,
            PaymentMethod::Stars => payments.stars,
            PaymentMethod::Robokassa => payments.robokassa,
            PaymentMethod::Donate => payments.donations,
        }
    }

    pub fn callback_data(self) -> String {
        format!("pay:{}", self.slug())
    }

    pub fn parse(data: &str) -> Option<Self> {
        let slug = data.strip_prefix("pay:")?;
        Self::ALL.into_iter().find(|method| method.slug() == slug)
    }

    pub fn enabled_methods(payments: &PaymentsConfig) -> Vec<PaymentMethod> {
        Self::ALL
            .into_iter()
            .filter(|method| method.enabled(payments))
            .collect()
    }
}

/// Действия над кластерами в админке. Имена кластеров и серверов не содержат `:`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterAction {
    Add,
    Manage(String),
    Availability(String),
    Backup(String),
    SyncMenu(String),
    SyncCluster(String),
    SyncServer { cluster: String, server: String },
    AddServer(String),
    DeleteServer { cluster: String, server: String },
}

impl ClusterAction {
    pub fn callback_data(&self) -> String {
        match self {
            ClusterAction::Add => "cluster:add".to_string(),
            ClusterAction::Manage(cluster) => format!("cluster:manage:{}", cluster),
            ClusterAction::Availability(cluster) => format!("cluster:availability:{}", cluster),
            ClusterAction::Backup(cluster) => format!("cluster:backup:{}", cluster),
            ClusterAction::SyncMenu(cluster) => format!("cluster:sync:{}", cluster),
            ClusterAction::SyncCluster(cluster) => format!("cluster:sync-cluster:{}", cluster),
            ClusterAction::SyncServer { cluster, server } => {
                format!("cluster:sync-server:{}:{}", cluster, server)
            }
            ClusterAction::AddServer(cluster) => format!("cluster:add-server:{}", cluster),
            ClusterAction::DeleteServer { cluster, server } => {
                format!("cluster:delete-server:{}:{}", cluster, server)
            }
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        let payload = data.strip_prefix("cluster:")?;
        let mut parts = payload.split(':');
        let action = parts.next()?;
        let cluster = parts.next().filter(|value| !value.is_empty()).map(str::to_string);
        let server = parts.next().filter(|value| !value.is_empty()).map(str::to_string);
        if parts.next().is_some() {
            return None;
        }

        let parsed = match (action, cluster, server) {
            ("add", None, None) => ClusterAction::Add,
            ("manage", Some(cluster), None) => ClusterAction::Manage(cluster),
            ("availability", Some(cluster), None) => ClusterAction::Availability(cluster),
            ("backup", Some(cluster), None) => ClusterAction::Backup(cluster),
            ("sync", Some(cluster), None) => ClusterAction::SyncMenu(cluster),
            ("sync-cluster", Some(cluster), None) => ClusterAction::SyncCluster(cluster),
            ("sync-server", Some(cluster), Some(server)) => ClusterAction::SyncServer { cluster, server },
            ("add-server", Some(cluster), None) => ClusterAction::AddServer(cluster),
            ("delete-server", Some(cluster), Some(server)) => {
                ClusterAction::DeleteServer { cluster, server }
            }
            _ => return None,
        };
        Some(parsed)
    }

    fn button(&self, text: impl Into<String>) -> InlineKeyboardButton {
        InlineKeyboardButton::callback(text, self.callback_data())
    }
}

fn url_button(text: &str, url: &str) -> Option<InlineKeyboardButton> {
    match reqwest::Url::parse(url) {
        Ok(url) => Some(InlineKeyboardButton::url(text, url)),
        Err(error) => {
            tracing::warn!(url = %url, error = %error, "Некорректная ссылка для кнопки");
            None
        }
    }
}

fn back_button(callback: &str) -> InlineKeyboardButton {
    InlineKeyboardButton::callback("⬅️ Назад", callback)
}

pub fn start_menu(config: &Config, trial_available: bool, is_admin: bool) -> InlineKeyboardMarkup {
    let mut kb = InlineKeyboardMarkup::default();
    if trial_available {
        kb = kb.append_row(vec![InlineKeyboardButton::callback("🔗 Подключить VPN", CB_TRIAL)]);
    }
    kb = kb.append_row(vec![InlineKeyboardButton::callback("👤 Личный кабинет", CB_PROFILE)]);

    let links: Vec<InlineKeyboardButton> = [
        url_button("📞 Поддержка", &config.support_chat_url),
        config
            .channel
            .url
            .as_deref()
            .and_then(|url| url_button("📢 Канал", url)),
    ]
    .into_iter()
    .flatten()
    .collect();
    if !links.is_empty() {
        kb = kb.append_row(links);
    }

    if is_admin {
        kb = kb.append_row(vec![InlineKeyboardButton::callback("🔧 Администратор", CB_ADMIN_PANEL)]);
    }
    kb.append_row(vec![InlineKeyboardButton::callback("🌐 О VPN", CB_ABOUT)])
}

pub fn about_menu(config: &Config) -> InlineKeyboardMarkup {
    let mut kb = InlineKeyboardMarkup::default();
    if config.payments.donations {
        kb = kb.append_row(vec![InlineKeyboardButton::callback(
            PaymentMethod::Donate.title(),
            PaymentMethod::Donate.callback_data(),
        )]);
    }
    if let Some(button) = url_button("📞 Техническая поддержка", &config.support_chat_url) {
        kb = kb.append_row(vec![button]);
    }
    if let Some(button) = config
        .channel
        .url
        .as_deref()
        .and_then(|url| url_button("📢 Канал", url))
    {
        kb = kb.append_row(vec![button]);
    }
    kb.append_row(vec![back_button(CB_START)])
}

pub fn subscription_check() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default().append_row(vec![InlineKeyboardButton::callback(
        "✅ Я подписался",
        CB_CHECK_SUBSCRIPTION,
    )])
}

pub fn profile_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default()
        .append_row(vec![InlineKeyboardButton::callback("💸 Пополнить баланс", CB_PAY)])
        .append_row(vec![InlineKeyboardButton::callback("👥 Мои рефералы", CB_REFERRALS)])
        .append_row(vec![back_button(CB_START)])
}

pub fn payment_methods(payments: &PaymentsConfig) -> InlineKeyboardMarkup {
    let mut kb = InlineKeyboardMarkup::default();
    for method in PaymentMethod::enabled_methods(payments) {
        kb = kb.append_row(vec![InlineKeyboardButton::callback(
            method.title(),
            method.callback_data(),
        )]);
    }
    kb.append_row(vec![InlineKeyboardButton::callback("👤 Личный кабинет", CB_PROFILE)])
}

pub fn admin_panel() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default()
        .append_row(vec![InlineKeyboardButton::callback("🖥️ Кластеры", CB_ADMIN_CLUSTERS)])
        .append_row(vec![InlineKeyboardButton::callback("📊 Загрузка кластеров", CB_ADMIN_LOADS)])
        .append_row(vec![
            InlineKeyboardButton::callback("📄 Пользователи CSV", CB_ADMIN_USERS_CSV),
            InlineKeyboardButton::callback("📄 Платежи CSV", CB_ADMIN_PAYMENTS_CSV),
        ])
        .append_row(vec![back_button(CB_START)])
}

pub fn admin_back(callback: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::default().append_row(vec![back_button(callback)])
}

pub fn clusters_editor<'a>(cluster_names: impl IntoIterator<Item = &'a str>) -> InlineKeyboardMarkup {
    let mut kb = InlineKeyboardMarkup::default();
    for cluster in cluster_names {
        kb = kb.append_row(vec![
            ClusterAction::Manage(cluster.to_string()).button(format!("⚙️ {}", cluster)),
        ]);
    }
    kb.append_row(vec![ClusterAction::Add.button("➕ Добавить кластер")])
        .append_row(vec![back_button(CB_ADMIN_PANEL)])
}

pub fn manage_cluster(cluster: &str, servers: &[Server]) -> InlineKeyboardMarkup {
    let mut kb = InlineKeyboardMarkup::default();
    for server in servers {
        kb = kb.append_row(vec![
            ClusterAction::DeleteServer {
                cluster: cluster.to_string(),
                server: server.server_name.clone(),
            }
            .button(format!("🗑 {}", server.server_name)),
        ]);
    }
    kb.append_row(vec![
        ClusterAction::AddServer(cluster.to_string()).button("➕ Добавить сервер"),
    ])
    .append_row(vec![
        ClusterAction::Availability(cluster.to_string()).button("🌐 Доступность"),
        ClusterAction::Backup(cluster.to_string()).button("💾 Бэкап"),
    ])
    .append_row(vec![
        ClusterAction::SyncMenu(cluster.to_string()).button("🔄 Синхронизация"),
    ])
    .append_row(vec![back_button(CB_ADMIN_CLUSTERS)])
}

pub fn sync_cluster(cluster: &str, servers: &[Server]) -> InlineKeyboardMarkup {
    let mut kb = InlineKeyboardMarkup::default();
    for server in servers {
        kb = kb.append_row(vec![
            ClusterAction::SyncServer {
                cluster: cluster.to_string(),
                server: server.server_name.clone(),
            }
            .button(format!("🔄 {}", server.server_name)),
        ]);
    }
    kb.append_row(vec![
        ClusterAction::SyncCluster(cluster.to_string()).button("⚙️ Синхронизировать кластер"),
    ])
    .append_row(vec![back_button(&ClusterAction::Manage(cluster.to_string()).callback_data())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_actions_parse_back() {
        let actions = [
            ClusterAction::Add,
            ClusterAction::Manage("eu".to_string()),
            ClusterAction::SyncServer {
                cluster: "eu".to_string(),
                server: "de1".to_string(),
            },
            ClusterAction::DeleteServer {
                cluster: "us_east_1".to_string(),
                server: "ny-2".to_string(),
            },
        ];
        for action in actions {
            assert_eq!(ClusterAction::parse(&action.callback_data()), Some(action));
        }
    }

    #[test]
    fn malformed_cluster_callbacks_are_rejected() {
        assert_eq!(ClusterAction::parse("cluster:manage"), None);
        assert_eq!(ClusterAction::parse("cluster:manage:"), None);
        assert_eq!(ClusterAction::parse("cluster:sync-server:eu"), None);
        assert_eq!(ClusterAction::parse("cluster:add:eu"), None);
        assert_eq!(ClusterAction::parse("cluster:drop:eu"), None);
        assert_eq!(ClusterAction::parse("admin:panel"), None);
    }

    #[test]
    fn callback_data_fits_telegram_limit() {
        let action = ClusterAction::DeleteServer {
            cluster: "a".repeat(12),
            server: "b".repeat(12),
        };
        assert!(action.callback_data().len() <= 64);
    }

    #[test]
    fn only_enabled_payment_methods_are_offered() {
        let payments = PaymentsConfig {
            stars: true,
            donations: true,
            ..PaymentsConfig::default()
        };
        assert_eq!(
            PaymentMethod::enabled_methods(&payments),
            vec![PaymentMethod::Stars, PaymentMethod::Donate]
        );
        assert_eq!(PaymentMethod::parse("pay:stars"), Some(PaymentMethod::Stars));
        assert_eq!(PaymentMethod::parse("pay:menu"), None);
    }
}
