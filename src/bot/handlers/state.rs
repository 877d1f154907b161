use super::wizard::ClusterWizard;
use crate::config::Config;
use crate::db::{Db, TelegramProfile};
use crate::keys::KeyIssuer;
use crate::panel::PanelConnector;
use crate::sync::{BoundedExecutor, KeySynchronizer};
use std::collections::HashMap;
use std::sync::Arc;
use teloxide::types::{Message, User};
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct BotState {
    pub config: Arc<Config>,
    pub db: Arc<Db>,
    pub connector: Arc<dyn PanelConnector>,
    pub synchronizer: Arc<KeySynchronizer>,
    pub issuer: Arc<KeyIssuer>,
    /// Для проверки доступности серверов: лимит из `[sync]`, без паузы.
    pub availability_executor: BoundedExecutor,
    pub bot_username: Option<String>,
    /// Незавершённые мастера добавления сервера, по id администратора.
    pub cluster_wizards: Arc<Mutex<HashMap<i64, ClusterWizard>>>,
    /// Текст /start, отложенный до подтверждения подписки на канал.
    pub pending_starts: Arc<Mutex<HashMap<i64, String>>>,
}

impl BotState {
    pub fn new(
        config: Arc<Config>,
        db: Arc<Db>,
        connector: Arc<dyn PanelConnector>,
        bot_username: Option<String>,
    ) -> Self {
        let executor = BoundedExecutor::from_config(&config.sync);
        let availability_executor = executor.unpaced();
        let synchronizer = Arc::new(KeySynchronizer::new(
            Arc::clone(&db),
            Arc::clone(&connector),
            config.panel.clone(),
            executor,
        ));
        let issuer = Arc::new(KeyIssuer::new(Arc::clone(&db), Arc::clone(&connector), &config));
        Self {
            config,
            db,
            connector,
            synchronizer,
            issuer,
            availability_executor,
            bot_username,
            cluster_wizards: Arc::new(Mutex::new(HashMap::new())),
            pending_starts: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn sender_user_id(msg: &Message) -> Option<i64> {
    msg.from.as_ref().map(|user| user.id.0 as i64)
}

pub fn profile_from_user(user: &User) -> TelegramProfile {
    TelegramProfile {
        tg_id: user.id.0 as i64,
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
        language_code: user.language_code.clone(),
        is_bot: user.is_bot,
    }
}

pub fn is_admin_message(msg: &Message, state: &BotState) -> bool {
    sender_user_id(msg).is_some_and(|user_id| state.config.is_admin(user_id))
}
