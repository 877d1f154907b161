use super::shared::HandlerResult;
use super::state::{BotState, sender_user_id};
use super::wizard::{ClusterWizard, WizardError, WizardStep};
use crate::bot::keyboards::{CB_ADMIN_CLUSTERS, admin_back};
use crate::db::{Db, NewServer};
use std::collections::HashMap;
use teloxide::prelude::*;
use tokio::sync::Mutex;

/// Свободный текст: шаг мастера добавления сервера либо подсказка про /start.
pub async fn handle_menu_buttons(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(user_id) = sender_user_id(&msg) else {
        return Ok(());
    };

    if state.config.is_admin(user_id) && try_process_cluster_wizard(&bot, &msg, &state, user_id, text).await? {
        return Ok(());
    }

    bot.send_message(msg.chat.id, "Не понял запрос. Откройте меню командой /start.")
        .await?;
    Ok(())
}

/// Результат одного шага мастера.
#[derive(Debug)]
enum WizardOutcome {
    /// У администратора нет активного мастера.
    Inactive,
    /// Пока шаг проверялся, мастер сбросили или продвинули другим сообщением.
    Superseded,
    Rejected(String),
    Prompt(String),
    Completed(NewServer),
}

/// Проверяет ввод на копии мастера; блокировка берётся только для чтения и записи карты.
async fn step_wizard(
    wizards: &Mutex<HashMap<i64, ClusterWizard>>,
    db: &Db,
    admin_id: i64,
    text: &str,
) -> Result<WizardOutcome, anyhow::Error> {
    let Some(snapshot) = wizards.lock().await.get(&admin_id).cloned() else {
        return Ok(WizardOutcome::Inactive);
    };

    let value = match snapshot.validate(text) {
        Ok(value) => value,
        Err(error) => return Ok(WizardOutcome::Rejected(error.to_string())),
    };
    if snapshot.step() == WizardStep::ServerName
        && !db.check_unique_server_name(&value, snapshot.cluster_name()).await?
    {
        return Ok(WizardOutcome::Rejected(WizardError::DuplicateServer.to_string()));
    }

    let mut next = snapshot.clone();
    let completed = next.advance(value);

    let mut wizards = wizards.lock().await;
    if wizards.get(&admin_id) != Some(&snapshot) {
        return Ok(WizardOutcome::Superseded);
    }
    Ok(match completed {
        Some(server) => {
            wizards.remove(&admin_id);
            WizardOutcome::Completed(server)
        }
        None => {
            let prompt = next.prompt();
            wizards.insert(admin_id, next);
            WizardOutcome::Prompt(prompt)
        }
    })
}

/// `Ok(true)`, если сообщение поглощено мастером.
async fn try_process_cluster_wizard(
    bot: &Bot,
    msg: &Message,
    state: &BotState,
    admin_id: i64,
    text: &str,
) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
    let server = match step_wizard(&state.cluster_wizards, &state.db, admin_id, text).await? {
        WizardOutcome::Inactive => return Ok(false),
        WizardOutcome::Superseded => {
            tracing::info!(admin_id = admin_id, "Шаг мастера пропущен: состояние уже изменилось");
            return Ok(true);
        }
        WizardOutcome::Rejected(reply) => {
            bot.send_message(msg.chat.id, reply).await?;
            return Ok(true);
        }
        WizardOutcome::Prompt(prompt) => {
            bot.send_message(msg.chat.id, prompt)
                .reply_markup(admin_back(CB_ADMIN_CLUSTERS))
                .await?;
            return Ok(true);
        }
        WizardOutcome::Completed(server) => server,
    };

    state.db.insert_server(&server).await?;
    tracing::info!(
        admin_id = admin_id,
        cluster = %server.cluster_name,
        server = %server.server_name,
        api_url = %server.api_url,
        inbound_id = server.inbound_id,
        "Server added to cluster"
    );
    bot.send_message(
        msg.chat.id,
        format!(
            "✅ Кластер {} и сервер {} успешно добавлены!",
            server.cluster_name, server.server_name
        ),
    )
    .reply_markup(admin_back(CB_ADMIN_CLUSTERS))
    .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{new_server, open_temp_db};

    #[tokio::test]
    async fn wizard_walks_through_every_step() {
        let (_dir, db) = open_temp_db().await;
        let wizards = Mutex::new(HashMap::from([(1, ClusterWizard::new_cluster())]));

        for input in ["eu", "de1", "https://de1.example.com:2053/panel", "https://de1.example.com:2096/sub"] {
            let outcome = step_wizard(&wizards, &db, 1, input).await.unwrap();
            assert!(matches!(outcome, WizardOutcome::Prompt(_)), "{input}: {outcome:?}");
        }
        let WizardOutcome::Completed(server) = step_wizard(&wizards, &db, 1, "3").await.unwrap() else {
            panic!("last step must complete the wizard");
        };

        assert_eq!(server.cluster_name, "eu");
        assert_eq!(server.inbound_id, 3);
        assert!(wizards.lock().await.is_empty());
        assert!(matches!(
            step_wizard(&wizards, &db, 1, "eu").await.unwrap(),
            WizardOutcome::Inactive
        ));
    }

    #[tokio::test]
    async fn duplicate_server_name_keeps_the_step() {
        let (_dir, db) = open_temp_db().await;
        db.insert_server(&new_server("eu", "de1")).await.unwrap();
        let wizards = Mutex::new(HashMap::from([(1, ClusterWizard::for_cluster("eu"))]));

        let outcome = step_wizard(&wizards, &db, 1, "de1").await.unwrap();

        assert!(matches!(outcome, WizardOutcome::Rejected(reply) if reply == WizardError::DuplicateServer.to_string()));
        assert_eq!(wizards.lock().await[&1].step(), WizardStep::ServerName);
        assert!(matches!(
            step_wizard(&wizards, &db, 1, "de2").await.unwrap(),
            WizardOutcome::Prompt(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_messages_advance_the_wizard_once() {
        let (_dir, db) = open_temp_db().await;
        let wizards = Mutex::new(HashMap::from([(1, ClusterWizard::for_cluster("eu"))]));

        let (first, second) = tokio::join!(
            step_wizard(&wizards, &db, 1, "de1"),
            step_wizard(&wizards, &db, 1, "de2")
        );
        let outcomes = [first.unwrap(), second.unwrap()];

        let prompts = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, WizardOutcome::Prompt(_)))
            .count();
        assert_eq!(prompts, 1, "{outcomes:?}");
        assert_eq!(wizards.lock().await[&1].step(), WizardStep::ApiUrl);
    }
}
