//! Админ-панель и управление кластерами.

use super::reply_target;
use crate::balancer::{ClusterLoads, Topology};
use crate::bot::handlers::format::{
    CLUSTERS_EDITOR_TEXT, render_availability, render_backup, render_loads, render_sync_report,
};
use crate::bot::handlers::shared::{HandlerResult, edit_or_send, require_admin_callback, send_csv};
use crate::bot::handlers::state::BotState;
use crate::bot::handlers::wizard::ClusterWizard;
use crate::bot::keyboards::{
    self, CB_ADMIN_CLUSTERS, CB_ADMIN_LOADS, CB_ADMIN_PANEL, CB_ADMIN_PAYMENTS_CSV, CB_ADMIN_USERS_CSV,
    ClusterAction,
};
use crate::export::{payments_csv, users_csv};
use crate::probe::{backup_cluster, probe_cluster};
use crate::sync::SyncTarget;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::MessageId;

pub async fn callback_admin(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(admin_id) = require_admin_callback(&bot, &q, &state).await? else {
        return Ok(());
    };
    bot.answer_callback_query(q.id.clone()).await?;
    let (chat_id, message_id) = reply_target(&q);
    let data = q.data.as_deref().unwrap_or("");
    tracing::info!(admin_id = admin_id, action = %data, "Admin callback received");

    match data {
        CB_ADMIN_PANEL => {
            state.cluster_wizards.lock().await.remove(&admin_id);
            edit_or_send(
                &bot,
                chat_id,
                message_id,
                "🔧 Панель администратора",
                keyboards::admin_panel(),
            )
            .await?;
        }
        CB_ADMIN_CLUSTERS => {
            state.cluster_wizards.lock().await.remove(&admin_id);
            show_clusters(&bot, chat_id, message_id, &state).await?;
        }
        CB_ADMIN_LOADS => {
            let topology = Topology::load(&state.db).await?;
            let keys = state.db.all_keys().await?;
            let loads = ClusterLoads::estimate(&topology, &keys);
            edit_or_send(
                &bot,
                chat_id,
                message_id,
                render_loads(&loads),
                keyboards::admin_back(CB_ADMIN_PANEL),
            )
            .await?;
        }
        CB_ADMIN_USERS_CSV => {
            let users = state.db.list_users_for_export().await?;
            send_csv(&bot, chat_id, users_csv(&users)?).await?;
        }
        CB_ADMIN_PAYMENTS_CSV => {
            let payments = state.db.list_payments_for_export(None).await?;
            send_csv(&bot, chat_id, payments_csv(&payments, None)?).await?;
        }
        other => {
            tracing::warn!(data = %other, "Неизвестная команда админ-панели");
        }
    }
    Ok(())
}

async fn show_clusters(
    bot: &Bot,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    state: &BotState,
) -> HandlerResult {
    let topology = Topology::load(&state.db).await?;
    let mut text = CLUSTERS_EDITOR_TEXT.to_string();
    if topology.is_empty() {
        text.push_str("\n\nКластеров пока нет. Добавьте первый.");
    }
    edit_or_send(
        bot,
        chat_id,
        message_id,
        text,
        keyboards::clusters_editor(topology.cluster_names()),
    )
    .await
}

pub async fn callback_cluster(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let Some(admin_id) = require_admin_callback(&bot, &q, &state).await? else {
        return Ok(());
    };
    let data = q.data.as_deref().unwrap_or("");
    let Some(action) = ClusterAction::parse(data) else {
        bot.answer_callback_query(q.id.clone())
            .text("Некорректная команда")
            .await?;
        return Ok(());
    };
    tracing::info!(admin_id = admin_id, action = ?action, "Cluster callback received");

    let (chat_id, message_id) = reply_target(&q);
    let topology = Topology::load(&state.db).await?;

    match action {
        ClusterAction::Add => {
            bot.answer_callback_query(q.id.clone()).await?;
            let wizard = ClusterWizard::new_cluster();
            let prompt = wizard.prompt();
            state.cluster_wizards.lock().await.insert(admin_id, wizard);
            edit_or_send(&bot, chat_id, message_id, prompt, keyboards::admin_back(CB_ADMIN_CLUSTERS)).await?;
        }
        ClusterAction::AddServer(cluster) => {
            if topology.cluster(&cluster).is_empty() {
                return answer_cluster_missing(&bot, &q, &cluster).await;
            }
            bot.answer_callback_query(q.id.clone()).await?;
            let wizard = ClusterWizard::for_cluster(&cluster);
            let prompt = wizard.prompt();
            state.cluster_wizards.lock().await.insert(admin_id, wizard);
            edit_or_send(&bot, chat_id, message_id, prompt, keyboards::admin_back(CB_ADMIN_CLUSTERS)).await?;
        }
        ClusterAction::Manage(cluster) => {
            let servers = topology.cluster(&cluster);
            if servers.is_empty() {
                return answer_cluster_missing(&bot, &q, &cluster).await;
            }
            bot.answer_callback_query(q.id.clone()).await?;
            edit_or_send(
                &bot,
                chat_id,
                message_id,
                format!("🔧 Управление кластером {}\n\nСерверов: {}", cluster, servers.len()),
                keyboards::manage_cluster(&cluster, servers),
            )
            .await?;
        }
        ClusterAction::Availability(cluster) => {
            let servers = topology.cluster(&cluster);
            if servers.is_empty() {
                return answer_cluster_missing(&bot, &q, &cluster).await;
            }
            bot.answer_callback_query(q.id.clone()).await?;
            edit_or_send(
                &bot,
                chat_id,
                message_id,
                format!(
                    "🖥️ Проверка доступности серверов для кластера {}.\n\n\
                     Это может занять до 1 минуты, пожалуйста, подождите...",
                    cluster
                ),
                keyboards::admin_back(&ClusterAction::Manage(cluster.clone()).callback_data()),
            )
            .await?;

            let report = probe_cluster(
                state.connector.as_ref(),
                &state.availability_executor,
                &cluster,
                servers,
            )
            .await;
            tracing::info!(
                cluster = %cluster,
                online = report.total_online(),
                failed = report.failed(),
                "Проверка доступности завершена"
            );
            edit_or_send(
                &bot,
                chat_id,
                message_id,
                render_availability(&report),
                keyboards::admin_back(&ClusterAction::Manage(cluster.clone()).callback_data()),
            )
            .await?;
        }
        ClusterAction::Backup(cluster) => {
            let servers = topology.cluster(&cluster);
            if servers.is_empty() {
                return answer_cluster_missing(&bot, &q, &cluster).await;
            }
            bot.answer_callback_query(q.id.clone()).text("Создаю бэкап…").await?;
            let failed = backup_cluster(state.connector.as_ref(), &cluster, servers).await;
            edit_or_send(
                &bot,
                chat_id,
                message_id,
                render_backup(&cluster, &failed),
                keyboards::admin_back(&ClusterAction::Manage(cluster.clone()).callback_data()),
            )
            .await?;
        }
        ClusterAction::SyncMenu(cluster) => {
            let servers = topology.cluster(&cluster);
            if servers.is_empty() {
                return answer_cluster_missing(&bot, &q, &cluster).await;
            }
            bot.answer_callback_query(q.id.clone()).await?;
            bot.send_message(chat_id, format!("🔄 Синхронизация кластера {}", cluster))
                .reply_markup(keyboards::sync_cluster(&cluster, servers))
                .await?;
        }
        ClusterAction::SyncCluster(cluster) => {
            bot.answer_callback_query(q.id.clone()).text("Синхронизация запущена").await?;
            spawn_sync(&bot, chat_id, &state, SyncTarget::Cluster(cluster)).await?;
        }
        ClusterAction::SyncServer { cluster, server } => {
            bot.answer_callback_query(q.id.clone()).text("Синхронизация запущена").await?;
            spawn_sync(&bot, chat_id, &state, SyncTarget::Server { cluster, server }).await?;
        }
        ClusterAction::DeleteServer { cluster, server } => {
            let deleted = state.db.delete_server(&cluster, &server).await?;
            let notice = if deleted {
                tracing::info!(admin_id = admin_id, cluster = %cluster, server = %server, "Сервер удалён");
                format!("Сервер {} удалён", server)
            } else {
                "Сервер уже удалён".to_string()
            };
            bot.answer_callback_query(q.id.clone()).text(notice).await?;

            let topology = Topology::load(&state.db).await?;
            let servers = topology.cluster(&cluster);
            if servers.is_empty() {
                show_clusters(&bot, chat_id, message_id, &state).await?;
            } else {
                edit_or_send(
                    &bot,
                    chat_id,
                    message_id,
                    format!("🔧 Управление кластером {}\n\nСерверов: {}", cluster, servers.len()),
                    keyboards::manage_cluster(&cluster, servers),
                )
                .await?;
            }
        }
    }
    Ok(())
}

async fn answer_cluster_missing(bot: &Bot, q: &CallbackQuery, cluster: &str) -> HandlerResult {
    bot.answer_callback_query(q.id.clone())
        .text(format!("Кластер '{}' не содержит серверов.", cluster))
        .show_alert(true)
        .await?;
    Ok(())
}

/// Синхронизация идёт в фоне; итог приходит отдельным сообщением.
async fn spawn_sync(bot: &Bot, chat_id: ChatId, state: &BotState, target: SyncTarget) -> HandlerResult {
    bot.send_message(chat_id, format!("🔄 Запущена синхронизация: {}", target))
        .await?;

    let bot = bot.clone();
    let synchronizer = Arc::clone(&state.synchronizer);
    let back = keyboards::admin_back(&ClusterAction::Manage(target.cluster().to_string()).callback_data());
    tokio::spawn(async move {
        let text = match synchronizer.sync(&target).await {
            Ok(report) => render_sync_report(&report),
            Err(error) => {
                tracing::error!(sync_target = %target, error = %error, "Ошибка синхронизации ключей");
                format!("❌ Произошла ошибка при синхронизации: {}", error)
            }
        };
        if let Err(error) = bot.send_message(chat_id, text).reply_markup(back).await {
            tracing::warn!(error = %error, "Не удалось отправить итог синхронизации");
        }
    });
    Ok(())
}
