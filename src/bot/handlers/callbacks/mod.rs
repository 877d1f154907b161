mod admin;

use super::format::{about_text, render_profile};
use super::onboarding::{handle_check_subscription, handle_trial};
use super::shared::{
    HandlerResult, callback_exact_filter, callback_message_target, callback_prefix_filter, edit_or_send,
    referral_link, send_csv, show_start_menu,
};
use super::state::{BotState, profile_from_user};
use crate::bot::keyboards::{
    CB_ABOUT, CB_CHECK_SUBSCRIPTION, CB_PAY, CB_PROFILE, CB_REFERRALS, CB_START, CB_TRIAL, PaymentMethod,
};
use crate::db::current_unix_timestamp;
use crate::export::referrals_csv;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::types::MessageId;

const PAYMENT_TEXT: &str = "💸 Выберите удобный способ пополнения баланса:\n\n\
    • Быстро и безопасно\n\
    • Поддержка разных платёжных систем\n\
    • Моментальное зачисление средств 🚀";

pub fn handler() -> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    Update::filter_callback_query()
        .branch(dptree::filter_map(callback_exact_filter(CB_START)).endpoint(callback_start))
        .branch(
            dptree::filter_map(callback_exact_filter(CB_CHECK_SUBSCRIPTION))
                .endpoint(handle_check_subscription),
        )
        .branch(dptree::filter_map(callback_exact_filter(CB_TRIAL)).endpoint(handle_trial))
        .branch(dptree::filter_map(callback_exact_filter(CB_PROFILE)).endpoint(callback_profile))
        .branch(dptree::filter_map(callback_exact_filter(CB_REFERRALS)).endpoint(callback_referrals))
        .branch(dptree::filter_map(callback_exact_filter(CB_ABOUT)).endpoint(callback_about))
        .branch(dptree::filter_map(callback_exact_filter(CB_PAY)).endpoint(callback_pay_menu))
        .branch(dptree::filter_map(callback_prefix_filter("pay:")).endpoint(callback_pay_method))
        .branch(dptree::filter_map(callback_prefix_filter("admin:")).endpoint(admin::callback_admin))
        .branch(dptree::filter_map(callback_prefix_filter("cluster:")).endpoint(admin::callback_cluster))
}

/// Куда отвечать на нажатие: сообщение с кнопкой либо личный чат пользователя.
fn reply_target(q: &CallbackQuery) -> (ChatId, Option<MessageId>) {
    match callback_message_target(q) {
        Some((chat_id, message_id)) => (chat_id, Some(message_id)),
        None => (ChatId(q.from.id.0 as i64), None),
    }
}

async fn callback_start(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    bot.answer_callback_query(q.id.clone()).await?;
    let tg_id = q.from.id.0 as i64;
    state.db.ensure_user(&profile_from_user(&q.from)).await?;
    let (chat_id, message_id) = reply_target(&q);
    show_start_menu(&bot, chat_id, message_id, &state, tg_id).await
}

async fn callback_profile(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    bot.answer_callback_query(q.id.clone()).await?;
    let tg_id = q.from.id.0 as i64;
    state.db.ensure_user(&profile_from_user(&q.from)).await?;
    let Some(user) = state.db.get_user(tg_id).await? else {
        return Ok(());
    };

    let keys = state.db.keys_by_tg_id(tg_id).await?;
    let referrals = state.db.count_referrals(tg_id).await?;
    let link = referral_link(&state, tg_id);
    let text = render_profile(&user, &keys, current_unix_timestamp()?, referrals, link.as_deref());

    let (chat_id, message_id) = reply_target(&q);
    edit_or_send(&bot, chat_id, message_id, text, crate::bot::keyboards::profile_menu()).await
}

async fn callback_referrals(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let tg_id = q.from.id.0 as i64;
    let rows = state.db.list_referrals_for_export(tg_id).await?;
    let Some(file) = referrals_csv(tg_id, &rows)? else {
        bot.answer_callback_query(q.id.clone())
            .text("У вас пока нет приглашённых друзей.")
            .show_alert(true)
            .await?;
        return Ok(());
    };

    bot.answer_callback_query(q.id.clone()).await?;
    let (chat_id, _) = reply_target(&q);
    send_csv(&bot, chat_id, file).await
}

async fn callback_about(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    bot.answer_callback_query(q.id.clone()).await?;
    let (chat_id, message_id) = reply_target(&q);
    edit_or_send(
        &bot,
        chat_id,
        message_id,
        about_text(),
        crate::bot::keyboards::about_menu(&state.config),
    )
    .await
}

async fn callback_pay_menu(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    bot.answer_callback_query(q.id.clone()).await?;
    let (chat_id, message_id) = reply_target(&q);
    edit_or_send(
        &bot,
        chat_id,
        message_id,
        PAYMENT_TEXT,
        crate::bot::keyboards::payment_methods(&state.config.payments),
    )
    .await
}

async fn callback_pay_method(bot: Bot, q: CallbackQuery) -> HandlerResult {
    let data = q.data.as_deref().unwrap_or("");
    let text = match PaymentMethod::parse(data) {
        Some(method) => {
            tracing::info!(tg_id = q.from.id.0, method = ?method, "Выбран способ оплаты");
            format!(
                "Способ «{}» пока недоступен. Для пополнения обратитесь в поддержку.",
                method.title()
            )
        }
        None => "Неизвестный способ оплаты".to_string(),
    };
    bot.answer_callback_query(q.id.clone())
        .text(text)
        .show_alert(true)
        .await?;
    Ok(())
}
