//! /start: регистрация пользователя, обязательная подписка на канал, купоны,
//! подарки, реферальные ссылки и пробный ключ.

use super::format::{
    NOT_SUBSCRIBED_YET_TEXT, SUBSCRIPTION_CHECK_ERROR_TEXT, SUBSCRIPTION_CONFIRMED_TEXT,
    SUBSCRIPTION_REQUIRED_TEXT, months_word,
};
use super::shared::{
    HandlerResult, callback_message_target, now_millis, send_issued_key, send_notification,
    show_start_menu,
};
use super::state::{BotState, profile_from_user};
use crate::db::{CouponOutcome, GiftCheck, TelegramProfile};
use teloxide::prelude::*;

const DAY_MS: i64 = 86_400_000;

/// Полезная нагрузка deep-link из `/start <payload>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPayload {
    Coupon(String),
    Gift(String),
    Referral(i64),
    Malformed,
}

impl StartPayload {
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let command = parts.next()?;
        if !command.starts_with("/start") {
            return None;
        }
        let raw = parts.next()?;
        let decoded = urlencoding::decode(raw)
            .map(|value| value.into_owned())
            .unwrap_or_else(|_| raw.to_string());

        if let Some(code) = decoded.strip_prefix("coupons_") {
            let code = code.trim();
            return Some(if code.is_empty() {
                StartPayload::Malformed
            } else {
                StartPayload::Coupon(code.to_string())
            });
        }
        if let Some(rest) = decoded.strip_prefix("gift_") {
            let mut gift = rest.split('_');
            return Some(match (gift.next(), gift.next()) {
                (Some(id), Some(_)) if !id.is_empty() => StartPayload::Gift(id.to_string()),
                _ => StartPayload::Malformed,
            });
        }
        if let Some(referrer) = decoded.strip_prefix("referral_") {
            return Some(
                referrer
                    .parse::<i64>()
                    .map(StartPayload::Referral)
                    .unwrap_or(StartPayload::Malformed),
            );
        }
        None
    }
}

/// `Ok(true)`, если подписка не требуется или пользователь состоит в канале.
async fn is_channel_member(bot: &Bot, state: &BotState, tg_id: i64) -> Result<bool, teloxide::RequestError> {
    let Some(channel_id) = state.config.channel.required_channel() else {
        return Ok(true);
    };
    let member = bot.get_chat_member(ChatId(channel_id), UserId(tg_id as u64)).await?;
    Ok(member.kind.is_present())
}

pub async fn handle_start(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let Some(user) = msg.from.as_ref() else {
        tracing::warn!("Получен /start без отправителя");
        return Ok(());
    };
    let tg_id = user.id.0 as i64;
    let text = msg.text().unwrap_or("/start").to_string();
    tracing::info!(tg_id = tg_id, "Получена команда /start");

    match is_channel_member(&bot, &state, tg_id).await {
        Ok(true) => {}
        Ok(false) => {
            state.pending_starts.lock().await.insert(tg_id, text);
            bot.send_message(msg.chat.id, SUBSCRIPTION_REQUIRED_TEXT)
                .reply_markup(crate::bot::keyboards::subscription_check())
                .await?;
            return Ok(());
        }
        Err(error) => {
            tracing::error!(tg_id = tg_id, error = %error, "Ошибка проверки подписки на канал");
            state.pending_starts.lock().await.insert(tg_id, text);
            bot.send_message(msg.chat.id, SUBSCRIPTION_REQUIRED_TEXT)
                .reply_markup(crate::bot::keyboards::subscription_check())
                .await?;
            return Ok(());
        }
    }

    process_start(&bot, msg.chat.id, &state, profile_from_user(user), &text).await
}

pub async fn handle_check_subscription(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let tg_id = q.from.id.0 as i64;
    match is_channel_member(&bot, &state, tg_id).await {
        Ok(true) => {
            bot.answer_callback_query(q.id.clone())
                .text(SUBSCRIPTION_CONFIRMED_TEXT)
                .await?;
            let text = state
                .pending_starts
                .lock()
                .await
                .remove(&tg_id)
                .unwrap_or_else(|| "/start".to_string());
            let chat_id = callback_message_target(&q)
                .map(|(chat_id, _)| chat_id)
                .unwrap_or(ChatId(tg_id));
            process_start(&bot, chat_id, &state, profile_from_user(&q.from), &text).await
        }
        Ok(false) => {
            bot.answer_callback_query(q.id.clone())
                .text(NOT_SUBSCRIBED_YET_TEXT)
                .show_alert(true)
                .await?;
            Ok(())
        }
        Err(error) => {
            tracing::error!(tg_id = tg_id, error = %error, "Ошибка проверки подписки на канал");
            bot.answer_callback_query(q.id.clone())
                .text(SUBSCRIPTION_CHECK_ERROR_TEXT)
                .show_alert(true)
                .await?;
            Ok(())
        }
    }
}

async fn process_start(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    profile: TelegramProfile,
    text: &str,
) -> HandlerResult {
    let tg_id = profile.tg_id;
    let is_new = state.db.ensure_user(&profile).await?;
    if is_new {
        tracing::info!(tg_id = tg_id, "Новый пользователь добавлен в базу");
    }

    match StartPayload::parse(text) {
        Some(StartPayload::Coupon(code)) => apply_coupon(bot, chat_id, state, tg_id, &code).await?,
        Some(StartPayload::Gift(gift_id)) => {
            if claim_gift(bot, chat_id, state, tg_id, is_new, &gift_id).await? {
                return Ok(());
            }
        }
        Some(StartPayload::Referral(referrer)) => {
            register_referral(bot, chat_id, state, tg_id, is_new, referrer).await?
        }
        Some(StartPayload::Malformed) => {
            tracing::warn!(tg_id = tg_id, payload = %text, "Некорректная ссылка /start");
            bot.send_message(chat_id, "❌ Неверный формат ссылки.").await?;
        }
        None => {}
    }

    show_start_menu(bot, chat_id, None, state, tg_id).await
}

async fn apply_coupon(bot: &Bot, chat_id: ChatId, state: &BotState, tg_id: i64, code: &str) -> HandlerResult {
    let reply = match state.db.apply_coupon(code, tg_id).await? {
        CouponOutcome::Applied { amount } => {
            tracing::info!(tg_id = tg_id, code = %code, amount = amount, "Купон применён");
            format!("✅ Купон активирован, на баланс начислено {} ₽.", amount)
        }
        CouponOutcome::NotFound => "❌ Купон не найден!".to_string(),
        CouponOutcome::AlreadyUsedByUser => "❌ Вы уже использовали этот купон!".to_string(),
        CouponOutcome::Exhausted => "❌ Этот купон уже использован!".to_string(),
    };
    bot.send_message(chat_id, reply).await?;
    Ok(())
}

/// `true`, если подарок активирован и ключ отправлен.
async fn claim_gift(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    tg_id: i64,
    is_new: bool,
    gift_id: &str,
) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
    let gift = match state.db.check_gift(gift_id, tg_id).await? {
        GiftCheck::Claimable(gift) => gift,
        GiftCheck::NotFound => {
            bot.send_message(chat_id, "❌ Подарок не найден или уже был использован.")
                .await?;
            return Ok(false);
        }
        GiftCheck::AlreadyUsed => {
            bot.send_message(chat_id, "Этот подарок уже был использован.").await?;
            return Ok(false);
        }
        GiftCheck::OwnGift => {
            bot.send_message(chat_id, "❌ Вы не можете получить подарок от самого себя.")
                .await?;
            return Ok(false);
        }
        GiftCheck::ClaimedByOther(other) => {
            tracing::warn!(gift_id = %gift_id, recipient = other, "Подарок уже привязан к другому пользователю");
            bot.send_message(chat_id, "❌ Этот подарок уже был активирован другим пользователем.")
                .await?;
            return Ok(false);
        }
    };

    if is_new && state.db.add_referral(tg_id, gift.sender_tg_id).await? {
        tracing::info!(tg_id = tg_id, referrer = gift.sender_tg_id, "Получатель подарка стал рефералом отправителя");
    }

    let issued = match state.issuer.redeem_gift(&gift, tg_id).await {
        Ok(Some(issued)) => issued,
        Ok(None) => {
            tracing::warn!(gift_id = %gift_id, tg_id = tg_id, "Подарок успели активировать раньше");
            bot.send_message(chat_id, "Этот подарок уже был использован.").await?;
            return Ok(false);
        }
        Err(error) => {
            tracing::error!(tg_id = tg_id, gift_id = %gift_id, error = %error, "Не удалось выдать ключ по подарку");
            bot.send_message(chat_id, "❌ Не удалось активировать подарок, попробуйте позже.")
                .await?;
            return Ok(false);
        }
    };

    send_issued_key(bot, chat_id, &issued).await?;
    bot.send_message(
        chat_id,
        format!(
            "🎉 Ваш подарок на {} {} активирован!",
            gift.selected_months,
            months_word(gift.selected_months)
        ),
    )
    .await?;
    Ok(true)
}

async fn register_referral(
    bot: &Bot,
    chat_id: ChatId,
    state: &BotState,
    tg_id: i64,
    is_new: bool,
    referrer: i64,
) -> HandlerResult {
    if !is_new {
        bot.send_message(
            chat_id,
            "❌ Вы уже зарегистрированы и не можете использовать реферальную ссылку.",
        )
        .await?;
        return Ok(());
    }
    if referrer == tg_id {
        bot.send_message(chat_id, "❌ Вы не можете быть рефералом самого себя.")
            .await?;
        return Ok(());
    }
    if let Some(existing) = state.db.get_referrer(tg_id).await? {
        tracing::info!(tg_id = tg_id, referrer = existing, "Реферал уже зарегистрирован");
        return Ok(());
    }
    if !state.db.add_referral(tg_id, referrer).await? {
        return Ok(());
    }

    tracing::info!(tg_id = tg_id, referrer = referrer, "Новый реферал");
    bot.send_message(
        chat_id,
        format!("👋 Вы пришли по приглашению пользователя {}.", referrer),
    )
    .await?;
    send_notification(
        bot,
        referrer,
        &format!("🎉 По вашей ссылке зарегистрировался новый пользователь {}!", tg_id),
        None,
    )
    .await;
    Ok(())
}

pub async fn handle_trial(bot: Bot, q: CallbackQuery, state: BotState) -> HandlerResult {
    let tg_id = q.from.id.0 as i64;
    let chat_id = callback_message_target(&q)
        .map(|(chat_id, _)| chat_id)
        .unwrap_or(ChatId(tg_id));

    let trial_used = state.db.get_user(tg_id).await?.is_none_or(|user| user.trial != 0);
    if trial_used {
        bot.answer_callback_query(q.id.clone())
            .text("Пробный период уже использован")
            .show_alert(true)
            .await?;
        return Ok(());
    }
    bot.answer_callback_query(q.id.clone()).text("Создаю ключ…").await?;

    let expiry = now_millis()? + state.config.trial_days * DAY_MS;
    match state.issuer.issue_trial(tg_id, expiry).await {
        Ok(Some(issued)) => {
            send_issued_key(&bot, chat_id, &issued).await?;
        }
        Ok(None) => {
            bot.send_message(chat_id, "Пробный период уже использован.").await?;
        }
        Err(error) => {
            tracing::error!(tg_id = tg_id, error = %error, "Не удалось выдать пробный ключ");
            bot.send_message(chat_id, "❌ Не удалось создать ключ, попробуйте позже.")
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_payloads_are_recognised() {
        assert_eq!(StartPayload::parse("/start"), None);
        assert_eq!(StartPayload::parse("/start hello"), None);
        assert_eq!(
            StartPayload::parse("/start coupons_SPRING25"),
            Some(StartPayload::Coupon("SPRING25".to_string()))
        );
        assert_eq!(
            StartPayload::parse("/start gift_0f1e2d_3"),
            Some(StartPayload::Gift("0f1e2d".to_string()))
        );
        assert_eq!(
            StartPayload::parse("/start referral_12345"),
            Some(StartPayload::Referral(12345))
        );
    }

    #[test]
    fn malformed_payloads_are_flagged() {
        assert_eq!(StartPayload::parse("/start gift_abc"), Some(StartPayload::Malformed));
        assert_eq!(StartPayload::parse("/start referral_x"), Some(StartPayload::Malformed));
        assert_eq!(StartPayload::parse("/start coupons_"), Some(StartPayload::Malformed));
    }

    #[test]
    fn url_encoded_payloads_are_decoded() {
        assert_eq!(
            StartPayload::parse("/start coupons_NEW%2DYEAR"),
            Some(StartPayload::Coupon("NEW-YEAR".to_string()))
        );
    }
}
