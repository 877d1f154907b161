use super::format::{WELCOME_TEXT, render_issued_key};
use super::state::BotState;
use crate::db::current_unix_timestamp;
use crate::export::CsvFile;
use crate::keys::IssuedKey;
use anyhow::anyhow;
use image::{DynamicImage, ImageFormat, Luma};
use qrcode::QrCode;
use std::io::Cursor;
use teloxide::prelude::*;
use teloxide::types::{InlineKeyboardMarkup, InputFile, MessageId};
use teloxide::{ApiError, RequestError};

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

pub fn callback_message_target(q: &CallbackQuery) -> Option<(ChatId, MessageId)> {
    q.message.as_ref().map(|msg| (msg.chat().id, msg.id()))
}

pub fn callback_prefix_filter(prefix: &'static str) -> impl Fn(CallbackQuery) -> Option<CallbackQuery> {
    move |q: CallbackQuery| {
        if q.data.as_deref().is_some_and(|payload| payload.starts_with(prefix)) {
            Some(q)
        } else {
            None
        }
    }
}

pub fn callback_exact_filter(expected: &'static str) -> impl Fn(CallbackQuery) -> Option<CallbackQuery> {
    move |q: CallbackQuery| {
        if q.data.as_deref() == Some(expected) {
            Some(q)
        } else {
            None
        }
    }
}

pub fn build_bot_start_link(bot_username: &str, payload: &str) -> String {
    let normalized = bot_username.trim_start_matches('@');
    format!("https://t.me/{}?start={}", normalized, payload)
}

pub fn referral_link(state: &BotState, tg_id: i64) -> Option<String> {
    state
        .bot_username
        .as_deref()
        .map(|username| build_bot_start_link(username, &format!("referral_{}", tg_id)))
}

pub fn now_millis() -> Result<i64, anyhow::Error> {
    Ok(current_unix_timestamp()? * 1000)
}

pub async fn require_admin_callback(
    bot: &Bot,
    q: &CallbackQuery,
    state: &BotState,
) -> Result<Option<i64>, anyhow::Error> {
    let admin_id = q.from.id.0 as i64;
    if !state.config.is_admin(admin_id) {
        bot.answer_callback_query(q.id.clone())
            .text("Недостаточно прав")
            .show_alert(true)
            .await?;
        return Ok(None);
    }
    Ok(Some(admin_id))
}

/// Редактирует сообщение с кнопкой; если редактировать нечего, отправляет новое.
pub async fn edit_or_send(
    bot: &Bot,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    text: impl Into<String>,
    keyboard: InlineKeyboardMarkup,
) -> HandlerResult {
    let text = text.into();
    if let Some(message_id) = message_id {
        match bot
            .edit_message_text(chat_id, message_id, text.clone())
            .reply_markup(keyboard.clone())
            .await
        {
            Ok(_) => return Ok(()),
            Err(RequestError::Api(ApiError::MessageNotModified)) => return Ok(()),
            Err(error) => {
                tracing::debug!(error = %error, "Не удалось отредактировать сообщение, отправляю новое");
            }
        }
    }
    bot.send_message(chat_id, text).reply_markup(keyboard).await?;
    Ok(())
}

pub fn build_qr_png_bytes(payload: &str) -> Result<Vec<u8>, anyhow::Error> {
    let qr = QrCode::new(payload.as_bytes())?;
    let image = qr
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(512, 512)
        .build();
    let mut bytes = Vec::new();
    {
        let mut cursor = Cursor::new(&mut bytes);
        DynamicImage::ImageLuma8(image).write_to(&mut cursor, ImageFormat::Png)?;
    }
    Ok(bytes)
}

/// Отправляет ссылку на подписку и QR-код к ней.
pub async fn send_issued_key(bot: &Bot, chat_id: ChatId, issued: &IssuedKey) -> HandlerResult {
    let now = current_unix_timestamp()?;
    bot.send_message(chat_id, render_issued_key(issued, now))
        .reply_markup(crate::bot::keyboards::profile_menu())
        .await?;

    match build_qr_png_bytes(&issued.subscription_link) {
        Ok(png) => {
            bot.send_photo(
                chat_id,
                InputFile::memory(png).file_name(format!("vpn-{}.png", issued.email)),
            )
            .caption("QR-код для импорта подписки в приложение.")
            .await?;
        }
        Err(error) => {
            tracing::warn!(email = %issued.email, error = %error, "Не удалось построить QR-код");
        }
    }
    Ok(())
}

pub async fn send_csv(bot: &Bot, chat_id: ChatId, file: CsvFile) -> HandlerResult {
    bot.send_document(chat_id, InputFile::memory(file.bytes).file_name(file.file_name))
        .await?;
    Ok(())
}

/// Уведомление пользователю. `false`, если доставить не удалось, в том числе
/// когда пользователь заблокировал бота.
pub async fn send_notification(
    bot: &Bot,
    tg_id: i64,
    text: &str,
    keyboard: Option<InlineKeyboardMarkup>,
) -> bool {
    let mut request = bot.send_message(ChatId(tg_id), text);
    if let Some(keyboard) = keyboard {
        request = request.reply_markup(keyboard);
    }
    match request.await {
        Ok(_) => true,
        Err(RequestError::Api(ApiError::BotBlocked | ApiError::UserDeactivated)) => {
            tracing::warn!(tg_id = tg_id, "Пользователь заблокировал бота");
            false
        }
        Err(error) => {
            tracing::error!(tg_id = tg_id, error = %error, "Не удалось отправить уведомление");
            false
        }
    }
}

pub async fn show_start_menu(
    bot: &Bot,
    chat_id: ChatId,
    message_id: Option<MessageId>,
    state: &BotState,
    tg_id: i64,
) -> HandlerResult {
    let trial_available = state
        .db
        .get_user(tg_id)
        .await?
        .is_some_and(|user| user.trial == 0);
    let keyboard = crate::bot::keyboards::start_menu(
        &state.config,
        trial_available,
        state.config.is_admin(tg_id),
    );
    edit_or_send(bot, chat_id, message_id, WELCOME_TEXT, keyboard).await
}

pub fn parse_command_args(text: &str) -> Vec<&str> {
    text.split_whitespace().skip(1).collect()
}

pub fn parse_tg_id(raw: Option<&&str>) -> Result<i64, anyhow::Error> {
    raw.ok_or_else(|| anyhow!("Не указан tg_id"))?
        .parse::<i64>()
        .map_err(|_| anyhow!("Некорректный tg_id"))
}
