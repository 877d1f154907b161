use super::format::months_word;
use super::onboarding::handle_start;
use super::shared::{
    HandlerResult, build_bot_start_link, now_millis, parse_command_args, parse_tg_id, send_csv,
    send_notification,
};
use super::state::{BotState, is_admin_message, sender_user_id};
use crate::db::PAYMENT_SYSTEM_ADMIN;
use crate::export::payments_csv;
use teloxide::dptree;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

const DAY_MS: i64 = 86_400_000;
const MONTH_DAYS: i64 = 30;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
pub enum BotCommand {
    #[command(description = "Главное меню")]
    Start,
    #[command(description = "Справка")]
    Help,
    #[command(description = "Панель администратора (админ)")]
    Admin,
    #[command(description = "Платежи пользователя в CSV (админ)")]
    Payments,
    #[command(description = "Пополнить баланс пользователя (админ)")]
    Topup,
    #[command(description = "Создать купон (админ)")]
    Coupon,
    #[command(description = "Создать подарочную ссылку (админ)")]
    Gift,
}

pub fn handler() -> teloxide::dispatching::UpdateHandler<Box<dyn std::error::Error + Send + Sync + 'static>> {
    teloxide::filter_command::<BotCommand, _>()
        .branch(dptree::case![BotCommand::Start].endpoint(handle_start))
        .branch(dptree::case![BotCommand::Help].endpoint(cmd_help))
        .branch(dptree::case![BotCommand::Admin].endpoint(cmd_admin))
        .branch(dptree::case![BotCommand::Payments].endpoint(cmd_payments))
        .branch(dptree::case![BotCommand::Topup].endpoint(cmd_topup))
        .branch(dptree::case![BotCommand::Coupon].endpoint(cmd_coupon))
        .branch(dptree::case![BotCommand::Gift].endpoint(cmd_gift))
}

pub async fn cmd_help(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    let mut text = "Команды:\n/start — главное меню".to_string();
    if is_admin_message(&msg, &state) {
        text.push_str(
            "\n\nДля администраторов:\n\
             /admin — панель администратора\n\
             /payments <tg_id> — платежи пользователя в CSV\n\
             /topup <tg_id> <сумма> — пополнить баланс\n\
             /coupon <код> <сумма> <лимит> — создать купон\n\
             /gift <месяцы> — создать подарочную ссылку",
        );
    }
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn cmd_admin(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    if let Some(admin_id) = sender_user_id(&msg) {
        state.cluster_wizards.lock().await.remove(&admin_id);
        tracing::info!(admin_id = admin_id, "Admin command /admin");
    }
    bot.send_message(msg.chat.id, "🔧 Панель администратора")
        .reply_markup(crate::bot::keyboards::admin_panel())
        .await?;
    Ok(())
}

async fn cmd_payments(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let args = parse_command_args(msg.text().unwrap_or(""));
    let tg_id = match parse_tg_id(args.first()) {
        Ok(value) => value,
        Err(_) => {
            bot.send_message(msg.chat.id, "Использование: /payments <tg_id>")
                .await?;
            return Ok(());
        }
    };
    tracing::info!(tg_id = tg_id, "Admin command /payments");

    let rows = state.db.list_payments_for_export(Some(tg_id)).await?;
    if rows.is_empty() {
        bot.send_message(msg.chat.id, format!("У пользователя {} нет платежей.", tg_id))
            .await?;
        return Ok(());
    }
    send_csv(&bot, msg.chat.id, payments_csv(&rows, Some(tg_id))?).await
}

/// `/topup <tg_id> <amount>`: сумма положительная, допускается запятая.
fn parse_topup_args(args: &[&str]) -> Option<(i64, f64)> {
    let [tg_id, amount] = args else {
        return None;
    };
    let tg_id = tg_id.parse::<i64>().ok()?;
    let amount = amount.replace(',', ".").parse::<f64>().ok()?;
    (amount.is_finite() && amount > 0.0).then_some((tg_id, amount))
}

async fn cmd_topup(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let args = parse_command_args(msg.text().unwrap_or(""));
    let Some((tg_id, amount)) = parse_topup_args(&args) else {
        bot.send_message(msg.chat.id, "Использование: /topup <tg_id> <сумма>")
            .await?;
        return Ok(());
    };
    tracing::info!(tg_id = tg_id, amount = amount, "Admin command /topup");

    if !state.db.credit_balance(tg_id, amount, PAYMENT_SYSTEM_ADMIN).await? {
        bot.send_message(msg.chat.id, format!("Пользователь {} не найден.", tg_id))
            .await?;
        return Ok(());
    }

    let delivered = send_notification(
        &bot,
        tg_id,
        &format!("💰 Ваш баланс пополнен на {:.2} ₽.", amount),
        Some(crate::bot::keyboards::profile_menu()),
    )
    .await;
    let mut reply = format!("✅ Баланс пользователя {} пополнен на {:.2} ₽.", tg_id, amount);
    if !delivered {
        reply.push_str("\n⚠️ Уведомление пользователю не доставлено.");
    }
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

/// `/coupon <code> <amount> <limit>`.
fn parse_coupon_args(args: &[&str]) -> Option<(String, f64, i64)> {
    let [code, amount, limit] = args else {
        return None;
    };
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return None;
    }
    let amount = amount.replace(',', ".").parse::<f64>().ok()?;
    let limit = limit.parse::<i64>().ok()?;
    (amount.is_finite() && amount > 0.0 && limit > 0).then(|| (code.to_string(), amount, limit))
}

async fn cmd_coupon(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let args = parse_command_args(msg.text().unwrap_or(""));
    let Some((code, amount, limit)) = parse_coupon_args(&args) else {
        bot.send_message(msg.chat.id, "Использование: /coupon <код> <сумма> <лимит>")
            .await?;
        return Ok(());
    };
    tracing::info!(code = %code, amount = amount, usage_limit = limit, "Admin command /coupon");

    if !state.db.create_coupon(&code, amount, limit).await? {
        bot.send_message(msg.chat.id, format!("Купон {} уже существует.", code))
            .await?;
        return Ok(());
    }

    let mut reply = format!(
        "✅ Купон {} создан: {:.2} ₽, активаций: {}.",
        code, amount, limit
    );
    if let Some(username) = state.bot_username.as_deref() {
        reply.push_str(&format!(
            "\n\nСсылка для активации:\n{}",
            build_bot_start_link(username, &format!("coupons_{}", code))
        ));
    }
    bot.send_message(msg.chat.id, reply).await?;
    Ok(())
}

fn parse_gift_months(args: &[&str]) -> Option<i64> {
    let [months] = args else {
        return None;
    };
    months.parse::<i64>().ok().filter(|value| (1..=12).contains(value))
}

async fn cmd_gift(bot: Bot, msg: Message, state: BotState) -> HandlerResult {
    if !is_admin_message(&msg, &state) {
        return Ok(());
    }
    let Some(admin_id) = sender_user_id(&msg) else {
        return Ok(());
    };
    let args = parse_command_args(msg.text().unwrap_or(""));
    let Some(months) = parse_gift_months(&args) else {
        bot.send_message(msg.chat.id, "Использование: /gift <месяцы от 1 до 12>")
            .await?;
        return Ok(());
    };
    let Some(username) = state.bot_username.as_deref() else {
        bot.send_message(msg.chat.id, "Не удалось построить ссылку: username бота неизвестен.")
            .await?;
        return Ok(());
    };

    let expiry_time = now_millis()? + months * MONTH_DAYS * DAY_MS;
    let gift_id = state.db.create_gift(admin_id, months, expiry_time).await?;
    tracing::info!(admin_id = admin_id, gift_id = %gift_id, months = months, "Admin command /gift");

    let link = build_bot_start_link(username, &format!("gift_{}_{}", gift_id, months));
    bot.send_message(
        msg.chat.id,
        format!(
            "🎁 Подарок на {} {} создан.\n\nОтправьте ссылку получателю:\n{}",
            months,
            months_word(months),
            link
        ),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topup_args_accept_comma_and_reject_non_positive() {
        assert_eq!(parse_topup_args(&["42", "150,5"]), Some((42, 150.5)));
        assert_eq!(parse_topup_args(&["42", "0"]), None);
        assert_eq!(parse_topup_args(&["x", "10"]), None);
        assert_eq!(parse_topup_args(&["42"]), None);
    }

    #[test]
    fn coupon_args_require_all_three() {
        assert_eq!(
            parse_coupon_args(&["SPRING", "100", "5"]),
            Some(("SPRING".to_string(), 100.0, 5))
        );
        assert_eq!(parse_coupon_args(&["SPRING", "100"]), None);
        assert_eq!(parse_coupon_args(&["bad code", "100", "5"]), None);
        assert_eq!(parse_coupon_args(&["SPRING", "100", "0"]), None);
    }

    #[test]
    fn gift_months_are_bounded() {
        assert_eq!(parse_gift_months(&["3"]), Some(3));
        assert_eq!(parse_gift_months(&["0"]), None);
        assert_eq!(parse_gift_months(&["13"]), None);
        assert_eq!(parse_gift_months(&[]), None);
    }
}
