use crate::balancer::ClusterLoads;
use crate::db::{ClientKey, UserRecord};
use crate::keys::IssuedKey;
use crate::probe::AvailabilityReport;
use crate::sync::{SyncReport, SyncTarget};
use chrono::{DateTime, Local, Utc};

pub const WELCOME_TEXT: &str = "🎉 Добро пожаловать!\n\n\
    Здесь можно подключить быстрый и стабильный VPN, управлять ключами и балансом.\n\
    Выберите действие в меню ниже.";

pub const SUBSCRIPTION_REQUIRED_TEXT: &str =
    "📢 Чтобы пользоваться ботом, подпишитесь на наш канал и нажмите «✅ Я подписался».";
pub const NOT_SUBSCRIBED_YET_TEXT: &str = "❌ Подписка на канал пока не найдена.";
pub const SUBSCRIPTION_CONFIRMED_TEXT: &str = "✅ Подписка подтверждена!";
pub const SUBSCRIPTION_CHECK_ERROR_TEXT: &str = "Не удалось проверить подписку, попробуйте позже.";

pub const CLUSTERS_EDITOR_TEXT: &str = "🔧 Управление кластерами\n\n\
    Кластер — это группа серверов, на которых создаётся подписка. \
    Если нужно выдавать по одному серверу, добавьте в кластер один сервер.\n\n\
    ⚠️ Кластер удаляется автоматически вместе с последним сервером.";

pub fn about_text() -> String {
    format!(
        "🌐 О VPN\n\n\
         Подписка работает на всех серверах кластера: если один сервер недоступен, \
         клиент переключится на другой.\n\n\
         Версия бота: {}",
        env!("CARGO_PKG_VERSION")
    )
}

pub fn format_date(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.with_timezone(&Local).format("%d.%m.%Y %H:%M").to_string())
        .unwrap_or_else(|| "—".to_string())
}

/// Индекс формы по правилу русского языка: 0 для 1, 21, 101; 1 для 2-4, 22-24; иначе 2.
fn plural_form(value: i64) -> usize {
    let value = value.abs();
    match (value % 10, value % 100) {
        (1, rem) if rem != 11 => 0,
        (2..=4, rem) if !(12..=14).contains(&rem) => 1,
        _ => 2,
    }
}

fn plural(value: i64, one: &str, few: &str, many: &str) -> String {
    let word = [one, few, many][plural_form(value)];
    format!("{} {}", value, word)
}

pub fn months_word(months: i64) -> &'static str {
    ["месяц", "месяца", "месяцев"][plural_form(months)]
}

/// Оставшееся время до удаления ключа: дни и часы, минуты только в последние сутки.
pub fn format_time_until_deletion(seconds: i64) -> String {
    if seconds <= 0 {
        return "0 минут".to_string();
    }

    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    let minutes = (seconds % 3_600 + 59) / 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(plural(days, "день", "дня", "дней"));
    }
    if hours > 0 {
        parts.push(plural(hours, "час", "часа", "часов"));
    }
    if minutes > 0 && days == 0 {
        parts.push(plural(minutes, "минута", "минуты", "минут"));
    }

    if parts.is_empty() {
        "менее минуты".to_string()
    } else {
        parts.join(" и ")
    }
}

pub fn render_profile(
    user: &UserRecord,
    keys: &[ClientKey],
    now: i64,
    referrals: i64,
    referral_link: Option<&str>,
) -> String {
    let mut text = format!(
        "👤 Личный кабинет\n\n\
         ID: {}\n\
         Баланс: {:.2} ₽\n\
         Приглашено друзей: {}\n",
        user.tg_id, user.balance, referrals
    );

    if keys.is_empty() {
        text.push_str("\n🔑 Ключей пока нет.\n");
    } else {
        text.push_str("\n🔑 Ключи:\n");
        for key in keys {
            let left = key.expiry_time / 1000 - now;
            if left > 0 {
                text.push_str(&format!(
                    "• {} — осталось {} (до {})\n",
                    key.email,
                    format_time_until_deletion(left),
                    format_date(key.expiry_time / 1000)
                ));
            } else {
                text.push_str(&format!("• {} — истёк\n", key.email));
            }
        }
    }

    if let Some(link) = referral_link {
        text.push_str(&format!("\n🤝 Реферальная ссылка:\n{}", link));
    }
    text
}

pub fn render_issued_key(issued: &IssuedKey, now: i64) -> String {
    format!(
        "✅ Ключ создан!\n\n\
         📋 Ссылка на подписку:\n{}\n\n\
         ⏳ Действует: {}\n\
         🌐 Кластер: {}",
        issued.subscription_link,
        format_time_until_deletion(issued.expiry_time / 1000 - now),
        issued.cluster
    )
}

pub fn render_availability(report: &AvailabilityReport) -> String {
    let mut text = format!(
        "🖥️ Проверка доступности серверов\n\n⚙️ Кластер: {}\n\n",
        report.cluster
    );
    for probe in &report.servers {
        match &probe.outcome {
            Ok(online) => text.push_str(&format!("🌍 {} - онлайн: {}\n", probe.server_name, online)),
            Err(error) => text.push_str(&format!("❌ {} - ошибка: {}\n", probe.server_name, error)),
        }
    }
    text.push_str(&format!("\n👥 Всего пользователей онлайн: {}", report.total_online()));
    text
}

fn target_label(target: &SyncTarget) -> String {
    match target {
        SyncTarget::Cluster(cluster) => format!("кластера {}", cluster),
        SyncTarget::Server { server, .. } => format!("сервера {}", server),
    }
}

pub fn render_sync_report(report: &SyncReport) -> String {
    let label = target_label(&report.target);
    if report.total_keys == 0 {
        return format!("❌ Нет ключей для синхронизации {}.", label);
    }

    let mut text = format!(
        "✅ Синхронизация {} завершена\n\n\
         🔑 Количество ключей: {}\n\
         📡 Запросов к панелям: {}",
        label, report.total_keys, report.attempted
    );
    text.push_str(&format!("\n👍 Без ошибок: {}", report.succeeded_keys()));
    if !report.failed.is_empty() {
        text.push_str(&format!("\n⚠️ С ошибками: {}", report.failed.len()));
        for client_id in report.failed.iter().take(10) {
            text.push_str(&format!("\n• {}", client_id));
        }
        if report.failed.len() > 10 {
            text.push_str("\n…");
        }
    }
    text
}

pub fn render_loads(loads: &ClusterLoads) -> String {
    let mut text = "📊 Загрузка кластеров (ключей):\n\n".to_string();
    let mut any = false;
    for (cluster, count) in loads.known() {
        any = true;
        text.push_str(&format!("• {}: {}\n", cluster, count));
    }
    if !any {
        text.push_str("Кластеров пока нет.\n");
    }

    let unresolved: Vec<(&str, u64)> = loads.unresolved().collect();
    if !unresolved.is_empty() {
        text.push_str("\n⚠️ Ключи с неизвестным сервером:\n");
        for (server_id, count) in unresolved {
            text.push_str(&format!("• {}: {}\n", server_id, count));
        }
    }
    if let Some(cluster) = loads.least_loaded() {
        text.push_str(&format!(
            "\nСледующий ключ уйдёт в: {} (сейчас ключей: {})",
            cluster,
            loads.get(cluster).unwrap_or(0)
        ));
    }
    text
}

pub fn render_backup(cluster: &str, failed: &[String]) -> String {
    if failed.is_empty() {
        format!(
            "✅ Бэкап для кластера {} создан.\n\n🔔 Бэкапы отправлены в боты панелей.",
            cluster
        )
    } else {
        format!(
            "⚠️ Бэкап для кластера {} создан не полностью.\nОшибки на серверах: {}",
            cluster,
            failed.join(", ")
        )
    }
}
