//! CSV-выгрузки для администраторов и рефералов.

use crate::db::{PaymentExportRow, ReferralExportRow, UserRecord};

const UTF8_BOM: &[u8] = "\u{feff}".as_bytes();

/// Готовый к отправке файл.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

fn bom_writer() -> csv::Writer<Vec<u8>> {
    csv::Writer::from_writer(UTF8_BOM.to_vec())
}

fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, anyhow::Error> {
    writer
        .into_inner()
        .map_err(|error| anyhow::Error::new(error.into_error()))
}

fn opt(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

pub fn users_csv(users: &[UserRecord]) -> Result<CsvFile, anyhow::Error> {
    let mut wtr = bom_writer();
    wtr.write_record([
        "tg_id",
        "username",
        "first_name",
        "last_name",
        "language_code",
        "is_bot",
        "balance",
        "trial",
        "created_at",
    ])?;
    for user in users {
        wtr.write_record([
            user.tg_id.to_string(),
            opt(&user.username),
            opt(&user.first_name),
            opt(&user.last_name),
            opt(&user.language_code),
            user.is_bot.to_string(),
            user.balance.to_string(),
            user.trial.to_string(),
            user.created_at.to_string(),
        ])?;
    }
    Ok(CsvFile {
        file_name: "users_export.csv".to_string(),
        bytes: finish(wtr)?,
    })
}

/// Платежи всех пользователей или одного (`tg_id`), имя файла зависит от этого.
pub fn payments_csv(payments: &[PaymentExportRow], tg_id: Option<i64>) -> Result<CsvFile, anyhow::Error> {
    let mut wtr = bom_writer();
    wtr.write_record([
        "tg_id",
        "username",
        "first_name",
        "last_name",
        "amount",
        "payment_system",
        "status",
        "created_at",
    ])?;
    for payment in payments {
        wtr.write_record([
            payment.tg_id.to_string(),
            opt(&payment.username),
            opt(&payment.first_name),
            opt(&payment.last_name),
            payment.amount.to_string(),
            payment.payment_system.clone(),
            payment.status.clone(),
            payment.created_at.to_string(),
        ])?;
    }
    let file_name = match tg_id {
        Some(tg_id) => format!("payments_export_{}.csv", tg_id),
        None => "payments_export.csv".to_string(),
    };
    Ok(CsvFile {
        file_name,
        bytes: finish(wtr)?,
    })
}

fn referral_name(row: &ReferralExportRow) -> String {
    let first = row.first_name.trim();
    let mut name = if !first.is_empty() {
        first.to_string()
    } else if !row.username.is_empty() {
        row.username.clone()
    } else {
        row.referred_tg_id.to_string()
    };
    if !row.last_name.is_empty() {
        name = format!("{} {}", name, row.last_name);
    }
    name.trim().to_string()
}

/// `Ok(None)`, если приглашённых нет.
pub fn referrals_csv(referrer_tg_id: i64, rows: &[ReferralExportRow]) -> Result<Option<CsvFile>, anyhow::Error> {
    if rows.is_empty() {
        return Ok(None);
    }
    let mut wtr = csv::WriterBuilder::new().delimiter(b';').from_writer(Vec::new());
    wtr.write_record(["Приглашённый (tg_id)", "Имя"])?;
    for row in rows {
        wtr.write_record([row.referred_tg_id.to_string(), referral_name(row)])?;
    }
    Ok(Some(CsvFile {
        file_name: format!("referrals_{}.csv", referrer_tg_id),
        bytes: finish(wtr)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(file: &CsvFile) -> String {
        String::from_utf8(file.bytes.clone()).unwrap()
    }

    #[test]
    fn users_export_has_bom_and_quotes_commas() {
        let users = vec![UserRecord {
            tg_id: 5,
            username: Some("bob".to_string()),
            first_name: Some("Bob, Jr".to_string()),
            last_name: None,
            language_code: Some("ru".to_string()),
            is_bot: false,
            balance: 150.5,
            trial: 1,
            created_at: 1_700_000_000,
        }];

        let file = users_csv(&users).unwrap();
        let body = text(&file);

        assert_eq!(file.file_name, "users_export.csv");
        assert!(body.starts_with('\u{feff}'));
        let lines: Vec<&str> = body.trim_start_matches('\u{feff}').lines().collect();
        assert_eq!(lines[0], "tg_id,username,first_name,last_name,language_code,is_bot,balance,trial,created_at");
        assert_eq!(lines[1], "5,bob,\"Bob, Jr\",,ru,false,150.5,1,1700000000");
    }

    #[test]
    fn per_user_payments_file_name() {
        let rows = vec![PaymentExportRow {
            tg_id: 9,
            username: None,
            first_name: None,
            last_name: None,
            amount: 100.0,
            payment_system: "admin".to_string(),
            status: "success".to_string(),
            created_at: 10,
        }];
        let file = payments_csv(&rows, Some(9)).unwrap();
        assert_eq!(file.file_name, "payments_export_9.csv");
        assert!(text(&file).ends_with("9,,,,100,admin,success,10\n"));
        assert_eq!(payments_csv(&[], None).unwrap().file_name, "payments_export.csv");
    }

    #[test]
    fn referrals_use_semicolons_and_name_fallbacks() {
        let rows = vec![
            ReferralExportRow {
                referred_tg_id: 11,
                first_name: "Анна".to_string(),
                last_name: "Петрова".to_string(),
                username: "anna".to_string(),
            },
            ReferralExportRow {
                referred_tg_id: 12,
                first_name: " ".to_string(),
                last_name: String::new(),
                username: "nick".to_string(),
            },
            ReferralExportRow {
                referred_tg_id: 13,
                first_name: String::new(),
                last_name: String::new(),
                username: String::new(),
            },
        ];

        let file = referrals_csv(1, &rows).unwrap().unwrap();
        assert_eq!(file.file_name, "referrals_1.csv");
        assert_eq!(
            text(&file),
            "Приглашённый (tg_id);Имя\n11;Анна Петрова\n12;nick\n13;13\n"
        );
        assert!(referrals_csv(1, &[]).unwrap().is_none());
    }

    #[test]
    fn quotes_inside_fields_are_doubled() {
        let rows = vec![ReferralExportRow {
            referred_tg_id: 21,
            first_name: "Иван \"Ваня\"; мл.".to_string(),
            last_name: String::new(),
            username: String::new(),
        }];
        let file = referrals_csv(2, &rows).unwrap().unwrap();
        assert_eq!(
            text(&file),
            "Приглашённый (tg_id);Имя\n21;\"Иван \"\"Ваня\"\"; мл.\"\n"
        );
    }
}
