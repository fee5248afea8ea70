//! Morning aggregate notifications: tomorrow's tasks and events, today's medications.

use std::collections::HashMap;

use chrono::{Duration, NaiveDate};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use super::{Channel, NotificationCenter, NotificationDraft};
use crate::error::AppResult;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DigestReport {
    pub families: usize,
    pub notifications: usize,
}

#[derive(sqlx::FromRow)]
struct FamilyCount {
    family_id: Uuid,
    count: i64,
}

/// Picks the Russian plural form for `n`: one, few, many.
pub fn plural_ru<'a>(n: i64, one: &'a str, few: &'a str, many: &'a str) -> &'a str {
    let n = n.abs();
    match (n % 10, n % 100) {
        (1, r) if r != 11 => one,
        (2..=4, r) if !(12..=14).contains(&r) => few,
        _ => many,
    }
}

pub fn tasks_draft(count: i64) -> NotificationDraft {
    NotificationDraft::new(
        "tasks_tomorrow",
        "Задачи на завтра",
        format!(
            "Завтра {count} {}",
            plural_ru(count, "задача", "задачи", "задач")
        ),
    )
    .with_url("/tasks")
    .via(&[Channel::Push])
}

pub fn events_draft(count: i64) -> NotificationDraft {
    NotificationDraft::new(
        "events_tomorrow",
        "События на завтра",
        format!(
            "Завтра {count} {}",
            plural_ru(count, "событие", "события", "событий")
        ),
    )
    .with_url("/calendar")
    .via(&[Channel::Push])
}

pub fn medication_draft(count: i64) -> NotificationDraft {
    NotificationDraft::new(
        "medication_reminder",
        "Напоминание о лекарствах",
        format!(
            "Сегодня {count} {} приёма лекарств у детей",
            plural_ru(count, "курс", "курса", "курсов")
        ),
    )
    .with_url("/health")
    .via(&[Channel::Push])
}

async fn counts(pool: &PgPool, sql: &str, day: NaiveDate) -> AppResult<Vec<FamilyCount>> {
    Ok(sqlx::query_as::<_, FamilyCount>(sql)
        .bind(day)
        .fetch_all(pool)
        .await?)
}

async fn active_members(pool: &PgPool, family_id: Uuid) -> AppResult<Vec<Uuid>> {
    Ok(sqlx::query_scalar::<_, Uuid>(
        r#"
        SELECT user_id FROM family_members
        WHERE family_id = $1 AND status = 'active' AND user_id IS NOT NULL
        "#,
    )
    .bind(family_id)
    .fetch_all(pool)
    .await?)
}

/// Sends the digest for `today` (family-local date) to every active member
/// of each family that has something to report.
pub async fn send_daily_digest(
    pool: &PgPool,
    center: &NotificationCenter,
    today: NaiveDate,
) -> AppResult<DigestReport> {
    let tomorrow = today + Duration::days(1);

    let tasks = counts(
        pool,
        r#"
        SELECT family_id, COUNT(*) AS count
        FROM tasks
        WHERE due_date = $1 AND NOT completed
        GROUP BY family_id
        "#,
        tomorrow,
    )
    .await?;
    let events = counts(
        pool,
        r#"
        SELECT family_id, COUNT(*) AS count
        FROM calendar_events
        WHERE date = $1
        GROUP BY family_id
        "#,
        tomorrow,
    )
    .await?;
    let medications = counts(
        pool,
        r#"
        SELECT family_id, COUNT(*) AS count
        FROM child_medications
        WHERE active AND start_date <= $1 AND (end_date IS NULL OR end_date >= $1)
        GROUP BY family_id
        "#,
        today,
    )
    .await?;

    let mut drafts: HashMap<Uuid, Vec<NotificationDraft>> = HashMap::new();
    for (rows, build) in [
        (tasks, tasks_draft as fn(i64) -> NotificationDraft),
        (events, events_draft),
        (medications, medication_draft),
    ] {
        for row in rows.into_iter().filter(|r| r.count > 0) {
            drafts.entry(row.family_id).or_default().push(build(row.count));
        }
    }

    let mut report = DigestReport {
        families: drafts.len(),
        notifications: 0,
    };
    for (family_id, family_drafts) in drafts {
        let members = match active_members(pool, family_id).await {
            Ok(members) => members,
            Err(err) => {
                tracing::warn!(%family_id, error = %err, "digest recipients lookup failed");
                continue;
            }
        };
        for draft in &family_drafts {
            report.notifications += center.notify_many(&members, draft).await;
        }
    }

    tracing::info!(
        %today,
        families = report.families,
        notifications = report.notifications,
        "daily digest sent"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn russian_plural_forms() {
        let forms = |n| plural_ru(n, "задача", "задачи", "задач");
        assert_eq!(forms(1), "задача");
        assert_eq!(forms(21), "задача");
        assert_eq!(forms(3), "задачи");
        assert_eq!(forms(5), "задач");
        assert_eq!(forms(11), "задач");
        assert_eq!(forms(12), "задач");
        assert_eq!(forms(104), "задачи");
    }

    #[test]
    fn drafts_mention_counts() {
        assert_eq!(tasks_draft(3).message, "Завтра 3 задачи");
        assert_eq!(events_draft(1).message, "Завтра 1 событие");
        let meds = medication_draft(2);
        assert_eq!(meds.kind, "medication_reminder");
        assert_eq!(meds.primary_channel(), Channel::Push);
    }
}
