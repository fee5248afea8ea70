//! RFC 5545 export of the family calendar.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::AppResult;

const CRLF: &str = "\r\n";
const MAX_LINE_OCTETS: usize = 75;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CalendarEvent {
    pub id: Uuid,
    pub family_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub is_all_day: bool,
    pub location: Option<String>,
    pub category: Option<String>,
    pub color: Option<String>,
    pub recurring: bool,
}

/// TEXT value escaping. CRLF and a lone CR both count as a line break.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            ';' => out.push_str("\\;"),
            '\n' => out.push_str("\\n"),
            '\r' => {
                chars.next_if_eq(&'\n');
                out.push_str("\\n");
            }
            other => out.push(other),
        }
    }
    out
}

pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

pub fn category_label(code: &str) -> &str {
    match code {
        "birthday" => "День рождения",
        "holiday" => "Праздник",
        "family" => "Семья",
        "school" => "Школа",
        "medical" | "health" => "Здоровье",
        "work" => "Работа",
        "sport" => "Спорт",
        "travel" => "Путешествие",
        "other" => "Другое",
        other => other,
    }
}

/// Splits a content line into 75-octet pieces without cutting a UTF-8 sequence.
fn fold(line: &str, out: &mut String) {
    let mut start = 0;
    let mut limit = MAX_LINE_OCTETS;
    while line.len() - start > limit {
        let mut end = start + limit;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        out.push_str(&line[start..end]);
        out.push_str(CRLF);
        out.push(' ');
        start = end;
        // continuation lines spend one octet on the leading space
        limit = MAX_LINE_OCTETS - 1;
    }
    out.push_str(&line[start..]);
    out.push_str(CRLF);
}

fn push_event(event: &CalendarEvent, dtstamp: &str, lines: &mut Vec<String>) {
    lines.push("BEGIN:VEVENT".into());
    lines.push(format!("UID:{}@family-organizer", event.id));
    lines.push(format!("DTSTAMP:{dtstamp}"));

    match event.time.filter(|_| !event.is_all_day) {
        None => {
            lines.push(format!("DTSTART;VALUE=DATE:{}", event.date.format("%Y%m%d")));
            let end = event.date + Duration::days(1);
            lines.push(format!("DTEND;VALUE=DATE:{}", end.format("%Y%m%d")));
        }
        Some(time) => {
            let start = event.date.and_time(time);
            let end = match event.end_time {
                Some(end_time) if end_time > time => event.date.and_time(end_time),
                _ => start + Duration::hours(1),
            };
            lines.push(format!("DTSTART:{}", start.format("%Y%m%dT%H%M%S")));
            lines.push(format!("DTEND:{}", end.format("%Y%m%dT%H%M%S")));
        }
    }

    lines.push(format!("SUMMARY:{}", escape(&event.title)));
    if let Some(description) = event.description.as_deref().filter(|d| !d.is_empty()) {
        lines.push(format!("DESCRIPTION:{}", escape(description)));
    }
    if let Some(location) = event.location.as_deref().filter(|l| !l.is_empty()) {
        lines.push(format!("LOCATION:{}", escape(location)));
    }
    if let Some(category) = event.category.as_deref().filter(|c| !c.is_empty()) {
        lines.push(format!("CATEGORIES:{}", escape(category_label(category))));
    }
    if let Some(color) = event.color.as_deref().filter(|c| !c.is_empty()) {
        lines.push(format!("X-APPLE-CALENDAR-COLOR:{color}"));
    }
    if event.recurring {
        lines.push("RRULE:FREQ=YEARLY".into());
    }
    lines.push("END:VEVENT".into());
}

pub fn render(events: &[CalendarEvent], now: DateTime<Utc>) -> String {
    let dtstamp = now.format("%Y%m%dT%H%M%SZ").to_string();
    let mut lines = vec![
        "BEGIN:VCALENDAR".to_string(),
        "VERSION:2.0".into(),
        "PRODID:-//Family Organizer//Calendar Export//RU".into(),
        "CALSCALE:GREGORIAN".into(),
        "METHOD:PUBLISH".into(),
        "X-WR-CALNAME:Семейный календарь".into(),
    ];
    for event in events {
        push_event(event, &dtstamp, &mut lines);
    }
    lines.push("END:VCALENDAR".into());

    let mut out = String::new();
    for line in &lines {
        fold(line, &mut out);
    }
    out
}

pub fn filename(today: NaiveDate) -> String {
    format!("family_calendar_{}.ics", today.format("%Y%m%d"))
}

pub async fn family_events(pool: &PgPool, family_id: Uuid) -> AppResult<Vec<CalendarEvent>> {
    let events = sqlx::query_as::<_, CalendarEvent>(
        r#"
        SELECT id, family_id, title, description, date, time, end_time, is_all_day,
               location, category, color, recurring
        FROM calendar_events
        WHERE family_id = $1
        ORDER BY date, time NULLS FIRST
        "#,
    )
    .bind(family_id)
    .fetch_all(pool)
    .await?;
    Ok(events)
}
