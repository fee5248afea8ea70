//! Circular zones, location ingestion and exit alerts.
//!
//! The side a member was last on for a zone is derived from the newest
//! event for that (member, zone); no event means outside. Ingestion for one
//! member is serialized on the member row, so events always alternate
//! enter, exit, enter.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::notify::{Channel, NotificationCenter, NotificationDraft};
use crate::session::FamilyScope;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;
pub const MAX_RADIUS_M: f64 = 50_000.0;
pub const DEFAULT_COLOR: &str = "#3b82f6";
/// How far back the periodic scan looks for unsent exits, in minutes.
pub const SCAN_WINDOW_MINUTES: i64 = 5;

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_phi = (lat2 - lat1).to_radians();
    let delta_lambda = (lng2 - lng1).to_radians();

    let a = (delta_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum GeofenceEventType {
    Enter,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Inside,
    Outside,
}

impl Side {
    fn after(event: Option<GeofenceEventType>) -> Self {
        match event {
            Some(GeofenceEventType::Enter) => Side::Inside,
            Some(GeofenceEventType::Exit) | None => Side::Outside,
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Geofence {
    pub id: Uuid,
    pub family_id: Uuid,
    pub name: String,
    pub center_lat: f64,
    pub center_lng: f64,
    pub radius_m: f64,
    pub color: String,
    pub created_at: DateTime<Utc>,
}

impl Geofence {
    pub fn side_of(&self, lat: f64, lng: f64) -> Side {
        if haversine_m(self.center_lat, self.center_lng, lat, lng) <= self.radius_m {
            Side::Inside
        } else {
            Side::Outside
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewGeofence {
    pub name: String,
    pub center_lat: f64,
    pub center_lng: f64,
    pub radius_m: f64,
    pub color: Option<String>,
}

fn validate_coordinates(lat: f64, lng: f64) -> AppResult<()> {
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(AppError::bad_request("Некорректные координаты"));
    }
    Ok(())
}

impl NewGeofence {
    pub fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::bad_request("Название зоны обязательно"));
        }
        validate_coordinates(self.center_lat, self.center_lng)?;
        if !(self.radius_m > 0.0 && self.radius_m <= MAX_RADIUS_M) {
            return Err(AppError::bad_request("Радиус должен быть от 0 до 50000 м"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct FixInput {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LocationFix {
    pub id: Uuid,
    pub user_id: Uuid,
    pub family_id: Uuid,
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: Option<f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct GeofenceEvent {
    pub id: Uuid,
    pub member_id: Uuid,
    pub geofence_id: Uuid,
    pub event_type: GeofenceEventType,
    pub timestamp: DateTime<Utc>,
    pub notified: bool,
}

/// Transitions produced by one fix, given the last event per zone.
pub fn evaluate(
    zones: &[Geofence],
    last_events: &HashMap<Uuid, GeofenceEventType>,
    lat: f64,
    lng: f64,
) -> Vec<(Uuid, GeofenceEventType)> {
    zones
        .iter()
        .filter_map(|zone| {
            let previous = Side::after(last_events.get(&zone.id).copied());
            match (previous, zone.side_of(lat, lng)) {
                (Side::Outside, Side::Inside) => Some((zone.id, GeofenceEventType::Enter)),
                (Side::Inside, Side::Outside) => Some((zone.id, GeofenceEventType::Exit)),
                _ => None,
            }
        })
        .collect()
}

pub fn exit_message(member_name: &str, zone_name: &str) -> String {
    format!("⚠️ {member_name} вышел из зоны {zone_name}")
}

#[derive(Debug, Serialize)]
pub struct IngestOutcome {
    pub fix: LocationFix,
    /// False when the fix was too inaccurate to move anyone across a boundary.
    pub evaluated: bool,
    pub events: Vec<GeofenceEvent>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub events: usize,
    pub notifications: usize,
}

#[derive(sqlx::FromRow)]
struct LastEventRow {
    geofence_id: Uuid,
    event_type: GeofenceEventType,
}

#[derive(sqlx::FromRow)]
struct ClaimedExit {
    id: Uuid,
    member_id: Uuid,
    family_id: Uuid,
    member_name: String,
    zone_name: String,
}

#[derive(Clone)]
pub struct GeofenceEngine {
    pool: PgPool,
    accuracy_threshold_m: f64,
}

impl GeofenceEngine {
    pub fn new(pool: PgPool, accuracy_threshold_m: f64) -> Self {
        Self {
            pool,
            accuracy_threshold_m,
        }
    }

    pub async fn list_zones(&self, family_id: Uuid) -> AppResult<Vec<Geofence>> {
        let zones = sqlx::query_as::<_, Geofence>(
            r#"
            SELECT id, family_id, name, center_lat, center_lng, radius_m, color, created_at
            FROM geofences
            WHERE family_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(family_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(zones)
    }

    pub async fn create_zone(&self, family_id: Uuid, zone: &NewGeofence) -> AppResult<Geofence> {
        zone.validate()?;
        let created = sqlx::query_as::<_, Geofence>(
            r#"
            INSERT INTO geofences (id, family_id, name, center_lat, center_lng, radius_m, color, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            RETURNING id, family_id, name, center_lat, center_lng, radius_m, color, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(family_id)
        .bind(zone.name.trim())
        .bind(zone.center_lat)
        .bind(zone.center_lng)
        .bind(zone.radius_m)
        .bind(zone.color.as_deref().unwrap_or(DEFAULT_COLOR))
        .fetch_one(&self.pool)
        .await?;
        Ok(created)
    }

    pub async fn delete_zone(&self, family_id: Uuid, zone_id: Uuid) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM geofences WHERE id = $1 AND family_id = $2")
            .bind(zone_id)
            .bind(family_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::not_found("Зона не найдена"));
        }
        Ok(())
    }

    /// Stores the fix and appends enter/exit events for every zone it crosses.
    pub async fn ingest(&self, scope: &FamilyScope, input: FixInput) -> AppResult<IngestOutcome> {
        validate_coordinates(input.lat, input.lng)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT id FROM family_members WHERE id = $1 FOR UPDATE")
            .bind(scope.member_id)
            .execute(&mut *tx)
            .await?;

        let fix = sqlx::query_as::<_, LocationFix>(
            r#"
            INSERT INTO location_fixes (id, user_id, family_id, lat, lng, accuracy_m, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            RETURNING id, user_id, family_id, lat, lng, accuracy_m, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scope.user_id)
        .bind(scope.family_id)
        .bind(input.lat)
        .bind(input.lng)
        .bind(input.accuracy_m)
        .fetch_one(&mut *tx)
        .await?;

        if input
            .accuracy_m
            .is_some_and(|accuracy| accuracy > self.accuracy_threshold_m)
        {
            tx.commit().await?;
            tracing::debug!(member_id = %scope.member_id, accuracy = ?input.accuracy_m, "fix too inaccurate for geofencing");
            return Ok(IngestOutcome {
                fix,
                evaluated: false,
                events: Vec::new(),
            });
        }

        let zones = sqlx::query_as::<_, Geofence>(
            r#"
            SELECT id, family_id, name, center_lat, center_lng, radius_m, color, created_at
            FROM geofences
            WHERE family_id = $1
            "#,
        )
        .bind(scope.family_id)
        .fetch_all(&mut *tx)
        .await?;

        let last_events = Self::last_events(&mut tx, scope.member_id).await?;
        let mut events = Vec::new();
        for (geofence_id, event_type) in evaluate(&zones, &last_events, input.lat, input.lng) {
            let event = sqlx::query_as::<_, GeofenceEvent>(
                r#"
                INSERT INTO geofence_events (id, member_id, geofence_id, event_type, timestamp, notified)
                VALUES ($1, $2, $3, $4, clock_timestamp(), FALSE)
                RETURNING id, member_id, geofence_id, event_type, timestamp, notified
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(scope.member_id)
            .bind(geofence_id)
            .bind(event_type)
            .fetch_one(&mut *tx)
            .await?;
            events.push(event);
        }

        tx.commit().await?;
        if !events.is_empty() {
            tracing::info!(member_id = %scope.member_id, events = events.len(), "geofence transitions recorded");
        }
        Ok(IngestOutcome {
            fix,
            evaluated: true,
            events,
        })
    }

    async fn last_events(
        tx: &mut Transaction<'_, Postgres>,
        member_id: Uuid,
    ) -> AppResult<HashMap<Uuid, GeofenceEventType>> {
        let rows = sqlx::query_as::<_, LastEventRow>(
            r#"
            SELECT DISTINCT ON (geofence_id) geofence_id, event_type
            FROM geofence_events
            WHERE member_id = $1
            ORDER BY geofence_id, timestamp DESC
            "#,
        )
        .bind(member_id)
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows.into_iter().map(|r| (r.geofence_id, r.event_type)).collect())
    }

    pub async fn recent_events(&self, family_id: Uuid, limit: i64) -> AppResult<Vec<GeofenceEvent>> {
        let events = sqlx::query_as::<_, GeofenceEvent>(
            r#"
            SELECT e.id, e.member_id, e.geofence_id, e.event_type, e.timestamp, e.notified
            FROM geofence_events e
            JOIN geofences g ON g.id = e.geofence_id
            WHERE g.family_id = $1
            ORDER BY e.timestamp DESC
            LIMIT $2
            "#,
        )
        .bind(family_id)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    /// Latest fix of every member of the family.
    pub async fn latest_locations(&self, family_id: Uuid) -> AppResult<Vec<LocationFix>> {
        let fixes = sqlx::query_as::<_, LocationFix>(
            r#"
            SELECT DISTINCT ON (user_id) id, user_id, family_id, lat, lng, accuracy_m, created_at
            FROM location_fixes
            WHERE family_id = $1
            ORDER BY user_id, created_at DESC
            "#,
        )
        .bind(family_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(fixes)
    }

    /// Active members of the family other than the one who left, skipping
    /// members without a linked account.
    async fn alert_recipients(&self, exit: &ClaimedExit) -> AppResult<Vec<Uuid>> {
        let recipients = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT user_id FROM family_members
            WHERE family_id = $1 AND status = 'active' AND id <> $2 AND user_id IS NOT NULL
            "#,
        )
        .bind(exit.family_id)
        .bind(exit.member_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(recipients)
    }

    /// Claims recent unsent exit events and alerts the other members of the
    /// family. A claimed event is never sent again, even if delivery fails.
    pub async fn scan_and_notify(&self, center: &NotificationCenter) -> AppResult<ScanReport> {
        let claimed = sqlx::query_as::<_, ClaimedExit>(
            r#"
            UPDATE geofence_events e
            SET notified = TRUE
            FROM family_members m, geofences g
            WHERE e.member_id = m.id
              AND e.geofence_id = g.id
              AND e.event_type = 'exit'
              AND e.notified = FALSE
              AND e.timestamp > NOW() - $1 * INTERVAL '1 minute'
            RETURNING e.id, e.member_id, m.family_id, m.name AS member_name, g.name AS zone_name
            "#,
        )
        .bind(SCAN_WINDOW_MINUTES as f64)
        .fetch_all(&self.pool)
        .await?;

        let mut report = ScanReport {
            events: claimed.len(),
            notifications: 0,
        };
        for exit in claimed {
            let recipients = match self.alert_recipients(&exit).await {
                Ok(recipients) => recipients,
                Err(err) => {
                    tracing::warn!(event_id = %exit.id, error = %err, "geofence exit recipients lookup failed");
                    continue;
                }
            };

            let draft = NotificationDraft::new(
                "geofence_exit",
                "Семейный трекер",
                exit_message(&exit.member_name, &exit.zone_name),
            )
            .with_url("/family-tracker")
            .via(&[Channel::Push]);

            report.notifications += center.notify_many(&recipients, &draft).await;
            tracing::info!(event_id = %exit.id, recipients = recipients.len(), "geofence exit dispatched");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> Geofence {
        Geofence {
            id: Uuid::new_v4(),
            family_id: Uuid::new_v4(),
            name: "Школа".into(),
            center_lat: 55.75,
            center_lng: 37.62,
            radius_m: 300.0,
            color: DEFAULT_COLOR.into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn haversine_known_distance() {
        // Moscow to Saint Petersburg is roughly 634 km
        let d = haversine_m(55.7558, 37.6173, 59.9343, 30.3351);
        assert!((d - 634_000.0).abs() < 5_000.0, "{d}");
        assert_eq!(haversine_m(10.0, 10.0, 10.0, 10.0), 0.0);
    }

    #[test]
    fn exit_scenario_produces_enter_then_exit() {
        let zone = zone();
        let zones = vec![zone.clone()];
        let mut last = HashMap::new();

        let first = evaluate(&zones, &last, 55.7501, 37.6201);
        assert_eq!(first, vec![(zone.id, GeofenceEventType::Enter)]);
        last.insert(zone.id, GeofenceEventType::Enter);

        assert!(evaluate(&zones, &last, 55.7502, 37.6199).is_empty());

        let second = evaluate(&zones, &last, 55.7700, 37.6500);
        assert_eq!(second, vec![(zone.id, GeofenceEventType::Exit)]);
        last.insert(zone.id, GeofenceEventType::Exit);

        assert!(evaluate(&zones, &last, 55.7700, 37.6500).is_empty());
    }

    #[test]
    fn first_fix_outside_emits_nothing() {
        let zones = vec![zone()];
        assert!(evaluate(&zones, &HashMap::new(), 56.0, 38.0).is_empty());
    }

    #[test]
    fn zone_validation() {
        let mut zone = NewGeofence {
            name: "Дом".into(),
            center_lat: 55.75,
            center_lng: 37.62,
            radius_m: 300.0,
            color: None,
        };
        assert!(zone.validate().is_ok());
        zone.radius_m = 0.0;
        assert!(zone.validate().is_err());
        zone.radius_m = 100.0;
        zone.center_lat = 91.0;
        assert!(zone.validate().is_err());
        zone.center_lat = 55.0;
        zone.name = "  ".into();
        assert!(zone.validate().is_err());
    }

    #[test]
    fn exit_message_format() {
        assert_eq!(exit_message("Аня", "Школа"), "⚠️ Аня вышел из зоны Школа");
    }
}
