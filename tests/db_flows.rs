//! Flows that need a live Postgres. Run with
//! `DATABASE_URL=postgres://... cargo test -- --ignored`.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{Duration, NaiveDate, Utc};
use family_backend::{
    audit::AuditSink,
    billing::{ChargeOutcome, ChargeRequest, PaymentGateway, Renewer},
    error::{AppError, AppResult},
    geofence::{FixInput, GeofenceEngine, GeofenceEventType, NewGeofence},
    notify::{NotificationCenter, center::Transports, digest::send_daily_digest},
    rate_limit::{PgRateLimitStore, RateLimitAction, RateLimiter},
    retention::RetentionReaper,
    session::{FamilyScope, MemberRole, SessionResolver},
    utils::SystemClock,
    wallet::WalletLedger,
};
use sqlx::{PgPool, postgres::PgPoolOptions};
use uuid::Uuid;

async fn pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("connect");
    sqlx::migrate!("./migrations").run(&pool).await.expect("migrate");
    pool
}

/// A fresh family with one owner and one plain member.
async fn family(pool: &PgPool) -> (FamilyScope, Uuid) {
    let family_id = Uuid::new_v4();
    sqlx::query("INSERT INTO families (id, name) VALUES ($1, 'Ивановы')")
        .bind(family_id)
        .execute(pool)
        .await
        .unwrap();

    let mut members = Vec::new();
    for (name, role) in [("Мама", "owner"), ("Петя", "member")] {
        let user_id = Uuid::new_v4();
        let member_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO users (id, email, name, password_hash) VALUES ($1, $2, $3, 'x')",
        )
        .bind(user_id)
        .bind(format!("{user_id}@example.com"))
        .bind(name)
        .execute(pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            INSERT INTO family_members (id, family_id, user_id, name, role, status)
            VALUES ($1, $2, $3, $4, $5, 'active')
            "#,
        )
        .bind(member_id)
        .bind(family_id)
        .bind(user_id)
        .bind(name)
        .bind(role)
        .execute(pool)
        .await
        .unwrap();
        members.push((user_id, member_id));
    }

    let (child_user, child_member) = members[1];
    (
        FamilyScope {
            user_id: child_user,
            family_id,
            member_id: child_member,
            role: MemberRole::Member,
        },
        members[0].0,
    )
}

#[tokio::test]
#[ignore]
async fn wallet_keeps_balance_equal_to_ledger() {
    let pool = pool().await;
    let (scope, owner) = family(&pool).await;
    let wallet = WalletLedger::new(pool);

    wallet.topup(scope.family_id, owner, 500, None).await.unwrap();
    wallet.topup(scope.family_id, owner, 250, Some("карманные")).await.unwrap();
    let spent = wallet
        .spend(scope.family_id, scope.user_id, 300, "school", None)
        .await
        .unwrap();
    assert_eq!(spent.balance, 450);
    assert_eq!(wallet.balance(scope.family_id).await.unwrap().balance_rub, 450);

    let history = wallet.history(scope.family_id, None).await.unwrap();
    let amounts: Vec<i64> = history.iter().map(|t| t.amount_rub).collect();
    assert_eq!(amounts, vec![300, 250, 500]);

    let stats = wallet.stats(scope.family_id).await.unwrap();
    assert_eq!((stats.total_topup, stats.total_spent), (750, 300));
    assert_eq!(stats.spend_by_reason.len(), 1);
    assert_eq!(stats.spend_by_reason[0].reason, "school");
    assert_eq!(stats.spend_by_reason[0].total, 300);

    let err = wallet
        .spend(scope.family_id, scope.user_id, 500, "toys", None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AppError::InsufficientFunds {
            balance: 450,
            required: 500
        }
    ));
    assert_eq!(wallet.balance(scope.family_id).await.unwrap().balance_rub, 450);
}

#[tokio::test]
#[ignore]
async fn concurrent_spends_never_go_negative() {
    let pool = pool().await;
    let (scope, owner) = family(&pool).await;
    let wallet = WalletLedger::new(pool);
    wallet.topup(scope.family_id, owner, 100, None).await.unwrap();

    let attempts = (0..5).map(|_| {
        let wallet = wallet.clone();
        tokio::spawn(async move {
            wallet
                .spend(scope.family_id, scope.user_id, 30, "snacks", None)
                .await
        })
    });
    let mut succeeded = 0;
    for attempt in attempts {
        if attempt.await.unwrap().is_ok() {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 3);
    assert_eq!(wallet.balance(scope.family_id).await.unwrap().balance_rub, 10);
}

#[tokio::test]
#[ignore]
async fn leaving_a_zone_alerts_the_family_once() {
    let pool = pool().await;
    let (scope, owner) = family(&pool).await;
    let engine = GeofenceEngine::new(pool.clone(), 200.0);
    let center = NotificationCenter::new(pool.clone(), Transports::default());

    let school = engine
        .create_zone(
            scope.family_id,
            &NewGeofence {
                name: "Школа".into(),
                center_lat: 55.75,
                center_lng: 37.62,
                radius_m: 300.0,
                color: None,
            },
        )
        .await
        .unwrap();

    let inside = FixInput {
        lat: 55.7501,
        lng: 37.6201,
        accuracy_m: Some(15.0),
    };
    let entered = engine.ingest(&scope, inside).await.unwrap();
    assert_eq!(entered.events.len(), 1);
    assert_eq!(entered.events[0].event_type, GeofenceEventType::Enter);
    assert_eq!(entered.events[0].geofence_id, school.id);

    // a fix far outside but too inaccurate moves nobody
    let blurry = FixInput {
        lat: 55.80,
        lng: 37.70,
        accuracy_m: Some(1500.0),
    };
    let skipped = engine.ingest(&scope, blurry).await.unwrap();
    assert!(!skipped.evaluated);
    assert!(skipped.events.is_empty());

    let outside = FixInput {
        lat: 55.7700,
        lng: 37.6500,
        accuracy_m: Some(20.0),
    };
    let exited = engine.ingest(&scope, outside).await.unwrap();
    assert_eq!(exited.events.len(), 1);
    assert_eq!(exited.events[0].event_type, GeofenceEventType::Exit);

    // a second fix outside the zone is not another exit
    let still_outside = engine.ingest(&scope, outside).await.unwrap();
    assert!(still_outside.events.is_empty());

    // scans are global, so another test may be the one that claims this exit
    for _ in 0..3 {
        engine.scan_and_notify(&center).await.unwrap();
    }
    let notified: bool = sqlx::query_scalar("SELECT notified FROM geofence_events WHERE id = $1")
        .bind(exited.events[0].id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(notified);

    let alerts = center
        .list(owner, Some(10), None, Some("geofence_exit"))
        .await
        .unwrap();
    assert_eq!(alerts.notifications.len(), 1);
    assert!(alerts.notifications[0].message.contains("Школа"));
    let own = center
        .list(scope.user_id, Some(10), None, Some("geofence_exit"))
        .await
        .unwrap();
    assert!(own.notifications.is_empty());
}

#[tokio::test]
#[ignore]
async fn postgres_window_matches_policy() {
    let pool = pool().await;
    let limiter = RateLimiter::with_clock(
        Arc::new(PgRateLimitStore::new(pool)),
        Arc::new(SystemClock),
    );
    let ip = format!("test-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());

    for _ in 0..3 {
        let decision = limiter
            .check(&ip, RateLimitAction::PasswordReset, true, None)
            .await
            .unwrap();
        assert!(decision.allowed);
    }
    let blocked = limiter
        .check(&ip, RateLimitAction::PasswordReset, true, None)
        .await
        .unwrap();
    assert!(!blocked.allowed);
    assert_eq!(blocked.remaining, 0);
    assert_eq!(blocked.current, 3);
}

/// Gateway double that answers every charge the same way and counts calls.
struct ScriptedGateway {
    outcome: ChargeOutcome,
    calls: AtomicUsize,
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn charge(&self, _request: &ChargeRequest) -> AppResult<ChargeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.outcome.clone())
    }
}

async fn renewable_subscription(pool: &PgPool, family_id: Uuid) -> (Uuid, chrono::DateTime<Utc>) {
    let id = Uuid::new_v4();
    let end_date = sqlx::query_scalar::<_, chrono::DateTime<Utc>>(
        r#"
        INSERT INTO subscriptions
            (id, family_id, plan_type, status, start_date, end_date, amount, auto_renew, payment_token)
        VALUES ($1, $2, 'month', 'active', NOW() - INTERVAL '28 days', NOW() + INTERVAL '2 days', 299, TRUE, 'tok_x')
        RETURNING end_date
        "#,
    )
    .bind(id)
    .bind(family_id)
    .fetch_one(pool)
    .await
    .unwrap();
    (id, end_date)
}

fn renewer(pool: &PgPool, gateway: Arc<ScriptedGateway>) -> Renewer {
    Renewer::new(
        pool.clone(),
        gateway,
        Arc::new(NotificationCenter::new(pool.clone(), Transports::default())),
        AuditSink::new(pool.clone()),
    )
}

#[tokio::test]
#[ignore]
async fn renewal_charges_each_cycle_once() {
    let pool = pool().await;
    let (scope, _) = family(&pool).await;
    let (subscription_id, end_date) = renewable_subscription(&pool, scope.family_id).await;
    let gateway = Arc::new(ScriptedGateway {
        outcome: ChargeOutcome::Succeeded {
            payment_id: "pay_1".into(),
        },
        calls: AtomicUsize::new(0),
    });
    let renewer = renewer(&pool, gateway.clone());

    let today = Utc::now().date_naive();
    renewer.run(today).await.unwrap();
    renewer.run(today).await.unwrap();
    assert_eq!(gateway.calls.load(Ordering::SeqCst), 1);

    let (new_end, last_payment) = sqlx::query_as::<_, (chrono::DateTime<Utc>, Option<chrono::DateTime<Utc>>)>(
        "SELECT end_date, last_payment_date FROM subscriptions WHERE id = $1",
    )
    .bind(subscription_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(new_end, end_date.checked_add_months(chrono::Months::new(1)).unwrap());
    assert!(last_payment.is_some());

    let payments = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM subscription_payments WHERE subscription_id = $1 AND status = 'succeeded'",
    )
    .bind(subscription_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(payments, 1);
}

#[tokio::test]
#[ignore]
async fn declined_renewal_turns_off_auto_renew_and_warns() {
    let pool = pool().await;
    let (scope, owner) = family(&pool).await;
    let (subscription_id, _) = renewable_subscription(&pool, scope.family_id).await;
    let gateway = Arc::new(ScriptedGateway {
        outcome: ChargeOutcome::Declined {
            reason: "insufficient_funds".into(),
        },
        calls: AtomicUsize::new(0),
    });
    let renewer = renewer(&pool, gateway.clone());

    let report = renewer.run(Utc::now().date_naive()).await.unwrap();
    assert_eq!(report.declined, 1);

    let auto_renew =
        sqlx::query_scalar::<_, bool>("SELECT auto_renew FROM subscriptions WHERE id = $1")
            .bind(subscription_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert!(!auto_renew);

    let center = NotificationCenter::new(pool.clone(), Transports::default());
    let warnings = center
        .list(owner, None, None, Some("subscription_expiring"))
        .await
        .unwrap();
    assert_eq!(warnings.notifications.len(), 1);
}

#[tokio::test]
#[ignore]
async fn expired_and_revoked_sessions_are_rejected() {
    let pool = pool().await;
    let (scope, _) = family(&pool).await;
    let sessions = SessionResolver::new(pool.clone());

    let live = sessions.issue(scope.user_id, Duration::hours(1)).await.unwrap();
    let identity = sessions.resolve(&live.token).await.unwrap();
    assert_eq!(identity.family_id, Some(scope.family_id));
    assert_eq!(identity.role, Some(MemberRole::Member));

    sqlx::query("UPDATE sessions SET expires_at = NOW() - INTERVAL '1 second' WHERE token = $1")
        .bind(&live.token)
        .execute(&pool)
        .await
        .unwrap();
    assert!(matches!(
        sessions.resolve(&live.token).await,
        Err(AppError::Unauthorized)
    ));

    let other = sessions.issue(scope.user_id, Duration::hours(1)).await.unwrap();
    assert!(sessions.revoke(&other.token).await.unwrap());
    assert!(matches!(
        sessions.resolve(&other.token).await,
        Err(AppError::Unauthorized)
    ));
}

/// Adds an active member who has no account of their own yet.
async fn unlinked_member(pool: &PgPool, family_id: Uuid) -> Uuid {
    let member_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO family_members (id, family_id, user_id, name, role, status)
        VALUES ($1, $2, NULL, 'Бабушка', 'member', 'active')
        "#,
    )
    .bind(member_id)
    .bind(family_id)
    .execute(pool)
    .await
    .unwrap();
    member_id
}

#[tokio::test]
#[ignore]
async fn members_without_accounts_do_not_block_exit_alerts() {
    let pool = pool().await;
    let (scope, owner) = family(&pool).await;
    unlinked_member(&pool, scope.family_id).await;
    let engine = GeofenceEngine::new(pool.clone(), 200.0);
    let center = NotificationCenter::new(pool.clone(), Transports::default());

    engine
        .create_zone(
            scope.family_id,
            &NewGeofence {
                name: "Дача".into(),
                center_lat: 56.10,
                center_lng: 38.10,
                radius_m: 200.0,
                color: None,
            },
        )
        .await
        .unwrap();
    let near = FixInput {
        lat: 56.1001,
        lng: 38.1001,
        accuracy_m: Some(10.0),
    };
    let far = FixInput {
        lat: 56.20,
        lng: 38.20,
        accuracy_m: Some(10.0),
    };
    engine.ingest(&scope, near).await.unwrap();
    let exited = engine.ingest(&scope, far).await.unwrap();
    assert_eq!(exited.events[0].event_type, GeofenceEventType::Exit);

    for _ in 0..2 {
        engine.scan_and_notify(&center).await.unwrap();
    }
    let alerts = center
        .list(owner, None, None, Some("geofence_exit"))
        .await
        .unwrap();
    assert_eq!(alerts.notifications.len(), 1);
    assert!(alerts.notifications[0].message.contains("Дача"));
}

#[tokio::test]
#[ignore]
async fn digest_skips_members_without_accounts() {
    let pool = pool().await;
    let (scope, owner) = family(&pool).await;
    unlinked_member(&pool, scope.family_id).await;
    let center = NotificationCenter::new(pool.clone(), Transports::default());

    // a far-off day keeps other families' tasks out of this run
    let today = NaiveDate::from_ymd_opt(2091, 3, 14).unwrap();
    for title in ["Купить продукты", "Записаться к врачу"] {
        sqlx::query("INSERT INTO tasks (id, family_id, title, due_date) VALUES ($1, $2, $3, $4)")
            .bind(Uuid::new_v4())
            .bind(scope.family_id)
            .bind(title)
            .bind(today + Duration::days(1))
            .execute(&pool)
            .await
            .unwrap();
    }

    let report = send_daily_digest(&pool, &center, today).await.unwrap();
    assert!(report.families >= 1);
    for user in [owner, scope.user_id] {
        let digest = center
            .list(user, None, None, Some("tasks_tomorrow"))
            .await
            .unwrap();
        assert_eq!(digest.notifications.len(), 1);
        assert_eq!(digest.notifications[0].message, "Завтра 2 задачи");
    }
}

fn violates(result: Result<sqlx::postgres::PgQueryResult, sqlx::Error>, constraint: &str) -> bool {
    match result {
        Err(sqlx::Error::Database(err)) => err.constraint() == Some(constraint),
        _ => false,
    }
}

#[tokio::test]
#[ignore]
async fn schema_keeps_family_and_subscription_invariants() {
    let pool = pool().await;
    let (scope, owner) = family(&pool).await;

    let second_owner = sqlx::query(
        r#"
        INSERT INTO family_members (id, family_id, user_id, name, role, status)
        VALUES ($1, $2, NULL, 'Папа', 'owner', 'active')
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(scope.family_id)
    .execute(&pool)
    .await;
    assert!(violates(second_owner, "family_members_one_owner_idx"));

    let duplicate = sqlx::query(
        r#"
        INSERT INTO family_members (id, family_id, user_id, name, role, status)
        VALUES ($1, $2, $3, 'Мама', 'member', 'active')
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(scope.family_id)
    .bind(owner)
    .execute(&pool)
    .await;
    assert!(violates(duplicate, "family_members_one_active_idx"));

    // a member who left may rejoin
    sqlx::query("UPDATE family_members SET status = 'left' WHERE id = $1")
        .bind(scope.member_id)
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        r#"
        INSERT INTO family_members (id, family_id, user_id, name, role, status)
        VALUES ($1, $2, $3, 'Петя', 'member', 'active')
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(scope.family_id)
    .bind(scope.user_id)
    .execute(&pool)
    .await
    .unwrap();

    let insert_subscription = |auto_renew: bool, token: Option<&'static str>| {
        sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, family_id, plan_type, status, start_date, end_date, amount, auto_renew, payment_token)
            VALUES ($1, $2, 'month', 'active', NOW(), NOW() + INTERVAL '30 days', 299, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scope.family_id)
        .bind(auto_renew)
        .bind(token)
        .execute(&pool)
    };
    assert!(violates(
        insert_subscription(true, None).await,
        "subscriptions_auto_renew_token_check"
    ));
    insert_subscription(false, None).await.unwrap();
    assert!(violates(
        insert_subscription(true, Some("tok_y")).await,
        "subscriptions_one_active_idx"
    ));
}

async fn count_for_user(pool: &PgPool, table: &str, user_id: Uuid) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table} WHERE user_id = $1"))
        .bind(user_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore]
async fn retention_removes_dormant_accounts_and_aged_rows() {
    let pool = pool().await;
    let (scope, owner) = family(&pool).await;

    let dormant = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO users (id, phone, name, password_hash, created_at)
        VALUES ($1, $2, 'Дядя', 'x', NOW() - INTERVAL '4 years')
        "#,
    )
    .bind(dormant)
    .bind(format!("+7{}", &dormant.simple().to_string()[..10]))
    .execute(&pool)
    .await
    .unwrap();
    let dormant_member = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO family_members (id, family_id, user_id, name, role, status, joined_at)
        VALUES ($1, $2, $3, 'Дядя', 'member', 'active', NOW() - INTERVAL '4 years')
        "#,
    )
    .bind(dormant_member)
    .bind(scope.family_id)
    .bind(dormant)
    .execute(&pool)
    .await
    .unwrap();

    let seed = [
        "INSERT INTO sessions (token, user_id, created_at, expires_at) \
         VALUES (gen_random_uuid()::text, $1, NOW() - INTERVAL '4 years', NOW() - INTERVAL '4 years' + INTERVAL '30 days')",
        "INSERT INTO location_fixes (id, user_id, family_id, lat, lng, created_at) \
         SELECT gen_random_uuid(), $1, family_id, 55.7, 37.6, NOW() - INTERVAL '4 years' FROM family_members WHERE user_id = $1",
        "INSERT INTO audit_logs (id, user_id, action_type, action_category) VALUES (gen_random_uuid(), $1, 'login', 'auth')",
        "INSERT INTO push_subscriptions (id, user_id, endpoint, p256dh, auth) \
         VALUES (gen_random_uuid(), $1, 'https://push.example/' || $1::text, 'k', 'a')",
        "INSERT INTO notifications (id, user_id, type, title, message, channel) \
         VALUES (gen_random_uuid(), $1, 'tasks_tomorrow', 't', 'm', 'in_app')",
    ];
    for statement in seed {
        sqlx::query(statement).bind(dormant).execute(&pool).await.unwrap();
    }

    // the owner is active: only rows past their own retention go
    for created_at in ["NOW() - INTERVAL '40 days'", "NOW()"] {
        sqlx::query(&format!(
            "INSERT INTO location_fixes (id, user_id, family_id, lat, lng, created_at) \
             VALUES (gen_random_uuid(), $1, $2, 55.7, 37.6, {created_at})"
        ))
        .bind(owner)
        .bind(scope.family_id)
        .execute(&pool)
        .await
        .unwrap();
    }
    for created_at in ["NOW() - INTERVAL '400 days'", "NOW()"] {
        sqlx::query(&format!(
            "INSERT INTO audit_logs (id, user_id, action_type, action_category, created_at) \
             VALUES (gen_random_uuid(), $1, 'login', 'auth', {created_at})"
        ))
        .bind(owner)
        .execute(&pool)
        .await
        .unwrap();
    }
    let ip = format!("198.51.100.{}", owner.as_bytes()[0]);
    for created_at in ["NOW() - INTERVAL '25 hours'", "NOW()"] {
        sqlx::query(&format!(
            "INSERT INTO rate_limit_log (id, ip_address, action_type, user_id, created_at) \
             VALUES (gen_random_uuid(), $1, 'api', $2, {created_at})"
        ))
        .bind(&ip)
        .bind(owner)
        .execute(&pool)
        .await
        .unwrap();
    }
    sqlx::query(
        r#"
        INSERT INTO subscriptions (id, family_id, plan_type, status, start_date, end_date, amount)
        VALUES ($1, $2, 'month', 'active', NOW() - INTERVAL '40 days', NOW() - INTERVAL '10 days', 299)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(scope.family_id)
    .execute(&pool)
    .await
    .unwrap();

    let report = RetentionReaper::new(pool.clone()).reap().await.unwrap();
    assert!(report.inactive_users >= 1);
    assert!(report.lapsed_subscriptions >= 1);

    let user_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE id = $1")
        .bind(dormant)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(user_rows, 0);
    for table in [
        "sessions",
        "family_members",
        "location_fixes",
        "audit_logs",
        "push_subscriptions",
        "notifications",
    ] {
        let remaining = count_for_user(&pool, table, dormant).await;
        assert_eq!(remaining, 0, "{table} still references the dormant user");
    }
    let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM geofence_events WHERE member_id = $1")
        .bind(dormant_member)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(events, 0);

    assert_eq!(count_for_user(&pool, "location_fixes", owner).await, 1);
    assert_eq!(count_for_user(&pool, "audit_logs", owner).await, 1);
    let rate_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rate_limit_log WHERE ip_address = $1")
        .bind(&ip)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rate_rows, 1);

    let status: String = sqlx::query_scalar("SELECT status FROM subscriptions WHERE family_id = $1")
        .bind(scope.family_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "expired");
    assert_eq!(count_for_user(&pool, "family_members", owner).await, 1);
}
