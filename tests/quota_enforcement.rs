mod common;

use chrono::{Duration, Local, Utc};

use common::*;
use laoshi_bot::subscription::UsageChannel;

/// A registered user whose trial window has already elapsed.
async fn free_user(db: &laoshi_bot::db::Database, user_id: i64) {
    register_user(db, user_id).await;
    let ledger = ledger(db);
    ledger.start_trial(user_id).await.unwrap();
    backdate_trial(db, user_id, TRIAL_DAYS + 1).await;
}

#[tokio::test]
async fn free_user_text_quota_is_enforced() {
    let db = test_db().await;
    free_user(&db, 1).await;
    let quota = quota(&db);

    for _ in 0..TEXT_LIMIT {
        assert!(quota.check_allowed(1, UsageChannel::Text).await);
        quota.record_usage(1, UsageChannel::Text).await.unwrap();
    }
    // The 21st message is denied.
    assert!(!quota.check_allowed(1, UsageChannel::Text).await);
    // Voice is counted separately and still available.
    assert!(quota.check_allowed(1, UsageChannel::Voice).await);
}

#[tokio::test]
async fn free_user_voice_quota_is_enforced() {
    let db = test_db().await;
    free_user(&db, 1).await;
    let quota = quota(&db);

    for _ in 0..VOICE_LIMIT {
        assert!(quota.check_allowed(1, UsageChannel::Voice).await);
        quota.record_usage(1, UsageChannel::Voice).await.unwrap();
    }
    assert!(!quota.check_allowed(1, UsageChannel::Voice).await);
}

#[tokio::test]
async fn counters_reset_at_day_rollover() {
    let db = test_db().await;
    free_user(&db, 1).await;
    let quota = quota(&db);

    let yesterday = Local::now().date_naive() - Duration::days(1);
    for _ in 0..VOICE_LIMIT {
        quota
            .record_usage_on(1, UsageChannel::Voice, yesterday)
            .await
            .unwrap();
    }

    // Yesterday is exhausted, today starts from zero.
    assert!(!quota.check_allowed_on(1, UsageChannel::Voice, yesterday).await);
    assert!(quota.check_allowed(1, UsageChannel::Voice).await);
}

#[tokio::test]
async fn vocab_cap_is_cumulative_across_days() {
    let db = test_db().await;
    free_user(&db, 1).await;
    let quota = quota(&db);

    let today = Local::now().date_naive();
    for days_ago in [10, 1] {
        for _ in 0..VOCAB_LIMIT / 2 {
            quota
                .record_usage_on(1, UsageChannel::Vocab, today - Duration::days(days_ago))
                .await
                .unwrap();
        }
    }

    // 50 words saved over two weeks: the cap does not roll over.
    assert!(!quota.check_allowed(1, UsageChannel::Vocab).await);
}

#[tokio::test]
async fn trial_user_is_unlimited() {
    let db = test_db().await;
    register_user(&db, 1).await;
    ledger(&db).start_trial(1).await.unwrap();
    let quota = quota(&db);

    for _ in 0..TEXT_LIMIT + 5 {
        quota.record_usage(1, UsageChannel::Text).await.unwrap();
    }
    assert!(quota.check_allowed(1, UsageChannel::Text).await);
    assert!(quota.check_allowed(1, UsageChannel::Voice).await);
    assert!(quota.check_allowed(1, UsageChannel::Vocab).await);
}

#[tokio::test]
async fn premium_user_is_unlimited() {
    let db = test_db().await;
    free_user(&db, 1).await;
    ledger(&db)
        .grant_premium(1, 30, "evt-1", 77000, "payment")
        .await
        .unwrap();
    let quota = quota(&db);

    for _ in 0..TEXT_LIMIT + 5 {
        quota.record_usage(1, UsageChannel::Text).await.unwrap();
    }
    assert!(quota.check_allowed(1, UsageChannel::Text).await);
}

#[tokio::test]
async fn expired_premium_falls_back_to_free_limits() {
    let db = test_db().await;
    free_user(&db, 1).await;
    set_premium_until(&db, 1, Some(Utc::now() - Duration::hours(1))).await;
    let quota = quota(&db);

    for _ in 0..TEXT_LIMIT {
        quota.record_usage(1, UsageChannel::Text).await.unwrap();
    }
    assert!(!quota.check_allowed(1, UsageChannel::Text).await);
}

#[tokio::test]
async fn unknown_user_fails_closed() {
    let db = test_db().await;
    let quota = quota(&db);

    // No subscription record: deny rather than allow unlimited use.
    assert!(!quota.check_allowed(404, UsageChannel::Text).await);
}
