mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};

use common::*;
use laoshi_bot::db::models::Tier;
use laoshi_bot::notify::Notice;

#[tokio::test]
async fn expired_trial_downgrades_and_notifies_once() {
    let db = test_db().await;
    let ledger = ledger(&db);
    let notifier = Arc::new(RecordingNotifier::default());
    let sweeper = sweeper(&db, notifier.clone());

    // Registered at T0 with a 3-day trial; the sweeper runs at T0+3d1h.
    register_user(&db, 1).await;
    ledger.start_trial(1).await.unwrap();
    backdate_trial(&db, 1, TRIAL_DAYS).await;
    let now = Utc::now() + Duration::hours(1);

    let stats = sweeper.sweep_once(now).await;
    assert_eq!(stats.trials_expired, 1);
    assert_eq!(stats.failed, 0);

    let user = fetch_user(&db, 1).await;
    assert_eq!(user.tier, Tier::Free);
    assert!(user.trial_notified);
    assert!(user.premium_expires_at.is_none());
    assert_eq!(notifier.sent_to(1), vec![Notice::TrialExpired]);

    // A second sweep is a no-op: no new writes, no second notice.
    let stats = sweeper.sweep_once(now + Duration::hours(1)).await;
    assert_eq!(stats.total(), 0);
    assert_eq!(notifier.sent_to(1).len(), 1);
}

#[tokio::test]
async fn active_trial_is_left_alone() {
    let db = test_db().await;
    let ledger = ledger(&db);
    let notifier = Arc::new(RecordingNotifier::default());
    let sweeper = sweeper(&db, notifier.clone());

    register_user(&db, 1).await;
    ledger.start_trial(1).await.unwrap();

    let stats = sweeper.sweep_once(Utc::now()).await;
    assert_eq!(stats.total(), 0);
    let user = fetch_user(&db, 1).await;
    assert_eq!(user.tier, Tier::Trial);
    assert!(!user.trial_notified);
    assert_eq!(notifier.total(), 0);
}

#[tokio::test]
async fn failed_trial_notice_is_retried_next_sweep() {
    let db = test_db().await;
    let ledger = ledger(&db);
    let notifier = Arc::new(RecordingNotifier::default());
    let sweeper = sweeper(&db, notifier.clone());

    register_user(&db, 1).await;
    ledger.start_trial(1).await.unwrap();
    backdate_trial(&db, 1, TRIAL_DAYS + 1).await;

    // Delivery fails: the downgrade sticks, the flag stays unset.
    notifier.set_fail(true);
    let stats = sweeper.sweep_once(Utc::now()).await;
    assert_eq!(stats.failed, 1);
    let user = fetch_user(&db, 1).await;
    assert_eq!(user.tier, Tier::Free);
    assert!(!user.trial_notified);

    // Next sweep retries the notice, exactly once.
    notifier.set_fail(false);
    let stats = sweeper.sweep_once(Utc::now()).await;
    assert_eq!(stats.trials_expired, 1);
    assert!(fetch_user(&db, 1).await.trial_notified);
    assert_eq!(notifier.sent_to(1), vec![Notice::TrialExpired]);
}

#[tokio::test]
async fn grant_racing_the_sweep_wins() {
    let db = test_db().await;
    let ledger = ledger(&db);
    let notifier = Arc::new(RecordingNotifier::default());
    let sweeper = sweeper(&db, notifier.clone());

    register_user(&db, 1).await;
    ledger.start_trial(1).await.unwrap();
    backdate_trial(&db, 1, TRIAL_DAYS + 1).await;

    // A premium grant lands before the sweep looks at the user.
    ledger
        .grant_premium(1, 30, "evt-1", 77000, "payment")
        .await
        .unwrap();

    let stats = sweeper.sweep_once(Utc::now()).await;
    assert_eq!(stats.total(), 0);
    let state = ledger.get_state(1).await.unwrap();
    assert_eq!(state.tier, Tier::Premium);
    assert_eq!(notifier.total(), 0);
}

#[tokio::test]
async fn expired_premium_downgrades_and_notifies_once() {
    let db = test_db().await;
    let ledger = ledger(&db);
    let notifier = Arc::new(RecordingNotifier::default());
    let sweeper = sweeper(&db, notifier.clone());

    register_user(&db, 1).await;
    ledger.start_trial(1).await.unwrap();
    backdate_trial(&db, 1, TRIAL_DAYS + 10).await;
    sweeper.sweep_once(Utc::now()).await; // settle the trial expiry

    ledger
        .grant_premium(1, 30, "evt-1", 77000, "payment")
        .await
        .unwrap();
    set_premium_until(&db, 1, Some(Utc::now() - Duration::hours(1))).await;

    let stats = sweeper.sweep_once(Utc::now()).await;
    assert_eq!(stats.premiums_expired, 1);

    let user = fetch_user(&db, 1).await;
    assert_eq!(user.tier, Tier::Free);
    assert!(user.premium_expires_at.is_none());
    assert!(user.premium_expired_notified);
    assert_eq!(
        notifier.sent_to(1).last(),
        Some(&Notice::PremiumExpired),
    );

    let before = notifier.total();
    let stats = sweeper.sweep_once(Utc::now()).await;
    assert_eq!(stats.total(), 0);
    assert_eq!(notifier.total(), before);
}

#[tokio::test]
async fn regrant_rearms_the_expiry_notice() {
    let db = test_db().await;
    let ledger = ledger(&db);
    let notifier = Arc::new(RecordingNotifier::default());
    let sweeper = sweeper(&db, notifier.clone());

    register_user(&db, 1).await;
    ledger
        .grant_premium(1, 30, "evt-1", 77000, "payment")
        .await
        .unwrap();
    set_premium_until(&db, 1, Some(Utc::now() - Duration::hours(1))).await;
    sweeper.sweep_once(Utc::now()).await;
    assert_eq!(notifier.sent_to(1), vec![Notice::PremiumExpired]);

    // A renewal clears the flag, so a future expiry notifies again.
    ledger
        .grant_premium(1, 30, "evt-2", 77000, "payment")
        .await
        .unwrap();
    assert!(!fetch_user(&db, 1).await.premium_expired_notified);

    set_premium_until(&db, 1, Some(Utc::now() - Duration::hours(1))).await;
    sweeper.sweep_once(Utc::now()).await;
    assert_eq!(
        notifier.sent_to(1),
        vec![Notice::PremiumExpired, Notice::PremiumExpired],
    );
}

#[tokio::test]
async fn crashed_premium_sweep_retries_the_notice() {
    let db = test_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let sweeper = sweeper(&db, notifier.clone());

    // A prior sweep downgraded (expiry cleared) but died before the flag
    // write: the NULL arm of the scan must pick the record up again.
    register_user(&db, 1).await;
    sqlx::query(
        "UPDATE users SET tier = 'free', premium_expires_at = NULL, \
         premium_expired_notified = 0 WHERE id = 1",
    )
    .execute(&db.pool)
    .await
    .unwrap();

    let stats = sweeper.sweep_once(Utc::now()).await;
    assert_eq!(stats.premiums_expired, 1);
    assert_eq!(notifier.sent_to(1), vec![Notice::PremiumExpired]);
    assert!(fetch_user(&db, 1).await.premium_expired_notified);
}

#[tokio::test]
async fn sweep_covers_more_users_than_one_page() {
    let db = test_db().await;
    let ledger = ledger(&db);
    let notifier = Arc::new(RecordingNotifier::default());
    let sweeper = sweeper(&db, notifier.clone());

    // More candidates than SWEEP_PAGE_SIZE (200) to exercise paging.
    for user_id in 1..=250 {
        register_user(&db, user_id).await;
        ledger.start_trial(user_id).await.unwrap();
        backdate_trial(&db, user_id, TRIAL_DAYS + 1).await;
    }

    let stats = sweeper.sweep_once(Utc::now()).await;
    assert_eq!(stats.trials_expired, 250);
    assert_eq!(notifier.total(), 250);
}
