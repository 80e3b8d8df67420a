mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};

use common::*;
use laoshi_bot::db::models::Tier;
use laoshi_bot::notify::Notice;
use laoshi_bot::payments::{PaymentEvent, PaymentProcessor, ProcessOutcome};
use laoshi_bot::subscription::LedgerError;

const PREMIUM_DAYS: i64 = 30;

fn processor(db: &laoshi_bot::db::Database, notifier: Arc<RecordingNotifier>) -> PaymentProcessor {
    PaymentProcessor::new(ledger(db), notifier, PREMIUM_DAYS)
}

fn event(event_id: &str, user_id: i64) -> PaymentEvent {
    PaymentEvent {
        event_id: event_id.to_string(),
        telegram_user_id: user_id,
        product_id: "pq5z".to_string(),
        amount: 77000,
    }
}

/// Referrer 1 invited user 2, who has not paid yet.
async fn link_referral(db: &laoshi_bot::db::Database) {
    register_user(db, 1).await;
    register_user(db, 2).await;
    assert!(db.set_referrer(2, 1).await.unwrap());
    assert!(db.create_referral(1, 2).await.unwrap());
}

#[tokio::test]
async fn payment_grants_premium_and_notifies() {
    let db = test_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let processor = processor(&db, notifier.clone());
    register_user(&db, 2).await;

    let outcome = processor.process(&event("evt-1", 2)).await.unwrap();
    let ProcessOutcome::Granted { expires_at } = outcome else {
        panic!("expected a grant");
    };
    assert!(close_to(expires_at, Utc::now() + Duration::days(PREMIUM_DAYS)));

    let state = ledger(&db).get_state(2).await.unwrap();
    assert_eq!(state.tier, Tier::Premium);
    assert_eq!(
        notifier.sent_to(2),
        vec![Notice::PremiumActivated { until: expires_at }],
    );
}

#[tokio::test]
async fn triple_delivery_grants_user_and_referrer_once() {
    let db = test_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let processor = processor(&db, notifier.clone());
    link_referral(&db).await;

    // The provider redelivers the same event three times.
    let first = processor.process(&event("evt-1", 2)).await.unwrap();
    assert!(matches!(first, ProcessOutcome::Granted { .. }));
    for _ in 0..2 {
        let retry = processor.process(&event("evt-1", 2)).await.unwrap();
        assert_eq!(retry, ProcessOutcome::Duplicate);
    }

    let ledger = ledger(&db);
    let user_state = ledger.get_state(2).await.unwrap();
    assert!(close_to(
        user_state.expires_at.unwrap(),
        Utc::now() + Duration::days(PREMIUM_DAYS),
    ));

    // The referrer's +30-day bonus landed exactly once.
    let referrer_state = ledger.get_state(1).await.unwrap();
    assert_eq!(referrer_state.tier, Tier::Premium);
    assert!(close_to(
        referrer_state.expires_at.unwrap(),
        Utc::now() + Duration::days(REFERRAL_BONUS_DAYS),
    ));
    assert_eq!(
        notifier.sent_to(1),
        vec![Notice::ReferralConverted { bonus_days: REFERRAL_BONUS_DAYS }],
    );

    let referral = db.get_referral_by_referred(2).await.unwrap().unwrap();
    assert_eq!(referral.status, "subscribed");
    assert_eq!(referral.bonus_days_given, REFERRAL_BONUS_DAYS);
}

#[tokio::test]
async fn second_payment_does_not_regrant_referral_bonus() {
    let db = test_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let processor = processor(&db, notifier.clone());
    link_referral(&db).await;

    processor.process(&event("evt-1", 2)).await.unwrap();
    processor.process(&event("evt-2", 2)).await.unwrap();

    let ledger = ledger(&db);
    // The payer stacked two months.
    let user_state = ledger.get_state(2).await.unwrap();
    assert!(close_to(
        user_state.expires_at.unwrap(),
        Utc::now() + Duration::days(2 * PREMIUM_DAYS),
    ));
    // The referrer's bonus stayed at one month.
    let referrer_state = ledger.get_state(1).await.unwrap();
    assert!(close_to(
        referrer_state.expires_at.unwrap(),
        Utc::now() + Duration::days(REFERRAL_BONUS_DAYS),
    ));
    assert_eq!(notifier.sent_to(1).len(), 1);
}

#[tokio::test]
async fn payment_without_referral_grants_only_the_payer() {
    let db = test_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let processor = processor(&db, notifier.clone());
    register_user(&db, 2).await;

    processor.process(&event("evt-1", 2)).await.unwrap();

    assert_eq!(notifier.sent_to(2).len(), 1);
    assert_eq!(notifier.total(), 1);
}

#[tokio::test]
async fn payment_for_unknown_user_is_rejected() {
    let db = test_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let processor = processor(&db, notifier.clone());

    // No ghost records: the grant fails instead of inventing a user.
    let result = processor.process(&event("evt-1", 404)).await;
    assert!(matches!(result, Err(LedgerError::NotFound(404))));
    assert_eq!(notifier.total(), 0);
}

#[tokio::test]
async fn activation_notice_failure_does_not_block_the_grant() {
    let db = test_db().await;
    let notifier = Arc::new(RecordingNotifier::default());
    let processor = processor(&db, notifier.clone());
    register_user(&db, 2).await;

    notifier.set_fail(true);
    let outcome = processor.process(&event("evt-1", 2)).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Granted { .. }));
    assert_eq!(ledger(&db).get_state(2).await.unwrap().tier, Tier::Premium);
}
