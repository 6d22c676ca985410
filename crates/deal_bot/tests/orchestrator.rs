use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use deal_bot::*;
use job_scheduler::{ConflictPolicy, Scheduler, SchedulerError, Trigger};
use marketplace_api::{
    ApiError, CAPTCHA_HEADER, CredentialProvider, Credentials, Favorite, Item, PipelineConfig,
    Price, RequestPipeline, Reservation, ReservationService, SearchArea, Tag,
};
use notification_services::{MockNotifier, Notifier, NtfyClient};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct FixedCredentials;

#[async_trait]
impl CredentialProvider for FixedCredentials {
    fn current(&self) -> Credentials {
        Credentials {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
        }
    }

    fn needs_refresh(&self) -> bool {
        false
    }

    async fn refresh(&self) -> Result<Credentials, ApiError> {
        Ok(self.current())
    }
}

struct Harness {
    server: MockServer,
    notifier: Arc<MockNotifier>,
    bot: Arc<Bot>,
}

async fn harness(lists: ItemLists) -> Harness {
    let server = MockServer::start().await;
    let config = PipelineConfig {
        base_url: format!("{}/", server.uri()),
        retry_delay: Duration::from_millis(10),
        ..PipelineConfig::default()
    };
    let pipeline = Arc::new(RequestPipeline::new(config, Arc::new(FixedCredentials)).unwrap());
    let notifier = Arc::new(MockNotifier::new());
    let service = Arc::new(ReservationService::new(
        pipeline,
        notifier.clone(),
        SearchArea::default(),
    ));
    let bot = Bot::new(
        service,
        Scheduler::new(),
        notifier.clone(),
        Arc::new(lists),
        BotTimings::default(),
        TimestampRounding::default(),
    );
    Harness {
        server,
        notifier,
        bot,
    }
}

async fn mount(server: &MockServer, route: &str, body: Value) {
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

fn listing(id: u64, available: u32, tag: &str) -> Value {
    json!({
        "item": {"item_id": id.to_string(), "name": ""},
        "store": {"store_name": "Bakery"},
        "item_tags": [{"id": tag}],
        "items_available": available,
        "in_sales_window": available > 0,
    })
}

fn reserved(id: &str, item_id: u64, quantity: u32, reserved_at: DateTime<Utc>) -> Value {
    json!({
        "state": "SUCCESS",
        "order": {
            "id": id,
            "item_id": item_id.to_string(),
            "state": "RESERVED",
            "order_line": {
                "quantity": quantity,
                "total_price": {"code": "EUR", "decimals": 2, "minor_units": 399 * quantity},
            },
            "reserved_at": reserved_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        },
    })
}

fn reservation(id: &str, item_id: u64, quantity: u32) -> Reservation {
    Reservation {
        id: id.into(),
        item_id,
        quantity,
        total_price: Price {
            code: "EUR".into(),
            decimals: 2,
            minor_units: 399 * i64::from(quantity),
        },
        reserved_at: Utc::now(),
    }
}

fn in_an_hour() -> DateTime<Utc> {
    let text = (Utc::now() + TimeDelta::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);
    text.parse().unwrap()
}

#[tokio::test]
async fn test_inactive_item_is_held_once_selling_and_flapping_is_ignored() {
    let h = harness(ItemLists {
        inactive: [42].into(),
        ..ItemLists::default()
    })
    .await;
    mount(&h.server, "/item/v8/42", listing(42, 3, "X_ITEMS_LEFT")).await;
    mount(&h.server, "/order/v8/create/42", reserved("r-1", 42, 3, Utc::now())).await;

    // Unseen and inactive: tracked without any request
    let quiet = Favorite::new(42, "Bakery (Surprise Bag)");
    h.bot.clone().process_favorite(quiet.clone()).await;
    assert_eq!(h.bot.state().tracking(42), TrackedEntry::Observed(quiet.clone()));
    assert_eq!(request_count(&h.server).await, 0);

    // Selling: held, announced, and a catch job armed one second after expiry
    let selling = Favorite {
        tag: Tag::XItemsLeft,
        num_available: 3,
        in_sales_window: true,
        ..quiet
    };
    h.bot.clone().process_favorite(selling.clone()).await;

    let held = h.bot.state().held(42);
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].id, "r-1");
    assert_eq!(held[0].quantity, 3);
    assert_eq!(
        h.bot.scheduler().trigger(&catch_job_id("r-1")),
        Some(Trigger::Once(held[0].expires_at() + TimeDelta::seconds(1)))
    );
    let published = h.notifier.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].message, "Held: 3x Bakery (Surprise Bag)");
    assert_eq!(published[0].tag, "hourglass_flowing_sand");
    assert_eq!(request_count(&h.server).await, 2);

    // Sold out with a sold-out time older than our reservation: replay noise
    let flapped = Favorite {
        tag: Tag::SoldOut,
        in_sales_window: false,
        sold_out_at: Some(held[0].reserved_at - TimeDelta::seconds(30)),
        ..selling.clone()
    };
    h.bot.clone().process_favorite(flapped).await;
    assert_eq!(h.bot.state().tracking(42), TrackedEntry::Observed(selling));
    assert_eq!(h.bot.state().held(42).len(), 1);
    assert_eq!(request_count(&h.server).await, 2);
}

#[tokio::test]
async fn test_ignored_item_is_tracked_but_never_held() {
    let h = harness(ItemLists {
        ignored: [5].into(),
        ..ItemLists::default()
    })
    .await;
    assert_eq!(h.bot.state().tracking(5), TrackedEntry::Unobserved);

    let selling = Favorite {
        tag: Tag::XItemsLeft,
        num_available: 2,
        in_sales_window: true,
        ..Favorite::new(5, "Bakery (Surprise Bag)")
    };
    h.bot.clone().process_favorite(selling.clone()).await;

    assert_eq!(h.bot.state().tracking(5), TrackedEntry::Observed(selling));
    assert_eq!(request_count(&h.server).await, 0);
}

#[tokio::test]
async fn test_limit_exceeded_untracks_item() {
    let h = harness(ItemLists {
        tracked: [42].into(),
        ..ItemLists::default()
    })
    .await;
    mount(&h.server, "/order/v8/create/42", json!({"state": "OVER_USER_WINDOW_LIMIT"})).await;
    let mut limited = listing(42, 3, "X_ITEMS_LEFT");
    limited["user_purchase_limit"] = json!(1);
    mount(&h.server, "/item/v8/42", limited).await;
    Mock::given(method("POST"))
        .and(path("/user/favorite/v1/42/update"))
        .and(body_partial_json(json!({"is_favorite": false})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&h.server)
        .await;

    let item = Item::from_json(listing(42, 3, "X_ITEMS_LEFT")).unwrap();
    assert_eq!(h.bot.hold(&item, 3).await, None);

    assert_eq!(h.bot.state().tracking(42), TrackedEntry::Untracked);
    assert!(h.bot.state().held(42).is_empty());
    assert!(h.notifier.published().is_empty());
}

#[tokio::test]
async fn test_catch_replaces_held_reservation() {
    let h = harness(ItemLists::default()).await;
    mount(&h.server, "/order/v8/create/42", reserved("r-2", 42, 2, Utc::now())).await;
    let held = reservation("r-1", 42, 2);
    h.bot.state().push_held(held.clone());

    let caught = h.bot.clone().catch(held).await.unwrap();

    assert_eq!(caught.id, "r-2");
    assert_eq!(h.bot.state().held(42), vec![caught.clone()]);
    assert_eq!(
        h.bot.scheduler().trigger(&catch_job_id("r-2")),
        Some(Trigger::Once(caught.expires_at() + TimeDelta::seconds(1)))
    );
}

#[tokio::test]
async fn test_failed_catch_still_drops_held_reservation() {
    let h = harness(ItemLists::default()).await;
    mount(&h.server, "/order/v8/create/42", json!({"state": "SALE_CLOSED"})).await;
    let held = reservation("r-1", 42, 2);
    h.bot.state().push_held(held.clone());

    assert_eq!(h.bot.clone().catch(held).await, None);
    assert!(h.bot.state().held(42).is_empty());
    assert!(h.bot.scheduler().job_ids().is_empty());
}

#[tokio::test]
async fn test_order_falls_back_to_hold_when_payment_fails() {
    let h = harness(ItemLists::default()).await;
    Mock::given(method("POST"))
        .and(path("/order/v8/create/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(reserved("r-1", 42, 1, Utc::now())))
        .expect(2)
        .mount(&h.server)
        .await;
    mount(&h.server, "/voucher/v4/active", json!({"vouchers": []})).await;
    Mock::given(method("POST"))
        .and(path("/order/v8/r-1/abort"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "SUCCESS"})))
        .expect(1)
        .mount(&h.server)
        .await;

    let item = Item::from_json(listing(42, 1, "X_ITEMS_LEFT")).unwrap();
    assert_eq!(h.bot.order(&item, 1).await, None);

    assert_eq!(h.bot.state().held(42).len(), 1);
    assert!(h.bot.scheduler().contains(&catch_job_id("r-1")));
}

#[tokio::test]
async fn test_snipe_is_armed_once_per_item() {
    let h = harness(ItemLists::default()).await;
    let drop = in_an_hour();
    let mut later = listing(7, 0, "CHECK_AGAIN_LATER");
    later["next_sales_window_purchase_start"] = json!(drop.to_rfc3339());
    mount(&h.server, "/item/v8/7", later).await;

    let waiting = Favorite {
        tag: Tag::CheckAgainLater,
        ..Favorite::new(7, "Bakery (Surprise Bag)")
    };
    h.bot.clone().process_favorite(waiting.clone()).await;

    assert_eq!(
        h.bot.scheduler().trigger(&snipe_job_id(7)),
        Some(Trigger::Once(drop))
    );
    assert_eq!(h.bot.state().scheduled_snipe(7), Some(Some(drop)));

    // A stale registry must not let a second snipe overwrite the first
    h.bot.state().remove_scheduled_snipe(7);
    let renamed = Favorite {
        name: "Bakery - Centre (Surprise Bag)".into(),
        ..waiting
    };
    h.bot.clone().process_favorite(renamed).await;

    assert_eq!(h.bot.scheduler().job_ids(), vec![snipe_job_id(7)]);
    assert_eq!(
        h.bot.scheduler().add_once(snipe_job_id(7), drop, ConflictPolicy::Exception, || async {}),
        Err(SchedulerError::ConflictingId(snipe_job_id(7)))
    );
}

#[tokio::test]
async fn test_snipe_holds_restocked_item() {
    let h = harness(ItemLists::default()).await;
    mount(&h.server, "/item/v8/9", listing(9, 2, "X_ITEMS_LEFT")).await;
    mount(&h.server, "/order/v8/create/9", reserved("r-9", 9, 2, Utc::now())).await;

    let held = h.bot.snipe(9).await.unwrap().unwrap();

    assert_eq!(held.quantity, 2);
    assert!(h.bot.scheduler().contains(&snipe_cooldown_job_id(9)));
    assert!(h.bot.scheduler().contains(&catch_job_id("r-9")));
}

#[tokio::test]
async fn test_snipe_gives_up_when_unchanged() {
    let h = harness(ItemLists::default()).await;
    Mock::given(method("POST"))
        .and(path("/item/v8/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(9, 0, "CHECK_AGAIN_LATER")))
        .expect(6)
        .mount(&h.server)
        .await;

    assert_eq!(h.bot.snipe(9).await.unwrap(), None);
    assert!(h.bot.state().held(9).is_empty());
}

#[tokio::test]
async fn test_check_favorites_tracks_every_favorite() {
    let h = harness(ItemLists::default()).await;
    mount(
        &h.server,
        "/discover/v1/bucket",
        json!({"mobile_bucket": {"items": [
            listing(1, 0, "SOLD_OUT"),
            listing(2, 0, "NOTHING_TO_SAVE_TODAY"),
        ]}}),
    )
    .await;

    h.bot.check_favorites().await;

    assert_eq!(h.bot.state().tracked_ids(), vec![1, 2]);
    assert!(matches!(
        h.bot.state().tracking(1),
        TrackedEntry::Observed(Favorite {
            tag: Tag::SoldOut,
            ..
        })
    ));
}

#[tokio::test]
async fn test_check_favorites_survives_server_errors() {
    let h = harness(ItemLists::default()).await;
    Mock::given(method("POST"))
        .and(path("/discover/v1/bucket"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&h.server)
        .await;

    h.bot.check_favorites().await;
    assert!(h.bot.state().tracked_ids().is_empty());
}

#[tokio::test]
async fn test_change_after_empty_snipe_arms_cooldown_once() {
    let h = harness(ItemLists::default()).await;
    mount(&h.server, "/item/v8/7", listing(7, 0, "CHECK_AGAIN_LATER")).await;

    let waiting = Favorite {
        tag: Tag::CheckAgainLater,
        ..Favorite::new(7, "Bakery (Surprise Bag)")
    };
    h.bot.clone().process_favorite(waiting.clone()).await;
    assert_eq!(h.bot.state().scheduled_snipe(7), Some(None));
    assert!(h.bot.scheduler().job_ids().is_empty());

    let sold_out = Favorite {
        tag: Tag::SoldOut,
        ..waiting
    };
    h.bot.clone().process_favorite(sold_out.clone()).await;
    let armed = h.bot.scheduler().trigger(&snipe_cooldown_job_id(7));
    assert!(matches!(armed, Some(Trigger::Once(_))));

    // Later changes leave the pending cooldown alone
    let renamed = Favorite {
        name: "Bakery - Centre (Surprise Bag)".into(),
        ..sold_out
    };
    h.bot.clone().process_favorite(renamed).await;
    assert_eq!(h.bot.scheduler().trigger(&snipe_cooldown_job_id(7)), armed);
    assert_eq!(h.bot.state().scheduled_snipe(7), Some(None));
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_clears_snipe_registry() {
    // Nothing below reaches the network
    let config = PipelineConfig {
        base_url: "http://127.0.0.1:9/".into(),
        ..PipelineConfig::default()
    };
    let pipeline = Arc::new(RequestPipeline::new(config, Arc::new(FixedCredentials)).unwrap());
    let notifier = Arc::new(MockNotifier::new());
    let service = Arc::new(ReservationService::new(
        pipeline,
        notifier.clone(),
        SearchArea::default(),
    ));
    let bot = Bot::new(
        service,
        Scheduler::new(),
        notifier,
        Arc::new(ItemLists::default()),
        BotTimings {
            flapping_cooldown: TimeDelta::seconds(5),
            ..BotTimings::default()
        },
        TimestampRounding::default(),
    );

    bot.state().set_scheduled_snipe(5, None);
    let sold_out = Favorite {
        tag: Tag::SoldOut,
        ..Favorite::new(5, "Bakery (Surprise Bag)")
    };
    bot.clone().process_favorite(sold_out).await;
    assert!(bot.scheduler().contains(&snipe_cooldown_job_id(5)));

    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(bot.state().scheduled_snipe(5), None);
    assert!(!bot.scheduler().contains(&snipe_cooldown_job_id(5)));
}

#[tokio::test]
async fn test_snipe_stops_at_first_unexpected_state() {
    let h = harness(ItemLists::default()).await;
    Mock::given(method("POST"))
        .and(path("/item/v8/9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing(9, 0, "SOLD_OUT")))
        .expect(1)
        .mount(&h.server)
        .await;

    assert_eq!(h.bot.snipe(9).await.unwrap(), None);
    assert!(h.bot.state().held(9).is_empty());
    assert!(h.bot.scheduler().contains(&snipe_cooldown_job_id(9)));
}

#[tokio::test]
async fn test_snipe_rearms_pending_cooldown() {
    let h = harness(ItemLists::default()).await;
    mount(&h.server, "/item/v8/9", listing(9, 0, "SOLD_OUT")).await;
    let far = Utc::now() + TimeDelta::hours(1);
    h.bot
        .scheduler()
        .add_once(snipe_cooldown_job_id(9), far, ConflictPolicy::Exception, || async {})
        .unwrap();

    assert_eq!(h.bot.snipe(9).await.unwrap(), None);

    match h.bot.scheduler().trigger(&snipe_cooldown_job_id(9)) {
        Some(Trigger::Once(at)) => assert!(at < Utc::now() + TimeDelta::minutes(3)),
        other => panic!("cooldown not re-armed: {other:?}"),
    }
}

#[tokio::test]
async fn test_captcha_during_run_alerts_then_halts() {
    let api = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/discover/v1/bucket"))
        .respond_with(ResponseTemplate::new(403).insert_header(CAPTCHA_HEADER, "1"))
        .mount(&api)
        .await;
    let ntfy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/deals"))
        .and(header("X-Priority", "4"))
        .and(body_string("DataDome CAPTCHA"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&ntfy)
        .await;

    let scheduler = Scheduler::new();
    let notifier: Arc<dyn Notifier> = Arc::new(NtfyClient::new(&ntfy.uri(), "deals").unwrap());
    let config = PipelineConfig {
        base_url: format!("{}/", api.uri()),
        retry_delay: Duration::from_millis(10),
        ..PipelineConfig::default()
    };
    let pipeline = RequestPipeline::new(config, Arc::new(FixedCredentials))
        .unwrap()
        .with_captcha_listener(Arc::new(CaptchaHalt::new(scheduler.clone(), notifier.clone())));
    let service = Arc::new(ReservationService::new(
        Arc::new(pipeline),
        notifier.clone(),
        SearchArea::default(),
    ));
    let bot = Bot::new(
        service,
        scheduler,
        notifier,
        Arc::new(ItemLists::default()),
        BotTimings {
            check_favorites_interval: Duration::from_millis(100),
            ..BotTimings::default()
        },
        TimestampRounding::default(),
    );

    let outcome = tokio::time::timeout(Duration::from_secs(5), bot.run())
        .await
        .unwrap();

    assert!(matches!(outcome, Err(BotError::Halted)));
    assert!(bot.scheduler().is_stopped());
    assert_eq!(ntfy.received_requests().await.unwrap_or_default().len(), 1);
}
