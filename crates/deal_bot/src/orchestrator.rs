use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use job_scheduler::{ConflictPolicy, Scheduler, SchedulerError};
use marketplace_api::{
    ApiError, CaptchaListener, Endpoint, Favorite, Item, ItemId, Reservation, ReservationService,
};
use notification_services::{Notifier, Priority};
use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{Level, debug, error, info, trace, warn};

use crate::{
    BotState, BotTimings, ChangeDetector, Decision, HeldGuard, ItemLists, TimestampRounding,
    snapshot_diff,
};

/// Id of the recurring favorites scan.
pub const CHECK_FAVORITES_JOB: &str = "check-favorites";

/// Id of the job that renews `reservation_id`.
pub fn catch_job_id(reservation_id: &str) -> String {
    format!("catch-reservation-{reservation_id}")
}

/// Id of the job that snipes `item_id` at its restock instant.
pub fn snipe_job_id(item_id: ItemId) -> String {
    format!("snipe-item-{item_id}")
}

/// Id of the job that clears the snipe registry entry of `item_id`.
pub fn snipe_cooldown_job_id(item_id: ItemId) -> String {
    format!("del-scheduled-snipe-{item_id}")
}

/// Errors surfaced by bot workflows.
#[derive(Debug, thiserror::Error)]
pub enum BotError {
    /// A marketplace call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A job could not be registered or cancelled.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// The scheduler was stopped by something other than an interrupt.
    #[error("Scheduler stopped")]
    Halted,
}

fn log_at(level: Level, message: &str) {
    if level == Level::ERROR {
        error!("{}", message);
    } else if level == Level::WARN {
        warn!("{}", message);
    } else if level == Level::INFO {
        info!("{}", message);
    } else if level == Level::DEBUG {
        debug!("{}", message);
    } else {
        trace!("{}", message);
    }
}

/// Watches favorites and runs the hold, catch, order and snipe workflows.
pub struct Bot {
    service: Arc<ReservationService>,
    scheduler: Scheduler,
    notifier: Arc<dyn Notifier>,
    detector: ChangeDetector,
    state: BotState,
    timings: BotTimings,
}

impl Bot {
    /// Creates a bot tracking the ids listed in `lists` from the start.
    pub fn new(
        service: Arc<ReservationService>,
        scheduler: Scheduler,
        notifier: Arc<dyn Notifier>,
        lists: Arc<ItemLists>,
        timings: BotTimings,
        rounding: TimestampRounding,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            scheduler,
            notifier,
            state: BotState::with_tracked(lists.initially_tracked()),
            detector: ChangeDetector::new(lists, rounding),
            timings,
        })
    }

    /// Tracked, held and snipe registries.
    pub fn state(&self) -> &BotState {
        &self.state
    }

    /// The job scheduler driving the workflows.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The marketplace operations.
    pub fn service(&self) -> &ReservationService {
        &self.service
    }

    async fn notify(&self, message: &str, tag: &str) {
        if let Err(e) = self
            .notifier
            .publish(message, Priority::Default, tag)
            .await
        {
            error!("Failed to publish {:?}: {}", message, e);
        }
    }

    async fn untrack(&self, item_id: ItemId) {
        warn!("Untracking item {}", item_id);
        if let Err(e) = self.service.unfavorite(item_id).await {
            error!("Item {}: Failed to unfavorite: {}", item_id, e);
        }
        self.state.untrack(item_id);
    }

    /// Logs a refused reservation at warn and anything else at error.
    async fn reservation_failed(&self, item_id: ItemId, error: &ApiError) {
        let level = if error.is_reservation_error() {
            Level::WARN
        } else {
            Level::ERROR
        };
        log_at(level, &format!("Item {}: {}", item_id, error));
        if error.should_untrack() {
            self.untrack(item_id).await;
        }
    }

    /// Reserves `quantity` units and keeps the reservation alive.
    ///
    /// On success the reservation is recorded, announced, and a catch job is armed one
    /// catch delay after it expires. Reservation errors are logged and swallowed; only
    /// [`ApiError::LimitExceeded`] also untracks the item.
    pub async fn hold(self: &Arc<Self>, item: &Item, quantity: u32) -> Option<Reservation> {
        let reservation = match self.service.reserve(item.id(), quantity).await {
            Ok(reservation) => reservation,
            Err(e) => {
                self.reservation_failed(item.id(), &e).await;
                return None;
            }
        };

        info!("Held {}", reservation);
        self.notify(
            &format!("Held: {}x {}", reservation.quantity, item.snapshot.name),
            "hourglass_flowing_sand",
        )
        .await;
        self.state.push_held(reservation.clone());
        self.schedule_catch(&reservation);
        Some(reservation)
    }

    fn schedule_catch(self: &Arc<Self>, reservation: &Reservation) {
        let bot = Arc::clone(self);
        let held = reservation.clone();
        let at = reservation.expires_at() + self.timings.catch_delay;

        let scheduled = self.scheduler.add_once(
            catch_job_id(&reservation.id),
            at,
            ConflictPolicy::Exception,
            move || async move {
                bot.catch(held).await;
            },
        );
        match scheduled {
            Ok(id) => debug!("Scheduled {} at {}", id, at),
            Err(e) => error!("Item {}: {}", reservation.item_id, e),
        }
    }

    /// Re-reserves the quantity of `held` before the server releases it.
    ///
    /// `held` leaves the held set whatever the outcome. A new reservation is recorded
    /// and gets its own catch job.
    pub fn catch(self: Arc<Self>, held: Reservation) -> BoxFuture<'static, Option<Reservation>> {
        Box::pin(async move {
            let _superseded = HeldGuard::new(&self.state, &held);

            match self.service.reserve(held.item_id, held.quantity).await {
                Ok(reservation) => {
                    info!("Caught {}", reservation);
                    self.state.push_held(reservation.clone());
                    self.schedule_catch(&reservation);
                    Some(reservation)
                }
                Err(e) => {
                    if matches!(e, ApiError::SaleClosed) {
                        warn!("Item {}: {}", held.item_id, e);
                    } else {
                        error!("Item {}: {}", held.item_id, e);
                    }
                    if e.should_untrack() {
                        self.untrack(held.item_id).await;
                    }
                    None
                }
            }
        })
    }

    /// Reserves and pays for `quantity` units, returning the order.
    ///
    /// A failed payment aborts the reservation and falls back to [`Bot::hold`].
    pub async fn order(self: &Arc<Self>, item: &Item, quantity: u32) -> Option<Value> {
        let reservation = match self.service.reserve(item.id(), quantity).await {
            Ok(reservation) => reservation,
            Err(e) => {
                self.reservation_failed(item.id(), &e).await;
                return None;
            }
        };
        debug!("Reserved {}", reservation);

        match self.service.pay(&reservation, None).await {
            Ok(_) => {}
            Err(e @ ApiError::Payment(_)) => {
                warn!("Item {}: {}", item.id(), e);
                if let Err(e) = self.service.abort_reservation(&reservation.id).await {
                    error!("Reservation {}: {}", reservation.id, e);
                }
                self.hold(item, quantity).await;
                return None;
            }
            Err(e) => {
                error!("Item {}: {}", item.id(), e);
                return None;
            }
        }

        let order = match self.service.get_order(&reservation.id).await {
            Ok(mut data) => data.get_mut("order").map(Value::take).unwrap_or(data),
            Err(e) => {
                error!("Order {}: {}", reservation.id, e);
                return None;
            }
        };
        info!("Ordered {}", order);
        let quantity = order
            .get("quantity")
            .and_then(Value::as_u64)
            .unwrap_or(u64::from(reservation.quantity));
        self.notify(
            &format!("Ordered: {}x {}", quantity, item.snapshot.name),
            "shopping_cart",
        )
        .await;
        Some(order)
    }

    fn schedule_snipe_cooldown(
        self: &Arc<Self>,
        item_id: ItemId,
        policy: ConflictPolicy,
    ) -> Result<String, SchedulerError> {
        let bot = Arc::clone(self);
        self.scheduler.add_once(
            snipe_cooldown_job_id(item_id),
            Utc::now() + self.timings.flapping_cooldown,
            policy,
            move || async move {
                bot.state.remove_scheduled_snipe(item_id);
                debug!("Item {}: Snipe registry cleared", item_id);
            },
        )
    }

    /// Polls an item around its restock instant and holds it as soon as it sells.
    ///
    /// The snipe registry entry is cleared one cooldown after the snipe starts.
    pub async fn snipe(self: &Arc<Self>, item_id: ItemId) -> Result<Option<Reservation>, BotError> {
        info!("Sniping item {}...", item_id);
        self.scheduler
            .cancel(&snipe_cooldown_job_id(item_id), ConflictPolicy::DoNothing)?;
        self.schedule_snipe_cooldown(item_id, ConflictPolicy::Exception)?;

        let attempts = self.timings.snipe_max_attempts;
        for attempt in 1..=attempts {
            let item = self.service.get_item(item_id).await?;
            let changed = item.num_available() > 0 || !item.snapshot.is_check_again_later();
            if changed {
                info!("Snipe attempt {}: {}", attempt, item);
            }

            if item.num_available() > 0 && item.snapshot.in_sales_window {
                if let Some(reservation) = self.hold(&item, item.max_quantity()).await {
                    if attempt == attempts {
                        warn!("Snipe succeeded on final ({}th) attempt", attempts);
                    }
                    return Ok(Some(reservation));
                }
            }

            if changed {
                warn!("Unexpected: {}", item);
                return Ok(None);
            }
        }

        warn!("Item {}: Unchanged after {} snipe attempts", item_id, attempts);
        Ok(None)
    }

    fn log_decision(&self, decision: &Decision, fave: &Favorite) {
        match decision {
            Decision::Unchanged => {}
            Decision::Suppressed(flap) => trace!("Item {}: Ignoring {:?}", fave.id, flap),
            Decision::FirstSighting {
                level: Some(level),
                inactive,
            } => {
                let label = if *inactive { "Inactive" } else { "Unknown" };
                log_at(*level, &format!("{label}: {fave}"));
            }
            Decision::Observed {
                level: Some(level), ..
            } => log_at(*level, &fave.to_string()),
            Decision::FirstSighting { level: None, .. } | Decision::Observed { level: None, .. } => {}
            Decision::Changed { level, diff, .. } => {
                log_at(*level, &format!("Changed: {} ({})", fave.name, diff));
            }
        }
    }

    /// Runs one favorite through the change detector and reacts to it.
    /// Failures are logged with the item id.
    pub async fn process_favorite(self: Arc<Self>, fave: Favorite) {
        if let Err(e) = self.react(&fave).await {
            error!("Item {}: {}", fave.id, e);
        }
    }

    async fn react(self: &Arc<Self>, fave: &Favorite) -> Result<(), BotError> {
        let decision = {
            let tracked = self.state.tracking(fave.id);
            let held = self.state.held(fave.id);
            self.detector.evaluate(tracked.as_tracking(), fave, &held)
        };
        if decision.stores_snapshot() {
            self.state.track(fave.clone());
        }
        self.log_decision(&decision, fave);
        if !decision.reacts() {
            return Ok(());
        }

        let mut item = None;
        if fave.num_available > 0 && fave.in_sales_window {
            let detail = self.service.get_item(fave.id).await?;
            if detail.num_available() != fave.num_available {
                warn!("Updated: {} ({})", fave.name, snapshot_diff(fave, &detail.snapshot));
            }
            if detail.num_available() > 0 {
                self.hold(&detail, detail.max_quantity()).await;
            }
            item = Some(detail);
        }

        let armed = self.state.scheduled_snipe(fave.id);
        if !fave.is_check_again_later() && armed == Some(None) {
            self.schedule_snipe_cooldown(fave.id, ConflictPolicy::DoNothing)?;
        } else if fave.is_check_again_later() && armed.is_none() {
            let item = match item {
                Some(item) => item,
                None => self.service.get_item(fave.id).await?,
            };
            self.arm_snipe(&item);
        }
        Ok(())
    }

    fn arm_snipe(self: &Arc<Self>, item: &Item) {
        let item_id = item.id();
        match item.next_drop() {
            Some(at) => {
                let bot = Arc::clone(self);
                let armed = self.scheduler.add_once(
                    snipe_job_id(item_id),
                    at,
                    ConflictPolicy::Exception,
                    move || async move {
                        if let Err(e) = bot.snipe(item_id).await {
                            error!("Item {}: {}", item_id, e);
                        }
                    },
                );
                match armed {
                    Ok(_) => info!("Item {}: Snipe scheduled at {}", item_id, at),
                    Err(e) => error!("Item {}: {}", item_id, e),
                }
            }
            None => debug!("Item {}: No upcoming drop", item_id),
        }
        self.state.set_scheduled_snipe(item_id, item.next_drop());
    }

    /// Scans every favorite, processing them concurrently.
    ///
    /// A failing favorites fetch is logged; items already fetched are still processed.
    pub async fn check_favorites(self: &Arc<Self>) {
        let mut tasks = JoinSet::new();
        let mut favorites = pin!(self.service.favorites());

        while let Some(next) = favorites.next().await {
            match next {
                Ok(fave) => {
                    tasks.spawn(Arc::clone(self).process_favorite(fave));
                }
                Err(e) => {
                    error!("Failed to fetch favorites: {}", e);
                    break;
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Favorite task failed: {}", e);
            }
        }
    }

    /// Scans favorites on a fixed period until interrupted or halted.
    ///
    /// Returns [`BotError::Halted`] when the scheduler stops without an interrupt.
    pub async fn run(self: &Arc<Self>) -> Result<(), BotError> {
        let bot = Arc::clone(self);
        self.scheduler.add_recurring(
            CHECK_FAVORITES_JOB,
            self.timings.check_favorites_interval,
            ConflictPolicy::Exception,
            move || {
                let bot = Arc::clone(&bot);
                async move { bot.check_favorites().await }
            },
        )?;
        info!(
            "Checking {} tracked favorites every {:?}",
            self.state.tracked_ids().len(),
            self.timings.check_favorites_interval
        );

        if self.wait_for_shutdown().await {
            Ok(())
        } else {
            Err(BotError::Halted)
        }
    }

    /// Waits for an interrupt or a scheduler stop, then stops the scheduler.
    /// Returns whether an interrupt ended the wait.
    pub async fn wait_for_shutdown(&self) -> bool {
        let interrupted = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for interrupt: {}", e);
                }
                debug!("Shutting down");
                true
            }
            _ = self.scheduler.run_until_stopped() => false,
        };
        self.scheduler.stop();
        interrupted
    }
}

/// Stops all scheduling and alerts the operator on a bot-detection challenge.
pub struct CaptchaHalt {
    scheduler: Scheduler,
    notifier: Arc<dyn Notifier>,
}

impl CaptchaHalt {
    /// Creates a listener stopping `scheduler`.
    pub fn new(scheduler: Scheduler, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            scheduler,
            notifier,
        }
    }
}

#[async_trait]
impl CaptchaListener for CaptchaHalt {
    async fn on_captcha(&self, endpoint: Endpoint) {
        error!("Captcha challenge on {}, stopping scheduler", endpoint);
        // Stopping aborts the job this may run in, so alert first
        if let Err(e) = self
            .notifier
            .publish("DataDome CAPTCHA", Priority::High, "rotating_light")
            .await
        {
            error!("Failed to publish captcha alert: {}", e);
        }
        self.scheduler.stop();
    }
}
