use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use futures_util::{Stream, TryStreamExt, stream};
use notification_services::{Notifier, Priority};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::models::decode;
use crate::{
    ApiError, Endpoint, Favorite, Item, ItemId, MultiUseVoucher, Payment, PaymentState,
    RequestPipeline, Reservation, Voucher, split_denominations, voucher_authorizations,
};

/// Most favorites the server returns per page.
pub const FAVORITES_PAGE_SIZE: usize = 50;

/// Where favorites are searched from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchArea {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Search radius in kilometres.
    pub radius_km: f64,
}

impl Default for SearchArea {
    fn default() -> Self {
        Self {
            latitude: 0.0,
            longitude: 0.0,
            radius_km: 30.0,
        }
    }
}

impl SearchArea {
    fn origin(&self) -> Value {
        json!({ "latitude": self.latitude, "longitude": self.longitude })
    }
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    state: String,
}

#[derive(Debug, Deserialize)]
struct PaymentsResponse {
    payments: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct VouchersResponse {
    vouchers: Vec<Value>,
}

/// Reservation, payment and favorites operations.
pub struct ReservationService {
    pipeline: Arc<RequestPipeline>,
    notifier: Arc<dyn Notifier>,
    area: SearchArea,
    payment_poll_interval: Duration,
}

impl ReservationService {
    /// Creates a service over `pipeline`, searching around `area`.
    pub fn new(pipeline: Arc<RequestPipeline>, notifier: Arc<dyn Notifier>, area: SearchArea) -> Self {
        Self {
            pipeline,
            notifier,
            area,
            payment_poll_interval: Duration::from_secs(1),
        }
    }

    /// Overrides how often pending payments are polled.
    pub fn with_payment_poll_interval(mut self, interval: Duration) -> Self {
        self.payment_poll_interval = interval;
        self
    }

    /// Lazily pages through the account's favorites.
    ///
    /// Pages are requested one at a time, and only as the stream is consumed.
    /// Paging stops after the first page shorter than [`FAVORITES_PAGE_SIZE`].
    pub fn favorites(&self) -> impl Stream<Item = Result<Favorite, ApiError>> + Send + '_ {
        stream::try_unfold(Some(0usize), move |page| async move {
            let Some(page) = page else {
                return Ok::<_, ApiError>(None);
            };
            let favorites = self.favorites_page(page).await?;
            let next = (favorites.len() >= FAVORITES_PAGE_SIZE).then_some(page + 1);
            Ok(Some((favorites, next)))
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok::<Favorite, ApiError>)))
        .try_flatten()
    }

    /// Collects every favorite.
    pub async fn get_favorites(&self) -> Result<Vec<Favorite>, ApiError> {
        self.favorites().try_collect().await
    }

    async fn favorites_page(&self, page: usize) -> Result<Vec<Favorite>, ApiError> {
        let data = self
            .pipeline
            .send(
                Endpoint::Favorites,
                &[],
                Some(json!({
                    "origin": self.area.origin(),
                    "radius": self.area.radius_km,
                    "paging": { "page": page, "size": FAVORITES_PAGE_SIZE },
                    "bucket": { "filler_type": "Favorites" },
                    "filters": [],
                })),
            )
            .await?;

        let items = match data.pointer("/mobile_bucket/items") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        items.into_iter().map(Favorite::from_json).collect()
    }

    /// Fetches full detail for one listing.
    pub async fn get_item(&self, item_id: ItemId) -> Result<Item, ApiError> {
        let data = self
            .pipeline
            .send(
                Endpoint::ItemStatus,
                &[&item_id],
                Some(json!({ "origin": self.area.origin() })),
            )
            .await?;
        Item::from_json(data)
    }

    /// Adds the listing to the account's favorites.
    pub async fn favorite(&self, item_id: ItemId) -> Result<(), ApiError> {
        self.set_favorite(item_id, true).await
    }

    /// Removes the listing from the account's favorites.
    pub async fn unfavorite(&self, item_id: ItemId) -> Result<(), ApiError> {
        self.set_favorite(item_id, false).await
    }

    async fn set_favorite(&self, item_id: ItemId, is_favorite: bool) -> Result<(), ApiError> {
        self.pipeline
            .send(
                Endpoint::ItemFavorite,
                &[&item_id],
                Some(json!({ "is_favorite": is_favorite })),
            )
            .await?;
        Ok(())
    }

    /// Reserves `quantity` units.
    ///
    /// When the server reports too little stock, or a quantity over the per-window
    /// limit that the limit itself allows, the item is re-fetched and the reservation
    /// retried once at the largest quantity it permits.
    pub async fn reserve(&self, item_id: ItemId, quantity: u32) -> Result<Reservation, ApiError> {
        match self.reserve_once(item_id, quantity).await? {
            ReserveOutcome::Reserved(reservation) => Ok(reservation),
            ReserveOutcome::Retry { quantity, .. } => {
                match self.reserve_once(item_id, quantity).await? {
                    ReserveOutcome::Reserved(reservation) => Ok(reservation),
                    ReserveOutcome::Retry { exhausted, .. } => Err(exhausted),
                }
            }
        }
    }

    async fn reserve_once(&self, item_id: ItemId, quantity: u32) -> Result<ReserveOutcome, ApiError> {
        let data = self
            .pipeline
            .send(
                Endpoint::OrderCreate,
                &[&item_id],
                Some(json!({ "item_count": quantity })),
            )
            .await?;
        let state = decode::<StateResponse>(data.clone())?.state;

        match state.as_str() {
            "SUCCESS" => {
                let order = data
                    .get("order")
                    .cloned()
                    .ok_or_else(|| ApiError::Decode("reservation without order".to_string()))?;
                Ok(ReserveOutcome::Reserved(Reservation::from_json(order)?))
            }
            "SALE_CLOSED" => Err(ApiError::SaleClosed),
            "SOLD_OUT" => Err(ApiError::SoldOut),
            "USER_BLOCKED" => {
                let item = self.get_item(item_id).await?;
                match item.blocked_until {
                    Some(until) => error!(
                        "Item {}: Reservations blocked for {}",
                        item_id,
                        format_remaining(until - Utc::now())
                    ),
                    None => error!("Item {}: Reservations blocked", item_id),
                }
                Err(ApiError::ReservationBlocked {
                    blocked_until: item.blocked_until,
                })
            }
            "INSUFFICIENT_STOCK" => {
                let item = self.get_item(item_id).await?;
                error!(
                    "Item {}: Insufficient stock for {}, {} available",
                    item_id,
                    quantity,
                    item.num_available()
                );
                match item.max_quantity() {
                    0 => Err(ApiError::SoldOut),
                    corrected => Ok(ReserveOutcome::Retry {
                        quantity: corrected,
                        exhausted: ApiError::UnexpectedResponse(data),
                    }),
                }
            }
            "OVER_USER_WINDOW_LIMIT" => {
                let item = self.get_item(item_id).await?;
                error!(
                    "Item {}: Quantity {} over purchase limit {:?}",
                    item_id, quantity, item.purchase_limit
                );
                match item.purchase_limit {
                    Some(limit) if quantity <= limit && item.max_quantity() > 0 => {
                        Ok(ReserveOutcome::Retry {
                            quantity: item.max_quantity(),
                            exhausted: ApiError::LimitExceeded {
                                requested: item.max_quantity(),
                                limit: Some(limit),
                            },
                        })
                    }
                    limit => Err(ApiError::LimitExceeded {
                        requested: quantity,
                        limit,
                    }),
                }
            }
            _ => Err(ApiError::UnexpectedResponse(data)),
        }
    }

    /// Releases a reservation before payment.
    pub async fn abort_reservation(&self, reservation_id: &str) -> Result<Value, ApiError> {
        let data = self
            .pipeline
            .send(
                Endpoint::OrderAbort,
                &[&reservation_id],
                Some(json!({ "cancel_reason_id": 1 })),
            )
            .await?;

        match decode::<StateResponse>(data.clone())?.state.as_str() {
            "SUCCESS" => Ok(data),
            "ALREADY_ABORTED" => Err(ApiError::AlreadyAborted),
            _ => Err(ApiError::UnexpectedResponse(data)),
        }
    }

    /// Cancels a paid order.
    pub async fn cancel_order(&self, order_id: &str) -> Result<Value, ApiError> {
        let data = self
            .pipeline
            .send(
                Endpoint::OrderCancel,
                &[&order_id],
                Some(json!({ "cancel_reason_id": 1 })),
            )
            .await?;

        match decode::<StateResponse>(data.clone())?.state.as_str() {
            "SUCCESS" => Ok(data),
            "CANCEL_DEADLINE_EXCEEDED" => Err(ApiError::CancelDeadline),
            _ => Err(ApiError::UnexpectedResponse(data)),
        }
    }

    /// Fetches an order.
    pub async fn get_order(&self, order_id: &str) -> Result<Value, ApiError> {
        self.pipeline
            .send(Endpoint::OrderStatus, &[&order_id], None)
            .await
    }

    /// Lists the account's active vouchers.
    pub async fn get_active_vouchers(&self) -> Result<Vec<Voucher>, ApiError> {
        let data = self
            .pipeline
            .send(Endpoint::VouchersActive, &[], None)
            .await?;
        decode::<VouchersResponse>(data)?
            .vouchers
            .into_iter()
            .map(Voucher::from_json)
            .collect()
    }

    /// Fetches one voucher.
    pub async fn get_voucher(&self, voucher_id: u64) -> Result<Voucher, ApiError> {
        let data = self
            .pipeline
            .send(Endpoint::VoucherStatus, &[&voucher_id], None)
            .await?;
        let voucher = data
            .get("voucher")
            .cloned()
            .ok_or_else(|| ApiError::Decode("voucher response without voucher".to_string()))?;
        Voucher::from_json(voucher)
    }

    /// Payment lines of an order.
    pub async fn get_order_payment_status(&self, order_id: &str) -> Result<Vec<Payment>, ApiError> {
        let data = self
            .pipeline
            .send(Endpoint::OrderPaymentStatus, &[&order_id], None)
            .await?;
        parse_payments(data)
    }

    /// Pays a reservation from a multi-use voucher.
    ///
    /// Without an explicit voucher, the voucher with the largest balance in the order's currency
    /// and minor unit exponent is used.
    /// Pending payment lines are polled until none is still authorizing.
    pub async fn pay(
        &self,
        reservation: &Reservation,
        voucher: Option<MultiUseVoucher>,
    ) -> Result<Vec<Payment>, ApiError> {
        let price = &reservation.total_price;
        let voucher = match voucher {
            Some(voucher) if !voucher.amount.same_currency(price) => {
                return Err(ApiError::Payment(vec![format!(
                    "Voucher currency ({}, {} decimals) does not match order currency ({}, {} decimals)",
                    voucher.amount.code, voucher.amount.decimals, price.code, price.decimals
                )]));
            }
            Some(voucher) => voucher,
            None => self
                .get_active_vouchers()
                .await?
                .into_iter()
                .filter_map(|voucher| match voucher {
                    Voucher::MultiUse(voucher) if voucher.amount.same_currency(price) => Some(voucher),
                    _ => None,
                })
                .max_by_key(|voucher| voucher.amount.minor_units)
                .ok_or_else(|| ApiError::Payment(vec!["No vouchers available".to_string()]))?,
        };

        let amounts = split_denominations(price.minor_units, voucher.amount.minor_units)?;
        debug!("Paying {} with {} voucher lines", price, amounts.len());
        let data = self
            .pipeline
            .send(
                Endpoint::OrderPay,
                &[&reservation.id],
                Some(json!({ "authorizations": voucher_authorizations(&voucher, &amounts) })),
            )
            .await?;
        let mut payments = parse_payments(data)?;

        while payments
            .iter()
            .any(|payment| payment.state == PaymentState::AuthorizationInitiated)
        {
            tokio::time::sleep(self.payment_poll_interval).await;
            payments = self.get_order_payment_status(&reservation.id).await?;
            debug!("Payment states: {:?}", payments.iter().map(|p| p.state).collect::<Vec<_>>());
        }

        let reasons: BTreeSet<String> = payments
            .iter()
            .filter(|payment| payment.state == PaymentState::Failed)
            .map(|payment| {
                payment
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "FAILED".to_string())
            })
            .collect();
        if !reasons.is_empty() {
            return Err(ApiError::Payment(reasons.into_iter().collect()));
        }

        self.check_voucher_deduction(&voucher).await?;

        if let Some(payment) = payments.iter().find(|payment| !payment.is_settled()) {
            return Err(ApiError::Payment(vec![format!(
                "payment {} ended in state {:?}",
                payment.id, payment.state
            )]));
        }
        info!("Paid {} for reservation {}", price, reservation.id);
        Ok(payments)
    }

    /// Alerts when a payment took more than one minor unit from the voucher balance.
    async fn check_voucher_deduction(&self, voucher: &MultiUseVoucher) -> Result<(), ApiError> {
        let Voucher::MultiUse(updated) = self.get_voucher(voucher.id).await? else {
            return Err(ApiError::Decode(format!(
                "voucher {} is no longer multi-use",
                voucher.id
            )));
        };

        let Some(deducted) = voucher.amount.checked_sub(&updated.amount) else {
            return Err(ApiError::Decode(format!(
                "voucher {} changed currency",
                voucher.id
            )));
        };
        if deducted.minor_units != 1 {
            warn!("{} deducted from voucher {}", deducted, voucher.id);
            if let Err(e) = self
                .notifier
                .publish(
                    &format!("{deducted} deducted from voucher"),
                    Priority::High,
                    "tickets",
                )
                .await
            {
                error!("Failed to send voucher alert: {}", e);
            }
        }
        Ok(())
    }
}

enum ReserveOutcome {
    Reserved(Reservation),
    /// Try once more at `quantity`; fail with `exhausted` if that needs correcting too.
    Retry { quantity: u32, exhausted: ApiError },
}

fn parse_payments(data: Value) -> Result<Vec<Payment>, ApiError> {
    decode::<PaymentsResponse>(data)?
        .payments
        .into_iter()
        .map(decode::<Payment>)
        .collect()
}

/// Renders a duration as `1h 2m 3s`, dropping leading zero units.
fn format_remaining(remaining: TimeDelta) -> String {
    let total = remaining.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, total % 3600 / 60, total % 60);
    match (hours, minutes) {
        (0, 0) => format!("{seconds}s"),
        (0, _) => format!("{minutes}m {seconds}s"),
        _ => format!("{hours}h {minutes}m {seconds}s"),
    }
}
