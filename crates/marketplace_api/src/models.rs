use std::fmt;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::ApiError;

/// Marketplace listing id.
pub type ItemId = u64;

/// Decodes a JSON value into `T`, mapping failures to [`ApiError::Decode`].
pub(crate) fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Ids arrive either as JSON numbers or as numeric strings.
fn numeric_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    match RawId::deserialize(deserializer)? {
        RawId::Number(id) => Ok(id),
        RawId::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Timestamps with or without a zone suffix; a missing zone means UTC.
fn utc_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let text = String::deserialize(deserializer)?;
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(&text) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(serde::de::Error::custom)
}

/// Status tag shown on a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Tag {
    /// More stock may be released later today.
    CheckAgainLater,
    /// The pickup window closes soon.
    EndingSoon,
    /// Nothing for sale today.
    #[default]
    NothingToSaveToday,
    /// Sold out.
    SoldOut,
    /// A handful left.
    XItemsLeft,
    /// Selling quickly.
    SellingFast,
}

impl Tag {
    fn from_code(code: &str) -> Option<Self> {
        Some(match code {
            "CHECK_AGAIN_LATER" => Tag::CheckAgainLater,
            "ENDING_SOON" => Tag::EndingSoon,
            "NOTHING_TO_SAVE_TODAY" => Tag::NothingToSaveToday,
            "SOLD_OUT" => Tag::SoldOut,
            "X_ITEMS_LEFT" => Tag::XItemsLeft,
            "SELLING_FAST" => Tag::SellingFast,
            _ => return None,
        })
    }

    /// Tags shown while stock is on sale.
    pub fn is_selling(&self) -> bool {
        matches!(self, Tag::EndingSoon | Tag::SellingFast | Tag::XItemsLeft)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tag::CheckAgainLater => "Check again later",
            Tag::EndingSoon => "Ending soon",
            Tag::NothingToSaveToday => "Nothing today",
            Tag::SoldOut => "Sold out",
            Tag::XItemsLeft => "X left",
            Tag::SellingFast => "Selling fast",
        })
    }
}

/// Packaging requirement. Only [`Packaging::MustBringPackaging`] is kept on a snapshot;
/// the others mean packaging is provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Packaging {
    /// Bags are allowed.
    BagAllowed,
    /// Nothing may be brought.
    CantBringAnything,
    /// A bag must be brought.
    MustBringBag,
    /// Own packaging must be brought.
    MustBringPackaging,
}

impl Packaging {
    /// Whether the store supplies packaging.
    pub fn is_provided(&self) -> bool {
        *self != Packaging::MustBringPackaging
    }
}

#[derive(Debug, Deserialize)]
struct TagDto {
    id: String,
    #[serde(default)]
    variant: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemInfoDto {
    #[serde(deserialize_with = "numeric_id")]
    item_id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    packaging_option: Option<Packaging>,
}

#[derive(Debug, Deserialize)]
struct StoreDto {
    store_name: String,
    #[serde(default)]
    branch: String,
}

#[derive(Debug, Deserialize)]
struct ListingDto {
    item: ItemInfoDto,
    store: StoreDto,
    #[serde(default)]
    item_tags: Vec<TagDto>,
    #[serde(default)]
    items_available: u32,
    #[serde(default)]
    in_sales_window: bool,
    #[serde(default)]
    sold_out_at: Option<DateTime<Utc>>,
    #[serde(default)]
    next_sales_window_purchase_start: Option<DateTime<Utc>>,
    #[serde(default)]
    user_purchase_limit: Option<u32>,
    #[serde(default)]
    reservation_blocked_until: Option<DateTime<Utc>>,
}

impl ListingDto {
    fn name(&self) -> String {
        let mut name = self.store.store_name.trim().to_string();
        let branch = self.store.branch.trim();
        if !branch.is_empty() {
            name.push_str(" - ");
            name.push_str(branch);
        }
        let item_name = match self.item.name.trim() {
            "" => "Surprise Bag",
            item_name => item_name,
        };
        format!("{name} ({item_name})")
    }

    fn tag(&self) -> Result<Tag, ApiError> {
        let mut tags = Vec::new();
        for tag in &self.item_tags {
            let code = match tag.id.as_str() {
                "NEW" => continue,
                "GENERIC" => tag.variant.as_deref().unwrap_or_default(),
                code => code,
            };
            let parsed = Tag::from_code(code)
                .ok_or_else(|| ApiError::Decode(format!("unknown item tag {code:?}")))?;
            tags.push(parsed);
        }

        match tags.as_slice() {
            [] => Ok(Tag::default()),
            [tag] => Ok(*tag),
            _ => Err(ApiError::Decode(format!("conflicting item tags {tags:?}"))),
        }
    }

    fn snapshot(&self) -> Result<Favorite, ApiError> {
        Ok(Favorite {
            id: self.item.item_id,
            name: self.name(),
            tag: self.tag()?,
            num_available: self.items_available,
            in_sales_window: self.in_sales_window,
            sold_out_at: self.sold_out_at,
            next_drop: self.next_sales_window_purchase_start,
            packaging: self.item.packaging_option.filter(|p| !p.is_provided()),
        })
    }
}

/// Point-in-time view of a favourited listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Favorite {
    /// Listing id.
    pub id: ItemId,
    /// Store, branch and item name.
    pub name: String,
    /// Current status tag.
    pub tag: Tag,
    /// Units on sale.
    pub num_available: u32,
    /// Whether the listing can be bought right now.
    pub in_sales_window: bool,
    /// When the last unit sold.
    pub sold_out_at: Option<DateTime<Utc>>,
    /// When more stock goes on sale.
    pub next_drop: Option<DateTime<Utc>>,
    /// Packaging the customer must bring.
    pub packaging: Option<Packaging>,
}

impl Favorite {
    /// Creates a snapshot with everything but the id and name at its default.
    pub fn new(id: ItemId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            tag: Tag::default(),
            num_available: 0,
            in_sales_window: false,
            sold_out_at: None,
            next_drop: None,
            packaging: None,
        }
    }

    /// Decodes one entry of the favorites bucket.
    pub fn from_json(value: Value) -> Result<Self, ApiError> {
        decode::<ListingDto>(value)?.snapshot()
    }

    /// Whether anything other than the id and name differs from the defaults.
    pub fn is_interesting(&self) -> bool {
        *self != Favorite::new(self.id, self.name.clone())
    }

    /// Whether the tag shows stock on sale.
    pub fn is_selling(&self) -> bool {
        self.tag.is_selling()
    }

    /// Whether the tag shows the listing sold out.
    pub fn is_sold_out(&self) -> bool {
        self.tag == Tag::SoldOut
    }

    /// Whether the tag announces a later release.
    pub fn is_check_again_later(&self) -> bool {
        self.tag == Tag::CheckAgainLater
    }
}

impl fmt::Display for Favorite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Favorite(id={}, name={:?}", self.id, self.name)?;
        if self.tag != Tag::default() {
            write!(f, ", tag={}", self.tag)?;
        }
        if self.num_available != 0 {
            write!(f, ", num_available={}", self.num_available)?;
        }
        if self.in_sales_window {
            write!(f, ", in_sales_window=true")?;
        }
        if let Some(sold_out_at) = self.sold_out_at {
            write!(f, ", sold_out_at={}", sold_out_at.to_rfc3339())?;
        }
        if let Some(next_drop) = self.next_drop {
            write!(f, ", next_drop={}", next_drop.to_rfc3339())?;
        }
        if let Some(packaging) = self.packaging {
            write!(f, ", packaging={packaging:?}")?;
        }
        write!(f, ")")
    }
}

/// Full detail of one listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// The listing as it would appear among favorites.
    pub snapshot: Favorite,
    /// Units one account may buy per sales window.
    pub purchase_limit: Option<u32>,
    /// End of a reservation block on this account.
    pub blocked_until: Option<DateTime<Utc>>,
}

impl Item {
    /// Decodes an item detail response.
    pub fn from_json(value: Value) -> Result<Self, ApiError> {
        let dto = decode::<ListingDto>(value)?;
        Ok(Self {
            snapshot: dto.snapshot()?,
            purchase_limit: dto.user_purchase_limit,
            blocked_until: dto.reservation_blocked_until,
        })
    }

    /// Listing id.
    pub fn id(&self) -> ItemId {
        self.snapshot.id
    }

    /// Units on sale.
    pub fn num_available(&self) -> u32 {
        self.snapshot.num_available
    }

    /// When more stock goes on sale.
    pub fn next_drop(&self) -> Option<DateTime<Utc>> {
        self.snapshot.next_drop
    }

    /// Largest quantity one reservation may request.
    pub fn max_quantity(&self) -> u32 {
        let available = self.snapshot.num_available;
        match self.purchase_limit {
            Some(limit) if limit > 0 => available.min(limit),
            _ => available,
        }
    }
}

impl fmt::Display for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.snapshot)?;
        if let Some(limit) = self.purchase_limit {
            write!(f, " limit={limit}")?;
        }
        Ok(())
    }
}

/// An amount of money in minor units.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    /// ISO currency code.
    pub code: String,
    /// Digits after the decimal point.
    pub decimals: u32,
    /// Amount in the smallest currency unit.
    pub minor_units: i64,
}

impl Price {
    /// Same currency, different amount.
    pub fn with_minor_units(&self, minor_units: i64) -> Self {
        Self {
            minor_units,
            ..self.clone()
        }
    }

    /// Whether both amounts use the same currency code and minor unit exponent.
    pub fn same_currency(&self, other: &Price) -> bool {
        self.code == other.code && self.decimals == other.decimals
    }

    /// Difference in minor units, if both amounts share a currency.
    pub fn checked_sub(&self, other: &Price) -> Option<Price> {
        self.same_currency(other)
            .then(|| self.with_minor_units(self.minor_units - other.minor_units))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(scale) = 10i64.checked_pow(self.decimals) else {
            return write!(f, "{}e-{} {}", self.minor_units, self.decimals, self.code);
        };
        let sign = if self.minor_units < 0 { "-" } else { "" };
        let units = self.minor_units.abs();
        if self.decimals == 0 {
            write!(f, "{sign}{units} {}", self.code)
        } else {
            write!(
                f,
                "{sign}{}.{:0width$} {}",
                units / scale,
                units % scale,
                self.code,
                width = self.decimals as usize
            )
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrderLineDto {
    quantity: u32,
    total_price: Price,
}

#[derive(Debug, Deserialize)]
struct ReservationDto {
    id: String,
    #[serde(deserialize_with = "numeric_id")]
    item_id: u64,
    order_line: OrderLineDto,
    #[serde(deserialize_with = "utc_timestamp")]
    reserved_at: DateTime<Utc>,
}

/// A time-limited hold on some units of a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Reservation (and later order) id.
    pub id: String,
    /// Listing the units belong to.
    pub item_id: ItemId,
    /// Units held.
    pub quantity: u32,
    /// Price of all held units.
    pub total_price: Price,
    /// When the hold was created.
    pub reserved_at: DateTime<Utc>,
}

impl Reservation {
    /// How long the server keeps a reservation.
    pub const TTL: TimeDelta = TimeDelta::minutes(4);

    /// Decodes the `order` object of a reservation response.
    pub fn from_json(value: Value) -> Result<Self, ApiError> {
        let dto = decode::<ReservationDto>(value)?;
        Ok(Self {
            id: dto.id,
            item_id: dto.item_id,
            quantity: dto.order_line.quantity,
            total_price: dto.order_line.total_price,
            reserved_at: dto.reserved_at,
        })
    }

    /// When the server releases the held units.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.reserved_at + Self::TTL
    }
}

impl fmt::Display for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reservation(id={:?}, item_id={}, quantity={}, total_price={}, reserved_at={})",
            self.id,
            self.item_id,
            self.quantity,
            self.total_price,
            self.reserved_at.to_rfc3339()
        )
    }
}

/// Lifecycle of a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentState {
    /// Waiting for the provider.
    AuthorizationInitiated,
    /// Authorized, not yet captured.
    Authorized,
    /// Cancelled.
    Cancelled,
    /// Money taken.
    Captured,
    /// Rejected by the provider.
    Failed,
    /// Taken and returned.
    FullyRefunded,
}

/// One payment line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Payment {
    /// Payment id.
    #[serde(rename = "payment_id", deserialize_with = "numeric_id")]
    pub id: u64,
    /// Provider that handled the line.
    pub payment_provider: String,
    /// Current state.
    pub state: PaymentState,
    /// Reason code, present when the state is failed.
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl Payment {
    /// Whether the line reached a final successful state.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.state,
            PaymentState::Captured | PaymentState::FullyRefunded
        )
    }
}

#[derive(Debug, Deserialize)]
struct VoucherDto {
    #[serde(deserialize_with = "numeric_id")]
    id: u64,
    name: String,
    version: String,
    #[serde(default)]
    current_amount: Option<Price>,
}

/// A voucher whose balance can be spent across several payments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiUseVoucher {
    /// Voucher id.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Remaining balance.
    pub amount: Price,
}

/// A voucher on the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Voucher {
    /// Currency balance spendable in parts.
    MultiUse(MultiUseVoucher),
    /// Single-use item voucher.
    SingleUse {
        /// Voucher id.
        id: u64,
        /// Display name.
        name: String,
    },
}

impl Voucher {
    /// Decodes one voucher object.
    pub fn from_json(value: Value) -> Result<Self, ApiError> {
        let dto = decode::<VoucherDto>(value)?;
        match (dto.version.as_str(), dto.current_amount) {
            ("CURRENCY_BASED_MULTI_USE_VOUCHER", Some(amount)) => {
                Ok(Voucher::MultiUse(MultiUseVoucher {
                    id: dto.id,
                    name: dto.name,
                    amount,
                }))
            }
            ("CURRENCY_BASED_MULTI_USE_VOUCHER", None) => Err(ApiError::Decode(format!(
                "voucher {} has no current amount",
                dto.id
            ))),
            _ => Ok(Voucher::SingleUse {
                id: dto.id,
                name: dto.name,
            }),
        }
    }
}
