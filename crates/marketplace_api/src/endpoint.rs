use std::fmt;

/// A logical API operation with its path template.
///
/// Templates use `{}` placeholders that are filled in order by [`Endpoint::path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Start-up handshake.
    AppOnStartup,
    /// Export of the account's personal data.
    UserDataExport,
    /// Account deletion.
    UserDelete,
    /// Email change request.
    UserEmailChange,
    /// Email verification status.
    UserEmailStatus,
    /// Device registration.
    UserSetDevice,
    /// Email login.
    AuthByEmail,
    /// Login confirmation polling.
    AuthByPolling,
    /// Access token refresh.
    TokenRefresh,
    /// Favorites bucket listing.
    Favorites,
    /// Full item detail.
    ItemStatus,
    /// Favorite flag of an item.
    ItemFavorite,
    /// Order detail.
    OrderStatus,
    /// Abort a reservation before payment.
    OrderAbort,
    /// Cancel a paid order.
    OrderCancel,
    /// Create a reservation.
    OrderCreate,
    /// Pay a reservation.
    OrderPay,
    /// Payment state of an order.
    OrderPaymentStatus,
    /// Active vouchers of the account.
    VouchersActive,
    /// Voucher detail.
    VoucherStatus,
}

impl Endpoint {
    /// Path template relative to the API base URL.
    pub fn template(&self) -> &'static str {
        match self {
            Endpoint::AppOnStartup => "app/v1/onStartup",
            Endpoint::UserDataExport => "user/v1/dataExport",
            Endpoint::UserDelete => "user/v1/delete",
            Endpoint::UserEmailChange => "user/v1/email/change",
            Endpoint::UserEmailStatus => "user/v1/email/status",
            Endpoint::UserSetDevice => "user/v1/setDevice",
            Endpoint::AuthByEmail => "auth/v5/authByEmail",
            Endpoint::AuthByPolling => "auth/v5/authByRequestPollingId",
            Endpoint::TokenRefresh => "token/v1/refresh",
            Endpoint::Favorites => "discover/v1/bucket",
            Endpoint::ItemStatus => "item/v8/{}",
            Endpoint::ItemFavorite => "user/favorite/v1/{}/update",
            Endpoint::OrderStatus => "order/v8/{}",
            Endpoint::OrderAbort => "order/v8/{}/abort",
            Endpoint::OrderCancel => "order/v8/{}/cancel",
            Endpoint::OrderCreate => "order/v8/create/{}",
            Endpoint::OrderPay => "order/v8/{}/pay",
            Endpoint::OrderPaymentStatus => "payment/v4/order/{}",
            Endpoint::VouchersActive => "voucher/v4/active",
            Endpoint::VoucherStatus => "voucher/v4/{}",
        }
    }

    /// Fills the template placeholders with `params`, in order.
    /// Surplus placeholders are left empty.
    pub fn path(&self, params: &[&(dyn fmt::Display + Sync)]) -> String {
        let mut params = params.iter();
        let mut parts = self.template().split("{}");
        let mut path = parts.next().unwrap_or_default().to_string();
        for part in parts {
            if let Some(param) = params.next() {
                path.push_str(&param.to_string());
            }
            path.push_str(part);
        }
        path
    }

    /// Whether requests carry the bearer token.
    pub fn requires_credentials(&self) -> bool {
        !matches!(self, Endpoint::AuthByEmail | Endpoint::AuthByPolling)
    }

    /// Endpoints that answer a successful call with an empty body.
    pub fn allows_empty_success(&self) -> bool {
        matches!(
            self,
            Endpoint::UserDataExport
                | Endpoint::UserDelete
                | Endpoint::UserEmailChange
                | Endpoint::UserSetDevice
                | Endpoint::ItemFavorite
        )
    }

    /// Endpoints whose timestamps depend on the client's clock settings.
    pub fn sends_clock_headers(&self) -> bool {
        matches!(self, Endpoint::Favorites | Endpoint::ItemStatus)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.template())
    }
}
