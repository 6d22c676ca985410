use serde_json::{Value, json};

use crate::{ApiError, MultiUseVoucher, Price};

/// Fewest one-minor-unit lines a voucher payment is split into.
pub const MIN_UNIT_LINES: i64 = 4;

/// Splits `total` minor units into payment lines of at most `chunk` each.
///
/// The result holds whole `chunk` lines, then the remainder (if any), then at least
/// [`MIN_UNIT_LINES`] lines of one unit. The lines always sum to `total`.
pub fn split_denominations(total: i64, chunk: i64) -> Result<Vec<i64>, ApiError> {
    if chunk <= 0 {
        return Err(ApiError::Payment(vec![format!(
            "voucher balance {chunk} cannot pay anything"
        )]));
    }

    let unit_lines = MIN_UNIT_LINES.max(total / chunk);
    if total < unit_lines {
        return Err(ApiError::Payment(vec![format!(
            "total {total} is too small to split into {unit_lines} unit payments"
        )]));
    }

    let rest = total - unit_lines;
    let (full, remainder) = (rest / chunk, rest % chunk);

    let mut amounts = vec![chunk; full as usize];
    if remainder > 0 {
        amounts.push(remainder);
    }
    amounts.extend(std::iter::repeat_n(1, unit_lines as usize));
    Ok(amounts)
}

/// Redirect target the payment provider expects from the mobile client.
const RETURN_URL: &str = "adyencheckout://com.app.tgtg.itemview";

/// Builds one voucher authorization per amount.
pub fn voucher_authorizations(voucher: &MultiUseVoucher, amounts: &[i64]) -> Vec<Value> {
    amounts
        .iter()
        .map(|amount| {
            let Price { code, decimals, .. } = &voucher.amount;
            json!({
                "authorization_payload": {
                    "voucher_id": voucher.id,
                    "save_payment_method": false,
                    "type": "voucherAuthorizationPayload",
                },
                "payment_provider": "VOUCHER",
                "return_url": RETURN_URL,
                "amount": {"code": code, "decimals": decimals, "minor_units": amount},
            })
        })
        .collect()
}
