use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Number of decimal places kept for monetary amounts.
pub const MONEY_DECIMALS: u32 = 2;

/// Quantize a monetary amount to cents, rounding half to even.
pub fn quantize_money(amount: Decimal) -> Decimal {
	let mut rounded =
		amount.round_dp_with_strategy(MONEY_DECIMALS, RoundingStrategy::MidpointNearestEven);
	rounded.rescale(MONEY_DECIMALS);
	// No "-0.00" in client output.
	if rounded.is_zero() {
		rounded.set_sign_positive(true);
	}
	rounded
}

/// Quantize an item quantity to whole units, rounding half to even.
pub fn quantize_count(quantity: Decimal) -> Decimal {
	quantity.round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
}

/// Parse a price or amount string and quantize it to cents.
pub fn parse_money(raw: &str) -> Result<Decimal, rust_decimal::Error> {
	Decimal::from_str(raw.trim()).map(quantize_money)
}
