//! Purchasable products and the definitions they are loaded from.

use crate::error::LedgerError;
use crate::utils::quantize_money;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One record of the product definition list.
#[derive(Debug, Clone, Deserialize)]
pub struct ProductDefinition {
	pub name: String,
	#[serde(default)]
	pub localized_name: BTreeMap<String, String>,
	pub currency: String,
	#[serde(default)]
	pub price: Option<Decimal>,
	/// Replaces `price` when the service runs in event mode
	#[serde(default)]
	pub event_price: Option<Decimal>,
	#[serde(default)]
	pub paying_member_price: Option<Decimal>,
	#[serde(default)]
	pub category: Option<String>,
	#[serde(default)]
	pub sort_key: Option<SortKey>,
	#[serde(default)]
	pub payback: Option<PaybackDefinition>,
	#[serde(default = "default_visible")]
	pub visible: bool,
}

fn default_visible() -> bool {
	true
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaybackDefinition {
	pub account: String,
	pub amount: Decimal,
}

/// Ordering hint for clients; product lists use numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SortKey {
	Number(i64),
	Text(String),
}

/// Fixed amount per unit sold that goes to a third party instead of income.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payback {
	pub account: String,
	pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Product {
	pub name: String,
	pub localized_name: BTreeMap<String, String>,
	/// Inventory unit, unique across products
	pub currency: String,
	pub price: Decimal,
	pub paying_member_price: Decimal,
	pub category: Option<String>,
	pub sort_key: Option<SortKey>,
	pub payback: Option<Payback>,
	pub visible: bool,
}

impl Product {
	/// Resolve a definition into a product with quantized prices.
	pub fn from_definition(
		definition: ProductDefinition,
		event_mode: bool,
	) -> Result<Self, LedgerError> {
		let price = if event_mode {
			definition.event_price.ok_or_else(|| {
				LedgerError::ProductError(format!(
					"Product {} has no event_price",
					definition.name
				))
			})?
		} else {
			definition.price.ok_or_else(|| {
				LedgerError::ProductError(format!("Product {} has no price", definition.name))
			})?
		};
		let price = quantize_money(price);
		let paying_member_price = definition
			.paying_member_price
			.map(quantize_money)
			.unwrap_or(price);

		Ok(Self {
			name: definition.name,
			localized_name: definition.localized_name,
			currency: definition.currency,
			price,
			paying_member_price,
			category: definition.category,
			sort_key: definition.sort_key,
			payback: definition.payback.map(|payback| Payback {
				account: payback.account,
				amount: quantize_money(payback.amount),
			}),
			visible: definition.visible,
		})
	}

	/// Unit price for a buyer.
	pub fn price_for(&self, paying_member: bool) -> Decimal {
		if paying_member {
			self.paying_member_price
		} else {
			self.price
		}
	}

	/// Client view; payback details stay out of it.
	pub fn view(&self) -> ProductView {
		ProductView {
			name: self.name.clone(),
			localized_name: self.localized_name.clone(),
			currency: self.currency.clone(),
			price: self.price,
			paying_member_price: self.paying_member_price,
			category: self.category.clone(),
			sort_key: self.sort_key.clone(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProductView {
	pub name: String,
	pub localized_name: BTreeMap<String, String>,
	pub currency: String,
	pub price: Decimal,
	pub paying_member_price: Decimal,
	pub category: Option<String>,
	pub sort_key: Option<SortKey>,
}

/// Build the product table keyed by currency.
///
/// Fails on the first duplicate currency or name; nothing is returned in that
/// case, so a bad list never replaces a good one.
pub fn build_products(
	definitions: Vec<ProductDefinition>,
	event_mode: bool,
) -> Result<BTreeMap<String, Product>, LedgerError> {
	let mut products = BTreeMap::new();
	let mut names = HashSet::new();
	for definition in definitions {
		let product = Product::from_definition(definition, event_mode)?;
		if !names.insert(product.name.clone()) {
			return Err(LedgerError::ProductError(format!(
				"Duplicate product {}",
				product.name
			)));
		}
		if products.contains_key(&product.currency) {
			return Err(LedgerError::ProductError(format!(
				"Duplicate product currency {} (product {})",
				product.currency, product.name
			)));
		}
		products.insert(product.currency.clone(), product);
	}
	Ok(products)
}
