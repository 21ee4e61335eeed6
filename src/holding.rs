use crate::error::{ValidationError, ValidationErrors};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// A stock position as stored by the remote service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    // server-assigned, echoed back on update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub company_name: String,
    pub ticker_symbol: String,
    pub price: Decimal,
    pub quantity: u32,
}

impl Holding {
    pub fn new(company_name: &str, ticker_symbol: &str, price: Decimal, quantity: u32) -> Self {
        Holding {
            id: None,
            company_name: company_name.to_string(),
            ticker_symbol: ticker_symbol.to_string(),
            price,
            quantity,
        }
    }

    /// Buy price times quantity, saturating at `Decimal::MAX`.
    pub fn cost_basis(&self) -> Decimal {
        self.price.saturating_mul(Decimal::from(self.quantity))
    }
}

impl AsRef<Holding> for Holding {
    fn as_ref(&self) -> &Holding {
        self
    }
}

/// A holding together with its latest real-time quote.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedHolding {
    pub holding: Holding,
    pub current_price: Decimal,
    pub profit_or_loss: Decimal,
}

impl EnrichedHolding {
    pub fn with_quote(holding: Holding, current_price: Decimal) -> Self {
        let profit_or_loss = current_price.saturating_sub(holding.price);
        EnrichedHolding {
            holding,
            current_price,
            profit_or_loss,
        }
    }

    /// Used when no quote could be fetched: the buy price stands in for the
    /// current price and the position shows no profit or loss.
    pub fn unquoted(holding: Holding) -> Self {
        let price = holding.price;
        EnrichedHolding::with_quote(holding, price)
    }

    pub fn ticker(&self) -> &str {
        &self.holding.ticker_symbol
    }

    pub fn market_value(&self) -> Decimal {
        self.current_price
            .saturating_mul(Decimal::from(self.holding.quantity))
    }

    pub fn total_profit_or_loss(&self) -> Decimal {
        self.profit_or_loss
            .saturating_mul(Decimal::from(self.holding.quantity))
    }
}

impl AsRef<Holding> for EnrichedHolding {
    fn as_ref(&self) -> &Holding {
        &self.holding
    }
}

/// Raw form input for creating or editing a holding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldingDraft {
    pub company_name: String,
    pub ticker_symbol: String,
    pub price: String,
    pub quantity: String,
}

impl HoldingDraft {
    pub fn new(company_name: &str, ticker_symbol: &str, price: &str, quantity: &str) -> Self {
        HoldingDraft {
            company_name: company_name.to_string(),
            ticker_symbol: ticker_symbol.to_string(),
            price: price.to_string(),
            quantity: quantity.to_string(),
        }
    }

    /// Prefill a draft from a stored holding, for editing.
    pub fn from_holding(holding: &Holding) -> Self {
        HoldingDraft {
            company_name: holding.company_name.clone(),
            ticker_symbol: holding.ticker_symbol.clone(),
            price: holding.price.normalize().to_string(),
            quantity: holding.quantity.to_string(),
        }
    }

    /// Check every field and collect all violations, so a form can show
    /// each field's error at the same time.
    pub fn validate(&self) -> Result<Holding, ValidationErrors> {
        let mut errors = ValidationErrors::default();

        let company_name = self.company_name.trim();
        if company_name.is_empty() {
            errors.push(ValidationError::CompanyNameRequired);
        }

        let ticker = self.ticker_symbol.as_str();
        if ticker.trim().is_empty() {
            errors.push(ValidationError::TickerRequired);
        } else if !is_valid_ticker(ticker) {
            errors.push(ValidationError::TickerNotUppercase);
        }

        let mut price = parse_price(&self.price);
        let quantity = parse_quantity(&self.quantity);

        // the cost basis has to stay representable
        if let (Some(p), Some(q)) = (price, quantity) {
            if p.checked_mul(Decimal::from(q)).is_none() {
                price = None;
            }
        }
        if price.is_none() {
            errors.push(ValidationError::InvalidPrice);
        }
        if quantity.is_none() {
            errors.push(ValidationError::InvalidQuantity);
        }

        match (price, quantity) {
            (Some(price), Some(quantity)) if errors.is_empty() => {
                Ok(Holding::new(company_name, ticker, price, quantity))
            }
            _ => Err(errors),
        }
    }
}

/// One or more uppercase ASCII letters.
pub fn is_valid_ticker(ticker: &str) -> bool {
    !ticker.is_empty() && ticker.chars().all(|c| c.is_ascii_uppercase())
}

fn parse_number(input: &str) -> Option<Decimal> {
    let input = input.trim();
    if input.contains('_') {
        return None;
    }
    Decimal::from_str(input).ok()
}

fn parse_price(input: &str) -> Option<Decimal> {
    parse_number(input)
        .filter(|p| p.is_sign_positive() && !p.is_zero())
}

// "2.0" is an integer, "2.5" is not
fn parse_quantity(input: &str) -> Option<u32> {
    let value = parse_number(input)?;
    if value <= Decimal::ZERO || !value.fract().is_zero() {
        return None;
    }
    value.to_u32()
}
