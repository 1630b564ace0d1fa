//! Currency conversion for display and reporting.
//!
//! Conversion is never allowed to break a caller: every helper here falls back
//! to the original amount with a rate of one when no rate can be obtained.
use super::expense::{CurrencyCode, Expense};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("no exchange rate available for {0}")]
    MissingRate(CurrencyCode),
    #[error("exchange rate service unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRate {
    pub rate: Decimal,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversion {
    pub amount: Decimal,
    pub original_amount: Decimal,
    pub from: CurrencyCode,
    pub to: CurrencyCode,
    pub rate: Decimal,
    pub date: NaiveDate,
    pub error: Option<String>,
}

/// An expense together with the amount to show for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayExpense {
    pub expense: Expense,
    pub display_amount: Decimal,
    pub display_currency: CurrencyCode,
    pub conversion_rate: Decimal,
    pub conversion_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Total {
    pub total: Decimal,
    pub currency: CurrencyCode,
    pub breakdown: BTreeMap<CurrencyCode, Decimal>, // unconverted sums per source currency
    pub expense_count: usize,
}

/// Source of exchange rates.
pub trait CurrencyConverter: Send + Sync {
    fn rate(&self, from: &CurrencyCode, to: &CurrencyCode) -> Result<ExchangeRate, ConversionError>;

    fn convert(
        &self,
        amount: Decimal,
        from: &CurrencyCode,
        to: &CurrencyCode,
    ) -> Result<Conversion, ConversionError> {
        let rate = self.rate(from, to)?;
        let converted = amount
            .checked_mul(rate.rate)
            .ok_or_else(|| ConversionError::Unavailable("converted amount overflowed".into()))?;

        Ok(Conversion {
            amount: converted,
            original_amount: amount,
            from: from.clone(),
            to: to.clone(),
            rate: rate.rate,
            date: rate.date,
            error: None,
        })
    }
}

/// Rates from a fixed table, quoted as units of each currency per one unit of `base`.
#[derive(Debug, Clone)]
pub struct StaticRateConverter {
    base: CurrencyCode,
    rates: HashMap<CurrencyCode, Decimal>,
    as_of: NaiveDate,
}

impl StaticRateConverter {
    pub fn new(base: CurrencyCode, rates: HashMap<CurrencyCode, Decimal>) -> Self {
        Self {
            base,
            rates,
            as_of: Utc::now().date_naive(),
        }
    }

    fn per_base(&self, code: &CurrencyCode) -> Result<Decimal, ConversionError> {
        if *code == self.base {
            return Ok(Decimal::ONE);
        }
        self.rates
            .get(code)
            .copied()
            .filter(|rate| !rate.is_zero())
            .ok_or_else(|| ConversionError::MissingRate(code.clone()))
    }
}

impl CurrencyConverter for StaticRateConverter {
    fn rate(&self, from: &CurrencyCode, to: &CurrencyCode) -> Result<ExchangeRate, ConversionError> {
        let rate = self
            .per_base(to)?
            .checked_div(self.per_base(from)?)
            .ok_or_else(|| ConversionError::MissingRate(from.clone()))?;

        Ok(ExchangeRate {
            rate,
            date: self.as_of,
        })
    }
}

/// Converts `amount`, or hands back the original amount with rate 1 and the failure noted.
pub fn convert_or_original(
    converter: &dyn CurrencyConverter,
    amount: Decimal,
    from: &CurrencyCode,
    to: &CurrencyCode,
) -> Conversion {
    let today = Utc::now().date_naive();
    if from == to {
        return Conversion {
            amount,
            original_amount: amount,
            from: from.clone(),
            to: to.clone(),
            rate: Decimal::ONE,
            date: today,
            error: None,
        };
    }

    converter.convert(amount, from, to).unwrap_or_else(|err| {
        tracing::warn!(%from, %to, error = %err, "currency conversion failed, showing original amount");
        Conversion {
            amount,
            original_amount: amount,
            from: from.clone(),
            to: to.clone(),
            rate: Decimal::ONE,
            date: today,
            error: Some(format!("Conversion failed, showing original amount: {err}")),
        }
    })
}

/// Expenses with their amounts in `target`. Rates are looked up once per source
/// currency; an expense whose rate is unavailable keeps its own amount and currency.
pub fn convert_expenses(
    converter: &dyn CurrencyConverter,
    expenses: Vec<Expense>,
    target: &CurrencyCode,
) -> Vec<DisplayExpense> {
    let mut rates: HashMap<CurrencyCode, Result<Decimal, ConversionError>> = HashMap::new();

    expenses
        .into_iter()
        .map(|expense| {
            let amount = expense.details.amount.value();
            let source = expense.details.currency.clone();
            if source == *target {
                return DisplayExpense {
                    expense,
                    display_amount: amount,
                    display_currency: target.clone(),
                    conversion_rate: Decimal::ONE,
                    conversion_error: None,
                };
            }

            let rate = rates
                .entry(source.clone())
                .or_insert_with(|| converter.rate(&source, target).map(|r| r.rate));

            match rate.as_ref().ok().and_then(|rate| amount.checked_mul(*rate).map(|v| (*rate, v))) {
                Some((rate, converted)) => DisplayExpense {
                    expense,
                    display_amount: converted,
                    display_currency: target.clone(),
                    conversion_rate: rate,
                    conversion_error: None,
                },
                None => {
                    let reason = match rate {
                        Err(err) => err.to_string(),
                        Ok(_) => "converted amount overflowed".to_string(),
                    };
                    tracing::warn!(from = %source, to = %target, error = %reason, "showing expense in its original currency");
                    DisplayExpense {
                        expense,
                        display_amount: amount,
                        display_currency: source,
                        conversion_rate: Decimal::ONE,
                        conversion_error: Some(reason),
                    }
                }
            }
        })
        .collect()
}

/// Total of `expenses` in `target`, with the raw per-currency sums alongside.
pub fn calculate_total(
    converter: &dyn CurrencyConverter,
    expenses: Vec<Expense>,
    target: &CurrencyCode,
) -> Total {
    let mut breakdown: BTreeMap<CurrencyCode, Decimal> = BTreeMap::new();
    for expense in &expenses {
        *breakdown
            .entry(expense.details.currency.clone())
            .or_default() += expense.details.amount.value();
    }
    let expense_count = expenses.len();

    let total = convert_expenses(converter, expenses, target)
        .iter()
        .map(|d| d.display_amount)
        .sum();

    Total {
        total,
        currency: target.clone(),
        breakdown,
        expense_count,
    }
}

/// Country to currency lookup used when a user has not picked a preferred currency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrencyTable {
    countries: HashMap<String, CurrencyCode>,
    fallback: CurrencyCode,
}

impl CurrencyTable {
    pub fn new(countries: HashMap<String, CurrencyCode>, fallback: CurrencyCode) -> Self {
        let countries = countries
            .into_iter()
            .map(|(country, code)| (country.trim().to_lowercase(), code))
            .collect();
        Self {
            countries,
            fallback,
        }
    }

    pub fn currency_for(&self, country: &str) -> &CurrencyCode {
        self.countries
            .get(&country.trim().to_lowercase())
            .unwrap_or(&self.fallback)
    }
}
