//! Core expense record and the value types it is built from
use super::error::ValidationError;
use super::user::{CompanyId, UserId};
use super::utils::{EXPENSE_HRP, new_uuid_to_bech32};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
pub enum Category {
    #[n(0)]
    Travel,
    #[n(1)]
    Food,
    #[n(2)]
    Accommodation,
    #[n(3)]
    Transportation,
    #[n(4)]
    OfficeSupplies,
    #[n(5)]
    Entertainment,
    #[n(6)]
    Training,
    #[n(7)]
    Software,
    #[n(8)]
    Hardware,
    #[n(9)]
    Other,
}

/// Workflow position of an expense.
///
/// `Pending -> ApprovedByManager -> Approved -> Reimbursed`, with `Rejected`
/// reachable from the first two. Nothing ever moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
pub enum ExpenseStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    ApprovedByManager,
    #[n(2)]
    Approved,
    #[n(3)]
    Rejected,
    #[n(4)]
    Reimbursed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
#[cbor(transparent)]
pub struct ExpenseId(#[n(0)] String);

// three letter ISO 4217 code, always stored upper case
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, minicbor::Encode, minicbor::Decode)]
#[cbor(transparent)]
pub struct CurrencyCode(#[n(0)] String);

// non-negative monetary amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Amount(Decimal);

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>)
where
    T::Offset: Copy;

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Receipt {
    #[n(0)]
    pub url: String,
    #[n(1)]
    pub public_id: Option<String>,
}

/// Submitted fields of an expense. Only ever constructed through [`ExpenseDraft`].
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ExpenseDetails {
    #[n(0)]
    pub title: String,
    #[n(1)]
    pub description: Option<String>,
    #[n(2)]
    pub amount: Amount,
    #[n(3)]
    pub currency: CurrencyCode,
    #[n(4)]
    pub category: Category,
    #[n(5)]
    pub date: TimeStamp<Utc>,
    #[n(6)]
    pub receipt: Option<Receipt>,
    #[n(7)]
    pub notes: Option<String>,
}

// Used both for new submissions and for partial updates of pending expenses
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpenseDraft {
    title: Option<String>,
    description: Option<String>,
    amount: Option<Decimal>,
    currency: Option<String>,
    category: Option<Category>,
    date: Option<TimeStamp<Utc>>,
    receipt: Option<Receipt>,
    notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Approval {
    #[n(0)]
    pub by: UserId,
    #[n(1)]
    pub at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Rejection {
    #[n(0)]
    pub by: UserId,
    #[n(1)]
    pub at: TimeStamp<Utc>,
    #[n(2)]
    pub reason: String, // never empty
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Expense {
    #[n(0)]
    pub id: ExpenseId,
    #[n(1)]
    pub company: CompanyId,
    #[n(2)]
    pub submitted_by: UserId,
    #[n(3)]
    pub details: ExpenseDetails,
    #[n(4)]
    pub(crate) status: ExpenseStatus,
    #[n(5)]
    pub(crate) manager_approval: Option<Approval>,
    #[n(6)]
    pub(crate) admin_approval: Option<Approval>,
    #[n(7)]
    pub(crate) rejection: Option<Rejection>,
    #[n(8)]
    pub created_at: TimeStamp<Utc>,
    #[n(9)]
    pub(crate) updated_at: TimeStamp<Utc>,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Self::Travel,
        Self::Food,
        Self::Accommodation,
        Self::Transportation,
        Self::OfficeSupplies,
        Self::Entertainment,
        Self::Training,
        Self::Software,
        Self::Hardware,
        Self::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Travel => "Travel",
            Self::Food => "Food",
            Self::Accommodation => "Accommodation",
            Self::Transportation => "Transportation",
            Self::OfficeSupplies => "Office Supplies",
            Self::Entertainment => "Entertainment",
            Self::Training => "Training",
            Self::Software => "Software",
            Self::Hardware => "Hardware",
            Self::Other => "Other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim();
        if wanted.is_empty() {
            return Err(ValidationError::MissingCategory);
        }
        // accept "Office Supplies", "office supplies" and "office_supplies"
        let normalised = wanted.replace(['_', '-'], " ");
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(&normalised))
            .ok_or_else(|| ValidationError::UnknownCategory(wanted.to_string()))
    }
}

impl ExpenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::ApprovedByManager => "approved_by_manager",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Reimbursed => "reimbursed",
        }
    }
    /// Whether the submitter may still edit or delete the expense.
    pub fn is_editable(&self) -> bool {
        matches!(self, Self::Pending)
    }
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Reimbursed)
    }
    /// The only forward edges of the workflow graph.
    pub fn may_transition_to(&self, next: ExpenseStatus) -> bool {
        use ExpenseStatus::*;
        matches!(
            (self, next),
            (Pending, ApprovedByManager)
                | (Pending, Rejected)
                | (ApprovedByManager, Approved)
                | (ApprovedByManager, Rejected)
                | (Approved, Reimbursed)
        )
    }
}

impl fmt::Display for ExpenseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ExpenseStatus {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "approved_by_manager" => Ok(Self::ApprovedByManager),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "reimbursed" => Ok(Self::Reimbursed),
            other => Err(ValidationError::UnknownStatus(other.to_string())),
        }
    }
}

impl ExpenseId {
    pub fn generate() -> anyhow::Result<Self> {
        Ok(Self(new_uuid_to_bech32(EXPENSE_HRP)?))
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ExpenseId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ExpenseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl CurrencyCode {
    pub fn parse(code: &str) -> Result<Self, ValidationError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(ValidationError::MissingCurrency);
        }
        if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ValidationError::InvalidCurrency(code.to_string()));
        }
        Ok(Self(code.to_ascii_uppercase()))
    }
    pub fn usd() -> Self {
        Self("USD".to_string())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for CurrencyCode {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, ValidationError> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(ValidationError::NegativeAmount);
        }
        Ok(Self(value))
    }
    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Option<Self> {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .map(Self)
    }
    /// Midnight UTC of the given calendar day.
    pub fn from_date(date: NaiveDate) -> Option<Self> {
        date.and_hms_opt(0, 0, 0).map(|dt| Self(dt.and_utc()))
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
}

// chrono orders `DateTime` by instant without requiring `Ord` on the zone
impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T>
where
    T::Offset: Copy,
{
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl fmt::Display for TimeStamp<Utc> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl ExpenseDraft {
    /// Construct an empty draft; set the fields that should be submitted or changed.
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }
    pub fn set_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
    pub fn set_amount(mut self, amount: Decimal) -> Self {
        self.amount = Some(amount);
        self
    }
    pub fn set_currency(mut self, currency: &str) -> Self {
        self.currency = Some(currency.to_string());
        self
    }
    pub fn set_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }
    pub fn set_date(mut self, date: TimeStamp<Utc>) -> Self {
        self.date = Some(date);
        self
    }
    pub fn set_receipt(mut self, receipt: Receipt) -> Self {
        self.receipt = Some(receipt);
        self
    }
    pub fn set_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Checks every required field and produces the details of a new submission.
    pub fn validate_and_finalise(&self) -> Result<ExpenseDetails, ValidationError> {
        let title = non_empty(self.title.as_deref()).ok_or(ValidationError::MissingTitle)?;
        let amount = Amount::new(self.amount.ok_or(ValidationError::MissingAmount)?)?;
        let currency = CurrencyCode::parse(
            self.currency
                .as_deref()
                .ok_or(ValidationError::MissingCurrency)?,
        )?;
        let category = self.category.ok_or(ValidationError::MissingCategory)?;
        let date = storable(self.date.ok_or(ValidationError::MissingDate)?)?;

        Ok(ExpenseDetails {
            title,
            description: non_empty(self.description.as_deref()),
            amount,
            currency,
            category,
            date,
            receipt: self.receipt.clone(),
            notes: non_empty(self.notes.as_deref()),
        })
    }

    /// Applies the fields set on this draft over `current`, leaving the rest untouched.
    pub fn merge_into(&self, current: &ExpenseDetails) -> Result<ExpenseDetails, ValidationError> {
        let mut merged = current.clone();

        if let Some(title) = self.title.as_deref() {
            merged.title = non_empty(Some(title)).ok_or(ValidationError::MissingTitle)?;
        }
        if let Some(description) = self.description.as_deref() {
            merged.description = non_empty(Some(description));
        }
        if let Some(amount) = self.amount {
            merged.amount = Amount::new(amount)?;
        }
        if let Some(currency) = self.currency.as_deref() {
            merged.currency = CurrencyCode::parse(currency)?;
        }
        if let Some(category) = self.category {
            merged.category = category;
        }
        if let Some(date) = self.date {
            merged.date = storable(date)?;
        }
        if let Some(receipt) = &self.receipt {
            merged.receipt = Some(receipt.clone());
        }
        if let Some(notes) = self.notes.as_deref() {
            merged.notes = non_empty(Some(notes));
        }

        Ok(merged)
    }
}

// dates are persisted as i64 nanoseconds, roughly years 1677 to 2262
fn storable(date: TimeStamp<Utc>) -> Result<TimeStamp<Utc>, ValidationError> {
    match date.0.timestamp_nanos_opt() {
        Some(_) => Ok(date),
        None => Err(ValidationError::InvalidDate(date.0.date_naive().to_string())),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Expense {
    /// A freshly submitted expense. Always starts out pending.
    pub fn new(
        id: ExpenseId,
        company: CompanyId,
        submitted_by: UserId,
        details: ExpenseDetails,
        now: TimeStamp<Utc>,
    ) -> Self {
        Self {
            id,
            company,
            submitted_by,
            details,
            status: ExpenseStatus::Pending,
            manager_approval: None,
            admin_approval: None,
            rejection: None,
            created_at: now,
            updated_at: now,
        }
    }
    pub fn status(&self) -> ExpenseStatus {
        self.status
    }
    pub fn manager_approval(&self) -> Option<&Approval> {
        self.manager_approval.as_ref()
    }
    pub fn admin_approval(&self) -> Option<&Approval> {
        self.admin_approval.as_ref()
    }
    pub fn rejection(&self) -> Option<&Rejection> {
        self.rejection.as_ref()
    }
    pub fn updated_at(&self) -> TimeStamp<Utc> {
        self.updated_at
    }
    // final approver; mirrors the admin approval
    pub fn approved_by(&self) -> Option<&UserId> {
        self.admin_approval.as_ref().map(|a| &a.by)
    }
    pub fn approved_at(&self) -> Option<TimeStamp<Utc>> {
        self.admin_approval.as_ref().map(|a| a.at)
    }
    pub(crate) fn replace_details(&mut self, details: ExpenseDetails, now: TimeStamp<Utc>) {
        self.details = details;
        self.updated_at = now;
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

// rust_decimal's own 16 byte layout keeps scale and sign exactly
impl<C> minicbor::Encode<C> for Amount {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        e.bytes(&self.0.serialize())?.ok()
    }
}

impl<'b, C> minicbor::Decode<'b, C> for Amount {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let bytes: [u8; 16] = d
            .bytes()?
            .try_into()
            .map_err(|_| minicbor::decode::Error::message("amount must be 16 bytes"))?;

        Ok(Amount(Decimal::deserialize(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taxi() -> ExpenseDraft {
        ExpenseDraft::new()
            .set_title("Taxi")
            .set_amount(Decimal::new(50, 0))
            .set_currency("usd")
            .set_category(Category::Transportation)
            .set_date(TimeStamp::new_with(2024, 6, 15, 0, 0, 0).unwrap())
    }

    #[test]
    fn timestamp_encoding() {
        let original = TimeStamp::new();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: TimeStamp<Utc> = minicbor::decode(&encoding).unwrap();

        assert_eq!(original, decode);
    }

    #[test]
    fn amount_keeps_its_scale() {
        let original = Amount::new(Decimal::new(1999, 2)).unwrap();

        let encoding = minicbor::to_vec(original).unwrap();
        let decode: Amount = minicbor::decode(&encoding).unwrap();

        assert_eq!(decode.value().to_string(), "19.99");
    }

    #[test]
    fn finalise_normalises_fields() {
        let details = taxi()
            .set_title("  Taxi  ")
            .set_notes("   ")
            .validate_and_finalise()
            .unwrap();

        assert_eq!(details.title, "Taxi");
        assert_eq!(details.currency.as_str(), "USD");
        assert_eq!(details.notes, None);
    }

    #[test]
    fn finalise_reports_the_first_missing_field() {
        let missing_title = taxi().set_title(" ");
        assert_eq!(
            missing_title.validate_and_finalise(),
            Err(ValidationError::MissingTitle)
        );

        let no_date = ExpenseDraft::new()
            .set_title("Lunch")
            .set_amount(Decimal::ONE)
            .set_currency("EUR")
            .set_category(Category::Food);
        assert_eq!(no_date.validate_and_finalise(), Err(ValidationError::MissingDate));
    }

    #[test]
    fn negative_amount_is_rejected_but_zero_is_fine() {
        let negative = taxi().set_amount(Decimal::new(-1, 0));
        assert_eq!(
            negative.validate_and_finalise(),
            Err(ValidationError::NegativeAmount)
        );

        assert!(taxi().set_amount(Decimal::ZERO).validate_and_finalise().is_ok());
    }

    #[test]
    fn currency_codes_must_be_three_letters() {
        assert!(CurrencyCode::parse("eur").is_ok());
        assert_eq!(
            CurrencyCode::parse("EURO"),
            Err(ValidationError::InvalidCurrency("EURO".into()))
        );
        assert_eq!(CurrencyCode::parse(""), Err(ValidationError::MissingCurrency));
    }

    #[test]
    fn merge_only_touches_supplied_fields() {
        let current = taxi().set_notes("airport").validate_and_finalise().unwrap();
        let merged = ExpenseDraft::new()
            .set_amount(Decimal::new(65, 0))
            .merge_into(&current)
            .unwrap();

        assert_eq!(merged.amount.value(), Decimal::new(65, 0));
        assert_eq!(merged.title, "Taxi");
        assert_eq!(merged.notes.as_deref(), Some("airport"));
    }

    #[test]
    fn categories_parse_from_display_names() {
        assert_eq!(
            "office supplies".parse::<Category>().unwrap(),
            Category::OfficeSupplies
        );
        assert_eq!(
            "Office_Supplies".parse::<Category>().unwrap(),
            Category::OfficeSupplies
        );
        assert!(matches!(
            "Snacks".parse::<Category>(),
            Err(ValidationError::UnknownCategory(_))
        ));
    }

    #[test]
    fn timestamps_order_by_instant() {
        let earlier = TimeStamp::new_with(2024, 1, 31, 23, 59, 59).unwrap();
        let later = TimeStamp::new_with(2024, 2, 1, 0, 0, 0).unwrap();

        assert!(earlier < later);
        assert_eq!(later.max(earlier), later);
        let mut sorted = vec![later, earlier];
        sorted.sort();
        assert_eq!(sorted, vec![earlier, later]);
    }

    #[test]
    fn dates_outside_the_encodable_range_are_invalid() {
        let far_future = TimeStamp::new_with(2300, 1, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            taxi().set_date(far_future).validate_and_finalise(),
            Err(ValidationError::InvalidDate(_))
        ));

        let current = taxi().validate_and_finalise().unwrap();
        let too_early = ExpenseDraft::new().set_date(TimeStamp::new_with(1600, 6, 1, 0, 0, 0).unwrap());
        assert!(matches!(
            too_early.merge_into(&current),
            Err(ValidationError::InvalidDate(_))
        ));
    }

    #[test]
    fn status_graph_only_moves_forward() {
        use ExpenseStatus::*;
        let all = [Pending, ApprovedByManager, Approved, Rejected, Reimbursed];

        for from in all {
            for to in all {
                if from.may_transition_to(to) {
                    assert!(from < to, "{from} -> {to} moves backwards");
                }
            }
            if from.is_terminal() {
                assert!(all.iter().all(|to| !from.may_transition_to(*to)));
            }
        }
    }
}
