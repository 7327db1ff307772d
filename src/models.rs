//! Typed records for the three tables the reconciler reads and writes.
//!
//! Stored rows arrive as loose JSON objects (`row_to_json`). They are decoded
//! here once so the schedule code only ever sees required numeric fields and
//! parsed dates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveDateTime};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// A calendar month, rendered as `yyyy-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn first_day(self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    pub fn last_day(self) -> NaiveDate {
        self.next()
            .first_day()
            .pred_opt()
            .unwrap_or_else(|| self.first_day())
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// The given day of this month, or the month's last day when the day does
    /// not exist (31 in April, 30 in February).
    pub fn day_clamped(self, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, day).unwrap_or_else(|| self.last_day())
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let invalid = || format!("malformed month '{trimmed}', expected yyyy-MM");
        let (year, month) = trimmed.split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year = year.parse::<i32>().map_err(|_| invalid())?;
        let month = month.parse::<u32>().map_err(|_| invalid())?;
        Self::new(year, month).ok_or_else(invalid)
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Adds calendar months, clamping to the end of the target month the way
/// `Jan 31 + 1 month = Feb 28/29` is expected to behave.
pub fn add_months(date: NaiveDate, months: u32) -> NaiveDate {
    date.checked_add_months(Months::new(months))
        .unwrap_or(NaiveDate::MAX)
}

/// Accepts `yyyy-MM-dd` or a timestamp and keeps the date part.
pub fn parse_flexible_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(trimmed)
                .ok()
                .map(|value| value.date_naive())
        })
        .or_else(|| {
            NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|value| value.date())
        })
}

mod flexible_date {
    use chrono::NaiveDate;
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    use super::parse_flexible_date;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDate, D::Error>
    where
        D: Deserializer<'de>,
    {
        match option::deserialize(deserializer)? {
            Some(date) => Ok(date),
            None => Err(D::Error::custom("missing date")),
        }
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<Value>::deserialize(deserializer)? {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(raw)) if raw.trim().is_empty() => Ok(None),
                Some(Value::String(raw)) => parse_flexible_date(&raw)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("malformed date '{raw}'"))),
                Some(other) => Err(D::Error::custom(format!("malformed date '{other}'"))),
            }
        }
    }
}

mod money {
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    /// Numbers, numeric strings and `null` (as 0).
    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(option::deserialize(deserializer)?.unwrap_or(0.0))
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
        where
            D: Deserializer<'de>,
        {
            match Option::<Value>::deserialize(deserializer)? {
                None | Some(Value::Null) => Ok(None),
                Some(Value::Number(number)) => Ok(number.as_f64()),
                Some(Value::String(raw)) if raw.trim().is_empty() => Ok(None),
                Some(Value::String(raw)) => raw
                    .trim()
                    .parse::<f64>()
                    .map(Some)
                    .map_err(|_| D::Error::custom(format!("malformed amount '{raw}'"))),
                Some(other) => Err(D::Error::custom(format!("malformed amount '{other}'"))),
            }
        }
    }
}

mod count {
    use serde::{de::Error, Deserialize, Deserializer};
    use serde_json::Value;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let parsed = match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::Number(number)) => number.as_f64(),
            Some(Value::String(raw)) if raw.trim().is_empty() => return Ok(None),
            Some(Value::String(raw)) => raw.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        match parsed {
            Some(value) if value >= 0.0 && value.fract() == 0.0 && value <= f64::from(u32::MAX) => {
                Ok(Some(value as u32))
            }
            _ => Err(D::Error::custom("expected a non-negative whole number")),
        }
    }
}

fn due_day<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    match count::deserialize(deserializer)? {
        None | Some(0) => Ok(None),
        Some(day) if day <= 31 => Ok(Some(day)),
        Some(day) => Err(serde::de::Error::custom(format!(
            "rent_due_day {day} is outside 1-31"
        ))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaseContract {
    pub id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub unit_id: Option<String>,
    #[serde(with = "flexible_date")]
    pub start_date: NaiveDate,
    #[serde(default, with = "flexible_date::option")]
    pub end_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub base_rent: f64,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub utilities: f64,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub heating: f64,
    #[serde(default, deserialize_with = "due_day")]
    pub rent_due_day: Option<u32>,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub deposit: f64,
    #[serde(default, deserialize_with = "count::deserialize")]
    pub deposit_installments: Option<u32>,
    #[serde(default, with = "flexible_date::option")]
    pub contract_date: Option<NaiveDate>,
}

impl LeaseContract {
    pub fn deposit_installment_count(&self) -> u32 {
        self.deposit_installments.unwrap_or(1).max(1)
    }

    pub fn deposit_anchor_date(&self) -> NaiveDate {
        self.contract_date.unwrap_or(self.start_date)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RentChange {
    #[serde(default)]
    pub id: Option<String>,
    pub contract_id: String,
    #[serde(with = "flexible_date")]
    pub effective_date: NaiveDate,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub base_rent: f64,
    #[serde(default, deserialize_with = "money::option::deserialize")]
    pub utilities: Option<f64>,
    #[serde(default, deserialize_with = "money::option::deserialize")]
    pub heating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PaymentType {
    Rent,
    Deposit,
    Other(String),
}

impl PaymentType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Rent => "rent",
            Self::Deposit => "deposit",
            Self::Other(value) => value,
        }
    }

    /// Types whose rows are derived from the contract schedule.
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Rent | Self::Deposit)
    }
}

impl From<String> for PaymentType {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "rent" => Self::Rent,
            "deposit" => Self::Deposit,
            _ => Self::Other(value),
        }
    }
}

impl Serialize for PaymentType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PaymentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(String::deserialize(deserializer)?.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Partial,
    Paid,
    Other(String),
}

impl PaymentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Paid => "paid",
            Self::Other(value) => value,
        }
    }

    /// Only open obligations may be rewritten or removed by reconciliation.
    pub fn is_mutable(&self) -> bool {
        matches!(self, Self::Pending | Self::Partial)
    }
}

impl From<String> for PaymentStatus {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "partial" => Self::Partial,
            "paid" => Self::Paid,
            _ => Self::Other(value),
        }
    }
}

impl Serialize for PaymentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PaymentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(String::deserialize(deserializer)?.into())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub contract_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub unit_id: Option<String>,
    pub payment_month: YearMonth,
    #[serde(
        default,
        deserialize_with = "flexible_date::option::deserialize",
        serialize_with = "serialize_opt_date"
    )]
    pub payment_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub expected_amount: f64,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub amount: f64,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    #[serde(default)]
    pub reference: Option<String>,
}

fn serialize_opt_date<S: Serializer>(
    value: &Option<NaiveDate>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(date) => serializer.collect_str(&date.format("%Y-%m-%d")),
        None => serializer.serialize_none(),
    }
}

/// A payment row to insert.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewPayment {
    pub contract_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    pub payment_month: YearMonth,
    pub payment_date: NaiveDate,
    pub expected_amount: f64,
    pub amount: f64,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub reference: String,
}

/// Fields reconciliation is allowed to rewrite on an open payment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentPatch {
    pub expected_amount: f64,
    pub payment_date: NaiveDate,
}

/// Decodes a stored row, reporting the table and row id on failure.
pub fn decode_row<T: DeserializeOwned>(table: &str, row: Value) -> AppResult<T> {
    let row_id = row
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    serde_json::from_value(row).map_err(|error| {
        AppError::UnprocessableEntity(format!("Malformed {table} record '{row_id}': {error}"))
    })
}

/// Decodes stored payment rows for reconciliation.
///
/// Open `rent`/`deposit` rows must decode, since they are the only rows the
/// reconciler rewrites or deletes. Rows it never touches (other payment types,
/// settled or unknown statuses) are kept when they decode and skipped when
/// they do not.
pub fn decode_payment_rows(rows: Vec<Value>) -> AppResult<Vec<Payment>> {
    let mut payments = Vec::with_capacity(rows.len());
    for row in rows {
        if is_reconciled_payment_row(&row) {
            payments.push(decode_row("payments", row)?);
            continue;
        }
        match decode_row::<Payment>("payments", row) {
            Ok(payment) => payments.push(payment),
            Err(error) => {
                tracing::debug!(error = %error, "Skipping undecodable payment row outside reconciliation")
            }
        }
    }
    Ok(payments)
}

fn is_reconciled_payment_row(row: &Value) -> bool {
    let text = |field: &str| row.get(field).and_then(Value::as_str).map(ToOwned::to_owned);
    let scheduled = text("payment_type").is_some_and(|raw| PaymentType::from(raw).is_scheduled());
    let open = text("status").is_some_and(|raw| PaymentStatus::from(raw).is_mutable());
    scheduled && open
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
