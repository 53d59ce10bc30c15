//! Backend JSON shapes and their normalization into core entities.
//!
//! The backend is loose about types: ids arrive as strings or numbers, amounts
//! as numbers or decimal strings, and several fields are optional or renamed
//! between versions.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{de::Error as _, Deserialize, Deserializer};
use serde_json::Value;

use loanbot_core::{
    api::types::{
        Borrower, Eligibility, EligibleProduct, Loan, Product, Provider, RepaymentStatus,
        Transaction, TransactionKind,
    },
    errors::Error,
    Result,
};

// ============== Lenient scalar decoding ==============

fn id_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(D::Error::custom(format!("expected an id, got {other}"))),
    }
}

fn opt_id_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(D::Error::custom(format!("expected an id, got {other}"))),
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn flex_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    let v = Value::deserialize(d)?;
    number(&v).ok_or_else(|| D::Error::custom(format!("expected a number, got {v}")))
}

fn opt_flex_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<f64>, D::Error> {
    let v = Value::deserialize(d)?;
    if v.is_null() {
        return Ok(None);
    }
    number(&v)
        .map(Some)
        .ok_or_else(|| D::Error::custom(format!("expected a number, got {v}")))
}

/// RFC 3339, naive date-time (taken as UTC), or a bare date.
pub(crate) fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub(crate) fn decode<T: for<'de> Deserialize<'de>>(what: &str, body: &str) -> Result<T> {
    serde_json::from_str(body)
        .map_err(|e| Error::backend(format!("malformed {what} response: {e}")))
}

// ============== Borrowers ==============

/// `GET /ussd/borrowers?phoneNumber=` comes in two shapes depending on backend version.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum BorrowerLookup {
    Records(Vec<BorrowerRecord>),
    Provisioned(ProvisionedEnvelope),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProvisionedEnvelope {
    #[serde(default, deserialize_with = "opt_id_string")]
    borrower_id: Option<String>,
    #[serde(default)]
    provisioned_data: Option<Vec<ProvisionedEntry>>,
}

#[derive(Debug, Deserialize)]
struct ProvisionedEntry {
    /// JSON document encoded as a string.
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BorrowerRecord {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default)]
    full_name: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, deserialize_with = "opt_flex_f64")]
    monthly_income: Option<f64>,
    #[serde(default)]
    employment_status: Option<String>,
}

impl BorrowerLookup {
    pub(crate) fn into_borrower(self, phone: &str) -> Result<Borrower> {
        let not_found = || Error::NotFound(format!("no borrower registered for {phone}"));
        match self {
            Self::Records(records) => {
                let r = records.into_iter().next().ok_or_else(not_found)?;
                Ok(Borrower {
                    name: r.full_name.or(r.name).unwrap_or_else(|| "there".to_string()),
                    id: r.id,
                    phone_number: phone.to_string(),
                    monthly_income: r.monthly_income,
                    employment_status: r.employment_status,
                })
            }
            Self::Provisioned(env) => {
                let id = env.borrower_id.ok_or_else(not_found)?;
                let entry = env
                    .provisioned_data
                    .and_then(|v| v.into_iter().next())
                    .ok_or_else(not_found)?;
                let data: Value = serde_json::from_str(&entry.data).map_err(|e| {
                    Error::backend(format!("malformed provisioned borrower data: {e}"))
                })?;

                Ok(Borrower {
                    id,
                    name: data
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or("there")
                        .to_string(),
                    phone_number: phone.to_string(),
                    monthly_income: data.get("salary").and_then(number),
                    // Provisioned records do not carry it.
                    employment_status: Some("Employed".to_string()),
                })
            }
        }
    }
}

// ============== Providers / products ==============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProviderWire {
    #[serde(deserialize_with = "id_string")]
    id: String,
    name: String,
    #[serde(default)]
    products: Option<Vec<ProductWire>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductWire {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, deserialize_with = "opt_flex_f64")]
    max_loan: Option<f64>,
    #[serde(default)]
    daily_fee: Option<FeeWire>,
    #[serde(default)]
    service_fee: Option<FeeWire>,
}

#[derive(Debug, Deserialize)]
struct FeeWire {
    #[serde(default, deserialize_with = "opt_flex_f64")]
    value: Option<f64>,
}

fn fee(f: Option<FeeWire>) -> f64 {
    f.and_then(|f| f.value).unwrap_or(0.0)
}

impl From<ProviderWire> for Provider {
    fn from(p: ProviderWire) -> Self {
        let products = p
            .products
            .unwrap_or_default()
            .into_iter()
            .map(|prod| Product {
                name: prod.name.unwrap_or_else(|| prod.id.clone()),
                id: prod.id,
                provider_id: p.id.clone(),
                limit: prod.max_loan.unwrap_or(0.0),
                interest_rate: fee(prod.daily_fee),
                service_fee: fee(prod.service_fee),
            })
            .collect();
        Provider {
            id: p.id,
            name: p.name,
            products,
        }
    }
}

// ============== Eligibility ==============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EligibilityWire {
    #[serde(default, deserialize_with = "opt_flex_f64")]
    score: Option<f64>,
    #[serde(default)]
    limits: Vec<LimitWire>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LimitWire {
    #[serde(deserialize_with = "id_string")]
    product_id: String,
    #[serde(default)]
    product_name: Option<String>,
    #[serde(default, deserialize_with = "opt_flex_f64")]
    limit: Option<f64>,
}

impl EligibilityWire {
    /// Fees come from the cached catalogue; unknown products show zero fees.
    pub(crate) fn normalize(self, lookup: impl Fn(&str) -> Option<Product>) -> Eligibility {
        let products = self
            .limits
            .into_iter()
            .map(|l| {
                let base = lookup(&l.product_id);
                EligibleProduct {
                    name: l
                        .product_name
                        .or_else(|| base.as_ref().map(|b| b.name.clone()))
                        .unwrap_or_else(|| l.product_id.clone()),
                    limit: l.limit.unwrap_or(0.0),
                    interest_rate: base.as_ref().map(|b| b.interest_rate).unwrap_or(0.0),
                    service_fee: base.as_ref().map(|b| b.service_fee).unwrap_or(0.0),
                    id: l.product_id,
                }
            })
            .collect();
        Eligibility {
            credit_score: self.score.unwrap_or(0.0),
            products,
            reason: self.reason.filter(|r| !r.trim().is_empty()),
        }
    }
}

// ============== Loans ==============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LoanWire {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default, deserialize_with = "opt_id_string")]
    product_id: Option<String>,
    #[serde(default)]
    product_name: Option<String>,
    #[serde(default, deserialize_with = "opt_flex_f64")]
    loan_amount: Option<f64>,
    #[serde(default, deserialize_with = "opt_flex_f64")]
    total_repayable_amount: Option<f64>,
    /// Current backend name.
    #[serde(default, deserialize_with = "opt_flex_f64")]
    repaid_amount: Option<f64>,
    /// Older backend name.
    #[serde(default, deserialize_with = "opt_flex_f64")]
    amount_repaid: Option<f64>,
    #[serde(default)]
    due_date: Option<String>,
    #[serde(default)]
    disbursed_date: Option<String>,
    #[serde(default)]
    repayment_status: Option<String>,
}

impl LoanWire {
    pub(crate) fn normalize(self, product_name: impl Fn(&str) -> Option<String>) -> Loan {
        let loan_amount = self.loan_amount.unwrap_or(0.0);
        let total = self.total_repayable_amount.unwrap_or(loan_amount);
        let repaid = self.repaid_amount.or(self.amount_repaid).unwrap_or(0.0);
        let product_id = self.product_id.unwrap_or_default();

        let repayment_status = match self.repayment_status.as_deref().map(str::trim) {
            Some(s) if s.eq_ignore_ascii_case("paid") => RepaymentStatus::Paid,
            Some(_) => RepaymentStatus::Unpaid,
            None if total > 0.0 && repaid >= total => RepaymentStatus::Paid,
            None => RepaymentStatus::Unpaid,
        };

        Loan {
            product_name: self
                .product_name
                .or_else(|| product_name(&product_id))
                .unwrap_or_else(|| "Loan".to_string()),
            id: self.id,
            product_id,
            loan_amount,
            total_repayable_amount: total,
            amount_repaid: repaid,
            due_date: self.due_date.as_deref().and_then(parse_date),
            disbursed_date: self.disbursed_date.as_deref().and_then(parse_date),
            repayment_status,
        }
    }
}

// ============== Transactions ==============

#[derive(Debug, Deserialize)]
pub(crate) struct TransactionWire {
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(deserialize_with = "flex_f64")]
    amount: f64,
}

impl From<TransactionWire> for Transaction {
    fn from(t: TransactionWire) -> Self {
        let raw_date = t.date.unwrap_or_default();
        Transaction {
            id: format!("txn-{raw_date}-{}", t.amount),
            date: parse_date(&raw_date),
            description: t.description.unwrap_or_default(),
            amount: t.amount,
            kind: TransactionKind::from_amount(t.amount),
        }
    }
}

/// Loan id from an application response, if the backend returned one.
pub(crate) fn loan_id_from(body: &Value) -> Option<String> {
    ["id", "loanId"].iter().find_map(|k| match body.get(*k)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
