use chrono::{DateTime, Utc};

/// An end user known to the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Borrower {
    pub id: String,
    pub name: String,
    pub phone_number: String,
    pub monthly_income: Option<f64>,
    pub employment_status: Option<String>,
}

/// A lending institution and its catalogue.
#[derive(Clone, Debug, PartialEq)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub products: Vec<Product>,
}

/// A credit product as advertised by a provider.
#[derive(Clone, Debug, PartialEq)]
pub struct Product {
    pub id: String,
    pub provider_id: String,
    pub name: String,
    /// `maxLoan`, 0 when absent.
    pub limit: f64,
    /// `dailyFee.value`, shown as the interest rate.
    pub interest_rate: f64,
    /// `serviceFee.value`.
    pub service_fee: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EligibleProduct {
    pub id: String,
    pub name: String,
    pub limit: f64,
    pub interest_rate: f64,
    pub service_fee: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Eligibility {
    pub credit_score: f64,
    pub products: Vec<EligibleProduct>,
    pub reason: Option<String>,
}

impl Eligibility {
    /// Products the borrower can actually apply for.
    pub fn applicable(&self) -> impl Iterator<Item = &EligibleProduct> {
        self.products.iter().filter(|p| p.limit > 0.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepaymentStatus {
    Paid,
    Unpaid,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Loan {
    pub id: String,
    pub product_id: String,
    pub product_name: String,
    pub loan_amount: f64,
    /// Falls back to `loan_amount` when the backend omits it.
    pub total_repayable_amount: f64,
    pub amount_repaid: f64,
    pub due_date: Option<DateTime<Utc>>,
    pub disbursed_date: Option<DateTime<Utc>>,
    pub repayment_status: RepaymentStatus,
}

impl Loan {
    pub fn is_unpaid(&self) -> bool {
        self.repayment_status == RepaymentStatus::Unpaid
    }

    pub fn outstanding(&self) -> f64 {
        (self.total_repayable_amount - self.amount_repaid).max(0.0)
    }
}

/// Direction of a transaction, derived from the sign of its amount.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    /// Non-negative amount: disbursement.
    Debit,
    /// Negative amount: repayment.
    Credit,
}

impl TransactionKind {
    pub fn from_amount(amount: f64) -> Self {
        if amount >= 0.0 {
            Self::Debit
        } else {
            Self::Credit
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub id: String,
    pub date: Option<DateTime<Utc>>,
    pub description: String,
    pub amount: f64,
    pub kind: TransactionKind,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoanApplication {
    pub borrower_id: String,
    pub product_id: String,
    pub amount: f64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplicationReceipt {
    pub loan_id: String,
}

/// Order transactions newest first and keep at most `limit`.
///
/// Undated entries sort after every dated one; ties keep backend order.
pub fn recent_transactions(mut txns: Vec<Transaction>, limit: usize) -> Vec<Transaction> {
    txns.sort_by(|a, b| b.date.cmp(&a.date));
    txns.truncate(limit);
    txns
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn txn(day: Option<u32>, amount: f64) -> Transaction {
        Transaction {
            id: format!("t{day:?}"),
            date: day.map(|d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()),
            description: "x".to_string(),
            amount,
            kind: TransactionKind::from_amount(amount),
        }
    }

    #[test]
    fn kind_follows_sign() {
        assert_eq!(TransactionKind::from_amount(0.0), TransactionKind::Debit);
        assert_eq!(TransactionKind::from_amount(10.0), TransactionKind::Debit);
        assert_eq!(TransactionKind::from_amount(-0.5), TransactionKind::Credit);
    }

    #[test]
    fn recent_transactions_keeps_newest_ten_descending() {
        let days = [3, 17, 1, 9, 22, 5, 14, 28, 11, 2, 19, 7];
        let txns: Vec<_> = days.iter().map(|d| txn(Some(*d), 1.0)).collect();
        let out = recent_transactions(txns, 10);
        let got: Vec<u32> = out
            .iter()
            .map(|t| chrono::Datelike::day(&t.date.unwrap()))
            .collect();
        assert_eq!(got, vec![28, 22, 19, 17, 14, 11, 9, 7, 5, 3]);
    }

    #[test]
    fn undated_transactions_sort_last() {
        let out = recent_transactions(vec![txn(None, 1.0), txn(Some(4), 1.0)], 10);
        assert!(out[0].date.is_some());
        assert!(out[1].date.is_none());
    }
}
