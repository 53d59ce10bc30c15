use async_trait::async_trait;

use crate::Result;

use super::types::*;

/// Port for the remote loan backend.
///
/// Every call is a single request with no retry. Failures surface as
/// `Error::NotFound`, `Error::Validation` or `Error::BackendUnavailable`.
#[async_trait]
pub trait LoanApi: Send + Sync {
    /// Look up a borrower by an already-normalized 9-digit phone number.
    async fn find_borrower_by_phone(&self, phone: &str) -> Result<Borrower>;

    /// List providers in backend order. Also refreshes the product cache.
    async fn list_providers(&self) -> Result<Vec<Provider>>;

    async fn get_eligibility(&self, borrower_id: &str, provider_id: &str) -> Result<Eligibility>;

    /// All loans of a borrower, paid and unpaid, in backend order.
    async fn list_loans(&self, borrower_id: &str) -> Result<Vec<Loan>>;

    /// Transactions in backend order (not sorted).
    async fn list_transactions(&self, borrower_id: &str) -> Result<Vec<Transaction>>;

    async fn apply_for_loan(&self, application: &LoanApplication) -> Result<ApplicationReceipt>;

    async fn repay_loan(&self, loan_id: &str, amount: f64) -> Result<Loan>;
}
