//! HTTP adapter for the loan-management REST backend.
//!
//! Implements [`LoanApi`] over `reqwest`. Every call is a single request bounded
//! by the configured timeout; transport failures, timeouts and non-2xx replies
//! all surface as [`Error::BackendUnavailable`].

mod wire;

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use chrono::{SecondsFormat, TimeDelta, Utc};
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use loanbot_core::{
    api::{
        client::LoanApi,
        types::{
            ApplicationReceipt, Borrower, Eligibility, Loan, LoanApplication, Product, Provider,
            Transaction,
        },
    },
    config::Config,
    errors::Error,
    Result,
};

use wire::{
    decode, loan_id_from, BorrowerLookup, EligibilityWire, LoanWire, ProviderWire, TransactionWire,
};

const DEFAULT_LOAN_TERM_DAYS: i64 = 30;

#[derive(Debug)]
pub struct HttpLoanApi {
    base: Url,
    http: reqwest::Client,
    loan_term_days: i64,
    /// productId -> product, filled by `list_providers`.
    products: RwLock<HashMap<String, Product>>,
}

impl HttpLoanApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid LOAN_API_BASE_URL {base_url:?}: {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "LOAN_API_BASE_URL {base_url:?} cannot carry a path"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("http client build error: {e}")))?;
        Ok(Self {
            base,
            http,
            loan_term_days: DEFAULT_LOAN_TERM_DAYS,
            products: RwLock::new(HashMap::new()),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self::new(&cfg.api_base_url, cfg.api_timeout)?.with_loan_term_days(cfg.loan_term_days))
    }

    pub fn with_loan_term_days(mut self, days: i64) -> Self {
        self.loan_term_days = days;
        self
    }

    /// Base URL plus percent-encoded path segments.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("base url {} cannot carry a path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Issue one request and return the raw body of a 2xx reply.
    async fn call(&self, method: Method, url: Url, body: Option<&Value>) -> Result<String> {
        let what = format!("{method} {}", url.path());
        debug!(request = %what, "loan api request");

        let mut req = self.http.request(method, url);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| {
            let kind = if e.is_timeout() { "timed out" } else { "failed" };
            warn!(request = %what, error = %e, "loan api request {kind}");
            Error::backend(format!("{what} {kind}: {e}"))
        })?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| {
            warn!(request = %what, %status, error = %e, "loan api reply body could not be read");
            Error::backend(format!("{what}: reading reply body failed: {e}"))
        })?;
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{what} returned 404")));
        }
        if !status.is_success() {
            warn!(request = %what, %status, "loan api returned an error status");
            return Err(Error::backend(format!(
                "{what} failed: {status} {}",
                text.chars().take(200).collect::<String>()
            )));
        }
        Ok(text)
    }

    async fn get(&self, url: Url) -> Result<String> {
        self.call(Method::GET, url, None).await
    }

    async fn cached_product(&self, product_id: &str) -> Option<Product> {
        self.products.read().await.get(product_id).cloned()
    }

    async fn ensure_products(&self) -> Result<()> {
        if self.products.read().await.is_empty() {
            self.list_providers().await?;
        }
        Ok(())
    }
}

/// A 404 on a collection endpoint is a backend fault, not a missing record.
fn not_found_as_unavailable(e: Error) -> Error {
    match e {
        Error::NotFound(msg) => Error::backend(msg),
        other => other,
    }
}

#[async_trait]
impl LoanApi for HttpLoanApi {
    async fn find_borrower_by_phone(&self, phone: &str) -> Result<Borrower> {
        let mut url = self.url(&["ussd", "borrowers"])?;
        url.query_pairs_mut().append_pair("phoneNumber", phone);

        let body = self.get(url).await.map_err(|e| match e {
            Error::NotFound(_) => Error::NotFound(format!("no borrower registered for {phone}")),
            other => other,
        })?;
        if body.trim().is_empty() {
            return Err(Error::NotFound(format!("no borrower registered for {phone}")));
        }
        decode::<BorrowerLookup>("borrower", &body)?.into_borrower(phone)
    }

    async fn list_providers(&self) -> Result<Vec<Provider>> {
        let body = self
            .get(self.url(&["providers"])?)
            .await
            .map_err(not_found_as_unavailable)?;
        let providers: Vec<Provider> = decode::<Vec<ProviderWire>>("providers", &body)?
            .into_iter()
            .map(Provider::from)
            .collect();

        let mut cache = self.products.write().await;
        for product in providers.iter().flat_map(|p| &p.products) {
            cache.insert(product.id.clone(), product.clone());
        }
        debug!(providers = providers.len(), products = cache.len(), "product cache refreshed");
        Ok(providers)
    }

    async fn get_eligibility(&self, borrower_id: &str, provider_id: &str) -> Result<Eligibility> {
        let mut url = self.url(&["ussd", "borrowers", borrower_id, "eligibility"])?;
        url.query_pairs_mut().append_pair("providerId", provider_id);

        let body = self.get(url).await.map_err(not_found_as_unavailable)?;
        let wire: EligibilityWire = decode("eligibility", &body)?;

        let cache = self.products.read().await;
        Ok(wire.normalize(|id| cache.get(id).cloned()))
    }

    async fn list_loans(&self, borrower_id: &str) -> Result<Vec<Loan>> {
        let url = self.url(&["ussd", "borrowers", borrower_id, "loans"])?;
        let body = self.get(url).await.map_err(not_found_as_unavailable)?;
        let wire: Vec<LoanWire> = decode("loans", &body)?;

        let cache = self.products.read().await;
        Ok(wire
            .into_iter()
            .map(|l| l.normalize(|pid| cache.get(pid).map(|p| p.name.clone())))
            .collect())
    }

    async fn list_transactions(&self, borrower_id: &str) -> Result<Vec<Transaction>> {
        let url = self.url(&["ussd", "borrowers", borrower_id, "transactions"])?;
        let body = self.get(url).await.map_err(not_found_as_unavailable)?;
        Ok(decode::<Vec<TransactionWire>>("transactions", &body)?
            .into_iter()
            .map(Transaction::from)
            .collect())
    }

    async fn apply_for_loan(&self, application: &LoanApplication) -> Result<ApplicationReceipt> {
        self.ensure_products().await?;
        let product = self
            .cached_product(&application.product_id)
            .await
            .ok_or_else(|| {
                Error::Validation(
                    "Product details not found. Cannot calculate fees or terms.".to_string(),
                )
            })?;

        let now = Utc::now();
        let due = TimeDelta::try_days(self.loan_term_days)
            .and_then(|term| now.checked_add_signed(term))
            .ok_or_else(|| {
                Error::Config(format!("loan term of {} days is out of range", self.loan_term_days))
            })?;
        let request = json!({
            "productId": application.product_id,
            "borrowerId": application.borrower_id,
            "loanAmount": application.amount,
            "serviceFee": product.service_fee,
            "penaltyAmount": 0,
            "disbursedDate": now.to_rfc3339_opts(SecondsFormat::Millis, true),
            "dueDate": due.to_rfc3339_opts(SecondsFormat::Millis, true),
            "repaymentStatus": "Unpaid",
        });

        let body = self
            .call(Method::POST, self.url(&["loans"])?, Some(&request))
            .await
            .map_err(not_found_as_unavailable)?;
        let reply: Value = serde_json::from_str(&body).unwrap_or(Value::Null);

        Ok(ApplicationReceipt {
            loan_id: loan_id_from(&reply)
                .unwrap_or_else(|| format!("loan-{}", now.timestamp_millis())),
        })
    }

    async fn repay_loan(&self, loan_id: &str, amount: f64) -> Result<Loan> {
        let request = json!({ "loanId": loan_id, "amount": amount });
        let body = self
            .call(Method::POST, self.url(&["payments"])?, Some(&request))
            .await
            .map_err(not_found_as_unavailable)?;

        // Some backends wrap the record as `{ "loan": {...} }`.
        let mut reply: Value = decode("repayment", &body)?;
        if let Some(inner) = reply.get_mut("loan") {
            reply = inner.take();
        }
        let wire: LoanWire = serde_json::from_value(reply)
            .map_err(|e| Error::backend(format!("could not read repaid loan: {e}")))?;

        let cache = self.products.read().await;
        Ok(wire.normalize(|pid| cache.get(pid).map(|p| p.name.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use loanbot_core::api::types::{RepaymentStatus, TransactionKind};
    use serde_json::json;

    fn api(server: &MockServer) -> HttpLoanApi {
        HttpLoanApi::new(&server.url("/api"), Duration::from_secs(2)).unwrap()
    }

    fn providers_body() -> Value {
        json!([{
            "id": "pr1",
            "name": "Alpha Lending",
            "products": [{ "id": "p1", "name": "Quick Cash", "maxLoan": 5000, "dailyFee": { "value": 0.3 }, "serviceFee": { "value": 15 } }]
        }])
    }

    #[test]
    fn rejects_unusable_base_url() {
        assert!(matches!(
            HttpLoanApi::new("not a url", Duration::from_secs(1)),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn borrower_lookup_sends_normalized_phone() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/ussd/borrowers")
                    .query_param("phoneNumber", "912345678");
                then.status(200).json_body(json!({
                    "borrowerId": "b1",
                    "provisionedData": [{ "data": "{\"name\":\"Alex\",\"salary\":\"12000\"}" }]
                }));
            })
            .await;

        let b = api(&server).find_borrower_by_phone("912345678").await.unwrap();
        m.assert_async().await;
        assert_eq!(b.id, "b1");
        assert_eq!(b.name, "Alex");
        assert_eq!(b.monthly_income, Some(12000.0));
    }

    #[tokio::test]
    async fn borrower_404_and_empty_list_are_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/ussd/borrowers").query_param("phoneNumber", "900000000");
                then.status(404);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/ussd/borrowers").query_param("phoneNumber", "911111111");
                then.status(200).json_body(json!([]));
            })
            .await;

        let api = api(&server);
        assert!(matches!(
            api.find_borrower_by_phone("900000000").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            api.find_borrower_by_phone("911111111").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn server_errors_are_backend_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/providers");
                then.status(503).body("maintenance");
            })
            .await;

        let err = api(&server).list_providers().await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn unreachable_backend_is_backend_unavailable() {
        // Port 9 (discard) is not listening in test environments.
        let api = HttpLoanApi::new("http://127.0.0.1:9/api", Duration::from_millis(500)).unwrap();
        assert!(matches!(
            api.list_providers().await,
            Err(Error::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn eligibility_is_enriched_from_product_cache() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/providers");
                then.status(200).json_body(providers_body());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/api/ussd/borrowers/b1/eligibility")
                    .query_param("providerId", "pr1");
                then.status(200).json_body(json!({
                    "score": 700,
                    "limits": [{ "productId": "p1", "productName": "Quick Cash", "limit": 2500 }]
                }));
            })
            .await;

        let api = api(&server);
        api.list_providers().await.unwrap();
        let e = api.get_eligibility("b1", "pr1").await.unwrap();
        assert_eq!(e.credit_score, 700.0);
        assert_eq!(e.products[0].limit, 2500.0);
        assert_eq!(e.products[0].service_fee, 15.0);
    }

    #[tokio::test]
    async fn loans_and_transactions_are_normalized() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/ussd/borrowers/b1/loans");
                then.status(200).json_body(json!([
                    { "id": 41, "productId": "p1", "loanAmount": "1000", "amountRepaid": 250, "repaymentStatus": "Unpaid" },
                    { "id": "l2", "productId": "p1", "loanAmount": 500, "totalRepayableAmount": 550, "repaidAmount": 550, "repaymentStatus": "Paid" }
                ]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/ussd/borrowers/b1/transactions");
                then.status(200).json_body(json!([
                    { "date": "2024-03-01T08:00:00Z", "description": "Disbursement", "amount": 1000 },
                    { "date": "2024-03-10T08:00:00Z", "description": "Repayment", "amount": -250 }
                ]));
            })
            .await;

        let api = api(&server);
        let loans = api.list_loans("b1").await.unwrap();
        assert_eq!(loans[0].id, "41");
        assert_eq!(loans[0].total_repayable_amount, 1000.0);
        assert_eq!(loans[0].amount_repaid, 250.0);
        assert_eq!(loans[1].repayment_status, RepaymentStatus::Paid);

        let txns = api.list_transactions("b1").await.unwrap();
        assert_eq!(txns[0].kind, TransactionKind::Debit);
        assert_eq!(txns[1].kind, TransactionKind::Credit);
    }

    #[tokio::test]
    async fn apply_loads_catalogue_and_posts_full_body() {
        let server = MockServer::start_async().await;
        let providers = server
            .mock_async(|when, then| {
                when.method(GET).path("/api/providers");
                then.status(200).json_body(providers_body());
            })
            .await;
        let loans = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/loans")
                    .json_body_partial(
                        r#"{"productId":"p1","borrowerId":"b1","loanAmount":1200.0,"serviceFee":15.0,"penaltyAmount":0,"repaymentStatus":"Unpaid"}"#,
                    );
                then.status(201).json_body(json!({ "id": "loan-77" }));
            })
            .await;

        let receipt = api(&server)
            .apply_for_loan(&LoanApplication {
                borrower_id: "b1".to_string(),
                product_id: "p1".to_string(),
                amount: 1200.0,
            })
            .await
            .unwrap();

        providers.assert_async().await;
        loans.assert_async().await;
        assert_eq!(receipt.loan_id, "loan-77");
    }

    #[tokio::test]
    async fn apply_with_unknown_product_is_rejected_before_posting() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/providers");
                then.status(200).json_body(providers_body());
            })
            .await;
        let loans = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/loans");
                then.status(201);
            })
            .await;

        let err = api(&server)
            .apply_for_loan(&LoanApplication {
                borrower_id: "b1".to_string(),
                product_id: "nope".to_string(),
                amount: 100.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(loans.hits_async().await, 0);
    }

    #[tokio::test]
    async fn apply_with_unrepresentable_term_fails_without_posting() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/providers");
                then.status(200).json_body(providers_body());
            })
            .await;
        let loans = server
            .mock_async(|when, then| {
                when.method(POST).path("/api/loans");
                then.status(201).json_body(json!({ "id": "loan-1" }));
            })
            .await;

        let err = api(&server)
            .with_loan_term_days(i64::MAX)
            .apply_for_loan(&LoanApplication {
                borrower_id: "b1".to_string(),
                product_id: "p1".to_string(),
                amount: 100.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(loans.hits_async().await, 0);
    }

    #[tokio::test]
    async fn truncated_reply_body_is_backend_unavailable() {
        use tokio::{
            io::{AsyncReadExt, AsyncWriteExt},
            net::TcpListener,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = sock.read(&mut buf).await;
            // Promise more bytes than are sent, then hang up.
            let _ = sock
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 512\r\n\r\n{\"borrowerId\":")
                .await;
            let _ = sock.shutdown().await;
        });

        let api = HttpLoanApi::new(&format!("http://{addr}/api"), Duration::from_secs(2)).unwrap();
        let err = api.find_borrower_by_phone("912345678").await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn apply_without_id_in_reply_synthesizes_one() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/api/providers");
                then.status(200).json_body(providers_body());
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/loans");
                then.status(204);
            })
            .await;

        let receipt = api(&server)
            .apply_for_loan(&LoanApplication {
                borrower_id: "b1".to_string(),
                product_id: "p1".to_string(),
                amount: 100.0,
            })
            .await
            .unwrap();
        assert!(receipt.loan_id.starts_with("loan-"));
    }

    #[tokio::test]
    async fn repay_posts_payment_and_reads_updated_loan() {
        let server = MockServer::start_async().await;
        let m = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/payments")
                    .json_body(json!({ "loanId": "l1", "amount": 250.0 }));
                then.status(200).json_body(json!({
                    "id": "l1", "productId": "p1", "loanAmount": 1000,
                    "totalRepayableAmount": 1100, "repaidAmount": 500, "repaymentStatus": "Unpaid"
                }));
            })
            .await;

        let loan = api(&server).repay_loan("l1", 250.0).await.unwrap();
        m.assert_async().await;
        assert_eq!(loan.outstanding(), 600.0);
    }

    #[tokio::test]
    async fn repay_with_unreadable_reply_is_backend_unavailable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/payments");
                then.status(200).body("ok");
            })
            .await;

        assert!(matches!(
            api(&server).repay_loan("l1", 10.0).await,
            Err(Error::BackendUnavailable(_))
        ));
    }
}
