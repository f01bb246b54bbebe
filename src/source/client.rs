//! HTTP client for the transaction-management source.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

use crate::error::{Error, Result};

use super::types::{
    AnalystNote, CaseLink, ReviewRecord, RuleMatch, SourceHealth, TransactionQuery,
    TransactionRecord,
};
use super::TransactionSource;

/// Configuration for the transaction-source client.
#[derive(Debug, Clone)]
pub struct SourceClientConfig {
    /// Base URL of the transaction-management API.
    pub base_url: String,
    /// Bearer token, if the deployment requires one.
    pub api_token: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Max attempts per request (exponential backoff between attempts).
    pub max_attempts: u32,
}

impl SourceClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: None,
            timeout_secs: 10,
            max_attempts: 3,
        }
    }

    pub fn with_api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// Reqwest-backed [`TransactionSource`]. A single HTTP client instance is
/// built at construction and reused across retries.
pub struct HttpTransactionSource {
    config: SourceClientConfig,
    http: Client,
}

impl HttpTransactionSource {
    pub fn new(config: SourceClientConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();

        Self { config, http }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// GET with exponential backoff on transient connection errors.
    ///
    /// 4xx responses are terminal; 5xx and transport errors retry up to
    /// `max_attempts`.
    async fn get_with_retry(&self, path: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let url = self.url(path);
        let mut last_error = None;

        for attempt in 0..self.config.max_attempts.max(1) {
            if attempt > 0 {
                let backoff = Duration::from_millis(100 * (1 << attempt.min(6)));
                tokio::time::sleep(backoff).await;
            }

            let mut request = self.http.get(&url).query(query);
            if let Some(token) = &self.config.api_token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) if response.status().is_server_error() => {
                    last_error = Some(Error::dependency(
                        "transaction-source",
                        format!("{} returned {}", path, response.status()),
                    ));
                }
                Ok(response) => return Ok(response),
                Err(e) if e.is_timeout() => {
                    last_error = Some(Error::timeout(self.config.timeout_secs * 1000));
                }
                Err(e) => {
                    last_error = Some(Error::dependency(
                        "transaction-source",
                        format!("request failed: {}", e),
                    ));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::dependency("transaction-source", "no attempts made")))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self.get_with_retry(path, query).await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("{} not found", path)));
        }
        if !status.is_success() {
            return Err(Error::dependency(
                "transaction-source",
                format!("{} returned {}", path, status),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::dependency("transaction-source", format!("bad payload: {}", e)))
    }
}

#[async_trait]
impl TransactionSource for HttpTransactionSource {
    async fn get_transaction_overview(&self, transaction_id: &str) -> Result<TransactionRecord> {
        self.get_json(&format!("/v1/transactions/{}", transaction_id), &[])
            .await
    }

    async fn query_transactions(&self, query: &TransactionQuery) -> Result<Vec<TransactionRecord>> {
        let mut params = vec![("window_hours", query.window_hours.to_string())];
        if let Some(card_id) = &query.card_id {
            params.push(("card_id", card_id.clone()));
        }
        if let Some(merchant_id) = &query.merchant_id {
            params.push(("merchant_id", merchant_id.clone()));
        }
        if let Some(ip) = &query.ip_address {
            params.push(("ip_address", ip.clone()));
        }
        if let Some(device_id) = &query.device_id {
            params.push(("device_id", device_id.clone()));
        }
        self.get_json("/v1/transactions", &params).await
    }

    async fn get_rule_matches(&self, transaction_id: &str) -> Result<Vec<RuleMatch>> {
        self.get_json(&format!("/v1/transactions/{}/rule-matches", transaction_id), &[])
            .await
    }

    async fn get_reviews(&self, transaction_id: &str) -> Result<Vec<ReviewRecord>> {
        self.get_json(&format!("/v1/transactions/{}/reviews", transaction_id), &[])
            .await
    }

    async fn get_notes(&self, transaction_id: &str) -> Result<Vec<AnalystNote>> {
        self.get_json(&format!("/v1/transactions/{}/notes", transaction_id), &[])
            .await
    }

    async fn get_case(&self, transaction_id: &str) -> Result<Option<CaseLink>> {
        match self
            .get_json::<CaseLink>(&format!("/v1/transactions/{}/case", transaction_id), &[])
            .await
        {
            Ok(case) => Ok(Some(case)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_health(&self) -> Result<SourceHealth> {
        self.get_json("/v1/health", &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = SourceClientConfig::new("https://txn.internal/")
            .with_api_token("secret")
            .with_timeout(5);

        assert_eq!(config.base_url, "https://txn.internal/");
        assert_eq!(config.api_token, Some("secret".to_string()));
        assert_eq!(config.timeout_secs, 5);
        assert_eq!(config.max_attempts, 3);
    }

    #[test]
    fn test_url_joins_without_double_slash() {
        let source = HttpTransactionSource::new(SourceClientConfig::new("https://txn.internal/"));
        assert_eq!(
            source.url("/v1/transactions/abc"),
            "https://txn.internal/v1/transactions/abc"
        );
    }
}
