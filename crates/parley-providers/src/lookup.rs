//! Weather and news lookups over plain HTTP.
//!
//! Both lookups answer with a readable fallback sentence when the remote
//! source fails, so a broken upstream never turns into a turn error.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use parley_chat::services::ContextProvider;
use parley_core::config::ProvidersConfig;
use parley_core::error::ParleyError;

/// Upper bound on a single lookup request.
const MAX_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RELATED_TOPICS: usize = 3;

/// [`ContextProvider`] backed by configurable HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpContextProvider {
    client: Client,
    weather_url: String,
    news_url: String,
}

impl HttpContextProvider {
    /// `weather_url` must contain `{city}`, `news_url` must contain
    /// `{query}`.
    pub fn new(
        weather_url: impl Into<String>,
        news_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ParleyError> {
        let client = Client::builder()
            .timeout(timeout.min(MAX_LOOKUP_TIMEOUT))
            .user_agent(concat!("parley/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ParleyError::Provider(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            weather_url: weather_url.into(),
            news_url: news_url.into(),
        })
    }

    pub fn from_config(config: &ProvidersConfig) -> Result<Self, ParleyError> {
        Self::new(
            config.weather_url.clone(),
            config.news_url.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, reqwest::Error> {
        self.client.get(url).send().await?.error_for_status()
    }

    async fn fetch_weather(&self, city: &str) -> Result<String, reqwest::Error> {
        let url = fill_template(&self.weather_url, "{city}", city);
        let text = self.get(&url).await?.text().await?;
        Ok(text.trim().to_string())
    }

    async fn fetch_news(&self, query: &str) -> Result<InstantAnswer, reqwest::Error> {
        let url = fill_template(&self.news_url, "{query}", query);
        self.get(&url).await?.json::<InstantAnswer>().await
    }
}

#[async_trait]
impl ContextProvider for HttpContextProvider {
    async fn lookup_weather(&self, city: &str) -> Result<String, ParleyError> {
        match self.fetch_weather(city).await {
            Ok(report) if !report.is_empty() => {
                debug!(city, "Weather lookup succeeded");
                Ok(format!("Current weather: {}", report))
            }
            Ok(_) => Ok(weather_unavailable(city)),
            Err(e) => {
                warn!(city, error = %e, "Weather lookup failed");
                Ok(weather_unavailable(city))
            }
        }
    }

    async fn lookup_news(&self, query: &str) -> Result<String, ParleyError> {
        match self.fetch_news(query).await {
            Ok(answer) => {
                let summary = answer.summarize(query);
                debug!(query, found = summary.is_some(), "News lookup finished");
                Ok(summary.unwrap_or_else(|| {
                    format!("No recent information found for \"{}\".", query)
                }))
            }
            Err(e) => {
                warn!(query, error = %e, "News lookup failed");
                Ok("News information is currently unavailable.".to_string())
            }
        }
    }
}

fn weather_unavailable(city: &str) -> String {
    format!("Weather information for {} is currently unavailable.", city)
}

/// Replace `placeholder` in `template` with the URL-encoded `value`.
pub fn fill_template(template: &str, placeholder: &str, value: &str) -> String {
    template.replace(placeholder, &urlencoding::encode(value.trim()))
}

/// The subset of a DuckDuckGo instant answer that is worth quoting.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct InstantAnswer {
    heading: String,
    abstract_text: String,
    abstract_source: String,
    /// Usually a string, occasionally an object for calculator-style answers.
    answer: serde_json::Value,
    related_topics: Vec<RelatedTopic>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
struct RelatedTopic {
    text: String,
}

impl InstantAnswer {
    fn summarize(&self, query: &str) -> Option<String> {
        let mut lines = Vec::new();
        if let Some(answer) = self.answer.as_str().map(str::trim).filter(|a| !a.is_empty()) {
            lines.push(answer.to_string());
        }
        if !self.abstract_text.trim().is_empty() {
            let source = if self.abstract_source.is_empty() {
                String::new()
            } else {
                format!(" ({})", self.abstract_source)
            };
            let heading = if self.heading.is_empty() {
                query
            } else {
                self.heading.as_str()
            };
            lines.push(format!("{}: {}{}", heading, self.abstract_text.trim(), source));
        }
        lines.extend(
            self.related_topics
                .iter()
                .map(|t| t.text.trim())
                .filter(|t| !t.is_empty())
                .take(MAX_RELATED_TOPICS)
                .map(|t| format!("- {}", t)),
        );

        if lines.is_empty() {
            None
        } else {
            Some(format!("Search results for \"{}\":\n{}", query, lines.join("\n")))
        }
    }
}
