//! External capabilities the chat core calls, and mock implementations.
//!
//! Each trait is the single typed contract for one capability. Adapters
//! that talk to real providers (see the `parley-providers` crate) are
//! responsible for normalizing whatever the provider returns into it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;

use parley_core::error::ParleyError;
use parley_core::types::PromptMessage;

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
        }
    }
}

/// Produces the assistant reply from an ordered, role-tagged prompt.
#[async_trait]
pub trait GenerationService: Send + Sync {
    async fn generate(
        &self,
        messages: &[PromptMessage],
        params: GenerationParams,
    ) -> Result<String, ParleyError>;
}

/// Describes an image, guided by a prompt.
#[async_trait]
pub trait VisionService: Send + Sync {
    async fn describe(&self, image: &[u8], prompt: &str) -> Result<String, ParleyError>;
}

/// Side lookups that add real-time context to a turn.
///
/// Implementations should return a human-readable fallback string rather
/// than an error when the upstream source is unavailable.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn lookup_weather(&self, city: &str) -> Result<String, ParleyError>;

    async fn lookup_news(&self, query: &str) -> Result<String, ParleyError>;

    async fn lookup_time(&self) -> Result<String, ParleyError> {
        Ok(format!(
            "Current local date and time: {}",
            Local::now().format("%A, %B %-d, %Y %H:%M:%S %Z")
        ))
    }
}

// =============================================================================
// Mock implementations
// =============================================================================

/// Mock generation service that records every request.
#[derive(Debug)]
pub struct MockGeneration {
    reply: Option<String>,
    requests: Mutex<Vec<Vec<PromptMessage>>>,
}

impl MockGeneration {
    /// Always reply with `reply`.
    pub fn with_reply(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Always fail.
    pub fn failing() -> Self {
        Self {
            reply: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of generate calls received.
    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// The most recent prompt received.
    pub fn last_request(&self) -> Option<Vec<PromptMessage>> {
        self.requests.lock().ok().and_then(|r| r.last().cloned())
    }
}

#[async_trait]
impl GenerationService for MockGeneration {
    async fn generate(
        &self,
        messages: &[PromptMessage],
        _params: GenerationParams,
    ) -> Result<String, ParleyError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        self.reply
            .clone()
            .ok_or_else(|| ParleyError::Provider("mock generation failure".to_string()))
    }
}

/// Mock vision service returning a fixed description.
#[derive(Debug)]
pub struct MockVision {
    description: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl MockVision {
    pub fn with_text(description: &str) -> Self {
        Self {
            description: Some(description.to_string()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            description: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Prompts received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl VisionService for MockVision {
    async fn describe(&self, image: &[u8], prompt: &str) -> Result<String, ParleyError> {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        if image.is_empty() {
            return Err(ParleyError::Provider("empty image".to_string()));
        }
        self.description
            .clone()
            .ok_or_else(|| ParleyError::Provider("mock vision failure".to_string()))
    }
}

/// Mock context provider counting lookups by kind.
#[derive(Debug, Default)]
pub struct MockContextProvider {
    fail: bool,
    delay: Option<Duration>,
    weather_calls: AtomicUsize,
    news_calls: AtomicUsize,
    time_calls: AtomicUsize,
    cities: Mutex<Vec<String>>,
}

impl MockContextProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every lookup returns an error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Every lookup sleeps for `delay` before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn weather_calls(&self) -> usize {
        self.weather_calls.load(Ordering::SeqCst)
    }

    pub fn news_calls(&self) -> usize {
        self.news_calls.load(Ordering::SeqCst)
    }

    pub fn time_calls(&self) -> usize {
        self.time_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.weather_calls() + self.news_calls() + self.time_calls()
    }

    /// Cities requested from the weather lookup.
    pub fn cities(&self) -> Vec<String> {
        self.cities.lock().map(|c| c.clone()).unwrap_or_default()
    }

    async fn respond(&self, text: String) -> Result<String, ParleyError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(ParleyError::Provider("mock lookup failure".to_string()));
        }
        Ok(text)
    }
}

#[async_trait]
impl ContextProvider for MockContextProvider {
    async fn lookup_weather(&self, city: &str) -> Result<String, ParleyError> {
        self.weather_calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut cities) = self.cities.lock() {
            cities.push(city.to_string());
        }
        self.respond(format!("Weather in {}: sunny, 21°C", city)).await
    }

    async fn lookup_news(&self, query: &str) -> Result<String, ParleyError> {
        self.news_calls.fetch_add(1, Ordering::SeqCst);
        self.respond(format!("Top story for '{}'", query)).await
    }

    async fn lookup_time(&self) -> Result<String, ParleyError> {
        self.time_calls.fetch_add(1, Ordering::SeqCst);
        self.respond("Current local date and time: Monday, 09:00".to_string())
            .await
    }
}
