//! Turn enrichment: image description, file extraction, side lookups.
//!
//! Up to three sub-tasks run concurrently per turn. Each one yields
//! `Result<Option<String>, EnrichmentFailure>`; failures are logged and
//! turned into an empty field, so the bundle never carries an error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use parley_core::config::EnrichmentConfig;

use crate::attachment::{self, FileKind};
use crate::error::EnrichmentFailure;
use crate::intent::LookupIntent;
use crate::services::{ContextProvider, VisionService};

/// Vision instruction used when the user sent an image without a question.
pub const GENERIC_IMAGE_PROMPT: &str = "Describe everything visible in this image in detail, \
     including any text, people, objects, colors, and the overall setting.";

/// Raw inputs of one turn that enrichment works from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichmentRequest {
    pub message: String,
    /// Image as a data URL.
    pub image: Option<String>,
    /// File as a data URL.
    pub file: Option<String>,
    pub file_name: Option<String>,
}

impl EnrichmentRequest {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

/// Text context gathered for one turn. Each field is independent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentBundle {
    pub image_context: Option<String>,
    pub file_context: Option<String>,
    pub external_context: Option<String>,
}

impl EnrichmentBundle {
    pub fn is_empty(&self) -> bool {
        self.image_context.is_none()
            && self.file_context.is_none()
            && self.external_context.is_none()
    }

    /// True when an attachment produced context for the user turn.
    pub fn has_attachment_context(&self) -> bool {
        self.image_context.is_some() || self.file_context.is_some()
    }
}

/// Fans out the enrichment sub-tasks of a turn and merges their results.
pub struct EnrichmentCoordinator {
    vision: Arc<dyn VisionService>,
    context: Arc<dyn ContextProvider>,
    max_text_preview_chars: usize,
    pdf_min_readable_chars: usize,
    default_city: String,
    timeout: Option<Duration>,
}

impl EnrichmentCoordinator {
    pub fn new(
        vision: Arc<dyn VisionService>,
        context: Arc<dyn ContextProvider>,
        config: &EnrichmentConfig,
    ) -> Self {
        Self {
            vision,
            context,
            max_text_preview_chars: config.max_text_preview_chars,
            pdf_min_readable_chars: config.pdf_min_readable_chars,
            default_city: config.default_city.clone(),
            timeout: config.lookup_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Run every applicable sub-task and wait for all of them.
    ///
    /// Resolves immediately when the request has no image, no file and no
    /// recognised lookup intent.
    pub async fn enrich(&self, request: &EnrichmentRequest) -> EnrichmentBundle {
        let message = request.message.trim();
        let image = request.image.as_deref().filter(|s| !s.trim().is_empty());
        let file = match (request.file.as_deref(), request.file_name.as_deref()) {
            (Some(data), Some(name)) if !data.trim().is_empty() => Some((data, name)),
            _ => None,
        };
        let intent = LookupIntent::classify(message, &self.default_city);

        debug!(
            image = image.is_some(),
            file = file.is_some(),
            lookup = intent.as_ref().map(LookupIntent::kind),
            "Enrichment scheduled"
        );

        let image_task = async {
            match image {
                Some(data) => self.settle("image", self.describe_image(data, message)).await,
                None => None,
            }
        };
        let file_task = async {
            match file {
                Some((data, name)) => {
                    self.settle("file", self.extract_file(data, name, message))
                        .await
                }
                None => None,
            }
        };
        let lookup_task = async {
            match intent {
                Some(intent) => self.settle(intent.kind(), self.lookup(intent.clone())).await,
                None => None,
            }
        };

        let (image_context, file_context, external_context) =
            tokio::join!(image_task, file_task, lookup_task);

        EnrichmentBundle {
            image_context,
            file_context,
            external_context,
        }
    }

    /// Await one sub-task, absorbing its failure into an empty result.
    async fn settle<F>(&self, kind: &'static str, task: F) -> Option<String>
    where
        F: Future<Output = Result<Option<String>, EnrichmentFailure>>,
    {
        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, task)
                .await
                .unwrap_or_else(|_| Err(EnrichmentFailure::TimedOut(limit.as_secs()))),
            None => task.await,
        };
        match outcome {
            Ok(Some(text)) if !text.trim().is_empty() => Some(text),
            Ok(_) => {
                debug!(kind, "Enrichment task produced no context");
                None
            }
            Err(e) => {
                warn!(kind, error = %e, "Enrichment task failed");
                None
            }
        }
    }

    async fn describe_image(
        &self,
        data_url: &str,
        message: &str,
    ) -> Result<Option<String>, EnrichmentFailure> {
        let decoded = attachment::decode_data_url(data_url)?;
        let prompt = if message.is_empty() {
            GENERIC_IMAGE_PROMPT
        } else {
            message
        };
        let description = self
            .vision
            .describe(&decoded.bytes, prompt)
            .await
            .map_err(|e| EnrichmentFailure::Vision(e.to_string()))?;
        Ok(Some(description))
    }

    async fn extract_file(
        &self,
        data_url: &str,
        file_name: &str,
        message: &str,
    ) -> Result<Option<String>, EnrichmentFailure> {
        match FileKind::from_name(file_name) {
            FileKind::Image => self.describe_image(data_url, message).await,
            FileKind::Text => {
                let decoded = attachment::decode_data_url(data_url)?;
                Ok(Some(attachment::text_preview(
                    &decoded.bytes,
                    self.max_text_preview_chars,
                )))
            }
            FileKind::Pdf => {
                let decoded = attachment::decode_data_url(data_url)?;
                let text = attachment::extract_pdf_text(&decoded.bytes);
                if attachment::readable_chars(&text) < self.pdf_min_readable_chars {
                    debug!(file_name, "PDF yielded too little text");
                    return Ok(Some(unreadable_pdf_notice(file_name)));
                }
                Ok(Some(attachment::text_preview(
                    text.as_bytes(),
                    self.max_text_preview_chars,
                )))
            }
            FileKind::Unknown => Ok(Some(unsupported_file_notice(file_name))),
        }
    }

    async fn lookup(&self, intent: LookupIntent) -> Result<Option<String>, EnrichmentFailure> {
        let result = match &intent {
            LookupIntent::Weather { city } => self.context.lookup_weather(city).await,
            LookupIntent::Time => self.context.lookup_time().await,
            LookupIntent::News { query } => self.context.lookup_news(query).await,
        };
        result
            .map(Some)
            .map_err(|e| EnrichmentFailure::Lookup(e.to_string()))
    }
}

impl std::fmt::Debug for EnrichmentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentCoordinator")
            .field("max_text_preview_chars", &self.max_text_preview_chars)
            .field("pdf_min_readable_chars", &self.pdf_min_readable_chars)
            .field("default_city", &self.default_city)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn unreadable_pdf_notice(file_name: &str) -> String {
    format!(
        "The PDF \"{}\" was uploaded, but its text could not be extracted. It may be scanned \
         or compressed. Ask the user to copy and paste the text they want analyzed.",
        file_name
    )
}

fn unsupported_file_notice(file_name: &str) -> String {
    let ext = attachment::extension(file_name)
        .map(|e| format!(".{}", e))
        .unwrap_or_else(|| "no extension".to_string());
    format!(
        "The file \"{}\" ({}) was uploaded, but this file type cannot be read. Ask the user \
         to paste its contents as text.",
        file_name, ext
    )
}
