//! Lightweight intent detection for side lookups.
//!
//! Plain substring checks on the lower-cased message. At most one lookup
//! runs per turn; the first matching intent in priority order wins.

/// Keywords per intent, in priority order.
const WEATHER_KEYWORDS: &[&str] = &["weather", "temperature"];
const TIME_KEYWORDS: &[&str] = &["time", "date", "day"];
const NEWS_KEYWORDS: &[&str] = &["news", "latest", "current"];

/// Which external lookup a message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupIntent {
    Weather { city: String },
    Time,
    News { query: String },
}

impl LookupIntent {
    /// Classify `message`. Weather beats time, time beats news.
    pub fn classify(message: &str, default_city: &str) -> Option<Self> {
        let lower = message.to_lowercase();
        let mentions = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

        if mentions(WEATHER_KEYWORDS) {
            let city = extract_city(message).unwrap_or_else(|| default_city.to_string());
            Some(LookupIntent::Weather { city })
        } else if mentions(TIME_KEYWORDS) {
            Some(LookupIntent::Time)
        } else if mentions(NEWS_KEYWORDS) {
            Some(LookupIntent::News {
                query: message.trim().to_string(),
            })
        } else {
            None
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LookupIntent::Weather { .. } => "weather",
            LookupIntent::Time => "time",
            LookupIntent::News { .. } => "news",
        }
    }
}

/// The place named after the last " in " of the message, if any.
fn extract_city(message: &str) -> Option<String> {
    // The needle is ASCII, so a byte match always sits on a char boundary.
    let idx = message
        .as_bytes()
        .windows(4)
        .rposition(|w| w.eq_ignore_ascii_case(b" in "))?;
    let tail = &message[idx + 4..];
    let city: String = tail
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .split_whitespace()
        .take_while(|w| {
            !matches!(
                w.to_lowercase().as_str(),
                "today" | "tomorrow" | "now" | "right"
            )
        })
        .collect::<Vec<_>>()
        .join(" ");
    let city = city
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_string();
    if city.is_empty() {
        None
    } else {
        Some(city)
    }
}
