//! Attachment decoding and file-content extraction.
//!
//! Attachments arrive as data URLs. Files are classified by extension and
//! turned into prompt text: text-like files are decoded and capped, PDFs
//! get a best-effort scrape of their text operators, images are routed to
//! the vision service by the enrichment coordinator.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use regex::bytes::Regex;

use crate::error::EnrichmentFailure;

/// Appended to text previews that were cut short.
pub const TRUNCATION_MARKER: &str = "\n\n[... content truncated ...]";

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp"];

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "json", "js", "jsx", "ts", "tsx", "py", "rs", "go", "java",
    "c", "cpp", "h", "hpp", "cs", "rb", "php", "html", "htm", "css", "scss", "xml", "yaml", "yml",
    "toml", "ini", "cfg", "log", "sql", "sh", "bat", "ps1", "swift", "kt",
];

/// PDF syntax that shows up in printable byte runs but is not content.
const PDF_SYNTAX_MARKERS: &[&str] = &[
    "obj", "stream", "xref", "trailer", "%PDF", "%%EOF", "<<", ">>", "/Type", "/Filter",
    "/Length", "/Font", "/Page",
];

/// A decoded attachment payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedAttachment {
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Decode a `data:<mime>;base64,<payload>` URL. A bare base64 payload is
/// accepted too.
pub fn decode_data_url(input: &str) -> Result<DecodedAttachment, EnrichmentFailure> {
    let input = input.trim();
    let (mime_type, payload, is_base64) = match input.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| EnrichmentFailure::Decode("data URL has no payload".into()))?;
            let mut parts = header.split(';');
            let mime = parts.next().filter(|m| !m.is_empty()).map(str::to_string);
            let is_base64 = parts.any(|p| p.eq_ignore_ascii_case("base64"));
            (mime, payload, is_base64)
        }
        None => (None, input, true),
    };

    let bytes = if is_base64 {
        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        BASE64_STANDARD
            .decode(compact.as_bytes())
            .map_err(|e| EnrichmentFailure::Decode(e.to_string()))?
    } else {
        payload.as_bytes().to_vec()
    };

    if bytes.is_empty() {
        return Err(EnrichmentFailure::Decode("attachment is empty".into()));
    }
    Ok(DecodedAttachment { mime_type, bytes })
}

/// Encode raw bytes as a base64 data URL.
pub fn encode_data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, BASE64_STANDARD.encode(bytes))
}

/// Coarse file category, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Image,
    Text,
    Pdf,
    Unknown,
}

impl FileKind {
    pub fn from_name(file_name: &str) -> Self {
        let Some(ext) = extension(file_name) else {
            return FileKind::Unknown;
        };
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            FileKind::Image
        } else if TEXT_EXTENSIONS.contains(&ext.as_str()) {
            FileKind::Text
        } else if ext == "pdf" {
            FileKind::Pdf
        } else {
            FileKind::Unknown
        }
    }
}

/// Lower-cased extension of a file name, without the dot.
pub fn extension(file_name: &str) -> Option<String> {
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Guess a MIME type for building data URLs from local files.
pub fn mime_for_name(file_name: &str) -> &'static str {
    match extension(file_name).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("pdf") => "application/pdf",
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        Some("csv") => "text/csv",
        Some("md") | Some("markdown") => "text/markdown",
        _ if FileKind::from_name(file_name) == FileKind::Text => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Decode text (lossily) and cap it at `max_chars` characters, appending
/// [`TRUNCATION_MARKER`] when anything was cut.
pub fn text_preview(bytes: &[u8], max_chars: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{}", &text[..cut], TRUNCATION_MARKER),
        None => text.into_owned(),
    }
}

/// Best-effort text scrape of a PDF.
///
/// Prefers strings drawn by `Tj`/`TJ` text operators; if there are none,
/// falls back to printable ASCII runs that do not look like PDF syntax.
/// Compressed content streams yield nothing useful either way.
pub fn extract_pdf_text(bytes: &[u8]) -> String {
    let from_operators = text_operator_strings(bytes);
    if !from_operators.trim().is_empty() {
        return from_operators;
    }
    printable_runs(bytes)
}

/// Number of alphanumeric characters in `text`.
pub fn readable_chars(text: &str) -> usize {
    text.chars().filter(|c| c.is_alphanumeric()).count()
}

fn tj_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?-u)\((?P<s>(?:[^()\\]|\\.)*)\)\s*Tj|\[(?P<a>(?:[^\]\\]|\\.)*)\]\s*TJ")
            .expect("Invalid Tj regex")
    })
}

fn literal_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?-u)\(((?:[^()\\]|\\.)*)\)").expect("Invalid literal regex"))
}

fn printable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?-u)[\x20-\x7E]{4,}").expect("Invalid printable regex"))
}

fn text_operator_strings(bytes: &[u8]) -> String {
    let mut pieces = Vec::new();
    for caps in tj_regex().captures_iter(bytes) {
        if let Some(s) = caps.name("s") {
            pieces.push(unescape_pdf_literal(s.as_bytes()));
        } else if let Some(array) = caps.name("a") {
            let joined: String = literal_regex()
                .captures_iter(array.as_bytes())
                .filter_map(|c| c.get(1))
                .map(|m| unescape_pdf_literal(m.as_bytes()))
                .collect();
            pieces.push(joined);
        }
    }
    pieces
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn printable_runs(bytes: &[u8]) -> String {
    printable_regex()
        .find_iter(bytes)
        .map(|m| String::from_utf8_lossy(m.as_bytes()).trim().to_string())
        .filter(|run| looks_like_prose(run))
        .collect::<Vec<_>>()
        .join(" ")
}

fn looks_like_prose(run: &str) -> bool {
    if PDF_SYNTAX_MARKERS.iter().any(|m| run.contains(m)) {
        return false;
    }
    let letters = run
        .chars()
        .filter(|c| c.is_ascii_alphabetic() || *c == ' ')
        .count();
    letters * 10 >= run.len() * 7 && run.chars().any(|c| c.is_ascii_alphabetic())
}

fn unescape_pdf_literal(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter().copied().peekable();
    while let Some(b) = iter.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(d @ b'0'..=b'7') => {
                let mut value = u32::from(d - b'0');
                for _ in 0..2 {
                    match iter.peek() {
                        Some(&n @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(n - b'0');
                            iter.next();
                        }
                        _ => break,
                    }
                }
                out.push((value & 0xFF) as u8);
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
