//! Response headers bound into a signed link.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

/// RFC 5987 `attr-char`: everything else in an extended value is escaped.
const ATTR_CHAR: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Headers the object store is asked to send back with the object.
///
/// Each one becomes a `response-*` query parameter and is covered by the
/// link signature.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeaders {
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

impl ResponseHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_content_disposition(mut self, disposition: impl Into<String>) -> Self {
        self.content_disposition = Some(disposition.into());
        self
    }

    /// Headers making the browser save the object as `filename`.
    ///
    /// The disposition carries both an ASCII `filename` fallback and a UTF-8
    /// `filename*` (RFC 6266).
    pub fn attachment(filename: &str, content_type: Option<&str>) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            content_disposition: Some(attachment_disposition(filename)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content_type.is_none() && self.content_disposition.is_none()
    }

    /// The `response-*` query parameters for these headers.
    pub fn query_params(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("response-content-disposition", self.content_disposition.as_deref()),
            ("response-content-type", self.content_type.as_deref()),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name, v)))
    }
}

fn attachment_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    let encoded = utf8_percent_encode(filename, ATTR_CHAR);
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
