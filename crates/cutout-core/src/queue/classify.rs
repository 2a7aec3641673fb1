//! Maps raw failure messages to the short, user-facing messages stored on
//! failed tasks.

pub const FILE_TOO_LARGE: &str = "File too large";
pub const UNSUPPORTED_FORMAT: &str = "Unsupported format (JPG/PNG/WEBP)";
pub const WEBP_UNSUPPORTED: &str = "WEBP not supported on server";
pub const PROVIDER_KEY_MISSING: &str = "Provider key missing";
pub const TIMED_OUT: &str = "Request timed out";
pub const INVALID_MASK: &str = "Invalid mask response";
pub const QUOTA_EXCEEDED: &str = "Provider quota exceeded";
pub const FALLBACK: &str = "Segmentation failed";

/// Ordered rules; the first rule whose every group matches wins.  Within a
/// group any one needle is enough.
const RULES: &[(&[&[&str]], &str)] = &[
    (&[&["file too large"]], FILE_TOO_LARGE),
    (
        &[&[
            "unsupported file type",
            "unsupported image format",
            "cannot identify image file",
        ]],
        UNSUPPORTED_FORMAT,
    ),
    (&[&["webp not supported"]], WEBP_UNSUPPORTED),
    (&[&["gemini_api_key", "not configured"]], PROVIDER_KEY_MISSING),
    (&[&["timeout"]], TIMED_OUT),
    (&[&["invalid"], &["mask"]], INVALID_MASK),
    (
        &[&[
            "quota",
            "status 429",
            "429 too many",
            "rate_limit",
            "resource_exhausted",
            "too many requests",
        ]],
        QUOTA_EXCEEDED,
    ),
];

/// Classify a raw failure message.  Deterministic and case-insensitive.
///
/// Unmatched messages are returned trimmed; blank ones become
/// [`FALLBACK`].
pub fn classify_error(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    RULES
        .iter()
        .find(|(groups, _)| {
            groups
                .iter()
                .all(|needles| needles.iter().any(|n| lowered.contains(n)))
        })
        .map(|(_, message)| (*message).to_owned())
        .unwrap_or_else(|| match raw.trim() {
            "" => FALLBACK.to_owned(),
            other => other.to_owned(),
        })
}
