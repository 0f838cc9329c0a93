/// Longest error text persisted to a download or history row. Anything the
/// extraction tool prints beyond this is noise for the audit trail.
pub(crate) const MAX_ERROR_MESSAGE_CHARS: usize = 500;

// Case-insensitive markers of conditions worth retrying. Everything else
// coming out of the extraction tool is treated as permanent.
const RETRYABLE_MARKERS: [&str; 9] = [
    "network",
    "timeout",
    "connection",
    "temporary",
    "rate limit",
    "quota",
    "503",
    "502",
    "504",
];

#[derive(Debug, thiserror::Error)]
/// Rejections produced while validating a 5-field cron expression.
pub(crate) enum CronError {
    #[error("cron expression may only contain digits, spaces, and ',', '-', '*', '/'")]
    InvalidCharacter,

    #[error(
        "cron expression must have exactly 5 fields (minute hour day-of-month month day-of-week), found {0}"
    )]
    FieldCount(usize),

    #[error("invalid {field} field '{value}': {reason}")]
    Field {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("schedule intervals of less than 5 minutes are not allowed")]
    TooFrequent,
}

#[derive(Debug, thiserror::Error)]
/// Failures surfaced by the extraction tool or the filesystem while listing
/// or downloading videos. `Transient` failures qualify for a retry, the
/// other two variants do not.
pub(crate) enum FetchError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("a '{name}' run is already in progress")]
/// Raised when the persistent single-flight flag for `name` is already set.
pub(crate) struct LockHeldError {
    pub(crate) name: String,
}

// The retry policy is a lookup over the error text, so that every component
// classifies failures the same way regardless of where they originated.
pub(crate) fn is_retryable_message(message: &str) -> bool {
    let lowered = message.to_lowercase();
    RETRYABLE_MARKERS.iter().any(|m| lowered.contains(m))
}

// Cap persisted error text at `MAX_ERROR_MESSAGE_CHARS` characters.
pub(crate) fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

// Turn the stderr of a failed extraction-tool invocation into a classified
// `FetchError`. Classification looks at the full output, while the stored
// message is the final line, which is where the tool summarizes the failure.
pub(crate) fn classify_tool_failure(stderr: &str) -> FetchError {
    let message = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("extraction tool failed without output")
        .trim();
    let message = truncate_error(message);

    if is_retryable_message(stderr) {
        FetchError::Transient(message)
    } else {
        FetchError::Permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_markers() {
        // Each message on the left must classify as indicated on the right.
        let cases = [
            ("Connection reset by peer", true),
            ("Read timeout on fragment 3", true),
            ("HTTP Error 503: Service Unavailable", true),
            ("exceeded quota for today", true),
            ("Rate Limit hit, slow down", true),
            ("ERROR: Private video", false),
            ("ERROR: Video unavailable", false),
            ("Requested format is not available", false),
            ("", false),
        ];

        for (message, expected) in &cases {
            assert_eq!(is_retryable_message(message), *expected, "{message}");
        }
    }

    #[test]
    fn test_classify_uses_last_line() {
        let stderr = "WARNING: something minor\n\nERROR: Video unavailable\n";
        let err = classify_tool_failure(stderr);
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "ERROR: Video unavailable");
    }

    #[test]
    fn test_classify_transient_from_earlier_lines() {
        // The retry marker sits in an earlier line; the message is still the
        // final summary line.
        let stderr = "ERROR: unable to download: connection refused\ngiving up after 3 tries";
        let err = classify_tool_failure(stderr);
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "giving up after 3 tries");
    }

    #[test]
    fn test_truncate_error_caps_length() {
        let long = "x".repeat(2_000);
        assert_eq!(truncate_error(&long).chars().count(), MAX_ERROR_MESSAGE_CHARS);
        assert_eq!(truncate_error("short"), "short");
    }
}
