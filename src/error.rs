use std::io;

/// Errors produced while reading, indexing, or extracting a remote archive.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object '{key}' did not report a usable size")]
    SizeUnavailable { key: String },

    #[error("archive is empty")]
    EmptyArchive,

    #[error("unsupported file type: '{key}' is not a zip archive")]
    UnsupportedFileType { key: String },

    #[error("archive index is corrupt after {attempts} attempt(s): {reason}")]
    ArchiveIndexCorrupt { attempts: u32, reason: String },

    #[error("entry stream for '{name}' cannot be opened: archive handle is closed")]
    EntryStreamClosed { name: String },

    #[error("entry '{name}' is too large: {size} bytes exceeds the {limit} byte object limit")]
    EntryTooLarge { name: String, size: u64, limit: u64 },

    #[error("verification failed for '{name}': {reason}")]
    UploadVerificationFailed { name: String, reason: String },

    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("transient network error: {message}")]
    TransientNetwork { message: String },

    #[error("{message}")]
    Permanent { message: String },

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("archive reader is closed")]
    ArchiveClosed,

    #[error("entry '{name}' uses unsupported compression method {method}")]
    UnsupportedCompression { name: String, method: u16 },

    #[error("entry '{name}' is encrypted")]
    EncryptedEntry { name: String },

    #[error("entry '{name}' maps to '{key}', which an earlier entry in this batch already wrote")]
    DuplicateKey { name: String, key: String },

    #[error("invalid range [{start}, {end}]")]
    InvalidRange { start: u64, end: u64 },

    #[error("malformed zip data: {0}")]
    Format(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether a bounded local retry may succeed where this attempt failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::TransientNetwork { .. } | Error::Io(_) => true,
            Error::Http { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    pub(crate) fn permanent(message: impl Into<String>) -> Self {
        Error::Permanent {
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Error::Http {
                status: status.as_u16(),
                url: e
                    .url()
                    .map(|u| redact_query(u.as_str()))
                    .unwrap_or_default(),
            };
        }
        if e.is_timeout() || e.is_connect() || e.is_body() || e.is_request() || e.is_decode() {
            Error::TransientNetwork {
                message: e.to_string(),
            }
        } else {
            Error::permanent(e.to_string())
        }
    }
}

/// Drop the query string so signatures never end up in logs or reports.
pub(crate) fn redact_query(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => base.to_string(),
        None => url.to_string(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::TransientNetwork { message: "reset".into() }.is_retryable());
        assert!(Error::Http { status: 503, url: String::new() }.is_retryable());
        assert!(Error::Http { status: 429, url: String::new() }.is_retryable());
        assert!(!Error::Http { status: 404, url: String::new() }.is_retryable());
        assert!(!Error::EmptyArchive.is_retryable());
        assert!(!Error::Cancelled { reason: "timeout".into() }.is_retryable());
    }

    #[test]
    fn query_is_redacted() {
        assert_eq!(
            redact_query("https://b.cos.ap-guangzhou.myqcloud.com/a.zip?q-signature=abc"),
            "https://b.cos.ap-guangzhou.myqcloud.com/a.zip"
        );
        assert_eq!(redact_query("http://host/key"), "http://host/key");
    }
}
