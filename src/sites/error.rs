use std::io;

use thiserror::Error;

use super::auth::AuthError;

/// Enumerates the possible errors that can arise while talking to a site.
///
/// Parse failures of a single source never show up here: the adapter absorbs them by moving
/// on to the next source, and only reports [`ExtractorError::NoValidSource`] once every source
/// failed.
#[derive(Error, Debug)]
pub enum ExtractorError {
    /// An attempt was made to fetch posts from page zero.
    #[error("Page number cannot be zero.")]
    ZeroPage,

    /// The requested page goes past the last page the site serves.
    #[error("Page {page} is too far, this site only serves up to page {max}")]
    PageTooFar { page: u32, max: u32 },

    /// The number of tags provided for a search query exceeds the limit of the account.
    #[error("Too many tags, got: {current} while this imageboard only supports a max of {max}")]
    TooManyTags { current: usize, max: usize },

    /// The site answered 503 recently and is left alone until its error interval elapses.
    #[error("Server {site} is offline")]
    ServerOffline { site: String },

    /// Connection failure, timeout, or a retryable status once all attempts are spent.
    #[error("Connection to {site} failed: {message}")]
    Network { site: String, message: String },

    #[error("Authentication failed. error: {source}")]
    AuthenticationFailure {
        #[from]
        source: AuthError,
    },

    #[error("No valid source of the site returned result.")]
    NoValidSource { site: String },

    #[error("Remote file not found: {url}")]
    NotFound { url: String },

    #[error("Site {site} is not configured")]
    UnknownSite { site: String },

    #[error("Invalid configuration for site {site}: {message}")]
    InvalidConfig { site: String, message: String },

    /// No source of the site can serve this kind of request.
    #[error("Unsupported operation for this server: {operation}")]
    UnsupportedOperation { operation: String },

    #[error("Post {id} has no downloadable url")]
    MissingUrl { id: u64 },

    #[error("Request was cancelled")]
    Cancelled,

    #[error("Failed to read config file. error: {source}")]
    ConfigIOError {
        #[from]
        source: io::Error,
    },

    #[error("Failed to parse config file. error: {source}")]
    ConfigParseError {
        #[from]
        source: toml::de::Error,
    },
}

impl ExtractorError {
    /// Errors that leave a Page usable for another attempt at the same index.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::NoValidSource { .. } | Self::ServerOffline { .. }
        )
    }
}
