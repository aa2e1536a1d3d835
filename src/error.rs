use thiserror::Error;

/// Errors surfaced by the driver and every layer below it.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{driver}: path not found: {path}")]
    PathNotFound { path: String, driver: &'static str },
    #[error("{driver}: the method is unsupported")]
    Unsupported { driver: &'static str },
    #[error("append is not supported by this storage backend")]
    AppendUnsupported,
    #[error("invalid offset {offset} for path {path}")]
    InvalidOffset { path: String, offset: u64 },
    #[error("unable to rewrite directory by file: {0}")]
    RewriteDirectoryByFile(String),
    #[error("unable to rewrite file by directory: {0}")]
    RewriteFileByDirectory(String),
    #[error("`{0}` is a directory, moving directories is not supported")]
    DirectoryMove(String),

    /// A non-success reply from the blob store, carrying the scope of the
    /// failed call and up to 512 bytes of the response body.
    #[error("{method} failed on {url}: {status}: {body_prefix}")]
    Method {
        method: &'static str,
        url: String,
        status: u16,
        body_prefix: String,
    },

    #[error("configuration error: {0}")]
    Config(String),
    #[error("data source must contain at least one item")]
    ZeroDataSource,
    #[error("duplicated data source")]
    DuplicatedDataSource,

    #[error("writer has already been closed")]
    AlreadyClosed,
    #[error("writer has already been committed")]
    AlreadyCommitted,
    #[error("writer has already been cancelled")]
    AlreadyCancelled,
    #[error("the upload was cancelled")]
    UploadCancelled,

    #[error("{0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("{0}")]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Xml(#[from] quick_xml::DeError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DriverError {
    /// Shorthand for the not-found kind. `driver` names the backend that
    /// failed the resolution.
    pub fn path_not_found(path: impl Into<String>, driver: &'static str) -> Self {
        DriverError::PathNotFound {
            path: path.into(),
            driver,
        }
    }

    pub fn is_path_not_found(&self) -> bool {
        matches!(self, DriverError::PathNotFound { .. })
    }
}
