/// Errors surfaced by the annotation store and the engine around it.
///
/// Every variant is recoverable: callers log it and carry on with the
/// document treated as having no (or unchanged) annotations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] tokio_rusqlite::Error),

    #[error("malformed annotation store for {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot serialize annotation store: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("no annotation store for {0}")]
    NoStore(String),

    #[error("annotation store already exists for {0}")]
    AlreadyExists(String),

    #[error("no annotation or reply {id} in {path}")]
    NotFound { path: String, id: String },

    #[error("edit at offset {offset} removing {len} bytes does not fit the buffer")]
    InvalidEdit { offset: usize, len: usize },
}

impl StoreError {
    pub(crate) fn not_found(path: &str, id: &str) -> Self {
        StoreError::NotFound {
            path: path.to_owned(),
            id: id.to_owned(),
        }
    }
}
