use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("row not found: {entity} id={id}")]
    NotFound { entity: &'static str, id: i64 },

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid enum value in column {column}: {value}")]
    BadColumn { column: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
