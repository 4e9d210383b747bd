#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("The request failed")]
    RequestFailed,

    #[error("Unexpected response structure")]
    UnknownResponse,

    #[error(transparent)]
    File(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] Box<ureq::Error>),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

impl From<ureq::Error> for ExtractError {
    fn from(err: ureq::Error) -> Self {
        ExtractError::Http(Box::new(err))
    }
}
