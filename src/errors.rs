use crate::extractors::errors::ExtractError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("an error occurred with the database connection")]
    Database(#[from] diesel::result::Error),

    #[error("an error occurred getting a database connection")]
    Pool(#[from] diesel::r2d2::PoolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] Box<ureq::Error>),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("an error occurred parsing the configuration file")]
    Config(#[from] serde_yaml::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("object store request failed: {0}")]
    Storage(String),

    #[error("gene prediction failed: {0}")]
    Prediction(String),

    #[error("invalid sequence file: {0}")]
    InvalidSequence(String),

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

impl From<ureq::Error> for Error {
    fn from(err: ureq::Error) -> Self {
        Error::Http(Box::new(err))
    }
}
