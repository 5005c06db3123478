use thiserror::Error;

pub type SbxResult<T> = Result<T, SbxError>;

#[derive(Debug, Error)]
pub enum SbxError {
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_convert() {
        let err: SbxError = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, SbxError::Io(_)));
        assert_eq!(err.to_string(), "I/O error: denied");
    }
}
