//! Crate-wide error types

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for broker operations
///
/// `Setup` covers the fatal class: problems detected before the event loop
/// starts (bad listen address, unreadable certificate, unsupported protocol).
/// Everything that happens to a single connection after setup is handled
/// locally and never surfaces through this type.
#[derive(Debug)]
pub enum Error {
    /// Fatal configuration or startup problem; the broker never ran
    Setup(String),
    /// I/O error outside any single connection's lifecycle
    Io(std::io::Error),
    /// TLS context or session construction error
    Tls(rustls::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Setup(msg) => write!(f, "Setup failed: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Tls(e) => write!(f, "TLS error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Setup(_) => None,
            Error::Io(e) => Some(e),
            Error::Tls(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_error_display() {
        let e = Error::Setup("no listen addresses".to_string());
        assert_eq!(e.to_string(), "Setup failed: no listen addresses");
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let e: Error = io.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("in use"));
    }
}
