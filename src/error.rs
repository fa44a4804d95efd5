use thiserror::Error;

/// Error types for rperf2 operations.
///
/// The variants follow the failure surfaces of the measurement pipeline:
/// socket I/O, the wire-level test negotiation, flow lifecycle misuse,
/// and the settings that shape a test before any thread starts.
///
/// # Examples
///
/// ```
/// use rperf2::Error;
///
/// fn check_fps(fps: u32) -> Result<(), Error> {
///     if fps == 0 {
///         Err(Error::Isoch("frames-per-second must be >= 1".to_string()))
///     } else {
///         Ok(())
///     }
/// }
///
/// assert!(check_fps(0).is_err());
/// assert!(check_fps(60).is_ok());
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error occurred during socket setup or on the data path.
    ///
    /// Wraps `std::io::Error` for bind, read and write failures that are
    /// not expressed through a `PacketRecord`'s write-error marker.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer's negotiation header could not be decoded.
    ///
    /// Raised for truncated base/extend/udp-test blocks. Unknown flag
    /// bits are never an error; they are ignored and preserved.
    #[error("negotiation header error: {0}")]
    Negotiation(String),

    /// Failure establishing or maintaining the data connection, such as
    /// an unresolvable host or a refused connect.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid option value or flag combination.
    ///
    /// Reported before any traffic thread starts; the process exits
    /// non-zero.
    #[error("configuration error: {0}")]
    Config(String),

    /// Isochronous settings that cannot describe a traffic model, or an
    /// isochronous flow started without them.
    #[error("isochronous settings error: {0}")]
    Isoch(String),

    /// A flow or its thread left the reporting lifecycle abnormally,
    /// e.g. a traffic thread that died before posting its final record.
    #[error("flow state error: {0}")]
    FlowState(String),

    /// JSON export of a report snapshot failed.
    #[error("JSON export error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for rperf2 operations.
///
/// # Examples
///
/// ```
/// use rperf2::{Result, Error};
///
/// fn validate_threads(n: usize) -> Result<()> {
///     if n == 0 {
///         Err(Error::Config("parallel thread count must be >= 1".to_string()))
///     } else {
///         Ok(())
///     }
/// }
///
/// assert!(validate_threads(4).is_ok());
/// ```
pub type Result<T> = std::result::Result<T, Error>;
