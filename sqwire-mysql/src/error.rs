//! Error types returned by the driver
use thiserror::Error;

/// A single warning collected from `SHOW WARNINGS`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    /// Warning level, e.g. `Warning` or `Note`
    pub level: String,
    /// Numeric warning code as reported by the server
    pub code: String,
    /// Human readable message
    pub message: String,
}

/// Join warnings into a single display string, one per line
fn fmt_warnings(warnings: &[Warning]) -> String {
    let mut msg = String::new();
    for (i, w) in warnings.iter().enumerate() {
        if i > 0 {
            msg.push_str("\r\n");
        }
        msg.push_str(&w.level);
        msg.push(' ');
        msg.push_str(&w.code);
        msg.push_str(": ");
        msg.push_str(&w.message);
    }
    msg
}

/// The cause of a driver error
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Operation on a torn-down or never-ready connection
    #[error("invalid connection")]
    InvalidConn,
    /// A packet violated the wire format
    #[error("malformed packet")]
    MalformedPacket,
    /// The received sequence number was behind the expected one
    #[error("commands out of sync. You can't run this command now")]
    PacketSync,
    /// The received sequence number was ahead of the expected one
    #[error("commands out of sync. Did you run multiple statements at once?")]
    PacketSyncMultiple,
    /// Outbound payload exceeds the negotiated maximum packet size
    #[error("packet for query is too large. You can change this value on the server by adjusting the 'max_allowed_packet' variable")]
    PacketTooLarge,
    /// The shared write buffer was not released
    #[error("busy buffer")]
    BusyBuffer,
    /// Server speaks a protocol older than version 10 / protocol 41
    #[error("the MySQL server does not support the required protocol 41+")]
    ProtocolTooOld,
    /// TLS was requested but the server did not offer it
    #[error("TLS requested but server does not support TLS")]
    NoTls,
    /// The server asked for pre-4.1 authentication and the DSN does not allow it
    #[error("this user requires old password authentication. If you still want to use it, add 'allowOldPasswords=1' to the DSN")]
    OldPassword,
    /// The server asked for cleartext authentication and the DSN does not allow it
    #[error("this user requires clear text authentication. If you still want to use it, add 'allowCleartextPasswords=1' to the DSN")]
    CleartextPassword,
    /// The server asked for an authentication plugin the driver does not implement
    #[error("the authentication plugin is not supported")]
    UnknownPlugin,
    /// The interpolator refused an argument type
    #[error("this argument type can not safely be interpolated. Use a prepared statement instead")]
    UnsafeInterpolate,
    /// Placeholder and argument counts differ
    #[error("interpolating query failed")]
    InterpolationFailed,
    /// Scan was invoked with no current row
    #[error("no row available")]
    NoRow,
    /// The DSN string could not be parsed
    #[error("invalid DSN: {0}")]
    InvalidDsn(String),
    /// A protocol feature the driver deliberately does not implement
    #[error("{0} not implemented")]
    Unsupported(&'static str),
    /// An ERR packet sent by the server
    #[error("server error {code}: {message}")]
    Server {
        /// Numeric server error code
        code: u16,
        /// Optional five byte SQLSTATE
        sqlstate: Option<[u8; 5]>,
        /// Error message
        message: String,
    },
    /// Server warnings elevated to an error by strict mode
    #[error("{}", fmt_warnings(.0))]
    Warnings(Vec<Warning>),
    /// Transport level failure
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ErrorKind {
    /// Errors that tear the connection down before they are returned.
    ///
    /// Server errors and warnings are recoverable at the application
    /// boundary and leave the connection usable.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::Io(_)
                | ErrorKind::MalformedPacket
                | ErrorKind::PacketSync
                | ErrorKind::PacketSyncMultiple
        )
    }
}

/// Error returned by every fallible driver operation
///
/// This is a box around [ErrorKind] so the error half of a `Result`
/// stays a single machine word.
pub struct Error(Box<ErrorKind>);

const _: () = {
    assert!(size_of::<Error>() == size_of::<usize>());
};

impl Error {
    /// Return the cause of the error
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }
}

impl std::ops::Deref for Error {
    type Target = ErrorKind;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<E: Into<ErrorKind>> From<E> for Error {
    fn from(value: E) -> Self {
        Error(Box::new(value.into()))
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

/// Result type returned by every fallible driver operation
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warnings_display_joins_lines() {
        let err = ErrorKind::Warnings(vec![
            Warning {
                level: "Warning".into(),
                code: "1264".into(),
                message: "Out of range".into(),
            },
            Warning {
                level: "Note".into(),
                code: "1050".into(),
                message: "Table exists".into(),
            },
        ]);
        let text = err.to_string();
        assert!(text.contains("Warning 1264: Out of range"));
        assert!(text.contains("\r\n"));
        assert!(text.contains("Note 1050: Table exists"));
    }

    #[test]
    fn server_error_display() {
        let err = ErrorKind::Server {
            code: 1045,
            sqlstate: Some(*b"28000"),
            message: "Access denied".into(),
        };
        assert_eq!(err.to_string(), "server error 1045: Access denied");
    }
}
