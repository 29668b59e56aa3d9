//! Constants used in the mysql/mariadb protocol

/// Lowest protocol version the driver speaks
pub const MIN_PROTOCOL_VERSION: u8 = 10;

/// Largest payload a single frame can carry (2^24 - 1)
pub const MAX_PAYLOAD: usize = (1 << 24) - 1;

/// Default collation sent in the handshake response (utf8_general_ci)
pub const DEFAULT_COLLATION: u8 = 33;

/// Indicator bytes starting response payloads
pub(crate) mod indicator {
    pub const OK: u8 = 0x00;
    pub const LOCAL_INFILE: u8 = 0xFB;
    pub const EOF: u8 = 0xFE;
    pub const ERR: u8 = 0xFF;
}

/// Client capability flags
pub(crate) mod client {
    #![allow(unused)]
    pub const LONG_PASSWORD: u32 = 1;
    pub const FOUND_ROWS: u32 = 2;
    pub const LONG_FLAG: u32 = 4;
    pub const CONNECT_WITH_DB: u32 = 8;
    pub const LOCAL_FILES: u32 = 128;
    pub const PROTOCOL_41: u32 = 512;
    pub const SSL: u32 = 1 << 11;
    pub const TRANSACTIONS: u32 = 1 << 13;
    pub const SECURE_CONNECTION: u32 = 1 << 15;
    pub const PLUGIN_AUTH: u32 = 1 << 19;
}

/// Command bytes, the first payload byte of every request
pub(crate) mod com {
    /// Terminate the session, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_quit>
    pub const QUIT: u8 = 0x01;
    /// Query, see <https://mariadb.com/docs/server/reference/clientserver-protocol/2-text-protocol/com_query>
    pub const QUERY: u8 = 0x03;
    /// Prepare statement, see <https://mariadb.com/docs/server/reference/clientserver-protocol/3-binary-protocol-prepared-statements/com_stmt_prepare>
    pub const STMT_PREPARE: u8 = 0x16;
    /// Execute statement, see <https://mariadb.com/docs/server/reference/clientserver-protocol/3-binary-protocol-prepared-statements/com_stmt_execute>
    pub const STMT_EXECUTE: u8 = 0x17;
    /// Ship an oversized parameter ahead of execute, see <https://mariadb.com/docs/server/reference/clientserver-protocol/3-binary-protocol-prepared-statements/com_stmt_send_long_data>
    pub const STMT_SEND_LONG_DATA: u8 = 0x18;
    /// Close statement, see <https://mariadb.com/docs/server/reference/clientserver-protocol/3-binary-protocol-prepared-statements/3-binary-protocol-prepared-statements-com_stmt_close>
    pub const STMT_CLOSE: u8 = 0x19;
}

/// Server status flags carried on OK packets
pub(crate) mod status {
    #![allow(unused)]
    pub const IN_TRANS: u16 = 0x0001;
    pub const AUTOCOMMIT: u16 = 0x0002;
    pub const MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const NO_BACKSLASH_ESCAPES: u16 = 0x0200;
}

/// Field types as described in
/// <https://mariadb.com/docs/server/reference/clientserver-protocol/4-server-response-packets/result-set-packets#field-types>
pub mod type_ {
    #![allow(missing_docs)]
    pub const DECIMAL: u8 = 0x00;
    pub const TINY: u8 = 0x01;
    pub const SHORT: u8 = 0x02;
    pub const LONG: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const DOUBLE: u8 = 0x05;
    pub const NULL: u8 = 0x06;
    pub const TIMESTAMP: u8 = 0x07;
    pub const LONG_LONG: u8 = 0x08;
    pub const INT24: u8 = 0x09;
    pub const DATE: u8 = 0x0a;
    pub const TIME: u8 = 0x0b;
    pub const DATETIME: u8 = 0x0c;
    pub const YEAR: u8 = 0x0d;
    pub const NEW_DATE: u8 = 0x0e;
    pub const VAR_CHAR: u8 = 0x0f;
    pub const BIT: u8 = 0x10;
    pub const JSON: u8 = 0xf5;
    pub const NEW_DECIMAL: u8 = 0xf6;
    pub const ENUM: u8 = 0xf7;
    pub const SET: u8 = 0xf8;
    pub const TINY_BLOB: u8 = 0xf9;
    pub const MEDIUM_BLOB: u8 = 0xfa;
    pub const LONG_BLOB: u8 = 0xfb;
    pub const BLOB: u8 = 0xfc;
    pub const VAR_STRING: u8 = 0xfd;
    pub const STRING: u8 = 0xfe;
    pub const GEOMETRY: u8 = 0xff;
}

/// Bit flags used for fields as described in
/// <https://mariadb.com/docs/server/reference/clientserver-protocol/4-server-response-packets/result-set-packets#field-details-flag>
pub mod column_flag {
    /// Field can't be `NULL`.
    pub const NOT_NULL: u16 = 1;
    /// Field is unsigned.
    pub const UNSIGNED: u16 = 32;
}

/// Collations the driver knows by name.
///
/// Only the ascii, latin1, utf8 and utf8mb4 families are safe for
/// client-side interpolation; the other entries exist so that selecting
/// them produces a proper error instead of a silent fallback.
pub(crate) const COLLATIONS: &[(&str, u8)] = &[
    ("big5_chinese_ci", 1),
    ("latin1_swedish_ci", 8),
    ("ascii_general_ci", 11),
    ("utf8_general_ci", 33),
    ("utf8mb4_general_ci", 45),
    ("utf8mb4_bin", 46),
    ("latin1_bin", 47),
    ("latin1_general_ci", 48),
    ("latin1_general_cs", 49),
    ("binary", 63),
    ("ascii_bin", 65),
    ("utf8_bin", 83),
    ("utf8_unicode_ci", 192),
    ("utf8mb4_unicode_ci", 224),
    ("utf8mb4_0900_ai_ci", 255),
];

/// Return the collation id for a name, if known
pub(crate) fn collation_id(name: &str) -> Option<u8> {
    COLLATIONS.iter().find(|(n, _)| *n == name).map(|(_, id)| *id)
}

/// True if the named collation may be used with client-side interpolation
pub(crate) fn collation_is_safe(name: &str) -> bool {
    ["ascii_", "latin1_", "utf8_", "utf8mb4_"]
        .iter()
        .any(|p| name.starts_with(p))
}
