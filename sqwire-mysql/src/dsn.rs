//! DSN parsing, runtime configuration, and the dial registry
//!
//! Grammar: `[user[:password]@][net[(addr)]]/dbname[?k=v&k=v...]`.
//! Parsing anchors on the last `/` since passwords and addresses may
//! contain one themselves.
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{FixedOffset, NaiveDateTime, TimeZone};
use once_cell::sync::Lazy;

use crate::constants::{DEFAULT_COLLATION, collation_id, collation_is_safe};
use crate::error::{ErrorKind, Result};
use crate::tls::{TlsSetup, lookup_tls_config};
use crate::transport::AsyncStream;

/// Future returned by a registered dial function
pub type DialFuture = Pin<Box<dyn Future<Output = io::Result<Box<dyn AsyncStream>>> + Send>>;

type DialFn = Arc<dyn Fn(&str) -> DialFuture + Send + Sync>;

static DIALS: Lazy<RwLock<HashMap<String, DialFn>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a custom dial function.
///
/// It can then be used through the network address `mynet(addr)` where
/// `mynet` is the registered network; `addr` is passed to the function.
/// The registry is process-wide and meant to be filled before opening
/// connections, not mutated during steady state.
pub fn register_dial(net: &str, dial: impl Fn(&str) -> DialFuture + Send + Sync + 'static) {
    DIALS
        .write()
        .expect("dial registry poisoned")
        .insert(net.to_string(), Arc::new(dial));
}

pub(crate) fn lookup_dial(net: &str) -> Option<DialFn> {
    DIALS.read().expect("dial registry poisoned").get(net).cloned()
}

/// The location date/time values are interpreted in.
///
/// The DSN `loc` option accepts `UTC`, `Local`, or a fixed `+HH:MM` /
/// `-HH:MM` offset. Named IANA zones beyond these are rejected at parse
/// time rather than silently mis-decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeLocation {
    /// Interpret timestamps as UTC (the default)
    #[default]
    Utc,
    /// Interpret timestamps in the system time zone
    Local,
    /// Interpret timestamps at a fixed offset from UTC
    Fixed(FixedOffset),
}

impl TimeLocation {
    pub(crate) fn parse(value: &str) -> Option<TimeLocation> {
        match value {
            "UTC" => Some(TimeLocation::Utc),
            "Local" => Some(TimeLocation::Local),
            _ => {
                let (sign, rest) = match value.split_at_checked(1)? {
                    ("+", rest) => (1, rest),
                    ("-", rest) => (-1, rest),
                    _ => return None,
                };
                let (hh, mm) = rest.split_once(':')?;
                let hours: i32 = hh.parse().ok()?;
                let minutes: i32 = mm.parse().ok()?;
                FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).map(TimeLocation::Fixed)
            }
        }
    }

    /// Wall-clock representation of an instant in this location
    pub(crate) fn naive_from_utc(&self, t: chrono::DateTime<chrono::Utc>) -> NaiveDateTime {
        match self {
            TimeLocation::Utc => t.naive_utc(),
            TimeLocation::Local => t.with_timezone(&chrono::Local).naive_local(),
            TimeLocation::Fixed(offset) => t.with_timezone(offset).naive_local(),
        }
    }

    /// Instant corresponding to a wall-clock time in this location.
    ///
    /// Ambiguous or skipped local times (DST transitions) resolve to the
    /// earliest matching instant, falling back to UTC interpretation.
    pub(crate) fn utc_from_naive(&self, n: NaiveDateTime) -> chrono::DateTime<chrono::Utc> {
        match self {
            TimeLocation::Utc => n.and_utc(),
            TimeLocation::Local => chrono::Local
                .from_local_datetime(&n)
                .earliest()
                .map(|t| t.with_timezone(&chrono::Utc))
                .unwrap_or_else(|| n.and_utc()),
            TimeLocation::Fixed(offset) => offset
                .from_local_datetime(&n)
                .earliest()
                .map(|t| t.with_timezone(&chrono::Utc))
                .unwrap_or_else(|| n.and_utc()),
        }
    }
}

/// Configuration parsed from a DSN string.
///
/// Immutable once a connection has been opened from it.
#[derive(Clone, Debug)]
pub struct Config {
    /// Username
    pub user: String,
    /// Password
    pub passwd: String,
    /// Network type: `tcp`, `unix`, or a registered dial name
    pub net: String,
    /// Network address
    pub addr: String,
    /// Database name
    pub dbname: String,
    /// Unrecognized DSN options, applied as `SET <k>=<v>` on connect
    pub params: BTreeMap<String, String>,
    /// Location for timestamp interpolation and decoding
    pub loc: TimeLocation,
    /// TLS policy, if any
    pub tls: Option<TlsSetup>,
    /// Dial timeout; zero means none
    pub timeout: Duration,
    /// Connection collation id
    pub collation: u8,
    /// Permit LOAD DATA LOCAL INFILE for any file name
    pub allow_all_files: bool,
    /// Permit the cleartext auth-switch retry
    pub allow_cleartext_passwords: bool,
    /// Permit the pre-4.1 auth-switch retry
    pub allow_old_passwords: bool,
    /// Request "found rows" semantics for UPDATE affected counts
    pub client_found_rows: bool,
    /// Report column names as `tableAlias.colName` when an alias is present
    pub columns_with_alias: bool,
    /// Decode date/time columns to timestamp values instead of bytes
    pub parse_time: bool,
    /// Elevate server warnings to errors via SHOW WARNINGS
    pub strict: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            user: String::new(),
            passwd: String::new(),
            net: String::new(),
            addr: String::new(),
            dbname: String::new(),
            params: BTreeMap::new(),
            loc: TimeLocation::Utc,
            tls: None,
            timeout: Duration::ZERO,
            collation: DEFAULT_COLLATION,
            allow_all_files: false,
            allow_cleartext_passwords: false,
            allow_old_passwords: false,
            client_found_rows: false,
            columns_with_alias: false,
            parse_time: false,
            strict: false,
        }
    }
}

fn invalid(msg: impl Into<String>) -> crate::error::Error {
    ErrorKind::InvalidDsn(msg.into()).into()
}

/// Parse a DSN string into a [Config]
pub fn parse_dsn(dsn: &str) -> Result<Config> {
    let mut cfg = Config::default();

    let slash = dsn.rfind('/');
    if slash.is_none() && !dsn.is_empty() {
        return Err(invalid("missing the slash separating the database name"));
    }
    if let Some(i) = slash {
        if i > 0 {
            // [user[:password]@][net[(addr)]]
            let left = &dsn[..i];
            let netpart = match left.rfind('@') {
                Some(at) => {
                    let userinfo = &left[..at];
                    match userinfo.split_once(':') {
                        Some((user, passwd)) => {
                            cfg.user = user.to_string();
                            cfg.passwd = passwd.to_string();
                        }
                        None => cfg.user = userinfo.to_string(),
                    }
                    &left[at + 1..]
                }
                None => left,
            };
            match netpart.find('(') {
                Some(open) => {
                    if !netpart.ends_with(')') {
                        if netpart[open + 1..].contains(')') {
                            return Err(invalid("did you forget to escape a param value?"));
                        }
                        return Err(invalid("network address not terminated (missing closing brace)"));
                    }
                    cfg.net = netpart[..open].to_string();
                    cfg.addr = netpart[open + 1..netpart.len() - 1].to_string();
                }
                None => cfg.net = netpart.to_string(),
            }
        }
        // dbname[?param1=value1&...]
        let right = &dsn[i + 1..];
        match right.split_once('?') {
            Some((dbname, params)) => {
                cfg.dbname = percent_decode(dbname)?;
                parse_dsn_params(&mut cfg, params)?;
            }
            None => cfg.dbname = percent_decode(right)?,
        }
    }

    if cfg.net.is_empty() {
        cfg.net = "tcp".to_string();
    }
    if cfg.addr.is_empty() {
        match cfg.net.as_str() {
            "tcp" => cfg.addr = "127.0.0.1:3306".to_string(),
            "unix" => cfg.addr = "/tmp/mysql.sock".to_string(),
            net if lookup_dial(net).is_some() => {}
            net => return Err(invalid(format!("default addr for network '{net}' unknown"))),
        }
    }

    Ok(cfg)
}

/// Parse the DSN "query string"; values must be query-escaped
fn parse_dsn_params(cfg: &mut Config, params: &str) -> Result<()> {
    for kv in params.split('&') {
        let Some((key, value)) = kv.split_once('=') else {
            continue;
        };
        match key {
            "allowAllFiles" => cfg.allow_all_files = read_bool(value)?,
            "allowCleartextPasswords" => cfg.allow_cleartext_passwords = read_bool(value)?,
            "allowOldPasswords" => cfg.allow_old_passwords = read_bool(value)?,
            "clientFoundRows" => cfg.client_found_rows = read_bool(value)?,
            "columnsWithAlias" => cfg.columns_with_alias = read_bool(value)?,
            "parseTime" => cfg.parse_time = read_bool(value)?,
            "strict" => cfg.strict = read_bool(value)?,

            "collation" => {
                let name = percent_decode(value)?;
                let id = collation_id(&name).ok_or_else(|| invalid("unknown collation"))?;
                if !collation_is_safe(&name) {
                    return Err(invalid(
                        "interpolation requires an ascii, latin1, utf8 or utf8mb4 collation",
                    ));
                }
                cfg.collation = id;
            }

            "compress" => return Err(ErrorKind::Unsupported("compression").into()),

            "loc" => {
                let name = percent_decode(value)?;
                cfg.loc = TimeLocation::parse(&name)
                    .ok_or_else(|| invalid(format!("unknown location '{name}'")))?;
            }

            "timeout" => {
                let raw = percent_decode(value)?;
                cfg.timeout = humantime::parse_duration(&raw)
                    .map_err(|e| invalid(format!("invalid timeout value: {e}")))?;
            }

            "tls" => {
                if let Ok(on) = read_bool(value) {
                    cfg.tls = on.then_some(TlsSetup::Standard);
                } else {
                    let name = percent_decode(value)?;
                    if name.eq_ignore_ascii_case("skip-verify") {
                        cfg.tls = Some(TlsSetup::SkipVerify);
                    } else if let Some(config) = lookup_tls_config(&name) {
                        cfg.tls = Some(TlsSetup::Custom(config));
                    } else {
                        return Err(invalid(format!("unknown TLS config name '{name}'")));
                    }
                }
            }

            _ => {
                cfg.params
                    .insert(key.to_string(), percent_decode(value)?);
            }
        }
    }
    Ok(())
}

fn read_bool(value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(invalid(format!("invalid bool value: {value}"))),
    }
}

/// Undo query escaping: `%XX` sequences and `+` for space
fn percent_decode(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| invalid(format!("invalid escape in value: {value}")))?;
                out.push(hex);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| invalid(format!("value is not utf-8: {value}")))
}
