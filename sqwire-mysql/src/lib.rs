//! Async client implementation of the MySQL/MariaDB wire protocol
//!
//! The crate covers the connection-phase handshake with native, pre-4.1
//! and cleartext authentication, optional TLS, text queries with safe
//! client-side `?` interpolation, server-side prepared statements over
//! the binary protocol, and value decoding for every documented field
//! type.
//!
//! ```no_run
//! use sqwire_mysql::{Conn, Value};
//!
//! async fn example() -> sqwire_mysql::Result<()> {
//!     let mut conn = Conn::open("user:pw@tcp(127.0.0.1:3306)/shop?strict=true").await?;
//!     let mut rows = conn.query("SELECT id, name FROM item WHERE price < ?", &[Value::Int(100)]).await?;
//!     while rows.next().await? {
//!         let row = rows.values()?;
//!         println!("{row:?}");
//!     }
//!     Ok(())
//! }
//! ```
mod auth;
mod convert;
mod framing;
mod interpolate;
mod packet_parser;

pub mod connection;
pub mod constants;
pub mod dsn;
pub mod error;
pub mod rows;
pub mod stmt;
pub mod tls;
pub mod transport;
pub mod value;

pub use connection::{Conn, ExecResult};
pub use dsn::{Config, DialFuture, TimeLocation, parse_dsn, register_dial};
pub use error::{Error, ErrorKind, Result, Warning};
pub use rows::{Column, Rows};
pub use stmt::Stmt;
pub use tls::{TlsSetup, register_tls_config};
pub use transport::AsyncStream;
pub use value::Value;
