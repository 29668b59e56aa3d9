//! Connection lifecycle: handshake, authentication, and the command phase
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;

use crate::auth::{scramble_native, scramble_old};
use crate::constants::{MIN_PROTOCOL_VERSION, client, com, indicator, status};
use crate::dsn::{Config, parse_dsn};
use crate::error::{ErrorKind, Result, Warning};
use crate::framing::Framer;
use crate::interpolate::interpolate_params;
use crate::packet_parser::PacketParser;
use crate::rows::{Column, Rows};
use crate::stmt::Stmt;
use crate::transport::Transport;
use crate::value::Value;

/// Outcome of a statement that does not return rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResult {
    /// Rows changed (or matched, under `clientFoundRows`)
    pub affected_rows: u64,
    /// AUTO_INCREMENT id assigned by the last insert
    pub last_insert_id: u64,
}

/// Fields of a decoded OK packet
struct OkPacket {
    affected_rows: u64,
    insert_id: u64,
    status: u16,
    warnings: u16,
}

/// A single connection to a MySQL/MariaDB server.
///
/// The connection is strictly request/response with one outstanding
/// command at a time; it must not be shared between tasks. An unclosed
/// [Rows] extends the current command boundary and the borrow checker
/// enforces the exclusivity.
pub struct Conn {
    pub(crate) framer: Framer,
    pub(crate) cfg: Config,
    server_caps: u32,
    /// Status flags from the most recent OK packet
    pub(crate) status: u16,
    affected_rows: u64,
    insert_id: u64,
    /// True while a result set has not been drained
    pub(crate) in_result: bool,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn").finish_non_exhaustive()
    }
}

impl Conn {
    /// Open a connection from a DSN string
    pub async fn open(dsn: &str) -> Result<Conn> {
        Conn::connect(parse_dsn(dsn)?).await
    }

    /// Open a connection from an already-parsed config
    pub async fn connect(cfg: Config) -> Result<Conn> {
        let transport = Transport::dial(&cfg).await?;
        let mut conn = Conn {
            framer: Framer::new(transport),
            cfg,
            server_caps: 0,
            status: 0,
            affected_rows: 0,
            insert_id: 0,
            in_result: false,
        };

        // Connection phase. Auth failures mean the server has already
        // dropped the transport, so no COM_QUIT on these paths.
        let scramble = match conn.read_init_packet().await {
            Ok(s) => s,
            Err(e) => {
                conn.framer.teardown();
                return Err(e);
            }
        };
        if let Err(e) = conn.write_handshake_response(&scramble).await {
            conn.framer.teardown();
            return Err(e);
        }
        if let Err(e) = conn.handle_auth_result(&scramble).await {
            conn.framer.teardown();
            return Err(e);
        }
        tracing::debug!(addr = %conn.cfg.addr, "handshake complete");

        // The server's cap wins over the handshake default, even when it
        // is smaller.
        match conn.get_system_var("max_allowed_packet").await {
            Ok(value) => {
                if let Ok(n) = std::str::from_utf8(&value).unwrap_or("").trim().parse::<usize>() {
                    if n > 1 {
                        conn.framer.max_allowed = n - 1;
                    }
                }
            }
            Err(e) => {
                let _ = conn.close().await;
                return Err(e);
            }
        }

        if let Err(e) = conn.handle_params().await {
            let _ = conn.close().await;
            return Err(e);
        }
        Ok(conn)
    }

    /// Send COM_QUIT best-effort and drop the transport. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.framer.is_closed() {
            return Ok(());
        }
        self.framer.seq = 0;
        match self.framer.take_buffer() {
            Ok(mut buf) => {
                buf.put_u8(com::QUIT);
                if let Err(e) = self.framer.write_packet(buf).await {
                    tracing::warn!(error = %e, "failed to send COM_QUIT");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to send COM_QUIT"),
        }
        self.framer.teardown();
        Ok(())
    }

    /// Execute a statement that returns no rows.
    ///
    /// Arguments are interpolated client-side into the query text, saving
    /// the prepare/close round trips.
    pub async fn exec(&mut self, query: &str, args: &[Value]) -> Result<ExecResult> {
        self.check_ready()?;
        let sql = self.render(query, args)?;
        self.reset_latches();
        self.simple_exec(&sql).await?;
        Ok(self.exec_result())
    }

    /// Run a query and stream back text-protocol rows
    pub async fn query(&mut self, query: &str, args: &[Value]) -> Result<Rows<'_>> {
        self.check_ready()?;
        let sql = self.render(query, args)?;
        self.write_command_str(com::QUERY, &sql).await?;
        let count = self.read_result_set_header().await?;
        if count == 0 {
            return Ok(Rows::empty(self));
        }
        let columns = self.read_columns(count).await?;
        self.in_result = true;
        Ok(Rows::text(self, columns))
    }

    /// Prepare a statement with `?` parameter placeholders
    pub async fn prepare(&mut self, query: &str) -> Result<Stmt<'_>> {
        self.check_ready()?;
        self.write_command_str(com::STMT_PREPARE, query.as_bytes()).await?;

        let (id, column_count, param_count, warnings) = {
            let packet = self.framer.read_packet().await?;
            if packet[0] == indicator::ERR {
                return Err(parse_error_packet(packet));
            }
            if packet[0] != indicator::OK {
                return Err(ErrorKind::MalformedPacket.into());
            }
            let mut p = PacketParser::new(&packet[1..]);
            let id = p.get_u32()?;
            let column_count = p.get_u16()? as usize;
            let param_count = p.get_u16()? as usize;
            let warnings = if p.remaining() >= 3 {
                p.get_u8()?; // filler
                p.get_u16()?
            } else {
                0
            };
            (id, column_count, param_count, warnings)
        };

        if param_count > 0 {
            self.read_until_eof().await?;
        }
        if column_count > 0 {
            self.read_until_eof().await?;
        }
        if self.cfg.strict && warnings > 0 {
            return Err(ErrorKind::Warnings(self.collect_warnings().await?).into());
        }
        Ok(Stmt::new(self, id, param_count))
    }

    /// Interpolate arguments into the query, or pass it through untouched
    fn render(&self, query: &str, args: &[Value]) -> Result<Vec<u8>> {
        if args.is_empty() {
            return Ok(query.as_bytes().to_vec());
        }
        interpolate_params(
            query,
            args,
            self.status & status::NO_BACKSLASH_ESCAPES != 0,
            self.framer.max_allowed,
            &self.cfg.loc,
        )
    }

    /// Send a query and drain its entire response
    pub(crate) async fn simple_exec(&mut self, sql: &[u8]) -> Result<()> {
        self.write_command_str(com::QUERY, sql).await?;
        let count = self.read_result_set_header().await?;
        if count > 0 {
            self.read_until_eof().await?;
            self.read_until_eof().await?;
        }
        Ok(())
    }

    /// Fail unless the connection is open and between commands
    pub(crate) fn check_ready(&self) -> Result<()> {
        if self.framer.is_closed() {
            return Err(ErrorKind::InvalidConn.into());
        }
        if self.in_result {
            // A result set is still being streamed; issuing another
            // command would mis-sequence the next packet.
            return Err(ErrorKind::PacketSync.into());
        }
        Ok(())
    }

    pub(crate) fn reset_latches(&mut self) {
        self.affected_rows = 0;
        self.insert_id = 0;
    }

    pub(crate) fn exec_result(&self) -> ExecResult {
        ExecResult {
            affected_rows: self.affected_rows,
            last_insert_id: self.insert_id,
        }
    }

    /// Compose and send a command packet; every command restarts at
    /// sequence 0
    pub(crate) async fn write_command_str(&mut self, cmd: u8, arg: &[u8]) -> Result<()> {
        if self.framer.is_closed() {
            return Err(ErrorKind::InvalidConn.into());
        }
        self.framer.seq = 0;
        let mut buf = self.framer.take_buffer()?;
        buf.put_u8(cmd);
        buf.put_slice(arg);
        self.framer.write_packet(buf).await
    }

    /// Parse the v10 greeting; returns the 20-byte scramble
    async fn read_init_packet(&mut self) -> Result<Vec<u8>> {
        let packet = self.framer.read_packet().await?;
        if packet[0] == indicator::ERR {
            return Err(parse_error_packet(packet));
        }
        if packet[0] < MIN_PROTOCOL_VERSION {
            return Err(ErrorKind::ProtocolTooOld.into());
        }
        let mut p = PacketParser::new(&packet[1..]);
        p.skip_null_str()?; // server version
        p.get_u32()?; // connection id
        let mut scramble = p.get_bytes(8)?.to_vec();
        p.get_u8()?; // filler
        let caps_low: u32 = p.get_u16()?.into();
        let mut server_caps = caps_low;
        if caps_low & client::PROTOCOL_41 == 0 {
            return Err(ErrorKind::ProtocolTooOld.into());
        }
        if self.cfg.tls.is_some() && caps_low & client::SSL == 0 {
            return Err(ErrorKind::NoTls.into());
        }
        if p.remaining() > 0 {
            p.get_u8()?; // character set
            p.get_u16()?; // status flags
            let caps_high: u32 = p.get_u16()?.into();
            server_caps |= caps_high << 16;
            p.get_u8()?; // auth plugin data length
            p.get_bytes(10)?; // reserved
            // Second scramble part is NUL terminated at byte 13; only the
            // 12 payload bytes matter.
            scramble.extend_from_slice(p.get_bytes(12)?);
        }
        self.server_caps = server_caps;
        Ok(scramble)
    }

    /// Compose the handshake response, upgrading to TLS first if asked
    async fn write_handshake_response(&mut self, scramble: &[u8]) -> Result<()> {
        let mut caps = client::PROTOCOL_41
            | client::SECURE_CONNECTION
            | client::LONG_PASSWORD
            | client::TRANSACTIONS
            | client::LOCAL_FILES
            | client::PLUGIN_AUTH
            | (self.server_caps & client::LONG_FLAG);
        if self.cfg.client_found_rows {
            caps |= client::FOUND_ROWS;
        }
        if self.cfg.tls.is_some() {
            caps |= client::SSL;
        }
        if !self.cfg.dbname.is_empty() {
            caps |= client::CONNECT_WITH_DB;
        }

        if let Some(tls) = self.cfg.tls.clone() {
            // SSL request prefix: the first 32 bytes of the response.
            let mut buf = self.framer.take_buffer()?;
            buf.put_u32(caps);
            buf.put_u32(0);
            buf.put_u8(self.cfg.collation);
            buf.put_slice(&[0u8; 23]);
            self.framer.write_packet(buf).await?;

            let config = tls.client_config()?;
            let host = self.cfg.addr.split(':').next().unwrap_or_default().to_string();
            let server_name = ServerName::try_from(host)
                .map_err(|e| ErrorKind::InvalidDsn(format!("invalid TLS server name: {e}")))?;
            self.framer
                .upgrade_tls(TlsConnector::from(config), server_name)
                .await?;
            tracing::debug!("TLS established");
        }

        let auth = scramble_native(scramble, &self.cfg.passwd);
        let mut buf = self.framer.take_buffer()?;
        buf.put_u32(caps);
        buf.put_u32(0); // max packet size: none
        buf.put_u8(self.cfg.collation);
        buf.put_slice(&[0u8; 23]);
        buf.put_str_null(&self.cfg.user);
        buf.put_u8(auth.len() as u8);
        buf.put_slice(&auth);
        if !self.cfg.dbname.is_empty() {
            buf.put_str_null(&self.cfg.dbname);
        }
        // Assume the native plugin; a switch request may follow.
        buf.put_str_null("mysql_native_password");
        self.framer.write_packet(buf).await
    }

    /// Await the auth result, retrying once on a permitted method switch
    async fn handle_auth_result(&mut self, scramble: &[u8]) -> Result<()> {
        match self.read_auth_result().await {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(e.kind(), ErrorKind::OldPassword)
                    && self.cfg.allow_old_passwords =>
            {
                let response = scramble_old(scramble, &self.cfg.passwd);
                let mut buf = self.framer.take_buffer()?;
                buf.put_slice(&response);
                buf.put_u8(0);
                self.framer.write_packet(buf).await?;
                self.read_auth_result().await
            }
            Err(e)
                if matches!(e.kind(), ErrorKind::CleartextPassword)
                    && self.cfg.allow_cleartext_passwords =>
            {
                let mut buf = self.framer.take_buffer()?;
                buf.put_str_null(&self.cfg.passwd);
                self.framer.write_packet(buf).await?;
                self.read_auth_result().await
            }
            Err(e) => Err(e),
        }
    }

    /// Read an OK, an auth-switch EOF, or an ERR after authentication
    async fn read_auth_result(&mut self) -> Result<()> {
        let parsed = {
            let packet = self.framer.read_packet().await?;
            match packet[0] {
                indicator::OK => parse_ok_packet(packet)?,
                indicator::EOF => {
                    if packet.len() == 1 {
                        return Err(ErrorKind::OldPassword.into());
                    }
                    let mut p = PacketParser::new(&packet[1..]);
                    return Err(match p.get_null_bytes().unwrap_or(&packet[1..]) {
                        b"mysql_old_password" => ErrorKind::OldPassword,
                        b"mysql_clear_password" => ErrorKind::CleartextPassword,
                        _ => ErrorKind::UnknownPlugin,
                    }
                    .into());
                }
                _ => return Err(parse_error_packet(packet)),
            }
        };
        self.finish_ok(parsed).await
    }

    /// Dispatch the first response packet of a query.
    ///
    /// Returns the column count; zero means the OK path was taken and the
    /// latches are up to date.
    pub(crate) async fn read_result_set_header(&mut self) -> Result<usize> {
        let count = {
            let packet = self.framer.read_packet().await?;
            match packet[0] {
                indicator::OK => {
                    let parsed = parse_ok_packet(packet)?;
                    self.finish_ok(parsed).await?;
                    return Ok(0);
                }
                indicator::ERR => return Err(parse_error_packet(packet)),
                indicator::LOCAL_INFILE => {
                    return Err(ErrorKind::Unsupported("LOAD DATA LOCAL INFILE").into());
                }
                _ => {
                    let mut p = PacketParser::new(packet);
                    let count = p.get_lenenc()?;
                    if p.remaining() != 0 {
                        return Err(ErrorKind::MalformedPacket.into());
                    }
                    count as usize
                }
            }
        };
        Ok(count)
    }

    /// Latch an OK packet; in strict mode warnings become an error
    async fn finish_ok(&mut self, ok: OkPacket) -> Result<()> {
        self.affected_rows = ok.affected_rows;
        self.insert_id = ok.insert_id;
        self.status = ok.status;
        if self.cfg.strict && ok.warnings > 0 {
            return Err(ErrorKind::Warnings(self.collect_warnings().await?).into());
        }
        Ok(())
    }

    /// Issue SHOW WARNINGS and gather the level/code/message triples
    async fn collect_warnings(&mut self) -> Result<Vec<Warning>> {
        self.write_command_str(com::QUERY, b"SHOW WARNINGS").await?;
        {
            let packet = self.framer.read_packet().await?;
            if packet[0] == indicator::ERR {
                return Err(parse_error_packet(packet));
            }
            if packet[0] == indicator::OK {
                return Ok(Vec::new());
            }
        }
        self.read_until_eof().await?; // column definitions
        let mut warnings = Vec::new();
        loop {
            let row = {
                let packet = self.framer.read_packet().await?;
                if packet[0] == indicator::EOF && packet.len() <= 5 {
                    break;
                }
                if packet[0] == indicator::ERR {
                    return Err(parse_error_packet(packet));
                }
                let mut p = PacketParser::new(packet);
                let level = p.get_lenenc_str()?.to_string();
                let code = p.get_lenenc_str()?.to_string();
                let message = p.get_lenenc_str()?.to_string();
                Warning {
                    level,
                    code,
                    message,
                }
            };
            warnings.push(row);
        }
        Ok(warnings)
    }

    /// Drain packets until a terminating EOF
    pub(crate) async fn read_until_eof(&mut self) -> Result<()> {
        loop {
            let packet = self.framer.read_packet().await?;
            if packet[0] == indicator::EOF && packet.len() <= 5 {
                return Ok(());
            }
            if packet[0] == indicator::ERR {
                return Err(parse_error_packet(packet));
            }
        }
    }

    /// Read `count` Column-Definition packets plus the trailing EOF
    pub(crate) async fn read_columns(&mut self, count: usize) -> Result<Vec<Column>> {
        let mut columns = Vec::with_capacity(count);
        loop {
            let column = {
                let packet = self.framer.read_packet().await?;
                if packet[0] == indicator::EOF && packet.len() <= 5 {
                    if columns.len() == count {
                        return Ok(columns);
                    }
                    return Err(ErrorKind::MalformedPacket.into());
                }
                if packet[0] == indicator::ERR {
                    return Err(parse_error_packet(packet));
                }
                let mut p = PacketParser::new(packet);
                p.skip_lenenc_str()?; // catalog
                p.skip_lenenc_str()?; // schema
                let table = if self.cfg.columns_with_alias {
                    p.get_lenenc_str()?.to_string()
                } else {
                    p.skip_lenenc_str()?;
                    String::new()
                };
                p.skip_lenenc_str()?; // original table
                let name = p.get_lenenc_str()?.to_string();
                p.skip_lenenc_str()?; // original name
                p.get_lenenc()?; // length of fixed-length fields
                p.get_u16()?; // character set
                p.get_u32()?; // column length
                let field_type = p.get_u8()?;
                let flags = p.get_u16()?;
                let decimals = p.get_u8()?;
                Column {
                    table,
                    name,
                    field_type,
                    flags,
                    decimals,
                }
            };
            columns.push(column);
        }
    }

    /// Fetch a system variable; the value of the single row's single cell
    async fn get_system_var(&mut self, name: &str) -> Result<Vec<u8>> {
        let sql = format!("SELECT @@{name}");
        self.write_command_str(com::QUERY, sql.as_bytes()).await?;
        let count = self.read_result_set_header().await?;
        if count == 0 {
            return Err(ErrorKind::MalformedPacket.into());
        }
        self.read_until_eof().await?; // column definitions
        let value = {
            let packet = self.framer.read_packet().await?;
            if packet[0] == indicator::ERR {
                return Err(parse_error_packet(packet));
            }
            if packet[0] == indicator::EOF && packet.len() <= 5 {
                return Err(ErrorKind::MalformedPacket.into());
            }
            let mut p = PacketParser::new(packet);
            p.get_nullable_lenenc_bytes()?.unwrap_or_default().to_vec()
        };
        self.read_until_eof().await?;
        Ok(value)
    }

    /// Apply DSN params as SET statements once the connection is ready
    async fn handle_params(&mut self) -> Result<()> {
        let params = self.cfg.params.clone();
        for (key, value) in &params {
            if key == "charset" {
                // A charset may not exist server-side; try each candidate.
                let mut last = Ok(());
                for charset in value.split(',') {
                    last = self.simple_exec(format!("SET NAMES {charset}").as_bytes()).await;
                    if last.is_ok() {
                        break;
                    }
                }
                last?;
            } else {
                self.simple_exec(format!("SET {key}={value}").as_bytes()).await?;
            }
        }
        Ok(())
    }
}

/// Decode an OK packet (first byte 0x00 already verified)
fn parse_ok_packet(payload: &[u8]) -> Result<OkPacket> {
    let mut p = PacketParser::new(&payload[1..]);
    let affected_rows = p.get_lenenc()?;
    let insert_id = p.get_lenenc()?;
    let status = p.get_u16()?;
    let warnings = p.get_u16()?;
    Ok(OkPacket {
        affected_rows,
        insert_id,
        status,
        warnings,
    })
}

/// Decode an ERR packet into a server error
pub(crate) fn parse_error_packet(payload: &[u8]) -> crate::error::Error {
    let mut p = PacketParser::new(&payload[1..]);
    let code = match p.get_u16() {
        Ok(code) => code,
        Err(_) => return ErrorKind::MalformedPacket.into(),
    };
    let rest = p.get_eof_bytes().unwrap_or_default();
    let (sqlstate, message) = if rest.first() == Some(&b'#') && rest.len() >= 6 {
        (Some(rest[1..6].try_into().unwrap()), &rest[6..])
    } else {
        (None, rest)
    };
    ErrorKind::Server {
        code,
        sqlstate,
        message: String::from_utf8_lossy(message).into_owned(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_packet_with_sqlstate() {
        let mut payload = vec![0xFF, 0x15, 0x04, b'#'];
        payload.extend_from_slice(b"28000");
        payload.extend_from_slice(b"Access denied for user");
        let err = parse_error_packet(&payload);
        match err.kind() {
            ErrorKind::Server {
                code,
                sqlstate,
                message,
            } => {
                assert_eq!(*code, 1045);
                assert_eq!(sqlstate.as_ref().unwrap(), b"28000");
                assert_eq!(message, "Access denied for user");
            }
            k => panic!("expected server error, got {k:?}"),
        }
    }

    #[test]
    fn error_packet_without_sqlstate() {
        let mut payload = vec![0xFF, 0xE8, 0x03];
        payload.extend_from_slice(b"borked");
        let err = parse_error_packet(&payload);
        match err.kind() {
            ErrorKind::Server {
                code,
                sqlstate,
                message,
            } => {
                assert_eq!(*code, 1000);
                assert!(sqlstate.is_none());
                assert_eq!(message, "borked");
            }
            k => panic!("expected server error, got {k:?}"),
        }
    }

    #[test]
    fn ok_packet_fields() {
        let payload = [0x00, 0x03, 0x07, 0x22, 0x00, 0x02, 0x00];
        let ok = parse_ok_packet(&payload).unwrap();
        assert_eq!(ok.affected_rows, 3);
        assert_eq!(ok.insert_id, 7);
        assert_eq!(ok.status, 0x22);
        assert_eq!(ok.warnings, 2);
    }
}
