//! Result sets streamed from the server
use crate::connection::{Conn, parse_error_packet};
use crate::constants::indicator;
use crate::convert::{DecodeCtx, decode_binary_row, decode_text_row};
use crate::error::{ErrorKind, Result};
use crate::value::Value;

/// Column metadata decoded from a Column-Definition packet.
///
/// Immutable after decode.
#[derive(Clone, Debug)]
pub struct Column {
    /// Table name or alias; only captured under `columnsWithAlias`
    pub(crate) table: String,
    pub(crate) name: String,
    pub(crate) field_type: u8,
    pub(crate) flags: u16,
    pub(crate) decimals: u8,
}

impl Column {
    /// Column name as reported by the server
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table name or alias, when captured
    pub fn table(&self) -> Option<&str> {
        (!self.table.is_empty()).then_some(self.table.as_str())
    }

    /// Field type code, see [crate::constants::type_]
    pub fn type_code(&self) -> u8 {
        self.field_type
    }

    /// True when the UNSIGNED flag is set
    pub fn is_unsigned(&self) -> bool {
        self.flags & crate::constants::column_flag::UNSIGNED != 0
    }

    /// Declared decimal count
    pub fn decimals(&self) -> u8 {
        self.decimals
    }
}

enum RowsKind {
    /// Text-protocol rows from COM_QUERY
    Text,
    /// Binary-protocol rows from COM_STMT_EXECUTE
    Binary,
    /// A statement that produced no result set
    Empty,
}

/// A forward cursor over a result set.
///
/// The rows hold exclusive use of their connection until drained or
/// closed; dropping them mid-result leaves the connection out of sync and
/// the next command fails with a sync error. [Rows::close] drains cleanly
/// without closing the connection.
pub struct Rows<'a> {
    conn: &'a mut Conn,
    columns: Vec<Column>,
    kind: RowsKind,
    /// Payload of the current row (binary: values after the NULL bitmap)
    row: Vec<u8>,
    null_mask: Vec<u8>,
    has_row: bool,
    done: bool,
}

impl<'a> Rows<'a> {
    pub(crate) fn text(conn: &'a mut Conn, columns: Vec<Column>) -> Self {
        Rows {
            conn,
            columns,
            kind: RowsKind::Text,
            row: Vec::new(),
            null_mask: Vec::new(),
            has_row: false,
            done: false,
        }
    }

    pub(crate) fn binary(conn: &'a mut Conn, columns: Vec<Column>) -> Self {
        Rows {
            conn,
            columns,
            kind: RowsKind::Binary,
            row: Vec::new(),
            null_mask: Vec::new(),
            has_row: false,
            done: false,
        }
    }

    pub(crate) fn empty(conn: &'a mut Conn) -> Self {
        Rows {
            conn,
            columns: Vec::new(),
            kind: RowsKind::Empty,
            row: Vec::new(),
            null_mask: Vec::new(),
            has_row: false,
            done: true,
        }
    }

    /// Column metadata of the result set
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Column names; `tableAlias.colName` under `columnsWithAlias`
    pub fn column_names(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| match c.table() {
                Some(table) if self.conn.cfg.columns_with_alias => format!("{table}.{}", c.name),
                _ => c.name.clone(),
            })
            .collect()
    }

    /// Advance to the next row. Returns false once the set is exhausted.
    pub async fn next(&mut self) -> Result<bool> {
        if self.done {
            self.has_row = false;
            return Ok(false);
        }
        if self.conn.framer.is_closed() {
            return Err(ErrorKind::InvalidConn.into());
        }
        let packet = self.conn.framer.read_packet().await?;
        if packet[0] == indicator::EOF && packet.len() <= 5 {
            self.finish();
            return Ok(false);
        }
        if packet[0] == indicator::ERR {
            let err = parse_error_packet(packet);
            self.finish();
            return Err(err);
        }
        match self.kind {
            RowsKind::Text => {
                self.row.clear();
                self.row.extend_from_slice(packet);
            }
            RowsKind::Binary => {
                if packet[0] != indicator::OK {
                    return Err(ErrorKind::MalformedPacket.into());
                }
                let mask_len = (self.columns.len() + 7 + 2) / 8;
                if packet.len() < 1 + mask_len {
                    return Err(ErrorKind::MalformedPacket.into());
                }
                self.null_mask.clear();
                self.null_mask.extend_from_slice(&packet[1..1 + mask_len]);
                self.row.clear();
                self.row.extend_from_slice(&packet[1 + mask_len..]);
            }
            RowsKind::Empty => unreachable!("empty result set is always done"),
        }
        self.has_row = true;
        Ok(true)
    }

    /// Decode the current row into `dest`, one value per column.
    ///
    /// Fails with NoRow when no row is current. The destination is
    /// resized to the column count.
    pub fn scan(&self, dest: &mut Vec<Value>) -> Result<()> {
        if !self.has_row {
            return Err(ErrorKind::NoRow.into());
        }
        dest.clear();
        dest.resize(self.columns.len(), Value::Null);
        let ctx = DecodeCtx {
            parse_time: self.conn.cfg.parse_time,
            loc: &self.conn.cfg.loc,
        };
        match self.kind {
            RowsKind::Text => decode_text_row(&self.row, &self.columns, &ctx, dest),
            RowsKind::Binary => {
                decode_binary_row(&self.row, &self.null_mask, &self.columns, &ctx, dest)
            }
            RowsKind::Empty => Err(ErrorKind::NoRow.into()),
        }
    }

    /// Decode the current row into a fresh vector
    pub fn values(&self) -> Result<Vec<Value>> {
        let mut dest = Vec::new();
        self.scan(&mut dest)?;
        Ok(dest)
    }

    /// Drain any unread packets and release the connection.
    ///
    /// The connection itself stays open.
    pub async fn close(mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        if self.conn.framer.is_closed() {
            return Err(ErrorKind::InvalidConn.into());
        }
        loop {
            let packet = self.conn.framer.read_packet().await?;
            if packet[0] == indicator::EOF && packet.len() <= 5 {
                self.finish();
                return Ok(());
            }
            if packet[0] == indicator::ERR {
                let err = parse_error_packet(packet);
                self.finish();
                return Err(err);
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.has_row = false;
        self.conn.in_result = false;
    }
}
