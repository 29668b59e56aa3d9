//! Server-side prepared statements
use bytes::{BufMut, BytesMut};

use crate::connection::{Conn, ExecResult};
use crate::constants::{com, type_};
use crate::error::{ErrorKind, Result};
use crate::rows::{Column, Rows};
use crate::value::Value;

/// A prepared statement bound to its connection.
///
/// Released by [Stmt::close], which fires COM_STMT_CLOSE without waiting
/// for a response. The statement must not outlive its connection's Ready
/// state; operations on a closed connection fail with InvalidConnection.
pub struct Stmt<'a> {
    conn: &'a mut Conn,
    id: u32,
    param_count: usize,
    /// Column definitions cached from the first query result
    columns: Vec<Column>,
}

impl<'a> Stmt<'a> {
    pub(crate) fn new(conn: &'a mut Conn, id: u32, param_count: usize) -> Self {
        Stmt {
            conn,
            id,
            param_count,
            columns: Vec::new(),
        }
    }

    /// Server-assigned statement id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of `?` parameters the statement declares
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Execute the statement and discard any rows it produces
    pub async fn exec(&mut self, args: &[Value]) -> Result<ExecResult> {
        self.conn.check_ready()?;
        self.conn.reset_latches();
        self.write_execute(args).await?;
        let columns = self.conn.read_result_set_header().await?;
        if columns > 0 {
            self.conn.read_until_eof().await?;
            self.conn.read_until_eof().await?;
        }
        Ok(self.conn.exec_result())
    }

    /// Execute the statement and stream back binary-protocol rows
    pub async fn query(&mut self, args: &[Value]) -> Result<Rows<'_>> {
        self.conn.check_ready()?;
        self.write_execute(args).await?;
        let count = self.conn.read_result_set_header().await?;
        if count == 0 {
            return Ok(Rows::empty(self.conn));
        }
        if self.columns.is_empty() {
            self.columns = self.conn.read_columns(count).await?;
        } else {
            // Definitions are cached from the first execution; drain the
            // server's copy.
            self.conn.read_until_eof().await?;
        }
        self.conn.in_result = true;
        Ok(Rows::binary(self.conn, self.columns.clone()))
    }

    /// Release the statement. No server response is expected.
    pub async fn close(self) -> Result<()> {
        self.conn.check_ready()?;
        self.conn.framer.seq = 0;
        let mut buf = self.conn.framer.take_buffer()?;
        buf.put_u8(com::STMT_CLOSE);
        buf.put_u32(self.id);
        self.conn.framer.write_packet(buf).await
    }

    /// Compose and send the COM_STMT_EXECUTE packet.
    ///
    /// Values that would not fit the packet budget are shipped ahead via
    /// COM_STMT_SEND_LONG_DATA; the execute packet itself always goes out
    /// with sequence 0.
    async fn write_execute(&mut self, args: &[Value]) -> Result<()> {
        if args.len() != self.param_count {
            return Err(ErrorKind::InterpolationFailed.into());
        }
        self.conn.framer.seq = 0;
        let mut buf = self.conn.framer.take_buffer()?;
        buf.put_u8(com::STMT_EXECUTE);
        buf.put_u32(self.id);
        buf.put_u8(0x00); // no cursor
        buf.put_u32(1); // iteration count

        if !args.is_empty() {
            let null_offset = buf.0.len();
            let mask_len = (args.len() + 7) / 8;
            for _ in 0..mask_len {
                buf.put_u8(0);
            }
            buf.put_u8(0x01); // new params bound
            let type_offset = buf.0.len();
            for _ in 0..args.len() {
                buf.put_u16(0);
            }

            for (i, arg) in args.iter().enumerate() {
                if arg.is_null() {
                    buf.0[null_offset + i / 8] |= 1 << (i & 7);
                    buf.0[type_offset + 2 * i] = type_::NULL;
                    continue;
                }
                if let Some(blob) = arg.as_blob() {
                    // Keep headroom for the remaining parameters, the way
                    // the packet budget is shared between them.
                    let budget = self
                        .conn
                        .framer
                        .max_allowed
                        .saturating_sub(buf.0.len() + (args.len() - (i + 1)) * 64);
                    if blob.len() >= budget {
                        if let Err(e) = self.send_long_data(i as u16, blob).await {
                            self.conn.framer.return_buffer(buf);
                            return Err(e);
                        }
                        buf.0[type_offset + 2 * i] = type_::STRING;
                        continue;
                    }
                }
                buf.0[type_offset + 2 * i] = arg.binary_type();
                arg.write_binary(&mut buf, &self.conn.cfg.loc);
            }
        }

        self.conn.framer.seq = 0;
        self.conn.framer.write_packet(buf).await
    }

    /// Ship one oversized parameter in COM_STMT_SEND_LONG_DATA chunks.
    ///
    /// Each chunk is its own command with sequence 0 and carries at most
    /// max_allowed - 1 bytes of payload including the 7-byte prefix.
    async fn send_long_data(&mut self, param_id: u16, mut data: &[u8]) -> Result<()> {
        const PREFIX: usize = 1 + 4 + 2;
        let chunk_cap = (self.conn.framer.max_allowed - 1).saturating_sub(PREFIX).max(1);
        let mut buf = BytesMut::with_capacity(4 + PREFIX + data.len().min(chunk_cap));
        while !data.is_empty() {
            let n = data.len().min(chunk_cap);
            buf.clear();
            buf.put_u32(0); // header slack
            buf.put_u8(com::STMT_SEND_LONG_DATA);
            buf.put_u32_le(self.id);
            buf.put_u16_le(param_id);
            buf.put_slice(&data[..n]);
            self.conn.framer.seq = 0;
            self.conn.framer.write_packet_raw(&mut buf).await?;
            data = &data[n..];
        }
        self.conn.framer.seq = 0;
        Ok(())
    }
}
