//! Packet framing: 3-byte length + 1-byte sequence headers over a transport
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::constants::MAX_PAYLOAD;
use crate::error::{ErrorKind, Result};
use crate::transport::Transport;

/// Where the payload of the last read packet lives
enum Whence {
    /// Single frame, still inside the read buffer
    Buf(usize),
    /// Reassembled from multiple frames into the assembly buffer
    Assembly,
}

/// Reads and writes framed packets and keeps the two sides in sequence.
///
/// One framer owns the transport, the reusable read buffer, the shared
/// write buffer and the sequence counter. Read payloads stay valid only
/// until the next read.
pub(crate) struct Framer {
    stream: Transport,
    /// Buffered stream bytes not yet handed out
    rbuf: BytesMut,
    /// Length of the previously returned payload, consumed on next read
    skip_on_read: usize,
    /// Joined payload of a packet spanning multiple frames
    assembly: Vec<u8>,
    /// Shared write buffer; None while taken
    wbuf: Option<BytesMut>,
    /// Next expected/emitted sequence number
    pub(crate) seq: u8,
    /// Cap for a total outbound payload, negotiated after the handshake
    pub(crate) max_allowed: usize,
}

impl Framer {
    pub(crate) fn new(stream: Transport) -> Self {
        Framer {
            stream,
            rbuf: BytesMut::with_capacity(4096),
            skip_on_read: 0,
            assembly: Vec::new(),
            wbuf: Some(BytesMut::with_capacity(4096)),
            seq: 0,
            max_allowed: MAX_PAYLOAD,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.stream.is_closed()
    }

    /// Drop the transport. Further operations fail with a closed error.
    pub(crate) fn teardown(&mut self) {
        self.stream = Transport::Closed;
        self.rbuf.clear();
        self.skip_on_read = 0;
    }

    /// Perform the TLS handshake on the underlying stream.
    ///
    /// Must be called at a packet boundary; the server stays silent until
    /// the TLS handshake completes, so no buffered bytes may remain.
    pub(crate) async fn upgrade_tls(
        &mut self,
        connector: tokio_rustls::TlsConnector,
        server_name: tokio_rustls::rustls::pki_types::ServerName<'static>,
    ) -> Result<()> {
        self.rbuf.advance(self.skip_on_read);
        self.skip_on_read = 0;
        if !self.rbuf.is_empty() {
            return Err(ErrorKind::MalformedPacket.into());
        }
        self.stream.upgrade_tls(connector, server_name).await
    }

    /// Read the next packet, reassembling frames split at 2^24-1 bytes.
    ///
    /// The returned slice is valid until the next read. Any failure
    /// (transport, malformed length, sequence mismatch) tears the
    /// connection down before returning.
    pub(crate) async fn read_packet(&mut self) -> Result<&[u8]> {
        match self.read_inner().await {
            Ok(Whence::Buf(len)) => Ok(&self.rbuf[..len]),
            Ok(Whence::Assembly) => Ok(&self.assembly),
            Err(e) => {
                self.teardown();
                Err(e)
            }
        }
    }

    async fn read_inner(&mut self) -> Result<Whence> {
        self.rbuf.advance(self.skip_on_read);
        self.skip_on_read = 0;
        self.assembly.clear();
        let mut spans = false;
        loop {
            self.fill(4).await?;
            let header = u32::from_le_bytes(self.rbuf[..4].try_into().unwrap());
            let len = (header & 0xFF_FFFF) as usize;
            let seq = (header >> 24) as u8;
            // A zero-length frame is only valid as the terminator of a
            // split packet.
            if len < 1 && !spans {
                return Err(ErrorKind::MalformedPacket.into());
            }
            if seq != self.seq {
                return Err(if seq > self.seq {
                    ErrorKind::PacketSyncMultiple
                } else {
                    ErrorKind::PacketSync
                }
                .into());
            }
            self.seq = self.seq.wrapping_add(1);
            self.rbuf.advance(4);
            self.fill(len).await?;
            if len == MAX_PAYLOAD {
                self.assembly.extend_from_slice(&self.rbuf[..len]);
                self.rbuf.advance(len);
                spans = true;
                continue;
            }
            if spans {
                self.assembly.extend_from_slice(&self.rbuf[..len]);
                self.rbuf.advance(len);
                return Ok(Whence::Assembly);
            }
            self.skip_on_read = len;
            return Ok(Whence::Buf(len));
        }
    }

    /// Ensure at least n unconsumed bytes are buffered
    async fn fill(&mut self, n: usize) -> Result<()> {
        while self.rbuf.len() < n {
            if self.stream.read_buf(&mut self.rbuf).await? == 0 {
                return Err(ErrorKind::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Take the shared write buffer with 4 bytes of header slack reserved.
    ///
    /// Fails with BusyBuffer when the buffer has not been returned.
    pub(crate) fn take_buffer(&mut self) -> Result<PacketBuf> {
        let mut b = self.wbuf.take().ok_or(ErrorKind::BusyBuffer)?;
        b.clear();
        b.put_u32(0);
        Ok(PacketBuf(b))
    }

    /// Hand a taken buffer back without sending it
    pub(crate) fn return_buffer(&mut self, buf: PacketBuf) {
        self.wbuf = Some(buf.0);
    }

    /// Send the composed packet and release the shared buffer
    pub(crate) async fn write_packet(&mut self, buf: PacketBuf) -> Result<()> {
        let mut b = buf.0;
        let res = self.write_frames(&mut b).await;
        b.clear();
        self.wbuf = Some(b);
        if let Err(e) = &res {
            if e.is_fatal() {
                self.teardown();
            }
        }
        res
    }

    /// Send a packet composed in a caller-owned buffer (with header slack)
    pub(crate) async fn write_packet_raw(&mut self, buf: &mut BytesMut) -> Result<()> {
        let res = self.write_frames(buf).await;
        if let Err(e) = &res {
            if e.is_fatal() {
                self.teardown();
            }
        }
        res
    }

    async fn write_frames(&mut self, buf: &mut BytesMut) -> Result<()> {
        let total = buf.len() - 4;
        if total > self.max_allowed {
            return Err(ErrorKind::PacketTooLarge.into());
        }
        if total < MAX_PAYLOAD {
            let header = (total as u32) | ((self.seq as u32) << 24);
            buf[..4].copy_from_slice(&header.to_le_bytes());
            self.stream.write_all(buf).await?;
            self.stream.flush().await?;
            self.seq = self.seq.wrapping_add(1);
            return Ok(());
        }
        // Split into frames of at most 2^24-1 bytes. A payload that is an
        // exact multiple ends with a zero-length frame so the reader can
        // tell the message is complete.
        let mut off = 0;
        loop {
            let chunk = (total - off).min(MAX_PAYLOAD);
            let header = (chunk as u32) | ((self.seq as u32) << 24);
            self.stream.write_all(&header.to_le_bytes()).await?;
            self.stream.write_all(&buf[4 + off..4 + off + chunk]).await?;
            self.seq = self.seq.wrapping_add(1);
            off += chunk;
            if chunk < MAX_PAYLOAD {
                break;
            }
        }
        self.stream.flush().await?;
        Ok(())
    }
}

/// A write buffer with the 4-byte frame header slack at the front.
///
/// Composed packets are handed back to [Framer::write_packet] which fills
/// the header in.
#[derive(Debug)]
pub(crate) struct PacketBuf(pub(crate) BytesMut);

impl PacketBuf {
    #[inline]
    pub(crate) fn put_u8(&mut self, v: u8) {
        self.0.put_u8(v);
    }

    #[inline]
    pub(crate) fn put_u16(&mut self, v: u16) {
        self.0.put_u16_le(v);
    }

    #[inline]
    pub(crate) fn put_u24(&mut self, v: u32) {
        self.0.put_u8((v & 0xFF) as u8);
        self.0.put_u8(((v >> 8) & 0xFF) as u8);
        self.0.put_u8(((v >> 16) & 0xFF) as u8);
    }

    #[inline]
    pub(crate) fn put_u32(&mut self, v: u32) {
        self.0.put_u32_le(v);
    }

    #[inline]
    pub(crate) fn put_u64(&mut self, v: u64) {
        self.0.put_u64_le(v);
    }

    #[inline]
    pub(crate) fn put_i64(&mut self, v: i64) {
        self.0.put_i64_le(v);
    }

    #[inline]
    pub(crate) fn put_f64(&mut self, v: f64) {
        self.0.put_f64_le(v);
    }

    /// Append a length-encoded integer
    #[inline]
    pub(crate) fn put_lenenc(&mut self, v: u64) {
        if v < 0xFB {
            self.put_u8(v as u8);
        } else if v <= 0xFFFF {
            self.put_u8(0xFC);
            self.put_u16(v as u16);
        } else if v <= 0xFF_FFFF {
            self.put_u8(0xFD);
            self.put_u24(v as u32);
        } else {
            self.put_u8(0xFE);
            self.put_u64(v);
        }
    }

    #[inline]
    pub(crate) fn put_slice(&mut self, src: &[u8]) {
        self.0.put_slice(src);
    }

    /// Append a null-terminated string
    #[inline]
    pub(crate) fn put_str_null(&mut self, s: &str) {
        self.0.put_slice(s.as_bytes());
        self.0.put_u8(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_PAYLOAD;

    fn pair() -> (Framer, Framer) {
        let (a, b) = tokio::io::duplex(1 << 16);
        (
            Framer::new(Transport::Custom(Box::new(a))),
            Framer::new(Transport::Custom(Box::new(b))),
        )
    }

    #[tokio::test]
    async fn round_trip_advances_sequence() {
        let (mut tx, mut rx) = pair();
        for i in 0..3u8 {
            let mut b = tx.take_buffer().unwrap();
            b.put_slice(format!("payload {i}").as_bytes());
            tx.write_packet(b).await.unwrap();
            assert_eq!(tx.seq, i + 1);

            let got = rx.read_packet().await.unwrap();
            assert_eq!(got, format!("payload {i}").as_bytes());
            assert_eq!(rx.seq, i + 1);
        }
    }

    #[tokio::test]
    async fn splits_at_frame_boundary() {
        let (mut tx, mut rx) = pair();
        tx.max_allowed = MAX_PAYLOAD * 2;
        let payload = vec![0xAB; MAX_PAYLOAD];

        let mut b = tx.take_buffer().unwrap();
        b.put_slice(&payload);
        let write = async {
            tx.write_packet(b).await.unwrap();
            tx
        };
        let read = async {
            let got = rx.read_packet().await.unwrap().to_vec();
            (rx, got)
        };
        let (tx, (rx, got)) = tokio::join!(write, read);
        assert_eq!(got, payload);
        // One full frame plus the zero-length terminator on each side.
        assert_eq!(tx.seq, 2);
        assert_eq!(rx.seq, 2);
    }

    #[tokio::test]
    async fn splits_oversized_payload() {
        let (mut tx, mut rx) = pair();
        tx.max_allowed = MAX_PAYLOAD * 2;
        let payload = vec![0x5C; MAX_PAYLOAD + 12345];

        let mut b = tx.take_buffer().unwrap();
        b.put_slice(&payload);
        let write = async {
            tx.write_packet(b).await.unwrap();
            tx
        };
        let read = async {
            let got = rx.read_packet().await.unwrap().to_vec();
            (rx, got)
        };
        let (tx, (rx, got)) = tokio::join!(write, read);
        assert_eq!(got.len(), payload.len());
        assert_eq!(got, payload);
        assert_eq!(tx.seq, 2);
        assert_eq!(rx.seq, 2);
    }

    #[tokio::test]
    async fn too_large_payload_is_rejected_before_writing() {
        let (mut tx, mut rx) = pair();
        tx.max_allowed = 64;
        let mut b = tx.take_buffer().unwrap();
        b.put_slice(&[0u8; 65]);
        let err = tx.write_packet(b).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::PacketTooLarge));
        // Nothing went out and the connection is still usable.
        assert!(!tx.is_closed());
        let mut b = tx.take_buffer().unwrap();
        b.put_slice(b"ok");
        tx.write_packet(b).await.unwrap();
        assert_eq!(rx.read_packet().await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn sequence_mismatch_tears_down() {
        let (mut tx, mut rx) = pair();
        tx.seq = 3;
        let mut b = tx.take_buffer().unwrap();
        b.put_slice(b"late");
        tx.write_packet(b).await.unwrap();

        let err = rx.read_packet().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::PacketSyncMultiple));
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn zero_length_first_frame_is_malformed() {
        let (mut raw, server) = tokio::io::duplex(64);
        let mut rx = Framer::new(Transport::Custom(Box::new(server)));
        raw.write_all(&[0, 0, 0, 0]).await.unwrap();
        let err = rx.read_packet().await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::MalformedPacket));
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn busy_buffer_detected() {
        let (mut tx, _rx) = pair();
        let held = tx.take_buffer().unwrap();
        let err = tx.take_buffer().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::BusyBuffer));
        tx.return_buffer(held);
        assert!(tx.take_buffer().is_ok());
    }
}
