use std::sync::Mutex;

use sqwire_mysql::{Conn, ErrorKind, Value, register_dial};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

// Client capability bits, mirroring the wire values.
const LONG_PASSWORD: u32 = 1;
const FOUND_ROWS: u32 = 2;
const LONG_FLAG: u32 = 4;
const CONNECT_WITH_DB: u32 = 8;
const LOCAL_FILES: u32 = 128;
const PROTOCOL_41: u32 = 512;
const TRANSACTIONS: u32 = 1 << 13;
const SECURE_CONNECTION: u32 = 1 << 15;
const PLUGIN_AUTH: u32 = 1 << 19;

const SERVER_CAPS: u32 = PROTOCOL_41 | SECURE_CONNECTION | PLUGIN_AUTH;

const SCRAMBLE: [u8; 20] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
    0x10, 0x11, 0x12, 0x13, 0x14,
];

/// Register a one-shot in-memory transport under `net` and hand back the
/// server end.
fn pipe(net: &str) -> DuplexStream {
    let (client, server) = tokio::io::duplex(1 << 20);
    let slot = Mutex::new(Some(client));
    register_dial(net, move |_addr: &str| {
        let stream = slot.lock().unwrap().take();
        Box::pin(async move {
            match stream {
                Some(s) => Ok(Box::new(s) as Box<dyn sqwire_mysql::AsyncStream>),
                None => Err(std::io::Error::other("transport already dialed")),
            }
        })
    });
    server
}

/// The scripted server half of a connection
struct Server {
    stream: DuplexStream,
    seq: u8,
}

impl Server {
    fn new(stream: DuplexStream) -> Self {
        Server { stream, seq: 0 }
    }

    async fn read_packet(&mut self) -> (u8, Vec<u8>) {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let seq = header[3];
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).await.unwrap();
        (seq, payload)
    }

    async fn write_packet(&mut self, payload: &[u8]) {
        let mut header = (payload.len() as u32).to_le_bytes();
        header[3] = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.stream.write_all(&header).await.unwrap();
        self.stream.write_all(payload).await.unwrap();
    }

    /// Send the v10 greeting and return the client's handshake response
    async fn handshake(&mut self) -> Vec<u8> {
        let mut greeting = vec![10u8];
        greeting.extend_from_slice(b"5.6.30-test\0");
        greeting.extend_from_slice(&99u32.to_le_bytes()); // connection id
        greeting.extend_from_slice(&SCRAMBLE[..8]);
        greeting.push(0);
        greeting.extend_from_slice(&(SERVER_CAPS as u16).to_le_bytes());
        greeting.push(33); // character set
        greeting.extend_from_slice(&0u16.to_le_bytes()); // status flags
        greeting.extend_from_slice(&((SERVER_CAPS >> 16) as u16).to_le_bytes());
        greeting.push(21); // auth plugin data length
        greeting.extend_from_slice(&[0u8; 10]);
        greeting.extend_from_slice(&SCRAMBLE[8..]);
        greeting.push(0);
        greeting.extend_from_slice(b"mysql_native_password\0");
        self.seq = 0;
        self.write_packet(&greeting).await;

        let (seq, response) = self.read_packet().await;
        assert_eq!(seq, 1, "handshake response must have sequence 1");
        response
    }

    async fn send_ok(&mut self, warnings: u16) {
        let mut ok = vec![0x00, 0x00, 0x00];
        ok.extend_from_slice(&2u16.to_le_bytes()); // autocommit
        ok.extend_from_slice(&warnings.to_le_bytes());
        self.write_packet(&ok).await;
    }

    async fn send_eof(&mut self) {
        let mut eof = vec![0xFE];
        eof.extend_from_slice(&0u16.to_le_bytes());
        eof.extend_from_slice(&2u16.to_le_bytes());
        self.write_packet(&eof).await;
    }

    /// Serve the `SELECT @@max_allowed_packet` probe issued after auth
    async fn serve_sysvar_probe(&mut self, value: &str) {
        let (seq, cmd) = self.read_packet().await;
        assert_eq!(seq, 0);
        assert_eq!(cmd[0], 0x03, "expected COM_QUERY");
        assert_eq!(&cmd[1..], b"SELECT @@max_allowed_packet");
        self.seq = 1;
        self.write_packet(&[1]).await;
        let coldef = column_definition("@@max_allowed_packet", 0xFD);
        self.write_packet(&coldef).await;
        self.send_eof().await;
        self.write_packet(&text_row(&[Some(value.as_bytes())])).await;
        self.send_eof().await;
    }

    /// Full connection phase with native auth and the sysvar probe
    async fn establish(&mut self) -> Vec<u8> {
        let response = self.handshake().await;
        self.seq = 2;
        self.send_ok(0).await;
        self.serve_sysvar_probe("16777216").await;
        response
    }

    /// Serve one text result set for an expected COM_QUERY
    async fn serve_query(&mut self, expect_sql: &[u8], columns: &[(&str, u8)], rows: &[Vec<Option<&[u8]>>]) {
        let (seq, cmd) = self.read_packet().await;
        assert_eq!(seq, 0);
        assert_eq!(cmd[0], 0x03);
        assert_eq!(&cmd[1..], expect_sql);
        self.seq = 1;
        self.write_packet(&[columns.len() as u8]).await;
        for (name, field_type) in columns {
            let coldef = column_definition(name, *field_type);
            self.write_packet(&coldef).await;
        }
        self.send_eof().await;
        for row in rows {
            self.write_packet(&text_row(row)).await;
        }
        self.send_eof().await;
    }
}

fn lenenc_str(buf: &mut Vec<u8>, s: &[u8]) {
    assert!(s.len() < 251);
    buf.push(s.len() as u8);
    buf.extend_from_slice(s);
}

fn column_definition(name: &str, field_type: u8) -> Vec<u8> {
    let mut p = Vec::new();
    lenenc_str(&mut p, b"def");
    lenenc_str(&mut p, b"");
    lenenc_str(&mut p, b"");
    lenenc_str(&mut p, b"");
    lenenc_str(&mut p, name.as_bytes());
    lenenc_str(&mut p, b"");
    p.push(0x0C);
    p.extend_from_slice(&33u16.to_le_bytes()); // character set
    p.extend_from_slice(&80u32.to_le_bytes()); // column length
    p.push(field_type);
    p.extend_from_slice(&0u16.to_le_bytes()); // flags
    p.push(0); // decimals
    p.extend_from_slice(&0u16.to_le_bytes()); // filler
    p
}

fn text_row(cells: &[Option<&[u8]>]) -> Vec<u8> {
    let mut p = Vec::new();
    for cell in cells {
        match cell {
            Some(v) => lenenc_str(&mut p, v),
            None => p.push(0xFB),
        }
    }
    p
}

#[tokio::test]
async fn handshake_response_layout() {
    let server = pipe("mock-hs");
    let task = tokio::spawn(async move {
        let mut srv = Server::new(server);
        let response = srv.establish().await;

        // Capability flags negotiated per the config and server offer:
        // no FOUND_ROWS (not configured), no LONG_FLAG (server did not
        // offer it).
        let caps = u32::from_le_bytes(response[..4].try_into().unwrap());
        let expected = LONG_PASSWORD
            | CONNECT_WITH_DB
            | LOCAL_FILES
            | PROTOCOL_41
            | TRANSACTIONS
            | SECURE_CONNECTION
            | PLUGIN_AUTH;
        assert_eq!(caps, expected);
        assert_eq!(caps & FOUND_ROWS, 0);
        assert_eq!(caps & LONG_FLAG, 0);

        // Max packet size is left at zero.
        assert_eq!(&response[4..8], &[0, 0, 0, 0]);
        // Default collation (utf8_general_ci) and the 23-byte filler.
        assert_eq!(response[8], 33);
        assert_eq!(&response[9..32], &[0u8; 23]);
        // User, scramble response, database, auth plugin.
        assert_eq!(&response[32..34], b"u\0");
        assert_eq!(response[34], 20, "native scramble response is 20 bytes");
        let after_auth = 35 + 20;
        assert_eq!(&response[after_auth..after_auth + 3], b"db\0");
        assert_eq!(&response[after_auth + 3..], b"mysql_native_password\0");
        assert_eq!(response.len(), 80);

        // COM_QUIT on close.
        let (seq, quit) = srv.read_packet().await;
        assert_eq!(seq, 0);
        assert_eq!(quit, vec![0x01]);
    });

    let mut conn = Conn::open("u:p@mock-hs(x)/db?strict=true&timeout=30s")
        .await
        .unwrap();
    conn.close().await.unwrap();
    // Close is idempotent and emits nothing further.
    conn.close().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn select_one_text_result() {
    let server = pipe("mock-select1");
    let task = tokio::spawn(async move {
        let mut srv = Server::new(server);
        srv.establish().await;
        srv.serve_query(b"SELECT 1", &[("1", 0x08)], &[vec![Some(b"1".as_slice())]])
            .await;
    });

    let mut conn = Conn::open("u:p@mock-select1(x)/db").await.unwrap();
    {
        let mut rows = conn.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(rows.column_names(), vec!["1".to_string()]);
        assert!(rows.next().await.unwrap());
        assert_eq!(rows.values().unwrap(), vec![Value::Bytes(b"1".to_vec())]);
        assert!(!rows.next().await.unwrap());
    }
    task.await.unwrap();
}

#[tokio::test]
async fn strict_mode_aggregates_warnings() {
    let server = pipe("mock-warn");
    let task = tokio::spawn(async move {
        let mut srv = Server::new(server);
        srv.establish().await;

        // The statement comes back OK but with three warnings attached.
        let (seq, cmd) = srv.read_packet().await;
        assert_eq!(seq, 0);
        assert_eq!(&cmd[1..], b"INSERT INTO t VALUES (300)");
        srv.seq = 1;
        srv.send_ok(3).await;

        // Strict mode must follow up with SHOW WARNINGS.
        let warning_columns = &[("Level", 0xFD), ("Code", 0xFD), ("Message", 0xFD)];
        let rows: Vec<Vec<Option<&[u8]>>> = vec![
            vec![Some(b"Warning"), Some(b"1264"), Some(b"Out of range value for column 'a'")],
            vec![Some(b"Warning"), Some(b"1264"), Some(b"Out of range value for column 'b'")],
            vec![Some(b"Note"), Some(b"1051"), Some(b"Unknown table 't2'")],
        ];
        srv.serve_query(b"SHOW WARNINGS", warning_columns, &rows).await;
    });

    let mut conn = Conn::open("u:p@mock-warn(x)/db?strict=true").await.unwrap();
    let err = conn
        .exec("INSERT INTO t VALUES (300)", &[])
        .await
        .unwrap_err();
    match err.kind() {
        ErrorKind::Warnings(warnings) => {
            assert_eq!(warnings.len(), 3);
            assert_eq!(warnings[0].level, "Warning");
            assert_eq!(warnings[0].code, "1264");
            assert_eq!(warnings[2].message, "Unknown table 't2'");
        }
        k => panic!("expected warnings, got {k:?}"),
    }
    task.await.unwrap();
}

#[tokio::test]
async fn old_password_switch_refused_without_optin() {
    let server = pipe("mock-old-no");
    let task = tokio::spawn(async move {
        let mut srv = Server::new(server);
        srv.handshake().await;
        srv.seq = 2;
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_old_password\0");
        srv.write_packet(&switch).await;
    });

    let err = Conn::open("u:p@mock-old-no(x)/db").await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::OldPassword));
    task.await.unwrap();
}

#[tokio::test]
async fn old_password_switch_retries_when_allowed() {
    let server = pipe("mock-old-yes");
    let task = tokio::spawn(async move {
        let mut srv = Server::new(server);
        srv.handshake().await;
        srv.seq = 2;
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_old_password\0");
        srv.write_packet(&switch).await;

        // Old-auth response: 8 scrambled bytes, null-terminated, with the
        // sequence continuing from the switch packet.
        let (seq, old_auth) = srv.read_packet().await;
        assert_eq!(seq, 3);
        assert_eq!(old_auth.len(), 9);
        assert_eq!(old_auth[8], 0);
        srv.seq = 4;
        srv.send_ok(0).await;
        srv.serve_sysvar_probe("16777216").await;
    });

    let mut conn = Conn::open("u:p@mock-old-yes(x)/db?allowOldPasswords=1")
        .await
        .unwrap();
    conn.close().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn cleartext_switch_retries_when_allowed() {
    let server = pipe("mock-clear");
    let task = tokio::spawn(async move {
        let mut srv = Server::new(server);
        srv.handshake().await;
        srv.seq = 2;
        let mut switch = vec![0xFE];
        switch.extend_from_slice(b"mysql_clear_password\0");
        srv.write_packet(&switch).await;

        let (seq, clear) = srv.read_packet().await;
        assert_eq!(seq, 3);
        assert_eq!(clear, b"secret\0");
        srv.seq = 4;
        srv.send_ok(0).await;
        srv.serve_sysvar_probe("16777216").await;
    });

    let mut conn = Conn::open("u:secret@mock-clear(x)/db?allowCleartextPasswords=1")
        .await
        .unwrap();
    conn.close().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn oversized_parameter_uses_send_long_data() {
    const BLOB_LEN: usize = 20 << 20;
    let server = pipe("mock-longdata");
    let task = tokio::spawn(async move {
        let mut srv = Server::new(server);
        srv.handshake().await;
        srv.seq = 2;
        srv.send_ok(0).await;
        // Cap the connection at 4 MiB.
        srv.serve_sysvar_probe("4194304").await;

        // COM_STMT_PREPARE for "SELECT ?".
        let (seq, cmd) = srv.read_packet().await;
        assert_eq!(seq, 0);
        assert_eq!(cmd[0], 0x16);
        assert_eq!(&cmd[1..], b"SELECT ?");
        srv.seq = 1;
        let mut prepare_ok = vec![0x00];
        prepare_ok.extend_from_slice(&7u32.to_le_bytes()); // statement id
        prepare_ok.extend_from_slice(&1u16.to_le_bytes()); // columns
        prepare_ok.extend_from_slice(&1u16.to_le_bytes()); // params
        prepare_ok.push(0);
        prepare_ok.extend_from_slice(&0u16.to_le_bytes()); // warnings
        srv.write_packet(&prepare_ok).await;
        let param_def = column_definition("?", 0xFD);
        srv.write_packet(&param_def).await;
        srv.send_eof().await;
        let col_def = column_definition("?", 0xFD);
        srv.write_packet(&col_def).await;
        srv.send_eof().await;

        // The oversized blob arrives ahead of the execute packet as
        // COM_STMT_SEND_LONG_DATA chunks, each its own sequence-0 command.
        let mut chunks = 0usize;
        let mut received = 0usize;
        loop {
            let (seq, cmd) = srv.read_packet().await;
            assert_eq!(seq, 0);
            match cmd[0] {
                0x18 => {
                    let stmt_id = u32::from_le_bytes(cmd[1..5].try_into().unwrap());
                    let param_id = u16::from_le_bytes(cmd[5..7].try_into().unwrap());
                    assert_eq!(stmt_id, 7);
                    assert_eq!(param_id, 0);
                    chunks += 1;
                    received += cmd.len() - 7;
                }
                0x17 => {
                    assert!(chunks >= 5, "expected >= 5 long-data chunks, got {chunks}");
                    assert_eq!(received, BLOB_LEN);
                    // stmt id, no cursor, one iteration, empty null
                    // bitmap, new-params-bound, one STRING type pair and
                    // no inline value.
                    assert_eq!(u32::from_le_bytes(cmd[1..5].try_into().unwrap()), 7);
                    assert_eq!(cmd[5], 0x00);
                    assert_eq!(u32::from_le_bytes(cmd[6..10].try_into().unwrap()), 1);
                    assert_eq!(cmd[10], 0x00);
                    assert_eq!(cmd[11], 0x01);
                    assert_eq!(cmd[12], 0xFE);
                    assert_eq!(cmd.len(), 14);
                    break;
                }
                other => panic!("unexpected command byte {other:#x}"),
            }
        }

        // Respond with a one-column result set, no rows.
        srv.seq = 1;
        srv.write_packet(&[1]).await;
        let col_def = column_definition("?", 0xFD);
        srv.write_packet(&col_def).await;
        srv.send_eof().await;
        srv.send_eof().await;
    });

    let mut conn = Conn::open("u:p@mock-longdata(x)/db").await.unwrap();
    let mut stmt = conn.prepare("SELECT ?").await.unwrap();
    assert_eq!(stmt.param_count(), 1);
    let blob = vec![0xAB; BLOB_LEN];
    stmt.exec(&[Value::Bytes(blob)]).await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn empty_result_set_for_rowless_query() {
    let server = pipe("mock-empty");
    let task = tokio::spawn(async move {
        let mut srv = Server::new(server);
        srv.establish().await;
        let (seq, cmd) = srv.read_packet().await;
        assert_eq!(seq, 0);
        assert_eq!(&cmd[1..], b"DO 1");
        srv.seq = 1;
        srv.send_ok(0).await;
    });

    let mut conn = Conn::open("u:p@mock-empty(x)/db").await.unwrap();
    let rows = conn.query("DO 1", &[]).await.unwrap();
    assert!(rows.columns().is_empty());
    let err = rows.values().unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::NoRow));
    task.await.unwrap();
}

#[tokio::test]
async fn undrained_rows_desync_the_next_command() {
    let server = pipe("mock-desync");
    let task = tokio::spawn(async move {
        let mut srv = Server::new(server);
        srv.establish().await;
        srv.serve_query(
            b"SELECT a FROM t",
            &[("a", 0xFD)],
            &[vec![Some(b"one".as_slice())], vec![Some(b"two".as_slice())]],
        )
        .await;
    });

    let mut conn = Conn::open("u:p@mock-desync(x)/db").await.unwrap();
    {
        let mut rows = conn.query("SELECT a FROM t", &[]).await.unwrap();
        assert!(rows.next().await.unwrap());
        // Dropped here with the second row and EOF still unread.
    }
    let err = conn.exec("DO 1", &[]).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::PacketSync));
    task.await.unwrap();
}

#[tokio::test]
async fn server_error_keeps_connection_usable() {
    let server = pipe("mock-err");
    let task = tokio::spawn(async move {
        let mut srv = Server::new(server);
        srv.establish().await;

        let (seq, cmd) = srv.read_packet().await;
        assert_eq!(seq, 0);
        assert_eq!(&cmd[1..], b"SELECT * FROM missing");
        srv.seq = 1;
        let mut err = vec![0xFF];
        err.extend_from_slice(&1146u16.to_le_bytes());
        err.push(b'#');
        err.extend_from_slice(b"42S02");
        err.extend_from_slice(b"Table 'db.missing' doesn't exist");
        srv.write_packet(&err).await;

        // Connection stays usable for the next command.
        srv.serve_query(b"SELECT 1", &[("1", 0x08)], &[vec![Some(b"1".as_slice())]])
            .await;
    });

    let mut conn = Conn::open("u:p@mock-err(x)/db").await.unwrap();
    let err = conn.exec("SELECT * FROM missing", &[]).await.unwrap_err();
    match err.kind() {
        ErrorKind::Server { code, message, .. } => {
            assert_eq!(*code, 1146);
            assert!(message.contains("doesn't exist"));
        }
        k => panic!("expected server error, got {k:?}"),
    }
    let mut rows = conn.query("SELECT 1", &[]).await.unwrap();
    assert!(rows.next().await.unwrap());
    task.await.unwrap();
}

#[tokio::test]
async fn interpolation_goes_over_the_wire_escaped() {
    let server = pipe("mock-interp");
    let task = tokio::spawn(async move {
        let mut srv = Server::new(server);
        srv.establish().await;
        let (seq, cmd) = srv.read_packet().await;
        assert_eq!(seq, 0);
        assert_eq!(&cmd[1..], b"SELECT 'it\\'s', 7".as_slice());
        srv.seq = 1;
        srv.send_ok(0).await;
    });

    let mut conn = Conn::open("u:p@mock-interp(x)/db").await.unwrap();
    conn.exec("SELECT ?, ?", &[Value::Text("it's".into()), Value::Int(7)])
        .await
        .unwrap();
    task.await.unwrap();
}
