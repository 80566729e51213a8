//! TLS ClientHello sniffing
//!
//! ```text
//! Record:      ContentType(1)=0x16 | Version(2) | Length(2) | Fragment
//! ClientHello: HandshakeType(1)=0x01 | Length(3) | Version(2) | Random(32)
//!              | SessionID(1+n) | CipherSuites(2+n) | Compression(1+n)
//!              | Extensions(2+n)
//! SNI:         Type(2)=0x0000 | Length(2) | ListLength(2)
//!              | NameType(1)=0x00 | NameLength(2) | Name
//! ```

use super::{SniffProtocol, SniffResult, TestOutcome};

const TLS_CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const TLS_HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 0x01;
const TLS_RECORD_HEADER_SIZE: usize = 5;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const SNI_HOST_NAME: u8 = 0x00;

fn be_u16(b: &[u8]) -> usize {
    (usize::from(b[0]) << 8) | usize::from(b[1])
}

/// 解析 ClientHello（record 的 fragment 部分），返回 SNI
///
/// `Err(())` 表示结构不合法。
fn read_client_hello(data: &[u8]) -> Result<Option<String>, ()> {
    if data.len() < 42 || data[0] != TLS_HANDSHAKE_TYPE_CLIENT_HELLO {
        return Err(());
    }

    let session_id_len = usize::from(data[38]);
    if session_id_len > 32 || data.len() < 39 + session_id_len + 2 {
        return Err(());
    }
    let data = &data[39 + session_id_len..];

    let cipher_suites_len = be_u16(data);
    if cipher_suites_len % 2 == 1 || data.len() < 2 + cipher_suites_len + 1 {
        return Err(());
    }
    let data = &data[2 + cipher_suites_len..];

    let compression_len = usize::from(data[0]);
    if data.len() < 1 + compression_len {
        return Err(());
    }
    let data = &data[1 + compression_len..];

    // 没有扩展的 ClientHello 是合法的，只是不带 SNI
    if data.is_empty() {
        return Ok(None);
    }
    if data.len() < 2 {
        return Err(());
    }
    let extensions_len = be_u16(data);
    let mut data = &data[2..];
    if extensions_len != data.len() {
        return Err(());
    }

    while !data.is_empty() {
        if data.len() < 4 {
            return Err(());
        }
        let extension = be_u16(data) as u16;
        let length = be_u16(&data[2..]);
        data = &data[4..];
        if data.len() < length {
            return Err(());
        }

        if extension == EXTENSION_SERVER_NAME {
            return read_server_name(&data[..length]).map(Some);
        }
        data = &data[length..];
    }

    Ok(None)
}

fn read_server_name(ext: &[u8]) -> Result<String, ()> {
    if ext.len() < 2 {
        return Err(());
    }
    let names_len = be_u16(ext);
    let mut d = &ext[2..];
    if d.len() != names_len {
        return Err(());
    }

    while !d.is_empty() {
        if d.len() < 3 {
            return Err(());
        }
        let name_type = d[0];
        let name_len = be_u16(&d[1..]);
        d = &d[3..];
        if d.len() < name_len {
            return Err(());
        }
        if name_type == SNI_HOST_NAME {
            let name = std::str::from_utf8(&d[..name_len]).map_err(|_| ())?;
            // RFC 6066: 主机名不能以点结尾
            if name.is_empty() || name.ends_with('.') {
                return Err(());
            }
            return Ok(name.to_string());
        }
        d = &d[name_len..];
    }

    Err(())
}

/// TLS 嗅探：只有完整的第一个 record 到达后才下结论
pub fn sniff_tls(b: &[u8]) -> TestOutcome {
    if b.len() < TLS_RECORD_HEADER_SIZE {
        return TestOutcome::NeedMoreData;
    }
    if b[0] != TLS_CONTENT_TYPE_HANDSHAKE || b[1] != 3 {
        return TestOutcome::NoMatch;
    }

    let record_len = be_u16(&b[3..5]);
    if TLS_RECORD_HEADER_SIZE + record_len > b.len() {
        return TestOutcome::NeedMoreData;
    }

    match read_client_hello(&b[TLS_RECORD_HEADER_SIZE..TLS_RECORD_HEADER_SIZE + record_len]) {
        Ok(domain) => TestOutcome::Matched(SniffResult::new(SniffProtocol::Tls, domain)),
        Err(()) => TestOutcome::NoMatch,
    }
}
