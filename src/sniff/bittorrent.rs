use super::{SniffProtocol, SniffResult, TestOutcome};

/// 握手前缀：长度字节 19 + "BitTorrent protocol"
const HANDSHAKE_PREFIX: &[u8; 20] = b"\x13BitTorrent protocol";

pub fn sniff_bittorrent(b: &[u8]) -> TestOutcome {
    if b.len() < HANDSHAKE_PREFIX.len() {
        return TestOutcome::NeedMoreData;
    }
    if &b[..HANDSHAKE_PREFIX.len()] == HANDSHAKE_PREFIX {
        TestOutcome::Matched(SniffResult::new(SniffProtocol::Bittorrent, None))
    } else {
        TestOutcome::NoMatch
    }
}
