use super::{SniffProtocol, SniffResult, TestOutcome};

/// 识别的 HTTP 方法（按测试顺序）
const HTTP_METHODS: [&str; 7] = ["get", "post", "head", "put", "delete", "options", "connect"];

fn begins_with_http_method(b: &[u8]) -> TestOutcome {
    for method in HTTP_METHODS {
        if b.len() < method.len() {
            return TestOutcome::NeedMoreData;
        }
        if b[..method.len()].eq_ignore_ascii_case(method.as_bytes()) {
            return TestOutcome::Matched(SniffResult::new(SniffProtocol::Http, None));
        }
    }
    TestOutcome::NoMatch
}

/// 从 Host 头的值中去掉端口和 IPv6 方括号
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        };
    }

    match host.rsplit_once(':') {
        // 多于一个冒号的是裸 IPv6 地址
        Some((h, port)) if !h.contains(':') && port.bytes().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    }
}

/// HTTP/1.x 请求嗅探，返回 Host 头对应的域名
pub fn sniff_http(b: &[u8]) -> TestOutcome {
    match begins_with_http_method(b) {
        TestOutcome::Matched(_) => {}
        other => return other,
    }

    // 只解析以换行结尾的完整行，最后一个不完整的行等待更多数据
    let complete = match b.iter().rposition(|&c| c == b'\n') {
        Some(end) => &b[..end],
        None => return TestOutcome::NeedMoreData,
    };

    let mut host = None;
    for line in complete.split(|&c| c == b'\n').skip(1) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            break;
        }

        let Some(colon) = line.iter().position(|&c| c == b':') else {
            continue;
        };
        let key = String::from_utf8_lossy(&line[..colon]).to_lowercase();
        if key.trim() != "host" {
            continue;
        }

        let raw = String::from_utf8_lossy(&line[colon + 1..])
            .trim()
            .to_lowercase();
        let h = strip_port(&raw);
        if h.is_empty() {
            return TestOutcome::NoMatch;
        }
        host = Some(h.to_string());
    }

    match host {
        Some(h) => TestOutcome::Matched(SniffResult::new(SniffProtocol::Http, Some(h))),
        None => TestOutcome::NeedMoreData,
    }
}
