//! 透明代理支持
//!
//! - iptables REDIRECT/DNAT：连接的本地地址是代理自己的端口，原始目标通过 `SO_ORIGINAL_DST` 取得
//! - iptables TPROXY：监听套接字需要 `IP_TRANSPARENT`，连接的本地地址就是原始目标
use socket2::Socket;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// 为监听套接字开启 `IP_TRANSPARENT`，使 TPROXY 转发的连接可以被接受
///
/// 需要 `CAP_NET_ADMIN`。没有权限时只记录警告并照常监听，REDIRECT 方式不受影响。
pub fn enable_transparent(socket: &Socket, addr: SocketAddr) {
    #[cfg(target_os = "linux")]
    {
        let result = if addr.is_ipv4() {
            socket.set_ip_transparent_v4(true)
        } else {
            socket.set_ip_transparent_v6(true)
        };
        match result {
            Ok(()) => tracing::debug!("IP_TRANSPARENT enabled on {}", addr),
            Err(e) => tracing::warn!(
                "Cannot enable IP_TRANSPARENT on {}: {} (TPROXY traffic will not be accepted)",
                addr,
                e
            ),
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = socket;
        tracing::debug!("IP_TRANSPARENT is not available on this platform, {} listens normally", addr);
    }
}

/// 恢复 TCP 连接被重定向之前的目标
///
/// 优先读取 `SO_ORIGINAL_DST`；没有 NAT 记录时（TPROXY 或未经重定向的连接）
/// 使用连接的本地地址。
pub fn original_destination(stream: &TcpStream) -> io::Result<SocketAddr> {
    let local = stream.local_addr()?;

    #[cfg(target_os = "linux")]
    {
        let sock = socket2::SockRef::from(stream);
        let original = if local.is_ipv4() {
            sock.original_dst_v4()
        } else {
            sock.original_dst_v6()
        };
        match original {
            Ok(addr) => {
                if let Some(addr) = addr.as_socket() {
                    return Ok(addr);
                }
            }
            Err(e) => tracing::trace!("SO_ORIGINAL_DST unavailable on {}: {}", local, e),
        }
    }

    Ok(local)
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Protocol, Type};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_unredirected_connection_uses_local_addr() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        assert_eq!(original_destination(&server).unwrap(), addr);
    }

    #[test]
    fn test_transparent_listener_binds_without_privilege() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();

        enable_transparent(&socket, addr);
        socket.bind(&addr.into()).unwrap();
        socket.listen(16).unwrap();
        assert!(socket.local_addr().unwrap().as_socket().unwrap().port() > 0);
    }
}
