/// Inbound handler tests: fixed and rotating port allocation, UDP forwarding
mod common;

use common::{
    build_dispatcher, get_available_port, get_available_port_range, start_udp_echo_server, tcp_roundtrip,
    FixedRouter, RecordingOutbound,
};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::time::timeout;
use traffic_dispatch::config::PortRange;
use traffic_dispatch::inbound::{AlwaysOnInboundHandler, DynamicInboundHandler, ForwardInbound, WorkerConfig};
use traffic_dispatch::outbound::DirectOutbound;
use traffic_dispatch::Worker;
use traffic_dispatch::stats::InboundStatsTracker;
use traffic_dispatch::{App, AppConfig, InboundConfig, InboundManager, Network, StatsManager};

fn template(tag: &str, networks: Vec<Network>) -> WorkerConfig {
    let outbound = RecordingOutbound::new("recorder");
    WorkerConfig {
        tag: tag.to_string(),
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        proxy: Arc::new(ForwardInbound::new(
            Some("tcp:10.0.0.1:80".parse().unwrap()),
            networks,
            false,
        )),
        dispatcher: build_dispatcher(outbound, FixedRouter::new("recorder")),
        sniffing: Vec::new(),
        receive_original_destination: false,
        allow_passive_connection: false,
        stats: InboundStatsTracker::new(tag.to_string()),
        rate_limiter: None,
    }
}

#[test]
fn test_always_on_tcp_only_range() {
    let handler = AlwaysOnInboundHandler::new(PortRange::new(10000, 10002), template("fixed", vec![Network::Tcp]));

    let tcp: Vec<u16> = handler
        .workers()
        .iter()
        .filter(|w| w.network() == Network::Tcp)
        .map(|w| w.port())
        .collect();
    let udp = handler.workers().iter().filter(|w| w.network() == Network::Udp).count();
    assert_eq!(tcp, vec![10000, 10001, 10002]);
    assert_eq!(udp, 0);
}

#[test]
fn test_always_on_both_networks() {
    let handler = AlwaysOnInboundHandler::new(
        PortRange::new(10000, 10001),
        template("fixed", vec![Network::Tcp, Network::Udp]),
    );
    assert_eq!(handler.workers().len(), 4);
    let (_, port) = handler.get_random_inbound_proxy().unwrap();
    assert!(PortRange::new(10000, 10001).contains(port));
}

#[tokio::test]
async fn test_always_on_listens_on_every_port() {
    let base = get_available_port_range(3);
    let handler = AlwaysOnInboundHandler::new(PortRange::new(base, base + 2), template("fixed", vec![Network::Tcp]));
    handler.start().await.unwrap();

    for port in base..=base + 2 {
        let reply = tcp_roundtrip(SocketAddr::from(([127, 0, 0, 1], port)), b"ping").await;
        assert_eq!(reply, b"ping");
    }

    handler.close().await;
    for port in base..=base + 2 {
        assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
    }
}

#[tokio::test]
async fn test_always_on_start_failure_releases_ports() {
    let base = get_available_port_range(3);
    let _blocker = std::net::TcpListener::bind(("127.0.0.1", base + 2)).unwrap();

    let handler = AlwaysOnInboundHandler::new(PortRange::new(base, base + 2), template("fixed", vec![Network::Tcp]));
    assert!(handler.start().await.is_err());

    // 已启动的 Worker 被关闭，端口可以重新绑定
    assert!(std::net::TcpListener::bind(("127.0.0.1", base)).is_ok());
    assert!(std::net::TcpListener::bind(("127.0.0.1", base + 1)).is_ok());
}

#[tokio::test]
async fn test_dynamic_rotation_has_no_overlap() {
    let base = get_available_port_range(100);
    let range = PortRange::new(base, base + 99);
    let handler = DynamicInboundHandler::new(
        range,
        2,
        Duration::from_secs(3600),
        template("rotating", vec![Network::Tcp]),
    );
    handler.start().await.unwrap();
    assert_eq!(handler.ports().len(), 2);

    for _ in 0..3 {
        let previous: HashSet<u16> = handler.ports().into_iter().collect();
        handler.refresh().await.unwrap();

        let current = handler.ports();
        let distinct: HashSet<u16> = current.iter().copied().collect();
        assert_eq!(current.len(), 2);
        assert_eq!(distinct.len(), 2);
        assert!(current.iter().all(|port| range.contains(*port)));
        assert!(distinct.is_disjoint(&previous));
        assert_eq!(handler.pending_recycle(), 0);
        assert_eq!(handler.worker_count(), 2);

        for port in &current {
            TcpStream::connect(("127.0.0.1", *port)).await.unwrap();
        }
        for port in &previous {
            assert!(TcpStream::connect(("127.0.0.1", *port)).await.is_err());
        }
    }

    handler.close().await;
    assert!(handler.ports().is_empty());
}

#[tokio::test]
async fn test_worker_close_releases_idle_flow() {
    // 上游接受连接后既不发送也不关闭
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let (accepted_tx, accepted_rx) = oneshot::channel();
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = upstream.accept().await.unwrap();
        let _ = accepted_tx.send(());
        let mut buf = [0u8; 16];
        let _ = socket.read(&mut buf).await;
        let _ = closed_tx.send(());
    });

    let mut config = template("idle", vec![Network::Tcp]);
    config.proxy = Arc::new(ForwardInbound::new(
        Some(format!("tcp:{upstream_addr}").parse().unwrap()),
        vec![Network::Tcp],
        false,
    ));
    config.dispatcher = build_dispatcher(
        Arc::new(DirectOutbound::new("direct".to_string())),
        FixedRouter::new("direct"),
    );
    let worker = Worker::new(Network::Tcp, config);
    worker.start().await.unwrap();

    let mut client = TcpStream::connect(worker.local_addr().unwrap()).await.unwrap();
    timeout(Duration::from_secs(5), accepted_rx)
        .await
        .expect("upstream was never dialed")
        .unwrap();

    worker.close().await;

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("client connection still open after close")
        .unwrap_or(0);
    assert_eq!(n, 0);
    timeout(Duration::from_secs(2), closed_rx)
        .await
        .expect("upstream connection still open after close")
        .unwrap();
}

#[tokio::test]
async fn test_udp_forward_through_direct() {
    let echo = start_udp_echo_server().await;
    let port = get_available_port();
    let config = AppConfig::from_toml_str(&format!(
        r#"
        [[inbounds]]
        tag = "udp-fwd"
        listen = "127.0.0.1"
        port_range = {port}
        destination = "udp:{echo}"
        network = ["udp"]

        [[outbounds]]
        tag = "direct"
        protocol = "direct"
        "#
    ))
    .unwrap();

    let app = App::from_config(&config).unwrap();
    app.start().await.unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 64];
    for payload in [&b"first datagram"[..], &b"second"[..]] {
        client.send_to(payload, ("127.0.0.1", port)).await.unwrap();
        let (n, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("UDP reply timed out")
            .unwrap();
        assert_eq!(&buf[..n], payload);
        assert_eq!(from.port(), port);
    }

    let stats = app.stats().get_inbound_stats("udp-fwd").unwrap();
    assert_eq!(stats.total_connections, 1);

    app.close().await;
}

#[tokio::test]
async fn test_inbound_manager_lifecycle() {
    let base = get_available_port_range(2);
    let configs = vec![
        InboundConfig::builder()
            .tag("first")
            .port_range(PortRange::single(base))
            .destination("tcp:10.0.0.1:80".parse().unwrap())
            .build()
            .unwrap(),
        InboundConfig::builder()
            .port_range(PortRange::single(base + 1))
            .destination("tcp:10.0.0.1:80".parse().unwrap())
            .build()
            .unwrap(),
    ];

    let dispatcher = build_dispatcher(RecordingOutbound::new("recorder"), FixedRouter::new("recorder"));
    let manager = InboundManager::from_configs(&configs, dispatcher, &StatsManager::new()).unwrap();
    assert_eq!(manager.tags(), vec!["first", "inbound-1"]);

    manager.start_all().await.unwrap();
    let (_, port) = manager.get_random_inbound_proxy("inbound-1").unwrap();
    assert_eq!(port, base + 1);
    assert_eq!(tcp_roundtrip(SocketAddr::from(([127, 0, 0, 1], base)), b"hi").await, b"hi");
    assert!(manager.get("missing").is_none());

    manager.close_all().await;
    assert!(std::net::TcpListener::bind(("127.0.0.1", base)).is_ok());
}

#[tokio::test]
async fn test_inbound_manager_start_failure_closes_started() {
    let base = get_available_port_range(2);
    let _blocker = std::net::TcpListener::bind(("127.0.0.1", base + 1)).unwrap();
    let configs: Vec<InboundConfig> = [base, base + 1]
        .iter()
        .map(|port| {
            InboundConfig::builder()
                .port_range(PortRange::single(*port))
                .destination("tcp:10.0.0.1:80".parse().unwrap())
                .build()
                .unwrap()
        })
        .collect();

    let dispatcher = build_dispatcher(RecordingOutbound::new("recorder"), FixedRouter::new("recorder"));
    let manager = InboundManager::from_configs(&configs, dispatcher, &StatsManager::new()).unwrap();
    assert!(manager.start_all().await.is_err());
    assert!(std::net::TcpListener::bind(("127.0.0.1", base)).is_ok());
}
