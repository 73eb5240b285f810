#![allow(dead_code)]

use arataga::auth::{SiteLimit, UserRecord};
use arataga::bandwidth::BandwidthConfig;
use arataga::config::{AclConfig, AclProtocol, Config};
use arataga::server::ProxyServer;
use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// A nameserver stub: answers every A query with the configured address and
/// counts the A queries it saw.
pub struct FakeDns {
    pub addr: SocketAddr,
    pub a_queries: Arc<AtomicUsize>,
}

pub async fn spawn_fake_dns(answer: Ipv4Addr, answer_delay: Duration) -> FakeDns {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind fake dns");
    let addr = socket.local_addr().expect("fake dns addr");
    let a_queries = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&a_queries);

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let query = match Message::from_vec(&buf[..n]) {
                Ok(query) => query,
                Err(_) => continue,
            };

            let mut response = Message::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .set_op_code(OpCode::Query)
                .set_recursion_desired(true)
                .set_recursion_available(true);

            if let Some(q) = query.queries().first() {
                response.add_query(q.clone());
                if q.query_type() == RecordType::A {
                    counter.fetch_add(1, Ordering::SeqCst);
                    response.add_answer(Record::from_rdata(
                        q.name().clone(),
                        60,
                        RData::A(A(answer)),
                    ));
                }
            }

            if !answer_delay.is_zero() {
                tokio::time::sleep(answer_delay).await;
            }

            let bytes = response.to_vec().expect("encode response");
            let _ = socket.send_to(&bytes, peer).await;
        }
    });

    FakeDns { addr, a_queries }
}

/// TCP server that echoes every byte back, one task per connection.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Minimal HTTP origin: answers every request on every connection with a
/// fixed body, framed by Content-Length; counts accepted connections.
pub struct FakeOrigin {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
}

pub async fn spawn_http_origin(body: &'static str) -> FakeOrigin {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind origin");
    let addr = listener.local_addr().expect("origin addr");
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    FakeOrigin { addr, connections }
}

pub fn user_record(user_id: u64, username: &str, password: &str) -> UserRecord {
    UserRecord {
        user_id,
        acl_in_addr: Ipv4Addr::LOCALHOST,
        acl_port: 0,
        user_ip: None,
        username: Some(username.to_string()),
        password: Some(password.to_string()),
        bandwidth: BandwidthConfig::default(),
        site_limits: Vec::new(),
    }
}

pub fn ip_user_record(user_id: u64, user_ip: Ipv4Addr) -> UserRecord {
    UserRecord {
        user_id,
        acl_in_addr: Ipv4Addr::LOCALHOST,
        acl_port: 0,
        user_ip: Some(user_ip),
        username: None,
        password: None,
        bandwidth: BandwidthConfig::default(),
        site_limits: Vec::new(),
    }
}

pub fn user_record_with_sites(
    user_id: u64,
    username: &str,
    password: &str,
    site_limits: Vec<SiteLimit>,
) -> UserRecord {
    UserRecord {
        site_limits,
        ..user_record(user_id, username, password)
    }
}

/// Base test configuration: one autodetect ACL on an ephemeral port, short
/// timeouts, the given nameserver.
pub fn base_config(dns_addr: SocketAddr) -> Config {
    let mut config = Config::default();
    config.acls = vec![AclConfig {
        protocol: AclProtocol::Auto,
        in_addr: Ipv4Addr::LOCALHOST,
        port: 0,
        out_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    }];
    config.timeouts.failed_auth_reply_ms = 100;
    config.timeouts.authentification_ms = 1_000;
    config.timeouts.dns_resolving_ms = 2_000;
    config.timeouts.connect_target_ms = 2_000;
    config.dns.nameservers = vec![dns_addr];
    config.dns.query_timeout_ms = 300;
    config.dns.query_attempts = 1;
    config
}

pub async fn start_proxy(config: Config) -> (Arc<ProxyServer>, SocketAddr) {
    let server = ProxyServer::new(config).await.expect("proxy starts");
    let acl_addr = server.listen_addrs().expect("listen addrs")[0];
    let server = Arc::new(server);

    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    (server, acl_addr)
}

/// Read one HTTP response (head + Content-Length body) off the stream.
pub async fn read_http_response(stream: &mut TcpStream) -> (u16, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.expect("read response head");
        assert!(n > 0, "connection closed before a complete response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");

    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        });

    let body = match content_length {
        Some(len) => {
            while buf.len() < head_end + len {
                let n = stream.read(&mut chunk).await.expect("read body");
                assert!(n > 0, "connection closed mid-body");
                buf.extend_from_slice(&chunk[..n]);
            }
            String::from_utf8_lossy(&buf[head_end..head_end + len]).to_string()
        }
        None => {
            // Close-delimited body.
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            String::from_utf8_lossy(&buf[head_end..]).to_string()
        }
    };

    (status, body)
}

/// Read everything until the peer closes.
pub async fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    buf
}
