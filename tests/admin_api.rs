//! Administrative endpoint: token checks, snapshot installs, stats readback.

mod common;

use common::*;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const TOKEN: &str = "test-admin-token";

async fn admin_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&str>,
) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut request = format!("{} {} HTTP/1.1\r\nhost: admin\r\nconnection: close\r\n", method, path);
    if let Some(token) = token {
        request.push_str(&format!("arataga-admin-token: {}\r\n", token));
    }
    match body {
        Some(body) => {
            request.push_str(&format!(
                "content-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            ));
        }
        None => request.push_str("\r\n"),
    }

    stream.write_all(request.as_bytes()).await.unwrap();
    read_http_response(&mut stream).await
}

fn admin_config(dns_addr: SocketAddr) -> arataga::config::Config {
    let mut config = base_config(dns_addr);
    config.admin.enabled = true;
    config.admin.port = 0;
    config.admin.token = TOKEN.to_string();
    config.users = vec![user_record(1, "user", "12345")];
    config
}

#[tokio::test]
async fn requests_without_the_token_are_forbidden() {
    let dns = spawn_fake_dns(Ipv4Addr::LOCALHOST, Duration::ZERO).await;
    let (server, _acl) = start_proxy(admin_config(dns.addr)).await;
    let admin = server.admin_addr().expect("admin enabled");

    let (status, _) = admin_request(admin, "GET", "/stats", None, None).await;
    assert_eq!(status, 403);

    let (status, _) = admin_request(admin, "GET", "/stats", Some("wrong"), None).await;
    assert_eq!(status, 403);
}

#[tokio::test]
async fn stats_report_covers_all_subsystems() {
    let dns = spawn_fake_dns(Ipv4Addr::LOCALHOST, Duration::ZERO).await;
    let (server, _acl) = start_proxy(admin_config(dns.addr)).await;
    let admin = server.admin_addr().expect("admin enabled");

    let (status, body) = admin_request(admin, "GET", "/stats", Some(TOKEN), None).await;
    assert_eq!(status, 200);

    let report: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert!(report["acls"].is_array());
    assert!(report["acls"][0]["removal_reasons"]["normal_completion"].is_u64());
    assert!(report["auth"]["successful"].is_u64());
    assert!(report["dns"]["cache_hits"].is_u64());
}

#[tokio::test]
async fn installing_the_same_config_snapshot_twice_is_a_noop() {
    let dns = spawn_fake_dns(Ipv4Addr::LOCALHOST, Duration::ZERO).await;
    let (server, _acl) = start_proxy(admin_config(dns.addr)).await;
    let admin = server.admin_addr().expect("admin enabled");

    let snapshot = r#"{
        "default_bandwidth": { "inbound": 2048, "outbound": 2048 },
        "denied_ports": [25],
        "failed_auth_reply_ms": 500,
        "dns_cache_ttl_sec": 120,
        "dns_cache_cleanup_period_sec": 15
    }"#;

    let (status, body) =
        admin_request(admin, "POST", "/config", Some(TOKEN), Some(snapshot)).await;
    assert_eq!(status, 200);
    assert!(body.contains("installed"), "{}", body);

    let (status, body) =
        admin_request(admin, "POST", "/config", Some(TOKEN), Some(snapshot)).await;
    assert_eq!(status, 200);
    assert!(body.contains("unchanged"), "{}", body);
}

#[tokio::test]
async fn user_list_install_is_visible_to_the_auth_probe() {
    let dns = spawn_fake_dns(Ipv4Addr::LOCALHOST, Duration::ZERO).await;
    let (server, _acl) = start_proxy(admin_config(dns.addr)).await;
    let admin = server.admin_addr().expect("admin enabled");

    let probe = r#"{
        "acl_in_addr": "127.0.0.1",
        "acl_port": 0,
        "user_ip": "10.0.0.1",
        "username": "fresh",
        "password": "pw",
        "target_host": "example.com",
        "target_port": 443
    }"#;

    // Unknown before the install...
    let (status, body) = admin_request(admin, "POST", "/debug/auth", Some(TOKEN), Some(probe)).await;
    assert_eq!(status, 200);
    assert!(body.contains("failed"), "{}", body);

    let users = r#"{
        "users": [{
            "user_id": 7,
            "acl_in_addr": "127.0.0.1",
            "acl_port": 0,
            "username": "fresh",
            "password": "pw",
            "bandwidth": { "inbound": 0, "outbound": 0 }
        }]
    }"#;
    let (status, _) = admin_request(admin, "POST", "/users", Some(TOKEN), Some(users)).await;
    assert_eq!(status, 200);

    // ...and successful afterwards.
    let (status, body) = admin_request(admin, "POST", "/debug/auth", Some(TOKEN), Some(probe)).await;
    assert_eq!(status, 200);
    assert!(body.contains("successful"), "{}", body);
    assert!(body.contains("\"user_id\":7"), "{}", body);
}

#[tokio::test]
async fn dns_probe_uses_the_live_resolver() {
    let dns = spawn_fake_dns(Ipv4Addr::new(10, 9, 8, 7), Duration::ZERO).await;
    let (server, _acl) = start_proxy(admin_config(dns.addr)).await;
    let admin = server.admin_addr().expect("admin enabled");

    let probe = r#"{ "domain": "probe.example", "ip_version": "v4" }"#;
    let (status, body) =
        admin_request(admin, "POST", "/debug/dns-resolve", Some(TOKEN), Some(probe)).await;
    assert_eq!(status, 200);
    assert!(body.contains("10.9.8.7"), "{}", body);
}
