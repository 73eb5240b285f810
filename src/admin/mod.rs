use crate::auth::{AuthRequest, AuthResult, AuthStatsSnapshot, UserRecord};
use crate::bandwidth::BandwidthConfig;
use crate::config::{AdminConfig, ConfigSnapshot};
use crate::dns::{DnsStatsSnapshot, IpVersion, ResolveOutcome};
use crate::server::{AclStatsSnapshot, CoreHandle};
use crate::utils::error::Result;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

const TOKEN_HEADER: &str = "arataga-admin-token";

#[derive(Clone)]
struct AdminState {
    core: Arc<CoreHandle>,
    token: Arc<str>,
}

/// Start the administrative entry point; returns the serving task and the
/// actual bound address.
pub async fn start_admin_server(
    config: &AdminConfig,
    core: Arc<CoreHandle>,
) -> Result<(JoinHandle<()>, SocketAddr)> {
    let listener =
        TcpListener::bind((config.bind_address.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;

    let state = AdminState {
        core,
        token: Arc::from(config.token.as_str()),
    };
    let router = build_router(state);

    info!("admin endpoint listening on {}", local_addr);

    let server = axum::serve(listener, router.into_make_service());

    let task = tokio::spawn(async move {
        if let Err(err) = server.await {
            error!("admin endpoint error: {}", err);
        }
    });

    Ok((task, local_addr))
}

fn build_router(state: AdminState) -> Router {
    Router::new()
        .route("/stats", get(current_stats))
        .route("/config", post(install_config))
        .route("/users", post(install_users))
        .route("/debug/auth", post(debug_auth))
        .route("/debug/dns-resolve", post(debug_dns_resolve))
        .with_state(state)
}

fn check_token(state: &AdminState, headers: &HeaderMap) -> std::result::Result<(), StatusCode> {
    let presented = headers
        .get(TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if presented == state.token.as_ref() {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}

#[derive(Debug, Serialize)]
struct StatsReport {
    generated_at: String,
    acls: Vec<AclStatsSnapshot>,
    auth: AuthStatsSnapshot,
    dns: DnsStatsSnapshot,
    active_users: usize,
    user_list_size: usize,
}

async fn current_stats(
    State(state): State<AdminState>,
    headers: HeaderMap,
) -> std::result::Result<Json<StatsReport>, StatusCode> {
    check_token(&state, &headers)?;

    Ok(Json(StatsReport {
        generated_at: chrono::Utc::now().to_rfc3339(),
        acls: state.core.acl_stats(),
        auth: state.core.auth_stats(),
        dns: state.core.dns_stats(),
        active_users: state.core.active_users(),
        user_list_size: state.core.user_list_size(),
    }))
}

#[derive(Debug, Serialize)]
struct InstallReply {
    status: &'static str,
}

async fn install_config(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(snapshot): Json<ConfigSnapshot>,
) -> std::result::Result<Json<InstallReply>, StatusCode> {
    check_token(&state, &headers)?;

    let status = if state.core.install_config_snapshot(snapshot) {
        "installed"
    } else {
        "unchanged"
    };
    Ok(Json(InstallReply { status }))
}

#[derive(Debug, Deserialize)]
struct InstallUsersRequest {
    users: Vec<UserRecord>,
}

async fn install_users(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(request): Json<InstallUsersRequest>,
) -> std::result::Result<Json<InstallReply>, StatusCode> {
    check_token(&state, &headers)?;

    state.core.install_user_list(request.users);
    Ok(Json(InstallReply {
        status: "installed",
    }))
}

#[derive(Debug, Deserialize)]
struct DebugAuthRequest {
    acl_in_addr: Ipv4Addr,
    acl_port: u16,
    user_ip: Ipv4Addr,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    target_host: String,
    target_port: u16,
}

#[derive(Debug, Serialize)]
struct DebugAuthReply {
    verdict: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bandwidth: Option<BandwidthConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

async fn debug_auth(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(request): Json<DebugAuthRequest>,
) -> std::result::Result<Json<DebugAuthReply>, StatusCode> {
    check_token(&state, &headers)?;

    let verdict = state
        .core
        .debug_authenticate(AuthRequest {
            acl_in_addr: request.acl_in_addr,
            acl_port: request.acl_port,
            user_ip: request.user_ip,
            username: request.username,
            password: request.password,
            target_host: request.target_host,
            target_port: request.target_port,
        })
        .await;

    let reply = match verdict {
        AuthResult::Successful {
            user_id,
            bandwidth,
            domain_limits,
        } => DebugAuthReply {
            verdict: "successful",
            user_id: Some(user_id),
            bandwidth: Some(bandwidth),
            domain_limit: domain_limits.map(|limit| limit.domain),
            reason: None,
        },
        AuthResult::Failed { reason } => DebugAuthReply {
            verdict: "failed",
            user_id: None,
            bandwidth: None,
            domain_limit: None,
            reason: Some(format!("{:?}", reason)),
        },
    };

    Ok(Json(reply))
}

#[derive(Debug, Deserialize)]
struct DebugDnsRequest {
    domain: String,
    #[serde(default = "default_ip_version")]
    ip_version: String,
}

fn default_ip_version() -> String {
    "v4".to_string()
}

#[derive(Debug, Serialize)]
struct DebugDnsReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn debug_dns_resolve(
    State(state): State<AdminState>,
    headers: HeaderMap,
    Json(request): Json<DebugDnsRequest>,
) -> std::result::Result<Json<DebugDnsReply>, StatusCode> {
    check_token(&state, &headers)?;

    let ip_version = match request.ip_version.as_str() {
        "v4" => IpVersion::V4,
        "v6" => IpVersion::V6,
        _ => return Err(StatusCode::BAD_REQUEST),
    };

    let reply = match state.core.debug_dns_resolve(&request.domain, ip_version).await {
        ResolveOutcome::Resolved(address) => DebugDnsReply {
            address: Some(address.to_string()),
            error: None,
        },
        ResolveOutcome::Failed { description } => DebugDnsReply {
            address: None,
            error: Some(description),
        },
    };

    Ok(Json(reply))
}
