mod service;
mod types;

pub use service::{AuthService, AuthStats, AuthStatsSnapshot};
pub use types::{
    AuthRequest, AuthResult, DomainLimit, FailureReason, SiteLimit, UserListSnapshot, UserRecord,
};
