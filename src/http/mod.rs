//! Framework-agnostic request dispatcher.
//!
//! `Dispatcher::handle` is a pure async function from (method, path, body,
//! query, headers) to a response; the axum mount in main.rs is the only
//! adapter. Routes are compiled from a static table where specific paths
//! precede parametric ones.

pub mod handlers;
pub mod validation;

use std::collections::HashMap;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::state::LedgerCore;

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    pub headers: Vec<(String, String)>,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self {
            status: 200,
            body,
            headers: Vec::new(),
        }
    }

    pub fn created(body: Value) -> Self {
        Self {
            status: 201,
            body,
            headers: Vec::new(),
        }
    }
}

/// Per-request identity injected ahead of every handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub ledger_id: Uuid,
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteId {
    Ok,
    Health,
    ListAccounts,
    CreateAccount,
    GetAccount,
    GetBalance,
    GetAccountEntries,
    FreezeAccount,
    UnfreezeAccount,
    CloseAccount,
    Credit,
    Debit,
    Transfer,
    MultiTransfer,
    Refund,
    ListTransactions,
    GetTransaction,
    ListActiveHolds,
    CreateHold,
    CommitHold,
    VoidHold,
    ListEvents,
    VerifyEvents,
    VerifyBlocks,
    OutboxStats,
    AdminReconcile,
    AdminSealBlock,
}

/// Static route table. Order matters: a request takes the first row whose
/// method and pattern match, so /holds/active stays above /holds/:holdId.
const ROUTES: &[(&str, &str, RouteId)] = &[
    ("GET", "/ok", RouteId::Ok),
    ("GET", "/health", RouteId::Health),
    ("GET", "/accounts", RouteId::ListAccounts),
    ("POST", "/accounts", RouteId::CreateAccount),
    ("GET", "/accounts/:holderId/balance", RouteId::GetBalance),
    ("GET", "/accounts/:holderId/entries", RouteId::GetAccountEntries),
    ("POST", "/accounts/:holderId/freeze", RouteId::FreezeAccount),
    ("POST", "/accounts/:holderId/unfreeze", RouteId::UnfreezeAccount),
    ("POST", "/accounts/:holderId/close", RouteId::CloseAccount),
    ("GET", "/accounts/:holderId", RouteId::GetAccount),
    ("POST", "/transactions/credit", RouteId::Credit),
    ("POST", "/transactions/debit", RouteId::Debit),
    ("POST", "/transactions/transfer", RouteId::Transfer),
    ("POST", "/transactions/multi-transfer", RouteId::MultiTransfer),
    ("POST", "/transactions/refund", RouteId::Refund),
    ("GET", "/transactions", RouteId::ListTransactions),
    ("GET", "/transactions/:id", RouteId::GetTransaction),
    ("GET", "/holds/active", RouteId::ListActiveHolds),
    ("POST", "/holds/:holdId/commit", RouteId::CommitHold),
    ("POST", "/holds/:holdId/void", RouteId::VoidHold),
    ("POST", "/holds", RouteId::CreateHold),
    ("POST", "/events/verify", RouteId::VerifyEvents),
    ("GET", "/events/:aggregateType/:aggregateId", RouteId::ListEvents),
    ("GET", "/blocks/verify", RouteId::VerifyBlocks),
    ("GET", "/outbox/stats", RouteId::OutboxStats),
    ("POST", "/admin/reconcile", RouteId::AdminReconcile),
    ("POST", "/admin/blocks/seal", RouteId::AdminSealBlock),
];

/// Match a concrete path against a `:param` pattern.
pub fn match_path(pattern: &str, path: &str) -> Option<HashMap<String, String>> {
    let pattern_segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let path_segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if pattern_segments.len() != path_segments.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (pat, seg) in pattern_segments.iter().zip(&path_segments) {
        if let Some(name) = pat.strip_prefix(':') {
            params.insert(name.to_string(), (*seg).to_string());
        } else if pat != seg {
            return None;
        }
    }
    Some(params)
}

fn find_route(method: &str, path: &str) -> Option<(RouteId, HashMap<String, String>)> {
    for (route_method, pattern, id) in ROUTES {
        if *route_method != method {
            continue;
        }
        if let Some(params) = match_path(pattern, path) {
            return Some((*id, params));
        }
    }
    None
}

fn is_mutating(method: &str) -> bool {
    matches!(method, "POST" | "PUT" | "PATCH" | "DELETE")
}

fn error_response(err: &LedgerError) -> ApiResponse {
    ApiResponse {
        status: err.status(),
        body: json!({
            "error": {
                "code": err.code().as_str(),
                "message": err.public_message(),
            }
        }),
        headers: Vec::new(),
    }
}

fn security_headers() -> Vec<(String, String)> {
    vec![
        ("X-Content-Type-Options".to_string(), "nosniff".to_string()),
        ("X-Frame-Options".to_string(), "DENY".to_string()),
        (
            "Referrer-Policy".to_string(),
            "strict-origin-when-cross-origin".to_string(),
        ),
        (
            "Content-Security-Policy".to_string(),
            "default-src 'none'".to_string(),
        ),
    ]
}

#[derive(Clone)]
pub struct Dispatcher {
    core: LedgerCore,
}

impl Dispatcher {
    pub fn new(core: LedgerCore) -> Self {
        Self { core }
    }

    pub fn core(&self) -> &LedgerCore {
        &self.core
    }

    /// The single entry point for every HTTP request.
    pub async fn handle(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        query: HashMap<String, String>,
        headers: HashMap<String, String>,
    ) -> ApiResponse {
        let headers: HashMap<String, String> = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        let method = method.to_ascii_uppercase();
        let request_id = headers
            .get("x-request-id")
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut response = self
            .run_pipeline(&method, path, body, &query, &headers)
            .await
            .unwrap_or_else(|err| {
                if matches!(err, LedgerError::Internal(_) | LedgerError::ChainIntegrity(_)) {
                    tracing::error!(request_id, method, path, error = %err, "request failed");
                }
                error_response(&err)
            });

        response.headers.extend(security_headers());
        response
            .headers
            .push(("X-Request-Id".to_string(), request_id));
        response
    }

    async fn run_pipeline(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        query: &HashMap<String, String>,
        headers: &HashMap<String, String>,
    ) -> Result<ApiResponse> {
        // Origin gate: only when trusted origins are configured, and only
        // for mutating methods.
        let trusted = &self.core.config.trusted_origins;
        if is_mutating(method) && !trusted.is_empty() {
            let origin = headers.get("origin").map(|s| s.as_str()).unwrap_or("");
            if !trusted.iter().any(|t| t == origin) {
                return Err(LedgerError::InvalidArgument(
                    "origin not allowed".to_string(),
                ));
            }
        }

        // Rate limit before any routing work.
        let mut limit_headers: Vec<(String, String)> = Vec::new();
        if let Some(limiter) = &self.core.rate_limiter {
            let key = headers
                .get("x-actor-id")
                .or_else(|| headers.get("x-ledger-id"))
                .cloned()
                .unwrap_or_else(|| "anonymous".to_string());
            let decision = limiter
                .consume(
                    &key,
                    self.core.config.rate_limit.limit,
                    chrono::Duration::seconds(self.core.config.rate_limit.window_secs),
                )
                .await?;
            limit_headers.push((
                "X-RateLimit-Limit".to_string(),
                decision.limit.to_string(),
            ));
            limit_headers.push((
                "X-RateLimit-Remaining".to_string(),
                decision.remaining.to_string(),
            ));
            limit_headers.push((
                "X-RateLimit-Reset".to_string(),
                decision.reset_at.timestamp().to_string(),
            ));
            if !decision.allowed {
                let mut response = error_response(&LedgerError::RateLimited {
                    retry_after_secs: decision.retry_after_secs(),
                });
                response.headers.extend(limit_headers);
                response.headers.push((
                    "Retry-After".to_string(),
                    decision.retry_after_secs().to_string(),
                ));
                return Ok(response);
            }
        }

        if is_mutating(method) {
            let content_type = headers
                .get("content-type")
                .map(|s| s.as_str())
                .unwrap_or("");
            if !content_type.starts_with("application/json") {
                return Err(LedgerError::InvalidArgument(
                    "Content-Type must be application/json".to_string(),
                ));
            }
        }

        let Some((route, params)) = find_route(method, path) else {
            return Err(LedgerError::NotFound(format!("no route for {method} {path}")));
        };

        let ctx = self.request_context(route, headers)?;
        let mut response = self
            .invoke(route, &ctx, &params, body.unwrap_or_else(|| json!({})), query, headers)
            .await?;
        response.headers.extend(limit_headers);
        Ok(response)
    }

    fn request_context(
        &self,
        route: RouteId,
        headers: &HashMap<String, String>,
    ) -> Result<RequestContext> {
        let ledger_id = match headers.get("x-ledger-id") {
            Some(raw) => Uuid::parse_str(raw)
                .map_err(|_| LedgerError::InvalidArgument("invalid X-Ledger-Id".to_string()))?,
            None => self.core.default_ledger_id,
        };
        if matches!(route, RouteId::AdminReconcile | RouteId::AdminSealBlock) {
            let Some(expected) = &self.core.config.admin_key else {
                return Err(LedgerError::NotFound("admin routes disabled".to_string()));
            };
            if headers.get("x-admin-key") != Some(expected) {
                return Err(LedgerError::InvalidArgument("invalid admin key".to_string()));
            }
        }
        Ok(RequestContext {
            request_id: headers
                .get("x-request-id")
                .cloned()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ledger_id,
            actor: headers.get("x-actor-id").cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specific_routes_win_over_parametric_ones() {
        let (route, params) = find_route("GET", "/holds/active").unwrap();
        assert_eq!(route, RouteId::ListActiveHolds);
        assert!(params.is_empty());

        let (route, params) = find_route("POST", "/holds/7a1/commit").unwrap();
        assert_eq!(route, RouteId::CommitHold);
        assert_eq!(params["holdId"], "7a1");

        let (route, _) = find_route("GET", "/accounts/H1/balance").unwrap();
        assert_eq!(route, RouteId::GetBalance);
        let (route, params) = find_route("GET", "/accounts/H1").unwrap();
        assert_eq!(route, RouteId::GetAccount);
        assert_eq!(params["holderId"], "H1");
    }

    #[test]
    fn unknown_paths_and_methods_do_not_match() {
        assert!(find_route("GET", "/nope").is_none());
        assert!(find_route("DELETE", "/accounts").is_none());
        assert!(find_route("GET", "/accounts/H1/balance/extra").is_none());
    }

    #[test]
    fn path_params_are_extracted() {
        let params = match_path("/events/:aggregateType/:aggregateId", "/events/account/abc-123")
            .unwrap();
        assert_eq!(params["aggregateType"], "account");
        assert_eq!(params["aggregateId"], "abc-123");
        assert!(match_path("/events/:a/:b", "/events/account").is_none());
    }

    #[test]
    fn error_envelope_carries_code_and_status() {
        let response = error_response(&LedgerError::NotFound("account not found: H9".to_string()));
        assert_eq!(response.status, 404);
        assert_eq!(response.body["error"]["code"], "NOT_FOUND");
        assert_eq!(response.body["error"]["message"], "account not found: H9");

        let response = error_response(&LedgerError::Internal("secret detail".to_string()));
        assert_eq!(response.status, 500);
        assert_eq!(response.body["error"]["message"], "internal error");
    }

    #[test]
    fn mutating_methods_are_the_csrf_surface() {
        assert!(is_mutating("POST"));
        assert!(is_mutating("DELETE"));
        assert!(!is_mutating("GET"));
        assert!(!is_mutating("HEAD"));
    }
}
