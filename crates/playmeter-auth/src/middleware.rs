//! Actix-web request extractors
//!
//! [`DeviceHeaders`] pulls the signing envelope off a device request; the
//! body is verified separately once it has been read. The portal extractors
//! validate a JWT and enforce roles.

use crate::claims::Claims;
use crate::jwt::JwtService;
use actix_web::{
    dev::{Payload, ServiceRequest},
    web, FromRequest, HttpRequest,
};
use futures::future::{ready, Ready};
use playmeter_core::error::AppError;
use playmeter_core::models::UserRole;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, warn};
use actix_web::HttpMessage;

pub const ACCESS_KEY_HEADER: &str = "X-Access-Key";
pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const NONCE_HEADER: &str = "X-Nonce";

// ===== Device requests =====

/// Signing envelope of a device request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHeaders {
    pub access_key: String,
    pub signature: String,
    /// Unix seconds the device signed at
    pub timestamp: i64,
    pub nonce: String,
    pub method: String,
    pub path: String,
    /// Client address, used for per-address limits and anomaly tracking
    pub source_address: String,
}

fn required_header(req: &HttpRequest, name: &str) -> Result<String, AppError> {
    let value = req
        .headers()
        .get(name)
        .ok_or_else(|| AppError::MissingField(name.to_string()))?
        .to_str()
        .map_err(|_| AppError::invalid_field(name, "header is not valid ASCII"))?
        .trim();

    if value.is_empty() {
        return Err(AppError::MissingField(name.to_string()));
    }
    Ok(value.to_string())
}

/// Proxies allowed to report the client address through `X-Forwarded-For`
///
/// Registered as `web::Data<TrustedProxies>`. Without it, or when the
/// socket peer is not listed, the peer address is used as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedProxies(Vec<IpAddr>);

impl TrustedProxies {
    /// Parse a comma separated list of IP addresses
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the first entry that is not an IP
    pub fn parse(list: &str) -> Result<Self, AppError> {
        list.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                entry.parse::<IpAddr>().map_err(|_| {
                    AppError::Config(format!("trusted proxy '{}' is not an IP address", entry))
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.0.contains(ip)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Right-most `X-Forwarded-For` hop that is not one of our proxies
fn forwarded_client(req: &HttpRequest, proxies: &TrustedProxies) -> Option<IpAddr> {
    let header = req.headers().get("X-Forwarded-For")?.to_str().ok()?;
    header
        .rsplit(',')
        .map(|hop| hop.trim().parse::<IpAddr>())
        .take_while(Result::is_ok)
        .flatten()
        .find(|ip| !proxies.contains(ip))
}

/// Client address without the port
///
/// The socket peer, unless the peer is a trusted proxy that forwarded the
/// request on behalf of someone else.
pub fn source_address(req: &HttpRequest) -> String {
    let Some(peer) = req.peer_addr().map(|socket| socket.ip()) else {
        return "unknown".to_string();
    };

    let forwarded = req
        .app_data::<web::Data<TrustedProxies>>()
        .filter(|proxies| proxies.contains(&peer))
        .and_then(|proxies| forwarded_client(req, proxies));

    forwarded.unwrap_or(peer).to_string()
}

/// Request path as received, before `NormalizePath` rewrites it
///
/// Install with `.wrap_fn` outside of `NormalizePath` so the signature is
/// checked against the path the device signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPath(pub String);

impl RawPath {
    pub fn capture(req: &ServiceRequest) {
        req.extensions_mut().insert(RawPath(req.path().to_string()));
    }

    fn of(req: &HttpRequest) -> String {
        req.extensions()
            .get::<RawPath>()
            .map(|raw| raw.0.clone())
            .unwrap_or_else(|| req.path().to_string())
    }
}

impl DeviceHeaders {
    pub fn from_http_request(req: &HttpRequest) -> Result<Self, AppError> {
        let timestamp = required_header(req, TIMESTAMP_HEADER)?
            .parse::<i64>()
            .map_err(|_| AppError::invalid_field(TIMESTAMP_HEADER, "expected unix seconds"))?;

        Ok(Self {
            access_key: required_header(req, ACCESS_KEY_HEADER)?,
            signature: required_header(req, SIGNATURE_HEADER)?,
            timestamp,
            nonce: required_header(req, NONCE_HEADER)?,
            method: req.method().as_str().to_string(),
            path: RawPath::of(req),
            source_address: source_address(req),
        })
    }
}

impl FromRequest for DeviceHeaders {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        let result = DeviceHeaders::from_http_request(req);
        if let Err(e) = &result {
            debug!(error = %e, path = %req.path(), "Device request without signing envelope");
        }
        ready(result)
    }
}

// ===== Portal users =====

/// Bearer token from the Authorization header, or the `token` cookie
fn extract_token_from_request(req: &HttpRequest) -> Option<String> {
    if let Some(token) = req
        .headers()
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return Some(token.trim().to_string());
    }

    req.cookie("token").map(|cookie| cookie.value().to_string())
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub username: String,
    pub role: UserRole,
    pub claims: Claims,
}

impl AuthenticatedUser {
    /// The account a venue user acts for
    ///
    /// # Errors
    ///
    /// Returns `AppError::Forbidden` for users without a bound account
    pub fn account_id(&self) -> Result<i64, AppError> {
        match (self.role, self.claims.account_id) {
            (UserRole::Venue, Some(account_id)) => Ok(account_id),
            _ => Err(AppError::Forbidden),
        }
    }

    fn authenticate(req: &HttpRequest) -> Result<Self, AppError> {
        let jwt_service = req
            .app_data::<web::Data<Arc<JwtService>>>()
            .ok_or_else(|| {
                warn!("JwtService not found in app data");
                AppError::Internal("Authentication service not configured".to_string())
            })?;

        let token = extract_token_from_request(req).ok_or_else(|| {
            debug!("No authentication token found in request");
            AppError::Unauthorized("No authentication token provided".to_string())
        })?;

        let claims = jwt_service.validate_token(&token)?;
        Ok(AuthenticatedUser {
            user_id: claims.uid,
            username: claims.sub.clone(),
            role: claims.role,
            claims,
        })
    }
}

impl FromRequest for AuthenticatedUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(Self::authenticate(req))
    }
}

fn require_role(
    req: &HttpRequest,
    allowed: fn(&UserRole) -> bool,
    area: &str,
) -> Result<AuthenticatedUser, AppError> {
    let user = AuthenticatedUser::authenticate(req)?;
    if !allowed(&user.role) {
        warn!(
            username = %user.username,
            role = %user.role,
            area = area,
            "Access denied for role"
        );
        return Err(AppError::Forbidden);
    }
    Ok(user)
}

/// Finance or admin user
#[derive(Debug, Clone)]
pub struct ReviewerUser(pub AuthenticatedUser);

impl std::ops::Deref for ReviewerUser {
    type Target = AuthenticatedUser;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromRequest for ReviewerUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(require_role(req, UserRole::can_review, "review").map(ReviewerUser))
    }
}

#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthenticatedUser);

impl std::ops::Deref for AdminUser {
    type Target = AuthenticatedUser;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl FromRequest for AdminUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(require_role(req, UserRole::is_admin, "admin").map(AdminUser))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App, HttpResponse};

    fn create_test_jwt_service() -> Arc<JwtService> {
        Arc::new(JwtService::new("test-secret-key-12345", 3600))
    }

    fn token_for(jwt: &JwtService, role: UserRole, account_id: Option<i64>) -> String {
        jwt.create_token(&Claims::new(1, "someone", role, account_id))
            .unwrap()
    }

    #[actix_web::test]
    async fn test_device_headers_extracted() {
        let app = test::init_service(App::new().route(
            "/api/v1/authorize",
            web::post().to(|headers: DeviceHeaders| async move {
                assert_eq!(headers.access_key, "pk_abc");
                assert_eq!(headers.timestamp, 1_760_000_000);
                assert_eq!(headers.method, "POST");
                assert_eq!(headers.path, "/api/v1/authorize");
                assert_eq!(headers.source_address, "10.1.2.3");
                HttpResponse::Ok().finish()
            }),
        ))
        .await;

        let req = test::TestRequest::post()
            .uri("/api/v1/authorize")
            .peer_addr("10.1.2.3:5555".parse().unwrap())
            .insert_header((ACCESS_KEY_HEADER, "pk_abc"))
            .insert_header((SIGNATURE_HEADER, "00"))
            .insert_header((TIMESTAMP_HEADER, "1760000000"))
            .insert_header((NONCE_HEADER, "n1"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    async fn whoami(proxies: Option<TrustedProxies>, peer: &str, forwarded_for: &str) -> String {
        let mut app = App::new();
        if let Some(proxies) = proxies {
            app = app.app_data(web::Data::new(proxies));
        }
        let app = test::init_service(app.route(
            "/whoami",
            web::get().to(|req: HttpRequest| async move {
                HttpResponse::Ok().body(source_address(&req))
            }),
        ))
        .await;
        let req = test::TestRequest::get()
            .uri("/whoami")
            .peer_addr(peer.parse().unwrap())
            .insert_header(("X-Forwarded-For", forwarded_for))
            .to_request();
        let resp = test::call_service(&app, req).await;
        String::from_utf8(test::read_body(resp).await.to_vec()).unwrap()
    }

    #[actix_web::test]
    async fn test_forwarded_for_ignored_from_untrusted_peer() {
        let seen = vec![
            whoami(None, "10.1.2.3:5555", "1.1.1.1").await,
            whoami(None, "10.1.2.3:5555", "2.2.2.2").await,
        ];
        assert_eq!(seen, vec!["10.1.2.3", "10.1.2.3"]);

        let proxies = TrustedProxies::parse("10.9.9.9").unwrap();
        let spoofed = whoami(Some(proxies), "10.1.2.3:5555", "1.1.1.1").await;
        assert_eq!(spoofed, "10.1.2.3");
    }

    #[actix_web::test]
    async fn test_forwarded_for_honoured_from_trusted_proxy() {
        let proxies = TrustedProxies::parse("10.9.9.9, 10.9.9.10").unwrap();

        let direct = whoami(Some(proxies.clone()), "10.9.9.9:443", "203.0.113.7").await;
        assert_eq!(direct, "203.0.113.7");

        // a client-supplied left-most hop never wins over what our proxies saw
        let chained = whoami(
            Some(proxies.clone()),
            "10.9.9.9:443",
            "1.1.1.1, 203.0.113.7, 10.9.9.10",
        )
        .await;
        assert_eq!(chained, "203.0.113.7");

        let garbage = whoami(Some(proxies), "10.9.9.9:443", "not-an-ip").await;
        assert_eq!(garbage, "10.9.9.9");
    }

    #[::core::prelude::v1::test]
    fn test_trusted_proxies_parse() {
        assert!(TrustedProxies::parse("").unwrap().is_empty());
        let proxies = TrustedProxies::parse("10.0.0.1, ::1").unwrap();
        assert!(proxies.contains(&"::1".parse().unwrap()));
        assert!(TrustedProxies::parse("10.0.0.1,proxy.local").is_err());
    }

    #[actix_web::test]
    async fn test_signed_path_survives_normalization() {
        use actix_web::dev::Service;
        use actix_web::middleware::NormalizePath;

        let app = test::init_service(
            App::new()
                .wrap(NormalizePath::trim())
                .wrap_fn(|req, srv| {
                    RawPath::capture(&req);
                    srv.call(req)
                })
                .route(
                    "/api/v1/authorize",
                    web::post().to(|req: HttpRequest, headers: DeviceHeaders| async move {
                        assert_eq!(req.path(), "/api/v1/authorize");
                        HttpResponse::Ok().body(headers.path)
                    }),
                ),
        )
        .await;

        for (sent, signed) in [
            ("/api/v1/authorize/", "/api/v1/authorize/"),
            ("/api/v1/authorize", "/api/v1/authorize"),
        ] {
            let req = test::TestRequest::post()
                .uri(sent)
                .insert_header((ACCESS_KEY_HEADER, "pk_abc"))
                .insert_header((SIGNATURE_HEADER, "00"))
                .insert_header((TIMESTAMP_HEADER, "1760000000"))
                .insert_header((NONCE_HEADER, "n1"))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert!(resp.status().is_success());
            assert_eq!(test::read_body(resp).await, signed.as_bytes());
        }
    }

    #[actix_web::test]
    async fn test_device_headers_missing_or_malformed() {
        let app = test::init_service(App::new().route(
            "/authorize",
            web::post().to(|_: DeviceHeaders| async { HttpResponse::Ok().finish() }),
        ))
        .await;

        let req = test::TestRequest::post()
            .uri("/authorize")
            .insert_header((ACCESS_KEY_HEADER, "pk_abc"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400);

        let req = test::TestRequest::post()
            .uri("/authorize")
            .insert_header((ACCESS_KEY_HEADER, "pk_abc"))
            .insert_header((SIGNATURE_HEADER, "00"))
            .insert_header((TIMESTAMP_HEADER, "yesterday"))
            .insert_header((NONCE_HEADER, "n1"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 400);
    }

    #[actix_web::test]
    async fn test_authenticated_user_from_bearer() {
        let jwt_service = create_test_jwt_service();
        let token = token_for(&jwt_service, UserRole::Venue, Some(42));

        let app = test::init_service(App::new().app_data(web::Data::new(jwt_service)).route(
            "/me",
            web::get().to(|user: AuthenticatedUser| async move {
                assert_eq!(user.account_id().unwrap(), 42);
                HttpResponse::Ok().finish()
            }),
        ))
        .await;

        let req = test::TestRequest::get()
            .uri("/me")
            .insert_header(("Authorization", format!("Bearer {}", token)))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
    }

    #[actix_web::test]
    async fn test_missing_and_invalid_token() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(create_test_jwt_service()))
                .route(
                    "/me",
                    web::get().to(|_: AuthenticatedUser| async { HttpResponse::Ok().finish() }),
                ),
        )
        .await;

        let req = test::TestRequest::get().uri("/me").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);

        let req = test::TestRequest::get()
            .uri("/me")
            .insert_header(("Authorization", "Bearer invalid.token.here"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);
    }

    #[actix_web::test]
    async fn test_reviewer_roles() {
        let jwt_service = create_test_jwt_service();
        let finance = token_for(&jwt_service, UserRole::Finance, None);
        let venue = token_for(&jwt_service, UserRole::Venue, Some(1));

        let app = test::init_service(App::new().app_data(web::Data::new(jwt_service)).route(
            "/review",
            web::post().to(|_: ReviewerUser| async { HttpResponse::Ok().finish() }),
        ))
        .await;

        let req = test::TestRequest::post()
            .uri("/review")
            .insert_header(("Authorization", format!("Bearer {}", finance)))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let req = test::TestRequest::post()
            .uri("/review")
            .insert_header(("Authorization", format!("Bearer {}", venue)))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 403);
    }

    #[actix_web::test]
    async fn test_admin_only() {
        let jwt_service = create_test_jwt_service();
        let finance = token_for(&jwt_service, UserRole::Finance, None);
        let admin = token_for(&jwt_service, UserRole::Admin, None);

        let app = test::init_service(App::new().app_data(web::Data::new(jwt_service)).route(
            "/admin",
            web::post().to(|admin: AdminUser| async move {
                assert!(admin.account_id().is_err());
                HttpResponse::Ok().finish()
            }),
        ))
        .await;

        let req = test::TestRequest::post()
            .uri("/admin")
            .insert_header(("Authorization", format!("Bearer {}", finance)))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 403);

        let req = test::TestRequest::post()
            .uri("/admin")
            .insert_header(("Authorization", format!("Bearer {}", admin)))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());
    }
}
