//! Per-device lifecycle worker.
//!
//! One task per attempt drives a device from NEEDS_AUTH through
//! authentication, authorization and provisioning to ON. Every phase
//! carries its own wall-clock deadline; deadlines are the cancellation
//! mechanism, re-checked before each retry and each transition.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{Map, Value};
use thiserror::Error;

use autopolicy_common::Profile;

use crate::device::{Device, DeviceState};
use crate::template::{Template, TemplateVars};
use crate::Enforcer;

const AUTH_TIMEOUT: Duration = Duration::from_secs(60);
const AUTH_RETRY: Duration = Duration::from_secs(19);

const AUTHZ_TIMEOUT: Duration = Duration::from_secs(10);
const AUTHZ_RETRY: Duration = Duration::from_secs(3);

const PROV_TIMEOUT: Duration = Duration::from_secs(3);
const PROV_FAIL_BACKOFF: Duration = Duration::from_secs(60);

// the production design is one hour plus up to 23 hours of random
// delay before re-authentication
const ON_HOLD: Duration = Duration::from_secs(300);

/// A permanent denial turns the device off for 5 to 15 minutes.
const DENY_BACKOFF_SECS: std::ops::Range<u64> = 300..900;

#[derive(Debug, Error)]
enum AuthError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("HTTP status {0}, not 200 OK")]
    Status(u16),
    #[error("JSON parser: {0}")]
    Json(#[from] serde_json::Error),
    #[error("identity is not an object")]
    NotAnObject,
}

enum AuthzOutcome {
    Granted(Profile),
    Denied(String),
    Transient(String),
}

/// Drive one device from NEEDS_AUTH towards ON.
pub async fn run(enf: Arc<Enforcer>, dev: Arc<Device>) {
    let tag = dev.tag.clone();
    tracing::info!("{tag}: starting auth");

    let (state, deadline, _) = dev.snapshot();
    if state != DeviceState::NeedsAuth || Instant::now() > deadline {
        tracing::warn!("{tag}: invalid starting point");
        return;
    }

    // authenticate: retries until the phase deadline, then falls
    // through with an empty identity
    dev.move_state(DeviceState::InAuth, AUTH_TIMEOUT);
    let mut attempt = 0;
    let identity = loop {
        attempt += 1;
        let (state, deadline, lastip) = dev.snapshot();
        if state != DeviceState::InAuth {
            tracing::warn!("{tag}: invalid state during authentication");
            return;
        }
        if Instant::now() > deadline {
            tracing::info!("{tag}: authentication timeout: will use empty identity");
            break amend_identity(Map::new(), &enf, &dev, lastip);
        }
        match authenticate(&enf, &dev, lastip).await {
            Ok(id) => {
                tracing::debug!("{tag}: authenticated");
                break amend_identity(id, &enf, &dev, lastip);
            }
            Err(err) => {
                tracing::debug!("{tag}: authentication failed (try {attempt}): {err}");
                tokio::time::sleep(AUTH_RETRY).await;
            }
        }
    };

    // authorize: a deadline aborts the whole lifecycle, a 403 is a
    // permanent deny with a random hold-off
    dev.move_state(DeviceState::InAuthz, AUTHZ_TIMEOUT);
    let mut attempt = 0;
    let profile = loop {
        attempt += 1;
        let (state, deadline, lastip) = dev.snapshot();
        if state != DeviceState::InAuthz {
            tracing::warn!("{tag}: invalid state during authorization");
            return;
        }
        if Instant::now() > deadline {
            tracing::info!("{tag}: authorization timeout: aborting");
            return;
        }

        let target = compile_target(&enf.authz_query, &enf, &dev, lastip);
        tracing::trace!("{tag}: fetching profile from {target}");
        let reply = enf
            .http
            .post_json(&target, &Value::Object(identity.clone()))
            .await;

        match classify_authz(reply.map_err(|e| e.to_string())) {
            AuthzOutcome::Granted(mut profile) => {
                profile.insert("@timestamp", Value::from(chrono::Utc::now().timestamp()));
                tracing::debug!("{tag}: authorized");
                break profile;
            }
            AuthzOutcome::Denied(msg) => {
                tracing::info!("{tag}: access denied: {msg}");
                let hold = rand::thread_rng().gen_range(DENY_BACKOFF_SECS);
                dev.move_state(DeviceState::Off, Duration::from_secs(hold));
                return;
            }
            AuthzOutcome::Transient(err) => {
                tracing::debug!("{tag}: authorization failed (try {attempt}): {err}");
                tokio::time::sleep(AUTHZ_RETRY).await;
            }
        }
    };

    // provision
    dev.move_state(DeviceState::InProv, PROV_TIMEOUT);
    let (state, deadline, _) = dev.snapshot();
    if state != DeviceState::InProv {
        tracing::warn!("{tag}: invalid state during provisioning");
        return;
    }
    if Instant::now() > deadline {
        tracing::info!("{tag}: provisioning timeout: aborting");
        return;
    }
    match enf.tc.provision(&dev, &profile).await {
        Ok(()) => {
            tracing::debug!("{tag}: provisioned");
            dev.move_state(DeviceState::On, ON_HOLD);
        }
        Err(err) => {
            tracing::info!("{tag}: provisioning failed (ban for 1 minute): {err}");
            dev.move_state(DeviceState::Off, PROV_FAIL_BACKOFF);
        }
    }
}

fn compile_target(
    template: &Template,
    enf: &Enforcer,
    dev: &Device,
    lastip: std::net::IpAddr,
) -> String {
    template.compile(&TemplateVars {
        ip: lastip,
        iface: &dev.iface,
        mac: &dev.mac.to_string(),
        me: &enf.me,
    })
}

/// Fill in the trusted administrative keys.
fn amend_identity(
    mut id: Map<String, Value>,
    enf: &Enforcer,
    dev: &Device,
    lastip: std::net::IpAddr,
) -> Map<String, Value> {
    id.insert("@switch".into(), Value::from(enf.me.as_str()));
    id.insert("@port".into(), Value::from(dev.iface.as_str()));
    id.insert("@mac".into(), Value::from(dev.mac.to_string()));
    id.insert("@ip".into(), Value::from(lastip.to_string()));
    id
}

/// One identity fetch from the device.
async fn authenticate(
    enf: &Enforcer,
    dev: &Device,
    lastip: std::net::IpAddr,
) -> Result<Map<String, Value>, AuthError> {
    let target = compile_target(&enf.auth_query, enf, dev, lastip);
    tracing::trace!("{}: fetching identity from {target}", dev.tag);

    let (body, status) = enf.http.get(&target).await?;
    if status != 200 {
        return Err(AuthError::Status(status));
    }
    let value: Value = serde_json::from_slice(&body)?;
    match value {
        Value::Object(obj) => Ok(obj),
        _ => Err(AuthError::NotAnObject),
    }
}

/// Classify an authorization reply.
///
/// 200 with an object is a grant; 403 with an object is a permanent
/// denial (a 403 without an `error` envelope is reserved and logged);
/// everything else is transient.
fn classify_authz(reply: Result<(Option<Value>, u16), String>) -> AuthzOutcome {
    let (body, status) = match reply {
        Ok(reply) => reply,
        Err(err) => return AuthzOutcome::Transient(format!("HTTP error: {err}")),
    };

    let Some(Value::Object(obj)) = body else {
        return AuthzOutcome::Transient(format!("HTTP status {status}: reply is not an object"));
    };

    if status == 200 {
        return match Profile::from_value(Value::Object(obj)) {
            Some(profile) => AuthzOutcome::Granted(profile),
            None => AuthzOutcome::Transient("profile is not an object".into()),
        };
    }

    let message = obj.get("error").and_then(Value::as_object).map(|err| {
        let msg = err
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("access denied")
            .to_string();
        match err.get("details") {
            Some(details) if !details.is_null() => format!("{msg} ({details})"),
            _ => msg,
        }
    });

    if status == 403 {
        match message {
            Some(msg) => AuthzOutcome::Denied(msg),
            None => {
                tracing::warn!("403 reply without error envelope; treating as denial");
                AuthzOutcome::Denied("HTTP status 403".into())
            }
        }
    } else {
        AuthzOutcome::Transient(message.unwrap_or_else(|| format!("HTTP status {status}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::path::PathBuf;

    use crate::device::DeviceTable;
    use crate::http::HttpClient;
    use crate::sniffer::MacAddr;
    use crate::tc::TcDriver;

    const MAC: MacAddr = MacAddr::new([0x02, 0, 0, 0, 0, 1]);

    #[test]
    fn test_classify_grant() {
        let out = classify_authz(Ok((Some(json!({ "from_device": {} })), 200)));
        assert!(matches!(out, AuthzOutcome::Granted(_)));
    }

    #[test]
    fn test_classify_permanent_deny() {
        let body = json!({ "error": { "code": 3, "message": "identity downgrade detected" } });
        let out = classify_authz(Ok((Some(body), 403)));
        match out {
            AuthzOutcome::Denied(msg) => assert_eq!(msg, "identity downgrade detected"),
            _ => panic!("expected permanent denial"),
        }
    }

    #[test]
    fn test_classify_deny_includes_details() {
        let body = json!({ "error": { "message": "nope", "details": "because" } });
        let out = classify_authz(Ok((Some(body), 403)));
        match out {
            AuthzOutcome::Denied(msg) => assert_eq!(msg, "nope (\"because\")"),
            _ => panic!("expected permanent denial"),
        }
    }

    #[test]
    fn test_classify_reserved_403_still_denies() {
        let out = classify_authz(Ok((Some(json!({ "odd": true })), 403)));
        assert!(matches!(out, AuthzOutcome::Denied(_)));
    }

    #[test]
    fn test_classify_transient() {
        assert!(matches!(
            classify_authz(Err("connection refused".into())),
            AuthzOutcome::Transient(_)
        ));
        assert!(matches!(
            classify_authz(Ok((None, 500))),
            AuthzOutcome::Transient(_)
        ));
        assert!(matches!(
            classify_authz(Ok((Some(json!({ "error": { "message": "busy" } })), 503))),
            AuthzOutcome::Transient(_)
        ));
        assert!(matches!(
            classify_authz(Ok((Some(json!("str")), 200))),
            AuthzOutcome::Transient(_)
        ));
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn enforcer(base: &str, tc: &str) -> Arc<Enforcer> {
        Arc::new(Enforcer {
            me: "switch-test".into(),
            auth_query: Template::parse(&format!("{base}/identity.json")).unwrap(),
            authz_query: Template::parse(&format!("{base}/v1/authorize")).unwrap(),
            http: HttpClient::new().unwrap(),
            tc: TcDriver::new(PathBuf::from(tc)),
        })
    }

    fn fresh_device() -> Arc<Device> {
        let mut table = DeviceTable::new();
        table
            .note("eth0", MAC, "10.0.0.9".parse().unwrap(), Instant::now())
            .unwrap()
    }

    #[tokio::test]
    async fn test_permanent_deny_turns_device_off_with_backoff() {
        let router = Router::new()
            .route(
                "/identity.json",
                get(|| async { Json(json!({ "manufacturer": "acme" })) }),
            )
            .route(
                "/v1/authorize",
                post(|| async {
                    (
                        StatusCode::FORBIDDEN,
                        Json(json!({ "error": {
                            "code": 3, "status": "INVALID_ARGUMENT",
                            "message": "identity downgrade detected", "details": null,
                        }})),
                    )
                        .into_response()
                }),
            );
        let base = serve(router).await;

        let enf = enforcer(&base, "/bin/false");
        let dev = fresh_device();
        let started = Instant::now();
        run(enf, dev.clone()).await;

        let status = dev.status.read();
        assert_eq!(status.state, DeviceState::Off);
        let hold = status.timeout.duration_since(started);
        assert!(hold >= Duration::from_secs(299), "hold {hold:?}");
        assert!(hold < Duration::from_secs(901), "hold {hold:?}");
    }

    #[tokio::test]
    async fn test_grant_with_empty_profile_reaches_on() {
        let router = Router::new()
            .route("/identity.json", get(|| async { Json(json!({})) }))
            .route("/v1/authorize", post(|| async { Json(json!({})) }));
        let base = serve(router).await;

        // tc resolves to /bin/true: every invocation succeeds
        let enf = enforcer(&base, "/bin/true");
        let dev = fresh_device();
        run(enf, dev.clone()).await;

        let status = dev.status.read();
        assert_eq!(status.state, DeviceState::On);
        assert_eq!(status.timeout.duration_since(status.since), ON_HOLD);
    }

    #[tokio::test]
    async fn test_provision_failure_backs_off_one_minute() {
        let router = Router::new()
            .route("/identity.json", get(|| async { Json(json!({})) }))
            .route(
                "/v1/authorize",
                post(|| async { Json(json!({ "from_device": { "rate": 1 } })) }),
            );
        let base = serve(router).await;

        // every tc invocation fails, so installing the chain fails
        let enf = enforcer(&base, "/bin/false");
        let dev = fresh_device();
        run(enf, dev.clone()).await;

        let status = dev.status.read();
        assert_eq!(status.state, DeviceState::Off);
        assert_eq!(status.timeout.duration_since(status.since), PROV_FAIL_BACKOFF);
    }

    #[tokio::test]
    async fn test_invalid_starting_point_aborts() {
        let enf = enforcer("http://127.0.0.1:1", "/bin/false");
        let dev = fresh_device();
        dev.move_state(DeviceState::Off, Duration::from_secs(60));

        run(enf, dev.clone()).await;
        assert_eq!(dev.status.read().state, DeviceState::Off);
    }
}
