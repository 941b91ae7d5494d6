use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use ghw_auth::{CommandError, SignedCommand};
use ghw_core::{ClientAddr, error::DeployError};
use ghw_github::webhook::{Delivery, EVENT_HEADER, SIGNATURE_HEADER, verify_signature};
use serde_json::{Value, json};

use crate::AppState;

/// An inbound request, classified once by shape before any verification.
#[derive(Debug)]
enum Inbound {
    /// Carries the GitHub signature header.
    PlatformWebhook { signature: String, event: Option<String>, body: Bytes },
    /// A JSON object without the signature header.
    AdminCommand(SignedCommand),
    Unrecognized,
}

impl Inbound {
    fn classify(headers: &HeaderMap, body: Bytes) -> Self {
        if let Some(signature) = headers.get(SIGNATURE_HEADER) {
            let event =
                headers.get(EVENT_HEADER).and_then(|v| v.to_str().ok()).map(str::to_string);
            return Self::PlatformWebhook {
                signature: signature.to_str().unwrap_or_default().to_string(),
                event,
                body,
            };
        }
        match serde_json::from_slice::<Value>(&body) {
            // Fields of the wrong type are reported the same as missing ones.
            Ok(value @ Value::Object(_)) => {
                Self::AdminCommand(serde_json::from_value(value).unwrap_or_default())
            }
            _ => Self::Unrecognized,
        }
    }
}

pub async fn receive(
    State(state): State<AppState>,
    client: ClientAddr,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match Inbound::classify(&headers, body) {
        Inbound::PlatformWebhook { signature, event, body } => {
            platform_webhook(&state, &signature, event.as_deref(), &body).await
        }
        Inbound::AdminCommand(command) => admin_command(&state, command).await,
        Inbound::Unrecognized => {
            tracing::warn!("Unrecognized request from {client}");
            (
                StatusCode::UNAUTHORIZED,
                format!("Unauthorised Request. Your IP has been logged: {client}"),
            )
                .into_response()
        }
    }
}

async fn platform_webhook(
    state: &AppState,
    signature: &str,
    event: Option<&str>,
    body: &[u8],
) -> Response {
    if verify_signature(&state.config.github.webhook_secret, body, signature).is_err() {
        return (StatusCode::UNAUTHORIZED, "Invalid signature").into_response();
    }
    let push = match Delivery::parse(event, body) {
        Ok(Delivery::Push(push)) => push,
        Ok(Delivery::Other(kind)) => {
            tracing::info!("Ignoring webhook event {kind}");
            return (StatusCode::OK, "Event ignored").into_response();
        }
        Err(e) => {
            tracing::warn!("Received push event with invalid payload: {e}");
            return (StatusCode::BAD_REQUEST, "Invalid payload").into_response();
        }
    };
    let Some(branch) = push.branch().map(str::to_string) else {
        tracing::info!("Ignoring push to {} in {}", push.git_ref, push.repository.full_name);
        return (StatusCode::OK, "Event ignored").into_response();
    };
    let full_name = push.repository.full_name;
    tracing::info!("Github webhook received for repo: {full_name} branch: {branch}");

    // Detached so a dropped connection does not abort the deployment midway.
    let deployer = state.deployer.clone();
    let task = {
        let (full_name, branch) = (full_name.clone(), branch.clone());
        tokio::spawn(async move { deployer.redeploy(&full_name, &branch).await })
    };
    match task.await {
        Ok(Ok(())) => (StatusCode::OK, "Repository updated").into_response(),
        Ok(Err(DeployError::NotConfigured { .. })) => {
            tracing::warn!(
                "Github webhook received for repo: {full_name} branch: {branch} but it is not configured to be deployed"
            );
            (StatusCode::OK, "Repo/Branch not configured. Request ignored.").into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("Error updating {full_name}: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error updating repository").into_response()
        }
        Err(e) => {
            tracing::error!("Deployment task for {full_name} failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, "Error updating repository").into_response()
        }
    }
}

async fn admin_command(state: &AppState, command: SignedCommand) -> Response {
    let config = match state.admin_key.open(&command) {
        Ok(config) => config,
        Err(CommandError::Incomplete) => {
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": "Missing data or signature" })))
                .into_response();
        }
        Err(CommandError::Unauthorized(e)) => {
            tracing::warn!("Rejected administrator command: {e}");
            return (StatusCode::FORBIDDEN, Json(json!({ "error": "Invalid signature" })))
                .into_response();
        }
        Err(CommandError::Invalid(detail)) => {
            tracing::warn!("Administrator command carried an invalid config: {detail}");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid repository config", "detail": detail })),
            )
                .into_response();
        }
    };
    let full_name = config.full_name();
    let deployer = state.deployer.clone();
    match tokio::spawn(async move { deployer.submit(config).await }).await {
        Ok(Ok(submission)) => {
            tracing::info!(
                first_deployment = submission.first_deployment,
                "Deployed {full_name} from administrator command"
            );
            Json(json!({ "message": "Data received and verified" })).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!("Error deploying {full_name}: {e}");
            let body = json!({ "error": "Error processing request", "detail": e.to_string() });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
        Err(e) => {
            tracing::error!("Deployment task for {full_name} failed: {e}");
            let body = json!({ "error": "Error processing request", "detail": e.to_string() });
            (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        Router,
        body::Body,
        http::{Method, Request},
    };
    use ghw_auth::AdminSigner;
    use ghw_core::{
        config::{Config, DbConfig, DeployConfig, GitHubConfig, ServerConfig},
        models::RepositoryConfig,
    };
    use ghw_db::Database;
    use ghw_deploy::{
        Deployer,
        testing::{FakeSourceHost, RecordingRunner},
    };
    use ghw_github::webhook::sign;
    use http_body_util::BodyExt;
    use p256::ecdsa::SigningKey;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::handlers::build_router;

    const SECRET: &str = "s3cret";
    const PUSH: &str = r#"{"ref":"refs/heads/main","repository":{"full_name":"a/b"}}"#;

    struct Fixture {
        dir: TempDir,
        db: Arc<Database>,
        host: Arc<FakeSourceHost>,
        runner: Arc<RecordingRunner>,
        signer: AdminSigner,
        router: Router,
    }

    impl Fixture {
        async fn send(&self, request: Request<Body>) -> (StatusCode, String) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            (status, String::from_utf8(body.to_vec()).unwrap())
        }

        async fn webhook(&self, event: &str, body: &str, signature: &str) -> (StatusCode, String) {
            let request = Request::post("/")
                .header(SIGNATURE_HEADER, signature)
                .header(EVENT_HEADER, event)
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap();
            self.send(request).await
        }

        async fn admin(&self, body: Value) -> (StatusCode, Value) {
            let request = Request::post("/")
                .header("Content-Type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap();
            let (status, body) = self.send(request).await;
            (status, serde_json::from_str(&body).unwrap())
        }
    }

    fn signer(seed: u8) -> AdminSigner {
        AdminSigner::from_signing_key(SigningKey::from_slice(&[seed; 32]).unwrap())
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            server: ServerConfig { port: 0, request_timeout_secs: 900 },
            db: DbConfig { url: format!("sqlite://{}", dir.path().join("test.sqlite").display()) },
            github: GitHubConfig {
                token: "ghp_test".into(),
                webhook_secret: SECRET.into(),
                webhook_url: "https://ghw.example.dev".parse().unwrap(),
                api_url: "https://api.github.com".parse().unwrap(),
            },
            deploy: DeployConfig {
                repo_dir: dir.path().join("repos"),
                public_key: dir.path().join("public_key.bin"),
                caddyfile: dir.path().join("Caddyfile"),
            },
        });
        let db = Arc::new(Database::new(&config.db).await.unwrap());
        let host = Arc::new(FakeSourceHost::default());
        let runner = Arc::new(RecordingRunner::default());
        let deployer =
            Arc::new(Deployer::new(db.clone(), host.clone(), runner.clone(), &config.deploy));
        let signer = signer(0x11);
        let admin_key = Arc::new(signer.public_key());
        let router = build_router().with_state(AppState { config, deployer, admin_key });
        Fixture { dir, db, host, runner, signer, router }
    }

    fn repo_config() -> RepositoryConfig {
        RepositoryConfig {
            owner: "a".into(),
            name: "b".into(),
            branch: "main".into(),
            pm2_command: "start index.js".into(),
            caddy_config: "b.example.dev {\n\treverse_proxy :3001\n}\n".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_tampered_digest_rejected() {
        let f = fixture().await;
        let mut signature = sign(SECRET, PUSH.as_bytes());
        let last = if signature.ends_with('0') { "1" } else { "0" };
        signature.replace_range(signature.len() - 1.., last);
        let (status, body) = f.webhook("push", PUSH, &signature).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "Invalid signature");
        assert!(f.host.fetches().is_empty());
        assert_eq!(f.db.get_repo_config("a", "b", "main").await.unwrap(), None);
        assert!(f.db.get_webhooks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_push_ignored() {
        let f = fixture().await;
        let (status, body) = f.webhook("push", PUSH, &sign(SECRET, PUSH.as_bytes())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Repo/Branch not configured. Request ignored.");
        assert!(f.host.fetches().is_empty());
        assert!(f.runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_non_push_events_ignored() {
        let f = fixture().await;
        let ping = r#"{"zen":"Keep it logically awesome.","hook_id":1}"#;
        let (status, body) = f.webhook("ping", ping, &sign(SECRET, ping.as_bytes())).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "Event ignored"));

        let tag = r#"{"ref":"refs/tags/v1.0.0","repository":{"full_name":"a/b"}}"#;
        let (status, body) = f.webhook("push", tag, &sign(SECRET, tag.as_bytes())).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "Event ignored"));

        let (status, _) = f.webhook("push", "[]", &sign(SECRET, b"[]")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(f.host.fetches().is_empty());
    }

    #[tokio::test]
    async fn test_other_methods_not_allowed() {
        let f = fixture().await;
        let request = Request::builder().method(Method::GET).uri("/").body(Body::empty()).unwrap();
        let (status, _) = f.send(request).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_unrecognized_request_logs_address() {
        let f = fixture().await;
        let request = Request::post("/")
            .header("X-Forwarded-For", "203.0.113.9")
            .body(Body::from("hello"))
            .unwrap();
        let (status, body) = f.send(request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, "Unauthorised Request. Your IP has been logged: 203.0.113.9");
    }

    #[tokio::test]
    async fn test_admin_missing_fields() {
        let f = fixture().await;
        for body in [json!({ "data": "{}" }), json!({}), json!({ "data": 1, "signature": "ab" })]
        {
            let (status, body) = f.admin(body).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "Missing data or signature");
        }
    }

    #[tokio::test]
    async fn test_admin_bad_signature() {
        let f = fixture().await;
        let command = signer(0x22).sign_config(&repo_config()).unwrap();
        let (status, body) = f.admin(serde_json::to_value(&command).unwrap()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, json!({ "error": "Invalid signature" }));
        assert_eq!(f.db.get_repo_config("a", "b", "main").await.unwrap(), None);
        assert!(f.host.registrations().is_empty());
    }

    #[tokio::test]
    async fn test_admin_invalid_config() {
        let f = fixture().await;
        for data in ["not json", r#"{"owner":"..","name":"b","branch":"main"}"#] {
            let signature = f.signer.sign(data);
            let (status, body) = f.admin(json!({ "data": data, "signature": signature })).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{data}");
            assert_eq!(body["error"], "Invalid repository config");
        }
        assert!(f.host.fetches().is_empty());
    }

    #[tokio::test]
    async fn test_admin_submission_then_push() {
        let f = fixture().await;
        let command = f.signer.sign_config(&repo_config()).unwrap();
        let (status, body) = f.admin(serde_json::to_value(&command).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "message": "Data received and verified" }));
        assert_eq!(f.host.registrations(), vec!["a/b"]);
        assert_eq!(f.db.get_repo_config("a", "b", "main").await.unwrap(), Some(repo_config()));
        let caddyfile = std::fs::read_to_string(f.dir.path().join("Caddyfile")).unwrap();
        assert_eq!(caddyfile, repo_config().caddy_config);
        assert!(f.runner.commands().contains(&"pm2 start index.js --name b".to_string()));

        let (status, body) = f.webhook("push", PUSH, &sign(SECRET, PUSH.as_bytes())).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "Repository updated"));
        assert_eq!(f.host.fetches(), vec!["a/b@main", "a/b@main"]);
        assert_eq!(f.runner.commands().last().map(String::as_str), Some("pm2 restart b"));
    }

    #[tokio::test]
    async fn test_admin_pipeline_failure() {
        let f = fixture().await;
        f.runner.fail_on("pm2", None);
        let command = f.signer.sign_config(&repo_config()).unwrap();
        let (status, body) = f.admin(serde_json::to_value(&command).unwrap()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Error processing request");
        assert!(body["detail"].as_str().unwrap().contains("pm2"));
        assert!(!f.dir.path().join("Caddyfile").exists());
    }
}
