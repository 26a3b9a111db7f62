//! Integration tests for the HTTP platform clients against a mock server.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::sync::Arc;

use lw_core::{ChannelId, Handle};
use lw_protocol::EventKind;
use lwd::api::{ApiError, IdentityLookup, LivenessQuery, SubscriptionApi};
use lwd::credentials::{CredentialError, CredentialManager, CredentialStore};
use lwd::twitch::{AppCredentials, HelixClient, TwitchAuth};
use mockito::{Matcher, Mock, ServerGuard};
use serde_json::json;
use tempfile::TempDir;

const CLIENT_ID: &str = "cid";

fn app() -> AppCredentials {
    AppCredentials {
        client_id: CLIENT_ID.to_string(),
        client_secret: "secret".to_string(),
        redirect_uri: "http://localhost:8080/oauth/callback".to_string(),
    }
}

struct Setup {
    _dir: TempDir,
    server: ServerGuard,
    credentials: Arc<CredentialManager>,
    helix: HelixClient,
}

async fn setup() -> Setup {
    let dir = tempfile::tempdir().unwrap();
    let server = mockito::Server::new_async().await;
    let http = reqwest::Client::new();

    let auth = TwitchAuth::with_base_url(http.clone(), app(), &server.url());
    let store = CredentialStore::new(dir.path().join("user_token.json"));
    let credentials = Arc::new(CredentialManager::new(Arc::new(auth), store));
    let helix = HelixClient::with_base_url(http, CLIENT_ID, credentials.clone(), &server.url());

    Setup {
        _dir: dir,
        server,
        credentials,
        helix,
    }
}

async fn mock_token(server: &mut ServerGuard, grant: &str, token: &str) -> Mock {
    server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded("grant_type".into(), grant.into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({ "access_token": token, "expires_in": 3600, "token_type": "bearer" })
                .to_string(),
        )
        .create_async()
        .await
}

// ============================================================================
// Liveness / Identity
// ============================================================================

#[tokio::test]
async fn test_liveness_query_returns_live_streams() {
    let mut s = setup().await;
    let _token = mock_token(&mut s.server, "client_credentials", "svc-token").await;
    let streams = s
        .server
        .mock("GET", "/streams")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("user_id".into(), "1".into()),
            Matcher::UrlEncoded("user_id".into(), "2".into()),
            Matcher::UrlEncoded("first".into(), "100".into()),
        ]))
        .match_header("client-id", CLIENT_ID)
        .match_header("authorization", "Bearer svc-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "data": [{
                    "user_id": "2",
                    "user_login": "beta",
                    "user_name": "Beta",
                    "game_name": "Chess",
                    "title": "blitz",
                    "viewer_count": 42,
                    "started_at": "2024-01-01T00:00:00Z"
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let live = s
        .helix
        .query_liveness(&[ChannelId::new("1"), ChannelId::new("2")])
        .await
        .unwrap();

    assert_eq!(live.len(), 1);
    assert_eq!(live[0].channel_id.as_str(), "2");
    assert_eq!(live[0].category, "Chess");
    assert_eq!(live[0].viewer_count, 42);
    streams.assert_async().await;
}

#[tokio::test]
async fn test_liveness_query_status_error() {
    let mut s = setup().await;
    let _token = mock_token(&mut s.server, "client_credentials", "svc-token").await;
    let _streams = s
        .server
        .mock("GET", "/streams")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("unavailable")
        .create_async()
        .await;

    let err = s
        .helix
        .query_liveness(&[ChannelId::new("1")])
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Status { status: 503, .. }));
}

#[tokio::test]
async fn test_empty_liveness_query_makes_no_request() {
    let mut s = setup().await;
    let token = s
        .server
        .mock("POST", "/token")
        .expect(0)
        .create_async()
        .await;

    let live = s.helix.query_liveness(&[]).await.unwrap();

    assert!(live.is_empty());
    token.assert_async().await;
}

#[tokio::test]
async fn test_service_token_fetched_once_across_calls() {
    let mut s = setup().await;
    let token = s
        .server
        .mock("POST", "/token")
        .match_body(Matcher::UrlEncoded(
            "grant_type".into(),
            "client_credentials".into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"svc-token","expires_in":3600,"token_type":"bearer"}"#)
        .expect(1)
        .create_async()
        .await;
    let _streams = s
        .server
        .mock("GET", "/streams")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"data":[]}"#)
        .expect(3)
        .create_async()
        .await;

    for _ in 0..3 {
        s.helix.query_liveness(&[ChannelId::new("1")]).await.unwrap();
    }

    token.assert_async().await;
}

#[tokio::test]
async fn test_service_token_exchange_failure_surfaces() {
    let mut s = setup().await;
    let _token = s
        .server
        .mock("POST", "/token")
        .with_status(401)
        .with_body(r#"{"status":401,"message":"invalid client secret"}"#)
        .create_async()
        .await;

    let err = s
        .helix
        .query_liveness(&[ChannelId::new("1")])
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ApiError::Credential(CredentialError::Exchange(_))
    ));
}

#[tokio::test]
async fn test_identity_lookup() {
    let mut s = setup().await;
    let _token = mock_token(&mut s.server, "client_credentials", "svc-token").await;
    let _users = s
        .server
        .mock("GET", "/users")
        .match_query(Matcher::UrlEncoded("login".into(), "alpha".into()))
        .with_status(200)
        .with_body(r#"{"data":[{"id":"141981764","login":"alpha","display_name":"Alpha"}]}"#)
        .create_async()
        .await;

    let identity = s
        .helix
        .resolve_identity(&Handle::parse("alpha").unwrap())
        .await
        .unwrap();

    assert_eq!(identity.channel_id.as_str(), "141981764");
    assert_eq!(identity.handle.as_str(), "alpha");
    assert_eq!(identity.display_name, "Alpha");
}

#[tokio::test]
async fn test_identity_lookup_unknown_handle() {
    let mut s = setup().await;
    let _token = mock_token(&mut s.server, "client_credentials", "svc-token").await;
    let _users = s
        .server
        .mock("GET", "/users")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"data":[]}"#)
        .create_async()
        .await;

    let err = s
        .helix
        .resolve_identity(&Handle::parse("nobody").unwrap())
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::NotFound(ref h) if h.as_str() == "nobody"));
}

// ============================================================================
// Subscriptions
// ============================================================================

#[tokio::test]
async fn test_create_subscription_requires_user_credential() {
    let s = setup().await;

    let err = s
        .helix
        .create_subscription(EventKind::StreamOnline, &ChannelId::new("1"), "session-1")
        .await
        .unwrap_err();

    assert!(err.authorization_url().is_some());
}

#[tokio::test]
async fn test_create_subscription_with_user_credential() {
    let mut s = setup().await;
    let _user = mock_token(&mut s.server, "authorization_code", "user-token").await;
    s.credentials.complete_authorization("code").await.unwrap();

    let create = s
        .server
        .mock("POST", "/eventsub/subscriptions")
        .match_header("authorization", "Bearer user-token")
        .match_header("client-id", CLIENT_ID)
        .match_body(Matcher::PartialJson(json!({
            "type": "stream.online",
            "version": "1",
            "condition": { "broadcaster_user_id": "1" },
            "transport": { "method": "websocket", "session_id": "session-1" }
        })))
        .with_status(202)
        .with_body(r#"{"data":[{"id":"sub-abc","status":"enabled","type":"stream.online"}]}"#)
        .create_async()
        .await;

    let id = s
        .helix
        .create_subscription(EventKind::StreamOnline, &ChannelId::new("1"), "session-1")
        .await
        .unwrap();

    assert_eq!(id, "sub-abc");
    create.assert_async().await;
}

#[tokio::test]
async fn test_create_subscription_rejects_non_accepted_status() {
    let mut s = setup().await;
    let _user = mock_token(&mut s.server, "authorization_code", "user-token").await;
    s.credentials.complete_authorization("code").await.unwrap();
    let _create = s
        .server
        .mock("POST", "/eventsub/subscriptions")
        .with_status(409)
        .with_body(r#"{"message":"subscription already exists"}"#)
        .create_async()
        .await;

    let err = s
        .helix
        .create_subscription(EventKind::StreamOffline, &ChannelId::new("1"), "session-1")
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Status { status: 409, .. }));
}

#[tokio::test]
async fn test_delete_subscription_treats_not_found_as_done() {
    let mut s = setup().await;
    let _user = mock_token(&mut s.server, "authorization_code", "user-token").await;
    s.credentials.complete_authorization("code").await.unwrap();
    let gone = s
        .server
        .mock("DELETE", "/eventsub/subscriptions")
        .match_query(Matcher::UrlEncoded("id".into(), "sub-gone".into()))
        .with_status(404)
        .create_async()
        .await;
    let _ok = s
        .server
        .mock("DELETE", "/eventsub/subscriptions")
        .match_query(Matcher::UrlEncoded("id".into(), "sub-live".into()))
        .with_status(204)
        .create_async()
        .await;

    s.helix.delete_subscription("sub-gone").await.unwrap();
    s.helix.delete_subscription("sub-live").await.unwrap();

    gone.assert_async().await;
}
