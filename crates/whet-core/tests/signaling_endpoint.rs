//! HTTP-level tests for the `/whet/` signaling endpoint: authorization,
//! target validation, CORS, and DELETE idempotence.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Method;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::peer_connection::configuration::RTCConfiguration;

use whet_core::{parse_forward_targets, WhetServer};

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn spawn_signaling_server(server: &WhetServer) -> (String, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = server.router();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });
    (format!("127.0.0.1:{}", addr.port()), shutdown_tx)
}

/// A syntactically valid SDP offer with a data channel, from a throwaway
/// peer connection.
async fn sample_offer() -> String {
    let api = APIBuilder::new().build();
    let peer = api
        .new_peer_connection(RTCConfiguration::default())
        .await
        .expect("peer connection");
    let _channel = peer
        .create_data_channel("data", None)
        .await
        .expect("data channel");
    let offer = peer.create_offer(None).await.expect("offer");
    let mut gather = peer.gathering_complete_promise().await;
    peer.set_local_description(offer)
        .await
        .expect("local description");
    let _ = gather.recv().await;
    let sdp = peer
        .local_description()
        .await
        .expect("missing local description")
        .sdp;
    let _ = peer.close().await;
    sdp
}

#[tokio::test(flavor = "multi_thread")]
async fn post_enforces_bearer_token() {
    init_tracing();
    timeout(TEST_TIMEOUT, async {
        let targets =
            parse_forward_targets(&["remoterange=127.0.0.1:9".to_string()]).expect("targets");
        let server = WhetServer::new(Some("T1".into()), targets);
        let (addr, _shutdown) = spawn_signaling_server(&server).await;
        let offer = sample_offer().await;
        let client = reqwest::Client::new();
        let url = format!("http://{addr}/whet/remoterange");

        // Missing header is rejected before the target is inspected.
        let response = client
            .post(&url)
            .header("Content-Type", "application/sdp")
            .body(offer.clone())
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), 401);

        // Wrong token.
        let response = client
            .post(&url)
            .header("Content-Type", "application/sdp")
            .bearer_auth("T2")
            .body(offer.clone())
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), 401);
        assert!(server.sessions().is_empty());

        // Correct token negotiates a session.
        let response = client
            .post(&url)
            .header("Content-Type", "application/sdp")
            .bearer_auth("T1")
            .body(offer)
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), 201);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/sdp"
        );
        let exposed = response
            .headers()
            .get("Access-Control-Expose-Headers")
            .expect("expose-headers")
            .to_str()
            .unwrap();
        assert!(exposed.eq_ignore_ascii_case("location"));
        let location = response
            .headers()
            .get("Location")
            .expect("Location header")
            .to_str()
            .unwrap()
            .to_owned();
        let id = location.rsplit('/').next().unwrap().to_owned();
        Uuid::parse_str(&id).expect("resource id is a uuid");
        assert_eq!(server.sessions().len(), 1);
        let answer = response.text().await.expect("body");
        assert!(answer.contains("v=0"), "expected an SDP answer");

        // DELETE removes the session and stays 2xx on repeat.
        let delete_url = format!("http://{addr}/whet/{id}");
        let response = client
            .delete(&delete_url)
            .bearer_auth("T1")
            .send()
            .await
            .expect("delete");
        assert!(response.status().is_success());
        assert!(server.sessions().is_empty());

        let response = client
            .delete(&delete_url)
            .bearer_auth("T1")
            .send()
            .await
            .expect("repeat delete");
        assert!(response.status().is_success());
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn post_rejects_unknown_targets_and_bad_offsets() {
    init_tracing();
    timeout(TEST_TIMEOUT, async {
        let targets =
            parse_forward_targets(&["remoterange=127.0.0.1:9".to_string()]).expect("targets");
        let server = WhetServer::new(None, targets);
        let (addr, _shutdown) = spawn_signaling_server(&server).await;
        let offer = sample_offer().await;
        let client = reqwest::Client::new();

        for suffix in ["nosuch", "remoterange-7", "remoterange-x", "a-1-2"] {
            let response = client
                .post(format!("http://{addr}/whet/{suffix}"))
                .header("Content-Type", "application/sdp")
                .body(offer.clone())
                .send()
                .await
                .expect("post");
            assert_eq!(response.status(), 400, "suffix {suffix} should be rejected");
        }
        assert!(server.sessions().is_empty());

        // Offset 0 addresses the first (only) port of a single-port target.
        let response = client
            .post(format!("http://{addr}/whet/remoterange-0"))
            .header("Content-Type", "application/sdp")
            .body(offer)
            .send()
            .await
            .expect("post");
        assert_eq!(response.status(), 201);
        let location = response
            .headers()
            .get("Location")
            .expect("Location header")
            .to_str()
            .unwrap()
            .to_owned();
        let id = location.rsplit('/').next().unwrap().to_owned();
        client
            .delete(format!("http://{addr}/whet/{id}"))
            .send()
            .await
            .expect("cleanup delete");
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn options_answers_with_cors_and_other_methods_are_rejected() {
    init_tracing();
    timeout(TEST_TIMEOUT, async {
        let server = WhetServer::new(None, HashMap::new());
        let (addr, _shutdown) = spawn_signaling_server(&server).await;
        let client = reqwest::Client::new();

        let response = client
            .request(Method::OPTIONS, format!("http://{addr}/whet/anything"))
            .send()
            .await
            .expect("options");
        assert_eq!(response.status(), 200);
        assert_eq!(
            response
                .headers()
                .get("Access-Control-Allow-Origin")
                .expect("allow-origin"),
            "*"
        );
        let allowed = response
            .headers()
            .get("Access-Control-Allow-Methods")
            .expect("allow-methods")
            .to_str()
            .unwrap();
        assert!(allowed.contains("POST"), "allow-methods was {allowed:?}");

        let response = client
            .get(format!("http://{addr}/whet/anything"))
            .send()
            .await
            .expect("get");
        assert_eq!(response.status(), 405);
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_of_unknown_resources_is_a_no_op() {
    init_tracing();
    timeout(TEST_TIMEOUT, async {
        let server = WhetServer::new(None, HashMap::new());
        let (addr, _shutdown) = spawn_signaling_server(&server).await;
        let client = reqwest::Client::new();

        let response = client
            .delete(format!("http://{addr}/whet/{}", Uuid::new_v4()))
            .send()
            .await
            .expect("delete unknown uuid");
        assert!(response.status().is_success());

        let response = client
            .delete(format!("http://{addr}/whet/not-a-uuid"))
            .send()
            .await
            .expect("delete junk id");
        assert!(response.status().is_success());
    })
    .await
    .expect("test timed out");
}
