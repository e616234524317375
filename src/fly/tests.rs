//! Tests for the Fly.io backend against a canned local HTTP server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::Method;
use rstest::rstest;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::*;
use crate::backend::ProviderError;

const TOKEN: &str = "fly-token";

#[derive(Clone, Debug, Default)]
struct Recorded {
    method: String,
    path: String,
    authorization: Option<String>,
    body: String,
}

struct CannedServer {
    base: String,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl CannedServer {
    fn requests(&self) -> Vec<Recorded> {
        self.requests
            .lock()
            .unwrap_or_else(|err| panic!("lock poisoned: {err}"))
            .clone()
    }

    fn backend(&self) -> FlyBackend {
        FlyBackend::with_endpoints(
            FlyEndpoints::new(&self.base, &format!("{}/graphql", self.base)),
            TOKEN,
            Duration::from_secs(5),
        )
        .unwrap_or_else(|err| panic!("backend: {err}"))
    }
}

fn header_value<'a>(head: &'a str, wanted: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.eq_ignore_ascii_case(wanted).then_some(value.trim())
    })
}

fn parse_request(buffer: &[u8]) -> Option<Recorded> {
    let text = String::from_utf8_lossy(buffer);
    let (head, body) = text.split_once("\r\n\r\n")?;
    let length = header_value(head, "content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    if body.len() < length {
        return None;
    }
    let mut request_line = head.lines().next()?.split_whitespace();
    Some(Recorded {
        method: request_line.next()?.to_owned(),
        path: request_line.next()?.to_owned(),
        authorization: header_value(head, "authorization").map(str::to_owned),
        body: body.to_owned(),
    })
}

async fn read_request(stream: &mut TcpStream) -> Recorded {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let read = stream.read(&mut chunk).await.unwrap_or(0);
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(chunk.get(..read).unwrap_or_default());
        if let Some(request) = parse_request(&buffer) {
            return request;
        }
    }
    parse_request(&buffer).unwrap_or_default()
}

/// Serves one canned `(status, body)` response per incoming request.
async fn serve(responses: Vec<(u16, String)>) -> CannedServer {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    let requests = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&requests);

    tokio::spawn(async move {
        for (status, body) in responses {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let recorded = read_request(&mut stream).await;
            log.lock()
                .unwrap_or_else(|err| panic!("lock poisoned: {err}"))
                .push(recorded);
            let response = format!(
                "HTTP/1.1 {status} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            if stream.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    });

    CannedServer {
        base: format!("http://{addr}"),
        requests,
    }
}

fn machine_request(region: Option<&str>) -> MachineRequest {
    MachineRequest {
        app_name: String::from("shop"),
        image: String::from("vesselapp/php:8.1"),
        region: region.map(str::to_owned),
        public_key: String::from("ssh-ed25519 AAAA vessel"),
        org: String::from("personal"),
    }
}

fn endpoints() -> FlyEndpoints {
    FlyEndpoints::new("http://api.local/", "http://api.local/graphql")
}

#[rstest]
#[case::create_app(
    FlyRequest::CreateApp { app: "shop", org: "personal" },
    Method::POST,
    "http://api.local/v1/apps",
)]
#[case::get_machine(
    FlyRequest::GetMachine { app: "shop", machine_id: "m1" },
    Method::GET,
    "http://api.local/v1/apps/shop/machines/m1",
)]
#[case::delete_app(FlyRequest::DeleteApp { app: "shop" }, Method::DELETE, "http://api.local/v1/apps/shop")]
#[case::nearest(FlyRequest::NearestRegion, Method::POST, "http://api.local/graphql")]
#[case::viewer(FlyRequest::Viewer, Method::POST, "http://api.local/graphql")]
fn requests_target_expected_urls(
    #[case] request: FlyRequest<'static>,
    #[case] method: Method,
    #[case] url: &str,
) {
    let built = request.build(&endpoints());

    assert_eq!(built.method, method);
    assert_eq!(built.url, url);
}

#[test]
fn create_app_body_names_app_and_org() {
    let built = FlyRequest::CreateApp {
        app: "shop",
        org: "personal",
    }
    .build(&endpoints());

    assert_eq!(
        built.body,
        Some(json!({ "app_name": "shop", "org_slug": "personal" }))
    );
}

#[rstest]
#[case::with_region(Some("ams"))]
#[case::without_region(None)]
fn run_machine_body_exports_public_key(#[case] region: Option<&'static str>) {
    let built = FlyRequest::RunMachine {
        app: "shop",
        region,
        image: "vesselapp/php:8.1",
        public_key: "ssh-ed25519 AAAA",
    }
    .build(&endpoints());
    let body = built.body.unwrap_or_else(|| panic!("run machine carries a body"));

    assert_eq!(built.url, "http://api.local/v1/apps/shop/machines");
    assert_eq!(body["config"]["image"], "vesselapp/php:8.1");
    assert_eq!(body["config"]["env"]["VESSEL_PUBLIC_KEY"], "ssh-ed25519 AAAA");
    assert_eq!(body.get("region").and_then(|value| value.as_str()), region);
}

#[rstest]
#[case::ipv6(true, "v6")]
#[case::ipv4(false, "v4")]
fn allocate_request_selects_address_family(#[case] ipv6: bool, #[case] family: &str) {
    let built = FlyRequest::AllocateAddress { app: "shop", ipv6 }.build(&endpoints());
    let body = built.body.unwrap_or_else(|| panic!("allocate carries a body"));

    assert_eq!(body["variables"]["input"]["appId"], "shop");
    assert_eq!(body["variables"]["input"]["type"], family);
    assert!(
        body["query"]
            .as_str()
            .is_some_and(|query| query.contains("allocateIpAddress"))
    );
}

#[rstest]
#[case::started("started", MachineStatus::Initialized)]
#[case::created("created", MachineStatus::Pending(String::from("created")))]
#[case::starting("starting", MachineStatus::Pending(String::from("starting")))]
#[case::destroyed("destroyed", MachineStatus::Terminal(String::from("destroyed")))]
#[case::failed("failed", MachineStatus::Terminal(String::from("failed")))]
fn machine_state_maps_to_status(#[case] state: &str, #[case] expected: MachineStatus) {
    let machine = Machine {
        id: String::from("m1"),
        state: state.to_owned(),
    };

    assert_eq!(machine.status(), expected);
}

#[tokio::test]
async fn create_app_posts_app_and_org() {
    let server = serve(vec![(201, String::from("{}"))]).await;

    server
        .backend()
        .create_app(&machine_request(Some("ams")))
        .await
        .unwrap_or_else(|err| panic!("create app: {err}"));

    let requests = server.requests();
    let sent = requests.first().unwrap_or_else(|| panic!("no request sent"));
    assert_eq!(requests.len(), 1);
    assert_eq!(format!("{} {}", sent.method, sent.path), "POST /v1/apps");
    assert_eq!(sent.authorization.as_deref(), Some("Bearer fly-token"));
    assert!(sent.body.contains(r#""org_slug":"personal""#));
}

#[tokio::test]
async fn taken_app_name_is_reported_without_further_calls() {
    let server = serve(vec![(
        422,
        String::from(r#"{"error":"Name has already been taken"}"#),
    )])
    .await;

    let result = server.backend().create_app(&machine_request(Some("ams"))).await;

    assert!(matches!(
        result,
        Err(FlyBackendError::Status { status: 422, .. })
    ));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn create_machine_boots_in_requested_region() {
    let server = serve(vec![(200, String::from(r#"{"id":"m1","state":"created"}"#))]).await;

    let handle = server
        .backend()
        .create_machine(&machine_request(Some("ams")))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    assert_eq!(handle.app_name, "shop");
    assert_eq!(handle.machine_id, "m1");
    let requests = server.requests();
    let paths: Vec<_> = requests
        .iter()
        .map(|request| format!("{} {}", request.method, request.path))
        .collect();
    assert_eq!(paths, ["POST /v1/apps/shop/machines"]);
    assert!(requests.first().is_some_and(|request| request.body.contains(r#""region":"ams""#)));
}

#[tokio::test]
async fn create_machine_without_region_asks_for_nearest() {
    let server = serve(vec![
        (
            200,
            String::from(r#"{"data":{"nearestRegion":{"code":"fra","name":"Frankfurt","gatewayAvailable":true}}}"#),
        ),
        (200, String::from(r#"{"id":"m2","state":"created"}"#)),
    ])
    .await;

    server
        .backend()
        .create_machine(&machine_request(None))
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));

    let requests = server.requests();
    assert_eq!(requests.first().map(|request| request.path.as_str()), Some("/graphql"));
    assert!(requests.get(1).is_some_and(|request| request.body.contains(r#""region":"fra""#)));
}

#[tokio::test]
async fn invalid_request_sends_nothing() {
    let server = serve(Vec::new()).await;

    let mut request = machine_request(None);
    request.public_key.clear();
    let result = server.backend().create_app(&request).await;

    assert_eq!(
        result,
        Err(FlyBackendError::Validation(String::from("public_key")))
    );
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn machine_status_reads_state() {
    let server = serve(vec![(200, String::from(r#"{"id":"m1","name":"shop","state":"started"}"#))]).await;
    let handle = MachineHandle {
        app_name: String::from("shop"),
        machine_id: String::from("m1"),
    };

    let status = server
        .backend()
        .machine_status(&handle)
        .await
        .unwrap_or_else(|err| panic!("status: {err}"));

    assert_eq!(status, MachineStatus::Initialized);
    assert_eq!(
        server.requests().first().map(|request| request.path.clone()),
        Some(String::from("/v1/apps/shop/machines/m1"))
    );
}

#[tokio::test]
async fn missing_app_counts_as_deleted() {
    let server = serve(vec![(404, String::from(r#"{"error":"not found"}"#))]).await;

    let result = server.backend().delete_app("shop").await;

    assert_eq!(result, Ok(()));
}

#[tokio::test]
async fn server_error_is_reported_with_status_and_body() {
    let server = serve(vec![(500, String::from("boom"))]).await;

    let result = server.backend().delete_app("shop").await;

    let Err(FlyBackendError::Status {
        method,
        status,
        body,
        ..
    }) = result
    else {
        panic!("expected status error, got {result:?}");
    };
    assert_eq!(method, "DELETE");
    assert_eq!(status, 500);
    assert_eq!(body, "boom");
}

#[tokio::test]
async fn rejected_token_is_unauthorized() {
    let server = serve(vec![(401, String::from(r#"{"error":"unauthorized"}"#))]).await;

    let err = server
        .backend()
        .delete_app("shop")
        .await
        .err()
        .unwrap_or_else(|| panic!("expected an error"));

    assert!(err.is_unauthorized());
}

#[tokio::test]
async fn allocate_address_returns_address() {
    let server = serve(vec![(
        200,
        String::from(
            r#"{"data":{"allocateIpAddress":{"ipAddress":{"id":"ip1","address":"2a09:8280:1::1","type":"v6","region":"global","createdAt":"2024-01-01T00:00:00Z"}}}}"#,
        ),
    )])
    .await;

    let address = server
        .backend()
        .allocate_address("shop", true)
        .await
        .unwrap_or_else(|err| panic!("allocate: {err}"));

    assert_eq!(address, "2a09:8280:1::1");
}

#[tokio::test]
async fn viewer_lists_organisations() {
    let server = serve(vec![(
        200,
        String::from(
            r#"{"data":{"currentUser":{"email":"dev@example.com"},"organizations":{"nodes":[{"id":"o1","slug":"personal","name":"Dev","type":"PERSONAL","viewerRole":"admin"},{"id":"o2","slug":"acme","name":"Acme","type":"SHARED","viewerRole":"member"}]}}}"#,
        ),
    )])
    .await;

    let viewer = server
        .backend()
        .viewer()
        .await
        .unwrap_or_else(|err| panic!("viewer: {err}"));

    assert_eq!(viewer.email, "dev@example.com");
    let slugs: Vec<&str> = viewer
        .organizations
        .iter()
        .map(|org| org.slug.as_str())
        .collect();
    assert_eq!(slugs, vec!["personal", "acme"]);
    let requests = server.requests();
    let request = requests.first().unwrap_or_else(|| panic!("no request"));
    assert_eq!(request.path, "/graphql");
    assert!(request.body.contains("currentUser"));
    assert_eq!(request.authorization.as_deref(), Some("Bearer fly-token"));
}

#[tokio::test]
async fn graphql_errors_are_surfaced() {
    let server = serve(vec![(
        200,
        String::from(r#"{"data":null,"errors":[{"message":"app not found"}]}"#),
    )])
    .await;

    let result = server.backend().allocate_address("shop", false).await;

    assert_eq!(
        result,
        Err(FlyBackendError::GraphQl {
            operation: "allocateIpAddress",
            message: String::from("app not found"),
        })
    );
}

#[tokio::test]
async fn malformed_body_is_a_decode_error() {
    let server = serve(vec![(200, String::from("not json"))]).await;
    let handle = MachineHandle {
        app_name: String::from("shop"),
        machine_id: String::from("m1"),
    };

    let result = server.backend().machine_status(&handle).await;

    assert!(matches!(result, Err(FlyBackendError::Decode { .. })));
}

#[tokio::test]
async fn silent_server_times_out_after_max_attempts() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let addr = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"));
    let accepted = Arc::new(Mutex::new(Vec::new()));
    let held = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            held.lock()
                .unwrap_or_else(|err| panic!("lock poisoned: {err}"))
                .push(stream);
        }
    });

    let base = format!("http://{addr}");
    let backend = FlyBackend::with_endpoints(
        FlyEndpoints::new(&base, &format!("{base}/graphql")),
        TOKEN,
        Duration::from_millis(100),
    )
    .unwrap_or_else(|err| panic!("backend: {err}"))
    .with_max_attempts(3);

    let result = backend.delete_app("shop").await;

    assert!(matches!(
        result,
        Err(FlyBackendError::Timeout { attempts: 3, .. })
    ));
    assert_eq!(
        accepted
            .lock()
            .unwrap_or_else(|err| panic!("lock poisoned: {err}"))
            .len(),
        3
    );
}
