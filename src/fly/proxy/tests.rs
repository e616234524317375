//! Tests for starting and detecting the local Machines API proxy.

use rstest::rstest;
use tokio::net::TcpListener;

use super::*;

const FAST: PollPolicy = PollPolicy::new(Duration::from_millis(20), 25);

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"))
        .port()
}

#[rstest]
#[case::default_host("http://127.0.0.1:4280", Some("127.0.0.1:4280"))]
#[case::localhost("http://localhost:4280/", Some("127.0.0.1:4280"))]
#[case::ipv6_loopback("http://[::1]:4280", Some("[::1]:4280"))]
#[case::remote("https://api.machines.dev", None)]
#[case::private_network("http://_api.internal:4280", None)]
fn only_loopback_hosts_need_a_proxy(#[case] host: &str, #[case] expected: Option<&str>) {
    let address = loopback_address(host).unwrap_or_else(|err| panic!("parse: {err}"));

    assert_eq!(address.map(|addr| addr.to_string()).as_deref(), expected);
}

#[test]
fn unparsable_host_is_reported() {
    let err = loopback_address("not a url");

    assert!(matches!(err, Err(ProxyError::InvalidHost { .. })), "{err:?}");
}

#[tokio::test]
async fn running_proxy_is_left_alone() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap_or_else(|err| panic!("bind: {err}"));
    let port = listener
        .local_addr()
        .unwrap_or_else(|err| panic!("local addr: {err}"))
        .port();

    let proxy = ApiProxy::ensure(
        &format!("http://127.0.0.1:{port}"),
        Some("/nonexistent/flyctl"),
        FAST,
    )
    .await
    .unwrap_or_else(|err| panic!("ensure: {err}"));

    assert!(proxy.is_none());
}

#[tokio::test]
async fn missing_flyctl_names_the_fallbacks() {
    let port = free_port().await;

    let err = ApiProxy::ensure(
        &format!("http://127.0.0.1:{port}"),
        Some("/nonexistent/flyctl"),
        FAST,
    )
    .await
    .err()
    .unwrap_or_else(|| panic!("ensure should fail"));

    assert!(matches!(err, ProxyError::Missing { .. }), "{err:?}");
    assert!(err.to_string().contains("VESSEL_API_HOST"), "{err}");
}

#[tokio::test]
async fn proxy_that_exits_reports_its_stderr() {
    let port = free_port().await;
    let address = SocketAddr::from(([127, 0, 0, 1], port));

    let err = ApiProxy::spawn(
        "sh",
        &["-c", "echo 'no access token available' >&2; exit 1"],
        address,
        FAST,
    )
    .await
    .err()
    .unwrap_or_else(|| panic!("spawn should fail"));

    let ProxyError::NotListening { stderr, .. } = err else {
        panic!("expected NotListening, got {err:?}");
    };
    assert_eq!(stderr, "no access token available");
}

#[tokio::test]
async fn proxy_is_used_once_it_listens() {
    let port = free_port().await;
    let address = SocketAddr::from(([127, 0, 0, 1], port));
    let late_listener = tokio::spawn(async move {
        time::sleep(Duration::from_millis(60)).await;
        let listener = TcpListener::bind(address)
            .await
            .unwrap_or_else(|err| panic!("bind: {err}"));
        time::sleep(Duration::from_secs(2)).await;
        drop(listener);
    });

    let proxy = ApiProxy::spawn("sh", &["-c", "exec sleep 30"], address, FAST)
        .await
        .unwrap_or_else(|err| panic!("spawn: {err}"));

    assert_eq!(proxy.address(), address);
    proxy.stop().await;
    late_listener.abort();
}
