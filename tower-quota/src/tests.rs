use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use more_asserts::assert_le;
use quota_queue::Endpoint;
use quota_queue::Grant;
use quota_queue::LimitScope;
use quota_queue::Priority;
use quota_queue::ScopeReport;
use quota_queue::UpstreamReport;
use tokio::task::JoinSet;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::ServiceExt;
use tower_test::mock;

use super::*;

fn endpoint() -> Endpoint {
    Endpoint::new("euw1", "lol/status/v4/platform-data")
}

/// One credential seeded with 5 calls per 5s, on a mock clock that only moves when told to.
fn start(config: impl FnOnce(Config) -> Config) -> (AdmissionHandle, Arc<quanta::Mock>) {
    let (clock, mock) = quanta::Clock::mock();
    mock.increment(Duration::from_secs(3600));
    let config = config(Config::new(["key-1"]).with_clock(clock));
    (AdmissionHandle::start(config).unwrap(), mock)
}

fn quota(limit: &str, count: &str) -> UpstreamReport {
    UpstreamReport {
        platform: ScopeReport::parse(Some(limit), Some(count)).unwrap(),
        method: ScopeReport::parse(Some(limit), Some(count)).unwrap(),
        ..UpstreamReport::default()
    }
}

async fn burst(handle: &AdmissionHandle, n: usize) -> Vec<Result<Grant, AdmitError>> {
    let endpoint = endpoint();
    join_all((0..n).map(|_| handle.acquire(&endpoint, Priority::High))).await
}

#[tokio::test(start_paused = true)]
async fn test_first_grant_probes_limits() {
    let (handle, _mock) = start(|config| config);

    let first = handle.acquire(&endpoint(), Priority::Normal).await.unwrap();
    assert_eq!(
        first,
        Grant {
            credential: 0,
            refresh: true
        }
    );

    let second = handle.acquire(&endpoint(), Priority::High).await.unwrap();
    assert!(!second.refresh);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_priority_queue_fails_fast() {
    let (handle, _mock) = start(|config| config.with_priority_fraction(0.0));

    let result = handle.acquire(&endpoint(), Priority::High).await;
    assert_eq!(
        result,
        Err(AdmitError::RateLimited {
            retry_after: Some(Duration::from_secs(1))
        })
    );

    // Normal traffic is unaffected.
    assert!(handle.acquire(&endpoint(), Priority::Normal).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_hard_cap_times_out_the_excess() {
    let (handle, _mock) = start(|config| config);

    let results = burst(&handle, 6).await;
    let granted = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(granted, 5);
    assert!(results.contains(&Err(AdmitError::Timeout)));
}

#[tokio::test(start_paused = true)]
async fn test_window_refills_with_time() {
    let (handle, mock) = start(|config| config);

    assert!(burst(&handle, 5).await.iter().all(Result::is_ok));

    mock.increment(Duration::from_secs(6));
    assert!(handle.acquire(&endpoint(), Priority::High).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_report_raises_limits() {
    let (handle, _mock) = start(|config| config);

    assert!(burst(&handle, 5).await.iter().all(Result::is_ok));
    handle
        .report(&endpoint().id, 0, quota("100:10", "5:10"))
        .await
        .unwrap();

    assert!(burst(&handle, 5).await.iter().all(Result::is_ok));
}

#[tokio::test(start_paused = true)]
async fn test_report_for_unknown_pairing_is_ignored() {
    let (handle, _mock) = start(|config| config);

    handle
        .report("euw1:lol/unknown", 3, quota("100:10", "5:10"))
        .await
        .unwrap();
    assert_eq!(handle.state(), LoopState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_blackout_holds_every_request() {
    let (handle, mock) = start(|config| config.with_request_timeout(Duration::from_secs(2)));

    assert!(handle.acquire(&endpoint(), Priority::High).await.is_ok());
    // The platform ran out; the method still has room.
    let report = UpstreamReport {
        platform: ScopeReport::parse(Some("10:60"), Some("10:60")).unwrap(),
        method: ScopeReport::parse(Some("100:60"), Some("1:60")).unwrap(),
        retry_after: Some(handle.clock().now() + Duration::from_secs(30)),
        scope: LimitScope::Platform,
    };
    handle.report(&endpoint().id, 0, report).await.unwrap();

    assert_eq!(
        handle.acquire(&endpoint(), Priority::High).await,
        Err(AdmitError::Timeout)
    );

    mock.increment(Duration::from_secs(31));
    assert!(handle.acquire(&endpoint(), Priority::High).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_refund_returns_quota() {
    let (handle, _mock) = start(|config| config);

    assert!(burst(&handle, 5).await.iter().all(Result::is_ok));
    handle.refund(&endpoint().id, 0).await.unwrap();

    assert!(handle.acquire(&endpoint(), Priority::High).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_queued_callers() {
    let (handle, _mock) = start(|config| config);

    assert!(burst(&handle, 5).await.iter().all(Result::is_ok));

    let queued = tokio::spawn({
        let handle = handle.clone();
        async move { handle.acquire(&endpoint(), Priority::High).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    handle.shutdown().await.unwrap();
    assert_eq!(handle.state(), LoopState::Stopped);
    assert_eq!(
        queued.await.unwrap(),
        Err(AdmitError::RateLimited { retry_after: None })
    );

    assert_eq!(
        handle.acquire(&endpoint(), Priority::Normal).await,
        Err(AdmitError::Closed)
    );
    assert_eq!(
        handle.refund(&endpoint().id, 0).await,
        Err(AdmitError::Closed)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_event_flood_does_not_starve_the_poll_tick() {
    let (handle, _mock) = start(|config| config.with_request_timeout(Duration::from_secs(2)));

    let mut flood = JoinSet::new();
    for _ in 0..3 {
        let handle = handle.clone();
        flood.spawn(async move { while handle.refund("euw1:nope", 0).await.is_ok() {} });
    }

    let granted = handle.acquire(&endpoint(), Priority::High).await;
    flood.abort_all();
    assert!(granted.is_ok(), "{granted:?}");
}

#[test]
fn test_full_event_buffer_is_bounded_by_the_deadline() {
    // The loop lands on a runtime nobody drives, so it never drains its events.
    let stalled = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let (clock, _mock) = quanta::Clock::mock();
    let config = Config::new(["key-1"])
        .with_clock(clock)
        .with_event_buffer(1)
        .with_request_timeout(Duration::from_secs(2))
        .with_caller_margin(Duration::from_secs(1));
    let handle = {
        let _guard = stalled.enter();
        AdmissionHandle::start(config).unwrap()
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap();
    runtime.block_on(async {
        handle.refund(&endpoint().id, 0).await.unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(
            handle.acquire(&endpoint(), Priority::High).await,
            Err(AdmitError::Timeout)
        );
        assert_le!(started.elapsed(), Duration::from_secs(3));
    });
}

#[test]
fn test_start_rejects_invalid_config() {
    assert!(matches!(
        AdmissionHandle::start(Config::new(Vec::<String>::new())),
        Err(ConfigError::NoCredentials)
    ));
}

fn routed(priority: Priority) -> Routed<()> {
    Routed {
        request: (),
        endpoint: endpoint(),
        method: "lol/status/v4/platform-data".to_string(),
        priority,
    }
}

fn response(status: u16, headers: &[(&str, &str)]) -> http::Response<()> {
    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_layer_reports_and_tags_the_key() {
    let (handle, _mock) = start(|config| config);
    let (upstream, mut upstream_handle) = mock::pair::<Dispatch<()>, http::Response<()>>();
    let mut service = AdmissionLayer::new(handle.clone()).layer(upstream);

    let call = tokio::spawn(service.ready().await.unwrap().call(routed(Priority::High)));
    let (dispatch, send) = upstream_handle.next_request().await.unwrap();
    assert_eq!(dispatch.credential, 0);
    assert_eq!(dispatch.endpoint, endpoint());
    send.send_response(response(
        200,
        &[
            (report::PLATFORM_LIMIT, "100:10"),
            (report::PLATFORM_COUNT, "1:10"),
            (report::METHOD_LIMIT, "100:10"),
            (report::METHOD_COUNT, "1:10"),
        ],
    ));

    let response = call.await.unwrap().unwrap();
    assert_eq!(response.headers()[report::KEY], "1");

    // The seed would only have allowed four more.
    assert!(burst(&handle, 8).await.iter().all(Result::is_ok));
}

#[tokio::test(start_paused = true)]
async fn test_layer_surfaces_rejections() {
    let (handle, _mock) = start(|config| config.with_priority_fraction(0.0));
    let (upstream, _upstream_handle) = mock::pair::<Dispatch<()>, http::Response<()>>();
    let mut service = AdmissionLayer::new(handle).layer(upstream);

    let error: BoxError = service
        .ready()
        .await
        .unwrap()
        .call(routed(Priority::High))
        .await
        .unwrap_err();
    assert!(matches!(
        error.downcast_ref::<AdmitError>(),
        Some(AdmitError::RateLimited { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_layer_refunds_server_errors() {
    let (handle, _mock) = start(|config| config.with_refund_on_failure(true));
    assert!(handle.refund_on_failure());

    assert!(burst(&handle, 4).await.iter().all(Result::is_ok));

    let (upstream, mut upstream_handle) = mock::pair::<Dispatch<()>, http::Response<()>>();
    let mut service = AdmissionLayer::new(handle.clone()).layer(upstream);

    let call = tokio::spawn(service.ready().await.unwrap().call(routed(Priority::High)));
    let (_, send) = upstream_handle.next_request().await.unwrap();
    send.send_response(response(503, &[]));
    let response = call.await.unwrap().unwrap();
    assert_eq!(response.status(), 503);

    // The fifth call was handed back.
    assert!(handle.acquire(&endpoint(), Priority::High).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_layer_maps_upstream_errors() {
    let (handle, _mock) = start(|config| config);
    let (upstream, mut upstream_handle) = mock::pair::<Dispatch<()>, http::Response<()>>();
    let mut service = AdmissionLayer::new(handle).layer(upstream);

    let call = tokio::spawn(service.ready().await.unwrap().call(routed(Priority::Normal)));
    let (_, send) = upstream_handle.next_request().await.unwrap();
    send.send_error("connection reset");

    let error = call.await.unwrap().unwrap_err();
    assert!(matches!(
        error.downcast_ref::<AdmitError>(),
        Some(AdmitError::Upstream(message)) if message.contains("connection reset")
    ));
}

#[tokio::test(start_paused = true)]
async fn test_layer_accepts_any_upstream_error() {
    let (handle, _mock) = start(|config| config.with_refund_on_failure(true));
    let upstream = tower::service_fn(|_: Dispatch<()>| async {
        Err::<http::Response<()>, _>(std::io::Error::other("connection refused"))
    });
    let service = AdmissionLayer::new(handle.clone()).layer(upstream);

    let error = tokio::spawn(service.oneshot(routed(Priority::High)))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        error.downcast_ref::<AdmitError>(),
        Some(AdmitError::Upstream(message)) if message.contains("connection refused")
    ));

    // The failed call was handed back, so the full seed is still there.
    assert!(burst(&handle, 5).await.iter().all(Result::is_ok));
}

#[test]
fn test_routed_from_request() {
    let catalog = Catalog::from_patterns([("euw1", "lol/summoner/v4/summoners/{id}")]);
    let request = http::Request::builder()
        .uri("/euw1/lol/summoner/v4/summoners/abc")
        .header(report::PRIORITY, "high")
        .body(())
        .unwrap();

    let routed = Routed::from_request(&catalog, RequestMode::Path, request).unwrap();
    assert_eq!(routed.endpoint.id, "euw1:lol/summoner/v4/summoners/{id}");
    assert_eq!(routed.method, "lol/summoner/v4/summoners/abc");
    assert_eq!(routed.priority, Priority::High);

    let request = http::Request::builder()
        .uri("/lol/summoner/v4/summoners/abc")
        .header(http::header::HOST, "euw1.api.riotgames.com")
        .body(())
        .unwrap();
    let routed = Routed::from_request(&catalog, RequestMode::Proxy, request).unwrap();
    assert_eq!(routed.endpoint.platform, "euw1");
    assert_eq!(routed.priority, Priority::Normal);
}
