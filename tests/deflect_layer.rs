use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode, header};
use axum::response::Response;
use axum::{Router, routing::get};
use deflect::{ClientId, Deflect, DeflectLayer, DeflectOptions, ManualClock, MemorySink};
use tower::ServiceExt;

fn app(deflect: Deflect, hits: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route(
            "/",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    ([(header::CONTENT_TYPE, "text/plain")], "cookies")
                }
            }),
        )
        .layer(DeflectLayer::new(deflect))
}

fn from(id: &str) -> Request<Body> {
    let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
    req.extensions_mut().insert(ClientId(id.to_string()));
    req
}

fn from_addr(addr: &str) -> Request<Body> {
    let mut req = Request::builder().uri("/").body(Body::empty()).unwrap();
    let addr: SocketAddr = addr.parse().unwrap();
    req.extensions_mut().insert(ConnectInfo(addr));
    req
}

async fn body(res: Response) -> String {
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn throttle(options: DeflectOptions) -> (Deflect, ManualClock) {
    let clock = ManualClock::default();
    let deflect = Deflect::with_clock(options, Arc::new(clock.clone())).unwrap();
    (deflect, clock)
}

#[tokio::test]
async fn regular_requests_follow_through() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (deflect, _) = throttle(DeflectOptions::default());
    let res = app(deflect, hits.clone()).oneshot(from_addr("111.111.111.111:4000")).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(body(res).await, "cookies");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn deflected_response_shape() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (deflect, _) = throttle(DeflectOptions::default().blacklist(["B"]));
    let res = app(deflect, hits.clone()).oneshot(from("B")).await.unwrap();

    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert_eq!(res.headers()[header::CONTENT_TYPE], "text/html");
    assert_eq!(res.headers()[header::CONTENT_LENGTH], "0");
    assert_eq!(body(res).await, "");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn threshold_then_block_then_release() {
    let hits = Arc::new(AtomicUsize::new(0));
    let log = MemorySink::new();
    let (deflect, clock) = throttle(
        DeflectOptions::default()
            .request_threshold(5)
            .interval(Duration::from_secs(10))
            .block_duration(Duration::from_secs(10))
            .log(log.clone()),
    );
    let app = app(deflect, hits.clone());

    for _ in 0..5 {
        let res = app.clone().oneshot(from_addr("111.111.111.111:1")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    for _ in 0..10 {
        let res = app.clone().oneshot(from_addr("111.111.111.111:2")).await.unwrap();
        assert_eq!(res.status(), StatusCode::FORBIDDEN);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 5);

    // other clients are unaffected
    let res = app.clone().oneshot(from_addr("222.222.222.222:1")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    clock.advance_secs(10);
    let res = app.clone().oneshot(from_addr("111.111.111.111:3")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    assert_eq!(
        log.lines(),
        [
            "deflect(01/01/1970): blocked 111.111.111.111",
            "deflect(01/01/1970): released 111.111.111.111",
        ]
    );
}

#[tokio::test]
async fn blacklisted_client_is_refused_on_first_request() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (deflect, _) = throttle(DeflectOptions::default().blacklist(["222.222.222.222"]));
    let app = app(deflect.clone(), hits);

    let res = app.clone().oneshot(from_addr("111.111.111.111:80")).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app.clone().oneshot(from_addr("222.222.222.222:80")).await.unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    assert!(deflect.record("222.222.222.222").is_none());
}

#[tokio::test]
async fn whitelisted_client_is_never_blocked() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (deflect, _) = throttle(
        DeflectOptions::default()
            .request_threshold(1)
            .whitelist(["C", "192.168.0.0/16"]),
    );
    let app = app(deflect.clone(), hits.clone());

    for _ in 0..50 {
        let res = app.clone().oneshot(from("C")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let res = app.clone().oneshot(from_addr("192.168.4.4:9")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 100);
    assert_eq!(deflect.tracked_clients(), 0);
}

#[tokio::test]
async fn fresh_window_after_quiet_period() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (deflect, clock) = throttle(
        DeflectOptions::default()
            .request_threshold(3)
            .interval(Duration::from_secs(2)),
    );
    let app = app(deflect, hits.clone());

    for _ in 0..3 {
        let res = app.clone().oneshot(from("D")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    clock.advance_secs(3);
    for _ in 0..3 {
        let res = app.clone().oneshot(from("D")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn explicit_client_id_beats_peer_address() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (deflect, _) = throttle(DeflectOptions::default().blacklist(["10.0.0.1"]));
    let app = app(deflect, hits);

    let mut req = from_addr("10.0.0.1:5000");
    req.extensions_mut().insert(ClientId("api-key-7".to_string()));
    let res = app.oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn anonymous_requests_share_a_bucket() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (deflect, _) = throttle(DeflectOptions::default().request_threshold(2));
    let app = app(deflect.clone(), hits);

    let anonymous = || Request::builder().uri("/").body(Body::empty()).unwrap();
    for expected in [StatusCode::OK, StatusCode::OK, StatusCode::FORBIDDEN] {
        let res = app.clone().oneshot(anonymous()).await.unwrap();
        assert_eq!(res.status(), expected);
    }
    assert!(deflect.record("").unwrap().is_blocked());
}

#[tokio::test]
async fn concurrent_requests_admit_exactly_the_threshold() {
    let hits = Arc::new(AtomicUsize::new(0));
    let (deflect, _) = throttle(DeflectOptions::default().request_threshold(20));
    let app = app(deflect, hits.clone());

    let tasks: Vec<_> = (0..64)
        .map(|_| {
            let app = app.clone();
            tokio::spawn(async move { app.oneshot(from("E")).await.unwrap().status() })
        })
        .collect();

    let mut ok = 0;
    for task in tasks {
        if task.await.unwrap() == StatusCode::OK {
            ok += 1;
        }
    }
    assert_eq!(ok, 20);
    assert_eq!(hits.load(Ordering::SeqCst), 20);
}
