//! HTTP surface tests driven through the router with `tower::oneshot`

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use amps::config::AppConfig;
use amps::registry::ChannelRegistry;
use amps::relay::TranscoderManager;
use amps::services::ChannelService;
use amps::web::{create_router, AppState};

const CONFIG: &str = r#"
server:
  host: 127.0.0.1
  port: 5000
  token: sekrit
ffmpeg_profiles:
  copy:
    options:
      vcodec: copy
      acodec: copy
streams:
  - id: 1
    name: News
    source: http://upstream/news.ts
    ffmpeg_profile: copy
    group: News
    logo: http://logo/news.png
    next_programs:
      - title: Evening Bulletin
        start: 2030-05-01T18:00:00Z
  - id: 2
    name: Sports
    source: http://upstream/sports.ts
    ffmpeg_profile: copy
    group: Sports
    regions_allowed: [US]
  - id: 3
    name: Variants
    source: http://upstream/var.ts
    ffmpeg_profile: copy
    variants:
      - name: low
        label: Low bitrate
"#;

fn test_app() -> Router {
    let mut config: AppConfig = serde_yaml::from_str(CONFIG).unwrap();
    config.validate().unwrap();
    let registry = Arc::new(ChannelRegistry::new(config.streams.clone()));
    let manager = TranscoderManager::from_config(&config);
    let channels = ChannelService::new(registry, manager);
    create_router(AppState::new(config.server, channels))
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "localhost:5000");
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&bytes).unwrap_or(json!({}))
    };
    (status, json)
}

async fn send_text(app: &Router, uri: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("host", "localhost:5000")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

#[tokio::test]
async fn routes_reject_missing_or_wrong_tokens() {
    let app = test_app();

    let (status, _) = send(&app, Method::GET, "/api/streams", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, Method::GET, "/playlist.m3u?token=wrong", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, Method::GET, "/stream/1", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // All three token carriers are accepted
    let (status, _) = send(&app, Method::GET, "/api/streams?token=sekrit", None).await;
    assert_eq!(status, StatusCode::OK);

    let request = Request::builder()
        .uri("/api/streams")
        .header("host", "localhost:5000")
        .header("authorization", "Bearer sekrit")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        app.clone().oneshot(request).await.unwrap().status(),
        StatusCode::OK
    );

    let request = Request::builder()
        .uri("/api/streams")
        .header("host", "localhost:5000")
        .header("x-amps-token", "sekrit")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        app.clone().oneshot(request).await.unwrap().status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn metrics_is_open_without_a_token() {
    let app = test_app();
    let (status, body) = send(&app, Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stream_count"], 3);
    assert_eq!(body["live_transcoders"], 0);
    assert!(body.get("uptime_seconds").is_some());
}

#[tokio::test]
async fn config_channels_appear_in_api_order() {
    let app = test_app();
    let (status, body) = send(&app, Method::GET, "/api/streams?token=sekrit", None).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["News", "Sports", "Variants"]);
}

#[tokio::test]
async fn crud_round_trip_preserves_the_body() {
    let app = test_app();
    let new_stream = json!({
        "id": 42,
        "name": "Added",
        "source": "http://upstream/added.ts",
        "ffmpeg_profile": "copy",
        "group": "Misc",
        "my_custom_tag": "kept"
    });

    let (status, created) = send(
        &app,
        Method::POST,
        "/api/streams?token=sekrit",
        Some(new_stream.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["id"], 42);
    assert_eq!(created["my_custom_tag"], "kept");

    let (status, fetched) = send(&app, Method::GET, "/api/streams/42?token=sekrit", None).await;
    assert_eq!(status, StatusCode::OK);
    for key in ["id", "name", "source", "ffmpeg_profile", "group", "my_custom_tag"] {
        assert_eq!(fetched[key], new_stream[key], "field {key} must round-trip");
    }

    // Duplicate id is a conflict
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/streams?token=sekrit",
        Some(new_stream),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Replace requires the body id to match the url id
    let (status, _) = send(
        &app,
        Method::PUT,
        "/api/streams/42?token=sekrit",
        Some(json!({"id": 43, "name": "X", "source": "http://u/x", "ffmpeg_profile": "copy"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, replaced) = send(
        &app,
        Method::PUT,
        "/api/streams/42?token=sekrit",
        Some(json!({"id": 42, "name": "Replaced", "source": "http://u/x", "ffmpeg_profile": "copy"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replaced["name"], "Replaced");

    let (status, _) = send(&app, Method::DELETE, "/api/streams/42?token=sekrit", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, Method::GET, "/api/streams/42?token=sekrit", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn crud_validates_bodies() {
    let app = test_app();

    // Unknown profile reference
    let (status, body) = send(
        &app,
        Method::POST,
        "/api/streams?token=sekrit",
        Some(json!({"id": 50, "name": "Bad", "source": "http://u/b", "ffmpeg_profile": "nope"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("nope"));

    // Neither profile nor custom command
    let (status, _) = send(
        &app,
        Method::POST,
        "/api/streams?token=sekrit",
        Some(json!({"id": 51, "name": "Bad", "source": "http://u/b"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Malformed JSON body
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/streams?token=sekrit")
        .header("host", "localhost:5000")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn programs_round_trip_in_order() {
    let app = test_app();
    let programs = json!([
        {"title": "Late Show", "start": "2030-05-01T22:00:00Z"},
        {"title": "Early Show"}
    ]);

    let (status, stored) = send(
        &app,
        Method::PUT,
        "/api/streams/1/programs?token=sekrit",
        Some(programs.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored.as_array().unwrap().len(), 2);

    let (status, fetched) = send(
        &app,
        Method::GET,
        "/api/streams/1/programs?token=sekrit",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched[0]["title"], "Late Show");
    assert_eq!(fetched[1]["title"], "Early Show");

    // A title is mandatory
    let (status, _) = send(
        &app,
        Method::PUT,
        "/api/streams/1/programs?token=sekrit",
        Some(json!([{"title": ""}])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        Method::GET,
        "/api/streams/999/programs?token=sekrit",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn playlist_renders_and_filters() {
    let app = test_app();

    let (status, body) = send_text(&app, "/playlist.m3u?token=sekrit&region=US").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("#EXTM3U"));
    assert!(body.contains("News"));
    assert!(body.contains("Sports"));
    assert!(body.contains("#EXTREM:AMP-VARIANT low|Low bitrate"));
    assert!(body.contains("token=sekrit"));

    // Region-locked channels drop out without a matching region
    let (_, body) = send_text(&app, "/playlist.m3u?token=sekrit").await;
    assert!(!body.contains("Sports"));

    // Case-insensitive region codes
    let (_, body) = send_text(&app, "/playlist.m3u?token=sekrit&region=us").await;
    assert!(body.contains("Sports"));

    let (_, body) = send_text(&app, "/playlist.m3u?token=sekrit&group=news").await;
    assert!(body.contains("News"));
    assert!(!body.contains("Variants"));

    let (_, body) = send_text(&app, "/playlist.m3u?token=sekrit&ids=3").await;
    assert!(!body.contains("News"));
    assert!(body.contains("Variants"));

    let (_, body) = send_text(&app, "/playlist.m3u?token=sekrit&variants=false").await;
    assert!(!body.contains("AMP-VARIANT"));
}

#[tokio::test]
async fn stream_route_checks_before_spawning() {
    let app = test_app();

    let (status, _) = send(&app, Method::GET, "/stream/999?token=sekrit", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Region lock: wrong region 403, missing region 403 for allow-listed
    let (status, _) = send(&app, Method::GET, "/stream/2?token=sekrit&region=GB", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&app, Method::GET, "/stream/2?token=sekrit", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Region via header works too
    let request = Request::builder()
        .uri("/stream/2?token=sekrit")
        .header("host", "localhost:5000")
        .header("CF-IPCountry", "GB")
        .body(Body::empty())
        .unwrap();
    assert_eq!(
        app.clone().oneshot(request).await.unwrap().status(),
        StatusCode::FORBIDDEN
    );

    let (status, _) = send(
        &app,
        Method::GET,
        "/stream/1?token=sekrit&variant=missing",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn epg_endpoints_render_the_snapshot() {
    let app = test_app();

    let (status, xml) = send_text(&app, "/epg.xml?token=sekrit").await;
    assert_eq!(status, StatusCode::OK);
    assert!(xml.contains("<tv "));
    assert!(xml.contains("<channel id=\"1\">"));
    assert!(xml.contains("<display-name>News</display-name>"));
    assert!(xml.contains("20300501180000 +0000"));

    let (status, body) = send(&app, Method::GET, "/api/epg?token=sekrit", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 3);
    assert_eq!(body[0]["programs"][0]["title"], "Evening Bulletin");
}

#[tokio::test]
async fn tuners_listing_is_empty_without_live_streams() {
    let app = test_app();
    let (status, body) = send(&app, Method::GET, "/api/tuners?token=sekrit", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tuners"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn segment_routes_refuse_traversal() {
    let app = test_app();
    let (status, _) = send(
        &app,
        Method::GET,
        "/hls/1/..%2Fsecret?token=sekrit",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deleting_a_channel_removes_it_from_the_playlist() {
    let app = test_app();
    let (_, before) = send_text(&app, "/playlist.m3u?token=sekrit&region=US").await;
    assert!(before.contains("News"));

    let (status, _) = send(&app, Method::DELETE, "/api/streams/1?token=sekrit", None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, after) = send_text(&app, "/playlist.m3u?token=sekrit&region=US").await;
    assert!(!after.contains("News"));
    let (status, _) = send(&app, Method::GET, "/stream/1?token=sekrit", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
