mod common;

use anyhow::Result;
use std::time::Duration;

use common::{png_bytes, unused_url, Reply, StubServer, DEER_BODY};
use wildsnap::{
    map_detections, DetectError, DetectionSettings, DetectorBackend, DisplayRect, HttpBackend,
    ImageSource, ModelSelector, Transport,
};

fn still_frame(width: u32, height: u32) -> Result<wildsnap::EncodedFrame> {
    let mut source = ImageSource::new();
    let loaded = source.load_bytes(png_bytes(width, height)?, "test.png")?;
    Ok(loaded.encoded.clone())
}

fn backend(url: &str, transport: Transport) -> HttpBackend {
    HttpBackend::new(url, transport, Duration::from_secs(5))
}

#[test]
fn json_detection_maps_boxes_into_display_rect() -> Result<()> {
    let server = StubServer::replying(Reply::json(200, DEER_BODY))?;
    let frame = still_frame(100, 100)?;
    let settings = DetectionSettings::default();

    let results = backend(&server.url(), Transport::Json).detect(&frame, &settings)?;
    let yolo = results.get("yolov8n").expect("yolov8n result");
    assert_eq!(yolo.object_count, 1);
    assert_eq!(yolo.detections[0].class_name, "deer");

    let mapping = map_detections(100, 100, DisplayRect::new(200.0, 200.0), &yolo.detections)
        .expect("drawable mapping");
    assert_eq!(mapping.detections[0].bbox, [20.0, 20.0, 100.0, 100.0]);
    assert_eq!(mapping.detections[0].label(), "deer 91.0%");

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.method, "POST");
    assert_eq!(request.path, "/api/detect");
    assert_eq!(request.header("content-type"), Some("application/json"));
    let body = request.json()?;
    assert_eq!(body["model"], "yolov8n");
    assert_eq!(body["confidence"], 0.4);
    assert_eq!(body["iou"], 0.5);
    assert_eq!(body["filter_animals"], true);
    let image = body["image"].as_str().unwrap_or_default();
    assert!(image.starts_with("data:image/png;base64,"), "image: {}", &image[..image.len().min(40)]);
    Ok(())
}

#[test]
fn request_carries_current_settings() -> Result<()> {
    let server = StubServer::replying(Reply::json(200, r#"{"success":true,"results":{}}"#))?;
    let frame = still_frame(32, 32)?;
    let settings = DetectionSettings {
        model: ModelSelector::Compare,
        confidence: 0.25,
        iou: 0.7,
        filter_animals: false,
    };

    let results = backend(&server.url(), Transport::Json).detect(&frame, &settings)?;
    assert!(results.is_empty());

    let body = server.requests()[0].json()?;
    assert_eq!(body["model"], "compare");
    assert_eq!(body["confidence"], 0.25);
    assert_eq!(body["iou"], 0.7);
    assert_eq!(body["filter_animals"], false);
    Ok(())
}

#[test]
fn multipart_transport_posts_file_form() -> Result<()> {
    let server = StubServer::replying(Reply::json(200, DEER_BODY))?;
    let frame = still_frame(64, 48)?;

    let results = backend(&server.url(), Transport::Multipart)
        .detect(&frame, &DetectionSettings::default())?;
    assert_eq!(results.len(), 1);

    let request = &server.requests()[0];
    assert_eq!(request.path, "/api/detect-file");
    let content_type = request.header("content-type").unwrap_or_default();
    assert!(content_type.starts_with("multipart/form-data; boundary="));
    let body = String::from_utf8_lossy(&request.body);
    for field in ["model", "confidence", "iou", "filter_animals", "file"] {
        assert!(
            body.contains(&format!("name=\"{}\"", field)),
            "missing form field {}",
            field
        );
    }
    Ok(())
}

#[test]
fn backend_error_message_comes_from_body() -> Result<()> {
    let server = StubServer::replying(Reply::json(500, r#"{"error":"model not found"}"#))?;
    let frame = still_frame(16, 16)?;

    let err = backend(&server.url(), Transport::Json)
        .detect(&frame, &DetectionSettings::default())
        .unwrap_err();
    assert_eq!(err.backend_status(), Some(500));
    assert_eq!(err.to_string(), "model not found");
    Ok(())
}

#[test]
fn backend_error_without_message_uses_status_text() -> Result<()> {
    let server = StubServer::replying(Reply::json(500, "oops"))?;
    let frame = still_frame(16, 16)?;

    let err = backend(&server.url(), Transport::Json)
        .detect(&frame, &DetectionSettings::default())
        .unwrap_err();
    assert_eq!(
        err,
        DetectError::Backend {
            status: 500,
            message: "API Error: Internal Server Error".to_string(),
        }
    );
    Ok(())
}

#[test]
fn malformed_success_body_is_a_parse_error() -> Result<()> {
    let frame = still_frame(16, 16)?;
    for body in ["not json", r#"{"success": true}"#] {
        let server = StubServer::replying(Reply::json(200, body))?;
        let err = backend(&server.url(), Transport::Json)
            .detect(&frame, &DetectionSettings::default())
            .unwrap_err();
        assert!(matches!(err, DetectError::Parse(_)), "{:?} for {}", err, body);
    }
    Ok(())
}

#[test]
fn unreachable_backend_is_a_transport_error() -> Result<()> {
    let url = unused_url()?;
    let frame = still_frame(16, 16)?;

    let client = backend(&url, Transport::Json);
    let err = client
        .detect(&frame, &DetectionSettings::default())
        .unwrap_err();
    assert!(matches!(err, DetectError::Transport { .. }), "{:?}", err);

    let message = err.user_message(client.endpoint());
    assert!(message.starts_with("Failed to connect to the backend."));
    assert!(message.contains(&url));
    Ok(())
}

#[test]
fn slow_backend_times_out() -> Result<()> {
    let server =
        StubServer::replying(Reply::json(200, DEER_BODY).delayed(Duration::from_millis(1500)))?;
    let frame = still_frame(16, 16)?;

    let client = HttpBackend::new(&server.url(), Transport::Json, Duration::from_millis(200));
    let err = client
        .detect(&frame, &DetectionSettings::default())
        .unwrap_err();
    assert!(matches!(err, DetectError::Transport { .. }), "{:?}", err);
    Ok(())
}

#[test]
fn health_and_model_catalog() -> Result<()> {
    let server = StubServer::start(|request| match request.path.as_str() {
        "/api/health" => Reply::json(
            200,
            r#"{"status":"healthy","models_loaded":{"yolov8n":true,"best":false}}"#,
        ),
        "/api/models" => Reply::json(
            200,
            r#"{"models":{"yolov8n":{"available":true,"type":"general","description":"COCO"}}}"#,
        ),
        _ => Reply::json(404, r#"{"error":"not found"}"#),
    })?;
    let client = backend(&server.url(), Transport::Json);

    let health = client.health()?;
    assert_eq!(health.status, "healthy");
    assert_eq!(health.models_loaded.get("yolov8n"), Some(&true));
    assert_eq!(health.models_loaded.get("best"), Some(&false));

    let catalog = client.models()?;
    let info = catalog.models.get("yolov8n").expect("yolov8n listed");
    assert!(info.available);
    assert_eq!(info.kind, "general");

    let methods: Vec<_> = server.requests().iter().map(|r| r.method.clone()).collect();
    assert_eq!(methods, vec!["GET", "GET"]);
    Ok(())
}
