use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use wildsnap::config::WildsnapConfig;
use wildsnap::{ModelSelector, Transport};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in ["WILDSNAP_CONFIG", "WILDSNAP_BACKEND_URL"] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "backend": {
            "url": "http://detector.local:5000",
            "transport": "multipart",
            "timeout_ms": 5000
        },
        "detection": {
            "model": "compare",
            "confidence": 0.3,
            "iou": 0.6,
            "filter_animals": false
        },
        "polling": { "interval_ms": 250 },
        "overlay": { "font_size": 18.0, "stroke_width": 2 },
        "webcam": { "device": "stub://cam", "width": 640, "height": 480, "fps": 15 },
        "video": { "target_fps": 24 }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("WILDSNAP_CONFIG", file.path());
    std::env::set_var("WILDSNAP_BACKEND_URL", "https://detector.example.org");

    let cfg = WildsnapConfig::load().expect("load config");
    assert_eq!(cfg.backend.url, "https://detector.example.org");
    assert_eq!(cfg.backend.transport, Transport::Multipart);
    assert_eq!(cfg.backend.timeout, Duration::from_secs(5));
    assert_eq!(cfg.detection.model, ModelSelector::Compare);
    assert_eq!(cfg.detection.confidence, 0.3);
    assert_eq!(cfg.detection.iou, 0.6);
    assert!(!cfg.detection.filter_animals);
    assert_eq!(cfg.polling_interval, Duration::from_millis(250));
    assert_eq!(cfg.overlay.font_size, 18.0);
    assert_eq!(cfg.overlay.stroke_width, 2);
    assert_eq!(cfg.webcam.device, "stub://cam");
    assert_eq!((cfg.webcam.width, cfg.webcam.height), (640, 480));
    assert_eq!(cfg.webcam.target_fps, 15);
    assert_eq!(cfg.video.target_fps, 24);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = r#"
[backend]
url = "http://10.0.0.5:5000"

[detection]
model = "best"
confidence = 0.55
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = WildsnapConfig::load_from(Some(file.path())).expect("load config");
    assert_eq!(cfg.backend.url, "http://10.0.0.5:5000");
    assert_eq!(cfg.backend.transport, Transport::Json);
    assert_eq!(cfg.detection.model, ModelSelector::Best);
    assert_eq!(cfg.detection.confidence, 0.55);
    assert_eq!(cfg.detection.iou, 0.5);
    assert!(cfg.detection.filter_animals);
}

#[test]
fn rejects_out_of_range_thresholds() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"detection": {"confidence": 1.2}}"#)
        .expect("write config");

    let err = WildsnapConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("confidence"), "{}", err);
}

#[test]
fn rejects_unknown_model() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{"detection": {"model": "resnet"}}"#)
        .expect("write config");

    assert!(WildsnapConfig::load_from(Some(file.path())).is_err());
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = WildsnapConfig::load_from(Some(std::path::Path::new("/nonexistent/wildsnap.json")))
        .unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));
}
