use figma_vrt::api::FigmaClient;
use figma_vrt::config::AppConfig;
use figma_vrt::internal::capture::PageCapturer;
use figma_vrt::internal::compare::encode;
use figma_vrt::internal::fetcher::{FetchOptions, fetch_references};
use figma_vrt::internal::models::{Frame, Viewport};
use figma_vrt::internal::pipeline::{Pipeline, RunMode, RunOptions, Step, StepStatus, Stores};
use figma_vrt::internal::store::{FsStore, ImageStore};
use image::{Rgba, RgbaImage};

fn solid_png(width: u32, height: u32) -> Vec<u8> {
    encode(&RgbaImage::from_pixel(width, height, Rgba([20, 40, 60, 255]))).unwrap()
}

fn images_body(server_url: &str) -> String {
    format!(r#"{{"err": null, "images": {{"1-591": "{server_url}/render/home.png"}}}}"#)
}

#[test]
fn test_integration_fetch_into_directory_store() {
    let mut server = mockito::Server::new();
    let body = images_body(&server.url());
    let images = server
        .mock("GET", "/images/FILE")
        .match_query(mockito::Matcher::Any)
        .match_header("X-Figma-Token", "secret")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(body)
        .expect(1)
        .create();
    let render = server
        .mock("GET", "/render/home.png")
        .with_status(200)
        .with_body(solid_png(8, 8))
        .expect(1)
        .create();

    let dir = tempfile::tempdir().unwrap();
    let store = FsStore::new(dir.path().join("baselines"));
    let client = FigmaClient::with_base_url("secret", server.url()).unwrap();
    let frames = vec![Frame::new("1-591", "home", Viewport::new(8.0, 8.0))];
    let options = FetchOptions {
        force_refresh: false,
        download_retries: 0,
    };

    let first = fetch_references(Some(&client), "FILE", &frames, &store, options).unwrap();
    assert_eq!(first.fetched, vec!["home"]);
    assert!(store.path_for("home").is_file());
    assert_eq!(store.get("home").unwrap(), solid_png(8, 8));

    // second run is served from disk
    let second = fetch_references(Some(&client), "FILE", &frames, &store, options).unwrap();
    assert!(second.fetched.is_empty());
    assert_eq!(second.cached, vec!["home"]);

    images.assert();
    render.assert();
}

struct SolidCapturer;

impl PageCapturer for SolidCapturer {
    fn capture(&self, _url: &str, viewport: &Viewport) -> anyhow::Result<Vec<u8>> {
        let (width, height) = viewport.pixel_size();
        Ok(solid_png(width, height))
    }
}

#[test]
fn test_integration_full_run_writes_diff_and_report() {
    let mut server = mockito::Server::new();
    let body = images_body(&server.url());
    let _images = server
        .mock("GET", "/images/FILE")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_body(body)
        .create();
    let _render = server
        .mock("GET", "/render/home.png")
        .with_status(200)
        .with_body(solid_png(8, 8))
        .create();

    let dir = tempfile::tempdir().unwrap();
    let path = |name: &str| dir.path().join(name).display().to_string();
    let config = AppConfig {
        file_key: "FILE".to_string(),
        frames: vec![Frame::new("1-591", "home", Viewport::new(8.0, 8.0))],
        baseline_dir: path("baselines"),
        screenshot_dir: path("screenshots"),
        diff_dir: path("diff"),
        report_path: Some(path("report.json")),
        ..AppConfig::default()
    };
    let stores = Stores::from_config(&config);
    let client = FigmaClient::with_base_url("secret", server.url()).unwrap();

    let mut pipeline = Pipeline::new(
        config,
        RunOptions {
            mode: RunMode::All,
            force_refresh: false,
        },
        stores,
        Some(client),
        Box::new(|_: &figma_vrt::config::CaptureSettings| -> anyhow::Result<Box<dyn PageCapturer>> {
            Ok(Box::new(SolidCapturer))
        }),
    );
    let report = pipeline.run().unwrap();

    assert_eq!(report.step(Step::Fetch).unwrap().status, StepStatus::Ok);
    assert_eq!(report.step(Step::Capture).unwrap().status, StepStatus::Ok);
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].match_percentage, 100.0);
    assert_eq!(report.results[0].total_pixels, 64);
    assert_eq!(report.average_match, Some(100.0));
    assert_eq!(report.exit_code(), 0);

    assert!(dir.path().join("screenshots").join("home.png").is_file());
    assert!(dir.path().join("diff").join("diff-home.png").is_file());

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("report.json")).unwrap())
            .unwrap();
    assert_eq!(json["results"][0]["name"], "home");
    assert_eq!(json["average_match"], 100.0);
}

#[test]
fn test_integration_forbidden_token_reports_failed_fetch() {
    let mut server = mockito::Server::new();
    let _images = server
        .mock("GET", "/images/FILE")
        .match_query(mockito::Matcher::Any)
        .with_status(403)
        .create();

    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        file_key: "FILE".to_string(),
        baseline_dir: dir.path().join("baselines").display().to_string(),
        ..AppConfig::default()
    };
    let stores = Stores::from_config(&config);
    let client = FigmaClient::with_base_url("bad-token", server.url()).unwrap();

    let mut pipeline = Pipeline::new(
        config,
        RunOptions {
            mode: RunMode::FetchOnly,
            force_refresh: false,
        },
        stores,
        Some(client),
        figma_vrt::internal::pipeline::chrome_launcher(),
    );
    let report = pipeline.run().unwrap();

    let fetch = report.step(Step::Fetch).unwrap();
    assert_eq!(fetch.status, StepStatus::Failed);
    assert!(fetch.detail.contains("--skip-fetch"));
    assert!(fetch.detail.contains("homepage-desktop.png"));
    assert_eq!(report.exit_code(), 1);
}
