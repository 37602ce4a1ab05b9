use actix_cors::Cors;
use actix_multipart::Multipart;
use actix_web::{middleware::Logger, web, App, HttpResponse, HttpServer, Result};
use base64::{engine::general_purpose, Engine as _};
use futures_util::TryStreamExt;
use image_batch_converter::{
    BatchOptions, BatchOutcome, FailureReport, FormatCatalog, ImagesConverter, InputFile, ParameterOverrides,
    ServiceConfig,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

const FILE_FIELDS: [&str; 4] = ["files", "files[]", "arquivos", "arquivos[]"];
const JSON_LIMIT: usize = 256 * 1024 * 1024;

struct AppState {
    config: ServiceConfig,
    catalog: FormatCatalog,
}

type SharedState = web::Data<AppState>;

#[derive(Debug, Serialize)]
struct ConvertResponse {
    ok: bool,
    archive_name: Option<String>,
    download_url: Option<String>,
    converted: usize,
    fallback_count: usize,
    errors: Vec<FailureReport>,
}

impl ConvertResponse {
    fn from_outcome(job: &str, outcome: &BatchOutcome) -> Self {
        let archive_name = outcome
            .archive_path
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned());
        let mut errors = outcome.failure_reports();
        if !outcome.succeeded && errors.is_empty() {
            errors.push(FailureReport {
                source: String::new(),
                reason: "conversion failed".to_string(),
            });
        }
        Self {
            ok: outcome.succeeded,
            download_url: archive_name.as_ref().map(|name| format!("/download/{job}/{name}")),
            archive_name,
            converted: outcome.converted_count,
            fallback_count: outcome.fallback_count,
            errors,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            archive_name: None,
            download_url: None,
            converted: 0,
            fallback_count: 0,
            errors: vec![FailureReport {
                source: String::new(),
                reason: reason.into(),
            }],
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonFile {
    name: String,
    /// Base64 file content.
    content: String,
}

#[derive(Debug, Deserialize)]
struct JsonConvertRequest {
    files: Vec<JsonFile>,
    #[serde(alias = "format")]
    out_ext: String,
    #[serde(default)]
    archive_name: Option<String>,
    #[serde(flatten)]
    params: ParameterOverrides,
}

fn bad_request(reason: impl Into<String>) -> HttpResponse {
    HttpResponse::BadRequest().json(ConvertResponse::rejected(reason))
}

async fn health(state: SharedState) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "image-batch-converter",
        "version": env!("CARGO_PKG_VERSION"),
        "output_formats": state.catalog.extensions().collect::<Vec<_>>(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn formats(state: SharedState) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.catalog.entries()))
}

async fn convert_multipart(mut payload: Multipart, state: SharedState) -> Result<HttpResponse> {
    let mut files = Vec::new();
    let mut out_ext = None;
    let mut archive_name = None;
    let mut overrides = ParameterOverrides::default();

    while let Some(mut field) = payload.try_next().await? {
        let disposition = field.content_disposition().clone();
        let name = disposition.get_name().unwrap_or_default().to_string();
        let mut data = Vec::new();
        while let Some(chunk) = field.try_next().await? {
            data.extend_from_slice(&chunk);
        }

        if FILE_FIELDS.contains(&name.as_str()) {
            match disposition.get_filename() {
                Some(filename) if !filename.is_empty() => files.push(InputFile::from_bytes(filename, data)),
                _ => log::debug!("Ignoring file field without a filename"),
            }
            continue;
        }

        let value = String::from_utf8_lossy(&data);
        match name.as_str() {
            "out_ext" | "format" => out_ext = Some(value.trim().to_string()),
            "archive_name" => archive_name = Some(value.trim().to_string()),
            other => match overrides.set_field(other, &value) {
                Ok(true) => {}
                Ok(false) => log::debug!("Ignoring form field {}", other),
                Err(e) => return Ok(bad_request(e.to_string())),
            },
        }
    }

    run_batch(state, files, out_ext, overrides, archive_name).await
}

async fn convert_json(req: web::Json<JsonConvertRequest>, state: SharedState) -> Result<HttpResponse> {
    let req = req.into_inner();
    let mut files = Vec::with_capacity(req.files.len());
    for file in req.files {
        match general_purpose::STANDARD.decode(file.content.as_bytes()) {
            Ok(content) => files.push(InputFile::from_bytes(file.name, content)),
            Err(e) => return Ok(bad_request(format!("{}: invalid base64 content: {}", file.name, e))),
        }
    }
    run_batch(state, files, Some(req.out_ext), req.params, req.archive_name).await
}

async fn run_batch(
    state: SharedState,
    files: Vec<InputFile>,
    out_ext: Option<String>,
    overrides: ParameterOverrides,
    archive_name: Option<String>,
) -> Result<HttpResponse> {
    let Some(out_ext) = out_ext.filter(|ext| !ext.trim().is_empty()) else {
        return Ok(bad_request("missing output format (out_ext)"));
    };
    let params = match state.config.encode_parameters(&state.catalog, &out_ext, &overrides) {
        Ok(params) => params,
        Err(e) => return Ok(bad_request(e.to_string())),
    };

    let job = Uuid::new_v4().to_string();
    let job_dir = state.config.work_dir.join(&job);
    let options = BatchOptions {
        archive_name,
        keep_outputs: state.config.keep_outputs,
        workers: state.config.workers,
        cancellation: None,
    };
    log::info!("🚀 Job {}: {} files to {}", job, files.len(), out_ext);

    let catalog = state.catalog;
    let job_id = job.clone();
    let outcome = web::block(move || {
        let converter = ImagesConverter::with_catalog(params, catalog);
        let progress = |percent: u8, label: &str| log::debug!("[{}] {}% {}", job_id, percent, label);
        converter.convert_batch(files, &out_ext, &job_dir, &options, &progress)
    })
    .await?;

    let response = ConvertResponse::from_outcome(&job, &outcome);
    if outcome.succeeded {
        log::info!(
            "✅ Job {}: {} converted, {} via fallback, {} failed",
            job,
            response.converted,
            response.fallback_count,
            response.errors.len()
        );
        Ok(HttpResponse::Ok().json(response))
    } else {
        log::warn!("❌ Job {} failed: {} errors", job, response.errors.len());
        Ok(HttpResponse::BadRequest().json(response))
    }
}

fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty() && segment != "." && segment != ".." && !segment.contains(['/', '\\'])
}

async fn download_archive(path: web::Path<(String, String)>, state: SharedState) -> Result<HttpResponse> {
    let (job, archive) = path.into_inner();
    log::info!("📥 Download requested: {}/{}", job, archive);
    if !is_safe_segment(&job) || !is_safe_segment(&archive) || !archive.ends_with(".zip") {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({ "error": "invalid archive path" })));
    }

    let file: PathBuf = state.config.work_dir.join(&job).join(&archive);
    match tokio::fs::read(&file).await {
        Ok(content) => Ok(HttpResponse::Ok()
            .content_type("application/zip")
            .append_header(("Content-Disposition", format!("attachment; filename=\"{archive}\"")))
            .append_header(("Cache-Control", "no-cache"))
            .body(content)),
        Err(e) => {
            log::warn!("Archive {} not served: {}", file.display(), e);
            Ok(HttpResponse::NotFound().json(serde_json::json!({
                "error": "Archive not found",
                "job": job,
                "archive": archive
            })))
        }
    }
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().limit(JSON_LIMIT))
        .route("/health", web::get().to(health))
        .route("/formats", web::get().to(formats))
        .route("/convert", web::post().to(convert_multipart))
        .route("/convert/json", web::post().to(convert_json))
        .route("/download/{job}/{archive}", web::get().to(download_archive));
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = ServiceConfig::from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    std::fs::create_dir_all(&config.work_dir)?;
    let catalog = FormatCatalog::standard();

    log::info!("🦀 Starting Image Batch Converter Service");
    log::info!("📍 Listening on {}:{}", config.bind, config.port);
    log::info!("📂 Work directory: {}", config.work_dir.display());
    log::info!("📤 Output formats: {}", catalog.extensions().collect::<Vec<_>>().join(", "));

    let bind = (config.bind.clone(), config.port);
    let state = web::Data::new(AppState { config, catalog });

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(state.clone())
            .wrap(Logger::default())
            .wrap(cors)
            .configure(routes)
    })
    .bind(bind)?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn state(dir: &TempDir) -> SharedState {
        web::Data::new(AppState {
            config: ServiceConfig {
                work_dir: dir.path().to_path_buf(),
                ..ServiceConfig::default()
            },
            catalog: FormatCatalog::standard(),
        })
    }

    fn png() -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(12, 8, Rgb([200, 10, 10])))
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[actix_web::test]
    async fn health_lists_output_formats() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(App::new().app_data(state(&dir)).configure(routes)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["status"], "healthy");
        assert!(body["output_formats"].as_array().unwrap().iter().any(|f| f == "xpm"));
    }

    #[actix_web::test]
    async fn formats_expose_the_catalog() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(App::new().app_data(state(&dir)).configure(routes)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/formats").to_request()).await;
        let body: serde_json::Value = test::read_body_json(resp).await;
        let entries = body.as_array().unwrap();
        assert_eq!(entries.len(), 21);
        assert!(entries.iter().any(|e| e["extension"] == "jpg" && e["encoder"] == "JPEG"));
    }

    #[actix_web::test]
    async fn json_conversion_can_be_downloaded() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(App::new().app_data(state(&dir)).configure(routes)).await;
        let req = test::TestRequest::post()
            .uri("/convert/json")
            .set_json(serde_json::json!({
                "out_ext": "webp",
                "webp_quality": 70,
                "brand_tag": "Demo",
                "files": [{ "name": "red.png", "content": general_purpose::STANDARD.encode(png()) }]
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["converted"], 1);
        assert_eq!(body["fallback_count"], 0);
        assert!(body["archive_name"].as_str().unwrap().starts_with("images-webp-demo-"));

        let url = body["download_url"].as_str().unwrap().to_string();
        let resp = test::call_service(&app, test::TestRequest::get().uri(&url).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = test::read_body(resp).await;
        assert!(bytes.starts_with(b"PK"));
    }

    #[actix_web::test]
    async fn unreadable_upload_is_a_bad_request() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(App::new().app_data(state(&dir)).configure(routes)).await;
        let req = test::TestRequest::post()
            .uri("/convert/json")
            .set_json(serde_json::json!({
                "format": "png",
                "files": [{ "name": "broken.dat", "content": general_purpose::STANDARD.encode(b"nope") }]
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["errors"][0]["source"], "broken.dat");
        assert_eq!(body["errors"][0]["reason"], "unrecognized file");
        assert!(body["download_url"].is_null());
    }

    #[actix_web::test]
    async fn multipart_upload_converts_files() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(App::new().app_data(state(&dir)).configure(routes)).await;

        let boundary = "converter-test-boundary";
        let mut body = Vec::new();
        for (name, value) in [("out_ext", "bmp"), ("name_style", "prefix"), ("brand_tag", "shop")] {
            body.extend_from_slice(
                format!("--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"arquivos\"; filename=\"photo.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(&png());
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let req = test::TestRequest::post()
            .uri("/convert")
            .insert_header(("content-type", format!("multipart/form-data; boundary={boundary}")))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["converted"], 1);
        assert!(body["archive_name"].as_str().unwrap().starts_with("images-bmp-shop-"));
    }

    #[actix_web::test]
    async fn missing_format_and_bad_parameters_are_rejected() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(App::new().app_data(state(&dir)).configure(routes)).await;
        let req = test::TestRequest::post()
            .uri("/convert/json")
            .set_json(serde_json::json!({ "out_ext": " ", "files": [] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let req = test::TestRequest::post()
            .uri("/convert/json")
            .set_json(serde_json::json!({ "out_ext": "jpg", "background_hex": "zzz", "files": [] }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert!(body["errors"][0]["reason"].as_str().unwrap().contains("invalid color"));
    }

    #[actix_web::test]
    async fn download_rejects_unsafe_names() {
        let dir = TempDir::new().unwrap();
        let app = test::init_service(App::new().app_data(state(&dir)).configure(routes)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/download/job/secret.txt").to_request()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = test::call_service(&app, test::TestRequest::get().uri("/download/job/none.zip").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
