//! HTTP-level tests driving the full router with `tower::ServiceExt::oneshot`.
//!
//! Each test builds its own gateway over a temp directory mounted as
//! `/files/` and a read-only in-memory mount at `/scratch/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use tempfile::TempDir;
use tower::ServiceExt;

use gemdrive::auth::{Auth, CodeNotifier, Key, Permission, Privilege};
use gemdrive::config::{Config, MountConfig, MountKind};
use gemdrive::errors::WWW_AUTHENTICATE;
use gemdrive::tokens::TokenStore;
use gemdrive::AppState;

// =============================================================================
// Fixtures
// =============================================================================

#[derive(Default)]
struct CapturingNotifier {
    codes: Mutex<HashMap<String, String>>,
}

impl CapturingNotifier {
    fn code_for(&self, id: &str) -> String {
        self.codes.lock().unwrap().get(id).cloned().unwrap()
    }
}

impl CodeNotifier for CapturingNotifier {
    fn notify(&self, auth_id: &str, _key: &Key, code: &str) {
        self.codes
            .lock()
            .unwrap()
            .insert(auth_id.to_string(), code.to_string());
    }
}

struct Gateway {
    _dir: TempDir,
    files: PathBuf,
    state: Arc<AppState>,
    notifier: Arc<CapturingNotifier>,
}

impl Gateway {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let files = dir.path().join("files");
        std::fs::create_dir_all(&files).unwrap();

        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.storage.cache_dir = dir.path().join("cache");
        config.storage.mounts.push(MountConfig::local(&files));
        config.storage.mounts.push(MountConfig {
            path: None,
            name: Some("scratch".to_string()),
            kind: MountKind::Memory,
            read_only: true,
        });
        customize(&mut config);
        config.validate().unwrap();

        let backend = gemdrive::build_backend(&config).unwrap();
        let tokens = Arc::new(TokenStore::open(&config.data_dir).unwrap());
        let notifier = Arc::new(CapturingNotifier::default());
        let auth = Auth::new(tokens)
            .with_anonymous(config.auth.anonymous.clone())
            .with_notifier(notifier.clone());

        let state = Arc::new(AppState {
            config,
            backend: Arc::new(backend),
            auth: Arc::new(auth),
        });

        Gateway {
            _dir: dir,
            files,
            state,
            notifier,
        }
    }

    /// Mint a token through the engine directly.
    fn token(&self, path: &str, perm: Permission) -> String {
        let key = Key {
            id: Some("tests".to_string()),
            privileges: vec![Privilege {
                path: path.to_string(),
                perm,
            }],
        };
        let id = self.state.auth.authorize(key).unwrap();
        let code = self.notifier.code_for(&id);
        self.state.auth.complete_auth(&id, &code).unwrap()
    }

    fn write_file(&self, rel: &str, data: &[u8]) {
        let path = self.files.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    async fn send(&self, request: Request<Body>) -> Response {
        gemdrive::server::app(self.state.clone())
            .oneshot(request)
            .await
            .unwrap()
    }
}

fn get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn with_body(method: Method, uri: &str, token: &str, data: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_LENGTH, data.len())
        .body(Body::from(data))
        .unwrap()
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

fn hundred_bytes() -> Vec<u8> {
    (0u8..100).collect()
}

fn read_disk(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

// =============================================================================
// Ambient routes
// =============================================================================

#[tokio::test]
async fn test_healthz() {
    let gw = Gateway::new();
    let response = gw
        .send(Request::get("/healthz").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::SERVER).unwrap(), "gemdrive");
    assert_eq!(
        response
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .len(),
        32
    );
    assert_eq!(body_json(response).await["status"], "ok");
}

#[tokio::test]
async fn test_options_short_circuits_with_cors() {
    let gw = Gateway::new();
    let response = gw
        .send(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/files/anything.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );
    assert!(body_bytes(response).await.is_empty());
}

// =============================================================================
// Authorization
// =============================================================================

#[tokio::test]
async fn test_anonymous_rejected_with_login_page() {
    let gw = Gateway::new();
    gw.write_file("a.txt", b"secret");

    let response = gw
        .send(Request::get("/files/a.txt").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        WWW_AUTHENTICATE
    );
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .unwrap(),
        "*"
    );
    let body = String::from_utf8(body_bytes(response).await).unwrap();
    assert!(body.contains("<html"));

    let response = gw
        .send(with_body(
            Method::PUT,
            "/files/b.txt",
            "",
            b"data".to_vec(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(!gw.files.join("b.txt").exists());
}

#[tokio::test]
async fn test_missing_path_and_missing_scope_look_the_same() {
    let gw = Gateway::new();
    gw.write_file("a.txt", b"secret");
    let token = gw.token("/scratch", Permission::Read);

    let exists = gw.send(get("/files/a.txt", &token)).await;
    let missing = gw.send(get("/files/nope.txt", &token)).await;
    assert_eq!(exists.status(), StatusCode::FORBIDDEN);
    assert_eq!(missing.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_authorize_handshake_over_http() {
    let gw = Gateway::new();
    gw.write_file("docs/readme.txt", b"hello");

    let key = br#"{"id":"laptop","privileges":[{"path":"/files/docs","perm":"read"}]}"#;
    let response = gw
        .send(
            Request::post("/gemdrive/authorize")
                .body(Body::from(key.to_vec()))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let id = String::from_utf8(body_bytes(response).await).unwrap();
    let code = gw.notifier.code_for(&id);

    // A wrong code does not consume the pending authorization.
    let wrong = if code == "000000" { "111111" } else { "000000" };
    let response = gw
        .send(
            Request::get(format!("/gemdrive/authorize?id={id}&code={wrong}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = gw
        .send(
            Request::get(format!("/gemdrive/authorize?id={id}&code={code}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let token = String::from_utf8(body_bytes(response).await).unwrap();
    assert_eq!(
        cookie,
        format!("access_token={token}; HttpOnly; Max-Age=31536000; Path=/; SameSite=Lax")
    );

    // The cookie alone is enough to read inside the granted scope.
    let response = gw
        .send(
            Request::get("/files/docs/readme.txt")
                .header(header::COOKIE, format!("access_token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"hello");

    // ...and nowhere else.
    let response = gw
        .send(
            Request::get(format!("/files/other.txt?access_token={token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // The id is spent.
    let response = gw
        .send(
            Request::get(format!("/gemdrive/authorize?id={id}&code={code}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_authorize_rejects_malformed_key() {
    let gw = Gateway::new();
    let response = gw
        .send(
            Request::post("/files/gemdrive/authorize")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_anonymous_scope_from_config() {
    let gw = Gateway::with_config(|c| {
        c.auth.anonymous.push(Privilege {
            path: "/files/public".to_string(),
            perm: Permission::Read,
        });
    });
    gw.write_file("public/a.txt", b"open");
    gw.write_file("private/a.txt", b"closed");

    let response = gw
        .send(Request::get("/files/public/a.txt").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = gw
        .send(Request::get("/files/private/a.txt").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// =============================================================================
// Direct mode
// =============================================================================

#[tokio::test]
async fn test_put_then_get_round_trip() {
    let gw = Gateway::new();
    let token = gw.token("/files", Permission::Write);
    let data = hundred_bytes();

    let response = gw
        .send(with_body(
            Method::PUT,
            "/files/nested/dir/data.bin?overwrite=true",
            &token,
            data.clone(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_disk(&gw.files.join("nested/dir/data.bin")), data);

    let response = gw.send(get("/files/nested/dir/data.bin", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "100");
    assert_eq!(response.headers().get(header::ACCEPT_RANGES).unwrap(), "bytes");
    assert_eq!(body_bytes(response).await, data);
}

#[tokio::test]
async fn test_put_without_overwrite_keeps_existing() {
    let gw = Gateway::new();
    gw.write_file("a.txt", b"original");
    let token = gw.token("/files", Permission::Write);

    let response = gw
        .send(with_body(Method::PUT, "/files/a.txt", &token, b"replaced".to_vec()))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_disk(&gw.files.join("a.txt")), b"original");
}

#[tokio::test]
async fn test_put_rejects_empty_body() {
    let gw = Gateway::new();
    let token = gw.token("/files", Permission::Write);

    let response = gw
        .send(with_body(Method::PUT, "/files/empty.txt", &token, Vec::new()))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(!gw.files.join("empty.txt").exists());
}

#[tokio::test]
async fn test_put_directory_and_patch() {
    let gw = Gateway::new();
    let token = gw.token("/files", Permission::Write);

    let response = gw
        .send(with_body(Method::PUT, "/files/a/b/?recursive=true", &token, Vec::new()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(gw.files.join("a/b").is_dir());

    gw.write_file("a/b/log.txt", b"hello world");
    let response = gw
        .send(with_body(
            Method::PATCH,
            "/files/a/b/log.txt?offset=6",
            &token,
            b"there".to_vec(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_disk(&gw.files.join("a/b/log.txt")), b"hello there");

    let response = gw
        .send(with_body(
            Method::PATCH,
            "/files/a/b/log.txt?offset=abc",
            &token,
            b"x".to_vec(),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_read_token_cannot_write() {
    let gw = Gateway::new();
    let token = gw.token("/files", Permission::Read);

    let response = gw
        .send(with_body(Method::PUT, "/files/a.txt", &token, b"x".to_vec()))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_write_to_read_only_mount_is_unsupported() {
    let gw = Gateway::new();
    let token = gw.token("/", Permission::Write);

    let response = gw
        .send(with_body(Method::PUT, "/scratch/a.txt", &token, b"x".to_vec()))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_range_requests() {
    let gw = Gateway::new();
    let data = hundred_bytes();
    gw.write_file("data.bin", &data);
    let token = gw.token("/files", Permission::Read);

    let mut request = get("/files/data.bin", &token);
    request
        .headers_mut()
        .insert(header::RANGE, "bytes=10-19".parse().unwrap());
    let response = gw.send(request).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 10-19/100"
    );
    assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "10");
    assert_eq!(body_bytes(response).await, &data[10..20]);

    let mut request = get("/files/data.bin", &token);
    request
        .headers_mut()
        .insert(header::RANGE, "bytes=90-".parse().unwrap());
    let response = gw.send(request).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        response.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes 90-99/100"
    );
    assert_eq!(body_bytes(response).await, &data[90..]);

    let mut request = get("/files/data.bin", &token);
    request
        .headers_mut()
        .insert(header::RANGE, "bytes=200-".parse().unwrap());
    let response = gw.send(request).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        response.headers().get(header::CONTENT_RANGE).unwrap(),
        "bytes */100"
    );

    let mut request = get("/files/data.bin", &token);
    request
        .headers_mut()
        .insert(header::RANGE, "bytes=abc".parse().unwrap());
    let response = gw.send(request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_head_reports_size() {
    let gw = Gateway::new();
    gw.write_file("notes.txt", b"0123456789");
    let token = gw.token("/files", Permission::Read);

    let response = gw
        .send(
            Request::head("/files/notes.txt")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "10");
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "text/plain");

    let response = gw
        .send(
            Request::head("/files/missing.txt")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_directory_get_serves_index_only() {
    let gw = Gateway::new();
    gw.write_file("site/index.html", b"<h1>hi</h1>");
    gw.write_file("bare/a.txt", b"a");
    let token = gw.token("/files", Permission::Read);

    let response = gw.send(get("/files/site/", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"<h1>hi</h1>");

    let response = gw.send(get("/files/bare/", &token)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_download_flag_sets_attachment() {
    let gw = Gateway::new();
    gw.write_file("a.txt", b"a");
    let token = gw.token("/files", Permission::Read);

    let response = gw.send(get("/files/a.txt?download=true", &token)).await;
    assert_eq!(
        response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        "attachment"
    );
}

#[tokio::test]
async fn test_delete_non_recursive_on_non_empty_dir() {
    let gw = Gateway::new();
    gw.write_file("dir/a.txt", b"keep me");
    let token = gw.token("/files", Permission::Write);

    let delete = |uri: &str| {
        Request::delete(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    };

    let response = gw.send(delete("/files/dir/")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(read_disk(&gw.files.join("dir/a.txt")), b"keep me");

    let response = gw.send(delete("/files/dir/?recursive=true")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!gw.files.join("dir").exists());
}

#[tokio::test]
async fn test_unregistered_mount_is_not_found() {
    let gw = Gateway::new();
    // A same-named directory deeper inside a real mount must not matter.
    gw.write_file("archive/a.txt", b"a");
    let token = gw.token("/", Permission::Read);

    let response = gw.send(get("/archive/a.txt", &token)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unsupported_method() {
    let gw = Gateway::new();
    let token = gw.token("/", Permission::Write);
    let response = gw
        .send(
            Request::post("/files/a.txt")
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_percent_encoded_path() {
    let gw = Gateway::new();
    gw.write_file("with space.txt", b"spaced");
    let token = gw.token("/files", Permission::Read);

    let response = gw.send(get("/files/with%20space.txt", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"spaced");
}

#[tokio::test]
async fn test_domain_map_remaps_host() {
    let gw = Gateway::with_config(|c| {
        c.domain_map
            .insert("photos.example".to_string(), "/files/photos/".to_string());
        c.auth.anonymous.push(Privilege {
            path: "/files/photos".to_string(),
            perm: Permission::Read,
        });
    });
    gw.write_file("photos/cat.txt", b"meow");

    let response = gw
        .send(
            Request::get("/cat.txt")
                .header(header::HOST, "internal:3838")
                .header("x-forwarded-host", "photos.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"meow");

    // Unmapped hosts see the plain namespace.
    let response = gw
        .send(
            Request::get("/cat.txt")
                .header(header::HOST, "other.example")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// =============================================================================
// Meta-protocol mode
// =============================================================================

#[tokio::test]
async fn test_meta_json_depth() {
    let gw = Gateway::new();
    gw.write_file("a.txt", b"abc");
    gw.write_file("sub/b.txt", b"bb");
    gw.write_file("sub/deeper/c.txt", b"c");
    let token = gw.token("/files", Permission::Read);

    let response = gw.send(get("/files/gemdrive/meta.json", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    let item = body_json(response).await;
    let children = item["children"].as_object().unwrap();
    let mut keys: Vec<&str> = children.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(keys, vec!["a.txt", "sub/"]);
    assert_eq!(children["a.txt"]["size"], 3);
    assert!(children["sub/"].get("children").is_none());

    let response = gw.send(get("/files/gemdrive/meta.json?depth=2", &token)).await;
    let item = body_json(response).await;
    let sub = item["children"]["sub/"]["children"].as_object().unwrap();
    let mut keys: Vec<&str> = sub.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(keys, vec!["b.txt", "deeper/"]);
    assert!(sub["deeper/"].get("children").is_none());

    let response = gw.send(get("/files/gemdrive/meta.json?depth=-1", &token)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_meta_json_root_lists_mounts() {
    let gw = Gateway::new();
    let token = gw.token("/", Permission::Read);

    let item = body_json(gw.send(get("/gemdrive/meta.json", &token)).await).await;
    let children = item["children"].as_object().unwrap();
    let mut keys: Vec<&str> = children.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(keys, vec!["files/", "scratch/"]);
}

#[tokio::test]
async fn test_meta_json_requires_read() {
    let gw = Gateway::new();
    let response = gw
        .send(
            Request::get("/files/gemdrive/meta.json")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_unknown_meta_operation() {
    let gw = Gateway::new();
    let token = gw.token("/", Permission::Read);
    let response = gw.send(get("/files/gemdrive/frobnicate", &token)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_images() {
    let gw = Gateway::new();
    let picture = image::RgbImage::from_pixel(64, 32, image::Rgb([200, 10, 10]));
    picture.save(gw.files.join("pic.png")).unwrap();
    let token = gw.token("/", Permission::Read);

    let response = gw.send(get("/files/gemdrive/images/16/pic.png", &token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get(header::CONTENT_TYPE).unwrap(), "image/jpeg");
    let jpeg = body_bytes(response).await;
    let decoded = image::load_from_memory(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (16, 8));

    let response = gw.send(get("/files/gemdrive/images/big/pic.png", &token)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // The memory mount cannot render images.
    let response = gw.send(get("/scratch/gemdrive/images/16/pic.png", &token)).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}
