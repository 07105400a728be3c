use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use serde_json::Value;

pub const WORK_ID: &str = "w1";

pub static PIXEL_PNG: &[u8] = &[
    137, 80, 78, 71, 13, 10, 26, 10, 0, 0, 0, 13, 73, 72, 68, 82, 0, 0, 0, 1, 0, 0, 0, 1, 8, 4, 0,
    0, 0, 181, 28, 12, 2, 0, 0, 0, 11, 73, 68, 65, 84, 120, 218, 99, 252, 255, 23, 0, 2, 3, 1, 128,
    110, 220, 25, 0, 0, 0, 0, 73, 69, 78, 68, 174, 66, 96, 130,
];

#[derive(Debug, Clone)]
pub struct NovelStubConfig {
    pub chapters: u32,
    /// Key material returned by the session endpoint; `None` disables it.
    pub session_material: Option<Vec<u8>>,
}

impl Default for NovelStubConfig {
    fn default() -> Self {
        Self {
            chapters: 3,
            session_material: Some((0_u8..32).collect()),
        }
    }
}

impl NovelStubConfig {
    /// The content key chapters are encrypted with.
    pub fn content_key(&self) -> Option<String> {
        self.session_material
            .as_ref()
            .map(|material| hex::encode_upper(&material[..16]))
    }
}

pub struct NovelStub {
    pub base_url: String,
    session_requests: Arc<AtomicUsize>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[allow(dead_code)]
impl NovelStub {
    pub fn spawn(config: NovelStubConfig) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start novel stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}");
        let session_requests = Arc::new(AtomicUsize::new(0));
        let session_counter = Arc::clone(&session_requests);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let url = request.url().to_string();
                let path = url.split('?').next().unwrap_or(&url).to_string();
                let segments = path
                    .trim_start_matches('/')
                    .split('/')
                    .collect::<Vec<_>>();

                let response = match (request.method().clone(), segments.as_slice()) {
                    (tiny_http::Method::Get, ["api", "works", WORK_ID, "toc"])
                    | (tiny_http::Method::Get, ["v1", "books", WORK_ID, "catalog"]) => {
                        json(toc_json(config.chapters))
                    }
                    (tiny_http::Method::Get, ["api", "works", WORK_ID, "chapters", id]) => {
                        json(serde_json::json!({
                            "html": chapter_html(id),
                            "images": [{ "url": "/img/pic.png", "offset": 1 }],
                        }))
                    }
                    (tiny_http::Method::Get, ["v1", "books", WORK_ID, "chapters", id]) => {
                        let key = config.content_key();
                        let content = novelsync::crypto::encrypt(
                            chapter_html(id).as_bytes(),
                            key.as_deref(),
                        )
                        .expect("encrypt chapter");
                        json(serde_json::json!({ "content": content }))
                    }
                    (tiny_http::Method::Post, ["v1", "session"]) => {
                        session_counter.fetch_add(1, Ordering::SeqCst);
                        let mut body = String::new();
                        let _ = request.as_reader().read_to_string(&mut body);
                        let parsed: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                        let well_formed = parsed.get("device_id").is_some_and(Value::is_u64)
                            && parsed.get("payload").is_some_and(Value::is_string);
                        match (&config.session_material, well_formed) {
                            (Some(material), true) => {
                                let blob = novelsync::crypto::encrypt(material, None)
                                    .expect("encrypt key blob");
                                json(serde_json::json!({ "key_blob": blob }))
                            }
                            (Some(_), false) => text(400, "malformed session request"),
                            (None, _) => text(404, "not found"),
                        }
                    }
                    (tiny_http::Method::Get, ["img", "pic.png"]) => {
                        tiny_http::Response::from_data(PIXEL_PNG.to_vec()).with_status_code(200)
                    }
                    _ => text(404, "not found"),
                };
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            session_requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn session_requests(&self) -> usize {
        self.session_requests.load(Ordering::SeqCst)
    }
}

impl Drop for NovelStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn chapter_html(id: &str) -> String {
    format!("<p>Opening of {id}.</p><p>Ending of {id}.</p>")
}

fn toc_json(chapters: u32) -> Value {
    let chapters = (1..=chapters)
        .map(|n| {
            serde_json::json!({
                "id": format!("c{n}"),
                "title": format!("Chapter {n}"),
                "sequence": n,
            })
        })
        .collect::<Vec<_>>();
    serde_json::json!({
        "book": {
            "work_id": WORK_ID,
            "title": "Stub Novel",
            "author": "Stub Author",
        },
        "chapters": chapters,
    })
}

fn json(value: Value) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("build header");
    tiny_http::Response::from_string(value.to_string())
        .with_status_code(200)
        .with_header(header)
}

fn text(status: u16, body: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    tiny_http::Response::from_string(body).with_status_code(status)
}
