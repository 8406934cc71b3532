//! End-to-end exercises of the upload engine against a scripted in-process
//! remote: reserve, chunk transfer and commit flow through the real driver,
//! work pool and buffer pool, with only the TCP peer faked.

use crate::bufpool::BufferPool;
use crate::config::RemoteConfig;
use crate::credentials::{CredentialFile, CredentialStore, TokenEntry};
use crate::hasher::md5_hex;
use crate::pool::{AdmissionMode, WorkPool};
use crate::remote::RemoteClient;
use crate::uploader::error::UploadError;
use crate::uploader::{ProgressFn, Uploader, UploaderConfig};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

const EMPTY_MD5: &str = "d41d8cd98f00b204e9800998ecf8427e";

/// One request as recorded by the mock remote.
#[derive(Debug, Clone)]
struct MockRequest {
    path: String,
    query: HashMap<String, String>,
    body: Vec<u8>,
}

impl MockRequest {
    fn query(&self, key: &str) -> &str {
        self.query.get(key).map(String::as_str).unwrap_or("")
    }

    fn body_contains(&self, needle: &[u8]) -> bool {
        find_subslice(&self.body, needle).is_some()
    }
}

type Responder = Arc<dyn Fn(&MockRequest) -> String + Send + Sync>;

struct MockRemote {
    base_url: String,
    requests: Arc<Mutex<Vec<MockRequest>>>,
}

impl MockRemote {
    fn requests(&self) -> Vec<MockRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn by_method(&self, method: &str) -> Vec<MockRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.query("method") == method)
            .collect()
    }
}

async fn spawn_mock(responder: Responder) -> MockRemote {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let requests: Arc<Mutex<Vec<MockRequest>>> = Arc::new(Mutex::new(Vec::new()));

    let accept_requests = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(handle_conn(
                stream,
                Arc::clone(&responder),
                Arc::clone(&accept_requests),
            ));
        }
    });

    MockRemote { base_url, requests }
}

/// Minimal HTTP/1.1 server loop: enough for keep-alive requests with a
/// Content-Length body, which is all reqwest sends here.
async fn handle_conn(
    mut stream: TcpStream,
    responder: Responder,
    requests: Arc<Mutex<Vec<MockRequest>>>,
) {
    let mut buf: Vec<u8> = Vec::new();
    let mut tmp = [0u8; 16 * 1024];

    loop {
        let header_end = loop {
            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                break pos;
            }
            match stream.read(&mut tmp).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
        };

        let header = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let mut lines = header.split("\r\n");
        let request_line = lines.next().unwrap_or_default();
        let target = request_line
            .split_whitespace()
            .nth(1)
            .unwrap_or_default()
            .to_string();

        let mut content_length = 0usize;
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap_or(0);
                }
            }
        }

        let body_start = header_end + 4;
        while buf.len() < body_start + content_length {
            match stream.read(&mut tmp).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&tmp[..n]),
            }
        }
        let body = buf[body_start..body_start + content_length].to_vec();
        buf.drain(..body_start + content_length);

        let (path, query_text) = target.split_once('?').unwrap_or((target.as_str(), ""));
        let query: HashMap<String, String> = query_text
            .split('&')
            .filter(|pair| !pair.is_empty())
            .filter_map(|pair| pair.split_once('='))
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();

        let request = MockRequest {
            path: path.to_string(),
            query,
            body,
        };
        requests.lock().unwrap().push(request.clone());

        let json = responder(&request);
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
            json.len(),
            json
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

struct Harness {
    dir: tempfile::TempDir,
    mock: MockRemote,
    uploader: Uploader,
}

/// Wire the real engine (4-byte chunks for small fixtures) to the mock.
async fn harness(responder: Responder) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mock = spawn_mock(responder).await;

    let token_path = dir.path().join("token.json");
    write_credentials(&token_path, "t1", "r1");

    let remote_cfg = RemoteConfig {
        app_key: "key".into(),
        app_secret: "secret".into(),
        token_path,
        api_base: mock.base_url.clone(),
        data_base: mock.base_url.clone(),
        oauth_base: mock.base_url.clone(),
        ..Default::default()
    };
    let creds = Arc::new(CredentialStore::new(&remote_cfg));
    let remote = Arc::new(RemoteClient::new(&remote_cfg, Arc::clone(&creds)).unwrap());

    let pool = WorkPool::new(4, 16, AdmissionMode::Full);
    pool.start();
    let bufs = BufferPool::new(4, 8);

    let uploader = Uploader::new(
        remote,
        creds,
        pool,
        bufs,
        UploaderConfig {
            path_prefix: "/apps/backup".into(),
            ..Default::default()
        },
    );

    Harness {
        dir,
        mock,
        uploader,
    }
}

fn write_credentials(path: &Path, access: &str, refresh: &str) {
    let file = CredentialFile {
        access_token: TokenEntry {
            value: access.to_string(),
            start_time: "2024-01-01 00:00:00".to_string(),
        },
        refresh_token: TokenEntry {
            value: refresh.to_string(),
            start_time: "2024-01-01 00:00:00".to_string(),
        },
    };
    std::fs::write(path, serde_json::to_vec_pretty(&file).unwrap()).unwrap();
}

fn progress_recorder() -> (ProgressFn, Arc<Mutex<Vec<(u64, u64)>>>) {
    let log: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let callback: ProgressFn = Arc::new(move |done, total| {
        sink.lock().unwrap().push((done, total));
    });
    (callback, log)
}

fn ok_chunk() -> String {
    serde_json::json!({"errno": 0, "error_code": 0, "md5": "aa"}).to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_upload_sends_every_chunk_and_commits() {
    let responder: Responder = Arc::new(|request| match request.query("method") {
        "precreate" => serde_json::json!({
            "errno": 0, "uploadid": "U1", "return_type": 1, "block_list": [0, 1, 2]
        })
        .to_string(),
        "upload" => ok_chunk(),
        "create" => serde_json::json!({
            "errno": 0, "fs_id": 42, "path": "/apps/backup/data/f.bin"
        })
        .to_string(),
        _ => serde_json::json!({"errno": 2}).to_string(),
    });
    let h = harness(responder).await;

    let file = h.dir.path().join("f.bin");
    std::fs::write(&file, b"0123456789").unwrap();

    let (progress, log) = progress_recorder();
    let response = h
        .uploader
        .upload(&file, "/data/f.bin", CancellationToken::new(), progress)
        .await
        .unwrap();
    assert_eq!(response.fs_id, 42);

    let reserve = &h.mock.by_method("precreate")[0];
    assert_eq!(reserve.query("access_token"), "t1");
    assert!(reserve.body_contains(b"size=10"));
    assert!(reserve.body_contains(md5_hex(b"0123").as_bytes()));
    assert!(reserve.body_contains(md5_hex(b"4567").as_bytes()));
    assert!(reserve.body_contains(md5_hex(b"89").as_bytes()));

    let uploads = h.mock.by_method("upload");
    assert_eq!(uploads.len(), 3);
    let mut seqs: Vec<&str> = uploads.iter().map(|r| r.query("partseq")).collect();
    seqs.sort();
    assert_eq!(seqs, ["0", "1", "2"]);
    assert!(uploads.iter().all(|r| r.query("uploadid") == "U1"));
    assert!(uploads.iter().any(|r| r.body_contains(b"0123")));
    assert!(uploads.iter().any(|r| r.body_contains(b"4567")));
    assert!(uploads.iter().any(|r| r.body_contains(b"89")));

    // Commit is the final request, after every chunk was accepted.
    let requests = h.mock.requests();
    assert_eq!(requests.last().unwrap().query("method"), "create");
    assert!(log.lock().unwrap().contains(&(3, 3)));
}

#[tokio::test(flavor = "multi_thread")]
async fn resume_uploads_only_the_missing_chunk() {
    let responder: Responder = Arc::new(|request| match request.query("method") {
        "precreate" => serde_json::json!({
            "errno": 0, "uploadid": "U2", "return_type": 1, "block_list": [2]
        })
        .to_string(),
        "upload" => ok_chunk(),
        "create" => serde_json::json!({"errno": 0, "fs_id": 8, "path": "/x"}).to_string(),
        _ => serde_json::json!({"errno": 2}).to_string(),
    });
    let h = harness(responder).await;

    let file = h.dir.path().join("f.bin");
    std::fs::write(&file, b"0123456789").unwrap();

    let (progress, _log) = progress_recorder();
    h.uploader
        .upload(&file, "/data/f.bin", CancellationToken::new(), progress)
        .await
        .unwrap();

    let uploads = h.mock.by_method("upload");
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].query("partseq"), "2");
    assert!(uploads[0].body_contains(b"89"));
    assert!(!uploads[0].body_contains(b"0123"));
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_token_is_refreshed_and_reserve_retried() {
    let precreates = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&precreates);
    let responder: Responder = Arc::new(move |request| {
        if request.path.starts_with("/oauth/2.0/token") {
            return serde_json::json!({
                "access_token": "t2", "refresh_token": "r2", "expires_in": 2592000
            })
            .to_string();
        }
        match request.query("method") {
            "precreate" => {
                let mut calls = counter.lock().unwrap();
                *calls += 1;
                if *calls == 1 {
                    serde_json::json!({"errno": -6}).to_string()
                } else {
                    serde_json::json!({
                        "errno": 0, "uploadid": "U3", "return_type": 1, "block_list": [0]
                    })
                    .to_string()
                }
            }
            "upload" => ok_chunk(),
            "create" => serde_json::json!({"errno": 0, "fs_id": 9, "path": "/x"}).to_string(),
            _ => serde_json::json!({"errno": 2}).to_string(),
        }
    });
    let h = harness(responder).await;

    let file = h.dir.path().join("f.bin");
    std::fs::write(&file, b"data").unwrap();

    let (progress, _log) = progress_recorder();
    h.uploader
        .upload(&file, "/data/f.bin", CancellationToken::new(), progress)
        .await
        .unwrap();

    let reserves = h.mock.by_method("precreate");
    assert_eq!(reserves.len(), 2);
    assert_eq!(reserves[0].query("access_token"), "t1");
    assert_eq!(reserves[1].query("access_token"), "t2");

    let refresh = h
        .mock
        .requests()
        .into_iter()
        .find(|r| r.path.starts_with("/oauth/2.0/token"))
        .expect("no token refresh request");
    assert_eq!(refresh.query("grant_type"), "refresh_token");
    assert_eq!(refresh.query("refresh_token"), "r1");

    // The fresh pair was persisted atomically.
    let stored = std::fs::read_to_string(h.dir.path().join("token.json")).unwrap();
    assert!(stored.contains("t2"));
    assert!(stored.contains("r2"));
}

#[tokio::test(flavor = "multi_thread")]
async fn flaky_chunk_retries_until_accepted() {
    let failures = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&failures);
    let responder: Responder = Arc::new(move |request| match request.query("method") {
        "precreate" => serde_json::json!({
            "errno": 0, "uploadid": "U4", "return_type": 1, "block_list": [0, 1, 2]
        })
        .to_string(),
        "upload" => {
            if request.query("partseq") == "1" {
                let mut failed = counter.lock().unwrap();
                if *failed < 2 {
                    *failed += 1;
                    return serde_json::json!({"errno": 31363}).to_string();
                }
            }
            ok_chunk()
        }
        "create" => serde_json::json!({"errno": 0, "fs_id": 5, "path": "/x"}).to_string(),
        _ => serde_json::json!({"errno": 2}).to_string(),
    });
    let h = harness(responder).await;

    let file = h.dir.path().join("f.bin");
    std::fs::write(&file, b"0123456789").unwrap();

    let (progress, log) = progress_recorder();
    h.uploader
        .upload(&file, "/data/f.bin", CancellationToken::new(), progress)
        .await
        .unwrap();

    let seq1_attempts = h
        .mock
        .by_method("upload")
        .iter()
        .filter(|r| r.query("partseq") == "1")
        .count();
    assert_eq!(seq1_attempts, 3);
    assert!(log.lock().unwrap().contains(&(3, 3)));
}

#[tokio::test(flavor = "multi_thread")]
async fn existing_file_commits_without_sending_chunks() {
    let responder: Responder = Arc::new(|request| match request.query("method") {
        "precreate" => serde_json::json!({
            "errno": 0, "uploadid": "", "return_type": 2, "block_list": []
        })
        .to_string(),
        "create" => serde_json::json!({"errno": 0, "fs_id": 6, "path": "/x"}).to_string(),
        _ => serde_json::json!({"errno": 2}).to_string(),
    });
    let h = harness(responder).await;

    let file = h.dir.path().join("f.bin");
    std::fs::write(&file, b"0123456789").unwrap();

    let (progress, _log) = progress_recorder();
    let response = h
        .uploader
        .upload(&file, "/data/f.bin", CancellationToken::new(), progress)
        .await
        .unwrap();
    assert_eq!(response.fs_id, 6);

    assert!(h.mock.by_method("upload").is_empty());
    assert_eq!(h.mock.by_method("create").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_file_still_sends_one_chunk() {
    let responder: Responder = Arc::new(|request| match request.query("method") {
        "precreate" => serde_json::json!({
            "errno": 0, "uploadid": "U5", "return_type": 1, "block_list": []
        })
        .to_string(),
        "upload" => ok_chunk(),
        "create" => serde_json::json!({"errno": 0, "fs_id": 3, "path": "/x"}).to_string(),
        _ => serde_json::json!({"errno": 2}).to_string(),
    });
    let h = harness(responder).await;

    let file = h.dir.path().join("empty.bin");
    std::fs::write(&file, b"").unwrap();

    let (progress, _log) = progress_recorder();
    h.uploader
        .upload(&file, "/data/empty.bin", CancellationToken::new(), progress)
        .await
        .unwrap();

    // The block list still has exactly one digest, that of the empty input.
    let reserve = &h.mock.by_method("precreate")[0];
    assert!(reserve.body_contains(EMPTY_MD5.as_bytes()));

    let uploads = h.mock.by_method("upload");
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].query("partseq"), "0");
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_commit_surfaces_the_server_error() {
    let responder: Responder = Arc::new(|request| match request.query("method") {
        "precreate" => serde_json::json!({
            "errno": 0, "uploadid": "U6", "return_type": 1, "block_list": [0]
        })
        .to_string(),
        "upload" => ok_chunk(),
        "create" => serde_json::json!({"errno": 111}).to_string(),
        _ => serde_json::json!({"errno": 2}).to_string(),
    });
    let h = harness(responder).await;

    let file = h.dir.path().join("f.bin");
    std::fs::write(&file, b"data").unwrap();

    let (progress, _log) = progress_recorder();
    let result = h
        .uploader
        .upload(&file, "/data/f.bin", CancellationToken::new(), progress)
        .await;

    match result {
        Err(UploadError::Server { errno }) => assert_eq!(errno, 111),
        other => panic!("unexpected upload result: {other:?}"),
    }
}
