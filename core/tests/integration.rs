//! End-to-end tests against the live mock server.
//!
//! # Design
//! Starts the mock server on a random port, then drives `CloudClient` and
//! `HttpCommandExecutor` over real HTTP with `UreqTransport`. Covers the blob
//! lifecycle, redirects, retries, provider error codes and signing filters.

use std::io::{Cursor, Read};
use std::sync::Arc;

use cloudhttp_core::{
    BasicAuthentication, CloudClient, ExecutorConfig, HttpCommand, HttpCommandExecutor, HttpError, HttpMethod,
    HttpRequest, Payload, UreqTransport,
};

/// Start the mock server on a random port and return its base URL.
fn start_server() -> String {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });

    format!("http://{addr}")
}

fn config() -> ExecutorConfig {
    ExecutorConfig {
        max_retries: 3,
        retry_delay_start_ms: 1,
        connection_timeout_ms: 5_000,
        so_timeout_ms: 5_000,
        ..ExecutorConfig::default()
    }
}

fn executor(config: ExecutorConfig) -> HttpCommandExecutor<UreqTransport> {
    HttpCommandExecutor::builder(UreqTransport::new(&config))
        .config(config)
        .build()
}

fn client(base: &str) -> CloudClient<UreqTransport> {
    CloudClient::new(base, executor(config()))
}

fn body(response: &mut cloudhttp_core::HttpResponse) -> String {
    response.payload_as_string().unwrap_or_default()
}

#[test]
fn blob_lifecycle() {
    let client = client(&start_server());

    // Step 1: store a blob with content metadata.
    let payload = Payload::from_string("hello").with_content_type("text/plain");
    let resp = client.put("buckets/b/greeting.txt", payload).unwrap();
    assert_eq!(resp.status, 201);

    // Step 2: read it back.
    let mut resp = client.get("buckets/b/greeting.txt").unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(body(&mut resp), "hello");
    let metadata = resp.payload.as_ref().unwrap().metadata();
    assert_eq!(metadata.content_type.as_deref(), Some("text/plain"));
    assert_eq!(metadata.content_length, Some(5));

    // Step 3: metadata only.
    let metadata = client.head("buckets/b/greeting.txt").unwrap();
    assert_eq!(metadata.content_length, Some(5));

    // Step 4: delete twice; the second finds nothing.
    assert!(client.delete("buckets/b/greeting.txt").unwrap());
    assert!(!client.delete("buckets/b/greeting.txt").unwrap());

    // Step 5: gone.
    let err = client.get("buckets/b/greeting.txt").unwrap_err();
    assert!(matches!(err, HttpError::ResourceNotFound { .. }), "{err}");
}

#[test]
fn content_md5_travels_as_metadata() {
    let client = client(&start_server());
    let mut payload = Payload::from_string("hello");
    let md5 = payload.calculate_md5().unwrap();
    payload.metadata_mut().content_md5 = Some(md5);
    client.put("buckets/b/k", payload).unwrap();

    let resp = client.get("buckets/b/k").unwrap();
    let metadata = resp.payload.as_ref().unwrap().metadata();
    assert_eq!(metadata.content_md5, Some(md5));
}

#[test]
fn file_payloads_can_be_sent() {
    let client = client(&start_server());
    let mut file = tempfile::NamedTempFile::new().unwrap();
    std::io::Write::write_all(&mut file, b"from a file").unwrap();
    client.put("buckets/b/file", Payload::from_file(file.path()).unwrap()).unwrap();

    let mut resp = client.get("buckets/b/file").unwrap();
    assert_eq!(body(&mut resp), "from a file");
}

#[test]
fn chunked_streams_are_sent_without_length() {
    let client = client(&start_server());
    let request = client
        .build_request(
            HttpMethod::Put,
            "buckets/b/stream",
            Some(Payload::from_reader(Cursor::new(b"streamed body".to_vec()), None)),
        )
        .with_header("Transfer-Encoding", "chunked");
    assert_eq!(client.invoke(request).unwrap().status, 201);

    let mut resp = client.get("buckets/b/stream").unwrap();
    assert_eq!(body(&mut resp), "streamed body");
}

#[test]
fn streams_without_length_or_chunking_are_refused() {
    let client = client(&start_server());
    let request = client.build_request(
        HttpMethod::Put,
        "buckets/b/stream",
        Some(Payload::from_reader(Cursor::new(b"body".to_vec()), None)),
    );
    let err = client.invoke(request).unwrap_err();
    assert!(matches!(err, HttpError::InvalidRequest(_)), "{err}");
    assert!(err.to_string().contains("before filtering"), "{err}");
}

#[test]
fn redirects_are_followed() {
    let client = client(&start_server());
    client.put("buckets/b/dir/k", "moved body").unwrap();

    let mut command = HttpCommand::new(client.build_request(HttpMethod::Get, "moved/b/dir/k", None));
    client.executor().execute(&mut command);
    assert_eq!(command.redirect_count(), 1);
    assert!(command.current_request().endpoint.ends_with("/buckets/b/dir/k"));
    let mut resp = command.into_result().unwrap();
    assert_eq!(body(&mut resp), "moved body");
}

#[test]
fn server_errors_are_retried_until_success() {
    let base = start_server();
    let exec = executor(config());
    let mut command = HttpCommand::new(HttpRequest::new(HttpMethod::Get, format!("{base}/flaky/a?failures=2")));
    exec.execute(&mut command);
    assert_eq!(command.failure_count(), 2);
    let mut resp = command.into_result().unwrap();
    assert_eq!(body(&mut resp), "ok after 3 calls");
}

#[test]
fn throttling_is_retried() {
    let base = start_server();
    let exec = executor(config());
    let resp = exec
        .execute_request(HttpRequest::new(HttpMethod::Get, format!("{base}/flaky/t?failures=1&status=429")))
        .unwrap();
    assert_eq!(resp.status, 200);
}

#[test]
fn retries_give_up_after_the_limit() {
    let base = start_server();
    let exec = executor(config());
    let mut command = HttpCommand::new(HttpRequest::new(HttpMethod::Get, format!("{base}/flaky/b?failures=100")));
    exec.execute(&mut command);
    assert_eq!(command.failure_count(), 4);
    let err = command.into_result().unwrap_err();
    assert_eq!(err.status(), Some(503));
}

#[test]
fn missing_credentials_are_an_authorization_error() {
    let base = start_server();
    let anonymous = client(&base);
    let err = anonymous.get("private/report.csv").unwrap_err();
    match &err {
        HttpError::Authorization { response, .. } => {
            let body = response.as_ref().and_then(|r| r.body.as_deref()).unwrap_or_default();
            assert!(body.contains("AccessDenied"), "{body}");
        }
        other => panic!("expected authorization error, got {other}"),
    }

    let signed = client(&base).with_filter(Arc::new(BasicAuthentication::new("user", "secret")));
    let mut resp = signed.get("private/report.csv").unwrap();
    assert_eq!(body(&mut resp), "secret:report.csv");
}

#[test]
fn connection_failures_become_transport_errors() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let exec = executor(ExecutorConfig {
        max_retries: 1,
        ..config()
    });
    let mut command = HttpCommand::new(HttpRequest::new(HttpMethod::Get, format!("http://{addr}/nothing")));
    exec.execute(&mut command);
    assert_eq!(command.failure_count(), 2);
    let err = command.into_result().unwrap_err();
    assert!(matches!(err, HttpError::Transport { .. }), "{err}");
    assert!(err.to_string().contains("connecting to GET"), "{err}");
}

#[test]
fn tls_failures_are_authorization_errors_without_retries() {
    // A plaintext server answering a TLS client hello.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let mut hello = [0u8; 512];
            let _ = stream.read(&mut hello);
            let _ = std::io::Write::write_all(&mut stream, b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n");
        }
    });

    let exec = executor(ExecutorConfig {
        max_retries: 2,
        ..config()
    });
    let mut command = HttpCommand::new(HttpRequest::new(HttpMethod::Get, format!("https://{addr}/x")));
    exec.execute(&mut command);
    assert_eq!(command.failure_count(), 0);
    let err = command.into_result().unwrap_err();
    assert!(matches!(err, HttpError::Authorization { .. }), "{err}");
    assert!(err.to_string().contains("connecting to GET https://"), "{err}");
}

#[test]
fn malformed_uris_fail_without_retries() {
    let mut command = HttpCommand::new(HttpRequest::new(HttpMethod::Get, "not a uri"));
    executor(config()).execute(&mut command);
    assert_eq!(command.failure_count(), 0);
    let err = command.into_result().unwrap_err();
    assert!(matches!(err, HttpError::Transport { .. }), "{err}");
}

#[test]
fn wire_log_leaves_bodies_intact() {
    let base = start_server();
    let exec = executor(ExecutorConfig {
        wire_log: true,
        wire_buffer_threshold: 4,
        ..config()
    });
    let client = CloudClient::new(&base, exec);
    let data: Vec<u8> = (0..20_000u32).map(|i| b'a' + (i % 26) as u8).collect();
    client
        .put("buckets/b/large", Payload::from_reader(Cursor::new(data.clone()), Some(data.len() as u64)))
        .unwrap();

    let resp = client.get("buckets/b/large").unwrap();
    let mut read = Vec::new();
    resp.payload.unwrap().open().unwrap().read_to_end(&mut read).unwrap();
    assert_eq!(read, data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submitted_commands_run_on_the_pool() {
    let base = start_server();
    let config = ExecutorConfig {
        io_worker_threads: 2,
        ..config()
    };
    let client = CloudClient::new(&base, executor(config));

    let puts: Vec<_> = (0..6)
        .map(|i| {
            let request = client.build_request(
                HttpMethod::Put,
                &format!("buckets/pool/{i}"),
                Some(Payload::from_string(format!("value {i}"))),
            );
            tokio::spawn(client.submit(request))
        })
        .collect();
    for put in puts {
        assert_eq!(put.await.unwrap().unwrap().status, 201);
    }

    let mut resp = client
        .submit(client.build_request(HttpMethod::Get, "buckets/pool/5", None))
        .await
        .unwrap();
    assert_eq!(body(&mut resp), "value 5");

    let err = client
        .submit(client.build_request(HttpMethod::Get, "buckets/pool/missing", None))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
