//! Test the request execution of the `Connection` class.

use std::fs;

use anyhow::{bail, Context, Result};
use reqwest::header::{self, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing_test::traced_test;
use wiremock::matchers::{body_json, header as header_is, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use crate::connection::{
    resolve_hostname, Connection, ConnectionConfig, RequestBody, RequestOptions, RestLogConfig,
    UploadResult,
};
use crate::defs::Error;
use crate::http_error::{AUTH_EXPIRED_TOKEN, AUTH_INVALID_SESSION};

use super::{json_error, mock_conn, mock_conn_reauth, CountingReauth};

#[traced_test]
#[test]
fn test_resolve_hostname() -> Result<()> {
    for (hostname, port, expected) in [
        ("np.example.com", None, "https://np.example.com"),
        ("np.example.com", Some(443), "https://np.example.com:443"),
        ("np.example.com", Some(80), "http://np.example.com:80"),
        ("np.example.com:80", None, "http://np.example.com:80"),
        ("np.example.com:8443", Some(8443), "https://np.example.com:8443"),
        ("http://np.example.com", Some(8080), "http://np.example.com:8080"),
        ("https://np.example.com:80", None, "https://np.example.com:80"),
        ("[::1]", Some(80), "http://[::1]:80"),
    ] {
        let resolved = resolve_hostname(hostname, port)?;
        info!(hostname, ?port, resolved);
        assert_eq!(resolved, expected);
    }
    Ok(())
}

#[traced_test]
#[test]
fn test_resolve_hostname_port_mismatch() {
    for (hostname, port) in [
        ("np.example.com:8443", 443),
        ("https://np.example.com:443", 80),
    ] {
        match resolve_hostname(hostname, Some(port)) {
            Err(Error::Config(msg)) => info!(msg),
            other => panic!("{hostname} with port {port}: {other:?}"),
        }
    }
    assert!(matches!(
        resolve_hostname("np.example.com:http", None),
        Err(Error::Config(_))
    ));
}

#[traced_test]
#[test]
fn test_get_url() -> Result<()> {
    let conn = Connection::new(ConnectionConfig::new("np.example.com"))?;
    assert_eq!(conn.hostname(), "https://np.example.com");
    assert_eq!(
        conn.get_url("/api/common/1.0/ping")?.as_str(),
        "https://np.example.com/api/common/1.0/ping"
    );
    assert_eq!(
        conn.get_url("http://other.example.com/x")?.as_str(),
        "http://other.example.com/x"
    );
    assert!(conn.user_agent().contains("SteelScript/"));
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_json_request() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/test/1.0/items"))
        .and(query_param("limit", "5"))
        .and(header_is("accept", "application/json"))
        .and(body_json(json!({"name": "item", "password": "mellon"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42})))
        .expect(1)
        .mount(&server)
        .await;

    let mut conn = mock_conn(&server)?;
    conn.set_rest_log(RestLogConfig {
        debug: 2,
        body_lines: 20,
    });
    let reply = conn
        .json_request(
            Method::POST,
            "/api/test/1.0/items",
            Some(&json!({"name": "item", "password": "mellon"})),
            RequestOptions::new().param("limit", "5"),
        )
        .await?;
    assert_eq!(reply, Some(json!({"id": 42})));
    assert!(logs_contain("********"));
    assert!(!logs_contain("mellon"));
    Ok(())
}

#[derive(Debug, Serialize)]
struct NewItem<'data> {
    name: &'data str,
    tags: Vec<&'data str>,
}

#[traced_test]
#[tokio::test]
async fn test_json_request_with() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/test/1.0/items/1"))
        .and(body_json(json!({"name": "item", "tags": ["a", "b"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let mut conn = mock_conn(&server)?;
    let item = NewItem {
        name: "item",
        tags: vec!["a", "b"],
    };
    let reply = conn
        .json_request_with(Method::PUT, "/api/test/1.0/items/1", &item, RequestOptions::new())
        .await?;
    assert_eq!(reply, Some(json!({"id": 1})));
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_json_request_no_content() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/test/1.0/items/1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut conn = mock_conn(&server)?;
    let (reply, resp) = conn
        .json_request_full(Method::DELETE, "/api/test/1.0/items/1", None, RequestOptions::new())
        .await?;
    assert_eq!(reply, None);
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_reauthenticate_once() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/test/1.0/items"))
        .and(header_is("authorization", CountingReauth::TOKEN))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([1, 2, 3])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/test/1.0/items"))
        .respond_with(json_error(401, AUTH_EXPIRED_TOKEN))
        .expect(1)
        .mount(&server)
        .await;

    let (mut conn, handler) = mock_conn_reauth(&server)?;
    conn.set_cookies([("session".to_owned(), "stale".to_owned())]);
    let reply = conn
        .json_request(Method::GET, "/api/test/1.0/items", None, RequestOptions::new())
        .await?;
    assert_eq!(reply, Some(json!([1, 2, 3])));
    assert_eq!(handler.calls(), 1);
    assert!(conn.cookies().is_empty());
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_reauthenticate_fails_again() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/test/1.0/items"))
        .respond_with(json_error(401, AUTH_EXPIRED_TOKEN))
        .expect(2)
        .mount(&server)
        .await;

    let (mut conn, handler) = mock_conn_reauth(&server)?;
    let err = match conn
        .json_request(Method::GET, "/api/test/1.0/items", None, RequestOptions::new())
        .await
    {
        Ok(reply) => bail!("Expected an error, got {reply:?}"),
        Err(err) => err,
    };
    let http = err.http().context("Expected an HTTP error")?;
    assert_eq!(http.error_id(), Some(AUTH_EXPIRED_TOKEN));
    assert_eq!(http.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(handler.calls(), 1);
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_no_reauthenticate_for_other_errors() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/test/1.0/items"))
        .respond_with(json_error(403, "AUTH_FORBIDDEN"))
        .expect(1)
        .mount(&server)
        .await;

    let (mut conn, handler) = mock_conn_reauth(&server)?;
    let err = conn
        .request(
            Method::GET,
            "/api/test/1.0/items",
            RequestBody::Empty,
            RequestOptions::new(),
        )
        .await
        .err()
        .context("Expected an error")?;
    assert_eq!(
        err.http().context("Expected an HTTP error")?.error_id(),
        Some("AUTH_FORBIDDEN")
    );
    assert_eq!(handler.calls(), 0);
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_xml_error() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/shark/4.0/jobs"))
        .respond_with(ResponseTemplate::new(401).set_body_raw(
            r#"<error error_id="AUTH_INVALID_SESSION" error_text="Session expired"/>"#,
            "text/xml",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let mut conn = mock_conn(&server)?;
    let err = conn
        .xml_request(Method::GET, "/api/shark/4.0/jobs", None, RequestOptions::new())
        .await
        .err()
        .context("Expected an error")?;
    let http = err.http().context("Expected an HTTP error")?;
    assert_eq!(http.error_id(), Some(AUTH_INVALID_SESSION));
    assert_eq!(http.error_text(), "Session expired");
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_xml_request() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/shark/4.0/jobs"))
        .and(header_is("content-type", "text/xml"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            r#"<jobs><job id="1"/><job id="2"/></jobs>"#,
            "text/xml; charset=utf-8",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/shark/4.0/jobs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jobs": []})))
        .mount(&server)
        .await;

    let mut conn = mock_conn(&server)?;
    let tree = conn
        .xml_request(Method::POST, "/api/shark/4.0/jobs", Some("<job/>"), RequestOptions::new())
        .await?;
    assert_eq!(tree.name, "jobs");
    assert_eq!(tree.children.len(), 2);

    match conn
        .xml_request(Method::GET, "/api/shark/4.0/jobs", None, RequestOptions::new())
        .await
    {
        Err(Error::ContentType { expected, actual }) => {
            assert_eq!(expected, "text/xml");
            assert_eq!(actual, "application/json");
        }
        other => bail!("Expected a content type error, got {other:?}"),
    }
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_urlencoded_and_upload() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/test/1.0/form"))
        .and(header_is("content-type", "application/x-www-form-urlencoded"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/test/1.0/blobs"))
        .respond_with(ResponseTemplate::new(201).insert_header("location", "/api/test/1.0/blobs/7"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/api/test/1.0/blobs/7"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut conn = mock_conn(&server)?;
    let resp = conn
        .urlencoded_request(
            Method::POST,
            "/api/test/1.0/form",
            &[("name", "a b"), ("value", "c&d")],
            RequestOptions::new(),
        )
        .await?;
    assert_eq!(resp.text(), "ok");

    let octets = RequestOptions::new().header(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    let created = conn
        .upload(Method::POST, "/api/test/1.0/blobs", b"data".to_vec(), octets.clone())
        .await?;
    assert_eq!(
        created,
        UploadResult::Created {
            location: "/api/test/1.0/blobs/7".to_owned()
        }
    );
    let replaced = conn
        .upload(Method::PUT, "/api/test/1.0/blobs/7", b"more".to_vec(), octets)
        .await?;
    assert_eq!(replaced, UploadResult::NoContent);
    Ok(())
}

/// Check that a request carries a `multipart/form-data` payload.
fn is_multipart(req: &Request) -> bool {
    req.headers
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data; boundary="))
}

#[traced_test]
#[tokio::test]
async fn test_upload_file() -> Result<()> {
    let tempd = tempfile::tempdir().context("Could not create a temporary directory")?;
    let first = tempd.path().join("first.txt");
    let second = tempd.path().join("second.json");
    fs::write(&first, "hello\n").context("Could not write the first file")?;
    fs::write(&second, "{}\n").context("Could not write the second file")?;

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/test/1.0/single"))
        .and(is_multipart)
        .and(|req: &Request| {
            let body = String::from_utf8_lossy(&req.body);
            body.contains("filename=\"first.txt\"") && !body.contains("second.json")
        })
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"files": 1})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/test/1.0/multiple"))
        .and(is_multipart)
        .and(|req: &Request| {
            let body = String::from_utf8_lossy(&req.body);
            body.contains("filename=\"first.txt\"") && body.contains("filename=\"second.json\"")
        })
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"files": 2})))
        .expect(1)
        .mount(&server)
        .await;

    let mut conn = mock_conn(&server)?;
    let single = conn
        .upload_file("/api/test/1.0/single", &[&first], RequestOptions::new())
        .await?;
    assert_eq!(single, Some(json!({"files": 1})));
    let multiple = conn
        .upload_file("/api/test/1.0/multiple", &[&first, &second], RequestOptions::new())
        .await?;
    assert_eq!(multiple, Some(json!({"files": 2})));
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_upload_missing_file() -> Result<()> {
    let tempd = tempfile::tempdir().context("Could not create a temporary directory")?;
    let missing = tempd.path().join("missing.txt");

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let mut conn = mock_conn(&server)?;
    match conn
        .upload_file("/api/test/1.0/single", &[&missing], RequestOptions::new())
        .await
    {
        Err(Error::File(err)) => {
            let msg = format!("{err:#}");
            info!(msg);
            assert!(msg.contains("missing.txt"));
        }
        other => bail!("Expected a file error, got {other:?}"),
    }
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_download() -> Result<()> {
    let tempd = tempfile::tempdir().context("Could not create a temporary directory")?;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/test/1.0/files/report"))
        .and(header_is("connection", "close"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", "attachment; filename=\"report.csv\"")
                .set_body_string("a,b\n1,2\n"),
        )
        .mount(&server)
        .await;

    let mut conn = mock_conn(&server)?;
    let into_dir = conn
        .download(
            Method::GET,
            "/api/test/1.0/files/report",
            Some(tempd.path()),
            false,
            RequestOptions::new(),
        )
        .await?;
    assert_eq!(into_dir, tempd.path().join("report.csv"));
    assert_eq!(fs::read_to_string(&into_dir)?, "a,b\n1,2\n");

    let existing = tempd.path().join("existing.csv");
    fs::write(&existing, "old").context("Could not write the existing file")?;
    match conn
        .download(
            Method::GET,
            "/api/test/1.0/files/report",
            Some(&existing),
            false,
            RequestOptions::new(),
        )
        .await
    {
        Err(Error::FileExists(found)) => assert_eq!(found, existing),
        other => bail!("Expected a file-exists error, got {other:?}"),
    }
    assert_eq!(fs::read_to_string(&existing)?, "old");

    let overwritten = conn
        .download(
            Method::GET,
            "/api/test/1.0/files/report",
            Some(&existing),
            true,
            RequestOptions::new(),
        )
        .await?;
    assert_eq!(overwritten, existing);
    assert_eq!(fs::read_to_string(&existing)?, "a,b\n1,2\n");
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_download_no_filename() -> Result<()> {
    let tempd = tempfile::tempdir().context("Could not create a temporary directory")?;
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/test/1.0/files/anonymous"))
        .respond_with(ResponseTemplate::new(200).set_body_string("data"))
        .mount(&server)
        .await;

    let mut conn = mock_conn(&server)?;
    assert!(matches!(
        conn.download(
            Method::GET,
            "/api/test/1.0/files/anonymous",
            Some(tempd.path()),
            false,
            RequestOptions::new(),
        )
        .await,
        Err(Error::NoFilename(_))
    ));

    let missing_dir = format!("{dir}/missing/", dir = tempd.path().display());
    assert!(matches!(
        conn.download(
            Method::GET,
            "/api/test/1.0/files/anonymous",
            Some(missing_dir.as_ref()),
            false,
            RequestOptions::new(),
        )
        .await,
        Err(Error::File(_))
    ));
    Ok(())
}

#[traced_test]
#[tokio::test]
async fn test_tls_downgrade_once() -> Result<()> {
    let mut conn = Connection::new(ConnectionConfig::new("https://127.0.0.1:1"))?;
    assert!(!conn.is_tls_downgraded());
    for _ in 0..2 {
        match conn
            .request(Method::GET, "/api/common/1.0/ping", RequestBody::Empty, RequestOptions::new())
            .await
        {
            Err(Error::Reqwest(err)) => info!("{err:#}"),
            other => bail!("Expected a connection error, got {other:?}"),
        }
        assert!(conn.is_tls_downgraded());
    }
    assert!(logs_contain("retrying with TLS 1.0"));
    Ok(())
}
