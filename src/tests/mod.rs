//! Unit-style tests for the steelscript REST bindings.
//!
//! The appliances are simulated by `wiremock` servers listening on localhost.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reqwest::header::{self, HeaderMap, HeaderValue};
use secrecy::SecretString;
use serde_json::json;
use wiremock::{MockServer, ResponseTemplate};

use crate::connection::{BoxFuture, Connection, ConnectionConfig, Reauthenticate};
use crate::defs::Result;

mod connection;
mod dirs;

/// A reauthentication handler that installs a fixed token and counts its runs.
#[derive(Debug, Default)]
struct CountingReauth {
    /// How many times the handler has run.
    calls: AtomicUsize,
}

impl CountingReauth {
    /// The header value installed by the handler.
    const TOKEN: &'static str = "Bearer fresh";

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Reauthenticate for CountingReauth {
    fn reauthenticate<'fut>(
        &'fut self,
        conn: &'fut mut Connection,
    ) -> BoxFuture<'fut, Result<()>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut headers = HeaderMap::new();
            headers.insert(header::AUTHORIZATION, HeaderValue::from_static(Self::TOKEN));
            conn.add_headers(headers);
            Ok(())
        })
    }
}

/// Connect to a mock appliance.
fn mock_conn(server: &MockServer) -> anyhow::Result<Connection> {
    Ok(Connection::new(ConnectionConfig::new(&server.uri()))?)
}

/// Connect to a mock appliance, register a counting reauthentication handler.
fn mock_conn_reauth(server: &MockServer) -> anyhow::Result<(Connection, Arc<CountingReauth>)> {
    let mut conn = mock_conn(server)?;
    let handler = Arc::new(CountingReauth::default());
    conn.set_reauthenticate(Some(Arc::clone(&handler) as Arc<dyn Reauthenticate>));
    Ok((conn, handler))
}

/// A NetShark-style JSON error response.
fn json_error(status: u16, error_id: &str) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({
        "error_id": error_id,
        "error_text": format!("{error_id} reported by the mock appliance"),
    }))
}

/// The password used by all the tests.
fn password() -> SecretString {
    SecretString::from("mellon".to_owned())
}
