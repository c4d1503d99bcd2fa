use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use maplit::btreemap;
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::feature::Feature;
use crate::gate::{GateKind, GateValue};
use crate::snapshot::Snapshot;
use crate::store::FlagStore;

/// Header carrying the environment token on every request.
pub const TOKEN_HEADER: &str = "Flagsync-Token";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Destination for one line per HTTP request.
pub type DebugOutput = Arc<Mutex<dyn Write + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Delete => "DELETE",
        })
    }
}

/// Connection timeouts the client must enforce for each request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub read: Duration,
    pub open: Duration,
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            read: DEFAULT_TIMEOUT,
            open: DEFAULT_TIMEOUT,
            write: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeouts: Timeouts,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        HttpResponse {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The transport used by [HttpStore].
///
/// Implement this over whichever HTTP library the application already uses. An `Err` means the
/// request never produced a response (connection refused, timeout, TLS failure); any response,
/// whatever its status, is `Ok`.
pub trait HttpClient: Send + Sync {
    fn execute(&self, request: HttpRequest) -> std::result::Result<HttpResponse, String>;
}

/// The headers every request carries besides the token.
///
/// `Client-Lang-Version` is the version of the compiler that built the crate.
pub fn client_headers() -> BTreeMap<String, String> {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_default();
    btreemap! {
        "Client-Lang".to_string() => "rust".to_string(),
        "Client-Lang-Version".to_string() =>
            option_env!("FLAGSYNC_RUSTC_VERSION").unwrap_or("unknown").to_string(),
        "Client-Platform".to_string() =>
            format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS),
        "Client-Hostname".to_string() => host,
        "Client-Version".to_string() => env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// A remote flag store reached over the flag service's HTTP adapter API.
pub struct HttpStore {
    url: String,
    client: Arc<dyn HttpClient>,
    headers: BTreeMap<String, String>,
    timeouts: Timeouts,
    debug_output: Option<DebugOutput>,
}

impl HttpStore {
    pub fn new(url: impl Into<String>, client: Arc<dyn HttpClient>) -> Self {
        let url = url.into();
        HttpStore {
            url: url.trim_end_matches('/').to_string(),
            client,
            headers: client_headers(),
            timeouts: Timeouts::default(),
            debug_output: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn debug_output(mut self, output: DebugOutput) -> Self {
        self.debug_output = Some(output);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    fn feature_path(key: &str) -> String {
        format!("/features/{}", urlencoding::encode(key))
    }

    fn gate_path(key: &str, kind: GateKind) -> String {
        format!("{}/{}", Self::feature_path(key), kind.key())
    }

    fn send(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse> {
        let mut headers = self.headers.clone();
        let body = match body {
            Some(value) => {
                headers.insert("Content-Type".to_string(), "application/json".to_string());
                Some(serde_json::to_vec(value)?)
            }
            None => None,
        };
        let request = HttpRequest {
            method,
            url: format!("{}{}", self.url, path),
            headers,
            body,
            timeouts: self.timeouts,
        };
        debug!("{} {}", request.method, request.url);

        let (method, url) = (request.method, request.url.clone());
        let result = self.client.execute(request);
        if let Some(output) = &self.debug_output {
            let mut output = output.lock();
            let _ = match &result {
                Ok(response) => writeln!(output, "{} {} -> {}", method, url, response.status),
                Err(e) => writeln!(output, "{} {} failed: {}", method, url, e),
            };
        }
        result.map_err(|e| Error::unreachable(operation, e))
    }

    fn call(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse> {
        let response = self.send(operation, method, path, body)?;
        if !response.is_success() {
            return Err(Error::UnexpectedStatus {
                operation: operation.to_string(),
                status: response.status,
            });
        }
        Ok(response)
    }
}

impl FlagStore for HttpStore {
    fn name(&self) -> &str {
        "http"
    }

    fn get(&self, key: &str) -> Result<Option<Feature>> {
        let response = self.send("get", Method::Get, &Self::feature_path(key), None)?;
        match response.status {
            404 => Ok(None),
            _ if response.is_success() => Ok(Some(serde_json::from_slice(&response.body)?)),
            status => Err(Error::UnexpectedStatus {
                operation: "get".to_string(),
                status,
            }),
        }
    }

    fn get_all(&self) -> Result<Snapshot> {
        let response = self.call(
            "get_all",
            Method::Get,
            "/features?exclude_gate_names=true",
            None,
        )?;
        Ok(serde_json::from_slice(&response.body)?)
    }

    fn add(&self, key: &str) -> Result<()> {
        self.call("add", Method::Post, "/features", Some(&json!({ "name": key })))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.call("remove", Method::Delete, &Self::feature_path(key), None)?;
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        let path = format!("{}/clear", Self::feature_path(key));
        self.call("clear", Method::Delete, &path, None)?;
        Ok(())
    }

    fn enable(&self, key: &str, gate: &GateValue) -> Result<()> {
        gate.validate()?;
        let path = Self::gate_path(key, gate.kind());
        self.call("enable", Method::Post, &path, Some(&gate.wire_body()))?;
        Ok(())
    }

    fn disable(&self, key: &str, gate: &GateValue) -> Result<()> {
        let path = Self::gate_path(key, gate.kind());
        match gate {
            // percentages are disabled by setting them back to zero
            GateValue::PercentageOfActors(_) | GateValue::PercentageOfTime(_) => self.call(
                "disable",
                Method::Post,
                &path,
                Some(&json!({ "percentage": "0" })),
            )?,
            _ => self.call("disable", Method::Delete, &path, Some(&gate.wire_body()))?,
        };
        Ok(())
    }

    fn import(&self, snapshot: &Snapshot) -> Result<()> {
        let body = serde_json::to_value(snapshot)?;
        self.call("import", Method::Post, "/import", Some(&body))?;
        Ok(())
    }
}
