//! Loopback HTTP front end for the control surface.
//!
//! One request per connection. Each connection gets its own thread so a slow
//! model download does not hold up status polling. Bodies are JSON; field
//! names from the legacy dashboard are accepted as aliases.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::service::{ControlSurface, FeedService};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    service: Arc<FeedService>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, service: Arc<FeedService>) -> Self {
        Self { cfg, service }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let service = self.service;
        let join = std::thread::Builder::new()
            .name("oilwatch-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, service, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })
            .context("spawn api thread")?;
        log::info!("control api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    service: Arc<FeedService>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let service = Arc::clone(&service);
                let spawned = std::thread::Builder::new()
                    .name("oilwatch-api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &service) {
                            log::warn!("control api request rejected: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("dropping connection from {}: {}", peer, err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, service: &FeedService) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };
    log::debug!("{} {}", request.method, request.path);

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", "/api/status") => write_json(&mut stream, 200, &service.status()),
        ("GET", "/api/get_frame") => write_json(&mut stream, 200, &service.current_frame()),
        ("POST", "/api/load_model") => match request.json::<LoadModelBody>() {
            Ok(body) => {
                let variant = body.variant.as_ref().and_then(wire_string);
                let percent = match body.confidence.as_ref().map(wire_int).transpose() {
                    Ok(percent) => percent,
                    Err(err) => return write_bad_request(&mut stream, &err.to_string()),
                };
                let Some(variant) = variant else {
                    return write_bad_request(&mut stream, "missing field 'model'");
                };
                write_json(&mut stream, 200, &ControlSurface::load_model(service, &variant, percent))
            }
            Err(err) => write_bad_request(&mut stream, &err.to_string()),
        },
        ("POST", "/api/setup_camera") => match request.json::<SetupCameraBody>() {
            Ok(body) => {
                let kind = body.source_kind.as_ref().and_then(wire_string);
                let address = body
                    .address
                    .as_ref()
                    .and_then(wire_string)
                    .filter(|address| !address.trim().is_empty());
                let fps = match body.fps.as_ref().map(wire_int).transpose() {
                    Ok(fps) => fps,
                    Err(err) => return write_bad_request(&mut stream, &err.to_string()),
                };
                let Some(kind) = kind else {
                    return write_bad_request(&mut stream, "missing field 'camera'");
                };
                write_json(
                    &mut stream,
                    200,
                    &ControlSurface::configure_capture(service, &kind, address.as_deref(), fps),
                )
            }
            Err(err) => write_bad_request(&mut stream, &err.to_string()),
        },
        ("POST", "/api/start_detection") => {
            write_json(&mut stream, 200, &ControlSurface::start(service))
        }
        ("POST", "/api/stop_detection") => {
            write_json(&mut stream, 200, &ControlSurface::stop(service))
        }
        (_, "/health")
        | (_, "/api/status")
        | (_, "/api/get_frame")
        | (_, "/api/load_model")
        | (_, "/api/setup_camera")
        | (_, "/api/start_detection")
        | (_, "/api/stop_detection") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

#[derive(Debug, Default, Deserialize)]
struct LoadModelBody {
    #[serde(alias = "model")]
    variant: Option<Value>,
    #[serde(alias = "confidence_percent")]
    confidence: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct SetupCameraBody {
    #[serde(alias = "camera")]
    source_kind: Option<Value>,
    #[serde(alias = "ip_address")]
    address: Option<Value>,
    #[serde(alias = "target_fps")]
    fps: Option<Value>,
}

/// Strings pass through; numbers are rendered (`1` and `"1"` are the same variant).
fn wire_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn wire_int(value: &Value) -> Result<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| anyhow!("expected an integer, got {}", number)),
        Value::String(text) => text
            .trim()
            .parse()
            .with_context(|| format!("expected an integer, got '{}'", text)),
        other => Err(anyhow!("expected an integer, got {}", other)),
    }
}

// ----------------------------------------------------------------------------
// HTTP plumbing
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    /// An empty body reads as `{}`.
    fn json<T: for<'de> Deserialize<'de> + Default>(&self) -> Result<T> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(&self.body).context("invalid JSON body")
    }

    fn content_length(&self) -> Result<usize> {
        match self.headers.get("content-length") {
            Some(value) => value
                .parse()
                .with_context(|| format!("invalid content-length '{}'", value)),
            None => Ok(0),
        }
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_HEADER_BYTES + MAX_BODY_BYTES {
            return Err(anyhow!("request too large"));
        }
    };
    if header_end > MAX_HEADER_BYTES {
        return Err(anyhow!("request headers too large"));
    }

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();

    let mut request = HttpRequest {
        method: method.to_ascii_uppercase(),
        path,
        headers,
        body: data[header_end..].to_vec(),
    };
    let expected = request.content_length()?;
    if expected > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    while request.body.len() < expected {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        request.body.extend_from_slice(&buf[..n]);
    }
    request.body.truncate(expected);
    Ok(request)
}

fn write_bad_request(stream: &mut TcpStream, message: &str) -> Result<()> {
    let body = serde_json::json!({ "success": false, "message": message });
    write_json(stream, 400, &body)
}

fn write_json<T: serde::Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}
