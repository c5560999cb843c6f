//! `fetch` host binding — spec §4.4 "capability surface: network".
//!
//! Grounded on `outlayer_rpc::host_functions_sync`'s blocking HTTP call made
//! from inside a synchronous host-function callback (the sandbox itself runs
//! off the async executor via `tokio::spawn_blocking`, so a blocking client
//! here does not stall the runtime). Host suffix allowlisting, private/
//! loopback/link-local denial, and per-host rate limiting are new: the
//! teacher's outlayer trusted every URL a script passed it because the
//! script source itself was already vetted upstream; this bridge has no such
//! guarantee and enforces policy at the call site.
//!
//! The script-facing `fetch(url, options)` takes a plain object for
//! `options`; rather than marshal that object's fields through `FromJs` on
//! the native side, a small JS shim (`install`'s prelude) destructures it and
//! forwards only primitive/string-map arguments to the native function,
//! the same string-only marshalling `bridge::crypto` already relies on.

use crate::error::EngineError;
use rquickjs::{Ctx, Function, Object};
use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use url::Url;

const MAX_REQUEST_BODY_BYTES: usize = 1 << 20; // 1 MiB
const MAX_RESPONSE_BODY_BYTES: u64 = 5 << 20; // 5 MiB
const DEFAULT_TIMEOUT_SECONDS: u32 = 10;
const MIN_TIMEOUT_SECONDS: u32 = 1;
const MAX_TIMEOUT_SECONDS: u32 = 30;

/// Headers a script may only attach when the target host is in the
/// deployment's further-restricted `fetch_sensitive_header_hosts` list,
/// spec §4.4.2.
const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie"];

#[derive(Default)]
struct RateWindow {
    window_start: Option<Instant>,
    count: u32,
}

struct Limiter {
    max_per_minute: u32,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl Limiter {
    /// Returns `Ok(())` or a `capability_denied` carrying a retry-after hint,
    /// spec §4.4.2 "exceeding it yields `capability_denied` with a
    /// retry-after hint".
    fn check(&self, host: &str) -> Result<(), EngineError> {
        let mut windows = self.windows.lock().unwrap();
        let entry = windows.entry(host.to_string()).or_default();
        let now = Instant::now();
        match entry.window_start {
            Some(start) if now.duration_since(start) < Duration::from_secs(60) => {
                if entry.count >= self.max_per_minute {
                    let retry_after = 60u64.saturating_sub(now.duration_since(start).as_secs());
                    return Err(EngineError::CapabilityDenied(format!(
                        "rate limit exceeded for host '{host}', retry after {retry_after}s"
                    )));
                }
                entry.count += 1;
                Ok(())
            }
            _ => {
                entry.window_start = Some(now);
                entry.count = 1;
                Ok(())
            }
        }
    }
}

/// Per-execution fetch policy, spec §6 "fetch policy".
#[derive(Clone)]
pub struct FetchPolicy {
    pub allowed_host_suffixes: Vec<String>,
    pub sensitive_header_hosts: Vec<String>,
    pub max_calls_per_host_per_minute: u32,
}

impl FetchPolicy {
    fn host_allowed(&self, host: &str) -> bool {
        self.allowed_host_suffixes
            .iter()
            .any(|suffix| host == suffix || host.ends_with(&format!(".{suffix}")))
    }

    fn may_carry_sensitive_headers(&self, host: &str) -> bool {
        self.sensitive_header_hosts
            .iter()
            .any(|h| host == h || host.ends_with(&format!(".{h}")))
    }
}

fn parse_method(method: Option<String>) -> Result<reqwest::Method, EngineError> {
    match method {
        None => Ok(reqwest::Method::GET),
        Some(m) => match m.to_ascii_uppercase().as_str() {
            "GET" => Ok(reqwest::Method::GET),
            "POST" => Ok(reqwest::Method::POST),
            "PUT" => Ok(reqwest::Method::PUT),
            "DELETE" => Ok(reqwest::Method::DELETE),
            "HEAD" => Ok(reqwest::Method::HEAD),
            "OPTIONS" => Ok(reqwest::Method::OPTIONS),
            other => Err(EngineError::InvalidInput(format!(
                "unsupported fetch method '{other}'"
            ))),
        },
    }
}

fn parse_timeout(seconds: Option<u32>) -> Result<Duration, EngineError> {
    match seconds {
        None => Ok(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS as u64)),
        Some(t) if (MIN_TIMEOUT_SECONDS..=MAX_TIMEOUT_SECONDS).contains(&t) => {
            Ok(Duration::from_secs(t as u64))
        }
        Some(t) => Err(EngineError::InvalidInput(format!(
            "timeoutSeconds {t} out of range [{MIN_TIMEOUT_SECONDS}, {MAX_TIMEOUT_SECONDS}]"
        ))),
    }
}

fn check_body_size(body: &Option<String>) -> Result<(), EngineError> {
    if let Some(b) = body {
        if b.len() > MAX_REQUEST_BODY_BYTES {
            return Err(EngineError::CapabilityDenied(format!(
                "request body of {} bytes exceeds max of {MAX_REQUEST_BODY_BYTES}",
                b.len()
            )));
        }
    }
    Ok(())
}

/// Categorically deny private, loopback, and link-local address ranges even
/// when the resolved host's name matches the allowlist, spec §4.4.2.
fn resolve_and_check_public(host: &str) -> Result<(), EngineError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return deny_if_non_public(ip);
    }

    let addrs = (host, 443u16)
        .to_socket_addrs()
        .map_err(|e| EngineError::CapabilityDenied(format!("could not resolve host '{host}': {e}")))?;
    for addr in addrs {
        deny_if_non_public(addr.ip())?;
    }
    Ok(())
}

fn deny_if_non_public(ip: IpAddr) -> Result<(), EngineError> {
    let denied = match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified() || v4.is_broadcast()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || is_unique_local_v6(&v6),
    };
    if denied {
        Err(EngineError::CapabilityDenied(format!(
            "fetch target '{ip}' resolves to a private/loopback/link-local address"
        )))
    } else {
        Ok(())
    }
}

fn is_unique_local_v6(v6: &std::net::Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

#[allow(clippy::too_many_arguments)]
fn do_fetch(
    limiter: &Limiter,
    policy: &FetchPolicy,
    url: &str,
    method: Option<String>,
    headers: Option<HashMap<String, String>>,
    body: Option<String>,
    timeout_seconds: Option<u32>,
) -> Result<FetchResponse, EngineError> {
    let parsed = Url::parse(url).map_err(|e| EngineError::InvalidInput(format!("invalid url: {e}")))?;
    if parsed.scheme() != "https" {
        return Err(EngineError::CapabilityDenied(
            "fetch only permits https URLs".into(),
        ));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| EngineError::InvalidInput("url has no host".into()))?
        .to_string();

    if !policy.host_allowed(&host) {
        return Err(EngineError::CapabilityDenied(format!(
            "host '{host}' is not in the fetch allowlist"
        )));
    }
    resolve_and_check_public(&host)?;
    limiter.check(&host)?;

    let method = parse_method(method)?;
    let timeout = parse_timeout(timeout_seconds)?;
    check_body_size(&body)?;

    let client = reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| EngineError::Internal(format!("failed to build fetch client: {e}")))?;

    let mut req = client.request(method, parsed);
    let may_carry_sensitive = policy.may_carry_sensitive_headers(&host);
    if let Some(headers) = headers {
        for (k, v) in headers {
            if !may_carry_sensitive && SENSITIVE_HEADERS.contains(&k.to_ascii_lowercase().as_str()) {
                continue;
            }
            req = req.header(k, v);
        }
    }
    if let Some(body) = body {
        req = req.body(body);
    }

    let resp = req
        .send()
        .map_err(|e| EngineError::Internal(format!("fetch failed: {e}")))?;

    if let Some(len) = resp.content_length() {
        if len > MAX_RESPONSE_BODY_BYTES {
            return Err(EngineError::CapabilityDenied(format!(
                "response body of {len} bytes exceeds max of {MAX_RESPONSE_BODY_BYTES}"
            )));
        }
    }

    let status = resp.status().as_u16();
    let status_text = resp.status().canonical_reason().unwrap_or("").to_string();
    let resp_headers: Vec<(String, String)> = resp
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or_default().to_string()))
        .collect();

    let bytes = resp
        .bytes()
        .map_err(|e| EngineError::Internal(format!("failed to read response body: {e}")))?;
    if bytes.len() as u64 > MAX_RESPONSE_BODY_BYTES {
        return Err(EngineError::CapabilityDenied(format!(
            "response body of {} bytes exceeds max of {MAX_RESPONSE_BODY_BYTES}",
            bytes.len()
        )));
    }
    let body = String::from_utf8_lossy(&bytes).into_owned();

    Ok(FetchResponse {
        status,
        status_text,
        headers: resp_headers,
        body,
    })
}

struct FetchResponse {
    status: u16,
    status_text: String,
    headers: Vec<(String, String)>,
    body: String,
}

/// Build the `{ok, status, statusText, headers, text(), json()}` surface
/// spec §4.4.2 describes. `json()` parses the captured body through
/// `JSON.parse` rather than hand-rolling a `serde_json::Value` -> JS value
/// conversion, reusing the embed-a-JSON-literal-and-eval pattern `sandbox.rs`
/// already relies on for the script's own return value.
fn response_to_js<'js>(ctx: &Ctx<'js>, resp: FetchResponse) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    obj.set("ok", (200..300).contains(&resp.status))?;
    obj.set("status", resp.status)?;
    obj.set("statusText", resp.status_text)?;

    let headers_obj = Object::new(ctx.clone())?;
    for (k, v) in &resp.headers {
        headers_obj.set(k.as_str(), v.as_str())?;
    }
    obj.set("headers", headers_obj)?;

    let text_body = resp.body.clone();
    let text_fn = Function::new(ctx.clone(), move || -> String { text_body.clone() });
    obj.set("text", text_fn)?;

    let json_body = resp.body;
    let json_fn = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'_>| -> rquickjs::Result<rquickjs::Value<'_>> {
            let literal = serde_json::to_string(&json_body).unwrap_or_else(|_| "\"\"".to_string());
            ctx.eval(format!("JSON.parse({literal})"))
        },
    );
    obj.set("json", json_fn)?;

    Ok(obj)
}

pub fn install(ctx: &Ctx<'_>, policy: FetchPolicy) -> Result<(), EngineError> {
    let limiter = Arc::new(Limiter {
        max_per_minute: policy.max_calls_per_host_per_minute,
        windows: Mutex::new(HashMap::new()),
    });

    let native = Function::new(
        ctx.clone(),
        move |ctx: Ctx<'_>,
              url: String,
              method: Option<String>,
              headers: Option<HashMap<String, String>>,
              body: Option<String>,
              timeout_seconds: Option<u32>|
              -> rquickjs::Result<Object<'_>> {
            match do_fetch(&limiter, &policy, &url, method, headers, body, timeout_seconds) {
                Ok(resp) => response_to_js(&ctx, resp),
                Err(e) => Err(super::throw_like(&ctx, &e)),
            }
        },
    );

    // `__native_fetch_tmp` is captured by the IIFE below and then deleted, so
    // no raw unmediated handle is reachable from script space afterward.
    ctx.globals()
        .set("__native_fetch_tmp", native)
        .map_err(|e| EngineError::Internal(e.to_string()))?;

    ctx.eval::<(), _>(
        r#"
        globalThis.fetch = (function (native) {
            return function fetch(url, options) {
                options = options || {};
                return native(url, options.method, options.headers, options.body, options.timeoutSeconds);
            };
        })(globalThis.__native_fetch_tmp);
        delete globalThis.__native_fetch_tmp;
        "#,
    )
    .map_err(|e| EngineError::Internal(format!("failed to install fetch shim: {e}")))?;

    Ok(())
}
