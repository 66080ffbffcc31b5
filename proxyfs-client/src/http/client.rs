// Copyright 2025 OPPO.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::http::selector::{Host, Selector};
use log::{debug, error, warn};
use proxyfs_common::conf::ClientConf;
use proxyfs_common::proto::*;
use proxyfs_common::utils::now_ms;
use proxyfs_common::{FsError, FsResult};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

const MAX_REDIRECT_TIMES: usize = 10;

/// JSON-over-HTTP POST transport to the proxy. Handles identity headers,
/// host rotation on transport failure, and permanent redirects. Retry with
/// backoff is the caller's concern.
pub struct HttpClient {
    client: reqwest::Client,
    selector: Selector,
    client_id: String,
    user_id: String,
    user_token: String,
    app_id: String,
    dev_id: String,
    package_name: String,
    client_tag: String,
}

impl HttpClient {
    pub fn new(conf: &ClientConf, client_id: String) -> FsResult<Self> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        if conf.http.client_timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(conf.http.client_timeout_ms));
        }
        let client = builder
            .build()
            .map_err(|e| FsError::common(format!("build http client: {}", e)))?;

        let selector = Selector::new(conf.hosts(), conf.http.try_times, conf.http.fails_period_s)?;

        Ok(Self {
            client,
            selector,
            client_id,
            user_id: conf.user_id.clone(),
            user_token: conf.user_token.clone(),
            app_id: conf.app_id.clone(),
            dev_id: conf.dev_id.clone(),
            package_name: conf.package_name.clone(),
            client_tag: conf.client_tag.clone(),
        })
    }

    fn headers(&self, req_id: &str) -> HeaderMap {
        fn value(s: &str) -> HeaderValue {
            HeaderValue::from_str(s).unwrap_or_else(|_| HeaderValue::from_static(""))
        }

        let mut h = HeaderMap::new();
        h.insert("Content-Type", HeaderValue::from_static("application/json"));
        h.insert("accept", HeaderValue::from_static("application/json"));
        h.insert(HDR_REQ_ID, value(req_id));
        h.insert(HDR_USER_ID, value(&self.user_id));
        h.insert(HDR_TOKEN, value(&self.user_token));
        h.insert(HDR_APP_ID, value(&self.app_id));
        h.insert(HDR_DEV_ID, value(&self.dev_id));
        h.insert(HDR_PKG_NAME, value(&self.package_name));
        h.insert(HDR_CLIENT_LABEL, value(&self.client_tag));
        h.insert(HDR_CLIENT_ID, value(&self.client_id));
        h.insert(HDR_TS, value(&now_ms().to_string()));
        h
    }

    /// One logical POST: serialize once, then walk hosts/redirects until a
    /// decodable reply, a terminal failure, or host exhaustion.
    pub async fn post_json<P, R>(&self, uri: &str, params: &P) -> FsResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let body = serde_json::to_vec(params)?;
        let req_id = uuid::Uuid::new_v4().to_string();

        let (mut host, mut cursor) = self.selector.get();
        let try_times = self.selector.try_times();

        let mut redirects = 0usize;
        let mut tries = 0usize;
        let mut promote = false;

        loop {
            let url = format!("{}{}", host.raw(), uri);
            let result = self
                .client
                .post(&url)
                .headers(self.headers(&req_id))
                .body(body.clone())
                .send()
                .await;

            let resp = match result {
                Ok(resp) => resp,
                Err(e) => {
                    if !should_retry(&e) {
                        return Err(FsError::transport(format!("{} {}: {}", req_id, url, e), false));
                    }

                    warn!("retry host after transport error, req {} url {}: {}", req_id, url, e);
                    host.set_fail();
                    tries += 1;
                    match cursor.next() {
                        Some(next) if tries < try_times => {
                            host = next;
                            promote = true;
                            continue;
                        }
                        _ => {
                            error!("no more hosts to try, req {} url {}", req_id, url);
                            return Err(FsError::transport(
                                format!("{} {}: {}", req_id, url, e),
                                true,
                            ));
                        }
                    }
                }
            };

            let code = resp.status();
            if code == StatusCode::PERMANENT_REDIRECT {
                let loc = resp
                    .headers()
                    .get("Location")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let next = parse_redirect_host(host.raw(), &loc)
                    .ok_or_else(|| FsError::transport(format!("bad redirect {:?}", loc), false))?;

                redirects += 1;
                if redirects >= MAX_REDIRECT_TIMES {
                    warn!("over max redirect times {} for {}", redirects, uri);
                    return Err(FsError::transport(
                        format!("stopped after {} redirects", MAX_REDIRECT_TIMES),
                        false,
                    ));
                }

                debug!("redirect {} -> {}", host.raw(), next);
                host = Arc::new(Host::new(next));
                promote = true;
                continue;
            }

            if code.as_u16() >= 400 {
                error!("abnormal http status {} for {}{}", code, host.raw(), uri);
                return Err(FsError::transport(
                    format!("http status {} for {}", code, uri),
                    false,
                ));
            }

            let bytes = resp
                .bytes()
                .await
                .map_err(|e| FsError::transport(format!("read body: {}", e), true))?;
            let decoded: R = serde_json::from_slice(&bytes)?;

            if promote {
                self.selector.promote(&host);
            }
            return Ok(decoded);
        }
    }
}

/// Transport errors worth rotating hosts for: timeouts and the classic
/// broken-connection family.
pub fn should_retry(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }

    let text = format!("{:?}", err);
    text.contains("connection refused")
        || text.contains("use of closed network connection")
        || text.contains("connection reset by peer")
        || text.contains("EOF")
}

/// Absolute redirect locations move the host; relative ones keep it.
fn parse_redirect_host(current: &str, location: &str) -> Option<String> {
    if location.is_empty() {
        return None;
    }
    if let Some(rest) = location
        .strip_prefix("http://")
        .map(|r| ("http", r))
        .or_else(|| location.strip_prefix("https://").map(|r| ("https", r)))
    {
        let (scheme, rest) = rest;
        let host = rest.split('/').next()?;
        if host.is_empty() {
            return None;
        }
        return Some(format!("{}://{}", scheme, host));
    }
    Some(current.to_string())
}
