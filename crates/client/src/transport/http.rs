// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Default HTTP provider: reqwest with rustls, responses consumed as a
//! chunked byte stream and re-split into protocol lines.

use std::time::Duration;

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    HttpTransport, LineSplitter, RequestHandle, RequestListener, StreamRequest, TransportOptions,
};

pub struct ReqwestTransport {
    _private: (),
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self { _private: () }
    }

    fn build_client(options: &TransportOptions) -> reqwest::Client {
        let mut builder = reqwest::Client::builder();
        if options.connect_timeout > Duration::ZERO {
            builder = builder.connect_timeout(options.connect_timeout);
        }
        if let Some(ref proxy) = options.proxy {
            let url = format!("http://{}:{}", proxy.host, proxy.port);
            if let Ok(mut p) = reqwest::Proxy::all(&url) {
                if let (Some(user), Some(password)) = (&proxy.user, &proxy.password) {
                    p = p.basic_auth(user, password);
                }
                builder = builder.proxy(p);
            }
        }
        builder.build().unwrap_or_default()
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for ReqwestTransport {
    fn send_request(
        &self,
        request: StreamRequest,
        mut listener: Box<dyn RequestListener>,
        options: &TransportOptions,
    ) -> RequestHandle {
        let cancel = CancellationToken::new();
        let guard = cancel.clone();
        let client = Self::build_client(options);
        let extra_headers = options.extra_headers.clone();
        let read_timeout = options.read_timeout;

        tokio::spawn(async move {
            let mut req = client
                .post(&request.url)
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(request.body);
            if let Some(headers) = extra_headers {
                for (name, value) in headers {
                    req = req.header(name, value);
                }
            }

            let response = tokio::select! {
                _ = guard.cancelled() => return,
                r = req.send() => r,
            };
            let mut stream = match response.and_then(|r| r.error_for_status()) {
                Ok(r) => r.bytes_stream(),
                Err(e) => {
                    debug!(url = %request.url, err = %e, "http request failed");
                    listener.on_broken();
                    return;
                }
            };
            listener.on_open();

            let mut splitter = LineSplitter::default();
            loop {
                let next = async {
                    if read_timeout > Duration::ZERO {
                        match tokio::time::timeout(read_timeout, stream.next()).await {
                            Ok(chunk) => chunk.map(|r| r.map_err(|e| e.to_string())),
                            Err(_) => Some(Err("read timeout".to_owned())),
                        }
                    } else {
                        stream.next().await.map(|r| r.map_err(|e| e.to_string()))
                    }
                };
                tokio::select! {
                    _ = guard.cancelled() => return,
                    chunk = next => match chunk {
                        Some(Ok(bytes)) => {
                            for line in splitter.feed(&bytes) {
                                listener.on_message(&line);
                            }
                        }
                        Some(Err(e)) => {
                            debug!(url = %request.url, err = %e, "http stream broken");
                            listener.on_broken();
                            return;
                        }
                        None => {
                            listener.on_closed();
                            return;
                        }
                    },
                }
            }
        });

        RequestHandle::new(cancel)
    }
}
