use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use uuid::Uuid;

use crate::connection::ConnContext;

/// One client request as the addon pipeline sees it. The URL is absolute
/// at this layer on both the plaintext and the terminated-TLS path.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    /// Present once the body is buffered; `None` while unread or when the
    /// exchange runs in streaming mode.
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// The record for one request/response exchange. Addons receive a mutable
/// reference during their hooks and must not retain it past the call.
pub struct Flow {
    pub id: Uuid,
    pub request: Request,
    /// Populating this from a `request_headers` or `request` hook
    /// short-circuits the exchange: the response is written to the client
    /// and no upstream request is issued.
    pub response: Option<Response>,
    /// Set when the exchange was promoted to streaming mode; the
    /// materialised-body hooks are skipped for streamed directions.
    pub stream: bool,
    pub finished: bool,
    conn: Arc<ConnContext>,
}

impl Flow {
    pub(crate) fn new(request: Request, conn: Arc<ConnContext>) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            response: None,
            stream: false,
            finished: false,
            conn,
        }
    }

    pub fn conn_context(&self) -> &ConnContext {
        &self.conn
    }

    pub(crate) fn finish(&mut self) {
        self.finished = true;
    }
}
