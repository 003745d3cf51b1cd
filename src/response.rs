use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::header::SET_COOKIE;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::util::truncate_body;

/// Wall-clock bounds of a logical request, as of the attempt that produced a
/// response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResponseTiming {
    started_at: SystemTime,
    finished_at: SystemTime,
    cost: Duration,
    attempts: usize,
}

impl ResponseTiming {
    pub(crate) fn new(started_at: SystemTime, finished_at: SystemTime, attempts: usize) -> Self {
        let cost = finished_at
            .duration_since(started_at)
            .unwrap_or(Duration::ZERO);
        Self {
            started_at,
            finished_at,
            cost,
            attempts,
        }
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn finished_at(&self) -> SystemTime {
        self.finished_at
    }

    pub fn cost(&self) -> Duration {
        self.cost
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

#[derive(Clone, Debug)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    timing: ResponseTiming,
}

impl HttpResponse {
    pub(crate) fn new(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        timing: ResponseTiming,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            timing,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// `(name, value)` pairs from every `Set-Cookie` header, attributes dropped.
    pub fn cookies(&self) -> Vec<(String, String)> {
        self.headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter_map(|raw| {
                let pair = raw.split(';').next()?.trim();
                let (name, value) = pair.split_once('=')?;
                let name = name.trim();
                if name.is_empty() {
                    return None;
                }
                Some((name.to_owned(), value.trim().trim_matches('"').to_owned()))
            })
            .collect()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }

    pub fn timing(&self) -> ResponseTiming {
        self.timing
    }

    pub fn started_at(&self) -> SystemTime {
        self.timing.started_at
    }

    pub fn finished_at(&self) -> SystemTime {
        self.timing.finished_at
    }

    pub fn cost(&self) -> Duration {
        self.timing.cost
    }

    /// Transport attempts made for the logical request, this one included.
    pub fn attempts(&self) -> usize {
        self.timing.attempts
    }

    #[cfg(test)]
    pub(crate) fn for_test(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let now = SystemTime::now();
        Self::new(status, headers, body, ResponseTiming::new(now, now, 1))
    }
}
