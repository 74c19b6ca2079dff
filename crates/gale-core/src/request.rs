//! In-flight HTTP request data
//!
//! The immutable view of one parsed request, shared between the connection
//! task and the embedder's read accessors. Headers keep arrival order with
//! duplicates preserved; query parameters are decoded once at parse time.

use std::collections::HashMap;

use bytes::Bytes;
use smallvec::SmallVec;

use crate::codec;
use crate::handle::Handle;

/// Header list preserving arrival order and duplicate names.
pub(crate) type HeaderList = SmallVec<[(String, String); 16]>;

/// Everything known about one request once its head and body are parsed.
#[derive(Debug)]
pub(crate) struct RequestData {
    pub id: u64,
    pub server: Handle,
    pub method: String,
    pub path: String,
    pub headers: HeaderList,
    pub query: HashMap<String, String>,
    pub route_params: HashMap<String, String>,
    pub body: Bytes,
}

impl RequestData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        server: Handle,
        method: String,
        path: String,
        raw_query: Option<&str>,
        headers: &http::HeaderMap,
        route_params: Vec<(String, String)>,
        body: Bytes,
    ) -> Self {
        let mut header_list = HeaderList::new();
        for (name, value) in headers.iter() {
            header_list.push((
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            ));
        }
        Self {
            id,
            server,
            method,
            path,
            headers: header_list,
            query: codec::parse_query(raw_query.unwrap_or("")),
            route_params: route_params.into_iter().collect(),
            body,
        }
    }

    /// First value for `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Decoded query parameter; duplicates already collapsed to the last
    /// value at parse time.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Captured route parameter (`:name` segment).
    pub fn route_param(&self, name: &str) -> Option<&str> {
        self.route_params.get(name).map(String::as_str)
    }
}
