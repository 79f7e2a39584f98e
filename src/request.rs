use crate::models::RequestSummary;
use axum::extract::Query;
use axum::http::request::Parts;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Read-only facts about one incoming request, shared by the sandbox and the renderer.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestFacts {
    pub method: String,
    pub path: String,
    pub url: String,
    pub raw_query: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub json: Option<Value>,
    pub params: BTreeMap<String, String>,
}

impl RequestFacts {
    pub fn from_parts(parts: &Parts, body: &[u8]) -> Self {
        let path = parts.uri.path().to_string();
        let raw_query = parts.uri.query().unwrap_or_default().to_string();
        let query = Query::<BTreeMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .unwrap_or_default();

        let mut headers = BTreeMap::new();
        for (name, value) in &parts.headers {
            let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let body = String::from_utf8_lossy(body).into_owned();
        let json = serde_json::from_str(&body).ok();
        let url = match parts.uri.path_and_query() {
            Some(pq) => pq.as_str().to_string(),
            None => path.clone(),
        };

        Self {
            method: parts.method.as_str().to_string(),
            path,
            url,
            raw_query,
            query,
            headers,
            body,
            json,
            params: BTreeMap::new(),
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// Non-empty path segments, used by `{{path[N]}}` placeholders.
    pub fn path_segments(&self) -> Vec<&str> {
        self.path.split('/').filter(|s| !s.is_empty()).collect()
    }

    pub fn summary(&self) -> RequestSummary {
        RequestSummary {
            method: self.method.clone(),
            url: self.path.clone(),
            query: self.raw_query.clone(),
            body: (!self.body.is_empty()).then(|| self.body.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn facts(builder: axum::http::request::Builder, body: &str) -> RequestFacts {
        let (parts, _) = builder.body(()).unwrap().into_parts();
        RequestFacts::from_parts(&parts, body.as_bytes())
    }

    #[test]
    fn parses_query_headers_and_json_body() {
        let f = facts(
            Request::builder()
                .method("POST")
                .uri("/orders/7?expand=items&page=2")
                .header("X-Trace", "abc")
                .header("accept", "a")
                .header("accept", "b"),
            r#"{"qty": 3}"#,
        );
        assert_eq!(f.method, "POST");
        assert_eq!(f.path, "/orders/7");
        assert_eq!(f.url, "/orders/7?expand=items&page=2");
        assert_eq!(f.raw_query, "expand=items&page=2");
        assert_eq!(f.query.get("page").map(String::as_str), Some("2"));
        assert_eq!(f.headers.get("x-trace").map(String::as_str), Some("abc"));
        assert_eq!(f.headers.get("accept").map(String::as_str), Some("a, b"));
        assert_eq!(f.json, Some(serde_json::json!({ "qty": 3 })));
        assert_eq!(f.path_segments(), vec!["orders", "7"]);
    }

    #[test]
    fn summary_omits_empty_body() {
        let f = facts(Request::builder().uri("/ping?x=1"), "");
        let summary = f.summary();
        assert_eq!(summary.url, "/ping");
        assert_eq!(summary.query, "x=1");
        assert_eq!(summary.body, None);
        assert_eq!(f.json, None);
    }
}
