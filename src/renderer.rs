use crate::error::RenderError;
use crate::models::ResponseVariant;
use crate::request::RequestFacts;
use crate::templating;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;

#[derive(Debug, Clone)]
pub struct RenderedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl RenderedResponse {
    pub fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Builds the response of a matched variant. Pure given its inputs.
///
/// Instance headers apply first; a variant header replaces any instance header of the same
/// name, and `contentType` replaces any `Content-Type` header.
pub fn render(
    variant: &ResponseVariant,
    instance_headers: &[(String, String)],
    facts: &RequestFacts,
) -> Result<RenderedResponse, RenderError> {
    let status = StatusCode::from_u16(variant.status_code)
        .map_err(|_| RenderError::Status(variant.status_code))?;

    let mut headers = HeaderMap::new();
    apply_headers(&mut headers, instance_headers)?;

    let mut overridden = HeaderMap::new();
    apply_headers(&mut overridden, &variant.headers)?;
    for name in overridden.keys() {
        headers.remove(name);
    }
    for (name, value) in overridden.iter() {
        headers.append(name.clone(), value.clone());
    }

    if let Some(ref content_type) = variant.content_type {
        let value = HeaderValue::from_str(content_type).map_err(|e| RenderError::Header {
            name: header::CONTENT_TYPE.to_string(),
            reason: e.to_string(),
        })?;
        headers.insert(header::CONTENT_TYPE, value);
    }

    let body = templating::resolve_template(&variant.body, facts)?;
    Ok(RenderedResponse {
        status,
        headers,
        body,
    })
}

fn apply_headers(target: &mut HeaderMap, pairs: &[(String, String)]) -> Result<(), RenderError> {
    for (key, value) in pairs {
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| RenderError::Header {
            name: key.clone(),
            reason: e.to_string(),
        })?;
        let value = HeaderValue::from_str(value).map_err(|e| RenderError::Header {
            name: key.clone(),
            reason: e.to_string(),
        })?;
        target.append(name, value);
    }
    Ok(())
}
