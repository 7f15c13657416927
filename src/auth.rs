use std::collections::HashMap;

use axum::http::{header::AUTHORIZATION, HeaderMap};

use crate::{error::AnalysisError, models::Caller};

const API_KEY_HEADER: &str = "x-api-key";

/// Resolves the caller behind the request's API key. Requests without a key
/// are anonymous; a key that is present but unknown is rejected.
pub fn resolve_caller(
    headers: &HeaderMap,
    keys: &HashMap<String, Caller>,
) -> Result<Option<Caller>, AnalysisError> {
    let Some(key) = extract_api_key(headers)? else {
        return Ok(None);
    };

    match keys.get(key.trim()) {
        Some(caller) => Ok(Some(caller.clone())),
        None => Err(AnalysisError::InvalidApiKey),
    }
}

pub fn require_caller(
    headers: &HeaderMap,
    keys: &HashMap<String, Caller>,
) -> Result<Caller, AnalysisError> {
    resolve_caller(headers, keys)?.ok_or(AnalysisError::MissingApiKey)
}

pub fn extract_api_key(headers: &HeaderMap) -> Result<Option<String>, AnalysisError> {
    if let Some(raw) = headers.get(API_KEY_HEADER) {
        let Ok(value) = raw.to_str() else {
            return Err(AnalysisError::InvalidApiKey);
        };
        return Ok(Some(value.to_string()));
    }

    let Some(raw_header) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };

    let Ok(value) = raw_header.to_str() else {
        return Err(AnalysisError::InvalidApiKey);
    };

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(AnalysisError::InvalidApiKey);
    };

    Ok(Some(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn keys() -> HashMap<String, Caller> {
        HashMap::from([(
            "secret".to_string(),
            Caller {
                owner: "alice".to_string(),
                max_concurrent_analyses: Some(1),
            },
        )])
    }

    #[test]
    fn missing_key_is_anonymous() {
        let caller = resolve_caller(&HeaderMap::new(), &keys()).expect("anonymous");
        assert!(caller.is_none());
        assert!(matches!(
            require_caller(&HeaderMap::new(), &keys()),
            Err(AnalysisError::MissingApiKey)
        ));
    }

    #[test]
    fn bearer_and_header_keys_resolve() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        let caller = resolve_caller(&headers, &keys()).expect("known").expect("caller");
        assert_eq!(caller.owner, "alice");

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("secret"));
        assert!(resolve_caller(&headers, &keys()).expect("known").is_some());
    }

    #[test]
    fn unknown_key_is_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer nope"));
        assert!(matches!(
            resolve_caller(&headers, &keys()),
            Err(AnalysisError::InvalidApiKey)
        ));
    }
}
