use reqwest::Error as ReqwestError;
use serde::de::StdError;
use std::fmt;

/// Failure of a single provider call. Never leaves the engine: every
/// variant sends the request down the fallback chain.
#[derive(Debug)]
pub enum ProviderError {
    RequestError(ReqwestError),
    EndpointError(url::ParseError),
    ApiError(String),
    InvalidResponse(String),
    Unavailable(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::RequestError(err) => write!(f, "Request error: {}", err),
            ProviderError::EndpointError(err) => write!(f, "Invalid endpoint: {}", err),
            ProviderError::ApiError(msg) => write!(f, "API error: {}", msg),
            ProviderError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            ProviderError::Unavailable(msg) => write!(f, "Provider unavailable: {}", msg),
        }
    }
}

impl StdError for ProviderError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ProviderError::RequestError(err) => Some(err),
            ProviderError::EndpointError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ReqwestError> for ProviderError {
    fn from(error: ReqwestError) -> Self {
        ProviderError::RequestError(error)
    }
}

impl From<url::ParseError> for ProviderError {
    fn from(error: url::ParseError) -> Self {
        ProviderError::EndpointError(error)
    }
}
