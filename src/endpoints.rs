//! Endpoint allow-list.
//!
//! The privileged process only ever calls the server through a closed set of
//! method + path combinations. Anything not in [`ENDPOINTS`] is rejected before
//! any I/O happens, on both sides of the bridge.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// HTTP methods the bridge can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }

    pub(crate) fn to_reqwest(self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            _ => Err(ValidationError::InvalidMethod(s.to_string())),
        }
    }
}

/// Endpoint families with their own timeout settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Chat,
    Rag,
    Media,
    General,
}

/// One allow-listed endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub method: Method,
    /// Path template; `{name}` segments match one non-empty segment.
    pub template: &'static str,
    pub class: EndpointClass,
}

const fn ep(method: Method, template: &'static str, class: EndpointClass) -> Endpoint {
    Endpoint {
        method,
        template,
        class,
    }
}

use EndpointClass::{Chat, General, Media, Rag};
use Method::{Delete, Get, Post, Put};

/// The registry.
pub static ENDPOINTS: &[Endpoint] = &[
    ep(Get, "/openapi.json", General),
    ep(Get, "/api/v1/health", General),
    ep(Post, "/api/v1/auth/login", General),
    ep(Post, "/api/v1/auth/refresh", General),
    ep(Post, "/api/v1/auth/logout", General),
    // Chat
    ep(Post, "/api/v1/chat/completions", Chat),
    ep(Get, "/api/v1/chat/dictionaries", Chat),
    ep(Get, "/api/v1/characters/world-books", General),
    // Models
    ep(Get, "/api/v1/llm/models", General),
    ep(Get, "/api/v1/llm/models/metadata", General),
    ep(Get, "/api/v1/llm/providers", General),
    // RAG
    ep(Post, "/api/v1/rag/search", Rag),
    ep(Post, "/api/v1/rag/search/stream", Rag),
    // Media
    ep(Get, "/api/v1/media/", Media),
    ep(Post, "/api/v1/media/add", Media),
    ep(Post, "/api/v1/media/process-videos", Media),
    ep(Post, "/api/v1/media/process-audios", Media),
    ep(Post, "/api/v1/media/process-pdfs", Media),
    ep(Post, "/api/v1/media/process-ebooks", Media),
    ep(Post, "/api/v1/media/process-documents", Media),
    ep(Post, "/api/v1/media/process-web-scraping", Media),
    ep(Get, "/api/v1/media/{id}", Media),
    ep(Get, "/api/v1/media/{id}/versions", Media),
    ep(Get, "/api/v1/media/{id}/versions/{version}", Media),
    ep(Delete, "/api/v1/media/{id}/versions/{version}", Media),
    ep(Post, "/api/v1/media/{id}/versions/rollback", Media),
    // Reading list
    ep(Post, "/api/v1/reading/save", General),
    ep(Get, "/api/v1/reading/items", General),
    // Audio
    ep(Post, "/api/v1/audio/transcriptions", Media),
    ep(Post, "/api/v1/audio/speech", Media),
    // Notes
    ep(Get, "/api/v1/notes/", General),
    ep(Post, "/api/v1/notes/", General),
    ep(Get, "/api/v1/notes/search/", General),
    ep(Get, "/api/v1/notes/keywords/", General),
    ep(Get, "/api/v1/notes/keywords/search/", General),
    ep(Get, "/api/v1/notes/{id}", General),
    ep(Put, "/api/v1/notes/{id}", General),
    ep(Delete, "/api/v1/notes/{id}", General),
    // Flashcards
    ep(Get, "/api/v1/flashcards", General),
    ep(Post, "/api/v1/flashcards", General),
    ep(Get, "/api/v1/flashcards/decks", General),
];

/// Paths whose absence from the server's OpenAPI document is worth a warning.
pub const CRITICAL_PATHS: &[&str] = &[
    "/api/v1/chat/completions",
    "/api/v1/rag/search",
    "/api/v1/rag/search/stream",
    "/api/v1/media/add",
    "/api/v1/media/process-videos",
    "/api/v1/media/process-audios",
    "/api/v1/media/process-pdfs",
    "/api/v1/media/process-ebooks",
    "/api/v1/media/process-documents",
    "/api/v1/media/process-web-scraping",
    "/api/v1/reading/save",
    "/api/v1/reading/items",
    "/api/v1/audio/transcriptions",
    "/api/v1/audio/speech",
    "/api/v1/llm/models",
    "/api/v1/llm/models/metadata",
    "/api/v1/llm/providers",
    "/api/v1/notes/",
    "/api/v1/notes/search/",
    "/api/v1/flashcards",
    "/api/v1/flashcards/decks",
    "/api/v1/characters/world-books",
    "/api/v1/chat/dictionaries",
];

/// Look up the registry entry for a method + path, failing closed.
pub fn resolve(method: Method, path: &str) -> Result<&'static Endpoint, ValidationError> {
    let route = route_of(path)?;
    ENDPOINTS
        .iter()
        .find(|ep| ep.method == method && template_matches(ep.template, route))
        .ok_or_else(|| ValidationError::UnknownEndpoint {
            method,
            path: path.to_string(),
        })
}

/// Path without its query string, after structural checks.
fn route_of(path: &str) -> Result<&str, ValidationError> {
    let route = path.split(['?', '#']).next().unwrap_or_default();
    if !route.starts_with('/') || route.split('/').any(is_dot_segment) {
        return Err(ValidationError::InvalidPath(path.to_string()));
    }
    Ok(route)
}

/// `.` and `..` in any spelling the URL parser would normalize away,
/// including percent-encoded dots.
fn is_dot_segment(segment: &str) -> bool {
    segment == "."
        || segment == ".."
        || segment.to_ascii_lowercase().contains("%2e")
}

fn template_matches(template: &str, route: &str) -> bool {
    let mut expected = template.split('/');
    let mut actual = route.split('/');
    loop {
        match (expected.next(), actual.next()) {
            (None, None) => return true,
            (Some(t), Some(a)) => {
                let is_param = t.starts_with('{') && t.ends_with('}');
                if is_param {
                    if a.is_empty() {
                        return false;
                    }
                } else if t != a {
                    return false;
                }
            }
            _ => return false,
        }
    }
}
