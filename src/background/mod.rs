//! The privileged side of the bridge: holds credentials and performs the
//! actual network calls on behalf of UI surfaces.

pub mod refresh;
pub mod service;
pub mod sse;

pub use refresh::{RefreshGate, ServerTokenRefresher, TokenRefresher};
pub use service::{BackgroundService, missing_paths};
pub use sse::{SseDecoder, SseLine};
