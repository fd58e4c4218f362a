//! HTTP API.
//!
//! ## Endpoints
//!
//! - `POST /api/generate`, `/api/chat`, `/api/embeddings`, `/api/embed` - native inference
//! - `GET /api/tags`, `/api/ps`, `/api/version`, `POST /api/show` - listing and introspection
//! - `POST /v1/chat/completions`, `/v1/completions`, `/v1/embeddings` - OpenAI-compatible inference
//! - `GET /v1/models[/:model]` - OpenAI-compatible model listing
//! - `/api/orchestrator/*` - control plane (servers, queue, circuit breakers, bans)
//! - `GET /api/health` - liveness and fleet summary

mod auth;
mod control;
mod inference;
mod openai;
mod routes;
mod types;

pub use routes::{serve, AppState};
