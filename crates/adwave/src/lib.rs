//! Real-time personalized audio-ad generation server.
//!
//! One WebSocket session carries a batch of ad-generation jobs, one per
//! requested location. Each job runs a partially parallel stage pipeline
//! (insights, transcript, speech and music, merge) against external
//! collaborators, while custom-voice jobs arbitrate a bounded pool of
//! voice-cloning slots through a reserve-then-acquire protocol.

pub mod config;
pub mod pipeline;
pub mod protocol;
pub mod providers;
pub mod routes;
pub mod server;
pub mod session;
pub mod slots;
