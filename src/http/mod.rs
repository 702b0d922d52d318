//! HTTP layer for the mirror cache.
//!
//! This module provides the axum-based server that accepts git smart-HTTP
//! requests, hands them to [`crate::proxy::MirrorProxy`], and streams the
//! `upload-pack` output back to the client.

pub mod handler;
