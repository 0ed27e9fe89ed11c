//! Integration tests for tickguard-bot.
//!
//! These tests verify the interaction between components:
//! - Stream connection lifecycle against a local WebSocket server
//! - Tick flow from market state into position protection
//! - Close commands landing in the journal

pub mod common;
