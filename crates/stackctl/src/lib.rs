//! stackctl - provisioning orchestrator for the chat application stack.
//!
//! Drives a fixed ten-stage deployment (storage, identity, secrets, vector
//! store, network, knowledge base, edge, compute) against the cloud
//! provider, with idempotent create-or-reuse semantics so a re-run after
//! any interruption converges on the same end state.

pub mod bootstrap;
pub mod commands;
pub mod conflict;
pub mod edge;
pub mod identity;
pub mod knowledge_base;
pub mod network;
pub mod poller;
pub mod provider;
pub mod registry;
pub mod sequencer;
pub mod storage;
pub mod teardown;
pub mod vector_store;
pub mod verify;
