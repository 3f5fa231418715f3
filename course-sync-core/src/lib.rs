#![doc = "course-sync-core: change-reconciliation engine for course-sync."]

//! This crate contains the engine that keeps the course catalogue, the section
//! documents and the attachment container in step with a version-controlled
//! content repository. It holds no vendor clients; every backend is reached
//! through the traits in [`contract`].
//!
//! # Usage
//! Build a [`synchronise::Collaborators`] from concrete clients and call
//! [`synchronise::synchronise`] (or [`synchronise::plan`] for a dry run).

pub mod attachments;
pub mod changeset;
pub mod checkpoint;
pub mod classify;
pub mod config;
pub mod contract;
pub mod documents;
pub mod error;
pub mod relational;
pub mod snapshot;
pub mod synchronise;

#[cfg(any(test, feature = "test-export-mocks"))]
pub mod fakes;
