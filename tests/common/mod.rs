// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Source stores with failure injection
//! - A recording destination for the queue family
//! - Reference source/sink doubles for the cursor family
//! - Engine builders over temp-dir SQLite files

#![allow(dead_code)]

pub mod mock_source;

pub use mock_source::*;

use replay_engine::{ReplayConfig, ReplayEngine};
use std::sync::Arc;
use tempfile::TempDir;

/// Engine over flaky source stores, sharing handles with the caller.
pub type TestEngine = ReplayEngine<Arc<FlakyDocumentStore>, Arc<FlakyArtifactStore>>;

/// Test config pointing at a SQLite file inside `dir`.
pub fn file_config(dir: &TempDir, instance_id: &str) -> ReplayConfig {
    let mut config = ReplayConfig::for_testing(instance_id);
    config.store.sqlite_path = dir.path().join("replay.db").to_string_lossy().to_string();
    config.store.wal_mode = true;
    config
}

/// Build (but don't start) an engine plus handles to its source stores.
pub fn test_engine(
    config: ReplayConfig,
) -> (TestEngine, Arc<FlakyDocumentStore>, Arc<FlakyArtifactStore>) {
    let documents = Arc::new(FlakyDocumentStore::new());
    let artifacts = Arc::new(FlakyArtifactStore::new());
    let engine = ReplayEngine::with_sources(config, Arc::clone(&documents), Arc::clone(&artifacts));
    (engine, documents, artifacts)
}

/// Start an engine sharing `documents`/`artifacts` with other engines.
pub async fn started_engine_sharing(
    config: ReplayConfig,
    documents: &Arc<FlakyDocumentStore>,
    artifacts: &Arc<FlakyArtifactStore>,
) -> TestEngine {
    let engine = ReplayEngine::with_sources(config, Arc::clone(documents), Arc::clone(artifacts));
    engine.start().await.expect("engine should start");
    engine
}
