// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end tests of [`SessionManager`] against the mock vTPM service.

/// Connect, reconnect and disconnect, including handshake failures.
mod lifecycle_tests;

/// Secured traffic and session tear-down on integrity failures.
mod traffic_tests;


use crate::SessionConfig;
use crate::SessionManager;
use crate::test_helpers::MockMeasurementLog;
use crate::test_helpers::MockSessionEngine;
use crate::test_helpers::MockVerifier;
use crate::test_helpers::MockVtpmService;
use tracing_subscriber::EnvFilter;

pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .with_test_writer()
        .try_init();
}

/// A manager wired to mocks, with the test's handles on them.
pub(crate) struct TestRig {
    pub manager: SessionManager,
    pub service: MockVtpmService,
    pub engine: MockSessionEngine,
    pub verifier: MockVerifier,
    pub log: MockMeasurementLog,
}

pub(crate) fn rig() -> TestRig {
    rig_with(SessionConfig::default())
}

pub(crate) fn rig_with(config: SessionConfig) -> TestRig {
    init_logging();
    let service = MockVtpmService::new(&config);
    let engine = MockSessionEngine::new();
    let verifier = MockVerifier::new();
    let log = MockMeasurementLog::new();
    let manager = SessionManager::new(
        config,
        Box::new(engine.clone()),
        Box::new(verifier.clone()),
        Box::new(log.clone()),
        Box::new(service.clone()),
    )
    .unwrap();
    TestRig {
        manager,
        service,
        engine,
        verifier,
        log,
    }
}
