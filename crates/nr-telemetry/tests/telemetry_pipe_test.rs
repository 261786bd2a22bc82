// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg(unix)]

use mockito::Server;
use nr_telemetry::{
    batch::InvocationStore,
    dispatcher::{Dispatcher, InvocationEvent},
    flusher::{Flusher, FlusherConfig},
    ipc::init_telemetry_channel,
    license_key::LicenseKeyFactory,
};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn agent_writes_are_shipped_on_shutdown() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/aws/lambda/v1")
        .with_status(202)
        .expect(1)
        .create_async()
        .await;

    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let pipe_path = dir.path().join("newrelic-telemetry");
    let (rx, _reader) = init_telemetry_channel(&pipe_path).expect("failed to create pipe");

    let mut config = FlusherConfig::new(
        Arc::new(LicenseKeyFactory::new_from_static_key("mock-license-key")),
        "my-fn",
    );
    config.telemetry_endpoint_override = Some(format!("{}/aws/lambda/v1", server.url()));
    let store = Arc::new(InvocationStore::new(
        Duration::from_secs(7),
        Duration::from_secs(12),
        false,
    ));
    let flusher = Flusher::new(config).expect("failed to build flusher");
    let mut dispatcher = Dispatcher::new(Arc::clone(&store), flusher, rx, true);

    let event = InvocationEvent {
        request_id: "req-1".to_string(),
        invoked_function_arn: "arn:aws:lambda:us-east-1:123456789012:function:my-fn"
            .to_string(),
    };
    dispatcher.start_invocation(&event);

    let writer_path = pipe_path.clone();
    tokio::task::spawn_blocking(move || {
        let mut pipe = std::fs::OpenOptions::new()
            .write(true)
            .open(writer_path)
            .expect("failed to open pipe for writing");
        pipe.write_all(b"[1,\"NR_LAMBDA_MONITORING\",\"opaque\"]")
            .expect("failed to write to pipe");
    })
    .await
    .expect("writer panicked");

    // the dispatcher only polls, give the reader thread time to forward the message
    let cancel = CancellationToken::new();
    let attributed = timeout(Duration::from_secs(5), async {
        loop {
            dispatcher.dispatch(&cancel, &event, false).await;
            if !store.is_empty() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(attributed.is_ok(), "telemetry never reached the store");

    // the invocation holds a single fragment: only the shutdown harvest sends it
    assert_eq!(dispatcher.dispatch(&cancel, &event, true).await, 1);
    mock.assert_async().await;
}
