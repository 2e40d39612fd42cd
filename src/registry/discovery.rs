//! Enumeration rounds across all configured backends.

use super::dispatch::{Internal, Reply};
use crate::backend::BackendSet;
use crate::errors::BackendError;
use crate::types::DeviceIdentity;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub(super) type RoundResult = Vec<(usize, Result<Vec<DeviceIdentity>, BackendError>)>;

/// Enumerate every backend concurrently, each bounded by `timeout`.
pub(super) async fn enumerate_round(backends: &BackendSet, timeout: Duration) -> RoundResult {
    let rounds = backends.iter().map(|(index, backend)| {
        let backend = backend.clone();
        async move {
            let result = match tokio::time::timeout(timeout, backend.enumerate()).await {
                Ok(result) => result,
                Err(_) => Err(BackendError::unreachable(format!(
                    "{} enumeration timed out",
                    backend.name()
                ))),
            };
            (index, result)
        }
    });
    futures::future::join_all(rounds).await
}

/// One round whose result is reported back with a completion signal.
pub(super) fn spawn_round(
    backends: BackendSet,
    timeout: Duration,
    internal: mpsc::UnboundedSender<Internal>,
    done: Reply<()>,
) {
    tokio::spawn(async move {
        let results = enumerate_round(&backends, timeout).await;
        let _ = internal.send(Internal::Enumerated {
            results,
            done: Some(done),
        });
    });
}

/// Periodic enumeration until `stop` flips or the registry goes away.
pub(super) fn spawn_loop(
    backends: BackendSet,
    interval: Duration,
    timeout: Duration,
    internal: mpsc::UnboundedSender<Internal>,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let results = tokio::select! {
                biased;
                _ = stop.changed() => break,
                results = enumerate_round(&backends, timeout) => results,
            };
            if internal
                .send(Internal::Enumerated {
                    results,
                    done: None,
                })
                .is_err()
            {
                break;
            }
            tokio::select! {
                biased;
                _ = stop.changed() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        log::debug!("Discovery loop stopped");
    })
}
