use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{error, info};

use crate::{
    data_model::{AppSpec, Message},
    expected::ExpectedContainers,
    provisioner::{RequestQueue, RunnableContainerRequest},
    registry::{ContainerRegistry, MessageCompletion},
};

/// One requested instance-count change.
pub struct InstanceChangeRequest {
    pub message: Message,
    pub runnable_name: String,
    pub old_count: u32,
    pub new_count: u32,
    pub completion: MessageCompletion,
}

/// Serialized worker reconciling desired instance counts against running
/// containers. Changes are processed one at a time from a bounded queue;
/// on shutdown, pending work is discarded but completions still fire.
pub struct InstanceChangeWorker {
    tx: std::sync::Mutex<Option<mpsc::Sender<InstanceChangeRequest>>>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl InstanceChangeWorker {
    pub fn new(
        spec: Arc<AppSpec>,
        registry: Arc<ContainerRegistry>,
        expected: Arc<ExpectedContainers>,
        requests: RequestQueue,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let worker = Worker {
            spec,
            registry,
            expected,
            requests,
        };
        let handle = tokio::spawn(worker.run(rx, shutdown_rx));
        InstanceChangeWorker {
            tx: std::sync::Mutex::new(Some(tx)),
            handle: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    pub fn submit(&self, request: InstanceChangeRequest) -> Result<()> {
        let tx = self.tx.lock().unwrap();
        match tx.as_ref() {
            Some(tx) => tx
                .try_send(request)
                .map_err(|_| anyhow!("instance change worker is not accepting requests")),
            None => Err(anyhow!("instance change worker is shut down")),
        }
    }

    /// Waits for the worker to drain and exit; the shutdown signal must
    /// already have been raised.
    pub async fn shutdown(&self) {
        self.tx.lock().unwrap().take();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("instance change worker task failed: {err}");
            }
        }
    }
}

struct Worker {
    spec: Arc<AppSpec>,
    registry: Arc<ContainerRegistry>,
    expected: Arc<ExpectedContainers>,
    requests: RequestQueue,
}

impl Worker {
    async fn run(
        self,
        mut rx: mpsc::Receiver<InstanceChangeRequest>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                request = rx.recv() => {
                    match request {
                        Some(request) => self.process(request, &mut shutdown_rx).await,
                        None => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        // Discard whatever is still queued, completing the callbacks so no
        // originator waits forever.
        rx.close();
        while let Ok(request) = rx.try_recv() {
            request.completion.done();
        }
    }

    async fn process(
        &self,
        request: InstanceChangeRequest,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let InstanceChangeRequest {
            message,
            runnable_name,
            old_count,
            new_count,
            completion,
        } = request;

        info!(
            runnable = %runnable_name,
            old_count,
            new_count,
            "processing instance change request"
        );

        if *shutdown_rx.borrow() {
            completion.done();
            return;
        }

        // Wait out in-flight container starts so the reconciliation below
        // sees a settled count.
        tokio::select! {
            _ = self.registry.wait_for_count(&runnable_name, old_count) => {}
            _ = shutdown_rx.changed() => {
                completion.done();
                return;
            }
        }
        info!(runnable = %runnable_name, count = old_count, "confirmed running count");

        self.expected.set_expected(&runnable_name, new_count);

        if new_count < old_count {
            for _ in 0..old_count - new_count {
                if let Err(err) = self.registry.remove_last(&runnable_name).await {
                    error!(runnable = %runnable_name, "error removing instance: {err:#}");
                }
            }
        } else if let Some(runtime_spec) = self.spec.runnables.get(&runnable_name) {
            self.requests.lock().await.push_back(RunnableContainerRequest::single(
                runtime_spec.clone(),
                self.spec.order_type_of(&runnable_name),
            ));
        }

        // Let the current instances observe the new count.
        self.registry
            .send_to_runnable(&runnable_name, message, completion)
            .await;
        info!(
            runnable = %runnable_name,
            old_count,
            new_count,
            "instance change request completed"
        );
    }
}
