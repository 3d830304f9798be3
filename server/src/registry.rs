//! Group registry: group identifier to running worker
//!
//! Owned by the router and touched only from the router task, so lookups and
//! inserts need no locking. An ordered map keeps lookups logarithmic and makes
//! shutdown visit groups in a stable order.

use crate::worker::{GroupWorker, WorkerCommand};
use log::{info, warn};
use shared::{ClientId, GroupId};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// The router's view of one running group worker
#[derive(Debug)]
pub struct GroupHandle {
    commands: mpsc::UnboundedSender<WorkerCommand>,
    task: JoinHandle<()>,
}

impl GroupHandle {
    pub fn spawn(group: GroupId, send_timeout: Duration) -> Self {
        let (commands, task) = GroupWorker::spawn(group, send_timeout);
        Self { commands, task }
    }

    /// Transfers ownership of `stream` to the worker. If the worker has gone
    /// away the stream is handed back.
    pub fn attach(&self, id: ClientId, stream: TcpStream) -> Result<(), TcpStream> {
        self.commands
            .send(WorkerCommand::Attach { id, stream })
            .map_err(|rejected| match rejected.0 {
                WorkerCommand::Attach { stream, .. } => stream,
                _ => unreachable!("rejected command is the attach just sent"),
            })
    }

    /// Asks the worker for its membership. The returned future does not
    /// borrow the handle and resolves to `None` if the worker is gone.
    pub fn members(&self) -> impl Future<Output = Option<Vec<ClientId>>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let sent = self.commands.send(WorkerCommand::Members { reply }).is_ok();
        async move {
            if sent {
                rx.await.ok()
            } else {
                None
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn stop(self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Err(e) = self.task.await {
            warn!("Worker task ended abnormally: {}", e);
        }
    }
}

#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: BTreeMap<GroupId, GroupHandle>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, group: GroupId) -> Option<&GroupHandle> {
        self.groups.get(&group)
    }

    /// Installs a worker handle, returning any handle it replaced.
    pub fn insert(&mut self, group: GroupId, handle: GroupHandle) -> Option<GroupHandle> {
        self.groups.insert(group, handle)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Stops every worker and waits for each to finish.
    pub async fn shutdown(&mut self) {
        if self.is_empty() {
            return;
        }
        let groups = std::mem::take(&mut self.groups);
        info!("Stopping {} group workers", groups.len());

        for (_, handle) in groups {
            handle.stop().await;
        }
    }
}
