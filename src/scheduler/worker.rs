//! Worker contexts: the tasks that actually poll virtual users.
//!
//! Each worker is one tokio task owning a `FuturesUnordered` of user futures. New users
//! arrive over an unbounded channel; the worker keeps polling its users until the
//! channel closes and every user it holds has finished.

use std::time::Duration;

use futures::{StreamExt, future::BoxFuture, stream::FuturesUnordered};
use tokio::{sync::mpsc, task::JoinHandle};

pub(crate) type UserFuture = BoxFuture<'static, ()>;

pub(crate) struct WorkerContext {
    pub id: usize,
    users: mpsc::UnboundedSender<UserFuture>,
    handle: JoinHandle<()>,
}

impl WorkerContext {
    pub(crate) fn spawn(id: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tracing::debug!("Worker {id} spawned.");
        Self {
            id,
            users: tx,
            handle: tokio::spawn(worker_loop(id, rx)),
        }
    }

    /// Hand a user future to this worker. Fails only if the worker is gone.
    pub(crate) fn assign(&self, user: UserFuture) -> Result<(), UserFuture> {
        self.users.send(user).map_err(|err| err.0)
    }

    /// Close the intake and wait for the held users to finish, aborting the whole
    /// worker if they take longer than `grace`.
    pub(crate) async fn shutdown(self, grace: Duration) {
        let Self {
            id,
            users,
            mut handle,
        } = self;
        drop(users);
        if tokio::time::timeout(grace, &mut handle).await.is_err() {
            tracing::warn!("Worker {id} did not drain in {grace:?}, aborting it.");
            handle.abort();
        }
    }
}

async fn worker_loop(id: usize, mut intake: mpsc::UnboundedReceiver<UserFuture>) {
    let mut users = FuturesUnordered::new();
    loop {
        tokio::select! {
            incoming = intake.recv() => match incoming {
                Some(user) => users.push(user),
                None => break,
            },
            Some(()) = users.next(), if !users.is_empty() => {}
        }
    }
    while users.next().await.is_some() {}
    tracing::debug!("Worker {id} finished.");
}
