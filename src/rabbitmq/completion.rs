// src/rabbitmq/completion.rs
//! One-shot completion handles for asynchronous broker calls.
//!
//! A broker call (passive exchange declare, transaction commit) is issued
//! once and answered exactly once, with either success or an error message.
//! [`Completion`] carries that answer from the task running the call to the
//! producer waiting on it, and [`Completion::wait`] bounds how long the
//! producer is willing to block. A spawned call that outlives the wait is
//! aborted.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::RabbitMQError;

pub type Resolver<T> = oneshot::Sender<Result<T, String>>;

/// Final state of a waited-on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<T> {
    Success(T),
    Failure(String),
    TimedOut,
}

#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, String>>,
    task: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Completion<T> {
    pub fn pair() -> (Resolver<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx, task: None })
    }

    /// Run `call` on the runtime and resolve with its outcome.
    pub fn spawn<F>(call: F) -> Self
    where
        F: Future<Output = Result<T, RabbitMQError>> + Send + 'static,
    {
        let (tx, mut completion) = Self::pair();
        completion.task = Some(tokio::spawn(async move {
            let outcome = call.await.map_err(|e| e.to_string());
            let _ = tx.send(outcome);
        }));
        completion
    }

    pub async fn wait(self, timeout: Duration) -> Resolved<T> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(Ok(value))) => Resolved::Success(value),
            Ok(Ok(Err(message))) => Resolved::Failure(message),
            Ok(Err(_)) => Resolved::Failure("completion dropped before resolving".to_string()),
            Err(_) => {
                if let Some(task) = self.task {
                    task.abort();
                }
                Resolved::TimedOut
            }
        }
    }
}
