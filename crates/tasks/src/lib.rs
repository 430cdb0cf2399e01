//! Critical-task management: spawn named tasks, propagate their failures to
//! a monitor, and fan a shutdown signal out to everything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::*;

/// Cooperative shutdown flag handed to every spawned task.
#[derive(Clone)]
pub struct ShutdownGuard {
    flag: Arc<AtomicBool>,
}

impl ShutdownGuard {
    pub fn should_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Sender half used to initiate shutdown.
#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn send(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

/// Outcome of a critical task, reported to the monitor.
#[derive(Debug)]
struct TaskExit {
    name: &'static str,
    result: anyhow::Result<()>,
}

/// Spawns critical tasks onto the runtime and reports their exits.
#[derive(Clone)]
pub struct TaskExecutor {
    handle: Handle,
    flag: Arc<AtomicBool>,
    exit_tx: mpsc::UnboundedSender<TaskExit>,
}

impl TaskExecutor {
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    fn guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            flag: self.flag.clone(),
        }
    }

    /// Spawns a blocking task.  An `Err` return or panic shuts the node
    /// down.
    pub fn spawn_critical<F>(&self, name: &'static str, task: F)
    where
        F: FnOnce(ShutdownGuard) -> anyhow::Result<()> + Send + 'static,
    {
        let guard = self.guard();
        let exit_tx = self.exit_tx.clone();
        self.handle.spawn_blocking(move || {
            debug!(%name, "starting critical task");
            let result = task(guard);
            let _ = exit_tx.send(TaskExit { name, result });
        });
    }

    /// Spawns an async task with the same failure semantics.
    pub fn spawn_critical_async<F>(&self, name: &'static str, task: F)
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let exit_tx = self.exit_tx.clone();
        self.handle.spawn(async move {
            debug!(%name, "starting critical task");
            let result = task.await;
            let _ = exit_tx.send(TaskExit { name, result });
        });
    }
}

/// Owns the exit channel and the shutdown flag.
pub struct TaskManager {
    handle: Handle,
    flag: Arc<AtomicBool>,
    exit_tx: mpsc::UnboundedSender<TaskExit>,
    exit_rx: mpsc::UnboundedReceiver<TaskExit>,
}

impl TaskManager {
    pub fn new(handle: Handle) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            handle,
            flag: Arc::new(AtomicBool::new(false)),
            exit_tx,
            exit_rx,
        }
    }

    pub fn executor(&self) -> TaskExecutor {
        TaskExecutor {
            handle: self.handle.clone(),
            flag: self.flag.clone(),
            exit_tx: self.exit_tx.clone(),
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            flag: self.flag.clone(),
        }
    }

    /// Installs ctrl-c handling that flips the shutdown flag.
    pub fn start_signal_listeners(&self) {
        let signal = self.shutdown_signal();
        self.handle.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("received interrupt, shutting down");
                signal.send();
            }
        });
    }

    /// Blocks until a critical task fails or shutdown is signalled, then
    /// gives remaining tasks `drain` to observe the flag and exit.
    pub fn monitor(mut self, drain: Option<Duration>) -> anyhow::Result<()> {
        let failure = self.handle.block_on(async {
            loop {
                tokio::select! {
                    exit = self.exit_rx.recv() => {
                        match exit {
                            Some(TaskExit { name, result: Err(e) }) => {
                                error!(%name, err = %e, "critical task failed");
                                break Some(anyhow::anyhow!("task {name} failed: {e}"));
                            }
                            Some(TaskExit { name, result: Ok(()) }) => {
                                info!(%name, "critical task finished");
                            }
                            None => break None,
                        }
                    }
                    _ = wait_for_flag(self.flag.clone()) => break None,
                }
            }
        });

        self.flag.store(true, Ordering::Release);
        if let Some(dur) = drain {
            std::thread::sleep(dur);
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn wait_for_flag(flag: Arc<AtomicBool>) {
    while !flag.load(Ordering::Acquire) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_failure_surfaces_to_monitor() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let manager = TaskManager::new(runtime.handle().clone());
        let executor = manager.executor();

        executor.spawn_critical("failing", |_shutdown| anyhow::bail!("boom"));

        let res = manager.monitor(None);
        assert!(res.is_err());
    }

    #[test]
    fn test_shutdown_signal_observed() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let manager = TaskManager::new(runtime.handle().clone());
        let executor = manager.executor();
        let signal = manager.shutdown_signal();

        executor.spawn_critical("looper", move |shutdown| {
            while !shutdown.should_shutdown() {
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        });

        signal.send();
        assert!(manager.monitor(Some(Duration::from_millis(50))).is_ok());
    }
}
