//! 后台任务注册表
//!
//! 引擎启动的长期任务 (目前是推送 worker) 在这里登记。每个任务都包了一层
//! panic 捕获，关闭时先广播取消令牌，再在宽限期内等待，超时的任务直接中止。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct NamedTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// 引擎持有的任务集合
///
/// ```ignore
/// let mut tasks = BackgroundTasks::new();
/// let token = tasks.shutdown_token();
/// tasks.spawn("push_manager", async move { token.cancelled().await });
/// let aborted = tasks.shutdown(Duration::from_secs(5)).await;
/// ```
pub struct BackgroundTasks {
    tasks: Vec<NamedTask>,
    /// 所有任务共享的取消令牌
    shutdown: CancellationToken,
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("tasks", &self.names())
            .field("cancelled", &self.shutdown.is_cancelled())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// 任务内部用它监听关闭信号
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 启动并登记任务。关闭前就退出的任务记一条警告。
    pub fn spawn<F>(&mut self, name: &'static str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(()) if shutdown.is_cancelled() => {
                    tracing::debug!(task = name, "Background task stopped");
                }
                Ok(()) => tracing::warn!(task = name, "Background task exited before shutdown"),
                Err(payload) => tracing::error!(
                    task = name,
                    panic = panic_message(payload.as_ref()),
                    "Background task panicked"
                ),
            }
        });
        tracing::debug!(task = name, "Background task spawned");
        self.tasks.push(NamedTask { name, handle });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name).collect()
    }

    /// 已经退出 (正常结束或 panic) 的任务名
    pub fn finished(&self) -> Vec<&'static str> {
        self.tasks
            .iter()
            .filter(|t| t.handle.is_finished())
            .map(|t| t.name)
            .collect()
    }

    /// 取消所有任务并等待，返回超过 `grace` 被强制中止的任务数
    pub async fn shutdown(self, grace: Duration) -> usize {
        tracing::info!(tasks = self.tasks.len(), "Stopping background tasks");
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0;
        for NamedTask { name, handle } in self.tasks {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_panic() => {
                    tracing::error!(task = name, error = %e, "Background task join failed");
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::warn!(task = name, "Background task ignored shutdown, aborting");
                    abort.abort();
                    aborted += 1;
                }
            }
        }
        aborted
    }
}

impl Default for BackgroundTasks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_workers() {
        let mut tasks = BackgroundTasks::new();
        let token = tasks.shutdown_token();
        tasks.spawn("waiter", async move {
            token.cancelled().await;
        });
        assert_eq!(tasks.names(), vec!["waiter"]);
        assert!(tasks.finished().is_empty());

        let aborted = tokio::time::timeout(
            Duration::from_secs(1),
            tasks.shutdown(Duration::from_secs(1)),
        )
        .await
        .unwrap();
        assert_eq!(aborted, 0);
    }

    #[tokio::test]
    async fn test_panicking_task_is_contained() {
        let mut tasks = BackgroundTasks::new();
        tasks.spawn("boom", async {
            panic!("boom");
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tasks.finished(), vec!["boom"]);
        assert_eq!(tasks.shutdown(Duration::from_millis(100)).await, 0);
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted() {
        let mut tasks = BackgroundTasks::new();
        tasks.spawn("stuck", std::future::pending());
        let aborted = tokio::time::timeout(
            Duration::from_secs(1),
            tasks.shutdown(Duration::from_millis(20)),
        )
        .await
        .unwrap();
        assert_eq!(aborted, 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
