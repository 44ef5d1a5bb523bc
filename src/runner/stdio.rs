//! 子进程 stdio 传输
//!
//! 拉起 Runner 子进程，stdin 写请求行、stdout 读响应行、stderr 逐行转 warn 日志。
//! 容器模式共用同一实现，仅启动命令不同（docker run -i --rm <image>）。

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};

use crate::runner::{Transport, TransportError, TransportEvent};

struct StdioInner {
    started: bool,
    child: Option<Child>,
    stdin_tx: Option<mpsc::UnboundedSender<String>>,
}

/// 子进程 stdio 传输；start 幂等，子进程退出后可再次 start 重启
pub struct StdioTransport {
    program: String,
    args: Vec<String>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<StdioInner>,
    closed: Arc<AtomicBool>,
}

impl StdioTransport {
    /// 直接拉起 Runner 可执行文件
    pub fn child_process(
        program: impl Into<String>,
        args: Vec<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            events,
            state: Mutex::new(StdioInner {
                started: false,
                child: None,
                stdin_tx: None,
            }),
            closed: Arc::new(AtomicBool::new(true)),
        }
    }

    /// 容器启动器：同一线格式，经 docker 运行镜像
    pub fn container(
        image: impl Into<String>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Self {
        Self::child_process(
            "docker",
            vec![
                "run".to_string(),
                "-i".to_string(),
                "--rm".to_string(),
                image.into(),
            ],
            events,
        )
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<(), TransportError> {
        // 生命周期互斥锁：并发 start 串行化
        let mut state = self.state.lock().await;
        if state.started && !self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TransportError::Io(format!("failed to spawn runner `{}`: {e}", self.program))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Io("failed to capture runner stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Io("failed to capture runner stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Io("failed to capture runner stderr".to_string()))?;

        self.closed.store(false, Ordering::SeqCst);

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if stdin.write_all(b"\n").await.is_err() {
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        let events = self.events.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if events.send(TransportEvent::Line(line)).is_err() {
                            break "event receiver dropped".to_string();
                        }
                    }
                    Ok(None) => break "runner process exited".to_string(),
                    Err(e) => break format!("runner stdout read error: {e}"),
                }
            };
            closed.store(true, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Closed(reason));
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(source = "runner", "{line}");
            }
        });

        state.child = Some(child);
        state.stdin_tx = Some(stdin_tx);
        state.started = true;
        tracing::info!(program = %self.program, "runner process started");
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut child) = state.child.take() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        self.closed.store(true, Ordering::SeqCst);
        state.started = false;
    }

    async fn send(&self, line: &str) -> Result<(), TransportError> {
        let state = self.state.lock().await;
        let stdin_tx = state
            .stdin_tx
            .as_ref()
            .ok_or(TransportError::NotStarted)?;
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("runner process gone".to_string()));
        }
        stdin_tx
            .send(line.to_string())
            .map_err(|_| TransportError::Closed("runner stdin writer stopped".to_string()))
    }
}
