//! 远程 Runner 传输：长连接双向流
//!
//! WebSocket 文本帧即协议行。连接关闭对会话是终结性的：不重连，
//! 关闭后的 start 直接报错，由上层决定是否重建会话。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::runner::{Transport, TransportError, TransportEvent};

struct RemoteInner {
    started: bool,
    sink_tx: Option<mpsc::UnboundedSender<String>>,
}

/// 远程流传输
pub struct RemoteTransport {
    url: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<RemoteInner>,
    closed: Arc<AtomicBool>,
}

impl RemoteTransport {
    pub fn new(url: impl Into<String>, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            url: url.into(),
            events,
            state: Mutex::new(RemoteInner {
                started: false,
                sink_tx: None,
            }),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Transport for RemoteTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.started {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed(
                    "remote transport does not reconnect".to_string(),
                ));
            }
            return Ok(());
        }

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Io(format!("remote connect failed: {e}")))?;
        tracing::info!(url = %self.url, "remote runner connected");
        let (mut sink, mut stream) = ws_stream.split();

        let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(line) = sink_rx.recv().await {
                if sink.send(WsMessage::text(line)).await.is_err() {
                    break;
                }
            }
        });

        let events = self.events.clone();
        let closed = self.closed.clone();
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if events
                            .send(TransportEvent::Line(text.as_str().to_string()))
                            .is_err()
                        {
                            break "event receiver dropped".to_string();
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => break "remote closed connection".to_string(),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break format!("remote stream error: {e}"),
                    None => break "remote stream ended".to_string(),
                }
            };
            closed.store(true, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Closed(reason));
        });

        state.sink_tx = Some(sink_tx);
        state.started = true;
        Ok(())
    }

    async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.sink_tx = None;
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn send(&self, line: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed(
                "remote connection gone".to_string(),
            ));
        }
        let state = self.state.lock().await;
        let sink_tx = state
            .sink_tx
            .as_ref()
            .ok_or(TransportError::NotStarted)?;
        sink_tx
            .send(line.to_string())
            .map_err(|_| TransportError::Closed("remote sink writer stopped".to_string()))
    }
}
