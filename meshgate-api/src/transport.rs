//! Axum WebSocket adapter
//!
//! Splits an upgraded [`WebSocket`] into the [`FrameSink`] / [`FrameStream`]
//! halves a session runs on.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use meshgate_core::{CloseReason, Frame, FrameSink, FrameStream, RecvError, SendError};

/// Write half of an upgraded socket.
pub struct WsSink {
    inner: SplitSink<WebSocket, WsMessage>,
}

/// Read half of an upgraded socket.
pub struct WsStream {
    inner: SplitStream<WebSocket>,
}

pub fn split(socket: WebSocket) -> (WsSink, WsStream) {
    let (sink, stream) = socket.split();
    (WsSink { inner: sink }, WsStream { inner: stream })
}

fn to_ws(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text),
        Frame::Binary(bytes) => WsMessage::Binary(bytes),
        Frame::Control => WsMessage::Ping(Vec::new()),
        Frame::Close { code, reason } => WsMessage::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

fn from_ws(message: WsMessage) -> Frame {
    match message {
        WsMessage::Text(text) => Frame::Text(text),
        WsMessage::Binary(bytes) => Frame::Binary(bytes),
        WsMessage::Ping(_) | WsMessage::Pong(_) => Frame::Control,
        WsMessage::Close(frame) => match frame {
            Some(frame) => Frame::Close {
                code: frame.code,
                reason: frame.reason.into_owned(),
            },
            None => Frame::Close {
                code: meshgate_core::close_code::NORMAL,
                reason: String::new(),
            },
        },
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), SendError> {
        self.inner
            .send(to_ws(frame))
            .await
            .map_err(|e| SendError::Transport {
                reason: e.to_string(),
            })
    }

    async fn close(&mut self, reason: &CloseReason) -> Result<(), SendError> {
        let frame = Frame::Close {
            code: reason.code,
            reason: reason.reason.clone(),
        };
        // The peer may already be gone; releasing the sink still matters.
        let sent = self.send_frame(frame).await;
        let _ = self.inner.close().await;
        sent
    }
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<Frame, RecvError>> {
        match self.inner.next().await? {
            Ok(message) => Some(Ok(from_ws(message))),
            Err(e) => Some(Err(RecvError::Transport {
                reason: e.to_string(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_mapping() {
        assert_eq!(
            from_ws(to_ws(Frame::Text("hi".to_string()))),
            Frame::Text("hi".to_string())
        );
        assert_eq!(from_ws(WsMessage::Pong(vec![1])), Frame::Control);
        assert_eq!(
            from_ws(to_ws(Frame::Close {
                code: 4000,
                reason: "timeout".to_string()
            })),
            Frame::Close {
                code: 4000,
                reason: "timeout".to_string()
            }
        );
        assert!(matches!(
            from_ws(WsMessage::Close(None)),
            Frame::Close { code: 1000, .. }
        ));
    }
}
