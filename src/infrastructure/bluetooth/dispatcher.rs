//! Response Dispatcher
//!
//! Decodes notification frames and hands each response to the registered
//! observers, one frame at a time in arrival order.

use crate::domain::models::AppEvent;
use crate::infrastructure::bluetooth::connection::CancelToken;
use crate::infrastructure::bluetooth::protocol::{self, ProtocolError, TypedResponse};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

pub trait ResponseObserver: Send + Sync {
    fn on_response(&self, response: &TypedResponse);

    fn on_malformed(&self, _raw: &[u8], _error: &ProtocolError) {}
}

/// Writes every response to the log
pub struct LoggingObserver;

impl ResponseObserver for LoggingObserver {
    fn on_response(&self, response: &TypedResponse) {
        match response {
            TypedResponse::Ping => info!("[read] vehicle is alive"),
            TypedResponse::Version(version) => info!("[read] firmware version {:#06x}", version),
            TypedResponse::BatteryLevel(level) => info!("[read] battery level {}", level),
            TypedResponse::Unknown { msg_id, hex } => {
                info!("[read] unhandled message {:#04x}: {}", msg_id, hex)
            }
        }
    }
}

/// Forwards responses to the application event channel
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<AppEvent>,
}

impl ChannelObserver {
    pub fn new(sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self { sender }
    }
}

impl ResponseObserver for ChannelObserver {
    fn on_response(&self, response: &TypedResponse) {
        let _ = self.sender.send(AppEvent::Response(response.clone()));
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub frames: u64,
    pub malformed: u64,
}

#[derive(Default)]
pub struct ResponseDispatcher {
    observers: Vec<Box<dyn ResponseObserver>>,
    stats: DispatchStats,
}

impl ResponseDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: impl ResponseObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Decode one frame and notify observers. Malformed frames are dropped.
    pub fn dispatch(&mut self, raw: &[u8]) -> Result<TypedResponse, ProtocolError> {
        self.stats.frames += 1;
        trace!("[read] raw {}", protocol::hex_string(raw));

        let result = protocol::decode(raw).and_then(|message| protocol::interpret(&message));
        match &result {
            Ok(response) => {
                for observer in &self.observers {
                    observer.on_response(response);
                }
            }
            Err(e) => {
                self.stats.malformed += 1;
                warn!("Dropping frame {}: {}", protocol::hex_string(raw), e);
                for observer in &self.observers {
                    observer.on_malformed(raw, e);
                }
            }
        }
        result
    }

    /// Dispatch frames until every sender is gone or `stop` fires.
    ///
    /// Frames already queued when `stop` fires are still dispatched.
    pub async fn run(
        mut self,
        mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
        stop: CancelToken,
    ) -> DispatchStats {
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        let _ = self.dispatch(&frame);
                    }
                    None => break,
                },
                _ = stop.cancelled() => {
                    while let Ok(frame) = frames.try_recv() {
                        let _ = self.dispatch(&frame);
                    }
                    break;
                }
            }
        }
        self.stats
    }

    pub fn spawn(
        self,
        frames: mpsc::UnboundedReceiver<Vec<u8>>,
        stop: CancelToken,
    ) -> JoinHandle<DispatchStats> {
        tokio::spawn(self.run(frames, stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder {
        responses: Arc<Mutex<Vec<TypedResponse>>>,
        malformed: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl ResponseObserver for Recorder {
        fn on_response(&self, response: &TypedResponse) {
            self.responses.lock().unwrap().push(response.clone());
        }

        fn on_malformed(&self, raw: &[u8], _error: &ProtocolError) {
            self.malformed.lock().unwrap().push(raw.to_vec());
        }
    }

    #[test]
    fn test_dispatch_routes_by_kind() {
        let recorder = Recorder::default();
        let mut dispatcher = ResponseDispatcher::new()
            .with_observer(LoggingObserver)
            .with_observer(recorder.clone());

        dispatcher.dispatch(&[0x01, 0x17]).unwrap();
        dispatcher.dispatch(&[0x03, 0x19, 0x02, 0x00]).unwrap();
        dispatcher.dispatch(&[0x03, 0x1b, 0x10, 0x0e]).unwrap();
        dispatcher.dispatch(&[0x03, 0xFF, 0xAB, 0xCD]).unwrap();

        assert_eq!(
            *recorder.responses.lock().unwrap(),
            vec![
                TypedResponse::Ping,
                TypedResponse::Version(2),
                TypedResponse::BatteryLevel(3600),
                TypedResponse::Unknown {
                    msg_id: 0xFF,
                    hex: "AB-CD".into()
                },
            ]
        );
    }

    #[test]
    fn test_malformed_frames_dropped() {
        let recorder = Recorder::default();
        let mut dispatcher = ResponseDispatcher::new().with_observer(recorder.clone());

        assert!(dispatcher.dispatch(&[0x01]).is_err());
        assert!(dispatcher.dispatch(&[0x02, 0x19, 0x01]).is_err());
        dispatcher.dispatch(&[0x01, 0x17]).unwrap();

        assert_eq!(
            dispatcher.stats(),
            DispatchStats {
                frames: 3,
                malformed: 2
            }
        );
        assert_eq!(recorder.responses.lock().unwrap().len(), 1);
        assert_eq!(recorder.malformed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_preserves_arrival_order() {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let handle = ResponseDispatcher::new()
            .with_observer(ChannelObserver::new(event_tx))
            .spawn(frame_rx, CancelToken::new());

        frame_tx.send(vec![0x03, 0x1b, 0x01, 0x00]).unwrap();
        frame_tx.send(vec![0x00]).unwrap();
        frame_tx.send(vec![0x01, 0x17]).unwrap();
        drop(frame_tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.frames, 3);
        assert_eq!(stats.malformed, 1);

        let mut responses = Vec::new();
        while let Ok(AppEvent::Response(response)) = event_rx.try_recv() {
            responses.push(response);
        }
        assert_eq!(
            responses,
            vec![TypedResponse::BatteryLevel(1), TypedResponse::Ping]
        );
    }

    #[tokio::test]
    async fn test_stop_drains_queued_frames() {
        let recorder = Recorder::default();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let stop = CancelToken::new();

        frame_tx.send(vec![0x01, 0x17]).unwrap();
        frame_tx.send(vec![0x03, 0x19, 0x05, 0x00]).unwrap();
        stop.cancel();

        let stats = ResponseDispatcher::new()
            .with_observer(recorder.clone())
            .run(frame_rx, stop)
            .await;

        // The sender is still alive; only the stop signal ends the loop
        assert_eq!(stats.frames, 2);
        assert_eq!(recorder.responses.lock().unwrap().len(), 2);
        drop(frame_tx);
    }
}
