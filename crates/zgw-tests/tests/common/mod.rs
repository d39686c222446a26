//! Scripted tester on the far end of a duplex pipe

#![allow(dead_code)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use zgw_doip::doip::payload::{
    activation_type, DiagnosticMessage, RoutingActivationRequest, RoutingActivationResponse,
};
use zgw_doip::{
    ConnectionError, ConnectionHandle, DoipCodec, DoipFrame, EngineConfig, EngineEvent,
    PayloadType, ProtocolEngine,
};

pub const TESTER: u16 = 0x0E00;
pub const GATEWAY: u16 = 0x0100;

/// Upper bound for anything the gateway answers immediately
const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Tester {
    pub peer: Framed<DuplexStream, DoipCodec>,
    pub handle: ConnectionHandle,
    pub events: mpsc::Receiver<EngineEvent>,
}

impl Tester {
    pub fn start(config: EngineConfig) -> Self {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let engine = ProtocolEngine::new(config).expect("valid config");
        let (handle, events) = zgw_doip::spawn(server, engine);
        Self {
            peer: Framed::new(client, DoipCodec::default()),
            handle,
            events,
        }
    }

    pub async fn send(&mut self, frame: DoipFrame) {
        self.peer.send(frame).await.expect("send frame");
    }

    pub async fn recv(&mut self) -> DoipFrame {
        self.try_recv_for(REPLY_TIMEOUT)
            .await
            .expect("no frame from gateway")
    }

    /// Next frame within `wait`, or `None` if the gateway stayed silent
    pub async fn try_recv_for(&mut self, wait: Duration) -> Option<DoipFrame> {
        match tokio::time::timeout(wait, self.peer.next()).await {
            Ok(Some(frame)) => Some(frame.expect("decode frame from gateway")),
            Ok(None) => panic!("gateway closed the connection"),
            Err(_) => None,
        }
    }

    /// Wait until the gateway closes its side
    pub async fn expect_closed(&mut self, wait: Duration) {
        loop {
            match tokio::time::timeout(wait, self.peer.next()).await {
                Ok(None) => return,
                Ok(Some(_)) => continue,
                Err(_) => panic!("connection still open after {wait:?}"),
            }
        }
    }

    pub async fn activate(&mut self) -> RoutingActivationResponse {
        self.send(RoutingActivationRequest::new(TESTER, activation_type::DEFAULT).into_frame())
            .await;
        let frame = self.recv().await;
        assert_eq!(frame.payload_type, PayloadType::RoutingActivationResponse);
        let response = RoutingActivationResponse::parse(&frame.payload).expect("activation response");
        assert!(matches!(
            self.next_event().await,
            EngineEvent::RoutingActivated { tester_address: TESTER, .. }
        ));
        response
    }

    pub async fn send_uds(&mut self, uds: &[u8]) {
        self.send(DiagnosticMessage::new(TESTER, GATEWAY, uds.to_vec()).into_frame())
            .await;
    }

    /// Expect the diagnostic ACK and return the UDS bytes of the reply
    pub async fn request(&mut self, uds: &[u8]) -> Vec<u8> {
        self.send_uds(uds).await;
        let ack = self.recv().await;
        assert_eq!(ack.payload_type, PayloadType::DiagnosticMessageAck);
        self.recv_uds().await
    }

    pub async fn recv_uds(&mut self) -> Vec<u8> {
        let frame = self.recv().await;
        assert_eq!(frame.payload_type, PayloadType::DiagnosticMessage);
        let msg = DiagnosticMessage::parse(&frame.payload).expect("diagnostic message");
        assert_eq!(msg.source_address, GATEWAY);
        assert_eq!(msg.target_address, TESTER);
        msg.user_data.to_vec()
    }

    pub async fn next_event(&mut self) -> EngineEvent {
        tokio::time::timeout(REPLY_TIMEOUT, self.events.recv())
            .await
            .expect("no event from gateway")
            .expect("event channel closed")
    }

    /// Skip events until one matches
    pub async fn wait_event(&mut self, pred: impl Fn(&EngineEvent) -> bool) -> EngineEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    pub async fn shutdown(self) -> Result<(), ConnectionError> {
        self.handle.shutdown().await
    }
}

/// RequestDownload with 4-byte address and size
pub fn request_download(address: u32, size: u32) -> Vec<u8> {
    let mut uds = vec![0x34, 0x00, 0x44];
    uds.extend_from_slice(&address.to_be_bytes());
    uds.extend_from_slice(&size.to_be_bytes());
    uds
}

pub fn transfer_data(counter: u8, block: &[u8]) -> Vec<u8> {
    let mut uds = vec![0x36, counter];
    uds.extend_from_slice(block);
    uds
}
