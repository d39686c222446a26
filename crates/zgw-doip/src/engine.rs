//! Protocol engine
//!
//! Owns every piece of per-connection state and turns one inbound frame
//! into zero or more outbound frames plus host-facing events:
//!
//! ```text
//!  DoipFrame ──▶ ProtocolEngine::handle_frame
//!                  ├─ 0x0005/0x0007/0x0008 ─▶ RoutingSession
//!                  ├─ 0x9000/0x9001/0x9002 ─▶ telemetry parsers ─▶ TelemetryStore
//!                  └─ 0x8001 ─▶ UDS dispatch
//!                                 ├─ 0x22 ReadDataByIdentifier
//!                                 ├─ 0x31 RoutineControl
//!                                 └─ 0x34/0x36/0x37 ─▶ FirmwareTransferSession
//!                                                        └─ sw_package checks
//! ```
//!
//! The engine is synchronous and never blocks. Time is passed in by the
//! caller; [`crate::connection`] drives it from tokio tasks.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::doip::payload::{
    AliveCheckRequest, AliveCheckResponse, DiagnosticAck, DiagnosticMessage, DiagnosticNackCode,
    GenericNackCode, RoutingActivationRequest,
};
use crate::doip::{DoipFrame, PayloadType};
use crate::error::{Error, Result};
use crate::routing::{AliveCheck, RoutingSession};
use crate::sw_package::{self, PackageDisposition, SoftwarePackageHeader, StagingArea};
use crate::telemetry::{
    self, encode_report, EcuHealthRecord, EcuReadinessRecord, EcuVciRecord, ParsedReport,
    TelemetryRecord, TelemetryStore,
};
use crate::transfer::{FirmwareTransferSession, TransferError};
use crate::uds::{
    did, encode_negative_response, encode_positive_response, rid, routine_sub_function,
    service_id, NegativeResponseCode, RoutineControlResponse, RoutineStatus, UdsMessage,
    UdsRequest,
};

/// RequestDownload lengthFormatIdentifier: maxNumberOfBlockLength is 2 bytes
const LENGTH_FORMAT_IDENTIFIER: u8 = 0x20;

/// Header, staging slot and routing decision of a verified package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPackage {
    pub header: SoftwarePackageHeader,
    pub disposition: PackageDisposition,
    pub staging: StagingArea,
}

/// Something the host should know about
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    RoutingActivated {
        tester_address: u16,
        activation_type: u8,
    },
    /// The peer stopped answering alive checks
    RoutingExpired {
        tester_address: Option<u16>,
    },
    RoutingDeactivated,
    AliveCheckResponse {
        source_address: Option<u16>,
    },
    VciReport(ParsedReport<EcuVciRecord>),
    HealthReport(ParsedReport<EcuHealthRecord>),
    ReadinessReport(ParsedReport<EcuReadinessRecord>),
    /// UDS response from the peer to a request the host sent
    UdsResponse {
        source_address: u16,
        message: UdsMessage,
    },
    RoutineStarted {
        routine_id: u16,
    },
    TransferStarted {
        address: u32,
        size: u32,
    },
    /// `package` is `None` when package verification is disabled
    TransferCompleted {
        address: u32,
        data: Bytes,
        package: Option<VerifiedPackage>,
    },
    TransferFailed {
        nrc: NegativeResponseCode,
        reason: String,
    },
}

/// Frames to write and events to surface, in order
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EngineOutput {
    pub frames: Vec<DoipFrame>,
    pub events: Vec<EngineEvent>,
}

impl EngineOutput {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty() && self.events.is_empty()
    }

    fn frame(&mut self, frame: DoipFrame) {
        self.frames.push(frame);
    }

    fn event(&mut self, event: EngineEvent) {
        self.events.push(event);
    }
}

pub struct ProtocolEngine {
    config: EngineConfig,
    routing: RoutingSession,
    transfer: FirmwareTransferSession,
    telemetry: TelemetryStore,
    vci_collection_started: bool,
    readiness_check_started: bool,
    /// Header accepted after the first 64 bytes of the current download
    inspected_header: Option<SoftwarePackageHeader>,
}

impl ProtocolEngine {
    /// Build an engine for one connection. Fails if `config` does not validate.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    fn with_config(config: EngineConfig) -> Self {
        let routing = RoutingSession::from_config(config.local_logical_address, &config.routing);
        let transfer = FirmwareTransferSession::new(config.transfer.limits());
        Self {
            config,
            routing,
            transfer,
            telemetry: TelemetryStore::default(),
            vci_collection_started: false,
            readiness_check_started: false,
            inspected_header: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn routing(&self) -> &RoutingSession {
        &self.routing
    }

    pub fn transfer(&self) -> &FirmwareTransferSession {
        &self.transfer
    }

    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    fn local_address(&self) -> u16 {
        self.config.local_logical_address
    }

    /// Drop all session state, as for a new connection
    pub fn reset(&mut self) {
        let config = self.config.clone();
        *self = Self::with_config(config);
    }

    // =========================================================================
    // Inbound dispatch
    // =========================================================================

    pub fn handle_frame(&mut self, frame: &DoipFrame, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();
        debug!(
            payload_type = %frame.payload_type,
            len = frame.payload.len(),
            "Frame received"
        );

        if self.routing.is_active() {
            self.routing.touch(now);
        }

        let result = match frame.payload_type {
            PayloadType::RoutingActivationRequest => {
                self.on_routing_activation(&frame.payload, now, &mut out)
            }
            PayloadType::AliveCheckRequest => self.on_alive_check_request(&frame.payload, &mut out),
            PayloadType::AliveCheckResponse => {
                let resp = AliveCheckResponse::parse(&frame.payload);
                self.routing.on_alive_check_response(resp.source_address, now);
                out.event(EngineEvent::AliveCheckResponse {
                    source_address: resp.source_address,
                });
                Ok(())
            }
            PayloadType::DiagnosticMessage => self.on_diagnostic_message(&frame.payload, &mut out),
            PayloadType::DiagnosticMessageAck | PayloadType::DiagnosticMessageNack => {
                self.on_diagnostic_ack(frame.payload_type, &frame.payload)
            }
            PayloadType::VciReport => {
                self.on_report::<EcuVciRecord, _>(&frame.payload, &mut out, |store, report| {
                    store.merge_vci(&report.records);
                    EngineEvent::VciReport(report)
                })
            }
            PayloadType::HealthReport => {
                self.on_report::<EcuHealthRecord, _>(&frame.payload, &mut out, |store, report| {
                    store.merge_health(&report.records);
                    EngineEvent::HealthReport(report)
                })
            }
            PayloadType::ReadinessReport => {
                self.on_report::<EcuReadinessRecord, _>(&frame.payload, &mut out, |store, report| {
                    store.merge_readiness(&report.records);
                    EngineEvent::ReadinessReport(report)
                })
            }
            PayloadType::GenericNack => {
                match GenericNackCode::parse(&frame.payload) {
                    Ok(code) => warn!(code = ?code, "Peer sent generic NACK"),
                    Err(e) => warn!(error = %e, "Peer sent malformed generic NACK"),
                }
                Ok(())
            }
            other => {
                warn!(payload_type = %other, "Unsupported payload type");
                out.frame(GenericNackCode::UnknownPayloadType.into_frame());
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(payload_type = %frame.payload_type, error = %e, "Rejecting payload");
            out.frame(GenericNackCode::InvalidPayloadLength.into_frame());
        }
        out
    }

    // ===== Routing Activation (0x0005) =====

    fn on_routing_activation(
        &mut self,
        payload: &[u8],
        now: Instant,
        out: &mut EngineOutput,
    ) -> Result<()> {
        let request = RoutingActivationRequest::parse(payload)?;
        let previous = self.routing.peer_logical_address().filter(|_| self.routing.is_active());
        if previous.is_some_and(|peer| peer != request.source_address) {
            self.abort_transfer(out);
        }
        let response = self.routing.on_routing_activation_request(&request, now);
        out.frame(response.into_frame());
        out.event(EngineEvent::RoutingActivated {
            tester_address: request.source_address,
            activation_type: request.activation_type,
        });
        Ok(())
    }

    // ===== Alive Check (0x0007) =====

    fn on_alive_check_request(
        &mut self,
        payload: &[u8],
        out: &mut EngineOutput,
    ) -> Result<()> {
        let request = AliveCheckRequest::parse(payload)?;
        debug!(
            source_address = format!("0x{:04X}", request.source_address),
            "Answering alive check"
        );
        out.frame(
            AliveCheckResponse {
                source_address: Some(self.local_address()),
            }
            .into_frame(),
        );
        Ok(())
    }

    // ===== Diagnostic ACK / NACK (0x8002 / 0x8003) =====

    fn on_diagnostic_ack(
        &mut self,
        payload_type: PayloadType,
        payload: &[u8],
    ) -> Result<()> {
        let ack = DiagnosticAck::parse(payload_type, payload)?;
        if payload_type == PayloadType::DiagnosticMessageNack {
            warn!(
                source_address = format!("0x{:04X}", ack.source_address),
                code = ?DiagnosticNackCode::from(ack.code),
                "Diagnostic message rejected by peer"
            );
        } else {
            debug!(
                source_address = format!("0x{:04X}", ack.source_address),
                "Diagnostic message acknowledged"
            );
        }
        Ok(())
    }

    // ===== Reports (0x9000 / 0x9001 / 0x9002) =====

    fn on_report<R, F>(
        &mut self,
        payload: &[u8],
        out: &mut EngineOutput,
        merge: F,
    ) -> Result<()>
    where
        R: TelemetryRecord,
        F: FnOnce(&mut TelemetryStore, ParsedReport<R>) -> EngineEvent,
    {
        if !self.routing.is_active() {
            warn!(kind = R::KIND, "Report received before routing activation, dropped");
            return Ok(());
        }
        let report = telemetry::parse_records::<R>(payload)?;
        info!(
            kind = R::KIND,
            records = report.records.len(),
            declared = report.declared_count,
            truncated = report.truncated,
            "Report received"
        );
        let event = merge(&mut self.telemetry, report);
        out.event(event);
        Ok(())
    }

    // ===== Diagnostic Message (0x8001) =====

    fn on_diagnostic_message(
        &mut self,
        payload: &Bytes,
        out: &mut EngineOutput,
    ) -> Result<()> {
        let msg = DiagnosticMessage::parse(payload)?;
        let local = self.local_address();
        let sa = msg.source_address;
        debug!(
            source_address = format!("0x{:04X}", sa),
            target_address = format!("0x{:04X}", msg.target_address),
            uds = %hex::encode(&msg.user_data),
            "Diagnostic message"
        );

        if !self.routing.is_active() {
            let sid = msg.user_data[0];
            warn!(
                service_id = format!("0x{:02X}", sid),
                "Diagnostic message before routing activation"
            );
            let nrc = Error::RoutingInactive.nrc();
            out.frame(DiagnosticMessage::new(local, sa, encode_negative_response(sid, nrc)).into_frame());
            return Ok(());
        }
        if !self.routing.accepts_source(sa) {
            warn!(source_address = format!("0x{:04X}", sa), "Unknown source address");
            out.frame(
                DiagnosticAck::rejected(local, sa, DiagnosticNackCode::InvalidSourceAddress)
                    .into_nack_frame(),
            );
            return Ok(());
        }
        if msg.target_address != local {
            warn!(
                target_address = format!("0x{:04X}", msg.target_address),
                "Unknown target address"
            );
            out.frame(
                DiagnosticAck::rejected(local, sa, DiagnosticNackCode::UnknownTargetAddress)
                    .into_nack_frame(),
            );
            return Ok(());
        }

        if self.config.doip.send_diagnostic_ack {
            out.frame(DiagnosticAck::acknowledged(local, sa).into_ack_frame());
        }

        // user_data is never empty past DiagnosticMessage::parse
        let Ok(uds) = UdsMessage::decode(&msg.user_data) else {
            return Ok(());
        };

        if uds.is_response() {
            if let Some((rejected, nrc)) = uds.negative_response() {
                warn!(
                    service_id = format!("0x{:02X}", rejected),
                    nrc = %nrc,
                    "Peer returned negative response"
                );
            }
            out.event(EngineEvent::UdsResponse {
                source_address: sa,
                message: uds,
            });
            return Ok(());
        }

        let mut followups = Vec::new();
        let response = self.serve(&uds, out, &mut followups);
        debug!(uds = %hex::encode(&response), "UDS response");
        out.frame(DiagnosticMessage::new(local, sa, response).into_frame());
        out.frames.extend(followups);
        Ok(())
    }

    // =========================================================================
    // UDS services
    // =========================================================================

    /// Serve one UDS request. Frames that must follow the response go to
    /// `followups`.
    fn serve(
        &mut self,
        msg: &UdsMessage,
        out: &mut EngineOutput,
        followups: &mut Vec<DoipFrame>,
    ) -> Vec<u8> {
        let sid = msg.service_id;
        let result = UdsRequest::parse(msg)
            .map_err(Error::from)
            .and_then(|request| self.dispatch(request, out, followups));

        match result {
            Ok(data) => encode_positive_response(sid, &data),
            Err(e) => {
                let nrc = e.nrc();
                warn!(
                    service_id = format!("0x{:02X}", sid),
                    nrc = %nrc,
                    error = %e,
                    "Request rejected"
                );
                encode_negative_response(sid, nrc)
            }
        }
    }

    fn dispatch(
        &mut self,
        request: UdsRequest,
        out: &mut EngineOutput,
        followups: &mut Vec<DoipFrame>,
    ) -> Result<Vec<u8>> {
        match request {
            UdsRequest::ReadDataByIdentifier { did } => self.read_data_by_identifier(did),
            UdsRequest::RoutineControl {
                sub_function,
                routine_id,
                ..
            } => self.routine_control(sub_function, routine_id, out, followups),
            UdsRequest::RequestDownload {
                data_format,
                address,
                size,
            } => self.request_download(data_format, address, size, out),
            UdsRequest::TransferData {
                block_counter,
                data,
            } => self.transfer_data(block_counter, &data, out),
            UdsRequest::RequestTransferExit { .. } => self.request_transfer_exit(out),
            UdsRequest::Unsupported { service_id } => Err(Error::rejected(
                service_id,
                NegativeResponseCode::ServiceNotSupported,
            )),
        }
    }

    // ===== ReadDataByIdentifier (0x22) =====

    fn read_data_by_identifier(&self, id: u16) -> Result<Vec<u8>> {
        let identity = &self.config.identity;
        let data = match id {
            did::VCI_INDIVIDUAL => identity.vci_record().encode(),
            did::VCI_CONSOLIDATED => encode_report(&self.vci_records()),
            did::HEALTH_STATUS => encode_report(&[identity.health_record()]),
            did::HEALTH_STATUS_CONSOLIDATED => encode_report(&self.health_records()),
            _ => {
                return Err(Error::rejected(
                    service_id::READ_DATA_BY_IDENTIFIER,
                    NegativeResponseCode::RequestOutOfRange,
                ))
            }
        };
        debug!(did = format!("0x{:04X}", id), len = data.len(), "ReadDataByIdentifier");

        let mut resp = id.to_be_bytes().to_vec();
        resp.extend(data);
        Ok(resp)
    }

    /// Own record first, then everything collected from other ECUs
    fn vci_records(&self) -> Vec<EcuVciRecord> {
        with_own(self.config.identity.vci_record(), &self.telemetry.vci)
    }

    fn health_records(&self) -> Vec<EcuHealthRecord> {
        with_own(self.config.identity.health_record(), &self.telemetry.health)
    }

    fn readiness_records(&self) -> Vec<EcuReadinessRecord> {
        with_own(self.config.identity.readiness_record(), &self.telemetry.readiness)
    }

    // ===== RoutineControl (0x31) =====

    fn routine_control(
        &mut self,
        sub_function: u8,
        routine_id: u16,
        out: &mut EngineOutput,
        followups: &mut Vec<DoipFrame>,
    ) -> Result<Vec<u8>> {
        let sid = service_id::ROUTINE_CONTROL;
        let is_vci = match routine_id {
            rid::VCI_COLLECTION_START | rid::VCI_SEND_REPORT => true,
            rid::READINESS_CHECK | rid::READINESS_SEND_REPORT => false,
            _ => return Err(Error::rejected(sid, NegativeResponseCode::RequestOutOfRange)),
        };

        let mut response = RoutineControlResponse {
            sub_function,
            routine_id,
            status: Some(RoutineStatus::Success),
            count: None,
        };

        match sub_function {
            routine_sub_function::START_ROUTINE => match routine_id {
                rid::VCI_COLLECTION_START | rid::READINESS_CHECK => {
                    if is_vci {
                        self.vci_collection_started = true;
                    } else {
                        self.readiness_check_started = true;
                    }
                    info!(routine_id = format!("0x{:04X}", routine_id), "Routine started");
                    out.event(EngineEvent::RoutineStarted { routine_id });
                }
                _ => {
                    let started = if is_vci {
                        self.vci_collection_started
                    } else {
                        self.readiness_check_started
                    };
                    if !started {
                        return Err(Error::rejected(sid, NegativeResponseCode::RequestSequenceError));
                    }
                    let (frame, count) = if is_vci {
                        let records = self.vci_records();
                        (DoipFrame::new(PayloadType::VciReport, encode_report(&records)), records.len())
                    } else {
                        let records = self.readiness_records();
                        (
                            DoipFrame::new(PayloadType::ReadinessReport, encode_report(&records)),
                            records.len(),
                        )
                    };
                    let count = count.min(u8::MAX as usize) as u8;
                    info!(
                        routine_id = format!("0x{:04X}", routine_id),
                        records = count,
                        "Sending report"
                    );
                    followups.push(frame);
                    response.count = Some(count);
                }
            },
            routine_sub_function::STOP_ROUTINE => {
                if is_vci {
                    self.vci_collection_started = false;
                } else {
                    self.readiness_check_started = false;
                }
            }
            routine_sub_function::REQUEST_ROUTINE_RESULTS => {
                // Same records the send-report routine would transmit
                let count = if is_vci {
                    self.vci_records().len()
                } else {
                    self.readiness_records().len()
                };
                response.count = Some(count.min(u8::MAX as usize) as u8);
            }
            _ => return Err(Error::rejected(sid, NegativeResponseCode::SubFunctionNotSupported)),
        }

        Ok(response.to_response_data())
    }

    // ===== RequestDownload (0x34) =====

    fn request_download(
        &mut self,
        data_format: u8,
        address: u32,
        size: u32,
        out: &mut EngineOutput,
    ) -> Result<Vec<u8>> {
        let max_block_length = self.transfer.request_download(data_format, address, size)?;
        self.inspected_header = None;
        out.event(EngineEvent::TransferStarted { address, size });

        let mut resp = vec![LENGTH_FORMAT_IDENTIFIER];
        resp.extend_from_slice(&max_block_length.to_be_bytes());
        Ok(resp)
    }

    // ===== TransferData (0x36) =====

    fn transfer_data(
        &mut self,
        block_counter: u8,
        data: &[u8],
        out: &mut EngineOutput,
    ) -> Result<Vec<u8>> {
        let ack = self.transfer.transfer_data(block_counter, data)?;

        if self.config.transfer.verify_package
            && self.inspected_header.is_none()
            && self.transfer.received().len() >= sw_package::HEADER_LEN
        {
            let prefix = &self.transfer.received()[..sw_package::HEADER_LEN];
            let inspected = sw_package::inspect_header(prefix, self.transfer.total_size())
                .and_then(|header| {
                    sw_package::resolve_target(&header, self.config.ecu_id).map(|_| header)
                });
            match inspected {
                Ok(header) => {
                    info!(
                        target = sw_package::ecu_name(header.target_ecu_id),
                        version = %header.version,
                        payload_size = header.payload_size,
                        "Software package header accepted"
                    );
                    self.inspected_header = Some(header);
                }
                Err(e) => return Err(self.fail_transfer(TransferError::from(e).into(), out)),
            }
        }

        Ok(vec![ack.block_counter])
    }

    // ===== RequestTransferExit (0x37) =====

    fn request_transfer_exit(&mut self, out: &mut EngineOutput) -> Result<Vec<u8>> {
        let completed = self.transfer.request_transfer_exit()?;

        let package = if self.config.transfer.verify_package {
            let verified = sw_package::verify(&completed.data).and_then(|header| {
                let (disposition, staging) = sw_package::resolve_target(&header, self.config.ecu_id)?;
                Ok(VerifiedPackage {
                    header,
                    disposition,
                    staging,
                })
            });
            match verified {
                Ok(package) => {
                    info!(
                        target = sw_package::ecu_name(package.header.target_ecu_id),
                        disposition = ?package.disposition,
                        staging = format!("0x{:08X}", package.staging.start),
                        "Software package verified"
                    );
                    Some(package)
                }
                Err(e) => return Err(self.fail_transfer(e.into(), out)),
            }
        } else {
            None
        };

        self.inspected_header = None;
        out.event(EngineEvent::TransferCompleted {
            address: completed.address,
            data: completed.data,
            package,
        });
        Ok(Vec::new())
    }

    fn fail_transfer(&mut self, err: Error, out: &mut EngineOutput) -> Error {
        error!(error = %err, "Transfer failed");
        self.transfer.fail();
        self.inspected_header = None;
        out.event(EngineEvent::TransferFailed {
            nrc: err.nrc(),
            reason: err.to_string(),
        });
        err
    }

    // =========================================================================
    // Host-driven operations
    // =========================================================================

    /// Run the alive-check schedule at `now`
    pub fn poll_alive_check(&mut self, now: Instant) -> EngineOutput {
        let mut out = EngineOutput::default();
        match self.routing.poll_alive_check(now) {
            AliveCheck::NotDue => {}
            AliveCheck::Send(frame) => out.frame(frame),
            AliveCheck::Expired => {
                self.abort_transfer(&mut out);
                out.event(EngineEvent::RoutingExpired {
                    tester_address: self.routing.peer_logical_address(),
                });
            }
        }
        out
    }

    /// Build a diagnostic message from this gateway to `target_address`
    pub fn diagnostic_request(&self, target_address: u16, uds: &[u8]) -> Result<DoipFrame> {
        if !self.routing.is_active() {
            return Err(Error::RoutingInactive);
        }
        let msg = UdsMessage::decode(uds)?;
        debug!(
            target_address = format!("0x{:04X}", target_address),
            service_id = format!("0x{:02X}", msg.service_id),
            "Outbound diagnostic request"
        );
        Ok(DiagnosticMessage::new(self.local_address(), target_address, uds.to_vec()).into_frame())
    }

    pub fn deactivate(&mut self) -> EngineOutput {
        let mut out = EngineOutput::default();
        if self.routing.deactivate() {
            self.abort_transfer(&mut out);
            out.event(EngineEvent::RoutingDeactivated);
        }
        out
    }

    fn abort_transfer(&mut self, out: &mut EngineOutput) {
        if self.transfer.is_active() {
            self.fail_transfer(Error::RoutingInactive, out);
        }
    }
}

fn with_own<R: TelemetryRecord + Clone>(own: R, collected: &[R]) -> Vec<R> {
    let own_id = own.ecu_id().to_string();
    let mut records = vec![own];
    records.extend(collected.iter().filter(|r| r.ecu_id() != own_id).cloned());
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doip::payload::{activation_type, RoutingActivationResponse};
    use crate::sw_package::{ecu_id, SoftwareType, SoftwareVersion};
    use crate::uds::encode_request;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const LOCAL: u16 = 0x0100;
    const TESTER: u16 = 0x0E00;

    fn engine() -> ProtocolEngine {
        ProtocolEngine::new(EngineConfig::default()).unwrap()
    }

    fn active_engine(now: Instant) -> ProtocolEngine {
        let mut engine = engine();
        let out = engine.handle_frame(
            &RoutingActivationRequest::new(TESTER, activation_type::DEFAULT).into_frame(),
            now,
        );
        assert_eq!(out.frames.len(), 1);
        engine
    }

    fn diag(uds: &[u8]) -> DoipFrame {
        DiagnosticMessage::new(TESTER, LOCAL, uds.to_vec()).into_frame()
    }

    /// UDS bytes of the last diagnostic message in `out`
    fn uds_reply(out: &EngineOutput) -> Vec<u8> {
        let frame = out
            .frames
            .iter()
            .rev()
            .find(|f| f.payload_type == PayloadType::DiagnosticMessage)
            .expect("no diagnostic response");
        let msg = DiagnosticMessage::parse(&frame.payload).unwrap();
        assert_eq!(msg.source_address, LOCAL);
        assert_eq!(msg.target_address, TESTER);
        msg.user_data.to_vec()
    }

    fn request(engine: &mut ProtocolEngine, uds: &[u8]) -> Vec<u8> {
        uds_reply(&engine.handle_frame(&diag(uds), Instant::now()))
    }

    #[test]
    fn test_routing_activation() {
        let mut engine = engine();
        let out = engine.handle_frame(
            &RoutingActivationRequest::new(TESTER, activation_type::DEFAULT).into_frame(),
            Instant::now(),
        );
        let resp = RoutingActivationResponse::parse(&out.frames[0].payload).unwrap();
        assert_eq!(u8::from(resp.code), 0x10);
        assert_eq!(resp.entity_address, LOCAL);
        assert_eq!(resp.tester_address, TESTER);
        assert_eq!(
            out.events,
            vec![EngineEvent::RoutingActivated {
                tester_address: TESTER,
                activation_type: 0x00
            }]
        );
        assert!(engine.routing().is_active());
    }

    #[test]
    fn test_diagnostic_before_activation() {
        let mut engine = engine();
        let out = engine.handle_frame(&diag(&[0x22, 0xF1, 0x94]), Instant::now());
        assert_eq!(out.frames.len(), 1);
        assert_eq!(uds_reply(&out), vec![0x7F, 0x22, 0x24]);
    }

    #[test]
    fn test_ack_precedes_response() {
        let mut engine = active_engine(Instant::now());
        let out = engine.handle_frame(&diag(&[0x22, 0xF1, 0x94]), Instant::now());
        assert_eq!(out.frames.len(), 2);
        assert_eq!(out.frames[0].payload_type, PayloadType::DiagnosticMessageAck);
        assert_eq!(&out.frames[0].payload[..], &[0x01, 0x00, 0x0E, 0x00, 0x00]);

        let reply = uds_reply(&out);
        assert_eq!(&reply[..3], &[0x62, 0xF1, 0x94]);
        assert_eq!(reply.len(), 3 + telemetry::VCI_RECORD_LEN);
    }

    #[test]
    fn test_address_checks() {
        let mut engine = active_engine(Instant::now());

        let frame = DiagnosticMessage::new(0x0E01, LOCAL, vec![0x22, 0xF1, 0x94]).into_frame();
        let out = engine.handle_frame(&frame, Instant::now());
        assert_eq!(out.frames[0].payload_type, PayloadType::DiagnosticMessageNack);
        assert_eq!(out.frames[0].payload[4], 0x02);

        let frame = DiagnosticMessage::new(TESTER, 0x0200, vec![0x22, 0xF1, 0x94]).into_frame();
        let out = engine.handle_frame(&frame, Instant::now());
        assert_eq!(out.frames[0].payload_type, PayloadType::DiagnosticMessageNack);
        assert_eq!(out.frames[0].payload[4], 0x03);
    }

    #[test]
    fn test_generic_nacks() {
        let mut engine = active_engine(Instant::now());

        let out = engine.handle_frame(&DoipFrame::new(PayloadType::Unknown(0x4242), Bytes::new()), Instant::now());
        assert_eq!(out.frames, vec![GenericNackCode::UnknownPayloadType.into_frame()]);

        let out = engine.handle_frame(
            &DoipFrame::new(PayloadType::DiagnosticMessage, vec![0x0E, 0x00, 0x01]),
            Instant::now(),
        );
        assert_eq!(out.frames, vec![GenericNackCode::InvalidPayloadLength.into_frame()]);

        let out = engine.handle_frame(
            &DoipFrame::new(PayloadType::RoutingActivationRequest, vec![0x0E]),
            Instant::now(),
        );
        assert_eq!(out.frames, vec![GenericNackCode::InvalidPayloadLength.into_frame()]);
        assert!(engine.routing().is_active());
    }

    #[test]
    fn test_read_data_by_identifier() {
        let mut engine = active_engine(Instant::now());

        let reply = request(&mut engine, &[0x22, 0xF1, 0xA0]);
        assert_eq!(&reply[..4], &[0x62, 0xF1, 0xA0, 0x01]);
        assert_eq!(reply.len(), 4 + telemetry::HEALTH_RECORD_LEN);

        let reply = request(&mut engine, &[0x22, 0xF1, 0x95]);
        assert_eq!(&reply[..4], &[0x62, 0xF1, 0x95, 0x01]);

        assert_eq!(request(&mut engine, &[0x22, 0x12, 0x34]), vec![0x7F, 0x22, 0x31]);
        assert_eq!(request(&mut engine, &[0x22, 0xF1]), vec![0x7F, 0x22, 0x13]);
        assert_eq!(request(&mut engine, &[0x10, 0x03]), vec![0x7F, 0x10, 0x11]);
    }

    #[test]
    fn test_consolidated_vci_includes_collected() {
        let mut engine = active_engine(Instant::now());
        let zone = EcuVciRecord {
            ecu_id: "ECU_011".into(),
            sw_version: "1.2.0".into(),
            hw_version: "S32K".into(),
            serial: "Z1-0001".into(),
        };
        let out = engine.handle_frame(
            &DoipFrame::new(PayloadType::VciReport, encode_report(&[zone.clone()])),
            Instant::now(),
        );
        assert!(matches!(&out.events[..], [EngineEvent::VciReport(r)] if r.records == vec![zone.clone()]));

        let reply = request(&mut engine, &[0x22, 0xF1, 0x95]);
        assert_eq!(reply[3], 2);
        let parsed = telemetry::parse_vci(&reply[3..]).unwrap();
        assert_eq!(parsed.records[0].ecu_id, "ECU_091");
        assert_eq!(parsed.records[1], zone);
    }

    #[test]
    fn test_routine_send_report_requires_start() {
        let mut engine = active_engine(Instant::now());

        assert_eq!(request(&mut engine, &[0x31, 0x01, 0xF0, 0x02]), vec![0x7F, 0x31, 0x24]);

        let out = engine.handle_frame(&diag(&[0x31, 0x01, 0xF0, 0x01]), Instant::now());
        assert_eq!(uds_reply(&out), vec![0x71, 0x01, 0xF0, 0x01, 0x00]);
        assert_eq!(out.events, vec![EngineEvent::RoutineStarted { routine_id: 0xF001 }]);

        let out = engine.handle_frame(&diag(&[0x31, 0x01, 0xF0, 0x02]), Instant::now());
        // ACK, response, then the report
        assert_eq!(out.frames.len(), 3);
        let reply = DiagnosticMessage::parse(&out.frames[1].payload).unwrap();
        assert_eq!(&reply.user_data[..], &[0x71, 0x01, 0xF0, 0x02, 0x00, 0x01]);
        assert_eq!(out.frames[2].payload_type, PayloadType::VciReport);
        assert_eq!(out.frames[2].payload.len(), 1 + telemetry::VCI_RECORD_LEN);
    }

    #[test]
    fn test_routine_errors() {
        let mut engine = active_engine(Instant::now());
        assert_eq!(request(&mut engine, &[0x31, 0x01, 0x12, 0x34]), vec![0x7F, 0x31, 0x31]);
        assert_eq!(request(&mut engine, &[0x31, 0x05, 0xF0, 0x01]), vec![0x7F, 0x31, 0x12]);
        assert_eq!(request(&mut engine, &[0x31, 0x01, 0xF0]), vec![0x7F, 0x31, 0x13]);

        request(&mut engine, &[0x31, 0x01, 0xF0, 0x03]);
        let reply = request(&mut engine, &[0x31, 0x01, 0xF0, 0x04]);
        assert_eq!(reply, vec![0x71, 0x01, 0xF0, 0x04, 0x00, 0x01]);
        request(&mut engine, &[0x31, 0x02, 0xF0, 0x03]);
        assert_eq!(request(&mut engine, &[0x31, 0x01, 0xF0, 0x04]), vec![0x7F, 0x31, 0x24]);
    }

    fn package(target: u16, payload: &[u8]) -> Vec<u8> {
        sw_package::build(
            SoftwarePackageHeader::new(target, SoftwareType::Application, SoftwareVersion::new(1, 4, 0, 3)),
            payload,
        )
    }

    fn download(engine: &mut ProtocolEngine, image: &[u8]) -> Vec<Vec<u8>> {
        let size = (image.len() as u32).to_be_bytes();
        let mut replies = vec![request(
            engine,
            &[0x34, 0x00, 0x44, 0x00, 0x10, 0x00, 0x00, size[0], size[1], size[2], size[3]],
        )];
        let mut counter = 1u8;
        for block in image.chunks(1024) {
            let mut uds = vec![0x36, counter];
            uds.extend_from_slice(block);
            replies.push(request(engine, &uds));
            counter = crate::transfer::next_block_counter(counter);
        }
        replies
    }

    #[test]
    fn test_download_verified_package() {
        let mut engine = active_engine(Instant::now());
        let payload: Vec<u8> = (0..1984u32).map(|i| (i % 251) as u8).collect();
        let image = package(ecu_id::ZGW, &payload);
        assert_eq!(image.len(), 2048);

        let replies = download(&mut engine, &image);
        assert_eq!(replies[0], vec![0x74, 0x20, 0x04, 0x00]);
        assert_eq!(replies[1], vec![0x76, 0x01]);
        assert_eq!(replies[2], vec![0x76, 0x02]);

        let out = engine.handle_frame(&diag(&[0x37]), Instant::now());
        assert_eq!(uds_reply(&out), vec![0x77]);
        match &out.events[..] {
            [EngineEvent::TransferCompleted {
                address,
                data,
                package: Some(pkg),
            }] => {
                assert_eq!(*address, 0x0010_0000);
                assert_eq!(data.len(), 2048);
                assert_eq!(pkg.disposition, PackageDisposition::Local);
                assert_eq!(pkg.staging.start, 0);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_download_forwarded_package() {
        let mut engine = active_engine(Instant::now());
        let image = package(ecu_id::ZONE_2, &[0x5A; 500]);
        download(&mut engine, &image);
        let out = engine.handle_frame(&diag(&[0x37]), Instant::now());
        assert!(matches!(
            &out.events[..],
            [EngineEvent::TransferCompleted { package: Some(VerifiedPackage {
                disposition: PackageDisposition::Forward { target_ecu_id: 0x0012 },
                ..
            }), .. }]
        ));
    }

    #[test]
    fn test_corrupted_package_fails_at_exit() {
        let mut engine = active_engine(Instant::now());
        let mut image = package(ecu_id::ZGW, &[0x11; 1000]);
        image[700] ^= 0xFF;
        download(&mut engine, &image);

        let out = engine.handle_frame(&diag(&[0x37]), Instant::now());
        assert_eq!(uds_reply(&out), vec![0x7F, 0x37, 0x72]);
        assert!(matches!(
            &out.events[..],
            [EngineEvent::TransferFailed { nrc: NegativeResponseCode::GeneralProgrammingFailure, .. }]
        ));
        assert_eq!(engine.transfer().state(), crate::transfer::TransferState::Failed);
    }

    #[test]
    fn test_bad_header_fails_early() {
        let mut engine = active_engine(Instant::now());
        let mut image = package(ecu_id::ZGW, &[0x22; 1500]);
        image[0] = 0x00;
        let replies = download(&mut engine, &image);
        assert_eq!(replies[1], vec![0x7F, 0x36, 0x72]);
        assert_eq!(engine.transfer().state(), crate::transfer::TransferState::Failed);

        // Unknown target ECU
        let image = package(0x0042, &[0x22; 1500]);
        let replies = download(&mut engine, &image);
        assert_eq!(replies[0], vec![0x74, 0x20, 0x04, 0x00]);
        assert_eq!(replies[1], vec![0x7F, 0x36, 0x31]);
    }

    #[test]
    fn test_unverified_download() {
        let mut config = EngineConfig::default();
        config.transfer.verify_package = false;
        let mut engine = ProtocolEngine::new(config).unwrap();
        engine.handle_frame(
            &RoutingActivationRequest::new(TESTER, activation_type::DEFAULT).into_frame(),
            Instant::now(),
        );

        let image = vec![0xAB; 2048];
        download(&mut engine, &image);
        let out = engine.handle_frame(&diag(&[0x37]), Instant::now());
        assert_eq!(uds_reply(&out), vec![0x77]);
        assert!(matches!(
            &out.events[..],
            [EngineEvent::TransferCompleted { package: None, data, .. }] if data.len() == 2048
        ));
    }

    #[test]
    fn test_transfer_errors_are_recoverable() {
        let mut engine = active_engine(Instant::now());
        assert_eq!(request(&mut engine, &[0x36, 0x01, 0x00]), vec![0x7F, 0x36, 0x24]);
        assert_eq!(request(&mut engine, &[0x37]), vec![0x7F, 0x37, 0x24]);

        let image = package(ecu_id::ZGW, &[0x33; 1984]);
        let size = (image.len() as u32).to_be_bytes();
        request(&mut engine, &[0x34, 0x00, 0x44, 0, 0x10, 0, 0, size[0], size[1], size[2], size[3]]);

        let mut block = vec![0x36, 0x02];
        block.extend_from_slice(&image[..1024]);
        assert_eq!(request(&mut engine, &block), vec![0x7F, 0x36, 0x73]);
        assert_eq!(engine.transfer().bytes_transferred(), 0);

        block[1] = 0x01;
        assert_eq!(request(&mut engine, &block), vec![0x76, 0x01]);
        assert_eq!(request(&mut engine, &[0x37]), vec![0x7F, 0x37, 0x24]);
        assert_eq!(
            request(&mut engine, &[0x34, 0x00, 0x44, 0, 0, 0, 0, 0, 0, 0x10, 0]),
            vec![0x7F, 0x34, 0x22]
        );
        assert!(engine.transfer().is_active());
    }

    #[test]
    fn test_uds_response_surfaces_as_event() {
        let mut engine = active_engine(Instant::now());
        let out = engine.handle_frame(&diag(&[0x71, 0x01, 0xF0, 0x02, 0x00, 0x03]), Instant::now());
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].payload_type, PayloadType::DiagnosticMessageAck);
        match &out.events[..] {
            [EngineEvent::UdsResponse { source_address, message }] => {
                assert_eq!(*source_address, TESTER);
                let resp = RoutineControlResponse::parse(message).unwrap();
                assert_eq!(resp.count, Some(3));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn test_alive_check_expiry_aborts_transfer() {
        let t0 = Instant::now();
        let mut engine = active_engine(t0);
        request(&mut engine, &[0x34, 0x00, 0x44, 0, 0, 0, 0, 0, 0, 0x10, 0]);

        let interval = engine.routing().alive_check_interval();
        let out = engine.poll_alive_check(t0 + interval);
        assert_eq!(out.frames.len(), 1);
        assert_eq!(out.frames[0].payload_type, PayloadType::AliveCheckRequest);

        let out = engine.poll_alive_check(t0 + interval * 2 + Duration::from_millis(1));
        assert!(out.frames.is_empty());
        assert!(matches!(out.events[0], EngineEvent::TransferFailed { .. }));
        assert_eq!(
            out.events[1],
            EngineEvent::RoutingExpired {
                tester_address: Some(TESTER)
            }
        );
        assert!(!engine.routing().is_active());
    }

    #[test]
    fn test_diagnostic_request_requires_activation() {
        let mut engine = engine();
        let uds = encode_request(0x22, None, &[0xF1, 0x90]);
        assert!(matches!(
            engine.diagnostic_request(0x0011, &uds),
            Err(Error::RoutingInactive)
        ));

        engine.handle_frame(
            &RoutingActivationRequest::new(TESTER, activation_type::DEFAULT).into_frame(),
            Instant::now(),
        );
        let frame = engine.diagnostic_request(0x0011, &uds).unwrap();
        let msg = DiagnosticMessage::parse(&frame.payload).unwrap();
        assert_eq!((msg.source_address, msg.target_address), (LOCAL, 0x0011));
        assert_eq!(&msg.user_data[..], &uds[..]);

        assert_eq!(engine.deactivate().events, vec![EngineEvent::RoutingDeactivated]);
        assert!(engine.deactivate().is_empty());
    }

    #[test]
    fn test_alive_check_request_from_peer() {
        let mut engine = active_engine(Instant::now());
        let out = engine.handle_frame(&AliveCheckRequest { source_address: TESTER }.into_frame(), Instant::now());
        assert_eq!(
            out.frames,
            vec![AliveCheckResponse {
                source_address: Some(LOCAL)
            }
            .into_frame()]
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.routing.alive_check_interval_ms = 0;
        assert!(matches!(
            ProtocolEngine::new(config),
            Err(Error::Config(crate::config::ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn test_activation_by_other_tester_aborts_transfer() {
        let now = Instant::now();
        let mut engine = active_engine(now);
        request(&mut engine, &[0x34, 0x00, 0x44, 0, 0, 0, 0, 0, 0, 0x10, 0]);
        assert!(engine.transfer().is_active());

        // Re-activation by the same tester keeps the download
        let out = engine.handle_frame(
            &RoutingActivationRequest::new(TESTER, activation_type::DEFAULT).into_frame(),
            now,
        );
        assert_eq!(out.events.len(), 1);
        assert!(engine.transfer().is_active());

        let out = engine.handle_frame(
            &RoutingActivationRequest::new(0x0E01, activation_type::DEFAULT).into_frame(),
            now,
        );
        assert!(!engine.transfer().is_active());
        assert!(matches!(
            out.events[0],
            EngineEvent::TransferFailed {
                nrc: NegativeResponseCode::RequestSequenceError,
                ..
            }
        ));
        assert!(matches!(
            out.events[1],
            EngineEvent::RoutingActivated {
                tester_address: 0x0E01,
                ..
            }
        ));
    }

    #[test]
    fn test_results_count_matches_sent_report() {
        let mut engine = active_engine(Instant::now());
        request(&mut engine, &[0x31, 0x01, 0xF0, 0x01]);

        let results = request(&mut engine, &[0x31, 0x03, 0xF0, 0x01]);
        assert_eq!(results, vec![0x71, 0x03, 0xF0, 0x01, 0x00, 0x01]);
        let sent = request(&mut engine, &[0x31, 0x01, 0xF0, 0x02]);
        assert_eq!(sent[5], results[5]);
    }
}
