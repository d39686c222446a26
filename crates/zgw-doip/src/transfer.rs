//! Firmware download state machine
//!
//! Drives the RequestDownload (0x34) → TransferData (0x36) →
//! RequestTransferExit (0x37) sequence:
//!
//! ```text
//!  Idle ──0x34──▶ Downloading ──last 0x36──▶ AwaitingExit ──0x37──▶ Complete
//!                     │                            │
//!                     └────────── fail() ──────────┴──────────────▶ Failed
//! ```
//!
//! `Complete` and `Failed` accept a fresh RequestDownload.

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sw_package::PackageError;
use crate::uds::NegativeResponseCode;

/// Initial capacity cap for the reassembly buffer
const MAX_PREALLOCATION: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Downloading,
    AwaitingExit,
    Complete,
    Failed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Download already in progress ({state:?})")]
    AlreadyActive { state: TransferState },

    #[error("Invalid address/size: address 0x{address:08X}, size {size}")]
    InvalidAddressOrSize { address: u32, size: u32 },

    #[error("No download in progress")]
    NoActiveTransfer,

    #[error("Wrong block sequence counter: expected {expected}, got {got}")]
    SequenceError { expected: u8, got: u8 },

    #[error("Data overflow: {transferred} + {len} bytes exceeds {total}")]
    Overflow {
        transferred: u32,
        len: usize,
        total: u32,
    },

    #[error("Invalid block length {len} (allowed 1..={max})")]
    InvalidBlockLength { len: usize, max: u16 },

    #[error("Transfer exit requested after {transferred} of {total} bytes")]
    PrematureExit { transferred: u32, total: u32 },

    #[error("Package rejected: {0}")]
    Package(#[from] PackageError),
}

impl TransferError {
    pub fn nrc(&self) -> NegativeResponseCode {
        match self {
            Self::AlreadyActive { .. } => NegativeResponseCode::ConditionsNotCorrect,
            Self::InvalidAddressOrSize { .. } => NegativeResponseCode::RequestOutOfRange,
            Self::NoActiveTransfer | Self::PrematureExit { .. } => {
                NegativeResponseCode::RequestSequenceError
            }
            Self::SequenceError { .. } => NegativeResponseCode::WrongBlockSequenceCounter,
            Self::Overflow { .. } => NegativeResponseCode::TransferDataSuspended,
            Self::InvalidBlockLength { .. } => NegativeResponseCode::IncorrectMessageLengthOrFormat,
            Self::Package(e) => e.nrc(),
        }
    }
}

/// Negotiation parameters and the writable flash window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferLimits {
    /// Largest TransferData payload (excluding SID and counter)
    pub max_block_length: u16,
    pub flash_base: u32,
    pub flash_size: u32,
}

impl TransferLimits {
    fn contains(&self, address: u32, size: u32) -> bool {
        let end = address as u64 + size as u64;
        size > 0 && address >= self.flash_base && end <= self.flash_base as u64 + self.flash_size as u64
    }
}

/// Acknowledgement of one accepted block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAck {
    pub block_counter: u8,
    pub bytes_transferred: u32,
    /// True when this block completed the declared size
    pub last_block: bool,
}

/// Result of a successful RequestTransferExit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedTransfer {
    pub address: u32,
    pub data: Bytes,
}

/// Counter after `counter`: 1..=255, wrapping to 1
pub fn next_block_counter(counter: u8) -> u8 {
    if counter == u8::MAX {
        1
    } else {
        counter + 1
    }
}

#[derive(Debug)]
pub struct FirmwareTransferSession {
    limits: TransferLimits,
    state: TransferState,
    target_address: u32,
    total_size: u32,
    next_block_counter: u8,
    bytes_transferred: u32,
    data_format: u8,
    buffer: Vec<u8>,
}

impl FirmwareTransferSession {
    pub fn new(limits: TransferLimits) -> Self {
        Self {
            limits,
            state: TransferState::Idle,
            target_address: 0,
            total_size: 0,
            next_block_counter: 1,
            bytes_transferred: 0,
            data_format: 0,
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            TransferState::Downloading | TransferState::AwaitingExit
        )
    }

    pub fn target_address(&self) -> u32 {
        self.target_address
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn bytes_transferred(&self) -> u32 {
        self.bytes_transferred
    }

    pub fn next_block_counter(&self) -> u8 {
        self.next_block_counter
    }

    pub fn max_block_length(&self) -> u16 {
        self.limits.max_block_length
    }

    pub fn data_format(&self) -> u8 {
        self.data_format
    }

    /// Bytes received so far
    pub fn received(&self) -> &[u8] {
        &self.buffer
    }

    // ===== RequestDownload (0x34) =====

    /// Open a download and return the negotiated max block length.
    pub fn request_download(
        &mut self,
        data_format: u8,
        address: u32,
        size: u32,
    ) -> Result<u16, TransferError> {
        if self.is_active() {
            warn!(state = ?self.state, "RequestDownload rejected: download already active");
            return Err(TransferError::AlreadyActive { state: self.state });
        }
        if !self.limits.contains(address, size) {
            warn!(
                address = format!("0x{:08X}", address),
                size, "RequestDownload rejected: outside flash window"
            );
            return Err(TransferError::InvalidAddressOrSize { address, size });
        }

        self.state = TransferState::Downloading;
        self.target_address = address;
        self.total_size = size;
        self.next_block_counter = 1;
        self.bytes_transferred = 0;
        self.data_format = data_format;
        self.buffer = Vec::with_capacity((size as usize).min(MAX_PREALLOCATION));

        info!(
            address = format!("0x{:08X}", address),
            size,
            max_block_length = self.limits.max_block_length,
            "RequestDownload: download started"
        );
        Ok(self.limits.max_block_length)
    }

    // ===== TransferData (0x36) =====

    pub fn transfer_data(&mut self, block_counter: u8, data: &[u8]) -> Result<BlockAck, TransferError> {
        if !self.is_active() {
            return Err(TransferError::NoActiveTransfer);
        }

        let max = self.limits.max_block_length;
        if data.is_empty() || data.len() > max as usize {
            return Err(TransferError::InvalidBlockLength {
                len: data.len(),
                max,
            });
        }

        if block_counter != self.next_block_counter {
            debug!(
                expected = self.next_block_counter,
                received = block_counter,
                "TransferData: wrong block sequence counter"
            );
            return Err(TransferError::SequenceError {
                expected: self.next_block_counter,
                got: block_counter,
            });
        }

        if self.bytes_transferred as u64 + data.len() as u64 > self.total_size as u64 {
            warn!(
                transferred = self.bytes_transferred,
                len = data.len(),
                total = self.total_size,
                "TransferData: data overflow"
            );
            return Err(TransferError::Overflow {
                transferred: self.bytes_transferred,
                len: data.len(),
                total: self.total_size,
            });
        }

        self.buffer.extend_from_slice(data);
        // Bounded by total_size above
        self.bytes_transferred += data.len() as u32;
        self.next_block_counter = next_block_counter(block_counter);

        let last_block = self.bytes_transferred == self.total_size;
        if last_block {
            self.state = TransferState::AwaitingExit;
        }

        debug!(
            block = block_counter,
            len = data.len(),
            transferred = self.bytes_transferred,
            total = self.total_size,
            "TransferData: block accepted"
        );

        Ok(BlockAck {
            block_counter,
            bytes_transferred: self.bytes_transferred,
            last_block,
        })
    }

    // ===== RequestTransferExit (0x37) =====

    pub fn request_transfer_exit(&mut self) -> Result<CompletedTransfer, TransferError> {
        match self.state {
            TransferState::AwaitingExit => {
                self.state = TransferState::Complete;
                let data = Bytes::from(std::mem::take(&mut self.buffer));
                info!(
                    address = format!("0x{:08X}", self.target_address),
                    size = self.total_size,
                    "RequestTransferExit: download complete"
                );
                Ok(CompletedTransfer {
                    address: self.target_address,
                    data,
                })
            }
            TransferState::Downloading => Err(TransferError::PrematureExit {
                transferred: self.bytes_transferred,
                total: self.total_size,
            }),
            _ => Err(TransferError::NoActiveTransfer),
        }
    }

    /// Abort the current download and drop the buffered bytes.
    pub fn fail(&mut self) {
        if self.state != TransferState::Failed {
            warn!(
                transferred = self.bytes_transferred,
                total = self.total_size,
                "Download aborted"
            );
        }
        self.state = TransferState::Failed;
        self.buffer = Vec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn limits() -> TransferLimits {
        TransferLimits {
            max_block_length: 1024,
            flash_base: 0,
            flash_size: 0x0400_0000,
        }
    }

    #[test]
    fn test_scenario_two_blocks_then_exit() {
        let mut session = FirmwareTransferSession::new(limits());
        assert_eq!(session.request_download(0x00, 0x0010_0000, 2048), Ok(1024));
        assert_eq!(session.state(), TransferState::Downloading);

        let ack = session.transfer_data(1, &[0xAA; 1024]).unwrap();
        assert!(!ack.last_block);
        let ack = session.transfer_data(2, &[0xBB; 1024]).unwrap();
        assert!(ack.last_block);
        assert_eq!(session.state(), TransferState::AwaitingExit);

        let done = session.request_transfer_exit().unwrap();
        assert_eq!(session.bytes_transferred(), 2048);
        assert_eq!(session.state(), TransferState::Complete);
        assert_eq!(done.address, 0x0010_0000);
        assert_eq!(done.data.len(), 2048);
        assert_eq!(done.data[1023], 0xAA);
        assert_eq!(done.data[1024], 0xBB);
    }

    #[test]
    fn test_counter_wraps_to_one_after_255_blocks() {
        let mut session = FirmwareTransferSession::new(limits());
        session.request_download(0, 0, 300).unwrap();

        for expected in 1..=255u8 {
            assert_eq!(session.next_block_counter(), expected);
            session.transfer_data(expected, &[expected]).unwrap();
        }
        assert_eq!(session.next_block_counter(), 1);
        session.transfer_data(1, &[0]).unwrap();
        assert_eq!(session.next_block_counter(), 2);
        assert_eq!(session.bytes_transferred(), 256);
    }

    #[test]
    fn test_next_block_counter_never_zero() {
        assert_eq!(next_block_counter(254), 255);
        assert_eq!(next_block_counter(255), 1);
        assert!((0..=255u8).all(|c| next_block_counter(c) != 0));
    }

    #[test]
    fn test_sequence_error_leaves_progress_unchanged() {
        let mut session = FirmwareTransferSession::new(limits());
        session.request_download(0, 0x1000, 4096).unwrap();
        session.transfer_data(1, &[0; 512]).unwrap();

        for wrong in [0u8, 1, 3, 200] {
            assert_eq!(
                session.transfer_data(wrong, &[0; 16]),
                Err(TransferError::SequenceError {
                    expected: 2,
                    got: wrong
                })
            );
            assert_eq!(session.bytes_transferred(), 512);
            assert_eq!(session.next_block_counter(), 2);
        }
    }

    #[test]
    fn test_overflow_is_rejected() {
        let mut session = FirmwareTransferSession::new(limits());
        session.request_download(0, 0, 100).unwrap();
        let err = session.transfer_data(1, &[0; 101]).unwrap_err();
        assert_eq!(
            err,
            TransferError::Overflow {
                transferred: 0,
                len: 101,
                total: 100
            }
        );
        assert_eq!(err.nrc(), NegativeResponseCode::TransferDataSuspended);
        assert_eq!(session.bytes_transferred(), 0);
        assert_eq!(session.state(), TransferState::Downloading);
    }

    #[test]
    fn test_block_length_limits() {
        let mut session = FirmwareTransferSession::new(limits());
        session.request_download(0, 0, 4096).unwrap();
        assert!(matches!(
            session.transfer_data(1, &[]),
            Err(TransferError::InvalidBlockLength { len: 0, .. })
        ));
        assert!(matches!(
            session.transfer_data(1, &[0; 1025]),
            Err(TransferError::InvalidBlockLength { len: 1025, max: 1024 })
        ));
    }

    #[test]
    fn test_premature_exit() {
        let mut session = FirmwareTransferSession::new(limits());
        session.request_download(0, 0, 2048).unwrap();
        session.transfer_data(1, &[0; 1024]).unwrap();
        let err = session.request_transfer_exit().unwrap_err();
        assert_eq!(
            err,
            TransferError::PrematureExit {
                transferred: 1024,
                total: 2048
            }
        );
        assert_eq!(err.nrc(), NegativeResponseCode::RequestSequenceError);
        assert_eq!(session.state(), TransferState::Downloading);
    }

    #[test]
    fn test_bounds_and_reentry() {
        let mut session = FirmwareTransferSession::new(limits());
        assert!(matches!(
            session.request_download(0, 0, 0),
            Err(TransferError::InvalidAddressOrSize { .. })
        ));
        assert!(matches!(
            session.request_download(0, 0x03FF_FF00, 0x200),
            Err(TransferError::InvalidAddressOrSize { .. })
        ));
        assert!(matches!(
            session.request_download(0, u32::MAX, 2),
            Err(TransferError::InvalidAddressOrSize { .. })
        ));

        session.request_download(0, 0, 16).unwrap();
        assert_eq!(
            session.request_download(0, 0, 16),
            Err(TransferError::AlreadyActive {
                state: TransferState::Downloading
            })
        );
        assert_eq!(
            TransferError::AlreadyActive {
                state: TransferState::Downloading
            }
            .nrc(),
            NegativeResponseCode::ConditionsNotCorrect
        );
    }

    #[test]
    fn test_no_active_transfer() {
        let mut session = FirmwareTransferSession::new(limits());
        assert_eq!(session.transfer_data(1, &[0]), Err(TransferError::NoActiveTransfer));
        assert_eq!(session.request_transfer_exit(), Err(TransferError::NoActiveTransfer));
    }

    #[test]
    fn test_fail_discards_and_allows_restart() {
        let mut session = FirmwareTransferSession::new(limits());
        session.request_download(0, 0, 64).unwrap();
        session.transfer_data(1, &[1; 32]).unwrap();
        session.fail();
        assert_eq!(session.state(), TransferState::Failed);
        assert!(session.received().is_empty());
        assert_eq!(session.transfer_data(2, &[1; 32]), Err(TransferError::NoActiveTransfer));

        assert_eq!(session.request_download(0, 0, 64), Ok(1024));
        assert_eq!(session.next_block_counter(), 1);
        assert_eq!(session.bytes_transferred(), 0);
    }
}
