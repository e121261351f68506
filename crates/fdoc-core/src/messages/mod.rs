//! Typed message set for the three onboarding sub-protocols.
//!
//! Every inbound message declares its type through an explicit integer code
//! (the `Message-Type` header of the HTTP-style exchange). Dispatch is a
//! lookup over [`MsgType`] — a closed sum over the finite message set — not
//! runtime type inspection.
//!
//! - [`to0`]: owner registers its redirect blob with the rendezvous service
//! - [`to1`]: device obtains the owner redirect from the rendezvous service
//! - [`to2`]: device and owner complete the ownership transfer

pub mod to0;
pub mod to1;
pub mod to2;

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Sub-protocol discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Protocol {
    /// Ownership transfer to the rendezvous service.
    To0,
    /// Device-to-rendezvous redirection.
    To1,
    /// Ownership transfer to the owner.
    To2,
}

impl From<Protocol> for u8 {
    fn from(value: Protocol) -> Self {
        match value {
            Protocol::To0 => 0,
            Protocol::To1 => 1,
            Protocol::To2 => 2,
        }
    }
}

impl TryFrom<u8> for Protocol {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::To0),
            1 => Ok(Self::To1),
            2 => Ok(Self::To2),
            other => Err(format!("unknown protocol {other}")),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::To0 => f.write_str("TO0"),
            Self::To1 => f.write_str("TO1"),
            Self::To2 => f.write_str("TO2"),
        }
    }
}

/// Wire message-type codes.
///
/// Codes are part of the external format and never renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MsgType {
    /// TO0 owner hello.
    To0Hello             = 20,
    /// TO0 hello acknowledgment carrying the sign nonce.
    To0HelloAck          = 21,
    /// TO0 signed redirect registration.
    To0OwnerSign         = 22,
    /// TO0 acceptance with the re-registration interval.
    To0AcceptOwner       = 23,
    /// TO1 device hello.
    To1HelloRv           = 30,
    /// TO1 hello acknowledgment carrying the proof nonce.
    To1HelloRvAck        = 31,
    /// TO1 device proof over the issued nonce.
    To1ProveToRv         = 32,
    /// TO1 owner redirect response.
    To1RvRedirect        = 33,
    /// TO2 device hello opening the ownership transfer.
    To2HelloDevice       = 60,
    /// TO2 owner proof over the voucher header.
    To2ProveOvHdr        = 61,
    /// TO2 voucher entry request.
    To2GetOvNextEntry    = 62,
    /// TO2 voucher entry response.
    To2OvNextEntry       = 63,
    /// TO2 device proof; the session key is derived here.
    To2ProveDevice       = 64,
    /// TO2 owner setup response.
    To2SetupDevice       = 65,
    /// TO2 device service-info readiness signal.
    To2DeviceServiceInfoReady = 66,
    /// TO2 owner service-info readiness signal.
    To2OwnerServiceInfoReady  = 67,
    /// TO2 device service-info page.
    To2DeviceServiceInfo = 68,
    /// TO2 owner service-info page.
    To2OwnerServiceInfo  = 69,
    /// TO2 device completion.
    To2Done              = 70,
    /// TO2 owner completion acknowledgment.
    To2Done2             = 71,
    /// Error report, valid in any sub-protocol.
    Error                = 255,
}

impl MsgType {
    /// Wire code of this message type.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Looks up a message type by wire code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            20 => Some(Self::To0Hello),
            21 => Some(Self::To0HelloAck),
            22 => Some(Self::To0OwnerSign),
            23 => Some(Self::To0AcceptOwner),
            30 => Some(Self::To1HelloRv),
            31 => Some(Self::To1HelloRvAck),
            32 => Some(Self::To1ProveToRv),
            33 => Some(Self::To1RvRedirect),
            60 => Some(Self::To2HelloDevice),
            61 => Some(Self::To2ProveOvHdr),
            62 => Some(Self::To2GetOvNextEntry),
            63 => Some(Self::To2OvNextEntry),
            64 => Some(Self::To2ProveDevice),
            65 => Some(Self::To2SetupDevice),
            66 => Some(Self::To2DeviceServiceInfoReady),
            67 => Some(Self::To2OwnerServiceInfoReady),
            68 => Some(Self::To2DeviceServiceInfo),
            69 => Some(Self::To2OwnerServiceInfo),
            70 => Some(Self::To2Done),
            71 => Some(Self::To2Done2),
            255 => Some(Self::Error),
            _ => None,
        }
    }

    /// Sub-protocol this message belongs to. [`MsgType::Error`] belongs to
    /// none.
    #[must_use]
    pub const fn protocol(self) -> Option<Protocol> {
        match self.code() {
            20..=23 => Some(Protocol::To0),
            30..=33 => Some(Protocol::To1),
            60..=71 => Some(Protocol::To2),
            _ => None,
        }
    }
}

impl From<MsgType> for u8 {
    fn from(value: MsgType) -> Self {
        value.code()
    }
}

impl TryFrom<u8> for MsgType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        Self::from_code(value).ok_or_else(|| format!("unknown message type {value}"))
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Coarse wire error codes carried by [`ErrorMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ErrorCode {
    /// Request body unreadable or undecodable.
    MessageBody,
    /// Message contents failed validation (bad nonce, bad signature, wrong
    /// sequence).
    InvalidMessage,
    /// Referenced device has no voucher or resource on file.
    ResourceNotFound,
    /// Persistence or unexpected library failure.
    Internal,
}

impl From<ErrorCode> for u16 {
    fn from(value: ErrorCode) -> Self {
        match value {
            ErrorCode::MessageBody => 100,
            ErrorCode::InvalidMessage => 101,
            ErrorCode::ResourceNotFound => 102,
            ErrorCode::Internal => 500,
        }
    }
}

impl TryFrom<u16> for ErrorCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            100 => Ok(Self::MessageBody),
            101 => Ok(Self::InvalidMessage),
            102 => Ok(Self::ResourceNotFound),
            500 => Ok(Self::Internal),
            other => Err(format!("unknown error code {other}")),
        }
    }
}

/// Wire error object (message type 255).
///
/// Every error response is itself a well-formed encoded message so a
/// conformant peer can always decode what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Coarse error class.
    pub error_code: ErrorCode,
    /// Wire code of the message being answered.
    pub prev_msg_type: u8,
    /// Human-readable description.
    pub message: String,
    /// Unix timestamp (seconds) when the error was produced.
    pub timestamp: u64,
    /// Correlation identifier for log cross-referencing.
    pub correlation_id: uuid::Uuid,
}

impl ErrorMessage {
    /// Builds an error message stamped with the current time.
    #[must_use]
    pub fn new(error_code: ErrorCode, prev_msg_type: MsgType, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            error_code,
            prev_msg_type: prev_msg_type.code(),
            message: message.into(),
            timestamp,
            correlation_id: uuid::Uuid::new_v4(),
        }
    }
}
