use crate::error::CoreError;
use serde::{Deserialize, Serialize};

pub const MMS_VERSION_1_3: u8 = 0x13;
pub const RESPONSE_STATUS_OK: u8 = 0x80;
pub const STATUS_RETRIEVED: u8 = 0x81;
pub const STATUS_DEFERRED: u8 = 0x83;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    SendReq,
    SendConf,
    NotificationInd,
    NotifyRespInd,
    RetrieveConf,
    AcknowledgeInd,
    DeliveryInd,
    ReadRecInd,
    ReadOrigInd,
}

impl MessageType {
    pub fn code(self) -> u8 {
        match self {
            MessageType::SendReq => 0x80,
            MessageType::SendConf => 0x81,
            MessageType::NotificationInd => 0x82,
            MessageType::NotifyRespInd => 0x83,
            MessageType::RetrieveConf => 0x84,
            MessageType::AcknowledgeInd => 0x85,
            MessageType::DeliveryInd => 0x86,
            MessageType::ReadRecInd => 0x87,
            MessageType::ReadOrigInd => 0x88,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x80 => MessageType::SendReq,
            0x81 => MessageType::SendConf,
            0x82 => MessageType::NotificationInd,
            0x83 => MessageType::NotifyRespInd,
            0x84 => MessageType::RetrieveConf,
            0x85 => MessageType::AcknowledgeInd,
            0x86 => MessageType::DeliveryInd,
            0x87 => MessageType::ReadRecInd,
            0x88 => MessageType::ReadOrigInd,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationInd {
    pub transaction_id: Vec<u8>,
    pub content_location: String,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub message_size: u64,
    pub expiry_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrieveConf {
    pub message_id: Option<String>,
    pub transaction_id: Option<Vec<u8>>,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub date: u64,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendReq {
    pub transaction_id: Vec<u8>,
    pub to: Vec<String>,
    pub subject: Option<String>,
    pub date: u64,
    pub content_type: String,
    pub body: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendConf {
    pub transaction_id: Vec<u8>,
    pub response_status: u8,
    pub message_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadRecInd {
    pub message_id: String,
    pub to: Vec<String>,
    pub read_status: u8,
    pub date: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AcknowledgeInd {
    pub version: u8,
    pub transaction_id: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyRespInd {
    pub version: u8,
    pub transaction_id: Vec<u8>,
    pub status: u8,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenericPdu {
    NotificationInd(NotificationInd),
    RetrieveConf(RetrieveConf),
    SendReq(SendReq),
    SendConf(SendConf),
    ReadRecInd(ReadRecInd),
    AcknowledgeInd(AcknowledgeInd),
    NotifyRespInd(NotifyRespInd),
}

impl GenericPdu {
    pub fn message_type(&self) -> MessageType {
        match self {
            GenericPdu::NotificationInd(_) => MessageType::NotificationInd,
            GenericPdu::RetrieveConf(_) => MessageType::RetrieveConf,
            GenericPdu::SendReq(_) => MessageType::SendReq,
            GenericPdu::SendConf(_) => MessageType::SendConf,
            GenericPdu::ReadRecInd(_) => MessageType::ReadRecInd,
            GenericPdu::AcknowledgeInd(_) => MessageType::AcknowledgeInd,
            GenericPdu::NotifyRespInd(_) => MessageType::NotifyRespInd,
        }
    }
}

/// Parses relay bytes into typed PDUs and serializes them back.
pub trait PduCodec: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<GenericPdu, CoreError>;
    fn compose(&self, pdu: &GenericPdu) -> Result<Vec<u8>, CoreError>;
}

/// JSON framing of [`GenericPdu`], used by the in-process relay and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonPduCodec;

impl PduCodec for JsonPduCodec {
    fn parse(&self, bytes: &[u8]) -> Result<GenericPdu, CoreError> {
        serde_json::from_slice(bytes).map_err(|_| CoreError::Codec)
    }

    fn compose(&self, pdu: &GenericPdu) -> Result<Vec<u8>, CoreError> {
        serde_json::to_vec(pdu).map_err(|_| CoreError::Codec)
    }
}
