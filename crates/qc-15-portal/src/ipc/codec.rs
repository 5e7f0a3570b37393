//! Instruction record codec.
//!
//! An instruction travels as four strings: metadata type ID, shard ID,
//! status and content. Submitted actions carry status `request` and a
//! base64-encoded JSON [`ActionEnvelope`]; results carry plain JSON.

use crate::domain::{
    BridgeTokenDelta, InstructionKind, InstructionStatus, PortalError,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Number of fields in an instruction record.
pub const RECORD_FIELDS: usize = 4;

/// A submitted action: the transaction that carried it and its metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionEnvelope {
    /// Shard transaction ID.
    pub tx_req_id: String,
    /// Kind-specific metadata.
    pub meta: serde_json::Value,
}

impl ActionEnvelope {
    /// Decode the metadata into a typed action.
    pub fn meta_as<T: DeserializeOwned>(&self) -> Result<T, PortalError> {
        Ok(serde_json::from_value(self.meta.clone())?)
    }
}

/// Encode an action payload for a `request` record.
pub fn encode_action<T: Serialize>(tx_req_id: &str, meta: &T) -> Result<String, PortalError> {
    let envelope = ActionEnvelope {
        tx_req_id: tx_req_id.to_string(),
        meta: serde_json::to_value(meta)?,
    };
    Ok(STANDARD.encode(serde_json::to_vec(&envelope)?))
}

/// Decode the payload of a `request` record.
pub fn decode_action(payload: &str) -> Result<ActionEnvelope, PortalError> {
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| PortalError::Codec(format!("base64: {e}")))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// One instruction, inbound or emitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// Metadata type.
    pub kind: InstructionKind,
    /// Shard the instruction concerns.
    pub shard_id: u8,
    /// Status.
    pub status: InstructionStatus,
    /// Content: base64 envelope for requests, JSON for results.
    pub content: String,
}

impl Instruction {
    /// Result instruction with JSON content.
    pub fn new<T: Serialize>(
        kind: InstructionKind,
        shard_id: u8,
        status: InstructionStatus,
        content: &T,
    ) -> Result<Self, PortalError> {
        Ok(Self {
            kind,
            shard_id,
            status,
            content: serde_json::to_string(content)?,
        })
    }

    /// Submitted action.
    pub fn action<T: Serialize>(
        kind: InstructionKind,
        shard_id: u8,
        tx_req_id: &str,
        meta: &T,
    ) -> Result<Self, PortalError> {
        Ok(Self {
            kind,
            shard_id,
            status: InstructionStatus::Request,
            content: encode_action(tx_req_id, meta)?,
        })
    }

    /// Parse a record. Records with fewer than four fields yield `None`.
    pub fn from_record(record: &[String]) -> Result<Option<Self>, PortalError> {
        if record.len() < RECORD_FIELDS {
            return Ok(None);
        }
        let type_id: u16 = record[0]
            .parse()
            .map_err(|_| PortalError::Codec(format!("metadata type {:?}", record[0])))?;
        let kind = InstructionKind::from_type_id(type_id)
            .ok_or_else(|| PortalError::Codec(format!("unknown metadata type {type_id}")))?;
        let shard_id: u8 = record[1]
            .parse()
            .map_err(|_| PortalError::Codec(format!("shard id {:?}", record[1])))?;
        let status = InstructionStatus::parse(&record[2])
            .ok_or_else(|| PortalError::Codec(format!("status {:?}", record[2])))?;
        Ok(Some(Self {
            kind,
            shard_id,
            status,
            content: record[3].clone(),
        }))
    }

    /// Serialize to the four-field record.
    pub fn to_record(&self) -> Vec<String> {
        vec![
            self.kind.type_id().to_string(),
            self.shard_id.to_string(),
            self.status.as_str().to_string(),
            self.content.clone(),
        ]
    }

    /// Decode JSON content.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, PortalError> {
        Ok(serde_json::from_str(&self.content)?)
    }
}

/// Output of one beacon block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockResult {
    /// Beacon height processed.
    pub beacon_height: u64,
    /// Emitted instructions in emission order.
    pub instructions: Vec<Instruction>,
    /// Net bridge token movement per portal token.
    pub bridge_deltas: BTreeMap<String, BridgeTokenDelta>,
}

impl BlockResult {
    /// Emitted instructions as records.
    pub fn records(&self) -> Vec<Vec<String>> {
        self.instructions.iter().map(Instruction::to_record).collect()
    }

    /// Emitted instructions of one kind.
    pub fn of_kind(&self, kind: InstructionKind) -> impl Iterator<Item = &Instruction> {
        self.instructions.iter().filter(move |inst| inst.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_record_roundtrip() {
        let inst = Instruction::action(
            InstructionKind::CustodianDeposit,
            1,
            "tx-1",
            &json!({"incognito_address": "cus1", "deposit_amount": 5}),
        )
        .unwrap();
        let record = inst.to_record();
        assert_eq!(record[0], "242");
        assert_eq!(record[2], "request");

        let parsed = Instruction::from_record(&record).unwrap().unwrap();
        assert_eq!(parsed, inst);
        let envelope = decode_action(&parsed.content).unwrap();
        assert_eq!(envelope.tx_req_id, "tx-1");
        assert_eq!(envelope.meta["deposit_amount"], 5);
    }

    #[test]
    fn test_short_record_skipped() {
        let record = vec!["242".to_string(), "0".to_string(), "request".to_string()];
        assert_eq!(Instruction::from_record(&record).unwrap(), None);
    }

    #[test]
    fn test_malformed_records() {
        let bad_type = vec!["x".into(), "0".into(), "request".into(), "".into()];
        tokio_test::assert_err!(Instruction::from_record(&bad_type));

        let unknown = vec!["999".into(), "0".into(), "request".into(), "".into()];
        tokio_test::assert_err!(Instruction::from_record(&unknown));

        let bad_status = vec!["242".into(), "0".into(), "pending".into(), "".into()];
        tokio_test::assert_err!(Instruction::from_record(&bad_status));

        assert!(matches!(decode_action("%%%"), Err(PortalError::Codec(_))));
        let not_json = STANDARD.encode(b"not json");
        assert!(matches!(decode_action(&not_json), Err(PortalError::Codec(_))));
    }

    #[test]
    fn test_block_result_filters_kind() {
        let result = BlockResult {
            beacon_height: 3,
            instructions: vec![
                Instruction::new(
                    InstructionKind::Reward,
                    0,
                    InstructionStatus::Success,
                    &json!({}),
                )
                .unwrap(),
                Instruction::new(
                    InstructionKind::CustodianDeposit,
                    0,
                    InstructionStatus::Accepted,
                    &json!({}),
                )
                .unwrap(),
            ],
            bridge_deltas: BTreeMap::new(),
        };
        assert_eq!(result.of_kind(InstructionKind::Reward).count(), 1);
        assert_eq!(result.records()[1][2], "accepted");
    }
}
