use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::{
    block::Block,
    errors::{DecodeError, DecodeResult},
    types::{MinerId, PreliminaryHash},
};

/// Upper nonce bound used when a task omits `to`.
pub const DEFAULT_RANGE_END: u64 = 100_000_000_000;

pub const NEW_CANDIDATE_BLOCK: &str = "NEW_CANDIDATE_BLOCK";
pub const RESOLVED_CANDIDATE_BLOCK: &str = "RESOLVED_CANDIDATE_BLOCK";
pub const CANDIDATE_BLOCK_DROPPED: &str = "CANDIDATE_BLOCK_DROPPED";

// task channel

#[derive(Debug, Deserialize)]
struct TaskMessage {
    #[serde(default)]
    event: Option<String>,
    challenge: Option<String>,
    block: Option<Block>,
    from: Option<u64>,
    to: Option<u64>,
}

/// A validated unit of work: search `range` (inclusive) for a nonce whose
/// final hash starts with `challenge`.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub challenge: String,
    pub block: Block,
    pub range: RangeInclusive<u64>,
}

impl Task {
    pub fn decode(body: &[u8]) -> DecodeResult<Task> {
        let TaskMessage {
            event,
            challenge,
            block,
            from,
            to,
        } = serde_json::from_slice(body)?;

        if let Some(event) = event {
            if event != NEW_CANDIDATE_BLOCK {
                return Err(DecodeError::UnexpectedEvent(event));
            }
        }

        let challenge = challenge.ok_or(DecodeError::MissingField("challenge"))?;
        if challenge.is_empty() {
            return Err(DecodeError::EmptyChallenge);
        }

        let block = block.ok_or(DecodeError::MissingField("block"))?;
        if block.hash().is_empty() {
            return Err(DecodeError::MissingField("block.hash"));
        }

        let from = from.unwrap_or(0);
        let to = to.unwrap_or(DEFAULT_RANGE_END);
        if from > to {
            return Err(DecodeError::InvalidRange { from, to });
        }

        Ok(Task {
            challenge,
            block,
            range: from..=to,
        })
    }

    pub fn preliminary_hash(&self) -> PreliminaryHash {
        self.block.preliminary_hash()
    }
}

// broadcast channel

/// A notification that a candidate block is no longer live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Resolved {
        miner_id: MinerId,
        preliminary_hash: PreliminaryHash,
    },
    Dropped {
        preliminary_hash: PreliminaryHash,
    },
}

impl LifecycleEvent {
    pub fn preliminary_hash(&self) -> &PreliminaryHash {
        match self {
            LifecycleEvent::Resolved { preliminary_hash, .. } => preliminary_hash,
            LifecycleEvent::Dropped { preliminary_hash } => preliminary_hash,
        }
    }
}

/// Everything that can show up on the broadcast exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastMessage {
    Lifecycle(LifecycleEvent),
    /// New candidates share the fanout with lifecycle events; listeners skip them.
    NewCandidate,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventMessage {
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    miner_id: Option<String>,
    #[serde(default)]
    preliminary_hash_block_resolved: Option<String>,
    #[serde(default)]
    preliminary_hash_block_dropped: Option<String>,
    #[serde(default)]
    preliminary_hash: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<PreliminaryHash> {
    value.filter(|v| !v.is_empty()).map(PreliminaryHash)
}

impl BroadcastMessage {
    pub fn decode(body: &[u8]) -> DecodeResult<BroadcastMessage> {
        let EventMessage {
            event,
            miner_id,
            preliminary_hash_block_resolved,
            preliminary_hash_block_dropped,
            preliminary_hash,
        } = serde_json::from_slice(body)?;

        let event = match event.as_deref() {
            Some(RESOLVED_CANDIDATE_BLOCK) => LifecycleEvent::Resolved {
                miner_id: MinerId(miner_id.unwrap_or_default()),
                preliminary_hash: non_empty(preliminary_hash_block_resolved)
                    .ok_or(DecodeError::MissingField("preliminaryHashBlockResolved"))?,
            },
            // the coordinator reuses the resolved field name for drops
            Some(CANDIDATE_BLOCK_DROPPED) => LifecycleEvent::Dropped {
                preliminary_hash: non_empty(preliminary_hash_block_dropped)
                    .or_else(|| non_empty(preliminary_hash_block_resolved))
                    .ok_or(DecodeError::MissingField("preliminaryHashBlockDropped"))?,
            },
            Some(NEW_CANDIDATE_BLOCK) => return Ok(BroadcastMessage::NewCandidate),
            Some(other) => return Err(DecodeError::UnexpectedEvent(other.to_string())),
            // pool cancel notices carry no event name
            None => LifecycleEvent::Dropped {
                preliminary_hash: non_empty(preliminary_hash)
                    .ok_or(DecodeError::MissingField("event"))?,
            },
        };

        Ok(BroadcastMessage::Lifecycle(event))
    }
}

// coordinator api

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterMiner {
    pub public_key: String,
    pub last_timestamp: i64,
    pub gpu_miner: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeepAlive {
    pub miner_public_key: String,
}

/// Solved block as reported to the coordinator: the block's dictionary form
/// plus the preliminary hash (`blockId`) and the reporting miner.
#[derive(Debug, Clone, Serialize)]
pub struct MiningResult {
    #[serde(flatten)]
    pub block: Block,
    #[serde(rename = "blockId")]
    pub block_id: PreliminaryHash,
    #[serde(rename = "minerId")]
    pub miner_id: MinerId,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::block::md5_hex;

    fn task_json() -> serde_json::Value {
        json!({
            "event": "NEW_CANDIDATE_BLOCK",
            "challenge": "00",
            "block": {
                "index": 3,
                "timestamp": 1700000000,
                "hash": "prelim-3",
                "previous_hash": "abc",
                "data": [{"from": "a", "to": "b", "amount": 5}]
            },
            "from": 10,
            "to": 20,
            "retries": 1
        })
    }

    #[test]
    fn decodes_full_task() {
        let task = Task::decode(task_json().to_string().as_bytes()).unwrap();
        assert_eq!(task.challenge, "00");
        assert_eq!(task.range, 10..=20);
        assert_eq!(task.block.index(), 3);
        assert_eq!(task.block.nonce(), 0);
        assert_eq!(task.preliminary_hash(), PreliminaryHash::from("prelim-3"));
    }

    #[test]
    fn decoded_data_hashes_as_received() {
        let body = br#"{"challenge":"0","block":{"index":2,"timestamp":5,"hash":"p","previous_hash":"x","data":[{"amount":1.0E-5}]}}"#;
        let task = Task::decode(body).unwrap();
        assert_eq!(task.block.content_hash(), md5_hex(br#"25[{"amount":1.0E-5}]x"#));
    }

    #[test]
    fn range_defaults() {
        let mut value = task_json();
        let obj = value.as_object_mut().unwrap();
        obj.remove("from");
        obj.remove("to");
        obj.remove("event");
        let task = Task::decode(value.to_string().as_bytes()).unwrap();
        assert_eq!(task.range, 0..=DEFAULT_RANGE_END);
    }

    #[rstest]
    #[case("challenge", json!(null))]
    #[case("challenge", json!(""))]
    #[case("block", json!(null))]
    #[case("event", json!("CANDIDATE_BLOCK_DROPPED"))]
    #[case("from", json!(30))]
    #[case("to", json!(-1))]
    fn rejects_malformed_task(#[case] field: &str, #[case] replacement: serde_json::Value) {
        let mut value = task_json();
        value[field] = replacement;
        assert!(Task::decode(value.to_string().as_bytes()).is_err());
    }

    #[test]
    fn rejects_task_without_preliminary_hash() {
        let mut value = task_json();
        value["block"].as_object_mut().unwrap().remove("hash");
        assert!(matches!(
            Task::decode(value.to_string().as_bytes()),
            Err(DecodeError::MissingField("block.hash"))
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(Task::decode(b"not json"), Err(DecodeError::Json(_))));
    }

    #[rstest]
    #[case(
        json!({"event": "RESOLVED_CANDIDATE_BLOCK", "minerId": "m2", "preliminaryHashBlockResolved": "h1"}),
        BroadcastMessage::Lifecycle(LifecycleEvent::Resolved { miner_id: MinerId("m2".into()), preliminary_hash: "h1".into() })
    )]
    #[case(
        json!({"event": "CANDIDATE_BLOCK_DROPPED", "preliminaryHashBlockDropped": "h1"}),
        BroadcastMessage::Lifecycle(LifecycleEvent::Dropped { preliminary_hash: "h1".into() })
    )]
    #[case(
        json!({"event": "CANDIDATE_BLOCK_DROPPED", "preliminaryHashBlockResolved": "h1", "minerId": ""}),
        BroadcastMessage::Lifecycle(LifecycleEvent::Dropped { preliminary_hash: "h1".into() })
    )]
    #[case(
        json!({"preliminaryHash": "h1"}),
        BroadcastMessage::Lifecycle(LifecycleEvent::Dropped { preliminary_hash: "h1".into() })
    )]
    #[case(json!({"event": "NEW_CANDIDATE_BLOCK", "challenge": "0"}), BroadcastMessage::NewCandidate)]
    fn decodes_broadcast(#[case] value: serde_json::Value, #[case] expected: BroadcastMessage) {
        assert_eq!(BroadcastMessage::decode(value.to_string().as_bytes()).unwrap(), expected);
    }

    #[rstest]
    #[case(json!({"event": "RESOLVED_CANDIDATE_BLOCK", "minerId": "m2"}))]
    #[case(json!({"event": "RESOLVED_CANDIDATE_BLOCK", "preliminaryHashBlockResolved": ""}))]
    #[case(json!({"event": "SOMETHING_ELSE", "preliminaryHash": "h1"}))]
    #[case(json!({"minerId": "m2"}))]
    #[case(json!([1, 2, 3]))]
    fn rejects_bad_broadcast(#[case] value: serde_json::Value) {
        assert!(BroadcastMessage::decode(value.to_string().as_bytes()).is_err());
    }

    #[test]
    fn result_payload_shape() {
        let mut block = Block::new(1, 1000, json!({"x": 1}), "abc".into(), "h1".into());
        block.solve(42, "00ab".into());
        let result = MiningResult {
            block,
            block_id: "h1".into(),
            miner_id: MinerId("m1".into()),
        };
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "index": 1,
                "timestamp": 1000,
                "hash": "00ab",
                "previous_hash": "abc",
                "nonce": 42,
                "data": {"x": 1},
                "blockId": "h1",
                "minerId": "m1"
            })
        );
    }
}
