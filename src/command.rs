//! Wire codec for replicated log commands.
//!
//! A command is framed as one kind byte followed by a bincode-serialized
//! payload. The payload encoding length-prefixes every string, so the
//! frame is self-delimiting and safe to embed in a raft log entry.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const KIND_NOOP: u8 = 0x00;
const KIND_SET_PAIR: u8 = 0x01;
const KIND_DELETE_PAIR: u8 = 0x02;

/// A single mutation carried through the replicated log.
///
/// `Noop` is internal: it is the barrier marker entry and never appears
/// on the client surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Noop,
    SetPair { key: String, value: String },
    DeletePair { key: String },
}

#[derive(Serialize, Deserialize)]
struct SetPayload {
    key: String,
    value: String,
}

#[derive(Serialize, Deserialize)]
struct DeletePayload {
    key: String,
}

impl Command {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Command::Noop => buf.push(KIND_NOOP),
            Command::SetPair { key, value } => {
                buf.push(KIND_SET_PAIR);
                buf.extend(bincode::serialize(&SetPayload {
                    key: key.clone(),
                    value: value.clone(),
                })?);
            }
            Command::DeletePair { key } => {
                buf.push(KIND_DELETE_PAIR);
                buf.extend(bincode::serialize(&DeletePayload { key: key.clone() })?);
            }
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Command> {
        let (kind, payload) = match data.split_first() {
            Some(split) => split,
            None => return Err(Error::UnknownCommand(0)),
        };
        match *kind {
            KIND_NOOP => Ok(Command::Noop),
            KIND_SET_PAIR => {
                let p: SetPayload = bincode::deserialize(payload)?;
                Ok(Command::SetPair {
                    key: p.key,
                    value: p.value,
                })
            }
            KIND_DELETE_PAIR => {
                let p: DeletePayload = bincode::deserialize(payload)?;
                Ok(Command::DeletePair { key: p.key })
            }
            other => Err(Error::UnknownCommand(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_pair_round_trip() {
        let cmd = Command::SetPair {
            key: "color".to_string(),
            value: "teal".to_string(),
        };
        let encoded = cmd.encode().unwrap();
        assert_eq!(encoded[0], KIND_SET_PAIR);
        assert_eq!(Command::decode(&encoded).unwrap(), cmd);
    }

    #[test]
    fn delete_pair_round_trip() {
        let cmd = Command::DeletePair {
            key: "color".to_string(),
        };
        let encoded = cmd.encode().unwrap();
        assert_eq!(encoded[0], KIND_DELETE_PAIR);
        assert_eq!(Command::decode(&encoded).unwrap(), cmd);
    }

    #[test]
    fn noop_is_a_single_byte() {
        let encoded = Command::Noop.encode().unwrap();
        assert_eq!(encoded, vec![KIND_NOOP]);
        assert_eq!(Command::decode(&encoded).unwrap(), Command::Noop);
    }

    #[test]
    fn empty_values_round_trip() {
        let cmd = Command::SetPair {
            key: String::new(),
            value: String::new(),
        };
        let encoded = cmd.encode().unwrap();
        assert_eq!(Command::decode(&encoded).unwrap(), cmd);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        match Command::decode(&[0xff, 1, 2, 3]) {
            Err(Error::UnknownCommand(0xff)) => {}
            other => panic!("expected UnknownCommand, got {other:?}"),
        }
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert!(Command::decode(&[]).is_err());
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let cmd = Command::SetPair {
            key: "a-long-enough-key".to_string(),
            value: "value".to_string(),
        };
        let encoded = cmd.encode().unwrap();
        assert!(Command::decode(&encoded[..encoded.len() / 2]).is_err());
    }
}
