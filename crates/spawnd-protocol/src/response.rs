//! Response records sent by the spawner.

use spawnd_common::constants::MAX_PAYLOAD;
use spawnd_common::error::{Result, SpawnError};

use crate::builder::Serializer;
use crate::commands::ResponseCommand;
use crate::payload::Payload;

/// One response record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Outcome of an `EXEC` request.
    ExecComplete {
        /// Request id.
        id: u32,
        /// Failure message, or `None` on success.
        error: Option<String>,
    },
    /// A child exited.
    Exit {
        /// Request id.
        id: u32,
        /// Raw wait status.
        status: i32,
    },
    /// The spawner's cgroup memory usage is close to its limit.
    MemoryWarning {
        /// `memory.current`.
        current: u64,
        /// `memory.max`.
        max: u64,
    },
    /// The spawner can place children in cgroups.
    CgroupsAvailable,
}

impl Response {
    /// Appends this record to `s`.
    ///
    /// NUL bytes in an error message are replaced and overlong messages
    /// are truncated so that a record always fits.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram overflows.
    pub fn write(&self, s: &mut Serializer) -> Result<()> {
        match self {
            Self::ExecComplete { id, error } => {
                s.write_tag(ResponseCommand::ExecComplete)?;
                s.write_u32(*id)?;
                let message = error.as_deref().unwrap_or_default().replace('\0', " ");
                s.write_str(truncate(&message, MAX_PAYLOAD / 4))
            }
            Self::Exit { id, status } => {
                s.write_tag(ResponseCommand::Exit)?;
                s.write_u32(*id)?;
                s.write_i32(*status)
            }
            Self::MemoryWarning { current, max } => {
                s.write_tag(ResponseCommand::MemoryWarning)?;
                s.write_u64(*current)?;
                s.write_u64(*max)
            }
            Self::CgroupsAvailable => s.write_tag(ResponseCommand::CgroupsAvailable),
        }
    }

    /// Encoded size upper bound, used to decide when a batch is full.
    #[must_use]
    pub fn max_encoded_len(&self) -> usize {
        match self {
            Self::ExecComplete { error, .. } => {
                6 + error.as_ref().map_or(0, |e| e.len().min(MAX_PAYLOAD / 4))
            }
            Self::Exit { .. } => 9,
            Self::MemoryWarning { .. } => 17,
            Self::CgroupsAvailable => 1,
        }
    }
}

fn truncate(message: &str, max: usize) -> &str {
    if message.len() <= max {
        return message;
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

/// Encodes a sequence of records into one datagram.
///
/// # Errors
///
/// Returns an error if the records do not fit into one datagram.
pub fn serialize(responses: &[Response]) -> Result<Vec<u8>> {
    let mut s = Serializer::new();
    for response in responses {
        response.write(&mut s)?;
    }
    Ok(s.finish().data)
}

/// Decodes all records of one response datagram.
///
/// # Errors
///
/// Returns [`SpawnError::MalformedPayload`] on unknown tags or truncation.
pub fn parse(data: &[u8]) -> Result<Vec<Response>> {
    let mut p = Payload::new(data);
    let mut responses = Vec::new();
    while !p.is_empty() {
        let tag = p.read_u8()?;
        let command = ResponseCommand::from_u8(tag)
            .ok_or_else(|| SpawnError::malformed(format!("unknown response command {tag}")))?;
        responses.push(match command {
            ResponseCommand::ExecComplete => {
                let id = p.read_u32()?;
                let error = p.read_str()?;
                Response::ExecComplete {
                    id,
                    error: (!error.is_empty()).then(|| error.to_owned()),
                }
            }
            ResponseCommand::Exit => Response::Exit {
                id: p.read_u32()?,
                status: p.read_i32()?,
            },
            ResponseCommand::MemoryWarning => Response::MemoryWarning {
                current: p.read_u64()?,
                max: p.read_u64()?,
            },
            ResponseCommand::CgroupsAvailable => Response::CgroupsAvailable,
        });
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_round_trips() {
        let batch = vec![
            Response::CgroupsAvailable,
            Response::ExecComplete { id: 1, error: None },
            Response::ExecComplete {
                id: 2,
                error: Some("execve failed".into()),
            },
            Response::Exit { id: 1, status: 0x0100 },
            Response::MemoryWarning {
                current: 900,
                max: 1000,
            },
        ];
        let data = serialize(&batch).unwrap();
        assert_eq!(parse(&data).unwrap(), batch);
    }

    #[test]
    fn nul_in_error_is_replaced() {
        let data = serialize(&[Response::ExecComplete {
            id: 3,
            error: Some("bad\0path".into()),
        }])
        .unwrap();
        assert_eq!(
            parse(&data).unwrap(),
            vec![Response::ExecComplete {
                id: 3,
                error: Some("bad path".into())
            }]
        );
    }

    #[test]
    fn truncated_record_is_malformed() {
        let data = serialize(&[Response::Exit { id: 1, status: 9 }]).unwrap();
        assert!(parse(&data[..data.len() - 1]).is_err());
        assert!(parse(&[9]).is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
