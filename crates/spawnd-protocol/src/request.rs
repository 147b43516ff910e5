//! Request datagrams sent by the client.

use std::os::fd::OwnedFd;

use spawnd_common::error::{Result, SpawnError};
use spawnd_core::prepared::PreparedChildProcess;

use crate::builder::{Datagram, Serializer};
use crate::commands::RequestCommand;
use crate::exec;
use crate::payload::{Payload, ReceivedFds};

/// A decoded request.
#[derive(Debug)]
pub enum Request {
    /// A new connection to serve.
    Connect(OwnedFd),
    /// A child to spawn.
    Exec {
        /// Correlation id chosen by the client.
        id: u32,
        /// Display name for log messages.
        name: String,
        /// What to spawn.
        process: Box<PreparedChildProcess>,
    },
    /// Signals to deliver, as `(id, signo)` pairs.
    Kill(Vec<(u32, i32)>),
}

/// A request that could not be decoded.
#[derive(Debug)]
pub struct MalformedRequest {
    /// Id of a broken `EXEC` request, if it could be read.
    pub exec_id: Option<u32>,
    /// What was wrong.
    pub error: SpawnError,
}

impl MalformedRequest {
    const fn new(error: SpawnError) -> Self {
        Self {
            exec_id: None,
            error,
        }
    }
}

/// Encodes a `CONNECT` request carrying the new connection's socket.
#[must_use]
pub fn serialize_connect(socket: OwnedFd) -> Datagram {
    let mut datagram = Serializer::with_tag(RequestCommand::Connect).finish();
    datagram.fds.push(socket);
    datagram
}

/// Encodes an `EXEC` request.
///
/// # Errors
///
/// Returns an error if `process` cannot be encoded within the datagram limits.
pub fn serialize_exec(id: u32, name: &str, process: PreparedChildProcess) -> Result<Datagram> {
    let mut s = Serializer::with_tag(RequestCommand::Exec);
    s.write_u32(id)?;
    s.write_str(name)?;
    exec::serialize(&mut s, process)?;
    Ok(s.finish())
}

/// Encodes a `KILL` request for one or more children.
///
/// # Errors
///
/// Returns an error if the datagram overflows.
pub fn serialize_kill(kills: &[(u32, i32)]) -> Result<Datagram> {
    let mut s = Serializer::with_tag(RequestCommand::Kill);
    for &(id, signo) in kills {
        s.write_u32(id)?;
        s.write_i32(signo)?;
    }
    Ok(s.finish())
}

/// Decodes one request datagram, taking ownership of its descriptors.
///
/// # Errors
///
/// Returns [`MalformedRequest`] if the datagram is malformed; for an
/// `EXEC` request whose id could be read, the id is reported so the
/// client can be told about the failure.
pub fn parse(data: &[u8], fds: Vec<OwnedFd>) -> std::result::Result<Request, MalformedRequest> {
    let mut p = Payload::new(data);
    let mut fds = ReceivedFds::new(fds);
    let tag = p.read_u8().map_err(MalformedRequest::new)?;
    let command = RequestCommand::from_u8(tag).ok_or_else(|| {
        MalformedRequest::new(SpawnError::malformed(format!("unknown request command {tag}")))
    })?;

    match command {
        RequestCommand::Connect => {
            if !p.is_empty() {
                return Err(MalformedRequest::new(SpawnError::malformed(
                    "CONNECT with payload",
                )));
            }
            let socket = fds.take().map_err(MalformedRequest::new)?;
            fds.finish().map_err(MalformedRequest::new)?;
            Ok(Request::Connect(socket))
        }
        RequestCommand::Exec => {
            let id = p.read_u32().map_err(MalformedRequest::new)?;
            let decode = |p: &mut Payload<'_>, fds: &mut ReceivedFds| -> Result<_> {
                let name = p.read_str()?.to_owned();
                let process = exec::parse(p, fds)?;
                Ok((name, process))
            };
            let (name, process) = decode(&mut p, &mut fds)
                .and_then(|decoded| fds.finish().map(|()| decoded))
                .map_err(|error| MalformedRequest {
                    exec_id: Some(id),
                    error,
                })?;
            Ok(Request::Exec {
                id,
                name,
                process: Box::new(process),
            })
        }
        RequestCommand::Kill => {
            fds.finish().map_err(MalformedRequest::new)?;
            let mut kills = Vec::new();
            while !p.is_empty() {
                let id = p.read_u32().map_err(MalformedRequest::new)?;
                let signo = p.read_i32().map_err(MalformedRequest::new)?;
                kills.push((id, signo));
            }
            Ok(Request::Kill(kills))
        }
    }
}
