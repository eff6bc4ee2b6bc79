use crate::gtid::GtidState;
use crate::raft::Role;
use std::convert::TryInto;
use std::str::from_utf8;
use thiserror::Error;

const MESSAGE_VERSION: u8 = 1;
const RESPONSE_VERSION: u8 = 1;

/// Frame opcodes on the peer RPC transport.
pub const OP_PING: u8 = 1;
pub const OP_HEARTBEAT: u8 = 2;
pub const OP_REQUEST_VOTE: u8 = 3;
pub const OP_STATUS: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Ping,
    Heartbeat,
    RequestVote,
    Status,
}

impl MessageKind {
    pub fn opcode(&self) -> u8 {
        match self {
            MessageKind::Ping => OP_PING,
            MessageKind::Heartbeat => OP_HEARTBEAT,
            MessageKind::RequestVote => OP_REQUEST_VOTE,
            MessageKind::Status => OP_STATUS,
        }
    }

    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            OP_PING => Some(MessageKind::Ping),
            OP_HEARTBEAT => Some(MessageKind::Heartbeat),
            OP_REQUEST_VOTE => Some(MessageKind::RequestVote),
            OP_STATUS => Some(MessageKind::Status),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Ping => "ping",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::RequestVote => "request_vote",
            MessageKind::Status => "status",
        }
    }
}

/// Return codes.
///
/// `InvalidViewId` covers stale terms, `InvalidRequest` covers refusals that
/// are not term- or GTID-shaped (wrong role, duplicate leader, membership
/// mismatch), `InvalidGtid` is the election-safety refusal, and
/// `MysqlUnreachable` is the distinguished "I cannot check" code a candidate
/// counts toward a no-quorum diagnosis rather than the vote tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetCode {
    Ok,
    InvalidRequest,
    InvalidViewId,
    InvalidGtid,
    MysqlUnreachable,
}

impl RetCode {
    fn wire_code(&self) -> u8 {
        match self {
            RetCode::Ok => 0,
            RetCode::InvalidRequest => 1,
            RetCode::InvalidViewId => 2,
            RetCode::InvalidGtid => 3,
            RetCode::MysqlUnreachable => 4,
        }
    }

    fn from_wire(code: u8) -> Option<Self> {
        match code {
            0 => Some(RetCode::Ok),
            1 => Some(RetCode::InvalidRequest),
            2 => Some(RetCode::InvalidViewId),
            3 => Some(RetCode::InvalidGtid),
            4 => Some(RetCode::MysqlUnreachable),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetCode::Ok => "OK",
            RetCode::InvalidRequest => "ErrorInvalidRequest",
            RetCode::InvalidViewId => "ErrorInvalidViewID",
            RetCode::InvalidGtid => "ErrorInvalidGTID",
            RetCode::MysqlUnreachable => "ErrorMySQLUnreachable",
        }
    }
}

/// Body shared by every message kind: who is talking, at which election
/// view, under which membership epoch, and where their MySQL stands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMeta {
    pub from: String,
    /// Election term.
    pub view_id: u64,
    /// Fingerprint of the static peer set; a mismatch means the two
    /// controllers were configured against different clusters.
    pub epoch_id: u64,
    pub peers: Vec<String>,
    /// Empty for candidates.
    pub leader: String,
    pub gtid: GtidState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftMessage {
    pub kind: MessageKind,
    pub meta: MessageMeta,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftResponse {
    pub from: String,
    pub view_id: u64,
    pub epoch_id: u64,
    pub retcode: RetCode,
    pub state: Role,
    pub gtid: Option<GtidState>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too short")]
    Truncated,
    #[error("unsupported version {observed} (expected {expected})")]
    InvalidVersion { observed: u8, expected: u8 },
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("unknown return code {0}")]
    UnknownRetCode(u8),
    #[error("unknown role code {0}")]
    UnknownRole(u8),
    #[error("string field too long ({len} bytes)")]
    StringTooLong { len: usize },
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("too many peer entries ({count})")]
    TooManyPeers { count: usize },
}

impl RaftMessage {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.meta.peers.len() > u16::MAX as usize {
            return Err(FrameError::TooManyPeers {
                count: self.meta.peers.len(),
            });
        }
        let mut buf = Vec::with_capacity(128);
        buf.push(MESSAGE_VERSION);
        buf.push(self.kind.opcode());
        buf.extend_from_slice(&self.meta.view_id.to_le_bytes());
        buf.extend_from_slice(&self.meta.epoch_id.to_le_bytes());
        write_string(&mut buf, &self.meta.from)?;
        write_string(&mut buf, &self.meta.leader)?;
        buf.extend_from_slice(&(self.meta.peers.len() as u16).to_le_bytes());
        for peer in &self.meta.peers {
            write_string(&mut buf, peer)?;
        }
        write_gtid(&mut buf, &self.meta.gtid)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut cursor = 0;
        let version = read_u8(bytes, &mut cursor)?;
        if version != MESSAGE_VERSION {
            return Err(FrameError::InvalidVersion {
                observed: version,
                expected: MESSAGE_VERSION,
            });
        }
        let opcode = read_u8(bytes, &mut cursor)?;
        let kind = MessageKind::from_opcode(opcode).ok_or(FrameError::UnknownKind(opcode))?;
        let view_id = read_u64(bytes, &mut cursor)?;
        let epoch_id = read_u64(bytes, &mut cursor)?;
        let from = read_string(bytes, &mut cursor)?;
        let leader = read_string(bytes, &mut cursor)?;
        let peer_count = read_u16(bytes, &mut cursor)? as usize;
        let mut peers = Vec::with_capacity(peer_count.min(64));
        for _ in 0..peer_count {
            peers.push(read_string(bytes, &mut cursor)?);
        }
        let gtid = read_gtid(bytes, &mut cursor)?;
        Ok(Self {
            kind,
            meta: MessageMeta {
                from,
                view_id,
                epoch_id,
                peers,
                leader,
                gtid,
            },
        })
    }
}

impl RaftResponse {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::with_capacity(64);
        buf.push(RESPONSE_VERSION);
        buf.push(self.retcode.wire_code());
        buf.push(self.state.wire_code());
        buf.extend_from_slice(&self.view_id.to_le_bytes());
        buf.extend_from_slice(&self.epoch_id.to_le_bytes());
        write_string(&mut buf, &self.from)?;
        match &self.gtid {
            Some(gtid) => {
                buf.push(1);
                write_gtid(&mut buf, gtid)?;
            }
            None => buf.push(0),
        }
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let mut cursor = 0;
        let version = read_u8(bytes, &mut cursor)?;
        if version != RESPONSE_VERSION {
            return Err(FrameError::InvalidVersion {
                observed: version,
                expected: RESPONSE_VERSION,
            });
        }
        let retcode_raw = read_u8(bytes, &mut cursor)?;
        let retcode =
            RetCode::from_wire(retcode_raw).ok_or(FrameError::UnknownRetCode(retcode_raw))?;
        let role_raw = read_u8(bytes, &mut cursor)?;
        let state = Role::from_wire(role_raw).ok_or(FrameError::UnknownRole(role_raw))?;
        let view_id = read_u64(bytes, &mut cursor)?;
        let epoch_id = read_u64(bytes, &mut cursor)?;
        let from = read_string(bytes, &mut cursor)?;
        let gtid = match read_u8(bytes, &mut cursor)? {
            0 => None,
            _ => Some(read_gtid(bytes, &mut cursor)?),
        };
        Ok(Self {
            from,
            view_id,
            epoch_id,
            retcode,
            state,
            gtid,
        })
    }
}

fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<(), FrameError> {
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(FrameError::StringTooLong { len: bytes.len() });
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn write_gtid(buf: &mut Vec<u8>, gtid: &GtidState) -> Result<(), FrameError> {
    let mut flags = 0u8;
    if gtid.slave_io_running {
        flags |= 0x01;
    }
    if gtid.slave_sql_running {
        flags |= 0x02;
    }
    buf.push(flags);
    buf.extend_from_slice(&gtid.read_master_log_pos.to_le_bytes());
    write_string(buf, &gtid.master_log_file)?;
    write_string(buf, &gtid.retrieved_gtid_set)?;
    write_string(buf, &gtid.executed_gtid_set)?;
    write_string(buf, &gtid.slave_io_running_str)?;
    write_string(buf, &gtid.slave_sql_running_str)?;
    write_string(buf, &gtid.seconds_behind_master)?;
    write_string(buf, &gtid.last_error)?;
    write_string(buf, &gtid.last_io_error)?;
    write_string(buf, &gtid.last_sql_error)?;
    write_string(buf, &gtid.slave_sql_running_state)?;
    Ok(())
}

fn read_gtid(bytes: &[u8], cursor: &mut usize) -> Result<GtidState, FrameError> {
    let flags = read_u8(bytes, cursor)?;
    let read_master_log_pos = read_u64(bytes, cursor)?;
    Ok(GtidState {
        slave_io_running: flags & 0x01 != 0,
        slave_sql_running: flags & 0x02 != 0,
        read_master_log_pos,
        master_log_file: read_string(bytes, cursor)?,
        retrieved_gtid_set: read_string(bytes, cursor)?,
        executed_gtid_set: read_string(bytes, cursor)?,
        slave_io_running_str: read_string(bytes, cursor)?,
        slave_sql_running_str: read_string(bytes, cursor)?,
        seconds_behind_master: read_string(bytes, cursor)?,
        last_error: read_string(bytes, cursor)?,
        last_io_error: read_string(bytes, cursor)?,
        last_sql_error: read_string(bytes, cursor)?,
        slave_sql_running_state: read_string(bytes, cursor)?,
    })
}

fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8, FrameError> {
    let value = *bytes.get(*cursor).ok_or(FrameError::Truncated)?;
    *cursor += 1;
    Ok(value)
}

fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16, FrameError> {
    if bytes.len() < *cursor + 2 {
        return Err(FrameError::Truncated);
    }
    let value = u16::from_le_bytes(bytes[*cursor..*cursor + 2].try_into().unwrap());
    *cursor += 2;
    Ok(value)
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64, FrameError> {
    if bytes.len() < *cursor + 8 {
        return Err(FrameError::Truncated);
    }
    let value = u64::from_le_bytes(bytes[*cursor..*cursor + 8].try_into().unwrap());
    *cursor += 8;
    Ok(value)
}

fn read_string(bytes: &[u8], cursor: &mut usize) -> Result<String, FrameError> {
    let len = read_u16(bytes, cursor)? as usize;
    if bytes.len() < *cursor + len {
        return Err(FrameError::Truncated);
    }
    let value = from_utf8(&bytes[*cursor..*cursor + len])
        .map_err(|_| FrameError::InvalidUtf8)?
        .to_string();
    *cursor += len;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_gtid() -> GtidState {
        GtidState {
            master_log_file: "mysql-bin.000007".into(),
            read_master_log_pos: 4242,
            executed_gtid_set: "uuid1:1-100".into(),
            retrieved_gtid_set: "uuid1:1-100".into(),
            slave_io_running: true,
            slave_io_running_str: "Yes".into(),
            slave_sql_running: true,
            slave_sql_running_str: "Yes".into(),
            seconds_behind_master: "0".into(),
            ..GtidState::default()
        }
    }

    #[test]
    fn heartbeat_round_trip() {
        let message = RaftMessage {
            kind: MessageKind::Heartbeat,
            meta: MessageMeta {
                from: "10.0.0.1:8801".into(),
                view_id: 6,
                epoch_id: 0x00c0_ffee,
                peers: vec!["10.0.0.2:8801".into(), "10.0.0.3:8801".into()],
                leader: "10.0.0.1:8801".into(),
                gtid: sample_gtid(),
            },
        };
        let encoded = message.encode().unwrap();
        let decoded = RaftMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn vote_refusal_round_trip() {
        let response = RaftResponse {
            from: "10.0.0.2:8801".into(),
            view_id: 9,
            epoch_id: 1,
            retcode: RetCode::InvalidGtid,
            state: Role::Follower,
            gtid: None,
        };
        let encoded = response.encode().unwrap();
        let decoded = RaftResponse::decode(&encoded).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn status_response_carries_the_gtid() {
        let response = RaftResponse {
            from: "10.0.0.2:8801".into(),
            view_id: 3,
            epoch_id: 1,
            retcode: RetCode::Ok,
            state: Role::Leader,
            gtid: Some(sample_gtid()),
        };
        let decoded = RaftResponse::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded.gtid, Some(sample_gtid()));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let message = RaftMessage {
            kind: MessageKind::Ping,
            meta: MessageMeta::default(),
        };
        let encoded = message.encode().unwrap();
        for cut in [0, 1, 5, encoded.len() - 1] {
            assert!(matches!(
                RaftMessage::decode(&encoded[..cut]),
                Err(FrameError::Truncated)
            ));
        }
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut encoded = RaftMessage {
            kind: MessageKind::Ping,
            meta: MessageMeta::default(),
        }
        .encode()
        .unwrap();
        encoded[0] = 9;
        assert!(matches!(
            RaftMessage::decode(&encoded),
            Err(FrameError::InvalidVersion { observed: 9, .. })
        ));
    }
}
