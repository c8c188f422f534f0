use crate::cluster::{Configuration, MemberId};
use crate::storage::index::{Index, Term};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

/// SessionId is the log index of the session's Register entry.
pub type SessionId = Index;

/// Consistency level a client requests for a state-changing command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandConsistency {
    /// No event guarantees; complete as soon as the command applies.
    None,
    /// Events are delivered in order but the command completes without
    /// waiting for acknowledgement.
    Sequential,
    /// The command completes only after every event it published has been
    /// acknowledged by its recipient session.
    Linearizable,
}

/// Consistency level a client requests for a read-only query.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum QueryConsistency {
    Causal,
    Sequential,
    BoundedLinearizable,
    Linearizable,
}

/// Byte representation of a logged entry:
///
/// ```text
/// | 0 | 1 |        2..10        | 10 ...             |
/// +---+---+--------------------+--------------------+
/// |TypeId |   Term (8 bytes)   |  variant payload   |
/// +-------+--------------------+--------------------+
/// ```
///
/// The record length prefix and the entry's index both live in the segment
/// (the index is derived from the record's offset), so neither is repeated
/// here. Checksumming is the storage buffer's concern.
#[derive(Clone, Debug, PartialEq)]
pub enum EntryKind {
    /// Committed once per term by a fresh leader; commits prior-term entries
    /// and advances deterministic time.
    NoOp { timestamp: u64 },

    /// Membership snapshot. Takes effect when appended, not when committed.
    Configuration { configuration: Configuration },

    /// Session birth. The entry's index becomes the session id.
    Register {
        client_id: String,
        timestamp: u64,
        timeout_ms: u64,
    },

    /// Pins a session to the server address currently holding its connection.
    Connect {
        session: SessionId,
        address: String,
        timestamp: u64,
    },

    /// Session liveness plus acknowledgement watermarks.
    KeepAlive {
        session: SessionId,
        command_seq_ack: u64,
        event_version_ack: u64,
        timestamp: u64,
    },

    /// Session death. `expired` is true when committed by the leader's
    /// session-expiry sweep rather than by the client.
    Unregister {
        session: SessionId,
        expired: bool,
        timestamp: u64,
    },

    /// State-changing operation. `tombstone` is declared by the submitting
    /// client: true when the operation erases state written by prior commands.
    Command {
        session: SessionId,
        sequence: u64,
        timestamp: u64,
        payload: Bytes,
        consistency: CommandConsistency,
        tombstone: bool,
    },

    /// Read-only operation. Never appended to the log; materialized only so
    /// the apply path can treat reads and writes uniformly.
    Query {
        session: SessionId,
        sequence: u64,
        version: Index,
        timestamp: u64,
        payload: Bytes,
        consistency: QueryConsistency,
    },

    /// Availability signal from a stateful member, logged by the leader.
    Heartbeat {
        member: MemberId,
        commit_index: Index,
        timestamp: u64,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    pub kind: EntryKind,
}

const TYPE_NO_OP: u16 = 1;
const TYPE_CONFIGURATION: u16 = 2;
const TYPE_REGISTER: u16 = 3;
const TYPE_CONNECT: u16 = 4;
const TYPE_KEEP_ALIVE: u16 = 5;
const TYPE_UNREGISTER: u16 = 6;
const TYPE_COMMAND: u16 = 7;
const TYPE_QUERY: u16 = 8;
const TYPE_HEARTBEAT: u16 = 9;

impl LogEntry {
    pub fn new(index: Index, term: Term, kind: EntryKind) -> Self {
        LogEntry { index, term, kind }
    }

    /// Tombstones cancel earlier state-changes and may only leave the log once
    /// their index is at or below the cluster-wide major-compact index.
    pub fn is_tombstone(&self) -> bool {
        match &self.kind {
            EntryKind::Unregister { .. } => true,
            EntryKind::Command { tombstone, .. } => *tombstone,
            _ => false,
        }
    }

    /// Snapshottable entries are unconditionally removable once covered by a
    /// completed state-machine snapshot.
    pub fn is_snapshottable(&self) -> bool {
        matches!(
            &self.kind,
            EntryKind::NoOp { .. } | EntryKind::Command { .. } | EntryKind::Heartbeat { .. }
        )
    }

    /// The deterministic timestamp this entry carries, if any.
    pub fn timestamp(&self) -> Option<u64> {
        match &self.kind {
            EntryKind::NoOp { timestamp }
            | EntryKind::Register { timestamp, .. }
            | EntryKind::Connect { timestamp, .. }
            | EntryKind::KeepAlive { timestamp, .. }
            | EntryKind::Unregister { timestamp, .. }
            | EntryKind::Command { timestamp, .. }
            | EntryKind::Query { timestamp, .. }
            | EntryKind::Heartbeat { timestamp, .. } => Some(*timestamp),
            EntryKind::Configuration { .. } => None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(32);
        out.put_u16(self.type_id());
        out.put_u64(self.term.val());

        match &self.kind {
            EntryKind::NoOp { timestamp } => {
                out.put_u64(*timestamp);
            }
            EntryKind::Configuration { configuration } => {
                configuration.encode(&mut out);
            }
            EntryKind::Register {
                client_id,
                timestamp,
                timeout_ms,
            } => {
                out.put_u64(*timestamp);
                out.put_u64(*timeout_ms);
                put_string(&mut out, client_id);
            }
            EntryKind::Connect {
                session,
                address,
                timestamp,
            } => {
                out.put_u64(session.val());
                out.put_u64(*timestamp);
                put_string(&mut out, address);
            }
            EntryKind::KeepAlive {
                session,
                command_seq_ack,
                event_version_ack,
                timestamp,
            } => {
                out.put_u64(session.val());
                out.put_u64(*command_seq_ack);
                out.put_u64(*event_version_ack);
                out.put_u64(*timestamp);
            }
            EntryKind::Unregister {
                session,
                expired,
                timestamp,
            } => {
                out.put_u64(session.val());
                out.put_u8(*expired as u8);
                out.put_u64(*timestamp);
            }
            EntryKind::Command {
                session,
                sequence,
                timestamp,
                payload,
                consistency,
                tombstone,
            } => {
                out.put_u64(session.val());
                out.put_u64(*sequence);
                out.put_u64(*timestamp);
                out.put_u8(encode_command_consistency(*consistency));
                out.put_u8(*tombstone as u8);
                out.put_u32(payload.len() as u32);
                out.put_slice(payload);
            }
            EntryKind::Query {
                session,
                sequence,
                version,
                timestamp,
                payload,
                consistency,
            } => {
                out.put_u64(session.val());
                out.put_u64(*sequence);
                out.put_u64(version.val());
                out.put_u64(*timestamp);
                out.put_u8(encode_query_consistency(*consistency));
                out.put_u32(payload.len() as u32);
                out.put_slice(payload);
            }
            EntryKind::Heartbeat {
                member,
                commit_index,
                timestamp,
            } => {
                out.put_u32(member.val());
                out.put_u64(commit_index.val());
                out.put_u64(*timestamp);
            }
        }

        out.freeze()
    }

    /// Decodes an entry record. `index` comes from the record's offset within
    /// its segment.
    pub fn decode(index: Index, mut buf: Bytes) -> io::Result<LogEntry> {
        if buf.remaining() < 10 {
            return Err(truncated());
        }
        let type_id = buf.get_u16();
        let term = Term::new(buf.get_u64());

        let kind = match type_id {
            TYPE_NO_OP => EntryKind::NoOp {
                timestamp: get_u64(&mut buf)?,
            },
            TYPE_CONFIGURATION => EntryKind::Configuration {
                configuration: Configuration::decode(&mut buf)?,
            },
            TYPE_REGISTER => {
                let timestamp = get_u64(&mut buf)?;
                let timeout_ms = get_u64(&mut buf)?;
                let client_id = get_string(&mut buf)?;
                EntryKind::Register {
                    client_id,
                    timestamp,
                    timeout_ms,
                }
            }
            TYPE_CONNECT => {
                let session = Index::new(get_u64(&mut buf)?);
                let timestamp = get_u64(&mut buf)?;
                let address = get_string(&mut buf)?;
                EntryKind::Connect {
                    session,
                    address,
                    timestamp,
                }
            }
            TYPE_KEEP_ALIVE => EntryKind::KeepAlive {
                session: Index::new(get_u64(&mut buf)?),
                command_seq_ack: get_u64(&mut buf)?,
                event_version_ack: get_u64(&mut buf)?,
                timestamp: get_u64(&mut buf)?,
            },
            TYPE_UNREGISTER => EntryKind::Unregister {
                session: Index::new(get_u64(&mut buf)?),
                expired: get_u8(&mut buf)? != 0,
                timestamp: get_u64(&mut buf)?,
            },
            TYPE_COMMAND => {
                let session = Index::new(get_u64(&mut buf)?);
                let sequence = get_u64(&mut buf)?;
                let timestamp = get_u64(&mut buf)?;
                let consistency = decode_command_consistency(get_u8(&mut buf)?)?;
                let tombstone = get_u8(&mut buf)? != 0;
                let payload = get_payload(&mut buf)?;
                EntryKind::Command {
                    session,
                    sequence,
                    timestamp,
                    payload,
                    consistency,
                    tombstone,
                }
            }
            TYPE_QUERY => {
                let session = Index::new(get_u64(&mut buf)?);
                let sequence = get_u64(&mut buf)?;
                let version = Index::new(get_u64(&mut buf)?);
                let timestamp = get_u64(&mut buf)?;
                let consistency = decode_query_consistency(get_u8(&mut buf)?)?;
                let payload = get_payload(&mut buf)?;
                EntryKind::Query {
                    session,
                    sequence,
                    version,
                    timestamp,
                    payload,
                    consistency,
                }
            }
            TYPE_HEARTBEAT => EntryKind::Heartbeat {
                member: MemberId::new(get_u32(&mut buf)?),
                commit_index: Index::new(get_u64(&mut buf)?),
                timestamp: get_u64(&mut buf)?,
            },
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown entry type id {}", other),
                ))
            }
        };

        Ok(LogEntry { index, term, kind })
    }

    fn type_id(&self) -> u16 {
        match &self.kind {
            EntryKind::NoOp { .. } => TYPE_NO_OP,
            EntryKind::Configuration { .. } => TYPE_CONFIGURATION,
            EntryKind::Register { .. } => TYPE_REGISTER,
            EntryKind::Connect { .. } => TYPE_CONNECT,
            EntryKind::KeepAlive { .. } => TYPE_KEEP_ALIVE,
            EntryKind::Unregister { .. } => TYPE_UNREGISTER,
            EntryKind::Command { .. } => TYPE_COMMAND,
            EntryKind::Query { .. } => TYPE_QUERY,
            EntryKind::Heartbeat { .. } => TYPE_HEARTBEAT,
        }
    }
}

fn encode_command_consistency(consistency: CommandConsistency) -> u8 {
    match consistency {
        CommandConsistency::None => 0,
        CommandConsistency::Sequential => 1,
        CommandConsistency::Linearizable => 2,
    }
}

fn decode_command_consistency(raw: u8) -> io::Result<CommandConsistency> {
    match raw {
        0 => Ok(CommandConsistency::None),
        1 => Ok(CommandConsistency::Sequential),
        2 => Ok(CommandConsistency::Linearizable),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown command consistency {}", other),
        )),
    }
}

fn encode_query_consistency(consistency: QueryConsistency) -> u8 {
    match consistency {
        QueryConsistency::Causal => 0,
        QueryConsistency::Sequential => 1,
        QueryConsistency::BoundedLinearizable => 2,
        QueryConsistency::Linearizable => 3,
    }
}

fn decode_query_consistency(raw: u8) -> io::Result<QueryConsistency> {
    match raw {
        0 => Ok(QueryConsistency::Causal),
        1 => Ok(QueryConsistency::Sequential),
        2 => Ok(QueryConsistency::BoundedLinearizable),
        3 => Ok(QueryConsistency::Linearizable),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown query consistency {}", other),
        )),
    }
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

fn get_string(buf: &mut Bytes) -> io::Result<String> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    String::from_utf8(buf.split_to(len).to_vec()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn get_payload(buf: &mut Bytes) -> io::Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(buf.split_to(len))
}

fn get_u8(buf: &mut Bytes) -> io::Result<u8> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn get_u32(buf: &mut Bytes) -> io::Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes) -> io::Result<u64> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_u64())
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "truncated entry record")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Member, MemberKind};

    #[test]
    fn command_entry_codec_and_attributes() {
        let entry = LogEntry::new(
            Index::new(10),
            Term::new(3),
            EntryKind::Command {
                session: Index::new(3),
                sequence: 7,
                timestamp: 123456,
                payload: Bytes::from_static(b"SET k v"),
                consistency: CommandConsistency::Linearizable,
                tombstone: false,
            },
        );
        assert!(!entry.is_tombstone());
        assert!(entry.is_snapshottable());

        let decoded = LogEntry::decode(Index::new(10), entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn delete_command_is_a_tombstone() {
        let entry = LogEntry::new(
            Index::new(12345),
            Term::new(3),
            EntryKind::Command {
                session: Index::new(3),
                sequence: 8,
                timestamp: 123460,
                payload: Bytes::from_static(b"DEL k"),
                consistency: CommandConsistency::Sequential,
                tombstone: true,
            },
        );
        assert!(entry.is_tombstone());
    }

    #[test]
    fn unregister_is_a_tombstone_and_not_snapshottable() {
        let entry = LogEntry::new(
            Index::new(20),
            Term::new(2),
            EntryKind::Unregister {
                session: Index::new(3),
                expired: true,
                timestamp: 99,
            },
        );
        assert!(entry.is_tombstone());
        assert!(!entry.is_snapshottable());

        let decoded = LogEntry::decode(Index::new(20), entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn configuration_entry_codec() {
        let configuration = Configuration::new(
            Index::new(2),
            vec![
                Member::new(MemberId::new(1), MemberKind::Active, "a:1", "a:2"),
                Member::new(MemberId::new(2), MemberKind::Reserve, "b:1", "b:2"),
            ],
        );
        let entry = LogEntry::new(Index::new(2), Term::new(1), EntryKind::Configuration { configuration });
        assert!(!entry.is_snapshottable());

        let decoded = LogEntry::decode(Index::new(2), entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn keep_alive_codec() {
        let entry = LogEntry::new(
            Index::new(30),
            Term::new(4),
            EntryKind::KeepAlive {
                session: Index::new(3),
                command_seq_ack: 9,
                event_version_ack: 25,
                timestamp: 5000,
            },
        );
        let decoded = LogEntry::decode(Index::new(30), entry.encode()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut raw = BytesMut::new();
        raw.put_u16(999);
        raw.put_u64(1);
        assert!(LogEntry::decode(Index::new(1), raw.freeze()).is_err());
    }
}
