use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;

/// MemberId identifies a server participating in the cluster. Id 0 is reserved
/// to mean "no member" in persisted vote state.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemberId(u32);

impl MemberId {
    pub fn new(id: u32) -> Self {
        MemberId(id)
    }

    pub fn val(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// MemberKind classifies how a member participates in the protocol.
///
/// Active members vote and can lead. Passive members receive replicated entries
/// and hold full state but do not vote. Reserve members are warm spares that hold
/// configuration only. Inactive members have been removed and hold nothing.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemberKind {
    Active,
    Passive,
    Reserve,
    Inactive,
}

impl MemberKind {
    /// Stateful members hold the replicated state machine (Active + Passive).
    pub fn is_stateful(self) -> bool {
        matches!(self, MemberKind::Active | MemberKind::Passive)
    }

    pub fn is_voting(self) -> bool {
        matches!(self, MemberKind::Active)
    }

    fn type_id(self) -> u8 {
        match self {
            MemberKind::Active => 1,
            MemberKind::Passive => 2,
            MemberKind::Reserve => 3,
            MemberKind::Inactive => 4,
        }
    }

    fn from_type_id(id: u8) -> io::Result<Self> {
        match id {
            1 => Ok(MemberKind::Active),
            2 => Ok(MemberKind::Passive),
            3 => Ok(MemberKind::Reserve),
            4 => Ok(MemberKind::Inactive),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown member kind id {}", other),
            )),
        }
    }
}

/// Availability is the leader's view of whether a member is responding to the
/// cluster, derived from deterministic heartbeat entries.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Availability {
    Available,
    Unavailable,
}

/// Member is one server's identity and connection info within a configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Member {
    pub id: MemberId,
    pub kind: MemberKind,
    pub server_address: String,
    pub client_address: String,
}

impl Member {
    pub fn new(id: MemberId, kind: MemberKind, server_address: impl Into<String>, client_address: impl Into<String>) -> Self {
        Member {
            id,
            kind,
            server_address: server_address.into(),
            client_address: client_address.into(),
        }
    }

    pub(crate) fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.id.val());
        out.put_u8(self.kind.type_id());
        put_string(out, &self.server_address);
        put_string(out, &self.client_address);
    }

    pub(crate) fn decode(buf: &mut Bytes) -> io::Result<Member> {
        if buf.remaining() < 5 {
            return Err(truncated());
        }
        let id = MemberId::new(buf.get_u32());
        let kind = MemberKind::from_type_id(buf.get_u8())?;
        let server_address = get_string(buf)?;
        let client_address = get_string(buf)?;

        Ok(Member {
            id,
            kind,
            server_address,
            client_address,
        })
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
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn truncated() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "truncated member record")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_encode_decode() {
        let member = Member::new(MemberId::new(7), MemberKind::Passive, "10.0.0.7:5000", "10.0.0.7:5001");

        let mut out = BytesMut::new();
        member.encode(&mut out);
        let mut bytes = out.freeze();

        assert_eq!(Member::decode(&mut bytes).unwrap(), member);
        assert_eq!(bytes.remaining(), 0);
    }

    #[test]
    fn member_decode_rejects_truncation() {
        let member = Member::new(MemberId::new(7), MemberKind::Active, "a:1", "a:2");
        let mut out = BytesMut::new();
        member.encode(&mut out);

        let mut short = out.freeze().slice(0..6);
        assert!(Member::decode(&mut short).is_err());
    }

    #[test]
    fn kind_classification() {
        assert!(MemberKind::Active.is_stateful());
        assert!(MemberKind::Passive.is_stateful());
        assert!(!MemberKind::Reserve.is_stateful());
        assert!(MemberKind::Active.is_voting());
        assert!(!MemberKind::Passive.is_voting());
    }
}
