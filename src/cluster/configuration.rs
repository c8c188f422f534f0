use crate::cluster::member::{Member, MemberId, MemberKind};
use crate::storage::Index;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;

/// Configuration is a committed membership snapshot. `version` is the log index
/// of the Configuration entry that produced it, so later configurations always
/// compare greater.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Configuration {
    version: Index,
    members: Vec<Member>,
}

impl Configuration {
    pub fn new(version: Index, members: Vec<Member>) -> Self {
        Configuration { version, members }
    }

    pub fn version(&self) -> Index {
        self.version
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    pub fn contains(&self, id: MemberId) -> bool {
        self.member(id).is_some()
    }

    pub fn kind_of(&self, id: MemberId) -> Option<MemberKind> {
        self.member(id).map(|m| m.kind)
    }

    pub fn voting_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.kind.is_voting())
    }

    pub fn stateful_members(&self) -> impl Iterator<Item = &Member> {
        self.members.iter().filter(|m| m.kind.is_stateful())
    }

    /// Majority of the voting set. A single-member cluster has quorum 1.
    pub fn quorum_size(&self) -> usize {
        self.voting_members().count() / 2 + 1
    }

    /// Returns a new configuration with `member` added (or replaced, if the id
    /// already exists), versioned at `version`.
    pub fn with_member(&self, version: Index, member: Member) -> Configuration {
        let mut members: Vec<Member> = self.members.iter().filter(|m| m.id != member.id).cloned().collect();
        members.push(member);
        Configuration { version, members }
    }

    /// Returns a new configuration with `id` removed, versioned at `version`.
    pub fn without_member(&self, version: Index, id: MemberId) -> Configuration {
        let members = self.members.iter().filter(|m| m.id != id).cloned().collect();
        Configuration { version, members }
    }

    /// Returns a new configuration with `id` reclassified to `kind`, versioned
    /// at `version`.
    pub fn with_member_kind(&self, version: Index, id: MemberId, kind: MemberKind) -> Configuration {
        let members = self
            .members
            .iter()
            .map(|m| {
                if m.id == id {
                    let mut updated = m.clone();
                    updated.kind = kind;
                    updated
                } else {
                    m.clone()
                }
            })
            .collect();
        Configuration { version, members }
    }

    pub(crate) fn encode(&self, out: &mut BytesMut) {
        out.put_u64(self.version.val());
        out.put_u16(self.members.len() as u16);
        for member in &self.members {
            member.encode(out);
        }
    }

    pub(crate) fn decode(buf: &mut Bytes) -> io::Result<Configuration> {
        if buf.remaining() < 10 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated configuration record",
            ));
        }
        let version = Index::new(buf.get_u64());
        let count = buf.get_u16() as usize;
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            members.push(Member::decode(buf)?);
        }

        Ok(Configuration { version, members })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_member_config() -> Configuration {
        Configuration::new(
            Index::new(2),
            vec![
                Member::new(MemberId::new(1), MemberKind::Active, "a:1", "a:2"),
                Member::new(MemberId::new(2), MemberKind::Active, "b:1", "b:2"),
                Member::new(MemberId::new(3), MemberKind::Active, "c:1", "c:2"),
            ],
        )
    }

    #[test]
    fn quorum_over_voting_members_only() {
        let config = three_member_config();
        assert_eq!(config.quorum_size(), 2);

        // Demoting one active member to passive shrinks the voting set to 2.
        let config = config.with_member_kind(Index::new(5), MemberId::new(3), MemberKind::Passive);
        assert_eq!(config.voting_members().count(), 2);
        assert_eq!(config.quorum_size(), 2);
        assert_eq!(config.stateful_members().count(), 3);
    }

    #[test]
    fn single_member_cluster_quorum_is_one() {
        let config = Configuration::new(
            Index::new(1),
            vec![Member::new(MemberId::new(1), MemberKind::Active, "a:1", "a:2")],
        );
        assert_eq!(config.quorum_size(), 1);
    }

    #[test]
    fn join_and_leave() {
        let config = three_member_config();
        let joined = config.with_member(
            Index::new(9),
            Member::new(MemberId::new(4), MemberKind::Reserve, "d:1", "d:2"),
        );
        assert_eq!(joined.version(), Index::new(9));
        assert_eq!(joined.kind_of(MemberId::new(4)), Some(MemberKind::Reserve));
        // Reserves neither vote nor hold state.
        assert_eq!(joined.quorum_size(), 2);
        assert_eq!(joined.stateful_members().count(), 3);

        let left = joined.without_member(Index::new(12), MemberId::new(2));
        assert!(!left.contains(MemberId::new(2)));
        assert_eq!(left.quorum_size(), 2);
    }

    #[test]
    fn encode_decode_round_trip() {
        let config = three_member_config();
        let mut out = BytesMut::new();
        config.encode(&mut out);

        let mut bytes = out.freeze();
        assert_eq!(Configuration::decode(&mut bytes).unwrap(), config);
    }
}
