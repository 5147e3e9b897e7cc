use super::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Range;

/// Identity of a replica node, normally rendered as `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let id = id.trim();
        if id.is_empty() {
            return Err(BackupError::Topology(
                "replica identity must not be empty".to_string(),
            ));
        }
        Ok(Self(id.to_string()))
    }

    pub fn from_host_port(host: &str, port: u16) -> Result<Self> {
        Self::new(format!("{}:{}", host.trim(), port))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part of the identity (everything before the last `:`).
    pub fn host(&self) -> &str {
        match self.0.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => &self.0,
        }
    }

    /// Port part of the identity, if one is present.
    pub fn port(&self) -> Option<u16> {
        self.0
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
    }

    /// Filesystem-safe form used to name per-replica dump files.
    ///
    /// `[A-Za-z0-9.-]` pass through. Everything else is escaped behind `_`: `_` becomes
    /// `__`, `:` becomes `_c` and any other byte `_x` plus two hex digits. Every escape is
    /// decodable, so distinct identities never share a stem.
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        for c in self.0.chars() {
            match c {
                c if c.is_ascii_alphanumeric() || c == '.' || c == '-' => stem.push(c),
                '_' => stem.push_str("__"),
                ':' => stem.push_str("_c"),
                c => {
                    let mut buf = [0u8; 4];
                    for byte in c.encode_utf8(&mut buf).bytes() {
                        stem.push_str(&format!("_x{:02x}", byte));
                    }
                }
            }
        }
        stem
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How far a node has applied the replication stream.
///
/// Ordered by log file name first, then by offset. Binlog file names carry a zero-padded
/// sequence number, so lexicographic order on the name matches creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicationPosition {
    pub log_file: String,
    pub log_offset: u64,
}

impl ReplicationPosition {
    pub fn new(log_file: impl Into<String>, log_offset: u64) -> Self {
        Self {
            log_file: log_file.into(),
            log_offset,
        }
    }
}

impl Ord for ReplicationPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.log_file
            .cmp(&other.log_file)
            .then(self.log_offset.cmp(&other.log_offset))
    }
}

impl PartialOrd for ReplicationPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ReplicationPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_file, self.log_offset)
    }
}

/// A contiguous slice of the table list assigned to one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAssignment {
    pub replica: ReplicaId,
    pub chunk_start: usize,
    pub chunk_size: usize,
}

impl ChunkAssignment {
    pub fn new(replica: ReplicaId, chunk_start: usize, chunk_size: usize) -> Self {
        Self {
            replica,
            chunk_start,
            chunk_size,
        }
    }

    /// Table index range of this chunk, clamped to `table_count`.
    pub fn range(&self, table_count: usize) -> Range<usize> {
        let start = self.chunk_start.min(table_count);
        let end = self.chunk_start.saturating_add(self.chunk_size).min(table_count);
        start..end
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_size == 0
    }
}

/// Ordered table names of the schema being backed up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableList(Vec<String>);

impl TableList {
    pub fn new(tables: Vec<String>) -> Self {
        Self(tables)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    /// Tables covered by `chunk`, never reading past the end of the list.
    pub fn chunk(&self, chunk: &ChunkAssignment) -> &[String] {
        &self.0[chunk.range(self.0.len())]
    }
}

impl From<Vec<String>> for TableList {
    fn from(tables: Vec<String>) -> Self {
        Self(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(id: &str) -> ReplicaId {
        ReplicaId::new(id).unwrap()
    }

    #[test]
    fn test_file_name_dominates_offset() {
        let older = ReplicationPosition::new("log.000002", 500);
        let newer = ReplicationPosition::new("log.000010", 10);
        assert!(newer > older);
        assert_eq!(
            ReplicationPosition::new("log.000010", 10).cmp(&newer),
            Ordering::Equal
        );
    }

    #[test]
    fn test_offset_breaks_ties_within_file() {
        let a = ReplicationPosition::new("log.5", 10);
        let b = ReplicationPosition::new("log.5", 50);
        assert!(b > a);
        assert_eq!([a.clone(), b.clone()].into_iter().max(), Some(b));
    }

    #[test]
    fn test_replica_id_parts() {
        let id = ReplicaId::from_host_port("db-2.internal", 3307).unwrap();
        assert_eq!(id.as_str(), "db-2.internal:3307");
        assert_eq!(id.host(), "db-2.internal");
        assert_eq!(id.port(), Some(3307));
        assert_eq!(id.file_stem(), "db-2.internal_c3307");

        let bare = replica("db-3");
        assert_eq!(bare.host(), "db-3");
        assert_eq!(bare.port(), None);
    }

    #[test]
    fn test_file_stems_never_collide() {
        let underscore = replica("a_b:3306");
        let colon = replica("a:b:3306");
        assert_eq!(underscore.file_stem(), "a__b_c3306");
        assert_eq!(colon.file_stem(), "a_cb_c3306");
        assert_ne!(underscore.file_stem(), colon.file_stem());

        assert_eq!(replica("db/é").file_stem(), "db_x2f_xc3_xa9");
        assert_ne!(replica("a_c").file_stem(), replica("a:").file_stem());
    }

    #[test]
    fn test_empty_replica_id_rejected() {
        assert!(matches!(
            ReplicaId::new("   "),
            Err(BackupError::Topology(_))
        ));
    }

    #[test]
    fn test_table_chunk_is_clamped() {
        let tables = TableList::new((0..10).map(|i| format!("t{i}")).collect());
        let last = ChunkAssignment::new(replica("c:1"), 8, 4);
        assert_eq!(tables.chunk(&last), &["t8".to_string(), "t9".to_string()]);

        let past_end = ChunkAssignment::new(replica("d:1"), 12, 4);
        assert!(tables.chunk(&past_end).is_empty());
    }
}
