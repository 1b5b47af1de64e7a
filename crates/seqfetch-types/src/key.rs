use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{TypeError, TypeResult};

/// The version-less identity of a blob: which container it lives in.
///
/// Two [`BlobKey`]s with the same container refer to the "same blob
/// container" even when their versions differ. Containers are what the
/// load-lock registry and the cache index on, so a newer version of a blob
/// replaces the older one instead of living beside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobContainer {
    pub partition: i32,
    pub sub_partition: i32,
    pub key: i32,
}

impl BlobContainer {
    /// Create a container identity.
    pub const fn new(partition: i32, sub_partition: i32, key: i32) -> Self {
        Self {
            partition,
            sub_partition,
            key,
        }
    }
}

impl fmt::Display for BlobContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.partition, self.sub_partition, self.key)
    }
}

/// Immutable identity + version of a retrievable blob.
///
/// # Equivalences
///
/// - [`same_container`](Self::same_container): partition, sub-partition and
///   key match.
/// - [`same_sequence`](Self::same_sequence): same container and the same
///   sequence id.
///
/// # Ordering
///
/// Keys order lexicographically by `(partition, sub_partition, key)` first,
/// which is the order locks are taken in, then by version (unknown versions
/// sort before known ones) for freshness comparison, and finally by sequence
/// id so the order stays total.
///
/// # String form
///
/// `partition.subPartition.key[.version][/sequenceId]`. [`fmt::Display`]
/// and [`FromStr`] round-trip exactly.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobKey {
    pub partition: i32,
    pub sub_partition: i32,
    pub key: i32,
    pub sequence_id: Option<i64>,
    pub version: Option<i32>,
}

impl BlobKey {
    /// Create an unversioned key with no sequence id.
    pub const fn new(partition: i32, sub_partition: i32, key: i32) -> Self {
        Self {
            partition,
            sub_partition,
            key,
            sequence_id: None,
            version: None,
        }
    }

    /// Return a copy of this key carrying the given version.
    pub const fn with_version(mut self, version: i32) -> Self {
        self.version = Some(version);
        self
    }

    /// Return a copy of this key carrying the given sequence id.
    pub const fn with_sequence(mut self, sequence_id: i64) -> Self {
        self.sequence_id = Some(sequence_id);
        self
    }

    /// The version-less container identity.
    pub const fn container(&self) -> BlobContainer {
        BlobContainer::new(self.partition, self.sub_partition, self.key)
    }

    /// Returns `true` if both keys name the same blob container.
    pub fn same_container(&self, other: &BlobKey) -> bool {
        self.container() == other.container()
    }

    /// Returns `true` if both keys name the same sequence in the same container.
    pub fn same_sequence(&self, other: &BlobKey) -> bool {
        self.same_container(other) && self.sequence_id == other.sequence_id
    }

    /// Returns `true` if `self` is a strictly fresher version of the same
    /// container than `other`. An unknown version is never fresher.
    pub fn is_newer_than(&self, other: &BlobKey) -> bool {
        self.same_container(other)
            && match (self.version, other.version) {
                (Some(mine), Some(theirs)) => mine > theirs,
                (Some(_), None) => true,
                _ => false,
            }
    }

    /// Parse the canonical string form.
    pub fn parse(s: &str) -> TypeResult<Self> {
        let invalid = |reason: &str| TypeError::InvalidBlobId {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        let (body, sequence) = match s.split_once('/') {
            Some((body, seq)) => (body, Some(seq)),
            None => (s, None),
        };

        let fields: Vec<&str> = body.split('.').collect();
        if fields.len() != 3 && fields.len() != 4 {
            return Err(invalid("expected partition.subPartition.key[.version]"));
        }

        let int = |field: &str, name: &str| -> TypeResult<i32> {
            field
                .parse::<i32>()
                .map_err(|e| invalid(&format!("bad {name}: {e}")))
        };

        let mut key = BlobKey::new(
            int(fields[0], "partition")?,
            int(fields[1], "sub-partition")?,
            int(fields[2], "key")?,
        );
        if let Some(version) = fields.get(3) {
            key.version = Some(int(version, "version")?);
        }
        if let Some(seq) = sequence {
            let id = seq
                .parse::<i64>()
                .map_err(|e| invalid(&format!("bad sequence id: {e}")))?;
            key.sequence_id = Some(id);
        }
        Ok(key)
    }
}

impl Ord for BlobKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.container()
            .cmp(&other.container())
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.sequence_id.cmp(&other.sequence_id))
    }
}

impl PartialOrd for BlobKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.container())?;
        if let Some(version) = self.version {
            write!(f, ".{version}")?;
        }
        if let Some(seq) = self.sequence_id {
            write!(f, "/{seq}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobKey({self})")
    }
}

impl FromStr for BlobKey {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
