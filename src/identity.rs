//! Location-independent identifiers.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Stable identity of a worker.
///
/// All lookups go through this, never through a network address, so
/// a worker keeps its identity if it is placed somewhere else.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorVirtualIdentity(pub String);

impl ActorVirtualIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Conventional identity of the `index`th worker of an operator.
    pub fn worker(operator: &OperatorIdentity, index: usize) -> Self {
        Self(format!("Worker:{}-{index}", operator.0))
    }

    /// A version of this identity that is safe to use as a file name.
    /// ASCII letters, digits and `-` are kept; every other byte becomes
    /// `_` and two hex digits, so distinct identities never share a
    /// stem.
    pub(crate) fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(self.0.len());
        for byte in self.0.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                stem.push(char::from(byte));
            } else {
                stem.push_str(&format!("_{byte:02X}"));
            }
        }
        stem
    }
}

impl fmt::Display for ActorVirtualIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identity of a physical operator in a compiled plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorIdentity(pub String);

impl OperatorIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for OperatorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Identity of a schedulable region.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegionIdentity(pub u64);

impl fmt::Display for RegionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region-{}", self.0)
    }
}

#[test]
fn worker_identity_is_derived_from_operator() {
    let op = OperatorIdentity::new("filter-1");
    assert_eq!(
        ActorVirtualIdentity::worker(&op, 2),
        ActorVirtualIdentity::new("Worker:filter-1-2")
    );
}

#[test]
fn file_stem_escapes_separators() {
    let id = ActorVirtualIdentity::new("Worker:op/1-0");
    assert_eq!(id.file_stem(), "Worker_3Aop_2F1-0");
    assert_eq!(ActorVirtualIdentity::new("Worker_a").file_stem(), "Worker_5Fa");
    assert_eq!(ActorVirtualIdentity::new("Wörker").file_stem(), "W_C3_B6rker");
}

#[test]
fn file_stems_do_not_collide() {
    let stems: std::collections::HashSet<_> = ["Worker:a", "Worker_a", "Worker/a", "Worker_3Aa"]
        .into_iter()
        .map(|name| ActorVirtualIdentity::new(name).file_stem())
        .collect();
    assert_eq!(stems.len(), 4);
}

#[test]
fn identities_serialize_transparently() {
    use serde_test::{assert_tokens, Token};

    assert_tokens(&RegionIdentity(3), &[Token::U64(3)]);
    assert_tokens(&ActorVirtualIdentity::new("Worker:a-0"), &[Token::Str("Worker:a-0")]);
}
