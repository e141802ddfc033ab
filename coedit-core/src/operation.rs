//! The atomic edit vocabulary and its algebra.
//!
//! An [`Operation`] is a single positioned edit — insert, delete, or retain —
//! stamped with its author, a per-author sequence number, and the document
//! version it was created against. Positions and lengths are measured in
//! Unicode codepoints, never bytes.
//!
//! The algebra on top:
//! - [`apply`] — the operation's effect on document content
//! - [`compose`] — merge two sequential same-author operations into an
//!   equivalent shorter list (keeps the pending buffer compact)
//! - [`Operation::invert`] — the undo of an operation against the content it
//!   was applied to
//!
//! All of it is pure and total over well-formed inputs; malformed ranges fail
//! with [`EngineError::InvalidRange`] and never mutate anything.

use serde::{Deserialize, Serialize};
use str_indices::chars;
use uuid::Uuid;

/// Author identity, supplied by the external identity provider.
pub type UserId = Uuid;

/// Edit payload. The variant shape enforces the schema invariant: inserts
/// carry content and no length, deletes and retains carry a length and no
/// content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert `content` at the operation's position.
    Insert { content: String },
    /// Remove `length` codepoints starting at the operation's position.
    Delete { length: u64 },
    /// Skip `length` codepoints; identity on content. A zero-length retain
    /// is the canonical no-op that fully consumed deletes transform into.
    Retain { length: u64 },
}

/// A single immutable edit.
///
/// `doc_version` is the version of the document the operation targets;
/// `local_seq` orders operations from one author and is how an authority
/// echo is matched back to its pending original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub kind: OpKind,
    pub position: u64,
    pub author: UserId,
    pub local_seq: u64,
    pub doc_version: u64,
}

impl Operation {
    /// Create an insert operation.
    pub fn insert(position: u64, content: impl Into<String>, author: UserId) -> Self {
        Self {
            kind: OpKind::Insert {
                content: content.into(),
            },
            position,
            author,
            local_seq: 0,
            doc_version: 0,
        }
    }

    /// Create a delete operation.
    pub fn delete(position: u64, length: u64, author: UserId) -> Self {
        Self {
            kind: OpKind::Delete { length },
            position,
            author,
            local_seq: 0,
            doc_version: 0,
        }
    }

    /// Create a retain operation.
    pub fn retain(position: u64, length: u64, author: UserId) -> Self {
        Self {
            kind: OpKind::Retain { length },
            position,
            author,
            local_seq: 0,
            doc_version: 0,
        }
    }

    /// Set the document version this operation targets.
    pub fn with_base(mut self, doc_version: u64) -> Self {
        self.doc_version = doc_version;
        self
    }

    /// Set the per-author sequence number.
    pub fn with_seq(mut self, local_seq: u64) -> Self {
        self.local_seq = local_seq;
        self
    }

    /// Number of codepoints this operation inserts, deletes, or retains.
    pub fn len(&self) -> u64 {
        match &self.kind {
            OpKind::Insert { content } => chars::count(content) as u64,
            OpKind::Delete { length } | OpKind::Retain { length } => *length,
        }
    }

    /// Whether this operation has no effect on content.
    pub fn is_noop(&self) -> bool {
        matches!(self.kind, OpKind::Retain { .. }) || self.len() == 0
    }

    /// End of the source range this operation touches. Inserts touch a
    /// single point, so their end equals their position.
    pub fn end(&self) -> u64 {
        match &self.kind {
            OpKind::Insert { .. } => self.position,
            OpKind::Delete { length } | OpKind::Retain { length } => self.position + length,
        }
    }

    /// Whether two same-base operations touch overlapping ranges.
    ///
    /// Used for conflict detection: two deletes must strictly overlap, an
    /// insert conflicts with a delete only when it lands strictly inside the
    /// deleted range, and two inserts conflict only at the same position.
    pub fn overlaps(&self, other: &Operation) -> bool {
        match (&self.kind, &other.kind) {
            (OpKind::Insert { .. }, OpKind::Insert { .. }) => self.position == other.position,
            (OpKind::Insert { .. }, _) => {
                other.position < self.position && self.position < other.end()
            }
            (_, OpKind::Insert { .. }) => {
                self.position < other.position && other.position < self.end()
            }
            _ => self.position < other.end() && other.position < self.end(),
        }
    }

    /// Validate this operation's range against a document of `doc_len`
    /// codepoints. Out-of-range operations are rejected, never clamped —
    /// clamping would hide client/server divergence.
    pub fn validate(&self, doc_len: u64) -> Result<(), EngineError> {
        let ok = match &self.kind {
            OpKind::Insert { .. } => self.position <= doc_len,
            OpKind::Delete { length } | OpKind::Retain { length } => {
                self.position.checked_add(*length).is_some_and(|e| e <= doc_len)
            }
        };
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidRange {
                position: self.position,
                length: self.len(),
                doc_len,
            })
        }
    }

    /// The operation that undoes this one against `context`, the content it
    /// was applied to.
    pub fn invert(&self, context: &str) -> Result<Operation, EngineError> {
        let doc_len = chars::count(context) as u64;
        self.validate(doc_len)?;
        let kind = match &self.kind {
            OpKind::Insert { content } => OpKind::Delete {
                length: chars::count(content) as u64,
            },
            OpKind::Delete { length } => {
                let start = chars::to_byte_idx(context, self.position as usize);
                let end = chars::to_byte_idx(context, (self.position + length) as usize);
                OpKind::Insert {
                    content: context[start..end].to_string(),
                }
            }
            OpKind::Retain { length } => OpKind::Retain { length: *length },
        };
        Ok(Operation {
            kind,
            position: self.position,
            author: self.author,
            local_seq: self.local_seq,
            doc_version: self.doc_version + 1,
        })
    }
}

/// Apply an operation to content, producing the new content.
///
/// Validates fully before touching anything: either the whole effect lands
/// or an error comes back and the input is untouched.
pub fn apply(content: &str, op: &Operation) -> Result<String, EngineError> {
    let doc_len = chars::count(content) as u64;
    op.validate(doc_len)?;
    match &op.kind {
        OpKind::Insert { content: text } => {
            let at = chars::to_byte_idx(content, op.position as usize);
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..at]);
            out.push_str(text);
            out.push_str(&content[at..]);
            Ok(out)
        }
        OpKind::Delete { length } => {
            let start = chars::to_byte_idx(content, op.position as usize);
            let end = chars::to_byte_idx(content, (op.position + length) as usize);
            let mut out = String::with_capacity(content.len() - (end - start));
            out.push_str(&content[..start]);
            out.push_str(&content[end..]);
            Ok(out)
        }
        OpKind::Retain { .. } => Ok(content.to_string()),
    }
}

/// Apply a sequence of operations in order.
pub fn apply_all(content: &str, ops: &[Operation]) -> Result<String, EngineError> {
    let mut out = content.to_string();
    for op in ops {
        out = apply(&out, op)?;
    }
    Ok(out)
}

/// Merge two sequential operations from the same author into an equivalent
/// shorter list where possible.
///
/// `b` is assumed to have been created against the content produced by `a`.
/// Merges: insert into adjacent/contained insert, delete onto an adjacent or
/// overlapping earlier delete, and a delete entirely inside `a`'s own insert
/// (which trims the insert, possibly to nothing — an empty list means the
/// pair cancelled out). Anything else comes back unchanged as `[a, b]`.
pub fn compose(a: &Operation, b: &Operation) -> Vec<Operation> {
    if a.author != b.author {
        return vec![a.clone(), b.clone()];
    }
    if a.is_noop() && matches!(a.kind, OpKind::Retain { .. }) {
        return vec![b.clone()];
    }
    if b.is_noop() && matches!(b.kind, OpKind::Retain { .. }) {
        return vec![a.clone()];
    }

    let merged_kind = match (&a.kind, &b.kind) {
        (OpKind::Insert { content: ca }, OpKind::Insert { content: cb }) => {
            let a_len = chars::count(ca) as u64;
            if b.position >= a.position && b.position <= a.position + a_len {
                let split = chars::to_byte_idx(ca, (b.position - a.position) as usize);
                let mut merged = String::with_capacity(ca.len() + cb.len());
                merged.push_str(&ca[..split]);
                merged.push_str(cb);
                merged.push_str(&ca[split..]);
                Some((a.position, OpKind::Insert { content: merged }))
            } else {
                None
            }
        }
        (OpKind::Delete { length: la }, OpKind::Delete { length: lb }) => {
            // Sequential deletes merge when the earlier one's position falls
            // inside (or just past) the later one's range in the new content.
            if b.position <= a.position && a.position <= b.position + lb {
                Some((b.position, OpKind::Delete { length: la + lb }))
            } else {
                None
            }
        }
        (OpKind::Insert { content: ca }, OpKind::Delete { length: lb }) => {
            let a_len = chars::count(ca) as u64;
            if b.position >= a.position && b.position + lb <= a.position + a_len {
                let start = chars::to_byte_idx(ca, (b.position - a.position) as usize);
                let end = chars::to_byte_idx(ca, (b.position - a.position + lb) as usize);
                let mut trimmed = String::with_capacity(ca.len() - (end - start));
                trimmed.push_str(&ca[..start]);
                trimmed.push_str(&ca[end..]);
                if trimmed.is_empty() {
                    return Vec::new();
                }
                Some((a.position, OpKind::Insert { content: trimmed }))
            } else {
                None
            }
        }
        _ => None,
    };

    match merged_kind {
        Some((position, kind)) => vec![Operation {
            kind,
            position,
            author: a.author,
            local_seq: a.local_seq,
            doc_version: a.doc_version,
        }],
        None => vec![a.clone(), b.clone()],
    }
}

/// Engine errors. `InvalidRange` and `StaleVersion` are recoverable by the
/// caller; `Diverged` is terminal for the document session and requires a
/// full resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Operation bounds fall outside the document at its target version.
    InvalidRange {
        position: u64,
        length: u64,
        doc_len: u64,
    },
    /// Local submission raced the authority; rebase and resubmit.
    StaleVersion { submitted: u64, current: u64 },
    /// A remote operation failed to transform against local history.
    Diverged,
    /// The document has no loaded snapshot yet.
    NotLoaded,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange {
                position,
                length,
                doc_len,
            } => write!(
                f,
                "invalid range: position {position} length {length} exceeds document length {doc_len}"
            ),
            EngineError::StaleVersion { submitted, current } => write!(
                f,
                "stale version: submitted against {submitted}, document is at {current}"
            ),
            EngineError::Diverged => write!(f, "document diverged; full resync required"),
            EngineError::NotLoaded => write!(f, "document has no loaded snapshot"),
        }
    }
}

impl std::error::Error for EngineError {}
