pub mod replica;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::TimingViolation;

pub use replica::{CrdtDocument, DocumentEditor, DocumentReplica};

/// Plain snapshot of the shared document tree.
///
/// This is the read-only view handed to engines and tests. All mutation goes
/// through [`DocumentReplica`] transactions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub children: Vec<Paragraph>,
    #[serde(default)]
    pub speaker_names: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    #[serde(default)]
    pub speaker: Option<String>,
    pub children: Vec<Atom>,
}

/// Smallest document unit: a snippet of text with a time range in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

impl Document {
    /// All atoms in document reading order.
    pub fn iter_atoms(&self) -> impl Iterator<Item = &Atom> {
        self.children.iter().flat_map(|p| p.children.iter())
    }
}

/// Checks that atoms in document order have non-decreasing `start` values.
///
/// Downstream playback and highlighting rely on this ordering, so handlers
/// must verify it after every transaction that touches timings or document
/// order, before the change leaves the worker.
pub fn ensure_timing_invariant(doc: &Document) -> Result<(), TimingViolation> {
    let mut prev_start = f64::NEG_INFINITY;
    for (para_idx, paragraph) in doc.children.iter().enumerate() {
        for (atom_idx, atom) in paragraph.children.iter().enumerate() {
            if atom.start < prev_start {
                return Err(TimingViolation {
                    paragraph: para_idx,
                    atom: atom_idx,
                    prev_start,
                    start: atom.start,
                });
            }
            prev_start = atom.start;
        }
    }
    Ok(())
}
