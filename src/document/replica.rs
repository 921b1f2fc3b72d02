//! CRDT-backed replica of one shared document.
//!
//! The replica owns an automerge document whose schema is shared with every
//! other client of the coordinator: a root map with `children` (list of
//! paragraph maps) and `speaker_names` (map of speaker id to display name).
//! Paragraphs hold a `speaker` scalar and a `children` list of atom maps;
//! atoms hold a collaborative `text` object and `start`/`end` floats.
//!
//! All local edits go through labeled transactions. A transaction whose
//! mutator performs no operations is rolled back and yields no change:
//! committing an empty change locally would make every later change depend
//! on bytes the server never receives.

use automerge::transaction::{CommitOptions, Transactable, Transaction};
use automerge::{Automerge, Change, ObjId, ObjType, ReadDoc, ScalarValue, Value, ROOT};

use crate::document::{Atom, Document, Paragraph};
use crate::error::ReplicaError;

/// The merge engine behind [`DocumentReplica`], kept behind a trait so the
/// concrete CRDT library is swappable. The worker only relies on the
/// documented properties: convergent merge of concurrent transactions and
/// causally ordered change application.
pub trait CrdtDocument: Send {
    /// Applies one serialized remote change.
    fn apply_change(&mut self, bytes: &[u8]) -> Result<(), ReplicaError>;

    /// Replaces the entire replica with a serialized snapshot.
    fn load_snapshot(&mut self, bytes: &[u8]) -> Result<(), ReplicaError>;

    /// Runs `mutator` inside a labeled transaction and returns the resulting
    /// change bytes, or `None` when the mutator made no change.
    fn transact(
        &mut self,
        label: &str,
        mutator: &mut dyn FnMut(&mut dyn DocumentEditor) -> Result<(), ReplicaError>,
    ) -> Result<Option<Vec<u8>>, ReplicaError>;

    /// Dumps the current merged state as a plain [`Document`].
    fn snapshot(&self) -> Result<Document, ReplicaError>;
}

/// Mutable view of the document inside one transaction.
pub trait DocumentEditor {
    /// Sets `children = []` and `speaker_names = {}` where the keys are
    /// currently absent or null. Safe to run redundantly; concurrent runs on
    /// diverged replicas converge to the same empty state.
    fn init_if_missing(&mut self) -> Result<(), ReplicaError>;

    /// Replaces the paragraph list with a fresh empty one.
    fn clear_paragraphs(&mut self) -> Result<(), ReplicaError>;

    fn push_paragraph(&mut self, paragraph: &Paragraph) -> Result<(), ReplicaError>;

    fn paragraph_count(&self) -> Result<usize, ReplicaError>;

    fn atom_count(&self, paragraph: usize) -> Result<usize, ReplicaError>;

    /// Overwrites `start`/`end` of one existing atom, addressed positionally.
    /// Never resizes the paragraph or atom structure.
    fn set_atom_timing(
        &mut self,
        paragraph: usize,
        atom: usize,
        start: f64,
        end: f64,
    ) -> Result<(), ReplicaError>;

    fn set_paragraph_speaker(
        &mut self,
        paragraph: usize,
        speaker: Option<&str>,
    ) -> Result<(), ReplicaError>;

    fn set_speaker_name(&mut self, speaker: &str, name: &str) -> Result<(), ReplicaError>;
}

/// Automerge-backed document replica.
#[derive(Debug)]
pub struct DocumentReplica {
    doc: Automerge,
}

impl Default for DocumentReplica {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentReplica {
    pub fn new() -> Self {
        Self {
            doc: Automerge::new(),
        }
    }

    /// Convenience wrapper over [`CrdtDocument::transact`] taking a closure.
    pub fn with_transaction<F>(
        &mut self,
        label: &str,
        mutator: F,
    ) -> Result<Option<Vec<u8>>, ReplicaError>
    where
        F: FnOnce(&mut dyn DocumentEditor) -> Result<(), ReplicaError>,
    {
        let mut mutator = Some(mutator);
        CrdtDocument::transact(self, label, &mut |editor| {
            match mutator.take() {
                Some(f) => f(editor),
                // transact invokes the mutator exactly once
                None => Err(ReplicaError::Corrupt("transaction re-entered".into())),
            }
        })
    }

    /// Runs the idempotent initialization transaction.
    pub fn ensure_initialized(&mut self) -> Result<Option<Vec<u8>>, ReplicaError> {
        self.with_transaction("Initialize Document", |d| d.init_if_missing())
    }

    /// Serializes the full replica, the payload of a `FULL_DOCUMENT` frame.
    pub fn save(&self) -> Vec<u8> {
        self.doc.save()
    }
}

impl CrdtDocument for DocumentReplica {
    fn apply_change(&mut self, bytes: &[u8]) -> Result<(), ReplicaError> {
        let change = Change::from_bytes(bytes.to_vec())?;
        self.doc.apply_changes([change])?;
        Ok(())
    }

    fn load_snapshot(&mut self, bytes: &[u8]) -> Result<(), ReplicaError> {
        self.doc = Automerge::load(bytes)?;
        Ok(())
    }

    fn transact(
        &mut self,
        label: &str,
        mutator: &mut dyn FnMut(&mut dyn DocumentEditor) -> Result<(), ReplicaError>,
    ) -> Result<Option<Vec<u8>>, ReplicaError> {
        let mut tx = self.doc.transaction();
        let result = {
            let mut editor = ReplicaTx { tx: &mut tx };
            mutator(&mut editor)
        };
        match result {
            Err(e) => {
                tx.rollback();
                Err(e)
            }
            Ok(()) => {
                if tx.pending_ops() == 0 {
                    tx.rollback();
                    return Ok(None);
                }
                tx.commit_with(CommitOptions::default().with_message(label));
                let bytes = self
                    .doc
                    .get_last_local_change()
                    .map(|change| change.raw_bytes().to_vec());
                Ok(bytes)
            }
        }
    }

    fn snapshot(&self) -> Result<Document, ReplicaError> {
        let mut document = Document::default();

        if let Some(children) = object_at(&self.doc, &ROOT, "children", ObjType::List)? {
            for idx in 0..self.doc.length(&children) {
                document.children.push(read_paragraph(&self.doc, &children, idx)?);
            }
        }

        if let Some(speakers) = object_at(&self.doc, &ROOT, "speaker_names", ObjType::Map)? {
            let keys: Vec<String> = self.doc.keys(&speakers).collect();
            for key in keys {
                if let Some((value, _)) = self.doc.get(&speakers, key.as_str())? {
                    if let Some(name) = scalar_string(&value) {
                        document.speaker_names.insert(key, name);
                    }
                }
            }
        }

        Ok(document)
    }
}

/// Editor bound to one open automerge transaction.
struct ReplicaTx<'a, 'b> {
    tx: &'a mut Transaction<'b>,
}

impl ReplicaTx<'_, '_> {
    fn children_list(&self) -> Result<ObjId, ReplicaError> {
        object_at(self.tx, &ROOT, "children", ObjType::List)?
            .ok_or_else(|| ReplicaError::Corrupt("document has no paragraph list".into()))
    }

    fn paragraph_at(&self, index: usize) -> Result<ObjId, ReplicaError> {
        let children = self.children_list()?;
        match self.tx.get(&children, index)? {
            Some((Value::Object(ObjType::Map), id)) => Ok(id),
            _ => Err(ReplicaError::Corrupt(format!(
                "no paragraph at index {index}"
            ))),
        }
    }

    fn atoms_of(&self, paragraph: usize) -> Result<ObjId, ReplicaError> {
        let para = self.paragraph_at(paragraph)?;
        object_at(self.tx, &para, "children", ObjType::List)?.ok_or_else(|| {
            ReplicaError::Corrupt(format!("paragraph {paragraph} has no atom list"))
        })
    }

    fn atom_at(&self, paragraph: usize, atom: usize) -> Result<ObjId, ReplicaError> {
        let atoms = self.atoms_of(paragraph)?;
        match self.tx.get(&atoms, atom)? {
            Some((Value::Object(ObjType::Map), id)) => Ok(id),
            _ => Err(ReplicaError::Corrupt(format!(
                "no atom {atom} in paragraph {paragraph}"
            ))),
        }
    }

    fn speaker_names_map(&mut self) -> Result<ObjId, ReplicaError> {
        if let Some(id) = object_at(self.tx, &ROOT, "speaker_names", ObjType::Map)? {
            return Ok(id);
        }
        Ok(self.tx.put_object(ROOT, "speaker_names", ObjType::Map)?)
    }
}

impl DocumentEditor for ReplicaTx<'_, '_> {
    fn init_if_missing(&mut self) -> Result<(), ReplicaError> {
        if is_unset(self.tx, &ROOT, "children")? {
            self.tx.put_object(ROOT, "children", ObjType::List)?;
        }
        if is_unset(self.tx, &ROOT, "speaker_names")? {
            self.tx.put_object(ROOT, "speaker_names", ObjType::Map)?;
        }
        Ok(())
    }

    fn clear_paragraphs(&mut self) -> Result<(), ReplicaError> {
        self.tx.put_object(ROOT, "children", ObjType::List)?;
        Ok(())
    }

    fn push_paragraph(&mut self, paragraph: &Paragraph) -> Result<(), ReplicaError> {
        let children = self.children_list()?;
        let index = self.tx.length(&children);
        let para = self.tx.insert_object(&children, index, ObjType::Map)?;
        match &paragraph.speaker {
            Some(speaker) => self.tx.put(&para, "speaker", speaker.as_str())?,
            None => self.tx.put(&para, "speaker", ScalarValue::Null)?,
        }
        let atoms = self.tx.put_object(&para, "children", ObjType::List)?;
        for (idx, atom) in paragraph.children.iter().enumerate() {
            let atom_obj = self.tx.insert_object(&atoms, idx, ObjType::Map)?;
            let text = self.tx.put_object(&atom_obj, "text", ObjType::Text)?;
            self.tx.splice_text(&text, 0, 0, &atom.text)?;
            self.tx.put(&atom_obj, "start", atom.start)?;
            self.tx.put(&atom_obj, "end", atom.end)?;
        }
        Ok(())
    }

    fn paragraph_count(&self) -> Result<usize, ReplicaError> {
        let children = self.children_list()?;
        Ok(self.tx.length(&children))
    }

    fn atom_count(&self, paragraph: usize) -> Result<usize, ReplicaError> {
        let atoms = self.atoms_of(paragraph)?;
        Ok(self.tx.length(&atoms))
    }

    fn set_atom_timing(
        &mut self,
        paragraph: usize,
        atom: usize,
        start: f64,
        end: f64,
    ) -> Result<(), ReplicaError> {
        let atom_obj = self.atom_at(paragraph, atom)?;
        self.tx.put(&atom_obj, "start", start)?;
        self.tx.put(&atom_obj, "end", end)?;
        Ok(())
    }

    fn set_paragraph_speaker(
        &mut self,
        paragraph: usize,
        speaker: Option<&str>,
    ) -> Result<(), ReplicaError> {
        let para = self.paragraph_at(paragraph)?;
        match speaker {
            Some(speaker) => self.tx.put(&para, "speaker", speaker)?,
            None => self.tx.put(&para, "speaker", ScalarValue::Null)?,
        }
        Ok(())
    }

    fn set_speaker_name(&mut self, speaker: &str, name: &str) -> Result<(), ReplicaError> {
        let speakers = self.speaker_names_map()?;
        self.tx.put(&speakers, speaker, name)?;
        Ok(())
    }
}

/// Resolves an object-valued property, tolerating absence and null.
fn object_at<D: ReadDoc>(
    doc: &D,
    obj: &ObjId,
    prop: &str,
    expected: ObjType,
) -> Result<Option<ObjId>, ReplicaError> {
    match doc.get(obj, prop)? {
        None => Ok(None),
        Some((Value::Scalar(scalar), _)) if *scalar.as_ref() == ScalarValue::Null => Ok(None),
        Some((Value::Object(ty), id)) if ty == expected => Ok(Some(id)),
        Some((other, _)) => Err(ReplicaError::Corrupt(format!(
            "expected {expected:?} under '{prop}', found {other:?}"
        ))),
    }
}

fn is_unset<D: ReadDoc>(doc: &D, obj: &ObjId, prop: &str) -> Result<bool, ReplicaError> {
    match doc.get(obj, prop)? {
        None => Ok(true),
        Some((Value::Scalar(scalar), _)) => Ok(*scalar.as_ref() == ScalarValue::Null),
        Some(_) => Ok(false),
    }
}

fn read_paragraph<D: ReadDoc>(
    doc: &D,
    children: &ObjId,
    index: usize,
) -> Result<Paragraph, ReplicaError> {
    let para = match doc.get(children, index)? {
        Some((Value::Object(ObjType::Map), id)) => id,
        other => {
            return Err(ReplicaError::Corrupt(format!(
                "paragraph {index} is not a map: {other:?}"
            )))
        }
    };

    let speaker = match doc.get(&para, "speaker")? {
        Some((value, _)) => scalar_string(&value),
        None => None,
    };

    let mut paragraph = Paragraph {
        speaker,
        children: Vec::new(),
    };

    if let Some(atoms) = object_at(doc, &para, "children", ObjType::List)? {
        for atom_idx in 0..doc.length(&atoms) {
            paragraph.children.push(read_atom(doc, &atoms, atom_idx)?);
        }
    }

    Ok(paragraph)
}

fn read_atom<D: ReadDoc>(doc: &D, atoms: &ObjId, index: usize) -> Result<Atom, ReplicaError> {
    let atom = match doc.get(atoms, index)? {
        Some((Value::Object(ObjType::Map), id)) => id,
        other => {
            return Err(ReplicaError::Corrupt(format!(
                "atom {index} is not a map: {other:?}"
            )))
        }
    };

    let text = match doc.get(&atom, "text")? {
        Some((Value::Object(ObjType::Text), id)) => doc.text(&id)?,
        Some((value, _)) => scalar_string(&value).unwrap_or_default(),
        None => String::new(),
    };

    Ok(Atom {
        text,
        start: scalar_f64(doc, &atom, "start")?,
        end: scalar_f64(doc, &atom, "end")?,
    })
}

fn scalar_f64<D: ReadDoc>(doc: &D, obj: &ObjId, prop: &str) -> Result<f64, ReplicaError> {
    let value = match doc.get(obj, prop)? {
        Some((value, _)) => value,
        None => return Ok(0.0),
    };
    match value {
        Value::Scalar(scalar) => match scalar.as_ref() {
            ScalarValue::F64(f) => Ok(*f),
            ScalarValue::Int(i) => Ok(*i as f64),
            ScalarValue::Uint(u) => Ok(*u as f64),
            other => Err(ReplicaError::Corrupt(format!(
                "expected number under '{prop}', found {other:?}"
            ))),
        },
        other => Err(ReplicaError::Corrupt(format!(
            "expected number under '{prop}', found {other:?}"
        ))),
    }
}

fn scalar_string(value: &Value<'_>) -> Option<String> {
    match value {
        Value::Scalar(scalar) => match scalar.as_ref() {
            ScalarValue::Str(s) => Some(s.to_string()),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paragraph(speaker: Option<&str>, atoms: &[(&str, f64, f64)]) -> Paragraph {
        Paragraph {
            speaker: speaker.map(str::to_string),
            children: atoms
                .iter()
                .map(|(text, start, end)| Atom {
                    text: text.to_string(),
                    start: *start,
                    end: *end,
                })
                .collect(),
        }
    }

    #[test]
    fn initialization_is_idempotent() {
        let mut replica = DocumentReplica::new();
        let first = replica.ensure_initialized().unwrap();
        assert!(first.is_some());

        let second = replica.ensure_initialized().unwrap();
        assert!(second.is_none());

        let doc = replica.snapshot().unwrap();
        assert!(doc.children.is_empty());
        assert!(doc.speaker_names.is_empty());
    }

    #[test]
    fn concurrent_initialization_converges() {
        let mut a = DocumentReplica::new();
        let mut b = DocumentReplica::new();
        let change_a = a.ensure_initialized().unwrap().unwrap();
        let change_b = b.ensure_initialized().unwrap().unwrap();

        a.apply_change(&change_b).unwrap();
        b.apply_change(&change_a).unwrap();

        let doc_a = a.snapshot().unwrap();
        let doc_b = b.snapshot().unwrap();
        assert_eq!(doc_a, doc_b);
        assert!(doc_a.children.is_empty());
        assert!(doc_a.speaker_names.is_empty());
    }

    #[test]
    fn noop_transaction_yields_no_change() {
        let mut replica = DocumentReplica::new();
        replica.ensure_initialized().unwrap();

        let change = replica
            .with_transaction("Nothing", |_editor| Ok(()))
            .unwrap();
        assert!(change.is_none());
    }

    #[test]
    fn failed_mutator_rolls_back() {
        let mut replica = DocumentReplica::new();
        replica.ensure_initialized().unwrap();

        let result = replica.with_transaction("Broken", |editor| {
            editor.push_paragraph(&paragraph(None, &[("x", 0.0, 1.0)]))?;
            Err(ReplicaError::Corrupt("forced failure".into()))
        });
        assert!(result.is_err());
        assert!(replica.snapshot().unwrap().children.is_empty());
    }

    #[test]
    fn appended_paragraphs_round_trip() {
        let mut replica = DocumentReplica::new();
        replica.ensure_initialized().unwrap();

        let change = replica
            .with_transaction("Automatic Transcription", |editor| {
                editor.push_paragraph(&paragraph(
                    Some("spk_0"),
                    &[("hello ", 0.0, 0.4), ("world", 0.4, 0.9)],
                ))
            })
            .unwrap();
        assert!(change.is_some());

        let doc = replica.snapshot().unwrap();
        assert_eq!(doc.children.len(), 1);
        assert_eq!(doc.children[0].speaker.as_deref(), Some("spk_0"));
        assert_eq!(doc.children[0].children[0].text, "hello ");
        assert_eq!(doc.children[0].children[1].start, 0.4);
    }

    #[test]
    fn changes_replay_onto_a_fresh_replica() {
        let mut source = DocumentReplica::new();
        let mut backlog = Vec::new();
        backlog.push(source.ensure_initialized().unwrap().unwrap());
        backlog.push(
            source
                .with_transaction("Automatic Transcription", |editor| {
                    editor.push_paragraph(&paragraph(None, &[("one", 0.0, 1.0)]))
                })
                .unwrap()
                .unwrap(),
        );
        backlog.push(
            source
                .with_transaction("Automatic Transcription", |editor| {
                    editor.push_paragraph(&paragraph(None, &[("two", 1.0, 2.0)]))
                })
                .unwrap()
                .unwrap(),
        );

        let mut replay = DocumentReplica::new();
        for change in &backlog {
            replay.apply_change(change).unwrap();
        }
        assert_eq!(replay.snapshot().unwrap(), source.snapshot().unwrap());
    }

    #[test]
    fn reset_replaces_paragraph_list() {
        let mut replica = DocumentReplica::new();
        replica.ensure_initialized().unwrap();
        replica
            .with_transaction("Automatic Transcription", |editor| {
                editor.push_paragraph(&paragraph(None, &[("old", 0.0, 1.0)]))
            })
            .unwrap();

        let change = replica
            .with_transaction("Reset Document", |editor| editor.clear_paragraphs())
            .unwrap();
        assert!(change.is_some());
        assert!(replica.snapshot().unwrap().children.is_empty());
    }

    #[test]
    fn atom_timing_update_preserves_text_and_shape() {
        let mut replica = DocumentReplica::new();
        replica.ensure_initialized().unwrap();
        replica
            .with_transaction("Automatic Transcription", |editor| {
                editor.push_paragraph(&paragraph(None, &[("a", 0.0, 1.0), ("b", 1.0, 2.0)]))
            })
            .unwrap();

        replica
            .with_transaction("Alignment", |editor| {
                editor.set_atom_timing(0, 0, 0.1, 0.9)?;
                editor.set_atom_timing(0, 1, 0.9, 1.8)
            })
            .unwrap();

        let doc = replica.snapshot().unwrap();
        assert_eq!(doc.children[0].children.len(), 2);
        assert_eq!(doc.children[0].children[0].text, "a");
        assert_eq!(doc.children[0].children[0].start, 0.1);
        assert_eq!(doc.children[0].children[1].end, 1.8);
    }

    #[test]
    fn speaker_assignment_and_names() {
        let mut replica = DocumentReplica::new();
        replica.ensure_initialized().unwrap();
        replica
            .with_transaction("Automatic Transcription", |editor| {
                editor.push_paragraph(&paragraph(None, &[("a", 0.0, 1.0)]))
            })
            .unwrap();

        let change = replica
            .with_transaction("Speaker Identification", |editor| {
                editor.set_paragraph_speaker(0, Some("spk_1"))?;
                editor.set_speaker_name("spk_1", "Speaker 1")
            })
            .unwrap();
        assert!(change.is_some());

        let doc = replica.snapshot().unwrap();
        assert_eq!(doc.children[0].speaker.as_deref(), Some("spk_1"));
        assert_eq!(doc.speaker_names.get("spk_1").unwrap(), "Speaker 1");
    }

    #[test]
    fn divergent_replicas_converge_after_exchange() {
        let mut a = DocumentReplica::new();
        let init = a.ensure_initialized().unwrap().unwrap();
        let mut b = DocumentReplica::new();
        b.apply_change(&init).unwrap();

        let from_a = a
            .with_transaction("Automatic Transcription", |editor| {
                editor.push_paragraph(&paragraph(None, &[("left", 0.0, 1.0)]))
            })
            .unwrap()
            .unwrap();
        let from_b = b
            .with_transaction("Speaker Identification", |editor| {
                editor.set_speaker_name("spk_0", "Alice")
            })
            .unwrap()
            .unwrap();

        a.apply_change(&from_b).unwrap();
        b.apply_change(&from_a).unwrap();
        assert_eq!(a.snapshot().unwrap(), b.snapshot().unwrap());
    }

    #[test]
    fn snapshot_bytes_replace_replica_state() {
        let mut source = DocumentReplica::new();
        source.ensure_initialized().unwrap();
        source
            .with_transaction("Automatic Transcription", |editor| {
                editor.push_paragraph(&paragraph(None, &[("snap", 0.0, 1.0)]))
            })
            .unwrap();
        let bytes = source.save();

        let mut replica = DocumentReplica::new();
        replica.ensure_initialized().unwrap();
        replica.load_snapshot(&bytes).unwrap();
        assert_eq!(replica.snapshot().unwrap(), source.snapshot().unwrap());
    }
}
