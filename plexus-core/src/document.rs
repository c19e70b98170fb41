//! Shared document adapter over a yrs `Doc`.
//!
//! Layout:
//! ```text
//! Doc
//! └── "elements": Map
//!     ├── "Task_1": Map { kind, x, y, width, height, name, ext:assignee, ... }
//!     └── "Flow_1": Map { kind, source, target, waypoints, name, ... }
//! ```
//!
//! Each element is a nested map so concurrent edits to different fields
//! of one element merge independently. Every transaction carries a
//! [`DocOrigin`]; observers receive it with the change so local echoes
//! can be filtered out.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use yrs::types::{EntryChange as MapEntryChange, Event, PathSegment};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, DeepObservable, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector, Subscription,
    Transact, TransactionMut, Update,
};

use crate::{Bounds, DiagramElement, ElementId, ElementKind, FieldGroup, Payload, Point, Scalar};

/// Name of the root map holding all diagram elements.
pub const ELEMENTS_MAP: &str = "elements";

const KIND: &str = "kind";
const X: &str = "x";
const Y: &str = "y";
const WIDTH: &str = "width";
const HEIGHT: &str = "height";
const PARENT: &str = "parent";
const NAME: &str = "name";
const SOURCE: &str = "source";
const TARGET: &str = "target";
const WAYPOINTS: &str = "waypoints";
const EXT_PREFIX: &str = "ext:";

/// Field group a stored key belongs to.
pub fn field_group(key: &str) -> Option<FieldGroup> {
    match key {
        X | Y | WIDTH | HEIGHT => Some(FieldGroup::Geometry),
        NAME => Some(FieldGroup::Payload),
        SOURCE | TARGET => Some(FieldGroup::Endpoints),
        WAYPOINTS => Some(FieldGroup::Waypoints),
        PARENT => Some(FieldGroup::Parent),
        k if k.starts_with(EXT_PREFIX) => Some(FieldGroup::Payload),
        _ => None,
    }
}

/// Source tag attached to every transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocOrigin {
    /// Produced by the local bridge from an editor command
    Local,
    /// Applied from a peer's update
    Remote,
    /// Full rewrite of the document from local model truth
    Resync,
}

impl DocOrigin {
    pub fn tag(&self) -> &'static str {
        match self {
            DocOrigin::Local => "plexus/local",
            DocOrigin::Remote => "plexus/remote",
            DocOrigin::Resync => "plexus/resync",
        }
    }

    fn from_tag(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"plexus/local" => Some(DocOrigin::Local),
            b"plexus/remote" => Some(DocOrigin::Remote),
            b"plexus/resync" => Some(DocOrigin::Resync),
            _ => None,
        }
    }

    /// Local-class origins must never re-enter the local-apply path.
    pub fn is_local_class(&self) -> bool {
        matches!(self, DocOrigin::Local | DocOrigin::Resync)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryChangeKind {
    Added,
    /// Stored keys that changed inside an existing entry
    Updated { fields: BTreeSet<String> },
    Removed,
}

impl EntryChangeKind {
    /// Field groups touched by this change. `Added` touches everything.
    pub fn groups(&self) -> BTreeSet<FieldGroup> {
        match self {
            EntryChangeKind::Added => FieldGroup::ALL.into_iter().collect(),
            EntryChangeKind::Updated { fields } => {
                fields.iter().filter_map(|f| field_group(f)).collect()
            }
            EntryChangeKind::Removed => BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryChange {
    pub id: ElementId,
    pub kind: EntryChangeKind,
}

/// All entry changes committed by one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// `None` when the transaction carried a foreign origin tag
    pub origin: Option<DocOrigin>,
    pub entries: Vec<EntryChange>,
}

impl DocumentChange {
    pub fn is_local_class(&self) -> bool {
        self.origin.is_some_and(|o| o.is_local_class())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentError {
    /// Update or state vector bytes could not be decoded
    Decode(String),
    /// The CRDT refused to integrate an update
    Apply(String),
    /// Another write transaction is open on this document
    TransactionBusy,
    /// Field value could not be encoded
    Encoding(String),
}

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentError::Decode(e) => write!(f, "Decode error: {e}"),
            DocumentError::Apply(e) => write!(f, "Failed to apply update: {e}"),
            DocumentError::TransactionBusy => write!(f, "A write transaction is already open"),
            DocumentError::Encoding(e) => write!(f, "Encoding error: {e}"),
        }
    }
}

impl std::error::Error for DocumentError {}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for DocumentError {
    fn from(e: serde_json::Error) -> Self {
        DocumentError::Encoding(e.to_string())
    }
}

/// What the deep observer saw for one key before existence is settled.
#[derive(Debug, Default)]
struct RawEntry {
    touched_root: bool,
    fields: BTreeSet<String>,
}

#[derive(Debug)]
struct RawChange {
    origin: Option<DocOrigin>,
    entries: BTreeMap<ElementId, RawEntry>,
}

/// Shared document handle used by one client or one room.
pub struct SharedDocument {
    doc: Doc,
    elements: MapRef,
    pending: Arc<Mutex<Vec<RawChange>>>,
    subscribers: Vec<mpsc::Sender<DocumentChange>>,
    outbound: VecDeque<Vec<u8>>,
    _subscription: Subscription,
}

impl SharedDocument {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let elements = doc.get_or_insert_map(ELEMENTS_MAP);
        let pending: Arc<Mutex<Vec<RawChange>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = pending.clone();
        let subscription = elements.observe_deep(move |txn, events| {
            let origin = txn.origin().and_then(|o| DocOrigin::from_tag(o.as_ref()));
            let mut entries: BTreeMap<ElementId, RawEntry> = BTreeMap::new();

            for event in events.iter() {
                let Event::Map(map_event) = event else { continue };
                let path = map_event.path();
                match path.front() {
                    None => {
                        for key in map_event.keys(txn).keys() {
                            entries.entry(key.to_string()).or_default().touched_root = true;
                        }
                    }
                    Some(PathSegment::Key(id)) => {
                        let entry = entries.entry(id.to_string()).or_default();
                        for (key, change) in map_event.keys(txn) {
                            if let MapEntryChange::Updated(old, new) = change {
                                if old == new {
                                    continue;
                                }
                            }
                            entry.fields.insert(key.to_string());
                        }
                    }
                    Some(_) => {}
                }
            }

            if entries.is_empty() {
                return;
            }
            let mut guard = match sink.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.push(RawChange { origin, entries });
        });

        Self {
            doc,
            elements,
            pending,
            subscribers: Vec::new(),
            outbound: VecDeque::new(),
            _subscription: subscription,
        }
    }

    /// Rebuild a document from an encoded full state.
    pub fn from_state(state: &[u8]) -> Result<Self, DocumentError> {
        let mut document = Self::new();
        document.apply_update(state, DocOrigin::Remote)?;
        Ok(document)
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Subscribe to committed changes.
    ///
    /// Each committed transaction yields one [`DocumentChange`] carrying
    /// the added, updated (with field names) and removed entry ids.
    pub fn observe(&mut self) -> mpsc::Receiver<DocumentChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    /// Run `f` inside one write transaction tagged with `origin`.
    ///
    /// Writes made before `f` returns an error are still committed: the
    /// CRDT has no rollback.
    pub fn transact<F, R>(&mut self, origin: DocOrigin, f: F) -> Result<R, DocumentError>
    where
        F: FnOnce(&mut DocTxn<'_>) -> Result<R, DocumentError>,
    {
        let (result, update) = {
            let txn = self
                .doc
                .try_transact_mut_with(origin.tag())
                .map_err(|_| DocumentError::TransactionBusy)?;
            let mut handle = DocTxn { txn, elements: &self.elements, writes: 0 };
            let result = f(&mut handle);
            let update = (handle.writes > 0 && origin.is_local_class())
                .then(|| handle.txn.encode_update_v1());
            (result, update)
        };

        if let Some(update) = update {
            self.outbound.push_back(update);
        }
        self.dispatch();
        result
    }

    pub fn get(&self, id: &str) -> Option<DiagramElement> {
        let txn = self.doc.transact();
        read_entry(&txn, &self.elements, id)
    }

    pub fn contains(&self, id: &str) -> bool {
        let txn = self.doc.transact();
        self.elements.contains_key(&txn, id)
    }

    /// Element ids in ascending order.
    pub fn ids(&self) -> Vec<ElementId> {
        let txn = self.doc.transact();
        let mut ids: Vec<ElementId> = self.elements.keys(&txn).map(|k| k.to_string()).collect();
        ids.sort();
        ids
    }

    pub fn elements(&self) -> Vec<DiagramElement> {
        let txn = self.doc.transact();
        let ids: Vec<String> = self.elements.keys(&txn).map(|k| k.to_string()).collect();
        ids.iter()
            .filter_map(|id| read_entry(&txn, &self.elements, id))
            .collect()
    }

    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.elements.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set(&mut self, origin: DocOrigin, element: &DiagramElement) -> Result<usize, DocumentError> {
        self.transact(origin, |txn| txn.set(element))
    }

    pub fn delete(&mut self, origin: DocOrigin, id: &str) -> Result<bool, DocumentError> {
        self.transact(origin, |txn| Ok(txn.delete(id)))
    }

    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this document has that the peer with `state_vector` lacks.
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let remote_sv = StateVector::decode_v1(state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote_sv))
    }

    pub fn apply_update(&mut self, update: &[u8], origin: DocOrigin) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update)?;
        {
            let mut txn = self
                .doc
                .try_transact_mut_with(origin.tag())
                .map_err(|_| DocumentError::TransactionBusy)?;
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))?;
        }
        self.dispatch();
        Ok(())
    }

    /// Incremental updates produced by local-class transactions, oldest first.
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        self.outbound.drain(..).collect()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.len()
    }

    /// Forward observer output to subscribers, settling each touched id
    /// into added/updated/removed against the committed state.
    fn dispatch(&mut self) {
        let raw = {
            let mut guard = match self.pending.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *guard)
        };
        if raw.is_empty() {
            return;
        }

        let txn = self.doc.transact();
        for batch in raw {
            let entries: Vec<EntryChange> = batch
                .entries
                .into_iter()
                .map(|(id, seen)| {
                    let exists = self.elements.contains_key(&txn, &id);
                    let kind = if !exists {
                        EntryChangeKind::Removed
                    } else if seen.touched_root {
                        EntryChangeKind::Added
                    } else {
                        EntryChangeKind::Updated { fields: seen.fields }
                    };
                    EntryChange { id, kind }
                })
                .collect();

            let change = DocumentChange { origin: batch.origin, entries };
            log::trace!(
                "document change from {:?}: {} entries",
                change.origin,
                change.entries.len()
            );
            self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
        }
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Write access to the element map inside one transaction.
pub struct DocTxn<'a> {
    txn: TransactionMut<'a>,
    elements: &'a MapRef,
    writes: usize,
}

impl DocTxn<'_> {
    pub fn contains(&self, id: &str) -> bool {
        self.elements.contains_key(&self.txn, id)
    }

    pub fn get(&self, id: &str) -> Option<DiagramElement> {
        read_entry(&self.txn, self.elements, id)
    }

    pub fn ids(&self) -> Vec<ElementId> {
        self.elements.keys(&self.txn).map(|k| k.to_string()).collect()
    }

    /// Insert or update an element. Only differing fields are written.
    pub fn set(&mut self, element: &DiagramElement) -> Result<usize, DocumentError> {
        self.write(element, |_| true)
    }

    /// Update only the fields in `groups`. Missing entries are inserted whole.
    pub fn set_groups(
        &mut self,
        element: &DiagramElement,
        groups: &BTreeSet<FieldGroup>,
    ) -> Result<usize, DocumentError> {
        self.write(element, |key| field_group(key).is_some_and(|g| groups.contains(&g)))
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let removed = self.elements.remove(&mut self.txn, id).is_some();
        if removed {
            self.writes += 1;
        }
        removed
    }

    /// Number of field writes and deletions so far.
    pub fn writes(&self) -> usize {
        self.writes
    }

    fn write(
        &mut self,
        element: &DiagramElement,
        include: impl Fn(&str) -> bool,
    ) -> Result<usize, DocumentError> {
        let desired = entry_fields(element)?;

        let existing = match self.elements.get(&self.txn, &element.id) {
            Some(Out::YMap(entry)) => Some(entry),
            _ => None,
        };

        let Some(entry) = existing else {
            let entry: MapRef =
                self.elements
                    .insert(&mut self.txn, element.id.as_str(), MapPrelim::default());
            let count = desired.len();
            for (key, value) in desired {
                entry.insert(&mut self.txn, key, value);
            }
            self.writes += count;
            return Ok(count);
        };

        let current: BTreeMap<String, Any> = entry
            .iter(&self.txn)
            .filter_map(|(key, value)| match value {
                Out::Any(any) => Some((key.to_string(), any)),
                _ => None,
            })
            .collect();

        let mut written = 0;
        for (key, value) in &desired {
            if key == KIND || !include(key) {
                continue;
            }
            if current.get(key) != Some(value) {
                entry.insert(&mut self.txn, key.clone(), value.clone());
                written += 1;
            }
        }
        for key in current.keys() {
            if key != KIND && include(key) && !desired.contains_key(key) {
                entry.remove(&mut self.txn, key);
                written += 1;
            }
        }
        self.writes += written;
        Ok(written)
    }
}

fn read_entry<T: ReadTxn>(txn: &T, elements: &MapRef, id: &str) -> Option<DiagramElement> {
    let Some(Out::YMap(entry)) = elements.get(txn, id) else {
        return None;
    };
    let fields: BTreeMap<String, Any> = entry
        .iter(txn)
        .filter_map(|(key, value)| match value {
            Out::Any(any) => Some((key.to_string(), any)),
            _ => None,
        })
        .collect();
    element_from_fields(id, &fields)
}

fn entry_fields(element: &DiagramElement) -> Result<BTreeMap<String, Any>, DocumentError> {
    let mut fields = BTreeMap::new();
    fields.insert(KIND.to_string(), Any::from(element.kind.as_str().to_string()));
    if let Some(b) = element.bounds {
        fields.insert(X.to_string(), Any::from(b.x));
        fields.insert(Y.to_string(), Any::from(b.y));
        fields.insert(WIDTH.to_string(), Any::from(b.width));
        fields.insert(HEIGHT.to_string(), Any::from(b.height));
    }
    if let Some(parent) = &element.parent {
        fields.insert(PARENT.to_string(), Any::from(parent.clone()));
    }
    fields.insert(NAME.to_string(), Any::from(element.payload.name.clone()));
    for (key, value) in &element.payload.extensions {
        fields.insert(format!("{EXT_PREFIX}{key}"), scalar_to_any(value));
    }
    if let Some(source) = &element.source {
        fields.insert(SOURCE.to_string(), Any::from(source.clone()));
    }
    if let Some(target) = &element.target {
        fields.insert(TARGET.to_string(), Any::from(target.clone()));
    }
    if !element.waypoints.is_empty() {
        let encoded = serde_json::to_string(&element.waypoints)?;
        fields.insert(WAYPOINTS.to_string(), Any::from(encoded));
    }
    Ok(fields)
}

fn element_from_fields(id: &str, fields: &BTreeMap<String, Any>) -> Option<DiagramElement> {
    let kind = ElementKind::parse(&as_string(fields.get(KIND)?)?)?;
    let number = |key: &str| fields.get(key).and_then(as_number);
    let string = |key: &str| fields.get(key).and_then(as_string);

    let bounds = match (number(X), number(Y), number(WIDTH), number(HEIGHT)) {
        (Some(x), Some(y), Some(w), Some(h)) => Some(Bounds::new(x, y, w, h)),
        _ => None,
    };

    let extensions = fields
        .iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(EXT_PREFIX)?;
            Some((name.to_string(), any_to_scalar(value)?))
        })
        .collect();

    let waypoints: Vec<Point> = string(WAYPOINTS)
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    Some(DiagramElement {
        id: id.to_string(),
        kind,
        bounds,
        parent: string(PARENT),
        payload: Payload {
            name: string(NAME).unwrap_or_default(),
            extensions,
        },
        source: string(SOURCE),
        target: string(TARGET),
        waypoints,
    })
}

fn as_string(any: &Any) -> Option<String> {
    match any {
        Any::String(s) => Some(s.to_string()),
        _ => None,
    }
}

fn as_number(any: &Any) -> Option<f64> {
    match any {
        Any::Number(n) => Some(*n),
        Any::BigInt(n) => Some(*n as f64),
        _ => None,
    }
}

fn scalar_to_any(value: &Scalar) -> Any {
    match value {
        Scalar::Bool(b) => Any::from(*b),
        Scalar::Number(n) => Any::from(*n),
        Scalar::Text(s) => Any::from(s.clone()),
    }
}

fn any_to_scalar(any: &Any) -> Option<Scalar> {
    match any {
        Any::Bool(b) => Some(Scalar::Bool(*b)),
        Any::Number(n) => Some(Scalar::Number(*n)),
        Any::BigInt(n) => Some(Scalar::Number(*n as f64)),
        Any::String(s) => Some(Scalar::Text(s.to_string())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, x: f64, y: f64) -> DiagramElement {
        DiagramElement::shape(id, Some(Bounds::new(x, y, 100.0, 80.0)))
            .with_name("Review")
            .with_extension("assignee", "kim")
    }

    #[test]
    fn test_set_and_get_roundtrip_fields() {
        let mut doc = SharedDocument::new();
        let flow = DiagramElement::connection(
            "Flow_1",
            "A",
            "B",
            vec![Point::new(1.0, 2.0), Point::new(3.0, 4.0)],
        )
        .with_parent("Process");
        doc.set(DocOrigin::Local, &task("A", 10.0, 20.0)).unwrap();
        doc.set(DocOrigin::Local, &flow).unwrap();

        assert_eq!(doc.get("A"), Some(task("A", 10.0, 20.0)));
        assert_eq!(doc.get("Flow_1"), Some(flow));
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn test_unchanged_set_writes_nothing() {
        let mut doc = SharedDocument::new();
        doc.set(DocOrigin::Local, &task("A", 10.0, 20.0)).unwrap();
        assert_eq!(doc.take_outbound().len(), 1);

        let written = doc.set(DocOrigin::Local, &task("A", 10.0, 20.0)).unwrap();
        assert_eq!(written, 0);
        assert!(doc.take_outbound().is_empty());
    }

    #[test]
    fn test_remote_origin_produces_no_outbound() {
        let mut a = SharedDocument::new();
        a.set(DocOrigin::Local, &task("A", 0.0, 0.0)).unwrap();
        let update = a.take_outbound().remove(0);

        let mut b = SharedDocument::new();
        b.apply_update(&update, DocOrigin::Remote).unwrap();
        assert!(b.take_outbound().is_empty());
        assert_eq!(b.get("A"), a.get("A"));
    }

    #[test]
    fn test_observe_reports_origin_and_fields() {
        let mut doc = SharedDocument::new();
        let rx = doc.observe();

        doc.set(DocOrigin::Local, &task("A", 0.0, 0.0)).unwrap();
        let change = rx.try_recv().unwrap();
        assert_eq!(change.origin, Some(DocOrigin::Local));
        assert!(change.is_local_class());
        assert_eq!(change.entries[0].kind, EntryChangeKind::Added);

        let moved = task("A", 50.0, 0.0);
        doc.set(DocOrigin::Resync, &moved).unwrap();
        let change = rx.try_recv().unwrap();
        match &change.entries[0].kind {
            EntryChangeKind::Updated { fields } => {
                assert_eq!(fields.iter().collect::<Vec<_>>(), vec!["x"]);
            }
            other => panic!("expected update, got {other:?}"),
        }

        doc.delete(DocOrigin::Local, "A").unwrap();
        let change = rx.try_recv().unwrap();
        assert_eq!(change.entries[0].kind, EntryChangeKind::Removed);
    }

    #[test]
    fn test_remote_change_is_not_local_class() {
        let mut a = SharedDocument::new();
        a.set(DocOrigin::Local, &task("A", 0.0, 0.0)).unwrap();
        let update = a.encode_state_as_update();

        let mut b = SharedDocument::new();
        let rx = b.observe();
        b.apply_update(&update, DocOrigin::Remote).unwrap();
        let change = rx.try_recv().unwrap();
        assert_eq!(change.origin, Some(DocOrigin::Remote));
        assert!(!change.is_local_class());
    }

    #[test]
    fn test_set_groups_limits_fields() {
        let mut doc = SharedDocument::new();
        doc.set(DocOrigin::Local, &task("A", 0.0, 0.0)).unwrap();

        let mut edited = task("A", 30.0, 0.0).with_name("Approve");
        edited.payload.extensions.clear();
        let groups = [FieldGroup::Geometry].into_iter().collect();
        let written = doc
            .transact(DocOrigin::Local, |txn| txn.set_groups(&edited, &groups))
            .unwrap();
        assert_eq!(written, 1);

        let stored = doc.get("A").unwrap();
        assert_eq!(stored.bounds.unwrap().x, 30.0);
        assert_eq!(stored.payload.name, "Review");
        assert!(stored.payload.extensions.contains_key("assignee"));
    }

    #[test]
    fn test_concurrent_field_edits_merge() {
        let mut a = SharedDocument::with_client_id(1);
        a.set(DocOrigin::Local, &task("A", 0.0, 0.0)).unwrap();
        let mut b = SharedDocument::with_client_id(2);
        b.apply_update(&a.encode_state_as_update(), DocOrigin::Remote).unwrap();
        a.take_outbound();

        a.set(DocOrigin::Local, &task("A", 40.0, 0.0)).unwrap();
        b.set(DocOrigin::Local, &task("A", 0.0, 0.0).with_name("Approve")).unwrap();

        for update in a.take_outbound() {
            b.apply_update(&update, DocOrigin::Remote).unwrap();
        }
        for update in b.take_outbound() {
            a.apply_update(&update, DocOrigin::Remote).unwrap();
        }

        let merged = a.get("A").unwrap();
        assert_eq!(merged, b.get("A").unwrap());
        assert_eq!(merged.bounds.unwrap().x, 40.0);
        assert_eq!(merged.payload.name, "Approve");
    }

    #[test]
    fn test_diff_bootstrap() {
        let mut a = SharedDocument::new();
        a.set(DocOrigin::Local, &task("A", 0.0, 0.0)).unwrap();
        let b = SharedDocument::new();

        let diff = a.encode_diff(&b.encode_state_vector()).unwrap();
        let mut b = b;
        b.apply_update(&diff, DocOrigin::Remote).unwrap();
        assert_eq!(a.encode_state_vector(), b.encode_state_vector());
    }

    #[test]
    fn test_malformed_update_rejected() {
        let mut doc = SharedDocument::new();
        let err = doc.apply_update(&[0xff, 0xff, 0xff], DocOrigin::Remote).unwrap_err();
        assert!(matches!(err, DocumentError::Decode(_) | DocumentError::Apply(_)));
    }

    #[test]
    fn test_field_group_mapping() {
        assert_eq!(field_group("x"), Some(FieldGroup::Geometry));
        assert_eq!(field_group("ext:priority"), Some(FieldGroup::Payload));
        assert_eq!(field_group("source"), Some(FieldGroup::Endpoints));
        assert_eq!(field_group("kind"), None);
    }
}
