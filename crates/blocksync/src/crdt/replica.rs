//! Replica: one peer's document plus its operation log and state vectors.
//!
//! All mutation happens inside one [`Transaction`] boundary per outbound
//! update, so a diff is always computed against one consistent base. Merging
//! is causally idempotent: operations already covered by the local state
//! vector are skipped, never re-applied.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::doc::{
    Alignment, Block, BlockAttrs, BlockContent, BlockId, BlockTag, CharacterRun, Document,
    RunToken,
};
use crate::error::{Result, SyncError};

use super::{fields, BlockPart, Op, OpBody, OpId, Parent, PeerId, StateVector, Value};

/// A decoded set of operations — the unit the codec encodes and the replica
/// merges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub ops: Vec<Op>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Identity of one ordered sequence inside the replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SeqKey {
    Order,
    Children(BlockId),
    Run(BlockId),
}

/// One peer's view of a shared document.
pub struct Replica {
    peer: PeerId,
    doc: Document,
    log: Vec<Op>,
    vector: StateVector,
    /// Op id of every element of every live sequence, aligned index-for-index
    /// with the sequence itself. Needed to resolve insertion origins.
    seq_ids: HashMap<SeqKey, Vec<OpId>>,
}

impl Replica {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            doc: Document::new(),
            log: Vec::new(),
            vector: StateVector::new(),
            seq_ids: HashMap::new(),
        }
    }

    /// Build a replica whose log recreates an existing document, block ids
    /// preserved, so the content can be diffed against any peer state.
    pub fn load(peer: PeerId, source: &Document) -> Self {
        let mut replica = Self::new(peer);
        replica.transact(|tx| import_document(tx, source));
        replica
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.vector
    }

    /// Run one transaction. Every mutation inside records operations under
    /// the local peer's clock.
    pub fn transact<R>(&mut self, f: impl FnOnce(&mut Transaction<'_>) -> R) -> R {
        let mut tx = Transaction { replica: self };
        f(&mut tx)
    }

    /// Operations not yet reflected in `since`.
    pub fn diff(&self, since: &StateVector) -> Update {
        Update {
            ops: self
                .log
                .iter()
                .filter(|op| !since.contains(op.id))
                .cloned()
                .collect(),
        }
    }

    /// Merge a decoded update. Returns the number of operations applied;
    /// operations already covered by the state vector are skipped, and a
    /// malformed operation is skipped with a warning rather than aborting
    /// the rest of the merge.
    pub fn apply(&mut self, update: &Update) -> usize {
        let mut ops: Vec<&Op> = update.ops.iter().collect();
        ops.sort_by_key(|op| op.id);

        let mut applied = 0;
        for op in ops {
            if self.vector.contains(op.id) {
                debug!(peer = op.id.peer, clock = op.id.clock, "skipping covered op");
                continue;
            }
            match self.apply_op(op) {
                Ok(()) => applied += 1,
                Err(e) => warn!(
                    peer = op.id.peer,
                    clock = op.id.clock,
                    "skipping unresolvable op: {}",
                    e
                ),
            }
            self.vector.observe(op.id);
            self.log.push(op.clone());
        }
        applied
    }

    fn apply_op(&mut self, op: &Op) -> Result<()> {
        match &op.body {
            OpBody::SetField { key, value } => {
                let Parent::Block {
                    block,
                    part: BlockPart::Fields,
                } = &op.parent
                else {
                    return Err(SyncError::DecodeError(
                        "field op without a field parent".into(),
                    ));
                };
                self.ensure_block(block);
                let b = self
                    .doc
                    .block_mut(block)
                    .ok_or_else(|| SyncError::DecodeError(format!("block {} missing", block)))?;
                apply_field(b, key, value);
                Ok(())
            }
            OpBody::InsertBlock { origin, block } => {
                self.ensure_block(block);
                match &op.parent {
                    Parent::Root => {
                        let ids = self.seq_ids.entry(SeqKey::Order).or_default();
                        let idx = integrate(ids, *origin, op.id);
                        self.doc.push_order(block.clone(), idx);
                        Ok(())
                    }
                    Parent::Block {
                        block: parent_id,
                        part: BlockPart::Children,
                    } => {
                        self.ensure_block(parent_id);
                        let ids = self
                            .seq_ids
                            .entry(SeqKey::Children(parent_id.clone()))
                            .or_default();
                        let idx = integrate(ids, *origin, op.id);
                        let parent_block = self.doc.block_mut(parent_id).ok_or_else(|| {
                            SyncError::DecodeError(format!("block {} missing", parent_id))
                        })?;
                        // Child may arrive before the parent's tag op.
                        if matches!(&parent_block.content, BlockContent::Run(run) if run.is_empty())
                        {
                            parent_block.content = BlockContent::Children(Vec::new());
                        }
                        match &mut parent_block.content {
                            BlockContent::Children(kids) => {
                                let idx = idx.min(kids.len());
                                kids.insert(idx, block.clone());
                                Ok(())
                            }
                            BlockContent::Run(_) => Err(SyncError::DecodeError(format!(
                                "block {} is not a container",
                                parent_id
                            ))),
                        }
                    }
                    Parent::Block { .. } => Err(SyncError::DecodeError(
                        "block inserted into a non-sequence parent".into(),
                    )),
                }
            }
            OpBody::InsertToken { origin, token } => {
                let Parent::Block {
                    block,
                    part: BlockPart::Run,
                } = &op.parent
                else {
                    return Err(SyncError::DecodeError(
                        "token op without a run parent".into(),
                    ));
                };
                self.ensure_block(block);
                let ids = self.seq_ids.entry(SeqKey::Run(block.clone())).or_default();
                let idx = integrate(ids, *origin, op.id);
                let b = self
                    .doc
                    .block_mut(block)
                    .ok_or_else(|| SyncError::DecodeError(format!("block {} missing", block)))?;
                match &mut b.content {
                    BlockContent::Run(run) => {
                        run.insert_token(idx, token.clone());
                        Ok(())
                    }
                    BlockContent::Children(_) => Err(SyncError::DecodeError(format!(
                        "container block {} has no character run",
                        block
                    ))),
                }
            }
            OpBody::ClearList => match &op.parent {
                Parent::Root => {
                    self.doc.clear();
                    self.seq_ids.clear();
                    Ok(())
                }
                Parent::Block {
                    block,
                    part: BlockPart::Children,
                } => {
                    self.seq_ids.remove(&SeqKey::Children(block.clone()));
                    if let Some(b) = self.doc.block_mut(block) {
                        if let BlockContent::Children(kids) = &mut b.content {
                            kids.clear();
                        }
                    }
                    Ok(())
                }
                Parent::Block { .. } => {
                    Err(SyncError::DecodeError("clear of a non-sequence parent".into()))
                }
            },
        }
    }

    /// Materialize a placeholder so operations referencing a block never
    /// dangle, whatever order they arrived in.
    fn ensure_block(&mut self, id: &str) {
        if !self.doc.contains(id) {
            debug!(block = id, "materializing block ahead of its field ops");
            self.doc.insert_block(Block::new(
                id.to_string(),
                BlockTag::Paragraph,
                BlockAttrs::default(),
            ));
        }
    }

    fn record(&mut self, parent: Parent, body: OpBody) -> OpId {
        let id = OpId::new(self.peer, self.vector.get(self.peer));
        self.vector.observe(id);
        self.log.push(Op { id, parent, body });
        id
    }

    fn seq_tail(&self, key: &SeqKey) -> Option<OpId> {
        self.seq_ids.get(key).and_then(|ids| ids.last().copied())
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("peer", &self.peer)
            .field("vector", &self.vector)
            .field("log_len", &self.log.len())
            .finish()
    }
}

/// Set one scalar field from a map-entry op. Unknown keys and mismatched
/// value types are ignored so foreign producers cannot poison a merge.
fn apply_field(block: &mut Block, key: &str, value: &Value) {
    match (key, value) {
        (fields::TAG, Value::Str(raw)) => {
            let mut tag = BlockTag::from_raw(raw);
            // Keep a subtype that arrived before the tag itself.
            if let (BlockTag::Foreign(new_sub), BlockTag::Foreign(Some(old))) = (&mut tag, &block.tag)
            {
                if new_sub.is_none() {
                    *new_sub = Some(old.clone());
                }
            }
            block.tag = tag;
            if block.tag.is_container() {
                if let BlockContent::Run(run) = &block.content {
                    if run.is_empty() {
                        block.content = BlockContent::Children(Vec::new());
                    }
                }
            } else if let BlockContent::Children(kids) = &block.content {
                if kids.is_empty() {
                    block.content = BlockContent::Run(CharacterRun::new());
                }
            }
        }
        (fields::SUBTYPE, Value::Str(sub)) => {
            if let BlockTag::Foreign(slot) = &mut block.tag {
                *slot = Some(sub.clone());
            } else {
                block.tag = BlockTag::Foreign(Some(sub.clone()));
            }
        }
        (fields::INDENT, Value::UInt(v)) => {
            block.indent = u32::try_from(*v).unwrap_or(u32::MAX);
        }
        (fields::ALIGN, Value::Str(raw)) => {
            block.alignment = Alignment::from_raw(raw);
        }
        (fields::COLOR, Value::Str(color)) => {
            block.color = Some(color.clone());
        }
        (key, _) => debug!(key, "ignoring unrecognized field entry"),
    }
}

/// Find the integration index for an insertion: directly after its origin,
/// skipping over concurrent siblings with a greater op id so every replica
/// lands on the same order. A missing origin appends at the end.
fn integrate(ids: &mut Vec<OpId>, origin: Option<OpId>, new_id: OpId) -> usize {
    let mut idx = match origin {
        Some(origin) => match ids.iter().position(|&id| id == origin) {
            Some(pos) => pos + 1,
            None => ids.len(),
        },
        None => 0,
    };
    while idx < ids.len() && ids[idx] > new_id {
        idx += 1;
    }
    ids.insert(idx, new_id);
    idx
}

/// Single-transaction mutation handle.
pub struct Transaction<'a> {
    replica: &'a mut Replica,
}

impl Transaction<'_> {
    /// Create a block and append it to the top-level order list.
    pub fn append_block(&mut self, tag: BlockTag, attrs: BlockAttrs) -> BlockId {
        let id = self.replica.doc.append_block(tag.clone(), attrs.clone());
        self.record_block_fields(&id, &tag, &attrs);
        self.record_insert(SeqKey::Order, Parent::Root, id.clone());
        id
    }

    /// Create a block and append it to a container block's child list.
    pub fn append_child(
        &mut self,
        parent: &str,
        tag: BlockTag,
        attrs: BlockAttrs,
    ) -> Result<BlockId> {
        let id = self
            .replica
            .doc
            .append_child(parent, tag.clone(), attrs.clone())?;
        self.record_block_fields(&id, &tag, &attrs);
        self.record_insert(
            SeqKey::Children(parent.to_string()),
            Parent::block(parent, BlockPart::Children),
            id.clone(),
        );
        Ok(id)
    }

    /// Append one token to a leaf block's character run.
    pub fn append_token(&mut self, block: &str, token: RunToken) -> Result<()> {
        let b = self
            .replica
            .doc
            .block_mut(block)
            .ok_or_else(|| SyncError::ApplicationError(format!("block {} not found", block)))?;
        match &mut b.content {
            BlockContent::Run(run) => run.push_token(token.clone()),
            BlockContent::Children(_) => {
                return Err(SyncError::ApplicationError(format!(
                    "container block {} has no character run",
                    block
                )))
            }
        }
        let key = SeqKey::Run(block.to_string());
        let origin = self.replica.seq_tail(&key);
        let op_id = self.replica.record(
            Parent::block(block, BlockPart::Run),
            OpBody::InsertToken { origin, token },
        );
        self.replica.seq_ids.entry(key).or_default().push(op_id);
        Ok(())
    }

    /// Append literal text to a leaf block.
    pub fn append_text(&mut self, block: &str, text: &str) -> Result<()> {
        for c in text.chars() {
            self.append_token(block, RunToken::Char(c))?;
        }
        Ok(())
    }

    /// Append every token of a prepared run.
    pub fn append_run(&mut self, block: &str, run: &CharacterRun) -> Result<()> {
        for token in run.tokens() {
            self.append_token(block, token.clone())?;
        }
        Ok(())
    }

    pub fn set_indent(&mut self, block: &str, indent: u32) -> Result<()> {
        let b = self.block_mut(block)?;
        b.indent = indent;
        self.replica.record(
            Parent::block(block, BlockPart::Fields),
            OpBody::SetField {
                key: fields::INDENT.into(),
                value: Value::UInt(indent as u64),
            },
        );
        Ok(())
    }

    pub fn set_alignment(&mut self, block: &str, alignment: Alignment) -> Result<()> {
        let b = self.block_mut(block)?;
        b.alignment = alignment;
        self.replica.record(
            Parent::block(block, BlockPart::Fields),
            OpBody::SetField {
                key: fields::ALIGN.into(),
                value: Value::Str(alignment.as_str().into()),
            },
        );
        Ok(())
    }

    pub fn set_color(&mut self, block: &str, color: &str) -> Result<()> {
        let b = self.block_mut(block)?;
        b.color = Some(color.to_string());
        self.replica.record(
            Parent::block(block, BlockPart::Fields),
            OpBody::SetField {
                key: fields::COLOR.into(),
                value: Value::Str(color.into()),
            },
        );
        Ok(())
    }

    /// Empty the document atomically — "replace" semantics. The clear is
    /// wire-visible so the peer drops its copy of the old content too.
    pub fn clear(&mut self) {
        self.replica.doc.clear();
        self.replica.seq_ids.clear();
        self.replica.record(Parent::Root, OpBody::ClearList);
    }

    /// Insert a copy of an existing block, preserving its id. Children are
    /// not copied; adopt them separately (see [`import_document`]).
    pub fn adopt_block(&mut self, block: &Block, parent: Option<&str>) -> Result<()> {
        if self.replica.doc.contains(&block.id) {
            return Err(SyncError::ApplicationError(format!(
                "block id {} already present",
                block.id
            )));
        }
        let attrs = BlockAttrs {
            indent: block.indent,
            alignment: block.alignment,
            color: block.color.clone(),
        };
        let fresh = Block::new(block.id.clone(), block.tag.clone(), attrs.clone());
        match parent {
            None => {
                self.replica.doc.insert_block(fresh);
                let at = self.replica.doc.order().len();
                self.replica.doc.push_order(block.id.clone(), at);
                self.record_block_fields(&block.id, &block.tag, &attrs);
                self.record_insert(SeqKey::Order, Parent::Root, block.id.clone());
            }
            Some(parent_id) => {
                let parent_block = self.replica.doc.block_mut(parent_id).ok_or_else(|| {
                    SyncError::ApplicationError(format!("parent block {} not found", parent_id))
                })?;
                match &mut parent_block.content {
                    BlockContent::Children(kids) => kids.push(block.id.clone()),
                    BlockContent::Run(_) => {
                        return Err(SyncError::ApplicationError(format!(
                            "block {} is not a container",
                            parent_id
                        )))
                    }
                }
                self.replica.doc.insert_block(fresh);
                self.record_block_fields(&block.id, &block.tag, &attrs);
                self.record_insert(
                    SeqKey::Children(parent_id.to_string()),
                    Parent::block(parent_id, BlockPart::Children),
                    block.id.clone(),
                );
            }
        }
        if let Some(run) = block.run() {
            for token in run.tokens() {
                self.append_token(&block.id, token.clone())?;
            }
        }
        Ok(())
    }

    fn block_mut(&mut self, block: &str) -> Result<&mut Block> {
        self.replica
            .doc
            .block_mut(block)
            .ok_or_else(|| SyncError::ApplicationError(format!("block {} not found", block)))
    }

    fn record_block_fields(&mut self, id: &str, tag: &BlockTag, attrs: &BlockAttrs) {
        let parent = Parent::block(id, BlockPart::Fields);
        self.replica.record(
            parent.clone(),
            OpBody::SetField {
                key: fields::TAG.into(),
                value: Value::Str(tag.as_str().into()),
            },
        );
        if let BlockTag::Foreign(Some(subtype)) = tag {
            self.replica.record(
                parent.clone(),
                OpBody::SetField {
                    key: fields::SUBTYPE.into(),
                    value: Value::Str(subtype.clone()),
                },
            );
        }
        if attrs.indent > 0 {
            self.replica.record(
                parent.clone(),
                OpBody::SetField {
                    key: fields::INDENT.into(),
                    value: Value::UInt(attrs.indent as u64),
                },
            );
        }
        if attrs.alignment != Alignment::Left {
            self.replica.record(
                parent.clone(),
                OpBody::SetField {
                    key: fields::ALIGN.into(),
                    value: Value::Str(attrs.alignment.as_str().into()),
                },
            );
        }
        if let Some(color) = &attrs.color {
            self.replica.record(
                parent,
                OpBody::SetField {
                    key: fields::COLOR.into(),
                    value: Value::Str(color.clone()),
                },
            );
        }
    }

    fn record_insert(&mut self, key: SeqKey, parent: Parent, block: BlockId) {
        let origin = self.replica.seq_tail(&key);
        let op_id = self
            .replica
            .record(parent, OpBody::InsertBlock { origin, block });
        self.replica.seq_ids.entry(key).or_default().push(op_id);
    }
}

/// Re-emit an existing document's content through a transaction, preserving
/// block ids and nesting.
pub fn import_document(tx: &mut Transaction<'_>, source: &Document) {
    for id in source.order() {
        import_block(tx, source, id, None);
    }
}

fn import_block(tx: &mut Transaction<'_>, source: &Document, id: &str, parent: Option<&str>) {
    let Some(block) = source.block(id) else {
        warn!(block = id, "order list references a missing block");
        return;
    };
    if let Err(e) = tx.adopt_block(block, parent) {
        warn!(block = id, "skipping block during import: {}", e);
        return;
    }
    if let Some(children) = block.children() {
        for child in children {
            import_block(tx, source, child, Some(id));
        }
    }
}
