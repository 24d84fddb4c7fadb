use std::collections::HashMap;

use mutq_core::{Category, CoreError, EntityRef, OpId, Operation, OperationKind};

use crate::error::EngineError;

type Slot = (EntityRef, Category);

/// The ordered, de-duplicated set of pending operations.
///
/// Every mutator returns a new log and leaves `self` untouched, so a snapshot
/// handed out earlier never changes underneath its holder. Position in the
/// log is display order and submission order.
#[derive(Debug, Clone, Default)]
pub struct OperationLog {
    ops: Vec<Operation>,
    slots: HashMap<Slot, usize>,
}

impl PartialEq for OperationLog {
    fn eq(&self, other: &Self) -> bool {
        self.ops == other.ops
    }
}

impl Eq for OperationLog {}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn from_ops(ops: Vec<Operation>) -> Self {
        let mut slots = HashMap::with_capacity(ops.len());
        for (position, op) in ops.iter().enumerate() {
            let previous = slots.insert(op.slot(), position);
            debug_assert!(previous.is_none(), "two pending operations share {:?}", op.slot());
        }
        Self { ops, slots }
    }

    /// Insert `op`, replacing in place any operation holding the same slot.
    pub fn append(&self, op: Operation) -> Self {
        let mut ops = self.ops.clone();
        match self.slots.get(&op.slot()) {
            Some(&position) => ops[position] = op,
            None => ops.push(op),
        }
        Self::from_ops(ops)
    }

    /// Swap the operation at `position` for `op`. `op` must keep the slot.
    pub(crate) fn replace_at(&self, position: usize, op: Operation) -> Self {
        debug_assert_eq!(self.ops[position].slot(), op.slot());
        let mut ops = self.ops.clone();
        ops[position] = op;
        Self::from_ops(ops)
    }

    /// Strip every operation whose target is `entity` or nested under it.
    pub fn remove_by_entity(&self, entity: &EntityRef) -> Self {
        self.filtered(|op| !op.target().is_within(entity))
    }

    pub fn without(&self, op_id: OpId) -> Self {
        self.filtered(|op| op.op_id() != op_id)
    }

    /// Drop the operations the remote side reported as applied.
    pub fn retain_unapplied(&self, applied: &[OpId]) -> Self {
        self.filtered(|op| !applied.contains(&op.op_id()))
    }

    fn filtered(&self, keep: impl Fn(&Operation) -> bool) -> Self {
        Self::from_ops(self.ops.iter().filter(|op| keep(op)).cloned().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn get(&self, op_id: OpId) -> Option<&Operation> {
        self.ops.iter().find(|op| op.op_id() == op_id)
    }

    pub fn position(&self, op_id: OpId) -> Option<usize> {
        self.ops.iter().position(|op| op.op_id() == op_id)
    }

    /// The pending operation holding `(entity, category)`, with its position.
    pub fn find_slot(&self, entity: &EntityRef, category: Category) -> Option<(usize, &Operation)> {
        let position = *self.slots.get(&(entity.clone(), category))?;
        Some((position, &self.ops[position]))
    }

    /// Operations targeting `entity` or anything nested under it.
    pub fn pending_for(&self, entity: &EntityRef) -> Vec<&Operation> {
        self.ops
            .iter()
            .filter(|op| op.target().is_within(entity))
            .collect()
    }

    /// Operations of the kind named `name` (e.g. `"add_column"`).
    pub fn of_kind(&self, name: &str) -> Result<Vec<&Operation>, EngineError> {
        let kind = OperationKind::parse(name).map_err(|e| match e {
            CoreError::InvalidOperationKind(s) => EngineError::InvalidOperationKind(s),
            other => EngineError::Core(other),
        })?;
        Ok(self.ops.iter().filter(|op| op.kind() == kind).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.iter()
    }

    pub fn to_ordered_list(&self) -> Vec<Operation> {
        self.ops.clone()
    }
}
