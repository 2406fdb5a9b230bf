//! Cursor over a delta's operations that can split an op mid-way.

use super::attributes::AttributeMap;
use super::Op;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Insert,
    Retain,
    Delete,
}

pub(crate) struct OpIter<'a> {
    ops: &'a [Op],
    index: usize,
    offset: usize,
}

impl<'a> OpIter<'a> {
    pub(crate) fn new(ops: &'a [Op]) -> Self {
        Self {
            ops,
            index: 0,
            offset: 0,
        }
    }

    pub(crate) fn has_next(&self) -> bool {
        self.index < self.ops.len()
    }

    /// Remaining length of the current op; `usize::MAX` once exhausted,
    /// which behaves like an implicit retain of the rest of the document.
    pub(crate) fn peek_len(&self) -> usize {
        match self.ops.get(self.index) {
            Some(op) => op.len() - self.offset,
            None => usize::MAX,
        }
    }

    pub(crate) fn peek_kind(&self) -> OpKind {
        match self.ops.get(self.index) {
            Some(Op::Insert { .. }) => OpKind::Insert,
            Some(Op::Delete(_)) => OpKind::Delete,
            _ => OpKind::Retain,
        }
    }

    /// Take the whole remainder of the current op.
    pub(crate) fn next_op(&mut self) -> Op {
        self.next_len(usize::MAX)
    }

    /// Take at most `length` units from the current op.
    pub(crate) fn next_len(&mut self, length: usize) -> Op {
        let Some(op) = self.ops.get(self.index) else {
            return Op::Retain {
                count: length,
                attributes: AttributeMap::new(),
            };
        };

        let offset = self.offset;
        let remaining = op.len() - offset;
        let taken = if length >= remaining {
            self.index += 1;
            self.offset = 0;
            remaining
        } else {
            self.offset += length;
            length
        };

        match op {
            Op::Delete(_) => Op::Delete(taken),
            Op::Retain { attributes, .. } => Op::Retain {
                count: taken,
                attributes: attributes.clone(),
            },
            Op::Insert { text, attributes } => Op::Insert {
                text: text.chars().skip(offset).take(taken).collect(),
                attributes: attributes.clone(),
            },
        }
    }
}
