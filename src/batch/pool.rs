use crate::RetraceError;

/// Index of a batch inside a [`BatchPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchHandle(pub(crate) usize);

impl BatchHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BatchOp<C> {
    init: bool,
    command: C,
}

/// Reusable buffer of commands destined for one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<C> {
    ops: Vec<BatchOp<C>>,
}

impl<C> Default for Batch<C> {
    fn default() -> Self {
        Self { ops: Vec::new() }
    }
}

impl<C> Batch<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: C) {
        self.ops.push(BatchOp {
            init: false,
            command,
        });
    }

    /// Pushes a command that belongs to the frame's first-time initialisation.
    pub fn push_init(&mut self, command: C) {
        self.ops.push(BatchOp {
            init: true,
            command,
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn init_len(&self) -> usize {
        self.ops.iter().filter(|op| op.init).count()
    }

    /// Drops every command but keeps the allocation.
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Commands in push order; with `init_only`, only those pushed with [`push_init`](Self::push_init).
    pub fn commands(&self, init_only: bool) -> impl Iterator<Item = &C> + '_ {
        self.ops
            .iter()
            .filter(move |op| !init_only || op.init)
            .map(|op| &op.command)
    }
}

impl<C: Clone> Batch<C> {
    /// Appends a copy of every command of `other`, keeping their init flags.
    pub fn extend_from(&mut self, other: &Batch<C>) {
        self.ops.extend(other.ops.iter().cloned());
    }
}

/// Arena of batches with a free list; freed batches keep their storage for reuse.
#[derive(Debug)]
pub struct BatchPool<C> {
    slots: Vec<Batch<C>>,
    in_use: Vec<bool>,
    free: Vec<usize>,
}

impl<C> Default for BatchPool<C> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            in_use: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<C> BatchPool<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> BatchHandle {
        match self.free.pop() {
            Some(idx) => {
                self.in_use[idx] = true;
                BatchHandle(idx)
            }
            None => {
                self.slots.push(Batch::new());
                self.in_use.push(true);
                BatchHandle(self.slots.len() - 1)
            }
        }
    }

    pub fn free(&mut self, handle: BatchHandle) -> Result<(), RetraceError> {
        if !self.is_live(handle) {
            return Err(RetraceError::UnknownBatch(handle.0));
        }
        self.slots[handle.0].clear();
        self.in_use[handle.0] = false;
        self.free.push(handle.0);
        Ok(())
    }

    pub fn is_live(&self, handle: BatchHandle) -> bool {
        self.in_use.get(handle.0).copied().unwrap_or(false)
    }

    pub fn get(&self, handle: BatchHandle) -> Option<&Batch<C>> {
        self.is_live(handle).then(|| &self.slots[handle.0])
    }

    pub fn get_mut(&mut self, handle: BatchHandle) -> Option<&mut Batch<C>> {
        if self.is_live(handle) {
            Some(&mut self.slots[handle.0])
        } else {
            None
        }
    }

    /// Batches ever constructed, live or free.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn live(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

impl<C: Clone> BatchPool<C> {
    /// Appends the commands of every live `sources` batch, in order, onto `target`.
    pub(crate) fn merge_into(&mut self, target: BatchHandle, sources: &[BatchHandle]) {
        let mut out = std::mem::take(&mut self.slots[target.0]);
        for source in sources {
            if *source != target && self.is_live(*source) {
                out.extend_from(&self.slots[source.0]);
            }
        }
        self.slots[target.0] = out;
    }
}
