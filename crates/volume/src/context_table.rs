use bitvec::prelude::{BitVec, Lsb0};
use render_protocol::{ContextKey, TargetKey};

/// Per-context state of one image, stored struct-of-arrays.
///
/// `keys`, `targets`, `has_cpu_updates` and `voxels_rendered` always have the
/// same length; every mutation touches all four together.
#[derive(Debug, Default)]
pub(crate) struct ContextTable {
    keys: Vec<ContextKey>,
    targets: Vec<TargetKey>,
    /// The context's atlas is behind the CPU buffer.
    has_cpu_updates: BitVec<usize, Lsb0>,
    /// The pending edit queue has been applied to the context.
    voxels_rendered: BitVec<usize, Lsb0>,
}

impl ContextTable {
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub(crate) fn position(&self, key: ContextKey) -> Option<usize> {
        self.keys.iter().position(|candidate| *candidate == key)
    }

    pub(crate) fn key(&self, index: usize) -> ContextKey {
        self.keys[index]
    }

    pub(crate) fn target(&self, index: usize) -> TargetKey {
        self.targets[index]
    }

    pub(crate) fn keys(&self) -> &[ContextKey] {
        &self.keys
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (ContextKey, TargetKey)> + '_ {
        self.keys.iter().copied().zip(self.targets.iter().copied())
    }

    /// A new context starts behind the CPU buffer; its first sync uploads the
    /// whole buffer, which already holds every pending edit.
    pub(crate) fn push(&mut self, key: ContextKey, target: TargetKey) -> usize {
        self.keys.push(key);
        self.targets.push(target);
        self.has_cpu_updates.push(true);
        self.voxels_rendered.push(true);
        self.debug_check();
        self.keys.len() - 1
    }

    pub(crate) fn swap_remove(&mut self, index: usize) -> (ContextKey, TargetKey) {
        let key = self.keys.swap_remove(index);
        let target = self.targets.swap_remove(index);
        self.has_cpu_updates.swap_remove(index);
        self.voxels_rendered.swap_remove(index);
        self.debug_check();
        (key, target)
    }

    pub(crate) fn drain(&mut self) -> Vec<(ContextKey, TargetKey)> {
        let entries = self.entries().collect();
        self.keys.clear();
        self.targets.clear();
        self.has_cpu_updates.clear();
        self.voxels_rendered.clear();
        entries
    }

    pub(crate) fn has_cpu_updates(&self, index: usize) -> bool {
        self.has_cpu_updates[index]
    }

    pub(crate) fn set_has_cpu_updates(&mut self, index: usize, value: bool) {
        self.has_cpu_updates.set(index, value);
    }

    pub(crate) fn mark_all_cpu_updates(&mut self) {
        self.has_cpu_updates.fill(true);
    }

    /// Index of a context whose atlas is not behind the CPU buffer.
    pub(crate) fn first_current(&self) -> Option<usize> {
        self.has_cpu_updates.iter_zeros().next()
    }

    pub(crate) fn voxels_rendered(&self, index: usize) -> bool {
        self.voxels_rendered[index]
    }

    pub(crate) fn set_voxels_rendered(&mut self, index: usize, value: bool) {
        self.voxels_rendered.set(index, value);
    }

    pub(crate) fn mark_all_voxels_pending(&mut self) {
        self.voxels_rendered.fill(false);
    }

    pub(crate) fn all_voxels_rendered(&self) -> bool {
        self.voxels_rendered.all()
    }

    fn debug_check(&self) {
        debug_assert_eq!(self.keys.len(), self.targets.len());
        debug_assert_eq!(self.keys.len(), self.has_cpu_updates.len());
        debug_assert_eq!(self.keys.len(), self.voxels_rendered.len());
    }
}
