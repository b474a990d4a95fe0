/// Document state other components react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateChange {
    ActiveLayer,
    VoxelCount,
    ViewPlane,
    SliceIndex,
    Contexts,
    VolumeData,
}

/// Components that hold state derived from the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscriber {
    /// Stroke scratch targets, sized for the active layer's slice.
    ToolScratch,
    /// Region-growing seed and preview masks.
    RegionSession,
    /// Progressive volume rendering.
    ProgressiveRender,
}

#[derive(Debug, Clone, Default)]
pub struct Subscriptions {
    entries: Vec<(Subscriber, Vec<StateChange>)>,
    pending: Vec<StateChange>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wiring every document starts with.
    pub fn document_defaults() -> Self {
        let mut subscriptions = Self::new();
        subscriptions.subscribe(
            Subscriber::ToolScratch,
            &[
                StateChange::ActiveLayer,
                StateChange::VoxelCount,
                StateChange::ViewPlane,
                StateChange::SliceIndex,
                StateChange::Contexts,
            ],
        );
        subscriptions.subscribe(
            Subscriber::RegionSession,
            &[
                StateChange::ActiveLayer,
                StateChange::VoxelCount,
                StateChange::Contexts,
            ],
        );
        subscriptions.subscribe(
            Subscriber::ProgressiveRender,
            &[
                StateChange::VoxelCount,
                StateChange::ViewPlane,
                StateChange::VolumeData,
            ],
        );
        subscriptions
    }

    pub fn subscribe(&mut self, subscriber: Subscriber, changes: &[StateChange]) {
        match self.entries.iter_mut().find(|(entry, _)| *entry == subscriber) {
            Some((_, subscribed)) => {
                for change in changes {
                    if !subscribed.contains(change) {
                        subscribed.push(*change);
                    }
                }
            }
            None => self.entries.push((subscriber, changes.to_vec())),
        }
    }

    pub fn is_subscribed(&self, subscriber: Subscriber, change: StateChange) -> bool {
        self.entries
            .iter()
            .any(|(entry, changes)| *entry == subscriber && changes.contains(&change))
    }

    pub fn notify(&mut self, change: StateChange) {
        if !self.pending.contains(&change) {
            self.pending.push(change);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Clears the pending changes and returns every subscriber affected by
    /// them, each once, in subscription order.
    pub fn take_notifications(&mut self) -> Vec<Subscriber> {
        let pending = std::mem::take(&mut self.pending);
        self.entries
            .iter()
            .filter(|(_, changes)| changes.iter().any(|change| pending.contains(change)))
            .map(|(subscriber, _)| *subscriber)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_reach_only_subscribed_components() {
        let mut subscriptions = Subscriptions::document_defaults();
        subscriptions.notify(StateChange::VolumeData);
        assert_eq!(
            subscriptions.take_notifications(),
            vec![Subscriber::ProgressiveRender]
        );
        assert!(!subscriptions.has_pending());

        subscriptions.notify(StateChange::ActiveLayer);
        subscriptions.notify(StateChange::ActiveLayer);
        assert_eq!(
            subscriptions.take_notifications(),
            vec![Subscriber::ToolScratch, Subscriber::RegionSession]
        );
    }

    #[test]
    fn subscribing_twice_merges_changes() {
        let mut subscriptions = Subscriptions::new();
        subscriptions.subscribe(Subscriber::RegionSession, &[StateChange::ViewPlane]);
        subscriptions.subscribe(
            Subscriber::RegionSession,
            &[StateChange::ViewPlane, StateChange::SliceIndex],
        );
        assert!(subscriptions.is_subscribed(Subscriber::RegionSession, StateChange::SliceIndex));
        assert!(!subscriptions.is_subscribed(Subscriber::ToolScratch, StateChange::SliceIndex));
        subscriptions.notify(StateChange::SliceIndex);
        assert_eq!(
            subscriptions.take_notifications(),
            vec![Subscriber::RegionSession]
        );
    }
}
