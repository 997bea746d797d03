//! Stateful render units bound to cells.
//!
//! A `Bond` owns cells and projects them into a presentation value; a
//! `Mount` wires the bond to the cells it reads and collapses any number
//! of same-turn writes into a single re-render when the driving loop next
//! asks for one.

use super::{Cell, DirtyFlag, Subscription};

pub trait Bond {
    type View;

    /// Pure projection of current cell values to a presentation value.
    fn render(&self) -> Self::View;

    /// Called exactly once when the bond is mounted.
    fn init(&mut self) {}

    /// Called exactly once when the mount is disposed or dropped.
    fn dispose(&mut self) {}
}

pub struct Mount<B: Bond> {
    bond: B,
    dirty: DirtyFlag,
    subscriptions: Vec<Subscription>,
    torn_down: bool,
}

impl<B: Bond> Mount<B> {
    pub fn new(mut bond: B) -> Self {
        bond.init();
        let mount = Mount {
            bond,
            dirty: DirtyFlag::default(),
            subscriptions: Vec::new(),
            torn_down: false,
        };
        // Freshly mounted bonds render once unconditionally.
        mount.dirty.mark();
        mount
    }

    /// Re-render whenever `cell` is written.
    pub fn watch<T: Clone + Send + 'static>(&mut self, cell: &Cell<T>) -> &mut Self {
        let dirty = self.dirty.clone();
        self.subscriptions.push(cell.subscribe(move |_| dirty.mark()));
        self
    }

    pub fn bond(&self) -> &B {
        &self.bond
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_set()
    }

    /// One re-render covering every write since the previous call, or
    /// `None` when nothing was written.
    pub fn render_if_dirty(&mut self) -> Option<B::View> {
        if self.dirty.take() {
            Some(self.bond.render())
        } else {
            None
        }
    }

    /// Unconditional projection; does not clear the dirty flag.
    pub fn render(&self) -> B::View {
        self.bond.render()
    }

    pub fn dispose(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        for subscription in self.subscriptions.drain(..) {
            subscription.dispose();
        }
        self.bond.dispose();
    }
}

impl<B: Bond> Drop for Mount<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
