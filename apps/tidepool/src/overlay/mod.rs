//! Overlay presenters: pure consumers of the core's cells.
//!
//! The spinner implements the busy-debounce contract; the not-found
//! overlay and its layout picker are view-state glue around the recovery
//! flow. Neither contains synchronization logic of its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::info;

use crate::cell::{Bond, Cell, Subscription, on};

/// Busy overlay with a debounced spinner: the overlay tracks `busy`
/// directly, but the spinner only fades in once `busy` has stayed
/// continuously true for the whole delay window. Every write to `busy`
/// restarts the window; busy→false hides the spinner immediately.
pub struct Spinner {
    busy: Cell<bool>,
    spinning: Cell<bool>,
    generation: Arc<AtomicU64>,
    watch: Option<Subscription>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinnerView {
    pub overlay_visible: bool,
    pub spinning: bool,
}

impl Spinner {
    pub fn new(busy: Cell<bool>, delay: Duration) -> Self {
        let spinning = Cell::new(false);
        let generation = Arc::new(AtomicU64::new(0));

        let timer_spinning = spinning.clone();
        let timer_generation = Arc::clone(&generation);
        let watch = on(&busy, move |now| {
            // Supersede any armed timer.
            let armed = timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
            if *now {
                let spinning = timer_spinning.clone();
                let generation = Arc::clone(&timer_generation);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if generation.load(Ordering::SeqCst) == armed {
                        spinning.set(true);
                    }
                });
            } else {
                timer_spinning.set(false);
            }
        });

        Spinner {
            busy,
            spinning,
            generation,
            watch: Some(watch),
        }
    }

    pub fn spinning(&self) -> &Cell<bool> {
        &self.spinning
    }
}

impl Bond for Spinner {
    type View = SpinnerView;

    fn render(&self) -> SpinnerView {
        SpinnerView {
            overlay_visible: self.busy.get(),
            spinning: self.spinning.get(),
        }
    }

    fn dispose(&mut self) {
        // Invalidate any armed timer, then detach from the busy cell.
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(watch) = self.watch.take() {
            watch.dispose();
        }
    }
}

/// A page layout the recovery overlay can offer. The actual layout
/// content is owned by the editing collaborator; the core only carries
/// the names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutDef {
    pub name: &'static str,
}

pub const LAYOUT_DEFS: &[LayoutDef] = &[
    LayoutDef { name: "single column" },
    LayoutDef { name: "header and body" },
    LayoutDef { name: "sidebar" },
    LayoutDef { name: "grid" },
];

/// Invoked when the user applies a layout from the recovery overlay.
pub type ApplyLayout = Arc<dyn Fn(&LayoutDef) + Send + Sync>;

pub fn log_apply_layout() -> ApplyLayout {
    Arc::new(|layout| {
        info!(target = "overlay::recovery", layout = layout.name, "layout apply delegated to editor");
    })
}

pub struct LayoutPicker {
    visible: Cell<bool>,
    selected: Cell<usize>,
    on_apply: ApplyLayout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickerView {
    pub visible: bool,
    pub options: Vec<&'static str>,
    pub selected: &'static str,
}

impl LayoutPicker {
    pub fn new(visible: Cell<bool>, on_apply: ApplyLayout) -> Self {
        LayoutPicker {
            visible,
            selected: Cell::new(0),
            on_apply,
        }
    }

    pub fn choose(&self, name: &str) {
        if let Some(index) = LAYOUT_DEFS.iter().position(|def| def.name == name) {
            self.selected.set(index);
        }
    }

    pub fn accept(&self) {
        (self.on_apply)(&LAYOUT_DEFS[self.selected.get()]);
    }

    pub fn cancel(&self) {
        self.visible.set(false);
    }
}

impl Bond for LayoutPicker {
    type View = PickerView;

    fn render(&self) -> PickerView {
        PickerView {
            visible: self.visible.get(),
            options: LAYOUT_DEFS.iter().map(|def| def.name).collect(),
            selected: LAYOUT_DEFS[self.selected.get()].name,
        }
    }
}

/// Recovery overlay shown for a `not_found` session error: offers to make
/// the page editable with a chosen layout.
pub struct NotFoundOverlay {
    picking: Cell<bool>,
    picker: LayoutPicker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotFoundView {
    pub picker: PickerView,
}

impl NotFoundOverlay {
    pub fn new(on_apply: ApplyLayout) -> Self {
        let picking = Cell::new(false);
        NotFoundOverlay {
            picker: LayoutPicker::new(picking.clone(), on_apply),
            picking,
        }
    }

    pub fn open_picker(&self) {
        self.picking.set(true);
    }

    pub fn picking(&self) -> &Cell<bool> {
        &self.picking
    }

    pub fn picker(&self) -> &LayoutPicker {
        &self.picker
    }
}

impl Bond for NotFoundOverlay {
    type View = NotFoundView;

    fn render(&self) -> NotFoundView {
        NotFoundView {
            picker: self.picker.render(),
        }
    }
}
