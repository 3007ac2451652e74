//! Exposure controls shown to the user
//!
//! A front end implements `ControlSurface` over its widgets. `HeadlessControls`
//! is an in-memory implementation for the CLI and for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// User-editable controls the controller writes into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlId {
    /// Exposure time in microseconds
    ExposureTime,
    /// Analog gain in percent
    Gain,
}

/// Widget-side view of the exposure controls
pub trait ControlSurface: Send {
    /// True while the user is editing the control
    fn has_focus(&self, control: ControlId) -> bool;

    fn value(&self, control: ControlId) -> u32;

    /// Update the displayed value without raising a change notification
    fn set_value_silently(&mut self, control: ControlId, value: u32);

    fn set_range(&mut self, control: ControlId, min: u32, max: u32);

    fn set_auto_exposure_checked(&mut self, checked: bool);

    /// Enable or disable all exposure controls
    fn set_enabled(&mut self, enabled: bool);
}

#[derive(Debug, Clone, Default)]
struct ControlState {
    value: u32,
    range: Option<(u32, u32)>,
    focused: bool,
    notifications: u32,
}

#[derive(Debug, Default)]
struct Panel {
    controls: HashMap<ControlId, ControlState>,
    auto_checked: bool,
    enabled: bool,
}

impl Panel {
    fn control(&mut self, control: ControlId) -> &mut ControlState {
        self.controls.entry(control).or_default()
    }
}

/// In-memory controls, shareable between the controller and an observer
#[derive(Debug, Clone, Default)]
pub struct HeadlessControls {
    panel: Arc<Mutex<Panel>>,
}

impl HeadlessControls {
    pub fn new() -> Self {
        Self::default()
    }

    fn panel(&self) -> MutexGuard<'_, Panel> {
        self.panel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Give or take input focus
    pub fn set_focus(&self, control: ControlId, focused: bool) {
        self.panel().control(control).focused = focused;
    }

    /// Simulate the user typing a value; raises a change notification
    pub fn type_value(&self, control: ControlId, value: u32) {
        let mut panel = self.panel();
        let state = panel.control(control);
        state.value = clamp(value, state.range);
        state.notifications += 1;
    }

    /// Change notifications raised so far
    pub fn notifications(&self, control: ControlId) -> u32 {
        self.panel().control(control).notifications
    }

    pub fn range(&self, control: ControlId) -> Option<(u32, u32)> {
        self.panel().control(control).range
    }

    pub fn auto_exposure_checked(&self) -> bool {
        self.panel().auto_checked
    }

    pub fn is_enabled(&self) -> bool {
        self.panel().enabled
    }
}

fn clamp(value: u32, range: Option<(u32, u32)>) -> u32 {
    match range {
        Some((min, max)) if min <= max => value.clamp(min, max),
        _ => value,
    }
}

impl ControlSurface for HeadlessControls {
    fn has_focus(&self, control: ControlId) -> bool {
        self.panel().control(control).focused
    }

    fn value(&self, control: ControlId) -> u32 {
        self.panel().control(control).value
    }

    fn set_value_silently(&mut self, control: ControlId, value: u32) {
        let mut panel = self.panel();
        let state = panel.control(control);
        state.value = clamp(value, state.range);
    }

    fn set_range(&mut self, control: ControlId, min: u32, max: u32) {
        let mut panel = self.panel();
        let state = panel.control(control);
        state.range = Some((min, max));
        state.value = clamp(state.value, state.range);
    }

    fn set_auto_exposure_checked(&mut self, checked: bool) {
        self.panel().auto_checked = checked;
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.panel().enabled = enabled;
    }
}
