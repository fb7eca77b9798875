//! Commands the scripted session issues, and the handlers behind them.

use std::rc::Rc;

use scanflow::{Command, CommandRouter, Container};

use crate::model::{
    DeviceOptions, OptionChanges, OptionValue, ScanSettings, SelectedDevice, SimulatedBackend,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectDevice(pub String);
impl Command for SelectDevice {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetOption {
    pub name: String,
    pub value: OptionValue,
}
impl Command for SetOption {}

/// Re-read the option list from the selected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadOptions;
impl Command for ReloadOptions {}

/// Toolbar shortcut; forwards to [`SetOption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetResolution(pub u32);
impl Command for SetResolution {}

/// Nothing handles this; it exercises the unhandled-command path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelScan;
impl Command for CancelScan {}

pub type OptionsContainer = Container<DeviceOptions, OptionChanges>;

fn select_device(cmd: &SelectDevice, selected: &Container<SelectedDevice>) {
    if selected.read().0.as_deref() == Some(cmd.0.as_str()) {
        return;
    }
    selected.update(|s, _| s.0 = Some(cmd.0.clone()));
}

fn set_option(cmd: &SetOption, options: &OptionsContainer) {
    if options.read().index_of(&cmd.name).is_none() {
        tracing::warn!(message = "option.unknown", option = %cmd.name);
        return;
    }
    options.update(|opts, changes| opts.set(&cmd.name, cmd.value.clone(), changes));
}

/// Targets of [`ReloadOptions`].
pub struct ReloadTargets {
    pub backend: Rc<SimulatedBackend>,
    pub selected: Container<SelectedDevice>,
    pub settings: Container<ScanSettings>,
    pub options: OptionsContainer,
}

fn reload_options(_: &ReloadOptions, targets: &ReloadTargets) {
    let Some(name) = targets.selected.read().0.clone() else {
        return;
    };
    let reopened = DeviceOptions::open(&targets.backend, &name, &targets.settings.read());
    match reopened {
        Ok(fresh) => {
            targets.options.replace(fresh);
        }
        Err(err) => tracing::warn!(message = "options.reload_failed", error = %err),
    }
}

fn set_resolution(cmd: &SetResolution, root: &CommandRouter) {
    root.dispatch(&SetOption {
        name: "resolution".to_string(),
        value: OptionValue::Int(i64::from(cmd.0)),
    });
}

/// Bind the device commands on `root` and the toolbar shortcuts on
/// `toolbar`, which should be a child of `root`.
pub fn install(root: &CommandRouter, toolbar: &CommandRouter, targets: ReloadTargets) {
    root.bind_handler(targets.selected.clone(), select_device);
    root.bind_handler(targets.options.clone(), set_option);
    root.bind_handler(targets, reload_options);
    toolbar.bind_handler(root.clone(), set_resolution);
}
