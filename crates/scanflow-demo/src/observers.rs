//! Observers wiring the session state to itself and to the views.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use scanflow::runtime::WeakObserverScheduler;
use scanflow::{Container, Observer, ObserverId};

use crate::commands::OptionsContainer;
use crate::model::{
    DeviceList, DeviceOptions, OptionCategory, OptionValue, ScanSettings, SelectedDevice,
    SimulatedBackend,
};
use crate::views::OptionPanel;

/// Opens the selected device and loads its options, with saved settings
/// applied. Fails while the device cannot be opened, so it retries on the
/// next pass.
pub fn options_loader(
    backend: Rc<SimulatedBackend>,
    selected: &Container<SelectedDevice>,
    options: &OptionsContainer,
    settings: &Container<ScanSettings>,
) -> Observer {
    let (src, dst, saved) = (selected.clone(), options.clone(), settings.clone());
    Observer::try_new("options-loader", move |_| {
        let Some(name) = src.read().0.clone() else {
            dst.replace(DeviceOptions::default());
            return Ok(());
        };
        let loaded = DeviceOptions::open(&backend, &name, &saved.read())?;
        tracing::info!(message = "device.opened", device = %name, options = loaded.options.len());
        dst.replace(loaded);
        Ok(())
    })
    .observes(selected)
    .modifies(options)
}

/// Copies user-facing option values back into the persisted settings.
pub fn settings_sync(options: &OptionsContainer, settings: &Container<ScanSettings>) -> Observer {
    let (src, dst) = (options.clone(), settings.clone());
    Observer::new("settings-sync", move |cx| {
        let since = cx.last_seen(&src).unwrap_or(0);
        let changes = src.changes_since(since);
        let relevant = OptionCategory::GEOMETRY | OptionCategory::COLOR | OptionCategory::FEEDER;
        if !changes.categories.intersects(relevant) {
            return;
        }

        let mut next = dst.read().clone();
        {
            let opts = src.read();
            if let Some(OptionValue::Int(dpi)) = opts.value("resolution") {
                next.resolution = u32::try_from(*dpi).unwrap_or(next.resolution);
            }
            if let Some(OptionValue::Text(mode)) = opts.value("mode") {
                next.mode.clone_from(mode);
            }
            if let Some(OptionValue::Bool(duplex)) = opts.value("duplex") {
                next.duplex = *duplex;
            }
        }
        if next != *dst.read() {
            dst.update(|s, _| *s = next);
        }
    })
    .observes(options)
    .modifies(settings)
}

/// Incremental option panel.
pub fn option_panel(options: &OptionsContainer, panel: Rc<RefCell<OptionPanel>>) -> Observer {
    let src = options.clone();
    Observer::new("option-panel", move |cx| {
        let since = cx.last_seen(&src).unwrap_or(0);
        let changes = src.changes_since(since);
        panel.borrow_mut().refresh(&src.read(), &changes);
    })
    .observes(options)
}

pub fn status_line(
    selected: &Container<SelectedDevice>,
    settings: &Container<ScanSettings>,
    status: Rc<RefCell<String>>,
) -> Observer {
    let (device, prefs) = (selected.clone(), settings.clone());
    Observer::new("status-line", move |_| {
        let text = match device.read().0.as_deref() {
            Some(name) => {
                let prefs = prefs.read();
                let sides = if prefs.duplex { "duplex" } else { "simplex" };
                format!("{name} | {} dpi | {} | {sides}", prefs.resolution, prefs.mode)
            }
            None => "no device selected".to_string(),
        };
        *status.borrow_mut() = text;
    })
    .observes(selected)
    .observes(settings)
}

/// Prints the device list once, then unregisters itself.
///
/// Returns the observer and the cell its id must be stored in after
/// [`ObserverScheduler::add`](scanflow::ObserverScheduler::add).
pub fn welcome_banner(
    devices: &Container<DeviceList>,
    banner: Rc<RefCell<Vec<String>>>,
    scheduler: WeakObserverScheduler,
) -> (Observer, Rc<Cell<Option<ObserverId>>>) {
    let own_id: Rc<Cell<Option<ObserverId>>> = Rc::default();
    let (src, id) = (devices.clone(), Rc::clone(&own_id));
    let observer = Observer::new("welcome-banner", move |_| {
        let list = src.read();
        let online = list.0.iter().filter(|d| d.online).count();
        let mut lines = banner.borrow_mut();
        lines.push(format!("{} scanners found, {online} online", list.0.len()));
        for device in &list.0 {
            let state = if device.online { "" } else { " (offline)" };
            lines.push(format!("  - {} [{}]{state}", device.name, device.model));
        }
        if let (Some(scheduler), Some(id)) = (scheduler.upgrade(), id.take()) {
            scheduler.remove(id);
        }
    })
    .observes(devices);
    (observer, own_id)
}
