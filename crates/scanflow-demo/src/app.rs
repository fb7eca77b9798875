//! Session wiring and the scripted run.

use std::fmt;
use std::rc::Rc;

use scanflow::{
    CommandRouter, Container, ContainerRegistry, ObserverScheduler, PassReport, RuntimeConfig,
    StateDocument,
};

use crate::commands::{
    self, CancelScan, OptionsContainer, ReloadOptions, ReloadTargets, SelectDevice, SetOption,
    SetResolution,
};
use crate::error::{DemoError, Result};
use crate::model::{
    DeviceList, DeviceOptions, OptionValue, SETTINGS_KEY, ScanSettings, SelectedDevice,
    SimulatedBackend,
};
use crate::observers;
use crate::views::Views;

/// One scripted user action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Idle,
    Select(&'static str),
    Resolution(u32),
    Set(&'static str, OptionValue),
    Reload,
    Cancel,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Select(name) => write!(f, "select {name}"),
            Self::Resolution(dpi) => write!(f, "resolution {dpi}"),
            Self::Set(name, value) => write!(f, "set {name}={value}"),
            Self::Reload => f.write_str("reload options"),
            Self::Cancel => f.write_str("cancel scan"),
        }
    }
}

/// The session the demo binary plays back, one step per tick.
#[must_use]
pub fn script() -> Vec<Step> {
    vec![
        Step::Idle,
        Step::Select("flatbed-a4"),
        Step::Resolution(600),
        Step::Set("mode", OptionValue::Text("gray".into())),
        Step::Select("network-mfp"),
        Step::Select("sheetfed-duplex"),
        Step::Set("duplex", OptionValue::Bool(true)),
        Step::Reload,
        Step::Cancel,
    ]
}

pub struct Session {
    registry: ContainerRegistry,
    selected: Container<SelectedDevice>,
    options: OptionsContainer,
    settings: Container<ScanSettings>,
    toolbar: CommandRouter,
    scheduler: ObserverScheduler,
    views: Views,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("registry", &self.registry)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn new(config: &RuntimeConfig, backend: SimulatedBackend) -> Self {
        let backend = Rc::new(backend);
        let registry = ContainerRegistry::new();

        let devices: Container<DeviceList> = Container::builder(DeviceList(backend.devices()))
            .name("devices")
            .register(&registry);
        let selected: Container<SelectedDevice> = Container::builder(SelectedDevice::default())
            .name("selected-device")
            .register(&registry);
        let options: OptionsContainer = Container::builder(DeviceOptions::default())
            .name("device-options")
            .track_changesets()
            .changeset_capacity(config.changeset_capacity)
            .register(&registry);
        let settings: Container<ScanSettings> = Container::builder(ScanSettings::default())
            .name("scan-settings")
            .persist(SETTINGS_KEY)
            .register(&registry);

        let root = CommandRouter::with_config(config);
        let toolbar = root.child();
        commands::install(
            &root,
            &toolbar,
            ReloadTargets {
                backend: Rc::clone(&backend),
                selected: selected.clone(),
                settings: settings.clone(),
                options: options.clone(),
            },
        );

        let views = Views::default();
        let scheduler = ObserverScheduler::with_config(config);
        // Views first: the scheduler still runs the writers ahead of them.
        scheduler.add(observers::option_panel(&options, Rc::clone(&views.panel)));
        scheduler.add(observers::status_line(
            &selected,
            &settings,
            Rc::clone(&views.status),
        ));
        scheduler.add(observers::settings_sync(&options, &settings));
        scheduler.add(observers::options_loader(
            backend, &selected, &options, &settings,
        ));
        let (banner, banner_id) = observers::welcome_banner(
            &devices,
            Rc::clone(&views.banner),
            scheduler.downgrade(),
        );
        banner_id.set(Some(scheduler.add(banner)));

        Self {
            registry,
            selected,
            options,
            settings,
            toolbar,
            scheduler,
            views,
        }
    }

    /// Restore persisted containers from `document`.
    pub fn load_state(&self, document: &StateDocument) -> Result<usize> {
        Ok(self.registry.load_document(document)?)
    }

    pub fn save_state(&self) -> Result<StateDocument> {
        Ok(self.registry.save_document()?)
    }

    /// Dispatch `step` through the toolbar router, then run one pass.
    pub fn tick(&self, step: &Step) -> Result<PassReport> {
        let dispatched = match step {
            Step::Idle => None,
            Step::Select(name) => Some(self.toolbar.dispatch(&SelectDevice((*name).to_string()))),
            Step::Resolution(dpi) => Some(self.toolbar.dispatch(&SetResolution(*dpi))),
            Step::Set(name, value) => Some(self.toolbar.dispatch(&SetOption {
                name: (*name).to_string(),
                value: value.clone(),
            })),
            Step::Reload => Some(self.toolbar.dispatch(&ReloadOptions)),
            Step::Cancel => Some(self.toolbar.dispatch(&CancelScan)),
        };
        if let Some(outcome) = dispatched {
            tracing::debug!(message = "session.dispatch", step = %step, handled = outcome.is_handled());
        }
        let report = self.scheduler.notify_observers()?;
        // Every consumer of the option changesets has caught up.
        self.options
            .discard_changes_before(self.options.version());
        Ok(report)
    }

    #[must_use]
    pub fn render(&self) -> String {
        self.views.render()
    }

    #[must_use]
    pub fn settings(&self) -> ScanSettings {
        self.settings.read().clone()
    }

    #[must_use]
    pub fn selected(&self) -> Option<String> {
        self.selected.read().0.clone()
    }

    #[must_use]
    pub fn scheduler(&self) -> &ObserverScheduler {
        &self.scheduler
    }

    #[must_use]
    pub fn views(&self) -> &Views {
        &self.views
    }
}

/// Play back `steps`, printing the views after each tick through `emit`.
///
/// Observer failures are logged and the session continues; the failing
/// observer retries on the next tick. Wiring errors abort.
pub fn run_script(session: &Session, steps: &[Step], mut emit: impl FnMut(&str)) -> Result<()> {
    for (tick, step) in steps.iter().enumerate() {
        tracing::info!(message = "session.tick", tick, step = %step);
        match session.tick(step) {
            Ok(report) => {
                tracing::debug!(
                    message = "session.pass",
                    tick,
                    ran = report.ran,
                    unchanged = report.unchanged,
                    removed = report.removed
                );
            }
            Err(DemoError::Runtime(err)) if !err.is_fatal() => {
                tracing::error!(message = "session.observer_failed", tick, error = %err);
            }
            Err(err) => return Err(err),
        }
        emit(&format!("── tick {tick}: {step}\n{}", session.render()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(&RuntimeConfig::default(), SimulatedBackend::default())
    }

    #[test]
    fn first_tick_renders_banner_and_removes_it() {
        let session = session();
        session.tick(&Step::Idle).expect("tick");
        assert_eq!(session.scheduler().len(), 4);
        let banner = session.views().banner.borrow().clone();
        assert_eq!(banner[0], "3 scanners found, 2 online");
        assert_eq!(*session.views().status.borrow(), "no device selected");

        session.tick(&Step::Idle).expect("tick");
        assert_eq!(session.views().banner.borrow().len(), banner.len());
    }

    #[test]
    fn writers_run_before_views() {
        let session = session();
        assert_eq!(
            session.scheduler().execution_order().expect("order"),
            vec![
                "options-loader",
                "option-panel",
                "settings-sync",
                "status-line",
                "welcome-banner"
            ]
        );
    }

    #[test]
    fn selecting_a_device_fills_panel_and_status() {
        let session = session();
        session.tick(&Step::Idle).expect("tick");
        session.tick(&Step::Select("flatbed-a4")).expect("tick");
        assert_eq!(session.views().panel.borrow().rows().len(), 3);
        assert_eq!(
            *session.views().status.borrow(),
            "flatbed-a4 | 300 dpi | color | simplex"
        );
    }

    #[test]
    fn resolution_shortcut_updates_settings_incrementally() {
        let session = session();
        session.tick(&Step::Select("flatbed-a4")).expect("tick");
        let full = session.views().panel.borrow().full_refreshes();
        session.tick(&Step::Resolution(1200)).expect("tick");
        assert_eq!(session.settings().resolution, 1200);
        let panel = session.views().panel.borrow();
        assert_eq!(panel.full_refreshes(), full);
        assert_eq!(panel.row_refreshes(), 1);
        assert!(panel.rows()[0].ends_with("1200"));
    }

    #[test]
    fn offline_device_fails_the_pass_then_recovers() {
        let session = session();
        session.tick(&Step::Select("flatbed-a4")).expect("tick");
        let err = session
            .tick(&Step::Select("network-mfp"))
            .expect_err("offline");
        assert!(matches!(err, DemoError::Runtime(ref e) if !e.is_fatal()));

        session.tick(&Step::Select("sheetfed-duplex")).expect("tick");
        assert_eq!(session.selected().as_deref(), Some("sheetfed-duplex"));
        assert_eq!(session.views().panel.borrow().rows().len(), 5);
    }

    #[test]
    fn saved_settings_are_applied_to_opened_devices() {
        let first = session();
        first.tick(&Step::Select("sheetfed-duplex")).expect("tick");
        first
            .tick(&Step::Set("duplex", OptionValue::Bool(true)))
            .expect("tick");
        first.tick(&Step::Resolution(600)).expect("tick");
        let document = first.save_state().expect("save");
        assert_eq!(document.keys().collect::<Vec<_>>(), vec![SETTINGS_KEY]);

        let second = session();
        assert_eq!(second.load_state(&document).expect("load"), 1);
        second.tick(&Step::Select("sheetfed-duplex")).expect("tick");
        assert_eq!(
            *second.views().status.borrow(),
            "sheetfed-duplex | 600 dpi | color | duplex"
        );
        assert!(
            second.views().panel.borrow().rows()[3].ends_with("on"),
            "duplex row reflects saved setting"
        );
    }

    #[test]
    fn full_script_runs_to_completion() {
        let session = session();
        let mut frames = Vec::new();
        run_script(&session, &script(), |frame| frames.push(frame.to_string()))
            .expect("script");
        assert_eq!(frames.len(), script().len());
        let settings = session.settings();
        assert_eq!(settings.mode, "gray");
        assert!(settings.duplex);
        assert!(frames.last().is_some_and(|f| f.contains("cancel scan")));
    }
}
