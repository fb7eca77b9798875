//! Scanner session state: devices, their options, and saved settings.

use std::collections::BTreeSet;
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use scanflow::Changeset;

use crate::error::{DemoError, Result};

bitflags! {
    /// Which option groups a change touched.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OptionCategory: u8 {
        const GEOMETRY = 0b0001;
        const COLOR    = 0b0010;
        const FEEDER   = 0b0100;
        const ADVANCED = 0b1000;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
    pub online: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList(pub Vec<DeviceInfo>);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectedDevice(pub Option<String>);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Int(i64),
    Bool(bool),
    Text(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => f.write_str(if *v { "on" } else { "off" }),
            Self::Text(v) => f.write_str(v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOption {
    pub name: &'static str,
    pub category: OptionCategory,
    pub value: OptionValue,
}

impl ScanOption {
    fn new(name: &'static str, category: OptionCategory, value: OptionValue) -> Self {
        Self {
            name,
            category,
            value,
        }
    }
}

/// Options exposed by the selected device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceOptions {
    pub device: Option<String>,
    pub options: Vec<ScanOption>,
}

impl DeviceOptions {
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.options.iter().position(|option| option.name == name)
    }

    #[must_use]
    pub fn value(&self, name: &str) -> Option<&OptionValue> {
        self.index_of(name).map(|i| &self.options[i].value)
    }

    /// Open `name` on `backend` with the saved `settings` applied.
    pub fn open(backend: &SimulatedBackend, name: &str, settings: &ScanSettings) -> Result<Self> {
        let mut opened = Self {
            device: Some(name.to_string()),
            options: backend.open(name)?,
        };
        let mut ignored = OptionChanges::default();
        opened.set(
            "resolution",
            OptionValue::Int(i64::from(settings.resolution)),
            &mut ignored,
        );
        opened.set("mode", OptionValue::Text(settings.mode.clone()), &mut ignored);
        opened.set("duplex", OptionValue::Bool(settings.duplex), &mut ignored);
        Ok(opened)
    }

    /// Set an option and record the change. Returns `false` if the device
    /// has no such option.
    pub fn set(&mut self, name: &str, value: OptionValue, changes: &mut OptionChanges) -> bool {
        let Some(index) = self.index_of(name) else {
            return false;
        };
        let option = &mut self.options[index];
        option.value = value;
        changes.touched.insert(index);
        changes.categories |= option.category;
        true
    }
}

/// Changeset for [`DeviceOptions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionChanges {
    pub touched: BTreeSet<usize>,
    pub categories: OptionCategory,
    /// The whole option list was replaced.
    pub reload: bool,
}

impl Default for OptionChanges {
    fn default() -> Self {
        Self {
            touched: BTreeSet::new(),
            categories: OptionCategory::empty(),
            reload: false,
        }
    }
}

impl Changeset for OptionChanges {
    fn merge(&mut self, later: &Self) {
        self.touched.extend(later.touched.iter().copied());
        self.categories |= later.categories;
        self.reload |= later.reload;
    }

    fn is_empty(&self) -> bool {
        self.touched.is_empty() && self.categories.is_empty() && !self.reload
    }

    fn full_reload() -> Self {
        Self {
            touched: BTreeSet::new(),
            categories: OptionCategory::all(),
            reload: true,
        }
    }
}

/// Persisted user preferences, reapplied whenever a device is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub resolution: u32,
    pub mode: String,
    pub duplex: bool,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            resolution: 300,
            mode: "color".to_string(),
            duplex: false,
        }
    }
}

pub const SETTINGS_KEY: &str = "scan-settings";

/// In-process stand-in for a scanner backend.
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    devices: Vec<DeviceInfo>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        let device = |name: &str, model: &str, online| DeviceInfo {
            name: name.to_string(),
            model: model.to_string(),
            online,
        };
        Self {
            devices: vec![
                device("flatbed-a4", "Canoscan LiDE 400", true),
                device("sheetfed-duplex", "Fujitsu fi-7160", true),
                device("network-mfp", "Brother MFC-L2710", false),
            ],
        }
    }
}

impl SimulatedBackend {
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }

    /// Open `name` and read its option descriptors.
    pub fn open(&self, name: &str) -> Result<Vec<ScanOption>> {
        let Some(device) = self.devices.iter().find(|d| d.name == name) else {
            return Err(DemoError::UnknownDevice {
                name: name.to_string(),
            });
        };
        if !device.online {
            return Err(DemoError::DeviceOffline {
                name: name.to_string(),
            });
        }

        let mut options = vec![
            ScanOption::new("resolution", OptionCategory::GEOMETRY, OptionValue::Int(300)),
            ScanOption::new("mode", OptionCategory::COLOR, OptionValue::Text("color".into())),
            ScanOption::new("brightness", OptionCategory::COLOR, OptionValue::Int(0)),
        ];
        if name.starts_with("sheetfed") {
            options.push(ScanOption::new(
                "duplex",
                OptionCategory::FEEDER,
                OptionValue::Bool(false),
            ));
            options.push(ScanOption::new(
                "page-count",
                OptionCategory::FEEDER | OptionCategory::ADVANCED,
                OptionValue::Int(0),
            ));
        }
        Ok(options)
    }
}
