//! Text views fed by observers.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

use crate::model::{DeviceOptions, OptionChanges};

/// One rendered row per device option, refreshed incrementally.
#[derive(Debug, Default)]
pub struct OptionPanel {
    rows: Vec<String>,
    full_refreshes: usize,
    row_refreshes: usize,
}

impl OptionPanel {
    /// Bring the panel up to date with `options`, redrawing only the rows
    /// named in `changes` unless it asks for a reload.
    pub fn refresh(&mut self, options: &DeviceOptions, changes: &OptionChanges) {
        if changes.reload || self.rows.len() != options.options.len() {
            self.rows = options.options.iter().map(render_row).collect();
            self.full_refreshes += 1;
            return;
        }
        for &index in &changes.touched {
            if let (Some(row), Some(option)) = (self.rows.get_mut(index), options.options.get(index))
            {
                *row = render_row(option);
                self.row_refreshes += 1;
            }
        }
    }

    #[must_use]
    pub fn rows(&self) -> &[String] {
        &self.rows
    }

    #[must_use]
    pub fn full_refreshes(&self) -> usize {
        self.full_refreshes
    }

    #[must_use]
    pub fn row_refreshes(&self) -> usize {
        self.row_refreshes
    }
}

fn render_row(option: &crate::model::ScanOption) -> String {
    format!("{:<12} {}", option.name, option.value)
}

/// Shared view state; observers hold clones of the cells.
#[derive(Debug, Clone, Default)]
pub struct Views {
    pub panel: Rc<RefCell<OptionPanel>>,
    pub status: Rc<RefCell<String>>,
    pub banner: Rc<RefCell<Vec<String>>>,
}

impl Views {
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in self.banner.borrow().iter() {
            let _ = writeln!(out, "{line}");
        }
        let _ = writeln!(out, "[{}]", self.status.borrow());
        for row in self.panel.borrow().rows() {
            let _ = writeln!(out, "  {row}");
        }
        out
    }
}
