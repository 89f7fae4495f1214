// THEORY:
// Long runs (reading hundreds of tiles, classifying tens of thousands of windows)
// report their progress through the `ProgressDisplay` trait. The engine only
// knows about named categories ("Reading", "Detecting", ...) and fractions in
// 0..=1; how that is drawn is up to the implementation. A display can also cancel
// a run: the pipeline polls `is_cancelled` between batches.

use std::io::Write;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// A named progress category and its human readable description.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressCategory {
    pub name: String,
    pub description: String,
}

impl ProgressCategory {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

pub trait ProgressDisplay: Send + Sync {
    fn set_categories(&self, categories: Vec<ProgressCategory>);
    fn start(&self);
    /// `progress` is a fraction in 0..=1.
    fn update(&self, category: &str, progress: f32);
    fn stop(&self);
    fn cancel(&self);
    fn is_cancelled(&self) -> bool;
}

const BAR_WIDTH: usize = 40;

struct ConsoleState {
    categories: Vec<ProgressCategory>,
    /// Last drawn whole percentage per category.
    drawn: Vec<Option<u32>>,
    running: bool,
}

/// Draws one text bar per category on stderr.
pub struct ConsoleProgressDisplay {
    state: Mutex<ConsoleState>,
    cancelled: AtomicBool,
}

impl Default for ConsoleProgressDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleProgressDisplay {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConsoleState {
                categories: Vec::new(),
                drawn: Vec::new(),
                running: false,
            }),
            cancelled: AtomicBool::new(false),
        }
    }

    fn render(category: &ProgressCategory, percent: u32) -> String {
        let filled = (percent as usize * BAR_WIDTH) / 100;
        format!(
            "{:<12} [{}{}] {:>3}%  {}",
            category.name,
            "#".repeat(filled),
            " ".repeat(BAR_WIDTH - filled),
            percent,
            category.description
        )
    }
}

impl ProgressDisplay for ConsoleProgressDisplay {
    fn set_categories(&self, categories: Vec<ProgressCategory>) {
        let mut state = self.state.lock().unwrap();
        state.drawn = vec![None; categories.len()];
        state.categories = categories;
    }

    fn start(&self) {
        self.state.lock().unwrap().running = true;
    }

    fn update(&self, category: &str, progress: f32) {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return;
        }
        let Some(index) = state.categories.iter().position(|c| c.name == category) else {
            return;
        };
        let percent = (progress.clamp(0.0, 1.0) * 100.0).floor() as u32;
        if state.drawn[index] == Some(percent) {
            return;
        }
        state.drawn[index] = Some(percent);
        let line = Self::render(&state.categories[index], percent);
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r{line}");
        let _ = stderr.flush();
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        if state.running {
            state.running = false;
            let _ = writeln!(std::io::stderr());
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Draws nothing but can still be cancelled.
#[derive(Default)]
pub struct SilentProgressDisplay {
    cancelled: AtomicBool,
}

impl ProgressDisplay for SilentProgressDisplay {
    fn set_categories(&self, _categories: Vec<ProgressCategory>) {}

    fn start(&self) {}

    fn update(&self, _category: &str, _progress: f32) {}

    fn stop(&self) {}

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
