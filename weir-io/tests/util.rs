use std::sync::Arc;

use parking_lot::Mutex;
use weir_io::{Completion, Outcome, RequestId};

pub fn init_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Trace)
        .is_test(true)
        .try_init();
}

/// [`Recorder`] collects the completions of every request built with
/// [`Recorder::hook`], in completion order.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    completions: Arc<Mutex<Vec<Completion>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(&self) -> impl FnOnce(Completion) + Send + 'static {
        let completions = Arc::clone(&self.completions);
        move |completion| completions.lock().push(completion)
    }

    pub fn len(&self) -> usize {
        self.completions.lock().len()
    }

    pub fn get(&self, id: RequestId) -> Option<Completion> {
        self.completions
            .lock()
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    /// Returns how many completions were recorded for `id`.
    pub fn count(&self, id: RequestId) -> usize {
        self.completions
            .lock()
            .iter()
            .filter(|c| c.id() == id)
            .count()
    }

    #[allow(dead_code)]
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.completions
            .lock()
            .iter()
            .map(|c| c.outcome())
            .collect()
    }
}
