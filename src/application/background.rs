use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(serde::Serialize, Clone, Debug)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEvent {
    IndexPercent(u8),
    StatusChange(String),
}

#[derive(serde::Serialize, Clone, Debug)]
pub struct Progress {
    #[serde(rename = "repo")]
    pub repo_id: i64,
    #[serde(rename = "ev")]
    pub event: ProgressEvent,
}

/// Carries the cancellation flag and the progress channel through an
/// indexing run. Parse workers poll `is_cancelled` between files; async
/// stages check it at await points.
#[derive(Clone)]
pub struct Pipes {
    repo_id: i64,
    cancelled: Arc<AtomicBool>,
    progress: Option<flume::Sender<Progress>>,
}

impl Pipes {
    pub fn new(repo_id: i64) -> Self {
        Self {
            repo_id,
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    pub fn with_progress(repo_id: i64) -> (Self, flume::Receiver<Progress>) {
        let (tx, rx) = flume::unbounded();
        let pipes = Self {
            repo_id,
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: Some(tx),
        };
        (pipes, rx)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn index_percent(&self, percent: u8) {
        self.send(ProgressEvent::IndexPercent(percent));
    }

    pub fn status_change(&self, status: impl Into<String>) {
        self.send(ProgressEvent::StatusChange(status.into()));
    }

    fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            _ = tx.send(Progress {
                repo_id: self.repo_id,
                event,
            });
        }
    }
}
