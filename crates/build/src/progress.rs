use std::sync::Arc;

use tokio::sync::{
    broadcast::{self, Receiver, Sender},
    Mutex,
};

const PROGRESS_QUEUE_LEN: usize = 1000;

#[derive(Clone, Debug)]
pub struct BuildProgress {
    pub image: String,
    pub phase: BuildProgressPhase,
    pub value: u64,
    pub total: u64,
    pub message: Option<String>,
}

impl BuildProgress {
    pub fn new(image: &str) -> Self {
        BuildProgress {
            image: image.to_string(),
            phase: BuildProgressPhase::Waiting,
            value: 0,
            total: 0,
            message: None,
        }
    }

    pub fn start_acquire(&mut self, source: &str) {
        self.phase = BuildProgressPhase::Acquiring;
        self.value = 0;
        self.total = 0;
        self.message = Some(source.to_string());
    }

    pub fn downloading(&mut self, downloaded: u64, total: Option<u64>) {
        self.phase = BuildProgressPhase::Acquiring;
        self.value = downloaded;
        self.total = total.unwrap_or(0);
    }

    pub fn start_transform(&mut self, tool: &str) {
        self.phase = BuildProgressPhase::Transforming;
        self.message = Some(tool.to_string());
    }

    pub fn start_hashing(&mut self) {
        self.phase = BuildProgressPhase::Hashing;
        self.message = None;
    }

    pub fn start_compressing(&mut self, size: u64) {
        self.phase = BuildProgressPhase::Compressing;
        self.value = 0;
        self.total = size;
        self.message = None;
    }

    pub fn complete(&mut self, size: u64) {
        self.phase = BuildProgressPhase::Complete;
        self.value = size;
        self.total = size;
        self.message = None;
    }

    pub fn fail(&mut self, error: &str) {
        self.phase = BuildProgressPhase::Failed;
        self.message = Some(error.to_string());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildProgressPhase {
    Waiting,
    Acquiring,
    Transforming,
    Hashing,
    Compressing,
    Complete,
    Failed,
}

#[derive(Clone)]
pub struct BuildProgressContext {
    sender: Sender<BuildProgress>,
}

impl BuildProgressContext {
    pub fn create() -> (BuildProgressContext, Receiver<BuildProgress>) {
        let (sender, receiver) = broadcast::channel(PROGRESS_QUEUE_LEN);
        (BuildProgressContext::new(sender), receiver)
    }

    pub fn new(sender: Sender<BuildProgress>) -> BuildProgressContext {
        BuildProgressContext { sender }
    }

    pub fn subscribe(&self) -> Receiver<BuildProgress> {
        self.sender.subscribe()
    }

    pub fn update(&self, progress: &BuildProgress) {
        let _ = self.sender.send(progress.clone());
    }
}

/// Progress of one image, published to a shared context on every update.
#[derive(Clone)]
pub struct BoundProgress {
    context: BuildProgressContext,
    instance: Arc<Mutex<BuildProgress>>,
}

impl BoundProgress {
    pub fn new(context: BuildProgressContext, progress: BuildProgress) -> BoundProgress {
        BoundProgress {
            context,
            instance: Arc::new(Mutex::new(progress)),
        }
    }

    pub async fn update(&self, function: impl FnOnce(&mut BuildProgress)) {
        let mut progress = self.instance.lock().await;
        function(&mut progress);
        self.context.update(&progress);
    }

    pub fn update_blocking(&self, function: impl FnOnce(&mut BuildProgress)) {
        let mut progress = self.instance.blocking_lock();
        function(&mut progress);
        self.context.update(&progress);
    }

    pub async fn snapshot(&self) -> BuildProgress {
        self.instance.lock().await.clone()
    }
}
