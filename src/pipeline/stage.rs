//! Ordered message pipeline.

use std::sync::Arc;

use async_trait::async_trait;

use super::message::Message;

/// One link in the message pipeline.
///
/// A stage either consumes the message or hands it on with [`Next::run`].
#[async_trait]
pub trait PipelineStage: Send + Sync {
    async fn handle(&self, message: &Message, next: Next<'_>);
}

/// Continuation to the remaining stages.
///
/// Running it consumes it, so a stage continues at most once.
pub struct Next<'a> {
    stages: &'a [Arc<dyn PipelineStage>],
}

impl<'a> Next<'a> {
    fn new(stages: &'a [Arc<dyn PipelineStage>]) -> Self {
        Self { stages }
    }

    /// Pass the message to the next stage. A no-op at the end of the chain.
    pub async fn run(self, message: &Message) {
        if let Some((stage, rest)) = self.stages.split_first() {
            stage.handle(message, Next::new(rest)).await;
        }
    }

    /// Number of stages still ahead.
    pub fn remaining(&self) -> usize {
        self.stages.len()
    }
}

/// Stages run in insertion order.
#[derive(Default, Clone)]
pub struct Pipeline {
    stages: Vec<Arc<dyn PipelineStage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage.
    pub fn with_stage(mut self, stage: Arc<dyn PipelineStage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `message` through the pipeline.
    pub async fn run(&self, message: &Message) {
        Next::new(&self.stages).run(message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::message::Author;
    use std::sync::Mutex;

    /// Records its name, then continues or stops.
    struct Recorder {
        name: &'static str,
        continue_on: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl PipelineStage for Recorder {
        async fn handle(&self, message: &Message, next: Next<'_>) {
            self.log.lock().unwrap().push(self.name);
            if self.continue_on {
                next.run(message).await;
            }
        }
    }

    fn recorder(
        name: &'static str,
        continue_on: bool,
        log: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn PipelineStage> {
        Arc::new(Recorder {
            name,
            continue_on,
            log: Arc::clone(log),
        })
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .with_stage(recorder("a", true, &log))
            .with_stage(recorder("b", true, &log))
            .with_stage(recorder("c", true, &log));

        pipeline
            .run(&Message::new(1, "hi", Author::new(1, "ada")))
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_stage_can_stop_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::new()
            .with_stage(recorder("a", true, &log))
            .with_stage(recorder("b", false, &log))
            .with_stage(recorder("c", true, &log));

        pipeline
            .run(&Message::new(1, "hi", Author::new(1, "ada")))
            .await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_empty_pipeline() {
        let pipeline = Pipeline::new();
        assert!(pipeline.is_empty());
        pipeline
            .run(&Message::new(1, "hi", Author::new(1, "ada")))
            .await;
    }
}
