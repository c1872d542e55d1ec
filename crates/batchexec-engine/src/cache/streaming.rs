// Streaming-sink Execution Cache (spec.md §4.4): wraps a user-supplied
// sink that receives `(key, result)` pairs as they're produced. Useful
// when a host process wants to observe progress without also maintaining a
// disk cache. Reads always miss.

use super::ExecutionCache;
use async_trait::async_trait;
use batchexec_common::errors::CacheCorruptionError;
use batchexec_common::model::AfterStepResult;

/// Receives every step result as it is written, regardless of slug.
pub trait StreamSink: Send + Sync {
    fn on_result(&self, slug: &str, key: &str, result: &AfterStepResult);
}

pub struct StreamingCache<S: StreamSink> {
    sink: S,
}

impl<S: StreamSink> StreamingCache<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl<S: StreamSink + 'static> ExecutionCache for StreamingCache<S> {
    async fn get_step_result(&self, _slug: &str, _key: &str) -> Result<Option<AfterStepResult>, CacheCorruptionError> {
        Ok(None)
    }

    async fn set_step_result(&self, slug: &str, key: &str, result: &AfterStepResult) -> anyhow::Result<()> {
        self.sink.on_result(slug, key, result);
        Ok(())
    }

    async fn clear(&self, _slug: &str) -> anyhow::Result<()> {
        Ok(())
    }
}
