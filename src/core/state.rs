use std::sync::Arc;

use sqlx::PgPool;

use crate::core::config::Settings;
use crate::services::grading::GradingPipeline;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    db: PgPool,
    pipeline: GradingPipeline,
}

impl AppState {
    pub(crate) fn new(settings: Settings, db: PgPool, pipeline: GradingPipeline) -> Self {
        Self { inner: Arc::new(InnerState { settings, db, pipeline }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn db(&self) -> &PgPool {
        &self.inner.db
    }

    pub(crate) fn pipeline(&self) -> &GradingPipeline {
        &self.inner.pipeline
    }
}
