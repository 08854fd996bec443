use std::path::PathBuf;
use std::sync::Arc;

use crate::engine::BrowserPool;
use crate::pipeline::Pipeline;
use crate::usage::UsageMeter;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub meter: Arc<UsageMeter>,
    pub engines: Arc<BrowserPool>,
    /// Directory served under `/artifacts`.
    pub artifacts_root: PathBuf,
}
