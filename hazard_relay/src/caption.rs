use crate::backend::{build_backend, InferenceBackend, InferenceError};
use crate::config::{BackendKind, Config, ConfigurationError};
use crate::frame::Frame;
use crate::prompt::PromptStore;
use std::{collections::HashMap, sync::Arc};

/// Which backend answers each of the two questions asked about a frame.
#[derive(Clone)]
pub struct BackendRoutes {
    pub describe: Arc<dyn InferenceBackend>,
    pub hazard: Arc<dyn InferenceBackend>,
}

impl BackendRoutes {
    pub fn single(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            describe: backend.clone(),
            hazard: backend,
        }
    }

    /// Builds only the providers the configuration refers to, sharing one
    /// instance when both routes point at the same kind.
    pub fn from_config(config: &Config) -> Result<Self, ConfigurationError> {
        let mut built: HashMap<BackendKind, Arc<dyn InferenceBackend>> = HashMap::new();
        let mut resolve = |kind: BackendKind| -> Result<Arc<dyn InferenceBackend>, ConfigurationError> {
            if let Some(backend) = built.get(&kind) {
                return Ok(backend.clone());
            }
            let backend = build_backend(kind, config)?;
            built.insert(kind, backend.clone());
            Ok(backend)
        };

        let describe = resolve(config.inference.get_describe_backend())?;
        let hazard = resolve(config.inference.get_hazard_backend())?;

        Ok(Self { describe, hazard })
    }
}

pub struct CaptionService {
    prompts: Arc<PromptStore>,
    routes: BackendRoutes,
}

impl CaptionService {
    pub fn new(prompts: Arc<PromptStore>, routes: BackendRoutes) -> Self {
        Self { prompts, routes }
    }

    pub fn routes(&self) -> &BackendRoutes {
        &self.routes
    }

    pub async fn describe_frame(
        &self,
        frame: &Frame,
        backend: &dyn InferenceBackend,
    ) -> Result<String, InferenceError> {
        backend.describe(frame, self.prompts.describe_prompt()).await
    }

    pub async fn is_hazardous_frame(
        &self,
        frame: &Frame,
        backend: &dyn InferenceBackend,
    ) -> Result<bool, InferenceError> {
        backend
            .classify_hazard(frame, self.prompts.hazard_prompt())
            .await
    }
}
