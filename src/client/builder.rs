use std::sync::Arc;
use tracing::{debug, info};

use super::core::ChatOrchestrator;
use crate::cache::{connect_fail_open, CacheConfig, CachedModel, GenerationCache, KvStore, NullKv};
use crate::classify::PromptClassifier;
use crate::config::GenflowConfig;
use crate::drivers::{HttpModel, LanguageModel};
use crate::pipeline::{
    DescribeImageTool, InMemoryMessageStore, MessageStore, PersistenceSink, Tool, ToolRegistry, DESCRIBE_IMAGE_TOOL,
};
use crate::routing::{RouterConfig, ToolRouter};
use crate::stream::{ReplayPacing, StreamReplayer};
use crate::{Error, ErrorContext, Result};

/// Builder for [`ChatOrchestrator`].
///
/// Everything not injected is built from the configuration: the model from
/// `provider`, the KV client from `kv` (falling back to a disabled cache when
/// unreachable), and an in-memory message store. When the router's vision
/// tool is `describe_image` and nothing registered it, the built-in
/// [`DescribeImageTool`] is registered against the primary model. Any other
/// unregistered vision tool fails the build.
pub struct ChatOrchestratorBuilder {
    config: GenflowConfig,
    model: Option<Arc<dyn LanguageModel>>,
    classifier_model: Option<Arc<dyn LanguageModel>>,
    kv: Option<Arc<dyn KvStore>>,
    store: Option<Arc<dyn MessageStore>>,
    tools: ToolRegistry,
}

impl Default for ChatOrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatOrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: GenflowConfig::default(),
            model: None,
            classifier_model: None,
            kv: None,
            store: None,
            tools: ToolRegistry::with_builtins(),
        }
    }

    pub fn config(mut self, config: GenflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cache_config(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn router_config(mut self, router: RouterConfig) -> Self {
        self.config.router = router;
        self
    }

    pub fn replay_pacing(mut self, pacing: ReplayPacing) -> Self {
        self.config.replay = pacing;
        self
    }

    /// Use `model` for the primary generation instead of an HTTP provider.
    pub fn model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Model used for classification. Defaults to the primary model.
    pub fn classifier_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.classifier_model = Some(model);
        self
    }

    pub fn kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn message_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.tools.register(tool);
        self
    }

    /// Replace the registry, built-in tools included.
    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub async fn build(self) -> Result<ChatOrchestrator> {
        let config = self.config;
        config.validate()?;

        let model: Arc<dyn LanguageModel> = match self.model {
            Some(m) => m,
            None => Arc::new(HttpModel::new(&config.provider)?),
        };

        let mut tools = self.tools;
        let vision_tool = &config.router.vision_tool;
        if !tools.contains(vision_tool) {
            if vision_tool != DESCRIBE_IMAGE_TOOL {
                return Err(Error::configuration_with_context(
                    format!("vision tool `{}` is not registered", vision_tool),
                    ErrorContext::new().with_field_path("router.vision_tool"),
                ));
            }
            debug!(tool = %vision_tool, "registering built-in vision tool");
            tools.register(Arc::new(DescribeImageTool::new(model.clone(), config.provider.model.clone())));
        }
        let classifier_model = self.classifier_model.unwrap_or_else(|| model.clone());

        let kv: Arc<dyn KvStore> = match self.kv {
            Some(kv) => kv,
            None if config.cache.enabled => connect_fail_open(&config.kv).await,
            None => Arc::new(NullKv::new()),
        };
        let cache = GenerationCache::new(config.cache.clone(), kv);
        let cached = CachedModel::new(model, cache).with_replayer(StreamReplayer::new(config.replay));

        let store: Arc<dyn MessageStore> = self.store.unwrap_or_else(|| Arc::new(InMemoryMessageStore::new()));

        info!(
            provider = %cached.provider(),
            cache = cached.cache().backend_name(),
            store = store.name(),
            tools = ?tools.names(),
            "orchestrator ready"
        );

        Ok(ChatOrchestrator {
            model: Arc::new(cached),
            classifier: PromptClassifier::new(classifier_model, config.classifier.clone()),
            router: ToolRouter::new(config.router.clone()),
            tools: Arc::new(tools),
            sink: PersistenceSink::new(store),
            default_model: config.provider.model.clone(),
        })
    }
}
