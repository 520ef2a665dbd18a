//! Capability → executor dispatch.
//!
//! Resolution is two-step: any capability starting with [`MODEL_PREFIX`] goes
//! to the model executor, whatever the exact table says; everything else is
//! looked up by exact name. Unknown capabilities resolve to `None`.

use std::collections::HashMap;
use std::sync::Arc;

use super::Executor;
use super::echo::EchoExecutor;
use super::llm::ModelQueryExecutor;
use super::shell::ShellExecutor;
use super::tts::SpeechExecutor;
use crate::config::EngineConfig;
use crate::error::ExecError;

/// Capability prefix routed to the model executor. The rest names the model.
pub const MODEL_PREFIX: &str = "LLM::";

/// Model name carried by a `LLM::<model>` capability.
pub fn model_name(capability: &str) -> Option<&str> {
    capability.strip_prefix(MODEL_PREFIX)
}

/// Capabilities with a dedicated executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    DebugEcho,
    ShellBash,
    ShellCmdBash,
    TtsKokoro,
}

impl Builtin {
    pub const ALL: [Builtin; 4] = [
        Builtin::DebugEcho,
        Builtin::ShellBash,
        Builtin::ShellCmdBash,
        Builtin::TtsKokoro,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::DebugEcho => "debug::echo",
            Self::ShellBash => "shell::bash",
            Self::ShellCmdBash => "shellcmd::bash",
            Self::TtsKokoro => "TTS::kokoro",
        }
    }

    pub fn parse(capability: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.as_str() == capability)
    }
}

/// Registry of executors keyed by capability.
pub struct ExecutorRegistry {
    model: Arc<dyn Executor>,
    exact: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    /// Empty exact table; `model` serves every `LLM::` capability.
    pub fn new(model: Arc<dyn Executor>) -> Self {
        Self {
            model,
            exact: HashMap::new(),
        }
    }

    /// Registry with every built-in capability wired to its executor.
    pub fn builtin(cfg: &EngineConfig) -> Result<Self, ExecError> {
        let mut registry = Self::new(Arc::new(ModelQueryExecutor::new(
            cfg.ollama_url.clone(),
            cfg.llm_flush_interval,
        )?));
        for builtin in Builtin::ALL {
            let executor: Arc<dyn Executor> = match builtin {
                Builtin::DebugEcho => Arc::new(EchoExecutor),
                Builtin::ShellBash => Arc::new(ShellExecutor::streaming()),
                Builtin::ShellCmdBash => Arc::new(ShellExecutor::buffered()),
                Builtin::TtsKokoro => Arc::new(SpeechExecutor::new(
                    cfg.tts_url.clone(),
                    cfg.tts_api_key.clone(),
                )),
            };
            registry.register(builtin.as_str(), executor);
        }
        Ok(registry)
    }

    /// Add or replace an exact-match entry.
    pub fn register(&mut self, capability: impl Into<String>, executor: Arc<dyn Executor>) {
        let capability = capability.into();
        tracing::debug!(capability = %capability, executor = executor.name(), "Registered executor");
        self.exact.insert(capability, executor);
    }

    pub fn resolve(&self, capability: &str) -> Option<Arc<dyn Executor>> {
        if model_name(capability).is_some() {
            return Some(Arc::clone(&self.model));
        }
        self.exact.get(capability).cloned()
    }

    /// Exact-match capability names, sorted.
    pub fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self.exact.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ProgressSink;
    use crate::error::ExecError;
    use crate::exec::{Completion, TaskContext};
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Executor for Named {
        fn name(&self) -> &str {
            self.0
        }
        async fn execute(
            &self,
            _ctx: &TaskContext,
            _progress: &dyn ProgressSink,
        ) -> Result<Completion, ExecError> {
            Ok(Completion::Success {
                output: serde_json::json!(self.0),
            })
        }
    }

    #[test]
    fn model_prefix_wins_over_exact_entry() {
        let mut registry = ExecutorRegistry::new(Arc::new(Named("model")));
        registry.register("LLM::special", Arc::new(Named("literal")));
        registry.register("shell::bash", Arc::new(Named("shell")));

        assert_eq!(registry.resolve("LLM::special").unwrap().name(), "model");
        assert_eq!(registry.resolve("LLM::llama3").unwrap().name(), "model");
        assert_eq!(registry.resolve("shell::bash").unwrap().name(), "shell");
    }

    #[test]
    fn unknown_capability_is_none() {
        let registry = ExecutorRegistry::new(Arc::new(Named("model")));
        assert!(registry.resolve("unknown::x").is_none());
        // The prefix is case-sensitive.
        assert!(registry.resolve("llm::llama3").is_none());
    }

    #[test]
    fn builtin_registry_covers_every_builtin() {
        let registry = ExecutorRegistry::builtin(&EngineConfig::default()).unwrap();
        for builtin in Builtin::ALL {
            assert!(registry.resolve(builtin.as_str()).is_some(), "{builtin:?}");
        }
        assert_eq!(
            registry.capabilities(),
            vec!["TTS::kokoro", "debug::echo", "shell::bash", "shellcmd::bash"]
        );
    }

    #[test]
    fn model_name_extraction() {
        assert_eq!(model_name("LLM::qwen2.5:7b"), Some("qwen2.5:7b"));
        assert_eq!(model_name("LLM::"), Some(""));
        assert_eq!(model_name("shell::bash"), None);
        assert_eq!(Builtin::parse("debug::echo"), Some(Builtin::DebugEcho));
        assert_eq!(Builtin::parse("debug::echoes"), None);
    }
}
