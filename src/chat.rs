//! Chat turn formatting.
//!
//! Turns a logical `(role, content)` message into the prompt text the loaded
//! model expects. The engine renders each turn; this module decides when the
//! system preamble is due: once per loaded session, ahead of the first turn.

use llama_engine::{NativeEngine, Role};

use crate::engine::state::LoadedModel;

/// A chat message with role and content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Render one turn for `loaded`, emitting the system turn first if this
/// session has not sent it yet.
pub(crate) fn render_turn(
    engine: &mut dyn NativeEngine,
    loaded: &mut LoadedModel,
    role: Role,
    content: &str,
    system_prompt: &str,
) -> String {
    let mut prompt = String::new();
    if !loaded.preamble_sent {
        prompt.push_str(&engine.format_turn(loaded.model, Role::System, system_prompt));
        loaded.preamble_sent = true;
    }
    prompt.push_str(&engine.format_turn(loaded.model, role, content));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use llama_engine::{
        ContextHandle, GenerationCursor, ModelHandle, Result as EngineResult, SamplerHandle,
    };

    /// Only the formatter is exercised here.
    struct TagEngine;

    impl NativeEngine for TagEngine {
        fn load_model(&mut self, _path: &str) -> Option<ModelHandle> {
            unimplemented!()
        }
        fn new_context(&mut self, _model: ModelHandle) -> Option<ContextHandle> {
            unimplemented!()
        }
        fn new_sampler(&mut self, _model: ModelHandle) -> Option<SamplerHandle> {
            unimplemented!()
        }
        fn format_turn(&mut self, _model: ModelHandle, role: Role, content: &str) -> String {
            format!("[{role}]{content}")
        }
        fn context_capacity(&self, _context: ContextHandle) -> usize {
            unimplemented!()
        }
        fn init_completion(
            &mut self,
            _context: ContextHandle,
            _sampler: SamplerHandle,
            _text: &str,
            _max_tokens: usize,
        ) -> EngineResult<usize> {
            unimplemented!()
        }
        fn next_fragment(
            &mut self,
            _context: ContextHandle,
            _sampler: SamplerHandle,
            _max_tokens: usize,
            _cursor: &mut GenerationCursor,
        ) -> EngineResult<Option<String>> {
            unimplemented!()
        }
        fn clear_cache(&mut self, _context: ContextHandle) {}
        fn release_context(&mut self, _context: ContextHandle) -> EngineResult<()> {
            Ok(())
        }
        fn release_model(&mut self, _model: ModelHandle) -> EngineResult<()> {
            Ok(())
        }
        fn release_sampler(&mut self, _sampler: SamplerHandle) -> EngineResult<()> {
            Ok(())
        }
        fn set_temperature(&mut self, _temperature: f32) {}
        fn set_top_p(&mut self, _top_p: f32) {}
        fn set_max_tokens(&mut self, _max_tokens: usize) {}
    }

    fn loaded() -> LoadedModel {
        LoadedModel {
            model: ModelHandle::new(1).unwrap(),
            context: ContextHandle::new(2).unwrap(),
            sampler: SamplerHandle::new(3).unwrap(),
            epoch: 1,
            preamble_sent: false,
        }
    }

    #[test]
    fn first_turn_carries_system_preamble() {
        let mut model = loaded();
        let text = render_turn(&mut TagEngine, &mut model, Role::User, "hi", "be brief");
        assert_eq!(text, "[system]be brief[user]hi");
        assert!(model.preamble_sent);
    }

    #[test]
    fn later_turns_are_content_only() {
        let mut model = loaded();
        render_turn(&mut TagEngine, &mut model, Role::User, "hi", "be brief");
        let text = render_turn(&mut TagEngine, &mut model, Role::User, "again", "ignored");
        assert_eq!(text, "[user]again");
    }

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").content, "a");
    }
}
