//! Scripted authenticator
//!
//! Replays prepared event sequences, one per prompt. Used by tests and by
//! the `approve` authentication mode, where every prompt succeeds at once.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{AuthEvent, AuthEventSender, Authenticator, Availability, PromptInfo};

#[derive(Debug, Clone)]
enum Script {
    Emit(Vec<AuthEvent>),
    /// Emit nothing and keep the prompt up until the gate stops listening
    Hold,
}

pub struct ScriptedAuthenticator {
    scripts: Mutex<VecDeque<Script>>,
    /// Played once the queue is empty
    fallback: Script,
    availability: Availability,
    calls: AtomicUsize,
    prompts: Mutex<Vec<PromptInfo>>,
}

impl ScriptedAuthenticator {
    /// No prepared scripts; an unscripted prompt is dismissed by the system.
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback: Script::Emit(Vec::new()),
            availability: Availability::Available,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every unscripted prompt succeeds immediately.
    pub fn approving() -> Self {
        Self {
            fallback: Script::Emit(vec![AuthEvent::Succeeded]),
            ..Self::new()
        }
    }

    /// Queue the events for the next unscripted prompt.
    pub fn then(self, events: Vec<AuthEvent>) -> Self {
        self.push(Script::Emit(events));
        self
    }

    /// Queue a prompt that waits until withdrawn.
    pub fn then_hold(self) -> Self {
        self.push(Script::Hold);
        self
    }

    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    /// Number of prompts shown so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompt text of every prompt shown so far.
    pub fn prompts(&self) -> Vec<PromptInfo> {
        match self.prompts.lock() {
            Ok(prompts) => prompts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, script: Script) {
        match self.scripts.lock() {
            Ok(mut scripts) => scripts.push_back(script),
            Err(poisoned) => poisoned.into_inner().push_back(script),
        }
    }

    fn next_script(&self) -> Script {
        let next = match self.scripts.lock() {
            Ok(mut scripts) => scripts.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        };
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

impl Default for ScriptedAuthenticator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Authenticator for ScriptedAuthenticator {
    fn id(&self) -> &str {
        "scripted"
    }

    fn availability(&self) -> Availability {
        self.availability
    }

    async fn prompt(&self, info: &PromptInfo, events: AuthEventSender) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.prompts.lock() {
            Ok(mut prompts) => prompts.push(info.clone()),
            Err(poisoned) => poisoned.into_inner().push(info.clone()),
        }

        match self.next_script() {
            Script::Emit(script) => {
                for event in script {
                    if !events.send(event).await {
                        return;
                    }
                }
            }
            Script::Hold => events.closed().await,
        }
    }
}
