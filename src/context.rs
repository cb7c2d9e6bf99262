//! Generation context lifecycle
//!
//! A context is one utterance's stream on one connection. Its state only
//! moves forward and the terminal states are sticky, so a late `done` for a
//! context that was already canceled cannot resurrect it.

use crate::protocol::{Result, TtsError};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Index of a connection inside the pool.
pub type ConnectionId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContextState {
    Created = 0,
    Streaming = 1,
    Completed = 2,
    Canceled = 3,
    Failed = 4,
}

impl ContextState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Streaming,
            2 => Self::Completed,
            3 => Self::Canceled,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }

    fn can_become(&self, next: ContextState) -> bool {
        match (self, next) {
            (Self::Created, Self::Streaming) => true,
            (Self::Created | Self::Streaming, n) => n.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One logical generation stream.
#[derive(Debug)]
pub struct GenerationContext {
    id: String,
    connection: ConnectionId,
    /// Activation epoch of the pool when the utterance was accepted
    epoch: u64,
    /// Ramp the first audio in; set for utterances that barged in
    fade_in: bool,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl GenerationContext {
    pub fn new(connection: ConnectionId, epoch: u64, fade_in: bool) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), connection, epoch, fade_in)
    }

    pub fn with_id(id: String, connection: ConnectionId, epoch: u64, fade_in: bool) -> Self {
        Self {
            id,
            connection,
            epoch,
            fade_in,
            state: AtomicU8::new(ContextState::Created as u8),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn fade_in(&self) -> bool {
        self.fade_in
    }

    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_canceled(&self) -> bool {
        self.state() == ContextState::Canceled
    }

    /// Attempt a transition. Returns false when the move is not allowed,
    /// which includes every move out of a terminal state.
    pub fn transition(&self, next: ContextState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !ContextState::from_u8(current).can_become(next) {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn start_streaming(&self) -> bool {
        self.transition(ContextState::Streaming)
    }

    pub fn complete(&self) -> bool {
        self.transition(ContextState::Completed)
    }

    pub fn fail(&self) -> bool {
        self.transition(ContextState::Failed)
    }

    /// Marks the context canceled and wakes whoever is streaming it.
    ///
    /// The state flips before the token fires, so by the time any waiter
    /// observes cancellation every playback check already refuses its
    /// frames.
    pub fn cancel(&self) -> bool {
        let moved = self.transition(ContextState::Canceled);
        if moved {
            self.cancel.cancel();
        }
        moved
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Open contexts of one connection, plus the one currently streaming.
#[derive(Debug, Default)]
pub struct ContextRegistry {
    open: HashMap<String, Arc<GenerationContext>>,
    current: Option<String>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a context and makes it current. Identifiers are unique per
    /// connection.
    pub fn register(&mut self, ctx: Arc<GenerationContext>) -> Result<()> {
        if self.open.contains_key(ctx.id()) {
            return Err(TtsError::DuplicateContext(ctx.id().to_string()));
        }
        self.current = Some(ctx.id().to_string());
        self.open.insert(ctx.id().to_string(), ctx);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Arc<GenerationContext>> {
        self.open.get(id)
    }

    pub fn current(&self) -> Option<&Arc<GenerationContext>> {
        self.current.as_ref().and_then(|id| self.open.get(id))
    }

    pub fn deregister(&mut self, id: &str) -> Option<Arc<GenerationContext>> {
        if self.current.as_deref() == Some(id) {
            self.current = None;
        }
        self.open.remove(id)
    }

    /// Removes and returns the current context.
    pub fn take_current(&mut self) -> Option<Arc<GenerationContext>> {
        let id = self.current.take()?;
        self.open.remove(&id)
    }

    /// Drops every open context, returning them so callers can cancel them.
    pub fn clear(&mut self) -> Vec<Arc<GenerationContext>> {
        self.current = None;
        self.open.drain().map(|(_, ctx)| ctx).collect()
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_forward_transitions() {
        let ctx = GenerationContext::new(0, 1, false);
        assert_eq!(ctx.state(), ContextState::Created);
        assert!(ctx.start_streaming());
        assert!(!ctx.start_streaming());
        assert!(ctx.complete());
        assert_eq!(ctx.state(), ContextState::Completed);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let ctx = GenerationContext::new(0, 1, false);
        ctx.start_streaming();
        assert!(ctx.cancel());
        assert!(!ctx.complete());
        assert!(!ctx.fail());
        assert!(!ctx.cancel());
        assert!(!ctx.start_streaming());
        assert_eq!(ctx.state(), ContextState::Canceled);

        let failed = GenerationContext::new(0, 1, false);
        assert!(failed.fail());
        assert!(!failed.cancel());
        assert!(!failed.is_canceled());
    }

    #[test]
    fn test_created_can_finish_directly() {
        let ctx = GenerationContext::new(0, 1, false);
        assert!(ctx.complete());

        let ctx = GenerationContext::new(0, 1, false);
        assert!(ctx.cancel());
        assert!(ctx.is_canceled());
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiters_after_flag() {
        let ctx = Arc::new(GenerationContext::new(3, 7, true));
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                ctx.cancelled().await;
                ctx.is_canceled()
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.cancel();
        let saw_flag = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(saw_flag);
        assert_eq!(ctx.connection(), 3);
        assert_eq!(ctx.epoch(), 7);
        assert!(ctx.fade_in());
    }

    #[test]
    fn test_unique_ids() {
        let a = GenerationContext::new(0, 0, false);
        let b = GenerationContext::new(0, 0, false);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = ContextRegistry::new();
        let ctx = Arc::new(GenerationContext::with_id("x".into(), 0, 0, false));
        registry.register(ctx.clone()).unwrap();

        let dup = Arc::new(GenerationContext::with_id("x".into(), 0, 0, false));
        assert!(matches!(
            registry.register(dup),
            Err(TtsError::DuplicateContext(id)) if id == "x"
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_current_tracking() {
        let mut registry = ContextRegistry::new();
        let a = Arc::new(GenerationContext::with_id("a".into(), 0, 0, false));
        let b = Arc::new(GenerationContext::with_id("b".into(), 0, 0, false));
        registry.register(a).unwrap();
        registry.register(b).unwrap();
        assert_eq!(registry.current().map(|c| c.id()), Some("b"));

        assert!(registry.deregister("a").is_some());
        assert_eq!(registry.current().map(|c| c.id()), Some("b"));

        let taken = registry.take_current().unwrap();
        assert_eq!(taken.id(), "b");
        assert!(registry.current().is_none());
        assert!(registry.is_empty());

        registry
            .register(Arc::new(GenerationContext::with_id("c".into(), 0, 0, false)))
            .unwrap();
        assert_eq!(registry.clear().len(), 1);
        assert!(registry.get("c").is_none());
    }
}
