// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use runa_model::{Block, Message};

/// Whether a hook lets the turn proceed.
pub enum HookFlow {
    Continue,
    Halt { reason: String },
}

/// What a `postModel` hook decided about the model's content blocks.
pub enum PostModelAction {
    Keep,
    /// Rewrite the blocks the turn continues with.
    Replace(Vec<Block>),
    Halt { reason: String },
}

pub type PreModelHook =
    Arc<dyn Fn(Vec<Message>) -> BoxFuture<'static, anyhow::Result<HookFlow>> + Send + Sync>;
pub type PostModelHook =
    Arc<dyn Fn(Vec<Block>) -> BoxFuture<'static, anyhow::Result<PostModelAction>> + Send + Sync>;
pub type MessagesChangedHook = Arc<dyn Fn(usize) -> BoxFuture<'static, ()> + Send + Sync>;

/// Ordered template-level hook chains.
///
/// Hooks run sequentially in declaration order.  A hook error is reported
/// and the turn continues with the original payload; only an explicit
/// `Halt` return aborts.
#[derive(Default, Clone)]
pub struct HookSet {
    pub pre_model: Vec<PreModelHook>,
    pub post_model: Vec<PostModelHook>,
    pub messages_changed: Vec<MessagesChangedHook>,
}

impl HookSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre_model<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HookFlow>> + Send + 'static,
    {
        self.pre_model.push(Arc::new(move |m| Box::pin(hook(m))));
        self
    }

    pub fn post_model<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<Block>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<PostModelAction>> + Send + 'static,
    {
        self.post_model.push(Arc::new(move |b| Box::pin(hook(b))));
        self
    }

    pub fn messages_changed<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.messages_changed
            .push(Arc::new(move |n| Box::pin(hook(n))));
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn hooks_accumulate_in_declaration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let set = HookSet::new()
            .pre_model(move |_m| {
                let o = Arc::clone(&o1);
                async move {
                    o.lock().unwrap().push(1);
                    Ok(HookFlow::Continue)
                }
            })
            .pre_model(move |_m| {
                let o = Arc::clone(&o2);
                async move {
                    o.lock().unwrap().push(2);
                    Ok(HookFlow::Continue)
                }
            });
        for hook in &set.pre_model {
            let _ = hook(vec![]).await;
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn messages_changed_hook_receives_count() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let set = HookSet::new().messages_changed(move |n| {
            let s = Arc::clone(&s);
            async move {
                s.store(n, Ordering::SeqCst);
            }
        });
        set.messages_changed[0](7).await;
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
