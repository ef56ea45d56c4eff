//! Listener callbacks.

use std::sync::Arc;

use kache_core::{ObjectKey, Resource};

/// Callbacks a listener may implement. Every method defaults to a no-op.
#[async_trait::async_trait]
pub trait ResourceEventHandler: Send + Sync + 'static {
    async fn on_add(&self, _obj: &Resource) -> anyhow::Result<()> { Ok(()) }

    async fn on_update(&self, _old: &Resource, _new: &Resource) -> anyhow::Result<()> { Ok(()) }

    async fn on_delete(&self, _obj: &Resource) -> anyhow::Result<()> { Ok(()) }
}

type ObjFn = Box<dyn Fn(&Resource) -> anyhow::Result<()> + Send + Sync>;
type PairFn = Box<dyn Fn(&Resource, &Resource) -> anyhow::Result<()> + Send + Sync>;

/// Closure-backed handler; unset callbacks do nothing.
#[derive(Default)]
pub struct HandlerFuncs {
    add: Option<ObjFn>,
    update: Option<PairFn>,
    delete: Option<ObjFn>,
}

impl HandlerFuncs {
    pub fn new() -> Self { Self::default() }

    pub fn on_add<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource, &Resource) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete<F>(mut self, f: F) -> Self
    where
        F: Fn(&Resource) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.delete = Some(Box::new(f));
        self
    }
}

#[async_trait::async_trait]
impl ResourceEventHandler for HandlerFuncs {
    async fn on_add(&self, obj: &Resource) -> anyhow::Result<()> {
        match &self.add {
            Some(f) => f(obj),
            None => Ok(()),
        }
    }

    async fn on_update(&self, old: &Resource, new: &Resource) -> anyhow::Result<()> {
        match &self.update {
            Some(f) => f(old, new),
            None => Ok(()),
        }
    }

    async fn on_delete(&self, obj: &Resource) -> anyhow::Result<()> {
        match &self.delete {
            Some(f) => f(obj),
            None => Ok(()),
        }
    }
}

/// A change as delivered to listeners.
#[derive(Debug, Clone)]
pub enum Notification {
    Add(Arc<Resource>),
    Update { old: Arc<Resource>, new: Arc<Resource> },
    Delete(Arc<Resource>),
}

impl Notification {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Notification::Add(o) | Notification::Delete(o) => &o.key,
            Notification::Update { new, .. } => &new.key,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Notification::Add(_) => "add",
            Notification::Update { .. } => "update",
            Notification::Delete(_) => "delete",
        }
    }

    pub(crate) async fn deliver(&self, handler: &dyn ResourceEventHandler) -> anyhow::Result<()> {
        match self {
            Notification::Add(o) => handler.on_add(o).await,
            Notification::Update { old, new } => handler.on_update(old, new).await,
            Notification::Delete(o) => handler.on_delete(o).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kache_core::ResourceVersion;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn obj() -> Resource { Resource::new(ObjectKey::cluster("a"), ResourceVersion(1), serde_json::json!({})) }

    #[tokio::test]
    async fn missing_callbacks_are_noops() {
        let h = HandlerFuncs::new();
        let o = obj();
        assert!(ResourceEventHandler::on_add(&h, &o).await.is_ok());
        assert!(ResourceEventHandler::on_update(&h, &o, &o).await.is_ok());
        assert!(ResourceEventHandler::on_delete(&h, &o).await.is_ok());
    }

    #[tokio::test]
    async fn set_callbacks_fire() {
        let adds = Arc::new(AtomicUsize::new(0));
        let h = HandlerFuncs::new().on_add({
            let adds = adds.clone();
            move |_| {
                adds.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        Notification::Add(Arc::new(obj())).deliver(&h).await.unwrap();
        Notification::Delete(Arc::new(obj())).deliver(&h).await.unwrap();
        assert_eq!(adds.load(Ordering::SeqCst), 1);
    }
}
