//! Hierarchical open/close hooks.
//! A registry is created per level (volume collection, volume, writer); each one
//! links to its parent. Dispatch runs the hooks of the starting level in
//! registration order, then walks up the chain. Every hook runs, errors are joined.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{MultiError, Result};

pub type Hook<T> = Arc<dyn Fn(&T) -> Result<()> + Send + Sync>;

pub struct Events<T> {
    parent: Option<Arc<Events<T>>>,
    on_open: RwLock<Vec<Hook<T>>>,
    on_close: RwLock<Vec<Hook<T>>>,
}

impl<T> Events<T> {
    pub fn new() -> Arc<Self> { Arc::new(Self { parent: None, on_open: RwLock::new(Vec::new()), on_close: RwLock::new(Vec::new()) }) }

    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self { parent: Some(self.clone()), on_open: RwLock::new(Vec::new()), on_close: RwLock::new(Vec::new()) })
    }

    pub fn on_open<F>(&self, f: F)
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.on_open.write().push(Arc::new(f));
    }

    pub fn on_close<F>(&self, f: F)
    where
        F: Fn(&T) -> Result<()> + Send + Sync + 'static,
    {
        self.on_close.write().push(Arc::new(f));
    }

    pub fn dispatch_open(&self, subject: &T) -> Result<()> {
        let mut errs = MultiError::new();
        self.walk(|ev| ev.on_open.read().clone(), subject, &mut errs);
        errs.into_result()
    }

    pub fn dispatch_close(&self, subject: &T) -> Result<()> {
        let mut errs = MultiError::new();
        self.walk(|ev| ev.on_close.read().clone(), subject, &mut errs);
        errs.into_result()
    }

    fn walk<F>(&self, hooks_of: F, subject: &T, errs: &mut MultiError)
    where
        F: Fn(&Events<T>) -> Vec<Hook<T>>,
    {
        let mut level = Some(self);
        while let Some(ev) = level {
            // Hooks are cloned out of the lock, a hook may register further hooks.
            for hook in hooks_of(ev) {
                errs.append(hook(subject));
            }
            level = ev.parent.as_deref();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use parking_lot::Mutex;

    #[test]
    fn dispatch_order_and_join() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let collection = Events::<String>::new();
        let volume = collection.child();
        let writer = volume.child();

        for (name, ev) in [("collection", &collection), ("volume", &volume), ("writer", &writer)] {
            for i in 1..=2 {
                let log = log.clone();
                ev.on_close(move |subject: &String| {
                    log.lock().push(format!("{}-{}:{}", name, i, subject));
                    if i == 2 { Err(StorageError::Store(format!("{} hook failed", name))) } else { Ok(()) }
                });
            }
        }

        let err = writer.dispatch_close(&"w1".to_string()).unwrap_err();
        assert_eq!(
            *log.lock(),
            vec!["writer-1:w1", "writer-2:w1", "volume-1:w1", "volume-2:w1", "collection-1:w1", "collection-2:w1"]
        );
        match err {
            StorageError::Multi(m) => assert_eq!(m.len(), 3),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn open_starts_at_given_level() {
        let count = Arc::new(Mutex::new(0));
        let root = Events::<u32>::new();
        let child = root.child();
        let c = count.clone();
        root.on_open(move |_| { *c.lock() += 1; Ok(()) });
        let c = count.clone();
        child.on_open(move |_| { *c.lock() += 10; Ok(()) });

        root.dispatch_open(&1).unwrap();
        assert_eq!(*count.lock(), 1);
        child.dispatch_open(&1).unwrap();
        assert_eq!(*count.lock(), 12);
    }
}
