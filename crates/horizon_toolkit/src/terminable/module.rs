use super::TerminableRegistry;

/// A group of resources that knows how to bind itself into a registry.
///
/// Typically a feature of a plugin (a listener set, a periodic job) that is
/// set up in one place and torn down with the registry it was given.
pub trait TerminableModule {
    fn setup(&self, registry: &TerminableRegistry);
}

impl<F> TerminableModule for F
where
    F: Fn(&TerminableRegistry),
{
    fn setup(&self, registry: &TerminableRegistry) {
        self(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminable::{terminable_fn, Terminable};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FlagModule {
        closed: Arc<AtomicBool>,
    }

    impl TerminableModule for FlagModule {
        fn setup(&self, registry: &TerminableRegistry) {
            let closed = self.closed.clone();
            registry.bind(terminable_fn(move || {
                closed.store(true, Ordering::SeqCst);
                Ok(())
            }));
        }
    }

    #[test]
    fn module_resources_close_with_the_registry() {
        let registry = TerminableRegistry::new();
        let module = registry.bind_module(FlagModule {
            closed: Arc::new(AtomicBool::new(false)),
        });
        assert_eq!(registry.len(), 1);

        registry.close().unwrap();
        assert!(module.closed.load(Ordering::SeqCst));
    }
}
