//! In-process typed message dispatch
//!
//! [`MessageRouter`] maps the runtime tag of a message to the handlers
//! registered for it. Several handlers may share a tag; they run in
//! registration order. Handlers are invoked without any router lock held, so
//! a handler may itself route further messages (the leader manager does this
//! when a topology event changes leadership).
//!
//! For closed message families, [`MessageRouter::validate`] reports every
//! variant that has no handler, which lets wiring code fail fast at startup.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::trace;

/// A message that exposes a runtime tag for dispatch
pub trait Routable {
    /// Tag type, usually a field-less mirror of the message enum
    type Kind: Copy + Eq + Hash + Debug + Send + Sync + 'static;

    /// Tag of this message
    fn kind(&self) -> Self::Kind;
}

/// A closed message family whose variants can be enumerated
pub trait SealedFamily: Routable {
    /// Every tag of the family
    fn variants() -> &'static [Self::Kind];
}

type Handler<M> = Arc<dyn Fn(&M) + Send + Sync>;

/// Variants of a sealed family left without a route
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("No route registered for {missing:?}")]
pub struct MissingRoutes<K: Debug> {
    /// Tags without any handler
    pub missing: Vec<K>,
}

/// Dispatches messages to handlers keyed by message tag
pub struct MessageRouter<M: Routable> {
    routes: RwLock<HashMap<M::Kind, Vec<Handler<M>>>>,
}

impl<M: Routable> MessageRouter<M> {
    /// Create a router with no routes
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for one message tag
    pub fn add_route<F>(&self, kind: M::Kind, handler: F)
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        self.routes
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register the same handler for several tags
    pub fn add_routes<F>(&self, kinds: &[M::Kind], handler: F)
    where
        F: Fn(&M) + Send + Sync + 'static,
    {
        let handler: Handler<M> = Arc::new(handler);
        let mut routes = self.routes.write();
        for kind in kinds {
            routes.entry(*kind).or_default().push(handler.clone());
        }
    }

    /// Dispatch to every handler registered for the message's tag
    ///
    /// Returns the number of handlers invoked.
    pub fn route(&self, message: &M) -> usize {
        let kind = message.kind();
        let handlers = match self.routes.read().get(&kind) {
            Some(handlers) => handlers.clone(),
            None => {
                trace!(?kind, "no route for message");
                return 0;
            }
        };
        for handler in &handlers {
            handler(message);
        }
        handlers.len()
    }

    /// Number of handlers registered for a tag
    pub fn route_count(&self, kind: M::Kind) -> usize {
        self.routes.read().get(&kind).map_or(0, Vec::len)
    }
}

impl<M: SealedFamily> MessageRouter<M> {
    /// Check that every variant of the family has at least one handler
    pub fn validate(&self) -> Result<(), MissingRoutes<M::Kind>> {
        let routes = self.routes.read();
        let missing: Vec<M::Kind> = M::variants()
            .iter()
            .filter(|kind| routes.get(*kind).map_or(true, Vec::is_empty))
            .copied()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(MissingRoutes { missing })
        }
    }
}

impl<M: Routable> Default for MessageRouter<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        Hello(u32),
        Bye,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum PingKind {
        Hello,
        Bye,
    }

    impl Routable for Ping {
        type Kind = PingKind;
        fn kind(&self) -> PingKind {
            match self {
                Ping::Hello(_) => PingKind::Hello,
                Ping::Bye => PingKind::Bye,
            }
        }
    }

    impl SealedFamily for Ping {
        fn variants() -> &'static [PingKind] {
            &[PingKind::Hello, PingKind::Bye]
        }
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let router = MessageRouter::<Ping>::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let log = log.clone();
            router.add_route(PingKind::Hello, move |msg| {
                if let Ping::Hello(n) = msg {
                    log.lock().push(format!("{name}:{n}"));
                }
            });
        }

        assert_eq!(router.route(&Ping::Hello(7)), 2);
        assert_eq!(router.route(&Ping::Bye), 0);
        assert_eq!(*log.lock(), vec!["first:7", "second:7"]);
    }

    #[test]
    fn test_validate_reports_missing_variants() {
        let router = MessageRouter::<Ping>::new();
        router.add_route(PingKind::Hello, |_| {});

        let err = router.validate().unwrap_err();
        assert_eq!(err.missing, vec![PingKind::Bye]);

        router.add_route(PingKind::Bye, |_| {});
        assert!(router.validate().is_ok());
    }

    #[test]
    fn test_handler_may_route_reentrantly() {
        let router = Arc::new(MessageRouter::<Ping>::new());
        let byes = Arc::new(Mutex::new(0));

        let weak = Arc::downgrade(&router);
        router.add_route(PingKind::Hello, move |_| {
            if let Some(router) = weak.upgrade() {
                router.route(&Ping::Bye);
            }
        });
        let counter = byes.clone();
        router.add_routes(&[PingKind::Bye], move |_| *counter.lock() += 1);

        router.route(&Ping::Hello(1));
        assert_eq!(*byes.lock(), 1);
        assert_eq!(router.route_count(PingKind::Bye), 1);
    }
}
