use std::{collections::BTreeMap, sync::Arc};

use log::{debug, info};
use parking_lot::RwLock;

use super::{
    Detection, DubboProtocol, FrameError, NsheadProtocol, Protocol, ProtocolId, PushProtocol,
    StandardProtocol,
};

/// Builds a codec for one protocol id.
pub trait ProtocolFactory: Send + Sync {
    fn id(&self) -> ProtocolId;

    fn name(&self) -> &'static str;

    /// Higher wins when two factories claim the same id.
    fn priority(&self) -> i32 {
        0
    }

    fn create(&self) -> Arc<dyn Protocol>;
}

#[derive(Debug, Clone)]
pub struct ProtocolDescriptor {
    pub id: ProtocolId,
    pub priority: i32,
    pub name: &'static str,
    pub codec: Arc<dyn Protocol>,
}

/// Maps protocol ids to codecs.
///
/// Entries are unique per id. A registration only replaces an existing entry
/// when its priority is strictly higher, so among equals the first one stays.
#[derive(Debug, Default)]
pub struct ProtocolRegistry {
    entries: RwLock<BTreeMap<ProtocolId, ProtocolDescriptor>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in codec.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(&BuiltIn(|| Arc::new(StandardProtocol) as Arc<dyn Protocol>));
        registry.register(&BuiltIn(|| Arc::new(NsheadProtocol::json()) as Arc<dyn Protocol>));
        registry.register(&BuiltIn(|| Arc::new(NsheadProtocol::protobuf()) as Arc<dyn Protocol>));
        registry.register(&BuiltIn(|| Arc::new(PushProtocol) as Arc<dyn Protocol>));
        registry.register(&BuiltIn(|| Arc::new(DubboProtocol) as Arc<dyn Protocol>));
        registry
    }

    /// Returns `true` when the factory's codec was installed.
    pub fn register(&self, factory: &dyn ProtocolFactory) -> bool {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&factory.id()) {
            if existing.priority >= factory.priority() {
                debug!(
                    "keeping protocol {} ({}) over {} with priority {}",
                    existing.id,
                    existing.name,
                    factory.name(),
                    factory.priority()
                );
                return false;
            }
        }

        info!(
            "registered protocol {} ({}) with priority {}",
            factory.id(),
            factory.name(),
            factory.priority()
        );
        entries.insert(
            factory.id(),
            ProtocolDescriptor {
                id: factory.id(),
                priority: factory.priority(),
                name: factory.name(),
                codec: factory.create(),
            },
        );
        true
    }

    pub fn resolve(&self, id: ProtocolId) -> Result<Arc<dyn Protocol>, FrameError> {
        self.entries
            .read()
            .get(&id)
            .map(|d| Arc::clone(&d.codec))
            .ok_or(FrameError::UnknownProtocol(id))
    }

    pub fn descriptor(&self, id: ProtocolId) -> Option<ProtocolDescriptor> {
        self.entries.read().get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<ProtocolId> {
        self.entries.read().keys().copied().collect()
    }

    /// Asks every codec, highest priority first, whether `prefix` is theirs.
    ///
    /// `NeedMore` is returned while at least one codec still might match.
    pub fn detect(&self, prefix: &[u8]) -> Detection<Arc<dyn Protocol>> {
        let entries = self.entries.read();
        let mut ordered: Vec<&ProtocolDescriptor> = entries.values().collect();
        ordered.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        let mut undecided = false;
        for descriptor in ordered {
            match descriptor.codec.detect(prefix) {
                Detection::Match(()) => return Detection::Match(Arc::clone(&descriptor.codec)),
                Detection::NeedMore => undecided = true,
                Detection::NoMatch => {}
            }
        }

        if undecided {
            Detection::NeedMore
        } else {
            Detection::NoMatch
        }
    }
}

struct BuiltIn<F>(F);

impl<F> ProtocolFactory for BuiltIn<F>
where
    F: Fn() -> Arc<dyn Protocol> + Send + Sync,
{
    fn id(&self) -> ProtocolId {
        (self.0)().id()
    }

    fn name(&self) -> &'static str {
        (self.0)().name()
    }

    fn create(&self) -> Arc<dyn Protocol> {
        (self.0)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::{Request, Response},
        protocol::{self, Decoded},
    };

    #[derive(Debug)]
    struct Named(&'static str);

    impl Protocol for Named {
        fn id(&self) -> ProtocolId {
            protocol::STANDARD
        }

        fn name(&self) -> &'static str {
            self.0
        }

        fn detect(&self, _prefix: &[u8]) -> Detection {
            Detection::NoMatch
        }

        fn encode_request(&self, _request: &Request) -> Result<Vec<u8>, FrameError> {
            Ok(Vec::new())
        }

        fn encode_response(&self, _response: &Response) -> Result<Vec<u8>, FrameError> {
            Ok(Vec::new())
        }

        fn decode(&self, _buf: &[u8]) -> Result<Decoded, FrameError> {
            Ok(Decoded::Insufficient)
        }
    }

    struct NamedFactory(&'static str, i32);

    impl ProtocolFactory for NamedFactory {
        fn id(&self) -> ProtocolId {
            protocol::STANDARD
        }

        fn name(&self) -> &'static str {
            self.0
        }

        fn priority(&self) -> i32 {
            self.1
        }

        fn create(&self) -> Arc<dyn Protocol> {
            Arc::new(Named(self.0))
        }
    }

    #[test]
    fn higher_priority_wins() {
        let registry = ProtocolRegistry::new();
        assert!(registry.register(&NamedFactory("low", 1)));
        assert!(registry.register(&NamedFactory("high", 5)));
        assert!(!registry.register(&NamedFactory("lower", 2)));

        assert_eq!(registry.resolve(protocol::STANDARD).unwrap().name(), "high");
    }

    #[test]
    fn equal_priority_keeps_first() {
        let registry = ProtocolRegistry::new();
        assert!(registry.register(&NamedFactory("first", 3)));
        assert!(!registry.register(&NamedFactory("second", 3)));

        assert_eq!(registry.resolve(protocol::STANDARD).unwrap().name(), "first");
    }

    #[test]
    fn unknown_id() {
        let registry = ProtocolRegistry::new();
        assert_eq!(
            registry.resolve(42).unwrap_err(),
            FrameError::UnknownProtocol(42)
        );
    }

    #[test]
    fn defaults_detect_each_format() {
        let registry = ProtocolRegistry::with_defaults();
        assert_eq!(
            registry.ids(),
            vec![
                protocol::STANDARD,
                protocol::NSHEAD_JSON,
                protocol::NSHEAD_PROTO,
                protocol::PUSH,
                protocol::DUBBO
            ]
        );

        let request = Request::new("echo", "Echo", br#""hi""#.to_vec());
        for id in registry.ids() {
            let codec = registry.resolve(id).unwrap();
            let frame = codec.encode_request(&request).unwrap();
            match registry.detect(&frame) {
                Detection::Match(found) => assert_eq!(found.id(), id),
                other => panic!("protocol {id} not detected: {other:?}"),
            }
        }
    }

    #[test]
    fn detection_needs_more_then_gives_up() {
        let registry = ProtocolRegistry::with_defaults();
        assert!(matches!(registry.detect(b""), Detection::NeedMore));
        assert!(matches!(registry.detect(b"RL"), Detection::NeedMore));
        assert!(matches!(
            registry.detect(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n"),
            Detection::NoMatch
        ));
    }
}
