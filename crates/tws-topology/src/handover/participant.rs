/// The handover participant contract and the fixed registry of participants.
use crate::types::DeviceId;

/// Result of one marshal or unmarshal call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarshalProgress {
    /// Bytes written (marshal) or consumed (unmarshal).
    pub bytes: usize,
    /// The participant has nothing more to transfer for this device.
    pub done: bool,
}

impl MarshalProgress {
    /// Nothing to transfer.
    pub const NOTHING: MarshalProgress = MarshalProgress {
        bytes: 0,
        done: true,
    };

    pub fn done(bytes: usize) -> Self {
        Self { bytes, done: true }
    }

    pub fn more(bytes: usize) -> Self {
        Self { bytes, done: false }
    }
}

/// A participant could not produce or parse its state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct MarshalError(pub String);

impl From<rmp_serde::encode::Error> for MarshalError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        MarshalError(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for MarshalError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        MarshalError(e.to_string())
    }
}

/// A module holding state tied to the primary role.
///
/// Callbacks run to completion on the topology task and must not block.
/// `abort` must be idempotent and must leave the participant exactly as it
/// was before the session started.
pub trait HandoverParticipant: Send {
    /// Stable name; both nodes must register the same names in the same order.
    fn name(&self) -> &'static str;

    /// `true` refuses the handover right now. No side effects.
    fn veto(&self) -> bool;

    /// Write the next part of this participant's state for `device` into
    /// `buf`. Returning `done: false` asks to be called again with a fresh
    /// buffer.
    fn marshal(&mut self, device: DeviceId, buf: &mut [u8]) -> Result<MarshalProgress, MarshalError>;

    /// Consume bytes produced by the peer's `marshal` into staging.
    /// `buf` may end part-way through the state; `done` reports that the
    /// whole state for `device` has arrived.
    fn unmarshal(&mut self, device: DeviceId, buf: &[u8]) -> Result<MarshalProgress, MarshalError>;

    /// Switch ownership for `device`: install staged state when becoming
    /// primary, release the live state otherwise. Must not fail.
    fn commit(&mut self, device: DeviceId, becoming_primary: bool);

    /// Release session resources once every participant committed.
    fn complete(&mut self, becoming_primary: bool);

    /// Discard staged or partial state.
    fn abort(&mut self);
}

/// Participants in registration order. Built once, never changed while a
/// runtime owns it.
#[derive(Default)]
pub struct ParticipantRegistry {
    participants: Vec<Box<dyn HandoverParticipant>>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration.
    pub fn with(mut self, participant: impl HandoverParticipant + 'static) -> Self {
        self.register(Box::new(participant));
        self
    }

    pub fn register(&mut self, participant: Box<dyn HandoverParticipant>) {
        self.participants.push(participant);
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.participants.iter().map(|p| p.name()).collect()
    }

    /// Whether `names` lists exactly our participants in our order.
    pub fn matches(&self, names: &[String]) -> bool {
        names.len() == self.participants.len()
            && names
                .iter()
                .zip(&self.participants)
                .all(|(n, p)| n == p.name())
    }

    pub(crate) fn get(&self, idx: usize) -> &dyn HandoverParticipant {
        self.participants[idx].as_ref()
    }

    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut dyn HandoverParticipant {
        self.participants[idx].as_mut()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &dyn HandoverParticipant> {
        self.participants.iter().map(|p| p.as_ref())
    }
}

impl std::fmt::Debug for ParticipantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl HandoverParticipant for Named {
        fn name(&self) -> &'static str {
            self.0
        }
        fn veto(&self) -> bool {
            false
        }
        fn marshal(&mut self, _: DeviceId, _: &mut [u8]) -> Result<MarshalProgress, MarshalError> {
            Ok(MarshalProgress::NOTHING)
        }
        fn unmarshal(&mut self, _: DeviceId, _: &[u8]) -> Result<MarshalProgress, MarshalError> {
            Ok(MarshalProgress::NOTHING)
        }
        fn commit(&mut self, _: DeviceId, _: bool) {}
        fn complete(&mut self, _: bool) {}
        fn abort(&mut self) {}
    }

    #[test]
    fn registry_keeps_registration_order() {
        let registry = ParticipantRegistry::new()
            .with(Named("mirror"))
            .with(Named("a2dp"))
            .with(Named("hfp"));
        assert_eq!(registry.names(), vec!["mirror", "a2dp", "hfp"]);
        assert_eq!(format!("{registry:?}"), r#"["mirror", "a2dp", "hfp"]"#);
    }

    #[test]
    fn matches_requires_same_order() {
        let registry = ParticipantRegistry::new().with(Named("a2dp")).with(Named("hfp"));
        assert!(registry.matches(&["a2dp".into(), "hfp".into()]));
        assert!(!registry.matches(&["hfp".into(), "a2dp".into()]));
        assert!(!registry.matches(&["a2dp".into()]));
    }
}
