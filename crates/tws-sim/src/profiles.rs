/// Simulated profile modules whose live tables move during handover.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tws_topology::{DeviceId, ParticipantRegistry, ProfileParticipant, ProfileState};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-handset A2DP stream: channel, codec config and sink position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaStream {
    pub cid: u16,
    pub codec: String,
    pub volume: u8,
    pub sequence: u32,
}

#[derive(Debug, Default)]
struct MediaTables {
    streams: HashMap<DeviceId, MediaStream>,
    busy: bool,
}

/// Media profile. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct Media(Arc<Mutex<MediaTables>>);

impl Media {
    pub fn start_stream(&self, device: DeviceId, cid: u16) {
        lock(&self.0).streams.insert(
            device,
            MediaStream {
                cid,
                codec: "aac".into(),
                volume: 10,
                sequence: 0,
            },
        );
    }

    /// Advance the sink position, as a playing stream would.
    pub fn tick(&self, device: DeviceId) {
        if let Some(stream) = lock(&self.0).streams.get_mut(&device) {
            stream.sequence = stream.sequence.wrapping_add(1);
        }
    }

    pub fn stream(&self, device: DeviceId) -> Option<MediaStream> {
        lock(&self.0).streams.get(&device).cloned()
    }

    pub fn set_busy(&self, busy: bool) {
        lock(&self.0).busy = busy;
    }
}

impl ProfileState for Media {
    type Snapshot = MediaStream;
    const NAME: &'static str = "media";

    fn veto(&self) -> bool {
        lock(&self.0).busy
    }

    fn snapshot(&self, device: DeviceId) -> Option<MediaStream> {
        self.stream(device)
    }

    fn install(&mut self, device: DeviceId, snapshot: MediaStream) {
        lock(&self.0).streams.insert(device, snapshot);
    }

    fn release(&mut self, device: DeviceId) {
        lock(&self.0).streams.remove(&device);
    }
}

/// Voice profile: speaker and mic gain per handset.
#[derive(Debug, Clone, Default)]
pub struct Voice(Arc<Mutex<HashMap<DeviceId, (u8, u8)>>>);

impl Voice {
    pub fn set_gains(&self, device: DeviceId, speaker: u8, mic: u8) {
        lock(&self.0).insert(device, (speaker, mic));
    }

    pub fn gains(&self, device: DeviceId) -> Option<(u8, u8)> {
        lock(&self.0).get(&device).copied()
    }
}

impl ProfileState for Voice {
    type Snapshot = (u8, u8);
    const NAME: &'static str = "voice";

    fn snapshot(&self, device: DeviceId) -> Option<(u8, u8)> {
        self.gains(device)
    }

    fn install(&mut self, device: DeviceId, gains: (u8, u8)) {
        lock(&self.0).insert(device, gains);
    }

    fn release(&mut self, device: DeviceId) {
        lock(&self.0).remove(&device);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlayStatus {
    #[default]
    Stopped,
    Playing,
    Paused,
}

/// Per-handset AVRCP session: what the handset last reported and which
/// notifications it registered for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSession {
    pub play_status: PlayStatus,
    pub absolute_volume: u8,
    /// Registered notification event ids, one bit each.
    pub notifications: u16,
    /// Transaction label of the next command.
    pub next_label: u8,
}

#[derive(Debug, Default)]
struct RemoteTables {
    sessions: HashMap<DeviceId, RemoteSession>,
    /// A command is awaiting its response; the label would be lost.
    pending_command: bool,
}

/// AVRCP remote control profile. Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct Remote(Arc<Mutex<RemoteTables>>);

impl Remote {
    pub const PLAYBACK_STATUS_CHANGED: u16 = 1 << 1;
    pub const VOLUME_CHANGED: u16 = 1 << 13;

    pub fn connect(&self, device: DeviceId, notifications: u16) {
        lock(&self.0).sessions.insert(
            device,
            RemoteSession {
                play_status: PlayStatus::Stopped,
                absolute_volume: 64,
                notifications,
                next_label: 0,
            },
        );
    }

    /// The handset reported a new play status.
    pub fn play_status(&self, device: DeviceId, status: PlayStatus) {
        if let Some(session) = lock(&self.0).sessions.get_mut(&device) {
            session.play_status = status;
        }
    }

    /// Send a volume change; uses up one transaction label.
    pub fn set_volume(&self, device: DeviceId, volume: u8) {
        if let Some(session) = lock(&self.0).sessions.get_mut(&device) {
            session.absolute_volume = volume.min(0x7f);
            session.next_label = (session.next_label + 1) & 0x0f;
        }
    }

    pub fn session(&self, device: DeviceId) -> Option<RemoteSession> {
        lock(&self.0).sessions.get(&device).cloned()
    }

    pub fn set_pending_command(&self, pending: bool) {
        lock(&self.0).pending_command = pending;
    }
}

impl ProfileState for Remote {
    type Snapshot = RemoteSession;
    const NAME: &'static str = "remote";

    fn veto(&self) -> bool {
        lock(&self.0).pending_command
    }

    fn snapshot(&self, device: DeviceId) -> Option<RemoteSession> {
        self.session(device)
    }

    fn install(&mut self, device: DeviceId, session: RemoteSession) {
        lock(&self.0).sessions.insert(device, session);
    }

    fn release(&mut self, device: DeviceId) {
        lock(&self.0).sessions.remove(&device);
    }
}

/// Same participants, same order, on both earbuds.
pub fn registry(media: &Media, voice: &Voice, remote: &Remote) -> ParticipantRegistry {
    ParticipantRegistry::new()
        .with(ProfileParticipant::new(media.clone()))
        .with(ProfileParticipant::new(voice.clone()))
        .with(ProfileParticipant::new(remote.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tws_topology::HandoverParticipant;

    const PHONE: DeviceId = DeviceId::new(0);

    fn marshal_all(participant: &mut impl HandoverParticipant) -> Vec<u8> {
        let mut wire = Vec::new();
        let mut buf = [0u8; 8];
        loop {
            let progress = participant.marshal(PHONE, &mut buf).unwrap();
            wire.extend_from_slice(&buf[..progress.bytes]);
            if progress.done {
                return wire;
            }
        }
    }

    #[test]
    fn remote_session_is_staged_until_commit() {
        let from = Remote::default();
        from.connect(PHONE, Remote::PLAYBACK_STATUS_CHANGED | Remote::VOLUME_CHANGED);
        from.play_status(PHONE, PlayStatus::Playing);
        from.set_volume(PHONE, 90);
        let to = Remote::default();

        let wire = marshal_all(&mut ProfileParticipant::new(from.clone()));
        let mut incoming = ProfileParticipant::new(to.clone());
        incoming.unmarshal(PHONE, &wire).unwrap();
        assert_eq!(to.session(PHONE), None, "nothing installed before commit");

        incoming.commit(PHONE, true);
        incoming.complete(true);
        let session = to.session(PHONE).unwrap();
        assert_eq!(session.play_status, PlayStatus::Playing);
        assert_eq!(session.absolute_volume, 90);
        assert_eq!(session.next_label, 1);
        assert_eq!(session, from.session(PHONE).unwrap());
    }

    #[test]
    fn outstanding_command_vetoes() {
        let remote = Remote::default();
        let participant = ProfileParticipant::new(remote.clone());
        assert!(!participant.veto());
        remote.set_pending_command(true);
        assert!(participant.veto());
    }
}
