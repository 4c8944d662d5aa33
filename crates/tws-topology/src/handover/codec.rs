/// Resumable state codec for handover participants.
///
/// A participant's state for one device travels as a single frame: a
/// big-endian `u32` length followed by the MessagePack encoding. The frame
/// is cut into however many caller buffers it takes on the way out and
/// reassembled on the way in.
use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::types::DeviceId;

use super::participant::{HandoverParticipant, MarshalError, MarshalProgress};

const HEADER_LEN: usize = 4;

/// Largest state frame accepted by default.
pub const DEFAULT_MAX_STATE: usize = 64 * 1024;

// ── Outgoing ──────────────────────────────────────────────────────────

/// Hands out an encoded state frame one buffer at a time.
#[derive(Debug, Default)]
pub struct MarshalCursor {
    pending: Option<Bytes>,
}

impl MarshalCursor {
    /// Whether a frame is partly written.
    pub fn in_progress(&self) -> bool {
        self.pending.is_some()
    }

    /// Copy the next part of the frame into `buf`. `source` is called on the
    /// first call only; `None` means there is nothing to transfer.
    pub fn fill<T, F>(&mut self, buf: &mut [u8], source: F) -> Result<MarshalProgress, MarshalError>
    where
        T: Serialize,
        F: FnOnce() -> Option<T>,
    {
        if self.pending.is_none() {
            let Some(state) = source() else {
                return Ok(MarshalProgress::NOTHING);
            };
            self.pending = Some(encode_frame(&state)?);
        }
        let Some(pending) = self.pending.as_mut() else {
            return Ok(MarshalProgress::NOTHING);
        };
        let n = buf.len().min(pending.len());
        buf[..n].copy_from_slice(&pending[..n]);
        pending.advance(n);
        if pending.is_empty() {
            self.pending = None;
            Ok(MarshalProgress::done(n))
        } else {
            Ok(MarshalProgress::more(n))
        }
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }
}

fn encode_frame<T: Serialize>(state: &T) -> Result<Bytes, MarshalError> {
    let payload = rmp_serde::to_vec(state)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| MarshalError(format!("state of {} bytes too large", payload.len())))?;
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_u32(len);
    frame.put_slice(&payload);
    Ok(frame.freeze())
}

// ── Incoming ──────────────────────────────────────────────────────────

/// Reassembles one state frame from arbitrary slices.
///
/// Consumes exactly the bytes of the frame, so anything after it is left
/// for the caller to report.
#[derive(Debug)]
pub struct UnmarshalBuffer {
    buf: BytesMut,
    max_len: usize,
}

impl Default for UnmarshalBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STATE)
    }
}

impl UnmarshalBuffer {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
        }
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed bytes. Returns the progress and, once the frame is whole, the
    /// decoded state. An empty input before any byte arrived means the peer
    /// had nothing to send.
    pub fn feed<T: DeserializeOwned>(
        &mut self,
        input: &[u8],
    ) -> Result<(MarshalProgress, Option<T>), MarshalError> {
        if input.is_empty() {
            let progress = if self.buf.is_empty() {
                MarshalProgress::NOTHING
            } else {
                MarshalProgress::more(0)
            };
            return Ok((progress, None));
        }

        let mut consumed = 0;
        if self.buf.len() < HEADER_LEN {
            let take = (HEADER_LEN - self.buf.len()).min(input.len());
            self.buf.put_slice(&input[..take]);
            consumed += take;
            if self.buf.len() < HEADER_LEN {
                return Ok((MarshalProgress::more(consumed), None));
            }
        }

        let frame_len = HEADER_LEN + self.payload_len()?;
        let take = (frame_len - self.buf.len()).min(input.len() - consumed);
        self.buf.put_slice(&input[consumed..consumed + take]);
        consumed += take;
        trace!(have = self.buf.len(), want = frame_len, "state bytes buffered");

        if self.buf.len() < frame_len {
            return Ok((MarshalProgress::more(consumed), None));
        }
        let state = rmp_serde::from_slice(&self.buf[HEADER_LEN..])?;
        self.buf.clear();
        Ok((MarshalProgress::done(consumed), Some(state)))
    }

    fn payload_len(&self) -> Result<usize, MarshalError> {
        let mut header = &self.buf[..HEADER_LEN];
        let len = header.get_u32() as usize;
        if len > self.max_len {
            return Err(MarshalError(format!(
                "state frame of {len} bytes exceeds limit of {}",
                self.max_len
            )));
        }
        Ok(len)
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

// ── Profile adapter ───────────────────────────────────────────────────

/// Live state of one profile module, transferable per device.
///
/// Implementors only describe their snapshot; [`ProfileParticipant`] does
/// the chunking, staging and rollback.
pub trait ProfileState: Send {
    type Snapshot: Serialize + DeserializeOwned + Send;

    const NAME: &'static str;

    /// Refuse handover right now (e.g. a signalling transaction in flight).
    fn veto(&self) -> bool {
        false
    }

    /// State to transfer for `device`; `None` if there is nothing.
    fn snapshot(&self, device: DeviceId) -> Option<Self::Snapshot>;

    /// Wire a transferred snapshot into the live tables.
    fn install(&mut self, device: DeviceId, snapshot: Self::Snapshot);

    /// Give up live state that the peer now owns.
    fn release(&mut self, device: DeviceId);

    fn on_complete(&mut self, _becoming_primary: bool) {}
}

/// [`HandoverParticipant`] over a [`ProfileState`].
///
/// Unmarshalled snapshots are staged and only reach the live state at
/// commit, so aborting never has to undo anything live.
pub struct ProfileParticipant<S: ProfileState> {
    state: S,
    max_state: usize,
    outgoing: HashMap<DeviceId, MarshalCursor>,
    incoming: HashMap<DeviceId, UnmarshalBuffer>,
    staged: HashMap<DeviceId, S::Snapshot>,
}

impl<S: ProfileState> ProfileParticipant<S> {
    pub fn new(state: S) -> Self {
        Self {
            state,
            max_state: DEFAULT_MAX_STATE,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            staged: HashMap::new(),
        }
    }

    pub fn with_max_state(mut self, bytes: usize) -> Self {
        self.max_state = bytes;
        self
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Whether any session-scoped data is held.
    pub fn has_session_data(&self) -> bool {
        !(self.outgoing.is_empty() && self.incoming.is_empty() && self.staged.is_empty())
    }

    fn clear_session(&mut self) {
        self.outgoing.clear();
        self.incoming.clear();
        self.staged.clear();
    }
}

impl<S: ProfileState> HandoverParticipant for ProfileParticipant<S> {
    fn name(&self) -> &'static str {
        S::NAME
    }

    fn veto(&self) -> bool {
        self.state.veto()
    }

    fn marshal(&mut self, device: DeviceId, buf: &mut [u8]) -> Result<MarshalProgress, MarshalError> {
        let state = &self.state;
        let cursor = self.outgoing.entry(device).or_default();
        let progress = cursor.fill(buf, || state.snapshot(device))?;
        if progress.done {
            self.outgoing.remove(&device);
        }
        Ok(progress)
    }

    fn unmarshal(&mut self, device: DeviceId, buf: &[u8]) -> Result<MarshalProgress, MarshalError> {
        let max_state = self.max_state;
        let buffer = self
            .incoming
            .entry(device)
            .or_insert_with(|| UnmarshalBuffer::new(max_state));
        let (progress, snapshot) = buffer.feed(buf)?;
        if let Some(snapshot) = snapshot {
            debug!(participant = S::NAME, %device, "state staged");
            self.staged.insert(device, snapshot);
        }
        if progress.done {
            self.incoming.remove(&device);
        }
        Ok(progress)
    }

    fn commit(&mut self, device: DeviceId, becoming_primary: bool) {
        if becoming_primary {
            if let Some(snapshot) = self.staged.remove(&device) {
                self.state.install(device, snapshot);
            }
        } else {
            self.state.release(device);
        }
    }

    fn complete(&mut self, becoming_primary: bool) {
        self.clear_session();
        self.state.on_complete(becoming_primary);
    }

    fn abort(&mut self) {
        if self.has_session_data() {
            debug!(participant = S::NAME, "discarding staged state");
        }
        self.clear_session();
    }
}
