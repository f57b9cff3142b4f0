//! Per-transfer control frames.
//!
//! # Wire format
//!
//! ```text
//! [1 byte: speaker]  0x00 = sending side, 0x01 = receiving side
//! [1 byte: signal]   0x00 = Accept, 0x02 = Kill, 0x03 = Finished
//! ```
//!
//! The speaker byte tells the peer which of *its* records the frame is
//! about: a frame spoken by the sending side addresses the peer's receiving
//! record and vice versa. Values 0x01 (pause) and 0x04 (resume) are reserved
//! by the transport and decode to `None`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::CONTROL_FRAME_LEN;

/// Direction of a transfer as seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "sending")]
    Sending,
    #[serde(rename = "receiving")]
    Receiving,
}

impl Direction {
    /// The direction of the same transfer on the other peer.
    pub fn opposite(self) -> Self {
        match self {
            Direction::Sending => Direction::Receiving,
            Direction::Receiving => Direction::Sending,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Direction::Sending => 0,
            Direction::Receiving => 1,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Direction::Sending),
            1 => Some(Direction::Receiving),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sending => f.write_str("sending"),
            Direction::Receiving => f.write_str("receiving"),
        }
    }
}

/// Control signal exchanged alongside file data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ControlSignal {
    #[serde(rename = "accept")]
    Accept = 0,
    #[serde(rename = "kill")]
    Kill = 2,
    #[serde(rename = "finished")]
    Finished = 3,
}

impl ControlSignal {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Maps a wire value to a signal. Unknown values yield `None`.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ControlSignal::Accept),
            2 => Some(ControlSignal::Kill),
            3 => Some(ControlSignal::Finished),
            _ => None,
        }
    }
}

/// A control signal together with who is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFrame {
    pub speaker: Direction,
    pub signal: ControlSignal,
}

impl ControlFrame {
    /// Builds the frame a local record of direction `local` sends.
    pub fn from_local(local: Direction, signal: ControlSignal) -> Self {
        Self {
            speaker: local,
            signal,
        }
    }

    /// Direction of the local record this frame refers to when received.
    pub fn addressed_direction(&self) -> Direction {
        self.speaker.opposite()
    }

    /// `true` when spoken by the receiving side (an answer to an offer).
    pub fn is_response(&self) -> bool {
        self.speaker == Direction::Receiving
    }

    pub fn encode(&self) -> [u8; CONTROL_FRAME_LEN] {
        [self.speaker.as_u8(), self.signal.as_u8()]
    }

    /// Decodes a frame, returning `None` for anything unrecognised.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let [speaker, signal] = buf.get(..CONTROL_FRAME_LEN)? else {
            return None;
        };
        let Some(speaker) = Direction::from_u8(*speaker) else {
            debug!(value = speaker, "ignoring control frame with unknown speaker");
            return None;
        };
        let Some(signal) = ControlSignal::from_u8(*signal) else {
            debug!(value = signal, "ignoring unknown control signal");
            return None;
        };
        Some(Self { speaker, signal })
    }
}

impl fmt::Display for ControlFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} from {} side", self.signal, self.speaker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_frame_addresses_receiver() {
        let frame = ControlFrame::from_local(Direction::Sending, ControlSignal::Finished);
        assert_eq!(frame.encode(), [0x00, 0x03]);
        assert_eq!(frame.addressed_direction(), Direction::Receiving);
        assert!(!frame.is_response());
    }

    #[test]
    fn receiver_frame_addresses_sender() {
        let frame = ControlFrame::from_local(Direction::Receiving, ControlSignal::Accept);
        assert_eq!(frame.encode(), [0x01, 0x00]);
        assert_eq!(frame.addressed_direction(), Direction::Sending);
        assert!(frame.is_response());
    }

    #[test]
    fn decode_known_frames() {
        let kill = ControlFrame::decode(&[0x01, 0x02]).unwrap();
        assert_eq!(kill.speaker, Direction::Receiving);
        assert_eq!(kill.signal, ControlSignal::Kill);

        let finished = ControlFrame::decode(&[0x00, 0x03]).unwrap();
        assert_eq!(finished.signal, ControlSignal::Finished);
    }

    #[test]
    fn decode_ignores_reserved_signals() {
        // pause / resume are not part of this vocabulary
        assert!(ControlFrame::decode(&[0x00, 0x01]).is_none());
        assert!(ControlFrame::decode(&[0x00, 0x04]).is_none());
        assert!(ControlFrame::decode(&[0x00, 0xFF]).is_none());
    }

    #[test]
    fn decode_ignores_unknown_speaker() {
        assert!(ControlFrame::decode(&[0x02, 0x00]).is_none());
    }

    #[test]
    fn decode_short_buffer() {
        assert!(ControlFrame::decode(&[]).is_none());
        assert!(ControlFrame::decode(&[0x00]).is_none());
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let frame = ControlFrame::decode(&[0x00, 0x00, 0xAA, 0xBB]).unwrap();
        assert_eq!(frame.signal, ControlSignal::Accept);
    }

    #[test]
    fn every_local_frame_reaches_the_opposite_record() {
        for local in [Direction::Sending, Direction::Receiving] {
            for signal in [
                ControlSignal::Accept,
                ControlSignal::Kill,
                ControlSignal::Finished,
            ] {
                let sent = ControlFrame::from_local(local, signal);
                let received = ControlFrame::decode(&sent.encode()).unwrap();
                assert_eq!(received.addressed_direction(), local.opposite());
                assert_eq!(received.signal, signal);
            }
        }
    }

    #[test]
    fn direction_serde_names() {
        assert_eq!(
            serde_json::to_string(&Direction::Sending).unwrap(),
            "\"sending\""
        );
        assert_eq!(
            serde_json::to_string(&ControlSignal::Finished).unwrap(),
            "\"finished\""
        );
    }
}
