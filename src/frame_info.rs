//! Per-frame bookkeeping types: saved snapshots and player inputs.

use crate::Frame;

/// A serialized snapshot of the game state for a single frame.
///
/// The `data` holds the encoded state bytes, `frame` indicates the
/// associated frame number and `checksum` is an optional caller-provided
/// checksum used for desync detection and sync testing.
#[derive(Debug, Clone)]
pub struct GameState {
    /// The frame to which this snapshot belongs.
    pub frame: Frame,
    /// The encoded game state. Empty if nothing was saved.
    pub data: Vec<u8>,
    /// The checksum of the game state, if one was provided on save.
    pub checksum: Option<u64>,
}

impl Default for GameState {
    fn default() -> Self {
        Self {
            frame: Frame::NULL,
            data: Vec::new(),
            checksum: None,
        }
    }
}

/// An input for a single player in a single frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PlayerInput<I>
where
    I: Copy + Clone + PartialEq,
{
    /// The frame this input belongs to. [`Frame::NULL`] represents an
    /// invalid frame.
    pub frame: Frame,
    /// The input struct given by the user.
    pub input: I,
}

impl<I: Copy + Clone + PartialEq + Default> PlayerInput<I> {
    /// Creates a new `PlayerInput` with the given frame and input.
    pub fn new(frame: Frame, input: I) -> Self {
        Self { frame, input }
    }

    /// Creates a blank input with the default value for the input type.
    #[must_use]
    pub fn blank_input(frame: Frame) -> Self {
        Self {
            frame,
            input: I::default(),
        }
    }

    /// Compares two inputs. With `input_only`, the frame numbers are
    /// ignored, which is how mispredictions are detected: a prediction for
    /// frame `n` counts as correct if its input matches the confirmed one,
    /// regardless of which frame the prediction was seeded from.
    pub(crate) fn equal(&self, other: &Self, input_only: bool) -> bool {
        (input_only || self.frame == other.frame) && self.input == other.input
    }
}
