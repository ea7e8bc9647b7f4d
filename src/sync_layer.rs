//! State snapshots and input synchronization across all players.
//!
//! The sync layer owns the ring of saved states and one input queue per
//! player. Sessions drive it through request-as-data: saving and loading
//! produces a [`FramelockRequest`] for the user to fulfill rather than
//! invoking a callback.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::frame_info::{GameState, PlayerInput};
use crate::input_queue::InputQueue;
use crate::network::messages::ConnectionStatus;
use crate::wire::{self, Serde};
use crate::{Config, Frame, FramelockError, FramelockRequest, InputStatus, InputVec, PlayerHandle};

/// A handle to one slot of the save state ring, handed out inside
/// [`FramelockRequest::SaveGameState`] and
/// [`FramelockRequest::LoadGameState`].
///
/// The cell stores the state in serialized form, so the session never needs
/// the user's state type to be cloneable.
#[derive(Debug)]
pub struct GameStateCell<S> {
    cell: Arc<Mutex<GameState>>,
    _marker: PhantomData<fn() -> S>,
}

impl<S> Clone for GameStateCell<S> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<S> Default for GameStateCell<S> {
    fn default() -> Self {
        Self {
            cell: Arc::new(Mutex::new(GameState::default())),
            _marker: PhantomData,
        }
    }
}

impl<S: Serde> GameStateCell<S> {
    /// Saves the given state into the cell, replacing whatever was there.
    /// The `checksum` is optional; without it, desync detection and sync
    /// testing cannot cover this frame.
    pub fn save(&self, frame: Frame, data: &S, checksum: Option<u64>) {
        let mut state = self.cell.lock();
        assert!(frame.is_valid());
        state.frame = frame;
        state.data.clear();
        data.serialize(&mut state.data);
        state.checksum = checksum;
    }

    /// Deserializes the stored state back out of the cell.
    pub fn load(&self) -> Result<S, FramelockError> {
        let state = self.cell.lock();
        if state.frame.is_null() {
            return Err(FramelockError::StateMissing { frame: Frame::NULL });
        }
        Ok(wire::decode(&state.data)?)
    }

    pub(crate) fn frame(&self) -> Frame {
        self.cell.lock().frame
    }

    pub(crate) fn checksum(&self) -> Option<u64> {
        self.cell.lock().checksum
    }
}

/// The ring of save state cells, one slot per frame in the prediction
/// window plus one.
struct SavedStates<S> {
    states: Vec<GameStateCell<S>>,
}

impl<S> SavedStates<S> {
    fn new(max_prediction: usize) -> Self {
        let num_cells = max_prediction + 1;
        let mut states = Vec::with_capacity(num_cells);
        for _ in 0..num_cells {
            states.push(GameStateCell::default());
        }
        Self { states }
    }

    fn get_cell(&self, frame: Frame) -> GameStateCell<S> {
        assert!(frame.is_valid());
        let pos = frame.as_i32() as usize % self.states.len();
        self.states[pos].clone()
    }
}

pub(crate) struct SyncLayer<T>
where
    T: Config,
{
    num_players: usize,
    max_prediction: usize,
    saved_states: SavedStates<T::State>,
    last_confirmed_frame: Frame,
    last_saved_frame: Frame,
    current_frame: Frame,
    input_queues: Vec<InputQueue<T>>,
}

impl<T: Config> SyncLayer<T> {
    pub(crate) fn new(num_players: usize, max_prediction: usize) -> Self {
        Self {
            num_players,
            max_prediction,
            saved_states: SavedStates::new(max_prediction),
            last_confirmed_frame: Frame::NULL,
            last_saved_frame: Frame::NULL,
            current_frame: Frame::FIRST,
            input_queues: (0..num_players).map(|_| InputQueue::new()).collect(),
        }
    }

    pub(crate) fn current_frame(&self) -> Frame {
        self.current_frame
    }

    pub(crate) fn advance_frame(&mut self) {
        self.current_frame += 1;
    }

    pub(crate) fn last_confirmed_frame(&self) -> Frame {
        self.last_confirmed_frame
    }

    pub(crate) fn last_saved_frame(&self) -> Frame {
        self.last_saved_frame
    }

    pub(crate) fn save_current_state(&mut self) -> FramelockRequest<T> {
        self.last_saved_frame = self.current_frame;
        FramelockRequest::SaveGameState {
            cell: self.saved_states.get_cell(self.current_frame),
            frame: self.current_frame,
        }
    }

    pub(crate) fn set_frame_delay(&mut self, player_handle: PlayerHandle, delay: u32) {
        assert!(player_handle.as_usize() < self.num_players);
        self.input_queues[player_handle.as_usize()].set_frame_delay(delay);
    }

    pub(crate) fn reset_prediction(&mut self) {
        for queue in &mut self.input_queues {
            queue.reset_prediction();
        }
    }

    /// Rolls the current frame back to `frame_to_load` and returns the load
    /// request for the user.
    ///
    /// # Panics
    ///
    /// Panics if the frame is outside the prediction window or its slot has
    /// been overwritten; sessions bound their rollback depth so that this
    /// cannot happen.
    pub(crate) fn load_frame(&mut self, frame_to_load: Frame) -> FramelockRequest<T> {
        assert!(frame_to_load.is_valid(), "cannot load null frame");
        assert!(
            frame_to_load < self.current_frame,
            "must load a frame in the past (frame to load is {frame_to_load}, current frame is {})",
            self.current_frame
        );
        assert!(
            frame_to_load >= self.current_frame - self.max_prediction as i32,
            "cannot load a frame outside of the prediction window"
        );

        let cell = self.saved_states.get_cell(frame_to_load);
        assert_eq!(
            cell.frame(),
            frame_to_load,
            "saved state slot no longer holds frame {frame_to_load}"
        );
        self.current_frame = frame_to_load;

        FramelockRequest::LoadGameState {
            cell,
            frame: frame_to_load,
        }
    }

    /// Adds a local input for the current frame. Returns the frame the
    /// input landed on after frame delay, or [`Frame::NULL`] if dropped.
    pub(crate) fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: PlayerInput<T::Input>,
    ) -> Frame {
        assert_eq!(input.frame, self.current_frame);
        self.input_queues[player_handle.as_usize()].add_input(input)
    }

    pub(crate) fn add_remote_input(
        &mut self,
        player_handle: PlayerHandle,
        input: PlayerInput<T::Input>,
    ) {
        self.input_queues[player_handle.as_usize()].add_input(input);
    }

    /// The inputs to simulate the current frame with, one per player in
    /// handle order. Disconnected players get blanks, everyone else a
    /// confirmed or predicted input.
    pub(crate) fn synchronized_inputs(
        &mut self,
        connect_status: &[ConnectionStatus],
    ) -> InputVec<T::Input> {
        let current_frame = self.current_frame;
        connect_status
            .iter()
            .zip(&mut self.input_queues)
            .map(|(status, queue)| {
                if status.disconnected && status.last_frame < current_frame {
                    (T::Input::default(), InputStatus::Disconnected)
                } else {
                    queue.input(current_frame)
                }
            })
            .collect()
    }

    /// The confirmed inputs of all players for an already-confirmed frame.
    /// Disconnected players past their last frame yield blanks.
    pub(crate) fn confirmed_inputs(
        &self,
        frame: Frame,
        connect_status: &[ConnectionStatus],
    ) -> Result<Vec<PlayerInput<T::Input>>, FramelockError> {
        let mut inputs = Vec::with_capacity(connect_status.len());
        for (i, status) in connect_status.iter().enumerate() {
            if status.disconnected && status.last_frame < frame {
                inputs.push(PlayerInput::blank_input(Frame::NULL));
            } else {
                inputs.push(self.input_queues[i].confirmed_input(frame).ok_or(
                    FramelockError::MissingInput {
                        handle: PlayerHandle::new(i),
                        frame,
                    },
                )?);
            }
        }
        Ok(inputs)
    }

    /// Raises the confirmed frame watermark and discards inputs that can no
    /// longer be rolled back to. With sparse saving, confirmation cannot
    /// move past the last actually saved frame.
    pub(crate) fn set_last_confirmed_frame(&mut self, mut frame: Frame, sparse_saving: bool) {
        let mut first_incorrect = Frame::NULL;
        for queue in &self.input_queues {
            first_incorrect = first_incorrect.max(queue.first_incorrect_frame());
        }

        if sparse_saving {
            frame = frame.min(self.last_saved_frame);
        }
        frame = frame.min(self.current_frame);

        assert!(
            first_incorrect.is_null() || first_incorrect >= frame,
            "confirming a frame with an unresolved misprediction before it"
        );

        self.last_confirmed_frame = frame;
        if self.last_confirmed_frame > Frame::FIRST {
            for queue in &mut self.input_queues {
                queue.discard_confirmed_frames(frame - 1);
            }
        }
    }

    /// The earliest frame any input queue mispredicted, taking a prior
    /// candidate into account. [`Frame::NULL`] means the simulation is
    /// consistent.
    pub(crate) fn check_simulation_consistency(&self, mut first_incorrect: Frame) -> Frame {
        for queue in &self.input_queues {
            let incorrect = queue.first_incorrect_frame();
            if incorrect.is_valid() && (first_incorrect.is_null() || incorrect < first_incorrect) {
                first_incorrect = incorrect;
            }
        }
        first_incorrect
    }

    /// The cell holding the state of exactly `frame`, if it still does.
    pub(crate) fn saved_state_by_frame(
        &self,
        frame: Frame,
    ) -> Result<GameStateCell<T::State>, FramelockError> {
        let cell = self.saved_states.get_cell(frame);
        if cell.frame() == frame {
            Ok(cell)
        } else {
            Err(FramelockError::StateMissing { frame })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{ByteReader, DecodeError};

    #[derive(Copy, Clone, PartialEq, Default, Debug)]
    struct TestInput {
        value: u8,
    }

    impl Serde for TestInput {
        fn serde_size(&self) -> usize {
            1
        }
        fn serialize(&self, out: &mut Vec<u8>) {
            out.push(self.value);
        }
        fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
            Ok(Self { value: r.read_u8()? })
        }
    }

    #[derive(Default, Debug, PartialEq)]
    struct TestState {
        score: u32,
    }

    impl Serde for TestState {
        fn serde_size(&self) -> usize {
            4
        }
        fn serialize(&self, out: &mut Vec<u8>) {
            self.score.serialize(out);
        }
        fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
            Ok(Self {
                score: r.read_u32()?,
            })
        }
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type State = TestState;
        type Address = usize;
    }

    #[test]
    fn cell_round_trips_state() {
        let cell: GameStateCell<TestState> = GameStateCell::default();
        cell.save(Frame::new(3), &TestState { score: 42 }, Some(7));
        assert_eq!(cell.frame(), Frame::new(3));
        assert_eq!(cell.checksum(), Some(7));
        assert_eq!(cell.load().unwrap(), TestState { score: 42 });
    }

    #[test]
    fn loading_an_empty_cell_fails() {
        let cell: GameStateCell<TestState> = GameStateCell::default();
        assert!(matches!(
            cell.load(),
            Err(FramelockError::StateMissing { .. })
        ));
    }

    #[test]
    fn save_then_load_through_requests() {
        let mut sync = SyncLayer::<TestConfig>::new(2, 8);
        let request = sync.save_current_state();
        let FramelockRequest::SaveGameState { cell, frame } = request else {
            panic!("expected a save request");
        };
        assert_eq!(frame, Frame::FIRST);
        cell.save(frame, &TestState { score: 1 }, None);

        sync.advance_frame();
        sync.advance_frame();

        let request = sync.load_frame(Frame::FIRST);
        let FramelockRequest::LoadGameState { cell, frame } = request else {
            panic!("expected a load request");
        };
        assert_eq!(frame, Frame::FIRST);
        assert_eq!(cell.load().unwrap(), TestState { score: 1 });
        assert_eq!(sync.current_frame(), Frame::FIRST);
    }

    #[test]
    fn saved_state_by_frame_reports_missing_slots() {
        let mut sync = SyncLayer::<TestConfig>::new(2, 8);
        assert!(matches!(
            sync.saved_state_by_frame(Frame::new(0)),
            Err(FramelockError::StateMissing { .. })
        ));
        if let FramelockRequest::SaveGameState { cell, frame } = sync.save_current_state() {
            cell.save(frame, &TestState::default(), None);
        }
        assert!(sync.saved_state_by_frame(Frame::new(0)).is_ok());
    }

    #[test]
    #[should_panic]
    fn loading_outside_prediction_window_panics() {
        let mut sync = SyncLayer::<TestConfig>::new(2, 2);
        for _ in 0..5 {
            if let FramelockRequest::SaveGameState { cell, frame } = sync.save_current_state() {
                cell.save(frame, &TestState::default(), None);
            }
            sync.advance_frame();
        }
        sync.load_frame(Frame::new(1));
    }

    #[test]
    fn synchronized_inputs_mark_disconnected_players() {
        let mut sync = SyncLayer::<TestConfig>::new(2, 8);
        sync.add_local_input(
            PlayerHandle::new(0),
            PlayerInput::new(Frame::FIRST, TestInput { value: 3 }),
        );
        let statuses = vec![
            ConnectionStatus {
                disconnected: false,
                last_frame: Frame::FIRST,
            },
            ConnectionStatus {
                disconnected: true,
                last_frame: Frame::NULL,
            },
        ];
        let inputs = sync.synchronized_inputs(&statuses);
        assert_eq!(inputs[0], (TestInput { value: 3 }, InputStatus::Confirmed));
        assert_eq!(inputs[1], (TestInput::default(), InputStatus::Disconnected));
    }

    #[test]
    fn confirmed_inputs_error_on_missing_input() {
        let sync = SyncLayer::<TestConfig>::new(2, 8);
        let statuses = vec![ConnectionStatus::default(); 2];
        assert!(matches!(
            sync.confirmed_inputs(Frame::new(0), &statuses),
            Err(FramelockError::MissingInput { .. })
        ));
    }

    #[test]
    fn confirming_discards_old_inputs() {
        let mut sync = SyncLayer::<TestConfig>::new(1, 8);
        for frame in 0..10 {
            sync.add_local_input(
                PlayerHandle::new(0),
                PlayerInput::new(Frame::new(frame), TestInput { value: frame as u8 }),
            );
            sync.advance_frame();
        }
        sync.set_last_confirmed_frame(Frame::new(6), false);
        assert_eq!(sync.last_confirmed_frame(), Frame::new(6));
        let statuses = vec![ConnectionStatus {
            disconnected: false,
            last_frame: Frame::new(9),
        }];
        // frame 6 and later must still be available
        let confirmed = sync.confirmed_inputs(Frame::new(6), &statuses).unwrap();
        assert_eq!(confirmed[0].input.value, 6);
    }

    #[test]
    fn sparse_saving_clamps_confirmation_to_saved_frame() {
        let mut sync = SyncLayer::<TestConfig>::new(1, 8);
        if let FramelockRequest::SaveGameState { cell, frame } = sync.save_current_state() {
            cell.save(frame, &TestState::default(), None);
        }
        for frame in 0..5 {
            sync.add_local_input(
                PlayerHandle::new(0),
                PlayerInput::new(Frame::new(frame), TestInput::default()),
            );
            sync.advance_frame();
        }
        sync.set_last_confirmed_frame(Frame::new(4), true);
        assert_eq!(sync.last_confirmed_frame(), Frame::FIRST);
    }

    #[test]
    fn consistency_check_finds_earliest_misprediction() {
        let mut sync = SyncLayer::<TestConfig>::new(2, 8);
        let statuses = vec![ConnectionStatus::default(); 2];
        sync.add_remote_input(
            PlayerHandle::new(0),
            PlayerInput::new(Frame::new(0), TestInput { value: 1 }),
        );
        sync.add_remote_input(
            PlayerHandle::new(1),
            PlayerInput::new(Frame::new(0), TestInput { value: 1 }),
        );
        sync.advance_frame();
        // both players get predicted on frame 1
        sync.synchronized_inputs(&statuses);
        sync.add_remote_input(
            PlayerHandle::new(0),
            PlayerInput::new(Frame::new(1), TestInput { value: 2 }),
        );
        assert_eq!(sync.check_simulation_consistency(Frame::NULL), Frame::new(1));
        assert_eq!(sync.check_simulation_consistency(Frame::new(0)), Frame::new(0));
    }
}
