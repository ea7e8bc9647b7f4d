//! An offline session that verifies the determinism of the game
//! simulation by resimulating recent frames and comparing checksums.

use std::collections::BTreeMap;

use crate::frame_info::PlayerInput;
use crate::network::messages::ConnectionStatus;
use crate::sync_layer::SyncLayer;
use crate::{Config, Frame, FramelockError, FramelockRequest, PlayerHandle};

/// A [`SyncTestSession`] makes sure the game simulation is deterministic
/// and that saving and loading states works correctly.
///
/// Every [`advance_frame`](SyncTestSession::advance_frame) rolls back
/// `check_distance` frames and resimulates them. If the checksums saved for
/// a frame differ between the original simulation and the resimulation, a
/// [`MismatchedChecksum`](FramelockError::MismatchedChecksum) error is
/// returned. Run your game logic through a sync test before going online
/// with it.
pub struct SyncTestSession<T>
where
    T: Config,
{
    num_players: usize,
    max_prediction: usize,
    check_distance: usize,
    sync_layer: SyncLayer<T>,
    dummy_connect_status: Vec<ConnectionStatus>,
    checksum_history: BTreeMap<Frame, Option<u64>>,
    local_inputs: BTreeMap<PlayerHandle, PlayerInput<T::Input>>,
}

impl<T: Config> SyncTestSession<T> {
    pub(crate) fn new(
        num_players: usize,
        max_prediction: usize,
        check_distance: usize,
        input_delay: u32,
    ) -> Self {
        let mut sync_layer = SyncLayer::new(num_players, max_prediction);
        for i in 0..num_players {
            sync_layer.set_frame_delay(PlayerHandle::new(i), input_delay);
        }

        Self {
            num_players,
            max_prediction,
            check_distance,
            sync_layer,
            dummy_connect_status: vec![ConnectionStatus::default(); num_players],
            checksum_history: BTreeMap::new(),
            local_inputs: BTreeMap::new(),
        }
    }

    /// Registers the input for a player for the current frame. Call this
    /// for every player before
    /// [`advance_frame`](SyncTestSession::advance_frame).
    pub fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), FramelockError> {
        if player_handle.as_usize() >= self.num_players {
            return Err(FramelockError::InvalidRequest {
                info: format!("player handle {player_handle} is invalid"),
            });
        }
        self.local_inputs.insert(
            player_handle,
            PlayerInput::new(self.sync_layer.current_frame(), input),
        );
        Ok(())
    }

    /// Checks the recent frames for checksum consistency, then returns the
    /// requests to resimulate them followed by one new frame advance.
    pub fn advance_frame(&mut self) -> Result<Vec<FramelockRequest<T>>, FramelockError> {
        let mut requests = Vec::new();

        let current_frame = self.sync_layer.current_frame();
        if self.check_distance > 0 && current_frame > Frame::new(self.check_distance as i32) {
            let oldest_frame_to_check = current_frame - self.check_distance as i32;
            let mut mismatched_frames = Vec::new();
            for n in oldest_frame_to_check.as_i32()..=current_frame.as_i32() {
                if !self.checksums_consistent(Frame::new(n)) {
                    mismatched_frames.push(Frame::new(n));
                }
            }
            if !mismatched_frames.is_empty() {
                return Err(FramelockError::MismatchedChecksum {
                    current_frame,
                    mismatched_frames,
                });
            }

            self.adjust_game_state(current_frame - self.check_distance as i32, &mut requests);
        }

        if self.local_inputs.len() != self.num_players {
            return Err(FramelockError::InvalidRequest {
                info: "missing local input for at least one player".to_owned(),
            });
        }
        for (&handle, &input) in &self.local_inputs {
            self.sync_layer.add_local_input(handle, input);
        }
        self.local_inputs.clear();

        if self.check_distance > 0 {
            requests.push(self.sync_layer.save_current_state());
        }

        let inputs = self.sync_layer.synchronized_inputs(&self.dummy_connect_status);
        requests.push(FramelockRequest::AdvanceFrame { inputs });
        self.sync_layer.advance_frame();

        let safe_frame = self.sync_layer.current_frame() - self.check_distance as i32;
        self.sync_layer.set_last_confirmed_frame(safe_frame, false);

        for status in &mut self.dummy_connect_status {
            status.last_frame = self.sync_layer.current_frame();
        }
        Ok(requests)
    }

    /// The frame the session is currently at.
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// The number of players this session was constructed with.
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// The maximum prediction window.
    pub fn max_prediction(&self) -> usize {
        self.max_prediction
    }

    /// The number of frames that are resimulated and compared every tick.
    pub fn check_distance(&self) -> usize {
        self.check_distance
    }

    /// Compares the checksum saved for this frame against the history entry
    /// from the previous simulation of the same frame, recording it on
    /// first sight.
    fn checksums_consistent(&mut self, frame_to_check: Frame) -> bool {
        let oldest_allowed_frame = self.sync_layer.current_frame() - self.check_distance as i32;
        self.checksum_history
            .retain(|&frame, _| frame >= oldest_allowed_frame);

        let Ok(cell) = self.sync_layer.saved_state_by_frame(frame_to_check) else {
            // not saved (yet), nothing to compare against
            return true;
        };
        match self.checksum_history.get(&cell.frame()) {
            Some(&previous_checksum) => previous_checksum == cell.checksum(),
            None => {
                self.checksum_history.insert(cell.frame(), cell.checksum());
                true
            }
        }
    }

    fn adjust_game_state(&mut self, frame_to_load: Frame, requests: &mut Vec<FramelockRequest<T>>) {
        let start_frame = self.sync_layer.current_frame();
        let count = start_frame - frame_to_load;

        requests.push(self.sync_layer.load_frame(frame_to_load));
        self.sync_layer.reset_prediction();
        assert_eq!(self.sync_layer.current_frame(), frame_to_load);

        for i in 0..count {
            let inputs = self.sync_layer.synchronized_inputs(&self.dummy_connect_status);
            if i > 0 {
                requests.push(self.sync_layer.save_current_state());
            }
            self.sync_layer.advance_frame();
            requests.push(FramelockRequest::AdvanceFrame { inputs });
        }
        assert_eq!(self.sync_layer.current_frame(), start_frame);
    }
}
