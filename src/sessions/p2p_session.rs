//! The peer-to-peer rollback session.

use std::collections::vec_deque::Drain;
use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, trace, warn};

use crate::frame_info::PlayerInput;
use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{Event, UdpProtocol};
use crate::sync_layer::SyncLayer;
use crate::{
    Config, DesyncDetection, Frame, FramelockError, FramelockEvent, FramelockRequest,
    NonBlockingSocket, PlayerHandle, PlayerType, SessionState, MAX_EVENT_QUEUE_SIZE,
};

/// If the client is ahead by this many frames or more, a wait is
/// recommended.
const MIN_RECOMMENDATION: i32 = 3;
/// Minimum number of frames between two wait recommendations.
const RECOMMENDATION_INTERVAL: i32 = 60;

/// Remote checksums we could not compare yet; bounded like the protocol's
/// history.
const MAX_CHECKSUM_HISTORY_SIZE: usize = 32;

/// Maps player handles to their kind and endpoint. Iteration order is
/// deterministic, which keeps request and message ordering reproducible.
pub(crate) struct PlayerRegistry<T>
where
    T: Config,
{
    pub(crate) handles: BTreeMap<PlayerHandle, PlayerType<T::Address>>,
    pub(crate) remotes: BTreeMap<T::Address, UdpProtocol<T>>,
    pub(crate) spectators: BTreeMap<T::Address, UdpProtocol<T>>,
}

impl<T: Config> PlayerRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            handles: BTreeMap::new(),
            remotes: BTreeMap::new(),
            spectators: BTreeMap::new(),
        }
    }

    pub(crate) fn is_local(&self, handle: PlayerHandle) -> bool {
        matches!(self.handles.get(&handle), Some(PlayerType::Local))
    }

    pub(crate) fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter(|(_, kind)| matches!(kind, PlayerType::Local))
            .map(|(&handle, _)| handle)
            .collect()
    }

    pub(crate) fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter(|(_, kind)| matches!(kind, PlayerType::Remote(_)))
            .map(|(&handle, _)| handle)
            .collect()
    }

    pub(crate) fn spectator_handles(&self) -> Vec<PlayerHandle> {
        self.handles
            .iter()
            .filter(|(_, kind)| matches!(kind, PlayerType::Spectator(_)))
            .map(|(&handle, _)| handle)
            .collect()
    }

    pub(crate) fn num_players(&self) -> usize {
        self.handles
            .values()
            .filter(|kind| matches!(kind, PlayerType::Local | PlayerType::Remote(_)))
            .count()
    }

    pub(crate) fn num_spectators(&self) -> usize {
        self.handles
            .values()
            .filter(|kind| matches!(kind, PlayerType::Spectator(_)))
            .count()
    }
}

/// A [`P2PSession`] provides all functionality to connect to remote clients
/// in a peer-to-peer fashion, exchange inputs and handle the rollbacks
/// resulting from mispredicted ones.
///
/// Create one through a [`SessionBuilder`](crate::SessionBuilder), then
/// call [`advance_frame`](P2PSession::advance_frame) exactly once per game
/// tick and fulfill the returned requests in order.
pub struct P2PSession<T>
where
    T: Config,
{
    num_players: usize,
    max_prediction: usize,
    sync_layer: SyncLayer<T>,
    sparse_saving: bool,
    disconnect_frame: Frame,
    state: SessionState,
    socket: Box<dyn NonBlockingSocket<T::Address>>,
    player_registry: PlayerRegistry<T>,
    local_connect_status: Vec<ConnectionStatus>,
    next_spectator_frame: Frame,
    next_recommended_sleep: Frame,
    frames_ahead: i32,
    event_queue: VecDeque<FramelockEvent<T>>,
    local_inputs: BTreeMap<PlayerHandle, PlayerInput<T::Input>>,
    desync_detection: DesyncDetection,
    local_checksum_history: BTreeMap<Frame, u64>,
    last_sent_checksum_frame: Frame,
}

impl<T: Config> P2PSession<T> {
    pub(crate) fn new(
        num_players: usize,
        max_prediction: usize,
        socket: Box<dyn NonBlockingSocket<T::Address>>,
        mut players: PlayerRegistry<T>,
        sparse_saving: bool,
        desync_detection: DesyncDetection,
        input_delay: u32,
    ) -> Self {
        let local_connect_status = vec![ConnectionStatus::default(); num_players];
        for endpoint in players
            .remotes
            .values_mut()
            .chain(players.spectators.values_mut())
        {
            endpoint.synchronize();
        }

        let mut sync_layer = SyncLayer::new(num_players, max_prediction);
        for (&handle, kind) in &players.handles {
            if matches!(kind, PlayerType::Local) {
                sync_layer.set_frame_delay(handle, input_delay);
            }
        }

        let state = if players.remotes.is_empty() && players.spectators.is_empty() {
            SessionState::Running
        } else {
            SessionState::Synchronizing
        };

        // in lockstep mode there is no prediction window to save sparsely in
        let sparse_saving = if max_prediction == 0 { false } else { sparse_saving };

        Self {
            num_players,
            max_prediction,
            sync_layer,
            sparse_saving,
            disconnect_frame: Frame::NULL,
            state,
            socket,
            player_registry: players,
            local_connect_status,
            next_spectator_frame: Frame::FIRST,
            next_recommended_sleep: Frame::FIRST,
            frames_ahead: 0,
            event_queue: VecDeque::new(),
            local_inputs: BTreeMap::new(),
            desync_detection,
            local_checksum_history: BTreeMap::new(),
            last_sent_checksum_frame: Frame::NULL,
        }
    }

    /// Registers the local input for a player for the current frame. Call
    /// this for every local player before
    /// [`advance_frame`](P2PSession::advance_frame).
    pub fn add_local_input(
        &mut self,
        player_handle: PlayerHandle,
        input: T::Input,
    ) -> Result<(), FramelockError> {
        if !self.player_registry.is_local(player_handle) {
            return Err(FramelockError::InvalidRequest {
                info: format!("player handle {player_handle} is not a local player handle"),
            });
        }
        self.local_inputs.insert(
            player_handle,
            PlayerInput::new(self.sync_layer.current_frame(), input),
        );
        Ok(())
    }

    /// Processes incoming packets, transmits local inputs and returns the
    /// requests to fulfill for this tick: saves, loads and resimulation as
    /// rollbacks demand, and at most one new frame advance.
    pub fn advance_frame(&mut self) -> Result<Vec<FramelockRequest<T>>, FramelockError> {
        self.poll_remote_clients();

        if self.state != SessionState::Running {
            return Err(FramelockError::NotSynchronized);
        }
        for handle in self.player_registry.local_player_handles() {
            if !self.local_inputs.contains_key(&handle) {
                return Err(FramelockError::InvalidRequest {
                    info: format!("missing local input for player handle {handle}"),
                });
            }
        }

        if matches!(self.desync_detection, DesyncDetection::On { .. }) {
            self.check_checksum_send_interval();
            self.compare_local_checksums_against_peers();
        }

        let mut requests = Vec::new();
        let lockstep = self.in_lockstep_mode();

        if self.sync_layer.current_frame() == Frame::FIRST && !lockstep {
            trace!("saving state of first frame");
            requests.push(self.sync_layer.save_current_state());
        }

        self.update_player_disconnects();

        let confirmed_frame = self.confirmed_frame();
        if !lockstep {
            let first_incorrect = self.sync_layer.check_simulation_consistency(self.disconnect_frame);
            if first_incorrect.is_valid() {
                // a disconnect at exactly the current frame leaves nothing
                // to resimulate
                if first_incorrect < self.sync_layer.current_frame() {
                    self.adjust_game_state(first_incorrect, confirmed_frame, &mut requests);
                }
                self.disconnect_frame = Frame::NULL;
            }

            let last_saved = self.sync_layer.last_saved_frame();
            if self.sparse_saving {
                self.check_last_saved_state(last_saved, confirmed_frame, &mut requests);
            } else {
                requests.push(self.sync_layer.save_current_state());
            }
        }

        self.send_confirmed_inputs_to_spectators(confirmed_frame)?;
        self.sync_layer
            .set_last_confirmed_frame(confirmed_frame, self.sparse_saving);

        self.check_wait_recommendation();

        for handle in self.player_registry.local_player_handles() {
            let mut player_input = self.local_inputs[&handle];
            let actual_frame = self.sync_layer.add_local_input(handle, player_input);
            player_input.frame = actual_frame;
            self.local_inputs.insert(handle, player_input);
            if actual_frame.is_valid() {
                self.local_connect_status[handle.as_usize()].last_frame = actual_frame;
            }
        }

        if !self.local_inputs.values().any(|input| input.frame.is_null()) {
            for endpoint in self.player_registry.remotes.values_mut() {
                endpoint.send_input(&self.local_inputs, &self.local_connect_status);
                endpoint.send_all_messages(self.socket.as_mut());
            }
        }

        let can_advance = if lockstep {
            self.sync_layer.last_confirmed_frame() == self.sync_layer.current_frame()
        } else {
            let frames_ahead = if self.sync_layer.last_confirmed_frame().is_null() {
                self.sync_layer.current_frame().as_i32()
            } else {
                self.sync_layer.current_frame() - self.sync_layer.last_confirmed_frame()
            };
            frames_ahead < self.max_prediction as i32
        };

        if can_advance {
            let inputs = self.sync_layer.synchronized_inputs(&self.local_connect_status);
            self.sync_layer.advance_frame();
            self.local_inputs.clear();
            requests.push(FramelockRequest::AdvanceFrame { inputs });
        } else {
            debug!(
                frame = %self.sync_layer.current_frame(),
                "prediction threshold reached, not advancing"
            );
        }

        Ok(requests)
    }

    /// Receives and dispatches messages from all remote clients and drives
    /// all endpoint timers. [`advance_frame`](P2PSession::advance_frame)
    /// calls this itself; call it additionally whenever you are not
    /// advancing, e.g. while synchronizing or paused, to keep connections
    /// alive.
    pub fn poll_remote_clients(&mut self) {
        for (addr, msg) in self.socket.receive_all_messages() {
            if let Some(endpoint) = self.player_registry.remotes.get_mut(&addr) {
                endpoint.handle_message(&msg);
            }
            if let Some(endpoint) = self.player_registry.spectators.get_mut(&addr) {
                endpoint.handle_message(&msg);
            }
        }

        let current_frame = self.sync_layer.current_frame();
        for endpoint in self.player_registry.remotes.values_mut() {
            if endpoint.is_running() {
                endpoint.update_local_frame_advantage(current_frame);
            }
        }

        let mut events = VecDeque::new();
        for endpoint in self
            .player_registry
            .remotes
            .values_mut()
            .chain(self.player_registry.spectators.values_mut())
        {
            let handles = endpoint.handles().to_vec();
            let addr = endpoint.peer_addr().clone();
            for event in endpoint.poll(&self.local_connect_status) {
                events.push_back((event, handles.clone(), addr.clone()));
            }
        }

        for (event, handles, addr) in events {
            self.handle_event(event, &handles, addr);
        }

        for endpoint in self
            .player_registry
            .remotes
            .values_mut()
            .chain(self.player_registry.spectators.values_mut())
        {
            endpoint.send_all_messages(self.socket.as_mut());
        }
    }

    /// Disconnects a remote player or spectator from the session.
    pub fn disconnect_player(&mut self, player_handle: PlayerHandle) -> Result<(), FramelockError> {
        match self.player_registry.handles.get(&player_handle) {
            None => Err(FramelockError::InvalidRequest {
                info: format!("invalid player handle {player_handle}"),
            }),
            Some(PlayerType::Local) => Err(FramelockError::InvalidRequest {
                info: "local players cannot be disconnected".to_owned(),
            }),
            Some(PlayerType::Remote(_)) => {
                if self.local_connect_status[player_handle.as_usize()].disconnected {
                    return Err(FramelockError::InvalidRequest {
                        info: format!("player {player_handle} is already disconnected"),
                    });
                }
                let last_frame = self.local_connect_status[player_handle.as_usize()].last_frame;
                self.disconnect_player_at_frame(player_handle, last_frame);
                Ok(())
            }
            Some(PlayerType::Spectator(_)) => {
                self.disconnect_player_at_frame(player_handle, Frame::NULL);
                Ok(())
            }
        }
    }

    /// Connection statistics towards the endpoint behind the given remote
    /// player or spectator handle.
    pub fn network_stats(&self, player_handle: PlayerHandle) -> Result<NetworkStats, FramelockError> {
        match self.player_registry.handles.get(&player_handle) {
            Some(PlayerType::Remote(addr)) => self
                .player_registry
                .remotes
                .get(addr)
                .ok_or(FramelockError::NotSynchronized)?
                .network_stats(),
            Some(PlayerType::Spectator(addr)) => self
                .player_registry
                .spectators
                .get(addr)
                .ok_or(FramelockError::NotSynchronized)?
                .network_stats(),
            Some(PlayerType::Local) => Err(FramelockError::InvalidRequest {
                info: "there are no network stats for local players".to_owned(),
            }),
            None => Err(FramelockError::InvalidRequest {
                info: format!("invalid player handle {player_handle}"),
            }),
        }
    }

    /// Drains all buffered session events. Should be called every tick.
    pub fn events(&mut self) -> Drain<'_, FramelockEvent<T>> {
        self.event_queue.drain(..)
    }

    /// The frame the session is currently at.
    pub fn current_frame(&self) -> Frame {
        self.sync_layer.current_frame()
    }

    /// The highest frame confirmed by all connected players.
    pub fn confirmed_frame(&self) -> Frame {
        let mut confirmed_frame = Frame::MAX;
        for status in &self.local_connect_status {
            if !status.disconnected {
                confirmed_frame = confirmed_frame.min(status.last_frame);
            }
        }
        assert!(
            confirmed_frame < Frame::MAX,
            "all players are disconnected"
        );
        confirmed_frame
    }

    /// The maximum number of frames the session speculates ahead of
    /// confirmed inputs. A value of 0 means lockstep.
    pub fn max_prediction(&self) -> usize {
        self.max_prediction
    }

    /// Whether the session runs in lockstep mode, never predicting.
    pub fn in_lockstep_mode(&self) -> bool {
        self.max_prediction == 0
    }

    /// The current [`SessionState`].
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// How many frames the session is currently ahead of the slowest
    /// remote, as of the last advance.
    pub fn frames_ahead(&self) -> i32 {
        self.frames_ahead
    }

    /// The configured desync detection mode.
    pub fn desync_detection(&self) -> DesyncDetection {
        self.desync_detection
    }

    /// The number of players (local and remote, without spectators).
    pub fn num_players(&self) -> usize {
        self.player_registry.num_players()
    }

    /// The number of spectators.
    pub fn num_spectators(&self) -> usize {
        self.player_registry.num_spectators()
    }

    /// All local player handles in this session.
    pub fn local_player_handles(&self) -> Vec<PlayerHandle> {
        self.player_registry.local_player_handles()
    }

    /// All remote player handles in this session.
    pub fn remote_player_handles(&self) -> Vec<PlayerHandle> {
        self.player_registry.remote_player_handles()
    }

    /// All spectator handles in this session.
    pub fn spectator_handles(&self) -> Vec<PlayerHandle> {
        self.player_registry.spectator_handles()
    }

    fn disconnect_player_at_frame(&mut self, player_handle: PlayerHandle, last_frame: Frame) {
        match self.player_registry.handles.get(&player_handle).cloned() {
            Some(PlayerType::Remote(addr)) => {
                if let Some(endpoint) = self.player_registry.remotes.get_mut(&addr) {
                    for handle in endpoint.handles().to_vec() {
                        self.local_connect_status[handle.as_usize()].disconnected = true;
                    }
                    endpoint.disconnect();
                }
                if self.sync_layer.current_frame() > last_frame {
                    self.disconnect_frame = last_frame + 1;
                }
            }
            Some(PlayerType::Spectator(addr)) => {
                if let Some(endpoint) = self.player_registry.spectators.get_mut(&addr) {
                    endpoint.disconnect();
                }
            }
            Some(PlayerType::Local) | None => (),
        }
        self.check_initial_sync();
    }

    fn check_initial_sync(&mut self) {
        if self.state != SessionState::Synchronizing {
            return;
        }
        let all_synchronized = self
            .player_registry
            .remotes
            .values()
            .chain(self.player_registry.spectators.values())
            .all(UdpProtocol::is_synchronized);
        if all_synchronized {
            self.state = SessionState::Running;
        }
    }

    /// Rolls back to before the first incorrect frame and resimulates up to
    /// the previous current frame, emitting the necessary load, save and
    /// advance requests.
    fn adjust_game_state(
        &mut self,
        first_incorrect: Frame,
        min_confirmed: Frame,
        requests: &mut Vec<FramelockRequest<T>>,
    ) {
        let current_frame = self.sync_layer.current_frame();
        let frame_to_load = if self.sparse_saving {
            self.sync_layer.last_saved_frame()
        } else {
            first_incorrect
        };

        assert!(frame_to_load <= first_incorrect);
        let count = current_frame - frame_to_load;

        requests.push(self.sync_layer.load_frame(frame_to_load));
        assert_eq!(self.sync_layer.current_frame(), frame_to_load);
        self.sync_layer.reset_prediction();

        for i in 0..count {
            let inputs = self.sync_layer.synchronized_inputs(&self.local_connect_status);
            if self.sparse_saving {
                if self.sync_layer.current_frame() == min_confirmed {
                    requests.push(self.sync_layer.save_current_state());
                }
            } else if i > 0 {
                requests.push(self.sync_layer.save_current_state());
            }

            self.sync_layer.advance_frame();
            requests.push(FramelockRequest::AdvanceFrame { inputs });
        }
        assert_eq!(self.sync_layer.current_frame(), current_frame);
    }

    fn send_confirmed_inputs_to_spectators(
        &mut self,
        confirmed_frame: Frame,
    ) -> Result<(), FramelockError> {
        if self.player_registry.num_spectators() == 0 {
            return Ok(());
        }
        while self.next_spectator_frame <= confirmed_frame {
            let inputs = self
                .sync_layer
                .confirmed_inputs(self.next_spectator_frame, &self.local_connect_status)?;
            assert_eq!(inputs.len(), self.num_players);

            let mut input_map = BTreeMap::new();
            for (i, input) in inputs.into_iter().enumerate() {
                assert!(input.frame.is_null() || input.frame == self.next_spectator_frame);
                input_map.insert(PlayerHandle::new(i), input);
            }

            for endpoint in self.player_registry.spectators.values_mut() {
                if endpoint.is_running() {
                    endpoint.send_input(&input_map, &self.local_connect_status);
                }
            }
            self.next_spectator_frame += 1;
        }
        Ok(())
    }

    /// Folds every running endpoint's view of each player's connection into
    /// the local status, disconnecting players everyone else has given up
    /// on.
    fn update_player_disconnects(&mut self) {
        let mut to_disconnect = Vec::new();
        for i in 0..self.num_players {
            let handle = PlayerHandle::new(i);
            let mut queue_connected = true;
            let mut queue_min_confirmed = Frame::MAX;

            for endpoint in self.player_registry.remotes.values() {
                if !endpoint.is_running() {
                    continue;
                }
                let con_status = endpoint.peer_connect_status(handle);
                queue_connected = queue_connected && !con_status.disconnected;
                queue_min_confirmed = queue_min_confirmed.min(con_status.last_frame);
            }

            let local_connected = !self.local_connect_status[i].disconnected;
            let local_min_confirmed = self.local_connect_status[i].last_frame;
            if local_connected {
                queue_min_confirmed = queue_min_confirmed.min(local_min_confirmed);
            }

            if !queue_connected && (local_connected || local_min_confirmed > queue_min_confirmed) {
                to_disconnect.push((handle, queue_min_confirmed));
            }
        }
        for (handle, frame) in to_disconnect {
            self.disconnect_player_at_frame(handle, frame);
        }
    }

    fn max_frame_advantage(&self) -> i32 {
        let mut interval = i32::MIN;
        for endpoint in self.player_registry.remotes.values() {
            for handle in endpoint.handles() {
                if !self.local_connect_status[handle.as_usize()].disconnected {
                    interval = interval.max(endpoint.average_frame_advantage());
                }
            }
        }
        if interval == i32::MIN {
            0
        } else {
            interval
        }
    }

    fn check_wait_recommendation(&mut self) {
        self.frames_ahead = self.max_frame_advantage();
        if self.sync_layer.current_frame() > self.next_recommended_sleep
            && self.frames_ahead >= MIN_RECOMMENDATION
        {
            self.next_recommended_sleep = self.sync_layer.current_frame() + RECOMMENDATION_INTERVAL;
            self.push_event(FramelockEvent::WaitRecommendation {
                skip_frames: self.frames_ahead as u32,
            });
        }
    }

    fn check_last_saved_state(
        &mut self,
        last_saved: Frame,
        confirmed_frame: Frame,
        requests: &mut Vec<FramelockRequest<T>>,
    ) {
        if self.sync_layer.current_frame() - last_saved >= self.max_prediction as i32 {
            if confirmed_frame >= self.sync_layer.current_frame() {
                requests.push(self.sync_layer.save_current_state());
            } else {
                self.adjust_game_state(last_saved, confirmed_frame, requests);
            }
            assert!(
                confirmed_frame.is_null()
                    || self.sync_layer.last_saved_frame()
                        == confirmed_frame.min(self.sync_layer.current_frame())
            );
        }
    }

    fn handle_event(&mut self, event: Event<T>, player_handles: &[PlayerHandle], addr: T::Address) {
        match event {
            Event::Synchronizing { total, count } => {
                self.push_event(FramelockEvent::Synchronizing { addr, total, count });
            }
            Event::NetworkInterrupted { disconnect_timeout } => {
                self.push_event(FramelockEvent::NetworkInterrupted {
                    addr,
                    disconnect_timeout,
                });
            }
            Event::NetworkResumed => {
                self.push_event(FramelockEvent::NetworkResumed { addr });
            }
            Event::Synchronized => {
                self.check_initial_sync();
                self.push_event(FramelockEvent::Synchronized { addr });
            }
            Event::Disconnected => {
                for &handle in player_handles {
                    let last_frame = if handle.as_usize() < self.num_players {
                        self.local_connect_status[handle.as_usize()].last_frame
                    } else {
                        Frame::NULL
                    };
                    self.disconnect_player_at_frame(handle, last_frame);
                }
                self.push_event(FramelockEvent::Disconnected { addr });
            }
            Event::Input { input, player } => {
                assert!(player.as_usize() < self.num_players);
                let status = &mut self.local_connect_status[player.as_usize()];
                if !status.disconnected {
                    let current_remote_frame = status.last_frame;
                    assert!(
                        current_remote_frame.is_null()
                            || current_remote_frame + 1 == input.frame
                    );
                    status.last_frame = input.frame;
                    self.sync_layer.add_remote_input(player, input);
                }
            }
        }
    }

    fn push_event(&mut self, event: FramelockEvent<T>) {
        self.event_queue.push_back(event);
        while self.event_queue.len() > MAX_EVENT_QUEUE_SIZE {
            self.event_queue.pop_front();
        }
    }

    fn compare_local_checksums_against_peers(&mut self) {
        let last_confirmed = self.sync_layer.last_confirmed_frame();
        let history = &self.local_checksum_history;
        let mut desyncs = Vec::new();

        for endpoint in self.player_registry.remotes.values_mut() {
            let addr = endpoint.peer_addr().clone();
            endpoint.pending_checksums().retain(|&remote_frame, remote_checksum| {
                if remote_frame >= last_confirmed {
                    return true;
                }
                let Some(&local_checksum) = history.get(&remote_frame) else {
                    return true;
                };
                if local_checksum != *remote_checksum {
                    desyncs.push((remote_frame, local_checksum, *remote_checksum, addr.clone()));
                }
                false
            });
        }

        for (frame, local_checksum, remote_checksum, addr) in desyncs {
            self.push_event(FramelockEvent::DesyncDetected {
                frame,
                local_checksum,
                remote_checksum,
                addr,
            });
        }
    }

    fn check_checksum_send_interval(&mut self) {
        let DesyncDetection::On { interval } = self.desync_detection else {
            return;
        };
        let frame_to_send = if self.last_sent_checksum_frame.is_null() {
            Frame::new(interval as i32)
        } else {
            self.last_sent_checksum_frame + interval as i32
        };

        if frame_to_send > self.sync_layer.last_confirmed_frame()
            || frame_to_send > self.sync_layer.last_saved_frame()
        {
            return;
        }

        match self.sync_layer.saved_state_by_frame(frame_to_send) {
            Ok(cell) => {
                if let Some(checksum) = cell.checksum() {
                    for endpoint in self.player_registry.remotes.values_mut() {
                        endpoint.send_checksum_report(frame_to_send, checksum);
                    }
                    self.last_sent_checksum_frame = frame_to_send;
                    self.local_checksum_history.insert(frame_to_send, checksum);
                }
            }
            Err(_) => {
                // the slot was already overwritten; skip this report rather
                // than stalling checksum exchange forever
                warn!(frame = %frame_to_send, "saved state for checksum report no longer available");
                self.last_sent_checksum_frame = frame_to_send;
            }
        }

        if self.local_checksum_history.len() > MAX_CHECKSUM_HISTORY_SIZE {
            let oldest_frame_to_keep =
                frame_to_send - (MAX_CHECKSUM_HISTORY_SIZE as i32 - 1) * interval as i32;
            self.local_checksum_history
                .retain(|&frame, _| frame >= oldest_frame_to_keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::Message;
    use crate::wire::{ByteReader, DecodeError, Serde};

    #[derive(Copy, Clone, PartialEq, Default, Debug)]
    struct TestInput {
        value: u16,
    }

    impl Serde for TestInput {
        fn serde_size(&self) -> usize {
            2
        }
        fn serialize(&self, out: &mut Vec<u8>) {
            self.value.serialize(out);
        }
        fn deserialize(r: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
            Ok(Self { value: r.read_u16()? })
        }
    }

    struct TestConfig;

    impl Config for TestConfig {
        type Input = TestInput;
        type State = u32;
        type Address = usize;
    }

    /// A socket connected to nothing.
    struct NullSocket;

    impl NonBlockingSocket<usize> for NullSocket {
        fn send_to(&mut self, _msg: &Message, _addr: &usize) {}
        fn receive_all_messages(&mut self) -> Vec<(usize, Message)> {
            Vec::new()
        }
    }

    fn local_only_session(max_prediction: usize) -> P2PSession<TestConfig> {
        let mut registry = PlayerRegistry::new();
        registry.handles.insert(PlayerHandle::new(0), PlayerType::Local);
        P2PSession::new(
            1,
            max_prediction,
            Box::new(NullSocket),
            registry,
            false,
            DesyncDetection::Off,
            0,
        )
    }

    fn session_with_remote() -> P2PSession<TestConfig> {
        let mut registry = PlayerRegistry::new();
        registry.handles.insert(PlayerHandle::new(0), PlayerType::Local);
        registry
            .handles
            .insert(PlayerHandle::new(1), PlayerType::Remote(9));
        registry.remotes.insert(
            9,
            UdpProtocol::new(
                vec![PlayerHandle::new(1)],
                9,
                2,
                1,
                8,
                std::time::Duration::from_millis(2000),
                std::time::Duration::from_millis(500),
                60,
                DesyncDetection::Off,
            ),
        );
        P2PSession::new(
            2,
            8,
            Box::new(NullSocket),
            registry,
            false,
            DesyncDetection::Off,
            0,
        )
    }

    #[test]
    fn local_only_session_starts_running() {
        let session = local_only_session(8);
        assert_eq!(session.current_state(), SessionState::Running);
        assert_eq!(session.num_players(), 1);
        assert_eq!(session.local_player_handles(), vec![PlayerHandle::new(0)]);
        assert!(session.remote_player_handles().is_empty());
    }

    #[test]
    fn session_with_remote_starts_synchronizing() {
        let mut session = session_with_remote();
        assert_eq!(session.current_state(), SessionState::Synchronizing);
        assert!(matches!(
            session.advance_frame(),
            Err(FramelockError::NotSynchronized)
        ));
    }

    #[test]
    fn input_for_unknown_or_remote_handle_is_rejected() {
        let mut session = session_with_remote();
        let result = session.add_local_input(PlayerHandle::new(1), TestInput { value: 1 });
        assert!(matches!(result, Err(FramelockError::InvalidRequest { .. })));
        let result = session.add_local_input(PlayerHandle::new(7), TestInput { value: 1 });
        assert!(matches!(result, Err(FramelockError::InvalidRequest { .. })));
    }

    #[test]
    fn advancing_without_local_input_is_rejected() {
        let mut session = local_only_session(8);
        assert!(matches!(
            session.advance_frame(),
            Err(FramelockError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn first_advance_saves_then_advances() {
        let mut session = local_only_session(8);
        session
            .add_local_input(PlayerHandle::new(0), TestInput { value: 3 })
            .unwrap();
        let requests = session.advance_frame().unwrap();
        assert!(matches!(
            requests.first(),
            Some(FramelockRequest::SaveGameState { frame, .. }) if *frame == Frame::FIRST
        ));
        assert!(matches!(
            requests.last(),
            Some(FramelockRequest::AdvanceFrame { .. })
        ));
        assert_eq!(session.current_frame(), Frame::new(1));
    }

    #[test]
    fn local_only_session_keeps_advancing() {
        let mut session = local_only_session(8);
        for frame in 0..20 {
            assert_eq!(session.current_frame(), Frame::new(frame));
            session
                .add_local_input(PlayerHandle::new(0), TestInput { value: frame as u16 })
                .unwrap();
            let requests = session.advance_frame().unwrap();
            assert!(matches!(
                requests.last(),
                Some(FramelockRequest::AdvanceFrame { .. })
            ));
        }
        assert_eq!(session.current_frame(), Frame::new(20));
    }

    #[test]
    fn lockstep_waits_for_confirmation_before_advancing() {
        let mut session = local_only_session(0);
        assert!(session.in_lockstep_mode());
        session
            .add_local_input(PlayerHandle::new(0), TestInput { value: 1 })
            .unwrap();
        // the confirmed frame is computed before this tick's input lands, so
        // the very first tick cannot advance yet
        let requests = session.advance_frame().unwrap();
        assert!(requests.is_empty());
        assert_eq!(session.current_frame(), Frame::FIRST);

        session
            .add_local_input(PlayerHandle::new(0), TestInput { value: 1 })
            .unwrap();
        let requests = session.advance_frame().unwrap();
        assert!(matches!(
            requests.last(),
            Some(FramelockRequest::AdvanceFrame { .. })
        ));
        assert_eq!(session.current_frame(), Frame::new(1));
    }

    #[test]
    fn local_players_cannot_be_disconnected() {
        let mut session = local_only_session(8);
        assert!(matches!(
            session.disconnect_player(PlayerHandle::new(0)),
            Err(FramelockError::InvalidRequest { .. })
        ));
        assert!(matches!(
            session.disconnect_player(PlayerHandle::new(4)),
            Err(FramelockError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn disconnecting_a_remote_twice_is_rejected() {
        let mut session = session_with_remote();
        session.disconnect_player(PlayerHandle::new(1)).unwrap();
        assert!(matches!(
            session.disconnect_player(PlayerHandle::new(1)),
            Err(FramelockError::InvalidRequest { .. })
        ));
        // the only other endpoint is gone, so the session finishes its
        // initial sync
        assert_eq!(session.current_state(), SessionState::Running);
    }

    #[test]
    fn network_stats_for_local_players_are_rejected() {
        let session = session_with_remote();
        assert!(matches!(
            session.network_stats(PlayerHandle::new(0)),
            Err(FramelockError::InvalidRequest { .. })
        ));
        // the remote has not completed its handshake yet
        assert!(matches!(
            session.network_stats(PlayerHandle::new(1)),
            Err(FramelockError::NotSynchronized)
        ));
    }
}
