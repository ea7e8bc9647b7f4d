//! A passive session that replays confirmed inputs broadcast by a host.

use std::collections::vec_deque::Drain;
use std::collections::VecDeque;

use crate::frame_info::PlayerInput;
use crate::network::messages::ConnectionStatus;
use crate::network::network_stats::NetworkStats;
use crate::network::protocol::{Event, UdpProtocol};
use crate::{
    Config, Frame, FramelockError, FramelockEvent, FramelockRequest, InputStatus, InputVec,
    NonBlockingSocket, PlayerHandle, SessionState, MAX_EVENT_QUEUE_SIZE,
};

/// Number of confirmed input frames the spectator buffers before the
/// oldest unconsumed one is overwritten.
pub(crate) const SPECTATOR_BUFFER_SIZE: usize = 128;

/// Frames advanced per tick when not catching up.
const NORMAL_SPEED: usize = 1;

/// A [`SpectatorSession`] connects to a single host session and replays the
/// confirmed inputs the host broadcasts, without contributing inputs of its
/// own. When it falls behind the host by more than `max_frames_behind`
/// frames, it advances `catchup_speed` frames per tick until it has caught
/// up.
pub struct SpectatorSession<T>
where
    T: Config,
{
    state: SessionState,
    num_players: usize,
    inputs: Vec<Vec<PlayerInput<T::Input>>>,
    host_connect_status: Vec<ConnectionStatus>,
    socket: Box<dyn NonBlockingSocket<T::Address>>,
    host: UdpProtocol<T>,
    event_queue: VecDeque<FramelockEvent<T>>,
    current_frame: Frame,
    last_recv_frame: Frame,
    max_frames_behind: usize,
    catchup_speed: usize,
}

impl<T: Config> SpectatorSession<T> {
    pub(crate) fn new(
        num_players: usize,
        socket: Box<dyn NonBlockingSocket<T::Address>>,
        mut host: UdpProtocol<T>,
        max_frames_behind: usize,
        catchup_speed: usize,
    ) -> Self {
        host.synchronize();
        Self {
            state: SessionState::Synchronizing,
            num_players,
            inputs: vec![
                vec![PlayerInput::blank_input(Frame::NULL); num_players];
                SPECTATOR_BUFFER_SIZE
            ],
            host_connect_status: vec![ConnectionStatus::default(); num_players],
            socket,
            host,
            event_queue: VecDeque::new(),
            current_frame: Frame::NULL,
            last_recv_frame: Frame::NULL,
            max_frames_behind,
            catchup_speed,
        }
    }

    /// The current [`SessionState`].
    pub fn current_state(&self) -> SessionState {
        self.state
    }

    /// The frame the spectator has advanced to.
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The number of players whose inputs the host broadcasts.
    pub fn num_players(&self) -> usize {
        self.num_players
    }

    /// The number of frames the spectator lags behind the newest input
    /// received from the host.
    pub fn frames_behind_host(&self) -> usize {
        (self.last_recv_frame - self.current_frame).max(0) as usize
    }

    /// Connection statistics towards the host.
    pub fn network_stats(&self) -> Result<NetworkStats, FramelockError> {
        self.host.network_stats()
    }

    /// Drains all buffered session events. Should be called every tick.
    pub fn events(&mut self) -> Drain<'_, FramelockEvent<T>> {
        self.event_queue.drain(..)
    }

    /// Processes host messages and returns the frame advances to execute
    /// this tick. Returns an empty list when the next input has not arrived
    /// yet.
    pub fn advance_frame(&mut self) -> Result<Vec<FramelockRequest<T>>, FramelockError> {
        self.poll_remote_clients();

        if self.state != SessionState::Running {
            return Err(FramelockError::NotSynchronized);
        }

        let frames_to_advance = if self.frames_behind_host() > self.max_frames_behind {
            self.catchup_speed
        } else {
            NORMAL_SPEED
        };

        let mut requests = Vec::with_capacity(frames_to_advance);
        for _ in 0..frames_to_advance {
            let frame_to_grab = self.current_frame + 1;
            match self.inputs_at_frame(frame_to_grab) {
                Ok(Some(inputs)) => {
                    requests.push(FramelockRequest::AdvanceFrame { inputs });
                    self.current_frame += 1;
                }
                // input not received yet, try again next tick
                Ok(None) => break,
                Err(err) => return Err(err),
            }
        }
        Ok(requests)
    }

    /// Receives and dispatches host messages and drives the endpoint
    /// timers. [`advance_frame`](SpectatorSession::advance_frame) calls
    /// this itself; call it additionally while not advancing to keep the
    /// connection alive.
    pub fn poll_remote_clients(&mut self) {
        for (from, msg) in self.socket.receive_all_messages() {
            if self.host.is_handling_message(&from) {
                self.host.handle_message(&msg);
            }
        }

        let mut events = VecDeque::new();
        let addr = self.host.peer_addr().clone();
        for event in self.host.poll(&self.host_connect_status) {
            events.push_back((event, addr.clone()));
        }
        for (event, addr) in events {
            self.handle_event(event, addr);
        }

        self.host.send_all_messages(self.socket.as_mut());
    }

    /// The confirmed inputs for `frame_to_grab`, `None` if they have not
    /// arrived yet and an error if the ring buffer already overwrote them.
    fn inputs_at_frame(
        &self,
        frame_to_grab: Frame,
    ) -> Result<Option<InputVec<T::Input>>, FramelockError> {
        assert!(frame_to_grab.is_valid());
        let player_inputs = &self.inputs[frame_to_grab.as_i32() as usize % SPECTATOR_BUFFER_SIZE];
        let stored_frame = player_inputs[0].frame;

        if stored_frame < frame_to_grab {
            return Ok(None);
        }
        // the host is more than a full buffer ahead, the input is gone
        if stored_frame > frame_to_grab {
            return Err(FramelockError::SpectatorTooFarBehind);
        }

        Ok(Some(
            player_inputs
                .iter()
                .zip(&self.host_connect_status)
                .map(|(player_input, status)| {
                    if status.disconnected && status.last_frame < frame_to_grab {
                        (player_input.input, InputStatus::Disconnected)
                    } else {
                        (player_input.input, InputStatus::Confirmed)
                    }
                })
                .collect(),
        ))
    }

    fn handle_event(&mut self, event: Event<T>, addr: T::Address) {
        match event {
            Event::Synchronizing { total, count } => {
                self.push_event(FramelockEvent::Synchronizing { addr, total, count });
            }
            Event::Synchronized => {
                self.state = SessionState::Running;
                self.push_event(FramelockEvent::Synchronized { addr });
            }
            Event::Disconnected => {
                self.push_event(FramelockEvent::Disconnected { addr });
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
            Event::Input { input, player } => {
                assert!(input.frame.is_valid());
                assert!(player.as_usize() < self.num_players);
                let frame_inputs =
                    &mut self.inputs[input.frame.as_i32() as usize % SPECTATOR_BUFFER_SIZE];
                frame_inputs[player.as_usize()] = input;

                if input.frame > self.last_recv_frame {
                    self.last_recv_frame = input.frame;
                }
                self.host.update_local_frame_advantage(input.frame);

                for (i, status) in self.host_connect_status.iter_mut().enumerate() {
                    *status = self.host.peer_connect_status(PlayerHandle::new(i));
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::Message;
    use crate::wire::{ByteReader, DecodeError, Serde};
    use crate::DesyncDetection;
    use std::time::Duration;

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

    struct NullSocket;

    impl NonBlockingSocket<usize> for NullSocket {
        fn send_to(&mut self, _msg: &Message, _addr: &usize) {}
        fn receive_all_messages(&mut self) -> Vec<(usize, Message)> {
            Vec::new()
        }
    }

    fn spectator() -> SpectatorSession<TestConfig> {
        let host = UdpProtocol::new(
            vec![PlayerHandle::new(0), PlayerHandle::new(1)],
            1,
            2,
            1,
            8,
            Duration::from_millis(2000),
            Duration::from_millis(500),
            60,
            DesyncDetection::Off,
        );
        SpectatorSession::new(2, Box::new(NullSocket), host, 10, 2)
    }

    fn feed_input(session: &mut SpectatorSession<TestConfig>, frame: i32, value: u16) {
        for player in 0..2 {
            session.handle_event(
                Event::Input {
                    input: PlayerInput::new(Frame::new(frame), TestInput { value }),
                    player: PlayerHandle::new(player),
                },
                1,
            );
        }
    }

    #[test]
    fn spectator_starts_synchronizing() {
        let mut session = spectator();
        assert_eq!(session.current_state(), SessionState::Synchronizing);
        assert!(matches!(
            session.advance_frame(),
            Err(FramelockError::NotSynchronized)
        ));
    }

    #[test]
    fn advances_one_frame_per_received_input() {
        let mut session = spectator();
        session.state = SessionState::Running;

        // nothing received yet
        assert!(session.advance_frame().unwrap().is_empty());

        feed_input(&mut session, 0, 11);
        let requests = session.advance_frame().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(matches!(
            requests.first(),
            Some(FramelockRequest::AdvanceFrame { inputs })
                if inputs.len() == 2 && inputs[0].0.value == 11
        ));
        assert_eq!(session.current_frame(), Frame::FIRST);

        // the next frame has not arrived
        assert!(session.advance_frame().unwrap().is_empty());
    }

    #[test]
    fn catches_up_when_far_behind() {
        let mut session = spectator();
        session.state = SessionState::Running;
        for frame in 0..20 {
            feed_input(&mut session, frame, frame as u16);
        }
        assert_eq!(session.frames_behind_host(), 20);

        // more than max_frames_behind, advance at catchup speed
        let requests = session.advance_frame().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(session.current_frame(), Frame::new(1));
    }

    #[test]
    fn overwritten_inputs_are_an_error() {
        let mut session = spectator();
        session.state = SessionState::Running;
        // a full buffer plus one wraps over frame 0 before it was consumed
        for frame in 0..=SPECTATOR_BUFFER_SIZE as i32 {
            feed_input(&mut session, frame, 0);
        }
        assert!(matches!(
            session.advance_frame(),
            Err(FramelockError::SpectatorTooFarBehind)
        ));
    }
}
